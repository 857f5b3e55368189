//! Runtime values of the in-process interpreter

use super::format::float_repr;
use super::meter::Charge;
use crate::environment::{exception_base, Primitive};
use crate::lang::ast::{FunctionDef, LambdaDef, Parameters};
use std::cell::{Ref, RefCell, RefMut};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::Arc;

pub type Eval<T> = Result<T, Exception>;

/// Size of one value slot, the unit of container accounting
pub(crate) const SLOT: usize = std::mem::size_of::<Value>();
const HEADER: usize = 48;

/// A raised guest exception
#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    pub kind: &'static str,
    pub message: String,
    pub line: Option<usize>,
    /// Cannot be caught by guest handlers
    pub(crate) fatal: bool,
}

impl Exception {
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
            fatal: false,
        }
    }

    pub(crate) fn memory() -> Self {
        Self {
            fatal: true,
            ..Self::new("MemoryError", "memory limit of the sandbox exceeded")
        }
    }

    pub(crate) fn interrupted() -> Self {
        Self {
            fatal: true,
            ..Self::new("KeyboardInterrupt", "execution interrupted")
        }
    }

    pub(crate) fn at_line(mut self, line: usize) -> Self {
        self.line.get_or_insert(line);
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// Whether this exception matches an `except kind` clause
    pub fn is_instance_of(&self, kind: &str) -> bool {
        is_subtype(self.kind, kind)
    }

    /// `Kind: message`
    pub fn render(&self) -> String {
        if self.message.is_empty() {
            self.kind.to_string()
        } else {
            format!("{}: {}", self.kind, self.message)
        }
    }
}

pub(crate) fn is_subtype(kind: &str, ancestor: &str) -> bool {
    let mut current = Some(kind);
    while let Some(name) = current {
        if name == ancestor {
            return true;
        }
        current = exception_base(name);
    }
    false
}

pub(crate) fn type_error(message: impl Into<String>) -> Exception {
    Exception::new("TypeError", message)
}

pub(crate) fn value_error(message: impl Into<String>) -> Exception {
    Exception::new("ValueError", message)
}

pub(crate) fn index_error(message: impl Into<String>) -> Exception {
    Exception::new("IndexError", message)
}

pub(crate) fn overflow_error() -> Exception {
    Exception::new("OverflowError", "integer result out of range")
}

pub(crate) fn zero_division(message: &str) -> Exception {
    Exception::new("ZeroDivisionError", message)
}

#[derive(Debug)]
pub struct StrObj {
    text: String,
    _charge: Charge,
}

impl StrObj {
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

#[derive(Debug)]
pub struct ListObj {
    items: RefCell<Vec<Value>>,
    charge: Charge,
}

impl ListObj {
    pub fn borrow(&self) -> Ref<'_, Vec<Value>> {
        self.items.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Vec<Value>> {
        self.items.borrow_mut()
    }

    /// Re-account after a mutation
    pub fn recharge(&self) -> Eval<()> {
        let len = self.items.borrow().len();
        self.charge.resize(HEADER + len * SLOT)
    }
}

impl Drop for ListObj {
    fn drop(&mut self) {
        drain_nested(std::mem::take(self.items.get_mut()));
    }
}

#[derive(Debug)]
pub struct TupleObj {
    items: Vec<Value>,
    _charge: Charge,
}

impl TupleObj {
    pub fn items(&self) -> &[Value] {
        &self.items
    }
}

impl Drop for TupleObj {
    fn drop(&mut self) {
        drain_nested(std::mem::take(&mut self.items));
    }
}

/// Dict and set storage
#[derive(Debug)]
pub struct DictObj {
    table: RefCell<Table>,
    charge: Charge,
}

impl DictObj {
    pub fn borrow(&self) -> Ref<'_, Table> {
        self.table.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Table> {
        self.table.borrow_mut()
    }

    pub fn recharge(&self) -> Eval<()> {
        let len = self.table.borrow().len();
        self.charge.resize(HEADER + len * (SLOT * 2 + HEADER))
    }
}

impl Drop for DictObj {
    fn drop(&mut self) {
        let table = std::mem::take(self.table.get_mut());
        drain_nested(
            table
                .entries
                .into_iter()
                .flatten()
                .flat_map(|entry| [entry.key, entry.value])
                .collect(),
        );
    }
}

/// Drops deeply nested containers iteratively instead of recursively
fn drain_nested(mut pending: Vec<Value>) {
    while let Some(value) = pending.pop() {
        match value {
            Value::List(list) => {
                if let Ok(mut list) = Rc::try_unwrap(list) {
                    pending.append(list.items.get_mut());
                }
            }
            Value::Tuple(tuple) => {
                if let Ok(mut tuple) = Rc::try_unwrap(tuple) {
                    pending.append(&mut tuple.items);
                }
            }
            Value::Dict(dict) | Value::Set(dict) => {
                if let Ok(mut dict) = Rc::try_unwrap(dict) {
                    let table = std::mem::take(dict.table.get_mut());
                    for entry in table.entries.into_iter().flatten() {
                        pending.push(entry.key);
                        pending.push(entry.value);
                    }
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValue {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeValue {
    pub fn len(&self) -> usize {
        let (start, stop, step) = (
            i128::from(self.start),
            i128::from(self.stop),
            i128::from(self.step),
        );
        let len = if step > 0 && start < stop {
            (stop - start + step - 1) / step
        } else if step < 0 && start > stop {
            (start - stop - step - 1) / -step
        } else {
            0
        };
        usize::try_from(len).unwrap_or(usize::MAX)
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        let value = i128::from(self.start) + i128::from(self.step) * index as i128;
        i64::try_from(value).ok()
    }
}

/// Code of a user function
#[derive(Debug, Clone)]
pub enum Code {
    Def(Arc<FunctionDef>),
    Lambda(Arc<LambdaDef>),
}

impl Code {
    pub fn params(&self) -> &Parameters {
        match self {
            Code::Def(def) => &def.params,
            Code::Lambda(lambda) => &lambda.params,
        }
    }
}

/// Variables of one call, chained to the defining scope for closures
#[derive(Debug, Default)]
pub struct Frame {
    pub vars: RefCell<HashMap<String, Value>>,
    pub parent: Option<Rc<Frame>>,
}

#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub code: Code,
    /// Evaluated defaults keyed by parameter name
    pub defaults: HashMap<String, Value>,
    /// Enclosing call frame; `None` for module-level functions
    pub closure: Option<Rc<Frame>>,
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub name: String,
}

/// Iteration state shared by `for` loops, builtins and iterator values
#[derive(Debug)]
pub enum Iter {
    Range { next: i64, remaining: usize, step: i64 },
    List { list: Rc<ListObj>, index: usize },
    Values(std::vec::IntoIter<Value>),
    Chars { text: Rc<StrObj>, offset: usize },
    Enumerate { inner: Box<Iter>, count: i64 },
    Zip(Vec<Iter>),
    Shared(Rc<RefCell<Iter>>),
}

impl Iter {
    pub fn next(&mut self) -> Eval<Option<Value>> {
        match self {
            Iter::Range {
                next,
                remaining,
                step,
            } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                let value = *next;
                *remaining -= 1;
                if *remaining > 0 {
                    *next = next.checked_add(*step).ok_or_else(overflow_error)?;
                }
                Ok(Some(Value::Int(value)))
            }
            Iter::List { list, index } => {
                let item = list.borrow().get(*index).cloned();
                *index += 1;
                Ok(item)
            }
            Iter::Values(values) => Ok(values.next()),
            Iter::Chars { text, offset } => {
                let Some(ch) = text.as_str()[*offset..].chars().next() else {
                    return Ok(None);
                };
                *offset += ch.len_utf8();
                Ok(Some(Value::new_str(ch.to_string())?))
            }
            Iter::Enumerate { inner, count } => {
                let Some(item) = inner.next()? else {
                    return Ok(None);
                };
                let index = *count;
                *count = count.checked_add(1).ok_or_else(overflow_error)?;
                Ok(Some(Value::new_tuple(vec![Value::Int(index), item])?))
            }
            Iter::Zip(iters) => {
                if iters.is_empty() {
                    return Ok(None);
                }
                let mut items = Vec::with_capacity(iters.len());
                for iter in iters.iter_mut() {
                    match iter.next()? {
                        Some(item) => items.push(item),
                        None => return Ok(None),
                    }
                }
                Ok(Some(Value::new_tuple(items)?))
            }
            Iter::Shared(shared) => shared
                .try_borrow_mut()
                .map_err(|_| value_error("iterator is already executing"))?
                .next(),
        }
    }
}

/// Iteration state for `value`
pub fn iterate(value: &Value) -> Eval<Iter> {
    Ok(match value {
        Value::Range(range) => Iter::Range {
            next: range.start,
            remaining: range.len(),
            step: range.step,
        },
        Value::List(list) => Iter::List {
            list: list.clone(),
            index: 0,
        },
        Value::Tuple(tuple) => Iter::Values(tuple.items().to_vec().into_iter()),
        Value::Str(text) => Iter::Chars {
            text: text.clone(),
            offset: 0,
        },
        Value::Bytes(bytes) => Iter::Values(
            bytes
                .iter()
                .map(|byte| Value::Int(i64::from(*byte)))
                .collect::<Vec<_>>()
                .into_iter(),
        ),
        Value::Dict(dict) | Value::Set(dict) => Iter::Values(dict.borrow().keys().into_iter()),
        Value::Iterator(iter) => Iter::Shared(iter.clone()),
        other => {
            return Err(type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            )))
        }
    })
}

/// Accumulates values while keeping the meter informed of their size
#[derive(Debug)]
pub(crate) struct Collector {
    items: Vec<Value>,
    charge: Charge,
}

impl Collector {
    pub(crate) fn new() -> Self {
        Self {
            items: Vec::new(),
            charge: Charge::default(),
        }
    }

    pub(crate) fn push(&mut self, value: Value) -> Eval<()> {
        self.items.push(value);
        if self.items.len() % 256 == 0 {
            self.charge.resize(self.items.len() * SLOT)?;
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn finish(self) -> Vec<Value> {
        self.items
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Ellipsis,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<StrObj>),
    Bytes(Rc<[u8]>),
    List(Rc<ListObj>),
    Tuple(Rc<TupleObj>),
    Dict(Rc<DictObj>),
    Set(Rc<DictObj>),
    Range(RangeValue),
    Function(Rc<Function>),
    Builtin(Primitive),
    Method(Rc<BoundMethod>),
    ExceptionType(&'static str),
    Exception(Rc<Exception>),
    Iterator(Rc<RefCell<Iter>>),
}

impl Value {
    pub fn new_str(text: impl Into<String>) -> Eval<Value> {
        let text = text.into();
        let charge = Charge::new(HEADER + text.len())?;
        Ok(Value::Str(Rc::new(StrObj {
            text,
            _charge: charge,
        })))
    }

    pub fn new_list(items: Vec<Value>) -> Eval<Value> {
        let charge = Charge::new(HEADER + items.len() * SLOT)?;
        Ok(Value::List(Rc::new(ListObj {
            items: RefCell::new(items),
            charge,
        })))
    }

    pub fn new_tuple(items: Vec<Value>) -> Eval<Value> {
        let charge = Charge::new(HEADER + items.len() * SLOT)?;
        Ok(Value::Tuple(Rc::new(TupleObj {
            items,
            _charge: charge,
        })))
    }

    pub fn new_dict(table: Table) -> Eval<Value> {
        Ok(Value::Dict(Rc::new(DictObj::new(table)?)))
    }

    pub fn new_set(table: Table) -> Eval<Value> {
        Ok(Value::Set(Rc::new(DictObj::new(table)?)))
    }

    pub fn new_iterator(iter: Iter) -> Value {
        Value::Iterator(Rc::new(RefCell::new(iter)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Ellipsis => "ellipsis",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Range(_) => "range",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Method(_) => "method",
            Value::ExceptionType(_) => "type",
            Value::Exception(exception) => exception.kind,
            Value::Iterator(_) => "iterator",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.as_str().is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::List(list) => !list.borrow().is_empty(),
            Value::Tuple(tuple) => !tuple.items().is_empty(),
            Value::Dict(dict) | Value::Set(dict) => dict.borrow().len() > 0,
            Value::Range(range) => range.len() > 0,
            _ => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Integer view of ints and bools
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Numeric view of ints, bools and floats
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            other => other.as_int().map(|i| i as f64),
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Bool(_) | Value::Float(_))
    }

    pub fn hash_key(&self) -> Eval<HashKey> {
        Ok(match self {
            Value::None => HashKey::None,
            Value::Ellipsis => HashKey::Ellipsis,
            Value::Bool(b) => HashKey::Int(i64::from(*b)),
            Value::Int(i) => HashKey::Int(*i),
            Value::Float(f) => float_key(*f),
            Value::Str(s) => HashKey::Str(s.as_str().to_string()),
            Value::Bytes(b) => HashKey::Bytes(b.to_vec()),
            Value::Tuple(tuple) => HashKey::Tuple(
                tuple
                    .items()
                    .iter()
                    .map(Value::hash_key)
                    .collect::<Eval<_>>()?,
            ),
            Value::Range(range) => HashKey::Range(range.start, range.stop, range.step),
            Value::Builtin(primitive) => HashKey::Builtin(*primitive),
            Value::ExceptionType(kind) => HashKey::Type(kind),
            Value::Function(function) => HashKey::Identity(Rc::as_ptr(function) as *const () as usize),
            Value::Exception(exception) => HashKey::Identity(Rc::as_ptr(exception) as *const () as usize),
            Value::Method(method) => HashKey::Identity(Rc::as_ptr(method) as *const () as usize),
            Value::Iterator(iter) => HashKey::Identity(Rc::as_ptr(iter) as *const () as usize),
            Value::List(_) | Value::Dict(_) | Value::Set(_) => {
                return Err(type_error(format!("unhashable type: '{}'", self.type_name())))
            }
        })
    }

    /// Identity comparison for `is`
    pub fn is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) | (Value::Ellipsis, Value::Ellipsis) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a.as_str() == b.as_str(),
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) | (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::ExceptionType(a), Value::ExceptionType(b)) => a == b,
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            (Value::Iterator(a), Value::Iterator(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `str(value)`
    pub fn to_str(&self) -> String {
        match self {
            Value::Str(s) => s.as_str().to_string(),
            Value::Exception(exception) => exception.message.clone(),
            other => other.repr(),
        }
    }

    /// `repr(value)`
    pub fn repr(&self) -> String {
        let mut out = String::new();
        write_repr(&mut out, self, 0);
        out
    }

    /// JSON rendering of a program's return value
    pub fn to_json(&self) -> serde_json::Value {
        to_json(self, 0)
    }
}

fn float_key(f: f64) -> HashKey {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        HashKey::Int(f as i64)
    } else {
        HashKey::Float(f.to_bits())
    }
}

impl DictObj {
    fn new(table: Table) -> Eval<Self> {
        let charge = Charge::new(HEADER + table.len() * (SLOT * 2 + HEADER))?;
        Ok(Self {
            table: RefCell::new(table),
            charge,
        })
    }
}

/// Hashable projection of a value; equal values project equally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashKey {
    None,
    Ellipsis,
    Int(i64),
    Float(u64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<HashKey>),
    Range(i64, i64, i64),
    Builtin(Primitive),
    Type(&'static str),
    Identity(usize),
}

impl Hash for HashKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            HashKey::None | HashKey::Ellipsis => {}
            HashKey::Int(i) => i.hash(state),
            HashKey::Float(bits) => bits.hash(state),
            HashKey::Str(s) => s.hash(state),
            HashKey::Bytes(b) => b.hash(state),
            HashKey::Tuple(items) => items.hash(state),
            HashKey::Range(a, b, c) => (a, b, c).hash(state),
            HashKey::Builtin(primitive) => primitive.hash(state),
            HashKey::Type(kind) => kind.hash(state),
            HashKey::Identity(ptr) => ptr.hash(state),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    hash: HashKey,
    pub key: Value,
    pub value: Value,
}

/// Insertion-ordered hash table backing dicts and sets
#[derive(Debug, Clone, Default)]
pub struct Table {
    index: HashMap<HashKey, usize>,
    entries: Vec<Option<Entry>>,
    len: usize,
}

impl Table {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, hash: &HashKey) -> Option<&Value> {
        let slot = *self.index.get(hash)?;
        self.entries[slot].as_ref().map(|entry| &entry.value)
    }

    pub fn contains(&self, hash: &HashKey) -> bool {
        self.index.contains_key(hash)
    }

    /// Insert or overwrite; an existing key keeps its original position
    pub fn insert(&mut self, hash: HashKey, key: Value, value: Value) {
        if let Some(&slot) = self.index.get(&hash) {
            if let Some(entry) = self.entries[slot].as_mut() {
                entry.value = value;
                return;
            }
        }
        self.index.insert(hash.clone(), self.entries.len());
        self.entries.push(Some(Entry { hash, key, value }));
        self.len += 1;
    }

    pub fn insert_value(&mut self, key: Value, value: Value) -> Eval<()> {
        let hash = key.hash_key()?;
        self.insert(hash, key, value);
        Ok(())
    }

    pub fn remove(&mut self, hash: &HashKey) -> Option<(Value, Value)> {
        let slot = self.index.remove(hash)?;
        let entry = self.entries[slot].take()?;
        self.len -= 1;
        if self.entries.len() > 32 && self.entries.len() > self.len * 2 {
            self.compact();
        }
        Some((entry.key, entry.value))
    }

    pub fn pop_last(&mut self) -> Option<(Value, Value)> {
        while let Some(slot) = self.entries.pop() {
            if let Some(entry) = slot {
                self.index.remove(&entry.hash);
                self.len -= 1;
                return Some((entry.key, entry.value));
            }
        }
        None
    }

    pub fn pop_first(&mut self) -> Option<(Value, Value)> {
        let hash = self.iter_entries().next()?.hash.clone();
        self.remove(&hash)
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.entries.clear();
        self.len = 0;
    }

    fn compact(&mut self) {
        self.entries.retain(Option::is_some);
        self.index = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|entry| (entry.hash.clone(), slot)))
            .collect();
    }

    fn iter_entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().flatten()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.iter_entries().map(|entry| (&entry.key, &entry.value))
    }

    pub fn keys(&self) -> Vec<Value> {
        self.iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.iter().map(|(_, value)| value.clone()).collect()
    }
}

/// Structural equality, `==`
pub fn py_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => x.as_str() == y.as_str(),
        (Value::Bytes(x), Value::Bytes(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            Rc::ptr_eq(x, y) || seq_eq(&x.borrow(), &y.borrow())
        }
        (Value::Tuple(x), Value::Tuple(y)) => Rc::ptr_eq(x, y) || seq_eq(x.items(), y.items()),
        (Value::Dict(x), Value::Dict(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter_entries().all(|entry| {
                    y.get(&entry.hash)
                        .map_or(false, |other| py_eq(&entry.value, other))
                })
        }
        (Value::Set(x), Value::Set(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter_entries().all(|entry| y.contains(&entry.hash))
        }
        (Value::Range(x), Value::Range(y)) => x == y,
        (Value::Exception(x), Value::Exception(y)) => Rc::ptr_eq(x, y),
        _ if a.is_number() && b.is_number() => match (a.as_int(), b.as_int()) {
            (Some(x), Some(y)) => x == y,
            _ => a.as_float() == b.as_float(),
        },
        _ => a.is(b),
    }
}

fn seq_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| py_eq(x, y))
}

/// Ordering for `<` and friends; `Ok(None)` when unordered (NaN)
pub fn py_partial_cmp(a: &Value, b: &Value) -> Eval<Option<Ordering>> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(Some(x.as_str().cmp(y.as_str()))),
        (Value::Bytes(x), Value::Bytes(y)) => Ok(Some(x.cmp(y))),
        (Value::List(x), Value::List(y)) => seq_cmp(&x.borrow(), &y.borrow()),
        (Value::Tuple(x), Value::Tuple(y)) => seq_cmp(x.items(), y.items()),
        _ if a.is_number() && b.is_number() => Ok(match (a.as_int(), b.as_int()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => a.as_float().zip(b.as_float()).and_then(|(x, y)| x.partial_cmp(&y)),
        }),
        _ => Err(type_error(format!(
            "'<' not supported between instances of '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn seq_cmp(a: &[Value], b: &[Value]) -> Eval<Option<Ordering>> {
    for (x, y) in a.iter().zip(b) {
        if !py_eq(x, y) {
            return py_partial_cmp(x, y);
        }
    }
    Ok(Some(a.len().cmp(&b.len())))
}

const MAX_REPR_DEPTH: usize = 200;

thread_local! {
    static REPR_ACTIVE: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Runs `body` unless `ptr` is already being rendered (a self-reference)
fn guarded(ptr: usize, out: &mut String, placeholder: &str, body: impl FnOnce(&mut String)) {
    let entered = REPR_ACTIVE.with(|active| {
        let mut active = active.borrow_mut();
        if active.contains(&ptr) {
            false
        } else {
            active.push(ptr);
            true
        }
    });
    if !entered {
        out.push_str(placeholder);
        return;
    }
    body(out);
    REPR_ACTIVE.with(|active| {
        active.borrow_mut().pop();
    });
}

fn write_seq(out: &mut String, items: &[Value], depth: usize) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_repr(out, item, depth + 1);
    }
}

fn write_repr(out: &mut String, value: &Value, depth: usize) {
    if depth > MAX_REPR_DEPTH {
        out.push_str("...");
        return;
    }
    match value {
        Value::None => out.push_str("None"),
        Value::Ellipsis => out.push_str("Ellipsis"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Int(i) => {
            let _ = write!(out, "{}", i);
        }
        Value::Float(f) => out.push_str(&float_repr(*f)),
        Value::Str(s) => out.push_str(&str_repr(s.as_str())),
        Value::Bytes(bytes) => out.push_str(&bytes_repr(bytes)),
        Value::List(list) => guarded(Rc::as_ptr(list) as usize, out, "[...]", |out| {
            out.push('[');
            write_seq(out, &list.borrow(), depth);
            out.push(']');
        }),
        Value::Tuple(tuple) => {
            out.push('(');
            write_seq(out, tuple.items(), depth);
            if tuple.items().len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        Value::Dict(dict) => guarded(Rc::as_ptr(dict) as usize, out, "{...}", |out| {
            out.push('{');
            for (i, (key, value)) in dict.borrow().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_repr(out, key, depth + 1);
                out.push_str(": ");
                write_repr(out, value, depth + 1);
            }
            out.push('}');
        }),
        Value::Set(set) => {
            let table = set.borrow();
            if table.is_empty() {
                out.push_str("set()");
            } else {
                out.push('{');
                write_seq(out, &table.keys(), depth);
                out.push('}');
            }
        }
        Value::Range(range) => {
            if range.step == 1 {
                let _ = write!(out, "range({}, {})", range.start, range.stop);
            } else {
                let _ = write!(out, "range({}, {}, {})", range.start, range.stop, range.step);
            }
        }
        Value::Function(function) => {
            let _ = write!(out, "<function {}>", function.name);
        }
        Value::Builtin(primitive) => {
            let _ = write!(out, "<built-in function {}>", primitive.name());
        }
        Value::Method(method) => {
            let _ = write!(
                out,
                "<built-in method {} of {} object>",
                method.name,
                method.receiver.type_name()
            );
        }
        Value::ExceptionType(kind) => {
            let _ = write!(out, "<class '{}'>", kind);
        }
        Value::Exception(exception) => {
            let _ = write!(out, "{}({})", exception.kind, str_repr(&exception.message));
        }
        Value::Iterator(_) => out.push_str("<iterator object>"),
    }
}

pub fn str_repr(text: &str) -> String {
    let quote = if text.contains('\'') && !text.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn bytes_repr(bytes: &[u8]) -> String {
    let mut out = String::from("b'");
    for &byte in bytes {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(byte as char),
            _ => {
                let _ = write!(out, "\\x{:02x}", byte);
            }
        }
    }
    out.push('\'');
    out
}

fn to_json(value: &Value, depth: usize) -> serde_json::Value {
    use serde_json::Value as Json;
    if depth > MAX_REPR_DEPTH {
        return Json::Null;
    }
    match value {
        Value::None => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or_else(|| Json::String(float_repr(*f))),
        Value::Str(s) => Json::String(s.as_str().to_string()),
        Value::List(list) => {
            Json::Array(list.borrow().iter().map(|item| to_json(item, depth + 1)).collect())
        }
        Value::Tuple(tuple) => {
            Json::Array(tuple.items().iter().map(|item| to_json(item, depth + 1)).collect())
        }
        Value::Set(set) => Json::Array(
            set.borrow()
                .iter()
                .map(|(key, _)| to_json(key, depth + 1))
                .collect(),
        ),
        Value::Dict(dict) => Json::Object(
            dict.borrow()
                .iter()
                .map(|(key, value)| (key.to_str(), to_json(value, depth + 1)))
                .collect(),
        ),
        other => Json::String(other.repr()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(text: &str) -> Value {
        Value::new_str(text).unwrap()
    }

    #[test]
    fn test_numeric_equality_and_hashing() {
        assert!(py_eq(&Value::Int(1), &Value::Float(1.0)));
        assert!(py_eq(&Value::Bool(true), &Value::Int(1)));
        assert_eq!(Value::Float(2.0).hash_key().unwrap(), Value::Int(2).hash_key().unwrap());
        assert!(Value::new_list(vec![]).unwrap().hash_key().is_err());
    }

    #[test]
    fn test_repr_forms() {
        let list = Value::new_list(vec![Value::Int(1), s("a'b"), Value::None]).unwrap();
        assert_eq!(list.repr(), "[1, \"a'b\", None]");
        let single = Value::new_tuple(vec![Value::Int(1)]).unwrap();
        assert_eq!(single.repr(), "(1,)");
        assert_eq!(s("x\n").repr(), "'x\\n'");
        assert_eq!(Value::new_set(Table::default()).unwrap().repr(), "set()");
    }

    #[test]
    fn test_self_referencing_list_repr() {
        let list = Value::new_list(vec![]).unwrap();
        if let Value::List(obj) = &list {
            obj.borrow_mut().push(list.clone());
        }
        assert_eq!(list.repr(), "[[...]]");
        if let Value::List(obj) = &list {
            obj.borrow_mut().clear();
        }
    }

    #[test]
    fn test_table_preserves_insertion_order() {
        let mut table = Table::default();
        for (i, key) in ["b", "a", "c"].iter().enumerate() {
            table.insert_value(s(key), Value::Int(i as i64)).unwrap();
        }
        table.insert_value(s("b"), Value::Int(9)).unwrap();
        let keys: Vec<String> = table.keys().iter().map(Value::to_str).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
        assert_eq!(table.get(&s("b").hash_key().unwrap()).and_then(Value::as_int), Some(9));
        table.remove(&s("a").hash_key().unwrap());
        assert_eq!(table.len(), 2);
        assert_eq!(table.pop_last().map(|(k, _)| k.to_str()), Some("c".to_string()));
    }

    #[test]
    fn test_range_len_and_get() {
        let range = RangeValue { start: 0, stop: 10, step: 3 };
        assert_eq!(range.len(), 4);
        assert_eq!(range.get(3), Some(9));
        let down = RangeValue { start: 5, stop: 0, step: -2 };
        assert_eq!(down.len(), 3);
        assert_eq!(RangeValue { start: 0, stop: 0, step: 1 }.len(), 0);
    }

    #[test]
    fn test_ordering() {
        assert_eq!(
            py_partial_cmp(&s("a"), &s("b")).unwrap(),
            Some(Ordering::Less)
        );
        assert_eq!(
            py_partial_cmp(&Value::Float(f64::NAN), &Value::Int(1)).unwrap(),
            None
        );
        assert!(py_partial_cmp(&s("a"), &Value::Int(1)).is_err());
    }

    #[test]
    fn test_deep_nesting_drops_without_recursion() {
        let mut value = Value::new_list(vec![]).unwrap();
        for _ in 0..200_000 {
            value = Value::new_list(vec![value]).unwrap();
        }
        drop(value);
    }

    #[test]
    fn test_json_rendering() {
        let mut table = Table::default();
        table.insert_value(s("k"), Value::Float(1.5)).unwrap();
        let dict = Value::new_dict(table).unwrap();
        assert_eq!(dict.to_json(), serde_json::json!({"k": 1.5}));
        assert_eq!(Value::Int(3).to_json(), serde_json::json!(3));
    }

    #[test]
    fn test_exception_hierarchy_matching() {
        let error = Exception::new("KeyError", "'x'");
        assert!(error.is_instance_of("LookupError"));
        assert!(error.is_instance_of("Exception"));
        assert!(!error.is_instance_of("ValueError"));
        assert_eq!(error.render(), "KeyError: 'x'");
    }
}
