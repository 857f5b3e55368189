//! Methods on built-in values

use super::builtins::{arg_or_kw, arity, int_arg, sort_values, update_table, Kwargs};
use super::format::str_format;
use super::meter::check_available;
use super::ops;
use super::value::{
    index_error, py_eq, type_error, value_error, DictObj, Eval, Exception, ListObj, Table,
    Value,
};
use super::Interpreter;
use crate::lang::ast::BinOpKind;
use std::collections::HashMap;
use std::rc::Rc;

const STR_METHODS: &[&str] = &[
    "capitalize", "center", "count", "encode", "endswith", "find", "format", "index", "isalnum",
    "isalpha", "isdigit", "islower", "isspace", "isupper", "join", "ljust", "lower", "lstrip",
    "partition", "replace", "rfind", "rindex", "rjust", "rpartition", "rsplit", "rstrip", "split",
    "splitlines", "startswith", "strip", "swapcase", "title", "upper", "zfill",
];
const LIST_METHODS: &[&str] = &[
    "append", "clear", "copy", "count", "extend", "index", "insert", "pop", "remove", "reverse",
    "sort",
];
const TUPLE_METHODS: &[&str] = &["count", "index"];
const DICT_METHODS: &[&str] = &[
    "clear", "copy", "get", "items", "keys", "pop", "popitem", "setdefault", "update", "values",
];
const SET_METHODS: &[&str] = &[
    "add", "clear", "copy", "difference", "discard", "intersection", "isdisjoint", "issubset",
    "issuperset", "pop", "remove", "symmetric_difference", "union", "update",
];
const INT_METHODS: &[&str] = &["bit_length"];
const FLOAT_METHODS: &[&str] = &["is_integer"];
const BYTES_METHODS: &[&str] = &["decode"];

fn methods_of(value: &Value) -> &'static [&'static str] {
    match value {
        Value::Str(_) => STR_METHODS,
        Value::List(_) => LIST_METHODS,
        Value::Tuple(_) => TUPLE_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::Set(_) => SET_METHODS,
        Value::Int(_) | Value::Bool(_) => INT_METHODS,
        Value::Float(_) => FLOAT_METHODS,
        Value::Bytes(_) => BYTES_METHODS,
        _ => &[],
    }
}

pub(super) fn has_method(value: &Value, name: &str) -> bool {
    methods_of(value).contains(&name)
}

pub(super) fn call(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Eval<Value> {
    let kwargs = Kwargs::new(kwargs);
    match receiver {
        Value::Str(text) => str_method(interp, text.as_str(), name, args, kwargs),
        Value::List(list) => list_method(interp, list, name, args, kwargs),
        Value::Tuple(tuple) => {
            kwargs.finish(name)?;
            sequence_method(tuple.items(), name, &args, "tuple")
        }
        Value::Dict(dict) => dict_method(interp, dict, name, args, kwargs),
        Value::Set(set) => {
            kwargs.finish(name)?;
            set_method(interp, set, name, &args)
        }
        Value::Bytes(bytes) => {
            let mut kwargs = kwargs;
            arity(name, &args, 0, 2)?;
            let encoding = arg_or_kw(&args, 0, &mut kwargs, "encoding");
            let _ = arg_or_kw(&args, 1, &mut kwargs, "errors");
            kwargs.finish(name)?;
            check_encoding(encoding.as_ref())?;
            let text = std::str::from_utf8(bytes).map_err(|error| {
                value_error(format!(
                    "'utf-8' codec can't decode byte at position {}: invalid start byte",
                    error.valid_up_to()
                ))
            })?;
            Value::new_str(text)
        }
        Value::Float(f) if name == "is_integer" => {
            kwargs.finish(name)?;
            arity(name, &args, 0, 0)?;
            Ok(Value::Bool(f.is_finite() && f.fract() == 0.0))
        }
        value if name == "bit_length" && value.as_int().is_some() => {
            kwargs.finish(name)?;
            arity(name, &args, 0, 0)?;
            let magnitude = value.as_int().unwrap_or_default().unsigned_abs();
            Ok(Value::Int(i64::from(64 - magnitude.leading_zeros())))
        }
        other => Err(no_method(other, name)),
    }
}

fn no_method(value: &Value, name: &str) -> Exception {
    Exception::new(
        "AttributeError",
        format!("'{}' object has no attribute '{}'", value.type_name(), name),
    )
}

fn str_arg<'a>(value: &'a Value, function: &str) -> Eval<&'a str> {
    value.as_str().ok_or_else(|| {
        type_error(format!(
            "{}() argument must be str, not {}",
            function,
            value.type_name()
        ))
    })
}

fn optional_int(args: &[Value], index: usize) -> Eval<Option<i64>> {
    match args.get(index) {
        None | Some(Value::None) => Ok(None),
        Some(value) => int_arg(value).map(Some),
    }
}

fn check_encoding(encoding: Option<&Value>) -> Eval<()> {
    let Some(encoding) = encoding else {
        return Ok(());
    };
    let name = str_arg(encoding, "encoding")?;
    match name.to_ascii_lowercase().replace('_', "-").as_str() {
        "utf-8" | "utf8" | "ascii" => Ok(()),
        _ => Err(Exception::new(
            "LookupError",
            format!("unknown encoding: {}", name),
        )),
    }
}

fn char_to_byte(text: &str, index: usize) -> usize {
    text.char_indices()
        .nth(index)
        .map_or(text.len(), |(offset, _)| offset)
}

/// Byte window of `text[start:end]` plus the char offset of its start
fn window(text: &str, start: Option<i64>, end: Option<i64>) -> (usize, usize, i64) {
    let len = text.chars().count() as i64;
    let clamp = |index: i64| {
        if index < 0 {
            (index + len).max(0)
        } else {
            index.min(len)
        }
    };
    let first = start.map_or(0, clamp);
    let last = end.map_or(len, clamp).max(first);
    (
        char_to_byte(text, first as usize),
        char_to_byte(text, last as usize),
        first,
    )
}

fn split_whitespace(text: &str, maxsplit: Option<usize>) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = text.trim_start();
    while !rest.is_empty() {
        if maxsplit.is_some_and(|max| parts.len() >= max) {
            parts.push(rest);
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(offset) => {
                parts.push(&rest[..offset]);
                rest = rest[offset..].trim_start();
            }
            None => {
                parts.push(rest);
                break;
            }
        }
    }
    parts
}

fn rsplit_whitespace(text: &str, maxsplit: Option<usize>) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = text.trim_end();
    while !rest.is_empty() {
        if maxsplit.is_some_and(|max| parts.len() >= max) {
            parts.push(rest);
            break;
        }
        match rest.rfind(char::is_whitespace) {
            Some(offset) => {
                let ch_len = rest[offset..].chars().next().map_or(1, char::len_utf8);
                parts.push(&rest[offset + ch_len..]);
                rest = rest[..offset].trim_end();
            }
            None => {
                parts.push(rest);
                break;
            }
        }
    }
    parts.reverse();
    parts
}

fn str_list(parts: Vec<&str>) -> Eval<Value> {
    let items = parts
        .into_iter()
        .map(Value::new_str)
        .collect::<Eval<Vec<_>>>()?;
    Value::new_list(items)
}

fn pad(text: &str, width: i64, fill: char, left_share: impl Fn(usize) -> usize) -> Eval<Value> {
    let len = text.chars().count();
    let width = usize::try_from(width).unwrap_or(0);
    if width <= len {
        return Value::new_str(text);
    }
    let total = width - len;
    check_available(width * fill.len_utf8())?;
    let left = left_share(total);
    let mut out = String::with_capacity(width);
    out.extend(std::iter::repeat(fill).take(left));
    out.push_str(text);
    out.extend(std::iter::repeat(fill).take(total - left));
    Value::new_str(out)
}

fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous_cased = false;
    for ch in text.chars() {
        if ch.is_alphabetic() {
            if previous_cased {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            previous_cased = true;
        } else {
            out.push(ch);
            previous_cased = false;
        }
    }
    out
}

fn str_method(
    interp: &mut Interpreter,
    text: &str,
    name: &str,
    args: Vec<Value>,
    mut kwargs: Kwargs,
) -> Eval<Value> {
    match name {
        "format" => {
            let named: HashMap<String, Value> = kwargs.into_items().into_iter().collect();
            return Value::new_str(str_format(text, &args, &named)?);
        }
        "split" | "rsplit" => {
            arity(name, &args, 0, 2)?;
            let sep = arg_or_kw(&args, 0, &mut kwargs, "sep");
            let maxsplit = arg_or_kw(&args, 1, &mut kwargs, "maxsplit");
            kwargs.finish(name)?;
            let maxsplit = match maxsplit {
                Some(value) => usize::try_from(int_arg(&value)?).ok(),
                None => None,
            };
            let parts = match (&sep, name) {
                (None, "split") => split_whitespace(text, maxsplit),
                (None, _) => rsplit_whitespace(text, maxsplit),
                (Some(sep), _) => {
                    let sep = str_arg(sep, name)?;
                    if sep.is_empty() {
                        return Err(value_error("empty separator"));
                    }
                    match (maxsplit, name) {
                        (None, _) => text.split(sep).collect(),
                        (Some(max), "split") => text.splitn(max + 1, sep).collect(),
                        (Some(max), _) => {
                            let mut parts: Vec<&str> = text.rsplitn(max + 1, sep).collect();
                            parts.reverse();
                            parts
                        }
                    }
                }
            };
            return str_list(parts);
        }
        "encode" => {
            arity(name, &args, 0, 2)?;
            let encoding = arg_or_kw(&args, 0, &mut kwargs, "encoding");
            let _ = arg_or_kw(&args, 1, &mut kwargs, "errors");
            kwargs.finish(name)?;
            check_encoding(encoding.as_ref())?;
            check_available(text.len())?;
            return Ok(Value::Bytes(Rc::from(text.as_bytes())));
        }
        _ => kwargs.finish(name)?,
    }

    match name {
        "upper" | "lower" | "swapcase" | "title" | "capitalize" => {
            arity(name, &args, 0, 0)?;
            let out = match name {
                "upper" => text.to_uppercase(),
                "lower" => text.to_lowercase(),
                "title" => title_case(text),
                "capitalize" => {
                    let mut chars = text.chars();
                    match chars.next() {
                        Some(first) => first
                            .to_uppercase()
                            .chain(chars.flat_map(char::to_lowercase))
                            .collect(),
                        None => String::new(),
                    }
                }
                _ => text
                    .chars()
                    .flat_map(|ch| -> Vec<char> {
                        if ch.is_uppercase() {
                            ch.to_lowercase().collect()
                        } else {
                            ch.to_uppercase().collect()
                        }
                    })
                    .collect(),
            };
            Value::new_str(out)
        }
        "strip" | "lstrip" | "rstrip" => {
            arity(name, &args, 0, 1)?;
            let chars = match args.first() {
                None | Some(Value::None) => None,
                Some(value) => Some(str_arg(value, name)?),
            };
            let strip = |ch: char| match chars {
                Some(set) => set.contains(ch),
                None => ch.is_whitespace(),
            };
            let out = match name {
                "strip" => text.trim_matches(strip),
                "lstrip" => text.trim_start_matches(strip),
                _ => text.trim_end_matches(strip),
            };
            Value::new_str(out)
        }
        "splitlines" => {
            arity(name, &args, 0, 0)?;
            str_list(text.lines().collect())
        }
        "join" => {
            arity(name, &args, 1, 1)?;
            let items = interp.collect(&args[0])?;
            let mut size = text.len() * items.len().saturating_sub(1);
            for (index, item) in items.iter().enumerate() {
                match item {
                    Value::Str(part) => size += part.as_str().len(),
                    other => {
                        return Err(type_error(format!(
                            "sequence item {}: expected str instance, {} found",
                            index,
                            other.type_name()
                        )))
                    }
                }
            }
            check_available(size)?;
            let mut out = String::with_capacity(size);
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push_str(text);
                }
                out.push_str(item.as_str().unwrap_or_default());
            }
            Value::new_str(out)
        }
        "replace" => {
            arity(name, &args, 2, 3)?;
            let old = str_arg(&args[0], name)?;
            let new = str_arg(&args[1], name)?;
            let count = optional_int(&args, 2)?.filter(|count| *count >= 0);
            let occurrences = if old.is_empty() {
                text.chars().count() + 1
            } else {
                text.matches(old).count()
            };
            let occurrences = count.map_or(occurrences, |count| occurrences.min(count as usize));
            check_available(text.len() + occurrences.saturating_mul(new.len()))?;
            let out = match count {
                Some(count) => text.replacen(old, new, count as usize),
                None => text.replace(old, new),
            };
            Value::new_str(out)
        }
        "startswith" | "endswith" => {
            arity(name, &args, 1, 3)?;
            let (start, end, _) = window(text, optional_int(&args, 1)?, optional_int(&args, 2)?);
            let slice = &text[start..end];
            let candidates: Vec<&str> = match &args[0] {
                Value::Tuple(tuple) => tuple
                    .items()
                    .iter()
                    .map(|item| str_arg(item, name))
                    .collect::<Eval<_>>()?,
                other => vec![str_arg(other, name)?],
            };
            let hit = candidates.iter().any(|candidate| {
                if name == "startswith" {
                    slice.starts_with(candidate)
                } else {
                    slice.ends_with(candidate)
                }
            });
            Ok(Value::Bool(hit))
        }
        "find" | "rfind" | "index" | "rindex" => {
            arity(name, &args, 1, 3)?;
            let needle = str_arg(&args[0], name)?;
            let (start, end, offset) =
                window(text, optional_int(&args, 1)?, optional_int(&args, 2)?);
            let haystack = &text[start..end];
            let found = if name.starts_with('r') {
                haystack.rfind(needle)
            } else {
                haystack.find(needle)
            };
            match found {
                Some(byte) => Ok(Value::Int(offset + haystack[..byte].chars().count() as i64)),
                None if name.ends_with("find") => Ok(Value::Int(-1)),
                None => Err(value_error("substring not found")),
            }
        }
        "count" => {
            arity(name, &args, 1, 3)?;
            let needle = str_arg(&args[0], name)?;
            let (start, end, _) = window(text, optional_int(&args, 1)?, optional_int(&args, 2)?);
            let haystack = &text[start..end];
            let count = if needle.is_empty() {
                haystack.chars().count() + 1
            } else {
                haystack.matches(needle).count()
            };
            Ok(Value::Int(count as i64))
        }
        "isdigit" | "isalpha" | "isalnum" | "isspace" => {
            arity(name, &args, 0, 0)?;
            let test: fn(char) -> bool = match name {
                "isdigit" => char::is_numeric,
                "isalpha" => char::is_alphabetic,
                "isalnum" => char::is_alphanumeric,
                _ => char::is_whitespace,
            };
            Ok(Value::Bool(!text.is_empty() && text.chars().all(test)))
        }
        "isupper" | "islower" => {
            arity(name, &args, 0, 0)?;
            let upper = text.chars().any(char::is_uppercase);
            let lower = text.chars().any(char::is_lowercase);
            Ok(Value::Bool(if name == "isupper" {
                upper && !lower
            } else {
                lower && !upper
            }))
        }
        "center" | "ljust" | "rjust" => {
            arity(name, &args, 1, 2)?;
            let width = int_arg(&args[0])?;
            let fill = match args.get(1) {
                Some(value) => {
                    let fill = str_arg(value, name)?;
                    let mut chars = fill.chars();
                    match (chars.next(), chars.next()) {
                        (Some(ch), None) => ch,
                        _ => {
                            return Err(type_error(
                                "The fill character must be exactly one character long",
                            ))
                        }
                    }
                }
                None => ' ',
            };
            match name {
                "ljust" => pad(text, width, fill, |_| 0),
                "rjust" => pad(text, width, fill, |total| total),
                _ => {
                    let odd_width = usize::try_from(width).unwrap_or(0) & 1;
                    pad(text, width, fill, |total| total / 2 + (total & odd_width))
                }
            }
        }
        "zfill" => {
            arity(name, &args, 1, 1)?;
            let width = int_arg(&args[0])?;
            let (sign, digits) = match text.chars().next() {
                Some(sign @ ('+' | '-')) => (Some(sign), &text[1..]),
                _ => (None, text),
            };
            let padded = pad(digits, width - i64::from(sign.is_some()), '0', |total| total)?;
            match sign {
                Some(sign) => Value::new_str(format!("{}{}", sign, padded.as_str().unwrap_or_default())),
                None => Ok(padded),
            }
        }
        "partition" | "rpartition" => {
            arity(name, &args, 1, 1)?;
            let sep = str_arg(&args[0], name)?;
            if sep.is_empty() {
                return Err(value_error("empty separator"));
            }
            let found = if name == "partition" {
                text.split_once(sep)
            } else {
                text.rsplit_once(sep)
            };
            let parts = match found {
                Some((head, tail)) => [head, sep, tail],
                None if name == "partition" => [text, "", ""],
                None => ["", "", text],
            };
            let items = parts
                .into_iter()
                .map(Value::new_str)
                .collect::<Eval<Vec<_>>>()?;
            Value::new_tuple(items)
        }
        _ => Err(no_method(&Value::new_str(text)?, name)),
    }
}

fn position(items: &[Value], needle: &Value, container: &str) -> Eval<usize> {
    items
        .iter()
        .position(|item| py_eq(item, needle))
        .ok_or_else(|| value_error(format!("{} is not in {}", needle.repr(), container)))
}

fn sequence_method(items: &[Value], name: &str, args: &[Value], container: &str) -> Eval<Value> {
    match name {
        "count" => {
            arity(name, args, 1, 1)?;
            let count = items.iter().filter(|item| py_eq(item, &args[0])).count();
            Ok(Value::Int(count as i64))
        }
        "index" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Int(position(items, &args[0], container)? as i64))
        }
        _ => Err(Exception::new(
            "AttributeError",
            format!("'{}' object has no attribute '{}'", container, name),
        )),
    }
}

fn list_method(
    interp: &mut Interpreter,
    list: &Rc<ListObj>,
    name: &str,
    args: Vec<Value>,
    mut kwargs: Kwargs,
) -> Eval<Value> {
    if name == "sort" {
        if !args.is_empty() {
            return Err(type_error("sort() takes no positional arguments"));
        }
        let key = kwargs.take("key").filter(|key| !matches!(key, Value::None));
        let reverse = kwargs.take("reverse").is_some_and(|value| value.truthy());
        kwargs.finish(name)?;
        let items = list.borrow().clone();
        let sorted = sort_values(interp, items, key.as_ref(), reverse)?;
        *list.borrow_mut() = sorted;
        return Ok(Value::None);
    }
    kwargs.finish(name)?;

    match name {
        "append" => {
            arity(name, &args, 1, 1)?;
            list.borrow_mut().push(args[0].clone());
            list.recharge()?;
            Ok(Value::None)
        }
        "extend" => {
            arity(name, &args, 1, 1)?;
            let items = interp.collect(&args[0])?;
            list.borrow_mut().extend(items);
            list.recharge()?;
            Ok(Value::None)
        }
        "insert" => {
            arity(name, &args, 2, 2)?;
            let index = int_arg(&args[0])?;
            let mut items = list.borrow_mut();
            let len = items.len() as i64;
            let index = if index < 0 {
                (index + len).max(0)
            } else {
                index.min(len)
            };
            items.insert(index as usize, args[1].clone());
            drop(items);
            list.recharge()?;
            Ok(Value::None)
        }
        "pop" => {
            arity(name, &args, 0, 1)?;
            let index = optional_int(&args, 0)?.unwrap_or(-1);
            let mut items = list.borrow_mut();
            if items.is_empty() {
                return Err(index_error("pop from empty list"));
            }
            let len = items.len() as i64;
            let resolved = if index < 0 { index + len } else { index };
            if !(0..len).contains(&resolved) {
                return Err(index_error("pop index out of range"));
            }
            let item = items.remove(resolved as usize);
            drop(items);
            list.recharge()?;
            Ok(item)
        }
        "remove" => {
            arity(name, &args, 1, 1)?;
            let index = position(&list.borrow(), &args[0], "list")
                .map_err(|_| value_error("list.remove(x): x not in list"))?;
            list.borrow_mut().remove(index);
            list.recharge()?;
            Ok(Value::None)
        }
        "reverse" => {
            arity(name, &args, 0, 0)?;
            list.borrow_mut().reverse();
            Ok(Value::None)
        }
        "clear" => {
            arity(name, &args, 0, 0)?;
            list.borrow_mut().clear();
            list.recharge()?;
            Ok(Value::None)
        }
        "copy" => {
            arity(name, &args, 0, 0)?;
            let items = list.borrow().clone();
            Value::new_list(items)
        }
        _ => sequence_method(&list.borrow(), name, &args, "list"),
    }
}

fn key_error(key: &Value) -> Exception {
    Exception::new("KeyError", key.repr())
}

fn dict_method(
    interp: &mut Interpreter,
    dict: &Rc<DictObj>,
    name: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Eval<Value> {
    if name == "update" {
        arity(name, &args, 0, 1)?;
        let mut incoming = Table::default();
        if let Some(source) = args.first() {
            update_table(interp, &mut incoming, source)?;
        }
        for (key, value) in kwargs.into_items() {
            incoming.insert_value(Value::new_str(key)?, value)?;
        }
        {
            let mut table = dict.borrow_mut();
            for (key, value) in incoming.iter() {
                table.insert_value(key.clone(), value.clone())?;
            }
        }
        dict.recharge()?;
        return Ok(Value::None);
    }
    kwargs.finish(name)?;

    match name {
        "get" => {
            arity(name, &args, 1, 2)?;
            let hash = args[0].hash_key()?;
            let found = dict.borrow().get(&hash).cloned();
            Ok(found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
        }
        "keys" | "values" => {
            arity(name, &args, 0, 0)?;
            let items = if name == "keys" {
                dict.borrow().keys()
            } else {
                dict.borrow().values()
            };
            Value::new_list(items)
        }
        "items" => {
            arity(name, &args, 0, 0)?;
            let pairs: Vec<(Value, Value)> = dict
                .borrow()
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            let items = pairs
                .into_iter()
                .map(|(key, value)| Value::new_tuple(vec![key, value]))
                .collect::<Eval<Vec<_>>>()?;
            Value::new_list(items)
        }
        "pop" => {
            arity(name, &args, 1, 2)?;
            let hash = args[0].hash_key()?;
            let removed = dict.borrow_mut().remove(&hash);
            match removed {
                Some((_, value)) => {
                    dict.recharge()?;
                    Ok(value)
                }
                None => args.get(1).cloned().ok_or_else(|| key_error(&args[0])),
            }
        }
        "popitem" => {
            arity(name, &args, 0, 0)?;
            let removed = dict.borrow_mut().pop_last();
            let (key, value) = removed
                .ok_or_else(|| Exception::new("KeyError", "'popitem(): dictionary is empty'"))?;
            dict.recharge()?;
            Value::new_tuple(vec![key, value])
        }
        "setdefault" => {
            arity(name, &args, 1, 2)?;
            let hash = args[0].hash_key()?;
            if let Some(existing) = dict.borrow().get(&hash).cloned() {
                return Ok(existing);
            }
            let value = args.get(1).cloned().unwrap_or(Value::None);
            dict.borrow_mut().insert(hash, args[0].clone(), value.clone());
            dict.recharge()?;
            Ok(value)
        }
        "clear" => {
            arity(name, &args, 0, 0)?;
            dict.borrow_mut().clear();
            dict.recharge()?;
            Ok(Value::None)
        }
        "copy" => {
            arity(name, &args, 0, 0)?;
            let table = dict.borrow().clone();
            Value::new_dict(table)
        }
        _ => Err(no_method(&Value::Dict(dict.clone()), name)),
    }
}

/// Coerce any iterable into a set value for the binary set operators
fn as_set(interp: &mut Interpreter, value: &Value) -> Eval<Value> {
    if let Value::Set(_) = value {
        return Ok(value.clone());
    }
    let mut table = Table::default();
    for item in interp.collect(value)? {
        table.insert_value(item, Value::None)?;
    }
    Value::new_set(table)
}

fn set_method(
    interp: &mut Interpreter,
    set: &Rc<DictObj>,
    name: &str,
    args: &[Value],
) -> Eval<Value> {
    let this = Value::Set(set.clone());
    match name {
        "add" => {
            arity(name, args, 1, 1)?;
            let hash = args[0].hash_key()?;
            set.borrow_mut().insert(hash, args[0].clone(), Value::None);
            set.recharge()?;
            Ok(Value::None)
        }
        "discard" | "remove" => {
            arity(name, args, 1, 1)?;
            let hash = args[0].hash_key()?;
            let removed = set.borrow_mut().remove(&hash);
            if removed.is_none() && name == "remove" {
                return Err(key_error(&args[0]));
            }
            set.recharge()?;
            Ok(Value::None)
        }
        "pop" => {
            arity(name, args, 0, 0)?;
            let removed = set.borrow_mut().pop_first();
            let (item, _) =
                removed.ok_or_else(|| Exception::new("KeyError", "'pop from an empty set'"))?;
            set.recharge()?;
            Ok(item)
        }
        "clear" => {
            arity(name, args, 0, 0)?;
            set.borrow_mut().clear();
            set.recharge()?;
            Ok(Value::None)
        }
        "copy" => {
            arity(name, args, 0, 0)?;
            let table = set.borrow().clone();
            Value::new_set(table)
        }
        "union" | "intersection" | "difference" | "symmetric_difference" => {
            let op = match name {
                "union" => BinOpKind::BitOr,
                "intersection" => BinOpKind::BitAnd,
                "difference" => BinOpKind::Sub,
                _ => BinOpKind::BitXor,
            };
            if op == BinOpKind::BitXor {
                arity(name, args, 1, 1)?;
            }
            let mut result = ops::binary(BinOpKind::BitOr, &this, &Value::new_set(Table::default())?)?;
            for other in args {
                let other = as_set(interp, other)?;
                result = ops::binary(op, &result, &other)?;
            }
            Ok(result)
        }
        "update" => {
            let mut incoming = Vec::new();
            for other in args {
                incoming.extend(interp.collect(other)?);
            }
            {
                let mut table = set.borrow_mut();
                for item in incoming {
                    table.insert_value(item, Value::None)?;
                }
            }
            set.recharge()?;
            Ok(Value::None)
        }
        "issubset" | "issuperset" | "isdisjoint" => {
            arity(name, args, 1, 1)?;
            let other = as_set(interp, &args[0])?;
            let Value::Set(other) = other else {
                return Err(no_method(&this, name));
            };
            let mine = set.borrow();
            let theirs = other.borrow();
            let contained = |small: &Table, large: &Table| -> Eval<bool> {
                for key in small.keys() {
                    if !large.contains(&key.hash_key()?) {
                        return Ok(false);
                    }
                }
                Ok(true)
            };
            let answer = match name {
                "issubset" => contained(&*mine, &*theirs)?,
                "issuperset" => contained(&*theirs, &*mine)?,
                _ => {
                    let mut disjoint = true;
                    for key in mine.keys() {
                        if theirs.contains(&key.hash_key()?) {
                            disjoint = false;
                            break;
                        }
                    }
                    disjoint
                }
            };
            Ok(Value::Bool(answer))
        }
        _ => Err(no_method(&this, name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_catalog() {
        let text = Value::new_str("abc").unwrap();
        assert!(has_method(&text, "upper"));
        assert!(!has_method(&text, "append"));
        assert!(has_method(&Value::Int(3), "bit_length"));
        assert!(has_method(&Value::Bool(true), "bit_length"));
        assert!(!has_method(&Value::None, "anything"));
    }

    #[test]
    fn test_split_whitespace() {
        assert_eq!(split_whitespace("  a b\t c  ", None), vec!["a", "b", "c"]);
        assert_eq!(split_whitespace("a b  c  ", Some(1)), vec!["a", "b  c  "]);
        assert_eq!(rsplit_whitespace("  a b  c", Some(1)), vec!["  a b", "c"]);
        assert!(split_whitespace("   ", None).is_empty());
    }

    #[test]
    fn test_window_clamps_char_indices() {
        let text = "héllo";
        let (start, end, offset) = window(text, Some(1), Some(-1));
        assert_eq!(&text[start..end], "éll");
        assert_eq!(offset, 1);
        let (start, end, _) = window(text, Some(10), None);
        assert_eq!(start, end);
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("hello wORLD 2nd"), "Hello World 2Nd");
    }
}
