//! Primitives of the safe catalog

use super::format::format_value;
use super::meter::check_available;
use super::ops;
use super::value::{
    iterate, overflow_error, py_partial_cmp, str_repr, type_error, value_error, Eval, Exception,
    Iter, RangeValue, Table, Value,
};
use super::Interpreter;
use crate::environment::Primitive;
use crate::lang::ast::BinOpKind;
use std::cmp::Ordering;

/// Keyword arguments not yet consumed by a primitive or method
pub(super) struct Kwargs(Vec<(String, Value)>);

impl Kwargs {
    pub(super) fn new(items: Vec<(String, Value)>) -> Self {
        Self(items)
    }

    pub(super) fn take(&mut self, name: &str) -> Option<Value> {
        let position = self.0.iter().position(|(key, _)| key == name)?;
        Some(self.0.remove(position).1)
    }

    pub(super) fn into_items(self) -> Vec<(String, Value)> {
        self.0
    }

    /// Reject whatever is left over
    pub(super) fn finish(self, function: &str) -> Eval<()> {
        match self.0.first() {
            Some((key, _)) => Err(type_error(format!(
                "'{}' is an invalid keyword argument for {}()",
                key, function
            ))),
            None => Ok(()),
        }
    }
}

pub(super) fn arity(function: &str, args: &[Value], min: usize, max: usize) -> Eval<()> {
    let given = args.len();
    if (min..=max).contains(&given) {
        return Ok(());
    }
    let message = if min == max {
        format!(
            "{}() takes exactly {} argument{} ({} given)",
            function,
            min,
            if min == 1 { "" } else { "s" },
            given
        )
    } else if given < min {
        format!(
            "{}() takes at least {} argument{} ({} given)",
            function,
            min,
            if min == 1 { "" } else { "s" },
            given
        )
    } else {
        format!(
            "{}() takes at most {} argument{} ({} given)",
            function,
            max,
            if max == 1 { "" } else { "s" },
            given
        )
    };
    Err(type_error(message))
}

/// Positional argument `index`, falling back to keyword `name`; `None` counts as absent
pub(super) fn arg_or_kw(
    args: &[Value],
    index: usize,
    kwargs: &mut Kwargs,
    name: &str,
) -> Option<Value> {
    args.get(index)
        .cloned()
        .or_else(|| kwargs.take(name))
        .filter(|value| !matches!(value, Value::None))
}

pub(super) fn int_arg(value: &Value) -> Eval<i64> {
    value.as_int().ok_or_else(|| {
        type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            value.type_name()
        ))
    })
}

pub(super) fn call(
    interp: &mut Interpreter,
    primitive: Primitive,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Eval<Value> {
    let name = primitive.name();
    let mut kwargs = Kwargs::new(kwargs);
    match primitive {
        Primitive::Print => return print(interp, &args, kwargs),
        Primitive::Sorted => {
            arity(name, &args, 1, 1)?;
            let key = kwargs.take("key").filter(|key| !matches!(key, Value::None));
            let reverse = kwargs.take("reverse").is_some_and(|value| value.truthy());
            kwargs.finish(name)?;
            let items = interp.collect(&args[0])?;
            let sorted = sort_values(interp, items, key.as_ref(), reverse)?;
            return Value::new_list(sorted);
        }
        Primitive::Max => return extreme(interp, name, args, kwargs, Ordering::Greater),
        Primitive::Min => return extreme(interp, name, args, kwargs, Ordering::Less),
        Primitive::Int => {
            arity(name, &args, 0, 2)?;
            let base = arg_or_kw(&args, 1, &mut kwargs, "base");
            kwargs.finish(name)?;
            return int(args.first(), base.as_ref());
        }
        Primitive::Enumerate => {
            arity(name, &args, 1, 2)?;
            let start = arg_or_kw(&args, 1, &mut kwargs, "start");
            kwargs.finish(name)?;
            let count = start.as_ref().map(int_arg).transpose()?.unwrap_or(0);
            return Ok(Value::new_iterator(Iter::Enumerate {
                inner: Box::new(iterate(&args[0])?),
                count,
            }));
        }
        Primitive::Sum => {
            arity(name, &args, 1, 2)?;
            let start = arg_or_kw(&args, 1, &mut kwargs, "start").unwrap_or(Value::Int(0));
            kwargs.finish(name)?;
            return sum(interp, &args[0], start);
        }
        Primitive::Round => {
            arity(name, &args, 1, 2)?;
            let ndigits = arg_or_kw(&args, 1, &mut kwargs, "ndigits");
            kwargs.finish(name)?;
            return round(&args[0], ndigits.as_ref());
        }
        Primitive::Dict => {
            arity(name, &args, 0, 1)?;
            let mut table = Table::default();
            if let Some(source) = args.first() {
                update_table(interp, &mut table, source)?;
            }
            for (key, value) in kwargs.into_items() {
                table.insert_value(Value::new_str(key)?, value)?;
            }
            return Value::new_dict(table);
        }
        _ => kwargs.finish(name)?,
    }

    match primitive {
        Primitive::Abs => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Float(f) => Ok(Value::Float(f.abs())),
                value => match value.as_int() {
                    Some(i) => i.checked_abs().map(Value::Int).ok_or_else(overflow_error),
                    None => Err(type_error(format!(
                        "bad operand type for abs(): '{}'",
                        value.type_name()
                    ))),
                },
            }
        }
        Primitive::All | Primitive::Any => {
            arity(name, &args, 1, 1)?;
            let want = primitive == Primitive::Any;
            let mut iter = iterate(&args[0])?;
            while let Some(item) = iter.next()? {
                interp.checkpoint()?;
                if item.truthy() == want {
                    return Ok(Value::Bool(want));
                }
            }
            Ok(Value::Bool(!want))
        }
        Primitive::Bool => {
            arity(name, &args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
        }
        Primitive::Chr => {
            arity(name, &args, 1, 1)?;
            let code = int_arg(&args[0])?;
            u32::try_from(code)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| value_error("chr() arg not in range(0x110000)"))
                .and_then(|ch| Value::new_str(ch.to_string()))
        }
        Primitive::Divmod => {
            arity(name, &args, 2, 2)?;
            let quotient = ops::binary(BinOpKind::FloorDiv, &args[0], &args[1])?;
            let remainder = ops::binary(BinOpKind::Mod, &args[0], &args[1])?;
            Value::new_tuple(vec![quotient, remainder])
        }
        Primitive::Float => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Float(f)) => Ok(Value::Float(*f)),
                Some(Value::Str(text)) => parse_float(text.as_str()).map(Value::Float),
                Some(value) => value.as_float().map(Value::Float).ok_or_else(|| {
                    type_error(format!(
                        "float() argument must be a string or a real number, not '{}'",
                        value.type_name()
                    ))
                }),
            }
        }
        Primitive::Format => {
            arity(name, &args, 1, 2)?;
            let spec = match args.get(1) {
                Some(Value::Str(spec)) => spec.as_str().to_string(),
                Some(other) => {
                    return Err(type_error(format!(
                        "format() argument 2 must be str, not {}",
                        other.type_name()
                    )))
                }
                None => String::new(),
            };
            Value::new_str(format_value(&args[0], &spec)?)
        }
        Primitive::Hex | Primitive::Oct => {
            arity(name, &args, 1, 1)?;
            let i = int_arg(&args[0])?;
            let digits = if primitive == Primitive::Hex {
                format!("0x{:x}", i.unsigned_abs())
            } else {
                format!("0o{:o}", i.unsigned_abs())
            };
            Value::new_str(if i < 0 { format!("-{}", digits) } else { digits })
        }
        Primitive::Len => {
            arity(name, &args, 1, 1)?;
            let len = match &args[0] {
                Value::Str(text) => text.as_str().chars().count(),
                Value::Bytes(bytes) => bytes.len(),
                Value::List(list) => list.borrow().len(),
                Value::Tuple(tuple) => tuple.items().len(),
                Value::Dict(dict) | Value::Set(dict) => dict.borrow().len(),
                Value::Range(range) => range.len(),
                other => {
                    return Err(type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )))
                }
            };
            Ok(Value::Int(i64::try_from(len).map_err(|_| overflow_error())?))
        }
        Primitive::List | Primitive::Tuple | Primitive::Set => {
            arity(name, &args, 0, 1)?;
            let items = match args.first() {
                Some(source) => interp.collect(source)?,
                None => Vec::new(),
            };
            match primitive {
                Primitive::List => Value::new_list(items),
                Primitive::Tuple => Value::new_tuple(items),
                _ => {
                    let mut table = Table::default();
                    for item in items {
                        table.insert_value(item, Value::None)?;
                    }
                    Value::new_set(table)
                }
            }
        }
        Primitive::Ord => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Str(text) => {
                    let mut chars = text.as_str().chars();
                    match (chars.next(), chars.next()) {
                        (Some(ch), None) => Ok(Value::Int(i64::from(u32::from(ch)))),
                        _ => Err(type_error(format!(
                            "ord() expected a character, but string of length {} found",
                            text.as_str().chars().count()
                        ))),
                    }
                }
                Value::Bytes(bytes) if bytes.len() == 1 => Ok(Value::Int(i64::from(bytes[0]))),
                other => Err(type_error(format!(
                    "ord() expected string of length 1, but {} found",
                    other.type_name()
                ))),
            }
        }
        Primitive::Pow => {
            arity(name, &args, 2, 3)?;
            match args.get(2) {
                None | Some(Value::None) => ops::binary(BinOpKind::Pow, &args[0], &args[1]),
                Some(modulus) => modular_pow(&args[0], &args[1], modulus),
            }
        }
        Primitive::Range => {
            arity(name, &args, 1, 3)?;
            let bounds = args.iter().map(int_arg).collect::<Eval<Vec<_>>>()?;
            let range = match bounds.as_slice() {
                [stop] => RangeValue {
                    start: 0,
                    stop: *stop,
                    step: 1,
                },
                [start, stop] => RangeValue {
                    start: *start,
                    stop: *stop,
                    step: 1,
                },
                [start, stop, step] => {
                    if *step == 0 {
                        return Err(value_error("range() arg 3 must not be zero"));
                    }
                    RangeValue {
                        start: *start,
                        stop: *stop,
                        step: *step,
                    }
                }
                _ => return Err(type_error("range expected at most 3 arguments")),
            };
            Ok(Value::Range(range))
        }
        Primitive::Repr => {
            arity(name, &args, 1, 1)?;
            Value::new_str(args[0].repr())
        }
        Primitive::Reversed => {
            arity(name, &args, 1, 1)?;
            reversed(&args[0])
        }
        Primitive::Str => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                Some(value) => Value::new_str(value.to_str()),
                None => Value::new_str(""),
            }
        }
        Primitive::Zip => {
            let iters = args.iter().map(iterate).collect::<Eval<Vec<_>>>()?;
            Ok(Value::new_iterator(Iter::Zip(iters)))
        }
        Primitive::Print
        | Primitive::Sorted
        | Primitive::Max
        | Primitive::Min
        | Primitive::Int
        | Primitive::Enumerate
        | Primitive::Sum
        | Primitive::Round
        | Primitive::Dict => Err(Exception::new(
            "RuntimeError",
            format!("{}() dispatched twice", name),
        )),
    }
}

fn print(interp: &mut Interpreter, args: &[Value], mut kwargs: Kwargs) -> Eval<Value> {
    let mut separator = |name: &str, default: &str| -> Eval<String> {
        match kwargs.take(name) {
            None | Some(Value::None) => Ok(default.to_string()),
            Some(Value::Str(text)) => Ok(text.as_str().to_string()),
            Some(other) => Err(type_error(format!(
                "{} must be None or a string, not {}",
                name,
                other.type_name()
            ))),
        }
    };
    let sep = separator("sep", " ")?;
    let end = separator("end", "\n")?;
    let _ = kwargs.take("flush");
    kwargs.finish("print")?;

    let mut line = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            line.push_str(&sep);
        }
        line.push_str(&arg.to_str());
    }
    line.push_str(&end);
    interp.write_stdout(&line)?;
    Ok(Value::None)
}

fn extreme(
    interp: &mut Interpreter,
    name: &str,
    args: Vec<Value>,
    mut kwargs: Kwargs,
    want: Ordering,
) -> Eval<Value> {
    let key = kwargs.take("key").filter(|key| !matches!(key, Value::None));
    let default = kwargs.take("default");
    kwargs.finish(name)?;

    let items = match args.len() {
        0 => {
            return Err(type_error(format!(
                "{} expected at least 1 argument, got 0",
                name
            )))
        }
        1 => interp.collect(&args[0])?,
        _ if default.is_some() => {
            return Err(type_error(format!(
                "Cannot specify a default for {}() with multiple positional arguments",
                name
            )))
        }
        _ => args,
    };

    let mut best: Option<(Value, Value)> = None;
    for item in items {
        interp.checkpoint()?;
        let rank = match &key {
            Some(key) => interp.call(key, vec![item.clone()], Vec::new())?,
            None => item.clone(),
        };
        let replace = match &best {
            None => true,
            Some((_, best_rank)) => py_partial_cmp(&rank, best_rank)? == Some(want),
        };
        if replace {
            best = Some((item, rank));
        }
    }
    match best {
        Some((item, _)) => Ok(item),
        None => {
            default.ok_or_else(|| value_error(format!("{}() arg is an empty sequence", name)))
        }
    }
}

fn sum(interp: &mut Interpreter, iterable: &Value, start: Value) -> Eval<Value> {
    if matches!(start, Value::Str(_)) {
        return Err(type_error(
            "sum() can't sum strings [use ''.join(seq) instead]",
        ));
    }
    let mut total = start;
    let mut iter = iterate(iterable)?;
    while let Some(item) = iter.next()? {
        interp.checkpoint()?;
        total = ops::binary(BinOpKind::Add, &total, &item)?;
    }
    Ok(total)
}

/// Stable sort by `key`; comparison errors propagate
pub(super) fn sort_values(
    interp: &mut Interpreter,
    items: Vec<Value>,
    key: Option<&Value>,
    reverse: bool,
) -> Eval<Vec<Value>> {
    let keys = match key {
        Some(key) => {
            let mut keys = Vec::with_capacity(items.len());
            for item in &items {
                keys.push(interp.call(key, vec![item.clone()], Vec::new())?);
            }
            keys
        }
        None => items.clone(),
    };
    let mut order: Vec<usize> = (0..items.len()).collect();
    merge_sort(&mut order, |&a, &b| {
        let (left, right) = if reverse {
            (&keys[b], &keys[a])
        } else {
            (&keys[a], &keys[b])
        };
        Ok(py_partial_cmp(left, right)? == Some(Ordering::Less))
    })?;
    Ok(order.into_iter().map(|i| items[i].clone()).collect())
}

/// Bottom-up merge sort with a fallible comparison
fn merge_sort<T: Clone>(
    items: &mut Vec<T>,
    mut less: impl FnMut(&T, &T) -> Eval<bool>,
) -> Eval<()> {
    let len = items.len();
    let mut buffer = Vec::with_capacity(len);
    let mut width = 1;
    while width < len {
        buffer.clear();
        let mut start = 0;
        while start < len {
            let mid = (start + width).min(len);
            let end = (start + 2 * width).min(len);
            let (mut i, mut j) = (start, mid);
            while i < mid && j < end {
                if less(&items[j], &items[i])? {
                    buffer.push(items[j].clone());
                    j += 1;
                } else {
                    buffer.push(items[i].clone());
                    i += 1;
                }
            }
            buffer.extend_from_slice(&items[i..mid]);
            buffer.extend_from_slice(&items[j..end]);
            start = end;
        }
        std::mem::swap(items, &mut buffer);
        width *= 2;
    }
    Ok(())
}

/// Merge a mapping or an iterable of pairs into `table`
pub(super) fn update_table(
    interp: &mut Interpreter,
    table: &mut Table,
    source: &Value,
) -> Eval<()> {
    if let Value::Dict(dict) = source {
        for (key, value) in dict.borrow().iter() {
            table.insert_value(key.clone(), value.clone())?;
        }
        return Ok(());
    }
    for (index, pair) in interp.collect(source)?.iter().enumerate() {
        let items = interp.collect(pair)?;
        let [key, value] = <[Value; 2]>::try_from(items).map_err(|items| {
            value_error(format!(
                "dictionary update sequence element #{} has length {}; 2 is required",
                index,
                items.len()
            ))
        })?;
        table.insert_value(key, value)?;
    }
    Ok(())
}

fn int(value: Option<&Value>, base: Option<&Value>) -> Eval<Value> {
    let Some(value) = value else {
        return Ok(Value::Int(0));
    };
    if let Some(base) = base {
        let Value::Str(text) = value else {
            return Err(type_error("int() can't convert non-string with explicit base"));
        };
        let base = int_arg(base)?;
        if base != 0 && !(2..=36).contains(&base) {
            return Err(value_error("int() base must be >= 2 and <= 36, or 0"));
        }
        return parse_int(text.as_str(), base as u32).map(Value::Int);
    }
    match value {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Float(f) => float_to_int(f.trunc()).map(Value::Int),
        Value::Str(text) => parse_int(text.as_str(), 10).map(Value::Int),
        other => Err(type_error(format!(
            "int() argument must be a string, a bytes-like object or a real number, not '{}'",
            other.type_name()
        ))),
    }
}

fn parse_int(text: &str, base: u32) -> Eval<i64> {
    let invalid = || {
        value_error(format!(
            "invalid literal for int() with base {}: {}",
            base,
            str_repr(text)
        ))
    };
    let trimmed = text.trim();
    let (negative, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let lowered = unsigned.to_ascii_lowercase();
    let prefixed = |prefix: &str| lowered.strip_prefix(prefix).map(|rest| rest.trim_start_matches('_'));
    let (radix, body) = match base {
        0 | 16 if lowered.starts_with("0x") => (16, prefixed("0x").unwrap_or_default()),
        0 | 8 if lowered.starts_with("0o") => (8, prefixed("0o").unwrap_or_default()),
        0 | 2 if lowered.starts_with("0b") => (2, prefixed("0b").unwrap_or_default()),
        0 => (10, lowered.as_str()),
        base => (base, lowered.as_str()),
    };
    if body.is_empty() || body.starts_with('_') || body.ends_with('_') || body.contains("__") {
        return Err(invalid());
    }
    let digits: String = body.chars().filter(|c| *c != '_').collect();
    if !digits.chars().all(|c| c.is_digit(radix)) {
        return Err(invalid());
    }
    let magnitude = i128::from_str_radix(&digits, radix)
        .map_err(|_| Exception::new("OverflowError", "int too large for the sandbox"))?;
    let value = if negative { -magnitude } else { magnitude };
    i64::try_from(value).map_err(|_| overflow_error())
}

fn parse_float(text: &str) -> Eval<f64> {
    let invalid = || {
        value_error(format!(
            "could not convert string to float: {}",
            str_repr(text)
        ))
    };
    let trimmed = text.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    for (i, ch) in chars.iter().enumerate() {
        if *ch == '_' {
            let between_digits = i > 0
                && chars[i - 1].is_ascii_digit()
                && chars.get(i + 1).is_some_and(char::is_ascii_digit);
            if !between_digits {
                return Err(invalid());
            }
        }
    }
    let cleaned: String = chars.into_iter().filter(|c| *c != '_').collect();
    cleaned.parse::<f64>().map_err(|_| invalid())
}

pub(super) fn float_to_int(f: f64) -> Eval<i64> {
    if f.is_nan() {
        return Err(value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(Exception::new(
            "OverflowError",
            "cannot convert float infinity to integer",
        ));
    }
    if f >= -9_223_372_036_854_775_808.0 && f < 9_223_372_036_854_775_808.0 {
        Ok(f as i64)
    } else {
        Err(overflow_error())
    }
}

fn round(value: &Value, ndigits: Option<&Value>) -> Eval<Value> {
    let ndigits = ndigits.map(int_arg).transpose()?;
    match (value, ndigits) {
        (Value::Float(f), None) => float_to_int(f.round_ties_even()).map(Value::Int),
        (Value::Float(f), Some(n)) => Ok(Value::Float(round_float(*f, n))),
        (value, ndigits) if value.as_int().is_some() => {
            let i = value.as_int().unwrap_or_default();
            match ndigits {
                Some(n) if n < 0 => round_int(i, n).map(Value::Int),
                _ => Ok(Value::Int(i)),
            }
        }
        (other, _) => Err(type_error(format!(
            "type {} doesn't define __round__ method",
            other.type_name()
        ))),
    }
}

fn round_float(f: f64, ndigits: i64) -> f64 {
    if !f.is_finite() || ndigits > 308 {
        return f;
    }
    if ndigits < -308 {
        return 0.0 * f.signum();
    }
    if ndigits >= 0 {
        // Decimal formatting rounds the exact binary value, not a scaled copy
        let precision = ndigits.unsigned_abs() as usize;
        return format!("{:.*}", precision, f).parse().unwrap_or(f);
    }
    let factor = 10f64.powi(ndigits.unsigned_abs() as i32);
    (f / factor).round_ties_even() * factor
}

fn round_int(i: i64, ndigits: i64) -> Eval<i64> {
    let Some(unit) = u32::try_from(ndigits.unsigned_abs())
        .ok()
        .and_then(|exponent| 10i64.checked_pow(exponent))
    else {
        return Ok(0);
    };
    let mut quotient = i.div_euclid(unit);
    let twice = i.rem_euclid(unit) * 2;
    if twice > unit || (twice == unit && quotient % 2 != 0) {
        quotient += 1;
    }
    quotient.checked_mul(unit).ok_or_else(overflow_error)
}

fn modular_pow(base: &Value, exponent: &Value, modulus: &Value) -> Eval<Value> {
    let (Some(base), Some(exponent), Some(modulus)) =
        (base.as_int(), exponent.as_int(), modulus.as_int())
    else {
        return Err(type_error(
            "pow() 3rd argument not allowed unless all arguments are integers",
        ));
    };
    if modulus == 0 {
        return Err(value_error("pow() 3rd argument cannot be 0"));
    }
    if exponent < 0 {
        return Err(value_error(
            "pow() 2nd argument cannot be negative when 3rd argument specified",
        ));
    }
    let m = i128::from(modulus).abs();
    let mut result: i128 = 1 % m;
    let mut square = i128::from(base).rem_euclid(m);
    let mut exponent = exponent;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result * square % m;
        }
        square = square * square % m;
        exponent >>= 1;
    }
    if modulus < 0 && result != 0 {
        result -= m;
    }
    i64::try_from(result)
        .map(Value::Int)
        .map_err(|_| overflow_error())
}

fn reversed(value: &Value) -> Eval<Value> {
    let items: Vec<Value> = match value {
        Value::List(list) => list.borrow().iter().rev().cloned().collect(),
        Value::Tuple(tuple) => tuple.items().iter().rev().cloned().collect(),
        Value::Str(text) => {
            check_available(text.as_str().len() * 2)?;
            text.as_str()
                .chars()
                .rev()
                .map(|ch| Value::new_str(ch.to_string()))
                .collect::<Eval<Vec<_>>>()?
        }
        Value::Dict(dict) => {
            let mut keys = dict.borrow().keys();
            keys.reverse();
            keys
        }
        Value::Range(range) => {
            let len = range.len();
            if len == 0 {
                return Ok(Value::new_iterator(Iter::Values(Vec::new().into_iter())));
            }
            let last = range.get(len - 1).ok_or_else(overflow_error)?;
            let step = range.step.checked_neg().ok_or_else(overflow_error)?;
            return Ok(Value::new_iterator(Iter::Range {
                next: last,
                remaining: len,
                step,
            }));
        }
        other => {
            return Err(type_error(format!(
                "'{}' object is not reversible",
                other.type_name()
            )))
        }
    };
    Ok(Value::new_iterator(Iter::Values(items.into_iter())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(text: &str) -> Value {
        Value::new_str(text).unwrap()
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int(" 42 ", 10).unwrap(), 42);
        assert_eq!(parse_int("-1_000", 10).unwrap(), -1000);
        assert_eq!(parse_int("0xff", 0).unwrap(), 255);
        assert_eq!(parse_int("ff", 16).unwrap(), 255);
        assert_eq!(parse_int("0b101", 2).unwrap(), 5);
        let error = parse_int("12a", 10).unwrap_err();
        assert_eq!(error.message, "invalid literal for int() with base 10: '12a'");
        assert!(parse_int("1__0", 10).is_err());
        assert_eq!(parse_int("99999999999999999999", 10).unwrap_err().kind, "OverflowError");
    }

    #[test]
    fn test_parse_float() {
        assert_eq!(parse_float("1.5").unwrap(), 1.5);
        assert_eq!(parse_float(" -2e3 ").unwrap(), -2000.0);
        assert_eq!(parse_float("1_000.25").unwrap(), 1000.25);
        assert!(parse_float("inf").unwrap().is_infinite());
        assert!(parse_float("abc").is_err());
        assert!(parse_float("1__0").is_err());
    }

    #[test]
    fn test_rounding_is_bankers() {
        assert!(matches!(round(&Value::Float(2.5), None).unwrap(), Value::Int(2)));
        assert!(matches!(round(&Value::Float(3.5), None).unwrap(), Value::Int(4)));
        assert!(matches!(round(&Value::Float(-0.5), None).unwrap(), Value::Int(0)));
        assert!(matches!(
            round(&Value::Int(1250), Some(&Value::Int(-2))).unwrap(),
            Value::Int(1200)
        ));
        assert!(matches!(
            round(&Value::Int(1350), Some(&Value::Int(-2))).unwrap(),
            Value::Int(1400)
        ));
        match round(&Value::Float(3.14159), Some(&Value::Int(2))).unwrap() {
            Value::Float(f) => assert!((f - 3.14).abs() < 1e-12),
            other => panic!("unexpected {:?}", other),
        }
        assert!(round(&Value::Float(f64::NAN), None).is_err());
    }

    #[test]
    fn test_rounding_uses_exact_binary_value() {
        assert_eq!(round_float(2.675, 2), 2.67);
        assert_eq!(round_float(1.005, 2), 1.0);
        assert_eq!(round_float(0.375, 2), 0.38);
        assert_eq!(round_float(123.456, 0), 123.0);
        assert_eq!(round_float(1e300, 5), 1e300);
        assert_eq!(round_float(1234.5, -2), 1200.0);
        assert!(round_float(-0.001, 2).is_sign_negative());
    }

    #[test]
    fn test_modular_pow() {
        let result = modular_pow(&Value::Int(3), &Value::Int(200), &Value::Int(13)).unwrap();
        assert!(matches!(result, Value::Int(9)));
        let result = modular_pow(&Value::Int(2), &Value::Int(3), &Value::Int(-3)).unwrap();
        assert!(matches!(result, Value::Int(-1)));
        assert!(modular_pow(&Value::Int(2), &Value::Int(3), &Value::Int(0)).is_err());
    }

    #[test]
    fn test_merge_sort_is_stable_and_fallible() {
        let mut items = vec![(2, 'a'), (1, 'b'), (2, 'c'), (1, 'd'), (0, 'e')];
        merge_sort(&mut items, |a, b| Ok(a.0 < b.0)).unwrap();
        assert_eq!(
            items,
            vec![(0, 'e'), (1, 'b'), (1, 'd'), (2, 'a'), (2, 'c')]
        );

        let mut mixed = vec![s("a"), Value::Int(1)];
        let result = merge_sort(&mut mixed, |a, b| {
            Ok(py_partial_cmp(a, b)? == Some(Ordering::Less))
        });
        assert_eq!(result.unwrap_err().kind, "TypeError");
    }

    #[test]
    fn test_kwargs_reject_leftovers() {
        let mut kwargs = Kwargs::new(vec![("key".into(), Value::None), ("bogus".into(), Value::None)]);
        assert!(kwargs.take("key").is_some());
        let error = kwargs.finish("sorted").unwrap_err();
        assert_eq!(error.message, "'bogus' is an invalid keyword argument for sorted()");
    }

    #[test]
    fn test_arity_messages() {
        let error = arity("len", &[], 1, 1).unwrap_err();
        assert_eq!(error.message, "len() takes exactly 1 argument (0 given)");
        let error = arity("range", &vec![Value::None, Value::None, Value::None, Value::None], 1, 3).unwrap_err();
        assert_eq!(error.message, "range() takes at most 3 arguments (4 given)");
    }
}
