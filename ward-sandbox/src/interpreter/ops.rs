//! Operators

use super::format::percent_format;
use super::meter::check_available;
use super::value::{
    iterate, overflow_error, py_eq, py_partial_cmp, type_error, value_error, zero_division, Eval,
    Exception, Table, Value, SLOT,
};
use crate::lang::ast::{BinOpKind, CmpOpKind, UnaryOpKind};
use std::cmp::Ordering;

fn unsupported(op: &str, left: &Value, right: &Value) -> Exception {
    type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op,
        left.type_name(),
        right.type_name()
    ))
}

pub fn binary(op: BinOpKind, left: &Value, right: &Value) -> Eval<Value> {
    if let (Value::Bool(a), Value::Bool(b)) = (left, right) {
        match op {
            BinOpKind::BitAnd => return Ok(Value::Bool(*a & *b)),
            BinOpKind::BitOr => return Ok(Value::Bool(*a | *b)),
            BinOpKind::BitXor => return Ok(Value::Bool(*a ^ *b)),
            _ => {}
        }
    }
    if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
        return int_op(op, a, b).map_err(|error| {
            if error.kind == "TypeError" {
                unsupported(op.symbol(), left, right)
            } else {
                error
            }
        });
    }
    if let (Some(a), Some(b)) = (left.as_float(), right.as_float()) {
        return float_op(op, a, b).map_err(|error| {
            if error.kind == "TypeError" {
                unsupported(op.symbol(), left, right)
            } else {
                error
            }
        });
    }

    match (op, left, right) {
        (BinOpKind::Add, Value::Str(a), Value::Str(b)) => {
            check_available(a.as_str().len() + b.as_str().len())?;
            let mut text = String::with_capacity(a.as_str().len() + b.as_str().len());
            text.push_str(a.as_str());
            text.push_str(b.as_str());
            Value::new_str(text)
        }
        (BinOpKind::Mult, Value::Str(text), count) | (BinOpKind::Mult, count, Value::Str(text))
            if count.as_int().is_some() =>
        {
            let count = repeat_count(count);
            let size = text
                .as_str()
                .len()
                .checked_mul(count)
                .ok_or_else(Exception::memory)?;
            check_available(size)?;
            Value::new_str(text.as_str().repeat(count))
        }
        (BinOpKind::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Value::new_list(items)
        }
        (BinOpKind::Add, Value::Tuple(a), Value::Tuple(b)) => {
            let mut items = a.items().to_vec();
            items.extend(b.items().iter().cloned());
            Value::new_tuple(items)
        }
        (BinOpKind::Mult, Value::List(list), count) | (BinOpKind::Mult, count, Value::List(list))
            if count.as_int().is_some() =>
        {
            let items = repeat_items(&list.borrow(), repeat_count(count))?;
            Value::new_list(items)
        }
        (BinOpKind::Mult, Value::Tuple(tuple), count)
        | (BinOpKind::Mult, count, Value::Tuple(tuple))
            if count.as_int().is_some() =>
        {
            let items = repeat_items(tuple.items(), repeat_count(count))?;
            Value::new_tuple(items)
        }
        (BinOpKind::Mod, Value::Str(template), args) => {
            Value::new_str(percent_format(template.as_str(), args)?)
        }
        (
            BinOpKind::BitOr | BinOpKind::BitAnd | BinOpKind::Sub | BinOpKind::BitXor,
            Value::Set(a),
            Value::Set(b),
        ) => {
            let (a, b) = (a.borrow(), b.borrow());
            let mut table = Table::default();
            for (key, _) in a.iter() {
                let hash = key.hash_key()?;
                let keep = match op {
                    BinOpKind::BitAnd => b.contains(&hash),
                    BinOpKind::Sub | BinOpKind::BitXor => !b.contains(&hash),
                    _ => true,
                };
                if keep {
                    table.insert(hash, key.clone(), Value::None);
                }
            }
            if matches!(op, BinOpKind::BitOr | BinOpKind::BitXor) {
                for (key, _) in b.iter() {
                    let hash = key.hash_key()?;
                    if op == BinOpKind::BitOr || !a.contains(&hash) {
                        table.insert(hash, key.clone(), Value::None);
                    }
                }
            }
            Value::new_set(table)
        }
        (BinOpKind::BitOr, Value::Dict(a), Value::Dict(b)) => {
            let mut table = a.borrow().clone();
            for (key, value) in b.borrow().iter() {
                table.insert_value(key.clone(), value.clone())?;
            }
            Value::new_dict(table)
        }
        _ => Err(unsupported(op.symbol(), left, right)),
    }
}

fn repeat_count(count: &Value) -> usize {
    count
        .as_int()
        .map_or(0, |count| usize::try_from(count).unwrap_or(0))
}

fn repeat_items(items: &[Value], count: usize) -> Eval<Vec<Value>> {
    let total = items.len().checked_mul(count).ok_or_else(Exception::memory)?;
    check_available(total.saturating_mul(SLOT))?;
    let mut out = Vec::with_capacity(total);
    for _ in 0..count {
        out.extend(items.iter().cloned());
    }
    Ok(out)
}

fn int_op(op: BinOpKind, a: i64, b: i64) -> Eval<Value> {
    let result = match op {
        BinOpKind::Add => a.checked_add(b),
        BinOpKind::Sub => a.checked_sub(b),
        BinOpKind::Mult => a.checked_mul(b),
        BinOpKind::Div => {
            if b == 0 {
                return Err(zero_division("division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinOpKind::FloorDiv => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            floor_div(a, b)
        }
        BinOpKind::Mod => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            floor_mod(a, b)
        }
        BinOpKind::Pow => {
            if b < 0 {
                if a == 0 {
                    return Err(zero_division("0.0 cannot be raised to a negative power"));
                }
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            u32::try_from(b).ok().and_then(|b| a.checked_pow(b))
        }
        BinOpKind::LShift => {
            if b < 0 {
                return Err(value_error("negative shift count"));
            }
            if a == 0 {
                Some(0)
            } else if b >= 63 {
                None
            } else {
                let shifted = a << b;
                (shifted >> b == a).then_some(shifted)
            }
        }
        BinOpKind::RShift => {
            if b < 0 {
                return Err(value_error("negative shift count"));
            }
            Some(if b >= 64 { if a < 0 { -1 } else { 0 } } else { a >> b })
        }
        BinOpKind::BitOr => Some(a | b),
        BinOpKind::BitXor => Some(a ^ b),
        BinOpKind::BitAnd => Some(a & b),
        BinOpKind::MatMult => return Err(type_error("unsupported operand")),
    };
    result.map(Value::Int).ok_or_else(overflow_error)
}

fn floor_div(a: i64, b: i64) -> Option<i64> {
    let quotient = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        quotient.checked_sub(1)
    } else {
        Some(quotient)
    }
}

fn floor_mod(a: i64, b: i64) -> Option<i64> {
    let remainder = a.checked_rem(b)?;
    if remainder != 0 && ((remainder < 0) != (b < 0)) {
        remainder.checked_add(b)
    } else {
        Some(remainder)
    }
}

fn float_op(op: BinOpKind, a: f64, b: f64) -> Eval<Value> {
    let result = match op {
        BinOpKind::Add => a + b,
        BinOpKind::Sub => a - b,
        BinOpKind::Mult => a * b,
        BinOpKind::Div => {
            if b == 0.0 {
                return Err(zero_division("float division by zero"));
            }
            a / b
        }
        BinOpKind::FloorDiv => {
            if b == 0.0 {
                return Err(zero_division("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinOpKind::Mod => {
            if b == 0.0 {
                return Err(zero_division("float modulo"));
            }
            let remainder = a % b;
            if remainder != 0.0 && ((remainder < 0.0) != (b < 0.0)) {
                remainder + b
            } else {
                remainder
            }
        }
        BinOpKind::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(zero_division("0.0 cannot be raised to a negative power"));
            }
            if a < 0.0 && b.fract() != 0.0 {
                return Err(value_error("complex results are not supported"));
            }
            let result = a.powf(b);
            if result.is_infinite() && a.is_finite() && b.is_finite() {
                return Err(Exception::new("OverflowError", "numerical result out of range"));
            }
            result
        }
        _ => return Err(type_error("unsupported operand")),
    };
    Ok(Value::Float(result))
}

pub fn unary(op: UnaryOpKind, operand: &Value) -> Eval<Value> {
    match (op, operand) {
        (UnaryOpKind::Not, value) => Ok(Value::Bool(!value.truthy())),
        (UnaryOpKind::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOpKind::Neg, value) if value.as_int().is_some() => value
            .as_int()
            .and_then(i64::checked_neg)
            .map(Value::Int)
            .ok_or_else(overflow_error),
        (UnaryOpKind::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
        (UnaryOpKind::Pos, value) if value.as_int().is_some() => {
            Ok(Value::Int(value.as_int().unwrap_or_default()))
        }
        (UnaryOpKind::Invert, value) if value.as_int().is_some() => {
            Ok(Value::Int(!value.as_int().unwrap_or_default()))
        }
        (op, value) => {
            let symbol = match op {
                UnaryOpKind::Neg => "unary -",
                UnaryOpKind::Pos => "unary +",
                _ => "unary ~",
            };
            Err(type_error(format!(
                "bad operand type for {}: '{}'",
                symbol,
                value.type_name()
            )))
        }
    }
}

pub fn compare(op: CmpOpKind, left: &Value, right: &Value) -> Eval<bool> {
    let ordering = |expected: &[Ordering]| -> Eval<bool> {
        let ordering = py_partial_cmp(left, right).map_err(|_| {
            type_error(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                op.symbol(),
                left.type_name(),
                right.type_name()
            ))
        })?;
        Ok(ordering.is_some_and(|ordering| expected.contains(&ordering)))
    };
    match op {
        CmpOpKind::Eq => Ok(py_eq(left, right)),
        CmpOpKind::NotEq => Ok(!py_eq(left, right)),
        CmpOpKind::Lt => ordering(&[Ordering::Less]),
        CmpOpKind::LtE => ordering(&[Ordering::Less, Ordering::Equal]),
        CmpOpKind::Gt => ordering(&[Ordering::Greater]),
        CmpOpKind::GtE => ordering(&[Ordering::Greater, Ordering::Equal]),
        CmpOpKind::Is => Ok(left.is(right)),
        CmpOpKind::IsNot => Ok(!left.is(right)),
        CmpOpKind::In => contains(right, left),
        CmpOpKind::NotIn => contains(right, left).map(|found| !found),
    }
}

/// `item in container`
pub fn contains(container: &Value, item: &Value) -> Eval<bool> {
    match container {
        Value::Str(text) => match item {
            Value::Str(needle) => Ok(text.as_str().contains(needle.as_str())),
            other => Err(type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(list) => Ok(list.borrow().iter().any(|value| py_eq(value, item))),
        Value::Tuple(tuple) => Ok(tuple.items().iter().any(|value| py_eq(value, item))),
        Value::Dict(dict) | Value::Set(dict) => Ok(dict.borrow().contains(&item.hash_key()?)),
        Value::Range(range) => Ok(match item {
            Value::Float(f) if f.fract() != 0.0 => false,
            other => match other.as_float() {
                Some(f) => {
                    let target = f as i64;
                    let offset = i128::from(target) - i128::from(range.start);
                    let step = i128::from(range.step);
                    offset % step == 0
                        && usize::try_from(offset / step).is_ok_and(|index| index < range.len())
                }
                None => false,
            },
        }),
        Value::Bytes(bytes) => match item.as_int() {
            Some(byte) => Ok(u8::try_from(byte).is_ok_and(|byte| bytes.contains(&byte))),
            None => Err(type_error("a bytes-like object is required")),
        },
        Value::Iterator(_) => {
            let mut iter = iterate(container)?;
            while let Some(value) = iter.next()? {
                if py_eq(&value, item) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::value::RangeValue;

    fn s(text: &str) -> Value {
        Value::new_str(text).unwrap()
    }

    #[test]
    fn test_integer_semantics() {
        let run = |op, a, b| binary(op, &Value::Int(a), &Value::Int(b)).unwrap();
        assert!(matches!(run(BinOpKind::FloorDiv, -7, 2), Value::Int(-4)));
        assert!(matches!(run(BinOpKind::Mod, -7, 2), Value::Int(1)));
        assert!(matches!(run(BinOpKind::Mod, 7, -2), Value::Int(-1)));
        assert!(matches!(run(BinOpKind::Pow, 2, 10), Value::Int(1024)));
        assert!(matches!(run(BinOpKind::Div, 1, 2), Value::Float(f) if f == 0.5));
        assert!(matches!(run(BinOpKind::LShift, 1, 4), Value::Int(16)));
    }

    #[test]
    fn test_integer_errors() {
        let error = binary(BinOpKind::Mult, &Value::Int(i64::MAX), &Value::Int(2)).unwrap_err();
        assert_eq!(error.kind, "OverflowError");
        let error = binary(BinOpKind::Mod, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(error.kind, "ZeroDivisionError");
        let error = binary(BinOpKind::Add, &Value::Int(1), &s("a")).unwrap_err();
        assert_eq!(error.message, "unsupported operand type(s) for +: 'int' and 'str'");
    }

    #[test]
    fn test_sequence_operators() {
        let joined = binary(BinOpKind::Add, &s("ab"), &s("cd")).unwrap();
        assert_eq!(joined.to_str(), "abcd");
        let repeated = binary(BinOpKind::Mult, &Value::Int(3), &s("x")).unwrap();
        assert_eq!(repeated.to_str(), "xxx");
        let list = Value::new_list(vec![Value::Int(0)]).unwrap();
        let repeated = binary(BinOpKind::Mult, &list, &Value::Int(3)).unwrap();
        assert_eq!(repeated.repr(), "[0, 0, 0]");
        let formatted = binary(BinOpKind::Mod, &s("%d%%"), &Value::Int(50)).unwrap();
        assert_eq!(formatted.to_str(), "50%");
    }

    #[test]
    fn test_comparisons() {
        assert!(compare(CmpOpKind::Lt, &Value::Int(1), &Value::Float(1.5)).unwrap());
        assert!(compare(CmpOpKind::Eq, &Value::Int(1), &Value::Bool(true)).unwrap());
        assert!(compare(CmpOpKind::In, &s("b"), &s("abc")).unwrap());
        let error = compare(CmpOpKind::GtE, &s("a"), &Value::Int(1)).unwrap_err();
        assert!(error.message.starts_with("'>=' not supported"));
        let range = Value::Range(RangeValue { start: 0, stop: 10, step: 2 });
        assert!(contains(&range, &Value::Int(4)).unwrap());
        assert!(!contains(&range, &Value::Int(5)).unwrap());
    }

    #[test]
    fn test_unary() {
        assert!(matches!(unary(UnaryOpKind::Neg, &Value::Int(3)).unwrap(), Value::Int(-3)));
        assert!(matches!(unary(UnaryOpKind::Invert, &Value::Int(0)).unwrap(), Value::Int(-1)));
        assert!(unary(UnaryOpKind::Neg, &Value::Int(i64::MIN)).is_err());
        assert!(unary(UnaryOpKind::Neg, &s("a")).is_err());
    }
}
