//! Number rendering and the format-spec mini language

use super::builtins::float_to_int;
use super::value::{type_error, value_error, Eval, Exception, Value};
use std::collections::HashMap;

/// Shortest round-trip rendering, switching to exponent form outside
/// `1e-4 <= |x| < 1e16`
pub fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0.0".into() } else { "0.0".into() };
    }

    let scientific = format!("{:e}", f);
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();

    let mut out = String::new();
    if f < 0.0 {
        out.push('-');
    }
    if (-4..16).contains(&exponent) {
        if exponent >= 0 {
            let point = exponent as usize + 1;
            if digits.len() <= point {
                out.push_str(&digits);
                out.extend(std::iter::repeat('0').take(point - digits.len()));
                out.push_str(".0");
            } else {
                out.push_str(&digits[..point]);
                out.push('.');
                out.push_str(&digits[point..]);
            }
        } else {
            out.push_str("0.");
            out.extend(std::iter::repeat('0').take((-exponent - 1) as usize));
            out.push_str(&digits);
        }
    } else {
        out.push_str(&digits[..1]);
        if digits.len() > 1 {
            out.push('.');
            out.push_str(&digits[1..]);
        }
        out.push_str(&exponent_suffix(exponent, 'e'));
    }
    out
}

fn exponent_suffix(exponent: i32, marker: char) -> String {
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{}{}{:02}", marker, sign, exponent.abs())
}

#[derive(Debug, Clone, PartialEq)]
struct Spec {
    fill: char,
    align: Option<char>,
    sign: char,
    alternate: bool,
    zero: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

impl Default for Spec {
    fn default() -> Self {
        Self {
            fill: ' ',
            align: None,
            sign: '-',
            alternate: false,
            zero: false,
            width: 0,
            grouping: None,
            precision: None,
            kind: None,
        }
    }
}

fn parse_spec(text: &str) -> Eval<Spec> {
    let chars: Vec<char> = text.chars().collect();
    let mut spec = Spec::default();
    let mut i = 0;
    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');

    if chars.len() >= 2 && is_align(chars[1]) {
        spec.fill = chars[0];
        spec.align = Some(chars[1]);
        i = 2;
    } else if chars.first().copied().is_some_and(is_align) {
        spec.align = Some(chars[0]);
        i = 1;
    }
    if let Some(&c @ ('+' | '-' | ' ')) = chars.get(i) {
        spec.sign = c;
        i += 1;
    }
    if chars.get(i) == Some(&'#') {
        spec.alternate = true;
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        spec.zero = true;
        i += 1;
    }
    let start = i;
    while chars.get(i).is_some_and(char::is_ascii_digit) {
        i += 1;
    }
    if i > start {
        spec.width = parse_count(&chars[start..i])?;
    }
    if let Some(&c @ (',' | '_')) = chars.get(i) {
        spec.grouping = Some(c);
        i += 1;
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        let start = i;
        while chars.get(i).is_some_and(char::is_ascii_digit) {
            i += 1;
        }
        if i == start {
            return Err(value_error("Format specifier missing precision"));
        }
        spec.precision = Some(parse_count(&chars[start..i])?);
    }
    if let Some(&c) = chars.get(i) {
        spec.kind = Some(c);
        i += 1;
    }
    if i != chars.len() {
        return Err(value_error("Invalid format specifier"));
    }
    Ok(spec)
}

fn parse_count(digits: &[char]) -> Eval<usize> {
    let text: String = digits.iter().collect();
    match text.parse::<usize>() {
        Ok(count) if count <= 10_000 => Ok(count),
        _ => Err(value_error("Too many decimal digits in format string")),
    }
}

/// `format(value, spec)`
pub fn format_value(value: &Value, spec: &str) -> Eval<String> {
    if spec.is_empty() {
        return Ok(value.to_str());
    }
    let spec = parse_spec(spec)?;
    match value {
        Value::Str(text) => {
            if !matches!(spec.kind, None | Some('s')) {
                return Err(unknown_code(&spec, value));
            }
            let mut body: String = text.as_str().to_string();
            if let Some(precision) = spec.precision {
                body = body.chars().take(precision).collect();
            }
            Ok(pad(&spec, "", &body, '<'))
        }
        Value::Int(_) | Value::Bool(_) => {
            let i = value.as_int().unwrap_or_default();
            match spec.kind {
                Some('e' | 'E' | 'f' | 'F' | 'g' | 'G' | '%') => format_float(&spec, i as f64),
                None if matches!(value, Value::Bool(_)) && spec.width == 0 => Ok(value.to_str()),
                _ => format_int(&spec, i, value),
            }
        }
        Value::Float(f) => match spec.kind {
            None | Some('e' | 'E' | 'f' | 'F' | 'g' | 'G' | '%') => format_float(&spec, *f),
            _ => Err(unknown_code(&spec, value)),
        },
        other => {
            if spec.kind.is_some() || spec.precision.is_some() {
                return Err(type_error(format!(
                    "unsupported format string passed to {}.__format__",
                    other.type_name()
                )));
            }
            Ok(pad(&spec, "", &other.to_str(), '<'))
        }
    }
}

fn unknown_code(spec: &Spec, value: &Value) -> Exception {
    value_error(format!(
        "Unknown format code '{}' for object of type '{}'",
        spec.kind.unwrap_or(' '),
        value.type_name()
    ))
}

fn sign_prefix(spec: &Spec, negative: bool) -> &'static str {
    match (negative, spec.sign) {
        (true, _) => "-",
        (false, '+') => "+",
        (false, ' ') => " ",
        _ => "",
    }
}

fn format_int(spec: &Spec, i: i64, value: &Value) -> Eval<String> {
    let magnitude = i.unsigned_abs();
    let (digits, prefix) = match spec.kind {
        None | Some('d') | Some('n') => (group(&magnitude.to_string(), spec.grouping), ""),
        Some('x') => (format!("{:x}", magnitude), "0x"),
        Some('X') => (format!("{:X}", magnitude), "0X"),
        Some('o') => (format!("{:o}", magnitude), "0o"),
        Some('b') => (format!("{:b}", magnitude), "0b"),
        Some('c') => {
            let ch = u32::try_from(i)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| Exception::new("OverflowError", "%c arg not in range(0x110000)"))?;
            return Ok(pad(spec, "", &ch.to_string(), '<'));
        }
        _ => return Err(unknown_code(spec, value)),
    };
    let mut sign = sign_prefix(spec, i < 0).to_string();
    if spec.alternate && !prefix.is_empty() {
        sign.push_str(prefix);
    }
    Ok(pad(spec, &sign, &digits, '>'))
}


fn format_float(spec: &Spec, f: f64) -> Eval<String> {
    let negative = f.is_sign_negative() && !f.is_nan();
    let magnitude = f.abs();
    let upper = matches!(spec.kind, Some('E' | 'F' | 'G'));

    let body = if !magnitude.is_finite() {
        let text = if magnitude.is_nan() { "nan" } else { "inf" };
        if upper {
            text.to_uppercase()
        } else {
            text.to_string()
        }
    } else {
        match spec.kind {
            Some('f' | 'F') => fixed(magnitude, spec.precision.unwrap_or(6), spec.grouping),
            Some('e' | 'E') => {
                let text = scientific(magnitude, spec.precision.unwrap_or(6), 'e');
                if upper {
                    text.to_uppercase()
                } else {
                    text
                }
            }
            Some('%') => {
                let mut text = fixed(magnitude * 100.0, spec.precision.unwrap_or(6), spec.grouping);
                text.push('%');
                text
            }
            Some('g' | 'G') => {
                let text = general(magnitude, spec.precision.unwrap_or(6), spec.alternate);
                if upper {
                    text.to_uppercase()
                } else {
                    text
                }
            }
            _ => match spec.precision {
                Some(precision) => general(magnitude, precision, spec.alternate),
                None => {
                    let text = float_repr(magnitude);
                    match spec.grouping {
                        Some(separator) => match text.split_once('.') {
                            Some((whole, frac)) => {
                                format!("{}.{}", group(whole, Some(separator)), frac)
                            }
                            None => text,
                        },
                        None => text,
                    }
                }
            },
        }
    };
    Ok(pad(spec, sign_prefix(spec, negative), &body, '>'))
}

fn fixed(magnitude: f64, precision: usize, grouping: Option<char>) -> String {
    let text = format!("{:.*}", precision, magnitude);
    match text.split_once('.') {
        Some((whole, frac)) => format!("{}.{}", group(whole, grouping), frac),
        None => group(&text, grouping),
    }
}

fn scientific(magnitude: f64, precision: usize, marker: char) -> String {
    let text = format!("{:.*e}", precision, magnitude);
    let (mantissa, exponent) = text.split_once('e').unwrap_or((&text, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    format!("{}{}", mantissa, exponent_suffix(exponent, marker))
}

fn general(magnitude: f64, precision: usize, alternate: bool) -> String {
    let precision = precision.max(1);
    if magnitude == 0.0 {
        return if alternate {
            format!("{:.*}", precision - 1, 0.0)
        } else {
            "0".into()
        };
    }
    let probe = format!("{:.*e}", precision - 1, magnitude);
    let exponent: i32 = probe
        .split_once('e')
        .and_then(|(_, e)| e.parse().ok())
        .unwrap_or(0);
    let text = if exponent >= -4 && exponent < precision as i32 {
        format!("{:.*}", (precision as i32 - 1 - exponent).max(0) as usize, magnitude)
    } else {
        scientific(magnitude, precision - 1, 'e')
    };
    if alternate {
        return text;
    }
    // Trailing zeros are dropped from the mantissa
    match text.split_once('e') {
        Some((mantissa, exponent)) => format!("{}e{}", trim_zeros(mantissa), exponent),
        None => trim_zeros(&text).to_string(),
    }
}

fn trim_zeros(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

fn group(digits: &str, separator: Option<char>) -> String {
    let Some(separator) = separator else {
        return digits.to_string();
    };
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(separator);
        }
        out.push(ch);
    }
    out
}

fn pad(spec: &Spec, sign: &str, body: &str, default_align: char) -> String {
    let (fill, align) = match spec.align {
        Some(align) => (spec.fill, align),
        None if spec.zero && default_align == '>' => ('0', '='),
        None => (spec.fill, default_align),
    };
    let len = sign.chars().count() + body.chars().count();
    if len >= spec.width {
        return format!("{}{}", sign, body);
    }
    let padding = spec.width - len;
    let fill_str = |count: usize| std::iter::repeat(fill).take(count).collect::<String>();
    match align {
        '<' => format!("{}{}{}", sign, body, fill_str(padding)),
        '^' => format!(
            "{}{}{}{}",
            fill_str(padding / 2),
            sign,
            body,
            fill_str(padding - padding / 2)
        ),
        '=' => format!("{}{}{}", sign, fill_str(padding), body),
        _ => format!("{}{}{}", fill_str(padding), sign, body),
    }
}

/// `template % args`
pub fn percent_format(template: &str, args: &Value) -> Eval<String> {
    let values: Vec<Value> = match args {
        Value::Tuple(tuple) => tuple.items().to_vec(),
        other => vec![other.clone()],
    };
    let mut values = values.into_iter();
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        i += 1;
        let mut spec = Spec::default();
        while let Some(&flag @ ('-' | '+' | ' ' | '0' | '#')) = chars.get(i) {
            match flag {
                '-' => spec.align = Some('<'),
                '0' => spec.zero = true,
                '#' => spec.alternate = true,
                sign => spec.sign = sign,
            }
            i += 1;
        }
        let start = i;
        while chars.get(i).is_some_and(char::is_ascii_digit) {
            i += 1;
        }
        if i > start {
            spec.width = parse_count(&chars[start..i])?;
        }
        if chars.get(i) == Some(&'.') {
            i += 1;
            let start = i;
            while chars.get(i).is_some_and(char::is_ascii_digit) {
                i += 1;
            }
            spec.precision = Some(if i > start { parse_count(&chars[start..i])? } else { 0 });
        }
        let Some(&conversion) = chars.get(i) else {
            return Err(value_error("incomplete format"));
        };
        i += 1;
        if conversion == '%' {
            out.push('%');
            continue;
        }
        let value = values
            .next()
            .ok_or_else(|| type_error("not enough arguments for format string"))?;
        let piece = match conversion {
            's' => pad(&spec, "", &truncate(value.to_str(), spec.precision), '>'),
            'r' | 'a' => pad(&spec, "", &truncate(value.repr(), spec.precision), '>'),
            'd' | 'i' | 'u' => {
                let number = match &value {
                    Value::Float(f) => float_to_int(f.trunc())?,
                    other => other.as_int().ok_or_else(|| {
                        type_error(format!(
                            "%{} format: a real number is required, not {}",
                            conversion,
                            other.type_name()
                        ))
                    })?,
                };
                spec.kind = Some('d');
                format_int(&spec, number, &value)?
            }
            'x' | 'X' | 'o' => {
                let number = value.as_int().ok_or_else(|| {
                    type_error(format!(
                        "%{} format: an integer is required, not {}",
                        conversion,
                        value.type_name()
                    ))
                })?;
                spec.kind = Some(conversion);
                format_int(&spec, number, &value)?
            }
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' => {
                let number = value.as_float().ok_or_else(|| {
                    type_error(format!("must be real number, not {}", value.type_name()))
                })?;
                spec.kind = Some(conversion);
                format_float(&spec, number)?
            }
            'c' => {
                spec.kind = Some('c');
                match &value {
                    Value::Str(text) => pad(&spec, "", text.as_str(), '>'),
                    other => format_int(&spec, other.as_int().unwrap_or(-1), other)?,
                }
            }
            other => {
                return Err(value_error(format!(
                    "unsupported format character '{}'",
                    other
                )))
            }
        };
        out.push_str(&piece);
    }
    if values.next().is_some() {
        return Err(type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

fn truncate(text: String, precision: Option<usize>) -> String {
    match precision {
        Some(precision) => text.chars().take(precision).collect(),
        None => text,
    }
}

/// `template.format(*args, **kwargs)`
pub fn str_format(
    template: &str,
    args: &[Value],
    kwargs: &HashMap<String, Value>,
) -> Eval<String> {
    format_fields(template, args, kwargs, &mut 0)
}

/// Nested spec fields continue the automatic numbering of their parent
fn format_fields(
    template: &str,
    args: &[Value],
    kwargs: &HashMap<String, Value>,
    auto_index: &mut usize,
) -> Eval<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(value_error("Single '}' encountered in format string")),
            '{' => {
                let mut field = String::new();
                let mut depth = 1;
                for inner in chars.by_ref() {
                    match inner {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    field.push(inner);
                }
                if depth != 0 {
                    return Err(value_error("expected '}' before end of string"));
                }
                let (head, spec) = match field.split_once(':') {
                    Some((head, spec)) => (head, spec),
                    None => (field.as_str(), ""),
                };
                let (name, conversion) = match head.split_once('!') {
                    Some((name, conversion)) => (name, conversion.chars().next()),
                    None => (head, None),
                };
                let value = lookup_field(name, args, kwargs, auto_index)?;
                let value = match conversion {
                    Some('r') | Some('a') => Value::new_str(value.repr())?,
                    Some('s') => Value::new_str(value.to_str())?,
                    None => value,
                    Some(other) => {
                        return Err(value_error(format!(
                            "Unknown conversion specifier {}",
                            other
                        )))
                    }
                };
                let spec = if spec.contains('{') {
                    format_fields(spec, args, kwargs, auto_index)?
                } else {
                    spec.to_string()
                };
                out.push_str(&format_value(&value, &spec)?);
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

fn replacement_index_error(index: usize) -> Exception {
    Exception::new(
        "IndexError",
        format!(
            "Replacement index {} out of range for positional args tuple",
            index
        ),
    )
}

fn lookup_field(
    name: &str,
    args: &[Value],
    kwargs: &HashMap<String, Value>,
    auto_index: &mut usize,
) -> Eval<Value> {
    if name.is_empty() {
        let index = *auto_index;
        *auto_index += 1;
        return args
            .get(index)
            .cloned()
            .ok_or_else(|| replacement_index_error(index));
    }
    if let Ok(index) = name.parse::<usize>() {
        return args
            .get(index)
            .cloned()
            .ok_or_else(|| replacement_index_error(index));
    }
    kwargs
        .get(name)
        .cloned()
        .ok_or_else(|| Exception::new("KeyError", format!("'{}'", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(text: &str) -> Value {
        Value::new_str(text).unwrap()
    }

    #[test]
    fn test_float_repr() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(-2.5), "-2.5");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1.5e-5), "1.5e-05");
        assert_eq!(float_repr(123456.0), "123456.0");
        assert_eq!(float_repr(0.0001), "0.0001");
        assert_eq!(float_repr(f64::INFINITY), "inf");
    }

    #[test]
    fn test_format_spec_numbers() {
        assert_eq!(format_value(&Value::Float(3.14159), ".2f").unwrap(), "3.14");
        assert_eq!(format_value(&Value::Int(42), "05d").unwrap(), "00042");
        assert_eq!(format_value(&Value::Int(-42), "+d").unwrap(), "-42");
        assert_eq!(format_value(&Value::Int(1234567), ",").unwrap(), "1,234,567");
        assert_eq!(format_value(&Value::Int(255), "#x").unwrap(), "0xff");
        assert_eq!(format_value(&Value::Float(0.25), ".1%").unwrap(), "25.0%");
        assert_eq!(format_value(&Value::Float(12345.678), ".3e").unwrap(), "1.235e+04");
        assert_eq!(format_value(&Value::Float(0.5), "g").unwrap(), "0.5");
        assert_eq!(format_value(&Value::Float(1e20), "g").unwrap(), "1e+20");
    }

    #[test]
    fn test_format_spec_alignment() {
        assert_eq!(format_value(&s("ab"), ">5").unwrap(), "   ab");
        assert_eq!(format_value(&s("ab"), "*^6").unwrap(), "**ab**");
        assert_eq!(format_value(&Value::Int(7), "<3").unwrap(), "7  ");
        assert_eq!(format_value(&s("abcdef"), ".3").unwrap(), "abc");
        assert!(format_value(&s("x"), "d").is_err());
    }

    #[test]
    fn test_percent_format() {
        let args = Value::new_tuple(vec![s("x"), Value::Int(3), Value::Float(2.5)]).unwrap();
        assert_eq!(percent_format("%s=%d (%.2f)", &args).unwrap(), "x=3 (2.50)");
        assert_eq!(percent_format("100%%", &Value::new_tuple(vec![]).unwrap()).unwrap(), "100%");
        assert_eq!(percent_format("%5s|", &s("ab")).unwrap(), "   ab|");
        assert!(percent_format("%s %s", &s("a")).is_err());
        assert_eq!(percent_format("%d", &Value::Float(-3.9)).unwrap(), "-3");
        let err = percent_format("%d", &Value::Float(1e300)).unwrap_err();
        assert_eq!(err.kind, "OverflowError");
        assert_eq!(percent_format("%i", &Value::Float(f64::NAN)).unwrap_err().kind, "ValueError");
    }

    #[test]
    fn test_str_format() {
        let mut kwargs = HashMap::new();
        kwargs.insert("name".to_string(), s("ward"));
        let args = vec![Value::Int(1), Value::Float(0.5)];
        assert_eq!(
            str_format("{} and {:.2f}, {name!r} {{ok}}", &args, &kwargs).unwrap(),
            "1 and 0.50, 'ward' {ok}"
        );
        assert_eq!(str_format("{1}{0}", &args, &kwargs).unwrap(), "0.51");
        assert!(str_format("{missing}", &args, &kwargs).is_err());
        let nested = [Value::Int(1), Value::Int(5), Value::Float(2.5), Value::Int(3)];
        assert_eq!(str_format("{:{}}|{:.{}f}", &nested, &kwargs).unwrap(), "    1|2.500");
        assert_eq!(str_format("{0:>{1}}", &nested, &kwargs).unwrap(), "    1");
    }
}
