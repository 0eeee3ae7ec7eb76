//! Operators and format specifications

use super::fault::CodeFault;
use super::parser::{BinOp, CmpOp};
use super::value::Value;

type OResult = Result<Value, CodeFault>;

/// Largest value produced by `+`, repetition, `join` or `range`, counted in
/// elements (nested ones included) or string bytes
pub const MAX_SEQUENCE: usize = 1_000_000;

/// Digits allowed after the point in a format spec
const MAX_PRECISION: usize = 100;

fn overflow() -> CodeFault {
    CodeFault::runtime("integer overflow")
}

fn too_large() -> CodeFault {
    CodeFault::runtime("sequence too large")
}

/// Size of a sequence's contents: string bytes or nested element weight
fn contents(seq: &[Value]) -> usize {
    seq.iter().fold(0, |n, v| n.saturating_add(v.weight()))
}

fn check_size(size: usize) -> Result<(), CodeFault> {
    if size > MAX_SEQUENCE {
        return Err(too_large());
    }
    Ok(())
}

pub fn binary(op: BinOp, a: &Value, b: &Value) -> OResult {
    match (op, a, b) {
        (BinOp::Add, Value::Str(x), Value::Str(y)) => {
            check_size(x.len().saturating_add(y.len()))?;
            Ok(Value::Str(format!("{x}{y}")))
        }
        (BinOp::Add, Value::List(x), Value::List(y)) => {
            check_size(contents(x).saturating_add(contents(y)))?;
            Ok(Value::List(x.iter().chain(y).cloned().collect()))
        }
        (BinOp::Add, Value::Tuple(x), Value::Tuple(y)) => {
            check_size(contents(x).saturating_add(contents(y)))?;
            Ok(Value::Tuple(x.iter().chain(y).cloned().collect()))
        }
        (BinOp::Mul, Value::Str(_) | Value::List(_) | Value::Tuple(_), n)
            if n.as_int().is_some() =>
        {
            repeat(a, n)
        }
        (BinOp::Mul, n, Value::Str(_) | Value::List(_) | Value::Tuple(_))
            if n.as_int().is_some() =>
        {
            repeat(b, n)
        }
        _ => numeric(op, a, b),
    }
}

fn repeat(seq: &Value, times: &Value) -> OResult {
    let n = usize::try_from(times.as_int().unwrap_or(0)).unwrap_or(0);
    let size = match seq {
        Value::Str(s) => s.len(),
        Value::List(v) | Value::Tuple(v) => contents(v),
        _ => 0,
    };
    check_size(size.saturating_mul(n))?;
    Ok(match seq {
        Value::Str(s) => Value::Str(s.repeat(n)),
        Value::List(v) => Value::List(repeat_items(v, n)),
        Value::Tuple(v) => Value::Tuple(repeat_items(v, n)),
        other => other.clone(),
    })
}

fn repeat_items(items: &[Value], n: usize) -> Vec<Value> {
    if items.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(items.len() * n);
    for _ in 0..n {
        out.extend_from_slice(items);
    }
    out
}

fn numeric(op: BinOp, a: &Value, b: &Value) -> OResult {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return int_op(op, x, y);
    }
    match (a.as_float(), b.as_float()) {
        (Some(x), Some(y)) => float_op(op, x, y),
        _ => Err(CodeFault::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            a.type_name(),
            b.type_name()
        ))),
    }
}

#[allow(clippy::cast_precision_loss)]
fn int_op(op: BinOp, x: i64, y: i64) -> OResult {
    let int = |v: Option<i64>| v.map(Value::Int).ok_or_else(overflow);
    match op {
        BinOp::Add => int(x.checked_add(y)),
        BinOp::Sub => int(x.checked_sub(y)),
        BinOp::Mul => int(x.checked_mul(y)),
        BinOp::Div => {
            if y == 0 {
                return Err(CodeFault::zero_division("division by zero"));
            }
            Ok(Value::Float(x as f64 / y as f64))
        }
        BinOp::FloorDiv => {
            if y == 0 {
                return Err(CodeFault::zero_division("integer division or modulo by zero"));
            }
            let q = x.checked_div(y).ok_or_else(overflow)?;
            Ok(Value::Int(if x % y != 0 && ((x < 0) != (y < 0)) { q - 1 } else { q }))
        }
        BinOp::Mod => {
            if y == 0 {
                return Err(CodeFault::zero_division("integer division or modulo by zero"));
            }
            let r = x.checked_rem(y).ok_or_else(overflow)?;
            Ok(Value::Int(if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r }))
        }
        BinOp::Pow => {
            if y >= 0 {
                int(u32::try_from(y).ok().and_then(|e| x.checked_pow(e)))
            } else if x == 0 {
                Err(CodeFault::zero_division(
                    "0.0 cannot be raised to a negative power",
                ))
            } else {
                Ok(Value::Float((x as f64).powf(y as f64)))
            }
        }
    }
}

fn float_op(op: BinOp, x: f64, y: f64) -> OResult {
    let result = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(CodeFault::zero_division("float division by zero"));
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(CodeFault::zero_division("float floor division by zero"));
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(CodeFault::zero_division("float modulo"));
            }
            let r = x % y;
            if r != 0.0 && ((r < 0.0) != (y < 0.0)) { r + y } else { r }
        }
        BinOp::Pow => {
            if x == 0.0 && y < 0.0 {
                return Err(CodeFault::zero_division(
                    "0.0 cannot be raised to a negative power",
                ));
            }
            x.powf(y)
        }
    };
    Ok(Value::Float(result))
}

pub fn compare(op: CmpOp, a: &Value, b: &Value) -> Result<bool, CodeFault> {
    use std::cmp::Ordering;
    Ok(match op {
        CmpOp::Eq => a.equals(b),
        CmpOp::Ne => !a.equals(b),
        CmpOp::Lt => a.compare(b)? == Ordering::Less,
        CmpOp::Le => a.compare(b)? != Ordering::Greater,
        CmpOp::Gt => a.compare(b)? == Ordering::Greater,
        CmpOp::Ge => a.compare(b)? != Ordering::Less,
        CmpOp::In => contains(b, a)?,
        CmpOp::NotIn => !contains(b, a)?,
        CmpOp::Is => a == b,
        CmpOp::IsNot => a != b,
    })
}

pub fn contains(container: &Value, item: &Value) -> Result<bool, CodeFault> {
    match (container, item) {
        (Value::Str(s), Value::Str(sub)) => Ok(s.contains(sub.as_str())),
        (Value::Str(_), other) => Err(CodeFault::type_error(format!(
            "'in <string>' requires string as left operand, not {}",
            other.type_name()
        ))),
        (Value::List(items) | Value::Tuple(items), _) => Ok(items.iter().any(|v| v.equals(item))),
        (Value::Dict(entries), Value::Str(key)) => Ok(Value::dict_get(entries, key).is_some()),
        (Value::Dict(_), _) => Ok(false),
        (other, _) => Err(CodeFault::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

/// Apply an f-string format spec (`.2f`, `,`, `,.1f`, `d`, `.1%`)
pub fn format_spec(value: &Value, spec: &str) -> Result<String, CodeFault> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(value.to_string());
    }
    let (grouping, rest) = spec
        .strip_prefix(',')
        .map_or((false, spec), |r| (true, r));

    let invalid = || {
        CodeFault::value_error(format!(
            "Invalid format specifier '{spec}' for object of type '{}'",
            value.type_name()
        ))
    };

    let text = if rest.is_empty() || rest == "d" {
        match value {
            Value::Int(_) | Value::Bool(_) => value.as_int().unwrap_or(0).to_string(),
            Value::Float(_) if rest.is_empty() => value.to_string(),
            _ => return Err(invalid()),
        }
    } else if let Some(precision) = rest.strip_prefix('.') {
        let x = value.as_float().ok_or_else(invalid)?;
        let digits = |d: &str| -> Result<usize, CodeFault> {
            let n: usize = d.parse().map_err(|_| invalid())?;
            if n > MAX_PRECISION {
                return Err(CodeFault::value_error("precision too big"));
            }
            Ok(n)
        };
        if let Some(d) = precision.strip_suffix('f') {
            let digits = digits(d)?;
            format!("{x:.digits$}")
        } else if let Some(d) = precision.strip_suffix('%') {
            let digits = digits(d)?;
            return Ok(format!("{:.digits$}%", x * 100.0));
        } else {
            return Err(invalid());
        }
    } else {
        return Err(invalid());
    };

    Ok(if grouping { group_thousands(&text) } else { text })
}

fn group_thousands(text: &str) -> String {
    let (sign, unsigned) = text
        .strip_prefix('-')
        .map_or(("", text), |rest| ("-", rest));
    let (int_part, frac) = unsigned
        .find('.')
        .map_or((unsigned, ""), |i| (&unsigned[..i], &unsigned[i..]));

    let mut grouped = String::new();
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{sign}{grouped}{frac}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_semantics() {
        assert_eq!(binary(BinOp::FloorDiv, &Value::Int(-7), &Value::Int(2)).unwrap(), Value::Int(-4));
        assert_eq!(binary(BinOp::Mod, &Value::Int(-7), &Value::Int(2)).unwrap(), Value::Int(1));
        assert_eq!(binary(BinOp::Div, &Value::Int(7), &Value::Int(2)).unwrap(), Value::Float(3.5));
    }

    #[test]
    fn test_type_errors() {
        let err = binary(BinOp::Add, &Value::Int(1), &Value::Str("a".into())).unwrap_err();
        assert_eq!(err.to_string(), "TypeError: unsupported operand type(s) for +: 'int' and 'str'");
        let err = binary(BinOp::Mod, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(err.kind, super::super::fault::FaultKind::ZeroDivisionError);
    }

    #[test]
    fn test_format_spec() {
        assert_eq!(format_spec(&Value::Float(3.14159), ".2f").unwrap(), "3.14");
        assert_eq!(format_spec(&Value::Int(1_234_567), ",").unwrap(), "1,234,567");
        assert_eq!(format_spec(&Value::Float(-1234.5), ",.1f").unwrap(), "-1,234.5");
        assert_eq!(format_spec(&Value::Float(0.256), ".1%").unwrap(), "25.6%");
        assert!(format_spec(&Value::Str("x".into()), ".2f").is_err());
    }

    #[test]
    fn test_repeat() {
        assert_eq!(
            binary(BinOp::Mul, &Value::Int(2), &Value::Str("ab".into())).unwrap(),
            Value::Str("abab".into())
        );
        let pair = Value::List(vec![Value::Int(1), Value::Str("x".into())]);
        assert_eq!(
            binary(BinOp::Mul, &pair, &Value::Int(2)).unwrap().to_string(),
            "[1, 'x', 1, 'x']"
        );
        assert_eq!(
            binary(BinOp::Mul, &Value::Tuple(vec![]), &Value::Int(1_000_000_000)).unwrap(),
            Value::Tuple(vec![])
        );
    }

    #[test]
    fn test_size_limits() {
        let inner = binary(BinOp::Mul, &Value::List(vec![Value::Int(0)]), &Value::Int(1_000_000)).unwrap();
        let err = binary(BinOp::Mul, &Value::List(vec![inner.clone()]), &Value::Int(1_000_000)).unwrap_err();
        assert_eq!(err.to_string(), "RuntimeError: sequence too large");
        assert!(binary(BinOp::Add, &inner, &inner).is_err());
        let half = Value::Str("x".repeat(600_000));
        assert!(binary(BinOp::Add, &half, &half).is_err());
        assert!(format_spec(&Value::Float(1.0), ".1000000000f").is_err());
    }
}
