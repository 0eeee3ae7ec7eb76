//! Builtin functions

use std::cmp::Ordering;

use super::fault::CodeFault;
use super::ops::{self, MAX_SEQUENCE};
use super::parser::BinOp;
use super::value::Value;

type BResult = Result<Value, CodeFault>;

/// Names callable without a receiver
pub const BUILTINS: [&str; 17] = [
    "print", "len", "str", "int", "float", "bool", "abs", "round", "min", "max", "sum", "sorted",
    "range", "list", "dict", "enumerate", "zip",
];

/// Bytes one execution may print
pub const MAX_OUTPUT: usize = 1_000_000;

pub fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), CodeFault> {
    if (min..=max).contains(&args.len()) {
        return Ok(());
    }
    let expected = if min == max {
        format!("exactly {min}")
    } else if args.len() < min {
        format!("at least {min}")
    } else {
        format!("at most {max}")
    };
    Err(CodeFault::type_error(format!(
        "{name}() takes {expected} argument{} ({} given)",
        if expected.ends_with('1') { "" } else { "s" },
        args.len()
    )))
}

fn keyword<'a>(kwargs: &'a [(String, Value)], name: &str) -> Option<&'a Value> {
    kwargs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
}

fn reject_keywords(func: &str, kwargs: &[(String, Value)], allowed: &[&str]) -> Result<(), CodeFault> {
    match kwargs.iter().find(|(k, _)| !allowed.contains(&k.as_str())) {
        Some((k, _)) => Err(CodeFault::type_error(format!(
            "{func}() got an unexpected keyword argument '{k}'"
        ))),
        None => Ok(()),
    }
}

/// Sort with a fallible comparison; the first comparison fault wins
pub fn sort_values(items: &mut [Value], reverse: bool) -> Result<(), CodeFault> {
    let mut fault = None;
    items.sort_by(|a, b| {
        let (x, y) = if reverse { (b, a) } else { (a, b) };
        x.compare(y).unwrap_or_else(|e| {
            fault.get_or_insert(e);
            Ordering::Equal
        })
    });
    fault.map_or(Ok(()), Err)
}

fn to_int(value: &Value) -> Result<i64, CodeFault> {
    value.as_int().ok_or_else(|| {
        CodeFault::type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            value.type_name()
        ))
    })
}

/// Call a builtin; `out` receives anything printed
#[allow(clippy::too_many_lines, clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn call(name: &str, args: Vec<Value>, kwargs: &[(String, Value)], out: &mut String) -> BResult {
    match name {
        "print" => {
            reject_keywords(name, kwargs, &["sep", "end"])?;
            let text_of = |key: &str, default: &str| match keyword(kwargs, key) {
                None | Some(Value::None) => Ok(default.to_string()),
                Some(Value::Str(s)) => Ok(s.clone()),
                Some(other) => Err(CodeFault::type_error(format!(
                    "{key} must be None or a string, not {}",
                    other.type_name()
                ))),
            };
            let sep = text_of("sep", " ")?;
            let end = text_of("end", "\n")?;
            let line: Vec<String> = args.iter().map(ToString::to_string).collect();
            let line = line.join(&sep) + &end;
            if out.len() + line.len() > MAX_OUTPUT {
                return Err(CodeFault::runtime("output limit exceeded"));
            }
            out.push_str(&line);
            Ok(Value::None)
        }
        "sorted" => {
            reject_keywords(name, kwargs, &["reverse"])?;
            arity(name, &args, 1, 1)?;
            let mut items = args[0].iterate()?;
            let reverse = keyword(kwargs, "reverse").is_some_and(Value::truthy);
            sort_values(&mut items, reverse)?;
            Ok(Value::List(items))
        }
        "dict" => {
            arity(name, &args, 0, 1)?;
            let mut entries: Vec<(String, Value)> = Vec::new();
            if let Some(source) = args.first() {
                let pairs = match source {
                    Value::Dict(d) => d.clone(),
                    other => other
                        .iterate()?
                        .into_iter()
                        .map(|pair| match pair.iterate()?.as_slice() {
                            [Value::Str(k), v] => Ok((k.clone(), v.clone())),
                            _ => Err(CodeFault::type_error(
                                "dict() expects (str, value) pairs",
                            )),
                        })
                        .collect::<Result<_, _>>()?,
                };
                entries.extend(pairs);
            }
            for (k, v) in kwargs {
                match Value::dict_get(&entries, k) {
                    Some(i) => entries[i].1 = v.clone(),
                    None => entries.push((k.clone(), v.clone())),
                }
            }
            Ok(Value::Dict(entries))
        }
        _ => {
            let allowed: &[&str] = if name == "enumerate" { &["start"] } else { &[] };
            reject_keywords(name, kwargs, allowed)?;
            call_positional(name, args, kwargs)
        }
    }
}

#[allow(clippy::too_many_lines, clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn call_positional(name: &str, args: Vec<Value>, kwargs: &[(String, Value)]) -> BResult {
    match name {
        "len" => {
            arity(name, &args, 1, 1)?;
            let n = match &args[0] {
                Value::Str(s) => s.chars().count(),
                Value::List(v) | Value::Tuple(v) => v.len(),
                Value::Dict(d) => d.len(),
                other => {
                    return Err(CodeFault::type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )));
                }
            };
            Ok(Value::Int(i64::try_from(n).unwrap_or(i64::MAX)))
        }
        "str" => {
            arity(name, &args, 0, 1)?;
            Ok(Value::Str(args.first().map(ToString::to_string).unwrap_or_default()))
        }
        "int" => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Int(0)),
                Some(Value::Float(f)) => {
                    if f.is_finite() && f.abs() < 9.2e18 {
                        Ok(Value::Int(f.trunc() as i64))
                    } else {
                        Err(CodeFault::value_error(format!(
                            "cannot convert float {} to integer",
                            super::value::format_float(*f)
                        )))
                    }
                }
                Some(Value::Str(s)) => s.trim().replace('_', "").parse().map(Value::Int).map_err(|_| {
                    CodeFault::value_error(format!(
                        "invalid literal for int() with base 10: {}",
                        Value::Str(s.clone()).repr()
                    ))
                }),
                Some(v) => v.as_int().map(Value::Int).ok_or_else(|| {
                    CodeFault::type_error(format!(
                        "int() argument must be a string or a number, not '{}'",
                        v.type_name()
                    ))
                }),
            }
        }
        "float" => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(s)) => s.trim().parse().map(Value::Float).map_err(|_| {
                    CodeFault::value_error(format!(
                        "could not convert string to float: {}",
                        Value::Str(s.clone()).repr()
                    ))
                }),
                Some(v) => v.as_float().map(Value::Float).ok_or_else(|| {
                    CodeFault::type_error(format!(
                        "float() argument must be a string or a number, not '{}'",
                        v.type_name()
                    ))
                }),
            }
        }
        "bool" => {
            arity(name, &args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
        }
        "abs" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Float(f) => Ok(Value::Float(f.abs())),
                v => v
                    .as_int()
                    .ok_or_else(|| {
                        CodeFault::type_error(format!(
                            "bad operand type for abs(): '{}'",
                            v.type_name()
                        ))
                    })?
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| CodeFault::runtime("integer overflow")),
            }
        }
        "round" => {
            arity(name, &args, 1, 2)?;
            let digits = match args.get(1) {
                None | Some(Value::None) => None,
                Some(v) => Some(to_int(v)?),
            };
            match (&args[0], digits) {
                (Value::Float(f), None) => Ok(Value::Int(f.round_ties_even() as i64)),
                (Value::Float(f), Some(n)) => {
                    let scale = 10f64.powi(i32::try_from(n).unwrap_or(0));
                    Ok(Value::Float((f * scale).round_ties_even() / scale))
                }
                (v, _) => v.as_int().map(Value::Int).ok_or_else(|| {
                    CodeFault::type_error(format!(
                        "type {} doesn't define __round__ method",
                        v.type_name()
                    ))
                }),
            }
        }
        "min" | "max" => {
            if args.is_empty() {
                return arity(name, &args, 1, usize::MAX).map(|()| Value::None);
            }
            let items = if args.len() == 1 { args[0].iterate()? } else { args };
            let mut iter = items.into_iter();
            let Some(mut best) = iter.next() else {
                return Err(CodeFault::value_error(format!("{name}() arg is an empty sequence")));
            };
            let wanted = if name == "min" { Ordering::Less } else { Ordering::Greater };
            for item in iter {
                if item.compare(&best)? == wanted {
                    best = item;
                }
            }
            Ok(best)
        }
        "sum" => {
            arity(name, &args, 1, 2)?;
            let start = args.get(1).cloned().unwrap_or(Value::Int(0));
            args[0]
                .iterate()?
                .iter()
                .try_fold(start, |acc, v| ops::binary(BinOp::Add, &acc, v))
        }
        "range" => {
            arity(name, &args, 1, 3)?;
            let bounds: Vec<i64> = args.iter().map(to_int).collect::<Result<_, _>>()?;
            let (start, stop, step) = match bounds.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => return Err(CodeFault::type_error("range expected at most 3 arguments")),
            };
            if step == 0 {
                return Err(CodeFault::value_error("range() arg 3 must not be zero"));
            }
            let span = if step > 0 { stop.saturating_sub(start) } else { start.saturating_sub(stop) };
            let count = if span <= 0 { 0 } else { (span - 1) / step.saturating_abs() + 1 };
            if usize::try_from(count).unwrap_or(usize::MAX) > MAX_SEQUENCE {
                return Err(CodeFault::runtime("range too large"));
            }
            Ok(Value::List((0..count).map(|i| Value::Int(start + i * step)).collect()))
        }
        "list" => {
            arity(name, &args, 0, 1)?;
            Ok(Value::List(match args.first() {
                Some(v) => v.iterate()?,
                None => Vec::new(),
            }))
        }
        "enumerate" => {
            arity(name, &args, 1, 1)?;
            let start = match keyword(kwargs, "start") {
                Some(v) => to_int(v)?,
                None => 0,
            };
            Ok(Value::List(
                args[0]
                    .iterate()?
                    .into_iter()
                    .zip(start..)
                    .map(|(v, i)| Value::Tuple(vec![Value::Int(i), v]))
                    .collect(),
            ))
        }
        "zip" => {
            let columns: Vec<Vec<Value>> = args.iter().map(Value::iterate).collect::<Result<_, _>>()?;
            let len = columns.iter().map(Vec::len).min().unwrap_or(0);
            Ok(Value::List(
                (0..len)
                    .map(|i| Value::Tuple(columns.iter().map(|c| c[i].clone()).collect()))
                    .collect(),
            ))
        }
        _ => Err(CodeFault::name_error(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(name: &str, args: Vec<Value>) -> BResult {
        call(name, args, &[], &mut String::new())
    }

    #[test]
    fn test_print_uses_python_rendering() {
        let mut out = String::new();
        call(
            "print",
            vec![Value::Str("total:".into()), Value::Float(2.0), Value::List(vec![Value::Str("a".into())])],
            &[],
            &mut out,
        )
        .unwrap();
        assert_eq!(out, "total: 2.0 ['a']\n");
    }

    #[test]
    fn test_range_and_sum() {
        let r = run("range", vec![Value::Int(10), Value::Int(0), Value::Int(-3)]).unwrap();
        assert_eq!(r.to_string(), "[10, 7, 4, 1]");
        let s = run("sum", vec![r]).unwrap();
        assert_eq!(s, Value::Int(22));
        assert!(run("range", vec![Value::Int(0), Value::Int(5), Value::Int(0)]).is_err());
    }

    #[test]
    fn test_round_half_even() {
        assert_eq!(run("round", vec![Value::Float(2.5)]).unwrap(), Value::Int(2));
        assert_eq!(run("round", vec![Value::Float(3.14159), Value::Int(2)]).unwrap(), Value::Float(3.14));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(run("int", vec![Value::Str(" 42 ".into())]).unwrap(), Value::Int(42));
        let err = run("int", vec![Value::Str("4x".into())]).unwrap_err();
        assert_eq!(err.to_string(), "ValueError: invalid literal for int() with base 10: '4x'");
        assert_eq!(run("float", vec![Value::Int(3)]).unwrap(), Value::Float(3.0));
    }

    #[test]
    fn test_min_max_empty() {
        assert!(run("max", vec![Value::List(Vec::new())]).is_err());
        assert_eq!(run("min", vec![Value::Int(3), Value::Int(1), Value::Int(2)]).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_print_output_is_capped() {
        let mut out = String::new();
        let chunk = Value::Str("x".repeat(400_000));
        call("print", vec![chunk.clone()], &[], &mut out).unwrap();
        call("print", vec![chunk.clone()], &[], &mut out).unwrap();
        let err = call("print", vec![chunk], &[], &mut out).unwrap_err();
        assert_eq!(err.to_string(), "RuntimeError: output limit exceeded");
        assert_eq!(out.len(), 800_002);
    }

    #[test]
    fn test_len_arity() {
        let err = run("len", vec![]).unwrap_err();
        assert_eq!(err.to_string(), "TypeError: len() takes exactly 1 argument (0 given)");
    }
}
