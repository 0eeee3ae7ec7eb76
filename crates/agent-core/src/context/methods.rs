//! Methods on lists, strings and dicts

use super::builtins::{arity, sort_values};
use super::fault::CodeFault;
use super::ops::MAX_SEQUENCE;
use super::value::Value;

type MResult = Result<Value, CodeFault>;

/// Methods that change their receiver in place
pub const MUTATING: [&str; 8] = [
    "append", "extend", "pop", "insert", "remove", "sort", "clear", "update",
];

pub fn call(recv: &mut Value, name: &str, args: Vec<Value>, kwargs: &[(String, Value)]) -> MResult {
    let type_name = recv.type_name();
    if let Some((k, _)) = kwargs.iter().find(|(k, _)| !(name == "sort" && k == "reverse")) {
        return Err(CodeFault::type_error(format!(
            "{type_name}.{name}() got an unexpected keyword argument '{k}'"
        )));
    }
    match recv {
        Value::List(items) => list_method(items, name, &args, kwargs),
        Value::Str(s) => str_method(s, name, &args),
        Value::Dict(entries) => dict_method(entries, name, &args),
        _ => Err(CodeFault::attribute(type_name, name)),
    }
}

fn index_in(len: usize, index: &Value, what: &str) -> Result<usize, CodeFault> {
    let i = index.as_int().ok_or_else(|| {
        CodeFault::type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            index.type_name()
        ))
    })?;
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let resolved = if i < 0 { i + len_i } else { i };
    if (0..len_i).contains(&resolved) {
        Ok(usize::try_from(resolved).unwrap_or(0))
    } else {
        Err(CodeFault::index_error(format!("{what} index out of range")))
    }
}

fn list_method(items: &mut Vec<Value>, name: &str, args: &[Value], kwargs: &[(String, Value)]) -> MResult {
    let qualified = format!("list.{name}");
    match name {
        "append" => {
            arity(&qualified, args, 1, 1)?;
            items.push(args[0].clone());
            Ok(Value::None)
        }
        "extend" => {
            arity(&qualified, args, 1, 1)?;
            items.extend(args[0].iterate()?);
            Ok(Value::None)
        }
        "pop" => {
            arity(&qualified, args, 0, 1)?;
            if items.is_empty() {
                return Err(CodeFault::index_error("pop from empty list"));
            }
            let i = match args.first() {
                Some(index) => index_in(items.len(), index, "pop")?,
                None => items.len() - 1,
            };
            Ok(items.remove(i))
        }
        "insert" => {
            arity(&qualified, args, 2, 2)?;
            let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
            let i = args[0]
                .as_int()
                .ok_or_else(|| CodeFault::type_error("list indices must be integers"))?;
            let i = if i < 0 { (i + len).max(0) } else { i.min(len) };
            items.insert(usize::try_from(i).unwrap_or(0), args[1].clone());
            Ok(Value::None)
        }
        "remove" => {
            arity(&qualified, args, 1, 1)?;
            let i = items
                .iter()
                .position(|v| v.equals(&args[0]))
                .ok_or_else(|| CodeFault::value_error("list.remove(x): x not in list"))?;
            items.remove(i);
            Ok(Value::None)
        }
        "sort" => {
            arity(&qualified, args, 0, 0)?;
            let reverse = kwargs.iter().any(|(k, v)| k == "reverse" && v.truthy());
            sort_values(items, reverse)?;
            Ok(Value::None)
        }
        "clear" => {
            arity(&qualified, args, 0, 0)?;
            items.clear();
            Ok(Value::None)
        }
        _ => Err(CodeFault::attribute("list", name)),
    }
}

fn str_arg<'a>(method: &str, value: &'a Value) -> Result<&'a str, CodeFault> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(CodeFault::type_error(format!(
            "{method}() argument must be str, not {}",
            other.type_name()
        ))),
    }
}

fn strip_chars(args: &[Value], method: &str) -> Result<Option<Vec<char>>, CodeFault> {
    match args.first() {
        None | Some(Value::None) => Ok(None),
        Some(v) => Ok(Some(str_arg(method, v)?.chars().collect())),
    }
}

#[allow(clippy::too_many_lines)]
fn str_method(s: &str, name: &str, args: &[Value]) -> MResult {
    let qualified = format!("str.{name}");
    let text = |t: String| -> MResult { Ok(Value::Str(t)) };
    match name {
        "upper" => {
            arity(&qualified, args, 0, 0)?;
            text(s.to_uppercase())
        }
        "lower" => {
            arity(&qualified, args, 0, 0)?;
            text(s.to_lowercase())
        }
        "strip" | "lstrip" | "rstrip" => {
            arity(&qualified, args, 0, 1)?;
            let chars = strip_chars(args, &qualified)?;
            let matches = |c: char| chars.as_ref().map_or(c.is_whitespace(), |set| set.contains(&c));
            text(match name {
                "strip" => s.trim_matches(matches),
                "lstrip" => s.trim_start_matches(matches),
                _ => s.trim_end_matches(matches),
            }
            .to_string())
        }
        "split" => {
            arity(&qualified, args, 0, 1)?;
            let parts: Vec<&str> = match args.first() {
                None | Some(Value::None) => s.split_whitespace().collect(),
                Some(sep) => {
                    let sep = str_arg(&qualified, sep)?;
                    if sep.is_empty() {
                        return Err(CodeFault::value_error("empty separator"));
                    }
                    s.split(sep).collect()
                }
            };
            Ok(Value::List(parts.into_iter().map(|p| Value::Str(p.to_string())).collect()))
        }
        "join" => {
            arity(&qualified, args, 1, 1)?;
            let items = args[0].iterate()?;
            let mut parts = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match item {
                    Value::Str(p) => parts.push(p.as_str()),
                    other => {
                        return Err(CodeFault::type_error(format!(
                            "sequence item {i}: expected str instance, {} found",
                            other.type_name()
                        )));
                    }
                }
            }
            let size = parts.iter().map(|p| p.len()).sum::<usize>()
                + s.len().saturating_mul(parts.len().saturating_sub(1));
            if size > MAX_SEQUENCE {
                return Err(CodeFault::runtime("sequence too large"));
            }
            text(parts.join(s))
        }
        "replace" => {
            arity(&qualified, args, 2, 2)?;
            let from = str_arg(&qualified, &args[0])?;
            let to = str_arg(&qualified, &args[1])?;
            let hits = if from.is_empty() { s.chars().count() + 1 } else { s.matches(from).count() };
            if s.len().saturating_add(hits.saturating_mul(to.len())) > MAX_SEQUENCE {
                return Err(CodeFault::runtime("sequence too large"));
            }
            text(s.replace(from, to))
        }
        "startswith" | "endswith" => {
            arity(&qualified, args, 1, 1)?;
            let candidates = match &args[0] {
                Value::Tuple(items) => items.clone(),
                other => vec![other.clone()],
            };
            let mut hit = false;
            for candidate in &candidates {
                let c = str_arg(&qualified, candidate)?;
                hit |= if name == "startswith" { s.starts_with(c) } else { s.ends_with(c) };
            }
            Ok(Value::Bool(hit))
        }
        "find" => {
            arity(&qualified, args, 1, 1)?;
            let sub = str_arg(&qualified, &args[0])?;
            let index = s
                .find(sub)
                .map_or(-1, |b| i64::try_from(s[..b].chars().count()).unwrap_or(i64::MAX));
            Ok(Value::Int(index))
        }
        _ => Err(CodeFault::attribute("str", name)),
    }
}

fn dict_method(entries: &mut Vec<(String, Value)>, name: &str, args: &[Value]) -> MResult {
    let qualified = format!("dict.{name}");
    let key_of = |v: &Value| match v {
        Value::Str(k) => Some(k.clone()),
        _ => None,
    };
    match name {
        "keys" => {
            arity(&qualified, args, 0, 0)?;
            Ok(Value::List(entries.iter().map(|(k, _)| Value::Str(k.clone())).collect()))
        }
        "values" => {
            arity(&qualified, args, 0, 0)?;
            Ok(Value::List(entries.iter().map(|(_, v)| v.clone()).collect()))
        }
        "items" => {
            arity(&qualified, args, 0, 0)?;
            Ok(Value::List(
                entries
                    .iter()
                    .map(|(k, v)| Value::Tuple(vec![Value::Str(k.clone()), v.clone()]))
                    .collect(),
            ))
        }
        "get" => {
            arity(&qualified, args, 1, 2)?;
            let found = key_of(&args[0])
                .and_then(|k| Value::dict_get(entries, &k))
                .map(|i| entries[i].1.clone());
            Ok(found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
        }
        "pop" => {
            arity(&qualified, args, 1, 2)?;
            let index = key_of(&args[0]).and_then(|k| Value::dict_get(entries, &k));
            match (index, args.get(1)) {
                (Some(i), _) => Ok(entries.remove(i).1),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(CodeFault::key_error(&args[0].to_string())),
            }
        }
        "update" => {
            arity(&qualified, args, 1, 1)?;
            let Value::Dict(other) = &args[0] else {
                return Err(CodeFault::type_error(format!(
                    "dict.update() argument must be a dict, not {}",
                    args[0].type_name()
                )));
            };
            for (k, v) in other {
                match Value::dict_get(entries, k) {
                    Some(i) => entries[i].1 = v.clone(),
                    None => entries.push((k.clone(), v.clone())),
                }
            }
            Ok(Value::None)
        }
        "clear" => {
            arity(&qualified, args, 0, 0)?;
            entries.clear();
            Ok(Value::None)
        }
        _ => Err(CodeFault::attribute("dict", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(text: &str) -> Value {
        Value::Str(text.into())
    }

    #[test]
    fn test_list_mutation() {
        let mut list = Value::List(vec![Value::Int(3), Value::Int(1)]);
        call(&mut list, "append", vec![Value::Int(2)], &[]).unwrap();
        call(&mut list, "sort", vec![], &[("reverse".into(), Value::Bool(true))]).unwrap();
        assert_eq!(list.to_string(), "[3, 2, 1]");
        assert_eq!(call(&mut list, "pop", vec![Value::Int(0)], &[]).unwrap(), Value::Int(3));
        assert!(call(&mut Value::List(vec![]), "pop", vec![], &[]).is_err());
    }

    #[test]
    fn test_string_methods() {
        let mut text = s("  a,b,,c  ");
        let parts = call(&mut text, "split", vec![s(",")], &[]).unwrap();
        assert_eq!(parts.to_string(), "['  a', 'b', '', 'c  ']");
        assert_eq!(call(&mut text, "strip", vec![], &[]).unwrap(), s("a,b,,c"));
        let joined = call(&mut s("-"), "join", vec![Value::List(vec![s("x"), s("y")])], &[]).unwrap();
        assert_eq!(joined, s("x-y"));
        assert_eq!(call(&mut s(" a b  c"), "split", vec![], &[]).unwrap().to_string(), "['a', 'b', 'c']");
    }

    #[test]
    fn test_string_results_are_bounded() {
        let mut sep = s(&"-".repeat(1000));
        let items = Value::List(vec![s("x"); 2000]);
        let err = call(&mut sep, "join", vec![items], &[]).unwrap_err();
        assert_eq!(err.to_string(), "RuntimeError: sequence too large");
        let mut text = s(&"ab".repeat(1000));
        assert!(call(&mut text, "replace", vec![s(""), s(&"z".repeat(1000))], &[]).is_err());
        assert_eq!(call(&mut s("a-b"), "replace", vec![s("-"), s("+")], &[]).unwrap(), s("a+b"));
    }

    #[test]
    fn test_dict_methods() {
        let mut d = Value::Dict(vec![("a".into(), Value::Int(1))]);
        assert_eq!(call(&mut d, "get", vec![s("z"), Value::Int(0)], &[]).unwrap(), Value::Int(0));
        call(&mut d, "update", vec![Value::Dict(vec![("b".into(), Value::Int(2))])], &[]).unwrap();
        assert_eq!(call(&mut d, "items", vec![], &[]).unwrap().to_string(), "[('a', 1), ('b', 2)]");
        let err = call(&mut d, "pop", vec![s("zz")], &[]).unwrap_err();
        assert_eq!(err.to_string(), "KeyError: 'zz'");
    }

    #[test]
    fn test_unknown_method() {
        let err = call(&mut Value::Int(1), "append", vec![], &[]).unwrap_err();
        assert_eq!(err.to_string(), "AttributeError: 'int' object has no attribute 'append'");
    }
}
