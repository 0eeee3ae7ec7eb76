//! Runtime values of the scratch language

use std::cmp::Ordering;
use std::fmt::{self, Write as _};

use super::fault::CodeFault;

/// A value bound in an [`ExecutionContext`](super::ExecutionContext)
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Insertion-ordered, string keys only
    Dict(Vec<(String, Value)>),
}

impl Value {
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(v) | Self::Tuple(v) => !v.is_empty(),
            Self::Dict(d) => !d.is_empty(),
        }
    }

    /// Numeric view; bools count as ints
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn dict_get(entries: &[(String, Self)], key: &str) -> Option<usize> {
        entries.iter().position(|(k, _)| k == key)
    }

    /// Materialize anything iterable into its elements
    pub fn iterate(&self) -> Result<Vec<Self>, CodeFault> {
        match self {
            Self::List(v) | Self::Tuple(v) => Ok(v.clone()),
            Self::Str(s) => Ok(s.chars().map(|c| Self::Str(c.to_string())).collect()),
            Self::Dict(d) => Ok(d.iter().map(|(k, _)| Self::Str(k.clone())).collect()),
            other => Err(CodeFault::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    /// Stored size: one per element (nested ones included), bytes for strings
    pub fn weight(&self) -> usize {
        match self {
            Self::Str(s) => s.len().max(1),
            Self::List(items) | Self::Tuple(items) => {
                items.iter().fold(1, |n, v| n.saturating_add(v.weight()))
            }
            Self::Dict(entries) => entries
                .iter()
                .fold(1, |n, (k, v)| n.saturating_add(k.len()).saturating_add(v.weight())),
            _ => 1,
        }
    }

    /// Container nesting; scalars are 0
    pub fn depth(&self) -> usize {
        match self {
            Self::List(items) | Self::Tuple(items) => {
                1 + items.iter().map(Self::depth).max().unwrap_or(0)
            }
            Self::Dict(entries) => 1 + entries.iter().map(|(_, v)| v.depth()).max().unwrap_or(0),
            _ => 0,
        }
    }

    /// `repr()` rendering, as used inside containers
    pub fn repr(&self) -> String {
        match self {
            Self::Str(s) => quote(s),
            other => other.to_string(),
        }
    }

    /// Ordering for `<`, `sorted`, `min` and `max`
    pub fn compare(&self, other: &Self) -> Result<Ordering, CodeFault> {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => Ok(a.cmp(b)),
            (Self::List(a), Self::List(b)) | (Self::Tuple(a), Self::Tuple(b)) => {
                for (x, y) in a.iter().zip(b) {
                    match x.compare(y)? {
                        Ordering::Equal => {}
                        ord => return Ok(ord),
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            (a, b) => match (a.as_float(), b.as_float()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).ok_or_else(|| {
                    CodeFault::value_error("cannot order NaN")
                }),
                _ => Err(CodeFault::type_error(format!(
                    "'<' not supported between instances of '{}' and '{}'",
                    a.type_name(),
                    b.type_name()
                ))),
            },
        }
    }

    /// Equality with numeric coercion (`1 == 1.0`)
    pub fn equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::List(a), Self::List(b)) | (Self::Tuple(a), Self::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
            }
            (Self::Dict(a), Self::Dict(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        Self::dict_get(b, k).is_some_and(|i| b[i].1.equals(v))
                    })
            }
            (a, b) => match (a.as_float(), b.as_float()) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{}", format_float(*x)),
            Self::Str(s) => write!(f, "{s}"),
            Self::List(items) => write!(f, "[{}]", join_repr(items)),
            Self::Tuple(items) if items.len() == 1 => write!(f, "({},)", items[0].repr()),
            Self::Tuple(items) => write!(f, "({})", join_repr(items)),
            Self::Dict(entries) => {
                let mut s = String::new();
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        s.push_str(", ");
                    }
                    let _ = write!(s, "{}: {}", quote(k), v.repr());
                }
                write!(f, "{{{s}}}")
            }
        }
    }
}

fn join_repr(items: &[Value]) -> String {
    items.iter().map(Value::repr).collect::<Vec<_>>().join(", ")
}

fn quote(s: &str) -> String {
    let delim = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(delim);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == delim => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(delim);
    out
}

/// Python-style float text: `2.0`, `0.1`, `1e+20`
pub fn format_float(x: f64) -> String {
    if x.is_nan() {
        return "nan".into();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf".into() } else { "-inf".into() };
    }
    let magnitude = x.abs();
    if magnitude >= 1e16 || (magnitude != 0.0 && magnitude < 1e-4) {
        let sci = format!("{x:e}");
        return match sci.split_once('e') {
            Some((mantissa, exp)) => {
                let exp: i32 = exp.parse().unwrap_or(0);
                let sign = if exp < 0 { '-' } else { '+' };
                format!("{mantissa}e{sign}{:02}", exp.abs())
            }
            None => sci,
        };
    }
    if x.fract() == 0.0 {
        format!("{x:.1}")
    } else {
        format!("{x}")
    }
}
