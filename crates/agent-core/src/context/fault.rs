//! Faults raised while executing a code block

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a [`CodeFault`], named after the Python exception it mirrors
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    SyntaxError,
    NameError,
    TypeError,
    ZeroDivisionError,
    IndexError,
    KeyError,
    ValueError,
    AttributeError,
    /// Interpreter limits (step budget, integer overflow)
    RuntimeError,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SyntaxError => "SyntaxError",
            Self::NameError => "NameError",
            Self::TypeError => "TypeError",
            Self::ZeroDivisionError => "ZeroDivisionError",
            Self::IndexError => "IndexError",
            Self::KeyError => "KeyError",
            Self::ValueError => "ValueError",
            Self::AttributeError => "AttributeError",
            Self::RuntimeError => "RuntimeError",
        };
        f.write_str(name)
    }
}

/// A contained execution failure, reported back to the model
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct CodeFault {
    pub kind: FaultKind,
    pub message: String,
}

impl CodeFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn syntax(message: impl Into<String>, line: usize) -> Self {
        Self::new(
            FaultKind::SyntaxError,
            format!("{} (line {line})", message.into()),
        )
    }

    pub fn name_error(name: &str) -> Self {
        Self::new(FaultKind::NameError, format!("name '{name}' is not defined"))
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(FaultKind::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(FaultKind::ValueError, message)
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::new(FaultKind::IndexError, message)
    }

    pub fn key_error(key: &str) -> Self {
        Self::new(FaultKind::KeyError, format!("'{key}'"))
    }

    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::new(FaultKind::ZeroDivisionError, message)
    }

    pub fn attribute(type_name: &str, attr: &str) -> Self {
        Self::new(
            FaultKind::AttributeError,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(FaultKind::RuntimeError, message)
    }
}
