//! Execution context
//!
//! A small Python-flavoured statement language with a namespace that persists
//! across executions. Each conversation owns exactly one context; faults are
//! captured into the [`Observation`] rather than propagated, and statements
//! that ran before a fault keep their effects.
//!
//! ```
//! use agent_core::context::ExecutionContext;
//!
//! let mut ctx = ExecutionContext::new();
//! ctx.execute("x = 10");
//! assert_eq!(ctx.execute("print(x * 2)").output, "20\n");
//! ```

mod builtins;
mod eval;
mod fault;
mod lexer;
mod methods;
mod ops;
mod parser;
mod value;

use std::collections::HashMap;

use serde::Serialize;

pub use fault::{CodeFault, FaultKind};
pub use value::Value;

/// Result of executing one code block
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Observation {
    /// Everything printed, including output produced before a fault
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<CodeFault>,
}

impl Observation {
    pub const fn is_ok(&self) -> bool {
        self.fault.is_none()
    }

    /// Output followed by the fault line, as shown to the model
    pub fn render(&self) -> String {
        let mut text = self.output.clone();
        if let Some(fault) = &self.fault {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&fault.to_string());
        }
        if text.trim().is_empty() {
            return "(no output)".to_string();
        }
        text.trim_end().to_string()
    }
}

/// Persistent variable namespace for one conversation
#[derive(Debug, Default, Clone)]
pub struct ExecutionContext {
    vars: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execute(&mut self, code: &str) -> Observation {
        let mut output = String::new();
        let fault = match parser::parse(code) {
            Ok(program) => eval::Interpreter::new(&mut self.vars, &mut output)
                .run(&program)
                .err(),
            Err(fault) => Some(fault),
        };
        if let Some(fault) = &fault {
            tracing::debug!(kind = %fault.kind, "code fault: {}", fault.message);
        }
        Observation { output, fault }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    /// Bound names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.vars.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn clear(&mut self) {
        self.vars.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_across_executions() {
        let mut ctx = ExecutionContext::new();
        let first = ctx.execute("x = 10");
        assert!(first.is_ok());
        assert_eq!(first.output, "");

        let second = ctx.execute("print(x * 2)");
        assert_eq!(second.output, "20\n");
        assert_eq!(second.render(), "20");
        assert_eq!(ctx.get("x"), Some(&Value::Int(10)));
    }

    #[test]
    fn test_contexts_are_isolated() {
        let mut a = ExecutionContext::new();
        let mut b = ExecutionContext::new();
        a.execute("secret = 'a'");

        let obs = b.execute("print(secret)");
        assert_eq!(obs.fault.unwrap().kind, FaultKind::NameError);
        assert!(b.is_empty());
        assert_eq!(a.names(), vec!["secret"]);
    }

    #[test]
    fn test_fault_keeps_prior_effects_and_output() {
        let mut ctx = ExecutionContext::new();
        let obs = ctx.execute("total = 5\nprint('partial', total)\ntotal = total / 0\nprint('never')");

        assert_eq!(obs.output, "partial 5\n");
        let fault = obs.fault.clone().unwrap();
        assert_eq!(fault.kind, FaultKind::ZeroDivisionError);
        assert_eq!(obs.render(), "partial 5\nZeroDivisionError: division by zero");
        assert_eq!(ctx.get("total"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_syntax_error_is_captured() {
        let mut ctx = ExecutionContext::new();
        let obs = ctx.execute("x = (1 +");
        assert_eq!(obs.fault.unwrap().kind, FaultKind::SyntaxError);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_realistic_block() {
        let mut ctx = ExecutionContext::new();
        ctx.execute("import json\nrows = [{'name': 'a', 'qty': 3}, {'name': 'b', 'qty': 4}]");
        let obs = ctx.execute(
            "total = sum(r['qty'] for r in rows)\nnames = ', '.join([r['name'].upper() for r in rows])\nprint(f'{names}: {total / len(rows):.2f}')",
        );
        assert!(obs.is_ok(), "{obs:?}");
        assert_eq!(obs.output, "A, B: 3.50\n");
    }

    #[test]
    fn test_runaway_code_becomes_a_fault() {
        let mut ctx = ExecutionContext::new();
        ctx.execute("keep = 1");
        let programs = [
            format!("x = 1{}", " + 1".repeat(20_000)),
            format!("x = {}1{}", "(".repeat(20_000), ")".repeat(20_000)),
            "s = 'ab'\nfor i in range(64):\n    s = s + s".to_string(),
            "grid = [[0] * 1000000] * 1000000".to_string(),
        ];
        for code in &programs {
            let obs = ctx.execute(code);
            assert_eq!(obs.fault.map(|f| f.kind), Some(FaultKind::RuntimeError));
        }
        assert_eq!(ctx.execute("print(keep)").output, "1\n");
    }

    #[test]
    fn test_empty_render() {
        assert_eq!(Observation::default().render(), "(no output)");
    }
}
