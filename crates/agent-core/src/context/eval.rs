//! Tree-walking evaluator

use std::collections::HashMap;

use super::builtins::{self, BUILTINS};
use super::fault::CodeFault;
use super::methods::{self, MUTATING};
use super::ops;
use super::parser::{Args, Expr, FPart, MAX_NESTING, Stmt, Target, UnaryOp};
use super::value::Value;

type EResult<T> = Result<T, CodeFault>;

/// Statements (and loop iterations) one execution may run
const MAX_STEPS: usize = 1_000_000;

/// Elements (string bytes included) one execution may store into containers
const MAX_ALLOCATION: usize = 10_000_000;

/// Deepest container nesting a stored value may have
const MAX_VALUE_DEPTH: usize = 100;

enum Flow {
    Normal,
    Break,
    Continue,
}

pub struct Interpreter<'a> {
    vars: &'a mut HashMap<String, Value>,
    out: &'a mut String,
    steps: usize,
    depth: usize,
    allocated: usize,
}

impl<'a> Interpreter<'a> {
    pub fn new(vars: &'a mut HashMap<String, Value>, out: &'a mut String) -> Self {
        Self {
            vars,
            out,
            steps: 0,
            depth: 0,
            allocated: 0,
        }
    }

    pub fn run(&mut self, program: &[Stmt]) -> EResult<()> {
        self.block(program).map(|_| ())
    }

    fn tick(&mut self) -> EResult<()> {
        self.steps += 1;
        if self.steps > MAX_STEPS {
            return Err(CodeFault::runtime("execution step limit exceeded"));
        }
        Ok(())
    }

    /// Account for `value` being stored `levels` containers deep
    fn charge(&mut self, value: &Value, levels: usize) -> EResult<()> {
        check_depth(value, levels)?;
        self.allocated = self.allocated.saturating_add(value.weight());
        if self.allocated > MAX_ALLOCATION {
            return Err(CodeFault::runtime("memory limit exceeded"));
        }
        Ok(())
    }

    fn block(&mut self, stmts: &[Stmt]) -> EResult<Flow> {
        for stmt in stmts {
            match self.stmt(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn stmt(&mut self, stmt: &Stmt) -> EResult<Flow> {
        self.tick()?;
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr)?;
            }
            Stmt::Assign(targets, value) => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            Stmt::AugAssign(target, op, value) => {
                let current = match target {
                    Target::Name(name) => self.lookup(name)?,
                    Target::Index(base, index) => {
                        let base = self.eval(base)?;
                        let key = self.eval(index)?;
                        index_value(&base, &key)?
                    }
                    Target::Tuple(_) => {
                        return Err(CodeFault::type_error(
                            "illegal expression for augmented assignment",
                        ));
                    }
                };
                let rhs = self.eval(value)?;
                let updated = ops::binary(*op, &current, &rhs)?;
                self.assign(target, updated)?;
            }
            Stmt::If(branches, orelse) => {
                for (cond, body) in branches {
                    if self.eval(cond)?.truthy() {
                        return self.block(body);
                    }
                }
                return self.block(orelse);
            }
            Stmt::For(target, iter, body) => {
                for item in self.eval(iter)?.iterate()? {
                    self.tick()?;
                    self.assign(target, item)?;
                    if let Flow::Break = self.block(body)? {
                        break;
                    }
                }
            }
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
        }
        Ok(Flow::Normal)
    }

    fn lookup(&self, name: &str) -> EResult<Value> {
        self.vars.get(name).cloned().ok_or_else(|| CodeFault::name_error(name))
    }

    fn assign(&mut self, target: &Target, value: Value) -> EResult<()> {
        match target {
            Target::Name(name) => {
                check_depth(&value, 0)?;
                self.vars.insert(name.clone(), value);
                Ok(())
            }
            Target::Index(base, index) => {
                self.charge(&value, index_levels(base) + 1)?;
                let key = self.eval(index)?;
                let container = self.place(base)?;
                set_item(container, key, value)
            }
            Target::Tuple(targets) => {
                let items = value.iterate()?;
                if items.len() != targets.len() {
                    let message = if items.len() > targets.len() {
                        format!("too many values to unpack (expected {})", targets.len())
                    } else {
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            items.len()
                        )
                    };
                    return Err(CodeFault::value_error(message));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item)?;
                }
                Ok(())
            }
        }
    }

    /// Root variable and evaluated index path of an assignable expression
    fn place_path(&mut self, expr: &Expr) -> EResult<(String, Vec<Value>)> {
        match expr {
            Expr::Name(name) => Ok((name.clone(), Vec::new())),
            Expr::Index(base, index) => {
                let (root, mut path) = self.place_path(base)?;
                path.push(self.eval(index)?);
                Ok((root, path))
            }
            _ => Err(CodeFault::type_error("cannot assign through a temporary value")),
        }
    }

    fn place(&mut self, expr: &Expr) -> EResult<&mut Value> {
        let (root, path) = self.place_path(expr)?;
        let mut slot = self
            .vars
            .get_mut(&root)
            .ok_or_else(|| CodeFault::name_error(&root))?;
        for key in &path {
            slot = item_mut(slot, key)?;
        }
        Ok(slot)
    }

    fn eval_args(&mut self, args: &Args) -> EResult<(Vec<Value>, Vec<(String, Value)>)> {
        let positional = args
            .positional
            .iter()
            .map(|e| self.eval(e))
            .collect::<EResult<Vec<_>>>()?;
        let keyword = args
            .keyword
            .iter()
            .map(|(k, e)| Ok((k.clone(), self.eval(e)?)))
            .collect::<EResult<Vec<_>>>()?;
        Ok((positional, keyword))
    }

    pub fn eval(&mut self, expr: &Expr) -> EResult<Value> {
        if self.depth >= MAX_NESTING {
            return Err(CodeFault::runtime("maximum recursion depth exceeded"));
        }
        self.depth += 1;
        let value = self.eval_expr(expr);
        self.depth -= 1;
        value
    }

    #[allow(clippy::too_many_lines)]
    fn eval_expr(&mut self, expr: &Expr) -> EResult<Value> {
        match expr {
            Expr::Const(v) => Ok(v.clone()),
            Expr::Name(name) => self.lookup(name),
            Expr::FString(parts) => {
                let mut text = String::new();
                for part in parts {
                    match part {
                        FPart::Lit(s) => text.push_str(s),
                        FPart::Expr { expr, spec, repr } => {
                            let value = self.eval(expr)?;
                            let rendered = match spec {
                                Some(spec) => ops::format_spec(&value, spec)?,
                                None if *repr => value.repr(),
                                None => value.to_string(),
                            };
                            text.push_str(&rendered);
                        }
                    }
                }
                Ok(Value::Str(text))
            }
            Expr::List(items) => Ok(Value::List(self.eval_all(items)?)),
            Expr::Tuple(items) => Ok(Value::Tuple(self.eval_all(items)?)),
            Expr::Dict(pairs) => {
                let mut entries: Vec<(String, Value)> = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let key = match self.eval(k)? {
                        Value::Str(s) => s,
                        other => {
                            return Err(CodeFault::type_error(format!(
                                "dict keys must be str, not {}",
                                other.type_name()
                            )));
                        }
                    };
                    let value = self.eval(v)?;
                    match Value::dict_get(&entries, &key) {
                        Some(i) => entries[i].1 = value,
                        None => entries.push((key, value)),
                    }
                }
                Ok(Value::Dict(entries))
            }
            Expr::Unary(op, inner) => {
                let value = self.eval(inner)?;
                unary(*op, &value)
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                ops::binary(*op, &left, &right)
            }
            Expr::Compare(first, rest) => {
                let mut left = self.eval(first)?;
                for (op, right) in rest {
                    let right = self.eval(right)?;
                    if !ops::compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::And(left, right) => {
                let left = self.eval(left)?;
                if left.truthy() { self.eval(right) } else { Ok(left) }
            }
            Expr::Or(left, right) => {
                let left = self.eval(left)?;
                if left.truthy() { Ok(left) } else { self.eval(right) }
            }
            Expr::IfElse {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Call { func, args } => {
                if !BUILTINS.contains(&func.as_str()) {
                    return Err(if self.vars.contains_key(func) {
                        CodeFault::type_error(format!(
                            "'{}' object is not callable",
                            self.lookup(func)?.type_name()
                        ))
                    } else {
                        CodeFault::name_error(func)
                    });
                }
                let (positional, keyword) = self.eval_args(args)?;
                builtins::call(func, positional, &keyword, self.out)
            }
            Expr::Method { recv, name, args } => {
                let (positional, keyword) = self.eval_args(args)?;
                if MUTATING.contains(&name.as_str()) && is_place(recv) {
                    for arg in &positional {
                        self.charge(arg, index_levels(recv) + 1)?;
                    }
                    let target = self.place(recv)?;
                    return methods::call(target, name, positional, &keyword);
                }
                let mut value = self.eval(recv)?;
                methods::call(&mut value, name, positional, &keyword)
            }
            Expr::Attr(recv, name) => {
                let value = self.eval(recv)?;
                Err(CodeFault::attribute(value.type_name(), name))
            }
            Expr::Index(target, index) => {
                let target = self.eval(target)?;
                let key = self.eval(index)?;
                index_value(&target, &key)
            }
            Expr::Slice {
                target,
                lower,
                upper,
                step,
            } => {
                let target = self.eval(target)?;
                let lower = self.slice_bound(lower.as_deref())?;
                let upper = self.slice_bound(upper.as_deref())?;
                let step = self.slice_bound(step.as_deref())?;
                slice_value(&target, lower, upper, step)
            }
            Expr::Comprehension {
                element,
                target,
                iter,
                cond,
            } => {
                let items = self.eval(iter)?.iterate()?;
                // loop variables do not leak into the namespace
                let saved: Vec<(String, Option<Value>)> = target
                    .names()
                    .into_iter()
                    .map(|n| (n.to_string(), self.vars.get(n).cloned()))
                    .collect();
                let result = self.comprehend(element, target, items, cond.as_deref());
                for (name, previous) in saved {
                    match previous {
                        Some(v) => self.vars.insert(name, v),
                        None => self.vars.remove(&name),
                    };
                }
                result.map(Value::List)
            }
        }
    }

    fn eval_all(&mut self, items: &[Expr]) -> EResult<Vec<Value>> {
        items.iter().map(|e| self.eval(e)).collect()
    }

    fn comprehend(
        &mut self,
        element: &Expr,
        target: &Target,
        items: Vec<Value>,
        cond: Option<&Expr>,
    ) -> EResult<Vec<Value>> {
        let mut out = Vec::new();
        for item in items {
            self.tick()?;
            self.assign(target, item)?;
            if let Some(cond) = cond {
                if !self.eval(cond)?.truthy() {
                    continue;
                }
            }
            let value = self.eval(element)?;
            self.charge(&value, 1)?;
            out.push(value);
        }
        Ok(out)
    }

    fn slice_bound(&mut self, expr: Option<&Expr>) -> EResult<Option<i64>> {
        let Some(expr) = expr else { return Ok(None) };
        match self.eval(expr)? {
            Value::None => Ok(None),
            v => v.as_int().map(Some).ok_or_else(|| {
                CodeFault::type_error("slice indices must be integers or None")
            }),
        }
    }
}

fn check_depth(value: &Value, levels: usize) -> EResult<()> {
    if value.depth() + levels > MAX_VALUE_DEPTH {
        return Err(CodeFault::runtime(format!(
            "value nested more than {MAX_VALUE_DEPTH} containers deep"
        )));
    }
    Ok(())
}

/// Subscripts between a place expression and its root variable
fn index_levels(expr: &Expr) -> usize {
    match expr {
        Expr::Index(base, _) => 1 + index_levels(base),
        _ => 0,
    }
}

fn is_place(expr: &Expr) -> bool {
    match expr {
        Expr::Name(_) => true,
        Expr::Index(base, _) => is_place(base),
        _ => false,
    }
}

fn unary(op: UnaryOp, value: &Value) -> EResult<Value> {
    match (op, value) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy())),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
        (op, v) => {
            let Some(i) = v.as_int() else {
                let symbol = if op == UnaryOp::Neg { '-' } else { '+' };
                return Err(CodeFault::type_error(format!(
                    "bad operand type for unary {symbol}: '{}'",
                    v.type_name()
                )));
            };
            if op == UnaryOp::Neg {
                i.checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| CodeFault::runtime("integer overflow"))
            } else {
                Ok(Value::Int(i))
            }
        }
    }
}

/// Resolve a possibly negative index against `len`
fn normalize(len: usize, key: &Value, what: &str) -> EResult<usize> {
    let i = key.as_int().ok_or_else(|| {
        CodeFault::type_error(format!(
            "{what} indices must be integers, not {}",
            key.type_name()
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

fn dict_key<'v>(key: &'v Value) -> EResult<&'v str> {
    match key {
        Value::Str(s) => Ok(s),
        other => Err(CodeFault::key_error(&other.to_string())),
    }
}

fn index_value(target: &Value, key: &Value) -> EResult<Value> {
    match target {
        Value::List(items) | Value::Tuple(items) => {
            Ok(items[normalize(items.len(), key, target.type_name())?].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = normalize(chars.len(), key, "string")?;
            Ok(Value::Str(chars[i].to_string()))
        }
        Value::Dict(entries) => {
            let k = dict_key(key)?;
            Value::dict_get(entries, k)
                .map(|i| entries[i].1.clone())
                .ok_or_else(|| CodeFault::key_error(k))
        }
        other => Err(CodeFault::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn item_mut<'v>(container: &'v mut Value, key: &Value) -> EResult<&'v mut Value> {
    match container {
        Value::List(items) => {
            let i = normalize(items.len(), key, "list")?;
            Ok(&mut items[i])
        }
        Value::Dict(entries) => {
            let k = dict_key(key)?;
            match Value::dict_get(entries, k) {
                Some(i) => Ok(&mut entries[i].1),
                None => Err(CodeFault::key_error(k)),
            }
        }
        other => Err(CodeFault::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

fn set_item(container: &mut Value, key: Value, value: Value) -> EResult<()> {
    match container {
        Value::List(items) => {
            let i = normalize(items.len(), &key, "list")?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(entries) => {
            let Value::Str(k) = key else {
                return Err(CodeFault::type_error(format!(
                    "dict keys must be str, not {}",
                    key.type_name()
                )));
            };
            match Value::dict_get(entries, &k) {
                Some(i) => entries[i].1 = value,
                None => entries.push((k, value)),
            }
            Ok(())
        }
        other => Err(CodeFault::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

fn slice_indices(len: usize, lower: Option<i64>, upper: Option<i64>, step: Option<i64>) -> EResult<Vec<usize>> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(CodeFault::value_error("slice step cannot be zero"));
    }
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let bound = |v: Option<i64>, default: i64, lo: i64, hi: i64| {
        v.map_or(default, |v| (if v < 0 { v + len } else { v }).clamp(lo, hi))
    };

    let mut out = Vec::new();
    if step > 0 {
        let mut i = bound(lower, 0, 0, len);
        let stop = bound(upper, len, 0, len);
        while i < stop {
            out.push(usize::try_from(i).unwrap_or(0));
            i += step;
        }
    } else {
        let mut i = bound(lower, len - 1, -1, len - 1);
        let stop = bound(upper, -1, -1, len - 1);
        while i > stop {
            out.push(usize::try_from(i).unwrap_or(0));
            i += step;
        }
    }
    Ok(out)
}

fn slice_value(target: &Value, lower: Option<i64>, upper: Option<i64>, step: Option<i64>) -> EResult<Value> {
    match target {
        Value::List(items) | Value::Tuple(items) => {
            let picked: Vec<Value> = slice_indices(items.len(), lower, upper, step)?
                .into_iter()
                .map(|i| items[i].clone())
                .collect();
            Ok(if matches!(target, Value::Tuple(_)) {
                Value::Tuple(picked)
            } else {
                Value::List(picked)
            })
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::Str(
                slice_indices(chars.len(), lower, upper, step)?
                    .into_iter()
                    .map(|i| chars[i])
                    .collect(),
            ))
        }
        other => Err(CodeFault::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::parser::parse;

    fn run(src: &str) -> (String, Result<(), CodeFault>, HashMap<String, Value>) {
        let mut vars = HashMap::new();
        let mut out = String::new();
        let program = parse(src).unwrap();
        let result = Interpreter::new(&mut vars, &mut out).run(&program);
        (out, result, vars)
    }

    #[test]
    fn test_slices() {
        let (out, result, _) = run("s = 'abcdef'\nxs = [0, 1, 2, 3, 4]\nprint(s[::-1], s[1:3], xs[-2:], xs[::2])");
        result.unwrap();
        assert_eq!(out, "fedcba bc [3, 4] [0, 2, 4]\n");
    }

    #[test]
    fn test_nested_item_assignment_and_mutation() {
        let (_, result, vars) = run("d = {'rows': []}\nd['rows'].append({'n': 1})\nd['rows'][0]['n'] += 5\nd['total'] = len(d['rows'])");
        result.unwrap();
        assert_eq!(vars["d"].to_string(), "{'rows': [{'n': 6}], 'total': 1}");
    }

    #[test]
    fn test_loops_and_control_flow() {
        let src = "found = None\nfor i in range(10):\n    if i % 2 == 0:\n        continue\n    if i > 5:\n        found = i\n        break\nprint(found)";
        let (out, result, _) = run(src);
        result.unwrap();
        assert_eq!(out, "7\n");
    }

    #[test]
    fn test_comprehension_does_not_leak() {
        let (out, result, vars) = run("squares = [n * n for n in range(4) if n]\nprint(squares, sum(x for x in squares))");
        result.unwrap();
        assert_eq!(out, "[1, 4, 9] 14\n");
        assert!(!vars.contains_key("n"));
    }

    #[test]
    fn test_tuple_unpacking() {
        let (out, result, _) = run("a, b = 1, 2\na, b = b, a\nfor k, v in {'x': 1}.items():\n    print(k, v, a, b)");
        result.unwrap();
        assert_eq!(out, "x 1 2 1\n");
        let (_, result, _) = run("a, b = [1, 2, 3]");
        assert_eq!(result.unwrap_err().to_string(), "ValueError: too many values to unpack (expected 2)");
    }

    #[test]
    fn test_fault_keeps_earlier_effects() {
        let (out, result, vars) = run("x = 1\nprint('before')\ny = {}['missing']\nx = 2");
        assert_eq!(out, "before\n");
        assert_eq!(result.unwrap_err().to_string(), "KeyError: 'missing'");
        assert_eq!(vars["x"], Value::Int(1));
    }

    #[test]
    fn test_step_limit() {
        let (_, result, _) = run("n = 0\nfor i in range(1000000):\n    for j in range(1000000):\n        n += 1");
        assert_eq!(result.unwrap_err().kind, crate::context::FaultKind::RuntimeError);
    }

    #[test]
    fn test_growth_is_bounded() {
        let cases = [
            "s = 'ab'\nfor i in range(100):\n    s = s + s",
            "xs = [0]\nfor i in range(100):\n    xs = xs + xs",
            "big = [[0] * 1000000] * 1000000",
            "row = [0] * 100000\nrows = []\nfor i in range(1000):\n    rows.append(row)",
            "row = 'x' * 1000000\nd = {}\nfor i in range(100):\n    d[str(i)] = row",
            "row = [0] * 100000\ngrid = [row for i in range(1000)]",
            "x = []\nfor i in range(1000):\n    x = [x]",
            "d = {'a': []}\nfor i in range(1000):\n    d['a'].append(d)",
        ];
        for src in cases {
            let (_, result, _) = run(src);
            let fault = result.unwrap_err();
            assert_eq!(fault.kind, crate::context::FaultKind::RuntimeError, "{src}: {fault}");
        }
    }

    #[test]
    fn test_ordinary_collections_fit() {
        let (out, result, _) = run(
            "rows = []\nfor i in range(10000):\n    rows.append({'id': i, 'name': 'row ' + str(i)})\nx = [[1, 2], [3]] * 3\nprint(len(rows), len(x), [] * 1000000000)",
        );
        result.unwrap();
        assert_eq!(out, "10000 6 []\n");
    }

    #[test]
    fn test_name_and_call_errors() {
        let (_, result, _) = run("print(undefined)");
        assert_eq!(result.unwrap_err().to_string(), "NameError: name 'undefined' is not defined");
        let (_, result, _) = run("x = 3\nx()");
        assert_eq!(result.unwrap_err().to_string(), "TypeError: 'int' object is not callable");
        let (_, result, _) = run("'abc'.nope()");
        assert_eq!(result.unwrap_err().kind, crate::context::FaultKind::AttributeError);
    }
}
