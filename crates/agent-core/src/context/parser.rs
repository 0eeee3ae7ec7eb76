//! Recursive-descent parser producing the statement tree

use super::fault::CodeFault;
use super::lexer::{Spanned, Token, tokenize};
use super::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOp {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Args {
    pub positional: Vec<Expr>,
    pub keyword: Vec<(String, Expr)>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FPart {
    Lit(String),
    Expr {
        expr: Expr,
        spec: Option<String>,
        repr: bool,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Const(Value),
    FString(Vec<FPart>),
    Name(String),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    IfElse {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Call {
        func: String,
        args: Args,
    },
    Method {
        recv: Box<Expr>,
        name: String,
        args: Args,
    },
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Slice {
        target: Box<Expr>,
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Comprehension {
        element: Box<Expr>,
        target: Target,
        iter: Box<Expr>,
        cond: Option<Box<Expr>>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Target {
    Name(String),
    Index(Box<Expr>, Box<Expr>),
    Tuple(Vec<Target>),
}

impl Target {
    /// Plain names bound by this target
    pub fn names(&self) -> Vec<&str> {
        match self {
            Self::Name(n) => vec![n.as_str()],
            Self::Index(..) => Vec::new(),
            Self::Tuple(items) => items.iter().flat_map(Self::names).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Assign(Vec<Target>, Expr),
    AugAssign(Target, BinOp, Expr),
    If(Vec<(Expr, Vec<Stmt>)>, Vec<Stmt>),
    For(Target, Expr, Vec<Stmt>),
    Break,
    Continue,
}

const KEYWORDS: [&str; 28] = [
    "and", "as", "assert", "break", "class", "continue", "def", "del", "elif", "else", "except",
    "finally", "for", "from", "global", "if", "import", "in", "is", "lambda", "nonlocal", "not",
    "or", "pass", "raise", "return", "try", "while",
];

const UNSUPPORTED: [&str; 13] = [
    "while", "def", "class", "try", "with", "return", "lambda", "raise", "del", "global",
    "nonlocal", "assert", "yield",
];

const AUG_OPS: [(&str, BinOp); 7] = [
    ("+=", BinOp::Add),
    ("-=", BinOp::Sub),
    ("*=", BinOp::Mul),
    ("/=", BinOp::Div),
    ("//=", BinOp::FloorDiv),
    ("%=", BinOp::Mod),
    ("**=", BinOp::Pow),
];

type PResult<T> = Result<T, CodeFault>;

/// Deepest tree the parser will build: nested brackets, operator chains,
/// unary prefixes, call chains and indented blocks all count
pub const MAX_NESTING: usize = 100;

/// Parse a whole program
pub fn parse(src: &str) -> PResult<Vec<Stmt>> {
    Parser::new(tokenize(src, 1)?).program()
}

/// Parse a single expression (f-string placeholders)
fn parse_expression(src: &str, line: usize, depth: usize) -> PResult<Expr> {
    let mut parser = Parser::new(tokenize(src, line)?);
    parser.depth = depth;
    if matches!(parser.peek(), Token::Newline | Token::Eof) {
        return parser.error("f-string: empty expression not allowed");
    }
    let expr = parser.ternary()?;
    match parser.peek() {
        Token::Newline | Token::Eof => Ok(expr),
        _ => parser.error("f-string: invalid syntax"),
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    loop_depth: usize,
    depth: usize,
}

impl Parser {
    const fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            pos: 0,
            loop_depth: 0,
            depth: 0,
        }
    }

    fn descend(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(CodeFault::runtime(format!(
                "maximum nesting depth ({MAX_NESTING}) exceeded (line {})",
                self.line()
            )));
        }
        Ok(())
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        self.descend()?;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map_or(&Token::Eof, |t| &t.token)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.pos + offset)
            .map_or(&Token::Eof, |t| &t.token)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error<T>(&self, message: &str) -> PResult<T> {
        Err(CodeFault::syntax(message, self.line()))
    }

    fn is_sym(&self, sym: &str) -> bool {
        matches!(self.peek(), Token::Sym(s) if *s == sym)
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        let found = self.is_sym(sym);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect_sym(&mut self, sym: &str) -> PResult<()> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            self.error(&format!("expected '{sym}'"))
        }
    }

    fn is_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Token::Name(n) if n == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        let found = self.is_kw(kw);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect_kw(&mut self, kw: &str) -> PResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            self.error(&format!("expected '{kw}'"))
        }
    }

    fn starts_expr(&self) -> bool {
        match self.peek() {
            Token::Int(_) | Token::Float(_) | Token::Str(_) | Token::FStr(_) => true,
            Token::Name(n) => !KEYWORDS.contains(&n.as_str()) || n == "not",
            Token::Sym(s) => matches!(*s, "(" | "[" | "{" | "-" | "+"),
            _ => false,
        }
    }

    // ---- statements ----

    fn program(&mut self) -> PResult<Vec<Stmt>> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Token::Eof => break,
                Token::Newline => {
                    self.advance();
                }
                Token::Indent => return self.error("unexpected indent"),
                Token::Dedent => {
                    self.advance();
                }
                _ => self.statement(&mut body)?,
            }
        }
        Ok(body)
    }

    fn statement(&mut self, out: &mut Vec<Stmt>) -> PResult<()> {
        if self.is_kw("if") {
            let stmt = self.if_stmt()?;
            out.push(stmt);
            return Ok(());
        }
        if self.is_kw("for") {
            let stmt = self.for_stmt()?;
            out.push(stmt);
            return Ok(());
        }
        if let Token::Name(n) = self.peek() {
            if UNSUPPORTED.contains(&n.as_str()) {
                let message = format!("'{n}' is not supported");
                return self.error(&message);
            }
        }
        self.simple_line(out)
    }

    fn simple_line(&mut self, out: &mut Vec<Stmt>) -> PResult<()> {
        loop {
            if let Some(stmt) = self.small_stmt()? {
                out.push(stmt);
            }
            if self.eat_sym(";") && !matches!(self.peek(), Token::Newline | Token::Eof) {
                continue;
            }
            break;
        }
        match self.peek() {
            Token::Newline => {
                self.advance();
                Ok(())
            }
            Token::Eof => Ok(()),
            _ => self.error("invalid syntax"),
        }
    }

    fn small_stmt(&mut self) -> PResult<Option<Stmt>> {
        if self.eat_kw("pass") {
            return Ok(None);
        }
        if self.is_kw("break") || self.is_kw("continue") {
            if self.loop_depth == 0 {
                return self.error("'break' or 'continue' outside loop");
            }
            let stmt = if self.eat_kw("break") {
                Stmt::Break
            } else {
                self.advance();
                Stmt::Continue
            };
            return Ok(Some(stmt));
        }
        if self.is_kw("import") || self.is_kw("from") {
            // modules are not available; accept the line and move on
            while !matches!(self.peek(), Token::Newline | Token::Eof) && !self.is_sym(";") {
                self.advance();
            }
            return Ok(None);
        }

        let first = self.expr_list()?;

        if self.eat_sym("=") {
            let mut targets = vec![self.to_target(first)?];
            let mut value = self.expr_list()?;
            while self.eat_sym("=") {
                targets.push(self.to_target(value)?);
                value = self.expr_list()?;
            }
            return Ok(Some(Stmt::Assign(targets, value)));
        }

        for (sym, op) in AUG_OPS {
            if self.eat_sym(sym) {
                let target = self.to_target(first)?;
                if matches!(target, Target::Tuple(_)) {
                    return self.error("illegal expression for augmented assignment");
                }
                let value = self.expr_list()?;
                return Ok(Some(Stmt::AugAssign(target, op, value)));
            }
        }

        Ok(Some(Stmt::Expr(first)))
    }

    fn to_target(&self, expr: Expr) -> PResult<Target> {
        match expr {
            Expr::Name(n) => Ok(Target::Name(n)),
            Expr::Index(base, index) => Ok(Target::Index(base, index)),
            Expr::Tuple(items) | Expr::List(items) => Ok(Target::Tuple(
                items
                    .into_iter()
                    .map(|e| self.to_target(e))
                    .collect::<PResult<_>>()?,
            )),
            Expr::Attr(..) => self.error("cannot assign to attribute"),
            Expr::Slice { .. } => self.error("slice assignment is not supported"),
            _ => self.error("cannot assign to expression"),
        }
    }

    fn suite(&mut self) -> PResult<Vec<Stmt>> {
        self.nested(Self::block)
    }

    fn block(&mut self) -> PResult<Vec<Stmt>> {
        let mut body = Vec::new();
        if !matches!(self.peek(), Token::Newline) {
            self.simple_line(&mut body)?;
            return Ok(body);
        }
        self.advance();
        if !matches!(self.peek(), Token::Indent) {
            return self.error("expected an indented block");
        }
        self.advance();
        loop {
            match self.peek() {
                Token::Dedent => {
                    self.advance();
                    break;
                }
                Token::Eof => break,
                Token::Newline => {
                    self.advance();
                }
                _ => self.statement(&mut body)?,
            }
        }
        Ok(body)
    }

    fn if_stmt(&mut self) -> PResult<Stmt> {
        self.expect_kw("if")?;
        let mut branches = Vec::new();
        let cond = self.ternary()?;
        self.expect_sym(":")?;
        branches.push((cond, self.suite()?));

        let mut orelse = Vec::new();
        loop {
            if self.eat_kw("elif") {
                let cond = self.ternary()?;
                self.expect_sym(":")?;
                branches.push((cond, self.suite()?));
            } else if self.eat_kw("else") {
                self.expect_sym(":")?;
                orelse = self.suite()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt::If(branches, orelse))
    }

    fn for_stmt(&mut self) -> PResult<Stmt> {
        self.expect_kw("for")?;
        let target = self.for_target()?;
        self.expect_kw("in")?;
        let iter = self.expr_list()?;
        self.expect_sym(":")?;
        self.loop_depth += 1;
        let body = self.suite();
        self.loop_depth -= 1;
        Ok(Stmt::For(target, iter, body?))
    }

    fn for_target(&mut self) -> PResult<Target> {
        let mut items = vec![self.single_target()?];
        while self.eat_sym(",") {
            if self.is_kw("in") {
                break;
            }
            items.push(self.single_target()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Target::Tuple(items)
        })
    }

    fn single_target(&mut self) -> PResult<Target> {
        if self.eat_sym("(") {
            let inner = self.for_target()?;
            self.expect_sym(")")?;
            return Ok(inner);
        }
        match self.advance() {
            Token::Name(n) if !KEYWORDS.contains(&n.as_str()) => Ok(Target::Name(n)),
            _ => self.error("invalid loop target"),
        }
    }

    // ---- expressions ----

    /// Comma-separated expressions; more than one becomes a tuple
    fn expr_list(&mut self) -> PResult<Expr> {
        let first = self.ternary()?;
        if !self.is_sym(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_sym(",") {
            if !self.starts_expr() {
                break;
            }
            items.push(self.ternary()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn ternary(&mut self) -> PResult<Expr> {
        self.nested(Self::conditional)
    }

    fn conditional(&mut self) -> PResult<Expr> {
        let then = self.or_expr()?;
        if !self.eat_kw("if") {
            return Ok(then);
        }
        let cond = self.or_expr()?;
        self.expect_kw("else")?;
        let otherwise = self.ternary()?;
        Ok(Expr::IfElse {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn or_expr(&mut self) -> PResult<Expr> {
        let saved = self.depth;
        let mut left = self.and_expr()?;
        while self.eat_kw("or") {
            self.descend()?;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth = saved;
        Ok(left)
    }

    fn and_expr(&mut self) -> PResult<Expr> {
        let saved = self.depth;
        let mut left = self.not_expr()?;
        while self.eat_kw("and") {
            self.descend()?;
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth = saved;
        Ok(left)
    }

    fn not_expr(&mut self) -> PResult<Expr> {
        if self.eat_kw("not") {
            let inner = self.nested(Self::not_expr)?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let followed_by = |p: &Self, kw: &str| matches!(p.peek_at(1), Token::Name(m) if m == kw);
        let (op, width) = match self.peek() {
            Token::Sym("==") => (CmpOp::Eq, 1),
            Token::Sym("!=") => (CmpOp::Ne, 1),
            Token::Sym("<") => (CmpOp::Lt, 1),
            Token::Sym("<=") => (CmpOp::Le, 1),
            Token::Sym(">") => (CmpOp::Gt, 1),
            Token::Sym(">=") => (CmpOp::Ge, 1),
            Token::Name(n) if n == "in" => (CmpOp::In, 1),
            Token::Name(n) if n == "not" && followed_by(self, "in") => (CmpOp::NotIn, 2),
            Token::Name(n) if n == "is" && followed_by(self, "not") => (CmpOp::IsNot, 2),
            Token::Name(n) if n == "is" => (CmpOp::Is, 1),
            _ => return None,
        };
        self.pos += width;
        Some(op)
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let first = self.arith()?;
        let mut rest = Vec::new();
        while let Some(op) = self.comparison_op() {
            rest.push((op, self.arith()?));
        }
        Ok(if rest.is_empty() {
            first
        } else {
            Expr::Compare(Box::new(first), rest)
        })
    }

    fn arith(&mut self) -> PResult<Expr> {
        let saved = self.depth;
        let mut left = self.term()?;
        loop {
            let op = if self.eat_sym("+") {
                BinOp::Add
            } else if self.eat_sym("-") {
                BinOp::Sub
            } else {
                break;
            };
            self.descend()?;
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = saved;
        Ok(left)
    }

    fn term(&mut self) -> PResult<Expr> {
        let saved = self.depth;
        let mut left = self.factor()?;
        loop {
            let op = if self.eat_sym("*") {
                BinOp::Mul
            } else if self.eat_sym("/") {
                BinOp::Div
            } else if self.eat_sym("//") {
                BinOp::FloorDiv
            } else if self.eat_sym("%") {
                BinOp::Mod
            } else {
                break;
            };
            self.descend()?;
            let right = self.factor()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = saved;
        Ok(left)
    }

    fn factor(&mut self) -> PResult<Expr> {
        if self.eat_sym("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.nested(Self::factor)?)));
        }
        if self.eat_sym("+") {
            return Ok(Expr::Unary(UnaryOp::Pos, Box::new(self.nested(Self::factor)?)));
        }
        self.power()
    }

    fn power(&mut self) -> PResult<Expr> {
        let base = self.postfix()?;
        if self.eat_sym("**") {
            let exponent = self.nested(Self::factor)?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let saved = self.depth;
        let mut expr = self.atom()?;
        loop {
            if self.is_sym("(") || self.is_sym("[") || self.is_sym(".") {
                self.descend()?;
            }
            if self.eat_sym("(") {
                let args = self.call_args()?;
                expr = match expr {
                    Expr::Name(func) => Expr::Call { func, args },
                    Expr::Attr(recv, name) => Expr::Method { recv, name, args },
                    _ => return self.error("expression is not callable"),
                };
            } else if self.eat_sym("[") {
                expr = self.subscript(expr)?;
            } else if self.eat_sym(".") {
                match self.advance() {
                    Token::Name(name) => expr = Expr::Attr(Box::new(expr), name),
                    _ => return self.error("expected attribute name"),
                }
            } else {
                self.depth = saved;
                return Ok(expr);
            }
        }
    }

    fn call_args(&mut self) -> PResult<Args> {
        let mut args = Args::default();
        if self.eat_sym(")") {
            return Ok(args);
        }
        loop {
            let keyword = match (self.peek(), self.peek_at(1)) {
                (Token::Name(n), Token::Sym("=")) => Some(n.clone()),
                _ => None,
            };
            if let Some(name) = keyword {
                self.pos += 2;
                let value = self.ternary()?;
                args.keyword.push((name, value));
            } else {
                let mut value = self.ternary()?;
                if self.is_kw("for") {
                    value = self.comprehension(value)?;
                }
                args.positional.push(value);
            }
            if self.eat_sym(",") {
                if self.eat_sym(")") {
                    break;
                }
                continue;
            }
            self.expect_sym(")")?;
            break;
        }
        Ok(args)
    }

    fn subscript(&mut self, target: Expr) -> PResult<Expr> {
        let lower = if self.is_sym(":") {
            None
        } else {
            Some(Box::new(self.ternary()?))
        };
        if !self.eat_sym(":") {
            self.expect_sym("]")?;
            let Some(index) = lower else {
                return self.error("invalid syntax");
            };
            return Ok(Expr::Index(Box::new(target), index));
        }
        let upper = if self.is_sym(":") || self.is_sym("]") {
            None
        } else {
            Some(Box::new(self.ternary()?))
        };
        let step = if self.eat_sym(":") && !self.is_sym("]") {
            Some(Box::new(self.ternary()?))
        } else {
            None
        };
        self.expect_sym("]")?;
        Ok(Expr::Slice {
            target: Box::new(target),
            lower,
            upper,
            step,
        })
    }

    fn comprehension(&mut self, element: Expr) -> PResult<Expr> {
        self.expect_kw("for")?;
        let target = self.for_target()?;
        self.expect_kw("in")?;
        let iter = self.or_expr()?;
        let cond = if self.eat_kw("if") {
            Some(Box::new(self.or_expr()?))
        } else {
            None
        };
        if self.is_kw("for") {
            return self.error("nested comprehensions are not supported");
        }
        Ok(Expr::Comprehension {
            element: Box::new(element),
            target,
            iter: Box::new(iter),
            cond,
        })
    }

    fn atom(&mut self) -> PResult<Expr> {
        match self.advance() {
            Token::Int(i) => Ok(Expr::Const(Value::Int(i))),
            Token::Float(f) => Ok(Expr::Const(Value::Float(f))),
            Token::Str(mut s) => {
                // adjacent literals concatenate
                while let Token::Str(next) = self.peek().clone() {
                    s.push_str(&next);
                    self.pos += 1;
                }
                Ok(Expr::Const(Value::Str(s)))
            }
            Token::FStr(raw) => self.fstring(&raw),
            Token::Name(n) => match n.as_str() {
                "None" => Ok(Expr::Const(Value::None)),
                "True" => Ok(Expr::Const(Value::Bool(true))),
                "False" => Ok(Expr::Const(Value::Bool(false))),
                "lambda" => self.error("'lambda' is not supported"),
                kw if KEYWORDS.contains(&kw) => self.error("invalid syntax"),
                _ => Ok(Expr::Name(n)),
            },
            Token::Sym("(") => {
                if self.eat_sym(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.ternary()?;
                if self.is_kw("for") {
                    let comp = self.comprehension(first)?;
                    self.expect_sym(")")?;
                    return Ok(comp);
                }
                if !self.is_sym(",") {
                    self.expect_sym(")")?;
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_sym(",") {
                    if self.is_sym(")") {
                        break;
                    }
                    items.push(self.ternary()?);
                }
                self.expect_sym(")")?;
                Ok(Expr::Tuple(items))
            }
            Token::Sym("[") => {
                if self.eat_sym("]") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.ternary()?;
                if self.is_kw("for") {
                    let comp = self.comprehension(first)?;
                    self.expect_sym("]")?;
                    return Ok(comp);
                }
                let mut items = vec![first];
                while self.eat_sym(",") {
                    if self.is_sym("]") {
                        break;
                    }
                    items.push(self.ternary()?);
                }
                self.expect_sym("]")?;
                Ok(Expr::List(items))
            }
            Token::Sym("{") => {
                let mut pairs = Vec::new();
                while !self.eat_sym("}") {
                    let key = self.ternary()?;
                    self.expect_sym(":")?;
                    let value = self.ternary()?;
                    pairs.push((key, value));
                    if !self.eat_sym(",") {
                        self.expect_sym("}")?;
                        break;
                    }
                }
                Ok(Expr::Dict(pairs))
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                self.error("invalid syntax")
            }
        }
    }

    fn fstring(&self, raw: &str) -> PResult<Expr> {
        let chars: Vec<char> = raw.chars().collect();
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();
            match c {
                '{' if next == Some('{') => {
                    literal.push('{');
                    i += 2;
                }
                '}' if next == Some('}') => {
                    literal.push('}');
                    i += 2;
                }
                '}' => return self.error("f-string: single '}' is not allowed"),
                '{' => {
                    let (part, end) = self.placeholder(&chars, i + 1)?;
                    if !literal.is_empty() {
                        parts.push(FPart::Lit(std::mem::take(&mut literal)));
                    }
                    parts.push(part);
                    i = end + 1;
                }
                _ => {
                    literal.push(c);
                    i += 1;
                }
            }
        }
        if !literal.is_empty() {
            parts.push(FPart::Lit(literal));
        }
        Ok(Expr::FString(parts))
    }

    /// Parse `{expr[!r][:spec]}` starting after the brace; returns the part
    /// and the index of the closing brace
    fn placeholder(&self, chars: &[char], start: usize) -> PResult<(FPart, usize)> {
        let mut depth = 0i32;
        let mut quote: Option<char> = None;
        let mut colon = None;
        let mut bang = None;
        let mut j = start;

        while j < chars.len() {
            let d = chars[j];
            if let Some(q) = quote {
                if d == q {
                    quote = None;
                }
            } else {
                match d {
                    '\'' | '"' => quote = Some(d),
                    '(' | '[' | '{' => depth += 1,
                    ')' | ']' => depth -= 1,
                    '}' if depth == 0 => break,
                    '}' => depth -= 1,
                    ':' if depth == 0 && colon.is_none() => colon = Some(j),
                    '!' if depth == 0 && colon.is_none() && chars.get(j + 1) != Some(&'=') => {
                        bang = Some(j);
                    }
                    _ => {}
                }
            }
            j += 1;
        }
        if j >= chars.len() {
            return self.error("f-string: expecting '}'");
        }

        let expr_end = bang.or(colon).unwrap_or(j);
        let source: String = chars[start..expr_end].iter().collect();
        let expr = parse_expression(source.trim(), self.line(), self.depth)?;
        let conversion: Option<String> =
            bang.map(|b| chars[b + 1..colon.unwrap_or(j)].iter().collect());
        let repr = match conversion.as_deref() {
            None | Some("s") => false,
            Some("r") => true,
            Some(_) => return self.error("f-string: invalid conversion character"),
        };
        let spec = colon.map(|c| chars[c + 1..j].iter().collect());
        Ok((FPart::Expr { expr, spec, repr }, j))
    }
}
