//! Tokenizer
//!
//! Produces a flat token stream with `Indent`/`Dedent` markers the way
//! Python does. Newlines inside brackets are insignificant.

use super::fault::CodeFault;

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    /// Raw body of an f-string; placeholders are split out by the parser
    FStr(String),
    Name(String),
    Sym(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Clone, Debug)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

// Longest first, so `**=` wins over `**` and `*`
const SYMBOLS: [&str; 31] = [
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "+", "-",
    "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";",
];

const STRING_PREFIXES: [&str; 8] = ["f", "r", "b", "u", "rf", "fr", "rb", "br"];

/// Tokenize a program; line numbers start at `first_line`
pub fn tokenize(src: &str, first_line: usize) -> Result<Vec<Spanned>, CodeFault> {
    Lexer {
        chars: src.replace("\r\n", "\n").chars().collect(),
        pos: 0,
        line: first_line,
        depth: 0,
        indents: vec![0],
        tokens: Vec::new(),
        at_line_start: true,
    }
    .run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Spanned>,
    at_line_start: bool,
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, token: Token) {
        self.tokens.push(Spanned {
            token,
            line: self.line,
        });
    }

    fn push_newline(&mut self) {
        if self
            .tokens
            .last()
            .is_some_and(|t| !matches!(t.token, Token::Newline | Token::Indent | Token::Dedent))
        {
            self.push(Token::Newline);
        }
    }

    fn error<T>(&self, message: &str) -> Result<T, CodeFault> {
        Err(CodeFault::syntax(message, self.line))
    }

    fn run(mut self) -> Result<Vec<Spanned>, CodeFault> {
        loop {
            if self.at_line_start && self.depth == 0 {
                let mut width = 0;
                while let Some(c) = self.peek() {
                    match c {
                        ' ' => width += 1,
                        '\t' => width += 4,
                        _ => break,
                    }
                    self.pos += 1;
                }
                match self.peek() {
                    None => break,
                    Some('\n') => {
                        self.pos += 1;
                        self.line += 1;
                        continue;
                    }
                    Some('#') => {
                        self.skip_comment();
                        continue;
                    }
                    Some(_) => {}
                }
                self.indent_to(width)?;
                self.at_line_start = false;
            }

            let Some(c) = self.peek() else { break };
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        self.push_newline();
                        self.at_line_start = true;
                    }
                    self.line += 1;
                }
                ' ' | '\t' | '\r' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\'' | '"' => {
                    let token = self.string(false, false)?;
                    self.push(token);
                }
                c if c.is_ascii_digit()
                    || (c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit())) =>
                {
                    let token = self.number()?;
                    self.push(token);
                }
                c if c.is_alphabetic() || c == '_' => self.word()?,
                _ => self.symbol()?,
            }
        }

        self.push_newline();
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Token::Dedent);
        }
        self.push(Token::Eof);
        Ok(self.tokens)
    }

    fn skip_comment(&mut self) {
        while self.peek().is_some_and(|c| c != '\n') {
            self.pos += 1;
        }
    }

    fn indent_to(&mut self, width: usize) -> Result<(), CodeFault> {
        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(Token::Indent);
            return Ok(());
        }
        while width < self.indents.last().copied().unwrap_or(0) {
            self.indents.pop();
            self.push(Token::Dedent);
        }
        if width == self.indents.last().copied().unwrap_or(0) {
            Ok(())
        } else {
            self.error("unindent does not match any outer indentation level")
        }
    }

    fn word(&mut self) -> Result<(), CodeFault> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();

        let lower = word.to_ascii_lowercase();
        if matches!(self.peek(), Some('\'' | '"')) && STRING_PREFIXES.contains(&lower.as_str()) {
            let token = self.string(lower.contains('r'), lower.contains('f'))?;
            self.push(token);
        } else {
            self.push(Token::Name(word));
        }
        Ok(())
    }

    fn number(&mut self) -> Result<Token, CodeFault> {
        let start = self.pos;
        let mut is_float = false;
        let digits = |lexer: &mut Self| {
            while lexer.peek().is_some_and(|c| c.is_ascii_digit() || c == '_') {
                lexer.pos += 1;
            }
        };

        digits(self);
        if self.peek() == Some('.') && self.peek_at(1) != Some('.') {
            is_float = true;
            self.pos += 1;
            digits(self);
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let sign = usize::from(matches!(self.peek_at(1), Some('+' | '-')));
            if self.peek_at(1 + sign).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                self.pos += 1 + sign;
                digits(self);
            }
        }

        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        if is_float {
            text.parse()
                .map(Token::Float)
                .or_else(|_| self.error("invalid decimal literal"))
        } else {
            text.parse()
                .map(Token::Int)
                .or_else(|_| self.error("integer literal too large"))
        }
    }

    fn string(&mut self, raw: bool, fstring: bool) -> Result<Token, CodeFault> {
        let start_line = self.line;
        let Some(quote) = self.peek() else {
            return self.error("unterminated string literal");
        };
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let mut text = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(CodeFault::syntax("unterminated string literal", start_line));
            };
            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.pos += 3;
                    break;
                }
            }
            if c == '\n' {
                if !triple {
                    return Err(CodeFault::syntax("unterminated string literal", start_line));
                }
                self.line += 1;
            }
            if c == '\\' {
                let Some(next) = self.peek_at(1) else {
                    return Err(CodeFault::syntax("unterminated string literal", start_line));
                };
                self.pos += 2;
                if raw {
                    text.push('\\');
                    text.push(next);
                    continue;
                }
                match next {
                    'n' => text.push('\n'),
                    't' => text.push('\t'),
                    'r' => text.push('\r'),
                    '0' => text.push('\0'),
                    '\\' => text.push('\\'),
                    '\'' => text.push('\''),
                    '"' => text.push('"'),
                    '\n' => self.line += 1,
                    other => {
                        text.push('\\');
                        text.push(other);
                    }
                }
                continue;
            }
            text.push(c);
            self.pos += 1;
        }

        Ok(if fstring {
            Token::FStr(text)
        } else {
            Token::Str(text)
        })
    }

    fn symbol(&mut self) -> Result<(), CodeFault> {
        for sym in SYMBOLS {
            let len = sym.chars().count();
            let matches = sym
                .chars()
                .enumerate()
                .all(|(i, c)| self.peek_at(i) == Some(c));
            if matches {
                self.pos += len;
                match sym {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
                    _ => {}
                }
                self.push(Token::Sym(sym));
                return Ok(());
            }
        }
        let c = self.peek().unwrap_or(' ');
        self.error(&format!("invalid character '{c}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        tokenize(src, 1).unwrap().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn test_indentation_tokens() {
        let tokens = kinds("for x in xs:\n    y = x\nz = 1\n");
        assert!(tokens.contains(&Token::Indent));
        let dedent = tokens.iter().position(|t| *t == Token::Dedent).unwrap();
        assert_eq!(tokens[dedent + 1], Token::Name("z".into()));
    }

    #[test]
    fn test_brackets_join_lines() {
        let tokens = kinds("xs = [1,\n  2]\n");
        assert!(!tokens.contains(&Token::Indent));
        assert_eq!(tokens.iter().filter(|t| **t == Token::Newline).count(), 1);
    }

    #[test]
    fn test_strings_and_numbers() {
        let tokens = kinds(r#"a = f"{x:.2f}" + 'it\'s' + 1_000 + 2.5e3"#);
        assert!(tokens.contains(&Token::FStr("{x:.2f}".into())));
        assert!(tokens.contains(&Token::Str("it's".into())));
        assert!(tokens.contains(&Token::Int(1000)));
        assert!(tokens.contains(&Token::Float(2500.0)));
    }

    #[test]
    fn test_bad_dedent() {
        let err = tokenize("if x:\n    a = 1\n  b = 2\n", 1).unwrap_err();
        assert!(err.message.contains("unindent"));
    }
}
