//! Generalized-list (GL) parser.
//!
//! Perception sources and querying agents exchange facts as generalized
//! lists, a parenthesised prefix notation:
//!
//! ```text
//! (robotPosition "AMR_LIFT1" "3.5" "-2.1")
//! (context (triple $P "rdf:type" $C))
//! ```
//!
//! A list is a name followed by zero or more expressions.  An expression is
//! a quoted string, a number, a bare symbol, a `$variable`, or a nested list.
//!
//! # Example
//!
//! ```rust
//! use robocm_perception::gl;
//!
//! let list = gl::parse("(robotDegree \"AMR_LIFT2\" 90)").unwrap();
//! assert_eq!(list.name, "robotDegree");
//! assert_eq!(list.expressions.len(), 2);
//! assert_eq!(list.expressions[1].as_value().unwrap().text(), "90");
//! ```

use std::fmt;

use robocm_types::CmError;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised while parsing GL text.  Offsets are byte positions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GlError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),
    #[error("unexpected character '{found}' at byte {offset}")]
    Unexpected { found: char, offset: usize },
    #[error("unterminated string starting at byte {0}")]
    UnterminatedString(usize),
    #[error("list at byte {0} has no name")]
    MissingName(usize),
    #[error("trailing input at byte {0}")]
    TrailingInput(usize),
    #[error("lists nested deeper than {max} at byte {0}", max = MAX_DEPTH)]
    TooDeep(usize),
}

impl From<GlError> for CmError {
    fn from(e: GlError) -> Self {
        CmError::Parse(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tree
// ─────────────────────────────────────────────────────────────────────────────

/// A scalar GL value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Symbol(String),
}

impl Value {
    /// The value as plain text, the way field extractors read it.
    pub fn text(&self) -> String {
        match self {
            Value::Str(s) | Value::Symbol(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Value(Value),
    /// A `$name` logical variable; the name is stored without the `$`.
    Variable(String),
    List(GeneralizedList),
}

impl Expression {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Expression::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&GeneralizedList> {
        match self {
            Expression::List(l) => Some(l),
            _ => None,
        }
    }
}

/// A named list of expressions.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneralizedList {
    pub name: String,
    pub expressions: Vec<Expression>,
}

/// Quote `s` as a GL string literal.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(&quote(s)),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Symbol(s) => f.write_str(s),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Value(v) => write!(f, "{v}"),
            Expression::Variable(name) => write!(f, "${name}"),
            Expression::List(l) => write!(f, "{l}"),
        }
    }
}

impl fmt::Display for GeneralizedList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", self.name)?;
        for e in &self.expressions {
            write!(f, " {e}")?;
        }
        f.write_str(")")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parser
// ─────────────────────────────────────────────────────────────────────────────

/// Deepest list nesting accepted from the wire.
pub const MAX_DEPTH: usize = 64;

/// Parse exactly one top-level list from `input`.
pub fn parse(input: &str) -> Result<GeneralizedList, GlError> {
    let mut parser = Parser {
        src: input,
        pos: 0,
        depth: 0,
    };
    parser.skip_ws();
    let list = parser.list()?;
    parser.skip_ws();
    if parser.pos < input.len() {
        return Err(GlError::TrailingInput(parser.pos));
    }
    Ok(list)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn list(&mut self) -> Result<GeneralizedList, GlError> {
        let start = self.pos;
        match self.bump() {
            Some('(') => {}
            Some(found) => return Err(GlError::Unexpected { found, offset: start }),
            None => return Err(GlError::UnexpectedEof(start)),
        }
        if self.depth == MAX_DEPTH {
            return Err(GlError::TooDeep(start));
        }
        self.depth += 1;
        let list = self.list_body(start);
        self.depth -= 1;
        list
    }

    fn list_body(&mut self, start: usize) -> Result<GeneralizedList, GlError> {
        self.skip_ws();
        let name = self.atom_text();
        if name.is_empty() || name.starts_with('$') {
            return Err(GlError::MissingName(start));
        }

        let mut expressions = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(')') => {
                    self.bump();
                    return Ok(GeneralizedList { name, expressions });
                }
                Some(_) => expressions.push(self.expression()?),
                None => return Err(GlError::UnexpectedEof(self.pos)),
            }
        }
    }

    fn expression(&mut self) -> Result<Expression, GlError> {
        match self.peek() {
            Some('(') => Ok(Expression::List(self.list()?)),
            Some('"') => Ok(Expression::Value(Value::Str(self.string()?))),
            Some(found) if is_delimiter(found) => Err(GlError::Unexpected {
                found,
                offset: self.pos,
            }),
            Some(_) => {
                let text = self.atom_text();
                Ok(classify_atom(text))
            }
            None => Err(GlError::UnexpectedEof(self.pos)),
        }
    }

    fn string(&mut self) -> Result<String, GlError> {
        let start = self.pos;
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => return Err(GlError::UnterminatedString(start)),
                },
                Some(c) => out.push(c),
                None => return Err(GlError::UnterminatedString(start)),
            }
        }
    }

    fn atom_text(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(|c| !c.is_whitespace() && !is_delimiter(c)) {
            self.bump();
        }
        self.src[start..self.pos].to_string()
    }
}

fn is_delimiter(c: char) -> bool {
    matches!(c, '(' | ')' | '"')
}

fn classify_atom(text: String) -> Expression {
    if let Some(name) = text.strip_prefix('$') {
        return Expression::Variable(name.to_string());
    }
    if looks_numeric(&text) {
        if let Ok(i) = text.parse::<i64>() {
            return Expression::Value(Value::Int(i));
        }
        if let Ok(f) = text.parse::<f64>() {
            return Expression::Value(Value::Float(f));
        }
    }
    Expression::Value(Value::Symbol(text))
}

/// Guards against `f64::from_str` accepting words such as `inf` or `NaN`.
fn looks_numeric(text: &str) -> bool {
    let digits = text.trim_start_matches(['+', '-']);
    digits
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || (c == '.' && digits.len() > 1))
}
