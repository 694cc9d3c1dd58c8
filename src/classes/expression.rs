//! Class Expression Evaluator
//!
//! Boolean expressions over class names: `!` (not), `&` or `.` (and),
//! `|` or `||` (or), and parentheses. Whitespace between two tokens
//! without an intervening operator is an error; all other whitespace is
//! stripped before parsing. Evaluation is pure: tokens are resolved
//! through a caller-supplied predicate and nothing in the context is
//! touched.

use std::collections::HashSet;
use thiserror::Error;

lazy_static::lazy_static! {
    /// Detects two identifier characters separated only by whitespace,
    /// i.e. adjacent tokens with no operator between them. Compiled once
    /// per process, on first use.
    static ref WHITESPACE_BETWEEN_TOKENS: regex_lite::Regex =
        regex_lite::Regex::new(r"[_A-Za-z0-9][ \t]+[_A-Za-z0-9]").unwrap();
}

/// Result of evaluating a class expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionValue {
    True,
    False,
    /// The expression could not be parsed.
    Error,
}

impl From<bool> for ExpressionValue {
    fn from(b: bool) -> Self {
        if b {
            ExpressionValue::True
        } else {
            ExpressionValue::False
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpressionParseError {
    #[error("empty class expression")]
    Empty,
    #[error("unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),
    #[error("unbalanced parenthesis at position {0}")]
    UnbalancedParen(usize),
    #[error("trailing input at position {0}")]
    TrailingInput(usize),
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Token(String),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

fn is_token_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b':' || c == b'@'
}

/// Parse an or-expression: `and ( ('|' | '||') and )*`
fn parse_or(input: &[u8], mut pos: usize) -> Result<(Expr, usize), ExpressionParseError> {
    let (first, mut next) = parse_and(input, pos)?;
    let mut terms = vec![first];

    while next < input.len() && input[next] == b'|' {
        pos = next + 1;
        if pos < input.len() && input[pos] == b'|' {
            pos += 1;
        }
        let (term, after) = parse_and(input, pos)?;
        terms.push(term);
        next = after;
    }

    if terms.len() == 1 {
        Ok((terms.pop().unwrap(), next))
    } else {
        Ok((Expr::Or(terms), next))
    }
}

/// Parse an and-expression: `not ( ('&' | '.') not )*`
fn parse_and(input: &[u8], pos: usize) -> Result<(Expr, usize), ExpressionParseError> {
    let (first, mut next) = parse_not(input, pos)?;
    let mut terms = vec![first];

    while next < input.len() && (input[next] == b'&' || input[next] == b'.') {
        let (term, after) = parse_not(input, next + 1)?;
        terms.push(term);
        next = after;
    }

    if terms.len() == 1 {
        Ok((terms.pop().unwrap(), next))
    } else {
        Ok((Expr::And(terms), next))
    }
}

fn parse_not(input: &[u8], pos: usize) -> Result<(Expr, usize), ExpressionParseError> {
    if pos < input.len() && input[pos] == b'!' {
        let (inner, next) = parse_not(input, pos + 1)?;
        Ok((Expr::Not(Box::new(inner)), next))
    } else {
        parse_primary(input, pos)
    }
}

fn parse_primary(input: &[u8], pos: usize) -> Result<(Expr, usize), ExpressionParseError> {
    if pos >= input.len() {
        return Err(ExpressionParseError::Empty);
    }

    if input[pos] == b'(' {
        let (inner, next) = parse_or(input, pos + 1)?;
        if next >= input.len() || input[next] != b')' {
            return Err(ExpressionParseError::UnbalancedParen(pos));
        }
        return Ok((inner, next + 1));
    }

    let start = pos;
    let mut end = pos;
    while end < input.len() && is_token_char(input[end]) {
        end += 1;
    }
    if end == start {
        return Err(ExpressionParseError::UnexpectedChar(input[pos] as char, pos));
    }

    let token = std::str::from_utf8(&input[start..end])
        .expect("token characters are ASCII")
        .to_string();
    Ok((Expr::Token(token), end))
}

fn parse(expr: &str) -> Result<Expr, ExpressionParseError> {
    let bytes = expr.as_bytes();
    let (tree, next) = parse_or(bytes, 0)?;
    if next != bytes.len() {
        return Err(ExpressionParseError::TrailingInput(next));
    }
    Ok(tree)
}

fn eval(expr: &Expr, resolve: &dyn Fn(&str) -> bool) -> bool {
    match expr {
        Expr::Token(name) => resolve(name),
        Expr::Not(inner) => !eval(inner, resolve),
        Expr::And(terms) => terms.iter().all(|t| eval(t, resolve)),
        Expr::Or(terms) => terms.iter().any(|t| eval(t, resolve)),
    }
}

/// Evaluate a class expression, resolving each token through `resolve`.
/// Performs the whitespace-without-operator check, strips remaining
/// whitespace, parses and evaluates. Parse failures yield
/// [`ExpressionValue::Error`].
pub fn check_expression(context: &str, resolve: &dyn Fn(&str) -> bool) -> ExpressionValue {
    if WHITESPACE_BETWEEN_TOKENS.is_match(context) {
        log::error!(
            "class expressions can't be separated by whitespace without an intervening operator in expression '{}'",
            context
        );
        return ExpressionValue::Error;
    }

    let condensed: String = context.chars().filter(|c| !c.is_whitespace()).collect();
    match parse(&condensed) {
        Ok(tree) => eval(&tree, resolve).into(),
        Err(err) => {
            log::error!("Couldn't parse class expression '{}': {}", context, err);
            ExpressionValue::Error
        }
    }
}

/// Evaluate the same grammar against a plain set of tokens. Used for
/// process-result and file-result attribute expressions, where the
/// defined "classes" are attribute names. Parse failures log and count
/// as false.
pub fn eval_with_token_set(expr: &str, tokens: &HashSet<String>) -> bool {
    match parse(expr) {
        Ok(tree) => eval(&tree, &|name| tokens.contains(name)),
        Err(err) => {
            log::error!("Syntax error in expression '{}': {}", expr, err);
            false
        }
    }
}

/// Evaluate a process-result expression against the attribute set of a
/// scanned process. The empty expression selects nothing.
pub fn eval_process_result(process_result: &str, proc_attrs: &HashSet<String>) -> bool {
    if process_result.is_empty() {
        return false;
    }
    eval_with_token_set(process_result, proc_attrs)
}

/// Evaluate a file-result expression against the attribute set of an
/// examined file.
pub fn eval_file_result(file_result: &str, leaf_attrs: &HashSet<String>) -> bool {
    eval_with_token_set(file_result, leaf_attrs)
}
