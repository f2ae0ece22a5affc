// src/vars/template.rs

//! Interpolation of `${...}` expressions against a [`Scope`].
//!
//! Supported forms:
//!
//! - `${NAME}` — variable reference; missing names expand to the empty string
//! - `${fn ARGS...}` — function call; arguments are variable names or
//!   `"quoted"` literals
//! - `$${` — escapes a literal `${`
//!
//! Values containing further `${...}` expressions are resolved recursively up
//! to a fixed depth. Expansion is pure: no filesystem or process access.

use std::sync::OnceLock;

use regex::Regex;

use crate::vars::scope::{Scope, Value};

/// Maximum recursion depth when variable values themselves contain
/// interpolation expressions.
const MAX_DEPTH: usize = 16;

/// Sentinel standing in for an escaped `$${` during expansion. Private-use
/// codepoint, must not appear in taskfile text.
const ESCAPE_SENTINEL: char = '\u{E000}';

fn expr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]*)\}").expect("static regex"))
}

/// Expand every `${...}` expression in `input` against `scope`.
pub fn expand(input: &str, scope: &Scope) -> String {
    let escaped = input.replace("$${", &ESCAPE_SENTINEL.to_string());
    let expanded = expand_depth(&escaped, scope, MAX_DEPTH);
    expanded.replace(ESCAPE_SENTINEL, "${")
}

/// Expand an optional string, keeping `None` as `None`.
pub fn expand_opt(input: Option<&str>, scope: &Scope) -> Option<String> {
    input.map(|s| expand(s, scope))
}

/// Expand every string in a slice.
pub fn expand_vec(inputs: &[String], scope: &Scope) -> Vec<String> {
    inputs.iter().map(|s| expand(s, scope)).collect()
}

fn expand_depth(input: &str, scope: &Scope, depth: usize) -> String {
    if depth == 0 || !input.contains("${") {
        return input.to_string();
    }

    expr_re()
        .replace_all(input, |caps: &regex::Captures| {
            let expr = caps[1].trim();
            let value = eval_expr(expr, scope);
            // The value may itself reference further variables.
            expand_depth(&value, scope, depth - 1)
        })
        .into_owned()
}

/// Evaluate a single expression body (the text between `${` and `}`).
fn eval_expr(expr: &str, scope: &Scope) -> String {
    if expr.is_empty() {
        return String::new();
    }

    let tokens = tokenize(expr);
    match tokens.as_slice() {
        [] => String::new(),
        [Token::Name(name)] => lookup(name, scope),
        [Token::Literal(lit)] => lit.clone(),
        [Token::Name(head), args @ ..] if is_function(head) => call_function(head, args, scope),
        // Unknown multi-token forms render each token resolved, joined.
        tokens => tokens
            .iter()
            .map(|t| t.resolve(scope))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn lookup(name: &str, scope: &Scope) -> String {
    scope.get(name).map(Value::render).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Literal(String),
}

impl Token {
    fn resolve(&self, scope: &Scope) -> String {
        match self {
            Token::Name(name) => lookup(name, scope),
            Token::Literal(lit) => lit.clone(),
        }
    }
}

/// Split an expression body into names and `"quoted"` literals.
fn tokenize(expr: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut lit = String::new();
            while let Some(c) = chars.next() {
                match c {
                    '"' => break,
                    '\\' => {
                        if let Some(next) = chars.next() {
                            lit.push(next);
                        }
                    }
                    other => lit.push(other),
                }
            }
            tokens.push(Token::Literal(lit));
        } else {
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                name.push(c);
                chars.next();
            }
            tokens.push(Token::Name(name));
        }
    }

    tokens
}

fn is_function(name: &str) -> bool {
    matches!(
        name,
        "default" | "trim" | "quote" | "upper" | "lower" | "join" | "splitLines" | "catLines"
    )
}

fn call_function(name: &str, args: &[Token], scope: &Scope) -> String {
    match name {
        // ${default "fallback" NAME}
        "default" => {
            let fallback = args.first().map(|t| t.resolve(scope)).unwrap_or_default();
            let value = args.get(1).map(|t| t.resolve(scope)).unwrap_or_default();
            if value.is_empty() {
                fallback
            } else {
                value
            }
        }
        "trim" => args
            .first()
            .map(|t| t.resolve(scope).trim().to_string())
            .unwrap_or_default(),
        "quote" => {
            let value = args.first().map(|t| t.resolve(scope)).unwrap_or_default();
            format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
        }
        "upper" => args
            .first()
            .map(|t| t.resolve(scope).to_uppercase())
            .unwrap_or_default(),
        "lower" => args
            .first()
            .map(|t| t.resolve(scope).to_lowercase())
            .unwrap_or_default(),
        // ${join "," LIST}
        "join" => {
            let sep = args.first().map(|t| t.resolve(scope)).unwrap_or_default();
            match args.get(1) {
                Some(Token::Name(name)) => match scope.get(name) {
                    Some(Value::List(items)) => items
                        .iter()
                        .map(Value::render)
                        .collect::<Vec<_>>()
                        .join(&sep),
                    Some(other) => other.render(),
                    None => String::new(),
                },
                Some(tok) => tok.resolve(scope),
                None => String::new(),
            }
        }
        // Split into lines, rendered like a list value.
        "splitLines" => {
            let value = args.first().map(|t| t.resolve(scope)).unwrap_or_default();
            let lines: Vec<Value> = value.lines().map(Value::from).collect();
            Value::List(lines).render()
        }
        // Replace newlines with spaces, collapsing a trailing one.
        "catLines" => {
            let value = args.first().map(|t| t.resolve(scope)).unwrap_or_default();
            value
                .lines()
                .collect::<Vec<_>>()
                .join(" ")
                .trim_end()
                .to_string()
        }
        _ => String::new(),
    }
}
