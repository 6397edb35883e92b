//! Step conditions.
//!
//! Supported forms:
//! - `key`: satisfied when the dotted key resolves to a non-null value
//! - `key === literal`, `key !== literal`: strict comparison against a
//!   quoted string, a number, `true`, `false` or `null`
//!
//! Strict means types must match: `count === "3"` is false for the number 3.

use serde_json::Value;
use thiserror::Error;

use super::blackboard::RunBlackboard;

#[derive(Debug, Error, PartialEq)]
pub enum ConditionError {
    #[error("empty condition")]
    Empty,
    #[error("invalid key '{0}'")]
    InvalidKey(String),
    #[error("invalid literal '{0}'")]
    InvalidLiteral(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Exists(String),
    Equals(String, Value),
    NotEquals(String, Value),
}

impl Condition {
    pub fn parse(expr: &str) -> Result<Self, ConditionError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(ConditionError::Empty);
        }
        // `!==` first: it contains `==` but never `===`
        if let Some((key, literal)) = parse_operator(expr, "!==") {
            return Ok(Self::NotEquals(parse_key(key)?, parse_literal(literal)?));
        }
        if let Some((key, literal)) = parse_operator(expr, "===") {
            return Ok(Self::Equals(parse_key(key)?, parse_literal(literal)?));
        }
        Ok(Self::Exists(parse_key(expr)?))
    }

    pub fn evaluate(&self, board: &RunBlackboard) -> bool {
        match self {
            Self::Exists(key) => board.lookup(key).is_some_and(|v| !v.is_null()),
            Self::Equals(key, expected) => board.lookup(key).unwrap_or(&Value::Null) == expected,
            Self::NotEquals(key, expected) => board.lookup(key).unwrap_or(&Value::Null) != expected,
        }
    }
}

/// Parse and evaluate in one go.
pub fn evaluate_condition(expr: &str, board: &RunBlackboard) -> Result<bool, ConditionError> {
    Ok(Condition::parse(expr)?.evaluate(board))
}

fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, value) = expr.split_once(op)?;
    Some((key.trim(), value.trim()))
}

fn parse_key(key: &str) -> Result<String, ConditionError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(key.to_string())
    } else {
        Err(ConditionError::InvalidKey(key.to_string()))
    }
}

fn parse_literal(literal: &str) -> Result<Value, ConditionError> {
    for quote in ['"', '\''] {
        if literal.len() >= 2 && literal.starts_with(quote) && literal.ends_with(quote) {
            return Ok(Value::String(literal[1..literal.len() - 1].to_string()));
        }
    }
    match literal {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }
    if let Ok(n) = literal.parse::<i64>() {
        return Ok(Value::from(n));
    }
    literal
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| ConditionError::InvalidLiteral(literal.to_string()))
}
