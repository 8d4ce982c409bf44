//! SQL literal values and encoding.
//!
//! The template compiler substitutes variables through [`encode_literal`].
//! Templates carry their own quoting, so escaped text is rendered without
//! outer quotes: `SELECT '$<name>'` with `name = world` becomes
//! `SELECT 'world'`.

use serde::{Deserialize, Serialize};

/// A value substituted into a query template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Binary data, rendered as a `\x…` hex literal.
    Bytes(Vec<u8>),
    /// Comma-joined element list; the template supplies any parentheses.
    Array(Vec<Value>),
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

/// Render a value as SQL literal text.
///
/// `escape` doubles single quotes in text; raw mode emits it verbatim.
/// `negate` flips numeric sign and boolean values.
pub fn encode_literal(value: &Value, escape: bool, negate: bool) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => {
            let b = if negate { !*b } else { *b };
            b.to_string()
        }
        Value::Int(n) => {
            let n = if negate { -*n } else { *n };
            n.to_string()
        }
        Value::Float(n) => {
            let n = if negate { -*n } else { *n };
            n.to_string()
        }
        Value::Text(s) => {
            if escape {
                s.replace('\'', "''")
            } else {
                s.clone()
            }
        }
        Value::Bytes(bytes) => format!("\\x{}", hex::encode(bytes)),
        Value::Array(items) => items
            .iter()
            .map(|item| encode_literal(item, escape, negate))
            .collect::<Vec<_>>()
            .join(", "),
    }
}
