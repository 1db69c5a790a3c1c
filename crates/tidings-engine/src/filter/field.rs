use std::fmt;
use std::str::FromStr;

use tidings_protocol::{Event, Value};

use super::Filter;
use crate::error::EngineError;

/// Comparison operator of a [`FieldFilter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    StartsWith,
    EndsWith,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Contains => "contains",
            CompareOp::StartsWith => "startsWith",
            CompareOp::EndsWith => "endsWith",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompareOp {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "=" | "==" | "eq" => Ok(CompareOp::Eq),
            "!=" | "ne" => Ok(CompareOp::Ne),
            ">" | "gt" => Ok(CompareOp::Gt),
            ">=" | "gte" => Ok(CompareOp::Ge),
            "<" | "lt" => Ok(CompareOp::Lt),
            "<=" | "lte" => Ok(CompareOp::Le),
            "contains" => Ok(CompareOp::Contains),
            "startsWith" | "starts_with" => Ok(CompareOp::StartsWith),
            "endsWith" | "ends_with" => Ok(CompareOp::EndsWith),
            other => Err(EngineError::UnknownFilterType(format!(
                "unsupported field operator '{}'",
                other
            ))),
        }
    }
}

/// Compare a named event field against a literal.
///
/// The field is read from `metadata` first, then from `data` when it is an
/// object. A missing field, or operands that cannot be compared, make the
/// filter reject the event.
#[derive(Debug, Clone)]
pub struct FieldFilter {
    field: String,
    op: CompareOp,
    value: Value,
}

impl FieldFilter {
    pub fn new(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn op(&self) -> CompareOp {
        self.op
    }
}

impl Filter for FieldFilter {
    fn accepts(&self, event: &Event) -> bool {
        event
            .field(&self.field)
            .is_some_and(|actual| compare(self.op, actual, &self.value))
    }
}

fn compare(op: CompareOp, actual: &Value, expected: &Value) -> bool {
    match op {
        CompareOp::Eq => loosely_equal(actual, expected),
        CompareOp::Ne => !loosely_equal(actual, expected),
        CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => {
            let (Some(a), Some(b)) = (actual.to_number(), expected.to_number()) else {
                return false;
            };
            match op {
                CompareOp::Gt => a > b,
                CompareOp::Ge => a >= b,
                CompareOp::Lt => a < b,
                _ => a <= b,
            }
        }
        CompareOp::Contains => match actual {
            Value::String(s) => expected.as_str().is_some_and(|needle| s.contains(needle)),
            Value::Array(items) => items.iter().any(|item| loosely_equal(item, expected)),
            Value::Object(map) => expected.as_str().is_some_and(|key| map.contains_key(key)),
            _ => false,
        },
        CompareOp::StartsWith => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(prefix)) => a.starts_with(prefix),
            _ => false,
        },
        CompareOp::EndsWith => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(suffix)) => a.ends_with(suffix),
            _ => false,
        },
    }
}

/// Structural equality, except that a number compares numerically against a
/// numeric string.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            matches!((a.to_number(), b.to_number()), (Some(x), Some(y)) if x == y)
        }
        _ => a == b,
    }
}
