//! Runtime values for the rule language.
//!
//! All numbers are `i64` or `rust_decimal::Decimal` -- never `f64` in the
//! evaluation path. JSON enters through [`Value::from_json`] and leaves
//! through [`Value::to_json`]; internal maps are `BTreeMap` so snapshots
//! and traces serialize deterministically.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Serialize, Serializer};

use crate::error::RuleError;

/// A runtime value in the rule language.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The absent value: missing vars, missing lookup rows, and the unset
    /// `calculatedValue` default all read as `Null`.
    Null,
    Bool(bool),
    Int(i64),
    Decimal(Decimal),
    Text(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns a human-readable type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Decimal(_) => "Decimal",
            Value::Text(_) => "Text",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness used by condition gating and the boolean operators:
    /// `Null` and empty text/lists are falsy, zero is falsy, maps are
    /// always truthy.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Decimal(d) => !d.is_zero(),
            Value::Text(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(_) => true,
        }
    }

    /// Traverse a dotted path through nested maps and lists. Numeric
    /// segments index into lists. Any missing intermediate yields `None`,
    /// never an error.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.') {
            current = match current {
                Value::Map(m) => m.get(segment)?,
                Value::List(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Convert wire-format JSON into a typed value. Integer JSON numbers
    /// become `Int`; fractional numbers become `Decimal`. Non-finite
    /// numbers cannot cross the boundary.
    pub fn from_json(v: &serde_json::Value) -> Result<Value, RuleError> {
        match v {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else if let Some(u) = n.as_u64() {
                    Ok(Value::Decimal(Decimal::from(u)))
                } else {
                    let f = n.as_f64().unwrap_or(f64::NAN);
                    Decimal::try_from(f).map(Value::Decimal).map_err(|_| {
                        RuleError::MalformedExpression {
                            message: format!("number {} cannot be represented", n),
                        }
                    })
                }
            }
            serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Value::from_json(item)?);
                }
                Ok(Value::List(out))
            }
            serde_json::Value::Object(obj) => {
                let mut out = BTreeMap::new();
                for (k, val) in obj {
                    out.insert(k.clone(), Value::from_json(val)?);
                }
                Ok(Value::Map(out))
            }
        }
    }

    /// Convert back to wire-format JSON. Decimals serialize as strings,
    /// matching their string form on the way in through typed payloads.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Decimal(d) => serde_json::Value::String(d.to_string()),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
