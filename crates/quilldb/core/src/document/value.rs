// QuillDB
// Copyright (C) 2025 QuillDB contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Dynamic document values
//!
//! Documents carry a tagged variant value type instead of a duck-typed field
//! bag. Conversions to and from `serde_json::Value` are explicit; JSON
//! numbers that fit an i64 become `I64`, everything else becomes `F64`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A dynamically typed field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Name of the variant, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::I64(_) => "i64",
            Value::F64(_) => "f64",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Stable textual encoding used as a secondary index key component
    pub fn index_key(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => format!("b:{b}"),
            // Offset so negative integers sort before positive ones textually
            Value::I64(i) => format!("i:{:020}", (*i as i128) - (i64::MIN as i128)),
            Value::F64(f) => format!("f:{f}"),
            Value::Str(s) => format!("s:{s}"),
            Value::Bytes(b) => {
                let mut out = String::with_capacity(2 + b.len() * 2);
                out.push_str("x:");
                for byte in b {
                    out.push_str(&format!("{byte:02x}"));
                }
                out
            }
            Value::Array(_) | Value::Object(_) => format!("j:{}", serde_json::Value::from(self.clone())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", serde_json::Value::from(self.clone()))
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::I64(i)
                } else {
                    Value::F64(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(fields) => Value::Object(fields.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::I64(i) => serde_json::Value::from(i),
            Value::F64(f) => serde_json::Number::from_f64(f).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s),
            Value::Bytes(b) => serde_json::Value::Array(b.into_iter().map(|byte| serde_json::Value::from(byte as i64)).collect()),
            Value::Array(items) => serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect()),
            Value::Object(fields) => serde_json::Value::Object(fields.into_iter().map(|(k, v)| (k, serde_json::Value::from(v))).collect()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::I64(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_conversion_roundtrip() {
        let json = serde_json::json!({
            "name": "Ada",
            "age": 36,
            "ratio": 0.5,
            "tags": ["a", "b"],
            "active": true,
            "missing": null,
        });

        let value = Value::from(json.clone());
        assert_eq!(serde_json::Value::from(value), json);
    }

    #[test]
    fn test_integral_numbers_become_i64() {
        let value = Value::from(serde_json::json!(7));
        assert_eq!(value, Value::I64(7));

        let value = Value::from(serde_json::json!(1.25));
        assert_eq!(value, Value::F64(1.25));
    }

    #[test]
    fn test_index_key_orders_integers() {
        let small = Value::I64(-5).index_key();
        let zero = Value::I64(0).index_key();
        let large = Value::I64(123).index_key();
        assert!(small < zero);
        assert!(zero < large);
    }

    #[test]
    fn test_index_key_distinguishes_types() {
        assert_ne!(Value::Str("1".to_string()).index_key(), Value::I64(1).index_key());
        assert_ne!(Value::Bool(true).index_key(), Value::Str("true".to_string()).index_key());
    }
}
