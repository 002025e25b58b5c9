//! # Records and Values
//!
//! The record model of the table layer: a cell is a [`Value`] (a tagged
//! int64 or byte string), a row is a [`Record`] of parallel column-name and
//! value lists with no implied ordering. The table layer reorders record
//! values into schema order before encoding.

use eyre::Result;
use serde::{Deserialize, Serialize};

/// Column type, with the tag values used in serialized table definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum ValueType {
    Int64 = 1,
    Bytes = 2,
}

impl From<ValueType> for u32 {
    fn from(vt: ValueType) -> u32 {
        vt as u32
    }
}

impl TryFrom<u32> for ValueType {
    type Error = String;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            1 => Ok(ValueType::Int64),
            2 => Ok(ValueType::Bytes),
            other => Err(format!("invalid column type tag: {}", other)),
        }
    }
}

/// One table cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int64(i64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int64(_) => ValueType::Int64,
            Value::Bytes(_) => ValueType::Bytes,
        }
    }

    pub fn as_int64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            Value::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            Value::Int64(_) => None,
        }
    }
}

/// One table row: parallel `(columns, values)` lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub cols: Vec<String>,
    pub vals: Vec<Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_int64(&mut self, col: impl Into<String>, val: i64) -> &mut Self {
        self.cols.push(col.into());
        self.vals.push(Value::Int64(val));
        self
    }

    pub fn add_bytes(&mut self, col: impl Into<String>, val: impl Into<Vec<u8>>) -> &mut Self {
        self.cols.push(col.into());
        self.vals.push(Value::Bytes(val.into()));
        self
    }

    /// Value of the named column, if present.
    pub fn get(&self, col: &str) -> Option<&Value> {
        self.cols
            .iter()
            .position(|c| c == col)
            .map(|i| &self.vals[i])
    }

    /// Like `get`, but a missing column is a schema error.
    pub fn require(&self, col: &str) -> Result<&Value> {
        self.get(col)
            .ok_or_else(|| eyre::eyre!("missing column: {}", col))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chains_and_gets_by_name() {
        let mut rec = Record::new();
        rec.add_int64("id", 42).add_bytes("name", &b"alice"[..]);

        assert_eq!(rec.get("id"), Some(&Value::Int64(42)));
        assert_eq!(rec.get("name"), Some(&Value::Bytes(b"alice".to_vec())));
        assert_eq!(rec.get("missing"), None);
    }

    #[test]
    fn require_reports_missing_column() {
        let rec = Record::new();

        let err = rec.require("age").unwrap_err();

        assert!(err.to_string().contains("missing column: age"));
    }

    #[test]
    fn value_type_serializes_as_numeric_tag() {
        let json = serde_json::to_string(&ValueType::Bytes).unwrap();
        assert_eq!(json, "2");

        let back: ValueType = serde_json::from_str("1").unwrap();
        assert_eq!(back, ValueType::Int64);

        assert!(serde_json::from_str::<ValueType>("9").is_err());
    }
}
