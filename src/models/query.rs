//! Query-related data models.
//!
//! This module defines bound parameters, execution options and the shapes a
//! statement result can take.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A decoded result row, keyed by column name.
pub type Row = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
        }
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// What a statement execution hands back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnMode {
    /// The full row set.
    #[default]
    Rows,
    /// The identifier assigned by the last insert.
    InsertId,
    /// The number of rows matched by the statement.
    AffectedRows,
    /// Nothing; the statement is run for its side effects.
    Nothing,
}

/// Per-statement execution options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub return_mode: ReturnMode,
}

impl QueryOptions {
    pub fn rows() -> Self {
        Self::returning(ReturnMode::Rows)
    }

    pub fn insert_id() -> Self {
        Self::returning(ReturnMode::InsertId)
    }

    pub fn affected_rows() -> Self {
        Self::returning(ReturnMode::AffectedRows)
    }

    pub fn nothing() -> Self {
        Self::returning(ReturnMode::Nothing)
    }

    pub fn returning(return_mode: ReturnMode) -> Self {
        Self { return_mode }
    }
}

/// Result of a statement, shaped by the requested [`ReturnMode`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutput {
    Rows(Vec<Row>),
    InsertId(i64),
    AffectedRows(u64),
    Nothing,
}

impl QueryOutput {
    /// Consume the output as a row set; other shapes yield no rows.
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Self::Rows(rows) => rows,
            _ => Vec::new(),
        }
    }

    pub fn insert_id(&self) -> Option<i64> {
        match self {
            Self::InsertId(id) => Some(*id),
            _ => None,
        }
    }

    pub fn affected_rows(&self) -> Option<u64> {
        match self {
            Self::AffectedRows(n) => Some(*n),
            _ => None,
        }
    }

    /// First column of the first row, the way aggregate lookups are consumed.
    pub fn scalar(&self) -> Option<&JsonValue> {
        match self {
            Self::Rows(rows) => rows.first().and_then(|r| r.values().next()),
            _ => None,
        }
    }

    /// Integer view of [`QueryOutput::scalar`], accepting numeric strings.
    pub fn scalar_i64(&self) -> Option<i64> {
        match self.scalar()? {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}
