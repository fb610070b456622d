//! Value and metadata types exchanged with backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DbValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
    Blob(Vec<u8>),
}

impl DbValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    /// Text rendering used for searching, filtering and text serializations.
    /// `None` for NULL.
    pub fn to_text(&self) -> Option<String> {
        match self {
            DbValue::Null => None,
            DbValue::Boolean(v) => Some(v.to_string()),
            DbValue::Integer(v) => Some(v.to_string()),
            DbValue::Real(v) => Some(v.to_string()),
            DbValue::Timestamp(v) => Some(v.to_rfc3339()),
            DbValue::Text(v) => Some(v.clone()),
            DbValue::Blob(v) => Some(v.iter().map(|b| format!("{:02x}", b)).collect()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DbValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for DbValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_text().unwrap_or_default())
    }
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Integer(v)
    }
}

impl From<i32> for DbValue {
    fn from(v: i32) -> Self {
        DbValue::Integer(v as i64)
    }
}

impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        DbValue::Real(v)
    }
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        DbValue::Boolean(v)
    }
}

impl From<String> for DbValue {
    fn from(v: String) -> Self {
        DbValue::Text(v)
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Text(v.to_string())
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => DbValue::Null,
        }
    }
}

/// One result row, in requested column order.
pub type Row = Vec<DbValue>;

/// Column metadata as reported by the backend (VOTable flavoured datatypes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub datatype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arraysize: Option<u32>,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ucd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, datatype: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            datatype: datatype.into(),
            arraysize: None,
            indexed: false,
            unit: None,
            ucd: None,
            description: None,
        }
    }
}

/// Size of a materialized result table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableStats {
    pub nrows: i64,
    /// Bytes on disk, including indexes
    pub size: i64,
}

/// Row selection shared by `count_rows` and `fetch_rows`.
///
/// `search` matches any requested column (substring, case-insensitive);
/// every `filters` entry must match one of its values exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowFilter {
    pub search: Option<String>,
    pub filters: BTreeMap<String, Vec<String>>,
}

impl RowFilter {
    pub fn search(term: impl Into<String>) -> Self {
        Self {
            search: Some(term.into()),
            filters: BTreeMap::new(),
        }
    }

    pub fn with_filter(mut self, column: impl Into<String>, values: Vec<String>) -> Self {
        self.filters.insert(column.into(), values);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.search.as_deref().map_or(true, str::is_empty) && self.filters.is_empty()
    }
}

/// Rows of an ad-hoc query together with their column names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_text_rendering() {
        assert_eq!(DbValue::Null.to_text(), None);
        assert_eq!(DbValue::from(42i64).to_text().as_deref(), Some("42"));
        assert_eq!(DbValue::from("x").to_string(), "x");
        assert_eq!(DbValue::Blob(vec![0, 255]).to_text().as_deref(), Some("00ff"));
    }

    #[test]
    fn test_value_serializes_untagged() {
        let row: Row = vec![DbValue::from(1i64), DbValue::from("a"), DbValue::Null];
        assert_eq!(serde_json::to_string(&row).unwrap(), r#"[1,"a",null]"#);
    }

    #[test]
    fn test_row_filter_empty() {
        assert!(RowFilter::default().is_empty());
        assert!(RowFilter::search("").is_empty());
        assert!(!RowFilter::search("m31").is_empty());
        assert!(!RowFilter::default()
            .with_filter("ra", vec!["1".to_string()])
            .is_empty());
    }
}
