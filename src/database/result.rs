//! Query result types and schema structures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Result of one statement: rows for row-returning statements, an
/// affected-row count for everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub data: Vec<Row>,
    pub columns: Vec<String>,
    /// Rows materialized, or the backend's affected-row count.
    pub row_count: u64,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            data: vec![],
            columns: vec![],
            row_count: 0,
            execution_time_ms: 0,
            truncated: None,
        }
    }

    pub fn rows(columns: Vec<String>, data: Vec<Row>, execution_time_ms: u64) -> Self {
        let row_count = data.len() as u64;
        Self {
            data,
            columns,
            row_count,
            execution_time_ms,
            truncated: None,
        }
    }

    pub fn affected(row_count: u64, execution_time_ms: u64) -> Self {
        Self {
            data: vec![],
            columns: vec![],
            row_count,
            execution_time_ms,
            truncated: None,
        }
    }

    /// Keeps at most `max_rows` rows, flagging the result when rows were dropped.
    pub fn truncate(mut self, max_rows: usize) -> Self {
        if self.data.len() > max_rows {
            self.data.truncate(max_rows);
            self.row_count = max_rows as u64;
            self.truncated = Some(true);
        }
        self
    }

    /// First value of the first row, in column order.
    pub fn scalar(&self) -> Option<&CellValue> {
        let row = self.data.first()?;
        match self.columns.first() {
            Some(column) => row.get(column),
            None => row.values().next(),
        }
    }
}

/// Row data as a map of column name to value.
pub type Row = HashMap<String, CellValue>;

/// Cell value that can hold different SQL types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Bytes(Vec<u8>),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Text form used when a metadata column is read as a string.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Int(n) => Some(n.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::String(s) => Some(s.clone()),
            Self::DateTime(dt) => Some(dt.to_rfc3339()),
            Self::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        }
    }
}

impl From<()> for CellValue {
    fn from(_: ()) -> Self {
        Self::Null
    }
}

impl From<bool> for CellValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for CellValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Option<String>> for CellValue {
    fn from(v: Option<String>) -> Self {
        match v {
            Some(s) => Self::String(s),
            None => Self::Null,
        }
    }
}

/// One entry of `get_db_table_list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub table_name: String,
    pub table_comment: String,
}

/// One column of `get_table_schema`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub column_name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub default_value: Option<String>,
    pub comment: String,
    /// `YES` for key columns, empty otherwise.
    pub key: String,
    pub extra: String,
}

impl ColumnSchema {
    /// Maps a row of the `information_schema.columns` projection
    /// (`Field`, `Type`, `Key`, `Null`, `Default`, `EXTRA`, `Comment`).
    pub fn from_row(row: &Row) -> Self {
        let text = |name: &str| row.get(name).and_then(CellValue::to_text);
        Self {
            column_name: text("Field").unwrap_or_default(),
            data_type: text("Type").unwrap_or_default(),
            is_nullable: text("Null").is_some_and(|v| v.eq_ignore_ascii_case("YES")),
            default_value: text("Default"),
            comment: text("Comment").unwrap_or_default(),
            key: text("Key").unwrap_or_default(),
            extra: text("EXTRA")
                .or_else(|| text("Extra"))
                .unwrap_or_default(),
        }
    }
}

impl TableInfo {
    pub fn from_row(row: &Row) -> Self {
        let text = |name: &str| row.get(name).and_then(CellValue::to_text);
        Self {
            table_name: text("TABLE_NAME").unwrap_or_default(),
            table_comment: text("TABLE_COMMENT").unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_and_affected() {
        let mut row = Row::new();
        row.insert("1".into(), CellValue::Int(1));

        let result = QueryResult::rows(vec!["1".into()], vec![row], 3);
        assert_eq!(result.row_count, 1);
        assert_eq!(result.scalar(), Some(&CellValue::Int(1)));

        let result = QueryResult::affected(7, 2);
        assert_eq!(result.row_count, 7);
        assert!(result.data.is_empty());
        assert!(result.scalar().is_none());
    }

    #[test]
    fn test_truncate() {
        let rows: Vec<Row> = (0..5)
            .map(|i| Row::from([("id".to_string(), CellValue::Int(i))]))
            .collect();
        let result = QueryResult::rows(vec!["id".into()], rows, 1).truncate(2);
        assert_eq!(result.data.len(), 2);
        assert_eq!(result.row_count, 2);
        assert_eq!(result.truncated, Some(true));

        let small = QueryResult::empty().truncate(10);
        assert!(small.truncated.is_none());
    }

    #[test]
    fn test_cell_value_conversions() {
        let null: CellValue = ().into();
        assert!(null.is_null());

        let int: CellValue = 42i64.into();
        assert_eq!(int.as_i64(), Some(42));

        let text: CellValue = " 7 ".into();
        assert_eq!(text.as_i64(), Some(7));
        assert_eq!(text.to_text().as_deref(), Some(" 7 "));
    }

    #[test]
    fn test_column_schema_from_row() {
        let row = Row::from([
            ("Field".to_string(), CellValue::from("order_id")),
            ("Type".to_string(), CellValue::from("bigint")),
            ("Key".to_string(), CellValue::from("YES")),
            ("Null".to_string(), CellValue::from("NO")),
            ("Default".to_string(), CellValue::Null),
            ("EXTRA".to_string(), CellValue::from("")),
            ("Comment".to_string(), CellValue::from("primary id")),
        ]);
        let column = ColumnSchema::from_row(&row);
        assert_eq!(column.column_name, "order_id");
        assert_eq!(column.data_type, "bigint");
        assert!(!column.is_nullable);
        assert_eq!(column.default_value, None);
        assert_eq!(column.key, "YES");
        assert_eq!(column.comment, "primary id");
    }
}
