//! Target table schema model
//!
//! Tables are defined in the cluster; the connector only reads their schema
//! to map record fields onto columns. Key columns are never nullable.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::{ConnectError, Result};
use crate::record::FieldType;

/// Column storage type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    String,
    Binary,
    UnixtimeMicros,
}

impl ColumnType {
    /// Whether a record field of the given type can be written to this column
    pub const fn accepts(self, field: FieldType) -> bool {
        matches!(
            (self, field),
            (Self::Bool, FieldType::Boolean)
                | (Self::Int8, FieldType::Int8)
                | (Self::Int16, FieldType::Int16)
                | (Self::Int32, FieldType::Int32)
                | (Self::Int64, FieldType::Int64)
                | (Self::Float, FieldType::Float32)
                | (Self::Double, FieldType::Float64)
                | (Self::String, FieldType::String)
                | (Self::Binary, FieldType::Bytes)
                | (Self::UnixtimeMicros, FieldType::Timestamp)
        )
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
            Self::Binary => "binary",
            Self::UnixtimeMicros => "unixtime_micros",
        };
        write!(f, "{}", name)
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub nullable: bool,
    /// Part of the primary key
    #[serde(default)]
    pub key: bool,
}

impl ColumnSchema {
    /// Non-nullable, non-key column
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            key: false,
        }
    }

    /// Primary key column
    pub fn key(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            key: true,
            ..Self::new(name, column_type)
        }
    }

    /// Nullable column
    pub fn nullable(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            nullable: true,
            ..Self::new(name, column_type)
        }
    }
}

#[derive(Deserialize)]
struct RawTable {
    name: String,
    columns: Vec<ColumnSchema>,
}

/// Table metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTable")]
pub struct TableSchema {
    name: String,
    columns: Vec<ColumnSchema>,
}

impl TryFrom<RawTable> for TableSchema {
    type Error = ConnectError;

    fn try_from(raw: RawTable) -> Result<Self> {
        Self::new(raw.name, raw.columns)
    }
}

impl TableSchema {
    /// Create a table schema. Requires at least one key column, unique
    /// column names and non-nullable keys.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConnectError::config("table name must not be empty"));
        }

        let mut seen = HashSet::with_capacity(columns.len());
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(ConnectError::config(format!(
                    "table '{}' declares column '{}' twice",
                    name, column.name
                )));
            }
            if column.key && column.nullable {
                return Err(ConnectError::config(format!(
                    "key column '{}' of table '{}' cannot be nullable",
                    column.name, name
                )));
            }
        }
        if !columns.iter().any(|c| c.key) {
            return Err(ConnectError::config(format!(
                "table '{}' has no key column",
                name
            )));
        }

        Ok(Self { name, columns })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Columns in table order
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn key_columns(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.columns.iter().filter(|c| c.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_compatibility() {
        assert!(ColumnType::Int64.accepts(FieldType::Int64));
        assert!(ColumnType::Float.accepts(FieldType::Float32));
        assert!(ColumnType::Double.accepts(FieldType::Float64));
        assert!(ColumnType::Binary.accepts(FieldType::Bytes));
        assert!(ColumnType::UnixtimeMicros.accepts(FieldType::Timestamp));

        // no widening
        assert!(!ColumnType::Int64.accepts(FieldType::Int32));
        assert!(!ColumnType::Double.accepts(FieldType::Float32));
        assert!(!ColumnType::String.accepts(FieldType::Bytes));
    }

    #[test]
    fn test_table_schema_validation() {
        let table = TableSchema::new(
            "orders",
            vec![
                ColumnSchema::key("id", ColumnType::Int64),
                ColumnSchema::new("amount", ColumnType::Double),
                ColumnSchema::nullable("note", ColumnType::String),
            ],
        )
        .unwrap();
        assert_eq!(table.key_columns().count(), 1);
        assert!(table.column("note").unwrap().nullable);
        assert!(table.column("missing").is_none());

        assert!(TableSchema::new("t", vec![ColumnSchema::new("a", ColumnType::Int8)]).is_err());

        let mut nullable_key = ColumnSchema::key("id", ColumnType::Int64);
        nullable_key.nullable = true;
        assert!(TableSchema::new("t", vec![nullable_key]).is_err());
    }

    #[test]
    fn test_table_schema_from_yaml() {
        let yaml = r#"
name: orders
columns:
  - { name: id, type: int64, key: true }
  - { name: created, type: unixtime_micros }
  - { name: note, type: string, nullable: true }
"#;
        let table: TableSchema = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(table.name(), "orders");
        assert_eq!(table.columns()[1].column_type, ColumnType::UnixtimeMicros);

        let bad = "name: t\ncolumns:\n  - { name: a, type: int8 }\n";
        assert!(serde_yaml::from_str::<TableSchema>(bad).is_err());
    }
}
