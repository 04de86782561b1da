//! Row mutations
//!
//! A [`RowMutation`] is the unit of work sent to the cluster: one row change
//! on one table, tagged with the record it was derived from so its offset can
//! be released once the write is confirmed.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::record::{Record, TopicPartition, Value};

/// Kind of row change applied to the table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Fails on an existing primary key
    Insert,
    /// Inserts or replaces the row with the same primary key
    #[default]
    Upsert,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Upsert => write!(f, "upsert"),
        }
    }
}

/// Back-reference from a mutation to its source record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordRef {
    pub topic_partition: TopicPartition,
    pub offset: u64,
}

impl RecordRef {
    pub fn new(topic_partition: TopicPartition, offset: u64) -> Self {
        Self {
            topic_partition,
            offset,
        }
    }
}

impl From<&Record> for RecordRef {
    fn from(record: &Record) -> Self {
        Self::new(record.topic_partition(), record.offset)
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.topic_partition, self.offset)
    }
}

/// One column assignment
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub column: String,
    pub value: Value,
}

impl Cell {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// A typed row change for a single table. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct RowMutation {
    table: String,
    operation: OperationKind,
    cells: Vec<Cell>,
    source: RecordRef,
}

impl RowMutation {
    pub fn new(
        table: impl Into<String>,
        operation: OperationKind,
        cells: Vec<Cell>,
        source: RecordRef,
    ) -> Self {
        Self {
            table: table.into(),
            operation,
            cells,
            source,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    /// Column assignments in table column order
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.cells
            .iter()
            .find(|c| c.column == column)
            .map(|c| &c.value)
    }

    pub fn source(&self) -> &RecordRef {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_mutation_accessors() {
        let source = RecordRef::new(TopicPartition::new("orders", 1), 17);
        let mutation = RowMutation::new(
            "orders",
            OperationKind::Upsert,
            vec![Cell::new("id", 5_i64), Cell::new("name", "bob")],
            source.clone(),
        );

        assert_eq!(mutation.table(), "orders");
        assert_eq!(mutation.get("name"), Some(&Value::from("bob")));
        assert_eq!(mutation.get("other"), None);
        assert_eq!(mutation.source(), &source);
        assert_eq!(source.to_string(), "orders-1@17");
    }

    #[test]
    fn test_operation_kind_serde() {
        assert_eq!(OperationKind::default(), OperationKind::Upsert);
        let op: OperationKind = serde_json::from_str("\"insert\"").unwrap();
        assert_eq!(op, OperationKind::Insert);
    }
}
