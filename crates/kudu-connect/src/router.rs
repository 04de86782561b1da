//! Table routing
//!
//! Decides which table a record is written to. By default the topic name is
//! the table name; a configured table field overrides it per record, and a
//! table filter restricts writes to tables whose name contains a substring.

use std::fmt;

use crate::error::{ConnectError, Result};
use crate::record::Record;

/// Routing settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingConfig {
    /// Value field holding the table name; `None` routes by topic
    pub table_field: Option<String>,
    /// Substring a table name must contain to be written
    pub table_filter: Option<String>,
}

/// Resolved table name for a record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableTarget(String);

impl TableTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routing decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Write the record to this table
    Table(TableTarget),
    /// Table rejected by the filter; the record is not written
    Excluded(TableTarget),
}

/// Resolves the target table of each record
#[derive(Debug, Clone, Default)]
pub struct RecordRouter {
    config: RoutingConfig,
}

impl RecordRouter {
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    pub fn route(&self, record: &Record) -> Result<Route> {
        let target = self.resolve(record)?;

        match &self.config.table_filter {
            Some(filter) if !target.name().contains(filter.as_str()) => Ok(Route::Excluded(target)),
            _ => Ok(Route::Table(target)),
        }
    }

    fn resolve(&self, record: &Record) -> Result<TableTarget> {
        let Some(field) = &self.config.table_field else {
            return Ok(TableTarget::new(record.topic.clone()));
        };

        let (_, value) = record.value.get(field).ok_or_else(|| {
            ConnectError::routing(format!(
                "record {}-{}@{} has no table field '{}'",
                record.topic, record.partition, record.offset, field
            ))
        })?;

        let name = match value.as_str() {
            Some(name) if !name.is_empty() => name,
            Some(_) => {
                return Err(ConnectError::routing(format!(
                    "table field '{}' is empty in record {}-{}@{}",
                    field, record.topic, record.partition, record.offset
                )))
            }
            None => {
                return Err(ConnectError::routing(format!(
                    "table field '{}' must be a non-null string, got {} in record {}-{}@{}",
                    field, value, record.topic, record.partition, record.offset
                )))
            }
        };

        Ok(TableTarget::new(name))
    }
}
