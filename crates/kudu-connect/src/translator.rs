//! Record to row translation
//!
//! Mapping is strict: every value field must name a column of compatible
//! type, every non-nullable column must be assigned, and nulls only go to
//! nullable columns. Key fields join the row only when key insertion is on,
//! and then a value field of the same name wins. The routing field is the
//! one exception to strictness: it is written when the table has a column of
//! that name and dropped otherwise.

use tracing::trace;

use crate::error::{ConnectError, Result};
use crate::mutation::{Cell, OperationKind, RecordRef, RowMutation};
use crate::record::{Field, Record, StructValue, Value};
use crate::router::TableTarget;
use crate::schema::{ColumnSchema, TableSchema};

/// Converts records into row mutations for their resolved table
#[derive(Debug, Clone, Default)]
pub struct RowTranslator {
    key_insert: bool,
    operation: OperationKind,
    table_field: Option<String>,
}

impl RowTranslator {
    pub fn new(key_insert: bool, operation: OperationKind) -> Self {
        Self {
            key_insert,
            operation,
            table_field: None,
        }
    }

    /// Field naming the target table, exempt from the matching-column check
    pub fn with_table_field(mut self, field: Option<String>) -> Self {
        self.table_field = field;
        self
    }

    pub fn translate(
        &self,
        record: &Record,
        target: &TableTarget,
        schema: &TableSchema,
    ) -> Result<RowMutation> {
        let table = target.name();
        let key = record.key.as_ref().filter(|_| self.key_insert);

        let routing = self.table_field.as_deref();
        check_fields(table, schema, &record.value, None, routing)?;
        if let Some(key) = key {
            check_fields(table, schema, key, Some(&record.value), routing)?;
        }

        let mut cells = Vec::with_capacity(schema.columns().len());
        for column in schema.columns() {
            let value = record
                .value
                .get(&column.name)
                .or_else(|| key.and_then(|k| k.get(&column.name)))
                .map(|(_, v)| v);

            match value {
                Some(v) if v.is_null() && !column.nullable => {
                    return Err(ConnectError::schema_mismatch(
                        table,
                        format!("null value for non-nullable column '{}'", column.name),
                    ));
                }
                Some(v) => cells.push(Cell::new(column.name.clone(), v.clone())),
                None if column.nullable => {}
                None => return Err(missing_column(table, column, record, self.key_insert)),
            }
        }

        trace!(
            table = %table,
            offset = record.offset,
            columns = cells.len(),
            "Translated record"
        );

        Ok(RowMutation::new(
            table,
            self.operation,
            cells,
            RecordRef::from(record),
        ))
    }
}

/// Every field must map to a column of compatible type. Fields shadowed by
/// `shadowed_by` are skipped, as is the routing field when no column has its
/// name.
fn check_fields(
    table: &str,
    schema: &TableSchema,
    fields: &StructValue,
    shadowed_by: Option<&StructValue>,
    routing_field: Option<&str>,
) -> Result<()> {
    for (field, value) in fields.iter() {
        if shadowed_by.is_some_and(|s| s.contains(&field.name)) {
            continue;
        }
        if routing_field == Some(field.name.as_str()) && schema.column(&field.name).is_none() {
            continue;
        }
        let column = schema.column(&field.name).ok_or_else(|| {
            ConnectError::schema_mismatch(
                table,
                format!("field '{}' has no matching column", field.name),
            )
        })?;
        check_type(table, column, field, value)?;
    }
    Ok(())
}

fn check_type(table: &str, column: &ColumnSchema, field: &Field, value: &Value) -> Result<()> {
    let field_type = value.field_type().unwrap_or(field.field_type);
    if column.column_type.accepts(field_type) {
        return Ok(());
    }
    Err(ConnectError::schema_mismatch(
        table,
        format!(
            "field '{}' of type {} cannot be written to column '{}' of type {}",
            field.name, field_type, column.name, column.column_type
        ),
    ))
}

fn missing_column(
    table: &str,
    column: &ColumnSchema,
    record: &Record,
    key_insert: bool,
) -> ConnectError {
    let in_key = record.key.as_ref().is_some_and(|k| k.contains(&column.name));
    let message = if in_key && !key_insert {
        format!(
            "required column '{}' is only present in the record key and key insertion is disabled",
            column.name
        )
    } else {
        format!("required column '{}' is missing from the record", column.name)
    };
    ConnectError::schema_mismatch(table, message)
}
