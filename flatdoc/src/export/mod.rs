//! Export of collection records to a relational table.

use crate::document::{self, Record, CREATED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD};
use crate::error::{Result, StoreError};
use crate::schema::{FieldType, Schema};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

/// A relational destination that accepts one row at a time.
pub trait RelationalSink {
    /// Insert `row` into `table`, using its field names as columns.
    /// Returns the identifier the sink generated for the new row.
    fn insert_row(&mut self, table: &str, row: &Record) -> Result<i64>;
}

/// Outcome of exporting one record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RowOutcome {
    Inserted { id: Option<String>, row_id: i64 },
    Failed { id: Option<String>, error: String },
}

/// Per-row results of an export
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExportReport {
    pub table: String,
    pub rows: Vec<RowOutcome>,
}

impl ExportReport {
    pub fn inserted(&self) -> usize {
        self.rows
            .iter()
            .filter(|r| matches!(r, RowOutcome::Inserted { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.rows.len() - self.inserted()
    }

    pub fn is_complete(&self) -> bool {
        self.failed() == 0
    }
}

/// Insert every record into `table`. A failing row is recorded in the report
/// and the remaining rows are still attempted.
pub fn export_records<S: RelationalSink + ?Sized>(
    records: &[Record],
    sink: &mut S,
    table: &str,
) -> ExportReport {
    let mut report = ExportReport {
        table: table.to_string(),
        rows: Vec::with_capacity(records.len()),
    };

    for record in records {
        let id = document::record_id(record).map(str::to_string);
        let outcome = match sink.insert_row(table, record) {
            Ok(row_id) => RowOutcome::Inserted { id, row_id },
            Err(e) => {
                log::warn!("Export of {:?} into '{table}' failed: {e}", id);
                RowOutcome::Failed {
                    id,
                    error: e.to_string(),
                }
            }
        };
        report.rows.push(outcome);
    }

    log::info!(
        "Exported {}/{} records into '{table}'",
        report.inserted(),
        report.rows.len()
    );
    report
}

/// SQLite-backed [`RelationalSink`].
pub struct SqliteSink {
    conn: Connection,
}

impl SqliteSink {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(SqliteSink { conn })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(SqliteSink { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Create `table` with one column per schema field, `_id` as primary key,
    /// and timestamp columns when the schema enables them.
    pub fn ensure_table(&self, table: &str, schema: &Schema) -> Result<()> {
        let mut columns = vec![format!("{} TEXT PRIMARY KEY", quote_ident(ID_FIELD))];
        for (name, descriptor) in schema.fields() {
            let affinity = match descriptor.field_type {
                FieldType::String | FieldType::Array => " TEXT",
                FieldType::Number => " NUMERIC",
                FieldType::Boolean => " INTEGER",
                FieldType::Unsupported(_) => "",
            };
            columns.push(format!("{}{affinity}", quote_ident(name)));
        }
        if schema.timestamps() {
            columns.push(format!("{} TEXT", quote_ident(CREATED_AT_FIELD)));
            columns.push(format!("{} TEXT", quote_ident(UPDATED_AT_FIELD)));
        }

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(table),
            columns.join(", ")
        );
        self.conn.execute_batch(&sql)?;
        Ok(())
    }
}

impl RelationalSink for SqliteSink {
    fn insert_row(&mut self, table: &str, row: &Record) -> Result<i64> {
        if row.is_empty() {
            return Err(StoreError::Connector("cannot insert an empty row".into()));
        }

        let columns: Vec<String> = row.keys().map(|k| quote_ident(k)).collect();
        let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            columns.join(", "),
            placeholders.join(", ")
        );

        let values: Vec<rusqlite::types::Value> = row.values().map(to_sql_value).collect();
        self.conn
            .execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(self.conn.last_insert_rowid())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn to_sql_value(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Sql::Integer(i),
            None => Sql::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => Sql::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => Sql::Text(value.to_string()),
    }
}
