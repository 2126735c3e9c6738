use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{Statement, ToSql};

use crate::error::SessionDbError;
use crate::results::ResultSet;
use crate::types::{ExecResult, RowValues};

/// Extract a `RowValues` from a `SQLite` row.
///
/// # Errors
///
/// Returns `SessionDbError` if the value cannot be read.
pub fn sqlite_extract_value_sync(
    row: &rusqlite::Row,
    idx: usize,
) -> Result<RowValues, SessionDbError> {
    let value: Value = row.get(idx)?;
    Ok(match value {
        Value::Null => RowValues::Null,
        Value::Integer(i) => RowValues::Int(i),
        Value::Real(f) => RowValues::Float(f),
        Value::Text(s) => RowValues::Text(s),
        Value::Blob(b) => RowValues::Blob(b),
    })
}

/// Build a result set from a prepared `SQLite` statement.
///
/// # Errors
/// Returns `SessionDbError` if query execution or row extraction fails.
pub fn build_result_set(stmt: &mut Statement, params: &[Value]) -> Result<ResultSet, SessionDbError> {
    let param_refs: Vec<&dyn ToSql> = params.iter().map(|v| v as &dyn ToSql).collect();
    let column_names: Arc<Vec<String>> = Arc::new(
        stmt.column_names()
            .iter()
            .map(std::string::ToString::to_string)
            .collect(),
    );
    let col_count = column_names.len();

    let mut rows_iter = stmt.query(&param_refs[..])?;
    let mut result_set = ResultSet::with_capacity(10);
    result_set.set_column_names(column_names);

    while let Some(row) = rows_iter.next()? {
        let mut row_values = Vec::with_capacity(col_count);
        for i in 0..col_count {
            row_values.push(sqlite_extract_value_sync(row, i)?);
        }
        result_set.add_row_values(row_values);
    }

    Ok(result_set)
}

/// Run a prepared DML statement.
///
/// # Errors
/// Returns `SessionDbError` if execution fails.
pub fn execute_statement(
    conn: &rusqlite::Connection,
    stmt: &mut Statement,
    params: &[Value],
) -> Result<ExecResult, SessionDbError> {
    let param_refs: Vec<&dyn ToSql> = params.iter().map(|v| v as &dyn ToSql).collect();
    let rows = stmt.execute(&param_refs[..])?;
    Ok(ExecResult {
        rows_affected: rows as u64,
        last_insert_id: Some(conn.last_insert_rowid()),
    })
}
