//! Conversions between JSON row values and `SQLite` values.

use anyhow::{Context, Result};
use fieldsync_core::{ColumnType, Row};
use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{Connection, Statement};
use serde_json::{Number, Value};

/// Bind value for `value` stored in a column of `column_type`.
///
/// Arrays and objects are stored as JSON text. Any non-null value bound to a
/// JSON column is stored JSON encoded, so strings keep their quotes and read
/// back as strings. Strings bound to blob columns are hex decoded when possible.
pub(crate) fn to_sqlite(value: &Value, column_type: Option<ColumnType>) -> SqliteValue {
    if column_type == Some(ColumnType::Json) && !value.is_null() {
        return SqliteValue::Text(value.to_string());
    }
    match value {
        Value::Null => SqliteValue::Null,
        Value::Bool(flag) => SqliteValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(int) => SqliteValue::Integer(int),
            None => number.as_f64().map_or(SqliteValue::Null, SqliteValue::Real),
        },
        Value::String(text) => {
            if column_type == Some(ColumnType::Blob) {
                if let Ok(bytes) = hex::decode(text) {
                    return SqliteValue::Blob(bytes);
                }
            }
            SqliteValue::Text(text.clone())
        }
        Value::Array(_) | Value::Object(_) => SqliteValue::Text(value.to_string()),
    }
}

pub(crate) fn from_sqlite(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(int) => Value::from(int),
        ValueRef::Real(real) => Number::from_f64(real).map_or(Value::Null, Value::Number),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

/// Run a read statement and collect every row keyed by output column name.
pub(crate) fn fetch_rows(conn: &Connection, sql: &str) -> Result<Vec<Row>> {
    let mut stmt =
        conn.prepare(sql).with_context(|| format!("failed to prepare query: {sql}"))?;
    collect_rows(&mut stmt).with_context(|| format!("failed to read rows for query: {sql}"))
}

fn collect_rows(stmt: &mut Statement<'_>) -> Result<Vec<Row>> {
    let columns = stmt.column_names().into_iter().map(str::to_string).collect::<Vec<_>>();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (index, column) in columns.iter().enumerate() {
            record.insert(column.clone(), from_sqlite(row.get_ref(index)?));
        }
        out.push(record);
    }
    Ok(out)
}
