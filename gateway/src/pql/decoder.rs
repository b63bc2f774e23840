use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

/// Turns the raw rows a compiled query returns into per-row maps keyed by the
/// caller-facing column name.
///
/// Standard select columns keep their own label. "Extra" columns (ranks,
/// snippets) come back from the database under the compiler-chosen label the
/// query gave them (`extra_0`, `extra_1`, ... or the bare column name when the
/// alias sits directly on the root CTE) and `column_aliases` maps each such
/// label to the name the caller actually asked for via `select_as`, mirroring
/// `get_extra_columns`'s `extras[alias] = row[f"extra_{i}"]` mapping.
pub(crate) fn decode_rows(
    rows: &[SqliteRow],
    column_aliases: &HashMap<String, String>,
) -> Vec<HashMap<String, Value>> {
    rows.iter().map(|row| decode_row(row, column_aliases)).collect()
}

fn decode_row(row: &SqliteRow, column_aliases: &HashMap<String, String>) -> HashMap<String, Value> {
    let mut decoded = HashMap::with_capacity(row.columns().len());
    for column in row.columns() {
        let label = column.name();
        let value = decode_column(row, label);
        let key = column_aliases
            .get(label)
            .cloned()
            .unwrap_or_else(|| label.to_string());
        decoded.insert(key, value);
    }
    decoded
}

fn decode_column(row: &SqliteRow, name: &str) -> Value {
    let raw = match row.try_get_raw(name) {
        Ok(raw) => raw,
        Err(_) => return Value::Null,
    };
    if raw.is_null() {
        return Value::Null;
    }
    match raw.type_info().name() {
        "INTEGER" | "BOOLEAN" => row
            .try_get::<i64, _>(name)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "REAL" => row
            .try_get::<f64, _>(name)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "TEXT" => row
            .try_get::<String, _>(name)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(name)
            .map(|bytes| Value::String(general_purpose::STANDARD.encode(bytes)))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}
