//! Query command implementation.

use super::{next_row, open, Format};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlbridge_core::{ConnectionBridge, StatementHandle, ValueType};
use std::collections::HashSet;

/// Rows returned by one statement.
#[derive(Debug, Serialize)]
pub struct QueryResult {
    /// Result column names, with repeats suffixed `:1`, `:2`, ...
    pub columns: Vec<String>,
    /// One object per row, keyed by column name.
    pub rows: Vec<Map<String, Value>>,
    /// True if `--limit` cut the result short.
    pub truncated: bool,
}

/// Runs the query command.
pub fn run(
    path: &str,
    sql: &str,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let bridge = open(path)?;
    let result = collect(&bridge, sql, limit)?;
    bridge.close()?;

    match Format::parse(format) {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

/// Runs `sql` and gathers at most `limit` rows.
pub fn collect(
    bridge: &ConnectionBridge,
    sql: &str,
    limit: Option<usize>,
) -> Result<QueryResult, Box<dyn std::error::Error>> {
    let stmt = bridge.prepare(sql)?;
    let count = bridge.column_count(stmt)?;
    let columns = (0..count)
        .map(|col| {
            bridge
                .column_name(stmt, col)
                .map(|name| name.unwrap_or_else(|| format!("column{col}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut result = QueryResult {
        columns: unique_names(columns),
        rows: Vec::new(),
        truncated: false,
    };
    while next_row(bridge, stmt)? {
        if limit.is_some_and(|limit| result.rows.len() >= limit) {
            result.truncated = true;
            break;
        }
        let mut row = Map::new();
        for (col, name) in (0..count).zip(&result.columns) {
            row.insert(name.clone(), column_value(bridge, stmt, col)?);
        }
        result.rows.push(row);
    }
    bridge.finalize(stmt)?;
    Ok(result)
}

/// Suffixes repeated names so every column keeps its own key in a row.
fn unique_names(names: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::with_capacity(names.len());
    names
        .into_iter()
        .map(|name| {
            let mut unique = name.clone();
            let mut n = 0;
            while seen.contains(&unique) {
                n += 1;
                unique = format!("{name}:{n}");
            }
            seen.insert(unique.clone());
            unique
        })
        .collect()
}

fn column_value(
    bridge: &ConnectionBridge,
    stmt: StatementHandle,
    col: i32,
) -> Result<Value, Box<dyn std::error::Error>> {
    let value = match bridge.column_type(stmt, col)? {
        ValueType::Integer => Value::from(bridge.column_long(stmt, col)?),
        ValueType::Float => Value::from(bridge.column_double(stmt, col)?),
        ValueType::Text => bridge.column_text(stmt, col)?.map_or(Value::Null, Value::from),
        ValueType::Blob => bridge
            .column_blob(stmt, col)?
            .map_or(Value::Null, |bytes| Value::from(hex(&bytes))),
        ValueType::Null => Value::Null,
    };
    Ok(value)
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::from("x'"), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    }) + "'"
}

fn print_text_output(result: &QueryResult) {
    println!("{}", result.columns.join(" | "));
    for row in &result.rows {
        let cells: Vec<String> = result
            .columns
            .iter()
            .map(|name| match row.get(name) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => "NULL".to_string(),
                Some(other) => other.to_string(),
            })
            .collect();
        println!("{}", cells.join(" | "));
    }
    if result.truncated {
        println!("... (truncated)");
    }
    println!("({} row(s))", result.rows.len());
}
