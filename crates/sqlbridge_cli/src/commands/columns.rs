//! Columns command implementation.

use super::{open, Format};
use serde::Serialize;
use sqlbridge_core::ConnectionBridge;

/// Description of one result column.
#[derive(Debug, Serialize)]
pub struct ColumnInfo {
    /// Zero-based column index.
    pub index: i32,
    /// Column name as the engine reports it.
    pub name: Option<String>,
    /// Declared type, if the column comes from a table.
    pub decltype: Option<String>,
    /// Originating table.
    pub table: Option<String>,
    /// Column has a NOT NULL constraint.
    pub not_null: bool,
    /// Column is part of the primary key.
    pub primary_key: bool,
    /// Column is AUTOINCREMENT.
    pub auto_increment: bool,
}

/// Runs the columns command.
pub fn run(path: &str, sql: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let bridge = open(path)?;
    let columns = describe(&bridge, sql)?;
    bridge.close()?;

    match Format::parse(format) {
        Format::Json => println!("{}", serde_json::to_string_pretty(&columns)?),
        Format::Text => print_text_output(&columns),
    }
    Ok(())
}

/// Prepares `sql` without running it and describes its result columns.
pub fn describe(
    bridge: &ConnectionBridge,
    sql: &str,
) -> Result<Vec<ColumnInfo>, Box<dyn std::error::Error>> {
    let stmt = bridge.prepare(sql)?;
    let metadata = bridge.column_metadata(stmt)?;

    let mut columns = Vec::with_capacity(metadata.len());
    for (index, meta) in (0..).zip(metadata) {
        columns.push(ColumnInfo {
            index,
            name: bridge.column_name(stmt, index)?,
            decltype: bridge.column_decltype(stmt, index)?,
            table: bridge.column_table_name(stmt, index)?,
            not_null: meta.not_null,
            primary_key: meta.primary_key,
            auto_increment: meta.auto_increment,
        });
    }
    bridge.finalize(stmt)?;
    Ok(columns)
}

fn print_text_output(columns: &[ColumnInfo]) {
    println!("=== Result Columns ===");
    for col in columns {
        let mut flags = Vec::new();
        if col.not_null {
            flags.push("NOT NULL");
        }
        if col.primary_key {
            flags.push("PRIMARY KEY");
        }
        if col.auto_increment {
            flags.push("AUTOINCREMENT");
        }
        println!(
            "  {}: {} {} [{}] {}",
            col.index,
            col.name.as_deref().unwrap_or("?"),
            col.decltype.as_deref().unwrap_or("-"),
            col.table.as_deref().unwrap_or("expression"),
            flags.join(" ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_table_and_expression_columns() {
        let bridge = open(":memory:").unwrap();
        bridge
            .exec("CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL, email TEXT NOT NULL)")
            .unwrap();

        let columns = describe(&bridge, "SELECT id, email, length(email) AS n FROM users").unwrap();
        assert_eq!(columns.len(), 3);

        assert_eq!(columns[0].name.as_deref(), Some("id"));
        assert!(columns[0].not_null && columns[0].primary_key && columns[0].auto_increment);

        assert_eq!(columns[1].decltype.as_deref(), Some("TEXT"));
        assert!(columns[1].not_null);
        assert!(!columns[1].primary_key);

        assert_eq!(columns[2].name.as_deref(), Some("n"));
        assert_eq!(columns[2].table, None);
        assert!(!columns[2].not_null);
    }
}
