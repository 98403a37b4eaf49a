//! Backup and restore commands.
//!
//! Both directions use the engine's online backup API, so the source may be
//! in use by other connections while the copy runs.

use super::{open, CommandError};
use sqlbridge_core::{ffi, ResultCode};
use std::path::Path;
use tracing::{debug, info};

fn path_str(path: &Path) -> Result<&str, CommandError> {
    path.to_str()
        .ok_or_else(|| CommandError::NonUtf8Path(path.display().to_string()))
}

fn check_transfer(operation: &'static str, code: i32) -> Result<(), CommandError> {
    if code == ffi::SQLITE_OK {
        return Ok(());
    }
    let description = ResultCode::from_extended(code).map_or("unknown result code", ResultCode::description);
    Err(CommandError::Transfer {
        operation,
        code,
        description,
    })
}

fn log_step(remaining: i32, page_count: i32) {
    debug!(remaining, page_count, "transfer step");
}

/// Copies schema `schema` of the database at `db_path` into `output_path`.
pub fn create(
    db_path: &str,
    output_path: &Path,
    schema: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Creating backup of {db_path}");
    let output = path_str(output_path)?;

    let bridge = open(db_path)?;
    let code = bridge.backup(schema, output, Some(&log_step))?;
    let stats = bridge.stats();
    bridge.close()?;
    check_transfer("backup", code)?;

    println!("✓ Backup created successfully");
    println!("  Path: {output}");
    println!("  Schema: {schema}");
    println!("  Busy retries: {}", stats.transfer_busy_retries);
    Ok(())
}

/// Replaces schema `schema` of the database at `db_path` with the contents
/// of `input_path`.
pub fn restore(
    input_path: &Path,
    db_path: &str,
    schema: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let input = path_str(input_path)?;
    if !input_path.exists() && !input.to_ascii_lowercase().starts_with("file:") {
        return Err(CommandError::MissingSource(input.to_string()).into());
    }
    info!("Restoring {input} into {db_path}");

    let bridge = open(db_path)?;
    let code = bridge.restore(schema, input, Some(&log_step))?;
    bridge.close()?;
    check_transfer("restore", code)?;

    println!("✓ Database restored successfully");
    println!("  Source: {input}");
    println!("  Target: {db_path}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::query::collect;
    use tempfile::tempdir;

    #[test]
    fn backup_then_restore_round_trip() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.db");
        let copy = dir.path().join("copy.db");
        let target = dir.path().join("target.db");
        let source = source.to_str().unwrap();
        let target = target.to_str().unwrap();

        let bridge = open(source).unwrap();
        bridge
            .exec("CREATE TABLE t (x); INSERT INTO t VALUES (1), (2), (3);")
            .unwrap();
        bridge.close().unwrap();

        create(source, &copy, "main").unwrap();
        restore(&copy, target, "main").unwrap();

        let bridge = open(target).unwrap();
        let result = collect(&bridge, "SELECT count(*) AS n FROM t", None).unwrap();
        assert_eq!(result.rows[0]["n"], serde_json::Value::from(3));
    }

    #[test]
    fn restore_requires_existing_source() {
        let dir = tempdir().unwrap();
        let err = restore(&dir.path().join("missing.db"), ":memory:", "main").unwrap_err();
        assert!(err.to_string().contains("no database file"));
    }

    #[test]
    fn transfer_codes_map_to_descriptions() {
        assert!(check_transfer("backup", ffi::SQLITE_OK).is_ok());
        let err = check_transfer("restore", ffi::SQLITE_BUSY).unwrap_err();
        assert!(matches!(err, CommandError::Transfer { code: 5, .. }));
        assert!(err.to_string().starts_with("restore failed (5)"));
    }
}
