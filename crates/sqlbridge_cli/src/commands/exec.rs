//! Exec command implementation.

use super::{next_row, open};
use sqlbridge_core::BridgeError;
use tracing::debug;

/// Runs every statement of `sql` against the database at `path`.
///
/// Statements run one by one so a failure names the statement that caused
/// it. Rows produced along the way are discarded.
pub fn run(path: &str, sql: &str) -> Result<(), Box<dyn std::error::Error>> {
    let bridge = open(path)?;

    let mut rest = sql;
    let mut statements = 0;
    while !rest.trim().is_empty() {
        let (stmt, consumed) = match bridge.prepare_partial(rest) {
            Ok(prepared) => prepared,
            // only comments left
            Err(BridgeError::InvalidArgument { .. }) => break,
            Err(e) => return Err(e.into()),
        };
        debug!(statement = rest[..consumed].trim(), "running");

        while next_row(&bridge, stmt)? {}
        bridge.finalize(stmt)?;

        statements += 1;
        rest = &rest[consumed..];
    }

    let changes = bridge.total_changes()?;
    bridge.close()?;

    println!("✓ Executed {statements} statement(s)");
    println!("  Rows changed: {changes}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn runs_a_script() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("script.db");
        let path = path.to_str().unwrap();

        run(
            path,
            "CREATE TABLE t (x); INSERT INTO t VALUES (1); INSERT INTO t VALUES (2); -- done",
        )
        .unwrap();

        let bridge = open(path).unwrap();
        let stmt = bridge.prepare("SELECT count(*) FROM t").unwrap();
        assert!(next_row(&bridge, stmt).unwrap());
        assert_eq!(bridge.column_long(stmt, 0).unwrap(), 2);
    }

    #[test]
    fn stops_at_the_failing_statement() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fail.db");
        let path = path.to_str().unwrap();

        let err = run(path, "CREATE TABLE t (x); INSERT INTO missing VALUES (1);").unwrap_err();
        assert!(err.to_string().contains("no such table: missing"));
    }
}
