//! Integration tests for the connection bridge.

use parking_lot::Mutex;
use sqlbridge_core::{
    ffi, library, BridgeError, BridgeResult, ColumnMetadata, CommitListener, ConnectionBridge,
    OpenFlags, RegistryKey, UpdateEvent, UpdateKind,
};
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tempfile::tempdir;

fn memory() -> ConnectionBridge {
    ConnectionBridge::open_path(":memory:", OpenFlags::default()).unwrap()
}

fn count_rows(bridge: &ConnectionBridge, table: &str) -> i64 {
    let stmt = bridge
        .prepare(&format!("SELECT count(*) FROM {table}"))
        .unwrap();
    assert_eq!(bridge.step(stmt).unwrap(), ffi::SQLITE_ROW);
    let n = bridge.column_long(stmt, 0).unwrap();
    bridge.finalize(stmt).unwrap();
    n
}

#[test]
fn double_open_closes_stale_handle() {
    let bridge = memory();
    assert!(bridge.is_open());

    let err = bridge.open(":memory:", OpenFlags::default()).unwrap_err();
    assert!(matches!(err, BridgeError::AlreadyOpen));
    assert!(!bridge.is_open());

    bridge.open(":memory:", OpenFlags::default()).unwrap();
    assert!(bridge.is_open());
}

#[test]
fn close_is_idempotent() {
    let bridge = memory();
    bridge.close().unwrap();
    bridge.close().unwrap();
    bridge.close().unwrap();
    assert!(!bridge.is_open());
    assert!(matches!(bridge.errmsg(), Err(BridgeError::InvalidHandle)));
}

#[test]
fn open_failure_reports_cant_open() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("no/such/dir/db.sqlite");
    let bridge = ConnectionBridge::new();
    let err = bridge
        .open(missing.to_str().unwrap(), OpenFlags::READ_ONLY)
        .unwrap_err();
    assert_eq!(err.code(), Some(ffi::SQLITE_CANTOPEN));
    assert!(!bridge.is_open());
}

#[test]
fn statements_from_a_closed_session_are_rejected() {
    let bridge = memory();
    let stmt = bridge.prepare("SELECT 1").unwrap();
    bridge.close().unwrap();
    bridge.open(":memory:", OpenFlags::default()).unwrap();
    assert!(matches!(bridge.step(stmt), Err(BridgeError::InvalidHandle)));
}

#[test]
fn reused_statement_address_does_not_revive_stale_handle() {
    let bridge = memory();
    let old = bridge.prepare("SELECT 1").unwrap();
    assert_eq!(bridge.finalize(old).unwrap(), ffi::SQLITE_OK);
    let new = bridge.prepare("SELECT 2").unwrap();
    assert_ne!(old, new);

    assert!(matches!(bridge.step(old), Err(BridgeError::InvalidHandle)));
    assert!(matches!(bridge.column_int(old, 0), Err(BridgeError::InvalidHandle)));
    assert_eq!(bridge.finalize(old).unwrap(), ffi::SQLITE_OK);

    assert_eq!(bridge.step(new).unwrap(), ffi::SQLITE_ROW);
    assert_eq!(bridge.column_int(new, 0).unwrap(), 2);
    assert_eq!(bridge.finalize(new).unwrap(), ffi::SQLITE_OK);
}

#[test]
fn step_returns_raw_codes() {
    let bridge = memory();
    let stmt = bridge.prepare("SELECT 1").unwrap();
    assert_eq!(bridge.step(stmt).unwrap(), ffi::SQLITE_ROW);
    assert_eq!(bridge.step(stmt).unwrap(), ffi::SQLITE_DONE);
    assert_eq!(bridge.reset(stmt).unwrap(), ffi::SQLITE_OK);
    assert_eq!(bridge.step(stmt).unwrap(), ffi::SQLITE_ROW);
    assert_eq!(bridge.finalize(stmt).unwrap(), ffi::SQLITE_OK);
}

#[test]
fn exec_failure_is_structured() {
    let bridge = memory();
    let err = bridge.exec("CREATE TABLE").unwrap_err();
    assert_eq!(err.code(), Some(ffi::SQLITE_ERROR));
    assert!(err.to_string().starts_with("Generic error"));

    // still usable
    bridge.exec("CREATE TABLE t (x)").unwrap();
}

#[test]
fn bind_text_round_trip() {
    let bridge = memory();
    let stmt = bridge.prepare("SELECT ?1").unwrap();
    assert_eq!(bridge.bind_parameter_count(stmt).unwrap(), 1);
    assert_eq!(bridge.bind_text(stmt, 1, "hello").unwrap(), ffi::SQLITE_OK);
    assert_eq!(bridge.step(stmt).unwrap(), ffi::SQLITE_ROW);
    assert_eq!(bridge.column_text(stmt, 0).unwrap().as_deref(), Some("hello"));
    assert_eq!(bridge.column_bytes(stmt, 0).unwrap(), 5);
}

#[test]
fn bind_out_of_range_returns_code() {
    let bridge = memory();
    let stmt = bridge.prepare("SELECT ?1").unwrap();
    assert_eq!(bridge.bind_int(stmt, 2, 7).unwrap(), ffi::SQLITE_RANGE);
}

#[test]
fn typed_columns() {
    let bridge = memory();
    bridge
        .exec("CREATE TABLE t (i INTEGER, r REAL, s TEXT, b BLOB, n)")
        .unwrap();
    let insert = bridge.prepare("INSERT INTO t VALUES (?1, ?2, ?3, ?4, ?5)").unwrap();
    bridge.bind_long(insert, 1, 1 << 40).unwrap();
    bridge.bind_double(insert, 2, 2.5).unwrap();
    bridge.bind_text(insert, 3, "").unwrap();
    bridge.bind_blob(insert, 4, &[1, 2, 3]).unwrap();
    bridge.bind_null(insert, 5).unwrap();
    assert_eq!(bridge.step(insert).unwrap(), ffi::SQLITE_DONE);
    assert_eq!(bridge.changes().unwrap(), 1);

    let select = bridge.prepare("SELECT i, r, s, b, n FROM t").unwrap();
    assert_eq!(bridge.column_count(select).unwrap(), 5);
    assert_eq!(bridge.column_name(select, 1).unwrap().as_deref(), Some("r"));
    assert_eq!(bridge.column_decltype(select, 0).unwrap().as_deref(), Some("INTEGER"));
    assert_eq!(bridge.column_table_name(select, 2).unwrap().as_deref(), Some("t"));

    assert_eq!(bridge.step(select).unwrap(), ffi::SQLITE_ROW);
    assert_eq!(bridge.column_long(select, 0).unwrap(), 1 << 40);
    assert_eq!(bridge.column_double(select, 1).unwrap(), 2.5);
    assert_eq!(bridge.column_text(select, 2).unwrap(), Some(String::new()));
    assert_eq!(bridge.column_blob(select, 3).unwrap(), Some(vec![1, 2, 3]));
    assert_eq!(bridge.column_text(select, 4).unwrap(), None);
}

#[test]
fn clear_bindings_resets_to_null() {
    let bridge = memory();
    let stmt = bridge.prepare("SELECT ?1").unwrap();
    bridge.bind_int(stmt, 1, 5).unwrap();
    assert_eq!(bridge.clear_bindings(stmt).unwrap(), ffi::SQLITE_OK);
    assert_eq!(bridge.step(stmt).unwrap(), ffi::SQLITE_ROW);
    assert_eq!(bridge.column_text(stmt, 0).unwrap(), None);
}

#[test]
fn column_metadata_flags() {
    let bridge = memory();
    bridge
        .exec("CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL, name TEXT)")
        .unwrap();
    let stmt = bridge.prepare("SELECT id, name, id + 1 FROM users").unwrap();

    let meta = bridge.column_metadata(stmt).unwrap();
    assert_eq!(meta.len(), 3);
    assert_eq!(meta[0].as_tuple(), (true, true, true));
    assert_eq!(meta[1], ColumnMetadata::default());
    assert_eq!(meta[2].as_tuple(), (false, false, false));
}

#[test]
fn busy_handler_is_exclusive() {
    let bridge = memory();
    bridge
        .set_busy_handler(|_: i32| -> BridgeResult<bool> { Ok(false) })
        .unwrap();
    assert!(bridge.is_registered(&RegistryKey::Busy));

    let err = bridge
        .set_busy_handler(|_: i32| -> BridgeResult<bool> { Ok(true) })
        .unwrap_err();
    assert!(matches!(err, BridgeError::HandlerAlreadySet));

    bridge.clear_busy_handler().unwrap();
    bridge
        .set_busy_handler(|_: i32| -> BridgeResult<bool> { Ok(true) })
        .unwrap();
}

#[test]
fn busy_handler_sees_lock_contention() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("busy.db");
    let path = path.to_str().unwrap();

    let writer = ConnectionBridge::open_path(path, OpenFlags::default()).unwrap();
    writer.exec("CREATE TABLE t (x)").unwrap();
    writer.exec("BEGIN EXCLUSIVE").unwrap();

    let reader = ConnectionBridge::open_path(path, OpenFlags::default()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    reader
        .set_busy_handler(move |attempts: i32| -> BridgeResult<bool> {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(attempts < 2)
        })
        .unwrap();

    let err = reader.exec("SELECT * FROM t").unwrap_err();
    assert_eq!(err.code(), Some(ffi::SQLITE_BUSY));
    // attempts 0, 1 and 2 for the first lock request at least
    assert!(calls.load(Ordering::SeqCst) >= 3);

    writer.exec("COMMIT").unwrap();
    reader.exec("SELECT * FROM t").unwrap();
}

#[test]
fn update_listener_reports_row_changes() {
    let bridge = memory();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    bridge
        .set_update_listener(move |event: &UpdateEvent| sink.lock().push(event.clone()))
        .unwrap();

    bridge.exec("CREATE TABLE t (x)").unwrap();
    bridge.exec("INSERT INTO t VALUES (1)").unwrap();
    bridge.exec("UPDATE t SET x = 2").unwrap();
    bridge.exec("DELETE FROM t").unwrap();

    let events = events.lock();
    let kinds: Vec<UpdateKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![UpdateKind::Insert, UpdateKind::Update, UpdateKind::Delete]
    );
    assert!(events
        .iter()
        .all(|e| e.database == "main" && e.table == "t" && e.row_id == 1));
}

#[derive(Default)]
struct Outcomes {
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

struct CountingListener(Arc<Outcomes>);

impl CommitListener for CountingListener {
    fn on_commit(&self) {
        self.0.commits.fetch_add(1, Ordering::SeqCst);
    }

    fn on_rollback(&self) {
        self.0.rollbacks.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn commit_listener_sees_both_outcomes() {
    let bridge = memory();
    bridge.exec("CREATE TABLE t (x)").unwrap();

    let outcomes = Arc::new(Outcomes::default());
    bridge
        .set_commit_listener(CountingListener(Arc::clone(&outcomes)))
        .unwrap();

    bridge.exec("INSERT INTO t VALUES (1)").unwrap();
    bridge.exec("BEGIN; INSERT INTO t VALUES (2); ROLLBACK;").unwrap();
    assert_eq!(outcomes.commits.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes.rollbacks.load(Ordering::SeqCst), 1);

    bridge.clear_commit_listener().unwrap();
    bridge.exec("INSERT INTO t VALUES (3)").unwrap();
    assert_eq!(outcomes.commits.load(Ordering::SeqCst), 1);
    assert_eq!(count_rows(&bridge, "t"), 2);
}

struct InterruptOnRollback {
    bridge: Weak<ConnectionBridge>,
    outcomes: Arc<Outcomes>,
}

impl CommitListener for InterruptOnRollback {
    fn on_commit(&self) {
        self.outcomes.commits.fetch_add(1, Ordering::SeqCst);
    }

    fn on_rollback(&self) {
        self.outcomes.rollbacks.fetch_add(1, Ordering::SeqCst);
        if let Some(bridge) = self.bridge.upgrade() {
            // the handle is already being torn down
            let _ = bridge.interrupt();
        }
    }
}

#[test]
fn close_with_open_transaction_lets_rollback_listener_interrupt() {
    let bridge = Arc::new(memory());
    bridge.exec("CREATE TABLE t (x)").unwrap();

    let outcomes = Arc::new(Outcomes::default());
    bridge
        .set_commit_listener(InterruptOnRollback {
            bridge: Arc::downgrade(&bridge),
            outcomes: Arc::clone(&outcomes),
        })
        .unwrap();

    bridge.exec("BEGIN; INSERT INTO t VALUES (1);").unwrap();
    bridge.close().unwrap();

    assert!(!bridge.is_open());
    assert_eq!(outcomes.rollbacks.load(Ordering::SeqCst), 1);
    assert!(matches!(bridge.interrupt(), Err(BridgeError::InvalidHandle)));
}

#[test]
fn progress_handler_interrupts() {
    let bridge = memory();
    let long_query = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 100000) \
                      SELECT count(*) FROM c";

    bridge
        .set_progress_handler(100, || -> BridgeResult<bool> { Ok(true) })
        .unwrap();
    let err = bridge.exec(long_query).unwrap_err();
    assert_eq!(err.code(), Some(ffi::SQLITE_INTERRUPT));

    bridge.clear_progress_handler().unwrap();
    bridge.exec(long_query).unwrap();
}

#[test]
fn collation_orders_rows() {
    let bridge = memory();
    bridge
        .create_collation("reverse", |a: &str, b: &str| b.cmp(a))
        .unwrap();
    bridge.exec("CREATE TABLE t (x TEXT)").unwrap();
    bridge
        .exec("INSERT INTO t VALUES ('a'), ('c'), ('b')")
        .unwrap();

    let stmt = bridge
        .prepare("SELECT x FROM t ORDER BY x COLLATE reverse")
        .unwrap();
    let mut rows = Vec::new();
    while bridge.step(stmt).unwrap() == ffi::SQLITE_ROW {
        rows.push(bridge.column_text(stmt, 0).unwrap().unwrap());
    }
    assert_eq!(rows, vec!["c", "b", "a"]);
    bridge.finalize(stmt).unwrap();

    bridge.destroy_collation("reverse").unwrap();
    assert!(bridge
        .prepare("SELECT x FROM t ORDER BY x COLLATE reverse")
        .is_err());
}

#[test]
fn backup_then_restore() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("copy.db");
    let path = path.to_str().unwrap();

    let source = memory();
    source.exec("CREATE TABLE t (x)").unwrap();
    source
        .exec("WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 500) \
               INSERT INTO t SELECT x FROM c")
        .unwrap();

    let steps = Cell::new(0);
    let observer = |_remaining: i32, _pages: i32| steps.set(steps.get() + 1);
    assert_eq!(source.backup("main", path, Some(&observer)).unwrap(), ffi::SQLITE_OK);
    assert!(steps.get() >= 1);
    assert_eq!(source.stats().transfers, 1);

    let copy = ConnectionBridge::open_path(path, OpenFlags::READ_ONLY).unwrap();
    assert_eq!(count_rows(&copy, "t"), 500);
    copy.close().unwrap();

    let target = memory();
    assert_eq!(target.restore("main", path, None).unwrap(), ffi::SQLITE_OK);
    assert_eq!(count_rows(&target, "t"), 500);
}

#[test]
fn restore_from_missing_file_returns_code() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("missing.db");
    let bridge = memory();
    let rc = bridge
        .restore("main", path.to_str().unwrap(), None)
        .unwrap();
    assert_eq!(rc, ffi::SQLITE_CANTOPEN);
    assert!(bridge.is_open());
}

#[test]
fn backup_requires_open_connection() {
    let bridge = ConnectionBridge::new();
    assert!(matches!(
        bridge.backup("main", "x.db", None),
        Err(BridgeError::InvalidHandle)
    ));
}

#[test]
fn library_stays_up_while_connections_are_open() {
    let bridge = memory();
    assert!(library::is_initialized());
    assert!(library::open_connections() >= 1);
    assert!(library::shutdown().is_err());
    assert!(bridge.libversion().starts_with('3'));
}

#[test]
fn interrupt_on_idle_connection_is_harmless() {
    let bridge = memory();
    bridge.interrupt().unwrap();
    bridge.exec("SELECT 1").unwrap();
}
