//! Connection facade.

use crate::backup::{native_sleep, run_transfer, NativeTransfer, TransferDirection, TransferObserver};
use crate::config::{BridgeConfig, OpenFlags};
use crate::error::{BridgeError, BridgeResult};
use crate::function::{FunctionDispatcher, FunctionFlags, FunctionKind};
use crate::handle::{ConnectionHandle, StatementHandle};
use crate::hooks::{
    BusyAdapter, BusyHandler, CollationAdapter, CommitAdapter, CommitListener, ProgressAdapter,
    ProgressHandler, UpdateAdapter, UpdateListener, BUSY_METHOD, COMMIT_METHOD, COMPARE_METHOD,
    PROGRESS_METHOD, ROLLBACK_METHOD, UPDATE_METHOD,
};
use crate::library;
use crate::registry::{CallbackRegistry, Registration, RegistryKey};
use crate::result_code::ResultCode;
use crate::stats::{BridgeStats, StatsSnapshot};
use crate::trampoline::{CallbackTarget, TrampolineArena, TrampolineFactory, TrampolineShape};
use crate::types::{ColumnMetadata, ValueType};
use libsqlite3_sys as ffi;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::ffi::{c_char, c_int, CStr, CString};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const OK: c_int = ffi::SQLITE_OK;

struct ConnectionState {
    handle: ConnectionHandle,
    path: Option<String>,
    /// Live statements by serial.
    statements: HashMap<u64, StatementHandle>,
    /// Serial for the next prepared statement; never reset, so handles
    /// from an earlier session stay stale after a reopen.
    next_serial: u64,
    registry: CallbackRegistry,
    factory: TrampolineFactory,
}

/// Raw handle copy used only by [`ConnectionBridge::interrupt`].
struct InterruptTarget(*mut ffi::sqlite3);

// sqlite3_interrupt may be called from any thread while the handle is open.
unsafe impl Send for InterruptTarget {}

/// A single connection to the native engine.
///
/// Every operation takes the connection's call lock before touching the
/// native handle, the statement set or the callback registry, so calls from
/// several threads are serialized in call order. The lock is reentrant:
/// callbacks the engine runs on the calling thread may use the bridge again.
///
/// # Lifecycle
///
/// ```rust,ignore
/// use sqlbridge_core::{ConnectionBridge, OpenFlags};
///
/// let bridge = ConnectionBridge::new();
/// bridge.open("app.db", OpenFlags::default())?;
///
/// bridge.exec("CREATE TABLE t (x INTEGER)")?;
/// let stmt = bridge.prepare("INSERT INTO t VALUES (?1)")?;
/// bridge.bind_long(stmt, 1, 42)?;
/// assert_eq!(bridge.step(stmt)?, sqlbridge_core::ffi::SQLITE_DONE);
/// bridge.finalize(stmt)?;
///
/// bridge.close()?;
/// ```
///
/// `step`, `reset`, `clear_bindings`, `finalize` and the `bind_*` family
/// return the engine's raw result code; callers branch on it.
pub struct ConnectionBridge {
    config: BridgeConfig,
    state: ReentrantMutex<RefCell<ConnectionState>>,
    interrupt: Mutex<InterruptTarget>,
    stats: Arc<BridgeStats>,
}

impl Default for ConnectionBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBridge")
            .field("open", &self.is_open())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Copies a NUL-terminated engine string.
///
/// # Safety
///
/// `text` must be null or a valid NUL-terminated string.
unsafe fn owned_c_str(text: *const c_char) -> Option<String> {
    if text.is_null() {
        None
    } else {
        Some(CStr::from_ptr(text).to_string_lossy().into_owned())
    }
}

fn errmsg_of(db: *mut ffi::sqlite3) -> Option<String> {
    if db.is_null() {
        return None;
    }
    // SAFETY: db is an open handle; the message is copied immediately.
    unsafe { owned_c_str(ffi::sqlite3_errmsg(db)) }
}

impl ConnectionBridge {
    /// Creates a closed bridge with default configuration.
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    /// Creates a closed bridge.
    pub fn with_config(config: BridgeConfig) -> Self {
        let arena = Arc::new(TrampolineArena::new());
        Self {
            config,
            state: ReentrantMutex::new(RefCell::new(ConnectionState {
                handle: ConnectionHandle::closed(),
                path: None,
                statements: HashMap::new(),
                next_serial: 1,
                registry: CallbackRegistry::new(),
                factory: TrampolineFactory::new(arena),
            })),
            interrupt: Mutex::new(InterruptTarget(ptr::null_mut())),
            stats: Arc::new(BridgeStats::new()),
        }
    }

    /// Opens a fresh bridge on `path`.
    pub fn open_path(path: &str, flags: OpenFlags) -> BridgeResult<Self> {
        let bridge = Self::new();
        bridge.open(path, flags)?;
        Ok(bridge)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Returns true while a connection handle is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().borrow().handle.is_valid()
    }

    /// Path the connection was opened with.
    pub fn path(&self) -> Option<String> {
        self.state.lock().borrow().path.clone()
    }

    /// Returns a snapshot of the call counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of trampolines and function tables held for this connection.
    pub fn retained_trampolines(&self) -> usize {
        self.state.lock().borrow().factory.arena().len()
    }

    fn failure(&self, rc: c_int, detail: Option<String>) -> BridgeError {
        self.stats.record_native_error();
        match (ResultCode::from_extended(rc), detail) {
            (Some(code), Some(detail)) => BridgeError::native_with_detail(code, detail),
            (Some(code), None) => BridgeError::native(code),
            (None, _) => BridgeError::native_with_detail(
                ResultCode::Error,
                format!("unknown result code {rc}"),
            ),
        }
    }

    fn check(&self, db: *mut ffi::sqlite3, rc: c_int) -> BridgeResult<()> {
        if rc == OK {
            Ok(())
        } else {
            Err(self.failure(rc, errmsg_of(db)))
        }
    }

    /// Runs `f` on the open handle while holding the call lock.
    fn with_db<T>(&self, f: impl FnOnce(*mut ffi::sqlite3) -> T) -> BridgeResult<T> {
        let state = self.state.lock();
        let db = state.borrow().handle.check_valid()?;
        Ok(f(db))
    }

    /// Runs `f` on a live statement of this connection while holding the
    /// call lock.
    fn with_stmt<T>(
        &self,
        stmt: StatementHandle,
        f: impl FnOnce(*mut ffi::sqlite3_stmt) -> T,
    ) -> BridgeResult<T> {
        let state = self.state.lock();
        let raw = {
            let state = state.borrow();
            state.handle.check_valid()?;
            match state.statements.get(&stmt.serial()) {
                Some(live) if *live == stmt => live.as_ptr(),
                _ => return Err(BridgeError::InvalidHandle),
            }
        };
        Ok(f(raw))
    }

    // === Lifecycle ===

    /// Opens the connection.
    ///
    /// Fails with [`BridgeError::AlreadyOpen`] if a handle is already open;
    /// that stale handle is closed first, so the bridge ends up closed.
    pub fn open(&self, path: &str, flags: OpenFlags) -> BridgeResult<()> {
        let state = self.state.lock();
        if state.borrow().handle.is_valid() {
            warn!("open called on an open connection, closing the stale handle");
            if let Err(e) = self.close_locked(&state) {
                warn!(error = %e, "stale handle did not close");
            }
            return Err(BridgeError::AlreadyOpen);
        }

        let c_path = CString::new(path)?;
        library::acquire()?;

        let mut db = ptr::null_mut();
        // SAFETY: c_path is NUL-terminated and db receives the new handle.
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags.bits(), ptr::null()) };
        if let Err(e) = self.check(db, rc) {
            // the engine allocates a handle even when open fails
            unsafe { ffi::sqlite3_close(db) };
            library::release();
            return Err(e);
        }

        {
            let mut state = state.borrow_mut();
            state.handle = ConnectionHandle::from_raw(db);
            state.path = Some(path.to_string());
        }
        self.interrupt.lock().0 = db;

        if let Some(timeout) = self.config.busy_timeout {
            let ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
            unsafe { ffi::sqlite3_busy_timeout(db, ms) };
        }

        info!(path, flags = flags.bits(), "database opened");
        Ok(())
    }

    /// Closes the connection.
    ///
    /// Outstanding statements are finalized first. Calling this on a closed
    /// bridge does nothing. On failure the handle stays open.
    pub fn close(&self) -> BridgeResult<()> {
        let state = self.state.lock();
        self.close_locked(&state)
    }

    fn close_locked(&self, state: &RefCell<ConnectionState>) -> BridgeResult<()> {
        let (db, statements) = {
            let state = state.borrow();
            if !state.handle.is_valid() {
                return Ok(());
            }
            let statements: Vec<StatementHandle> = state.statements.values().copied().collect();
            (state.handle.as_ptr(), statements)
        };

        if !statements.is_empty() {
            debug!(count = statements.len(), "finalizing outstanding statements");
        }
        for stmt in statements {
            unsafe { ffi::sqlite3_finalize(stmt.as_ptr()) };
            self.stats.record_finalize();
        }
        state.borrow_mut().statements.clear();

        // not held across close: the rollback hook may call interrupt()
        self.interrupt.lock().0 = ptr::null_mut();
        let rc = unsafe { ffi::sqlite3_close(db) };
        if rc != OK {
            self.interrupt.lock().0 = db;
            return Err(self.failure(rc, errmsg_of(db)));
        }

        let (registry, arena) = {
            let mut state = state.borrow_mut();
            state.handle.take();
            state.path = None;
            (
                std::mem::take(&mut state.registry),
                Arc::clone(state.factory.arena()),
            )
        };
        // user callbacks are dropped outside the state borrow
        drop(registry);
        let released = arena.release();
        library::release();

        info!(released_trampolines = released, "database closed");
        Ok(())
    }

    /// Runs SQL without capturing results.
    pub fn exec(&self, sql: &str) -> BridgeResult<()> {
        let c_sql = CString::new(sql)?;
        self.with_db(|db| {
            self.stats.record_exec();
            let mut errmsg: *mut c_char = ptr::null_mut();
            // SAFETY: c_sql is NUL-terminated; errmsg is freed below.
            let rc = unsafe {
                ffi::sqlite3_exec(db, c_sql.as_ptr(), None, ptr::null_mut(), &mut errmsg)
            };
            let message = unsafe { owned_c_str(errmsg) };
            if !errmsg.is_null() {
                unsafe { ffi::sqlite3_free(errmsg.cast()) };
            }
            if rc == OK {
                Ok(())
            } else {
                Err(self.failure(rc, message.or_else(|| errmsg_of(db))))
            }
        })?
    }

    // === Statements ===

    /// Compiles the first statement in `sql`.
    pub fn prepare(&self, sql: &str) -> BridgeResult<StatementHandle> {
        self.prepare_partial(sql).map(|(stmt, _)| stmt)
    }

    /// Compiles the first statement in `sql` and reports how many bytes of
    /// `sql` it consumed.
    ///
    /// Fails with [`BridgeError::InvalidArgument`] if `sql` holds no
    /// statement (empty, whitespace or comments only).
    pub fn prepare_partial(&self, sql: &str) -> BridgeResult<(StatementHandle, usize)> {
        let len = c_int::try_from(sql.len())
            .map_err(|_| BridgeError::invalid_argument("SQL text is too long"))?;

        let state = self.state.lock();
        let db = state.borrow().handle.check_valid()?;

        let mut stmt = ptr::null_mut();
        let mut tail: *const c_char = ptr::null();
        // SAFETY: the engine reads at most len bytes of sql.
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(db, sql.as_ptr().cast(), len, &mut stmt, &mut tail)
        };
        self.check(db, rc)?;

        let consumed = if tail.is_null() {
            sql.len()
        } else {
            tail as usize - sql.as_ptr() as usize
        };
        if stmt.is_null() {
            return Err(BridgeError::invalid_argument("SQL contains no statement"));
        }

        let handle = {
            let mut state = state.borrow_mut();
            let handle = StatementHandle::from_raw(state.next_serial, stmt);
            state.next_serial += 1;
            state.statements.insert(handle.serial(), handle);
            handle
        };
        self.stats.record_prepare();
        Ok((handle, consumed))
    }

    /// Advances a statement. Returns `SQLITE_ROW`, `SQLITE_DONE` or an
    /// error code.
    pub fn step(&self, stmt: StatementHandle) -> BridgeResult<i32> {
        self.with_stmt(stmt, |s| {
            self.stats.record_step();
            unsafe { ffi::sqlite3_step(s) }
        })
    }

    /// Resets a statement to run again. Bindings are kept.
    pub fn reset(&self, stmt: StatementHandle) -> BridgeResult<i32> {
        self.with_stmt(stmt, |s| unsafe { ffi::sqlite3_reset(s) })
    }

    /// Sets every parameter back to NULL.
    pub fn clear_bindings(&self, stmt: StatementHandle) -> BridgeResult<i32> {
        self.with_stmt(stmt, |s| unsafe { ffi::sqlite3_clear_bindings(s) })
    }

    /// Releases a statement.
    ///
    /// A statement that was already finalized is ignored and reports
    /// `SQLITE_OK`.
    pub fn finalize(&self, stmt: StatementHandle) -> BridgeResult<i32> {
        let state = self.state.lock();
        state.borrow().handle.check_valid()?;
        {
            let mut state = state.borrow_mut();
            if state.statements.get(&stmt.serial()) != Some(&stmt) {
                return Ok(OK);
            }
            state.statements.remove(&stmt.serial());
        }
        self.stats.record_finalize();
        Ok(unsafe { ffi::sqlite3_finalize(stmt.as_ptr()) })
    }

    /// Number of SQL parameters.
    pub fn bind_parameter_count(&self, stmt: StatementHandle) -> BridgeResult<i32> {
        self.with_stmt(stmt, |s| unsafe { ffi::sqlite3_bind_parameter_count(s) })
    }

    /// Number of result columns.
    pub fn column_count(&self, stmt: StatementHandle) -> BridgeResult<i32> {
        self.with_stmt(stmt, |s| unsafe { ffi::sqlite3_column_count(s) })
    }

    /// Name of a result column.
    pub fn column_name(&self, stmt: StatementHandle, col: i32) -> BridgeResult<Option<String>> {
        self.with_stmt(stmt, |s| unsafe { owned_c_str(ffi::sqlite3_column_name(s, col)) })
    }

    /// Declared type of a result column.
    pub fn column_decltype(&self, stmt: StatementHandle, col: i32) -> BridgeResult<Option<String>> {
        self.with_stmt(stmt, |s| unsafe { owned_c_str(ffi::sqlite3_column_decltype(s, col)) })
    }

    /// Originating table of a result column.
    pub fn column_table_name(
        &self,
        stmt: StatementHandle,
        col: i32,
    ) -> BridgeResult<Option<String>> {
        self.with_stmt(stmt, |s| unsafe { owned_c_str(ffi::sqlite3_column_table_name(s, col)) })
    }

    /// Storage class of a column in the current row.
    pub fn column_type(&self, stmt: StatementHandle, col: i32) -> BridgeResult<ValueType> {
        self.with_stmt(stmt, |s| ValueType::from_raw(unsafe { ffi::sqlite3_column_type(s, col) }))
    }

    /// Byte length of a column in the current row.
    pub fn column_bytes(&self, stmt: StatementHandle, col: i32) -> BridgeResult<i32> {
        self.with_stmt(stmt, |s| unsafe { ffi::sqlite3_column_bytes(s, col) })
    }

    /// Column as a 32-bit integer.
    pub fn column_int(&self, stmt: StatementHandle, col: i32) -> BridgeResult<i32> {
        self.with_stmt(stmt, |s| unsafe { ffi::sqlite3_column_int(s, col) })
    }

    /// Column as a 64-bit integer.
    pub fn column_long(&self, stmt: StatementHandle, col: i32) -> BridgeResult<i64> {
        self.with_stmt(stmt, |s| unsafe { ffi::sqlite3_column_int64(s, col) })
    }

    /// Column as a double.
    pub fn column_double(&self, stmt: StatementHandle, col: i32) -> BridgeResult<f64> {
        self.with_stmt(stmt, |s| unsafe { ffi::sqlite3_column_double(s, col) })
    }

    /// Column as text; `None` for SQL NULL.
    pub fn column_text(&self, stmt: StatementHandle, col: i32) -> BridgeResult<Option<String>> {
        self.with_stmt(stmt, |s| unsafe {
            if ffi::sqlite3_column_type(s, col) == ffi::SQLITE_NULL {
                return None;
            }
            let text = ffi::sqlite3_column_text(s, col);
            if text.is_null() {
                return Some(String::new());
            }
            let len = ffi::sqlite3_column_bytes(s, col).max(0) as usize;
            let bytes = std::slice::from_raw_parts(text, len);
            Some(String::from_utf8_lossy(bytes).into_owned())
        })
    }

    /// Column as bytes; `None` for SQL NULL, empty for a zero-length value.
    pub fn column_blob(&self, stmt: StatementHandle, col: i32) -> BridgeResult<Option<Vec<u8>>> {
        self.with_stmt(stmt, |s| unsafe {
            if ffi::sqlite3_column_type(s, col) == ffi::SQLITE_NULL {
                return None;
            }
            let blob = ffi::sqlite3_column_blob(s, col);
            if blob.is_null() {
                return Some(Vec::new());
            }
            let len = ffi::sqlite3_column_bytes(s, col).max(0) as usize;
            Some(std::slice::from_raw_parts(blob.cast::<u8>(), len).to_vec())
        })
    }

    /// Binds NULL to parameter `pos` (1-based).
    pub fn bind_null(&self, stmt: StatementHandle, pos: i32) -> BridgeResult<i32> {
        self.with_stmt(stmt, |s| unsafe { ffi::sqlite3_bind_null(s, pos) })
    }

    /// Binds a 32-bit integer.
    pub fn bind_int(&self, stmt: StatementHandle, pos: i32, value: i32) -> BridgeResult<i32> {
        self.with_stmt(stmt, |s| unsafe { ffi::sqlite3_bind_int(s, pos, value) })
    }

    /// Binds a 64-bit integer.
    pub fn bind_long(&self, stmt: StatementHandle, pos: i32, value: i64) -> BridgeResult<i32> {
        self.with_stmt(stmt, |s| unsafe { ffi::sqlite3_bind_int64(s, pos, value) })
    }

    /// Binds a double.
    pub fn bind_double(&self, stmt: StatementHandle, pos: i32, value: f64) -> BridgeResult<i32> {
        self.with_stmt(stmt, |s| unsafe { ffi::sqlite3_bind_double(s, pos, value) })
    }

    /// Binds UTF-8 text. The engine copies the bytes.
    pub fn bind_text(&self, stmt: StatementHandle, pos: i32, value: &str) -> BridgeResult<i32> {
        let Ok(len) = c_int::try_from(value.len()) else {
            return Ok(ffi::SQLITE_TOOBIG);
        };
        self.with_stmt(stmt, |s| unsafe {
            ffi::sqlite3_bind_text(s, pos, value.as_ptr().cast(), len, ffi::SQLITE_TRANSIENT())
        })
    }

    /// Binds bytes. An empty slice binds a zero-length blob, not NULL.
    pub fn bind_blob(&self, stmt: StatementHandle, pos: i32, value: &[u8]) -> BridgeResult<i32> {
        let Ok(len) = c_int::try_from(value.len()) else {
            return Ok(ffi::SQLITE_TOOBIG);
        };
        self.with_stmt(stmt, |s| unsafe {
            if len == 0 {
                ffi::sqlite3_bind_zeroblob(s, pos, 0)
            } else {
                ffi::sqlite3_bind_blob(s, pos, value.as_ptr().cast(), len, ffi::SQLITE_TRANSIENT())
            }
        })
    }

    /// Catalog facts for every result column of `stmt`.
    ///
    /// Columns without an originating table column (expressions) report
    /// all flags as `false`.
    pub fn column_metadata(&self, stmt: StatementHandle) -> BridgeResult<Vec<ColumnMetadata>> {
        self.with_stmt(stmt, |s| {
            // SAFETY: s is live; every string is copied or passed straight back.
            unsafe {
                let db = ffi::sqlite3_db_handle(s);
                let count = ffi::sqlite3_column_count(s);
                (0..count)
                    .map(|col| {
                        let schema = ffi::sqlite3_column_database_name(s, col);
                        let table = ffi::sqlite3_column_table_name(s, col);
                        let column = ffi::sqlite3_column_origin_name(s, col);
                        if schema.is_null() || table.is_null() || column.is_null() {
                            return ColumnMetadata::default();
                        }

                        let mut decltype: *const c_char = ptr::null();
                        let mut collation: *const c_char = ptr::null();
                        let (mut not_null, mut primary_key, mut auto_increment) = (0, 0, 0);
                        let rc = ffi::sqlite3_table_column_metadata(
                            db,
                            schema,
                            table,
                            column,
                            &mut decltype,
                            &mut collation,
                            &mut not_null,
                            &mut primary_key,
                            &mut auto_increment,
                        );
                        if rc != OK {
                            debug!(col, rc, "column metadata lookup failed");
                            return ColumnMetadata::default();
                        }
                        ColumnMetadata {
                            not_null: not_null != 0,
                            primary_key: primary_key != 0,
                            auto_increment: auto_increment != 0,
                        }
                    })
                    .collect()
            }
        })
    }

    // === Connection settings ===

    /// Enables or disables the process-wide shared cache.
    pub fn shared_cache(&self, enable: bool) -> BridgeResult<i32> {
        self.with_db(|_| unsafe { ffi::sqlite3_enable_shared_cache(c_int::from(enable)) })
    }

    /// Enables or disables extension loading.
    pub fn enable_load_extension(&self, enable: bool) -> BridgeResult<i32> {
        self.with_db(|db| unsafe { ffi::sqlite3_enable_load_extension(db, c_int::from(enable)) })
    }

    /// Asks a running statement on this connection to stop.
    ///
    /// Does not take the call lock, so it reaches a call in flight on
    /// another thread.
    pub fn interrupt(&self) -> BridgeResult<()> {
        let target = self.interrupt.lock();
        if target.0.is_null() {
            return Err(BridgeError::InvalidHandle);
        }
        // SAFETY: close clears the target under this lock before freeing.
        unsafe { ffi::sqlite3_interrupt(target.0) };
        Ok(())
    }

    /// Installs the engine's sleeping busy handler.
    ///
    /// This replaces any busy handler set with
    /// [`set_busy_handler`](Self::set_busy_handler).
    pub fn busy_timeout(&self, timeout: Duration) -> BridgeResult<i32> {
        let ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let state = self.state.lock();
        let db = state.borrow().handle.check_valid()?;
        let rc = unsafe { ffi::sqlite3_busy_timeout(db, ms) };
        if state.borrow_mut().registry.remove(&RegistryKey::Busy).is_some() {
            debug!("busy handler replaced by busy timeout");
        }
        Ok(rc)
    }

    /// Rows changed by the most recent statement.
    pub fn changes(&self) -> BridgeResult<i32> {
        self.with_db(|db| unsafe { ffi::sqlite3_changes(db) })
    }

    /// Rows changed since the connection opened.
    pub fn total_changes(&self) -> BridgeResult<i32> {
        self.with_db(|db| unsafe { ffi::sqlite3_total_changes(db) })
    }

    /// Reads or sets a run-time limit. A negative `value` only reads.
    pub fn limit(&self, id: i32, value: i32) -> BridgeResult<i32> {
        self.with_db(|db| unsafe { ffi::sqlite3_limit(db, id, value) })
    }

    /// Native library version string.
    pub fn libversion(&self) -> String {
        library::version()
    }

    /// Message of the most recent failure on this connection.
    pub fn errmsg(&self) -> BridgeResult<String> {
        self.with_db(|db| errmsg_of(db).unwrap_or_default())
    }

    /// Code of the most recent failure on this connection.
    pub fn error_code(&self) -> BridgeResult<i32> {
        self.with_db(|db| unsafe { ffi::sqlite3_errcode(db) })
    }

    // === User functions and collations ===

    /// Registers a user function under `(name, arity)`, replacing any
    /// previous registration with the same key.
    pub fn create_function(
        &self,
        name: &str,
        arity: i32,
        flags: FunctionFlags,
        kind: FunctionKind,
    ) -> BridgeResult<()> {
        let c_name = CString::new(name)?;
        let state = self.state.lock();
        let db = state.borrow().handle.check_valid()?;
        let factory = state.borrow().factory.clone();

        let is_window = matches!(kind, FunctionKind::Window(_));
        let dispatcher = Arc::new(FunctionDispatcher::new(name, kind, Arc::clone(&self.stats)));
        let entries = dispatcher.entries(&factory)?;
        let text_rep = ffi::SQLITE_UTF8 | flags.bits();

        // SAFETY: the entries' bindings live in the connection arena until
        // the connection closes.
        let rc = unsafe {
            if is_window {
                ffi::sqlite3_create_window_function(
                    db,
                    c_name.as_ptr(),
                    arity,
                    text_rep,
                    entries.user_data,
                    entries.step,
                    entries.final_,
                    entries.value,
                    entries.inverse,
                    None,
                )
            } else {
                ffi::sqlite3_create_function_v2(
                    db,
                    c_name.as_ptr(),
                    arity,
                    text_rep,
                    entries.user_data,
                    entries.func,
                    entries.step,
                    entries.final_,
                    None,
                )
            }
        };
        self.check(db, rc)?;

        let target: Arc<dyn CallbackTarget> = dispatcher;
        let replaced = state.borrow_mut().registry.insert(
            RegistryKey::function(name, arity),
            Registration::new(target, entries.trampolines),
        );
        debug!(function = name, arity, replaced = replaced.is_some(), "function registered");
        Ok(())
    }

    /// Removes the user function registered under `(name, arity)`.
    pub fn destroy_function(&self, name: &str, arity: i32) -> BridgeResult<()> {
        let c_name = CString::new(name)?;
        let state = self.state.lock();
        let db = state.borrow().handle.check_valid()?;
        let rc = unsafe {
            ffi::sqlite3_create_function_v2(
                db,
                c_name.as_ptr(),
                arity,
                ffi::SQLITE_UTF8,
                ptr::null_mut(),
                None,
                None,
                None,
                None,
            )
        };
        self.check(db, rc)?;
        state
            .borrow_mut()
            .registry
            .remove(&RegistryKey::function(name, arity));
        debug!(function = name, arity, "function removed");
        Ok(())
    }

    /// Removes every user function registered through this bridge.
    pub fn free_functions(&self) -> BridgeResult<()> {
        let state = self.state.lock();
        let functions = state.borrow().registry.functions();
        for (name, arity) in functions {
            self.destroy_function(&name, arity)?;
        }
        Ok(())
    }

    /// Registers a collation comparing UTF-8 text.
    pub fn create_collation<F>(&self, name: &str, compare: F) -> BridgeResult<()>
    where
        F: Fn(&str, &str) -> Ordering + Send + Sync + 'static,
    {
        let c_name = CString::new(name)?;
        let state = self.state.lock();
        let db = state.borrow().handle.check_valid()?;
        let factory = state.borrow().factory.clone();

        let target: Arc<dyn CallbackTarget> = Arc::new(CollationAdapter::new(
            name.to_string(),
            Box::new(compare),
            Arc::clone(&self.stats),
        ));
        let trampoline =
            factory.create(Arc::clone(&target), COMPARE_METHOD, TrampolineShape::Collation)?;

        let rc = unsafe {
            ffi::sqlite3_create_collation_v2(
                db,
                c_name.as_ptr(),
                ffi::SQLITE_UTF8,
                trampoline.user_data(),
                trampoline.collation_fn(),
                None,
            )
        };
        self.check(db, rc)?;
        state.borrow_mut().registry.insert(
            RegistryKey::collation(name),
            Registration::new(target, vec![trampoline]),
        );
        debug!(collation = name, "collation registered");
        Ok(())
    }

    /// Removes a collation.
    pub fn destroy_collation(&self, name: &str) -> BridgeResult<()> {
        let c_name = CString::new(name)?;
        let state = self.state.lock();
        let db = state.borrow().handle.check_valid()?;
        let rc = unsafe {
            ffi::sqlite3_create_collation_v2(
                db,
                c_name.as_ptr(),
                ffi::SQLITE_UTF8,
                ptr::null_mut(),
                None,
                None,
            )
        };
        self.check(db, rc)?;
        state
            .borrow_mut()
            .registry
            .remove(&RegistryKey::collation(name));
        Ok(())
    }

    // === Handlers and hooks ===

    /// Installs a busy handler.
    ///
    /// Fails with [`BridgeError::HandlerAlreadySet`] while another one is
    /// installed; clear it first with
    /// [`clear_busy_handler`](Self::clear_busy_handler).
    pub fn set_busy_handler<H>(&self, handler: H) -> BridgeResult<()>
    where
        H: BusyHandler + 'static,
    {
        let state = self.state.lock();
        let db = state.borrow().handle.check_valid()?;
        if state.borrow().registry.contains(&RegistryKey::Busy) {
            return Err(BridgeError::HandlerAlreadySet);
        }
        let factory = state.borrow().factory.clone();

        let target: Arc<dyn CallbackTarget> =
            Arc::new(BusyAdapter::new(Box::new(handler), Arc::clone(&self.stats)));
        let trampoline = factory.create(Arc::clone(&target), BUSY_METHOD, TrampolineShape::Busy)?;

        let rc = unsafe { ffi::sqlite3_busy_handler(db, trampoline.busy_fn(), trampoline.user_data()) };
        self.check(db, rc)?;
        state
            .borrow_mut()
            .registry
            .insert(RegistryKey::Busy, Registration::new(target, vec![trampoline]));
        debug!("busy handler installed");
        Ok(())
    }

    /// Removes the busy handler.
    pub fn clear_busy_handler(&self) -> BridgeResult<()> {
        let state = self.state.lock();
        let db = state.borrow().handle.check_valid()?;
        let rc = unsafe { ffi::sqlite3_busy_handler(db, None, ptr::null_mut()) };
        self.check(db, rc)?;
        state.borrow_mut().registry.remove(&RegistryKey::Busy);
        debug!("busy handler cleared");
        Ok(())
    }

    /// Installs a progress handler called every `vm_steps` virtual machine
    /// instructions. Replaces any previous one.
    pub fn set_progress_handler<H>(&self, vm_steps: i32, handler: H) -> BridgeResult<()>
    where
        H: ProgressHandler + 'static,
    {
        let state = self.state.lock();
        let db = state.borrow().handle.check_valid()?;
        let factory = state.borrow().factory.clone();

        let target: Arc<dyn CallbackTarget> =
            Arc::new(ProgressAdapter::new(Box::new(handler), Arc::clone(&self.stats)));
        let trampoline =
            factory.create(Arc::clone(&target), PROGRESS_METHOD, TrampolineShape::Progress)?;

        unsafe {
            ffi::sqlite3_progress_handler(
                db,
                vm_steps,
                trampoline.notify_fn(),
                trampoline.user_data(),
            );
        }
        state
            .borrow_mut()
            .registry
            .insert(RegistryKey::Progress, Registration::new(target, vec![trampoline]));
        Ok(())
    }

    /// Removes the progress handler.
    pub fn clear_progress_handler(&self) -> BridgeResult<()> {
        let state = self.state.lock();
        let db = state.borrow().handle.check_valid()?;
        unsafe { ffi::sqlite3_progress_handler(db, 0, None, ptr::null_mut()) };
        state.borrow_mut().registry.remove(&RegistryKey::Progress);
        Ok(())
    }

    /// Installs a listener for commits and rollbacks. Replaces any previous
    /// one.
    pub fn set_commit_listener<L>(&self, listener: L) -> BridgeResult<()>
    where
        L: CommitListener + 'static,
    {
        let state = self.state.lock();
        let db = state.borrow().handle.check_valid()?;
        let factory = state.borrow().factory.clone();

        let target: Arc<dyn CallbackTarget> =
            Arc::new(CommitAdapter::new(Box::new(listener), Arc::clone(&self.stats)));
        let commit = factory.create(Arc::clone(&target), COMMIT_METHOD, TrampolineShape::Commit)?;
        let rollback =
            factory.create(Arc::clone(&target), ROLLBACK_METHOD, TrampolineShape::Rollback)?;

        unsafe {
            ffi::sqlite3_commit_hook(db, commit.notify_fn(), commit.user_data());
            ffi::sqlite3_rollback_hook(db, rollback.rollback_fn(), rollback.user_data());
        }

        let mut state = state.borrow_mut();
        state.registry.insert(
            RegistryKey::Commit,
            Registration::new(Arc::clone(&target), vec![commit]),
        );
        state
            .registry
            .insert(RegistryKey::Rollback, Registration::new(target, vec![rollback]));
        Ok(())
    }

    /// Removes the commit and rollback listener.
    pub fn clear_commit_listener(&self) -> BridgeResult<()> {
        let state = self.state.lock();
        let db = state.borrow().handle.check_valid()?;
        unsafe {
            ffi::sqlite3_commit_hook(db, None, ptr::null_mut());
            ffi::sqlite3_rollback_hook(db, None, ptr::null_mut());
        }
        let mut state = state.borrow_mut();
        state.registry.remove(&RegistryKey::Commit);
        state.registry.remove(&RegistryKey::Rollback);
        Ok(())
    }

    /// Installs a row change listener. Replaces any previous one.
    pub fn set_update_listener<L>(&self, listener: L) -> BridgeResult<()>
    where
        L: UpdateListener + 'static,
    {
        let state = self.state.lock();
        let db = state.borrow().handle.check_valid()?;
        let factory = state.borrow().factory.clone();

        let target: Arc<dyn CallbackTarget> =
            Arc::new(UpdateAdapter::new(Box::new(listener), Arc::clone(&self.stats)));
        let trampoline =
            factory.create(Arc::clone(&target), UPDATE_METHOD, TrampolineShape::Update)?;

        unsafe { ffi::sqlite3_update_hook(db, trampoline.update_fn(), trampoline.user_data()) };
        state
            .borrow_mut()
            .registry
            .insert(RegistryKey::Update, Registration::new(target, vec![trampoline]));
        Ok(())
    }

    /// Removes the row change listener.
    pub fn clear_update_listener(&self) -> BridgeResult<()> {
        let state = self.state.lock();
        let db = state.borrow().handle.check_valid()?;
        unsafe { ffi::sqlite3_update_hook(db, None, ptr::null_mut()) };
        state.borrow_mut().registry.remove(&RegistryKey::Update);
        Ok(())
    }

    /// Returns true if a callback is installed under `key`.
    pub fn is_registered(&self, key: &RegistryKey) -> bool {
        self.state.lock().borrow().registry.contains(key)
    }

    // === Backup and restore ===

    /// Copies schema `db_name` of this connection into the file at `dest`.
    ///
    /// Never fails once the arguments are accepted: the result is the
    /// destination handle's last error code (`SQLITE_OK` on success).
    pub fn backup(
        &self,
        db_name: &str,
        dest: &str,
        observer: Option<&dyn TransferObserver>,
    ) -> BridgeResult<i32> {
        self.transfer(db_name, dest, TransferDirection::Backup, observer)
    }

    /// Replaces schema `db_name` of this connection with the file at
    /// `source`.
    ///
    /// Never fails once the arguments are accepted: the result is the
    /// source handle's last error code.
    pub fn restore(
        &self,
        db_name: &str,
        source: &str,
        observer: Option<&dyn TransferObserver>,
    ) -> BridgeResult<i32> {
        self.transfer(db_name, source, TransferDirection::Restore, observer)
    }

    fn transfer(
        &self,
        db_name: &str,
        path: &str,
        direction: TransferDirection,
        observer: Option<&dyn TransferObserver>,
    ) -> BridgeResult<i32> {
        let schema = CString::new(db_name)?;
        let c_path = CString::new(path)?;
        let flags = match direction {
            TransferDirection::Backup => self.config.backup_flags,
            TransferDirection::Restore => self.config.restore_flags,
        }
        .for_path(path);

        self.with_db(|db| {
            let mut ends = NativeTransfer::new(db, schema, c_path, flags, direction);
            let rc = run_transfer(&mut ends, &self.config.transfer, native_sleep, observer, &self.stats);
            info!(?direction, path, schema = db_name, rc, "transfer finished");
            rc
        })
    }
}

impl Drop for ConnectionBridge {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "connection did not close cleanly on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> ConnectionBridge {
        ConnectionBridge::open_path(":memory:", OpenFlags::default()).unwrap()
    }

    #[test]
    fn closed_bridge_rejects_calls() {
        let bridge = ConnectionBridge::new();
        assert!(!bridge.is_open());
        assert!(matches!(bridge.exec("SELECT 1"), Err(BridgeError::InvalidHandle)));
        assert!(matches!(bridge.changes(), Err(BridgeError::InvalidHandle)));
        assert!(matches!(bridge.interrupt(), Err(BridgeError::InvalidHandle)));
        assert!(bridge.close().is_ok());
    }

    #[test]
    fn prepare_reports_consumed_bytes() {
        let bridge = memory();
        let sql = "SELECT 1; SELECT 2;";
        let (stmt, consumed) = bridge.prepare_partial(sql).unwrap();
        assert_eq!(&sql[..consumed], "SELECT 1;");
        bridge.finalize(stmt).unwrap();

        let (stmt, _) = bridge.prepare_partial(&sql[consumed..]).unwrap();
        assert_eq!(bridge.step(stmt).unwrap(), ffi::SQLITE_ROW);
        assert_eq!(bridge.column_int(stmt, 0).unwrap(), 2);
    }

    #[test]
    fn empty_sql_is_rejected() {
        let bridge = memory();
        assert!(matches!(
            bridge.prepare("  -- nothing"),
            Err(BridgeError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn prepare_error_carries_engine_message() {
        let bridge = memory();
        let err = bridge.prepare("SELECT * FROM missing").unwrap_err();
        assert_eq!(err.code(), Some(ResultCode::Error.raw()));
        assert!(err.to_string().contains("no such table: missing"));
        assert_eq!(bridge.stats().native_errors, 1);
    }

    #[test]
    fn finalized_statement_is_stale() {
        let bridge = memory();
        let stmt = bridge.prepare("SELECT 1").unwrap();
        assert_eq!(bridge.finalize(stmt).unwrap(), OK);
        assert!(matches!(bridge.step(stmt), Err(BridgeError::InvalidHandle)));
        assert_eq!(bridge.finalize(stmt).unwrap(), OK);
    }

    #[test]
    fn serials_are_not_reused_across_sessions() {
        let bridge = memory();
        let first = bridge.prepare("SELECT 1").unwrap();
        bridge.close().unwrap();
        bridge.open(":memory:", OpenFlags::default()).unwrap();
        let second = bridge.prepare("SELECT 1").unwrap();
        assert!(second.serial() > first.serial());
        assert!(matches!(bridge.step(first), Err(BridgeError::InvalidHandle)));
    }

    #[test]
    fn null_and_empty_blobs_differ() {
        let bridge = memory();
        let stmt = bridge.prepare("SELECT ?1, ?2").unwrap();
        bridge.bind_null(stmt, 1).unwrap();
        assert_eq!(bridge.bind_blob(stmt, 2, &[]).unwrap(), OK);
        assert_eq!(bridge.step(stmt).unwrap(), ffi::SQLITE_ROW);

        assert_eq!(bridge.column_blob(stmt, 0).unwrap(), None);
        assert_eq!(bridge.column_blob(stmt, 1).unwrap(), Some(Vec::new()));
        assert_eq!(bridge.column_type(stmt, 1).unwrap(), ValueType::Blob);
    }

    #[test]
    fn close_finalizes_outstanding_statements() {
        let bridge = memory();
        let _a = bridge.prepare("SELECT 1").unwrap();
        let _b = bridge.prepare("SELECT 2").unwrap();
        bridge.close().unwrap();

        let stats = bridge.stats();
        assert_eq!(stats.statements_prepared, 2);
        assert_eq!(stats.open_statements(), 0);
    }

    #[test]
    fn close_releases_arena() {
        let bridge = memory();
        bridge
            .create_function("one", 0, FunctionFlags::NONE, FunctionKind::scalar(|ctx| {
                ctx.result_int(1);
                Ok(())
            }))
            .unwrap();
        assert!(bridge.retained_trampolines() > 0);
        bridge.close().unwrap();
        assert_eq!(bridge.retained_trampolines(), 0);
    }

    #[test]
    fn limit_reads_and_sets() {
        let bridge = memory();
        let old = bridge.limit(ffi::SQLITE_LIMIT_VARIABLE_NUMBER, 10).unwrap();
        assert!(old > 10);
        assert_eq!(bridge.limit(ffi::SQLITE_LIMIT_VARIABLE_NUMBER, -1).unwrap(), 10);
    }
}
