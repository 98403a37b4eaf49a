//! Online backup and restore.
//!
//! Both directions share one loop: open a secondary handle on the file,
//! start a page transfer between the two handles, pump it in fixed batches,
//! then always finish the transfer and always close the secondary handle.
//! The loop never fails; it returns the secondary handle's last error code
//! for the caller to interpret.
//!
//! The native calls sit behind [`TransferEndpoints`] so the loop itself can
//! be exercised without a database.

use crate::config::{OpenFlags, TransferPolicy};
use crate::result_code::{is_busy_code, ResultCode};
use crate::stats::BridgeStats;
use libsqlite3_sys as ffi;
use std::ffi::CString;
use std::ptr;
use std::time::Duration;
use tracing::{debug, warn};

/// Which way pages flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Connection → file.
    Backup,
    /// File → connection.
    Restore,
}

impl TransferDirection {
    fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }
}

/// Receives `(remaining, page_count)` after every transfer step.
pub trait TransferObserver {
    /// Called after each step.
    fn on_progress(&self, remaining: i32, page_count: i32);
}

impl<F> TransferObserver for F
where
    F: Fn(i32, i32),
{
    fn on_progress(&self, remaining: i32, page_count: i32) {
        self(remaining, page_count);
    }
}

/// The native operations the transfer loop drives.
pub trait TransferEndpoints {
    /// Opens the secondary handle. Returns the native open code.
    fn open_secondary(&mut self) -> i32;

    /// Starts the transfer. Returns false if the engine refused.
    fn init(&mut self) -> bool;

    /// Copies up to `pages` pages.
    fn step(&mut self, pages: i32) -> i32;

    /// `(remaining, page_count)` after the last step.
    fn progress(&self) -> (i32, i32);

    /// Releases the transfer object.
    fn finish(&mut self);

    /// Last error code recorded on the secondary handle.
    fn secondary_error_code(&self) -> i32;

    /// Closes the secondary handle.
    fn close_secondary(&mut self);
}

/// Runs the step loop on an initialized transfer and returns the code that
/// ended it.
///
/// `Ok` continues. `Busy`/`Locked` sleep and retry until
/// `policy.max_busy_retries` consecutive busy results have been retried;
/// the next busy result ends the loop. Anything else ends it at once.
fn pump<E, S>(
    ends: &mut E,
    policy: &TransferPolicy,
    sleep: &mut S,
    observer: Option<&dyn TransferObserver>,
    stats: &BridgeStats,
) -> i32
where
    E: TransferEndpoints + ?Sized,
    S: FnMut(Duration),
{
    let mut busy_retries = 0u32;
    loop {
        let rc = ends.step(policy.pages_per_step);
        if let Some(observer) = observer {
            let (remaining, page_count) = ends.progress();
            observer.on_progress(remaining, page_count);
        }

        if rc == ResultCode::Ok.raw() {
            busy_retries = 0;
            continue;
        }
        if is_busy_code(rc) && busy_retries < policy.max_busy_retries {
            busy_retries += 1;
            stats.record_busy_retry();
            debug!(rc, attempt = busy_retries, "transfer busy, retrying");
            sleep(policy.busy_sleep);
            continue;
        }
        return rc;
    }
}

/// Drives one complete transfer.
///
/// `finish` runs whenever `init` succeeded and `close_secondary` runs on
/// every path, each exactly once.
pub fn run_transfer<E, S>(
    ends: &mut E,
    policy: &TransferPolicy,
    mut sleep: S,
    observer: Option<&dyn TransferObserver>,
    stats: &BridgeStats,
) -> i32
where
    E: TransferEndpoints + ?Sized,
    S: FnMut(Duration),
{
    stats.record_transfer();

    let opened = ends.open_secondary();
    let result = if opened == ResultCode::Ok.raw() {
        if ends.init() {
            let last = pump(ends, policy, &mut sleep, observer, stats);
            ends.finish();
            debug!(last, "transfer loop ended");
        } else {
            warn!("transfer could not be initialized");
        }
        ends.secondary_error_code()
    } else {
        warn!(rc = opened, "secondary database could not be opened");
        opened
    };

    ends.close_secondary();
    result
}

/// Native endpoints: a connection and a file opened as the secondary.
pub(crate) struct NativeTransfer {
    main: *mut ffi::sqlite3,
    main_schema: CString,
    path: CString,
    flags: OpenFlags,
    direction: TransferDirection,
    secondary: *mut ffi::sqlite3,
    transfer: *mut ffi::sqlite3_backup,
}

impl NativeTransfer {
    pub(crate) fn new(
        main: *mut ffi::sqlite3,
        main_schema: CString,
        path: CString,
        flags: OpenFlags,
        direction: TransferDirection,
    ) -> Self {
        Self {
            main,
            main_schema,
            path,
            flags,
            direction,
            secondary: ptr::null_mut(),
            transfer: ptr::null_mut(),
        }
    }
}

const SECONDARY_SCHEMA: &std::ffi::CStr = c"main";

impl TransferEndpoints for NativeTransfer {
    fn open_secondary(&mut self) -> i32 {
        debug!(
            direction = self.direction.as_str(),
            path = %self.path.to_string_lossy(),
            "opening secondary database"
        );
        // SAFETY: path is NUL-terminated; secondary receives the new handle.
        unsafe {
            ffi::sqlite3_open_v2(
                self.path.as_ptr(),
                &mut self.secondary,
                self.flags.bits(),
                ptr::null(),
            )
        }
    }

    fn init(&mut self) -> bool {
        // SAFETY: both handles are open; schema names are NUL-terminated.
        self.transfer = unsafe {
            match self.direction {
                TransferDirection::Backup => ffi::sqlite3_backup_init(
                    self.secondary,
                    SECONDARY_SCHEMA.as_ptr(),
                    self.main,
                    self.main_schema.as_ptr(),
                ),
                TransferDirection::Restore => ffi::sqlite3_backup_init(
                    self.main,
                    self.main_schema.as_ptr(),
                    self.secondary,
                    SECONDARY_SCHEMA.as_ptr(),
                ),
            }
        };
        !self.transfer.is_null()
    }

    fn step(&mut self, pages: i32) -> i32 {
        unsafe { ffi::sqlite3_backup_step(self.transfer, pages) }
    }

    fn progress(&self) -> (i32, i32) {
        unsafe {
            (
                ffi::sqlite3_backup_remaining(self.transfer),
                ffi::sqlite3_backup_pagecount(self.transfer),
            )
        }
    }

    fn finish(&mut self) {
        unsafe { ffi::sqlite3_backup_finish(self.transfer) };
        self.transfer = ptr::null_mut();
    }

    fn secondary_error_code(&self) -> i32 {
        unsafe { ffi::sqlite3_errcode(self.secondary) }
    }

    fn close_secondary(&mut self) {
        // closing a null handle is a harmless no-op
        let rc = unsafe { ffi::sqlite3_close(self.secondary) };
        if rc != ResultCode::Ok.raw() {
            warn!(rc, "secondary database did not close cleanly");
        }
        self.secondary = ptr::null_mut();
    }
}

/// Sleeps through the engine, as the transfer loop does between retries.
pub(crate) fn native_sleep(duration: Duration) {
    let ms = i32::try_from(duration.as_millis()).unwrap_or(i32::MAX);
    unsafe { ffi::sqlite3_sleep(ms) };
}
