//! Process-wide native library state.
//!
//! The engine is initialized once, on first use, and can be torn down
//! explicitly with [`shutdown`] once no connection is open. Connections
//! acquire and release a slot here so the count is always exact.

use crate::error::{BridgeError, BridgeResult};
use crate::result_code::{check_return_code, ResultCode};
use libsqlite3_sys as ffi;
use parking_lot::{const_mutex, Mutex};
use std::ffi::CStr;
use tracing::{debug, info};

/// Facts about the loaded native library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryInfo {
    /// Version string, e.g. `3.45.0`.
    pub version: String,
    /// Numeric version, e.g. `3045000`.
    pub version_number: i32,
    /// True if the library was compiled thread-safe.
    pub threadsafe: bool,
}

#[derive(Debug)]
struct LibraryState {
    info: Option<LibraryInfo>,
    open_connections: usize,
}

static STATE: Mutex<LibraryState> = const_mutex(LibraryState {
    info: None,
    open_connections: 0,
});

/// Returns the native library version string.
///
/// Safe to call at any time; it does not require initialization.
pub fn version() -> String {
    // SAFETY: sqlite3_libversion returns a pointer to a static string.
    unsafe { CStr::from_ptr(ffi::sqlite3_libversion()) }
        .to_string_lossy()
        .into_owned()
}

fn initialize_locked(state: &mut LibraryState) -> BridgeResult<LibraryInfo> {
    if let Some(info) = &state.info {
        return Ok(info.clone());
    }

    // SAFETY: no connection is open through this crate while uninitialized.
    check_return_code(unsafe { ffi::sqlite3_initialize() })?;

    let info = LibraryInfo {
        version: version(),
        // SAFETY: plain getters without preconditions.
        version_number: unsafe { ffi::sqlite3_libversion_number() },
        threadsafe: unsafe { ffi::sqlite3_threadsafe() } != 0,
    };
    info!(version = %info.version, threadsafe = info.threadsafe, "native library initialized");
    state.info = Some(info.clone());
    Ok(info)
}

/// Initializes the native library if it is not initialized yet.
pub fn initialize() -> BridgeResult<LibraryInfo> {
    initialize_locked(&mut STATE.lock())
}

/// Returns true if the library is currently initialized.
pub fn is_initialized() -> bool {
    STATE.lock().info.is_some()
}

/// Number of connections currently holding the library.
pub fn open_connections() -> usize {
    STATE.lock().open_connections
}

/// Tears the native library down.
///
/// Refused with a `Misuse` failure while any connection is open. Calling it
/// when the library is not initialized does nothing. A later [`initialize`]
/// (or opening a connection) brings the library back.
pub fn shutdown() -> BridgeResult<()> {
    let mut state = STATE.lock();
    if state.info.is_none() {
        return Ok(());
    }
    if state.open_connections > 0 {
        return Err(BridgeError::native_with_detail(
            ResultCode::Misuse,
            format!(
                "cannot shut down with {} open connection(s)",
                state.open_connections
            ),
        ));
    }

    // SAFETY: no connection opened through this crate is alive.
    check_return_code(unsafe { ffi::sqlite3_shutdown() })?;
    state.info = None;
    info!("native library shut down");
    Ok(())
}

/// Initializes if needed and reserves a connection slot.
pub(crate) fn acquire() -> BridgeResult<()> {
    let mut state = STATE.lock();
    initialize_locked(&mut state)?;
    state.open_connections += 1;
    debug!(open = state.open_connections, "connection slot acquired");
    Ok(())
}

/// Releases a slot reserved by [`acquire`].
pub(crate) fn release() {
    let mut state = STATE.lock();
    state.open_connections = state.open_connections.saturating_sub(1);
    debug!(open = state.open_connections, "connection slot released");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_available_without_init() {
        let v = version();
        assert!(v.starts_with('3'));
    }

    #[test]
    fn initialize_is_idempotent() {
        let first = initialize().unwrap();
        let second = initialize().unwrap();
        assert_eq!(first, second);
        assert!(first.version_number >= 3_000_000);
        assert!(first.threadsafe);
    }

    #[test]
    fn shutdown_refused_while_held() {
        acquire().unwrap();
        let err = shutdown().unwrap_err();
        assert_eq!(err.code(), Some(ResultCode::Misuse.raw()));
        release();
    }
}
