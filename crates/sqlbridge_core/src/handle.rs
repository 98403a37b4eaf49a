//! Handle model.
//!
//! Value types wrapping the raw addresses of an open connection and of a
//! prepared statement. A zero address means invalid/closed. Neither type is
//! ever dereferenced here; they are only passed back to the engine.

use crate::error::{BridgeError, BridgeResult};
use libsqlite3_sys as ffi;
use std::ptr;

/// An opened connection handle.
///
/// Exactly one [`ConnectionBridge`](crate::ConnectionBridge) owns the live
/// handle; the bridge never hands out copies while it is valid.
#[derive(Debug, PartialEq, Eq)]
pub struct ConnectionHandle {
    raw: *mut ffi::sqlite3,
}

// Access to the pointee is serialized by the owning bridge's call lock.
unsafe impl Send for ConnectionHandle {}

impl ConnectionHandle {
    /// Creates a closed handle.
    pub const fn closed() -> Self {
        Self {
            raw: ptr::null_mut(),
        }
    }

    pub(crate) const fn from_raw(raw: *mut ffi::sqlite3) -> Self {
        Self { raw }
    }

    /// Returns the raw native address.
    pub fn address(&self) -> usize {
        self.raw as usize
    }

    /// Returns true if the handle refers to an open connection.
    pub fn is_valid(&self) -> bool {
        !self.raw.is_null()
    }

    /// Fails with [`BridgeError::InvalidHandle`] unless valid.
    pub fn check_valid(&self) -> BridgeResult<*mut ffi::sqlite3> {
        if self.is_valid() {
            Ok(self.raw)
        } else {
            Err(BridgeError::InvalidHandle)
        }
    }

    pub(crate) fn as_ptr(&self) -> *mut ffi::sqlite3 {
        self.raw
    }

    /// Replaces the handle with a closed one and returns the old raw pointer.
    pub(crate) fn take(&mut self) -> *mut ffi::sqlite3 {
        std::mem::replace(&mut self.raw, ptr::null_mut())
    }
}

impl Default for ConnectionHandle {
    fn default() -> Self {
        Self::closed()
    }
}

/// A prepared-statement handle.
///
/// Returned by `prepare`, released by `finalize`. Besides the raw address the
/// handle carries a serial number unique within its connection. The engine
/// reuses statement addresses, so the bridge looks statements up by serial
/// and a stale copy is rejected instead of reaching a newer statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementHandle {
    serial: u64,
    raw: *mut ffi::sqlite3_stmt,
}

unsafe impl Send for StatementHandle {}
unsafe impl Sync for StatementHandle {}

impl StatementHandle {
    /// Creates an invalid statement handle.
    pub const fn null() -> Self {
        Self {
            serial: 0,
            raw: ptr::null_mut(),
        }
    }

    pub(crate) const fn from_raw(serial: u64, raw: *mut ffi::sqlite3_stmt) -> Self {
        Self { serial, raw }
    }

    /// Returns the raw native address.
    pub fn address(&self) -> usize {
        self.raw as usize
    }

    /// Serial number assigned by the connection at prepare time; 0 for a
    /// null handle.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Returns true if the handle is non-null.
    pub fn is_valid(&self) -> bool {
        !self.raw.is_null()
    }

    pub(crate) fn as_ptr(self) -> *mut ffi::sqlite3_stmt {
        self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_connection_handle() {
        let handle = ConnectionHandle::closed();
        assert!(!handle.is_valid());
        assert_eq!(handle.address(), 0);
        assert!(matches!(handle.check_valid(), Err(BridgeError::InvalidHandle)));
    }

    #[test]
    fn take_invalidates() {
        let mut dummy = 0u8;
        let mut handle = ConnectionHandle::from_raw(ptr::addr_of_mut!(dummy).cast());
        assert!(handle.is_valid());
        assert!(handle.check_valid().is_ok());

        let raw = handle.take();
        assert!(!raw.is_null());
        assert!(!handle.is_valid());
    }

    #[test]
    fn null_statement() {
        let stmt = StatementHandle::null();
        assert!(!stmt.is_valid());
        assert_eq!(stmt.address(), 0);
        assert_eq!(stmt.serial(), 0);
    }

    #[test]
    fn same_address_different_serial() {
        let mut dummy = 0u8;
        let raw = ptr::addr_of_mut!(dummy).cast();
        let first = StatementHandle::from_raw(1, raw);
        let second = StatementHandle::from_raw(2, raw);
        assert_eq!(first.address(), second.address());
        assert_ne!(first, second);
    }
}
