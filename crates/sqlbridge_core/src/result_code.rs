//! Result code registry.
//!
//! Static table mapping the engine's primary result codes to canonical
//! descriptions. Codes are partitioned into `Ok`, the two continuation codes
//! (`Row`, `Done`) and true errors.

use crate::error::{BridgeError, BridgeResult};
use std::fmt;

/// A primary result code reported by the native engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultCode {
    /// Successful result.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error in the engine.
    Internal = 2,
    /// Access permission denied.
    Perm = 3,
    /// Callback routine requested an abort.
    Abort = 4,
    /// The database file is locked.
    Busy = 5,
    /// A table in the database is locked.
    Locked = 6,
    /// A malloc() failed.
    NoMem = 7,
    /// Attempt to write a readonly database.
    ReadOnly = 8,
    /// Operation terminated by an interrupt.
    Interrupt = 9,
    /// Some kind of disk I/O error occurred.
    IoErr = 10,
    /// The database disk image is malformed.
    Corrupt = 11,
    /// Unknown opcode in file control.
    NotFound = 12,
    /// Insertion failed because database is full.
    Full = 13,
    /// Unable to open the database file.
    CantOpen = 14,
    /// Database lock protocol error.
    Protocol = 15,
    /// Internal use only.
    Empty = 16,
    /// The database schema changed.
    Schema = 17,
    /// String or BLOB exceeds size limit.
    TooBig = 18,
    /// Abort due to constraint violation.
    Constraint = 19,
    /// Data type mismatch.
    Mismatch = 20,
    /// Library used incorrectly.
    Misuse = 21,
    /// Uses OS features not supported on host.
    NoLfs = 22,
    /// Authorization denied.
    Auth = 23,
    /// Not used.
    Format = 24,
    /// Bind parameter index out of range.
    Range = 25,
    /// File opened that is not a database file.
    NotADb = 26,
    /// Notification from the engine log.
    Notice = 27,
    /// Warning from the engine log.
    Warning = 28,
    /// `step` has another row ready.
    Row = 100,
    /// `step` has finished executing.
    Done = 101,
}

/// Coarse classification of a result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeCategory {
    /// Success.
    Ok,
    /// Non-error continuation code (`Row`, `Done`).
    Continuation,
    /// A true error.
    Error,
}

const REGISTRY: [(ResultCode, &str); 31] = [
    (ResultCode::Ok, "Successful result"),
    (ResultCode::Error, "Generic error"),
    (ResultCode::Internal, "Internal logic error in SQLite"),
    (ResultCode::Perm, "Access permission denied"),
    (ResultCode::Abort, "Callback routine requested an abort"),
    (ResultCode::Busy, "The database file is locked"),
    (ResultCode::Locked, "A table in the database is locked"),
    (ResultCode::NoMem, "A malloc() failed"),
    (ResultCode::ReadOnly, "Attempt to write a readonly database"),
    (ResultCode::Interrupt, "Operation terminated by sqlite3_interrupt()"),
    (ResultCode::IoErr, "Some kind of disk I/O error occurred"),
    (ResultCode::Corrupt, "The database disk image is malformed"),
    (ResultCode::NotFound, "Unknown opcode in sqlite3_file_control()"),
    (ResultCode::Full, "Insertion failed because database is full"),
    (ResultCode::CantOpen, "Unable to open the database file"),
    (ResultCode::Protocol, "Database lock protocol error"),
    (ResultCode::Empty, "Internal use only"),
    (ResultCode::Schema, "The database schema changed"),
    (ResultCode::TooBig, "String or BLOB exceeds size limit"),
    (ResultCode::Constraint, "Abort due to constraint violation"),
    (ResultCode::Mismatch, "Data type mismatch"),
    (ResultCode::Misuse, "Library used incorrectly"),
    (ResultCode::NoLfs, "Uses OS features not supported on host"),
    (ResultCode::Auth, "Authorization denied"),
    (ResultCode::Format, "Not used"),
    (ResultCode::Range, "2nd parameter to sqlite3_bind out of range"),
    (ResultCode::NotADb, "File opened that is not a database file"),
    (ResultCode::Notice, "Notifications from sqlite3_log()"),
    (ResultCode::Warning, "Warnings from sqlite3_log()"),
    (ResultCode::Row, "sqlite3_step() has another row ready"),
    (ResultCode::Done, "sqlite3_step() has finished executing"),
];

impl ResultCode {
    /// Every code in the registry, in numeric order.
    pub fn all() -> impl Iterator<Item = ResultCode> {
        REGISTRY.iter().map(|(code, _)| *code)
    }

    /// Looks up a code by its exact numeric value.
    pub fn from_raw(raw: i32) -> Option<Self> {
        REGISTRY
            .iter()
            .find(|(code, _)| *code as i32 == raw)
            .map(|(code, _)| *code)
    }

    /// Looks up a code, reducing extended codes to their primary code.
    pub fn from_extended(raw: i32) -> Option<Self> {
        Self::from_raw(raw).or_else(|| match Self::from_raw(raw & 0xff) {
            Some(Self::Ok) | None => None,
            primary => primary,
        })
    }

    /// Returns the numeric value.
    pub const fn raw(self) -> i32 {
        self as i32
    }

    /// Returns the canonical description.
    pub fn description(self) -> &'static str {
        REGISTRY
            .iter()
            .find(|(code, _)| *code == self)
            .map_or("", |(_, desc)| desc)
    }

    /// Returns the category of this code.
    pub const fn category(self) -> CodeCategory {
        match self {
            Self::Ok => CodeCategory::Ok,
            Self::Row | Self::Done => CodeCategory::Continuation,
            _ => CodeCategory::Error,
        }
    }

    /// Returns true for `Busy` and `Locked`.
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Busy | Self::Locked)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.raw())
    }
}

/// Fails unless `raw` is `Ok`.
///
/// Used by calls that require unconditional success (open, exec, prepare),
/// so `Row` and `Done` fail here too. Extended codes are reported under
/// their primary code; codes outside the registry fail as generic errors.
pub fn check_return_code(raw: i32) -> BridgeResult<()> {
    if raw == ResultCode::Ok.raw() {
        return Ok(());
    }
    match ResultCode::from_extended(raw) {
        Some(code) => Err(BridgeError::native(code)),
        None => Err(BridgeError::native_with_detail(
            ResultCode::Error,
            format!("unknown result code {raw}"),
        )),
    }
}

/// Returns true if `raw` (possibly extended) is busy or locked.
pub fn is_busy_code(raw: i32) -> bool {
    ResultCode::from_extended(raw).is_some_and(ResultCode::is_busy)
}
