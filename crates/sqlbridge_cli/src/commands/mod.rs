//! CLI command implementations.

pub mod backup;
pub mod columns;
pub mod exec;
pub mod query;
pub mod version;

use sqlbridge_core::{ffi, BridgeResult, ConnectionBridge, OpenFlags, StatementHandle};
use thiserror::Error;

/// Failures reported by the commands themselves.
#[derive(Debug, Error)]
pub enum CommandError {
    /// A statement stopped with an error code.
    #[error("statement failed ({code}): {message}")]
    Step {
        /// Raw result code returned by the step.
        code: i32,
        /// Connection error message.
        message: String,
    },

    /// A backup or restore ended with a non-OK code.
    #[error("{operation} failed ({code}): {description}")]
    Transfer {
        /// `backup` or `restore`.
        operation: &'static str,
        /// Code reported by the transfer.
        code: i32,
        /// Registry description of the code.
        description: &'static str,
    },

    /// The restore source does not exist.
    #[error("no database file at {0}")]
    MissingSource(String),

    /// A path could not be passed to the engine.
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(String),
}

/// Output format shared by the reporting commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Human-readable lines.
    Text,
    /// Pretty-printed JSON.
    Json,
}

impl Format {
    /// Parses `--format`; anything but `json` prints text.
    pub fn parse(format: &str) -> Self {
        if format.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        }
    }
}

/// Opens `path` read-write, creating it if needed.
pub fn open(path: &str) -> BridgeResult<ConnectionBridge> {
    ConnectionBridge::open_path(path, OpenFlags::default())
}

/// Steps `stmt` once, mapping anything but a row or completion to an error.
///
/// Returns `true` while a row is available.
pub fn next_row(
    bridge: &ConnectionBridge,
    stmt: StatementHandle,
) -> Result<bool, Box<dyn std::error::Error>> {
    match bridge.step(stmt)? {
        ffi::SQLITE_ROW => Ok(true),
        ffi::SQLITE_DONE => Ok(false),
        code => Err(CommandError::Step {
            code,
            message: bridge.errmsg()?,
        }
        .into()),
    }
}
