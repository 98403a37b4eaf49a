//! Error types for the native bridge.

use crate::result_code::ResultCode;
use thiserror::Error;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors raised by the bridge.
///
/// Usage errors (double open, closed handle, duplicate busy handler, bad
/// callback shape) and native result-code failures share this one type so
/// callers see a single structured failure carrying a message.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// `open` was called while a valid connection handle exists.
    #[error("database already open")]
    AlreadyOpen,

    /// The connection or statement handle is closed or was never valid.
    #[error("database is closed or handle is invalid")]
    InvalidHandle,

    /// A busy handler is already registered on this connection.
    #[error("a busy handler already exists")]
    HandlerAlreadySet,

    /// No callback method with the requested name exists on the target.
    #[error("could not find method {method} in {target}")]
    CallbackNotFound {
        /// Requested method name.
        method: String,
        /// Type name of the callback target.
        target: &'static str,
    },

    /// More than one callback method matches the requested name.
    #[error("multiple overloads of method {method} in {target}")]
    AmbiguousCallback {
        /// Requested method name.
        method: String,
        /// Type name of the callback target.
        target: &'static str,
    },

    /// The callback method cannot be expressed as a native trampoline.
    #[error("unsupported callback signature for {method}: {reason}")]
    UnsupportedCallbackSignature {
        /// Method whose signature was rejected.
        method: String,
        /// Why the signature was rejected.
        reason: String,
    },

    /// The function kind does not provide the requested protocol.
    #[error("function {name} does not support the {protocol} protocol")]
    UnsupportedFunctionKind {
        /// Function name.
        name: String,
        /// Protocol that was requested (`xStep`, `xValue`, ...).
        protocol: &'static str,
    },

    /// The native engine returned a failing result code.
    #[error("{}", native_message(*code, detail.as_deref()))]
    Native {
        /// The result code reported by the engine.
        code: ResultCode,
        /// The engine's own error message, when one was available.
        detail: Option<String>,
    },

    /// An argument could not be passed across the native boundary.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// A user callback body failed.
    #[error("{message}")]
    Callback {
        /// Message reported back to the engine.
        message: String,
    },
}

fn native_message(code: ResultCode, detail: Option<&str>) -> String {
    match detail {
        Some(detail) if !detail.is_empty() && detail != code.description() => {
            format!("{}: {detail}", code.description())
        }
        _ => code.description().to_string(),
    }
}

impl BridgeError {
    /// Creates a native failure without engine detail.
    pub fn native(code: ResultCode) -> Self {
        Self::Native { code, detail: None }
    }

    /// Creates a native failure carrying the engine's message.
    pub fn native_with_detail(code: ResultCode, detail: impl Into<String>) -> Self {
        Self::Native {
            code,
            detail: Some(detail.into()),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a callback failure.
    pub fn callback(message: impl Into<String>) -> Self {
        Self::Callback {
            message: message.into(),
        }
    }

    /// Creates an unsupported signature error.
    pub fn unsupported_signature(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedCallbackSignature {
            method: method.into(),
            reason: reason.into(),
        }
    }

    /// Returns the native result code for native failures.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Native { code, .. } => Some(code.raw()),
            _ => None,
        }
    }

    /// Returns true for protocol-usage errors.
    ///
    /// These are programmer errors and are never worth retrying.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyOpen
                | Self::InvalidHandle
                | Self::HandlerAlreadySet
                | Self::CallbackNotFound { .. }
                | Self::AmbiguousCallback { .. }
                | Self::UnsupportedCallbackSignature { .. }
                | Self::UnsupportedFunctionKind { .. }
        )
    }
}

impl From<std::ffi::NulError> for BridgeError {
    fn from(e: std::ffi::NulError) -> Self {
        Self::invalid_argument(format!("interior NUL byte at position {}", e.nul_position()))
    }
}
