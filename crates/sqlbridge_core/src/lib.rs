//! # sqlbridge core
//!
//! Native call bridge to the embedded SQLite engine.
//!
//! This crate provides:
//! - A result code registry translating engine codes into structured errors
//! - Connection and statement handles with validity tracking
//! - A serialized connection facade over the raw engine calls
//! - Trampolines binding Rust callback objects to native function pointers
//! - Scalar, aggregate and window user functions, collations and hooks
//! - Online backup and restore with busy retries
//!
//! The raw bindings come from `libsqlite3-sys` (re-exported as [`ffi`]) with
//! the engine compiled in.

pub mod backup;
pub mod config;
pub mod connection;
pub mod error;
pub mod function;
pub mod handle;
pub mod hooks;
pub mod library;
pub mod registry;
pub mod result_code;
pub mod stats;
pub mod trampoline;
pub mod types;

pub use backup::{run_transfer, TransferDirection, TransferEndpoints, TransferObserver};
pub use config::{BridgeConfig, OpenFlags, TransferPolicy};
pub use connection::ConnectionBridge;
pub use error::{BridgeError, BridgeResult};
pub use function::{
    Aggregate, CallContext, FunctionDispatcher, FunctionFlags, FunctionKind, Protocol,
    WindowAggregate,
};
pub use handle::{ConnectionHandle, StatementHandle};
pub use hooks::{
    BusyHandler, CommitListener, Comparator, ProgressHandler, UpdateEvent, UpdateListener,
};
pub use library::LibraryInfo;
pub use registry::{CallbackRegistry, Registration, RegistryKey};
pub use result_code::{check_return_code, is_busy_code, CodeCategory, ResultCode};
pub use stats::{BridgeStats, StatsSnapshot};
pub use trampoline::{
    AbiDescriptor, AbiValue, CallbackMethod, CallbackTarget, NativeType, Trampoline,
    TrampolineArena, TrampolineFactory, TrampolineShape,
};
pub use types::{ColumnMetadata, UpdateKind, ValueType};

/// Raw engine bindings.
pub use libsqlite3_sys as ffi;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
