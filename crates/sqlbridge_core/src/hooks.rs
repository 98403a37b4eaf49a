//! Connection-level handlers and hooks.
//!
//! The public traits here are what callers implement. Each one is wrapped
//! in an adapter implementing [`CallbackTarget`] so the trampoline factory
//! can bind it. Handlers have no result slot, so their failures are logged
//! and mapped to a fixed return value instead.

use crate::error::BridgeResult;
use crate::stats::BridgeStats;
use crate::trampoline::{AbiValue, CallbackMethod, CallbackTarget, TrampolineShape};
use crate::types::UpdateKind;
use std::cmp::Ordering;
use std::ffi::{c_char, CStr};
use std::sync::Arc;
use tracing::warn;

/// Decides whether to keep waiting on a locked database.
pub trait BusyHandler: Send + Sync {
    /// Called with the number of prior invocations for the same lock
    /// event. Return `true` to retry, `false` to give up with `Busy`.
    fn on_busy(&self, attempts: i32) -> BridgeResult<bool>;
}

impl<F> BusyHandler for F
where
    F: Fn(i32) -> BridgeResult<bool> + Send + Sync,
{
    fn on_busy(&self, attempts: i32) -> BridgeResult<bool> {
        self(attempts)
    }
}

/// Periodic callback during long-running statements.
pub trait ProgressHandler: Send + Sync {
    /// Return `true` to interrupt the running statement.
    fn on_progress(&self) -> BridgeResult<bool>;
}

impl<F> ProgressHandler for F
where
    F: Fn() -> BridgeResult<bool> + Send + Sync,
{
    fn on_progress(&self) -> BridgeResult<bool> {
        self()
    }
}

/// Transaction outcome notifications.
pub trait CommitListener: Send + Sync {
    /// A transaction is about to commit.
    fn on_commit(&self);

    /// A transaction was rolled back.
    fn on_rollback(&self);
}

/// A row change seen by the update hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEvent {
    /// Kind of change.
    pub kind: UpdateKind,
    /// Schema name (`main`, `temp`, or an attached name).
    pub database: String,
    /// Table name.
    pub table: String,
    /// Rowid of the affected row.
    pub row_id: i64,
}

/// Row change notifications.
pub trait UpdateListener: Send + Sync {
    /// Called for every inserted, updated or deleted rowid-table row.
    fn on_update(&self, event: &UpdateEvent);
}

impl<F> UpdateListener for F
where
    F: Fn(&UpdateEvent) + Send + Sync,
{
    fn on_update(&self, event: &UpdateEvent) {
        self(event);
    }
}

/// Comparison function behind a named collation.
pub type Comparator = dyn Fn(&str, &str) -> Ordering + Send + Sync;

fn descriptor_method(name: &'static str, shape: TrampolineShape) -> CallbackMethod {
    CallbackMethod {
        name,
        signature: shape.descriptor(),
    }
}

pub(crate) const BUSY_METHOD: &str = "busy";
pub(crate) const PROGRESS_METHOD: &str = "progress";
pub(crate) const COMMIT_METHOD: &str = "commit";
pub(crate) const ROLLBACK_METHOD: &str = "rollback";
pub(crate) const UPDATE_METHOD: &str = "update";
pub(crate) const COMPARE_METHOD: &str = "compare";

pub(crate) struct BusyAdapter {
    handler: Box<dyn BusyHandler>,
    stats: Arc<BridgeStats>,
}

impl BusyAdapter {
    pub(crate) fn new(handler: Box<dyn BusyHandler>, stats: Arc<BridgeStats>) -> Self {
        Self { handler, stats }
    }
}

impl CallbackTarget for BusyAdapter {
    fn callback_methods(&self) -> Vec<CallbackMethod> {
        vec![descriptor_method(BUSY_METHOD, TrampolineShape::Busy)]
    }

    fn invoke(&self, _method: &str, args: &[AbiValue]) -> AbiValue {
        self.stats.record_callback();
        let attempts = args.get(1).and_then(|a| a.as_i32()).unwrap_or_default();
        match self.handler.on_busy(attempts) {
            Ok(retry) => AbiValue::I32(i32::from(retry)),
            Err(e) => {
                self.stats.record_callback_failure();
                warn!(error = %e, attempts, "busy handler failed, giving up");
                AbiValue::I32(0)
            }
        }
    }

    fn target_name(&self) -> &'static str {
        "BusyHandler"
    }
}

pub(crate) struct ProgressAdapter {
    handler: Box<dyn ProgressHandler>,
    stats: Arc<BridgeStats>,
}

impl ProgressAdapter {
    pub(crate) fn new(handler: Box<dyn ProgressHandler>, stats: Arc<BridgeStats>) -> Self {
        Self { handler, stats }
    }
}

impl CallbackTarget for ProgressAdapter {
    fn callback_methods(&self) -> Vec<CallbackMethod> {
        vec![descriptor_method(PROGRESS_METHOD, TrampolineShape::Progress)]
    }

    fn invoke(&self, _method: &str, _args: &[AbiValue]) -> AbiValue {
        self.stats.record_callback();
        match self.handler.on_progress() {
            Ok(interrupt) => AbiValue::I32(i32::from(interrupt)),
            Err(e) => {
                self.stats.record_callback_failure();
                warn!(error = %e, "progress handler failed, interrupting");
                AbiValue::I32(1)
            }
        }
    }

    fn target_name(&self) -> &'static str {
        "ProgressHandler"
    }
}

pub(crate) struct CommitAdapter {
    listener: Box<dyn CommitListener>,
    stats: Arc<BridgeStats>,
}

impl CommitAdapter {
    pub(crate) fn new(listener: Box<dyn CommitListener>, stats: Arc<BridgeStats>) -> Self {
        Self { listener, stats }
    }
}

impl CallbackTarget for CommitAdapter {
    fn callback_methods(&self) -> Vec<CallbackMethod> {
        vec![
            descriptor_method(COMMIT_METHOD, TrampolineShape::Commit),
            descriptor_method(ROLLBACK_METHOD, TrampolineShape::Rollback),
        ]
    }

    fn invoke(&self, method: &str, _args: &[AbiValue]) -> AbiValue {
        self.stats.record_callback();
        if method == COMMIT_METHOD {
            self.listener.on_commit();
            // zero lets the commit proceed
            AbiValue::I32(0)
        } else {
            self.listener.on_rollback();
            AbiValue::Void
        }
    }

    fn target_name(&self) -> &'static str {
        "CommitListener"
    }
}

pub(crate) struct UpdateAdapter {
    listener: Box<dyn UpdateListener>,
    stats: Arc<BridgeStats>,
}

impl UpdateAdapter {
    pub(crate) fn new(listener: Box<dyn UpdateListener>, stats: Arc<BridgeStats>) -> Self {
        Self { listener, stats }
    }
}

/// # Safety
///
/// `address` must be zero or point to a NUL-terminated string valid for the
/// current callback.
unsafe fn c_str_at(address: usize) -> String {
    if address == 0 {
        return String::new();
    }
    CStr::from_ptr(address as *const c_char)
        .to_string_lossy()
        .into_owned()
}

impl CallbackTarget for UpdateAdapter {
    fn callback_methods(&self) -> Vec<CallbackMethod> {
        vec![descriptor_method(UPDATE_METHOD, TrampolineShape::Update)]
    }

    fn invoke(&self, _method: &str, args: &[AbiValue]) -> AbiValue {
        self.stats.record_callback();
        let op = args.get(1).and_then(|a| a.as_i32()).unwrap_or_default();
        let Some(kind) = UpdateKind::from_raw(op) else {
            warn!(op, "update hook called with unknown operation");
            return AbiValue::Void;
        };
        let address = |i: usize| args.get(i).and_then(|a| a.as_address()).unwrap_or_default();
        // SAFETY: both names are engine strings valid for this callback.
        let (database, table) = unsafe { (c_str_at(address(2)), c_str_at(address(3))) };
        let row_id = args.get(4).and_then(|a| a.as_i64()).unwrap_or_default();

        self.listener.on_update(&UpdateEvent {
            kind,
            database,
            table,
            row_id,
        });
        AbiValue::Void
    }

    fn target_name(&self) -> &'static str {
        "UpdateListener"
    }
}

pub(crate) struct CollationAdapter {
    name: String,
    compare: Box<Comparator>,
    stats: Arc<BridgeStats>,
}

impl CollationAdapter {
    pub(crate) fn new(name: String, compare: Box<Comparator>, stats: Arc<BridgeStats>) -> Self {
        Self {
            name,
            compare,
            stats,
        }
    }
}

/// # Safety
///
/// `address` must point to `len` readable bytes, or `len` must be zero.
unsafe fn text_at(address: usize, len: i32) -> String {
    if address == 0 || len <= 0 {
        return String::new();
    }
    let bytes = std::slice::from_raw_parts(address as *const u8, len as usize);
    String::from_utf8_lossy(bytes).into_owned()
}

impl CallbackTarget for CollationAdapter {
    fn callback_methods(&self) -> Vec<CallbackMethod> {
        vec![descriptor_method(COMPARE_METHOD, TrampolineShape::Collation)]
    }

    fn invoke(&self, _method: &str, args: &[AbiValue]) -> AbiValue {
        self.stats.record_callback();
        let int = |i: usize| args.get(i).and_then(|a| a.as_i32()).unwrap_or_default();
        let address = |i: usize| args.get(i).and_then(|a| a.as_address()).unwrap_or_default();
        // SAFETY: the engine passes (len, ptr) pairs valid for this call.
        let (left, right) = unsafe { (text_at(address(2), int(1)), text_at(address(4), int(3))) };

        let order = match (self.compare)(&left, &right) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        };
        AbiValue::I32(order)
    }

    fn target_name(&self) -> &'static str {
        "Collation"
    }
}

impl std::fmt::Debug for CollationAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollationAdapter")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
