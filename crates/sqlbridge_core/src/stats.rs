//! Bridge statistics.
//!
//! Counters for the calls that cross the native boundary, readable while
//! operations are in progress.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-connection call counters.
#[derive(Debug, Default)]
pub struct BridgeStats {
    statements_prepared: AtomicU64,
    statements_finalized: AtomicU64,
    steps: AtomicU64,
    exec_calls: AtomicU64,
    callbacks_invoked: AtomicU64,
    callback_failures: AtomicU64,
    transfers: AtomicU64,
    transfer_busy_retries: AtomicU64,
    native_errors: AtomicU64,
}

impl BridgeStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_prepare(&self) {
        self.statements_prepared.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finalize(&self) {
        self.statements_finalized.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_step(&self) {
        self.steps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exec(&self) {
        self.exec_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_callback(&self) {
        self.callbacks_invoked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_callback_failure(&self) {
        self.callback_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transfer(&self) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_busy_retry(&self) {
        self.transfer_busy_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_native_error(&self) {
        self.native_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of statements prepared.
    pub fn statements_prepared(&self) -> u64 {
        self.statements_prepared.load(Ordering::Relaxed)
    }

    /// Returns the number of statements finalized.
    pub fn statements_finalized(&self) -> u64 {
        self.statements_finalized.load(Ordering::Relaxed)
    }

    /// Returns the number of `step` calls.
    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    /// Returns the number of `exec` calls.
    pub fn exec_calls(&self) -> u64 {
        self.exec_calls.load(Ordering::Relaxed)
    }

    /// Returns the number of callbacks the engine invoked.
    pub fn callbacks_invoked(&self) -> u64 {
        self.callbacks_invoked.load(Ordering::Relaxed)
    }

    /// Returns the number of callbacks that failed or panicked.
    pub fn callback_failures(&self) -> u64 {
        self.callback_failures.load(Ordering::Relaxed)
    }

    /// Returns the number of backup/restore runs.
    pub fn transfers(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }

    /// Returns the number of busy retries across all transfers.
    pub fn transfer_busy_retries(&self) -> u64 {
        self.transfer_busy_retries.load(Ordering::Relaxed)
    }

    /// Returns the number of calls that failed with a native error.
    pub fn native_errors(&self) -> u64 {
        self.native_errors.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            statements_prepared: self.statements_prepared(),
            statements_finalized: self.statements_finalized(),
            steps: self.steps(),
            exec_calls: self.exec_calls(),
            callbacks_invoked: self.callbacks_invoked(),
            callback_failures: self.callback_failures(),
            transfers: self.transfers(),
            transfer_busy_retries: self.transfer_busy_retries(),
            native_errors: self.native_errors(),
        }
    }
}

/// A point-in-time copy of [`BridgeStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Statements prepared.
    pub statements_prepared: u64,
    /// Statements finalized.
    pub statements_finalized: u64,
    /// `step` calls.
    pub steps: u64,
    /// `exec` calls.
    pub exec_calls: u64,
    /// Callbacks invoked by the engine.
    pub callbacks_invoked: u64,
    /// Callbacks that failed or panicked.
    pub callback_failures: u64,
    /// Backup and restore runs.
    pub transfers: u64,
    /// Busy retries during transfers.
    pub transfer_busy_retries: u64,
    /// Native errors surfaced to the caller.
    pub native_errors: u64,
}

impl StatsSnapshot {
    /// Statements prepared but not yet finalized.
    pub fn open_statements(&self) -> u64 {
        self.statements_prepared
            .saturating_sub(self.statements_finalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = BridgeStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn snapshot_reflects_records() {
        let stats = BridgeStats::new();
        stats.record_prepare();
        stats.record_prepare();
        stats.record_finalize();
        stats.record_step();
        stats.record_callback();
        stats.record_callback_failure();
        stats.record_busy_retry();

        let snap = stats.snapshot();
        assert_eq!(snap.statements_prepared, 2);
        assert_eq!(snap.open_statements(), 1);
        assert_eq!(snap.steps, 1);
        assert_eq!(snap.callbacks_invoked, 1);
        assert_eq!(snap.callback_failures, 1);
        assert_eq!(snap.transfer_busy_retries, 1);
        assert_eq!(snap.transfers, 0);
    }
}
