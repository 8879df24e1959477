//! In-memory replication counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Live counters for one worker, shared across threads by reference.
///
/// Counters are monotone for the lifetime of the worker; durable totals live
/// in the checkpoint files, not here.
#[derive(Default)]
pub struct ReplicationStats {
    synced: AtomicU64,
    updated: AtomicU64,
    deleted: AtomicU64,
    verification_failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl ReplicationStats {
    pub fn new() -> ReplicationStats {
        ReplicationStats::default()
    }

    pub fn add_synced(&self, n: u64) {
        self.synced.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_updated(&self, n: u64) {
        self.updated.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_deleted(&self, n: u64) {
        self.deleted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_verification_failures(&self, n: u64) {
        self.verification_failures.fetch_add(n, Ordering::Relaxed);
    }

    pub fn synced(&self) -> u64 {
        self.synced.load(Ordering::Relaxed)
    }

    pub fn updated(&self) -> u64 {
        self.updated.load(Ordering::Relaxed)
    }

    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    pub fn verification_failures(&self) -> u64 {
        self.verification_failures.load(Ordering::Relaxed)
    }

    /// Record the most recent worker-level error, or give up if the lock has
    /// been poisoned.
    pub fn record_error(&self, error: &str) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.to_owned());
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|last| last.clone())
    }
}
