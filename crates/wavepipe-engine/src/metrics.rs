use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time copy of a stream's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub xruns: u64,
    pub suspends: u64,
    pub recoveries: u64,
    pub fatal_errors: u64,
    pub transfer_failures: u64,
    pub bytes_transferred: u64,
    pub buffers_completed: u64,
}

/// Counters updated by the engine thread and read from any thread.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    xruns: AtomicU64,
    suspends: AtomicU64,
    recoveries: AtomicU64,
    fatal_errors: AtomicU64,
    transfer_failures: AtomicU64,
    bytes_transferred: AtomicU64,
    buffers_completed: AtomicU64,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn register_xrun(&self) {
        self.xruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn register_suspend(&self) {
        self.suspends.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn register_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn register_fatal(&self) {
        self.fatal_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn register_transfer_failure(&self) {
        self.transfer_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_transferred
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_completed(&self) {
        self.buffers_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            xruns: self.xruns.load(Ordering::Relaxed),
            suspends: self.suspends.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
            transfer_failures: self.transfer_failures.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            buffers_completed: self.buffers_completed.load(Ordering::Relaxed),
        }
    }
}
