//! Coordinator statistics.
//!
//! Counters are atomic and can be read while pages are moving.
//!
//! ```rust,ignore
//! let stats = coordinator.stats().snapshot();
//! println!("encrypted writes: {}", stats.pages_encrypted);
//! println!("slow-path reads:  {}", stats.slow_path_reads);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Encryption coordinator statistics.
#[derive(Debug, Default)]
pub struct CryptStats {
    pages_read: AtomicU64,
    pages_written: AtomicU64,
    /// Pages encrypted on the way to the store.
    pages_encrypted: AtomicU64,
    /// Pages decrypted on the way from the store.
    pages_decrypted: AtomicU64,
    slow_path_reads: AtomicU64,
    slow_path_writes: AtomicU64,
    /// Header re-reads caused by remote notifications.
    resyncs: AtomicU64,
    notifications: AtomicU64,
    checkpoints: AtomicU64,
    transitions: AtomicU64,
    errors: AtomicU64,
}

impl CryptStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read(&self, decrypted: bool) {
        self.pages_read.fetch_add(1, Ordering::Relaxed);
        if decrypted {
            self.pages_decrypted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_write(&self, encrypted: bool) {
        self.pages_written.fetch_add(1, Ordering::Relaxed);
        if encrypted {
            self.pages_encrypted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_slow_read(&self) {
        self.slow_path_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_slow_write(&self) {
        self.slow_path_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_notification(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transition(&self) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pages_read: self.pages_read.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            pages_encrypted: self.pages_encrypted.load(Ordering::Relaxed),
            pages_decrypted: self.pages_decrypted.load(Ordering::Relaxed),
            slow_path_reads: self.slow_path_reads.load(Ordering::Relaxed),
            slow_path_writes: self.slow_path_writes.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`CryptStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Pages read through the intercept.
    pub pages_read: u64,
    /// Pages written through the intercept.
    pub pages_written: u64,
    /// Pages encrypted on write.
    pub pages_encrypted: u64,
    /// Pages decrypted on read.
    pub pages_decrypted: u64,
    /// Reads that took the slow path.
    pub slow_path_reads: u64,
    /// Writes that took the slow path.
    pub slow_path_writes: u64,
    /// Full header resyncs.
    pub resyncs: u64,
    /// Remote notifications received.
    pub notifications: u64,
    /// Sweep checkpoints persisted.
    pub checkpoints: u64,
    /// Committed transitions.
    pub transitions: u64,
    /// Failed page operations.
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = CryptStats::new();
        stats.record_read(true);
        stats.record_read(false);
        stats.record_write(true);
        stats.record_slow_read();
        stats.record_checkpoint();

        let snap = stats.snapshot();
        assert_eq!(snap.pages_read, 2);
        assert_eq!(snap.pages_decrypted, 1);
        assert_eq!(snap.pages_written, 1);
        assert_eq!(snap.pages_encrypted, 1);
        assert_eq!(snap.slow_path_reads, 1);
        assert_eq!(snap.checkpoints, 1);
        assert_eq!(snap.resyncs, 0);
    }
}
