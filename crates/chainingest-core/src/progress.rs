//! Sync-progress accounting.
//!
//! Monotonic counters and timestamps shared by every processor task.
//! All mutators are atomic increments, so readers never observe a torn
//! update.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Thread-safe sync-progress counters.
#[derive(Debug)]
pub struct SyncProgress {
    blocks_processed: AtomicU64,
    blocks_published: AtomicU64,
    /// Blocks abandoned after the attempt ceiling; the operator's signal
    /// that something is permanently un-indexed.
    blocks_abandoned: AtomicU64,
    tx_count: AtomicU64,
    event_count: AtomicU64,
    /// UNIX seconds; fixed at construction.
    started_at: i64,
    /// UNIX seconds of the most recent processed block.
    last_progress_at: AtomicI64,
}

impl SyncProgress {
    pub fn new() -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            blocks_processed: AtomicU64::new(0),
            blocks_published: AtomicU64::new(0),
            blocks_abandoned: AtomicU64::new(0),
            tx_count: AtomicU64::new(0),
            event_count: AtomicU64::new(0),
            started_at: now,
            last_progress_at: AtomicI64::new(now),
        }
    }

    /// Record a fully processed block and its transaction/event counts.
    pub fn record_block(&self, txs: u64, events: u64) {
        self.blocks_processed.fetch_add(1, Ordering::Relaxed);
        self.tx_count.fetch_add(txs, Ordering::Relaxed);
        self.event_count.fetch_add(events, Ordering::Relaxed);
        self.last_progress_at
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Record a successful block publication.
    pub fn record_published(&self) {
        self.blocks_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a block abandoned after exhausting its attempts.
    pub fn record_abandoned(&self) {
        self.blocks_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blocks_processed(&self) -> u64 {
        self.blocks_processed.load(Ordering::Relaxed)
    }

    /// Consistent-enough view of all counters for reporting.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            blocks_processed: self.blocks_processed.load(Ordering::Relaxed),
            blocks_published: self.blocks_published.load(Ordering::Relaxed),
            blocks_abandoned: self.blocks_abandoned.load(Ordering::Relaxed),
            tx_count: self.tx_count.load(Ordering::Relaxed),
            event_count: self.event_count.load(Ordering::Relaxed),
            started_at: self.started_at,
            last_progress_at: self.last_progress_at.load(Ordering::Relaxed),
        }
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the progress counters.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub blocks_processed: u64,
    pub blocks_published: u64,
    pub blocks_abandoned: u64,
    pub tx_count: u64,
    pub event_count: u64,
    pub started_at: i64,
    pub last_progress_at: i64,
}

impl ProgressSnapshot {
    /// Average processing rate since startup, blocks per second.
    pub fn blocks_per_sec(&self) -> f64 {
        let elapsed = (chrono::Utc::now().timestamp() - self.started_at).max(1);
        self.blocks_processed as f64 / elapsed as f64
    }

    /// Estimated seconds until `target` blocks have been processed, based
    /// on the average rate. `None` while the rate is still zero.
    pub fn eta_secs(&self, target: u64) -> Option<u64> {
        let remaining = target.saturating_sub(self.blocks_processed);
        let rate = self.blocks_per_sec();
        if rate <= 0.0 {
            return None;
        }
        Some((remaining as f64 / rate).ceil() as u64)
    }

    /// Seconds since the last processed block.
    pub fn idle_secs(&self) -> i64 {
        (chrono::Utc::now().timestamp() - self.last_progress_at).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let progress = SyncProgress::new();
        progress.record_block(2, 5);
        progress.record_block(0, 0);
        progress.record_published();

        let snap = progress.snapshot();
        assert_eq!(snap.blocks_processed, 2);
        assert_eq!(snap.blocks_published, 1);
        assert_eq!(snap.tx_count, 2);
        assert_eq!(snap.event_count, 5);
    }

    #[test]
    fn eta_none_before_any_progress() {
        let progress = SyncProgress::new();
        assert!(progress.snapshot().eta_secs(1_000).is_none());
    }

    #[test]
    fn eta_zero_when_caught_up() {
        let progress = SyncProgress::new();
        for _ in 0..10 {
            progress.record_block(0, 0);
        }
        let eta = progress.snapshot().eta_secs(5).unwrap();
        assert_eq!(eta, 0);
    }

    #[test]
    fn concurrent_increments_do_not_tear() {
        let progress = std::sync::Arc::new(SyncProgress::new());
        let mut handles = vec![];
        for _ in 0..8 {
            let p = progress.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1_000 {
                    p.record_block(1, 2);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let snap = progress.snapshot();
        assert_eq!(snap.blocks_processed, 8_000);
        assert_eq!(snap.tx_count, 8_000);
        assert_eq!(snap.event_count, 16_000);
    }
}
