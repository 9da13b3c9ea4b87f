//! Run counters and progress snapshots
//!
//! Every pool shares one [`RunStats`]; the progress thread turns it into
//! [`RunProgress`] snapshots for display.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Shared counters for a dump, import or purge run
#[derive(Debug, Default)]
pub struct RunStats {
    /// Leaves discovered, entries produced, or purge tasks seeded
    pub found: AtomicU64,

    /// Items handled successfully
    pub processed: AtomicU64,

    /// Items that failed (after retries)
    pub failed: AtomicU64,

    /// Items dropped without remote I/O (misses, protected, cancelled)
    pub skipped: AtomicU64,

    /// Items excluded by ignore rules
    pub ignored: AtomicU64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_found(&self, n: u64) {
        self.found.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot for display
    pub fn snapshot(&self, queue_len: usize, workers: usize, elapsed: Duration) -> RunProgress {
        RunProgress {
            found: self.found.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            queue_len,
            workers,
            elapsed,
        }
    }
}

/// Point-in-time view of a run
#[derive(Debug, Clone, Default)]
pub struct RunProgress {
    pub found: u64,
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub ignored: u64,
    pub queue_len: usize,
    pub workers: usize,
    pub elapsed: Duration,
}

impl RunProgress {
    /// Processed items per second
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = RunStats::new();
        stats.add_found(3);
        stats.inc_processed();
        stats.inc_processed();
        stats.inc_failed();

        let progress = stats.snapshot(5, 4, Duration::from_secs(2));
        assert_eq!(progress.found, 3);
        assert_eq!(progress.processed, 2);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.queue_len, 5);
        assert!((progress.rate() - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_rate_zero_elapsed() {
        assert_eq!(RunProgress::default().rate(), 0.0);
    }
}
