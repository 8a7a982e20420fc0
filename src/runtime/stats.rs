//! Process-wide connection counters.
//!
//! Shared by all workers; every update is a single atomic operation.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ConnStats {
    number: AtomicU64,
    accepted: AtomicU64,
    handled: AtomicU64,
    active: AtomicU64,
    reading: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub handled: u64,
    pub active: u64,
    pub reading: u64,
}

impl ConnStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next connection number, starting at 1.
    pub fn next_number(&self) -> u64 {
        self.number.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// A connection object was created for an accepted socket.
    pub fn opened(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    pub fn started_reading(&self) {
        self.reading.fetch_add(1, Ordering::AcqRel);
    }

    pub fn closed(&self, was_reading: bool) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        if was_reading {
            self.reading.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Acquire),
            reading: self.reading.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ConnStats::new();
        assert_eq!(stats.next_number(), 1);
        assert_eq!(stats.next_number(), 2);

        stats.accepted();
        stats.opened();
        stats.started_reading();
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                accepted: 1,
                handled: 1,
                active: 1,
                reading: 1
            }
        );

        stats.closed(true);
        let snap = stats.snapshot();
        assert_eq!(snap.active, 0);
        assert_eq!(snap.reading, 0);
        assert_eq!(snap.handled, 1);
    }
}
