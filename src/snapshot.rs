//! Periodic count snapshots.
//!
//! Each worker owns a `PersistenceScheduler` driven off the monotonic clock: the first
//! poll at or after each interval boundary fires exactly once. Boundaries that pass while
//! no frame is processed are skipped rather than replayed.

use serde::Serialize;
use std::time::{Duration, Instant};

use crate::CameraId;

/// Counts for one camera at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountSnapshot {
    pub camera_id: CameraId,
    pub current_count: u32,
    pub total_unique: u32,
    /// Unix seconds.
    pub timestamp: u64,
}

pub struct PersistenceScheduler {
    interval: Duration,
    next_due: Instant,
}

impl PersistenceScheduler {
    pub fn new(interval: Duration, started_at: Instant) -> Self {
        Self {
            interval,
            next_due: started_at + interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True when `now` has crossed the next boundary. Advances past every boundary
    /// already behind `now`.
    pub fn poll(&mut self, now: Instant) -> bool {
        if now < self.next_due || self.interval.is_zero() {
            return false;
        }
        while self.next_due <= now {
            self.next_due += self.interval;
        }
        true
    }
}
