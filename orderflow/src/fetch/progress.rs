//! Throttled progress reporting for batch fetches.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callback receiving `(done, total, label)`.
pub type BatchProgressCallback = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

/// Snapshot of a batch in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Keys finished so far.
    pub done: usize,
    /// Total keys in the batch.
    pub total: usize,
    /// Keys served from the cache.
    pub cache_hits: usize,
    /// Keys that fell back to the default shape.
    pub defaults: usize,
}

impl BatchProgress {
    /// Creates a tracker for `total` keys.
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// Completion percentage.
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.done as f64 / self.total as f64) * 100.0
        }
    }

    /// Whether every key is done.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.done >= self.total
    }
}

/// Rate limiter for the batch progress callback.
///
/// Fires on the first call, then at most once per interval, and always
/// for the final update.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    /// Creates a throttle.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    /// Returns true if an update should be delivered now.
    pub fn should_emit(&mut self, is_final: bool) -> bool {
        let now = Instant::now();
        let due = match self.last_emit {
            None => true,
            Some(at) => is_final || now.duration_since(at) >= self.interval,
        };
        if due {
            self.last_emit = Some(now);
        }
        due
    }
}
