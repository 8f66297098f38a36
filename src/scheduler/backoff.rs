//! Front-loaded polling schedule used while waiting on a job group.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Warm-up delays in seconds: short first, to catch fast jobs cheaply.
const DEFAULT_WARMUP_SECS: [u64; 9] = [2, 2, 2, 5, 5, 5, 10, 10, 10];

/// Delay between polls once the warm-up delays are used up.
const DEFAULT_STEADY_SECS: u64 = 15;

/// Ordered sequence of sleep intervals followed by an unbounded steady poll.
///
/// There is no timeout: jobs may legitimately sit in a queue for days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffSchedule {
    warmup: Vec<Duration>,
    steady: Duration,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            warmup: DEFAULT_WARMUP_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            steady: Duration::from_secs(DEFAULT_STEADY_SECS),
        }
    }
}

impl BackoffSchedule {
    /// Creates a schedule from explicit warm-up delays and a steady interval.
    pub fn new(warmup: Vec<Duration>, steady: Duration) -> Self {
        Self { warmup, steady }
    }

    /// Creates a schedule that always waits `interval`.
    pub fn constant(interval: Duration) -> Self {
        Self::new(Vec::new(), interval)
    }

    pub fn warmup(&self) -> &[Duration] {
        &self.warmup
    }

    pub fn steady(&self) -> Duration {
        self.steady
    }

    /// Returns the never-ending sequence of delays to sleep before each poll.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        self.warmup
            .iter()
            .copied()
            .chain(std::iter::repeat(self.steady))
    }
}
