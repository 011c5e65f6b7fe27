//! Retry and backoff policies for the consumed-stream pipeline.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::constants::{RESTART_BACKOFF_JITTER, RESTART_BACKOFF_MAX, RESTART_BACKOFF_MIN};

/// Policy for offset commits.
///
/// Short delays and few attempts: a commit that keeps failing is a pipeline
/// failure and the restart supervisor takes over from there.
pub fn commit_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(3)
        .with_jitter()
}

/// Bounded exponential backoff for consumer restarts.
///
/// Doubles from the minimum up to the cap, with +/- 10% jitter so restarts
/// across a fleet do not synchronize. Resets to the minimum after a
/// successful run.
#[derive(Debug)]
pub struct RestartBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
    jitter: f64,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self::new(RESTART_BACKOFF_MIN, RESTART_BACKOFF_MAX, RESTART_BACKOFF_JITTER)
    }
}

impl RestartBackoff {
    pub fn new(min: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            current: min,
            min,
            max,
            jitter,
        }
    }

    /// Delay to wait before the next restart attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        with_jitter(base, self.jitter)
    }

    /// Reset after a healthy run.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Apply +/- `jitter` fractional jitter to a base duration.
fn with_jitter(base: Duration, jitter: f64) -> Duration {
    let factor = 1.0 - jitter + fastrand::f64() * (2.0 * jitter);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}
