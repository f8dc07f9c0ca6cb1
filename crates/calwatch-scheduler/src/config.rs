//! Scheduler configuration.

use chrono::Duration;

use crate::SchedulerError;

/// Delay added after every nominal boundary before its timer fires, so the
/// occupancy check lands on the far side of the boundary.
pub const FIRE_GRACE: Duration = Duration::milliseconds(500);

/// Default lookahead horizon (one day).
pub const DEFAULT_HORIZON: Duration = Duration::days(1);

/// Configuration for a [`HorizonScheduler`](crate::HorizonScheduler).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// How far ahead edges are pre-armed. Resync runs every `horizon / 2`.
    pub horizon: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            horizon: DEFAULT_HORIZON,
        }
    }
}

impl SchedulerConfig {
    pub fn with_horizon(mut self, horizon: Duration) -> Self {
        self.horizon = horizon;
        self
    }

    /// Cadence of the standing resync deadline.
    pub fn resync_interval(&self) -> Duration {
        self.horizon / 2
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.horizon <= Duration::zero() {
            return Err(SchedulerError::InvalidConfig(format!(
                "horizon must be positive, got {}s",
                self.horizon.num_seconds()
            )));
        }
        if self.resync_interval() <= Duration::zero() {
            return Err(SchedulerError::InvalidConfig(
                "horizon too small to derive a resync interval".to_string(),
            ));
        }
        Ok(())
    }
}
