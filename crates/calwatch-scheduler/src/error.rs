//! Error types for the scheduler.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur when building scheduler inputs.
///
/// Scheduler operations themselves never fail; late, elapsed and deferred
/// edges are reported as [`Diagnostic`](crate::Diagnostic) values instead.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Interval ends before it starts.
    #[error("invalid interval {id}: end {end} is before start {start}")]
    InvalidInterval {
        id: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// Invalid scheduler configuration.
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    /// A tokio-backed clock was requested outside of a runtime.
    #[error("no tokio runtime available for timer scheduling")]
    NoRuntime,
}
