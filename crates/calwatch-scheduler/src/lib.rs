//! Horizon-bounded interval scheduler for calwatch.
//!
//! This crate turns a flat list of calendar intervals into live timers:
//! - Emits enter/exit notifications at interval boundaries
//! - Pre-arms only edges inside a lookahead horizon, re-arming every half horizon
//! - Rebuilds the whole timer set whenever the provider publishes a new list
//! - Answers "am I inside an event right now" with half-open `[start, end)` semantics

mod clock;
mod config;
mod error;
mod feed;
pub mod occupancy;
mod scheduler;
mod sink;
mod types;

pub use clock::{Clock, ManualClock, TimerCallback, TimerHandle, TokioClock};
pub use config::{DEFAULT_HORIZON, FIRE_GRACE, SchedulerConfig};
pub use error::SchedulerError;
pub use feed::{IntervalFeed, IntervalSnapshot};
pub use scheduler::HorizonScheduler;
pub use sink::TransitionSink;
pub use types::{
    ArmSummary, Diagnostic, Direction, Edge, Interval, IntervalId, NextTransition, PendingTimer,
    Transition,
};
