//! Shared helpers for scheduler integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use calwatch_scheduler::{
    ArmSummary, Diagnostic, Direction, HorizonScheduler, Interval, ManualClock, SchedulerConfig,
    Transition, TransitionSink,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

/// Fixed starting instant for simulated clocks.
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

/// Instant `secs` seconds after the epoch.
pub fn at(secs: i64) -> DateTime<Utc> {
    epoch() + Duration::seconds(secs)
}

/// Instant `ms` milliseconds after the epoch.
pub fn at_ms(ms: i64) -> DateTime<Utc> {
    epoch() + Duration::milliseconds(ms)
}

pub fn interval(id: &str, start: i64, end: i64) -> Interval {
    Interval::new(id, at(start), at(end)).unwrap()
}

/// Sink that records everything it is handed.
#[derive(Default)]
pub struct RecordingSink {
    transitions: Mutex<Vec<Transition>>,
    summaries: Mutex<Vec<ArmSummary>>,
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl RecordingSink {
    pub fn transitions(&self) -> Vec<Transition> {
        self.transitions.lock().unwrap().clone()
    }

    /// `(interval id, direction)` pairs in delivery order.
    pub fn events(&self) -> Vec<(String, Direction)> {
        self.transitions
            .lock()
            .unwrap()
            .iter()
            .map(|t| (t.interval.id().to_string(), t.direction))
            .collect()
    }

    pub fn count(&self, id: &str, direction: Direction) -> usize {
        self.events()
            .iter()
            .filter(|(i, d)| i == id && *d == direction)
            .count()
    }

    pub fn summaries(&self) -> Vec<ArmSummary> {
        self.summaries.lock().unwrap().clone()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().unwrap().clone()
    }
}

impl TransitionSink for RecordingSink {
    fn on_transition(&self, transition: &Transition) {
        self.transitions.lock().unwrap().push(transition.clone());
    }

    fn on_rearmed(&self, summary: &ArmSummary) {
        self.summaries.lock().unwrap().push(summary.clone());
    }

    fn on_diagnostic(&self, diagnostic: &Diagnostic) {
        self.diagnostics.lock().unwrap().push(diagnostic.clone());
    }
}

/// Scheduler on a manual clock at the epoch with a recording sink.
pub fn harness(
    config: SchedulerConfig,
) -> (ManualClock, Arc<RecordingSink>, HorizonScheduler<ManualClock>) {
    let clock = ManualClock::new(epoch());
    let sink = Arc::new(RecordingSink::default());
    let scheduler = HorizonScheduler::new(clock.clone(), sink.clone(), config).unwrap();
    (clock, sink, scheduler)
}
