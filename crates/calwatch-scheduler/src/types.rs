//! Scheduler types.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Opaque identifier of an interval, as supplied by the data provider.
///
/// Ids are for reporting only. Two intervals sharing an id are still
/// tracked as distinct entities by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntervalId(String);

impl IntervalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IntervalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IntervalId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for IntervalId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One calendar event occurrence.
///
/// Immutable once built; `start <= end` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawInterval")]
pub struct Interval {
    id: IntervalId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    metadata: serde_json::Value,
}

/// Wire shape of an interval before validation.
#[derive(Deserialize)]
struct RawInterval {
    id: IntervalId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    #[serde(default)]
    metadata: serde_json::Value,
}

impl TryFrom<RawInterval> for Interval {
    type Error = SchedulerError;

    fn try_from(raw: RawInterval) -> Result<Self, Self::Error> {
        Interval::new(raw.id, raw.start, raw.end).map(|i| i.with_metadata(raw.metadata))
    }
}

impl Interval {
    /// Create an interval with empty metadata.
    pub fn new(
        id: impl Into<IntervalId>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self, SchedulerError> {
        let id = id.into();
        if end < start {
            return Err(SchedulerError::InvalidInterval {
                id: id.to_string(),
                start,
                end,
            });
        }

        Ok(Self {
            id,
            start,
            end,
            metadata: serde_json::Value::Null,
        })
    }

    /// Attach an opaque metadata payload.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn id(&self) -> &IntervalId {
        &self.id
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn metadata(&self) -> &serde_json::Value {
        &self.metadata
    }

    /// Instant of the given edge.
    pub fn edge_at(&self, edge: Edge) -> DateTime<Utc> {
        match edge {
            Edge::Start => self.start,
            Edge::End => self.end,
        }
    }

    /// Half-open containment: `start <= instant < end`.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

/// Boundary of an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Start,
    End,
}

impl Edge {
    /// Notification direction produced when this edge fires.
    pub fn direction(self) -> Direction {
        match self {
            Edge::Start => Direction::Enter,
            Edge::End => Direction::Exit,
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Start => f.write_str("start"),
            Edge::End => f.write_str("end"),
        }
    }
}

/// Direction of a transition notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Enter,
    Exit,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Enter => f.write_str("enter"),
            Direction::Exit => f.write_str("exit"),
        }
    }
}

/// Notification delivered when an armed edge fires.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub direction: Direction,
    pub edge: Edge,
    pub interval: Interval,
    /// Occupancy over the whole live interval set right after the edge.
    pub occupancy_after: bool,
    /// Nominal boundary instant.
    pub boundary: DateTime<Utc>,
    /// Clock time when the timer actually fired.
    pub fired_at: DateTime<Utc>,
    /// Arming generation the timer belonged to.
    pub generation: u64,
}

/// The next edge after some instant, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NextTransition {
    pub at: DateTime<Utc>,
    pub edge: Edge,
    pub interval_id: IntervalId,
}

/// Read-only view of one armed timer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PendingTimer {
    pub fires_at: DateTime<Utc>,
    pub boundary: DateTime<Utc>,
    pub slot: usize,
    pub edge: Edge,
    pub interval_id: IntervalId,
}

/// Outcome of one arming pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmSummary {
    pub generation: u64,
    /// Clock reading the pass was computed against.
    pub armed_at: DateTime<Utc>,
    /// Occupancy at `armed_at`.
    pub occupied: bool,
    pub intervals: usize,
    pub armed: usize,
    pub deferred: usize,
    pub dropped: usize,
    pub next: Option<NextTransition>,
    pub resync_at: DateTime<Utc>,
}

/// Recoverable conditions observed while arming or firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// The whole interval had already ended; nothing was armed for it.
    ElapsedIntervalDropped {
        interval_id: IntervalId,
        end: DateTime<Utc>,
    },
    /// Edge lies beyond the horizon and waits for a later resync.
    EdgeDeferred {
        interval_id: IntervalId,
        edge: Edge,
        at: DateTime<Utc>,
    },
    /// Edge target was already past when scheduled; fired immediately.
    LateEdge {
        interval_id: IntervalId,
        edge: Edge,
        late_by: Duration,
    },
    /// Arming was requested after shutdown and ignored.
    ArmAfterShutdown,
}
