//! Transition sink that logs and emits JSON lines.

use std::io::Write;
use std::sync::Mutex;

use serde_json::json;
use tracing::{debug, info, warn};

use calwatch_scheduler::{ArmSummary, Diagnostic, Transition, TransitionSink};

use crate::status::status_line;

/// Writes one JSON object per transition to `writer`, plus a state line
/// after every arming pass so readers that start mid-event know where they
/// stand.
///
/// `output` names the port a two-output trigger would route the message to.
pub struct LogSink<W: Write + Send + 'static> {
    writer: Mutex<W>,
}

impl<W: Write + Send + 'static> LogSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_writer(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_line(&self, message: &serde_json::Value) {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writeln!(writer, "{}", message).and_then(|_| writer.flush()) {
            warn!(error = %e, "failed to write message");
        }
    }
}

fn output_port(in_event: bool) -> &'static str {
    if in_event { "in_event" } else { "not_in_event" }
}

/// JSON payload for one transition.
pub fn transition_message(transition: &Transition) -> serde_json::Value {
    json!({
        "in_event": transition.occupancy_after,
        "edge": transition.direction,
        "interval": transition.interval,
        "output": output_port(transition.occupancy_after),
    })
}

/// JSON payload for the occupancy state after an arming pass.
pub fn state_message(summary: &ArmSummary) -> serde_json::Value {
    json!({
        "in_event": summary.occupied,
        "events": summary.intervals,
        "next": summary.next,
        "output": output_port(summary.occupied),
    })
}

impl<W: Write + Send + 'static> TransitionSink for LogSink<W> {
    fn on_transition(&self, transition: &Transition) {
        info!(
            interval = %transition.interval.id(),
            direction = %transition.direction,
            in_event = transition.occupancy_after,
            boundary = %transition.boundary,
            "transition"
        );

        self.write_line(&transition_message(transition));
    }

    fn on_rearmed(&self, summary: &ArmSummary) {
        info!(
            generation = summary.generation,
            "{}",
            status_line(
                summary.intervals,
                summary.occupied,
                summary.next.as_ref(),
                summary.armed_at
            )
        );

        self.write_line(&state_message(summary));
    }

    fn on_diagnostic(&self, diagnostic: &Diagnostic) {
        match diagnostic {
            Diagnostic::LateEdge {
                interval_id,
                edge,
                late_by,
            } => warn!(
                interval = %interval_id,
                %edge,
                late_ms = late_by.num_milliseconds(),
                "edge fired late"
            ),
            Diagnostic::ArmAfterShutdown => warn!("arm requested after shutdown"),
            Diagnostic::ElapsedIntervalDropped { interval_id, end } => {
                debug!(interval = %interval_id, %end, "interval already over")
            }
            Diagnostic::EdgeDeferred {
                interval_id,
                edge,
                at,
            } => debug!(interval = %interval_id, %edge, %at, "edge beyond horizon"),
        }
    }
}
