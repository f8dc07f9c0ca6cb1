//! Human-readable status text.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use calwatch_scheduler::{Edge, Interval, NextTransition, occupancy};

/// Render a countdown like `1d 2h 3m 4s`, skipping zero components.
///
/// Returns an empty string for zero or negative durations.
pub fn format_countdown(remaining: Duration) -> String {
    let total = remaining.num_seconds();
    if total <= 0 {
        return String::new();
    }

    let days = total / 86_400;
    let hours = total % 86_400 / 3_600;
    let minutes = total % 3_600 / 60;
    let seconds = total % 60;

    [(days, "d"), (hours, "h"), (minutes, "m"), (seconds, "s")]
        .iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{}{}", value, unit))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Status line shown after every arming pass.
pub fn status_line(
    events: usize,
    in_event: bool,
    next: Option<&NextTransition>,
    now: DateTime<Utc>,
) -> String {
    let head = format!("{} events, in event {}", events, in_event);
    match next {
        Some(next) => {
            let what = match next.edge {
                Edge::Start => "starts",
                Edge::End => "ends",
            };
            format!(
                "{}, next check at {} [{}] ({} {})",
                head,
                next.at.format("%Y-%m-%d %H:%M:%S UTC"),
                format_countdown(next.at - now),
                next.interval_id,
                what
            )
        }
        None => format!("{}, no upcoming transitions", head),
    }
}

/// One-shot occupancy report for `intervals` at `now`.
pub fn snapshot(intervals: &[Interval], now: DateTime<Utc>) -> serde_json::Value {
    let covering: Vec<&str> = occupancy::covering(intervals, now)
        .map(|i| i.id().as_str())
        .collect();
    let in_event = !covering.is_empty();
    let next = occupancy::next_edge(intervals, now);

    json!({
        "in_event": in_event,
        "events": intervals.len(),
        "covering": covering,
        "next": next,
        "status": status_line(intervals.len(), in_event, next.as_ref(), now),
    })
}
