//! Horizon scheduler implementation.
//!
//! Turns an interval snapshot into a set of live edge timers. Every arming
//! pass replaces the whole timer set and bumps a generation counter; timer
//! callbacks carry the generation they were armed under and do nothing once
//! it is stale, so cancellation never depends on the timer primitive
//! winning a race against expiry.
//!
//! Notifications go through a single outbox drained by one caller at a
//! time, so the sink sees them in the order timers were processed even when
//! callbacks run on several threads.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use crate::config::FIRE_GRACE;
use crate::occupancy;
use crate::{
    ArmSummary, Clock, Diagnostic, Edge, Interval, NextTransition, PendingTimer,
    SchedulerConfig, SchedulerError, TimerHandle, Transition, TransitionSink,
};

/// Arena key: position in the armed snapshot plus edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TimerKey {
    slot: usize,
    edge: Edge,
}

struct TimerRecord {
    info: PendingTimer,
    interval: Interval,
    handle: TimerHandle,
}

/// What a clock callback should do when it runs.
#[derive(Debug, Clone, Copy)]
enum Wake {
    Edge { generation: u64, key: TimerKey },
    Resync { generation: u64 },
}

/// Work collected under the lock and delivered after it is released.
enum Notice {
    Transition(Transition),
    Rearmed(ArmSummary),
    Diagnostic(Diagnostic),
}

/// Notices waiting for the sink, in the order they were produced.
///
/// Only one caller drains at a time; everyone else just enqueues.
#[derive(Default)]
struct Outbox {
    queue: VecDeque<Notice>,
    draining: bool,
}

/// Releases the drain claim if the sink panics mid-delivery.
struct DrainGuard<'a>(&'a Mutex<Outbox>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .draining = false;
        }
    }
}

struct State {
    intervals: Arc<[Interval]>,
    timers: HashMap<TimerKey, TimerRecord>,
    resync: Option<TimerHandle>,
    resync_at: Option<DateTime<Utc>>,
    generation: u64,
    /// Oldest generation whose queued transitions may still be delivered.
    /// Moves only when a different snapshot is armed.
    live_since: u64,
    shut_down: bool,
}

impl State {
    /// Cancel every edge timer and the resync deadline.
    fn cancel_all(&mut self) {
        for (_, record) in self.timers.drain() {
            record.handle.cancel();
        }
        if let Some(resync) = self.resync.take() {
            resync.cancel();
        }
        self.resync_at = None;
    }
}

struct Shared<C: Clock> {
    clock: C,
    sink: Arc<dyn TransitionSink>,
    config: SchedulerConfig,
    state: Mutex<State>,
    outbox: Mutex<Outbox>,
}

/// Keeps a live set of edge timers for the current interval snapshot.
///
/// Cheap to clone; clones share the same timer set.
pub struct HorizonScheduler<C: Clock> {
    shared: Arc<Shared<C>>,
}

impl<C: Clock> Clone for HorizonScheduler<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Clock> fmt::Debug for HorizonScheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("HorizonScheduler")
            .field("generation", &state.generation)
            .field("intervals", &state.intervals.len())
            .field("timers", &state.timers.len())
            .field("shut_down", &state.shut_down)
            .finish()
    }
}

impl<C: Clock> HorizonScheduler<C> {
    /// Create an idle scheduler. Nothing is armed until [`arm`](Self::arm).
    pub fn new(
        clock: C,
        sink: Arc<dyn TransitionSink>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;

        Ok(Self {
            shared: Arc::new(Shared {
                clock,
                sink,
                config,
                state: Mutex::new(State {
                    intervals: Arc::from(Vec::new()),
                    timers: HashMap::new(),
                    resync: None,
                    resync_at: None,
                    generation: 0,
                    live_since: 0,
                    shut_down: false,
                }),
                outbox: Mutex::new(Outbox::default()),
            }),
        })
    }

    /// Replace the interval set and rebuild every timer from it.
    ///
    /// Returns `None` after [`shutdown`](Self::shutdown).
    pub fn arm(&self, intervals: impl Into<Arc<[Interval]>>) -> Option<ArmSummary> {
        self.shared.arm(Some(intervals.into()), "arm")
    }

    /// Rebuild every timer from the current interval set.
    pub fn resync(&self) -> Option<ArmSummary> {
        self.shared.arm(None, "resync")
    }

    /// Occupancy of the live interval set at the clock's current instant.
    pub fn is_inside_now(&self) -> bool {
        let intervals = self.intervals();
        occupancy::is_occupied(&intervals, self.shared.clock.now())
    }

    /// Earliest edge after now across the live set, armed or not.
    pub fn describe_next_transition(&self) -> Option<NextTransition> {
        let intervals = self.intervals();
        occupancy::next_edge(&intervals, self.shared.clock.now())
    }

    /// Snapshot of the live interval set.
    pub fn intervals(&self) -> Arc<[Interval]> {
        Arc::clone(&self.shared.lock().intervals)
    }

    /// Armed edge timers, ordered by firing time.
    pub fn pending_timers(&self) -> Vec<PendingTimer> {
        let state = self.shared.lock();
        let mut timers: Vec<PendingTimer> =
            state.timers.values().map(|r| r.info.clone()).collect();
        timers.sort();
        timers
    }

    /// When the standing resync deadline is due, if armed.
    pub fn next_resync_at(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().resync_at
    }

    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock().shut_down
    }

    /// Cancel every timer and the resync deadline. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        state.generation += 1;
        let cancelled = state.timers.len();
        state.cancel_all();
        info!(cancelled, "scheduler shut down");
    }
}

impl<C: Clock> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(
        self: &Arc<Self>,
        intervals: Option<Arc<[Interval]>>,
        reason: &'static str,
    ) -> Option<ArmSummary> {
        let summary = {
            let mut state = self.lock();
            let mut notices = Vec::new();
            let summary = if state.shut_down {
                debug!(reason, "ignoring arm request after shutdown");
                notices.push(Notice::Diagnostic(Diagnostic::ArmAfterShutdown));
                None
            } else {
                let intervals = intervals.unwrap_or_else(|| Arc::clone(&state.intervals));
                Some(self.arm_locked(&mut state, intervals, reason, &mut notices))
            };
            self.post(notices);
            summary
        };
        self.drain();
        summary
    }

    fn arm_locked(
        self: &Arc<Self>,
        state: &mut State,
        intervals: Arc<[Interval]>,
        reason: &'static str,
        notices: &mut Vec<Notice>,
    ) -> ArmSummary {
        // Re-arming the same snapshot keeps edges that were armed but have
        // not fired yet, even if their deadline has just passed.
        let same_snapshot = Arc::ptr_eq(&state.intervals, &intervals);
        let carried: HashSet<TimerKey> = if same_snapshot {
            state.timers.keys().copied().collect()
        } else {
            HashSet::new()
        };

        state.cancel_all();
        state.generation += 1;
        state.intervals = Arc::clone(&intervals);
        let generation = state.generation;
        if !same_snapshot {
            state.live_since = generation;
        }

        let now = self.clock.now();
        let limit = now
            .checked_add_signed(self.config.horizon)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let (mut armed, mut deferred, mut dropped) = (0, 0, 0);

        for (slot, interval) in intervals.iter().enumerate() {
            let end_carried = carried.contains(&TimerKey {
                slot,
                edge: Edge::End,
            });
            if is_crossed(interval.end(), now) && !end_carried {
                dropped += 1;
                debug!(interval_id = %interval.id(), end = %interval.end(), "dropping elapsed interval");
                notices.push(Notice::Diagnostic(Diagnostic::ElapsedIntervalDropped {
                    interval_id: interval.id().clone(),
                    end: interval.end(),
                }));
                continue;
            }

            for edge in [Edge::Start, Edge::End] {
                let key = TimerKey { slot, edge };
                let boundary = interval.edge_at(edge);

                // Crossed before this pass, e.g. the start of an interval
                // already in progress at startup.
                if is_crossed(boundary, now) && !carried.contains(&key) {
                    continue;
                }

                // Edges whose firing instant is not representable are
                // treated as beyond any horizon.
                let fires_at = match boundary.checked_add_signed(FIRE_GRACE) {
                    Some(fires_at) if boundary <= limit => fires_at,
                    _ => {
                        deferred += 1;
                        debug!(interval_id = %interval.id(), %edge, at = %boundary, "edge beyond horizon, deferring");
                        notices.push(Notice::Diagnostic(Diagnostic::EdgeDeferred {
                            interval_id: interval.id().clone(),
                            edge,
                            at: boundary,
                        }));
                        continue;
                    }
                };

                let handle = self.schedule(
                    fires_at,
                    Wake::Edge { generation, key },
                    Some((interval, edge)),
                    notices,
                );
                state.timers.insert(
                    key,
                    TimerRecord {
                        info: PendingTimer {
                            fires_at,
                            boundary,
                            slot,
                            edge,
                            interval_id: interval.id().clone(),
                        },
                        interval: interval.clone(),
                        handle,
                    },
                );
                armed += 1;
            }
        }

        let resync_at = now
            .checked_add_signed(self.config.resync_interval())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        state.resync = Some(self.schedule(resync_at, Wake::Resync { generation }, None, notices));
        state.resync_at = Some(resync_at);

        let summary = ArmSummary {
            generation,
            armed_at: now,
            occupied: occupancy::is_occupied(&intervals, now),
            intervals: intervals.len(),
            armed,
            deferred,
            dropped,
            next: occupancy::next_edge(&intervals, now),
            resync_at,
        };

        info!(
            reason,
            generation,
            intervals = summary.intervals,
            armed,
            deferred,
            dropped,
            resync_at = %resync_at,
            "armed interval timers"
        );
        notices.push(Notice::Rearmed(summary.clone()));
        summary
    }

    /// Register a clock callback for `fires_at`; late targets fire at once.
    fn schedule(
        self: &Arc<Self>,
        fires_at: DateTime<Utc>,
        wake: Wake,
        edge: Option<(&Interval, Edge)>,
        notices: &mut Vec<Notice>,
    ) -> TimerHandle {
        let delay = fires_at - self.clock.now();
        let delay = match delay.to_std() {
            Ok(delay) => delay,
            Err(_) => {
                if let Some((interval, edge)) = edge {
                    warn!(
                        interval_id = %interval.id(),
                        %edge,
                        late_ms = -delay.num_milliseconds(),
                        "edge already past when scheduled, firing immediately"
                    );
                    notices.push(Notice::Diagnostic(Diagnostic::LateEdge {
                        interval_id: interval.id().clone(),
                        edge,
                        late_by: -delay,
                    }));
                }
                std::time::Duration::ZERO
            }
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        self.clock.after(
            delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.wake(wake);
                }
            }),
        )
    }

    fn wake(self: &Arc<Self>, wake: Wake) {
        match wake {
            Wake::Edge { generation, key } => self.fire(generation, key),
            Wake::Resync { generation } => self.resync_due(generation),
        }
    }

    fn fire(self: &Arc<Self>, generation: u64, key: TimerKey) {
        let mut notices = Vec::new();
        {
            let mut state = self.lock();
            if state.shut_down || state.generation != generation {
                trace!(generation, current = state.generation, "ignoring stale timer");
                return;
            }
            let Some(record) = state.timers.remove(&key) else {
                trace!(slot = key.slot, edge = %key.edge, "timer no longer armed");
                return;
            };

            let mut fired = Vec::with_capacity(2);
            if key.edge == Edge::End {
                // Equal deadlines may come back in either order; the start
                // of an interval is always reported before its end.
                let start_key = TimerKey {
                    slot: key.slot,
                    edge: Edge::Start,
                };
                if let Some(start) = state.timers.remove(&start_key) {
                    start.handle.cancel();
                    fired.push((start.info, start.interval));
                }
            }
            fired.push((record.info, record.interval));

            let now = self.clock.now();
            let occupancy_after = occupancy::is_occupied(&state.intervals, now);

            for (info, interval) in fired {
                let transition = Transition {
                    direction: info.edge.direction(),
                    edge: info.edge,
                    interval,
                    occupancy_after,
                    boundary: info.boundary,
                    fired_at: now,
                    generation,
                };
                info!(
                    interval_id = %info.interval_id,
                    direction = %transition.direction,
                    occupancy = occupancy_after,
                    generation,
                    "interval transition"
                );
                notices.push(Notice::Transition(transition));
            }
            self.post(notices);
        }
        self.drain();
    }

    fn resync_due(self: &Arc<Self>, generation: u64) {
        let mut notices = Vec::new();
        {
            let mut state = self.lock();
            if state.shut_down || state.generation != generation {
                trace!(generation, current = state.generation, "ignoring stale resync");
                return;
            }
            // This callback is the resync timer; it has already run.
            drop(state.resync.take());
            let intervals = Arc::clone(&state.intervals);
            self.arm_locked(&mut state, intervals, "horizon", &mut notices);
            self.post(notices);
        }
        self.drain();
    }

    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue notices for delivery. Called with the state lock held so the
    /// queue order matches the order timers were processed in.
    fn post(&self, notices: Vec<Notice>) {
        if !notices.is_empty() {
            self.outbox().queue.extend(notices);
        }
    }

    /// Hand queued notices to the sink. Must run without the state lock held.
    ///
    /// If another caller is already draining (including a sink that re-armed
    /// from inside a notification), that caller delivers what was queued.
    /// Transitions queued before a different snapshot was armed are
    /// discarded.
    fn drain(&self) {
        {
            let mut outbox = self.outbox();
            if outbox.draining {
                return;
            }
            outbox.draining = true;
        }
        let _guard = DrainGuard(&self.outbox);

        loop {
            let notice = {
                let mut outbox = self.outbox();
                match outbox.queue.pop_front() {
                    Some(notice) => notice,
                    None => {
                        outbox.draining = false;
                        break;
                    }
                }
            };

            match notice {
                Notice::Transition(transition) => {
                    if !self.is_current(transition.generation) {
                        debug!(
                            interval_id = %transition.interval.id(),
                            direction = %transition.direction,
                            generation = transition.generation,
                            "discarding transition from replaced generation"
                        );
                        continue;
                    }
                    self.sink.on_transition(&transition);
                }
                Notice::Rearmed(summary) => self.sink.on_rearmed(&summary),
                Notice::Diagnostic(diagnostic) => self.sink.on_diagnostic(&diagnostic),
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.lock();
        !state.shut_down && generation >= state.live_since
    }
}

/// Whether the edge at `boundary` fired (or should have) before `now`.
fn is_crossed(boundary: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    boundary
        .checked_add_signed(FIRE_GRACE)
        .is_some_and(|fires_at| fires_at <= now)
}

impl<C: Clock> Drop for Shared<C> {
    fn drop(&mut self) {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use chrono::{Duration, TimeZone};

    struct NullSink;

    impl TransitionSink for NullSink {
        fn on_transition(&self, _transition: &Transition) {}
    }

    fn epoch() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn scheduler(clock: &ManualClock) -> HorizonScheduler<ManualClock> {
        HorizonScheduler::new(clock.clone(), Arc::new(NullSink), SchedulerConfig::default())
            .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let clock = ManualClock::new(epoch());
        let config = SchedulerConfig::default().with_horizon(Duration::zero());
        assert!(HorizonScheduler::new(clock, Arc::new(NullSink), config).is_err());
    }

    #[test]
    fn test_idle_scheduler_has_nothing_armed() {
        let clock = ManualClock::new(epoch());
        let scheduler = scheduler(&clock);
        assert_eq!(scheduler.generation(), 0);
        assert!(scheduler.pending_timers().is_empty());
        assert!(scheduler.next_resync_at().is_none());
        assert!(!scheduler.is_inside_now());
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn test_arm_registers_edges_and_resync() {
        let clock = ManualClock::new(epoch());
        let scheduler = scheduler(&clock);
        let interval =
            Interval::new("a", epoch() + Duration::seconds(10), epoch() + Duration::seconds(20))
                .unwrap();

        let summary = scheduler.arm(vec![interval]).unwrap();
        assert_eq!(summary.armed, 2);
        assert_eq!(summary.generation, 1);
        assert_eq!(summary.resync_at, epoch() + Duration::hours(12));
        // Two edges plus the standing resync deadline.
        assert_eq!(clock.pending(), 3);

        let timers = scheduler.pending_timers();
        assert_eq!(timers[0].edge, Edge::Start);
        assert_eq!(timers[0].fires_at, epoch() + Duration::seconds(10) + FIRE_GRACE);
        assert_eq!(timers[1].edge, Edge::End);
    }

    #[test]
    fn test_rearm_cancels_previous_clock_registrations() {
        let clock = ManualClock::new(epoch());
        let scheduler = scheduler(&clock);
        let interval =
            Interval::new("a", epoch() + Duration::seconds(10), epoch() + Duration::seconds(20))
                .unwrap();

        scheduler.arm(vec![interval.clone()]);
        scheduler.arm(vec![interval]);
        assert_eq!(clock.pending(), 3);
    }

    #[test]
    fn test_dropping_last_handle_cancels_timers() {
        let clock = ManualClock::new(epoch());
        let interval =
            Interval::new("a", epoch() + Duration::seconds(10), epoch() + Duration::seconds(20))
                .unwrap();
        {
            let scheduler = scheduler(&clock);
            scheduler.arm(vec![interval]);
            assert_eq!(clock.pending(), 3);
        }
        assert_eq!(clock.pending(), 0);
    }
}
