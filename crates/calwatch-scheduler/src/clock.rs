//! Time source and timer primitives.
//!
//! The scheduler only ever talks to a [`Clock`]. Production code uses
//! [`TokioClock`]; tests drive a [`ManualClock`] whose time moves only when
//! told to.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tracing::trace;

use crate::SchedulerError;

/// Work to run when a timer elapses.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Source of "now" and of delayed callbacks.
pub trait Clock: Send + Sync + 'static {
    /// Current wall-clock instant.
    fn now(&self) -> DateTime<Utc>;

    /// Run `callback` once after `delay`. A zero delay means "as soon as
    /// possible", never synchronously inside this call.
    fn after(&self, delay: std::time::Duration, callback: TimerCallback) -> TimerHandle;
}

/// Cancellation handle for a timer registered with [`Clock::after`].
///
/// Dropping the handle leaves the timer running.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Prevent the callback from running if it has not started yet.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// Wall clock backed by tokio timers.
#[derive(Debug, Clone)]
pub struct TokioClock {
    runtime: Handle,
}

impl TokioClock {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Bind to the runtime of the calling task.
    pub fn current() -> Result<Self, SchedulerError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| SchedulerError::NoRuntime)
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn after(&self, delay: std::time::Duration, callback: TimerCallback) -> TimerHandle {
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        TimerHandle::new(move || task.abort())
    }
}

/// Simulated clock for deterministic tests.
///
/// Due callbacks run in deadline order, ties in registration order, and
/// observe `now()` equal to their own deadline.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

struct ManualState {
    now: DateTime<Utc>,
    next_seq: u64,
    queue: BTreeMap<(DateTime<Utc>, u64), TimerCallback>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                now: start,
                next_seq: 0,
                queue: BTreeMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move time forward by `by`, running every callback that falls due.
    pub fn advance(&self, by: chrono::Duration) {
        let target = self.now() + by;
        self.advance_to(target);
    }

    /// Move time forward to `target`, running every callback that falls due.
    ///
    /// Callbacks registered while advancing run too if they are due by
    /// `target`. Time never moves backwards.
    pub fn advance_to(&self, target: DateTime<Utc>) {
        loop {
            let callback = {
                let mut state = self.lock();
                let Some(entry) = state.queue.first_entry() else {
                    break;
                };
                if entry.key().0 > target {
                    break;
                }
                let ((deadline, seq), callback) = entry.remove_entry();
                if deadline > state.now {
                    state.now = deadline;
                }
                trace!(seq, deadline = %deadline, "manual clock firing timer");
                callback
            };
            callback();
        }

        let mut state = self.lock();
        if target > state.now {
            state.now = target;
        }
    }

    /// Number of registered, uncancelled, not-yet-run callbacks.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Deadline of the earliest registered callback.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.lock().queue.keys().next().map(|(deadline, _)| *deadline)
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ManualClock")
            .field("now", &state.now)
            .field("pending", &state.queue.len())
            .finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    fn after(&self, delay: std::time::Duration, callback: TimerCallback) -> TimerHandle {
        let key = {
            let mut state = self.lock();
            let deadline = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| state.now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            let key = (deadline, state.next_seq);
            state.next_seq += 1;
            state.queue.insert(key, callback);
            key
        };

        let weak: Weak<Mutex<ManualState>> = Arc::downgrade(&self.inner);
        TimerHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .queue
                    .remove(&key);
            }
        })
    }
}
