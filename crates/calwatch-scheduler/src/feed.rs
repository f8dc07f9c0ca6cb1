//! Publish/subscribe channel from a data provider to schedulers.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::{Clock, HorizonScheduler, Interval};

/// Immutable interval list as published by a provider.
pub type IntervalSnapshot = Arc<[Interval]>;

/// Latest-value channel of interval snapshots.
///
/// Each publish replaces the previous list wholesale; subscribers that fall
/// behind only ever see the newest snapshot.
#[derive(Debug, Clone)]
pub struct IntervalFeed {
    tx: Arc<watch::Sender<IntervalSnapshot>>,
}

impl Default for IntervalFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalFeed {
    /// Create a feed holding an empty snapshot.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::from(Vec::new()));
        Self { tx: Arc::new(tx) }
    }

    /// Replace the published snapshot and notify subscribers.
    pub fn publish(&self, intervals: Vec<Interval>) {
        let snapshot: IntervalSnapshot = Arc::from(intervals);
        debug!(
            count = snapshot.len(),
            subscribers = self.tx.receiver_count(),
            "publishing intervals"
        );
        self.tx.send_replace(snapshot);
    }

    pub fn subscribe(&self) -> watch::Receiver<IntervalSnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> IntervalSnapshot {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<C: Clock> HorizonScheduler<C> {
    /// Arm from the feed's current snapshot, then re-arm on every publish.
    ///
    /// Returns when `shutdown_rx` flips to true or its sender is dropped
    /// (after shutting the scheduler down), or when the feed closes (timers
    /// keep running on the last snapshot).
    pub async fn follow(
        &self,
        mut feed: watch::Receiver<IntervalSnapshot>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("scheduler following interval feed");

        let initial = Arc::clone(&feed.borrow_and_update());
        self.arm(initial);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = feed.changed() => {
                    if changed.is_err() {
                        info!("interval feed closed, keeping last snapshot");
                        return;
                    }
                    let snapshot = Arc::clone(&feed.borrow_and_update());
                    debug!(count = snapshot.len(), "intervals changed");
                    self.arm(snapshot);
                }
                changed = shutdown_rx.changed() => {
                    // A dropped shutdown sender counts as a shutdown request.
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("scheduler received shutdown signal");
        self.shutdown();
    }
}
