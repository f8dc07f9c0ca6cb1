//! Watch command: follow a calendar export and emit occupancy transitions.
//!
//! Three tasks run side by side:
//! - the file provider, refreshing on its cadence or on SIGHUP
//! - the scheduler, re-arming whenever the provider publishes
//! - a signal watcher that turns ctrl-c into a shutdown broadcast

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tokio::sync::{Notify, watch};
use tracing::{info, warn};

use calwatch_scheduler::{HorizonScheduler, IntervalFeed, SchedulerConfig, TokioClock};

use crate::provider::{FileProvider, ProviderConfig};
use crate::sink::LogSink;

/// Configuration for the watch daemon.
pub struct DaemonConfig {
    pub source: PathBuf,
    pub refresh: Duration,
    pub calendar_name: String,
    pub use_cache: bool,
    pub horizon: chrono::Duration,
}

/// Run until ctrl-c.
pub async fn run(config: DaemonConfig) -> Result<()> {
    let scheduler_config = SchedulerConfig::default().with_horizon(config.horizon);
    let feed = IntervalFeed::new();
    let mut provider = FileProvider::new(
        ProviderConfig {
            source: config.source.clone(),
            refresh: config.refresh,
            calendar_name: config.calendar_name,
            use_cache: config.use_cache,
        },
        feed.clone(),
    );

    // Fail fast on a source that is unreadable from the start
    if !provider.refresh().await {
        return Err(miette::miette!(
            "failed to load initial intervals from {}",
            config.source.display()
        ));
    }

    let clock = TokioClock::current().map_err(|e| miette::miette!("{}", e))?;
    let sink = Arc::new(LogSink::new(std::io::stdout()));
    let scheduler = HorizonScheduler::new(clock, sink, scheduler_config)
        .map_err(|e| miette::miette!("{}", e))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresh_now = Arc::new(Notify::new());

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    #[cfg(unix)]
    spawn_hangup_listener(Arc::clone(&refresh_now), shutdown_rx.clone());

    let provider_handle = tokio::spawn(provider.run(Arc::clone(&refresh_now), shutdown_rx.clone()));

    let scheduler_handle = {
        let scheduler = scheduler.clone();
        let feed_rx = feed.subscribe();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.follow(feed_rx, shutdown_rx).await })
    };

    info!(
        source = %config.source.display(),
        horizon_secs = config.horizon.num_seconds(),
        "watching calendar"
    );

    // Wait for shutdown signal
    let mut main_shutdown_rx = shutdown_rx;
    loop {
        if main_shutdown_rx.changed().await.is_err() || *main_shutdown_rx.borrow() {
            break;
        }
    }

    info!("shutting down watch tasks");

    provider_handle
        .await
        .map_err(|e| miette::miette!("provider task failed: {}", e))?;
    scheduler_handle
        .await
        .map_err(|e| miette::miette!("scheduler task failed: {}", e))?;
    // Covers a follow loop that ended early on a closed feed
    scheduler.shutdown();

    info!("watch shut down gracefully");
    Ok(())
}

/// Request a refresh on every SIGHUP until shutdown.
#[cfg(unix)]
fn spawn_hangup_listener(refresh_now: Arc<Notify>, mut shutdown_rx: watch::Receiver<bool>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "failed to install SIGHUP handler, manual refresh disabled");
            return;
        }
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("SIGHUP received, refreshing");
                    refresh_now.notify_one();
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}
