//! File-backed interval provider.
//!
//! Reads a JSON array of calendar intervals on a fixed cadence and publishes
//! each successful read to an [`IntervalFeed`]. Fetching and recurrence
//! expansion happen upstream; this only turns an exported list into
//! intervals.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use calwatch_scheduler::{Interval, IntervalFeed, SchedulerError};

/// Errors that can occur while loading intervals.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Source file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Source file is not a valid interval list.
    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// An entry ends before it starts.
    #[error(transparent)]
    Interval(#[from] SchedulerError),
}

/// Unit the refresh count is expressed in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum RefreshUnits {
    Seconds,
    #[default]
    Minutes,
    Hours,
    Days,
}

impl RefreshUnits {
    fn seconds(self) -> u64 {
        match self {
            RefreshUnits::Seconds => 1,
            RefreshUnits::Minutes => 60,
            RefreshUnits::Hours => 60 * 60,
            RefreshUnits::Days => 60 * 60 * 24,
        }
    }
}

/// Refresh period for `count` units, never shorter than one second.
pub fn refresh_period(count: u64, units: RefreshUnits) -> Duration {
    Duration::from_secs(count.saturating_mul(units.seconds()).max(1))
}

/// Configuration for a [`FileProvider`].
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub source: PathBuf,
    pub refresh: Duration,
    /// Stored under `calendar` in metadata of entries that have none.
    pub calendar_name: String,
    /// Republish the last good list when a refresh fails.
    pub use_cache: bool,
}

/// One entry of the source file.
#[derive(Debug, Deserialize)]
struct SourceEntry {
    id: Option<String>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    #[serde(default)]
    metadata: serde_json::Value,
}

/// Publishes intervals read from a JSON file.
pub struct FileProvider {
    config: ProviderConfig,
    feed: IntervalFeed,
    cache: Option<Vec<Interval>>,
}

impl FileProvider {
    pub fn new(config: ProviderConfig, feed: IntervalFeed) -> Self {
        Self {
            config,
            feed,
            cache: None,
        }
    }

    /// Read and convert the source file, sorted by start.
    pub async fn load(&self) -> Result<Vec<Interval>, ProviderError> {
        load_intervals(&self.config.source, &self.config.calendar_name).await
    }

    /// Load and publish. Returns whether anything was published.
    #[tracing::instrument(skip(self), fields(source = %self.config.source.display()))]
    pub async fn refresh(&mut self) -> bool {
        match self.load().await {
            Ok(intervals) => {
                info!(count = intervals.len(), "loaded intervals");
                if self.config.use_cache {
                    self.cache = Some(intervals.clone());
                }
                self.feed.publish(intervals);
                true
            }
            Err(e) => match (&self.cache, self.config.use_cache) {
                (Some(cached), true) => {
                    warn!(error = %e, count = cached.len(), "refresh failed, republishing cached intervals");
                    self.feed.publish(cached.clone());
                    true
                }
                _ => {
                    warn!(error = %e, "refresh failed, keeping current intervals");
                    false
                }
            },
        }
    }

    /// Refresh on the configured cadence or when `refresh_now` is notified,
    /// until `shutdown_rx` flips to true.
    pub async fn run(mut self, refresh_now: Arc<Notify>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            period_secs = self.config.refresh.as_secs(),
            "provider starting"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = sleep(self.config.refresh) => {
                    debug!("scheduled refresh");
                }
                _ = refresh_now.notified() => {
                    info!("manual refresh requested");
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            self.refresh().await;
        }

        info!("provider shut down");
    }
}

/// Read `path` and turn its entries into intervals.
pub async fn load_intervals(
    path: &Path,
    calendar_name: &str,
) -> Result<Vec<Interval>, ProviderError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ProviderError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let entries: Vec<SourceEntry> =
        serde_json::from_str(&raw).map_err(|source| ProviderError::Json {
            path: path.to_path_buf(),
            source,
        })?;

    let mut intervals = entries
        .into_iter()
        .map(|entry| into_interval(entry, calendar_name))
        .collect::<Result<Vec<_>, _>>()?;
    intervals.sort_by_key(|i| i.start());

    Ok(intervals)
}

fn into_interval(entry: SourceEntry, calendar_name: &str) -> Result<Interval, ProviderError> {
    let id = match &entry.id {
        Some(id) => id.clone(),
        None => derived_id(&entry, calendar_name),
    };

    let metadata = match entry.metadata {
        serde_json::Value::Null => serde_json::json!({ "calendar": calendar_name }),
        serde_json::Value::Object(mut map) => {
            map.entry("calendar")
                .or_insert_with(|| serde_json::Value::String(calendar_name.to_string()));
            serde_json::Value::Object(map)
        }
        other => other,
    };

    Ok(Interval::new(id, entry.start, entry.end)?.with_metadata(metadata))
}

/// Name-based id for an entry without one, stable across refreshes.
fn derived_id(entry: &SourceEntry, calendar_name: &str) -> String {
    let summary = entry
        .metadata
        .get("summary")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    let name = format!(
        "{}\n{}\n{}\n{}",
        calendar_name,
        entry.start.to_rfc3339(),
        entry.end.to_rfc3339(),
        summary
    );
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_source(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn config(path: &Path, use_cache: bool) -> ProviderConfig {
        ProviderConfig {
            source: path.to_path_buf(),
            refresh: Duration::from_secs(60),
            calendar_name: "work".to_string(),
            use_cache,
        }
    }

    const SOURCE: &str = r#"[
        {"id": "review", "start": "2024-03-01T15:00:00Z", "end": "2024-03-01T16:00:00Z",
         "metadata": {"summary": "Design review", "calendar": "team"}},
        {"id": "standup", "start": "2024-03-01T09:00:00Z", "end": "2024-03-01T09:15:00Z"},
        {"start": "2024-03-01T12:00:00Z", "end": "2024-03-01T13:00:00Z",
         "metadata": {"summary": "Lunch"}}
    ]"#;

    #[test]
    fn test_refresh_period_units() {
        assert_eq!(refresh_period(30, RefreshUnits::Seconds), Duration::from_secs(30));
        assert_eq!(refresh_period(15, RefreshUnits::Minutes), Duration::from_secs(900));
        assert_eq!(refresh_period(2, RefreshUnits::Hours), Duration::from_secs(7200));
        assert_eq!(refresh_period(1, RefreshUnits::Days), Duration::from_secs(86_400));
        assert_eq!(refresh_period(0, RefreshUnits::Hours), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_load_sorts_and_fills_defaults() {
        let file = write_source(SOURCE);
        let intervals = load_intervals(file.path(), "work").await.unwrap();

        let ids: Vec<&str> = intervals.iter().map(|i| i.id().as_str()).collect();
        assert_eq!(ids[0], "standup");
        assert_eq!(ids[2], "review");
        // Generated id for the entry without one.
        assert!(uuid::Uuid::parse_str(ids[1]).is_ok());

        assert_eq!(intervals[0].metadata()["calendar"], "work");
        assert_eq!(intervals[1].metadata()["calendar"], "work");
        assert_eq!(intervals[1].metadata()["summary"], "Lunch");
        assert_eq!(intervals[2].metadata()["calendar"], "team");
    }

    #[tokio::test]
    async fn test_generated_ids_are_stable_across_loads() {
        let file = write_source(SOURCE);
        let first = load_intervals(file.path(), "work").await.unwrap();
        let second = load_intervals(file.path(), "work").await.unwrap();
        assert_eq!(first[1].id(), second[1].id());

        let moved = write_source(
            r#"[{"start": "2024-03-01T12:30:00Z", "end": "2024-03-01T13:00:00Z",
                 "metadata": {"summary": "Lunch"}}]"#,
        );
        let moved = load_intervals(moved.path(), "work").await.unwrap();
        assert_ne!(moved[0].id(), first[1].id());
    }

    #[tokio::test]
    async fn test_load_rejects_inverted_entry() {
        let file = write_source(
            r#"[{"id": "bad", "start": "2024-03-01T10:00:00Z", "end": "2024-03-01T09:00:00Z"}]"#,
        );
        let err = load_intervals(file.path(), "work").await.unwrap_err();
        assert!(matches!(err, ProviderError::Interval(_)));
    }

    #[tokio::test]
    async fn test_load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_intervals(&dir.path().join("missing.json"), "work")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Io { .. }));
    }

    #[tokio::test]
    async fn test_refresh_publishes_to_feed() {
        let file = write_source(SOURCE);
        let feed = IntervalFeed::new();
        let mut provider = FileProvider::new(config(file.path(), false), feed.clone());

        assert!(provider.refresh().await);
        assert_eq!(feed.current().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_refresh_republishes_cache() {
        let file = write_source(SOURCE);
        let feed = IntervalFeed::new();
        let mut provider = FileProvider::new(config(file.path(), true), feed.clone());
        assert!(provider.refresh().await);

        std::fs::write(file.path(), "not json").unwrap();
        let mut rx = feed.subscribe();
        rx.borrow_and_update();

        assert!(provider.refresh().await);
        assert!(rx.has_changed().unwrap());
        assert_eq!(feed.current().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_refresh_without_cache_keeps_feed_quiet() {
        let file = write_source(SOURCE);
        let feed = IntervalFeed::new();
        let mut provider = FileProvider::new(config(file.path(), false), feed.clone());
        assert!(provider.refresh().await);

        std::fs::write(file.path(), "[").unwrap();
        let mut rx = feed.subscribe();
        rx.borrow_and_update();

        assert!(!provider.refresh().await);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(feed.current().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_refreshes_on_demand_and_stops() {
        let file = write_source(SOURCE);
        let feed = IntervalFeed::new();
        let provider = FileProvider::new(config(file.path(), false), feed.clone());
        let refresh_now = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut rx = feed.subscribe();

        let task = tokio::spawn(provider.run(Arc::clone(&refresh_now), shutdown_rx));
        refresh_now.notify_one();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().len(), 3);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
