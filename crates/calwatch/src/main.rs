//! calwatch: calendar occupancy trigger
//!
//! Main binary with subcommands:
//! - `watch`: Follow a calendar export and emit enter/exit transitions
//! - `status`: Print current occupancy and the next transition once

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::provider::RefreshUnits;

mod daemon;
mod provider;
mod sink;
mod status;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "calwatch")]
#[command(about = "Calendar occupancy trigger", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow a calendar export and emit transitions as JSON lines
    Watch {
        /// JSON file of intervals
        #[arg(long, env = "CALWATCH_SOURCE")]
        source: PathBuf,

        /// How far ahead edges are armed, in seconds
        #[arg(long, env = "CALWATCH_HORIZON_SECS", default_value = "86400")]
        horizon_secs: i64,

        /// Refresh count, in `refresh_units`
        #[arg(long, env = "CALWATCH_REFRESH", default_value = "15")]
        refresh: u64,

        /// Unit of the refresh count
        #[arg(long, env = "CALWATCH_REFRESH_UNITS", value_enum, default_value = "minutes")]
        refresh_units: RefreshUnits,

        /// Name stored as `calendar` in interval metadata
        #[arg(long, env = "CALWATCH_CALENDAR_NAME", default_value = "calendar")]
        calendar_name: String,

        /// Republish the last good interval list when a refresh fails.
        /// Accepts "1", "true", "yes", or "on".
        #[arg(long, env = "CALWATCH_USE_CACHE", value_parser = parse_bool_env, default_value = "false")]
        use_cache: bool,
    },

    /// Print current occupancy and the next transition, then exit
    Status {
        /// JSON file of intervals
        #[arg(long, env = "CALWATCH_SOURCE")]
        source: PathBuf,

        /// Name stored as `calendar` in interval metadata
        #[arg(long, env = "CALWATCH_CALENDAR_NAME", default_value = "calendar")]
        calendar_name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "calwatch=info,calwatch_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            source,
            horizon_secs,
            refresh,
            refresh_units,
            calendar_name,
            use_cache,
        } => {
            daemon::run(daemon::DaemonConfig {
                source,
                refresh: provider::refresh_period(refresh, refresh_units),
                calendar_name,
                use_cache,
                horizon: horizon_from_secs(horizon_secs)?,
            })
            .await
        }

        Commands::Status {
            source,
            calendar_name,
        } => run_status(&source, &calendar_name).await,
    }
}

/// Convert `--horizon-secs` into a duration, rejecting values chrono cannot hold.
fn horizon_from_secs(secs: i64) -> Result<chrono::Duration> {
    chrono::Duration::try_seconds(secs)
        .ok_or_else(|| miette::miette!("horizon of {} seconds is out of range", secs))
}

async fn run_status(source: &std::path::Path, calendar_name: &str) -> Result<()> {
    let intervals = provider::load_intervals(source, calendar_name)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    let report = status::snapshot(&intervals, chrono::Utc::now());
    println!("{}", report);
    Ok(())
}
