use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use log::{error, info, warn};
use tokio::sync::watch;

use traffic_capture::{
    CapturePipeline, CaptureError, CycleOutcome, GoogleDirections, HttpConnectivityGate, LookBack,
    MonitorConfig, RetryPolicy, StravaClient, TrafficStore, init_logging,
};

#[derive(Debug, Parser)]
#[command(
    name = "traffic-capture",
    about = "Capture bike-vs-car travel time comparisons for finished rides"
)]
struct Cli {
    /// Already-issued Strava OAuth access token
    #[arg(long, env = "STRAVA_ACCESS_TOKEN", hide_env_values = true)]
    strava_token: String,

    /// Google Maps API key with the Directions API enabled
    #[arg(long, env = "GOOGLE_MAPS_API_KEY", hide_env_values = true)]
    google_maps_key: String,

    /// SQLite database path
    #[arg(long, env = "TRAFFIC_DB_PATH", default_value = "traffic_comparisons.db")]
    db_path: String,

    /// Seconds to sleep between monitor cycles
    #[arg(long, env = "TRAFFIC_CHECK_INTERVAL_SECS", default_value_t = 300)]
    check_interval_secs: u64,

    /// Look-back window for continuous monitoring, in hours
    #[arg(long, env = "TRAFFIC_LOOKBACK_HOURS", default_value_t = 24)]
    lookback_hours: u32,

    /// Minimum milliseconds between routing calls
    #[arg(long, env = "TRAFFIC_CALL_SPACING_MS", default_value_t = 2000)]
    call_spacing_ms: u64,

    /// Failed routing attempts before a pending capture is abandoned
    #[arg(long, env = "TRAFFIC_RETRY_BOUND", default_value_t = 3)]
    retry_bound: u32,

    /// Delete abandoned pending captures instead of keeping them for inspection
    #[arg(long, env = "TRAFFIC_DISCARD_EXHAUSTED", default_value_t = false)]
    discard_exhausted: bool,

    /// Endpoint probed before each cycle
    #[arg(long, env = "TRAFFIC_CONNECTIVITY_URL", default_value = "https://www.google.com")]
    connectivity_url: String,

    #[arg(long, env = "STRAVA_BASE_URL", default_value = "https://www.strava.com/api/v3")]
    strava_base_url: String,

    #[arg(
        long,
        env = "GOOGLE_DIRECTIONS_URL",
        default_value = "https://maps.googleapis.com/maps/api/directions/json"
    )]
    directions_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run capture cycles until interrupted
    Monitor,
    /// Run a single capture cycle
    Once,
    /// Capture every ride from the last N days that has no comparison yet
    Backfill {
        #[arg(long, env = "TRAFFIC_BACKFILL_DAYS", default_value_t = 30)]
        days: u32,
    },
    /// Capture one activity by id
    Capture { activity_id: i64 },
}

impl Cli {
    fn monitor_config(&self) -> MonitorConfig {
        let defaults = MonitorConfig::default();
        MonitorConfig {
            db_path: self.db_path.clone(),
            retry: RetryPolicy {
                bound: self.retry_bound,
                retain_exhausted: !self.discard_exhausted,
            },
            call_spacing: Duration::from_millis(self.call_spacing_ms),
            check_interval: Duration::from_secs(self.check_interval_secs),
            monitor_lookback: LookBack::Hours(self.lookback_hours),
            backfill_days: match self.command {
                Command::Backfill { days } => days,
                _ => defaults.backfill_days,
            },
            connectivity_url: self.connectivity_url.clone(),
            strava_base_url: self.strava_base_url.clone(),
            directions_base_url: self.directions_url.clone(),
            ..defaults
        }
    }
}

type Pipeline = CapturePipeline<HttpConnectivityGate, GoogleDirections, StravaClient>;

fn build_pipeline(cli: &Cli) -> Result<Pipeline, CaptureError> {
    let config = cli.monitor_config();
    config.validate()?;

    let gate = HttpConnectivityGate::new(config.connectivity_url.clone(), config.connectivity_timeout)?;
    let oracle = GoogleDirections::new(
        &cli.google_maps_key,
        &config.directions_base_url,
        config.http_timeout,
    )?;
    let source = StravaClient::new(&cli.strava_token, &config.strava_base_url, config.http_timeout)?;
    let store = TrafficStore::open(&config.db_path)?;

    info!(
        "Opened store {} ({} comparisons, {} pending)",
        config.db_path,
        store.comparison_count()?,
        store.pending_count()?
    );

    Ok(CapturePipeline::new(gate, oracle, source, store, config))
}

/// Shutdown channel flipped by Ctrl-C.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping after the current cycle");
                let _ = tx.send(true);
            }
            Err(e) => {
                warn!("Could not install Ctrl-C handler: {}", e);
                // Keep the sender alive so the monitor is not stopped by a closed channel
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

async fn run() -> Result<(), CaptureError> {
    dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let pipeline = build_pipeline(&cli)?;

    match cli.command {
        Command::Monitor => pipeline.monitor(shutdown_signal()).await?,
        Command::Once => match pipeline.run_cycle().await? {
            CycleOutcome::Offline => warn!("Offline, nothing captured"),
            CycleOutcome::Completed(report) => info!(
                "Cycle complete: {} new, {} captured, {} queued, {} drained, {} abandoned",
                report.discovered - report.already_seen - report.already_queued,
                report.captured,
                report.queued,
                report.drained,
                report.abandoned
            ),
        },
        Command::Backfill { .. } => {
            let summary = pipeline.backfill_default().await?;
            info!(
                "Backfill: {} found, {} captured, {} already captured, {} failed, {} without coordinates",
                summary.found,
                summary.captured,
                summary.already_captured,
                summary.failed,
                summary.skipped_missing_coordinates
            );
        }
        Command::Capture { activity_id } => {
            let comparison = pipeline.capture_activity(activity_id).await?;
            info!(
                "Captured {} '{}': bike {:.1} min, car {:.1} min ({}), {:.1} min saved",
                comparison.activity_id,
                comparison.activity_name,
                comparison.bike_time_minutes,
                comparison.car_time_minutes,
                comparison.traffic_label,
                comparison.time_saved_minutes
            );
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!("traffic-capture failed: {err}");
        std::process::exit(1);
    }
}
