//! Traffic Capture - bike-vs-car travel time comparisons for finished rides
//!
//! This crate provides:
//! - Polling of recently finished rides from Strava
//! - Driving-time estimates from Google Directions
//! - SQLite persistence of comparisons and a bounded-retry pending queue
//! - A capture pipeline for continuous monitoring, backfill and single captures

// Error types shared by every collaborator
pub mod error;
pub use error::{CaptureError, OracleError, OptionExt, Result, SourceError};

// Domain model and comparison metrics
pub mod types;
pub use types::{
    Activity, ComparisonMetrics, LatLng, PendingCapture, RideSnapshot, RouteEstimate,
    TrafficComparison, TrafficLabel, Watermark,
};

// Runtime configuration
pub mod config;
pub use config::{Clock, MonitorConfig, RetryPolicy, fixed_clock, system_clock};

// Collaborators
pub mod connectivity;
pub use connectivity::{ConnectivityProbe, HttpConnectivityGate};

pub mod oracle;
pub use oracle::{GoogleDirections, RouteOracle};

pub mod source;
pub use source::{RideSource, StravaClient};

pub mod poller;
pub use poller::{ActivityPoller, LookBack};

// SQLite storage
pub mod persistence;
pub use persistence::TrafficStore;

// Capture orchestration
pub mod pipeline;
pub use pipeline::{BackfillSummary, CapturePipeline, CycleOutcome, CycleReport};

/// Initialize logging for the binary. `RUST_LOG` overrides the default `info` level.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .try_init();
}
