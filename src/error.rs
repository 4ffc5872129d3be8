//! Unified error handling for the traffic capture monitor.
//!
//! Errors are split by blast radius:
//! - [`OracleError`] is per-activity and never aborts a cycle; the pipeline turns it
//!   into a pending capture or a retry increment.
//! - [`SourceError`] comes from the ride source and aborts the discovery phase.
//! - [`CaptureError`] is what crosses the public API. Store errors are fatal to the
//!   current cycle and surface here unchanged.

use thiserror::Error;

/// Failure of a single route-time estimate.
#[derive(Debug, Error)]
pub enum OracleError {
    /// Request never produced a response (DNS, TLS, timeout, ...)
    #[error("routing request failed: {0}")]
    Transport(String),
    /// Upstream answered with a non-success HTTP status
    #[error("routing service returned HTTP {0}")]
    HttpStatus(u16),
    /// Upstream answered 200 but the payload status was not `OK`
    #[error("routing API status {status}{}", detail(.message))]
    ApiStatus {
        status: String,
        message: Option<String>,
    },
    /// Status was `OK` but no usable route came back
    #[error("routing service returned no routes")]
    NoRoutes,
    /// Response body could not be decoded
    #[error("could not decode routing response: {0}")]
    Decode(String),
}

fn detail(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {m}"))
        .unwrap_or_default()
}

/// Failure talking to the ride source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("ride source request failed: {0}")]
    Transport(String),
    #[error("ride source returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("ride source rate limit exceeded after {retries} retries")]
    RateLimited { retries: u32 },
    #[error("could not decode ride source response: {0}")]
    Decode(String),
}

/// Top-level error type for capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Connectivity gate reported the network unreachable
    #[error("network unreachable, capture skipped")]
    Offline,
    #[error(transparent)]
    Oracle(#[from] OracleError),
    /// Activity lacks start or end coordinates and can never be enriched
    #[error("activity {activity_id} has no start/end coordinates")]
    MalformedActivity { activity_id: i64 },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl CaptureError {
    pub fn config(message: impl Into<String>) -> Self {
        CaptureError::Config {
            message: message.into(),
        }
    }
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Extension trait for converting a missing coordinate into a typed error.
pub trait OptionExt<T> {
    fn ok_or_malformed(self, activity_id: i64) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_malformed(self, activity_id: i64) -> Result<T> {
        self.ok_or(CaptureError::MalformedActivity { activity_id })
    }
}
