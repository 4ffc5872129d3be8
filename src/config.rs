//! Runtime configuration for the capture monitor.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{CaptureError, Result};
use crate::poller::LookBack;

/// Bounded-retry policy for pending captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Rows with `retry_count >= bound` are no longer retried
    pub bound: u32,
    /// Keep exhausted rows for operator inspection instead of deleting them
    pub retain_exhausted: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            bound: 3,
            retain_exhausted: true,
        }
    }
}

/// Source of "now". Injected so timestamps and look-back windows are
/// reproducible in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Clock pinned to a single instant.
pub fn fixed_clock(at: DateTime<Utc>) -> Clock {
    Arc::new(move || at)
}

/// Configuration for the capture monitor and its HTTP collaborators.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub db_path: String,
    pub retry: RetryPolicy,
    /// Minimum spacing between consecutive routing calls
    pub call_spacing: Duration,
    /// Sleep between monitor cycles
    pub check_interval: Duration,
    /// Look-back window for continuous monitoring
    pub monitor_lookback: LookBack,
    /// Look-back in days for [`backfill_default`](crate::CapturePipeline::backfill_default)
    pub backfill_days: u32,
    pub connectivity_url: String,
    pub connectivity_timeout: Duration,
    pub http_timeout: Duration,
    pub strava_base_url: String,
    pub directions_base_url: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            db_path: "traffic_comparisons.db".to_string(),
            retry: RetryPolicy::default(),
            call_spacing: Duration::from_secs(2),
            check_interval: Duration::from_secs(300),
            monitor_lookback: LookBack::Hours(24),
            backfill_days: 30,
            connectivity_url: "https://www.google.com".to_string(),
            connectivity_timeout: Duration::from_secs(5),
            http_timeout: Duration::from_secs(30),
            strava_base_url: "https://www.strava.com/api/v3".to_string(),
            directions_base_url: "https://maps.googleapis.com/maps/api/directions/json"
                .to_string(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry.bound == 0 {
            return Err(CaptureError::config("retry bound must be at least 1"));
        }
        if self.backfill_days == 0 {
            return Err(CaptureError::config("backfill window must be at least 1 day"));
        }
        if self.check_interval.is_zero() {
            return Err(CaptureError::config("check interval must be non-zero"));
        }
        if self.monitor_lookback.duration() == Some(TimeDelta::zero()) {
            return Err(CaptureError::config("monitor look-back must be non-zero"));
        }

        let now = Utc::now();
        if self.monitor_lookback.since(now).is_none() {
            return Err(CaptureError::config(format!(
                "monitor look-back {:?} is out of range",
                self.monitor_lookback
            )));
        }
        if LookBack::Days(self.backfill_days).since(now).is_none() {
            return Err(CaptureError::config(format!(
                "backfill window of {} days is out of range",
                self.backfill_days
            )));
        }
        if self.db_path.trim().is_empty() {
            return Err(CaptureError::config("database path is empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.retry.bound, 3);
        assert!(config.retry.retain_exhausted);
        assert_eq!(config.call_spacing, Duration::from_secs(2));
        assert_eq!(config.check_interval, Duration::from_secs(300));
        assert_eq!(config.monitor_lookback, LookBack::Hours(24));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_bound() {
        let config = MonitorConfig {
            retry: RetryPolicy {
                bound: 0,
                retain_exhausted: true,
            },
            ..MonitorConfig::default()
        };
        assert!(matches!(config.validate(), Err(CaptureError::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_windows() {
        let config = MonitorConfig {
            backfill_days: 0,
            ..MonitorConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MonitorConfig {
            check_interval: Duration::ZERO,
            ..MonitorConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MonitorConfig {
            monitor_lookback: LookBack::Hours(0),
            ..MonitorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_overflowing_windows() {
        let config = MonitorConfig {
            backfill_days: 100_000_000,
            ..MonitorConfig::default()
        };
        assert!(matches!(config.validate(), Err(CaptureError::Config { .. })));

        let config = MonitorConfig {
            monitor_lookback: LookBack::Hours(u32::MAX),
            ..MonitorConfig::default()
        };
        assert!(matches!(config.validate(), Err(CaptureError::Config { .. })));

        let config = MonitorConfig {
            backfill_days: 3650,
            monitor_lookback: LookBack::Days(365),
            ..MonitorConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fixed_clock() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let clock = fixed_clock(at);
        assert_eq!(clock(), at);
        assert_eq!(clock(), at);
    }
}
