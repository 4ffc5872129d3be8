//! HTTP client for the Strava v3 API with retry on rate limiting.
//!
//! This module provides the ride-source side of the monitor:
//! - Paged listing of athlete activities after a timestamp
//! - Single-activity detail lookup
//! - Automatic retry with exponential backoff on 429 and transport errors

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;

use crate::error::{CaptureError, Result, SourceError};
use crate::types::{Activity, LatLng, parse_timestamp};

const PER_PAGE: usize = 200;
const MAX_PAGES: u32 = 50;
const MAX_RETRIES: u32 = 3;

/// Ride source collaborator.
#[allow(async_fn_in_trait)]
pub trait RideSource {
    /// Activities started after `after`, filtered server-side to `activity_type`
    /// where the source supports it.
    async fn list_activities(
        &self,
        after: DateTime<Utc>,
        activity_type: &str,
    ) -> std::result::Result<Vec<Activity>, SourceError>;

    async fn get_activity_details(
        &self,
        activity_id: i64,
    ) -> std::result::Result<Activity, SourceError>;
}

// ============================================================================
// API records
// ============================================================================

/// Activity record as returned by Strava (summary or detailed form).
#[derive(Debug, Deserialize)]
struct ActivityRecord {
    id: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "type")]
    activity_type: Option<String>,
    #[serde(default)]
    sport_type: Option<String>,
    #[serde(default)]
    distance: f64,
    #[serde(default)]
    moving_time: u32,
    #[serde(default)]
    total_elevation_gain: f64,
    #[serde(default)]
    average_speed: f64,
    #[serde(default)]
    max_speed: f64,
    start_date: String,
    /// `null` and `[]` both mean "no GPS"
    #[serde(default)]
    start_latlng: Option<Vec<f64>>,
    #[serde(default)]
    end_latlng: Option<Vec<f64>>,
}

impl ActivityRecord {
    fn into_activity(self) -> std::result::Result<Activity, SourceError> {
        let start_date = parse_timestamp(&self.start_date).ok_or_else(|| {
            SourceError::Decode(format!(
                "activity {} has invalid start_date '{}'",
                self.id, self.start_date
            ))
        })?;

        Ok(Activity {
            id: self.id,
            name: self
                .name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "Unknown Activity".to_string()),
            sport_type: self
                .activity_type
                .or(self.sport_type)
                .unwrap_or_default(),
            start_date,
            distance_meters: self.distance,
            moving_time_secs: self.moving_time,
            total_elevation_gain: self.total_elevation_gain,
            average_speed: self.average_speed,
            max_speed: self.max_speed,
            start: self.start_latlng.as_deref().and_then(LatLng::from_slice),
            end: self.end_latlng.as_deref().and_then(LatLng::from_slice),
        })
    }
}

/// Decode a page of activity summaries. A record that fails to decode is
/// logged and skipped; only a body that is not a JSON array fails the page.
pub fn parse_activity_page(body: &[u8]) -> std::result::Result<Vec<Activity>, SourceError> {
    let records: Vec<serde_json::Value> =
        serde_json::from_slice(body).map_err(|e| SourceError::Decode(e.to_string()))?;

    let mut activities = Vec::with_capacity(records.len());
    for (i, value) in records.into_iter().enumerate() {
        let decoded = serde_json::from_value::<ActivityRecord>(value)
            .map_err(|e| SourceError::Decode(e.to_string()))
            .and_then(ActivityRecord::into_activity);
        match decoded {
            Ok(activity) => activities.push(activity),
            Err(e) => warn!("[StravaClient] Skipping record {} of page: {}", i, e),
        }
    }
    Ok(activities)
}

/// Decode a single detailed activity.
pub fn parse_activity(body: &[u8]) -> std::result::Result<Activity, SourceError> {
    let record: ActivityRecord =
        serde_json::from_slice(body).map_err(|e| SourceError::Decode(e.to_string()))?;
    record.into_activity()
}

/// Backoff for the n-th consecutive 429: 1s, 2s, 4s, 8s max.
fn rate_limit_backoff(attempt: u32) -> Duration {
    Duration::from_millis(1000 * (1 << attempt.saturating_sub(1).min(3)))
}

// ============================================================================
// Strava client
// ============================================================================

/// Strava API client. Token acquisition happens elsewhere; this only carries it.
pub struct StravaClient {
    client: Client,
    base_url: String,
    auth_header: String,
    max_pages: u32,
}

impl StravaClient {
    /// Create a client from an already-issued OAuth access token.
    pub fn new(access_token: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        Self::with_auth_header(format!("Bearer {}", access_token), base_url, timeout)
    }

    /// Create a client with a pre-formatted auth header.
    pub fn with_auth_header(auth_header: String, base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(timeout)
            .build()
            .map_err(|e| CaptureError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header,
            max_pages: MAX_PAGES,
        })
    }

    /// Cap on pages fetched per listing.
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// GET with retry. 429 and transport errors back off and retry; any other
    /// non-success status is returned immediately.
    async fn get_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<Vec<u8>, SourceError> {
        let mut retries = 0;
        let req_start = Instant::now();

        loop {
            let response = self
                .client
                .get(url)
                .header("Authorization", &self.auth_header)
                .query(query)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();

                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        retries += 1;
                        if retries > MAX_RETRIES {
                            return Err(SourceError::RateLimited {
                                retries: MAX_RETRIES,
                            });
                        }

                        let wait = rate_limit_backoff(retries);
                        warn!(
                            "[StravaClient] 429 Too Many Requests for {}, retry {} with {:?} backoff",
                            url, retries, wait
                        );
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    if !status.is_success() {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(SourceError::HttpStatus {
                            status: status.as_u16(),
                            body,
                        });
                    }

                    let bytes = resp
                        .bytes()
                        .await
                        .map_err(|e| SourceError::Transport(format!("Body download error: {}", e)))?;

                    debug!(
                        "[StravaClient] GET {} -> {:.1}KB in {:?}",
                        url,
                        bytes.len() as f64 / 1024.0,
                        req_start.elapsed()
                    );
                    return Ok(bytes.to_vec());
                }
                Err(e) => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(SourceError::Transport(e.to_string()));
                    }

                    let wait = Duration::from_millis(200 * (1 << retries));
                    warn!(
                        "[StravaClient] Error for {}: {}, retry {} after {:?}",
                        url, e, retries, wait
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

impl RideSource for StravaClient {
    async fn list_activities(
        &self,
        after: DateTime<Utc>,
        activity_type: &str,
    ) -> std::result::Result<Vec<Activity>, SourceError> {
        let url = format!("{}/athlete/activities", self.base_url);
        let mut activities = Vec::new();

        for page in 1..=self.max_pages {
            let query = [
                ("after", after.timestamp().to_string()),
                ("type", activity_type.to_string()),
                ("per_page", PER_PAGE.to_string()),
                ("page", page.to_string()),
            ];
            let bytes = self.get_bytes(&url, &query).await?;
            let batch = parse_activity_page(&bytes)?;
            let batch_len = batch.len();
            activities.extend(batch);

            if batch_len < PER_PAGE {
                break;
            }
            if page == self.max_pages {
                warn!(
                    "[StravaClient] Page limit {} reached after {} activities, older rides not listed",
                    self.max_pages,
                    activities.len()
                );
            }
        }

        info!(
            "[StravaClient] Listed {} activities after {}",
            activities.len(),
            after.to_rfc3339()
        );
        Ok(activities)
    }

    async fn get_activity_details(
        &self,
        activity_id: i64,
    ) -> std::result::Result<Activity, SourceError> {
        let url = format!("{}/activities/{}", self.base_url, activity_id);
        let bytes = self.get_bytes(&url, &[]).await?;
        parse_activity(&bytes)
    }
}
