//! Route-time oracle: driving duration and traffic label between two points.
//!
//! Wraps exactly one Google Directions request per estimate. Every failure
//! (transport, HTTP status, API status, empty route list, bad body) comes back
//! as an [`OracleError`]; nothing panics across the pipeline boundary.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;

use crate::error::{CaptureError, OracleError, Result};
use crate::types::{LatLng, RouteEstimate, TrafficLabel};

/// External routing service.
#[allow(async_fn_in_trait)]
pub trait RouteOracle {
    /// Estimate driving time from `origin` to `destination`. Supplying a
    /// departure asks for traffic-aware duration at *current* conditions.
    async fn estimate(
        &self,
        origin: LatLng,
        destination: LatLng,
        departure: Option<DateTime<Utc>>,
    ) -> std::result::Result<RouteEstimate, OracleError>;
}

// ============================================================================
// Directions API response
// ============================================================================

#[derive(Debug, Deserialize)]
struct DirectionsResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    routes: Vec<ApiRoute>,
}

#[derive(Debug, Deserialize)]
struct ApiRoute {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    legs: Vec<ApiLeg>,
}

#[derive(Debug, Deserialize)]
struct ApiLeg {
    duration: ApiValue,
    #[serde(default)]
    duration_in_traffic: Option<ApiValue>,
    #[serde(default)]
    distance: Option<ApiValue>,
}

#[derive(Debug, Deserialize)]
struct ApiValue {
    value: u64,
}

/// Turn a Directions API body into an estimate.
pub fn parse_directions(body: &[u8]) -> std::result::Result<RouteEstimate, OracleError> {
    let data: DirectionsResponse =
        serde_json::from_slice(body).map_err(|e| OracleError::Decode(e.to_string()))?;

    if data.status != "OK" {
        return Err(OracleError::ApiStatus {
            status: data.status,
            message: data.error_message,
        });
    }

    let route = data.routes.into_iter().next().ok_or(OracleError::NoRoutes)?;
    let leg = route.legs.into_iter().next().ok_or(OracleError::NoRoutes)?;

    let free_flow = leg.duration.value;
    let in_traffic = leg.duration_in_traffic.map(|d| d.value);
    let traffic_label = TrafficLabel::classify(free_flow as f64, in_traffic.map(|v| v as f64));

    Ok(RouteEstimate {
        duration_seconds: in_traffic.unwrap_or(free_flow),
        traffic_label,
        route_summary: route
            .summary
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "Unknown route".to_string()),
        distance_meters: leg.distance.map_or(0, |d| d.value),
    })
}

// ============================================================================
// Google Directions client
// ============================================================================

/// Driving-time oracle backed by the Google Directions API.
pub struct GoogleDirections {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GoogleDirections {
    pub fn new(api_key: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CaptureError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
        })
    }
}

impl RouteOracle for GoogleDirections {
    async fn estimate(
        &self,
        origin: LatLng,
        destination: LatLng,
        departure: Option<DateTime<Utc>>,
    ) -> std::result::Result<RouteEstimate, OracleError> {
        let origin_q = origin.to_query();
        let destination_q = destination.to_query();
        let mut query: Vec<(&str, &str)> = vec![
            ("origin", origin_q.as_str()),
            ("destination", destination_q.as_str()),
            ("mode", "driving"),
            ("key", self.api_key.as_str()),
        ];
        // Only current conditions are available; the ride's own start time is ignored
        if departure.is_some() {
            query.push(("departure_time", "now"));
        }

        let req_start = Instant::now();
        let resp = self
            .client
            .get(&self.base_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            warn!("[GoogleDirections] HTTP {} for {} -> {}", status, origin_q, destination_q);
            return Err(OracleError::HttpStatus(status.as_u16()));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| OracleError::Transport(format!("Body download error: {}", e)))?;

        let estimate = parse_directions(&bytes)?;
        debug!(
            "[GoogleDirections] {} -> {}: {}s ({}) via {} in {:?}",
            origin_q,
            destination_q,
            estimate.duration_seconds,
            estimate.traffic_label,
            estimate.route_summary,
            req_start.elapsed()
        );
        Ok(estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(free_flow: u64, traffic: Option<u64>) -> String {
        let traffic = traffic
            .map(|t| format!(r#", "duration_in_traffic": {{"value": {t}, "text": "x"}}"#))
            .unwrap_or_default();
        format!(
            r#"{{
                "status": "OK",
                "routes": [{{
                    "summary": "I-5 S",
                    "legs": [{{
                        "duration": {{"value": {free_flow}, "text": "x"}},
                        "distance": {{"value": 13200, "text": "8.2 mi"}}
                        {traffic}
                    }}]
                }}]
            }}"#
        )
    }

    #[test]
    fn test_parse_uses_traffic_duration() {
        let est = parse_directions(body(1000, Some(1400)).as_bytes()).unwrap();
        assert_eq!(est.duration_seconds, 1400);
        assert_eq!(est.traffic_label, TrafficLabel::Heavy);
        assert_eq!(est.route_summary, "I-5 S");
        assert_eq!(est.distance_meters, 13200);
    }

    #[test]
    fn test_parse_labels() {
        let moderate = parse_directions(body(1000, Some(1150)).as_bytes()).unwrap();
        assert_eq!(moderate.traffic_label, TrafficLabel::Moderate);

        let light = parse_directions(body(1000, Some(1050)).as_bytes()).unwrap();
        assert_eq!(light.traffic_label, TrafficLabel::Light);
    }

    #[test]
    fn test_parse_without_traffic_is_unknown() {
        let est = parse_directions(body(1000, None).as_bytes()).unwrap();
        assert_eq!(est.duration_seconds, 1000);
        assert_eq!(est.traffic_label, TrafficLabel::Unknown);
    }

    #[test]
    fn test_parse_api_status_error() {
        let err = parse_directions(
            br#"{"status": "REQUEST_DENIED", "error_message": "The provided API key is invalid.", "routes": []}"#,
        )
        .unwrap_err();
        match err {
            OracleError::ApiStatus { status, message } => {
                assert_eq!(status, "REQUEST_DENIED");
                assert!(message.unwrap().contains("invalid"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_zero_routes() {
        let err = parse_directions(br#"{"status": "OK", "routes": []}"#).unwrap_err();
        assert!(matches!(err, OracleError::NoRoutes));

        let err = parse_directions(br#"{"status": "OK", "routes": [{"summary": "A", "legs": []}]}"#)
            .unwrap_err();
        assert!(matches!(err, OracleError::NoRoutes));
    }

    #[test]
    fn test_parse_missing_summary() {
        let est = parse_directions(
            br#"{"status": "OK", "routes": [{"legs": [{"duration": {"value": 600}}]}]}"#,
        )
        .unwrap();
        assert_eq!(est.route_summary, "Unknown route");
        assert_eq!(est.distance_meters, 0);
    }

    #[test]
    fn test_parse_garbage() {
        let err = parse_directions(b"<html>oops</html>").unwrap_err();
        assert!(matches!(err, OracleError::Decode(_)));
    }

    #[tokio::test]
    async fn test_transport_error_maps_to_oracle_error() {
        let oracle = GoogleDirections::new(
            "test-key",
            "http://127.0.0.1:9/maps/api/directions/json",
            Duration::from_millis(500),
        )
        .unwrap();
        let err = oracle
            .estimate(LatLng::new(47.6, -122.3), LatLng::new(47.62, -122.35), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::Transport(_)));
    }
}
