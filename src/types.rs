//! Data model for captured comparisons and the pending-capture queue.
//!
//! Units follow the stored layout: times in minutes, distance in miles,
//! speeds in mph. Raw activity snapshots keep the ride source's units
//! (meters, seconds) until a comparison is built.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Meters to statute miles.
pub const METERS_TO_MILES: f64 = 0.000621371;

// ============================================================================
// Coordinates
// ============================================================================

/// A WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Build from the `[lat, lng]` array shape used by ride sources.
    /// Anything other than exactly two values means "no coordinate".
    pub fn from_slice(values: &[f64]) -> Option<Self> {
        match values {
            [lat, lng] => Some(Self::new(*lat, *lng)),
            _ => None,
        }
    }

    /// `lat,lng` form accepted by directions APIs.
    pub fn to_query(&self) -> String {
        format!("{},{}", self.lat, self.lng)
    }
}

// ============================================================================
// Activity
// ============================================================================

/// Read-only snapshot of a finished ride from the ride source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: i64,
    pub name: String,
    pub sport_type: String,
    pub start_date: DateTime<Utc>,
    /// Distance in meters
    pub distance_meters: f64,
    /// Moving time in seconds
    pub moving_time_secs: u32,
    pub total_elevation_gain: f64,
    pub average_speed: f64,
    pub max_speed: f64,
    pub start: Option<LatLng>,
    pub end: Option<LatLng>,
}

impl Activity {
    /// Start and end coordinates, if both are present.
    pub fn endpoints(&self) -> Option<(LatLng, LatLng)> {
        Some((self.start?, self.end?))
    }

    pub fn bike_time_minutes(&self) -> f64 {
        self.moving_time_secs as f64 / 60.0
    }

    pub fn distance_miles(&self) -> f64 {
        self.distance_meters * METERS_TO_MILES
    }
}

// ============================================================================
// Route estimate
// ============================================================================

/// Qualitative traffic bucket derived from traffic-aware vs free-flow duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrafficLabel {
    Light,
    Moderate,
    Heavy,
    Unknown,
}

impl TrafficLabel {
    /// Classify a trip from its free-flow and (optional) traffic-aware duration.
    pub fn classify(free_flow_secs: f64, traffic_secs: Option<f64>) -> Self {
        let Some(traffic) = traffic_secs else {
            return TrafficLabel::Unknown;
        };
        if free_flow_secs <= 0.0 {
            return TrafficLabel::Unknown;
        }

        let ratio = traffic / free_flow_secs;
        if ratio > 1.3 {
            TrafficLabel::Heavy
        } else if ratio > 1.1 {
            TrafficLabel::Moderate
        } else {
            TrafficLabel::Light
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficLabel::Light => "Light",
            TrafficLabel::Moderate => "Moderate",
            TrafficLabel::Heavy => "Heavy",
            TrafficLabel::Unknown => "Unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Light" => TrafficLabel::Light,
            "Moderate" => TrafficLabel::Moderate,
            "Heavy" => TrafficLabel::Heavy,
            _ => TrafficLabel::Unknown,
        }
    }
}

impl std::fmt::Display for TrafficLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Car travel estimate for one origin/destination pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEstimate {
    /// Traffic-aware duration when available, otherwise free-flow
    pub duration_seconds: u64,
    pub traffic_label: TrafficLabel,
    pub route_summary: String,
    pub distance_meters: u64,
}

// ============================================================================
// Stored rows
// ============================================================================

/// A captured bike-vs-car comparison, keyed by activity id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficComparison {
    pub activity_id: i64,
    pub activity_name: String,
    pub ride_date: DateTime<Utc>,
    pub bike_time_minutes: f64,
    pub car_time_minutes: f64,
    pub time_saved_minutes: f64,
    pub time_saved_pct: f64,
    pub distance_miles: f64,
    pub bike_speed_mph: f64,
    pub car_speed_mph: f64,
    pub traffic_label: TrafficLabel,
    pub route_summary: String,
    pub captured_at: DateTime<Utc>,
    pub start: LatLng,
    pub end: LatLng,
}

/// Derived comparison metrics. Always computed from scratch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComparisonMetrics {
    pub time_saved_minutes: f64,
    pub time_saved_pct: f64,
    pub bike_speed_mph: f64,
    pub car_speed_mph: f64,
}

impl ComparisonMetrics {
    pub fn compute(bike_time_minutes: f64, car_time_minutes: f64, distance_miles: f64) -> Self {
        let time_saved_minutes = car_time_minutes - bike_time_minutes;
        let time_saved_pct = if car_time_minutes > 0.0 {
            time_saved_minutes / car_time_minutes * 100.0
        } else {
            0.0
        };

        Self {
            time_saved_minutes,
            time_saved_pct,
            bike_speed_mph: speed_mph(distance_miles, bike_time_minutes),
            car_speed_mph: speed_mph(distance_miles, car_time_minutes),
        }
    }
}

fn speed_mph(distance_miles: f64, minutes: f64) -> f64 {
    if minutes > 0.0 {
        distance_miles / (minutes / 60.0)
    } else {
        0.0
    }
}

/// An activity whose enrichment failed and is queued for bounded retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCapture {
    pub activity_id: i64,
    pub activity_name: String,
    pub ride_date: DateTime<Utc>,
    pub bike_time_minutes: f64,
    pub distance_miles: f64,
    pub bike_speed_mph: f64,
    pub start: LatLng,
    pub end: LatLng,
    pub discovered_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl PendingCapture {
    /// Snapshot an activity for later retry. `None` when coordinates are missing,
    /// since such an activity can never be enriched.
    pub fn from_activity(activity: &Activity, discovered_at: DateTime<Utc>) -> Option<Self> {
        let (start, end) = activity.endpoints()?;
        let bike_time_minutes = activity.bike_time_minutes();
        let distance_miles = activity.distance_miles();

        Some(Self {
            activity_id: activity.id,
            activity_name: activity.name.clone(),
            ride_date: activity.start_date,
            bike_time_minutes,
            distance_miles,
            bike_speed_mph: speed_mph(distance_miles, bike_time_minutes),
            start,
            end,
            discovered_at,
            retry_count: 0,
        })
    }
}

/// The ride-side facts a comparison is built from. Both fresh activities and
/// pending rows reduce to this.
#[derive(Debug, Clone, PartialEq)]
pub struct RideSnapshot {
    pub activity_id: i64,
    pub activity_name: String,
    pub ride_date: DateTime<Utc>,
    pub bike_time_minutes: f64,
    pub distance_miles: f64,
    pub start: LatLng,
    pub end: LatLng,
}

impl RideSnapshot {
    pub fn from_activity(activity: &Activity) -> Option<Self> {
        let (start, end) = activity.endpoints()?;
        Some(Self {
            activity_id: activity.id,
            activity_name: activity.name.clone(),
            ride_date: activity.start_date,
            bike_time_minutes: activity.bike_time_minutes(),
            distance_miles: activity.distance_miles(),
            start,
            end,
        })
    }

    pub fn from_pending(pending: &PendingCapture) -> Self {
        Self {
            activity_id: pending.activity_id,
            activity_name: pending.activity_name.clone(),
            ride_date: pending.ride_date,
            bike_time_minutes: pending.bike_time_minutes,
            distance_miles: pending.distance_miles,
            start: pending.start,
            end: pending.end,
        }
    }

    /// Combine with a route estimate into a storable comparison.
    pub fn compare(&self, estimate: &RouteEstimate, captured_at: DateTime<Utc>) -> TrafficComparison {
        let car_time_minutes = estimate.duration_seconds as f64 / 60.0;
        let metrics =
            ComparisonMetrics::compute(self.bike_time_minutes, car_time_minutes, self.distance_miles);

        TrafficComparison {
            activity_id: self.activity_id,
            activity_name: self.activity_name.clone(),
            ride_date: self.ride_date,
            bike_time_minutes: self.bike_time_minutes,
            car_time_minutes,
            time_saved_minutes: metrics.time_saved_minutes,
            time_saved_pct: metrics.time_saved_pct,
            distance_miles: self.distance_miles,
            bike_speed_mph: metrics.bike_speed_mph,
            car_speed_mph: metrics.car_speed_mph,
            traffic_label: estimate.traffic_label,
            route_summary: estimate.route_summary.clone(),
            captured_at,
            start: self.start,
            end: self.end,
        }
    }
}

// ============================================================================
// Watermark
// ============================================================================

/// Highest activity id already present in the comparison store.
///
/// Computed from the store on demand and passed by value; never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Watermark(pub Option<i64>);

impl Watermark {
    /// Whether an activity id is above the watermark and therefore new.
    pub fn admits(&self, activity_id: i64) -> bool {
        match self.0 {
            Some(max) => activity_id > max,
            None => true,
        }
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// RFC 3339 UTC with second precision, so lexical order is chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_activity() -> Activity {
        Activity {
            id: 101,
            name: "Morning Commute".to_string(),
            sport_type: "Ride".to_string(),
            start_date: Utc.with_ymd_and_hms(2024, 5, 1, 7, 30, 0).unwrap(),
            distance_meters: 13_196.5,
            moving_time_secs: 1530,
            total_elevation_gain: 42.0,
            average_speed: 8.6,
            max_speed: 13.1,
            start: Some(LatLng::new(47.6062, -122.3321)),
            end: Some(LatLng::new(47.6205, -122.3493)),
        }
    }

    #[test]
    fn test_traffic_label_thresholds() {
        assert_eq!(TrafficLabel::classify(1000.0, Some(1400.0)), TrafficLabel::Heavy);
        assert_eq!(TrafficLabel::classify(1000.0, Some(1150.0)), TrafficLabel::Moderate);
        assert_eq!(TrafficLabel::classify(1000.0, Some(1050.0)), TrafficLabel::Light);
        assert_eq!(TrafficLabel::classify(1000.0, None), TrafficLabel::Unknown);
    }

    #[test]
    fn test_traffic_label_boundaries() {
        // Upper bounds are inclusive
        assert_eq!(TrafficLabel::classify(1000.0, Some(1300.0)), TrafficLabel::Moderate);
        assert_eq!(TrafficLabel::classify(1000.0, Some(1100.0)), TrafficLabel::Light);
        assert_eq!(TrafficLabel::classify(1000.0, Some(900.0)), TrafficLabel::Light);
        assert_eq!(TrafficLabel::classify(0.0, Some(900.0)), TrafficLabel::Unknown);
    }

    #[test]
    fn test_traffic_label_round_trip_names() {
        for label in [
            TrafficLabel::Light,
            TrafficLabel::Moderate,
            TrafficLabel::Heavy,
            TrafficLabel::Unknown,
        ] {
            assert_eq!(TrafficLabel::parse(label.as_str()), label);
        }
        assert_eq!(TrafficLabel::parse("Gridlock"), TrafficLabel::Unknown);
    }

    #[test]
    fn test_metric_law() {
        for (bike, car) in [(25.5, 35.2), (28.0, 45.8), (15.2, 12.1), (10.0, 0.5)] {
            let m = ComparisonMetrics::compute(bike, car, 8.2);
            assert_eq!(m.time_saved_minutes, car - bike);
            assert_eq!(m.time_saved_pct, (car - bike) / car * 100.0);
        }
    }

    #[test]
    fn test_metrics_zero_durations() {
        let m = ComparisonMetrics::compute(0.0, 0.0, 5.0);
        assert_eq!(m.time_saved_pct, 0.0);
        assert_eq!(m.bike_speed_mph, 0.0);
        assert_eq!(m.car_speed_mph, 0.0);
    }

    #[test]
    fn test_speeds() {
        let m = ComparisonMetrics::compute(30.0, 20.0, 10.0);
        assert!((m.bike_speed_mph - 20.0).abs() < 1e-9);
        assert!((m.car_speed_mph - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_endpoints_require_both() {
        let mut activity = sample_activity();
        assert!(activity.endpoints().is_some());
        activity.end = None;
        assert!(activity.endpoints().is_none());
        assert!(RideSnapshot::from_activity(&activity).is_none());
        assert!(PendingCapture::from_activity(&activity, Utc::now()).is_none());
    }

    #[test]
    fn test_latlng_from_slice() {
        assert_eq!(LatLng::from_slice(&[1.0, 2.0]), Some(LatLng::new(1.0, 2.0)));
        assert_eq!(LatLng::from_slice(&[]), None);
        assert_eq!(LatLng::from_slice(&[1.0]), None);
    }

    #[test]
    fn test_snapshot_compare() {
        let activity = sample_activity();
        let snapshot = RideSnapshot::from_activity(&activity).unwrap();
        let estimate = RouteEstimate {
            duration_seconds: 2112,
            traffic_label: TrafficLabel::Moderate,
            route_summary: "I-5 S".to_string(),
            distance_meters: 14_000,
        };
        let captured_at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let cmp = snapshot.compare(&estimate, captured_at);

        assert_eq!(cmp.activity_id, 101);
        assert_eq!(cmp.bike_time_minutes, 25.5);
        assert_eq!(cmp.car_time_minutes, 35.2);
        assert_eq!(cmp.time_saved_minutes, 35.2 - 25.5);
        assert_eq!(cmp.traffic_label, TrafficLabel::Moderate);
        assert_eq!(cmp.captured_at, captured_at);
    }

    #[test]
    fn test_pending_and_fresh_snapshots_agree() {
        let activity = sample_activity();
        let pending = PendingCapture::from_activity(&activity, Utc::now()).unwrap();
        assert_eq!(pending.retry_count, 0);
        assert_eq!(
            RideSnapshot::from_pending(&pending),
            RideSnapshot::from_activity(&activity).unwrap()
        );
    }

    #[test]
    fn test_watermark_admits() {
        assert!(Watermark(None).admits(1));
        assert!(Watermark(Some(10)).admits(11));
        assert!(!Watermark(Some(10)).admits(10));
        assert!(!Watermark(Some(10)).admits(3));
    }

    #[test]
    fn test_timestamp_format() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 7, 30, 0).unwrap();
        let s = format_timestamp(&ts);
        assert_eq!(s, "2024-05-01T07:30:00Z");
        assert_eq!(parse_timestamp(&s), Some(ts));
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
