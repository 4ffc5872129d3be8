//! # Traffic Store
//!
//! SQLite persistence for captured comparisons and the pending-capture queue.
//!
//! ## Tables
//!
//! 1. **traffic_comparisons**: one row per captured activity, upserted.
//! 2. **pending_captures**: activities whose enrichment failed, with a retry
//!    counter. Rows at or past the retry bound stay for operator inspection.
//!
//! Every operation is a single statement. Nothing spans both tables, so a crash
//! between "write comparison" and "delete pending" can leave an id in both.
//! The schema is versionless; tables are created if missing.

use rusqlite::{Connection, OptionalExtension, Result as SqlResult, Row, params};

use crate::types::{
    LatLng, PendingCapture, TrafficComparison, TrafficLabel, Watermark, format_timestamp,
    parse_timestamp,
};

/// Single-writer store over one SQLite connection.
pub struct TrafficStore {
    db: Connection,
}

const COMPARISON_COLUMNS: &str = "activity_id, activity_name, ride_date, bike_time_minutes,
     car_time_minutes, time_saved_minutes, time_saved_percentage, distance_miles,
     bike_speed_mph, car_speed_mph, traffic_conditions, route_summary, captured_at,
     start_lat, start_lng, end_lat, end_lng";

const PENDING_COLUMNS: &str = "activity_id, activity_name, ride_date, bike_time_minutes,
     distance_miles, bike_speed_mph, start_lat, start_lng, end_lat, end_lng,
     discovered_at, retry_count";

impl TrafficStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) the store at the given path.
    pub fn open(db_path: &str) -> SqlResult<Self> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;
        Ok(Self { db })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> SqlResult<Self> {
        Self::open(":memory:")
    }

    fn init_schema(conn: &Connection) -> SqlResult<()> {
        conn.execute_batch(
            r#"
            -- Captured bike-vs-car comparisons (upsert per activity)
            CREATE TABLE IF NOT EXISTS traffic_comparisons (
                activity_id INTEGER PRIMARY KEY,
                activity_name TEXT NOT NULL,
                ride_date TEXT NOT NULL,
                bike_time_minutes REAL NOT NULL,
                car_time_minutes REAL NOT NULL,
                time_saved_minutes REAL NOT NULL,
                time_saved_percentage REAL NOT NULL,
                distance_miles REAL NOT NULL,
                bike_speed_mph REAL NOT NULL,
                car_speed_mph REAL NOT NULL,
                traffic_conditions TEXT NOT NULL,
                route_summary TEXT NOT NULL,
                captured_at TEXT NOT NULL,
                start_lat REAL NOT NULL,
                start_lng REAL NOT NULL,
                end_lat REAL NOT NULL,
                end_lng REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_traffic_comparisons_ride_date
            ON traffic_comparisons(ride_date);

            -- Activities waiting for a successful routing call
            CREATE TABLE IF NOT EXISTS pending_captures (
                activity_id INTEGER PRIMARY KEY,
                activity_name TEXT NOT NULL,
                ride_date TEXT NOT NULL,
                bike_time_minutes REAL NOT NULL,
                distance_miles REAL NOT NULL,
                bike_speed_mph REAL NOT NULL,
                start_lat REAL NOT NULL,
                start_lng REAL NOT NULL,
                end_lat REAL NOT NULL,
                end_lng REAL NOT NULL,
                discovered_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
    }

    // ========================================================================
    // Comparisons
    // ========================================================================

    /// Insert or overwrite the comparison for its activity id.
    pub fn upsert_comparison(&self, c: &TrafficComparison) -> SqlResult<()> {
        self.db.execute(
            &format!(
                "INSERT OR REPLACE INTO traffic_comparisons ({COMPARISON_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                c.activity_id,
                c.activity_name,
                format_timestamp(&c.ride_date),
                c.bike_time_minutes,
                c.car_time_minutes,
                c.time_saved_minutes,
                c.time_saved_pct,
                c.distance_miles,
                c.bike_speed_mph,
                c.car_speed_mph,
                c.traffic_label.as_str(),
                c.route_summary,
                format_timestamp(&c.captured_at),
                c.start.lat,
                c.start.lng,
                c.end.lat,
                c.end.lng,
            ],
        )?;
        Ok(())
    }

    /// Highest captured activity id, if any.
    pub fn max_captured_id(&self) -> SqlResult<Option<i64>> {
        self.db
            .query_row("SELECT MAX(activity_id) FROM traffic_comparisons", [], |row| {
                row.get(0)
            })
    }

    /// Current watermark, computed fresh from the comparison table.
    pub fn watermark(&self) -> SqlResult<Watermark> {
        self.max_captured_id().map(Watermark)
    }

    pub fn has_comparison(&self, activity_id: i64) -> SqlResult<bool> {
        self.db.query_row(
            "SELECT EXISTS(SELECT 1 FROM traffic_comparisons WHERE activity_id = ?1)",
            params![activity_id],
            |row| row.get(0),
        )
    }

    pub fn get_comparison(&self, activity_id: i64) -> SqlResult<Option<TrafficComparison>> {
        self.db
            .query_row(
                &format!(
                    "SELECT {COMPARISON_COLUMNS} FROM traffic_comparisons WHERE activity_id = ?1"
                ),
                params![activity_id],
                comparison_from_row,
            )
            .optional()
    }

    /// All comparisons, most recent ride first.
    pub fn list_all_comparisons(&self) -> SqlResult<Vec<TrafficComparison>> {
        let mut stmt = self.db.prepare(&format!(
            "SELECT {COMPARISON_COLUMNS} FROM traffic_comparisons
             ORDER BY ride_date DESC, activity_id DESC"
        ))?;
        let rows = stmt.query_map([], comparison_from_row)?;
        rows.collect()
    }

    pub fn comparison_count(&self) -> SqlResult<u32> {
        self.db
            .query_row("SELECT COUNT(*) FROM traffic_comparisons", [], |row| row.get(0))
    }

    // ========================================================================
    // Pending captures
    // ========================================================================

    /// Insert or replace a pending row. Replacing restarts `retry_count` at 0.
    pub fn upsert_pending(&self, p: &PendingCapture) -> SqlResult<()> {
        self.db.execute(
            &format!(
                "INSERT OR REPLACE INTO pending_captures ({PENDING_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)"
            ),
            params![
                p.activity_id,
                p.activity_name,
                format_timestamp(&p.ride_date),
                p.bike_time_minutes,
                p.distance_miles,
                p.bike_speed_mph,
                p.start.lat,
                p.start.lng,
                p.end.lat,
                p.end.lng,
                format_timestamp(&p.discovered_at),
            ],
        )?;
        Ok(())
    }

    /// Returns whether a row was deleted.
    pub fn delete_pending(&self, activity_id: i64) -> SqlResult<bool> {
        let n = self.db.execute(
            "DELETE FROM pending_captures WHERE activity_id = ?1",
            params![activity_id],
        )?;
        Ok(n > 0)
    }

    /// Bump the retry counter in place. Returns the new count, or `None` if the
    /// row no longer exists.
    pub fn increment_retry(&self, activity_id: i64) -> SqlResult<Option<u32>> {
        self.db
            .query_row(
                "UPDATE pending_captures SET retry_count = retry_count + 1
                 WHERE activity_id = ?1
                 RETURNING retry_count",
                params![activity_id],
                |row| row.get(0),
            )
            .optional()
    }

    /// Pending rows still eligible for retry (`retry_count < bound`), oldest first.
    pub fn list_pending(&self, bound: u32) -> SqlResult<Vec<PendingCapture>> {
        let mut stmt = self.db.prepare(&format!(
            "SELECT {PENDING_COLUMNS} FROM pending_captures
             WHERE retry_count < ?1
             ORDER BY discovered_at ASC, activity_id ASC"
        ))?;
        let rows = stmt.query_map(params![bound], pending_from_row)?;
        rows.collect()
    }

    /// Pending rows that exhausted their retries (`retry_count >= bound`).
    pub fn list_abandoned(&self, bound: u32) -> SqlResult<Vec<PendingCapture>> {
        let mut stmt = self.db.prepare(&format!(
            "SELECT {PENDING_COLUMNS} FROM pending_captures
             WHERE retry_count >= ?1
             ORDER BY discovered_at ASC, activity_id ASC"
        ))?;
        let rows = stmt.query_map(params![bound], pending_from_row)?;
        rows.collect()
    }

    pub fn get_pending(&self, activity_id: i64) -> SqlResult<Option<PendingCapture>> {
        self.db
            .query_row(
                &format!("SELECT {PENDING_COLUMNS} FROM pending_captures WHERE activity_id = ?1"),
                params![activity_id],
                pending_from_row,
            )
            .optional()
    }

    /// Whether the id is queued, whether or not its retries are exhausted.
    pub fn has_pending(&self, activity_id: i64) -> SqlResult<bool> {
        self.db.query_row(
            "SELECT EXISTS(SELECT 1 FROM pending_captures WHERE activity_id = ?1)",
            params![activity_id],
            |row| row.get(0),
        )
    }

    pub fn pending_count(&self) -> SqlResult<u32> {
        self.db
            .query_row("SELECT COUNT(*) FROM pending_captures", [], |row| row.get(0))
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn timestamp_column(row: &Row<'_>, idx: usize) -> SqlResult<chrono::DateTime<chrono::Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid timestamp '{}'", raw).into(),
        )
    })
}

fn comparison_from_row(row: &Row<'_>) -> SqlResult<TrafficComparison> {
    let label: String = row.get(10)?;
    Ok(TrafficComparison {
        activity_id: row.get(0)?,
        activity_name: row.get(1)?,
        ride_date: timestamp_column(row, 2)?,
        bike_time_minutes: row.get(3)?,
        car_time_minutes: row.get(4)?,
        time_saved_minutes: row.get(5)?,
        time_saved_pct: row.get(6)?,
        distance_miles: row.get(7)?,
        bike_speed_mph: row.get(8)?,
        car_speed_mph: row.get(9)?,
        traffic_label: TrafficLabel::parse(&label),
        route_summary: row.get(11)?,
        captured_at: timestamp_column(row, 12)?,
        start: LatLng::new(row.get(13)?, row.get(14)?),
        end: LatLng::new(row.get(15)?, row.get(16)?),
    })
}

fn pending_from_row(row: &Row<'_>) -> SqlResult<PendingCapture> {
    Ok(PendingCapture {
        activity_id: row.get(0)?,
        activity_name: row.get(1)?,
        ride_date: timestamp_column(row, 2)?,
        bike_time_minutes: row.get(3)?,
        distance_miles: row.get(4)?,
        bike_speed_mph: row.get(5)?,
        start: LatLng::new(row.get(6)?, row.get(7)?),
        end: LatLng::new(row.get(8)?, row.get(9)?),
        discovered_at: timestamp_column(row, 10)?,
        retry_count: row.get(11)?,
    })
}

// ============================================================================
// Tests
// ============================================================================
