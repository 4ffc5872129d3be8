//! # Capture Pipeline
//!
//! Drives one capture cycle at a time:
//!
//! 1. Connectivity gate. Offline ends the cycle with no mutations.
//! 2. Drain: retry pending captures below the retry bound.
//! 3. Discovery: list recent rides, drop ids at or below the watermark and
//!    ids already in the pending queue.
//! 4. Enrich each new ride; store the comparison or queue it as pending.
//!
//! Routing calls are strictly serialized with a fixed spacing between them.
//! A failure on one activity is recorded and the batch continues; only store
//! and ride-source errors abort a cycle.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::config::{Clock, MonitorConfig, system_clock};
use crate::connectivity::ConnectivityProbe;
use crate::error::{CaptureError, OptionExt, OracleError, Result};
use crate::oracle::RouteOracle;
use crate::persistence::TrafficStore;
use crate::poller::{ActivityPoller, LookBack};
use crate::source::RideSource;
use crate::types::{Activity, PendingCapture, RideSnapshot, TrafficComparison, Watermark};

// ============================================================================
// Reports
// ============================================================================

/// Counters for one completed cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Pending rows captured and removed from the queue
    pub drained: u32,
    /// Pending rows whose retry failed again
    pub retry_failed: u32,
    /// Pending rows that reached the retry bound this cycle
    pub abandoned: u32,
    /// Rides returned by the poller
    pub discovered: u32,
    /// Rides at or below the watermark
    pub already_seen: u32,
    /// Rides above the watermark that are owned by the pending queue
    pub already_queued: u32,
    pub captured: u32,
    /// New rides whose routing call failed and were queued
    pub queued: u32,
    pub skipped_missing_coordinates: u32,
    pub watermark: Watermark,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Connectivity gate failed; nothing was attempted
    Offline,
    Completed(CycleReport),
}

/// Counters for a one-shot backfill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub found: u32,
    pub captured: u32,
    pub already_captured: u32,
    /// Routing failed; queued as pending
    pub failed: u32,
    pub skipped_missing_coordinates: u32,
}

/// What happened to a single activity.
#[derive(Debug)]
enum ActivityOutcome {
    Captured(TrafficComparison),
    Queued(OracleError),
    MissingCoordinates,
}

// ============================================================================
// Call pacing
// ============================================================================

/// Enforces the minimum gap between consecutive routing calls within one run.
/// The first call is never delayed.
struct CallPacer {
    spacing: Duration,
    calls: u32,
}

impl CallPacer {
    fn new(spacing: Duration) -> Self {
        Self { spacing, calls: 0 }
    }

    async fn wait_turn(&mut self) {
        if self.calls > 0 && !self.spacing.is_zero() {
            tokio::time::sleep(self.spacing).await;
        }
        self.calls += 1;
    }
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct CapturePipeline<G, O, S> {
    gate: G,
    oracle: O,
    source: S,
    store: TrafficStore,
    config: MonitorConfig,
    clock: Clock,
}

impl<G, O, S> CapturePipeline<G, O, S>
where
    G: ConnectivityProbe,
    O: RouteOracle,
    S: RideSource,
{
    pub fn new(gate: G, oracle: O, source: S, store: TrafficStore, config: MonitorConfig) -> Self {
        Self {
            gate,
            oracle,
            source,
            store,
            config,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Read access for dashboards and reports.
    pub fn store(&self) -> &TrafficStore {
        &self.store
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    // ========================================================================
    // Cycle
    // ========================================================================

    /// Run one full drain + discovery pass. Also the manual "capture now" entry.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        if !self.gate.is_online().await {
            info!("[CapturePipeline] Offline at {}, skipping cycle", self.now().format("%H:%M:%S"));
            return Ok(CycleOutcome::Offline);
        }

        let mut report = CycleReport::default();
        let mut pacer = CallPacer::new(self.config.call_spacing);

        self.drain_pending(&mut pacer, &mut report).await?;

        let watermark = self.store.watermark()?;
        report.watermark = watermark;

        let rides = ActivityPoller::new(&self.source)
            .list_new(self.config.monitor_lookback, self.now())
            .await?;
        report.discovered = rides.len() as u32;

        for activity in rides {
            if !watermark.admits(activity.id) {
                report.already_seen += 1;
                continue;
            }
            // Queued ids belong to the drain phase
            if self.store.has_pending(activity.id)? {
                report.already_queued += 1;
                continue;
            }

            info!(
                "[CapturePipeline] New activity {} '{}'",
                activity.id, activity.name
            );
            match self.enrich_activity(&activity, &mut pacer).await? {
                ActivityOutcome::Captured(c) => {
                    info!(
                        "[CapturePipeline] Captured {}: {:.1} min saved ({})",
                        c.activity_id, c.time_saved_minutes, c.traffic_label
                    );
                    report.captured += 1;
                }
                ActivityOutcome::Queued(e) => {
                    warn!(
                        "[CapturePipeline] Routing failed for {}, queued for retry: {}",
                        activity.id, e
                    );
                    report.queued += 1;
                }
                ActivityOutcome::MissingCoordinates => {
                    report.skipped_missing_coordinates += 1;
                }
            }
        }

        Ok(CycleOutcome::Completed(report))
    }

    /// Retry every pending capture below the retry bound.
    async fn drain_pending(&self, pacer: &mut CallPacer, report: &mut CycleReport) -> Result<()> {
        let policy = self.config.retry;
        let pending = self.store.list_pending(policy.bound)?;
        if pending.is_empty() {
            return Ok(());
        }

        info!("[CapturePipeline] Processing {} pending captures", pending.len());

        for row in pending {
            let snapshot = RideSnapshot::from_pending(&row);
            pacer.wait_turn().await;

            match self
                .oracle
                .estimate(row.start, row.end, Some(row.ride_date))
                .await
            {
                Ok(estimate) => {
                    let comparison = snapshot.compare(&estimate, self.now());
                    self.store.upsert_comparison(&comparison)?;
                    self.store.delete_pending(row.activity_id)?;
                    report.drained += 1;
                    info!(
                        "[CapturePipeline] Pending {} captured after {} retries",
                        row.activity_id, row.retry_count
                    );
                }
                Err(e) => {
                    report.retry_failed += 1;
                    let Some(count) = self.store.increment_retry(row.activity_id)? else {
                        continue;
                    };
                    debug!(
                        "[CapturePipeline] Pending {} failed (attempt {}): {}",
                        row.activity_id, count, e
                    );

                    if count >= policy.bound {
                        report.abandoned += 1;
                        if policy.retain_exhausted {
                            warn!(
                                "[CapturePipeline] Pending {} '{}' exhausted {} retries, parked for inspection",
                                row.activity_id, row.activity_name, count
                            );
                        } else {
                            self.store.delete_pending(row.activity_id)?;
                            warn!(
                                "[CapturePipeline] Pending {} '{}' exhausted {} retries, discarded",
                                row.activity_id, row.activity_name, count
                            );
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Enrich one ride. Routing failures are absorbed into the pending queue;
    /// only store errors escape.
    async fn enrich_activity(
        &self,
        activity: &Activity,
        pacer: &mut CallPacer,
    ) -> Result<ActivityOutcome> {
        let Some(snapshot) = RideSnapshot::from_activity(activity) else {
            info!(
                "[CapturePipeline] Activity {} has no coordinates, skipping permanently",
                activity.id
            );
            return Ok(ActivityOutcome::MissingCoordinates);
        };

        pacer.wait_turn().await;

        match self
            .oracle
            .estimate(snapshot.start, snapshot.end, Some(activity.start_date))
            .await
        {
            Ok(estimate) => {
                let comparison = snapshot.compare(&estimate, self.now());
                self.store.upsert_comparison(&comparison)?;
                Ok(ActivityOutcome::Captured(comparison))
            }
            Err(e) => {
                let pending =
                    PendingCapture::from_activity(activity, self.now()).ok_or_malformed(activity.id)?;
                self.store.upsert_pending(&pending)?;
                Ok(ActivityOutcome::Queued(e))
            }
        }
    }

    // ========================================================================
    // One-shot operations
    // ========================================================================

    /// Capture every ride of the last `days` days that has no comparison yet.
    /// Failures are queued as pending like in a regular cycle.
    pub async fn backfill(&self, days: u32) -> Result<BackfillSummary> {
        if days == 0 {
            return Err(CaptureError::config("backfill window must be at least 1 day"));
        }
        let window = LookBack::Days(days);
        if window.since(self.now()).is_none() {
            return Err(CaptureError::config(format!(
                "backfill window of {} days is out of range",
                days
            )));
        }
        if !self.gate.is_online().await {
            return Err(CaptureError::Offline);
        }

        info!("[CapturePipeline] Backfilling rides from the last {} days", days);

        let rides = ActivityPoller::new(&self.source)
            .list_new(window, self.now())
            .await?;

        let mut summary = BackfillSummary {
            found: rides.len() as u32,
            ..BackfillSummary::default()
        };
        let mut pacer = CallPacer::new(self.config.call_spacing);

        for (i, activity) in rides.iter().enumerate() {
            if self.store.has_comparison(activity.id)? {
                debug!(
                    "[CapturePipeline] [{}/{}] {} already captured",
                    i + 1,
                    rides.len(),
                    activity.id
                );
                summary.already_captured += 1;
                continue;
            }

            match self.enrich_activity(activity, &mut pacer).await? {
                ActivityOutcome::Captured(_) => summary.captured += 1,
                ActivityOutcome::Queued(e) => {
                    warn!(
                        "[CapturePipeline] [{}/{}] Failed to capture {}: {}",
                        i + 1,
                        rides.len(),
                        activity.id,
                        e
                    );
                    summary.failed += 1;
                }
                ActivityOutcome::MissingCoordinates => summary.skipped_missing_coordinates += 1,
            }
        }

        info!(
            "[CapturePipeline] Backfill complete: {} found, {} captured, {} already captured, {} failed",
            summary.found, summary.captured, summary.already_captured, summary.failed
        );
        Ok(summary)
    }

    /// Backfill over the configured `backfill_days` window.
    pub async fn backfill_default(&self) -> Result<BackfillSummary> {
        self.backfill(self.config.backfill_days).await
    }

    /// Capture a single activity by id, fetching its details from the ride source.
    /// A routing failure queues the activity and is returned as the error.
    pub async fn capture_activity(&self, activity_id: i64) -> Result<TrafficComparison> {
        if !self.gate.is_online().await {
            return Err(CaptureError::Offline);
        }

        let activity = self.source.get_activity_details(activity_id).await?;
        let mut pacer = CallPacer::new(self.config.call_spacing);

        match self.enrich_activity(&activity, &mut pacer).await? {
            ActivityOutcome::Captured(c) => Ok(c),
            ActivityOutcome::Queued(e) => Err(e.into()),
            ActivityOutcome::MissingCoordinates => Err(CaptureError::MalformedActivity { activity_id }),
        }
    }

    // ========================================================================
    // Continuous monitoring
    // ========================================================================

    /// Run cycles until `shutdown` turns true. Shutdown is only observed
    /// between cycles, so an in-flight cycle always completes.
    pub async fn monitor(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.config.validate()?;
        info!(
            "[CapturePipeline] Monitoring every {:?} (look-back {:?}, retry bound {})",
            self.config.check_interval, self.config.monitor_lookback, self.config.retry.bound
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle().await {
                Ok(CycleOutcome::Offline) => {}
                Ok(CycleOutcome::Completed(report)) => {
                    info!(
                        "[CapturePipeline] Cycle done: {} captured, {} queued, {} drained, {} still pending, {} abandoned",
                        report.captured,
                        report.queued,
                        report.drained,
                        report.retry_failed - report.abandoned,
                        report.abandoned
                    );
                }
                Err(e) => error!("[CapturePipeline] Cycle aborted: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.check_interval) => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        info!("[CapturePipeline] Monitor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pacer_spaces_calls_after_first() {
        let mut pacer = CallPacer::new(Duration::from_secs(2));
        let start = tokio::time::Instant::now();

        pacer.wait_turn().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_zero_spacing() {
        let mut pacer = CallPacer::new(Duration::ZERO);
        let start = tokio::time::Instant::now();
        for _ in 0..5 {
            pacer.wait_turn().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(pacer.calls, 5);
    }
}
