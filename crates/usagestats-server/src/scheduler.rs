//! Daily rollup scheduler.
//!
//! The scheduler waits until the next wall-clock anchor (10:00 UTC), then
//! produces one snapshot every 24 hours measured from that anchor:
//!
//! ```text
//!   Idle ──(first anchor)──▶ Running ──(anchor + 24h)──▶ Running ...
//! ```
//!
//! Each tick composes a snapshot, appends it to the history, publishes it to
//! live subscribers and then runs the onboarding / reporting side effects.
//! Only the designated writer replica runs a scheduler.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use usagestats_core::config::{ANCHOR_HOUR_UTC, REPORTING_HISTORY_THRESHOLD, ROLLUP_CADENCE_SECS};
use usagestats_core::{
    AccessToken, DuplicateRowPolicy, MetricSource, SettingsStore, Snapshot, SnapshotComposer,
    SnapshotStore, SourceError, StoreError,
};

use crate::notify::Notifier;
use crate::telemetry::TelemetryReporter;

/// Message sent to administrators when reporting consent is first requested.
pub const CONSENT_NOTIFICATION: &str =
    "You can help improve the platform by sending anonymous usage statistics. Click here for more info.";

/// Admin page the consent notification links to.
pub const CONSENT_LINK_PATH: &str = "/admin/stats";

/// Errors that end a single tick. The next tick still runs on schedule.
#[derive(Debug, Error)]
pub enum RollupError {
    /// A metric source query failed; no snapshot was produced.
    #[error("Snapshot computation failed: {0}")]
    Source(#[from] SourceError),

    /// The snapshot could not be appended to the history.
    #[error("Failed to persist snapshot: {0}")]
    Persist(#[source] StoreError),

    /// The settings row could not be read or written.
    #[error("Settings store failure: {0}")]
    Settings(#[source] StoreError),
}

/// Observable scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Waiting for the first anchor.
    Idle { first_tick: DateTime<Utc> },
    /// Steady cadence; `ticks` counts completed tick attempts.
    Running { ticks: u64 },
    /// Shut down.
    Stopped,
}

/// Outcome of one successful tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub snapshot: Arc<Snapshot>,
    /// Stored snapshots after this tick's append.
    pub history_depth: u64,
    /// The one-time consent notification was sent on this tick.
    pub notified: bool,
    /// The snapshot was delivered to the telemetry collector.
    pub reported: bool,
}

/// Next anchor strictly after `now`.
///
/// When `now` falls exactly on an anchor the following day's anchor is returned.
pub fn next_anchor(now: DateTime<Utc>) -> DateTime<Utc> {
    let day_ms = (ROLLUP_CADENCE_SECS * 1000) as i64;
    let offset_ms = i64::from(ANCHOR_HOUR_UTC) * 60 * 60 * 1000;
    let elapsed = (now.timestamp_millis() - offset_ms).rem_euclid(day_ms);
    now + Duration::milliseconds(day_ms - elapsed)
}

/// Ensure an access token exists, issuing one if the store has none.
///
/// Called once at process start on every replica.
pub fn bootstrap_access_token(settings: &dyn SettingsStore) -> Result<AccessToken, StoreError> {
    let had_token = settings.access_token()?.is_some();
    let token = settings.ensure_access_token()?;
    if !had_token {
        info!("issued new stats access token");
    }
    Ok(token)
}

fn settings_failure(e: StoreError) -> RollupError {
    error!(error = %e, "settings store failure, skipping onboarding and reporting");
    RollupError::Settings(e)
}

/// Produces and persists snapshots on the daily cadence.
pub struct RollupScheduler {
    composer: SnapshotComposer<Arc<dyn MetricSource>>,
    snapshots: Arc<dyn SnapshotStore>,
    settings: Arc<dyn SettingsStore>,
    notifier: Arc<dyn Notifier>,
    reporter: Option<TelemetryReporter>,
    publisher: Option<broadcast::Sender<Arc<Snapshot>>>,
    state: watch::Sender<SchedulerState>,
}

impl RollupScheduler {
    pub fn new(
        source: Arc<dyn MetricSource>,
        snapshots: Arc<dyn SnapshotStore>,
        settings: Arc<dyn SettingsStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle {
            first_tick: next_anchor(Utc::now()),
        });
        Self {
            composer: SnapshotComposer::new(source),
            snapshots,
            settings,
            notifier,
            reporter: None,
            publisher: None,
            state,
        }
    }

    /// Report to a telemetry collector when consent allows it.
    pub fn with_reporter(mut self, reporter: Option<TelemetryReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Publish every persisted snapshot on a broadcast channel.
    pub fn with_publisher(mut self, publisher: broadcast::Sender<Arc<Snapshot>>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_duplicate_rows(mut self, policy: DuplicateRowPolicy) -> Self {
        self.composer = self.composer.with_duplicate_rows(policy);
        self
    }

    /// Watch scheduler state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Run until `shutdown` changes or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let now = Utc::now();
        let first_tick = next_anchor(now);
        let delay = (first_tick - now).to_std().unwrap_or_default();
        let cadence = StdDuration::from_secs(ROLLUP_CADENCE_SECS);
        let mut deadline = Instant::now() + delay;
        let mut ticks = 0u64;

        self.state.send_replace(SchedulerState::Idle { first_tick });
        info!(%first_tick, "rollup scheduler waiting for first anchor");

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = shutdown.changed() => {
                    info!("rollup scheduler shutting down");
                    break;
                }
            }

            // Failures are logged inside tick; the next anchor is attempted regardless.
            let _ = self.tick(Utc::now()).await;
            ticks += 1;
            self.state.send_replace(SchedulerState::Running { ticks });
            deadline += cadence;
        }

        self.state.send_replace(SchedulerState::Stopped);
    }

    /// Produce, persist and publish one snapshot for `now`, then run side effects.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, RollupError> {
        debug!(%now, "rollup tick starting");
        let snapshot = match self.composer.build(now) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "metric source failure, skipping rollup tick");
                return Err(e.into());
            }
        };

        if let Err(e) = self.snapshots.append(&snapshot) {
            error!(error = %e, timestamp = %snapshot.timestamp, "failed to persist snapshot");
            return Err(RollupError::Persist(e));
        }
        let history_depth = self.snapshots.count().map_err(|e| {
            error!(error = %e, "failed to count stored snapshots");
            RollupError::Persist(e)
        })?;
        info!(
            history_depth,
            compute_ms = snapshot.compute_duration_ms,
            "recorded usage snapshot"
        );

        let snapshot = Arc::new(snapshot);
        if let Some(publisher) = &self.publisher {
            // No live subscribers is not an error
            let _ = publisher.send(snapshot.clone());
        }

        let mut report = TickReport {
            snapshot,
            history_depth,
            notified: false,
            reported: false,
        };
        if history_depth < REPORTING_HISTORY_THRESHOLD {
            return Ok(report);
        }

        if self
            .settings
            .init_consent_if_absent()
            .map_err(settings_failure)?
        {
            report.notified = self.notify_consent();
            return Ok(report);
        }

        let consent = self.settings.consent().map_err(settings_failure)?;
        if consent.map_or(false, |c| c.allows_transmission()) {
            match &self.reporter {
                Some(reporter) => {
                    let outgoing = report.snapshot.with_history_depth(history_depth);
                    report.reported = reporter.report(&outgoing).await;
                }
                None => debug!("reporting consented but no telemetry endpoint configured"),
            }
        }

        Ok(report)
    }

    fn notify_consent(&self) -> bool {
        match self.notifier.notify(CONSENT_NOTIFICATION, CONSENT_LINK_PATH) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to send consent notification");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_next_anchor_later_same_day() {
        let now = Utc.with_ymd_and_hms(2024, 4, 2, 7, 30, 0).unwrap();
        assert_eq!(
            next_anchor(now),
            Utc.with_ymd_and_hms(2024, 4, 2, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_anchor_rolls_to_next_day() {
        let now = Utc.with_ymd_and_hms(2024, 4, 2, 15, 0, 0).unwrap();
        assert_eq!(
            next_anchor(now),
            Utc.with_ymd_and_hms(2024, 4, 3, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_anchor_exactly_on_anchor() {
        let now = Utc.with_ymd_and_hms(2024, 4, 2, 10, 0, 0).unwrap();
        assert_eq!(
            next_anchor(now),
            Utc.with_ymd_and_hms(2024, 4, 3, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_bootstrap_issues_token_when_absent() {
        let settings = usagestats_core::MemorySettingsStore::new();
        assert!(settings.access_token().unwrap().is_none());

        let token = bootstrap_access_token(&settings).unwrap();
        assert_eq!(token.as_str().len(), 32);
        assert_eq!(settings.access_token().unwrap(), Some(token));
    }

    #[test]
    fn test_bootstrap_keeps_existing_token() {
        let settings = usagestats_core::MemorySettingsStore::new();
        let existing = settings.regenerate_access_token().unwrap();

        assert_eq!(bootstrap_access_token(&settings).unwrap(), existing);
        assert_eq!(bootstrap_access_token(&settings).unwrap(), existing);
        assert_eq!(settings.access_token().unwrap(), Some(existing));
    }

    #[test]
    fn test_next_anchor_crosses_month() {
        let now = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap();
        assert_eq!(
            next_anchor(now),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
    }
}
