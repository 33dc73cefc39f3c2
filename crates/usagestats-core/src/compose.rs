//! Snapshot composition.
//!
//! Runs the window aggregator once per horizon and assembles a single
//! `Snapshot` with the plan distribution and its own compute cost.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::aggregate::{DuplicateRowPolicy, WindowAggregator};
use crate::model::{Horizon, Snapshot};
use crate::source::{MetricSource, SourceError};

/// Builds snapshots from a metric source. Reads only; no side effects.
pub struct SnapshotComposer<S> {
    source: S,
    duplicate_rows: DuplicateRowPolicy,
}

impl<S: MetricSource> SnapshotComposer<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            duplicate_rows: DuplicateRowPolicy::default(),
        }
    }

    pub fn with_duplicate_rows(mut self, policy: DuplicateRowPolicy) -> Self {
        self.duplicate_rows = policy;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Build the snapshot for `now`, refreshing the source first.
    pub fn build(&self, now: DateTime<Utc>) -> Result<Snapshot, SourceError> {
        let started = Instant::now();
        self.source.refresh()?;
        let aggregator =
            WindowAggregator::new(&self.source).with_duplicate_rows(self.duplicate_rows);

        let mut windows = BTreeMap::new();
        for horizon in Horizon::ALL {
            windows.insert(horizon, aggregator.compute(horizon.cutoff(now))?);
        }
        let plan_distribution = self.source.count_paying_accounts_by_plan()?;

        Ok(Snapshot {
            id: Uuid::new_v4(),
            timestamp: now,
            windows,
            plan_distribution,
            compute_duration_ms: started.elapsed().as_millis() as u64,
            server_history_depth: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Account, ExpiryKind, ExpiryRecord, Workload};
    use crate::source::{FileSource, MemorySource, SourceRecords};
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
    }

    fn source() -> MemorySource {
        let source = MemorySource::new();
        for (id, days_ago, plan, payment) in [
            ("u1", 0, Some("standard"), Some("cus_1")),
            ("u2", 3, Some("standard"), Some("cus_2")),
            ("u3", 20, None, None),
            ("u4", 400, Some("large"), Some("cus_4")),
        ] {
            source
                .insert_account(Account {
                    id: id.to_string(),
                    expires: None,
                    authenticated: true,
                    last_active: Some(now() - Duration::days(days_ago)),
                    plan: plan.map(String::from),
                    payment_id: payment.map(String::from),
                })
                .unwrap();
        }
        source
            .insert_workload(Workload {
                id: "w1".to_string(),
                app_id: "A".to_string(),
                owner_id: "u1".to_string(),
                last_used: Some(now() - Duration::hours(1)),
            })
            .unwrap();
        source
            .insert_expiry_record(ExpiryRecord {
                kind: ExpiryKind::DeletedWorkload,
                app_id: Some("B".to_string()),
                last_activity: now() - Duration::days(10),
            })
            .unwrap();
        source
    }

    #[test]
    fn test_build_covers_all_horizons() {
        let composer = SnapshotComposer::new(source());
        let snapshot = composer.build(now()).unwrap();

        assert_eq!(snapshot.timestamp, now());
        assert_eq!(snapshot.windows.len(), 4);
        assert_eq!(snapshot.window(Horizon::Daily).unwrap().active_accounts, 1);
        assert_eq!(snapshot.window(Horizon::Weekly).unwrap().active_accounts, 2);
        assert_eq!(snapshot.window(Horizon::Monthly).unwrap().active_accounts, 3);
        assert_eq!(snapshot.window(Horizon::Forever).unwrap().active_accounts, 4);

        assert!(!snapshot.window(Horizon::Weekly).unwrap().apps.contains_key("B"));
        assert!(snapshot.window(Horizon::Monthly).unwrap().apps.contains_key("B"));
        assert_eq!(snapshot.server_history_depth, None);
    }

    #[test]
    fn test_forever_window_matches_epoch_compute() {
        let composer = SnapshotComposer::new(source());
        let snapshot = composer.build(now()).unwrap();

        let direct = WindowAggregator::new(composer.source())
            .compute(DateTime::<Utc>::UNIX_EPOCH)
            .unwrap();
        assert_eq!(snapshot.windows[&Horizon::Forever], direct);
    }

    fn write_records(path: &std::path::Path, workload_ids: &[&str]) {
        let records = SourceRecords {
            workloads: workload_ids
                .iter()
                .map(|id| Workload {
                    id: id.to_string(),
                    app_id: "A".to_string(),
                    owner_id: "u1".to_string(),
                    last_used: Some(now() - Duration::hours(1)),
                })
                .collect(),
            ..Default::default()
        };
        std::fs::write(path, serde_json::to_string(&records).unwrap()).unwrap();
    }

    #[test]
    fn test_build_reloads_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        write_records(&path, &["w1"]);
        let composer = SnapshotComposer::new(FileSource::open(&path).unwrap());

        let first = composer.build(now()).unwrap();
        assert_eq!(first.window(Horizon::Daily).unwrap().active_workloads, 1);

        write_records(&path, &["w1", "w2", "w3"]);
        let second = composer.build(now() + Duration::days(1)).unwrap();
        let weekly = second.window(Horizon::Weekly).unwrap();
        assert_eq!(weekly.active_workloads, 3);
        assert_eq!(weekly.apps["A"].workload_count, 3);

        // An unreadable file fails the snapshot and keeps the last good copy
        std::fs::write(&path, "{ truncated").unwrap();
        assert!(matches!(
            composer.build(now() + Duration::days(2)),
            Err(SourceError::Load(_))
        ));
        assert_eq!(
            composer
                .source()
                .count_active_workloads(DateTime::<Utc>::UNIX_EPOCH)
                .unwrap(),
            3
        );
    }

    #[test]
    fn test_plan_distribution() {
        let composer = SnapshotComposer::new(Arc::new(source()));
        let snapshot = composer.build(now()).unwrap();

        let mut expected = BTreeMap::new();
        expected.insert("large".to_string(), 1);
        expected.insert("standard".to_string(), 2);
        assert_eq!(snapshot.plan_distribution, expected);
    }
}
