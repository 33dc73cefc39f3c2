//! Window aggregation.
//!
//! Computes one `WindowResult` for a cutoff by querying a `MetricSource`:
//!
//! 1. Account, workload and expiry counters
//! 2. Per-application workload groups (count + distinct owners)
//! 3. Per-application shared-user counts via delegated tokens
//! 4. A merge pass folding per-application expiry counts into the groups
//!
//! Expiry records do not carry the same keys as live workloads, so step 4
//! correlates by application id and creates entries for applications that
//! only show up on the deletion side.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{AppBreakdown, ExpiryKind, WindowResult};
use crate::source::{ExpiryGroup, MetricSource, SourceError};

/// How to resolve more than one shared-user count row for an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DuplicateRowPolicy {
    /// Keep the first row in source order.
    #[default]
    FirstWins,
    /// Add all rows together.
    Sum,
}

impl DuplicateRowPolicy {
    fn resolve(&self, rows: &[u64]) -> Option<u64> {
        match self {
            DuplicateRowPolicy::FirstWins => rows.first().copied(),
            DuplicateRowPolicy::Sum if rows.is_empty() => None,
            DuplicateRowPolicy::Sum => Some(rows.iter().sum()),
        }
    }
}

/// Computes window results against a metric source.
pub struct WindowAggregator<'a> {
    source: &'a dyn MetricSource,
    duplicate_rows: DuplicateRowPolicy,
}

impl<'a> WindowAggregator<'a> {
    pub fn new(source: &'a dyn MetricSource) -> Self {
        Self {
            source,
            duplicate_rows: DuplicateRowPolicy::default(),
        }
    }

    /// Set the policy for duplicate shared-user rows.
    pub fn with_duplicate_rows(mut self, policy: DuplicateRowPolicy) -> Self {
        self.duplicate_rows = policy;
        self
    }

    /// Compute the metrics for everything active at or after `cutoff`.
    ///
    /// Any source failure aborts the whole computation; no partial result is returned.
    pub fn compute(&self, cutoff: DateTime<Utc>) -> Result<WindowResult, SourceError> {
        let active_accounts = self.source.count_active_accounts(cutoff)?;
        let active_workloads = self.source.count_active_workloads(cutoff)?;
        let expired_transient_accounts = self.source.count_expired(ExpiryKind::DemoAccount, cutoff)?;
        let expired_transient_app_accounts =
            self.source.count_expired(ExpiryKind::AppDemoAccount, cutoff)?;
        let expired_workloads = self
            .source
            .count_expired(ExpiryKind::DeletedWorkload, cutoff)?;

        let mut apps = self.group_apps(cutoff)?;
        self.attach_shared_users(&mut apps, cutoff)?;
        merge_expiry_groups(&mut apps, self.source.group_expired_by_app(cutoff)?);

        Ok(WindowResult {
            active_accounts,
            expired_transient_accounts,
            expired_transient_app_accounts,
            active_workloads: active_workloads + expired_workloads,
            apps,
        })
    }

    fn group_apps(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<BTreeMap<String, AppBreakdown>, SourceError> {
        Ok(self
            .source
            .group_workloads_by_app(cutoff)?
            .into_iter()
            .map(|group| {
                (
                    group.app_id,
                    AppBreakdown {
                        workload_count: group.workload_count,
                        distinct_owners: group.distinct_owners,
                        ..Default::default()
                    },
                )
            })
            .collect())
    }

    fn attach_shared_users(
        &self,
        apps: &mut BTreeMap<String, AppBreakdown>,
        cutoff: DateTime<Utc>,
    ) -> Result<(), SourceError> {
        for (app_id, app) in apps.iter_mut() {
            // Delegated tokens only know their workload, so resolve the app's workloads first.
            let workload_ids = self.source.workload_ids_for_app(app_id, cutoff)?;
            let rows = self.source.count_shared_identities(&workload_ids, cutoff)?;
            if rows.len() > 1 {
                warn!(
                    app_id = %app_id,
                    rows = rows.len(),
                    policy = ?self.duplicate_rows,
                    "shared-user aggregation returned multiple rows"
                );
            }
            app.shared_user_count = self.duplicate_rows.resolve(&rows);
        }
        Ok(())
    }
}

/// Fold per-application expiry counts into the app map, creating entries as needed.
fn merge_expiry_groups(apps: &mut BTreeMap<String, AppBreakdown>, groups: Vec<ExpiryGroup>) {
    for group in groups {
        let app = apps.entry(group.app_id).or_default();
        match group.kind {
            ExpiryKind::AppDemoAccount => app.expired_transient_app_user_count = Some(group.count),
            ExpiryKind::DeletedWorkload => app.deleted_workload_count = Some(group.count),
            ExpiryKind::DemoWorkload => app.expired_demo_workload_count = Some(group.count),
            // Demo accounts are not tied to one application
            ExpiryKind::DemoAccount => {}
        }
    }
    apps.retain(|_, app| !app.is_empty());
}
