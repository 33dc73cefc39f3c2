//! Metric sources.
//!
//! A `MetricSource` exposes the four platform record collections (accounts,
//! workloads, delegated tokens, expiry records) through count, group-by and
//! distinct-count primitives, the same shape a document store's aggregation
//! pipeline offers. Window aggregation is written purely against this trait.
//!
//! Every time filter is inclusive: a record qualifies when its activity
//! timestamp is at or after `since`. Records without a timestamp never qualify.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::model::{Account, DelegatedToken, ExpiryKind, ExpiryRecord, Workload};

/// Errors raised by a metric source. Any of them aborts the snapshot in flight.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The backing store could not be reached or is in a broken state.
    #[error("Metric source unavailable: {0}")]
    Unavailable(String),

    /// A query or aggregation failed.
    #[error("Query failed on {collection}: {message}")]
    Query {
        collection: &'static str,
        message: String,
    },

    /// Source records could not be loaded.
    #[error("Failed to load source records: {0}")]
    Load(String),
}

/// Workloads of one application grouped by `app_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppWorkloadGroup {
    pub app_id: String,
    pub workload_count: u64,
    pub distinct_owners: u64,
}

/// Expiry records grouped by `(app_id, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryGroup {
    pub app_id: String,
    pub kind: ExpiryKind,
    pub count: u64,
}

/// Read-only query contract over the platform's record collections.
pub trait MetricSource: Send + Sync {
    /// Bring the source up to date before a snapshot is computed.
    ///
    /// Called once at the start of every snapshot. Sources that are always
    /// live keep the default no-op.
    fn refresh(&self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Count permanent, authenticated accounts active at or after `since`.
    fn count_active_accounts(&self, since: DateTime<Utc>) -> Result<u64, SourceError>;

    /// Count workloads used at or after `since`.
    fn count_active_workloads(&self, since: DateTime<Utc>) -> Result<u64, SourceError>;

    /// Count expiry records of one kind with activity at or after `since`.
    fn count_expired(&self, kind: ExpiryKind, since: DateTime<Utc>) -> Result<u64, SourceError>;

    /// Group workloads used at or after `since` by application.
    fn group_workloads_by_app(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AppWorkloadGroup>, SourceError>;

    /// Identifiers of an application's workloads used at or after `since`.
    fn workload_ids_for_app(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, SourceError>;

    /// Distinct delegated identities with token use at or after `since` on the given workloads.
    ///
    /// Returns the grouped count rows. A well-formed store yields at most one
    /// row; callers must treat extra rows as a consistency anomaly.
    fn count_shared_identities(
        &self,
        workload_ids: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<u64>, SourceError>;

    /// Group expiry records carrying an application id with activity at or after `since`.
    fn group_expired_by_app(&self, since: DateTime<Utc>) -> Result<Vec<ExpiryGroup>, SourceError>;

    /// Count permanent paying accounts per subscription plan.
    fn count_paying_accounts_by_plan(&self) -> Result<BTreeMap<String, u64>, SourceError>;
}

impl<T: MetricSource + ?Sized> MetricSource for Arc<T> {
    fn refresh(&self) -> Result<(), SourceError> {
        (**self).refresh()
    }

    fn count_active_accounts(&self, since: DateTime<Utc>) -> Result<u64, SourceError> {
        (**self).count_active_accounts(since)
    }

    fn count_active_workloads(&self, since: DateTime<Utc>) -> Result<u64, SourceError> {
        (**self).count_active_workloads(since)
    }

    fn count_expired(&self, kind: ExpiryKind, since: DateTime<Utc>) -> Result<u64, SourceError> {
        (**self).count_expired(kind, since)
    }

    fn group_workloads_by_app(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AppWorkloadGroup>, SourceError> {
        (**self).group_workloads_by_app(since)
    }

    fn workload_ids_for_app(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, SourceError> {
        (**self).workload_ids_for_app(app_id, since)
    }

    fn count_shared_identities(
        &self,
        workload_ids: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<u64>, SourceError> {
        (**self).count_shared_identities(workload_ids, since)
    }

    fn group_expired_by_app(&self, since: DateTime<Utc>) -> Result<Vec<ExpiryGroup>, SourceError> {
        (**self).group_expired_by_app(since)
    }

    fn count_paying_accounts_by_plan(&self) -> Result<BTreeMap<String, u64>, SourceError> {
        (**self).count_paying_accounts_by_plan()
    }
}

/// Plan key used for paying accounts that carry no plan identifier.
pub const UNKNOWN_PLAN: &str = "unknown";

/// The four record collections as plain vectors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceRecords {
    pub accounts: Vec<Account>,
    pub workloads: Vec<Workload>,
    pub delegated_tokens: Vec<DelegatedToken>,
    pub expiry_records: Vec<ExpiryRecord>,
}

impl SourceRecords {
    /// Read records from a JSON document.
    pub fn load(path: &Path) -> Result<Self, SourceError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SourceError::Load(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| SourceError::Load(format!("{}: {}", path.display(), e)))
    }
}

/// In-memory metric source.
///
/// Rows come back in ascending key order so the output of every query is
/// deterministic for a given set of records.
#[derive(Debug, Default)]
pub struct MemorySource {
    records: RwLock<SourceRecords>,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source over the given records.
    pub fn from_records(records: SourceRecords) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    /// Load records from a JSON document with `accounts`, `workloads`,
    /// `delegatedTokens` and `expiryRecords` arrays.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        Ok(Self::from_records(SourceRecords::load(path.as_ref())?))
    }

    /// Replace every record collection at once.
    pub fn replace(&self, records: SourceRecords) -> Result<(), SourceError> {
        self.write(|current| *current = records)
    }

    pub fn insert_account(&self, account: Account) -> Result<(), SourceError> {
        self.write(|records| records.accounts.push(account))
    }

    pub fn insert_workload(&self, workload: Workload) -> Result<(), SourceError> {
        self.write(|records| records.workloads.push(workload))
    }

    pub fn insert_delegated_token(&self, token: DelegatedToken) -> Result<(), SourceError> {
        self.write(|records| records.delegated_tokens.push(token))
    }

    pub fn insert_expiry_record(&self, record: ExpiryRecord) -> Result<(), SourceError> {
        self.write(|records| records.expiry_records.push(record))
    }

    fn write(&self, f: impl FnOnce(&mut SourceRecords)) -> Result<(), SourceError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| SourceError::Unavailable("record lock poisoned".to_string()))?;
        f(&mut records);
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, SourceRecords>, SourceError> {
        self.records
            .read()
            .map_err(|_| SourceError::Unavailable("record lock poisoned".to_string()))
    }
}

fn active_since(timestamp: Option<DateTime<Utc>>, since: DateTime<Utc>) -> bool {
    timestamp.map_or(false, |t| t >= since)
}

impl MetricSource for MemorySource {
    fn count_active_accounts(&self, since: DateTime<Utc>) -> Result<u64, SourceError> {
        let records = self.read()?;
        Ok(records
            .accounts
            .iter()
            .filter(|a| a.is_permanent() && a.authenticated && active_since(a.last_active, since))
            .count() as u64)
    }

    fn count_active_workloads(&self, since: DateTime<Utc>) -> Result<u64, SourceError> {
        let records = self.read()?;
        Ok(records
            .workloads
            .iter()
            .filter(|w| active_since(w.last_used, since))
            .count() as u64)
    }

    fn count_expired(&self, kind: ExpiryKind, since: DateTime<Utc>) -> Result<u64, SourceError> {
        let records = self.read()?;
        Ok(records
            .expiry_records
            .iter()
            .filter(|r| r.kind == kind && r.last_activity >= since)
            .count() as u64)
    }

    fn group_workloads_by_app(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AppWorkloadGroup>, SourceError> {
        let records = self.read()?;
        let mut groups: BTreeMap<&str, (u64, BTreeSet<&str>)> = BTreeMap::new();
        for workload in records
            .workloads
            .iter()
            .filter(|w| active_since(w.last_used, since))
        {
            let entry = groups.entry(workload.app_id.as_str()).or_default();
            entry.0 += 1;
            entry.1.insert(workload.owner_id.as_str());
        }

        Ok(groups
            .into_iter()
            .map(|(app_id, (workload_count, owners))| AppWorkloadGroup {
                app_id: app_id.to_string(),
                workload_count,
                distinct_owners: owners.len() as u64,
            })
            .collect())
    }

    fn workload_ids_for_app(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, SourceError> {
        let records = self.read()?;
        let mut ids: Vec<String> = records
            .workloads
            .iter()
            .filter(|w| w.app_id == app_id && active_since(w.last_used, since))
            .map(|w| w.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn count_shared_identities(
        &self,
        workload_ids: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<u64>, SourceError> {
        let records = self.read()?;
        let targets: BTreeSet<&str> = workload_ids.iter().map(String::as_str).collect();
        let identities: BTreeSet<&str> = records
            .delegated_tokens
            .iter()
            .filter(|t| targets.contains(t.workload_id.as_str()))
            .filter_map(|t| t.owner.as_ref())
            .filter(|owner| active_since(owner.last_used, since))
            .map(|owner| owner.identity_id.as_str())
            .collect();

        if identities.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(vec![identities.len() as u64])
        }
    }

    fn group_expired_by_app(&self, since: DateTime<Utc>) -> Result<Vec<ExpiryGroup>, SourceError> {
        let records = self.read()?;
        let mut groups: BTreeMap<(&str, ExpiryKind), u64> = BTreeMap::new();
        for record in records
            .expiry_records
            .iter()
            .filter(|r| r.last_activity >= since)
        {
            if let Some(app_id) = record.app_id.as_deref() {
                *groups.entry((app_id, record.kind)).or_default() += 1;
            }
        }

        Ok(groups
            .into_iter()
            .map(|((app_id, kind), count)| ExpiryGroup {
                app_id: app_id.to_string(),
                kind,
                count,
            })
            .collect())
    }

    fn count_paying_accounts_by_plan(&self) -> Result<BTreeMap<String, u64>, SourceError> {
        let records = self.read()?;
        let mut plans = BTreeMap::new();
        for account in records.accounts.iter().filter(|a| a.is_paying()) {
            let plan = account.plan.as_deref().unwrap_or(UNKNOWN_PLAN);
            *plans.entry(plan.to_string()).or_insert(0) += 1;
        }
        Ok(plans)
    }
}

// ============================================================================
// File-backed source
// ============================================================================

/// Metric source over a JSON records file that is re-read on every refresh.
///
/// Queries run against the copy loaded by the latest refresh. A refresh that
/// fails leaves the previous copy in place and fails the snapshot.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    records: MemorySource,
}

impl FileSource {
    /// Open the records file, loading it once so a bad path fails at startup.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let path = path.into();
        let records = MemorySource::from_records(SourceRecords::load(&path)?);
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricSource for FileSource {
    fn refresh(&self) -> Result<(), SourceError> {
        let records = SourceRecords::load(&self.path)?;
        debug!(
            path = %self.path.display(),
            accounts = records.accounts.len(),
            workloads = records.workloads.len(),
            "reloaded source records"
        );
        self.records.replace(records)
    }

    fn count_active_accounts(&self, since: DateTime<Utc>) -> Result<u64, SourceError> {
        self.records.count_active_accounts(since)
    }

    fn count_active_workloads(&self, since: DateTime<Utc>) -> Result<u64, SourceError> {
        self.records.count_active_workloads(since)
    }

    fn count_expired(&self, kind: ExpiryKind, since: DateTime<Utc>) -> Result<u64, SourceError> {
        self.records.count_expired(kind, since)
    }

    fn group_workloads_by_app(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AppWorkloadGroup>, SourceError> {
        self.records.group_workloads_by_app(since)
    }

    fn workload_ids_for_app(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, SourceError> {
        self.records.workload_ids_for_app(app_id, since)
    }

    fn count_shared_identities(
        &self,
        workload_ids: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<u64>, SourceError> {
        self.records.count_shared_identities(workload_ids, since)
    }

    fn group_expired_by_app(&self, since: DateTime<Utc>) -> Result<Vec<ExpiryGroup>, SourceError> {
        self.records.group_expired_by_app(since)
    }

    fn count_paying_accounts_by_plan(&self) -> Result<BTreeMap<String, u64>, SourceError> {
        self.records.count_paying_accounts_by_plan()
    }
}
