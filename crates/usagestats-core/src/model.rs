//! Usage statistics data model.
//!
//! These types cover both sides of the rollup:
//! - Platform records read from a `MetricSource` (accounts, workloads,
//!   delegated-access tokens, expiry records)
//! - Immutable `Snapshot` records produced once per rollup tick
//! - The single-row settings values (consent flag, access token)

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

// ============================================================================
// Horizons
// ============================================================================

/// One of the four fixed look-back periods a snapshot covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Horizon {
    Daily,
    Weekly,
    Monthly,
    Forever,
}

impl Horizon {
    /// All horizons in the order they are computed.
    pub const ALL: [Horizon; 4] = [
        Horizon::Daily,
        Horizon::Weekly,
        Horizon::Monthly,
        Horizon::Forever,
    ];

    /// Wire name of the horizon.
    pub fn as_str(&self) -> &'static str {
        match self {
            Horizon::Daily => "daily",
            Horizon::Weekly => "weekly",
            Horizon::Monthly => "monthly",
            Horizon::Forever => "forever",
        }
    }

    /// Cutoff timestamp for this horizon relative to `now`.
    ///
    /// `Forever` always reaches back to the Unix epoch.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Horizon::Daily => now - Duration::days(1),
            Horizon::Weekly => now - Duration::days(7),
            Horizon::Monthly => now - Duration::days(30),
            Horizon::Forever => DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// One immutable rollup record covering all four horizons.
///
/// Snapshots are appended to the history once and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Unique identifier used to select a history entry.
    pub id: Uuid,

    /// Creation time of the snapshot (UTC).
    pub timestamp: DateTime<Utc>,

    /// Per-horizon results.
    pub windows: BTreeMap<Horizon, WindowResult>,

    /// Active paying accounts per subscription plan.
    pub plan_distribution: BTreeMap<String, u64>,

    /// Wall-clock cost of producing this snapshot.
    pub compute_duration_ms: u64,

    /// Number of stored snapshots, attached only when reported externally.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub server_history_depth: Option<u64>,
}

impl Snapshot {
    /// Result for a single horizon.
    pub fn window(&self, horizon: Horizon) -> Option<&WindowResult> {
        self.windows.get(&horizon)
    }

    /// Copy of this snapshot carrying the given history depth, for external reporting.
    pub fn with_history_depth(&self, depth: u64) -> Snapshot {
        Snapshot {
            server_history_depth: Some(depth),
            ..self.clone()
        }
    }
}

/// Metrics computed for one horizon of one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowResult {
    /// Non-expired, authenticated accounts active since the cutoff.
    pub active_accounts: u64,

    /// Demo accounts that expired within the window.
    pub expired_transient_accounts: u64,

    /// App-demo accounts that expired within the window.
    pub expired_transient_app_accounts: u64,

    /// Live workloads used since the cutoff plus expired transient workloads.
    pub active_workloads: u64,

    /// Per-application breakdown keyed by application identifier.
    pub apps: BTreeMap<String, AppBreakdown>,
}

/// Per-application counters for one window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppBreakdown {
    /// Qualifying workloads of this application.
    #[serde(skip_serializing_if = "is_zero", default)]
    pub workload_count: u64,

    /// Distinct accounts owning a qualifying workload.
    #[serde(skip_serializing_if = "is_zero", default)]
    pub distinct_owners: u64,

    /// Distinct identities granted delegated access within the window.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub shared_user_count: Option<u64>,

    /// App-demo accounts of this application that expired within the window.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expired_transient_app_user_count: Option<u64>,

    /// Workloads of this application deleted within the window.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deleted_workload_count: Option<u64>,

    /// Demo workloads of this application that expired within the window.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expired_demo_workload_count: Option<u64>,
}

impl AppBreakdown {
    /// Whether every counter is zero or absent.
    pub fn is_empty(&self) -> bool {
        self.workload_count == 0
            && self.distinct_owners == 0
            && self.shared_user_count.unwrap_or(0) == 0
            && self.expired_transient_app_user_count.unwrap_or(0) == 0
            && self.deleted_workload_count.unwrap_or(0) == 0
            && self.expired_demo_workload_count.unwrap_or(0) == 0
    }
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

// ============================================================================
// Platform records (read side)
// ============================================================================

/// A user account on the hosting platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,

    /// Set for transient (demo) accounts that will auto-expire.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expires: Option<DateTime<Utc>>,

    /// Whether the account has at least one login identity attached.
    #[serde(default)]
    pub authenticated: bool,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_active: Option<DateTime<Utc>>,

    /// Subscription plan identifier.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub plan: Option<String>,

    /// Payment-provider customer id; present for paying accounts.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payment_id: Option<String>,
}

impl Account {
    /// Permanent accounts never auto-expire.
    pub fn is_permanent(&self) -> bool {
        self.expires.is_none()
    }

    pub fn is_paying(&self) -> bool {
        self.is_permanent() && self.payment_id.is_some()
    }
}

/// A running instance of an application, owned by one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub id: String,
    pub app_id: String,
    pub owner_id: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_used: Option<DateTime<Utc>>,
}

/// A capability granting another identity access to a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegatedToken {
    pub id: String,
    pub workload_id: String,

    /// Present when the token is held by a user identity.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub owner: Option<TokenOwner>,
}

/// The user identity holding a delegated-access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenOwner {
    pub identity_id: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_used: Option<DateTime<Utc>>,
}

/// Kind tag of an expiry/deletion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExpiryKind {
    /// Demo account that auto-expired.
    DemoAccount,
    /// App-demo account that auto-expired.
    AppDemoAccount,
    /// Workload that was auto-deleted.
    DeletedWorkload,
    /// Demo workload that auto-expired.
    DemoWorkload,
}

/// Trace left behind by an expired or deleted transient entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryRecord {
    pub kind: ExpiryKind,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub app_id: Option<String>,

    pub last_activity: DateTime<Utc>,
}

// ============================================================================
// Settings values
// ============================================================================

/// Tri-state consent flag controlling telemetry transmission.
///
/// Serialized as `"unset"`, `true` or `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsentSetting {
    /// The administrator has not been asked yet.
    #[default]
    Unset,
    Enabled,
    Disabled,
}

impl ConsentSetting {
    pub fn allows_transmission(&self) -> bool {
        matches!(self, ConsentSetting::Enabled)
    }
}

impl From<bool> for ConsentSetting {
    fn from(value: bool) -> Self {
        if value {
            ConsentSetting::Enabled
        } else {
            ConsentSetting::Disabled
        }
    }
}

impl Serialize for ConsentSetting {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ConsentSetting::Unset => serializer.serialize_str("unset"),
            ConsentSetting::Enabled => serializer.serialize_bool(true),
            ConsentSetting::Disabled => serializer.serialize_bool(false),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawConsent {
    Flag(bool),
    Text(String),
}

impl<'de> Deserialize<'de> for ConsentSetting {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawConsent::deserialize(deserializer)? {
            RawConsent::Flag(flag) => Ok(flag.into()),
            RawConsent::Text(text) if text == "unset" => Ok(ConsentSetting::Unset),
            RawConsent::Text(text) => Err(D::Error::custom(format!(
                "invalid consent value: {}",
                text
            ))),
        }
    }
}

/// Opaque credential gating the snapshot read path.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    /// Generate a fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare against a presented token without short-circuiting on the first mismatch.
    pub fn matches(&self, candidate: &str) -> bool {
        let expected = self.0.as_bytes();
        let candidate = candidate.as_bytes();
        if expected.len() != candidate.len() {
            return false;
        }
        expected
            .iter()
            .zip(candidate)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl From<String> for AccessToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_horizon_cutoffs() {
        let now = Utc.with_ymd_and_hms(2024, 3, 31, 10, 0, 0).unwrap();

        assert_eq!(
            Horizon::Daily.cutoff(now),
            Utc.with_ymd_and_hms(2024, 3, 30, 10, 0, 0).unwrap()
        );
        assert_eq!(
            Horizon::Weekly.cutoff(now),
            Utc.with_ymd_and_hms(2024, 3, 24, 10, 0, 0).unwrap()
        );
        assert_eq!(
            Horizon::Monthly.cutoff(now),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(Horizon::Forever.cutoff(now).timestamp(), 0);
    }

    #[test]
    fn test_consent_wire_format() {
        assert_eq!(serde_json::to_string(&ConsentSetting::Unset).unwrap(), "\"unset\"");
        assert_eq!(serde_json::to_string(&ConsentSetting::Enabled).unwrap(), "true");
        assert_eq!(serde_json::to_string(&ConsentSetting::Disabled).unwrap(), "false");

        let parsed: ConsentSetting = serde_json::from_str("true").unwrap();
        assert_eq!(parsed, ConsentSetting::Enabled);
        let parsed: ConsentSetting = serde_json::from_str("\"unset\"").unwrap();
        assert_eq!(parsed, ConsentSetting::Unset);
        assert!(serde_json::from_str::<ConsentSetting>("\"maybe\"").is_err());
    }

    #[test]
    fn test_access_token_matching() {
        let token = AccessToken::generate();
        assert_eq!(token.as_str().len(), 32);
        assert!(token.matches(token.as_str()));
        assert!(!token.matches("not-the-token"));
        assert!(!token.matches(""));
        assert_eq!(format!("{:?}", token), "AccessToken(..)");
    }

    #[test]
    fn test_app_breakdown_serialization_omits_absent_fields() {
        let app = AppBreakdown {
            deleted_workload_count: Some(1),
            ..Default::default()
        };

        let json = serde_json::to_value(&app).unwrap();
        assert_eq!(json, serde_json::json!({ "deletedWorkloadCount": 1 }));
        assert!(!app.is_empty());
        assert!(AppBreakdown::default().is_empty());
    }

    #[test]
    fn test_snapshot_window_keys() {
        let mut windows = BTreeMap::new();
        for horizon in Horizon::ALL {
            windows.insert(horizon, WindowResult::default());
        }
        let snapshot = Snapshot {
            id: Uuid::nil(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
            windows,
            plan_distribution: BTreeMap::new(),
            compute_duration_ms: 5,
            server_history_depth: None,
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["windows"]["daily"].is_object());
        assert!(json["windows"]["forever"].is_object());
        assert!(json.get("serverHistoryDepth").is_none());

        let reported = snapshot.with_history_depth(7);
        let json = serde_json::to_value(&reported).unwrap();
        assert_eq!(json["serverHistoryDepth"], 7);
    }
}
