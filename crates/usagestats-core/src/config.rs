//! Service configuration.
//!
//! Configuration is a camelCase JSON document; every field has a default so
//! an empty object (or no file at all) yields a working single-node setup.
//!
//! ```json
//! {
//!   "replicaIndex": 0,
//!   "dataDir": "/var/lib/usagestats",
//!   "bindAddr": "0.0.0.0:3001",
//!   "sourceFile": "/var/lib/usagestats/records.json",
//!   "adminKey": "change-me",
//!   "duplicateRows": "firstWins",
//!   "telemetry": { "endpoint": "https://collector.example.net/data", "apiKey": "..." }
//! }
//! ```
//!
//! Schedule constants are fixed and intentionally not configurable.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::DuplicateRowPolicy;

/// Hour of day (UTC) the daily rollup is anchored to.
pub const ANCHOR_HOUR_UTC: u32 = 10;

/// Interval between rollups.
pub const ROLLUP_CADENCE_SECS: u64 = 24 * 60 * 60;

/// Stored snapshot count at which onboarding and reporting begin.
pub const REPORTING_HISTORY_THRESHOLD: u64 = 4;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration document is invalid.
    #[error("Invalid configuration in {path}: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsConfig {
    /// Replica index of this process. Only replica 0 runs the rollup scheduler.
    pub replica_index: u32,

    /// Directory holding `snapshots.jsonl` and `settings.json`.
    pub data_dir: PathBuf,

    /// HTTP listen address.
    pub bind_addr: String,

    /// JSON file of platform records backing the in-memory metric source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<PathBuf>,

    /// Bearer secret for admin routes. Admin routes reject everything when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_key: Option<String>,

    /// Resolution of duplicate shared-user aggregation rows.
    pub duplicate_rows: DuplicateRowPolicy,

    /// Remote telemetry collector.
    pub telemetry: TelemetrySettings,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            replica_index: 0,
            data_dir: PathBuf::from("./data"),
            bind_addr: "0.0.0.0:3001".to_string(),
            source_file: None,
            admin_key: None,
            duplicate_rows: DuplicateRowPolicy::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

impl StatsConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Invalid {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Whether this replica is the single writer that runs the scheduler.
    pub fn is_designated_writer(&self) -> bool {
        self.replica_index == 0
    }
}

/// Telemetry collector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    /// Collector URL. Reporting is disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Bearer token sent with each report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: 30,
        }
    }
}
