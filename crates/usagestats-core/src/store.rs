//! Snapshot history and settings storage.
//!
//! The snapshot history is append-only and ordered by timestamp: snapshots
//! are never mutated or removed once stored. Settings live in a single-row
//! document holding the access token and the consent flag; every change
//! replaces that row as a whole.
//!
//! Two implementations of each store are provided:
//! - Memory stores for tests and ephemeral deployments
//! - File stores (`snapshots.jsonl`, `settings.json`) for persistence

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::model::{AccessToken, ConsentSetting, Snapshot};

/// Errors that can occur while reading or writing stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Stored data could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The snapshot would break timestamp ordering of the history.
    #[error("Snapshot at {new} precedes latest stored snapshot at {latest}")]
    OutOfOrder { new: String, latest: String },

    /// A lock guarding the store was poisoned.
    #[error("Store lock poisoned")]
    Poisoned,
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ============================================================================
// Snapshot history
// ============================================================================

/// Append-only snapshot history.
pub trait SnapshotStore: Send + Sync {
    /// Append a snapshot. Fails if it is older than the latest stored snapshot.
    fn append(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Number of stored snapshots.
    fn count(&self) -> Result<u64, StoreError>;

    /// Full history in timestamp order.
    fn all(&self) -> Result<Vec<Snapshot>, StoreError>;

    /// Most recent snapshot, if any.
    fn latest(&self) -> Result<Option<Snapshot>, StoreError>;
}

fn check_order(history: &[Snapshot], snapshot: &Snapshot) -> Result<(), StoreError> {
    match history.last() {
        Some(latest) if snapshot.timestamp < latest.timestamp => Err(StoreError::OutOfOrder {
            new: snapshot.timestamp.to_rfc3339(),
            latest: latest.timestamp.to_rfc3339(),
        }),
        _ => Ok(()),
    }
}

/// In-memory snapshot history.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<Vec<Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn append(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write().map_err(|_| StoreError::Poisoned)?;
        check_order(&snapshots, snapshot)?;
        snapshots.push(snapshot.clone());
        Ok(())
    }

    fn count(&self) -> Result<u64, StoreError> {
        let snapshots = self.snapshots.read().map_err(|_| StoreError::Poisoned)?;
        Ok(snapshots.len() as u64)
    }

    fn all(&self) -> Result<Vec<Snapshot>, StoreError> {
        let snapshots = self.snapshots.read().map_err(|_| StoreError::Poisoned)?;
        Ok(snapshots.clone())
    }

    fn latest(&self) -> Result<Option<Snapshot>, StoreError> {
        let snapshots = self.snapshots.read().map_err(|_| StoreError::Poisoned)?;
        Ok(snapshots.last().cloned())
    }
}

/// File-backed snapshot history: one JSON document per line.
///
/// The file is read once at open; appends write through to disk before the
/// in-memory copy is updated.
#[derive(Debug)]
pub struct FileSnapshotStore {
    path: PathBuf,
    snapshots: RwLock<Vec<Snapshot>>,
}

impl FileSnapshotStore {
    /// Default file name inside a data directory.
    pub const FILE_NAME: &'static str = "snapshots.jsonl";

    /// Open (or create) the history at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let snapshots = if path.exists() {
            load_history(&path)?
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), count = snapshots.len(), "opened snapshot history");

        Ok(Self {
            path,
            snapshots: RwLock::new(snapshots),
        })
    }

    /// Open the history inside a data directory.
    pub fn open_in(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open(data_dir.as_ref().join(Self::FILE_NAME))
    }
}

/// Read a JSON-lines history, repairing an append that was cut short.
///
/// Every newline-terminated line must parse. A trailing fragment without a
/// newline is kept if it is a whole record and truncated away otherwise.
fn load_history(path: &Path) -> Result<Vec<Snapshot>, StoreError> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    let complete_len = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i + 1);
    let (complete, tail) = bytes.split_at(complete_len);

    let mut snapshots = Vec::new();
    for line in complete.split(|b| *b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        snapshots.push(serde_json::from_slice(line)?);
    }

    if tail.iter().all(u8::is_ascii_whitespace) {
        return Ok(snapshots);
    }
    match serde_json::from_slice::<Snapshot>(tail) {
        Ok(snapshot) => {
            // Only the terminator is missing
            let mut file = OpenOptions::new()
                .append(true)
                .open(path)
                .map_err(|e| StoreError::io(path, e))?;
            file.write_all(b"\n").map_err(|e| StoreError::io(path, e))?;
            snapshots.push(snapshot);
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                bytes = tail.len(),
                error = %e,
                "discarding interrupted snapshot append"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(|e| StoreError::io(path, e))?;
            file.set_len(complete_len as u64)
                .map_err(|e| StoreError::io(path, e))?;
        }
    }
    Ok(snapshots)
}

/// A file that can be cut back to an earlier length.
trait AppendTarget: Write {
    fn end(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl AppendTarget for File {
    fn end(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Append `bytes` durably; on failure the target is restored to its previous length.
fn append_record<T: AppendTarget>(target: &mut T, bytes: &[u8]) -> io::Result<()> {
    let len = target.end()?;
    if let Err(e) = target.write_all(bytes).and_then(|_| target.sync()) {
        if let Err(rollback) = target.truncate(len) {
            error!(error = %rollback, "failed to roll back partial snapshot append");
        }
        return Err(e);
    }
    Ok(())
}

impl SnapshotStore for FileSnapshotStore {
    fn append(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write().map_err(|_| StoreError::Poisoned)?;
        check_order(&snapshots, snapshot)?;

        let mut line = serde_json::to_string(snapshot)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;
        append_record(&mut file, line.as_bytes()).map_err(|e| StoreError::io(&self.path, e))?;

        snapshots.push(snapshot.clone());
        Ok(())
    }

    fn count(&self) -> Result<u64, StoreError> {
        let snapshots = self.snapshots.read().map_err(|_| StoreError::Poisoned)?;
        Ok(snapshots.len() as u64)
    }

    fn all(&self) -> Result<Vec<Snapshot>, StoreError> {
        let snapshots = self.snapshots.read().map_err(|_| StoreError::Poisoned)?;
        Ok(snapshots.clone())
    }

    fn latest(&self) -> Result<Option<Snapshot>, StoreError> {
        let snapshots = self.snapshots.read().map_err(|_| StoreError::Poisoned)?;
        Ok(snapshots.last().cloned())
    }
}

// ============================================================================
// Settings (single row)
// ============================================================================

/// The single settings row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsRow {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub access_token: Option<AccessToken>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub consent: Option<ConsentSetting>,
}

/// Single-row settings store with whole-row replace semantics.
///
/// Every mutating operation reads the row, computes the new row and replaces
/// it under one lock, so readers never observe a partial update.
pub trait SettingsStore: Send + Sync {
    /// Current consent value; `None` if never initialized.
    fn consent(&self) -> Result<Option<ConsentSetting>, StoreError>;

    /// Replace the consent value.
    fn set_consent(&self, value: ConsentSetting) -> Result<(), StoreError>;

    /// Initialize consent to `Unset` if absent. Returns true only for the call that created it.
    fn init_consent_if_absent(&self) -> Result<bool, StoreError>;

    /// Current access token, if one has been issued.
    fn access_token(&self) -> Result<Option<AccessToken>, StoreError>;

    /// Replace the access token with a fresh one, invalidating the previous value.
    fn regenerate_access_token(&self) -> Result<AccessToken, StoreError>;

    /// Issue an access token only if none exists. Returns the token in effect.
    fn ensure_access_token(&self) -> Result<AccessToken, StoreError>;
}

/// Implements `SettingsStore` on top of inherent `update` and `row` methods.
///
/// `update` runs a closure on a copy of the row and replaces the stored row
/// with the copy under one lock.
macro_rules! impl_settings_store {
    ($store:ty) => {
        impl SettingsStore for $store {
            fn consent(&self) -> Result<Option<ConsentSetting>, StoreError> {
                Ok(self.row()?.consent)
            }

            fn set_consent(&self, value: ConsentSetting) -> Result<(), StoreError> {
                self.update(|row| row.consent = Some(value))
            }

            fn init_consent_if_absent(&self) -> Result<bool, StoreError> {
                self.update(|row| {
                    if row.consent.is_some() {
                        false
                    } else {
                        row.consent = Some(ConsentSetting::Unset);
                        true
                    }
                })
            }

            fn access_token(&self) -> Result<Option<AccessToken>, StoreError> {
                Ok(self.row()?.access_token)
            }

            fn regenerate_access_token(&self) -> Result<AccessToken, StoreError> {
                self.update(|row| {
                    let token = AccessToken::generate();
                    row.access_token = Some(token.clone());
                    token
                })
            }

            fn ensure_access_token(&self) -> Result<AccessToken, StoreError> {
                self.update(|row| {
                    row.access_token
                        .get_or_insert_with(AccessToken::generate)
                        .clone()
                })
            }
        }
    };
}

/// In-memory settings row.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    row: Mutex<SettingsRow>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, SettingsRow>, StoreError> {
        self.row.lock().map_err(|_| StoreError::Poisoned)
    }

    fn update<T>(&self, f: impl FnOnce(&mut SettingsRow) -> T) -> Result<T, StoreError> {
        let mut row = self.lock()?;
        let mut next = row.clone();
        let result = f(&mut next);
        *row = next;
        Ok(result)
    }

    fn row(&self) -> Result<SettingsRow, StoreError> {
        Ok(self.lock()?.clone())
    }
}

impl_settings_store!(MemorySettingsStore);

/// File-backed settings row (`settings.json`).
///
/// Writes go to a temporary file which is then renamed over the old one.
#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    row: Mutex<SettingsRow>,
}

impl FileSettingsStore {
    /// Default file name inside a data directory.
    pub const FILE_NAME: &'static str = "settings.json";

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let row = if path.exists() {
            let text = fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
            serde_json::from_str(&text)?
        } else {
            SettingsRow::default()
        };

        Ok(Self {
            path,
            row: Mutex::new(row),
        })
    }

    pub fn open_in(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open(data_dir.as_ref().join(Self::FILE_NAME))
    }

    fn persist(&self, row: &SettingsRow) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(row)?;
        fs::write(&tmp, json).map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))
    }

    fn update<T>(&self, f: impl FnOnce(&mut SettingsRow) -> T) -> Result<T, StoreError> {
        let mut row = self.row.lock().map_err(|_| StoreError::Poisoned)?;
        let mut next = row.clone();
        let result = f(&mut next);
        if next != *row {
            self.persist(&next)?;
            *row = next;
        }
        Ok(result)
    }

    fn row(&self) -> Result<SettingsRow, StoreError> {
        Ok(self.row.lock().map_err(|_| StoreError::Poisoned)?.clone())
    }
}

impl_settings_store!(FileSettingsStore);
