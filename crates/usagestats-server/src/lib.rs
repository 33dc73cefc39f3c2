//! # usagestats-server
//!
//! Tokio runtime pieces of the usage statistics service:
//!
//! - `scheduler` - Daily rollup anchored to a fixed wall-clock hour
//! - `telemetry` - Consent-gated snapshot reporting to a remote collector
//! - `notify` - Administrator notification collaborator
//!
//! Only the designated writer replica runs the scheduler; the aggregation
//! itself lives in `usagestats-core`.

pub mod notify;
pub mod scheduler;
pub mod telemetry;

pub use notify::{LogNotifier, Notifier, NotifyError};
pub use scheduler::{
    bootstrap_access_token, next_anchor, RollupError, RollupScheduler, SchedulerState,
    TickReport,
};
pub use telemetry::{TelemetryError, TelemetryReporter};
pub use usagestats_core::{MemorySource, MetricSource, Snapshot, SnapshotStore};
