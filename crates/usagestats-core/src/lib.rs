//! # usagestats-core
//!
//! Core usage-statistics model and rollup engine.
//!
//! This crate provides:
//! - Data model types (Snapshot, WindowResult, AppBreakdown, platform records)
//! - The `MetricSource` query contract and an in-memory implementation
//! - Window aggregation and snapshot composition
//! - Append-only snapshot stores and the single-row settings store
//! - Configuration and report pivots for the admin API
//!
//! This crate is intentionally runtime-agnostic and contains no async code,
//! so the aggregation logic can be driven by any scheduler.

pub mod aggregate;
pub mod compose;
pub mod config;
pub mod model;
pub mod report;
pub mod source;
pub mod store;

pub use aggregate::{DuplicateRowPolicy, WindowAggregator};
pub use compose::SnapshotComposer;
pub use config::{ConfigError, StatsConfig, TelemetrySettings};
pub use model::*;
pub use source::{FileSource, MemorySource, MetricSource, SourceError, SourceRecords};
pub use store::{
    FileSettingsStore, FileSnapshotStore, MemorySettingsStore, MemorySnapshotStore,
    SettingsStore, SnapshotStore, StoreError,
};
