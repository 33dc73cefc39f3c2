//! # usagestats-web
//!
//! HTTP surface for usage statistics.
//!
//! This crate provides:
//! - The token-gated read endpoint returning the full snapshot history
//! - A WebSocket channel pushing each newly persisted snapshot
//! - Admin endpoints for the access token, reporting consent and report views
//!
//! ## Architecture
//!
//! - `/fetchStats/:token` - Snapshot history (token-gated)
//! - `/fetchStats/:token/live` - Live snapshot push (token-gated)
//! - `/admin/stats/` - Admin API (bearer admin key)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use usagestats_web::{create_router, BearerAdminKey, ServerState};
//!
//! let state = ServerState::new(snapshots, settings, Arc::new(BearerAdminKey::new(key)), live_tx);
//! let app = create_router(state);
//!
//! let listener = TcpListener::bind("0.0.0.0:3001").await?;
//! axum::serve(listener, app).await?;
//! ```

pub mod error;
pub mod routes;

// Re-exports
pub use error::WebError;
pub use routes::admin::{AdminCheck, BearerAdminKey};
pub use routes::create_router;

use std::sync::Arc;

use tokio::sync::broadcast;
use usagestats_core::{SettingsStore, Snapshot, SnapshotStore};

/// Shared state for all route handlers.
pub struct ServerState {
    pub snapshots: Arc<dyn SnapshotStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub admin: Arc<dyn AdminCheck>,
    /// Newly persisted snapshots, fed by the rollup scheduler.
    pub live: broadcast::Sender<Arc<Snapshot>>,
}

impl ServerState {
    pub fn new(
        snapshots: Arc<dyn SnapshotStore>,
        settings: Arc<dyn SettingsStore>,
        admin: Arc<dyn AdminCheck>,
        live: broadcast::Sender<Arc<Snapshot>>,
    ) -> AppState {
        Arc::new(Self {
            snapshots,
            settings,
            admin,
            live,
        })
    }
}

/// Type alias for shared state in Axum handlers.
pub type AppState = Arc<ServerState>;
