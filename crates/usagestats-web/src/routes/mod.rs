//! HTTP route handlers.

pub mod admin;
pub mod fetch;
pub mod live;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Create the main Axum router with all routes.
///
/// Routes are organized as:
/// - `/fetchStats/` - Token-gated snapshot history and live channel
/// - `/admin/stats/` - Admin API
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(fetch::routes())
        .merge(live::routes())
        .nest("/admin/stats", admin::routes())
        .fallback(fetch::missing_token)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
