//! Token-gated snapshot history.
//!
//! Endpoints:
//! - `GET /fetchStats/:token` - Entire snapshot history as a JSON array
//!
//! An unknown token and "no token issued yet" both answer 404 with the same
//! body.

use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::debug;

use crate::{AppState, ServerState, WebError};

pub fn routes() -> Router<AppState> {
    Router::new().route("/fetchStats/:token", get(fetch_stats))
}

/// Router fallback. Requests without a token (`/fetchStats/`) answer exactly
/// like a wrong token.
pub(crate) async fn missing_token() -> WebError {
    WebError::NotFound("Token not found")
}

/// Check `candidate` against the stored access token.
pub(crate) fn verify_token(state: &ServerState, candidate: &str) -> Result<(), WebError> {
    match state.settings.access_token()? {
        Some(token) if token.matches(candidate) => Ok(()),
        _ => Err(WebError::NotFound("Token not found")),
    }
}

async fn fetch_stats(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, WebError> {
    verify_token(&state, &token)?;

    let history = state.snapshots.all()?;
    let body = serde_json::to_string(&history)?;
    debug!(snapshots = history.len(), "served stats history");

    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_router, BearerAdminKey};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::broadcast;
    use tower::ServiceExt;
    use usagestats_core::{
        MemorySettingsStore, MemorySnapshotStore, SettingsStore, Snapshot, SnapshotStore,
        StoreError,
    };

    fn snapshot(day: i64) -> Snapshot {
        Snapshot {
            id: uuid::Uuid::new_v4(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + Duration::days(day),
            windows: BTreeMap::new(),
            plan_distribution: BTreeMap::new(),
            compute_duration_ms: 3,
            server_history_depth: None,
        }
    }

    fn app(settings: Arc<dyn SettingsStore>, snapshots: Arc<dyn SnapshotStore>) -> Router {
        let (live, _) = broadcast::channel(4);
        let admin = Arc::new(BearerAdminKey::new(None));
        create_router(ServerState::new(snapshots, settings, admin, live))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_default();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_fetch_with_valid_token() {
        let settings = Arc::new(MemorySettingsStore::new());
        let token = settings.ensure_access_token().unwrap();
        let snapshots = Arc::new(MemorySnapshotStore::new());
        snapshots.append(&snapshot(0)).unwrap();
        snapshots.append(&snapshot(1)).unwrap();

        let uri = format!("/fetchStats/{}", token.as_str());
        let (status, content_type, body) = get(app(settings, snapshots), &uri).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, "application/json");
        let history: Vec<Snapshot> = serde_json::from_str(&body).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].timestamp < history[1].timestamp);
    }

    #[tokio::test]
    async fn test_fetch_empty_history() {
        let settings = Arc::new(MemorySettingsStore::new());
        let token = settings.ensure_access_token().unwrap();

        let uri = format!("/fetchStats/{}", token.as_str());
        let (status, _, body) = get(app(settings, Arc::new(MemorySnapshotStore::new())), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn test_wrong_and_missing_token_look_the_same() {
        let issued = Arc::new(MemorySettingsStore::new());
        issued.ensure_access_token().unwrap();
        let wrong = get(
            app(issued, Arc::new(MemorySnapshotStore::new())),
            "/fetchStats/0123456789abcdef0123456789abcdef",
        )
        .await;

        let never_issued = get(
            app(
                Arc::new(MemorySettingsStore::new()),
                Arc::new(MemorySnapshotStore::new()),
            ),
            "/fetchStats/0123456789abcdef0123456789abcdef",
        )
        .await;

        assert_eq!(wrong.0, StatusCode::NOT_FOUND);
        assert!(wrong.1.starts_with("text/plain"));
        assert_eq!(wrong, never_issued);
    }

    #[tokio::test]
    async fn test_missing_token_and_unknown_path_answer_token_not_found() {
        let settings = Arc::new(MemorySettingsStore::new());
        settings.ensure_access_token().unwrap();

        for uri in ["/fetchStats", "/fetchStats/", "/no/such/route"] {
            let (status, content_type, body) = get(
                app(settings.clone(), Arc::new(MemorySnapshotStore::new())),
                uri,
            )
            .await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert!(content_type.starts_with("text/plain"), "{uri}");
            assert_eq!(body, "Token not found", "{uri}");
        }
    }

    /// Snapshot store whose reads always fail.
    struct BrokenStore;

    impl SnapshotStore for BrokenStore {
        fn append(&self, _: &Snapshot) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
        fn count(&self) -> Result<u64, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn all(&self) -> Result<Vec<Snapshot>, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn latest(&self) -> Result<Option<Snapshot>, StoreError> {
            Err(StoreError::Poisoned)
        }
    }

    #[tokio::test]
    async fn test_store_fault_is_server_error_with_detail() {
        let settings = Arc::new(MemorySettingsStore::new());
        let token = settings.ensure_access_token().unwrap();

        let uri = format!("/fetchStats/{}", token.as_str());
        let (status, content_type, body) = get(app(settings, Arc::new(BrokenStore)), &uri).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(content_type.starts_with("text/plain"));
        assert!(body.starts_with("Store failure"));
    }
}
