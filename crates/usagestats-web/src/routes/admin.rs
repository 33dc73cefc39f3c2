//! Admin routes for usage statistics.
//!
//! Endpoints:
//! - `GET /admin/stats/token` - Current access token
//! - `POST /admin/stats/token` - Issue a new access token, invalidating the old one
//! - `GET /admin/stats/consent` - Reporting consent (`"unset"`, `true`, `false` or `null`)
//! - `PUT /admin/stats/consent` - Set reporting consent, body `{"value": bool}`
//! - `GET /admin/stats/apps?snapshot=<id>` - Per-app breakdown across horizons
//! - `GET /admin/stats/history` - Snapshot history labelled by sample day
//!
//! Every route answers 403 unless the request carries the admin key as a
//! bearer token. With no admin key configured, every request is refused.

use axum::{
    async_trait,
    extract::{FromRequestParts, Query, State},
    http::{header, request::Parts, HeaderMap},
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use usagestats_core::report::{history_points, pivot_apps, AppTrend, HistoryPoint};
use usagestats_core::{AccessToken, ConsentSetting};

use crate::{AppState, WebError};

/// Decides whether a request may use the admin API.
pub trait AdminCheck: Send + Sync {
    fn authorize(&self, headers: &HeaderMap) -> bool;
}

/// Accepts `Authorization: Bearer <key>` matching a configured key.
pub struct BearerAdminKey {
    key: Option<AccessToken>,
}

impl BearerAdminKey {
    pub fn new(key: Option<String>) -> Self {
        Self {
            key: key.filter(|k| !k.is_empty()).map(AccessToken::from),
        }
    }
}

impl AdminCheck for BearerAdminKey {
    fn authorize(&self, headers: &HeaderMap) -> bool {
        let Some(key) = &self.key else {
            return false;
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map_or(false, |presented| key.matches(presented.trim()))
    }
}

/// Extractor proving the request passed the admin check.
pub struct Admin;

#[async_trait]
impl FromRequestParts<AppState> for Admin {
    type Rejection = WebError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if state.admin.authorize(&parts.headers) {
            Ok(Admin)
        } else {
            warn!(path = %parts.uri.path(), "rejected admin request");
            Err(WebError::Forbidden)
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/token", get(get_token).post(regenerate_token))
        .route("/consent", get(get_consent).put(set_consent))
        .route("/apps", get(app_breakdown))
        .route("/history", get(history))
}

// ============================================================================
// Access token
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: Option<String>,
}

async fn get_token(_: Admin, State(state): State<AppState>) -> Result<Json<TokenResponse>, WebError> {
    let token = state.settings.access_token()?;
    Ok(Json(TokenResponse {
        token: token.map(|t| t.as_str().to_string()),
    }))
}

async fn regenerate_token(
    _: Admin,
    State(state): State<AppState>,
) -> Result<Json<TokenResponse>, WebError> {
    let token = state.settings.regenerate_access_token()?;
    info!("stats access token regenerated");
    Ok(Json(TokenResponse {
        token: Some(token.as_str().to_string()),
    }))
}

// ============================================================================
// Consent
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ConsentResponse {
    pub value: Option<ConsentSetting>,
}

#[derive(Debug, Deserialize)]
pub struct ConsentUpdate {
    pub value: bool,
}

async fn get_consent(
    _: Admin,
    State(state): State<AppState>,
) -> Result<Json<ConsentResponse>, WebError> {
    Ok(Json(ConsentResponse {
        value: state.settings.consent()?,
    }))
}

async fn set_consent(
    _: Admin,
    State(state): State<AppState>,
    Json(update): Json<ConsentUpdate>,
) -> Result<Json<ConsentResponse>, WebError> {
    let value = ConsentSetting::from(update.value);
    state.settings.set_consent(value)?;
    info!(enabled = update.value, "reporting consent updated");
    Ok(Json(ConsentResponse { value: Some(value) }))
}

// ============================================================================
// Report views
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AppsQuery {
    /// Snapshot id; latest when omitted.
    pub snapshot: Option<Uuid>,
}

async fn app_breakdown(
    _: Admin,
    State(state): State<AppState>,
    Query(query): Query<AppsQuery>,
) -> Result<Json<Vec<AppTrend>>, WebError> {
    let snapshot = match query.snapshot {
        Some(id) => state.snapshots.all()?.into_iter().find(|s| s.id == id),
        None => state.snapshots.latest()?,
    };
    let snapshot = snapshot.ok_or(WebError::NotFound("Snapshot not found"))?;
    Ok(Json(pivot_apps(&snapshot)))
}

async fn history(_: Admin, State(state): State<AppState>) -> Result<Json<Vec<HistoryPoint>>, WebError> {
    let snapshots = state.snapshots.all()?;
    Ok(Json(history_points(&snapshots)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_router, ServerState};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::broadcast;
    use tower::ServiceExt;
    use usagestats_core::{
        AppBreakdown, Horizon, MemorySettingsStore, MemorySnapshotStore, SettingsStore, Snapshot,
        SnapshotStore, WindowResult,
    };

    const ADMIN_KEY: &str = "s3cret-admin";

    struct Fixture {
        app: Router,
        settings: Arc<MemorySettingsStore>,
        snapshots: Arc<MemorySnapshotStore>,
    }

    fn fixture(admin_key: Option<&str>) -> Fixture {
        let settings = Arc::new(MemorySettingsStore::new());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let (live, _) = broadcast::channel(4);
        let admin = Arc::new(BearerAdminKey::new(admin_key.map(String::from)));
        let app = create_router(ServerState::new(
            snapshots.clone(),
            settings.clone(),
            admin,
            live,
        ));
        Fixture {
            app,
            settings,
            snapshots,
        }
    }

    fn snapshot(day: i64, app_owners: &[(&str, u64)]) -> Snapshot {
        let mut daily = WindowResult::default();
        for (app_id, owners) in app_owners {
            daily.apps.insert(
                app_id.to_string(),
                AppBreakdown {
                    workload_count: *owners,
                    distinct_owners: *owners,
                    ..Default::default()
                },
            );
        }
        let mut windows = BTreeMap::new();
        windows.insert(Horizon::Daily, daily);
        Snapshot {
            id: Uuid::new_v4(),
            timestamp: Utc.with_ymd_and_hms(2024, 6, 10, 10, 0, 0).unwrap() + Duration::days(day),
            windows,
            plan_distribution: BTreeMap::new(),
            compute_duration_ms: 1,
            server_history_depth: None,
        }
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        key: Option<&str>,
        body: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", key));
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_admin_routes_require_key() {
        let fx = fixture(Some(ADMIN_KEY));
        for uri in ["/admin/stats/token", "/admin/stats/consent", "/admin/stats/history"] {
            let (status, _) = send(&fx.app, Method::GET, uri, None, None).await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{}", uri);
            let (status, _) = send(&fx.app, Method::GET, uri, Some("wrong"), None).await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{}", uri);
        }
        let (status, _) = send(&fx.app, Method::POST, "/admin/stats/token", None, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(fx.settings.access_token().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_admin_refused_without_configured_key() {
        let fx = fixture(None);
        let (status, _) = send(&fx.app, Method::GET, "/admin/stats/token", Some(""), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_regenerate_token_invalidates_old() {
        let fx = fixture(Some(ADMIN_KEY));
        let old = fx.settings.ensure_access_token().unwrap();

        let (status, body) =
            send(&fx.app, Method::POST, "/admin/stats/token", Some(ADMIN_KEY), None).await;
        assert_eq!(status, StatusCode::OK);
        let new = body["token"].as_str().unwrap().to_string();
        assert_eq!(new.len(), 32);
        assert_ne!(new, old.as_str());

        let (_, body) = send(&fx.app, Method::GET, "/admin/stats/token", Some(ADMIN_KEY), None).await;
        assert_eq!(body["token"], new.as_str());

        let uri = format!("/fetchStats/{}", old.as_str());
        let (status, _) = send(&fx.app, Method::GET, &uri, None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let uri = format!("/fetchStats/{}", new);
        let (status, _) = send(&fx.app, Method::GET, &uri, None, None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_consent_round_trip() {
        let fx = fixture(Some(ADMIN_KEY));

        let (_, body) = send(&fx.app, Method::GET, "/admin/stats/consent", Some(ADMIN_KEY), None).await;
        assert!(body["value"].is_null());

        fx.settings.init_consent_if_absent().unwrap();
        let (_, body) = send(&fx.app, Method::GET, "/admin/stats/consent", Some(ADMIN_KEY), None).await;
        assert_eq!(body["value"], "unset");

        let (status, body) = send(
            &fx.app,
            Method::PUT,
            "/admin/stats/consent",
            Some(ADMIN_KEY),
            Some(r#"{"value": true}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"], true);
        assert_eq!(fx.settings.consent().unwrap(), Some(ConsentSetting::Enabled));
    }

    #[tokio::test]
    async fn test_app_breakdown_selects_snapshot() {
        let fx = fixture(Some(ADMIN_KEY));
        let older = snapshot(0, &[("A", 1), ("B", 4)]);
        let newer = snapshot(1, &[("A", 7)]);
        fx.snapshots.append(&older).unwrap();
        fx.snapshots.append(&newer).unwrap();

        let (status, body) = send(&fx.app, Method::GET, "/admin/stats/apps", Some(ADMIN_KEY), None).await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["daily"]["distinctOwners"], 7);

        let uri = format!("/admin/stats/apps?snapshot={}", older.id);
        let (_, body) = send(&fx.app, Method::GET, &uri, Some(ADMIN_KEY), None).await;
        let ids: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["appId"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["B", "A"]);

        let uri = format!("/admin/stats/apps?snapshot={}", Uuid::new_v4());
        let (status, _) = send(&fx.app, Method::GET, &uri, Some(ADMIN_KEY), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let fx = fixture(Some(ADMIN_KEY));
        fx.snapshots.append(&snapshot(0, &[])).unwrap();
        fx.snapshots.append(&snapshot(1, &[])).unwrap();

        let (status, body) =
            send(&fx.app, Method::GET, "/admin/stats/history", Some(ADMIN_KEY), None).await;
        assert_eq!(status, StatusCode::OK);
        let points = body.as_array().unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0]["day"], "2024-06-10");
        assert_eq!(points[1]["day"], "2024-06-09");
    }
}
