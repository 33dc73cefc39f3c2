//! Error responses.
//!
//! Every failure is rendered as plain text. Internal faults carry their
//! diagnostic detail, since all routes are already gated by a secret.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use usagestats_core::StoreError;

#[derive(Debug, Error)]
pub enum WebError {
    #[error("{0}")]
    NotFound(&'static str),

    #[error("Forbidden")]
    Forbidden,

    #[error("WebSocket upgrade required")]
    UpgradeRequired,

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WebError {
    pub fn status(&self) -> StatusCode {
        match self {
            WebError::NotFound(_) => StatusCode::NOT_FOUND,
            WebError::Forbidden => StatusCode::FORBIDDEN,
            WebError::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            WebError::Store(_) | WebError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, self.to_string()).into_response()
    }
}
