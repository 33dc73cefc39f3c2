//! Remote telemetry reporting.
//!
//! When the administrator has opted in, the most recent snapshot is POSTed as
//! JSON (with `serverHistoryDepth` attached) to the configured collector.
//! Failures are logged and swallowed; they never affect the rollup.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use usagestats_core::{Snapshot, TelemetrySettings};

/// Errors that can occur while sending a report.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Request could not be built or sent.
    #[error("Telemetry request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Collector answered with a non-success status.
    #[error("Collector rejected report with status {0}")]
    Rejected(u16),
}

/// Sends snapshots to the remote collector.
#[derive(Debug, Clone)]
pub struct TelemetryReporter {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl TelemetryReporter {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TelemetryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    /// Build a reporter from settings; `None` when no endpoint is configured.
    pub fn from_settings(settings: &TelemetrySettings) -> Result<Option<Self>, TelemetryError> {
        match &settings.endpoint {
            Some(endpoint) => Ok(Some(Self::new(
                endpoint.clone(),
                settings.api_key.clone(),
                Duration::from_secs(settings.timeout_secs),
            )?)),
            None => Ok(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one snapshot to the collector.
    pub async fn send(&self, snapshot: &Snapshot) -> Result<(), TelemetryError> {
        let mut request = self.client.post(&self.endpoint).json(snapshot);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TelemetryError::Rejected(status.as_u16()));
        }
        Ok(())
    }

    /// Send a snapshot, logging instead of returning failures. Returns whether it was delivered.
    pub async fn report(&self, snapshot: &Snapshot) -> bool {
        match self.send(snapshot).await {
            Ok(()) => {
                debug!(endpoint = %self.endpoint, "telemetry report delivered");
                true
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "telemetry report failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_disabled_without_endpoint() {
        let settings = TelemetrySettings::default();
        assert!(TelemetryReporter::from_settings(&settings).unwrap().is_none());
    }

    #[test]
    fn test_reporter_from_settings() {
        let settings = TelemetrySettings {
            endpoint: Some("http://127.0.0.1:9/data".to_string()),
            api_key: Some("secret".to_string()),
            timeout_secs: 1,
        };
        let reporter = TelemetryReporter::from_settings(&settings).unwrap().unwrap();
        assert_eq!(reporter.endpoint(), "http://127.0.0.1:9/data");
    }
}
