//! Administrator notifications.
//!
//! Notifications are fire-and-forget: callers log a failed delivery and move on.

use thiserror::Error;
use tracing::info;

/// Errors that can occur while delivering a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Delivers a message with a link to the administrators.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str, link_path: &str) -> Result<(), NotifyError>;
}

/// Notifier that writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str, link_path: &str) -> Result<(), NotifyError> {
        info!(link = link_path, "admin notification: {}", message);
        Ok(())
    }
}
