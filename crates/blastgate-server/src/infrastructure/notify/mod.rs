//! Outbound device status notifications.
//!
//! The owning application learns about pairing codes, connects and
//! disconnects through a JSON webhook:
//!
//! ```json
//! { "instance_id": "8c1f…", "status": "reconnecting",
//!   "phone_number": "62812…", "reason": "attempt_3", "error_code": 428 }
//! ```
//!
//! Delivery is at-least-once and best-effort: the state is always persisted
//! before a notification is sent, so a receiver that misses one can poll.

pub mod mock;
pub mod webhook;

use async_trait::async_trait;
use blastgate_core::DeviceKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub use mock::RecordingNotifier;
pub use webhook::WebhookNotifier;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook answered {status}: {body}")]
    Status { status: u16, body: String },
}

/// Status values understood by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Qr,
    Connected,
    Reconnecting,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotification {
    pub instance_id: DeviceKey,
    pub status: NotificationStatus,
    pub phone_number: Option<String>,
    pub reason: Option<String>,
    pub error_code: Option<u16>,
}

impl StatusNotification {
    pub fn new(instance_id: DeviceKey, status: NotificationStatus) -> Self {
        Self {
            instance_id,
            status,
            phone_number: None,
            reason: None,
            error_code: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>, error_code: Option<u16>) -> Self {
        self.reason = Some(reason.into());
        self.error_code = error_code;
        self
    }
}

/// Sink for status notifications.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusNotifier: Send + Sync {
    async fn notify(&self, notification: &StatusNotification) -> Result<(), NotifyError>;
}

/// Notifier used when no webhook is configured: logs and drops.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl StatusNotifier for LogNotifier {
    async fn notify(&self, notification: &StatusNotification) -> Result<(), NotifyError> {
        info!(
            instance_id = %notification.instance_id,
            status = ?notification.status,
            reason = notification.reason.as_deref().unwrap_or(""),
            "status notification (no webhook configured)"
        );
        Ok(())
    }
}
