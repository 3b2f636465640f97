//! Persist-then-notify bridge between the lifecycle manager and the outside.
//!
//! Every device status change goes through [`StatusBridge::apply`], which
//! writes the new state to the database first and only then emits the
//! outbound notification.  A receiver that misses or rejects a notification
//! can always recover the truth by polling.

use std::sync::Arc;

use blastgate_core::{DeviceKey, DeviceStatus};
use chrono::Utc;
use tracing::{debug, warn};

use crate::infrastructure::notify::{NotificationStatus, StatusNotification, StatusNotifier};
use crate::infrastructure::storage::{Database, StoreError};

/// Reason sent when the reconnect budget runs out.
pub const MAX_RECONNECT_REACHED: &str = "maxReconnectReached";

/// A device state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    /// A new session is being opened.  Not announced.
    Connecting,
    /// A pairing code was issued; `announce` is set for the first code of a
    /// connection attempt.
    PairingCode { rendered: String, announce: bool },
    Connected { phone_number: String },
    /// A transient closure; reconnect attempt `attempt` is scheduled.
    Reconnecting { attempt: u32, code: u16 },
    /// The device is down and will stay down until someone logs in again.
    Disconnected { reason: String, code: Option<u16> },
}

#[derive(Clone)]
pub struct StatusBridge {
    db: Database,
    notifier: Arc<dyn StatusNotifier>,
}

impl StatusBridge {
    pub fn new(db: Database, notifier: Arc<dyn StatusNotifier>) -> Self {
        Self { db, notifier }
    }

    /// Persists `change` for `key`, then notifies.  Notification failures are
    /// logged and swallowed; nothing is sent for a device that no longer
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the state cannot be persisted, in which
    /// case no notification is sent.
    pub async fn apply(&self, key: &DeviceKey, change: StatusChange) -> Result<(), StoreError> {
        let now = Utc::now();
        let (persisted, notification) = match change {
            StatusChange::Connecting => (
                self.db
                    .update_device_status(key, DeviceStatus::Connecting, None, now)?,
                None,
            ),
            StatusChange::PairingCode { rendered, announce } => (
                self.db.save_pairing_code(key, &rendered)?,
                announce.then(|| StatusNotification::new(key.clone(), NotificationStatus::Qr)),
            ),
            StatusChange::Connected { phone_number } => (
                self.db.update_device_status(
                    key,
                    DeviceStatus::Connected,
                    Some(&phone_number),
                    now,
                )?,
                Some(StatusNotification::new(
                    key.clone(),
                    NotificationStatus::Connected,
                )),
            ),
            StatusChange::Reconnecting { attempt, code } => (
                self.db
                    .update_device_status(key, DeviceStatus::Disconnected, None, now)?,
                Some(
                    StatusNotification::new(key.clone(), NotificationStatus::Reconnecting)
                        .with_reason(format!("attempt_{attempt}"), Some(code)),
                ),
            ),
            StatusChange::Disconnected { reason, code } => (
                self.db
                    .update_device_status(key, DeviceStatus::Disconnected, None, now)?,
                Some(
                    StatusNotification::new(key.clone(), NotificationStatus::Disconnected)
                        .with_reason(reason, code),
                ),
            ),
        };

        if !persisted {
            debug!("status change for unknown device {key} dropped");
            return Ok(());
        }
        let Some(mut notification) = notification else {
            return Ok(());
        };
        notification.phone_number = self.db.device(key)?.and_then(|d| d.phone_number);

        if let Err(e) = self.notifier.notify(&notification).await {
            warn!(
                instance_id = %key,
                status = ?notification.status,
                "status notification failed: {e}"
            );
        }
        Ok(())
    }
}
