//! Recording notifier for tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{NotificationStatus, NotifyError, StatusNotification, StatusNotifier};

/// Keeps every notification it receives.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    received: Arc<Mutex<Vec<StatusNotification>>>,
    arrived: Arc<Notify>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<StatusNotification> {
        self.received.lock().clone()
    }

    pub fn with_status(&self, status: NotificationStatus) -> Vec<StatusNotification> {
        self.received
            .lock()
            .iter()
            .filter(|n| n.status == status)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.received.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.lock().is_empty()
    }

    /// Waits until at least `count` notifications have arrived.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.arrived.notified();
            if self.len() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Waits until at least `count` notifications with `status` have arrived.
    pub async fn wait_for_status(&self, status: NotificationStatus, count: usize) {
        loop {
            let notified = self.arrived.notified();
            if self.with_status(status).len() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Waits until `predicate` holds for some received notification.  The
    /// predicate runs under the notifier's lock and must not call back into
    /// it.
    pub async fn wait_until<F>(&self, predicate: F)
    where
        F: Fn(&StatusNotification) -> bool,
    {
        loop {
            let notified = self.arrived.notified();
            if self.received.lock().iter().any(&predicate) {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl StatusNotifier for RecordingNotifier {
    async fn notify(&self, notification: &StatusNotification) -> Result<(), NotifyError> {
        self.received.lock().push(notification.clone());
        self.arrived.notify_waiters();
        Ok(())
    }
}
