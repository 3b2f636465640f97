//! HTTP webhook notifier.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{NotifyError, StatusNotification, StatusNotifier};

/// Posts every notification as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// # Errors
    ///
    /// Returns [`NotifyError::Http`] when the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl StatusNotifier for WebhookNotifier {
    async fn notify(&self, notification: &StatusNotification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(
            instance_id = %notification.instance_id,
            status = ?notification.status,
            "webhook delivered"
        );
        Ok(())
    }
}
