//! Request and response shapes of the HTTP control surface.

use blastgate_core::{Blast, Recipient};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `"success"` or `"error"`, the first field of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// JSON envelope shared by all endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: ResponseStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relogin: Option<bool>,
}

impl ApiResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: message.into(),
            base64: None,
            data: None,
            relogin: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            ..Self::success(message)
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_base64(mut self, image: String) -> Self {
        self.base64 = Some(image);
        self
    }

    pub fn with_relogin(mut self) -> Self {
        self.relogin = Some(true);
        self
    }
}

/// Credentials every request carries in its query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthQuery {
    pub access_token: Option<String>,
    pub instance_id: Option<String>,
}

/// Message fields, from a JSON body or a query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendMessageRequest {
    pub chat_id: Option<String>,
    pub message: Option<String>,
    pub media_url: Option<String>,
    pub caption: Option<String>,
    pub filename: Option<String>,
}

impl SendMessageRequest {
    /// Caption wins over message text; both may be absent.
    pub fn text(&self) -> &str {
        [self.caption.as_deref(), self.message.as_deref()]
            .into_iter()
            .flatten()
            .find(|t| !t.is_empty())
            .unwrap_or("")
    }
}

/// `GET /sendMessage` carries credentials and message in one query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendMessageQuery {
    #[serde(flatten)]
    pub auth: AuthQuery,
    #[serde(flatten)]
    pub message: SendMessageRequest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDeviceRequest {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBlastRequest {
    pub instance_id: String,
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub delay_min_secs: Option<u32>,
    #[serde(default)]
    pub delay_max_secs: Option<u32>,
    /// Defaults to now.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub recipients: Vec<String>,
    /// Start delivery right away instead of waiting for the trigger.
    #[serde(default)]
    pub send_now: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlastView {
    #[serde(flatten)]
    pub blast: Blast,
    pub recipients: Vec<Recipient>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_omits_empty_fields() {
        let json = serde_json::to_value(ApiResponse::error("Error").with_relogin()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "status": "error", "message": "Error", "relogin": true })
        );
    }

    #[test]
    fn test_caption_wins_over_message() {
        let request = SendMessageRequest {
            message: Some("body".to_string()),
            caption: Some("caption".to_string()),
            ..SendMessageRequest::default()
        };
        assert_eq!(request.text(), "caption");
        assert_eq!(SendMessageRequest::default().text(), "");
    }
}
