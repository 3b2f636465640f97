//! Per-recipient retry policy and send outcome.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error text recorded when a send is attempted on a device that is not
/// connected.  Such sends are never retried.
pub const DEVICE_NOT_CONNECTED: &str = "device is not connected";

/// How hard to try delivering to one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Fixed wait between attempts.
    pub retry_backoff: Duration,
    /// Upper bound on a single transport send.
    pub send_timeout: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_secs(10),
            send_timeout: Duration::from_secs(60),
        }
    }
}

/// Final result of delivering to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Sent,
    Failed { reason: String },
}

impl DeliveryOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        DeliveryOutcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn device_not_connected() -> Self {
        Self::failed(DEVICE_NOT_CONNECTED)
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, DeliveryOutcome::Sent)
    }
}
