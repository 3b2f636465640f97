//! Device identity and connection status.
//!
//! A *device* is one linked messaging-network identity.  It is addressed by
//! an opaque [`DeviceKey`] that is generated once at creation and never
//! reused.  The key doubles as the name of the device's session directory on
//! disk, so only a conservative character set is accepted.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Longest key accepted from the outside world.
const MAX_KEY_LEN: usize = 64;

/// Error returned when a string is not a valid [`DeviceKey`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceKeyError {
    #[error("instance key must not be empty")]
    Empty,

    #[error("instance key is longer than {MAX_KEY_LEN} characters")]
    TooLong,

    #[error("instance key contains invalid character {0:?}")]
    InvalidChar(char),
}

// ── DeviceKey ─────────────────────────────────────────────────────────────────

/// Opaque, globally unique identifier of a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceKey(String);

impl DeviceKey {
    /// Generates a fresh random key (UUID v4, hyphenated).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Validates `raw` as a key.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceKeyError`] for empty or over-long input, or input
    /// containing anything besides ASCII letters, digits, `-` and `_`.
    pub fn parse(raw: &str) -> Result<Self, DeviceKeyError> {
        if raw.is_empty() {
            return Err(DeviceKeyError::Empty);
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(DeviceKeyError::TooLong);
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(DeviceKeyError::InvalidChar(bad));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceKey {
    type Error = DeviceKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceKey> for String {
    fn from(key: DeviceKey) -> Self {
        key.0
    }
}

// ── DeviceStatus ──────────────────────────────────────────────────────────────

/// Persisted connection status of a device.
///
/// The only backward edges are `Connected → Disconnected` and
/// `Connecting → Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Connecting => "connecting",
            DeviceStatus::Connected => "connected",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown status {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for DeviceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(DeviceStatus::Disconnected),
            "connecting" => Ok(DeviceStatus::Connecting),
            "connected" => Ok(DeviceStatus::Connected),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

// ── Device ────────────────────────────────────────────────────────────────────

/// A stored device record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub key: DeviceKey,
    pub name: String,
    pub status: DeviceStatus,
    /// Bound when the device first opens a connection.
    pub phone_number: Option<String>,
    /// Rendered pairing image; cleared on connect and on disconnect.
    pub qr_code: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Device {
    pub fn is_connected(&self) -> bool {
        self.status == DeviceStatus::Connected
    }
}

/// The network identity reported when a session opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Full network address, e.g. `628123:7@s.whatsapp.net`.
    pub jid: String,
    /// Display name pushed by the account, if any.
    pub name: Option<String>,
}

impl AccountInfo {
    pub fn new(jid: impl Into<String>, name: Option<String>) -> Self {
        Self {
            jid: jid.into(),
            name,
        }
    }

    /// The bare phone identifier: the part of the address before any device
    /// suffix (`:N`) or server part (`@host`).
    pub fn phone_number(&self) -> &str {
        let end = self
            .jid
            .find([':', '@'])
            .unwrap_or(self.jid.len());
        &self.jid[..end]
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
