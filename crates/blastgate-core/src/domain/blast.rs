//! Blasts and their recipients.
//!
//! A blast is one message pushed through one device to many recipients.  Its
//! status is never set directly by callers once processing starts: it is
//! derived from the per-recipient outcome counters (see [`BlastCounters`]).
//!
//! ```text
//!   pending ──process──▶ processing ──all settled──▶ completed | failed
//!                            ▲                              │
//!                            └──────── retry failed ◀───────┘
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::device::{DeviceKey, UnknownStatus};

/// Suffix the network uses for individual (non-group) chats.
const INDIVIDUAL_CHAT_SUFFIX: &str = "@s.whatsapp.net";

pub type BlastId = i64;
pub type RecipientId = i64;

// ── Status enums ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BlastStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BlastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlastStatus::Pending => "pending",
            BlastStatus::Processing => "processing",
            BlastStatus::Completed => "completed",
            BlastStatus::Failed => "failed",
        }
    }

    /// `true` for `completed` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BlastStatus::Completed | BlastStatus::Failed)
    }
}

impl fmt::Display for BlastStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlastStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BlastStatus::Pending),
            "processing" => Ok(BlastStatus::Processing),
            "completed" => Ok(BlastStatus::Completed),
            "failed" => Ok(BlastStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecipientStatus {
    #[default]
    Pending,
    Sent,
    Failed,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Pending => "pending",
            RecipientStatus::Sent => "sent",
            RecipientStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecipientStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecipientStatus::Pending),
            "sent" => Ok(RecipientStatus::Sent),
            "failed" => Ok(RecipientStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

// ── Counters ──────────────────────────────────────────────────────────────────

/// Outcome counters of a blast.
///
/// Invariant: `sent + failed <= total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlastCounters {
    pub total: u32,
    pub sent: u32,
    pub failed: u32,
}

impl BlastCounters {
    pub fn settled(&self) -> u32 {
        self.sent + self.failed
    }

    /// Every recipient has an outcome.
    pub fn is_settled(&self) -> bool {
        self.settled() >= self.total
    }

    /// Status a settled blast ends in: `failed` only when nothing at all was
    /// delivered, otherwise `completed` (partial failure still completes).
    pub fn terminal_status(&self) -> BlastStatus {
        if self.failed > 0 && self.sent == 0 {
            BlastStatus::Failed
        } else {
            BlastStatus::Completed
        }
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

/// A stored blast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blast {
    pub id: BlastId,
    pub device_key: DeviceKey,
    pub name: String,
    pub message: String,
    pub media_url: Option<String>,
    pub delay_min_secs: u32,
    pub delay_max_secs: u32,
    pub scheduled_at: DateTime<Utc>,
    pub status: BlastStatus,
    pub counters: BlastCounters,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a blast together with its (immutable) recipient set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBlast {
    pub device_key: DeviceKey,
    pub name: String,
    pub message: String,
    pub media_url: Option<String>,
    pub delay_min_secs: u32,
    pub delay_max_secs: u32,
    pub scheduled_at: DateTime<Utc>,
    pub recipients: Vec<String>,
}

/// A stored recipient of a blast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub blast_id: BlastId,
    pub phone_number: String,
    pub status: RecipientStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Recipient {
    /// Transport chat id for this recipient's address.
    pub fn chat_id(&self) -> String {
        chat_id_for(&self.phone_number)
    }
}

/// Normalises a phone address into an individual chat id: every non-digit is
/// dropped and the network suffix appended.
pub fn chat_id_for(phone_number: &str) -> String {
    let digits: String = phone_number.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("{digits}{INDIVIDUAL_CHAT_SUFFIX}")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
