//! Messaging-network transport seam.
//!
//! The wire protocol (handshake, encryption, media upload) lives outside this
//! crate.  Everything the server needs from it is captured by two traits:
//!
//! - [`Transport`] opens a session for a device, given the directory where the
//!   session may keep its credentials.
//! - [`SessionHandle`] is the live session: send, log out, close.
//!
//! A session reports what happens to it through a stream of
//! [`TransportEvent`]s, delivered on the channel returned with the handle:
//!
//! ```text
//!   connect() ──▶ QrIssued("2@..")  (zero or more, until the phone scans)
//!             ──▶ Opened(account)
//!             ──▶ Closed { status_code }   (always last)
//! ```
//!
//! The [`mock`] module provides an in-process implementation used by the
//! tests and by the binary until a real protocol adapter is plugged in.

pub mod mock;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blastgate_core::{AccountInfo, DeviceKey, MessagePayload};
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for transport operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("could not open session: {0}")]
    Connect(String),

    #[error("opening the session timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("session storage unavailable: {0}")]
    SessionStorage(String),

    #[error("{0}")]
    Send(String),

    #[error("session is closed")]
    Closed,
}

/// Something that happened to a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A fresh pairing code the operator must scan.
    QrIssued(String),
    /// The session authenticated as `account`.
    Opened(AccountInfo),
    /// The session ended.  No further events follow.
    Closed { status_code: u16 },
}

/// Acknowledgement for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
}

/// A live session for one device.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn send_message(
        &self,
        chat_id: &str,
        payload: &MessagePayload,
    ) -> Result<SendReceipt, TransportError>;

    /// Unlinks the device from the account.  The session closes afterwards.
    async fn logout(&self) -> Result<(), TransportError>;

    /// Closes the socket without unlinking.  Idempotent.
    async fn close(&self);

    /// Identity the session authenticated as, once opened.
    fn account(&self) -> Option<AccountInfo>;
}

/// A freshly opened session and its event stream.
pub struct Connection {
    pub handle: Arc<dyn SessionHandle>,
    pub events: mpsc::Receiver<TransportEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Factory for device sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        key: &DeviceKey,
        session_dir: &Path,
    ) -> Result<Connection, TransportError>;
}
