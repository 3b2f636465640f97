//! # blastgate-core
//!
//! Shared library for blastgate containing the domain entities (devices,
//! blasts, recipients), the connection lifecycle policies and the delivery
//! pacing and retry rules.
//!
//! This crate is used by the server crate and by its integration tests.
//! It has zero dependencies on sockets, databases, or the async runtime.
//!
//! # Architecture overview (for beginners)
//!
//! blastgate keeps a set of messaging-network *devices* (linked phone
//! identities) connected, and pushes bulk messages ("blasts") through them.
//!
//! This crate (`blastgate-core`) is the shared foundation.  It defines:
//!
//! - **`domain`** – The records the system stores: [`Device`], [`Blast`],
//!   [`Recipient`], their status enums, and the [`MessagePayload`] that is
//!   handed to the network for each send.
//!
//! - **`lifecycle`** – How a closed connection is classified
//!   ([`DisconnectReason`]) and how long to wait before reconnecting
//!   ([`ReconnectPolicy`], [`ReconnectTracker`]).
//!
//! - **`delivery`** – How sends are spread out in time ([`JitterPacing`]),
//!   how often a failed send is retried ([`DeliveryPolicy`]), and how a
//!   blast's final status is derived from its counters ([`BlastCounters`]).
//!
//! - **`pairing`** – Renders a pairing code into an image payload that an
//!   operator can scan.

pub mod delivery;
pub mod domain;
pub mod lifecycle;
pub mod pairing;

// Re-export the most-used types at the crate root so callers can write
// `blastgate_core::Device` instead of `blastgate_core::domain::device::Device`.
pub use delivery::pacing::{JitterPacing, PacingError};
pub use delivery::retry::{DeliveryOutcome, DeliveryPolicy, DEVICE_NOT_CONNECTED};
pub use domain::blast::{
    chat_id_for, Blast, BlastCounters, BlastId, BlastStatus, NewBlast, Recipient, RecipientId,
    RecipientStatus,
};
pub use domain::device::{
    AccountInfo, Device, DeviceKey, DeviceKeyError, DeviceStatus, UnknownStatus,
};
pub use domain::message::{MediaKind, MessagePayload};
pub use lifecycle::disconnect::{DisconnectReason, TerminalReason};
pub use lifecycle::reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectTracker};
pub use pairing::{render_pairing_code, PairingError};
