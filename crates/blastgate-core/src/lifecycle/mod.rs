//! Connection lifecycle policies.
//!
//! # How reconnection works (for beginners)
//!
//! A device session can close at any time.  The transport reports a numeric
//! status code with every closure, and [`disconnect::DisconnectReason`]
//! sorts those codes into two buckets:
//!
//! - **Terminal** – the credentials are no longer usable (the phone logged
//!   the device out, another session replaced this one, ...).  Reconnecting
//!   would fail forever, so the session files are deleted and the operator
//!   must pair again.
//!
//! - **Transient** – the socket dropped, the server asked for a restart, or
//!   the code is simply unknown.  The device reconnects on its own after a
//!   growing delay:
//!
//! ```text
//!   attempt:  1   2   3   4    5    6    7    8    9    10   11
//!   delay:    2s  4s  8s  16s  32s  60s  60s  60s  60s  60s  give up
//! ```
//!
//! [`reconnect::ReconnectTracker`] counts the attempts and resets whenever a
//! connection opens successfully.

pub mod disconnect;
pub mod reconnect;
