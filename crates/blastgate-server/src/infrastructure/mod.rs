//! Infrastructure layer for the blastgate server.
//!
//! Contains the adapters that touch the outside world: the messaging
//! transport seam, per-device session ownership and credential directories,
//! SQLite storage and TOML configuration, the status webhook, and the axum
//! HTTP surface.

pub mod http;
pub mod notify;
pub mod session;
pub mod storage;
pub mod transport;
