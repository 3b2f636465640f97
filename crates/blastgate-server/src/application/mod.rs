//! Application layer use cases for the blastgate server.
//!
//! # What is the "application" layer? (for beginners)
//!
//! The *application* layer sits between the pure rules in `blastgate-core`
//! (backoff, disconnect classification, pacing) and the infrastructure
//! (transport, SQLite, webhook, HTTP).  Its use cases combine the two to
//! fulfil an operator's goal, e.g. "keep this device connected" or "deliver
//! this blast".
//!
//! # Sub-modules
//!
//! - **`lifecycle`**     – One actor per device that opens sessions, reacts
//!   to pairing codes and closures, and schedules reconnects.
//!
//! - **`status_bridge`** – Persists every device status change, then sends
//!   the matching webhook notification.
//!
//! - **`orchestrator`**  – Claims a blast and spawns one paced, retrying
//!   delivery task per recipient.
//!
//! - **`aggregator`**    – Folds recipient outcomes into the blast counters
//!   and final status, serialized per blast.
//!
//! - **`trigger`**       – Periodically starts blasts whose scheduled time
//!   has come.

pub mod aggregator;
pub mod keyed;
pub mod lifecycle;
pub mod orchestrator;
pub mod status_bridge;
pub mod trigger;
