//! Domain entities.
//!
//! Pure data types with no I/O.  The server crate persists them in SQLite and
//! moves them between the lifecycle manager and the delivery pipeline.

pub mod blast;
pub mod device;
pub mod message;
