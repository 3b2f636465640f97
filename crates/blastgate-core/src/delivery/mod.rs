//! Delivery pacing and retry rules.
//!
//! Sending hundreds of messages back to back gets an account rate-limited
//! or banned by the network.  Every blast therefore spreads its sends out:
//! the first recipient is contacted immediately, and every following one a
//! random `delay_min..=delay_max` seconds after the previous one.
//!
//! ```text
//!   recipient:  A     B          C       D
//!   offset:     0s    7s         19s     25s
//!               |-----|----------|-------|
//!                 7s      12s       6s      (each drawn from [5s, 15s])
//! ```

pub mod pacing;
pub mod retry;
