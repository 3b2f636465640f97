//! Accumulated random-jitter send schedule.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacingError {
    #[error("minimum delay {min}s exceeds maximum delay {max}s")]
    InvertedRange { min: u32, max: u32 },
}

/// Pacing range for one blast, in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterPacing {
    min_secs: u32,
    max_secs: u32,
}

impl JitterPacing {
    /// # Errors
    ///
    /// Returns [`PacingError::InvertedRange`] when `min_secs > max_secs`.
    pub fn new(min_secs: u32, max_secs: u32) -> Result<Self, PacingError> {
        if min_secs > max_secs {
            return Err(PacingError::InvertedRange {
                min: min_secs,
                max: max_secs,
            });
        }
        Ok(Self { min_secs, max_secs })
    }

    /// Like [`new`](Self::new) but swaps inverted bounds instead of failing.
    pub fn ordered(a: u32, b: u32) -> Self {
        Self {
            min_secs: a.min(b),
            max_secs: a.max(b),
        }
    }

    pub fn min_secs(&self) -> u32 {
        self.min_secs
    }

    pub fn max_secs(&self) -> u32 {
        self.max_secs
    }

    /// Offsets (from dispatch time) at which each of `count` sends starts.
    ///
    /// The first offset is zero; each later one adds a fresh uniform draw
    /// from `[min, max]` to its predecessor, so offsets never decrease.
    pub fn schedule<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Vec<Duration> {
        let mut offsets = Vec::with_capacity(count);
        let mut elapsed = Duration::ZERO;
        for index in 0..count {
            if index > 0 {
                let step = rng.gen_range(self.min_secs..=self.max_secs);
                elapsed += Duration::from_secs(u64::from(step));
            }
            offsets.push(elapsed);
        }
        offsets
    }
}
