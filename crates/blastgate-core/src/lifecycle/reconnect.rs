//! Bounded exponential backoff for transient disconnects.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff parameters.
///
/// The delay before reconnect attempt `n` (1-based) is
/// `min(2^n × base_delay, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// What to do after a transient closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait `delay`, then make reconnect attempt number `attempt`.
    Retry { attempt: u32, delay: Duration },
    /// The attempt budget is spent; the tracker has already been reset.
    GiveUp { attempts: u32 },
}

/// Per-device attempt counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectTracker {
    attempts: u32,
}

impl ReconnectTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts made since the last successful open (or reset).
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records a transient closure and decides whether to try again.
    pub fn on_transient_close(&mut self, policy: &ReconnectPolicy) -> ReconnectDecision {
        if self.attempts >= policy.max_attempts {
            let attempts = self.attempts;
            self.reset();
            return ReconnectDecision::GiveUp { attempts };
        }
        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: policy.delay_for(self.attempts),
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_delays() {
        // Arrange
        let policy = ReconnectPolicy::default();

        // Act
        let delays: Vec<u64> = (1..=10).map(|n| policy.delay_for(n).as_secs()).collect();

        // Assert
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60, 60, 60, 60]);
    }

    #[test]
    fn test_delay_saturates_for_huge_attempts() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(200), Duration::from_secs(60));
    }

    #[test]
    fn test_tracker_gives_up_after_budget_and_resets() {
        // Arrange
        let policy = ReconnectPolicy::default();
        let mut tracker = ReconnectTracker::new();

        // Act
        for expected in 1..=10 {
            match tracker.on_transient_close(&policy) {
                ReconnectDecision::Retry { attempt, .. } => assert_eq!(attempt, expected),
                other => panic!("unexpected {other:?} at attempt {expected}"),
            }
        }
        let eleventh = tracker.on_transient_close(&policy);

        // Assert
        assert_eq!(eleventh, ReconnectDecision::GiveUp { attempts: 10 });
        assert_eq!(tracker.attempts(), 0);
    }

    #[test]
    fn test_reset_restarts_the_sequence() {
        let policy = ReconnectPolicy::default();
        let mut tracker = ReconnectTracker::new();
        tracker.on_transient_close(&policy);
        tracker.on_transient_close(&policy);

        tracker.reset();

        assert_eq!(
            tracker.on_transient_close(&policy),
            ReconnectDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(2)
            }
        );
    }
}
