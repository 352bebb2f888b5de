use crate::error::FatalConnectionError;
use std::time::Duration;

/// Linear reconnect schedule: attempt `n` waits `base_delay * n`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    /// Returned once, on the first failure past the cap.
    GiveUp(FatalConnectionError),
    /// Every later failure until the next successful connect.
    Exhausted,
}

/// Counts consecutive connection failures for one stream URL.
#[derive(Debug)]
pub struct ReconnectTracker {
    policy: ReconnectPolicy,
    url: String,
    attempts: u32,
    fatal_reported: bool,
}

impl ReconnectTracker {
    pub fn new(policy: ReconnectPolicy, url: impl Into<String>) -> Self {
        Self {
            policy,
            url: url.into(),
            attempts: 0,
            fatal_reported: false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_connected(&mut self) {
        self.attempts = 0;
        self.fatal_reported = false;
    }

    pub fn on_failure(&mut self) -> ReconnectDecision {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts <= self.policy.max_attempts {
            return ReconnectDecision::Retry {
                attempt: self.attempts,
                delay: self.policy.delay_for(self.attempts),
            };
        }
        if self.fatal_reported {
            return ReconnectDecision::Exhausted;
        }
        self.fatal_reported = true;
        ReconnectDecision::GiveUp(FatalConnectionError {
            url: self.url.clone(),
            attempts: self.policy.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_attempts: u32) -> ReconnectTracker {
        ReconnectTracker::new(
            ReconnectPolicy {
                base_delay: Duration::from_millis(500),
                max_attempts,
            },
            "ws://node",
        )
    }

    #[test]
    fn delay_grows_linearly_with_attempt() {
        let mut t = tracker(4);
        for n in 1..=4 {
            assert_eq!(
                t.on_failure(),
                ReconnectDecision::Retry {
                    attempt: n,
                    delay: Duration::from_millis(500 * n as u64)
                }
            );
        }
    }

    #[test]
    fn fatal_error_is_raised_exactly_once() {
        let mut t = tracker(2);
        t.on_failure();
        t.on_failure();
        let fatal: Vec<_> = (0..5)
            .map(|_| t.on_failure())
            .filter(|d| matches!(d, ReconnectDecision::GiveUp(_)))
            .collect();
        assert_eq!(
            fatal,
            vec![ReconnectDecision::GiveUp(FatalConnectionError {
                url: "ws://node".into(),
                attempts: 2
            })]
        );
    }

    #[test]
    fn successful_connect_resets_the_schedule() {
        let mut t = tracker(3);
        t.on_failure();
        t.on_failure();
        t.on_connected();
        assert_eq!(t.attempts(), 0);
        assert!(matches!(
            t.on_failure(),
            ReconnectDecision::Retry { attempt: 1, .. }
        ));
    }
}
