// Retry budget and backoff
use std::time::Duration;

use crate::config::RelayConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

/// What to do after a retryable failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    pub fn from_config(relay: &RelayConfig) -> Self {
        Self {
            base_delay: relay.retry_base_delay(),
            max_attempts: relay.max_retry_attempts,
        }
    }

    /// Linear backoff: `base_delay * (retry_count + 1)`, i.e. the delay grows
    /// with the retry count the record is about to reach.
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if retry_count >= self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.base_delay.saturating_mul(retry_count.saturating_add(1)))
        }
    }

    /// Delay for deferrals that don't consume the budget
    pub fn defer_delay(&self) -> Duration {
        self.base_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff_then_give_up() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(30),
            max_attempts: 3,
        };
        assert_eq!(policy.decide(0), RetryDecision::RetryAfter(Duration::from_secs(30)));
        assert_eq!(policy.decide(1), RetryDecision::RetryAfter(Duration::from_secs(60)));
        assert_eq!(policy.decide(2), RetryDecision::RetryAfter(Duration::from_secs(90)));
        assert_eq!(policy.decide(3), RetryDecision::GiveUp);
        assert_eq!(policy.decide(10), RetryDecision::GiveUp);
    }

    #[test]
    fn test_zero_budget_never_retries() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_attempts: 0,
        };
        assert_eq!(policy.decide(0), RetryDecision::GiveUp);
    }
}
