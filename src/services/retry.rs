use std::time::Duration;

/// Upstream retries allowed within one processing attempt.
pub const MAX_RETRIES: u32 = 5;

const RETRYABLE_STATUSES: [u16; 4] = [429, 500, 503, 504];

/// Outcome of consulting the retry policy for one failed upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

/// Status-code driven retry policy. Stateless and deterministic.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn is_retryable(status: u16) -> bool {
        RETRYABLE_STATUSES.contains(&status)
    }

    /// Backoff before the next attempt for a retryable status.
    pub fn backoff(status: u16) -> Duration {
        let millis = match status {
            429 => 2_000,
            500 => 10_000,
            504 => 30_000,
            503 => 120_000,
            _ => 5_000,
        };
        Duration::from_millis(millis)
    }

    pub fn decide(&self, status: u16, retry_count: u32) -> RetryDecision {
        if !Self::is_retryable(status) {
            return RetryDecision {
                retry: false,
                delay: Duration::ZERO,
            };
        }

        RetryDecision {
            retry: retry_count < self.max_retries,
            delay: Self::backoff(status),
        }
    }

    /// Human-readable reason shown while a job is retrying.
    pub fn reason(status: u16) -> &'static str {
        if status == 429 {
            "Rate limit reached"
        } else {
            "Server error"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_table() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(429, 0).delay, Duration::from_secs(2));
        assert_eq!(policy.decide(500, 0).delay, Duration::from_secs(10));
        assert_eq!(policy.decide(504, 0).delay, Duration::from_secs(30));
        assert_eq!(policy.decide(503, 0).delay, Duration::from_secs(120));
    }

    #[test]
    fn test_non_retryable_statuses() {
        let policy = RetryPolicy::default();
        for status in [400, 401, 403, 404, 422, 502] {
            let decision = policy.decide(status, 0);
            assert!(!decision.retry, "status {} should not retry", status);
        }
    }

    #[test]
    fn test_retry_stops_at_max() {
        let policy = RetryPolicy::default();
        assert!(policy.decide(503, MAX_RETRIES - 1).retry);
        assert!(!policy.decide(503, MAX_RETRIES).retry);
        assert!(!policy.decide(429, MAX_RETRIES + 3).retry);
    }

    #[test]
    fn test_reason_labels() {
        assert_eq!(RetryPolicy::reason(429), "Rate limit reached");
        assert_eq!(RetryPolicy::reason(503), "Server error");
    }
}
