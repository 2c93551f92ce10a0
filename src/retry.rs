use std::time::Duration;

use crate::config::FailurePolicyConfig;
use crate::error::DispatchError;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    Fatal,
}

/// Maps (error, attempt) to a retry decision.
///
/// `attempt` counts retries already made: zero after the first try fails.
/// Fatal status codes win over everything; retryable codes and non-HTTP
/// failures (network, timeout, empty response) back off exponentially until
/// `max_retries`; anything else is fatal.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff_ms: u64,
    backoff_multiplier: f64,
    max_backoff_ms: u64,
    retryable: Vec<u16>,
    fatal: Vec<u16>,
}

impl RetryPolicy {
    pub fn new(config: &FailurePolicyConfig) -> Self {
        let retry = &config.retry_policy;
        Self {
            max_retries: retry.max_retries,
            backoff_ms: retry.backoff_ms,
            backoff_multiplier: retry.backoff_multiplier,
            max_backoff_ms: retry.max_backoff_ms,
            retryable: config.retryable_errors.clone(),
            fatal: config.fatal_errors.clone(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn decide(&self, error: &DispatchError, attempt: u32) -> RetryDecision {
        let retryable = match error {
            DispatchError::Provider { status, .. } => {
                if self.fatal.contains(status) {
                    return RetryDecision::Fatal;
                }
                self.retryable.contains(status)
            }
            DispatchError::Transport(_) | DispatchError::Timeout | DispatchError::EmptyResponse => {
                true
            }
            _ => false,
        };

        if retryable && attempt < self.max_retries {
            RetryDecision::Retry {
                after: self.backoff(attempt),
            }
        } else {
            RetryDecision::Fatal
        }
    }

    /// `min(backoff * multiplier^attempt, max_backoff)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_backoff_ms as f64)
        } else {
            self.max_backoff_ms as f64
        };
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicyConfig;
    use crate::error::ConfigError;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(&FailurePolicyConfig {
            consecutive_failure_threshold: 5,
            retry_policy: RetryPolicyConfig {
                max_retries: 3,
                backoff_ms: 500,
                backoff_multiplier: 2.0,
                max_backoff_ms: 3_000,
            },
            retryable_errors: vec![429, 503],
            fatal_errors: vec![401, 403],
        })
    }

    fn provider(status: u16) -> DispatchError {
        DispatchError::Provider {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn test_fatal_status_ignores_attempt() {
        let policy = policy();
        for attempt in 0..10 {
            assert_eq!(policy.decide(&provider(401), attempt), RetryDecision::Fatal);
        }
    }

    #[test]
    fn test_retryable_status_backs_off() {
        let policy = policy();
        assert_eq!(
            policy.decide(&provider(429), 0),
            RetryDecision::Retry {
                after: Duration::from_millis(500)
            }
        );
        assert_eq!(
            policy.decide(&provider(429), 2),
            RetryDecision::Retry {
                after: Duration::from_millis(2_000)
            }
        );
    }

    #[test]
    fn test_retryable_status_exhausted_at_max_retries() {
        let policy = policy();
        assert_eq!(policy.decide(&provider(429), 3), RetryDecision::Fatal);
    }

    #[test]
    fn test_unrecognized_status_is_fatal() {
        let policy = policy();
        assert_eq!(policy.decide(&provider(418), 0), RetryDecision::Fatal);
    }

    #[test]
    fn test_network_errors_are_retryable() {
        let policy = policy();
        let network = DispatchError::Transport("connection reset".into());
        assert!(matches!(
            policy.decide(&network, 0),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.decide(&DispatchError::Timeout, 1),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.decide(&DispatchError::EmptyResponse, 2),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(policy.decide(&network, 3), RetryDecision::Fatal);
    }

    #[test]
    fn test_local_failures_are_fatal() {
        let policy = policy();
        let exhausted = DispatchError::CompressionExhausted {
            target_bytes: 1,
            attempts: 3,
            smallest_bytes: 100,
        };
        assert_eq!(policy.decide(&exhausted, 0), RetryDecision::Fatal);
        let config = DispatchError::Configuration(ConfigError::ZeroRateCapacity);
        assert_eq!(policy.decide(&config, 0), RetryDecision::Fatal);
    }

    #[test]
    fn test_backoff_never_exceeds_max() {
        let policy = policy();
        for attempt in 0..64 {
            assert!(policy.backoff(attempt) <= Duration::from_millis(3_000));
        }
        assert_eq!(policy.backoff(3), Duration::from_millis(3_000));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_millis(3_000));
    }
}
