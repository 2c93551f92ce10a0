/// Per-entry consecutive-failure counter backing the circuit breaker.
///
/// Owned by the dispatcher's entry state, so it needs no locking.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    threshold: u32,
    consecutive_failures: u32,
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive_failures: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Count a failed batch. Returns `true` once the breaker has tripped.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.is_tripped()
    }

    pub fn is_tripped(&self) -> bool {
        self.consecutive_failures >= self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}
