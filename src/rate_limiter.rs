//! Token-bucket admission gate.
//!
//! The bucket holds up to `max_tokens` tokens and is refilled to full
//! capacity once every `window`. Each admission consumes one token, and two
//! admissions are never closer than `min_delay`, which smooths bursts at the
//! start of a window.
//!
//! ```ignore
//! let limiter = RateLimiter::new(config.rate_limit.clone());
//! let cancel = CancellationToken::new();
//! limiter.acquire(&cancel).await?; // one request admitted
//! ```

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;
use crate::error::{ConfigError, DispatchError};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_at: Instant,
    last_admission_at: Option<Instant>,
}

/// Shared token-bucket rate limiter.
///
/// `acquire` never rejects; it only delays. The bucket is the one piece of
/// global state all entries share, so it sits behind its own lock and is
/// never held across a sleep.
#[derive(Debug)]
pub struct RateLimiter {
    max_tokens: f64,
    window: Duration,
    min_delay: Duration,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            max_tokens: f64::from(config.max_tokens),
            window: config.window(),
            min_delay: config.min_delay(),
            state: Mutex::new(BucketState {
                tokens: f64::from(config.max_tokens),
                last_refill_at: Instant::now(),
                last_admission_at: None,
            }),
        }
    }

    /// Wait for a token, then consume it.
    ///
    /// Returns [`DispatchError::Cancelled`] if `cancel` fires while waiting.
    /// A zero-capacity bucket can never admit anything, so that is reported
    /// as a configuration error instead of waiting forever.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), DispatchError> {
        if self.max_tokens < 1.0 {
            tracing::error!("rate limiter has zero capacity; generation is disabled");
            return Err(ConfigError::ZeroRateCapacity.into());
        }

        loop {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                self.refill(&mut state, now);

                let delay_wait = state
                    .last_admission_at
                    .map(|last| (last + self.min_delay).saturating_duration_since(now))
                    .unwrap_or(Duration::ZERO);

                if state.tokens >= 1.0 && delay_wait.is_zero() {
                    state.tokens -= 1.0;
                    state.last_admission_at = Some(now);
                    return Ok(());
                }

                let token_wait = if state.tokens >= 1.0 {
                    Duration::ZERO
                } else {
                    (state.last_refill_at + self.window).saturating_duration_since(now)
                };
                token_wait.max(delay_wait)
            };

            tracing::trace!(wait_ms = wait.as_millis() as u64, "rate limiter waiting");
            tokio::select! {
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Tokens currently available (after applying any due refill).
    pub async fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill_at);
        if elapsed >= self.window {
            // Advance by whole windows so refills stay aligned to the first one.
            let windows = (elapsed.as_nanos() / self.window.as_nanos().max(1)) as u32;
            state.last_refill_at += self.window * windows;
            state.tokens = self.max_tokens;
        }
    }
}
