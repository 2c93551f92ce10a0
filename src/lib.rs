//! # Image Gen Dispatch
//!
//! Bulk dispatch engine for image-generation queues.
//!
//! ## Features
//!
//! - Token-bucket rate limiting with a minimum spacing between requests
//! - Global concurrency cap shared by every entry
//! - Fixed-count and target-count execution modes, interleaved round-robin
//! - Payload budgeting and iterative JPEG compression of reference images
//! - Exponential-backoff retries classified by HTTP status
//! - Per-entry circuit breaker
//! - Pause/resume per entry and cancellation of the whole run
//!
//! ## Quick Start
//!
//! 1. Implement [`Transport`] for your provider client
//! 2. Load a [`DispatchConfig`] (or use [`DispatchConfig::builder()`])
//! 3. Create a [`Dispatcher`], optionally with a progress channel
//! 4. Call [`Dispatcher::run()`] with your [`QueueEntry`] list
//!
//! See the `demos/` directory for complete usage examples.

pub mod budget;
pub mod compress;
pub mod concurrency;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod failure;
pub mod logging;
pub mod rate_limiter;
pub mod retry;
pub mod types;

pub use budget::PayloadBudgeter;
pub use compress::{CompressionResult, ImageCompressor, JpegReferenceEncoder, ReferenceEncoder};
pub use concurrency::{ConcurrencyGate, GatePermit};
pub use config::{
    CompressionConfig, ConcurrencyConfig, DispatchConfig, DispatchConfigBuilder,
    FailurePolicyConfig, PayloadConfig, RateLimitConfig, RetryPolicyConfig, TargetLimitsConfig,
    TransportConfig,
};
pub use dispatcher::{DispatchHandle, Dispatcher, DispatcherBuilder};
pub use error::{ConfigError, DispatchError, TransportError};
pub use events::{
    DispatchEvent, EntryProgressEvent, HeavyCompressionEvent, ImagesProducedEvent,
    RunFinishedEvent,
};
pub use failure::FailureTracker;
pub use rate_limiter::RateLimiter;
pub use retry::{RetryDecision, RetryPolicy};
pub use types::{
    DispatchSummary, EntryProgress, EntryState, ExecutionMode, GeneratedImage, GenerationJob,
    GenerationResponse, PreparedReference, PromptSource, QueueEntry, QueueGroup, ReferenceImage,
    Resolution,
};

/// Provider client used to execute generation jobs.
///
/// The dispatcher applies its own timeout around every call, so
/// implementations need not. Return [`TransportError::Status`] (or an `Ok`
/// response with a non-2xx `status_code`) for HTTP failures so they can be
/// classified as retryable or fatal.
///
/// # Example
///
/// ```ignore
/// use image_gen_dispatch::*;
///
/// struct HttpProvider {
///     client: MyHttpClient,
/// }
///
/// impl Transport for HttpProvider {
///     async fn send(&self, job: &GenerationJob) -> Result<GenerationResponse, TransportError> {
///         let images = self.client.generate(&job.prompt, job.image_count).await?;
///         Ok(GenerationResponse::ok(images))
///     }
/// }
/// ```
pub trait Transport: Send + Sync + 'static {
    /// Send one job and wait for the provider's response.
    fn send(
        &self,
        job: &GenerationJob,
    ) -> impl std::future::Future<Output = Result<GenerationResponse, TransportError>> + Send;
}
