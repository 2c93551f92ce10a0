use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Token-bucket admission settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    /// Bucket capacity; refilled to full once per window.
    pub max_tokens: u32,
    pub window_ms: u64,
    /// Minimum spacing between two admissions, even with tokens available.
    pub min_delay_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 10,
            window_ms: 60_000,
            min_delay_ms: 500,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConcurrencyConfig {
    pub max_concurrent: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_concurrent: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FailurePolicyConfig {
    /// Consecutive failed batches after which an entry is halted.
    pub consecutive_failure_threshold: u32,
    pub retry_policy: RetryPolicyConfig,
    pub retryable_errors: Vec<u16>,
    pub fatal_errors: Vec<u16>,
}

impl Default for FailurePolicyConfig {
    fn default() -> Self {
        Self {
            consecutive_failure_threshold: 5,
            retry_policy: RetryPolicyConfig::default(),
            retryable_errors: vec![408, 429, 500, 502, 503, 504],
            fatal_errors: vec![400, 401, 403, 404, 413],
        }
    }
}

/// Request-size constraints imposed by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PayloadConfig {
    pub max_payload_bytes: usize,
    pub max_reference_images: usize,
    pub prompt_reserve_bytes: usize,
    pub metadata_reserve_bytes: usize,
    pub safety_margin_percent: f64,
    pub min_per_image_bytes: usize,
    pub max_per_image_bytes: usize,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 20 * 1024 * 1024,
            max_reference_images: 10,
            prompt_reserve_bytes: 64 * 1024,
            metadata_reserve_bytes: 16 * 1024,
            safety_margin_percent: 10.0,
            min_per_image_bytes: 50 * 1024,
            max_per_image_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompressionConfig {
    /// Longest side, in pixels, a reference is ever encoded at.
    pub max_dimension: u32,
    /// Multiplier applied to the dimension once quality reduction is exhausted.
    pub emergency_dimension_factor: f64,
    pub initial_quality: u8,
    pub min_quality: u8,
    pub quality_step: u8,
    pub max_attempts: u32,
    /// Results needing more attempts than this are reported as heavily compressed.
    pub heavy_compression_threshold: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_dimension: 2048,
            emergency_dimension_factor: 0.75,
            initial_quality: 90,
            min_quality: 50,
            quality_step: 10,
            max_attempts: 12,
            heavy_compression_threshold: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    /// Timeout applied to every provider call.
    pub request_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 120_000,
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Optional caps for target-mode entries. `None` means unbounded; only the
/// circuit breaker stops an entry whose batches keep failing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetLimitsConfig {
    pub max_total_batches: Option<u32>,
    pub max_wall_clock_ms: Option<u64>,
}

/// Complete settings for the dispatch engine.
///
/// Owned by an external settings store. Load it with
/// [`DispatchConfig::load`], [`DispatchConfig::from_toml_str`] or the
/// [`builder`](DispatchConfig::builder); all of them validate before
/// returning, so a value in hand is always in range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchConfig {
    pub rate_limit: RateLimitConfig,
    pub concurrency: ConcurrencyConfig,
    pub failure_policy: FailurePolicyConfig,
    pub payload: PayloadConfig,
    pub compression: CompressionConfig,
    pub transport: TransportConfig,
    pub target_limits: TargetLimitsConfig,
}

impl DispatchConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> DispatchConfigBuilder {
        DispatchConfigBuilder::default()
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load settings from a `.json` or `.toml` file (TOML unless the
    /// extension is `json`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_toml_str(&contents),
        }
    }

    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rate = &self.rate_limit;
        if rate.max_tokens == 0 {
            return Err(ConfigError::ZeroRateCapacity);
        }
        if rate.window_ms == 0 {
            return Err(ConfigError::invalid("rateLimit.windowMs", "must be > 0"));
        }

        if self.concurrency.max_concurrent == 0 {
            return Err(ConfigError::invalid(
                "concurrency.maxConcurrent",
                "must be > 0",
            ));
        }

        let failure = &self.failure_policy;
        if failure.consecutive_failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "failurePolicy.consecutiveFailureThreshold",
                "must be > 0",
            ));
        }
        let retry = &failure.retry_policy;
        if retry.backoff_multiplier.is_nan() || retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "failurePolicy.retryPolicy.backoffMultiplier",
                format!("must be >= 1.0, got {}", retry.backoff_multiplier),
            ));
        }
        if retry.max_backoff_ms < retry.backoff_ms {
            return Err(ConfigError::invalid(
                "failurePolicy.retryPolicy.maxBackoffMs",
                format!(
                    "{} is below backoffMs {}",
                    retry.max_backoff_ms, retry.backoff_ms
                ),
            ));
        }
        if let Some(code) = failure
            .retryable_errors
            .iter()
            .find(|c| failure.fatal_errors.contains(c))
        {
            return Err(ConfigError::invalid(
                "failurePolicy.retryableErrors",
                format!("status {} is listed as both retryable and fatal", code),
            ));
        }

        let payload = &self.payload;
        if !(0.0..100.0).contains(&payload.safety_margin_percent) {
            return Err(ConfigError::invalid(
                "payload.safetyMarginPercent",
                format!("must be in [0, 100), got {}", payload.safety_margin_percent),
            ));
        }
        if payload.min_per_image_bytes == 0 {
            return Err(ConfigError::invalid(
                "payload.minPerImageBytes",
                "must be > 0",
            ));
        }
        if payload.min_per_image_bytes > payload.max_per_image_bytes {
            return Err(ConfigError::invalid(
                "payload.minPerImageBytes",
                format!(
                    "{} exceeds maxPerImageBytes {}",
                    payload.min_per_image_bytes, payload.max_per_image_bytes
                ),
            ));
        }

        let comp = &self.compression;
        if comp.max_dimension == 0 {
            return Err(ConfigError::invalid(
                "compression.maxDimension",
                "must be > 0",
            ));
        }
        if !(comp.emergency_dimension_factor > 0.0 && comp.emergency_dimension_factor < 1.0) {
            return Err(ConfigError::invalid(
                "compression.emergencyDimensionFactor",
                format!(
                    "must be in (0, 1), got {}",
                    comp.emergency_dimension_factor
                ),
            ));
        }
        for (field, quality) in [
            ("compression.initialQuality", comp.initial_quality),
            ("compression.minQuality", comp.min_quality),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(ConfigError::invalid(
                    field,
                    format!("must be in 1..=100, got {}", quality),
                ));
            }
        }
        if comp.min_quality > comp.initial_quality {
            return Err(ConfigError::invalid(
                "compression.minQuality",
                format!(
                    "{} exceeds initialQuality {}",
                    comp.min_quality, comp.initial_quality
                ),
            ));
        }
        if comp.quality_step == 0 {
            return Err(ConfigError::invalid(
                "compression.qualityStep",
                "must be > 0",
            ));
        }
        if comp.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "compression.maxAttempts",
                "must be > 0",
            ));
        }

        if self.transport.request_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "transport.requestTimeoutMs",
                "must be > 0",
            ));
        }

        Ok(())
    }
}

/// Builder for [`DispatchConfig`].
#[derive(Default)]
pub struct DispatchConfigBuilder {
    config: DispatchConfig,
}

impl DispatchConfigBuilder {
    pub fn with_rate_limit(mut self, max_tokens: u32, window: Duration, min_delay: Duration) -> Self {
        self.config.rate_limit = RateLimitConfig {
            max_tokens,
            window_ms: window.as_millis() as u64,
            min_delay_ms: min_delay.as_millis() as u64,
        };
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.config.concurrency.max_concurrent = max;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_policy.consecutive_failure_threshold = threshold;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicyConfig) -> Self {
        self.config.failure_policy.retry_policy = retry;
        self
    }

    /// Replace the retryable and fatal HTTP status lists.
    pub fn with_status_codes(mut self, retryable: Vec<u16>, fatal: Vec<u16>) -> Self {
        self.config.failure_policy.retryable_errors = retryable;
        self.config.failure_policy.fatal_errors = fatal;
        self
    }

    pub fn with_payload(mut self, payload: PayloadConfig) -> Self {
        self.config.payload = payload;
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.transport.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_target_limits(mut self, limits: TargetLimitsConfig) -> Self {
        self.config.target_limits = limits;
        self
    }

    /// Validate and build the final [`DispatchConfig`].
    pub fn build(self) -> Result<DispatchConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
