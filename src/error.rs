use thiserror::Error;

/// Configuration problems. Always fatal, never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Rate limiter has zero capacity: generation is disabled by policy")]
    ZeroRateCapacity,

    #[error(
        "Payload budget unsatisfiable: {per_image} bytes per image for {image_count} \
         image(s) is below the {min_per_image} byte minimum"
    )]
    BudgetUnsatisfiable {
        per_image: usize,
        min_per_image: usize,
        image_count: usize,
    },

    #[error("Unknown library prompt: {0}")]
    UnknownPrompt(String),

    #[error("Invalid queue entry {entry_id}: {reason}")]
    InvalidEntry { entry_id: String, reason: String },

    #[error("Failed to parse settings: {0}")]
    Parse(String),

    #[error("Failed to read settings: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors returned by an injected [`Transport`](crate::Transport).
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Connection-level failure (DNS, reset, TLS, ...).
    #[error("Network error: {0}")]
    Network(String),

    /// The call exceeded its timeout.
    #[error("Request timed out")]
    Timeout,

    /// The provider answered with a non-success HTTP status.
    #[error("Provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Errors produced while dispatching generation jobs.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Provider returned HTTP {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("Provider returned no images")]
    EmptyResponse,

    #[error(
        "Could not compress reference below {target_bytes} bytes in {attempts} attempts \
         (smallest: {smallest_bytes} bytes)"
    )]
    CompressionExhausted {
        target_bytes: usize,
        attempts: u32,
        smallest_bytes: usize,
    },

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Reference image unavailable: {0}")]
    Reference(String),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Dispatcher control channel closed")]
    ControlClosed,

    #[error("Dispatcher is already running")]
    AlreadyRunning,
}

impl DispatchError {
    /// HTTP status carried by a provider error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DispatchError::Provider { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, DispatchError::Configuration(_))
    }
}

impl From<TransportError> for DispatchError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Network(msg) => DispatchError::Transport(msg),
            TransportError::Timeout => DispatchError::Timeout,
            TransportError::Status { status, body } => DispatchError::Provider {
                status,
                message: body,
            },
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, DispatchError>;
