//! Error types for driftnet.
//!
//! Structured error handling built on `thiserror`, with category/severity
//! metadata for logging and monitoring call sites that want to triage
//! failures without matching on every variant.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an error, used to decide how loudly to log it
/// and whether a caller should retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed or rejected identifiers (node ids, whisper tags).
    Identity,
    /// Cryptographic failures: bad keys, failed decryption.
    Crypto,
    /// Wire format or message validation failures.
    Protocol,
    /// Transport-level failures: connect, send, listen.
    Transport,
    /// Extension handler failures.
    Extension,
    /// Unrecoverable internal errors.
    Fatal,
}

impl ErrorCategory {
    /// Recommended severity for logging this category of error.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Fatal => ErrorSeverity::Critical,
            Self::Crypto | Self::Transport => ErrorSeverity::High,
            Self::Protocol | Self::Identity => ErrorSeverity::Medium,
            Self::Extension => ErrorSeverity::Low,
        }
    }

    /// Whether the operation that produced this category is worth retrying.
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            Self::Transport => RetryStrategy::ExponentialBackoff { max_retries: 3 },
            Self::Crypto | Self::Identity | Self::Fatal => RetryStrategy::NoRetry,
            Self::Protocol | Self::Extension => RetryStrategy::LinearBackoff { max_retries: 1 },
        }
    }
}

/// Severity level for monitoring/alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Retry guidance attached to an [`ErrorCategory`].
#[derive(Debug, Clone, Copy)]
pub enum RetryStrategy {
    NoRetry,
    LinearBackoff { max_retries: u32 },
    ExponentialBackoff { max_retries: u32 },
}

/// All errors produced by driftnet.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid node id: {0}")]
    InvalidId(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("message validation failed: {0}")]
    ValidationFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("duplicate message")]
    DuplicateMessage,

    #[error("extension error in {extension}: {message}")]
    ExtensionError { extension: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Classify this error for logging/monitoring purposes.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidId(_) => ErrorCategory::Identity,
            Self::TransportUnavailable(_) | Self::TransportError(_) => ErrorCategory::Transport,
            Self::ValidationFailed(_) | Self::Serialization(_) => ErrorCategory::Protocol,
            Self::DecryptionFailed(_) => ErrorCategory::Crypto,
            Self::DuplicateMessage => ErrorCategory::Protocol,
            Self::ExtensionError { .. } => ErrorCategory::Extension,
            Self::Io(_) | Self::Config(_) => ErrorCategory::Transport,
            Self::Fatal(_) => ErrorCategory::Fatal,
        }
    }
}
