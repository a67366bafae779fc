//! Error types for the event bus.

use thiserror::Error;

/// Event bus error types.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// An operation was attempted before `start()`.
    #[error("{backend} event bus has not been started")]
    NotStarted {
        /// Name of the backend that rejected the call.
        backend: &'static str,
    },

    /// The transport could not be reached.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Payload not representable as JSON, or a malformed wire message.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The broker did not acknowledge a publish in time.
    #[error("Publish to topic '{topic}' timed out after {timeout_ms}ms")]
    PublishTimeout {
        /// Topic the message was published to.
        topic: String,
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The broker rejected a publish.
    #[error("Failed to publish event: {0}")]
    PublishError(String),

    /// A subscription could not be established.
    #[error("Failed to subscribe: {0}")]
    SubscribeError(String),

    /// Topic provisioning failed.
    #[error("Failed to create topics: {0}")]
    TopicError(String),

    /// The requested backend was not compiled into this build.
    #[error("{0} support is not compiled into this build")]
    BackendUnavailable(&'static str),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<serde_json::Error> for EventBusError {
    fn from(err: serde_json::Error) -> Self {
        EventBusError::SerializationError(err.to_string())
    }
}

/// Result type for event bus operations.
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Error returned by a subscriber callback.
///
/// Callback errors are logged by the dispatching backend and never reach the
/// publisher or the other subscribers of the topic.
#[derive(Debug, Clone, Error)]
#[error("Callback failed: {0}")]
pub struct CallbackError(pub String);

impl CallbackError {
    /// Create a callback error from any displayable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<String> for CallbackError {
    fn from(reason: String) -> Self {
        Self(reason)
    }
}

impl From<&str> for CallbackError {
    fn from(reason: &str) -> Self {
        Self(reason.to_string())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Missing required environment variable.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Error message.
        message: String,
    },
}
