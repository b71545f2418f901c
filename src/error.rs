//! Error types for TeleForward.

use std::time::Duration;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Source-stream and chat-API errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Channel {name} does not support {operation}")]
    Unsupported { name: String, operation: String },

    #[error("Attachment download failed: {0}")]
    Download(String),

    #[error("Telegram flood-wait: retry after {seconds}s")]
    FloodWait { seconds: u64 },

    #[error("Telegram API error: {0}")]
    Api(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classified outbound delivery failures.
///
/// These never escape a dispatcher worker; they are rendered into the
/// error string of a delivery outcome.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Invalid {0}")]
    InvalidDestination(String),

    #[error("Rate limited by {endpoint} (429)")]
    RateLimited {
        endpoint: String,
        retry_after: Duration,
    },

    #[error("{endpoint} server error {status}")]
    Transient { endpoint: String, status: u16 },

    #[error("{endpoint} returned status {status}: {body}")]
    Rejected {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Request timed out")]
    Timeout,

    #[error("HTTP error: {0}")]
    Transport(String),

    #[error("Attachment error: {0}")]
    Io(String),
}

impl DeliveryError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Transient { .. } | Self::Timeout | Self::Transport(_)
        )
    }
}
