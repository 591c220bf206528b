//! Pool error types.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a broker transport while connecting, opening channels,
/// or publishing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The broker could not be reached or refused the connection.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A single connection attempt exceeded its timeout.
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The connection parameters were rejected before any network activity.
    #[error("invalid connection parameters: {0}")]
    InvalidParameters(String),

    /// The connection was already closed.
    #[error("connection closed")]
    Closed,

    /// Channel open, declare, or close failed.
    #[error("channel error: {0}")]
    Channel(String),

    /// The broker did not accept a published message.
    #[error("publish failed: {0}")]
    Publish(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Check if this error is transient and may succeed on retry.
    ///
    /// Invalid parameters never become valid by waiting, so they are the
    /// only non-transient variant.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidParameters(_))
    }
}

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// A broker connection could not be created for the caller.
    #[error("could not obtain a broker connection: {0}")]
    Connection(#[source] TransportError),

    /// Pool or connection configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),
}

impl PoolError {
    /// Check if this error is transient and may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_transient(),
            Self::Configuration(_) => false,
        }
    }
}

/// Errors returned by [`Producer`](crate::producer::Producer) operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PublishError {
    /// No connection could be obtained from the pool.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The transport failed while declaring or publishing.
    #[error("publish to queue '{queue}' failed: {source}")]
    Transport {
        /// Queue the message was destined for.
        queue: String,
        /// Underlying transport failure.
        #[source]
        source: TransportError,
    },

    /// The payload could not be serialized.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
