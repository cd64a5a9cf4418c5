//! Error types surfaced by connections and requests
//!
//! Every failure is returned to the immediate caller. The connection performs
//! no retries and stays usable after a timeout or decode failure.

use crate::connection::ConnectionState;
use crate::protocol::envelope::EnvelopeError;
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for connection operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect: {0}")]
    Connect(#[source] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Failed to decode message on {topic}: {source}")]
    Decode {
        topic: String,
        #[source]
        source: EnvelopeError,
    },

    #[error("Failed to encode message: {0}")]
    Encode(#[source] EnvelopeError),

    #[error("Timed out after {elapsed:?}: {reason}")]
    Timeout { reason: String, elapsed: Duration },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Operation not allowed in state {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Transport stream closed while waiting for a message")]
    StreamClosed,

    #[error("Invalid request message: {0}")]
    InvalidRequest(String),

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),
}

impl ClientError {
    /// Create a timeout error
    pub fn timeout<S: Into<String>>(reason: S, elapsed: Duration) -> Self {
        Self::Timeout {
            reason: reason.into(),
            elapsed,
        }
    }

    /// Create an invalid request error
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// True when no matching message arrived in time
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, ClientError::Decode { .. })
    }
}

/// Result type for connection operations
pub type ClientResult<T> = Result<T, ClientError>;
