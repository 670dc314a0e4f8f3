//! Typed failures from media-server calls
//!
//! The retry helper inspects [ProviderError::is_transient] to decide whether an
//! attempt is worth repeating.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("rate limited (HTTP {status})")]
    RateLimited { status: u16 },

    #[error("request rejected (HTTP {status}): {message}")]
    Client { status: u16, message: String },

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    /// Timeouts, connection failures, 5xx, 408 and 429 may succeed on a later attempt.
    /// Everything else (auth, not found, bad request, malformed payloads) is terminal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout(_)
                | ProviderError::Connection(_)
                | ProviderError::Server { .. }
                | ProviderError::RateLimited { .. }
        )
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 => ProviderError::Timeout(message),
            429 => ProviderError::RateLimited { status },
            500..=599 => ProviderError::Server { status, message },
            _ => ProviderError::Client { status, message },
        }
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Server { status, .. }
            | ProviderError::RateLimited { status }
            | ProviderError::Client { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            ProviderError::from_status(status.as_u16(), e.to_string())
        } else if e.is_decode() {
            ProviderError::Decode(e.to_string())
        } else if e.is_builder() {
            ProviderError::InvalidRequest(e.to_string())
        } else {
            // connect, request and body errors are all transport level
            ProviderError::Connection(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Decode(e.to_string())
    }
}
