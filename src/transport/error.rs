//! Transport error taxonomy

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection refused, DNS failure, reset, or body read failure
    #[error("service unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The service answered with a non-success status
    #[error("service responded {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    Integrity { expected: String, actual: String },

    #[error("invalid payload: {0}")]
    Validation(String),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl TransportError {
    /// The service could not be reached at all
    pub fn is_connectivity(&self) -> bool {
        matches!(self, TransportError::Unreachable(_) | TransportError::Timeout(_))
    }

    /// Connectivity failures, 5xx and 429 are worth another attempt.
    /// Every other 4xx is terminal.
    pub fn should_retry(&self) -> bool {
        match self {
            TransportError::Unreachable(_) | TransportError::Timeout(_) => true,
            TransportError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Server-requested wait on a 429
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
