//! Service errors and their HTTP mapping

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

use crate::protocol::ErrorBody;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found")]
    NotFound,

    #[error("Payload too large")]
    PayloadTooLarge,

    #[error("Too many requests")]
    RateLimited { retry_after_secs: u64 },

    #[error("Internal server error")]
    Internal(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) | ServiceError::ChecksumMismatch => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            ServiceError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        ServiceError::Internal(e.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if let ServiceError::Internal(detail) = &self {
            error!("Request failed: {}", detail);
        }

        let status = self.status();
        let body = ErrorBody {
            success: false,
            error: self.to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        if let ServiceError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ServiceError::ChecksumMismatch.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ServiceError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ServiceError::PayloadTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(ServiceError::Internal("x".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        let response = ServiceError::RateLimited { retry_after_secs: 12 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "12");
    }

    #[test]
    fn test_internal_detail_not_leaked() {
        assert_eq!(ServiceError::Internal("disk on fire".into()).to_string(), "Internal server error");
    }
}
