//! Maps [`CoreError`] (and a handful of request-parsing failures) onto the
//! HTTP error envelope from spec.md §6/§7: `{"error": {"code", "message",
//! "timestamp"}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use wagerbridge_core::CoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("invalid request body: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Core(err) => match err {
                CoreError::Validation(_) => StatusCode::BAD_REQUEST,
                CoreError::Authentication(_) => StatusCode::UNAUTHORIZED,
                CoreError::Authorization(_) => StatusCode::FORBIDDEN,
                CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                CoreError::Conflict(_) => StatusCode::CONFLICT,
                CoreError::InsufficientFunds => StatusCode::BAD_REQUEST,
                CoreError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                CoreError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
                CoreError::Internal(_) | CoreError::Database(_) | CoreError::Cache(_) | CoreError::Serialization(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "INVALID_REQUEST",
            Self::Core(err) => err.code(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    timestamp: chrono::DateTime<Utc>,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
                timestamp: Utc::now(),
            },
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_funds_maps_to_bad_request() {
        let err = ApiError::Core(CoreError::InsufficientFunds);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), CoreError::InsufficientFunds.code());
    }

    #[test]
    fn rate_limited_maps_to_too_many_requests() {
        let err = ApiError::Core(CoreError::RateLimited { retry_after_secs: 30 });
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn bad_request_maps_to_400_with_invalid_request_code() {
        let err = ApiError::BadRequest("missing field".to_string());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[test]
    fn not_found_maps_to_404() {
        let err = ApiError::Core(CoreError::not_found("wallet", "p-1"));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
