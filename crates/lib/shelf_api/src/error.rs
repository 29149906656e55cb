//! Application error types.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use shelf_core::EntitlementError;
use thiserror::Error;
use tracing::error;

use crate::services::gateway::GatewayError;

/// Convenience alias for handler return types.
pub type AppResult<T> = Result<T, AppError>;

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Application-level errors with HTTP status mapping.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self {
            AppError::Validation(m) => (StatusCode::BAD_REQUEST, "validation_error", m.as_str()),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m.as_str()),
            AppError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, "unauthorized", m.as_str()),
            AppError::Forbidden(m) => (StatusCode::FORBIDDEN, "forbidden", m.as_str()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, "conflict", m.as_str()),
            AppError::TooManyRequests(m) => {
                (StatusCode::TOO_MANY_REQUESTS, "rate_limited", m.as_str())
            }
            AppError::Gateway(m) => (StatusCode::BAD_GATEWAY, "gateway_error", m.as_str()),
            AppError::Unavailable(m) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable", m.as_str())
            }
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal server error",
            ),
        };
        let body = Json(ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        });
        (status, body).into_response()
    }
}

impl From<EntitlementError> for AppError {
    fn from(e: EntitlementError) -> Self {
        match e {
            EntitlementError::InvalidSignature => {
                AppError::Unauthorized("Invalid webhook signature".into())
            }
            EntitlementError::Forbidden(msg) => AppError::Forbidden(msg),
            EntitlementError::AccountLocked => AppError::Forbidden("Account is locked".into()),
            EntitlementError::NotFound(msg) => AppError::NotFound(msg),
            EntitlementError::InvalidPayload(msg) => AppError::Validation(msg),
            e @ EntitlementError::InvalidTransition { .. } => AppError::Conflict(e.to_string()),
            e @ EntitlementError::DuplicatePayment(_) => AppError::Conflict(e.to_string()),
            EntitlementError::InsufficientCredits => {
                AppError::Forbidden("Insufficient credits".into())
            }
            EntitlementError::RateLimited => {
                AppError::TooManyRequests("Download rate limit exceeded".into())
            }
            EntitlementError::Conflict(msg) => {
                AppError::Unavailable(format!("Concurrent update, retry later: {msg}"))
            }
            EntitlementError::Store(e) => {
                error!("storage failure: {e}");
                AppError::Internal(e.to_string())
            }
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(e: GatewayError) -> Self {
        error!("payment gateway call failed: {e}");
        AppError::Gateway("Payment provider unavailable".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_core::models::SubscriptionStatus;

    fn status_of(e: EntitlementError) -> StatusCode {
        AppError::from(e).into_response().status()
    }

    #[test]
    fn core_errors_map_to_statuses() {
        assert_eq!(status_of(EntitlementError::InvalidSignature), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(EntitlementError::Forbidden("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(status_of(EntitlementError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(EntitlementError::InvalidPayload("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(EntitlementError::InvalidTransition {
                from: SubscriptionStatus::Expired,
                to: SubscriptionStatus::Cancelled,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(EntitlementError::Conflict("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
