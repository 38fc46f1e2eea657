//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use creditline_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Authentication required")]
    Unauthorized,
    #[error("Invalid webhook authorization")]
    InvalidWebhookSecret,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("{0}")]
    NotFound(String),

    // Billing errors
    #[error("Insufficient credits: balance {balance}, requested {requested}")]
    InsufficientCredits { balance: i32, requested: i32 },

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized | ApiError::InvalidWebhookSecret => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::Database(_) | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Message safe to return to the caller
    pub fn public_message(&self) -> String {
        match self {
            ApiError::Database(_) => "Database error".to_string(),
            _ => self.to_string(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::InvalidWebhookSecret => "INVALID_WEBHOOK_SECRET",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            ApiError::Database(_) => "DATABASE_ERROR",
            ApiError::Internal => "INTERNAL_ERROR",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.public_message(),
            }
        }));

        (self.status(), body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        if err.is_retryable() {
            tracing::warn!(error = %err, "Retryable billing error");
            return ApiError::ServiceUnavailable(err.to_string());
        }
        match err {
            BillingError::UserNotFound(_) | BillingError::WebhookUserNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            BillingError::InsufficientCredits { balance, requested } => {
                ApiError::InsufficientCredits { balance, requested }
            }
            other => {
                tracing::error!(error = %other, "Billing error");
                ApiError::Internal
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        ApiError::Database(err.to_string())
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
