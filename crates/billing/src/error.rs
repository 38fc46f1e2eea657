//! Billing error types

use thiserror::Error;

use creditline_shared::SharedError;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// Provider unreachable or timed out. Safe to retry.
    #[error("Billing provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Billing provider returned {status}: {body}")]
    ProviderApi { status: u16, body: String },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Webhook user not found for app user ids [{0}]. Link the billing customer id to the user and let the provider redeliver.")]
    WebhookUserNotFound(String),

    #[error("Insufficient credits: balance {balance}, requested {requested}")]
    InsufficientCredits { balance: i32, requested: i32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the caller may retry the same request later
    ///
    /// Provider 5xx and 429 are transient; other provider statuses are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::ProviderUnavailable(_) => true,
            BillingError::ProviderApi { status, .. } => *status >= 500 || *status == 429,
            BillingError::Database(_) => true,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BillingError::InvalidResponse(err.to_string())
        } else {
            BillingError::ProviderUnavailable(err.to_string())
        }
    }
}

impl From<SharedError> for BillingError {
    fn from(err: SharedError) -> Self {
        match err {
            SharedError::Validation(msg) => BillingError::InvalidInput(msg),
            other => BillingError::Internal(other.to_string()),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
