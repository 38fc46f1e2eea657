//! Request identity and webhook authorization

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::ApiError;

/// Header the fronting auth layer sets to the authenticated user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated user for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .ok_or(ApiError::Unauthorized)?;

        let user_id = Uuid::parse_str(value).map_err(|_| {
            tracing::debug!("Rejected malformed user id header");
            ApiError::Unauthorized
        })?;

        Ok(AuthUser { user_id })
    }
}

/// Check the webhook `Authorization` header against the configured secret
///
/// Accepts the bare secret or `Bearer <secret>`. With no secret configured
/// every request is accepted.
pub fn authorize_webhook(secret: Option<&str>, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(secret) = secret else {
        tracing::debug!("Webhook secret not configured; accepting unauthenticated webhook");
        return Ok(());
    };

    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .ok_or_else(|| {
            tracing::warn!("RevenueCat webhook missing authorization header");
            ApiError::InvalidWebhookSecret
        })?;

    let token = provided.strip_prefix("Bearer ").map(str::trim).unwrap_or(provided);

    if constant_time_compare(token, secret) {
        Ok(())
    } else {
        tracing::warn!("RevenueCat webhook authorization mismatch");
        Err(ApiError::InvalidWebhookSecret)
    }
}

/// Constant-time string comparison
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        // Same amount of work as a real comparison
        let dummy = vec![0u8; a.len()];
        let _ = a.as_bytes().ct_eq(&dummy);
        return false;
    }

    a.as_bytes().ct_eq(b.as_bytes()).into()
}
