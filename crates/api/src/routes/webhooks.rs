//! RevenueCat webhook receiver

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;

use creditline_billing::WebhookRequest;

use crate::auth::authorize_webhook;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookResponse {
    fn failed(err: &ApiError) -> (StatusCode, Json<Self>) {
        (
            err.status(),
            Json(Self {
                success: false,
                processed: false,
                error: Some(err.public_message()),
            }),
        )
    }
}

/// Handle a RevenueCat webhook delivery
///
/// Any non-2xx makes RevenueCat redeliver, so 404 (user not linked yet) and
/// 503 (transient) are the statuses that lead to a later successful retry.
pub async fn revenuecat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WebhookResponse>) {
    if let Err(err) = authorize_webhook(state.webhook_secret.as_deref(), &headers) {
        return WebhookResponse::failed(&err);
    }

    let request = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        match serde_json::from_slice::<Option<WebhookRequest>>(&body) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(error = %err, body_len = body.len(), "Unparseable RevenueCat webhook body");
                return WebhookResponse::failed(&ApiError::BadRequest(format!(
                    "Invalid webhook payload: {err}"
                )));
            }
        }
    };

    match state.billing.webhooks.process(request).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(WebhookResponse {
                success: true,
                processed: outcome.processed,
                error: None,
            }),
        ),
        Err(err) => {
            let err = ApiError::from(err);
            tracing::warn!(status = %err.status(), error = %err, "RevenueCat webhook not applied");
            WebhookResponse::failed(&err)
        }
    }
}
