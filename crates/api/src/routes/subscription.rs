//! Subscription state and billing customer linking

use axum::{extract::State, Json};
use serde::Deserialize;

use creditline_billing::SubscriptionView;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkCustomerRequest {
    pub customer_id: String,
}

pub async fn get_subscription(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<SubscriptionView>> {
    let view = state.billing.subscriptions.get_subscription(auth.user_id).await?;
    Ok(Json(view))
}

/// Link the RevenueCat app-user id the client purchases under
pub async fn link_customer(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<LinkCustomerRequest>,
) -> ApiResult<Json<SubscriptionView>> {
    let view = state
        .billing
        .subscriptions
        .link_customer(auth.user_id, &req.customer_id)
        .await?;
    Ok(Json(view))
}
