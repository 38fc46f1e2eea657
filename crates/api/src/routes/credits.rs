//! Credit balance, catalog, purchases and deductions

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use creditline_billing::{PackageView, PurchaseClaim, PurchaseOutcome};
use creditline_shared::CreditTransaction;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub credits: i32,
}

#[derive(Debug, Serialize)]
pub struct PackagesResponse {
    pub packages: Vec<PackageView>,
}

#[derive(Debug, Deserialize)]
pub struct DeductRequest {
    pub amount: i32,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductResponse {
    pub credits_deducted: i32,
    pub new_balance: i32,
    pub transaction: CreditTransaction,
}

/// Credit a purchase the client completed with the store
///
/// 200 when credits were granted or the purchase was already credited,
/// 400 when it could not be verified or maps to no package.
pub async fn purchase(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(claim): Json<PurchaseClaim>,
) -> ApiResult<(StatusCode, Json<PurchaseOutcome>)> {
    let outcome = state
        .billing
        .reconciler
        .grant_from_verified_purchase(auth.user_id, &claim)
        .await?;

    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    Ok((status, Json(outcome)))
}

pub async fn balance(State(state): State<AppState>, auth: AuthUser) -> ApiResult<Json<BalanceResponse>> {
    let credits = state.billing.credits.balance(auth.user_id).await?;
    Ok(Json(BalanceResponse { credits }))
}

pub async fn packages(State(state): State<AppState>) -> ApiResult<Json<PackagesResponse>> {
    let packages = state.billing.credits.packages().await?;
    Ok(Json(PackagesResponse { packages }))
}

pub async fn deduct(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<DeductRequest>,
) -> ApiResult<Json<DeductResponse>> {
    if req.amount <= 0 {
        return Err(ApiError::Validation("amount must be positive".to_string()));
    }
    let reason = req.reason.as_deref().unwrap_or("message");

    let transaction = state
        .billing
        .credits
        .deduct(auth.user_id, req.amount, reason)
        .await?;

    Ok(Json(DeductResponse {
        credits_deducted: req.amount,
        new_balance: transaction.balance_after,
        transaction,
    }))
}
