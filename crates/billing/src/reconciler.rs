//! Credit grants for client-submitted purchases
//!
//! The client reports a product id (and usually a transaction id) after a store
//! purchase. Nothing is credited until the purchase shows up in the provider's
//! history; the resolved transaction id then gates the grant so a replay, a second
//! device, or the matching webhook can never credit it twice.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use creditline_shared::CreditTransactionType;

use crate::error::{BillingError, BillingResult};
use crate::matching::AppUserCandidates;
use crate::store::{CreditEntry, CreditResult, LedgerCommit, LedgerStore, LedgerWrite};
use crate::verifier::PurchaseVerifier;

/// A purchase as the client reports it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseClaim {
    pub product_id: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// Provider app-user id the client purchased under, when it differs from ours
    #[serde(default)]
    pub app_user_id: Option<String>,
}

/// Result of a purchase submission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseOutcome {
    pub success: bool,
    pub verified: bool,
    pub credits_added: i32,
    pub new_balance: i32,
    pub already_processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PurchaseOutcome {
    fn granted(credits_added: i32, new_balance: i32) -> Self {
        Self {
            success: true,
            verified: true,
            credits_added,
            new_balance,
            already_processed: false,
            error: None,
        }
    }

    fn already_processed(credits_added: i32, new_balance: i32) -> Self {
        Self {
            already_processed: true,
            ..Self::granted(credits_added, new_balance)
        }
    }

    fn failed(verified: bool, new_balance: i32, error: String) -> Self {
        Self {
            success: false,
            verified,
            credits_added: 0,
            new_balance,
            already_processed: false,
            error: Some(error),
        }
    }
}

/// Turns verified purchases into ledger grants
#[derive(Clone)]
pub struct CreditReconciler {
    store: Arc<dyn LedgerStore>,
    verifier: PurchaseVerifier,
}

impl CreditReconciler {
    pub fn new(store: Arc<dyn LedgerStore>, verifier: PurchaseVerifier) -> Self {
        Self { store, verifier }
    }

    /// Verify a claimed purchase and credit it at most once
    ///
    /// Errors are reserved for missing users, malformed claims and failures the
    /// caller can retry. Unverified and unmapped purchases come back as an
    /// unsuccessful [`PurchaseOutcome`] carrying a remediation hint.
    pub async fn grant_from_verified_purchase(
        &self,
        user_id: Uuid,
        claim: &PurchaseClaim,
    ) -> BillingResult<PurchaseOutcome> {
        let product_id = claim.product_id.trim();
        if product_id.is_empty() {
            return Err(BillingError::InvalidInput("productId is required".to_string()));
        }
        let transaction_id = claim
            .transaction_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());

        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;

        let internal_id = user.id.to_string();
        let mut candidates = AppUserCandidates::new();
        candidates
            .push_opt(user.billing_customer_id.as_deref())
            .push_opt(claim.app_user_id.as_deref())
            .push(&internal_id);

        tracing::info!(
            user_id = %user_id,
            product_id = %product_id,
            transaction_id = ?transaction_id,
            candidates = %candidates,
            "Verifying purchase"
        );

        let verification = self
            .verifier
            .verify_candidates(&candidates, transaction_id, product_id)
            .await?;

        if !verification.verified {
            tracing::warn!(user_id = %user_id, product_id = %product_id, "Purchase could not be verified");
            return Ok(PurchaseOutcome::failed(
                false,
                user.credits,
                format!(
                    "Purchase could not be verified with the billing provider (tried app user ids: {candidates}). \
                     If you purchased under a different account, link its customer id via \
                     POST /api/subscription/customer and retry."
                ),
            ));
        }

        let Some(resolved_tx) = verification.resolved_transaction_id.clone() else {
            return Err(BillingError::InvalidResponse(
                "verified purchase has no transaction id".to_string(),
            ));
        };

        if let Some(existing) = self.store.find_transaction(user.id, &resolved_tx).await? {
            tracing::info!(
                user_id = %user_id,
                transaction_id = %resolved_tx,
                "Purchase already credited"
            );
            return Ok(PurchaseOutcome::already_processed(existing.amount, user.credits));
        }

        let mut product_ids: Vec<&str> = Vec::with_capacity(2);
        if let Some(resolved) = verification.resolved_product_id.as_deref() {
            product_ids.push(resolved);
        }
        if !product_ids.contains(&product_id) {
            product_ids.push(product_id);
        }

        let Some(package) = self.store.find_package(&product_ids).await? else {
            tracing::warn!(
                user_id = %user_id,
                product_ids = ?product_ids,
                "Verified purchase has no credit package"
            );
            return Ok(PurchaseOutcome::failed(
                true,
                user.credits,
                format!("Purchase verified but no credit package is configured for product '{product_id}'"),
            ));
        };

        let credits = package.credits_to_grant();

        // Link the provider id that verified, unless it is our own id
        let link = verification
            .app_user_id
            .filter(|id| *id != internal_id && user.billing_customer_id.is_none());

        let write = LedgerWrite::for_user(user.id)
            .credit(CreditEntry {
                kind: CreditTransactionType::Purchase,
                amount: credits,
                external_transaction_id: Some(resolved_tx.clone()),
                product_id: verification
                    .resolved_product_id
                    .clone()
                    .or_else(|| Some(product_id.to_string())),
            })
            .link_customer(link);

        let applied = match self.store.commit(write).await? {
            LedgerCommit::Applied(applied) => applied,
            LedgerCommit::DuplicateEvent => {
                return Err(BillingError::Internal(
                    "purchase commit reported a webhook duplicate".to_string(),
                ))
            }
        };

        match applied.credit {
            Some(CreditResult::Recorded(tx)) => {
                tracing::info!(
                    user_id = %user_id,
                    transaction_id = %resolved_tx,
                    package = %package.name,
                    credits_added = tx.amount,
                    new_balance = applied.user.credits,
                    "Purchase credited"
                );
                Ok(PurchaseOutcome::granted(tx.amount, applied.user.credits))
            }
            Some(CreditResult::AlreadyRecorded(tx)) => {
                // Lost the race to a concurrent submission or the webhook
                tracing::info!(
                    user_id = %user_id,
                    transaction_id = %resolved_tx,
                    "Purchase credited concurrently"
                );
                Ok(PurchaseOutcome::already_processed(tx.amount, applied.user.credits))
            }
            None => Err(BillingError::Internal(
                "purchase commit returned no ledger result".to_string(),
            )),
        }
    }
}
