//! Purchase verification against provider purchase history

use std::sync::Arc;

use crate::client::{ProviderPurchase, PurchaseHistorySource};
use crate::error::{BillingError, BillingResult};
use crate::matching::{two_pass_filter, AppUserCandidates};

/// Result of checking one claimed purchase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verification {
    pub verified: bool,
    /// Canonical id of the matched purchase; the idempotency key
    pub resolved_transaction_id: Option<String>,
    /// Product id as the provider recorded it
    pub resolved_product_id: Option<String>,
    /// Candidate app-user id whose history held the purchase
    pub app_user_id: Option<String>,
}

impl Verification {
    pub fn unverified() -> Self {
        Self::default()
    }

    fn from_purchase(app_user_id: &str, purchase: &ProviderPurchase) -> Self {
        Self {
            verified: true,
            resolved_transaction_id: purchase.canonical_transaction_id().map(str::to_string),
            resolved_product_id: Some(purchase.product_id.clone()),
            app_user_id: Some(app_user_id.to_string()),
        }
    }
}

/// Locate a purchase in history
///
/// With a transaction id, every purchase is searched regardless of product. Without
/// one, the latest purchase of the product wins, exact product ids before suffix
/// matches.
pub fn find_purchase<'a>(
    purchases: &'a [ProviderPurchase],
    transaction_id: Option<&str>,
    product_id: &str,
) -> Option<&'a ProviderPurchase> {
    match transaction_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(tx) => purchases.iter().find(|p| p.has_transaction_id(tx)),
        None => {
            let with_ids: Vec<&ProviderPurchase> = purchases
                .iter()
                .filter(|p| p.canonical_transaction_id().is_some())
                .collect();
            two_pass_filter(&with_ids, product_id, |p| p.product_id.as_str())
                .into_iter()
                .max_by_key(|p| p.purchased_at_ms.unwrap_or(0))
                .copied()
        }
    }
}

/// Verifies claimed purchases through a [`PurchaseHistorySource`]
#[derive(Clone)]
pub struct PurchaseVerifier {
    source: Arc<dyn PurchaseHistorySource>,
}

impl PurchaseVerifier {
    pub fn new(source: Arc<dyn PurchaseHistorySource>) -> Self {
        Self { source }
    }

    /// Verify one purchase for one app-user id
    ///
    /// A 404 from the provider or a miss in history is `verified = false`. Transport
    /// failures are errors so the caller can retry instead of reporting a false
    /// negative.
    pub async fn verify_transaction(
        &self,
        app_user_id: &str,
        transaction_id: Option<&str>,
        product_id: &str,
    ) -> BillingResult<Verification> {
        let Some(info) = self.source.fetch_subscriber(app_user_id).await? else {
            tracing::info!(app_user_id = %app_user_id, "No purchase history at provider");
            return Ok(Verification::unverified());
        };

        match find_purchase(&info.purchases, transaction_id, product_id) {
            Some(purchase) => {
                tracing::info!(
                    app_user_id = %app_user_id,
                    product_id = %purchase.product_id,
                    transaction_id = ?purchase.canonical_transaction_id(),
                    "Purchase verified"
                );
                Ok(Verification::from_purchase(app_user_id, purchase))
            }
            None => {
                tracing::warn!(
                    app_user_id = %app_user_id,
                    product_id = %product_id,
                    transaction_id = ?transaction_id,
                    purchases = info.purchases.len(),
                    "Purchase not found in provider history"
                );
                Ok(Verification::unverified())
            }
        }
    }

    /// Try each candidate in order; the first that verifies wins
    ///
    /// If no candidate verifies and at least one failed with an error, the last
    /// error is returned rather than a negative result.
    pub async fn verify_candidates(
        &self,
        candidates: &AppUserCandidates,
        transaction_id: Option<&str>,
        product_id: &str,
    ) -> BillingResult<Verification> {
        let mut last_error: Option<BillingError> = None;

        for candidate in candidates.iter() {
            match self.verify_transaction(candidate, transaction_id, product_id).await {
                Ok(verification) if verification.verified => return Ok(verification),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(app_user_id = %candidate, error = %e, "Verification attempt failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(Verification::unverified()),
        }
    }
}
