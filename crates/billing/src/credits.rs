//! Balance queries, the package catalog, and debits

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use creditline_shared::{CreditPackage, CreditTransaction, CreditTransactionType, PackageType};

use crate::error::{BillingError, BillingResult};
use crate::store::{CreditEntry, CreditResult, LedgerCommit, LedgerStore, LedgerWrite};

/// Catalog entry as shown to clients
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageView {
    pub id: Uuid,
    pub name: String,
    pub credits: i32,
    pub bonus_percentage: Option<i32>,
    /// Credits a purchase actually grants, bonus included
    pub total_credits: i32,
    pub price_cents: i64,
    pub product_id: Option<String>,
    pub package_id: Option<String>,
    pub package_type: PackageType,
}

impl From<CreditPackage> for PackageView {
    fn from(pkg: CreditPackage) -> Self {
        Self {
            total_credits: pkg.credits_to_grant(),
            id: pkg.id,
            name: pkg.name,
            credits: pkg.credits,
            bonus_percentage: pkg.bonus_percentage,
            price_cents: pkg.price_cents,
            product_id: pkg.provider_product_id,
            package_id: pkg.provider_package_id,
            package_type: pkg.package_type,
        }
    }
}

#[derive(Clone)]
pub struct CreditService {
    store: Arc<dyn LedgerStore>,
}

impl CreditService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn balance(&self, user_id: Uuid) -> BillingResult<i32> {
        self.store
            .get_user(user_id)
            .await?
            .map(|user| user.credits)
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))
    }

    /// Catalog ordered by base credits
    pub async fn packages(&self) -> BillingResult<Vec<PackageView>> {
        let mut packages = self.store.list_packages().await?;
        packages.sort_by_key(|p| p.credits);
        Ok(packages.into_iter().map(PackageView::from).collect())
    }

    /// Spend `amount` credits, refusing when the balance is short
    pub async fn deduct(&self, user_id: Uuid, amount: i32, reason: &str) -> BillingResult<CreditTransaction> {
        if amount <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "deduction amount must be positive, got {amount}"
            )));
        }

        let write = LedgerWrite::for_user(user_id).credit(CreditEntry {
            kind: CreditTransactionType::Deduction,
            amount: -amount,
            external_transaction_id: None,
            product_id: None,
        });

        match self.store.commit(write).await? {
            LedgerCommit::Applied(applied) => match applied.credit {
                Some(CreditResult::Recorded(tx)) => {
                    tracing::info!(
                        user_id = %user_id,
                        amount = amount,
                        reason = %reason,
                        remaining = tx.balance_after,
                        "Credits deducted"
                    );
                    Ok(tx)
                }
                _ => Err(BillingError::Internal(
                    "deduction was not recorded".to_string(),
                )),
            },
            LedgerCommit::DuplicateEvent => Err(BillingError::Internal(
                "deduction commit reported a webhook duplicate".to_string(),
            )),
        }
    }
}
