//! Ledger storage contract
//!
//! Every balance change goes through [`LedgerStore::commit`], which applies the
//! balance update, the ledger row, subscription fields, the customer link and the
//! webhook marker as one unit. Implementations must leave the balance untouched
//! when the ledger row's `(user_id, external_transaction_id)` already exists.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use creditline_shared::{
    CreditPackage, CreditTransaction, CreditTransactionType, SubscriptionStatus, User,
};

use crate::error::{BillingError, BillingResult};
use crate::matching::{self, AppUserCandidates};

/// Ledger row to append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditEntry {
    pub kind: CreditTransactionType,
    /// Signed; negative for deductions
    pub amount: i32,
    pub external_transaction_id: Option<String>,
    pub product_id: Option<String>,
}

/// Subscription fields to overwrite; `None` leaves a field as it is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub status: Option<SubscriptionStatus>,
    pub product_id: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
}

impl SubscriptionChange {
    pub fn status(status: SubscriptionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.product_id.is_none() && self.expires_at.is_none()
    }
}

/// Dedup marker for a webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookMarker {
    pub event_id: String,
    pub event_type: String,
}

/// Everything one logical operation changes for one user
#[derive(Debug, Clone)]
pub struct LedgerWrite {
    pub user_id: Uuid,
    pub credit: Option<CreditEntry>,
    pub subscription: Option<SubscriptionChange>,
    /// Stored only when the user has no billing customer id yet
    pub link_customer_id: Option<String>,
    /// When set and already recorded, nothing is applied
    pub webhook_event: Option<WebhookMarker>,
}

impl LedgerWrite {
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            user_id,
            credit: None,
            subscription: None,
            link_customer_id: None,
            webhook_event: None,
        }
    }

    pub fn credit(mut self, entry: CreditEntry) -> Self {
        self.credit = Some(entry);
        self
    }

    pub fn subscription(mut self, change: SubscriptionChange) -> Self {
        if !change.is_empty() {
            self.subscription = Some(change);
        }
        self
    }

    pub fn link_customer(mut self, customer_id: Option<String>) -> Self {
        self.link_customer_id = customer_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        self
    }

    pub fn webhook_event(mut self, marker: WebhookMarker) -> Self {
        self.webhook_event = Some(marker);
        self
    }
}

/// Outcome of the ledger part of a commit
#[derive(Debug, Clone)]
pub enum CreditResult {
    /// A new row was appended and the balance changed
    Recorded(CreditTransaction),
    /// The external transaction id was already in the ledger; balance unchanged
    AlreadyRecorded(CreditTransaction),
}

impl CreditResult {
    pub fn transaction(&self) -> &CreditTransaction {
        match self {
            CreditResult::Recorded(tx) | CreditResult::AlreadyRecorded(tx) => tx,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, CreditResult::AlreadyRecorded(_))
    }
}

#[derive(Debug, Clone)]
pub struct AppliedWrite {
    /// User row after the commit
    pub user: User,
    pub credit: Option<CreditResult>,
}

#[derive(Debug, Clone)]
pub enum LedgerCommit {
    Applied(AppliedWrite),
    /// The webhook marker existed; nothing was written
    DuplicateEvent,
}

/// Durable storage for users, the ledger, webhook markers and the package catalog
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Non-deleted user by internal id
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<User>>;

    /// Resolve a user from provider app-user ids
    ///
    /// All candidates are tried as internal ids first, then as stored billing
    /// customer ids.
    async fn find_user_by_app_user_ids(
        &self,
        candidates: &AppUserCandidates,
    ) -> BillingResult<Option<User>>;

    async fn find_transaction(
        &self,
        user_id: Uuid,
        external_transaction_id: &str,
    ) -> BillingResult<Option<CreditTransaction>>;

    /// Active catalog ordered by base credits
    async fn list_packages(&self) -> BillingResult<Vec<CreditPackage>>;

    /// First package matching the product ids in order, exact before suffix
    async fn find_package(&self, product_ids: &[&str]) -> BillingResult<Option<CreditPackage>> {
        let packages = self.list_packages().await?;
        Ok(matching::find_package(&packages, product_ids).cloned())
    }

    async fn webhook_event_exists(&self, event_id: &str) -> BillingResult<bool>;

    /// Insert a marker if absent; `false` when it already existed
    async fn record_webhook_event(&self, marker: &WebhookMarker) -> BillingResult<bool>;

    /// Overwrite the user's billing customer id
    async fn set_billing_customer_id(&self, user_id: Uuid, customer_id: &str) -> BillingResult<User>;

    /// Apply a [`LedgerWrite`] atomically
    ///
    /// Fails with `UserNotFound` for a missing user and `InsufficientCredits` when a
    /// debit would take the balance below zero; in both cases nothing is written.
    async fn commit(&self, write: LedgerWrite) -> BillingResult<LedgerCommit>;
}

/// Balance after applying `amount`, refusing overspend and overflow
pub(crate) fn next_balance(current: i32, amount: i32) -> BillingResult<i32> {
    let next = current.checked_add(amount).ok_or_else(|| {
        BillingError::InvalidInput(format!(
            "credit amount {amount} overflows balance {current}"
        ))
    })?;
    if next < 0 {
        return Err(BillingError::InsufficientCredits {
            balance: current,
            requested: amount.saturating_neg(),
        });
    }
    Ok(next)
}
