//! In-memory ledger store
//!
//! Same uniqueness rules as the PostgreSQL store, with one mutex serialising every
//! commit. Used by tests and local runs without a database.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use creditline_shared::{CreditPackage, CreditTransaction, ProcessedWebhookEvent, User};

use crate::error::{BillingError, BillingResult};
use crate::matching::AppUserCandidates;
use crate::store::{
    next_balance, AppliedWrite, CreditResult, LedgerCommit, LedgerStore, LedgerWrite,
    WebhookMarker,
};

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    transactions: Vec<CreditTransaction>,
    webhook_events: HashMap<String, ProcessedWebhookEvent>,
    packages: Vec<CreditPackage>,
}

impl MemoryState {
    fn live_user(&self, user_id: Uuid) -> Option<&User> {
        self.users.get(&user_id).filter(|u| u.deleted_at.is_none())
    }

    fn find_transaction(&self, user_id: Uuid, external_id: &str) -> Option<&CreditTransaction> {
        self.transactions.iter().find(|tx| {
            tx.user_id == user_id && tx.external_transaction_id.as_deref() == Some(external_id)
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    state: Mutex<MemoryState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> BillingResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| BillingError::Internal("ledger store lock poisoned".to_string()))
    }

    pub fn insert_user(&self, user: User) -> BillingResult<()> {
        self.lock()?.users.insert(user.id, user);
        Ok(())
    }

    pub fn insert_package(&self, package: CreditPackage) -> BillingResult<()> {
        self.lock()?.packages.push(package);
        Ok(())
    }

    /// Ledger rows for one user, oldest first
    pub fn transactions_for(&self, user_id: Uuid) -> BillingResult<Vec<CreditTransaction>> {
        Ok(self
            .lock()?
            .transactions
            .iter()
            .filter(|tx| tx.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<User>> {
        Ok(self.lock()?.live_user(user_id).cloned())
    }

    async fn find_user_by_app_user_ids(
        &self,
        candidates: &AppUserCandidates,
    ) -> BillingResult<Option<User>> {
        let state = self.lock()?;

        let by_id = candidates
            .iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .find_map(|id| state.live_user(id));
        if let Some(user) = by_id {
            return Ok(Some(user.clone()));
        }

        // Oldest account wins when several share a customer id, as in the pg store
        let by_customer = candidates.iter().find_map(|id| {
            state
                .users
                .values()
                .filter(|u| u.deleted_at.is_none())
                .filter(|u| u.billing_customer_id.as_deref() == Some(id))
                .min_by_key(|u| (u.created_at, u.id))
        });
        Ok(by_customer.cloned())
    }

    async fn find_transaction(
        &self,
        user_id: Uuid,
        external_transaction_id: &str,
    ) -> BillingResult<Option<CreditTransaction>> {
        Ok(self
            .lock()?
            .find_transaction(user_id, external_transaction_id)
            .cloned())
    }

    async fn list_packages(&self) -> BillingResult<Vec<CreditPackage>> {
        let mut packages = self.lock()?.packages.clone();
        packages.sort_by_key(|p| p.credits);
        Ok(packages)
    }

    async fn webhook_event_exists(&self, event_id: &str) -> BillingResult<bool> {
        Ok(self.lock()?.webhook_events.contains_key(event_id))
    }

    async fn record_webhook_event(&self, marker: &WebhookMarker) -> BillingResult<bool> {
        let mut state = self.lock()?;
        if state.webhook_events.contains_key(&marker.event_id) {
            return Ok(false);
        }
        state.webhook_events.insert(
            marker.event_id.clone(),
            ProcessedWebhookEvent {
                event_id: marker.event_id.clone(),
                event_type: marker.event_type.clone(),
                processed_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(true)
    }

    async fn set_billing_customer_id(&self, user_id: Uuid, customer_id: &str) -> BillingResult<User> {
        let mut state = self.lock()?;
        let user = state
            .users
            .get_mut(&user_id)
            .filter(|u| u.deleted_at.is_none())
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
        user.billing_customer_id = Some(customer_id.to_string());
        user.updated_at = OffsetDateTime::now_utc();
        Ok(user.clone())
    }

    async fn commit(&self, write: LedgerWrite) -> BillingResult<LedgerCommit> {
        let mut state = self.lock()?;
        let now = OffsetDateTime::now_utc();

        // Work on a copy so a failed check leaves the state untouched
        let mut user = state
            .live_user(write.user_id)
            .cloned()
            .ok_or_else(|| BillingError::UserNotFound(write.user_id.to_string()))?;

        if let Some(marker) = &write.webhook_event {
            if state.webhook_events.contains_key(&marker.event_id) {
                return Ok(LedgerCommit::DuplicateEvent);
            }
        }

        let mut new_row = None;
        let credit = match &write.credit {
            None => None,
            Some(entry) => {
                let existing = entry
                    .external_transaction_id
                    .as_deref()
                    .and_then(|ext| state.find_transaction(user.id, ext));
                match existing {
                    Some(tx) => Some(CreditResult::AlreadyRecorded(tx.clone())),
                    None => {
                        user.credits = next_balance(user.credits, entry.amount)?;
                        let tx = CreditTransaction {
                            id: Uuid::new_v4(),
                            user_id: user.id,
                            kind: entry.kind,
                            amount: entry.amount,
                            balance_after: user.credits,
                            external_transaction_id: entry.external_transaction_id.clone(),
                            product_id: entry.product_id.clone(),
                            created_at: now,
                        };
                        new_row = Some(tx.clone());
                        Some(CreditResult::Recorded(tx))
                    }
                }
            }
        };

        if let Some(change) = &write.subscription {
            if let Some(status) = change.status {
                user.subscription_status = status;
            }
            if let Some(product_id) = &change.product_id {
                user.subscription_product_id = Some(product_id.clone());
            }
            if let Some(expires_at) = change.expires_at {
                user.subscription_expires_at = Some(expires_at);
            }
        }

        if user.billing_customer_id.is_none() {
            if let Some(customer_id) = &write.link_customer_id {
                user.billing_customer_id = Some(customer_id.clone());
            }
        }

        user.updated_at = now;

        if let Some(marker) = write.webhook_event {
            state.webhook_events.insert(
                marker.event_id.clone(),
                ProcessedWebhookEvent {
                    event_id: marker.event_id,
                    event_type: marker.event_type,
                    processed_at: now,
                },
            );
        }
        if let Some(tx) = new_row {
            state.transactions.push(tx);
        }
        state.users.insert(user.id, user.clone());

        Ok(LedgerCommit::Applied(AppliedWrite { user, credit }))
    }
}
