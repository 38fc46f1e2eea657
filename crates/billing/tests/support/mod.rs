//! Shared fixtures for billing integration tests

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use creditline_billing::{
    BillingError, BillingResult, BillingServices, MemoryLedgerStore, ProviderPurchase,
    PurchaseHistorySource, SubscriberInfo,
};
use creditline_shared::{CreditPackage, PackageType, User};

// ============================================================================
// Fake provider
// ============================================================================

/// In-process purchase history keyed by app-user id
#[derive(Default)]
pub struct FakeHistory {
    subscribers: Mutex<HashMap<String, Vec<ProviderPurchase>>>,
    unavailable: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl FakeHistory {
    pub fn add_purchase(&self, app_user_id: &str, product_id: &str, transaction_id: &str, at_ms: i64) {
        self.subscribers
            .lock()
            .unwrap()
            .entry(app_user_id.to_string())
            .or_default()
            .push(ProviderPurchase {
                product_id: product_id.to_string(),
                transaction_id: Some(format!("rc_{transaction_id}")),
                store_transaction_id: Some(transaction_id.to_string()),
                purchased_at_ms: Some(at_ms),
                store: Some("app_store".to_string()),
            });
    }

    /// Make lookups for `app_user_id` fail as if the provider timed out
    pub fn fail_for(&self, app_user_id: &str) {
        self.unavailable.lock().unwrap().insert(app_user_id.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PurchaseHistorySource for FakeHistory {
    async fn fetch_subscriber(&self, app_user_id: &str) -> BillingResult<Option<SubscriberInfo>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Yield so concurrent submissions interleave at the provider call
        tokio::task::yield_now().await;

        if self.unavailable.lock().unwrap().contains(app_user_id) {
            return Err(BillingError::ProviderUnavailable("timed out".to_string()));
        }
        Ok(self
            .subscribers
            .lock()
            .unwrap()
            .get(app_user_id)
            .map(|purchases| SubscriberInfo {
                app_user_id: app_user_id.to_string(),
                purchases: purchases.clone(),
            }))
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub store: Arc<MemoryLedgerStore>,
    pub history: Arc<FakeHistory>,
    pub services: BillingServices,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryLedgerStore::new());
        let history = Arc::new(FakeHistory::default());
        let services = BillingServices::new(store.clone(), history.clone());
        Self {
            store,
            history,
            services,
        }
    }

    /// A user with the sign-up balance of 10 credits
    pub fn user(&self) -> Uuid {
        self.user_with(|_| {})
    }

    pub fn user_with(&self, customize: impl FnOnce(&mut User)) -> Uuid {
        let mut user = User::new(Uuid::new_v4(), 10);
        customize(&mut user);
        let id = user.id;
        self.store.insert_user(user).unwrap();
        id
    }

    pub fn package(&self, product_id: &str, package_id: Option<&str>, credits: i32, bonus: Option<i32>) {
        self.store
            .insert_package(CreditPackage {
                id: Uuid::new_v4(),
                name: format!("{credits} credits"),
                credits,
                bonus_percentage: bonus,
                price_cents: 499,
                provider_product_id: Some(product_id.to_string()),
                provider_package_id: package_id.map(str::to_string),
                package_type: PackageType::OneTime,
            })
            .unwrap();
    }

    /// The standard 100 + 10% package
    pub fn hundred_pack(&self) {
        self.package("com.example.credits_100", None, 100, Some(10));
    }
}
