#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Creditline Billing
//!
//! Turns RevenueCat purchases into credit ledger entries. Two inputs feed the
//! ledger: purchases the client submits after checkout ([`CreditReconciler`]) and
//! provider webhooks ([`WebhookProcessor`]). Both converge on the same
//! `(user_id, external_transaction_id)` key, so a purchase is credited once no
//! matter which side reports it first or how often.

use std::sync::Arc;

pub mod client;
pub mod credits;
pub mod error;
pub mod matching;
pub mod memory;
pub mod pg;
pub mod reconciler;
pub mod store;
pub mod subscription;
pub mod verifier;
pub mod webhooks;

pub use client::{
    ProviderPurchase, PurchaseHistorySource, RevenueCatClient, RevenueCatConfig, SubscriberInfo,
};
pub use credits::{CreditService, PackageView};
pub use error::{BillingError, BillingResult};
pub use matching::{match_rank, product_suffix_key, AppUserCandidates, MatchRank};
pub use memory::MemoryLedgerStore;
pub use pg::PgLedgerStore;
pub use reconciler::{CreditReconciler, PurchaseClaim, PurchaseOutcome};
pub use store::{
    AppliedWrite, CreditEntry, CreditResult, LedgerCommit, LedgerStore, LedgerWrite,
    SubscriptionChange, WebhookMarker,
};
pub use subscription::{SubscriptionService, SubscriptionView};
pub use verifier::{PurchaseVerifier, Verification};
pub use webhooks::{
    plan_transition, Transition, WebhookEvent, WebhookEventType, WebhookOutcome,
    WebhookProcessor, WebhookRequest,
};

/// Every billing service wired to one store and one provider
#[derive(Clone)]
pub struct BillingServices {
    pub reconciler: CreditReconciler,
    pub webhooks: WebhookProcessor,
    pub credits: CreditService,
    pub subscriptions: SubscriptionService,
}

impl BillingServices {
    pub fn new(store: Arc<dyn LedgerStore>, source: Arc<dyn PurchaseHistorySource>) -> Self {
        let verifier = PurchaseVerifier::new(source);
        Self {
            reconciler: CreditReconciler::new(store.clone(), verifier),
            webhooks: WebhookProcessor::new(store.clone()),
            credits: CreditService::new(store.clone()),
            subscriptions: SubscriptionService::new(store),
        }
    }
}
