//! RevenueCat webhook processing
//!
//! Deliveries are at-least-once and unordered. Each event id is applied once: the
//! marker is checked up front and written in the same commit as the event's
//! effects. Credit grants share the `(user_id, external_transaction_id)` key with
//! client purchase submissions, so whichever path lands first wins.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use creditline_shared::{CreditTransactionType, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};
use crate::matching::AppUserCandidates;
use crate::store::{
    CreditEntry, CreditResult, LedgerCommit, LedgerStore, LedgerWrite, SubscriptionChange,
    WebhookMarker,
};

/// Webhook body: `{ "event": {...}, "api_version": "1.0" }`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookRequest {
    pub event: Option<WebhookEvent>,
    #[serde(default)]
    pub api_version: Option<String>,
}

/// The subset of event fields that affect credits or subscription state
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    pub app_user_id: Option<String>,
    pub original_app_user_id: Option<String>,
    pub aliases: Option<Vec<String>>,
    pub product_id: Option<String>,
    pub new_product_id: Option<String>,
    pub transaction_id: Option<String>,
    pub expiration_at_ms: Option<i64>,
    pub environment: Option<String>,
    pub transferred_from: Option<Vec<String>>,
    pub transferred_to: Option<Vec<String>>,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl WebhookEvent {
    /// `app_user_id`, then `original_app_user_id`, then aliases in order
    pub fn app_user_candidates(&self) -> AppUserCandidates {
        let mut candidates = AppUserCandidates::new();
        candidates
            .push_opt(self.app_user_id.as_deref())
            .push_opt(self.original_app_user_id.as_deref());
        for alias in self.aliases.iter().flatten() {
            candidates.push(alias);
        }
        candidates
    }

    /// Transaction id of the purchase this event reports, or the event id
    pub fn idempotency_key(&self) -> &str {
        non_blank(self.transaction_id.as_deref()).unwrap_or(self.id.trim())
    }

    /// Ledger key for a grant of `kind` made by this event
    ///
    /// A refund reversal carries the reversed purchase's transaction id, which the
    /// original grant already holds, so reversals are keyed per event instead.
    pub fn ledger_key(&self, kind: CreditTransactionType) -> String {
        match kind {
            CreditTransactionType::RefundReversal => format!("refund_reversed:{}", self.id.trim()),
            _ => self.idempotency_key().to_string(),
        }
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        let ms = self.expiration_at_ms.filter(|ms| *ms > 0)?;
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
    }

    pub fn product_id(&self) -> Option<&str> {
        non_blank(self.product_id.as_deref())
    }

    /// Product after a change: `new_product_id` over `product_id`
    pub fn effective_product_id(&self) -> Option<&str> {
        non_blank(self.new_product_id.as_deref()).or_else(|| self.product_id())
    }
}

/// Event types with an effect on the ledger or subscription state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventType {
    InitialPurchase,
    Renewal,
    NonRenewingPurchase,
    Cancellation,
    Uncancellation,
    Expiration,
    SubscriptionPaused,
    SubscriptionExtended,
    ProductChange,
    RefundReversed,
    BillingIssue,
    Transfer,
    Test,
    Unknown(String),
}

impl From<&str> for WebhookEventType {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "INITIAL_PURCHASE" => Self::InitialPurchase,
            "RENEWAL" => Self::Renewal,
            "NON_RENEWING_PURCHASE" => Self::NonRenewingPurchase,
            "CANCELLATION" => Self::Cancellation,
            "UNCANCELLATION" => Self::Uncancellation,
            "EXPIRATION" => Self::Expiration,
            "SUBSCRIPTION_PAUSED" => Self::SubscriptionPaused,
            "SUBSCRIPTION_EXTENDED" => Self::SubscriptionExtended,
            "PRODUCT_CHANGE" => Self::ProductChange,
            "REFUND_REVERSED" => Self::RefundReversed,
            "BILLING_ISSUE" => Self::BillingIssue,
            "TRANSFER" => Self::Transfer,
            "TEST" => Self::Test,
            _ => Self::Unknown(s.to_string()),
        }
    }
}

/// What an event does to the resolved user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Grant catalog credits for the event's product, then apply the change
    Grant {
        kind: CreditTransactionType,
        subscription: SubscriptionChange,
    },
    /// Subscription fields only
    Update(SubscriptionChange),
    /// No state change
    Acknowledge,
}

/// Map an event to its transition
///
/// Transitions set absolute state, so applying them out of order converges on
/// the last delivery instead of corrupting counters.
pub fn plan_transition(event_type: &WebhookEventType, event: &WebhookEvent) -> Transition {
    let product_id = event.product_id().map(str::to_string);
    match event_type {
        WebhookEventType::InitialPurchase
        | WebhookEventType::Renewal
        | WebhookEventType::NonRenewingPurchase => Transition::Grant {
            kind: CreditTransactionType::Purchase,
            subscription: SubscriptionChange {
                status: Some(SubscriptionStatus::Active),
                product_id,
                expires_at: event.expires_at(),
            },
        },
        WebhookEventType::Cancellation => {
            Transition::Update(SubscriptionChange::status(SubscriptionStatus::Cancelled))
        }
        WebhookEventType::Uncancellation => Transition::Update(SubscriptionChange {
            status: Some(SubscriptionStatus::Active),
            product_id,
            expires_at: event.expires_at(),
        }),
        WebhookEventType::Expiration => {
            Transition::Update(SubscriptionChange::status(SubscriptionStatus::Expired))
        }
        WebhookEventType::SubscriptionPaused => {
            Transition::Update(SubscriptionChange::status(SubscriptionStatus::Paused))
        }
        WebhookEventType::SubscriptionExtended | WebhookEventType::ProductChange => {
            Transition::Update(SubscriptionChange {
                status: None,
                product_id: event.effective_product_id().map(str::to_string),
                expires_at: event.expires_at(),
            })
        }
        WebhookEventType::RefundReversed => Transition::Grant {
            kind: CreditTransactionType::RefundReversal,
            subscription: SubscriptionChange::default(),
        },
        WebhookEventType::BillingIssue
        | WebhookEventType::Transfer
        | WebhookEventType::Test
        | WebhookEventType::Unknown(_) => Transition::Acknowledge,
    }
}

/// Result of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WebhookOutcome {
    /// `false` for a re-delivery or an event with nothing to apply
    pub processed: bool,
}

/// Applies webhook events to the ledger
#[derive(Clone)]
pub struct WebhookProcessor {
    store: Arc<dyn LedgerStore>,
}

impl WebhookProcessor {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Process one delivery
    ///
    /// Errors: `InvalidInput` for a missing event or id, `WebhookUserNotFound` when
    /// no app-user id maps to a user (neither is worth retrying as-is), and
    /// retryable storage errors.
    pub async fn process(&self, request: Option<WebhookRequest>) -> BillingResult<WebhookOutcome> {
        let event = request
            .and_then(|r| r.event)
            .ok_or_else(|| BillingError::InvalidInput("Invalid webhook payload: event is required".to_string()))?;
        let event_id = event.id.trim();
        if event_id.is_empty() {
            return Err(BillingError::InvalidInput(
                "Invalid webhook payload: event.id is required".to_string(),
            ));
        }

        let event_type = WebhookEventType::from(event.event_type.as_str());
        tracing::info!(
            event_id = %event_id,
            event_type = %event.event_type,
            product_id = ?event.product_id,
            app_user_id = ?event.app_user_id,
            environment = ?event.environment,
            "RevenueCat webhook received"
        );

        if self.store.webhook_event_exists(event_id).await? {
            tracing::info!(event_id = %event_id, "Webhook event already processed, skipping");
            return Ok(WebhookOutcome { processed: false });
        }

        let marker = WebhookMarker {
            event_id: event_id.to_string(),
            event_type: event.event_type.trim().to_string(),
        };

        match &event_type {
            WebhookEventType::Transfer => return self.handle_transfer(&event, marker).await,
            WebhookEventType::Test => {
                tracing::info!(event_id = %event_id, "TEST event acknowledged");
                let processed = self.store.record_webhook_event(&marker).await?;
                return Ok(WebhookOutcome { processed });
            }
            WebhookEventType::Unknown(kind) => {
                tracing::info!(event_id = %event_id, event_type = %kind, "Unhandled webhook event type");
                let processed = self.store.record_webhook_event(&marker).await?;
                return Ok(WebhookOutcome { processed });
            }
            _ => {}
        }

        let candidates = event.app_user_candidates();
        let user = self
            .store
            .find_user_by_app_user_ids(&candidates)
            .await?
            .ok_or_else(|| {
                tracing::warn!(event_id = %event_id, candidates = %candidates, "Webhook user not found");
                BillingError::WebhookUserNotFound(candidates.to_string())
            })?;

        let mut write = LedgerWrite::for_user(user.id)
            .link_customer(candidates.first().map(str::to_string))
            .webhook_event(marker);

        match plan_transition(&event_type, &event) {
            Transition::Grant { kind, subscription } => {
                if let Some(entry) = self.credit_entry(&event, kind).await? {
                    write = write.credit(entry);
                }
                write = write.subscription(subscription);
            }
            Transition::Update(change) => write = write.subscription(change),
            Transition::Acknowledge => {
                if event_type == WebhookEventType::BillingIssue {
                    tracing::warn!(user_id = %user.id, event_id = %event_id, "Billing issue reported for subscription");
                }
            }
        }

        match self.store.commit(write).await? {
            LedgerCommit::DuplicateEvent => {
                tracing::info!(event_id = %event_id, "Webhook event processed concurrently, skipping");
                Ok(WebhookOutcome { processed: false })
            }
            LedgerCommit::Applied(applied) => {
                match &applied.credit {
                    Some(CreditResult::Recorded(tx)) => tracing::info!(
                        user_id = %user.id,
                        event_id = %event_id,
                        credits_added = tx.amount,
                        new_balance = applied.user.credits,
                        "Webhook credited user"
                    ),
                    Some(CreditResult::AlreadyRecorded(tx)) => tracing::info!(
                        user_id = %user.id,
                        event_id = %event_id,
                        transaction_id = ?tx.external_transaction_id,
                        "Transaction already credited, balance unchanged"
                    ),
                    None => {}
                }
                tracing::info!(
                    user_id = %user.id,
                    event_id = %event_id,
                    subscription_status = %applied.user.subscription_status,
                    "Webhook event applied"
                );
                Ok(WebhookOutcome { processed: true })
            }
        }
    }

    /// Ledger entry for a granting event, `None` when the product does not map
    async fn credit_entry(
        &self,
        event: &WebhookEvent,
        kind: CreditTransactionType,
    ) -> BillingResult<Option<CreditEntry>> {
        let Some(product_id) = event.product_id() else {
            tracing::warn!(event_id = %event.id, "Granting event has no product id, no credits added");
            return Ok(None);
        };

        let Some(package) = self.store.find_package(&[product_id]).await? else {
            tracing::warn!(
                event_id = %event.id,
                product_id = %product_id,
                "No credit package for product, no credits added"
            );
            return Ok(None);
        };

        Ok(Some(CreditEntry {
            kind,
            amount: package.credits_to_grant(),
            external_transaction_id: Some(event.ledger_key(kind)),
            product_id: Some(product_id.to_string()),
        }))
    }

    async fn handle_transfer(
        &self,
        event: &WebhookEvent,
        marker: WebhookMarker,
    ) -> BillingResult<WebhookOutcome> {
        let targets: Vec<&str> = event
            .transferred_to
            .iter()
            .flatten()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .collect();
        tracing::info!(
            event_id = %marker.event_id,
            transferred_from = ?event.transferred_from,
            transferred_to = ?targets,
            "TRANSFER received"
        );
        if targets.is_empty() {
            tracing::info!(event_id = %marker.event_id, "TRANSFER without recipients, nothing to do");
            return Ok(WebhookOutcome { processed: false });
        }

        for target in targets {
            let candidates: AppUserCandidates = std::iter::once(target).collect();
            match self.store.find_user_by_app_user_ids(&candidates).await? {
                Some(user) => {
                    tracing::info!(event_id = %marker.event_id, user_id = %user.id, "TRANSFER to user acknowledged")
                }
                None => {
                    tracing::debug!(event_id = %marker.event_id, app_user_id = %target, "TRANSFER recipient unknown")
                }
            }
        }

        let processed = self.store.record_webhook_event(&marker).await?;
        Ok(WebhookOutcome { processed })
    }
}
