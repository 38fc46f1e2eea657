//! Subscription state as mirrored from the billing provider

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use creditline_shared::{normalize_customer_id, SubscriptionStatus, User};

use crate::error::{BillingError, BillingResult};
use crate::store::LedgerStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub status: SubscriptionStatus,
    pub product_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub is_active: bool,
    pub customer_id: Option<String>,
}

impl SubscriptionView {
    pub fn from_user(user: &User, now: OffsetDateTime) -> Self {
        Self {
            status: user.subscription_status,
            product_id: user.subscription_product_id.clone(),
            expires_at: user.subscription_expires_at,
            is_active: user.has_active_subscription(now),
            customer_id: user.billing_customer_id.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn LedgerStore>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn get_subscription(&self, user_id: Uuid) -> BillingResult<SubscriptionView> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
        Ok(SubscriptionView::from_user(&user, OffsetDateTime::now_utc()))
    }

    /// Store the provider app-user id the client purchases under
    ///
    /// Overwrites any earlier link; purchases verified afterwards check this id first.
    pub async fn link_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<SubscriptionView> {
        let customer_id = normalize_customer_id(customer_id)?;
        let user = self.store.set_billing_customer_id(user_id, &customer_id).await?;
        tracing::info!(user_id = %user_id, customer_id = %customer_id, "Linked billing customer id");
        Ok(SubscriptionView::from_user(&user, OffsetDateTime::now_utc()))
    }
}
