//! Common types used across Creditline

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::SharedError;

/// Trim a billing customer id and reject blank input
pub fn normalize_customer_id(raw: &str) -> Result<String, SharedError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SharedError::Validation(
            "customer id must not be empty".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

// =============================================================================
// Enums
// =============================================================================

/// Subscription lifecycle state mirrored from the billing provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    None,
    Active,
    Expired,
    Cancelled,
    Paused,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::None
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Active => write!(f, "active"),
            Self::Expired => write!(f, "expired"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            // Provider dashboards use the US spelling
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "paused" => Ok(Self::Paused),
            _ => Err(SharedError::InvalidEnum {
                kind: "subscription status",
                value: s.to_string(),
            }),
        }
    }
}

/// Kind of ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CreditTransactionType {
    /// Credits bought through the billing provider
    Purchase,
    /// Credits spent (message send)
    Deduction,
    /// Credits returned to the user
    Refund,
    /// Provider reversed an earlier refund, credits granted again
    RefundReversal,
    /// Promotional grant
    Bonus,
}

impl std::fmt::Display for CreditTransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Purchase => write!(f, "purchase"),
            Self::Deduction => write!(f, "deduction"),
            Self::Refund => write!(f, "refund"),
            Self::RefundReversal => write!(f, "refund_reversal"),
            Self::Bonus => write!(f, "bonus"),
        }
    }
}

impl std::str::FromStr for CreditTransactionType {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "purchase" => Ok(Self::Purchase),
            "deduction" => Ok(Self::Deduction),
            "refund" => Ok(Self::Refund),
            "refund_reversal" => Ok(Self::RefundReversal),
            "bonus" => Ok(Self::Bonus),
            _ => Err(SharedError::InvalidEnum {
                kind: "credit transaction type",
                value: s.to_string(),
            }),
        }
    }
}

/// Catalog package type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PackageType {
    OneTime,
    Subscription,
}

impl Default for PackageType {
    fn default() -> Self {
        Self::OneTime
    }
}

impl std::fmt::Display for PackageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OneTime => write!(f, "one_time"),
            Self::Subscription => write!(f, "subscription"),
        }
    }
}

impl std::str::FromStr for PackageType {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "one_time" => Ok(Self::OneTime),
            "subscription" => Ok(Self::Subscription),
            _ => Err(SharedError::InvalidEnum {
                kind: "package type",
                value: s.to_string(),
            }),
        }
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Ledger owner: spendable balance plus mirrored subscription state
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub credits: i32,
    /// App-user id at the billing provider, NULL until first linked
    pub billing_customer_id: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub subscription_product_id: Option<String>,
    pub subscription_expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sqlx(default)]
    pub deleted_at: Option<OffsetDateTime>,
}

impl User {
    /// A fresh user with the given starting balance
    pub fn new(id: Uuid, credits: i32) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            credits,
            billing_customer_id: None,
            subscription_status: SubscriptionStatus::None,
            subscription_product_id: None,
            subscription_expires_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Active status with an expiry still in the future
    pub fn has_active_subscription(&self, now: OffsetDateTime) -> bool {
        self.subscription_status == SubscriptionStatus::Active
            && self
                .subscription_expires_at
                .map(|expires_at| expires_at > now)
                .unwrap_or(false)
    }
}

/// Append-only ledger row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: CreditTransactionType,
    /// Signed amount, negative for deductions
    pub amount: i32,
    pub balance_after: i32,
    /// Provider transaction id; the idempotency key for purchases
    pub external_transaction_id: Option<String>,
    pub product_id: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Dedup marker for a provider webhook event
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProcessedWebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub processed_at: OffsetDateTime,
}

/// Credit package catalog entry
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditPackage {
    pub id: Uuid,
    pub name: String,
    /// Base credit amount before bonus
    pub credits: i32,
    pub bonus_percentage: Option<i32>,
    pub price_cents: i64,
    /// Storefront product id (e.g. `com.example.credits_100`)
    pub provider_product_id: Option<String>,
    /// Provider package key (e.g. `$rc_credits_100`)
    pub provider_package_id: Option<String>,
    pub package_type: PackageType,
}

impl CreditPackage {
    /// Credits granted for one purchase: `base * (1 + bonus/100)`, truncated.
    ///
    /// Integer arithmetic keeps truncation exact (no `109.99999` surprises).
    pub fn credits_to_grant(&self) -> i32 {
        let base = i64::from(self.credits);
        let total = match self.bonus_percentage {
            Some(bonus) => base * (100 + i64::from(bonus)) / 100,
            None => base,
        };
        i32::try_from(total).unwrap_or(i32::MAX)
    }

    /// Product identifiers this package is known under at the provider
    pub fn product_keys(&self) -> impl Iterator<Item = &str> {
        self.provider_product_id
            .as_deref()
            .into_iter()
            .chain(self.provider_package_id.as_deref())
    }
}
