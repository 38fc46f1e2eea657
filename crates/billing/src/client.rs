//! RevenueCat client configuration and subscriber API

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

const DEFAULT_BASE_URL: &str = "https://api.revenuecat.com/v1";
const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_RETRIES: usize = 2;
const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

/// Configuration for the RevenueCat subscriber API
#[derive(Debug, Clone)]
pub struct RevenueCatConfig {
    /// Secret API key sent as a bearer token
    pub api_key: String,
    /// API root, without the `/subscribers` segment
    pub base_url: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Optional `X-Platform` header value (`ios`, `android`, `stripe`)
    pub platform: Option<String>,
    /// Extra attempts after the first on transient failures
    pub max_retries: usize,
}

impl RevenueCatConfig {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            platform: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let api_key = std::env::var("REVENUECAT_API_KEY")
            .map_err(|_| BillingError::Config("REVENUECAT_API_KEY not set".to_string()))?;
        if api_key.trim().is_empty() {
            return Err(BillingError::Config(
                "REVENUECAT_API_KEY is empty".to_string(),
            ));
        }

        Ok(Self {
            api_key,
            base_url: std::env::var("REVENUECAT_API_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            timeout: Duration::from_millis(
                std::env::var("REVENUECAT_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_TIMEOUT_MS),
            ),
            platform: std::env::var("REVENUECAT_PLATFORM")
                .ok()
                .filter(|p| !p.trim().is_empty()),
            max_retries: std::env::var("REVENUECAT_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_RETRIES),
        })
    }
}

/// One purchase from a subscriber's history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderPurchase {
    pub product_id: String,
    /// Provider-side transaction id
    pub transaction_id: Option<String>,
    /// Store transaction id (App Store, Play, Stripe) when reported
    pub store_transaction_id: Option<String>,
    pub purchased_at_ms: Option<i64>,
    pub store: Option<String>,
}

impl ProviderPurchase {
    /// The id webhooks report as `transaction_id`: store id first, provider id second
    pub fn canonical_transaction_id(&self) -> Option<&str> {
        self.store_transaction_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .or_else(|| self.transaction_id.as_deref().filter(|id| !id.is_empty()))
    }

    /// Whether either transaction id equals `id`
    pub fn has_transaction_id(&self, id: &str) -> bool {
        self.transaction_id.as_deref() == Some(id)
            || self.store_transaction_id.as_deref() == Some(id)
    }
}

/// Purchase history for one app-user id
#[derive(Debug, Clone, Default)]
pub struct SubscriberInfo {
    pub app_user_id: String,
    pub purchases: Vec<ProviderPurchase>,
}

/// Source of provider purchase history
///
/// `Ok(None)` means the provider has never seen this app-user id.
#[async_trait]
pub trait PurchaseHistorySource: Send + Sync {
    async fn fetch_subscriber(&self, app_user_id: &str) -> BillingResult<Option<SubscriberInfo>>;
}

/// HTTP client for `GET /subscribers/{app_user_id}`
#[derive(Clone)]
pub struct RevenueCatClient {
    http: reqwest::Client,
    config: RevenueCatConfig,
}

impl RevenueCatClient {
    pub fn new(config: RevenueCatConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    fn subscriber_url(&self, app_user_id: &str) -> BillingResult<Url> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| BillingError::Config(format!("invalid RevenueCat base URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| BillingError::Config("RevenueCat base URL cannot be a base".to_string()))?
            .pop_if_empty()
            .push("subscribers")
            .push(app_user_id);
        Ok(url)
    }

    async fn fetch_once(&self, url: &Url, app_user_id: &str) -> BillingResult<Option<SubscriberInfo>> {
        let mut request = self
            .http
            .get(url.clone())
            .bearer_auth(&self.config.api_key)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(platform) = &self.config.platform {
            request = request.header("X-Platform", platform);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            tracing::info!(app_user_id = %app_user_id, "RevenueCat subscriber not found");
            return Ok(None);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                app_user_id = %app_user_id,
                status = status.as_u16(),
                "RevenueCat subscriber fetch failed"
            );
            return Err(BillingError::ProviderApi {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: SubscriberEnvelope = response.json().await?;
        let Some(subscriber) = envelope.subscriber else {
            tracing::warn!(app_user_id = %app_user_id, "RevenueCat response has no subscriber object");
            return Ok(None);
        };

        let info = subscriber.into_info(app_user_id);
        tracing::debug!(
            app_user_id = %app_user_id,
            purchases = info.purchases.len(),
            "Fetched RevenueCat purchase history"
        );
        Ok(Some(info))
    }
}

#[async_trait]
impl PurchaseHistorySource for RevenueCatClient {
    /// Fetch history, retrying transient failures with exponential backoff
    async fn fetch_subscriber(&self, app_user_id: &str) -> BillingResult<Option<SubscriberInfo>> {
        let url = self.subscriber_url(app_user_id)?;

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(100)
            .max_delay(RETRY_MAX_DELAY)
            .take(self.config.max_retries)
            .map(jitter);

        RetryIf::spawn(
            strategy,
            || self.fetch_once(&url, app_user_id),
            |e: &BillingError| {
                let retry = e.is_retryable();
                if retry {
                    tracing::debug!(app_user_id = %app_user_id, error = %e, "Transient error - will retry");
                }
                retry
            },
        )
        .await
    }
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Debug, Deserialize)]
struct SubscriberEnvelope {
    subscriber: Option<RawSubscriber>,
}

#[derive(Debug, Deserialize)]
struct RawSubscriber {
    #[serde(default)]
    non_subscriptions: BTreeMap<String, Vec<RawNonSubscription>>,
    #[serde(default)]
    subscriptions: BTreeMap<String, RawSubscription>,
}

#[derive(Debug, Deserialize)]
struct RawNonSubscription {
    id: Option<String>,
    transaction_id: Option<String>,
    store_transaction_id: Option<String>,
    purchase_date_ms: Option<i64>,
    purchase_date: Option<String>,
    store: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSubscription {
    original_transaction_id: Option<String>,
    store_transaction_id: Option<String>,
    purchase_date_ms: Option<i64>,
    purchase_date: Option<String>,
    store: Option<String>,
}

fn purchase_time_ms(millis: Option<i64>, rfc3339: Option<&str>) -> Option<i64> {
    millis.or_else(|| {
        let parsed = OffsetDateTime::parse(rfc3339?, &Rfc3339).ok()?;
        i64::try_from(parsed.unix_timestamp_nanos() / 1_000_000).ok()
    })
}

impl RawSubscriber {
    fn into_info(self, app_user_id: &str) -> SubscriberInfo {
        let mut purchases = Vec::new();

        for (product_id, entries) in self.non_subscriptions {
            for entry in entries {
                purchases.push(ProviderPurchase {
                    product_id: product_id.clone(),
                    purchased_at_ms: purchase_time_ms(entry.purchase_date_ms, entry.purchase_date.as_deref()),
                    transaction_id: entry.transaction_id.or(entry.id),
                    store_transaction_id: entry.store_transaction_id,
                    store: entry.store,
                });
            }
        }

        for (product_id, sub) in self.subscriptions {
            let purchased_at_ms = purchase_time_ms(sub.purchase_date_ms, sub.purchase_date.as_deref());
            // Entries with no purchase date are placeholders for never-purchased products
            if purchased_at_ms.is_none() {
                continue;
            }
            purchases.push(ProviderPurchase {
                product_id,
                transaction_id: sub.original_transaction_id,
                store_transaction_id: sub.store_transaction_id,
                purchased_at_ms,
                store: sub.store,
            });
        }

        SubscriberInfo {
            app_user_id: app_user_id.to_string(),
            purchases,
        }
    }
}
