//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;

use creditline_billing::BillingServices;

#[derive(Clone)]
pub struct AppState {
    /// Probed by the health endpoints. `None` when the ledger lives in memory.
    pub pool: Option<PgPool>,
    pub billing: BillingServices,
    /// Webhook shared secret, read once from `Config` at startup
    pub webhook_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(pool: Option<PgPool>, billing: BillingServices, webhook_secret: Option<String>) -> Self {
        Self {
            pool,
            billing,
            webhook_secret: webhook_secret.map(Arc::from),
        }
    }
}
