//! API routes

pub mod credits;
pub mod health;
pub mod subscription;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    // Health routes (no auth)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // RevenueCat webhook (authorized by shared secret inside the handler)
    let webhook_routes = Router::new().route("/webhooks/revenuecat", post(webhooks::revenuecat));

    // User routes (identity from the X-User-Id header)
    let user_routes = Router::new()
        .route("/credits/balance", get(credits::balance))
        .route("/credits/packages", get(credits::packages))
        .route("/credits/purchase", post(credits::purchase))
        .route("/credits/deduct", post(credits::deduct))
        .route("/subscription", get(subscription::get_subscription))
        .route("/subscription/customer", post(subscription::link_customer));

    let api_routes = Router::new().merge(webhook_routes).merge(user_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api", api_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
