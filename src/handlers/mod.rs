//! HTTP surface. Handlers stay thin: extract, call the engine, wrap in JSON.

mod activities;
mod orders;
mod payments;
mod products;
mod subscriptions;
pub mod webhooks;

pub use activities::*;
pub use orders::*;
pub use payments::*;
pub use products::*;
pub use subscriptions::*;

use axum::{
    Json, Router,
    routing::{get, post, put},
};
use serde::Serialize;

use crate::db::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        // Catalog
        .route("/products", post(create_product).get(list_products))
        .route("/products/{id}", get(get_product))
        .route("/products/{id}/status", put(set_product_status))
        .route("/products/{id}/stock", get(check_stock))
        .route("/products/{id}/skus", post(create_sku).get(list_skus))
        .route("/skus/{id}", get(get_sku))
        // Orders
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/by-number/{order_number}", get(get_order_by_number))
        .route("/orders/{id}", get(get_order))
        .route("/orders/{id}/cancel", post(cancel_order))
        .route("/orders/{id}/refund", post(refund_order))
        .route("/orders/{id}/payments", get(list_order_payments))
        // Payments
        .route("/payments", post(create_payment))
        .route("/payments/{id}", get(get_payment))
        .route("/payments/{id}/status", get(query_payment_status))
        // Subscriptions
        .route("/subscriptions", get(list_subscriptions))
        .route("/subscriptions/active", get(get_active_subscription))
        .route("/subscriptions/{id}", get(get_subscription))
        .route("/subscriptions/{id}/renew", post(renew_subscription))
        .route("/subscriptions/{id}/upgrade", post(upgrade_subscription))
        .route("/subscriptions/{id}/downgrade", post(downgrade_subscription))
        .route("/subscriptions/{id}/cancel", post(cancel_subscription))
        .route("/subscriptions/{id}/pause", post(pause_subscription))
        .route("/subscriptions/{id}/resume", post(resume_subscription))
        .route("/subscriptions/{id}/auto-renew", put(set_auto_renew))
        .route("/subscriptions/{id}/quota/consume", post(consume_quota))
        .route("/limits", get(get_limits))
        .route("/permissions/check", post(check_permission))
        // Activity log
        .route("/activities", get(list_activities))
        .route("/activities/unread-count", get(unread_count))
        .route("/activities/read-all", post(mark_all_read))
        .route("/activities/{id}/read", post(mark_read))
        .route("/activities/{id}/resolve", post(mark_resolved))
        .merge(webhooks::router())
}
