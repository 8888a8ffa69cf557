use axum::extract::State;

use crate::db::AppState;
use crate::engine::{ledger, orders};
use crate::error::Result;
use crate::extractors::{Json, Path, Query, UserId};
use crate::models::{CreateOrder, Order, PaymentRecord, RefundOrder};
use crate::pagination::{Paginated, PaginationQuery};

pub async fn create_order(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(input): Json<CreateOrder>,
) -> Result<Json<Order>> {
    Ok(Json(orders::create_order(&state, user_id, &input)?))
}

pub async fn list_orders(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Query(page): Query<PaginationQuery>,
) -> Result<Json<Paginated<Order>>> {
    Ok(Json(orders::list_user_orders(&state, user_id, &page)?))
}

pub async fn get_order(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<Json<Order>> {
    Ok(Json(orders::get_order(&state, user_id, &id)?))
}

pub async fn get_order_by_number(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(order_number): Path<String>,
) -> Result<Json<Order>> {
    Ok(Json(orders::get_order_by_number(&state, user_id, &order_number)?))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<Json<Order>> {
    Ok(Json(orders::cancel_order(&state, user_id, &id)?))
}

pub async fn refund_order(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
    Json(input): Json<RefundOrder>,
) -> Result<Json<Order>> {
    Ok(Json(ledger::refund_payment(&state, user_id, &id, &input).await?))
}

pub async fn list_order_payments(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<Json<Vec<PaymentRecord>>> {
    Ok(Json(ledger::list_order_payments(&state, user_id, &id)?))
}
