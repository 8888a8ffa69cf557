use rusqlite::Connection;

use crate::config::EngineSettings;
use crate::db::{AppState, queries};
use crate::error::{AppError, OptionExt, Result, msg};
use crate::id::{EntityType, gen_order_number, is_valid_prefixed_id};
use crate::models::{
    CreateOrder, Order, OrderKind, OrderStatus, PaymentStatus, Product, ProductStatus,
};
use crate::pagination::{PageParams, Paginated, PaginationQuery};

use super::{SWEEP_BATCH, begin_immediate, now};

/// Build a pending order. Nothing is persisted.
#[allow(clippy::too_many_arguments)]
pub(crate) fn new_order(
    settings: &EngineSettings,
    user_id: i64,
    product: &Product,
    sku_id: Option<String>,
    quantity: i64,
    unit_price: i64,
    kind: OrderKind,
    subscription_id: Option<String>,
    payment_method: &str,
    now: i64,
) -> Result<Order> {
    let total_amount = unit_price
        .checked_mul(quantity)
        .ok_or_else(|| AppError::BadRequest(msg::AMOUNT_OVERFLOW.into()))?;

    Ok(Order {
        id: EntityType::Order.gen_id(),
        order_number: gen_order_number(now),
        user_id,
        product_id: product.id.clone(),
        sku_id,
        quantity,
        unit_price,
        total_amount,
        currency: product.currency.clone(),
        status: OrderStatus::Pending,
        kind,
        subscription_id,
        payment_method: payment_method.to_string(),
        expire_time: now + settings.order_ttl_secs,
        paid_at: None,
        refund_amount: None,
        refund_reason: None,
        refunded_at: None,
        created_at: now,
        updated_at: now,
    })
}

/// Create a pending purchase order and reserve its stock.
///
/// Insert, stock decrement and sold-count bump share one IMMEDIATE
/// transaction: when the decrement loses a race the insert is rolled back with
/// it, so a pending order always holds its stock.
pub fn create_order(state: &AppState, user_id: i64, input: &CreateOrder) -> Result<Order> {
    let mut conn = state.db.get()?;
    create_order_at(&mut conn, &state.settings, user_id, input, now())
}

pub fn create_order_at(
    conn: &mut Connection,
    settings: &EngineSettings,
    user_id: i64,
    input: &CreateOrder,
    now: i64,
) -> Result<Order> {
    if input.quantity < 1 {
        return Err(AppError::BadRequest(msg::INVALID_QUANTITY.into()));
    }
    if input.payment_method.trim().is_empty() {
        return Err(AppError::BadRequest("payment_method is required".into()));
    }

    let tx = begin_immediate(conn)?;

    let product =
        queries::get_product(&tx, &input.product_id)?.or_not_found(msg::PRODUCT_NOT_FOUND)?;
    if !product.is_active() {
        return Err(AppError::NotEligible(msg::PRODUCT_UNAVAILABLE.into()));
    }
    if !queries::check_stock(&tx, &product.id, input.quantity)? {
        return Err(AppError::InsufficientStock);
    }

    let unit_price = match &input.sku_id {
        Some(sku_id) => {
            let sku = queries::get_sku(&tx, sku_id)?.or_not_found(msg::SKU_NOT_FOUND)?;
            if sku.product_id != product.id {
                return Err(AppError::BadRequest(msg::SKU_PRODUCT_MISMATCH.into()));
            }
            if sku.status != ProductStatus::Active {
                return Err(AppError::NotEligible(msg::PRODUCT_UNAVAILABLE.into()));
            }
            sku.price
        }
        None => product.price,
    };

    let order = new_order(
        settings,
        user_id,
        &product,
        input.sku_id.clone(),
        input.quantity,
        unit_price,
        OrderKind::Purchase,
        None,
        &input.payment_method,
        now,
    )?;
    queries::insert_order(&tx, &order)?;

    if !queries::decrease_stock(&tx, &product.id, order.quantity)? {
        // Dropping the transaction discards the insert.
        return Err(AppError::InsufficientStock);
    }
    if let Err(e) = queries::increment_sold_count(&tx, &product.id, order.quantity) {
        tracing::warn!("Failed to bump sold count of {}: {}", product.id, e);
    }

    tx.commit()?;

    tracing::info!(
        "Order {} created for user {}: {} x {} = {} {}",
        order.order_number,
        user_id,
        order.quantity,
        order.unit_price,
        order.total_amount,
        order.currency
    );
    Ok(order)
}

/// Load an order owned by `user_id`. Orders of other users are reported as
/// not found.
pub(crate) fn load_user_order(conn: &Connection, user_id: i64, id: &str) -> Result<Order> {
    if !is_valid_prefixed_id(id) {
        return Err(AppError::NotFound(msg::ORDER_NOT_FOUND));
    }
    queries::get_order(conn, id)?
        .filter(|o| o.user_id == user_id)
        .or_not_found(msg::ORDER_NOT_FOUND)
}

pub fn get_order(state: &AppState, user_id: i64, id: &str) -> Result<Order> {
    let conn = state.db.get()?;
    load_user_order(&conn, user_id, id)
}

pub fn get_order_by_number(state: &AppState, user_id: i64, order_number: &str) -> Result<Order> {
    let conn = state.db.get()?;
    queries::get_order_by_number(&conn, order_number)?
        .filter(|o| o.user_id == user_id)
        .or_not_found(msg::ORDER_NOT_FOUND)
}

pub fn list_user_orders(
    state: &AppState,
    user_id: i64,
    page: &PaginationQuery,
) -> Result<Paginated<Order>> {
    let conn = state.db.get()?;
    let (items, total) = queries::list_user_orders(&conn, user_id, page.limit(), page.offset())?;
    Ok(Paginated::new(items, total, page))
}

/// Put a closed order's stock back and close its open payment attempts.
fn release_order(conn: &Connection, order: &Order, payment_status: PaymentStatus) -> Result<()> {
    if order.kind == OrderKind::Purchase && !queries::increase_stock(conn, &order.product_id, order.quantity)? {
        tracing::warn!(
            "Product {} of order {} no longer exists, stock not released",
            order.product_id,
            order.order_number
        );
    }
    let closed = queries::close_pending_payments_for_order(conn, &order.id, payment_status)?;
    if closed > 0 {
        tracing::debug!(
            "Closed {} pending payment(s) of order {} as {}",
            closed,
            order.order_number,
            payment_status.as_ref()
        );
    }
    Ok(())
}

/// Cancel a pending order on behalf of its owner.
pub fn cancel_order(state: &AppState, user_id: i64, id: &str) -> Result<Order> {
    let mut conn = state.db.get()?;
    let tx = begin_immediate(&mut conn)?;

    let order = load_user_order(&tx, user_id, id)?;
    if order.status != OrderStatus::Pending
        || !queries::transition_order(&tx, &order.id, OrderStatus::Pending, OrderStatus::Canceled)?
    {
        return Err(AppError::OrderNotPending);
    }
    release_order(&tx, &order, PaymentStatus::Canceled)?;
    let order = queries::get_order(&tx, &order.id)?.or_not_found(msg::ORDER_NOT_FOUND)?;
    tx.commit()?;

    tracing::info!("Order {} canceled by user {}", order.order_number, user_id);
    Ok(order)
}

/// Cancel the unpaid renewal and upgrade orders of a subscription that is
/// going away, so they can no longer be paid.
pub(crate) fn cancel_subscription_orders(conn: &Connection, subscription_id: &str) -> Result<usize> {
    let mut canceled = 0;
    for order in queries::list_pending_subscription_orders(conn, subscription_id)? {
        if queries::transition_order(conn, &order.id, OrderStatus::Pending, OrderStatus::Canceled)? {
            release_order(conn, &order, PaymentStatus::Canceled)?;
            canceled += 1;
            tracing::debug!(
                "Order {} canceled with subscription {}",
                order.order_number,
                subscription_id
            );
        }
    }
    Ok(canceled)
}

/// Expire every pending order whose deadline has passed. Returns how many
/// orders were expired.
pub fn expire_orders(state: &AppState) -> Result<usize> {
    let mut conn = state.db.get()?;
    expire_orders_at(&mut conn, now())
}

pub fn expire_orders_at(conn: &mut Connection, now: i64) -> Result<usize> {
    let mut expired = 0;
    loop {
        let batch = queries::list_expired_pending_orders(conn, now, SWEEP_BATCH)?;
        let batch_len = batch.len();
        let mut progressed = false;

        for order in batch {
            let tx = begin_immediate(conn)?;
            // CAS: a callback may have paid the order since it was listed.
            if queries::transition_order(&tx, &order.id, OrderStatus::Pending, OrderStatus::Expired)? {
                release_order(&tx, &order, PaymentStatus::Expired)?;
                tx.commit()?;
                expired += 1;
                progressed = true;
                tracing::info!("Order {} expired", order.order_number);
            }
        }

        if (batch_len as i64) < SWEEP_BATCH || !progressed {
            break;
        }
    }
    Ok(expired)
}
