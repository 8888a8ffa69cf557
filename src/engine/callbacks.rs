//! Provider callback processing.
//!
//! A callback is verified, normalized by its gateway and applied under a
//! per-payment lock inside one IMMEDIATE transaction. Replays and concurrent
//! duplicates of the same notification converge on a single state change.

use rusqlite::Connection;
use serde::Serialize;

use crate::db::{AppState, queries};
use crate::error::{AppError, OptionExt, Result, msg};
use crate::models::{OrderKind, OrderStatus, PaymentStatus};
use crate::payments::CallbackPayload;

use super::{begin_immediate, now, subscriptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    /// The notification changed state
    Applied,
    /// The record already carries this status
    AlreadyProcessed,
    /// Nothing to do (still pending, or a non-success after a terminal status)
    Ignored,
}

/// Verify and apply one provider notification.
///
/// Signature failures never touch the database.
pub async fn process_payment_callback(
    state: &AppState,
    provider: &str,
    body: &[u8],
    signature: Option<&str>,
) -> Result<CallbackOutcome> {
    let gateway = state.gateways.get(provider)?;

    let Some(signature) = signature else {
        tracing::warn!("{} callback rejected: no signature", provider);
        return Err(AppError::InvalidSignature);
    };
    match gateway.verify_callback(body, signature) {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!("{} callback rejected: signature mismatch", provider);
            return Err(AppError::InvalidSignature);
        }
        Err(e) => {
            tracing::warn!("{} callback rejected: {}", provider, e);
            return Err(AppError::InvalidSignature);
        }
    }

    let payload = gateway.handle_callback(body)?;
    apply_payload(state, gateway.name(), &payload).await
}

/// Apply a normalized payload, serialized per `provider:provider_order_id`.
pub(crate) async fn apply_payload(
    state: &AppState,
    provider: &str,
    payload: &CallbackPayload,
) -> Result<CallbackOutcome> {
    let key = format!("{}:{}", provider, payload.provider_order_id);
    let _guard = state.callback_locks.lock(&key).await;

    let mut conn = state.db.get()?;
    let outcome = apply_callback(&mut conn, provider, payload, now())?;
    tracing::debug!("{} callback for {}: {:?}", provider, payload.provider_order_id, outcome);
    Ok(outcome)
}

/// The state change for one notification, in one transaction.
///
/// A success marks the record and its order paid, then applies what the order
/// bought (a new or extended subscription, a renewal period or an upgraded
/// plan) and closes the order's other pending attempts. A success reported
/// for an attempt that is already closed is refused as an invariant
/// violation. Failures and expiries only close the record; the order stays
/// payable until it expires.
pub fn apply_callback(
    conn: &mut Connection,
    provider: &str,
    payload: &CallbackPayload,
    now: i64,
) -> Result<CallbackOutcome> {
    let tx = begin_immediate(conn)?;

    let record = queries::get_payment_by_provider_order(&tx, provider, &payload.provider_order_id)?
        .or_not_found(msg::PAYMENT_NOT_FOUND)?;

    if record.status.is_terminal() {
        if record.status == payload.status {
            return Ok(CallbackOutcome::AlreadyProcessed);
        }
        if payload.status == PaymentStatus::Success {
            // Money was collected for an attempt that is already closed.
            tracing::error!(
                "Payment {} is {} but {} reported success for it",
                record.id,
                record.status.as_ref(),
                provider
            );
            return Err(AppError::Invariant(format!(
                "payment {} is {}, cannot accept success",
                record.id,
                record.status.as_ref()
            )));
        }
        tracing::warn!(
            "Payment {} is {} but {} reported {}, ignoring",
            record.id,
            record.status.as_ref(),
            provider,
            payload.status.as_ref()
        );
        return Ok(CallbackOutcome::Ignored);
    }
    if payload.status == PaymentStatus::Pending {
        return Ok(CallbackOutcome::Ignored);
    }

    if payload.status != PaymentStatus::Success {
        if !queries::complete_payment_record(
            &tx,
            &record.id,
            payload.status,
            None,
            payload.transaction_id.as_deref(),
        )? {
            return Ok(CallbackOutcome::AlreadyProcessed);
        }
        tx.commit()?;
        tracing::info!("Payment {} closed as {}", record.id, payload.status.as_ref());
        return Ok(CallbackOutcome::Applied);
    }

    if payload.amount != record.amount {
        tracing::error!(
            "Payment {} amount mismatch: expected {}, {} reported {}",
            record.id,
            record.amount,
            provider,
            payload.amount
        );
        return Err(AppError::Invariant(format!(
            "payment {} amount mismatch",
            record.id
        )));
    }

    let order = queries::get_order(&tx, &record.order_id)?.or_not_found(msg::ORDER_NOT_FOUND)?;
    if order.status != OrderStatus::Pending {
        tracing::error!(
            "Payment {} succeeded but order {} is {}",
            record.id,
            order.order_number,
            order.status.as_ref()
        );
        return Err(AppError::Invariant(format!(
            "order {} is {}, cannot accept payment",
            order.order_number,
            order.status.as_ref()
        )));
    }

    let paid_at = payload.payment_time.unwrap_or(now);
    if !queries::complete_payment_record(
        &tx,
        &record.id,
        PaymentStatus::Success,
        Some(paid_at),
        payload.transaction_id.as_deref(),
    )? {
        return Ok(CallbackOutcome::AlreadyProcessed);
    }
    if !queries::mark_order_paid(&tx, &order.id, paid_at)? {
        return Err(AppError::ConcurrentModification("order"));
    }

    match order.kind {
        OrderKind::Purchase => {
            let product =
                queries::get_product(&tx, &order.product_id)?.or_not_found(msg::PRODUCT_NOT_FOUND)?;
            if product.is_subscription() {
                subscriptions::create_or_extend(&tx, &order, &product, now)?;
            }
        }
        OrderKind::Renewal => {
            subscriptions::apply_paid_renewal(&tx, &order, now)?;
        }
        OrderKind::Upgrade => {
            subscriptions::apply_paid_upgrade(&tx, &order, now)?;
        }
    }

    let closed = queries::close_pending_payments_for_order(&tx, &order.id, PaymentStatus::Canceled)?;
    tx.commit()?;

    tracing::info!(
        "Order {} paid via {} (payment {}, {} sibling attempt(s) closed)",
        order.order_number,
        provider,
        record.id,
        closed
    );
    Ok(CallbackOutcome::Applied)
}
