//! Payment records: one row per attempt to collect money for an order.
//!
//! Provider calls happen outside any database transaction; pooled connections
//! are never held across an `.await`.

use serde::Serialize;

use crate::db::{AppState, queries};
use crate::error::{AppError, OptionExt, Result, msg};
use crate::id::is_valid_prefixed_id;
use crate::models::{
    CreatePaymentBody, NewPaymentRecord, Order, OrderStatus, PaymentRecord, PaymentStatus,
    RefundOrder,
};
use crate::payments::{CallbackPayload, CreatePaymentRequest, RefundRequest, RefundStatus};

use super::callbacks::{self, CallbackOutcome};
use super::orders::load_user_order;
use super::subscriptions;
use super::{SWEEP_BATCH, SYSTEM_ACTOR, begin_immediate, call_provider, now};

/// A freshly opened payment attempt plus the client-side token, which is
/// handed to the caller once and never stored.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedPayment {
    #[serde(flatten)]
    pub record: PaymentRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

/// Heuristic 0-100 score from earlier attempts on the same order and the
/// amount band.
pub fn risk_score(prior_attempts: i64, amount: i64) -> i32 {
    let attempts = (prior_attempts.clamp(0, 5) * 10) as i32;
    let band = match amount {
        a if a >= 1_000_000 => 40,
        a if a >= 100_000 => 20,
        a if a >= 10_000 => 10,
        _ => 0,
    };
    (attempts + band).min(100)
}

/// Open a payment attempt for a pending order with the named provider.
///
/// The record is inserted before the provider is called. Every failed attempt
/// bumps `retry_count`; when all attempts fail the record is closed as
/// `failed` and the provider error is returned.
pub async fn create_payment(
    state: &AppState,
    user_id: i64,
    input: &CreatePaymentBody,
) -> Result<CreatedPayment> {
    let gateway = state.gateways.get(&input.provider)?;
    let now = now();

    let (order, record) = {
        let conn = state.db.get()?;
        let order = load_user_order(&conn, user_id, &input.order_id)?;
        if order.status != OrderStatus::Pending {
            return Err(AppError::OrderNotPending);
        }
        if now >= order.expire_time {
            return Err(AppError::OrderExpired);
        }

        let prior = queries::count_payments_for_order(&conn, &order.id)?;
        let record = queries::insert_payment_record(
            &conn,
            &NewPaymentRecord {
                order_id: order.id.clone(),
                user_id,
                provider: gateway.name().to_string(),
                amount: order.total_amount,
                currency: order.currency.clone(),
                risk_score: risk_score(prior, order.total_amount),
                expire_time: order.expire_time,
            },
        )?;
        (order, record)
    };

    let request = CreatePaymentRequest {
        payment_id: record.id.clone(),
        order_number: order.order_number.clone(),
        amount: record.amount,
        currency: record.currency.clone(),
        subject: payment_subject(state, &order),
        scene: input.scene,
        notify_url: state.settings.notify_url(gateway.name()),
        return_url: None,
        expire_time: record.expire_time,
    };

    let label = format!("{} create_payment", gateway.name());
    let result = call_provider(
        &state.settings,
        &label,
        || gateway.create_payment(&request),
        |err| {
            let conn = state.db.get()?;
            let count = queries::increment_payment_retry(&conn, &record.id)?;
            tracing::debug!("Payment {} attempt {} failed: {}", record.id, count, err);
            Ok(())
        },
    )
    .await;

    let conn = state.db.get()?;
    let created = match result {
        Ok(created) => created,
        Err(e) => {
            queries::complete_payment_record(&conn, &record.id, PaymentStatus::Failed, None, None)?;
            tracing::warn!(
                "Payment {} for order {} via {} failed: {}",
                record.id,
                order.order_number,
                gateway.name(),
                e
            );
            return Err(e);
        }
    };

    if !queries::attach_provider_payment(
        &conn,
        &record.id,
        &created.provider_order_id,
        created.transaction_id.as_deref(),
        created.payment_url.as_deref(),
        created.qr_code_url.as_deref(),
        created.expire_time,
    )? {
        tracing::warn!("Payment {} left pending before its provider handle was stored", record.id);
    }

    let record = queries::get_payment_record(&conn, &record.id)?.or_not_found(msg::PAYMENT_NOT_FOUND)?;
    tracing::info!(
        "Payment {} opened for order {} via {} ({} {}, risk {})",
        record.id,
        order.order_number,
        record.provider,
        record.amount,
        record.currency,
        record.risk_score
    );
    Ok(CreatedPayment {
        record,
        client_token: created.client_token,
    })
}

fn payment_subject(state: &AppState, order: &Order) -> String {
    let name = state
        .db
        .get()
        .ok()
        .and_then(|conn| queries::get_product(&conn, &order.product_id).ok().flatten())
        .map(|p| p.name);
    match name {
        Some(name) => format!("{} x{}", name, order.quantity),
        None => format!("Order {}", order.order_number),
    }
}

fn load_user_payment(state: &AppState, user_id: i64, id: &str) -> Result<PaymentRecord> {
    if !is_valid_prefixed_id(id) {
        return Err(AppError::NotFound(msg::PAYMENT_NOT_FOUND));
    }
    let conn = state.db.get()?;
    queries::get_payment_record(&conn, id)?
        .filter(|p| p.user_id == user_id)
        .or_not_found(msg::PAYMENT_NOT_FOUND)
}

pub fn get_payment(state: &AppState, user_id: i64, id: &str) -> Result<PaymentRecord> {
    load_user_payment(state, user_id, id)
}

pub fn list_order_payments(state: &AppState, user_id: i64, order_id: &str) -> Result<Vec<PaymentRecord>> {
    let conn = state.db.get()?;
    let order = load_user_order(&conn, user_id, order_id)?;
    queries::list_payments_for_order(&conn, &order.id)
}

/// Current status of a payment, asking the provider when the record is still
/// pending. A terminal provider answer is applied exactly like a callback.
/// The query runs under the provider timeout and retry budget; failures fall
/// back to the stored record.
pub async fn query_payment_status(state: &AppState, user_id: i64, id: &str) -> Result<PaymentRecord> {
    let record = load_user_payment(state, user_id, id)?;
    if record.status.is_terminal() {
        return Ok(record);
    }
    let Some(provider_order_id) = record.provider_order_id.clone() else {
        return Ok(record);
    };

    let gateway = state.gateways.get(&record.provider)?;
    let label = format!("{} query_payment", gateway.name());
    let answer = call_provider(
        &state.settings,
        &label,
        || gateway.query_payment(&provider_order_id),
        |_| Ok(()),
    )
    .await;
    match answer {
        Ok(answer) if answer.status.is_terminal() => {
            let payload = CallbackPayload {
                provider_order_id,
                status: answer.status,
                amount: answer.amount,
                payment_time: answer.payment_time,
                transaction_id: answer.transaction_id,
            };
            callbacks::apply_payload(state, gateway.name(), &payload).await?;
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!("Status query for payment {} via {} failed: {}", record.id, record.provider, e);
        }
    }

    load_user_payment(state, user_id, id)
}

/// Refund a paid order through the provider that collected it, then mark the
/// order refunded and cancel the subscription it paid for.
pub async fn refund_payment(
    state: &AppState,
    user_id: i64,
    order_id: &str,
    input: &RefundOrder,
) -> Result<Order> {
    let (order, payment) = {
        let conn = state.db.get()?;
        let order = load_user_order(&conn, user_id, order_id)?;
        if order.status != OrderStatus::Paid {
            return Err(AppError::OrderNotPaid);
        }
        let payment = queries::find_success_payment(&conn, &order.id)?.ok_or_else(|| {
            tracing::error!("Paid order {} has no successful payment record", order.order_number);
            AppError::Invariant(format!("order {} has no successful payment", order.order_number))
        })?;
        (order, payment)
    };

    let amount = input.amount.unwrap_or(order.total_amount);
    if amount < 1 || amount > order.total_amount {
        return Err(AppError::BadRequest(msg::INVALID_AMOUNT.into()));
    }
    let provider_order_id = payment.provider_order_id.clone().ok_or_else(|| {
        AppError::Invariant(format!("payment {} has no provider order id", payment.id))
    })?;

    let gateway = state.gateways.get(&payment.provider)?;
    let request = RefundRequest {
        provider_order_id,
        transaction_id: payment.transaction_id.clone(),
        refund_no: format!("R{}", order.order_number),
        amount,
        total_amount: payment.amount,
        currency: payment.currency.clone(),
        reason: input.reason.clone(),
    };
    let label = format!("{} refund", gateway.name());
    let refund = call_provider(&state.settings, &label, || gateway.refund(&request), |_| Ok(())).await?;
    if refund.status == RefundStatus::Failed {
        return Err(AppError::ProviderRejected(format!(
            "{} refused refund {}",
            gateway.name(),
            refund.refund_id
        )));
    }

    let now = now();
    let mut conn = state.db.get()?;
    let tx = begin_immediate(&mut conn)?;
    if !queries::mark_order_refunded(&tx, &order.id, amount, input.reason.as_deref(), now)? {
        return Err(AppError::OrderNotPaid);
    }
    queries::set_payment_refund(&tx, &payment.id, &refund.refund_id)?;

    if let Some(sub) = queries::get_subscription_by_order(&tx, &order.id)? {
        if sub.status.is_live() {
            subscriptions::cancel_tx(&tx, &sub, Some("refunded"), SYSTEM_ACTOR, now)?;
        }
    }

    let order = queries::get_order(&tx, &order.id)?.or_not_found(msg::ORDER_NOT_FOUND)?;
    tx.commit()?;

    tracing::info!(
        "Order {} refunded {} {} via {} (refund {})",
        order.order_number,
        amount,
        order.currency,
        payment.provider,
        refund.refund_id
    );
    Ok(order)
}

/// What one reconcile pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub applied: usize,
    pub expired: usize,
    pub skipped: usize,
}

/// Re-check pending payment records older than the grace period against
/// their provider, recovering from lost callbacks.
pub async fn reconcile_payments(state: &AppState) -> Result<ReconcileSummary> {
    reconcile_payments_at(state, now()).await
}

pub async fn reconcile_payments_at(state: &AppState, now: i64) -> Result<ReconcileSummary> {
    let stale = {
        let conn = state.db.get()?;
        queries::list_stale_pending_payments(&conn, now - state.settings.reconcile_grace_secs, SWEEP_BATCH)?
    };

    let mut summary = ReconcileSummary::default();
    for record in stale {
        summary.checked += 1;
        let past_expiry = now >= record.expire_time;

        let Some(provider_order_id) = record.provider_order_id.clone() else {
            if past_expiry {
                let conn = state.db.get()?;
                if queries::complete_payment_record(&conn, &record.id, PaymentStatus::Expired, None, None)? {
                    summary.expired += 1;
                }
            } else {
                summary.skipped += 1;
            }
            continue;
        };

        let gateway = match state.gateways.get(&record.provider) {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!("Cannot reconcile payment {}: {}", record.id, e);
                summary.skipped += 1;
                continue;
            }
        };

        let expire = CallbackPayload {
            provider_order_id: provider_order_id.clone(),
            status: PaymentStatus::Expired,
            amount: record.amount,
            payment_time: None,
            transaction_id: None,
        };

        let label = format!("{} query_payment", gateway.name());
        let answer = call_provider(
            &state.settings,
            &label,
            || gateway.query_payment(&provider_order_id),
            |_| Ok(()),
        )
        .await;
        let payload = match answer {
            Ok(answer) if answer.status.is_terminal() => CallbackPayload {
                provider_order_id,
                status: answer.status,
                amount: answer.amount,
                payment_time: answer.payment_time,
                transaction_id: answer.transaction_id,
            },
            Ok(_) if past_expiry => expire,
            Ok(_) => {
                summary.skipped += 1;
                continue;
            }
            Err(AppError::Unsupported { .. }) if past_expiry => expire,
            Err(e) => {
                tracing::warn!("Reconcile query for payment {} via {} failed: {}", record.id, record.provider, e);
                summary.skipped += 1;
                continue;
            }
        };

        match callbacks::apply_payload(state, gateway.name(), &payload).await {
            Ok(CallbackOutcome::Applied) if payload.status == PaymentStatus::Expired => summary.expired += 1,
            Ok(CallbackOutcome::Applied) => summary.applied += 1,
            Ok(_) => summary.skipped += 1,
            Err(e) => {
                tracing::warn!("Reconcile of payment {} failed: {}", record.id, e);
                summary.skipped += 1;
            }
        }
    }

    if summary.checked > 0 {
        tracing::info!(
            "Reconciled {} pending payment(s): {} applied, {} expired, {} skipped",
            summary.checked,
            summary.applied,
            summary.expired,
            summary.skipped
        );
    }
    Ok(summary)
}
