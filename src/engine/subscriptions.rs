//! Subscription state machine and quota metering.
//!
//! ```text
//!            pause            cancel
//!   active ─────────▶ paused ────────▶ canceled
//!     ▲  ◀─────────            ▲
//!     │     resume             │ cancel
//!     └──────────────────────── ┘
//!   active ──(end_time passed)──▶ expired
//! ```
//!
//! Renewal and upgrade only raise an order; the period or plan changes when
//! the callback for that order settles it. Plan-field replacements are
//! guarded by the row's `version`; quota consumption is a single conditional
//! UPDATE.

use rusqlite::Connection;
use serde::Serialize;

use crate::config::EngineSettings;
use crate::db::{AppState, queries};
use crate::error::{AppError, OptionExt, Result, msg};
use crate::id::{EntityType, is_valid_prefixed_id};
use crate::models::{
    ActivityType, CancelSubscription, ChangePlan, FreeTier, Order, OrderKind, PERPETUAL_END_TIME,
    Permission, PermissionCheck, Product, RenewSubscription, SECONDS_PER_DAY, Subscription,
    SubscriptionPeriod, SubscriptionStatus, UserLimits,
};

use super::activity;
use super::orders::{cancel_subscription_orders, new_order};
use super::{SWEEP_BATCH, SYSTEM_ACTOR, begin_immediate, now};

/// Payment method recorded on engine-raised orders when none is known.
const DEFAULT_RENEWAL_METHOD: &str = "auto";

/// Result of a renew/upgrade/downgrade: the updated subscription and the
/// order raised for it, if any.
#[derive(Debug, Clone, Serialize)]
pub struct PlanChange {
    pub subscription: Subscription,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
}

fn format_date(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Billing window for a new subscription to `plan` starting at `now`.
///
/// With a trial, the paid period starts when the trial ends. A plan duration
/// of 0 means perpetual.
pub fn compute_period(plan: &Product, trial_eligible: bool, now: i64) -> SubscriptionPeriod {
    let (trial_start_time, trial_end_time, start_time) =
        if trial_eligible && plan.free_trial_days > 0 {
            let trial_end = now + i64::from(plan.free_trial_days) * SECONDS_PER_DAY;
            (Some(now), Some(trial_end), trial_end)
        } else {
            (None, None, now)
        };

    let end_time = if plan.duration_secs == 0 {
        PERPETUAL_END_TIME
    } else {
        start_time + plan.duration_secs
    };

    SubscriptionPeriod {
        trial_start_time,
        trial_end_time,
        start_time,
        end_time,
    }
}

fn load_user_subscription(conn: &Connection, user_id: i64, id: &str) -> Result<Subscription> {
    if !is_valid_prefixed_id(id) {
        return Err(AppError::NotFound(msg::SUBSCRIPTION_NOT_FOUND));
    }
    queries::get_subscription(conn, id)?
        .filter(|s| s.user_id == user_id)
        .or_not_found(msg::SUBSCRIPTION_NOT_FOUND)
}

fn reload(conn: &Connection, id: &str) -> Result<Subscription> {
    queries::get_subscription(conn, id)?.or_not_found(msg::SUBSCRIPTION_NOT_FOUND)
}

/// The plan a subscription currently points at. A dangling plan id is a
/// broken invariant, not a user error.
fn current_plan(conn: &Connection, sub: &Subscription) -> Result<Product> {
    queries::get_product(conn, &sub.plan_id)?.ok_or_else(|| {
        tracing::error!("Subscription {} references missing plan {}", sub.id, sub.plan_id);
        AppError::Invariant(format!("subscription {} has no plan", sub.id))
    })
}

/// A plan the user may switch to.
fn target_plan(conn: &Connection, plan_id: &str) -> Result<Product> {
    let plan = queries::get_product(conn, plan_id)?.or_not_found(msg::PRODUCT_NOT_FOUND)?;
    if !plan.is_subscription() {
        return Err(AppError::BadRequest(msg::NOT_A_PLAN.into()));
    }
    if !plan.is_active() {
        return Err(AppError::NotEligible(msg::PRODUCT_UNAVAILABLE.into()));
    }
    Ok(plan)
}

/// Live and not past its end.
fn ensure_changeable(sub: &Subscription, now: i64) -> Result<()> {
    match sub.status {
        SubscriptionStatus::Canceled => Err(AppError::NotEligible("subscription is canceled".into())),
        SubscriptionStatus::Expired => Err(AppError::SubscriptionExpired),
        _ if sub.end_time <= now => Err(AppError::SubscriptionExpired),
        _ => Ok(()),
    }
}

/// Payment method of the order that last paid for `sub`.
fn last_payment_method(conn: &Connection, sub: &Subscription) -> String {
    match queries::get_order(conn, &sub.order_id) {
        Ok(Some(order)) => order.payment_method,
        _ => DEFAULT_RENEWAL_METHOD.to_string(),
    }
}

// ============ Creation (callback path) ============

/// Apply a paid purchase of `plan` to the buyer's subscriptions.
///
/// Runs inside the callback transaction. Buying the plan the user already
/// holds extends it; buying a different plan supersedes the live one.
pub(crate) fn create_or_extend(
    conn: &Connection,
    order: &Order,
    plan: &Product,
    now: i64,
) -> Result<Subscription> {
    match queries::get_live_subscription(conn, order.user_id)? {
        Some(live) if live.plan_id == plan.id => extend_for_order(conn, &live, order, plan, now),
        Some(live) => {
            if !queries::cancel_subscription_row(conn, &live.id, Some("superseded"), SYSTEM_ACTOR, now)? {
                return Err(AppError::ConcurrentModification("subscription"));
            }
            cancel_subscription_orders(conn, &live.id)?;
            activity::record(
                conn,
                activity::for_subscription(
                    &live,
                    ActivityType::SubscriptionCanceled,
                    "Subscription replaced",
                    Some(format!("Superseded by a purchase of {}", plan.name)),
                ),
            );
            tracing::info!("Subscription {} superseded by order {}", live.id, order.order_number);
            insert_for_order(conn, order, plan, now)
        }
        None => insert_for_order(conn, order, plan, now),
    }
}

fn insert_for_order(conn: &Connection, order: &Order, plan: &Product, now: i64) -> Result<Subscription> {
    let trial_eligible = !queries::user_has_subscribed(conn, order.user_id)?;
    let period = compute_period(plan, trial_eligible, now);

    let sub = Subscription {
        id: EntityType::Subscription.gen_id(),
        user_id: order.user_id,
        plan_id: plan.id.clone(),
        order_id: order.id.clone(),
        status: SubscriptionStatus::Active,
        start_time: period.start_time,
        end_time: period.end_time,
        trial_start_time: period.trial_start_time,
        trial_end_time: period.trial_end_time,
        auto_renew: plan.duration_secs > 0,
        quota_used: 0,
        quota_limit: plan.quota,
        max_roles: plan.max_roles,
        max_contexts: plan.max_contexts,
        available_models: plan.available_models.clone(),
        amount: order.total_amount,
        currency: order.currency.clone(),
        cancel_reason: None,
        canceled_by: None,
        canceled_at: None,
        version: 1,
        created_at: now,
        updated_at: now,
    };
    queries::insert_subscription(conn, &sub)?;

    let description = match sub.trial_end_time {
        Some(trial_end) => format!("Free trial until {}", format_date(trial_end)),
        None if sub.is_perpetual() => "Lifetime access".to_string(),
        None => format!("Active until {}", format_date(sub.end_time)),
    };
    let mut created = activity::for_subscription(
        &sub,
        ActivityType::SubscriptionCreated,
        format!("Subscribed to {}", plan.name),
        Some(description),
    );
    created.amount = Some(order.total_amount);
    activity::record(conn, created);

    tracing::info!(
        "Subscription {} created for user {} on plan {} (ends {})",
        sub.id,
        sub.user_id,
        plan.id,
        sub.end_time
    );
    Ok(sub)
}

fn extend_for_order(
    conn: &Connection,
    live: &Subscription,
    order: &Order,
    plan: &Product,
    now: i64,
) -> Result<Subscription> {
    let end_time = if plan.duration_secs == 0 {
        PERPETUAL_END_TIME
    } else {
        live.end_time.max(now) + plan.duration_secs
    };
    let update = queries::PeriodUpdate {
        order_id: &order.id,
        start_time: live.start_time,
        end_time,
        clear_trial: false,
        reset_quota: true,
        amount: order.total_amount,
        status: live.status,
    };
    if !queries::update_subscription_period(conn, &live.id, live.version, &update)? {
        return Err(AppError::ConcurrentModification("subscription"));
    }

    let sub = reload(conn, &live.id)?;
    let mut renewed = activity::for_subscription(
        &sub,
        ActivityType::SubscriptionRenewed,
        format!("{} extended", plan.name),
        Some(format!("Active until {}", format_date(sub.end_time))),
    );
    renewed.amount = Some(order.total_amount);
    activity::record(conn, renewed);

    tracing::info!("Subscription {} extended by order {}", sub.id, order.order_number);
    Ok(sub)
}

// ============ Reads ============

pub fn get_subscription(state: &AppState, user_id: i64, id: &str) -> Result<Subscription> {
    let conn = state.db.get()?;
    load_user_subscription(&conn, user_id, id)
}

pub fn list_user_subscriptions(state: &AppState, user_id: i64) -> Result<Vec<Subscription>> {
    let conn = state.db.get()?;
    queries::list_user_subscriptions(&conn, user_id)
}

pub fn get_active_subscription(state: &AppState, user_id: i64) -> Result<Option<Subscription>> {
    let conn = state.db.get()?;
    queries::get_active_subscription(&conn, user_id, now())
}

pub fn user_limits(state: &AppState, user_id: i64) -> Result<UserLimits> {
    let conn = state.db.get()?;
    user_limits_at(&conn, user_id, now())
}

/// The active subscription's limits, or the free tier's.
pub fn user_limits_at(conn: &Connection, user_id: i64, now: i64) -> Result<UserLimits> {
    Ok(match queries::get_active_subscription(conn, user_id, now)? {
        Some(sub) => UserLimits::from(&sub),
        None => FreeTier::limits(),
    })
}

pub fn check_permission(state: &AppState, user_id: i64, permission: &Permission) -> Result<PermissionCheck> {
    let conn = state.db.get()?;
    check_permission_at(&conn, user_id, permission, now())
}

/// Pure read over the user's current limits. Users without an active
/// subscription are judged against the free tier.
pub fn check_permission_at(
    conn: &Connection,
    user_id: i64,
    permission: &Permission,
    now: i64,
) -> Result<PermissionCheck> {
    let limits = user_limits_at(conn, user_id, now)?;

    let denial = match permission {
        Permission::CreateRole { current } if *current >= limits.max_roles => {
            Some(format!("role limit of {} reached", limits.max_roles))
        }
        Permission::CreateContext { current } if *current >= limits.max_contexts => {
            Some(format!("context limit of {} reached", limits.max_contexts))
        }
        Permission::UseModel { model } if !limits.available_models.iter().any(|m| m == model) => {
            Some(format!("model {} is not included in the current plan", model))
        }
        Permission::ConsumeQuota { amount } if *amount > limits.quota_limit - limits.quota_used => {
            Some(format!(
                "requested {} but only {} quota remains",
                amount,
                limits.quota_limit - limits.quota_used
            ))
        }
        _ => None,
    };

    Ok(PermissionCheck {
        allowed: denial.is_none(),
        reason: denial,
        limits,
    })
}

// ============ Renew / upgrade / downgrade ============

pub fn renew_subscription(
    state: &AppState,
    user_id: i64,
    id: &str,
    input: &RenewSubscription,
) -> Result<PlanChange> {
    let mut conn = state.db.get()?;
    renew_subscription_at(&mut conn, &state.settings, user_id, id, input, now())
}

pub fn renew_subscription_at(
    conn: &mut Connection,
    settings: &EngineSettings,
    user_id: i64,
    id: &str,
    input: &RenewSubscription,
    now: i64,
) -> Result<PlanChange> {
    let tx = begin_immediate(conn)?;
    let sub = load_user_subscription(&tx, user_id, id)?;
    let method = input
        .payment_method
        .clone()
        .unwrap_or_else(|| last_payment_method(&tx, &sub));
    let (order, _) = raise_renewal_order(&tx, settings, &sub, &method, now)?;
    tx.commit()?;
    Ok(PlanChange {
        subscription: sub,
        order: Some(order),
    })
}

/// Raise the order that pays for the next period of a still-active
/// subscription. The period only moves once that order is paid.
///
/// An unpaid renewal order already open for `sub` is handed back instead of
/// raising a second one; the flag is true when a new order was inserted.
fn raise_renewal_order(
    conn: &Connection,
    settings: &EngineSettings,
    sub: &Subscription,
    payment_method: &str,
    now: i64,
) -> Result<(Order, bool)> {
    match sub.status {
        SubscriptionStatus::Expired => return Err(AppError::SubscriptionExpired),
        SubscriptionStatus::Canceled => {
            return Err(AppError::NotEligible("subscription is canceled".into()));
        }
        SubscriptionStatus::Paused => {
            return Err(AppError::NotEligible("subscription is paused".into()));
        }
        SubscriptionStatus::Active => {}
    }
    if sub.end_time <= now {
        return Err(AppError::SubscriptionExpired);
    }
    if !sub.auto_renew {
        return Err(AppError::NotEligible("auto-renew is disabled".into()));
    }

    let plan = current_plan(conn, sub)?;
    if plan.duration_secs == 0 || sub.is_perpetual() {
        return Err(AppError::NotEligible("perpetual subscriptions do not renew".into()));
    }

    if let Some(open) = queries::find_open_subscription_order(conn, &sub.id, OrderKind::Renewal, now)? {
        tracing::debug!(
            "Subscription {} already has renewal order {} awaiting payment",
            sub.id,
            open.order_number
        );
        return Ok((open, false));
    }

    let order = new_order(
        settings,
        sub.user_id,
        &plan,
        None,
        1,
        plan.price,
        OrderKind::Renewal,
        Some(sub.id.clone()),
        payment_method,
        now,
    )?;
    queries::insert_order(conn, &order)?;

    tracing::info!(
        "Renewal order {} raised for subscription {} (ends {})",
        order.order_number,
        sub.id,
        sub.end_time
    );
    Ok((order, true))
}

pub fn upgrade_subscription(
    state: &AppState,
    user_id: i64,
    id: &str,
    input: &ChangePlan,
) -> Result<PlanChange> {
    let mut conn = state.db.get()?;
    upgrade_subscription_at(&mut conn, &state.settings, user_id, id, input, now())
}

/// Raise an order for a strictly higher-level plan. The subscription keeps
/// its current plan until the order is paid.
pub fn upgrade_subscription_at(
    conn: &mut Connection,
    settings: &EngineSettings,
    user_id: i64,
    id: &str,
    input: &ChangePlan,
    now: i64,
) -> Result<PlanChange> {
    let tx = begin_immediate(conn)?;
    let sub = load_user_subscription(&tx, user_id, id)?;
    ensure_changeable(&sub, now)?;

    let current = current_plan(&tx, &sub)?;
    let target = target_plan(&tx, &input.plan_id)?;
    if target.level <= current.level {
        return Err(AppError::InvalidPlanChange(format!(
            "plan level {} is not above current level {}",
            target.level, current.level
        )));
    }

    let method = input
        .payment_method
        .clone()
        .unwrap_or_else(|| last_payment_method(&tx, &sub));
    let order = new_order(
        settings,
        sub.user_id,
        &target,
        None,
        1,
        target.price,
        OrderKind::Upgrade,
        Some(sub.id.clone()),
        &method,
        now,
    )?;
    queries::insert_order(&tx, &order)?;
    tx.commit()?;

    tracing::info!(
        "Upgrade order {} raised for subscription {}: {} (level {}) to {} (level {})",
        order.order_number,
        sub.id,
        current.id,
        current.level,
        target.id,
        target.level
    );
    Ok(PlanChange {
        subscription: sub,
        order: Some(order),
    })
}

// ============ Paid renewal / upgrade (callback path) ============

/// The subscription a renewal or upgrade order was raised for.
fn ordered_subscription(conn: &Connection, order: &Order) -> Result<Subscription> {
    let found = match &order.subscription_id {
        Some(id) => queries::get_subscription(conn, id)?,
        None => None,
    };
    found.ok_or_else(|| {
        tracing::error!("Order {} is paid but names no subscription", order.order_number);
        AppError::Invariant(format!("order {} has no subscription", order.order_number))
    })
}

fn refuse_paid_order(sub: &Subscription, order: &Order, why: &str) -> AppError {
    tracing::error!(
        "Order {} was paid but cannot be applied to subscription {} ({})",
        order.order_number,
        sub.id,
        why
    );
    AppError::Invariant(format!(
        "order {} cannot be applied to subscription {}: {}",
        order.order_number, sub.id, why
    ))
}

/// Apply a paid renewal order inside the callback transaction: the period
/// restarts at `now` and ends one plan duration after the later of the old
/// end and `now`. Used quota and the trial are cleared. A subscription that
/// expired while the order was open comes back to life, unless the user
/// already holds another live subscription.
pub(crate) fn apply_paid_renewal(conn: &Connection, order: &Order, now: i64) -> Result<Subscription> {
    let sub = ordered_subscription(conn, order)?;
    let status = match sub.status {
        SubscriptionStatus::Canceled => return Err(refuse_paid_order(&sub, order, "canceled")),
        SubscriptionStatus::Expired => {
            if queries::get_live_subscription(conn, sub.user_id)?.is_some() {
                return Err(refuse_paid_order(&sub, order, "expired and superseded"));
            }
            SubscriptionStatus::Active
        }
        live => live,
    };
    let plan = queries::get_product(conn, &order.product_id)?.or_not_found(msg::PRODUCT_NOT_FOUND)?;

    let update = queries::PeriodUpdate {
        order_id: &order.id,
        start_time: now,
        end_time: sub.end_time.max(now) + plan.duration_secs,
        clear_trial: true,
        reset_quota: true,
        amount: order.total_amount,
        status,
    };
    if !queries::update_subscription_period(conn, &sub.id, sub.version, &update)? {
        return Err(AppError::ConcurrentModification("subscription"));
    }

    let renewed = reload(conn, &sub.id)?;
    let mut entry = activity::for_subscription(
        &renewed,
        ActivityType::SubscriptionRenewed,
        format!("{} renewed", plan.name),
        Some(format!("Active until {}", format_date(renewed.end_time))),
    );
    entry.amount = Some(order.total_amount);
    activity::record(conn, entry);

    tracing::info!(
        "Subscription {} renewed until {} (order {})",
        renewed.id,
        renewed.end_time,
        order.order_number
    );
    Ok(renewed)
}

/// Apply a paid upgrade order inside the callback transaction: copy the
/// ordered plan's limits, reset used quota and reactivate a paused
/// subscription. The end time is kept.
pub(crate) fn apply_paid_upgrade(conn: &Connection, order: &Order, now: i64) -> Result<Subscription> {
    let sub = ordered_subscription(conn, order)?;
    if !sub.status.is_live() || sub.end_time <= now {
        return Err(refuse_paid_order(&sub, order, sub.status.as_ref()));
    }
    let current = current_plan(conn, &sub)?;
    let target = queries::get_product(conn, &order.product_id)?.or_not_found(msg::PRODUCT_NOT_FOUND)?;
    if target.level <= current.level {
        return Err(refuse_paid_order(&sub, order, "already on an equal or higher plan"));
    }

    let update = queries::PlanUpdate {
        plan_id: &target.id,
        order_id: Some(&order.id),
        quota_limit: target.quota,
        quota_used: 0,
        max_roles: target.max_roles,
        max_contexts: target.max_contexts,
        available_models: &target.available_models,
        amount: order.total_amount,
        status: SubscriptionStatus::Active,
    };
    if !queries::replace_subscription_plan(conn, &sub.id, sub.version, &update)? {
        return Err(AppError::ConcurrentModification("subscription"));
    }

    let upgraded = reload(conn, &sub.id)?;
    let mut entry = activity::for_subscription(
        &upgraded,
        ActivityType::SubscriptionUpgraded,
        format!("Upgraded to {}", target.name),
        Some(format!("From {} to {}", current.name, target.name)),
    );
    entry.amount = Some(order.total_amount);
    activity::record(conn, entry);

    tracing::info!(
        "Subscription {} upgraded from {} (level {}) to {} (level {})",
        sub.id,
        current.id,
        current.level,
        target.id,
        target.level
    );
    Ok(upgraded)
}

pub fn downgrade_subscription(
    state: &AppState,
    user_id: i64,
    id: &str,
    input: &ChangePlan,
) -> Result<PlanChange> {
    let mut conn = state.db.get()?;
    downgrade_subscription_at(&mut conn, user_id, id, input, now())
}

/// Move to a strictly lower-level plan. No order is raised and no refund is
/// computed. Used quota is clamped to the new limit.
pub fn downgrade_subscription_at(
    conn: &mut Connection,
    user_id: i64,
    id: &str,
    input: &ChangePlan,
    now: i64,
) -> Result<PlanChange> {
    let tx = begin_immediate(conn)?;
    let sub = load_user_subscription(&tx, user_id, id)?;
    ensure_changeable(&sub, now)?;

    let current = current_plan(&tx, &sub)?;
    let target = target_plan(&tx, &input.plan_id)?;
    if target.level >= current.level {
        return Err(AppError::InvalidPlanChange(format!(
            "plan level {} is not below current level {}",
            target.level, current.level
        )));
    }

    let update = queries::PlanUpdate {
        plan_id: &target.id,
        order_id: None,
        quota_limit: target.quota,
        quota_used: sub.quota_used.min(target.quota),
        max_roles: target.max_roles,
        max_contexts: target.max_contexts,
        available_models: &target.available_models,
        amount: target.price,
        status: sub.status,
    };
    if !queries::replace_subscription_plan(&tx, &sub.id, sub.version, &update)? {
        return Err(AppError::ConcurrentModification("subscription"));
    }

    let downgraded = reload(&tx, &sub.id)?;
    activity::record(
        &tx,
        activity::for_subscription(
            &downgraded,
            ActivityType::SubscriptionDowngraded,
            format!("Downgraded to {}", target.name),
            Some(format!("From {} to {}", current.name, target.name)),
        ),
    );
    tx.commit()?;

    tracing::info!(
        "Subscription {} downgraded from {} (level {}) to {} (level {})",
        sub.id,
        current.id,
        current.level,
        target.id,
        target.level
    );
    Ok(PlanChange {
        subscription: downgraded,
        order: None,
    })
}

// ============ Cancel / pause / resume ============

pub fn cancel_subscription(
    state: &AppState,
    user_id: i64,
    id: &str,
    input: &CancelSubscription,
) -> Result<Subscription> {
    let mut conn = state.db.get()?;
    let actor = format!("user:{}", user_id);
    cancel_subscription_at(&mut conn, user_id, id, input.reason.as_deref(), &actor, now())
}

/// Cancel a live subscription. Canceling an already-canceled subscription
/// returns it unchanged.
pub fn cancel_subscription_at(
    conn: &mut Connection,
    user_id: i64,
    id: &str,
    reason: Option<&str>,
    canceled_by: &str,
    now: i64,
) -> Result<Subscription> {
    let tx = begin_immediate(conn)?;
    let sub = load_user_subscription(&tx, user_id, id)?;
    match sub.status {
        SubscriptionStatus::Canceled => {
            tracing::debug!("Subscription {} already canceled", sub.id);
            return Ok(sub);
        }
        SubscriptionStatus::Expired => return Err(AppError::SubscriptionExpired),
        SubscriptionStatus::Active | SubscriptionStatus::Paused => {}
    }

    let canceled = cancel_tx(&tx, &sub, reason, canceled_by, now)?;
    tx.commit()?;
    Ok(canceled)
}

/// Cancel inside an open transaction and log the activity.
pub(crate) fn cancel_tx(
    conn: &Connection,
    sub: &Subscription,
    reason: Option<&str>,
    canceled_by: &str,
    now: i64,
) -> Result<Subscription> {
    if !queries::cancel_subscription_row(conn, &sub.id, reason, canceled_by, now)? {
        return Err(AppError::ConcurrentModification("subscription"));
    }
    let closed = cancel_subscription_orders(conn, &sub.id)?;
    let canceled = reload(conn, &sub.id)?;
    activity::record(
        conn,
        activity::for_subscription(
            &canceled,
            ActivityType::SubscriptionCanceled,
            "Subscription canceled",
            reason.map(|r| format!("Reason: {}", r)),
        ),
    );
    tracing::info!(
        "Subscription {} canceled by {} ({}, {} open order(s) canceled)",
        sub.id,
        canceled_by,
        reason.unwrap_or("no reason given"),
        closed
    );
    Ok(canceled)
}

pub fn pause_subscription(state: &AppState, user_id: i64, id: &str) -> Result<Subscription> {
    let mut conn = state.db.get()?;
    pause_subscription_at(&mut conn, user_id, id, now())
}

/// `active → paused`. Quota and end time are left untouched.
pub fn pause_subscription_at(
    conn: &mut Connection,
    user_id: i64,
    id: &str,
    now: i64,
) -> Result<Subscription> {
    let tx = begin_immediate(conn)?;
    let sub = load_user_subscription(&tx, user_id, id)?;
    ensure_changeable(&sub, now)?;
    if sub.status != SubscriptionStatus::Active {
        return Err(AppError::NotEligible("subscription is not active".into()));
    }
    if !queries::transition_subscription(
        &tx,
        &sub.id,
        SubscriptionStatus::Active,
        SubscriptionStatus::Paused,
    )? {
        return Err(AppError::ConcurrentModification("subscription"));
    }

    let paused = reload(&tx, &sub.id)?;
    activity::record(
        &tx,
        activity::for_subscription(&paused, ActivityType::SubscriptionPaused, "Subscription paused", None),
    );
    tx.commit()?;

    tracing::info!("Subscription {} paused", sub.id);
    Ok(paused)
}

pub fn resume_subscription(state: &AppState, user_id: i64, id: &str) -> Result<Subscription> {
    let mut conn = state.db.get()?;
    resume_subscription_at(&mut conn, user_id, id, now())
}

/// `paused → active`. A paused subscription whose period ran out is expired
/// instead and the call fails with `SubscriptionExpired`.
pub fn resume_subscription_at(
    conn: &mut Connection,
    user_id: i64,
    id: &str,
    now: i64,
) -> Result<Subscription> {
    let tx = begin_immediate(conn)?;
    let sub = load_user_subscription(&tx, user_id, id)?;
    match sub.status {
        SubscriptionStatus::Paused => {}
        SubscriptionStatus::Expired => return Err(AppError::SubscriptionExpired),
        _ => return Err(AppError::NotEligible("subscription is not paused".into())),
    }

    if sub.end_time <= now {
        if queries::transition_subscription(
            &tx,
            &sub.id,
            SubscriptionStatus::Paused,
            SubscriptionStatus::Expired,
        )? {
            let expired = reload(&tx, &sub.id)?;
            activity::record(
                &tx,
                activity::for_subscription(
                    &expired,
                    ActivityType::SubscriptionExpired,
                    "Subscription expired",
                    Some("The subscription ended while paused".into()),
                ),
            );
            tx.commit()?;
            tracing::info!("Subscription {} expired while paused", sub.id);
        }
        return Err(AppError::SubscriptionExpired);
    }

    if !queries::transition_subscription(
        &tx,
        &sub.id,
        SubscriptionStatus::Paused,
        SubscriptionStatus::Active,
    )? {
        return Err(AppError::ConcurrentModification("subscription"));
    }

    let resumed = reload(&tx, &sub.id)?;
    activity::record(
        &tx,
        activity::for_subscription(&resumed, ActivityType::SubscriptionResumed, "Subscription resumed", None),
    );
    tx.commit()?;

    tracing::info!("Subscription {} resumed", sub.id);
    Ok(resumed)
}

pub fn set_auto_renew(state: &AppState, user_id: i64, id: &str, auto_renew: bool) -> Result<Subscription> {
    let conn = state.db.get()?;
    let sub = load_user_subscription(&conn, user_id, id)?;
    if !sub.status.is_live() {
        return Err(AppError::NotEligible("subscription is no longer live".into()));
    }
    queries::set_auto_renew(&conn, &sub.id, auto_renew)?;
    tracing::info!("Subscription {} auto_renew set to {}", sub.id, auto_renew);
    reload(&conn, &sub.id)
}

// ============ Quota ============

pub fn consume_quota(state: &AppState, user_id: i64, id: &str, amount: i64) -> Result<Subscription> {
    let conn = state.db.get()?;
    consume_quota_at(&conn, user_id, id, amount, now())
}

/// Consume `amount` units of quota atomically. On refusal `quota_used` is
/// left unchanged and the error says why.
pub fn consume_quota_at(
    conn: &Connection,
    user_id: i64,
    id: &str,
    amount: i64,
    now: i64,
) -> Result<Subscription> {
    if amount <= 0 {
        return Err(AppError::BadRequest(msg::INVALID_AMOUNT.into()));
    }
    let sub = load_user_subscription(conn, user_id, id)?;

    let Some(updated) = queries::try_consume_quota(conn, &sub.id, amount, now)? else {
        let current = reload(conn, &sub.id)?;
        return Err(match current.status {
            SubscriptionStatus::Expired => AppError::SubscriptionExpired,
            SubscriptionStatus::Active if current.end_time <= now => AppError::SubscriptionExpired,
            SubscriptionStatus::Active => AppError::QuotaExceeded {
                requested: amount,
                remaining: current.remaining_quota(),
            },
            _ => AppError::NotEligible("subscription is not active".into()),
        });
    };

    if updated.quota_used > updated.quota_limit {
        tracing::error!(
            "Subscription {} quota_used {} exceeds limit {}",
            updated.id,
            updated.quota_used,
            updated.quota_limit
        );
    }

    let mut entry = activity::for_subscription(
        &updated,
        ActivityType::QuotaConsumed,
        format!("Used {} quota", amount),
        Some(format!("{} remaining", updated.remaining_quota())),
    );
    entry.amount = Some(amount);
    activity::record(conn, entry);

    tracing::debug!(
        "Subscription {} consumed {} quota ({} / {})",
        updated.id,
        amount,
        updated.quota_used,
        updated.quota_limit
    );
    Ok(updated)
}

// ============ Sweeps ============

/// Expire active subscriptions whose period has ended. Idempotent.
pub fn expire_subscriptions_at(conn: &mut Connection, now: i64) -> Result<usize> {
    let mut expired = 0;
    loop {
        let batch = queries::list_subscriptions_past_end(conn, now, SWEEP_BATCH)?;
        let batch_len = batch.len();
        let mut progressed = false;

        for sub in batch {
            let tx = begin_immediate(conn)?;
            if queries::transition_subscription(
                &tx,
                &sub.id,
                SubscriptionStatus::Active,
                SubscriptionStatus::Expired,
            )? {
                activity::record(
                    &tx,
                    activity::for_subscription(
                        &sub,
                        ActivityType::SubscriptionExpired,
                        "Subscription expired",
                        Some(format!("Ended on {}", format_date(sub.end_time))),
                    ),
                );
                tx.commit()?;
                expired += 1;
                progressed = true;
                tracing::info!("Subscription {} expired", sub.id);
            }
        }

        if (batch_len as i64) < SWEEP_BATCH || !progressed {
            break;
        }
    }
    Ok(expired)
}

/// Raise renewal orders for auto-renewing subscriptions that end within the
/// renew window. Subscriptions with a renewal order still awaiting payment
/// are skipped. Returns how many orders were raised.
pub fn auto_renew_at(conn: &mut Connection, settings: &EngineSettings, now: i64) -> Result<usize> {
    let candidates =
        queries::list_renewal_candidates(conn, now, settings.renew_window_secs, SWEEP_BATCH)?;
    let mut raised = 0;
    for sub in candidates {
        let tx = begin_immediate(conn)?;
        let method = last_payment_method(&tx, &sub);
        match raise_renewal_order(&tx, settings, &sub, &method, now) {
            Ok((_, true)) => {
                tx.commit()?;
                raised += 1;
            }
            Ok((_, false)) => {}
            Err(e) => tracing::warn!("Auto-renew of subscription {} failed: {}", sub.id, e),
        }
    }
    Ok(raised)
}

/// Warn users whose trial ends within the notice window. Each subscription
/// gets at most one notice; the check and the insert share one IMMEDIATE
/// transaction.
pub fn notify_trials_ending_at(conn: &mut Connection, settings: &EngineSettings, now: i64) -> Result<usize> {
    let ending = queries::list_trials_ending(conn, now, settings.trial_notice_secs, SWEEP_BATCH)?;
    let mut notified = 0;
    for sub in ending {
        let tx = begin_immediate(conn)?;
        if queries::count_subscription_activities(&tx, &sub.id, ActivityType::TrialEnding)? > 0 {
            continue;
        }
        let trial_end = sub.trial_end_time.unwrap_or(sub.start_time);
        activity::record(
            &tx,
            activity::for_subscription(
                &sub,
                ActivityType::TrialEnding,
                "Your free trial is ending",
                Some(format!("Trial ends on {}", format_date(trial_end))),
            ),
        );
        tx.commit()?;
        notified += 1;
    }
    Ok(notified)
}
