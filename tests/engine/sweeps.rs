//! Background sweep tests. Every sweep is driven with an explicit clock.

#[path = "../common/mod.rs"]
mod common;
use common::*;

use payflow::engine::jobs::{self, SweepReport};

#[tokio::test]
async fn test_idle_sweep_reports_nothing() {
    let env = test_env();
    let report = jobs::run_sweeps_at(&env.state, now()).await;
    assert_eq!(report, SweepReport::default());
}

#[tokio::test]
async fn test_expired_orders_release_stock_and_attempts() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 500, 10);
    let order = place_order(&env.state, 7, &product.id);
    let payment = open_payment(&env.state, 7, &order.id).await;
    assert_eq!(catalog::get_product(&env.state, &product.id).unwrap().stock, 9);

    let report = jobs::run_sweeps_at(&env.state, order.expire_time + 1).await;
    assert_eq!(report.orders_expired, 1);
    // The attempt was closed with its order, so reconcile has nothing left.
    assert_eq!(report.payments.checked, 0);

    assert_eq!(orders::get_order(&env.state, 7, &order.id).unwrap().status, OrderStatus::Expired);
    assert_eq!(ledger::get_payment(&env.state, 7, &payment.id).unwrap().status, PaymentStatus::Expired);
    assert_eq!(catalog::get_product(&env.state, &product.id).unwrap().stock, 10);

    let again = jobs::run_sweeps_at(&env.state, order.expire_time + 1).await;
    assert_eq!(again.orders_expired, 0);
}

#[tokio::test]
async fn test_sweep_recovers_lost_payment() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    let order = place_order(&env.state, 7, &plan.id);
    let payment = open_payment(&env.state, 7, &order.id).await;
    env.fake.answer_queries(PaymentStatus::Success, payment.amount);

    let at = payment.created_at + env.state.settings.reconcile_grace_secs;
    let report = jobs::run_sweeps_at(&env.state, at).await;
    assert_eq!(report.payments.checked, 1);
    assert_eq!(report.payments.applied, 1);

    assert_eq!(orders::get_order(&env.state, 7, &order.id).unwrap().status, OrderStatus::Paid);
    let sub = live_subscription(&env.state, 7).expect("subscription created by reconcile");
    assert_eq!(sub.order_id, order.id);
}

#[tokio::test]
async fn test_subscriptions_expire_once() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    let t = now();
    let order = place_order(&env.state, 7, &plan.id);
    settle_at(&env.state, &order, t).await;
    let sub = live_subscription(&env.state, 7).unwrap();
    subscriptions::set_auto_renew(&env.state, 7, &sub.id, false).unwrap();

    let report = jobs::run_sweeps_at(&env.state, sub.end_time).await;
    assert_eq!(report.subscriptions_expired, 1);
    assert_eq!(report.renewal_orders, 0);

    let expired = subscriptions::get_subscription(&env.state, 7, &sub.id).unwrap();
    assert_eq!(expired.status, SubscriptionStatus::Expired);
    let notices: Vec<_> = activities_of(&env.state, 7)
        .into_iter()
        .filter(|a| a.activity_type == ActivityType::SubscriptionExpired)
        .collect();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].priority, ActivityPriority::High);

    let again = jobs::run_sweeps_at(&env.state, sub.end_time + ONE_DAY).await;
    assert_eq!(again.subscriptions_expired, 0);
}

#[tokio::test]
async fn test_paused_subscriptions_are_not_swept() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    let order = place_order(&env.state, 7, &plan.id);
    settle_at(&env.state, &order, now()).await;
    let sub = live_subscription(&env.state, 7).unwrap();
    subscriptions::pause_subscription(&env.state, 7, &sub.id).unwrap();

    let report = jobs::run_sweeps_at(&env.state, sub.end_time + 1).await;
    assert_eq!(report.subscriptions_expired, 0);
    assert_eq!(report.renewal_orders, 0);
    assert_eq!(
        subscriptions::get_subscription(&env.state, 7, &sub.id).unwrap().status,
        SubscriptionStatus::Paused
    );
}

fn open_renewal(state: &AppState, sub: &Subscription, at: i64) -> Option<Order> {
    let conn = state.db.get().unwrap();
    queries::find_open_subscription_order(&conn, &sub.id, OrderKind::Renewal, at).unwrap()
}

#[tokio::test]
async fn test_auto_renew_raises_one_order_inside_window() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    let t = now();
    let order = place_order(&env.state, 7, &plan.id);
    settle_at(&env.state, &order, t).await;
    let sub = live_subscription(&env.state, 7).unwrap();

    // Outside the window nothing happens.
    let early = sub.end_time - env.state.settings.renew_window_secs - 1;
    assert_eq!(jobs::run_sweeps_at(&env.state, early).await.renewal_orders, 0);

    let at = sub.end_time - 3_600;
    let report = jobs::run_sweeps_at(&env.state, at).await;
    assert_eq!(report.renewal_orders, 1);

    let renewal = open_renewal(&env.state, &sub, at).expect("renewal order raised");
    assert_eq!(renewal.kind, OrderKind::Renewal);
    assert_eq!(renewal.status, OrderStatus::Pending);
    assert_eq!(renewal.total_amount, plan.price);
    assert_eq!(renewal.payment_method, FAKE_PROVIDER);

    // The period waits for the payment, and the open order is not duplicated.
    let current = subscriptions::get_subscription(&env.state, 7, &sub.id).unwrap();
    assert_eq!(current.end_time, sub.end_time);
    assert_eq!(current.order_id, sub.order_id);
    assert_eq!(jobs::run_sweeps_at(&env.state, at + 60).await.renewal_orders, 0);

    settle_at(&env.state, &renewal, at + 120).await;
    let renewed = subscriptions::get_subscription(&env.state, 7, &sub.id).unwrap();
    assert_eq!(renewed.end_time, sub.end_time + THIRTY_DAYS);
    assert_eq!(renewed.start_time, at + 120);
    assert_eq!(renewed.order_id, renewal.id);

    // The new end is outside the window: no further order.
    assert_eq!(jobs::run_sweeps_at(&env.state, at + 180).await.renewal_orders, 0);
}

#[tokio::test]
async fn test_unpaid_renewal_grants_nothing() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    let t = now();
    let order = place_order(&env.state, 7, &plan.id);
    settle_at(&env.state, &order, t).await;
    let sub = live_subscription(&env.state, 7).unwrap();

    let at = sub.end_time - 3_600;
    assert_eq!(jobs::run_sweeps_at(&env.state, at).await.renewal_orders, 1);
    let renewal = open_renewal(&env.state, &sub, at).unwrap();

    // The order lapses unpaid and the subscription ends on schedule.
    let after = renewal.expire_time.max(sub.end_time) + 1;
    let report = jobs::run_sweeps_at(&env.state, after).await;
    assert_eq!(report.orders_expired, 1);
    assert_eq!(report.subscriptions_expired, 1);
    assert_eq!(report.renewal_orders, 0);

    let ended = subscriptions::get_subscription(&env.state, 7, &sub.id).unwrap();
    assert_eq!(ended.status, SubscriptionStatus::Expired);
    assert_eq!(ended.end_time, sub.end_time);
    assert_eq!(ended.order_id, sub.order_id);
    assert_eq!(orders::get_order(&env.state, 7, &renewal.id).unwrap().status, OrderStatus::Expired);

    // Later cycles renew nothing either.
    let report = jobs::run_sweeps_at(&env.state, after + THIRTY_DAYS).await;
    assert_eq!(report.renewal_orders, 0);
    assert_eq!(
        subscriptions::get_subscription(&env.state, 7, &sub.id).unwrap().end_time,
        sub.end_time
    );
    let renewals = activities_of(&env.state, 7)
        .into_iter()
        .filter(|a| a.activity_type == ActivityType::SubscriptionRenewed)
        .count();
    assert_eq!(renewals, 0);
}

#[tokio::test]
async fn test_success_after_order_expiry_is_refused() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    let order = place_order(&env.state, 7, &plan.id);
    let payment = open_payment(&env.state, 7, &order.id).await;

    let report = jobs::run_sweeps_at(&env.state, order.expire_time + 1).await;
    assert_eq!(report.orders_expired, 1);
    assert_eq!(ledger::get_payment(&env.state, 7, &payment.id).unwrap().status, PaymentStatus::Expired);

    // The provider collected the money after the order lapsed.
    let err = deliver_success(&env.state, &payment).await.unwrap_err();
    assert!(matches!(err, AppError::Invariant(_)));
    assert_eq!(err.kind(), payflow::error::ErrorKind::Invariant);

    assert_eq!(ledger::get_payment(&env.state, 7, &payment.id).unwrap().status, PaymentStatus::Expired);
    assert_eq!(orders::get_order(&env.state, 7, &order.id).unwrap().status, OrderStatus::Expired);
    assert!(live_subscription(&env.state, 7).is_none());
}

#[tokio::test]
async fn test_trial_notice_is_sent_once() {
    let env = test_env();
    let mut input = plan_input("Starter", 2_900, 1);
    input.free_trial_days = 7;
    let plan = create_plan_with(&env.state, input);
    let t = now();
    let order = place_order(&env.state, 7, &plan.id);
    settle_at(&env.state, &order, t).await;

    assert_eq!(jobs::run_sweeps_at(&env.state, t + ONE_DAY).await.trial_notices, 0);
    assert_eq!(jobs::run_sweeps_at(&env.state, t + 5 * ONE_DAY).await.trial_notices, 1);
    assert_eq!(jobs::run_sweeps_at(&env.state, t + 6 * ONE_DAY).await.trial_notices, 0);

    // A direct second pass at the same instant finds the notice already sent.
    let mut conn = env.state.db.get().unwrap();
    let again = subscriptions::notify_trials_ending_at(&mut conn, &env.state.settings, t + 5 * ONE_DAY).unwrap();
    assert_eq!(again, 0);
    drop(conn);

    let notices: Vec<_> = activities_of(&env.state, 7)
        .into_iter()
        .filter(|a| a.activity_type == ActivityType::TrialEnding)
        .collect();
    assert_eq!(notices.len(), 1);
    assert!(!notices[0].is_read);
}
