//! Subscription lifecycle and quota tests.

use std::sync::{Arc, Barrier};
use std::thread;

#[path = "../common/mod.rs"]
mod common;
use common::*;

fn plan_with_trial(state: &AppState, days: i32) -> Product {
    let mut input = plan_input("Starter", 2_900, 1);
    input.free_trial_days = days;
    create_plan_with(state, input)
}

/// Buy `plan` for `user_id` with the callback applied at `now`.
async fn subscribe_at(env: &TestEnv, user_id: i64, plan: &Product, now: i64) -> Subscription {
    let order = place_order(&env.state, user_id, &plan.id);
    settle_at(&env.state, &order, now).await;
    live_subscription(&env.state, user_id).expect("no live subscription")
}

#[tokio::test]
async fn test_first_subscription_starts_with_trial() {
    let env = test_env();
    let plan = plan_with_trial(&env.state, 7);
    let t = now();

    let sub = subscribe_at(&env, 7, &plan, t).await;
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.trial_start_time, Some(t));
    assert_eq!(sub.trial_end_time, Some(t + 7 * ONE_DAY));
    assert_eq!(sub.start_time, t + 7 * ONE_DAY);
    assert_eq!(sub.end_time, t + 37 * ONE_DAY);
    assert_eq!(sub.quota_limit, plan.quota);
    assert_eq!(sub.quota_used, 0);
    assert!(sub.auto_renew);
    assert_eq!(sub.version, 1);
}

#[tokio::test]
async fn test_returning_subscriber_gets_no_trial() {
    let env = test_env();
    let plan = plan_with_trial(&env.state, 7);
    let t = now();

    let first = subscribe_at(&env, 7, &plan, t).await;
    let mut conn = env.state.db.get().unwrap();
    subscriptions::cancel_subscription_at(&mut conn, 7, &first.id, None, "user:7", t + 1).unwrap();
    drop(conn);

    let second = subscribe_at(&env, 7, &plan, t + 2).await;
    assert_ne!(second.id, first.id);
    assert_eq!(second.trial_start_time, None);
    assert_eq!(second.start_time, t + 2);
    assert_eq!(second.end_time, t + 2 + THIRTY_DAYS);
}

#[tokio::test]
async fn test_perpetual_plan_never_ends() {
    let env = test_env();
    let mut input = plan_input("Lifetime", 49_900, 1);
    input.duration_secs = 0;
    let plan = create_plan_with(&env.state, input);

    let sub = subscribe_at(&env, 7, &plan, now()).await;
    assert_eq!(sub.end_time, PERPETUAL_END_TIME);
    assert!(sub.is_perpetual());
    assert!(!sub.auto_renew);

    let mut conn = env.state.db.get().unwrap();
    let err = subscriptions::renew_subscription_at(
        &mut conn,
        &env.state.settings,
        7,
        &sub.id,
        &RenewSubscription::default(),
        now(),
    )
    .unwrap_err();
    assert!(matches!(err, AppError::NotEligible(_)));
}

#[tokio::test]
async fn test_repurchasing_the_same_plan_extends_it() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    let t = now();

    let first = subscribe_at(&env, 7, &plan, t).await;
    {
        let conn = env.state.db.get().unwrap();
        subscriptions::consume_quota_at(&conn, 7, &first.id, 300, t + 1).unwrap();
    }

    let second = subscribe_at(&env, 7, &plan, t + 10).await;
    assert_eq!(second.id, first.id);
    assert_eq!(second.end_time, first.end_time + THIRTY_DAYS);
    assert_eq!(second.quota_used, 0);
    assert_eq!(subscriptions::list_user_subscriptions(&env.state, 7).unwrap().len(), 1);
}

#[tokio::test]
async fn test_buying_another_plan_supersedes_the_live_one() {
    let env = test_env();
    let basic = create_plan(&env.state, "Basic", 2_900, 1);
    let pro = create_plan(&env.state, "Pro", 9_900, 2);
    let t = now();

    let old = subscribe_at(&env, 7, &basic, t).await;
    let new = subscribe_at(&env, 7, &pro, t + 5).await;
    assert_ne!(new.id, old.id);
    assert_eq!(new.plan_id, pro.id);

    let old = subscriptions::get_subscription(&env.state, 7, &old.id).unwrap();
    assert_eq!(old.status, SubscriptionStatus::Canceled);
    assert_eq!(old.cancel_reason.as_deref(), Some("superseded"));
}

#[tokio::test]
async fn test_quota_is_enforced() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    let t = now();
    let sub = subscribe_at(&env, 7, &plan, t).await;
    let conn = env.state.db.get().unwrap();

    let sub = subscriptions::consume_quota_at(&conn, 7, &sub.id, 950, t + 1).unwrap();
    assert_eq!(sub.quota_used, 950);

    let err = subscriptions::consume_quota_at(&conn, 7, &sub.id, 120, t + 2).unwrap_err();
    match err {
        AppError::QuotaExceeded { requested, remaining } => {
            assert_eq!(requested, 120);
            assert_eq!(remaining, 50);
        }
        other => panic!("expected QuotaExceeded, got {:?}", other),
    }
    assert_eq!(queries::get_subscription(&conn, &sub.id).unwrap().unwrap().quota_used, 950);

    let err = subscriptions::consume_quota_at(&conn, 7, &sub.id, 0, t + 3).unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let err = subscriptions::consume_quota_at(&conn, 7, &sub.id, 1, sub.end_time).unwrap_err();
    assert!(matches!(err, AppError::SubscriptionExpired));
}

#[tokio::test]
async fn test_concurrent_quota_consumption_never_overdraws() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    let sub = subscribe_at(&env, 7, &plan, now()).await;

    let barrier = Arc::new(Barrier::new(20));
    let handles: Vec<_> = (0..20)
        .map(|_| {
            let state = env.state.clone();
            let barrier = barrier.clone();
            let id = sub.id.clone();
            thread::spawn(move || {
                barrier.wait();
                subscriptions::consume_quota(&state, 7, &id, 100).is_ok()
            })
        })
        .collect();

    let succeeded = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
    assert_eq!(succeeded, 10);

    let sub = subscriptions::get_subscription(&env.state, 7, &sub.id).unwrap();
    assert_eq!(sub.quota_used, 1_000);
    assert!(sub.quota_used <= sub.quota_limit);
}

#[tokio::test]
async fn test_upgrade_and_downgrade_compare_levels() {
    let env = test_env();
    let basic = create_plan(&env.state, "Basic", 2_900, 1);
    let mut pro_input = plan_input("Pro", 9_900, 2);
    pro_input.quota = 5_000;
    pro_input.available_models = vec!["base".into(), "advanced".into()];
    let pro = create_plan_with(&env.state, pro_input);
    let t = now();

    let sub = subscribe_at(&env, 7, &basic, t).await;
    let mut conn = env.state.db.get().unwrap();
    subscriptions::consume_quota_at(&conn, 7, &sub.id, 400, t + 1).unwrap();

    let to_basic = ChangePlan {
        plan_id: basic.id.clone(),
        payment_method: None,
    };
    let to_pro = ChangePlan {
        plan_id: pro.id.clone(),
        payment_method: None,
    };

    // Same level is not an upgrade, higher level is not a downgrade.
    let err = subscriptions::upgrade_subscription_at(&mut conn, &env.state.settings, 7, &sub.id, &to_basic, t + 2)
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidPlanChange(_)));
    let err = subscriptions::downgrade_subscription_at(&mut conn, 7, &sub.id, &to_pro, t + 2).unwrap_err();
    assert!(matches!(err, AppError::InvalidPlanChange(_)));

    let change =
        subscriptions::upgrade_subscription_at(&mut conn, &env.state.settings, 7, &sub.id, &to_pro, t + 3).unwrap();
    let order = change.order.expect("upgrade raises an order");
    assert_eq!(order.kind, OrderKind::Upgrade);
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.total_amount, pro.price);
    assert_eq!(order.subscription_id.as_deref(), Some(sub.id.as_str()));

    // Nothing moves until the upgrade is paid.
    assert_eq!(change.subscription.plan_id, basic.id);
    let unpaid = queries::get_subscription(&conn, &sub.id).unwrap().unwrap();
    assert_eq!(unpaid.plan_id, basic.id);
    assert_eq!(unpaid.quota_used, 400);
    drop(conn);

    settle_at(&env.state, &order, t + 4).await;
    let upgraded = subscriptions::get_subscription(&env.state, 7, &sub.id).unwrap();
    assert_eq!(upgraded.plan_id, pro.id);
    assert_eq!(upgraded.order_id, order.id);
    assert_eq!(upgraded.quota_limit, 5_000);
    assert_eq!(upgraded.max_roles, 10);
    assert_eq!(upgraded.max_contexts, 6);
    assert_eq!(upgraded.quota_used, 0);
    assert_eq!(upgraded.available_models, vec!["base", "advanced"]);
    assert_eq!(upgraded.end_time, sub.end_time);

    let mut conn = env.state.db.get().unwrap();
    let err = subscriptions::upgrade_subscription_at(&mut conn, &env.state.settings, 7, &sub.id, &to_basic, t + 5)
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidPlanChange(_)));

    subscriptions::consume_quota_at(&conn, 7, &sub.id, 3_000, t + 5).unwrap();
    let change = subscriptions::downgrade_subscription_at(&mut conn, 7, &sub.id, &to_basic, t + 6).unwrap();
    assert!(change.order.is_none());

    // Back on the original plan with the original limits.
    let down = change.subscription;
    assert_eq!(down.plan_id, basic.id);
    assert_eq!(down.quota_limit, sub.quota_limit);
    assert_eq!(down.max_roles, sub.max_roles);
    assert_eq!(down.max_contexts, sub.max_contexts);
    assert_eq!(down.available_models, sub.available_models);
    // Used quota is clamped to the smaller limit.
    assert_eq!(down.quota_used, 1_000);
}

#[tokio::test]
async fn test_lapsed_upgrade_order_changes_nothing() {
    let env = test_env();
    let basic = create_plan(&env.state, "Basic", 2_900, 1);
    let pro = create_plan(&env.state, "Pro", 9_900, 2);
    let t = now();
    let sub = subscribe_at(&env, 7, &basic, t).await;

    let mut conn = env.state.db.get().unwrap();
    let change = subscriptions::upgrade_subscription_at(
        &mut conn,
        &env.state.settings,
        7,
        &sub.id,
        &ChangePlan {
            plan_id: pro.id.clone(),
            payment_method: None,
        },
        t + 1,
    )
    .unwrap();
    let order = change.order.unwrap();

    assert_eq!(orders::expire_orders_at(&mut conn, order.expire_time + 1).unwrap(), 1);
    let after = queries::get_subscription(&conn, &sub.id).unwrap().unwrap();
    assert_eq!(after.plan_id, basic.id);
    assert_eq!(after.quota_limit, sub.quota_limit);
    assert_eq!(after.max_roles, sub.max_roles);
    assert_eq!(after.version, sub.version);
    assert_eq!(
        queries::get_order(&conn, &order.id).unwrap().unwrap().status,
        OrderStatus::Expired
    );
}

#[tokio::test]
async fn test_upgrade_target_must_be_a_plan() {
    let env = test_env();
    let basic = create_plan(&env.state, "Basic", 2_900, 1);
    let pack = create_one_time(&env.state, "Pack", 500, 10);
    let sub = subscribe_at(&env, 7, &basic, now()).await;

    let mut conn = env.state.db.get().unwrap();
    let err = subscriptions::upgrade_subscription_at(
        &mut conn,
        &env.state.settings,
        7,
        &sub.id,
        &ChangePlan {
            plan_id: pack.id.clone(),
            payment_method: None,
        },
        now(),
    )
    .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn test_renewal_takes_effect_when_paid() {
    let env = test_env();
    let plan = plan_with_trial(&env.state, 7);
    let t = now();
    let sub = subscribe_at(&env, 7, &plan, t).await;

    let mut conn = env.state.db.get().unwrap();
    subscriptions::consume_quota_at(&conn, 7, &sub.id, 10, t + 1).unwrap();
    let change = subscriptions::renew_subscription_at(
        &mut conn,
        &env.state.settings,
        7,
        &sub.id,
        &RenewSubscription::default(),
        t + 100,
    )
    .unwrap();

    let order = change.order.expect("renewal raises an order");
    assert_eq!(order.kind, OrderKind::Renewal);
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.total_amount, plan.price);
    // Falls back to the method of the order that paid last.
    assert_eq!(order.payment_method, FAKE_PROVIDER);
    assert_eq!(change.subscription.end_time, sub.end_time);
    assert_eq!(change.subscription.quota_used, 10);

    // Asking again hands back the open order.
    let again = subscriptions::renew_subscription_at(
        &mut conn,
        &env.state.settings,
        7,
        &sub.id,
        &RenewSubscription::default(),
        t + 200,
    )
    .unwrap();
    assert_eq!(again.order.unwrap().id, order.id);
    drop(conn);

    settle_at(&env.state, &order, t + 300).await;
    let renewed = subscriptions::get_subscription(&env.state, 7, &sub.id).unwrap();
    assert_eq!(renewed.start_time, t + 300);
    assert_eq!(renewed.end_time, sub.end_time + THIRTY_DAYS);
    assert_eq!(renewed.trial_start_time, None);
    assert_eq!(renewed.trial_end_time, None);
    assert_eq!(renewed.quota_used, 0);
    assert_eq!(renewed.order_id, order.id);
    assert_eq!(renewed.amount, plan.price);
    assert!(renewed.version > sub.version);
    assert_eq!(orders::get_order(&env.state, 7, &order.id).unwrap().status, OrderStatus::Paid);

    let renewals = activities_of(&env.state, 7)
        .into_iter()
        .filter(|a| a.activity_type == ActivityType::SubscriptionRenewed)
        .count();
    assert_eq!(renewals, 1);
}

#[tokio::test]
async fn test_canceling_closes_open_plan_orders() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    let t = now();
    let sub = subscribe_at(&env, 7, &plan, t).await;

    let mut conn = env.state.db.get().unwrap();
    let order = subscriptions::renew_subscription_at(
        &mut conn,
        &env.state.settings,
        7,
        &sub.id,
        &RenewSubscription::default(),
        t + 1,
    )
    .unwrap()
    .order
    .unwrap();
    subscriptions::cancel_subscription_at(&mut conn, 7, &sub.id, None, "user:7", t + 2).unwrap();
    drop(conn);

    assert_eq!(orders::get_order(&env.state, 7, &order.id).unwrap().status, OrderStatus::Canceled);
    let err = ledger::create_payment(
        &env.state,
        7,
        &CreatePaymentBody {
            order_id: order.id.clone(),
            provider: FAKE_PROVIDER.to_string(),
            scene: PaymentScene::Web,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::OrderNotPending));
}

#[tokio::test]
async fn test_renewal_requires_auto_renew_and_live_period() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    let t = now();
    let sub = subscribe_at(&env, 7, &plan, t).await;

    let mut conn = env.state.db.get().unwrap();
    let err = subscriptions::renew_subscription_at(
        &mut conn,
        &env.state.settings,
        7,
        &sub.id,
        &RenewSubscription::default(),
        sub.end_time,
    )
    .unwrap_err();
    assert!(matches!(err, AppError::SubscriptionExpired));
    drop(conn);

    subscriptions::set_auto_renew(&env.state, 7, &sub.id, false).unwrap();
    let mut conn = env.state.db.get().unwrap();
    let err = subscriptions::renew_subscription_at(
        &mut conn,
        &env.state.settings,
        7,
        &sub.id,
        &RenewSubscription::default(),
        t + 1,
    )
    .unwrap_err();
    assert!(matches!(err, AppError::NotEligible(_)));
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    let sub = subscribe_at(&env, 7, &plan, now()).await;

    let input = CancelSubscription {
        reason: Some("too expensive".into()),
    };
    let first = subscriptions::cancel_subscription(&env.state, 7, &sub.id, &input).unwrap();
    assert_eq!(first.status, SubscriptionStatus::Canceled);
    assert_eq!(first.cancel_reason.as_deref(), Some("too expensive"));
    assert_eq!(first.canceled_by.as_deref(), Some("user:7"));
    assert!(!first.auto_renew);

    let second = subscriptions::cancel_subscription(&env.state, 7, &sub.id, &input).unwrap();
    assert_eq!(second.status, SubscriptionStatus::Canceled);
    assert_eq!(second.canceled_at, first.canceled_at);
    assert_eq!(second.version, first.version);

    let err = subscriptions::cancel_subscription(&env.state, 8, &sub.id, &input).unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_pause_and_resume() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    let t = now();
    let sub = subscribe_at(&env, 7, &plan, t).await;
    let mut conn = env.state.db.get().unwrap();

    let paused = subscriptions::pause_subscription_at(&mut conn, 7, &sub.id, t + 1).unwrap();
    assert_eq!(paused.status, SubscriptionStatus::Paused);
    let err = subscriptions::pause_subscription_at(&mut conn, 7, &sub.id, t + 2).unwrap_err();
    assert!(matches!(err, AppError::NotEligible(_)));

    let err = subscriptions::consume_quota_at(&conn, 7, &sub.id, 1, t + 3).unwrap_err();
    assert!(matches!(err, AppError::NotEligible(_)));

    let resumed = subscriptions::resume_subscription_at(&mut conn, 7, &sub.id, t + 4).unwrap();
    assert_eq!(resumed.status, SubscriptionStatus::Active);

    subscriptions::pause_subscription_at(&mut conn, 7, &sub.id, t + 5).unwrap();
    let err = subscriptions::resume_subscription_at(&mut conn, 7, &sub.id, sub.end_time + 1).unwrap_err();
    assert!(matches!(err, AppError::SubscriptionExpired));
    let expired = queries::get_subscription(&conn, &sub.id).unwrap().unwrap();
    assert_eq!(expired.status, SubscriptionStatus::Expired);
}

#[tokio::test]
async fn test_limits_fall_back_to_free_tier() {
    let env = test_env();
    let limits = subscriptions::user_limits(&env.state, 7).unwrap();
    assert!(limits.subscription_id.is_none());
    assert_eq!(limits.max_roles, FreeTier::MAX_ROLES);
    assert_eq!(limits.quota_limit, FreeTier::QUOTA);

    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    let sub = subscribe_at(&env, 7, &plan, now()).await;
    let limits = subscriptions::user_limits(&env.state, 7).unwrap();
    assert_eq!(limits.subscription_id.as_deref(), Some(sub.id.as_str()));
    assert_eq!(limits.max_roles, 5);
    assert_eq!(limits.quota_limit, 1_000);
}

#[tokio::test]
async fn test_permission_checks() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    subscribe_at(&env, 7, &plan, now()).await;

    let check = |p: Permission| subscriptions::check_permission(&env.state, 7, &p).unwrap();

    assert!(check(Permission::CreateRole { current: 4 }).allowed);
    assert!(!check(Permission::CreateRole { current: 5 }).allowed);
    assert!(check(Permission::CreateContext { current: 2 }).allowed);
    assert!(!check(Permission::CreateContext { current: 3 }).allowed);
    assert!(check(Permission::UseModel { model: "base".into() }).allowed);
    let denied = check(Permission::UseModel {
        model: "advanced".into(),
    });
    assert!(!denied.allowed);
    assert!(denied.reason.is_some());
    assert!(check(Permission::ConsumeQuota { amount: 1_000 }).allowed);
    assert!(!check(Permission::ConsumeQuota { amount: 1_001 }).allowed);

    // Free tier: nothing to consume.
    let free = subscriptions::check_permission(&env.state, 8, &Permission::ConsumeQuota { amount: 1 }).unwrap();
    assert!(!free.allowed);
}
