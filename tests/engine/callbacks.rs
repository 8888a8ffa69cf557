//! Callback processing tests: idempotency, signatures, reconciliation.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

#[path = "../common/mod.rs"]
mod common;
use common::*;

use payflow::engine::CallbackOutcome;
use payflow::engine::process_payment_callback;

#[tokio::test]
async fn test_wallet_callback_end_to_end() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 9_900, 10);
    let order = place_order(&env.state, 7, &product.id);
    assert_eq!(catalog::get_product(&env.state, &product.id).unwrap().stock, 9);

    let created = ledger::create_payment(
        &env.state,
        7,
        &CreatePaymentBody {
            order_id: order.id.clone(),
            provider: "alipay".into(),
            scene: PaymentScene::Web,
        },
    )
    .await
    .unwrap();
    let payment = created.record;
    // Web payments are a locally signed redirect; the trade number is our id.
    assert_eq!(payment.provider_order_id.as_deref(), Some(payment.id.as_str()));
    assert!(payment.payment_url.is_some());

    let body = alipay_notification(&payment.id, "TRADE_SUCCESS", "99.00");
    let gateway = env.state.gateways.get("alipay").unwrap();
    let signature = gateway.extract_signature(&Default::default(), body.as_bytes());
    let outcome = process_payment_callback(&env.state, "alipay", body.as_bytes(), signature.as_deref())
        .await
        .unwrap();
    assert_eq!(outcome, CallbackOutcome::Applied);

    let order = orders::get_order(&env.state, 7, &order.id).unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    assert!(order.paid_at.is_some());
    let payment = ledger::get_payment(&env.state, 7, &payment.id).unwrap();
    assert_eq!(payment.status, PaymentStatus::Success);
    assert!(payment.transaction_id.is_some());
    assert_eq!(catalog::get_product(&env.state, &product.id).unwrap().stock, 9);

    // Replaying the same notification changes nothing.
    let replay = process_payment_callback(&env.state, "alipay", body.as_bytes(), signature.as_deref())
        .await
        .unwrap();
    assert_eq!(replay, CallbackOutcome::AlreadyProcessed);
    assert_eq!(orders::get_order(&env.state, 7, &order.id).unwrap().status, OrderStatus::Paid);
}

#[tokio::test]
async fn test_wallet_payment_activates_subscription() {
    let env = test_env();
    let mut input = plan_input("Pro", 9_900, 1);
    input.stock = 10;
    let plan = create_plan_with(&env.state, input);

    let order = orders::create_order(&env.state, 1, &order_input(&plan.id, 1)).unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.total_amount, order.unit_price * order.quantity);
    assert_eq!(catalog::get_product(&env.state, &plan.id).unwrap().stock, 9);

    let payment = ledger::create_payment(
        &env.state,
        1,
        &CreatePaymentBody {
            order_id: order.id.clone(),
            provider: "alipay".into(),
            scene: PaymentScene::Web,
        },
    )
    .await
    .unwrap()
    .record;
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert!(live_subscription(&env.state, 1).is_none());

    let body = alipay_notification(&payment.id, "TRADE_SUCCESS", "99.00");
    let gateway = env.state.gateways.get("alipay").unwrap();
    let signature = gateway.extract_signature(&Default::default(), body.as_bytes());
    let outcome = process_payment_callback(&env.state, "alipay", body.as_bytes(), signature.as_deref())
        .await
        .unwrap();
    assert_eq!(outcome, CallbackOutcome::Applied);

    assert_eq!(orders::get_order(&env.state, 1, &order.id).unwrap().status, OrderStatus::Paid);
    assert_eq!(ledger::get_payment(&env.state, 1, &payment.id).unwrap().status, PaymentStatus::Success);
    let sub = live_subscription(&env.state, 1).expect("subscription created");
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.plan_id, plan.id);
    assert_eq!(sub.order_id, order.id);
    assert_eq!(sub.quota_limit, plan.quota);
}

#[tokio::test]
async fn test_bad_signatures_change_nothing() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 9_900, 10);
    let order = place_order(&env.state, 7, &product.id);
    let payment = open_payment(&env.state, 7, &order.id).await;
    let body = fake_callback_body(
        payment.provider_order_id.as_deref().unwrap(),
        PaymentStatus::Success,
        payment.amount,
    );

    let err = process_payment_callback(&env.state, FAKE_PROVIDER, &body, Some("forged"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidSignature));

    let err = process_payment_callback(&env.state, FAKE_PROVIDER, &body, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidSignature));

    let payment = ledger::get_payment(&env.state, 7, &payment.id).unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(orders::get_order(&env.state, 7, &order.id).unwrap().status, OrderStatus::Pending);
}

#[tokio::test]
async fn test_tampered_wallet_amount_is_rejected() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 9_900, 10);
    let order = place_order(&env.state, 7, &product.id);
    let payment = ledger::create_payment(
        &env.state,
        7,
        &CreatePaymentBody {
            order_id: order.id.clone(),
            provider: "alipay".into(),
            scene: PaymentScene::Web,
        },
    )
    .await
    .unwrap()
    .record;

    let body = alipay_notification(&payment.id, "TRADE_SUCCESS", "99.00").replace("99.00", "0.01");
    let gateway = env.state.gateways.get("alipay").unwrap();
    let signature = gateway.extract_signature(&Default::default(), body.as_bytes());
    let err = process_payment_callback(&env.state, "alipay", body.as_bytes(), signature.as_deref())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidSignature));
}

#[tokio::test]
async fn test_concurrent_duplicate_callbacks_apply_once() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    let order = place_order(&env.state, 7, &plan.id);
    let payment = open_payment(&env.state, 7, &order.id).await;

    let state = Arc::new(env.state.clone());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let state = state.clone();
            let payment = payment.clone();
            tokio::spawn(async move { deliver_success(&state, &payment).await.unwrap() })
        })
        .collect();

    let mut outcomes = Vec::new();
    for h in handles {
        outcomes.push(h.await.unwrap());
    }
    let applied = outcomes.iter().filter(|o| **o == CallbackOutcome::Applied).count();
    assert_eq!(applied, 1);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, CallbackOutcome::Applied | CallbackOutcome::AlreadyProcessed)));

    // Exactly one subscription came out of it.
    let subs = subscriptions::list_user_subscriptions(&env.state, 7).unwrap();
    assert_eq!(subs.len(), 1);
    let created = activities_of(&env.state, 7)
        .into_iter()
        .filter(|a| a.activity_type == ActivityType::SubscriptionCreated)
        .count();
    assert_eq!(created, 1);
}

#[tokio::test]
async fn test_failure_callback_keeps_order_payable() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 9_900, 10);
    let order = place_order(&env.state, 7, &product.id);
    let payment = open_payment(&env.state, 7, &order.id).await;

    let body = fake_callback_body(
        payment.provider_order_id.as_deref().unwrap(),
        PaymentStatus::Failed,
        payment.amount,
    );
    let outcome = process_payment_callback(&env.state, FAKE_PROVIDER, &body, Some(FAKE_SECRET))
        .await
        .unwrap();
    assert_eq!(outcome, CallbackOutcome::Applied);
    assert_eq!(ledger::get_payment(&env.state, 7, &payment.id).unwrap().status, PaymentStatus::Failed);
    assert_eq!(orders::get_order(&env.state, 7, &order.id).unwrap().status, OrderStatus::Pending);

    // A success for the closed attempt is refused, not swallowed.
    let err = deliver_success(&env.state, &payment).await.unwrap_err();
    assert!(matches!(err, AppError::Invariant(_)));
    assert_eq!(ledger::get_payment(&env.state, 7, &payment.id).unwrap().status, PaymentStatus::Failed);

    // A fresh attempt can still pay the order.
    let retry = open_payment(&env.state, 7, &order.id).await;
    assert_eq!(deliver_success(&env.state, &retry).await.unwrap(), CallbackOutcome::Applied);
    assert_eq!(orders::get_order(&env.state, 7, &order.id).unwrap().status, OrderStatus::Paid);
}

#[tokio::test]
async fn test_success_closes_sibling_attempts() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 9_900, 10);
    let order = place_order(&env.state, 7, &product.id);
    let first = open_payment(&env.state, 7, &order.id).await;
    let second = open_payment(&env.state, 7, &order.id).await;

    deliver_success(&env.state, &second).await.unwrap();

    assert_eq!(ledger::get_payment(&env.state, 7, &first.id).unwrap().status, PaymentStatus::Canceled);
    // A second collection on the closed attempt is refused.
    let err = deliver_success(&env.state, &first).await.unwrap_err();
    assert!(matches!(err, AppError::Invariant(_)));
    assert_eq!(ledger::get_payment(&env.state, 7, &first.id).unwrap().status, PaymentStatus::Canceled);

    // A failure report for it is still just ignored.
    let body = fake_callback_body(first.provider_order_id.as_deref().unwrap(), PaymentStatus::Failed, first.amount);
    let outcome = process_payment_callback(&env.state, FAKE_PROVIDER, &body, Some(FAKE_SECRET))
        .await
        .unwrap();
    assert_eq!(outcome, CallbackOutcome::Ignored);
}

#[tokio::test]
async fn test_amount_mismatch_is_refused() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 9_900, 10);
    let order = place_order(&env.state, 7, &product.id);
    let payment = open_payment(&env.state, 7, &order.id).await;

    let body = fake_callback_body(payment.provider_order_id.as_deref().unwrap(), PaymentStatus::Success, 1);
    let err = process_payment_callback(&env.state, FAKE_PROVIDER, &body, Some(FAKE_SECRET))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Invariant(_)));
    assert_eq!(orders::get_order(&env.state, 7, &order.id).unwrap().status, OrderStatus::Pending);
}

#[tokio::test]
async fn test_success_on_expired_order_is_refused() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 9_900, 10);
    let order = place_order(&env.state, 7, &product.id);
    let payment = open_payment(&env.state, 7, &order.id).await;

    {
        let conn = env.state.db.get().unwrap();
        assert!(queries::transition_order(&conn, &order.id, OrderStatus::Pending, OrderStatus::Expired).unwrap());
    }

    let err = deliver_success(&env.state, &payment).await.unwrap_err();
    assert!(matches!(err, AppError::Invariant(_)));
    assert_eq!(orders::get_order(&env.state, 7, &order.id).unwrap().status, OrderStatus::Expired);
}

#[tokio::test]
async fn test_unknown_payment_is_not_found() {
    let env = test_env();
    let body = fake_callback_body("fake_nope", PaymentStatus::Success, 100);
    let err = process_payment_callback(&env.state, FAKE_PROVIDER, &body, Some(FAKE_SECRET))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_reconcile_recovers_lost_callback() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 9_900, 10);
    let order = place_order(&env.state, 7, &product.id);
    let payment = open_payment(&env.state, 7, &order.id).await;
    env.fake.answer_queries(PaymentStatus::Success, payment.amount);

    // Not stale yet.
    let summary = ledger::reconcile_payments_at(&env.state, payment.created_at).await.unwrap();
    assert_eq!(summary.checked, 0);

    let later = payment.created_at + env.state.settings.reconcile_grace_secs;
    let summary = ledger::reconcile_payments_at(&env.state, later).await.unwrap();
    assert_eq!(summary.checked, 1);
    assert_eq!(summary.applied, 1);
    assert_eq!(orders::get_order(&env.state, 7, &order.id).unwrap().status, OrderStatus::Paid);

    // Nothing pending remains.
    let summary = ledger::reconcile_payments_at(&env.state, later).await.unwrap();
    assert_eq!(summary.checked, 0);
}

#[tokio::test]
async fn test_reconcile_expires_unanswerable_records() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 9_900, 10);
    let order = place_order(&env.state, 7, &product.id);
    let payment = open_payment(&env.state, 7, &order.id).await;

    // The fake cannot answer queries: before expiry the record is left alone.
    let grace = env.state.settings.reconcile_grace_secs;
    let summary = ledger::reconcile_payments_at(&env.state, payment.created_at + grace).await.unwrap();
    assert_eq!(summary.skipped, 1);

    let summary = ledger::reconcile_payments_at(&env.state, payment.expire_time + grace).await.unwrap();
    assert_eq!(summary.expired, 1);
    assert_eq!(ledger::get_payment(&env.state, 7, &payment.id).unwrap().status, PaymentStatus::Expired);
}

#[tokio::test]
async fn test_status_query_applies_terminal_answers() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 9_900, 10);
    let order = place_order(&env.state, 7, &product.id);
    let payment = open_payment(&env.state, 7, &order.id).await;

    // Unsupported query falls back to the stored row.
    let stored = ledger::query_payment_status(&env.state, 7, &payment.id).await.unwrap();
    assert_eq!(stored.status, PaymentStatus::Pending);

    env.fake.answer_queries(PaymentStatus::Success, payment.amount);
    let fresh = ledger::query_payment_status(&env.state, 7, &payment.id).await.unwrap();
    assert_eq!(fresh.status, PaymentStatus::Success);
    assert_eq!(orders::get_order(&env.state, 7, &order.id).unwrap().status, OrderStatus::Paid);
}

#[tokio::test]
async fn test_slow_status_queries_are_cut_off() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 9_900, 10);
    let order = place_order(&env.state, 7, &product.id);
    let payment = open_payment(&env.state, 7, &order.id).await;
    env.fake.answer_queries(PaymentStatus::Success, payment.amount);
    *env.fake.query_delay.lock().unwrap() = Duration::from_secs(30);

    let started = Instant::now();
    let stored = ledger::query_payment_status(&env.state, 7, &payment.id).await.unwrap();
    assert_eq!(stored.status, PaymentStatus::Pending);
    assert!(started.elapsed() < Duration::from_secs(5));
    // Every attempt in the retry budget timed out.
    assert_eq!(env.fake.query_calls.load(Ordering::SeqCst), 3);

    let started = Instant::now();
    let later = payment.created_at + env.state.settings.reconcile_grace_secs;
    let summary = ledger::reconcile_payments_at(&env.state, later).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(summary.checked, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(orders::get_order(&env.state, 7, &order.id).unwrap().status, OrderStatus::Pending);
}
