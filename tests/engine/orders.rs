//! Order creation, cancellation and expiry tests.

#[path = "../common/mod.rs"]
mod common;
use common::*;

#[test]
fn test_order_total_is_price_times_quantity() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 1_250, 10);

    let order = orders::create_order(&env.state, 7, &order_input(&product.id, 3)).unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.kind, OrderKind::Purchase);
    assert_eq!(order.unit_price, 1_250);
    assert_eq!(order.total_amount, 3_750);
    assert!(order.order_number.starts_with("ORDER"));
    assert_eq!(order.expire_time - order.created_at, env.state.settings.order_ttl_secs);

    let product = catalog::get_product(&env.state, &product.id).unwrap();
    assert_eq!(product.stock, 7);
    assert_eq!(product.sold_count, 3);
}

#[test]
fn test_sku_price_overrides_product_price() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);
    let sku = catalog::create_sku(
        &env.state,
        &plan.id,
        &CreateSku {
            name: "Yearly".into(),
            price: 99_000,
        },
    )
    .unwrap();

    let mut input = order_input(&plan.id, 1);
    input.sku_id = Some(sku.id.clone());
    let order = orders::create_order(&env.state, 7, &input).unwrap();
    assert_eq!(order.total_amount, 99_000);
    assert_eq!(order.sku_id.as_deref(), Some(sku.id.as_str()));
}

#[test]
fn test_insufficient_stock_leaves_no_order() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 500, 2);

    let err = orders::create_order(&env.state, 7, &order_input(&product.id, 3)).unwrap_err();
    assert!(matches!(err, AppError::InsufficientStock));

    let page = orders::list_user_orders(&env.state, 7, &Default::default()).unwrap();
    assert_eq!(page.total, 0);
    assert_eq!(catalog::get_product(&env.state, &product.id).unwrap().stock, 2);
}

#[test]
fn test_rejects_bad_input() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 500, 2);

    let err = orders::create_order(&env.state, 7, &order_input(&product.id, 0)).unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let err = orders::create_order(&env.state, 7, &order_input("pf_prod_00000000000000000000000000000000", 1))
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    catalog::set_product_status(&env.state, &product.id, ProductStatus::Inactive).unwrap();
    let err = orders::create_order(&env.state, 7, &order_input(&product.id, 1)).unwrap_err();
    assert!(matches!(err, AppError::NotEligible(_)));
}

#[test]
fn test_total_overflow_is_rejected() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", i64::MAX / 2, i64::MAX);

    let err = orders::create_order(&env.state, 7, &order_input(&product.id, 3)).unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[test]
fn test_orders_are_private_to_their_owner() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 500, 2);
    let order = place_order(&env.state, 7, &product.id);

    assert!(orders::get_order(&env.state, 7, &order.id).is_ok());
    assert!(orders::get_order_by_number(&env.state, 7, &order.order_number).is_ok());
    assert!(matches!(
        orders::get_order(&env.state, 8, &order.id),
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        orders::cancel_order(&env.state, 8, &order.id),
        Err(AppError::NotFound(_))
    ));
}

#[test]
fn test_cancel_releases_stock_once() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 500, 5);
    let order = orders::create_order(&env.state, 7, &order_input(&product.id, 2)).unwrap();

    let canceled = orders::cancel_order(&env.state, 7, &order.id).unwrap();
    assert_eq!(canceled.status, OrderStatus::Canceled);
    assert_eq!(catalog::get_product(&env.state, &product.id).unwrap().stock, 5);

    let err = orders::cancel_order(&env.state, 7, &order.id).unwrap_err();
    assert!(matches!(err, AppError::OrderNotPending));
    assert_eq!(catalog::get_product(&env.state, &product.id).unwrap().stock, 5);
}

#[test]
fn test_expiry_sweep_releases_stock_and_is_idempotent() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 500, 5);
    let order = orders::create_order(&env.state, 7, &order_input(&product.id, 2)).unwrap();

    let mut conn = env.state.db.get().unwrap();
    assert_eq!(orders::expire_orders_at(&mut conn, order.expire_time - 1).unwrap(), 0);
    assert_eq!(orders::expire_orders_at(&mut conn, order.expire_time).unwrap(), 1);
    assert_eq!(orders::expire_orders_at(&mut conn, order.expire_time + 60).unwrap(), 0);

    let order = queries::get_order(&conn, &order.id).unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Expired);
    assert_eq!(queries::get_product(&conn, &product.id).unwrap().unwrap().stock, 5);
}

#[test]
fn test_concurrent_orders_never_oversell() {
    use std::sync::{Arc, Barrier};
    use std::thread;

    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 500, 5);

    let barrier = Arc::new(Barrier::new(10));
    let handles: Vec<_> = (0..10)
        .map(|i| {
            let state = env.state.clone();
            let barrier = barrier.clone();
            let product_id = product.id.clone();
            thread::spawn(move || {
                barrier.wait();
                orders::create_order(&state, 100 + i, &order_input(&product_id, 1)).is_ok()
            })
        })
        .collect();

    let created = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
    assert_eq!(created, 5);
    assert_eq!(catalog::get_product(&env.state, &product.id).unwrap().stock, 0);
}
