//! Catalog and stock tests.

#[path = "../common/mod.rs"]
mod common;
use common::*;

#[test]
fn test_create_product_rejects_invalid_input() {
    let env = test_env();

    let mut input = plan_input("", 100, 1);
    let err = catalog::create_product(&env.state, &input).unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    input.name = "Pro".into();
    input.price = -1;
    let err = catalog::create_product(&env.state, &input).unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[test]
fn test_stock_never_goes_negative() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 500, 3);

    assert!(catalog::check_stock(&env.state, &product.id, 3).unwrap());
    assert!(!catalog::check_stock(&env.state, &product.id, 4).unwrap());

    catalog::decrease_stock(&env.state, &product.id, 2).unwrap();
    let err = catalog::decrease_stock(&env.state, &product.id, 2).unwrap_err();
    assert!(matches!(err, AppError::InsufficientStock));

    let product = catalog::get_product(&env.state, &product.id).unwrap();
    assert_eq!(product.stock, 1);

    catalog::increase_stock(&env.state, &product.id, 4).unwrap();
    assert_eq!(catalog::get_product(&env.state, &product.id).unwrap().stock, 5);
}

#[test]
fn test_stock_ops_on_missing_product() {
    let env = test_env();
    let err = catalog::decrease_stock(&env.state, "pf_prod_00000000000000000000000000000000", 1).unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    let err = catalog::increase_stock(&env.state, "pf_prod_00000000000000000000000000000000", 1).unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[test]
fn test_view_counts_and_inactive_products_are_hidden() {
    let env = test_env();
    let product = create_one_time(&env.state, "Pack", 500, 3);

    catalog::view_product(&env.state, &product.id).unwrap();
    catalog::view_product(&env.state, &product.id).unwrap();
    assert_eq!(catalog::get_product(&env.state, &product.id).unwrap().view_count, 2);

    catalog::set_product_status(&env.state, &product.id, ProductStatus::Inactive).unwrap();
    let listed = catalog::list_products(&env.state, &ProductFilter::default()).unwrap();
    assert!(listed.iter().all(|p| p.id != product.id));

    let all = catalog::list_products(
        &env.state,
        &ProductFilter {
            product_type: None,
            include_inactive: true,
        },
    )
    .unwrap();
    assert!(all.iter().any(|p| p.id == product.id));
}

#[test]
fn test_skus_belong_to_their_product() {
    let env = test_env();
    let plan = create_plan(&env.state, "Pro", 9_900, 1);

    let yearly = catalog::create_sku(
        &env.state,
        &plan.id,
        &CreateSku {
            name: "Yearly".into(),
            price: 99_000,
        },
    )
    .unwrap();
    assert_eq!(yearly.product_id, plan.id);

    let skus = catalog::list_skus(&env.state, &plan.id).unwrap();
    assert_eq!(skus.len(), 1);
    assert_eq!(catalog::get_sku(&env.state, &yearly.id).unwrap().price, 99_000);
}
