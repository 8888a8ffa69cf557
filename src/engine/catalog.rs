use crate::db::{AppState, queries};
use crate::error::{AppError, OptionExt, Result, msg};
use crate::models::{CreateProduct, CreateSku, Product, ProductFilter, ProductSku, ProductStatus};

pub fn create_product(state: &AppState, input: &CreateProduct) -> Result<Product> {
    input.validate()?;
    let conn = state.db.get()?;
    let product = queries::create_product(&conn, input)?;
    tracing::info!(
        "Created {} product {} ({})",
        product.product_type.as_ref(),
        product.id,
        product.name
    );
    Ok(product)
}

pub fn get_product(state: &AppState, id: &str) -> Result<Product> {
    let conn = state.db.get()?;
    queries::get_product(&conn, id)?.or_not_found(msg::PRODUCT_NOT_FOUND)
}

/// Product detail as shown to a buyer. Counts the view on a best-effort basis.
pub fn view_product(state: &AppState, id: &str) -> Result<Product> {
    let conn = state.db.get()?;
    let product = queries::get_product(&conn, id)?.or_not_found(msg::PRODUCT_NOT_FOUND)?;
    if let Err(e) = queries::increment_view_count(&conn, id) {
        tracing::warn!("Failed to count view of product {}: {}", id, e);
    }
    Ok(product)
}

pub fn list_products(state: &AppState, filter: &ProductFilter) -> Result<Vec<Product>> {
    let conn = state.db.get()?;
    queries::list_products(&conn, filter)
}

pub fn set_product_status(state: &AppState, id: &str, status: ProductStatus) -> Result<Product> {
    let conn = state.db.get()?;
    if !queries::set_product_status(&conn, id, status)? {
        return Err(AppError::NotFound(msg::PRODUCT_NOT_FOUND));
    }
    tracing::info!("Product {} is now {}", id, status.as_ref());
    queries::get_product(&conn, id)?.or_not_found(msg::PRODUCT_NOT_FOUND)
}

pub fn check_stock(state: &AppState, id: &str, quantity: i64) -> Result<bool> {
    let conn = state.db.get()?;
    queries::check_stock(&conn, id, quantity)
}

/// Reserve `quantity` units. Never takes stock below zero.
pub fn decrease_stock(state: &AppState, id: &str, quantity: i64) -> Result<()> {
    if quantity < 1 {
        return Err(AppError::BadRequest(msg::INVALID_QUANTITY.into()));
    }
    let conn = state.db.get()?;
    if queries::decrease_stock(&conn, id, quantity)? {
        return Ok(());
    }
    match queries::get_product(&conn, id)? {
        Some(_) => Err(AppError::InsufficientStock),
        None => Err(AppError::NotFound(msg::PRODUCT_NOT_FOUND)),
    }
}

pub fn increase_stock(state: &AppState, id: &str, quantity: i64) -> Result<()> {
    if quantity < 1 {
        return Err(AppError::BadRequest(msg::INVALID_QUANTITY.into()));
    }
    let conn = state.db.get()?;
    if !queries::increase_stock(&conn, id, quantity)? {
        return Err(AppError::NotFound(msg::PRODUCT_NOT_FOUND));
    }
    Ok(())
}

pub fn create_sku(state: &AppState, product_id: &str, input: &CreateSku) -> Result<ProductSku> {
    if input.name.trim().is_empty() {
        return Err(AppError::BadRequest(msg::NAME_EMPTY.into()));
    }
    if input.price < 0 {
        return Err(AppError::BadRequest(msg::INVALID_AMOUNT.into()));
    }
    let conn = state.db.get()?;
    queries::get_product(&conn, product_id)?.or_not_found(msg::PRODUCT_NOT_FOUND)?;
    queries::create_sku(&conn, product_id, input)
}

pub fn get_sku(state: &AppState, id: &str) -> Result<ProductSku> {
    let conn = state.db.get()?;
    queries::get_sku(&conn, id)?.or_not_found(msg::SKU_NOT_FOUND)
}

pub fn list_skus(state: &AppState, product_id: &str) -> Result<Vec<ProductSku>> {
    let conn = state.db.get()?;
    queries::get_product(&conn, product_id)?.or_not_found(msg::PRODUCT_NOT_FOUND)?;
    queries::list_skus(&conn, product_id)
}
