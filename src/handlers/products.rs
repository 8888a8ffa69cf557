use axum::extract::State;
use serde::{Deserialize, Serialize};

use crate::db::AppState;
use crate::engine::catalog;
use crate::error::Result;
use crate::extractors::{Json, Path, Query};
use crate::models::{CreateProduct, CreateSku, Product, ProductFilter, ProductSku, ProductStatus};

#[derive(Debug, Deserialize)]
pub struct SetProductStatus {
    pub status: ProductStatus,
}

#[derive(Debug, Deserialize)]
pub struct StockQuery {
    #[serde(default = "one")]
    pub quantity: i64,
}

fn one() -> i64 {
    1
}

#[derive(Debug, Serialize)]
pub struct StockResponse {
    pub product_id: String,
    pub quantity: i64,
    pub available: bool,
}

pub async fn create_product(
    State(state): State<AppState>,
    Json(input): Json<CreateProduct>,
) -> Result<Json<Product>> {
    Ok(Json(catalog::create_product(&state, &input)?))
}

pub async fn list_products(
    State(state): State<AppState>,
    Query(filter): Query<ProductFilter>,
) -> Result<Json<Vec<Product>>> {
    Ok(Json(catalog::list_products(&state, &filter)?))
}

pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Product>> {
    Ok(Json(catalog::view_product(&state, &id)?))
}

pub async fn set_product_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<SetProductStatus>,
) -> Result<Json<Product>> {
    Ok(Json(catalog::set_product_status(&state, &id, input.status)?))
}

pub async fn check_stock(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StockQuery>,
) -> Result<Json<StockResponse>> {
    let available = catalog::check_stock(&state, &id, query.quantity)?;
    Ok(Json(StockResponse {
        product_id: id,
        quantity: query.quantity,
        available,
    }))
}

pub async fn create_sku(
    State(state): State<AppState>,
    Path(product_id): Path<String>,
    Json(input): Json<CreateSku>,
) -> Result<Json<ProductSku>> {
    Ok(Json(catalog::create_sku(&state, &product_id, &input)?))
}

pub async fn list_skus(
    State(state): State<AppState>,
    Path(product_id): Path<String>,
) -> Result<Json<Vec<ProductSku>>> {
    Ok(Json(catalog::list_skus(&state, &product_id)?))
}

pub async fn get_sku(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ProductSku>> {
    Ok(Json(catalog::get_sku(&state, &id)?))
}
