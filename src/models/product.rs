use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use crate::error::{AppError, Result, msg};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProductType {
    OneTime,
    Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProductStatus {
    Active,
    Inactive,
}

/// A purchasable catalog entry. Subscription products double as plans:
/// `level` orders plans for upgrade/downgrade and the quota/limit fields are
/// copied onto the subscription when it is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Price in minor currency units
    pub price: i64,
    pub currency: String,
    pub product_type: ProductType,
    /// Plan duration in seconds. 0 = perpetual.
    pub duration_secs: i64,
    pub level: i32,
    pub free_trial_days: i32,
    pub stock: i64,
    pub quota: i64,
    pub max_roles: i32,
    pub max_contexts: i32,
    pub available_models: Vec<String>,
    pub status: ProductStatus,
    pub sold_count: i64,
    pub view_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Product {
    pub fn is_subscription(&self) -> bool {
        self.product_type == ProductType::Subscription
    }

    pub fn is_active(&self) -> bool {
        self.status == ProductStatus::Active
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProduct {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: i64,
    pub currency: String,
    pub product_type: ProductType,
    #[serde(default)]
    pub duration_secs: i64,
    #[serde(default)]
    pub level: i32,
    #[serde(default)]
    pub free_trial_days: i32,
    #[serde(default)]
    pub stock: i64,
    #[serde(default)]
    pub quota: i64,
    #[serde(default)]
    pub max_roles: i32,
    #[serde(default)]
    pub max_contexts: i32,
    #[serde(default)]
    pub available_models: Vec<String>,
}

impl CreateProduct {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::BadRequest(msg::NAME_EMPTY.into()));
        }
        if self.currency.trim().is_empty() {
            return Err(AppError::BadRequest(msg::CURRENCY_EMPTY.into()));
        }
        if self.price < 0 || self.stock < 0 || self.quota < 0 || self.duration_secs < 0 {
            return Err(AppError::BadRequest(
                "price, stock, quota and duration must not be negative".into(),
            ));
        }
        if self.free_trial_days < 0 {
            return Err(AppError::BadRequest("free_trial_days must not be negative".into()));
        }
        Ok(())
    }
}

/// Price variant of a product (e.g. monthly vs. yearly billing of the same plan).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSku {
    pub id: String,
    pub product_id: String,
    pub name: String,
    pub price: i64,
    pub status: ProductStatus,
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSku {
    pub name: String,
    pub price: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProductFilter {
    pub product_type: Option<ProductType>,
    #[serde(default)]
    pub include_inactive: bool,
}
