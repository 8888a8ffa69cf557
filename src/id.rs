//! Prefixed ID and order number generation.
//!
//! Entity IDs use a `pf_` brand prefix so they can never be confused with
//! provider-side identifiers (`pi_`, trade numbers, transaction ids).
//!
//! Format: `pf_{entity}_{uuid_simple}` (32 hex chars, no hyphens)

use chrono::{TimeZone, Utc};
use rand::RngCore;
use uuid::Uuid;

/// All known entity prefixes for validation.
const ALL_PREFIXES: &[&str] = &["pf_prod_", "pf_sku_", "pf_ord_", "pf_pay_", "pf_sub_", "pf_act_"];

/// Prefix of every generated order number.
pub const ORDER_NUMBER_PREFIX: &str = "ORDER";

/// Validate that a string is a well-formed prefixed ID.
///
/// Cheap rejection of garbage path parameters before hitting the database.
pub fn is_valid_prefixed_id(s: &str) -> bool {
    let Some(prefix) = ALL_PREFIXES.iter().find(|p| s.starts_with(*p)) else {
        return false;
    };

    let hex_part = &s[prefix.len()..];
    hex_part.len() == 32 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Clone, Copy)]
pub enum EntityType {
    Product,
    Sku,
    Order,
    Payment,
    Subscription,
    Activity,
}

impl EntityType {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Product => "pf_prod",
            Self::Sku => "pf_sku",
            Self::Order => "pf_ord",
            Self::Payment => "pf_pay",
            Self::Subscription => "pf_sub",
            Self::Activity => "pf_act",
        }
    }

    pub fn gen_id(&self) -> String {
        format!("{}_{}", self.prefix(), Uuid::new_v4().as_simple())
    }
}

/// Generate a human-quotable order number: `ORDER<yyyymmddHHMMSS><16 hex>`.
///
/// 64 random bits per second keeps collisions negligible; the UNIQUE
/// constraint on `orders.order_number` turns any collision into a hard error.
pub fn gen_order_number(now: i64) -> String {
    let stamp = Utc
        .timestamp_opt(now, 0)
        .single()
        .map(|dt| dt.format("%Y%m%d%H%M%S").to_string())
        .unwrap_or_else(|| now.to_string());
    let mut suffix = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!("{}{}{}", ORDER_NUMBER_PREFIX, stamp, hex::encode(suffix))
}
