//! Row mapping trait and helpers for reducing boilerplate in queries.
//!
//! Models implement `FromRow` against the column order of the matching
//! `*_COLS` constant; `query_one` / `query_all` do the rest.

use rusqlite::{Connection, OptionalExtension, Row, ToSql};

use crate::models::*;

/// Parse a TEXT column into an enum, surfacing bad values as a column type error
/// instead of panicking.
fn parse_enum<T: std::str::FromStr>(row: &Row, col: usize, col_name: &str) -> rusqlite::Result<T> {
    row.get::<_, String>(col)?.parse::<T>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(col, col_name.to_string(), rusqlite::types::Type::Text)
    })
}

/// Parse a JSON array column (model lists).
fn parse_string_list(row: &Row, col: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(col)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e)))
}

/// Trait for constructing a type from a database row.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

/// Query for a single optional result.
pub fn query_one<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Option<T>> {
    conn.query_row(sql, params, T::from_row)
        .optional()
        .map_err(Into::into)
}

/// Query for multiple results.
pub fn query_all<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, T::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============ SQL SELECT Constants ============

pub const PRODUCT_COLS: &str = "id, name, description, price, currency, product_type, duration_secs, level, free_trial_days, stock, quota, max_roles, max_contexts, available_models, status, sold_count, view_count, created_at, updated_at";

pub const SKU_COLS: &str = "id, product_id, name, price, status, created_at";

pub const ORDER_COLS: &str = "id, order_number, user_id, product_id, sku_id, quantity, unit_price, total_amount, currency, status, kind, subscription_id, payment_method, expire_time, paid_at, refund_amount, refund_reason, refunded_at, created_at, updated_at";

pub const PAYMENT_RECORD_COLS: &str = "id, order_id, user_id, provider, provider_order_id, transaction_id, amount, currency, status, retry_count, risk_level, risk_score, payment_url, qr_code_url, refund_id, expire_time, payment_time, created_at, updated_at";

pub const SUBSCRIPTION_COLS: &str = "id, user_id, plan_id, order_id, status, start_time, end_time, trial_start_time, trial_end_time, auto_renew, quota_used, quota_limit, max_roles, max_contexts, available_models, amount, currency, cancel_reason, canceled_by, canceled_at, version, created_at, updated_at";

pub const ACTIVITY_COLS: &str = "id, user_id, activity_type, subscription_id, title, description, amount, priority, is_read, is_resolved, created_at";

// ============ FromRow Implementations ============

impl FromRow for Product {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Product {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            price: row.get(3)?,
            currency: row.get(4)?,
            product_type: parse_enum(row, 5, "product_type")?,
            duration_secs: row.get(6)?,
            level: row.get(7)?,
            free_trial_days: row.get(8)?,
            stock: row.get(9)?,
            quota: row.get(10)?,
            max_roles: row.get(11)?,
            max_contexts: row.get(12)?,
            available_models: parse_string_list(row, 13)?,
            status: parse_enum(row, 14, "status")?,
            sold_count: row.get(15)?,
            view_count: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }
}

impl FromRow for ProductSku {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(ProductSku {
            id: row.get(0)?,
            product_id: row.get(1)?,
            name: row.get(2)?,
            price: row.get(3)?,
            status: parse_enum(row, 4, "status")?,
            created_at: row.get(5)?,
        })
    }
}

impl FromRow for Order {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Order {
            id: row.get(0)?,
            order_number: row.get(1)?,
            user_id: row.get(2)?,
            product_id: row.get(3)?,
            sku_id: row.get(4)?,
            quantity: row.get(5)?,
            unit_price: row.get(6)?,
            total_amount: row.get(7)?,
            currency: row.get(8)?,
            status: parse_enum(row, 9, "status")?,
            kind: parse_enum(row, 10, "kind")?,
            subscription_id: row.get(11)?,
            payment_method: row.get(12)?,
            expire_time: row.get(13)?,
            paid_at: row.get(14)?,
            refund_amount: row.get(15)?,
            refund_reason: row.get(16)?,
            refunded_at: row.get(17)?,
            created_at: row.get(18)?,
            updated_at: row.get(19)?,
        })
    }
}

impl FromRow for PaymentRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(PaymentRecord {
            id: row.get(0)?,
            order_id: row.get(1)?,
            user_id: row.get(2)?,
            provider: row.get(3)?,
            provider_order_id: row.get(4)?,
            transaction_id: row.get(5)?,
            amount: row.get(6)?,
            currency: row.get(7)?,
            status: parse_enum(row, 8, "status")?,
            retry_count: row.get(9)?,
            risk_level: parse_enum(row, 10, "risk_level")?,
            risk_score: row.get(11)?,
            payment_url: row.get(12)?,
            qr_code_url: row.get(13)?,
            refund_id: row.get(14)?,
            expire_time: row.get(15)?,
            payment_time: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }
}

impl FromRow for Subscription {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Subscription {
            id: row.get(0)?,
            user_id: row.get(1)?,
            plan_id: row.get(2)?,
            order_id: row.get(3)?,
            status: parse_enum(row, 4, "status")?,
            start_time: row.get(5)?,
            end_time: row.get(6)?,
            trial_start_time: row.get(7)?,
            trial_end_time: row.get(8)?,
            auto_renew: row.get::<_, i32>(9)? != 0,
            quota_used: row.get(10)?,
            quota_limit: row.get(11)?,
            max_roles: row.get(12)?,
            max_contexts: row.get(13)?,
            available_models: parse_string_list(row, 14)?,
            amount: row.get(15)?,
            currency: row.get(16)?,
            cancel_reason: row.get(17)?,
            canceled_by: row.get(18)?,
            canceled_at: row.get(19)?,
            version: row.get(20)?,
            created_at: row.get(21)?,
            updated_at: row.get(22)?,
        })
    }
}

impl FromRow for UserActivity {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(UserActivity {
            id: row.get(0)?,
            user_id: row.get(1)?,
            activity_type: parse_enum(row, 2, "activity_type")?,
            subscription_id: row.get(3)?,
            title: row.get(4)?,
            description: row.get(5)?,
            amount: row.get(6)?,
            priority: parse_enum(row, 7, "priority")?,
            is_read: row.get::<_, i32>(8)? != 0,
            is_resolved: row.get::<_, i32>(9)? != 0,
            created_at: row.get(10)?,
        })
    }
}
