use chrono::Utc;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params, types::Value};

use crate::error::{AppError, Result};
use crate::id::EntityType;
use crate::models::*;
use crate::pagination::PageParams;

use super::from_row::{
    ACTIVITY_COLS, FromRow, ORDER_COLS, PAYMENT_RECORD_COLS, PRODUCT_COLS, SKU_COLS,
    SUBSCRIPTION_COLS, query_all, query_one,
};

fn now() -> i64 {
    Utc::now().timestamp()
}

fn is_unique_violation(err: &rusqlite::Error, needle: &str) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) && err.to_string().contains(needle)
}

/// Builder for dynamic UPDATE statements.
///
/// Guards turn the update into a compare-and-set: the statement only matches
/// when every guarded column still holds the expected value, and `execute`
/// reports whether a row was changed.
struct UpdateBuilder {
    table: &'static str,
    id: String,
    fields: Vec<(&'static str, Value)>,
    guards: Vec<(&'static str, Value)>,
    track_updated_at: bool,
    bump_version: bool,
}

impl UpdateBuilder {
    fn new(table: &'static str, id: &str) -> Self {
        Self {
            table,
            id: id.to_string(),
            fields: Vec::new(),
            guards: Vec::new(),
            track_updated_at: false,
            bump_version: false,
        }
    }

    fn with_updated_at(mut self) -> Self {
        self.track_updated_at = true;
        self
    }

    /// Increment the `version` column alongside the update.
    fn bump_version(mut self) -> Self {
        self.bump_version = true;
        self
    }

    fn set(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.fields.push((column, value.into()));
        self
    }

    fn set_opt<V: Into<Value>>(self, column: &'static str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.set(column, v),
            None => self,
        }
    }

    /// Set a column to an explicit value (including NULL).
    fn set_nullable<V: Into<Value>>(mut self, column: &'static str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.fields.push((column, v.into())),
            None => self.fields.push((column, Value::Null)),
        }
        self
    }

    /// Only match the row while `column` still equals `value`.
    fn guard(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.guards.push((column, value.into()));
        self
    }

    fn execute(mut self, conn: &Connection) -> Result<bool> {
        if self.fields.is_empty() {
            return Ok(false);
        }
        if self.track_updated_at {
            self.fields.push(("updated_at", now().into()));
        }
        let mut sets: Vec<String> = self
            .fields
            .iter()
            .map(|(col, _)| format!("{} = ?", col))
            .collect();
        if self.bump_version {
            sets.push("version = version + 1".to_string());
        }
        let mut where_clause = String::from("id = ?");
        for (col, _) in &self.guards {
            where_clause.push_str(&format!(" AND {} = ?", col));
        }

        let mut values: Vec<Value> = self.fields.into_iter().map(|(_, v)| v).collect();
        values.push(self.id.into());
        values.extend(self.guards.into_iter().map(|(_, v)| v));

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.table,
            sets.join(", "),
            where_clause
        );
        let affected = conn.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(affected > 0)
    }
}

// ============ Products ============

pub fn create_product(conn: &Connection, input: &CreateProduct) -> Result<Product> {
    let id = EntityType::Product.gen_id();
    let now = now();
    let models = serde_json::to_string(&input.available_models)?;

    conn.execute(
        "INSERT INTO products (id, name, description, price, currency, product_type, duration_secs, level, free_trial_days, stock, quota, max_roles, max_contexts, available_models, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 'active', ?15, ?15)",
        params![
            &id,
            &input.name,
            &input.description,
            input.price,
            &input.currency,
            input.product_type.as_ref(),
            input.duration_secs,
            input.level,
            input.free_trial_days,
            input.stock,
            input.quota,
            input.max_roles,
            input.max_contexts,
            &models,
            now,
        ],
    )?;

    Ok(Product {
        id,
        name: input.name.clone(),
        description: input.description.clone(),
        price: input.price,
        currency: input.currency.clone(),
        product_type: input.product_type,
        duration_secs: input.duration_secs,
        level: input.level,
        free_trial_days: input.free_trial_days,
        stock: input.stock,
        quota: input.quota,
        max_roles: input.max_roles,
        max_contexts: input.max_contexts,
        available_models: input.available_models.clone(),
        status: ProductStatus::Active,
        sold_count: 0,
        view_count: 0,
        created_at: now,
        updated_at: now,
    })
}

pub fn get_product(conn: &Connection, id: &str) -> Result<Option<Product>> {
    query_one(
        conn,
        &format!("SELECT {} FROM products WHERE id = ?1", PRODUCT_COLS),
        &[&id],
    )
}

pub fn list_products(conn: &Connection, filter: &ProductFilter) -> Result<Vec<Product>> {
    let mut sql = format!("SELECT {} FROM products WHERE 1=1", PRODUCT_COLS);
    let mut values: Vec<Value> = Vec::new();
    if let Some(product_type) = filter.product_type {
        sql.push_str(" AND product_type = ?");
        values.push(product_type.as_ref().to_string().into());
    }
    if !filter.include_inactive {
        sql.push_str(" AND status = 'active'");
    }
    sql.push_str(" ORDER BY level ASC, price ASC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(values), Product::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn set_product_status(conn: &Connection, id: &str, status: ProductStatus) -> Result<bool> {
    UpdateBuilder::new("products", id)
        .with_updated_at()
        .set("status", status.as_ref().to_string())
        .execute(conn)
}

pub fn check_stock(conn: &Connection, id: &str, quantity: i64) -> Result<bool> {
    let stock: Option<i64> = conn
        .query_row("SELECT stock FROM products WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(stock.is_some_and(|s| s >= quantity))
}

/// Atomically reserve stock. Returns false (and changes nothing) when fewer
/// than `quantity` units remain.
pub fn decrease_stock(conn: &Connection, id: &str, quantity: i64) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE products SET stock = stock - ?1, updated_at = ?2 WHERE id = ?3 AND stock >= ?1",
        params![quantity, now(), id],
    )?;
    Ok(affected > 0)
}

pub fn increase_stock(conn: &Connection, id: &str, quantity: i64) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE products SET stock = stock + ?1, updated_at = ?2 WHERE id = ?3",
        params![quantity, now(), id],
    )?;
    Ok(affected > 0)
}

pub fn increment_sold_count(conn: &Connection, id: &str, quantity: i64) -> Result<()> {
    conn.execute(
        "UPDATE products SET sold_count = sold_count + ?1 WHERE id = ?2",
        params![quantity, id],
    )?;
    Ok(())
}

pub fn increment_view_count(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE products SET view_count = view_count + 1 WHERE id = ?1",
        params![id],
    )?;
    Ok(())
}

// ============ SKUs ============

pub fn create_sku(conn: &Connection, product_id: &str, input: &CreateSku) -> Result<ProductSku> {
    let id = EntityType::Sku.gen_id();
    let now = now();
    conn.execute(
        "INSERT INTO product_skus (id, product_id, name, price, status, created_at)
         VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
        params![&id, product_id, &input.name, input.price, now],
    )?;
    Ok(ProductSku {
        id,
        product_id: product_id.to_string(),
        name: input.name.clone(),
        price: input.price,
        status: ProductStatus::Active,
        created_at: now,
    })
}

pub fn get_sku(conn: &Connection, id: &str) -> Result<Option<ProductSku>> {
    query_one(
        conn,
        &format!("SELECT {} FROM product_skus WHERE id = ?1", SKU_COLS),
        &[&id],
    )
}

pub fn list_skus(conn: &Connection, product_id: &str) -> Result<Vec<ProductSku>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM product_skus WHERE product_id = ?1 ORDER BY price ASC",
            SKU_COLS
        ),
        &[&product_id],
    )
}

// ============ Orders ============

/// Insert a new order. A duplicate order number is reported as
/// `OrderNumberCollision`; the existing row is never touched.
pub fn insert_order(conn: &Connection, order: &Order) -> Result<()> {
    conn.execute(
        "INSERT INTO orders (id, order_number, user_id, product_id, sku_id, quantity, unit_price, total_amount, currency, status, kind, subscription_id, payment_method, expire_time, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
        params![
            &order.id,
            &order.order_number,
            order.user_id,
            &order.product_id,
            &order.sku_id,
            order.quantity,
            order.unit_price,
            order.total_amount,
            &order.currency,
            order.status.as_ref(),
            order.kind.as_ref(),
            &order.subscription_id,
            &order.payment_method,
            order.expire_time,
            order.created_at,
        ],
    )
    .map_err(|e| {
        if is_unique_violation(&e, "orders.order_number") {
            AppError::OrderNumberCollision(order.order_number.clone())
        } else {
            e.into()
        }
    })?;
    Ok(())
}

pub fn get_order(conn: &Connection, id: &str) -> Result<Option<Order>> {
    query_one(
        conn,
        &format!("SELECT {} FROM orders WHERE id = ?1", ORDER_COLS),
        &[&id],
    )
}

pub fn get_order_by_number(conn: &Connection, order_number: &str) -> Result<Option<Order>> {
    query_one(
        conn,
        &format!("SELECT {} FROM orders WHERE order_number = ?1", ORDER_COLS),
        &[&order_number],
    )
}

pub fn list_user_orders(
    conn: &Connection,
    user_id: i64,
    limit: i64,
    offset: i64,
) -> Result<(Vec<Order>, i64)> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM orders WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    let orders = query_all(
        conn,
        &format!(
            "SELECT {} FROM orders WHERE user_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
            ORDER_COLS
        ),
        &[&user_id, &limit, &offset],
    )?;
    Ok((orders, total))
}

/// Compare-and-set an order's status. Returns false when the order is no
/// longer in `from`.
pub fn transition_order(
    conn: &Connection,
    id: &str,
    from: OrderStatus,
    to: OrderStatus,
) -> Result<bool> {
    if !from.can_transition_to(to) {
        return Err(AppError::Invariant(format!(
            "illegal order transition {} -> {}",
            from.as_ref(),
            to.as_ref()
        )));
    }
    UpdateBuilder::new("orders", id)
        .with_updated_at()
        .set("status", to.as_ref().to_string())
        .guard("status", from.as_ref().to_string())
        .execute(conn)
}

pub fn mark_order_paid(conn: &Connection, id: &str, paid_at: i64) -> Result<bool> {
    UpdateBuilder::new("orders", id)
        .with_updated_at()
        .set("status", OrderStatus::Paid.as_ref().to_string())
        .set("paid_at", paid_at)
        .guard("status", OrderStatus::Pending.as_ref().to_string())
        .execute(conn)
}

pub fn mark_order_refunded(
    conn: &Connection,
    id: &str,
    amount: i64,
    reason: Option<&str>,
    refunded_at: i64,
) -> Result<bool> {
    UpdateBuilder::new("orders", id)
        .with_updated_at()
        .set("status", OrderStatus::Refunded.as_ref().to_string())
        .set("refund_amount", amount)
        .set_nullable("refund_reason", reason.map(str::to_string))
        .set("refunded_at", refunded_at)
        .guard("status", OrderStatus::Paid.as_ref().to_string())
        .execute(conn)
}

pub fn list_expired_pending_orders(conn: &Connection, now: i64, limit: i64) -> Result<Vec<Order>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM orders WHERE status = 'pending' AND expire_time < ?1 ORDER BY expire_time ASC LIMIT ?2",
            ORDER_COLS
        ),
        &[&now, &limit],
    )
}

/// The newest unpaid, unexpired order of `kind` raised for a subscription.
pub fn find_open_subscription_order(
    conn: &Connection,
    subscription_id: &str,
    kind: OrderKind,
    now: i64,
) -> Result<Option<Order>> {
    let kind = kind.as_ref();
    query_one(
        conn,
        &format!(
            "SELECT {} FROM orders WHERE subscription_id = ?1 AND kind = ?2 AND status = 'pending' AND expire_time > ?3 ORDER BY created_at DESC LIMIT 1",
            ORDER_COLS
        ),
        &[&subscription_id, &kind, &now],
    )
}

pub fn list_pending_subscription_orders(conn: &Connection, subscription_id: &str) -> Result<Vec<Order>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM orders WHERE subscription_id = ?1 AND status = 'pending' ORDER BY created_at ASC",
            ORDER_COLS
        ),
        &[&subscription_id],
    )
}

// ============ Payment Records ============

pub fn insert_payment_record(
    conn: &Connection,
    input: &NewPaymentRecord,
) -> Result<PaymentRecord> {
    let id = EntityType::Payment.gen_id();
    let now = now();
    let risk_level = RiskLevel::from_score(input.risk_score);

    conn.execute(
        "INSERT INTO payment_records (id, order_id, user_id, provider, amount, currency, status, retry_count, risk_level, risk_score, expire_time, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?8, ?9, ?10, ?10)",
        params![
            &id,
            &input.order_id,
            input.user_id,
            &input.provider,
            input.amount,
            &input.currency,
            risk_level.as_ref(),
            input.risk_score,
            input.expire_time,
            now,
        ],
    )?;

    Ok(PaymentRecord {
        id,
        order_id: input.order_id.clone(),
        user_id: input.user_id,
        provider: input.provider.clone(),
        provider_order_id: None,
        transaction_id: None,
        amount: input.amount,
        currency: input.currency.clone(),
        status: PaymentStatus::Pending,
        retry_count: 0,
        risk_level,
        risk_score: input.risk_score,
        payment_url: None,
        qr_code_url: None,
        refund_id: None,
        expire_time: input.expire_time,
        payment_time: None,
        created_at: now,
        updated_at: now,
    })
}

pub fn get_payment_record(conn: &Connection, id: &str) -> Result<Option<PaymentRecord>> {
    query_one(
        conn,
        &format!("SELECT {} FROM payment_records WHERE id = ?1", PAYMENT_RECORD_COLS),
        &[&id],
    )
}

pub fn get_payment_by_provider_order(
    conn: &Connection,
    provider: &str,
    provider_order_id: &str,
) -> Result<Option<PaymentRecord>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM payment_records WHERE provider = ?1 AND provider_order_id = ?2",
            PAYMENT_RECORD_COLS
        ),
        &[&provider, &provider_order_id],
    )
}

pub fn list_payments_for_order(conn: &Connection, order_id: &str) -> Result<Vec<PaymentRecord>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM payment_records WHERE order_id = ?1 ORDER BY created_at ASC, id ASC",
            PAYMENT_RECORD_COLS
        ),
        &[&order_id],
    )
}

pub fn count_payments_for_order(conn: &Connection, order_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM payment_records WHERE order_id = ?1",
        params![order_id],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

pub fn find_success_payment(conn: &Connection, order_id: &str) -> Result<Option<PaymentRecord>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM payment_records WHERE order_id = ?1 AND status = 'success'",
            PAYMENT_RECORD_COLS
        ),
        &[&order_id],
    )
}

/// Bump the retry counter after a failed provider attempt. Returns the new count.
pub fn increment_payment_retry(conn: &Connection, id: &str) -> Result<i32> {
    conn.query_row(
        "UPDATE payment_records SET retry_count = retry_count + 1, updated_at = ?1 WHERE id = ?2 RETURNING retry_count",
        params![now(), id],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

/// Store the provider-side handle returned by a successful create call.
pub fn attach_provider_payment(
    conn: &Connection,
    id: &str,
    provider_order_id: &str,
    transaction_id: Option<&str>,
    payment_url: Option<&str>,
    qr_code_url: Option<&str>,
    expire_time: i64,
) -> Result<bool> {
    UpdateBuilder::new("payment_records", id)
        .with_updated_at()
        .set("provider_order_id", provider_order_id.to_string())
        .set_opt("transaction_id", transaction_id.map(str::to_string))
        .set_opt("payment_url", payment_url.map(str::to_string))
        .set_opt("qr_code_url", qr_code_url.map(str::to_string))
        .set("expire_time", expire_time)
        .guard("status", PaymentStatus::Pending.as_ref().to_string())
        .execute(conn)
}

/// Move a pending payment record to a terminal status. Returns false when the
/// record already left `pending` (replayed or concurrent callback).
pub fn complete_payment_record(
    conn: &Connection,
    id: &str,
    status: PaymentStatus,
    payment_time: Option<i64>,
    transaction_id: Option<&str>,
) -> Result<bool> {
    if !status.is_terminal() {
        return Err(AppError::Invariant(format!(
            "payment record {} cannot move to pending",
            id
        )));
    }
    UpdateBuilder::new("payment_records", id)
        .with_updated_at()
        .set("status", status.as_ref().to_string())
        .set_opt("payment_time", payment_time)
        .set_opt("transaction_id", transaction_id.map(str::to_string))
        .guard("status", PaymentStatus::Pending.as_ref().to_string())
        .execute(conn)
}

pub fn set_payment_refund(conn: &Connection, id: &str, refund_id: &str) -> Result<bool> {
    UpdateBuilder::new("payment_records", id)
        .with_updated_at()
        .set("refund_id", refund_id.to_string())
        .execute(conn)
}

/// Close every still-pending attempt of an order (order expired or canceled).
pub fn close_pending_payments_for_order(
    conn: &Connection,
    order_id: &str,
    status: PaymentStatus,
) -> Result<usize> {
    let affected = conn.execute(
        "UPDATE payment_records SET status = ?1, updated_at = ?2 WHERE order_id = ?3 AND status = 'pending'",
        params![status.as_ref(), now(), order_id],
    )?;
    Ok(affected)
}

/// Pending records created before `created_before`, oldest first.
pub fn list_stale_pending_payments(
    conn: &Connection,
    created_before: i64,
    limit: i64,
) -> Result<Vec<PaymentRecord>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM payment_records WHERE status = 'pending' AND created_at <= ?1 ORDER BY created_at ASC LIMIT ?2",
            PAYMENT_RECORD_COLS
        ),
        &[&created_before, &limit],
    )
}

// ============ Subscriptions ============

pub fn insert_subscription(conn: &Connection, sub: &Subscription) -> Result<()> {
    let models = serde_json::to_string(&sub.available_models)?;
    conn.execute(
        "INSERT INTO subscriptions (id, user_id, plan_id, order_id, status, start_time, end_time, trial_start_time, trial_end_time, auto_renew, quota_used, quota_limit, max_roles, max_contexts, available_models, amount, currency, version, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
        params![
            &sub.id,
            sub.user_id,
            &sub.plan_id,
            &sub.order_id,
            sub.status.as_ref(),
            sub.start_time,
            sub.end_time,
            sub.trial_start_time,
            sub.trial_end_time,
            sub.auto_renew as i32,
            sub.quota_used,
            sub.quota_limit,
            sub.max_roles,
            sub.max_contexts,
            &models,
            sub.amount,
            &sub.currency,
            sub.version,
            sub.created_at,
            sub.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_subscription(conn: &Connection, id: &str) -> Result<Option<Subscription>> {
    query_one(
        conn,
        &format!("SELECT {} FROM subscriptions WHERE id = ?1", SUBSCRIPTION_COLS),
        &[&id],
    )
}

/// The user's active or paused subscription, if any.
pub fn get_live_subscription(conn: &Connection, user_id: i64) -> Result<Option<Subscription>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM subscriptions WHERE user_id = ?1 AND status IN ('active', 'paused')",
            SUBSCRIPTION_COLS
        ),
        &[&user_id],
    )
}

/// The user's active subscription whose period has not ended yet.
pub fn get_active_subscription(
    conn: &Connection,
    user_id: i64,
    now: i64,
) -> Result<Option<Subscription>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM subscriptions WHERE user_id = ?1 AND status = 'active' AND end_time > ?2",
            SUBSCRIPTION_COLS
        ),
        &[&user_id, &now],
    )
}

pub fn get_subscription_by_order(conn: &Connection, order_id: &str) -> Result<Option<Subscription>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM subscriptions WHERE order_id = ?1",
            SUBSCRIPTION_COLS
        ),
        &[&order_id],
    )
}

pub fn list_user_subscriptions(conn: &Connection, user_id: i64) -> Result<Vec<Subscription>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM subscriptions WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
            SUBSCRIPTION_COLS
        ),
        &[&user_id],
    )
}

/// Whether the user ever held a subscription, in any status. Free trials are
/// only granted to first-time subscribers.
pub fn user_has_subscribed(conn: &Connection, user_id: i64) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM subscriptions WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Fields written when a subscription is extended or renewed.
pub struct PeriodUpdate<'a> {
    pub order_id: &'a str,
    pub start_time: i64,
    pub end_time: i64,
    pub clear_trial: bool,
    pub reset_quota: bool,
    pub amount: i64,
    pub status: SubscriptionStatus,
}

/// Versioned period update. Returns false if the row changed since `version` was read.
pub fn update_subscription_period(
    conn: &Connection,
    id: &str,
    version: i64,
    update: &PeriodUpdate,
) -> Result<bool> {
    let mut builder = UpdateBuilder::new("subscriptions", id)
        .with_updated_at()
        .bump_version()
        .set("order_id", update.order_id.to_string())
        .set("start_time", update.start_time)
        .set("end_time", update.end_time)
        .set("amount", update.amount)
        .set("status", update.status.as_ref().to_string());
    if update.clear_trial {
        builder = builder
            .set_nullable::<i64>("trial_start_time", None)
            .set_nullable::<i64>("trial_end_time", None);
    }
    if update.reset_quota {
        builder = builder.set("quota_used", 0i64);
    }
    builder.guard("version", version).execute(conn)
}

/// Plan-derived fields copied onto a subscription on upgrade/downgrade.
pub struct PlanUpdate<'a> {
    pub plan_id: &'a str,
    pub order_id: Option<&'a str>,
    pub quota_limit: i64,
    pub quota_used: i64,
    pub max_roles: i32,
    pub max_contexts: i32,
    pub available_models: &'a [String],
    pub amount: i64,
    pub status: SubscriptionStatus,
}

/// Versioned plan replacement. Returns false if the row changed since `version` was read.
pub fn replace_subscription_plan(
    conn: &Connection,
    id: &str,
    version: i64,
    update: &PlanUpdate,
) -> Result<bool> {
    let models = serde_json::to_string(update.available_models)?;
    UpdateBuilder::new("subscriptions", id)
        .with_updated_at()
        .bump_version()
        .set("plan_id", update.plan_id.to_string())
        .set_opt("order_id", update.order_id.map(str::to_string))
        .set("quota_limit", update.quota_limit)
        .set("quota_used", update.quota_used)
        .set("max_roles", update.max_roles)
        .set("max_contexts", update.max_contexts)
        .set("available_models", models)
        .set("amount", update.amount)
        .set("status", update.status.as_ref().to_string())
        .guard("version", version)
        .execute(conn)
}

pub fn transition_subscription(
    conn: &Connection,
    id: &str,
    from: SubscriptionStatus,
    to: SubscriptionStatus,
) -> Result<bool> {
    UpdateBuilder::new("subscriptions", id)
        .with_updated_at()
        .bump_version()
        .set("status", to.as_ref().to_string())
        .guard("status", from.as_ref().to_string())
        .execute(conn)
}

/// Cancel a live subscription. Returns false if it was not active or paused.
pub fn cancel_subscription_row(
    conn: &Connection,
    id: &str,
    reason: Option<&str>,
    canceled_by: &str,
    canceled_at: i64,
) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE subscriptions SET status = 'canceled', cancel_reason = ?1, canceled_by = ?2, canceled_at = ?3, auto_renew = 0, version = version + 1, updated_at = ?3
         WHERE id = ?4 AND status IN ('active', 'paused')",
        params![reason, canceled_by, canceled_at, id],
    )?;
    Ok(affected > 0)
}

pub fn set_auto_renew(conn: &Connection, id: &str, auto_renew: bool) -> Result<bool> {
    UpdateBuilder::new("subscriptions", id)
        .with_updated_at()
        .set("auto_renew", auto_renew as i32)
        .execute(conn)
}

/// Atomically consume quota. The row only changes when the subscription is
/// active, not past its end, and has enough quota left; otherwise `None`.
pub fn try_consume_quota(
    conn: &Connection,
    id: &str,
    amount: i64,
    now: i64,
) -> Result<Option<Subscription>> {
    conn.query_row(
        &format!(
            "UPDATE subscriptions SET quota_used = quota_used + ?1, version = version + 1, updated_at = ?2
             WHERE id = ?3 AND status = 'active' AND end_time > ?2 AND quota_used + ?1 <= quota_limit
             RETURNING {}",
            SUBSCRIPTION_COLS
        ),
        params![amount, now, id],
        Subscription::from_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn list_subscriptions_past_end(conn: &Connection, now: i64, limit: i64) -> Result<Vec<Subscription>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM subscriptions WHERE status = 'active' AND end_time <= ?1 ORDER BY end_time ASC LIMIT ?2",
            SUBSCRIPTION_COLS
        ),
        &[&now, &limit],
    )
}

/// Active auto-renewing subscriptions whose period ends within `(now, now + window]`.
pub fn list_renewal_candidates(
    conn: &Connection,
    now: i64,
    window: i64,
    limit: i64,
) -> Result<Vec<Subscription>> {
    let until = now + window;
    query_all(
        conn,
        &format!(
            "SELECT {} FROM subscriptions WHERE status = 'active' AND auto_renew = 1 AND end_time > ?1 AND end_time <= ?2 ORDER BY end_time ASC LIMIT ?3",
            SUBSCRIPTION_COLS
        ),
        &[&now, &until, &limit],
    )
}

/// Live subscriptions whose trial ends within `(now, now + window]`.
pub fn list_trials_ending(
    conn: &Connection,
    now: i64,
    window: i64,
    limit: i64,
) -> Result<Vec<Subscription>> {
    let until = now + window;
    query_all(
        conn,
        &format!(
            "SELECT {} FROM subscriptions WHERE status IN ('active', 'paused') AND trial_end_time > ?1 AND trial_end_time <= ?2 ORDER BY trial_end_time ASC LIMIT ?3",
            SUBSCRIPTION_COLS
        ),
        &[&now, &until, &limit],
    )
}

// ============ Activities ============

pub fn insert_activity(conn: &Connection, input: &NewActivity) -> Result<UserActivity> {
    let id = EntityType::Activity.gen_id();
    let now = now();
    conn.execute(
        "INSERT INTO user_activities (id, user_id, activity_type, subscription_id, title, description, amount, priority, is_read, is_resolved, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 0, ?9)",
        params![
            &id,
            input.user_id,
            input.activity_type.as_ref(),
            &input.subscription_id,
            &input.title,
            &input.description,
            input.amount,
            input.priority.as_ref(),
            now,
        ],
    )?;
    Ok(UserActivity {
        id,
        user_id: input.user_id,
        activity_type: input.activity_type,
        subscription_id: input.subscription_id.clone(),
        title: input.title.clone(),
        description: input.description.clone(),
        amount: input.amount,
        priority: input.priority,
        is_read: false,
        is_resolved: false,
        created_at: now,
    })
}

pub fn get_activity(conn: &Connection, id: &str) -> Result<Option<UserActivity>> {
    query_one(
        conn,
        &format!("SELECT {} FROM user_activities WHERE id = ?1", ACTIVITY_COLS),
        &[&id],
    )
}

pub fn list_activities(
    conn: &Connection,
    user_id: i64,
    filter: &ActivityFilter,
) -> Result<(Vec<UserActivity>, i64)> {
    let build_filter_params = || -> Vec<Value> {
        let mut values: Vec<Value> = vec![user_id.into()];
        if let Some(t) = filter.activity_type {
            values.push(t.as_ref().to_string().into());
        }
        if let Some(p) = filter.priority {
            values.push(p.as_ref().to_string().into());
        }
        values
    };

    let mut where_clause = String::from("WHERE user_id = ?");
    if filter.activity_type.is_some() {
        where_clause.push_str(" AND activity_type = ?");
    }
    if filter.priority.is_some() {
        where_clause.push_str(" AND priority = ?");
    }
    if filter.unread_only {
        where_clause.push_str(" AND is_read = 0");
    }
    if filter.unresolved_only {
        where_clause.push_str(" AND is_resolved = 0");
    }

    let count_sql = format!("SELECT COUNT(*) FROM user_activities {}", where_clause);
    let total: i64 = conn.query_row(
        &count_sql,
        rusqlite::params_from_iter(build_filter_params()),
        |row| row.get(0),
    )?;

    let select_sql = format!(
        "SELECT {} FROM user_activities {} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        ACTIVITY_COLS, where_clause
    );
    let mut values = build_filter_params();
    values.push(filter.limit().into());
    values.push(filter.offset().into());

    let mut stmt = conn.prepare(&select_sql)?;
    let items = stmt
        .query_map(
            rusqlite::params_from_iter(values),
            UserActivity::from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok((items, total))
}

pub fn mark_activity_read(conn: &Connection, user_id: i64, id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE user_activities SET is_read = 1 WHERE id = ?1 AND user_id = ?2",
        params![id, user_id],
    )?;
    Ok(affected > 0)
}

pub fn mark_all_activities_read(conn: &Connection, user_id: i64) -> Result<usize> {
    let affected = conn.execute(
        "UPDATE user_activities SET is_read = 1 WHERE user_id = ?1 AND is_read = 0",
        params![user_id],
    )?;
    Ok(affected)
}

pub fn mark_activity_resolved(conn: &Connection, user_id: i64, id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE user_activities SET is_resolved = 1, is_read = 1 WHERE id = ?1 AND user_id = ?2",
        params![id, user_id],
    )?;
    Ok(affected > 0)
}

pub fn count_unread_activities(conn: &Connection, user_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM user_activities WHERE user_id = ?1 AND is_read = 0",
        params![user_id],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

pub fn count_subscription_activities(
    conn: &Connection,
    subscription_id: &str,
    activity_type: ActivityType,
) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM user_activities WHERE subscription_id = ?1 AND activity_type = ?2",
        params![subscription_id, activity_type.as_ref()],
        |row| row.get(0),
    )
    .map_err(Into::into)
}
