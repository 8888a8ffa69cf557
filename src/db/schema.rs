use rusqlite::Connection;

/// Pragmas applied to every pooled connection.
///
/// busy_timeout lets concurrent IMMEDIATE transactions queue instead of
/// failing with SQLITE_BUSY; foreign_keys is per-connection in SQLite.
pub const CONNECTION_PRAGMAS: &str = r#"
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA busy_timeout = 5000;
    PRAGMA foreign_keys = ON;
"#;

/// Initialize the database schema
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- Catalog. Subscription products double as plans (level orders them).
        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            price INTEGER NOT NULL CHECK (price >= 0),
            currency TEXT NOT NULL,
            product_type TEXT NOT NULL CHECK (product_type IN ('one_time', 'subscription')),
            duration_secs INTEGER NOT NULL DEFAULT 0 CHECK (duration_secs >= 0),
            level INTEGER NOT NULL DEFAULT 0,
            free_trial_days INTEGER NOT NULL DEFAULT 0 CHECK (free_trial_days >= 0),
            stock INTEGER NOT NULL DEFAULT 0 CHECK (stock >= 0),
            quota INTEGER NOT NULL DEFAULT 0 CHECK (quota >= 0),
            max_roles INTEGER NOT NULL DEFAULT 0,
            max_contexts INTEGER NOT NULL DEFAULT 0,
            available_models TEXT NOT NULL DEFAULT '[]',  -- JSON array
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'inactive')),
            sold_count INTEGER NOT NULL DEFAULT 0,
            view_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_products_type ON products(product_type, status);

        CREATE TABLE IF NOT EXISTS product_skus (
            id TEXT PRIMARY KEY,
            product_id TEXT NOT NULL REFERENCES products(id),
            name TEXT NOT NULL,
            price INTEGER NOT NULL CHECK (price >= 0),
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'inactive')),
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_product_skus_product ON product_skus(product_id);

        -- Orders are never deleted, only status-transitioned
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            order_number TEXT NOT NULL UNIQUE,
            user_id INTEGER NOT NULL,
            product_id TEXT NOT NULL REFERENCES products(id),
            sku_id TEXT REFERENCES product_skus(id),
            quantity INTEGER NOT NULL CHECK (quantity > 0),
            unit_price INTEGER NOT NULL,
            total_amount INTEGER NOT NULL,
            currency TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'paid', 'canceled', 'expired', 'refunded')),
            kind TEXT NOT NULL DEFAULT 'purchase' CHECK (kind IN ('purchase', 'renewal', 'upgrade')),
            subscription_id TEXT,
            payment_method TEXT NOT NULL,
            expire_time INTEGER NOT NULL,
            paid_at INTEGER,
            refund_amount INTEGER,
            refund_reason TEXT,
            refunded_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_orders_pending_expiry ON orders(expire_time) WHERE status = 'pending';

        -- One row per attempt to collect money for an order
        CREATE TABLE IF NOT EXISTS payment_records (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL REFERENCES orders(id),
            user_id INTEGER NOT NULL,
            provider TEXT NOT NULL,
            provider_order_id TEXT,
            transaction_id TEXT,
            amount INTEGER NOT NULL,
            currency TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'success', 'failed', 'canceled', 'expired')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            risk_level TEXT NOT NULL DEFAULT 'low' CHECK (risk_level IN ('low', 'medium', 'high')),
            risk_score INTEGER NOT NULL DEFAULT 0,
            payment_url TEXT,
            qr_code_url TEXT,
            refund_id TEXT,
            expire_time INTEGER NOT NULL,
            payment_time INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_payment_records_order ON payment_records(order_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_payment_records_provider_order
            ON payment_records(provider, provider_order_id) WHERE provider_order_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_payment_records_pending ON payment_records(created_at) WHERE status = 'pending';
        -- At most one successful attempt per order
        CREATE UNIQUE INDEX IF NOT EXISTS idx_payment_records_one_success
            ON payment_records(order_id) WHERE status = 'success';

        CREATE TABLE IF NOT EXISTS subscriptions (
            id TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL,
            plan_id TEXT NOT NULL REFERENCES products(id),
            order_id TEXT NOT NULL REFERENCES orders(id),
            status TEXT NOT NULL CHECK (status IN ('active', 'paused', 'canceled', 'expired')),
            start_time INTEGER NOT NULL,
            end_time INTEGER NOT NULL,
            trial_start_time INTEGER,
            trial_end_time INTEGER,
            auto_renew INTEGER NOT NULL DEFAULT 1,
            quota_used INTEGER NOT NULL DEFAULT 0,
            quota_limit INTEGER NOT NULL DEFAULT 0,
            max_roles INTEGER NOT NULL,
            max_contexts INTEGER NOT NULL,
            available_models TEXT NOT NULL DEFAULT '[]',  -- JSON array
            amount INTEGER NOT NULL,
            currency TEXT NOT NULL,
            cancel_reason TEXT,
            canceled_by TEXT,
            canceled_at INTEGER,
            version INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            CHECK (quota_used >= 0 AND quota_used <= quota_limit),
            CHECK (end_time > start_time),
            CHECK (trial_end_time IS NULL OR start_time = trial_end_time)
        );
        CREATE INDEX IF NOT EXISTS idx_subscriptions_user ON subscriptions(user_id, status);
        CREATE INDEX IF NOT EXISTS idx_subscriptions_order ON subscriptions(order_id);
        -- A user holds at most one live (active or paused) subscription
        CREATE UNIQUE INDEX IF NOT EXISTS idx_subscriptions_one_live
            ON subscriptions(user_id) WHERE status IN ('active', 'paused');

        -- Append-only activity log. Only is_read / is_resolved change.
        CREATE TABLE IF NOT EXISTS user_activities (
            id TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL,
            activity_type TEXT NOT NULL,
            subscription_id TEXT,
            title TEXT NOT NULL,
            description TEXT,
            amount INTEGER,
            priority TEXT NOT NULL DEFAULT 'normal' CHECK (priority IN ('low', 'normal', 'high')),
            is_read INTEGER NOT NULL DEFAULT 0,
            is_resolved INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_user_activities_user ON user_activities(user_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_user_activities_subscription
            ON user_activities(subscription_id, activity_type);
        "#,
    )?;
    Ok(())
}
