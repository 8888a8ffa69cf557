pub mod from_row;
pub mod queries;
mod schema;

pub use schema::{CONNECTION_PRAGMAS, init_db};

use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::config::EngineSettings;
use crate::locks::KeyedLocks;
use crate::payments::GatewayRegistry;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Everything the engine needs, built once at startup and passed to every
/// operation. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    /// Immutable after startup
    pub gateways: Arc<GatewayRegistry>,
    pub settings: Arc<EngineSettings>,
    /// Serializes callback processing per `provider:provider_order_id`
    pub callback_locks: Arc<KeyedLocks>,
}

impl AppState {
    pub fn new(db: DbPool, gateways: GatewayRegistry, settings: EngineSettings) -> Self {
        Self {
            db,
            gateways: Arc::new(gateways),
            settings: Arc::new(settings),
            callback_locks: Arc::new(KeyedLocks::default()),
        }
    }
}

pub fn create_pool(database_path: &str) -> Result<DbPool, r2d2::Error> {
    let manager = SqliteConnectionManager::file(database_path)
        .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
    Pool::builder().max_size(10).build(manager)
}
