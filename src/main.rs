use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use payflow::config::Config;
use payflow::db::{AppState, create_pool, init_db, queries};
use payflow::engine::jobs;
use payflow::handlers;
use payflow::models::{CreateProduct, ProductFilter, ProductType};
use payflow::payments::GatewayRegistry;

#[derive(Parser, Debug)]
#[command(name = "payflow")]
#[command(about = "Payment and subscription lifecycle engine")]
struct Cli {
    /// Seed the catalog with dev plans and a one-time pack
    #[arg(long)]
    seed: bool,

    /// Delete the database on exit (dev mode only, useful for fresh starts)
    #[arg(long)]
    ephemeral: bool,
}

fn plan(name: &str, price: i64, level: i32, quota: i64, max_roles: i32, models: &[&str]) -> CreateProduct {
    CreateProduct {
        name: name.to_string(),
        description: None,
        price,
        currency: "CNY".to_string(),
        product_type: ProductType::Subscription,
        duration_secs: 30 * 24 * 60 * 60,
        level,
        free_trial_days: if level == 1 { 7 } else { 0 },
        stock: 1_000_000,
        quota,
        max_roles,
        max_contexts: max_roles,
        available_models: models.iter().map(|m| m.to_string()).collect(),
    }
}

/// Seeds the catalog with dev data for testing.
/// Only runs in dev mode and when the catalog is empty.
fn seed_dev_data(state: &AppState) {
    let conn = state.db.get().expect("Failed to get db connection for seeding");

    let filter = ProductFilter {
        product_type: None,
        include_inactive: true,
    };
    let existing = queries::list_products(&conn, &filter).expect("Failed to list products");
    if !existing.is_empty() {
        tracing::info!("Catalog already has data, skipping seed");
        return;
    }

    tracing::info!("============================================");
    tracing::info!("SEEDING DEV DATA");
    tracing::info!("============================================");

    let products = [
        plan("Basic", 2_900, 1, 1_000, 3, &["base"]),
        plan("Pro", 9_900, 2, 10_000, 10, &["base", "advanced"]),
        plan("Team", 29_900, 3, 100_000, 50, &["base", "advanced", "expert"]),
        CreateProduct {
            name: "Quota Pack".to_string(),
            description: Some("One-time top-up".to_string()),
            price: 1_900,
            currency: "CNY".to_string(),
            product_type: ProductType::OneTime,
            duration_secs: 0,
            level: 0,
            free_trial_days: 0,
            stock: 10_000,
            quota: 0,
            max_roles: 0,
            max_contexts: 0,
            available_models: vec![],
        },
    ];

    println!();
    println!("--- COPY FROM HERE ---");
    for input in &products {
        let product = queries::create_product(&conn, input).expect("Failed to create dev product");
        tracing::info!("Product: {} (id: {}, level {})", product.name, product.id, product.level);
        println!("  {}: {}", product.name.to_lowercase().replace(' ', "_"), product.id);
    }
    println!("--- END COPY ---");
    println!();

    tracing::info!("============================================");
    tracing::info!("DEV DATA SEEDED SUCCESSFULLY");
    tracing::info!("============================================");
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "payflow=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    if config.dev_mode {
        tracing::info!("Running in DEVELOPMENT mode");
    }

    let db_pool = create_pool(&config.database_path).expect("Failed to create database pool");
    {
        let conn = db_pool.get().expect("Failed to get connection");
        init_db(&conn).expect("Failed to initialize database");
    }

    let gateways = GatewayRegistry::from_config(&config).expect("Failed to build payment gateways");
    if gateways.names().is_empty() {
        tracing::warn!("No payment providers configured; payments will be refused");
    } else {
        tracing::info!("Payment providers: {}", gateways.names().join(", "));
    }

    let state = AppState::new(db_pool, gateways, config.engine.clone());

    if cli.seed {
        if !config.dev_mode {
            tracing::warn!("--seed flag ignored: not in dev mode (set PAYFLOW_ENV=dev)");
        } else {
            seed_dev_data(&state);
        }
    }

    jobs::spawn_sweeper(state.clone(), config.sweep_interval);

    let app = handlers::router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    let cleanup_on_exit = cli.ephemeral && config.dev_mode;
    let db_path = config.database_path.clone();

    if cleanup_on_exit {
        tracing::info!("EPHEMERAL MODE: database will be deleted on exit");
    }

    tracing::info!("Payflow server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to start server");

    if cleanup_on_exit {
        tracing::info!("Cleaning up ephemeral database...");
        if let Err(e) = std::fs::remove_file(&db_path) {
            tracing::warn!("Failed to remove {}: {}", db_path, e);
        } else {
            tracing::info!("Removed {}", db_path);
        }
        let _ = std::fs::remove_file(format!("{}-wal", db_path));
        let _ = std::fs::remove_file(format!("{}-shm", db_path));
        tracing::info!("Ephemeral cleanup complete");
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutdown signal received, stopping server...");
}
