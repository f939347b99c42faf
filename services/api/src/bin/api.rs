//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{ChangeHub, DbAdapter, InMemoryDb, PgChangeRelay},
    config::Config,
    error::ApiError,
    web::{router, AppState},
};
use fee_portal_core::ports::{ChangeFeedService, DatabaseService};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Choose the Store & Start the Change Feed ---
    let hub = Arc::new(ChangeHub::new());
    let db: Arc<dyn DatabaseService> = if config.uses_memory_store() {
        warn!("Using the in-memory store; data is lost on restart.");
        Arc::new(InMemoryDb::new(hub.clone()))
    } else {
        info!("Connecting to database...");
        let db_pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&config.database_url)
            .await?;
        let db_adapter = DbAdapter::new(db_pool.clone());
        info!("Running database migrations...");
        db_adapter.run_migrations().await?;
        info!("Database migrations complete.");

        let _relay = PgChangeRelay::spawn(&db_pool, hub.clone()).await?;
        Arc::new(db_adapter)
    };
    let feed: Arc<dyn ChangeFeedService> = hub.clone();

    // --- 3. Build the Shared AppState & Router ---
    let app_state = Arc::new(AppState {
        db,
        feed,
        config: config.clone(),
    });
    let app = router(app_state)?;

    // --- 4. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received.");
        })
        .await?;

    hub.shutdown();
    Ok(())
}
