use std::sync::Arc;

use netbill_api::{create_router, ApiConfig, AppState};
use netbill_billing::{create_pool, BillingConfig, BillingEngine, PgBillingStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,netbill_api=debug".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!("Starting NetBill API Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let api_config = ApiConfig::from_env()?;
    let billing_config = BillingConfig::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&api_config.database_url).await?;
    let store = PgBillingStore::new(pool);
    store.migrate().await?;
    tracing::info!("Database connection established");

    let engine = BillingEngine::new(billing_config, Arc::new(store))?;
    let state = AppState::new(engine, api_config.admin_api_token.clone());
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(api_config.bind_address).await?;
    tracing::info!(address = %api_config.bind_address, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
