use std::sync::Arc;

use netbill_billing::{create_pool, BillingConfig, BillingEngine, PgBillingStore};
use netbill_worker::{init_tracing, BillingScheduler};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment before the subscriber reads RUST_LOG / LOG_FORMAT
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting NetBill Worker");

    let config = BillingConfig::from_env()?;

    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = create_pool(&database_url).await?;
    let store = PgBillingStore::new(pool);
    store.migrate().await?;

    let engine = BillingEngine::new(config, Arc::new(store))?;
    info!(
        environment = ?engine.config.environment,
        timezone = %engine.config.timezone,
        remote_actions = !engine.config.remote.skip,
        "Billing engine ready"
    );

    let mut scheduler = BillingScheduler::new(engine);
    scheduler.start().await?;
    info!(
        "NetBill Worker started successfully with {} scheduled jobs",
        scheduler.jobs().len()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    scheduler.stop().await?;

    Ok(())
}
