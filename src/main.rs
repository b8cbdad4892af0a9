/// SmokeFree core service
///
/// Runs the background jobs of the identity and subscription core: membership
/// expiration, credential cleanup and health checks.

use anyhow::Context as _;
use smokefree_core::{config::CoreConfig, jobs::JobScheduler, AppContext};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = CoreConfig::from_env().context("Failed to load configuration")?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("smokefree_core={},sqlx=warn", config.logging.level).into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("SmokeFree core v{} starting", env!("CARGO_PKG_VERSION"));

    // Create application context
    let ctx = AppContext::new(config)
        .await
        .context("Failed to initialize application context")?;
    let ctx = Arc::new(ctx);

    // Start background jobs
    let scheduler = Arc::new(JobScheduler::new(Arc::clone(&ctx)));
    let handles = scheduler.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown signal received, stopping background jobs");
    for handle in handles {
        handle.abort();
    }
    ctx.db.close().await;

    Ok(())
}
