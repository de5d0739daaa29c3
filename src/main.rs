/// Federation metadata resolver daemon
///
/// Loads metadata from the configured origin, keeps it cached and
/// refreshed, and answers metadata queries over HTTP.
use federation_metadata::{
    config::ServerConfig, context::AppContext, error::MetadataResult, jobs::JobScheduler, server,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> MetadataResult<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "federation_metadata=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Federation metadata resolver v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ServerConfig::from_env()?;

    // Create application context and load metadata
    let ctx = AppContext::new(config).await?;
    ctx.initialize().await?;

    // Start background jobs
    let scheduler = Arc::new(JobScheduler::from_context(&ctx));
    scheduler.start();

    // Serve until Ctrl-C
    let result = server::serve(ctx.clone(), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    })
    .await;

    scheduler.shutdown().await;
    ctx.shutdown();
    info!("Shutdown complete");

    result
}
