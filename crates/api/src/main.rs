use std::sync::Arc;

use anyhow::Context;

use beacon_infra::config::EngineConfig;
use beacon_infra::orchestrator::UnconfiguredRouter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    beacon_observability::init();

    let config = EngineConfig::from_env();
    let (services, background) =
        beacon_api::app::build_services(&config, Arc::new(UnconfiguredRouter)).await?;
    let app = beacon_api::app::build_app(Arc::new(services));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    background.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
