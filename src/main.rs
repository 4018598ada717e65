use std::sync::Arc;

use anyhow::Context;
use bpm_event_core::config::AppConfiguration;
use bpm_event_core::core::clock::SystemClock;
use bpm_event_core::core::logging::init_logging;
use bpm_event_core::ServiceRegistry;
use tracing::info;

/// Tenant whose platform jobs this node keeps scheduled
const DEFAULT_TENANT: i64 = 1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfiguration::load()
        .await
        .context("Failed to load configuration")?;
    init_logging(&config.logging).context("Failed to initialise logging")?;
    info!(node_id = %config.node_id, "📋 Configuration loaded successfully");

    let registry = ServiceRegistry::build(config, Arc::new(SystemClock))
        .await
        .context("Failed to build services")?;
    registry.start().await.context("Failed to start services")?;
    registry
        .register_platform_jobs(DEFAULT_TENANT)
        .await
        .context("Failed to register platform jobs")?;

    info!("🚀 BPM event core running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    registry.stop().await.context("Failed to stop services")?;
    Ok(())
}
