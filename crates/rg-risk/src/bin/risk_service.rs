use std::sync::Arc;

use anyhow::Context;
use rg_risk::{RiskManagementService, RiskServiceConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::var("RISK_SERVICE_CONFIG") {
        Ok(path) => RiskServiceConfig::from_json_file(&path)
            .with_context(|| format!("loading risk service config from {path}"))?,
        Err(_) => RiskServiceConfig::default(),
    };

    let service = Arc::new(RiskManagementService::new(config).context("building risk service")?);
    service.start();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");

    service.stop().await;
    let metrics = service.get_service_metrics();
    info!(
        checks = metrics.total_checks,
        rejected = metrics.rejected_checks,
        uptime_secs = metrics.uptime_secs,
        "risk service exited"
    );
    Ok(())
}
