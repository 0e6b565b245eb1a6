//! Ledger maintenance daemon: migrations, root bootstrap, consistency check
//! and the audit retention sweep

use points_ledger::{storage::open_store, Config, Orchestrator};
use std::error::Error;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting points ledger daemon");

    let config = Config::from_env()?;
    let store = open_store(&config).await?;
    let orchestrator = Orchestrator::open(store, &config).await?;
    tracing::info!(root = %orchestrator.root_account(), "Ledger opened successfully");

    let report = orchestrator.consistency_report().await?;
    if report.is_consistent() {
        tracing::info!(accounts = report.checked, "Cached balances match the ledger");
    } else {
        tracing::error!(
            accounts = report.checked,
            drifted = report.drifted.len(),
            "Cached balances drifted from the ledger"
        );
    }

    let sweep =
        orchestrator.spawn_retention_sweep(Duration::from_secs(config.audit.sweep_interval_secs));

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down points ledger daemon");
    sweep.shutdown().await;
    Ok(())
}
