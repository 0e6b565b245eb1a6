use actix_web::{middleware, web, App, HttpServer};
use dotenv::dotenv;
use points_ledger::{storage::open_store, Config, Orchestrator};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .init();

    let config = Config::from_env()?;

    info!("Starting points API on {}", config.server.listen_addr);

    let store = open_store(&config).await?;
    let ledger = Arc::new(Orchestrator::open(store, &config).await?);
    let sweep = ledger.spawn_retention_sweep(Duration::from_secs(config.audit.sweep_interval_secs));

    let data = web::Data::new(ledger);
    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .app_data(data.clone())
            .configure(points_api::configure_routes)
    })
    .bind(config.server.listen_addr.as_str())?
    .run()
    .await?;

    info!("Shutting down points API");
    sweep.shutdown().await;
    Ok(())
}
