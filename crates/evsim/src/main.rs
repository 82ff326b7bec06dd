mod bootstrap;
mod config;
mod worker;

use anyhow::Context;
use bootstrap::{Bootstrap, LaunchReport};
use clap::Parser;
use config::{SimulatorConfig, load_template};
use evsim_api::create_app;
use evsim_core::StationRegistry;
use std::path::PathBuf;
use worker::WorkerFactory;

/// Command line arguments for the evsim simulator
#[derive(Parser, Debug)]
#[command(name = "evsim")]
#[command(about = "Charge point fleet simulator")]
struct Args {
    /// Path to the simulator configuration JSON file
    #[arg(short, long)]
    config: PathBuf,

    /// Port to bind the status server to
    #[arg(short, long, default_value = "3000")]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    let config = SimulatorConfig::load(&args.config).await?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .pretty()
        .with_max_level(config.log_level()?)
        .init();

    tracing::info!(
        "Loaded simulator config from {}: {} template(s)",
        args.config.display(),
        config.station_template_urls.len()
    );

    // Template paths are relative to the configuration file
    let base_dir = args
        .config
        .parent()
        .map(PathBuf::from)
        .unwrap_or_default();

    let registry = StationRegistry::new();
    let factory = WorkerFactory::new(registry.clone(), config.request_timeout());
    let mut bootstrap = Bootstrap::new(
        factory,
        config.charging_stations_per_worker,
        config.worker_start_delay(),
    );
    let report = bootstrap
        .start(&config.station_template_urls, |source| {
            load_template(base_dir.join(&source.file))
        })
        .await;
    if let LaunchReport::Started {
        stations,
        hosts,
        occupancy,
    } = &report
    {
        tracing::info!(
            "Fleet running: {} station(s) on {} worker(s), occupancy {:?}",
            stations,
            hosts,
            occupancy
        );
    }

    let app = create_app(registry);

    let bind_addr = format!("0.0.0.0:{}", args.port);
    tracing::info!("Starting status server on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", error);
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("Server error")?;

    bootstrap.shutdown().await;
    Ok(())
}
