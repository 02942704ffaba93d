//! Intraday batch bracket-trading controller - entry point.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use daybatch_app::AppConfig;
use daybatch_broker::{DynBroker, RateLimiter, RestBroker};
use daybatch_core::{DynClock, SystemClock};
use daybatch_engine::Supervisor;
use daybatch_store::establish_connection;

/// Intraday batch bracket-trading controller.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via DAYBATCH_CONFIG).
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    daybatch_app::init_logging();

    info!("Starting daybatch v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args
        .config
        .or_else(|| std::env::var("DAYBATCH_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());
    info!(config_path = %config_path, "Loading configuration");
    let config = AppConfig::load(&config_path)?;

    if config.broker.api_password.is_empty() {
        anyhow::bail!(
            "broker.api_password is not set (config file or {})",
            daybatch_app::config::API_PASSWORD_ENV
        );
    }

    let db = establish_connection(&config.db.url).await?;
    let broker: DynBroker = Arc::new(RestBroker::new(config.rest_broker_config())?);
    let rate = Arc::new(RateLimiter::new(
        config.rate.order_per_sec,
        config.rate.info_per_sec,
    ));
    let clock: DynClock = Arc::new(SystemClock::with_offset_hours(config.clock.utc_offset_hours));

    let supervisor = Arc::new(Supervisor::new(
        db,
        broker,
        rate,
        clock,
        config.supervisor_config(),
    ));

    // Cooperative shutdown: stop accepting work, let in-flight broker
    // calls finish; unfinished work reconciles on the next start.
    let shutdown_handle = supervisor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown_handle.shutdown();
        }
    });

    supervisor.run_until_shutdown().await?;
    Ok(())
}
