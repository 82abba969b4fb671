//! # Price Aggregator Service
//!
//! Long-running service that keeps the synthetic price feed up to date:
//!
//! - refreshes the route graph every `router.refresh_interval_seconds`
//! - mirrors the reserve-snapshot writer's progress (when `height_gate.wait_for_liquidity`)
//! - prices every pending height every `price.interval_seconds`, gated on reserves
//!
//! The first task error stops every task and the process exits non-zero.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin price_aggregator -- --config Config.toml
//! ```
//!
//! Press Ctrl+C to stop gracefully.

use amm_price_feed::{
    database::{self, PgStore},
    price_engine::PriceEngine,
    router::Router,
    scheduler::{HeightGate, Schedule, Task, TaskRunner},
    settings::{LogSettings, Settings},
    tasks::{LiquidityProgressTask, PriceTask, RouterTask},
};
use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "price_aggregator")]
#[command(about = "Derives reference-token prices for every traded AMM token")]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = "Config.toml")]
    config: String,
}

#[cfg(not(feature = "observability"))]
fn init_logging(log: &LogSettings) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log.level.as_str())).init();
}

#[cfg(feature = "observability")]
fn init_logging(log: &LogSettings) {
    use amm_price_feed::settings::LogFormat;
    use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log.level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);
    match log.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    let args = Args::parse();

    let settings = Settings::from_path(&args.config).with_context(|| format!("loading {}", args.config))?;
    init_logging(&settings.log);
    info!("Starting price aggregator (reference token {})", settings.price.reference_token);

    if settings.metrics.enabled {
        #[cfg(feature = "observability")]
        amm_price_feed::metrics::init_prometheus_exporter(settings.metrics.port)?;
        #[cfg(not(feature = "observability"))]
        log::warn!("metrics.enabled is set but the binary was built without the observability feature");
    }

    let store = Arc::new(PgStore::new(database::connect(&settings.database).await?));

    let router = Arc::new(
        Router::new(store.clone(), settings.router.max_hop_count).with_route_persistence(settings.router.persist_routes),
    );
    router.update().await.context("initial route discovery")?;

    let engine = Arc::new(PriceEngine::new(
        store.clone(),
        router.clone(),
        settings.price.reference_token(),
        settings.price.min_pool_reserve,
    ));

    let cancel = CancellationToken::new();
    let mut runner = TaskRunner::new(cancel.clone());
    runner.add(
        Arc::new(RouterTask::new(router)),
        Schedule::Interval(settings.router.refresh_interval()),
    );

    let mut price_task = PriceTask::new(engine, cancel.clone());
    if settings.height_gate.wait_for_liquidity {
        let liquidity: Arc<dyn Task> = Arc::new(LiquidityProgressTask::new(store.clone()));
        runner.add(liquidity.clone(), Schedule::Interval(settings.height_gate.poll_interval()));
        let gate = HeightGate::new(vec![liquidity], settings.height_gate.poll_interval(), cancel.clone())
            .with_timeout(settings.height_gate.timeout());
        price_task = price_task.with_gate(gate);
    }
    runner.add(Arc::new(price_task), Schedule::Interval(settings.price.interval()));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, stopping tasks...");
            shutdown.cancel();
        }
    });

    match runner.run().await {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Price aggregator stopped: {}", e);
            Err(e.into())
        }
    }
}
