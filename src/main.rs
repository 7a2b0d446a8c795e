//! BALANCER: equal-weight exchange rebalancing agent
//!
//! Entry point. Loads configuration, initialises structured logging,
//! starts the cache pollers, the order worker and the metrics reporter,
//! then runs the rebalancing loop until Ctrl+C.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use balancer::config;
use balancer::engine::controller::Controller;
use balancer::engine::orders::{OrderSettings, OrderWorker};
use balancer::engine::reporting::MetricsReporter;
use balancer::exchange::auth::Credentials;
use balancer::exchange::client::SignedClient;
use balancer::exchange::Exchange;
use balancer::services::balances::BalanceCache;
use balancer::services::rates::RateCache;
use balancer::services::run_poller;
use balancer::services::spreads::SpreadCache;
use balancer::types::fmt_native;

const BANNER: &str = r#"
 ___   _   _      _   _  _  ___ ___ ___
| _ ) /_\ | |    /_\ | \| |/ __| __| _ \
| _ \/ _ \| |__ / _ \| .` | (__| _||   /
|___/_/ \_\____/_/ \_\_|\_|\___|___|_|_\

  Equal-weight portfolio rebalancer
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;
    init_logging();

    println!("{BANNER}");
    let dry_run = cfg.dry_run();
    info!(
        agent_name = %cfg.agent.name,
        tick_interval_secs = cfg.agent.tick_interval_secs,
        base = %cfg.agent.base_asset,
        managed = ?cfg.agent.managed_assets,
        dry_run,
        "BALANCER starting up"
    );
    if dry_run {
        warn!("Dry-run mode: orders are logged, never placed or cancelled");
    }

    // -- Exchange --------------------------------------------------------

    let credentials = Credentials::from_env(
        &cfg.exchange.access_key_env,
        &cfg.exchange.secret_key_env,
        &cfg.exchange.passphrase_env,
    )?;
    let exchange: Arc<dyn Exchange> = Arc::new(SignedClient::new(cfg.client_config(), credentials)?);

    // -- Caches ----------------------------------------------------------

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let base = cfg.agent.base_asset;
    let managed = cfg.agent.managed_assets.clone();

    let (balances, balance_refresher) = BalanceCache::new(exchange.clone());
    let (rates, rate_refresher) = RateCache::new(exchange.clone());
    let (spreads, spread_refresher) = SpreadCache::new(exchange.clone(), base, &managed);

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(run_poller(
        balance_refresher,
        Duration::from_millis(cfg.polling.balances_interval_ms),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(run_poller(
        rate_refresher,
        Duration::from_millis(cfg.polling.rates_interval_ms),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(run_poller(
        spread_refresher,
        Duration::from_millis(cfg.polling.spreads_interval_ms),
        shutdown_rx.clone(),
    )));

    // -- Order worker ----------------------------------------------------

    let settings = OrderSettings {
        base,
        min_trade: cfg.min_trade_native(),
        tick: cfg.tick_native(),
        dry_run,
    };
    info!(
        min_trade = %fmt_native(settings.min_trade),
        tick = %fmt_native(settings.tick),
        queue_capacity = cfg.orders.queue_capacity,
        "Order settings"
    );
    let (queue, worker) =
        OrderWorker::new(exchange.clone(), spreads, settings, cfg.orders.queue_capacity);
    tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));

    // -- Reporting -------------------------------------------------------

    if let (true, Some(endpoint)) = (cfg.reporting.enabled, cfg.reporting.endpoint.clone()) {
        let reporter =
            MetricsReporter::new(endpoint, balances.clone(), rates.clone(), managed.clone(), base)?;
        tasks.push(tokio::spawn(
            reporter.run(Duration::from_secs(cfg.reporting.interval_secs), shutdown_rx.clone()),
        ));
    }

    // -- Main loop -------------------------------------------------------

    let mut controller =
        Controller::new(exchange, balances, rates, queue, managed, base, dry_run);
    let every = Duration::from_secs(cfg.agent.tick_interval_secs);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Press Ctrl+C to stop.");
    tokio::select! {
        _ = controller.run(every, shutdown_rx.clone()) => {}
        _ = &mut shutdown => {
            info!("Shutdown signal received.");
        }
    }

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }

    info!("BALANCER shut down cleanly.");
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("balancer=info"));

    let json_logging = std::env::var("BALANCER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
