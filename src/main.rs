// =============================================================================
// Correlate Bot — Main Entry Point
// =============================================================================
//
// Wires the config loader, the shared exchange-client handle, the
// market-data fan-out, one strategy engine per enabled strategy, the
// position lifecycle coordinator, the order tracker, and the durable
// store into a single cooperative supervisor loop.
// =============================================================================

mod config;
mod error;
mod exchange;
mod fanout;
mod logging;
mod notify;
mod order_tracker;
mod position;
mod stats;
mod store;
mod strategy;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::exchange::ExchangeClient;
use crate::fanout::FanOut;
use crate::notify::Notifier;
use crate::order_tracker::OrderTracker;
use crate::position::PositionCoordinator;
use crate::stats::StatisticsMonitor;
use crate::store::Store;
use crate::strategy::StrategyEngine;

const MAIN_LOOP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
const STATUS_LOG_EVERY_CYCLES: u64 = 60;
const DAILY_REPORT_CHECK_EVERY_CYCLES: u64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    let config_path = std::env::var("CORRELATE_BOT_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            // Config errors are fatal: logging isn't initialized yet, this is the
            // one place we write straight to stderr.
            eprintln!("fatal: failed to load config from '{config_path}': {e}");
            std::process::exit(1);
        }
    };

    let _log_guards = logging::init(&config.logging_level);

    info!("==============================================");
    info!("  Correlate Bot starting up");
    info!("==============================================");

    if let Err(e) = run(config).await {
        error!(%e, "fatal error during startup or run");
        std::process::exit(1);
    }

    info!("shutdown complete");
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let client = Arc::new(ExchangeClient::new(
        config.api.api_key.clone(),
        config.api.api_secret.clone(),
        config.api.testnet,
    )?);
    let store = Arc::new(Store::open(&config.database_path)?);
    let notifier = Arc::new(Notifier::new(config.telegram.clone()));
    let stats_monitor = StatisticsMonitor::new(store.clone());

    let coordinator = PositionCoordinator::new(client.clone(), store.clone(), notifier.clone(), config.max_stop_loss_trades);
    let tracker = OrderTracker::new(client.clone(), coordinator.clone());

    // Startup recovery (I2): restore open positions and hand them to the tracker.
    match coordinator.restore_open_positions(&config.strategies).await {
        Ok(open) => {
            for order in open {
                tracker.track_order(order);
            }
            info!(restored = tracker.tracked_count(), "restored open positions from durable store");
        }
        Err(e) => warn!(%e, "failed to restore open positions, starting with none tracked"),
    }

    let fanout = FanOut::new(client.clone());
    let mut strategy_tasks = Vec::new();

    for strategy_config in config.enabled_strategies() {
        let strategy_config = Arc::new(strategy_config.clone());
        let engine = Arc::new(StrategyEngine::new((*strategy_config).clone(), client.clone()));
        engine.preload_history().await;

        let (bar_tx, bar_rx) = tokio::sync::mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = tokio::sync::mpsc::unbounded_channel();

        fanout.register(&strategy_config, bar_tx);

        let engine_for_run = engine.clone();
        strategy_tasks.push(tokio::spawn(async move { engine_for_run.run(bar_rx, signal_tx).await }));

        let coordinator_for_run = coordinator.clone();
        let strategy_for_run = strategy_config.clone();
        strategy_tasks.push(tokio::spawn(async move {
            coordinator_for_run.run(strategy_for_run, signal_rx).await
        }));

        info!(strategy = %strategy_config.name, "strategy engine activated");
    }

    fanout.activate();
    let tracker_handle = tokio::spawn(tracker.clone().run());

    info!(strategies = strategy_tasks.len() / 2, "engine running");

    let mut cycle: u64 = 0;
    let mut interval = tokio::time::interval(MAIN_LOOP_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                cycle += 1;
                coordinator.check_positions().await;

                if cycle % STATUS_LOG_EVERY_CYCLES == 0 {
                    info!(
                        open_positions = coordinator.open_position_count(),
                        total_trades = coordinator.total_trades(),
                        tracked_orders = tracker.tracked_count(),
                        requests = client.request_count(),
                        errors = client.error_count(),
                        "status"
                    );
                }

                if cycle % DAILY_REPORT_CHECK_EVERY_CYCLES == 0 {
                    if let Some(report) = stats_monitor.maybe_due_report().await {
                        info!("\n{report}");
                        notifier.notify_daily_report(&report);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    shutdown(tracker_handle, &fanout, strategy_tasks).await;
    Ok(())
}

/// Shutdown sequencing (§5, added): tracker, then fan-out/strategies, then
/// a final stats flush. Each step is isolated so a failure in one does not
/// block the rest.
async fn shutdown(
    tracker_handle: tokio::task::JoinHandle<()>,
    fanout: &Arc<FanOut>,
    strategy_tasks: Vec<tokio::task::JoinHandle<()>>,
) {
    tracker_handle.abort();
    info!("order tracker stopped");

    fanout.stop();
    for task in strategy_tasks {
        task.abort();
    }
    info!("fan-out and strategy tasks stopped");
}
