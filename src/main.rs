// =============================================================================
// Grid Arena — Main Entry Point
// =============================================================================
//
// Boot order matters: exchange truth is read before any job starts, so grids
// recover from live orders and the reconciler starts from a consistent
// virtual book. The engine defaults to the futures testnet; live trading is
// an explicit configuration change.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod account;
mod binance;
mod config;
mod decision;
mod execution;
mod grid;
mod indicators;
mod market;
mod order_tag;
mod provider;
mod reconcile;
mod risk;
mod scheduler;
mod store;
mod trading;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::account::AccountService;
use crate::binance::BinanceFuturesClient;
use crate::config::Settings;
use crate::execution::TradeExecutor;
use crate::grid::GridEngine;
use crate::market::MarketDataService;
use crate::reconcile::PositionReconciler;
use crate::risk::{RiskLimits, RiskManager};
use crate::scheduler::Scheduler;
use crate::store::{MemoryStore, RecordStore};
use crate::trading::TradingService;

const CONFIG_PATH: &str = "arena_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Grid Arena — Starting Up                      ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut settings = Settings::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load settings, using defaults");
        Settings::default()
    });
    settings.apply_env_overrides();
    settings.validate()?;

    info!(
        traders = settings.traders.len(),
        symbols = ?settings.allowed_symbols,
        testnet = settings.use_testnet,
        decision_interval_s = settings.decision_interval_seconds,
        "configuration ready"
    );

    // ── 2. Exchange gateway ──────────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("BINANCE_API_KEY / BINANCE_API_SECRET not set — signed calls will fail");
    }
    let client = Arc::new(BinanceFuturesClient::new(
        api_key,
        api_secret,
        settings.exchange_base_url(),
    ));

    // ── 3. Storage & accounts ────────────────────────────────────────────
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());

    let trader_ids: Vec<String> = settings
        .traders
        .iter()
        .map(|t| t.trader_id.clone())
        .collect();
    let accounts = Arc::new(
        AccountService::new(
            &trader_ids,
            settings.initial_balance_per_trader,
            settings.max_open_positions,
            store.clone(),
        )
        .await,
    );

    // ── 4. Core services ─────────────────────────────────────────────────
    let market = Arc::new(MarketDataService::new(
        client.clone(),
        settings.allowed_symbols.clone(),
        settings.market_cache_ttl_seconds,
    ));
    let risk = Arc::new(RiskManager::new(RiskLimits::from_settings(&settings)));
    let grids = Arc::new(GridEngine::new(store.clone()));
    let executor = Arc::new(TradeExecutor::new(
        client.clone(),
        accounts.clone(),
        grids.clone(),
        risk.clone(),
        store.clone(),
        settings.fee_rate,
    ));

    // ── 5. Recover grids from exchange truth ─────────────────────────────
    match client.get_open_orders(None).await {
        Ok(open_orders) => {
            let report = grids.restore(&open_orders).await;
            if !report.orphan_orders.is_empty() {
                warn!(
                    orphans = report.orphan_orders.len(),
                    ids = ?report.orphan_orders,
                    "orphan grid orders need operator review"
                );
            }
        }
        Err(e) => {
            warn!(error = %e, "could not read open orders — starting without grid recovery");
        }
    }

    // ── 6. Decision providers ────────────────────────────────────────────
    let providers = provider::build_providers(&settings)?;
    if providers.is_empty() {
        warn!("no decision providers available — traders will only reconcile");
    }

    let trading = Arc::new(TradingService::new(
        market.clone(),
        accounts.clone(),
        grids.clone(),
        executor.clone(),
        risk.clone(),
        providers,
        store.clone(),
        &settings,
    ));
    let reconciler = Arc::new(PositionReconciler::new(
        client.clone(),
        accounts.clone(),
        store.clone(),
    ));

    // ── 7. Scheduled jobs ────────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new());

    {
        let trading = trading.clone();
        scheduler.spawn_job(
            "decision_cycle",
            Duration::from_secs(settings.decision_interval_seconds),
            move || {
                let trading = trading.clone();
                async move { trading.run_cycle().await.map(|o| o.to_string()) }
            },
        );
    }

    {
        let executor = executor.clone();
        let market = market.clone();
        let grids = grids.clone();
        scheduler.spawn_job(
            "grid_monitor",
            Duration::from_secs(settings.grid_monitor_interval_seconds),
            move || {
                let executor = executor.clone();
                let market = market.clone();
                let grids = grids.clone();
                async move {
                    let prices = market.current_prices(false).await;
                    executor.monitor_grids(&prices).await;
                    Ok(format!("monitored {} active grids", grids.all_active().len()))
                }
            },
        );
    }

    {
        let reconciler = reconciler.clone();
        scheduler.spawn_job(
            "reconcile",
            Duration::from_secs(settings.reconcile_interval_seconds),
            move || {
                let reconciler = reconciler.clone();
                async move {
                    let report = reconciler.reconcile_once().await?;
                    Ok(format!(
                        "{} exchange positions, {} unowned, clean={}",
                        report.exchange_positions,
                        report.unowned_positions,
                        report.is_clean()
                    ))
                }
            },
        );
    }

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    scheduler
        .shutdown(Duration::from_secs(settings.shutdown_grace_seconds))
        .await;

    if let Err(e) = accounts.sync_all().await {
        error!(error = %e, "final account flush failed");
    }
    if let Err(e) = settings.save(CONFIG_PATH) {
        error!(error = %e, "failed to save settings on shutdown");
    }

    for status in scheduler.status() {
        info!(
            job = %status.name,
            runs = status.stats.runs,
            errors = status.stats.errors,
            skips = status.stats.skips,
            "job summary"
        );
    }

    info!("Grid Arena shut down complete.");
    Ok(())
}
