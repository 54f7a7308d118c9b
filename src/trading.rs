// =============================================================================
// Trading Service — one full decision cycle across all traders
// =============================================================================
//
// Cycle procedure: fetch fresh prices -> compute indicators -> fire automatic
// SL/TP closes -> fan each enabled trader out to its decision provider (with
// a small concurrency cap and a hard timeout) -> validate & execute -> update
// unrealised PnL -> flush accounts -> persist the market snapshot and every
// decision record.
//
// Partial failure of one trader never aborts the others: a provider timeout,
// an unparseable response, or an exchange error all degrade to a recorded
// skip for that trader.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::account::AccountService;
use crate::config::Settings;
use crate::decision::{Decision, DecisionRecord};
use crate::execution::TradeExecutor;
use crate::grid::GridEngine;
use crate::indicators::IndicatorSet;
use crate::market::{build_context, MarketDataService};
use crate::provider::{DecisionContext, DecisionProvider};
use crate::risk::RiskManager;
use crate::store::RecordStore;

/// Recent trades shown to a provider per cycle.
const CONTEXT_TRADES: usize = 5;
/// Kline shape used for indicator computation.
const INDICATOR_INTERVAL: &str = "1h";
const INDICATOR_KLINES: u32 = 100;

/// What one cycle did, for job bookkeeping and logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub symbols_priced: u32,
    pub stop_losses: u32,
    pub take_profits: u32,
    pub traders_processed: u32,
    pub traders_skipped: u32,
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "priced {} symbols, {} SL / {} TP closes, {} traders ({} skipped)",
            self.symbols_priced,
            self.stop_losses,
            self.take_profits,
            self.traders_processed,
            self.traders_skipped
        )
    }
}

pub struct TradingService {
    market: Arc<MarketDataService>,
    accounts: Arc<AccountService>,
    grids: Arc<GridEngine>,
    executor: Arc<TradeExecutor>,
    risk: Arc<RiskManager>,
    providers: HashMap<String, Arc<dyn DecisionProvider>>,
    store: Arc<dyn RecordStore>,
    provider_timeout: Duration,
    decision_concurrency: usize,
    liquidation_warning_pct: Decimal,
}

impl TradingService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        market: Arc<MarketDataService>,
        accounts: Arc<AccountService>,
        grids: Arc<GridEngine>,
        executor: Arc<TradeExecutor>,
        risk: Arc<RiskManager>,
        providers: HashMap<String, Arc<dyn DecisionProvider>>,
        store: Arc<dyn RecordStore>,
        settings: &Settings,
    ) -> Self {
        info!(
            providers = providers.len(),
            concurrency = settings.decision_concurrency,
            "TradingService initialised"
        );
        Self {
            market,
            accounts,
            grids,
            executor,
            risk,
            providers,
            store,
            provider_timeout: Duration::from_secs(settings.provider_timeout_seconds),
            decision_concurrency: settings.decision_concurrency.max(1),
            liquidation_warning_pct: settings.liquidation_warning_pct,
        }
    }

    /// Execute one complete decision cycle.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleOutcome> {
        let mut outcome = CycleOutcome::default();

        // ── 1. Fresh prices ─────────────────────────────────────────────
        let prices = self.market.current_prices(true).await;
        outcome.symbols_priced = prices.len() as u32;
        if prices.is_empty() {
            warn!("no prices available — skipping cycle");
            return Ok(outcome);
        }

        // ── 2. Market snapshot + indicators ─────────────────────────────
        let snapshot = self.market.snapshot().await;
        let mut indicators = HashMap::new();
        for symbol in self.market.symbols() {
            let closes = self
                .market
                .closes(symbol, INDICATOR_INTERVAL, INDICATOR_KLINES)
                .await;
            indicators.insert(symbol.clone(), IndicatorSet::compute(&closes));
        }
        let context_rows = build_context(&snapshot, &indicators);

        // ── 3. Automatic triggers ───────────────────────────────────────
        let (stop_losses, take_profits) = self.executor.auto_close_triggers(&prices).await;
        outcome.stop_losses = stop_losses;
        outcome.take_profits = take_profits;

        // Liquidation proximity is warn-only; closing is the trader's call.
        for trader_id in self.accounts.trader_ids() {
            if let Some(handle) = self.accounts.get(&trader_id) {
                let account = handle.read();
                let _ =
                    self.risk
                        .liquidation_proximity(&account, &prices, self.liquidation_warning_pct);
            }
        }

        // ── 4. Per-trader decisions, bounded fan-out ────────────────────
        let provider_entries: Vec<(String, Arc<dyn DecisionProvider>)> = self
            .providers
            .iter()
            .map(|(trader_id, provider)| (trader_id.clone(), provider.clone()))
            .collect();

        let trader_futures: Vec<_> = provider_entries
            .into_iter()
            .map(|(trader_id, provider)| {
                let prices = &prices;
                let context_rows = &context_rows;
                Box::pin(async move {
                    self.process_trader(&trader_id, provider, prices, context_rows)
                        .await
                })
            })
            .collect();

        let results: Vec<bool> = stream::iter(trader_futures)
            .buffer_unordered(self.decision_concurrency)
            .collect()
            .await;

        outcome.traders_processed = results.iter().filter(|ok| **ok).count() as u32;
        outcome.traders_skipped = results.iter().filter(|ok| !**ok).count() as u32;

        // ── 5. Mark to market and flush ─────────────────────────────────
        self.accounts.update_unrealized(&prices);
        if let Err(e) = self.accounts.sync_all().await {
            error!(error = %e, "account flush failed");
        }
        if let Err(e) = self.store.insert_market_snapshot(&snapshot).await {
            error!(error = %e, "market snapshot persist failed");
        }

        // ── 6. Standings ────────────────────────────────────────────────
        for (rank, row) in self.accounts.leaderboard().iter().enumerate() {
            info!(
                rank = rank + 1,
                trader_id = %row.trader_id,
                equity = %row.equity,
                pnl = %row.total_pnl,
                win_rate = %row.win_rate_pct,
                "leaderboard"
            );
        }

        info!(%outcome, "cycle complete");
        Ok(outcome)
    }

    /// Ask one provider for a decision and execute it. Returns false when
    /// the trader was skipped for this cycle.
    async fn process_trader(
        &self,
        trader_id: &str,
        provider: Arc<dyn DecisionProvider>,
        prices: &HashMap<String, Decimal>,
        context_rows: &[crate::market::SymbolContext],
    ) -> bool {
        let Some(account_handle) = self.accounts.get(trader_id) else {
            warn!(trader_id, "provider configured but no account exists");
            return false;
        };

        let ctx = {
            let account = account_handle.read();
            DecisionContext {
                trader_id: trader_id.to_string(),
                account: account.snapshot(),
                market: context_rows.to_vec(),
                open_positions: account.open_positions.values().cloned().collect(),
                grids: self.grids.summaries_for_trader(trader_id, prices),
                recent_trades: account
                    .recent_trades
                    .iter()
                    .rev()
                    .take(CONTEXT_TRADES)
                    .cloned()
                    .collect(),
            }
        };
        let digest = ctx.digest();

        let reply = match tokio::time::timeout(self.provider_timeout, provider.decide(&ctx)).await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(trader_id, error = %e, "provider failed — trader skipped this cycle");
                self.record_skip(trader_id, &digest, &format!("provider error: {e}"))
                    .await;
                return false;
            }
            Err(_) => {
                warn!(trader_id, "provider timed out — trader skipped this cycle");
                self.record_skip(trader_id, &digest, "provider timeout").await;
                return false;
            }
        };

        let decision = match Decision::from_value(&reply.value) {
            Ok(d) => d,
            Err(e) => {
                warn!(trader_id, error = %e, "unparseable decision — trader skipped this cycle");
                let record = DecisionRecord::new(
                    trader_id,
                    &digest,
                    "UNPARSEABLE",
                    None,
                    e.message.clone(),
                    0.0,
                    "PARSE_ERROR",
                    Some(e.message),
                    reply.raw,
                )
                .with_usage(
                    reply.tokens_prompt,
                    reply.tokens_completion,
                    reply.cost_usd,
                    reply.latency_ms,
                );
                self.insert_record(record).await;
                return false;
            }
        };

        info!(
            trader_id,
            action = decision.action.kind(),
            symbol = decision.symbol().unwrap_or("-"),
            confidence = decision.confidence,
            "decision received"
        );

        let result = self.executor.execute(trader_id, &decision, prices).await;
        info!(trader_id, result = %result, "execution result");

        let record = DecisionRecord::new(
            trader_id,
            &digest,
            decision.action.kind(),
            decision.symbol().map(|s| s.to_string()),
            decision.reasoning.clone(),
            decision.confidence,
            result.status_str(),
            result.detail(),
            reply.raw,
        )
        .with_usage(
            reply.tokens_prompt,
            reply.tokens_completion,
            reply.cost_usd,
            reply.latency_ms,
        );
        self.insert_record(record).await;

        true
    }

    async fn record_skip(&self, trader_id: &str, digest: &str, detail: &str) {
        let record = DecisionRecord::new(
            trader_id,
            digest,
            "SKIPPED",
            None,
            String::new(),
            0.0,
            "SKIPPED",
            Some(detail.to_string()),
            String::new(),
        );
        self.insert_record(record).await;
    }

    async fn insert_record(&self, record: DecisionRecord) {
        if let Err(e) = self.store.insert_decision(&record).await {
            error!(error = %e, "decision record persist failed");
        }
    }
}

impl std::fmt::Debug for TradingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingService")
            .field("providers", &self.providers.len())
            .finish()
    }
}
