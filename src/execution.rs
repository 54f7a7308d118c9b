// =============================================================================
// Trade Executor — turns accepted decisions into exchange orders
// =============================================================================
//
// Every outbound order carries an attribution tag (see order_tag.rs); the
// reconciler depends on it to map exchange state back to traders. Virtual
// account state mutates only after the exchange confirms an order — an
// accepted decision that fails at the exchange yields status ERROR and leaves
// every balance untouched.
//
// The executor also owns grid order flow: placement of ladder orders, the
// monitor tick (fill polling, cycle detection, re-arming), and stop handling
// with settlement back into the owning account.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::account::{AccountService, Trade};
use crate::binance::{BinanceFuturesClient, GatewayError, OrderRequest};
use crate::decision::{Action, Decision, OpenParams};
use crate::grid::{GridEngine, GridHandle, LevelStatus, NetExposure};
use crate::order_tag::OrderTag;
use crate::risk::RiskManager;
use crate::store::RecordStore;
use crate::types::{now_ms, ExitReason, PositionSide};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

/// Outcome of executing one decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionResult {
    /// The decision reached the exchange and virtual state was updated.
    Executed { message: String },
    /// HOLD — recorded, no side effects.
    Held,
    /// The risk manager (or the grid engine's invariants) refused it.
    Rejected { code: String, message: String },
    /// The exchange refused or the transport failed; no state was mutated.
    Error { code: String, message: String },
}

impl ExecutionResult {
    pub fn status_str(&self) -> &'static str {
        match self {
            Self::Executed { .. } => "EXECUTED",
            Self::Held => "HELD",
            Self::Rejected { .. } => "REJECTED",
            Self::Error { .. } => "ERROR",
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Held => None,
            Self::Executed { message } => Some(message.clone()),
            Self::Rejected { code, message } | Self::Error { code, message } => {
                Some(format!("{code}: {message}"))
            }
        }
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Executed { message } => write!(f, "EXECUTED({message})"),
            Self::Held => write!(f, "HELD"),
            Self::Rejected { code, message } => write!(f, "REJECTED({code}: {message})"),
            Self::Error { code, message } => write!(f, "ERROR({code}: {message})"),
        }
    }
}

/// Provider-facing error code for a gateway failure.
fn gateway_code(e: &GatewayError) -> String {
    match e {
        GatewayError::Transport(_) => "transport".to_string(),
        GatewayError::RateLimited(_) => "rate_limited".to_string(),
        GatewayError::Protocol { code, .. } => code.to_string(),
    }
}

/// Per-level placement summary for a grid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridPlacement {
    pub placed: u32,
    pub failed: Vec<String>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct TradeExecutor {
    client: Arc<BinanceFuturesClient>,
    accounts: Arc<AccountService>,
    grids: Arc<GridEngine>,
    risk: Arc<RiskManager>,
    store: Arc<dyn RecordStore>,
    fee_rate: Decimal,
}

impl TradeExecutor {
    pub fn new(
        client: Arc<BinanceFuturesClient>,
        accounts: Arc<AccountService>,
        grids: Arc<GridEngine>,
        risk: Arc<RiskManager>,
        store: Arc<dyn RecordStore>,
        fee_rate: Decimal,
    ) -> Self {
        Self {
            client,
            accounts,
            grids,
            risk,
            store,
            fee_rate,
        }
    }

    // -------------------------------------------------------------------------
    // Decision dispatch
    // -------------------------------------------------------------------------

    /// Validate and execute one decision for `trader_id`.
    pub async fn execute(
        &self,
        trader_id: &str,
        decision: &Decision,
        prices: &HashMap<String, Decimal>,
    ) -> ExecutionResult {
        let Some(account_handle) = self.accounts.get(trader_id) else {
            return ExecutionResult::Error {
                code: "unknown_trader".to_string(),
                message: format!("no account for {trader_id}"),
            };
        };

        if matches!(decision.action, Action::Hold) {
            info!(trader_id, reasoning = %decision.reasoning, "HOLD");
            return ExecutionResult::Held;
        }

        // Risk gate first; nothing leaves the process on a rejection.
        {
            let account = account_handle.read();
            if let Err(rejection) = self.risk.validate(decision, &account, prices) {
                warn!(trader_id, rejection = %rejection, "decision rejected");
                return ExecutionResult::Rejected {
                    code: rejection.code.to_string(),
                    message: rejection.message,
                };
            }
        }

        match &decision.action {
            Action::Hold => ExecutionResult::Held,
            Action::Open {
                symbol,
                side,
                params,
            } => {
                self.execute_open(trader_id, symbol, *side, params, prices)
                    .await
            }
            Action::Close { symbol } => {
                let position_id = {
                    let account = account_handle.read();
                    account
                        .position_for_symbol(symbol)
                        .map(|p| p.position_id.clone())
                };
                match position_id {
                    Some(id) => {
                        self.close_position_by_id(trader_id, &id, ExitReason::Manual, prices)
                            .await
                    }
                    None => ExecutionResult::Rejected {
                        code: "no_position_to_close".to_string(),
                        message: format!("no open position on {symbol}"),
                    },
                }
            }
            Action::SetupGrid { spec, .. } => self.setup_grid(trader_id, spec.clone()).await,
            Action::UpdateGrid { symbol, spec } => {
                // An update is a stop of the current ladder followed by a
                // fresh setup with the new parameters.
                if let Some(existing) = self.grids.active_grid_for(trader_id, symbol) {
                    let grid_id = existing.read().grid_id.clone();
                    let stopped = self
                        .stop_grid_by_id(trader_id, &grid_id, ExitReason::Strategy, prices)
                        .await;
                    if matches!(stopped, ExecutionResult::Error { .. }) {
                        return stopped;
                    }
                }
                self.setup_grid(trader_id, spec.clone()).await
            }
            Action::StopGrid { symbol } => {
                match self.grids.active_grid_for(trader_id, symbol) {
                    Some(handle) => {
                        let grid_id = handle.read().grid_id.clone();
                        self.stop_grid_by_id(trader_id, &grid_id, ExitReason::Manual, prices)
                            .await
                    }
                    None => ExecutionResult::Rejected {
                        code: "no_active_grid".to_string(),
                        message: format!("no active grid on {symbol}"),
                    },
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Directional positions
    // -------------------------------------------------------------------------

    async fn execute_open(
        &self,
        trader_id: &str,
        symbol: &str,
        side: PositionSide,
        params: &OpenParams,
        prices: &HashMap<String, Decimal>,
    ) -> ExecutionResult {
        let Some(&entry_price) = prices.get(symbol) else {
            return ExecutionResult::Error {
                code: "no_price".to_string(),
                message: format!("no price for {symbol}"),
            };
        };

        if let Err(e) = self.client.set_leverage(symbol, params.leverage).await {
            return ExecutionResult::Error {
                code: gateway_code(&e),
                message: format!("set_leverage failed: {e}"),
            };
        }

        let filters = match self.client.symbol_filters(symbol).await {
            Ok(f) => f,
            Err(e) => {
                return ExecutionResult::Error {
                    code: gateway_code(&e),
                    message: format!("symbol filters unavailable: {e}"),
                }
            }
        };
        let raw_qty = params.quantity_usd / entry_price;
        let quantity = crate::binance::round_to_step(raw_qty, filters.step_size);
        if quantity.is_zero() || quantity < filters.min_qty {
            return ExecutionResult::Error {
                code: "quantity_too_small".to_string(),
                message: format!("{raw_qty} rounds below the {symbol} minimum"),
            };
        }

        let tag = OrderTag::trader(trader_id, symbol, now_ms());
        let request = OrderRequest::market(symbol, side.entry_order_side(), quantity, tag.encode());

        let ack = match self.client.create_order(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                error!(trader_id, symbol, error = %e, "open order failed at exchange");
                return ExecutionResult::Error {
                    code: gateway_code(&e),
                    message: e.to_string(),
                };
            }
        };

        let fill_price = if ack.avg_price.is_zero() {
            entry_price
        } else {
            ack.avg_price
        };

        let account_handle = self.accounts.get(trader_id).expect("validated above");
        let position = {
            let mut account = account_handle.write();
            match account.open_position(
                symbol,
                side,
                fill_price,
                params.quantity_usd,
                params.leverage,
                params.stop_loss_pct,
                params.take_profit_pct,
            ) {
                Ok(p) => p,
                Err(e) => {
                    // The exchange order stands; the reconciler will adopt it
                    // on its next pass.
                    error!(trader_id, symbol, error = %e, "virtual open failed after exchange fill");
                    return ExecutionResult::Error {
                        code: "account_state".to_string(),
                        message: e.to_string(),
                    };
                }
            }
        };

        self.persist_account(trader_id).await;
        if let Err(e) = self.store.upsert_position(&position).await {
            error!(error = %e, "failed to persist position");
        }

        ExecutionResult::Executed {
            message: format!(
                "opened {side} {symbol} qty {quantity} @ {fill_price} (order {})",
                ack.order_id
            ),
        }
    }

    /// Close one position with a reduce-only market order, then settle the
    /// virtual account. Used by CLOSE decisions, SL/TP triggers, and manual
    /// intervention paths.
    pub async fn close_position_by_id(
        &self,
        trader_id: &str,
        position_id: &str,
        reason: ExitReason,
        prices: &HashMap<String, Decimal>,
    ) -> ExecutionResult {
        let Some(account_handle) = self.accounts.get(trader_id) else {
            return ExecutionResult::Error {
                code: "unknown_trader".to_string(),
                message: format!("no account for {trader_id}"),
            };
        };

        let Some(position) = account_handle.read().open_positions.get(position_id).cloned() else {
            return ExecutionResult::Rejected {
                code: "no_position_to_close".to_string(),
                message: format!("position {position_id} not found"),
            };
        };

        let quantity = match self.client.round_step(&position.symbol, position.quantity).await {
            Ok(q) if !q.is_zero() => q,
            Ok(_) => position.quantity,
            Err(e) => {
                return ExecutionResult::Error {
                    code: gateway_code(&e),
                    message: format!("round_step failed: {e}"),
                }
            }
        };

        let tag = OrderTag::trader(trader_id, &position.symbol, now_ms());
        let request = OrderRequest::market(
            &position.symbol,
            position.side.exit_order_side(),
            quantity,
            tag.encode(),
        )
        .reduce_only();

        let ack = match self.client.create_order(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                error!(trader_id, symbol = %position.symbol, error = %e, "close order failed at exchange");
                return ExecutionResult::Error {
                    code: gateway_code(&e),
                    message: e.to_string(),
                };
            }
        };

        let exit_price = if ack.avg_price.is_zero() {
            prices
                .get(&position.symbol)
                .copied()
                .unwrap_or(position.entry_price)
        } else {
            ack.avg_price
        };

        let trade = {
            let mut account = account_handle.write();
            match account.close_position(position_id, exit_price, reason) {
                Ok(t) => t,
                Err(e) => {
                    return ExecutionResult::Error {
                        code: "account_state".to_string(),
                        message: e.to_string(),
                    }
                }
            }
        };

        self.persist_account(trader_id).await;
        if let Err(e) = self.store.insert_trade(&trade).await {
            error!(error = %e, "failed to persist trade");
        }
        if let Err(e) = self.store.remove_position(position_id).await {
            error!(error = %e, "failed to remove position row");
        }

        ExecutionResult::Executed {
            message: format!(
                "closed {} {} pnl {} ({})",
                trade.side, trade.symbol, trade.pnl, reason
            ),
        }
    }

    /// Close every position whose stop-loss or take-profit price has been
    /// breached. Runs at the top of each decision cycle.
    pub async fn auto_close_triggers(&self, prices: &HashMap<String, Decimal>) -> (u32, u32) {
        let mut stop_losses = 0;
        let mut take_profits = 0;

        for trader_id in self.accounts.trader_ids() {
            let Some(handle) = self.accounts.get(&trader_id) else {
                continue;
            };
            let (sl, tp) = {
                let account = handle.read();
                (
                    self.risk.stop_loss_triggers(&account, prices),
                    self.risk.take_profit_triggers(&account, prices),
                )
            };

            for position_id in sl {
                let result = self
                    .close_position_by_id(&trader_id, &position_id, ExitReason::StopLoss, prices)
                    .await;
                if matches!(result, ExecutionResult::Executed { .. }) {
                    stop_losses += 1;
                } else {
                    warn!(trader_id, position_id, result = %result, "stop-loss close failed");
                }
            }
            for position_id in tp {
                let result = self
                    .close_position_by_id(&trader_id, &position_id, ExitReason::TakeProfit, prices)
                    .await;
                if matches!(result, ExecutionResult::Executed { .. }) {
                    take_profits += 1;
                } else {
                    warn!(trader_id, position_id, result = %result, "take-profit close failed");
                }
            }
        }

        (stop_losses, take_profits)
    }

    // -------------------------------------------------------------------------
    // Grids
    // -------------------------------------------------------------------------

    async fn setup_grid(&self, trader_id: &str, spec: crate::grid::GridSpec) -> ExecutionResult {
        let account_handle = self.accounts.get(trader_id).expect("validated above");
        let investment = spec.investment;
        let symbol = spec.symbol.clone();

        // Lock the investment before anything reaches the exchange.
        if let Err(e) = account_handle.write().lock_margin(investment) {
            return ExecutionResult::Rejected {
                code: "insufficient_balance".to_string(),
                message: e.to_string(),
            };
        }

        let handle = match self.grids.create_grid(trader_id, spec).await {
            Ok(h) => h,
            Err(e) => {
                account_handle.write().release_margin(investment);
                return ExecutionResult::Rejected {
                    code: "grid_error".to_string(),
                    message: e.to_string(),
                };
            }
        };

        let placement = self.place_grid_orders(&handle).await;
        self.grids.persist(&handle).await;
        self.persist_account(trader_id).await;

        if placement.placed == 0 {
            // Nothing went live: roll the grid back entirely.
            let grid_id = handle.read().grid_id.clone();
            let _ = self.grids.stop_grid(&grid_id, "placement_failed").await;
            account_handle.write().release_margin(investment);
            self.persist_account(trader_id).await;
            return ExecutionResult::Error {
                code: "grid_placement_failed".to_string(),
                message: format!("all level orders failed on {symbol}"),
            };
        }

        let grid_id = handle.read().grid_id.clone();
        ExecutionResult::Executed {
            message: format!(
                "grid {grid_id} live with {} orders ({} failed)",
                placement.placed,
                placement.failed.len()
            ),
        }
    }

    /// Place limit orders for every PENDING level that has no live order yet.
    /// Failures are per-level: a partially placed ladder still trades.
    pub async fn place_grid_orders(&self, handle: &GridHandle) -> GridPlacement {
        let (symbol, leverage, levels) = {
            let g = handle.read();
            let pending: Vec<_> = g
                .pending_levels()
                .into_iter()
                .filter(|l| l.order_id.is_none())
                .collect();
            (g.spec.symbol.clone(), g.spec.leverage, pending)
        };

        let mut placement = GridPlacement::default();
        if levels.is_empty() {
            return placement;
        }

        if let Err(e) = self.client.set_leverage(&symbol, leverage).await {
            warn!(symbol, error = %e, "set_leverage failed before grid placement");
            placement.failed = levels.into_iter().map(|l| l.level_id).collect();
            return placement;
        }

        for level in levels {
            let price = match self.client.round_tick(&symbol, level.price).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(level_id = %level.level_id, error = %e, "tick rounding failed");
                    placement.failed.push(level.level_id);
                    continue;
                }
            };
            let quantity = match self.client.round_step(&symbol, level.quantity).await {
                Ok(q) if !q.is_zero() => q,
                _ => {
                    warn!(level_id = %level.level_id, "level quantity rounds to zero");
                    placement.failed.push(level.level_id);
                    continue;
                }
            };

            let request =
                OrderRequest::limit(&symbol, level.side, quantity, price, level.level_id.clone());
            match self.client.create_order(&request).await {
                Ok(ack) => {
                    handle.write().set_order_id(&level.level_id, ack.order_id);
                    placement.placed += 1;
                    debug!(level_id = %level.level_id, order_id = ack.order_id, "level order placed");
                }
                Err(e) => {
                    warn!(level_id = %level.level_id, error = %e, "level order failed");
                    placement.failed.push(level.level_id);
                }
            }
        }

        placement
    }

    /// One monitor tick over every ACTIVE grid: poll pending orders, ingest
    /// fills, detect cycles, re-place re-armed levels, and enforce stops.
    pub async fn monitor_grids(&self, prices: &HashMap<String, Decimal>) {
        for handle in self.grids.all_active() {
            let (grid_id, trader_id, symbol) = {
                let g = handle.read();
                (g.grid_id.clone(), g.trader_id.clone(), g.spec.symbol.clone())
            };

            // Stop-loss first: a stopped grid needs no fill polling.
            if let Some(&price) = prices.get(&symbol) {
                if handle.read().stop_loss_hit(price) {
                    warn!(grid_id, %price, "grid stop-loss breached");
                    let _ = self
                        .stop_grid_by_id(&trader_id, &grid_id, ExitReason::StopLoss, prices)
                        .await;
                    continue;
                }
            }

            // Poll the exchange for fills on known orders.
            let pending: Vec<(String, u64)> = handle
                .read()
                .pending_levels()
                .into_iter()
                .filter_map(|l| l.order_id.map(|id| (l.level_id, id)))
                .collect();

            let mut fills = Vec::new();
            for (level_id, order_id) in pending {
                match self.client.get_order(&symbol, order_id).await {
                    Ok(order) if order.is_filled() => {
                        let fill_price = if order.avg_price.is_zero() {
                            order.price
                        } else {
                            order.avg_price
                        };
                        fills.push((level_id, order_id, fill_price));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(grid_id, level_id, error = %e, "order status poll failed");
                    }
                }
            }

            if !fills.is_empty() {
                let cycles = {
                    let mut g = handle.write();
                    for (level_id, order_id, fill_price) in &fills {
                        g.mark_level_filled(level_id, *order_id, *fill_price, Utc::now());
                    }
                    g.detect_cycles(self.fee_rate)
                };
                for cycle in &cycles {
                    info!(
                        grid_id,
                        buy = %cycle.buy_price,
                        sell = %cycle.sell_price,
                        net = %cycle.net,
                        "cycle recorded"
                    );
                }
                // Re-place orders for the re-armed levels.
                let placement = self.place_grid_orders(&handle).await;
                if !placement.failed.is_empty() {
                    warn!(grid_id, failed = placement.failed.len(), "re-arm placement failures");
                }
            }

            self.grids.persist(&handle).await;
        }
    }

    /// Stop a grid: cancel its live orders, settle margin and profit into the
    /// owning account, and emit the closing Trade.
    pub async fn stop_grid_by_id(
        &self,
        trader_id: &str,
        grid_id: &str,
        reason: ExitReason,
        prices: &HashMap<String, Decimal>,
    ) -> ExecutionResult {
        let handle = match self.grids.stop_grid(grid_id, reason.as_str()).await {
            Ok(h) => h,
            Err(e) => {
                return ExecutionResult::Rejected {
                    code: "grid_error".to_string(),
                    message: e.to_string(),
                }
            }
        };

        let (symbol, investment, net_profit, exposure, open_order_ids) = {
            let g = handle.read();
            let ids: Vec<u64> = g
                .levels()
                .filter(|l| l.status == LevelStatus::Pending)
                .filter_map(|l| l.order_id)
                .collect();
            (
                g.spec.symbol.clone(),
                g.spec.investment,
                g.net_profit,
                g.net_exposure(),
                ids,
            )
        };

        // Cancel this grid's orders individually; the symbol may carry other
        // traders' orders.
        for order_id in open_order_ids {
            if let Err(e) = self.client.cancel_order(&symbol, order_id).await {
                warn!(grid_id, order_id, error = %e, "cancel failed during grid stop");
            }
        }

        let current_price = prices.get(&symbol).copied();
        let trade = build_grid_close_trade(
            trader_id,
            &symbol,
            grid_id,
            investment,
            net_profit,
            exposure,
            current_price,
            reason,
        );

        if let Some(account_handle) = self.accounts.get(trader_id) {
            account_handle.write().settle_locked(investment, &trade);
        }
        self.persist_account(trader_id).await;
        if let Err(e) = self.store.insert_trade(&trade).await {
            error!(error = %e, "failed to persist grid close trade");
        }
        self.grids.persist(&handle).await;

        ExecutionResult::Executed {
            message: format!("grid {grid_id} stopped ({reason}), pnl {}", trade.pnl),
        }
    }

    async fn persist_account(&self, trader_id: &str) {
        if let Some(handle) = self.accounts.get(trader_id) {
            let snapshot = handle.read().clone();
            if let Err(e) = self.store.upsert_account(&snapshot).await {
                error!(trader_id, error = %e, "failed to persist account");
            }
        }
    }
}

/// Closing Trade for a stopped grid: banked cycle profit plus the mark-to-
/// market of any residual unmatched exposure.
#[allow(clippy::too_many_arguments)]
fn build_grid_close_trade(
    trader_id: &str,
    symbol: &str,
    grid_id: &str,
    investment: Decimal,
    net_profit: Decimal,
    exposure: NetExposure,
    current_price: Option<Decimal>,
    reason: ExitReason,
) -> Trade {
    let residual_pnl = match current_price {
        Some(price) if !exposure.quantity.is_zero() && !exposure.avg_entry_price.is_zero() => {
            (price - exposure.avg_entry_price) * exposure.quantity
        }
        _ => Decimal::ZERO,
    };
    let pnl = net_profit + residual_pnl;
    let pnl_pct = if investment.is_zero() {
        Decimal::ZERO
    } else {
        pnl / investment * HUNDRED
    };

    let now = Utc::now();
    Trade {
        trade_id: format!("{grid_id}_close"),
        trader_id: trader_id.to_string(),
        symbol: symbol.to_string(),
        side: PositionSide::Long,
        entry_price: exposure.avg_entry_price,
        exit_price: current_price.unwrap_or(exposure.avg_entry_price),
        quantity: exposure.quantity.max(Decimal::ZERO),
        leverage: 1,
        pnl,
        pnl_pct,
        opened_at: now,
        closed_at: now,
        exit_reason: reason,
    }
}

impl std::fmt::Debug for TradeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeExecutor")
            .field("fee_rate", &self.fee_rate)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn execution_result_status_strings() {
        assert_eq!(
            ExecutionResult::Executed {
                message: "ok".to_string()
            }
            .status_str(),
            "EXECUTED"
        );
        assert_eq!(ExecutionResult::Held.status_str(), "HELD");
        assert_eq!(
            ExecutionResult::Rejected {
                code: "insufficient_balance".to_string(),
                message: "x".to_string()
            }
            .status_str(),
            "REJECTED"
        );
        assert_eq!(
            ExecutionResult::Error {
                code: "-1021".to_string(),
                message: "x".to_string()
            }
            .status_str(),
            "ERROR"
        );
    }

    #[test]
    fn held_has_no_detail() {
        assert!(ExecutionResult::Held.detail().is_none());
        let detail = ExecutionResult::Rejected {
            code: "no_price".to_string(),
            message: "no price for ETHUSDT".to_string(),
        }
        .detail()
        .unwrap();
        assert!(detail.starts_with("no_price:"));
    }

    #[test]
    fn gateway_codes_map_to_taxonomy() {
        assert_eq!(
            gateway_code(&GatewayError::Transport("timeout".to_string())),
            "transport"
        );
        assert_eq!(
            gateway_code(&GatewayError::RateLimited("429".to_string())),
            "rate_limited"
        );
        assert_eq!(
            gateway_code(&GatewayError::Protocol {
                status: 400,
                code: -2019,
                message: "margin is insufficient".to_string()
            }),
            "-2019"
        );
    }

    #[test]
    fn grid_close_trade_banks_profit_and_residual() {
        let exposure = NetExposure {
            quantity: dec!(0.5),
            avg_entry_price: dec!(100),
        };
        let trade = build_grid_close_trade(
            "LLM-A",
            "BNBUSDT",
            "GRID_LLM-A_BNBUSDT_a1b2c3d4",
            dec!(120),
            dec!(4.9475),
            exposure,
            Some(dec!(96)),
            ExitReason::StopLoss,
        );

        // Residual: (96 - 100) * 0.5 = -2; total = 4.9475 - 2 = 2.9475.
        assert_eq!(trade.pnl, dec!(2.9475));
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert_eq!(trade.trade_id, "GRID_LLM-A_BNBUSDT_a1b2c3d4_close");
        // pnl_pct against the invested margin.
        assert!((trade.pnl_pct - dec!(2.45625)).abs() < dec!(0.00001));
    }

    #[test]
    fn grid_close_trade_without_price_uses_banked_profit_only() {
        let exposure = NetExposure {
            quantity: dec!(0.5),
            avg_entry_price: dec!(100),
        };
        let trade = build_grid_close_trade(
            "LLM-A",
            "BNBUSDT",
            "g",
            dec!(120),
            dec!(10),
            exposure,
            None,
            ExitReason::Manual,
        );
        assert_eq!(trade.pnl, dec!(10));
        assert_eq!(trade.exit_price, dec!(100));
    }
}
