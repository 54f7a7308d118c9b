// =============================================================================
// Position Reconciler — re-align virtual accounts with exchange truth
// =============================================================================
//
// The reconciler is the only component allowed to retroactively create or
// destroy positions in the account service outside of the executor. Each pass:
//
//   1. Snapshot exchange truth: open positions and open orders.
//   2. Attribute each exchange position to a trader via the client-order-id
//      tags on that symbol's orders (and the virtual books as a tiebreaker);
//      positions no trader can claim are flagged unowned and skipped.
//   3. Per (trader, symbol): create missing virtual positions from exchange
//      data, close virtual positions the exchange no longer has (LIQUIDATION
//      when the mark was near the liquidation price, MANUAL otherwise), and
//      align entry price / quantity on positions both sides hold.
//   4. Emit a per-trader delta and flush to the record store.
//
// Account locks are taken strictly in lexicographic trader order, one at a
// time, so a concurrent executor can never deadlock against a pass.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::account::{AccountService, Position, PositionStatus};
use crate::binance::{BinanceFuturesClient, ExchangeOrder, ExchangePosition};
use crate::order_tag::OrderTag;
use crate::store::RecordStore;
use crate::types::{ExitReason, PositionSide};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// A virtual position is closed as LIQUIDATION when the last mark price sat
/// within this percentage of the liquidation price.
const LIQUIDATION_NEAR_PCT: Decimal = Decimal::from_parts(5, 0, 0, false, 0);

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraderDelta {
    pub trader_id: String,
    pub added: u32,
    pub updated: u32,
    pub removed: u32,
}

impl TraderDelta {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.removed == 0
    }
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub exchange_positions: u32,
    pub unowned_positions: u32,
    pub deltas: Vec<TraderDelta>,
    pub timestamp: String,
}

impl ReconcileReport {
    /// True when the pass changed nothing (replaying it was a no-op).
    pub fn is_clean(&self) -> bool {
        self.deltas.iter().all(TraderDelta::is_empty)
    }
}

// ---------------------------------------------------------------------------
// Attribution (pure)
// ---------------------------------------------------------------------------

/// Map each open exchange position to its owning trader.
///
/// Candidate owners for a symbol are every trader with a tagged order on that
/// symbol plus every trader whose virtual book holds the symbol. Exactly one
/// candidate means ownership; zero or several means the position is unowned
/// and must not be touched.
pub fn attribute_positions(
    positions: &[ExchangePosition],
    orders: &[ExchangeOrder],
    virtual_holders: &HashMap<String, Vec<String>>,
) -> (Vec<(String, ExchangePosition)>, Vec<ExchangePosition>) {
    // symbol -> traders hinted by order tags
    let mut order_hints: HashMap<&str, HashSet<&str>> = HashMap::new();
    let mut parsed_tags: Vec<(usize, OrderTag)> = Vec::new();
    for (i, order) in orders.iter().enumerate() {
        if let Some(tag) = OrderTag::parse(&order.client_order_id) {
            parsed_tags.push((i, tag));
        }
    }
    for (i, tag) in &parsed_tags {
        order_hints
            .entry(orders[*i].symbol.as_str())
            .or_default()
            .insert(tag.trader_id());
    }

    let mut owned = Vec::new();
    let mut unowned = Vec::new();

    for position in positions.iter().filter(|p| p.is_open()) {
        let mut candidates: HashSet<String> = HashSet::new();
        if let Some(hints) = order_hints.get(position.symbol.as_str()) {
            candidates.extend(hints.iter().map(|s| s.to_string()));
        }
        if let Some(holders) = virtual_holders.get(&position.symbol) {
            candidates.extend(holders.iter().cloned());
        }

        match candidates.len() {
            1 => {
                let trader_id = candidates.into_iter().next().expect("len checked");
                owned.push((trader_id, position.clone()));
            }
            0 => {
                warn!(symbol = %position.symbol, "exchange position has no attributable owner");
                unowned.push(position.clone());
            }
            n => {
                warn!(
                    symbol = %position.symbol,
                    candidates = n,
                    "exchange position has ambiguous ownership — skipping"
                );
                unowned.push(position.clone());
            }
        }
    }

    (owned, unowned)
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct PositionReconciler {
    client: Arc<BinanceFuturesClient>,
    accounts: Arc<AccountService>,
    store: Arc<dyn RecordStore>,
}

impl PositionReconciler {
    pub fn new(
        client: Arc<BinanceFuturesClient>,
        accounts: Arc<AccountService>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            client,
            accounts,
            store,
        }
    }

    /// Run one reconciliation pass.
    pub async fn reconcile_once(&self) -> anyhow::Result<ReconcileReport> {
        let timestamp = Utc::now().to_rfc3339();
        info!(timestamp = %timestamp, "reconciliation pass started");

        // ── 1. Exchange truth snapshot ──────────────────────────────────
        let exchange_positions: Vec<ExchangePosition> = self
            .client
            .get_positions()
            .await?
            .into_iter()
            .filter(|p| p.is_open())
            .collect();
        let open_orders = self.client.get_open_orders(None).await?;

        // Mark prices for unrealised PnL updates after the sync.
        let mark_prices: HashMap<String, Decimal> = exchange_positions
            .iter()
            .filter(|p| !p.mark_price.is_zero())
            .map(|p| (p.symbol.clone(), p.mark_price))
            .collect();

        // ── 2. Attribution ──────────────────────────────────────────────
        let virtual_holders = self.virtual_holders();
        let (owned, unowned) =
            attribute_positions(&exchange_positions, &open_orders, &virtual_holders);

        // (trader, symbol) -> exchange position
        let mut by_owner: HashMap<(String, String), ExchangePosition> = HashMap::new();
        for (trader_id, position) in owned {
            by_owner.insert((trader_id, position.symbol.clone()), position);
        }

        // ── 3. Per-trader sync, lexicographic lock order ────────────────
        let mut deltas = Vec::new();
        for trader_id in self.accounts.trader_ids() {
            let delta = self.sync_trader(&trader_id, &by_owner, &mark_prices).await;
            if !delta.is_empty() {
                info!(
                    trader_id,
                    added = delta.added,
                    updated = delta.updated,
                    removed = delta.removed,
                    "reconciliation delta"
                );
            }
            deltas.push(delta);
        }

        // ── 4. Balance sanity against the exchange of record ────────────
        match self.client.get_account().await {
            Ok(account_info) => {
                let combined_equity = self.accounts.summary().combined_equity;
                info!(
                    exchange_wallet = %account_info.total_wallet_balance,
                    exchange_unrealized = %account_info.total_unrealized_pnl,
                    virtual_equity = %combined_equity,
                    "balance snapshot"
                );
            }
            Err(e) => warn!(error = %e, "could not fetch exchange account totals"),
        }

        // ── 5. Flush ────────────────────────────────────────────────────
        self.accounts.sync_all().await?;

        let report = ReconcileReport {
            exchange_positions: exchange_positions.len() as u32,
            unowned_positions: unowned.len() as u32,
            deltas,
            timestamp,
        };

        info!(
            exchange_positions = report.exchange_positions,
            unowned = report.unowned_positions,
            clean = report.is_clean(),
            "reconciliation pass complete"
        );

        Ok(report)
    }

    /// symbol -> traders whose virtual book holds it.
    fn virtual_holders(&self) -> HashMap<String, Vec<String>> {
        let mut holders: HashMap<String, Vec<String>> = HashMap::new();
        for trader_id in self.accounts.trader_ids() {
            let Some(handle) = self.accounts.get(&trader_id) else {
                continue;
            };
            let account = handle.read();
            for position in account.open_positions.values() {
                holders
                    .entry(position.symbol.clone())
                    .or_default()
                    .push(trader_id.clone());
            }
        }
        holders
    }

    async fn sync_trader(
        &self,
        trader_id: &str,
        by_owner: &HashMap<(String, String), ExchangePosition>,
        mark_prices: &HashMap<String, Decimal>,
    ) -> TraderDelta {
        let mut delta = TraderDelta {
            trader_id: trader_id.to_string(),
            ..TraderDelta::default()
        };
        let Some(handle) = self.accounts.get(trader_id) else {
            return delta;
        };

        // Symbols this trader owns on the exchange.
        let exchange_symbols: Vec<&ExchangePosition> = by_owner
            .iter()
            .filter(|((t, _), _)| t == trader_id)
            .map(|(_, p)| p)
            .collect();

        // -- create or update -------------------------------------------------
        for exchange_position in &exchange_symbols {
            let symbol = exchange_position.symbol.clone();
            let quantity = exchange_position.position_amt.abs();
            let side = if exchange_position.position_amt > Decimal::ZERO {
                PositionSide::Long
            } else {
                PositionSide::Short
            };

            let exists = handle.read().position_for_symbol(&symbol).is_some();
            if exists {
                let changed = handle.write().reconcile_position(
                    &symbol,
                    exchange_position.entry_price,
                    quantity,
                );
                if changed {
                    delta.updated += 1;
                }
            } else {
                let leverage = exchange_position.leverage.max(1);
                let margin_used =
                    exchange_position.entry_price * quantity / Decimal::from(leverage);
                let position = Position {
                    position_id: uuid::Uuid::new_v4().to_string(),
                    trader_id: trader_id.to_string(),
                    symbol: symbol.clone(),
                    side,
                    entry_price: exchange_position.entry_price,
                    quantity,
                    leverage,
                    margin_used,
                    stop_loss_price: None,
                    take_profit_price: None,
                    opened_at: Utc::now(),
                    status: PositionStatus::Open,
                };
                warn!(
                    trader_id,
                    symbol = %symbol,
                    %quantity,
                    entry = %exchange_position.entry_price,
                    "adopting exchange position missing from virtual book"
                );
                if let Err(e) = self.store.upsert_position(&position).await {
                    warn!(error = %e, "failed to persist adopted position");
                }
                handle.write().adopt_position(position);
                delta.added += 1;
            }
        }

        // -- remove virtual positions the exchange no longer has --------------
        let exchange_owned: HashSet<String> = exchange_symbols
            .iter()
            .map(|p| p.symbol.clone())
            .collect();
        let stale: Vec<Position> = handle
            .read()
            .open_positions
            .values()
            .filter(|p| !exchange_owned.contains(&p.symbol))
            .cloned()
            .collect();

        for position in stale {
            let last_price = match mark_prices.get(&position.symbol) {
                Some(&p) => p,
                None => self
                    .client
                    .get_ticker_price(&position.symbol)
                    .await
                    .unwrap_or(position.entry_price),
            };
            let reason = if near_liquidation(&position, last_price) {
                ExitReason::Liquidation
            } else {
                ExitReason::Manual
            };

            warn!(
                trader_id,
                symbol = %position.symbol,
                reason = %reason,
                "closing virtual position absent from exchange"
            );

            let closed = handle
                .write()
                .close_position(&position.position_id, last_price, reason);
            match closed {
                Ok(trade) => {
                    if let Err(e) = self.store.insert_trade(&trade).await {
                        warn!(error = %e, "failed to persist reconciliation trade");
                    }
                    if let Err(e) = self.store.remove_position(&position.position_id).await {
                        warn!(error = %e, "failed to remove position row");
                    }
                    delta.removed += 1;
                }
                Err(e) => warn!(error = %e, "reconciliation close failed"),
            }
        }

        // Refresh unrealised PnL from the marks we just saw.
        if !mark_prices.is_empty() {
            handle.write().update_unrealized(mark_prices);
        }

        delta
    }
}

/// Was this position's last seen price within `LIQUIDATION_NEAR_PCT` of its
/// liquidation price?
fn near_liquidation(position: &Position, last_price: Decimal) -> bool {
    let liquidation = position.liquidation_price();
    if liquidation.is_zero() {
        return false;
    }
    let distance_pct = match position.side {
        PositionSide::Long => (last_price - liquidation) / liquidation * HUNDRED,
        PositionSide::Short => (liquidation - last_price) / last_price.max(Decimal::ONE) * HUNDRED,
    };
    distance_pct <= LIQUIDATION_NEAR_PCT
}

impl std::fmt::Debug for PositionReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionReconciler").finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderSide;
    use rust_decimal_macros::dec;

    fn exchange_position(symbol: &str, amt: Decimal) -> ExchangePosition {
        ExchangePosition {
            symbol: symbol.to_string(),
            position_amt: amt,
            entry_price: dec!(100),
            unrealized_pnl: dec!(0),
            leverage: 3,
            liquidation_price: dec!(66.6),
            mark_price: dec!(101),
        }
    }

    fn tagged_order(symbol: &str, client_order_id: &str) -> ExchangeOrder {
        ExchangeOrder {
            symbol: symbol.to_string(),
            order_id: 1,
            client_order_id: client_order_id.to_string(),
            side: Some(OrderSide::Buy),
            price: dec!(100),
            orig_qty: dec!(1),
            executed_qty: dec!(0),
            avg_price: dec!(0),
            status: "NEW".to_string(),
            reduce_only: false,
        }
    }

    #[test]
    fn attribution_via_order_tag() {
        let positions = vec![exchange_position("ETHUSDT", dec!(0.5))];
        let orders = vec![tagged_order("ETHUSDT", "LLM-A_ETHUSDT_1728394875123")];

        let (owned, unowned) = attribute_positions(&positions, &orders, &HashMap::new());
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].0, "LLM-A");
        assert!(unowned.is_empty());
    }

    #[test]
    fn attribution_via_grid_tag() {
        let positions = vec![exchange_position("BNBUSDT", dec!(1))];
        let orders = vec![tagged_order("BNBUSDT", "GRID_LLM-B_BNBUSDT_a1b2c3d4_BUY_3")];

        let (owned, _) = attribute_positions(&positions, &orders, &HashMap::new());
        assert_eq!(owned[0].0, "LLM-B");
    }

    #[test]
    fn untagged_position_is_unowned() {
        let positions = vec![exchange_position("XRPUSDT", dec!(10))];
        let orders = vec![tagged_order("XRPUSDT", "random-order-42")];

        let (owned, unowned) = attribute_positions(&positions, &orders, &HashMap::new());
        assert!(owned.is_empty());
        assert_eq!(unowned.len(), 1);
    }

    #[test]
    fn ambiguous_ownership_is_unowned() {
        let positions = vec![exchange_position("ETHUSDT", dec!(0.5))];
        let orders = vec![
            tagged_order("ETHUSDT", "LLM-A_ETHUSDT_1728394875123"),
            tagged_order("ETHUSDT", "LLM-B_ETHUSDT_1728394875124"),
        ];

        let (owned, unowned) = attribute_positions(&positions, &orders, &HashMap::new());
        assert!(owned.is_empty());
        assert_eq!(unowned.len(), 1);
    }

    #[test]
    fn virtual_book_breaks_the_tie_when_orders_are_silent() {
        let positions = vec![exchange_position("ETHUSDT", dec!(0.5))];
        let mut holders = HashMap::new();
        holders.insert("ETHUSDT".to_string(), vec!["LLM-C".to_string()]);

        let (owned, _) = attribute_positions(&positions, &[], &holders);
        assert_eq!(owned[0].0, "LLM-C");
    }

    #[test]
    fn flat_rows_are_ignored() {
        let positions = vec![exchange_position("ETHUSDT", dec!(0))];
        let (owned, unowned) = attribute_positions(&positions, &[], &HashMap::new());
        assert!(owned.is_empty());
        assert!(unowned.is_empty());
    }

    #[test]
    fn near_liquidation_detection() {
        let position = Position {
            position_id: "p".to_string(),
            trader_id: "LLM-A".to_string(),
            symbol: "ETHUSDT".to_string(),
            side: PositionSide::Long,
            entry_price: dec!(100),
            quantity: dec!(1),
            leverage: 4,
            margin_used: dec!(25),
            stop_loss_price: None,
            take_profit_price: None,
            opened_at: Utc::now(),
            status: PositionStatus::Open,
        };
        // Liquidation at 75: a last price of 76 is within 5%, 95 is not.
        assert!(near_liquidation(&position, dec!(76)));
        assert!(!near_liquidation(&position, dec!(95)));
    }
}
