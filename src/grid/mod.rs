// =============================================================================
// Grid Engine — registry of live ladders, lifecycle, and restart recovery
// =============================================================================
//
// The engine owns every grid instance, one lock per grid: two fills on the
// same grid serialise, fills on different grids never contend. At most one
// ACTIVE grid may exist per (trader, symbol).
//
// Restart recovery reads the exchange's open orders, parses the grid-pattern
// client-order-ids, groups them by grid id, and rebuilds an instance per
// group. A grid whose configuration row is in the record store is restored
// exactly (counters included); otherwise the configuration is inferred from
// the orders with conservative defaults and a warning. Grid-pattern orders
// that cannot be mapped onto any rebuilt ladder are logged as orphans for
// operator review; unrecognised orders are left untouched.
// =============================================================================

pub mod instance;

pub use instance::{
    CycleReport, GridError, GridInstance, GridLevel, GridLimits, GridSpec, GridStatus,
    GridSummary, LevelStatus, NetExposure, SpacingKind,
};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::binance::ExchangeOrder;
use crate::order_tag::OrderTag;
use crate::store::RecordStore;

/// Defaults used when a grid must be reconstructed purely from open orders.
const FALLBACK_LEVERAGE: u32 = 3;
const FALLBACK_STOP_LOSS_PCT: u32 = 12;

/// Shared handle to one grid.
pub type GridHandle = Arc<RwLock<GridInstance>>;

/// Outcome of a restart recovery pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreReport {
    pub grids_restored: u32,
    pub from_store: u32,
    pub reconstructed: u32,
    pub orders_adopted: u32,
    pub orphan_orders: Vec<String>,
}

pub struct GridEngine {
    grids: RwLock<HashMap<String, GridHandle>>,
    store: Arc<dyn RecordStore>,
}

impl GridEngine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            grids: RwLock::new(HashMap::new()),
            store,
        }
    }

    // -------------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------------

    pub fn get(&self, grid_id: &str) -> Option<GridHandle> {
        self.grids.read().get(grid_id).cloned()
    }

    /// The ACTIVE grid for (trader, symbol), if one exists.
    pub fn active_grid_for(&self, trader_id: &str, symbol: &str) -> Option<GridHandle> {
        self.grids
            .read()
            .values()
            .find(|handle| {
                let g = handle.read();
                g.trader_id == trader_id
                    && g.spec.symbol == symbol
                    && g.status == GridStatus::Active
            })
            .cloned()
    }

    pub fn grids_for_trader(&self, trader_id: &str) -> Vec<GridHandle> {
        self.grids
            .read()
            .values()
            .filter(|handle| handle.read().trader_id == trader_id)
            .cloned()
            .collect()
    }

    pub fn all_active(&self) -> Vec<GridHandle> {
        self.grids
            .read()
            .values()
            .filter(|handle| handle.read().status == GridStatus::Active)
            .cloned()
            .collect()
    }

    /// Risk summaries for a trader's grids (for the decision context).
    pub fn summaries_for_trader(
        &self,
        trader_id: &str,
        prices: &HashMap<String, Decimal>,
    ) -> Vec<GridSummary> {
        self.grids_for_trader(trader_id)
            .iter()
            .map(|handle| {
                let g = handle.read();
                g.summary(prices.get(&g.spec.symbol).copied())
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Create and register a grid. The spec must already be risk-validated;
    /// the one-active-grid-per-(trader, symbol) invariant is enforced here.
    pub async fn create_grid(
        &self,
        trader_id: &str,
        spec: GridSpec,
    ) -> Result<GridHandle, GridError> {
        if let Some(existing) = self.active_grid_for(trader_id, &spec.symbol) {
            let grid_id = existing.read().grid_id.clone();
            return Err(GridError::AlreadyActive(grid_id, spec.symbol));
        }

        let grid = GridInstance::create(trader_id, spec);
        let grid_id = grid.grid_id.clone();
        let handle: GridHandle = Arc::new(RwLock::new(grid));

        self.grids.write().insert(grid_id.clone(), handle.clone());
        // Persist the configuration at creation so a restart never has to
        // guess investment or leverage.
        self.persist(&handle).await;

        Ok(handle)
    }

    /// ACTIVE -> STOPPED (terminal). Returns the handle for settlement.
    pub async fn stop_grid(&self, grid_id: &str, reason: &str) -> Result<GridHandle, GridError> {
        let handle = self
            .get(grid_id)
            .ok_or_else(|| GridError::NotFound(grid_id.to_string()))?;
        {
            let mut g = handle.write();
            g.status = GridStatus::Stopped;
            g.last_update = Utc::now();
            info!(trader_id = %g.trader_id, grid_id, reason, "grid stopped");
        }
        self.persist(&handle).await;
        Ok(handle)
    }

    /// ACTIVE -> PAUSED.
    pub async fn pause_grid(&self, grid_id: &str) -> Result<(), GridError> {
        let handle = self
            .get(grid_id)
            .ok_or_else(|| GridError::NotFound(grid_id.to_string()))?;
        {
            let mut g = handle.write();
            if g.status == GridStatus::Active {
                g.status = GridStatus::Paused;
                g.last_update = Utc::now();
                info!(trader_id = %g.trader_id, grid_id, "grid paused");
            }
        }
        self.persist(&handle).await;
        Ok(())
    }

    /// PAUSED -> ACTIVE.
    pub async fn resume_grid(&self, grid_id: &str) -> Result<(), GridError> {
        let handle = self
            .get(grid_id)
            .ok_or_else(|| GridError::NotFound(grid_id.to_string()))?;
        {
            let mut g = handle.write();
            if g.status == GridStatus::Paused {
                g.status = GridStatus::Active;
                g.last_update = Utc::now();
                info!(trader_id = %g.trader_id, grid_id, "grid resumed");
            }
        }
        self.persist(&handle).await;
        Ok(())
    }

    /// Flush one grid's state to the record store. Failures are logged, never
    /// fatal: exchange truth and the next flush win.
    pub async fn persist(&self, handle: &GridHandle) {
        let snapshot = handle.read().clone();
        if let Err(e) = self.store.upsert_grid(&snapshot).await {
            error!(grid_id = %snapshot.grid_id, error = %e, "failed to persist grid");
        }
    }

    // -------------------------------------------------------------------------
    // Restart recovery
    // -------------------------------------------------------------------------

    /// Rebuild grid instances from the exchange's open orders.
    pub async fn restore(&self, open_orders: &[ExchangeOrder]) -> RestoreReport {
        let mut report = RestoreReport::default();

        // Group grid-pattern orders by grid id. Everything else is ignored
        // here; non-grid attribution belongs to the reconciler.
        let mut by_grid: HashMap<String, Vec<(&ExchangeOrder, OrderTag)>> = HashMap::new();
        for order in open_orders {
            let Some(tag) = OrderTag::parse(&order.client_order_id) else {
                continue;
            };
            let Some(grid_id) = tag.grid_id() else {
                continue;
            };
            by_grid.entry(grid_id).or_default().push((order, tag));
        }

        info!(
            open_orders = open_orders.len(),
            grids_found = by_grid.len(),
            "grid recovery started"
        );

        for (grid_id, orders) in by_grid {
            if self.grids.read().contains_key(&grid_id) {
                warn!(grid_id, "grid already registered — skipping restore");
                continue;
            }

            let instance = match self.store.load_grid(&grid_id).await {
                Ok(Some(saved)) => {
                    report.from_store += 1;
                    info!(
                        grid_id,
                        cycles = saved.cycles_completed,
                        net_profit = %saved.net_profit,
                        "grid restored from store"
                    );
                    saved
                }
                _ => match Self::reconstruct_from_orders(&grid_id, &orders) {
                    Some(instance) => {
                        report.reconstructed += 1;
                        instance
                    }
                    None => {
                        warn!(grid_id, "could not reconstruct grid — orders orphaned");
                        for (order, _) in &orders {
                            report.orphan_orders.push(order.client_order_id.clone());
                        }
                        continue;
                    }
                },
            };

            let handle: GridHandle = Arc::new(RwLock::new(instance));

            // Adopt the live orders onto the ladder. A grid-pattern order
            // whose level does not exist on the rebuilt ladder is an orphan.
            {
                let mut g = handle.write();
                for (order, tag) in &orders {
                    let OrderTag::Grid {
                        side, level_index, ..
                    } = tag
                    else {
                        continue;
                    };
                    let level_id = format!("{}_{}_{}", grid_id, side, level_index);
                    let known = g.levels().any(|l| l.level_id == level_id);
                    if known {
                        g.set_order_id(&level_id, order.order_id);
                        report.orders_adopted += 1;
                    } else {
                        warn!(
                            grid_id,
                            client_order_id = %order.client_order_id,
                            "order level not on ladder — orphaned"
                        );
                        report.orphan_orders.push(order.client_order_id.clone());
                    }
                }
                g.status = GridStatus::Active;
            }

            self.grids.write().insert(grid_id.clone(), handle.clone());
            self.persist(&handle).await;
            report.grids_restored += 1;
        }

        info!(
            restored = report.grids_restored,
            from_store = report.from_store,
            reconstructed = report.reconstructed,
            adopted = report.orders_adopted,
            orphans = report.orphan_orders.len(),
            "grid recovery complete"
        );

        report
    }

    /// Infer a plausible configuration from a grid's live orders. Original
    /// investment and leverage are not recoverable from orders alone, so
    /// conservative defaults fill the gaps.
    fn reconstruct_from_orders(
        grid_id: &str,
        orders: &[(&ExchangeOrder, OrderTag)],
    ) -> Option<GridInstance> {
        let first_tag = &orders.first()?.1;
        let (trader_id, symbol, grid_short) = match first_tag {
            OrderTag::Grid {
                trader_id,
                symbol,
                grid_short,
                ..
            } => (trader_id.clone(), symbol.clone(), grid_short.clone()),
            OrderTag::Trader { .. } => return None,
        };

        let prices: Vec<Decimal> = orders.iter().map(|(o, _)| o.price).collect();
        let lower = prices.iter().min().copied()?;
        let upper = prices.iter().max().copied()?;
        if upper <= lower {
            return None;
        }

        let max_index = orders
            .iter()
            .filter_map(|(_, tag)| match tag {
                OrderTag::Grid { level_index, .. } => Some(*level_index),
                OrderTag::Trader { .. } => None,
            })
            .max()?;
        let level_count = max_index + 1;
        if level_count < 2 {
            return None;
        }

        // Estimate the original investment from the live ladder's notionals.
        let total_notional: Decimal = orders.iter().map(|(o, _)| o.price * o.orig_qty).sum();
        let investment = (total_notional / Decimal::from(FALLBACK_LEVERAGE)).max(Decimal::ONE);

        let spec = GridSpec {
            symbol,
            upper,
            lower,
            level_count,
            spacing: SpacingKind::Geometric,
            leverage: FALLBACK_LEVERAGE,
            investment,
            stop_loss_pct: Decimal::from(FALLBACK_STOP_LOSS_PCT),
        };

        warn!(
            grid_id,
            trader_id = %trader_id,
            %lower,
            %upper,
            level_count,
            investment = %investment,
            "grid reconstructed from orders with fallback leverage/stop-loss"
        );

        Some(GridInstance::with_short(
            &trader_id,
            spec,
            &grid_short,
            Utc::now(),
        ))
    }
}

impl std::fmt::Debug for GridEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let grids = self.grids.read();
        let active = grids
            .values()
            .filter(|h| h.read().status == GridStatus::Active)
            .count();
        f.debug_struct("GridEngine")
            .field("grids", &grids.len())
            .field("active", &active)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::OrderSide;
    use rust_decimal_macros::dec;

    fn spec() -> GridSpec {
        GridSpec {
            symbol: "BNBUSDT".to_string(),
            upper: dec!(200),
            lower: dec!(100),
            level_count: 6,
            spacing: SpacingKind::Arithmetic,
            leverage: 3,
            investment: dec!(120),
            stop_loss_pct: dec!(12),
        }
    }

    fn engine() -> GridEngine {
        GridEngine::new(Arc::new(MemoryStore::new()))
    }

    fn level_order(grid: &GridInstance, level_id: &str, order_id: u64) -> ExchangeOrder {
        let level = grid.levels().find(|l| l.level_id == level_id).unwrap().clone();
        ExchangeOrder {
            symbol: grid.spec.symbol.clone(),
            order_id,
            client_order_id: level.level_id,
            side: Some(level.side),
            price: level.price,
            orig_qty: level.quantity,
            executed_qty: dec!(0),
            avg_price: dec!(0),
            status: "NEW".to_string(),
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn create_registers_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let engine = GridEngine::new(store.clone());

        let handle = engine.create_grid("LLM-A", spec()).await.unwrap();
        let grid_id = handle.read().grid_id.clone();

        assert!(engine.get(&grid_id).is_some());
        assert!(engine.active_grid_for("LLM-A", "BNBUSDT").is_some());
        // Config persisted at creation for restart fidelity.
        let saved = store.load_grid(&grid_id).await.unwrap().unwrap();
        assert_eq!(saved.spec.investment, dec!(120));
    }

    #[tokio::test]
    async fn second_active_grid_on_same_symbol_rejected() {
        let engine = engine();
        engine.create_grid("LLM-A", spec()).await.unwrap();
        let err = engine.create_grid("LLM-A", spec()).await.unwrap_err();
        assert!(matches!(err, GridError::AlreadyActive(..)));

        // A different trader on the same symbol is fine.
        assert!(engine.create_grid("LLM-B", spec()).await.is_ok());
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let engine = engine();
        let handle = engine.create_grid("LLM-A", spec()).await.unwrap();
        let grid_id = handle.read().grid_id.clone();

        engine.pause_grid(&grid_id).await.unwrap();
        assert_eq!(handle.read().status, GridStatus::Paused);
        // Paused grid no longer blocks a new one, but resume brings it back.
        engine.resume_grid(&grid_id).await.unwrap();
        assert_eq!(handle.read().status, GridStatus::Active);

        engine.stop_grid(&grid_id, "STRATEGY").await.unwrap();
        assert_eq!(handle.read().status, GridStatus::Stopped);
        assert!(engine.active_grid_for("LLM-A", "BNBUSDT").is_none());
    }

    #[tokio::test]
    async fn stop_unknown_grid_errors() {
        let engine = engine();
        assert!(matches!(
            engine.stop_grid("GRID_nope", "MANUAL").await,
            Err(GridError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn restore_prefers_store_row() {
        let store = Arc::new(MemoryStore::new());

        // A grid that completed cycles before the restart.
        let mut grid = GridInstance::create("LLM-A", spec());
        grid.cycles_completed = 7;
        grid.gross_profit = dec!(21);
        grid.fees = dec!(1);
        grid.net_profit = dec!(20);
        store.upsert_grid(&grid).await.unwrap();

        let orders = vec![
            level_order(&grid, &grid.buy_levels[0].level_id.clone(), 11),
            level_order(&grid, &grid.sell_levels[4].level_id.clone(), 12),
        ];

        let engine = GridEngine::new(store);
        let report = engine.restore(&orders).await;

        assert_eq!(report.grids_restored, 1);
        assert_eq!(report.from_store, 1);
        assert_eq!(report.reconstructed, 0);
        assert_eq!(report.orders_adopted, 2);
        assert!(report.orphan_orders.is_empty());

        let handle = engine.get(&grid.grid_id).unwrap();
        let restored = handle.read();
        // Counters survived the restart exactly.
        assert_eq!(restored.cycles_completed, 7);
        assert_eq!(restored.net_profit, dec!(20));
        assert_eq!(
            restored
                .levels()
                .find(|l| l.level_id == grid.buy_levels[0].level_id)
                .unwrap()
                .order_id,
            Some(11)
        );
    }

    #[tokio::test]
    async fn restore_reconstructs_without_store_row() {
        // Build orders from a grid the (empty) store has never seen.
        let grid = GridInstance::create("LLM-C", spec());
        let orders = vec![
            level_order(&grid, &grid.buy_levels[0].level_id.clone(), 21), // index 0 @ 100
            level_order(&grid, &grid.sell_levels[4].level_id.clone(), 22), // index 5 @ 200
        ];

        let engine = engine();
        let report = engine.restore(&orders).await;

        assert_eq!(report.grids_restored, 1);
        assert_eq!(report.reconstructed, 1);
        assert_eq!(report.orders_adopted, 2);

        let handle = engine.get(&grid.grid_id).unwrap();
        let rebuilt = handle.read();
        assert_eq!(rebuilt.status, GridStatus::Active);
        assert_eq!(rebuilt.cycles_completed, 0);
        assert_eq!(rebuilt.spec.lower, dec!(100));
        assert_eq!(rebuilt.spec.upper, dec!(200));
        // Level count inferred from the highest level index (5 -> 6 levels).
        assert_eq!(rebuilt.spec.level_count, 6);
        assert_eq!(rebuilt.spec.leverage, FALLBACK_LEVERAGE);
    }

    #[tokio::test]
    async fn restore_ignores_non_grid_orders_and_flags_orphans() {
        let engine = engine();

        let non_grid = ExchangeOrder {
            symbol: "ETHUSDT".to_string(),
            order_id: 31,
            client_order_id: "LLM-A_ETHUSDT_1728394875123".to_string(),
            side: Some(OrderSide::Buy),
            price: dec!(2500),
            orig_qty: dec!(0.01),
            executed_qty: dec!(0),
            avg_price: dec!(0),
            status: "NEW".to_string(),
            reduce_only: false,
        };
        let unrecognised = ExchangeOrder {
            client_order_id: "random-order-42".to_string(),
            ..non_grid.clone()
        };

        let report = engine.restore(&[non_grid, unrecognised]).await;
        assert_eq!(report.grids_restored, 0);
        assert!(report.orphan_orders.is_empty());
    }

    #[tokio::test]
    async fn summaries_include_stop_distance() {
        let engine = engine();
        engine.create_grid("LLM-A", spec()).await.unwrap();

        let mut prices = HashMap::new();
        prices.insert("BNBUSDT".to_string(), dec!(110));
        let summaries = engine.summaries_for_trader("LLM-A", &prices);
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].distance_to_stop_pct.is_some());
    }
}
