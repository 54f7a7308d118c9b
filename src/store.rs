// =============================================================================
// Record store — thin data-access seam over table-oriented storage
// =============================================================================
//
// The engine persists through this trait only; the concrete backend (hosted
// table store, embedded database) is wired at boot. Semantics are
// upsert-by-business-key for accounts, positions, and grids, and append-only
// for trades, decisions, and market snapshots. No cross-table transactions:
// every business key is derivable by the emitting component.
//
// `MemoryStore` is the in-process implementation used as the default backend
// and by tests.
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::account::{Position, Trade, TraderAccount};
use crate::decision::DecisionRecord;
use crate::grid::GridInstance;
use crate::market::MarketSnapshot;

/// Durable mapping-based storage for every table the engine writes.
#[async_trait]
pub trait RecordStore: Send + Sync {
    // -- trader_accounts (by trader_id) ---------------------------------------
    async fn upsert_account(&self, account: &TraderAccount) -> Result<()>;
    async fn load_account(&self, trader_id: &str) -> Result<Option<TraderAccount>>;

    // -- positions (by position_id) -------------------------------------------
    async fn upsert_position(&self, position: &Position) -> Result<()>;
    async fn remove_position(&self, position_id: &str) -> Result<()>;

    // -- trades (append-only) -------------------------------------------------
    async fn insert_trade(&self, trade: &Trade) -> Result<()>;

    // -- grids (by grid_id) ---------------------------------------------------
    async fn upsert_grid(&self, grid: &GridInstance) -> Result<()>;
    async fn load_grid(&self, grid_id: &str) -> Result<Option<GridInstance>>;

    // -- decisions (append-only) ----------------------------------------------
    async fn insert_decision(&self, record: &DecisionRecord) -> Result<()>;

    // -- market_data (append-only, symbol + timestamp composite) --------------
    async fn insert_market_snapshot(&self, snapshot: &MarketSnapshot) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Keeps every table in process memory. Fast, complete, volatile.
#[derive(Default)]
pub struct MemoryStore {
    accounts: Mutex<HashMap<String, TraderAccount>>,
    positions: Mutex<HashMap<String, Position>>,
    trades: Mutex<Vec<Trade>>,
    grids: Mutex<HashMap<String, GridInstance>>,
    decisions: Mutex<Vec<DecisionRecord>>,
    market_data: Mutex<Vec<MarketSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Table sizes, mainly for tests and status logs.

    pub fn trade_count(&self) -> usize {
        self.trades.lock().len()
    }

    pub fn decision_count(&self) -> usize {
        self.decisions.lock().len()
    }

    pub fn market_snapshot_count(&self) -> usize {
        self.market_data.lock().len()
    }

    pub fn position_count(&self) -> usize {
        self.positions.lock().len()
    }

    pub fn recent_trades(&self, limit: usize) -> Vec<Trade> {
        let trades = self.trades.lock();
        trades.iter().rev().take(limit).cloned().collect()
    }

    pub fn recent_decisions(&self, limit: usize) -> Vec<DecisionRecord> {
        let decisions = self.decisions.lock();
        decisions.iter().rev().take(limit).cloned().collect()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert_account(&self, account: &TraderAccount) -> Result<()> {
        self.accounts
            .lock()
            .insert(account.trader_id.clone(), account.clone());
        Ok(())
    }

    async fn load_account(&self, trader_id: &str) -> Result<Option<TraderAccount>> {
        Ok(self.accounts.lock().get(trader_id).cloned())
    }

    async fn upsert_position(&self, position: &Position) -> Result<()> {
        self.positions
            .lock()
            .insert(position.position_id.clone(), position.clone());
        Ok(())
    }

    async fn remove_position(&self, position_id: &str) -> Result<()> {
        self.positions.lock().remove(position_id);
        Ok(())
    }

    async fn insert_trade(&self, trade: &Trade) -> Result<()> {
        debug!(trade_id = %trade.trade_id, pnl = %trade.pnl, "trade recorded");
        self.trades.lock().push(trade.clone());
        Ok(())
    }

    async fn upsert_grid(&self, grid: &GridInstance) -> Result<()> {
        self.grids.lock().insert(grid.grid_id.clone(), grid.clone());
        Ok(())
    }

    async fn load_grid(&self, grid_id: &str) -> Result<Option<GridInstance>> {
        Ok(self.grids.lock().get(grid_id).cloned())
    }

    async fn insert_decision(&self, record: &DecisionRecord) -> Result<()> {
        self.decisions.lock().push(record.clone());
        Ok(())
    }

    async fn insert_market_snapshot(&self, snapshot: &MarketSnapshot) -> Result<()> {
        self.market_data.lock().push(snapshot.clone());
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("accounts", &self.accounts.lock().len())
            .field("positions", &self.positions.lock().len())
            .field("trades", &self.trades.lock().len())
            .field("grids", &self.grids.lock().len())
            .field("decisions", &self.decisions.lock().len())
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

    #[tokio::test]
    async fn account_upsert_and_load_roundtrip() {
        let store = MemoryStore::new();
        let account = TraderAccount::new("LLM-A", dec!(100), 3);

        assert!(store.load_account("LLM-A").await.unwrap().is_none());
        store.upsert_account(&account).await.unwrap();

        let loaded = store.load_account("LLM-A").await.unwrap().unwrap();
        assert_eq!(loaded.trader_id, "LLM-A");
        assert_eq!(loaded.balance, dec!(100));
    }

    #[tokio::test]
    async fn upsert_overwrites_by_business_key() {
        let store = MemoryStore::new();
        let mut account = TraderAccount::new("LLM-A", dec!(100), 3);
        store.upsert_account(&account).await.unwrap();

        account.balance = dec!(87.5);
        store.upsert_account(&account).await.unwrap();

        let loaded = store.load_account("LLM-A").await.unwrap().unwrap();
        assert_eq!(loaded.balance, dec!(87.5));
    }

    #[tokio::test]
    async fn trades_are_append_only() {
        let store = MemoryStore::new();
        let mut account = TraderAccount::new("LLM-A", dec!(100), 3);
        let p = account
            .open_position(
                "ETHUSDT",
                crate::types::PositionSide::Long,
                dec!(100),
                dec!(40),
                2,
                None,
                None,
            )
            .unwrap();
        let t1 = account
            .close_position(&p.position_id, dec!(105), crate::types::ExitReason::Manual)
            .unwrap();

        store.insert_trade(&t1).await.unwrap();
        store.insert_trade(&t1).await.unwrap();
        assert_eq!(store.trade_count(), 2);
        assert_eq!(store.recent_trades(1).len(), 1);
    }

    #[tokio::test]
    async fn grid_roundtrip_preserves_config() {
        let store = MemoryStore::new();
        let spec = crate::grid::GridSpec {
            symbol: "BNBUSDT".to_string(),
            upper: dec!(200),
            lower: dec!(100),
            level_count: 6,
            spacing: crate::grid::SpacingKind::Geometric,
            leverage: 3,
            investment: dec!(120),
            stop_loss_pct: dec!(12),
        };
        let grid = GridInstance::create("LLM-B", spec);
        store.upsert_grid(&grid).await.unwrap();

        let loaded = store.load_grid(&grid.grid_id).await.unwrap().unwrap();
        assert_eq!(loaded.spec.investment, dec!(120));
        assert_eq!(loaded.spec.leverage, 3);
        assert_eq!(loaded.buy_levels.len(), 5);
        assert!(store.load_grid("GRID_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn position_remove() {
        let store = MemoryStore::new();
        let mut account = TraderAccount::new("LLM-A", dec!(100), 3);
        let p = account
            .open_position(
                "ETHUSDT",
                crate::types::PositionSide::Long,
                dec!(100),
                dec!(20),
                2,
                None,
                None,
            )
            .unwrap();
        store.upsert_position(&p).await.unwrap();
        assert_eq!(store.position_count(), 1);
        store.remove_position(&p.position_id).await.unwrap();
        assert_eq!(store.position_count(), 0);
    }
}
