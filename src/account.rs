// =============================================================================
// Virtual accounts — per-trader balance, positions, and trade history
// =============================================================================
//
// Every trader owns a virtual sub-account funded from the shared exchange
// balance. The invariant maintained at rest:
//
//     equity = balance + margin_locked + unrealized_pnl
//
// Opening a position moves margin from `balance` to `margin_locked`; closing
// releases the margin and credits the realised PnL. Monetary math is Decimal
// throughout; nothing here touches floating point.
//
// Thread-safety: the service hands out one lock per account. All mutations of
// a given account are serialised by that lock; different accounts never
// contend.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::RecordStore;
use crate::types::{ExitReason, PositionSide};

/// Closed trades kept in memory per account (full history lives in the store).
const RECENT_TRADES_KEPT: usize = 200;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("maximum open positions reached ({0})")]
    MaxPositionsReached(u32),

    #[error("already holding a position on {0}")]
    DuplicatePosition(String),

    #[error("insufficient balance: need {need}, have {have}")]
    InsufficientBalance { need: Decimal, have: Decimal },

    #[error("position {0} not found")]
    PositionNotFound(String),

    #[error("unknown trader {0}")]
    UnknownTrader(String),
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
    Liquidated,
}

/// An open directional exposure owned by one trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub trader_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    /// Base units (e.g. ETH), not USD.
    pub quantity: Decimal,
    pub leverage: u32,
    pub margin_used: Decimal,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
}

/// Unrealised PnL breakdown for a position at a given price.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PnlBreakdown {
    pub pnl: Decimal,
    /// PnL as a percentage of margin used.
    pub pnl_pct: Decimal,
    /// Return on the notional entry value.
    pub roi_pct: Decimal,
}

impl Position {
    /// Build a position from a USD-sized order.
    ///
    /// `quantity = quantity_usd / entry_price`;
    /// `margin_used = quantity_usd / leverage`.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        trader_id: &str,
        symbol: &str,
        side: PositionSide,
        entry_price: Decimal,
        quantity_usd: Decimal,
        leverage: u32,
        stop_loss_pct: Option<Decimal>,
        take_profit_pct: Option<Decimal>,
    ) -> Self {
        let quantity = quantity_usd / entry_price;
        let margin_used = quantity_usd / Decimal::from(leverage);

        let stop_loss_price = stop_loss_pct.map(|pct| match side {
            PositionSide::Long => entry_price * (Decimal::ONE - pct / HUNDRED),
            PositionSide::Short => entry_price * (Decimal::ONE + pct / HUNDRED),
        });
        let take_profit_price = take_profit_pct.map(|pct| match side {
            PositionSide::Long => entry_price * (Decimal::ONE + pct / HUNDRED),
            PositionSide::Short => entry_price * (Decimal::ONE - pct / HUNDRED),
        });

        Self {
            position_id: Uuid::new_v4().to_string(),
            trader_id: trader_id.to_string(),
            symbol: symbol.to_string(),
            side,
            entry_price,
            quantity,
            leverage,
            margin_used,
            stop_loss_price,
            take_profit_price,
            opened_at: Utc::now(),
            status: PositionStatus::Open,
        }
    }

    /// Signed price move in this position's favour.
    fn price_change(&self, current_price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => current_price - self.entry_price,
            PositionSide::Short => self.entry_price - current_price,
        }
    }

    /// Unrealised PnL at `current_price`.
    ///
    /// `pnl = price_change * quantity * leverage`. PnL percentage is measured
    /// against margin used; ROI against the notional entry value.
    pub fn unrealized(&self, current_price: Decimal) -> PnlBreakdown {
        let change = self.price_change(current_price);
        let pnl = change * self.quantity * Decimal::from(self.leverage);

        let pnl_pct = if self.margin_used.is_zero() {
            Decimal::ZERO
        } else {
            pnl / self.margin_used * HUNDRED
        };
        let roi_pct = if self.entry_price.is_zero() {
            Decimal::ZERO
        } else {
            change / self.entry_price * HUNDRED * Decimal::from(self.leverage)
        };

        PnlBreakdown { pnl, pnl_pct, roi_pct }
    }

    /// Price at which the full margin would be lost (simplified: 100% of
    /// margin, no maintenance tier).
    pub fn liquidation_price(&self) -> Decimal {
        let loss_pct = HUNDRED / Decimal::from(self.leverage);
        match self.side {
            PositionSide::Long => self.entry_price * (Decimal::ONE - loss_pct / HUNDRED),
            PositionSide::Short => self.entry_price * (Decimal::ONE + loss_pct / HUNDRED),
        }
    }

    pub fn should_stop_loss(&self, current_price: Decimal) -> bool {
        match (self.stop_loss_price, self.side) {
            (Some(sl), PositionSide::Long) => current_price <= sl,
            (Some(sl), PositionSide::Short) => current_price >= sl,
            (None, _) => false,
        }
    }

    pub fn should_take_profit(&self, current_price: Decimal) -> bool {
        match (self.take_profit_price, self.side) {
            (Some(tp), PositionSide::Long) => current_price >= tp,
            (Some(tp), PositionSide::Short) => current_price <= tp,
            (None, _) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Trade
// ---------------------------------------------------------------------------

/// A completed round-trip. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub trader_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub leverage: u32,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub exit_reason: ExitReason,
}

impl Trade {
    pub fn is_winner(&self) -> bool {
        self.pnl > Decimal::ZERO
    }
}

// ---------------------------------------------------------------------------
// TraderAccount
// ---------------------------------------------------------------------------

/// One trader's virtual account. Created at boot, never destroyed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderAccount {
    pub trader_id: String,
    pub initial_balance: Decimal,
    /// Free cash available for new margin.
    pub balance: Decimal,
    /// Margin locked by open positions and active grids.
    pub margin_locked: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub max_open_positions: u32,
    pub open_positions: HashMap<String, Position>,
    /// Recent closed trades, newest last (bounded; the store has the rest).
    pub recent_trades: Vec<Trade>,
}

impl TraderAccount {
    pub fn new(trader_id: &str, initial_balance: Decimal, max_open_positions: u32) -> Self {
        info!(trader_id, %initial_balance, "account initialised");
        Self {
            trader_id: trader_id.to_string(),
            initial_balance,
            balance: initial_balance,
            margin_locked: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            max_open_positions,
            open_positions: HashMap::new(),
            recent_trades: Vec::new(),
        }
    }

    /// `equity = balance + margin_locked + unrealized_pnl`.
    pub fn equity(&self) -> Decimal {
        self.balance + self.margin_locked + self.unrealized_pnl
    }

    pub fn total_pnl(&self) -> Decimal {
        self.realized_pnl + self.unrealized_pnl
    }

    pub fn win_rate_pct(&self) -> Decimal {
        if self.total_trades == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.winning_trades) / Decimal::from(self.total_trades) * HUNDRED
    }

    pub fn can_open_position(&self) -> bool {
        (self.open_positions.len() as u32) < self.max_open_positions
    }

    pub fn position_for_symbol(&self, symbol: &str) -> Option<&Position> {
        self.open_positions.values().find(|p| p.symbol == symbol)
    }

    /// Open a position, locking its margin.
    ///
    /// The risk manager validates decisions before execution; these checks
    /// are the account's own last-line invariants.
    #[allow(clippy::too_many_arguments)]
    pub fn open_position(
        &mut self,
        symbol: &str,
        side: PositionSide,
        entry_price: Decimal,
        quantity_usd: Decimal,
        leverage: u32,
        stop_loss_pct: Option<Decimal>,
        take_profit_pct: Option<Decimal>,
    ) -> Result<Position, AccountError> {
        if !self.can_open_position() {
            return Err(AccountError::MaxPositionsReached(self.max_open_positions));
        }
        if self.position_for_symbol(symbol).is_some() {
            return Err(AccountError::DuplicatePosition(symbol.to_string()));
        }

        let margin_required = quantity_usd / Decimal::from(leverage);
        if margin_required > self.balance {
            return Err(AccountError::InsufficientBalance {
                need: margin_required,
                have: self.balance,
            });
        }

        let position = Position::open(
            &self.trader_id,
            symbol,
            side,
            entry_price,
            quantity_usd,
            leverage,
            stop_loss_pct,
            take_profit_pct,
        );

        self.balance -= margin_required;
        self.margin_locked += margin_required;
        self.open_positions
            .insert(position.position_id.clone(), position.clone());

        info!(
            trader_id = %self.trader_id,
            symbol,
            side = %side,
            %entry_price,
            %quantity_usd,
            leverage,
            margin = %margin_required,
            "position opened"
        );

        Ok(position)
    }

    /// Insert a position reconstructed from exchange truth (reconciler only).
    /// Margin is moved from balance like a normal open, clamped at zero.
    pub fn adopt_position(&mut self, position: Position) {
        let margin = position.margin_used;
        self.balance = (self.balance - margin).max(Decimal::ZERO);
        self.margin_locked += margin;
        self.open_positions
            .insert(position.position_id.clone(), position);
    }

    /// Close a position: release margin, credit PnL, emit the Trade.
    pub fn close_position(
        &mut self,
        position_id: &str,
        exit_price: Decimal,
        exit_reason: ExitReason,
    ) -> Result<Trade, AccountError> {
        let position = self
            .open_positions
            .remove(position_id)
            .ok_or_else(|| AccountError::PositionNotFound(position_id.to_string()))?;

        let breakdown = position.unrealized(exit_price);

        let trade = Trade {
            trade_id: position.position_id.clone(),
            trader_id: self.trader_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            leverage: position.leverage,
            pnl: breakdown.pnl,
            pnl_pct: breakdown.pnl_pct,
            opened_at: position.opened_at,
            closed_at: Utc::now(),
            exit_reason,
        };

        self.balance += position.margin_used + breakdown.pnl;
        self.margin_locked -= position.margin_used;
        debug_assert!(self.margin_locked >= Decimal::ZERO, "margin_locked went negative");
        self.record_trade_outcome(&trade);

        info!(
            trader_id = %self.trader_id,
            symbol = %trade.symbol,
            side = %trade.side,
            pnl = %trade.pnl,
            pnl_pct = %trade.pnl_pct,
            reason = %exit_reason,
            "position closed"
        );

        Ok(trade)
    }

    /// Lock `amount` of free balance (grid investment margin).
    pub fn lock_margin(&mut self, amount: Decimal) -> Result<(), AccountError> {
        if amount > self.balance {
            return Err(AccountError::InsufficientBalance {
                need: amount,
                have: self.balance,
            });
        }
        self.balance -= amount;
        self.margin_locked += amount;
        Ok(())
    }

    /// Reverse a `lock_margin` without settling anything (setup rolled back).
    pub fn release_margin(&mut self, amount: Decimal) {
        let released = amount.min(self.margin_locked);
        self.margin_locked -= released;
        self.balance += released;
    }

    /// Release previously locked margin and credit `pnl`, counting the trade.
    pub fn settle_locked(&mut self, margin: Decimal, trade: &Trade) {
        let released = margin.min(self.margin_locked);
        self.margin_locked -= released;
        self.balance += released + trade.pnl;
        self.record_trade_outcome(trade);
    }

    /// Align an open position with exchange truth. Returns true when any
    /// field actually changed; margin deltas move between balance and
    /// margin_locked so the equity identity keeps holding.
    pub fn reconcile_position(
        &mut self,
        symbol: &str,
        entry_price: Decimal,
        quantity: Decimal,
    ) -> bool {
        let Some(position) = self
            .open_positions
            .values_mut()
            .find(|p| p.symbol == symbol)
        else {
            return false;
        };

        if position.entry_price == entry_price && position.quantity == quantity {
            return false;
        }

        let old_margin = position.margin_used;
        position.entry_price = entry_price;
        position.quantity = quantity;
        position.margin_used = entry_price * quantity / Decimal::from(position.leverage);

        let margin_delta = position.margin_used - old_margin;
        self.margin_locked += margin_delta;
        self.balance = (self.balance - margin_delta).max(Decimal::ZERO);
        true
    }

    fn record_trade_outcome(&mut self, trade: &Trade) {
        self.realized_pnl += trade.pnl;
        self.total_trades += 1;
        if trade.is_winner() {
            self.winning_trades += 1;
        } else {
            self.losing_trades += 1;
        }
        self.recent_trades.push(trade.clone());
        while self.recent_trades.len() > RECENT_TRADES_KEPT {
            self.recent_trades.remove(0);
        }
    }

    /// Recompute unrealised PnL from current prices. Positions without a
    /// price keep their last contribution out of the total.
    pub fn update_unrealized(&mut self, prices: &HashMap<String, Decimal>) {
        let mut total = Decimal::ZERO;
        for position in self.open_positions.values() {
            if let Some(&price) = prices.get(&position.symbol) {
                total += position.unrealized(price).pnl;
            }
        }
        self.unrealized_pnl = total;
    }

    /// Serialisable summary used in leaderboards and provider context.
    pub fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            trader_id: self.trader_id.clone(),
            balance: self.balance,
            margin_locked: self.margin_locked,
            unrealized_pnl: self.unrealized_pnl,
            realized_pnl: self.realized_pnl,
            equity: self.equity(),
            total_pnl: self.total_pnl(),
            total_trades: self.total_trades,
            winning_trades: self.winning_trades,
            losing_trades: self.losing_trades,
            win_rate_pct: self.win_rate_pct(),
            open_positions: self.open_positions.len() as u32,
            max_open_positions: self.max_open_positions,
        }
    }
}

/// Flat, serialisable view of one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub trader_id: String,
    pub balance: Decimal,
    pub margin_locked: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub equity: Decimal,
    pub total_pnl: Decimal,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate_pct: Decimal,
    pub open_positions: u32,
    pub max_open_positions: u32,
}

// ---------------------------------------------------------------------------
// AccountService
// ---------------------------------------------------------------------------

/// Aggregate summary across the whole arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaSummary {
    pub traders: u32,
    pub combined_equity: Decimal,
    pub combined_pnl: Decimal,
    pub total_trades: u32,
    pub best_trader: Option<String>,
}

/// Owns the map `trader_id -> TraderAccount`, one lock per account.
pub struct AccountService {
    accounts: HashMap<String, Arc<RwLock<TraderAccount>>>,
    store: Arc<dyn RecordStore>,
}

impl AccountService {
    /// Create-or-load semantics: an account row already in the store wins
    /// over a fresh account, so restarts keep balances.
    pub async fn new(
        trader_ids: &[String],
        initial_balance: Decimal,
        max_open_positions: u32,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let mut accounts = HashMap::new();
        for trader_id in trader_ids {
            let account = match store.load_account(trader_id).await {
                Ok(Some(saved)) => {
                    info!(trader_id, equity = %saved.equity(), "account restored from store");
                    saved
                }
                _ => TraderAccount::new(trader_id, initial_balance, max_open_positions),
            };
            accounts.insert(trader_id.clone(), Arc::new(RwLock::new(account)));
        }
        Self { accounts, store }
    }

    /// The per-account lock for `trader_id`.
    pub fn get(&self, trader_id: &str) -> Option<Arc<RwLock<TraderAccount>>> {
        self.accounts.get(trader_id).cloned()
    }

    /// All trader ids in lexicographic order. The reconciler acquires account
    /// locks in exactly this order to avoid deadlock with the executor.
    pub fn trader_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.accounts.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Recompute unrealised PnL for every account.
    pub fn update_unrealized(&self, prices: &HashMap<String, Decimal>) {
        for account in self.accounts.values() {
            account.write().update_unrealized(prices);
        }
    }

    /// Flush every account (and its open positions) to the record store.
    pub async fn sync_all(&self) -> anyhow::Result<()> {
        for (trader_id, account) in &self.accounts {
            let snapshot = account.read().clone();
            self.store.upsert_account(&snapshot).await?;
            for position in snapshot.open_positions.values() {
                self.store.upsert_position(position).await?;
            }
            debug!(trader_id, "account flushed to store");
        }
        Ok(())
    }

    /// Equity-sorted standings, best first.
    pub fn leaderboard(&self) -> Vec<AccountSnapshot> {
        let mut rows: Vec<AccountSnapshot> = self
            .accounts
            .values()
            .map(|a| a.read().snapshot())
            .collect();
        rows.sort_by(|a, b| b.equity.cmp(&a.equity));
        rows
    }

    /// Aggregate statistics across all traders.
    pub fn summary(&self) -> ArenaSummary {
        let rows = self.leaderboard();
        ArenaSummary {
            traders: rows.len() as u32,
            combined_equity: rows.iter().map(|r| r.equity).sum(),
            combined_pnl: rows.iter().map(|r| r.total_pnl).sum(),
            total_trades: rows.iter().map(|r| r.total_trades).sum(),
            best_trader: rows.first().map(|r| r.trader_id.clone()),
        }
    }
}

impl std::fmt::Debug for AccountService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountService")
            .field("accounts", &self.accounts.len())
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

    fn account() -> TraderAccount {
        TraderAccount::new("LLM-A", dec!(100), 3)
    }

    #[test]
    fn fresh_account_equity_equals_initial_balance() {
        let a = account();
        assert_eq!(a.equity(), dec!(100));
        assert_eq!(a.balance, dec!(100));
        assert_eq!(a.margin_locked, dec!(0));
    }

    #[test]
    fn open_position_moves_margin() {
        let mut a = account();
        let p = a
            .open_position("ETHUSDT", PositionSide::Long, dec!(2500), dec!(40), 4, None, None)
            .unwrap();

        // 40 USD at 4x leverage locks 10 of margin.
        assert_eq!(p.margin_used, dec!(10));
        assert_eq!(a.balance, dec!(90));
        assert_eq!(a.margin_locked, dec!(10));
        assert_eq!(a.equity(), dec!(100));
        assert_eq!(p.quantity, dec!(0.016));
    }

    #[test]
    fn margin_used_matches_entry_times_qty_over_leverage() {
        let mut a = account();
        let p = a
            .open_position("ETHUSDT", PositionSide::Long, dec!(2000), dec!(30), 3, None, None)
            .unwrap();
        assert_eq!(p.margin_used, p.entry_price * p.quantity / Decimal::from(p.leverage));
    }

    #[test]
    fn open_rejects_duplicate_symbol() {
        let mut a = account();
        a.open_position("ETHUSDT", PositionSide::Long, dec!(2500), dec!(20), 2, None, None)
            .unwrap();
        let err = a
            .open_position("ETHUSDT", PositionSide::Short, dec!(2500), dec!(20), 2, None, None)
            .unwrap_err();
        assert!(matches!(err, AccountError::DuplicatePosition(_)));
    }

    #[test]
    fn open_rejects_when_max_positions_reached() {
        let mut a = TraderAccount::new("LLM-A", dec!(100), 1);
        a.open_position("ETHUSDT", PositionSide::Long, dec!(2500), dec!(20), 2, None, None)
            .unwrap();
        let err = a
            .open_position("BNBUSDT", PositionSide::Long, dec!(600), dec!(20), 2, None, None)
            .unwrap_err();
        assert!(matches!(err, AccountError::MaxPositionsReached(1)));
    }

    #[test]
    fn open_rejects_insufficient_balance() {
        let mut a = account();
        // 300 USD at 2x needs 150 margin, only 100 available.
        let err = a
            .open_position("ETHUSDT", PositionSide::Long, dec!(2500), dec!(300), 2, None, None)
            .unwrap_err();
        assert!(matches!(err, AccountError::InsufficientBalance { .. }));
    }

    #[test]
    fn long_round_trip_pnl() {
        let mut a = account();
        let p = a
            .open_position("ETHUSDT", PositionSide::Long, dec!(100), dec!(40), 3, None, None)
            .unwrap();
        // quantity = 0.4, margin = 13.333...
        let trade = a
            .close_position(&p.position_id, dec!(110), ExitReason::Manual)
            .unwrap();

        // pnl = (110 - 100) * 0.4 * 3 = 12
        assert_eq!(trade.pnl, dec!(12.0));
        // pnl_pct measured against margin used: 12 / 13.333... * 100 = 90%
        assert!((trade.pnl_pct - dec!(90)).abs() < dec!(0.0001));
        assert_eq!(a.balance, dec!(112));
        assert_eq!(a.margin_locked, dec!(0));
        assert_eq!(a.realized_pnl, dec!(12.0));
        assert_eq!(a.winning_trades, 1);
        assert_eq!(a.total_trades, 1);
    }

    #[test]
    fn short_round_trip_pnl_inverts() {
        let mut a = account();
        let p = a
            .open_position("ETHUSDT", PositionSide::Short, dec!(100), dec!(40), 3, None, None)
            .unwrap();
        let trade = a
            .close_position(&p.position_id, dec!(110), ExitReason::Manual)
            .unwrap();
        // Short losing 10% against it at 3x: pnl = (100-110) * 0.4 * 3 = -12
        assert_eq!(trade.pnl, dec!(-12.0));
        assert_eq!(a.losing_trades, 1);
        assert_eq!(a.balance, dec!(88));
        assert_eq!(a.equity(), dec!(88));
    }

    #[test]
    fn close_unknown_position_fails() {
        let mut a = account();
        assert!(matches!(
            a.close_position("nope", dec!(100), ExitReason::Manual),
            Err(AccountError::PositionNotFound(_))
        ));
    }

    #[test]
    fn equity_invariant_holds_through_price_moves() {
        let mut a = account();
        a.open_position("ETHUSDT", PositionSide::Long, dec!(100), dec!(40), 2, None, None)
            .unwrap();

        let mut prices = HashMap::new();
        prices.insert("ETHUSDT".to_string(), dec!(105));
        a.update_unrealized(&prices);

        // pnl = 5 * 0.4 * 2 = 4
        assert_eq!(a.unrealized_pnl, dec!(4.0));
        assert_eq!(a.equity(), a.balance + a.margin_locked + a.unrealized_pnl);
        assert_eq!(a.equity(), dec!(104.0));
    }

    #[test]
    fn stop_loss_and_take_profit_prices() {
        let p = Position::open(
            "LLM-A",
            "ETHUSDT",
            PositionSide::Long,
            dec!(100),
            dec!(40),
            2,
            Some(dec!(5)),
            Some(dec!(10)),
        );
        assert_eq!(p.stop_loss_price, Some(dec!(95.00)));
        assert_eq!(p.take_profit_price, Some(dec!(110.00)));
        assert!(p.should_stop_loss(dec!(95)));
        assert!(!p.should_stop_loss(dec!(95.01)));
        assert!(p.should_take_profit(dec!(110)));
        assert!(!p.should_take_profit(dec!(109.99)));
    }

    #[test]
    fn short_triggers_invert() {
        let p = Position::open(
            "LLM-A",
            "ETHUSDT",
            PositionSide::Short,
            dec!(100),
            dec!(40),
            2,
            Some(dec!(5)),
            Some(dec!(10)),
        );
        assert_eq!(p.stop_loss_price, Some(dec!(105.00)));
        assert_eq!(p.take_profit_price, Some(dec!(90.00)));
        assert!(p.should_stop_loss(dec!(105)));
        assert!(p.should_take_profit(dec!(90)));
    }

    #[test]
    fn liquidation_price_simplified() {
        let p = Position::open(
            "LLM-A",
            "ETHUSDT",
            PositionSide::Long,
            dec!(100),
            dec!(40),
            4,
            None,
            None,
        );
        // 4x leverage: 25% adverse move wipes the margin.
        assert_eq!(p.liquidation_price(), dec!(75.00));
    }

    #[test]
    fn grid_margin_lock_and_settle() {
        let mut a = account();
        a.lock_margin(dec!(60)).unwrap();
        assert_eq!(a.balance, dec!(40));
        assert_eq!(a.margin_locked, dec!(60));

        let trade = Trade {
            trade_id: "t1".to_string(),
            trader_id: "LLM-A".to_string(),
            symbol: "BNBUSDT".to_string(),
            side: PositionSide::Long,
            entry_price: dec!(600),
            exit_price: dec!(600),
            quantity: dec!(0),
            leverage: 3,
            pnl: dec!(4.9475),
            pnl_pct: dec!(0),
            opened_at: Utc::now(),
            closed_at: Utc::now(),
            exit_reason: ExitReason::Strategy,
        };
        a.settle_locked(dec!(60), &trade);

        assert_eq!(a.balance, dec!(104.9475));
        assert_eq!(a.margin_locked, dec!(0));
        assert_eq!(a.realized_pnl, dec!(4.9475));
        assert_eq!(a.total_trades, 1);
        assert_eq!(a.winning_trades, 1);
    }

    #[test]
    fn lock_margin_rejects_overdraw() {
        let mut a = account();
        assert!(a.lock_margin(dec!(101)).is_err());
        assert_eq!(a.balance, dec!(100));
    }

    #[test]
    fn win_rate() {
        let mut a = account();
        assert_eq!(a.win_rate_pct(), dec!(0));
        a.total_trades = 4;
        a.winning_trades = 3;
        assert_eq!(a.win_rate_pct(), dec!(75));
    }
}
