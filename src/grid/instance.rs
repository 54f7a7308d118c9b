// =============================================================================
// Grid instance — one ladder strategy owned by one trader on one symbol
// =============================================================================
//
// A grid is a pre-generated ladder of limit orders. Interior prices are
// reachable from above (as a buy) and from below (as a sell), so every fill
// has a sibling one index away. A cycle is a FILLED buy matched with the
// closest FILLED sell above it; both levels re-arm (FILLED -> PENDING) once
// the cycle's profit is recorded.
//
// Ladder generation:
//   arithmetic:  price_i = lower + i * (upper - lower) / (N - 1)
//   geometric:   price_i = lower * r^i,  r = (upper / lower)^(1 / (N - 1))
// Buy levels occupy indices [0, N-2]; sell levels [1, N-1].
//
// Invariant maintained at all times: net_profit = gross_profit - fees.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PctRange;
use crate::types::OrderSide;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

// ---------------------------------------------------------------------------
// Spec & validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpacingKind {
    Arithmetic,
    Geometric,
}

impl SpacingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arithmetic => "arithmetic",
            Self::Geometric => "geometric",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "arithmetic" => Some(Self::Arithmetic),
            "geometric" => Some(Self::Geometric),
            _ => None,
        }
    }
}

impl std::fmt::Display for SpacingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of one grid, as decided by a trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSpec {
    pub symbol: String,
    pub upper: Decimal,
    pub lower: Decimal,
    pub level_count: usize,
    pub spacing: SpacingKind,
    pub leverage: u32,
    pub investment: Decimal,
    pub stop_loss_pct: Decimal,
}

/// Bounds a grid spec must satisfy, sourced from settings.
#[derive(Debug, Clone)]
pub struct GridLimits {
    pub level_min: usize,
    pub level_max: usize,
    pub investment_min: Decimal,
    pub investment_max: Decimal,
    pub leverage_max: u32,
    pub stop_loss_range_pct: PctRange,
}

#[derive(Debug, Error)]
pub enum GridError {
    #[error("upper limit {upper} must exceed lower limit {lower}")]
    InvertedRange { upper: Decimal, lower: Decimal },

    #[error("level count {0} outside allowed range {1}..={2}")]
    LevelCount(usize, usize, usize),

    #[error("leverage {0}x outside allowed range 1x..={1}x")]
    Leverage(u32, u32),

    #[error("investment {0} outside allowed range {1}..={2}")]
    Investment(Decimal, Decimal, Decimal),

    #[error("stop loss {0}% outside allowed range {1}%..={2}%")]
    StopLoss(Decimal, Decimal, Decimal),

    #[error("grid {0} already active on {1}")]
    AlreadyActive(String, String),

    #[error("no active grid on {0}")]
    NoActiveGrid(String),

    #[error("grid {0} not found")]
    NotFound(String),
}

impl GridSpec {
    /// Validate against configured bounds. Structural sanity (upper > lower)
    /// is checked regardless of limits.
    pub fn validate(&self, limits: &GridLimits) -> Result<(), GridError> {
        if self.upper <= self.lower {
            return Err(GridError::InvertedRange {
                upper: self.upper,
                lower: self.lower,
            });
        }
        if self.level_count < limits.level_min || self.level_count > limits.level_max {
            return Err(GridError::LevelCount(
                self.level_count,
                limits.level_min,
                limits.level_max,
            ));
        }
        if self.leverage < 1 || self.leverage > limits.leverage_max {
            return Err(GridError::Leverage(self.leverage, limits.leverage_max));
        }
        if self.investment < limits.investment_min || self.investment > limits.investment_max {
            return Err(GridError::Investment(
                self.investment,
                limits.investment_min,
                limits.investment_max,
            ));
        }
        if !limits.stop_loss_range_pct.contains(self.stop_loss_pct) {
            return Err(GridError::StopLoss(
                self.stop_loss_pct,
                limits.stop_loss_range_pct.min,
                limits.stop_loss_range_pct.max,
            ));
        }
        Ok(())
    }

    /// Ladder prices, index 0 = lower bound, index N-1 = upper bound.
    ///
    /// The geometric ratio is computed in f64 and converted back at the
    /// boundary; the end points are pinned exactly to `lower` and `upper`.
    pub fn ladder_prices(&self) -> Vec<Decimal> {
        let n = self.level_count;
        let mut prices = Vec::with_capacity(n);

        match self.spacing {
            SpacingKind::Arithmetic => {
                let step = (self.upper - self.lower) / Decimal::from(n as u64 - 1);
                for i in 0..n {
                    prices.push(self.lower + step * Decimal::from(i as u64));
                }
            }
            SpacingKind::Geometric => {
                let ratio = (self.upper.to_f64().unwrap_or(1.0)
                    / self.lower.to_f64().unwrap_or(1.0))
                .powf(1.0 / (n as f64 - 1.0));
                let lower_f = self.lower.to_f64().unwrap_or(0.0);
                for i in 0..n {
                    if i == 0 {
                        prices.push(self.lower);
                    } else if i == n - 1 {
                        prices.push(self.upper);
                    } else {
                        let p = lower_f * ratio.powi(i as i32);
                        prices.push(Decimal::from_f64(p).unwrap_or(self.lower));
                    }
                }
            }
        }

        prices
    }

    /// Price below which the grid stops out.
    pub fn stop_price(&self) -> Decimal {
        self.lower * (Decimal::ONE - self.stop_loss_pct / HUNDRED)
    }
}

// ---------------------------------------------------------------------------
// Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelStatus {
    Pending,
    Filled,
    Cancelled,
}

/// A single rung of the ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridLevel {
    /// Derivable id: "{grid_id}_{BUY|SELL}_{index}". Doubles as the level
    /// order's client-order-id.
    pub level_id: String,
    pub index: usize,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub status: LevelStatus,
    pub order_id: Option<u64>,
    pub filled_price: Option<Decimal>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl GridLevel {
    fn new(grid_id: &str, index: usize, side: OrderSide, price: Decimal, quantity: Decimal) -> Self {
        Self {
            level_id: format!("{grid_id}_{side}_{index}"),
            index,
            side,
            price,
            quantity,
            status: LevelStatus::Pending,
            order_id: None,
            filled_price: None,
            filled_at: None,
        }
    }

    /// Re-arm after a completed cycle: back to PENDING, awaiting placement.
    fn rearm(&mut self) {
        self.status = LevelStatus::Pending;
        self.order_id = None;
        self.filled_price = None;
        self.filled_at = None;
    }
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridStatus {
    Active,
    Paused,
    Stopped,
}

impl GridStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for GridStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed buy/sell cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub buy_level_id: String,
    pub sell_level_id: String,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub quantity: Decimal,
    pub gross: Decimal,
    pub fees: Decimal,
    pub net: Decimal,
}

/// Residual directional exposure of a grid (filled buys minus filled sells).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NetExposure {
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
}

/// Per-grid risk and performance view handed to decision providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSummary {
    pub grid_id: String,
    pub symbol: String,
    pub status: GridStatus,
    pub lower: Decimal,
    pub upper: Decimal,
    pub level_count: usize,
    pub filled_levels: usize,
    pub cycles_completed: u32,
    pub gross_profit: Decimal,
    pub fees: Decimal,
    pub net_profit: Decimal,
    pub roi_pct: Decimal,
    pub stop_price: Decimal,
    /// Percentage gap between the current price and the stop price; negative
    /// once the stop has been breached. None without a price.
    pub distance_to_stop_pct: Option<Decimal>,
}

/// A live ladder with its state machine and performance counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridInstance {
    pub grid_id: String,
    pub grid_short: String,
    pub trader_id: String,
    pub spec: GridSpec,
    pub buy_levels: Vec<GridLevel>,
    pub sell_levels: Vec<GridLevel>,
    pub status: GridStatus,
    pub cycles_completed: u32,
    pub gross_profit: Decimal,
    pub fees: Decimal,
    pub net_profit: Decimal,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl GridInstance {
    /// Create a fresh grid with a new 8-hex nonce and a generated ladder.
    pub fn create(trader_id: &str, spec: GridSpec) -> Self {
        let short = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self::with_short(trader_id, spec, &short, Utc::now())
    }

    /// Create with a known nonce (restart recovery re-derives the ladder).
    pub fn with_short(
        trader_id: &str,
        spec: GridSpec,
        grid_short: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        let grid_id = format!("GRID_{}_{}_{}", trader_id, spec.symbol, grid_short);

        let prices = spec.ladder_prices();
        let n = prices.len();
        let notional_per_level =
            spec.investment * Decimal::from(spec.leverage) / Decimal::from(n as u64);

        let mut buy_levels = Vec::with_capacity(n - 1);
        let mut sell_levels = Vec::with_capacity(n - 1);
        for (i, &price) in prices.iter().enumerate() {
            let quantity = notional_per_level / price;
            if i < n - 1 {
                buy_levels.push(GridLevel::new(&grid_id, i, OrderSide::Buy, price, quantity));
            }
            if i > 0 {
                sell_levels.push(GridLevel::new(&grid_id, i, OrderSide::Sell, price, quantity));
            }
        }

        info!(
            trader_id,
            grid_id = %grid_id,
            symbol = %spec.symbol,
            lower = %spec.lower,
            upper = %spec.upper,
            levels = n,
            spacing = %spec.spacing,
            "grid generated"
        );

        Self {
            grid_id,
            grid_short: grid_short.to_string(),
            trader_id: trader_id.to_string(),
            spec,
            buy_levels,
            sell_levels,
            status: GridStatus::Active,
            cycles_completed: 0,
            gross_profit: Decimal::ZERO,
            fees: Decimal::ZERO,
            net_profit: Decimal::ZERO,
            created_at,
            last_update: created_at,
        }
    }

    // -------------------------------------------------------------------------
    // Level access
    // -------------------------------------------------------------------------

    pub fn levels(&self) -> impl Iterator<Item = &GridLevel> {
        self.buy_levels.iter().chain(self.sell_levels.iter())
    }

    fn levels_mut(&mut self) -> impl Iterator<Item = &mut GridLevel> {
        self.buy_levels.iter_mut().chain(self.sell_levels.iter_mut())
    }

    /// Levels awaiting placement or fill.
    pub fn pending_levels(&self) -> Vec<GridLevel> {
        self.levels()
            .filter(|l| l.status == LevelStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn filled_count(&self) -> usize {
        self.levels()
            .filter(|l| l.status == LevelStatus::Filled)
            .count()
    }

    /// Record the exchange order id for a placed level order.
    pub fn set_order_id(&mut self, level_id: &str, order_id: u64) {
        for level in self.levels_mut() {
            if level.level_id == level_id {
                level.order_id = Some(order_id);
                return;
            }
        }
        warn!(level_id, "set_order_id: level not found");
    }

    /// Transition a level PENDING -> FILLED with its fill details.
    pub fn mark_level_filled(
        &mut self,
        level_id: &str,
        order_id: u64,
        filled_price: Decimal,
        filled_at: DateTime<Utc>,
    ) {
        let trader_id = self.trader_id.clone();
        for level in self.levels_mut() {
            if level.level_id == level_id {
                level.status = LevelStatus::Filled;
                level.order_id = Some(order_id);
                level.filled_price = Some(filled_price);
                level.filled_at = Some(filled_at);
                info!(trader_id = %trader_id, level_id, %filled_price, "grid level filled");
                return;
            }
        }
        warn!(trader_id = %trader_id, level_id, "mark_level_filled: level not found");
    }

    // -------------------------------------------------------------------------
    // Cycle detection & accounting
    // -------------------------------------------------------------------------

    /// Profit of one cycle: `gross = (sell - buy) * qty`,
    /// `fees = (buy + sell) * qty * fee_rate`, `net = gross - fees`.
    pub fn cycle_profit(
        buy_price: Decimal,
        sell_price: Decimal,
        quantity: Decimal,
        fee_rate: Decimal,
    ) -> (Decimal, Decimal, Decimal) {
        let gross = (sell_price - buy_price) * quantity;
        let fees = (buy_price + sell_price) * quantity * fee_rate;
        (gross, fees, gross - fees)
    }

    /// Match FILLED buys with the closest FILLED sell strictly above each,
    /// record profit, and re-arm both matched levels. Returns one report per
    /// detected cycle. Safe to call after every fill ingestion; unmatched
    /// fills simply wait for their sibling.
    pub fn detect_cycles(&mut self, fee_rate: Decimal) -> Vec<CycleReport> {
        let mut reports = Vec::new();

        loop {
            // Best candidate pair: lowest matching sell per filled buy.
            let mut matched: Option<(usize, usize)> = None;
            for (bi, buy) in self.buy_levels.iter().enumerate() {
                if buy.status != LevelStatus::Filled {
                    continue;
                }
                let candidate = self
                    .sell_levels
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.status == LevelStatus::Filled && s.price > buy.price)
                    .min_by(|(_, a), (_, b)| a.price.cmp(&b.price));
                if let Some((si, _)) = candidate {
                    matched = Some((bi, si));
                    break;
                }
            }

            let Some((bi, si)) = matched else { break };

            let buy_price = self.buy_levels[bi]
                .filled_price
                .unwrap_or(self.buy_levels[bi].price);
            let sell_price = self.sell_levels[si]
                .filled_price
                .unwrap_or(self.sell_levels[si].price);
            let quantity = self.buy_levels[bi].quantity;

            let (gross, fees, net) = Self::cycle_profit(buy_price, sell_price, quantity, fee_rate);

            self.cycles_completed += 1;
            self.gross_profit += gross;
            self.fees += fees;
            self.net_profit += net;
            self.last_update = Utc::now();
            debug_assert_eq!(self.net_profit, self.gross_profit - self.fees);

            let report = CycleReport {
                buy_level_id: self.buy_levels[bi].level_id.clone(),
                sell_level_id: self.sell_levels[si].level_id.clone(),
                buy_price,
                sell_price,
                quantity,
                gross,
                fees,
                net,
            };

            info!(
                trader_id = %self.trader_id,
                grid_id = %self.grid_id,
                cycle = self.cycles_completed,
                %buy_price,
                %sell_price,
                net = %net,
                "grid cycle completed"
            );

            self.buy_levels[bi].rearm();
            self.sell_levels[si].rearm();

            reports.push(report);
        }

        reports
    }

    // -------------------------------------------------------------------------
    // Stop loss & exposure
    // -------------------------------------------------------------------------

    pub fn stop_price(&self) -> Decimal {
        self.spec.stop_price()
    }

    /// True when `current_price` breaches the stop price.
    pub fn stop_loss_hit(&self, current_price: Decimal) -> bool {
        current_price <= self.stop_price()
    }

    /// Residual exposure from unmatched fills: filled buy quantity minus
    /// filled sell quantity, with a quantity-weighted average entry.
    pub fn net_exposure(&self) -> NetExposure {
        let mut net_qty = Decimal::ZERO;
        let mut buy_qty = Decimal::ZERO;
        let mut buy_notional = Decimal::ZERO;

        for l in &self.buy_levels {
            if l.status == LevelStatus::Filled {
                let price = l.filled_price.unwrap_or(l.price);
                net_qty += l.quantity;
                buy_qty += l.quantity;
                buy_notional += price * l.quantity;
            }
        }
        for l in &self.sell_levels {
            if l.status == LevelStatus::Filled {
                net_qty -= l.quantity;
            }
        }

        let avg_entry_price = if buy_qty.is_zero() {
            Decimal::ZERO
        } else {
            buy_notional / buy_qty
        };

        NetExposure {
            quantity: net_qty,
            avg_entry_price,
        }
    }

    /// Risk & performance view for context building.
    pub fn summary(&self, current_price: Option<Decimal>) -> GridSummary {
        let stop_price = self.stop_price();
        let distance_to_stop_pct = current_price.and_then(|p| {
            if stop_price.is_zero() {
                None
            } else {
                Some((p - stop_price) / stop_price * HUNDRED)
            }
        });
        let roi_pct = if self.spec.investment.is_zero() {
            Decimal::ZERO
        } else {
            self.net_profit / self.spec.investment * HUNDRED
        };

        GridSummary {
            grid_id: self.grid_id.clone(),
            symbol: self.spec.symbol.clone(),
            status: self.status,
            lower: self.spec.lower,
            upper: self.spec.upper,
            level_count: self.spec.level_count,
            filled_levels: self.filled_count(),
            cycles_completed: self.cycles_completed,
            gross_profit: self.gross_profit,
            fees: self.fees,
            net_profit: self.net_profit,
            roi_pct,
            stop_price,
            distance_to_stop_pct,
        }
    }
}
