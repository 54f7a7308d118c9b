// =============================================================================
// Risk Manager — pure validation of decisions against account state
// =============================================================================
//
// `validate` runs before anything touches the exchange. Every rejection
// carries a machine-readable code plus a human explanation; acceptances
// return the decision unchanged to the caller.
//
// The side queries (`stop_loss_triggers`, `take_profit_triggers`,
// `liquidation_proximity`) scan an account's open positions against current
// prices and never mutate anything.
// =============================================================================

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::account::TraderAccount;
use crate::config::{PctRange, Settings};
use crate::decision::{Action, Decision};
use crate::grid::{GridLimits, GridSpec};
use crate::types::PositionSide;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

/// Machine-readable rejection codes. The wire form is snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    SymbolNotAllowed,
    NoPrice,
    NoPositionToClose,
    DuplicatePosition,
    MaxPositionsReached,
    TradeSizeOutOfRange,
    LeverageOutOfRange,
    InsufficientBalance,
    StopLossOutOfRange,
    TakeProfitOutOfRange,
    GridConfigInvalid,
}

impl RejectCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SymbolNotAllowed => "symbol_not_allowed",
            Self::NoPrice => "no_price",
            Self::NoPositionToClose => "no_position_to_close",
            Self::DuplicatePosition => "duplicate_position",
            Self::MaxPositionsReached => "max_positions_reached",
            Self::TradeSizeOutOfRange => "trade_size_out_of_range",
            Self::LeverageOutOfRange => "leverage_out_of_range",
            Self::InsufficientBalance => "insufficient_balance",
            Self::StopLossOutOfRange => "stop_loss_out_of_range",
            Self::TakeProfitOutOfRange => "take_profit_out_of_range",
            Self::GridConfigInvalid => "grid_config_invalid",
        }
    }
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured rejection: code plus human-readable detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub code: RejectCode,
    pub message: String,
}

impl Rejection {
    fn new(code: RejectCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A position flagged as close to its liquidation price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationRisk {
    pub position_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub current_price: Decimal,
    pub liquidation_price: Decimal,
    pub distance_pct: Decimal,
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// All limits the validator enforces, sourced from settings once at boot.
#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub allowed_symbols: Vec<String>,
    pub min_trade: Decimal,
    pub max_trade: Decimal,
    pub max_leverage: u32,
    pub stop_loss_range_pct: PctRange,
    pub take_profit_range_pct: PctRange,
    pub grid: GridLimits,
}

impl RiskLimits {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            allowed_symbols: settings.allowed_symbols.clone(),
            min_trade: settings.min_trade,
            max_trade: settings.max_trade,
            max_leverage: settings.max_leverage,
            stop_loss_range_pct: settings.stop_loss_range_pct,
            take_profit_range_pct: settings.take_profit_range_pct,
            grid: GridLimits {
                level_min: settings.grid_level_min,
                level_max: settings.grid_level_max,
                investment_min: settings.grid_investment_min,
                investment_max: settings.grid_investment_max,
                leverage_max: settings.grid_leverage_max,
                stop_loss_range_pct: settings.grid_stop_loss_range_pct,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct RiskManager {
    limits: RiskLimits,
}

impl RiskManager {
    pub fn new(limits: RiskLimits) -> Self {
        info!(
            symbols = limits.allowed_symbols.len(),
            min_trade = %limits.min_trade,
            max_trade = %limits.max_trade,
            max_leverage = limits.max_leverage,
            "RiskManager initialised"
        );
        Self { limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Validate a decision against account state and current prices.
    pub fn validate(
        &self,
        decision: &Decision,
        account: &TraderAccount,
        prices: &HashMap<String, Decimal>,
    ) -> Result<(), Rejection> {
        let symbol = match decision.action {
            Action::Hold => return Ok(()),
            _ => decision.symbol().unwrap_or_default().to_string(),
        };

        if !self.limits.allowed_symbols.iter().any(|s| s == &symbol) {
            return Err(Rejection::new(
                RejectCode::SymbolNotAllowed,
                format!("symbol {symbol} not in allow-list"),
            ));
        }
        if !prices.contains_key(&symbol) {
            return Err(Rejection::new(
                RejectCode::NoPrice,
                format!("no price available for {symbol}"),
            ));
        }

        match &decision.action {
            Action::Hold => Ok(()),
            Action::Close { symbol } => self.validate_close(symbol, account),
            Action::Open { symbol, params, .. } => self.validate_open(symbol, params, account),
            Action::SetupGrid { spec, .. } | Action::UpdateGrid { spec, .. } => {
                self.validate_grid(spec, account)
            }
            // Grid existence is the engine's concern; nothing to check here.
            Action::StopGrid { .. } => Ok(()),
        }
    }

    fn validate_close(&self, symbol: &str, account: &TraderAccount) -> Result<(), Rejection> {
        if account.position_for_symbol(symbol).is_none() {
            return Err(Rejection::new(
                RejectCode::NoPositionToClose,
                format!("no open position on {symbol}"),
            ));
        }
        Ok(())
    }

    fn validate_open(
        &self,
        symbol: &str,
        params: &crate::decision::OpenParams,
        account: &TraderAccount,
    ) -> Result<(), Rejection> {
        let quantity_usd = params.quantity_usd;
        let leverage = params.leverage;
        if account.position_for_symbol(symbol).is_some() {
            return Err(Rejection::new(
                RejectCode::DuplicatePosition,
                format!("already holding a position on {symbol}"),
            ));
        }
        if !account.can_open_position() {
            return Err(Rejection::new(
                RejectCode::MaxPositionsReached,
                format!(
                    "{}/{} positions open",
                    account.open_positions.len(),
                    account.max_open_positions
                ),
            ));
        }
        if quantity_usd < self.limits.min_trade || quantity_usd > self.limits.max_trade {
            return Err(Rejection::new(
                RejectCode::TradeSizeOutOfRange,
                format!(
                    "size {quantity_usd} outside [{}, {}]",
                    self.limits.min_trade, self.limits.max_trade
                ),
            ));
        }
        if leverage < 1 || leverage > self.limits.max_leverage {
            return Err(Rejection::new(
                RejectCode::LeverageOutOfRange,
                format!("leverage {leverage}x outside [1, {}]", self.limits.max_leverage),
            ));
        }

        let margin_required = quantity_usd / Decimal::from(leverage);
        if margin_required > account.balance {
            return Err(Rejection::new(
                RejectCode::InsufficientBalance,
                format!("need {margin_required}, have {}", account.balance),
            ));
        }

        if let Some(sl) = params.stop_loss_pct {
            if !self.limits.stop_loss_range_pct.contains(sl) {
                return Err(Rejection::new(
                    RejectCode::StopLossOutOfRange,
                    format!(
                        "stop loss {sl}% outside [{}, {}]",
                        self.limits.stop_loss_range_pct.min, self.limits.stop_loss_range_pct.max
                    ),
                ));
            }
        }
        if let Some(tp) = params.take_profit_pct {
            if !self.limits.take_profit_range_pct.contains(tp) {
                return Err(Rejection::new(
                    RejectCode::TakeProfitOutOfRange,
                    format!(
                        "take profit {tp}% outside [{}, {}]",
                        self.limits.take_profit_range_pct.min, self.limits.take_profit_range_pct.max
                    ),
                ));
            }
        }

        Ok(())
    }

    fn validate_grid(&self, spec: &GridSpec, account: &TraderAccount) -> Result<(), Rejection> {
        spec.validate(&self.limits.grid)
            .map_err(|e| Rejection::new(RejectCode::GridConfigInvalid, e.to_string()))?;

        // The full investment is locked as margin when the grid goes live.
        if spec.investment > account.balance {
            return Err(Rejection::new(
                RejectCode::InsufficientBalance,
                format!("need {}, have {}", spec.investment, account.balance),
            ));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trigger queries
    // -------------------------------------------------------------------------

    /// Position ids whose stop-loss price has been breached.
    pub fn stop_loss_triggers(
        &self,
        account: &TraderAccount,
        prices: &HashMap<String, Decimal>,
    ) -> Vec<String> {
        let mut triggered = Vec::new();
        for (id, position) in &account.open_positions {
            if let Some(&price) = prices.get(&position.symbol) {
                if position.should_stop_loss(price) {
                    warn!(
                        trader_id = %account.trader_id,
                        symbol = %position.symbol,
                        %price,
                        stop = ?position.stop_loss_price,
                        "stop loss triggered"
                    );
                    triggered.push(id.clone());
                }
            }
        }
        triggered
    }

    /// Position ids whose take-profit price has been reached.
    pub fn take_profit_triggers(
        &self,
        account: &TraderAccount,
        prices: &HashMap<String, Decimal>,
    ) -> Vec<String> {
        let mut triggered = Vec::new();
        for (id, position) in &account.open_positions {
            if let Some(&price) = prices.get(&position.symbol) {
                if position.should_take_profit(price) {
                    info!(
                        trader_id = %account.trader_id,
                        symbol = %position.symbol,
                        %price,
                        target = ?position.take_profit_price,
                        "take profit triggered"
                    );
                    triggered.push(id.clone());
                }
            }
        }
        triggered
    }

    /// Positions whose distance to liquidation is below `threshold_pct`.
    pub fn liquidation_proximity(
        &self,
        account: &TraderAccount,
        prices: &HashMap<String, Decimal>,
        threshold_pct: Decimal,
    ) -> Vec<LiquidationRisk> {
        let mut at_risk = Vec::new();
        for (id, position) in &account.open_positions {
            let Some(&price) = prices.get(&position.symbol) else {
                continue;
            };
            let liquidation_price = position.liquidation_price();
            let distance_pct = match position.side {
                PositionSide::Long => {
                    if liquidation_price.is_zero() {
                        continue;
                    }
                    (price - liquidation_price) / liquidation_price * HUNDRED
                }
                PositionSide::Short => {
                    if price.is_zero() {
                        continue;
                    }
                    (liquidation_price - price) / price * HUNDRED
                }
            };

            if distance_pct < threshold_pct {
                warn!(
                    trader_id = %account.trader_id,
                    symbol = %position.symbol,
                    %price,
                    %liquidation_price,
                    distance_pct = %distance_pct,
                    "position approaching liquidation"
                );
                at_risk.push(LiquidationRisk {
                    position_id: id.clone(),
                    symbol: position.symbol.clone(),
                    side: position.side,
                    current_price: price,
                    liquidation_price,
                    distance_pct,
                });
            }
        }
        at_risk
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("symbols", &self.limits.allowed_symbols.len())
            .field("max_leverage", &self.limits.max_leverage)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::OpenParams;
    use rust_decimal_macros::dec;

    fn limits() -> RiskLimits {
        RiskLimits::from_settings(&Settings::default())
    }

    fn manager() -> RiskManager {
        RiskManager::new(limits())
    }

    fn prices() -> HashMap<String, Decimal> {
        let mut p = HashMap::new();
        p.insert("ETHUSDT".to_string(), dec!(2500));
        p.insert("BNBUSDT".to_string(), dec!(610));
        p
    }

    fn buy(quantity_usd: Decimal, leverage: u32) -> Decision {
        Decision {
            action: Action::Open {
                symbol: "ETHUSDT".to_string(),
                side: PositionSide::Long,
                params: OpenParams {
                    quantity_usd,
                    leverage,
                    stop_loss_pct: None,
                    take_profit_pct: None,
                },
            },
            reasoning: String::new(),
            confidence: 0.5,
        }
    }

    #[test]
    fn hold_is_always_valid() {
        let account = TraderAccount::new("LLM-A", dec!(0), 3);
        let d = Decision {
            action: Action::Hold,
            reasoning: String::new(),
            confidence: 0.5,
        };
        assert!(manager().validate(&d, &account, &HashMap::new()).is_ok());
    }

    #[test]
    fn margin_check_accepts_then_rejects_on_leverage_drop() {
        // Balance 30: BUY 40 at 3x needs 13.33 margin — accepted; the same
        // size at 1x needs the full 40 — rejected as insufficient_balance.
        let account = TraderAccount::new("LLM-A", dec!(30), 3);
        let m = manager();

        assert!(m.validate(&buy(dec!(40), 3), &account, &prices()).is_ok());

        let rejection = m
            .validate(&buy(dec!(40), 1), &account, &prices())
            .unwrap_err();
        assert_eq!(rejection.code, RejectCode::InsufficientBalance);
        assert_eq!(rejection.code.to_string(), "insufficient_balance");
    }

    #[test]
    fn unknown_symbol_rejected() {
        let account = TraderAccount::new("LLM-A", dec!(100), 3);
        let mut d = buy(dec!(20), 2);
        if let Action::Open { symbol, .. } = &mut d.action {
            *symbol = "SHIBUSDT".to_string();
        }
        let r = manager().validate(&d, &account, &prices()).unwrap_err();
        assert_eq!(r.code, RejectCode::SymbolNotAllowed);
    }

    #[test]
    fn missing_price_rejected() {
        let account = TraderAccount::new("LLM-A", dec!(100), 3);
        let mut p = prices();
        p.remove("ETHUSDT");
        let r = manager().validate(&buy(dec!(20), 2), &account, &p).unwrap_err();
        assert_eq!(r.code, RejectCode::NoPrice);
    }

    #[test]
    fn close_without_position_rejected() {
        let account = TraderAccount::new("LLM-A", dec!(100), 3);
        let d = Decision {
            action: Action::Close {
                symbol: "ETHUSDT".to_string(),
            },
            reasoning: String::new(),
            confidence: 0.5,
        };
        let r = manager().validate(&d, &account, &prices()).unwrap_err();
        assert_eq!(r.code, RejectCode::NoPositionToClose);
    }

    #[test]
    fn duplicate_position_rejected() {
        let mut account = TraderAccount::new("LLM-A", dec!(100), 3);
        account
            .open_position("ETHUSDT", PositionSide::Long, dec!(2500), dec!(20), 2, None, None)
            .unwrap();
        let r = manager()
            .validate(&buy(dec!(20), 2), &account, &prices())
            .unwrap_err();
        assert_eq!(r.code, RejectCode::DuplicatePosition);
    }

    #[test]
    fn trade_size_band_enforced() {
        let account = TraderAccount::new("LLM-A", dec!(100), 3);
        let m = manager();
        assert_eq!(
            m.validate(&buy(dec!(2), 2), &account, &prices()).unwrap_err().code,
            RejectCode::TradeSizeOutOfRange
        );
        assert_eq!(
            m.validate(&buy(dec!(41), 2), &account, &prices()).unwrap_err().code,
            RejectCode::TradeSizeOutOfRange
        );
    }

    #[test]
    fn leverage_band_enforced() {
        let account = TraderAccount::new("LLM-A", dec!(100), 3);
        let r = manager()
            .validate(&buy(dec!(20), 11), &account, &prices())
            .unwrap_err();
        assert_eq!(r.code, RejectCode::LeverageOutOfRange);
    }

    #[test]
    fn stop_loss_band_enforced() {
        let account = TraderAccount::new("LLM-A", dec!(100), 3);
        let d = Decision {
            action: Action::Open {
                symbol: "ETHUSDT".to_string(),
                side: PositionSide::Long,
                params: OpenParams {
                    quantity_usd: dec!(20),
                    leverage: 2,
                    stop_loss_pct: Some(dec!(25)),
                    take_profit_pct: None,
                },
            },
            reasoning: String::new(),
            confidence: 0.5,
        };
        let r = manager().validate(&d, &account, &prices()).unwrap_err();
        assert_eq!(r.code, RejectCode::StopLossOutOfRange);
    }

    #[test]
    fn grid_config_validated_and_margin_checked() {
        let account = TraderAccount::new("LLM-A", dec!(100), 3);
        let spec = GridSpec {
            symbol: "BNBUSDT".to_string(),
            upper: dec!(200),
            lower: dec!(100),
            level_count: 6,
            spacing: crate::grid::SpacingKind::Arithmetic,
            leverage: 3,
            investment: dec!(120),
            stop_loss_pct: dec!(12),
        };
        let d = Decision {
            action: Action::SetupGrid {
                symbol: "BNBUSDT".to_string(),
                spec: spec.clone(),
            },
            reasoning: String::new(),
            confidence: 0.5,
        };
        // Investment 120 exceeds the 100 balance.
        let r = manager().validate(&d, &account, &prices()).unwrap_err();
        assert_eq!(r.code, RejectCode::InsufficientBalance);

        // A trader with 150 free balance passes.
        let rich = TraderAccount::new("LLM-B", dec!(150), 3);
        assert!(manager().validate(&d, &rich, &prices()).is_ok());

        // Broken config is caught before the margin check.
        let mut bad = d.clone();
        if let Action::SetupGrid { spec, .. } = &mut bad.action {
            spec.level_count = 12;
        }
        let r = manager().validate(&bad, &rich, &prices()).unwrap_err();
        assert_eq!(r.code, RejectCode::GridConfigInvalid);
    }

    #[test]
    fn stop_loss_triggers_fire_on_breach() {
        let mut account = TraderAccount::new("LLM-A", dec!(100), 3);
        let p = account
            .open_position(
                "ETHUSDT",
                PositionSide::Long,
                dec!(2500),
                dec!(20),
                2,
                Some(dec!(4)),
                Some(dec!(8)),
            )
            .unwrap();

        let mut market = prices();
        market.insert("ETHUSDT".to_string(), dec!(2400)); // SL at 2400
        let triggered = manager().stop_loss_triggers(&account, &market);
        assert_eq!(triggered, vec![p.position_id.clone()]);

        market.insert("ETHUSDT".to_string(), dec!(2700)); // TP at 2700
        let tp = manager().take_profit_triggers(&account, &market);
        assert_eq!(tp, vec![p.position_id]);
    }

    #[test]
    fn liquidation_proximity_flags_nearby_positions() {
        let mut account = TraderAccount::new("LLM-A", dec!(100), 3);
        account
            .open_position("ETHUSDT", PositionSide::Long, dec!(2500), dec!(40), 4, None, None)
            .unwrap();
        // Liquidation at 2500 * 0.75 = 1875.
        let mut market = HashMap::new();
        market.insert("ETHUSDT".to_string(), dec!(1900));

        let risks = manager().liquidation_proximity(&account, &market, dec!(90));
        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].liquidation_price, dec!(1875.00));
        // (1900 - 1875) / 1875 * 100 ≈ 1.33% — far inside the 90% threshold.
        assert!(risks[0].distance_pct < dec!(2));

        // Price far above liquidation: distance exceeds threshold.
        market.insert("ETHUSDT".to_string(), dec!(5000));
        let clear = manager().liquidation_proximity(&account, &market, dec!(90));
        assert!(clear.is_empty());
    }
}
