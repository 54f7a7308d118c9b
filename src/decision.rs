// =============================================================================
// Decision model — closed variants over provider output
// =============================================================================
//
// Providers return free-form JSON; this module is the single place that
// tolerates shape variation. Everything downstream (risk, execution,
// persistence) works on the closed `Decision` type. A shape mismatch fails
// with the raw payload preserved so the decision record can store exactly
// what the provider said.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::grid::{GridSpec, SpacingKind};
use crate::types::PositionSide;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A provider response that does not fit the decision shape. The raw payload
/// rides along for the decision record.
#[derive(Debug, Error)]
#[error("unparseable decision: {message}")]
pub struct ResponseParseError {
    pub message: String,
    pub raw: String,
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Sizing of a directional open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenParams {
    pub quantity_usd: Decimal,
    pub leverage: u32,
    pub stop_loss_pct: Option<Decimal>,
    pub take_profit_pct: Option<Decimal>,
}

/// What the trader wants to do, discriminated on the provider's `action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Action {
    Hold,
    Open {
        symbol: String,
        side: PositionSide,
        params: OpenParams,
    },
    Close {
        symbol: String,
    },
    SetupGrid {
        symbol: String,
        spec: GridSpec,
    },
    UpdateGrid {
        symbol: String,
        spec: GridSpec,
    },
    StopGrid {
        symbol: String,
    },
}

impl Action {
    /// The wire-form action name ("BUY", "SETUP_GRID", ...).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hold => "HOLD",
            Self::Open {
                side: PositionSide::Long,
                ..
            } => "BUY",
            Self::Open {
                side: PositionSide::Short,
                ..
            } => "SELL",
            Self::Close { .. } => "CLOSE",
            Self::SetupGrid { .. } => "SETUP_GRID",
            Self::UpdateGrid { .. } => "UPDATE_GRID",
            Self::StopGrid { .. } => "STOP_GRID",
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Hold => None,
            Self::Open { symbol, .. }
            | Self::Close { symbol }
            | Self::SetupGrid { symbol, .. }
            | Self::UpdateGrid { symbol, .. }
            | Self::StopGrid { symbol } => Some(symbol),
        }
    }
}

/// A fully parsed trading decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub reasoning: String,
    pub confidence: f64,
}

impl Decision {
    pub fn symbol(&self) -> Option<&str> {
        self.action.symbol()
    }

    /// Parse a provider's JSON value into a decision.
    ///
    /// Required: `action`, `reasoning`, `confidence` in [0, 1]. Action-
    /// specific payloads are required per action; anything else in the value
    /// is ignored.
    pub fn from_value(v: &serde_json::Value) -> Result<Self, ResponseParseError> {
        let fail = |message: String| ResponseParseError {
            message,
            raw: v.to_string(),
        };

        let action_str = v
            .get("action")
            .and_then(|a| a.as_str())
            .ok_or_else(|| fail("missing 'action'".to_string()))?;

        let reasoning = v
            .get("reasoning")
            .and_then(|r| r.as_str())
            .ok_or_else(|| fail("missing 'reasoning'".to_string()))?
            .to_string();

        let confidence = v
            .get("confidence")
            .and_then(|c| c.as_f64())
            .ok_or_else(|| fail("missing 'confidence'".to_string()))?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(fail(format!("confidence {confidence} outside [0, 1]")));
        }

        let symbol = || -> Result<String, ResponseParseError> {
            v.get("symbol")
                .and_then(|s| s.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| fail(format!("'{action_str}' requires 'symbol'")))
        };

        let action = match action_str {
            "HOLD" => Action::Hold,
            "BUY" | "SELL" => {
                let side = if action_str == "BUY" {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                };
                let quantity_usd = json_decimal(v, "quantity_usd")
                    .ok_or_else(|| fail("missing or invalid 'quantity_usd'".to_string()))?;
                let leverage = v
                    .get("leverage")
                    .and_then(|l| l.as_u64())
                    .and_then(|l| u32::try_from(l).ok())
                    .ok_or_else(|| fail("missing or invalid 'leverage'".to_string()))?;
                Action::Open {
                    symbol: symbol()?,
                    side,
                    params: OpenParams {
                        quantity_usd,
                        leverage,
                        stop_loss_pct: json_decimal(v, "stop_loss_pct"),
                        take_profit_pct: json_decimal(v, "take_profit_pct"),
                    },
                }
            }
            "CLOSE" => Action::Close { symbol: symbol()? },
            "SETUP_GRID" | "UPDATE_GRID" => {
                let symbol = symbol()?;
                let config = v
                    .get("grid_config")
                    .filter(|c| c.is_object())
                    .ok_or_else(|| fail(format!("'{action_str}' requires 'grid_config'")))?;
                let spec = parse_grid_spec(&symbol, config)
                    .map_err(|m| fail(format!("invalid 'grid_config': {m}")))?;
                if action_str == "SETUP_GRID" {
                    Action::SetupGrid { symbol, spec }
                } else {
                    Action::UpdateGrid { symbol, spec }
                }
            }
            "STOP_GRID" => Action::StopGrid { symbol: symbol()? },
            other => return Err(fail(format!("unknown action '{other}'"))),
        };

        Ok(Self {
            action,
            reasoning,
            confidence,
        })
    }
}

fn parse_grid_spec(symbol: &str, config: &serde_json::Value) -> Result<GridSpec, String> {
    let upper = json_decimal(config, "upper_limit").ok_or("missing 'upper_limit'")?;
    let lower = json_decimal(config, "lower_limit").ok_or("missing 'lower_limit'")?;
    let level_count = config
        .get("grid_levels")
        .and_then(|l| l.as_u64())
        .and_then(|l| usize::try_from(l).ok())
        .ok_or("missing 'grid_levels'")?;
    let spacing = config
        .get("spacing_type")
        .and_then(|s| s.as_str())
        .and_then(SpacingKind::parse)
        .ok_or("missing or unknown 'spacing_type'")?;
    let leverage = config
        .get("leverage")
        .and_then(|l| l.as_u64())
        .and_then(|l| u32::try_from(l).ok())
        .ok_or("missing 'leverage'")?;
    let investment = json_decimal(config, "investment_usd").ok_or("missing 'investment_usd'")?;
    let stop_loss_pct = json_decimal(config, "stop_loss_pct").ok_or("missing 'stop_loss_pct'")?;

    Ok(GridSpec {
        symbol: symbol.to_string(),
        upper,
        lower,
        level_count,
        spacing,
        leverage,
        investment,
        stop_loss_pct,
    })
}

/// Read a Decimal out of a JSON field that may be a number or a string.
fn json_decimal(v: &serde_json::Value, key: &str) -> Option<Decimal> {
    match v.get(key)? {
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Decision record
// ---------------------------------------------------------------------------

/// Append-only audit row: one per (cycle, trader).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub record_id: String,
    pub trader_id: String,
    pub context_digest: String,
    pub action: String,
    pub symbol: Option<String>,
    pub reasoning: String,
    pub confidence: f64,
    pub execution_status: String,
    pub execution_detail: Option<String>,
    /// Raw provider payload, preserved verbatim (including unparseable ones).
    pub raw_response: String,
    pub tokens_prompt: u32,
    pub tokens_completion: u32,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl DecisionRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trader_id: &str,
        context_digest: &str,
        action: &str,
        symbol: Option<String>,
        reasoning: String,
        confidence: f64,
        execution_status: &str,
        execution_detail: Option<String>,
        raw_response: String,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4().to_string(),
            trader_id: trader_id.to_string(),
            context_digest: context_digest.to_string(),
            action: action.to_string(),
            symbol,
            reasoning,
            confidence,
            execution_status: execution_status.to_string(),
            execution_detail,
            raw_response,
            tokens_prompt: 0,
            tokens_completion: 0,
            cost_usd: 0.0,
            latency_ms: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_usage(
        mut self,
        tokens_prompt: u32,
        tokens_completion: u32,
        cost_usd: f64,
        latency_ms: u64,
    ) -> Self {
        self.tokens_prompt = tokens_prompt;
        self.tokens_completion = tokens_completion;
        self.cost_usd = cost_usd;
        self.latency_ms = latency_ms;
        self
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
    fn parse_hold() {
        let v = serde_json::json!({
            "action": "HOLD",
            "reasoning": "choppy market",
            "confidence": 0.8
        });
        let d = Decision::from_value(&v).unwrap();
        assert!(matches!(d.action, Action::Hold));
        assert_eq!(d.action.kind(), "HOLD");
        assert!(d.symbol().is_none());
        assert_eq!(d.reasoning, "choppy market");
    }

    #[test]
    fn parse_buy_with_params() {
        let v = serde_json::json!({
            "action": "BUY",
            "symbol": "ETHUSDT",
            "quantity_usd": 40,
            "leverage": 3,
            "stop_loss_pct": 5,
            "take_profit_pct": 10,
            "reasoning": "oversold bounce",
            "confidence": 0.65
        });
        let d = Decision::from_value(&v).unwrap();
        assert_eq!(d.action.kind(), "BUY");
        match d.action {
            Action::Open { symbol, side, params } => {
                assert_eq!(symbol, "ETHUSDT");
                assert_eq!(side, PositionSide::Long);
                assert_eq!(params.quantity_usd, dec!(40));
                assert_eq!(params.leverage, 3);
                assert_eq!(params.stop_loss_pct, Some(dec!(5)));
                assert_eq!(params.take_profit_pct, Some(dec!(10)));
            }
            other => panic!("expected Open, got {other:?}"),
        }
    }

    #[test]
    fn parse_sell_maps_to_short() {
        let v = serde_json::json!({
            "action": "SELL",
            "symbol": "BNBUSDT",
            "quantity_usd": "25.5",
            "leverage": 2,
            "reasoning": "resistance rejection",
            "confidence": 0.5
        });
        let d = Decision::from_value(&v).unwrap();
        assert_eq!(d.action.kind(), "SELL");
        match d.action {
            Action::Open { side, params, .. } => {
                assert_eq!(side, PositionSide::Short);
                // String-typed numbers are accepted.
                assert_eq!(params.quantity_usd, dec!(25.5));
                assert_eq!(params.stop_loss_pct, None);
            }
            other => panic!("expected Open, got {other:?}"),
        }
    }

    #[test]
    fn parse_close() {
        let v = serde_json::json!({
            "action": "CLOSE",
            "symbol": "XRPUSDT",
            "reasoning": "target reached",
            "confidence": 0.9
        });
        let d = Decision::from_value(&v).unwrap();
        assert!(matches!(d.action, Action::Close { .. }));
        assert_eq!(d.symbol(), Some("XRPUSDT"));
    }

    #[test]
    fn parse_setup_grid() {
        let v = serde_json::json!({
            "action": "SETUP_GRID",
            "symbol": "BNBUSDT",
            "grid_config": {
                "upper_limit": 200,
                "lower_limit": 100,
                "grid_levels": 6,
                "spacing_type": "arithmetic",
                "leverage": 3,
                "investment_usd": 120,
                "stop_loss_pct": 12
            },
            "reasoning": "tight sideways range",
            "confidence": 0.7
        });
        let d = Decision::from_value(&v).unwrap();
        match d.action {
            Action::SetupGrid { symbol, spec } => {
                assert_eq!(symbol, "BNBUSDT");
                assert_eq!(spec.upper, dec!(200));
                assert_eq!(spec.lower, dec!(100));
                assert_eq!(spec.level_count, 6);
                assert_eq!(spec.spacing, SpacingKind::Arithmetic);
                assert_eq!(spec.investment, dec!(120));
            }
            other => panic!("expected SetupGrid, got {other:?}"),
        }
    }

    #[test]
    fn parse_stop_grid_requires_symbol() {
        let v = serde_json::json!({
            "action": "STOP_GRID",
            "reasoning": "trend breakout",
            "confidence": 0.8
        });
        let err = Decision::from_value(&v).unwrap_err();
        assert!(err.message.contains("symbol"));
        // Raw payload is preserved for the decision record.
        assert!(err.raw.contains("STOP_GRID"));
    }

    #[test]
    fn unknown_action_fails_with_raw() {
        let v = serde_json::json!({
            "action": "YOLO",
            "reasoning": "?",
            "confidence": 0.1
        });
        let err = Decision::from_value(&v).unwrap_err();
        assert!(err.message.contains("YOLO"));
        assert!(err.raw.contains("YOLO"));
    }

    #[test]
    fn confidence_out_of_range_fails() {
        let v = serde_json::json!({
            "action": "HOLD",
            "reasoning": "sure thing",
            "confidence": 1.5
        });
        assert!(Decision::from_value(&v).is_err());
    }

    #[test]
    fn buy_without_quantity_fails() {
        let v = serde_json::json!({
            "action": "BUY",
            "symbol": "ETHUSDT",
            "leverage": 3,
            "reasoning": "gap fill",
            "confidence": 0.4
        });
        let err = Decision::from_value(&v).unwrap_err();
        assert!(err.message.contains("quantity_usd"));
    }

    #[test]
    fn grid_config_missing_field_fails() {
        let v = serde_json::json!({
            "action": "SETUP_GRID",
            "symbol": "BNBUSDT",
            "grid_config": {
                "upper_limit": 200,
                "lower_limit": 100
            },
            "reasoning": "range",
            "confidence": 0.7
        });
        let err = Decision::from_value(&v).unwrap_err();
        assert!(err.message.contains("grid_config"));
    }

    #[test]
    fn decision_record_with_usage() {
        let r = DecisionRecord::new(
            "LLM-A",
            "abc123",
            "HOLD",
            None,
            "flat".to_string(),
            0.5,
            "HELD",
            None,
            "{}".to_string(),
        )
        .with_usage(900, 120, 0.004, 2100);
        assert_eq!(r.tokens_prompt, 900);
        assert_eq!(r.tokens_completion, 120);
        assert_eq!(r.latency_ms, 2100);
        assert_eq!(r.execution_status, "HELD");
    }
}
