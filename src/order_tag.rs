// =============================================================================
// Order attribution tags — client-order-id encoding and parsing
// =============================================================================
//
// Every order this engine emits carries a structured client-order-id that maps
// the resulting exchange order (and any position it creates) back to the
// virtual trader that caused it. The reconciler depends on this contract;
// changing either format is a compatibility break.
//
// Two forms exist:
//   Non-grid:  "{trader_id}_{symbol}_{unix_ms}"
//              e.g. LLM-A_ETHUSDT_1728394875123
//   Grid:      "GRID_{trader_id}_{symbol}_{grid_short}_{BUY|SELL}_{level_index}"
//              e.g. GRID_LLM-B_BNBUSDT_a1b2c3d4_BUY_3
//
// Parsing is right-anchored so that trader ids containing underscores still
// attribute correctly. Ids matching neither form parse to None (unowned).
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::OrderSide;

const GRID_PREFIX: &str = "GRID_";
/// Millisecond timestamps are 13 digits from 2001 through 2286.
const UNIX_MS_DIGITS: usize = 13;
/// The grid nonce is always 8 lowercase hex characters.
const GRID_SHORT_LEN: usize = 8;

/// A parsed client-order-id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderTag {
    /// A directional (market) order placed straight from a decision.
    Trader {
        trader_id: String,
        symbol: String,
        unix_ms: u64,
    },
    /// A grid ladder level order.
    Grid {
        trader_id: String,
        symbol: String,
        grid_short: String,
        side: OrderSide,
        level_index: usize,
    },
}

impl OrderTag {
    /// Build a non-grid tag for `trader_id` on `symbol` at `unix_ms`.
    pub fn trader(trader_id: &str, symbol: &str, unix_ms: u64) -> Self {
        Self::Trader {
            trader_id: trader_id.to_string(),
            symbol: symbol.to_string(),
            unix_ms,
        }
    }

    /// Build a grid level tag.
    pub fn grid(
        trader_id: &str,
        symbol: &str,
        grid_short: &str,
        side: OrderSide,
        level_index: usize,
    ) -> Self {
        Self::Grid {
            trader_id: trader_id.to_string(),
            symbol: symbol.to_string(),
            grid_short: grid_short.to_string(),
            side,
            level_index,
        }
    }

    /// The trader this tag attributes to.
    pub fn trader_id(&self) -> &str {
        match self {
            Self::Trader { trader_id, .. } | Self::Grid { trader_id, .. } => trader_id,
        }
    }

    /// The symbol encoded in the tag.
    pub fn symbol(&self) -> &str {
        match self {
            Self::Trader { symbol, .. } | Self::Grid { symbol, .. } => symbol,
        }
    }

    /// The full grid id ("GRID_{trader}_{symbol}_{short}") for grid tags.
    pub fn grid_id(&self) -> Option<String> {
        match self {
            Self::Grid {
                trader_id,
                symbol,
                grid_short,
                ..
            } => Some(format!("GRID_{trader_id}_{symbol}_{grid_short}")),
            Self::Trader { .. } => None,
        }
    }

    /// Serialise into the client-order-id wire form.
    pub fn encode(&self) -> String {
        match self {
            Self::Trader {
                trader_id,
                symbol,
                unix_ms,
            } => format!("{trader_id}_{symbol}_{unix_ms}"),
            Self::Grid {
                trader_id,
                symbol,
                grid_short,
                side,
                level_index,
            } => format!("GRID_{trader_id}_{symbol}_{grid_short}_{side}_{level_index}"),
        }
    }

    /// Parse a client-order-id. Ids that match neither form return `None`;
    /// such orders must never be attributed to a trader.
    pub fn parse(client_order_id: &str) -> Option<Self> {
        if let Some(rest) = client_order_id.strip_prefix(GRID_PREFIX) {
            return Self::parse_grid(rest);
        }
        Self::parse_trader(client_order_id)
    }

    /// "{trader}_{symbol}_{grid_short}_{side}_{index}" — consumed right to
    /// left so underscores inside the trader id stay intact.
    fn parse_grid(rest: &str) -> Option<Self> {
        let (rest, index) = rest.rsplit_once('_')?;
        let (rest, side) = rest.rsplit_once('_')?;
        let (rest, grid_short) = rest.rsplit_once('_')?;
        let (trader_id, symbol) = rest.rsplit_once('_')?;

        let level_index: usize = match index.chars().all(|c| c.is_ascii_digit()) {
            true => index.parse().ok()?,
            false => return None,
        };
        let side = OrderSide::parse(side)?;

        if grid_short.len() != GRID_SHORT_LEN
            || !grid_short.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return None;
        }
        if !is_symbol(symbol) || trader_id.is_empty() {
            return None;
        }

        Some(Self::Grid {
            trader_id: trader_id.to_string(),
            symbol: symbol.to_string(),
            grid_short: grid_short.to_string(),
            side,
            level_index,
        })
    }

    /// "{trader}_{symbol}_{unix_ms}" — again right-anchored.
    fn parse_trader(id: &str) -> Option<Self> {
        let (rest, ms) = id.rsplit_once('_')?;
        let (trader_id, symbol) = rest.rsplit_once('_')?;

        if ms.len() != UNIX_MS_DIGITS || !ms.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        if !is_symbol(symbol) || trader_id.is_empty() {
            return None;
        }

        Some(Self::Trader {
            trader_id: trader_id.to_string(),
            symbol: symbol.to_string(),
            unix_ms: ms.parse().ok()?,
        })
    }
}

/// Exchange symbols are uppercase alphanumerics (e.g. "ETHUSDT", "1000PEPEUSDT").
fn is_symbol(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

impl std::fmt::Display for OrderTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}
