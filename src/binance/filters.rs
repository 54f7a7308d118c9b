// =============================================================================
// Symbol filters — per-symbol quantity step and price tick rounding
// =============================================================================
//
// Every futures symbol carries a LOT_SIZE filter (quantity step) and a
// PRICE_FILTER (price tick). Orders whose quantity or price is not a multiple
// of the respective increment are rejected by the exchange, so every outbound
// order is rounded here first. Rounding always floors.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Trading filters for one symbol, extracted from `exchangeInfo`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub step_size: Decimal,
    pub tick_size: Decimal,
    pub min_qty: Decimal,
}

impl SymbolFilters {
    /// Parse a single `symbols[]` entry of the `exchangeInfo` response.
    pub fn from_exchange_info(entry: &serde_json::Value) -> Option<Self> {
        let filters = entry.get("filters")?.as_array()?;

        let mut step_size = None;
        let mut tick_size = None;
        let mut min_qty = None;

        for f in filters {
            match f.get("filterType").and_then(|v| v.as_str()) {
                Some("LOT_SIZE") => {
                    step_size = parse_decimal_field(f, "stepSize");
                    min_qty = parse_decimal_field(f, "minQty");
                }
                Some("PRICE_FILTER") => {
                    tick_size = parse_decimal_field(f, "tickSize");
                }
                _ => {}
            }
        }

        Some(Self {
            step_size: step_size?,
            tick_size: tick_size?,
            min_qty: min_qty.unwrap_or(Decimal::ZERO),
        })
    }
}

fn parse_decimal_field(v: &serde_json::Value, key: &str) -> Option<Decimal> {
    v.get(key)?.as_str()?.parse().ok()
}

/// Floor `qty` to a multiple of `step`. A zero step passes the value through.
pub fn round_to_step(qty: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return qty;
    }
    ((qty / step).floor() * step).normalize()
}

/// Floor `price` to a multiple of `tick`. A zero tick passes the value through.
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick.is_zero() {
        return price;
    }
    ((price / tick).floor() * tick).normalize()
}

/// Thread-safe cache of per-symbol filters, populated lazily from
/// `exchangeInfo` by the client.
pub struct FilterCache {
    inner: RwLock<HashMap<String, SymbolFilters>>,
}

impl FilterCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<SymbolFilters> {
        self.inner.read().get(symbol).copied()
    }

    pub fn insert(&self, symbol: &str, filters: SymbolFilters) {
        debug!(symbol, ?filters, "symbol filters cached");
        self.inner.write().insert(symbol.to_string(), filters);
    }
}

impl Default for FilterCache {
    fn default() -> Self {
        Self::new()
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
    fn step_rounding_floors() {
        assert_eq!(round_to_step(dec!(0.1234), dec!(0.001)), dec!(0.123));
        assert_eq!(round_to_step(dec!(5.999), dec!(0.5)), dec!(5.5));
        assert_eq!(round_to_step(dec!(1), dec!(0.001)), dec!(1));
    }

    #[test]
    fn tick_rounding_floors() {
        assert_eq!(round_to_tick(dec!(2501.37), dec!(0.01)), dec!(2501.37));
        assert_eq!(round_to_tick(dec!(2501.379), dec!(0.01)), dec!(2501.37));
        assert_eq!(round_to_tick(dec!(0.56789), dec!(0.0001)), dec!(0.5678));
    }

    #[test]
    fn zero_increment_passes_through() {
        assert_eq!(round_to_step(dec!(1.23), Decimal::ZERO), dec!(1.23));
        assert_eq!(round_to_tick(dec!(1.23), Decimal::ZERO), dec!(1.23));
    }

    #[test]
    fn parse_filters_from_exchange_info_entry() {
        let entry = serde_json::json!({
            "symbol": "ETHUSDT",
            "filters": [
                { "filterType": "PRICE_FILTER", "tickSize": "0.01", "minPrice": "39.86" },
                { "filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "10000" }
            ]
        });

        let f = SymbolFilters::from_exchange_info(&entry).unwrap();
        assert_eq!(f.tick_size, dec!(0.01));
        assert_eq!(f.step_size, dec!(0.001));
        assert_eq!(f.min_qty, dec!(0.001));
    }

    #[test]
    fn parse_filters_missing_lot_size_fails() {
        let entry = serde_json::json!({
            "symbol": "ETHUSDT",
            "filters": [
                { "filterType": "PRICE_FILTER", "tickSize": "0.01" }
            ]
        });
        assert!(SymbolFilters::from_exchange_info(&entry).is_none());
    }

    #[test]
    fn filter_cache_roundtrip() {
        let cache = FilterCache::new();
        assert!(cache.get("ETHUSDT").is_none());
        cache.insert(
            "ETHUSDT",
            SymbolFilters {
                step_size: dec!(0.001),
                tick_size: dec!(0.01),
                min_qty: dec!(0.001),
            },
        );
        assert_eq!(cache.get("ETHUSDT").unwrap().step_size, dec!(0.001));
    }
}
