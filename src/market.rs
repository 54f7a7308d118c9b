// =============================================================================
// Market Data Service — TTL-cached reads over the exchange gateway
// =============================================================================
//
// Wraps the futures client with an in-process TTL cache keyed by
// (endpoint, symbol). The TTL is seconds-scale: enough to amortise one
// decision cycle's reads across traders without serving stale prices to the
// next cycle. Kline reads are never cached; indicator maths wants the freshest
// closes available.
//
// Cache locking is sharded: each key hashes to one of a small fixed number of
// mutexes, so concurrent readers of different symbols do not contend.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::binance::{BinanceFuturesClient, Ticker24h};
use crate::indicators::IndicatorSet;

const CACHE_SHARDS: usize = 8;

// ---------------------------------------------------------------------------
// Snapshot shapes
// ---------------------------------------------------------------------------

/// Per-symbol market snapshot row (append-only once persisted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub price: Decimal,
    pub change_pct_24h: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub quote_volume_24h: Decimal,
}

/// Snapshot of every tracked symbol at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub taken_at: DateTime<Utc>,
    pub symbols: Vec<SymbolSnapshot>,
    pub gainers: u32,
    pub losers: u32,
}

/// One symbol's row in the formatted context handed to decision providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolContext {
    pub symbol: String,
    pub price: Decimal,
    pub change_pct_24h: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub quote_volume_24h: Decimal,
    pub rsi_14: f64,
    pub macd: f64,
    pub macd_signal: f64,
}

// ---------------------------------------------------------------------------
// TTL cache
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum CachedValue {
    Price(Decimal),
    Ticker(Ticker24h),
}

struct CacheEntry {
    value: CachedValue,
    at: Instant,
}

/// Sharded TTL cache; a key always maps to the same shard mutex.
struct ShardedCache {
    shards: Vec<Mutex<HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

impl ShardedCache {
    fn new(ttl: Duration) -> Self {
        Self {
            shards: (0..CACHE_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            ttl,
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, CacheEntry>> {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        &self.shards[(h.finish() as usize) % CACHE_SHARDS]
    }

    fn get(&self, key: &str) -> Option<CachedValue> {
        let shard = self.shard(key).lock();
        let entry = shard.get(key)?;
        if entry.at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    fn put(&self, key: &str, value: CachedValue) {
        self.shard(key).lock().insert(
            key.to_string(),
            CacheEntry {
                value,
                at: Instant::now(),
            },
        );
    }

    fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Market data reads for all tracked symbols, cache included.
pub struct MarketDataService {
    client: Arc<BinanceFuturesClient>,
    symbols: Vec<String>,
    cache: ShardedCache,
}

impl MarketDataService {
    pub fn new(client: Arc<BinanceFuturesClient>, symbols: Vec<String>, ttl_seconds: u64) -> Self {
        Self {
            client,
            symbols,
            cache: ShardedCache::new(Duration::from_secs(ttl_seconds)),
        }
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Drop every cached entry (the decision cycle forces fresh prices).
    pub fn clear_cache(&self) {
        self.cache.clear();
        debug!("market data cache cleared");
    }

    // -------------------------------------------------------------------------
    // Prices
    // -------------------------------------------------------------------------

    /// Last price for one symbol, honouring the TTL cache.
    pub async fn price(&self, symbol: &str) -> Option<Decimal> {
        let key = format!("price:{symbol}");
        if let Some(CachedValue::Price(p)) = self.cache.get(&key) {
            return Some(p);
        }

        match self.client.get_ticker_price(symbol).await {
            Ok(p) => {
                self.cache.put(&key, CachedValue::Price(p));
                Some(p)
            }
            Err(e) => {
                warn!(symbol, error = %e, "failed to fetch price");
                None
            }
        }
    }

    /// Prices for all tracked symbols. Symbols whose fetch fails are skipped
    /// (and logged); the cycle continues with whatever is available.
    pub async fn current_prices(&self, force_refresh: bool) -> HashMap<String, Decimal> {
        if force_refresh {
            self.clear_cache();
        }

        let mut prices = HashMap::with_capacity(self.symbols.len());
        for symbol in &self.symbols {
            if let Some(p) = self.price(symbol).await {
                prices.insert(symbol.clone(), p);
            }
        }
        prices
    }

    // -------------------------------------------------------------------------
    // 24h statistics / snapshot
    // -------------------------------------------------------------------------

    async fn ticker_24h(&self, symbol: &str) -> Option<Ticker24h> {
        let key = format!("ticker24h:{symbol}");
        if let Some(CachedValue::Ticker(t)) = self.cache.get(&key) {
            return Some(t);
        }

        match self.client.get_ticker_24h(symbol).await {
            Ok(t) => {
                self.cache.put(&key, CachedValue::Ticker(t.clone()));
                Some(t)
            }
            Err(e) => {
                warn!(symbol, error = %e, "failed to fetch 24h ticker");
                None
            }
        }
    }

    /// Snapshot of price + 24h statistics for every tracked symbol.
    pub async fn snapshot(&self) -> MarketSnapshot {
        let mut symbols = Vec::with_capacity(self.symbols.len());
        let mut gainers = 0;
        let mut losers = 0;

        for symbol in &self.symbols {
            let Some(t) = self.ticker_24h(symbol).await else {
                continue;
            };
            if t.price_change_pct > Decimal::ZERO {
                gainers += 1;
            } else {
                losers += 1;
            }
            symbols.push(SymbolSnapshot {
                symbol: t.symbol,
                price: t.last_price,
                change_pct_24h: t.price_change_pct,
                high_24h: t.high_24h,
                low_24h: t.low_24h,
                quote_volume_24h: t.quote_volume,
            });
        }

        MarketSnapshot {
            taken_at: Utc::now(),
            symbols,
            gainers,
            losers,
        }
    }

    // -------------------------------------------------------------------------
    // Klines (uncached)
    // -------------------------------------------------------------------------

    /// Close series for indicator computation (oldest first).
    pub async fn closes(&self, symbol: &str, interval: &str, limit: u32) -> Vec<f64> {
        match self.client.get_klines(symbol, interval, limit).await {
            Ok(klines) => klines.iter().map(|k| k.close).collect(),
            Err(e) => {
                warn!(symbol, interval, error = %e, "failed to fetch klines");
                Vec::new()
            }
        }
    }
}

/// Merge a market snapshot with per-symbol indicators into the context rows
/// handed to decision providers. Symbols without indicators get neutral
/// sentinels.
pub fn build_context(
    snapshot: &MarketSnapshot,
    indicators: &HashMap<String, IndicatorSet>,
) -> Vec<SymbolContext> {
    snapshot
        .symbols
        .iter()
        .map(|s| {
            let ind = indicators.get(&s.symbol).copied().unwrap_or_default();
            SymbolContext {
                symbol: s.symbol.clone(),
                price: s.price,
                change_pct_24h: s.change_pct_24h,
                high_24h: s.high_24h,
                low_24h: s.low_24h,
                quote_volume_24h: s.quote_volume_24h,
                rsi_14: ind.rsi_14,
                macd: ind.macd,
                macd_signal: ind.macd_signal,
            }
        })
        .collect()
}

impl std::fmt::Debug for MarketDataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataService")
            .field("symbols", &self.symbols)
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

    fn ticker(symbol: &str, change: Decimal) -> Ticker24h {
        Ticker24h {
            symbol: symbol.to_string(),
            last_price: dec!(100),
            price_change_pct: change,
            high_24h: dec!(110),
            low_24h: dec!(90),
            quote_volume: dec!(1000000),
        }
    }

    #[test]
    fn cache_returns_fresh_entries() {
        let cache = ShardedCache::new(Duration::from_secs(60));
        cache.put("price:ETHUSDT", CachedValue::Price(dec!(2500)));
        match cache.get("price:ETHUSDT") {
            Some(CachedValue::Price(p)) => assert_eq!(p, dec!(2500)),
            _ => panic!("expected cached price"),
        }
    }

    #[test]
    fn cache_expires_entries() {
        let cache = ShardedCache::new(Duration::from_millis(0));
        cache.put("price:ETHUSDT", CachedValue::Price(dec!(2500)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("price:ETHUSDT").is_none());
    }

    #[test]
    fn cache_clear_drops_everything() {
        let cache = ShardedCache::new(Duration::from_secs(60));
        cache.put("a", CachedValue::Price(dec!(1)));
        cache.put("b", CachedValue::Ticker(ticker("ETHUSDT", dec!(1))));
        cache.clear();
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn cache_keys_are_isolated() {
        let cache = ShardedCache::new(Duration::from_secs(60));
        cache.put("price:ETHUSDT", CachedValue::Price(dec!(2500)));
        assert!(cache.get("price:BNBUSDT").is_none());
        assert!(cache.get("ticker24h:ETHUSDT").is_none());
    }

    #[test]
    fn context_merges_indicators() {
        let snapshot = MarketSnapshot {
            taken_at: Utc::now(),
            symbols: vec![
                SymbolSnapshot {
                    symbol: "ETHUSDT".to_string(),
                    price: dec!(2500),
                    change_pct_24h: dec!(1.2),
                    high_24h: dec!(2550),
                    low_24h: dec!(2400),
                    quote_volume_24h: dec!(5000000),
                },
                SymbolSnapshot {
                    symbol: "BNBUSDT".to_string(),
                    price: dec!(610),
                    change_pct_24h: dec!(-0.5),
                    high_24h: dec!(620),
                    low_24h: dec!(600),
                    quote_volume_24h: dec!(2000000),
                },
            ],
            gainers: 1,
            losers: 1,
        };

        let mut indicators = HashMap::new();
        indicators.insert(
            "ETHUSDT".to_string(),
            IndicatorSet {
                rsi_14: 63.2,
                macd: 1.5,
                macd_signal: 1.1,
                macd_histogram: 0.4,
                sma_20: 2480.0,
                sma_50: 2450.0,
            },
        );

        let ctx = build_context(&snapshot, &indicators);
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx[0].symbol, "ETHUSDT");
        assert!((ctx[0].rsi_14 - 63.2).abs() < 1e-12);
        // Missing indicators fall back to the neutral sentinel.
        assert_eq!(ctx[1].symbol, "BNBUSDT");
        assert!((ctx[1].rsi_14 - 50.0).abs() < 1e-12);
        assert_eq!(ctx[1].macd, 0.0);
    }
}
