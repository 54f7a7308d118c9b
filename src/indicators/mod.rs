// =============================================================================
// Technical indicators — pure functions over kline close sequences
// =============================================================================
//
// Contracts: insufficient data yields a neutral sentinel (RSI = 50, MACD = 0)
// and a logged warning rather than a failure. All statistical math is f64;
// values are rounded only when they cross into a formatted context or a
// persisted snapshot.
// =============================================================================

pub mod ema;
pub mod rsi;
pub mod sma;

use serde::{Deserialize, Serialize};

pub use ema::{ema, macd, Macd};
pub use rsi::{rsi, rsi_label};
pub use sma::sma;

/// The indicator bundle computed per symbol per cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub rsi_14: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub sma_20: f64,
    pub sma_50: f64,
}

impl IndicatorSet {
    /// Compute the standard bundle from a close series (oldest first).
    pub fn compute(closes: &[f64]) -> Self {
        let m = macd(closes, 12, 26, 9);
        Self {
            rsi_14: rsi(closes, 14),
            macd: m.macd,
            macd_signal: m.signal,
            macd_histogram: m.histogram,
            sma_20: sma(closes, 20),
            sma_50: sma(closes, 50),
        }
    }
}

impl Default for IndicatorSet {
    fn default() -> Self {
        Self {
            rsi_14: 50.0,
            macd: 0.0,
            macd_signal: 0.0,
            macd_histogram: 0.0,
            sma_20: 0.0,
            sma_50: 0.0,
        }
    }
}
