// =============================================================================
// EMA and MACD
// =============================================================================
//
// EMA is seeded with the SMA of the first `period` closes, then updated with
//   ema = (price - ema) * k + ema,   k = 2 / (period + 1)
//
// MACD line = EMA(fast) - EMA(slow); signal = EMA(signal) of the MACD line;
// histogram = line - signal.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Latest EMA value for `closes` (oldest first).
///
/// With fewer than `period` closes the plain average of what is available is
/// returned; an empty series yields 0.0 with a logged warning.
pub fn ema(closes: &[f64], period: usize) -> f64 {
    if closes.is_empty() || period == 0 {
        warn!(period, "insufficient data for EMA — returning 0");
        return 0.0;
    }
    *ema_series(closes, period).last().unwrap_or(&0.0)
}

/// Full EMA series aligned to `closes` (index i holds the EMA through close i).
/// The first `period - 1` entries repeat the running average seed.
fn ema_series(closes: &[f64], period: usize) -> Vec<f64> {
    if closes.is_empty() || period == 0 {
        return Vec::new();
    }
    if closes.len() < period {
        let avg = closes.iter().sum::<f64>() / closes.len() as f64;
        return vec![avg; closes.len()];
    }

    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(closes.len());

    // Running average until the seed is complete.
    let mut sum = 0.0;
    for (i, &c) in closes[..period].iter().enumerate() {
        sum += c;
        out.push(sum / (i + 1) as f64);
    }

    let mut value = sum / period as f64;
    out[period - 1] = value;

    for &c in &closes[period..] {
        value = (c - value) * k + value;
        out.push(value);
    }

    out
}

/// MACD result bundle.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute MACD for `closes` (oldest first).
///
/// Fewer than `slow + signal` closes yields the zero sentinel with a logged
/// warning.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Macd {
    if closes.len() < slow + signal {
        warn!(
            have = closes.len(),
            need = slow + signal,
            "insufficient data for MACD — returning zeros"
        );
        return Macd::default();
    }

    let fast_series = ema_series(closes, fast);
    let slow_series = ema_series(closes, slow);

    // MACD line is meaningful once the slow EMA seed is complete.
    let line: Vec<f64> = fast_series
        .iter()
        .zip(slow_series.iter())
        .skip(slow - 1)
        .map(|(f, s)| f - s)
        .collect();

    let signal_series = ema_series(&line, signal);
    let macd_value = *line.last().unwrap_or(&0.0);
    let signal_value = *signal_series.last().unwrap_or(&0.0);

    Macd {
        macd: macd_value,
        signal: signal_value,
        histogram: macd_value - signal_value,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_empty_is_zero() {
        assert_eq!(ema(&[], 9), 0.0);
    }

    #[test]
    fn ema_short_series_falls_back_to_mean() {
        assert!((ema(&[1.0, 2.0, 3.0], 9) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn ema_constant_series_is_constant() {
        let closes = vec![42.0; 50];
        assert!((ema(&closes, 9) - 42.0).abs() < 1e-12);
    }

    #[test]
    fn ema_tracks_rising_prices_from_below() {
        let closes: Vec<f64> = (1..=50).map(|x| x as f64).collect();
        let v = ema(&closes, 9);
        // EMA lags a rising series but must sit close beneath the last price.
        assert!(v < 50.0);
        assert!(v > 44.0);
    }

    #[test]
    fn macd_insufficient_data_is_zero() {
        let closes = vec![100.0; 20];
        let m = macd(&closes, 12, 26, 9);
        assert_eq!(m.macd, 0.0);
        assert_eq!(m.signal, 0.0);
        assert_eq!(m.histogram, 0.0);
    }

    #[test]
    fn macd_constant_series_is_zero() {
        let closes = vec![100.0; 60];
        let m = macd(&closes, 12, 26, 9);
        assert!(m.macd.abs() < 1e-9);
        assert!(m.signal.abs() < 1e-9);
    }

    #[test]
    fn macd_positive_in_uptrend() {
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + i as f64).collect();
        let m = macd(&closes, 12, 26, 9);
        // Fast EMA above slow EMA in a steady uptrend.
        assert!(m.macd > 0.0);
    }

    #[test]
    fn macd_histogram_is_line_minus_signal() {
        let closes: Vec<f64> = (0..80)
            .map(|i| 100.0 + (i as f64 * 0.2).sin() * 10.0)
            .collect();
        let m = macd(&closes, 12, 26, 9);
        assert!((m.histogram - (m.macd - m.signal)).abs() < 1e-12);
    }
}
