// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// Step 1 — Compute price changes (deltas) from consecutive closes.
// Step 2 — Seed average gain / average loss with the SMA of the first `period`
//          gains / losses.
// Step 3 — Apply Wilder's exponential smoothing:
//            avg_gain = (prev_avg_gain * (period - 1) + current_gain) / period
//            avg_loss = (prev_avg_loss * (period - 1) + current_loss) / period
// Step 4 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)
//
// Thresholds:  RSI > 70 => OVERBOUGHT,  RSI < 30 => OVERSOLD.
// =============================================================================

use tracing::warn;

/// Neutral sentinel returned when the series is too short to compute RSI.
pub const RSI_NEUTRAL: f64 = 50.0;

/// Compute the latest RSI value for `closes` (oldest first).
///
/// # Edge cases
/// - `period == 0` or fewer than `period + 1` closes => `RSI_NEUTRAL` (50.0)
///   with a logged warning.
/// - No down moves at all => 100.0; no up moves at all => 0.0; a completely
///   flat series => 50.0.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        warn!(
            have = closes.len(),
            need = period + 1,
            "insufficient data for RSI — returning neutral 50"
        );
        return RSI_NEUTRAL;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    // Seed with the SMA of the first `period` deltas.
    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    // Wilder's smoothing over the remainder of the series.
    for &delta in &deltas[period..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    let value = if avg_loss == 0.0 && avg_gain == 0.0 {
        RSI_NEUTRAL
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    if value.is_finite() {
        value
    } else {
        warn!("non-finite RSI — returning neutral 50");
        RSI_NEUTRAL
    }
}

/// Human-readable label for an RSI value.
pub fn rsi_label(value: f64) -> &'static str {
    if value >= 70.0 {
        "OVERBOUGHT"
    } else if value <= 30.0 {
        "OVERSOLD"
    } else {
        "NEUTRAL"
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_neutral() {
        assert_eq!(rsi(&[], 14), 50.0);
    }

    #[test]
    fn period_zero_is_neutral() {
        assert_eq!(rsi(&[1.0, 2.0, 3.0], 0), 50.0);
    }

    #[test]
    fn insufficient_data_is_neutral() {
        // Need period + 1 closes; 14 closes give only 13 deltas.
        let closes: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert_eq!(rsi(&closes, 14), 50.0);
    }

    #[test]
    fn all_gains_saturates_at_100() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        assert!((rsi(&closes, 14) - 100.0).abs() < 1e-10);
    }

    #[test]
    fn all_losses_saturates_at_0() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        assert!(rsi(&closes, 14).abs() < 1e-10);
    }

    #[test]
    fn flat_market_is_neutral() {
        let closes = vec![100.0; 30];
        assert!((rsi(&closes, 14) - 50.0).abs() < 1e-10);
    }

    #[test]
    fn mixed_series_stays_in_range() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        let v = rsi(&closes, 14);
        assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
    }

    #[test]
    fn labels() {
        assert_eq!(rsi_label(75.0), "OVERBOUGHT");
        assert_eq!(rsi_label(25.0), "OVERSOLD");
        assert_eq!(rsi_label(50.0), "NEUTRAL");
    }
}
