// =============================================================================
// Simple Moving Average
// =============================================================================

use tracing::warn;

/// Mean of the last `period` closes (oldest first input).
///
/// Fewer than `period` closes yields 0.0 with a logged warning; callers treat
/// zero as "not available".
pub fn sma(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period {
        warn!(
            have = closes.len(),
            need = period,
            "insufficient data for SMA — returning 0"
        );
        return 0.0;
    }

    let window = &closes[closes.len() - period..];
    window.iter().sum::<f64>() / period as f64
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data_is_zero() {
        assert_eq!(sma(&[1.0, 2.0], 20), 0.0);
        assert_eq!(sma(&[], 20), 0.0);
        assert_eq!(sma(&[1.0], 0), 0.0);
    }

    #[test]
    fn exact_window_mean() {
        assert!((sma(&[1.0, 2.0, 3.0, 4.0], 4) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn uses_only_the_trailing_window() {
        // Early values must not influence the result.
        let mut closes = vec![1000.0; 10];
        closes.extend([1.0, 2.0, 3.0]);
        assert!((sma(&closes, 3) - 2.0).abs() < 1e-12);
    }
}
