// =============================================================================
// Average True Range — last-price simplification
// =============================================================================
//
// Only a last-traded-price feed is available, not OHLC bars, so the true
// range of a pair collapses to |price[i] - price[i-1]| and the ATR is the
// plain mean over the last `period` consecutive pairs. This is a deliberate
// simplification of Wilder's ATR; do not swap in the classic high-low-close
// formula without an OHLC feed, as it changes trailing distances materially.
// =============================================================================

/// Compute the ATR over the last `period` consecutive price pairs.
///
/// # Arguments
/// - `prices` — price samples, oldest first.
/// - `period` — number of pairs averaged.
///
/// # Returns
/// `None` when:
/// - `period` is zero.
/// - There are fewer than `period + 1` prices (each pair needs a predecessor).
/// - Any intermediate value is non-finite.
pub fn calculate_atr(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let tail = &prices[prices.len() - (period + 1)..];

    let mut sum = 0.0;
    for pair in tail.windows(2) {
        let tr = (pair[1] - pair[0]).abs();
        if !tr.is_finite() {
            return None;
        }
        sum += tr;
    }

    let atr = sum / period as f64;
    atr.is_finite().then_some(atr)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atr_period_zero() {
        let prices = vec![100.0; 20];
        assert!(calculate_atr(&prices, 0).is_none());
    }

    #[test]
    fn atr_insufficient_data() {
        // Need period + 1 = 15 prices for period=14, only have 10.
        let prices = vec![100.0; 10];
        assert!(calculate_atr(&prices, 14).is_none());
    }

    #[test]
    fn atr_exact_minimum_data() {
        let prices = vec![100.0, 101.0, 99.5, 100.5];
        let atr = calculate_atr(&prices, 3).unwrap();
        // Pairs: 1.0, 1.5, 1.0 -> mean 3.5/3.
        assert!((atr - 3.5 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn atr_uses_only_last_period_pairs() {
        // Early huge move must be outside the 3-pair lookback.
        let prices = vec![100.0, 150.0, 100.0, 100.5, 101.0, 100.5];
        let atr = calculate_atr(&prices, 3).unwrap();
        assert!((atr - 0.5).abs() < 1e-9, "expected 0.5, got {atr}");
    }

    #[test]
    fn atr_constant_prices_is_zero() {
        let prices = vec![100.0; 20];
        let atr = calculate_atr(&prices, 14).unwrap();
        assert!(atr.abs() < f64::EPSILON);
    }

    #[test]
    fn atr_increasing_volatility() {
        let mut prices = vec![100.0];
        for i in 1..20 {
            let step = if i % 2 == 0 { 2.0 } else { -2.0 };
            prices.push(prices[i - 1] + step);
        }
        let atr = calculate_atr(&prices, 5).unwrap();
        assert!((atr - 2.0).abs() < 1e-9);
    }

    #[test]
    fn atr_nan_returns_none() {
        let prices = vec![100.0, f64::NAN, 100.0, 101.0];
        assert!(calculate_atr(&prices, 3).is_none());
    }
}
