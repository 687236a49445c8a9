// =============================================================================
// Spike Detector — short-window price-acceleration check
// =============================================================================
//
// A sudden move far beyond recent tick-to-tick volatility signals a spike
// that should be captured immediately rather than waited out by a slower
// trailing rule. The detector is stateless: it looks only at the samples
// recorded within the spike window and compares the newest tick's change
// against the rolling average of the changes before it.
//
// Evaluated every tick regardless of phase; a hit short-circuits both MICRO
// and ATR trailing and forces a best-price exit.
// =============================================================================

use tracing::debug;

use crate::config::TslConfig;
use crate::history::PriceHistory;

/// Outcome of one spike evaluation, kept for logging and the status surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpikeCheck {
    pub is_spike: bool,
    /// Absolute change of the newest sample pair.
    pub last_change: f64,
    /// Average absolute change of the preceding pairs in the window.
    pub avg_change: f64,
}

impl SpikeCheck {
    fn quiet() -> Self {
        Self {
            is_spike: false,
            last_change: 0.0,
            avg_change: 0.0,
        }
    }
}

/// Evaluate the spike predicate over the samples recorded within the last
/// `phase2_spike_window` seconds of `now`.
///
/// Requires at least `phase2_min_spike_points` samples in the window; flags a
/// spike when the newest pair's change exceeds `avg_change *
/// phase2_spike_multiplier` with a strictly positive average (a flat window
/// followed by any move is not a spike — there is no baseline volatility to
/// compare against).
pub fn detect_spike(history: &PriceHistory, config: &TslConfig, now: f64) -> SpikeCheck {
    let recent = history.within_window(now, config.phase2_spike_window);

    if recent.len() < config.phase2_min_spike_points {
        return SpikeCheck::quiet();
    }

    let changes: Vec<f64> = recent.windows(2).map(|p| (p[1] - p[0]).abs()).collect();

    // Newest pair is the candidate; everything before it is the baseline.
    let (last_change, baseline) = match changes.split_last() {
        Some((last, rest)) if !rest.is_empty() => (*last, rest),
        _ => return SpikeCheck::quiet(),
    };

    let avg_change = baseline.iter().sum::<f64>() / baseline.len() as f64;
    let is_spike = avg_change > 0.0 && last_change > avg_change * config.phase2_spike_multiplier;

    if is_spike {
        debug!(
            last_change = format!("{:.2}", last_change),
            avg_change = format!("{:.2}", avg_change),
            window_samples = recent.len(),
            "spike check positive"
        );
    }

    SpikeCheck {
        is_spike,
        last_change,
        avg_change,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Phase;

    fn history_from(prices: &[f64]) -> PriceHistory {
        let mut h = PriceHistory::default();
        for (i, p) in prices.iter().enumerate() {
            h.record(*p, i as f64 * 0.5, Phase::Micro);
        }
        h
    }

    fn wide_window_config() -> TslConfig {
        TslConfig {
            phase2_spike_window: 100.0,
            ..TslConfig::default()
        }
    }

    #[test]
    fn outlier_after_small_deltas_is_spike() {
        // Deltas: 0.1, 0.1, 0.1 then 0.5 — 5x the baseline average.
        let h = history_from(&[100.0, 100.1, 100.2, 100.3, 100.8]);
        let check = detect_spike(&h, &wide_window_config(), 2.0);
        assert!(check.is_spike);
        assert!((check.last_change - 0.5).abs() < 1e-9);
        assert!((check.avg_change - 0.1).abs() < 1e-9);
    }

    #[test]
    fn same_history_without_outlier_is_quiet() {
        let h = history_from(&[100.0, 100.1, 100.2, 100.3, 100.4]);
        let check = detect_spike(&h, &wide_window_config(), 2.0);
        assert!(!check.is_spike);
    }

    #[test]
    fn downward_outlier_is_spike() {
        let h = history_from(&[100.0, 100.1, 100.0, 100.1, 99.5]);
        let check = detect_spike(&h, &wide_window_config(), 2.0);
        assert!(check.is_spike);
    }

    #[test]
    fn too_few_samples_in_window_is_quiet() {
        let h = history_from(&[100.0, 103.0]);
        let check = detect_spike(&h, &wide_window_config(), 0.5);
        assert!(!check.is_spike);
    }

    #[test]
    fn flat_baseline_never_spikes() {
        // avg_change == 0 -> any move divides by no baseline; must stay quiet.
        let h = history_from(&[100.0, 100.0, 100.0, 100.0, 102.0]);
        let check = detect_spike(&h, &wide_window_config(), 2.0);
        assert!(!check.is_spike);
        assert!(check.avg_change.abs() < f64::EPSILON);
    }

    #[test]
    fn stale_samples_fall_out_of_window() {
        let mut h = PriceHistory::default();
        // Old volatile stretch, then a quiet recent window.
        h.record(100.0, 0.0, Phase::Micro);
        h.record(105.0, 1.0, Phase::Micro);
        h.record(100.0, 2.0, Phase::Micro);
        h.record(100.1, 60.0, Phase::Micro);
        h.record(100.2, 61.0, Phase::Micro);
        let cfg = TslConfig {
            phase2_spike_window: 2.0,
            ..TslConfig::default()
        };
        // Only the two recent samples are inside the window; below min points.
        let check = detect_spike(&h, &cfg, 61.0);
        assert!(!check.is_spike);
    }
}
