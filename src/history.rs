// =============================================================================
// Price History Buffer — bounded, time-ordered samples for one position
// =============================================================================
//
// One sample is appended per successful poll tick, tagged with the phase that
// was active when it was captured. The buffer feeds three consumers:
//
//   - spike detection      ("all samples within the last N seconds")
//   - ATR calculation      ("last K samples")
//   - the phase-switch gate ("last K samples captured in MICRO")
//
// Oldest samples are evicted once the capacity bound is reached. The bound is
// a performance cap, not a correctness requirement; the engine sizes it to at
// least the largest lookback in play.
// =============================================================================

use std::collections::VecDeque;

use crate::types::Phase;

/// Default buffer capacity, matching the reference cap of 100 points.
pub const DEFAULT_CAPACITY: usize = 100;

/// One polled price sample.
#[derive(Debug, Clone, Copy)]
pub struct PricePoint {
    pub price: f64,
    /// Seconds since the start of the management session.
    pub at: f64,
    /// Phase that was active when the sample was captured.
    pub phase: Phase,
}

/// Bounded, append-only price record with oldest-first eviction.
#[derive(Debug)]
pub struct PriceHistory {
    points: VecDeque<PricePoint>,
    capacity: usize,
}

impl PriceHistory {
    /// Create a buffer holding at most `capacity` samples.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append a sample, evicting the oldest one past capacity.
    pub fn record(&mut self, price: f64, at: f64, phase: Phase) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(PricePoint { price, at, phase });
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The most recently recorded sample.
    pub fn last(&self) -> Option<&PricePoint> {
        self.points.back()
    }

    /// Prices recorded within the last `window` seconds of `now`, oldest
    /// first. Scans backwards from the tail; samples are time-ordered so the
    /// scan stops at the first one outside the window.
    pub fn within_window(&self, now: f64, window: f64) -> Vec<f64> {
        let mut prices: Vec<f64> = self
            .points
            .iter()
            .rev()
            .take_while(|p| now - p.at <= window)
            .map(|p| p.price)
            .collect();
        prices.reverse();
        prices
    }

    /// The last `n` prices, oldest first. Returns fewer when the buffer holds
    /// fewer.
    pub fn last_n(&self, n: usize) -> Vec<f64> {
        let skip = self.points.len().saturating_sub(n);
        self.points.iter().skip(skip).map(|p| p.price).collect()
    }

    /// The last `n` prices captured while `phase` was active, oldest first.
    pub fn last_n_in_phase(&self, phase: Phase, n: usize) -> Vec<f64> {
        let mut prices: Vec<f64> = self
            .points
            .iter()
            .rev()
            .filter(|p| p.phase == phase)
            .take(n)
            .map(|p| p.price)
            .collect();
        prices.reverse();
        prices
    }
}

impl Default for PriceHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: usize) -> PriceHistory {
        let mut h = PriceHistory::default();
        for i in 0..n {
            h.record(100.0 + i as f64, i as f64, Phase::Micro);
        }
        h
    }

    #[test]
    fn record_and_last() {
        let h = filled(3);
        assert_eq!(h.len(), 3);
        let last = h.last().unwrap();
        assert!((last.price - 102.0).abs() < f64::EPSILON);
        assert!((last.at - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn eviction_keeps_newest() {
        let mut h = PriceHistory::with_capacity(5);
        for i in 0..8 {
            h.record(i as f64, i as f64, Phase::Micro);
        }
        assert_eq!(h.len(), 5);
        // Oldest surviving sample is index 3.
        assert_eq!(h.last_n(5), vec![3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn within_window_is_oldest_first() {
        let h = filled(10);
        // now = 9.0, window = 2.0 -> samples at t in {7, 8, 9}.
        let prices = h.within_window(9.0, 2.0);
        assert_eq!(prices, vec![107.0, 108.0, 109.0]);
    }

    #[test]
    fn within_window_empty_when_all_stale() {
        let h = filled(5);
        assert!(h.within_window(100.0, 2.0).is_empty());
    }

    #[test]
    fn last_n_short_buffer() {
        let h = filled(3);
        assert_eq!(h.last_n(8).len(), 3);
    }

    #[test]
    fn last_n_in_phase_filters() {
        let mut h = PriceHistory::default();
        h.record(100.0, 0.0, Phase::Micro);
        h.record(101.0, 1.0, Phase::Micro);
        h.record(102.0, 2.0, Phase::Atr);
        h.record(103.0, 3.0, Phase::Micro);
        assert_eq!(h.last_n_in_phase(Phase::Micro, 2), vec![101.0, 103.0]);
        assert_eq!(h.last_n_in_phase(Phase::Atr, 8), vec![102.0]);
    }
}
