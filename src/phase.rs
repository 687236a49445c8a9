// =============================================================================
// Phase Tracker — MICRO stair-step and ATR trailing, with the switch gate
// =============================================================================
//
// State machine for the trailing regime of one position:
//
//   MICRO (initial) ──quiet range + min duration──▶ ATR (terminal)
//
// MICRO ratchets the stop one rung behind each whole point of profit, capped
// at `phase1_max_trail`. ATR trails at a volatility-sized distance below the
// current price. Both rules only ever raise the stop. Spike detection is not
// a state here; the engine evaluates it as a cross-cutting predicate.
// =============================================================================

use tracing::{debug, info, warn};

use crate::atr::calculate_atr;
use crate::config::TslConfig;
use crate::history::PriceHistory;
use crate::position::Position;
use crate::types::Phase;

/// Number of recent MICRO samples whose range must be quiet before the
/// switch to ATR trailing.
const QUIET_RANGE_SAMPLES: usize = 8;

/// Per-session trailing regime state.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: Phase,
    /// Session-relative time the current phase began, in seconds.
    phase_started_at: f64,
    /// Computed lazily on first need after entering the ATR phase.
    atr: Option<f64>,
}

impl PhaseTracker {
    pub fn new(now: f64) -> Self {
        Self {
            phase: Phase::Micro,
            phase_started_at: now,
            atr: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn atr(&self) -> Option<f64> {
        self.atr
    }

    /// Recompute the trailing stop for the current tick. Applies the active
    /// phase's rule to `position.tsl` (only ever raising it) and requests the
    /// MICRO → ATR transition when the gate conditions hold.
    pub fn recompute(
        &mut self,
        position: &mut Position,
        history: &PriceHistory,
        config: &TslConfig,
        now: f64,
    ) {
        match self.phase {
            Phase::Micro => {
                self.apply_micro_trailing(position, config);

                if self.should_switch_to_atr(position, history, config, now) {
                    self.phase = Phase::Atr;
                    self.phase_started_at = now;
                    position.phase = Phase::Atr;
                    info!(
                        id = %position.id,
                        tsl = format!("{:.2}", position.tsl),
                        "switching to ATR trailing"
                    );
                }
            }
            Phase::Atr => self.apply_atr_trailing(position, history, config),
        }
    }

    // -------------------------------------------------------------------------
    // MICRO: +1/+2/../+N stair-step
    // -------------------------------------------------------------------------
    //
    // Entry 100, step 1: price 101 -> stop 100, 102 -> 101, ... 105 -> 104.
    // Past the ceiling the stop locks one rung under the ceiling.
    fn apply_micro_trailing(&mut self, position: &mut Position, config: &TslConfig) {
        let profit = position.current_price - position.entry_price;

        if profit < config.min_profit_to_trail {
            return;
        }

        let step = config.phase1_trail_step;
        let points_up = (profit / step).floor() as i64;
        let max_trail = config.phase1_max_trail as i64;

        if points_up < 1 {
            return;
        }

        if points_up <= max_trail {
            let candidate = position.entry_price + (points_up - 1) as f64 * step;
            if position.raise_tsl(candidate) {
                position.trail_level = points_up as u32;
                info!(
                    id = %position.id,
                    price = format!("{:.2}", position.current_price),
                    rung = points_up,
                    tsl = format!("{:.2}", candidate),
                    "MICRO trail raised"
                );
            }
        } else {
            let locked = position.entry_price + (max_trail - 1) as f64 * step;
            if position.raise_tsl(locked) {
                position.trail_level = config.phase1_max_trail;
                info!(
                    id = %position.id,
                    tsl = format!("{:.2}", locked),
                    "MICRO ceiling reached — trail locked"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // MICRO -> ATR gate
    // -------------------------------------------------------------------------
    //
    // All three must hold: minimum time in MICRO, enough MICRO samples, and a
    // quiet range across the most recent MICRO samples (price has stopped
    // making whole-point rungs, so rung trailing has nothing left to do).
    fn should_switch_to_atr(
        &self,
        position: &Position,
        history: &PriceHistory,
        config: &TslConfig,
        now: f64,
    ) -> bool {
        if now - self.phase_started_at < config.min_phase1_duration {
            return false;
        }

        let recent = history.last_n_in_phase(Phase::Micro, QUIET_RANGE_SAMPLES);
        if recent.len() < QUIET_RANGE_SAMPLES {
            return false;
        }

        let high = recent.iter().cloned().fold(f64::MIN, f64::max);
        let low = recent.iter().cloned().fold(f64::MAX, f64::min);
        let range = high - low;
        let threshold = position.entry_price * config.phase1_to_phase3_threshold;

        debug!(
            range = format!("{:.2}", range),
            threshold = format!("{:.2}", threshold),
            "quiet-range check"
        );

        range < threshold
    }

    // -------------------------------------------------------------------------
    // ATR trailing
    // -------------------------------------------------------------------------
    //
    // The ATR is computed once, lazily, on the first tick in this phase that
    // has enough history; until then the MICRO-derived stop stands.
    fn apply_atr_trailing(
        &mut self,
        position: &mut Position,
        history: &PriceHistory,
        config: &TslConfig,
    ) {
        if self.atr.is_none() {
            if history.len() < config.phase3_min_price_points {
                warn!(
                    have = history.len(),
                    need = config.phase3_min_price_points,
                    "not enough samples for ATR yet"
                );
                return;
            }
            let prices = history.last_n(config.phase3_atr_period + 1);
            match calculate_atr(&prices, config.phase3_atr_period) {
                Some(atr) => {
                    self.atr = Some(atr);
                    info!(
                        atr = format!("{:.2}", atr),
                        period = config.phase3_atr_period,
                        "ATR computed"
                    );
                }
                None => return,
            }
        }

        let atr = match self.atr {
            Some(v) if v > 0.0 => v,
            _ => return,
        };

        let candidate = position.current_price - atr * config.phase3_atr_multiplier;
        if position.raise_tsl(candidate) {
            info!(
                id = %position.id,
                price = format!("{:.2}", position.current_price),
                atr = format!("{:.2}", atr),
                tsl = format!("{:.2}", candidate),
                "ATR trail raised"
            );
        }
    }
}
