// =============================================================================
// Position — the single trade under management
// =============================================================================
//
// Owned exclusively by the engine's poll loop for the lifetime of a session.
// Created when the upstream entry flow confirms a fill; marked inactive the
// moment an exit order is confirmed filled or the host stops the engine.
//
// Invariants once management starts:
//   - `tsl` never decreases (the stop only moves in the trader's favour).
//   - `highest_price` never decreases.
//   - `current_price` reflects the last successfully polled price.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Phase, TradeDirection};

/// A single tracked position with phase-wise TSL state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    pub qty: f64,
    pub entry_price: f64,
    pub direction: TradeDirection,
    pub entry_time: DateTime<Utc>,

    /// Last successfully polled price.
    #[serde(default)]
    pub current_price: f64,
    /// Highest price seen since entry.
    #[serde(default)]
    pub highest_price: f64,
    /// Software trailing stop level.
    #[serde(default)]
    pub tsl: f64,
    /// Active trailing regime.
    pub phase: Phase,
    /// Integer profit rung reached under MICRO trailing (0..=phase1_max_trail).
    #[serde(default)]
    pub trail_level: u32,
    pub is_active: bool,

    /// Best unrealised profit seen, in currency units.
    #[serde(default)]
    pub max_profit: f64,
    /// Worst giveback from the highest price, in currency units.
    #[serde(default)]
    pub max_drawdown: f64,
}

impl Position {
    /// Create a position at its confirmed entry fill. The trailing stop
    /// starts at the entry price and only moves up from there.
    pub fn new(symbol: impl Into<String>, qty: f64, entry_price: f64, direction: TradeDirection) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            qty,
            entry_price,
            direction,
            entry_time: Utc::now(),
            current_price: entry_price,
            highest_price: entry_price,
            tsl: entry_price,
            phase: Phase::Micro,
            trail_level: 0,
            is_active: true,
            max_profit: 0.0,
            max_drawdown: 0.0,
        }
    }

    /// Record a freshly polled price, tracking the running high, the best
    /// profit, and the worst giveback from the high.
    pub fn update_price(&mut self, new_price: f64) {
        self.current_price = new_price;

        if new_price > self.highest_price {
            self.highest_price = new_price;
        }

        let profit = (new_price - self.entry_price) * self.qty;
        if profit > self.max_profit {
            self.max_profit = profit;
        }

        let giveback = (self.highest_price - new_price) * self.qty;
        if giveback > self.max_drawdown {
            self.max_drawdown = giveback;
        }
    }

    /// Current P&L against `price`, absolute and as a percentage of entry.
    pub fn profit_loss(&self, price: f64) -> (f64, f64) {
        if self.entry_price <= 0.0 {
            return (0.0, 0.0);
        }
        let absolute = (price - self.entry_price) * self.qty;
        let percent = (price - self.entry_price) / self.entry_price * 100.0;
        (absolute, percent)
    }

    /// Raise the trailing stop. Ignored if `candidate` would lower it.
    pub fn raise_tsl(&mut self, candidate: f64) -> bool {
        if candidate > self.tsl {
            self.tsl = candidate;
            true
        } else {
            false
        }
    }
}
