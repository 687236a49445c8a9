// =============================================================================
// Management Configuration — per-session tunables with atomic save
// =============================================================================
//
// Every threshold of the phase-wise trailing policy lives here so that a
// session can be tuned without recompiling. The config is immutable once a
// management session starts.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_phase1_max_trail() -> u32 {
    5
}

fn default_phase1_trail_step() -> f64 {
    1.0
}

fn default_phase2_spike_window() -> f64 {
    2.0
}

fn default_phase2_spike_multiplier() -> f64 {
    3.0
}

fn default_phase2_min_spike_points() -> usize {
    3
}

fn default_phase3_atr_period() -> usize {
    14
}

fn default_phase3_atr_multiplier() -> f64 {
    1.0
}

fn default_phase3_min_price_points() -> usize {
    15
}

fn default_phase1_to_phase3_threshold() -> f64 {
    0.01
}

fn default_min_phase1_duration() -> f64 {
    10.0
}

fn default_emergency_exit_threshold() -> f64 {
    5.0
}

fn default_min_profit_to_trail() -> f64 {
    0.5
}

fn default_max_hold_time() -> f64 {
    3600.0
}

fn default_profit_target() -> f64 {
    2.0
}

fn default_poll_interval_secs() -> f64 {
    1.0
}

// =============================================================================
// TslConfig
// =============================================================================

/// Tunable parameters for one phase-wise TSL management session.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TslConfig {
    // --- Phase 1: micro stair-step trailing ----------------------------------
    /// Ceiling rung of the +1/+2/../+N stair-step. Above it the stop locks.
    #[serde(default = "default_phase1_max_trail")]
    pub phase1_max_trail: u32,

    /// Size of one profit rung in currency units.
    #[serde(default = "default_phase1_trail_step")]
    pub phase1_trail_step: f64,

    // --- Phase 2: spike detection --------------------------------------------
    /// Lookback window for spike detection, in seconds.
    #[serde(default = "default_phase2_spike_window")]
    pub phase2_spike_window: f64,

    /// The newest tick change must exceed this multiple of the rolling
    /// average change to count as a spike.
    #[serde(default = "default_phase2_spike_multiplier")]
    pub phase2_spike_multiplier: f64,

    /// Minimum samples inside the window before spikes are evaluated.
    #[serde(default = "default_phase2_min_spike_points")]
    pub phase2_min_spike_points: usize,

    // --- Phase 3: ATR trailing -----------------------------------------------
    /// Number of consecutive sample pairs averaged into the ATR.
    #[serde(default = "default_phase3_atr_period")]
    pub phase3_atr_period: usize,

    /// Trailing distance in ATR multiples.
    #[serde(default = "default_phase3_atr_multiplier")]
    pub phase3_atr_multiplier: f64,

    /// Minimum recorded samples before the ATR is computed at all.
    #[serde(default = "default_phase3_min_price_points")]
    pub phase3_min_price_points: usize,

    // --- Phase switch gate ---------------------------------------------------
    /// Quiet-range gate: the last 8 MICRO samples must span less than
    /// `entry_price * phase1_to_phase3_threshold` to switch to ATR.
    #[serde(default = "default_phase1_to_phase3_threshold")]
    pub phase1_to_phase3_threshold: f64,

    /// Minimum seconds spent in MICRO before the switch is considered.
    #[serde(default = "default_min_phase1_duration")]
    pub min_phase1_duration: f64,

    // --- Safety / exit gates -------------------------------------------------
    /// Loss from entry, in percent, that forces an EMERGENCY exit.
    #[serde(default = "default_emergency_exit_threshold")]
    pub emergency_exit_threshold: f64,

    /// Minimum profit in currency units before any MICRO trailing starts.
    #[serde(default = "default_min_profit_to_trail")]
    pub min_profit_to_trail: f64,

    /// Maximum seconds a position may be held before a TIME_EXIT.
    #[serde(default = "default_max_hold_time")]
    pub max_hold_time: f64,

    /// Gain from entry, in percent, that exits with PROFIT_TARGET.
    #[serde(default = "default_profit_target")]
    pub profit_target: f64,

    // --- Engine --------------------------------------------------------------
    /// Seconds between poll-loop ticks.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,

    /// Fractional offset below entry for the broker-side protective stop.
    /// The stop is really enforced by the software trail; this order is a
    /// safety net, so ~0 is fine.
    #[serde(default)]
    pub protective_stop_epsilon: f64,
}

impl Default for TslConfig {
    fn default() -> Self {
        Self {
            phase1_max_trail: default_phase1_max_trail(),
            phase1_trail_step: default_phase1_trail_step(),
            phase2_spike_window: default_phase2_spike_window(),
            phase2_spike_multiplier: default_phase2_spike_multiplier(),
            phase2_min_spike_points: default_phase2_min_spike_points(),
            phase3_atr_period: default_phase3_atr_period(),
            phase3_atr_multiplier: default_phase3_atr_multiplier(),
            phase3_min_price_points: default_phase3_min_price_points(),
            phase1_to_phase3_threshold: default_phase1_to_phase3_threshold(),
            min_phase1_duration: default_min_phase1_duration(),
            emergency_exit_threshold: default_emergency_exit_threshold(),
            min_profit_to_trail: default_min_profit_to_trail(),
            max_hold_time: default_max_hold_time(),
            profit_target: default_profit_target(),
            poll_interval_secs: default_poll_interval_secs(),
            protective_stop_epsilon: 0.0,
        }
    }
}

impl TslConfig {
    /// Check every threshold before a session starts.
    ///
    /// `start()` calls this before any order is placed so that a bad config
    /// can never drive a live position.
    pub fn validate(&self) -> Result<(), String> {
        if self.phase1_max_trail == 0 {
            return Err("phase1_max_trail must be >= 1".into());
        }
        if self.phase1_trail_step <= 0.0 {
            return Err("phase1_trail_step must be positive".into());
        }
        if self.phase2_spike_window <= 0.0 {
            return Err("phase2_spike_window must be positive".into());
        }
        if self.phase2_spike_multiplier <= 1.0 {
            return Err("phase2_spike_multiplier must be > 1.0".into());
        }
        if self.phase2_min_spike_points < 2 {
            return Err("phase2_min_spike_points must be >= 2".into());
        }
        if self.phase3_atr_period == 0 {
            return Err("phase3_atr_period must be >= 1".into());
        }
        if self.phase3_atr_multiplier <= 0.0 {
            return Err("phase3_atr_multiplier must be positive".into());
        }
        if self.phase3_min_price_points < self.phase3_atr_period + 1 {
            return Err(format!(
                "phase3_min_price_points must be >= phase3_atr_period + 1 ({})",
                self.phase3_atr_period + 1
            ));
        }
        if self.phase1_to_phase3_threshold <= 0.0 {
            return Err("phase1_to_phase3_threshold must be positive".into());
        }
        if self.min_phase1_duration < 0.0 {
            return Err("min_phase1_duration must not be negative".into());
        }
        if self.emergency_exit_threshold <= 0.0 {
            return Err("emergency_exit_threshold must be positive".into());
        }
        if self.min_profit_to_trail < 0.0 {
            return Err("min_profit_to_trail must not be negative".into());
        }
        if self.max_hold_time <= 0.0 {
            return Err("max_hold_time must be positive".into());
        }
        if self.profit_target <= 0.0 {
            return Err("profit_target must be positive".into());
        }
        if self.poll_interval_secs <= 0.0 {
            return Err("poll_interval_secs must be positive".into());
        }
        if !(0.0..1.0).contains(&self.protective_stop_epsilon) {
            return Err("protective_stop_epsilon must be in [0, 1)".into());
        }
        Ok(())
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read TSL config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse TSL config from {}", path.display()))?;

        info!(
            path = %path.display(),
            phase1_max_trail = config.phase1_max_trail,
            atr_period = config.phase3_atr_period,
            "TSL config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    ///
    /// This prevents corruption if the process crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise TSL config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "TSL config saved (atomic)");
        Ok(())
    }
}
