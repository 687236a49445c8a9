// =============================================================================
// Shared types used across the TSL Sentinel engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of the managed trade.
///
/// `Ce`/`Pe` are option legs (both long premium); `Buy`/`Sell` are the plain
/// equivalents. The direction decides which side the exit order takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeDirection {
    Ce,
    Pe,
    Buy,
    Sell,
}

impl TradeDirection {
    /// Order side that closes a position opened in this direction.
    pub fn exit_side(&self) -> OrderSide {
        match self {
            Self::Ce | Self::Buy => OrderSide::Sell,
            Self::Pe | Self::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ce => write!(f, "CE"),
            Self::Pe => write!(f, "PE"),
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Side of an order sent to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Active trailing regime.
///
/// MICRO is the initial stair-step regime; ATR is terminal for the session
/// (no return path). Spike detection is a cross-cutting predicate evaluated
/// in either phase, not a resting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Micro,
    Atr,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Micro => write!(f, "MICRO"),
            Self::Atr => write!(f, "ATR"),
        }
    }
}

/// Why a management session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Price fell through the software trailing stop.
    TslHit,
    /// Abnormal price acceleration detected; best-price exit.
    SpikeExit(Phase),
    /// Maximum hold time exceeded.
    TimeExit,
    /// Loss from entry breached the emergency threshold.
    Emergency,
    /// Profit target reached.
    ProfitTarget,
    /// Host requested the session to stop.
    ManualExit,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TslHit => write!(f, "TSL_HIT"),
            Self::SpikeExit(Phase::Micro) => write!(f, "SPIKE_EXIT_MICRO"),
            Self::SpikeExit(Phase::Atr) => write!(f, "SPIKE_EXIT_ATR"),
            Self::TimeExit => write!(f, "TIME_EXIT"),
            Self::Emergency => write!(f, "EMERGENCY"),
            Self::ProfitTarget => write!(f, "PROFIT_TARGET"),
            Self::ManualExit => write!(f, "MANUAL_EXIT"),
        }
    }
}
