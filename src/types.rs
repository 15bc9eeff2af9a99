// =============================================================================
// Shared types used across the exit engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Broker ticket identifying a single open position.
pub type PositionId = u64;

/// Trade direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1.0 for longs, -1.0 for shorts. Multiplying a price delta by the sign
    /// turns it into a delta "in the position's favour".
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Returns `true` if stop `a` protects the position at least as well as
    /// stop `b` (higher for longs, lower for shorts).
    pub fn at_least_as_protective(self, a: f64, b: f64) -> bool {
        match self {
            Self::Long => a >= b,
            Self::Short => a <= b,
        }
    }

    /// Returns `true` if stop `a` is strictly more protective than stop `b`.
    pub fn more_protective(self, a: f64, b: f64) -> bool {
        match self {
            Self::Long => a > b,
            Self::Short => a < b,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// An open position as reported by the market data provider or re-fetched
/// from the order gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub position_id: PositionId,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    /// Remaining open volume (reduced by partial closes).
    pub volume: f64,
    /// Current protective stop. `0.0` means no stop is attached.
    #[serde(default)]
    pub stop_loss: f64,
    /// Current take-profit. `0.0` means no target is attached.
    #[serde(default)]
    pub take_profit: f64,
    #[serde(default)]
    pub current_price: f64,
}

impl Position {
    /// The attached stop, if any.
    pub fn stop(&self) -> Option<f64> {
        (self.stop_loss > 0.0).then_some(self.stop_loss)
    }
}

/// Broker trading constraints for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    /// Current bid/ask spread in price units.
    #[serde(default)]
    pub spread: f64,
    /// Minimum distance between the current price and a stop.
    #[serde(default)]
    pub min_stop_distance: f64,
    /// Smallest stop change the broker treats as material.
    #[serde(default)]
    pub min_modify_distance: f64,
    #[serde(default = "default_volume_step")]
    pub volume_step: f64,
    #[serde(default = "default_volume_step")]
    pub min_volume: f64,
}

fn default_volume_step() -> f64 {
    0.01
}

impl Default for SymbolSpec {
    fn default() -> Self {
        Self {
            spread: 0.0,
            min_stop_distance: 0.0,
            min_modify_distance: 0.0,
            volume_step: default_volume_step(),
            min_volume: default_volume_step(),
        }
    }
}

/// One OHLC bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Derived indicators the engine reads through the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndicatorKind {
    /// Average true range in price units (trailing distance base).
    Atr,
    /// Signed structure-break signal: `>= 1` bullish break, `<= -1` bearish.
    StructureBreak,
    /// Current volatility relative to its baseline (1.0 = normal).
    VolatilityRatio,
}

impl std::fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Atr => write!(f, "ATR"),
            Self::StructureBreak => write!(f, "STRUCTURE_BREAK"),
            Self::VolatilityRatio => write!(f, "VOLATILITY_RATIO"),
        }
    }
}

/// Coarse volatility regime reported by the market-condition provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolatilityState {
    Squeeze,
    Normal,
    Expansion,
}

/// Best-effort market-condition signals. Every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvisorySnapshot {
    #[serde(default)]
    pub volatility_state: Option<VolatilityState>,
    /// Number of timeframes whose trend agrees with the position.
    #[serde(default)]
    pub mtf_alignment_count: Option<u32>,
    /// Symbol-specific stretch score (distance from mean in deviations).
    #[serde(default)]
    pub stretch_score: Option<f64>,
    /// Distance to the nearest high-volume price node, in ATR units.
    #[serde(default)]
    pub hvn_proximity: Option<f64>,
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Raw answer from an ownership registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    /// Name of the subsystem that currently owns the position, if any.
    #[serde(default)]
    pub owner: Option<String>,
    /// Whether the owner has reached an irreversible milestone (e.g. its own
    /// break-even) for this position.
    #[serde(default)]
    pub critical_state: bool,
}

/// Whether the monitor loop is acting on positions or idling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorMode {
    Active,
    Paused,
}

impl Default for MonitorMode {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for MonitorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Paused => write!(f, "Paused"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protective_ordering_follows_direction() {
        assert!(Direction::Long.more_protective(100.5, 100.0));
        assert!(!Direction::Long.more_protective(99.5, 100.0));
        assert!(Direction::Short.more_protective(99.5, 100.0));
        assert!(Direction::Short.at_least_as_protective(100.0, 100.0));
    }

    #[test]
    fn zero_stop_means_no_stop() {
        let pos = Position {
            position_id: 1,
            symbol: "EURUSD".into(),
            direction: Direction::Long,
            entry_price: 1.1,
            volume: 1.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            current_price: 1.1,
        };
        assert_eq!(pos.stop(), None);
    }
}
