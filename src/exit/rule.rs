// =============================================================================
// Exit Rule: per-position exit state machine data
// =============================================================================
//
// One rule per tracked position. Economics are fixed at creation:
//
//   risk_distance    = |entry - initial_stop|
//   potential_reward = |initial_target - entry|
//
// State flags only ever go false -> true:
//
//   breakeven_triggered, partial_triggered, trailing_active,
//   hybrid_widen_active
//
// The serde layout of this struct is the persisted schema. Required fields
// have no default; everything else falls back to its initial value.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime_config::RuleThresholds;
use crate::types::{AdvisorySnapshot, Direction, Position, PositionId};

/// Most recent actions retained per rule.
pub const MAX_ACTION_LOG: usize = 50;

/// Trailing aggressiveness tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrailingTier {
    #[default]
    Normal,
    Widened,
}

impl std::fmt::Display for TrailingTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Widened => write!(f, "WIDENED"),
        }
    }
}

/// Who created the rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOrigin {
    /// Created by this engine on first observation of the position.
    #[default]
    Engine,
    /// Registered through the control API by another party.
    External,
}

/// Kind of transition recorded in the action log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    ReversalExit,
    BreakEven,
    PartialClose,
    TrailingUpdate,
    HybridWiden,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReversalExit => write!(f, "REVERSAL_EXIT"),
            Self::BreakEven => write!(f, "BREAK_EVEN"),
            Self::PartialClose => write!(f, "PARTIAL_CLOSE"),
            Self::TrailingUpdate => write!(f, "TRAILING_UPDATE"),
            Self::HybridWiden => write!(f, "HYBRID_WIDEN"),
        }
    }
}

/// One applied transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub kind: ActionKind,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub old_stop: Option<f64>,
    #[serde(default)]
    pub new_stop: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub reason: String,
}

fn default_breakeven_threshold_pct() -> f64 {
    RuleThresholds::default().breakeven_threshold_pct
}

fn default_partial_threshold_pct() -> f64 {
    RuleThresholds::default().partial_threshold_pct
}

fn default_partial_close_fraction() -> f64 {
    RuleThresholds::default().partial_close_fraction
}

fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Exit management state for a single position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRule {
    // ── Identity ────────────────────────────────────────────────────────
    pub position_id: PositionId,
    pub symbol: String,
    pub direction: Direction,

    // ── Economics ───────────────────────────────────────────────────────
    pub entry_price: f64,
    pub initial_stop: f64,
    pub initial_target: f64,
    /// Filled from the economics when absent in a persisted record.
    #[serde(default)]
    pub risk_distance: f64,
    #[serde(default)]
    pub potential_reward: f64,

    // ── Thresholds ──────────────────────────────────────────────────────
    #[serde(default = "default_breakeven_threshold_pct")]
    pub breakeven_threshold_pct: f64,
    #[serde(default = "default_partial_threshold_pct")]
    pub partial_threshold_pct: f64,
    #[serde(default = "default_partial_close_fraction")]
    pub partial_close_fraction: f64,

    // ── Flags (monotonic) ───────────────────────────────────────────────
    #[serde(default)]
    pub breakeven_triggered: bool,
    #[serde(default)]
    pub partial_triggered: bool,
    #[serde(default)]
    pub trailing_active: bool,
    #[serde(default)]
    pub hybrid_widen_active: bool,

    // ── Trailing ────────────────────────────────────────────────────────
    #[serde(default)]
    pub trailing_multiplier: TrailingTier,
    #[serde(default)]
    pub last_trailing_stop: Option<f64>,

    // ── Bookkeeping ─────────────────────────────────────────────────────
    #[serde(default)]
    pub last_action_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub advisory_snapshot: Option<AdvisorySnapshot>,
    #[serde(default)]
    pub action_log: Vec<ActionRecord>,
    #[serde(default)]
    pub origin: RuleOrigin,
    #[serde(default = "now_utc")]
    pub created_at: DateTime<Utc>,
}

impl ExitRule {
    /// Build a rule from raw economics. Derived distances are computed here
    /// and never again.
    pub fn new(
        position_id: PositionId,
        symbol: impl Into<String>,
        direction: Direction,
        entry_price: f64,
        initial_stop: f64,
        initial_target: f64,
        thresholds: RuleThresholds,
        origin: RuleOrigin,
    ) -> Self {
        Self {
            position_id,
            symbol: symbol.into(),
            direction,
            entry_price,
            initial_stop,
            initial_target,
            risk_distance: (entry_price - initial_stop).abs(),
            potential_reward: if initial_target > 0.0 {
                (initial_target - entry_price).abs()
            } else {
                0.0
            },
            breakeven_threshold_pct: thresholds.breakeven_threshold_pct,
            partial_threshold_pct: thresholds.partial_threshold_pct,
            partial_close_fraction: thresholds.partial_close_fraction,
            breakeven_triggered: false,
            partial_triggered: false,
            trailing_active: false,
            hybrid_widen_active: false,
            trailing_multiplier: TrailingTier::Normal,
            last_trailing_stop: None,
            last_action_at: None,
            advisory_snapshot: None,
            action_log: Vec::new(),
            origin,
            created_at: Utc::now(),
        }
    }

    /// Build a rule for a position first observed at the broker.
    ///
    /// Risk is taken from the live stop, so a position without one, or whose
    /// stop already sits at or past entry, cannot be adopted: its original
    /// risk is no longer recoverable.
    pub fn from_position(position: &Position, thresholds: RuleThresholds) -> Result<Self, String> {
        let stop = position.stop().ok_or_else(|| "no stop loss".to_string())?;
        Self::new(
            position.position_id,
            position.symbol.clone(),
            position.direction,
            position.entry_price,
            stop,
            position.take_profit,
            thresholds,
            RuleOrigin::Engine,
        )
        .validated()
    }

    /// Validate a decoded record and fill derived fields missing from older
    /// files. Returns a human-readable reason on failure.
    pub fn validated(mut self) -> Result<Self, String> {
        if self.symbol.trim().is_empty() {
            return Err("empty symbol".into());
        }
        for (name, v) in [
            ("entry_price", self.entry_price),
            ("initial_stop", self.initial_stop),
            ("initial_target", self.initial_target),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(format!("{name} is not a finite non-negative number"));
            }
        }
        if self.entry_price <= 0.0 {
            return Err("entry_price must be positive".into());
        }
        if self.initial_stop <= 0.0
            || (self.entry_price - self.initial_stop).abs() <= f64::EPSILON
        {
            return Err("initial_stop must define a non-zero risk".into());
        }
        if !self.direction.more_protective(self.entry_price, self.initial_stop) {
            return Err(format!(
                "initial_stop {} is on the wrong side of entry {} for a {} position",
                self.initial_stop, self.entry_price, self.direction
            ));
        }
        if !(0.0..=1.0).contains(&self.partial_close_fraction) {
            return Err("partial_close_fraction outside [0, 1]".into());
        }

        if self.risk_distance <= 0.0 {
            self.risk_distance = (self.entry_price - self.initial_stop).abs();
        }
        if self.potential_reward <= 0.0 && self.initial_target > 0.0 {
            self.potential_reward = (self.initial_target - self.entry_price).abs();
        }
        Ok(self)
    }

    // -------------------------------------------------------------------------
    // Progress measures
    // -------------------------------------------------------------------------

    /// Favourable excursion of `price` from entry, in price units.
    pub fn favourable_move(&self, price: f64) -> f64 {
        self.direction.sign() * (price - self.entry_price)
    }

    /// Profit as a multiple of the initial risk.
    pub fn risk_multiple(&self, price: f64) -> f64 {
        if self.risk_distance > 0.0 {
            self.favourable_move(price) / self.risk_distance
        } else {
            0.0
        }
    }

    /// Profit as a fraction of the potential reward (0 without a target).
    pub fn profit_fraction(&self, price: f64) -> f64 {
        if self.potential_reward > 0.0 {
            self.favourable_move(price) / self.potential_reward
        } else {
            0.0
        }
    }

    /// The best stop this engine has committed or observed so far.
    pub fn reference_stop(&self, broker_stop: Option<f64>) -> Option<f64> {
        match (broker_stop, self.last_trailing_stop) {
            (Some(a), Some(b)) => Some(if self.direction.more_protective(a, b) { a } else { b }),
            (a, b) => a.or(b),
        }
    }

    /// Append to the action log, keeping only the most recent entries.
    pub fn record_action(&mut self, record: ActionRecord) {
        self.last_action_at = Some(record.at);
        self.action_log.push(record);
        if self.action_log.len() > MAX_ACTION_LOG {
            let excess = self.action_log.len() - MAX_ACTION_LOG;
            self.action_log.drain(..excess);
        }
    }

    pub fn has_action(&self, kind: ActionKind) -> bool {
        self.action_log.iter().any(|a| a.kind == kind)
    }
}

/// Break-even stop: entry shifted past the spread plus a small epsilon, in
/// the position's favour. The single source of the break-even level.
pub fn breakeven_stop(
    direction: Direction,
    entry_price: f64,
    spread: f64,
    epsilon_pct: f64,
) -> f64 {
    let half_spread = spread.max(0.0) / 2.0;
    let epsilon = entry_price * epsilon_pct.max(0.0) / 100.0;
    entry_price + direction.sign() * (half_spread + epsilon)
}

/// Floor `volume` to a multiple of `step`.
pub fn floor_to_step(volume: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return volume;
    }
    // Nudge before flooring so 0.3 / 0.1 does not land on 2.9999.
    ((volume / step) + 1e-9).floor() * step
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_rule() -> ExitRule {
        ExitRule::new(
            1,
            "XAUUSD",
            Direction::Long,
            100.0,
            99.0,
            102.0,
            RuleThresholds::default(),
            RuleOrigin::Engine,
        )
    }

    #[test]
    fn derived_distances_computed_at_creation() {
        let rule = long_rule();
        assert!((rule.risk_distance - 1.0).abs() < 1e-12);
        assert!((rule.potential_reward - 2.0).abs() < 1e-12);
    }

    #[test]
    fn r_multiple_and_profit_fraction() {
        let rule = long_rule();
        assert!((rule.risk_multiple(100.25) - 0.25).abs() < 1e-9);
        assert!((rule.profit_fraction(101.0) - 0.5).abs() < 1e-9);
        assert!(rule.risk_multiple(99.5) < 0.0);

        let short = ExitRule::new(
            2,
            "XAUUSD",
            Direction::Short,
            100.0,
            101.0,
            98.0,
            RuleThresholds::default(),
            RuleOrigin::Engine,
        );
        assert!((short.risk_multiple(99.5) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn breakeven_stop_sits_past_entry() {
        let long = breakeven_stop(Direction::Long, 100.0, 0.02, 0.01);
        assert!((long - 100.02).abs() < 1e-9);
        let short = breakeven_stop(Direction::Short, 100.0, 0.02, 0.01);
        assert!((short - 99.98).abs() < 1e-9);
    }

    #[test]
    fn position_without_stop_gets_no_rule() {
        let pos = Position {
            position_id: 3,
            symbol: "EURUSD".into(),
            direction: Direction::Long,
            entry_price: 1.1,
            volume: 1.0,
            stop_loss: 0.0,
            take_profit: 1.2,
            current_price: 1.1,
        };
        assert!(ExitRule::from_position(&pos, RuleThresholds::default()).is_err());
    }

    #[test]
    fn position_with_stop_past_entry_is_not_adopted() {
        let mut pos = Position {
            position_id: 4,
            symbol: "XAUUSD".into(),
            direction: Direction::Long,
            entry_price: 100.0,
            volume: 1.0,
            stop_loss: 100.01,
            take_profit: 103.0,
            current_price: 101.0,
        };
        assert!(ExitRule::from_position(&pos, RuleThresholds::default()).is_err());

        pos.direction = Direction::Short;
        pos.stop_loss = 99.99;
        pos.take_profit = 97.0;
        assert!(ExitRule::from_position(&pos, RuleThresholds::default()).is_err());

        pos.stop_loss = 101.0;
        let rule = ExitRule::from_position(&pos, RuleThresholds::default()).unwrap();
        assert!((rule.risk_distance - 1.0).abs() < 1e-12);
        assert_eq!(rule.origin, RuleOrigin::Engine);
    }

    #[test]
    fn validation_rejects_stop_on_wrong_side() {
        let mut long = long_rule();
        long.initial_stop = 101.0;
        assert!(long.validated().is_err());

        let short = ExitRule::new(
            5,
            "XAUUSD",
            Direction::Short,
            100.0,
            99.0,
            97.0,
            RuleThresholds::default(),
            RuleOrigin::External,
        );
        assert!(short.validated().is_err());
    }

    #[test]
    fn validation_rejects_zero_risk() {
        let mut rule = long_rule();
        rule.initial_stop = rule.entry_price;
        assert!(rule.validated().is_err());
    }

    #[test]
    fn validation_fills_missing_derived_fields() {
        let mut rule = long_rule();
        rule.risk_distance = 0.0;
        rule.potential_reward = 0.0;
        let rule = rule.validated().unwrap();
        assert!((rule.risk_distance - 1.0).abs() < 1e-12);
        assert!((rule.potential_reward - 2.0).abs() < 1e-12);
    }

    #[test]
    fn action_log_is_bounded() {
        let mut rule = long_rule();
        for i in 0..(MAX_ACTION_LOG + 5) {
            rule.record_action(ActionRecord {
                kind: ActionKind::TrailingUpdate,
                at: Utc::now(),
                old_stop: None,
                new_stop: Some(i as f64),
                volume: None,
                reason: String::new(),
            });
        }
        assert_eq!(rule.action_log.len(), MAX_ACTION_LOG);
        assert_eq!(rule.action_log[0].new_stop, Some(5.0));
    }

    #[test]
    fn floor_to_step_handles_float_noise() {
        assert!((floor_to_step(0.3, 0.1) - 0.3).abs() < 1e-9);
        assert!((floor_to_step(0.37, 0.1) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn reference_stop_picks_most_protective() {
        let mut rule = long_rule();
        rule.last_trailing_stop = Some(100.5);
        assert_eq!(rule.reference_stop(Some(100.2)), Some(100.5));
        assert_eq!(rule.reference_stop(None), Some(100.5));
    }
}
