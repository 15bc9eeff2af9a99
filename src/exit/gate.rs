// =============================================================================
// Gate Evaluator: admissibility and trailing tier
// =============================================================================
//
// Two layers:
//
//   Critical gate (decides admit):
//       breakeven_triggered OR partial_triggered OR R >= critical_r_threshold
//
//   Advisory gates (only select the tier, never block):
//       volatility squeeze
//       multi-timeframe alignment below minimum
//       |stretch score| beyond threshold
//       proximity to a high-volume node below threshold
//
//   failing advisory gates < widen_failure_count  → Normal
//   failing advisory gates >= widen_failure_count → Widened
//
// A missing advisory signal counts as a pass. The evaluator is pure.
// =============================================================================

use serde::Serialize;

use crate::exit::rule::{ExitRule, TrailingTier};
use crate::runtime_config::GateConfig;
use crate::types::{AdvisorySnapshot, VolatilityState};

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateDecision {
    pub admit: bool,
    pub tier: TrailingTier,
    /// Human-readable reasons, one per gate that influenced the result.
    pub reasons: Vec<String>,
}

impl GateDecision {
    pub fn failing_advisories(&self) -> usize {
        self.reasons.iter().filter(|r| r.starts_with("advisory:")).count()
    }
}

/// Evaluate the critical and advisory gates for `rule`.
pub fn evaluate(
    rule: &ExitRule,
    profit_fraction: f64,
    risk_multiple: f64,
    snapshot: Option<&AdvisorySnapshot>,
    config: &GateConfig,
) -> GateDecision {
    let mut reasons = Vec::new();

    // ── Critical gate ───────────────────────────────────────────────────
    let admit = if rule.breakeven_triggered {
        reasons.push("critical: breakeven already triggered".to_string());
        true
    } else if rule.partial_triggered {
        reasons.push("critical: partial already taken".to_string());
        true
    } else if risk_multiple >= config.critical_r_threshold {
        reasons.push(format!(
            "critical: R {:.3} >= {:.3}",
            risk_multiple, config.critical_r_threshold
        ));
        true
    } else {
        reasons.push(format!(
            "critical: R {:.3} < {:.3} (profit {:.1}%)",
            risk_multiple,
            config.critical_r_threshold,
            profit_fraction * 100.0
        ));
        false
    };

    // ── Advisory gates ──────────────────────────────────────────────────
    let mut failures = 0usize;
    if let Some(snap) = snapshot {
        if snap.volatility_state == Some(VolatilityState::Squeeze) {
            failures += 1;
            reasons.push("advisory: volatility squeeze".to_string());
        }
        if let Some(count) = snap.mtf_alignment_count {
            if count < config.mtf_min_alignment {
                failures += 1;
                reasons.push(format!(
                    "advisory: mtf alignment {count} < {}",
                    config.mtf_min_alignment
                ));
            }
        }
        if let Some(stretch) = snap.stretch_score.filter(|s| s.is_finite()) {
            if stretch.abs() > config.stretch_threshold {
                failures += 1;
                reasons.push(format!(
                    "advisory: stretch {stretch:.2} beyond {:.2}",
                    config.stretch_threshold
                ));
            }
        }
        if let Some(prox) = snap.hvn_proximity.filter(|p| p.is_finite()) {
            if prox < config.hvn_proximity_threshold {
                failures += 1;
                reasons.push(format!(
                    "advisory: hvn proximity {prox:.3} < {:.3}",
                    config.hvn_proximity_threshold
                ));
            }
        }
    }

    let tier = if rule.hybrid_widen_active {
        reasons.push("tier: hybrid widening active".to_string());
        TrailingTier::Widened
    } else if failures >= config.widen_failure_count {
        TrailingTier::Widened
    } else {
        TrailingTier::Normal
    };

    GateDecision { admit, tier, reasons }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::rule::RuleOrigin;
    use crate::runtime_config::RuleThresholds;
    use crate::types::Direction;
    use chrono::Utc;

    fn rule() -> ExitRule {
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

    fn hostile_snapshot() -> AdvisorySnapshot {
        AdvisorySnapshot {
            volatility_state: Some(VolatilityState::Squeeze),
            mtf_alignment_count: Some(0),
            stretch_score: Some(3.5),
            hvn_proximity: Some(0.05),
            fetched_at: Some(Utc::now()),
        }
    }

    #[test]
    fn critical_gate_uses_r_threshold() {
        let cfg = GateConfig::default();
        assert!(!evaluate(&rule(), 0.05, 0.1, None, &cfg).admit);
        assert!(evaluate(&rule(), 0.12, 0.25, None, &cfg).admit);
    }

    #[test]
    fn triggered_flags_keep_gate_open() {
        let cfg = GateConfig::default();
        let mut r = rule();
        r.breakeven_triggered = true;
        assert!(evaluate(&r, -0.1, -0.2, None, &cfg).admit);

        let mut r = rule();
        r.partial_triggered = true;
        assert!(evaluate(&r, 0.0, 0.0, None, &cfg).admit);
    }

    #[test]
    fn advisory_failures_never_block_admit() {
        let cfg = GateConfig::default();
        let snap = hostile_snapshot();
        let d = evaluate(&rule(), 0.2, 0.4, Some(&snap), &cfg);
        assert!(d.admit);
        assert_eq!(d.tier, TrailingTier::Widened);
        assert_eq!(d.failing_advisories(), 4);
    }

    #[test]
    fn two_failures_stay_normal() {
        let cfg = GateConfig::default();
        let snap = AdvisorySnapshot {
            volatility_state: Some(VolatilityState::Squeeze),
            mtf_alignment_count: Some(1),
            stretch_score: None,
            hvn_proximity: None,
            fetched_at: Some(Utc::now()),
        };
        let d = evaluate(&rule(), 0.2, 0.4, Some(&snap), &cfg);
        assert_eq!(d.failing_advisories(), 2);
        assert_eq!(d.tier, TrailingTier::Normal);
    }

    #[test]
    fn missing_snapshot_is_most_permissive() {
        let d = evaluate(&rule(), 0.2, 0.4, None, &GateConfig::default());
        assert_eq!(d.tier, TrailingTier::Normal);
        assert_eq!(d.failing_advisories(), 0);
    }

    #[test]
    fn hybrid_widening_forces_widened_tier() {
        let mut r = rule();
        r.hybrid_widen_active = true;
        let d = evaluate(&r, 0.2, 0.4, None, &GateConfig::default());
        assert_eq!(d.tier, TrailingTier::Widened);
    }
}
