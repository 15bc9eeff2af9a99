// =============================================================================
// Engine Configuration: JSON settings with per-field defaults and atomic save
// =============================================================================
//
// Every tunable lives here. The heuristic gate thresholds (critical R,
// advisory failure count) are deliberately configuration rather than code.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_engine_id() -> String {
    "exit-steward".to_string()
}

fn default_monitor_interval_secs() -> u64 {
    30
}

fn default_external_timeout_ms() -> u64 {
    2_000
}

fn default_rules_path() -> String {
    "exit_rules.json".to_string()
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_cache_ttl_secs() -> u64 {
    30
}

fn default_critical_r_threshold() -> f64 {
    0.2
}

fn default_mtf_min_alignment() -> u32 {
    2
}

fn default_stretch_threshold() -> f64 {
    2.0
}

fn default_hvn_proximity_threshold() -> f64 {
    0.25
}

fn default_widen_failure_count() -> usize {
    3
}

fn default_breakeven_threshold_pct() -> f64 {
    30.0
}

fn default_partial_threshold_pct() -> f64 {
    50.0
}

fn default_partial_close_fraction() -> f64 {
    0.5
}

fn default_atr_mult_normal() -> f64 {
    1.5
}

fn default_atr_mult_widened() -> f64 {
    2.5
}

fn default_fallback_risk_fraction() -> f64 {
    1.0
}

fn default_min_fallback_trail_pct() -> f64 {
    0.25
}

fn default_breakeven_epsilon_pct() -> f64 {
    0.01
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_hybrid_widen_volatility_ratio() -> f64 {
    1.8
}

// =============================================================================
// Sections
// =============================================================================

/// Indicator circuit-breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open breaker serves the fallback without calling out.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Ownership arbitration tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnershipConfig {
    /// How long a last-known registry answer may stand in for a live one.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Base URL of an out-of-process ownership registry. When unset, the
    /// in-process registry is used.
    #[serde(default)]
    pub registry_url: Option<String>,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            registry_url: None,
        }
    }
}

impl OwnershipConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Critical and advisory gate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Minimum R-multiple that admits transitions before any milestone.
    #[serde(default = "default_critical_r_threshold")]
    pub critical_r_threshold: f64,

    /// Minimum number of aligned timeframes before the advisory gate fails.
    #[serde(default = "default_mtf_min_alignment")]
    pub mtf_min_alignment: u32,

    /// Absolute stretch score beyond which the advisory gate fails.
    #[serde(default = "default_stretch_threshold")]
    pub stretch_threshold: f64,

    /// Distance to a high-volume node (ATR units) below which the gate fails.
    #[serde(default = "default_hvn_proximity_threshold")]
    pub hvn_proximity_threshold: f64,

    /// Failing advisory gates needed to select the widened tier.
    #[serde(default = "default_widen_failure_count")]
    pub widen_failure_count: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            critical_r_threshold: default_critical_r_threshold(),
            mtf_min_alignment: default_mtf_min_alignment(),
            stretch_threshold: default_stretch_threshold(),
            hvn_proximity_threshold: default_hvn_proximity_threshold(),
            widen_failure_count: default_widen_failure_count(),
        }
    }
}

/// Thresholds stamped onto newly created rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RuleThresholds {
    /// Percentage of potential reward at which break-even fires.
    #[serde(default = "default_breakeven_threshold_pct")]
    pub breakeven_threshold_pct: f64,

    /// Percentage of potential reward at which the partial close fires.
    #[serde(default = "default_partial_threshold_pct")]
    pub partial_threshold_pct: f64,

    /// Fraction of remaining volume closed at the partial.
    #[serde(default = "default_partial_close_fraction")]
    pub partial_close_fraction: f64,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            breakeven_threshold_pct: default_breakeven_threshold_pct(),
            partial_threshold_pct: default_partial_threshold_pct(),
            partial_close_fraction: default_partial_close_fraction(),
        }
    }
}

/// Trailing distance and break-even buffer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingConfig {
    /// ATR multiplier in the normal tier.
    #[serde(default = "default_atr_mult_normal")]
    pub atr_mult_normal: f64,

    /// ATR multiplier in the widened tier.
    #[serde(default = "default_atr_mult_widened")]
    pub atr_mult_widened: f64,

    /// Trailing distance as a fraction of risk when ATR is unavailable.
    #[serde(default = "default_fallback_risk_fraction")]
    pub fallback_risk_fraction: f64,

    /// Floor for the fallback trailing distance, as a percentage of price.
    #[serde(default = "default_min_fallback_trail_pct")]
    pub min_fallback_trail_pct: f64,

    /// Break-even epsilon as a percentage of entry price.
    #[serde(default = "default_breakeven_epsilon_pct")]
    pub breakeven_epsilon_pct: f64,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            atr_mult_normal: default_atr_mult_normal(),
            atr_mult_widened: default_atr_mult_widened(),
            fallback_risk_fraction: default_fallback_risk_fraction(),
            min_fallback_trail_pct: default_min_fallback_trail_pct(),
            breakeven_epsilon_pct: default_breakeven_epsilon_pct(),
        }
    }
}

/// Submission retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay; doubles on every further attempt.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the exit engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Name this engine registers under in the ownership registry.
    #[serde(default = "default_engine_id")]
    pub engine_id: String,

    /// Cadence of the monitor loop.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    /// Upper bound on every external call (provider, gateway, registry).
    #[serde(default = "default_external_timeout_ms")]
    pub external_timeout_ms: u64,

    /// Where the rule set is persisted.
    #[serde(default = "default_rules_path")]
    pub rules_path: String,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub ownership: OwnershipConfig,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub thresholds: RuleThresholds,

    #[serde(default)]
    pub trailing: TrailingConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Close positions on a confirmed structure break against them.
    #[serde(default = "default_true")]
    pub enable_reversal_exit: bool,

    /// Widen trailing permanently when volatility spikes.
    #[serde(default = "default_true")]
    pub enable_hybrid_widening: bool,

    /// Volatility ratio above which hybrid widening engages.
    #[serde(default = "default_hybrid_widen_volatility_ratio")]
    pub hybrid_widen_volatility_ratio: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_id: default_engine_id(),
            monitor_interval_secs: default_monitor_interval_secs(),
            external_timeout_ms: default_external_timeout_ms(),
            rules_path: default_rules_path(),
            breaker: BreakerConfig::default(),
            ownership: OwnershipConfig::default(),
            gate: GateConfig::default(),
            thresholds: RuleThresholds::default(),
            trailing: TrailingConfig::default(),
            retry: RetryConfig::default(),
            enable_reversal_exit: true,
            enable_hybrid_widening: true,
            hybrid_widen_volatility_ratio: default_hybrid_widen_volatility_ratio(),
        }
    }
}

impl EngineConfig {
    pub fn external_timeout(&self) -> Duration {
        Duration::from_millis(self.external_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            engine_id = %config.engine_id,
            interval_secs = config.monitor_interval_secs,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}
