// =============================================================================
// Indicator Circuit Breaker: failure isolation around derived indicators
// =============================================================================
//
// Per symbol:   consecutive failure count, open/closed, opened_at
// Per (symbol, kind): last successful value (fallback)
//
//   closed ── N consecutive failures ──▶ open
//   open   ── cooldown elapsed ───────▶ one trial call
//                 success ──▶ closed, count reset
//                 failure ──▶ open, cooldown restarted
//
// Provider errors, timeouts and non-finite values all count as failures.
// The lock is never held across the provider call.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::providers::MarketDataProvider;
use crate::runtime_config::BreakerConfig;
use crate::types::IndicatorKind;

/// Where a reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReadingSource {
    Live,
    Fallback,
    Unavailable,
}

/// Result of a breaker-protected indicator read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value: f64,
    /// `false` means no usable value exists; callers must not rely on it.
    pub ok: bool,
    pub source: ReadingSource,
}

impl Reading {
    fn live(value: f64) -> Self {
        Self { value, ok: true, source: ReadingSource::Live }
    }

    fn from_fallback(fallback: Option<f64>) -> Self {
        match fallback {
            Some(value) => Self { value, ok: true, source: ReadingSource::Fallback },
            None => Self { value: 0.0, ok: false, source: ReadingSource::Unavailable },
        }
    }

    /// The value, if one is usable.
    pub fn value(&self) -> Option<f64> {
        self.ok.then_some(self.value)
    }
}

#[derive(Debug, Default)]
struct SymbolBreaker {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    fallbacks: HashMap<IndicatorKind, f64>,
}

/// Per-symbol view for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub symbol: String,
    pub consecutive_failures: u32,
    pub open: bool,
    pub retry_in_secs: u64,
    pub cached_kinds: Vec<IndicatorKind>,
}

pub struct IndicatorBreaker {
    provider: Arc<dyn MarketDataProvider>,
    config: BreakerConfig,
    call_timeout: Duration,
    symbols: Mutex<HashMap<String, SymbolBreaker>>,
}

impl IndicatorBreaker {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        config: BreakerConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            config,
            call_timeout,
            symbols: Mutex::new(HashMap::new()),
        }
    }

    /// Read `kind` for `symbol` through the breaker.
    pub async fn get(&self, symbol: &str, kind: IndicatorKind) -> Reading {
        let cooldown = self.config.cooldown();

        // ── 1. Decide whether the provider may be called ────────────────
        {
            let mut map = self.symbols.lock();
            let entry = map.entry(symbol.to_string()).or_default();
            if let Some(opened_at) = entry.opened_at {
                if opened_at.elapsed() < cooldown {
                    debug!(symbol, %kind, "breaker open, serving fallback");
                    return Reading::from_fallback(entry.fallbacks.get(&kind).copied());
                }
                debug!(symbol, %kind, "breaker cooldown elapsed, trial call");
            }
        }

        // ── 2. Call the provider without holding the lock ───────────────
        let result =
            tokio::time::timeout(self.call_timeout, self.provider.derived_indicator(symbol, kind))
                .await;

        let outcome = match result {
            Ok(Ok(v)) if v.is_finite() => Ok(v),
            Ok(Ok(v)) => Err(format!("non-finite value {v}")),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err(format!("timed out after {:?}", self.call_timeout)),
        };

        // ── 3. Commit the outcome ───────────────────────────────────────
        let mut map = self.symbols.lock();
        let entry = map.entry(symbol.to_string()).or_default();

        match outcome {
            Ok(value) => {
                if entry.opened_at.is_some() || entry.consecutive_failures > 0 {
                    info!(
                        symbol,
                        %kind,
                        previous_failures = entry.consecutive_failures,
                        "indicator breaker reset"
                    );
                }
                entry.consecutive_failures = 0;
                entry.opened_at = None;
                entry.fallbacks.insert(kind, value);
                Reading::live(value)
            }
            Err(reason) => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                let was_open = entry.opened_at.is_some();
                if was_open || entry.consecutive_failures >= self.config.failure_threshold {
                    entry.opened_at = Some(Instant::now());
                    warn!(
                        symbol,
                        %kind,
                        failures = entry.consecutive_failures,
                        cooldown_secs = cooldown.as_secs(),
                        reason = %reason,
                        reopened = was_open,
                        "indicator breaker OPEN"
                    );
                } else {
                    debug!(
                        symbol,
                        %kind,
                        failures = entry.consecutive_failures,
                        reason = %reason,
                        "indicator fetch failed"
                    );
                }
                Reading::from_fallback(entry.fallbacks.get(&kind).copied())
            }
        }
    }

    /// Current failure count for `symbol`.
    pub fn failure_count(&self, symbol: &str) -> u32 {
        self.symbols
            .lock()
            .get(symbol)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }

    /// Returns `true` while `symbol` is inside its cooldown window.
    pub fn is_open(&self, symbol: &str) -> bool {
        let cooldown = self.config.cooldown();
        self.symbols
            .lock()
            .get(symbol)
            .and_then(|s| s.opened_at)
            .is_some_and(|at| at.elapsed() < cooldown)
    }

    /// Per-symbol state, sorted by symbol.
    pub fn snapshot(&self) -> Vec<BreakerStatus> {
        let cooldown = self.config.cooldown();
        let map = self.symbols.lock();
        let mut out: Vec<BreakerStatus> = map
            .iter()
            .map(|(symbol, s)| {
                let remaining = s
                    .opened_at
                    .map(|at| cooldown.saturating_sub(at.elapsed()))
                    .unwrap_or_default();
                let mut cached_kinds: Vec<IndicatorKind> = s.fallbacks.keys().copied().collect();
                cached_kinds.sort_by_key(|k| k.to_string());
                BreakerStatus {
                    symbol: symbol.clone(),
                    consecutive_failures: s.consecutive_failures,
                    open: !remaining.is_zero(),
                    retry_in_secs: remaining.as_secs(),
                    cached_kinds,
                }
            })
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }
}

impl std::fmt::Debug for IndicatorBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicatorBreaker")
            .field("config", &self.config)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}
