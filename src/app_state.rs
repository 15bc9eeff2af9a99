// =============================================================================
// Central Application State: exit steward
// =============================================================================
//
// Ties together the pieces the control API needs: the rule store, the
// decision journal, the indicator breaker and the monitor control handle.
// Every subsystem manages its own interior mutability; EngineState only
// holds Arc references plus a version counter bumped on API mutations.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::exit::circuit_breaker::IndicatorBreaker;
use crate::exit::journal::DecisionJournal;
use crate::exit::monitor::{CycleReport, ExitMonitor, MonitorControl};
use crate::exit::store::RuleStore;
use crate::providers::paper::PaperBroker;
use crate::runtime_config::EngineConfig;
use crate::types::MonitorMode;

/// Shared state handed to every API handler via `Arc<EngineState>`.
pub struct EngineState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Incremented on every mutation made through the API.
    pub state_version: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub config: EngineConfig,
    /// Expected Bearer token. `None` rejects every authenticated request.
    pub admin_token: Option<String>,

    // ── Exit engine ─────────────────────────────────────────────────────
    pub store: Arc<RuleStore>,
    pub journal: Arc<DecisionJournal>,
    pub breaker: Arc<IndicatorBreaker>,
    pub control: Arc<MonitorControl>,

    // ── Demo mode ───────────────────────────────────────────────────────
    /// Present when the engine runs against the in-memory paper broker.
    pub paper: Option<Arc<PaperBroker>>,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: std::time::Instant,
}

/// Compact status for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub engine_id: String,
    pub mode: MonitorMode,
    pub running: bool,
    pub rules: usize,
    pub cycles: u64,
    pub last_cycle: Option<CycleReport>,
    pub state_version: u64,
    pub uptime_secs: u64,
    pub paper: bool,
}

impl EngineState {
    pub fn new(
        config: EngineConfig,
        monitor: &ExitMonitor,
        journal: Arc<DecisionJournal>,
        paper: Option<Arc<PaperBroker>>,
        admin_token: Option<String>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(0),
            config,
            admin_token: admin_token.filter(|t| !t.is_empty()),
            store: monitor.store(),
            journal,
            breaker: monitor.breaker(),
            control: monitor.control(),
            paper,
            start_time: std::time::Instant::now(),
        }
    }

    /// Atomically increment the state version and return the new value.
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn build_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            engine_id: self.config.engine_id.clone(),
            mode: self.control.mode(),
            running: self.control.is_running(),
            rules: self.store.len(),
            cycles: self.control.cycles(),
            last_cycle: self.control.last_report(),
            state_version: self.current_state_version(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            paper: self.paper.is_some(),
        }
    }
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("engine_id", &self.config.engine_id)
            .field("rules", &self.store.len())
            .field("mode", &self.control.mode())
            .finish()
    }
}
