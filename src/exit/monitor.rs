// =============================================================================
// Exit Monitor Loop: periodic rule evaluation and broker mutation
// =============================================================================
//
// Runs as a background Tokio task, waking every `monitor_interval_secs` to:
//   1. List open positions and synchronise rules (create for new positions,
//      drop rules whose position is gone; only when the listing succeeded).
//   2. Snapshot the tracked keys, release the store, and evaluate each rule:
//        ownership → gate → reversal → break-even → partial → trailing
//        → hybrid widening
//      At most one broker mutation per position per cycle.
//   3. Save the rule set if anything changed.
//
// A failing rule is logged and the cycle moves on. The store lock is only
// taken to read a rule or commit its result, never across an await.
//
//   let monitor = Arc::new(ExitMonitor::new(config, store, deps));
//   tokio::spawn(Arc::clone(&monitor).run());
//
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::ExecError;
use crate::exit::circuit_breaker::{IndicatorBreaker, ReadingSource};
use crate::exit::executor::{ActionExecutor, ApplyOutcome, Mutation};
use crate::exit::gate::{self, GateDecision};
use crate::exit::journal::{DecisionKind, DecisionRecord, DecisionSink};
use crate::exit::ownership::OwnershipArbiter;
use crate::exit::rule::{
    breakeven_stop, floor_to_step, ActionKind, ActionRecord, ExitRule, TrailingTier,
};
use crate::exit::store::RuleStore;
use crate::providers::{
    MarketConditionProvider, MarketDataProvider, OrderGateway, OwnershipRegistry,
};
use crate::runtime_config::{EngineConfig, TrailingConfig};
use crate::types::{
    AdvisorySnapshot, Direction, IndicatorKind, MonitorMode, Position, PositionId, SymbolSpec,
};

/// Volume tolerance when comparing against broker granularity.
const VOLUME_EPSILON: f64 = 1e-9;

/// External collaborators the monitor drives.
pub struct MonitorDeps {
    pub market: Arc<dyn MarketDataProvider>,
    pub gateway: Arc<dyn OrderGateway>,
    pub registry: Arc<dyn OwnershipRegistry>,
    pub conditions: Option<Arc<dyn MarketConditionProvider>>,
    pub journal: Arc<dyn DecisionSink>,
}

// =============================================================================
// Control handle (shared with the API)
// =============================================================================

/// Summary of one monitor cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub started_at: Option<DateTime<Utc>>,
    /// `None` when listing open positions failed.
    pub positions_listed: Option<usize>,
    pub rules_created: usize,
    pub rules_removed: usize,
    pub evaluated: usize,
    pub mutations: usize,
    pub state_changes: usize,
    pub closed: usize,
    pub yielded: usize,
    pub not_owner: usize,
    pub failures: usize,
}

impl CycleReport {
    /// Whether the rule set changed and should be saved.
    pub fn dirty(&self) -> bool {
        self.rules_created
            + self.rules_removed
            + self.mutations
            + self.state_changes
            + self.closed
            + self.yielded
            + self.failures
            > 0
    }
}

/// Run/pause/stop switches plus cycle statistics.
#[derive(Debug)]
pub struct MonitorControl {
    running: AtomicBool,
    mode: RwLock<MonitorMode>,
    cycles: AtomicU64,
    last_report: RwLock<Option<CycleReport>>,
    shutdown: Notify,
}

impl MonitorControl {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            mode: RwLock::new(MonitorMode::Active),
            cycles: AtomicU64::new(0),
            last_report: RwLock::new(None),
            shutdown: Notify::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the loop to exit after the current step.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    pub fn mode(&self) -> MonitorMode {
        *self.mode.read()
    }

    pub fn set_mode(&self, mode: MonitorMode) {
        let prev = std::mem::replace(&mut *self.mode.write(), mode);
        if prev != mode {
            info!(from = %prev, to = %mode, "monitor mode changed");
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().clone()
    }

    fn finish_cycle(&self, report: CycleReport) {
        self.cycles.fetch_add(1, Ordering::SeqCst);
        *self.last_report.write() = Some(report);
    }
}

impl Default for MonitorControl {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// What happened to one rule during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleVerdict {
    Idle,
    /// Rule state changed without a broker mutation.
    StateOnly,
    Mutated(ActionKind),
    /// Position fully closed; rule removed.
    Closed,
    /// Another manager took over; rule removed.
    Yielded,
    /// Owned by someone else for now; rule kept.
    NotOwner,
    /// A mutation failed; the error was journaled.
    Failed,
}

pub struct ExitMonitor {
    config: EngineConfig,
    store: Arc<RuleStore>,
    market: Arc<dyn MarketDataProvider>,
    conditions: Option<Arc<dyn MarketConditionProvider>>,
    breaker: Arc<IndicatorBreaker>,
    arbiter: OwnershipArbiter,
    executor: ActionExecutor,
    journal: Arc<dyn DecisionSink>,
    control: Arc<MonitorControl>,
}

impl ExitMonitor {
    pub fn new(config: EngineConfig, store: Arc<RuleStore>, deps: MonitorDeps) -> Self {
        let timeout = config.external_timeout();
        let breaker = Arc::new(IndicatorBreaker::new(
            Arc::clone(&deps.market),
            config.breaker.clone(),
            timeout,
        ));
        let arbiter = OwnershipArbiter::new(
            config.engine_id.clone(),
            deps.registry,
            config.ownership.cache_ttl(),
            timeout,
        );
        let executor = ActionExecutor::new(deps.gateway, config.retry.clone(), timeout);

        Self {
            config,
            store,
            market: deps.market,
            conditions: deps.conditions,
            breaker,
            arbiter,
            executor,
            journal: deps.journal,
            control: Arc::new(MonitorControl::new()),
        }
    }

    pub fn control(&self) -> Arc<MonitorControl> {
        Arc::clone(&self.control)
    }

    pub fn breaker(&self) -> Arc<IndicatorBreaker> {
        Arc::clone(&self.breaker)
    }

    pub fn store(&self) -> Arc<RuleStore> {
        Arc::clone(&self.store)
    }

    /// Run until `MonitorControl::stop` is called, then save the rules.
    pub async fn run(self: Arc<Self>) {
        info!(
            interval_secs = self.config.monitor_interval_secs,
            rules = self.store.len(),
            "exit monitor started"
        );

        let mut ticker = interval(self.config.monitor_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !self.control.is_running() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.control.shutdown.notified() => break,
            }
            if !self.control.is_running() {
                break;
            }
            if self.control.mode() == MonitorMode::Paused {
                debug!("exit monitor paused, skipping cycle");
                continue;
            }

            let report = self.run_cycle().await;
            if report.dirty() {
                self.persist();
            }
        }

        self.persist();
        info!("exit monitor stopped");
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.config.rules_path) {
            error!(
                path = %self.config.rules_path,
                error = %format!("{e:#}"),
                "failed to save exit rules"
            );
        }
    }

    /// One full pass over every tracked position.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport {
            started_at: Some(Utc::now()),
            ..CycleReport::default()
        };

        // ── 1. Listing + rule synchronisation ───────────────────────────
        let positions = match self
            .bounded("list_open_positions", self.market.list_open_positions())
            .await
        {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "listing open positions failed, skipping cycle");
                self.control.finish_cycle(report.clone());
                return report;
            }
        };
        report.positions_listed = Some(positions.len());

        let by_id: HashMap<PositionId, Position> =
            positions.into_iter().map(|p| (p.position_id, p)).collect();
        self.sync_rules(&by_id, &mut report);

        // ── 2. Per-rule evaluation ──────────────────────────────────────
        for id in self.store.keys() {
            if !self.control.is_running() {
                debug!("stop requested, ending cycle early");
                break;
            }
            let Some(position) = by_id.get(&id) else {
                continue;
            };

            report.evaluated += 1;
            match self.evaluate_one(position).await {
                Ok(RuleVerdict::Idle) => {}
                Ok(RuleVerdict::StateOnly) => report.state_changes += 1,
                Ok(RuleVerdict::Mutated(_)) => report.mutations += 1,
                Ok(RuleVerdict::Closed) => report.closed += 1,
                Ok(RuleVerdict::Yielded) => report.yielded += 1,
                Ok(RuleVerdict::NotOwner) => report.not_owner += 1,
                Ok(RuleVerdict::Failed) => report.failures += 1,
                Err(e) => {
                    report.failures += 1;
                    warn!(
                        position_id = id,
                        symbol = %position.symbol,
                        error = %format!("{e:#}"),
                        "rule evaluation failed"
                    );
                }
            }
        }

        debug!(
            evaluated = report.evaluated,
            mutations = report.mutations,
            failures = report.failures,
            "exit monitor cycle complete"
        );
        self.control.finish_cycle(report.clone());
        report
    }

    fn sync_rules(&self, by_id: &HashMap<PositionId, Position>, report: &mut CycleReport) {
        self.store.retain_released(|id| by_id.contains_key(&id));

        let mut ids: Vec<&PositionId> = by_id.keys().collect();
        ids.sort_unstable();

        for id in ids {
            let position = &by_id[id];
            if self.store.contains(*id) || self.store.is_released(*id) {
                continue;
            }
            let rule = match ExitRule::from_position(position, self.config.thresholds) {
                Ok(rule) => rule,
                Err(reason) => {
                    debug!(
                        position_id = id,
                        symbol = %position.symbol,
                        reason = %reason,
                        "position not tracked"
                    );
                    continue;
                }
            };
            if self.store.insert_if_absent(rule) {
                report.rules_created += 1;
                self.journal.record(
                    DecisionRecord::new(*id, &position.symbol, DecisionKind::RuleCreated, "CREATED")
                        .with_stops(position.stop(), None)
                        .with_details(json!({
                            "direction": position.direction,
                            "entry_price": position.entry_price,
                            "take_profit": position.take_profit,
                        })),
                );
            }
        }

        for id in self.store.keys() {
            if by_id.contains_key(&id) {
                continue;
            }
            if let Some(rule) = self.store.remove(id) {
                report.rules_removed += 1;
                self.arbiter.forget(id);
                self.journal.record(
                    DecisionRecord::new(id, &rule.symbol, DecisionKind::RuleRemoved, "REMOVED")
                        .with_reason("position no longer open"),
                );
            }
        }
    }

    /// Evaluate the rule for `position` through the full priority chain.
    pub async fn evaluate_one(&self, position: &Position) -> Result<RuleVerdict> {
        let id = position.position_id;
        let Some(rule) = self.store.get(id) else {
            return Ok(RuleVerdict::Idle);
        };

        // ── Ownership ───────────────────────────────────────────────────
        let ownership = self.arbiter.may_act(id, rule.origin).await;
        if ownership.must_yield() {
            self.store.release(id);
            self.arbiter.forget(id);
            self.journal.record(
                DecisionRecord::new(id, &rule.symbol, DecisionKind::OwnershipYield, "YIELD")
                    .with_reason("owner reached a critical state"),
            );
            return Ok(RuleVerdict::Yielded);
        }
        if !ownership.may_mutate() {
            self.journal.record(
                DecisionRecord::new(id, &rule.symbol, DecisionKind::OwnershipSkip, "SKIP")
                    .with_reason("owned by another manager"),
            );
            return Ok(RuleVerdict::NotOwner);
        }

        // ── Inputs ──────────────────────────────────────────────────────
        let price = if position.current_price > 0.0 {
            position.current_price
        } else {
            self.bounded("current_price", self.market.current_price(&rule.symbol))
                .await?
        };
        if !price.is_finite() || price <= 0.0 {
            return Err(anyhow!("invalid price {price} for {}", rule.symbol));
        }

        let spec = match self
            .bounded("symbol_spec", self.market.symbol_spec(&rule.symbol))
            .await
        {
            Ok(spec) => spec,
            Err(e) => {
                warn!(
                    symbol = %rule.symbol,
                    error = %format!("{e:#}"),
                    "symbol spec unavailable, using defaults"
                );
                SymbolSpec::default()
            }
        };

        let snapshot = self.fetch_snapshot(&rule).await;
        let risk_multiple = rule.risk_multiple(price);
        let profit_fraction = rule.profit_fraction(price);
        let decision = gate::evaluate(
            &rule,
            profit_fraction,
            risk_multiple,
            snapshot.as_ref(),
            &self.config.gate,
        );
        self.note_gate(&rule, &decision, risk_multiple);

        if let Some(snap) = snapshot {
            self.store.update(id, |r| r.advisory_snapshot = Some(snap));
        }

        let direction = rule.direction;
        let broker_stop = position.stop();

        // ── 1. Reversal exit ────────────────────────────────────────────
        if self.config.enable_reversal_exit && !rule.breakeven_triggered {
            let reading = self
                .breaker
                .get(&rule.symbol, IndicatorKind::StructureBreak)
                .await;
            if reading.source == ReadingSource::Live && is_reversal(direction, reading.value) {
                let reason = format!("structure break {:.2} against {}", reading.value, direction);
                return Ok(
                    match self
                        .submit(&rule, Mutation::CloseFull, &spec, broker_stop, None, &reason)
                        .await
                    {
                        Some(_) => {
                            self.store.remove(id);
                            self.arbiter.forget(id);
                            RuleVerdict::Closed
                        }
                        None => RuleVerdict::Failed,
                    },
                );
            }
        }

        // ── 2. Break-even ───────────────────────────────────────────────
        let breakeven_due = risk_multiple >= self.config.gate.critical_r_threshold
            || profit_fraction * 100.0 >= rule.breakeven_threshold_pct;
        if decision.admit && !rule.breakeven_triggered && breakeven_due {
            let be = breakeven_stop(
                direction,
                rule.entry_price,
                spec.spread,
                self.config.trailing.breakeven_epsilon_pct,
            );
            let tier = decision.tier;

            let already_protected = broker_stop.filter(|s| direction.at_least_as_protective(*s, be));
            if let Some(current) = already_protected {
                let reason = format!("live stop {current} already beyond break-even {be:.5}");
                self.store.update(id, |r| {
                    commit_breakeven(r, tier, current);
                    r.record_action(action(
                        ActionKind::BreakEven,
                        broker_stop,
                        Some(current),
                        None,
                        &reason,
                    ));
                });
                return Ok(RuleVerdict::StateOnly);
            }

            let clearance = direction.sign() * (price - be);
            if clearance >= spec.min_stop_distance {
                let reason = format!(
                    "R {risk_multiple:.2}, profit {:.1}%",
                    profit_fraction * 100.0
                );
                let mutation = Mutation::ModifyStop {
                    new_stop: be,
                    new_target: None,
                    protect_level: Some(rule.entry_price),
                };
                return Ok(
                    match self
                        .submit(&rule, mutation, &spec, broker_stop, Some(be), &reason)
                        .await
                    {
                        Some(outcome) => {
                            let level = match outcome {
                                ApplyOutcome::Skipped(_) => broker_stop.unwrap_or(be),
                                _ => be,
                            };
                            self.store.update(id, |r| {
                                commit_breakeven(r, tier, level);
                                r.record_action(action(
                                    ActionKind::BreakEven,
                                    broker_stop,
                                    Some(level),
                                    None,
                                    &reason,
                                ));
                            });
                            RuleVerdict::Mutated(ActionKind::BreakEven)
                        }
                        None => RuleVerdict::Failed,
                    },
                );
            }
            debug!(
                position_id = id,
                breakeven = be,
                price,
                min_stop_distance = spec.min_stop_distance,
                "break-even too close to price, waiting"
            );
        }

        // ── 3. Partial profit ───────────────────────────────────────────
        if decision.admit
            && !rule.partial_triggered
            && rule.potential_reward > 0.0
            && profit_fraction * 100.0 >= rule.partial_threshold_pct
        {
            let remaining = position.volume;
            let volume = floor_to_step(remaining * rule.partial_close_fraction, spec.volume_step);
            if volume + VOLUME_EPSILON < spec.min_volume
                || remaining - volume + VOLUME_EPSILON < spec.min_volume
            {
                debug!(
                    position_id = id,
                    remaining,
                    volume,
                    min_volume = spec.min_volume,
                    "partial close below minimum granularity, skipped"
                );
            } else {
                let reason = format!("profit {:.1}% of target", profit_fraction * 100.0);
                let mutation = Mutation::ClosePartial {
                    volume,
                    expected_volume_before: remaining,
                };
                return Ok(
                    match self
                        .submit(&rule, mutation, &spec, broker_stop, broker_stop, &reason)
                        .await
                    {
                        Some(_) => {
                            self.store.update(id, |r| {
                                r.partial_triggered = true;
                                r.record_action(action(
                                    ActionKind::PartialClose,
                                    None,
                                    None,
                                    Some(volume),
                                    &reason,
                                ));
                            });
                            RuleVerdict::Mutated(ActionKind::PartialClose)
                        }
                        None => RuleVerdict::Failed,
                    },
                );
            }
        }

        // ── 4. Trailing ─────────────────────────────────────────────────
        let mut verdict = RuleVerdict::Idle;
        let trailing = decision.admit || rule.trailing_active;
        if trailing {
            let tier = decision.tier;
            if decision.admit && (!rule.trailing_active || rule.trailing_multiplier != tier) {
                self.store.update(id, |r| {
                    r.trailing_active = true;
                    r.trailing_multiplier = tier;
                });
                verdict = RuleVerdict::StateOnly;
            }

            let mult = match tier {
                TrailingTier::Normal => self.config.trailing.atr_mult_normal,
                TrailingTier::Widened => self.config.trailing.atr_mult_widened,
            };
            let atr = self
                .breaker
                .get(&rule.symbol, IndicatorKind::Atr)
                .await
                .value()
                .filter(|v| *v > 0.0);
            let distance = match atr {
                Some(atr) => atr * mult,
                None => fallback_trail_distance(&rule, price, &self.config.trailing),
            }
            .max(spec.min_stop_distance);
            let candidate = price - direction.sign() * distance;

            let improves = rule
                .reference_stop(broker_stop)
                .map_or(true, |s| direction.more_protective(candidate, s));

            if improves && candidate > 0.0 {
                let reason = match atr {
                    Some(atr) => format!("ATR {atr:.5} x {mult} ({tier})"),
                    None => format!(
                        "ATR unavailable, {} x risk",
                        self.config.trailing.fallback_risk_fraction
                    ),
                };
                let mutation = Mutation::ModifyStop {
                    new_stop: candidate,
                    new_target: None,
                    protect_level: None,
                };
                match self
                    .submit(&rule, mutation, &spec, broker_stop, Some(candidate), &reason)
                    .await
                {
                    Some(ApplyOutcome::Applied) | Some(ApplyOutcome::NoOp(_)) => {
                        self.store.update(id, |r| {
                            r.trailing_active = true;
                            r.last_trailing_stop = Some(candidate);
                            r.record_action(action(
                                ActionKind::TrailingUpdate,
                                broker_stop,
                                Some(candidate),
                                None,
                                &reason,
                            ));
                        });
                        verdict = RuleVerdict::Mutated(ActionKind::TrailingUpdate);
                    }
                    Some(ApplyOutcome::Skipped(_)) => {}
                    None => return Ok(RuleVerdict::Failed),
                }
            }
        }

        // ── 5. Hybrid widening (state only) ─────────────────────────────
        if self.config.enable_hybrid_widening && trailing && !rule.hybrid_widen_active {
            let reading = self
                .breaker
                .get(&rule.symbol, IndicatorKind::VolatilityRatio)
                .await;
            if let Some(ratio) = reading.value() {
                if ratio > self.config.hybrid_widen_volatility_ratio {
                    let reason = format!(
                        "volatility ratio {ratio:.2} > {:.2}",
                        self.config.hybrid_widen_volatility_ratio
                    );
                    self.store.update(id, |r| {
                        r.hybrid_widen_active = true;
                        r.trailing_multiplier = TrailingTier::Widened;
                        r.record_action(action(ActionKind::HybridWiden, None, None, None, &reason));
                    });
                    self.journal.record(
                        DecisionRecord::new(id, &rule.symbol, DecisionKind::Gate, "WIDENED")
                            .with_reason(reason),
                    );
                    if verdict == RuleVerdict::Idle {
                        verdict = RuleVerdict::StateOnly;
                    }
                }
            }
        }

        Ok(verdict)
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn bounded<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.config.external_timeout(), fut)
            .await
            .map_err(|_| anyhow!("{what} timed out after {:?}", self.config.external_timeout()))?
            .with_context(|| format!("{what} failed"))
    }

    /// Fresh advisory snapshot, or the last one stored on the rule.
    async fn fetch_snapshot(&self, rule: &ExitRule) -> Option<AdvisorySnapshot> {
        let Some(conditions) = &self.conditions else {
            return rule.advisory_snapshot.clone();
        };
        match self.bounded("snapshot", conditions.snapshot(&rule.symbol)).await {
            Ok(snap) => Some(snap),
            Err(e) => {
                debug!(
                    symbol = %rule.symbol,
                    error = %format!("{e:#}"),
                    "advisory snapshot unavailable"
                );
                rule.advisory_snapshot.clone()
            }
        }
    }

    /// Journal the gate result when it changes the rule's trailing state.
    fn note_gate(&self, rule: &ExitRule, decision: &GateDecision, risk_multiple: f64) {
        let first_admit = decision.admit && !rule.trailing_active;
        let tier_change = rule.trailing_active && decision.tier != rule.trailing_multiplier;
        if !(first_admit || tier_change) {
            return;
        }
        let outcome = if first_admit { "ADMIT" } else { "TIER_CHANGE" };
        self.journal.record(
            DecisionRecord::new(rule.position_id, &rule.symbol, DecisionKind::Gate, outcome)
                .with_reason(format!("R {risk_multiple:.2}, tier {}", decision.tier))
                .with_details(json!({ "reasons": decision.reasons })),
        );
    }

    /// Apply `mutation` and journal the result. `None` on failure.
    async fn submit(
        &self,
        rule: &ExitRule,
        mutation: Mutation,
        spec: &SymbolSpec,
        old_stop: Option<f64>,
        new_stop: Option<f64>,
        reason: &str,
    ) -> Option<ApplyOutcome> {
        let label = mutation.label();
        let result = self.executor.apply(rule, &mutation, spec).await;

        let (outcome, detail) = match &result {
            Ok(ApplyOutcome::Applied) => ("APPLIED".to_string(), None),
            Ok(ApplyOutcome::NoOp(msg)) => ("NOOP".to_string(), Some(msg.clone())),
            Ok(ApplyOutcome::Skipped(msg)) => ("SKIPPED".to_string(), Some(msg.clone())),
            Err(e) => (e.kind().to_string(), Some(e.to_string())),
        };
        self.journal.record(
            DecisionRecord::new(rule.position_id, &rule.symbol, DecisionKind::Mutation, outcome)
                .with_reason(reason)
                .with_stops(old_stop, new_stop)
                .with_details(json!({ "mutation": label, "detail": detail })),
        );

        match result {
            Ok(outcome) => Some(outcome),
            Err(ExecError::PositionGone(id)) => {
                self.store.remove(id);
                self.arbiter.forget(id);
                None
            }
            Err(_) => None,
        }
    }
}

impl std::fmt::Debug for ExitMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitMonitor")
            .field("engine_id", &self.config.engine_id)
            .field("rules", &self.store.len())
            .finish()
    }
}

/// Trailing distance when ATR is unavailable: a fraction of the initial
/// risk, never tighter than `min_fallback_trail_pct` of price.
fn fallback_trail_distance(rule: &ExitRule, price: f64, trailing: &TrailingConfig) -> f64 {
    let from_risk = rule.risk_distance * trailing.fallback_risk_fraction;
    let floor = price * trailing.min_fallback_trail_pct / 100.0;
    from_risk.max(floor)
}

/// A confirmed structure break against the position.
fn is_reversal(direction: Direction, signal: f64) -> bool {
    match direction {
        Direction::Long => signal <= -1.0,
        Direction::Short => signal >= 1.0,
    }
}

fn commit_breakeven(rule: &mut ExitRule, tier: TrailingTier, level: f64) {
    rule.breakeven_triggered = true;
    rule.trailing_active = true;
    rule.trailing_multiplier = if rule.hybrid_widen_active {
        TrailingTier::Widened
    } else {
        tier
    };
    rule.last_trailing_stop = Some(match rule.last_trailing_stop {
        Some(prev) if rule.direction.more_protective(prev, level) => prev,
        _ => level,
    });
}

fn action(
    kind: ActionKind,
    old_stop: Option<f64>,
    new_stop: Option<f64>,
    volume: Option<f64>,
    reason: &str,
) -> ActionRecord {
    ActionRecord {
        kind,
        at: Utc::now(),
        old_stop,
        new_stop,
        volume,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversal_signal_direction() {
        assert!(is_reversal(Direction::Long, -1.0));
        assert!(!is_reversal(Direction::Long, 1.0));
        assert!(!is_reversal(Direction::Long, -0.5));
        assert!(is_reversal(Direction::Short, 1.2));
    }

    #[test]
    fn report_dirty_only_when_something_changed() {
        let mut r = CycleReport::default();
        assert!(!r.dirty());
        r.not_owner = 3;
        r.evaluated = 3;
        assert!(!r.dirty());
        r.state_changes = 1;
        assert!(r.dirty());
    }

    #[test]
    fn fallback_trail_distance_is_floored_by_price() {
        use crate::exit::rule::RuleOrigin;
        use crate::runtime_config::RuleThresholds;

        let trailing = TrailingConfig::default();
        let tight = ExitRule::new(
            1,
            "XAUUSD",
            Direction::Long,
            100.0,
            99.99,
            103.0,
            RuleThresholds::default(),
            RuleOrigin::Engine,
        );
        let d = fallback_trail_distance(&tight, 101.0, &trailing);
        assert!((d - 101.0 * 0.0025).abs() < 1e-9, "distance {d}");
        assert!(101.0 - d > 0.1);

        let wide = ExitRule::new(
            2,
            "XAUUSD",
            Direction::Long,
            100.0,
            99.0,
            103.0,
            RuleThresholds::default(),
            RuleOrigin::Engine,
        );
        assert!((fallback_trail_distance(&wide, 101.0, &trailing) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn control_pause_and_stop() {
        let c = MonitorControl::new();
        assert!(c.is_running());
        c.set_mode(MonitorMode::Paused);
        assert_eq!(c.mode(), MonitorMode::Paused);
        c.stop();
        assert!(!c.is_running());
    }
}
