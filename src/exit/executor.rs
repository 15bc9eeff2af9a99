// =============================================================================
// Action Executor: idempotent, retrying broker mutations
// =============================================================================
//
// Every mutation goes through the same pipeline:
//
//   1. Re-fetch the authoritative position from the gateway.
//   2. Idempotence: already-applied changes return NoOp without submitting.
//   3. Non-regression: a stop worse than the live stop is rejected.
//   4. Materiality: tiny stop changes are skipped unless the live stop is
//      worse than the mutation's protection level (e.g. entry at break-even).
//   5. Submit with bounded retry on transient failures.
//
// Retry schedule with the default base of 500ms: attempt, wait 0.5s,
// attempt, wait 1s, attempt. Each attempt is bounded by the external
// timeout. Rejections are never retried.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ExecError, GatewayError};
use crate::exit::rule::ExitRule;
use crate::providers::OrderGateway;
use crate::runtime_config::RetryConfig;
use crate::types::{PositionId, SymbolSpec};

/// Price tolerance under which two levels are the same.
const PRICE_EPSILON: f64 = 1e-9;

/// A change to broker state requested by the monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Move the stop (and optionally the target). If `protect_level` is set
    /// and the live stop is worse than it, the change is forced through even
    /// when it is below the broker's modification granularity.
    ModifyStop {
        new_stop: f64,
        new_target: Option<f64>,
        protect_level: Option<f64>,
    },
    /// Close `volume` of a position whose remaining volume was
    /// `expected_volume_before` when the decision was made.
    ClosePartial {
        volume: f64,
        expected_volume_before: f64,
    },
    CloseFull,
}

impl Mutation {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ModifyStop { .. } => "modify_stop",
            Self::ClosePartial { .. } => "close_partial",
            Self::CloseFull => "close_full",
        }
    }
}

/// Result of a mutation that did not fail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ApplyOutcome {
    /// Submitted and accepted by the broker.
    Applied,
    /// The broker already reflects the mutation.
    NoOp(String),
    /// Deliberately not submitted (immaterial change).
    Skipped(String),
}

pub struct ActionExecutor {
    gateway: Arc<dyn OrderGateway>,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(gateway: Arc<dyn OrderGateway>, retry: RetryConfig, call_timeout: Duration) -> Self {
        Self {
            gateway,
            retry,
            call_timeout,
        }
    }

    /// Apply `mutation` to the position behind `rule`.
    pub async fn apply(
        &self,
        rule: &ExitRule,
        mutation: &Mutation,
        spec: &SymbolSpec,
    ) -> Result<ApplyOutcome, ExecError> {
        let id = rule.position_id;

        // ── 1. Authoritative state ──────────────────────────────────────
        let gateway = Arc::clone(&self.gateway);
        let live = self
            .with_retry("fetch_position", id, || {
                let gateway = Arc::clone(&gateway);
                async move { gateway.fetch_position(id).await }
            })
            .await
            .map_err(|e| ExecError::DataUnavailable(e.to_string()))?;

        let Some(pos) = live else {
            if matches!(mutation, Mutation::CloseFull) {
                return Ok(ApplyOutcome::NoOp("position already closed".into()));
            }
            return Err(ExecError::PositionGone(id));
        };

        match *mutation {
            Mutation::ModifyStop {
                new_stop,
                new_target,
                protect_level,
            } => {
                if !new_stop.is_finite() || new_stop <= 0.0 {
                    return Err(ExecError::InvalidMutation(format!("stop {new_stop}")));
                }
                let target = new_target.unwrap_or(pos.take_profit);
                let target_changed = (target - pos.take_profit).abs() > PRICE_EPSILON;

                // ── 2. Idempotence ──────────────────────────────────────
                if let Some(current) = pos.stop() {
                    if (current - new_stop).abs() <= PRICE_EPSILON && !target_changed {
                        return Ok(ApplyOutcome::NoOp(format!("stop already at {current}")));
                    }

                    // ── 3. Non-regression ───────────────────────────────
                    if !rule.direction.at_least_as_protective(new_stop, current) {
                        warn!(
                            position_id = id,
                            symbol = %rule.symbol,
                            current_stop = current,
                            requested = new_stop,
                            "stop regression rejected before submission"
                        );
                        return Err(ExecError::StopRegression {
                            requested: new_stop,
                            current,
                        });
                    }

                    // ── 4. Materiality ──────────────────────────────────
                    let distance = (new_stop - current).abs();
                    if distance < spec.min_modify_distance && !target_changed {
                        let forced = protect_level.is_some_and(|level| {
                            !rule.direction.at_least_as_protective(current, level)
                        });
                        if !forced {
                            return Ok(ApplyOutcome::Skipped(format!(
                                "change {distance:.6} below min modify distance {}",
                                spec.min_modify_distance
                            )));
                        }
                        debug!(
                            position_id = id,
                            current_stop = current,
                            new_stop,
                            "immaterial change forced: live stop worse than protection level"
                        );
                    }
                }

                // ── 5. Submit ───────────────────────────────────────────
                let gateway = Arc::clone(&self.gateway);
                self.with_retry("modify_stop_target", id, || {
                    let gateway = Arc::clone(&gateway);
                    async move { gateway.modify_stop_target(id, new_stop, target).await }
                })
                .await?;

                info!(
                    position_id = id,
                    symbol = %rule.symbol,
                    old_stop = pos.stop_loss,
                    new_stop,
                    target,
                    "stop modified"
                );
                Ok(ApplyOutcome::Applied)
            }

            Mutation::ClosePartial {
                volume,
                expected_volume_before,
            } => {
                if !volume.is_finite() || volume <= 0.0 {
                    return Err(ExecError::InvalidMutation(format!("partial volume {volume}")));
                }
                if pos.volume <= expected_volume_before - volume + PRICE_EPSILON {
                    return Ok(ApplyOutcome::NoOp(format!(
                        "volume already reduced to {}",
                        pos.volume
                    )));
                }
                if volume >= pos.volume {
                    return Err(ExecError::InvalidMutation(format!(
                        "partial volume {volume} >= remaining {}",
                        pos.volume
                    )));
                }

                let gateway = Arc::clone(&self.gateway);
                self.with_retry("close_partial", id, || {
                    let gateway = Arc::clone(&gateway);
                    async move { gateway.close_partial(id, volume).await }
                })
                .await?;

                info!(
                    position_id = id,
                    symbol = %rule.symbol,
                    volume,
                    remaining = pos.volume - volume,
                    "partial close submitted"
                );
                Ok(ApplyOutcome::Applied)
            }

            Mutation::CloseFull => {
                let gateway = Arc::clone(&self.gateway);
                self.with_retry("close_full", id, || {
                    let gateway = Arc::clone(&gateway);
                    async move { gateway.close_full(id).await }
                })
                .await?;

                info!(
                    position_id = id,
                    symbol = %rule.symbol,
                    volume = pos.volume,
                    "position closed"
                );
                Ok(ApplyOutcome::Applied)
            }
        }
    }

    /// Run `call` until it succeeds, is rejected, or attempts run out.
    async fn with_retry<T, F, Fut>(
        &self,
        op: &'static str,
        position_id: PositionId,
        mut call: F,
    ) -> Result<T, ExecError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(GatewayError::Rejected(msg))) => {
                    warn!(
                        op,
                        position_id,
                        attempt,
                        reason = %msg,
                        "permanent rejection, not retrying"
                    );
                    return Err(ExecError::PermanentRejection(msg));
                }
                Ok(Err(GatewayError::Transient(msg))) => last_error = msg,
                Err(_) => last_error = format!("timed out after {:?}", self.call_timeout),
            }

            if attempt < max_attempts {
                let backoff = self.backoff(attempt);
                warn!(
                    op,
                    position_id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %last_error,
                    "transient failure, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }

        warn!(
            op,
            position_id,
            attempts = max_attempts,
            error = %last_error,
            "giving up after retries"
        );
        Err(ExecError::TransientExternalFailure {
            attempts: max_attempts,
            message: last_error,
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << (attempt.saturating_sub(1)).min(10);
        Duration::from_millis(self.retry.base_backoff_ms.saturating_mul(factor))
    }
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("retry", &self.retry)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::rule::RuleOrigin;
    use crate::providers::paper::PaperBroker;
    use crate::runtime_config::RuleThresholds;
    use crate::types::{Direction, Position};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Paper broker with scripted failures and a submission counter.
    #[derive(Default)]
    struct ScriptedGateway {
        inner: PaperBroker,
        transient_failures: AtomicU32,
        reject: AtomicBool,
        submits: AtomicU32,
    }

    impl ScriptedGateway {
        fn script(&self) -> Result<(), GatewayError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            if self.reject.load(Ordering::SeqCst) {
                return Err(GatewayError::Rejected("market closed".into()));
            }
            let left = self.transient_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.transient_failures.store(left - 1, Ordering::SeqCst);
                return Err(GatewayError::Transient("broker busy".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl OrderGateway for ScriptedGateway {
        async fn fetch_position(&self, id: PositionId) -> Result<Option<Position>, GatewayError> {
            self.inner.fetch_position(id).await
        }
        async fn modify_stop_target(
            &self,
            id: PositionId,
            stop: f64,
            target: f64,
        ) -> Result<(), GatewayError> {
            self.script()?;
            self.inner.modify_stop_target(id, stop, target).await
        }
        async fn close_partial(&self, id: PositionId, volume: f64) -> Result<(), GatewayError> {
            self.script()?;
            self.inner.close_partial(id, volume).await
        }
        async fn close_full(&self, id: PositionId) -> Result<(), GatewayError> {
            self.script()?;
            self.inner.close_full(id).await
        }
    }

    fn setup() -> (Arc<ScriptedGateway>, ActionExecutor, ExitRule) {
        let gw = Arc::new(ScriptedGateway::default());
        let id = gw.inner.open_position("XAUUSD", Direction::Long, 100.0, 1.0, 99.0, 102.0);
        gw.inner.update_price("XAUUSD", 100.6);
        let exec = ActionExecutor::new(gw.clone(), RetryConfig::default(), Duration::from_secs(2));
        let rule = ExitRule::new(
            id,
            "XAUUSD",
            Direction::Long,
            100.0,
            99.0,
            102.0,
            RuleThresholds::default(),
            RuleOrigin::Engine,
        );
        (gw, exec, rule)
    }

    fn modify(stop: f64) -> Mutation {
        Mutation::ModifyStop {
            new_stop: stop,
            new_target: None,
            protect_level: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn same_stop_is_noop_without_submission() {
        let (gw, exec, rule) = setup();
        let out = exec.apply(&rule, &modify(99.0), &SymbolSpec::default()).await.unwrap();
        assert!(matches!(out, ApplyOutcome::NoOp(_)));
        assert_eq!(gw.submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn regression_rejected_before_submission() {
        let (gw, exec, rule) = setup();
        let err = exec.apply(&rule, &modify(98.5), &SymbolSpec::default()).await.unwrap_err();
        assert!(matches!(err, ExecError::StopRegression { .. }));
        assert_eq!(gw.submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn short_regression_rejected_before_submission() {
        let gw = Arc::new(ScriptedGateway::default());
        let id = gw.inner.open_position("XAUUSD", Direction::Short, 100.0, 1.0, 101.0, 97.0);
        gw.inner.update_price("XAUUSD", 99.4);
        let exec = ActionExecutor::new(gw.clone(), RetryConfig::default(), Duration::from_secs(2));
        let rule = ExitRule::new(
            id,
            "XAUUSD",
            Direction::Short,
            100.0,
            101.0,
            97.0,
            RuleThresholds::default(),
            RuleOrigin::Engine,
        );
        let spec = SymbolSpec::default();

        let err = exec.apply(&rule, &modify(101.5), &spec).await.unwrap_err();
        assert_eq!(
            err,
            ExecError::StopRegression {
                requested: 101.5,
                current: 101.0
            }
        );
        assert_eq!(gw.submits.load(Ordering::SeqCst), 0);

        let out = exec.apply(&rule, &modify(100.5), &spec).await.unwrap();
        assert_eq!(out, ApplyOutcome::Applied);

        // Lower is tighter for a short; moving back up is a regression.
        let err = exec.apply(&rule, &modify(100.8), &spec).await.unwrap_err();
        assert!(matches!(err, ExecError::StopRegression { .. }));
        assert_eq!(gw.submits.load(Ordering::SeqCst), 1);
        let live = gw.inner.fetch_position(id).await.unwrap().unwrap();
        assert!((live.stop_loss - 100.5).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn immaterial_change_skipped_unless_below_protection() {
        let (gw, exec, rule) = setup();
        let spec = SymbolSpec {
            min_modify_distance: 0.5,
            ..SymbolSpec::default()
        };
        let out = exec.apply(&rule, &modify(99.2), &spec).await.unwrap();
        assert!(matches!(out, ApplyOutcome::Skipped(_)));
        assert_eq!(gw.submits.load(Ordering::SeqCst), 0);

        // Move the live stop just under entry; break-even must be forced.
        gw.inner.modify_stop_target(rule.position_id, 99.9, 102.0).await.unwrap();
        let be = Mutation::ModifyStop {
            new_stop: 100.02,
            new_target: None,
            protect_level: Some(100.0),
        };
        let out = exec.apply(&rule, &be, &spec).await.unwrap();
        assert_eq!(out, ApplyOutcome::Applied);
        let live = gw.inner.fetch_position(rule.position_id).await.unwrap().unwrap();
        assert!((live.stop_loss - 100.02).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let (gw, exec, rule) = setup();
        gw.transient_failures.store(2, Ordering::SeqCst);
        let out = exec.apply(&rule, &modify(99.5), &SymbolSpec::default()).await.unwrap();
        assert_eq!(out, ApplyOutcome::Applied);
        assert_eq!(gw.submits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let (gw, exec, rule) = setup();
        gw.transient_failures.store(10, Ordering::SeqCst);
        let err = exec.apply(&rule, &modify(99.5), &SymbolSpec::default()).await.unwrap_err();
        assert_eq!(
            err,
            ExecError::TransientExternalFailure {
                attempts: 3,
                message: "broker busy".into()
            }
        );
        assert_eq!(gw.submits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_not_retried() {
        let (gw, exec, rule) = setup();
        gw.reject.store(true, Ordering::SeqCst);
        let err = exec.apply(&rule, &modify(99.5), &SymbolSpec::default()).await.unwrap_err();
        assert!(matches!(err, ExecError::PermanentRejection(_)));
        assert_eq!(gw.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_already_visible_is_noop() {
        let (gw, exec, rule) = setup();
        let m = Mutation::ClosePartial {
            volume: 0.5,
            expected_volume_before: 1.0,
        };
        assert_eq!(
            exec.apply(&rule, &m, &SymbolSpec::default()).await.unwrap(),
            ApplyOutcome::Applied
        );
        let again = exec.apply(&rule, &m, &SymbolSpec::default()).await.unwrap();
        assert!(matches!(again, ApplyOutcome::NoOp(_)));
        assert_eq!(gw.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_of_gone_position_is_noop() {
        let (gw, exec, rule) = setup();
        let spec = SymbolSpec::default();
        assert_eq!(
            exec.apply(&rule, &Mutation::CloseFull, &spec).await.unwrap(),
            ApplyOutcome::Applied
        );
        let again = exec.apply(&rule, &Mutation::CloseFull, &spec).await.unwrap();
        assert!(matches!(again, ApplyOutcome::NoOp(_)));
        let err = exec.apply(&rule, &modify(99.5), &spec).await.unwrap_err();
        assert_eq!(err, ExecError::PositionGone(rule.position_id));
        assert_eq!(gw.submits.load(Ordering::SeqCst), 1);
    }
}
