// =============================================================================
// Ownership Arbiter: may this engine act on a position?
// =============================================================================
//
//   registry answers         → cache it, return it
//   registry fails, cache < TTL → last-known answer
//   registry fails, no fresh cache:
//       rule origin == Engine   → Unclaimed
//       rule origin == External → Other (do not act without confirmation)
//
// Registry calls are bounded by the external timeout. The cache lock is
// never held across the call.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::exit::rule::RuleOrigin;
use crate::providers::OwnershipRegistry;
use crate::types::{OwnershipRecord, PositionId};

/// Who manages a position, from this engine's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Owner {
    SelfEngine,
    Other,
    Unclaimed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OwnershipAnswer {
    pub owner: Owner,
    pub others_critical_state: bool,
}

impl OwnershipAnswer {
    /// This engine may mutate the position.
    pub fn may_mutate(&self) -> bool {
        matches!(self.owner, Owner::SelfEngine | Owner::Unclaimed)
    }

    /// Another manager has passed an irreversible milestone; the local rule
    /// must be dropped.
    pub fn must_yield(&self) -> bool {
        self.owner == Owner::Other && self.others_critical_state
    }
}

pub struct OwnershipArbiter {
    engine_id: String,
    registry: Arc<dyn OwnershipRegistry>,
    cache_ttl: Duration,
    call_timeout: Duration,
    cache: Mutex<HashMap<PositionId, (OwnershipAnswer, Instant)>>,
}

impl OwnershipArbiter {
    pub fn new(
        engine_id: impl Into<String>,
        registry: Arc<dyn OwnershipRegistry>,
        cache_ttl: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            engine_id: engine_id.into(),
            registry,
            cache_ttl,
            call_timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn classify(&self, record: &OwnershipRecord) -> OwnershipAnswer {
        let owner = match record.owner.as_deref() {
            None | Some("") => Owner::Unclaimed,
            Some(name) if name == self.engine_id => Owner::SelfEngine,
            Some(_) => Owner::Other,
        };
        OwnershipAnswer {
            owner,
            others_critical_state: owner == Owner::Other && record.critical_state,
        }
    }

    /// Ask the registry who owns `position_id`.
    pub async fn may_act(&self, position_id: PositionId, origin: RuleOrigin) -> OwnershipAnswer {
        let result =
            tokio::time::timeout(self.call_timeout, self.registry.get_owner(position_id)).await;

        let error = match result {
            Ok(Ok(record)) => {
                let answer = self.classify(&record);
                self.cache.lock().insert(position_id, (answer, Instant::now()));
                debug!(
                    position_id,
                    owner = ?answer.owner,
                    critical = answer.others_critical_state,
                    "ownership resolved"
                );
                return answer;
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => format!("timed out after {:?}", self.call_timeout),
        };

        if let Some((answer, at)) = self.cache.lock().get(&position_id).copied() {
            if at.elapsed() < self.cache_ttl {
                debug!(
                    position_id,
                    error = %error,
                    age_ms = at.elapsed().as_millis() as u64,
                    "registry unavailable, using cached ownership"
                );
                return answer;
            }
        }

        let owner = match origin {
            RuleOrigin::Engine => Owner::Unclaimed,
            RuleOrigin::External => Owner::Other,
        };
        warn!(
            position_id,
            error = %error,
            ?origin,
            assumed = ?owner,
            "registry unavailable and no fresh cache"
        );
        OwnershipAnswer {
            owner,
            others_critical_state: false,
        }
    }

    /// Drop cached answers for positions that are no longer tracked.
    pub fn forget(&self, position_id: PositionId) {
        self.cache.lock().remove(&position_id);
    }
}

impl std::fmt::Debug for OwnershipArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnershipArbiter")
            .field("engine_id", &self.engine_id)
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::local_registry::LocalOwnershipRegistry;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Registry wrapper that can be switched off.
    struct Switchable {
        inner: LocalOwnershipRegistry,
        down: AtomicBool,
    }

    #[async_trait]
    impl OwnershipRegistry for Switchable {
        async fn get_owner(&self, position_id: PositionId) -> Result<OwnershipRecord> {
            if self.down.load(Ordering::SeqCst) {
                bail!("registry unreachable");
            }
            self.inner.get_owner(position_id).await
        }
    }

    fn arbiter(reg: Arc<Switchable>) -> OwnershipArbiter {
        OwnershipArbiter::new("exit-steward", reg, Duration::from_secs(30), Duration::from_secs(2))
    }

    fn switchable() -> Arc<Switchable> {
        Arc::new(Switchable {
            inner: LocalOwnershipRegistry::new(),
            down: AtomicBool::new(false),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn classifies_owners() {
        let reg = switchable();
        reg.inner.claim(1, "exit-steward", false);
        reg.inner.claim(2, "grid-manager", true);
        let a = arbiter(reg);

        assert_eq!(a.may_act(1, RuleOrigin::Engine).await.owner, Owner::SelfEngine);
        let other = a.may_act(2, RuleOrigin::Engine).await;
        assert!(other.must_yield());
        assert!(!other.may_mutate());
        assert_eq!(a.may_act(3, RuleOrigin::Engine).await.owner, Owner::Unclaimed);
    }

    #[tokio::test(start_paused = true)]
    async fn outage_uses_cache_within_ttl() {
        let reg = switchable();
        reg.inner.claim(5, "grid-manager", false);
        let a = arbiter(reg.clone());
        assert_eq!(a.may_act(5, RuleOrigin::Engine).await.owner, Owner::Other);

        reg.down.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(a.may_act(5, RuleOrigin::Engine).await.owner, Owner::Other);

        tokio::time::advance(Duration::from_secs(25)).await;
        assert_eq!(a.may_act(5, RuleOrigin::Engine).await.owner, Owner::Unclaimed);
    }

    #[tokio::test(start_paused = true)]
    async fn outage_without_cache_fails_safe_for_external_rules() {
        let reg = switchable();
        reg.down.store(true, Ordering::SeqCst);
        let a = arbiter(reg);
        assert_eq!(a.may_act(9, RuleOrigin::Engine).await.owner, Owner::Unclaimed);
        assert_eq!(a.may_act(9, RuleOrigin::External).await.owner, Owner::Other);
    }
}
