//! In-process ownership registry.
//!
//! Sibling subsystems running in the same process claim and release
//! positions here; unknown positions are unclaimed.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use super::OwnershipRegistry;
use crate::types::{OwnershipRecord, PositionId};

#[derive(Debug, Default)]
pub struct LocalOwnershipRegistry {
    records: RwLock<HashMap<PositionId, OwnershipRecord>>,
}

impl LocalOwnershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `owner` as the manager of `position_id`.
    pub fn claim(&self, position_id: PositionId, owner: &str, critical_state: bool) {
        info!(position_id, owner, critical_state, "ownership claimed");
        self.records.write().insert(
            position_id,
            OwnershipRecord {
                owner: Some(owner.to_string()),
                critical_state,
            },
        );
    }

    pub fn release(&self, position_id: PositionId) {
        if self.records.write().remove(&position_id).is_some() {
            info!(position_id, "ownership released");
        }
    }
}

#[async_trait]
impl OwnershipRegistry for LocalOwnershipRegistry {
    async fn get_owner(&self, position_id: PositionId) -> Result<OwnershipRecord> {
        Ok(self
            .records
            .read()
            .get(&position_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_position_is_unclaimed() {
        let reg = LocalOwnershipRegistry::new();
        let rec = reg.get_owner(7).await.unwrap();
        assert_eq!(rec.owner, None);
        assert!(!rec.critical_state);
    }

    #[tokio::test]
    async fn claim_and_release() {
        let reg = LocalOwnershipRegistry::new();
        reg.claim(7, "grid-manager", true);
        let rec = reg.get_owner(7).await.unwrap();
        assert_eq!(rec.owner.as_deref(), Some("grid-manager"));
        assert!(rec.critical_state);

        reg.release(7);
        assert_eq!(reg.get_owner(7).await.unwrap(), OwnershipRecord::default());
    }
}
