// =============================================================================
// HTTP Ownership Registry: asks a sibling process who owns a position
// =============================================================================
//
// GET {base_url}/ownership/{position_id}
//   200 → {"owner": "grid-manager", "critical_state": true}
//   404 → unclaimed
//   anything else → error (the arbiter falls back to its cache)
// =============================================================================

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, instrument};

use super::OwnershipRegistry;
use crate::types::{OwnershipRecord, PositionId};

#[derive(Clone)]
pub struct HttpOwnershipRegistry {
    base_url: String,
    client: reqwest::Client,
}

impl HttpOwnershipRegistry {
    /// Create a client for the registry at `base_url`. Every request is
    /// bounded by `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build ownership registry HTTP client")?;

        debug!(base_url = %base_url, "HttpOwnershipRegistry initialised");

        Ok(Self { base_url, client })
    }

    fn url_for(&self, position_id: PositionId) -> String {
        format!("{}/ownership/{}", self.base_url, position_id)
    }
}

#[async_trait]
impl OwnershipRegistry for HttpOwnershipRegistry {
    #[instrument(skip(self), name = "registry::get_owner")]
    async fn get_owner(&self, position_id: PositionId) -> Result<OwnershipRecord> {
        let url = self.url_for(position_id);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(OwnershipRecord::default());
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("ownership registry returned HTTP {status}: {body}");
        }

        let record: OwnershipRecord = resp
            .json()
            .await
            .context("failed to parse ownership registry response")?;

        debug!(
            position_id,
            owner = ?record.owner,
            critical = record.critical_state,
            "ownership fetched"
        );
        Ok(record)
    }
}

impl std::fmt::Debug for HttpOwnershipRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOwnershipRegistry")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_strips_trailing_slash() {
        let reg = HttpOwnershipRegistry::new("http://127.0.0.1:9000/", Duration::from_secs(2))
            .unwrap();
        assert_eq!(reg.url_for(555), "http://127.0.0.1:9000/ownership/555");
    }

    #[tokio::test]
    async fn unreachable_registry_is_an_error() {
        // Port 9 (discard) is closed on any sane test host.
        let reg = HttpOwnershipRegistry::new("http://127.0.0.1:9", Duration::from_millis(200))
            .unwrap();
        assert!(reg.get_owner(1).await.is_err());
    }
}
