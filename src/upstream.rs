//! The upstream collaborator.
//!
//! The bridge consumes a remote hierarchy through the [`Upstream`] trait.
//! [`HttpUpstream`](crate::upstream_http::HttpUpstream) is the production
//! implementation; tests and embedding applications can supply their own.
//!
//! # Lifecycle
//!
//! 1. The orchestrator calls [`list_directories`](Upstream::list_directories)
//!    once per full sync session.
//! 2. For every syncable directory it calls
//!    [`list_projects`](Upstream::list_projects), then walks
//!    [`list_phases`](Upstream::list_phases) and
//!    [`list_elevations`](Upstream::list_elevations) for cascading syncs.
//! 3. Parse jobs call [`fetch_blob`](Upstream::fetch_blob) only for stale
//!    elevations.
//!
//! Every call goes through [`with_retry`], which retries
//! [`UpstreamError::Transient`] failures with bounded exponential backoff.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::warn;

use crate::config::SyncConfig;
use crate::error::UpstreamError;

/// A directory node as reported by upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamDirectory {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub exclude_from_sync: bool,
    #[serde(default)]
    pub last_update_date: Option<DateTime<Utc>>,
}

/// A project, phase or elevation summary as reported by upstream.
///
/// `id` is the identifier the cache diffs on and passes back to upstream;
/// `external_id` is the source system's own reference (e.g. a project
/// number) and is stored for display only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamEntity {
    pub id: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_update_date: Option<DateTime<Utc>>,
}

/// Read access to the remote hierarchy.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Label used in logs.
    fn name(&self) -> &str {
        "upstream"
    }

    async fn list_directories(&self) -> Result<Vec<UpstreamDirectory>, UpstreamError>;

    async fn list_projects(&self, directory_id: &str) -> Result<Vec<UpstreamEntity>, UpstreamError>;

    async fn list_phases(&self, project_id: &str) -> Result<Vec<UpstreamEntity>, UpstreamError>;

    async fn list_elevations(&self, phase_id: &str) -> Result<Vec<UpstreamEntity>, UpstreamError>;

    /// Raw bytes of the elevation's embedded database.
    async fn fetch_blob(&self, elevation_id: &str) -> Result<Vec<u8>, UpstreamError>;
}

/// Run `op`, retrying transient failures up to `sync.max_retries` times with
/// the configured backoff. Non-transient errors return immediately.
pub async fn with_retry<T, F, Fut>(
    sync: &SyncConfig,
    what: &str,
    mut op: F,
) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < sync.max_retries => {
                attempt += 1;
                let delay = sync.backoff_delay(attempt);
                warn!(
                    operation = what,
                    attempt,
                    max_retries = sync.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "upstream call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
