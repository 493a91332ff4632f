//! Staleness policy.
//!
//! Applied independently at every level: a stale project does not make its
//! phases stale and a fresh project does not make them fresh.

use chrono::{DateTime, Utc};

/// What the cache knows about an entity's last successful sync.
#[derive(Debug, Clone, Copy, Default)]
pub struct CachedSyncState {
    pub last_sync_date: Option<i64>,
}

impl CachedSyncState {
    pub fn new(last_sync_date: Option<i64>) -> Self {
        Self { last_sync_date }
    }
}

/// Returns `true` when the entity must be refreshed from upstream:
/// - `force` is set;
/// - there is no cached record, or it was never successfully synced;
/// - upstream reports no update date (freshness cannot be shown);
/// - upstream was updated after the last successful sync.
pub fn is_stale(
    cached: Option<&CachedSyncState>,
    upstream_last_update: Option<DateTime<Utc>>,
    force: bool,
) -> bool {
    if force {
        return true;
    }
    let Some(last_sync) = cached.and_then(|c| c.last_sync_date) else {
        return true;
    };
    match upstream_last_update {
        Some(updated) => updated.timestamp_millis() > last_sync,
        None => true,
    }
}
