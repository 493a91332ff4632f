//! The public facade.
//!
//! [`Bridge::open`] connects the cache, runs migrations, resets parses left
//! `in_progress` by a previous process and starts the worker pool. Every
//! trigger and query goes through the returned value; nothing is global.
//!
//! ```rust,no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use elevation_bridge::{load_config, Bridge, SyncScope};
//!
//! let config = load_config(std::path::Path::new("config/bridge.toml"))?;
//! let bridge = Bridge::open_http(config).await?;
//! let summary = bridge.trigger_sync(SyncScope::All, true, false).await;
//! println!("{} projects seen", summary.projects.seen);
//! bridge.shutdown().await;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{validate_config, Config};
use crate::db;
use crate::get::{self, CachedEntity};
use crate::migrate::run_migrations;
use crate::models::{ElevationRecord, ProjectRecord};
use crate::orchestrator::SyncOrchestrator;
use crate::parser::ParseResult;
use crate::queue::{JobQueue, WorkerPool};
use crate::session::SyncSummary;
use crate::stats::{cache_stats, CacheStats};
use crate::upstream::Upstream;
use crate::upstream_http::HttpUpstream;

/// What a sync trigger covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum SyncScope {
    All,
    Project(String),
    Elevation(String),
}

pub struct Bridge {
    pool: SqlitePool,
    orchestrator: Arc<SyncOrchestrator>,
    workers: Mutex<Option<WorkerPool>>,
    cancel: CancellationToken,
}

impl Bridge {
    /// Open the bridge against an arbitrary upstream.
    pub async fn open(config: Config, upstream: Arc<dyn Upstream>) -> Result<Self> {
        validate_config(&config)?;
        let pool = db::connect(&config).await?;
        run_migrations(&pool).await?;

        let config = Arc::new(config);
        let queue = Arc::new(JobQueue::new());
        let orchestrator = Arc::new(SyncOrchestrator::new(
            config.clone(),
            pool.clone(),
            upstream.clone(),
            queue.clone(),
        ));
        orchestrator.recover().await?;

        let workers = WorkerPool::start(
            queue,
            orchestrator.clone(),
            config.sync.workers,
            config.sync.job_timeout(),
        );
        info!(
            upstream = upstream.name(),
            db = %config.db.path.display(),
            workers = config.sync.workers,
            "bridge started"
        );

        Ok(Self {
            pool,
            orchestrator,
            workers: Mutex::new(Some(workers)),
            cancel: CancellationToken::new(),
        })
    }

    /// Open the bridge against the REST upstream named in `config`.
    pub async fn open_http(config: Config) -> Result<Self> {
        let upstream = Arc::new(HttpUpstream::new(&config.upstream)?);
        Self::open(config, upstream).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run a sync session and return its summary. Entity failures are in the
    /// summary; this never fails as a whole.
    ///
    /// `cascade` only applies to [`SyncScope::All`] and
    /// [`SyncScope::Project`].
    pub async fn trigger_sync(&self, scope: SyncScope, cascade: bool, force: bool) -> SyncSummary {
        self.trigger_sync_with(scope, cascade, force, &CancellationToken::new())
            .await
    }

    /// [`trigger_sync`](Self::trigger_sync) with a caller-held cancellation
    /// token. Cancelling it, or shutting the bridge down, stops the session
    /// from submitting further jobs; jobs already submitted still complete
    /// and are counted.
    pub async fn trigger_sync_with(
        &self,
        scope: SyncScope,
        cascade: bool,
        force: bool,
        cancel: &CancellationToken,
    ) -> SyncSummary {
        let session = self.cancel.child_token();
        if cancel.is_cancelled() {
            session.cancel();
        }
        let relay = {
            let caller = cancel.clone();
            let session = session.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = caller.cancelled() => session.cancel(),
                    _ = session.cancelled() => {}
                }
            })
        };

        let summary = match scope {
            SyncScope::All => self.orchestrator.sync_all(force, cascade, &session).await,
            SyncScope::Project(id) => {
                self.orchestrator
                    .sync_project(&id, cascade, force, &session)
                    .await
            }
            SyncScope::Elevation(id) => self.orchestrator.sync_elevation(&id, force, &session).await,
        };
        relay.abort();
        summary
    }

    pub async fn trigger_parse(&self, elevation_id: &str, force: bool) -> ParseResult {
        self.orchestrator.trigger_parse(elevation_id, force).await
    }

    pub async fn get_entity(&self, id: &str) -> Result<CachedEntity> {
        get::get_entity(self.orchestrator.store(), id).await
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectRecord>> {
        get::list_projects(self.orchestrator.store()).await
    }

    pub async fn list_elevations(&self, project_id: &str) -> Result<Vec<ElevationRecord>> {
        get::list_elevations(self.orchestrator.store(), project_id).await
    }

    /// Set (`Some`) or clear (`None`) the local exclusion override of a
    /// cached directory. Returns `false` if the directory is unknown.
    pub async fn set_directory_exclusion(&self, directory_id: &str, exclude: Option<bool>) -> Result<bool> {
        let found = self
            .orchestrator
            .store()
            .set_directory_override(directory_id, exclude)
            .await?;
        if found {
            info!(directory = directory_id, ?exclude, "directory exclusion override set");
        }
        Ok(found)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        cache_stats(self.orchestrator.store()).await
    }

    /// Cancel running sessions, fail queued jobs, wait for running jobs and
    /// close the cache.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(workers) = self.workers.lock().await.take() {
            workers.shutdown().await;
        }
        self.pool.close().await;
        info!("bridge stopped");
    }
}
