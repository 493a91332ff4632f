//! Sync orchestration across the four hierarchy levels.
//!
//! # Full sync
//!
//! ```text
//! list_directories ──▶ upsert ──▶ exclusion filter
//!        │
//!        ▼  (per syncable directory, on the caller's task)
//! list_projects ──▶ reconcile ──▶ SyncProject jobs (bulk lane)
//!                                      │
//!                                      ▼  (worker)
//!                   list_phases ──▶ reconcile ──▶ list_elevations ──▶ reconcile
//!                                                                   │ stale
//!                                                                   ▼
//!                                                           Parse jobs (bulk lane)
//! ```
//!
//! The caller collects every job outcome, then every parse outcome, into one
//! [`SyncSummary`]. Sync jobs never wait on the parse jobs they submit, so a
//! small worker pool cannot deadlock on its own children.
//!
//! # Failure handling
//!
//! - Transient upstream errors are retried by [`with_retry`]; exhaustion fails
//!   the one entity, which is recorded on its row and in the summary.
//! - A configuration error (unauthorized, unreachable) aborts the session:
//!   the session token is cancelled and no further jobs are submitted.
//! - Rows missing from an upstream listing are flagged, never deleted.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::UpstreamError;
use crate::exclusion::ExclusionFilter;
use crate::models::{Level, ProjectRecord};
use crate::parser::{ParseResult, Parser};
use crate::queue::{Job, JobHandle, JobHandler, JobKey, JobOutcome, JobQueue, Priority, SyncReport};
use crate::session::{begin_session, finish_session, SyncSummary};
use crate::store::{Change, ChildRow, Store};
use crate::upstream::{with_retry, Upstream, UpstreamEntity};

/// A child row after reconciliation against upstream.
struct Reconciled {
    id: String,
    external_id: String,
    change: Change,
}

pub struct SyncOrchestrator {
    config: Arc<Config>,
    store: Store,
    parser: Parser,
    upstream: Arc<dyn Upstream>,
    queue: Arc<JobQueue>,
}

impl SyncOrchestrator {
    pub fn new(
        config: Arc<Config>,
        pool: SqlitePool,
        upstream: Arc<dyn Upstream>,
        queue: Arc<JobQueue>,
    ) -> Self {
        Self {
            config,
            store: Store::new(pool.clone()),
            parser: Parser::new(pool),
            upstream,
            queue,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Reset parses left `in_progress` by a previous process.
    pub async fn recover(&self) -> Result<u64> {
        let reset = self.parser.idempotency().recover_in_progress().await?;
        if reset > 0 {
            info!(reset, "reset interrupted parses to pending");
        }
        Ok(reset)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Entry points
    // ═══════════════════════════════════════════════════════════════════════

    /// Sync every syncable directory. Runs on the caller's task; `cancel`
    /// stops further submissions, already-submitted jobs run to completion.
    pub async fn sync_all(&self, force: bool, cascade: bool, cancel: &CancellationToken) -> SyncSummary {
        let mut summary = SyncSummary::default();
        let session_id = self.open_session("all", force, cascade).await;
        summary.session_id = session_id.clone();

        let session = cancel.child_token();
        let timer = self.arm_session_timeout(&session);

        let handles = self.refresh_tree(force, cascade, &session, &mut summary).await;
        self.collect(handles, &session, &mut summary).await;

        timer.abort();
        self.close_session(session_id.as_deref(), &session, &mut summary).await;
        summary
    }

    /// Sync one project. Unknown or excluded projects fail without any
    /// upstream call.
    pub async fn sync_project(
        &self,
        project_id: &str,
        cascade: bool,
        force: bool,
        cancel: &CancellationToken,
    ) -> SyncSummary {
        let scope = JobKey::Project(project_id.to_string()).to_string();
        let mut summary = SyncSummary::default();
        let session_id = self.open_session(&scope, force, cascade).await;
        summary.session_id = session_id.clone();

        let session = cancel.child_token();
        let timer = self.arm_session_timeout(&session);
        let job = Job::SyncProject {
            project_id: project_id.to_string(),
            cascade,
            force,
            metadata_fresh: false,
            priority: Priority::Interactive,
            session: session.clone(),
        };
        let handles = self.submit_or_record(job, Priority::Interactive, &mut summary).await;
        self.collect(handles, &session, &mut summary).await;

        timer.abort();
        self.close_session(session_id.as_deref(), &session, &mut summary).await;
        summary
    }

    /// Refresh one elevation's metadata and parse it if stale.
    pub async fn sync_elevation(&self, elevation_id: &str, force: bool, cancel: &CancellationToken) -> SyncSummary {
        let scope = JobKey::Elevation(elevation_id.to_string()).to_string();
        let mut summary = SyncSummary::default();
        let session_id = self.open_session(&scope, force, false).await;
        summary.session_id = session_id.clone();

        let session = cancel.child_token();
        let timer = self.arm_session_timeout(&session);
        let job = Job::SyncElevation {
            elevation_id: elevation_id.to_string(),
            force,
            session: session.clone(),
        };
        let handles = self.submit_or_record(job, Priority::Interactive, &mut summary).await;
        self.collect(handles, &session, &mut summary).await;

        timer.abort();
        self.close_session(session_id.as_deref(), &session, &mut summary).await;
        summary
    }

    /// Parse one elevation now. Concurrent requests for the same elevation
    /// share one execution.
    pub async fn trigger_parse(&self, elevation_id: &str, force: bool) -> ParseResult {
        let job = Job::Parse {
            elevation_id: elevation_id.to_string(),
            force,
        };
        let handle = match self.queue.submit(job, Priority::Interactive).await {
            Ok(handle) => handle,
            Err(e) => return ParseResult::failed(elevation_id, None, e.to_string()),
        };
        match handle.wait().await {
            JobOutcome::Parse(result) => result,
            JobOutcome::Failed { reason, .. } => ParseResult::failed(elevation_id, None, reason),
            JobOutcome::Sync(_) => ParseResult::failed(elevation_id, None, "unexpected sync outcome"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Caller-side session work
    // ═══════════════════════════════════════════════════════════════════════

    /// Refresh directories and projects, then submit one cascading job per
    /// project. Returns the submitted handles.
    async fn refresh_tree(
        &self,
        force: bool,
        cascade: bool,
        session: &CancellationToken,
        summary: &mut SyncSummary,
    ) -> Vec<JobHandle> {
        let upstream = &self.upstream;
        let listed = match with_retry(&self.config.sync, "list_directories", move || {
            upstream.list_directories()
        })
        .await
        {
            Ok(listed) => listed,
            Err(e) => {
                error!(error = %e, "cannot list directories, aborting session");
                abort(summary, session, e.to_string());
                return Vec::new();
            }
        };

        summary.directories.seen = listed.len() as u64;
        for dir in &listed {
            match self.store.upsert_directory(dir, force).await {
                Ok(change) => summary.directories.record(change),
                Err(e) => summary.record_failure(Level::Directory, &dir.id, e.to_string()),
            }
        }

        let records = match self.store.load_directories().await {
            Ok(records) => records,
            Err(e) => {
                abort(summary, session, format!("cache unavailable: {}", e));
                return Vec::new();
            }
        };
        let listed_ids: HashSet<&str> = listed.iter().map(|d| d.id.as_str()).collect();
        summary.directories.missing = records
            .iter()
            .filter(|r| !listed_ids.contains(r.id.as_str()))
            .count() as u64;

        let filter = ExclusionFilter::from_records(&records);
        let mut handles = Vec::new();
        for record in records.iter().filter(|r| listed_ids.contains(r.id.as_str())) {
            if !filter.is_syncable(&record.id) {
                debug!(directory = %record.path, "directory excluded from sync");
                summary.directories.excluded += 1;
                continue;
            }
            if session.is_cancelled() {
                break;
            }

            let projects = match self.refresh_projects(&record.id, force, summary).await {
                Ok(projects) => projects,
                Err(e) if e.is_fatal() => {
                    abort(summary, session, e.to_string());
                    break;
                }
                Err(e) => {
                    summary.record_failure(Level::Directory, &record.id, e.to_string());
                    continue;
                }
            };
            if !cascade {
                continue;
            }

            for project in projects {
                if session.is_cancelled() {
                    break;
                }
                let job = Job::SyncProject {
                    project_id: project.id,
                    cascade: true,
                    force,
                    metadata_fresh: true,
                    priority: Priority::Bulk,
                    session: session.clone(),
                };
                handles.extend(self.submit_or_record(job, Priority::Bulk, summary).await);
            }
        }

        info!(
            directories = summary.directories.seen,
            excluded = summary.directories.excluded,
            projects = summary.projects.seen,
            jobs = handles.len(),
            "directory pass complete"
        );
        handles
    }

    async fn refresh_projects(
        &self,
        directory_id: &str,
        force: bool,
        summary: &mut SyncSummary,
    ) -> Result<Vec<Reconciled>, UpstreamError> {
        let upstream = &self.upstream;
        let listed = with_retry(&self.config.sync, "list_projects", move || {
            upstream.list_projects(directory_id)
        })
        .await?;
        Ok(self
            .reconcile(Level::Project, directory_id, &listed, force, summary)
            .await)
    }

    /// Await sync jobs, then the parse jobs they submitted.
    async fn collect(
        &self,
        handles: impl IntoIterator<Item = JobHandle>,
        session: &CancellationToken,
        summary: &mut SyncSummary,
    ) {
        let mut parses = Vec::new();
        for handle in handles {
            let key = handle.key().clone();
            match handle.wait().await {
                JobOutcome::Sync(report) => {
                    summary.merge(&report.summary);
                    if report.summary.aborted.is_some() {
                        session.cancel();
                    }
                    parses.extend(report.parses.iter().cloned());
                }
                JobOutcome::Parse(result) => summary.record_parse(&result),
                JobOutcome::Failed { reason, fatal } => {
                    if fatal {
                        abort(summary, session, reason.clone());
                    }
                    let (level, id) = key_entity(&key);
                    summary.record_failure(level, id, reason);
                }
            }
        }

        for handle in parses {
            let key = handle.key().clone();
            let result = match handle.wait().await {
                JobOutcome::Parse(result) => result,
                JobOutcome::Failed { reason, fatal } => {
                    if fatal {
                        abort(summary, session, reason.clone());
                    }
                    ParseResult::failed(key_entity(&key).1, None, reason)
                }
                JobOutcome::Sync(_) => ParseResult::failed(key_entity(&key).1, None, "unexpected sync outcome"),
            };
            summary.record_parse(&result);
        }
    }

    async fn submit_or_record(&self, job: Job, priority: Priority, summary: &mut SyncSummary) -> Option<JobHandle> {
        let key = job.key();
        match self.queue.submit(job, priority).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                let (level, id) = key_entity(&key);
                summary.record_failure(level, id, e.to_string());
                None
            }
        }
    }

    fn arm_session_timeout(&self, session: &CancellationToken) -> JoinHandle<()> {
        let token = session.clone();
        let limit = self.config.sync.session_timeout();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(limit) => {
                    warn!(timeout_secs = limit.as_secs(), "sync session timed out, cancelling");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        })
    }

    async fn open_session(&self, scope: &str, force: bool, cascade: bool) -> Option<String> {
        match begin_session(self.store.pool(), scope, force, cascade).await {
            Ok(id) => {
                info!(session = %id, scope, force, cascade, "sync session started");
                Some(id)
            }
            Err(e) => {
                warn!(error = %e, scope, "could not record sync session");
                None
            }
        }
    }

    async fn close_session(&self, id: Option<&str>, session: &CancellationToken, summary: &mut SyncSummary) {
        if session.is_cancelled() && summary.aborted.is_none() {
            summary.cancelled = true;
        }
        info!(
            session = id.unwrap_or("-"),
            status = summary.status().as_str(),
            projects = summary.projects.seen,
            phases = summary.phases.seen,
            elevations = summary.elevations.seen,
            parsed = summary.parses.succeeded,
            unchanged = summary.parses.unchanged,
            failures = summary.failures.len(),
            "sync session finished"
        );
        if let Some(id) = id {
            if let Err(e) = finish_session(self.store.pool(), id, summary).await {
                warn!(error = %e, session = id, "could not record sync session result");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reconciliation
    // ═══════════════════════════════════════════════════════════════════════

    /// Diff one upstream listing against the cached children of `parent_id`:
    /// insert new rows, refresh stale ones, flag the ones upstream dropped.
    async fn reconcile(
        &self,
        level: Level,
        parent_id: &str,
        listed: &[UpstreamEntity],
        force: bool,
        summary: &mut SyncSummary,
    ) -> Vec<Reconciled> {
        let cached = match self.store.list_children(level, parent_id).await {
            Ok(cached) => cached,
            Err(e) => {
                summary.record_failure(level, parent_id, e.to_string());
                return Vec::new();
            }
        };
        let mut remaining: HashMap<String, ChildRow> = cached
            .into_iter()
            .map(|row| (row.external_id.clone(), row))
            .collect();

        let mut reconciled = Vec::with_capacity(listed.len());
        for entity in listed {
            summary.level_mut(level).seen += 1;

            let (existing, moved) = match remaining.remove(&entity.id) {
                Some(row) => (Some(row), false),
                None if level == Level::Project => match self.store.find_child(level, parent_id, &entity.id).await {
                    Ok(row) => {
                        let moved = row.is_some();
                        (row, moved)
                    }
                    Err(e) => {
                        summary.record_failure(level, &entity.id, e.to_string());
                        continue;
                    }
                },
                None => (None, false),
            };

            match self.apply(level, parent_id, entity, existing.as_ref(), moved, force).await {
                Ok((id, change)) => {
                    summary.level_mut(level).record(change);
                    reconciled.push(Reconciled {
                        id,
                        external_id: entity.id.clone(),
                        change,
                    });
                }
                Err(e) => summary.record_failure(level, &entity.id, e.to_string()),
            }
        }

        for row in remaining.into_values() {
            match self.store.mark_missing(level, &row.id).await {
                Ok(()) => {
                    debug!(%level, id = %row.id, external_id = %row.external_id, "missing from upstream");
                    summary.level_mut(level).missing += 1;
                }
                Err(e) => summary.record_failure(level, &row.id, e.to_string()),
            }
        }
        reconciled
    }

    async fn apply(
        &self,
        level: Level,
        parent_id: &str,
        entity: &UpstreamEntity,
        existing: Option<&ChildRow>,
        moved: bool,
        force: bool,
    ) -> Result<(String, Change)> {
        let Some(row) = existing else {
            let id = self.store.insert_child(level, parent_id, entity).await?;
            return Ok((id, Change::Created));
        };
        if moved || row.needs_refresh(entity, force) {
            self.store.update_child(level, &row.id, parent_id, entity).await?;
            Ok((row.id.clone(), Change::Updated))
        } else {
            Ok((row.id.clone(), Change::Unchanged))
        }
    }

    async fn directory_syncable(&self, directory_id: &str) -> Result<bool> {
        let records = self.store.load_directories().await?;
        Ok(ExclusionFilter::from_records(&records).is_syncable(directory_id))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Worker-side jobs
    // ═══════════════════════════════════════════════════════════════════════

    async fn run_sync_project(
        &self,
        project_id: &str,
        cascade: bool,
        force: bool,
        metadata_fresh: bool,
        priority: Priority,
        session: &CancellationToken,
    ) -> JobOutcome {
        let project = match self.store.get_project(project_id).await {
            Ok(Some(project)) => project,
            Ok(None) => return JobOutcome::failed(format!("project {} not found in cache", project_id)),
            Err(e) => return JobOutcome::failed(e.to_string()),
        };
        match self.directory_syncable(&project.directory_id).await {
            Ok(true) => {}
            Ok(false) => {
                return JobOutcome::failed(format!(
                    "project {} is under a directory excluded from sync",
                    project_id
                ))
            }
            Err(e) => return JobOutcome::failed(e.to_string()),
        }

        let mut report = SyncReport::default();
        if !metadata_fresh {
            match self.refresh_project_row(&project, force, &mut report.summary).await {
                Ok(true) => {}
                Ok(false) => return JobOutcome::Sync(Arc::new(report)),
                Err(e) => {
                    self.record_sync_error(Level::Project, &project.id, &e).await;
                    return JobOutcome::Failed {
                        reason: e.to_string(),
                        fatal: e.is_fatal(),
                    };
                }
            }
        }

        if cascade {
            if let Err(e) = self.walk_project(&project, force, priority, session, &mut report).await {
                if e.is_fatal() {
                    report.summary.aborted = Some(e.to_string());
                } else {
                    self.record_sync_error(Level::Project, &project.id, &e).await;
                    report.summary.record_failure(Level::Project, &project.id, e.to_string());
                }
            }
        }

        debug!(
            project = %project.id,
            phases = report.summary.phases.seen,
            elevations = report.summary.elevations.seen,
            parses = report.parses.len(),
            "project sync finished"
        );
        JobOutcome::Sync(Arc::new(report))
    }

    /// Re-list the project's directory and refresh its row. Returns `false`
    /// when upstream no longer lists the project.
    async fn refresh_project_row(
        &self,
        project: &ProjectRecord,
        force: bool,
        summary: &mut SyncSummary,
    ) -> Result<bool, UpstreamError> {
        let upstream = &self.upstream;
        let directory_id = project.directory_id.as_str();
        let listed = with_retry(&self.config.sync, "list_projects", move || {
            upstream.list_projects(directory_id)
        })
        .await?;

        let Some(entity) = listed.iter().find(|e| e.id == project.external_id) else {
            match self.store.mark_missing(Level::Project, &project.id).await {
                Ok(()) => summary.projects.missing += 1,
                Err(e) => summary.record_failure(Level::Project, &project.id, e.to_string()),
            }
            return Ok(false);
        };

        summary.projects.seen += 1;
        let row = ChildRow {
            id: project.id.clone(),
            external_id: project.external_id.clone(),
            last_sync_date: project.last_sync_date,
            sync_status: project.sync_status,
        };
        match self.apply(Level::Project, directory_id, entity, Some(&row), false, force).await {
            Ok((_, change)) => summary.projects.record(change),
            Err(e) => summary.record_failure(Level::Project, &project.id, e.to_string()),
        }
        Ok(true)
    }

    /// Walk every phase and elevation under the project, submitting parse
    /// jobs for stale elevations. Children are judged independently of the
    /// project's own staleness.
    async fn walk_project(
        &self,
        project: &ProjectRecord,
        force: bool,
        priority: Priority,
        session: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<(), UpstreamError> {
        let upstream = &self.upstream;
        let project_ref = project.external_id.as_str();
        let listed = with_retry(&self.config.sync, "list_phases", move || {
            upstream.list_phases(project_ref)
        })
        .await?;

        let phases = self
            .reconcile(Level::Phase, &project.id, &listed, force, &mut report.summary)
            .await;

        for phase in phases {
            if session.is_cancelled() {
                report.summary.cancelled = true;
                break;
            }

            let phase_ref = phase.external_id.as_str();
            let listed = match with_retry(&self.config.sync, "list_elevations", move || {
                upstream.list_elevations(phase_ref)
            })
            .await
            {
                Ok(listed) => listed,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.record_sync_error(Level::Phase, &phase.id, &e).await;
                    report.summary.record_failure(Level::Phase, &phase.id, e.to_string());
                    continue;
                }
            };

            let elevations = self
                .reconcile(Level::Elevation, &phase.id, &listed, force, &mut report.summary)
                .await;
            for elevation in elevations.into_iter().filter(|e| e.change != Change::Unchanged) {
                if session.is_cancelled() {
                    report.summary.cancelled = true;
                    break;
                }
                let job = Job::Parse {
                    elevation_id: elevation.id,
                    force,
                };
                if let Some(handle) = self.submit_or_record(job, priority, &mut report.summary).await {
                    report.summary.parses.queued += 1;
                    report.parses.push(handle);
                }
            }
        }
        Ok(())
    }

    async fn run_sync_elevation(&self, elevation_id: &str, force: bool, session: &CancellationToken) -> JobOutcome {
        let ctx = match self.store.elevation_context(elevation_id).await {
            Ok(Some(ctx)) => ctx,
            Ok(None) => return JobOutcome::failed(format!("elevation {} not found in cache", elevation_id)),
            Err(e) => return JobOutcome::failed(e.to_string()),
        };
        match self.directory_syncable(&ctx.directory_id).await {
            Ok(true) => {}
            Ok(false) => {
                return JobOutcome::failed(format!(
                    "elevation {} is under a directory excluded from sync",
                    elevation_id
                ))
            }
            Err(e) => return JobOutcome::failed(e.to_string()),
        }

        let upstream = &self.upstream;
        let phase_ref = ctx.phase_external_id.as_str();
        let listed = match with_retry(&self.config.sync, "list_elevations", move || {
            upstream.list_elevations(phase_ref)
        })
        .await
        {
            Ok(listed) => listed,
            Err(e) => {
                self.record_sync_error(Level::Elevation, elevation_id, &e).await;
                return JobOutcome::Failed {
                    reason: e.to_string(),
                    fatal: e.is_fatal(),
                };
            }
        };

        let mut report = SyncReport::default();
        let summary = &mut report.summary;
        let Some(entity) = listed.iter().find(|e| e.id == ctx.external_id) else {
            match self.store.mark_missing(Level::Elevation, elevation_id).await {
                Ok(()) => summary.elevations.missing += 1,
                Err(e) => summary.record_failure(Level::Elevation, elevation_id, e.to_string()),
            }
            return JobOutcome::Sync(Arc::new(report));
        };

        summary.elevations.seen += 1;
        let row = match self.store.find_child(Level::Elevation, &ctx.phase_id, &ctx.external_id).await {
            Ok(row) => row,
            Err(e) => return JobOutcome::failed(e.to_string()),
        };
        let change = match self
            .apply(Level::Elevation, &ctx.phase_id, entity, row.as_ref(), false, force)
            .await
        {
            Ok((_, change)) => change,
            Err(e) => return JobOutcome::failed(e.to_string()),
        };
        summary.elevations.record(change);

        if change != Change::Unchanged && session.is_cancelled() {
            summary.cancelled = true;
        } else if change != Change::Unchanged {
            // Parsed inline: this job already holds the elevation's key.
            summary.parses.queued += 1;
            match self.run_parse(elevation_id, force).await {
                JobOutcome::Parse(result) => summary.record_parse(&result),
                JobOutcome::Failed { reason, fatal } => {
                    summary.record_parse(&ParseResult::failed(elevation_id, None, reason.clone()));
                    if fatal {
                        summary.aborted = Some(reason);
                    }
                }
                JobOutcome::Sync(_) => {}
            }
        }
        JobOutcome::Sync(Arc::new(report))
    }

    /// Fetch an elevation's blob and run it through the parser.
    async fn run_parse(&self, elevation_id: &str, force: bool) -> JobOutcome {
        let ctx = match self.store.elevation_context(elevation_id).await {
            Ok(Some(ctx)) => ctx,
            Ok(None) => return JobOutcome::failed(format!("elevation {} not found in cache", elevation_id)),
            Err(e) => return JobOutcome::failed(e.to_string()),
        };

        let upstream = &self.upstream;
        let blob_ref = ctx.external_id.as_str();
        let bytes = match with_retry(&self.config.sync, "fetch_blob", move || upstream.fetch_blob(blob_ref)).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(elevation = %elevation_id, error = %e, "blob fetch failed");
                self.record_sync_error(Level::Elevation, elevation_id, &e).await;
                return JobOutcome::Failed {
                    reason: e.to_string(),
                    fatal: e.is_fatal(),
                };
            }
        };

        let result = match self.parser.parse(elevation_id, &bytes, force).await {
            Ok(result) => result,
            Err(e) => {
                error!(elevation = %elevation_id, error = %e, "parse pipeline failed");
                return JobOutcome::failed(e.to_string());
            }
        };

        if let Err(e) = self.store.mark_elevation_synced(elevation_id).await {
            warn!(elevation = %elevation_id, error = %e, "could not record elevation sync");
        }
        JobOutcome::Parse(result)
    }

    async fn record_sync_error(&self, level: Level, id: &str, err: &UpstreamError) {
        if let Err(e) = self.store.mark_sync_error(level, id, &err.to_string()).await {
            warn!(%level, id, error = %e, "could not record sync error");
        }
    }
}

#[async_trait]
impl JobHandler for SyncOrchestrator {
    async fn run(&self, job: &Job) -> JobOutcome {
        match job {
            Job::SyncProject {
                project_id,
                cascade,
                force,
                metadata_fresh,
                priority,
                session,
            } => {
                self.run_sync_project(project_id, *cascade, *force, *metadata_fresh, *priority, session)
                    .await
            }
            Job::SyncElevation {
                elevation_id,
                force,
                session,
            } => self.run_sync_elevation(elevation_id, *force, session).await,
            Job::Parse { elevation_id, force } => self.run_parse(elevation_id, *force).await,
        }
    }

    async fn on_timeout(&self, job: &Job) {
        let elevation_id = match job {
            Job::SyncElevation { elevation_id, .. } | Job::Parse { elevation_id, .. } => elevation_id,
            Job::SyncProject { .. } => return,
        };
        match self
            .parser
            .idempotency()
            .fail_if_in_progress(elevation_id, "parse timed out")
            .await
        {
            Ok(true) => warn!(elevation = %elevation_id, "timed-out parse marked failed"),
            Ok(false) => {}
            Err(e) => warn!(elevation = %elevation_id, error = %e, "could not record parse timeout"),
        }
    }
}

fn abort(summary: &mut SyncSummary, session: &CancellationToken, reason: String) {
    if summary.aborted.is_none() {
        summary.aborted = Some(reason);
    }
    session.cancel();
}

fn key_entity(key: &JobKey) -> (Level, &str) {
    match key {
        JobKey::Project(id) => (Level::Project, id),
        JobKey::Elevation(id) => (Level::Elevation, id),
    }
}
