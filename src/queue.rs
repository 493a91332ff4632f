//! Keyed job queue and worker pool.
//!
//! Sync and parse work runs on a fixed number of tokio worker tasks fed from
//! two FIFO lanes: [`Priority::Interactive`] is always drained before
//! [`Priority::Bulk`].
//!
//! # Keys
//!
//! Every job has a [`JobKey`] naming the entity it touches. The queue
//! guarantees:
//!
//! - at most one job per key runs at a time; a runnable job whose key is busy
//!   is skipped until the key frees up;
//! - submitting a job whose key and kind match a queued or running job joins
//!   it: the caller gets a handle to the existing job's outcome. Flags of a
//!   joiner (`force`, `cascade`) are merged into a job that has not started
//!   yet, and an interactive joiner promotes a queued bulk job.
//!
//! # Timeouts
//!
//! A job running longer than the configured timeout is aborted. The handler's
//! [`JobHandler::on_timeout`] hook runs after the task has stopped, then the
//! waiters receive a failed outcome and the key is released.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::JobError;
use crate::parser::ParseResult;
use crate::session::SyncSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Interactive,
    Bulk,
}

/// The entity a job serializes on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobKey {
    Project(String),
    Elevation(String),
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKey::Project(id) => write!(f, "project:{}", id),
            JobKey::Elevation(id) => write!(f, "elevation:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    SyncProject,
    SyncElevation,
    Parse,
}

#[derive(Debug, Clone)]
pub enum Job {
    /// Refresh a project and, when cascading, walk its phases and elevations.
    SyncProject {
        project_id: String,
        cascade: bool,
        force: bool,
        /// The project row was refreshed by the submitter in this session, so
        /// the job need not re-list its directory.
        metadata_fresh: bool,
        /// Lane for the parse jobs this job submits.
        priority: Priority,
        /// Session cancellation; no child jobs are submitted once cancelled.
        /// An interactive joiner's token replaces a bulk submitter's.
        session: CancellationToken,
    },
    /// Refresh one elevation's metadata and parse it if stale.
    SyncElevation {
        elevation_id: String,
        force: bool,
        /// Session cancellation; the parse is skipped once cancelled.
        session: CancellationToken,
    },
    /// Fetch and parse one elevation blob.
    Parse { elevation_id: String, force: bool },
}

impl Job {
    pub fn key(&self) -> JobKey {
        match self {
            Job::SyncProject { project_id, .. } => JobKey::Project(project_id.clone()),
            Job::SyncElevation { elevation_id, .. } | Job::Parse { elevation_id, .. } => {
                JobKey::Elevation(elevation_id.clone())
            }
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Job::SyncProject { .. } => JobKind::SyncProject,
            Job::SyncElevation { .. } => JobKind::SyncElevation,
            Job::Parse { .. } => JobKind::Parse,
        }
    }

    /// Fold the flags of a duplicate submission into this queued job. An
    /// interactive project sync joining a bulk one takes it over: its child
    /// parses move to the interactive lane under the joiner's session.
    fn absorb(&mut self, other: &Job) {
        match (self, other) {
            (
                Job::SyncProject {
                    cascade,
                    force,
                    metadata_fresh,
                    priority,
                    session,
                    ..
                },
                Job::SyncProject {
                    cascade: other_cascade,
                    force: other_force,
                    metadata_fresh: other_fresh,
                    priority: other_priority,
                    session: other_session,
                    ..
                },
            ) => {
                *cascade |= *other_cascade;
                *force |= *other_force;
                *metadata_fresh &= *other_fresh;
                if *priority == Priority::Bulk && *other_priority == Priority::Interactive {
                    *priority = Priority::Interactive;
                    *session = other_session.clone();
                }
            }
            (Job::SyncElevation { force, .. }, Job::SyncElevation { force: other_force, .. })
            | (Job::Parse { force, .. }, Job::Parse { force: other_force, .. }) => {
                *force |= *other_force;
            }
            _ => {}
        }
    }
}

/// Result of a sync job: its own counts plus handles to the parse jobs it
/// submitted, which the caller awaits.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub summary: SyncSummary,
    pub parses: Vec<JobHandle>,
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Sync(Arc<SyncReport>),
    Parse(ParseResult),
    Failed {
        reason: String,
        /// A configuration error; the session should stop.
        fatal: bool,
    },
}

impl JobOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        JobOutcome::Failed {
            reason: reason.into(),
            fatal: false,
        }
    }
}

/// A waiter's view of a submitted job. Cloning shares the same outcome.
#[derive(Clone)]
pub struct JobHandle {
    key: JobKey,
    rx: watch::Receiver<Option<JobOutcome>>,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle").field("key", &self.key).finish()
    }
}

impl JobHandle {
    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub async fn wait(mut self) -> JobOutcome {
        let outcome = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map(|published| (*published).clone());
        match outcome {
            Ok(Some(outcome)) => outcome,
            _ => JobOutcome::failed(JobError::Dropped.to_string()),
        }
    }
}

/// Executes jobs on behalf of the worker pool.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, job: &Job) -> JobOutcome;

    /// Called once a timed-out job's task has been stopped.
    async fn on_timeout(&self, _job: &Job) {}
}

// ═══════════════════════════════════════════════════════════════════════
// Queue
// ═══════════════════════════════════════════════════════════════════════

struct Entry {
    id: u64,
    key: JobKey,
    kind: JobKind,
    job: Job,
    tx: watch::Sender<Option<JobOutcome>>,
}

#[derive(Default)]
struct State {
    interactive: VecDeque<Entry>,
    bulk: VecDeque<Entry>,
    running: HashSet<JobKey>,
    /// Queued or running jobs that new submissions can join.
    active: HashMap<(JobKey, JobKind), (u64, watch::Receiver<Option<JobOutcome>>)>,
    closed: bool,
    next_id: u64,
}

impl State {
    fn merge_into_queued(&mut self, key: &JobKey, kind: JobKind, job: &Job, priority: Priority) {
        if let Some(entry) = self
            .interactive
            .iter_mut()
            .find(|e| e.key == *key && e.kind == kind)
        {
            entry.job.absorb(job);
            return;
        }
        let Some(pos) = self.bulk.iter().position(|e| e.key == *key && e.kind == kind) else {
            return;
        };
        if priority == Priority::Interactive {
            if let Some(mut entry) = self.bulk.remove(pos) {
                entry.job.absorb(job);
                debug!(key = %key, "promoted queued job to interactive");
                self.interactive.push_back(entry);
            }
        } else if let Some(entry) = self.bulk.get_mut(pos) {
            entry.job.absorb(job);
        }
    }

    fn take_runnable(&mut self) -> Option<Entry> {
        let entry = pick(&mut self.interactive, &self.running)
            .or_else(|| pick(&mut self.bulk, &self.running))?;
        self.running.insert(entry.key.clone());
        Some(entry)
    }

    fn pending(&self) -> usize {
        self.interactive.len() + self.bulk.len()
    }
}

fn pick(lane: &mut VecDeque<Entry>, running: &HashSet<JobKey>) -> Option<Entry> {
    let pos = lane.iter().position(|e| !running.contains(&e.key))?;
    lane.remove(pos)
}

#[derive(Default)]
pub struct JobQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a job, or join an identical queued or running one.
    pub async fn submit(&self, job: Job, priority: Priority) -> Result<JobHandle, JobError> {
        let key = job.key();
        let kind = job.kind();

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(JobError::QueueClosed);
        }

        if let Some((_, rx)) = state.active.get(&(key.clone(), kind)) {
            let rx = rx.clone();
            state.merge_into_queued(&key, kind, &job, priority);
            debug!(key = %key, ?kind, "joined in-flight job");
            return Ok(JobHandle { key, rx });
        }

        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = watch::channel(None);
        state.active.insert((key.clone(), kind), (id, rx.clone()));
        let entry = Entry {
            id,
            key: key.clone(),
            kind,
            job,
            tx,
        };
        match priority {
            Priority::Interactive => state.interactive.push_back(entry),
            Priority::Bulk => state.bulk.push_back(entry),
        }
        drop(state);

        self.notify.notify_waiters();
        Ok(JobHandle { key, rx })
    }

    /// Number of queued jobs not yet started.
    pub async fn pending(&self) -> usize {
        self.state.lock().await.pending()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Reject new submissions and fail every job that has not started.
    pub async fn close(&self) {
        let drained: Vec<Entry> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            let mut drained: Vec<Entry> = state.interactive.drain(..).collect();
            drained.extend(state.bulk.drain(..));
            for entry in &drained {
                state.active.remove(&(entry.key.clone(), entry.kind));
            }
            drained
        };
        for entry in drained {
            entry
                .tx
                .send_replace(Some(JobOutcome::failed(JobError::QueueClosed.to_string())));
        }
        self.notify.notify_waiters();
    }

    /// Wait for the next runnable job. Returns `None` on shutdown.
    async fn next(&self, shutdown: &CancellationToken) -> Option<Entry> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.take_runnable() {
                    return Some(entry);
                }
                if state.closed {
                    return None;
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    async fn complete(&self, entry: Entry, outcome: JobOutcome) {
        let Entry {
            id, key, kind, tx, ..
        } = entry;
        {
            let mut state = self.state.lock().await;
            let slot = (key.clone(), kind);
            if state.active.get(&slot).map(|(active_id, _)| *active_id) == Some(id) {
                state.active.remove(&slot);
            }
            state.running.remove(&key);
        }
        tx.send_replace(Some(outcome));
        self.notify.notify_waiters();
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Workers
// ═══════════════════════════════════════════════════════════════════════

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
        workers: usize,
        job_timeout: Duration,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let workers = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    queue.clone(),
                    handler.clone(),
                    job_timeout,
                    shutdown.clone(),
                ))
            })
            .collect();
        Self {
            queue,
            shutdown,
            workers,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Stop accepting work, fail queued jobs and wait for running ones.
    pub async fn shutdown(self) {
        self.queue.close().await;
        self.shutdown.cancel();
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    job_timeout: Duration,
    shutdown: CancellationToken,
) {
    while let Some(entry) = queue.next(&shutdown).await {
        debug!(worker, key = %entry.key, kind = ?entry.kind, "job started");

        let mut task = {
            let handler = handler.clone();
            let job = entry.job.clone();
            tokio::spawn(async move { handler.run(&job).await })
        };

        let outcome = match tokio::time::timeout(job_timeout, &mut task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(worker, key = %entry.key, error = %e, "job task failed");
                JobOutcome::failed(format!("job task failed: {}", e))
            }
            Err(_) => {
                warn!(
                    worker,
                    key = %entry.key,
                    timeout_secs = job_timeout.as_secs(),
                    "job timed out"
                );
                task.abort();
                let _ = task.await;
                handler.on_timeout(&entry.job).await;
                JobOutcome::failed(JobError::TimedOut(job_timeout.as_secs()).to_string())
            }
        };

        debug!(worker, key = %entry.key, "job finished");
        queue.complete(entry, outcome).await;
    }
    debug!(worker, "worker stopped");
}
