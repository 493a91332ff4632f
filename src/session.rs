//! Sync summaries and the `sync_sessions` audit table.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{Level, ParseStatus};
use crate::parser::ParseResult;
use crate::store::Change;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LevelCounts {
    pub seen: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub missing: u64,
    pub excluded: u64,
    pub failed: u64,
}

impl LevelCounts {
    pub fn record(&mut self, change: Change) {
        match change {
            Change::Created => self.created += 1,
            Change::Updated => self.updated += 1,
            Change::Unchanged => self.unchanged += 1,
        }
    }

    fn merge(&mut self, other: &LevelCounts) {
        self.seen += other.seen;
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.missing += other.missing;
        self.excluded += other.excluded;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseCounts {
    pub queued: u64,
    pub succeeded: u64,
    pub unchanged: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityFailure {
    pub level: Level,
    pub id: String,
    pub reason: String,
}

/// What a sync session did. Entity failures are collected, not raised; only
/// `aborted` marks a session that stopped early on a configuration error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub session_id: Option<String>,
    pub directories: LevelCounts,
    pub projects: LevelCounts,
    pub phases: LevelCounts,
    pub elevations: LevelCounts,
    pub parses: ParseCounts,
    pub failures: Vec<EntityFailure>,
    pub cancelled: bool,
    pub aborted: Option<String>,
}

impl SyncSummary {
    pub fn level_mut(&mut self, level: Level) -> &mut LevelCounts {
        match level {
            Level::Directory => &mut self.directories,
            Level::Project => &mut self.projects,
            Level::Phase => &mut self.phases,
            Level::Elevation => &mut self.elevations,
        }
    }

    pub fn level(&self, level: Level) -> &LevelCounts {
        match level {
            Level::Directory => &self.directories,
            Level::Project => &self.projects,
            Level::Phase => &self.phases,
            Level::Elevation => &self.elevations,
        }
    }

    pub fn record_failure(&mut self, level: Level, id: &str, reason: impl Into<String>) {
        self.level_mut(level).failed += 1;
        self.failures.push(EntityFailure {
            level,
            id: id.to_string(),
            reason: reason.into(),
        });
    }

    pub fn record_parse(&mut self, result: &ParseResult) {
        match result.status {
            ParseStatus::Success if result.unchanged => self.parses.unchanged += 1,
            ParseStatus::Success => self.parses.succeeded += 1,
            _ => {
                self.parses.failed += 1;
                self.failures.push(EntityFailure {
                    level: Level::Elevation,
                    id: result.elevation_id.clone(),
                    reason: result
                        .reason
                        .clone()
                        .unwrap_or_else(|| "parse failed".to_string()),
                });
            }
        }
    }

    /// Fold a sub-report (one project job) into this summary.
    pub fn merge(&mut self, other: &SyncSummary) {
        self.directories.merge(&other.directories);
        self.projects.merge(&other.projects);
        self.phases.merge(&other.phases);
        self.elevations.merge(&other.elevations);
        self.parses.queued += other.parses.queued;
        self.parses.succeeded += other.parses.succeeded;
        self.parses.unchanged += other.parses.unchanged;
        self.parses.failed += other.parses.failed;
        self.failures.extend(other.failures.iter().cloned());
        self.cancelled |= other.cancelled;
        if self.aborted.is_none() {
            self.aborted = other.aborted.clone();
        }
    }

    pub fn status(&self) -> SessionStatus {
        if self.aborted.is_some() {
            SessionStatus::Aborted
        } else if self.cancelled {
            SessionStatus::Cancelled
        } else if self.failures.is_empty() {
            SessionStatus::Completed
        } else {
            SessionStatus::CompletedWithErrors
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Cancelled,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::CompletedWithErrors => "completed_with_errors",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Aborted => "aborted",
        }
    }
}

/// A row of `sync_sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub scope: String,
    pub forced: bool,
    pub cascading: bool,
    pub status: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

pub async fn begin_session(pool: &SqlitePool, scope: &str, force: bool, cascade: bool) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO sync_sessions (id, scope, forced, cascading, status, started_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(scope)
    .bind(force)
    .bind(cascade)
    .bind(SessionStatus::Running.as_str())
    .bind(Utc::now().timestamp_millis())
    .execute(pool)
    .await?;
    Ok(id)
}

pub async fn finish_session(pool: &SqlitePool, id: &str, summary: &SyncSummary) -> Result<()> {
    let summary_json = serde_json::to_string(summary)?;
    sqlx::query("UPDATE sync_sessions SET status = ?, finished_at = ?, summary_json = ? WHERE id = ?")
        .bind(summary.status().as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(&summary_json)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn latest_session(pool: &SqlitePool) -> Result<Option<SessionRecord>> {
    let row = sqlx::query(
        "SELECT id, scope, forced, cascading, status, started_at, finished_at \
         FROM sync_sessions ORDER BY started_at DESC, rowid DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| SessionRecord {
        id: row.get("id"),
        scope: row.get("scope"),
        forced: row.get("forced"),
        cascading: row.get("cascading"),
        status: row.get("status"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    }))
}
