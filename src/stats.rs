//! Cache statistics and health overview.
//!
//! Row counts per level, parse-status breakdown, average data quality and
//! the most recent sync session. The [`Display`](std::fmt::Display) impl
//! renders the same report as a plain-text table.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::fmt;

use crate::exclusion::ExclusionFilter;
use crate::session::{latest_session, SessionRecord};
use crate::store::Store;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ParseBreakdown {
    pub pending: i64,
    pub in_progress: i64,
    pub success: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub directories: i64,
    pub excluded_directories: i64,
    pub projects: i64,
    pub phases: i64,
    pub elevations: i64,
    pub glass_specifications: i64,
    /// Rows currently flagged with a sync error, across levels.
    pub sync_errors: i64,
    pub parses: ParseBreakdown,
    pub average_quality: Option<f64>,
    pub last_session: Option<SessionRecord>,
}

pub async fn cache_stats(store: &Store) -> Result<CacheStats> {
    let pool = store.pool();

    let directories = store.load_directories().await?;
    let filter = ExclusionFilter::from_records(&directories);

    let mut parses = ParseBreakdown::default();
    let rows = sqlx::query("SELECT parse_status, COUNT(*) AS n FROM elevations GROUP BY parse_status")
        .fetch_all(pool)
        .await?;
    for row in &rows {
        let status: String = row.get("parse_status");
        let n: i64 = row.get("n");
        match status.as_str() {
            "pending" => parses.pending = n,
            "in_progress" => parses.in_progress = n,
            "success" => parses.success = n,
            "failed" => parses.failed = n,
            _ => {}
        }
    }

    let average_quality: Option<f64> = sqlx::query_scalar(
        "SELECT AVG(data_quality_score) FROM elevations WHERE data_quality_score IS NOT NULL",
    )
    .fetch_one(pool)
    .await?;

    let sync_errors = count(
        pool,
        "SELECT (SELECT COUNT(*) FROM projects WHERE sync_status = 'error') \
         + (SELECT COUNT(*) FROM phases WHERE sync_status = 'error') \
         + (SELECT COUNT(*) FROM elevations WHERE sync_status = 'error')",
    )
    .await?;

    Ok(CacheStats {
        directories: directories.len() as i64,
        excluded_directories: filter.excluded_count() as i64,
        projects: count(pool, "SELECT COUNT(*) FROM projects").await?,
        phases: count(pool, "SELECT COUNT(*) FROM phases").await?,
        elevations: count(pool, "SELECT COUNT(*) FROM elevations").await?,
        glass_specifications: count(pool, "SELECT COUNT(*) FROM glass_specifications").await?,
        sync_errors,
        parses,
        average_quality,
        last_session: latest_session(pool).await?,
    })
}

async fn count(pool: &SqlitePool, sql: &str) -> Result<i64> {
    Ok(sqlx::query_scalar(sql).fetch_one(pool).await?)
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Elevation Bridge: Cache Stats")?;
        writeln!(f, "=============================")?;
        writeln!(f)?;
        writeln!(
            f,
            "  Directories:  {} ({} not syncable)",
            self.directories, self.excluded_directories
        )?;
        writeln!(f, "  Projects:     {}", self.projects)?;
        writeln!(f, "  Phases:       {}", self.phases)?;
        writeln!(f, "  Elevations:   {}", self.elevations)?;
        writeln!(f, "  Glass specs:  {}", self.glass_specifications)?;
        writeln!(f, "  Sync errors:  {}", self.sync_errors)?;
        writeln!(f)?;
        writeln!(
            f,
            "  Parses:       {} ok, {} failed, {} pending, {} running",
            self.parses.success, self.parses.failed, self.parses.pending, self.parses.in_progress
        )?;
        match self.average_quality {
            Some(avg) => writeln!(f, "  Avg quality:  {:.1}", avg)?,
            None => writeln!(f, "  Avg quality:  -")?,
        }
        match &self.last_session {
            Some(session) => writeln!(
                f,
                "  Last sync:    {} ({}, {})",
                format_ts_relative(session.started_at),
                session.scope,
                session.status
            ),
            None => writeln!(f, "  Last sync:    never"),
        }
    }
}

/// Format a Unix millisecond timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp_millis();
    let delta = (now - ts) / 1000;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
