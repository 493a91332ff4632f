//! Hierarchy rows in the local cache.
//!
//! Projects, phases and elevations share one row shape (local UUID, parent
//! id, upstream id, sync bookkeeping), so the reconcile writes are generic
//! over [`Level`]. Parse state of elevations is owned by
//! [`IdempotencyStore`](crate::idempotency::IdempotencyStore) and is never
//! written here.
//!
//! Rows that vanish upstream are flagged, never deleted.

use anyhow::{bail, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::idempotency::clamp_score;
use crate::models::{
    DirectoryRecord, ElevationRecord, GlassSpecification, Level, ParseStatus, ParsedElevation,
    PhaseRecord, ProjectRecord, SyncStatus,
};
use crate::staleness::{is_stale, CachedSyncState};
use crate::upstream::{UpstreamDirectory, UpstreamEntity};

pub const MISSING_FROM_UPSTREAM: &str = "missing from upstream listing";

/// What an upsert did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Created,
    Updated,
    Unchanged,
}

/// The part of a cached child row needed to diff against upstream.
#[derive(Debug, Clone)]
pub struct ChildRow {
    pub id: String,
    pub external_id: String,
    pub last_sync_date: Option<i64>,
    pub sync_status: SyncStatus,
}

impl ChildRow {
    /// Whether the row must be rewritten from `entity`. Rows in the error
    /// state are always refreshed.
    pub fn needs_refresh(&self, entity: &UpstreamEntity, force: bool) -> bool {
        self.sync_status == SyncStatus::Error
            || is_stale(
                Some(&CachedSyncState::new(self.last_sync_date)),
                entity.last_update_date,
                force,
            )
    }
}

/// Where an elevation sits in the hierarchy.
#[derive(Debug, Clone)]
pub struct ElevationContext {
    pub elevation_id: String,
    pub external_id: String,
    pub phase_id: String,
    pub phase_external_id: String,
    pub project_id: String,
    pub directory_id: String,
}

fn child_table(level: Level) -> Result<(&'static str, &'static str)> {
    match level {
        Level::Project => Ok(("projects", "directory_id")),
        Level::Phase => Ok(("phases", "project_id")),
        Level::Elevation => Ok(("elevations", "phase_id")),
        Level::Directory => bail!("directories are not child rows"),
    }
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Directories
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert or refresh a directory. The upstream exclusion flag is always
    /// rewritten; a local override is never touched.
    pub async fn upsert_directory(&self, dir: &UpstreamDirectory, force: bool) -> Result<Change> {
        let now = Utc::now().timestamp_millis();
        let existing: Option<Option<i64>> =
            sqlx::query_scalar("SELECT last_sync_date FROM directories WHERE id = ?")
                .bind(&dir.id)
                .fetch_optional(&self.pool)
                .await?;

        let change = match existing {
            None => Change::Created,
            Some(last_sync) => {
                let cached = CachedSyncState::new(last_sync);
                if is_stale(Some(&cached), dir.last_update_date, force) {
                    Change::Updated
                } else {
                    Change::Unchanged
                }
            }
        };

        sqlx::query(
            r#"
            INSERT INTO directories (id, path, parent_id, exclude_from_sync, last_update_date, last_sync_date)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                path = excluded.path,
                parent_id = excluded.parent_id,
                exclude_from_sync = excluded.exclude_from_sync,
                last_update_date = excluded.last_update_date,
                last_sync_date = excluded.last_sync_date
            "#,
        )
        .bind(&dir.id)
        .bind(&dir.path)
        .bind(&dir.parent_id)
        .bind(dir.exclude_from_sync)
        .bind(dir.last_update_date.map(|d| d.timestamp_millis()))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(change)
    }

    pub async fn load_directories(&self) -> Result<Vec<DirectoryRecord>> {
        let rows = sqlx::query(
            "SELECT id, path, parent_id, exclude_from_sync, exclude_override, last_update_date, last_sync_date \
             FROM directories ORDER BY path ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DirectoryRecord {
                id: row.get("id"),
                path: row.get("path"),
                parent_id: row.get("parent_id"),
                exclude_from_sync: row.get("exclude_from_sync"),
                exclude_override: row.get("exclude_override"),
                last_update_date: row.get("last_update_date"),
                last_sync_date: row.get("last_sync_date"),
            })
            .collect())
    }

    /// Set or clear the local exclusion override. Returns `false` when the
    /// directory is not cached.
    pub async fn set_directory_override(&self, id: &str, exclude: Option<bool>) -> Result<bool> {
        let result = sqlx::query("UPDATE directories SET exclude_override = ? WHERE id = ?")
            .bind(exclude)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Projects, phases, elevations
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn list_children(&self, level: Level, parent_id: &str) -> Result<Vec<ChildRow>> {
        let (table, parent_col) = child_table(level)?;
        let sql = format!(
            "SELECT id, external_id, last_sync_date, sync_status FROM {} WHERE {} = ? ORDER BY external_id ASC",
            table, parent_col
        );
        let rows = sqlx::query(&sql).bind(parent_id).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(child_row).collect())
    }

    /// Find a cached child by upstream id. Projects are unique across
    /// directories (a project can move); phases and elevations are looked up
    /// under their parent.
    pub async fn find_child(&self, level: Level, parent_id: &str, external_id: &str) -> Result<Option<ChildRow>> {
        let (table, parent_col) = child_table(level)?;
        let row = if level == Level::Project {
            let sql = format!("SELECT id, external_id, last_sync_date, sync_status FROM {} WHERE external_id = ?", table);
            sqlx::query(&sql).bind(external_id).fetch_optional(&self.pool).await?
        } else {
            let sql = format!(
                "SELECT id, external_id, last_sync_date, sync_status FROM {} WHERE {} = ? AND external_id = ?",
                table, parent_col
            );
            sqlx::query(&sql)
                .bind(parent_id)
                .bind(external_id)
                .fetch_optional(&self.pool)
                .await?
        };
        Ok(row.as_ref().map(child_row))
    }

    /// Insert a child row for an upstream entity and return its local id.
    ///
    /// Projects and phases count as synced once their metadata is written.
    /// Elevations stay `pending` until their parse job completes.
    pub async fn insert_child(&self, level: Level, parent_id: &str, entity: &UpstreamEntity) -> Result<String> {
        let (table, parent_col) = child_table(level)?;
        let now = Utc::now().timestamp_millis();
        let id = Uuid::new_v4().to_string();
        let (status, synced_at) = metadata_sync_state(level, now);

        let sql = format!(
            "INSERT INTO {} (id, {}, external_id, source_ref, name, upstream_updated_at, last_sync_date, \
             sync_status, sync_error, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)",
            table, parent_col
        );
        sqlx::query(&sql)
            .bind(&id)
            .bind(parent_id)
            .bind(&entity.id)
            .bind(&entity.external_id)
            .bind(&entity.name)
            .bind(entity.last_update_date.map(|d| d.timestamp_millis()))
            .bind(synced_at)
            .bind(status.as_str())
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    /// Refresh a child row's metadata. `parent_id` is rewritten so a project
    /// that moved between directories follows its new parent.
    pub async fn update_child(&self, level: Level, id: &str, parent_id: &str, entity: &UpstreamEntity) -> Result<()> {
        let (table, parent_col) = child_table(level)?;
        let now = Utc::now().timestamp_millis();
        let (status, synced_at) = metadata_sync_state(level, now);

        let sql = format!(
            "UPDATE {} SET {} = ?, source_ref = ?, name = ?, upstream_updated_at = ?, \
             last_sync_date = COALESCE(?, last_sync_date), sync_status = ?, sync_error = NULL, updated_at = ? \
             WHERE id = ?",
            table, parent_col
        );
        sqlx::query(&sql)
            .bind(parent_id)
            .bind(&entity.external_id)
            .bind(&entity.name)
            .bind(entity.last_update_date.map(|d| d.timestamp_millis()))
            .bind(synced_at)
            .bind(status.as_str())
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_missing(&self, level: Level, id: &str) -> Result<()> {
        self.mark_sync_error(level, id, MISSING_FROM_UPSTREAM).await
    }

    pub async fn mark_sync_error(&self, level: Level, id: &str, reason: &str) -> Result<()> {
        let (table, _) = child_table(level)?;
        let sql = format!(
            "UPDATE {} SET sync_status = ?, sync_error = ?, updated_at = ? WHERE id = ?",
            table
        );
        sqlx::query(&sql)
            .bind(SyncStatus::Error.as_str())
            .bind(reason)
            .bind(Utc::now().timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record that an elevation's blob was fetched and examined.
    pub async fn mark_elevation_synced(&self, id: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "UPDATE elevations SET last_sync_date = ?, sync_status = ?, sync_error = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(SyncStatus::Synced.as_str())
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn get_project(&self, id: &str) -> Result<Option<ProjectRecord>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", PROJECT_SELECT))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(project_row))
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectRecord>> {
        let rows = sqlx::query(&format!("{} ORDER BY name ASC, external_id ASC", PROJECT_SELECT))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(project_row).collect())
    }

    pub async fn get_phase(&self, id: &str) -> Result<Option<PhaseRecord>> {
        let row = sqlx::query(
            "SELECT id, project_id, external_id, source_ref, name, upstream_updated_at, last_sync_date, \
             sync_status, sync_error FROM phases WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| PhaseRecord {
            id: row.get("id"),
            project_id: row.get("project_id"),
            external_id: row.get("external_id"),
            source_ref: row.get("source_ref"),
            name: row.get("name"),
            upstream_updated_at: row.get("upstream_updated_at"),
            last_sync_date: row.get("last_sync_date"),
            sync_status: sync_status(&row),
            sync_error: row.get("sync_error"),
        }))
    }

    pub async fn get_elevation(&self, id: &str) -> Result<Option<ElevationRecord>> {
        let row = sqlx::query(&format!("{} WHERE e.id = ?", ELEVATION_SELECT))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut record = elevation_row(&row);
        record.glass_specifications = self.glass_specifications(id).await?;
        Ok(Some(record))
    }

    /// All elevations under a project, across its phases.
    pub async fn list_elevations_for_project(&self, project_id: &str) -> Result<Vec<ElevationRecord>> {
        let rows = sqlx::query(&format!(
            "{} JOIN phases ph ON ph.id = e.phase_id WHERE ph.project_id = ? ORDER BY ph.external_id, e.external_id",
            ELEVATION_SELECT
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = elevation_row(row);
            record.glass_specifications = self.glass_specifications(&record.id).await?;
            records.push(record);
        }
        Ok(records)
    }

    pub async fn glass_specifications(&self, elevation_id: &str) -> Result<Vec<GlassSpecification>> {
        let rows = sqlx::query(
            "SELECT glass_id, name FROM glass_specifications WHERE elevation_id = ? ORDER BY position ASC",
        )
        .bind(elevation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| GlassSpecification {
                glass_id: row.get("glass_id"),
                name: row.get("name"),
            })
            .collect())
    }

    pub async fn elevation_context(&self, id: &str) -> Result<Option<ElevationContext>> {
        let row = sqlx::query(
            r#"
            SELECT e.id, e.external_id, e.phase_id, ph.external_id AS phase_external_id,
                   ph.project_id, p.directory_id
            FROM elevations e
            JOIN phases ph ON ph.id = e.phase_id
            JOIN projects p ON p.id = ph.project_id
            WHERE e.id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ElevationContext {
            elevation_id: row.get("id"),
            external_id: row.get("external_id"),
            phase_id: row.get("phase_id"),
            phase_external_id: row.get("phase_external_id"),
            project_id: row.get("project_id"),
            directory_id: row.get("directory_id"),
        }))
    }
}

fn metadata_sync_state(level: Level, now: i64) -> (SyncStatus, Option<i64>) {
    match level {
        Level::Elevation => (SyncStatus::Pending, None),
        _ => (SyncStatus::Synced, Some(now)),
    }
}

const PROJECT_SELECT: &str = "SELECT id, directory_id, external_id, source_ref, name, upstream_updated_at, \
     last_sync_date, sync_status, sync_error FROM projects";

const ELEVATION_SELECT: &str = "SELECT e.id, e.phase_id, e.external_id, e.source_ref, e.name, \
     e.upstream_updated_at, e.last_sync_date, e.sync_status, e.sync_error, e.content_hash, \
     e.parse_status, e.parse_error, e.parsed_name, e.description, e.short_description, e.width, \
     e.height, e.depth, e.unit, e.system_code, e.system_name, e.category, e.data_quality_score, \
     e.parse_warnings_json, e.parsed_at FROM elevations e";

fn child_row(row: &SqliteRow) -> ChildRow {
    ChildRow {
        id: row.get("id"),
        external_id: row.get("external_id"),
        last_sync_date: row.get("last_sync_date"),
        sync_status: sync_status(row),
    }
}

fn sync_status(row: &SqliteRow) -> SyncStatus {
    let status: String = row.get("sync_status");
    status.parse().unwrap_or(SyncStatus::Pending)
}

fn project_row(row: &SqliteRow) -> ProjectRecord {
    ProjectRecord {
        id: row.get("id"),
        directory_id: row.get("directory_id"),
        external_id: row.get("external_id"),
        source_ref: row.get("source_ref"),
        name: row.get("name"),
        upstream_updated_at: row.get("upstream_updated_at"),
        last_sync_date: row.get("last_sync_date"),
        sync_status: sync_status(row),
        sync_error: row.get("sync_error"),
    }
}

fn elevation_row(row: &SqliteRow) -> ElevationRecord {
    let parse_status: String = row.get("parse_status");
    let parsed_at: Option<i64> = row.get("parsed_at");
    let score: Option<i64> = row.get("data_quality_score");
    let warnings_json: String = row.get("parse_warnings_json");

    // Parsed fields only exist once a parse has committed.
    let parsed = parsed_at.map(|_| ParsedElevation {
        name: row.get("parsed_name"),
        description: row.get("description"),
        short_description: row.get("short_description"),
        width: row.get("width"),
        height: row.get("height"),
        depth: row.get("depth"),
        unit: row
            .get::<Option<String>, _>("unit")
            .unwrap_or_else(|| crate::parser::DEFAULT_UNIT.to_string()),
        system_code: row.get("system_code"),
        system_name: row.get("system_name"),
        category: row.get("category"),
    });

    ElevationRecord {
        id: row.get("id"),
        phase_id: row.get("phase_id"),
        external_id: row.get("external_id"),
        source_ref: row.get("source_ref"),
        name: row.get("name"),
        upstream_updated_at: row.get("upstream_updated_at"),
        last_sync_date: row.get("last_sync_date"),
        sync_status: sync_status(row),
        sync_error: row.get("sync_error"),
        content_hash: row.get("content_hash"),
        parse_status: parse_status.parse().unwrap_or(ParseStatus::Pending),
        parse_error: row.get("parse_error"),
        parsed,
        data_quality_score: score.map(clamp_score),
        parse_warnings: serde_json::from_str(&warnings_json).unwrap_or_default(),
        parsed_at,
        glass_specifications: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::run_migrations;
    use chrono::TimeZone;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> Store {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        Store::new(pool)
    }

    fn dir(id: &str, parent: Option<&str>, excluded: bool) -> UpstreamDirectory {
        UpstreamDirectory {
            id: id.into(),
            path: format!("/{}", id),
            parent_id: parent.map(String::from),
            exclude_from_sync: excluded,
            last_update_date: Some(Utc.timestamp_opt(1_000, 0).unwrap()),
        }
    }

    fn entity(id: &str) -> UpstreamEntity {
        UpstreamEntity {
            id: id.into(),
            external_id: Some(format!("REF-{}", id)),
            name: Some(format!("Name {}", id)),
            last_update_date: Some(Utc.timestamp_opt(1_000, 0).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_directory_upsert_keeps_override() {
        let store = store().await;
        assert_eq!(store.upsert_directory(&dir("d1", None, false), false).await.unwrap(), Change::Created);
        assert!(store.set_directory_override("d1", Some(true)).await.unwrap());
        assert!(!store.set_directory_override("nope", Some(true)).await.unwrap());

        assert_eq!(store.upsert_directory(&dir("d1", None, false), false).await.unwrap(), Change::Unchanged);
        assert_eq!(store.upsert_directory(&dir("d1", None, false), true).await.unwrap(), Change::Updated);

        let dirs = store.load_directories().await.unwrap();
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].exclude_override, Some(true));
        assert!(dirs[0].excluded());
    }

    #[tokio::test]
    async fn test_child_insert_find_update() {
        let store = store().await;
        let id = store.insert_child(Level::Project, "d1", &entity("p1")).await.unwrap();

        let found = store.find_child(Level::Project, "other", "p1").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert!(found.last_sync_date.is_some());

        store.update_child(Level::Project, &id, "d2", &entity("p1")).await.unwrap();
        let project = store.get_project(&id).await.unwrap().unwrap();
        assert_eq!(project.directory_id, "d2");
        assert_eq!(project.source_ref.as_deref(), Some("REF-p1"));
        assert_eq!(project.sync_status, SyncStatus::Synced);
        assert!(store.list_children(Level::Project, "d1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_elevation_not_synced_until_parsed() {
        let store = store().await;
        let project = store.insert_child(Level::Project, "d1", &entity("p1")).await.unwrap();
        let phase = store.insert_child(Level::Phase, &project, &entity("ph1")).await.unwrap();
        let elevation = store.insert_child(Level::Elevation, &phase, &entity("e1")).await.unwrap();

        let record = store.get_elevation(&elevation).await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert!(record.last_sync_date.is_none());
        assert!(record.parsed.is_none());

        store.mark_elevation_synced(&elevation).await.unwrap();
        let record = store.get_elevation(&elevation).await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert!(record.last_sync_date.is_some());

        let ctx = store.elevation_context(&elevation).await.unwrap().unwrap();
        assert_eq!(ctx.phase_external_id, "ph1");
        assert_eq!(ctx.directory_id, "d1");
    }

    #[tokio::test]
    async fn test_mark_missing_keeps_row() {
        let store = store().await;
        let id = store.insert_child(Level::Project, "d1", &entity("p1")).await.unwrap();
        store.mark_missing(Level::Project, &id).await.unwrap();

        let project = store.get_project(&id).await.unwrap().unwrap();
        assert_eq!(project.sync_status, SyncStatus::Error);
        assert_eq!(project.sync_error.as_deref(), Some(MISSING_FROM_UPSTREAM));
    }

    #[tokio::test]
    async fn test_directories_are_not_children() {
        let store = store().await;
        assert!(store.list_children(Level::Directory, "x").await.is_err());
    }
}
