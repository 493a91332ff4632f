use anyhow::Result;
use sqlx::SqlitePool;

/// Create the cache schema. Every statement is idempotent, so this runs on
/// every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS directories (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            parent_id TEXT,
            exclude_from_sync INTEGER NOT NULL DEFAULT 0,
            exclude_override INTEGER,
            last_update_date INTEGER,
            last_sync_date INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            directory_id TEXT NOT NULL,
            external_id TEXT NOT NULL UNIQUE,
            source_ref TEXT,
            name TEXT,
            upstream_updated_at INTEGER,
            last_sync_date INTEGER,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            sync_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS phases (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            external_id TEXT NOT NULL,
            source_ref TEXT,
            name TEXT,
            upstream_updated_at INTEGER,
            last_sync_date INTEGER,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            sync_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(project_id, external_id),
            FOREIGN KEY (project_id) REFERENCES projects(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS elevations (
            id TEXT PRIMARY KEY,
            phase_id TEXT NOT NULL,
            external_id TEXT NOT NULL,
            source_ref TEXT,
            name TEXT,
            upstream_updated_at INTEGER,
            last_sync_date INTEGER,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            sync_error TEXT,
            content_hash TEXT,
            parse_status TEXT NOT NULL DEFAULT 'pending',
            parse_error TEXT,
            parsed_name TEXT,
            description TEXT,
            short_description TEXT,
            width REAL,
            height REAL,
            depth REAL,
            unit TEXT,
            system_code TEXT,
            system_name TEXT,
            category TEXT,
            data_quality_score INTEGER,
            parse_warnings_json TEXT NOT NULL DEFAULT '[]',
            parsed_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(phase_id, external_id),
            FOREIGN KEY (phase_id) REFERENCES phases(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS glass_specifications (
            id TEXT PRIMARY KEY,
            elevation_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            glass_id TEXT,
            name TEXT,
            UNIQUE(elevation_id, position),
            FOREIGN KEY (elevation_id) REFERENCES elevations(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_sessions (
            id TEXT PRIMARY KEY,
            scope TEXT NOT NULL,
            forced INTEGER NOT NULL,
            cascading INTEGER NOT NULL,
            status TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            summary_json TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_directories_parent ON directories(parent_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_projects_directory ON projects(directory_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_phases_project ON phases(project_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_elevations_phase ON elevations(phase_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_elevations_parse_status ON elevations(parse_status)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_glass_elevation ON glass_specifications(elevation_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sync_sessions_started ON sync_sessions(started_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
