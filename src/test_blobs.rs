//! Elevation blob fixtures and a seeded cache for unit tests.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{ConnectOptions, Connection, SqlitePool};

use crate::migrate::run_migrations;

/// Run `statements` against a fresh database file and return its bytes.
pub async fn build_blob(statements: &[&str]) -> Vec<u8> {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("fixture.db");
    let mut conn = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .connect()
        .await
        .unwrap();
    for statement in statements {
        sqlx::query(statement).execute(&mut conn).await.unwrap();
    }
    conn.close().await.unwrap();
    std::fs::read(&path).unwrap()
}

/// Every optional column populated and two glass rows.
pub async fn complete_blob() -> Vec<u8> {
    build_blob(&[
        "CREATE TABLE Elevations (Name TEXT, Description TEXT, ShortDescription TEXT, \
         Width REAL, Height REAL, Depth REAL, Unit TEXT, SystemCode TEXT, SystemName TEXT, \
         Category TEXT)",
        "INSERT INTO Elevations VALUES ('E-101', 'Curtain wall north', 'CW north', \
         2400.0, 3600.0, 150.0, 'mm', 'SYS-50', 'Series 50', 'curtain_wall')",
        "CREATE TABLE Glass (GlassId TEXT, Name TEXT)",
        "INSERT INTO Glass VALUES ('G1', 'Double glazed 4-16-4')",
        "INSERT INTO Glass VALUES ('G2', 'Laminated 44.2')",
    ])
    .await
}

/// Only the required columns, no glass table.
pub async fn minimal_blob() -> Vec<u8> {
    build_blob(&[
        "CREATE TABLE Elevations (Name TEXT, Width REAL, Height REAL)",
        "INSERT INTO Elevations VALUES ('E-7', 1200, 2100)",
    ])
    .await
}

/// In-memory cache holding one project, one phase and elevation `id`.
pub async fn cache_with_elevation(id: &str) -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    sqlx::query(
        "INSERT INTO projects (id, directory_id, external_id, created_at, updated_at) \
         VALUES ('p', 'd', 'p', 0, 0)",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO phases (id, project_id, external_id, created_at, updated_at) \
         VALUES ('ph', 'p', 'ph', 0, 0)",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO elevations (id, phase_id, external_id, created_at, updated_at) \
         VALUES (?, 'ph', ?, 0, 0)",
    )
    .bind(id)
    .bind(id)
    .execute(&pool)
    .await
    .unwrap();
    pool
}
