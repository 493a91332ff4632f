//! Shared fixtures for the integration tests: an in-memory upstream, real
//! SQLite fixture blobs and a throwaway configuration.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use elevation_bridge::config::Config;
use elevation_bridge::{Bridge, ProjectRecord, Upstream, UpstreamDirectory, UpstreamEntity, UpstreamError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ─── In-memory upstream ─────────────────────────────────────────────

#[derive(Default)]
struct Tree {
    directories: Vec<UpstreamDirectory>,
    projects: HashMap<String, Vec<UpstreamEntity>>,
    phases: HashMap<String, Vec<UpstreamEntity>>,
    elevations: HashMap<String, Vec<UpstreamEntity>>,
    blobs: HashMap<String, Vec<u8>>,
}

/// Upstream hierarchy held in memory. Calls are counted per operation and
/// target (`"projects:d1"`, `"blob:e1"`, ...) and can be made to fail.
#[derive(Default)]
pub struct FakeUpstream {
    tree: Mutex<Tree>,
    failures: Mutex<HashMap<String, UpstreamError>>,
    calls: Mutex<HashMap<String, usize>>,
    blob_delay: Mutex<Option<Duration>>,
}

/// A fixed point in the past, so freshly synced rows are never stale.
pub fn upstream_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn entity(id: &str) -> UpstreamEntity {
    UpstreamEntity {
        id: id.to_string(),
        external_id: Some(format!("REF-{}", id)),
        name: Some(format!("Name {}", id)),
        last_update_date: Some(upstream_epoch()),
    }
}

impl FakeUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_directory(&self, id: &str, parent: Option<&str>, excluded: bool) {
        self.tree.lock().unwrap().directories.push(UpstreamDirectory {
            id: id.to_string(),
            path: format!("/{}", id),
            parent_id: parent.map(str::to_string),
            exclude_from_sync: excluded,
            last_update_date: Some(upstream_epoch()),
        });
    }

    pub fn add_project(&self, directory: &str, id: &str) {
        let mut tree = self.tree.lock().unwrap();
        tree.projects.entry(directory.to_string()).or_default().push(entity(id));
    }

    pub fn remove_project(&self, directory: &str, id: &str) {
        let mut tree = self.tree.lock().unwrap();
        if let Some(projects) = tree.projects.get_mut(directory) {
            projects.retain(|p| p.id != id);
        }
    }

    pub fn add_phase(&self, project: &str, id: &str) {
        let mut tree = self.tree.lock().unwrap();
        tree.phases.entry(project.to_string()).or_default().push(entity(id));
    }

    pub fn add_elevation(&self, phase: &str, id: &str, blob: Vec<u8>) {
        let mut tree = self.tree.lock().unwrap();
        tree.elevations.entry(phase.to_string()).or_default().push(entity(id));
        tree.blobs.insert(id.to_string(), blob);
    }

    /// Replace an elevation's blob and move its update date past any sync.
    pub fn replace_blob(&self, id: &str, blob: Vec<u8>) {
        let mut tree = self.tree.lock().unwrap();
        tree.blobs.insert(id.to_string(), blob);
        let later = Utc::now() + ChronoDuration::hours(1);
        for elevation in tree.elevations.values_mut().flatten() {
            if elevation.id == id {
                elevation.last_update_date = Some(later);
            }
        }
    }

    /// Replace an elevation's blob without touching its update date.
    pub fn swap_blob_silently(&self, id: &str, blob: Vec<u8>) {
        self.tree.lock().unwrap().blobs.insert(id.to_string(), blob);
    }

    pub fn fail(&self, call: &str, err: UpstreamError) {
        self.failures.lock().unwrap().insert(call.to_string(), err);
    }

    pub fn heal(&self, call: &str) {
        self.failures.lock().unwrap().remove(call);
    }

    pub fn set_blob_delay(&self, delay: Duration) {
        *self.blob_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self, call: &str) -> usize {
        self.calls.lock().unwrap().get(call).copied().unwrap_or(0)
    }

    /// Total calls whose label starts with `prefix`.
    pub fn calls_with_prefix(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(call, _)| call.starts_with(prefix))
            .map(|(_, n)| *n)
            .sum()
    }

    fn record(&self, call: &str) -> Result<(), UpstreamError> {
        *self.calls.lock().unwrap().entry(call.to_string()).or_default() += 1;
        match self.failures.lock().unwrap().get(call) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    fn name(&self) -> &str {
        "fake"
    }

    async fn list_directories(&self) -> Result<Vec<UpstreamDirectory>, UpstreamError> {
        self.record("directories")?;
        Ok(self.tree.lock().unwrap().directories.clone())
    }

    async fn list_projects(&self, directory_id: &str) -> Result<Vec<UpstreamEntity>, UpstreamError> {
        self.record(&format!("projects:{}", directory_id))?;
        Ok(self
            .tree
            .lock()
            .unwrap()
            .projects
            .get(directory_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_phases(&self, project_id: &str) -> Result<Vec<UpstreamEntity>, UpstreamError> {
        self.record(&format!("phases:{}", project_id))?;
        Ok(self.tree.lock().unwrap().phases.get(project_id).cloned().unwrap_or_default())
    }

    async fn list_elevations(&self, phase_id: &str) -> Result<Vec<UpstreamEntity>, UpstreamError> {
        self.record(&format!("elevations:{}", phase_id))?;
        Ok(self
            .tree
            .lock()
            .unwrap()
            .elevations
            .get(phase_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_blob(&self, elevation_id: &str) -> Result<Vec<u8>, UpstreamError> {
        self.record(&format!("blob:{}", elevation_id))?;
        let delay = *self.blob_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.tree
            .lock()
            .unwrap()
            .blobs
            .get(elevation_id)
            .cloned()
            .ok_or_else(|| UpstreamError::NotFound(elevation_id.to_string()))
    }
}

// ─── Blobs ──────────────────────────────────────────────────────────

/// Run `statements` against a fresh database file and return its bytes.
pub async fn build_blob(statements: &[&str]) -> Vec<u8> {
    let dir = TempDir::new().unwrap();
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

/// Every field populated, two glass specifications. Scores 100.
pub async fn complete_blob(name: &str) -> Vec<u8> {
    let insert = format!(
        "INSERT INTO Elevations VALUES ('{}', 'Curtain wall', 'CW', 2400, 3600, 150, 'mm', \
         'SYS-50', 'Series 50', 'curtain_wall')",
        name
    );
    build_blob(&[
        "CREATE TABLE Elevations (Name TEXT, Description TEXT, ShortDescription TEXT, \
         Width REAL, Height REAL, Depth REAL, Unit TEXT, SystemCode TEXT, SystemName TEXT, \
         Category TEXT)",
        &insert,
        "CREATE TABLE Glass (GlassId TEXT, Name TEXT)",
        "INSERT INTO Glass VALUES ('G1', 'Double glazed 4-16-4')",
        "INSERT INTO Glass VALUES ('G2', 'Laminated 44.2')",
    ])
    .await
}

/// Required columns only.
pub async fn minimal_blob(name: &str) -> Vec<u8> {
    let insert = format!("INSERT INTO Elevations VALUES ('{}', 1200, 2100)", name);
    build_blob(&["CREATE TABLE Elevations (Name TEXT, Width REAL, Height REAL)", &insert]).await
}

/// A name and nothing else: no dimensions and an empty glass table.
pub async fn bare_blob(name: &str) -> Vec<u8> {
    let insert = format!("INSERT INTO Elevations VALUES ('{}', NULL, NULL, 'mm')", name);
    build_blob(&[
        "CREATE TABLE Elevations (Name TEXT, Width REAL, Height REAL, Unit TEXT)",
        &insert,
        "CREATE TABLE Glass (GlassId TEXT, Name TEXT)",
    ])
    .await
}

/// Structurally valid database without the required `Height` column.
pub async fn blob_without_height() -> Vec<u8> {
    build_blob(&[
        "CREATE TABLE Elevations (Name TEXT, Width REAL)",
        "INSERT INTO Elevations VALUES ('E-1', 900)",
    ])
    .await
}

// ─── Bridge setup ───────────────────────────────────────────────────

pub fn test_config(tmp: &TempDir) -> Config {
    let db_path = tmp.path().join("data").join("bridge.sqlite");
    let config_content = format!(
        r#"
[db]
path = "{}"

[upstream]
base_url = "http://upstream.test/api"

[sync]
workers = 3
max_retries = 2
backoff_base_ms = 1
backoff_max_ms = 4
job_timeout_secs = 30
session_timeout_secs = 120
"#,
        db_path.display()
    );
    toml::from_str(&config_content).unwrap()
}

pub async fn open_bridge(tmp: &TempDir, upstream: &Arc<FakeUpstream>) -> Bridge {
    Bridge::open(test_config(tmp), upstream.clone()).await.unwrap()
}

/// One directory, one project, one phase and the given elevations.
pub fn single_project(upstream: &FakeUpstream, elevations: Vec<(&str, Vec<u8>)>) {
    upstream.add_directory("d1", None, false);
    upstream.add_project("d1", "p1");
    upstream.add_phase("p1", "ph1");
    for (id, blob) in elevations {
        upstream.add_elevation("ph1", id, blob);
    }
}

/// The cached project with the given upstream id.
pub async fn project_by_ref(bridge: &Bridge, external_id: &str) -> ProjectRecord {
    bridge
        .list_projects()
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.external_id == external_id)
        .unwrap_or_else(|| panic!("project {} not listed", external_id))
}

/// Local id of the cached elevation with the given upstream id.
pub async fn elevation_id(bridge: &Bridge, project_ref: &str, external_id: &str) -> String {
    let project = project_by_ref(bridge, project_ref).await;
    bridge
        .list_elevations(&project.id)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.external_id == external_id)
        .map(|e| e.id)
        .unwrap_or_else(|| panic!("elevation {} not cached", external_id))
}
