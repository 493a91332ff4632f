//! Read-side access to the cache.
//!
//! Listings apply the exclusion filter on every call, so toggling a
//! directory's override takes effect immediately for cached data, including
//! projects cached before the directory was excluded.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::exclusion::ExclusionFilter;
use crate::models::{DirectoryRecord, ElevationRecord, PhaseRecord, ProjectRecord};
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct DirectoryResponse {
    #[serde(flatten)]
    pub record: DirectoryRecord,
    /// Effective exclusion of the directory itself.
    pub excluded: bool,
    /// `false` when the directory or any ancestor is excluded.
    pub syncable: bool,
}

/// A cached entity of any level, as returned by [`get_entity`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum CachedEntity {
    Directory(DirectoryResponse),
    Project(ProjectRecord),
    Phase(PhaseRecord),
    Elevation(ElevationRecord),
}

/// Look up an entity by local id (or upstream id for directories).
/// Elevations come with their glass specifications.
pub async fn get_entity(store: &Store, id: &str) -> Result<CachedEntity> {
    if let Some(elevation) = store.get_elevation(id).await? {
        return Ok(CachedEntity::Elevation(elevation));
    }
    if let Some(project) = store.get_project(id).await? {
        return Ok(CachedEntity::Project(project));
    }
    if let Some(phase) = store.get_phase(id).await? {
        return Ok(CachedEntity::Phase(phase));
    }

    let directories = store.load_directories().await?;
    let filter = ExclusionFilter::from_records(&directories);
    match directories.into_iter().find(|d| d.id == id) {
        Some(record) => Ok(CachedEntity::Directory(DirectoryResponse {
            excluded: record.excluded(),
            syncable: filter.is_syncable(&record.id),
            record,
        })),
        None => bail!("entity not found: {}", id),
    }
}

/// Cached projects whose directory is syncable.
pub async fn list_projects(store: &Store) -> Result<Vec<ProjectRecord>> {
    let filter = ExclusionFilter::from_records(&store.load_directories().await?);
    let projects = store.list_projects().await?;
    Ok(projects
        .into_iter()
        .filter(|p| filter.is_syncable(&p.directory_id))
        .collect())
}

/// Cached elevations of a project. Empty when the project sits under an
/// excluded directory.
pub async fn list_elevations(store: &Store, project_id: &str) -> Result<Vec<ElevationRecord>> {
    let Some(project) = store.get_project(project_id).await? else {
        bail!("project not found: {}", project_id);
    };
    let filter = ExclusionFilter::from_records(&store.load_directories().await?);
    if !filter.is_syncable(&project.directory_id) {
        return Ok(Vec::new());
    }
    store.list_elevations_for_project(project_id).await
}
