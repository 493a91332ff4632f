//! Cache records for the four hierarchy levels and their sub-records.
//!
//! Directories are keyed by their upstream id; projects, phases and
//! elevations carry a local UUID plus the upstream `external_id` they were
//! diffed by. All timestamps are Unix milliseconds.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Lifecycle of an elevation's structured-data extraction.
///
/// `pending → in_progress → {success, failed}`; both outcomes re-enter
/// `in_progress` on the next detected staleness or forced parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl ParseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseStatus::Pending => "pending",
            ParseStatus::InProgress => "in_progress",
            ParseStatus::Success => "success",
            ParseStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ParseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ParseStatus::Pending),
            "in_progress" => Ok(ParseStatus::InProgress),
            "success" => Ok(ParseStatus::Success),
            "failed" => Ok(ParseStatus::Failed),
            other => Err(format!("unknown parse status: {}", other)),
        }
    }
}

/// Sync state of a project, phase or elevation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Error => "error",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(SyncStatus::Synced),
            "pending" => Ok(SyncStatus::Pending),
            "error" => Ok(SyncStatus::Error),
            other => Err(format!("unknown sync status: {}", other)),
        }
    }
}

/// Hierarchy level, used for summary counts and failure records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Directory,
    Project,
    Phase,
    Elevation,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Directory => "directory",
            Level::Project => "project",
            Level::Phase => "phase",
            Level::Elevation => "elevation",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectoryRecord {
    pub id: String,
    pub path: String,
    pub parent_id: Option<String>,
    /// Flag as reported by upstream.
    pub exclude_from_sync: bool,
    /// Local operator override; wins over the upstream flag when set.
    pub exclude_override: Option<bool>,
    pub last_update_date: Option<i64>,
    pub last_sync_date: Option<i64>,
}

impl DirectoryRecord {
    pub fn excluded(&self) -> bool {
        self.exclude_override.unwrap_or(self.exclude_from_sync)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectRecord {
    pub id: String,
    pub directory_id: String,
    pub external_id: String,
    pub source_ref: Option<String>,
    pub name: Option<String>,
    pub upstream_updated_at: Option<i64>,
    pub last_sync_date: Option<i64>,
    pub sync_status: SyncStatus,
    pub sync_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub id: String,
    pub project_id: String,
    pub external_id: String,
    pub source_ref: Option<String>,
    pub name: Option<String>,
    pub upstream_updated_at: Option<i64>,
    pub last_sync_date: Option<i64>,
    pub sync_status: SyncStatus,
    pub sync_error: Option<String>,
}

/// Fields extracted from an elevation blob.
///
/// Dimensions share one unit (`mm` unless the blob says otherwise).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedElevation {
    pub name: Option<String>,
    pub description: Option<String>,
    pub short_description: Option<String>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub depth: Option<f64>,
    pub unit: String,
    pub system_code: Option<String>,
    pub system_name: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlassSpecification {
    pub glass_id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ElevationRecord {
    pub id: String,
    pub phase_id: String,
    pub external_id: String,
    pub source_ref: Option<String>,
    pub name: Option<String>,
    pub upstream_updated_at: Option<i64>,
    pub last_sync_date: Option<i64>,
    pub sync_status: SyncStatus,
    pub sync_error: Option<String>,
    pub content_hash: Option<String>,
    pub parse_status: ParseStatus,
    pub parse_error: Option<String>,
    /// `None` until the first successful parse.
    pub parsed: Option<ParsedElevation>,
    pub data_quality_score: Option<u8>,
    pub parse_warnings: Vec<String>,
    pub parsed_at: Option<i64>,
    pub glass_specifications: Vec<GlassSpecification>,
}
