//! Content-addressed parse pipeline for elevation blobs.
//!
//! ```text
//! bytes ──▶ digest ──▶ idempotency gate ──▶ validate ──▶ extract ──▶ score ──▶ commit
//!                          │ hit                 │ reject
//!                          ▼                     ▼
//!                      unchanged              failed (fields kept)
//! ```
//!
//! A blob whose digest matches the stored `content_hash` of a successful
//! parse is a no-op: nothing is validated, extracted or written. `force`
//! skips that gate.

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::{ParseError, ValidationError};
use crate::hash::content_digest;
use crate::idempotency::{EntityUpdate, IdempotencyRecord, IdempotencyStore};
use crate::models::{GlassSpecification, ParseStatus, ParsedElevation};
use crate::quality::quality_score;
use crate::validate::{quote_ident, validate, ValidatedBlob};

pub const DEFAULT_UNIT: &str = "mm";

/// Text columns read from the primary record, with the alias they are
/// selected under.
const TEXT_COLUMNS: &[(&str, &str)] = &[
    ("Name", "name"),
    ("Description", "description"),
    ("ShortDescription", "short_description"),
    ("Unit", "unit"),
    ("SystemCode", "system_code"),
    ("SystemName", "system_name"),
    ("Category", "category"),
];

const NUMERIC_COLUMNS: &[(&str, &str)] = &[("Width", "width"), ("Height", "height"), ("Depth", "depth")];

/// Outcome of one parse request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseResult {
    pub elevation_id: String,
    pub status: ParseStatus,
    pub quality_score: Option<u8>,
    /// Rejection or failure reason.
    pub reason: Option<String>,
    /// Digest of the blob that was examined.
    pub content_hash: Option<String>,
    /// `true` when the idempotency gate short-circuited the parse.
    pub unchanged: bool,
}

impl ParseResult {
    pub fn failed(elevation_id: &str, content_hash: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            elevation_id: elevation_id.to_string(),
            status: ParseStatus::Failed,
            quality_score: None,
            reason: Some(reason.into()),
            content_hash,
            unchanged: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ParseStatus::Success
    }
}

/// Fields and sub-records pulled out of a validated blob.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub parsed: ParsedElevation,
    pub glass: Vec<GlassSpecification>,
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct Parser {
    idempotency: IdempotencyStore,
}

impl Parser {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            idempotency: IdempotencyStore::new(pool),
        }
    }

    pub fn idempotency(&self) -> &IdempotencyStore {
        &self.idempotency
    }

    /// Parse `bytes` as the blob of `elevation_id`.
    ///
    /// A concurrent writer moving the stored hash between the read and the
    /// commit is retried once. A second conflict is reported as a failed
    /// result; only the parse status changes, the parsed fields and hash
    /// stay as the other writer left them.
    pub async fn parse(&self, elevation_id: &str, bytes: &[u8], force: bool) -> Result<ParseResult, ParseError> {
        match self.parse_once(elevation_id, bytes, force).await {
            Err(ParseError::Consistency { .. }) => {
                warn!(elevation_id, "content hash moved during parse, retrying");
                match self.parse_once(elevation_id, bytes, force).await {
                    Err(e @ ParseError::Consistency { .. }) => {
                        let reason = e.to_string();
                        warn!(elevation_id, "content hash moved again, giving up");
                        self.idempotency.fail_if_in_progress(elevation_id, &reason).await?;
                        Ok(ParseResult::failed(elevation_id, Some(content_digest(bytes)), reason))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn parse_once(&self, elevation_id: &str, bytes: &[u8], force: bool) -> Result<ParseResult, ParseError> {
        let hash = content_digest(bytes);
        let record = self
            .idempotency
            .lookup(elevation_id)
            .await?
            .ok_or_else(|| ParseError::ElevationNotFound(elevation_id.to_string()))?;

        if !force && record.is_current(&hash) {
            debug!(elevation_id, hash = %hash, "blob unchanged, skipping parse");
            return Ok(unchanged(elevation_id, hash, &record));
        }

        self.idempotency.mark_in_progress(elevation_id).await?;

        let extraction = match validate_and_extract(bytes).await {
            Ok(extraction) => extraction,
            Err(rejection) => {
                let reason = rejection.to_string();
                info!(elevation_id, reason = %reason, "blob rejected");
                self.idempotency.record_failure(elevation_id, &reason).await?;
                return Ok(ParseResult::failed(elevation_id, Some(hash), reason));
            }
        };

        let score = quality_score(&extraction.parsed, &extraction.glass, &extraction.warnings);
        self.idempotency
            .commit_entity_update(EntityUpdate {
                elevation_id,
                expected_hash: record.content_hash.as_deref(),
                content_hash: &hash,
                parsed: &extraction.parsed,
                glass: &extraction.glass,
                quality_score: score,
                warnings: &extraction.warnings,
            })
            .await?;

        info!(
            elevation_id,
            score,
            glass = extraction.glass.len(),
            warnings = extraction.warnings.len(),
            "elevation parsed"
        );
        Ok(ParseResult {
            elevation_id: elevation_id.to_string(),
            status: ParseStatus::Success,
            quality_score: Some(score),
            reason: None,
            content_hash: Some(hash),
            unchanged: false,
        })
    }
}

fn unchanged(elevation_id: &str, hash: String, record: &IdempotencyRecord) -> ParseResult {
    ParseResult {
        elevation_id: elevation_id.to_string(),
        status: ParseStatus::Success,
        quality_score: record.data_quality_score,
        reason: None,
        content_hash: Some(hash),
        unchanged: true,
    }
}

/// Validate and extract in one scope; the blob is released before returning.
pub async fn validate_and_extract(bytes: &[u8]) -> Result<Extraction, ValidationError> {
    let mut blob = validate(bytes).await?;
    let extraction = extract(&mut blob).await;
    blob.close().await;
    extraction
}

/// Read the primary record and glass specifications from a validated blob.
pub async fn extract(blob: &mut ValidatedBlob) -> Result<Extraction, ValidationError> {
    let mut select = Vec::new();
    for (column, alias) in TEXT_COLUMNS {
        select.push(project_column(blob, column, alias, "TEXT"));
    }
    for (column, alias) in NUMERIC_COLUMNS {
        select.push(project_column(blob, column, alias, "REAL"));
    }
    let sql = format!(
        "SELECT {} FROM {} LIMIT 1",
        select.join(", "),
        quote_ident(&blob.primary_table)
    );

    let row = sqlx::query(&sql)
        .fetch_one(blob.handle.conn())
        .await
        .map_err(|e| ValidationError::Integrity(e.to_string()))?;

    let text = |alias: &str| -> Result<Option<String>, ValidationError> {
        let value: Option<String> = row
            .try_get(alias)
            .map_err(|e| ValidationError::Integrity(e.to_string()))?;
        Ok(value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
    };
    let number = |alias: &str| -> Result<Option<f64>, ValidationError> {
        let value: Option<f64> = row
            .try_get(alias)
            .map_err(|e| ValidationError::Integrity(e.to_string()))?;
        Ok(value.filter(|v| v.is_finite() && *v > 0.0))
    };

    let parsed = ParsedElevation {
        name: text("name")?,
        description: text("description")?,
        short_description: text("short_description")?,
        width: number("width")?,
        height: number("height")?,
        depth: number("depth")?,
        unit: text("unit")?.unwrap_or_else(|| DEFAULT_UNIT.to_string()),
        system_code: text("system_code")?,
        system_name: text("system_name")?,
        category: text("category")?,
    };

    let glass = match &blob.glass {
        Some((table, columns)) => extract_glass(blob.handle.conn(), table, columns).await?,
        None => Vec::new(),
    };

    Ok(Extraction {
        parsed,
        glass,
        warnings: blob.warnings.clone(),
    })
}

fn project_column(blob: &ValidatedBlob, column: &str, alias: &str, affinity: &str) -> String {
    if blob.has_column(column) {
        format!("CAST({} AS {}) AS {}", quote_ident(column), affinity, alias)
    } else {
        format!("CAST(NULL AS {}) AS {}", affinity, alias)
    }
}

async fn extract_glass(
    conn: &mut sqlx::SqliteConnection,
    table: &str,
    columns: &std::collections::HashSet<String>,
) -> Result<Vec<GlassSpecification>, ValidationError> {
    let pick = |column: &str, alias: &str| {
        if columns.contains(&column.to_ascii_lowercase()) {
            format!("CAST({} AS TEXT) AS {}", quote_ident(column), alias)
        } else {
            format!("CAST(NULL AS TEXT) AS {}", alias)
        }
    };
    let sql = format!(
        "SELECT {}, {} FROM {}",
        pick("GlassId", "glass_id"),
        pick("Name", "name"),
        quote_ident(table)
    );

    let rows = sqlx::query(&sql)
        .fetch_all(conn)
        .await
        .map_err(|e| ValidationError::Integrity(e.to_string()))?;

    let mut specs = Vec::with_capacity(rows.len());
    for row in rows {
        let clean = |alias: &str| -> Result<Option<String>, ValidationError> {
            let value: Option<String> = row
                .try_get(alias)
                .map_err(|e| ValidationError::Integrity(e.to_string()))?;
            Ok(value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
        };
        let spec = GlassSpecification {
            glass_id: clean("glass_id")?,
            name: clean("name")?,
        };
        if spec.glass_id.is_some() || spec.name.is_some() {
            specs.push(spec);
        }
    }
    Ok(specs)
}
