//! Structural validation of elevation blobs.
//!
//! Checks run in order and stop at the first failure:
//!
//! 1. non-empty, database container header present;
//! 2. `PRAGMA integrity_check` reports `ok`;
//! 3. the primary table exists with its required columns;
//! 4. the primary table holds at least one record.
//!
//! Soft problems (missing optional table, missing unit column, more than one
//! primary record) become warnings on the [`ValidatedBlob`] and lower the
//! quality score; they never reject the blob.

use sqlx::Row;
use std::collections::HashSet;

use crate::blob::BlobHandle;
use crate::error::ValidationError;

pub const PRIMARY_TABLE: &str = "Elevations";
pub const GLASS_TABLE: &str = "Glass";
pub const REQUIRED_COLUMNS: &[&str] = &["Name", "Width", "Height"];

/// An open blob that passed validation, plus what was learned about its
/// schema. Column names are stored lowercased.
pub struct ValidatedBlob {
    pub handle: BlobHandle,
    pub primary_table: String,
    pub primary_columns: HashSet<String>,
    /// `None` when the glass table is absent.
    pub glass: Option<(String, HashSet<String>)>,
    pub warnings: Vec<String>,
}

impl ValidatedBlob {
    pub fn has_column(&self, column: &str) -> bool {
        self.primary_columns.contains(&column.to_ascii_lowercase())
    }

    pub async fn close(self) {
        self.handle.close().await;
    }
}

/// Validate raw blob bytes. On success the returned blob keeps its
/// connection open for extraction; on failure it has already been released.
pub async fn validate(bytes: &[u8]) -> Result<ValidatedBlob, ValidationError> {
    let mut handle = BlobHandle::open(bytes).await?;
    match inspect(&mut handle).await {
        Ok(schema) => Ok(ValidatedBlob {
            handle,
            primary_table: schema.primary_table,
            primary_columns: schema.primary_columns,
            glass: schema.glass,
            warnings: schema.warnings,
        }),
        Err(e) => {
            handle.close().await;
            Err(e)
        }
    }
}

struct Schema {
    primary_table: String,
    primary_columns: HashSet<String>,
    glass: Option<(String, HashSet<String>)>,
    warnings: Vec<String>,
}

async fn inspect(handle: &mut BlobHandle) -> Result<Schema, ValidationError> {
    check_integrity(handle).await?;

    let primary_table = find_table(handle, PRIMARY_TABLE)
        .await?
        .ok_or_else(|| ValidationError::MissingTable(PRIMARY_TABLE.to_string()))?;
    let primary_columns = table_columns(handle, &primary_table).await?;
    for column in REQUIRED_COLUMNS {
        if !primary_columns.contains(&column.to_ascii_lowercase()) {
            return Err(ValidationError::MissingColumn {
                table: PRIMARY_TABLE.to_string(),
                column: column.to_string(),
            });
        }
    }

    let count_sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&primary_table));
    let rows: i64 = sqlx::query_scalar(&count_sql)
        .fetch_one(handle.conn())
        .await
        .map_err(|e| ValidationError::Integrity(e.to_string()))?;
    if rows == 0 {
        return Err(ValidationError::NoPrimaryRecord(PRIMARY_TABLE.to_string()));
    }

    let mut warnings = Vec::new();
    if rows > 1 {
        warnings.push(format!(
            "{} records in '{}', using the first",
            rows, PRIMARY_TABLE
        ));
    }
    if !primary_columns.contains("unit") {
        warnings.push(format!(
            "column '{}.Unit' missing, assuming mm",
            PRIMARY_TABLE
        ));
    }

    let glass = match find_table(handle, GLASS_TABLE).await? {
        Some(table) => {
            let columns = table_columns(handle, &table).await?;
            if !columns.contains("glassid") && !columns.contains("name") {
                warnings.push(format!(
                    "table '{}' has neither GlassId nor Name, ignored",
                    GLASS_TABLE
                ));
                None
            } else {
                Some((table, columns))
            }
        }
        None => {
            warnings.push(format!("optional table '{}' missing", GLASS_TABLE));
            None
        }
    };

    Ok(Schema {
        primary_table,
        primary_columns,
        glass,
        warnings,
    })
}

async fn check_integrity(handle: &mut BlobHandle) -> Result<(), ValidationError> {
    let report: Vec<String> = sqlx::query_scalar("PRAGMA integrity_check(10)")
        .fetch_all(handle.conn())
        .await
        .map_err(|e| {
            let message = e.to_string();
            if message.contains("not a database") {
                ValidationError::NotContainer(message)
            } else {
                ValidationError::Integrity(message)
            }
        })?;

    match report.as_slice() {
        [only] if only == "ok" => Ok(()),
        [] => Err(ValidationError::Integrity("no report".to_string())),
        problems => Err(ValidationError::Integrity(problems.join("; "))),
    }
}

/// Case-insensitive table lookup; returns the name as stored.
async fn find_table(
    handle: &mut BlobHandle,
    name: &str,
) -> Result<Option<String>, ValidationError> {
    sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ? COLLATE NOCASE LIMIT 1",
    )
    .bind(name)
    .fetch_optional(handle.conn())
    .await
    .map_err(|e| ValidationError::Integrity(e.to_string()))
}

async fn table_columns(
    handle: &mut BlobHandle,
    table: &str,
) -> Result<HashSet<String>, ValidationError> {
    let rows = sqlx::query("SELECT name FROM pragma_table_info(?)")
        .bind(table)
        .fetch_all(handle.conn())
        .await
        .map_err(|e| ValidationError::Integrity(e.to_string()))?;

    let mut columns = HashSet::new();
    for row in rows {
        let name: String = row
            .try_get("name")
            .map_err(|e| ValidationError::Integrity(e.to_string()))?;
        columns.insert(name.to_ascii_lowercase());
    }
    Ok(columns)
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
