//! Per-elevation parse state: the content hash of the last successfully
//! parsed blob and the parse status, plus the atomic commit that updates
//! them together with the parsed fields.
//!
//! `content_hash` and the parsed fields are only ever written by
//! [`IdempotencyStore::commit_entity_update`], inside one transaction, so a
//! reader never sees a hash that disagrees with the fields next to it.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::ParseError;
use crate::models::{GlassSpecification, ParseStatus, ParsedElevation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub content_hash: Option<String>,
    pub parse_status: ParseStatus,
    pub data_quality_score: Option<u8>,
}

impl IdempotencyRecord {
    /// Whether a blob with `hash` has already been parsed successfully.
    pub fn is_current(&self, hash: &str) -> bool {
        self.parse_status == ParseStatus::Success && self.content_hash.as_deref() == Some(hash)
    }
}

/// Everything written by a successful parse.
pub struct EntityUpdate<'a> {
    pub elevation_id: &'a str,
    /// Hash observed by the idempotency read. The commit fails with
    /// [`ParseError::Consistency`] if the row no longer carries it.
    pub expected_hash: Option<&'a str>,
    pub content_hash: &'a str,
    pub parsed: &'a ParsedElevation,
    pub glass: &'a [GlassSpecification],
    pub quality_score: u8,
    pub warnings: &'a [String],
}

#[derive(Clone)]
pub struct IdempotencyStore {
    pool: SqlitePool,
}

impl IdempotencyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn lookup(&self, elevation_id: &str) -> Result<Option<IdempotencyRecord>, ParseError> {
        let row = sqlx::query(
            "SELECT content_hash, parse_status, data_quality_score FROM elevations WHERE id = ?",
        )
        .bind(elevation_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.get("parse_status");
        let score: Option<i64> = row.get("data_quality_score");
        Ok(Some(IdempotencyRecord {
            content_hash: row.get("content_hash"),
            parse_status: status.parse().unwrap_or(ParseStatus::Pending),
            data_quality_score: score.map(clamp_score),
        }))
    }

    pub async fn mark_in_progress(&self, elevation_id: &str) -> Result<(), ParseError> {
        let now = Utc::now().timestamp_millis();
        sqlx::query("UPDATE elevations SET parse_status = ?, updated_at = ? WHERE id = ?")
            .bind(ParseStatus::InProgress.as_str())
            .bind(now)
            .bind(elevation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a rejected blob. Previously parsed fields and `content_hash`
    /// are left as they were.
    pub async fn record_failure(&self, elevation_id: &str, reason: &str) -> Result<(), ParseError> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "UPDATE elevations SET parse_status = ?, parse_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(ParseStatus::Failed.as_str())
        .bind(reason)
        .bind(now)
        .bind(elevation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fail a parse that is still `in_progress`. Returns whether a row changed.
    pub async fn fail_if_in_progress(&self, elevation_id: &str, reason: &str) -> Result<bool, ParseError> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE elevations SET parse_status = ?, parse_error = ?, updated_at = ? \
             WHERE id = ? AND parse_status = ?",
        )
        .bind(ParseStatus::Failed.as_str())
        .bind(reason)
        .bind(now)
        .bind(elevation_id)
        .bind(ParseStatus::InProgress.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Reset parses interrupted by a shutdown or crash so they are picked up
    /// again.
    pub async fn recover_in_progress(&self) -> Result<u64, ParseError> {
        let result = sqlx::query("UPDATE elevations SET parse_status = ? WHERE parse_status = ?")
            .bind(ParseStatus::Pending.as_str())
            .bind(ParseStatus::InProgress.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Atomically write a successful parse. Returns the `parsed_at` stamp.
    ///
    /// The first statement is a compare-and-swap on `content_hash`, so the
    /// transaction takes the write lock before anything else is read.
    pub async fn commit_entity_update(&self, update: EntityUpdate<'_>) -> Result<i64, ParseError> {
        let now = Utc::now().timestamp_millis();
        let parsed = update.parsed;
        let warnings_json =
            serde_json::to_string(update.warnings).unwrap_or_else(|_| "[]".to_string());

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE elevations SET
                content_hash = ?,
                parse_status = ?,
                parse_error = NULL,
                parsed_name = ?,
                description = ?,
                short_description = ?,
                width = ?,
                height = ?,
                depth = ?,
                unit = ?,
                system_code = ?,
                system_name = ?,
                category = ?,
                data_quality_score = ?,
                parse_warnings_json = ?,
                parsed_at = ?,
                updated_at = ?
            WHERE id = ? AND content_hash IS ?
            "#,
        )
        .bind(update.content_hash)
        .bind(ParseStatus::Success.as_str())
        .bind(&parsed.name)
        .bind(&parsed.description)
        .bind(&parsed.short_description)
        .bind(parsed.width)
        .bind(parsed.height)
        .bind(parsed.depth)
        .bind(&parsed.unit)
        .bind(&parsed.system_code)
        .bind(&parsed.system_name)
        .bind(&parsed.category)
        .bind(update.quality_score as i64)
        .bind(&warnings_json)
        .bind(now)
        .bind(now)
        .bind(update.elevation_id)
        .bind(update.expected_hash)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<String> = sqlx::query_scalar("SELECT id FROM elevations WHERE id = ?")
                .bind(update.elevation_id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return Err(match exists {
                Some(_) => ParseError::Consistency {
                    elevation_id: update.elevation_id.to_string(),
                },
                None => ParseError::ElevationNotFound(update.elevation_id.to_string()),
            });
        }

        sqlx::query("DELETE FROM glass_specifications WHERE elevation_id = ?")
            .bind(update.elevation_id)
            .execute(&mut *tx)
            .await?;

        for (position, spec) in update.glass.iter().enumerate() {
            sqlx::query(
                "INSERT INTO glass_specifications (id, elevation_id, position, glass_id, name) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(update.elevation_id)
            .bind(position as i64)
            .bind(&spec.glass_id)
            .bind(&spec.name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(now)
    }
}

pub(crate) fn clamp_score(score: i64) -> u8 {
    score.clamp(0, 100) as u8
}
