//! Scoped access to an elevation's embedded database.
//!
//! A blob is materialized once into a temporary file and opened with a single
//! read-only connection. The [`BlobHandle`] is passed through
//! validate → extract and released exactly once: [`BlobHandle::close`] closes
//! the connection, and dropping the handle removes the file.

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use tempfile::TempPath;

use crate::error::ValidationError;

/// Every SQLite database starts with this 16-byte magic string.
pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Size of the fixed database header.
const HEADER_LEN: usize = 100;

pub struct BlobHandle {
    // Declared before `path` so the connection is dropped before the file.
    conn: SqliteConnection,
    path: TempPath,
}

impl BlobHandle {
    /// Check the container header, write the bytes to a temporary file and
    /// open it read-only.
    pub async fn open(bytes: &[u8]) -> Result<Self, ValidationError> {
        check_container(bytes)?;

        let file = tempfile::Builder::new()
            .prefix("elevation-blob-")
            .suffix(".db")
            .tempfile()
            .map_err(|e| ValidationError::Unavailable(e.to_string()))?;
        let path = file.into_temp_path();
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ValidationError::Unavailable(e.to_string()))?;

        let conn = SqliteConnectOptions::new()
            .filename(&path)
            .read_only(true)
            .create_if_missing(false)
            .connect()
            .await
            .map_err(|e| ValidationError::NotContainer(e.to_string()))?;

        Ok(Self { conn, path })
    }

    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    /// Close the connection, then remove the temporary file.
    pub async fn close(self) {
        let Self { conn, path } = self;
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, path = %path.display(), "closing blob connection failed");
        }
        drop(path);
    }
}

/// Cheap structural check done before touching the filesystem.
pub fn check_container(bytes: &[u8]) -> Result<(), ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::Empty);
    }
    if bytes.len() < HEADER_LEN {
        return Err(ValidationError::NotContainer(format!(
            "{} bytes is shorter than the {}-byte database header",
            bytes.len(),
            HEADER_LEN
        )));
    }
    if !bytes.starts_with(SQLITE_MAGIC) {
        return Err(ValidationError::NotContainer(
            "missing SQLite header magic".to_string(),
        ));
    }
    Ok(())
}
