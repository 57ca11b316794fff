//! Database access for the control plane
//!
//! SQLite via sqlx. All timestamps are stored as UTC `YYYY-MM-DD HH:MM:SS`
//! strings (see `mixd_common::time`); JSON columns hold option sets, stage
//! lists, delivery hooks and waveform band arrays.

pub mod hot_cues;
pub mod jobs;
pub mod schema;
pub mod tracks;
pub mod waveforms;

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize the database connection pool and schema
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // mode=rwc: read, write, create
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    schema::initialize_schema(&pool).await?;

    Ok(pool)
}

/// In-memory pool for tests
///
/// Pinned to a single connection that never retires: every pooled SQLite
/// in-memory connection is its own database, so a second connection would
/// see no tables.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    schema::initialize_schema(&pool).await?;
    Ok(pool)
}
