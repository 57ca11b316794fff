//! Schema creation
//!
//! Tables are created idempotently at startup. Waveform and job rows are
//! keyed by content hash, not track id, so identical audio in different
//! files shares analysis output.

use anyhow::Result;
use sqlx::SqlitePool;

/// Current schema version
pub const SCHEMA_VERSION: i64 = 1;

/// Create all tables and indexes if they do not exist
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(pool)
        .await?;
    if version.is_none() {
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(SCHEMA_VERSION)
            .execute(pool)
            .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracks (
            id TEXT PRIMARY KEY,
            file_path TEXT NOT NULL UNIQUE,
            file_size INTEGER NOT NULL,
            file_modified TEXT,
            content_hash TEXT NOT NULL,
            title TEXT,
            artist TEXT,
            album TEXT,
            album_artist TEXT,
            genre TEXT,
            year INTEGER,
            track_no INTEGER,
            comment TEXT,
            tempo REAL,
            musical_key INTEGER,
            mode INTEGER,
            time_signature INTEGER,
            beats TEXT,
            downbeats TEXT,
            first_beat_offset REAL,
            first_phrase_beat_no INTEGER,
            audible_start REAL,
            audible_end REAL,
            danceability INTEGER,
            acousticness INTEGER,
            instrumentalness INTEGER,
            valence REAL,
            arousal REAL,
            energy REAL,
            loudness REAL,
            spectral_centroid REAL,
            spectral_rolloff REAL,
            spectral_bandwidth REAL,
            zero_crossing_rate REAL,
            analyzed_at TEXT,
            analysis_version INTEGER,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tracks_content_hash ON tracks(content_hash)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS waveforms (
            content_hash TEXT NOT NULL,
            zoom_level INTEGER NOT NULL,
            for_stems INTEGER NOT NULL DEFAULT 0,
            sample_rate INTEGER NOT NULL,
            samples_per_pixel INTEGER NOT NULL,
            num_pixels INTEGER NOT NULL,
            bands TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (content_hash, zoom_level, for_stems)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_jobs (
            content_hash TEXT NOT NULL,
            track_id TEXT NOT NULL,
            source_path TEXT NOT NULL,
            options TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'queued',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            stages_completed TEXT NOT NULL DEFAULT '[]',
            progress INTEGER NOT NULL DEFAULT 0,
            hook TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            retry_at TEXT,
            last_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_hash_created
         ON analysis_jobs(content_hash, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON analysis_jobs(status)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS hot_cues (
            track_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            position REAL NOT NULL,
            loop_end REAL,
            label TEXT,
            source TEXT NOT NULL DEFAULT 'user',
            created_at TEXT NOT NULL,
            PRIMARY KEY (track_id, idx, source)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_initializes_twice_without_error() {
        let pool = crate::db::init_memory_pool().await.unwrap();
        initialize_schema(&pool).await.unwrap();

        let version: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
