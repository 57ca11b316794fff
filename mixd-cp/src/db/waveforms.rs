//! Waveform store
//!
//! Keyed by (content hash, zoom level, stems flag). Deletion is
//! content-hash-scoped, never track-scoped: removing one track of a
//! duplicate pair leaves the other's waveforms intact.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use mixd_common::time::format_sqlite;

use crate::models::{Waveform, WaveformBands};

/// Insert or replace one waveform record
pub async fn upsert(pool: &SqlitePool, waveform: &Waveform) -> Result<()> {
    waveform
        .validate()
        .map_err(|m| anyhow::anyhow!("invalid waveform: {}", m))?;

    sqlx::query(
        r#"
        INSERT INTO waveforms
            (content_hash, zoom_level, for_stems, sample_rate, samples_per_pixel,
             num_pixels, bands, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(content_hash, zoom_level, for_stems) DO UPDATE SET
            sample_rate = excluded.sample_rate,
            samples_per_pixel = excluded.samples_per_pixel,
            num_pixels = excluded.num_pixels,
            bands = excluded.bands,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&waveform.content_hash)
    .bind(waveform.zoom_level as i64)
    .bind(waveform.for_stems() as i64)
    .bind(waveform.sample_rate)
    .bind(waveform.samples_per_pixel)
    .bind(waveform.num_pixels)
    .bind(serde_json::to_string(&waveform.bands)?)
    .bind(format_sqlite(&mixd_common::time::now()))
    .execute(pool)
    .await?;

    Ok(())
}

/// Load one waveform record
pub async fn get(
    pool: &SqlitePool,
    hash: &str,
    zoom_level: u8,
    for_stems: bool,
) -> Result<Option<Waveform>> {
    let row = sqlx::query(
        "SELECT content_hash, zoom_level, sample_rate, samples_per_pixel, num_pixels, bands
         FROM waveforms
         WHERE content_hash = ? AND zoom_level = ? AND for_stems = ?",
    )
    .bind(hash)
    .bind(zoom_level as i64)
    .bind(for_stems as i64)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let bands: WaveformBands = serde_json::from_str(row.get("bands"))?;
            Ok(Some(Waveform {
                content_hash: row.get("content_hash"),
                zoom_level: row.get::<i64, _>("zoom_level") as u8,
                sample_rate: row.get("sample_rate"),
                samples_per_pixel: row.get("samples_per_pixel"),
                num_pixels: row.get("num_pixels"),
                bands,
            }))
        }
        None => Ok(None),
    }
}

/// Delete every waveform for a content hash
pub async fn delete_by_hash(pool: &SqlitePool, hash: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM waveforms WHERE content_hash = ?")
        .bind(hash)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
