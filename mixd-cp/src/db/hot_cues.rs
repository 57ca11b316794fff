//! Hot cue store

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use mixd_common::time::{format_sqlite, parse_sqlite_utc};

use crate::models::HotCue;

fn map_row(row: &SqliteRow) -> Result<HotCue> {
    let track_id: String = row.get("track_id");
    Ok(HotCue {
        track_id: Uuid::parse_str(&track_id)?,
        index: row.get("idx"),
        position: row.get("position"),
        loop_end: row.get("loop_end"),
        label: row.get("label"),
        source: row.get("source"),
        created_at: parse_sqlite_utc(row.get("created_at"))?,
    })
}

/// Insert or replace a cue at (track, index, source)
pub async fn upsert(pool: &SqlitePool, cue: &HotCue) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO hot_cues (track_id, idx, position, loop_end, label, source, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(track_id, idx, source) DO UPDATE SET
            position = excluded.position,
            loop_end = excluded.loop_end,
            label = excluded.label
        "#,
    )
    .bind(cue.track_id.to_string())
    .bind(cue.index)
    .bind(cue.position)
    .bind(cue.loop_end)
    .bind(&cue.label)
    .bind(&cue.source)
    .bind(format_sqlite(&cue.created_at))
    .execute(pool)
    .await?;

    Ok(())
}

/// Delete the cue at (track, index, source); true when a row existed
pub async fn remove(pool: &SqlitePool, track_id: Uuid, index: i64, source: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM hot_cues WHERE track_id = ? AND idx = ? AND source = ?")
        .bind(track_id.to_string())
        .bind(index)
        .bind(source)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// All cues for a track, ordered by index
pub async fn list_for_track(pool: &SqlitePool, track_id: Uuid) -> Result<Vec<HotCue>> {
    let rows = sqlx::query("SELECT * FROM hot_cues WHERE track_id = ? ORDER BY idx ASC")
        .bind(track_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter().map(map_row).collect()
}
