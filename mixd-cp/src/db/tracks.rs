//! Track store
//!
//! A track row is created by the library scanner before any derived feature
//! can be stored against it; the callback router only ever updates.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use mixd_common::time::{format_sqlite, parse_sqlite_utc};

use crate::models::callback::{BasicFeaturesData, CharacteristicsData};
use crate::models::Track;

fn parse_json_array(value: Option<String>) -> Result<Option<Vec<f64>>> {
    match value {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

fn map_row(row: &SqliteRow) -> Result<Track> {
    let id: String = row.get("id");
    let file_modified = match row.get::<Option<String>, _>("file_modified") {
        Some(s) => Some(parse_sqlite_utc(&s)?),
        None => None,
    };
    let analyzed_at = match row.get::<Option<String>, _>("analyzed_at") {
        Some(s) => Some(parse_sqlite_utc(&s)?),
        None => None,
    };

    Ok(Track {
        id: Uuid::parse_str(&id)?,
        file_path: row.get("file_path"),
        file_size: row.get("file_size"),
        file_modified,
        content_hash: row.get("content_hash"),
        title: row.get("title"),
        artist: row.get("artist"),
        album: row.get("album"),
        album_artist: row.get("album_artist"),
        genre: row.get("genre"),
        year: row.get("year"),
        track_no: row.get("track_no"),
        comment: row.get("comment"),
        tempo: row.get("tempo"),
        musical_key: row.get("musical_key"),
        mode: row.get("mode"),
        time_signature: row.get("time_signature"),
        beats: parse_json_array(row.get("beats"))?,
        downbeats: parse_json_array(row.get("downbeats"))?,
        first_beat_offset: row.get("first_beat_offset"),
        first_phrase_beat_no: row.get("first_phrase_beat_no"),
        audible_start: row.get("audible_start"),
        audible_end: row.get("audible_end"),
        danceability: row.get::<Option<i64>, _>("danceability").map(|v| v != 0),
        acousticness: row.get::<Option<i64>, _>("acousticness").map(|v| v != 0),
        instrumentalness: row
            .get::<Option<i64>, _>("instrumentalness")
            .map(|v| v != 0),
        valence: row.get("valence"),
        arousal: row.get("arousal"),
        energy: row.get("energy"),
        loudness: row.get("loudness"),
        spectral_centroid: row.get("spectral_centroid"),
        spectral_rolloff: row.get("spectral_rolloff"),
        spectral_bandwidth: row.get("spectral_bandwidth"),
        zero_crossing_rate: row.get("zero_crossing_rate"),
        analyzed_at,
        analysis_version: row.get("analysis_version"),
        created_at: parse_sqlite_utc(row.get("created_at"))?,
    })
}

/// Insert a track row (identity and tags; derived features start empty)
pub async fn insert(pool: &SqlitePool, track: &Track) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tracks
            (id, file_path, file_size, file_modified, content_hash,
             title, artist, album, album_artist, genre, year, track_no, comment,
             created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(track.id.to_string())
    .bind(&track.file_path)
    .bind(track.file_size)
    .bind(track.file_modified.as_ref().map(format_sqlite))
    .bind(&track.content_hash)
    .bind(&track.title)
    .bind(&track.artist)
    .bind(&track.album)
    .bind(&track.album_artist)
    .bind(&track.genre)
    .bind(track.year)
    .bind(track.track_no)
    .bind(&track.comment)
    .bind(format_sqlite(&track.created_at))
    .execute(pool)
    .await?;

    Ok(())
}

/// Load a track by id
pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Option<Track>> {
    let row = sqlx::query("SELECT * FROM tracks WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(map_row).transpose()
}

/// First track carrying a content hash (duplicates share one)
pub async fn get_by_hash(pool: &SqlitePool, hash: &str) -> Result<Option<Track>> {
    let row = sqlx::query("SELECT * FROM tracks WHERE content_hash = ? ORDER BY created_at LIMIT 1")
        .bind(hash)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(map_row).transpose()
}

/// Persist a basic-features callback onto a track
pub async fn update_basic_features(
    pool: &SqlitePool,
    id: Uuid,
    data: &BasicFeaturesData,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE tracks SET
            tempo = ?,
            musical_key = ?,
            mode = ?,
            beats = ?,
            downbeats = ?,
            first_beat_offset = ?,
            first_phrase_beat_no = ?,
            audible_start = ?,
            audible_end = ?
        WHERE id = ?
        "#,
    )
    .bind(data.tempo)
    .bind(data.key)
    .bind(data.mode)
    .bind(serde_json::to_string(&data.beats)?)
    .bind(serde_json::to_string(&data.downbeats)?)
    .bind(data.first_beat_offset)
    .bind(data.first_phrase_beat_no)
    .bind(data.audible_start)
    .bind(data.audible_end)
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Persist a characteristics callback onto a track and stamp analyzed_at
pub async fn update_characteristics(
    pool: &SqlitePool,
    id: Uuid,
    data: &CharacteristicsData,
    analyzed_at: chrono::DateTime<chrono::Utc>,
    analysis_version: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE tracks SET
            danceability = ?,
            acousticness = ?,
            instrumentalness = ?,
            valence = ?,
            arousal = ?,
            energy = ?,
            loudness = ?,
            spectral_centroid = ?,
            spectral_rolloff = ?,
            spectral_bandwidth = ?,
            zero_crossing_rate = ?,
            analyzed_at = ?,
            analysis_version = ?
        WHERE id = ?
        "#,
    )
    .bind(data.danceability as i64)
    .bind(data.acousticness as i64)
    .bind(data.instrumentalness as i64)
    .bind(data.valence)
    .bind(data.arousal)
    .bind(data.energy)
    .bind(data.loudness)
    .bind(data.spectral_centroid)
    .bind(data.spectral_rolloff)
    .bind(data.spectral_bandwidth)
    .bind(data.zero_crossing_rate)
    .bind(format_sqlite(&analyzed_at))
    .bind(analysis_version)
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
