//! Analysis job store
//!
//! Rows are keyed by (content_hash, created_at); multiple historical rows
//! per hash remain for audit. At most one row per hash is ever in
//! {queued, processing}; the queue engine enforces that, so mutating
//! statements target `WHERE content_hash = ? AND status IN (...)`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use sqlx::sqlite::SqliteRow;

use mixd_common::time::{format_sqlite, parse_sqlite_utc};

use crate::models::{AnalysisJob, AnalysisOptions, AnalysisStage, JobPriority, JobStatus};

const COLUMNS: &str = "content_hash, track_id, source_path, options, priority, status, \
                       retry_count, max_retries, stages_completed, progress, hook, \
                       created_at, started_at, completed_at, retry_at, last_error";

fn priority_from_rank(rank: i64) -> JobPriority {
    match rank {
        0 => JobPriority::Low,
        2 => JobPriority::High,
        _ => JobPriority::Normal,
    }
}

fn parse_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(s) => Ok(Some(parse_sqlite_utc(&s)?)),
        None => Ok(None),
    }
}

fn map_row(row: &SqliteRow) -> Result<AnalysisJob> {
    let options: AnalysisOptions = serde_json::from_str(row.get("options"))?;
    let stages_json: String = row.get("stages_completed");
    let stage_names: Vec<String> = serde_json::from_str(&stages_json)?;
    let stages_completed = stage_names
        .iter()
        .filter_map(|s| AnalysisStage::parse(s))
        .collect();

    let hook = match row.get::<Option<String>, _>("hook") {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    };

    let status_str: String = row.get("status");
    let status = JobStatus::parse(&status_str)
        .ok_or_else(|| anyhow::anyhow!("unknown job status {:?}", status_str))?;

    let track_id: String = row.get("track_id");

    Ok(AnalysisJob {
        content_hash: row.get("content_hash"),
        track_id: uuid::Uuid::parse_str(&track_id)?,
        source_path: row.get("source_path"),
        options,
        priority: priority_from_rank(row.get("priority")),
        status,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        stages_completed,
        progress: row.get::<i64, _>("progress") as u8,
        hook,
        created_at: parse_sqlite_utc(row.get("created_at"))?,
        started_at: parse_timestamp(row.get("started_at"))?,
        completed_at: parse_timestamp(row.get("completed_at"))?,
        retry_at: parse_timestamp(row.get("retry_at"))?,
        last_error: row.get("last_error"),
    })
}

fn stages_json(stages: &[AnalysisStage]) -> String {
    let names: Vec<&str> = stages.iter().map(AnalysisStage::as_str).collect();
    serde_json::to_string(&names).expect("stage names serialize")
}

/// Insert a new job row
pub async fn create(pool: &SqlitePool, job: &AnalysisJob) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO analysis_jobs
            (content_hash, track_id, source_path, options, priority, status,
             retry_count, max_retries, stages_completed, progress, hook,
             created_at, started_at, completed_at, retry_at, last_error)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&job.content_hash)
    .bind(job.track_id.to_string())
    .bind(&job.source_path)
    .bind(serde_json::to_string(&job.options)?)
    .bind(job.priority.rank())
    .bind(job.status.as_str())
    .bind(job.retry_count as i64)
    .bind(job.max_retries as i64)
    .bind(stages_json(&job.stages_completed))
    .bind(job.progress as i64)
    .bind(match &job.hook {
        Some(hook) => Some(serde_json::to_string(hook)?),
        None => None,
    })
    .bind(format_sqlite(&job.created_at))
    .bind(job.started_at.as_ref().map(format_sqlite))
    .bind(job.completed_at.as_ref().map(format_sqlite))
    .bind(job.retry_at.as_ref().map(format_sqlite))
    .bind(&job.last_error)
    .execute(pool)
    .await?;

    Ok(())
}

/// The queued-or-processing job for a hash, if any
pub async fn find_incomplete_by_hash(pool: &SqlitePool, hash: &str) -> Result<Option<AnalysisJob>> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM analysis_jobs
         WHERE content_hash = ? AND status IN ('queued', 'processing')
         ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(hash)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(map_row).transpose()
}

/// The most recent completed job for a hash, if any
pub async fn find_completed_by_hash(pool: &SqlitePool, hash: &str) -> Result<Option<AnalysisJob>> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM analysis_jobs
         WHERE content_hash = ? AND status = 'completed'
         ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(hash)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(map_row).transpose()
}

/// Dequeue candidates: queued jobs whose retry delay has elapsed, highest
/// priority first, oldest first within a band.
pub async fn find_queued(
    pool: &SqlitePool,
    limit: i64,
    now: DateTime<Utc>,
) -> Result<Vec<AnalysisJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM analysis_jobs
         WHERE status = 'queued' AND (retry_at IS NULL OR retry_at <= ?)
         ORDER BY priority DESC, created_at ASC, rowid ASC
         LIMIT ?"
    ))
    .bind(format_sqlite(&now))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(map_row).collect()
}

/// All jobs currently marked processing
pub async fn find_processing(pool: &SqlitePool) -> Result<Vec<AnalysisJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM analysis_jobs WHERE status = 'processing'
         ORDER BY started_at ASC"
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(map_row).collect()
}

/// queued → processing, stamping started_at. Returns false when the job is
/// no longer queued (raced with cancel or sweep).
pub async fn mark_processing(pool: &SqlitePool, hash: &str, now: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE analysis_jobs
         SET status = 'processing', started_at = ?, retry_at = NULL
         WHERE content_hash = ? AND status = 'queued'",
    )
    .bind(format_sqlite(&now))
    .bind(hash)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// incomplete → completed
///
/// Also reachable from queued: after crash recovery a re-queued job may have
/// its last stage delivered by a late callback from the pre-restart attempt.
pub async fn mark_completed(pool: &SqlitePool, hash: &str, now: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE analysis_jobs
         SET status = 'completed', completed_at = ?, progress = 100
         WHERE content_hash = ? AND status IN ('queued', 'processing')",
    )
    .bind(format_sqlite(&now))
    .bind(hash)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// incomplete → failed with an error message
pub async fn mark_failed(
    pool: &SqlitePool,
    hash: &str,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE analysis_jobs
         SET status = 'failed', completed_at = ?, last_error = ?
         WHERE content_hash = ? AND status IN ('queued', 'processing')",
    )
    .bind(format_sqlite(&now))
    .bind(error)
    .bind(hash)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// incomplete → cancelled
pub async fn mark_cancelled(pool: &SqlitePool, hash: &str, now: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE analysis_jobs
         SET status = 'cancelled', completed_at = ?
         WHERE content_hash = ? AND status IN ('queued', 'processing')",
    )
    .bind(format_sqlite(&now))
    .bind(hash)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Append a stage to stages_completed (at most once) and recompute progress.
/// Returns the updated job, or None when no incomplete job matches the hash.
pub async fn record_stage(
    pool: &SqlitePool,
    hash: &str,
    stage: AnalysisStage,
) -> Result<Option<AnalysisJob>> {
    let Some(mut job) = find_incomplete_by_hash(pool, hash).await? else {
        return Ok(None);
    };

    if !job.stages_completed.contains(&stage) {
        job.stages_completed.push(stage);
    }
    job.progress = AnalysisJob::progress_percent(&job.options, &job.stages_completed);

    sqlx::query(
        "UPDATE analysis_jobs SET stages_completed = ?, progress = ?
         WHERE content_hash = ? AND status IN ('queued', 'processing')",
    )
    .bind(stages_json(&job.stages_completed))
    .bind(job.progress as i64)
    .bind(hash)
    .execute(pool)
    .await?;

    Ok(Some(job))
}

/// Record a failed attempt. When retries remain, the job goes back to queued
/// with `retry_at = now + base_delay × 2^(attempt−1)` and the updated job is
/// returned; otherwise it transitions to failed and None is returned.
pub async fn increment_retry(
    pool: &SqlitePool,
    hash: &str,
    error: &str,
    base_delay: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<Option<AnalysisJob>> {
    let Some(mut job) = find_incomplete_by_hash(pool, hash).await? else {
        return Ok(None);
    };

    job.retry_count += 1;
    job.last_error = Some(error.to_string());

    if job.retry_count > job.max_retries {
        mark_failed(pool, hash, error, now).await?;
        return Ok(None);
    }

    let backoff = base_delay * 2_i32.pow(job.retry_count.saturating_sub(1).min(16));
    let retry_at = now + backoff;

    sqlx::query(
        "UPDATE analysis_jobs
         SET status = 'queued', retry_count = ?, last_error = ?, retry_at = ?, started_at = NULL
         WHERE content_hash = ? AND status IN ('queued', 'processing')",
    )
    .bind(job.retry_count as i64)
    .bind(error)
    .bind(format_sqlite(&retry_at))
    .bind(hash)
    .execute(pool)
    .await?;

    job.status = JobStatus::Queued;
    job.retry_at = Some(retry_at);
    job.started_at = None;
    Ok(Some(job))
}

/// Bump an incomplete job to high priority (stem re-requests)
pub async fn raise_priority(pool: &SqlitePool, hash: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE analysis_jobs SET priority = ?
         WHERE content_hash = ? AND status IN ('queued', 'processing')",
    )
    .bind(JobPriority::High.rank())
    .bind(hash)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Crash recovery: every processing job goes back to queued. The worker may
/// still deliver results for these hashes; the callback router records them
/// idempotently.
pub async fn recover_processing(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE analysis_jobs
         SET status = 'queued', started_at = NULL, retry_at = NULL
         WHERE status = 'processing'",
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Fail processing jobs whose started_at predates the cutoff; returns the
/// affected hashes so the caller can release in-flight slots and emit events.
pub async fn fail_stale_processing(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let hashes: Vec<String> = sqlx::query_scalar(
        "SELECT content_hash FROM analysis_jobs
         WHERE status = 'processing' AND started_at IS NOT NULL AND started_at < ?",
    )
    .bind(format_sqlite(&cutoff))
    .fetch_all(pool)
    .await?;

    for hash in &hashes {
        sqlx::query(
            "UPDATE analysis_jobs
             SET status = 'failed', completed_at = ?, last_error = 'processing timeout'
             WHERE content_hash = ? AND status = 'processing'",
        )
        .bind(format_sqlite(&now))
        .bind(hash)
        .execute(pool)
        .await?;
    }

    Ok(hashes)
}

/// Fail queued jobs older than the cutoff
pub async fn fail_stale_queued(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let hashes: Vec<String> = sqlx::query_scalar(
        "SELECT content_hash FROM analysis_jobs
         WHERE status = 'queued' AND created_at < ?",
    )
    .bind(format_sqlite(&cutoff))
    .fetch_all(pool)
    .await?;

    for hash in &hashes {
        sqlx::query(
            "UPDATE analysis_jobs
             SET status = 'failed', completed_at = ?, last_error = 'queue timeout'
             WHERE content_hash = ? AND status = 'queued'",
        )
        .bind(format_sqlite(&now))
        .bind(hash)
        .execute(pool)
        .await?;
    }

    Ok(hashes)
}

/// Delete terminal job rows older than the given number of days
pub async fn cleanup_older_than(pool: &SqlitePool, days: i64, now: DateTime<Utc>) -> Result<u64> {
    let cutoff = now - chrono::Duration::days(days);
    let result = sqlx::query(
        "DELETE FROM analysis_jobs
         WHERE status IN ('completed', 'failed', 'cancelled') AND created_at < ?",
    )
    .bind(format_sqlite(&cutoff))
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
