//! Queue engine tests: request rules, concurrency bound, sweeps, retries

mod helpers;

use chrono::Duration;
use mixd_cp::db::jobs;
use mixd_cp::models::{AnalysisJob, AnalysisOptions, JobPriority, JobStatus};
use uuid::Uuid;

#[tokio::test]
async fn fresh_request_creates_and_dispatch_respects_concurrency() {
    let h = helpers::harness().await;

    let t1 = helpers::insert_track(&h.db, &h.music_dir, "one").await;
    let t2 = helpers::insert_track(&h.db, &h.music_dir, "two").await;
    let t3 = helpers::insert_track(&h.db, &h.music_dir, "three").await;

    for track in [&t1, &t2, &t3] {
        h.queue
            .request_analysis(
                track,
                AnalysisOptions::standard(),
                JobPriority::Normal,
                None,
                false,
            )
            .await
            .unwrap();
    }

    h.queue.tick().await.unwrap();

    // max_concurrent = 2: two jobs dispatched, one still queued
    assert_eq!(h.queue.in_flight_count().await, 2);
    let processing = jobs::find_processing(&h.db).await.unwrap();
    assert_eq!(processing.len(), 2);
    let queued = jobs::find_queued(&h.db, 10, mixd_common::time::now())
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
}

#[tokio::test]
async fn duplicate_request_returns_existing_job() {
    let h = helpers::harness().await;
    let track = helpers::insert_track(&h.db, &h.music_dir, "dup").await;

    let first = h
        .queue
        .request_analysis(
            &track,
            AnalysisOptions::standard(),
            JobPriority::Normal,
            None,
            false,
        )
        .await
        .unwrap();
    let second = h
        .queue
        .request_analysis(
            &track,
            AnalysisOptions::standard(),
            JobPriority::High,
            None,
            false,
        )
        .await
        .unwrap();

    // Same active job both times; at most one incomplete row per hash
    assert_eq!(first.created_at, second.created_at);
    assert_eq!(second.priority, JobPriority::Normal);
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM analysis_jobs WHERE content_hash = ? AND status IN ('queued','processing')",
    )
    .bind(&track.content_hash)
    .fetch_one(&h.db)
    .await
    .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn completed_job_short_circuits_persistent_but_not_stems() {
    let h = helpers::harness().await;
    let track = helpers::insert_track(&h.db, &h.music_dir, "done").await;

    h.queue
        .request_analysis(
            &track,
            AnalysisOptions::standard(),
            JobPriority::Normal,
            None,
            false,
        )
        .await
        .unwrap();
    jobs::mark_processing(&h.db, &track.content_hash, mixd_common::time::now())
        .await
        .unwrap();
    h.queue
        .handle_job_completion(&track.content_hash)
        .await
        .unwrap();

    // Persistent features: the completed job is returned, nothing new queued
    let again = h
        .queue
        .request_analysis(
            &track,
            AnalysisOptions::standard(),
            JobPriority::Normal,
            None,
            false,
        )
        .await
        .unwrap();
    assert_eq!(again.status, JobStatus::Completed);

    // Stems are ephemeral: a stems request enqueues a new job
    let stems_job = h
        .queue
        .request_analysis(
            &track,
            AnalysisOptions::stems_only(),
            JobPriority::High,
            None,
            false,
        )
        .await
        .unwrap();
    assert_eq!(stems_job.status, JobStatus::Queued);
    assert!(stems_job.options.stems);
}

#[tokio::test]
async fn force_past_grace_cancels_and_recreates() {
    let h = helpers::harness().await;
    let track = helpers::insert_track(&h.db, &h.music_dir, "force").await;

    // An incomplete job older than the 60 s grace period
    let old = AnalysisJob {
        content_hash: track.content_hash.clone(),
        track_id: track.id,
        source_path: track.file_path.clone(),
        options: AnalysisOptions::standard(),
        priority: JobPriority::Normal,
        status: JobStatus::Queued,
        retry_count: 0,
        max_retries: 3,
        stages_completed: Vec::new(),
        progress: 0,
        hook: None,
        created_at: mixd_common::time::now_seconds() - Duration::seconds(120),
        started_at: None,
        completed_at: None,
        retry_at: None,
        last_error: None,
    };
    jobs::create(&h.db, &old).await.unwrap();

    // Without force the old job comes back
    let unforced = h
        .queue
        .request_analysis(
            &track,
            AnalysisOptions::standard(),
            JobPriority::Normal,
            None,
            false,
        )
        .await
        .unwrap();
    assert_eq!(unforced.created_at, old.created_at);

    // With force the old job is cancelled and a fresh one replaces it
    let forced = h
        .queue
        .request_analysis(
            &track,
            AnalysisOptions::standard(),
            JobPriority::Normal,
            None,
            true,
        )
        .await
        .unwrap();
    assert!(forced.created_at > old.created_at);

    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM analysis_jobs WHERE content_hash = ? AND status IN ('queued','processing')",
    )
    .bind(&track.content_hash)
    .fetch_one(&h.db)
    .await
    .unwrap();
    assert_eq!(count, 1);

    let cancelled: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM analysis_jobs WHERE content_hash = ? AND status = 'cancelled'",
    )
    .bind(&track.content_hash)
    .fetch_one(&h.db)
    .await
    .unwrap();
    assert_eq!(cancelled, 1);
}

#[tokio::test]
async fn staleness_sweep_fails_overdue_jobs() {
    let h = helpers::harness().await;
    let now = mixd_common::time::now();

    // J1: processing, started 90 minutes ago
    let j1 = helpers::content_hash("stale-processing");
    let mut row = AnalysisJob {
        content_hash: j1.clone(),
        track_id: Uuid::new_v4(),
        source_path: "/music/j1.flac".to_string(),
        options: AnalysisOptions::standard(),
        priority: JobPriority::Normal,
        status: JobStatus::Processing,
        retry_count: 0,
        max_retries: 3,
        stages_completed: Vec::new(),
        progress: 0,
        hook: None,
        created_at: now - Duration::minutes(95),
        started_at: Some(now - Duration::minutes(90)),
        completed_at: None,
        retry_at: None,
        last_error: None,
    };
    jobs::create(&h.db, &row).await.unwrap();

    // J2: queued, created two hours ago
    let j2 = helpers::content_hash("stale-queued");
    row.content_hash = j2.clone();
    row.status = JobStatus::Queued;
    row.started_at = None;
    row.created_at = now - Duration::hours(2);
    jobs::create(&h.db, &row).await.unwrap();

    let report = h.queue.sweep_stale().await.unwrap();
    assert_eq!(report.processing_failed, 1);
    assert_eq!(report.queued_failed, 1);

    for hash in [&j1, &j2] {
        assert!(jobs::find_incomplete_by_hash(&h.db, hash)
            .await
            .unwrap()
            .is_none());
        assert!(!h.queue.is_in_flight(hash).await);
    }
}

#[tokio::test]
async fn submission_failure_schedules_retry_then_permanent_failure() {
    let worker_url = helpers::spawn_stub_worker(true).await;
    let h = helpers::harness_with_worker(&worker_url).await;
    let track = helpers::insert_track(&h.db, &h.music_dir, "failing").await;

    h.queue
        .request_analysis(
            &track,
            AnalysisOptions::standard(),
            JobPriority::Normal,
            None,
            false,
        )
        .await
        .unwrap();

    // Worker answers health but 500s submissions: each tick burns one retry
    h.queue.tick().await.unwrap();
    let job = jobs::find_incomplete_by_hash(&h.db, &track.content_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.retry_count, 1);
    assert!(job.retry_at.is_some());
    assert_eq!(h.queue.in_flight_count().await, 0);

    // Drive the remaining retries by clearing the back-off gate
    for expected in [2, 3] {
        sqlx::query("UPDATE analysis_jobs SET retry_at = NULL WHERE content_hash = ?")
            .bind(&track.content_hash)
            .execute(&h.db)
            .await
            .unwrap();
        h.queue.tick().await.unwrap();
        if let Some(job) = jobs::find_incomplete_by_hash(&h.db, &track.content_hash)
            .await
            .unwrap()
        {
            assert_eq!(job.retry_count, expected);
        }
    }

    sqlx::query("UPDATE analysis_jobs SET retry_at = NULL WHERE content_hash = ?")
        .bind(&track.content_hash)
        .execute(&h.db)
        .await
        .unwrap();
    h.queue.tick().await.unwrap();

    // max_retries = 3 exhausted: permanently failed
    assert!(jobs::find_incomplete_by_hash(&h.db, &track.content_hash)
        .await
        .unwrap()
        .is_none());
    let status: String =
        sqlx::query_scalar("SELECT status FROM analysis_jobs WHERE content_hash = ?")
            .bind(&track.content_hash)
            .fetch_one(&h.db)
            .await
            .unwrap();
    assert_eq!(status, "failed");
}

#[tokio::test]
async fn cancel_removes_job_from_flight() {
    let h = helpers::harness().await;
    let track = helpers::insert_track(&h.db, &h.music_dir, "cancel").await;

    h.queue
        .request_analysis(
            &track,
            AnalysisOptions::standard(),
            JobPriority::Normal,
            None,
            false,
        )
        .await
        .unwrap();
    h.queue.tick().await.unwrap();
    assert!(h.queue.is_in_flight(&track.content_hash).await);

    assert!(h.queue.cancel_job(&track.content_hash).await.unwrap());
    assert!(!h.queue.is_in_flight(&track.content_hash).await);

    let status: String =
        sqlx::query_scalar("SELECT status FROM analysis_jobs WHERE content_hash = ?")
            .bind(&track.content_hash)
            .fetch_one(&h.db)
            .await
            .unwrap();
    assert_eq!(status, "cancelled");

    // Cancelling again is a no-op
    assert!(!h.queue.cancel_job(&track.content_hash).await.unwrap());
}

#[tokio::test]
async fn bulk_reanalyze_reports_per_track_errors() {
    let h = helpers::harness().await;
    let known = helpers::insert_track(&h.db, &h.music_dir, "bulk").await;
    let missing = Uuid::new_v4();

    let summary = h
        .queue
        .bulk_reanalyze(&[known.id, missing], AnalysisOptions::standard())
        .await;

    assert_eq!(summary.queued, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].track_id, missing);
}
