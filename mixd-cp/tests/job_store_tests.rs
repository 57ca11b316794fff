//! Job store tests: ordering, stage bookkeeping, retry policy, recovery

mod helpers;

use chrono::Duration;
use mixd_cp::db::{self, jobs};
use mixd_cp::models::{
    AnalysisJob, AnalysisOptions, AnalysisStage, JobPriority, JobStatus,
};
use uuid::Uuid;

fn job(hash: &str, priority: JobPriority, age_seconds: i64) -> AnalysisJob {
    AnalysisJob {
        content_hash: hash.to_string(),
        track_id: Uuid::new_v4(),
        source_path: format!("/music/{}.flac", &hash[..8]),
        options: AnalysisOptions::standard(),
        priority,
        status: JobStatus::Queued,
        retry_count: 0,
        max_retries: 3,
        stages_completed: Vec::new(),
        progress: 0,
        hook: None,
        created_at: mixd_common::time::now() - Duration::seconds(age_seconds),
        started_at: None,
        completed_at: None,
        retry_at: None,
        last_error: None,
    }
}

#[tokio::test]
async fn find_queued_orders_priority_then_age() {
    let pool = db::init_memory_pool().await.unwrap();

    let normal_old = helpers::content_hash("normal-old");
    let normal_new = helpers::content_hash("normal-new");
    let high_new = helpers::content_hash("high-new");
    let low_old = helpers::content_hash("low-old");

    jobs::create(&pool, &job(&normal_old, JobPriority::Normal, 300))
        .await
        .unwrap();
    jobs::create(&pool, &job(&normal_new, JobPriority::Normal, 10))
        .await
        .unwrap();
    jobs::create(&pool, &job(&high_new, JobPriority::High, 5))
        .await
        .unwrap();
    jobs::create(&pool, &job(&low_old, JobPriority::Low, 600))
        .await
        .unwrap();

    let queued = jobs::find_queued(&pool, 10, mixd_common::time::now())
        .await
        .unwrap();
    let order: Vec<&str> = queued.iter().map(|j| j.content_hash.as_str()).collect();
    assert_eq!(order, vec![&high_new, &normal_old, &normal_new, &low_old]);
}

#[tokio::test]
async fn retry_at_gates_dequeue() {
    let pool = db::init_memory_pool().await.unwrap();
    let hash = helpers::content_hash("delayed");

    let mut delayed = job(&hash, JobPriority::Normal, 10);
    delayed.retry_at = Some(mixd_common::time::now() + Duration::seconds(120));
    jobs::create(&pool, &delayed).await.unwrap();

    let now = mixd_common::time::now();
    assert!(jobs::find_queued(&pool, 10, now).await.unwrap().is_empty());

    let later = now + Duration::seconds(180);
    assert_eq!(jobs::find_queued(&pool, 10, later).await.unwrap().len(), 1);
}

#[tokio::test]
async fn record_stage_is_monotone_and_recomputes_progress() {
    let pool = db::init_memory_pool().await.unwrap();
    let hash = helpers::content_hash("stages");
    jobs::create(&pool, &job(&hash, JobPriority::Normal, 0))
        .await
        .unwrap();

    let updated = jobs::record_stage(&pool, &hash, AnalysisStage::BasicFeatures)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.stages_completed, vec![AnalysisStage::BasicFeatures]);
    assert_eq!(updated.progress, 50);

    // Recording the same stage again must not duplicate it
    let updated = jobs::record_stage(&pool, &hash, AnalysisStage::BasicFeatures)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.stages_completed, vec![AnalysisStage::BasicFeatures]);
    assert_eq!(updated.progress, 50);

    let updated = jobs::record_stage(&pool, &hash, AnalysisStage::Characteristics)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.progress, 100);
    assert!(updated.all_stages_done());
}

#[tokio::test]
async fn increment_retry_backs_off_exponentially_then_fails() {
    let pool = db::init_memory_pool().await.unwrap();
    let hash = helpers::content_hash("retry");
    let mut failing = job(&hash, JobPriority::Normal, 0);
    failing.max_retries = 2;
    jobs::create(&pool, &failing).await.unwrap();

    let base = Duration::seconds(5);
    let now = mixd_common::time::now();

    let first = jobs::increment_retry(&pool, &hash, "boom", base, now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.retry_count, 1);
    assert_eq!(first.retry_at.unwrap(), now + base);

    let second = jobs::increment_retry(&pool, &hash, "boom", base, now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.retry_count, 2);
    assert_eq!(second.retry_at.unwrap(), now + base * 2);

    // Third failure exhausts max_retries = 2
    let third = jobs::increment_retry(&pool, &hash, "boom", base, now)
        .await
        .unwrap();
    assert!(third.is_none());

    assert!(jobs::find_incomplete_by_hash(&pool, &hash)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn recover_processing_requeues_everything() {
    let pool = db::init_memory_pool().await.unwrap();

    for seed in ["r1", "r2", "r3"] {
        let hash = helpers::content_hash(seed);
        jobs::create(&pool, &job(&hash, JobPriority::Normal, 30))
            .await
            .unwrap();
        jobs::mark_processing(&pool, &hash, mixd_common::time::now())
            .await
            .unwrap();
    }
    assert_eq!(jobs::find_processing(&pool).await.unwrap().len(), 3);

    let recovered = jobs::recover_processing(&pool).await.unwrap();
    assert_eq!(recovered, 3);
    assert!(jobs::find_processing(&pool).await.unwrap().is_empty());

    let queued = jobs::find_queued(&pool, 10, mixd_common::time::now())
        .await
        .unwrap();
    assert_eq!(queued.len(), 3);
    assert!(queued.iter().all(|j| j.started_at.is_none()));
}

#[tokio::test]
async fn completed_history_is_kept_per_hash() {
    let pool = db::init_memory_pool().await.unwrap();
    let hash = helpers::content_hash("history");

    // First run completes
    jobs::create(&pool, &job(&hash, JobPriority::Normal, 600))
        .await
        .unwrap();
    jobs::mark_processing(&pool, &hash, mixd_common::time::now())
        .await
        .unwrap();
    jobs::mark_completed(&pool, &hash, mixd_common::time::now())
        .await
        .unwrap();

    // Second run for the same hash coexists as a separate row
    jobs::create(&pool, &job(&hash, JobPriority::High, 0))
        .await
        .unwrap();

    let completed = jobs::find_completed_by_hash(&pool, &hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed.status, JobStatus::Completed);

    let incomplete = jobs::find_incomplete_by_hash(&pool, &hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(incomplete.status, JobStatus::Queued);
    assert_eq!(incomplete.priority, JobPriority::High);
}

#[tokio::test]
async fn cleanup_drops_only_old_terminal_rows() {
    let pool = db::init_memory_pool().await.unwrap();
    let old_done = helpers::content_hash("old-done");
    let fresh_done = helpers::content_hash("fresh-done");
    let old_queued = helpers::content_hash("old-queued");

    let mut row = job(&old_done, JobPriority::Normal, 40 * 24 * 3600);
    row.status = JobStatus::Completed;
    jobs::create(&pool, &row).await.unwrap();

    let mut row = job(&fresh_done, JobPriority::Normal, 3600);
    row.status = JobStatus::Completed;
    jobs::create(&pool, &row).await.unwrap();

    jobs::create(&pool, &job(&old_queued, JobPriority::Normal, 40 * 24 * 3600))
        .await
        .unwrap();

    let deleted = jobs::cleanup_older_than(&pool, 30, mixd_common::time::now())
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    // The queued row survives regardless of age (the sweep handles it)
    assert!(jobs::find_incomplete_by_hash(&pool, &old_queued)
        .await
        .unwrap()
        .is_some());
    assert!(jobs::find_completed_by_hash(&pool, &fresh_done)
        .await
        .unwrap()
        .is_some());
}
