//! Callback router tests: the first-time-analysis flow, idempotency gates,
//! worker control messages

mod helpers;

use serde_json::json;

use mixd_cp::db::{jobs, tracks, waveforms};
use mixd_cp::models::{AnalysisOptions, AnalysisStage, JobPriority, JobStatus};
use mixd_cp::services::CallbackError;

fn waveform_block(zoom: u8, pixels: usize) -> serde_json::Value {
    json!({
        "zoom_level": zoom,
        "sample_rate": 44100,
        "samples_per_pixel": 4096 >> (zoom * 2),
        "num_pixels": pixels,
        "low_freq_amplitude": vec![0.1_f32; pixels],
        "low_freq_intensity": vec![0.2_f32; pixels],
        "mid_freq_amplitude": vec![0.3_f32; pixels],
        "mid_freq_intensity": vec![0.4_f32; pixels],
        "high_freq_amplitude": vec![0.5_f32; pixels],
        "high_freq_intensity": vec![0.6_f32; pixels],
    })
}

fn basic_features_body(hash: &str) -> serde_json::Value {
    json!({
        "job_id": hash,
        "stage": "basic_features",
        "data": {
            "tempo": 128.0,
            "key": 5,
            "key_name": "F",
            "mode": 1,
            "mode_name": "major",
            "beats": [0.468, 0.937, 1.406, 1.875, 2.343],
            "downbeats": [0.468, 2.343],
            "firstBeatOffset": 0.468,
            "firstPhraseBeatNo": 1,
            "waveforms": [waveform_block(0, 8), waveform_block(1, 16), waveform_block(2, 32)],
        },
    })
}

fn characteristics_body(hash: &str) -> serde_json::Value {
    json!({
        "job_id": hash,
        "stage": "characteristics",
        "data": {
            "danceability": true,
            "acousticness": false,
            "instrumentalness": false,
            "valence": 0.72,
            "arousal": 0.61,
            "energy": 0.81,
            "loudness": -6.2,
            "spectral_centroid": 2431.0,
            "spectral_rolloff": 6812.0,
            "zero_crossing_rate": 0.091,
        },
    })
}

#[tokio::test]
async fn first_time_analysis_persists_features_and_completes() {
    let h = helpers::harness().await;
    let track = helpers::insert_track(&h.db, &h.music_dir, "s1").await;
    let hash = track.content_hash.clone();

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

    // Stage 1: basic features
    h.router
        .handle_callback(&basic_features_body(&hash))
        .await
        .unwrap();

    let updated = tracks::get(&h.db, track.id).await.unwrap().unwrap();
    assert_eq!(updated.tempo, Some(128.0));
    assert_eq!(updated.musical_key, Some(5));
    assert_eq!(updated.mode, Some(1));
    assert_eq!(updated.first_beat_offset, Some(0.468));
    assert_eq!(updated.beats.as_ref().unwrap().len(), 5);

    for zoom in 0..=2 {
        let wf = waveforms::get(&h.db, &hash, zoom, false).await.unwrap();
        assert!(wf.is_some(), "waveform zoom {} missing", zoom);
    }

    let job = jobs::find_incomplete_by_hash(&h.db, &hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.progress, 50);
    assert_eq!(job.stages_completed, vec![AnalysisStage::BasicFeatures]);

    // Stage 2: characteristics completes the job
    h.router
        .handle_callback(&characteristics_body(&hash))
        .await
        .unwrap();

    let updated = tracks::get(&h.db, track.id).await.unwrap().unwrap();
    assert_eq!(updated.valence, Some(0.72));
    assert_eq!(updated.loudness, Some(-6.2));
    assert_eq!(updated.danceability, Some(true));
    assert!(updated.analyzed_at.is_some());

    assert!(jobs::find_incomplete_by_hash(&h.db, &hash)
        .await
        .unwrap()
        .is_none());
    let done = jobs::find_completed_by_hash(&h.db, &hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert!(!h.queue.is_in_flight(&hash).await);
}

#[tokio::test]
async fn late_callback_for_completed_job_is_dropped() {
    let h = helpers::harness().await;
    let track = helpers::insert_track(&h.db, &h.music_dir, "late").await;
    let hash = track.content_hash.clone();

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
    h.router
        .handle_callback(&basic_features_body(&hash))
        .await
        .unwrap();
    h.router
        .handle_callback(&characteristics_body(&hash))
        .await
        .unwrap();

    // Replay after completion: accepted quietly, nothing double-recorded
    h.router
        .handle_callback(&basic_features_body(&hash))
        .await
        .unwrap();

    let done = jobs::find_completed_by_hash(&h.db, &hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.stages_completed.len(), 2);
    assert_eq!(done.progress, 100);
}

#[tokio::test]
async fn replay_on_incomplete_job_reprocesses_without_duplicating() {
    let h = helpers::harness().await;
    let track = helpers::insert_track(&h.db, &h.music_dir, "replay").await;
    let hash = track.content_hash.clone();

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

    h.router
        .handle_callback(&basic_features_body(&hash))
        .await
        .unwrap();
    // The same stage again while the job is still processing: allowed, and
    // the stage list stays deduplicated
    h.router
        .handle_callback(&basic_features_body(&hash))
        .await
        .unwrap();

    let job = jobs::find_incomplete_by_hash(&h.db, &hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.stages_completed, vec![AnalysisStage::BasicFeatures]);
    assert_eq!(job.progress, 50);
}

#[tokio::test]
async fn callback_for_unknown_job_is_dropped() {
    let h = helpers::harness().await;
    let unknown = helpers::content_hash("never-enqueued");

    // No job for this hash exists; the callback is logged and dropped
    h.router
        .handle_callback(&basic_features_body(&unknown))
        .await
        .unwrap();

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM analysis_jobs")
        .fetch_one(&h.db)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn validation_failures_never_touch_the_job() {
    let h = helpers::harness().await;
    let track = helpers::insert_track(&h.db, &h.music_dir, "invalid").await;
    let hash = track.content_hash.clone();

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

    // Missing tempo entirely
    let result = h
        .router
        .handle_callback(&json!({
            "job_id": hash,
            "stage": "basic_features",
            "data": { "beats": [] },
        }))
        .await;
    match result {
        Err(CallbackError::Validation(fields)) => {
            assert!(fields.iter().any(|f| f.field == "tempo"));
        }
        other => panic!("expected validation error, got {:?}", other.is_ok()),
    }

    // The job is untouched: still processing, no stages recorded
    let job = jobs::find_incomplete_by_hash(&h.db, &hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert!(job.stages_completed.is_empty());
}

#[tokio::test]
async fn worker_job_completed_and_local_completion_are_redundant() {
    let h = helpers::harness().await;
    let track = helpers::insert_track(&h.db, &h.music_dir, "redundant").await;
    let hash = track.content_hash.clone();

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

    h.router
        .handle_callback(&basic_features_body(&hash))
        .await
        .unwrap();
    h.router
        .handle_callback(&characteristics_body(&hash))
        .await
        .unwrap();

    // The worker's own completion signal arrives second: a no-op
    h.router
        .handle_callback(&json!({
            "job_id": hash,
            "stage": "job_completed",
            "data": {},
        }))
        .await
        .unwrap();

    let done = jobs::find_completed_by_hash(&h.db, &hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
}

#[tokio::test]
async fn worker_error_callback_drives_retry_machinery() {
    let h = helpers::harness().await;
    let track = helpers::insert_track(&h.db, &h.music_dir, "worker-err").await;
    let hash = track.content_hash.clone();

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

    h.router
        .handle_callback(&json!({
            "job_id": hash,
            "stage": "error",
            "data": { "error": "decoder exploded" },
        }))
        .await
        .unwrap();

    let job = jobs::find_incomplete_by_hash(&h.db, &hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.last_error.as_deref(), Some("decoder exploded"));
}

#[tokio::test]
async fn crash_recovery_then_late_callbacks_reach_crash_free_state() {
    let h = helpers::harness().await;
    let track = helpers::insert_track(&h.db, &h.music_dir, "crash").await;
    let hash = track.content_hash.clone();

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

    // Simulated restart: processing jobs go back to queued
    let recovered = h.queue.recover_interrupted().await.unwrap();
    assert_eq!(recovered, 1);

    // Late callbacks from the pre-restart worker run arrive afterwards
    h.router
        .handle_callback(&basic_features_body(&hash))
        .await
        .unwrap();
    h.router
        .handle_callback(&characteristics_body(&hash))
        .await
        .unwrap();

    // Final state identical to a crash-free run
    let done = jobs::find_completed_by_hash(&h.db, &hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    let updated = tracks::get(&h.db, track.id).await.unwrap().unwrap();
    assert_eq!(updated.tempo, Some(128.0));
}
