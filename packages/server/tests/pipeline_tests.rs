//! Pipeline coordinator tests against the in-memory store and mock executors.
//!
//! Covers the happy path, retry rules, the cumulative time budget, checkpoint
//! resumption and claim fencing.

mod common;

use std::sync::Arc;
use std::time::Duration;

use crate::common::{test_settings, TestApp};
use vidscribe::config::PipelineSettings;
use vidscribe::domains::transcription::{ClaimOutcome, SubmitRequest};
use vidscribe::kernel::jobs::{
    ErrorKind, JobState, JobStore, ModelSize, OutputFormat, Segment, Stage, StoreError,
};
use vidscribe::kernel::test_dependencies::{MockAudioExtractor, MockDownloader, MockTranscriber};
use vidscribe::kernel::{AudioRef, FailureKind, MediaRef, TestDependencies};

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn text_job_runs_every_stage_and_completes() {
    let app = TestApp::new(TestDependencies::new());
    let job_id = app.submit("https://video.example/watch?v=abc").await;

    let job = app
        .coordinator()
        .run(job_id, "worker-1")
        .await
        .expect("store should not fail")
        .expect("job should be claimed");

    assert_eq!(job.state, JobState::Completed);
    assert!(job.error.is_none());
    assert!(job.claim.is_none(), "terminal write releases the claim");

    let result = job.result.expect("completed job carries a result");
    assert_eq!(result.format, OutputFormat::Text);
    assert_eq!(result.text, "Hello world. This is a test.");
    assert_eq!(result.detected_language, "en");
    assert_eq!(result.source_duration_seconds, 3.0);
    assert!(result.segments.is_none());
    assert!(result.subtitle.is_none());

    assert_eq!(app.mocks.downloader.calls(), 1);
    assert_eq!(app.mocks.extractor.calls(), 1);
    assert_eq!(app.mocks.transcriber.calls(), 1);
    assert_eq!(
        app.mocks.downloader.fetched_urls(),
        vec!["https://video.example/watch?v=abc".to_string()]
    );
}

#[tokio::test]
async fn subtitle_job_renders_srt_from_segments() {
    let mocks = TestDependencies::new().with_transcriber(MockTranscriber::new().with_transcript(
        " Bonjour. Au revoir. ",
        vec![
            Segment {
                start: 0.0,
                end: 1.25,
                text: "Bonjour.".to_string(),
            },
            Segment {
                start: 1.25,
                end: 62.5,
                text: "Au revoir.".to_string(),
            },
        ],
        "fr",
    ));
    let app = TestApp::new(mocks);
    let job_id = app
        .submit_request(SubmitRequest {
            video_url: "https://video.example/fr".to_string(),
            output_format: Some("srt".to_string()),
            language: Some("fr".to_string()),
            model_size: Some("medium".to_string()),
        })
        .await;

    let job = app.coordinator().run(job_id, "worker-1").await.unwrap().unwrap();
    let result = job.result.unwrap();

    assert_eq!(result.format, OutputFormat::Subtitle);
    assert_eq!(result.text, "Bonjour. Au revoir.");
    assert_eq!(result.detected_language, "fr");
    assert_eq!(result.segments.as_ref().map(Vec::len), Some(2));
    assert_eq!(
        result.subtitle.as_deref(),
        Some("1\n00:00:00,000 --> 00:00:01,250\nBonjour.\n\n2\n00:00:01,250 --> 00:01:02,500\nAu revoir.\n")
    );

    let args = app.mocks.transcriber.call_args();
    assert_eq!(args.len(), 1);
    assert_eq!(args[0].language.as_deref(), Some("fr"));
    assert_eq!(args[0].model, ModelSize::Medium);
}

#[tokio::test]
async fn each_stage_receives_the_previous_stage_output() {
    let app = TestApp::new(TestDependencies::new());
    let job_id = app.submit("https://video.example/chain").await;

    app.coordinator().run(job_id, "worker-1").await.unwrap().unwrap();

    let work_dir = app.deps.settings.work_root.join(job_id.to_string());
    assert_eq!(app.mocks.extractor.inputs(), vec![MediaRef(work_dir.join("source.mp4"))]);
    assert_eq!(
        app.mocks.transcriber.call_args()[0].audio,
        AudioRef(work_dir.join("audio.wav"))
    );
}

#[tokio::test]
async fn work_dir_is_removed_once_terminal() {
    let app = TestApp::new(TestDependencies::new());
    let job_id = app.submit("https://video.example/cleanup").await;

    app.coordinator().run(job_id, "worker-1").await.unwrap().unwrap();

    let work_dir = app.deps.settings.work_root.join(job_id.to_string());
    assert!(!work_dir.exists());
}

// ============================================================================
// Retry rules
// ============================================================================

#[tokio::test]
async fn transient_download_failure_is_retried_then_succeeds() {
    let mocks = TestDependencies::new().with_downloader(
        MockDownloader::new()
            .with_failure(FailureKind::TransientFailure, "HTTP Error 503")
            .with_duration(42.0),
    );
    let app = TestApp::new(mocks);
    let job_id = app.submit("https://video.example/flaky").await;

    let job = app.coordinator().run(job_id, "worker-1").await.unwrap().unwrap();

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(app.mocks.downloader.calls(), 2);
    assert_eq!(job.result.unwrap().source_duration_seconds, 42.0);
}

#[tokio::test]
async fn transient_failures_past_the_bound_become_retries_exhausted() {
    let mocks = TestDependencies::new().with_extractor(
        MockAudioExtractor::new()
            .with_failure(FailureKind::TransientFailure, "disk full")
            .with_failure(FailureKind::TransientFailure, "disk full")
            .with_failure(FailureKind::TransientFailure, "disk full"),
    );
    let app = TestApp::new(mocks);
    let job_id = app.submit("https://video.example/full-disk").await;

    let job = app.coordinator().run(job_id, "worker-1").await.unwrap().unwrap();

    assert_eq!(job.state, JobState::Failed);
    assert!(job.result.is_none());
    let error = job.error.unwrap();
    assert_eq!(error.stage, Stage::ExtractAudio);
    assert_eq!(error.kind, ErrorKind::RetriesExhausted);
    assert_eq!(error.attempts, 3);
    assert!(error.message.contains("disk full"));
    assert_eq!(app.mocks.extractor.calls(), 3);
    assert_eq!(app.mocks.transcriber.calls(), 0);
    assert_eq!(job.progress_label.as_deref(), Some("failed during extract_audio"));
}

#[tokio::test]
async fn non_transient_failures_are_never_retried() {
    let cases = [
        (FailureKind::InvalidInput, ErrorKind::InvalidInput),
        (FailureKind::UnsupportedMedia, ErrorKind::UnsupportedMedia),
        (FailureKind::InternalError, ErrorKind::InternalError),
    ];

    for (failure, expected) in cases {
        let mocks =
            TestDependencies::new().with_downloader(MockDownloader::new().with_failure(failure, "nope"));
        let app = TestApp::new(mocks);
        let job_id = app.submit("https://video.example/bad").await;

        let job = app.coordinator().run(job_id, "worker-1").await.unwrap().unwrap();

        let error = job.error.expect("job should fail");
        assert_eq!(error.kind, expected);
        assert_eq!(error.stage, Stage::Download);
        assert_eq!(error.attempts, 1);
        assert_eq!(error.message, "nope");
        assert_eq!(app.mocks.downloader.calls(), 1, "{failure} must not be retried");
        assert_eq!(app.mocks.extractor.calls(), 0);
    }
}

#[tokio::test]
async fn single_attempt_setting_disables_retries() {
    let mocks = TestDependencies::new().with_transcriber(
        MockTranscriber::new().with_failure(FailureKind::TransientFailure, "CUDA out of memory"),
    );
    let settings = PipelineSettings {
        max_attempts: 1,
        ..test_settings()
    };
    let app = TestApp::with_settings(mocks, settings);
    let job_id = app.submit("https://video.example/oom").await;

    let job = app.coordinator().run(job_id, "worker-1").await.unwrap().unwrap();

    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::RetriesExhausted);
    assert_eq!(error.stage, Stage::Transcribe);
    assert_eq!(app.mocks.transcriber.calls(), 1);
}

// ============================================================================
// Cumulative time budget
// ============================================================================

#[tokio::test(start_paused = true)]
async fn slow_stage_fails_the_job_with_timeout() {
    let mocks = TestDependencies::new()
        .with_transcriber(MockTranscriber::new().with_delay(Duration::from_secs(120)));
    let settings = PipelineSettings {
        job_budget: Duration::from_secs(60),
        ..test_settings()
    };
    let app = TestApp::with_settings(mocks, settings);
    let job_id = app.submit("https://video.example/long").await;

    let job = app.coordinator().run(job_id, "worker-1").await.unwrap().unwrap();

    assert_eq!(job.state, JobState::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert_eq!(error.stage, Stage::Transcribe);
    assert!(job.claim.is_none());
}

#[tokio::test(start_paused = true)]
async fn budget_covers_retries_not_just_one_attempt() {
    // Every attempt fits the budget on its own; three of them do not.
    let mocks = TestDependencies::new().with_downloader(
        MockDownloader::new()
            .with_delay(Duration::from_secs(25))
            .with_failure(FailureKind::TransientFailure, "connection reset")
            .with_failure(FailureKind::TransientFailure, "connection reset"),
    );
    let settings = PipelineSettings {
        job_budget: Duration::from_secs(60),
        ..test_settings()
    };
    let app = TestApp::with_settings(mocks, settings);
    let job_id = app.submit("https://video.example/slow-retry").await;

    let job = app.coordinator().run(job_id, "worker-1").await.unwrap().unwrap();

    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert_eq!(error.stage, Stage::Download);
    assert_eq!(error.attempts, 3);
}

#[tokio::test]
async fn job_whose_budget_was_spent_before_resuming_times_out_immediately() {
    let app = TestApp::new(TestDependencies::new());
    let job_id = app.submit("https://video.example/stale").await;

    let mut job = app.job(job_id).await;
    job.started_at = Some(chrono::Utc::now() - chrono::Duration::hours(2));
    app.store.force(job).await;

    let job = app.coordinator().run(job_id, "worker-2").await.unwrap().unwrap();

    assert_eq!(job.error.unwrap().kind, ErrorKind::Timeout);
    assert_eq!(app.mocks.downloader.calls(), 0);
}

// ============================================================================
// Claims, fencing and resumption
// ============================================================================

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    let app = TestApp::new(TestDependencies::new());
    let job_id = app.submit("https://video.example/race").await;
    let coordinator = Arc::new(app.coordinator());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.claim(job_id, &format!("worker-{i}")).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            ClaimOutcome::Claimed(_) => winners += 1,
            ClaimOutcome::AlreadyClaimed { .. } => {}
            other => panic!("unexpected claim outcome: {other:?}"),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn terminal_and_unknown_jobs_cannot_be_claimed() {
    let app = TestApp::new(TestDependencies::new());
    let job_id = app.submit("https://video.example/done").await;
    let coordinator = app.coordinator();
    coordinator.run(job_id, "worker-1").await.unwrap().unwrap();

    assert!(matches!(
        coordinator.claim(job_id, "worker-2").await.unwrap(),
        ClaimOutcome::Finished(JobState::Completed)
    ));
    assert!(matches!(
        coordinator.claim(vidscribe::common::JobId::new(), "worker-2").await.unwrap(),
        ClaimOutcome::Missing
    ));
    assert!(coordinator.run(job_id, "worker-2").await.unwrap().is_none());
}

#[tokio::test]
async fn stale_worker_is_fenced_off_after_takeover() {
    let settings = PipelineSettings {
        lease: Duration::from_millis(1),
        ..test_settings()
    };
    let app = TestApp::with_settings(TestDependencies::new(), settings);
    let job_id = app.submit("https://video.example/takeover").await;
    let coordinator = app.coordinator();

    let ClaimOutcome::Claimed(stale) = coordinator.claim(job_id, "worker-old").await.unwrap() else {
        panic!("first claim should succeed");
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let ClaimOutcome::Claimed(fresh) = coordinator.claim(job_id, "worker-new").await.unwrap() else {
        panic!("expired lease should be taken over");
    };

    assert!(matches!(
        coordinator.heartbeat(job_id, stale.token).await,
        Err(StoreError::ClaimLost(_))
    ));
    assert!(matches!(
        coordinator.execute(stale).await,
        Err(StoreError::ClaimLost(_))
    ));
    assert_eq!(app.mocks.downloader.calls(), 0, "fenced worker must not run stages");

    let job = coordinator.execute(fresh).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
}

#[tokio::test]
async fn resumed_job_does_not_rerun_succeeded_stages() {
    let app = TestApp::new(TestDependencies::new());
    let job_id = app.submit("https://video.example/resume").await;

    // A previous worker finished the download and died during extraction.
    let mut job = app.job(job_id).await;
    job.state = JobState::ExtractingAudio;
    job.started_at = Some(chrono::Utc::now());
    job.artifacts.media_ref = Some(MediaRef("/data/prev/source.webm".into()));
    job.artifacts.duration_seconds = Some(17.5);
    app.store.force(job).await;

    let job = app.coordinator().run(job_id, "worker-2").await.unwrap().unwrap();

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(app.mocks.downloader.calls(), 0);
    assert_eq!(app.mocks.extractor.inputs(), vec![MediaRef("/data/prev/source.webm".into())]);
    assert_eq!(job.result.unwrap().source_duration_seconds, 17.5);
}

#[tokio::test]
async fn resume_without_checkpoint_is_an_internal_error() {
    let app = TestApp::new(TestDependencies::new());
    let job_id = app.submit("https://video.example/lost-checkpoint").await;

    let mut job = app.job(job_id).await;
    job.state = JobState::Transcribing;
    app.store.force(job).await;

    let job = app.coordinator().run(job_id, "worker-2").await.unwrap().unwrap();

    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::InternalError);
    assert_eq!(error.stage, Stage::Transcribe);
    assert_eq!(app.mocks.transcriber.calls(), 0);
}

#[tokio::test]
async fn released_claim_can_be_taken_immediately() {
    let app = TestApp::new(TestDependencies::new());
    let job_id = app.submit("https://video.example/release").await;
    let coordinator = app.coordinator();

    let ClaimOutcome::Claimed(first) = coordinator.claim(job_id, "worker-1").await.unwrap() else {
        panic!("claim should succeed");
    };
    coordinator.release(job_id, first.token).await.unwrap();

    assert!(matches!(
        coordinator.claim(job_id, "worker-2").await.unwrap(),
        ClaimOutcome::Claimed(_)
    ));
}

#[tokio::test]
async fn abort_records_an_internal_error_at_the_current_stage() {
    let app = TestApp::new(TestDependencies::new());
    let job_id = app.submit("https://video.example/abort").await;
    let coordinator = app.coordinator();

    let ClaimOutcome::Claimed(claimed) = coordinator.claim(job_id, "worker-1").await.unwrap() else {
        panic!("claim should succeed");
    };
    let job = coordinator
        .abort(job_id, claimed.token, ErrorKind::InternalError, "executor panicked: boom")
        .await
        .unwrap();

    assert_eq!(job.state, JobState::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::InternalError);
    assert_eq!(error.stage, Stage::Download);
    assert_eq!(error.message, "executor panicked: boom");

    // Terminal records are immutable.
    assert!(app.store.get(job_id).await.unwrap().is_terminal());
    assert!(matches!(
        coordinator.abort(job_id, claimed.token, ErrorKind::InternalError, "again").await,
        Err(StoreError::ClaimLost(_))
    ));
}
