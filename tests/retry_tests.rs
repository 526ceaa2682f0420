//! Integration tests for retrying failed jobs.

mod test_utils;

use std::sync::Arc;

use anyhow::Result;
use posture_analysis::error::JobError;
use posture_analysis::models::JobStatus;
use posture_analysis::orchestrator::{JobOrchestrator, SubmitVideo};
use posture_analysis::repositories::{JobStore, JobUpdate};
use posture_analysis::retry::RetryController;
use test_utils::{GenerateStep, ScriptedEngine, fast_policy, job_store, setup_test_db, wait_for_terminal};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    store: Arc<dyn JobStore>,
    orchestrator: JobOrchestrator,
    retry: RetryController,
    engine: Arc<ScriptedEngine>,
    _scratch: tempfile::TempDir,
}

async fn harness(engine: ScriptedEngine) -> Result<Harness> {
    let db = setup_test_db().await?;
    let scratch = tempfile::tempdir()?;
    let store = job_store(&db);
    let engine = Arc::new(engine);
    let orchestrator = test_utils::orchestrator(store.clone(), engine.clone(), fast_policy(scratch.path()));
    let retry = RetryController::new(store.clone(), orchestrator.clone());
    Ok(Harness {
        store,
        orchestrator,
        retry,
        engine,
        _scratch: scratch,
    })
}

/// Media host whose first fetch fails and later fetches succeed.
async fn flaky_media_host() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/videos/squat.mp4"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/videos/squat.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"video".to_vec()))
        .mount(&server)
        .await;
    server
}

fn video(server: &MockServer) -> SubmitVideo {
    SubmitVideo {
        media_reference: format!("{}/videos/squat.mp4", server.uri()),
        filename: "squat.mp4".to_string(),
        content_type: "video/mp4".to_string(),
    }
}

#[tokio::test]
async fn test_retry_reprocesses_failed_job_under_same_id() -> Result<()> {
    let media = flaky_media_host().await;
    let h = harness(ScriptedEngine::new().with_generate(vec![GenerateStep::Text(
        "retry report".to_string(),
    )]))
    .await?;

    let job_id = h.orchestrator.start_analysis(video(&media)).await?;
    let failed = wait_for_terminal(&h.store, job_id).await?;
    assert_eq!(failed.status, JobStatus::Failed);
    let first_attempt = failed.current_attempt();

    let accepted = h.retry.retry(job_id).await?;
    assert_eq!(accepted.original_job_id, job_id);
    assert_eq!(accepted.status, JobStatus::Pending);
    assert_ne!(accepted.processing_attempt_id, first_attempt);

    let record = wait_for_terminal(&h.store, job_id).await?;
    assert_eq!(record.status, JobStatus::Completed);
    assert!(record.error_message.is_none());
    assert_eq!(record.report.as_ref().unwrap().text, "retry report");
    assert_eq!(record.attempts, 2);
    assert_eq!(record.current_attempt(), accepted.processing_attempt_id);
    assert_eq!(h.store.list_recent(10).await?.len(), 1, "no new record");

    // The superseded attempt can no longer touch the record
    let stale = h
        .store
        .update(job_id, first_attempt, JobUpdate::failed("late failure"))
        .await?;
    assert!(!stale);
    Ok(())
}

#[tokio::test]
async fn test_retry_rejects_unknown_and_non_failed_jobs() -> Result<()> {
    let media = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"video".to_vec()))
        .mount(&media)
        .await;
    let h = harness(ScriptedEngine::new()).await?;

    let unknown = posture_analysis::models::JobId::new();
    assert!(matches!(
        h.retry.retry(unknown).await,
        Err(JobError::NotFound(id)) if id == unknown
    ));

    let job_id = h.orchestrator.start_analysis(video(&media)).await?;
    let record = wait_for_terminal(&h.store, job_id).await?;
    assert_eq!(record.status, JobStatus::Completed);

    match h.retry.retry(job_id).await {
        Err(JobError::InvalidState { status, .. }) => assert_eq!(status, JobStatus::Completed),
        other => panic!("unexpected retry result: {other:?}"),
    }

    let unchanged = h.store.get(job_id).await?.unwrap();
    assert_eq!(unchanged.attempts, 1);
    assert_eq!(unchanged.status, JobStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_retries_start_one_attempt() -> Result<()> {
    let media = flaky_media_host().await;
    let h = harness(ScriptedEngine::new()).await?;

    let job_id = h.orchestrator.start_analysis(video(&media)).await?;
    assert_eq!(
        wait_for_terminal(&h.store, job_id).await?.status,
        JobStatus::Failed
    );

    let (a, b) = tokio::join!(h.retry.retry(job_id), h.retry.retry(job_id));
    let accepted = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(accepted, 1, "exactly one retry wins");

    let loser = if a.is_err() { a } else { b };
    assert!(matches!(loser, Err(JobError::InvalidState { .. })));

    let record = wait_for_terminal(&h.store, job_id).await?;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.attempts, 2);
    assert_eq!(h.engine.generate_count(), 1);
    Ok(())
}
