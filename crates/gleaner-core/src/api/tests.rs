use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing_test::traced_test;

use super::*;
use crate::poller::{PollConfig, StatusPoller};
use crate::runtime::executor::{ProgressReporter, WorkUnitError};
use crate::runtime::types::ResultSummary;

fn params() -> JobParameters {
    JobParameters::new("restaurant", "Paris")
}

/// Walks through a few phases, one second apart, then reports 12 places.
async fn scraper(params: JobParameters, progress: ProgressReporter) -> Result<ResultSummary, WorkUnitError> {
    progress.report(10, format!("searching {} in {}", params.keyword, params.city));
    tokio::time::sleep(Duration::from_secs(1)).await;
    progress.report(50, "scrolling results");
    tokio::time::sleep(Duration::from_secs(1)).await;
    progress.report(90, "extracting places");
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(ResultSummary::new(12, 4))
}

async fn hangs(_params: JobParameters, progress: ProgressReporter) -> Result<ResultSummary, WorkUnitError> {
    progress.report(5, "opening search page");
    std::future::pending().await
}

async fn wait_for(service: &JobService, id: &JobId) -> JobRecord {
    StatusPoller::new(service.clone(), PollConfig::fixed(Duration::from_millis(500)))
        .wait(id)
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn submitted_job_runs_to_completion() {
    let service = JobService::in_memory(scraper, SupervisorConfig::default());

    let job = service.submit(params()).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.progress, 0);

    let now = service.status(&job.id).await.unwrap();
    assert!(matches!(now.status, JobStatus::Pending | JobStatus::Running));
    assert!(now.progress <= 10);

    let done = wait_for(&service, &job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.result_summary, Some(ResultSummary::new(12, 4)));
    assert!(done.error_detail.is_none());
    assert!(logs_contain("job submitted"));
    assert!(logs_contain("job completed"));
}

#[tokio::test(start_paused = true)]
async fn progress_is_visible_while_running() {
    let service = JobService::in_memory(scraper, SupervisorConfig::default());
    let job = service.submit(params()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let mid = service.status(&job.id).await.unwrap();
    assert_eq!(mid.status, JobStatus::Running);
    assert_eq!(mid.progress, 50);
    assert_eq!(mid.current_step.as_deref(), Some("scrolling results"));

    // No change in between: both reads agree.
    let again = service.status(&job.id).await.unwrap();
    assert_eq!((again.status, again.progress), (mid.status, mid.progress));
}

#[tokio::test]
async fn missing_city_is_rejected_without_a_record() {
    let service = JobService::in_memory(scraper, SupervisorConfig::default());

    let err = service.submit(JobParameters::new("restaurant", "")).await.unwrap_err();
    assert_eq!(err, JobError::Validation("city is required".into()));
    assert!(service.list(DEFAULT_HISTORY_LIMIT).await.unwrap().is_empty());
}

#[tokio::test]
async fn blank_fields_and_out_of_range_values_are_rejected() {
    let service = JobService::in_memory(scraper, SupervisorConfig::default());

    let err = service.submit(JobParameters::new("   ", "\t")).await.unwrap_err();
    assert_eq!(
        err,
        JobError::Validation("city is required; keyword is required".into())
    );

    let err = service.submit(params().with_radius(0)).await.unwrap_err();
    assert_eq!(
        err,
        JobError::Validation("radius must be between 1 and 100".into())
    );

    let err = service.submit(params().with_max_results(500)).await.unwrap_err();
    assert!(matches!(err, JobError::Validation(msg) if msg.contains("max_results")));

    assert!(service.list(DEFAULT_HISTORY_LIMIT).await.unwrap().is_empty());
}

#[tokio::test]
async fn submitted_parameters_are_trimmed() {
    let service = JobService::in_memory(scraper, SupervisorConfig::default());
    let job = service
        .submit(JobParameters::new("  coffee ", " Lyon"))
        .await
        .unwrap();
    assert_eq!(job.parameters.keyword, "coffee");
    assert_eq!(job.parameters.city, "Lyon");
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let service = JobService::in_memory(scraper, SupervisorConfig::default());
    let id = JobId::from("J999");

    assert_eq!(
        service.status(&id).await.unwrap_err(),
        JobError::NotFound { id: id.clone() }
    );
    assert!(matches!(service.cancel(&id).await, Err(JobError::NotFound { .. })));
}

#[tokio::test(start_paused = true)]
async fn failing_work_unit_is_reported() {
    let service = JobService::in_memory(
        |_params: JobParameters, progress: ProgressReporter| async move {
            progress.report(20, "searching");
            tokio::time::sleep(Duration::from_secs(1)).await;
            Err::<ResultSummary, _>(WorkUnitError::new("quota exceeded"))
        },
        SupervisorConfig::default(),
    );
    let job = service.submit(params()).await.unwrap();

    let done = wait_for(&service, &job.id).await;
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.progress, 20);
    assert!(done.result_summary.is_none());
    let detail = done.error_detail.unwrap();
    assert!(!detail.is_empty());
    assert!(detail.contains("quota exceeded"));
}

#[tokio::test(start_paused = true)]
async fn running_job_can_be_cancelled_once() {
    let service = JobService::in_memory(hangs, SupervisorConfig::default());
    let job = service.submit(params()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.status(&job.id).await.unwrap().status, JobStatus::Running);

    let flagged = service.cancel(&job.id).await.unwrap();
    assert!(flagged.cancel_requested || flagged.status == JobStatus::Cancelled);

    let done = wait_for(&service, &job.id).await;
    assert_eq!(done.status, JobStatus::Cancelled);
    assert!(done.result_summary.is_none());

    let err = service.cancel(&job.id).await.unwrap_err();
    assert_eq!(
        err,
        JobError::InvalidTransition {
            id: job.id.clone(),
            from: JobStatus::Cancelled,
            to: JobStatus::Cancelled,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn pending_job_is_cancelled_on_the_spot() {
    let service = JobService::in_memory(scraper, SupervisorConfig::default());
    let job = service.submit(params()).await.unwrap();

    // The supervisor task has not been polled yet.
    let cancelled = service.cancel(&job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let r = service.status(&job.id).await.unwrap();
    assert_eq!(r.status, JobStatus::Cancelled);
    assert!(r.started_at.is_none());
    assert!(r.result_summary.is_none());
}

#[tokio::test]
async fn orphaned_running_job_is_cancelled_directly() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let service = JobService::new(Arc::clone(&store), Arc::new(scraper), SupervisorConfig::default());

    // Left `Running` by something other than this service's supervisor.
    let id = store.create(params()).await.unwrap().id;
    store.mark_running(&id).await.unwrap();

    let r = service.cancel(&id).await.unwrap();
    assert_eq!(r.status, JobStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn completed_job_cannot_be_cancelled() {
    let service = JobService::in_memory(scraper, SupervisorConfig::default());
    let job = service.submit(params()).await.unwrap();
    let done = wait_for(&service, &job.id).await;

    let err = service.cancel(&job.id).await.unwrap_err();
    assert!(matches!(
        err,
        JobError::InvalidTransition {
            from: JobStatus::Completed,
            ..
        }
    ));
    assert_eq!(service.status(&job.id).await.unwrap(), done);
}

#[tokio::test(start_paused = true)]
async fn every_submission_gets_a_fresh_id() {
    let service = JobService::in_memory(scraper, SupervisorConfig::default());
    let mut ids = HashSet::new();
    for _ in 0..50 {
        let job = service.submit(params()).await.unwrap();
        assert!(ids.insert(job.id));
    }
    assert_eq!(service.list(100).await.unwrap().len(), 50);
    assert_eq!(service.list(DEFAULT_HISTORY_LIMIT).await.unwrap().len(), DEFAULT_HISTORY_LIMIT);
}
