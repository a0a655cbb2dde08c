mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{artifact_names, config, write_corpus, HashingService};
use fractal_embeddings::{
    EmbedRequest, EmbeddingService, PipelineError, PipelineRunner, RunStatus, ServiceError,
};

struct PanickingService;

impl EmbeddingService for PanickingService {
    fn embed(&self, _: &EmbedRequest<'_>) -> Result<Vec<Vec<f32>>, ServiceError> {
        panic!("embedding backend crashed");
    }
}

fn wait_until_stopped(runner: &PipelineRunner) {
    let deadline = Instant::now() + Duration::from_secs(60);
    while runner.is_alive() {
        assert!(Instant::now() < deadline, "runner did not stop");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn runner_finishes_and_reports_progress() {
    let root = tempfile::tempdir().unwrap();
    let out = root.path().join("out");
    let service = Arc::new(HashingService::new());
    let mut runner =
        PipelineRunner::new(config(&out, write_corpus(root.path())), service.clone()).unwrap();
    assert_eq!(runner.status(), RunStatus::NotStarted);
    assert!(!runner.is_alive());

    runner.start().unwrap();
    wait_until_stopped(&runner);

    assert_eq!(runner.status(), RunStatus::Finished);
    let progress = runner.progress();
    assert_eq!(progress.service_calls, service.calls());
    assert_eq!(progress.embedded_chunks, progress.total_chunks);

    let output = runner.join().unwrap();
    assert_eq!(output.report.service_calls, service.calls());
    assert_eq!(output.colors.len(), 2 * output.combined.rows() - 1);
}

#[test]
fn stop_request_terminates_a_slow_run() {
    let root = tempfile::tempdir().unwrap();
    let out = root.path().join("out");
    let service = Arc::new(HashingService::slow(Duration::from_millis(100)));
    let mut runner =
        PipelineRunner::new(config(&out, write_corpus(root.path())), service.clone()).unwrap();

    runner.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(30);
    while service.calls() == 0 {
        assert!(Instant::now() < deadline, "no service call was made");
        thread::sleep(Duration::from_millis(5));
    }
    runner.request_stop();
    wait_until_stopped(&runner);

    assert_eq!(runner.status(), RunStatus::Terminated);
    assert!(matches!(runner.join(), Err(PipelineError::Cancelled)));

    let names = artifact_names(&out);
    assert!(names.iter().all(|name| !name.starts_with("combined_")), "{names:?}");
}

#[test]
fn service_failure_terminates_the_run() {
    let root = tempfile::tempdir().unwrap();
    let out = root.path().join("out");
    let mut runner = PipelineRunner::new(
        config(&out, write_corpus(root.path())),
        Arc::new(HashingService::failing_from(0)),
    )
    .unwrap();

    runner.start().unwrap();
    wait_until_stopped(&runner);

    assert_eq!(runner.status(), RunStatus::Terminated);
    assert!(matches!(
        runner.join(),
        Err(PipelineError::ServiceCallFailure { transient: true, .. })
    ));
}

#[test]
fn worker_panic_terminates_the_run() {
    let root = tempfile::tempdir().unwrap();
    let out = root.path().join("out");
    let mut runner = PipelineRunner::new(
        config(&out, write_corpus(root.path())),
        Arc::new(PanickingService),
    )
    .unwrap();

    runner.start().unwrap();
    wait_until_stopped(&runner);

    assert_eq!(runner.status(), RunStatus::Terminated);
    assert!(!runner.is_alive());
    assert!(matches!(runner.join(), Err(PipelineError::WorkerPanicked)));
}

#[test]
fn runner_starts_only_once() {
    let root = tempfile::tempdir().unwrap();
    let out = root.path().join("out");
    let mut runner = PipelineRunner::new(
        config(&out, write_corpus(root.path())),
        Arc::new(HashingService::new()),
    )
    .unwrap();

    runner.start().unwrap();
    assert!(matches!(
        runner.start(),
        Err(PipelineError::InvalidParameter { name: "runner", .. })
    ));
    runner.join().unwrap();
}

#[test]
fn join_without_start_is_an_error() {
    let root = tempfile::tempdir().unwrap();
    let runner = PipelineRunner::new(
        config(&root.path().join("out"), write_corpus(root.path())),
        Arc::new(HashingService::new()),
    )
    .unwrap();
    assert!(matches!(
        runner.join(),
        Err(PipelineError::InvalidParameter { .. })
    ));
}
