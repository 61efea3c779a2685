// ABOUTME: Integration tests for the local worker-pool dispatcher.
// ABOUTME: Uses in-process fetchers to drive jobs through queued, running and finished phases.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use imagegw::dispatch::{
    DEFAULT_RETENTION, DispatchError, Dispatcher, FetchError, FetchJob, FetchOutput, Fetcher, LocalDispatcher,
    QueueSpec, TaskPhase,
};
use imagegw::record::{ImageRecord, PullOptions};
use imagegw::types::{ImageKey, TaskHandle};
use tokio::sync::Semaphore;

fn job(system: &str, tag: &str) -> FetchJob {
    let key = ImageKey::new(system, "docker", tag).unwrap();
    FetchJob::from_record(&ImageRecord::new(&key, &PullOptions::default()))
}

fn queues() -> Vec<QueueSpec> {
    vec![
        QueueSpec {
            system: "edison".to_string(),
            workers: 1,
        },
        QueueSpec {
            system: "cori".to_string(),
            workers: 2,
        },
    ]
}

/// Fetcher that blocks until the test releases a permit.
struct GatedFetcher {
    gate: Semaphore,
    calls: AtomicUsize,
    fail_tags: Vec<String>,
}

impl GatedFetcher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
            fail_tags: vec!["broken".to_string()],
        })
    }

    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl Fetcher for GatedFetcher {
    async fn fetch(&self, job: &FetchJob) -> Result<FetchOutput, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate
            .acquire()
            .await
            .map_err(|e| FetchError::Other(e.to_string()))?
            .forget();
        if self.fail_tags.contains(&job.tag) {
            return Err(FetchError::Other(format!("no such image: {}", job.tag)));
        }
        Ok(FetchOutput {
            env: vec![format!("IMAGE={}", job.tag)],
            entry: None,
            workdir: Some("/".to_string()),
        })
    }
}

struct PanickingFetcher;

#[async_trait]
impl Fetcher for PanickingFetcher {
    async fn fetch(&self, _job: &FetchJob) -> Result<FetchOutput, FetchError> {
        panic!("fetcher bug");
    }
}

async fn wait_for(
    dispatcher: &LocalDispatcher,
    handle: &TaskHandle,
    done: impl Fn(&TaskPhase) -> bool,
) -> TaskPhase {
    for _ in 0..200 {
        let phase = dispatcher.status_of(handle).await.unwrap();
        if done(&phase) {
            return phase;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached the expected phase", handle);
}

#[tokio::test]
async fn job_moves_through_phases() {
    support::init_tracing();
    let fetcher = GatedFetcher::new();
    let dispatcher = LocalDispatcher::start(queues(), fetcher.clone(), None, DEFAULT_RETENTION)
        .await
        .unwrap();

    let handle = dispatcher.submit(job("edison", "ubuntu:15.04"), "edison").await.unwrap();
    assert!(handle.as_str().starts_with("edison-"));

    wait_for(&dispatcher, &handle, |p| *p == TaskPhase::Running).await;

    fetcher.release(1);
    let phase = wait_for(&dispatcher, &handle, TaskPhase::is_finished).await;
    match phase {
        TaskPhase::Succeeded(output) => assert_eq!(output.env, vec!["IMAGE=ubuntu:15.04".to_string()]),
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn failed_fetch_reports_reason() {
    let fetcher = GatedFetcher::new();
    fetcher.release(1);
    let dispatcher = LocalDispatcher::start(queues(), fetcher, None, DEFAULT_RETENTION).await.unwrap();

    let handle = dispatcher.submit(job("edison", "broken"), "edison").await.unwrap();
    let phase = wait_for(&dispatcher, &handle, TaskPhase::is_finished).await;
    assert!(matches!(phase, TaskPhase::Failed { reason } if reason.contains("no such image")));
}

#[tokio::test]
async fn unknown_queue_is_rejected() {
    let dispatcher = LocalDispatcher::start(queues(), GatedFetcher::new(), None, DEFAULT_RETENTION)
        .await
        .unwrap();
    let err = dispatcher.submit(job("hopper", "ubuntu"), "hopper").await.unwrap_err();
    assert!(matches!(err, DispatchError::UnknownQueue(q) if q == "hopper"));
}

#[tokio::test]
async fn unknown_handle_is_reported() {
    let dispatcher = LocalDispatcher::start(queues(), GatedFetcher::new(), None, DEFAULT_RETENTION)
        .await
        .unwrap();
    let err = dispatcher
        .status_of(&TaskHandle::new("edison-nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnknownHandle(_)));
}

#[tokio::test]
async fn abandoned_queued_job_never_runs() {
    let fetcher = GatedFetcher::new();
    let dispatcher = LocalDispatcher::start(queues(), fetcher.clone(), None, DEFAULT_RETENTION)
        .await
        .unwrap();

    // Occupy the single edison worker.
    let busy = dispatcher.submit(job("edison", "first"), "edison").await.unwrap();
    wait_for(&dispatcher, &busy, |p| *p == TaskPhase::Running).await;

    let queued = dispatcher.submit(job("edison", "second"), "edison").await.unwrap();
    assert_eq!(dispatcher.status_of(&queued).await.unwrap(), TaskPhase::Queued);
    dispatcher.abandon(&queued).await.unwrap();

    fetcher.release(2);
    wait_for(&dispatcher, &busy, TaskPhase::is_finished).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        dispatcher.status_of(&queued).await.unwrap(),
        TaskPhase::Failed { reason } if reason == "abandoned"
    ));
}

#[tokio::test]
async fn result_after_abandon_is_dropped() {
    let fetcher = GatedFetcher::new();
    let dispatcher = LocalDispatcher::start(queues(), fetcher.clone(), None, DEFAULT_RETENTION)
        .await
        .unwrap();

    let handle = dispatcher.submit(job("edison", "ubuntu"), "edison").await.unwrap();
    wait_for(&dispatcher, &handle, |p| *p == TaskPhase::Running).await;
    dispatcher.abandon(&handle).await.unwrap();

    fetcher.release(1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(
        dispatcher.status_of(&handle).await.unwrap(),
        TaskPhase::Failed { .. }
    ));
}

#[tokio::test]
async fn slow_system_does_not_block_others() {
    let fetcher = GatedFetcher::new();
    let dispatcher = LocalDispatcher::start(queues(), fetcher.clone(), None, DEFAULT_RETENTION)
        .await
        .unwrap();

    let edison = dispatcher.submit(job("edison", "slow"), "edison").await.unwrap();
    wait_for(&dispatcher, &edison, |p| *p == TaskPhase::Running).await;

    let cori = dispatcher.submit(job("cori", "fast"), "cori").await.unwrap();
    wait_for(&dispatcher, &cori, |p| *p == TaskPhase::Running).await;

    fetcher.release(2);
    wait_for(&dispatcher, &cori, TaskPhase::is_finished).await;
    wait_for(&dispatcher, &edison, TaskPhase::is_finished).await;
}

#[tokio::test]
async fn panicking_fetcher_fails_job_and_keeps_worker() {
    let dispatcher = LocalDispatcher::start(queues(), Arc::new(PanickingFetcher), None, DEFAULT_RETENTION)
        .await
        .unwrap();

    for tag in ["one", "two"] {
        let handle = dispatcher.submit(job("edison", tag), "edison").await.unwrap();
        let phase = wait_for(&dispatcher, &handle, TaskPhase::is_finished).await;
        assert!(matches!(phase, TaskPhase::Failed { reason } if reason.contains("crashed")));
    }
}

#[tokio::test]
async fn journal_resolves_handles_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = GatedFetcher::new();
    fetcher.release(1);

    let handle = {
        let dispatcher = LocalDispatcher::start(queues(), fetcher.clone(), Some(dir.path()), DEFAULT_RETENTION)
            .await
            .unwrap();
        let handle = dispatcher.submit(job("edison", "ubuntu"), "edison").await.unwrap();
        wait_for(&dispatcher, &handle, TaskPhase::is_finished).await;
        dispatcher.shutdown().await;
        handle
    };

    let restarted = LocalDispatcher::start(queues(), GatedFetcher::new(), Some(dir.path()), DEFAULT_RETENTION)
        .await
        .unwrap();
    assert!(matches!(
        restarted.status_of(&handle).await.unwrap(),
        TaskPhase::Succeeded(_)
    ));
}

#[tokio::test]
async fn journal_fails_jobs_interrupted_by_restart() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = LocalDispatcher::start(queues(), GatedFetcher::new(), Some(dir.path()), DEFAULT_RETENTION)
        .await
        .unwrap();
    let running = dispatcher.submit(job("edison", "ubuntu"), "edison").await.unwrap();
    wait_for(&dispatcher, &running, |p| *p == TaskPhase::Running).await;
    // The single edison worker is busy, so this one stays queued.
    let queued = dispatcher.submit(job("edison", "centos"), "edison").await.unwrap();
    assert_eq!(dispatcher.status_of(&queued).await.unwrap(), TaskPhase::Queued);

    // The process dies with both jobs unfinished.
    drop(dispatcher);

    let restarted = LocalDispatcher::start(queues(), GatedFetcher::new(), Some(dir.path()), DEFAULT_RETENTION)
        .await
        .unwrap();
    for handle in [&running, &queued] {
        assert!(matches!(
            restarted.status_of(handle).await.unwrap(),
            TaskPhase::Failed { reason } if reason == "lost on restart"
        ));
    }
}

#[tokio::test]
async fn released_jobs_are_forgotten() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = GatedFetcher::new();
    fetcher.release(1);
    let dispatcher = LocalDispatcher::start(queues(), fetcher.clone(), Some(dir.path()), DEFAULT_RETENTION)
        .await
        .unwrap();

    let handle = dispatcher.submit(job("edison", "ubuntu"), "edison").await.unwrap();
    wait_for(&dispatcher, &handle, TaskPhase::is_finished).await;
    assert_eq!(dispatcher.tracked().await, 1);

    dispatcher.release(&handle).await.unwrap();
    assert_eq!(dispatcher.tracked().await, 0);
    assert!(matches!(
        dispatcher.status_of(&handle).await,
        Err(DispatchError::UnknownHandle(_))
    ));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn outcome_of_released_running_job_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = GatedFetcher::new();
    let dispatcher = LocalDispatcher::start(queues(), fetcher.clone(), Some(dir.path()), DEFAULT_RETENTION)
        .await
        .unwrap();

    let handle = dispatcher.submit(job("edison", "ubuntu"), "edison").await.unwrap();
    wait_for(&dispatcher, &handle, |p| *p == TaskPhase::Running).await;
    dispatcher.release(&handle).await.unwrap();

    fetcher.release(1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(
        dispatcher.status_of(&handle).await,
        Err(DispatchError::UnknownHandle(_))
    ));
    assert_eq!(dispatcher.tracked().await, 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn finished_jobs_past_retention_are_pruned() {
    let fetcher = GatedFetcher::new();
    fetcher.release(1);
    let dispatcher = LocalDispatcher::start(queues(), fetcher.clone(), None, Duration::ZERO)
        .await
        .unwrap();

    let first = dispatcher.submit(job("edison", "ubuntu"), "edison").await.unwrap();
    wait_for(&dispatcher, &first, TaskPhase::is_finished).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    dispatcher.submit(job("edison", "centos"), "edison").await.unwrap();
    assert_eq!(dispatcher.tracked().await, 1);
    assert!(matches!(
        dispatcher.status_of(&first).await,
        Err(DispatchError::UnknownHandle(_))
    ));
}

#[tokio::test]
async fn shutdown_drains_queued_jobs() {
    let fetcher = GatedFetcher::new();
    fetcher.release(3);
    let dispatcher = LocalDispatcher::start(queues(), fetcher.clone(), None, DEFAULT_RETENTION)
        .await
        .unwrap();

    for tag in ["a", "b", "c"] {
        dispatcher.submit(job("edison", tag), "edison").await.unwrap();
    }
    dispatcher.shutdown().await;

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
}
