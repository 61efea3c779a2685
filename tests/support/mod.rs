// ABOUTME: Test support utilities.
// ABOUTME: Provides a scriptable dispatcher and orchestrator fixtures for integration tests.

// Each test binary only uses some of these helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use imagegw::auth::SharedSecretAuth;
use imagegw::dispatch::{DispatchError, Dispatcher, FetchJob, FetchOutput, TaskPhase};
use imagegw::orchestrator::{Orchestrator, OrchestratorSettings, Session};
use imagegw::store::{MemoryStore, RecordStore};
use imagegw::types::TaskHandle;
use nonempty::NonEmpty;
use parking_lot::Mutex;

pub const SECRET: &str = "s3cret";
pub const CREDENTIAL: &str = "alice:s3cret";

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::from_default_env().add_directive("imagegw=debug".parse().unwrap());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[derive(Default)]
struct FakeState {
    submissions: Vec<(String, FetchJob, TaskHandle)>,
    phases: HashMap<TaskHandle, TaskPhase>,
    abandoned: Vec<TaskHandle>,
    released: Vec<TaskHandle>,
    reject_submissions: bool,
    hang_status: bool,
    status_error: bool,
}

/// Dispatcher whose jobs only move when the test says so.
#[derive(Default)]
pub struct FakeDispatcher {
    state: Mutex<FakeState>,
}

impl FakeDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn submissions(&self) -> usize {
        self.state.lock().submissions.len()
    }

    pub fn queues(&self) -> Vec<String> {
        self.state
            .lock()
            .submissions
            .iter()
            .map(|(queue, _, _)| queue.clone())
            .collect()
    }

    pub fn jobs(&self) -> Vec<FetchJob> {
        self.state
            .lock()
            .submissions
            .iter()
            .map(|(_, job, _)| job.clone())
            .collect()
    }

    pub fn last_handle(&self) -> TaskHandle {
        self.state
            .lock()
            .submissions
            .last()
            .map(|(_, _, handle)| handle.clone())
            .expect("no submissions yet")
    }

    pub fn abandoned(&self) -> Vec<TaskHandle> {
        self.state.lock().abandoned.clone()
    }

    pub fn released(&self) -> Vec<TaskHandle> {
        self.state.lock().released.clone()
    }

    pub fn set_phase(&self, handle: &TaskHandle, phase: TaskPhase) {
        self.state.lock().phases.insert(handle.clone(), phase);
    }

    pub fn start_last(&self) {
        self.set_phase(&self.last_handle(), TaskPhase::Running);
    }

    pub fn succeed_last(&self) {
        self.set_phase(
            &self.last_handle(),
            TaskPhase::Succeeded(FetchOutput {
                env: vec!["PATH=/usr/bin:/bin".to_string()],
                entry: Some("/bin/bash".to_string()),
                workdir: Some("/".to_string()),
            }),
        );
    }

    pub fn fail_last(&self, reason: &str) {
        self.set_phase(
            &self.last_handle(),
            TaskPhase::Failed {
                reason: reason.to_string(),
            },
        );
    }

    /// Drop every tracked phase, as a dispatcher restart without a journal would.
    pub fn forget_all(&self) {
        self.state.lock().phases.clear();
    }

    pub fn reject_submissions(&self, reject: bool) {
        self.state.lock().reject_submissions = reject;
    }

    pub fn hang_status(&self, hang: bool) {
        self.state.lock().hang_status = hang;
    }

    pub fn fail_status(&self, fail: bool) {
        self.state.lock().status_error = fail;
    }
}

#[async_trait]
impl Dispatcher for FakeDispatcher {
    async fn submit(&self, job: FetchJob, queue: &str) -> Result<TaskHandle, DispatchError> {
        // Let concurrent callers interleave with the submission.
        tokio::task::yield_now().await;

        let mut state = self.state.lock();
        if state.reject_submissions {
            return Err(DispatchError::QueueClosed(queue.to_string()));
        }
        let handle = TaskHandle::new(format!("{}-{}", queue, state.submissions.len() + 1));
        state.phases.insert(handle.clone(), TaskPhase::Queued);
        state
            .submissions
            .push((queue.to_string(), job, handle.clone()));
        Ok(handle)
    }

    async fn status_of(&self, handle: &TaskHandle) -> Result<TaskPhase, DispatchError> {
        let (hang, error, phase) = {
            let state = self.state.lock();
            (
                state.hang_status,
                state.status_error,
                state.phases.get(handle).cloned(),
            )
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if error {
            return Err(DispatchError::Unavailable("status backend down".to_string()));
        }
        phase.ok_or_else(|| DispatchError::UnknownHandle(handle.clone()))
    }

    async fn abandon(&self, handle: &TaskHandle) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        state.abandoned.push(handle.clone());
        if let Some(phase) = state.phases.get_mut(handle)
            && !phase.is_finished()
        {
            *phase = TaskPhase::Failed {
                reason: "abandoned".to_string(),
            };
        }
        Ok(())
    }

    async fn release(&self, handle: &TaskHandle) -> Result<(), DispatchError> {
        self.state.lock().released.push(handle.clone());
        Ok(())
    }
}

pub fn platforms() -> NonEmpty<String> {
    NonEmpty::from_vec(vec!["edison".to_string(), "cori".to_string()]).unwrap()
}

pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        poll_timeout: Duration::from_millis(200),
        resubmit_after: None,
        refresh_concurrency: 4,
    }
}

/// Orchestrator over an in-memory store and the given dispatcher.
pub fn orchestrator(dispatcher: Arc<FakeDispatcher>) -> Orchestrator {
    orchestrator_with(Arc::new(MemoryStore::new()), dispatcher, fast_settings())
}

pub fn orchestrator_with(
    store: Arc<dyn RecordStore>,
    dispatcher: Arc<FakeDispatcher>,
    settings: OrchestratorSettings,
) -> Orchestrator {
    init_tracing();
    Orchestrator::new(
        platforms(),
        Arc::new(SharedSecretAuth::new(SECRET)),
        store,
        dispatcher,
        settings,
    )
}

pub async fn session(orchestrator: &Orchestrator, system: &str) -> Session {
    orchestrator
        .new_session(Some(CREDENTIAL), system)
        .await
        .unwrap()
}
