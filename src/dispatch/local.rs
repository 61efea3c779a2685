// ABOUTME: In-process dispatcher with one tokio queue and worker pool per system.
// ABOUTME: Tracks task phases in memory and optionally journals them to disk.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::journal::{Journal, LOST_ON_RESTART};
use super::{DispatchError, Dispatcher, FetchJob, Fetcher, TaskPhase};
use crate::types::TaskHandle;

const ABANDONED_REASON: &str = "abandoned";

/// How long finished tasks stay resolvable when nobody releases them.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// A queue to create: the system it serves and how many workers drain it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub system: String,
    pub workers: usize,
}

struct QueuedJob {
    handle: TaskHandle,
    job: FetchJob,
}

struct TaskEntry {
    phase: TaskPhase,
    finished_at: Option<Instant>,
}

/// Phase bookkeeping shared by the dispatcher front end and its workers.
///
/// Finished entries leave memory when the caller releases them, or after
/// `retention` if nobody ever does.
struct TaskTable {
    phases: Mutex<HashMap<TaskHandle, TaskEntry>>,
    journal: Option<Journal>,
    retention: Duration,
}

impl TaskTable {
    async fn insert(&self, handle: &TaskHandle, phase: TaskPhase) -> Result<(), DispatchError> {
        let mut phases = self.phases.lock().await;
        let expired: Vec<TaskHandle> = phases
            .iter()
            .filter(|(_, entry)| {
                entry
                    .finished_at
                    .is_some_and(|at| at.elapsed() > self.retention)
            })
            .map(|(handle, _)| handle.clone())
            .collect();
        for old in &expired {
            phases.remove(old);
            self.forget_journal(old).await;
        }
        if !expired.is_empty() {
            tracing::debug!(pruned = expired.len(), "Pruned finished tasks past retention");
        }

        if let Some(journal) = &self.journal {
            journal.write(handle, &phase).await?;
        }
        phases.insert(
            handle.clone(),
            TaskEntry {
                phase,
                finished_at: None,
            },
        );
        Ok(())
    }

    /// Move a task forward. Returns false when the task is unknown or the
    /// step would not advance it (finished tasks never change again).
    async fn advance(&self, handle: &TaskHandle, next: TaskPhase) -> bool {
        let mut phases = self.phases.lock().await;
        let Some(current) = phases.get_mut(handle) else {
            return false;
        };
        if !current.phase.status().can_advance_to(next.status()) {
            return false;
        }

        // The lock is held across the journal write so entries land in order.
        if let Some(journal) = &self.journal
            && let Err(e) = journal.write(handle, &next).await
        {
            tracing::warn!(handle = %handle, error = %e, "Failed to journal task phase");
        }
        if next.is_finished() {
            current.finished_at = Some(Instant::now());
        }
        current.phase = next;
        true
    }

    async fn get(&self, handle: &TaskHandle) -> Result<Option<TaskPhase>, DispatchError> {
        if let Some(entry) = self.phases.lock().await.get(handle) {
            return Ok(Some(entry.phase.clone()));
        }
        let Some(journal) = &self.journal else {
            return Ok(None);
        };

        // Only this process runs jobs, and every job it accepted is in memory.
        // An unfinished journal entry is therefore a job that died with an
        // earlier process.
        Ok(journal.read(handle).await?.map(|phase| {
            if phase.is_finished() {
                phase
            } else {
                TaskPhase::Failed {
                    reason: LOST_ON_RESTART.to_string(),
                }
            }
        }))
    }

    /// Drop every trace of `handle`. A worker still holding the job finds it
    /// gone and discards the outcome.
    async fn release(&self, handle: &TaskHandle) -> Result<(), DispatchError> {
        let mut phases = self.phases.lock().await;
        phases.remove(handle);
        if let Some(journal) = &self.journal {
            journal.remove(handle).await?;
        }
        Ok(())
    }

    async fn forget_journal(&self, handle: &TaskHandle) {
        if let Some(journal) = &self.journal
            && let Err(e) = journal.remove(handle).await
        {
            tracing::warn!(handle = %handle, error = %e, "Failed to prune journal entry");
        }
    }

    async fn len(&self) -> usize {
        self.phases.lock().await.len()
    }
}

/// Dispatcher backed by tokio tasks in this process.
///
/// Each system gets its own queue, so a slow or broken system only backs up
/// its own workers.
pub struct LocalDispatcher {
    queues: HashMap<String, mpsc::UnboundedSender<QueuedJob>>,
    table: Arc<TaskTable>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for LocalDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDispatcher")
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl LocalDispatcher {
    /// Create the queues and spawn their workers. Must run inside a tokio runtime.
    ///
    /// With a journal, jobs a previous process left queued or running are
    /// marked failed, since no worker will pick them up again.
    pub async fn start(
        queues: impl IntoIterator<Item = QueueSpec>,
        fetcher: Arc<dyn Fetcher>,
        journal: Option<&Path>,
        retention: Duration,
    ) -> Result<Self, DispatchError> {
        let journal = match journal {
            Some(dir) => {
                let journal = Journal::open(dir).await?;
                let recovery = journal.recover(retention).await?;
                if recovery.interrupted > 0 || recovery.pruned > 0 {
                    tracing::info!(
                        interrupted = recovery.interrupted,
                        pruned = recovery.pruned,
                        "Recovered task journal"
                    );
                }
                Some(journal)
            }
            None => None,
        };
        let table = Arc::new(TaskTable {
            phases: Mutex::new(HashMap::new()),
            journal,
            retention,
        });

        let mut senders = HashMap::new();
        let mut workers = Vec::new();
        for queue in queues {
            let (tx, rx) = mpsc::unbounded_channel();
            let rx = Arc::new(Mutex::new(rx));
            for worker in 0..queue.workers.max(1) {
                workers.push(tokio::spawn(run_worker(
                    queue.system.clone(),
                    worker,
                    Arc::clone(&rx),
                    Arc::clone(&fetcher),
                    Arc::clone(&table),
                )));
            }
            tracing::debug!(queue = %queue.system, workers = queue.workers.max(1), "Started fetch queue");
            senders.insert(queue.system, tx);
        }

        Ok(Self {
            queues: senders,
            table,
            workers,
        })
    }

    /// Tasks currently tracked in memory.
    pub async fn tracked(&self) -> usize {
        self.table.len().await
    }

    /// Close every queue and wait for workers to drain what was already queued.
    pub async fn shutdown(self) {
        drop(self.queues);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn submit(&self, job: FetchJob, queue: &str) -> Result<TaskHandle, DispatchError> {
        let sender = self
            .queues
            .get(queue)
            .ok_or_else(|| DispatchError::UnknownQueue(queue.to_string()))?;

        let handle = TaskHandle::new(format!("{}-{}", queue, uuid::Uuid::new_v4().simple()));
        self.table.insert(&handle, TaskPhase::Queued).await?;

        if sender
            .send(QueuedJob {
                handle: handle.clone(),
                job,
            })
            .is_err()
        {
            self.table
                .advance(
                    &handle,
                    TaskPhase::Failed {
                        reason: "queue closed".to_string(),
                    },
                )
                .await;
            return Err(DispatchError::QueueClosed(queue.to_string()));
        }

        tracing::debug!(handle = %handle, queue = %queue, "Submitted fetch job");
        Ok(handle)
    }

    async fn status_of(&self, handle: &TaskHandle) -> Result<TaskPhase, DispatchError> {
        self.table
            .get(handle)
            .await?
            .ok_or_else(|| DispatchError::UnknownHandle(handle.clone()))
    }

    async fn abandon(&self, handle: &TaskHandle) -> Result<(), DispatchError> {
        let abandoned = self
            .table
            .advance(
                handle,
                TaskPhase::Failed {
                    reason: ABANDONED_REASON.to_string(),
                },
            )
            .await;
        if abandoned {
            tracing::debug!(handle = %handle, "Abandoned fetch job");
        }
        Ok(())
    }

    async fn release(&self, handle: &TaskHandle) -> Result<(), DispatchError> {
        self.table.release(handle).await?;
        tracing::debug!(handle = %handle, "Released fetch job");
        Ok(())
    }
}

async fn run_worker(
    queue: String,
    worker: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob>>>,
    fetcher: Arc<dyn Fetcher>,
    table: Arc<TaskTable>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(QueuedJob { handle, job }) = next else {
            tracing::debug!(queue = %queue, worker, "Fetch queue closed");
            break;
        };

        // Abandoned while queued: the job is already FAILED and must not run.
        if !table.advance(&handle, TaskPhase::Running).await {
            tracing::debug!(handle = %handle, "Skipping abandoned or released fetch job");
            continue;
        }

        // Run the fetch on its own task so a panicking fetcher fails the job
        // instead of killing this worker.
        let fetch = {
            let fetcher = Arc::clone(&fetcher);
            tokio::spawn(async move { fetcher.fetch(&job).await })
        };
        let phase = match fetch.await {
            Ok(Ok(output)) => TaskPhase::Succeeded(output),
            Ok(Err(e)) => TaskPhase::Failed {
                reason: e.to_string(),
            },
            Err(e) => TaskPhase::Failed {
                reason: format!("fetch worker crashed: {}", e),
            },
        };

        match &phase {
            TaskPhase::Failed { reason } => {
                tracing::warn!(handle = %handle, queue = %queue, reason = %reason, "Fetch failed")
            }
            _ => tracing::info!(handle = %handle, queue = %queue, "Fetch succeeded"),
        }

        if !table.advance(&handle, phase).await {
            tracing::debug!(handle = %handle, "Dropping result of abandoned or released fetch job");
        }
    }
}
