// ABOUTME: Task dispatcher contract: submit fetch jobs to per-system queues and poll their phase.
// ABOUTME: Exports the local tokio worker-pool dispatcher and the fetcher capability it drives.

mod fetcher;
mod journal;
mod local;

pub use fetcher::{CommandFetcher, FetchError, Fetcher};
pub use local::{DEFAULT_RETENTION, LocalDispatcher, QueueSpec};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::record::{ImageRecord, ImageStatus};
use crate::types::{RecordId, TaskHandle};

/// Work handed to a fetch worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchJob {
    pub record_id: RecordId,
    pub system: String,
    pub itype: String,
    pub tag: String,
    pub format: String,
    pub arch: String,
    pub os: String,
    pub location: String,
    pub remotetype: String,
    pub ostcount: String,
    pub replication: String,
}

impl FetchJob {
    pub fn from_record(record: &ImageRecord) -> Self {
        Self {
            record_id: record.id.clone(),
            system: record.system.clone(),
            itype: record.itype.clone(),
            tag: record.tag.clone(),
            format: record.format.clone(),
            arch: record.arch.clone(),
            os: record.os.clone(),
            location: record.location.clone(),
            remotetype: record.remotetype.clone(),
            ostcount: record.ostcount.clone(),
            replication: record.replication.clone(),
        }
    }
}

/// Image metadata produced by a successful fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOutput {
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub entry: Option<String>,
    #[serde(default)]
    pub workdir: Option<String>,
}

/// Lifecycle phase of a submitted job, as reported by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TaskPhase {
    /// Waiting in its queue.
    Queued,
    /// A worker picked the job up.
    Running,
    Succeeded(FetchOutput),
    Failed { reason: String },
}

impl TaskPhase {
    /// The record status this phase corresponds to.
    pub fn status(&self) -> ImageStatus {
        match self {
            TaskPhase::Queued => ImageStatus::Enqueued,
            TaskPhase::Running => ImageStatus::Pending,
            TaskPhase::Succeeded(_) => ImageStatus::Ready,
            TaskPhase::Failed { .. } => ImageStatus::Failure,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TaskPhase::Succeeded(_) | TaskPhase::Failed { .. })
    }
}

/// Errors from dispatcher operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no queue for system: {0}")]
    UnknownQueue(String),

    #[error("queue closed: {0}")]
    QueueClosed(String),

    #[error("unknown task handle: {0}")]
    UnknownHandle(TaskHandle),

    #[error("task journal error: {0}")]
    Journal(String),

    #[error("dispatcher unavailable: {0}")]
    Unavailable(String),
}

/// Submits fetch jobs and reports their lifecycle phase.
///
/// Handles must stay resolvable by their string value alone; callers persist
/// them and poll again after a restart.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Submit a job on the queue named `queue` (one queue per system).
    async fn submit(&self, job: FetchJob, queue: &str) -> Result<TaskHandle, DispatchError>;

    /// Current phase of a submitted job. Safe to call repeatedly.
    async fn status_of(&self, handle: &TaskHandle) -> Result<TaskPhase, DispatchError>;

    /// Stop tracking a job whose record was removed. Best effort.
    async fn abandon(&self, handle: &TaskHandle) -> Result<(), DispatchError> {
        let _ = handle;
        Ok(())
    }

    /// The caller has recorded the job's outcome and will not ask again;
    /// drop whatever is kept for it. Later `status_of` calls may report
    /// `UnknownHandle`.
    async fn release(&self, handle: &TaskHandle) -> Result<(), DispatchError> {
        let _ = handle;
        Ok(())
    }
}
