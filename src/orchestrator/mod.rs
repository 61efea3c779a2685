// ABOUTME: Image pull orchestrator: lookup, list, pull, state and expire over store and dispatcher.
// ABOUTME: Deduplicates pulls per image key using only durable record state.

mod error;
mod refresh;
mod session;

pub use error::{ErrorKind, OrchestratorError, Result};
pub use refresh::SweepReport;
pub use session::Session;

use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt, stream};
use nonempty::NonEmpty;
use serde::Serialize;
use snafu::{OptionExt, ensure};

use crate::auth::{self, AuthError, Authenticator};
use crate::config::{Config, StoreConfig};
use crate::dispatch::{CommandFetcher, Dispatcher, FetchJob, LocalDispatcher};
use crate::record::{ImageRecord, ImageStatus, PullOptions};
use crate::store::{FileStore, MemoryStore, RecordStore, Replace};
use crate::types::{ImageKey, RecordId, TaskHandle};

use error::{NotFoundSnafu, UnknownSystemSnafu};

/// Bound on compare-and-swap retries against the store.
const MAX_STORE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Upper bound on any single dispatcher call made on a request path.
    pub poll_timeout: Duration,
    /// Resubmit pulls stuck in ENQUEUED longer than this. Off when `None`.
    pub resubmit_after: Option<Duration>,
    /// Concurrent status polls per list or sweep.
    pub refresh_concurrency: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(2),
            resubmit_after: None,
            refresh_concurrency: 8,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_timeout: config.dispatcher.poll_timeout,
            resubmit_after: config.pull.resubmit_after,
            refresh_concurrency: config.refresh.concurrency.max(1),
        }
    }
}

/// Acknowledgement returned by [`Orchestrator::expire`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpireAck {
    pub removed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
}

/// Composes auth, record store and dispatcher into the gateway operations.
///
/// Holds no per-key state of its own: whether a fetch is in flight is read
/// from the record status, and the dispatcher handle lives on the record, so
/// several orchestrators (or processes) can share one store.
pub struct Orchestrator {
    platforms: NonEmpty<String>,
    auth: Arc<dyn Authenticator>,
    store: Arc<dyn RecordStore>,
    dispatcher: Arc<dyn Dispatcher>,
    settings: OrchestratorSettings,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("platforms", &self.platforms)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        platforms: NonEmpty<String>,
        auth: Arc<dyn Authenticator>,
        store: Arc<dyn RecordStore>,
        dispatcher: Arc<dyn Dispatcher>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            platforms,
            auth,
            store,
            dispatcher,
            settings,
        }
    }

    /// Wire up the configured auth backend, store, and a local dispatcher
    /// running the configured fetch command.
    pub async fn from_config(config: &Config) -> crate::error::Result<Self> {
        let auth = auth::from_config(&config.authentication)?;

        let store: Arc<dyn RecordStore> = match &config.store {
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
            StoreConfig::File { path } => Arc::new(FileStore::open(path).await?),
        };

        let fetcher = Arc::new(CommandFetcher::new(
            &config.dispatcher.fetch_command,
            config.dispatcher.fetch_args.clone(),
            config.dispatcher.fetch_timeout,
        ));
        let dispatcher = LocalDispatcher::start(
            config.queue_specs(),
            fetcher,
            config.dispatcher.journal.as_deref(),
            config.dispatcher.retention,
        )
        .await?;

        Ok(Self::new(
            config.platform_names(),
            auth,
            store,
            Arc::new(dispatcher),
            OrchestratorSettings::from_config(config),
        ))
    }

    pub fn platforms(&self) -> &NonEmpty<String> {
        &self.platforms
    }

    pub fn is_system(&self, system: &str) -> bool {
        self.platforms.iter().any(|p| p == system)
    }

    fn ensure_system(&self, system: &str) -> Result<()> {
        ensure!(self.is_system(system), UnknownSystemSnafu { system });
        Ok(())
    }

    /// Authenticate `credential` and bind the session to `system`.
    pub async fn new_session(&self, credential: Option<&str>, system: &str) -> Result<Session> {
        let credential = credential
            .filter(|c| !c.is_empty())
            .ok_or(AuthError::MissingCredential)?;
        let principal = self.auth.authenticate(credential).await?;
        self.ensure_system(system)?;

        tracing::debug!(user = %principal.user, system = %system, "Session opened");
        Ok(Session::new(principal, system))
    }

    /// The record for `key`, with its in-flight status refreshed.
    pub async fn lookup(&self, session: &Session, key: &ImageKey) -> Result<ImageRecord> {
        self.ensure_system(key.system())?;
        tracing::debug!(user = %session.user(), key = %key, "Lookup");

        let record = self
            .store
            .find_by_key(key)
            .await?
            .context(NotFoundSnafu {
                what: key.to_string(),
            })?;
        self.refresh(record).await?.context(NotFoundSnafu {
            what: key.to_string(),
        })
    }

    /// All records for `system`. Empty when none exist.
    pub async fn list(&self, session: &Session, system: &str) -> Result<Vec<ImageRecord>> {
        self.ensure_system(system)?;
        tracing::debug!(user = %session.user(), system = %system, "List");

        let records = self.store.list_by_system(system).await?;
        let refreshed: Vec<Option<ImageRecord>> = stream::iter(records)
            .map(|record| self.refresh(record))
            .buffered(self.settings.refresh_concurrency)
            .try_collect()
            .await?;

        Ok(refreshed.into_iter().flatten().collect())
    }

    /// Make sure `key` is cached or being fetched, and return its record id.
    ///
    /// A READY, ENQUEUED or PENDING record is returned as is. Otherwise the
    /// record is created or reset to ENQUEUED and exactly one job is
    /// submitted; the store's compare-and-swap picks a single winner among
    /// concurrent callers.
    pub async fn pull(
        &self,
        session: &Session,
        key: &ImageKey,
        options: &PullOptions,
    ) -> Result<RecordId> {
        self.ensure_system(key.system())?;
        tracing::debug!(user = %session.user(), key = %key, "Pull");

        for _ in 0..MAX_STORE_ATTEMPTS {
            let upsert = self
                .store
                .upsert_if_absent(ImageRecord::new(key, options))
                .await?;
            let record = if upsert.was_created() {
                upsert.into_record()
            } else {
                match self.refresh(upsert.into_record()).await? {
                    Some(record) => record,
                    // Expired while we looked at it.
                    None => continue,
                }
            };

            let stalled = self.is_stalled(&record);
            let Some(claimed) = record.enqueue(options, stalled) else {
                tracing::debug!(id = %record.id, status = %record.status, "Pull already covered");
                return Ok(record.id);
            };

            match self.store.replace(claimed).await? {
                Replace::Applied(claimed) => {
                    let superseded = if stalled { record.task } else { None };
                    return self.submit(claimed, superseded).await;
                }
                Replace::Conflict(current) => {
                    tracing::debug!(id = %current.id, status = %current.status, "Lost pull race, re-reading");
                }
                Replace::Missing => {}
            }
        }

        let record = self
            .store
            .find_by_key(key)
            .await?
            .context(NotFoundSnafu {
                what: key.to_string(),
            })?;
        Ok(record.id)
    }

    /// Current status of record `id`, refreshed from the dispatcher.
    pub async fn get_state(&self, id: &RecordId) -> Result<ImageStatus> {
        Ok(self.record(id).await?.status)
    }

    /// Record `id`, refreshed from the dispatcher.
    pub async fn record(&self, id: &RecordId) -> Result<ImageRecord> {
        let what = || NotFoundSnafu {
            what: format!("record {}", id),
        };
        let record = self.store.find_by_id(id).await?.context(what())?;
        self.refresh(record).await?.context(what())
    }

    /// Remove the record for `key`. Removing a missing key is not an error.
    ///
    /// An in-flight job is abandoned on a best-effort basis; its eventual
    /// outcome finds no record and is dropped.
    pub async fn expire(&self, session: &Session, key: &ImageKey) -> Result<ExpireAck> {
        self.ensure_system(key.system())?;
        let removed = self.store.delete(key).await?;
        Ok(self.expired(session, key, removed).await)
    }

    /// Like [`Orchestrator::expire`], but only while `key` still holds record
    /// `id`. A stale id removes nothing.
    pub async fn expire_record(
        &self,
        session: &Session,
        key: &ImageKey,
        id: &RecordId,
    ) -> Result<ExpireAck> {
        self.ensure_system(key.system())?;
        let removed = self.store.delete_record(key, id).await?;
        if removed.is_none()
            && let Some(current) = self.store.find_by_key(key).await?
        {
            tracing::warn!(
                user = %session.user(),
                key = %key,
                requested = %id,
                current = %current.id,
                "Expire names a stale record id, keeping current record"
            );
        }
        Ok(self.expired(session, key, removed).await)
    }

    async fn expired(
        &self,
        session: &Session,
        key: &ImageKey,
        removed: Option<ImageRecord>,
    ) -> ExpireAck {
        let Some(record) = removed else {
            tracing::debug!(user = %session.user(), key = %key, "Nothing to expire");
            return ExpireAck {
                removed: false,
                id: None,
            };
        };

        tracing::info!(user = %session.user(), key = %key, id = %record.id, status = %record.status, "Expired image");
        if record.status.is_in_flight()
            && let Some(handle) = &record.task
        {
            self.abandon(handle).await;
        }

        ExpireAck {
            removed: true,
            id: Some(record.id),
        }
    }

    fn is_stalled(&self, record: &ImageRecord) -> bool {
        self.settings
            .resubmit_after
            .and_then(|limit| chrono::Duration::from_std(limit).ok())
            .is_some_and(|limit| record.is_stalled(limit))
    }

    /// Submit the job for a freshly claimed ENQUEUED record.
    async fn submit(
        &self,
        record: ImageRecord,
        superseded: Option<TaskHandle>,
    ) -> Result<RecordId> {
        if let Some(old) = superseded {
            tracing::warn!(id = %record.id, handle = %old, "Resubmitting stalled pull");
            self.abandon(&old).await;
        }

        let id = record.id.clone();
        let job = FetchJob::from_record(&record);
        let submitted = tokio::time::timeout(
            self.settings.poll_timeout,
            self.dispatcher.submit(job, &record.system),
        )
        .await
        .unwrap_or_else(|_| {
            Err(crate::dispatch::DispatchError::Unavailable(format!(
                "submit timed out after {:?}",
                self.settings.poll_timeout
            )))
        });

        match submitted {
            Ok(handle) => {
                tracing::info!(id = %id, key = %record.key(), handle = %handle, "Fetch submitted");
                self.attach(record, handle).await?;
                Ok(id)
            }
            Err(source) => {
                tracing::warn!(id = %id, key = %record.key(), error = %source, "Fetch submission failed");
                self.store.update_status(&id, ImageStatus::Failure).await?;
                Err(OrchestratorError::Dispatch { source })
            }
        }
    }

    /// Persist the dispatcher handle on the record it belongs to.
    async fn attach(&self, mut record: ImageRecord, handle: TaskHandle) -> Result<()> {
        for _ in 0..MAX_STORE_ATTEMPTS {
            record.task = Some(handle.clone());
            match self.store.replace(record).await? {
                Replace::Applied(_) => return Ok(()),
                Replace::Missing => {
                    tracing::debug!(handle = %handle, "Record expired before handle was stored");
                    self.abandon(&handle).await;
                    return Ok(());
                }
                Replace::Conflict(current) => {
                    if current.status != ImageStatus::Enqueued || current.task.is_some() {
                        tracing::debug!(handle = %handle, "Submission superseded");
                        self.abandon(&handle).await;
                        return Ok(());
                    }
                    record = current;
                }
            }
        }

        tracing::warn!(handle = %handle, "Gave up storing dispatcher handle");
        Ok(())
    }

    /// Cancel a job nobody will collect, then let the dispatcher forget it.
    async fn abandon(&self, handle: &TaskHandle) {
        match tokio::time::timeout(self.settings.poll_timeout, self.dispatcher.abandon(handle)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(handle = %handle, error = %e, "Failed to abandon job"),
            Err(_) => tracing::warn!(handle = %handle, "Abandon timed out"),
        }
        self.release(handle).await;
    }

    /// Best effort; the dispatcher's own retention covers a missed release.
    async fn release(&self, handle: &TaskHandle) {
        match tokio::time::timeout(self.settings.poll_timeout, self.dispatcher.release(handle)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(handle = %handle, error = %e, "Failed to release job"),
            Err(_) => tracing::warn!(handle = %handle, "Release timed out"),
        }
    }
}
