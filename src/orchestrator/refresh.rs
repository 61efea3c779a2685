// ABOUTME: Pulls dispatcher progress into records: lazy per-read refresh and the background sweep.
// ABOUTME: Every write is a compare-and-swap, so late or stale reports never move a status backward.

use futures::{StreamExt, stream};

use super::{MAX_STORE_ATTEMPTS, Orchestrator, Result};
use crate::dispatch::{DispatchError, TaskPhase};
use crate::record::ImageRecord;
use crate::store::Replace;
use crate::types::TaskHandle;

/// Outcome of one [`Orchestrator::sweep`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// In-flight records that were polled.
    pub checked: usize,
    /// Records that reached READY or FAILURE during this pass.
    pub settled: usize,
    /// Polls or store writes that failed.
    pub errors: usize,
}

impl Orchestrator {
    /// Bring an in-flight record up to date with its dispatcher job.
    ///
    /// Returns `None` if the record was removed meanwhile. A dispatcher that
    /// does not answer within the poll timeout leaves the stored record as is.
    pub(super) async fn refresh(&self, record: ImageRecord) -> Result<Option<ImageRecord>> {
        if !record.status.is_in_flight() {
            return Ok(Some(record));
        }
        let Some(handle) = record.task.clone() else {
            return Ok(Some(record));
        };

        let polled =
            tokio::time::timeout(self.settings.poll_timeout, self.dispatcher.status_of(&handle))
                .await;
        let phase = match polled {
            Ok(Ok(phase)) => phase,
            Ok(Err(DispatchError::UnknownHandle(_))) => {
                tracing::warn!(id = %record.id, handle = %handle, "Dispatcher lost track of job, marking failed");
                TaskPhase::Failed {
                    reason: "job unknown to dispatcher".to_string(),
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                tracing::warn!(
                    id = %record.id,
                    handle = %handle,
                    timeout = ?self.settings.poll_timeout,
                    "Status poll timed out, serving stored status"
                );
                return Ok(Some(record));
            }
        };

        self.apply(record, &handle, &phase).await
    }

    async fn apply(
        &self,
        mut record: ImageRecord,
        handle: &TaskHandle,
        phase: &TaskPhase,
    ) -> Result<Option<ImageRecord>> {
        for _ in 0..MAX_STORE_ATTEMPTS {
            // A later submission owns the record now.
            if record.task.as_ref() != Some(handle) {
                return Ok(Some(record));
            }
            let Some(next) = record.observe(phase) else {
                return Ok(Some(record));
            };

            let from = record.status;
            match self.store.replace(next).await? {
                Replace::Applied(updated) => {
                    if let TaskPhase::Failed { reason } = phase {
                        tracing::warn!(id = %updated.id, key = %updated.key(), reason = %reason, "Fetch failed");
                    }
                    tracing::info!(
                        id = %updated.id,
                        key = %updated.key(),
                        from = %from,
                        to = %updated.status,
                        "Image status advanced"
                    );
                    if updated.status.is_terminal() {
                        self.release(handle).await;
                    }
                    return Ok(Some(updated));
                }
                Replace::Conflict(current) => record = current,
                Replace::Missing => {
                    tracing::debug!(handle = %handle, "Record removed before status update, dropping report");
                    return Ok(None);
                }
            }
        }

        Ok(Some(record))
    }

    /// Poll every in-flight record once and persist any progress.
    ///
    /// Errors are logged and counted; a sweep never fails as a whole.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for system in self.platforms.iter() {
            let records = match self.store.list_by_system(system).await {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(system = %system, error = %e, "Sweep could not list records");
                    report.errors += 1;
                    continue;
                }
            };

            let in_flight: Vec<ImageRecord> = records
                .into_iter()
                .filter(|r| r.status.is_in_flight() && r.task.is_some())
                .collect();
            report.checked += in_flight.len();

            let results: Vec<_> = stream::iter(in_flight)
                .map(|record| self.refresh(record))
                .buffer_unordered(self.settings.refresh_concurrency)
                .collect()
                .await;

            for result in results {
                match result {
                    Ok(Some(record)) if record.status.is_terminal() => report.settled += 1,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(system = %system, error = %e, "Sweep refresh failed");
                        report.errors += 1;
                    }
                }
            }
        }

        if report.checked > 0 {
            tracing::debug!(
                checked = report.checked,
                settled = report.settled,
                errors = report.errors,
                "Sweep finished"
            );
        }
        report
    }
}
