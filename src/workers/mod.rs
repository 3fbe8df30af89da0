use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::timeout;
use tracing::{error, warn};

use crate::{
    config::PipelineSettings,
    error::PipelineError,
    models::QueueEntry,
    queue::{Enqueuer, JobKind},
    repository::Repository,
    search::SearchIndexer,
    storage::HybridStorageManager,
};

pub mod downstream;
pub mod extract;
pub mod index;
pub mod sync;

pub use downstream::{DownstreamProcessor, HttpDownstreamProcessor};
pub use extract::{ExtractionRun, ExtractionRunner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobExecution {
    Success,
    Retry { delay: Duration, error: String },
    Failed { error: String },
}

impl JobExecution {
    fn from_error(err: &PipelineError, delay: Duration) -> Self {
        if err.is_retryable() {
            JobExecution::Retry {
                delay,
                error: err.to_string(),
            }
        } else {
            JobExecution::Failed {
                error: err.to_string(),
            }
        }
    }
}

/// Routes a reserved queue entry to the code that runs its [`JobKind`].
pub struct Dispatcher {
    repo: Arc<dyn Repository>,
    storage: Arc<HybridStorageManager>,
    extraction: Arc<ExtractionRunner>,
    indexer: Arc<SearchIndexer>,
    downstream: Option<Arc<dyn DownstreamProcessor>>,
    enqueuer: Enqueuer,
    settings: PipelineSettings,
    retry_delay: Duration,
}

impl Dispatcher {
    pub fn new(
        repo: Arc<dyn Repository>,
        storage: Arc<HybridStorageManager>,
        extraction: Arc<ExtractionRunner>,
        indexer: Arc<SearchIndexer>,
        enqueuer: Enqueuer,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            repo,
            storage,
            extraction,
            indexer,
            downstream: None,
            enqueuer,
            settings,
            retry_delay: Duration::from_secs(30),
        }
    }

    pub fn with_downstream(mut self, processor: Arc<dyn DownstreamProcessor>) -> Self {
        self.downstream = Some(processor);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn enqueuer(&self) -> &Enqueuer {
        &self.enqueuer
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn dispatch(&self, entry: &QueueEntry) -> JobExecution {
        let job: JobKind = match serde_json::from_value(entry.payload.clone()) {
            Ok(job) => job,
            Err(err) => {
                error!(entry = %entry, error = %err, "unreadable job payload");
                return JobExecution::Failed {
                    error: format!("invalid job payload: {err}"),
                };
            }
        };

        match job {
            JobKind::Extraction {
                extraction_job_id, ..
            } => self.run_extraction(extraction_job_id).await,
            JobKind::IndexFile { file_id } => self.run_index_file(file_id).await,
            JobKind::RemoveFromIndex { file_id } => self.run_remove_from_index(file_id).await,
            JobKind::BulkIndex {
                organization_id,
                batch_size,
                reindex,
            } => {
                self.run_bulk_index(organization_id, batch_size, reindex)
                    .await
            }
            JobKind::StorageSync { sync_job_id } => self.run_storage_sync(sync_job_id).await,
            JobKind::Downstream { file_id, task } => self.run_downstream(file_id, task).await,
        }
    }

    /// Runs `work` under `limit`; an overrun is retried like any transient
    /// failure.
    async fn bounded<F>(&self, label: &str, limit: Duration, work: F) -> Result<F::Output, JobExecution>
    where
        F: Future,
    {
        timeout(limit, work).await.map_err(|_| {
            warn!(job = label, ?limit, "job exceeded its time limit");
            JobExecution::Retry {
                delay: self.retry_delay,
                error: format!("{label} exceeded {limit:?}"),
            }
        })
    }

    fn failure(&self, err: &PipelineError) -> JobExecution {
        JobExecution::from_error(err, self.retry_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_become_retries() {
        let delay = Duration::from_secs(5);
        let execution =
            JobExecution::from_error(&PipelineError::TransientIo("reset".into()), delay);
        assert!(matches!(execution, JobExecution::Retry { delay: d, .. } if d == delay));

        let execution = JobExecution::from_error(&PipelineError::Drift("mismatch".into()), delay);
        assert!(matches!(execution, JobExecution::Failed { .. }));
    }
}
