use uuid::Uuid;

use super::{Dispatcher, JobExecution};
use crate::models::SyncStatus;

impl Dispatcher {
    /// `run_sync` enforces `sync_timeout` itself so an expired sync puts
    /// its row back to `pending` and releases its file locks.
    pub(super) async fn run_storage_sync(&self, sync_job_id: Uuid) -> JobExecution {
        match self.storage.run_sync(sync_job_id).await {
            Ok(job) if job.status == SyncStatus::Failed => JobExecution::Failed {
                error: job
                    .error_message
                    .unwrap_or_else(|| "storage sync failed".to_string()),
            },
            Ok(_) => JobExecution::Success,
            Err(err) => self.failure(&err),
        }
    }
}
