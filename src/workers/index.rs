use tracing::{info, warn};
use uuid::Uuid;

use super::{Dispatcher, JobExecution};
use crate::search::IndexOutcome;

impl Dispatcher {
    pub(super) async fn run_index_file(&self, file_id: Uuid) -> JobExecution {
        match self.indexer.index_file(file_id).await {
            IndexOutcome::Indexed | IndexOutcome::Removed => JobExecution::Success,
            IndexOutcome::Skipped { reason } => {
                info!(%file_id, %reason, "nothing to index");
                JobExecution::Success
            }
            IndexOutcome::Failed { error, retry_count }
                if retry_count < self.settings.index_max_retries =>
            {
                JobExecution::Retry {
                    delay: self.retry_delay,
                    error,
                }
            }
            IndexOutcome::Failed { error, retry_count } => {
                warn!(%file_id, retry_count, "index retries exhausted");
                JobExecution::Failed { error }
            }
        }
    }

    pub(super) async fn run_remove_from_index(&self, file_id: Uuid) -> JobExecution {
        let limit = self.settings.index_timeout;
        match self
            .bounded("remove_from_index", limit, self.indexer.remove_from_index(file_id))
            .await
        {
            Ok(Ok(())) => JobExecution::Success,
            Ok(Err(err)) => self.failure(&err),
            Err(execution) => execution,
        }
    }

    pub(super) async fn run_bulk_index(
        &self,
        organization_id: Uuid,
        batch_size: i64,
        reindex: bool,
    ) -> JobExecution {
        let batch_size = if batch_size > 0 {
            batch_size
        } else {
            self.settings.bulk_index_batch_size
        };
        let result = if reindex {
            self.indexer
                .reindex_organization(organization_id, batch_size)
                .await
        } else {
            self.indexer.bulk_index(organization_id, batch_size).await
        };
        match result {
            Ok(report) if report.failed == 0 => JobExecution::Success,
            Ok(report) => {
                // failed files carry index_failed statuses the recovery sweep picks up
                warn!(%organization_id, failed = report.failed, "bulk indexing left failures");
                JobExecution::Success
            }
            Err(err) => self.failure(&err),
        }
    }
}
