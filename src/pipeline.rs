//! Upload orchestration: store, classify, then extract inline or hand the
//! work to the queue.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    config::PipelineSettings,
    error::{PipelineError, PipelineResult},
    jobs::new_extraction_job,
    models::{
        ExtractionJob, FileRecord, JobStatus, SearchIndexStatus, StorageLocation,
        FULL_TEXT_CONTENT,
    },
    queue::{Enqueuer, JobKind},
    repository::Repository,
    storage::{HybridStorageManager, StoreRequest},
    strategy::{classify, ExtractionPlan, FileCharacteristics},
    workers::{ExtractionRun, ExtractionRunner},
};

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub store: StoreRequest,
    /// Extract on the request path regardless of the plan.
    pub force_sync: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub file: FileRecord,
    pub extraction_job_id: Uuid,
    pub extraction_status: JobStatus,
    pub plan: ExtractionPlan,
    pub processed_inline: bool,
    /// Sync job repairing a backup copy that could not be written.
    pub backup_sync_job_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileStatus {
    pub file: FileRecord,
    pub locations: Vec<StorageLocation>,
    pub extraction_jobs: Vec<ExtractionJob>,
    pub index_status: Option<SearchIndexStatus>,
    pub has_text: bool,
}

pub struct IngestPipeline {
    repo: Arc<dyn Repository>,
    storage: Arc<HybridStorageManager>,
    extraction: Arc<ExtractionRunner>,
    enqueuer: Enqueuer,
    settings: PipelineSettings,
}

impl IngestPipeline {
    pub fn new(
        repo: Arc<dyn Repository>,
        storage: Arc<HybridStorageManager>,
        extraction: Arc<ExtractionRunner>,
        enqueuer: Enqueuer,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            repo,
            storage,
            extraction,
            enqueuer,
            settings,
        }
    }

    /// Fails only when the file could not be stored or recorded; extraction
    /// problems never fail the upload.
    pub async fn ingest(&self, request: UploadRequest) -> PipelineResult<UploadOutcome> {
        let stored = self.storage.store_file(request.store).await?;
        let file = stored.file;

        let plan = classify(&FileCharacteristics {
            mime_type: &file.mime_type,
            size_bytes: file.size_bytes.max(0) as u64,
            file_name: &file.original_name,
        });
        let job = self
            .repo
            .insert_extraction_job(new_extraction_job(
                file.id,
                &plan,
                self.settings.extraction_max_retries,
            ))
            .await?;
        info!(
            file_id = %file.id,
            job_id = %job.id,
            method = %plan.method,
            priority = plan.priority,
            use_async = plan.use_async,
            "extraction planned"
        );

        let backup_sync_job_id = match stored.backup {
            Ok(_) => None,
            Err(deferred) => {
                let sync_job_id = deferred.sync_job_id;
                if let Err(err) = deferred.schedule(&self.storage).await {
                    // the pending sync job is picked up by the recovery sweep
                    error!(file_id = %file.id, %sync_job_id, error = %err, "could not schedule backup repair");
                }
                Some(sync_job_id)
            }
        };

        let mut processed_inline = false;
        if should_run_inline(&plan, file.size_bytes, request.force_sync, &self.settings) {
            match self.extraction.run_inline(job.id).await {
                Ok(ExtractionRun::Completed { .. }) => processed_inline = true,
                Ok(run) => {
                    info!(file_id = %file.id, job_id = %job.id, ?run, "inline extraction did not complete");
                    self.enqueue_extraction(&job).await;
                }
                Err(err) => {
                    warn!(file_id = %file.id, job_id = %job.id, error = %err, "inline extraction errored");
                    self.enqueue_extraction(&job).await;
                }
            }
        } else {
            self.enqueue_extraction(&job).await;
        }

        let extraction_status = self
            .repo
            .get_extraction_job(job.id)
            .await
            .ok()
            .flatten()
            .map(|current| current.status)
            .unwrap_or(job.status);

        Ok(UploadOutcome {
            file,
            extraction_job_id: job.id,
            extraction_status,
            plan,
            processed_inline,
            backup_sync_job_id,
        })
    }

    async fn enqueue_extraction(&self, job: &ExtractionJob) {
        let kind = JobKind::Extraction {
            extraction_job_id: job.id,
            file_id: job.file_id,
            method: job.method,
            priority: job.priority,
        };
        if let Err(err) = self.enqueuer.enqueue(kind, job.priority).await {
            // still pending in the database; the recovery sweep enqueues it
            error!(job_id = %job.id, error = %err, "could not enqueue extraction");
        }
    }

    /// Soft deletes the file and schedules removal of its search document.
    pub async fn delete_file(&self, file_id: Uuid) -> PipelineResult<FileRecord> {
        let file = self
            .repo
            .soft_delete_file(file_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("file {file_id}")))?;
        self.enqueuer
            .enqueue_default(JobKind::RemoveFromIndex { file_id })
            .await?;
        info!(%file_id, "file deleted");
        Ok(file)
    }

    /// Operator action: revives a failed extraction job with a fresh retry
    /// budget and schedules it.
    pub async fn retry_extraction(&self, job_id: Uuid) -> PipelineResult<ExtractionJob> {
        let mut job = self
            .repo
            .get_extraction_job(job_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("extraction job {job_id}")))?;
        job.operator_reset()?;
        self.repo
            .update_extraction_job(&job, JobStatus::Failed)
            .await?;
        let kind = JobKind::Extraction {
            extraction_job_id: job.id,
            file_id: job.file_id,
            method: job.method,
            priority: job.priority,
        };
        self.enqueuer.enqueue(kind, job.priority).await?;
        info!(%job_id, file_id = %job.file_id, "extraction job reset by operator");
        Ok(job)
    }

    pub async fn file_status(&self, file_id: Uuid) -> PipelineResult<FileStatus> {
        let file = self
            .repo
            .get_file(file_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("file {file_id}")))?;
        let locations = self.repo.list_locations(file_id).await?;
        let extraction_jobs = self.repo.extraction_jobs_for_file(file_id).await?;
        let index_status = self.repo.get_index_status(file_id).await?;
        let has_text = self
            .repo
            .get_extracted_text(file_id, FULL_TEXT_CONTENT)
            .await?
            .is_some();
        Ok(FileStatus {
            file,
            locations,
            extraction_jobs,
            index_status,
            has_text,
        })
    }
}

/// Small, synchronous, high priority work runs on the request path.
pub fn should_run_inline(
    plan: &ExtractionPlan,
    size_bytes: i64,
    force_sync: bool,
    settings: &PipelineSettings,
) -> bool {
    if force_sync {
        return true;
    }
    !plan.use_async
        && size_bytes.max(0) as u64 <= settings.inline_max_bytes
        && plan.priority >= settings.inline_min_priority
}
