use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Dispatcher, JobExecution};
use crate::{
    config::PipelineSettings,
    error::{PipelineError, PipelineResult},
    extraction::{ExtractionOutput, TextExtractor},
    models::{ExtractedTextContent, ExtractionJob, FileRecord, JobStatus, FULL_TEXT_CONTENT},
    queue::{DownstreamTask, Enqueuer, JobKind},
    repository::{Repository, RepositoryError},
    storage::HybridStorageManager,
};

/// What one extraction attempt amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionRun {
    Completed { word_count: i32 },
    Skipped { reason: String },
    /// The attempt failed; `status` is where the job ended up.
    Failed { status: JobStatus, error: String },
    /// Inline attempt failed and the job went back to `pending`.
    Deferred { error: String },
}

/// Executes extraction jobs: claim, read bytes, extract under a time limit,
/// persist the text and chain indexing.
pub struct ExtractionRunner {
    repo: Arc<dyn Repository>,
    storage: Arc<HybridStorageManager>,
    extractor: Arc<dyn TextExtractor>,
    enqueuer: Enqueuer,
    settings: PipelineSettings,
}

impl ExtractionRunner {
    pub fn new(
        repo: Arc<dyn Repository>,
        storage: Arc<HybridStorageManager>,
        extractor: Arc<dyn TextExtractor>,
        enqueuer: Enqueuer,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            repo,
            storage,
            extractor,
            enqueuer,
            settings,
        }
    }

    /// Background execution. Failures spend a retry or, for inputs that can
    /// never be extracted, end the job.
    pub async fn run(&self, job_id: Uuid) -> PipelineResult<ExtractionRun> {
        let (mut job, file) = match self.claim(job_id).await? {
            Ok(claimed) => claimed,
            Err(skipped) => return Ok(skipped),
        };

        match self.attempt(&job, &file).await {
            Ok(output) => self.finish(job, &file, output).await,
            Err(err) => {
                let status = if matches!(err, PipelineError::PermanentExtraction(_)) {
                    job.fail_permanently(&err)?;
                    JobStatus::Failed
                } else {
                    job.fail(&err)?
                };
                self.repo
                    .update_extraction_job(&job, JobStatus::Processing)
                    .await?;
                warn!(
                    %job_id,
                    file_id = %file.id,
                    method = %job.method,
                    retry_count = job.retry_count,
                    %status,
                    error = %err,
                    "extraction attempt failed"
                );
                Ok(ExtractionRun::Failed {
                    status,
                    error: err.to_string(),
                })
            }
        }
    }

    /// Extraction on the request path. Any failure hands the job back to
    /// the queue without spending a retry; the caller enqueues it.
    pub async fn run_inline(&self, job_id: Uuid) -> PipelineResult<ExtractionRun> {
        let (mut job, file) = match self.claim(job_id).await? {
            Ok(claimed) => claimed,
            Err(skipped) => return Ok(skipped),
        };

        match self.attempt(&job, &file).await {
            Ok(output) => self.finish(job, &file, output).await,
            Err(err) => {
                let reason = format!("inline extraction failed: {err}");
                job.defer(&reason)?;
                self.repo
                    .update_extraction_job(&job, JobStatus::Processing)
                    .await?;
                info!(%job_id, error = %err, "inline extraction deferred to background");
                Ok(ExtractionRun::Deferred {
                    error: err.to_string(),
                })
            }
        }
    }

    /// Moves a pending job to `processing`. The inner `Err` carries the
    /// reason the job must not run now.
    async fn claim(
        &self,
        job_id: Uuid,
    ) -> PipelineResult<Result<(ExtractionJob, FileRecord), ExtractionRun>> {
        let mut job = self
            .repo
            .get_extraction_job(job_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("extraction job {job_id}")))?;

        let file = self
            .repo
            .get_file(job.file_id)
            .await?
            .filter(FileRecord::is_searchable);

        match (job.status, file) {
            (JobStatus::Completed, Some(file)) => {
                // chaining is idempotent; covers a crash between completion and enqueue
                self.chain(&job, &file).await?;
                Ok(Err(skipped("job already completed")))
            }
            (JobStatus::Pending, Some(file)) => {
                job.start()?;
                match self
                    .repo
                    .update_extraction_job(&job, JobStatus::Pending)
                    .await
                {
                    Ok(()) => Ok(Ok((job, file))),
                    Err(RepositoryError::Conflict(reason)) => {
                        info!(%job_id, %reason, "extraction job claimed elsewhere");
                        Ok(Err(skipped("job claimed elsewhere")))
                    }
                    Err(err) => Err(err.into()),
                }
            }
            (JobStatus::Pending, None) => {
                job.start()?;
                job.fail_permanently(&PipelineError::NotFound(format!(
                    "file {} was deleted",
                    job.file_id
                )))?;
                self.repo
                    .update_extraction_job(&job, JobStatus::Pending)
                    .await?;
                info!(%job_id, file_id = %job.file_id, "file deleted; extraction abandoned");
                Ok(Err(skipped("file deleted")))
            }
            (status, _) => Ok(Err(skipped(&format!("job is {status}")))),
        }
    }

    async fn attempt(&self, job: &ExtractionJob, file: &FileRecord) -> PipelineResult<ExtractionOutput> {
        let limit = job.execution_timeout(
            self.settings.extraction_timeout_factor,
            self.settings.extraction_timeout_floor,
        );
        let work = async {
            let bytes = self.storage.read_file(file.id).await?;
            let output = self
                .extractor
                .extract(job.method, bytes, &file.mime_type, file.size_bytes.max(0) as u64)
                .await?;
            Ok::<_, PipelineError>(output)
        };
        match timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::TransientIo(format!(
                "extraction exceeded {limit:?}"
            ))),
        }
    }

    async fn finish(
        &self,
        mut job: ExtractionJob,
        file: &FileRecord,
        output: ExtractionOutput,
    ) -> PipelineResult<ExtractionRun> {
        let word_count = output.word_count() as i32;
        let mut metadata = match output.metadata {
            Value::Object(map) => map,
            _ => Default::default(),
        };
        metadata.insert("method".into(), json!(job.method));
        metadata.insert("success".into(), json!(output.success));

        let content = ExtractedTextContent {
            file_id: file.id,
            content_type: FULL_TEXT_CONTENT.to_string(),
            extraction_job_id: Some(job.id),
            word_count,
            character_count: output.text.chars().count() as i32,
            text: output.text,
            metadata: Value::Object(metadata),
            updated_at: Utc::now(),
        };
        self.repo.upsert_extracted_text(content).await?;

        job.complete()?;
        self.repo
            .update_extraction_job(&job, JobStatus::Processing)
            .await?;
        info!(job_id = %job.id, file_id = %file.id, method = %job.method, word_count, "extraction completed");

        self.chain(&job, file).await?;
        Ok(ExtractionRun::Completed { word_count })
    }

    /// Follow-up work once the completed transition is persisted.
    async fn chain(&self, job: &ExtractionJob, file: &FileRecord) -> PipelineResult<()> {
        self.enqueuer
            .enqueue_default(JobKind::IndexFile { file_id: file.id })
            .await?;

        let settings = self.storage.settings_for(file.organization_id).await?;
        if settings.downstream_enabled {
            for task in DownstreamTask::ALL.iter().copied() {
                self.enqueuer
                    .enqueue_default(JobKind::Downstream {
                        file_id: file.id,
                        task,
                    })
                    .await?;
            }
        }
        info!(job_id = %job.id, file_id = %file.id, "follow-up jobs enqueued");
        Ok(())
    }
}

fn skipped(reason: &str) -> ExtractionRun {
    ExtractionRun::Skipped {
        reason: reason.to_string(),
    }
}

impl Dispatcher {
    pub(super) async fn run_extraction(&self, job_id: Uuid) -> JobExecution {
        match self.extraction.run(job_id).await {
            Ok(ExtractionRun::Completed { .. }) | Ok(ExtractionRun::Skipped { .. }) => {
                JobExecution::Success
            }
            Ok(ExtractionRun::Failed {
                status: JobStatus::Pending,
                error,
            })
            | Ok(ExtractionRun::Deferred { error }) => JobExecution::Retry {
                delay: self.retry_delay,
                error,
            },
            Ok(ExtractionRun::Failed { error, .. }) => JobExecution::Failed { error },
            Err(err) => self.failure(&err),
        }
    }
}
