use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{ExtractionJob, JobStatus};
use crate::strategy::ExtractionPlan;

pub const PERMANENT_ERROR_CODE: &str = "permanent_extraction";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("extraction job {job_id} cannot move from {from} to {to}")]
    Invalid {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("extraction job {job_id} exhausted its {max_retries} retries")]
    RetriesExhausted { job_id: Uuid, max_retries: i32 },
}

pub fn new_extraction_job(file_id: Uuid, plan: &ExtractionPlan, max_retries: i32) -> ExtractionJob {
    ExtractionJob {
        id: Uuid::new_v4(),
        file_id,
        method: plan.method,
        priority: plan.priority,
        status: JobStatus::Pending,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        error_message: None,
        error_code: None,
        retry_count: 0,
        max_retries,
        metadata: json!({
            "estimated_duration_ms": plan.estimated_duration_ms,
            "use_async": plan.use_async,
        }),
    }
}

/// State machine of an extraction job. These are the only places that
/// change `status`.
impl ExtractionJob {
    fn require(&self, expected: JobStatus, to: JobStatus) -> Result<(), TransitionError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(TransitionError::Invalid {
                job_id: self.id,
                from: self.status,
                to,
            })
        }
    }

    /// `pending -> processing`.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.require(JobStatus::Pending, JobStatus::Processing)?;
        self.status = JobStatus::Processing;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        Ok(())
    }

    /// `processing -> completed`.
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.require(JobStatus::Processing, JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.error_message = None;
        self.error_code = None;
        Ok(())
    }

    /// Records a failed attempt. The job returns to `pending` while retries
    /// remain and stays `failed` otherwise. Returns the resulting status.
    pub fn fail(&mut self, error: &PipelineError) -> Result<JobStatus, TransitionError> {
        self.require(JobStatus::Processing, JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.retry_count += 1;
        self.error_message = Some(error.to_string());
        self.error_code = Some(error.code().to_string());
        // exhausted jobs stay failed
        let _ = self.retry();
        Ok(self.status)
    }

    /// Terminal failure regardless of remaining retries.
    pub fn fail_permanently(&mut self, error: &PipelineError) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Invalid {
                job_id: self.id,
                from: self.status,
                to: JobStatus::Failed,
            });
        }
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.retry_count = self.retry_count.max(self.max_retries);
        self.error_message = Some(error.to_string());
        self.error_code = Some(PERMANENT_ERROR_CODE.to_string());
        Ok(())
    }

    /// `processing -> pending` without spending a retry; used when inline
    /// extraction hands the job over to the background queue.
    pub fn defer(&mut self, reason: &str) -> Result<(), TransitionError> {
        self.require(JobStatus::Processing, JobStatus::Pending)?;
        self.status = JobStatus::Pending;
        self.started_at = None;
        self.error_message = Some(reason.to_string());
        Ok(())
    }

    /// `failed -> pending` while `retry_count < max_retries`.
    pub fn retry(&mut self) -> Result<(), TransitionError> {
        self.require(JobStatus::Failed, JobStatus::Pending)?;
        if self.retry_count >= self.max_retries {
            return Err(TransitionError::RetriesExhausted {
                job_id: self.id,
                max_retries: self.max_retries,
            });
        }
        self.status = JobStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        Ok(())
    }

    /// Explicit operator action reviving a terminal job with a fresh retry
    /// budget.
    pub fn operator_reset(&mut self) -> Result<(), TransitionError> {
        self.require(JobStatus::Failed, JobStatus::Pending)?;
        self.retry_count = 0;
        self.error_code = None;
        self.retry()
    }

    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Completed => true,
            JobStatus::Failed => self.retry_count >= self.max_retries,
            JobStatus::Pending | JobStatus::Processing => false,
        }
    }

    pub fn estimated_duration_ms(&self) -> u64 {
        self.metadata
            .get("estimated_duration_ms")
            .and_then(|value| value.as_u64())
            .unwrap_or_else(|| self.method.baseline_duration_ms())
    }

    /// Hard limit for one attempt: the estimate stretched by `factor`, never
    /// below `floor`.
    pub fn execution_timeout(&self, factor: u32, floor: Duration) -> Duration {
        let scaled = Duration::from_millis(self.estimated_duration_ms().saturating_mul(factor as u64));
        scaled.max(floor)
    }
}
