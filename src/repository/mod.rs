//! Persistence seam for the pipeline.
//!
//! Every component reads and writes its rows through [`Repository`]. The
//! PostgreSQL implementation is used in deployments; the in-memory one backs
//! tests and ephemeral runs and enforces the same uniqueness rules.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    ExtractedTextContent, ExtractionJob, FileRecord, JobStatus, NewQueueEntry,
    OrganizationSettings, QueueEntry, SearchIndexStatus, StorageLocation, StorageSyncJob,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("conflicting record: {0}")]
    Conflict(String),
    #[error("database unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(String),
}

impl RepositoryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Unavailable(_))
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait Repository: Send + Sync + 'static {
    // files
    async fn insert_file(&self, file: FileRecord) -> RepositoryResult<FileRecord>;
    /// Inserts the file only if the organization's usage stays within
    /// `quota_bytes`; `None` when it would not. Concurrent inserts for one
    /// organization are serialized.
    async fn insert_file_within_quota(
        &self,
        file: FileRecord,
        quota_bytes: i64,
    ) -> RepositoryResult<Option<FileRecord>>;
    async fn get_file(&self, file_id: Uuid) -> RepositoryResult<Option<FileRecord>>;
    /// Flags the file deleted and inactive. Returns the updated record.
    async fn soft_delete_file(&self, file_id: Uuid) -> RepositoryResult<Option<FileRecord>>;
    /// Active, non-deleted files of an organization, optionally restricted to
    /// those updated at or after `updated_since`.
    async fn list_active_files(
        &self,
        organization_id: Uuid,
        updated_since: Option<DateTime<Utc>>,
    ) -> RepositoryResult<Vec<FileRecord>>;
    /// One page of active files ordered by id, starting after `after`.
    async fn list_files_page(
        &self,
        organization_id: Uuid,
        after: Option<Uuid>,
        limit: i64,
    ) -> RepositoryResult<Vec<FileRecord>>;
    async fn organization_usage_bytes(&self, organization_id: Uuid) -> RepositoryResult<i64>;

    // organization settings
    async fn organization_settings(
        &self,
        organization_id: Uuid,
    ) -> RepositoryResult<Option<OrganizationSettings>>;
    async fn upsert_organization_settings(
        &self,
        settings: OrganizationSettings,
    ) -> RepositoryResult<()>;

    // storage locations
    async fn insert_location(&self, location: StorageLocation) -> RepositoryResult<StorageLocation>;
    async fn list_locations(&self, file_id: Uuid) -> RepositoryResult<Vec<StorageLocation>>;
    async fn delete_location(&self, location_id: Uuid) -> RepositoryResult<()>;
    /// Moves the primary flag of `file_id` onto `location_id`.
    async fn set_primary_location(&self, file_id: Uuid, location_id: Uuid) -> RepositoryResult<()>;

    // per-file in-flight marker
    async fn try_acquire_file_lock(
        &self,
        file_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> RepositoryResult<bool>;
    async fn release_file_lock(&self, file_id: Uuid, holder: &str) -> RepositoryResult<()>;

    // extraction jobs
    async fn insert_extraction_job(&self, job: ExtractionJob) -> RepositoryResult<ExtractionJob>;
    async fn get_extraction_job(&self, job_id: Uuid) -> RepositoryResult<Option<ExtractionJob>>;
    /// Persists the job if the stored row is still in `expected` status.
    /// Fails with `Conflict` when the row moved on, or when the write would
    /// leave two `processing` jobs for the same file and method.
    async fn update_extraction_job(
        &self,
        job: &ExtractionJob,
        expected: JobStatus,
    ) -> RepositoryResult<()>;
    async fn list_extraction_jobs(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> RepositoryResult<Vec<ExtractionJob>>;
    async fn list_stale_extraction_jobs(
        &self,
        started_before: DateTime<Utc>,
    ) -> RepositoryResult<Vec<ExtractionJob>>;
    async fn extraction_jobs_for_file(&self, file_id: Uuid)
        -> RepositoryResult<Vec<ExtractionJob>>;

    // extracted content
    async fn upsert_extracted_text(&self, content: ExtractedTextContent) -> RepositoryResult<()>;
    async fn get_extracted_text(
        &self,
        file_id: Uuid,
        content_type: &str,
    ) -> RepositoryResult<Option<ExtractedTextContent>>;

    // search index status
    async fn get_index_status(&self, file_id: Uuid) -> RepositoryResult<Option<SearchIndexStatus>>;
    async fn upsert_index_status(&self, status: SearchIndexStatus) -> RepositoryResult<()>;
    async fn list_failed_index_statuses(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> RepositoryResult<Vec<SearchIndexStatus>>;
    /// Statuses left in `indexing` by an attempt that never finished.
    async fn list_stale_indexing_statuses(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<SearchIndexStatus>>;
    /// Marks every status of the organization `not_indexed`; returns the count.
    async fn reset_index_statuses(&self, organization_id: Uuid) -> RepositoryResult<usize>;

    // storage sync jobs
    async fn insert_sync_job(&self, job: StorageSyncJob) -> RepositoryResult<StorageSyncJob>;
    async fn get_sync_job(&self, job_id: Uuid) -> RepositoryResult<Option<StorageSyncJob>>;
    async fn update_sync_job(&self, job: &StorageSyncJob) -> RepositoryResult<()>;
    /// Latest completed organization-wide sync; single-file syncs never set
    /// the starting point of an incremental sync.
    async fn last_completed_sync(
        &self,
        organization_id: Uuid,
    ) -> RepositoryResult<Option<StorageSyncJob>>;
    async fn list_pending_sync_jobs(&self, limit: i64) -> RepositoryResult<Vec<StorageSyncJob>>;
    async fn list_stale_sync_jobs(
        &self,
        started_before: DateTime<Utc>,
    ) -> RepositoryResult<Vec<StorageSyncJob>>;

    // durable queue
    /// Inserts the entry unless a queued entry with the same dedupe key exists.
    async fn enqueue(&self, entry: NewQueueEntry) -> RepositoryResult<Option<QueueEntry>>;
    /// Claims the next runnable entry: highest priority, then lowest sequence.
    async fn reserve_entry(&self, queue: &str) -> RepositoryResult<Option<QueueEntry>>;
    async fn mark_entry_succeeded(&self, entry_id: Uuid) -> RepositoryResult<()>;
    async fn retry_entry_after(
        &self,
        entry_id: Uuid,
        run_after: DateTime<Utc>,
        error: &str,
    ) -> RepositoryResult<()>;
    async fn mark_entry_failed(&self, entry_id: Uuid, error: &str) -> RepositoryResult<()>;
    async fn queued_count(&self, queue: &str) -> RepositoryResult<i64>;
    /// Returns entries stuck in `processing` since before `updated_before` to
    /// the queue; returns the count.
    async fn requeue_stale_entries(&self, updated_before: DateTime<Utc>)
        -> RepositoryResult<usize>;
}
