use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::exists;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{BigInt, Text, Uuid as SqlUuid};
use serde_json::Value;
use tokio::task;
use uuid::Uuid;

use super::{Repository, RepositoryError, RepositoryResult};
use crate::db::PgPool;
use crate::models::{
    ExtractedTextContent, ExtractionJob, FileRecord, IndexStatus, JobStatus, NewQueueEntry,
    OrganizationSettings, QueueEntry, QueueEntryStatus, SearchIndexStatus, StorageLocation,
    StorageSyncJob, SyncStatus, ORGANIZATION_SYNC_TYPES,
};
use crate::schema::{
    extracted_text_contents, extraction_jobs, file_locks, files, organization_settings,
    queue_entries, search_index_statuses, storage_locations, storage_sync_jobs,
};

impl From<DieselError> for RepositoryError {
    fn from(value: DieselError) -> Self {
        match value {
            DieselError::NotFound => RepositoryError::NotFound("row".into()),
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                RepositoryError::Conflict(info.message().to_string())
            }
            DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
                RepositoryError::Unavailable(info.message().to_string())
            }
            other => RepositoryError::Database(other.to_string()),
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = queue_entries)]
struct InsertQueueEntry {
    id: Uuid,
    queue: String,
    payload: Value,
    priority: i32,
    status: QueueEntryStatus,
    attempts: i32,
    max_attempts: i32,
    run_after: DateTime<Utc>,
    dedupe_key: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(QueryableByName)]
struct UsageRow {
    #[diesel(sql_type = BigInt)]
    total: i64,
}

/// Diesel-backed repository. Every call checks out a pooled connection on the
/// blocking thread pool.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run<T, F>(&self, operation: F) -> RepositoryResult<T>
    where
        F: FnOnce(&mut PgConnection) -> RepositoryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| RepositoryError::Unavailable(format!("database pool error: {err}")))?;
            operation(&mut conn)
        })
        .await
        .map_err(|err| RepositoryError::Database(format!("database task panicked: {err}")))?
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn insert_file(&self, file: FileRecord) -> RepositoryResult<FileRecord> {
        self.run(move |conn| {
            diesel::insert_into(files::table)
                .values(&file)
                .execute(conn)?;
            Ok(file)
        })
        .await
    }

    async fn insert_file_within_quota(
        &self,
        file: FileRecord,
        quota_bytes: i64,
    ) -> RepositoryResult<Option<FileRecord>> {
        self.run(move |conn| {
            conn.transaction::<_, RepositoryError, _>(|conn| {
                // one quota decision per organization at a time
                diesel::sql_query("SELECT pg_advisory_xact_lock(hashtext($1))")
                    .bind::<Text, _>(format!("quota:{}", file.organization_id))
                    .execute(conn)?;

                let row: UsageRow = diesel::sql_query(
                    "SELECT COALESCE(SUM(size_bytes), 0)::BIGINT AS total \
                     FROM files WHERE organization_id = $1 AND NOT is_deleted",
                )
                .bind::<SqlUuid, _>(file.organization_id)
                .get_result(conn)?;
                if row.total.saturating_add(file.size_bytes) > quota_bytes {
                    return Ok(None);
                }

                diesel::insert_into(files::table)
                    .values(&file)
                    .execute(conn)?;
                Ok(Some(file))
            })
        })
        .await
    }

    async fn get_file(&self, file_id: Uuid) -> RepositoryResult<Option<FileRecord>> {
        self.run(move |conn| {
            Ok(files::table
                .find(file_id)
                .select(FileRecord::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn soft_delete_file(&self, file_id: Uuid) -> RepositoryResult<Option<FileRecord>> {
        self.run(move |conn| {
            let now = Utc::now();
            Ok(diesel::update(files::table.find(file_id))
                .set((
                    files::is_deleted.eq(true),
                    files::is_active.eq(false),
                    files::deleted_at.eq(Some(now)),
                    files::updated_at.eq(now),
                ))
                .returning(FileRecord::as_returning())
                .get_result(conn)
                .optional()?)
        })
        .await
    }

    async fn list_active_files(
        &self,
        organization_id: Uuid,
        updated_since: Option<DateTime<Utc>>,
    ) -> RepositoryResult<Vec<FileRecord>> {
        self.run(move |conn| {
            let mut query = files::table
                .filter(files::organization_id.eq(organization_id))
                .filter(files::is_active.eq(true))
                .filter(files::is_deleted.eq(false))
                .select(FileRecord::as_select())
                .order(files::id.asc())
                .into_boxed();
            if let Some(since) = updated_since {
                query = query.filter(files::updated_at.ge(since));
            }
            Ok(query.load(conn)?)
        })
        .await
    }

    async fn list_files_page(
        &self,
        organization_id: Uuid,
        after: Option<Uuid>,
        limit: i64,
    ) -> RepositoryResult<Vec<FileRecord>> {
        self.run(move |conn| {
            let mut query = files::table
                .filter(files::organization_id.eq(organization_id))
                .filter(files::is_active.eq(true))
                .filter(files::is_deleted.eq(false))
                .select(FileRecord::as_select())
                .order(files::id.asc())
                .limit(limit)
                .into_boxed();
            if let Some(cursor) = after {
                query = query.filter(files::id.gt(cursor));
            }
            Ok(query.load(conn)?)
        })
        .await
    }

    async fn organization_usage_bytes(&self, organization_id: Uuid) -> RepositoryResult<i64> {
        self.run(move |conn| {
            let row: UsageRow = diesel::sql_query(
                "SELECT COALESCE(SUM(size_bytes), 0)::BIGINT AS total \
                 FROM files WHERE organization_id = $1 AND NOT is_deleted",
            )
            .bind::<SqlUuid, _>(organization_id)
            .get_result(conn)?;
            Ok(row.total)
        })
        .await
    }

    async fn organization_settings(
        &self,
        organization_id: Uuid,
    ) -> RepositoryResult<Option<OrganizationSettings>> {
        self.run(move |conn| {
            Ok(organization_settings::table
                .find(organization_id)
                .select(OrganizationSettings::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn upsert_organization_settings(
        &self,
        settings: OrganizationSettings,
    ) -> RepositoryResult<()> {
        self.run(move |conn| {
            diesel::insert_into(organization_settings::table)
                .values(&settings)
                .on_conflict(organization_settings::organization_id)
                .do_update()
                .set(&settings)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn insert_location(&self, location: StorageLocation) -> RepositoryResult<StorageLocation> {
        self.run(move |conn| {
            diesel::insert_into(storage_locations::table)
                .values(&location)
                .execute(conn)?;
            Ok(location)
        })
        .await
    }

    async fn list_locations(&self, file_id: Uuid) -> RepositoryResult<Vec<StorageLocation>> {
        self.run(move |conn| {
            Ok(storage_locations::table
                .filter(storage_locations::file_id.eq(file_id))
                .order((
                    storage_locations::is_primary.desc(),
                    storage_locations::created_at.asc(),
                ))
                .select(StorageLocation::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn delete_location(&self, location_id: Uuid) -> RepositoryResult<()> {
        self.run(move |conn| {
            diesel::delete(storage_locations::table.find(location_id)).execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn set_primary_location(&self, file_id: Uuid, location_id: Uuid) -> RepositoryResult<()> {
        self.run(move |conn| {
            conn.transaction::<_, RepositoryError, _>(|conn| {
                diesel::update(
                    storage_locations::table.filter(storage_locations::file_id.eq(file_id)),
                )
                .set(storage_locations::is_primary.eq(false))
                .execute(conn)?;

                let updated = diesel::update(
                    storage_locations::table
                        .find(location_id)
                        .filter(storage_locations::file_id.eq(file_id)),
                )
                .set(storage_locations::is_primary.eq(true))
                .execute(conn)?;

                if updated == 0 {
                    return Err(RepositoryError::NotFound(format!(
                        "storage location {location_id}"
                    )));
                }
                Ok(())
            })
        })
        .await
    }

    async fn try_acquire_file_lock(
        &self,
        file_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> RepositoryResult<bool> {
        let holder = holder.to_string();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(5));
        self.run(move |conn| {
            conn.transaction::<_, RepositoryError, _>(|conn| {
                let now = Utc::now();
                diesel::delete(
                    file_locks::table
                        .filter(file_locks::file_id.eq(file_id))
                        .filter(file_locks::expires_at.le(now)),
                )
                .execute(conn)?;

                let inserted = diesel::insert_into(file_locks::table)
                    .values((
                        file_locks::file_id.eq(file_id),
                        file_locks::holder.eq(&holder),
                        file_locks::acquired_at.eq(now),
                        file_locks::expires_at.eq(now + ttl),
                    ))
                    .on_conflict_do_nothing()
                    .execute(conn)?;
                Ok(inserted == 1)
            })
        })
        .await
    }

    async fn release_file_lock(&self, file_id: Uuid, holder: &str) -> RepositoryResult<()> {
        let holder = holder.to_string();
        self.run(move |conn| {
            diesel::delete(
                file_locks::table
                    .filter(file_locks::file_id.eq(file_id))
                    .filter(file_locks::holder.eq(holder)),
            )
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn insert_extraction_job(&self, job: ExtractionJob) -> RepositoryResult<ExtractionJob> {
        self.run(move |conn| {
            diesel::insert_into(extraction_jobs::table)
                .values(&job)
                .execute(conn)?;
            Ok(job)
        })
        .await
    }

    async fn get_extraction_job(&self, job_id: Uuid) -> RepositoryResult<Option<ExtractionJob>> {
        self.run(move |conn| {
            Ok(extraction_jobs::table
                .find(job_id)
                .select(ExtractionJob::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn update_extraction_job(
        &self,
        job: &ExtractionJob,
        expected: JobStatus,
    ) -> RepositoryResult<()> {
        let job = job.clone();
        self.run(move |conn| {
            let updated = diesel::update(
                extraction_jobs::table
                    .find(job.id)
                    .filter(extraction_jobs::status.eq(expected)),
            )
            .set(&job)
            .execute(conn)?;
            if updated == 1 {
                return Ok(());
            }

            let current: Option<JobStatus> = extraction_jobs::table
                .find(job.id)
                .select(extraction_jobs::status)
                .first(conn)
                .optional()?;
            match current {
                Some(status) => Err(RepositoryError::Conflict(format!(
                    "extraction job {} is {status} not {expected}",
                    job.id
                ))),
                None => Err(RepositoryError::NotFound(format!("extraction job {}", job.id))),
            }
        })
        .await
    }

    async fn list_extraction_jobs(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> RepositoryResult<Vec<ExtractionJob>> {
        self.run(move |conn| {
            Ok(extraction_jobs::table
                .filter(extraction_jobs::status.eq(status))
                .order((
                    extraction_jobs::priority.desc(),
                    extraction_jobs::created_at.asc(),
                ))
                .limit(limit)
                .select(ExtractionJob::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn list_stale_extraction_jobs(
        &self,
        started_before: DateTime<Utc>,
    ) -> RepositoryResult<Vec<ExtractionJob>> {
        self.run(move |conn| {
            Ok(extraction_jobs::table
                .filter(extraction_jobs::status.eq(JobStatus::Processing))
                .filter(
                    extraction_jobs::started_at
                        .lt(started_before)
                        .or(extraction_jobs::started_at.is_null()),
                )
                .order((
                    extraction_jobs::priority.desc(),
                    extraction_jobs::created_at.asc(),
                ))
                .select(ExtractionJob::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn extraction_jobs_for_file(
        &self,
        file_id: Uuid,
    ) -> RepositoryResult<Vec<ExtractionJob>> {
        self.run(move |conn| {
            Ok(extraction_jobs::table
                .filter(extraction_jobs::file_id.eq(file_id))
                .order(extraction_jobs::created_at.asc())
                .select(ExtractionJob::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn upsert_extracted_text(&self, content: ExtractedTextContent) -> RepositoryResult<()> {
        self.run(move |conn| {
            diesel::insert_into(extracted_text_contents::table)
                .values(&content)
                .on_conflict((
                    extracted_text_contents::file_id,
                    extracted_text_contents::content_type,
                ))
                .do_update()
                .set(&content)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn get_extracted_text(
        &self,
        file_id: Uuid,
        content_type: &str,
    ) -> RepositoryResult<Option<ExtractedTextContent>> {
        let content_type = content_type.to_string();
        self.run(move |conn| {
            Ok(extracted_text_contents::table
                .find((file_id, content_type))
                .select(ExtractedTextContent::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn get_index_status(&self, file_id: Uuid) -> RepositoryResult<Option<SearchIndexStatus>> {
        self.run(move |conn| {
            Ok(search_index_statuses::table
                .find(file_id)
                .select(SearchIndexStatus::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn upsert_index_status(&self, status: SearchIndexStatus) -> RepositoryResult<()> {
        self.run(move |conn| {
            diesel::insert_into(search_index_statuses::table)
                .values(&status)
                .on_conflict(search_index_statuses::file_id)
                .do_update()
                .set(&status)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn list_failed_index_statuses(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> RepositoryResult<Vec<SearchIndexStatus>> {
        self.run(move |conn| {
            Ok(search_index_statuses::table
                .filter(search_index_statuses::status.eq(IndexStatus::IndexFailed))
                .filter(search_index_statuses::retry_count.lt(max_retries))
                .order(search_index_statuses::updated_at.asc())
                .limit(limit)
                .select(SearchIndexStatus::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn list_stale_indexing_statuses(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<SearchIndexStatus>> {
        self.run(move |conn| {
            Ok(search_index_statuses::table
                .filter(search_index_statuses::status.eq(IndexStatus::Indexing))
                .filter(search_index_statuses::updated_at.lt(updated_before))
                .order(search_index_statuses::updated_at.asc())
                .limit(limit)
                .select(SearchIndexStatus::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn reset_index_statuses(&self, organization_id: Uuid) -> RepositoryResult<usize> {
        self.run(move |conn| {
            let organization_files = files::table
                .filter(files::organization_id.eq(organization_id))
                .select(files::id);
            Ok(diesel::update(
                search_index_statuses::table
                    .filter(search_index_statuses::file_id.eq_any(organization_files)),
            )
            .set((
                search_index_statuses::status.eq(IndexStatus::NotIndexed),
                search_index_statuses::retry_count.eq(0),
                search_index_statuses::last_error.eq(None::<String>),
                search_index_statuses::updated_at.eq(Utc::now()),
            ))
            .execute(conn)?)
        })
        .await
    }

    async fn insert_sync_job(&self, job: StorageSyncJob) -> RepositoryResult<StorageSyncJob> {
        self.run(move |conn| {
            diesel::insert_into(storage_sync_jobs::table)
                .values(&job)
                .execute(conn)?;
            Ok(job)
        })
        .await
    }

    async fn get_sync_job(&self, job_id: Uuid) -> RepositoryResult<Option<StorageSyncJob>> {
        self.run(move |conn| {
            Ok(storage_sync_jobs::table
                .find(job_id)
                .select(StorageSyncJob::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn update_sync_job(&self, job: &StorageSyncJob) -> RepositoryResult<()> {
        let job = job.clone();
        self.run(move |conn| {
            let updated = diesel::update(storage_sync_jobs::table.find(job.id))
                .set(&job)
                .execute(conn)?;
            if updated == 0 {
                return Err(RepositoryError::NotFound(format!("sync job {}", job.id)));
            }
            Ok(())
        })
        .await
    }

    async fn last_completed_sync(
        &self,
        organization_id: Uuid,
    ) -> RepositoryResult<Option<StorageSyncJob>> {
        self.run(move |conn| {
            Ok(storage_sync_jobs::table
                .filter(storage_sync_jobs::organization_id.eq(organization_id))
                .filter(storage_sync_jobs::status.eq(SyncStatus::Completed))
                .filter(storage_sync_jobs::sync_type.eq_any(ORGANIZATION_SYNC_TYPES))
                .order(storage_sync_jobs::started_at.desc())
                .select(StorageSyncJob::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn list_pending_sync_jobs(&self, limit: i64) -> RepositoryResult<Vec<StorageSyncJob>> {
        self.run(move |conn| {
            Ok(storage_sync_jobs::table
                .filter(storage_sync_jobs::status.eq(SyncStatus::Pending))
                .order(storage_sync_jobs::created_at.asc())
                .limit(limit)
                .select(StorageSyncJob::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn list_stale_sync_jobs(
        &self,
        started_before: DateTime<Utc>,
    ) -> RepositoryResult<Vec<StorageSyncJob>> {
        self.run(move |conn| {
            Ok(storage_sync_jobs::table
                .filter(storage_sync_jobs::status.eq(SyncStatus::Running))
                .filter(
                    storage_sync_jobs::started_at
                        .lt(started_before)
                        .or(storage_sync_jobs::started_at.is_null()),
                )
                .order(storage_sync_jobs::created_at.asc())
                .select(StorageSyncJob::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn enqueue(&self, entry: NewQueueEntry) -> RepositoryResult<Option<QueueEntry>> {
        self.run(move |conn| {
            conn.transaction::<_, RepositoryError, _>(|conn| {
                if let Some(key) = entry.dedupe_key.as_deref() {
                    // serializes concurrent enqueues of the same key
                    diesel::sql_query("SELECT pg_advisory_xact_lock(hashtext($1))")
                        .bind::<Text, _>(key)
                        .execute(conn)?;

                    let duplicate: bool = diesel::select(exists(
                        queue_entries::table
                            .filter(queue_entries::dedupe_key.eq(key))
                            .filter(queue_entries::status.eq(QueueEntryStatus::Queued)),
                    ))
                    .get_result(conn)?;
                    if duplicate {
                        return Ok(None);
                    }
                }

                let now = Utc::now();
                let row = InsertQueueEntry {
                    id: Uuid::new_v4(),
                    queue: entry.queue.clone(),
                    payload: entry.payload.clone(),
                    priority: entry.priority,
                    status: QueueEntryStatus::Queued,
                    attempts: 0,
                    max_attempts: entry.max_attempts,
                    run_after: entry.run_after,
                    dedupe_key: entry.dedupe_key.clone(),
                    created_at: now,
                    updated_at: now,
                };
                let stored = diesel::insert_into(queue_entries::table)
                    .values(&row)
                    .returning(QueueEntry::as_returning())
                    .get_result(conn)?;
                Ok(Some(stored))
            })
        })
        .await
    }

    async fn reserve_entry(&self, queue: &str) -> RepositoryResult<Option<QueueEntry>> {
        let queue = queue.to_string();
        self.run(move |conn| {
            let now = Utc::now();
            conn.transaction::<_, RepositoryError, _>(|conn| {
                let next = queue_entries::table
                    .filter(queue_entries::queue.eq(&queue))
                    .filter(queue_entries::status.eq(QueueEntryStatus::Queued))
                    .filter(queue_entries::run_after.le(now))
                    .order((queue_entries::priority.desc(), queue_entries::sequence.asc()))
                    .select(QueueEntry::as_select())
                    .for_update()
                    .skip_locked()
                    .first(conn)
                    .optional()?;

                let Some(entry) = next else {
                    return Ok(None);
                };

                let reserved = diesel::update(queue_entries::table.find(entry.id))
                    .set((
                        queue_entries::status.eq(QueueEntryStatus::Processing),
                        queue_entries::attempts.eq(entry.attempts + 1),
                        queue_entries::updated_at.eq(now),
                    ))
                    .returning(QueueEntry::as_returning())
                    .get_result(conn)?;
                Ok(Some(reserved))
            })
        })
        .await
    }

    async fn mark_entry_succeeded(&self, entry_id: Uuid) -> RepositoryResult<()> {
        self.run(move |conn| {
            diesel::update(queue_entries::table.find(entry_id))
                .set((
                    queue_entries::status.eq(QueueEntryStatus::Succeeded),
                    queue_entries::last_error.eq(None::<String>),
                    queue_entries::updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn retry_entry_after(
        &self,
        entry_id: Uuid,
        run_after: DateTime<Utc>,
        error: &str,
    ) -> RepositoryResult<()> {
        let error = error.to_string();
        self.run(move |conn| {
            diesel::update(queue_entries::table.find(entry_id))
                .set((
                    queue_entries::status.eq(QueueEntryStatus::Queued),
                    queue_entries::run_after.eq(run_after),
                    queue_entries::last_error.eq(Some(error)),
                    queue_entries::updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn mark_entry_failed(&self, entry_id: Uuid, error: &str) -> RepositoryResult<()> {
        let error = error.to_string();
        self.run(move |conn| {
            diesel::update(queue_entries::table.find(entry_id))
                .set((
                    queue_entries::status.eq(QueueEntryStatus::Failed),
                    queue_entries::last_error.eq(Some(error)),
                    queue_entries::updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn queued_count(&self, queue: &str) -> RepositoryResult<i64> {
        let queue = queue.to_string();
        self.run(move |conn| {
            Ok(queue_entries::table
                .filter(queue_entries::queue.eq(queue))
                .filter(queue_entries::status.eq(QueueEntryStatus::Queued))
                .count()
                .get_result(conn)?)
        })
        .await
    }

    async fn requeue_stale_entries(
        &self,
        updated_before: DateTime<Utc>,
    ) -> RepositoryResult<usize> {
        self.run(move |conn| {
            let now = Utc::now();
            Ok(diesel::update(
                queue_entries::table
                    .filter(queue_entries::status.eq(QueueEntryStatus::Processing))
                    .filter(queue_entries::updated_at.lt(updated_before)),
            )
            .set((
                queue_entries::status.eq(QueueEntryStatus::Queued),
                queue_entries::run_after.eq(now),
                queue_entries::updated_at.eq(now),
            ))
            .execute(conn)?)
        })
        .await
    }
}
