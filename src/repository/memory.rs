use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Repository, RepositoryError, RepositoryResult};
use crate::models::{
    ExtractedTextContent, ExtractionJob, FileRecord, IndexStatus, JobStatus, NewQueueEntry,
    OrganizationSettings, QueueEntry, QueueEntryStatus, SearchIndexStatus, StorageLocation,
    StorageSyncJob, SyncStatus, ORGANIZATION_SYNC_TYPES,
};

#[derive(Default)]
struct State {
    files: HashMap<Uuid, FileRecord>,
    settings: HashMap<Uuid, OrganizationSettings>,
    locations: HashMap<Uuid, StorageLocation>,
    locks: HashMap<Uuid, (String, DateTime<Utc>)>,
    extraction_jobs: HashMap<Uuid, ExtractionJob>,
    contents: HashMap<(Uuid, String), ExtractedTextContent>,
    index_statuses: HashMap<Uuid, SearchIndexStatus>,
    sync_jobs: HashMap<Uuid, StorageSyncJob>,
    queue: Vec<QueueEntry>,
    next_sequence: i64,
}

impl State {
    fn processing_conflict(&self, job: &ExtractionJob) -> bool {
        job.status == JobStatus::Processing
            && self.extraction_jobs.values().any(|other| {
                other.id != job.id
                    && other.file_id == job.file_id
                    && other.method == job.method
                    && other.status == JobStatus::Processing
            })
    }

    fn entry_mut(&mut self, entry_id: Uuid) -> RepositoryResult<&mut QueueEntry> {
        self.queue
            .iter_mut()
            .find(|entry| entry.id == entry_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("queue entry {entry_id}")))
    }
}

/// Process-local repository with the same uniqueness guarantees as the
/// PostgreSQL schema. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every queue entry ever written, including finished ones.
    pub async fn queue_entries(&self) -> Vec<QueueEntry> {
        self.state.lock().await.queue.clone()
    }

    pub async fn all_sync_jobs(&self) -> Vec<StorageSyncJob> {
        self.state.lock().await.sync_jobs.values().cloned().collect()
    }
}

fn by_priority_then_age(a: &ExtractionJob, b: &ExtractionJob) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn insert_file(&self, file: FileRecord) -> RepositoryResult<FileRecord> {
        let mut state = self.state.lock().await;
        if state.files.contains_key(&file.id) {
            return Err(RepositoryError::Conflict(format!("file {}", file.id)));
        }
        state.files.insert(file.id, file.clone());
        Ok(file)
    }

    async fn insert_file_within_quota(
        &self,
        file: FileRecord,
        quota_bytes: i64,
    ) -> RepositoryResult<Option<FileRecord>> {
        let mut state = self.state.lock().await;
        if state.files.contains_key(&file.id) {
            return Err(RepositoryError::Conflict(format!("file {}", file.id)));
        }
        let used: i64 = state
            .files
            .values()
            .filter(|existing| existing.organization_id == file.organization_id && !existing.is_deleted)
            .map(|existing| existing.size_bytes)
            .sum();
        if used.saturating_add(file.size_bytes) > quota_bytes {
            return Ok(None);
        }
        state.files.insert(file.id, file.clone());
        Ok(Some(file))
    }

    async fn get_file(&self, file_id: Uuid) -> RepositoryResult<Option<FileRecord>> {
        Ok(self.state.lock().await.files.get(&file_id).cloned())
    }

    async fn soft_delete_file(&self, file_id: Uuid) -> RepositoryResult<Option<FileRecord>> {
        let mut state = self.state.lock().await;
        let Some(file) = state.files.get_mut(&file_id) else {
            return Ok(None);
        };
        let now = Utc::now();
        file.is_deleted = true;
        file.is_active = false;
        file.deleted_at = Some(now);
        file.updated_at = now;
        Ok(Some(file.clone()))
    }

    async fn list_active_files(
        &self,
        organization_id: Uuid,
        updated_since: Option<DateTime<Utc>>,
    ) -> RepositoryResult<Vec<FileRecord>> {
        let state = self.state.lock().await;
        let mut files: Vec<FileRecord> = state
            .files
            .values()
            .filter(|file| file.organization_id == organization_id && file.is_searchable())
            .filter(|file| updated_since.map_or(true, |since| file.updated_at >= since))
            .cloned()
            .collect();
        files.sort_by_key(|file| file.id);
        Ok(files)
    }

    async fn list_files_page(
        &self,
        organization_id: Uuid,
        after: Option<Uuid>,
        limit: i64,
    ) -> RepositoryResult<Vec<FileRecord>> {
        let state = self.state.lock().await;
        let mut files: Vec<FileRecord> = state
            .files
            .values()
            .filter(|file| file.organization_id == organization_id && file.is_searchable())
            .filter(|file| after.map_or(true, |cursor| file.id > cursor))
            .cloned()
            .collect();
        files.sort_by_key(|file| file.id);
        files.truncate(limit.max(0) as usize);
        Ok(files)
    }

    async fn organization_usage_bytes(&self, organization_id: Uuid) -> RepositoryResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .files
            .values()
            .filter(|file| file.organization_id == organization_id && !file.is_deleted)
            .map(|file| file.size_bytes)
            .sum())
    }

    async fn organization_settings(
        &self,
        organization_id: Uuid,
    ) -> RepositoryResult<Option<OrganizationSettings>> {
        Ok(self
            .state
            .lock()
            .await
            .settings
            .get(&organization_id)
            .cloned())
    }

    async fn upsert_organization_settings(
        &self,
        settings: OrganizationSettings,
    ) -> RepositoryResult<()> {
        self.state
            .lock()
            .await
            .settings
            .insert(settings.organization_id, settings);
        Ok(())
    }

    async fn insert_location(&self, location: StorageLocation) -> RepositoryResult<StorageLocation> {
        let mut state = self.state.lock().await;
        let clash = state.locations.values().any(|existing| {
            existing.file_id == location.file_id
                && (existing.backend == location.backend
                    || (existing.is_primary && location.is_primary))
        });
        if clash {
            return Err(RepositoryError::Conflict(format!(
                "storage location {} for file {}",
                location.backend, location.file_id
            )));
        }
        state.locations.insert(location.id, location.clone());
        Ok(location)
    }

    async fn list_locations(&self, file_id: Uuid) -> RepositoryResult<Vec<StorageLocation>> {
        let state = self.state.lock().await;
        let mut locations: Vec<StorageLocation> = state
            .locations
            .values()
            .filter(|location| location.file_id == file_id)
            .cloned()
            .collect();
        locations.sort_by(|a, b| b.is_primary.cmp(&a.is_primary).then(a.created_at.cmp(&b.created_at)));
        Ok(locations)
    }

    async fn delete_location(&self, location_id: Uuid) -> RepositoryResult<()> {
        self.state.lock().await.locations.remove(&location_id);
        Ok(())
    }

    async fn set_primary_location(&self, file_id: Uuid, location_id: Uuid) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        let owned = state
            .locations
            .get(&location_id)
            .is_some_and(|location| location.file_id == file_id);
        if !owned {
            return Err(RepositoryError::NotFound(format!(
                "storage location {location_id}"
            )));
        }
        for location in state.locations.values_mut() {
            if location.file_id == file_id {
                location.is_primary = location.id == location_id;
            }
        }
        Ok(())
    }

    async fn try_acquire_file_lock(
        &self,
        file_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> RepositoryResult<bool> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some((_, expires_at)) = state.locks.get(&file_id) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(5));
        state.locks.insert(file_id, (holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_file_lock(&self, file_id: Uuid, holder: &str) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        if state
            .locks
            .get(&file_id)
            .is_some_and(|(current, _)| current == holder)
        {
            state.locks.remove(&file_id);
        }
        Ok(())
    }

    async fn insert_extraction_job(&self, job: ExtractionJob) -> RepositoryResult<ExtractionJob> {
        let mut state = self.state.lock().await;
        if state.processing_conflict(&job) {
            return Err(RepositoryError::Conflict(format!(
                "extraction already processing for file {} ({})",
                job.file_id, job.method
            )));
        }
        state.extraction_jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_extraction_job(&self, job_id: Uuid) -> RepositoryResult<Option<ExtractionJob>> {
        Ok(self.state.lock().await.extraction_jobs.get(&job_id).cloned())
    }

    async fn update_extraction_job(
        &self,
        job: &ExtractionJob,
        expected: JobStatus,
    ) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        let Some(current) = state.extraction_jobs.get(&job.id) else {
            return Err(RepositoryError::NotFound(format!("extraction job {}", job.id)));
        };
        if current.status != expected {
            return Err(RepositoryError::Conflict(format!(
                "extraction job {} is {} not {expected}",
                job.id, current.status
            )));
        }
        if state.processing_conflict(job) {
            return Err(RepositoryError::Conflict(format!(
                "extraction already processing for file {} ({})",
                job.file_id, job.method
            )));
        }
        state.extraction_jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn list_extraction_jobs(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> RepositoryResult<Vec<ExtractionJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<ExtractionJob> = state
            .extraction_jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by(by_priority_then_age);
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn list_stale_extraction_jobs(
        &self,
        started_before: DateTime<Utc>,
    ) -> RepositoryResult<Vec<ExtractionJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<ExtractionJob> = state
            .extraction_jobs
            .values()
            .filter(|job| job.status == JobStatus::Processing)
            .filter(|job| job.started_at.map_or(true, |started| started < started_before))
            .cloned()
            .collect();
        jobs.sort_by(by_priority_then_age);
        Ok(jobs)
    }

    async fn extraction_jobs_for_file(
        &self,
        file_id: Uuid,
    ) -> RepositoryResult<Vec<ExtractionJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<ExtractionJob> = state
            .extraction_jobs
            .values()
            .filter(|job| job.file_id == file_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn upsert_extracted_text(&self, content: ExtractedTextContent) -> RepositoryResult<()> {
        self.state
            .lock()
            .await
            .contents
            .insert((content.file_id, content.content_type.clone()), content);
        Ok(())
    }

    async fn get_extracted_text(
        &self,
        file_id: Uuid,
        content_type: &str,
    ) -> RepositoryResult<Option<ExtractedTextContent>> {
        Ok(self
            .state
            .lock()
            .await
            .contents
            .get(&(file_id, content_type.to_string()))
            .cloned())
    }

    async fn get_index_status(&self, file_id: Uuid) -> RepositoryResult<Option<SearchIndexStatus>> {
        Ok(self.state.lock().await.index_statuses.get(&file_id).cloned())
    }

    async fn upsert_index_status(&self, status: SearchIndexStatus) -> RepositoryResult<()> {
        self.state
            .lock()
            .await
            .index_statuses
            .insert(status.file_id, status);
        Ok(())
    }

    async fn list_failed_index_statuses(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> RepositoryResult<Vec<SearchIndexStatus>> {
        let state = self.state.lock().await;
        let mut statuses: Vec<SearchIndexStatus> = state
            .index_statuses
            .values()
            .filter(|status| {
                status.status == IndexStatus::IndexFailed && status.retry_count < max_retries
            })
            .cloned()
            .collect();
        statuses.sort_by_key(|status| status.updated_at);
        statuses.truncate(limit.max(0) as usize);
        Ok(statuses)
    }

    async fn list_stale_indexing_statuses(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<SearchIndexStatus>> {
        let state = self.state.lock().await;
        let mut statuses: Vec<SearchIndexStatus> = state
            .index_statuses
            .values()
            .filter(|status| {
                status.status == IndexStatus::Indexing && status.updated_at < updated_before
            })
            .cloned()
            .collect();
        statuses.sort_by_key(|status| status.updated_at);
        statuses.truncate(limit.max(0) as usize);
        Ok(statuses)
    }

    async fn reset_index_statuses(&self, organization_id: Uuid) -> RepositoryResult<usize> {
        let mut state = self.state.lock().await;
        let State {
            files,
            index_statuses,
            ..
        } = &mut *state;
        let now = Utc::now();
        let mut reset = 0;
        for status in index_statuses.values_mut() {
            let in_org = files
                .get(&status.file_id)
                .is_some_and(|file| file.organization_id == organization_id);
            if in_org {
                status.status = IndexStatus::NotIndexed;
                status.retry_count = 0;
                status.last_error = None;
                status.updated_at = now;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn insert_sync_job(&self, job: StorageSyncJob) -> RepositoryResult<StorageSyncJob> {
        self.state.lock().await.sync_jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_sync_job(&self, job_id: Uuid) -> RepositoryResult<Option<StorageSyncJob>> {
        Ok(self.state.lock().await.sync_jobs.get(&job_id).cloned())
    }

    async fn update_sync_job(&self, job: &StorageSyncJob) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        match state.sync_jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(format!("sync job {}", job.id))),
        }
    }

    async fn last_completed_sync(
        &self,
        organization_id: Uuid,
    ) -> RepositoryResult<Option<StorageSyncJob>> {
        let state = self.state.lock().await;
        Ok(state
            .sync_jobs
            .values()
            .filter(|job| {
                job.organization_id == organization_id
                    && job.status == SyncStatus::Completed
                    && ORGANIZATION_SYNC_TYPES.contains(&job.sync_type)
            })
            .max_by_key(|job| job.started_at)
            .cloned())
    }

    async fn list_pending_sync_jobs(&self, limit: i64) -> RepositoryResult<Vec<StorageSyncJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<StorageSyncJob> = state
            .sync_jobs
            .values()
            .filter(|job| job.status == SyncStatus::Pending)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn list_stale_sync_jobs(
        &self,
        started_before: DateTime<Utc>,
    ) -> RepositoryResult<Vec<StorageSyncJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<StorageSyncJob> = state
            .sync_jobs
            .values()
            .filter(|job| job.status == SyncStatus::Running)
            .filter(|job| job.started_at.map_or(true, |started| started < started_before))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn enqueue(&self, entry: NewQueueEntry) -> RepositoryResult<Option<QueueEntry>> {
        let mut state = self.state.lock().await;
        if let Some(key) = entry.dedupe_key.as_deref() {
            let duplicate = state.queue.iter().any(|existing| {
                existing.status == QueueEntryStatus::Queued
                    && existing.dedupe_key.as_deref() == Some(key)
            });
            if duplicate {
                return Ok(None);
            }
        }

        state.next_sequence += 1;
        let now = Utc::now();
        let stored = QueueEntry {
            id: Uuid::new_v4(),
            queue: entry.queue,
            payload: entry.payload,
            priority: entry.priority,
            sequence: state.next_sequence,
            status: QueueEntryStatus::Queued,
            attempts: 0,
            max_attempts: entry.max_attempts,
            run_after: entry.run_after,
            last_error: None,
            dedupe_key: entry.dedupe_key,
            created_at: now,
            updated_at: now,
        };
        state.queue.push(stored.clone());
        Ok(Some(stored))
    }

    async fn reserve_entry(&self, queue: &str) -> RepositoryResult<Option<QueueEntry>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let next = state
            .queue
            .iter_mut()
            .filter(|entry| {
                entry.queue == queue
                    && entry.status == QueueEntryStatus::Queued
                    && entry.run_after <= now
            })
            .min_by(|a, b| b.priority.cmp(&a.priority).then(a.sequence.cmp(&b.sequence)));

        Ok(next.map(|entry| {
            entry.status = QueueEntryStatus::Processing;
            entry.attempts += 1;
            entry.updated_at = now;
            entry.clone()
        }))
    }

    async fn mark_entry_succeeded(&self, entry_id: Uuid) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(entry_id)?;
        entry.status = QueueEntryStatus::Succeeded;
        entry.last_error = None;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn retry_entry_after(
        &self,
        entry_id: Uuid,
        run_after: DateTime<Utc>,
        error: &str,
    ) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(entry_id)?;
        entry.status = QueueEntryStatus::Queued;
        entry.run_after = run_after;
        entry.last_error = Some(error.to_string());
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_entry_failed(&self, entry_id: Uuid, error: &str) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(entry_id)?;
        entry.status = QueueEntryStatus::Failed;
        entry.last_error = Some(error.to_string());
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn queued_count(&self, queue: &str) -> RepositoryResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .queue
            .iter()
            .filter(|entry| entry.queue == queue && entry.status == QueueEntryStatus::Queued)
            .count() as i64)
    }

    async fn requeue_stale_entries(
        &self,
        updated_before: DateTime<Utc>,
    ) -> RepositoryResult<usize> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut requeued = 0;
        for entry in state.queue.iter_mut() {
            if entry.status == QueueEntryStatus::Processing && entry.updated_at < updated_before {
                entry.status = QueueEntryStatus::Queued;
                entry.run_after = now;
                entry.updated_at = now;
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::ExtractionMethod;

    fn job(file_id: Uuid, status: JobStatus) -> ExtractionJob {
        ExtractionJob {
            id: Uuid::new_v4(),
            file_id,
            method: ExtractionMethod::FastPdf,
            priority: 5,
            status,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            error_code: None,
            retry_count: 0,
            max_retries: 3,
            metadata: json!({}),
        }
    }

    fn entry(priority: i32, key: Option<&str>) -> NewQueueEntry {
        NewQueueEntry {
            queue: "extraction".into(),
            payload: json!({ "priority": priority }),
            priority,
            max_attempts: 3,
            run_after: Utc::now(),
            dedupe_key: key.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn rejects_second_processing_job_for_same_file_and_method() {
        let repo = MemoryRepository::new();
        let file_id = Uuid::new_v4();
        repo.insert_extraction_job(job(file_id, JobStatus::Processing))
            .await
            .unwrap();

        let mut second = repo
            .insert_extraction_job(job(file_id, JobStatus::Pending))
            .await
            .unwrap();
        second.status = JobStatus::Processing;
        let err = repo
            .update_extraction_job(&second, JobStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn stale_expected_status_is_a_conflict() {
        let repo = MemoryRepository::new();
        let mut stored = repo
            .insert_extraction_job(job(Uuid::new_v4(), JobStatus::Pending))
            .await
            .unwrap();
        stored.status = JobStatus::Processing;
        repo.update_extraction_job(&stored, JobStatus::Pending)
            .await
            .unwrap();

        // a second worker holding the old snapshot loses the race
        let err = repo
            .update_extraction_job(&stored, JobStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn reserves_by_priority_then_sequence() {
        let repo = MemoryRepository::new();
        let low = repo.enqueue(entry(3, None)).await.unwrap().unwrap();
        let high_first = repo.enqueue(entry(8, None)).await.unwrap().unwrap();
        let high_second = repo.enqueue(entry(8, None)).await.unwrap().unwrap();

        let order: Vec<Uuid> = [
            repo.reserve_entry("extraction").await.unwrap().unwrap().id,
            repo.reserve_entry("extraction").await.unwrap().unwrap().id,
            repo.reserve_entry("extraction").await.unwrap().unwrap().id,
        ]
        .to_vec();
        assert_eq!(order, vec![high_first.id, high_second.id, low.id]);
        assert!(repo.reserve_entry("extraction").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dedupe_key_only_blocks_while_queued() {
        let repo = MemoryRepository::new();
        assert!(repo.enqueue(entry(5, Some("index:a"))).await.unwrap().is_some());
        assert!(repo.enqueue(entry(5, Some("index:a"))).await.unwrap().is_none());

        let reserved = repo.reserve_entry("extraction").await.unwrap().unwrap();
        repo.mark_entry_succeeded(reserved.id).await.unwrap();
        assert!(repo.enqueue(entry(5, Some("index:a"))).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn file_lock_is_exclusive_until_released() {
        let repo = MemoryRepository::new();
        let file_id = Uuid::new_v4();
        let ttl = Duration::from_secs(60);
        assert!(repo.try_acquire_file_lock(file_id, "a", ttl).await.unwrap());
        assert!(!repo.try_acquire_file_lock(file_id, "b", ttl).await.unwrap());
        repo.release_file_lock(file_id, "b").await.unwrap();
        assert!(!repo.try_acquire_file_lock(file_id, "b", ttl).await.unwrap());
        repo.release_file_lock(file_id, "a").await.unwrap();
        assert!(repo.try_acquire_file_lock(file_id, "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_file_lock_can_be_taken_over() {
        let repo = MemoryRepository::new();
        let file_id = Uuid::new_v4();
        assert!(repo
            .try_acquire_file_lock(file_id, "a", Duration::ZERO)
            .await
            .unwrap());
        assert!(repo
            .try_acquire_file_lock(file_id, "b", Duration::from_secs(60))
            .await
            .unwrap());
    }
}
