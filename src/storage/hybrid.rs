//! Placement of file bytes across the configured backends.
//!
//! The primary copy is written synchronously during upload. Under the
//! `hybrid` policy a second copy goes to the other backend on a best-effort
//! basis; anything that goes wrong there is repaired later by a storage sync
//! job running through the queue.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{inline_content_disposition, StorageError, StorageProviders};
use crate::config::PipelineSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    FileRecord, OrganizationSettings, StorageBackendKind, StorageLocation, StorageSyncJob,
    SyncStatus, SyncType, Visibility,
};
use crate::queue::{Enqueuer, JobKind};
use crate::repository::Repository;
use crate::strategy::logical_file_type;

/// Trigger recorded on sync jobs created because a backup write failed.
pub const BACKUP_FAILURE_TRIGGER: &str = "backup_write_failure";

#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub organization_id: Uuid,
    pub bytes: Vec<u8>,
    pub original_name: String,
    pub mime_type: String,
    pub folder_id: Option<Uuid>,
    pub title: Option<String>,
    pub department: Option<String>,
    pub tags: Vec<String>,
    pub visibility: Visibility,
    pub metadata: Value,
}

impl StoreRequest {
    pub fn new(
        organization_id: Uuid,
        original_name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            organization_id,
            bytes,
            original_name: original_name.into(),
            mime_type: mime_type.into(),
            folder_id: None,
            title: None,
            department: None,
            tags: Vec::new(),
            visibility: Visibility::Organization,
            metadata: Value::Object(Default::default()),
        }
    }
}

/// A backup copy that could not be written during upload. The recorded sync
/// job repairs it once scheduled.
#[must_use = "a deferred backup is only repaired once it is scheduled"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupDeferred {
    pub sync_job_id: Uuid,
    pub backend: StorageBackendKind,
    pub error: String,
}

impl BackupDeferred {
    pub async fn schedule(self, manager: &HybridStorageManager) -> PipelineResult<Uuid> {
        manager
            .enqueuer
            .enqueue_default(JobKind::StorageSync {
                sync_job_id: self.sync_job_id,
            })
            .await?;
        Ok(self.sync_job_id)
    }
}

#[derive(Debug)]
pub struct StoredFile {
    pub file: FileRecord,
    pub primary: StorageLocation,
    pub backup: Result<Option<StorageLocation>, BackupDeferred>,
}

impl StoredFile {
    pub fn checksum(&self) -> &str {
        &self.file.checksum
    }
}

pub struct HybridStorageManager {
    repo: Arc<dyn Repository>,
    providers: StorageProviders,
    enqueuer: Enqueuer,
    settings: PipelineSettings,
    holder: String,
}

impl HybridStorageManager {
    pub fn new(
        repo: Arc<dyn Repository>,
        providers: StorageProviders,
        enqueuer: Enqueuer,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            repo,
            providers,
            enqueuer,
            settings,
            holder: format!("storage-sync-{}", Uuid::new_v4()),
        }
    }

    pub fn providers(&self) -> &StorageProviders {
        &self.providers
    }

    /// Stored settings of the organization, or the configured defaults.
    pub async fn settings_for(&self, organization_id: Uuid) -> PipelineResult<OrganizationSettings> {
        let stored = self.repo.organization_settings(organization_id).await?;
        Ok(stored.unwrap_or_else(|| OrganizationSettings {
            organization_id,
            storage_policy: self.settings.default_storage_policy,
            primary_backend: self.settings.default_primary_backend,
            quota_bytes: None,
            downstream_enabled: false,
        }))
    }

    pub async fn store_file(&self, mut request: StoreRequest) -> PipelineResult<StoredFile> {
        let org = request.organization_id;
        let settings = self.settings_for(org).await?;
        let size = request.bytes.len() as i64;

        if let Some(quota) = settings.quota_bytes {
            let used = self.repo.organization_usage_bytes(org).await?;
            if used.saturating_add(size) > quota {
                return Err(PipelineError::QuotaExceeded(format!(
                    "organization {org} uses {used} of {quota} bytes, upload needs {size}"
                )));
            }
        }

        let checksum = sha256_hex(&request.bytes);
        let file_id = Uuid::new_v4();
        let key = object_key(org, file_id);
        let disposition = inline_content_disposition(&request.original_name);
        let backup_kind = settings.backup();

        let primary_provider = self.providers.get(settings.primary())?;
        let primary_bytes = if backup_kind.is_some() {
            request.bytes.clone()
        } else {
            std::mem::take(&mut request.bytes)
        };
        let locator = primary_provider
            .write(
                &key,
                primary_bytes,
                Some(request.mime_type.clone()),
                disposition.clone(),
            )
            .await?;

        let now = Utc::now();
        let record = FileRecord {
            id: file_id,
            organization_id: org,
            folder_id: request.folder_id,
            title: request
                .title
                .clone()
                .filter(|title| !title.trim().is_empty())
                .unwrap_or_else(|| request.original_name.clone()),
            file_type: logical_file_type(&request.mime_type, &request.original_name),
            original_name: request.original_name.clone(),
            mime_type: request.mime_type.clone(),
            size_bytes: size,
            checksum: checksum.clone(),
            department: request.department.clone(),
            tags: request.tags.clone(),
            visibility: request.visibility,
            metadata: request.metadata.clone(),
            is_active: true,
            is_deleted: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };

        // the quota is decided atomically with the insert
        let inserted = match settings.quota_bytes {
            Some(quota) => self.repo.insert_file_within_quota(record, quota).await,
            None => self.repo.insert_file(record).await.map(Some),
        };
        let file = match inserted {
            Ok(Some(file)) => file,
            Ok(None) => {
                discard_bytes(primary_provider.as_ref(), &locator).await;
                return Err(PipelineError::QuotaExceeded(format!(
                    "organization {org} has no room left for {size} bytes"
                )));
            }
            Err(err) => {
                discard_bytes(primary_provider.as_ref(), &locator).await;
                return Err(err.into());
            }
        };

        let primary = StorageLocation {
            id: Uuid::new_v4(),
            file_id,
            backend: primary_provider.kind(),
            locator: locator.clone(),
            is_primary: true,
            storage_class: primary_provider.storage_class().to_string(),
            checksum: checksum.clone(),
            created_at: now,
        };
        let primary = match self.repo.insert_location(primary).await {
            Ok(location) => location,
            Err(err) => {
                discard_bytes(primary_provider.as_ref(), &locator).await;
                if let Err(cleanup) = self.repo.soft_delete_file(file_id).await {
                    error!(%file_id, error = %cleanup, "could not retract file after failed location insert");
                }
                return Err(err.into());
            }
        };

        info!(
            %file_id,
            organization_id = %org,
            backend = %primary.backend,
            size_bytes = size,
            "stored primary copy"
        );

        let backup = match backup_kind {
            None => Ok(None),
            Some(kind) => {
                self.write_backup(&file, kind, &key, request.bytes, disposition)
                    .await?
            }
        };

        Ok(StoredFile {
            file,
            primary,
            backup,
        })
    }

    async fn write_backup(
        &self,
        file: &FileRecord,
        kind: StorageBackendKind,
        key: &str,
        bytes: Vec<u8>,
        disposition: Option<String>,
    ) -> PipelineResult<Result<Option<StorageLocation>, BackupDeferred>> {
        match self.try_backup(file, kind, key, bytes, disposition).await {
            Ok(location) => Ok(Ok(Some(location))),
            Err(err) => {
                warn!(file_id = %file.id, backend = %kind, error = %err, "backup write failed; deferring to sync");
                let job = self
                    .record_sync_job(
                        file.organization_id,
                        SyncType::File,
                        Some(file.id),
                        BACKUP_FAILURE_TRIGGER,
                    )
                    .await?;
                Ok(Err(BackupDeferred {
                    sync_job_id: job.id,
                    backend: kind,
                    error: err.to_string(),
                }))
            }
        }
    }

    async fn try_backup(
        &self,
        file: &FileRecord,
        kind: StorageBackendKind,
        key: &str,
        bytes: Vec<u8>,
        disposition: Option<String>,
    ) -> PipelineResult<StorageLocation> {
        let provider = self.providers.get(kind)?;
        let locator = provider
            .write(key, bytes, Some(file.mime_type.clone()), disposition)
            .await?;
        let location = StorageLocation {
            id: Uuid::new_v4(),
            file_id: file.id,
            backend: kind,
            locator: locator.clone(),
            is_primary: false,
            storage_class: provider.storage_class().to_string(),
            checksum: file.checksum.clone(),
            created_at: Utc::now(),
        };
        match self.repo.insert_location(location).await {
            Ok(location) => Ok(location),
            Err(err) => {
                discard_bytes(provider.as_ref(), &locator).await;
                Err(err.into())
            }
        }
    }

    async fn record_sync_job(
        &self,
        organization_id: Uuid,
        sync_type: SyncType,
        file_id: Option<Uuid>,
        triggered_by: &str,
    ) -> PipelineResult<StorageSyncJob> {
        if sync_type == SyncType::File && file_id.is_none() {
            return Err(PipelineError::Configuration(
                "a file sync needs a file id".into(),
            ));
        }
        let job = StorageSyncJob {
            id: Uuid::new_v4(),
            organization_id,
            sync_type,
            status: SyncStatus::Pending,
            triggered_by: triggered_by.to_string(),
            file_id,
            files_checked: 0,
            files_repaired: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        Ok(self.repo.insert_sync_job(job).await?)
    }

    /// Records a sync job and schedules its execution on the storage queue.
    pub async fn sync_storage(
        &self,
        organization_id: Uuid,
        sync_type: SyncType,
        file_id: Option<Uuid>,
        triggered_by: &str,
    ) -> PipelineResult<Uuid> {
        let job = self
            .record_sync_job(organization_id, sync_type, file_id, triggered_by)
            .await?;
        self.enqueuer
            .enqueue_default(JobKind::StorageSync {
                sync_job_id: job.id,
            })
            .await?;
        info!(sync_job_id = %job.id, %organization_id, %sync_type, "storage sync scheduled");
        Ok(job.id)
    }

    /// Executes a recorded sync job. Transient failures put the job back to
    /// `pending` and are returned so the queue retries; drift on a file fails
    /// the job after the remaining files were processed.
    pub async fn run_sync(&self, sync_job_id: Uuid) -> PipelineResult<StorageSyncJob> {
        let mut job = self
            .repo
            .get_sync_job(sync_job_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("sync job {sync_job_id}")))?;
        if matches!(job.status, SyncStatus::Completed | SyncStatus::Failed) {
            info!(%sync_job_id, status = %job.status, "sync job already finished");
            return Ok(job);
        }

        let deadline = Instant::now() + self.settings.sync_timeout;
        let settings = self.settings_for(job.organization_id).await?;
        let files = self.files_to_check(&job).await?;

        job.status = SyncStatus::Running;
        job.started_at = Some(Utc::now());
        job.completed_at = None;
        job.files_checked = 0;
        job.files_repaired = 0;
        job.error_message = None;
        self.repo.update_sync_job(&job).await?;

        let mut failures = Vec::new();
        for file in &files {
            job.files_checked += 1;
            match self.reconcile_file(file, &settings, deadline).await {
                Ok(true) => job.files_repaired += 1,
                Ok(false) => {}
                Err(err) if err.is_retryable() => {
                    warn!(%sync_job_id, file_id = %file.id, error = %err, "sync interrupted");
                    job.status = SyncStatus::Pending;
                    job.error_message = Some(err.to_string());
                    self.repo.update_sync_job(&job).await?;
                    return Err(err);
                }
                Err(err) => {
                    error!(%sync_job_id, file_id = %file.id, error = %err, "file could not be reconciled");
                    failures.push(format!("{}: {err}", file.id));
                }
            }
        }

        job.completed_at = Some(Utc::now());
        if failures.is_empty() {
            job.status = SyncStatus::Completed;
        } else {
            job.status = SyncStatus::Failed;
            job.error_message = Some(failures.join("; "));
        }
        self.repo.update_sync_job(&job).await?;
        info!(
            %sync_job_id,
            status = %job.status,
            files_checked = job.files_checked,
            files_repaired = job.files_repaired,
            "storage sync finished"
        );
        Ok(job)
    }

    async fn files_to_check(&self, job: &StorageSyncJob) -> PipelineResult<Vec<FileRecord>> {
        let org = job.organization_id;
        let files = match job.sync_type {
            SyncType::Full => self.repo.list_active_files(org, None).await?,
            SyncType::Incremental => {
                let since = self
                    .repo
                    .last_completed_sync(org)
                    .await?
                    .and_then(|previous| previous.started_at);
                self.repo.list_active_files(org, since).await?
            }
            SyncType::File => {
                let Some(file_id) = job.file_id else {
                    return Ok(Vec::new());
                };
                self.repo
                    .get_file(file_id)
                    .await?
                    .filter(|file| file.is_searchable() && file.organization_id == org)
                    .into_iter()
                    .collect()
            }
        };
        Ok(files)
    }

    async fn reconcile_file(
        &self,
        file: &FileRecord,
        settings: &OrganizationSettings,
        deadline: Instant,
    ) -> PipelineResult<bool> {
        let holder = format!("{}:{}", self.holder, Uuid::new_v4());
        let acquired = self
            .repo
            .try_acquire_file_lock(file.id, &holder, self.settings.file_lock_ttl)
            .await?;
        if !acquired {
            return Err(PipelineError::TransientIo(format!(
                "file {} is being reconciled elsewhere",
                file.id
            )));
        }

        // the lock is released on every path, including an expired deadline
        let result = match timeout_at(deadline, self.reconcile_locked(file, settings)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::TransientIo(format!(
                "storage sync exceeded {:?}",
                self.settings.sync_timeout
            ))),
        };
        if let Err(err) = self.repo.release_file_lock(file.id, &holder).await {
            warn!(file_id = %file.id, error = %err, "could not release file lock");
        }
        result
    }

    async fn reconcile_locked(
        &self,
        file: &FileRecord,
        settings: &OrganizationSettings,
    ) -> PipelineResult<bool> {
        let required = settings.required_backends();
        let mut repaired = false;

        let mut present: HashMap<StorageBackendKind, StorageLocation> = HashMap::new();
        let mut missing = Vec::new();
        let mut ordered = Vec::new();
        for location in self.repo.list_locations(file.id).await? {
            let Ok(provider) = self.providers.get(location.backend) else {
                warn!(file_id = %file.id, backend = %location.backend, "backend not configured; copy left untouched");
                continue;
            };
            if provider.exists(&location.locator).await? {
                ordered.push(location.clone());
                present.insert(location.backend, location);
            } else {
                missing.push(location);
            }
        }

        // primary first, as listed by the repository
        let mut source = None;
        if let Some(location) = ordered.first() {
            let provider = self.providers.get(location.backend)?;
            let bytes = provider.read(&location.locator).await?;
            let digest = sha256_hex(&bytes);
            if digest != file.checksum {
                return Err(PipelineError::Drift(format!(
                    "{} copy of file {} has checksum {digest}, expected {}",
                    location.backend, file.id, file.checksum
                )));
            }
            source = Some(bytes);
        }
        let Some(source) = source else {
            return Err(PipelineError::Drift(format!(
                "no readable copy of file {} remains",
                file.id
            )));
        };

        // the primary flag moves to a readable copy before a missing primary row goes
        if missing.iter().any(|location| location.is_primary) {
            if let Some(survivor) = ordered.first() {
                self.repo
                    .set_primary_location(file.id, survivor.id)
                    .await?;
                if let Some(location) = present.get_mut(&survivor.backend) {
                    location.is_primary = true;
                }
                info!(file_id = %file.id, backend = %survivor.backend, "primary moved to surviving copy");
            }
        }

        for location in missing {
            warn!(file_id = %file.id, backend = %location.backend, locator = %location.locator, "recorded copy is missing");
            self.repo.delete_location(location.id).await?;
            repaired = true;
        }

        for kind in &required {
            if present.contains_key(kind) {
                continue;
            }
            let provider = match self.providers.get(*kind) {
                Ok(provider) => provider,
                Err(err) => {
                    warn!(file_id = %file.id, backend = %kind, error = %err, "cannot recreate copy");
                    continue;
                }
            };
            let locator = provider
                .write(
                    &object_key(file.organization_id, file.id),
                    source.clone(),
                    Some(file.mime_type.clone()),
                    inline_content_disposition(&file.original_name),
                )
                .await?;

            let written = provider.read(&locator).await?;
            let digest = sha256_hex(&written);
            if digest != file.checksum {
                discard_bytes(provider.as_ref(), &locator).await;
                return Err(PipelineError::Drift(format!(
                    "recreated {kind} copy of file {} has checksum {digest}, expected {}",
                    file.id, file.checksum
                )));
            }

            let location = self
                .repo
                .insert_location(StorageLocation {
                    id: Uuid::new_v4(),
                    file_id: file.id,
                    backend: *kind,
                    locator,
                    is_primary: false,
                    storage_class: provider.storage_class().to_string(),
                    checksum: file.checksum.clone(),
                    created_at: Utc::now(),
                })
                .await?;
            info!(file_id = %file.id, backend = %kind, "recreated missing copy");
            present.insert(*kind, location);
            repaired = true;
        }

        let target = present
            .get(&settings.primary())
            .or_else(|| required.iter().find_map(|kind| present.get(kind)))
            .or_else(|| present.values().next());
        if let Some(target) = target {
            if !target.is_primary {
                self.repo.set_primary_location(file.id, target.id).await?;
                info!(file_id = %file.id, backend = %target.backend, "moved primary copy");
                repaired = true;
            }
        }

        let complete = required.iter().all(|kind| present.contains_key(kind));
        if complete {
            for (kind, location) in &present {
                if required.contains(kind) {
                    continue;
                }
                let provider = self.providers.get(*kind)?;
                match provider.delete(&location.locator).await {
                    Ok(()) | Err(StorageError::NotFound(_)) => {}
                    Err(err) => return Err(err.into()),
                }
                self.repo.delete_location(location.id).await?;
                info!(file_id = %file.id, backend = %kind, "removed surplus copy");
                repaired = true;
            }
        }

        Ok(repaired)
    }

    /// Bytes of the file, from the primary copy or, when that is gone, from
    /// any other recorded copy.
    pub async fn read_file(&self, file_id: Uuid) -> PipelineResult<Vec<u8>> {
        let locations = self.repo.list_locations(file_id).await?;
        let mut last_error = PipelineError::NotFound(format!("stored copy of file {file_id}"));
        for location in locations {
            let provider = match self.providers.get(location.backend) {
                Ok(provider) => provider,
                Err(err) => {
                    last_error = err;
                    continue;
                }
            };
            match provider.read(&location.locator).await {
                Ok(bytes) => return Ok(bytes),
                Err(StorageError::NotFound(locator)) => {
                    warn!(%file_id, backend = %location.backend, %locator, "copy missing; trying next");
                    last_error = StorageError::NotFound(locator).into();
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last_error)
    }

    pub async fn presigned_url(&self, file_id: Uuid, ttl: Duration) -> PipelineResult<String> {
        let locations = self.repo.list_locations(file_id).await?;
        let mut last_error = PipelineError::NotFound(format!("stored copy of file {file_id}"));
        for location in locations {
            let provider = match self.providers.get(location.backend) {
                Ok(provider) => provider,
                Err(err) => {
                    last_error = err;
                    continue;
                }
            };
            match provider.presign(&location.locator, ttl).await {
                Ok(url) => return Ok(url),
                Err(StorageError::NotFound(locator)) => {
                    last_error = StorageError::NotFound(locator).into();
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last_error)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn object_key(organization_id: Uuid, file_id: Uuid) -> String {
    format!("orgs/{organization_id}/files/{file_id}")
}

async fn discard_bytes(provider: &dyn super::StorageProvider, locator: &str) {
    if let Err(err) = provider.delete(locator).await {
        error!(%locator, backend = %provider.kind(), error = %err, "failed to remove orphaned bytes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_lowercase_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn object_keys_are_scoped_by_organization() {
        let org = Uuid::nil();
        let file = Uuid::from_u128(7);
        assert_eq!(
            object_key(org, file),
            format!("orgs/{org}/files/{file}")
        );
    }
}
