//! Keeps the external search index in step with extracted text.
//!
//! [`SearchIndexer`] owns the per-file index status rows; the engine behind
//! [`SearchEngine`] only ever sees whole documents keyed by file id.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    FileRecord, FileType, IndexStatus, SearchIndexStatus, Visibility, FULL_TEXT_CONTENT,
};
use crate::repository::{Repository, RepositoryResult};

pub mod quickwit;

pub use quickwit::QuickwitEngine;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search engine unavailable: {0}")]
    Unavailable(String),
    #[error("search engine rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("search request failed: {0}")]
    Request(String),
}

/// The indexed representation of one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchDocument {
    pub file_id: Uuid,
    pub organization_id: Uuid,
    pub folder_id: Option<Uuid>,
    pub title: String,
    pub original_name: String,
    pub mime_type: String,
    pub file_type: FileType,
    pub department: Option<String>,
    pub tags: Vec<String>,
    pub visibility: Visibility,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SearchDocument {
    pub fn new(file: &FileRecord, text: String) -> Self {
        Self {
            file_id: file.id,
            organization_id: file.organization_id,
            folder_id: file.folder_id,
            title: file.title.clone(),
            original_name: file.original_name.clone(),
            mime_type: file.mime_type.clone(),
            file_type: file.file_type,
            department: file.department.clone(),
            tags: file.tags.clone(),
            visibility: file.visibility,
            text,
            created_at: file.created_at,
            updated_at: file.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineHealth {
    pub reachable: bool,
    pub index_exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl EngineHealth {
    pub fn healthy() -> Self {
        Self {
            reachable: true,
            index_exists: true,
            detail: None,
        }
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self {
            reachable: false,
            index_exists: false,
            detail: Some(detail.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.reachable && self.index_exists
    }
}

#[async_trait]
pub trait SearchEngine: Send + Sync + 'static {
    async fn health(&self) -> EngineHealth;

    /// Replaces any document of the same file; repeated calls leave one.
    async fn upsert(&self, document: &SearchDocument) -> Result<(), SearchError>;

    async fn delete(&self, file_id: Uuid) -> Result<(), SearchError>;
}

/// Stand-in used when no search endpoint is configured.
pub struct DisabledSearchEngine;

#[async_trait]
impl SearchEngine for DisabledSearchEngine {
    async fn health(&self) -> EngineHealth {
        EngineHealth::unavailable("no search endpoint configured")
    }

    async fn upsert(&self, _document: &SearchDocument) -> Result<(), SearchError> {
        Err(SearchError::Unavailable("no search endpoint configured".into()))
    }

    async fn delete(&self, _file_id: Uuid) -> Result<(), SearchError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IndexOutcome {
    Indexed,
    /// Nothing to index yet, typically because extraction has not finished.
    Skipped { reason: String },
    /// The file is gone or deleted; its document was removed.
    Removed,
    Failed { error: String, retry_count: i32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkIndexReport {
    pub examined: usize,
    pub indexed: usize,
    pub already_indexed: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct SearchIndexer {
    repo: Arc<dyn Repository>,
    engine: Arc<dyn SearchEngine>,
    request_timeout: Duration,
}

impl SearchIndexer {
    pub fn new(
        repo: Arc<dyn Repository>,
        engine: Arc<dyn SearchEngine>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            engine,
            request_timeout,
        }
    }

    /// Brings the engine in line with the current state of one file. Never
    /// fails; problems are recorded on the file's index status.
    pub async fn index_file(&self, file_id: Uuid) -> IndexOutcome {
        match self.try_index(file_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%file_id, error = %err, "indexing failed");
                let retry_count = self.record_failure(file_id, &err.to_string()).await;
                IndexOutcome::Failed {
                    error: err.to_string(),
                    retry_count,
                }
            }
        }
    }

    async fn try_index(&self, file_id: Uuid) -> PipelineResult<IndexOutcome> {
        let file = self.repo.get_file(file_id).await?;
        let Some(file) = file.filter(FileRecord::is_searchable) else {
            self.remove_from_index(file_id).await?;
            return Ok(IndexOutcome::Removed);
        };

        let content = self
            .repo
            .get_extracted_text(file_id, FULL_TEXT_CONTENT)
            .await?
            .filter(|content| !content.text.trim().is_empty());
        let Some(content) = content else {
            return Ok(IndexOutcome::Skipped {
                reason: "no extracted text".into(),
            });
        };

        let health = self.engine.health().await;
        if !health.is_healthy() {
            return Err(PipelineError::IndexUnavailable(
                health
                    .detail
                    .unwrap_or_else(|| "search index does not exist".into()),
            ));
        }

        let mut status = self.status_of(file_id).await?;
        status.status = IndexStatus::Indexing;
        status.updated_at = Utc::now();
        self.repo.upsert_index_status(status.clone()).await?;

        let document = SearchDocument::new(&file, content.text);
        match timeout(self.request_timeout, self.engine.upsert(&document)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(PipelineError::IndexUnavailable(format!(
                    "index request exceeded {:?}",
                    self.request_timeout
                )))
            }
        }

        let now = Utc::now();
        status.status = IndexStatus::Indexed;
        status.last_indexed_at = Some(now);
        status.retry_count = 0;
        status.last_error = None;
        status.updated_at = now;
        self.repo.upsert_index_status(status).await?;
        info!(%file_id, "file indexed");
        Ok(IndexOutcome::Indexed)
    }

    async fn status_of(&self, file_id: Uuid) -> RepositoryResult<SearchIndexStatus> {
        Ok(self
            .repo
            .get_index_status(file_id)
            .await?
            .unwrap_or_else(|| SearchIndexStatus::new(file_id)))
    }

    async fn record_failure(&self, file_id: Uuid, message: &str) -> i32 {
        let mut status = match self.status_of(file_id).await {
            Ok(status) => status,
            Err(err) => {
                error!(%file_id, error = %err, "could not load index status");
                return 0;
            }
        };
        status.status = IndexStatus::IndexFailed;
        status.retry_count += 1;
        status.last_error = Some(message.to_string());
        status.updated_at = Utc::now();
        let retry_count = status.retry_count;
        if let Err(err) = self.repo.upsert_index_status(status).await {
            error!(%file_id, error = %err, "could not record index failure");
        }
        retry_count
    }

    pub async fn remove_from_index(&self, file_id: Uuid) -> PipelineResult<()> {
        match timeout(self.request_timeout, self.engine.delete(file_id)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(PipelineError::IndexUnavailable(format!(
                    "delete request exceeded {:?}",
                    self.request_timeout
                )))
            }
        }

        if let Some(mut status) = self.repo.get_index_status(file_id).await? {
            status.status = IndexStatus::NotIndexed;
            status.last_indexed_at = None;
            status.last_error = None;
            status.updated_at = Utc::now();
            self.repo.upsert_index_status(status).await?;
        }
        info!(%file_id, "file removed from index");
        Ok(())
    }

    /// Indexes every active file of the organization that is not indexed
    /// yet, page by page. Safe to run again after an interruption.
    pub async fn bulk_index(
        &self,
        organization_id: Uuid,
        batch_size: i64,
    ) -> PipelineResult<BulkIndexReport> {
        let health = self.engine.health().await;
        if !health.is_healthy() {
            return Err(PipelineError::IndexUnavailable(
                health.detail.unwrap_or_else(|| "search index does not exist".into()),
            ));
        }

        let batch_size = batch_size.max(1);
        let mut report = BulkIndexReport::default();
        let mut after = None;
        loop {
            let page = self
                .repo
                .list_files_page(organization_id, after, batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id);

            for file in &page {
                report.examined += 1;
                let current = self.repo.get_index_status(file.id).await?;
                if current.is_some_and(|status| status.status == IndexStatus::Indexed) {
                    report.already_indexed += 1;
                    continue;
                }
                match self.index_file(file.id).await {
                    IndexOutcome::Indexed => report.indexed += 1,
                    IndexOutcome::Skipped { .. } | IndexOutcome::Removed => report.skipped += 1,
                    IndexOutcome::Failed { .. } => report.failed += 1,
                }
            }

            if (page.len() as i64) < batch_size {
                break;
            }
        }

        info!(%organization_id, ?report, "bulk indexing finished");
        Ok(report)
    }

    pub async fn reindex_organization(
        &self,
        organization_id: Uuid,
        batch_size: i64,
    ) -> PipelineResult<BulkIndexReport> {
        let reset = self.repo.reset_index_statuses(organization_id).await?;
        info!(%organization_id, reset, "index statuses reset for reindex");
        self.bulk_index(organization_id, batch_size).await
    }

    /// Engine reachability and index existence; touches no file data.
    pub async fn health_check(&self) -> EngineHealth {
        self.engine.health().await
    }
}
