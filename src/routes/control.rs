//! Operator endpoints: queue lifecycle, storage sync, reindexing and job
//! resets.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{ExtractionJob, SyncType},
    queue::{JobKind, QueueHealth, RecoveryReport},
    search::EngineHealth,
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct QueueToggleResponse {
    pub changed: bool,
    pub running: bool,
}

pub async fn queue_status(State(state): State<AppState>) -> AppResult<Json<QueueHealth>> {
    Ok(Json(state.queue.health_check().await?))
}

pub async fn start_queue(State(state): State<AppState>) -> Json<QueueToggleResponse> {
    let changed = state.queue.start().await;
    info!(changed, "queue start requested");
    Json(QueueToggleResponse {
        changed,
        running: true,
    })
}

pub async fn stop_queue(State(state): State<AppState>) -> Json<QueueToggleResponse> {
    let changed = state.queue.stop().await;
    info!(changed, "queue stop requested");
    Json(QueueToggleResponse {
        changed,
        running: false,
    })
}

pub async fn recover_jobs(State(state): State<AppState>) -> AppResult<Json<RecoveryReport>> {
    Ok(Json(state.queue.process_pending_database_jobs().await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncRequest {
    pub sync_type: Option<SyncType>,
    pub file_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub sync_job_id: Uuid,
    pub sync_type: SyncType,
}

pub async fn sync_organization(
    State(state): State<AppState>,
    Path(organization_id): Path<Uuid>,
    payload: Option<Json<SyncRequest>>,
) -> AppResult<(StatusCode, Json<SyncResponse>)> {
    let request = payload.map(|Json(body)| body).unwrap_or_default();
    let sync_type = match (request.sync_type, request.file_id) {
        (Some(sync_type), _) => sync_type,
        (None, Some(_)) => SyncType::File,
        (None, None) => SyncType::Incremental,
    };
    if sync_type == SyncType::File && request.file_id.is_none() {
        return Err(AppError::bad_request("file_id is required for a file sync"));
    }

    let sync_job_id = state
        .storage
        .sync_storage(organization_id, sync_type, request.file_id, "api")
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SyncResponse {
            sync_job_id,
            sync_type,
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReindexRequest {
    pub batch_size: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReindexResponse {
    /// False when a reindex of the organization is already waiting.
    pub queued: bool,
    pub batch_size: i64,
}

pub async fn reindex_organization(
    State(state): State<AppState>,
    Path(organization_id): Path<Uuid>,
    payload: Option<Json<ReindexRequest>>,
) -> AppResult<(StatusCode, Json<ReindexResponse>)> {
    let batch_size = payload
        .and_then(|Json(body)| body.batch_size)
        .filter(|size| *size > 0)
        .unwrap_or(state.config.pipeline.bulk_index_batch_size);

    let queued = state
        .enqueuer
        .enqueue_default(JobKind::BulkIndex {
            organization_id,
            batch_size,
            reindex: true,
        })
        .await?
        .is_some();
    info!(%organization_id, batch_size, queued, "reindex requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(ReindexResponse { queued, batch_size }),
    ))
}

pub async fn search_health(State(state): State<AppState>) -> (StatusCode, Json<EngineHealth>) {
    let health = state.indexer.health_check().await;
    let status = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

pub async fn reset_extraction_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<ExtractionJob>> {
    Ok(Json(state.pipeline.retry_extraction(job_id).await?))
}
