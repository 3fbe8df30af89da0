use axum::{
    extract::{Json, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{FileRecord, Visibility},
    pipeline::{FileStatus, UploadOutcome, UploadRequest},
    state::AppState,
    storage::StoreRequest,
};

pub async fn upload_file(
    State(state): State<AppState>,
    Path(organization_id): Path<Uuid>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<UploadOutcome>)> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut original_name: Option<String> = None;
    let mut content_type: Option<String> = None;
    let mut folder_id: Option<Uuid> = None;
    let mut title: Option<String> = None;
    let mut department: Option<String> = None;
    let mut tags: Vec<String> = Vec::new();
    let mut visibility = Visibility::Organization;
    let mut metadata: Value = Value::Object(Default::default());
    let mut force_sync = false;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        let name = field.name().map(|n| n.to_string());
        if name.as_deref() == Some("file") {
            original_name = field.file_name().map(|n| n.to_string());
            content_type = field.content_type().map(|mime| mime.to_string());
            let data = field.bytes().await.map_err(|err| {
                error!(error = %err, "failed to read file bytes");
                AppError::bad_request(format!("failed to read file bytes: {err}"))
            })?;
            file_bytes = Some(data.to_vec());
            continue;
        }

        let Some(name) = name else { continue };
        let value = field
            .text()
            .await
            .map_err(|err| AppError::bad_request(format!("invalid {name} field: {err}")))?;
        let value = value.trim();
        match name.as_str() {
            "folder_id" if !value.is_empty() => {
                folder_id = Some(
                    Uuid::parse_str(value)
                        .map_err(|_| AppError::bad_request("folder_id must be a valid UUID"))?,
                );
            }
            "title" if !value.is_empty() => title = Some(value.to_string()),
            "department" if !value.is_empty() => department = Some(value.to_string()),
            "tags" => {
                tags = value
                    .split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "visibility" if !value.is_empty() => {
                visibility = value
                    .parse()
                    .map_err(|err| AppError::bad_request(format!("{err}")))?;
            }
            "metadata" if !value.is_empty() => {
                metadata = serde_json::from_str(value).map_err(|err| {
                    error!(error = %err, "metadata parse failure");
                    AppError::bad_request(format!("metadata must be valid JSON: {err}"))
                })?;
            }
            "force_sync" => force_sync = value == "1" || value.eq_ignore_ascii_case("true"),
            _ => {}
        }
    }

    let file_bytes = file_bytes.ok_or_else(|| {
        error!("upload rejected: missing file field");
        AppError::bad_request("file field is required")
    })?;
    if file_bytes.is_empty() {
        error!("upload rejected: empty file payload");
        return Err(AppError::bad_request("file field must not be empty"));
    }
    let original_name = original_name
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| {
            error!("upload rejected: missing original filename");
            AppError::bad_request("filename is required")
        })?;
    let mime_type = content_type
        .filter(|mime| !mime.is_empty() && mime != "application/octet-stream")
        .unwrap_or_else(|| {
            mime_guess::from_path(&original_name)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        });

    let mut store = StoreRequest::new(organization_id, original_name, mime_type, file_bytes);
    store.folder_id = folder_id;
    store.title = title;
    store.department = department;
    store.tags = tags;
    store.visibility = visibility;
    store.metadata = metadata;

    let outcome = state
        .pipeline
        .ingest(UploadRequest { store, force_sync })
        .await
        .map_err(|err| {
            error!(%organization_id, error = %err, "file upload failed");
            AppError::from(err)
        })?;
    info!(
        file_id = %outcome.file.id,
        %organization_id,
        processed_inline = outcome.processed_inline,
        "file upload succeeded"
    );
    Ok((StatusCode::CREATED, Json(outcome)))
}

pub async fn delete_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
) -> AppResult<Json<FileRecord>> {
    Ok(Json(state.pipeline.delete_file(file_id).await?))
}

pub async fn file_status(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
) -> AppResult<Json<FileStatus>> {
    Ok(Json(state.pipeline.file_status(file_id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    #[serde(default)]
    pub redirect: bool,
}

#[derive(Debug, Serialize)]
pub struct FileDownloadResponse {
    pub url: String,
    pub expires_in: u64,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
}

/// Signed URL for object-store copies. Copies that only exist on local disk
/// have no signed form and are streamed by this handler.
pub async fn download_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    Query(query): Query<DownloadQuery>,
) -> AppResult<Response> {
    let file = state
        .repo
        .get_file(file_id)
        .await?
        .filter(|file| !file.is_deleted)
        .ok_or_else(AppError::not_found)?;

    let ttl = state.config.pipeline.presign_ttl;
    let url = state.storage.presigned_url(file_id, ttl).await?;

    if !url.starts_with("http://") && !url.starts_with("https://") {
        let bytes = state.storage.read_file(file_id).await?;
        let disposition = format!(
            "attachment; filename=\"{}\"",
            file.original_name.replace(['"', '\\'], "_")
        );
        return Ok((
            [
                (header::CONTENT_TYPE, file.mime_type.clone()),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            bytes,
        )
            .into_response());
    }

    if query.redirect {
        return Ok(Redirect::temporary(&url).into_response());
    }

    Ok(Json(FileDownloadResponse {
        url,
        expires_in: ttl.as_secs(),
        filename: file.original_name,
        content_type: file.mime_type,
        size_bytes: file.size_bytes,
    })
    .into_response())
}
