use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt::Display;
use thiserror::Error;

use crate::extraction::ExtractionError;
use crate::jobs::TransitionError;
use crate::repository::RepositoryError;
use crate::search::SearchError;
use crate::storage::StorageError;

/// Failure taxonomy shared by the ingestion components.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient I/O error: {0}")]
    TransientIo(String),
    #[error("permanent extraction error: {0}")]
    PermanentExtraction(String),
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("storage drift detected: {0}")]
    Drift(String),
    #[error("search index unavailable: {0}")]
    IndexUnavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Whether the failed operation may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::TransientIo(_) | PipelineError::IndexUnavailable(_) => true,
            PipelineError::Repository(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Short machine-readable code stored next to failed job records.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::TransientIo(_) => "transient_io",
            PipelineError::PermanentExtraction(_) => "permanent_extraction",
            PipelineError::QuotaExceeded(_) => "quota_exceeded",
            PipelineError::Drift(_) => "drift",
            PipelineError::IndexUnavailable(_) => "index_unavailable",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Configuration(_) => "configuration",
            PipelineError::Repository(_) => "repository",
        }
    }
}

impl From<StorageError> for PipelineError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::Transient(message) => PipelineError::TransientIo(message),
            StorageError::NotFound(locator) => {
                PipelineError::NotFound(format!("storage object {locator}"))
            }
            StorageError::QuotaExceeded(message) => PipelineError::QuotaExceeded(message),
        }
    }
}

impl From<ExtractionError> for PipelineError {
    fn from(value: ExtractionError) -> Self {
        if value.is_permanent() {
            PipelineError::PermanentExtraction(value.to_string())
        } else {
            PipelineError::TransientIo(value.to_string())
        }
    }
}

impl From<TransitionError> for PipelineError {
    fn from(value: TransitionError) -> Self {
        PipelineError::Repository(RepositoryError::Conflict(value.to_string()))
    }
}

impl From<SearchError> for PipelineError {
    fn from(value: SearchError) -> Self {
        PipelineError::IndexUnavailable(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "resource not found")
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal<E: Display>(error: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        match value {
            PipelineError::QuotaExceeded(_) => {
                AppError::new(StatusCode::INSUFFICIENT_STORAGE, value.to_string())
            }
            PipelineError::NotFound(_) | PipelineError::Repository(RepositoryError::NotFound(_)) => {
                AppError::not_found()
            }
            PipelineError::Repository(RepositoryError::Conflict(message)) => {
                AppError::conflict(message)
            }
            PipelineError::IndexUnavailable(_) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, value.to_string())
            }
            other => AppError::internal(other),
        }
    }
}

impl From<RepositoryError> for AppError {
    fn from(value: RepositoryError) -> Self {
        AppError::from(PipelineError::from(value))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        AppError::internal(value)
    }
}
