//! Hand-off to the AI layer that produces summaries and tags. Only the job
//! interface lives here; the generation itself is a remote service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Dispatcher, JobExecution};
use crate::{
    error::{PipelineError, PipelineResult},
    models::{FileRecord, FULL_TEXT_CONTENT},
    queue::DownstreamTask,
};

#[async_trait]
pub trait DownstreamProcessor: Send + Sync + 'static {
    async fn process(&self, task: DownstreamTask, file: &FileRecord, text: &str) -> PipelineResult<()>;
}

#[derive(Serialize)]
struct DownstreamRequest<'a> {
    task: DownstreamTask,
    file_id: Uuid,
    organization_id: Uuid,
    title: &'a str,
    mime_type: &'a str,
    text: &'a str,
}

/// Posts each task as JSON to a single endpoint.
pub struct HttpDownstreamProcessor {
    client: Client,
    endpoint: String,
}

impl HttpDownstreamProcessor {
    pub fn new(endpoint: &str, request_timeout: Duration) -> PipelineResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| PipelineError::Configuration(format!("downstream client: {err}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl DownstreamProcessor for HttpDownstreamProcessor {
    async fn process(&self, task: DownstreamTask, file: &FileRecord, text: &str) -> PipelineResult<()> {
        let request = DownstreamRequest {
            task,
            file_id: file.id,
            organization_id: file.organization_id,
            title: &file.title,
            mime_type: &file.mime_type,
            text,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| PipelineError::TransientIo(format!("downstream request: {err}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status.as_u16() == 429 {
            Err(PipelineError::TransientIo(format!(
                "downstream returned {status}: {body}"
            )))
        } else {
            Err(PipelineError::Configuration(format!(
                "downstream rejected {task} for file {}: {status} {body}",
                file.id
            )))
        }
    }
}

impl Dispatcher {
    pub(super) async fn run_downstream(&self, file_id: Uuid, task: DownstreamTask) -> JobExecution {
        let Some(processor) = self.downstream.clone() else {
            warn!(%file_id, %task, "no downstream processor configured; skipping");
            return JobExecution::Success;
        };

        let file = match self.repo.get_file(file_id).await {
            Ok(Some(file)) if file.is_searchable() => file,
            Ok(_) => {
                info!(%file_id, %task, "file deleted; downstream task dropped");
                return JobExecution::Success;
            }
            Err(err) => return self.failure(&PipelineError::from(err)),
        };

        let content = match self.repo.get_extracted_text(file_id, FULL_TEXT_CONTENT).await {
            Ok(Some(content)) if !content.text.trim().is_empty() => content,
            Ok(_) => {
                info!(%file_id, %task, "no extracted text; downstream task dropped");
                return JobExecution::Success;
            }
            Err(err) => return self.failure(&PipelineError::from(err)),
        };

        let limit = self.settings.downstream_timeout;
        match self
            .bounded("downstream", limit, processor.process(task, &file, &content.text))
            .await
        {
            Ok(Ok(())) => {
                info!(%file_id, %task, "downstream task delivered");
                JobExecution::Success
            }
            Ok(Err(err)) => self.failure(&err),
            Err(execution) => execution,
        }
    }
}
