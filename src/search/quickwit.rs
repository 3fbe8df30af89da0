use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use super::{EngineHealth, SearchDocument, SearchEngine, SearchError};

/// Quickwit over its REST API. Documents are ingested as NDJSON with
/// `commit=force`, after a delete task for the same `file_id`.
pub struct QuickwitEngine {
    client: Client,
    endpoint: String,
    index: String,
}

impl QuickwitEngine {
    pub fn new(endpoint: &str, index: &str, request_timeout: Duration) -> Result<Self, SearchError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| SearchError::Request(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            index: index.to_string(),
        })
    }

    fn index_url(&self) -> String {
        format!("{}/api/v1/indexes/{}", self.endpoint, self.index)
    }

    fn ingest_url(&self) -> String {
        format!("{}/api/v1/{}/ingest?commit=force", self.endpoint, self.index)
    }

    fn delete_url(&self) -> String {
        format!("{}/api/v1/{}/delete-tasks", self.endpoint, self.index)
    }
}

fn ingest_line(document: &SearchDocument) -> Result<String, SearchError> {
    let mut value = serde_json::to_value(document).map_err(|err| SearchError::Request(err.to_string()))?;
    // the index uses the raw tokenizer on these fields
    value["title"] = json!(document.title.to_lowercase());
    value["text"] = json!(document.text.to_lowercase());
    let mut line = serde_json::to_string(&value).map_err(|err| SearchError::Request(err.to_string()))?;
    line.push('\n');
    Ok(line)
}

async fn check(response: reqwest::Response) -> Result<(), SearchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(SearchError::Unavailable(format!("status {status}: {body}")))
    } else {
        Err(SearchError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

fn request_error(err: reqwest::Error) -> SearchError {
    if err.is_connect() || err.is_timeout() {
        SearchError::Unavailable(err.to_string())
    } else {
        SearchError::Request(err.to_string())
    }
}

#[async_trait]
impl SearchEngine for QuickwitEngine {
    async fn health(&self) -> EngineHealth {
        match self.client.get(self.index_url()).send().await {
            Ok(response) if response.status().is_success() => EngineHealth::healthy(),
            Ok(response) if response.status() == StatusCode::NOT_FOUND => EngineHealth {
                reachable: true,
                index_exists: false,
                detail: Some(format!("index {} does not exist", self.index)),
            },
            Ok(response) => EngineHealth {
                reachable: true,
                index_exists: false,
                detail: Some(format!("index lookup returned {}", response.status())),
            },
            Err(err) => {
                warn!(error = %err, "quickwit health check failed");
                EngineHealth::unavailable(err.to_string())
            }
        }
    }

    async fn upsert(&self, document: &SearchDocument) -> Result<(), SearchError> {
        let body = ingest_line(document)?;
        self.delete(document.file_id).await?;
        let response = self
            .client
            .post(self.ingest_url())
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(request_error)?;
        check(response).await
    }

    async fn delete(&self, file_id: Uuid) -> Result<(), SearchError> {
        let response = self
            .client
            .post(self.delete_url())
            .json(&json!({ "query": format!("file_id:{file_id}") }))
            .send()
            .await
            .map_err(request_error)?;
        check(response).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::{FileType, Visibility};

    #[test]
    fn builds_urls_without_double_slashes() {
        let engine =
            QuickwitEngine::new("http://quickwit:7280/", "documents", Duration::from_secs(5))
                .unwrap();
        assert_eq!(engine.index_url(), "http://quickwit:7280/api/v1/indexes/documents");
        assert_eq!(
            engine.ingest_url(),
            "http://quickwit:7280/api/v1/documents/ingest?commit=force"
        );
        assert_eq!(
            engine.delete_url(),
            "http://quickwit:7280/api/v1/documents/delete-tasks"
        );
    }

    #[test]
    fn ingest_line_is_single_lowercased_ndjson_record() {
        let document = SearchDocument {
            file_id: Uuid::nil(),
            organization_id: Uuid::nil(),
            folder_id: None,
            title: "Annual Report".into(),
            original_name: "Annual Report.pdf".into(),
            mime_type: "application/pdf".into(),
            file_type: FileType::Pdf,
            department: None,
            tags: vec!["finance".into()],
            visibility: Visibility::Organization,
            text: "Revenue\nGrew".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let line = ingest_line(&document).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed["title"], "annual report");
        assert_eq!(parsed["text"], "revenue\ngrew");
        assert_eq!(parsed["original_name"], "Annual Report.pdf");
        assert_eq!(parsed["file_type"], "pdf");
    }
}
