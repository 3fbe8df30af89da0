use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use doclib::config::AppConfig;
use doclib::extraction::{ExtractionError, ExtractionOutput, TextExtractor};
use doclib::models::{
    ExtractionMethod, OrganizationSettings, StorageBackendKind, StoragePolicy,
};
use doclib::repository::{MemoryRepository, Repository};
use doclib::routes;
use doclib::search::{EngineHealth, SearchDocument, SearchEngine, SearchError};
use doclib::state::{AppState, Components};
use doclib::storage::{StorageError, StorageProvider, StorageProviders, StorageResult};
use http_body_util::BodyExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

#[derive(Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// In-memory backend of either kind with switchable write failures.
pub struct FakeStorage {
    kind: StorageBackendKind,
    objects: Mutex<HashMap<String, StoredObject>>,
    fail_writes: AtomicBool,
    stall_reads: AtomicBool,
    writes: AtomicUsize,
}

impl FakeStorage {
    pub fn new(kind: StorageBackendKind) -> Self {
        Self {
            kind,
            objects: Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
            stall_reads: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Reads never complete while set.
    #[allow(dead_code)]
    pub fn stall_reads(&self, stall: bool) {
        self.stall_reads.store(stall, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub async fn get(&self, locator: &str) -> Option<StoredObject> {
        self.objects.lock().await.get(locator).cloned()
    }

    #[allow(dead_code)]
    pub async fn remove(&self, locator: &str) {
        self.objects.lock().await.remove(locator);
    }

    #[allow(dead_code)]
    pub async fn overwrite(&self, locator: &str, bytes: &[u8]) {
        let mut objects = self.objects.lock().await;
        if let Some(object) = objects.get_mut(locator) {
            object.bytes = bytes.to_vec();
        }
    }

    #[allow(dead_code)]
    pub async fn object_count(&self) -> usize {
        self.objects.lock().await.len()
    }
}

#[async_trait]
impl StorageProvider for FakeStorage {
    fn kind(&self) -> StorageBackendKind {
        self.kind
    }

    fn storage_class(&self) -> &str {
        "fake"
    }

    async fn write(
        &self,
        destination_hint: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
        _content_disposition: Option<String>,
    ) -> StorageResult<String> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Transient(format!(
                "{} backend refused write",
                self.kind
            )));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().await.insert(
            destination_hint.to_string(),
            StoredObject {
                bytes,
                content_type,
            },
        );
        Ok(destination_hint.to_string())
    }

    async fn read(&self, locator: &str) -> StorageResult<Vec<u8>> {
        if self.stall_reads.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.objects
            .lock()
            .await
            .get(locator)
            .map(|object| object.bytes.clone())
            .ok_or_else(|| StorageError::NotFound(locator.to_string()))
    }

    async fn delete(&self, locator: &str) -> StorageResult<()> {
        self.objects.lock().await.remove(locator);
        Ok(())
    }

    async fn exists(&self, locator: &str) -> StorageResult<bool> {
        Ok(self.objects.lock().await.contains_key(locator))
    }

    async fn presign(&self, locator: &str, ttl: Duration) -> StorageResult<String> {
        if !self.exists(locator).await? {
            return Err(StorageError::NotFound(locator.to_string()));
        }
        match self.kind {
            StorageBackendKind::ObjectStore => Ok(format!(
                "https://fake-storage/{locator}?expires_in={}",
                ttl.as_secs()
            )),
            StorageBackendKind::Local => Ok(format!("/storage/{locator}")),
        }
    }
}

/// Search engine keeping one document per file.
pub struct FakeSearchEngine {
    healthy: AtomicBool,
    documents: Mutex<HashMap<Uuid, SearchDocument>>,
    upserts: AtomicUsize,
}

impl FakeSearchEngine {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            documents: Mutex::new(HashMap::new()),
            upserts: AtomicUsize::new(0),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub async fn document(&self, file_id: Uuid) -> Option<SearchDocument> {
        self.documents.lock().await.get(&file_id).cloned()
    }

    #[allow(dead_code)]
    pub async fn document_count(&self) -> usize {
        self.documents.lock().await.len()
    }
}

#[async_trait]
impl SearchEngine for FakeSearchEngine {
    async fn health(&self) -> EngineHealth {
        if self.healthy.load(Ordering::SeqCst) {
            EngineHealth::healthy()
        } else {
            EngineHealth::unavailable("fake engine is down")
        }
    }

    async fn upsert(&self, document: &SearchDocument) -> Result<(), SearchError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(SearchError::Unavailable("fake engine is down".into()));
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.documents
            .lock()
            .await
            .insert(document.file_id, document.clone());
        Ok(())
    }

    async fn delete(&self, file_id: Uuid) -> Result<(), SearchError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(SearchError::Unavailable("fake engine is down".into()));
        }
        self.documents.lock().await.remove(&file_id);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    None,
    Transient,
    Permanent,
    /// Never returns.
    Hang,
}

/// Decodes bytes as UTF-8 regardless of method. Failures can be injected.
pub struct FakeExtractor {
    mode: std::sync::Mutex<FailureMode>,
    calls: AtomicUsize,
    methods: std::sync::Mutex<Vec<ExtractionMethod>>,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self {
            mode: std::sync::Mutex::new(FailureMode::None),
            calls: AtomicUsize::new(0),
            methods: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: FailureMode) {
        *self.mode.lock().unwrap() = mode;
    }

    #[allow(dead_code)]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub fn methods(&self) -> Vec<ExtractionMethod> {
        self.methods.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextExtractor for FakeExtractor {
    async fn extract(
        &self,
        method: ExtractionMethod,
        bytes: Vec<u8>,
        _mime_type: &str,
        _size_hint: u64,
    ) -> Result<ExtractionOutput, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.methods.lock().unwrap().push(method);
        let mode = *self.mode.lock().unwrap();
        match mode {
            FailureMode::Transient => Err(ExtractionError::Failed("tool crashed".into())),
            FailureMode::Permanent => Err(ExtractionError::Corrupt("not a document".into())),
            FailureMode::Hang => {
                std::future::pending::<()>().await;
                Err(ExtractionError::Failed("unreachable".into()))
            }
            FailureMode::None => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                Ok(ExtractionOutput {
                    success: !text.trim().is_empty(),
                    text,
                    metadata: json!({ "source": "fake" }),
                })
            }
        }
    }
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::from_lookup(|name| match name {
        "DATABASE_URL" => Some("postgres://unused@localhost/unused".to_string()),
        _ => None,
    })
    .expect("test configuration");
    config.queue.retry_delay = Duration::ZERO;
    config.queue.poll_interval = Duration::from_millis(20);
    config.queue.recovery_interval = Duration::from_secs(3600);
    config
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    pub repo: Arc<MemoryRepository>,
    pub object_store: Arc<FakeStorage>,
    pub local: Arc<FakeStorage>,
    pub search: Arc<FakeSearchEngine>,
    pub extractor: Arc<FakeExtractor>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let repo = Arc::new(MemoryRepository::new());
        let object_store = Arc::new(FakeStorage::new(StorageBackendKind::ObjectStore));
        let local = Arc::new(FakeStorage::new(StorageBackendKind::Local));
        let search = Arc::new(FakeSearchEngine::new());
        let extractor = Arc::new(FakeExtractor::new());

        let providers = StorageProviders::new()
            .with(object_store.clone())
            .with(local.clone());
        let repo_for_state: Arc<dyn Repository> = repo.clone();
        let components = Components {
            repo: repo_for_state,
            providers,
            extractor: extractor.clone(),
            search: search.clone(),
            downstream: None,
        };
        let state = AppState::new(config, components);
        let router = routes::create_router(state.clone());

        Self {
            state,
            router,
            repo,
            object_store,
            local,
            search,
            extractor,
        }
    }

    #[allow(dead_code)]
    pub async fn set_policy(
        &self,
        organization_id: Uuid,
        storage_policy: StoragePolicy,
        primary_backend: StorageBackendKind,
    ) -> Result<()> {
        self.repo
            .upsert_organization_settings(OrganizationSettings {
                organization_id,
                storage_policy,
                primary_backend,
                quota_bytes: None,
                downstream_enabled: false,
            })
            .await?;
        Ok(())
    }

    #[allow(dead_code)]
    pub fn backend(&self, kind: StorageBackendKind) -> Arc<FakeStorage> {
        match kind {
            StorageBackendKind::ObjectStore => self.object_store.clone(),
            StorageBackendKind::Local => self.local.clone(),
        }
    }

    /// Runs every ready queue entry on the calling task.
    #[allow(dead_code)]
    pub async fn drain(&self) -> Result<usize> {
        Ok(self.state.queue.drain().await?)
    }

    #[allow(dead_code)]
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body))?;
        self.send(request).await
    }

    #[allow(dead_code)]
    pub async fn post_empty(&self, path: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(Body::empty())?;
        self.send(request).await
    }

    #[allow(dead_code)]
    pub async fn get(&self, path: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())?;
        self.send(request).await
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::DELETE)
            .uri(path)
            .body(Body::empty())?;
        self.send(request).await
    }

    #[allow(dead_code)]
    pub async fn upload_file(
        &self,
        organization_id: Uuid,
        filename: &str,
        content_type: &str,
        data: &[u8],
        fields: &[(&str, &str)],
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();
        body.extend(format!("--{boundary}\r\n").as_bytes());
        body.extend(
            format!("Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n")
                .as_bytes(),
        );
        body.extend(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
        body.extend(data);
        body.extend(b"\r\n");

        for (name, value) in fields {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            );
            body.extend(value.as_bytes());
            body.extend(b"\r\n");
        }
        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/api/organizations/{organization_id}/files"))
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))?;
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> Result<hyper::Response<Body>> {
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }
}

#[allow(dead_code)]
pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

#[allow(dead_code)]
pub async fn body_json(body: Body) -> Result<Value> {
    let bytes = body_to_vec(body).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
