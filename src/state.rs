use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::{
    config::AppConfig,
    db::PgPool,
    extraction::{LocalExtractor, TextExtractor},
    pipeline::IngestPipeline,
    queue::{Enqueuer, JobQueue},
    repository::{PgRepository, Repository},
    search::{DisabledSearchEngine, QuickwitEngine, SearchEngine, SearchIndexer},
    storage::{HybridStorageManager, LocalStorage, S3Storage, StorageProviders},
    workers::{Dispatcher, DownstreamProcessor, ExtractionRunner, HttpDownstreamProcessor},
};

/// The swappable edges of the pipeline. Deployments build them from
/// configuration; tests hand in fakes.
pub struct Components {
    pub repo: Arc<dyn Repository>,
    pub providers: StorageProviders,
    pub extractor: Arc<dyn TextExtractor>,
    pub search: Arc<dyn SearchEngine>,
    pub downstream: Option<Arc<dyn DownstreamProcessor>>,
}

impl Components {
    /// PostgreSQL, the configured storage backends, Quickwit when an
    /// endpoint is set and the local extraction toolchain.
    pub async fn from_config(config: &AppConfig, pool: PgPool) -> anyhow::Result<Self> {
        let repo: Arc<dyn Repository> = Arc::new(PgRepository::new(pool));

        let mut providers = StorageProviders::new();
        if let Some(s3) = S3Storage::from_config(config).await {
            info!(bucket = %s3.bucket(), "object storage backend configured");
            providers = providers.with(Arc::new(s3));
        }
        if let Some(root) = &config.local_storage_root {
            tokio::fs::create_dir_all(root)
                .await
                .with_context(|| format!("failed to create {}", root.display()))?;
            info!(root = %root.display(), "local storage backend configured");
            providers = providers.with(Arc::new(LocalStorage::new(
                root.clone(),
                config.local_storage_public_path.clone(),
            )));
        }
        if providers.configured().is_empty() {
            anyhow::bail!("no storage backend configured; set S3_BUCKET or LOCAL_STORAGE_ROOT");
        }

        let search: Arc<dyn SearchEngine> = match &config.quickwit_endpoint {
            Some(endpoint) => Arc::new(
                QuickwitEngine::new(
                    endpoint,
                    &config.quickwit_index,
                    config.pipeline.index_timeout,
                )
                .context("failed to build search client")?,
            ),
            None => {
                warn!("QUICKWIT_ENDPOINT not set; search indexing disabled");
                Arc::new(DisabledSearchEngine)
            }
        };

        let downstream = match &config.downstream_endpoint {
            Some(endpoint) => Some(Arc::new(
                HttpDownstreamProcessor::new(endpoint, config.pipeline.downstream_timeout)
                    .context("failed to build downstream client")?,
            ) as Arc<dyn DownstreamProcessor>),
            None => None,
        };

        Ok(Self {
            repo,
            providers,
            extractor: Arc::new(LocalExtractor::new()),
            search,
            downstream,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub repo: Arc<dyn Repository>,
    pub storage: Arc<HybridStorageManager>,
    pub pipeline: Arc<IngestPipeline>,
    pub indexer: Arc<SearchIndexer>,
    pub queue: Arc<JobQueue>,
    pub enqueuer: Enqueuer,
}

impl AppState {
    /// Wires every component around a single shared enqueuer. The queue is
    /// built but not started.
    pub fn new(config: AppConfig, components: Components) -> Self {
        let Components {
            repo,
            providers,
            extractor,
            search,
            downstream,
        } = components;
        let pipeline_settings = config.pipeline.clone();

        let enqueuer = Enqueuer::new(repo.clone(), config.queue.max_attempts);
        let storage = Arc::new(HybridStorageManager::new(
            repo.clone(),
            providers,
            enqueuer.clone(),
            pipeline_settings.clone(),
        ));
        let extraction = Arc::new(ExtractionRunner::new(
            repo.clone(),
            storage.clone(),
            extractor,
            enqueuer.clone(),
            pipeline_settings.clone(),
        ));
        let indexer = Arc::new(SearchIndexer::new(
            repo.clone(),
            search,
            pipeline_settings.index_timeout,
        ));

        let mut dispatcher = Dispatcher::new(
            repo.clone(),
            storage.clone(),
            extraction.clone(),
            indexer.clone(),
            enqueuer.clone(),
            pipeline_settings.clone(),
        )
        .with_retry_delay(config.queue.retry_delay);
        if let Some(processor) = downstream {
            dispatcher = dispatcher.with_downstream(processor);
        }
        let queue = Arc::new(JobQueue::new(
            repo.clone(),
            Arc::new(dispatcher),
            config.queue.clone(),
        ));

        let pipeline = Arc::new(IngestPipeline::new(
            repo.clone(),
            storage.clone(),
            extraction,
            enqueuer.clone(),
            pipeline_settings,
        ));

        Self {
            config: Arc::new(config),
            repo,
            storage,
            pipeline,
            indexer,
            queue,
            enqueuer,
        }
    }

    pub async fn from_config(config: AppConfig, pool: PgPool) -> anyhow::Result<Self> {
        let components = Components::from_config(&config, pool).await?;
        Ok(Self::new(config, components))
    }
}
