use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use url::Url;

use crate::db::DEFAULT_MAX_POOL_SIZE;
use crate::models::{StorageBackendKind, StoragePolicy};

/// Worker pool and recovery sweep tuning.
#[derive(Clone, Debug)]
pub struct QueueSettings {
    pub poll_interval: Duration,
    pub extraction_workers: usize,
    pub index_workers: usize,
    pub storage_workers: usize,
    pub downstream_workers: usize,
    pub max_attempts: i32,
    pub retry_delay: Duration,
    pub recovery_interval: Duration,
    pub stale_after: Duration,
    pub recovery_batch_size: i64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2_000),
            extraction_workers: 2,
            index_workers: 1,
            storage_workers: 1,
            downstream_workers: 1,
            max_attempts: 5,
            retry_delay: Duration::from_secs(30),
            recovery_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(15 * 60),
            recovery_batch_size: 100,
        }
    }
}

/// Behaviour of the ingestion components themselves.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub default_storage_policy: StoragePolicy,
    pub default_primary_backend: StorageBackendKind,
    pub extraction_max_retries: i32,
    pub index_max_retries: i32,
    pub extraction_timeout_factor: u32,
    pub extraction_timeout_floor: Duration,
    pub inline_max_bytes: u64,
    pub inline_min_priority: i32,
    pub index_timeout: Duration,
    pub sync_timeout: Duration,
    pub downstream_timeout: Duration,
    pub bulk_index_batch_size: i64,
    pub presign_ttl: Duration,
    pub file_lock_ttl: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            default_storage_policy: StoragePolicy::ObjectStore,
            default_primary_backend: StorageBackendKind::ObjectStore,
            extraction_max_retries: 3,
            index_max_retries: 5,
            extraction_timeout_factor: 4,
            extraction_timeout_floor: Duration::from_secs(10),
            inline_max_bytes: 2 * 1_048_576,
            inline_min_priority: 5,
            index_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(30 * 60),
            downstream_timeout: Duration::from_secs(120),
            bulk_index_batch_size: 100,
            presign_ttl: Duration::from_secs(15 * 60),
            file_lock_ttl: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub server_host: String,
    pub server_port: u16,
    pub cors_allowed_origin: Option<String>,
    pub aws_endpoint_url: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: String,
    pub s3_bucket: Option<String>,
    pub local_storage_root: Option<PathBuf>,
    pub local_storage_public_path: String,
    pub quickwit_endpoint: Option<String>,
    pub quickwit_index: String,
    pub downstream_endpoint: Option<String>,
    pub embedded_workers: bool,
    pub queue: QueueSettings,
    pub pipeline: PipelineSettings,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_pool_size = lookup("DATABASE_MAX_POOL_SIZE")
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let server_host = lookup("SERVER_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let server_port = parse_or(&lookup, "SERVER_PORT", 3000u16)?;
        let cors_allowed_origin = lookup("CORS_ALLOWED_ORIGIN");
        let aws_endpoint_url = lookup("AWS_ENDPOINT_URL");
        let aws_access_key_id = lookup("AWS_ACCESS_KEY_ID");
        let aws_secret_access_key = lookup("AWS_SECRET_ACCESS_KEY");
        let aws_region = lookup("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string());
        let s3_bucket = lookup("S3_BUCKET").filter(|value| !value.is_empty());
        let local_storage_root = lookup("LOCAL_STORAGE_ROOT")
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        let local_storage_public_path =
            lookup("LOCAL_STORAGE_PUBLIC_PATH").unwrap_or_else(|| "/storage".to_string());
        let quickwit_endpoint = lookup("QUICKWIT_ENDPOINT").filter(|value| !value.is_empty());
        let quickwit_index = lookup("QUICKWIT_INDEX").unwrap_or_else(|| "documents".to_string());
        let downstream_endpoint = lookup("DOWNSTREAM_ENDPOINT").filter(|value| !value.is_empty());
        let embedded_workers = lookup("EMBEDDED_WORKERS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let queue_defaults = QueueSettings::default();
        let queue = QueueSettings {
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "WORKER_POLL_INTERVAL_MS",
                queue_defaults.poll_interval.as_millis() as u64,
            )?),
            extraction_workers: parse_or(
                &lookup,
                "EXTRACTION_WORKERS",
                queue_defaults.extraction_workers,
            )?,
            index_workers: parse_or(&lookup, "INDEX_WORKERS", queue_defaults.index_workers)?,
            storage_workers: parse_or(&lookup, "STORAGE_WORKERS", queue_defaults.storage_workers)?,
            downstream_workers: parse_or(
                &lookup,
                "DOWNSTREAM_WORKERS",
                queue_defaults.downstream_workers,
            )?,
            max_attempts: parse_or(&lookup, "JOB_MAX_ATTEMPTS", queue_defaults.max_attempts)?,
            recovery_interval: Duration::from_secs(parse_or(
                &lookup,
                "RECOVERY_INTERVAL_SECS",
                queue_defaults.recovery_interval.as_secs(),
            )?),
            stale_after: Duration::from_secs(parse_or(
                &lookup,
                "STALE_JOB_SECS",
                queue_defaults.stale_after.as_secs(),
            )?),
            ..queue_defaults
        };

        let pipeline_defaults = PipelineSettings::default();
        let pipeline = PipelineSettings {
            default_storage_policy: parse_or(
                &lookup,
                "DEFAULT_STORAGE_POLICY",
                pipeline_defaults.default_storage_policy,
            )?,
            default_primary_backend: parse_or(
                &lookup,
                "DEFAULT_PRIMARY_BACKEND",
                pipeline_defaults.default_primary_backend,
            )?,
            extraction_max_retries: parse_or(
                &lookup,
                "EXTRACTION_MAX_RETRIES",
                pipeline_defaults.extraction_max_retries,
            )?,
            index_max_retries: parse_or(
                &lookup,
                "INDEX_MAX_RETRIES",
                pipeline_defaults.index_max_retries,
            )?,
            extraction_timeout_factor: parse_or(
                &lookup,
                "EXTRACTION_TIMEOUT_FACTOR",
                pipeline_defaults.extraction_timeout_factor,
            )?,
            inline_max_bytes: parse_or(
                &lookup,
                "INLINE_MAX_BYTES",
                pipeline_defaults.inline_max_bytes,
            )?,
            inline_min_priority: parse_or(
                &lookup,
                "INLINE_MIN_PRIORITY",
                pipeline_defaults.inline_min_priority,
            )?,
            ..pipeline_defaults
        };

        Ok(Self {
            database_url,
            database_max_pool_size,
            server_host,
            server_port,
            cors_allowed_origin,
            aws_endpoint_url,
            aws_access_key_id,
            aws_secret_access_key,
            aws_region,
            s3_bucket,
            local_storage_root,
            local_storage_public_path,
            quickwit_endpoint,
            quickwit_index,
            downstream_endpoint,
            embedded_workers,
            queue,
            pipeline,
        })
    }

    pub fn redacted_database_url(&self) -> String {
        redact_database_url(&self.database_url)
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} has an invalid value `{raw}`")),
        _ => Ok(default),
    }
}

fn redact_database_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            let _ = parsed.set_password(Some("*****"));
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
