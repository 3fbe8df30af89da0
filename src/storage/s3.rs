use std::time::Duration;

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;

use super::{StorageError, StorageProvider, StorageResult};
use crate::config::AppConfig;
use crate::models::StorageBackendKind;

const STORAGE_CLASS: &str = "STANDARD";

pub struct S3Storage {
    client: S3Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Builds the object-store backend when `S3_BUCKET` is configured.
    pub async fn from_config(config: &AppConfig) -> Option<Self> {
        let bucket = config.s3_bucket.clone()?;
        let client = build_client(config).await;
        Some(Self::new(client, bucket))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

async fn build_client(config: &AppConfig) -> S3Client {
    let region = Region::new(config.aws_region.clone());
    let region_provider = RegionProviderChain::first_try(Some(region))
        .or_default_provider()
        .or_else("us-east-1");

    #[allow(deprecated)]
    let mut loader = aws_config::from_env().region(region_provider);

    if let Some(endpoint) = &config.aws_endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }

    if let (Some(access_key), Some(secret_key)) = (
        config.aws_access_key_id.clone(),
        config.aws_secret_access_key.clone(),
    ) {
        let credentials = Credentials::new(access_key, secret_key, None, None, "static");
        loader = loader.credentials_provider(credentials);
    }

    let base_config = loader.load().await;
    let s3_config = S3ConfigBuilder::from(&base_config)
        .force_path_style(true)
        .build();

    S3Client::from_conf(s3_config)
}

#[async_trait]
impl StorageProvider for S3Storage {
    fn kind(&self) -> StorageBackendKind {
        StorageBackendKind::ObjectStore
    }

    fn storage_class(&self) -> &str {
        STORAGE_CLASS
    }

    async fn write(
        &self,
        destination_hint: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
        content_disposition: Option<String>,
    ) -> StorageResult<String> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(destination_hint)
            .body(ByteStream::from(bytes));

        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }

        if let Some(content_disposition) = content_disposition {
            request = request.content_disposition(content_disposition);
        }

        request.send().await.map_err(|err| {
            StorageError::Transient(format!(
                "failed to upload object to S3: {}",
                err.into_service_error()
            ))
        })?;

        Ok(destination_hint.to_string())
    }

    async fn read(&self, locator: &str) -> StorageResult<Vec<u8>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(locator)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_no_such_key() {
                    return Err(StorageError::NotFound(locator.to_string()));
                }
                return Err(StorageError::Transient(format!(
                    "failed to download object from S3: {service_error}"
                )));
            }
        };

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|err| StorageError::Transient(format!("failed to read object stream: {err}")))?
            .into_bytes()
            .to_vec();

        Ok(bytes)
    }

    async fn delete(&self, locator: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(locator)
            .send()
            .await
            .map_err(|err| {
                StorageError::Transient(format!(
                    "failed to delete object from S3: {}",
                    err.into_service_error()
                ))
            })?;
        Ok(())
    }

    async fn exists(&self, locator: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(locator)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(StorageError::Transient(format!(
                        "failed to inspect object in S3: {service_error}"
                    )))
                }
            }
        }
    }

    async fn presign(&self, locator: &str, ttl: Duration) -> StorageResult<String> {
        let presign_config = PresigningConfig::builder()
            .expires_in(ttl)
            .build()
            .map_err(|err| {
                StorageError::Transient(format!("failed to build S3 presigning config: {err}"))
            })?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(locator)
            .presigned(presign_config)
            .await
            .map_err(|err| {
                StorageError::Transient(format!("failed to generate presigned download URL: {err}"))
            })?;

        Ok(presigned.uri().to_string())
    }
}
