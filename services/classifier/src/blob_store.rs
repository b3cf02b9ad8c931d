use crate::config::S3Config;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::MetadataDirective;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

/// Key-value metadata attached to a stored object
pub type BlobMetadataMap = BTreeMap<String, String>;

/// Location of an object: container (bucket) plus blob name (key)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobRef {
    pub container: String,
    pub name: String,
}

impl BlobRef {
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
        }
    }

    /// Last path segment of the blob name
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}

/// Content and metadata of a downloaded object
#[derive(Debug, Clone)]
pub struct Blob {
    pub content: Bytes,
    pub content_type: Option<String>,
    pub metadata: BlobMetadataMap,
}

#[derive(Error, Debug)]
pub enum BlobAccessError {
    #[error("blob {blob} does not exist")]
    NotFound { blob: BlobRef },

    #[error("{operation} on {blob} did not finish within {budget:?}")]
    Timeout {
        operation: &'static str,
        blob: BlobRef,
        budget: Duration,
    },

    #[error("{operation} on {blob} failed: {detail}")]
    Backend {
        operation: &'static str,
        blob: BlobRef,
        detail: String,
    },
}

impl BlobAccessError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobAccessError::NotFound { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BlobAccessError::NotFound { .. } => "not_found",
            BlobAccessError::Timeout { .. } => "timeout",
            BlobAccessError::Backend { .. } => "backend_error",
        }
    }
}

/// Blob storage operations the pipeline needs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Download an object together with its metadata
    async fn get_blob(&self, blob: &BlobRef) -> Result<Blob, BlobAccessError>;

    /// Read only the metadata of an object
    async fn get_metadata(&self, blob: &BlobRef) -> Result<BlobMetadataMap, BlobAccessError>;

    /// Create or overwrite an object
    async fn put_blob(
        &self,
        blob: &BlobRef,
        content: Bytes,
        content_type: &str,
        metadata: BlobMetadataMap,
    ) -> Result<(), BlobAccessError>;

    /// Replace the whole metadata map of an object in one call
    async fn set_metadata(
        &self,
        blob: &BlobRef,
        metadata: BlobMetadataMap,
    ) -> Result<(), BlobAccessError>;

    /// Public URL of an object
    fn url(&self, blob: &BlobRef) -> String;

    /// Public URL of a container, with a trailing slash
    fn container_url(&self, container: &str) -> String;
}

/// Applies the blob operation budget to every call of the wrapped store
#[derive(Clone)]
pub struct BoundedBlobStore {
    inner: Arc<dyn BlobStore>,
    budget: Duration,
}

impl BoundedBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>, budget: Duration) -> Self {
        Self { inner, budget }
    }

    async fn bounded<T, F>(
        &self,
        operation: &'static str,
        blob: &BlobRef,
        call: F,
    ) -> Result<T, BlobAccessError>
    where
        F: Future<Output = Result<T, BlobAccessError>>,
    {
        tokio::time::timeout(self.budget, call)
            .await
            .unwrap_or_else(|_| {
                Err(BlobAccessError::Timeout {
                    operation,
                    blob: blob.clone(),
                    budget: self.budget,
                })
            })
    }

    pub async fn get_blob(&self, blob: &BlobRef) -> Result<Blob, BlobAccessError> {
        self.bounded("get_blob", blob, self.inner.get_blob(blob)).await
    }

    pub async fn get_metadata(&self, blob: &BlobRef) -> Result<BlobMetadataMap, BlobAccessError> {
        self.bounded("get_metadata", blob, self.inner.get_metadata(blob))
            .await
    }

    pub async fn put_blob(
        &self,
        blob: &BlobRef,
        content: Bytes,
        content_type: &str,
        metadata: BlobMetadataMap,
    ) -> Result<(), BlobAccessError> {
        self.bounded(
            "put_blob",
            blob,
            self.inner.put_blob(blob, content, content_type, metadata),
        )
        .await
    }

    pub async fn set_metadata(
        &self,
        blob: &BlobRef,
        metadata: BlobMetadataMap,
    ) -> Result<(), BlobAccessError> {
        self.bounded("set_metadata", blob, self.inner.set_metadata(blob, metadata))
            .await
    }

    pub fn url(&self, blob: &BlobRef) -> String {
        self.inner.url(blob)
    }

    pub fn container_url(&self, container: &str) -> String {
        self.inner.container_url(container)
    }
}

/// S3-backed blob store; containers map to buckets
pub struct S3BlobStore {
    client: S3Client,
    region: String,
    endpoint_url: Option<String>,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
        })
    }

    fn backend_error<E: fmt::Display>(
        operation: &'static str,
        blob: &BlobRef,
        err: E,
    ) -> BlobAccessError {
        error!(error = %err, blob = %blob, operation, "S3 operation failed");
        BlobAccessError::Backend {
            operation,
            blob: blob.clone(),
            detail: err.to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self), fields(blob = %blob))]
    async fn get_blob(&self, blob: &BlobRef) -> Result<Blob, BlobAccessError> {
        let start = Instant::now();

        let output = self
            .client
            .get_object()
            .bucket(&blob.container)
            .key(&blob.name)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(service_err) if service_err.err().is_no_such_key() => {
                    BlobAccessError::NotFound { blob: blob.clone() }
                }
                _ => Self::backend_error("get_blob", blob, &e),
            })?;

        let content_type = output.content_type().map(str::to_string);
        let metadata = into_metadata_map(output.metadata());

        let content = output
            .body
            .collect()
            .await
            .map_err(|e| Self::backend_error("get_blob", blob, e))?
            .into_bytes();

        debug!(
            size_bytes = content.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Blob downloaded"
        );

        Ok(Blob {
            content,
            content_type,
            metadata,
        })
    }

    #[instrument(skip(self), fields(blob = %blob))]
    async fn get_metadata(&self, blob: &BlobRef) -> Result<BlobMetadataMap, BlobAccessError> {
        let output = self
            .client
            .head_object()
            .bucket(&blob.container)
            .key(&blob.name)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(service_err) if service_err.err().is_not_found() => {
                    BlobAccessError::NotFound { blob: blob.clone() }
                }
                _ => Self::backend_error("get_metadata", blob, &e),
            })?;

        Ok(into_metadata_map(output.metadata()))
    }

    #[instrument(skip(self, content, metadata), fields(blob = %blob, size_bytes = content.len()))]
    async fn put_blob(
        &self,
        blob: &BlobRef,
        content: Bytes,
        content_type: &str,
        metadata: BlobMetadataMap,
    ) -> Result<(), BlobAccessError> {
        let size = content.len();

        self.client
            .put_object()
            .bucket(&blob.container)
            .key(&blob.name)
            .body(ByteStream::from(content))
            .content_type(content_type)
            .set_metadata(Some(metadata.into_iter().collect()))
            .send()
            .await
            .map_err(|e| Self::backend_error("put_blob", blob, e))?;

        info!(size_bytes = size, "Blob uploaded");
        Ok(())
    }

    /// S3 cannot edit metadata in place; an object copied onto itself with
    /// the REPLACE directive swaps the whole map atomically.
    #[instrument(skip(self, metadata), fields(blob = %blob))]
    async fn set_metadata(
        &self,
        blob: &BlobRef,
        metadata: BlobMetadataMap,
    ) -> Result<(), BlobAccessError> {
        // REPLACE drops the content type unless it is sent again
        let head = self
            .client
            .head_object()
            .bucket(&blob.container)
            .key(&blob.name)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(service_err) if service_err.err().is_not_found() => {
                    BlobAccessError::NotFound { blob: blob.clone() }
                }
                _ => Self::backend_error("set_metadata", blob, &e),
            })?;

        // URL-encode the copy source per AWS S3 API requirements
        let copy_source = format!("{}/{}", blob.container, urlencoding::encode(&blob.name));

        self.client
            .copy_object()
            .bucket(&blob.container)
            .key(&blob.name)
            .copy_source(copy_source)
            .metadata_directive(MetadataDirective::Replace)
            .set_content_type(head.content_type().map(str::to_string))
            .set_metadata(Some(metadata.into_iter().collect()))
            .send()
            .await
            .map_err(|e| Self::backend_error("set_metadata", blob, e))?;

        debug!("Blob metadata replaced");
        Ok(())
    }

    fn url(&self, blob: &BlobRef) -> String {
        format!("{}{}", self.container_url(&blob.container), blob.name)
    }

    fn container_url(&self, container: &str) -> String {
        match self.endpoint_url {
            Some(ref endpoint) => format!("{}/{}/", endpoint.trim_end_matches('/'), container),
            None => format!("https://{}.s3.{}.amazonaws.com/", container, self.region),
        }
    }
}

fn into_metadata_map(metadata: Option<&HashMap<String, String>>) -> BlobMetadataMap {
    metadata
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}
