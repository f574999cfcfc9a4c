//! S3-based asset storage operations
//!
//! An asset identifier is the object key of the uploaded content,
//! `{folder}/{uuid}`. Thumbnails are produced asynchronously by a separate
//! process and appear under `thumbnails/{asset_id}` some time after the
//! upload; until then the preview link of an asset is pending.
//!
//! Every link handed out is a presigned GET URL, so stored links go stale
//! after `presigned_url_expiry_secs` and have to be refreshed.

mod error;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::{
    error::SdkError, operation::head_object::HeadObjectError, presigning::PresigningConfig,
    primitives::ByteStream, Client as S3Client,
};
use axum::body::Bytes;

pub use error::{AssetStoreError, AssetStoreResult};

/// Prefix under which thumbnails are published
const THUMBNAIL_PREFIX: &str = "thumbnails";

/// A file received from a client, waiting to be ingested
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Original file name as sent by the client
    pub file_name: String,
    /// Declared content type, if any
    pub content_type: Option<String>,
    /// File content
    pub bytes: Bytes,
}

/// External object storage used for image content and previews
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Stores the file under `folder` and returns the new asset identifier
    async fn upload(&self, file: &UploadedFile, folder: &str) -> AssetStoreResult<String>;

    /// Returns the preview link, or `None` while the preview is still being generated
    async fn preview_link(&self, asset_id: &str) -> AssetStoreResult<Option<String>>;

    /// Issues a fresh link, preferring the thumbnail and falling back to the content
    async fn refresh_link(&self, asset_id: &str) -> AssetStoreResult<String>;

    /// Returns a link to the full-size content
    async fn download_url(&self, asset_id: &str) -> AssetStoreResult<String>;
}

/// Asset storage client for S3 operations
pub struct S3AssetStore {
    s3_client: Arc<S3Client>,
    bucket_name: String,
    presigned_url_expiry_secs: u64,
}

impl S3AssetStore {
    /// Creates a new asset storage client
    ///
    /// # Arguments
    ///
    /// * `s3_client` - Pre-configured S3 client
    /// * `bucket_name` - S3 bucket name for image storage
    /// * `presigned_url_expiry_secs` - Lifetime of issued links in seconds
    #[must_use]
    pub const fn new(
        s3_client: Arc<S3Client>,
        bucket_name: String,
        presigned_url_expiry_secs: u64,
    ) -> Self {
        Self {
            s3_client,
            bucket_name,
            presigned_url_expiry_secs,
        }
    }

    /// Builds the asset identifier (and content key) for a new upload
    #[must_use]
    pub fn content_key(folder: &str, object_id: &str) -> String {
        let folder = folder.trim_matches('/');
        if folder.is_empty() {
            object_id.to_string()
        } else {
            format!("{folder}/{object_id}")
        }
    }

    #[must_use]
    pub fn thumbnail_key(asset_id: &str) -> String {
        format!("{THUMBNAIL_PREFIX}/{asset_id}")
    }

    /// Checks if an object exists in the bucket
    ///
    /// # Errors
    ///
    /// Returns `AssetStoreError::UpstreamError` for 5xx errors and
    /// `AssetStoreError::S3Error` for other S3 service errors
    pub async fn object_exists(&self, key: &str) -> AssetStoreResult<bool> {
        let result = self
            .s3_client
            .head_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(service_err))
                if matches!(service_err.err(), HeadObjectError::NotFound(_)) =>
            {
                Ok(false)
            }
            Err(e) => Err(AssetStoreError::from(e)),
        }
    }

    async fn presigned_get_url(&self, key: &str) -> AssetStoreResult<String> {
        let presigning_config =
            PresigningConfig::expires_in(Duration::from_secs(self.presigned_url_expiry_secs))
                .map_err(|e| {
                    AssetStoreError::ConfigError(format!(
                        "Failed to create presigning config: {e}"
                    ))
                })?;

        let presigned = self
            .s3_client
            .get_object()
            .bucket(&self.bucket_name)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| {
                AssetStoreError::S3Error(format!("Failed to generate presigned URL: {e}"))
            })?;

        Ok(presigned.uri().to_string())
    }
}

#[async_trait]
impl AssetStore for S3AssetStore {
    async fn upload(&self, file: &UploadedFile, folder: &str) -> AssetStoreResult<String> {
        let asset_id = Self::content_key(folder, &uuid::Uuid::new_v4().simple().to_string());

        self.s3_client
            .put_object()
            .bucket(&self.bucket_name)
            .key(&asset_id)
            .content_type(
                file.content_type
                    .as_deref()
                    .unwrap_or("application/octet-stream"),
            )
            .body(ByteStream::from(file.bytes.clone()))
            .send()
            .await?;

        tracing::debug!(asset_id = %asset_id, file_name = %file.file_name, "Uploaded asset to S3");

        Ok(asset_id)
    }

    async fn preview_link(&self, asset_id: &str) -> AssetStoreResult<Option<String>> {
        let key = Self::thumbnail_key(asset_id);
        if !self.object_exists(&key).await? {
            return Ok(None);
        }

        self.presigned_get_url(&key).await.map(Some)
    }

    async fn refresh_link(&self, asset_id: &str) -> AssetStoreResult<String> {
        if let Some(link) = self.preview_link(asset_id).await? {
            return Ok(link);
        }

        if self.object_exists(asset_id).await? {
            return self.presigned_get_url(asset_id).await;
        }

        Err(AssetStoreError::NoLinkAvailable(asset_id.to_string()))
    }

    async fn download_url(&self, asset_id: &str) -> AssetStoreResult<String> {
        self.presigned_get_url(asset_id).await
    }
}
