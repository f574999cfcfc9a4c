use std::time::Duration;

use gallery_storage::images::ImageStoreError;
use thiserror::Error;

use crate::asset_storage::AssetStoreError;

/// Result type for ingestion operations
pub type IngestionResult<T> = Result<T, IngestionError>;

/// Errors reported for an upload task or a batch submission
#[derive(Error, Debug)]
pub enum IngestionError {
    /// The pool no longer accepts tasks
    #[error("Ingestion pool is shut down")]
    PoolClosed,

    /// Asset store rejected the upload
    #[error("Failed to upload {file_name}: {source}")]
    Upload {
        file_name: String,
        #[source]
        source: AssetStoreError,
    },

    /// Asset store did not answer in time
    #[error("Upload of {file_name} timed out after {timeout:?}")]
    UploadTimeout { file_name: String, timeout: Duration },

    /// Polling for the preview link failed
    #[error("Failed to look up preview of {asset_id}: {source}")]
    PreviewLookup {
        asset_id: String,
        #[source]
        source: AssetStoreError,
    },

    /// Download link could not be issued
    #[error("Failed to issue download link for {asset_id}: {source}")]
    Link {
        asset_id: String,
        #[source]
        source: AssetStoreError,
    },

    /// Metadata row could not be written
    #[error("Failed to record image {asset_id}: {source}")]
    Insert {
        asset_id: String,
        #[source]
        source: ImageStoreError,
    },

    /// The worker went away before reporting an outcome
    #[error("Upload task was abandoned before completing")]
    Abandoned,
}
