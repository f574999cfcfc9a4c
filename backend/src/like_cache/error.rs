//! Error types for the like cache

use gallery_storage::images::ImageStoreError;
use thiserror::Error;

/// Result type for like cache operations
pub type LikeCacheResult<T> = Result<T, LikeCacheError>;

/// Errors surfaced to callers of the like cache
///
/// Flush failures never show up here; they are retried on the next cycle.
#[derive(Error, Debug)]
pub enum LikeCacheError {
    /// The persisted count of a key not yet cached could not be read
    #[error("Failed to load like count for {key}: {source}")]
    SeedLoad {
        /// Key that missed the cache
        key: String,
        /// Underlying store failure
        #[source]
        source: ImageStoreError,
    },
}
