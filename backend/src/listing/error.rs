use gallery_storage::images::ImageStoreError;
use thiserror::Error;

/// Result type for listing operations
pub type ListingResult<T> = Result<T, ListingError>;

#[derive(Error, Debug)]
pub enum ListingError {
    /// Page parameters out of range
    #[error("Invalid page: {0}")]
    InvalidPage(String),

    #[error(transparent)]
    Store(#[from] ImageStoreError),
}
