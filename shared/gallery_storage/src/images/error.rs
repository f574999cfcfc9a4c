//! Error types for image storage operations

use thiserror::Error;

/// Result type for image storage operations
pub type ImageStoreResult<T> = Result<T, ImageStoreError>;

/// Errors that can occur during image storage operations
#[derive(Error, Debug)]
pub enum ImageStoreError {
    /// Image row does not exist
    #[error("Image not found: {0}")]
    NotFound(String),

    /// Image row already exists
    #[error("Image already exists: {0}")]
    AlreadyExists(String),

    /// Database query or connection failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failure
    #[error("Migration error: {0}")]
    Migration(String),
}

impl ImageStoreError {
    /// Whether retrying the same call later may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}
