//! Image metadata storage
//!
//! The `images` table holds one row per uploaded asset together with its
//! persisted like count. Callers talk to it through [`ImageStore`] so the
//! counter cache and worker pools can be exercised against in-memory fakes.

mod error;
mod postgres;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub use error::{ImageStoreError, ImageStoreResult};
pub use postgres::PostgresImageStore;
pub use sqlx::Error as SqlxError;

/// Columns a listing may be ordered by
///
/// Only these columns are ever interpolated into the `ORDER BY` clause.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SortKey {
    /// Most liked first
    #[default]
    LikedCount,
    /// Most recently uploaded first
    CreatedAt,
}

impl SortKey {
    /// Parses a requested sort key, falling back to [`SortKey::LikedCount`]
    /// for anything outside the allow-list
    #[must_use]
    pub fn parse_or_default(requested: Option<&str>) -> Self {
        requested
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or_default()
    }

    /// Column name used in the `ORDER BY` clause
    #[must_use]
    pub const fn column(self) -> &'static str {
        match self {
            Self::LikedCount => "liked_count",
            Self::CreatedAt => "created_at",
        }
    }
}

/// Row inserted once an asset has been uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImage {
    /// Asset identifier issued by the asset store (Primary Key)
    pub asset_id: String,
    /// Free-form label of the uploader
    pub uploaded_by: String,
    /// Original file name
    pub file_name: String,
    /// Link to the full-size content
    pub download_url: String,
    /// Preview link, empty when the preview was not ready in time
    pub preview_link: String,
}

/// Listing row as returned to API clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, sqlx::FromRow)]
pub struct ImageSummary {
    /// Asset identifier
    pub id: String,
    /// Original file name
    pub name: String,
    /// Preview image URL
    pub thumbnail: String,
    /// Download URL
    pub download_url: String,
    /// Persisted like count
    pub liked_count: i64,
}

/// A page of approved images
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Zero-based page number
    pub page_number: u32,
    /// Rows per page, must be non-zero
    pub page_size: u32,
    /// Descending sort column
    pub sort_key: SortKey,
}

impl PageRequest {
    /// Row offset of the first row on this page
    #[must_use]
    pub fn offset(&self) -> i64 {
        i64::from(self.page_number) * i64::from(self.page_size)
    }

    /// Number of pages needed to show `total_rows` rows
    #[must_use]
    pub fn total_pages(&self, total_rows: i64) -> i64 {
        let page_size = i64::from(self.page_size.max(1));
        (total_rows.max(0) + page_size - 1) / page_size
    }
}

/// Durable store for image rows and like counts
///
/// # Atomicity
///
/// [`ImageStore::add_liked_count`] must either apply the whole delta or none
/// of it. The like cache re-queues a delta whenever this call fails, so an
/// implementation that can partially apply an increment before returning an
/// error will double count on retry.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Reads the persisted like count of an image
    ///
    /// # Errors
    ///
    /// Returns `ImageStoreError::NotFound` if no such image exists
    async fn liked_count(&self, asset_id: &str) -> ImageStoreResult<i64>;

    /// Atomically adds `delta` to the persisted like count
    ///
    /// # Errors
    ///
    /// Returns `ImageStoreError::NotFound` if no such image exists
    async fn add_liked_count(&self, asset_id: &str, delta: i64) -> ImageStoreResult<()>;

    /// Inserts the metadata row of a freshly uploaded image
    ///
    /// # Errors
    ///
    /// Returns `ImageStoreError::AlreadyExists` on a duplicate asset identifier
    async fn insert(&self, image: &NewImage) -> ImageStoreResult<()>;

    /// Replaces the stored preview link of an image
    ///
    /// # Errors
    ///
    /// Returns `ImageStoreError::NotFound` if no such image exists
    async fn update_preview_link(&self, asset_id: &str, preview_link: &str)
        -> ImageStoreResult<()>;

    /// Reads one page of approved images, ordered descending by the sort key
    ///
    /// # Errors
    ///
    /// Returns `ImageStoreError::Database` if the query fails
    async fn list_approved(&self, page: &PageRequest) -> ImageStoreResult<Vec<ImageSummary>>;

    /// Counts approved images
    ///
    /// # Errors
    ///
    /// Returns `ImageStoreError::Database` if the query fails
    async fn count_approved(&self) -> ImageStoreResult<i64>;
}
