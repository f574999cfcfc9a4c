use std::sync::Arc;

use axum::{extract::Multipart, Extension, Json};
use gallery_storage::images::ImageSummary;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use validator::Validate;

use crate::{
    asset_storage::UploadedFile,
    ingestion::IngestionPool,
    like_cache::LikeCache,
    listing::{ImageLister, ListQuery},
    types::{AppError, ValidatedJson},
};

/// Multipart field carrying image files
const IMAGES_FIELD: &str = "images";
/// Multipart field carrying the uploader label
const OWNER_FIELD: &str = "username";
/// Uploader label used when none is given
const DEFAULT_OWNER: &str = "anonymous";

#[derive(Debug, Serialize, JsonSchema)]
pub struct UploadResponse {
    /// Number of images queued for ingestion
    pub queued: usize,
}

#[derive(Debug, Deserialize, Validate, JsonSchema)]
pub struct ListRequest {
    /// Rows per page, between 1 and 100
    pub page_size: i64,
    /// Zero-based page number
    pub page_number: i64,
    /// `liked_count` (default) or `created_at`
    #[validate(length(max = 64, message = "order_by is too long"))]
    pub order_by: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct ListResponse {
    pub files: Vec<ImageSummary>,
    pub total_pages: i64,
}

#[derive(Debug, Deserialize, Validate, JsonSchema)]
pub struct LikeRequest {
    /// Identifier of the liked image
    #[validate(length(min = 1, max = 512, message = "image_id must not be empty"))]
    pub image_id: String,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct LikeResponse {
    /// Like count including the like just recorded
    pub liked_count: i64,
}

/// Accepts any declared image type; a missing content type is let through
fn is_image(content_type: Option<&str>) -> bool {
    content_type.is_none_or(|value| {
        value
            .parse::<mime::Mime>()
            .is_ok_and(|parsed| parsed.type_() == mime::IMAGE)
    })
}

/// Queues uploaded images for ingestion
///
/// Responds as soon as every image is queued; ingestion completes in the background.
#[instrument(skip(ingestion_pool, multipart))]
pub async fn upload_images(
    Extension(ingestion_pool): Extension<Arc<IngestionPool>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut files = Vec::new();
    let mut owner = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            IMAGES_FIELD => {
                let file_name = field
                    .file_name()
                    .map_or_else(|| format!("image-{}", files.len()), ToString::to_string);
                let content_type = field.content_type().map(ToString::to_string);
                if !is_image(content_type.as_deref()) {
                    return Err(AppError::validation(
                        "invalid_content_type",
                        format!("{file_name} is not an image"),
                    ));
                }

                let bytes = field.bytes().await?;
                files.push(UploadedFile {
                    file_name,
                    content_type,
                    bytes,
                });
            }
            OWNER_FIELD => owner = Some(field.text().await?),
            _ => debug!(field = %name, "Ignoring unknown multipart field"),
        }
    }

    if files.is_empty() {
        return Err(AppError::validation("no_images", "No images provided"));
    }

    let owner = owner
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_OWNER.to_string());

    // Outcomes are logged by the pool
    let batch = ingestion_pool.submit_batch(files, &owner).await?;

    Ok(Json(UploadResponse {
        queued: batch.len(),
    }))
}

/// Lists approved images, most liked or most recent first
#[instrument(skip(lister))]
pub async fn list_images(
    Extension(lister): Extension<Arc<ImageLister>>,
    ValidatedJson(payload): ValidatedJson<ListRequest>,
) -> Result<Json<ListResponse>, AppError> {
    let page = lister
        .list(&ListQuery {
            page_number: payload.page_number,
            page_size: payload.page_size,
            order_by: payload.order_by,
        })
        .await?;

    Ok(Json(ListResponse {
        files: page.images,
        total_pages: page.total_pages,
    }))
}

/// Records a like
#[instrument(skip(like_cache))]
pub async fn like_image(
    Extension(like_cache): Extension<Arc<LikeCache>>,
    ValidatedJson(payload): ValidatedJson<LikeRequest>,
) -> Result<Json<LikeResponse>, AppError> {
    let liked_count = like_cache.increment(&payload.image_id).await?;
    Ok(Json(LikeResponse { liked_count }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_image() {
        assert!(is_image(None));
        assert!(is_image(Some("image/png")));
        assert!(is_image(Some("image/webp")));
        assert!(!is_image(Some("text/plain")));
        assert!(!is_image(Some("not a mime")));
    }
}
