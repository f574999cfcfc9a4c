use std::sync::Arc;

use aide::axum::IntoApiResponse;
use axum::{Extension, Json};
use schemars::JsonSchema;
use serde::Serialize;

use crate::{ingestion::IngestionPool, like_cache::LikeCache};

#[derive(Debug, Serialize, JsonSchema)]
pub struct HealthResponse {
    status: String,
    /// Current version of the application
    semver: String,
    /// Commit hash of the current build (if available)
    rev: Option<String>,
    /// Keys held by the like cache
    cached_likes: usize,
    /// Keys with likes not yet persisted
    pending_likes: usize,
    /// Uploads waiting for an ingestion worker
    queued_uploads: usize,
}

/// Health check endpoint
///
/// Returns version information together with the backlog of the background
/// components.
pub async fn handler(
    Extension(like_cache): Extension<Arc<LikeCache>>,
    Extension(ingestion_pool): Extension<Arc<IngestionPool>>,
) -> impl IntoApiResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        semver: env!("CARGO_PKG_VERSION").to_string(),
        rev: option_env!("GIT_REV").map(ToString::to_string),
        cached_likes: like_cache.len().await,
        pending_likes: like_cache.dirty_len().await,
        queued_uploads: ingestion_pool.queued(),
    })
}
