//! Universal error handling for the API

use aide::OperationOutput;
use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use schemars::JsonSchema;
use serde::Serialize;

use crate::ingestion::IngestionError;
use crate::like_cache::LikeCacheError;
use crate::listing::ListingError;
use gallery_storage::images::ImageStoreError;

/// API error response envelope
#[derive(Debug, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    /// Whether the client should retry the request
    pub allow_retry: bool,
    /// Error details
    error: ErrorBody,
}

/// Error body containing code and message
#[derive(Debug, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    /// Machine-readable error code
    pub code: &'static str,
    /// Human-readable error message
    pub message: String,
}

/// Application error type that wraps the API error response
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    inner: ApiErrorResponse,
}

impl AppError {
    /// Create a new application error
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>, retry: bool) -> Self {
        Self {
            status,
            inner: ApiErrorResponse {
                allow_retry: retry,
                error: ErrorBody {
                    code,
                    message: msg.into(),
                },
            },
        }
    }

    /// A 400 response carrying a validation error code
    #[must_use]
    pub fn validation(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, msg, false)
    }

    fn internal(retry: bool) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Internal server error",
            retry,
        )
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.inner.error.code
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Log the error based on status code
        match self.status.as_u16() {
            400..=499 => tracing::warn!(
                "Client error: {} - {}",
                self.inner.error.code,
                self.inner.error.message
            ),
            500..=599 => tracing::error!(
                "Server error: {} - {}",
                self.inner.error.code,
                self.inner.error.message
            ),
            _ => {}
        }

        (self.status, Json(self.inner)).into_response()
    }
}

/// Convert image store errors to application errors
impl From<ImageStoreError> for AppError {
    fn from(err: ImageStoreError) -> Self {
        match &err {
            ImageStoreError::NotFound(id) => {
                tracing::debug!("Image not found: {id}");
                Self::new(StatusCode::NOT_FOUND, "not_found", "Image not found", false)
            }
            ImageStoreError::AlreadyExists(id) => {
                tracing::debug!("Image already exists: {id}");
                Self::new(
                    StatusCode::CONFLICT,
                    "already_exists",
                    "Image already exists",
                    false,
                )
            }
            ImageStoreError::Database(e) => {
                tracing::error!("Database error: {e}");
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "upstream_error",
                    "Database temporarily unavailable",
                    true,
                )
            }
            ImageStoreError::Migration(msg) => {
                tracing::error!("Migration error: {msg}");
                Self::internal(false)
            }
        }
    }
}

impl From<LikeCacheError> for AppError {
    fn from(err: LikeCacheError) -> Self {
        match err {
            LikeCacheError::SeedLoad { source, .. } => source.into(),
        }
    }
}

impl From<ListingError> for AppError {
    fn from(err: ListingError) -> Self {
        match err {
            ListingError::InvalidPage(msg) => Self::validation("invalid_page", msg),
            ListingError::Store(e) => e.into(),
        }
    }
}

impl From<IngestionError> for AppError {
    fn from(err: IngestionError) -> Self {
        tracing::error!("Ingestion error: {err}");
        match err {
            IngestionError::PoolClosed => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "shutting_down",
                "Server is shutting down",
                true,
            ),
            _ => Self::internal(true),
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        tracing::warn!("Multipart error: {err}");
        Self::new(err.status(), "invalid_multipart", err.body_text(), false)
    }
}

impl OperationOutput for AppError {
    type Inner = ApiErrorResponse;

    fn operation_response(
        ctx: &mut aide::generate::GenContext,
        operation: &mut aide::openapi::Operation,
    ) -> Option<aide::openapi::Response> {
        Json::<ApiErrorResponse>::operation_response(ctx, operation)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_invalid_page_is_client_error() {
        let err = AppError::from(ListingError::InvalidPage("page_size".to_string()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "invalid_page");
    }

    #[test]
    fn test_seed_load_not_found_maps_to_404() {
        let err = AppError::from(LikeCacheError::SeedLoad {
            key: "missing".to_string(),
            source: ImageStoreError::NotFound("missing".to_string()),
        });
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_pool_closed_allows_retry() {
        let err = AppError::from(IngestionError::PoolClosed);
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.inner.allow_retry);
    }
}
