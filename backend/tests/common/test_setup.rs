use std::sync::Arc;
use std::time::Duration;

use axum::{body::Body, http::Request, response::Response, Router};
use gallery_backend::{
    ingestion::{IngestionConfig, IngestionPool},
    like_cache::{LikeCache, LikeCacheConfig},
    link_validation::{LinkValidationPool, ValidationConfig},
    listing::ImageLister,
    server::{self, Services},
    test_utils::Fakes,
    types::Environment,
};
use tower::ServiceExt;

use super::BOUNDARY;

/// Setup test environment variables with all the required configuration
pub fn setup_test_env() {
    // Load test environment variables
    dotenvy::from_path(".env.example").ok();

    // Initialize tracing for tests
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

/// Ingestion config with short preview polling for tests
pub fn fast_ingestion_config() -> IngestionConfig {
    IngestionConfig {
        num_workers: 4,
        queue_capacity: 8,
        upload_folder: "gallery".to_string(),
        preview_attempts: 3,
        preview_delay: Duration::from_millis(10),
        upload_timeout: Duration::from_secs(5),
    }
}

/// Every component wired to in-memory fakes, plus the router serving them
pub struct TestContext {
    pub fakes: Fakes,
    pub like_cache: Arc<LikeCache>,
    pub ingestion_pool: Arc<IngestionPool>,
    pub validation_pool: Arc<LinkValidationPool>,
    pub lister: Arc<ImageLister>,
    pub router: Router,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(LikeCacheConfig::default(), fast_ingestion_config())
    }

    pub fn with_config(like_cache_config: LikeCacheConfig, ingestion_config: IngestionConfig) -> Self {
        setup_test_env();

        let fakes = Fakes::new();
        let like_cache = Arc::new(LikeCache::new(fakes.images.clone(), like_cache_config));
        let ingestion_pool = Arc::new(IngestionPool::start(
            fakes.assets.clone(),
            fakes.images.clone(),
            ingestion_config,
        ));
        let validation_pool = Arc::new(LinkValidationPool::start(
            fakes.liveness.clone(),
            fakes.assets.clone(),
            ValidationConfig::with_workers(2),
        ));
        let lister = Arc::new(ImageLister::new(
            fakes.images.clone(),
            validation_pool.clone(),
        ));

        let router = server::router(
            Environment::Development {
                presign_expiry_override: None,
            },
            Services {
                like_cache: like_cache.clone(),
                ingestion_pool: ingestion_pool.clone(),
                lister: lister.clone(),
            },
        );

        Self {
            fakes,
            like_cache,
            ingestion_pool,
            validation_pool,
            lister,
            router,
        }
    }

    pub async fn send_post_request(
        &self,
        route: &str,
        payload: serde_json::Value,
    ) -> Result<Response, Box<dyn std::error::Error>> {
        let request = Request::builder()
            .uri(route)
            .method("POST")
            .header("Content-Type", "application/json")
            .body(Body::from(payload.to_string()))?;

        let response = self.router.clone().oneshot(request).await?;
        Ok(response)
    }

    pub async fn send_multipart_request(
        &self,
        route: &str,
        body: Vec<u8>,
    ) -> Result<Response, Box<dyn std::error::Error>> {
        let request = Request::builder()
            .uri(route)
            .method("POST")
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))?;

        let response = self.router.clone().oneshot(request).await?;
        Ok(response)
    }

    pub async fn send_get_request(
        &self,
        route: &str,
    ) -> Result<Response, Box<dyn std::error::Error>> {
        let request = Request::builder()
            .uri(route)
            .method("GET")
            .body(Body::empty())?;
        let response = self.router.clone().oneshot(request).await?;
        Ok(response)
    }

    /// Drains both pools
    pub async fn shutdown(&self) {
        self.ingestion_pool.shutdown().await;
        self.validation_pool.shutdown().await;
    }
}
