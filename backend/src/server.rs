use std::sync::Arc;
use std::time::Duration;

use aide::openapi::{Info, OpenApi};
use axum::{extract::DefaultBodyLimit, Extension, Router};
use datadog_tracing::axum::{OtelAxumLayer, OtelInResponseLayer};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;

use crate::{
    ingestion::IngestionPool, like_cache::LikeCache, listing::ImageLister, routes,
    types::Environment,
};

/// Largest accepted request body, sized for a multi-image upload
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Upper bound on a single request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Components the HTTP handlers talk to
#[derive(Clone)]
pub struct Services {
    pub like_cache: Arc<LikeCache>,
    pub ingestion_pool: Arc<IngestionPool>,
    pub lister: Arc<ImageLister>,
}

/// Builds the application router with every layer applied
pub fn router(environment: Environment, services: Services) -> Router {
    let mut openapi = OpenApi {
        info: Info {
            title: "Gallery Backend".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..Info::default()
        },
        ..OpenApi::default()
    };

    routes::handler(&environment)
        .finish_api(&mut openapi)
        .layer(Extension(Arc::new(openapi)))
        .layer(Extension(environment))
        .layer(Extension(services.like_cache))
        .layer(Extension(services.ingestion_pool))
        .layer(Extension(services.lister))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        // Include trace context as header into the response
        .layer(OtelInResponseLayer)
        // Start OpenTelemetry trace on incoming request
        .layer(OtelAxumLayer::default())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
}

/// Serves the API until `shutdown` is cancelled
///
/// # Errors
///
/// Returns an error if the server fails to bind to the port
pub async fn start(
    environment: Environment,
    services: Services,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], environment.port()));
    let router = router(environment, services);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Gallery backend started on http://{addr}");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(anyhow::Error::from)
}
