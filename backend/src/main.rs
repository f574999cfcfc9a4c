use std::sync::Arc;

use aws_sdk_s3::Client as S3Client;
use datadog_tracing::axum::shutdown_signal;
use gallery_backend::{
    asset_storage::{AssetStore, S3AssetStore},
    ingestion::IngestionPool,
    like_cache::LikeCache,
    link_validation::{HttpLivenessChecker, LinkValidationPool},
    listing::ImageLister,
    server::{self, Services},
    types::Environment,
};
use gallery_storage::images::{ImageStore, PostgresImageStore};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let environment = Environment::from_env();

    // JSON logs for staging/production (Datadog), plain logs for development
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(environment.tracing_level()).into())
        .from_env_lossy();
    match environment {
        Environment::Production | Environment::Staging => {
            fmt().json().with_env_filter(env_filter).init();
        }
        Environment::Development { .. } => {
            fmt().with_env_filter(env_filter).init();
        }
    }

    let postgres = PostgresImageStore::connect(
        &environment.database_url(),
        environment.database_max_connections(),
    )
    .await?;
    postgres.health_check().await?;
    let image_store: Arc<dyn ImageStore> = Arc::new(postgres);

    let s3_client = Arc::new(S3Client::from_conf(environment.s3_client_config().await));
    let asset_store: Arc<dyn AssetStore> = Arc::new(S3AssetStore::new(
        s3_client,
        environment.s3_bucket(),
        environment.presigned_url_expiry_secs(),
    ));

    let like_cache = Arc::new(LikeCache::new(
        Arc::clone(&image_store),
        environment.like_cache_config(),
    ));
    let like_cache_handle = like_cache.start();

    let ingestion_pool = Arc::new(IngestionPool::start(
        Arc::clone(&asset_store),
        Arc::clone(&image_store),
        environment.ingestion_config(),
    ));

    let validation_pool = Arc::new(LinkValidationPool::start(
        Arc::new(HttpLivenessChecker::new(reqwest::Client::new())),
        Arc::clone(&asset_store),
        environment.validation_config(),
    ));

    let lister = Arc::new(ImageLister::new(
        Arc::clone(&image_store),
        Arc::clone(&validation_pool),
    ));

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_shutdown.cancel();
    });

    let services = Services {
        like_cache,
        ingestion_pool: Arc::clone(&ingestion_pool),
        lister,
    };
    let served = server::start(environment, services, shutdown.clone()).await;

    // Stop background work even if the server failed
    shutdown.cancel();
    like_cache_handle.shutdown().await;
    ingestion_pool.shutdown().await;
    validation_pool.shutdown().await;

    info!("Gallery backend stopped");
    served
}
