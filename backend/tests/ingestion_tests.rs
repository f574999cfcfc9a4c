mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use common::*;
use gallery_backend::asset_storage::UploadedFile;
use gallery_backend::ingestion::{IngestionConfig, IngestionError, IngestionPool};
use gallery_backend::test_utils::{Fakes, InMemoryAssetStore};
use pretty_assertions::assert_eq;

fn file(name: &str) -> UploadedFile {
    UploadedFile {
        file_name: name.to_string(),
        content_type: Some("image/png".to_string()),
        bytes: Bytes::from_static(b"\x89PNG"),
    }
}

fn start_pool(fakes: &Fakes, config: IngestionConfig) -> IngestionPool {
    setup_test_env();
    IngestionPool::start(fakes.assets.clone(), fakes.images.clone(), config)
}

#[tokio::test]
async fn test_batch_outcomes_in_submission_order() {
    let fakes = Fakes::new();
    let pool = start_pool(&fakes, fast_ingestion_config());

    let names = ["one.png", "two.png", "three.png", "four.png", "five.png"];
    let batch = pool
        .submit_batch(names.iter().map(|name| file(name)).collect(), "alice")
        .await
        .unwrap();
    assert_eq!(batch.len(), 5);

    let outcomes = batch.wait().await;
    let file_names: Vec<_> = outcomes
        .iter()
        .map(|outcome| outcome.as_ref().unwrap().file_name.as_str())
        .collect();
    assert_eq!(file_names, names);

    let rows = fakes.images.rows();
    assert_eq!(rows.len(), 5);
    for row in rows {
        assert_eq!(row.uploaded_by, "alice");
        assert_eq!(row.liked_count, 0);
        assert!(!row.is_approved);
        assert!(row.asset_id.starts_with("gallery/"));
        assert_eq!(row.preview_link, InMemoryAssetStore::preview_url(&row.asset_id));
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn test_preview_polled_until_ready() {
    let fakes = Fakes::new();
    fakes.assets.previews_after(Some(2));
    let pool = start_pool(&fakes, fast_ingestion_config());

    let outcomes = pool
        .submit_batch(vec![file("slow.png")], "bob")
        .await
        .unwrap()
        .wait()
        .await;

    let image = outcomes[0].as_ref().unwrap();
    assert_eq!(
        image.preview_link,
        InMemoryAssetStore::preview_url(&image.asset_id)
    );
    assert_eq!(fakes.assets.preview_calls.load(Ordering::SeqCst), 3);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_missing_preview_records_empty_link() {
    let fakes = Fakes::new();
    fakes.assets.previews_after(None);
    let pool = start_pool(&fakes, fast_ingestion_config());

    let outcomes = pool
        .submit_batch(vec![file("never.png")], "bob")
        .await
        .unwrap()
        .wait()
        .await;

    let image = outcomes[0].as_ref().unwrap();
    assert!(image.preview_link.is_empty());
    assert_eq!(fakes.assets.preview_calls.load(Ordering::SeqCst), 3);
    assert_eq!(fakes.images.row(&image.asset_id).unwrap().preview_link, "");

    pool.shutdown().await;
}

#[tokio::test]
async fn test_failures_are_reported_per_file() {
    let fakes = Fakes::new();
    fakes.assets.fail_upload_of("broken.png");
    let pool = start_pool(&fakes, fast_ingestion_config());

    let outcomes = pool
        .submit_batch(vec![file("ok.png"), file("broken.png")], "carol")
        .await
        .unwrap()
        .wait()
        .await;

    assert!(outcomes[0].is_ok());
    assert!(matches!(
        &outcomes[1],
        Err(IngestionError::Upload { file_name, .. }) if file_name == "broken.png"
    ));
    assert_eq!(fakes.images.rows().len(), 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_insert_failure_is_reported() {
    let fakes = Fakes::new();
    fakes.images.fail_inserts(true);
    let pool = start_pool(&fakes, fast_ingestion_config());

    let outcomes = pool
        .submit_batch(vec![file("a.png")], "dave")
        .await
        .unwrap()
        .wait()
        .await;

    assert!(matches!(&outcomes[0], Err(IngestionError::Insert { .. })));
    assert_eq!(fakes.assets.uploaded_file_names(), vec!["a.png"]);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_preview_lookup_failure_skips_insert() {
    let fakes = Fakes::new();
    fakes.assets.fail_previews(true);
    let pool = start_pool(&fakes, fast_ingestion_config());

    let outcomes = pool
        .submit_batch(vec![file("a.png")], "erin")
        .await
        .unwrap()
        .wait()
        .await;

    assert!(matches!(&outcomes[0], Err(IngestionError::PreviewLookup { .. })));
    assert!(fakes.images.rows().is_empty());

    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_upload_timeout() {
    let fakes = Fakes::new();
    fakes.assets.delay_uploads(Duration::from_secs(10));
    let config = IngestionConfig {
        upload_timeout: Duration::from_secs(1),
        ..fast_ingestion_config()
    };
    let pool = start_pool(&fakes, config);

    let outcomes = pool
        .submit_batch(vec![file("a.png")], "frank")
        .await
        .unwrap()
        .wait()
        .await;

    assert!(matches!(
        &outcomes[0],
        Err(IngestionError::UploadTimeout { timeout, .. }) if *timeout == Duration::from_secs(1)
    ));

    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_applies_backpressure() {
    let fakes = Fakes::new();
    fakes.assets.delay_uploads(Duration::from_secs(1));
    let config = IngestionConfig {
        num_workers: 1,
        queue_capacity: 1,
        ..fast_ingestion_config()
    };
    let pool = Arc::new(start_pool(&fakes, config));

    // One task in the worker, one in the queue, the third has to wait
    let submitter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.submit_batch(vec![file("1.png"), file("2.png"), file("3.png")], "gina")
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!submitter.is_finished());

    let batch = submitter.await.unwrap().unwrap();
    let outcomes = batch.wait().await;
    assert!(outcomes.iter().all(Result::is_ok));
    assert_eq!(
        fakes.assets.uploaded_file_names(),
        vec!["1.png", "2.png", "3.png"]
    );

    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_queued_tasks() {
    let fakes = Fakes::new();
    fakes.assets.delay_uploads(Duration::from_millis(100));
    let config = IngestionConfig {
        num_workers: 1,
        queue_capacity: 4,
        ..fast_ingestion_config()
    };
    let pool = start_pool(&fakes, config);

    let batch = pool
        .submit_batch(vec![file("1.png"), file("2.png"), file("3.png")], "hal")
        .await
        .unwrap();
    pool.shutdown().await;

    let outcomes = batch.wait().await;
    assert!(outcomes.iter().all(Result::is_ok));
    assert_eq!(fakes.images.rows().len(), 3);

    let err = pool
        .submit_batch(vec![file("late.png")], "hal")
        .await
        .unwrap_err();
    assert!(matches!(err, IngestionError::PoolClosed));
}
