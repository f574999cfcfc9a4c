mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use futures::future::join_all;
use gallery_backend::link_validation::{
    LinkValidationPool, ValidationConfig, ValidationError, ValidationResult, ValidationTask,
};
use gallery_backend::test_utils::Fakes;
use pretty_assertions::assert_eq;

fn start_pool(fakes: &Fakes, config: ValidationConfig) -> LinkValidationPool {
    setup_test_env();
    LinkValidationPool::start(fakes.liveness.clone(), fakes.assets.clone(), config)
}

fn task(sequence_index: usize, asset_id: &str, preview_link: &str) -> ValidationTask {
    ValidationTask {
        sequence_index,
        asset_id: asset_id.to_string(),
        preview_link: preview_link.to_string(),
    }
}

fn valid(sequence_index: usize, asset_id: &str) -> ValidationResult {
    ValidationResult {
        sequence_index,
        asset_id: asset_id.to_string(),
        is_valid: true,
        repaired_link: None,
    }
}

#[tokio::test]
async fn test_results_ordered_by_sequence_index() {
    let fakes = Fakes::new();
    let pool = start_pool(&fakes, ValidationConfig::with_workers(3));

    // More tasks than queue slots
    let tasks: Vec<_> = (0..20)
        .map(|i| task(i, &format!("asset-{i}"), &format!("https://previews.test/{i}")))
        .collect();
    let results = pool.validate(tasks).await.unwrap();

    let expected: Vec<_> = (0..20).map(|i| valid(i, &format!("asset-{i}"))).collect();
    assert_eq!(results, expected);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_dead_link_is_repaired() {
    let fakes = Fakes::new();
    fakes.liveness.mark_dead("https://stale.test/a");
    fakes.liveness.mark_unreachable("https://gone.test/b");
    fakes.assets.set_refreshed_link("a", "https://fresh.test/a");
    fakes.assets.set_refreshed_link("b", "https://fresh.test/b");
    let pool = start_pool(&fakes, ValidationConfig::default());

    let results = pool
        .validate(vec![
            task(0, "a", "https://stale.test/a"),
            task(1, "b", "https://gone.test/b"),
            task(2, "c", "https://fine.test/c"),
        ])
        .await
        .unwrap();

    assert_eq!(
        results,
        vec![
            ValidationResult {
                sequence_index: 0,
                asset_id: "a".to_string(),
                is_valid: false,
                repaired_link: Some("https://fresh.test/a".to_string()),
            },
            ValidationResult {
                sequence_index: 1,
                asset_id: "b".to_string(),
                is_valid: false,
                repaired_link: Some("https://fresh.test/b".to_string()),
            },
            valid(2, "c"),
        ]
    );

    pool.shutdown().await;
}

#[tokio::test]
async fn test_failed_repair_is_invalid_without_link() {
    let fakes = Fakes::new();
    fakes.liveness.mark_dead("https://stale.test/a");
    let pool = start_pool(&fakes, ValidationConfig::default());

    let results = pool
        .validate(vec![task(0, "a", "https://stale.test/a")])
        .await
        .unwrap();

    assert_eq!(
        results,
        vec![ValidationResult {
            sequence_index: 0,
            asset_id: "a".to_string(),
            is_valid: false,
            repaired_link: None,
        }]
    );
    assert_eq!(fakes.assets.refresh_calls.load(Ordering::SeqCst), 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_empty_link_is_dead_without_check() {
    let fakes = Fakes::new();
    fakes.assets.set_refreshed_link("a", "https://fresh.test/a");
    let pool = start_pool(&fakes, ValidationConfig::default());

    let results = pool.validate(vec![task(0, "a", "")]).await.unwrap();

    assert!(!results[0].is_valid);
    assert_eq!(results[0].repaired_link.as_deref(), Some("https://fresh.test/a"));
    assert_eq!(fakes.liveness.checks.load(Ordering::SeqCst), 0);

    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_link_times_out_as_dead() {
    let fakes = Fakes::new();
    fakes.liveness.delay("https://slow.test/a", Duration::from_secs(30));
    let pool = start_pool(&fakes, ValidationConfig::default());

    let results = pool
        .validate(vec![task(0, "a", "https://slow.test/a")])
        .await
        .unwrap();

    assert!(!results[0].is_valid);
    assert_eq!(results[0].repaired_link, None);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_callers_get_their_own_results() {
    let fakes = Fakes::new();
    let pool = Arc::new(start_pool(&fakes, ValidationConfig::with_workers(2)));

    let calls = join_all((0..8).map(|caller| {
        let pool = pool.clone();
        async move {
            let tasks = (0..5)
                .map(|i| {
                    let asset_id = format!("caller-{caller}-{i}");
                    let link = format!("https://previews.test/{asset_id}");
                    task(i, &asset_id, &link)
                })
                .collect();
            (caller, pool.validate(tasks).await.unwrap())
        }
    }))
    .await;

    for (caller, results) in calls {
        let expected: Vec<_> = (0..5)
            .map(|i| valid(i, &format!("caller-{caller}-{i}")))
            .collect();
        assert_eq!(results, expected);
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn test_empty_validation_is_noop() {
    let fakes = Fakes::new();
    let pool = start_pool(&fakes, ValidationConfig::default());

    assert!(pool.validate(Vec::new()).await.unwrap().is_empty());
    assert_eq!(fakes.liveness.checks.load(Ordering::SeqCst), 0);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_validate_after_shutdown_fails() {
    let fakes = Fakes::new();
    let pool = start_pool(&fakes, ValidationConfig::default());
    pool.shutdown().await;

    let err = pool
        .validate(vec![task(0, "a", "https://previews.test/a")])
        .await
        .unwrap_err();
    assert_eq!(err, ValidationError::PoolClosed);
}
