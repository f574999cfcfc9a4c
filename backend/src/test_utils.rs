//! In-memory collaborators for tests
//!
//! Every fake records the calls made to it and can be told to fail, so tests
//! can drive the cache and worker pools through their error paths without
//! Postgres, S3 or the network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use gallery_storage::images::{
    ImageStore, ImageStoreError, ImageStoreResult, ImageSummary, NewImage, PageRequest, SortKey,
};

use crate::asset_storage::{AssetStore, AssetStoreError, AssetStoreResult, UploadedFile};
use crate::link_validation::{LivenessChecker, LivenessError, LivenessResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("test fake mutex poisoned")
}

/// A stored row of [`InMemoryImageStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub asset_id: String,
    pub uploaded_by: String,
    pub file_name: String,
    pub download_url: String,
    pub preview_link: String,
    pub liked_count: i64,
    pub is_approved: bool,
    /// Insertion order, stands in for `created_at`
    pub sequence: u64,
}

#[derive(Debug, Default)]
struct ImageStoreFaults {
    fail_reads: bool,
    fail_adds: HashSet<String>,
    fail_inserts: bool,
    fail_queries: bool,
}

/// [`ImageStore`] backed by a `HashMap`
#[derive(Debug, Default)]
pub struct InMemoryImageStore {
    rows: Mutex<HashMap<String, StoredImage>>,
    faults: Mutex<ImageStoreFaults>,
    next_sequence: AtomicUsize,
    pub liked_count_calls: AtomicUsize,
    pub add_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
}

impl InMemoryImageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an approved row with the given like count
    pub fn seed(&self, asset_id: &str, liked_count: i64) {
        self.seed_row(asset_id, liked_count, &format!("https://previews.test/{asset_id}"));
    }

    /// Inserts an approved row with an explicit preview link
    pub fn seed_row(&self, asset_id: &str, liked_count: i64, preview_link: &str) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) as u64;
        lock(&self.rows).insert(
            asset_id.to_string(),
            StoredImage {
                asset_id: asset_id.to_string(),
                uploaded_by: "seed".to_string(),
                file_name: format!("{asset_id}.png"),
                download_url: format!("https://content.test/{asset_id}"),
                preview_link: preview_link.to_string(),
                liked_count,
                is_approved: true,
                sequence,
            },
        );
    }

    /// Marks a row as approved or not
    pub fn set_approved(&self, asset_id: &str, approved: bool) {
        if let Some(row) = lock(&self.rows).get_mut(asset_id) {
            row.is_approved = approved;
        }
    }

    /// Removes a row entirely
    pub fn delete(&self, asset_id: &str) {
        lock(&self.rows).remove(asset_id);
    }

    #[must_use]
    pub fn row(&self, asset_id: &str) -> Option<StoredImage> {
        lock(&self.rows).get(asset_id).cloned()
    }

    #[must_use]
    pub fn persisted_count(&self, asset_id: &str) -> Option<i64> {
        self.row(asset_id).map(|row| row.liked_count)
    }

    #[must_use]
    pub fn rows(&self) -> Vec<StoredImage> {
        let mut rows: Vec<_> = lock(&self.rows).values().cloned().collect();
        rows.sort_by_key(|row| row.sequence);
        rows
    }

    pub fn fail_reads(&self, fail: bool) {
        lock(&self.faults).fail_reads = fail;
    }

    pub fn fail_adds_for(&self, asset_id: &str, fail: bool) {
        let mut faults = lock(&self.faults);
        if fail {
            faults.fail_adds.insert(asset_id.to_string());
        } else {
            faults.fail_adds.remove(asset_id);
        }
    }

    pub fn fail_inserts(&self, fail: bool) {
        lock(&self.faults).fail_inserts = fail;
    }

    pub fn fail_queries(&self, fail: bool) {
        lock(&self.faults).fail_queries = fail;
    }

    fn unavailable() -> ImageStoreError {
        ImageStoreError::Database(sqlx_unavailable())
    }
}

fn sqlx_unavailable() -> gallery_storage::images::SqlxError {
    gallery_storage::images::SqlxError::PoolTimedOut
}

#[async_trait]
impl ImageStore for InMemoryImageStore {
    async fn liked_count(&self, asset_id: &str) -> ImageStoreResult<i64> {
        self.liked_count_calls.fetch_add(1, Ordering::SeqCst);
        if lock(&self.faults).fail_reads {
            return Err(Self::unavailable());
        }

        self.persisted_count(asset_id)
            .ok_or_else(|| ImageStoreError::NotFound(asset_id.to_string()))
    }

    async fn add_liked_count(&self, asset_id: &str, delta: i64) -> ImageStoreResult<()> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        if lock(&self.faults).fail_adds.contains(asset_id) {
            return Err(Self::unavailable());
        }

        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(asset_id)
            .ok_or_else(|| ImageStoreError::NotFound(asset_id.to_string()))?;
        row.liked_count += delta;
        Ok(())
    }

    async fn insert(&self, image: &NewImage) -> ImageStoreResult<()> {
        if lock(&self.faults).fail_inserts {
            return Err(Self::unavailable());
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) as u64;
        let mut rows = lock(&self.rows);
        if rows.contains_key(&image.asset_id) {
            return Err(ImageStoreError::AlreadyExists(image.asset_id.clone()));
        }
        rows.insert(
            image.asset_id.clone(),
            StoredImage {
                asset_id: image.asset_id.clone(),
                uploaded_by: image.uploaded_by.clone(),
                file_name: image.file_name.clone(),
                download_url: image.download_url.clone(),
                preview_link: image.preview_link.clone(),
                liked_count: 0,
                is_approved: false,
                sequence,
            },
        );
        Ok(())
    }

    async fn update_preview_link(
        &self,
        asset_id: &str,
        preview_link: &str,
    ) -> ImageStoreResult<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(asset_id)
            .ok_or_else(|| ImageStoreError::NotFound(asset_id.to_string()))?;
        row.preview_link = preview_link.to_string();
        Ok(())
    }

    async fn list_approved(&self, page: &PageRequest) -> ImageStoreResult<Vec<ImageSummary>> {
        if lock(&self.faults).fail_queries {
            return Err(Self::unavailable());
        }

        let mut rows: Vec<StoredImage> = lock(&self.rows)
            .values()
            .filter(|row| row.is_approved)
            .cloned()
            .collect();
        match page.sort_key {
            SortKey::LikedCount => rows.sort_by(|a, b| {
                b.liked_count
                    .cmp(&a.liked_count)
                    .then_with(|| a.asset_id.cmp(&b.asset_id))
            }),
            SortKey::CreatedAt => rows.sort_by(|a, b| {
                b.sequence
                    .cmp(&a.sequence)
                    .then_with(|| a.asset_id.cmp(&b.asset_id))
            }),
        }

        let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
        Ok(rows
            .into_iter()
            .skip(offset)
            .take(page.page_size as usize)
            .map(|row| ImageSummary {
                id: row.asset_id,
                name: row.file_name,
                thumbnail: row.preview_link,
                download_url: row.download_url,
                liked_count: row.liked_count,
            })
            .collect())
    }

    async fn count_approved(&self) -> ImageStoreResult<i64> {
        if lock(&self.faults).fail_queries {
            return Err(Self::unavailable());
        }

        let count = lock(&self.rows).values().filter(|row| row.is_approved).count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Default)]
struct AssetStoreState {
    uploads: Vec<(String, UploadedFile)>,
    /// Remaining `preview_link` polls before a preview shows up, per asset
    preview_after_polls: HashMap<String, usize>,
    refreshed_links: HashMap<String, String>,
}

/// [`AssetStore`] that keeps uploads in memory
#[derive(Debug, Default)]
pub struct InMemoryAssetStore {
    state: Mutex<AssetStoreState>,
    /// Polls before a freshly uploaded asset gets a preview; `None` means never
    default_preview_polls: Mutex<Option<usize>>,
    fail_uploads: Mutex<HashSet<String>>,
    fail_previews: std::sync::atomic::AtomicBool,
    upload_delay: Mutex<Option<Duration>>,
    next_id: AtomicUsize,
    pub preview_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
}

impl InMemoryAssetStore {
    /// Creates a store whose previews are ready on the first poll
    #[must_use]
    pub fn new() -> Self {
        let store = Self::default();
        *lock(&store.default_preview_polls) = Some(0);
        store
    }

    /// Previews appear after `polls` unsuccessful polls; `None` means never
    pub fn previews_after(&self, polls: Option<usize>) {
        *lock(&self.default_preview_polls) = polls;
    }

    /// Uploads of files with this name fail
    pub fn fail_upload_of(&self, file_name: &str) {
        lock(&self.fail_uploads).insert(file_name.to_string());
    }

    pub fn fail_previews(&self, fail: bool) {
        self.fail_previews.store(fail, Ordering::SeqCst);
    }

    /// Every upload sleeps this long before completing
    pub fn delay_uploads(&self, delay: Duration) {
        *lock(&self.upload_delay) = Some(delay);
    }

    /// `refresh_link` for this asset returns `link`; assets without one fail
    pub fn set_refreshed_link(&self, asset_id: &str, link: &str) {
        lock(&self.state)
            .refreshed_links
            .insert(asset_id.to_string(), link.to_string());
    }

    #[must_use]
    pub fn uploaded_file_names(&self) -> Vec<String> {
        lock(&self.state)
            .uploads
            .iter()
            .map(|(_, file)| file.file_name.clone())
            .collect()
    }

    #[must_use]
    pub fn preview_url(asset_id: &str) -> String {
        format!("https://previews.test/{asset_id}")
    }
}

#[async_trait]
impl AssetStore for InMemoryAssetStore {
    async fn upload(&self, file: &UploadedFile, folder: &str) -> AssetStoreResult<String> {
        let delay = *lock(&self.upload_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if lock(&self.fail_uploads).contains(&file.file_name) {
            return Err(AssetStoreError::UpstreamError(format!(
                "upload of {} rejected",
                file.file_name
            )));
        }

        let asset_id = format!("{folder}/asset-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let polls = *lock(&self.default_preview_polls);

        let mut state = lock(&self.state);
        state.uploads.push((asset_id.clone(), file.clone()));
        if let Some(polls) = polls {
            state.preview_after_polls.insert(asset_id.clone(), polls);
        }
        Ok(asset_id)
    }

    async fn preview_link(&self, asset_id: &str) -> AssetStoreResult<Option<String>> {
        self.preview_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_previews.load(Ordering::SeqCst) {
            return Err(AssetStoreError::UpstreamError("preview lookup failed".to_string()));
        }

        let mut state = lock(&self.state);
        match state.preview_after_polls.get_mut(asset_id) {
            Some(0) => Ok(Some(Self::preview_url(asset_id))),
            Some(remaining) => {
                *remaining -= 1;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn refresh_link(&self, asset_id: &str) -> AssetStoreResult<String> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.state)
            .refreshed_links
            .get(asset_id)
            .cloned()
            .ok_or_else(|| AssetStoreError::NoLinkAvailable(asset_id.to_string()))
    }

    async fn download_url(&self, asset_id: &str) -> AssetStoreResult<String> {
        Ok(format!("https://content.test/{asset_id}"))
    }
}

/// [`LivenessChecker`] that treats every URL as reachable unless marked dead
#[derive(Debug, Default)]
pub struct StaticLivenessChecker {
    dead: Mutex<HashSet<String>>,
    unreachable: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    pub checks: AtomicUsize,
}

impl StaticLivenessChecker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The URL answers with a non-success status
    pub fn mark_dead(&self, url: &str) {
        lock(&self.dead).insert(url.to_string());
    }

    /// Requests to the URL fail at the transport level
    pub fn mark_unreachable(&self, url: &str) {
        lock(&self.unreachable).insert(url.to_string());
    }

    /// Checks of the URL take this long
    pub fn delay(&self, url: &str, delay: Duration) {
        lock(&self.delays).insert(url.to_string(), delay);
    }
}

#[async_trait]
impl LivenessChecker for StaticLivenessChecker {
    async fn check(&self, url: &str, timeout: Duration) -> LivenessResult<bool> {
        self.checks.fetch_add(1, Ordering::SeqCst);

        let delay = lock(&self.delays).get(url).copied();
        if let Some(delay) = delay {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(LivenessError::Timeout(url.to_string()));
            }
            tokio::time::sleep(delay).await;
        }

        if lock(&self.unreachable).contains(url) {
            return Err(LivenessError::Request(format!("connection refused: {url}")));
        }
        Ok(!lock(&self.dead).contains(url))
    }
}

/// Shared handles to a full set of fakes
#[derive(Clone)]
pub struct Fakes {
    pub images: Arc<InMemoryImageStore>,
    pub assets: Arc<InMemoryAssetStore>,
    pub liveness: Arc<StaticLivenessChecker>,
}

impl Fakes {
    #[must_use]
    pub fn new() -> Self {
        Self {
            images: Arc::new(InMemoryImageStore::new()),
            assets: Arc::new(InMemoryAssetStore::new()),
            liveness: Arc::new(StaticLivenessChecker::new()),
        }
    }
}

impl Default for Fakes {
    fn default() -> Self {
        Self::new()
    }
}
