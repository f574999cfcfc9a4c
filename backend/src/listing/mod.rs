//! Paged listing of approved images
//!
//! Every listed row has its preview link checked before the page is
//! returned. Rows whose link was repaired are served with the new link right
//! away and the store is updated in the background.

mod error;

use std::sync::Arc;

use gallery_storage::images::{ImageStore, ImageSummary, PageRequest, SortKey};
use tracing::{debug, instrument, warn};

pub use error::{ListingError, ListingResult};

use crate::link_validation::{LinkValidationPool, ValidationResult, ValidationTask};

/// Largest page a client may request
pub const MAX_PAGE_SIZE: i64 = 100;

/// Raw page parameters as received from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    /// Zero-based
    pub page_number: i64,
    pub page_size: i64,
    /// Requested sort column; unknown values fall back to the like count
    pub order_by: Option<String>,
}

impl ListQuery {
    fn page_request(&self) -> ListingResult<PageRequest> {
        if !(1..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(ListingError::InvalidPage(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        let page_number = u32::try_from(self.page_number).map_err(|_| {
            ListingError::InvalidPage("page_number must be a non-negative integer".to_string())
        })?;
        let page_size = u32::try_from(self.page_size)
            .map_err(|_| ListingError::InvalidPage("page_size out of range".to_string()))?;

        Ok(PageRequest {
            page_number,
            page_size,
            sort_key: SortKey::parse_or_default(self.order_by.as_deref()),
        })
    }
}

/// One page of the listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePage {
    pub images: Vec<ImageSummary>,
    pub total_pages: i64,
}

/// Serves listing pages with validated preview links
pub struct ImageLister {
    image_store: Arc<dyn ImageStore>,
    validation_pool: Arc<LinkValidationPool>,
}

impl ImageLister {
    #[must_use]
    pub fn new(image_store: Arc<dyn ImageStore>, validation_pool: Arc<LinkValidationPool>) -> Self {
        Self {
            image_store,
            validation_pool,
        }
    }

    /// Reads one page of approved images
    ///
    /// If validation itself fails, the page is served with the stored links.
    ///
    /// # Errors
    ///
    /// Returns `ListingError::InvalidPage` for out-of-range page parameters and
    /// `ListingError::Store` if either store query fails
    #[instrument(skip(self))]
    pub async fn list(&self, query: &ListQuery) -> ListingResult<ImagePage> {
        let page = query.page_request()?;

        let (mut images, total_rows) = futures::try_join!(
            self.image_store.list_approved(&page),
            self.image_store.count_approved(),
        )?;

        let tasks = images
            .iter()
            .enumerate()
            .map(|(sequence_index, image)| ValidationTask {
                sequence_index,
                asset_id: image.id.clone(),
                preview_link: image.thumbnail.clone(),
            })
            .collect();

        match self.validation_pool.validate(tasks).await {
            Ok(results) => self.apply_repairs(&mut images, results),
            Err(e) => warn!(error = %e, "Link validation failed, serving stored links"),
        }

        Ok(ImagePage {
            images,
            total_pages: page.total_pages(total_rows),
        })
    }

    fn apply_repairs(&self, images: &mut [ImageSummary], results: Vec<ValidationResult>) {
        for result in results {
            let Some(link) = result.repaired_link.filter(|_| !result.is_valid) else {
                continue;
            };
            let Some(image) = images.get_mut(result.sequence_index) else {
                continue;
            };

            image.thumbnail.clone_from(&link);

            let store = Arc::clone(&self.image_store);
            let asset_id = result.asset_id;
            tokio::spawn(async move {
                match store.update_preview_link(&asset_id, &link).await {
                    Ok(()) => debug!(asset_id = %asset_id, "Stored repaired preview link"),
                    Err(e) => {
                        warn!(asset_id = %asset_id, error = %e, "Failed to store repaired preview link");
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn query(page_number: i64, page_size: i64, order_by: Option<&str>) -> ListQuery {
        ListQuery {
            page_number,
            page_size,
            order_by: order_by.map(str::to_string),
        }
    }

    #[test]
    fn test_page_request_bounds() {
        assert!(query(0, 1, None).page_request().is_ok());
        assert!(query(3, MAX_PAGE_SIZE, None).page_request().is_ok());
        assert!(matches!(
            query(0, 0, None).page_request(),
            Err(ListingError::InvalidPage(_))
        ));
        assert!(matches!(
            query(0, MAX_PAGE_SIZE + 1, None).page_request(),
            Err(ListingError::InvalidPage(_))
        ));
        assert!(matches!(
            query(-1, 10, None).page_request(),
            Err(ListingError::InvalidPage(_))
        ));
    }

    #[test]
    fn test_page_request_sort_key_fallback() {
        let page = query(1, 10, Some("file_name")).page_request().unwrap();
        assert_eq!(page.sort_key, SortKey::LikedCount);
        assert_eq!(page.offset(), 10);

        let page = query(0, 10, Some("created_at")).page_request().unwrap();
        assert_eq!(page.sort_key, SortKey::CreatedAt);
    }
}
