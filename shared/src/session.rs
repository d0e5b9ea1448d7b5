use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::cache::{self, ImageHandle, ImageStore};
use crate::config::GalleryConfig;
use crate::http::HttpGalleryClient;
use crate::model::{Item, ItemId, ItemStore};
use crate::notifier::GalleryNotifier;
use crate::pagination::{FetchOutcome, PaginationController, PaginationState};
use crate::prefetch::{ImagePrefetcher, PrefetchMetricsSnapshot};
use crate::services::{ImageFetcher, ListingService, UploadService};
use crate::upload::{Photo, UploadCoordinator, UploadOutcome};
use crate::GalleryError;

#[derive(Debug, Clone)]
pub enum Thumbnail {
    Cached(ImageHandle),
    /// No key, not downloaded yet, or the download failed.
    Placeholder,
}

impl Thumbnail {
    pub fn is_cached(&self) -> bool {
        matches!(self, Thumbnail::Cached(_))
    }
}

/// What the list renders for one item.
#[derive(Debug, Clone)]
pub struct PhotoRow {
    pub item: Item,
    pub thumbnail: Thumbnail,
}

/// One gallery screen: the item list, its thumbnails, and the pending
/// upload selection. Dropping the session cancels outstanding work.
pub struct GallerySession {
    id: Uuid,
    config: GalleryConfig,
    store: Arc<ItemStore>,
    cache: Arc<dyn ImageStore>,
    prefetcher: Arc<ImagePrefetcher>,
    pagination: Arc<PaginationController>,
    uploads: Arc<UploadCoordinator>,
    cancel: CancellationToken,
}

impl GallerySession {
    pub fn new(
        config: GalleryConfig,
        listing: Arc<dyn ListingService>,
        uploader: Arc<dyn UploadService>,
        fetcher: Arc<dyn ImageFetcher>,
        notifier: Arc<dyn GalleryNotifier>,
    ) -> Result<Self, GalleryError> {
        config.validate()?;

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let store = Arc::new(ItemStore::new());
        let cache = cache::image_store(config.cache_capacity());
        let prefetcher = Arc::new(ImagePrefetcher::new(
            Arc::clone(&cache),
            fetcher,
            config.prefetch_config(),
        ));
        let pagination = Arc::new(PaginationController::new(
            listing,
            Arc::clone(&store),
            Arc::clone(&prefetcher),
            Arc::clone(&notifier),
            cancel.clone(),
        ));
        let uploads = Arc::new(UploadCoordinator::new(
            uploader,
            Arc::clone(&store),
            notifier,
            config.max_upload_bytes,
        ));

        info!(
            session = %id,
            max_concurrent_fetches = config.max_concurrent_fetches,
            cache_capacity = ?config.cache_capacity,
            "gallery session started"
        );

        Ok(Self {
            id,
            config,
            store,
            cache,
            prefetcher,
            pagination,
            uploads,
            cancel,
        })
    }

    /// Session backed by the HTTP client for all three services.
    pub fn with_http(
        config: GalleryConfig,
        notifier: Arc<dyn GalleryNotifier>,
    ) -> Result<Self, GalleryError> {
        config.validate()?;
        let client = Arc::new(HttpGalleryClient::from_config(&config)?);
        Self::new(config, client.clone(), client.clone(), client, notifier)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &GalleryConfig {
        &self.config
    }

    /// Fire-and-forget trigger for the list's "near the end" signal.
    pub fn request_next_page(&self) -> Option<JoinHandle<FetchOutcome>> {
        self.pagination.request_next_page()
    }

    #[instrument(skip(self), fields(session = %self.id))]
    pub async fn fetch_next_page(&self) -> FetchOutcome {
        self.pagination.fetch_next_page().await
    }

    pub fn pagination_state(&self) -> PaginationState {
        self.pagination.state()
    }

    pub fn row_count(&self) -> usize {
        self.store.len()
    }

    pub fn loader_rows(&self) -> usize {
        self.pagination.loader_rows()
    }

    pub fn row(&self, index: usize) -> Option<PhotoRow> {
        let item = self.store.get(index)?;
        let thumbnail = item
            .image_key
            .as_ref()
            .and_then(|key| self.cache.get(key))
            .map_or(Thumbnail::Placeholder, Thumbnail::Cached);
        Some(PhotoRow { item, thumbnail })
    }

    pub fn select_item(&self, item: Option<ItemId>) {
        self.uploads.select_item(item);
    }

    pub fn select_row(&self, row: usize) -> Option<ItemId> {
        self.uploads.select_row(row)
    }

    pub fn cancel_selection(&self) {
        self.uploads.cancel_selection();
    }

    pub fn selected(&self) -> Option<ItemId> {
        self.uploads.selected()
    }

    /// Uploads `photo` for the selected item under the configured uploader
    /// name. The selection is consumed immediately.
    pub fn upload_photo(&self, photo: Photo) -> impl Future<Output = UploadOutcome> + Send + 'static {
        self.uploads.upload_photo(photo, &self.config.uploader_name)
    }

    pub fn prefetch_metrics(&self) -> PrefetchMetricsSnapshot {
        self.prefetcher.metrics()
    }

    pub fn cached_thumbnails(&self) -> usize {
        self.cache.len()
    }

    /// Drops all rows and thumbnails and starts again from page 0.
    pub fn reset(&self) -> bool {
        self.pagination.reset()
    }

    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!(session = %self.id, "gallery session shutting down");
            self.cancel.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for GallerySession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
