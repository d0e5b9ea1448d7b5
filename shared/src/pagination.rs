use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::model::{ImageKey, ItemStore};
use crate::notifier::{GalleryNotifier, ALERT_TITLE_ERROR};
use crate::prefetch::{BatchReport, ImagePrefetcher};
use crate::services::{ListingError, ListingService};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Fetching,
    Prefetching,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PaginationState {
    pub next_page: u32,
    /// Unknown until the first page arrives.
    pub total_pages: Option<u32>,
    pub phase: Phase,
}

impl PaginationState {
    pub fn in_flight(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn has_more(&self) -> bool {
        self.total_pages.map_or(true, |total| self.next_page <= total)
    }

    pub fn loader_rows(&self) -> usize {
        usize::from(self.has_more())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    InFlight,
    Exhausted,
    Cancelled,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    Skipped(SkipReason),
    Appended {
        page: u32,
        appended: usize,
        batch: BatchReport,
    },
    Failed(ListingError),
    Cancelled,
}

/// Drives `Idle → Fetching → Prefetching → Idle`, one page at a time.
pub struct PaginationController {
    listing: Arc<dyn ListingService>,
    store: Arc<ItemStore>,
    prefetcher: Arc<ImagePrefetcher>,
    notifier: Arc<dyn GalleryNotifier>,
    cancel: CancellationToken,
    state: Arc<Mutex<PaginationState>>,
}

impl PaginationController {
    pub fn new(
        listing: Arc<dyn ListingService>,
        store: Arc<ItemStore>,
        prefetcher: Arc<ImagePrefetcher>,
        notifier: Arc<dyn GalleryNotifier>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            listing,
            store,
            prefetcher,
            notifier,
            cancel,
            state: Arc::new(Mutex::new(PaginationState::default())),
        }
    }

    pub fn state(&self) -> PaginationState {
        self.lock().clone()
    }

    pub fn loader_rows(&self) -> usize {
        self.lock().loader_rows()
    }

    /// Starts fetching the next page on the current runtime. Returns `None`
    /// when a fetch is already running, the listing is exhausted, the session
    /// was cancelled, or there is no runtime to spawn on.
    pub fn request_next_page(self: &Arc<Self>) -> Option<JoinHandle<FetchOutcome>> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "no runtime to fetch the next page on");
                return None;
            }
        };

        let (page, guard) = match self.begin() {
            Ok(begun) => begun,
            Err(reason) => {
                debug!(?reason, "next page request ignored");
                return None;
            }
        };

        // The guard moves into the task so an abort before its first poll
        // still returns the controller to `Idle`.
        let this = Arc::clone(self);
        Some(handle.spawn(async move { this.run(page, guard).await }))
    }

    /// Fetches the next page and its thumbnails, resolving when both settled.
    pub async fn fetch_next_page(&self) -> FetchOutcome {
        match self.begin() {
            Ok((page, guard)) => self.run(page, guard).await,
            Err(reason) => FetchOutcome::Skipped(reason),
        }
    }

    /// Clears the item list and the thumbnail cache and starts over from
    /// page 0. Refused while a fetch is running.
    pub fn reset(&self) -> bool {
        let mut state = self.lock();
        if state.in_flight() {
            return false;
        }
        *state = PaginationState::default();
        self.store.clear();
        self.prefetcher.cache().clear();
        true
    }

    fn begin(&self) -> Result<(u32, InFlightGuard), SkipReason> {
        if self.cancel.is_cancelled() {
            return Err(SkipReason::Cancelled);
        }

        let mut state = self.lock();
        if state.in_flight() {
            return Err(SkipReason::InFlight);
        }
        if !state.has_more() {
            return Err(SkipReason::Exhausted);
        }
        state.phase = Phase::Fetching;
        Ok((state.next_page, InFlightGuard(Arc::clone(&self.state))))
    }

    #[instrument(skip(self, guard))]
    async fn run(&self, page: u32, guard: InFlightGuard) -> FetchOutcome {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return FetchOutcome::Cancelled,
            result = self.listing.fetch_page(page) => result,
        };

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(e) => {
                drop(guard);
                warn!(error = %e, "listing fetch failed");
                self.notifier.on_alert(&e.to_string(), ALERT_TITLE_ERROR);
                return FetchOutcome::Failed(e);
            }
        };

        let total_pages = fetched.total_pages;
        let appended = self.store.append(fetched.items);
        let keys: Vec<ImageKey> = appended
            .iter()
            .filter_map(|item| item.image_key.clone())
            .collect();

        {
            let mut state = self.lock();
            state.total_pages = Some(total_pages);
            state.next_page = page.saturating_add(1);
            state.phase = Phase::Prefetching;
        }
        info!(
            items = appended.len(),
            images = keys.len(),
            total_pages,
            "page appended"
        );

        let batch = self.prefetcher.prefetch(keys, &self.cancel).await;
        if batch.cancelled {
            return FetchOutcome::Cancelled;
        }

        drop(guard);
        self.notifier.on_page_appended();

        FetchOutcome::Appended {
            page,
            appended: appended.len(),
            batch,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PaginationState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<PaginationState>) -> MutexGuard<'_, PaginationState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the controller to `Idle` however the fetch ends, including when
/// its future is dropped before it ever ran.
struct InFlightGuard(Arc<Mutex<PaginationState>>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock_state(&self.0).phase = Phase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ImageCache;
    use crate::http::HttpError;
    use crate::model::Item;
    use crate::prefetch::PrefetchConfig;
    use crate::testing::{page, png_bytes, MemoryImageFetcher, RecordingNotifier, StaticListing};
    use std::time::Duration;

    struct Fixture {
        listing: Arc<StaticListing>,
        fetcher: Arc<MemoryImageFetcher>,
        notifier: Arc<RecordingNotifier>,
        store: Arc<ItemStore>,
        cancel: CancellationToken,
        controller: Arc<PaginationController>,
    }

    fn fixture(listing: StaticListing, fetcher: MemoryImageFetcher) -> Fixture {
        let listing = Arc::new(listing);
        let fetcher = Arc::new(fetcher);
        let notifier = RecordingNotifier::new();
        let store = Arc::new(ItemStore::new());
        let cancel = CancellationToken::new();
        let prefetcher = Arc::new(ImagePrefetcher::new(
            Arc::new(ImageCache::new()),
            fetcher.clone(),
            PrefetchConfig::default(),
        ));
        let controller = Arc::new(PaginationController::new(
            listing.clone(),
            Arc::clone(&store),
            prefetcher,
            notifier.clone(),
            cancel.clone(),
        ));
        Fixture {
            listing,
            fetcher,
            notifier,
            store,
            cancel,
            controller,
        }
    }

    #[test]
    fn loader_rows_follow_total_pages() {
        let mut state = PaginationState::default();
        assert_eq!(state.loader_rows(), 1);

        state.total_pages = Some(3);
        state.next_page = 3;
        assert_eq!(state.loader_rows(), 1);

        state.next_page = 4;
        assert_eq!(state.loader_rows(), 0);
        assert!(!state.has_more());
    }

    #[tokio::test]
    async fn first_page_scenario() {
        let fetcher = MemoryImageFetcher::new();
        fetcher.insert("a.png", png_bytes(8, 8));
        let listing = StaticListing::new().with_page(page(
            0,
            3,
            vec![Item::new(1, "one", Some("a.png")), Item::new(2, "two", None)],
        ));
        let fx = fixture(listing, fetcher);

        let outcome = fx.controller.fetch_next_page().await;

        let FetchOutcome::Appended { page, appended, batch } = outcome else {
            panic!("expected the page to be appended");
        };
        assert_eq!(page, 0);
        assert_eq!(appended, 2);
        assert_eq!(batch.issued, 1);
        assert_eq!(fx.fetcher.call_count(), 1);
        assert_eq!(fx.fetcher.calls_for("a.png"), 1);

        let ids: Vec<_> = fx.store.snapshot().iter().map(|i| i.id.value()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(fx.controller.loader_rows(), 1);
        assert_eq!(fx.notifier.page_appended_count(), 1);
        assert!(fx.notifier.alerts().is_empty());

        let state = fx.controller.state();
        assert_eq!(state.next_page, 1);
        assert_eq!(state.total_pages, Some(3));
        assert_eq!(state.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn listing_error_alerts_and_keeps_page() {
        let listing = StaticListing::new().with_error(
            0,
            ListingError::Transport(HttpError::Connection {
                host: "example.com".into(),
                message: "offline".into(),
            }),
        );
        let fx = fixture(listing, MemoryImageFetcher::new());

        let outcome = fx.controller.fetch_next_page().await;
        assert!(matches!(outcome, FetchOutcome::Failed(_)));

        let state = fx.controller.state();
        assert!(!state.in_flight());
        assert_eq!(state.next_page, 0);
        assert_eq!(state.total_pages, None);

        let alerts = fx.notifier.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].1, "Error");
        assert!(alerts[0].0.contains("offline"));
        assert_eq!(fx.notifier.page_appended_count(), 0);

        // the same page is requested again on the next trigger
        fx.controller.fetch_next_page().await;
        assert_eq!(fx.listing.requested_pages(), vec![0, 0]);
    }

    #[tokio::test]
    async fn concurrent_requests_issue_one_listing_call() {
        let listing = StaticListing::gated().with_page(page(0, 1, vec![Item::new(1, "one", None)]));
        let fx = fixture(listing, MemoryImageFetcher::new());

        let first = fx.controller.request_next_page().expect("first request starts");
        assert!(fx.controller.request_next_page().is_none());
        assert!(matches!(
            fx.controller.fetch_next_page().await,
            FetchOutcome::Skipped(SkipReason::InFlight)
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.listing.call_count(), 1);

        fx.listing.open_gate();
        assert!(matches!(first.await.unwrap(), FetchOutcome::Appended { .. }));
        assert_eq!(fx.listing.max_concurrent(), 1);
        assert_eq!(fx.notifier.page_appended_count(), 1);
    }

    #[tokio::test]
    async fn stops_after_last_page() {
        let listing = StaticListing::new()
            .with_page(page(0, 1, vec![Item::new(1, "one", None)]))
            .with_page(page(1, 1, vec![Item::new(2, "two", None)]));
        let fx = fixture(listing, MemoryImageFetcher::new());

        assert!(matches!(fx.controller.fetch_next_page().await, FetchOutcome::Appended { .. }));
        assert!(matches!(fx.controller.fetch_next_page().await, FetchOutcome::Appended { .. }));
        assert_eq!(fx.controller.loader_rows(), 0);
        assert!(matches!(
            fx.controller.fetch_next_page().await,
            FetchOutcome::Skipped(SkipReason::Exhausted)
        ));
        assert_eq!(fx.listing.requested_pages(), vec![0, 1]);
        assert_eq!(fx.store.len(), 2);
    }

    #[tokio::test]
    async fn page_ready_fires_even_when_images_fail() {
        let listing = StaticListing::new().with_page(page(
            0,
            0,
            vec![Item::new(1, "one", Some("missing.png")), Item::new(2, "two", Some("also.png"))],
        ));
        let fx = fixture(listing, MemoryImageFetcher::new());

        let FetchOutcome::Appended { batch, .. } = fx.controller.fetch_next_page().await else {
            panic!("expected appended");
        };
        assert_eq!(batch.failed, 2);
        assert_eq!(fx.notifier.page_appended_count(), 1);
        assert!(fx.notifier.alerts().is_empty());
    }

    #[tokio::test]
    async fn cancellation_suppresses_page_ready() {
        let fetcher = MemoryImageFetcher::new().with_delay(Duration::from_secs(30));
        fetcher.insert("slow.png", png_bytes(2, 2));
        let listing = StaticListing::new()
            .with_page(page(0, 2, vec![Item::new(1, "one", Some("slow.png"))]));
        let fx = fixture(listing, fetcher);

        let task = fx.controller.request_next_page().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.controller.state().phase, Phase::Prefetching);

        fx.cancel.cancel();
        assert!(matches!(task.await.unwrap(), FetchOutcome::Cancelled));
        assert!(!fx.controller.state().in_flight());
        assert_eq!(fx.notifier.page_appended_count(), 0);
        assert!(fx.controller.request_next_page().is_none());
    }

    #[tokio::test]
    async fn reset_starts_over() {
        let fetcher = MemoryImageFetcher::new();
        fetcher.insert("a.png", png_bytes(2, 2));
        let listing =
            StaticListing::new().with_page(page(0, 0, vec![Item::new(1, "one", Some("a.png"))]));
        let fx = fixture(listing, fetcher);
        let cache = Arc::clone(fx.controller.prefetcher.cache());

        fx.controller.fetch_next_page().await;
        assert_eq!(fx.controller.loader_rows(), 0);
        assert_eq!(cache.len(), 1);

        assert!(fx.controller.reset());
        assert!(fx.store.is_empty());
        assert!(cache.is_empty());
        assert_eq!(fx.controller.state(), PaginationState::default());

        fx.controller.fetch_next_page().await;
        assert_eq!(fx.store.len(), 1);
        assert_eq!(fx.fetcher.calls_for("a.png"), 2);
    }

    #[tokio::test]
    async fn reset_is_refused_while_fetching() {
        let listing = StaticListing::gated().with_page(page(0, 0, vec![Item::new(1, "one", None)]));
        let fx = fixture(listing, MemoryImageFetcher::new());

        let task = fx.controller.request_next_page().unwrap();
        assert!(!fx.controller.reset());

        fx.listing.open_gate();
        assert!(matches!(task.await.unwrap(), FetchOutcome::Appended { .. }));
        assert!(fx.controller.reset());
    }

    #[tokio::test]
    async fn aborted_request_returns_to_idle() {
        let listing = StaticListing::new().with_page(page(0, 0, vec![Item::new(1, "one", None)]));
        let fx = fixture(listing, MemoryImageFetcher::new());

        // aborted before the task is ever polled
        let task = fx.controller.request_next_page().unwrap();
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert_eq!(fx.controller.state().phase, Phase::Idle);
        assert_eq!(fx.listing.call_count(), 0);
        assert!(matches!(
            fx.controller.fetch_next_page().await,
            FetchOutcome::Appended { page: 0, .. }
        ));
    }

    #[test]
    fn request_without_runtime_is_refused() {
        let fx = fixture(StaticListing::new(), MemoryImageFetcher::new());
        assert!(fx.controller.request_next_page().is_none());
        assert!(!fx.controller.state().in_flight());
    }
}
