//! In-memory implementations of the service and notifier traits.
//!
//! Used by this crate's tests and by shells that want a gallery without a
//! network (previews, UI tests).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::{ExtendedColorType, ImageBuffer, ImageEncoder, Rgba};
use tokio::sync::Semaphore;

use crate::http::HttpError;
use crate::model::{ImageKey, Item, Page};
use crate::notifier::{GalleryEvent, GalleryNotifier};
use crate::services::{
    ImageFetchError, ImageFetcher, ListingError, ListingService, UploadError, UploadRequest,
    UploadService,
};

/// Encodes a small gradient PNG.
pub fn png_bytes(width: u32, height: u32) -> Bytes {
    let img: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
    });
    let mut buffer = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut buffer);
    // Encoding an in-memory RGBA buffer of matching size cannot fail.
    if encoder
        .write_image(img.as_raw(), width, height, ExtendedColorType::Rgba8)
        .is_err()
    {
        buffer.clear();
    }
    Bytes::from(buffer)
}

pub fn page(index: u32, total_pages: u32, items: Vec<Item>) -> Page {
    Page {
        page_index: index,
        page_size: items.len() as u32,
        total_pages,
        total_elements: items.len() as u64,
        items,
    }
}

/// Tracks how many calls are running at once.
#[derive(Default)]
struct ConcurrencyGauge {
    current: AtomicUsize,
    max: AtomicUsize,
    total: AtomicUsize,
}

impl ConcurrencyGauge {
    fn enter(&self) -> GaugeGuard<'_> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        GaugeGuard(self)
    }
}

struct GaugeGuard<'a>(&'a ConcurrencyGauge);

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serves pages from a map; unknown pages fail with a 404.
pub struct StaticListing {
    pages: Mutex<HashMap<u32, Result<Page, ListingError>>>,
    gate: Option<Semaphore>,
    gauge: ConcurrencyGauge,
    requested: Mutex<Vec<u32>>,
}

impl StaticListing {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            gate: None,
            gauge: ConcurrencyGauge::default(),
            requested: Mutex::new(Vec::new()),
        }
    }

    /// Every call blocks until [`open_gate`](Self::open_gate).
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            // A closed semaphore fails every acquire immediately.
            gate.close();
        }
    }

    pub fn with_page(self, page: Page) -> Self {
        self.set_page(page.page_index, Ok(page));
        self
    }

    pub fn with_error(self, index: u32, error: ListingError) -> Self {
        self.set_page(index, Err(error));
        self
    }

    pub fn set_page(&self, index: u32, result: Result<Page, ListingError>) {
        self.pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index, result);
    }

    pub fn call_count(&self) -> usize {
        self.gauge.total.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.gauge.max.load(Ordering::SeqCst)
    }

    pub fn requested_pages(&self) -> Vec<u32> {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for StaticListing {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ListingService for StaticListing {
    async fn fetch_page(&self, page: u32) -> Result<Page, ListingError> {
        let _gauge = self.gauge.enter();
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(page);

        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }

        self.pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&page)
            .cloned()
            .unwrap_or_else(|| {
                Err(ListingError::Transport(HttpError::HttpStatus {
                    status: 404,
                    message: format!("page {page} not found"),
                }))
            })
    }
}

/// Serves image bytes from a map; unknown keys fail with a 404.
pub struct MemoryImageFetcher {
    images: Mutex<HashMap<String, Bytes>>,
    delay: Option<Duration>,
    gauge: ConcurrencyGauge,
    calls: Mutex<HashMap<String, usize>>,
}

impl MemoryImageFetcher {
    pub fn new() -> Self {
        Self {
            images: Mutex::new(HashMap::new()),
            delay: None,
            gauge: ConcurrencyGauge::default(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn insert(&self, key: &str, bytes: impl Into<Bytes>) {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), bytes.into());
    }

    pub fn call_count(&self) -> usize {
        self.gauge.total.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn max_concurrent(&self) -> usize {
        self.gauge.max.load(Ordering::SeqCst)
    }
}

impl Default for MemoryImageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageFetcher for MemoryImageFetcher {
    async fn fetch_bytes(&self, key: &ImageKey) -> Result<Bytes, ImageFetchError> {
        let _gauge = self.gauge.enter();
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.as_str().to_string())
            .or_default() += 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| {
                ImageFetchError::Transport(HttpError::HttpStatus {
                    status: 404,
                    message: format!("{key} not found"),
                })
            })
    }
}

/// Records upload requests and answers each with the configured response.
pub struct RecordingUploader {
    response: Mutex<Result<Bytes, UploadError>>,
    requests: Mutex<Vec<UploadRequest>>,
}

impl RecordingUploader {
    pub fn responding(body: impl Into<Bytes>) -> Self {
        Self {
            response: Mutex::new(Ok(body.into())),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: UploadError) -> Self {
        Self {
            response: Mutex::new(Err(error)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<UploadRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl UploadService for RecordingUploader {
    async fn upload(&self, request: UploadRequest) -> Result<Bytes, UploadError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        self.response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Captures notifier callbacks for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<GalleryEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<GalleryEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn page_appended_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, GalleryEvent::PageAppended))
            .count()
    }

    /// `(message, title)` pairs in arrival order.
    pub fn alerts(&self) -> Vec<(String, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                GalleryEvent::Alert { message, title } => Some((message, title)),
                GalleryEvent::PageAppended => None,
            })
            .collect()
    }
}

impl GalleryNotifier for RecordingNotifier {
    fn on_page_appended(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(GalleryEvent::PageAppended);
    }

    fn on_alert(&self, message: &str, title: &str) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(GalleryEvent::Alert {
                message: message.to_string(),
                title: title.to_string(),
            });
    }
}
