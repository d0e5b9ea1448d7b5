//! In-memory thumbnail cache.
//!
//! Presence of a key means the image was fetched and decoded successfully.
//! Failures are never recorded, so a missing key is always eligible for a
//! later fetch. Nothing here survives the process.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::Bytes;
use image::{DynamicImage, GenericImageView};
use lru::LruCache;

use crate::model::ImageKey;

/// A decoded thumbnail plus the bytes it was decoded from.
pub struct CachedImage {
    encoded: Bytes,
    image: DynamicImage,
}

impl CachedImage {
    pub fn new(encoded: Bytes, image: DynamicImage) -> Self {
        Self { encoded, image }
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn encoded(&self) -> &Bytes {
        &self.encoded
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

impl std::fmt::Debug for CachedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedImage")
            .field("encoded_len", &self.encoded.len())
            .field("dimensions", &self.dimensions())
            .finish()
    }
}

pub type ImageHandle = Arc<CachedImage>;

/// Keyed image storage shared by the prefetcher (writer) and the render path
/// (reader). Implementations must tolerate concurrent calls from both.
pub trait ImageStore: Send + Sync {
    fn get(&self, key: &ImageKey) -> Option<ImageHandle>;

    fn contains(&self, key: &ImageKey) -> bool {
        self.get(key).is_some()
    }

    /// Stores `image` unless the key is already present. Returns `true` if
    /// this call wrote the entry.
    fn put(&self, key: ImageKey, image: ImageHandle) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self);
}

/// Unbounded store. Entries live until `clear` or drop.
#[derive(Default)]
pub struct ImageCache {
    entries: RwLock<HashMap<ImageKey, ImageHandle>>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImageStore for ImageCache {
    fn get(&self, key: &ImageKey) -> Option<ImageHandle> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn contains(&self, key: &ImageKey) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    fn put(&self, key: ImageKey, image: ImageHandle) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, image);
        true
    }

    fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Capacity-bounded store; evicts the least recently read entry.
pub struct LruImageCache {
    entries: Mutex<LruCache<ImageKey, ImageHandle>>,
}

impl LruImageCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<ImageKey, ImageHandle>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ImageStore for LruImageCache {
    fn get(&self, key: &ImageKey) -> Option<ImageHandle> {
        self.lock().get(key).cloned()
    }

    // Presence checks come from the prefetcher and must not refresh recency.
    fn contains(&self, key: &ImageKey) -> bool {
        self.lock().contains(key)
    }

    fn put(&self, key: ImageKey, image: ImageHandle) -> bool {
        let mut entries = self.lock();
        if entries.contains(&key) {
            return false;
        }
        entries.put(key, image);
        true
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

/// Picks the store for an optional capacity bound.
pub fn image_store(capacity: Option<NonZeroUsize>) -> Arc<dyn ImageStore> {
    match capacity {
        Some(capacity) => Arc::new(LruImageCache::new(capacity)),
        None => Arc::new(ImageCache::new()),
    }
}
