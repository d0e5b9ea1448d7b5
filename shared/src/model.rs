use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tracing::warn;

/// Server-assigned item identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl ItemId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cache key for a thumbnail: the image URL exactly as the listing returned it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageKey(String);

impl ImageKey {
    /// Returns `None` for blank keys; the listing sends `""` as often as `null`.
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return None;
        }
        Some(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ImageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub display_name: String,
    pub image_key: Option<ImageKey>,
}

impl Item {
    pub fn new(id: i64, display_name: impl Into<String>, image_key: Option<&str>) -> Self {
        Self {
            id: ItemId(id),
            display_name: display_name.into(),
            image_key: image_key.and_then(ImageKey::new),
        }
    }
}

/// One listing response. Consumed by the pagination controller and dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page {
    pub page_index: u32,
    pub page_size: u32,
    pub total_pages: u32,
    pub total_elements: u64,
    pub items: Vec<Item>,
}

impl Page {
    pub fn from_json(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice::<PageBody>(body).map(Page::from)
    }

    pub fn image_keys(&self) -> impl Iterator<Item = &ImageKey> {
        self.items.iter().filter_map(|item| item.image_key.as_ref())
    }
}

// Wire shape of `GET <listing>?page=N`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageBody {
    page: u32,
    page_size: u32,
    total_pages: u32,
    total_elements: u64,
    #[serde(default)]
    content: Vec<ContentBody>,
}

#[derive(Deserialize)]
struct ContentBody {
    id: i64,
    name: String,
    #[serde(default)]
    image: Option<String>,
}

impl From<PageBody> for Page {
    fn from(body: PageBody) -> Self {
        Self {
            page_index: body.page,
            page_size: body.page_size,
            total_pages: body.total_pages,
            total_elements: body.total_elements,
            items: body
                .content
                .into_iter()
                .map(|c| Item {
                    id: ItemId(c.id),
                    display_name: c.name,
                    image_key: c.image.and_then(ImageKey::new),
                })
                .collect(),
        }
    }
}

#[derive(Default)]
struct StoreInner {
    items: Vec<Item>,
    ids: HashSet<ItemId>,
}

/// Append-only, arrival-ordered list of items for one session.
///
/// Written by the pagination controller, read concurrently by the render path.
#[derive(Default)]
pub struct ItemStore {
    inner: RwLock<StoreInner>,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends in order, dropping any item whose id is already stored.
    /// Returns the items that were actually appended.
    pub fn append(&self, items: Vec<Item>) -> Vec<Item> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut appended = Vec::with_capacity(items.len());

        for item in items {
            if !inner.ids.insert(item.id) {
                warn!(item_id = %item.id, "dropping duplicate item");
                continue;
            }
            inner.items.push(item.clone());
            appended.push(item);
        }

        appended
    }

    pub fn get(&self, index: usize) -> Option<Item> {
        self.read(|inner| inner.items.get(index).cloned())
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.read(|inner| inner.ids.contains(&id))
    }

    pub fn find(&self, id: ItemId) -> Option<Item> {
        self.read(|inner| inner.items.iter().find(|item| item.id == id).cloned())
    }

    pub fn len(&self) -> usize {
        self.read(|inner| inner.items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Item> {
        self.read(|inner| inner.items.clone())
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.items.clear();
        inner.ids.clear();
    }

    fn read<T>(&self, f: impl FnOnce(&StoreInner) -> T) -> T {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&inner)
    }
}
