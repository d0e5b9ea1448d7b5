use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use image::DynamicImage;
use tracing::{debug, info, instrument, warn};

use crate::imaging::{self, ImagingError};
use crate::model::{ItemId, ItemStore};
use crate::notifier::{GalleryNotifier, ALERT_TITLE_DATA, ALERT_TITLE_ERROR};
use crate::services::{DecodeError, UploadError, UploadRequest, UploadService};

/// Captures are exported at full JPEG quality.
pub const UPLOAD_JPEG_QUALITY: u8 = 100;

/// JPEG bytes of a captured photo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Photo(Bytes);

impl Photo {
    pub fn from_jpeg(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn from_image(img: &DynamicImage) -> Result<Self, ImagingError> {
        imaging::encode_jpeg(img, UPLOAD_JPEG_QUALITY).map(|jpeg| Self(Bytes::from(jpeg)))
    }

    pub fn bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Nothing selected, or the selection no longer names a listed item.
    NoSelection,
    /// `response` is `None` when the body was not UTF-8.
    Delivered {
        item: ItemId,
        response: Option<String>,
    },
    Failed {
        item: ItemId,
        error: UploadError,
    },
}

pub struct UploadCoordinator {
    uploader: Arc<dyn UploadService>,
    store: Arc<ItemStore>,
    notifier: Arc<dyn GalleryNotifier>,
    max_photo_bytes: usize,
    selected: Mutex<Option<ItemId>>,
}

impl UploadCoordinator {
    pub fn new(
        uploader: Arc<dyn UploadService>,
        store: Arc<ItemStore>,
        notifier: Arc<dyn GalleryNotifier>,
        max_photo_bytes: usize,
    ) -> Self {
        Self {
            uploader,
            store,
            notifier,
            max_photo_bytes,
            selected: Mutex::new(None),
        }
    }

    pub fn select_item(&self, item: Option<ItemId>) {
        *self.selected.lock().unwrap_or_else(PoisonError::into_inner) = item;
    }

    /// Selects the item shown at `row`. Out-of-range rows clear the selection.
    pub fn select_row(&self, row: usize) -> Option<ItemId> {
        let item = self.store.get(row).map(|item| item.id);
        self.select_item(item);
        item
    }

    pub fn cancel_selection(&self) {
        self.select_item(None);
    }

    pub fn selected(&self) -> Option<ItemId> {
        *self.selected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the current selection immediately and returns the upload as a
    /// future. The selection is cleared whether or not the future is driven.
    pub fn upload_photo(
        self: &Arc<Self>,
        photo: Photo,
        uploader_name: &str,
    ) -> impl Future<Output = UploadOutcome> + Send + 'static {
        let selection = self.take_selection();
        let this = Arc::clone(self);
        let uploader_name = uploader_name.to_string();
        async move { this.deliver(selection, photo, uploader_name).await }
    }

    fn take_selection(&self) -> Option<ItemId> {
        self.selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    #[instrument(skip(self, photo, uploader_name), fields(photo_bytes = photo.len()))]
    async fn deliver(
        &self,
        selection: Option<ItemId>,
        photo: Photo,
        uploader_name: String,
    ) -> UploadOutcome {
        let Some(item) = selection else {
            debug!("upload ignored, no item selected");
            return UploadOutcome::NoSelection;
        };
        if !self.store.contains(item) {
            warn!(item_id = %item, "upload ignored, selected item is not listed");
            return UploadOutcome::NoSelection;
        }

        if let Err(error) = self.check_photo(&photo) {
            return self.fail(item, error);
        }

        let request = UploadRequest {
            photo: photo.into_bytes(),
            type_id: item,
            uploader_name,
        };

        match self.uploader.upload(request).await {
            Ok(body) => match decode_body(&body) {
                Ok(text) => {
                    info!(item_id = %item, "photo uploaded");
                    self.notifier.on_alert(&text, ALERT_TITLE_DATA);
                    UploadOutcome::Delivered {
                        item,
                        response: Some(text),
                    }
                }
                Err(e) => {
                    debug!(item_id = %item, error = %e, "upload response not shown");
                    UploadOutcome::Delivered {
                        item,
                        response: None,
                    }
                }
            },
            Err(error) => self.fail(item, error),
        }
    }

    fn check_photo(&self, photo: &Photo) -> Result<(), UploadError> {
        if photo.is_empty() {
            return Err(UploadError::InvalidPhoto {
                reason: "photo is empty".into(),
            });
        }
        if photo.len() > self.max_photo_bytes {
            return Err(UploadError::InvalidPhoto {
                reason: format!(
                    "{} bytes exceeds maximum of {} bytes",
                    photo.len(),
                    self.max_photo_bytes
                ),
            });
        }
        Ok(())
    }

    fn fail(&self, item: ItemId, error: UploadError) -> UploadOutcome {
        warn!(item_id = %item, error = %error, "photo upload failed");
        self.notifier.on_alert(&error.to_string(), ALERT_TITLE_ERROR);
        UploadOutcome::Failed { item, error }
    }
}

fn decode_body(body: &[u8]) -> Result<String, DecodeError> {
    std::str::from_utf8(body)
        .map(str::to_owned)
        .map_err(|_| DecodeError { len: body.len() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpError;
    use crate::model::Item;
    use crate::testing::{png_bytes, RecordingNotifier, RecordingUploader};

    fn coordinator(
        uploader: Arc<RecordingUploader>,
        notifier: Arc<RecordingNotifier>,
    ) -> Arc<UploadCoordinator> {
        let store = Arc::new(ItemStore::new());
        store.append(vec![Item::new(7, "seven", None), Item::new(9, "nine", None)]);
        Arc::new(UploadCoordinator::new(uploader, store, notifier, 1024))
    }

    fn jpeg() -> Photo {
        Photo::from_jpeg(vec![0xFF, 0xD8, 0xFF, 0xD9])
    }

    #[tokio::test]
    async fn no_selection_is_a_no_op() {
        let uploader = Arc::new(RecordingUploader::responding("ok"));
        let notifier = RecordingNotifier::new();
        let coordinator = coordinator(uploader.clone(), notifier.clone());

        let outcome = coordinator.upload_photo(jpeg(), "dev").await;

        assert_eq!(outcome, UploadOutcome::NoSelection);
        assert!(uploader.requests().is_empty());
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn success_shows_response_text() {
        let uploader = Arc::new(RecordingUploader::responding("ok"));
        let notifier = RecordingNotifier::new();
        let coordinator = coordinator(uploader.clone(), notifier.clone());

        coordinator.select_item(Some(ItemId(7)));
        let outcome = coordinator.upload_photo(jpeg(), "Jane Dev").await;

        assert_eq!(
            outcome,
            UploadOutcome::Delivered {
                item: ItemId(7),
                response: Some("ok".into())
            }
        );
        assert_eq!(notifier.alerts(), vec![("ok".to_string(), "Data".to_string())]);

        let requests = uploader.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].type_id, ItemId(7));
        assert_eq!(requests[0].uploader_name, "Jane Dev");
        assert_eq!(requests[0].photo, jpeg().into_bytes());
    }

    #[tokio::test]
    async fn selection_clears_when_upload_is_issued() {
        let uploader = Arc::new(RecordingUploader::responding("ok"));
        let notifier = RecordingNotifier::new();
        let coordinator = coordinator(uploader.clone(), notifier.clone());

        assert_eq!(coordinator.select_row(1), Some(ItemId(9)));
        let pending = coordinator.upload_photo(jpeg(), "dev");
        assert_eq!(coordinator.selected(), None);

        let outcome = pending.await;
        assert!(matches!(outcome, UploadOutcome::Delivered { item: ItemId(9), .. }));

        // a second upload without a new pick goes nowhere
        assert_eq!(coordinator.upload_photo(jpeg(), "dev").await, UploadOutcome::NoSelection);
        assert_eq!(uploader.requests().len(), 1);
    }

    #[tokio::test]
    async fn failure_alerts_with_error_title() {
        let uploader = Arc::new(RecordingUploader::failing(UploadError::Transport(
            HttpError::HttpStatus {
                status: 500,
                message: "server exploded".into(),
            },
        )));
        let notifier = RecordingNotifier::new();
        let coordinator = coordinator(uploader, notifier.clone());

        coordinator.select_item(Some(ItemId(9)));
        let outcome = coordinator.upload_photo(jpeg(), "dev").await;

        assert!(matches!(outcome, UploadOutcome::Failed { item: ItemId(9), .. }));
        let alerts = notifier.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].1, "Error");
        assert!(alerts[0].0.contains("server exploded"));
    }

    #[tokio::test]
    async fn non_utf8_response_shows_nothing() {
        let uploader = Arc::new(RecordingUploader::responding(vec![0xFF, 0xFE, 0xFD]));
        let notifier = RecordingNotifier::new();
        let coordinator = coordinator(uploader, notifier.clone());

        coordinator.select_item(Some(ItemId(7)));
        let outcome = coordinator.upload_photo(jpeg(), "dev").await;

        assert_eq!(
            outcome,
            UploadOutcome::Delivered {
                item: ItemId(7),
                response: None
            }
        );
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn invalid_photos_are_rejected_locally() {
        let uploader = Arc::new(RecordingUploader::responding("ok"));
        let notifier = RecordingNotifier::new();
        let coordinator = coordinator(uploader.clone(), notifier.clone());

        coordinator.select_item(Some(ItemId(7)));
        let empty = coordinator.upload_photo(Photo::from_jpeg(Vec::new()), "dev").await;
        assert!(matches!(
            empty,
            UploadOutcome::Failed {
                error: UploadError::InvalidPhoto { .. },
                ..
            }
        ));

        coordinator.select_item(Some(ItemId(7)));
        let huge = coordinator.upload_photo(Photo::from_jpeg(vec![0u8; 2048]), "dev").await;
        assert!(matches!(huge, UploadOutcome::Failed { .. }));

        assert!(uploader.requests().is_empty());
        assert_eq!(notifier.alerts().len(), 2);
    }

    #[tokio::test]
    async fn unknown_item_is_treated_as_no_selection() {
        let uploader = Arc::new(RecordingUploader::responding("ok"));
        let notifier = RecordingNotifier::new();
        let coordinator = coordinator(uploader.clone(), notifier);

        coordinator.select_item(Some(ItemId(404)));
        assert_eq!(coordinator.upload_photo(jpeg(), "dev").await, UploadOutcome::NoSelection);
        assert!(uploader.requests().is_empty());
    }

    #[test]
    fn out_of_range_row_clears_selection() {
        let coordinator = coordinator(
            Arc::new(RecordingUploader::responding("ok")),
            RecordingNotifier::new(),
        );
        coordinator.select_item(Some(ItemId(7)));
        assert_eq!(coordinator.select_row(5), None);
        assert_eq!(coordinator.selected(), None);
    }

    #[test]
    fn photo_from_image_is_jpeg() {
        let img = image::load_from_memory(&png_bytes(16, 16)).unwrap();
        let photo = Photo::from_image(&img).unwrap();
        assert_eq!(&photo.bytes()[0..2], &[0xFF, 0xD8]);
    }
}
