use std::sync::Arc;

use shared::http::HttpError;
use shared::testing::{
    page, png_bytes, MemoryImageFetcher, RecordingNotifier, RecordingUploader, StaticListing,
};
use shared::{
    GalleryConfig, GallerySession, Item, ItemId, Photo, UploadError, UploadOutcome,
};

async fn listed_session(
    uploader: Arc<RecordingUploader>,
    notifier: Arc<RecordingNotifier>,
) -> GallerySession {
    let listing = StaticListing::new().with_page(page(
        0,
        0,
        vec![Item::new(11, "Cats", None), Item::new(12, "Dogs", None)],
    ));
    let config = GalleryConfig {
        uploader_name: "Jane Dev".into(),
        ..GalleryConfig::default()
    };
    let session = GallerySession::new(
        config,
        Arc::new(listing),
        uploader,
        Arc::new(MemoryImageFetcher::new()),
        notifier,
    )
    .unwrap();
    session.fetch_next_page().await;
    session
}

fn captured_photo() -> Photo {
    let capture = image::load_from_memory(&png_bytes(32, 24)).unwrap();
    Photo::from_image(&capture).unwrap()
}

#[tokio::test]
async fn picked_row_is_uploaded_with_configured_name() {
    let uploader = Arc::new(RecordingUploader::responding(r#"{"id":"42"}"#));
    let notifier = RecordingNotifier::new();
    let session = listed_session(uploader.clone(), notifier.clone()).await;

    // 1. Tap the second row, then capture
    assert_eq!(session.select_row(1), Some(ItemId(12)));
    let photo = captured_photo();
    let outcome = session.upload_photo(photo.clone()).await;

    // 2. One request carrying the JPEG, the item id and the uploader
    let requests = uploader.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].type_id, ItemId(12));
    assert_eq!(requests[0].uploader_name, "Jane Dev");
    assert_eq!(&requests[0].photo, photo.bytes());
    assert_eq!(&requests[0].photo[0..2], &[0xFF, 0xD8]);

    // 3. The response text is shown as-is
    assert_eq!(
        outcome,
        UploadOutcome::Delivered {
            item: ItemId(12),
            response: Some(r#"{"id":"42"}"#.into())
        }
    );
    assert_eq!(
        notifier.alerts(),
        vec![(r#"{"id":"42"}"#.to_string(), "Data".to_string())]
    );
    assert_eq!(session.selected(), None);
}

#[tokio::test]
async fn upload_without_selection_does_nothing() {
    let uploader = Arc::new(RecordingUploader::responding("ok"));
    let notifier = RecordingNotifier::new();
    let session = listed_session(uploader.clone(), notifier.clone()).await;
    let before = notifier.events().len();

    assert_eq!(
        session.upload_photo(captured_photo()).await,
        UploadOutcome::NoSelection
    );

    assert!(uploader.requests().is_empty());
    assert_eq!(notifier.events().len(), before);
}

#[tokio::test]
async fn cancelled_picker_keeps_nothing_selected() {
    let uploader = Arc::new(RecordingUploader::responding("ok"));
    let session = listed_session(uploader.clone(), RecordingNotifier::new()).await;

    session.select_row(0);
    session.cancel_selection();

    assert_eq!(
        session.upload_photo(captured_photo()).await,
        UploadOutcome::NoSelection
    );
    assert!(uploader.requests().is_empty());
}

#[tokio::test]
async fn server_failure_is_reported_as_error() {
    let uploader = Arc::new(RecordingUploader::failing(UploadError::Transport(
        HttpError::Timeout { timeout_ms: 30_000 },
    )));
    let notifier = RecordingNotifier::new();
    let session = listed_session(uploader, notifier.clone()).await;

    session.select_item(Some(ItemId(11)));
    let outcome = session.upload_photo(captured_photo()).await;

    assert!(matches!(
        outcome,
        UploadOutcome::Failed {
            item: ItemId(11),
            error: UploadError::Transport(HttpError::Timeout { .. })
        }
    ));
    assert_eq!(
        notifier.alerts(),
        vec![("timeout after 30000ms".to_string(), "Error".to_string())]
    );
}

#[tokio::test]
async fn upload_runs_on_a_spawned_task() {
    let uploader = Arc::new(RecordingUploader::responding("ok"));
    let notifier = RecordingNotifier::new();
    let session = listed_session(uploader.clone(), notifier.clone()).await;

    session.select_item(Some(ItemId(11)));
    let handle = tokio::spawn(session.upload_photo(captured_photo()));
    assert_eq!(session.selected(), None);

    assert!(matches!(
        handle.await.unwrap(),
        UploadOutcome::Delivered { item: ItemId(11), .. }
    ));
    assert_eq!(notifier.alerts(), vec![("ok".to_string(), "Data".to_string())]);
}
