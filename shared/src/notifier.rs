use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

pub const ALERT_TITLE_ERROR: &str = "Error";
pub const ALERT_TITLE_DATA: &str = "Data";

/// Callbacks into the presentation layer.
pub trait GalleryNotifier: Send + Sync {
    /// New rows are available; re-render the list.
    fn on_page_appended(&self);

    /// Show a modal message.
    fn on_alert(&self, message: &str, title: &str);
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GalleryEvent {
    PageAppended,
    Alert { message: String, title: String },
}

/// Forwards callbacks into a channel so the UI consumes them on one thread.
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<GalleryEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GalleryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: GalleryEvent) {
        if self.tx.send(event).is_err() {
            debug!("gallery event dropped, receiver closed");
        }
    }
}

impl GalleryNotifier for ChannelNotifier {
    fn on_page_appended(&self) {
        self.send(GalleryEvent::PageAppended);
    }

    fn on_alert(&self, message: &str, title: &str) {
        self.send(GalleryEvent::Alert {
            message: message.to_string(),
            title: title.to_string(),
        });
    }
}
