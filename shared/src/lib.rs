#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod cache;
pub mod config;
pub mod http;
pub mod imaging;
pub mod model;
pub mod notifier;
pub mod pagination;
pub mod prefetch;
pub mod services;
pub mod session;
pub mod testing;
pub mod upload;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cache::{CachedImage, ImageCache, ImageHandle, ImageStore, LruImageCache};
pub use config::{ConfigError, GalleryConfig};
pub use http::{HttpError, HttpGalleryClient, ValidatedUrl};
pub use imaging::ImagingError;
pub use model::{ImageKey, Item, ItemId, ItemStore, Page};
pub use notifier::{ChannelNotifier, GalleryEvent, GalleryNotifier};
pub use pagination::{FetchOutcome, PaginationController, PaginationState, Phase, SkipReason};
pub use prefetch::{BatchReport, ImagePrefetcher, PrefetchConfig, PrefetchMetricsSnapshot};
pub use services::{
    DecodeError, ImageFetchError, ImageFetcher, ListingError, ListingService, UploadError,
    UploadRequest, UploadService,
};
pub use session::{GallerySession, PhotoRow, Thumbnail};
pub use upload::{Photo, UploadCoordinator, UploadOutcome};

pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_IMAGE_DIMENSION: u32 = 4096;
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 6;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    NotFound,
    Server,
    Validation,
    Deserialization,
    ImageProcessing,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::NotFound => "NOT_FOUND",
            Self::Server => "SERVER_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::ImageProcessing => "IMAGE_PROCESSING_ERROR",
        }
    }
}

/// Every error the crate can produce, for shells that want one type.
#[derive(Debug, Error)]
pub enum GalleryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Listing(#[from] ListingError),

    #[error(transparent)]
    ImageFetch(#[from] ImageFetchError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Imaging(#[from] ImagingError),
}

impl GalleryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GalleryError::Config(_) => ErrorKind::Validation,
            GalleryError::Http(e)
            | GalleryError::Listing(ListingError::Transport(e))
            | GalleryError::ImageFetch(ImageFetchError::Transport(e))
            | GalleryError::Upload(UploadError::Transport(e)) => http_kind(e),
            GalleryError::Listing(ListingError::InvalidBody { .. })
            | GalleryError::Decode(_) => ErrorKind::Deserialization,
            GalleryError::ImageFetch(ImageFetchError::InvalidKey { .. })
            | GalleryError::Upload(UploadError::InvalidPhoto { .. }) => ErrorKind::Validation,
            GalleryError::Imaging(_) => ErrorKind::ImageProcessing,
        }
    }
}

fn http_kind(error: &HttpError) -> ErrorKind {
    match error {
        HttpError::InvalidUrl { .. } | HttpError::Client { .. } => ErrorKind::Validation,
        HttpError::Connection { .. } => ErrorKind::Network,
        HttpError::Timeout { .. } => ErrorKind::Timeout,
        HttpError::HttpStatus { status: 404, .. } => ErrorKind::NotFound,
        HttpError::HttpStatus { status, .. } if *status >= 500 => ErrorKind::Server,
        HttpError::HttpStatus { .. } => ErrorKind::Validation,
        HttpError::ResponseTooLarge { .. } | HttpError::InvalidResponse { .. } => {
            ErrorKind::Deserialization
        }
    }
}
