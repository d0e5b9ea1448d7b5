//! Remote collaborators the core consumes but does not implement.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::http::HttpError;
use crate::model::{ImageKey, ItemId, Page};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ListingError {
    #[error("{0}")]
    Transport(#[from] HttpError),

    #[error("listing response for page {page} could not be parsed: {reason}")]
    InvalidBody { page: u32, reason: String },
}

/// Per-item thumbnail failure. Absorbed by the prefetcher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImageFetchError {
    #[error("{0}")]
    Transport(#[from] HttpError),

    #[error("image '{key}' is not a fetchable URL: {reason}")]
    InvalidKey { key: String, reason: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("{0}")]
    Transport(#[from] HttpError),

    #[error("photo rejected: {reason}")]
    InvalidPhoto { reason: String },
}

/// Response body that is not UTF-8. Absorbed by the upload coordinator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("response body is not valid UTF-8 ({len} bytes)")]
pub struct DecodeError {
    pub len: usize,
}

/// A captured photo bound to a listing item, ready to post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub photo: Bytes,
    pub type_id: ItemId,
    pub uploader_name: String,
}

#[async_trait]
pub trait ListingService: Send + Sync {
    async fn fetch_page(&self, page: u32) -> Result<Page, ListingError>;
}

#[async_trait]
pub trait UploadService: Send + Sync {
    async fn upload(&self, request: UploadRequest) -> Result<Bytes, UploadError>;
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch_bytes(&self, key: &ImageKey) -> Result<Bytes, ImageFetchError>;
}
