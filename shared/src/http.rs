//! reqwest-backed implementations of the listing, image and upload services.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::config::GalleryConfig;
use crate::model::{ImageKey, Page};
use crate::services::{
    ImageFetchError, ImageFetcher, ListingError, ListingService, UploadError, UploadRequest,
    UploadService,
};

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_LISTING_BODY_SIZE: usize = 4 * 1024 * 1024;
pub const MAX_UPLOAD_RESPONSE_SIZE: usize = 1024 * 1024;

const PHOTO_FIELD: &str = "photo";
const PHOTO_FILE_NAME: &str = "photo.jpg";
const PHOTO_MIME: &str = "image/jpeg";
const TYPE_ID_FIELD: &str = "typeId";
const NAME_FIELD: &str = "name";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("HTTP client could not be built: {reason}")]
    Client { reason: String },

    #[error("connection failed to {host}: {message}")]
    Connection { host: String, message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("response body too large: {size} bytes exceeds maximum of {max} bytes")]
    ResponseTooLarge { size: usize, max: usize },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },
}

impl HttpError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, HttpError::HttpStatus { status, .. } if (400..500).contains(status))
    }
}

/// An absolute http(s) URL with a host and no embedded credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValidatedUrl {
    url: Url,
    host: String,
}

impl ValidatedUrl {
    pub fn new(url: impl AsRef<str>) -> Result<Self, HttpError> {
        let raw = url.as_ref();
        let invalid = |reason: String| HttpError::InvalidUrl {
            url: truncate_url(raw),
            reason,
        };

        if raw.trim().is_empty() {
            return Err(invalid("URL cannot be empty".into()));
        }
        if raw.len() > MAX_URL_LENGTH {
            return Err(invalid(format!(
                "URL exceeds maximum length of {MAX_URL_LENGTH} bytes"
            )));
        }

        let parsed = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(invalid(format!(
                    "invalid scheme '{other}', only 'http' and 'https' are allowed"
                )))
            }
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| invalid("URL must have a host".into()))?
            .to_lowercase();

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(invalid("credentials in URL are not allowed".into()));
        }

        Ok(Self { url: parsed, host })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn as_url(&self) -> &Url {
        &self.url
    }

    /// Copy of this URL with `key=value` appended to the query.
    pub fn with_query(&self, key: &str, value: &str) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair(key, value);
        url
    }
}

impl std::fmt::Display for ValidatedUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn truncate_url(url: &str) -> String {
    match url.char_indices().nth(100) {
        Some((cut, _)) => format!("{}...", &url[..cut]),
        None => url.to_string(),
    }
}

/// Talks to the gallery backend. Cheap to clone; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct HttpGalleryClient {
    client: Client,
    listing_url: ValidatedUrl,
    upload_url: ValidatedUrl,
    timeout_ms: u64,
    max_image_bytes: usize,
}

impl HttpGalleryClient {
    pub fn new(
        listing_url: ValidatedUrl,
        upload_url: ValidatedUrl,
        timeout: Duration,
        max_image_bytes: usize,
    ) -> Result<Self, HttpError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::Client {
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            listing_url,
            upload_url,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            max_image_bytes,
        })
    }

    pub fn from_config(config: &GalleryConfig) -> Result<Self, HttpError> {
        Self::new(
            ValidatedUrl::new(&config.listing_url)?,
            ValidatedUrl::new(&config.upload_url)?,
            config.request_timeout(),
            config.max_image_bytes,
        )
    }

    pub fn page_url(&self, page: u32) -> Url {
        self.listing_url.with_query("page", &page.to_string())
    }

    fn transport_error(&self, error: &reqwest::Error) -> HttpError {
        if error.is_timeout() {
            return HttpError::Timeout {
                timeout_ms: self.timeout_ms,
            };
        }
        if let Some(status) = error.status() {
            return status_error(status);
        }
        if error.is_decode() || error.is_body() {
            return HttpError::InvalidResponse {
                reason: error.to_string(),
            };
        }
        HttpError::Connection {
            host: error
                .url()
                .and_then(Url::host_str)
                .unwrap_or_default()
                .to_string(),
            message: error.to_string(),
        }
    }

    async fn get_limited(&self, url: Url, max: usize) -> Result<Bytes, HttpError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;
        self.read_body(response, max).await
    }

    /// Reads a successful response body, failing once it grows past `max`.
    async fn read_body(&self, mut response: Response, max: usize) -> Result<Bytes, HttpError> {
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        if let Some(declared) = response.content_length() {
            let declared = usize::try_from(declared).unwrap_or(usize::MAX);
            if declared > max {
                return Err(HttpError::ResponseTooLarge {
                    size: declared,
                    max,
                });
            }
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.transport_error(&e))?
        {
            let size = body.len() + chunk.len();
            if size > max {
                return Err(HttpError::ResponseTooLarge { size, max });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

fn status_error(status: StatusCode) -> HttpError {
    HttpError::HttpStatus {
        status: status.as_u16(),
        message: status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string(),
    }
}

#[async_trait]
impl ListingService for HttpGalleryClient {
    #[instrument(skip(self))]
    async fn fetch_page(&self, page: u32) -> Result<Page, ListingError> {
        let body = self
            .get_limited(self.page_url(page), MAX_LISTING_BODY_SIZE)
            .await?;
        debug!(bytes = body.len(), "listing page received");
        Page::from_json(&body).map_err(|e| ListingError::InvalidBody {
            page,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl ImageFetcher for HttpGalleryClient {
    async fn fetch_bytes(&self, key: &ImageKey) -> Result<Bytes, ImageFetchError> {
        let url = ValidatedUrl::new(key.as_str()).map_err(|e| ImageFetchError::InvalidKey {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(self
            .get_limited(url.as_url().clone(), self.max_image_bytes)
            .await?)
    }
}

#[async_trait]
impl UploadService for HttpGalleryClient {
    #[instrument(skip(self, request), fields(type_id = %request.type_id, photo_bytes = request.photo.len()))]
    async fn upload(&self, request: UploadRequest) -> Result<Bytes, UploadError> {
        let photo = Part::bytes(request.photo.to_vec())
            .file_name(PHOTO_FILE_NAME)
            .mime_str(PHOTO_MIME)
            .map_err(|e| UploadError::InvalidPhoto {
                reason: e.to_string(),
            })?;
        let form = Form::new()
            .part(PHOTO_FIELD, photo)
            .text(TYPE_ID_FIELD, request.type_id.to_string())
            .text(NAME_FIELD, request.uploader_name);

        let response = self
            .client
            .post(self.upload_url.as_url().clone())
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;
        Ok(self.read_body(response, MAX_UPLOAD_RESPONSE_SIZE).await?)
    }
}
