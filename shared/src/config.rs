use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::ValidatedUrl;
use crate::imaging::DecodeLimits;
use crate::prefetch::PrefetchConfig;

pub const DEFAULT_LISTING_URL: &str = "https://junior.balinasoft.com/api/v2/photo/type";
pub const DEFAULT_UPLOAD_URL: &str = "https://junior.balinasoft.com/api/v2/photo";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("configuration is not valid JSON: {0}")]
    Parse(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GalleryConfig {
    pub listing_url: String,
    pub upload_url: String,
    /// Sent as the `name` field of every upload.
    pub uploader_name: String,
    pub max_concurrent_fetches: usize,
    pub request_timeout_ms: u64,
    pub max_image_bytes: usize,
    pub max_image_dimension: u32,
    pub max_upload_bytes: usize,
    /// `None` keeps every thumbnail for the life of the session.
    pub cache_capacity: Option<usize>,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            listing_url: DEFAULT_LISTING_URL.to_string(),
            upload_url: DEFAULT_UPLOAD_URL.to_string(),
            uploader_name: String::new(),
            max_concurrent_fetches: crate::DEFAULT_MAX_CONCURRENT_FETCHES,
            request_timeout_ms: crate::DEFAULT_TIMEOUT_MS,
            max_image_bytes: crate::MAX_IMAGE_BYTES,
            max_image_dimension: crate::MAX_IMAGE_DIMENSION,
            max_upload_bytes: crate::MAX_UPLOAD_BYTES,
            cache_capacity: None,
        }
    }
}

impl GalleryConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ValidatedUrl::new(&self.listing_url)
            .map_err(|e| ConfigError::Validation(format!("listing_url: {e}")))?;
        ValidatedUrl::new(&self.upload_url)
            .map_err(|e| ConfigError::Validation(format!("upload_url: {e}")))?;

        if self.max_concurrent_fetches == 0 {
            return Err(ConfigError::Validation(
                "max_concurrent_fetches must be > 0".into(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "request_timeout_ms must be > 0".into(),
            ));
        }
        if self.request_timeout_ms > crate::MAX_TIMEOUT_MS {
            return Err(ConfigError::Validation(format!(
                "request_timeout_ms must be <= {}",
                crate::MAX_TIMEOUT_MS
            )));
        }
        if self.max_image_bytes == 0 {
            return Err(ConfigError::Validation("max_image_bytes must be > 0".into()));
        }
        if self.max_image_dimension == 0 {
            return Err(ConfigError::Validation(
                "max_image_dimension must be > 0".into(),
            ));
        }
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::Validation(
                "max_upload_bytes must be > 0".into(),
            ));
        }
        if self.cache_capacity == Some(0) {
            return Err(ConfigError::Validation(
                "cache_capacity must be > 0 when set".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cache_capacity(&self) -> Option<NonZeroUsize> {
        self.cache_capacity.and_then(NonZeroUsize::new)
    }

    pub fn decode_limits(&self) -> DecodeLimits {
        DecodeLimits {
            max_input_bytes: self.max_image_bytes,
            max_dimension: self.max_image_dimension,
            ..DecodeLimits::default()
        }
    }

    pub fn prefetch_config(&self) -> PrefetchConfig {
        PrefetchConfig {
            max_in_flight: self.max_concurrent_fetches,
            decode: self.decode_limits(),
        }
    }
}
