use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder, ImageReader, Limits};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("failed to decode image: {source}")]
    Decode {
        #[from]
        source: image::ImageError,
    },

    #[error("jpeg encoding failed: width={width}, height={height}, reason={reason}")]
    JpegEncode {
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("image too large: {width}x{height} = {pixels} pixels, max {max_pixels}")]
    ImageTooLarge {
        width: u32,
        height: u32,
        pixels: u64,
        max_pixels: u64,
    },

    #[error("input too large: {size} bytes, max {max_size}")]
    InputTooLarge { size: usize, max_size: usize },

    #[error("input bytes empty")]
    EmptyInput,

    #[error("unsupported image format")]
    UnsupportedFormat,
}

/// Bounds applied to every thumbnail before it reaches the cache.
#[derive(Clone, Debug)]
pub struct DecodeLimits {
    pub max_input_bytes: usize,
    pub max_dimension: u32,
    pub max_image_pixels: u64,
    pub max_alloc_bytes: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_input_bytes: crate::MAX_IMAGE_BYTES,
            max_dimension: crate::MAX_IMAGE_DIMENSION,
            max_image_pixels: 16_777_216,
            max_alloc_bytes: 256 * 1024 * 1024,
        }
    }
}

pub fn decode_image(limits: &DecodeLimits, raw_bytes: &[u8]) -> Result<DynamicImage, ImagingError> {
    if raw_bytes.is_empty() {
        return Err(ImagingError::EmptyInput);
    }

    if raw_bytes.len() > limits.max_input_bytes {
        return Err(ImagingError::InputTooLarge {
            size: raw_bytes.len(),
            max_size: limits.max_input_bytes,
        });
    }

    let mut reader = ImageReader::new(Cursor::new(raw_bytes))
        .with_guessed_format()
        .map_err(|e| ImagingError::Decode { source: e.into() })?;

    if reader.format().is_none() {
        return Err(ImagingError::UnsupportedFormat);
    }

    let mut decode_limits = Limits::default();
    decode_limits.max_image_width = Some(limits.max_dimension);
    decode_limits.max_image_height = Some(limits.max_dimension);
    decode_limits.max_alloc = Some(limits.max_alloc_bytes);
    reader.limits(decode_limits);

    let img = reader.decode()?;
    let (w, h) = img.dimensions();
    let pixels = u64::from(w) * u64::from(h);

    if pixels > limits.max_image_pixels {
        return Err(ImagingError::ImageTooLarge {
            width: w,
            height: h,
            pixels,
            max_pixels: limits.max_image_pixels,
        });
    }

    Ok(img)
}

/// JPEG-encodes a captured photo for upload. Alpha is dropped.
pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, ImagingError> {
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();

    if width == 0 || height == 0 {
        return Err(ImagingError::JpegEncode {
            width,
            height,
            reason: "zero dimension".into(),
        });
    }

    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));

    encoder
        .write_image(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)
        .map_err(|e| ImagingError::JpegEncode {
            width,
            height,
            reason: e.to_string(),
        })?;

    Ok(buffer)
}
