//! Thumbnail Encoding
//!
//! The widget export needs small images it can hand to another process. The
//! host app may plug in a platform encoder; `ResizingEncoder` is the default.
//! Headers are read with `imagesize` so images already within bounds are
//! forwarded without decoding; larger ones are downscaled with `image` and
//! re-encoded as PNG.

use std::io::Cursor;

use bytes::Bytes;
use image::ImageFormat;
use imagesize::{ImageError, ImageType};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::ports::{Thumbnail, ThumbnailEncoder};
use crate::error::{Error, Result};

/// Dimensions and format read from an image header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    /// File extension for the detected format
    pub extension: String,
}

/// Probe an in-memory image without decoding it
pub fn probe(bytes: &[u8]) -> Result<ImageInfo> {
    let size = imagesize::blob_size(bytes).map_err(image_error)?;
    let kind = imagesize::image_type(bytes).map_err(image_error)?;
    Ok(ImageInfo {
        width: size.width as u32,
        height: size.height as u32,
        extension: extension_for(&kind).to_string(),
    })
}

fn extension_for(kind: &ImageType) -> &'static str {
    match kind {
        ImageType::Png => "png",
        ImageType::Jpeg => "jpg",
        ImageType::Gif => "gif",
        ImageType::Webp => "webp",
        ImageType::Bmp => "bmp",
        _ => "img",
    }
}

fn image_error(err: ImageError) -> Error {
    match err {
        ImageError::NotSupported => Error::storage("thumbnail", "unsupported image format"),
        ImageError::CorruptedImage => Error::storage("thumbnail", "corrupted image"),
        ImageError::IoError(e) => Error::Io(e),
    }
}

/// Encoder that downscales to fit within `max_dimension` on both sides,
/// keeping the aspect ratio
#[derive(Debug, Clone, Copy, Default)]
pub struct ResizingEncoder;

impl ThumbnailEncoder for ResizingEncoder {
    fn encode(&self, source: &[u8], max_dimension: u32) -> Result<Thumbnail> {
        if max_dimension == 0 {
            return Err(Error::Config("thumbnail max dimension must be positive".to_string()));
        }
        let info = probe(source)?;
        if info.width.max(info.height) <= max_dimension {
            return Ok(Thumbnail {
                bytes: Bytes::copy_from_slice(source),
                extension: info.extension,
            });
        }

        let decoded = image::load_from_memory(source).map_err(decode_error)?;
        let resized = decoded.thumbnail(max_dimension, max_dimension);
        debug!(
            width = info.width,
            height = info.height,
            resized_width = resized.width(),
            resized_height = resized.height(),
            "Image downscaled for thumbnail"
        );

        let mut encoded = Cursor::new(Vec::new());
        resized
            .write_to(&mut encoded, ImageFormat::Png)
            .map_err(decode_error)?;
        Ok(Thumbnail {
            bytes: Bytes::from(encoded.into_inner()),
            extension: "png".to_string(),
        })
    }
}

fn decode_error(err: image::ImageError) -> Error {
    Error::storage("thumbnail", err.to_string())
}

/// Minimal PNG header with the given dimensions
#[cfg(test)]
pub(crate) fn test_png(width: u32, height: u32) -> Vec<u8> {
    let mut png = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    png.extend_from_slice(&[0, 0, 0, 13]);
    png.extend_from_slice(b"IHDR");
    png.extend_from_slice(&width.to_be_bytes());
    png.extend_from_slice(&height.to_be_bytes());
    png.extend_from_slice(&[8, 6, 0, 0, 0, 0, 0, 0, 0]);
    png
}
