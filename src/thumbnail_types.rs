use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use image::codecs::gif::GifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::{DynamicImage, Frame, ImageFormat};

use crate::image_ref::ImageRef;

/// Fixed JPEG encode quality, matching the output of the legacy service.
const JPEG_QUALITY: u8 = 71;

/// The closed set of formats with both decode and encode support.
///
/// Requests for anything else are answered with the untouched original
/// instead of a hard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageCodec {
    Gif,
    Jpeg,
    Png,
}

impl ImageCodec {
    /// Maps a format guessed from file content to a supported codec.
    pub fn from_image_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Gif => Some(ImageCodec::Gif),
            ImageFormat::Jpeg => Some(ImageCodec::Jpeg),
            ImageFormat::Png => Some(ImageCodec::Png),
            _ => None,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "gif" => Some(ImageCodec::Gif),
            "jpg" | "jpeg" => Some(ImageCodec::Jpeg),
            "png" => Some(ImageCodec::Png),
            _ => None,
        }
    }

    /// Whether encoded output can carry an alpha channel.
    pub fn supports_alpha(self) -> bool {
        matches!(self, ImageCodec::Gif | ImageCodec::Png)
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ImageCodec::Gif => "image/gif",
            ImageCodec::Jpeg => "image/jpeg",
            ImageCodec::Png => "image/png",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ImageCodec::Gif => "gif",
            ImageCodec::Jpeg => "jpeg",
            ImageCodec::Png => "png",
        }
    }

    /// Encodes `image` into `buf` with this codec's fixed quality settings.
    pub fn encode_into(self, image: &DynamicImage, buf: &mut Vec<u8>) -> ThumbResult<()> {
        match self {
            ImageCodec::Gif => {
                let mut encoder = GifEncoder::new(&mut *buf);
                encoder.encode_frame(Frame::new(image.to_rgba8()))?;
            }
            ImageCodec::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut *buf, JPEG_QUALITY);
                image.write_with_encoder(encoder)?;
            }
            ImageCodec::Png => {
                let encoder = PngEncoder::new_with_quality(
                    &mut *buf,
                    CompressionType::Default,
                    PngFilterType::Adaptive,
                );
                image.write_with_encoder(encoder)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for ImageCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A request for a derivative of one original image.
///
/// Both dimensions absent means a full-size copy, still cached under the
/// regular naming scheme.
#[derive(Debug, Clone, Default)]
pub struct ThumbnailSpec {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub watermark: Option<PathBuf>,
}

/// Deterministic identity of a cached derivative.
///
/// The rendered filename `<stem>-<w>x<h>[-wm].<ext>` is a contract other
/// tooling may rely on for manual cache purges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub stem: String,
    pub width: u32,
    pub height: u32,
    pub watermarked: bool,
    pub extension: String,
}

impl CacheKey {
    pub fn new(stem: String, width: u32, height: u32, watermarked: bool, extension: String) -> Self {
        Self {
            stem,
            width,
            height,
            watermarked,
            extension,
        }
    }

    pub fn from_image(image: &ImageRef, width: u32, height: u32, watermarked: bool) -> Self {
        Self::new(
            image.stem().to_string(),
            width,
            height,
            watermarked,
            image.extension().to_string(),
        )
    }

    pub fn file_name(&self) -> String {
        if self.watermarked {
            format!(
                "{}-{}x{}-wm.{}",
                self.stem, self.width, self.height, self.extension
            )
        } else {
            format!("{}-{}x{}.{}", self.stem, self.width, self.height, self.extension)
        }
    }

    pub fn relative_path(&self, thumbnails_dir: &str) -> String {
        format!("{}/{}", thumbnails_dir, self.file_name())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_name())
    }
}

/// A generated or cached output, immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivative {
    /// Path under the image root, usable as a browser-facing src.
    pub relative_path: String,
    pub mod_time: SystemTime,
}

impl Derivative {
    pub fn new(relative_path: String, mod_time: SystemTime) -> Self {
        Self {
            relative_path,
            mod_time,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ThumbError {
    #[error("image not found: {0}")]
    NotFound(String),
    #[error("invalid image path: {0}")]
    InvalidPath(String),
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("image decode error: {0}")]
    Decode(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ThumbResult<T> = Result<T, ThumbError>;
