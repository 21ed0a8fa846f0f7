use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};
use log::debug;

use crate::config::Config;
use crate::image_ref::ImageRef;
use crate::thumbnail_types::{
    CacheKey, Derivative, ImageCodec, ThumbError, ThumbResult, ThumbnailSpec,
};

/// Generates thumbnails on demand and caches them on disk.
///
/// Derivatives are written under `<root>/<thumbnails_dir>/` and reused as
/// long as they are at least as new as their original. Disk is the only
/// cache; no state is retained between requests.
#[derive(Clone)]
pub struct ThumbnailGenerator {
    root_path: PathBuf,
    thumbnails_dir: String,
}

impl ThumbnailGenerator {
    pub fn new(config: &Config) -> Self {
        Self {
            root_path: PathBuf::from(&config.root_path),
            thumbnails_dir: config.thumbnails_dir.clone(),
        }
    }

    /// Returns a fresh cached derivative or generates a new one.
    ///
    /// Originals in a format outside the supported codec set are answered
    /// with the untouched original reference instead of an error.
    pub fn get_or_generate(
        &self,
        image: &ImageRef,
        spec: &ThumbnailSpec,
    ) -> ThumbResult<Derivative> {
        // Fast path: fully specified request, resolvable without a decode.
        if let (Some(width), Some(height)) = (spec.width, spec.height) {
            let key = CacheKey::from_image(image, width, height, spec.watermark.is_some());
            if let Some(derivative) = self.fresh_derivative(image, &key)? {
                debug!("Cache hit for {}", key);
                return Ok(derivative);
            }
        }

        let reader = ImageReader::open(image.full_path())?.with_guessed_format()?;
        let codec = match reader.format().and_then(ImageCodec::from_image_format) {
            Some(codec) => codec,
            None => {
                debug!(
                    "Unsupported source format for {}, serving original",
                    image.relative_path()
                );
                return self.original(image);
            }
        };
        let (original_width, original_height) = reader.into_dimensions()?;

        let (width, height) = resolve_dimensions(
            spec.width,
            spec.height,
            original_width,
            original_height,
        );

        // The resolved size may already exist under a different requested
        // combination, so check freshness again before decoding.
        let key = CacheKey::from_image(image, width, height, spec.watermark.is_some());
        if let Some(derivative) = self.fresh_derivative(image, &key)? {
            debug!("Cache hit for {} after dimension resolution", key);
            return Ok(derivative);
        }

        debug!("Cache miss for {}, generating thumbnail", key);
        self.generate(
            image,
            spec,
            codec,
            (original_width, original_height),
            (width, height),
            &key,
        )
    }

    /// A derivative pointing straight at the original file, bypassing any
    /// resizing.
    pub fn original(&self, image: &ImageRef) -> ThumbResult<Derivative> {
        Ok(Derivative::new(
            image.relative_path().to_string(),
            image.mod_time()?,
        ))
    }

    /// Caller-facing src with a cache-busting suffix.
    ///
    /// Busts on the ORIGINAL's mtime, so edits to the source invalidate
    /// browser caches even while the derivative itself is still stale.
    pub fn reference_for(&self, image: &ImageRef, derivative: &Derivative) -> ThumbResult<String> {
        let timestamp = unix_seconds(image.mod_time()?);
        Ok(format!("{}?t={}", derivative.relative_path, timestamp))
    }

    /// Returns the cached derivative for `key` when it exists and is at
    /// least as new as the original.
    fn fresh_derivative(
        &self,
        image: &ImageRef,
        key: &CacheKey,
    ) -> ThumbResult<Option<Derivative>> {
        let relative = key.relative_path(&self.thumbnails_dir);
        let absolute = self.root_path.join(&relative);

        let metadata = match fs::metadata(&absolute) {
            Ok(metadata) => metadata,
            Err(_) => return Ok(None),
        };
        let derivative_mtime = metadata.modified()?;
        if derivative_mtime >= image.mod_time()? {
            Ok(Some(Derivative::new(relative, derivative_mtime)))
        } else {
            Ok(None)
        }
    }

    fn generate(
        &self,
        image: &ImageRef,
        spec: &ThumbnailSpec,
        codec: ImageCodec,
        (original_width, original_height): (u32, u32),
        (width, height): (u32, u32),
        key: &CacheKey,
    ) -> ThumbResult<Derivative> {
        let decoded = ImageReader::open(image.full_path())?
            .with_guessed_format()?
            .decode()?;
        let resized = decoded.resize_exact(width, height, FilterType::Lanczos3);

        let canvas = match &spec.watermark {
            Some(watermark_path) => {
                let scale_x = width as f64 / original_width as f64;
                let scale_y = height as f64 / original_height as f64;
                composite_watermark(resized, watermark_path, scale_x, scale_y)?
            }
            None => resized,
        };

        // JPEG output cannot carry an alpha channel.
        let canvas = if codec.supports_alpha() {
            canvas
        } else {
            DynamicImage::ImageRgb8(canvas.to_rgb8())
        };

        let mut encoded = Vec::new();
        codec.encode_into(&canvas, &mut encoded)?;

        let relative = key.relative_path(&self.thumbnails_dir);
        let destination = self.root_path.join(&relative);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write through a temp file so readers never observe a torn
        // thumbnail.
        let temp_path = destination.with_extension(format!("tmp.{}", key.extension));
        fs::write(&temp_path, &encoded)?;
        if let Err(e) = fs::rename(&temp_path, &destination) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        let mod_time = fs::metadata(&destination)?.modified()?;
        debug!("Saved thumbnail {:?}", destination);
        Ok(Derivative::new(relative, mod_time))
    }
}

/// Derives missing dimensions from the original's aspect ratio,
/// truncating toward zero. Both missing means a full-size copy.
fn resolve_dimensions(
    width: Option<u32>,
    height: Option<u32>,
    original_width: u32,
    original_height: u32,
) -> (u32, u32) {
    let ratio = original_width as f64 / original_height as f64;
    match (width, height) {
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, (w as f64 / ratio) as u32),
        (None, Some(h)) => ((h as f64 * ratio) as u32, h),
        (None, None) => (original_width, original_height),
    }
}

/// Scales the watermark by the same per-axis ratio as the main image and
/// composites it with its bottom-right corner on the canvas's bottom-right
/// corner.
fn composite_watermark(
    resized: DynamicImage,
    watermark_path: &Path,
    scale_x: f64,
    scale_y: f64,
) -> ThumbResult<DynamicImage> {
    let reader = ImageReader::open(watermark_path)?.with_guessed_format()?;
    let codec = reader.format().and_then(ImageCodec::from_image_format);
    if !codec.is_some_and(ImageCodec::supports_alpha) {
        return Err(ThumbError::UnsupportedFormat(format!(
            "watermark {} must be an alpha-capable format",
            watermark_path.display()
        )));
    }

    let watermark = reader.decode()?;
    let (watermark_width, watermark_height) = watermark.dimensions();
    let scaled_width = (watermark_width as f64 * scale_x) as u32;
    let scaled_height = (watermark_height as f64 * scale_y) as u32;

    let mut canvas = resized.into_rgba8();
    if scaled_width == 0 || scaled_height == 0 {
        return Ok(DynamicImage::ImageRgba8(canvas));
    }

    let scaled = watermark
        .resize_exact(scaled_width, scaled_height, FilterType::Lanczos3)
        .into_rgba8();
    let x = i64::from(canvas.width()) - i64::from(scaled_width);
    let y = i64::from(canvas.height()) - i64::from(scaled_height);
    image::imageops::overlay(&mut canvas, &scaled, x, y);

    Ok(DynamicImage::ImageRgba8(canvas))
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, Rgba};
    use std::thread::sleep;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(root: &Path) -> Config {
        Config {
            port: 8080,
            host: "localhost".to_string(),
            root_path: root.to_string_lossy().to_string(),
            thumbnails_dir: "thumbnails".to_string(),
            watermark_path: None,
            min_dimension: 100,
            max_dimension: 500,
        }
    }

    fn write_rgb_image(path: &Path, width: u32, height: u32, color: Rgb<u8>) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(width, height, color);
        img.save(path).unwrap();
    }

    fn write_rgba_image(path: &Path, width: u32, height: u32, color: Rgba<u8>) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let img: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::from_pixel(width, height, color);
        img.save(path).unwrap();
    }

    fn setup() -> (TempDir, ThumbnailGenerator) {
        let temp_dir = TempDir::new().unwrap();
        let generator = ThumbnailGenerator::new(&test_config(temp_dir.path()));
        (temp_dir, generator)
    }

    #[test]
    fn test_resolve_dimensions() {
        // 400x200 original, ratio 2.0
        assert_eq!(resolve_dimensions(Some(100), None, 400, 200), (100, 50));
        assert_eq!(resolve_dimensions(None, Some(300), 400, 200), (600, 300));
        assert_eq!(resolve_dimensions(Some(120), Some(80), 400, 200), (120, 80));
        assert_eq!(resolve_dimensions(None, None, 400, 200), (400, 200));
        // Derived dimensions truncate toward zero.
        assert_eq!(resolve_dimensions(Some(100), None, 300, 200), (100, 66));
    }

    #[test]
    fn test_generates_thumbnail_at_contract_path() {
        let (temp_dir, generator) = setup();
        write_rgb_image(&temp_dir.path().join("photo.jpg"), 400, 200, Rgb([200, 30, 30]));

        let image = ImageRef::resolve(temp_dir.path(), "photo.jpg").unwrap();
        let spec = ThumbnailSpec {
            width: Some(100),
            ..Default::default()
        };

        let derivative = generator.get_or_generate(&image, &spec).unwrap();
        assert_eq!(derivative.relative_path, "thumbnails/photo-100x50.jpg");

        let thumb_path = temp_dir.path().join("thumbnails/photo-100x50.jpg");
        assert!(thumb_path.exists());
        let thumb = image::open(&thumb_path).unwrap();
        assert_eq!(thumb.dimensions(), (100, 50));
    }

    #[test]
    fn test_height_only_derives_width() {
        let (temp_dir, generator) = setup();
        write_rgb_image(&temp_dir.path().join("photo.jpg"), 400, 200, Rgb([10, 10, 10]));

        let image = ImageRef::resolve(temp_dir.path(), "photo.jpg").unwrap();
        let spec = ThumbnailSpec {
            height: Some(300),
            ..Default::default()
        };

        let derivative = generator.get_or_generate(&image, &spec).unwrap();
        assert_eq!(derivative.relative_path, "thumbnails/photo-600x300.jpg");
    }

    #[test]
    fn test_no_dimensions_produces_full_size_copy() {
        let (temp_dir, generator) = setup();
        write_rgb_image(&temp_dir.path().join("pic.png"), 40, 20, Rgb([0, 200, 0]));

        let image = ImageRef::resolve(temp_dir.path(), "pic.png").unwrap();
        let derivative = generator
            .get_or_generate(&image, &ThumbnailSpec::default())
            .unwrap();

        assert_eq!(derivative.relative_path, "thumbnails/pic-40x20.png");
        let thumb = image::open(temp_dir.path().join("thumbnails/pic-40x20.png")).unwrap();
        assert_eq!(thumb.dimensions(), (40, 20));
    }

    #[test]
    fn test_fresh_derivative_is_reused() {
        let (temp_dir, generator) = setup();
        write_rgb_image(&temp_dir.path().join("photo.jpg"), 400, 200, Rgb([5, 5, 5]));

        let image = ImageRef::resolve(temp_dir.path(), "photo.jpg").unwrap();
        let spec = ThumbnailSpec {
            width: Some(100),
            height: Some(50),
            ..Default::default()
        };

        let first = generator.get_or_generate(&image, &spec).unwrap();
        let second = generator.get_or_generate(&image, &spec).unwrap();

        // Same file, no rewrite: mtime and path are unchanged.
        assert_eq!(first, second);

        let first_ref = generator.reference_for(&image, &first).unwrap();
        let second_ref = generator.reference_for(&image, &second).unwrap();
        assert_eq!(first_ref, second_ref);
    }

    #[test]
    fn test_stale_derivative_is_regenerated() {
        let (temp_dir, generator) = setup();
        let original_path = temp_dir.path().join("photo.jpg");
        write_rgb_image(&original_path, 400, 200, Rgb([5, 5, 5]));

        let image = ImageRef::resolve(temp_dir.path(), "photo.jpg").unwrap();
        let spec = ThumbnailSpec {
            width: Some(100),
            height: Some(50),
            ..Default::default()
        };

        let first = generator.get_or_generate(&image, &spec).unwrap();

        // Make the original strictly newer than the derivative, with margin
        // for coarse filesystem mtime granularity.
        sleep(Duration::from_millis(1100));
        write_rgb_image(&original_path, 400, 200, Rgb([250, 250, 250]));

        let second = generator.get_or_generate(&image, &spec).unwrap();
        assert_eq!(first.relative_path, second.relative_path);
        assert!(second.mod_time > first.mod_time);
    }

    #[test]
    fn test_unsupported_format_falls_back_to_original() {
        let (temp_dir, generator) = setup();
        // Valid BMP magic, unsupported codec.
        fs::write(temp_dir.path().join("logo.bmp"), b"BM\x00\x00\x00\x00junk").unwrap();

        let image = ImageRef::resolve(temp_dir.path(), "logo.bmp").unwrap();
        let spec = ThumbnailSpec {
            width: Some(100),
            height: Some(100),
            ..Default::default()
        };

        let derivative = generator.get_or_generate(&image, &spec).unwrap();
        assert_eq!(derivative.relative_path, "logo.bmp");
        assert!(!temp_dir.path().join("thumbnails").exists());
    }

    #[test]
    fn test_corrupt_supported_format_is_an_error() {
        let (temp_dir, generator) = setup();
        // PNG magic followed by garbage.
        fs::write(
            temp_dir.path().join("broken.png"),
            b"\x89PNG\r\n\x1a\njunkjunkjunk",
        )
        .unwrap();

        let image = ImageRef::resolve(temp_dir.path(), "broken.png").unwrap();
        let result = generator.get_or_generate(&image, &ThumbnailSpec::default());
        assert!(matches!(result, Err(ThumbError::Decode(_))));
    }

    #[test]
    fn test_watermark_scaled_into_bottom_right_corner() {
        let (temp_dir, generator) = setup();
        write_rgb_image(&temp_dir.path().join("big.png"), 1000, 1000, Rgb([220, 20, 20]));
        let watermark_path = temp_dir.path().join("watermark.png");
        write_rgba_image(&watermark_path, 100, 100, Rgba([20, 20, 220, 255]));

        let image = ImageRef::resolve(temp_dir.path(), "big.png").unwrap();
        let spec = ThumbnailSpec {
            width: Some(500),
            height: Some(500),
            watermark: Some(watermark_path.clone()),
        };

        let derivative = generator.get_or_generate(&image, &spec).unwrap();
        assert_eq!(derivative.relative_path, "thumbnails/big-500x500-wm.png");

        // 100x100 watermark at half scale covers (450,450)..(500,500).
        let thumb = image::open(temp_dir.path().join("thumbnails/big-500x500-wm.png"))
            .unwrap()
            .into_rgba8();
        assert_eq!(thumb.dimensions(), (500, 500));
        let inside = thumb.get_pixel(475, 475);
        assert!(inside[2] > 150 && inside[0] < 80, "expected watermark at (475,475)");
        let outside = thumb.get_pixel(100, 100);
        assert!(outside[0] > 150 && outside[2] < 80, "expected base image at (100,100)");

        // Quarter scale places a 25x25 watermark at (225,225)..(250,250).
        let spec = ThumbnailSpec {
            width: Some(250),
            height: Some(250),
            watermark: Some(watermark_path),
        };
        let derivative = generator.get_or_generate(&image, &spec).unwrap();
        assert_eq!(derivative.relative_path, "thumbnails/big-250x250-wm.png");

        let thumb = image::open(temp_dir.path().join("thumbnails/big-250x250-wm.png"))
            .unwrap()
            .into_rgba8();
        let inside = thumb.get_pixel(240, 240);
        assert!(inside[2] > 150 && inside[0] < 80, "expected watermark at (240,240)");
        let outside = thumb.get_pixel(120, 120);
        assert!(outside[0] > 150 && outside[2] < 80, "expected base image at (120,120)");
    }

    #[test]
    fn test_watermark_must_be_alpha_capable() {
        let (temp_dir, generator) = setup();
        write_rgb_image(&temp_dir.path().join("photo.png"), 200, 200, Rgb([0, 0, 0]));
        let watermark_path = temp_dir.path().join("watermark.jpg");
        write_rgb_image(&watermark_path, 50, 50, Rgb([255, 255, 255]));

        let image = ImageRef::resolve(temp_dir.path(), "photo.png").unwrap();
        let spec = ThumbnailSpec {
            width: Some(100),
            height: Some(100),
            watermark: Some(watermark_path),
        };

        let result = generator.get_or_generate(&image, &spec);
        assert!(matches!(result, Err(ThumbError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_png_transparency_preserved() {
        let (temp_dir, generator) = setup();
        write_rgba_image(&temp_dir.path().join("clear.png"), 10, 10, Rgba([0, 0, 0, 0]));

        let image = ImageRef::resolve(temp_dir.path(), "clear.png").unwrap();
        let spec = ThumbnailSpec {
            width: Some(5),
            height: Some(5),
            ..Default::default()
        };

        generator.get_or_generate(&image, &spec).unwrap();
        let thumb = image::open(temp_dir.path().join("thumbnails/clear-5x5.png"))
            .unwrap()
            .into_rgba8();
        assert_eq!(thumb.get_pixel(2, 2)[3], 0);
    }

    #[test]
    fn test_reference_carries_original_mtime() {
        let (temp_dir, generator) = setup();
        write_rgb_image(&temp_dir.path().join("photo.jpg"), 400, 200, Rgb([1, 2, 3]));

        let image = ImageRef::resolve(temp_dir.path(), "photo.jpg").unwrap();
        let spec = ThumbnailSpec {
            width: Some(100),
            height: Some(50),
            ..Default::default()
        };

        let derivative = generator.get_or_generate(&image, &spec).unwrap();
        let reference = generator.reference_for(&image, &derivative).unwrap();

        let expected = unix_seconds(image.mod_time().unwrap());
        assert_eq!(
            reference,
            format!("thumbnails/photo-100x50.jpg?t={}", expected)
        );
    }

    #[test]
    fn test_original_bypasses_resizing() {
        let (temp_dir, generator) = setup();
        write_rgb_image(&temp_dir.path().join("photo.jpg"), 400, 200, Rgb([1, 2, 3]));

        let image = ImageRef::resolve(temp_dir.path(), "photo.jpg").unwrap();
        let derivative = generator.original(&image).unwrap();

        assert_eq!(derivative.relative_path, "photo.jpg");
        assert_eq!(derivative.mod_time, image.mod_time().unwrap());
        assert!(!temp_dir.path().join("thumbnails").exists());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let (temp_dir, generator) = setup();
        write_rgb_image(&temp_dir.path().join("photo.jpg"), 400, 200, Rgb([9, 9, 9]));

        let image = ImageRef::resolve(temp_dir.path(), "photo.jpg").unwrap();
        let spec = ThumbnailSpec {
            width: Some(100),
            height: Some(50),
            ..Default::default()
        };
        generator.get_or_generate(&image, &spec).unwrap();

        let leftovers: Vec<_> = fs::read_dir(temp_dir.path().join("thumbnails"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }
}
