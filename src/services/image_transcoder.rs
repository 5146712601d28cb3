//! Re-encodes uploaded rasters into the canonical storage format.
//!
//! Images larger than the bounding dimension are scaled down so the longer
//! side equals the bound; smaller images keep their size. Output is always a
//! single format so stored blobs are uniform regardless of what was uploaded.

use bytes::Bytes;
use image::{
    DynamicImage, Rgb, RgbImage, Rgba,
    codecs::{jpeg::JpegEncoder, webp::WebPEncoder},
    imageops::FilterType,
};
use std::{path::Path, str::FromStr};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_MAX_DIMENSION: u32 = 2000;
pub const DEFAULT_QUALITY: f32 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    WebP,
    Jpeg,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::WebP => "webp",
            Self::Jpeg => "jpg",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::WebP => "image/webp",
            Self::Jpeg => "image/jpeg",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = TranscodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "webp" => Ok(Self::WebP),
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            other => Err(TranscodeError::InvalidOptions(format!(
                "unsupported output format `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranscodeOptions {
    pub max_dimension: u32,
    /// Encoder quality in `(0, 1]`. The WebP encoder is lossless and ignores it.
    pub quality: f32,
    pub format: OutputFormat,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
            quality: DEFAULT_QUALITY,
            format: OutputFormat::Jpeg,
        }
    }
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to load image")]
    Decode(#[source] image::ImageError),
    #[error("failed to get canvas context")]
    Canvas { width: u32, height: u32 },
    #[error("failed to convert image")]
    Encode(#[source] image::ImageError),
    #[error("invalid transcode options: {0}")]
    InvalidOptions(String),
    #[error("image conversion was interrupted")]
    Interrupted(#[from] tokio::task::JoinError),
}

/// A re-encoded asset ready for upload.
#[derive(Debug, Clone)]
pub struct TranscodedImage {
    pub bytes: Bytes,
    pub filename: String,
    pub content_type: &'static str,
    pub width: u32,
    pub height: u32,
    pub original_size: usize,
    pub converted_size: usize,
}

/// Scale `(width, height)` to fit inside `max` on both axes, preserving the
/// aspect ratio. Never upscales.
pub fn fit_within(width: u32, height: u32, max: u32) -> (u32, u32) {
    if width <= max && height <= max {
        return (width, height);
    }
    let (w, h, max) = (f64::from(width), f64::from(height), f64::from(max));
    let (new_w, new_h) = if w > h {
        (max, h / w * max)
    } else {
        (w / h * max, max)
    };
    (
        (new_w.round() as u32).max(1),
        (new_h.round() as u32).max(1),
    )
}

/// Replace the extension of `filename` with `extension`.
pub fn rename_extension(filename: &str, extension: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("image");
    format!("{stem}.{extension}")
}

/// Composite onto white; JPEG has no alpha channel.
fn flatten(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let Rgba([r, g, b, a]) = *rgba.get_pixel(x, y);
        let blend = |c: u8| ((u16::from(c) * u16::from(a) + 255 * (255 - u16::from(a))) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}

#[derive(Debug, Clone, Copy)]
pub struct ImageTranscoder {
    options: TranscodeOptions,
}

impl ImageTranscoder {
    pub fn new(options: TranscodeOptions) -> Result<Self, TranscodeError> {
        if options.max_dimension == 0 {
            return Err(TranscodeError::InvalidOptions(
                "max dimension must be positive".into(),
            ));
        }
        if !(options.quality > 0.0 && options.quality <= 1.0) {
            return Err(TranscodeError::InvalidOptions(format!(
                "quality {} is outside (0, 1]",
                options.quality
            )));
        }
        Ok(Self { options })
    }

    /// Decode, bound and re-encode `bytes`. CPU bound; see [`Self::transcode_blocking`].
    pub fn transcode(&self, bytes: &[u8], filename: &str) -> Result<TranscodedImage, TranscodeError> {
        let decoded = image::load_from_memory(bytes).map_err(TranscodeError::Decode)?;
        let (src_w, src_h) = (decoded.width(), decoded.height());
        if src_w == 0 || src_h == 0 {
            return Err(TranscodeError::Canvas {
                width: src_w,
                height: src_h,
            });
        }

        let (width, height) = fit_within(src_w, src_h, self.options.max_dimension);
        let resized = if (width, height) == (src_w, src_h) {
            decoded
        } else {
            debug!(src_w, src_h, width, height, "resizing image");
            decoded.resize_exact(width, height, FilterType::Triangle)
        };

        let encoded = self.encode(resized)?;
        let format = self.options.format;

        info!(
            original_size = bytes.len(),
            converted_size = encoded.len(),
            width,
            height,
            format = format.extension(),
            "transcoded image"
        );

        Ok(TranscodedImage {
            converted_size: encoded.len(),
            bytes: Bytes::from(encoded),
            filename: rename_extension(filename, format.extension()),
            content_type: format.mime(),
            width,
            height,
            original_size: bytes.len(),
        })
    }

    /// Run [`Self::transcode`] on the blocking pool.
    pub async fn transcode_blocking(
        &self,
        bytes: Bytes,
        filename: String,
    ) -> Result<TranscodedImage, TranscodeError> {
        let transcoder = *self;
        tokio::task::spawn_blocking(move || transcoder.transcode(&bytes, &filename)).await?
    }

    fn encode(&self, img: DynamicImage) -> Result<Vec<u8>, TranscodeError> {
        let mut out = Vec::new();
        match self.options.format {
            OutputFormat::WebP => {
                // The WebP encoder only takes 8-bit RGB(A)/luma buffers.
                let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
                rgba.write_with_encoder(WebPEncoder::new_lossless(&mut out))
                    .map_err(TranscodeError::Encode)?;
            }
            OutputFormat::Jpeg => {
                let quality = (self.options.quality * 100.0).round().clamp(1.0, 100.0) as u8;
                let rgb = DynamicImage::ImageRgb8(flatten(&img));
                rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))
                    .map_err(TranscodeError::Encode)?;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, RgbaImage};
    use std::io::Cursor;

    pub(crate) fn encoded(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([180, 40, 90]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, format)
            .unwrap();
        buf.into_inner()
    }

    fn transcoder(max_dimension: u32, format: OutputFormat) -> ImageTranscoder {
        ImageTranscoder::new(TranscodeOptions {
            max_dimension,
            quality: DEFAULT_QUALITY,
            format,
        })
        .unwrap()
    }

    #[test]
    fn fit_within_bounds_longer_side() {
        assert_eq!(fit_within(4000, 2000, 2000), (2000, 1000));
        assert_eq!(fit_within(2000, 4000, 2000), (1000, 2000));
        assert_eq!(fit_within(3000, 3000, 2000), (2000, 2000));
        assert_eq!(fit_within(3001, 1000, 2000), (2000, 666));
        assert_eq!(fit_within(10000, 1, 2000), (2000, 1));
    }

    #[test]
    fn fit_within_never_upscales() {
        assert_eq!(fit_within(640, 480, 2000), (640, 480));
        assert_eq!(fit_within(2000, 2000, 2000), (2000, 2000));
    }

    #[test]
    fn fit_within_preserves_aspect_ratio() {
        for (w, h) in [(4032u32, 3024u32), (2001, 17), (1234, 5678), (7777, 3333)] {
            let (nw, nh) = fit_within(w, h, 2000);
            assert_eq!(nw.max(nh), 2000);
            let before = f64::from(w) / f64::from(h);
            let after = f64::from(nw) / f64::from(nh);
            // one pixel of rounding on the short side
            let tolerance = before / f64::from(nw.min(nh));
            assert!((before - after).abs() <= tolerance, "{w}x{h} -> {nw}x{nh}");
        }
    }

    #[test]
    fn rename_extension_normalises_name() {
        assert_eq!(rename_extension("holiday.JPG", "webp"), "holiday.webp");
        assert_eq!(rename_extension("archive.tar.png", "webp"), "archive.tar.webp");
        assert_eq!(rename_extension("noext", "webp"), "noext.webp");
        assert_eq!(rename_extension("", "webp"), "image.webp");
    }

    #[test]
    fn rejects_invalid_options() {
        let bad_quality = TranscodeOptions {
            quality: 0.0,
            ..TranscodeOptions::default()
        };
        assert!(ImageTranscoder::new(bad_quality).is_err());
        let bad_bound = TranscodeOptions {
            max_dimension: 0,
            ..TranscodeOptions::default()
        };
        assert!(ImageTranscoder::new(bad_bound).is_err());
        assert!("gif".parse::<OutputFormat>().is_err());
        assert_eq!("JPEG".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
    }

    /// Pseudo-random pixels so the encoder has detail to throw away.
    fn noisy(width: u32, height: u32) -> Vec<u8> {
        let mut seed = 0x2545_f491_u32;
        let img = RgbImage::from_fn(width, height, |_, _| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let [r, g, b, _] = seed.to_le_bytes();
            Rgb([r, g, b])
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn with_quality(quality: f32) -> ImageTranscoder {
        ImageTranscoder::new(TranscodeOptions {
            quality,
            ..TranscodeOptions::default()
        })
        .unwrap()
    }

    #[test]
    fn large_jpeg_is_bounded_and_reencoded() {
        let source = encoded(4000, 2000, ImageFormat::Jpeg);
        let out = ImageTranscoder::new(TranscodeOptions::default())
            .unwrap()
            .transcode(&source, "wide.jpeg")
            .unwrap();

        assert_eq!((out.width, out.height), (2000, 1000));
        assert_eq!(out.filename, "wide.jpg");
        assert_eq!(out.content_type, "image/jpeg");
        assert_eq!(out.original_size, source.len());
        assert_eq!(out.converted_size, out.bytes.len());
        assert_eq!(image::guess_format(&out.bytes).unwrap(), ImageFormat::Jpeg);

        let reloaded = image::load_from_memory(&out.bytes).unwrap();
        assert_eq!((reloaded.width(), reloaded.height()), (2000, 1000));
    }

    #[test]
    fn default_output_shrinks_with_quality() {
        let source = noisy(800, 600);
        let low = with_quality(0.1).transcode(&source, "noise.png").unwrap();
        let high = with_quality(1.0).transcode(&source, "noise.png").unwrap();

        assert!(
            low.converted_size < high.converted_size,
            "q0.1={} q1.0={}",
            low.converted_size,
            high.converted_size
        );
    }

    #[test]
    fn transparent_pixels_become_white() {
        let img = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 0]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();

        let out = with_quality(1.0).transcode(buf.get_ref(), "clear.png").unwrap();
        let reloaded = image::load_from_memory(&out.bytes).unwrap().to_rgb8();
        assert!(reloaded.pixels().all(|p| p.0.iter().all(|&c| c > 240)));
    }

    #[test]
    fn small_png_keeps_dimensions() {
        let source = encoded(120, 80, ImageFormat::Png);
        let out = transcoder(200, OutputFormat::WebP)
            .transcode(&source, "small.png")
            .unwrap();
        assert_eq!((out.width, out.height), (120, 80));
        assert_eq!(out.filename, "small.webp");
    }

    #[test]
    fn jpeg_output_is_bounded() {
        let source = encoded(300, 150, ImageFormat::Png);
        let out = transcoder(100, OutputFormat::Jpeg)
            .transcode(&source, "banner.png")
            .unwrap();
        assert_eq!((out.width, out.height), (100, 50));
        assert_eq!(out.filename, "banner.jpg");
        assert_eq!(image::guess_format(&out.bytes).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn undecodable_input_fails_to_load() {
        let err = transcoder(200, OutputFormat::WebP)
            .transcode(b"%PDF-1.7 not an image", "doc.jpg")
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Decode(_)));
        assert_eq!(err.to_string(), "failed to load image");
    }

    #[tokio::test]
    async fn blocking_variant_matches_inline() {
        let source = encoded(400, 100, ImageFormat::Png);
        let out = transcoder(200, OutputFormat::WebP)
            .transcode_blocking(Bytes::from(source), "strip.png".into())
            .await
            .unwrap();
        assert_eq!((out.width, out.height), (200, 50));
    }
}
