//! Pure Rust encoding backend.
//!
//! Everything is statically linked into the binary.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, GIF, TIFF, WebP, BMP, PNM) | `image::load_from_memory_with_format` |
//! | Pre-scale / resize | `image::DynamicImage::resize_exact` with `Lanczos3` |
//! | Crop | `image::DynamicImage::crop_imm` |
//! | Encode → Palm bitmap | [`palm::encode`](super::palm::encode) |

use super::backend::{BackendError, Dimensions, ImageBackend};
use super::palm;
use super::params::ConvertParams;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::borrow::Cow;
use tracing::debug;

/// MIME types whose decoders are compiled in.
const MIME_FORMATS: &[(&str, ImageFormat)] = &[
    ("image/jpeg", ImageFormat::Jpeg),
    ("image/jpg", ImageFormat::Jpeg),
    ("image/png", ImageFormat::Png),
    ("image/gif", ImageFormat::Gif),
    ("image/tiff", ImageFormat::Tiff),
    ("image/webp", ImageFormat::WebP),
    ("image/bmp", ImageFormat::Bmp),
    ("image/pbm", ImageFormat::Pnm),
    ("image/x-portable-pixmap", ImageFormat::Pnm),
    ("image/x-portable-anymap", ImageFormat::Pnm),
];

/// Map a MIME type to a compiled-in decoder, if any.
pub fn format_for_mime(mime: &str) -> Option<ImageFormat> {
    MIME_FORMATS
        .iter()
        .find(|(m, _)| m.eq_ignore_ascii_case(mime))
        .map(|(_, fmt)| *fmt)
}

/// In-process backend bound to one decoded source image.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustBackend {
    image: DynamicImage,
}

impl RustBackend {
    /// Decode `bytes` of the given MIME type. Unknown MIME types fall back
    /// to content sniffing.
    pub fn from_bytes(mime: &str, bytes: &[u8]) -> Result<Self, BackendError> {
        let decoded = match format_for_mime(mime) {
            Some(format) => image::load_from_memory_with_format(bytes, format),
            None => image::load_from_memory(bytes),
        };
        let image = decoded.map_err(|e| BackendError::Decode(format!("{mime}: {e}")))?;
        Ok(Self { image })
    }
}

impl ImageBackend for RustBackend {
    fn natural_size(&self) -> Dimensions {
        Dimensions {
            width: self.image.width(),
            height: self.image.height(),
        }
    }

    fn convert(&self, params: &ConvertParams) -> Result<Vec<u8>, BackendError> {
        let mut img = Cow::Borrowed(&self.image);

        if let Some((w, h)) = params.prescale
            && (w, h) != (img.width(), img.height())
        {
            img = Cow::Owned(img.resize_exact(w, h, FilterType::Lanczos3));
        }

        if let Some(section) = params.section {
            if section.right() > img.width() || section.bottom() > img.height() {
                return Err(BackendError::ConversionFailed(format!(
                    "section {section} lies outside the {}x{} image",
                    img.width(),
                    img.height()
                )));
            }
            img = Cow::Owned(img.crop_imm(section.x, section.y, section.width, section.height));
        }

        if img.width() != params.width || img.height() != params.height {
            debug!(
                "Scaling {}x{} image by {:.3} to {}x{}x{}",
                img.width(),
                img.height(),
                params.width as f64 / img.width().max(1) as f64,
                params.width,
                params.height,
                params.depth
            );
            img = Cow::Owned(img.resize_exact(params.width, params.height, FilterType::Lanczos3));
        }

        palm::encode(&img, params.depth)
    }
}
