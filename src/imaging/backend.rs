//! Encoding backend trait and shared types.
//!
//! The [`ImageBackend`] trait defines the two operations every backend must
//! support: report the natural size of the source, and convert it into Palm
//! bitmap bytes at a requested geometry.
//!
//! Two implementations exist:
//! - [`RustBackend`](super::rust_backend::RustBackend): in-process, decodes
//!   with the `image` crate and writes the bitmap with [`palm`](super::palm).
//! - [`NetpbmBackend`](super::netpbm_backend::NetpbmBackend): shells out to a
//!   netpbm pipeline ending in `pnmtopalm`.
//!
//! Each backend instance is bound to one source image at construction.

use super::params::{ConvertParams, Depth};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode source image: {0}")]
    Decode(String),
    #[error("Backend cannot encode at {0} bpp")]
    UnsupportedDepth(Depth),
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("Conversion failed: {0}")]
    ConversionFailed(String),
}

/// Natural pixel size of a source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Trait for encoding backends.
///
/// `Sync` so that tiles of one image can be encoded from rayon workers.
pub trait ImageBackend: Sync {
    /// Natural size of the bound source image.
    fn natural_size(&self) -> Dimensions;

    /// Encode the source at the given geometry and return Palm bitmap bytes.
    fn convert(&self, params: &ConvertParams) -> Result<Vec<u8>, BackendError>;
}
