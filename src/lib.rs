//! # tbmp-fit
//!
//! Converts raster images into Palm bitmap ("Tbmp") records for a
//! handheld document reader. A record may hold at most
//! [`RECORD_BUDGET`](document::RECORD_BUDGET) bytes (60 KiB), so the hard
//! part is fitting an image into that budget while keeping as much of it as
//! possible, and splitting it into a grid of records when nothing else works.
//!
//! # Pipeline
//!
//! ```text
//! attributes + config + natural size
//!        │
//!   resolve target geometry      (explicit size → crop → natural, then max bounds)
//!        │
//!   encode → measure → reduce    (depth ladder 16→8→4→2→1, or geometric shrink)
//!        │
//!   fits? ── yes → single record
//!        │
//!        no → tiled container     (fixed cell per depth, one record per cell)
//!        │
//!   inline and scaled down? → one larger alternate rendering
//! ```
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`attributes`] | Per-image request directives and their string-map form |
//! | [`config`] | `config.toml` loading, validation, and stock defaults |
//! | [`imaging`] | Geometry math, the backend trait, the in-process and netpbm backends, the Palm writer |
//! | [`convert`] | Fit controller, tile assembler, and alternate-image linker |
//! | [`document`] | Single documents, tiled containers, canonical URLs, piece ids |
//! | [`process`] | Batch conversion of files to records plus a JSON manifest |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## One Backend Trait
//!
//! Everything that touches pixels goes through
//! [`ImageBackend`](imaging::ImageBackend): `natural_size` and `convert`.
//! The default [`RustBackend`](imaging::RustBackend) decodes with the `image`
//! crate and writes Palm bitmaps itself. The
//! [`NetpbmBackend`](imaging::NetpbmBackend) drives the classic netpbm tools
//! through a shell pipeline for installs that already have them. The fitting
//! logic never knows which one it has, so it is tested against a mock that
//! only fabricates byte counts.
//!
//! ## Canonical URLs
//!
//! Every produced document carries a URL whose query string is its final
//! geometry (`?width=W&height=H&depth=D[&section=WxH+X+Y]`). Two requests that
//! resolve to the same rendering get the same URL, and the URL alone is
//! enough to reproduce the rendering.
//!
//! ## Injected Piece Ids
//!
//! Tile pieces need record ids that are unique across a whole build. The
//! caller owns a [`PieceIdAllocator`](document::PieceIdAllocator) and passes it
//! in, so there is no global counter and tests can start ids wherever they
//! like.

pub mod attributes;
pub mod config;
pub mod convert;
pub mod document;
pub mod imaging;
pub mod output;
pub mod process;

#[cfg(test)]
pub(crate) mod test_helpers;
