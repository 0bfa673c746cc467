//! Image encoding: geometry math, backends, and the Palm bitmap writer.
//!
//! | Operation | Implementation |
//! |---|---|
//! | **Natural size** | [`ImageBackend::natural_size`] |
//! | **Resolve target geometry** | [`resolve_size`] (pure) |
//! | **Encode** | [`RustBackend`] (`image` crate + [`palm`]) or [`NetpbmBackend`] (external tools) |
//! | **Tile partitioning** | [`tile_grid`] (pure) |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for geometry math (unit testable)
//! - **Parameters**: Data structures describing one encode
//! - **Backend**: [`ImageBackend`] trait + its two implementations
//! - **Palm**: the bitmap record writer used by the in-process backend

pub mod backend;
mod calculations;
pub mod netpbm_backend;
pub mod palm;
mod params;
pub mod rust_backend;

pub use backend::{BackendError, Dimensions, ImageBackend};
pub use calculations::{
    DepthLadder, GeometryError, Limits, ShrinkSchedule, TargetGeometry, TileGrid, parse_geometry,
    resolve_depth, resolve_size, resolve_size_with_section, scale_to_fit, tile_cell, tile_grid,
};
pub use netpbm_backend::NetpbmBackend;
pub use params::{ConvertParams, Depth, Rect};
pub use rust_backend::RustBackend;
