//! Pure calculation functions for target geometry.
//!
//! All functions here are pure and testable without any I/O or images:
//! geometry-string parsing, size resolution, the dimension-shrink schedule,
//! and tile grid partitioning.

use super::backend::Dimensions;
use super::params::{Depth, Rect};
use crate::attributes::RequestAttributes;
use crate::config::ConverterConfig;
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

static GEOMETRY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]+)x([0-9]+)\+([0-9]+)\+([0-9]+)$").expect("geometry pattern is valid")
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("Invalid crop geometry {0:?} (expected WxH+X+Y)")]
    InvalidGeometry(String),
}

/// Parse a `WxH+X+Y` geometry string into a crop rectangle.
///
/// # Examples
/// ```
/// # use tbmp_fit::imaging::{Rect, parse_geometry};
/// assert_eq!(parse_geometry("300x200+10+20").unwrap(), Rect::new(10, 20, 300, 200));
/// assert!(parse_geometry("300x200").is_err());
/// ```
pub fn parse_geometry(geometry: &str) -> Result<Rect, GeometryError> {
    let invalid = || GeometryError::InvalidGeometry(geometry.to_string());
    let caps = GEOMETRY_PATTERN.captures(geometry.trim()).ok_or_else(invalid)?;
    let field = |i: usize| caps[i].parse::<u32>().map_err(|_| invalid());
    let rect = Rect {
        width: field(1)?,
        height: field(2)?,
        x: field(3)?,
        y: field(4)?,
    };
    // an empty region, or one whose far edge is not representable
    if rect.width == 0
        || rect.height == 0
        || rect.x.checked_add(rect.width).is_none()
        || rect.y.checked_add(rect.height).is_none()
    {
        return Err(invalid());
    }
    Ok(rect)
}

/// Bounds actually applied while resolving. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
}

/// The resolved encode target for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetGeometry {
    pub width: u32,
    pub height: u32,
    pub depth: Depth,
    pub section: Option<Rect>,
    pub limits: Limits,
    /// Factor the pre-limit size was multiplied by (1.0 when it already fit).
    pub scaling_factor: f64,
}

/// Resolve the depth to encode at: attribute, then config, then 1 bit.
///
/// Returns `Err(bits)` when the requested value is not on the ladder.
pub fn resolve_depth(
    attributes: &RequestAttributes,
    config: &ConverterConfig,
) -> Result<Depth, u8> {
    let bits = attributes.bpp.unwrap_or(config.bpp);
    Depth::from_bits(bits).ok_or(bits)
}

/// Compute the uniform factor that fits `width`×`height` inside the limits.
///
/// Width-based scaling wins when no max height is set, or when the width
/// overshoots proportionally more than the height.
pub fn scale_to_fit(width: f64, height: f64, limits: Limits) -> f64 {
    let over_width = limits.max_width.is_some_and(|m| width > m as f64);
    let over_height = limits.max_height.is_some_and(|m| height > m as f64);
    if !over_width && !over_height {
        return 1.0;
    }

    match (limits.max_width, limits.max_height) {
        (Some(mw), None) => mw as f64 / width,
        (Some(mw), Some(mh)) if width / mw as f64 > height / mh as f64 => mw as f64 / width,
        (_, Some(mh)) => mh as f64 / height,
        (None, None) => 1.0,
    }
}

/// Size Resolver: compute the single target geometry for an image.
///
/// Resolution order per dimension: explicit pixel attribute, crop size, then
/// the natural size (deriving a missing dimension from the other by the
/// natural aspect ratio). Percentage attributes are never resolved here.
/// The result is then scaled uniformly into the effective max bounds and
/// floored, never below 1 pixel.
///
/// An unsupported depth resolves to [`Depth::FALLBACK`]; callers that want
/// to report it should check [`resolve_depth`] first.
pub fn resolve_size(
    attributes: &RequestAttributes,
    config: &ConverterConfig,
    natural: Dimensions,
) -> Result<TargetGeometry, GeometryError> {
    let section = attributes
        .section
        .as_deref()
        .map(parse_geometry)
        .transpose()?;
    Ok(resolve_size_with_section(attributes, config, natural, section))
}

/// [`resolve_size`] with the crop already parsed (or dropped).
pub fn resolve_size_with_section(
    attributes: &RequestAttributes,
    config: &ConverterConfig,
    natural: Dimensions,
    section: Option<Rect>,
) -> TargetGeometry {
    let depth = resolve_depth(attributes, config).unwrap_or(Depth::FALLBACK);
    let limits = Limits {
        max_width: attributes.maxwidth.or(config.maxwidth).filter(|&m| m > 0),
        max_height: attributes.maxheight.or(config.maxheight).filter(|&m| m > 0),
    };

    let explicit_w = attributes.width.as_ref().and_then(|l| l.pixels());
    let explicit_h = attributes.height.as_ref().and_then(|l| l.pixels());
    let width = explicit_w
        .or(section.map(|s| s.width))
        .filter(|&w| w > 0)
        .map(f64::from);
    let height = explicit_h
        .or(section.map(|s| s.height))
        .filter(|&h| h > 0)
        .map(f64::from);

    let (nat_w, nat_h) = (natural.width as f64, natural.height as f64);
    let width = match (width, height) {
        (Some(w), _) => w,
        (None, Some(h)) if nat_h > 0.0 => nat_w * h / nat_h,
        (None, _) => nat_w,
    };
    let height = match height {
        Some(h) => h,
        None if nat_w > 0.0 => nat_h * width / nat_w,
        None => nat_h,
    };

    let scaling_factor = scale_to_fit(width, height, limits);
    TargetGeometry {
        width: ((width * scaling_factor) as u32).max(1),
        height: ((height * scaling_factor) as u32).max(1),
        depth,
        section,
        limits,
        scaling_factor,
    }
}

/// Depth-reduction schedule: walks down the ladder one step per call.
#[derive(Debug, Clone, Copy)]
pub struct DepthLadder {
    current: Depth,
}

impl DepthLadder {
    pub fn new(start: Depth) -> Self {
        Self { current: start }
    }

    /// Next shallower depth, or `None` at 1 bit.
    pub fn next(&mut self) -> Option<Depth> {
        self.current = self.current.step_down()?;
        Some(self.current)
    }
}

/// Geometric shrink schedule for the dimension-reduction loop.
///
/// Keeps a target byte size that starts at the budget and decays by 5% per
/// step. Each step scales both dimensions by `sqrt(target / current_len)`.
/// While the record exceeds the budget that factor is below 1, so every
/// step strictly shrinks both dimensions.
#[derive(Debug, Clone)]
pub struct ShrinkSchedule {
    target: f64,
}

impl ShrinkSchedule {
    const DECAY: f64 = 0.95;

    pub fn new(budget: usize) -> Self {
        Self {
            target: budget as f64,
        }
    }

    /// Current target size in bytes.
    pub fn target(&self) -> f64 {
        self.target
    }

    /// Next dimensions to try, or `None` once a dimension would reach zero.
    pub fn next(&mut self, width: u32, height: u32, current_len: usize) -> Option<(u32, u32)> {
        self.target *= Self::DECAY;
        let factor = (self.target / current_len.max(1) as f64).sqrt();
        let w = (width as f64 * factor) as u32;
        let h = (height as f64 * factor) as u32;
        if w == 0 || h == 0 || w >= width || h >= height {
            return None;
        }
        Some((w, h))
    }
}

/// Tile cell size for a depth. Deeper pixels cost more, so cells shrink.
pub fn tile_cell(depth: Depth) -> (u32, u32) {
    match depth {
        Depth::Mono1 => (800, 600),
        Depth::Gray2 => (600, 400),
        Depth::Gray4 => (400, 300),
        Depth::Color8 => (300, 200),
        Depth::Direct16 => (300, 100),
    }
}

/// A row-major partition of an image into tiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    pub columns: u32,
    pub rows: u32,
    pub cells: Vec<Rect>,
}

/// Partition `width`×`height` into cells of `cell` size, clipping the last
/// column and row.
pub fn tile_grid(width: u32, height: u32, cell: (u32, u32)) -> TileGrid {
    let (cell_w, cell_h) = (cell.0.max(1), cell.1.max(1));
    let columns = width.div_ceil(cell_w);
    let rows = height.div_ceil(cell_h);

    let mut cells = Vec::with_capacity((columns * rows) as usize);
    for row in 0..rows {
        let y = row * cell_h;
        for col in 0..columns {
            let x = col * cell_w;
            cells.push(Rect {
                x,
                y,
                width: cell_w.min(width - x),
                height: cell_h.min(height - y),
            });
        }
    }

    TileGrid {
        columns,
        rows,
        cells,
    }
}
