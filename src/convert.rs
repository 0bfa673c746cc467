//! Fit an image into the record budget.
//!
//! [`convert_image`] is the whole per-image pipeline:
//!
//! 1. resolve the target geometry ([`resolve_target`]),
//! 2. encode and reduce until the record fits ([`fit`]),
//! 3. fall back to a tiled container when it still does not ([`tile`]),
//! 4. attach a larger alternate rendering when one is wanted ([`related_images`]).
//!
//! The backend is only ever reached through [`ImageBackend`], so everything
//! here is tested with the mock in `imaging::backend::tests`.

use crate::attributes::RequestAttributes;
use crate::config::ConverterConfig;
use crate::document::{
    AlternateImageDescriptor, CanonicalQuery, ImageDocument, MultiImageContainer, Piece,
    PieceIdAllocator, RECORD_BUDGET, SingleImageDocument, piece_url,
};
use crate::imaging::{
    BackendError, ConvertParams, Depth, DepthLadder, Dimensions, ImageBackend, ShrinkSchedule,
    TargetGeometry, resolve_depth, resolve_size, resolve_size_with_section, tile_cell, tile_grid,
};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

/// Smallest tile edge the oversized-piece retry will halve down to.
pub const MIN_TILE_EDGE: u32 = 16;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Converted image {0} is zero bytes")]
    EmptyEncodedImage(String),
}

/// How an oversized record is reduced before tiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    None,
    Depth,
    Dimensions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitPolicy {
    pub budget: usize,
    pub reduction: Reduction,
}

impl FitPolicy {
    /// Depth reduction wins over dimension reduction when both are enabled.
    pub fn from_config(config: &ConverterConfig) -> Self {
        let reduction = if !config.auto_scale() {
            Reduction::None
        } else if config.try_reduce_bpp {
            Reduction::Depth
        } else {
            Reduction::Dimensions
        };
        Self {
            budget: RECORD_BUDGET,
            reduction,
        }
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }
}

/// The last encode of the fit loop and the geometry it was made at.
#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub geometry: TargetGeometry,
    pub record: Vec<u8>,
}

impl FitOutcome {
    pub fn fits(&self, budget: usize) -> bool {
        self.record.len() <= budget
    }
}

/// Resolve the target geometry, dropping a malformed crop with a warning.
pub fn resolve_target(
    attributes: &RequestAttributes,
    config: &ConverterConfig,
    natural: Dimensions,
) -> TargetGeometry {
    if let Err(bits) = resolve_depth(attributes, config) {
        warn!(
            "{bits} bpp is not supported, using {} bpp instead",
            Depth::FALLBACK
        );
    }
    match resolve_size(attributes, config, natural) {
        Ok(geometry) => geometry,
        Err(err) => {
            warn!("{err}; ignoring the crop");
            resolve_size_with_section(attributes, config, natural, None)
        }
    }
}

fn params_for(geometry: &TargetGeometry) -> ConvertParams {
    ConvertParams::new(geometry.width, geometry.height, geometry.depth)
        .with_section(geometry.section)
}

/// Encode at `geometry`, retrying once at the fallback depth when the
/// backend cannot produce the requested one. Updates the geometry's depth.
fn encode<B: ImageBackend + ?Sized>(
    backend: &B,
    geometry: &mut TargetGeometry,
) -> Result<Vec<u8>, BackendError> {
    match backend.convert(&params_for(geometry)) {
        Err(BackendError::UnsupportedDepth(depth)) if depth != Depth::FALLBACK => {
            warn!(
                "Backend cannot encode {depth} bpp, retrying at {} bpp",
                Depth::FALLBACK
            );
            geometry.depth = Depth::FALLBACK;
            backend.convert(&params_for(geometry))
        }
        other => other,
    }
}

fn overshoot(len: usize, budget: usize) -> f64 {
    (len as f64 / budget as f64 - 1.0) * 100.0
}

/// Fit Controller: encode once, then reduce per `policy` until the record
/// fits or the reduction hits its floor.
///
/// The returned outcome may still be oversized (the caller tiles it) or
/// empty (the caller rejects it).
pub fn fit<B: ImageBackend + ?Sized>(
    backend: &B,
    mut geometry: TargetGeometry,
    policy: &FitPolicy,
) -> Result<FitOutcome, ConvertError> {
    let mut record = encode(backend, &mut geometry)?;
    if record.len() <= policy.budget {
        return Ok(FitOutcome { geometry, record });
    }

    match policy.reduction {
        Reduction::Depth => {
            let mut ladder = DepthLadder::new(geometry.depth);
            while record.len() > policy.budget {
                let Some(depth) = ladder.next() else {
                    debug!("Depth ladder exhausted at {} bpp", geometry.depth);
                    break;
                };
                debug!(
                    "{}x{}x{} is {:.1}% over budget, trying {depth} bpp",
                    geometry.width,
                    geometry.height,
                    geometry.depth,
                    overshoot(record.len(), policy.budget)
                );
                let mut attempt = TargetGeometry {
                    depth,
                    ..geometry.clone()
                };
                if depth.bits() > Depth::FALLBACK.bits() {
                    record = encode(backend, &mut attempt)?;
                    // a fallback retry lands below this rung; resume from there
                    if attempt.depth != depth {
                        ladder = DepthLadder::new(attempt.depth);
                    }
                } else {
                    // at or below the fallback depth an unsupported rung is skipped
                    match backend.convert(&params_for(&attempt)) {
                        Err(BackendError::UnsupportedDepth(_)) => {
                            debug!("Backend cannot encode {depth} bpp, skipping it");
                            continue;
                        }
                        other => record = other?,
                    }
                }
                geometry = attempt;
            }
        }
        Reduction::Dimensions => {
            let mut schedule = ShrinkSchedule::new(policy.budget);
            while record.len() > policy.budget {
                let Some((width, height)) =
                    schedule.next(geometry.width, geometry.height, record.len())
                else {
                    debug!(
                        "Cannot shrink {}x{} any further",
                        geometry.width, geometry.height
                    );
                    break;
                };
                debug!(
                    "{}x{}x{} is {:.1}% over budget, trying {width}x{height}",
                    geometry.width,
                    geometry.height,
                    geometry.depth,
                    overshoot(record.len(), policy.budget)
                );
                geometry.width = width;
                geometry.height = height;
                record = encode(backend, &mut geometry)?;
            }
        }
        Reduction::None => {
            debug!(
                "{}x{}x{} is {:.1}% over budget and reduction is off",
                geometry.width,
                geometry.height,
                geometry.depth,
                overshoot(record.len(), policy.budget)
            );
        }
    }

    Ok(FitOutcome { geometry, record })
}

/// Tile Assembler: split the final geometry into a grid of pieces, each
/// encoded as a crop of the image pre-scaled to the final size.
///
/// If any piece is still over `budget` the layout is redone with halved
/// cells, down to [`MIN_TILE_EDGE`]; past that the oversized pieces are
/// kept and reported.
pub fn tile<B: ImageBackend + ?Sized>(
    backend: &B,
    geometry: &TargetGeometry,
    base_url: &str,
    allocator: &PieceIdAllocator,
    budget: usize,
) -> Result<MultiImageContainer, ConvertError> {
    let (width, height, depth) = (geometry.width, geometry.height, geometry.depth);
    let mut cell = tile_cell(depth);

    let (grid, records) = loop {
        let grid = tile_grid(width, height, cell);
        debug!(
            "Tiling {width}x{height}x{depth} into {}x{} cells of {}x{}",
            grid.columns, grid.rows, cell.0, cell.1
        );
        let records = grid
            .cells
            .par_iter()
            .map(|rect| {
                let params = ConvertParams::new(rect.width, rect.height, depth)
                    .with_section(Some(*rect))
                    .with_prescale(width, height);
                backend.convert(&params)
            })
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(index) = records.iter().position(Vec::is_empty) {
            return Err(ConvertError::EmptyEncodedImage(piece_url(
                base_url, index, width, height, depth,
            )));
        }

        let oversized = records.iter().filter(|r| r.len() > budget).count();
        if oversized == 0 {
            break (grid, records);
        }
        let halved = (cell.0 / 2, cell.1 / 2);
        if halved.0 < MIN_TILE_EDGE || halved.1 < MIN_TILE_EDGE {
            warn!(
                "{oversized} piece(s) of {base_url} exceed {budget} bytes even with {}x{} cells",
                cell.0, cell.1
            );
            break (grid, records);
        }
        debug!("{oversized} piece(s) over budget, halving cells");
        cell = halved;
    };

    let query = CanonicalQuery::new(width, height, depth, None);
    let pieces = grid
        .cells
        .iter()
        .zip(records)
        .enumerate()
        .map(|(index, (rect, data))| Piece {
            id: allocator.next_id(),
            rect: *rect,
            document: SingleImageDocument {
                url: piece_url(base_url, index, width, height, depth),
                geometry: query,
                data,
                related: Vec::new(),
            },
        })
        .collect();

    Ok(MultiImageContainer {
        url: query.to_url(base_url),
        geometry: query,
        columns: grid.columns,
        rows: grid.rows,
        pieces,
        related: Vec::new(),
    })
}

/// Whether a single rendering came out smaller than what was asked for.
fn single_was_scaled_down(
    attributes: &RequestAttributes,
    geometry: &TargetGeometry,
    natural: Dimensions,
) -> bool {
    let requested = |explicit: Option<u32>, crop: Option<u32>, natural: u32| {
        explicit
            .filter(|&v| v > 0)
            .or(crop.filter(|&v| v > 0))
            .unwrap_or(natural)
    };
    let width = requested(
        attributes.width.as_ref().and_then(|l| l.pixels()),
        geometry.section.map(|s| s.width),
        natural.width,
    );
    let height = requested(
        attributes.height.as_ref().and_then(|l| l.pixels()),
        geometry.section.map(|s| s.height),
        natural.height,
    );
    geometry.width < width || geometry.height < height
}

/// Related-Image Linker: at most one larger alternate of an inline image.
pub fn related_images(
    url: &str,
    attributes: &RequestAttributes,
    config: &ConverterConfig,
    was_scaled_down: bool,
) -> Vec<AlternateImageDescriptor> {
    if !attributes.inline || !was_scaled_down {
        return Vec::new();
    }
    let Some((alt_width, alt_height)) = config.alternate_limits() else {
        return Vec::new();
    };

    let mut alternate = attributes.clone();
    alternate.inline = false;
    alternate.alternate = true;
    if let Some(w) = alt_width {
        alternate.maxwidth = Some(w);
    }
    if let Some(h) = alt_height {
        alternate.maxheight = Some(h);
    }
    vec![AlternateImageDescriptor {
        url: url.to_string(),
        attributes: alternate,
    }]
}

/// Convert one image with the policy from `config`.
pub fn convert_image<B: ImageBackend + ?Sized>(
    backend: &B,
    base_url: &str,
    attributes: &RequestAttributes,
    config: &ConverterConfig,
    allocator: &PieceIdAllocator,
) -> Result<ImageDocument, ConvertError> {
    convert_with_policy(
        backend,
        base_url,
        attributes,
        config,
        &FitPolicy::from_config(config),
        allocator,
    )
}

pub fn convert_with_policy<B: ImageBackend + ?Sized>(
    backend: &B,
    base_url: &str,
    attributes: &RequestAttributes,
    config: &ConverterConfig,
    policy: &FitPolicy,
    allocator: &PieceIdAllocator,
) -> Result<ImageDocument, ConvertError> {
    let natural = backend.natural_size();
    let geometry = resolve_target(attributes, config, natural);
    debug!(
        "{base_url}: natural {}x{}, target {}x{}x{} (limits {:?}, factor {:.3})",
        natural.width,
        natural.height,
        geometry.width,
        geometry.height,
        geometry.depth,
        geometry.limits,
        geometry.scaling_factor
    );

    let outcome = fit(backend, geometry, policy)?;
    let geometry = outcome.geometry.clone();
    if outcome.record.is_empty() {
        let query = CanonicalQuery::new(
            geometry.width,
            geometry.height,
            geometry.depth,
            geometry.section,
        );
        return Err(ConvertError::EmptyEncodedImage(query.to_url(base_url)));
    }

    if outcome.fits(policy.budget) {
        let query = CanonicalQuery::new(
            geometry.width,
            geometry.height,
            geometry.depth,
            geometry.section,
        );
        let mut single = SingleImageDocument::new(base_url, query, outcome.record);
        single.related = related_images(
            base_url,
            attributes,
            config,
            single_was_scaled_down(attributes, &geometry, natural),
        );
        return Ok(ImageDocument::Single(single));
    }

    let mut container = tile(backend, &geometry, base_url, allocator, policy.budget)?;
    let scaled_down = geometry.width < natural.width || geometry.height < natural.height;
    container.related = related_images(base_url, attributes, config, scaled_down);
    Ok(ImageDocument::Multi(container))
}
