//! Converted image documents.
//!
//! A conversion produces exactly one of:
//!
//! - [`SingleImageDocument`]: one encoded record that fits the record budget.
//! - [`MultiImageContainer`]: a grid of independently encoded pieces, used
//!   when one record cannot hold the image. The container holds no pixels.
//!
//! Both carry a canonical URL that encodes the final geometry, so the result
//! is self-describing:
//!
//! ```text
//! single:    <base>?width=W&height=H&depth=D[&section=WxH+X+Y]
//! container: <base>?width=W&height=H&depth=D
//! piece N:   <base>MultiN?width=W&height=H&depth=D
//! ```
//!
//! Pieces get record ids from a [`PieceIdAllocator`], which is injected by
//! the caller so one allocator can span every image in a build.

use crate::attributes::RequestAttributes;
use crate::imaging::{Depth, Rect, parse_geometry};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Fixed maximum byte size of one image record.
pub const RECORD_BUDGET: usize = 60 * 1024;

/// Monotonic allocator of fresh record ids.
///
/// Atomic so tiles converted on worker threads can share one allocator.
#[derive(Debug)]
pub struct PieceIdAllocator {
    next: AtomicU32,
}

impl PieceIdAllocator {
    pub fn new(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    pub fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for PieceIdAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Geometry carried in a canonical URL's query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalQuery {
    pub width: u32,
    pub height: u32,
    pub depth: Depth,
    pub section: Option<Rect>,
}

impl CanonicalQuery {
    pub fn new(width: u32, height: u32, depth: Depth, section: Option<Rect>) -> Self {
        Self {
            width,
            height,
            depth,
            section,
        }
    }

    /// Append this geometry to `base` as a query string.
    pub fn to_url(&self, base: &str) -> String {
        let mut url = format!(
            "{base}?width={}&height={}&depth={}",
            self.width, self.height, self.depth
        );
        if let Some(section) = self.section {
            url.push_str(&format!("&section={section}"));
        }
        url
    }

    /// Read the geometry back from a canonical URL.
    ///
    /// Returns `None` if any of width, height, or depth is missing or invalid.
    pub fn parse(url: &str) -> Option<Self> {
        let (_, query) = url.split_once('?')?;
        // `+` in section geometry is literal, not an encoded space
        let query = query.replace('+', "%2B");
        let pairs: BTreeMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        let number = |key: &str| pairs.get(key)?.parse::<u32>().ok();
        let section = match pairs.get("section") {
            Some(geometry) => Some(parse_geometry(geometry).ok()?),
            None => None,
        };
        Some(Self {
            width: number("width")?,
            height: number("height")?,
            depth: Depth::from_bits(u8::try_from(number("depth")?).ok()?)?,
            section,
        })
    }
}

/// A larger sibling rendering, handed back for separate conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternateImageDescriptor {
    pub url: String,
    pub attributes: RequestAttributes,
}

impl AlternateImageDescriptor {
    /// The descriptor as the `(url, attribute map)` pair the pipeline consumes.
    pub fn to_pair(&self) -> (String, BTreeMap<String, String>) {
        (self.url.clone(), self.attributes.to_map())
    }
}

/// One encoded record plus its canonical URL.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleImageDocument {
    pub url: String,
    pub geometry: CanonicalQuery,
    pub data: Vec<u8>,
    pub related: Vec<AlternateImageDescriptor>,
}

impl SingleImageDocument {
    pub fn new(base_url: &str, geometry: CanonicalQuery, data: Vec<u8>) -> Self {
        Self {
            url: geometry.to_url(base_url),
            geometry,
            data,
            related: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// One tile of a [`MultiImageContainer`].
#[derive(Debug, Clone, PartialEq)]
pub struct Piece {
    pub id: u32,
    /// Region of the scaled master image this piece covers.
    pub rect: Rect,
    pub document: SingleImageDocument,
}

/// A grid of pieces that together render one image.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiImageContainer {
    pub url: String,
    pub geometry: CanonicalQuery,
    pub columns: u32,
    pub rows: u32,
    /// Row-major.
    pub pieces: Vec<Piece>,
    pub related: Vec<AlternateImageDescriptor>,
}

impl MultiImageContainer {
    pub fn piece_ids(&self) -> Vec<u32> {
        self.pieces.iter().map(|p| p.id).collect()
    }

    /// Total encoded bytes across all pieces.
    pub fn total_size(&self) -> usize {
        self.pieces.iter().map(|p| p.document.size()).sum()
    }
}

/// URL of piece `index` of a tiled image.
pub fn piece_url(base_url: &str, index: usize, width: u32, height: u32, depth: Depth) -> String {
    CanonicalQuery::new(width, height, depth, None).to_url(&format!("{base_url}Multi{index}"))
}

/// Result of converting one image.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageDocument {
    Single(SingleImageDocument),
    Multi(MultiImageContainer),
}

impl ImageDocument {
    pub fn url(&self) -> &str {
        match self {
            ImageDocument::Single(doc) => &doc.url,
            ImageDocument::Multi(doc) => &doc.url,
        }
    }

    pub fn geometry(&self) -> CanonicalQuery {
        match self {
            ImageDocument::Single(doc) => doc.geometry,
            ImageDocument::Multi(doc) => doc.geometry,
        }
    }

    pub fn related(&self) -> &[AlternateImageDescriptor] {
        match self {
            ImageDocument::Single(doc) => &doc.related,
            ImageDocument::Multi(doc) => &doc.related,
        }
    }

    /// Encoded bytes across every record of the document.
    pub fn size(&self) -> usize {
        match self {
            ImageDocument::Single(doc) => doc.size(),
            ImageDocument::Multi(doc) => doc.total_size(),
        }
    }
}
