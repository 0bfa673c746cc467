//! Parameter types for image operations.
//!
//! These structs describe *what* to encode, not *how*. They are the interface
//! between the conversion driver in [`convert`](crate::convert) (which decides
//! geometry, depth, and tiling) and the [`backend`](super::backend) (which does
//! the actual pixel work). This separation allows swapping backends (e.g. for
//! testing with a mock) without changing the fitting logic.
//!
//! ## Types
//!
//! - [`Depth`]: Palm bitmap bit depth. Only the five ladder values exist.
//! - [`Rect`]: A crop region in pixels, parsed from `WxH+X+Y` geometry strings.
//! - [`ConvertParams`]: Everything one encode needs: target size, depth,
//!   optional crop, optional pre-scale.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bits per pixel of an encoded Palm bitmap.
///
/// The discriminants are the bit counts, ordered from cheapest to most
/// expensive. [`Depth::LADDER`] is the order used for stepwise reduction.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum Depth {
    #[default]
    Mono1 = 1,
    Gray2 = 2,
    Gray4 = 4,
    Color8 = 8,
    Direct16 = 16,
}

impl Depth {
    /// Known depths, lowest first.
    pub const LADDER: [Depth; 5] = [
        Depth::Mono1,
        Depth::Gray2,
        Depth::Gray4,
        Depth::Color8,
        Depth::Direct16,
    ];

    /// Depth used when a requested one cannot be honoured.
    pub const FALLBACK: Depth = Depth::Gray4;

    pub fn from_bits(bits: u8) -> Option<Self> {
        Self::LADDER.into_iter().find(|d| d.bits() == bits)
    }

    pub fn bits(self) -> u8 {
        self as u8
    }

    /// The next lower rung of the ladder, or `None` at 1 bit.
    pub fn step_down(self) -> Option<Self> {
        let idx = Self::LADDER.iter().position(|&d| d == self)?;
        idx.checked_sub(1).map(|i| Self::LADDER[i])
    }
}

impl TryFrom<u8> for Depth {
    type Error = String;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        Depth::from_bits(bits).ok_or_else(|| format!("unsupported bit depth {bits}"))
    }
}

impl From<Depth> for u8 {
    fn from(depth: Depth) -> Self {
        depth.bits()
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// A rectangular region in pixels, upper-left anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }
}

/// Renders in the `WxH+X+Y` geometry form used by `section` attributes.
impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// Parameters for a single encode call.
///
/// Order of operations in every backend: resize the whole source to
/// `prescale` (if set), crop `section` (if set), resize the result to
/// `width`×`height` (if it differs), then quantize to `depth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertParams {
    pub width: u32,
    pub height: u32,
    pub depth: Depth,
    pub section: Option<Rect>,
    pub prescale: Option<(u32, u32)>,
}

impl ConvertParams {
    pub fn new(width: u32, height: u32, depth: Depth) -> Self {
        Self {
            width,
            height,
            depth,
            section: None,
            prescale: None,
        }
    }

    pub fn with_section(mut self, section: Option<Rect>) -> Self {
        self.section = section;
        self
    }

    pub fn with_prescale(mut self, width: u32, height: u32) -> Self {
        self.prescale = Some((width, height));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_from_bits_accepts_only_ladder_values() {
        assert_eq!(Depth::from_bits(1), Some(Depth::Mono1));
        assert_eq!(Depth::from_bits(16), Some(Depth::Direct16));
        assert_eq!(Depth::from_bits(3), None);
        assert_eq!(Depth::from_bits(0), None);
        assert_eq!(Depth::from_bits(24), None);
    }

    #[test]
    fn depth_steps_down_the_ladder_in_order() {
        let mut seen = vec![Depth::Direct16];
        while let Some(next) = seen.last().unwrap().step_down() {
            seen.push(next);
        }
        let bits: Vec<u8> = seen.iter().map(|d| d.bits()).collect();
        assert_eq!(bits, vec![16, 8, 4, 2, 1]);
    }

    #[test]
    fn depth_default_is_one_bit() {
        assert_eq!(Depth::default(), Depth::Mono1);
    }

    #[test]
    fn rect_displays_as_geometry() {
        assert_eq!(Rect::new(10, 20, 300, 200).to_string(), "300x200+10+20");
    }

    #[test]
    fn rect_edges_saturate_instead_of_overflowing() {
        let rect = Rect::new(4_000_000_000, 10, 4_000_000_000, 5);
        assert_eq!(rect.right(), u32::MAX);
        assert_eq!(rect.bottom(), 15);
    }

    #[test]
    fn convert_params_builders() {
        let params = ConvertParams::new(100, 50, Depth::Gray4)
            .with_section(Some(Rect::new(0, 0, 10, 10)))
            .with_prescale(400, 200);
        assert_eq!(params.section, Some(Rect::new(0, 0, 10, 10)));
        assert_eq!(params.prescale, Some((400, 200)));
    }
}
