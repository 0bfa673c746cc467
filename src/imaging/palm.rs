//! Palm OS bitmap ("Tbmp") writer.
//!
//! Produces the uncompressed single-depth bitmap record a Palm document
//! reader displays. Layout, all fields big-endian:
//!
//! ```text
//! offset  size  field
//!      0     2  width
//!      2     2  height
//!      4     2  rowBytes        (always even: rows are word aligned)
//!      6     2  flags           (0x0400 = direct color)
//!      8     1  pixelSize       (1, 2, 4, 8 or 16)
//!      9     1  version         (1 for ≤4 bpp, 2 otherwise)
//!     10     2  nextDepthOffset (0: single depth)
//!     12     1  transparentIndex
//!     13     1  compressionType
//!     14     2  reserved
//!     16     8  direct color info (16 bpp only: 5/6/5 bits + transparent RGB)
//!     ..        pixel rows
//! ```
//!
//! | Depth | Pixel mapping |
//! |---|---|
//! | 1 | Floyd–Steinberg dithered luma, bit set = black |
//! | 2, 4 | Inverted grayscale (0 = white, max = black) |
//! | 8 | 6×6×6 color cube of the Palm system palette |
//! | 16 | RGB565 |

use super::backend::BackendError;
use super::params::Depth;
use image::imageops::{self, BiLevel};
use image::DynamicImage;

const HEADER_LEN: usize = 16;
const DIRECT_INFO_LEN: usize = 8;
const FLAG_DIRECT_COLOR: u16 = 0x0400;

/// Bytes per pixel row, padded to a 16-bit boundary.
pub fn row_bytes(width: u32, depth: Depth) -> u32 {
    (width * depth.bits() as u32).div_ceil(16) * 2
}

fn version(depth: Depth) -> u8 {
    if depth >= Depth::Color8 { 2 } else { 1 }
}

/// Encode an image as a Palm bitmap at the given depth.
///
/// The image is used at its current size; callers resize first.
pub fn encode(img: &DynamicImage, depth: Depth) -> Result<Vec<u8>, BackendError> {
    let (width, height) = (img.width(), img.height());
    if width == 0 || height == 0 || width > u16::MAX as u32 || height > u16::MAX as u32 {
        return Err(BackendError::ConversionFailed(format!(
            "{width}x{height} cannot be stored in a Palm bitmap"
        )));
    }

    let stride = row_bytes(width, depth);
    if stride > u16::MAX as u32 {
        return Err(BackendError::ConversionFailed(format!(
            "row of {stride} bytes exceeds the Palm bitmap limit"
        )));
    }

    let direct = depth == Depth::Direct16;
    let mut out = Vec::with_capacity(
        HEADER_LEN
            + if direct { DIRECT_INFO_LEN } else { 0 }
            + stride as usize * height as usize,
    );
    out.extend_from_slice(&(width as u16).to_be_bytes());
    out.extend_from_slice(&(height as u16).to_be_bytes());
    out.extend_from_slice(&(stride as u16).to_be_bytes());
    let flags = if direct { FLAG_DIRECT_COLOR } else { 0 };
    out.extend_from_slice(&flags.to_be_bytes());
    out.push(depth.bits());
    out.push(version(depth));
    out.extend_from_slice(&0u16.to_be_bytes()); // nextDepthOffset
    out.push(0); // transparentIndex
    out.push(0); // compressionType
    out.extend_from_slice(&0u16.to_be_bytes()); // reserved
    if direct {
        out.extend_from_slice(&[5, 6, 5, 0, 0, 0, 0, 0]);
    }

    match depth {
        Depth::Mono1 => {
            let mut luma = img.to_luma8();
            imageops::dither(&mut luma, &BiLevel);
            pack_rows(&mut out, width, height, stride, 1, |x, y| {
                u16::from(luma.get_pixel(x, y).0[0] < 128)
            });
        }
        Depth::Gray2 | Depth::Gray4 => {
            let luma = img.to_luma8();
            let max = (1u32 << depth.bits()) - 1;
            pack_rows(&mut out, width, height, stride, depth.bits(), |x, y| {
                let ink = 255 - luma.get_pixel(x, y).0[0] as u32;
                ((ink * max + 127) / 255) as u16
            });
        }
        Depth::Color8 => {
            let rgb = img.to_rgb8();
            pack_rows(&mut out, width, height, stride, 8, |x, y| {
                let [r, g, b] = rgb.get_pixel(x, y).0;
                palette_index(r, g, b) as u16
            });
        }
        Depth::Direct16 => {
            let rgb = img.to_rgb8();
            pack_rows(&mut out, width, height, stride, 16, |x, y| {
                let [r, g, b] = rgb.get_pixel(x, y).0;
                rgb565(r, g, b)
            });
        }
    }

    Ok(out)
}

/// Index into the Palm 8-bit system palette's web-safe cube.
///
/// The cube runs from white at index 0 to black at 215, green varying
/// fastest, then blue, then red, each channel descending.
pub fn palette_index(r: u8, g: u8, b: u8) -> u8 {
    let level = |c: u8| 5 - ((c as u16 + 25) / 51) as u8;
    level(r) * 36 + level(b) * 6 + level(g)
}

pub fn rgb565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

/// Append `height` rows of `bits`-wide pixels, MSB first, each row padded
/// to `stride` bytes.
fn pack_rows(
    out: &mut Vec<u8>,
    width: u32,
    height: u32,
    stride: u32,
    bits: u8,
    pixel: impl Fn(u32, u32) -> u16,
) {
    for y in 0..height {
        let row_start = out.len();
        out.resize(row_start + stride as usize, 0);
        let row = &mut out[row_start..];
        if bits == 16 {
            for x in 0..width {
                let i = x as usize * 2;
                row[i..i + 2].copy_from_slice(&pixel(x, y).to_be_bytes());
            }
            continue;
        }
        for x in 0..width {
            let bit_pos = x as usize * bits as usize;
            let shift = 8 - bits as usize - (bit_pos % 8);
            row[bit_pos / 8] |= (pixel(x, y) as u8) << shift;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn header_u16(bytes: &[u8], offset: usize) -> u16 {
        u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
    }

    #[test]
    fn row_bytes_are_word_aligned() {
        assert_eq!(row_bytes(1, Depth::Mono1), 2);
        assert_eq!(row_bytes(16, Depth::Mono1), 2);
        assert_eq!(row_bytes(17, Depth::Mono1), 4);
        assert_eq!(row_bytes(3, Depth::Color8), 4);
        assert_eq!(row_bytes(3, Depth::Direct16), 6);
    }

    #[test]
    fn header_describes_bitmap() {
        let img = DynamicImage::ImageLuma8(GrayImage::new(20, 10));
        let bytes = encode(&img, Depth::Gray4).unwrap();

        assert_eq!(header_u16(&bytes, 0), 20);
        assert_eq!(header_u16(&bytes, 2), 10);
        assert_eq!(header_u16(&bytes, 4), 10);
        assert_eq!(header_u16(&bytes, 6), 0);
        assert_eq!(bytes[8], 4);
        assert_eq!(bytes[9], 1);
        assert_eq!(bytes.len(), HEADER_LEN + 10 * 10);
    }

    #[test]
    fn one_bit_black_pixels_set_bits() {
        let img = GrayImage::from_fn(8, 1, |x, _| if x % 2 == 0 { Luma([0]) } else { Luma([255]) });
        let bytes = encode(&DynamicImage::ImageLuma8(img), Depth::Mono1).unwrap();
        assert_eq!(bytes[HEADER_LEN], 0b1010_1010);
        assert_eq!(bytes[HEADER_LEN + 1], 0);
    }

    #[test]
    fn gray_is_inverted() {
        let img = GrayImage::from_fn(2, 1, |x, _| if x == 0 { Luma([255]) } else { Luma([0]) });
        let bytes = encode(&DynamicImage::ImageLuma8(img), Depth::Gray2).unwrap();
        // white → 00, black → 11, packed MSB first
        assert_eq!(bytes[HEADER_LEN], 0b0011_0000);
    }

    #[test]
    fn direct_color_has_info_block_and_rgb565() {
        let img = RgbImage::from_pixel(1, 1, Rgb([255, 0, 0]));
        let bytes = encode(&DynamicImage::ImageRgb8(img), Depth::Direct16).unwrap();

        assert_eq!(header_u16(&bytes, 6), FLAG_DIRECT_COLOR);
        assert_eq!(bytes[9], 2);
        assert_eq!(&bytes[HEADER_LEN..HEADER_LEN + 3], &[5, 6, 5]);
        let px = HEADER_LEN + DIRECT_INFO_LEN;
        assert_eq!(header_u16(&bytes, px), 0xF800);
    }

    #[test]
    fn palette_cube_corners() {
        assert_eq!(palette_index(255, 255, 255), 0);
        assert_eq!(palette_index(255, 0, 255), 5);
        assert_eq!(palette_index(0, 0, 0), 215);
        assert_eq!(palette_index(250, 250, 250), 0);
    }

    #[test]
    fn oversized_dimensions_fail() {
        let img = DynamicImage::ImageLuma8(GrayImage::new(70_000, 1));
        assert!(matches!(
            encode(&img, Depth::Mono1),
            Err(BackendError::ConversionFailed(_))
        ));
    }
}
