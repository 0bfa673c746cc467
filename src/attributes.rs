//! Per-image request attributes.
//!
//! The embedding context (a document's `<img>` tag, a CLI invocation, or an
//! alternate-image descriptor) describes how it wants an image rendered with
//! a flat string map. [`RequestAttributes`] is the typed form of that map.
//!
//! | Key | Meaning |
//! |---|---|
//! | `width`, `height` | Pixel count, or a percentage (kept but never resolved) |
//! | `bpp` | Requested bit depth |
//! | `section` | Crop geometry `WxH+X+Y` |
//! | `maxwidth`, `maxheight` | Per-image bounds overriding the config |
//! | `_inline_image` | The image is embedded in a document page |
//! | `_alternate_image` | The image is the larger sibling of an inline image |
//!
//! Unknown keys are preserved so a round trip through the typed form loses
//! nothing the surrounding pipeline put there.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

pub const KEY_WIDTH: &str = "width";
pub const KEY_HEIGHT: &str = "height";
pub const KEY_BPP: &str = "bpp";
pub const KEY_SECTION: &str = "section";
pub const KEY_MAXWIDTH: &str = "maxwidth";
pub const KEY_MAXHEIGHT: &str = "maxheight";
pub const KEY_INLINE: &str = "_inline_image";
pub const KEY_ALTERNATE: &str = "_alternate_image";

/// An explicit width or height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Length {
    Pixels(u32),
    /// Kept verbatim, e.g. `"50%"`.
    Percent(String),
}

impl Length {
    /// Parse an attribute value. Anything ending in `%` is a percentage.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.ends_with('%') {
            return Some(Length::Percent(value.to_string()));
        }
        value.parse().ok().map(Length::Pixels)
    }

    pub fn pixels(&self) -> Option<u32> {
        match self {
            Length::Pixels(px) => Some(*px),
            Length::Percent(_) => None,
        }
    }
}

impl fmt::Display for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Length::Pixels(px) => write!(f, "{px}"),
            Length::Percent(p) => f.write_str(p),
        }
    }
}

/// Typed per-image directives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAttributes {
    pub width: Option<Length>,
    pub height: Option<Length>,
    pub bpp: Option<u8>,
    pub section: Option<String>,
    pub maxwidth: Option<u32>,
    pub maxheight: Option<u32>,
    /// Image is referenced inline from a document page.
    pub inline: bool,
    /// Image is an alternate (larger) rendering of an inline image.
    pub alternate: bool,
    /// Keys this crate does not interpret.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

fn flag(value: &str) -> bool {
    !matches!(value.trim(), "" | "0" | "false")
}

impl RequestAttributes {
    /// Build from a string map. Malformed numeric values are logged and dropped.
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let mut attrs = RequestAttributes::default();
        for (key, value) in map {
            let number = |what: &str| -> Option<u32> {
                let parsed = value.trim().parse().ok();
                if parsed.is_none() {
                    warn!("Ignoring non-numeric {what} attribute {value:?}");
                }
                parsed
            };
            match key.as_str() {
                KEY_WIDTH => attrs.width = Length::parse(value),
                KEY_HEIGHT => attrs.height = Length::parse(value),
                KEY_BPP => attrs.bpp = number(KEY_BPP).and_then(|b| u8::try_from(b).ok()),
                KEY_SECTION => attrs.section = Some(value.clone()),
                KEY_MAXWIDTH => attrs.maxwidth = number(KEY_MAXWIDTH),
                KEY_MAXHEIGHT => attrs.maxheight = number(KEY_MAXHEIGHT),
                KEY_INLINE => attrs.inline = flag(value),
                KEY_ALTERNATE => attrs.alternate = flag(value),
                _ => {
                    attrs.extra.insert(key.clone(), value.clone());
                }
            }
        }
        attrs
    }

    /// Flatten back into a string map.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = self.extra.clone();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(v) = value {
                map.insert(key.to_string(), v);
            }
        };
        put(KEY_WIDTH, self.width.as_ref().map(Length::to_string));
        put(KEY_HEIGHT, self.height.as_ref().map(Length::to_string));
        put(KEY_BPP, self.bpp.map(|b| b.to_string()));
        put(KEY_SECTION, self.section.clone());
        put(KEY_MAXWIDTH, self.maxwidth.map(|m| m.to_string()));
        put(KEY_MAXHEIGHT, self.maxheight.map(|m| m.to_string()));
        put(KEY_INLINE, self.inline.then(|| "1".to_string()));
        put(KEY_ALTERNATE, self.alternate.then(|| "1".to_string()));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn length_parses_pixels_and_percent() {
        assert_eq!(Length::parse("120"), Some(Length::Pixels(120)));
        assert_eq!(Length::parse(" 50% "), Some(Length::Percent("50%".into())));
        assert_eq!(Length::parse("wide"), None);
        assert_eq!(Length::Percent("50%".into()).pixels(), None);
    }

    #[test]
    fn from_map_reads_all_known_keys() {
        let attrs = RequestAttributes::from_map(&map(&[
            ("width", "100"),
            ("height", "25%"),
            ("bpp", "4"),
            ("section", "10x10+0+0"),
            ("maxwidth", "150"),
            ("maxheight", "250"),
            ("_inline_image", "1"),
        ]));
        assert_eq!(attrs.width, Some(Length::Pixels(100)));
        assert_eq!(attrs.height, Some(Length::Percent("25%".into())));
        assert_eq!(attrs.bpp, Some(4));
        assert_eq!(attrs.section.as_deref(), Some("10x10+0+0"));
        assert_eq!(attrs.maxwidth, Some(150));
        assert_eq!(attrs.maxheight, Some(250));
        assert!(attrs.inline);
        assert!(!attrs.alternate);
    }

    #[test]
    fn malformed_numbers_are_dropped() {
        let attrs = RequestAttributes::from_map(&map(&[("bpp", "lots"), ("maxwidth", "-3")]));
        assert_eq!(attrs.bpp, None);
        assert_eq!(attrs.maxwidth, None);
    }

    #[test]
    fn false_flags_are_not_set() {
        let attrs = RequestAttributes::from_map(&map(&[("_inline_image", "0")]));
        assert!(!attrs.inline);
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let original = map(&[("alt", "a photo"), ("width", "64"), ("_alternate_image", "1")]);
        let attrs = RequestAttributes::from_map(&original);
        assert_eq!(attrs.extra.get("alt").map(String::as_str), Some("a photo"));
        assert_eq!(attrs.to_map(), original);
    }
}
