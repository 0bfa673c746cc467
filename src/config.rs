//! Converter configuration module.
//!
//! Handles loading, validating, and merging `config.toml`. Stock defaults are
//! the base layer; a user config file overrides any subset of keys.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! bpp = 1                      # Default bit depth (1, 2, 4, 8 or 16)
//! # maxwidth = 150             # Default max width in pixels (absent/0 = unbounded)
//! # maxheight = 250            # Default max height in pixels (absent/0 = unbounded)
//! # alt_maxwidth = 600         # Bounds for alternate renderings of inline images;
//! # alt_maxheight = -1         # -1 in either key disables alternates
//! auto_scale_images = false    # Shrink oversized images to fit one record
//! try_reduce_bpp = false       # Try lower bit depths first
//! try_reduce_dimension = false # Shrink dimensions to fit one record
//! verbosity = 1                # 0 = warnings, 1 = info, 2 = debug, 3 = trace
//! image_parser = "rust"        # "rust" (in-process) or "netpbm" (external tools)
//!
//! [netpbm]
//! pnmscale = "pnmscale"        # Program names used by the netpbm backend
//! palm4bit_graymap = "/usr/share/netpbm/palmgray4.map"
//!
//! [processing]
//! max_processes = 4            # Max parallel workers (omit for auto = CPU cores)
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::imaging::Depth;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Value of `alt_maxwidth` / `alt_maxheight` that turns alternates off.
pub const ALT_DISABLED: i64 = -1;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Which encoding backend converts images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageParser {
    #[default]
    Rust,
    Netpbm,
}

/// Converter configuration loaded from `config.toml`.
///
/// All fields have defaults. User config files need only specify the values
/// they want to override. Unknown keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConverterConfig {
    /// Default bit depth when an image does not request one.
    pub bpp: u8,
    /// Default max width; `None` or 0 means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxwidth: Option<u32>,
    /// Default max height; `None` or 0 means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxheight: Option<u32>,
    /// Max width for alternate renderings; [`ALT_DISABLED`] turns alternates off.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt_maxwidth: Option<i64>,
    /// Max height for alternate renderings; [`ALT_DISABLED`] turns alternates off.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt_maxheight: Option<i64>,
    pub auto_scale_images: bool,
    pub try_reduce_bpp: bool,
    pub try_reduce_dimension: bool,
    /// Diagnostic detail only; never changes output bytes.
    pub verbosity: u8,
    pub image_parser: ImageParser,
    pub netpbm: NetpbmConfig,
    pub processing: ProcessingConfig,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            bpp: Depth::default().bits(),
            maxwidth: None,
            maxheight: None,
            alt_maxwidth: None,
            alt_maxheight: None,
            auto_scale_images: false,
            try_reduce_bpp: false,
            try_reduce_dimension: false,
            verbosity: 1,
            image_parser: ImageParser::default(),
            netpbm: NetpbmConfig::default(),
            processing: ProcessingConfig::default(),
        }
    }
}

impl ConverterConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if Depth::from_bits(self.bpp).is_none() {
            return Err(ConfigError::Validation(format!(
                "bpp must be one of 1, 2, 4, 8, 16 (got {})",
                self.bpp
            )));
        }
        for (key, value) in [
            ("alt_maxwidth", self.alt_maxwidth),
            ("alt_maxheight", self.alt_maxheight),
        ] {
            if value.is_some_and(|v| v < ALT_DISABLED) {
                return Err(ConfigError::Validation(format!(
                    "{key} must be -1 (disabled) or a pixel count"
                )));
            }
        }
        if self.processing.max_processes == Some(0) {
            return Err(ConfigError::Validation(
                "processing.max_processes must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Whether any size-reduction strategy is enabled.
    pub fn auto_scale(&self) -> bool {
        self.auto_scale_images || self.try_reduce_bpp || self.try_reduce_dimension
    }

    /// Alternate bounds, or `None` when alternates are off or unconfigured.
    pub fn alternate_limits(&self) -> Option<(Option<u32>, Option<u32>)> {
        let (w, h) = (self.alt_maxwidth, self.alt_maxheight);
        if (w.is_none() && h.is_none()) || w == Some(ALT_DISABLED) || h == Some(ALT_DISABLED) {
            return None;
        }
        let px = |v: Option<i64>| v.and_then(|v| u32::try_from(v).ok());
        Some((px(w), px(h)))
    }
}

/// Program names and colormap files for the netpbm backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetpbmConfig {
    pub giftopnm: String,
    pub djpeg: String,
    pub pngtopnm: String,
    pub palmtopnm: String,
    pub pnmscale: String,
    pub pnmcut: String,
    pub ppmquant: String,
    pub ppmtopgm: String,
    pub pgmtopbm: String,
    pub pnmtopalm: String,
    pub palm2bit_graymap: PathBuf,
    pub palm4bit_graymap: PathBuf,
    pub palm8bit_colormap: PathBuf,
}

impl Default for NetpbmConfig {
    fn default() -> Self {
        Self {
            giftopnm: "giftopnm".into(),
            djpeg: "djpeg".into(),
            pngtopnm: "pngtopnm".into(),
            palmtopnm: "palmtopnm".into(),
            pnmscale: "pnmscale".into(),
            pnmcut: "pnmcut".into(),
            ppmquant: "ppmquant".into(),
            ppmtopgm: "ppmtopgm".into(),
            pgmtopbm: "pgmtopbm".into(),
            pnmtopalm: "pnmtopalm".into(),
            palm2bit_graymap: "/usr/share/netpbm/palmgray2.map".into(),
            palm4bit_graymap: "/usr/share/netpbm/palmgray4.map".into(),
            palm8bit_colormap: "/usr/share/netpbm/palmcolor8.map".into(),
        }
    }
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel conversion workers.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_processes: Option<usize>,
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.max_processes.map(|n| n.min(cores)).unwrap_or(cores)
}

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> toml::Value {
    toml::Value::try_from(ConverterConfig::default()).expect("default config must serialize")
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Merge an optional overlay onto the stock defaults, then deserialize and validate.
pub fn resolve_config(overlay: Option<toml::Value>) -> Result<ConverterConfig, ConfigError> {
    let base = stock_defaults_value();
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: ConverterConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from a TOML file, or stock defaults when `path` is `None`.
pub fn load_config(path: Option<&Path>) -> Result<ConverterConfig, ConfigError> {
    let overlay = match path {
        Some(p) => Some(toml::from_str::<toml::Value>(&fs::read_to_string(p)?)?),
        None => None,
    };
    resolve_config(overlay)
}

/// Returns a fully-commented stock `config.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# tbmp-fit Configuration
# ======================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys will cause an error.

# Bit depth used when an image does not request one: 1, 2, 4, 8 or 16.
bpp = 1

# Bounds every image is scaled into (aspect preserved). Omit for unbounded.
# maxwidth = 150
# maxheight = 250

# Inline images that had to be scaled down get a larger alternate rendering
# bounded by these values. Set either one to -1 to disable alternates.
# alt_maxwidth = 600
# alt_maxheight = 600

# Size reduction when an image does not fit one 61,440-byte record.
# try_reduce_bpp steps the depth down (16 -> 8 -> 4 -> 2 -> 1) first;
# otherwise try_reduce_dimension or auto_scale_images shrinks the image.
# Whatever still does not fit is split into tiles.
auto_scale_images = false
try_reduce_bpp = false
try_reduce_dimension = false

# Diagnostic detail: 0 = warnings, 1 = info, 2 = debug, 3 = trace.
# RUST_LOG overrides this when set.
verbosity = 1

# Encoding backend: "rust" (built in) or "netpbm" (external tools below).
image_parser = "rust"

# ---------------------------------------------------------------------------
# netpbm backend
# ---------------------------------------------------------------------------
[netpbm]
giftopnm = "giftopnm"
djpeg = "djpeg"
pngtopnm = "pngtopnm"
palmtopnm = "palmtopnm"
pnmscale = "pnmscale"
pnmcut = "pnmcut"
ppmquant = "ppmquant"
ppmtopgm = "ppmtopgm"
pgmtopbm = "pgmtopbm"
pnmtopalm = "pnmtopalm"
palm2bit_graymap = "/usr/share/netpbm/palmgray2.map"
palm4bit_graymap = "/usr/share/netpbm/palmgray4.map"
palm8bit_colormap = "/usr/share/netpbm/palmcolor8.map"

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum parallel conversion workers. Omit to use all CPU cores.
# max_processes = 4
"##
}
