//! Batch conversion of image files into Palm bitmap records.
//!
//! Takes a list of source files and converts each one with
//! [`convert_image`](crate::convert::convert_image), writing every encoded
//! record to the output directory alongside a `manifest.json`.
//!
//! ## Output Structure
//!
//! ```text
//! out/
//! ├── manifest.json          # One entry per source file, in input order
//! ├── dawn.tbmp              # Image that fit in one record
//! ├── panorama-Multi0.tbmp   # Pieces of a tiled image, row-major
//! ├── panorama-Multi1.tbmp
//! ├── ...
//! └── dawn-alt.tbmp          # Larger alternate of an inline image
//! ```
//!
//! ## Failure Isolation
//!
//! A file that cannot be read, decoded, or encoded becomes an
//! [`ImageOutcome::Failed`] entry; the other files are still converted.
//! Only errors writing the output directory abort the run.
//!
//! ## Parallel Processing
//!
//! Files are converted in parallel using [rayon](https://docs.rs/rayon). All
//! images share one [`PieceIdAllocator`], so piece ids are unique across
//! the whole run.

use crate::attributes::RequestAttributes;
use crate::config::{ConverterConfig, ImageParser};
use crate::convert::{ConvertError, convert_image, resolve_target};
use crate::document::{ImageDocument, PieceIdAllocator};
use crate::imaging::{
    BackendError, Depth, Dimensions, ImageBackend, NetpbmBackend, RustBackend, TargetGeometry,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

/// File extension of written records.
pub const RECORD_EXTENSION: &str = "tbmp";

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error("Cannot build a URL for {0}")]
    InvalidPath(PathBuf),
}

const MIME_TYPES: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
    ("pbm", "image/x-portable-anymap"),
    ("pgm", "image/x-portable-anymap"),
    ("ppm", "image/x-portable-anymap"),
    ("pnm", "image/x-portable-anymap"),
    ("palm", "image/palm"),
];

/// Guess a MIME type from the file extension.
pub fn mime_for_path(path: &Path) -> &'static str {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| {
            MIME_TYPES
                .iter()
                .find(|(e, _)| e.eq_ignore_ascii_case(ext))
        })
        .map(|(_, mime)| *mime)
        .unwrap_or("application/octet-stream")
}

/// A source file read into memory.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub path: PathBuf,
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

impl SourceImage {
    pub fn read(path: &Path) -> Result<Self, ProcessError> {
        Ok(Self {
            path: path.to_path_buf(),
            mime: mime_for_path(path),
            bytes: std::fs::read(path)?,
        })
    }

    /// `file://` URL of the source, used as the base of canonical URLs.
    pub fn url(&self) -> Result<Url, ProcessError> {
        let absolute = std::fs::canonicalize(&self.path)?;
        Url::from_file_path(&absolute).map_err(|()| ProcessError::InvalidPath(absolute))
    }

    /// Decode with the backend selected by `config.image_parser`.
    pub fn open_backend(
        &self,
        config: &ConverterConfig,
    ) -> Result<Box<dyn ImageBackend>, BackendError> {
        Ok(match config.image_parser {
            ImageParser::Rust => Box::new(RustBackend::from_bytes(self.mime, &self.bytes)?),
            ImageParser::Netpbm => Box::new(NetpbmBackend::new(
                self.mime,
                &self.bytes,
                &config.netpbm,
                config.verbosity > 1,
            )?),
        })
    }
}

/// One written record file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    /// File name inside the output directory.
    pub file: String,
    pub url: String,
    /// Record id, for tile pieces only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    pub bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridEntry {
    pub columns: u32,
    pub rows: u32,
}

/// One rendering of a source: the main one or its alternate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderingEntry {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub depth: Depth,
    /// Present when the rendering was tiled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid: Option<GridEntry>,
    pub records: Vec<RecordEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertedImage {
    pub source: String,
    pub natural: (u32, u32),
    pub rendering: RenderingEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternate: Option<RenderingEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImageOutcome {
    Converted(ConvertedImage),
    Failed { source: String, error: String },
}

impl ImageOutcome {
    pub fn source(&self) -> &str {
        match self {
            ImageOutcome::Converted(image) => &image.source,
            ImageOutcome::Failed { source, .. } => source,
        }
    }
}

/// Written to `manifest.json` in the output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessManifest {
    pub images: Vec<ImageOutcome>,
}

impl ProcessManifest {
    pub fn converted(&self) -> usize {
        self.images
            .iter()
            .filter(|i| matches!(i, ImageOutcome::Converted(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.images.len() - self.converted()
    }
}

/// Progress events sent while processing, for the CLI to print.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Started { total: usize },
    /// `index` is the 1-based position in the input list.
    ImageFinished { index: usize, outcome: ImageOutcome },
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

/// Whether `name` is one of the stems written for the records of `stem`:
/// `-alt`, `-MultiN` or `-alt-MultiN`.
fn is_derived_stem(name: &str, stem: &str) -> bool {
    let Some(rest) = name.strip_prefix(stem) else {
        return false;
    };
    let (alternate, rest) = match rest.strip_prefix("-alt") {
        Some(rest) => (true, rest),
        None => (false, rest),
    };
    match rest.strip_prefix("-Multi") {
        Some(n) => !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()),
        None => alternate && rest.is_empty(),
    }
}

/// Output stem of each input, in input order. A stem whose record files
/// would overlap an earlier input's gets a `-2`, `-3`, ... suffix.
fn unique_stems(inputs: &[PathBuf]) -> Vec<String> {
    let mut taken: Vec<String> = Vec::with_capacity(inputs.len());
    for path in inputs {
        let stem = file_stem(path);
        let clashes = |candidate: &str| {
            taken.iter().any(|t| {
                t == candidate || is_derived_stem(candidate, t) || is_derived_stem(t, candidate)
            })
        };
        let mut candidate = stem.clone();
        let mut n = 2;
        while clashes(&candidate) {
            candidate = format!("{stem}-{n}");
            n += 1;
        }
        if candidate != stem {
            warn!(
                "{} clashes with an earlier input, writing it as {candidate}",
                path.display()
            );
        }
        taken.push(candidate);
    }
    taken
}

/// Convert every file in `inputs` into `output_dir`.
pub fn process(
    inputs: &[PathBuf],
    output_dir: &Path,
    config: &ConverterConfig,
    attributes: &RequestAttributes,
    allocator: &PieceIdAllocator,
    events: Option<Sender<ProcessEvent>>,
) -> Result<ProcessManifest, ProcessError> {
    std::fs::create_dir_all(output_dir)?;
    if let Some(tx) = &events {
        tx.send(ProcessEvent::Started {
            total: inputs.len(),
        })
        .ok();
    }

    let stems = unique_stems(inputs);
    let images = inputs
        .par_iter()
        .zip(stems.par_iter())
        .enumerate()
        .map(|(i, (path, stem))| {
            let outcome = match convert_source(path, stem, config, attributes, allocator) {
                Ok(conversion) => ImageOutcome::Converted(conversion.write(output_dir)?),
                Err(err) => {
                    warn!("Skipping {}: {err}", path.display());
                    ImageOutcome::Failed {
                        source: path.display().to_string(),
                        error: err.to_string(),
                    }
                }
            };
            if let Some(tx) = &events {
                tx.send(ProcessEvent::ImageFinished {
                    index: i + 1,
                    outcome: outcome.clone(),
                })
                .ok();
            }
            Ok(outcome)
        })
        .collect::<Result<Vec<_>, ProcessError>>()?;

    let manifest = ProcessManifest { images };
    let json = serde_json::to_string_pretty(&manifest)?;
    std::fs::write(output_dir.join("manifest.json"), json)?;
    Ok(manifest)
}

/// A converted source whose records are not yet on disk.
struct Conversion {
    source: PathBuf,
    stem: String,
    natural: Dimensions,
    document: ImageDocument,
    alternate: Option<ImageDocument>,
}

/// Everything that can fail for one image alone: reading, decoding, encoding.
fn convert_source(
    path: &Path,
    stem: &str,
    config: &ConverterConfig,
    attributes: &RequestAttributes,
    allocator: &PieceIdAllocator,
) -> Result<Conversion, ProcessError> {
    let source = SourceImage::read(path)?;
    let base_url = source.url()?.to_string();
    let backend = source.open_backend(config)?;
    let natural = backend.natural_size();
    let document = convert_image(backend.as_ref(), &base_url, attributes, config, allocator)?;

    // Alternates are converted one level deep; they never link further.
    let mut alternate = None;
    for descriptor in document.related() {
        match convert_image(
            backend.as_ref(),
            &descriptor.url,
            &descriptor.attributes,
            config,
            allocator,
        ) {
            Ok(alt) => alternate = Some(alt),
            Err(err) => warn!("Alternate of {} failed: {err}", path.display()),
        }
    }

    Ok(Conversion {
        source: source.path.clone(),
        stem: stem.to_string(),
        natural,
        document,
        alternate,
    })
}

impl Conversion {
    fn write(self, output_dir: &Path) -> Result<ConvertedImage, ProcessError> {
        let rendering = write_document(&self.document, output_dir, &self.stem)?;
        info!(
            "Converted {} to {}x{}x{} in {} record(s), {} bytes",
            self.source.display(),
            rendering.width,
            rendering.height,
            rendering.depth,
            rendering.records.len(),
            self.document.size()
        );
        let alternate = self
            .alternate
            .map(|alt| write_document(&alt, output_dir, &format!("{}-alt", self.stem)))
            .transpose()?;

        Ok(ConvertedImage {
            source: self.source.display().to_string(),
            natural: (self.natural.width, self.natural.height),
            rendering,
            alternate,
        })
    }
}

fn write_record(
    output_dir: &Path,
    file: String,
    url: &str,
    id: Option<u32>,
    data: &[u8],
) -> Result<RecordEntry, ProcessError> {
    std::fs::write(output_dir.join(&file), data)?;
    Ok(RecordEntry {
        file,
        url: url.to_string(),
        id,
        bytes: data.len(),
    })
}

/// Write a document's records as `<stem>.tbmp` or `<stem>-MultiN.tbmp`.
fn write_document(
    document: &ImageDocument,
    output_dir: &Path,
    stem: &str,
) -> Result<RenderingEntry, ProcessError> {
    let geometry = document.geometry();
    let (grid, records) = match document {
        ImageDocument::Single(single) => {
            let file = format!("{stem}.{RECORD_EXTENSION}");
            let record = write_record(output_dir, file, &single.url, None, &single.data)?;
            (None, vec![record])
        }
        ImageDocument::Multi(container) => {
            let records = container
                .pieces
                .iter()
                .enumerate()
                .map(|(n, piece)| {
                    let file = format!("{stem}-Multi{n}.{RECORD_EXTENSION}");
                    write_record(
                        output_dir,
                        file,
                        &piece.document.url,
                        Some(piece.id),
                        &piece.document.data,
                    )
                })
                .collect::<Result<Vec<_>, _>>()?;
            let grid = GridEntry {
                columns: container.columns,
                rows: container.rows,
            };
            (Some(grid), records)
        }
    };

    Ok(RenderingEntry {
        url: document.url().to_string(),
        width: geometry.width,
        height: geometry.height,
        depth: geometry.depth,
        grid,
        records,
    })
}

/// Resolved geometry of one file, without encoding.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub source: PathBuf,
    pub natural: Dimensions,
    pub target: TargetGeometry,
}

/// Decode each file and resolve its target geometry.
pub fn plan(
    inputs: &[PathBuf],
    config: &ConverterConfig,
    attributes: &RequestAttributes,
) -> Vec<Result<PlanEntry, ProcessError>> {
    inputs
        .iter()
        .map(|path| {
            let source = SourceImage::read(path)?;
            let backend = source.open_backend(config)?;
            let natural = backend.natural_size();
            Ok(PlanEntry {
                source: path.clone(),
                natural,
                target: resolve_target(attributes, config, natural),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::write_test_png;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn run(
        inputs: &[PathBuf],
        out: &Path,
        config: &ConverterConfig,
        attrs: &RequestAttributes,
    ) -> ProcessManifest {
        process(inputs, out, config, attrs, &PieceIdAllocator::default(), None).unwrap()
    }

    #[test]
    fn mime_guessed_from_extension() {
        assert_eq!(mime_for_path(Path::new("a/photo.JPG")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("scan.pgm")), "image/x-portable-anymap");
        assert_eq!(mime_for_path(Path::new("icon.palm")), "image/palm");
        assert_eq!(mime_for_path(Path::new("README")), "application/octet-stream");
    }

    #[test]
    fn backend_errors_keep_their_own_message() {
        let err = ProcessError::from(BackendError::BackendUnavailable("pnmtopalm".into()));
        assert_eq!(err.to_string(), "Backend unavailable: pnmtopalm");
        let err = ProcessError::from(BackendError::ConversionFailed("exit status 1".into()));
        assert_eq!(err.to_string(), "Conversion failed: exit status 1");
        let backend = BackendError::ConversionFailed("exit status 1".into());
        let err = ProcessError::from(ConvertError::Backend(backend));
        assert_eq!(err.to_string(), "Conversion failed: exit status 1");
    }

    #[test]
    fn source_url_is_absolute_file_url() {
        let tmp = TempDir::new().unwrap();
        let path = write_test_png(tmp.path(), "dawn.png", 4, 4);
        let source = SourceImage::read(&path).unwrap();
        let url = source.url().unwrap();
        assert_eq!(url.scheme(), "file");
        assert!(url.path().ends_with("/dawn.png"));
    }

    #[test]
    fn clashing_stems_get_numbered() {
        let inputs: Vec<PathBuf> = [
            "a/photo.png",
            "b/photo.jpg",
            "photo-alt.png",
            "wide-Multi3.gif",
            "wide.png",
            "c/photo.png",
            "photo-album.png",
        ]
        .iter()
        .map(PathBuf::from)
        .collect();
        assert_eq!(
            unique_stems(&inputs),
            vec![
                "photo",
                "photo-2",
                "photo-alt-2",
                "wide-Multi3",
                "wide-2",
                "photo-3",
                "photo-album"
            ]
        );
    }

    #[test]
    fn same_stem_in_two_directories_writes_two_records() {
        let tmp = TempDir::new().unwrap();
        let a = write_test_png(&tmp.path().join("a"), "photo.png", 16, 16);
        let b = write_test_png(&tmp.path().join("b"), "photo.png", 24, 24);
        let out = tmp.path().join("out");

        let manifest = run(
            &[a, b],
            &out,
            &ConverterConfig::default(),
            &RequestAttributes::default(),
        );

        let files: Vec<String> = manifest
            .images
            .iter()
            .map(|image| match image {
                ImageOutcome::Converted(image) => image.rendering.records[0].file.clone(),
                ImageOutcome::Failed { error, .. } => panic!("{error}"),
            })
            .collect();
        assert_eq!(files, vec!["photo.tbmp", "photo-2.tbmp"]);
        assert_eq!(std::fs::read(out.join("photo.tbmp")).unwrap()[..2], [0, 16]);
        assert_eq!(std::fs::read(out.join("photo-2.tbmp")).unwrap()[..2], [0, 24]);
    }

    #[test]
    fn small_image_writes_one_record_and_manifest() {
        let tmp = TempDir::new().unwrap();
        let path = write_test_png(tmp.path(), "dawn.png", 120, 80);
        let out = tmp.path().join("out");

        let manifest = run(
            &[path],
            &out,
            &ConverterConfig::default(),
            &RequestAttributes::default(),
        );

        assert_eq!(manifest.converted(), 1);
        let ImageOutcome::Converted(image) = &manifest.images[0] else {
            panic!("expected conversion");
        };
        assert_eq!(image.natural, (120, 80));
        assert_eq!((image.rendering.width, image.rendering.height), (120, 80));
        assert_eq!(image.rendering.grid, None);
        assert_eq!(image.rendering.records.len(), 1);
        assert!(image.rendering.url.ends_with("dawn.png?width=120&height=80&depth=1"));

        let record = &image.rendering.records[0];
        assert_eq!(record.file, "dawn.tbmp");
        let written = std::fs::read(out.join("dawn.tbmp")).unwrap();
        assert_eq!(written.len(), record.bytes);

        let on_disk: ProcessManifest =
            serde_json::from_str(&std::fs::read_to_string(out.join("manifest.json")).unwrap())
                .unwrap();
        assert_eq!(on_disk, manifest);
    }

    #[test]
    fn large_image_is_tiled_into_pieces() {
        let tmp = TempDir::new().unwrap();
        let path = write_test_png(tmp.path(), "wide.png", 1600, 900);
        let out = tmp.path().join("out");

        let manifest = run(
            &[path],
            &out,
            &ConverterConfig::default(),
            &RequestAttributes::default(),
        );

        let ImageOutcome::Converted(image) = &manifest.images[0] else {
            panic!("expected conversion");
        };
        assert_eq!(
            image.rendering.grid,
            Some(GridEntry {
                columns: 2,
                rows: 2
            })
        );
        let files: Vec<&str> = image
            .rendering
            .records
            .iter()
            .map(|r| r.file.as_str())
            .collect();
        assert_eq!(
            files,
            vec!["wide-Multi0.tbmp", "wide-Multi1.tbmp", "wide-Multi2.tbmp", "wide-Multi3.tbmp"]
        );
        let ids: Vec<Option<u32>> = image.rendering.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![Some(1), Some(2), Some(3), Some(4)]);
        for record in &image.rendering.records {
            assert!(out.join(&record.file).exists());
        }
    }

    #[test]
    fn failed_image_does_not_stop_siblings() {
        let tmp = TempDir::new().unwrap();
        let good = write_test_png(tmp.path(), "good.png", 32, 32);
        let bad = tmp.path().join("bad.png");
        std::fs::write(&bad, b"not a png").unwrap();
        let missing = tmp.path().join("missing.png");
        let out = tmp.path().join("out");

        let manifest = run(
            &[bad, good, missing],
            &out,
            &ConverterConfig::default(),
            &RequestAttributes::default(),
        );

        assert_eq!(manifest.images.len(), 3);
        assert_eq!(manifest.converted(), 1);
        assert_eq!(manifest.failed(), 2);
        let ImageOutcome::Failed { error, .. } = &manifest.images[0] else {
            panic!("expected failure");
        };
        assert!(error.starts_with("Failed to decode source image"), "{error}");
        assert!(manifest.images[1].source().ends_with("good.png"));
        assert!(out.join("good.tbmp").exists());
    }

    #[test]
    fn inline_scaled_image_writes_alternate() {
        let tmp = TempDir::new().unwrap();
        let path = write_test_png(tmp.path(), "photo.png", 800, 400);
        let out = tmp.path().join("out");
        let config = ConverterConfig {
            maxwidth: Some(160),
            alt_maxwidth: Some(400),
            ..ConverterConfig::default()
        };
        let attrs = RequestAttributes {
            inline: true,
            ..RequestAttributes::default()
        };

        let manifest = run(&[path], &out, &config, &attrs);

        let ImageOutcome::Converted(image) = &manifest.images[0] else {
            panic!("expected conversion");
        };
        assert_eq!((image.rendering.width, image.rendering.height), (160, 80));
        let alt = image.alternate.as_ref().unwrap();
        assert_eq!((alt.width, alt.height), (400, 200));
        assert_eq!(alt.records[0].file, "photo-alt.tbmp");
        assert!(out.join("photo-alt.tbmp").exists());
    }

    #[test]
    fn events_report_every_image() {
        let tmp = TempDir::new().unwrap();
        let a = write_test_png(tmp.path(), "a.png", 8, 8);
        let b = write_test_png(tmp.path(), "b.png", 8, 8);
        let (tx, rx) = mpsc::channel();

        process(
            &[a, b],
            &tmp.path().join("out"),
            &ConverterConfig::default(),
            &RequestAttributes::default(),
            &PieceIdAllocator::default(),
            Some(tx),
        )
        .unwrap();

        let events: Vec<ProcessEvent> = rx.iter().collect();
        assert!(matches!(events[0], ProcessEvent::Started { total: 2 }));
        let mut indices: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::ImageFinished { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn plan_resolves_without_writing() {
        let tmp = TempDir::new().unwrap();
        let path = write_test_png(tmp.path(), "tall.png", 300, 600);
        let config = ConverterConfig {
            maxheight: Some(250),
            ..ConverterConfig::default()
        };

        let plans = plan(&[path], &config, &RequestAttributes::default());

        let entry = plans[0].as_ref().unwrap();
        assert_eq!(
            entry.natural,
            Dimensions {
                width: 300,
                height: 600
            }
        );
        assert_eq!((entry.target.width, entry.target.height), (125, 250));
    }
}
