//! CLI output formatting.
//!
//! Output is **information-first**: every image leads with its positional
//! index and file name, with the rendering details as indented context lines.
//!
//! ## Convert
//!
//! ```text
//! Converting 3 images
//! 001 dawn.png
//!     120x80 @ 1 bpp: 1 record, 1216 bytes
//!     alternate 400x200 @ 1 bpp: 1 record, 10016 bytes
//! 002 wide.png
//!     1600x900 @ 1 bpp: 2x2 tiles, 4 records, 240064 bytes
//! 003 broken.png
//!     failed: Failed to decode source image: ...
//!
//! Converted 2 images, 1 failed → out/
//! ```
//!
//! ## Plan
//!
//! ```text
//! 001 tall.png
//!     300x600 → 125x250 @ 1 bpp (scale 0.417)
//! ```
//!
//! # Architecture
//!
//! Each view has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure: no I/O, no side effects.

use crate::process::{
    ImageOutcome, PlanEntry, ProcessError, ProcessEvent, ProcessManifest, RenderingEntry,
};
use std::path::Path;

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

fn file_name(source: &str) -> String {
    Path::new(source)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.to_string())
}

fn plural(n: usize, word: &str) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}s")
    }
}

/// One line describing a rendering's geometry and records.
fn rendering_line(rendering: &RenderingEntry) -> String {
    let bytes: usize = rendering.records.iter().map(|r| r.bytes).sum();
    let records = plural(rendering.records.len(), "record");
    match rendering.grid {
        Some(grid) => format!(
            "{}x{} @ {} bpp: {}x{} tiles, {records}, {bytes} bytes",
            rendering.width, rendering.height, rendering.depth, grid.columns, grid.rows
        ),
        None => format!(
            "{}x{} @ {} bpp: {records}, {bytes} bytes",
            rendering.width, rendering.height, rendering.depth
        ),
    }
}

/// Format one image's outcome: header plus indented detail lines.
pub fn format_outcome(index: usize, outcome: &ImageOutcome) -> Vec<String> {
    let mut lines = vec![format!(
        "{} {}",
        format_index(index),
        file_name(outcome.source())
    )];
    match outcome {
        ImageOutcome::Converted(image) => {
            lines.push(format!("    {}", rendering_line(&image.rendering)));
            if let Some(alt) = &image.alternate {
                lines.push(format!("    alternate {}", rendering_line(alt)));
            }
        }
        ImageOutcome::Failed { error, .. } => {
            lines.push(format!("    failed: {error}"));
        }
    }
    lines
}

/// Format a single progress event as display lines.
pub fn format_process_event(event: &ProcessEvent) -> Vec<String> {
    match event {
        ProcessEvent::Started { total } => vec![format!("Converting {}", plural(*total, "image"))],
        ProcessEvent::ImageFinished { index, outcome } => format_outcome(*index, outcome),
    }
}

/// Closing summary after all images are done.
pub fn format_summary(manifest: &ProcessManifest, output_dir: &Path) -> Vec<String> {
    let mut line = format!("Converted {}", plural(manifest.converted(), "image"));
    if manifest.failed() > 0 {
        line.push_str(&format!(", {} failed", manifest.failed()));
    }
    line.push_str(&format!(" \u{2192} {}", output_dir.display()));
    vec![String::new(), line]
}

pub fn print_summary(manifest: &ProcessManifest, output_dir: &Path) {
    for line in format_summary(manifest, output_dir) {
        println!("{}", line);
    }
}

/// Format the `plan` view: natural size to resolved target, per file.
pub fn format_plan(entries: &[Result<PlanEntry, ProcessError>]) -> Vec<String> {
    let mut lines = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        match entry {
            Ok(plan) => {
                let target = &plan.target;
                lines.push(format!(
                    "{} {}",
                    format_index(i + 1),
                    file_name(&plan.source.display().to_string())
                ));
                lines.push(format!(
                    "    {}x{} \u{2192} {}x{} @ {} bpp (scale {:.3})",
                    plan.natural.width,
                    plan.natural.height,
                    target.width,
                    target.height,
                    target.depth,
                    target.scaling_factor
                ));
                if let Some(section) = target.section {
                    lines.push(format!("    crop {section}"));
                }
            }
            Err(err) => {
                lines.push(format!("{} (unreadable)", format_index(i + 1)));
                lines.push(format!("    failed: {err}"));
            }
        }
    }
    lines
}

pub fn print_plan(entries: &[Result<PlanEntry, ProcessError>]) {
    for line in format_plan(entries) {
        println!("{}", line);
    }
}
