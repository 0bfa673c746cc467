//! External-process backend built on the netpbm tool suite.
//!
//! The source is converted to PNM once, when the backend is constructed.
//! Every [`convert`](ImageBackend::convert) then runs one shell pipeline:
//!
//! ```text
//! [pnmscale prescale] | [pnmcut X Y W H] | [pnmscale W H] | <quantize> | pnmtopalm -depth D
//! ```
//!
//! | Depth | Quantize stage |
//! |---|---|
//! | 1 | `ppmtopgm \| pgmtopbm -fs` |
//! | 2, 4 | `ppmquant -map <palm gray map> \| ppmtopgm` |
//! | 8 | `ppmquant -map <palm color map>` |
//! | 16 | none |
//!
//! Tool output is captured in a temporary file owned by the call; it is
//! removed when the call returns, on success and failure alike.

use super::backend::{BackendError, Dimensions, ImageBackend};
use super::params::{ConvertParams, Depth};
use crate::config::NetpbmConfig;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;
use tracing::debug;

/// Exit status `sh` uses for "command not found".
const SHELL_NOT_FOUND: i32 = 127;

/// Backend that shells out to netpbm.
pub struct NetpbmBackend {
    pnm: Vec<u8>,
    size: Dimensions,
    tools: NetpbmConfig,
    verbose: bool,
}

impl NetpbmBackend {
    /// Convert `bytes` of the given MIME type to PNM and read its size.
    pub fn new(
        mime: &str,
        bytes: &[u8],
        tools: &NetpbmConfig,
        verbose: bool,
    ) -> Result<Self, BackendError> {
        let pnm = match decoder_for_mime(mime, tools)? {
            Some(argv) => {
                debug!("Running: {}", argv.join(" "));
                let mut cmd = Command::new(&argv[0]);
                cmd.args(&argv[1..]);
                run_filter(&mut cmd, bytes, &argv[0])?
            }
            None => bytes.to_vec(),
        };
        let size = pnm_size(&pnm).ok_or_else(|| {
            let head = &pnm[..pnm.len().min(15)];
            BackendError::ConversionFailed(format!("invalid PNM header: {head:?}"))
        })?;

        Ok(Self {
            pnm,
            size,
            tools: tools.clone(),
            verbose,
        })
    }

    /// Build the shell pipeline for one conversion.
    pub fn pipeline(&self, params: &ConvertParams) -> Result<String, BackendError> {
        let t = &self.tools;
        let mut stages: Vec<String> = Vec::new();

        if let Some((w, h)) = params.prescale {
            stages.push(format!("{} -width {w} -height {h}", quote(&t.pnmscale)));
        }

        let (src_w, src_h) = match (params.section, params.prescale) {
            (Some(section), _) => {
                stages.push(format!(
                    "{} {} {} {} {}",
                    quote(&t.pnmcut),
                    section.x,
                    section.y,
                    section.width,
                    section.height
                ));
                (section.width, section.height)
            }
            (None, Some(prescale)) => prescale,
            (None, None) => (self.size.width, self.size.height),
        };

        if (src_w, src_h) != (params.width, params.height) {
            debug!(
                "Scaling {src_w}x{src_h} image to {}x{}x{}",
                params.width, params.height, params.depth
            );
            stages.push(format!(
                "{} -width {} -height {}",
                quote(&t.pnmscale),
                params.width,
                params.height
            ));
        }

        let quiet = if self.verbose { "" } else { " -quiet" };
        let quantize_map = |map: &Path| -> Result<String, BackendError> {
            if !map.exists() {
                return Err(BackendError::UnsupportedDepth(params.depth));
            }
            Ok(format!(
                "{}{quiet} -map {}",
                quote(&t.ppmquant),
                quote(&map.to_string_lossy())
            ))
        };
        match params.depth {
            Depth::Mono1 => {
                stages.push(quote(&t.ppmtopgm));
                stages.push(format!("{} -fs", quote(&t.pgmtopbm)));
            }
            Depth::Gray2 => {
                stages.push(quantize_map(&t.palm2bit_graymap)?);
                stages.push(quote(&t.ppmtopgm));
            }
            Depth::Gray4 => {
                stages.push(quantize_map(&t.palm4bit_graymap)?);
                stages.push(quote(&t.ppmtopgm));
            }
            Depth::Color8 => stages.push(quantize_map(&t.palm8bit_colormap)?),
            Depth::Direct16 => {}
        }

        let verbosity = if self.verbose { "-verbose" } else { "-quiet" };
        stages.push(format!(
            "{} -depth {} {verbosity}",
            quote(&t.pnmtopalm),
            params.depth
        ));

        Ok(stages.join(" | "))
    }
}

impl ImageBackend for NetpbmBackend {
    fn natural_size(&self) -> Dimensions {
        self.size
    }

    fn convert(&self, params: &ConvertParams) -> Result<Vec<u8>, BackendError> {
        let pipeline = self.pipeline(params)?;
        debug!("Running: {pipeline}");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&pipeline);
        run_filter(&mut cmd, &self.pnm, &pipeline)
    }
}

/// The argv that turns `mime` into PNM, or `None` if it already is PNM.
fn decoder_for_mime(mime: &str, tools: &NetpbmConfig) -> Result<Option<Vec<String>>, BackendError> {
    let argv = match mime.to_ascii_lowercase().as_str() {
        "image/gif" => vec![tools.giftopnm.clone()],
        "image/jpeg" | "image/jpg" => vec![tools.djpeg.clone(), "-pnm".to_string()],
        "image/png" => vec![tools.pngtopnm.clone()],
        "image/palm" => vec![tools.palmtopnm.clone()],
        "image/pbm" | "image/x-portable-pixmap" | "image/x-portable-anymap" => return Ok(None),
        other => {
            return Err(BackendError::ConversionFailed(format!(
                "unsupported image type {other}"
            )));
        }
    };
    Ok(Some(argv))
}

/// Feed `input` to `cmd` and collect its stdout through a scratch file.
fn run_filter(cmd: &mut Command, input: &[u8], label: &str) -> Result<Vec<u8>, BackendError> {
    let scratch = NamedTempFile::new()?;
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::from(scratch.reopen()?))
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => BackendError::BackendUnavailable(format!("{label}: {e}")),
            _ => BackendError::Io(e),
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| BackendError::ConversionFailed(format!("{label}: no stdin")))?;
    let (written, output) = std::thread::scope(|s| {
        let writer = s.spawn(move || stdin.write_all(input));
        let output = child.wait_with_output();
        (writer.join(), output)
    });
    let output = output?;

    match written {
        Ok(Ok(())) => {}
        // The tool may legitimately stop reading early; its exit status decides.
        Ok(Err(e)) if e.kind() == ErrorKind::BrokenPipe => {}
        Ok(Err(e)) => return Err(BackendError::Io(e)),
        Err(_) => {
            return Err(BackendError::ConversionFailed(format!(
                "{label}: stdin writer panicked"
            )));
        }
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(match output.status.code() {
            Some(SHELL_NOT_FOUND) => BackendError::BackendUnavailable(format!("{label}: {stderr}")),
            code => BackendError::ConversionFailed(format!(
                "call to '{label}' returned status {}: {stderr}",
                code.map_or_else(|| "signal".to_string(), |c| c.to_string())
            )),
        });
    }

    Ok(std::fs::read(scratch.path())?)
}

/// Read width and height from a PNM header (P1–P6), skipping comments.
pub fn pnm_size(data: &[u8]) -> Option<Dimensions> {
    if data.len() < 2 || data[0] != b'P' || !(b'1'..=b'6').contains(&data[1]) {
        return None;
    }

    let mut fields = [0u32; 2];
    let mut pos = 2;
    for field in &mut fields {
        loop {
            match data.get(pos)? {
                b'#' => {
                    while *data.get(pos)? != b'\n' {
                        pos += 1;
                    }
                }
                c if c.is_ascii_whitespace() => pos += 1,
                _ => break,
            }
        }
        let start = pos;
        while data.get(pos).is_some_and(u8::is_ascii_digit) {
            pos += 1;
        }
        *field = std::str::from_utf8(&data[start..pos]).ok()?.parse().ok()?;
    }

    Some(Dimensions {
        width: fields[0],
        height: fields[1],
    })
}

/// Single-quote a word for `sh`.
fn quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:+".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::params::Rect;

    fn ppm(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = format!("P6\n{width} {height}\n255\n").into_bytes();
        bytes.resize(bytes.len() + (width * height * 3) as usize, 0x80);
        bytes
    }

    /// Tools config whose colormap paths all exist.
    fn tools_with_maps(dir: &Path) -> NetpbmConfig {
        let map = dir.join("palm.map");
        std::fs::write(&map, b"P3\n1 1\n255\n0 0 0\n").unwrap();
        NetpbmConfig {
            palm2bit_graymap: map.clone(),
            palm4bit_graymap: map.clone(),
            palm8bit_colormap: map,
            ..NetpbmConfig::default()
        }
    }

    #[test]
    fn pnm_size_reads_binary_and_ascii_headers() {
        assert_eq!(
            pnm_size(b"P4\n640 480\n"),
            Some(Dimensions {
                width: 640,
                height: 480
            })
        );
        assert_eq!(
            pnm_size(b"P6\n# made by hand\n12 7\n255\n"),
            Some(Dimensions {
                width: 12,
                height: 7
            })
        );
        assert_eq!(pnm_size(b"GIF89a"), None);
        assert_eq!(pnm_size(b"P6\n12"), None);
    }

    #[test]
    fn pnm_input_is_used_directly() {
        let backend = NetpbmBackend::new(
            "image/x-portable-anymap",
            &ppm(30, 20),
            &NetpbmConfig::default(),
            false,
        )
        .unwrap();
        assert_eq!(
            backend.natural_size(),
            Dimensions {
                width: 30,
                height: 20
            }
        );
    }

    #[test]
    fn unsupported_mime_fails() {
        let result = NetpbmBackend::new("image/x-icon", b"", &NetpbmConfig::default(), false);
        assert!(matches!(result, Err(BackendError::ConversionFailed(_))));
    }

    #[test]
    fn pipeline_without_scaling_is_quantize_and_write() {
        let backend =
            NetpbmBackend::new("image/pbm", &ppm(30, 20), &NetpbmConfig::default(), false).unwrap();
        let cmd = backend
            .pipeline(&ConvertParams::new(30, 20, Depth::Mono1))
            .unwrap();
        assert_eq!(cmd, "ppmtopgm | pgmtopbm -fs | pnmtopalm -depth 1 -quiet");
    }

    #[test]
    fn pipeline_for_tile_prescales_then_cuts() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backend =
            NetpbmBackend::new("image/pbm", &ppm(300, 200), &tools_with_maps(tmp.path()), true)
                .unwrap();
        let params = ConvertParams::new(100, 50, Depth::Color8)
            .with_prescale(150, 100)
            .with_section(Some(Rect::new(100, 50, 50, 50)));
        let cmd = backend.pipeline(&params).unwrap();

        let stages: Vec<&str> = cmd.split(" | ").collect();
        assert_eq!(stages[0], "pnmscale -width 150 -height 100");
        assert_eq!(stages[1], "pnmcut 100 50 50 50");
        assert_eq!(stages[2], "pnmscale -width 100 -height 50");
        assert!(stages[3].starts_with("ppmquant -map "));
        assert_eq!(stages[4], "pnmtopalm -depth 8 -verbose");
    }

    #[test]
    fn pipeline_direct_color_skips_quantize() {
        let backend =
            NetpbmBackend::new("image/pbm", &ppm(30, 20), &NetpbmConfig::default(), false).unwrap();
        let cmd = backend
            .pipeline(&ConvertParams::new(15, 10, Depth::Direct16))
            .unwrap();
        assert_eq!(
            cmd,
            "pnmscale -width 15 -height 10 | pnmtopalm -depth 16 -quiet"
        );
    }

    #[test]
    fn missing_colormap_is_unsupported_depth() {
        let tools = NetpbmConfig {
            palm4bit_graymap: "/nonexistent/palmgray4.map".into(),
            ..NetpbmConfig::default()
        };
        let backend = NetpbmBackend::new("image/pbm", &ppm(4, 4), &tools, false).unwrap();
        assert!(matches!(
            backend.pipeline(&ConvertParams::new(4, 4, Depth::Gray4)),
            Err(BackendError::UnsupportedDepth(Depth::Gray4))
        ));
    }

    #[test]
    fn missing_tool_is_backend_unavailable() {
        let tools = NetpbmConfig {
            pnmtopalm: "tbmp-fit-no-such-tool".into(),
            ..NetpbmConfig::default()
        };
        let backend = NetpbmBackend::new("image/pbm", &ppm(4, 4), &tools, false).unwrap();
        let result = backend.convert(&ConvertParams::new(4, 4, Depth::Direct16));
        assert!(matches!(result, Err(BackendError::BackendUnavailable(_))));
    }

    #[test]
    fn failing_tool_is_conversion_failed() {
        let tools = NetpbmConfig {
            pnmtopalm: "false".into(),
            ..NetpbmConfig::default()
        };
        let backend = NetpbmBackend::new("image/pbm", &ppm(4, 4), &tools, false).unwrap();
        let result = backend.convert(&ConvertParams::new(4, 4, Depth::Direct16));
        assert!(matches!(result, Err(BackendError::ConversionFailed(_))));
    }

    #[test]
    fn quote_leaves_plain_words_alone() {
        assert_eq!(quote("pnmscale"), "pnmscale");
        assert_eq!(quote("/usr/share/netpbm/palmgray4.map"), "/usr/share/netpbm/palmgray4.map");
        assert_eq!(quote("my map"), "'my map'");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }
}
