//! Response shaping: inline small results, spill large ones to disk and hand
//! back a reference.
//!
//! Spill files are named by a digest of their content, so shaping the same
//! bytes twice reuses the same path and concurrent writers of one payload
//! cannot collide. The shaper writes nothing outside the request's
//! `output_dir`.

use std::path::{Path, PathBuf};

use serde_json::json;
use sha2::{Digest, Sha256};

use mcpu_core::{CoreError, ResponseMode};

/// Payloads at or below this size inline in `auto` mode.
pub const INLINE_THRESHOLD_BYTES: usize = 8 * 1024;
/// Preview length for `summary` results.
pub const SUMMARY_PREVIEW_BYTES: usize = 512;
/// Preview length for `refs` results.
pub const REFS_PREVIEW_BYTES: usize = 200;

const SPILL_DIGEST_CHARS: usize = 12;

/// One shaped payload: either fully inline, or a spill reference with a
/// bounded preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapedResult {
    pub truncated: bool,
    pub inline: Option<String>,
    pub preview: Option<String>,
    pub file: Option<PathBuf>,
    pub bytes: usize,
}

impl ShapedResult {
    fn full(payload: &str) -> Self {
        Self {
            truncated: false,
            inline: Some(payload.to_string()),
            preview: None,
            file: None,
            bytes: payload.len(),
        }
    }

    /// Render for a `CoreResult.output` field: the payload itself when
    /// inline, otherwise a JSON body holding the spill reference (the only
    /// place the spill path appears).
    pub fn render(&self) -> String {
        if let Some(inline) = &self.inline {
            return inline.clone();
        }
        json!({
            "truncated": self.truncated,
            "preview": self.preview,
            "file": self.file,
            "bytes": self.bytes,
            "mime": "application/json",
        })
        .to_string()
    }
}

/// Shape `payload` according to `mode`, spilling under `output_dir`.
///
/// `auto` without an output directory inlines unconditionally (the shaper
/// never writes anywhere else); explicit `summary`/`refs` without one is a
/// validation error.
pub fn shape_payload(
    payload: &str,
    mode: ResponseMode,
    output_dir: Option<&Path>,
) -> Result<ShapedResult, CoreError> {
    match mode {
        ResponseMode::Full => Ok(ShapedResult::full(payload)),
        ResponseMode::Auto => {
            if payload.len() <= INLINE_THRESHOLD_BYTES || output_dir.is_none() {
                Ok(ShapedResult::full(payload))
            } else {
                spill(payload, require_dir(output_dir, "summary")?, SUMMARY_PREVIEW_BYTES)
            }
        }
        ResponseMode::Summary => spill(
            payload,
            require_dir(output_dir, "summary")?,
            SUMMARY_PREVIEW_BYTES,
        ),
        ResponseMode::Refs => spill(payload, require_dir(output_dir, "refs")?, REFS_PREVIEW_BYTES),
    }
}

fn require_dir<'a>(output_dir: Option<&'a Path>, mode: &str) -> Result<&'a Path, CoreError> {
    output_dir.ok_or_else(|| {
        CoreError::Validation(format!(
            "response mode '{mode}' requires an output directory"
        ))
    })
}

fn spill(payload: &str, output_dir: &Path, preview_bytes: usize) -> Result<ShapedResult, CoreError> {
    let path = spill_path(output_dir, payload);
    write_spill_file(&path, payload, output_dir)?;
    Ok(ShapedResult {
        truncated: true,
        inline: None,
        preview: Some(truncate_on_char_boundary(payload, preview_bytes).to_string()),
        file: Some(path),
        bytes: payload.len(),
    })
}

/// Deterministic spill path: `<output_dir>/mcpu-<digest>.json`.
pub fn spill_path(output_dir: &Path, payload: &str) -> PathBuf {
    let digest = Sha256::digest(payload.as_bytes());
    let short: String = digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>()
        .chars()
        .take(SPILL_DIGEST_CHARS)
        .collect();
    output_dir.join(format!("mcpu-{short}.json"))
}

fn write_spill_file(path: &Path, payload: &str, output_dir: &Path) -> Result<(), CoreError> {
    if path.exists() {
        // Same digest, same bytes: the earlier write already holds them.
        return Ok(());
    }
    std::fs::create_dir_all(output_dir).map_err(|error| {
        CoreError::Internal(format!(
            "cannot create output directory {}: {error}",
            output_dir.display()
        ))
    })?;
    let write = || -> anyhow::Result<()> {
        use std::io::Write;
        let mut temp = tempfile::NamedTempFile::new_in(output_dir)?;
        temp.write_all(payload.as_bytes())?;
        temp.flush()?;
        temp.persist(path)?;
        Ok(())
    };
    write().map_err(|error| {
        CoreError::Internal(format!(
            "failed to write spill file {}: {error}",
            path.display()
        ))
    })
}

fn truncate_on_char_boundary(payload: &str, max_bytes: usize) -> &str {
    if payload.len() <= max_bytes {
        return payload;
    }
    let mut end = max_bytes;
    while end > 0 && !payload.is_char_boundary(end) {
        end -= 1;
    }
    &payload[..end]
}
