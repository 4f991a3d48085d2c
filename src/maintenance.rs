//! Read-parse-write pass over script files.
//!
//! Scripts whose released version carries the `+` marker are read from disk,
//! trimmed and written next to the original with an extra extension. The pass
//! works on files only and never talks to a node.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{DeployError, DeployResult};
use crate::script::FirmwareScriptDescriptor;

/// Extension appended to trimmed files.
pub const DEFAULT_DEBUG_EXTENSION: &str = ".debug";

/// Files this short hold no script.
const MIN_USABLE_LEN: usize = 3;

/// Cleans raw script text before it is written again.
pub trait SourceTrimmer {
    /// Returns the trimmed text.
    fn trim(&self, source: &str) -> String;
}

/// Drops full-line `--` comments, trailing whitespace and blank lines.
///
/// Block comments and comments after code are left untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineTrimmer;

impl SourceTrimmer for LineTrimmer {
    fn trim(&self, source: &str) -> String {
        source
            .lines()
            .map(str::trim_end)
            .filter(|line| {
                let code = line.trim_start();
                !code.is_empty() && (!code.starts_with("--") || code.starts_with("--[["))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// `path` with `extension` appended to the full file name.
pub fn output_path(path: &Path, extension: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(extension);
    PathBuf::from(name)
}

/// Trims one script file and writes the result to `path + extension`.
///
/// # Errors
/// - `FileNotFound` if the file does not exist
/// - `FileNotUsable` if it holds two bytes or fewer
/// - `EmptyTrimResult` if trimming leaves nothing
pub fn read_parse_write(path: &Path, trimmer: &dyn SourceTrimmer, extension: &str) -> DeployResult<PathBuf> {
    if !path.is_file() {
        return Err(DeployError::FileNotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path)?;
    if bytes.len() < MIN_USABLE_LEN {
        return Err(DeployError::FileNotUsable {
            path: path.to_path_buf(),
            len: bytes.len(),
        });
    }
    let text = String::from_utf8_lossy(&bytes);
    let trimmed = trimmer.trim(&text);
    if trimmed.trim().is_empty() {
        return Err(DeployError::EmptyTrimResult(path.to_path_buf()));
    }

    let extension = if extension.is_empty() { DEFAULT_DEBUG_EXTENSION } else { extension };
    let output = output_path(path, extension);
    fs::write(&output, trimmed)?;
    info!("Trimmed {} -> {}", path.display(), output.display());
    Ok(output)
}

/// Runs [`read_parse_write`] for every descriptor that asks for it.
pub fn maintain_catalog<'a>(
    descriptors: impl IntoIterator<Item = &'a FirmwareScriptDescriptor>,
    trimmer: &dyn SourceTrimmer,
    extension: &str,
) -> DeployResult<Vec<PathBuf>> {
    descriptors
        .into_iter()
        .filter(|d| d.requires_read_parse_write())
        .map(|d| read_parse_write(&d.file_path(), trimmer, extension))
        .collect()
}
