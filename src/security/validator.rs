//! Snapshot filename and path validation.
//!
//! # Responsibilities
//! - Constrain requested names to the snapshot naming contract
//! - Resolve names against the backup directory without allowing escapes
//! - Reject missing or zero-length files before streaming starts
//!
//! # Design Decisions
//! - The security gate always runs on the name exactly as requested;
//!   [`sanitize_for_display`] is only ever used for labels
//! - Containment is decided on canonical paths, so symlinks pointing outside
//!   the backup directory are rejected even when the joined path looks fine

use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

/// Longest filename accepted.
pub const MAX_FILENAME_LEN: usize = 255;

/// Extensions that may be listed and downloaded.
pub const ALLOWED_EXTENSIONS: &[&str] = &[".tar.gz", ".gz"];

/// MIME types a downloadable snapshot may resolve to.
pub const ALLOWED_MIME_TYPES: &[&str] = &["application/gzip", "application/x-gzip"];

/// Fallback MIME type for unknown extensions.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Suffix addressing the metadata representation of a snapshot.
pub const METADATA_SUFFIX: &str = ".header.json";

const FORBIDDEN_SEQUENCES: &[&str] = &["..", "\\", "/", ":", "*", "?", "\"", "<", ">", "|"];

// Longest extensions first so `.tar.gz` wins over `.gz`.
const MIME_TABLE: &[(&str, &str)] = &[
    (".tar.gz", "application/gzip"),
    (".header.json", "application/json"),
    (".gz", "application/gzip"),
    (".json", "application/json"),
    (".tar", "application/x-tar"),
];

static SNAPSHOT_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^snapshot_\d+_\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2}\.(gz|tar\.gz|header\.json)$")
        .unwrap()
});

/// Why a requested snapshot was refused.
#[derive(Debug, thiserror::Error)]
pub enum FileRejection {
    #[error("filename is empty")]
    EmptyName,
    #[error("filename exceeds 255 characters")]
    NameTooLong,
    #[error("filename does not match the snapshot pattern")]
    PatternMismatch,
    #[error("filename contains forbidden sequence {0:?}")]
    ForbiddenSequence(&'static str),
    #[error("file extension is not allowed")]
    ExtensionNotAllowed,
    #[error("file type {0} is not allowed")]
    MimeNotAllowed(&'static str),
    #[error("path escapes the backup directory")]
    OutsideBaseDir,
    #[error("file not found")]
    NotFound,
    #[error("file is empty")]
    EmptyFile,
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

impl FileRejection {
    /// True when the rejection means "nothing to serve" rather than a bad request.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FileRejection::NotFound | FileRejection::EmptyFile)
    }
}

/// Check a requested name against the snapshot naming contract.
pub fn validate_filename(name: &str) -> Result<(), FileRejection> {
    if name.is_empty() {
        return Err(FileRejection::EmptyName);
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(FileRejection::NameTooLong);
    }
    if !SNAPSHOT_FILENAME.is_match(name) {
        return Err(FileRejection::PatternMismatch);
    }
    // The pattern already constrains the charset; this stays as a second line.
    if let Some(seq) = FORBIDDEN_SEQUENCES
        .iter()
        .copied()
        .find(|seq| name.contains(*seq))
    {
        return Err(FileRejection::ForbiddenSequence(seq));
    }
    Ok(())
}

/// The allow-listed extension of `name`, if any.
pub fn allowed_extension(name: &str) -> Option<&'static str> {
    ALLOWED_EXTENSIONS
        .iter()
        .copied()
        .find(|ext| name.ends_with(ext))
}

pub fn validate_extension(name: &str) -> Result<(), FileRejection> {
    allowed_extension(name)
        .map(|_| ())
        .ok_or(FileRejection::ExtensionNotAllowed)
}

/// MIME type for `name` from the fixed extension table.
pub fn mime_type_for(name: &str) -> &'static str {
    MIME_TABLE
        .iter()
        .find(|(ext, _)| name.ends_with(ext))
        .map(|(_, mime)| *mime)
        .unwrap_or(DEFAULT_MIME_TYPE)
}

/// Resolve the MIME type for a download and make sure it is one we serve.
pub fn validate_mime(name: &str) -> Result<&'static str, FileRejection> {
    let mime = mime_type_for(name);
    if ALLOWED_MIME_TYPES.contains(&mime) {
        Ok(mime)
    } else {
        Err(FileRejection::MimeNotAllowed(mime))
    }
}

/// Join `name` onto `base_dir` and prove the real target lives inside it.
///
/// Both sides are canonicalized, following symlinks, before comparing.
pub async fn resolve_path(name: &str, base_dir: &Path) -> Result<PathBuf, FileRejection> {
    let base = tokio::fs::canonicalize(base_dir)
        .await
        .map_err(map_not_found)?;
    let candidate = tokio::fs::canonicalize(base_dir.join(name))
        .await
        .map_err(map_not_found)?;

    if candidate == base || !candidate.starts_with(&base) {
        return Err(FileRejection::OutsideBaseDir);
    }
    Ok(candidate)
}

/// Stat `path` and refuse missing or zero-length files.
pub async fn validate_not_empty(path: &Path) -> Result<Metadata, FileRejection> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| FileRejection::NotFound)?;
    if !metadata.is_file() {
        return Err(FileRejection::NotFound);
    }
    if metadata.len() == 0 {
        return Err(FileRejection::EmptyFile);
    }
    Ok(metadata)
}

/// Strip everything outside `[A-Za-z0-9._-]`. For labels only, never a gate.
pub fn sanitize_for_display(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}

fn map_not_found(err: std::io::Error) -> FileRejection {
    if err.kind() == ErrorKind::NotFound {
        FileRejection::NotFound
    } else {
        FileRejection::Io(err)
    }
}
