//! Download response headers.
//!
//! # Responsibilities
//! - Declare the archive's content type and length
//! - Force a download rather than inline rendering
//! - Disable caching, content sniffing and framing for archive responses

use axum::http::{
    header::{self, InvalidHeaderValue},
    HeaderMap, HeaderValue,
};

use crate::security::validator::sanitize_for_display;

/// Headers for a streamed snapshot download.
///
/// `filename` is sanitized before it is placed in `Content-Disposition`.
pub fn download_headers(
    mime: &'static str,
    filename: &str,
    content_length: u64,
) -> Result<HeaderMap, InvalidHeaderValue> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!(
            "attachment; filename=\"{}\"",
            sanitize_for_display(filename)
        ))?,
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    Ok(headers)
}
