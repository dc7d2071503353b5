//! Snapshot catalog.
//!
//! # Responsibilities
//! - Scan the backup directory (non-recursively) on every request
//! - Keep allow-listed archives only, newest block first
//! - Derive labels, timestamps and URLs for each archive
//!
//! # Design Decisions
//! - A missing backup directory is an empty catalog, not an error
//! - Files that vanish mid-scan are skipped
//! - Public URLs use `http` only for `localhost`; any other host is assumed
//!   to sit behind a TLS-terminating proxy on the default port

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use regex::Regex;
use serde::Serialize;
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::SystemTime;

use crate::security::validator::{allowed_extension, sanitize_for_display, METADATA_SUFFIX};
use crate::storage::resolver::BackupDirResolver;

static BLOCK_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^snapshot_(\d+)_").unwrap());

static EMBEDDED_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^snapshot_\d+_(\d{4}-\d{2}-\d{2})_(\d{2})-(\d{2})-(\d{2})\.").unwrap()
});

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read backup directory {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One archive as presented to clients.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub filename: String,
    pub block_id: u64,
    pub last_modified: String,
    pub description: String,
    pub download_url: String,
    pub metadata_url: String,
    pub size: u64,
}

/// The `GET /snapshots` body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotListing {
    pub snapshots: Vec<SnapshotEntry>,
    pub total_count: usize,
}

impl SnapshotListing {
    fn new(snapshots: Vec<SnapshotEntry>) -> Self {
        Self {
            total_count: snapshots.len(),
            snapshots,
        }
    }
}

/// Builds the public URLs advertised for each archive.
#[derive(Debug, Clone)]
pub struct UrlBuilder {
    host: String,
    port: u16,
}

impl UrlBuilder {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        if self.host == "localhost" {
            format!("http://{}:{}", self.host, self.port)
        } else {
            format!("https://{}", self.host)
        }
    }

    pub fn download_url(&self, filename: &str) -> String {
        format!("{}/snapshots/{}", self.base_url(), filename)
    }

    pub fn metadata_url(&self, filename: &str) -> String {
        format!("{}{}", self.download_url(filename), METADATA_SUFFIX)
    }
}

/// Block height embedded in a snapshot filename, or 0 when absent.
pub fn extract_block_id(filename: &str) -> u64 {
    BLOCK_ID
        .captures(filename)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Human-readable label: `Block <id> - <date> <time>`, or the raw filename
/// when the embedded timestamp does not parse.
pub fn describe(filename: &str, block_id: u64) -> String {
    let parsed = EMBEDDED_TIMESTAMP.captures(filename).and_then(|caps| {
        let date = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d").ok()?;
        let time = NaiveTime::from_hms_opt(
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
            caps[4].parse().ok()?,
        )?;
        Some((date, time))
    });

    match parsed {
        Some((date, time)) => format!(
            "Block {} - {} {}",
            block_id,
            date.format("%Y-%m-%d"),
            time.format("%H:%M:%S")
        ),
        None => format!("Block {} - {}", block_id, filename),
    }
}

fn iso8601(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Lists and describes the archives in the backup directory.
#[derive(Debug, Clone)]
pub struct SnapshotCatalog {
    resolver: Arc<dyn BackupDirResolver>,
    urls: UrlBuilder,
}

impl SnapshotCatalog {
    pub fn new(resolver: Arc<dyn BackupDirResolver>, urls: UrlBuilder) -> Self {
        Self { resolver, urls }
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.resolver.backup_dir()
    }

    pub fn urls(&self) -> &UrlBuilder {
        &self.urls
    }

    /// Describe a single archive from its stat result.
    pub fn entry(&self, filename: &str, metadata: &Metadata) -> SnapshotEntry {
        let display = sanitize_for_display(filename);
        let block_id = extract_block_id(filename);
        SnapshotEntry {
            block_id,
            last_modified: iso8601(metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH)),
            description: describe(filename, block_id),
            download_url: self.urls.download_url(&display),
            metadata_url: self.urls.metadata_url(&display),
            size: metadata.len(),
            filename: display,
        }
    }

    /// Scan the backup directory.
    pub async fn list(&self) -> Result<SnapshotListing, CatalogError> {
        let dir = self.backup_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %dir.display(), "Backup directory absent");
                return Ok(SnapshotListing::new(Vec::new()));
            }
            Err(source) => return Err(CatalogError::Scan { path: dir, source }),
        };

        let mut snapshots = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => return Err(CatalogError::Scan { path: dir, source }),
            };

            let Some(filename) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if allowed_extension(&filename).is_none() {
                continue;
            }

            let metadata = match tokio::fs::metadata(entry.path()).await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(file = %filename, error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            snapshots.push(self.entry(&filename, &metadata));
        }

        snapshots.sort_by(|a, b| b.block_id.cmp(&a.block_id));
        Ok(SnapshotListing::new(snapshots))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::resolver::StaticDir;

    fn catalog(dir: &std::path::Path) -> SnapshotCatalog {
        SnapshotCatalog::new(
            Arc::new(StaticDir::new(dir)),
            UrlBuilder::new("localhost", 3000),
        )
    }

    #[test]
    fn extracts_block_ids() {
        assert_eq!(extract_block_id("snapshot_123_2025-01-06_12-30-45.gz"), 123);
        assert_eq!(extract_block_id("invalid.gz"), 0);
        assert_eq!(extract_block_id("snapshot_99999999999999999999999_x.gz"), 0);
    }

    #[test]
    fn describes_with_embedded_timestamp() {
        assert_eq!(
            describe("snapshot_123_2025-01-06_12-30-45.tar.gz", 123),
            "Block 123 - 2025-01-06 12:30:45"
        );
        assert_eq!(
            describe("snapshot_5_2025-13-40_12-30-45.gz", 5),
            "Block 5 - snapshot_5_2025-13-40_12-30-45.gz"
        );
        assert_eq!(describe("other.gz", 0), "Block 0 - other.gz");
    }

    #[test]
    fn localhost_urls_are_plain_http_with_port() {
        let urls = UrlBuilder::new("localhost", 3000);
        let url = urls.download_url("a.gz");
        assert!(url.starts_with("http://"));
        assert!(url.contains(":3000"));
        assert_eq!(urls.metadata_url("a.gz"), "http://localhost:3000/snapshots/a.gz.header.json");
    }

    #[test]
    fn public_urls_are_https_without_port() {
        let urls = UrlBuilder::new("example.com", 443);
        let url = urls.download_url("a.gz");
        assert!(url.starts_with("https://"));
        assert!(!url.contains(":443"));
        assert_eq!(url, "https://example.com/snapshots/a.gz");
    }

    #[tokio::test]
    async fn absent_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let listing = catalog(&dir.path().join("missing")).list().await.unwrap();
        assert!(listing.snapshots.is_empty());
        assert_eq!(listing.total_count, 0);
    }

    #[tokio::test]
    async fn empty_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let listing = catalog(dir.path()).list().await.unwrap();
        assert_eq!(listing.total_count, 0);
    }

    #[tokio::test]
    async fn sorts_by_descending_block_and_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "snapshot_100_2025-01-01_00-00-00.gz",
            "snapshot_300_2025-01-03_00-00-00.tar.gz",
            "snapshot_200_2025-01-02_00-00-00.gz",
            "notes.txt",
            "legacy.gz",
        ] {
            std::fs::write(dir.path().join(name), b"payload").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.gz")).unwrap();

        let listing = catalog(dir.path()).list().await.unwrap();
        let ids: Vec<_> = listing.snapshots.iter().map(|s| s.block_id).collect();
        assert_eq!(ids, vec![300, 200, 100, 0]);
        assert_eq!(listing.total_count, 4);

        let newest = &listing.snapshots[0];
        assert_eq!(newest.size, 7);
        assert_eq!(newest.description, "Block 300 - 2025-01-03 00:00:00");
        assert!(newest.last_modified.ends_with('Z'));
        assert_eq!(
            newest.download_url,
            "http://localhost:3000/snapshots/snapshot_300_2025-01-03_00-00-00.tar.gz"
        );
    }

    #[test]
    fn listing_serializes_camel_case() {
        let listing = SnapshotListing::new(Vec::new());
        let json = serde_json::to_value(&listing).unwrap();
        assert_eq!(json, serde_json::json!({ "snapshots": [], "totalCount": 0 }));
    }
}
