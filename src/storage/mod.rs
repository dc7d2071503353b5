//! Snapshot storage subsystem.
//!
//! # Data Flow
//! ```text
//! resolver.rs (where is the backup directory?)
//!     → catalog.rs (scan, filter, sort, derive metadata)
//!     → JSON listing / metadata responses
//! ```
//!
//! The catalog is rebuilt from disk on every request; nothing is cached.

pub mod catalog;
pub mod resolver;

pub use catalog::{
    describe, extract_block_id, CatalogError, SnapshotCatalog, SnapshotEntry, SnapshotListing,
    UrlBuilder,
};
pub use resolver::{BackupDirResolver, EnvDir, StaticDir};
