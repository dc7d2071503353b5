//! Response body streaming: bandwidth throttling and download accounting.

pub mod download;
pub mod throttle;

pub use download::DownloadStream;
pub use throttle::{chunk_size_for, throttled, ByteBucket};
