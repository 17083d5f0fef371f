use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Download progress sink: `(bytes_received, bytes_total)`.
pub type ProgressFn = dyn Fn(u64, Option<u64>) + Send + Sync;

/// Fetches a named, versioned binary blob.
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Fetch the blob at `path` for `version`, reporting incremental
    /// progress as bytes arrive.
    async fn fetch(&self, path: &str, version: &str, progress: &ProgressFn) -> Result<Bytes>;
}
