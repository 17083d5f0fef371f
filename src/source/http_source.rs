use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::Client;
use tracing::{debug, warn};

use super::traits::{AssetSource, ProgressFn};

/// Fetches versioned binaries over HTTP: `GET <root>/<path>?version=<v>`,
/// streaming the body so progress can be reported chunk by chunk.
pub struct HttpAssetSource {
    client: Client,
    root: String,
}

impl HttpAssetSource {
    pub fn new(root: String) -> Self {
        Self {
            client: Client::new(),
            root,
        }
    }

    fn url_for(&self, path: &str, version: &str) -> String {
        format!(
            "{}/{}?version={}",
            self.root.trim_end_matches('/'),
            path.trim_start_matches('/'),
            version
        )
    }
}

#[async_trait]
impl AssetSource for HttpAssetSource {
    async fn fetch(&self, path: &str, version: &str, progress: &ProgressFn) -> Result<Bytes> {
        let url = self.url_for(path, version);
        debug!("fetching asset {}", url);

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            warn!("asset fetch failed status={} url={}", status.as_u16(), url);
            return Err(anyhow!("asset fetch failed: HTTP {}", status.as_u16()));
        }

        let total = resp.content_length();
        let mut buf = BytesMut::with_capacity(total.unwrap_or(0) as usize);

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buf.extend_from_slice(&chunk);
            progress(buf.len() as u64, total);
        }

        debug!("fetched asset {} ({} bytes)", path, buf.len());
        Ok(buf.freeze())
    }
}
