//! Remote volume download into request-scoped scratch files.

use crate::config::FetchConfig;
use crate::error::{Result, SegmentError};
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::{debug, info};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// File suffix the NIfTI reader needs to pick the right decoder.
pub fn volume_suffix(body: &[u8]) -> &'static str {
    if body.starts_with(&GZIP_MAGIC) {
        ".nii.gz"
    } else {
        ".nii"
    }
}

pub struct Fetcher {
    client: reqwest::Client,
    scratch_dir: PathBuf,
    max_bytes: u64,
}

impl Fetcher {
    pub fn new(config: &FetchConfig, scratch_dir: PathBuf) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| SegmentError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            scratch_dir,
            max_bytes: config.max_volume_bytes,
        })
    }

    /// Download `url` into a temporary file that is removed when dropped.
    pub async fn fetch(&self, url: &str) -> Result<NamedTempFile> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| SegmentError::Transport(format!("invalid image_url `{}`: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SegmentError::Transport(format!(
                "unsupported URL scheme `{}` in `{}`",
                parsed.scheme(),
                url
            )));
        }

        let mut response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| SegmentError::Transport(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SegmentError::Transport(format!("{} returned {}", url, status)));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(self.too_large(url));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| SegmentError::Transport(format!("{}: {}", url, e)))?
        {
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(self.too_large(url));
            }
            body.extend_from_slice(&chunk);
        }

        if body.is_empty() {
            return Err(SegmentError::Transport(format!("{} returned an empty body", url)));
        }

        let file = tempfile::Builder::new()
            .prefix("volume-")
            .suffix(volume_suffix(&body))
            .tempfile_in(&self.scratch_dir)?;
        tokio::fs::write(file.path(), &body).await?;

        debug!(path = %file.path().display(), "Wrote scratch volume");
        info!(url = %url, bytes = body.len(), "Downloaded volume");
        Ok(file)
    }

    fn too_large(&self, url: &str) -> SegmentError {
        SegmentError::Transport(format!(
            "{} exceeds the {} byte volume limit",
            url, self.max_bytes
        ))
    }
}
