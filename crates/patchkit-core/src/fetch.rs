use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use log::{info, warn};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::PatchError;
use crate::manifest::Manifest;
use crate::transport::Transport;

/// Byte-level progress of one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

impl DownloadProgress {
    /// Completion percentage, or `None` when the total size is unknown.
    #[must_use]
    pub fn percent(&self) -> Option<u8> {
        let total = self.total.filter(|total| *total > 0)?;
        let percent = (u128::from(self.downloaded) * 100 / u128::from(total)).min(100);
        u8::try_from(percent).ok()
    }
}

fn join_url(base_url: &str, name: &str) -> String {
    format!("{}/{name}", base_url.trim_end_matches('/'))
}

#[must_use]
pub fn manifest_url(base_url: &str, manifest_name: &str) -> String {
    join_url(base_url, manifest_name)
}

/// `<base>/<file>.<version>.<ext>`
#[must_use]
pub fn payload_url(base_url: &str, file_name: &str, version: &str, extension: &str) -> String {
    join_url(base_url, &payload_file_name(file_name, version, extension))
}

#[must_use]
pub fn payload_file_name(file_name: &str, version: &str, extension: &str) -> String {
    format!("{file_name}.{version}.{extension}")
}

#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Fetch and parse the version manifest.
    ///
    /// # Errors
    /// Returns [`PatchError::ManifestUnavailable`] on any transport failure,
    /// including a non-success status.
    pub async fn fetch_manifest(
        &self,
        base_url: &str,
        manifest_name: &str,
    ) -> Result<Manifest, PatchError> {
        let url = manifest_url(base_url, manifest_name);
        let text = self
            .transport
            .get_text(&url)
            .await
            .map_err(|source| PatchError::ManifestUnavailable {
                url: url.clone(),
                source,
            })?;
        let manifest = Manifest::parse(&text);
        info!(
            "Fetched manifest from {url} ({} lines)",
            manifest.lines().len()
        );
        Ok(manifest)
    }

    /// Stream `url` into `dest`, calling `on_progress` after every chunk.
    ///
    /// When `cancel` is given it is checked before each chunk. A failed or
    /// cancelled download removes the partial `dest`.
    ///
    /// # Errors
    /// Returns [`PatchError::FileTransferFailed`] on transport failures,
    /// [`PatchError::FilesystemFailed`] when `dest` cannot be written, and
    /// [`PatchError::Cancelled`] when `cancel` fires.
    pub async fn download<F>(
        &self,
        file_name: &str,
        url: &str,
        dest: &Path,
        cancel: Option<&CancellationToken>,
        on_progress: F,
    ) -> Result<u64, PatchError>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let result = self
            .download_inner(file_name, url, dest, cancel, on_progress)
            .await;
        if result.is_err() && dest.exists() {
            if let Err(error) = tokio::fs::remove_file(dest).await {
                warn!(
                    "Failed to remove partial download {}: {error}",
                    dest.display()
                );
            }
        }
        result
    }

    async fn download_inner<F>(
        &self,
        file_name: &str,
        url: &str,
        dest: &Path,
        cancel: Option<&CancellationToken>,
        mut on_progress: F,
    ) -> Result<u64, PatchError>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let mut body = self
            .transport
            .get_stream(url)
            .await
            .map_err(|source| PatchError::transfer(file_name, source))?;

        let total = body.content_length;
        let mut downloaded: u64 = 0;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|error| PatchError::filesystem("failed to create download file", dest, error))?;

        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                info!("Download of {file_name} cancelled after {downloaded} bytes");
                return Err(PatchError::Cancelled);
            }
            let Some(chunk) = body.chunks.next().await else {
                break;
            };
            let chunk = chunk.map_err(|source| PatchError::transfer(file_name, source))?;
            file.write_all(&chunk)
                .await
                .map_err(|error| PatchError::filesystem("failed to write download data", dest, error))?;
            downloaded += chunk.len() as u64;
            on_progress(DownloadProgress { downloaded, total });
        }

        file.flush()
            .await
            .map_err(|error| PatchError::filesystem("failed to flush download file", dest, error))?;

        info!("Downloaded {file_name}: {downloaded} bytes");
        Ok(downloaded)
    }
}
