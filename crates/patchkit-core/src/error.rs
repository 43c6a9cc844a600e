use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::extract::ExtractError;
use crate::manifest::ManifestError;
use crate::transport::TransportError;

/// Coarse classification of a [`PatchError`], carried on every error event so
/// listeners can react without matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchErrorKind {
    ManifestUnavailable,
    ManifestFormat,
    FileTransferFailed,
    IntegrityMismatch,
    ExtractionFailed,
    FilesystemFailed,
    Cancelled,
    Busy,
    WorkerUnavailable,
}

impl PatchErrorKind {
    /// Whether a fresh download attempt could plausibly fix the failure.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::FileTransferFailed | Self::IntegrityMismatch)
    }
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("failed to fetch manifest from {url}: {source}")]
    ManifestUnavailable {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    ManifestFormat(#[from] ManifestError),

    #[error("failed to download {file}: {source}")]
    FileTransferFailed {
        file: String,
        #[source]
        source: TransportError,
    },

    #[error("integrity check failed for {file}: expected {expected_size} bytes with md5 {expected_hash}")]
    IntegrityMismatch {
        file: String,
        expected_size: u64,
        expected_hash: String,
    },

    #[error("failed to extract {file}: {source}")]
    ExtractionFailed {
        file: String,
        #[source]
        source: ExtractError,
    },

    #[error("{context} ({path}): {source}")]
    FilesystemFailed {
        context: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("update cancelled")]
    Cancelled,

    #[error("another update is already running in {path}")]
    Busy { path: String },

    #[error("failed to start update worker: {0}")]
    WorkerUnavailable(#[source] std::io::Error),
}

impl PatchError {
    pub(crate) fn filesystem(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::FilesystemFailed {
            context,
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn transfer(file: impl Into<String>, source: TransportError) -> Self {
        Self::FileTransferFailed {
            file: file.into(),
            source,
        }
    }

    pub(crate) fn extraction(file: impl Into<String>, source: ExtractError) -> Self {
        Self::ExtractionFailed {
            file: file.into(),
            source,
        }
    }

    #[must_use]
    pub fn kind(&self) -> PatchErrorKind {
        match self {
            Self::ManifestUnavailable { .. } => PatchErrorKind::ManifestUnavailable,
            Self::ManifestFormat(_) => PatchErrorKind::ManifestFormat,
            Self::FileTransferFailed { .. } => PatchErrorKind::FileTransferFailed,
            Self::IntegrityMismatch { .. } => PatchErrorKind::IntegrityMismatch,
            Self::ExtractionFailed { .. } => PatchErrorKind::ExtractionFailed,
            Self::FilesystemFailed { .. } => PatchErrorKind::FilesystemFailed,
            Self::Cancelled => PatchErrorKind::Cancelled,
            Self::Busy { .. } => PatchErrorKind::Busy,
            Self::WorkerUnavailable(_) => PatchErrorKind::WorkerUnavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PatchError, PatchErrorKind};
    use crate::transport::TransportError;

    #[test]
    fn kind_maps_each_variant() {
        let transfer = PatchError::transfer(
            "data.bin",
            TransportError::Status {
                url: "http://example.invalid/data.bin.3.bz2".to_string(),
                status: 404,
            },
        );
        assert_eq!(transfer.kind(), PatchErrorKind::FileTransferFailed);

        let filesystem = PatchError::filesystem(
            "failed to create scratch directory",
            std::path::Path::new("/tmp/game/hash_data"),
            std::io::Error::other("read-only"),
        );
        assert_eq!(filesystem.kind(), PatchErrorKind::FilesystemFailed);
        assert_eq!(PatchError::Cancelled.kind(), PatchErrorKind::Cancelled);
    }

    #[test]
    fn only_transfer_and_integrity_failures_are_retryable() {
        assert!(PatchErrorKind::FileTransferFailed.is_retryable());
        assert!(PatchErrorKind::IntegrityMismatch.is_retryable());
        assert!(!PatchErrorKind::ExtractionFailed.is_retryable());
        assert!(!PatchErrorKind::ManifestFormat.is_retryable());
    }

    #[test]
    fn filesystem_display_includes_context_and_path() {
        let error = PatchError::filesystem(
            "failed to remove compressed payload",
            std::path::Path::new("game/data.bin.3.bz2"),
            std::io::Error::other("busy"),
        );
        let message = error.to_string();
        assert!(message.starts_with("failed to remove compressed payload"));
        assert!(message.contains("data.bin.3.bz2"));
    }
}
