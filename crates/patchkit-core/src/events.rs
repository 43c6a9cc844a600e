use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;

use crate::environment::LaunchEnvironment;
use crate::error::{PatchError, PatchErrorKind};

/// Notifications sent from the update worker to the caller, in the order the
/// run performs its steps. [`PatchEvent::Finished`] is always the last event
/// of a run.
#[derive(Debug, Clone)]
pub enum PatchEvent {
    /// Download completion of the current file, 0–100.
    Progress(u8),
    /// Bytes received so far for the current file. Sent after every chunk,
    /// including when the total size is unknown.
    Transferred {
        file: String,
        downloaded: u64,
        total: Option<u64>,
    },
    Status(String),
    Error(PatchFailure),
    Finished(RunReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchFailure {
    pub kind: PatchErrorKind,
    /// Short, user-facing description.
    pub message: String,
    /// Full error chain, for logs and detail views.
    pub detail: String,
    pub file: Option<String>,
}

impl PatchFailure {
    pub(crate) fn from_error(error: &PatchError, file: Option<&str>) -> Self {
        let subject = file.unwrap_or("file");
        let message = match error.kind() {
            PatchErrorKind::ManifestUnavailable => {
                "Failed to connect to the update server.".to_string()
            }
            PatchErrorKind::ManifestFormat => {
                "The update server sent an unreadable manifest.".to_string()
            }
            PatchErrorKind::FileTransferFailed => format!("Failed to download {subject}"),
            PatchErrorKind::IntegrityMismatch => {
                format!("{subject} did not match its published checksum")
            }
            PatchErrorKind::ExtractionFailed => format!("Failed to unpack {subject}"),
            PatchErrorKind::FilesystemFailed => {
                "An error occurred while writing game files.".to_string()
            }
            PatchErrorKind::Cancelled => "Update cancelled.".to_string(),
            PatchErrorKind::Busy => "Another update is already running.".to_string(),
            PatchErrorKind::WorkerUnavailable => "Could not start the updater.".to_string(),
        };
        Self {
            kind: error.kind(),
            message,
            detail: error.to_string(),
            file: file.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FileAction {
    /// Local file already matched its integrity record.
    UpToDate,
    Installed { bytes: u64 },
    /// No `.current` version is published; nothing to do.
    Unpublished,
    Failed { kind: PatchErrorKind },
    /// Not attempted because the run was cancelled or aborted first.
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub name: String,
    pub version: Option<String>,
    #[serde(flatten)]
    pub action: FileAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub total_files: usize,
    pub files: Vec<FileReport>,
    pub failures: Vec<PatchFailure>,
    pub environment: LaunchEnvironment,
}

impl RunReport {
    #[must_use]
    pub fn installed(&self) -> impl Iterator<Item = &FileReport> {
        self.files
            .iter()
            .filter(|file| matches!(file.action, FileAction::Installed { .. }))
    }
}

/// Sending half of a run's event channel. A dropped receiver is ignored.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<PatchEvent>,
}

impl EventSink {
    #[must_use]
    pub fn new(tx: Sender<PatchEvent>) -> Self {
        Self { tx }
    }

    #[must_use]
    pub fn channel() -> (Self, Receiver<PatchEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: PatchEvent) {
        let _ = self.tx.send(event);
    }

    pub fn status(&self, message: impl Into<String>) {
        self.emit(PatchEvent::Status(message.into()));
    }

    pub fn progress(&self, percent: u8) {
        self.emit(PatchEvent::Progress(percent.min(100)));
    }

    pub fn error(&self, failure: PatchFailure) {
        self.emit(PatchEvent::Error(failure));
    }

    pub fn finished(&self, report: RunReport) {
        self.emit(PatchEvent::Finished(report));
    }
}

#[cfg(test)]
mod tests {
    use super::{EventSink, PatchEvent, PatchFailure};
    use crate::error::{PatchError, PatchErrorKind};
    use crate::transport::TransportError;

    #[test]
    fn transfer_failure_names_the_file() {
        let error = PatchError::transfer(
            "phase_1.mf",
            TransportError::Status {
                url: "http://example.invalid/phase_1.mf.12.bz2".to_string(),
                status: 503,
            },
        );
        let failure = PatchFailure::from_error(&error, Some("phase_1.mf"));

        assert_eq!(failure.kind, PatchErrorKind::FileTransferFailed);
        assert_eq!(failure.message, "Failed to download phase_1.mf");
        assert!(failure.detail.contains("HTTP 503"));
    }

    #[test]
    fn sink_ignores_dropped_receiver() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.status("still fine");
    }

    #[test]
    fn progress_is_clamped() {
        let (sink, rx) = EventSink::channel();
        sink.progress(250);
        assert!(matches!(rx.try_recv(), Ok(PatchEvent::Progress(100))));
    }
}
