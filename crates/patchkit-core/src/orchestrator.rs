//! The update run: manifest, per-file verify/download/decompress/unpack,
//! scratch cleanup, and the events that report it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{FailurePolicy, PatchConfig};
use crate::environment::LaunchEnvironment;
use crate::error::{PatchError, PatchErrorKind};
use crate::events::{
    EventSink, FileAction, FileReport, PatchEvent, PatchFailure, RunOutcome, RunReport,
};
use crate::extract;
use crate::fetch::{Fetcher, payload_file_name, payload_url};
use crate::lock::InstallLock;
use crate::manifest::{FileIntegrityRecord, FileVersionRecord, InstallFileSpec, ManifestIndex};
use crate::transport::{HttpTransport, Transport, TransportError};
use crate::verify::verify_file;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    Idle,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl From<RunOutcome> for PatchState {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Succeeded => Self::Succeeded,
            RunOutcome::Failed => Self::Failed,
            RunOutcome::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlannedAction {
    UpToDate,
    Download { url: String },
    Unpublished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedFile {
    pub name: String,
    pub kind: String,
    pub version: Option<String>,
    #[serde(flatten)]
    pub action: PlannedAction,
}

/// What an update would do, computed without downloading anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdatePlan {
    pub files: Vec<PlannedFile>,
    pub environment: LaunchEnvironment,
}

impl UpdatePlan {
    pub fn downloads(&self) -> impl Iterator<Item = &PlannedFile> {
        self.files
            .iter()
            .filter(|file| matches!(file.action, PlannedAction::Download { .. }))
    }
}

/// A run started on the worker thread.
pub struct PatchRun {
    events: Receiver<PatchEvent>,
    worker: JoinHandle<()>,
}

impl PatchRun {
    #[must_use]
    pub fn events(&self) -> &Receiver<PatchEvent> {
        &self.events
    }

    /// Drain the remaining events, join the worker, and return the report
    /// carried by the finished event.
    #[must_use]
    pub fn wait(self) -> Option<RunReport> {
        let mut report = None;
        for event in &self.events {
            if let PatchEvent::Finished(finished) = event {
                report = Some(finished);
            }
        }
        if self.worker.join().is_err() {
            error!("Update worker panicked");
        }
        report
    }
}

struct UpdateSession {
    current: usize,
    total: usize,
    cancelled: bool,
    files: Vec<FileReport>,
    failures: Vec<PatchFailure>,
    environment: LaunchEnvironment,
}

impl UpdateSession {
    fn new() -> Self {
        Self {
            current: 0,
            total: 0,
            cancelled: false,
            files: Vec::new(),
            failures: Vec::new(),
            environment: LaunchEnvironment::default(),
        }
    }

    fn fail(&mut self, sink: &EventSink, error: &PatchError, file: Option<&str>) {
        match file {
            Some(file) => error!("An error occurred while updating {file}: {error}"),
            None => error!("An error occurred during the update process: {error}"),
        }
        let failure = PatchFailure::from_error(error, file);
        sink.error(failure.clone());
        self.failures.push(failure);
    }

    fn record(
        &mut self,
        spec: &InstallFileSpec,
        version: Option<&FileVersionRecord>,
        action: FileAction,
    ) {
        self.files.push(FileReport {
            name: spec.name.clone(),
            version: version.map(|record| record.version_label.clone()),
            action,
        });
    }

    fn skip(&mut self, specs: &[&InstallFileSpec], index: &ManifestIndex) {
        for spec in specs {
            self.record(spec, index.version_of(&spec.name), FileAction::NotAttempted);
        }
    }

    fn into_report(self) -> RunReport {
        let outcome = if self.cancelled {
            RunOutcome::Cancelled
        } else if self.failures.is_empty() {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed
        };
        RunReport {
            outcome,
            total_files: self.total,
            files: self.files,
            failures: self.failures,
            environment: self.environment,
        }
    }
}

/// Sends a failed finish if the run unwinds before finishing normally.
struct FinishGuard<'a> {
    patcher: &'a Patcher,
    sink: &'a EventSink,
    armed: bool,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        error!("Update run ended without finishing");
        let failure = PatchFailure {
            kind: PatchErrorKind::WorkerUnavailable,
            message: "An error occurred during the update process.".to_string(),
            detail: "update worker stopped unexpectedly".to_string(),
            file: None,
        };
        self.sink.error(failure.clone());
        self.patcher.set_state(PatchState::Failed);
        self.sink.finished(RunReport {
            outcome: RunOutcome::Failed,
            total_files: 0,
            files: Vec::new(),
            failures: vec![failure],
            environment: LaunchEnvironment::default(),
        });
    }
}

struct FileJob<'a> {
    spec: &'a InstallFileSpec,
    version: &'a FileVersionRecord,
    integrity: Option<&'a FileIntegrityRecord>,
    url: String,
    target: PathBuf,
}

struct Shared {
    config: PatchConfig,
    fetcher: Fetcher,
    state: Mutex<PatchState>,
    cancel: Mutex<CancellationToken>,
}

/// Drives update runs for one install directory.
///
/// Cloning is cheap and every clone controls the same runs.
#[derive(Clone)]
pub struct Patcher {
    shared: Arc<Shared>,
}

impl Patcher {
    pub fn new(config: PatchConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                fetcher: Fetcher::new(transport),
                state: Mutex::new(PatchState::Idle),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Build a patcher backed by [`HttpTransport`].
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn with_http(config: PatchConfig) -> Result<Self, TransportError> {
        let transport = HttpTransport::new(&config.transport)?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    #[must_use]
    pub fn config(&self) -> &PatchConfig {
        &self.shared.config
    }

    /// The state of the current run, or the outcome of the last one until the
    /// next run starts.
    #[must_use]
    pub fn state(&self) -> PatchState {
        *self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PatchState) {
        *self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn token(&self) -> CancellationToken {
        self.shared
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn renew_token(&self) {
        *self
            .shared
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
    }

    /// Request cancellation. Where it is observed depends on
    /// [`crate::CancellationPolicy`]; a request made before `start` cancels
    /// that run before any I/O.
    pub fn stop(&self) {
        info!("Update cancellation requested");
        self.token().cancel();
    }

    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.token().is_cancelled()
    }

    fn claim(&self) -> Result<(), PatchError> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *state == PatchState::Running {
            return Err(PatchError::Busy {
                path: self.config().install_dir.display().to_string(),
            });
        }
        *state = PatchState::Running;
        Ok(())
    }

    /// Run an update on a dedicated worker thread and return immediately.
    ///
    /// # Errors
    /// Returns [`PatchError::Busy`] if this patcher is already running and
    /// [`PatchError::WorkerUnavailable`] if the thread cannot be spawned.
    pub fn start(&self) -> Result<PatchRun, PatchError> {
        self.claim()?;
        let (sink, events) = EventSink::channel();
        let patcher = self.clone();
        let spawned = std::thread::Builder::new()
            .name("patchkit-update".to_string())
            .spawn(move || patcher.run_blocking(&sink));

        match spawned {
            Ok(worker) => Ok(PatchRun { events, worker }),
            Err(error) => {
                self.set_state(PatchState::Failed);
                Err(PatchError::WorkerUnavailable(error))
            }
        }
    }

    fn run_blocking(&self, sink: &EventSink) {
        match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => {
                runtime.block_on(self.run_claimed(sink));
            }
            Err(error) => {
                let mut session = UpdateSession::new();
                session.fail(sink, &PatchError::WorkerUnavailable(error), None);
                self.finish(session, sink);
            }
        }
    }

    /// Run an update on the current task. Events go to `sink`; the returned
    /// report is the one carried by the finished event.
    pub async fn update(&self, sink: &EventSink) -> RunReport {
        if let Err(error) = self.claim() {
            let mut session = UpdateSession::new();
            session.fail(sink, &error, None);
            let report = session.into_report();
            sink.finished(report.clone());
            return report;
        }
        self.run_claimed(sink).await
    }

    async fn run_claimed(&self, sink: &EventSink) -> RunReport {
        let mut guard = FinishGuard {
            patcher: self,
            sink,
            armed: true,
        };
        let cancel = self.token();
        let mut session = UpdateSession::new();

        if cancel.is_cancelled() {
            info!("Update cancelled before it started");
            self.renew_token();
            session.cancelled = true;
            let report = self.finish(session, sink);
            guard.armed = false;
            return report;
        }

        self.run_steps(&mut session, &cancel, sink).await;
        if session.cancelled {
            self.renew_token();
        }

        sink.status(self.config().ready_message.clone());
        let report = self.finish(session, sink);
        guard.armed = false;
        report
    }

    fn finish(&self, session: UpdateSession, sink: &EventSink) -> RunReport {
        let report = session.into_report();
        info!(
            "Update finished: {:?}, {} installed, {} failures",
            report.outcome,
            report.installed().count(),
            report.failures.len()
        );
        self.set_state(report.outcome.into());
        sink.finished(report.clone());
        report
    }

    async fn run_steps(
        &self,
        session: &mut UpdateSession,
        cancel: &CancellationToken,
        sink: &EventSink,
    ) {
        let config = self.config();

        if let Err(error) = std::fs::create_dir_all(&config.install_dir) {
            let error =
                PatchError::filesystem("failed to create install directory", &config.install_dir, error);
            session.fail(sink, &error, None);
            return;
        }
        let _lock = match InstallLock::acquire(&config.install_dir) {
            Ok(lock) => lock,
            Err(error) => {
                session.fail(sink, &error, None);
                return;
            }
        };

        let manifest = match self
            .shared
            .fetcher
            .fetch_manifest(&config.base_url, &config.manifest_name)
            .await
        {
            Ok(manifest) => manifest,
            Err(error) => {
                session.fail(sink, &error, None);
                return;
            }
        };

        session.environment = manifest.environment();

        let index = match manifest.index() {
            Ok(index) => index,
            Err(error) => {
                session.fail(sink, &PatchError::from(error), None);
                return;
            }
        };

        self.process_files(&index, session, cancel, sink).await;

        if let Err(error) = cleanup_scratch(config) {
            session.fail(sink, &error, None);
        }
    }

    async fn process_files(
        &self,
        index: &ManifestIndex,
        session: &mut UpdateSession,
        cancel: &CancellationToken,
        sink: &EventSink,
    ) {
        let config = self.config();
        let specs: Vec<&InstallFileSpec> = index.install_files_for(config.platform).collect();
        session.total = specs.len();

        for (position, spec) in specs.iter().enumerate() {
            if config.cancellation_policy.checks_files() && cancel.is_cancelled() {
                info!("Update cancelled before {}", spec.name);
                session.cancelled = true;
                session.skip(&specs[position..], index);
                return;
            }

            session.current += 1;
            sink.status(format!(
                "Updating files {}/{}",
                session.current, session.total
            ));

            let version = index.version_of(&spec.name);
            match self.process_file(spec, version, index, cancel, sink).await {
                Ok(action) => session.record(spec, version, action),
                Err(PatchError::Cancelled) => {
                    session.cancelled = true;
                    session.record(spec, version, FileAction::NotAttempted);
                    session.skip(&specs[position + 1..], index);
                    return;
                }
                Err(error) => {
                    session.fail(sink, &error, Some(spec.name.as_str()));
                    session.record(spec, version, FileAction::Failed { kind: error.kind() });
                    if config.failure_policy == FailurePolicy::Abort {
                        warn!("Skipping remaining files after failure on {}", spec.name);
                        session.skip(&specs[position + 1..], index);
                        return;
                    }
                }
            }
        }
    }

    async fn process_file(
        &self,
        spec: &InstallFileSpec,
        version: Option<&FileVersionRecord>,
        index: &ManifestIndex,
        cancel: &CancellationToken,
        sink: &EventSink,
    ) -> Result<FileAction, PatchError> {
        let config = self.config();
        let Some(version) = version else {
            debug!("No current version published for {}, skipping", spec.name);
            return Ok(FileAction::Unpublished);
        };

        let job = FileJob {
            spec,
            version,
            integrity: index.integrity_of(&spec.name, &version.version_label),
            url: payload_url(
                &config.base_url,
                &spec.name,
                &version.version_label,
                &config.compressed_extension,
            ),
            target: config.install_dir.join(&spec.name),
        };

        if is_up_to_date(&job.target, job.integrity) {
            info!("File {} already exists and has the correct hash", spec.name);
            return Ok(FileAction::UpToDate);
        }

        let delays = if config.retry_delays_secs.is_empty() {
            vec![0]
        } else {
            config.retry_delays_secs.clone()
        };

        let mut last_error = None;
        for (attempt, delay_secs) in delays.into_iter().enumerate() {
            if delay_secs > 0 {
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            }
            match self.install_file(&job, cancel, sink).await {
                Ok(bytes) => return Ok(FileAction::Installed { bytes }),
                Err(error) if error.kind().is_retryable() => {
                    warn!("Attempt {} for {} failed: {error}", attempt + 1, spec.name);
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            PatchError::transfer(
                &spec.name,
                TransportError::Body {
                    url: job.url.clone(),
                    details: "no download attempt was made".to_string(),
                },
            )
        }))
    }

    async fn install_file(
        &self,
        job: &FileJob<'_>,
        cancel: &CancellationToken,
        sink: &EventSink,
    ) -> Result<u64, PatchError> {
        let config = self.config();
        let payload_name = payload_file_name(
            &job.spec.name,
            &job.version.version_label,
            &config.compressed_extension,
        );
        let payload = config.install_dir.join(&payload_name);
        let chunk_cancel = config.cancellation_policy.checks_chunks().then_some(cancel);

        info!("Downloading file: {payload_name}");
        let mut last_percent = None;
        self.shared
            .fetcher
            .download(&job.spec.name, &job.url, &payload, chunk_cancel, |progress| {
                sink.emit(PatchEvent::Transferred {
                    file: job.spec.name.clone(),
                    downloaded: progress.downloaded,
                    total: progress.total,
                });
                if let Some(percent) = progress.percent()
                    && last_percent != Some(percent)
                {
                    last_percent = Some(percent);
                    sink.progress(percent);
                }
            })
            .await?;

        let result = self.unpack_payload(job, &payload);
        match std::fs::remove_file(&payload) {
            Ok(()) => info!("Removed compressed file: {payload_name}"),
            Err(error) if result.is_ok() => {
                return Err(PatchError::filesystem(
                    "failed to remove compressed payload",
                    &payload,
                    error,
                ));
            }
            Err(error) => warn!("Failed to remove {payload_name}: {error}"),
        }
        result
    }

    fn unpack_payload(&self, job: &FileJob<'_>, payload: &Path) -> Result<u64, PatchError> {
        let config = self.config();
        let name = job.spec.name.as_str();

        let bytes = extract::decompress(payload, &job.target)
            .map_err(|error| PatchError::extraction(name, error))?;

        if let Some(record) = job.integrity
            && !verify_file(&job.target, record)
        {
            return Err(PatchError::IntegrityMismatch {
                file: name.to_string(),
                expected_size: record.expected_size,
                expected_hash: record.expected_hash.clone(),
            });
        }

        if config.is_bundle(name) {
            let mut bundle = extract::open_bundle(&job.target)
                .map_err(|error| PatchError::extraction(name, error))?;
            let report = extract::unpack_bundle(
                bundle.as_mut(),
                &config.install_dir,
                config.platform,
                &config.linux_excluded_members,
            )
            .map_err(|error| PatchError::extraction(name, error))?;
            info!(
                "Unpacked {name}: {} members extracted, {} excluded on {}",
                report.extracted.len(),
                report.excluded.len(),
                config.platform
            );
        }

        Ok(bytes)
    }

    /// Fetch the manifest and report what an update would do.
    ///
    /// # Errors
    /// Returns an error when the manifest cannot be fetched or parsed.
    pub async fn plan(&self) -> Result<UpdatePlan, PatchError> {
        let config = self.config();
        let manifest = self
            .shared
            .fetcher
            .fetch_manifest(&config.base_url, &config.manifest_name)
            .await?;
        let index = manifest.index()?;

        let files = index
            .install_files_for(config.platform)
            .map(|spec| {
                let version = index.version_of(&spec.name);
                let action = match version {
                    None => PlannedAction::Unpublished,
                    Some(version) => {
                        let integrity = index.integrity_of(&spec.name, &version.version_label);
                        if is_up_to_date(&config.install_dir.join(&spec.name), integrity) {
                            PlannedAction::UpToDate
                        } else {
                            PlannedAction::Download {
                                url: payload_url(
                                    &config.base_url,
                                    &spec.name,
                                    &version.version_label,
                                    &config.compressed_extension,
                                ),
                            }
                        }
                    }
                };
                PlannedFile {
                    name: spec.name.clone(),
                    kind: spec.kind.clone(),
                    version: version.map(|record| record.version_label.clone()),
                    action,
                }
            })
            .collect();

        Ok(UpdatePlan {
            files,
            environment: manifest.environment(),
        })
    }
}

fn is_up_to_date(target: &Path, integrity: Option<&FileIntegrityRecord>) -> bool {
    integrity.is_some_and(|record| verify_file(target, record))
}

/// Make sure the scratch directory exists.
///
/// A plain file in its place is replaced by an empty directory. An existing
/// directory keeps its contents unless `purge_scratch` is set.
///
/// # Errors
/// Returns [`PatchError::FilesystemFailed`] when the path cannot be inspected,
/// removed, or created.
pub fn cleanup_scratch(config: &PatchConfig) -> Result<(), PatchError> {
    let scratch = config.scratch_dir();
    match std::fs::symlink_metadata(&scratch) {
        Ok(metadata) if metadata.is_dir() => {
            if config.purge_scratch {
                purge_dir(&scratch)?;
                info!("Purged scratch directory {}", scratch.display());
            } else {
                debug!(
                    "Scratch directory {} exists, leaving its contents",
                    scratch.display()
                );
            }
            Ok(())
        }
        Ok(_) => {
            std::fs::remove_file(&scratch).map_err(|error| {
                PatchError::filesystem("failed to remove scratch file", &scratch, error)
            })?;
            create_scratch(&scratch)?;
            info!(
                "Removed {} file and created an empty directory",
                config.scratch_dir_name
            );
            Ok(())
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            create_scratch(&scratch)?;
            info!(
                "{} not found, created an empty directory",
                config.scratch_dir_name
            );
            Ok(())
        }
        Err(error) => Err(PatchError::filesystem(
            "failed to inspect scratch directory",
            &scratch,
            error,
        )),
    }
}

fn create_scratch(scratch: &Path) -> Result<(), PatchError> {
    std::fs::create_dir(scratch).map_err(|error| {
        PatchError::filesystem("failed to create scratch directory", scratch, error)
    })
}

fn purge_dir(dir: &Path) -> Result<(), PatchError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|error| PatchError::filesystem("failed to read scratch directory", dir, error))?;
    for entry in entries {
        let entry = entry
            .map_err(|error| PatchError::filesystem("failed to read scratch entry", dir, error))?;
        let path = entry.path();
        let removed = if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        removed.map_err(|error| {
            PatchError::filesystem("failed to purge scratch entry", &path, error)
        })?;
    }
    Ok(())
}
