//! Client-side patching: fetch a version manifest, verify installed files,
//! download and unpack what is out of date, and report progress as events.

pub mod config;
pub mod environment;
pub mod error;
pub mod events;
pub mod extract;
pub mod fetch;
pub mod lock;
pub mod manifest;
mod orchestrator;
pub mod transport;
pub mod verify;

pub use config::{CancellationPolicy, FailurePolicy, PatchConfig, TransportConfig};
pub use environment::{EnvironmentBinding, LaunchEnvironment};
pub use error::{PatchError, PatchErrorKind};
pub use events::{
    EventSink, FileAction, FileReport, PatchEvent, PatchFailure, RunOutcome, RunReport,
};
pub use fetch::{DownloadProgress, Fetcher};
pub use manifest::{Manifest, ManifestError, ManifestIndex, PlatformFilter};
pub use orchestrator::{
    PatchRun, PatchState, Patcher, PlannedAction, PlannedFile, UpdatePlan, cleanup_scratch,
};
pub use patchkit_platform::HostPlatform;
pub use transport::{HttpTransport, RemoteBody, Transport, TransportError};
