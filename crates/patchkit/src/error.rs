use std::process::ExitCode;

use patchkit_core::{PatchError, PatchErrorKind, TransportError};
use thiserror::Error;

pub const EX_USAGE: u8 = 64;
pub const EX_TEMPFAIL: u8 = 75;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("no patch server configured; pass --base-url or set base_url in settings.json")]
    MissingBaseUrl,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("failed to install Ctrl+C handler: {0}")]
    SignalHandler(#[from] ctrlc::Error),

    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("failed to save settings: {0}")]
    SaveSettings(#[source] std::io::Error),

    #[error("failed to encode plan: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("update worker exited without reporting a result")]
    NoReport,
}

impl CliError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::MissingBaseUrl => ExitCode::from(EX_USAGE),
            Self::Patch(error) if error.kind() == PatchErrorKind::Busy => {
                ExitCode::from(EX_TEMPFAIL)
            }
            _ => ExitCode::from(2),
        }
    }
}
