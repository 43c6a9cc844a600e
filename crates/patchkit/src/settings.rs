use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use patchkit_core::{CancellationPolicy, FailurePolicy, PatchConfig, TransportConfig};
use patchkit_platform::AppPaths;

use crate::error::CliError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default)]
    pub cancellation_policy: CancellationPolicy,

    #[serde(default = "default_retry_delays")]
    pub retry_delays_secs: Vec<u64>,

    #[serde(default)]
    pub purge_scratch: bool,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,
}

fn default_install_dir() -> PathBuf {
    PathBuf::from("game")
}

fn default_retry_delays() -> Vec<u64> {
    vec![0]
}

fn default_read_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: None,
            install_dir: default_install_dir(),
            failure_policy: FailurePolicy::default(),
            cancellation_policy: CancellationPolicy::default(),
            retry_delays_secs: default_retry_delays(),
            purge_scratch: false,
            read_timeout_secs: default_read_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            debug_logging: false,
            max_log_size_bytes: default_max_log_size_bytes(),
        }
    }
}

impl Settings {
    pub fn load() -> Self {
        let Ok(paths) = AppPaths::new() else {
            return Self::default();
        };
        Self::load_from(&paths.settings_file())
    }

    /// Read settings from `path`, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|error| {
                log::warn!("Ignoring unreadable settings at {}: {error}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) -> Result<(), std::io::Error> {
        let paths = AppPaths::new().map_err(std::io::Error::other)?;
        paths.ensure_dirs()?;
        self.save_to(&paths.settings_file())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
    }

    pub fn patch_config(&self) -> Result<PatchConfig, CliError> {
        let base_url = self
            .base_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .ok_or(CliError::MissingBaseUrl)?;

        let mut config = PatchConfig::new(base_url, self.install_dir.clone());
        config.failure_policy = self.failure_policy;
        config.cancellation_policy = self.cancellation_policy;
        config.retry_delays_secs.clone_from(&self.retry_delays_secs);
        config.purge_scratch = self.purge_scratch;
        config.transport = TransportConfig {
            read_timeout_secs: self.read_timeout_secs,
            connect_timeout_secs: self.connect_timeout_secs,
            ..TransportConfig::default()
        };
        Ok(config)
    }
}
