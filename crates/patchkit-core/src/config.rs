use std::path::PathBuf;
use std::time::Duration;

use patchkit_platform::HostPlatform;
use serde::{Deserialize, Serialize};

/// What to do with the remaining files once one file fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Report the failure and keep going with the next file.
    #[default]
    Continue,
    /// Report the failure and skip every remaining file. Cleanup still runs.
    Abort,
}

/// Where a pending `stop()` request is observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationPolicy {
    /// Only when the run starts. Once files are being processed the run
    /// completes.
    #[default]
    AtStart,
    /// At the start and before each install file.
    BetweenFiles,
    /// At the start, before each install file, and before each downloaded
    /// chunk.
    BetweenChunks,
}

impl CancellationPolicy {
    #[must_use]
    pub fn checks_files(self) -> bool {
        matches!(self, Self::BetweenFiles | Self::BetweenChunks)
    }

    #[must_use]
    pub fn checks_chunks(self) -> bool {
        matches!(self, Self::BetweenChunks)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl TransportConfig {
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_read_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchConfig {
    pub base_url: String,

    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,

    #[serde(default = "default_compressed_extension")]
    pub compressed_extension: String,

    #[serde(default = "default_scratch_dir_name")]
    pub scratch_dir_name: String,

    #[serde(default = "default_bundle_names")]
    pub bundle_names: Vec<String>,

    #[serde(default = "default_linux_excluded_members")]
    pub linux_excluded_members: Vec<String>,

    #[serde(default)]
    pub platform: HostPlatform,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default)]
    pub cancellation_policy: CancellationPolicy,

    #[serde(default = "default_retry_delays")]
    pub retry_delays_secs: Vec<u64>,

    #[serde(default)]
    pub purge_scratch: bool,

    #[serde(default = "default_ready_message")]
    pub ready_message: String,

    #[serde(default)]
    pub transport: TransportConfig,
}

impl PatchConfig {
    pub fn new(base_url: impl Into<String>, install_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            install_dir: install_dir.into(),
            manifest_name: default_manifest_name(),
            compressed_extension: default_compressed_extension(),
            scratch_dir_name: default_scratch_dir_name(),
            bundle_names: default_bundle_names(),
            linux_excluded_members: default_linux_excluded_members(),
            platform: HostPlatform::current(),
            failure_policy: FailurePolicy::default(),
            cancellation_policy: CancellationPolicy::default(),
            retry_delays_secs: default_retry_delays(),
            purge_scratch: false,
            ready_message: default_ready_message(),
            transport: TransportConfig::default(),
        }
    }

    #[must_use]
    pub fn scratch_dir(&self) -> PathBuf {
        self.install_dir.join(&self.scratch_dir_name)
    }

    #[must_use]
    pub fn is_bundle(&self, file_name: &str) -> bool {
        self.bundle_names.iter().any(|bundle| bundle == file_name)
    }
}

fn default_install_dir() -> PathBuf {
    PathBuf::from("game")
}

fn default_manifest_name() -> String {
    "patcher.ver".to_string()
}

fn default_compressed_extension() -> String {
    "bz2".to_string()
}

fn default_scratch_dir_name() -> String {
    "hash_data".to_string()
}

fn default_bundle_names() -> Vec<String> {
    vec!["phase_1.mf".to_string(), "phase_2.mf".to_string()]
}

fn default_linux_excluded_members() -> Vec<String> {
    vec!["libpandadx8.dll".to_string(), "libpandadx9.dll".to_string()]
}

fn default_retry_delays() -> Vec<u64> {
    vec![0]
}

fn default_ready_message() -> String {
    "Have fun playing!".to_string()
}

fn default_read_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("patchkit/{}", env!("CARGO_PKG_VERSION"))
}
