use serde::{Deserialize, Serialize};

/// Operating system family the patcher is running on.
///
/// Manifest entries and bundle members are filtered against this value, so it
/// is carried in configuration rather than read from `cfg!` at every call
/// site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostPlatform {
    Windows,
    #[serde(alias = "osx", alias = "darwin")]
    MacOs,
    Linux,
    Other,
}

impl HostPlatform {
    #[must_use]
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(target_os = "linux") {
            Self::Linux
        } else {
            Self::Other
        }
    }

    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Windows => "Windows",
            Self::MacOs => "macOS",
            Self::Linux => "Linux",
            Self::Other => "Unknown",
        }
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::current()
    }
}

impl std::fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}
