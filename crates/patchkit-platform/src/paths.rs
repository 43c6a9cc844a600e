use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Overrides every per-user directory with `<value>/config` and `<value>/logs`.
pub const HOME_OVERRIDE_VAR: &str = "PATCHKIT_HOME";

const APP_DIR: &str = "patchkit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AppPathsError {
    #[error("Could not determine config directory; set {HOME_OVERRIDE_VAR}")]
    ConfigDirUnavailable,
    #[error("Could not determine log directory; set {HOME_OVERRIDE_VAR}")]
    LogDirUnavailable,
}

/// Per-user locations of the launcher's own files. The game install
/// directory is configured separately and never lives here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl AppPaths {
    /// Resolve paths from [`HOME_OVERRIDE_VAR`] or the platform defaults.
    ///
    /// # Errors
    /// Returns an error when no override is set and a platform base
    /// directory cannot be determined.
    pub fn new() -> Result<Self, AppPathsError> {
        Self::resolve(std::env::var_os(HOME_OVERRIDE_VAR))
    }

    /// Lay every directory out under a single `root`.
    #[must_use]
    pub fn rooted(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            log_dir: root.join("logs"),
        }
    }

    fn resolve(home_override: Option<OsString>) -> Result<Self, AppPathsError> {
        if let Some(root) = home_override.filter(|root| !root.is_empty()) {
            return Ok(Self::rooted(Path::new(&root)));
        }

        let config_dir = dirs::config_dir()
            .ok_or(AppPathsError::ConfigDirUnavailable)?
            .join(APP_DIR);
        Ok(Self {
            config_dir,
            log_dir: platform_log_dir()?,
        })
    }

    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join("patchkit.log")
    }

    /// Ensure the config and log directories exist on disk.
    ///
    /// # Errors
    /// Returns an error if either directory cannot be created.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.log_dir)
    }
}

#[cfg(target_os = "macos")]
fn platform_log_dir() -> Result<PathBuf, AppPathsError> {
    let home = dirs::home_dir().ok_or(AppPathsError::LogDirUnavailable)?;
    Ok(home.join("Library/Logs").join(APP_DIR))
}

// XDG state dir on Linux, local app data elsewhere.
#[cfg(not(target_os = "macos"))]
fn platform_log_dir() -> Result<PathBuf, AppPathsError> {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join(APP_DIR))
        .ok_or(AppPathsError::LogDirUnavailable)
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;
    use std::path::Path;

    use super::AppPaths;

    #[test]
    fn home_override_roots_every_directory() {
        let paths = AppPaths::resolve(Some(OsString::from("/srv/launcher")))
            .expect("override should always resolve");

        assert_eq!(paths, AppPaths::rooted(Path::new("/srv/launcher")));
        assert_eq!(
            paths.settings_file(),
            Path::new("/srv/launcher/config/settings.json")
        );
        assert_eq!(paths.log_file(), Path::new("/srv/launcher/logs/patchkit.log"));
    }

    #[test]
    fn empty_override_falls_back_to_platform_dirs() {
        let Ok(paths) = AppPaths::resolve(Some(OsString::new())) else {
            return;
        };

        assert!(paths.config_dir.ends_with("patchkit"));
        assert!(paths.log_dir.ends_with("patchkit"));
    }

    #[test]
    fn ensure_dirs_creates_config_and_log_directories() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let paths = AppPaths::rooted(temp.path());

        paths
            .ensure_dirs()
            .expect("ensure_dirs should create application directories");

        assert!(paths.config_dir.is_dir());
        assert!(paths.log_dir.is_dir());
    }
}
