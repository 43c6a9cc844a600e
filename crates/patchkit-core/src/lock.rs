use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::PatchError;

const LOCK_FILE_NAME: &str = ".patchkit.lock";

/// Exclusive claim on an install directory for the duration of one run.
///
/// The lock is released when the guard is dropped.
#[derive(Debug)]
pub struct InstallLock {
    path: PathBuf,
    _file: File,
}

impl InstallLock {
    /// # Errors
    /// Returns [`PatchError::Busy`] when another run holds the lock and
    /// [`PatchError::FilesystemFailed`] when the lock file cannot be used.
    pub fn acquire(install_dir: &Path) -> Result<Self, PatchError> {
        let path = install_dir.join(LOCK_FILE_NAME);
        let mut lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|error| PatchError::filesystem("failed to open install lock", &path, error))?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {}
            Err(error) if error.kind() == fs2::lock_contended_error().kind() => {
                return Err(PatchError::Busy {
                    path: install_dir.display().to_string(),
                });
            }
            Err(error) => {
                return Err(PatchError::filesystem(
                    "failed to acquire install lock",
                    &path,
                    error,
                ));
            }
        }

        lock_file
            .set_len(0)
            .and_then(|()| lock_file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| writeln!(lock_file, "{}", std::process::id()))
            .map_err(|error| {
                PatchError::filesystem("failed to write install lock metadata", &path, error)
            })?;

        Ok(Self {
            path,
            _file: lock_file,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
