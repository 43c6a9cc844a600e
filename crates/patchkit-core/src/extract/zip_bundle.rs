use std::fs::File;
use std::path::Path;

use super::{Bundle, ExtractError};

/// A zip archive exposed through the [`Bundle`] surface.
pub struct ZipBundle {
    archive: zip::ZipArchive<File>,
    names: Vec<String>,
}

impl ZipBundle {
    /// # Errors
    /// Returns an error when the file cannot be opened or is not a readable
    /// zip archive.
    pub fn open(path: &Path) -> Result<Self, ExtractError> {
        let file = File::open(path)
            .map_err(|error| ExtractError::io("failed to open zip bundle", path, error))?;
        let mut archive = zip::ZipArchive::new(file)?;
        let mut names = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            names.push(archive.by_index(index)?.name().to_string());
        }
        Ok(Self { archive, names })
    }
}

impl Bundle for ZipBundle {
    fn len(&self) -> usize {
        self.names.len()
    }

    fn member_name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    fn extract_to(&mut self, index: usize, dest: &Path) -> Result<(), ExtractError> {
        let mut entry = self.archive.by_index(index)?;

        if entry.is_dir() {
            return std::fs::create_dir_all(dest).map_err(|error| {
                ExtractError::io("failed to create extraction directory", dest, error)
            });
        }

        let mut outfile = File::create(dest)
            .map_err(|error| ExtractError::io("failed to create extracted file", dest, error))?;
        std::io::copy(&mut entry, &mut outfile)
            .map_err(|error| ExtractError::io("failed to extract archive entry to", dest, error))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                let _ = std::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode));
            }
        }

        Ok(())
    }
}
