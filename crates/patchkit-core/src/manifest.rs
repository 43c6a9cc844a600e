//! Line-oriented `KEY=VALUE` version manifest.
//!
//! The manifest is kept as raw lines and parsed into typed views on demand.
//! Unknown keys are ignored and line order does not matter, except that the
//! first definition of a `FILE_` key wins.

use std::collections::HashMap;

use patchkit_platform::HostPlatform;
use serde::Serialize;
use thiserror::Error;

use crate::environment::LaunchEnvironment;

const REQUIRED_INSTALL_FILES: &str = "REQUIRED_INSTALL_FILES";
const FILE_PREFIX: &str = "FILE_";
const CURRENT_SUFFIX: &str = ".current";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("manifest line {line}: missing '=' after {key}")]
    MissingSeparator { line: usize, key: String },

    #[error("manifest line {line}: install file token '{token}' is not of the form name:kind")]
    MalformedInstallToken { line: usize, token: String },

    #[error("manifest line {line}: size '{value}' for {file} is not a number")]
    InvalidSize {
        line: usize,
        file: String,
        value: String,
    },

    #[error("manifest line {line}: missing content hash for {file}")]
    MissingHash { line: usize, file: String },

    #[error("manifest line {line}: hash '{value}' for {file} is not a 32-digit hex md5")]
    InvalidHash {
        line: usize,
        file: String,
        value: String,
    },
}

/// Platform restriction derived from an install file's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PlatformFilter {
    Any,
    Osx,
    Linux,
}

impl PlatformFilter {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.contains("OSX") {
            Self::Osx
        } else if name.contains("LINUX") {
            Self::Linux
        } else {
            Self::Any
        }
    }

    #[must_use]
    pub fn admits(self, host: HostPlatform) -> bool {
        match self {
            Self::Any => true,
            Self::Osx => host == HostPlatform::MacOs,
            Self::Linux => host == HostPlatform::Linux,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallFileSpec {
    pub name: String,
    pub kind: String,
    pub platform_filter: PlatformFilter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileVersionRecord {
    pub file_name: String,
    pub version_label: String,
}

/// Expected size and md5 of the *decompressed* file at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileIntegrityRecord {
    pub file_name: String,
    pub version_label: String,
    pub expected_size: u64,
    pub expected_hash: String,
}

/// All three typed views of a manifest, parsed in one pass.
#[derive(Debug, Clone, Default)]
pub struct ManifestIndex {
    pub install_files: Vec<InstallFileSpec>,
    pub versions: HashMap<String, FileVersionRecord>,
    pub integrity: HashMap<(String, String), FileIntegrityRecord>,
}

impl ManifestIndex {
    #[must_use]
    pub fn version_of(&self, file_name: &str) -> Option<&FileVersionRecord> {
        self.versions.get(file_name)
    }

    #[must_use]
    pub fn integrity_of(&self, file_name: &str, version: &str) -> Option<&FileIntegrityRecord> {
        self.integrity
            .get(&(file_name.to_string(), version.to_string()))
    }

    /// Install files that apply to `host`, in manifest order.
    pub fn install_files_for(&self, host: HostPlatform) -> impl Iterator<Item = &InstallFileSpec> {
        self.install_files
            .iter()
            .filter(move |spec| spec.platform_filter.admits(host))
    }
}

struct Entry<'a> {
    line: usize,
    key: &'a str,
    value: Option<&'a str>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    lines: Vec<String>,
}

impl Manifest {
    #[must_use]
    pub fn parse(text: &str) -> Self {
        Self::from_lines(text.lines())
    }

    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            lines: lines
                .into_iter()
                .map(|line| line.as_ref().trim().to_string())
                .filter(|line| !line.is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn entries(&self) -> impl Iterator<Item = Entry<'_>> {
        self.lines.iter().enumerate().map(|(index, line)| {
            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim())),
                None => (line.as_str(), None),
            };
            Entry {
                line: index + 1,
                key,
                value,
            }
        })
    }

    fn lookup(&self, key: &str) -> Result<Option<(usize, &str)>, ManifestError> {
        match self.entries().find(|entry| entry.key == key) {
            Some(Entry {
                line,
                value: Some(value),
                ..
            }) => Ok(Some((line, value))),
            Some(Entry { line, .. }) => Err(ManifestError::MissingSeparator {
                line,
                key: key.to_string(),
            }),
            None => Ok(None),
        }
    }

    /// Every `name:kind` token of every `REQUIRED_INSTALL_FILES` line, in
    /// order, without platform filtering.
    ///
    /// # Errors
    /// Returns an error if a `REQUIRED_INSTALL_FILES` line has no `=` or one
    /// of its tokens has no `:`.
    pub fn install_files(&self) -> Result<Vec<InstallFileSpec>, ManifestError> {
        let mut specs = Vec::new();
        for entry in self
            .entries()
            .filter(|entry| entry.key.starts_with(REQUIRED_INSTALL_FILES))
        {
            let value = entry.value.ok_or_else(|| ManifestError::MissingSeparator {
                line: entry.line,
                key: entry.key.to_string(),
            })?;
            for token in value.split_whitespace() {
                let Some((name, kind)) = token.split_once(':') else {
                    return Err(ManifestError::MalformedInstallToken {
                        line: entry.line,
                        token: token.to_string(),
                    });
                };
                if name.is_empty() {
                    return Err(ManifestError::MalformedInstallToken {
                        line: entry.line,
                        token: token.to_string(),
                    });
                }
                specs.push(InstallFileSpec {
                    name: name.to_string(),
                    kind: kind.to_string(),
                    platform_filter: PlatformFilter::from_name(name),
                });
            }
        }
        Ok(specs)
    }

    /// The version currently published for `file_name`, if any.
    ///
    /// # Errors
    /// Returns an error if the `FILE_<name>.current` line has no `=`.
    pub fn current_version(
        &self,
        file_name: &str,
    ) -> Result<Option<FileVersionRecord>, ManifestError> {
        let key = format!("{FILE_PREFIX}{file_name}{CURRENT_SUFFIX}");
        Ok(self
            .lookup(&key)?
            .filter(|(_, value)| !value.is_empty())
            .map(|(_, version)| FileVersionRecord {
                file_name: file_name.to_string(),
                version_label: version.to_string(),
            }))
    }

    /// The integrity record for `file_name` at `version`, if any.
    ///
    /// # Errors
    /// Returns an error if the `FILE_<name>.<version>` line has no `=`, a
    /// non-numeric size, or a missing or malformed md5 hash.
    pub fn integrity(
        &self,
        file_name: &str,
        version: &str,
    ) -> Result<Option<FileIntegrityRecord>, ManifestError> {
        let key = format!("{FILE_PREFIX}{file_name}.{version}");
        let Some((line, value)) = self.lookup(&key)? else {
            return Ok(None);
        };

        let (size, hash) = value.split_once(' ').unwrap_or((value, ""));
        let expected_size = size
            .trim()
            .parse::<u64>()
            .map_err(|_| ManifestError::InvalidSize {
                line,
                file: file_name.to_string(),
                value: size.to_string(),
            })?;
        let hash = hash.trim();
        if hash.is_empty() {
            return Err(ManifestError::MissingHash {
                line,
                file: file_name.to_string(),
            });
        }
        if hash.len() != 32 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ManifestError::InvalidHash {
                line,
                file: file_name.to_string(),
                value: hash.to_string(),
            });
        }

        Ok(Some(FileIntegrityRecord {
            file_name: file_name.to_string(),
            version_label: version.to_string(),
            expected_size,
            expected_hash: hash.to_ascii_lowercase(),
        }))
    }

    /// Parse the install list plus the version and integrity record of every
    /// listed file.
    ///
    /// # Errors
    /// Returns the first [`ManifestError`] hit while parsing any of them.
    pub fn index(&self) -> Result<ManifestIndex, ManifestError> {
        let install_files = self.install_files()?;
        let mut index = ManifestIndex {
            install_files,
            ..ManifestIndex::default()
        };

        for spec in &index.install_files {
            if index.versions.contains_key(&spec.name) {
                continue;
            }
            let Some(version) = self.current_version(&spec.name)? else {
                continue;
            };
            if let Some(record) = self.integrity(&spec.name, &version.version_label)? {
                index.integrity.insert(
                    (spec.name.clone(), version.version_label.clone()),
                    record,
                );
            }
            index.versions.insert(spec.name.clone(), version);
        }

        Ok(index)
    }

    #[must_use]
    pub fn environment(&self) -> LaunchEnvironment {
        LaunchEnvironment::from_lines(&self.lines)
    }
}
