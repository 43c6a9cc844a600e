//! Payload decompression and bundle unpacking.

mod multifile;
mod zip_bundle;

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use log::{debug, info, warn};
use patchkit_platform::HostPlatform;
use thiserror::Error;

pub use multifile::MultifileReader;
pub use zip_bundle::ZipBundle;

const ZIP_SIGNATURES: [&[u8; 4]; 2] = [b"PK\x03\x04", b"PK\x05\x06"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decompress payload: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("not a recognized bundle format")]
    UnknownFormat,

    #[error("malformed multifile: {0}")]
    Malformed(String),

    #[error("unsupported multifile version {major}.{minor}")]
    UnsupportedVersion { major: i16, minor: i16 },

    #[error("member {0} is encrypted")]
    Encrypted(String),

    #[error("no member at index {0}")]
    NoSuchMember(usize),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl ExtractError {
    pub(crate) fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.display().to_string(),
            source,
        }
    }
}

/// Read access to an archive container: member count, member names, and
/// extraction by index.
pub trait Bundle {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn member_name(&self, index: usize) -> Option<&str>;

    /// Write member `index` to `dest`. The parent of `dest` must exist.
    ///
    /// # Errors
    /// Returns an error when the member cannot be read or `dest` cannot be
    /// written.
    fn extract_to(&mut self, index: usize, dest: &Path) -> Result<(), ExtractError>;
}

/// Open `path` as a multifile or zip bundle, chosen by its leading bytes.
///
/// # Errors
/// Returns an error when the file cannot be read or is neither format.
pub fn open_bundle(path: &Path) -> Result<Box<dyn Bundle>, ExtractError> {
    let mut signature = [0_u8; 4];
    let mut file = std::fs::File::open(path)
        .map_err(|error| ExtractError::io("failed to open bundle", path, error))?;
    let read = file
        .read(&mut signature)
        .map_err(|error| ExtractError::io("failed to read bundle", path, error))?;

    if read == signature.len() && ZIP_SIGNATURES.contains(&&signature) {
        Ok(Box::new(ZipBundle::open(path)?))
    } else {
        Ok(Box::new(MultifileReader::open(path)?))
    }
}

/// Whether `member` is left out on `platform`.
#[must_use]
pub fn is_excluded(member: &str, platform: HostPlatform, linux_excluded: &[String]) -> bool {
    platform == HostPlatform::Linux && linux_excluded.iter().any(|name| name == member)
}

/// Relative path for a member name, or `None` if it would escape the
/// destination.
fn enclosed_member_path(name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    let path = Path::new(&normalized);
    let mut enclosed = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => enclosed.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!enclosed.as_os_str().is_empty()).then_some(enclosed)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnpackReport {
    pub extracted: Vec<String>,
    pub excluded: Vec<String>,
    pub unsafe_names: Vec<String>,
}

/// Extract every member of `bundle` into `dest`, keeping relative paths and
/// applying the platform exclusions.
///
/// # Errors
/// Returns the first extraction or filesystem error.
pub fn unpack_bundle(
    bundle: &mut dyn Bundle,
    dest: &Path,
    platform: HostPlatform,
    linux_excluded: &[String],
) -> Result<UnpackReport, ExtractError> {
    let mut report = UnpackReport::default();

    for index in 0..bundle.len() {
        let name = bundle
            .member_name(index)
            .ok_or(ExtractError::NoSuchMember(index))?
            .to_string();

        if is_excluded(&name, platform, linux_excluded) {
            debug!("Skipping {name} on {platform}");
            report.excluded.push(name);
            continue;
        }

        let Some(relative) = enclosed_member_path(&name) else {
            warn!("Skipping bundle member with unsafe path: {name}");
            report.unsafe_names.push(name);
            continue;
        };
        let target = dest.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                ExtractError::io("failed to create extraction directory", parent, error)
            })?;
        }

        debug!("Extracting {name} to {}", target.display());
        bundle.extract_to(index, &target)?;
        report.extracted.push(name);
    }

    Ok(report)
}

/// Decompress the bzip2 payload at `payload` into `target`.
///
/// The whole decompressed content is held in memory and then written through
/// a temporary file in the target's directory, so `target` is either left as
/// it was or fully replaced.
///
/// # Errors
/// Returns an error when the payload cannot be read or decoded, or the target
/// cannot be written.
pub fn decompress(payload: &Path, target: &Path) -> Result<u64, ExtractError> {
    let file = std::fs::File::open(payload)
        .map_err(|error| ExtractError::io("failed to open compressed payload", payload, error))?;
    let mut decoder = bzip2::read::MultiBzDecoder::new(std::io::BufReader::new(file));
    let mut content = Vec::new();
    decoder
        .read_to_end(&mut content)
        .map_err(ExtractError::Decompress)?;

    let dir = target
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut staged = tempfile::NamedTempFile::new_in(dir)
        .map_err(|error| ExtractError::io("failed to stage decompressed file in", dir, error))?;
    staged
        .write_all(&content)
        .and_then(|()| staged.flush())
        .map_err(|error| ExtractError::io("failed to write decompressed file", target, error))?;
    staged
        .persist(target)
        .map_err(|error| ExtractError::io("failed to replace", target, error.error))?;

    info!(
        "Decompressed {} ({} bytes)",
        target.display(),
        content.len()
    );
    Ok(content.len() as u64)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use patchkit_platform::HostPlatform;

    use super::multifile::tests::{Member, build_multifile};
    use super::{decompress, enclosed_member_path, is_excluded, open_bundle, unpack_bundle};

    fn excluded() -> Vec<String> {
        vec!["libpandadx8.dll".to_string(), "libpandadx9.dll".to_string()]
    }

    #[test]
    fn exclusion_applies_only_on_linux() {
        let names = excluded();
        assert!(is_excluded("libpandadx9.dll", HostPlatform::Linux, &names));
        assert!(!is_excluded("libpandadx9.dll", HostPlatform::Windows, &names));
        assert!(!is_excluded("libpandadx9.dll", HostPlatform::MacOs, &names));
        assert!(!is_excluded("libpandagl.dll", HostPlatform::Linux, &names));
    }

    #[test]
    fn enclosed_member_path_rejects_escapes() {
        assert_eq!(
            enclosed_member_path("phase_3/models/char.bam"),
            Some(std::path::PathBuf::from("phase_3").join("models").join("char.bam"))
        );
        assert_eq!(enclosed_member_path("../outside.txt"), None);
        assert_eq!(enclosed_member_path("/etc/passwd"), None);
        assert_eq!(enclosed_member_path(""), None);
    }

    #[test]
    fn decompress_round_trips_payload() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let payload = temp.path().join("data.bin.3.bz2");
        let target = temp.path().join("data.bin");
        let content: Vec<u8> = (0..1024_u32).map(|i| (i % 251) as u8).collect();

        let mut encoder =
            bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        encoder.write_all(&content).expect("payload should compress");
        let compressed = encoder.finish().expect("compression should finish");
        std::fs::write(&payload, compressed).expect("payload should be written");

        let written = decompress(&payload, &target).expect("payload should decompress");

        assert_eq!(written, 1024);
        assert_eq!(std::fs::read(&target).expect("target should exist"), content);
    }

    #[test]
    fn corrupt_payload_leaves_existing_target_untouched() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let payload = temp.path().join("data.bin.3.bz2");
        let target = temp.path().join("data.bin");
        std::fs::write(&payload, b"definitely not bzip2").expect("payload should be written");
        std::fs::write(&target, b"previous good content").expect("target should be written");

        assert!(decompress(&payload, &target).is_err());
        assert_eq!(
            std::fs::read(&target).expect("target should still exist"),
            b"previous good content"
        );
    }

    fn write_zip(path: &std::path::Path, members: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).expect("zip file should be created");
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o644);
        for (name, content) in members {
            writer
                .start_file(*name, options)
                .expect("zip entry should be started");
            writer.write_all(content).expect("zip entry should be written");
        }
        writer.finish().expect("zip archive should be finalized");
    }

    #[test]
    fn unpack_skips_excluded_members_on_linux_only() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let bundle_path = temp.path().join("phase_1.mf");
        write_zip(
            &bundle_path,
            &[
                ("libpandadx9.dll", b"dx9"),
                ("libpandadx8.dll", b"dx8"),
                ("phase_1/audio/click.ogg", b"ogg"),
            ],
        );

        let linux_dir = temp.path().join("linux");
        let mut bundle = open_bundle(&bundle_path).expect("bundle should open");
        let report = unpack_bundle(bundle.as_mut(), &linux_dir, HostPlatform::Linux, &excluded())
            .expect("bundle should unpack");
        assert_eq!(report.excluded, vec!["libpandadx9.dll", "libpandadx8.dll"]);
        assert!(!linux_dir.join("libpandadx9.dll").exists());
        assert!(linux_dir.join("phase_1/audio/click.ogg").is_file());

        let windows_dir = temp.path().join("windows");
        let mut bundle = open_bundle(&bundle_path).expect("bundle should reopen");
        let report = unpack_bundle(
            bundle.as_mut(),
            &windows_dir,
            HostPlatform::Windows,
            &excluded(),
        )
        .expect("bundle should unpack");
        assert!(report.excluded.is_empty());
        assert_eq!(
            std::fs::read(windows_dir.join("libpandadx8.dll")).expect("dll should be extracted"),
            b"dx8"
        );
    }

    #[test]
    fn multifile_bundle_unpacks_with_linux_exclusion() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let model = b"bam-model ".repeat(40);
        let multifile = build_multifile(
            "#! /usr/bin/env packp3d\n",
            &[
                Member::plain("libpandadx9.dll", b"dx9"),
                Member::plain("libpandadx8.dll", b"dx8"),
                Member::compressed("phase_1/models/a.bam", &model),
            ],
        );
        let mut encoder =
            bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        encoder
            .write_all(&multifile)
            .expect("bzip2 encode should succeed");
        let payload = temp.path().join("phase_1.mf.7.bz2");
        std::fs::write(&payload, encoder.finish().expect("bzip2 finish should succeed"))
            .expect("payload should be written");

        let bundle_path = temp.path().join("phase_1.mf");
        decompress(&payload, &bundle_path).expect("payload should decompress");

        let linux_dir = temp.path().join("linux");
        let mut bundle = open_bundle(&bundle_path).expect("multifile should open");
        let report = unpack_bundle(bundle.as_mut(), &linux_dir, HostPlatform::Linux, &excluded())
            .expect("multifile should unpack");
        assert_eq!(report.extracted, vec!["phase_1/models/a.bam"]);
        assert_eq!(report.excluded, vec!["libpandadx9.dll", "libpandadx8.dll"]);
        assert_eq!(
            std::fs::read(linux_dir.join("phase_1/models/a.bam")).expect("model should exist"),
            model
        );
        assert!(!linux_dir.join("libpandadx8.dll").exists());

        let windows_dir = temp.path().join("windows");
        let mut bundle = open_bundle(&bundle_path).expect("multifile should reopen");
        let report = unpack_bundle(
            bundle.as_mut(),
            &windows_dir,
            HostPlatform::Windows,
            &excluded(),
        )
        .expect("multifile should unpack");
        assert_eq!(report.extracted.len(), 3);
        assert!(report.excluded.is_empty());
        assert_eq!(
            std::fs::read(windows_dir.join("libpandadx9.dll")).expect("dll should be extracted"),
            b"dx9"
        );
    }

    #[test]
    fn unpack_skips_members_escaping_destination() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let bundle_path = temp.path().join("phase_2.mf");
        write_zip(&bundle_path, &[("../outside.txt", b"nope"), ("inside.txt", b"yes")]);

        let dest = temp.path().join("game");
        let mut bundle = open_bundle(&bundle_path).expect("bundle should open");
        let report = unpack_bundle(bundle.as_mut(), &dest, HostPlatform::Linux, &excluded())
            .expect("bundle should unpack");

        assert_eq!(report.unsafe_names, vec!["../outside.txt"]);
        assert!(!temp.path().join("outside.txt").exists());
        assert!(dest.join("inside.txt").is_file());
    }

    #[test]
    fn open_bundle_rejects_unknown_format() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("phase_1.mf");
        std::fs::write(&path, b"just some bytes").expect("fixture should be written");

        assert!(matches!(
            open_bundle(&path),
            Err(super::ExtractError::UnknownFormat)
        ));
    }
}
