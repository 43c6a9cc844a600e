use std::io::Read;
use std::path::Path;

use log::debug;

use crate::manifest::FileIntegrityRecord;

const HASH_CHUNK_SIZE: usize = 8192;

/// Whether the file at `path` already matches `record`.
///
/// A missing file or a size mismatch answers `false` without reading any
/// content. Read errors also answer `false`.
#[must_use]
pub fn verify_file(path: &Path, record: &FileIntegrityRecord) -> bool {
    let len = std::fs::metadata(path)
        .ok()
        .filter(std::fs::Metadata::is_file)
        .map(|metadata| metadata.len());
    let satisfied = is_satisfied(len, || std::fs::File::open(path), record);
    debug!(
        "Verified {} against {} bytes / {}: {satisfied}",
        path.display(),
        record.expected_size,
        record.expected_hash
    );
    satisfied
}

/// Size-then-hash check over an arbitrary byte source.
///
/// `open` is only called when `len` equals the expected size.
pub fn is_satisfied<R, F>(len: Option<u64>, open: F, record: &FileIntegrityRecord) -> bool
where
    R: Read,
    F: FnOnce() -> std::io::Result<R>,
{
    if len != Some(record.expected_size) {
        return false;
    }
    let Ok(reader) = open() else {
        return false;
    };
    match md5_reader(reader) {
        Ok(digest) => digest.eq_ignore_ascii_case(&record.expected_hash),
        Err(error) => {
            debug!("Failed to hash {}: {error}", record.file_name);
            false
        }
    }
}

/// Lowercase hex md5 of a file's content.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn md5_file(path: &Path) -> std::io::Result<String> {
    md5_reader(std::fs::File::open(path)?)
}

fn md5_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut context = md5::Context::new();
    let mut buffer = [0_u8; HASH_CHUNK_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}
