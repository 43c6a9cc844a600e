#[cfg(debug_assertions)]
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use simplelog::{CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, WriteLogger};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use patchkit_platform::AppPaths;

/// Append-only log file that is reopened when it has been deleted or moved
/// away, e.g. by a user clearing logs while an update runs.
struct LogFile {
    path: PathBuf,
    file: Option<File>,
}

impl LogFile {
    fn open(path: PathBuf) -> io::Result<Self> {
        let mut log = Self { path, file: None };
        log.handle()?;
        Ok(log)
    }

    fn handle(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() || !self.path.exists() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("log file not available"))
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.as_mut().map_or(Ok(()), File::flush)
    }
}

fn previous_log(log_path: &Path) -> PathBuf {
    let mut name = log_path.file_name().unwrap_or_default().to_os_string();
    name.push(".old");
    log_path.with_file_name(name)
}

/// Move an oversized log to `<name>.old`, replacing the previous one, so a
/// run starts with an empty file and the last long session stays readable.
fn rotate_if_oversized(log_path: &Path, max_log_size: u64) -> io::Result<bool> {
    match std::fs::metadata(log_path) {
        Ok(metadata) if metadata.len() > max_log_size => {
            std::fs::rename(log_path, previous_log(log_path))?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

fn level_for(debug_enabled: bool) -> LevelFilter {
    if debug_enabled {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Install the global logger: the per-user log file always, plus stderr in
/// debug builds. Failing to set up the file only loses the file sink.
pub fn init_logging(debug_enabled: bool, max_log_size: u64) {
    let log_path = AppPaths::new().ok().map(|paths| paths.log_file());
    let rotated = log_path
        .as_deref()
        .map(|path| rotate_if_oversized(path, max_log_size));

    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .add_filter_allow_str("patchkit")
        .build();
    let level = level_for(debug_enabled);

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    #[cfg(debug_assertions)]
    loggers.push(TermLogger::new(
        level,
        config.clone(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    ));
    let file_error = match log_path.clone().map(LogFile::open) {
        Some(Ok(file)) => {
            loggers.push(WriteLogger::new(level, config, file));
            None
        }
        Some(Err(error)) => Some(error),
        None => None,
    };

    if loggers.is_empty() || CombinedLogger::init(loggers).is_err() {
        return;
    }

    match (&log_path, file_error) {
        (Some(path), None) => log::info!("Logging to {}", path.display()),
        (Some(path), Some(error)) => {
            log::warn!("Could not open log file {}: {error}", path.display());
        }
        (None, _) => log::warn!("No per-user log directory; file logging disabled"),
    }
    match rotated {
        Some(Ok(true)) => log::info!("Previous log exceeded {max_log_size} bytes and was rotated"),
        Some(Err(error)) => log::warn!("Could not rotate log file: {error}"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use simplelog::LevelFilter;

    use super::{LogFile, level_for, previous_log, rotate_if_oversized};

    #[test]
    fn log_file_is_recreated_after_deletion() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let log_path = temp_dir.path().join("logs").join("patchkit.log");
        let mut log = LogFile::open(log_path.clone()).expect("log file should open");

        log.write_all(b"Downloading file: phase_1.mf.v3.bz2\n")
            .expect("initial write should succeed");
        std::fs::remove_dir_all(temp_dir.path().join("logs")).expect("log dir should be removable");
        log.write_all(b"Removed compressed file\n")
            .expect("writer should recreate the file and its directory");

        let contents =
            std::fs::read_to_string(&log_path).expect("recreated file should be readable");
        assert_eq!(contents, "Removed compressed file\n");
    }

    #[test]
    fn oversized_log_is_rotated_over_the_previous_one() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let log_path = temp_dir.path().join("patchkit.log");
        std::fs::write(previous_log(&log_path), "older session\n")
            .expect("previous log should be written");
        std::fs::write(&log_path, "run-1\nrun-2\nrun-3\n").expect("log should be written");

        let rotated = rotate_if_oversized(&log_path, 10).expect("rotation should succeed");

        assert!(rotated);
        assert!(!log_path.exists());
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("patchkit.log.old"))
                .expect("rotated log should be readable"),
            "run-1\nrun-2\nrun-3\n"
        );
    }

    #[test]
    fn small_or_missing_logs_stay_put() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let log_path = temp_dir.path().join("patchkit.log");

        assert!(!rotate_if_oversized(&log_path, 10).expect("missing log is not an error"));

        std::fs::write(&log_path, "run-1\n").expect("log should be written");
        assert!(!rotate_if_oversized(&log_path, 1024).expect("rotation check should succeed"));
        assert!(log_path.exists());
        assert!(!previous_log(&log_path).exists());
    }

    #[test]
    fn debug_setting_lowers_the_level_to_debug() {
        assert_eq!(level_for(true), LevelFilter::Debug);
        assert_eq!(level_for(false), LevelFilter::Info);
    }
}
