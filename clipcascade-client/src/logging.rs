use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing_subscriber::EnvFilter;

use crate::config::data_dir;

const DEFAULT_FILTER: &str = "info";
/// A log larger than this at startup is moved aside to `<name>.old`.
const ROTATE_AT_BYTES: u64 = 5 * 1024 * 1024;

pub fn client_log_path() -> PathBuf {
    data_dir().join("logs").join("clipcascade-client.log")
}

/// Opens `path` for appending, keeping at most one previous generation.
pub fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    if let Ok(meta) = std::fs::metadata(path)
        && meta.len() > ROTATE_AT_BYTES
    {
        std::fs::rename(path, path.with_extension("log.old"))?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Installs the global subscriber. Output goes to the client log file, or to
/// stderr when that cannot be opened; `RUST_LOG` overrides `info`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let path = client_log_path();

    match open_log_file(&path) {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init(),
        Err(err) => {
            eprintln!("logging to stderr, cannot open {}: {err}", path.display());
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn creates_missing_directories_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("client.log");

        writeln!(open_log_file(&path).unwrap(), "first").unwrap();
        writeln!(open_log_file(&path).unwrap(), "second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn oversized_log_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.log");
        let big = File::create(&path).unwrap();
        big.set_len(ROTATE_AT_BYTES + 1).unwrap();
        drop(big);

        let fresh = open_log_file(&path).unwrap();
        assert_eq!(fresh.metadata().unwrap().len(), 0);
        assert_eq!(
            std::fs::metadata(path.with_extension("log.old")).unwrap().len(),
            ROTATE_AT_BYTES + 1
        );
    }
}
