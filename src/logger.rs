//! Log output setup.
//!
//! Lines go to stderr and, when possible, to a log file: the system-wide
//! path when `/var/log` is writable (the daemon usually runs as root),
//! otherwise a file under the invoking user's home. The file is trimmed
//! to its last 1000 lines on startup so it never grows without bound.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

const SYSTEM_LOG: &str = "/var/log/ev-remapper.log";
const HOME_LOG: &str = ".log/ev_remapper.log";
const KEEP_LINES: usize = 1000;

/// Where log lines should go for this invocation.
pub fn log_file_path() -> PathBuf {
    if unsafe { libc::access(c"/var/log".as_ptr(), libc::W_OK) } == 0 {
        PathBuf::from(SYSTEM_LOG)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(HOME_LOG)
    }
}

/// Install the global tracing subscriber.
///
/// `debug` selects the default verbosity (`RUST_LOG` still overrides it);
/// `trim` rewrites the log file down to its tail and should only be set by
/// the daemon itself, not by child processes sharing the file. A file that
/// cannot be prepared falls back to stderr-only logging.
pub fn init(debug: bool, trim: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match open_log_file(&log_file_path(), trim) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::io::stderr.and(Mutex::new(file)))
                .init();
        }
        Err(err) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::io::stderr)
                .init();
            tracing::debug!("not logging to a file: {err:#}");
        }
    }
}

fn open_log_file(path: &Path, trim: bool) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create \"{}\"", parent.display()))?;
    }

    // A directory squatting on the log path is junk state, clear it.
    if path.is_dir() {
        fs::remove_dir_all(path)
            .with_context(|| format!("failed to clear directory at \"{}\"", path.display()))?;
    }

    if trim && path.exists() {
        let contents = String::from_utf8_lossy(&fs::read(path)?).into_owned();
        if let Some(tail) = tail_lines(&contents, KEEP_LINES) {
            fs::write(path, tail)
                .with_context(|| format!("failed to trim \"{}\"", path.display()))?;
        }
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open \"{}\"", path.display()))
}

/// The last `keep` lines of `contents`, or `None` when nothing needs to be
/// cut off.
fn tail_lines(contents: &str, keep: usize) -> Option<String> {
    let total = contents.lines().count();
    if total <= keep {
        return None;
    }

    let mut tail: String = contents
        .lines()
        .skip(total - keep)
        .collect::<Vec<_>>()
        .join("\n");
    tail.push('\n');
    Some(tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_logs_are_left_alone() {
        assert_eq!(tail_lines("a\nb\nc\n", 1000), None);
        assert_eq!(tail_lines("", 1000), None);
    }

    #[test]
    fn long_logs_keep_only_the_tail() {
        let contents: String = (0..1500).map(|n| format!("line {n}\n")).collect();
        let tail = tail_lines(&contents, 1000).unwrap();
        assert_eq!(tail.lines().count(), 1000);
        assert!(tail.starts_with("line 500\n"));
        assert!(tail.ends_with("line 1499\n"));
    }

    #[test]
    fn directory_on_the_log_path_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ev-remapper.log");
        fs::create_dir_all(path.join("nested")).unwrap();

        let file = open_log_file(&path, true).unwrap();
        drop(file);
        assert!(path.is_file());
    }

    #[test]
    fn existing_file_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ev-remapper.log");
        let contents: String = (0..1200).map(|n| format!("line {n}\n")).collect();
        fs::write(&path, contents).unwrap();

        open_log_file(&path, true).unwrap();
        let trimmed = fs::read_to_string(&path).unwrap();
        assert_eq!(trimmed.lines().count(), 1000);
        assert!(trimmed.starts_with("line 200\n"));
    }
}
