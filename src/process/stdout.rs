//! Stdout/stderr redirection for backend processes.
//!
//! Each launch gets its own file named
//! `<prefix>_<yyyyMMddHHmmss>_<supervisor pid>.log`. Files that stay empty
//! are removed when the process stops.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use time::macros::format_description;
use time::OffsetDateTime;

#[derive(Debug)]
pub struct StdoutLog {
    path: PathBuf,
    file: File,
}

impl StdoutLog {
    /// Create the log file, creating parent directories as needed.
    pub fn create(prefix: &str) -> io::Result<Self> {
        let path = log_path(prefix, OffsetDateTime::now_utc(), std::process::id())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Handles for the child's stdout and stderr.
    pub fn stdio_pair(&self) -> io::Result<(Stdio, Stdio)> {
        let out = self.file.try_clone()?;
        let err = self.file.try_clone()?;
        Ok((Stdio::from(out), Stdio::from(err)))
    }

    /// Remove the file when nothing was written to it. Best effort.
    pub fn remove_if_empty(&self) {
        match std::fs::metadata(&self.path) {
            Ok(meta) if meta.len() == 0 => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    tracing::debug!(path = %self.path.display(), error = %e, "Failed to remove empty stdout log");
                }
            }
            _ => {}
        }
    }
}

fn log_path(prefix: &str, now: OffsetDateTime, pid: u32) -> io::Result<PathBuf> {
    let stamp = now
        .format(format_description!("[year][month][day][hour][minute][second]"))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    Ok(PathBuf::from(format!("{prefix}_{stamp}_{pid}.log")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn file_name_format() {
        let path = log_path("logs/stdout", datetime!(2024-03-05 07:08:09 UTC), 42).unwrap();
        assert_eq!(path, PathBuf::from("logs/stdout_20240305070809_42.log"));
    }

    #[test]
    fn empty_log_is_removed() {
        let dir = std::env::temp_dir().join(format!("fwd-stdout-{}", uuid::Uuid::new_v4()));
        let prefix = dir.join("stdout");
        let log = StdoutLog::create(prefix.to_str().unwrap()).unwrap();
        assert!(log.path().exists());

        log.remove_if_empty();
        assert!(!log.path().exists());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn non_empty_log_is_kept() {
        use std::io::Write;

        let dir = std::env::temp_dir().join(format!("fwd-stdout-{}", uuid::Uuid::new_v4()));
        let prefix = dir.join("stdout");
        let log = StdoutLog::create(prefix.to_str().unwrap()).unwrap();
        (&log.file).write_all(b"hello").unwrap();

        log.remove_if_empty();
        assert!(log.path().exists());
        std::fs::remove_dir_all(dir).ok();
    }
}
