//! Hot reload of the configuration file.
//!
//! The parent directory is watched rather than the file itself: editors that
//! save by writing a temporary file and renaming it over the original replace
//! the inode, and a watch on the old inode would go quiet. Events are then
//! narrowed down to the configuration file by name.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{EventKind, ModifyKind};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::ForwarderConfig;

/// Backends without native notifications fall back to polling at this rate.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Turns file system events for one configuration file into validated
/// configurations.
pub struct ConfigWatcher {
    path: PathBuf,
    updates: mpsc::UnboundedSender<ForwarderConfig>,
}

impl ConfigWatcher {
    /// The watcher and the channel its reloaded configurations arrive on.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ForwarderConfig>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            updates,
        };
        (watcher, rx)
    }

    /// Start watching. Notifications stop when the returned handle is dropped.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let dir = watched_dir(&self.path);
        let Some(name) = self.path.file_name().map(OsString::from) else {
            return Err(notify::Error::generic("configuration path has no file name"));
        };
        let Self { path, updates } = self;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if is_reload_event(&event, &name) => reload(&path, &updates),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        tracing::info!(dir = ?dir, "Config watcher started");
        Ok(watcher)
    }
}

fn reload(path: &Path, updates: &mpsc::UnboundedSender<ForwarderConfig>) {
    tracing::info!(path = ?path, "Config file changed, reloading");
    match load_config(path) {
        Ok(config) => {
            let _ = updates.send(config);
        }
        Err(e) => {
            tracing::error!(path = ?path, error = %e, "Reload failed, keeping current configuration");
        }
    }
}

/// Directory holding `path`; a bare file name lives in the working directory.
fn watched_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Whether `event` rewrote the file called `name`.
///
/// Content writes, creations and renames onto the file count. Metadata
/// changes (touch, chmod) and removals do not.
fn is_reload_event(event: &Event, name: &OsString) -> bool {
    let relevant = match event.kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    };
    relevant
        && event
            .paths
            .iter()
            .any(|p| p.file_name().is_some_and(|n| n == name.as_os_str()))
}
