//! Configuration file watching
//!
//! Watches the config file for writes and renames and surfaces a
//! debounced change signal. Editors commonly replace the file rather
//! than writing in place, so the watcher observes the parent directory
//! and filters on the file name.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ConfigError;

/// How long to let a burst of filesystem events settle before
/// reporting one change.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(400);

/// A debounced watcher over a single configuration file.
pub struct ConfigWatcher {
    // Dropping the watcher stops the notify thread.
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<()>,
}

impl ConfigWatcher {
    /// Start watching `path` for changes.
    ///
    /// # Errors
    ///
    /// `WatchError` if the watch cannot be established.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let file_name = path.file_name().map(std::ffi::OsStr::to_os_string);
        let watch_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let (tx, rx) = mpsc::channel(8);
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "config watch error");
                    return;
                }
            };
            let relevant = matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) && event.paths.iter().any(|p| {
                file_name
                    .as_ref()
                    .is_some_and(|name| p.file_name() == Some(name))
            });
            if relevant {
                // Coalescing happens on the receiving side; a full
                // queue just means a signal is already pending.
                let _ = tx.try_send(());
            }
        })
        .map_err(|e| ConfigError::WatchError(e.to_string()))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::WatchError(e.to_string()))?;
        debug!(dir = %watch_dir.display(), "watching configuration directory");

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Wait for the next change. Bursts of events within the debounce
    /// window collapse into one signal. Returns `None` if the watcher
    /// thread is gone.
    pub async fn changed(&mut self) -> Option<()> {
        self.rx.recv().await?;
        loop {
            match tokio::time::timeout(DEBOUNCE_WINDOW, self.rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) | Err(_) => break,
            }
        }
        Some(())
    }
}
