//! Settings file watcher
//!
//! Polls the modification time of the settings file and reports a freshly
//! parsed [`Settings`] whenever it changes. Edits that fail to parse or
//! validate are logged and skipped; the previous settings stay in effect.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{Result, Settings, SettingsError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    interval: Duration,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Watch `path`, taking its current state as already seen
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        let path = path.into();
        let last_modified = modified(&path);
        Self {
            path,
            interval,
            last_modified,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check the file once. Returns the new settings when the file changed
    /// since the last check and parses cleanly.
    pub fn poll(&mut self) -> Result<Option<Settings>> {
        let current = modified(&self.path);
        if current.is_none() || current == self.last_modified {
            return Ok(None);
        }
        self.last_modified = current;

        let settings = Settings::load_from(&self.path)?;
        settings.validate()?;
        Ok(Some(settings))
    }

    /// Poll until the receiving side goes away
    pub async fn run(mut self, updates: mpsc::Sender<Settings>) {
        info!("Watching {:?} for changes", self.path);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = updates.closed() => break,
                _ = ticker.tick() => {}
            }
            match self.poll() {
                Ok(Some(settings)) => {
                    info!("Settings file {:?} changed", self.path);
                    if updates.send(settings).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(SettingsError::Invalid(reason)) => {
                    warn!("Ignoring invalid settings in {:?}: {}", self.path, reason);
                }
                Err(e) => warn!("Failed to reload {:?}: {}", self.path, e),
            }
        }
        debug!("Settings watcher for {:?} stopped", self.path);
    }

    /// Spawn [`ConfigWatcher::run`] and return the update channel
    pub fn spawn(self) -> mpsc::Receiver<Settings> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(self.run(tx));
        rx
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
