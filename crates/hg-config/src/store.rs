//! Atomically swappable configuration holder
//!
//! Readers take an `Arc` snapshot and keep using it for the whole event they
//! are handling, so a reload never shows them a half-updated provider set.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::{GuardConfig, Result};

pub struct ConfigStore {
    current: RwLock<Arc<GuardConfig>>,
    source: Option<PathBuf>,
    last_modified: Mutex<Option<SystemTime>>,
    generation: Mutex<u64>,
}

impl ConfigStore {
    /// Holder for an in-memory configuration (validated first)
    pub fn new(config: GuardConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(config)),
            source: None,
            last_modified: Mutex::new(None),
            generation: Mutex::new(0),
        })
    }

    /// Holder backed by a TOML file that [`reload_if_changed`](Self::reload_if_changed) watches
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = GuardConfig::load(&path)?;
        let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

        info!(
            path = %path.display(),
            providers = config.providers.len(),
            "Loaded configuration"
        );

        Ok(Self {
            current: RwLock::new(Arc::new(config)),
            source: Some(path),
            last_modified: Mutex::new(modified),
            generation: Mutex::new(0),
        })
    }

    /// Snapshot of the active configuration
    pub fn current(&self) -> Arc<GuardConfig> {
        self.current.read().clone()
    }

    /// Number of successful swaps since construction
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Swap in a new configuration. Invalid configurations leave the old one active.
    pub fn replace(&self, config: GuardConfig) -> Result<()> {
        config.validate()?;
        let providers = config.providers.len();
        *self.current.write() = Arc::new(config);
        let mut generation = self.generation.lock();
        *generation += 1;
        info!(generation = *generation, providers = providers, "Configuration swapped");
        Ok(())
    }

    /// Re-read the backing file when its modification time moved.
    /// Returns `Ok(true)` when a new configuration was applied.
    pub fn reload_if_changed(&self) -> Result<bool> {
        let Some(path) = self.source.as_ref() else {
            return Ok(false);
        };

        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        {
            let last = self.last_modified.lock();
            if modified.is_none() || *last == modified {
                return Ok(false);
            }
        }

        match GuardConfig::load(path) {
            Ok(config) => {
                self.replace(config)?;
                *self.last_modified.lock() = modified;
                Ok(true)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Rejected configuration reload, keeping previous");
                // Remember the broken revision so it is not re-parsed on every poll
                *self.last_modified.lock() = modified;
                Err(e)
            }
        }
    }
}
