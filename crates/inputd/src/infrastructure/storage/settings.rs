//! File-backed persistence for runtime setting changes.
//!
//! The engine reports every accepted `Set*` control call through the
//! [`SettingsStore`] port; this implementation folds the change into the
//! in-memory [`AppConfig`] and rewrites the TOML file, so the change is
//! still there after a daemon restart.  Persistence failure is logged and
//! swallowed: a read-only filesystem must not break live routing.

use std::path::PathBuf;

use tracing::warn;

use crate::application::engine::SettingsStore;
use crate::infrastructure::storage::config::{self, AppConfig};

/// [`SettingsStore`] writing through to the TOML config file.
pub struct FileSettingsStore {
    path: PathBuf,
    config: AppConfig,
}

impl FileSettingsStore {
    /// `config` is the state of the file at startup; later writes are
    /// folded into it before each save.
    pub fn new(path: PathBuf, config: AppConfig) -> Self {
        Self { path, config }
    }
}

impl SettingsStore for FileSettingsStore {
    fn write_setting(&mut self, path: &str, value: &str) {
        if !config::write_setting(&mut self.config, path, value) {
            warn!(setting = %path, value = %value, "unknown setting path, not persisted");
            return;
        }
        if let Err(e) = config::save_config_to(&self.config, &self.path) {
            warn!(setting = %path, error = %e, "could not persist setting");
        }
    }
}
