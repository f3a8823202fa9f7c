//! Store configuration.
//!
//! Values come from three layers, later ones winning:
//!
//! 1. Defaults: database and model named after the running executable
//! 2. A TOML file ([`StoreConfig::load`])
//! 3. `LAYERDB_*` environment variables ([`StoreConfig::apply_env`])
//!
//! ```toml
//! database_name = "music"
//! model_name = "music"
//! data_dir = "/var/lib/music"
//! notify_capacity = 4096
//! ```
//!
//! A [`ConfigCell`] holds the configuration a process runs with. It accepts
//! overrides until the first [`ConfigCell::get`], then freezes.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::notify::DEFAULT_NOTIFY_CAPACITY;
use crate::query::DEFAULT_PLAN_CACHE_CAPACITY;

/// Fallback name when the executable name is unavailable.
pub const FALLBACK_NAME: &str = "layerdb";

pub const ENV_DATABASE_NAME: &str = "LAYERDB_DATABASE_NAME";
pub const ENV_MODEL_NAME: &str = "LAYERDB_MODEL_NAME";
pub const ENV_DATA_DIR: &str = "LAYERDB_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_name: String,
    pub model_name: String,
    pub data_dir: PathBuf,
    pub notify_capacity: usize,
    pub plan_cache_capacity: usize,
}

fn application_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

impl Default for StoreConfig {
    fn default() -> Self {
        let name = application_name();
        Self {
            database_name: name.clone(),
            model_name: name,
            data_dir: PathBuf::from("data"),
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
            plan_cache_capacity: DEFAULT_PLAN_CACHE_CAPACITY,
        }
    }
}

impl StoreConfig {
    /// Defaults rooted at `data_dir`.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&text)?;
        debug!(path = %path.as_ref().display(), "loaded store config");
        Ok(config)
    }

    /// Applies `LAYERDB_*` overrides from the process environment.
    pub fn apply_env(self) -> Self {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(name) = var(ENV_DATABASE_NAME) {
            self.database_name = name;
        }
        if let Some(name) = var(ENV_MODEL_NAME) {
            self.model_name = name;
        }
        if let Some(dir) = var(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        self
    }

    /// `<data_dir>/<database_name>.sqlite`
    pub fn sqlite_store_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.sqlite", self.database_name))
    }
}

// =============================================================================
// ConfigCell
// =============================================================================

/// Configuration that can be overridden until first read.
#[derive(Debug, Default)]
pub struct ConfigCell {
    pending: Mutex<StoreConfig>,
    frozen: OnceLock<StoreConfig>,
}

impl ConfigCell {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            pending: Mutex::new(config),
            frozen: OnceLock::new(),
        }
    }

    /// The configuration in effect. Freezes the cell.
    pub fn get(&self) -> &StoreConfig {
        self.frozen.get_or_init(|| {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.get().is_some()
    }

    pub fn set_database_name(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.update(|c| c.database_name = name)
    }

    pub fn set_model_name(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.update(|c| c.model_name = name)
    }

    pub fn set_data_dir(&self, dir: impl Into<PathBuf>) -> Result<()> {
        let dir = dir.into();
        self.update(|c| c.data_dir = dir)
    }

    pub fn replace(&self, config: StoreConfig) -> Result<()> {
        self.update(|c| *c = config)
    }

    fn update(&self, edit: impl FnOnce(&mut StoreConfig)) -> Result<()> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_frozen() {
            return Err(Error::Config(
                "configuration is read-only after first use".to_string(),
            ));
        }
        edit(&mut pending);
        Ok(())
    }
}
