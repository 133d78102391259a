//! Store configuration
//!
//! Describes one persistence scope on disk: which root macro storage files
//! hang off, where that root lives, and any extra path macros the host wants
//! defined up front. Persisted as JSON next to the application's other
//! configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::constants::{config, macros};
use crate::path_macros::MacroTable;

/// Persistence scope a store serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreScope {
    #[default]
    Application,
    Project,
    Module,
}

impl StoreScope {
    /// Macro that plain storage file names are resolved against
    pub fn root_macro(self) -> &'static str {
        match self {
            StoreScope::Application => macros::APP_CONFIG,
            StoreScope::Project => macros::PROJECT_CONFIG_DIR,
            StoreScope::Module => macros::MODULE_DIR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub scope: StoreScope,

    /// Directory the scope's root macro expands to
    pub root_dir: PathBuf,

    /// Extra macros defined before any component loads
    #[serde(default)]
    pub macros: BTreeMap<String, String>,

    /// Macro matching during collapse; `None` follows the host file system
    #[serde(default)]
    pub case_sensitive: Option<bool>,

    /// Never report plugin faults for disabling
    #[serde(default)]
    pub sandbox: bool,
}

impl StoreConfig {
    pub fn new(scope: StoreScope, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            scope,
            root_dir: root_dir.into(),
            macros: BTreeMap::new(),
            case_sensitive: None,
            sandbox: false,
        }
    }

    /// Application scope rooted in the platform config directory
    pub fn application_default() -> Self {
        let mut root = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        root.push(config::APP_DIR);
        Self::new(StoreScope::Application, root)
    }

    pub fn with_macro(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.macros.insert(name.into(), value.into());
        self
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read store config from {:?}", path))?;
        let config: StoreConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse store config from {:?}", path))?;
        info!(path = %path.display(), scope = ?config.scope, "Loaded store config");
        Ok(config)
    }

    /// Load `path`, writing the application default there if it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        warn!(path = %path.display(), "Store config not found, creating default");
        let config = Self::application_default();
        config.save(path)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize store config")?;
        fs::write(path, json).with_context(|| format!("Failed to write store config to {:?}", path))?;
        info!(path = %path.display(), "Saved store config");
        Ok(())
    }

    /// Root macro, user home and the configured extras.
    ///
    /// Explicit entries win over the built-in user home; redefining the
    /// root macro is an error.
    pub fn macro_table(&self) -> crate::error::Result<MacroTable> {
        let mut table = MacroTable::new();
        table.add(self.scope.root_macro(), &self.root_dir.to_string_lossy())?;
        for (name, value) in &self.macros {
            table.add(name, value)?;
        }
        if !table.contains(macros::USER_HOME) {
            if let Some(home) = dirs::home_dir() {
                table.add(macros::USER_HOME, &home.to_string_lossy())?;
            }
        }
        Ok(table)
    }
}
