//! Configuration module for TreeVis-RS
//!
//! This module handles host configuration including:
//! - The `treevis.toml` application config (module roots, security, workers, render rate)
//! - The directory layout used to resolve module references and store installed modules
//! - The global settings namespace that module defaults are merged into
//!
//! # App Data Location
//!
//! Application data is stored in the platform-appropriate location:
//! - **Linux**: `~/.local/share/dev.treevis.treevis-rs/`
//! - **macOS**: `~/Library/Application Support/dev.treevis.treevis-rs/`
//! - **Windows**: `%APPDATA%\dev.treevis.treevis-rs\`
//!
//! # Files
//!
//! - `treevis.toml` - Application configuration
//! - `trusted_keys.json` - Public keys the user chose to trust
//! - `libraries/` - User-local cache of module reference files
//! - `modules/` - Module data root; installed descriptors live in `modules/store/`
//! - `logs/` - Rolling log files written by the binary

pub mod settings;

pub use settings::GlobalSettings;

use crate::error::{Result, TreeVisError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for data directories
pub const APP_ID: &str = "dev.treevis.treevis-rs";

/// Config filename
pub const CONFIG_FILE: &str = "treevis.toml";

/// Trusted key ring filename
pub const KEY_RING_FILE: &str = "trusted_keys.json";

/// Default RSA modulus size for generated keys
pub const DEFAULT_KEY_SIZE_BITS: usize = 4096;

/// Default minimum delay between render passes (~30 Hz)
pub const DEFAULT_MIN_PASS_INTERVAL_MS: u64 = 33;

/// Default number of pipeline worker threads
pub const DEFAULT_WORKER_THREADS: usize = 2;

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir().ok_or_else(|| {
        TreeVisError::Config("Could not determine app data directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            TreeVisError::Config(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Get the path to the config file
pub fn config_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Module Roots ====================

/// Directories consulted when resolving references and storing modules.
///
/// Reference lookup order: beside the host executable, then the user-local
/// libraries cache (plus any extra library dirs), then the module data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRoots {
    /// Directory containing the host executable
    pub executable_dir: PathBuf,
    /// User-local cache of reference files
    pub libraries_dir: PathBuf,
    /// Extra library directories from config, searched after `libraries_dir`
    pub extra_library_dirs: Vec<PathBuf>,
    /// User-local module data root
    pub module_data_dir: PathBuf,
    /// Installed module descriptors, keyed by id
    pub store_dir: PathBuf,
    /// Persisted trusted key ring
    pub key_ring_path: PathBuf,
    /// Rolling log files written by the binary
    pub logs_dir: PathBuf,
}

impl ModuleRoots {
    /// Layout rooted at `data_dir`, with the executable dir taken from the running binary.
    pub fn from_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let executable_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        Self::with_executable_dir(data_dir, executable_dir)
    }

    /// Layout rooted at `data_dir` with an explicit executable dir (used by tests).
    pub fn with_executable_dir(data_dir: impl AsRef<Path>, executable_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.as_ref();
        let module_data_dir = data_dir.join("modules");
        Self {
            executable_dir: executable_dir.into(),
            libraries_dir: data_dir.join("libraries"),
            extra_library_dirs: Vec::new(),
            store_dir: module_data_dir.join("store"),
            module_data_dir,
            key_ring_path: data_dir.join(KEY_RING_FILE),
            logs_dir: data_dir.join("logs"),
        }
    }

    /// Layout for the configured app data dir.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let data_dir = match &config.modules.data_dir {
            Some(dir) => dir.clone(),
            None => ensure_app_data_dir()?,
        };
        let mut roots = Self::from_data_dir(data_dir);
        roots.extra_library_dirs = config.modules.extra_library_dirs.clone();
        Ok(roots)
    }

    /// Create every writable directory in the layout.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.libraries_dir, &self.module_data_dir, &self.store_dir, &self.logs_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Library directories in search order, after the executable dir.
    pub fn library_dirs(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.libraries_dir).chain(self.extra_library_dirs.iter())
    }
}

// ==================== App Config ====================

/// Module loading and installation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModuleConfig {
    /// Override for the app data dir (module store, libraries, key ring)
    pub data_dir: Option<PathBuf>,
    /// Extra directories searched for module references
    pub extra_library_dirs: Vec<PathBuf>,
    /// Verify package signatures on install
    pub verify_on_install: bool,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            extra_library_dirs: Vec::new(),
            verify_on_install: true,
        }
    }
}

/// Code-signing settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// RSA modulus size for newly generated keys
    pub key_size_bits: usize,
    /// Add the signer's key to the trusted ring whenever permission is granted
    pub trust_key_on_grant: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            key_size_bits: DEFAULT_KEY_SIZE_BITS,
            trust_key_on_grant: false,
        }
    }
}

/// Pipeline execution settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSettings {
    /// Number of background threads executing pipeline runs
    pub worker_threads: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }
}

/// Render coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    /// Minimum delay after each render pass, in milliseconds
    pub min_pass_interval_ms: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            min_pass_interval_ms: DEFAULT_MIN_PASS_INTERVAL_MS,
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub modules: ModuleConfig,
    pub security: SecurityConfig,
    pub pipeline: PipelineSettings,
    pub render: RenderConfig,
}

impl AppConfig {
    /// Load config from the default location; a missing file yields defaults.
    pub fn load() -> Result<Self> {
        let path = config_path().ok_or_else(|| {
            TreeVisError::Config("Could not determine config path".to_string())
        })?;
        Self::load_from(path)
    }

    /// Load config from `path`; a missing file yields defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| TreeVisError::Config(format!("Failed to read {:?}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| TreeVisError::Config(format!("Failed to parse {:?}: {}", path, e)))
    }

    /// Load config, returning defaults on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save config to `path` as TOML
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TreeVisError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| TreeVisError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| TreeVisError::Config(format!("Failed to write {:?}: {}", path, e)))
    }

    /// Render pass interval as a `Duration`
    pub fn min_pass_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.render.min_pass_interval_ms)
    }
}
