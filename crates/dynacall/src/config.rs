//! Configuration (dynacall.toml)
//!
//! Settings are merged in the following order (later overrides earlier):
//! 1. Built-in defaults
//! 2. `dynacall.toml`, found by walking up from the current directory
//! 3. Environment variables (`DYNACALL_*`)
//!
//! ```toml
//! [runtime]
//! worker_threads = 8
//!
//! [library]
//! search_paths = ["/opt/vendor/lib"]
//! release_policy = "reject"
//! ```
//!
//! The process-wide configuration is read once, the first time the worker
//! pool or a default [`LibraryOptions`](crate::LibraryOptions) needs it.
//! Call [`install`] before that to supply one programmatically.

use crate::library::ReleasePolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Name of the configuration file
pub const CONFIG_FILE_NAME: &str = "dynacall.toml";

/// Worker threads used when nothing else is configured
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParse {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Contents of dynacall.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct DynacallConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub library: LibraryConfig,
}

/// `[runtime]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Size of the worker pool for asynchronous calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_threads: Option<usize>,
}

/// `[library]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LibraryConfig {
    /// Directories searched before the platform defaults
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_policy: Option<ReleasePolicy>,
}

impl DynacallConfig {
    /// Parse and validate a configuration file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Io(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.runtime.worker_threads == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "runtime.worker_threads".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Effective worker pool size
    pub fn worker_threads(&self) -> usize {
        self.runtime.worker_threads.unwrap_or(DEFAULT_WORKER_THREADS)
    }

    /// Effective release policy
    pub fn release_policy(&self) -> ReleasePolicy {
        self.library.release_policy.unwrap_or_default()
    }
}

/// Configuration loader
///
/// Finds `dynacall.toml`, then applies environment variable overrides.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Directory the file was found in, after a successful load
    config_root: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find dynacall.toml. Without one the
    /// defaults are used.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<DynacallConfig> {
        let mut current = start_dir.to_path_buf();
        let config = loop {
            let candidate = current.join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                let config = DynacallConfig::load_from_file(&candidate)?;
                self.config_root = Some(current);
                break config;
            }
            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break DynacallConfig::default(),
            }
        };
        apply_overrides(config, |key| env::var(key).ok())
    }

    /// Load a specific configuration file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<DynacallConfig> {
        let config = DynacallConfig::load_from_file(config_path)?;
        self.config_root = config_path.parent().map(Path::to_path_buf);
        apply_overrides(config, |key| env::var(key).ok())
    }

    /// Directory the configuration file was found in
    pub fn config_root(&self) -> Option<&Path> {
        self.config_root.as_deref()
    }
}

/// Apply `DYNACALL_*` overrides read through `lookup`
///
/// - `DYNACALL_WORKER_THREADS`: positive integer
/// - `DYNACALL_RELEASE_POLICY`: `drain` or `reject`
/// - `DYNACALL_SEARCH_PATHS`: platform path list, prepended to the file's
pub fn apply_overrides<F>(mut config: DynacallConfig, lookup: F) -> ConfigResult<DynacallConfig>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(threads) = lookup("DYNACALL_WORKER_THREADS") {
        let threads = threads
            .trim()
            .parse::<usize>()
            .map_err(|e| ConfigError::InvalidValue {
                field: "DYNACALL_WORKER_THREADS".to_string(),
                reason: e.to_string(),
            })?;
        config.runtime.worker_threads = Some(threads);
    }

    if let Some(policy) = lookup("DYNACALL_RELEASE_POLICY") {
        let policy = policy
            .parse::<ReleasePolicy>()
            .map_err(|reason| ConfigError::InvalidValue {
                field: "DYNACALL_RELEASE_POLICY".to_string(),
                reason,
            })?;
        config.library.release_policy = Some(policy);
    }

    if let Some(paths) = lookup("DYNACALL_SEARCH_PATHS") {
        let mut search_paths: Vec<PathBuf> = env::split_paths(&paths).collect();
        search_paths.append(&mut config.library.search_paths);
        config.library.search_paths = search_paths;
    }

    config.validate()?;
    Ok(config)
}

static CONFIG: OnceLock<DynacallConfig> = OnceLock::new();

/// The process-wide configuration, loaded on first use
///
/// A broken configuration file is reported and replaced by the defaults.
pub fn global() -> &'static DynacallConfig {
    CONFIG.get_or_init(|| {
        let start = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let mut loader = ConfigLoader::new();
        match loader.load_from_directory(&start) {
            Ok(config) => {
                if let Some(root) = loader.config_root() {
                    log::debug!("loaded {} from {}", CONFIG_FILE_NAME, root.display());
                }
                config
            }
            Err(e) => {
                log::warn!("ignoring configuration: {}", e);
                DynacallConfig::default()
            }
        }
    })
}

/// Install the process-wide configuration
///
/// Fails, handing the configuration back, once one is in use.
pub fn install(config: DynacallConfig) -> Result<(), DynacallConfig> {
    CONFIG.set(config)
}
