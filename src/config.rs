//! TOML configuration for the engine.
//!
//! Every field has a default, so an empty file (or no file) yields a
//! working configuration:
//!
//! ```toml
//! [sandbox]
//! max_steps = 1000000
//! timeout_ms = 2000
//! max_memory = 134217728
//! allowed_modules = ["crypto"]
//!
//! [storage]
//! path = "/home/me/.clawvm/db"
//!
//! [logging]
//! filter = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sandbox::{
    ModuleAllowlist, SandboxExecutor, SandboxLimits, SandboxModule, UnknownModule,
    DEFAULT_MAX_CALL_DEPTH, DEFAULT_MAX_COLLECTION_LEN, DEFAULT_MAX_MEMORY, DEFAULT_MAX_STEPS,
    DEFAULT_MAX_STRING_LEN, DEFAULT_TIMEOUT,
};

/// Name of the data directory under the user's home
pub const DATA_DIR_NAME: &str = ".clawvm";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid TOML for this schema
    #[error("parse error: {0}")]
    Parse(String),

    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),

    /// Allowlist names a module that does not exist
    #[error(transparent)]
    UnknownModule(#[from] UnknownModule),
}

/// Engine configuration file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Sandbox quotas and capabilities
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Where contracts are persisted
    #[serde(default)]
    pub storage: StorageConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[sandbox]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Instruction quota per call (default: 1,000,000)
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    /// Wall-clock budget per call in milliseconds (default: 2000)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Nested function call limit (default: 32)
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    /// Element cap per array or object (default: 10,000)
    #[serde(default = "default_max_collection_len")]
    pub max_collection_len: usize,
    /// String length cap in bytes (default: 1 MiB)
    #[serde(default = "default_max_string_len")]
    pub max_string_len: usize,
    /// Bytes a call may allocate in total (default: 128 MiB)
    #[serde(default = "default_max_memory")]
    pub max_memory: usize,
    /// Modules contract code may `require` (default: all built-ins)
    #[serde(default = "default_allowed_modules")]
    pub allowed_modules: Vec<String>,
}

/// `[storage]` section
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database directory (default: `~/.clawvm/db`)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// `[logging]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive; `RUST_LOG` takes precedence (default: info)
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_max_steps() -> u64 {
    DEFAULT_MAX_STEPS
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_max_call_depth() -> usize {
    DEFAULT_MAX_CALL_DEPTH
}

fn default_max_collection_len() -> usize {
    DEFAULT_MAX_COLLECTION_LEN
}

fn default_max_string_len() -> usize {
    DEFAULT_MAX_STRING_LEN
}

fn default_max_memory() -> usize {
    DEFAULT_MAX_MEMORY
}

fn default_allowed_modules() -> Vec<String> {
    SandboxModule::all()
        .iter()
        .map(|m| m.name().to_string())
        .collect()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            timeout_ms: default_timeout_ms(),
            max_call_depth: default_max_call_depth(),
            max_collection_len: default_max_collection_len(),
            max_string_len: default_max_string_len(),
            max_memory: default_max_memory(),
            allowed_modules: default_allowed_modules(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl SandboxConfig {
    /// Quotas for the executor
    ///
    /// # Errors
    /// Returns error if a quota is zero
    pub fn limits(&self) -> Result<SandboxLimits, ConfigError> {
        for (name, value) in [
            ("max_steps", self.max_steps),
            ("timeout_ms", self.timeout_ms),
            ("max_call_depth", self.max_call_depth as u64),
            ("max_collection_len", self.max_collection_len as u64),
            ("max_string_len", self.max_string_len as u64),
            ("max_memory", self.max_memory as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("sandbox.{name} must be positive")));
            }
        }
        Ok(SandboxLimits {
            max_steps: self.max_steps,
            timeout: Duration::from_millis(self.timeout_ms),
            max_call_depth: self.max_call_depth,
            max_collection_len: self.max_collection_len,
            max_string_len: self.max_string_len,
            max_memory: self.max_memory,
            ..SandboxLimits::default()
        })
    }

    /// Modules contract code may load
    ///
    /// # Errors
    /// Returns error if a name is not a built-in module
    pub fn allowlist(&self) -> Result<ModuleAllowlist, ConfigError> {
        Ok(ModuleAllowlist::from_names(self.allowed_modules.as_slice())?)
    }
}

impl EngineConfig {
    /// Load from a TOML file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load `path` if it exists, defaults otherwise
    ///
    /// # Errors
    /// Returns error if an existing file cannot be read or parsed
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save to a TOML file
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Build the sandbox executor this config describes
    ///
    /// # Errors
    /// Returns error if a quota is zero or a module is unknown
    pub fn executor(&self) -> Result<SandboxExecutor, ConfigError> {
        Ok(SandboxExecutor::new(
            self.sandbox.limits()?,
            self.sandbox.allowlist()?,
        ))
    }

    /// Database directory, falling back to `<data_dir>/db`
    #[must_use]
    pub fn storage_path(&self, data_dir: &Path) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| data_dir.join("db"))
    }
}

/// Default data directory (`~/.clawvm`)
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.sandbox.limits().unwrap(), SandboxLimits::default());
        assert_eq!(config.sandbox.allowlist().unwrap(), ModuleAllowlist::default());
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_partial_section() {
        let config: EngineConfig = toml::from_str(
            r#"
            [sandbox]
            max_steps = 500
            max_memory = 4096
            allowed_modules = []
            "#,
        )
        .unwrap();
        let limits = config.sandbox.limits().unwrap();
        assert_eq!(limits.max_steps, 500);
        assert_eq!(limits.max_memory, 4096);
        assert_eq!(limits.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.sandbox.allowlist().unwrap(), ModuleAllowlist::none());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.sandbox.timeout_ms = 0;
        assert!(matches!(config.executor(), Err(ConfigError::Invalid(_))));

        let mut config = EngineConfig::default();
        config.sandbox.max_memory = 0;
        assert!(matches!(config.executor(), Err(ConfigError::Invalid(_))));

        let mut config = EngineConfig::default();
        config.sandbox.allowed_modules = vec!["fs".to_string()];
        assert!(matches!(config.executor(), Err(ConfigError::UnknownModule(_))));

        assert!(matches!(
            toml::from_str::<EngineConfig>("[sandbox]\nmax_steps = \"lots\"")
                .map_err(|e| ConfigError::Parse(e.to_string())),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("clawvm-config-{}", std::process::id()));
        let path = dir.join("config.toml");
        let mut config = EngineConfig::default();
        config.sandbox.max_call_depth = 8;
        config.storage.path = Some(dir.join("db"));
        config.save_to_file(&path).unwrap();

        let loaded = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.storage_path(Path::new("/unused")), dir.join("db"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let path = Path::new("/nonexistent/clawvm/config.toml");
        assert_eq!(
            EngineConfig::load_or_default(path).unwrap(),
            EngineConfig::default()
        );
    }
}
