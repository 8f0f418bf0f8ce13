use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::schema::{ConfigWarning, ErgonConfig, WarningSeverity};

/// Loads the Ergon configuration from disk and the environment.
///
/// Loading happens before logging is set up, so nothing is logged here.
/// Call [`ConfigLoader::report`] once a subscriber is installed.
pub struct ConfigLoader {
    config: ErgonConfig,
    config_path: PathBuf,
    from_file: bool,
    warnings: Vec<ConfigWarning>,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > ERGON_CONFIG env > ~/.ergon/ergon.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("ERGON_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ergon")
            .join("ergon.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> ergon_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let from_file = config_path.exists();
        let config = if from_file {
            let raw = std::fs::read_to_string(&config_path)?;
            Self::parse(&raw, &config_path)?
        } else {
            ErgonConfig::default()
        };

        let config = Self::apply_overrides(config, |key| std::env::var(key).ok());
        let warnings = config.validate().map_err(ergon_core::ErgonError::Config)?;

        Ok(Self {
            config,
            config_path,
            from_file,
            warnings,
        })
    }

    /// Log where the config came from and every validation warning.
    pub fn report(&self) {
        if self.from_file {
            info!(config_path = ?self.config_path, "loaded configuration");
        } else {
            warn!(config_path = ?self.config_path, "config file not found, using defaults");
        }
        for w in &self.warnings {
            match w.severity {
                WarningSeverity::Info => info!("{}", w),
                _ => warn!("{}", w),
            }
        }
    }

    /// Whether a config file was found and read.
    pub fn from_file(&self) -> bool {
        self.from_file
    }

    /// Non-fatal validation findings.
    pub fn warnings(&self) -> &[ConfigWarning] {
        &self.warnings
    }

    /// Parse TOML text into a config.
    pub fn parse(raw: &str, origin: &Path) -> ergon_core::Result<ErgonConfig> {
        toml::from_str::<ErgonConfig>(raw).map_err(|e| {
            ergon_core::ErgonError::Config(format!("failed to parse {}: {}", origin.display(), e))
        })
    }

    /// Get a snapshot of the loaded config.
    pub fn get(&self) -> ErgonConfig {
        self.config.clone()
    }

    /// Path the config was (or would have been) read from.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply overrides (ERGON_MODEL, ERGON_TIMEOUT_SECS, ...) from a variable lookup.
    pub fn apply_overrides<F>(mut config: ErgonConfig, lookup: F) -> ErgonConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ERGON_MODEL") {
            config.backend.model = v;
        }
        if let Some(v) = lookup("ERGON_TIMEOUT_SECS") {
            match v.parse::<u64>() {
                Ok(secs) => config.runner.default_timeout_secs = secs,
                Err(_) => warn!(value = %v, "ignoring non-numeric ERGON_TIMEOUT_SECS"),
            }
        }
        if let Some(v) = lookup("ERGON_TIMEOUT_POLICY") {
            config.runner.timeout_policy = v;
        }
        if let Some(v) = lookup("ERGON_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = lookup("ERGON_TRACE_DB") {
            config.trace.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ERGON_MEMORY_DB") {
            config.memory.db_path = PathBuf::from(v);
        }
        config
    }
}
