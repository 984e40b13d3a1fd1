//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "tollgate.toml",
    "config.toml",
    "./config/tollgate.toml",
    "/etc/tollgate/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    search_standard_paths: bool,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            config_path: None,
            search_standard_paths: true,
        }
    }

    /// Create a loader with a specific config file path.
    /// Only that file is considered; standard paths are not searched.
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
            search_standard_paths: false,
        }
    }

    /// Load configuration from file (if found) with environment variable overrides,
    /// then validate the result
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = match self.find_config_file()? {
            Some(path) => {
                info!(?path, "Loading configuration from file");
                AppConfig::from_file(&path)?
            }
            None => AppConfig::default(),
        };

        self.apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Result<Option<PathBuf>, ConfigError> {
        // An explicit path must exist
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::ReadError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config file not found: {}", path.display()),
            )));
        }

        if let Ok(path) = env::var("TOLLGATE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Some(path));
            }
        }

        if self.search_standard_paths {
            for path in CONFIG_PATHS {
                let path = PathBuf::from(path);
                if path.exists() {
                    return Ok(Some(path));
                }
            }
        }

        Ok(None)
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) -> Result<(), ConfigError> {
        // Worker
        if let Some(size) = parse_env("TOLLGATE_WORKER_POOL_SIZE")? {
            config.worker.pool_size = size;
        }
        if let Some(capacity) = parse_env("TOLLGATE_WORKER_QUEUE_CAPACITY")? {
            config.worker.queue_capacity = capacity;
        }
        if let Some(ms) = parse_env("TOLLGATE_LATENCY_MIN_MS")? {
            config.worker.latency_min_ms = ms;
        }
        if let Some(ms) = parse_env("TOLLGATE_LATENCY_MAX_MS")? {
            config.worker.latency_max_ms = ms;
        }
        if let Some(rate) = parse_env("TOLLGATE_FAILURE_RATE")? {
            config.worker.failure_rate = rate;
        }
        if let Some(ms) = parse_env("TOLLGATE_STEP_TIMEOUT_MS")? {
            config.worker.step_timeout_ms = Some(ms);
        }

        // General
        if let Ok(val) = env::var("TOLLGATE_DEV_MODE") {
            config.dev_mode = val == "true" || val == "1";
        }

        Ok(())
    }
}

/// Parse an environment variable, reporting malformed values instead of
/// silently ignoring them
fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::EnvError(format!("{} has invalid value '{}'", key, val))),
        Err(_) => Ok(None),
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
