//! Tollgate Configuration System
//!
//! TOML-based configuration for counters, admission gates and the reservation
//! worker pool, with environment variable override support.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Enable development mode (verbose demo output)
    pub dev_mode: bool,
    pub worker: WorkerConfig,
    pub gates: Vec<GateConfig>,
    pub counters: Vec<CounterConfig>,
}

/// Reservation worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker tasks servicing the request queue
    pub pool_size: usize,
    /// Maximum queued requests before `submit` rejects
    pub queue_capacity: usize,
    /// Lower bound of the simulated external step latency
    pub latency_min_ms: u64,
    /// Upper bound of the simulated external step latency
    pub latency_max_ms: u64,
    /// Probability in [0, 1] that the simulated external step fails
    pub failure_rate: f64,
    /// Abort the external step after this long (no timeout when unset)
    pub step_timeout_ms: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            queue_capacity: 256,
            latency_min_ms: 100,
            latency_max_ms: 1000,
            failure_rate: 0.0,
            step_timeout_ms: None,
        }
    }
}

impl WorkerConfig {
    pub fn latency_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.latency_min_ms),
            Duration::from_millis(self.latency_max_ms),
        )
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }
}

/// A bounded facility served by a fixed number of interchangeable slots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    pub name: String,
    pub slots: u32,
    /// Give up waiting for a slot after this long (wait forever when unset)
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
}

impl GateConfig {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

/// A named depletable counter (seats, stock, balance)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterConfig {
    pub name: String,
    pub capacity: u32,
    /// Starting level; defaults to `capacity`
    #[serde(default)]
    pub initial_level: Option<u32>,
    /// Gate that must be held while a reservation is in service
    #[serde(default)]
    pub gate: Option<String>,
}

impl CounterConfig {
    pub fn initial_level(&self) -> u32 {
        self.initial_level.unwrap_or(self.capacity)
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.worker;
        if w.pool_size == 0 {
            return Err(ConfigError::ValidationError("worker.pool_size must be at least 1".into()));
        }
        if w.queue_capacity == 0 {
            return Err(ConfigError::ValidationError("worker.queue_capacity must be at least 1".into()));
        }
        if w.latency_min_ms > w.latency_max_ms {
            return Err(ConfigError::ValidationError(format!(
                "worker.latency_min_ms ({}) exceeds worker.latency_max_ms ({})",
                w.latency_min_ms, w.latency_max_ms
            )));
        }
        if !(0.0..=1.0).contains(&w.failure_rate) {
            return Err(ConfigError::ValidationError(format!(
                "worker.failure_rate must be within [0, 1], got {}",
                w.failure_rate
            )));
        }

        let mut names = HashSet::new();
        for gate in &self.gates {
            if gate.slots == 0 {
                return Err(ConfigError::ValidationError(format!("gate '{}' has zero slots", gate.name)));
            }
            if !names.insert(gate.name.as_str()) {
                return Err(ConfigError::ValidationError(format!("duplicate resource name '{}'", gate.name)));
            }
        }

        let gate_names: HashSet<&str> = self.gates.iter().map(|g| g.name.as_str()).collect();
        for counter in &self.counters {
            if counter.initial_level() > counter.capacity {
                return Err(ConfigError::ValidationError(format!(
                    "counter '{}' initial_level {} exceeds capacity {}",
                    counter.name,
                    counter.initial_level(),
                    counter.capacity
                )));
            }
            if let Some(gate) = &counter.gate {
                if !gate_names.contains(gate.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "counter '{}' references unknown gate '{}'",
                        counter.name, gate
                    )));
                }
            }
            if !names.insert(counter.name.as_str()) {
                return Err(ConfigError::ValidationError(format!("duplicate resource name '{}'", counter.name)));
            }
        }

        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Tollgate Configuration
# Environment variables (TOLLGATE_*) override these settings

dev_mode = false

[worker]
pool_size = 8
queue_capacity = 256
latency_min_ms = 100
latency_max_ms = 1000
failure_rate = 0.0
# step_timeout_ms = 5000

[[gates]]
name = "cajeros"
slots = 2
acquire_timeout_ms = 10000

[[counters]]
name = "Ciudad Antigua"
capacity = 10

[[counters]]
name = "Playas del Sol"
capacity = 10

[[counters]]
name = "Montaña Escondida"
capacity = 3

[[counters]]
name = "Mercado Local"
capacity = 10

[[counters]]
name = "saldo"
capacity = 200
gate = "cajeros"
"#
        .to_string()
    }
}
