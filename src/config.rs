//! Master configuration using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. A TOML file (`config/master.toml` unless another path is given)
//! 3. Environment variables prefixed with `DAQ_MASTER_`, nested with `__`
//!
//! ```text
//! DAQ_MASTER_APPLICATION__LOG_LEVEL=debug
//! DAQ_MASTER_NETWORK__CONTROL_PORT=4000
//! DAQ_MASTER_WORKER__SHUTDOWN_TIMEOUT_MS=2000
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "lab-master"
//! log_level = "info"
//!
//! [network]
//! bind = "127.0.0.1"
//! control_port = 3251
//! queue_port = 3252
//!
//! [databases]
//! device_db = "ddb.json"
//! parameter_db = "pdb.json"
//!
//! [worker]
//! args = ["worker"]
//! shutdown_timeout_ms = 1000
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MasterError, MasterResult};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/master.toml";

/// Top-level master configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Listener addresses
    #[serde(default)]
    pub network: NetworkConfig,
    /// Flat-file databases
    #[serde(default)]
    pub databases: DatabaseConfig,
    /// Worker subprocess settings
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name (used in log lines)
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Listener configuration. Port 0 picks a free port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Interface every listener binds to
    pub bind: String,
    /// Run submission and cancellation
    pub control_port: u16,
    /// Publisher for the run queue
    pub queue_port: u16,
    /// Publisher for timed runs
    pub timed_port: u16,
    /// Publisher for realtime results of the current run
    pub rt_results_port: u16,
    /// Publisher for the parameter database
    pub parameters_port: u16,
}

/// Device and parameter database files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Device database (JSON mapping of name to description)
    pub device_db: PathBuf,
    /// Parameter database, rewritten on every change
    pub parameter_db: PathBuf,
}

/// Worker subprocess configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker executable; the running executable when unset
    #[serde(default)]
    pub program: Option<PathBuf>,
    /// Arguments passed to the worker executable
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
    /// Grace period between closing the worker's stdin and killing it
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "daq_master".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            control_port: 3251,
            queue_port: 3252,
            timed_port: 3253,
            rt_results_port: 3254,
            parameters_port: 3255,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            device_db: PathBuf::from("ddb.json"),
            parameter_db: PathBuf::from("pdb.json"),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: default_worker_args(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_worker_args() -> Vec<String> {
    vec!["worker".to_string()]
}

fn default_shutdown_timeout() -> u64 {
    1000
}

impl WorkerConfig {
    /// Grace period before a worker that was asked to exit is killed.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] (if present) and the
    /// environment.
    pub fn load() -> MasterResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file is not an
    /// error: defaults and environment variables still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> MasterResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_MASTER_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Non-zero ports are distinct
    /// - Worker arguments and shutdown grace period are usable
    pub fn validate(&self) -> MasterResult<()> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(MasterError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.application.log_level,
                LEVELS.join(", ")
            )));
        }

        let n = &self.network;
        let mut ports: Vec<u16> = [
            n.control_port,
            n.queue_port,
            n.timed_port,
            n.rt_results_port,
            n.parameters_port,
        ]
        .into_iter()
        .filter(|p| *p != 0)
        .collect();
        let configured = ports.len();
        ports.sort_unstable();
        ports.dedup();
        if ports.len() != configured {
            return Err(MasterError::Configuration(
                "Listener ports must be distinct".to_string(),
            ));
        }

        if self.worker.shutdown_timeout_ms == 0 {
            return Err(MasterError::Configuration(
                "worker.shutdown_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
