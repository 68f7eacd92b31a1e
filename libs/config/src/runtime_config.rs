//! Runtime Configuration Module
//!
//! Loads the settings of one Lattice node: scheduler sizing, middleman
//! transport options and logging. Values come from built-in defaults, an
//! optional TOML file and `LATTICE_` environment overrides, in that order.

use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Prefix of environment overrides, e.g. `LATTICE_SCHEDULER__WORKER_THREADS=4`
pub const ENV_PREFIX: &str = "LATTICE";

/// Separator between nested keys in environment overrides
pub const ENV_SEPARATOR: &str = "__";

const MIN_FRAME_SIZE: usize = 1024;
const MAX_FRAME_SIZE: usize = 1024 * 1024 * 1024;
const MAX_WORKER_THREADS: usize = 1024;

/// Complete configuration of one node
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    pub middleman: MiddlemanConfig,
    pub logging: LoggingConfig,
}

/// Cooperative worker pool settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads; 0 selects the available parallelism
    pub worker_threads: usize,
    /// Messages an actor may process per resume before yielding its worker
    pub max_throughput: usize,
}

/// Middleman (network I/O) settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MiddlemanConfig {
    /// Largest BASP payload accepted from a peer, in bytes
    pub max_frame_size: usize,
    /// Upper bound for connecting and completing a handshake
    pub connect_timeout_ms: u64,
    /// Use connection-local type ids (announced with ADD_TYPE) instead of
    /// inline type names for frames addressed to the direct peer
    pub use_type_ids: bool,
    /// Disable Nagle's algorithm on every connection
    pub nodelay: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            max_throughput: 300,
        }
    }
}

impl Default for MiddlemanConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            connect_timeout_ms: 5000,
            use_type_ids: true,
            nodelay: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl SchedulerConfig {
    /// Worker count after resolving `0` to the machine's parallelism
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

impl MiddlemanConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl RuntimeConfig {
    /// Load configuration from an optional TOML file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading runtime config: {:?}", path);
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config: RuntimeConfig = builder
            .build()
            .context("Failed to build runtime configuration")?
            .try_deserialize()
            .context("Failed to deserialize runtime configuration")?;

        config.validate()?;
        debug!(?config, "Runtime configuration loaded");
        Ok(config)
    }

    /// Parse configuration from TOML text, without environment overrides
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RuntimeConfig =
            toml::from_str(text).context("Failed to parse runtime configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize runtime configuration")
    }

    /// Rejects values the runtime cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.worker_threads > MAX_WORKER_THREADS {
            bail!(
                "scheduler.worker_threads = {} exceeds the limit of {}",
                self.scheduler.worker_threads,
                MAX_WORKER_THREADS
            );
        }
        if self.scheduler.max_throughput == 0 {
            bail!("scheduler.max_throughput must be at least 1");
        }
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&self.middleman.max_frame_size) {
            bail!(
                "middleman.max_frame_size = {} is outside {}..={}",
                self.middleman.max_frame_size,
                MIN_FRAME_SIZE,
                MAX_FRAME_SIZE
            );
        }
        if self.middleman.connect_timeout_ms == 0 {
            bail!("middleman.connect_timeout_ms must be positive");
        }
        if self.logging.level.trim().is_empty() {
            bail!("logging.level must not be empty");
        }
        Ok(())
    }
}
