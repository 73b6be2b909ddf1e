/// Configuration loading from statemgr.json
use crate::config::types::{OpcodeFlavor, Result, SearcherKind, StateManagerError};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default config file name looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "statemgr.json";

/// Coordinator and worker tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StateManagerConfig {
    /// Seconds without a newly translated block before convergence is forced (0 disables)
    pub timeout_secs: u64,
    /// Sleep between mailbox polls while the process is suspended
    pub poll_interval_ms: u64,
    /// Period of the interpreter timer callback
    pub timer_interval_ms: u64,
    /// Number of worker slots in the shared segment actually scanned
    pub max_processes: usize,
    /// Custom instruction encoding of the guest
    pub opcode_layout: OpcodeFlavor,
    /// Base state selection policy
    pub searcher: SearcherKind,
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            poll_interval_ms: 1000,
            timer_interval_ms: 1000,
            max_processes: 8,
            opcode_layout: OpcodeFlavor::X86,
            searcher: SearcherKind::Dfs,
        }
    }
}

impl StateManagerConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            StateManagerError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: StateManagerConfig = serde_json::from_str(&content)
            .map_err(|e| StateManagerError::Config(format!("Failed to parse config JSON: {}", e)))?;

        info!(
            "Loaded state manager config from {} (timeout={}s, max_processes={})",
            path.as_ref().display(),
            config.timeout_secs,
            config.max_processes
        );
        Ok(config)
    }

    /// Load ./statemgr.json, falling back to built-in defaults
    pub fn load_default() -> Result<Self> {
        let config_path = std::env::current_dir()
            .map_err(|e| StateManagerError::Config(format!("Failed to get current directory: {}", e)))?
            .join(DEFAULT_CONFIG_FILE);

        if !config_path.exists() {
            warn!(
                "{} not found in current directory, using built-in defaults",
                DEFAULT_CONFIG_FILE
            );
            return Ok(Self::default());
        }

        Self::load_from_file(config_path)
    }

    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout_secs))
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timer_interval(&self) -> Duration {
        Duration::from_millis(self.timer_interval_ms)
    }
}
