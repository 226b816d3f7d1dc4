//! Server configuration: a YAML file with environment overrides.
//!
//! Resolution order, later wins: built-in defaults, the file named by
//! `WAYPOINT_CONFIG` (if set), then individual `WAYPOINT_*` variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP API binds to
    pub addr: String,
    /// Directory holding `flows/`, `stations/` and `fragments/`
    pub spec_dir: PathBuf,
    /// Directory for run-state snapshot logs; `None` keeps runs in memory
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8650".to_string(),
            spec_dir: PathBuf::from("specs"),
            data_dir: Some(PathBuf::from("data/runs")),
        }
    }
}

impl Config {
    /// Load configuration from the environment (and the config file it may
    /// point at).
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os("WAYPOINT_CONFIG") {
            Some(path) => {
                let path = PathBuf::from(path);
                let body = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                serde_yaml::from_str(&body)
                    .with_context(|| format!("Invalid config {}", path.display()))?
            }
            None => Self::default(),
        };

        if let Ok(addr) = std::env::var("WAYPOINT_ADDR") {
            config.addr = addr;
        }
        if let Ok(dir) = std::env::var("WAYPOINT_SPEC_DIR") {
            config.spec_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("WAYPOINT_DATA_DIR") {
            config.data_dir = if dir.is_empty() {
                None
            } else {
                Some(PathBuf::from(dir))
            };
        }
        Ok(config)
    }
}
