//! YAML run configuration.
//!
//! Loaded once at startup and shared read-only with every thread. The
//! key names here are the file format; renaming a field breaks existing
//! configs.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::filters::{BpfFilter, FilterError};
use tracemill_plugin::PluginDescriptor;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read config file {0}: {1}")]
    Read(PathBuf, io::Error),

    #[error("malformed config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("worker_count must be at least 1")]
    BadWorkerCount,

    #[error("interval_seconds must be at least 1")]
    BadInterval,

    #[error("no input sources configured")]
    NoInputs,

    #[error("no active plugins configured")]
    NoPlugins,

    #[error("bound_start_epoch must be before bound_end_epoch")]
    BadBounds,

    #[error("invalid bpf_expression: {0}")]
    BadFilter(#[from] FilterError),
}

/// One tagging provider sub-tree: an `enabled` switch plus the provider's
/// data file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub data_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u32,

    /// 0 disables output rotation.
    #[serde(default)]
    pub rotate_every_n_intervals: u32,

    /// Inclusive lower bound on packet timestamps.
    #[serde(default)]
    pub bound_start_epoch: Option<u32>,

    /// Exclusive upper bound on packet timestamps.
    #[serde(default)]
    pub bound_end_epoch: Option<u32>,

    pub input_sources: Vec<String>,

    #[serde(default)]
    pub bpf_expression: Option<String>,

    #[serde(default)]
    pub remove_spoofed: bool,

    #[serde(default)]
    pub remove_erratic: bool,

    #[serde(default)]
    pub remove_unrouted: bool,

    #[serde(default)]
    pub tree_filter_name: Option<String>,

    #[serde(default)]
    pub tagging_enabled: bool,

    #[serde(default)]
    pub pfx2as: TagProviderConfig,

    #[serde(default)]
    pub maxmind: TagProviderConfig,

    #[serde(default)]
    pub netacq: TagProviderConfig,

    pub active_plugins: Vec<PluginDescriptor>,
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_interval_seconds() -> u32 {
    60
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
        let config: Config = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::BadWorkerCount);
        }
        if self.interval_seconds == 0 {
            return Err(ConfigError::BadInterval);
        }
        if self.input_sources.is_empty() {
            return Err(ConfigError::NoInputs);
        }
        if self.active_plugins.is_empty() {
            return Err(ConfigError::NoPlugins);
        }
        if let (Some(start), Some(end)) = (self.bound_start_epoch, self.bound_end_epoch) {
            if start >= end {
                return Err(ConfigError::BadBounds);
            }
        }
        if let Some(expression) = &self.bpf_expression {
            BpfFilter::parse(expression)?;
        }
        Ok(())
    }

    pub fn plugin_count(&self) -> usize {
        self.active_plugins.len()
    }

    pub fn rotation_enabled(&self) -> bool {
        self.rotate_every_n_intervals > 0
    }
}
