//! Population configuration
//!
//! An explicit configuration struct threaded through job construction; no
//! process-wide toggles. Values are layered: defaults, then an optional TOML
//! config file, then `GRIX_*` environment variables.

use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Default number of entities read per scan block
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 256;

/// Default queue depth at which the scan drains concurrent updates
pub const DEFAULT_QUEUE_THRESHOLD: usize = 1000;

/// Default byte cap for queued concurrent updates; draining also triggers
/// when the queues hold this much, bounding buffer memory for large stores
/// with many concurrent writers
pub const DEFAULT_QUEUE_MAX_BYTES: u64 = 8 * 1024 * 1024;

/// Configuration for one population job
#[derive(Debug, Clone)]
pub struct PopulationConfig {
    /// Entities per scan read block (also the flush batch size per index)
    pub scan_batch_size: usize,
    /// Queue depth that triggers a drain at the next entity boundary
    pub queue_threshold: usize,
    /// Queued-bytes cap that triggers a drain regardless of depth
    pub queue_max_bytes: u64,
    /// Worker threads for parallel batch flushing; 0 means one per core
    pub parallel_workers: usize,
    /// Whether completed indexes are re-sampled in the background
    pub background_sampling: bool,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
            queue_threshold: DEFAULT_QUEUE_THRESHOLD,
            queue_max_bytes: DEFAULT_QUEUE_MAX_BYTES,
            parallel_workers: 0,
            background_sampling: true,
        }
    }
}

/// Config file format (TOML), `[population]` section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub population: PopulationConfigFile,
}

/// Population section of the config file; absent keys keep their defaults
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PopulationConfigFile {
    pub scan_batch_size: Option<usize>,
    pub queue_threshold: Option<usize>,
    pub queue_max_bytes: Option<u64>,
    pub parallel_workers: Option<usize>,
    pub background_sampling: Option<bool>,
}

impl PopulationConfig {
    /// Load config with priority: environment variables > config file > defaults
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.filter(|p| p.exists()) {
            let content = fs::read_to_string(path)?;
            let file: ConfigFile = toml::from_str(&content)?;
            config.apply_file(&file.population);
        }

        config.apply_env();
        Ok(config)
    }

    fn apply_file(&mut self, file: &PopulationConfigFile) {
        if let Some(v) = file.scan_batch_size {
            self.scan_batch_size = v;
        }
        if let Some(v) = file.queue_threshold {
            self.queue_threshold = v;
        }
        if let Some(v) = file.queue_max_bytes {
            self.queue_max_bytes = v;
        }
        if let Some(v) = file.parallel_workers {
            self.parallel_workers = v;
        }
        if let Some(v) = file.background_sampling {
            self.background_sampling = v;
        }
    }

    fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("GRIX_SCAN_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.scan_batch_size = v;
            }
        }
        if let Ok(val) = std::env::var("GRIX_QUEUE_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.queue_threshold = v;
            }
        }
        if let Ok(val) = std::env::var("GRIX_QUEUE_MAX_BYTES") {
            if let Ok(v) = val.parse() {
                self.queue_max_bytes = v;
            }
        }
        if let Ok(val) = std::env::var("GRIX_WORKERS") {
            if let Ok(v) = val.parse() {
                self.parallel_workers = v;
            }
        }
        if let Ok(val) = std::env::var("GRIX_BACKGROUND_SAMPLING") {
            if let Ok(v) = val.parse() {
                self.background_sampling = v;
            }
        }
    }
}
