use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::sync::HierarchyMode;
use crate::utils::error::{Result, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSysConfig {
    /// Requested bucket count; the map rounds up to the next prime.
    pub bucket_capacity: usize,
    pub hierarchy_checks: HierarchyMode,
    pub worker_threads: usize,
    pub chunks_per_worker: usize,
    /// Share of jobs that take a whole-chunk lock, in `0.0..=1.0`.
    pub whole_chunk_ratio: f64,
    /// Chunks are spread over a cube of this radius around the origin.
    pub world_radius: i32,
    pub seed: u64,
    pub log_level: String,
}

impl Default for ChunkSysConfig {
    fn default() -> Self {
        Self {
            bucket_capacity: 1021,
            hierarchy_checks: HierarchyMode::Auto,
            worker_threads: 4,
            chunks_per_worker: 256,
            whole_chunk_ratio: 0.1,
            world_radius: 8,
            seed: 0,
            log_level: "info".to_string(),
        }
    }
}

impl ChunkSysConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(StoreError::InvalidConfig(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.whole_chunk_ratio) {
            return Err(StoreError::InvalidConfig(format!(
                "whole_chunk_ratio {} is outside 0..=1",
                self.whole_chunk_ratio
            )));
        }
        if self.world_radius <= 0 {
            return Err(StoreError::InvalidConfig(
                "world_radius must be positive".to_string(),
            ));
        }
        self.level_filter()?;
        Ok(())
    }

    pub fn level_filter(&self) -> Result<LevelFilter> {
        self.log_level
            .parse()
            .map_err(|_| StoreError::InvalidConfig(format!("unknown log level {:?}", self.log_level)))
    }
}
