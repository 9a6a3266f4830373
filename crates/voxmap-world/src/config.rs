//! World configuration, loadable from TOML.

use std::path::Path;

use serde::{Deserialize, Serialize};
use voxmap_core::constants::MAX_MAP_GENERATION_LIMIT;
use voxmap_core::{Error, Result};

use crate::terrain::TerrainConfig;
use crate::WorldSeed;

/// Top-level configuration of a server map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Seed for every procedural generator.
    pub seed: WorldSeed,
    pub map: MapConfig,
    pub liquid: LiquidConfig,
    pub mapgen: MapgenConfig,
}

impl WorldConfig {
    /// Parse a configuration from TOML text. Missing keys take defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Serialize to TOML text.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.mapgen.chunk_size < 1 {
            return Err(Error::Config("mapgen.chunk_size must be at least 1".into()));
        }
        if self.map.sector_cache_capacity < 1 {
            return Err(Error::Config(
                "map.sector_cache_capacity must be at least 1".into(),
            ));
        }
        if self.liquid.max_budget_multiplier < 1 {
            return Err(Error::Config(
                "liquid.max_budget_multiplier must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Block index, unloading and persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Seconds a block may stay unused before it is unloaded.
    pub unload_timeout: f32,
    /// Upper bound on loaded blocks; `None` means unlimited.
    pub max_loaded_blocks: Option<usize>,
    /// Block blob compression; 0 stores raw data.
    pub compression_level: i32,
    /// Number of recently used sectors remembered by the sector cache.
    pub sector_cache_capacity: usize,
    /// Encoded blocks kept for retry after a failed save.
    pub max_pending_saves: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            unload_timeout: 29.0,
            max_loaded_blocks: None,
            compression_level: -1,
            sector_cache_capacity: 1,
            max_pending_saves: 256,
        }
    }
}

/// Liquid transform scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidConfig {
    /// Entries processed per call at the base budget.
    pub loop_max: usize,
    /// Queue length beyond which the oldest entries may be dropped.
    pub max_queue_len: usize,
    /// Seconds of queue growth tolerated before the budget escalates.
    pub grace_period: f32,
    pub max_budget_multiplier: u32,
}

impl Default for LiquidConfig {
    fn default() -> Self {
        Self {
            loop_max: 10_000,
            max_queue_len: 500_000,
            grace_period: 5.0,
            max_budget_multiplier: 8,
        }
    }
}

/// Chunk generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapgenConfig {
    /// Edge length of a mapchunk in blocks.
    pub chunk_size: i32,
    /// Nodes per axis from the origin beyond which nothing is generated.
    pub mapgen_limit: i32,
    /// Fixed number of dungeons per chunk; `None` samples the density noise.
    pub dungeons_per_chunk: Option<u32>,
    pub terrain: TerrainConfig,
}

impl Default for MapgenConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5,
            mapgen_limit: MAX_MAP_GENERATION_LIMIT,
            dungeons_per_chunk: None,
            terrain: TerrainConfig::default(),
        }
    }
}
