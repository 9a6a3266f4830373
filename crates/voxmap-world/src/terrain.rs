//! Procedural terrain generation.

use glam::IVec3;
use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use voxmap_core::{ContentId, Node, NodeRegistry, Result, VoxelArea};
use voxmap_voxel::VoxelBuffer;

use crate::WorldSeed;

/// Terrain generator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    /// Lowest possible surface height.
    pub base_height: i32,
    /// Water fills air at or below this height.
    pub sea_level: i32,
    /// Horizontal scale of terrain features.
    pub terrain_scale: f64,
    /// Maximum terrain height variation.
    pub terrain_height: f64,
    /// Number of noise octaves for detail.
    pub octaves: usize,
    /// Frequency multiplier between octaves.
    pub lacunarity: f64,
    /// Amplitude multiplier between octaves.
    pub persistence: f64,
    /// Depth of dirt layer below surface.
    pub dirt_depth: u32,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            base_height: -24,
            sea_level: 1,
            terrain_scale: 100.0,
            terrain_height: 64.0,
            octaves: 4,
            lacunarity: 2.0,
            persistence: 0.5,
            dirt_depth: 4,
        }
    }
}

/// Content ids the terrain is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerrainPalette {
    pub stone: ContentId,
    pub dirt: ContentId,
    pub grass: ContentId,
    pub water: ContentId,
}

impl TerrainPalette {
    pub fn from_registry(registry: &NodeRegistry) -> Result<Self> {
        Ok(Self {
            stone: registry.require("default:stone")?,
            dirt: registry.require("default:dirt")?,
            grass: registry.require("default:dirt_with_grass")?,
            water: registry.require("default:water_source")?,
        })
    }
}

/// Procedural terrain generator using fractal noise.
#[derive(Debug, Clone)]
pub struct TerrainGenerator {
    config: TerrainConfig,
    height_noise: Fbm<Perlin>,
}

impl TerrainGenerator {
    /// Create a new terrain generator with the given configuration.
    pub fn new(config: TerrainConfig, seed: WorldSeed) -> Self {
        let height_noise = Fbm::<Perlin>::new(seed as u32)
            .set_octaves(config.octaves.max(1))
            .set_lacunarity(config.lacunarity)
            .set_persistence(config.persistence);

        Self {
            config,
            height_noise,
        }
    }

    /// Create a terrain generator with default configuration.
    pub fn with_seed(seed: WorldSeed) -> Self {
        Self::new(TerrainConfig::default(), seed)
    }

    /// Get the terrain configuration.
    pub fn config(&self) -> &TerrainConfig {
        &self.config
    }

    /// Surface height at world XZ coordinates.
    pub fn height_at(&self, x: i32, z: i32) -> i32 {
        let nx = f64::from(x) / self.config.terrain_scale;
        let nz = f64::from(z) / self.config.terrain_scale;

        // Noise returns [-1, 1], map to [0, terrain_height] above the base
        let noise_value = self.height_noise.get([nx, nz]);
        ((noise_value + 1.0) * 0.5 * self.config.terrain_height) as i32 + self.config.base_height
    }

    /// Node at height `y` of a column whose surface is at `surface_height`.
    fn node_at_depth(&self, y: i32, surface_height: i32, palette: &TerrainPalette) -> Node {
        let content = if y > surface_height {
            if y <= self.config.sea_level {
                palette.water
            } else {
                ContentId::AIR
            }
        } else if y == surface_height && y >= self.config.sea_level {
            palette.grass
        } else if y > surface_height - self.config.dirt_depth as i32 {
            palette.dirt
        } else {
            palette.stone
        };
        Node::new(content)
    }

    /// Surface heights of every column in `node_min..=node_max`, x fastest.
    ///
    /// Columns are sampled in parallel.
    pub fn height_map(&self, node_min: IVec3, node_max: IVec3) -> Vec<i32> {
        let width = (node_max.x - node_min.x + 1).max(0);
        let depth = (node_max.z - node_min.z + 1).max(0);
        (0..width * depth)
            .into_par_iter()
            .map(|i| self.height_at(node_min.x + i % width, node_min.z + i / width))
            .collect()
    }

    /// Fill `node_min..=node_max` of `buffer` with terrain.
    pub fn generate_into(
        &self,
        buffer: &mut VoxelBuffer,
        node_min: IVec3,
        node_max: IVec3,
        palette: &TerrainPalette,
    ) {
        buffer.add_area(&VoxelArea::new(node_min, node_max));
        let heights = self.height_map(node_min, node_max);
        let width = node_max.x - node_min.x + 1;

        for z in node_min.z..=node_max.z {
            for x in node_min.x..=node_max.x {
                let surface = heights[((z - node_min.z) * width + (x - node_min.x)) as usize];
                for y in node_min.y..=node_max.y {
                    buffer.set(IVec3::new(x, y, z), self.node_at_depth(y, surface, palette));
                }
            }
        }
    }
}
