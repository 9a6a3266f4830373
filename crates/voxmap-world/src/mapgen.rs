//! Mapchunk generators.
//!
//! A [`Mapgen`] fills the detached manipulator of a [`BlockMakeData`]. It
//! never sees the map, so chunks can be generated on any thread and merged
//! back by the owner with [`ServerMap::finish_block_make`].
//!
//! [`ServerMap::finish_block_make`]: crate::ServerMap::finish_block_make

use std::sync::Arc;

use glam::{DVec3, IVec3};
use rayon::prelude::*;
use tracing::{debug, trace_span};
use voxmap_core::{ContentId, LiquidType, NodeRegistry, Result};

use crate::config::WorldConfig;
use crate::dungeon::{DungeonGen, DungeonParams};
use crate::noise_params::{NoiseField, NoiseParams};
use crate::server_map::BlockMakeData;
use crate::terrain::{TerrainGenerator, TerrainPalette};
use crate::WorldSeed;

/// Fills a mapchunk.
pub trait Mapgen: Send + Sync {
    fn make_chunk(&self, data: &mut BlockMakeData);
}

/// Per-position seed derived from the world seed.
///
/// Mapchunks pass their minimum node position.
pub fn block_seed(p: IVec3, world_seed: WorldSeed) -> u64 {
    let offset = i64::from(p.z) * 38_134_234 + i64::from(p.y) * 42_123 + i64::from(p.x) * 23;
    world_seed.wrapping_add(offset as u64)
}

/// Generate several independent chunks in parallel.
pub fn make_chunks_parallel<M: Mapgen + ?Sized>(mapgen: &M, chunks: &mut [BlockMakeData]) {
    let _span = trace_span!("make_chunks_parallel", chunks = chunks.len()).entered();
    chunks.par_iter_mut().for_each(|data| mapgen.make_chunk(data));
}

/// Height field terrain with water, then dungeons.
#[derive(Debug, Clone)]
pub struct DefaultMapgen {
    seed: WorldSeed,
    registry: Arc<NodeRegistry>,
    terrain: TerrainGenerator,
    palette: TerrainPalette,
    dungeon_params: DungeonParams,
    dungeon_density: NoiseField,
    dungeons_per_chunk: Option<u32>,
}

impl DefaultMapgen {
    /// Number of dungeons per chunk, floored and clamped at zero.
    pub const NP_DUNGEONS: NoiseParams =
        NoiseParams::new(0.9, 0.5, DVec3::splat(500.0), 0, 2, 0.8, 2.0);

    pub fn new(config: &WorldConfig, registry: Arc<NodeRegistry>) -> Result<Self> {
        let palette = TerrainPalette::from_registry(&registry)?;
        let dungeon_params = DungeonParams {
            seed: config.seed,
            ..DungeonParams::from_registry(&registry)?
        };
        Ok(Self {
            seed: config.seed,
            terrain: TerrainGenerator::new(config.mapgen.terrain.clone(), config.seed),
            palette,
            dungeon_params,
            dungeon_density: Self::NP_DUNGEONS.field(config.seed),
            dungeons_per_chunk: config.mapgen.dungeons_per_chunk,
            registry,
        })
    }

    pub fn seed(&self) -> WorldSeed {
        self.seed
    }

    pub fn terrain(&self) -> &TerrainGenerator {
        &self.terrain
    }

    /// Dungeons to carve into the chunk starting at `node_min`.
    pub fn dungeon_count(&self, node_min: IVec3) -> u32 {
        if let Some(fixed) = self.dungeons_per_chunk {
            return fixed;
        }
        let density = self.dungeon_density.get_3d(
            f64::from(node_min.x),
            f64::from(node_min.y),
            f64::from(node_min.z),
        );
        density.floor().max(0.0) as u32
    }

    /// Queue water sources that touch open space so they start flowing.
    fn collect_liquids(&self, data: &mut BlockMakeData, node_min: IVec3, node_max: IVec3) {
        const OPEN_SIDES: [IVec3; 5] = [IVec3::X, IVec3::NEG_X, IVec3::Z, IVec3::NEG_Z, IVec3::NEG_Y];
        for z in node_min.z..=node_max.z {
            for y in node_min.y..=node_max.y {
                for x in node_min.x..=node_max.x {
                    let p = IVec3::new(x, y, z);
                    let content = data.vmanip.get(p).content;
                    if self.registry.get(content).liquid_type != LiquidType::Source {
                        continue;
                    }
                    let touches_air = OPEN_SIDES
                        .iter()
                        .any(|d| data.vmanip.get(p + *d).content == ContentId::AIR);
                    if touches_air {
                        data.transforming_liquid.push(p);
                    }
                }
            }
        }
    }
}

impl Mapgen for DefaultMapgen {
    fn make_chunk(&self, data: &mut BlockMakeData) {
        let node_min = data.node_min();
        let node_max = data.node_max();
        let _span = trace_span!("make_chunk", min = %data.blockpos_min, max = %data.blockpos_max).entered();

        self.terrain
            .generate_into(&mut data.vmanip, node_min, node_max, &self.palette);

        let num_dungeons = self.dungeon_count(node_min);
        let report = if num_dungeons > 0 {
            let params = DungeonParams {
                num_dungeons,
                ..self.dungeon_params.clone()
            };
            DungeonGen::new(&self.registry, params).generate(&mut data.vmanip, data.seed, node_min, node_max)
        } else {
            Default::default()
        };

        self.collect_liquids(data, node_min, node_max);
        debug!(
            min = %data.blockpos_min,
            dungeons = report.dungeons,
            rooms = report.rooms,
            liquids = data.transforming_liquid.len(),
            "Generated mapchunk"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxmap_core::{BlockPos, VoxelArea};

    fn mapgen(dungeons: Option<u32>) -> DefaultMapgen {
        let mut config = WorldConfig {
            seed: 4242,
            ..Default::default()
        };
        config.mapgen.dungeons_per_chunk = dungeons;
        DefaultMapgen::new(&config, Arc::new(NodeRegistry::with_defaults())).unwrap()
    }

    fn chunk_data(gen: &DefaultMapgen, min: BlockPos) -> BlockMakeData {
        let max = BlockPos::new(min.x + 4, min.y + 4, min.z + 4);
        BlockMakeData::new(min, max, min, block_seed(min.node_min(), gen.seed()), gen.registry.clone())
    }

    #[test]
    fn block_seed_varies_by_position() {
        let a = block_seed(IVec3::new(0, 0, 0), 7);
        assert_eq!(a, 7);
        assert_eq!(block_seed(IVec3::new(1, 2, 3), 7), block_seed(IVec3::new(1, 2, 3), 7));
        assert_ne!(block_seed(IVec3::new(1, 0, 0), 7), a);
        assert_ne!(block_seed(IVec3::new(0, 0, -1), 7), a);
        assert_eq!(block_seed(IVec3::new(-1, 0, 0), 0), (-23i64) as u64);
    }

    #[test]
    fn fixed_dungeon_count_overrides_noise() {
        assert_eq!(mapgen(Some(3)).dungeon_count(IVec3::splat(-32)), 3);
        let noisy = mapgen(None);
        for i in 0..20 {
            // Offset 0.9 with scale 0.5 keeps the density below 2
            assert!(noisy.dungeon_count(IVec3::new(i * 80, -32, -i * 80)) <= 1);
        }
    }

    #[test]
    fn chunk_is_fully_generated_and_deterministic() {
        let gen = mapgen(Some(1));
        let min = BlockPos::new(-2, -2, -2);
        let mut a = chunk_data(&gen, min);
        let mut b = chunk_data(&gen, min);
        gen.make_chunk(&mut a);
        gen.make_chunk(&mut b);

        let chunk = VoxelArea::new(a.node_min(), a.node_max());
        assert!(chunk.iter().all(|p| !a.vmanip.get(p).is_ignore()));
        assert!(a.vmanip.nodes() == b.vmanip.nodes());
        assert_eq!(a.transforming_liquid, b.transforming_liquid);
    }

    #[test]
    fn no_dungeons_means_no_cobble() {
        let gen = mapgen(Some(0));
        let cobble = gen.registry.require("default:cobble").unwrap();
        let mut data = chunk_data(&gen, BlockPos::new(-2, -2, -2));
        gen.make_chunk(&mut data);
        assert!(data.vmanip.iter().all(|(_, n)| n.content != cobble));
    }

    #[test]
    fn parallel_generation_matches_sequential() {
        let gen = mapgen(Some(1));
        let mins = [
            BlockPos::new(-2, -2, -2),
            BlockPos::new(3, -2, -2),
            BlockPos::new(-2, -2, 3),
        ];
        let mut parallel: Vec<_> = mins.iter().map(|m| chunk_data(&gen, *m)).collect();
        make_chunks_parallel(&gen, &mut parallel);

        for data in &parallel {
            let mut sequential = chunk_data(&gen, data.blockpos_min);
            gen.make_chunk(&mut sequential);
            assert!(sequential.vmanip.nodes() == data.vmanip.nodes());
        }
    }
}
