//! The server side of the map: emerge and liquid queues plus mapchunk
//! generation on top of a shared [`Map`].

use std::collections::BTreeSet;
use std::sync::Arc;

use glam::IVec3;
use hashbrown::HashSet;
use parking_lot::{MappedMutexGuard, MutexGuard};
use tracing::{debug, info, trace_span, warn};
use voxmap_core::constants::{BLOCK_SIZE, MAX_MAP_GENERATION_LIMIT};
use voxmap_core::{BlockPos, NodeRegistry, Result, UniqueQueue, VoxelArea};

use crate::block::{MapBlock, ModifiedState};
use crate::config::WorldConfig;
use crate::database::MapDatabase;
use crate::event::MapEditEvent;
use crate::liquid::{LiquidQueue, LiquidReport};
use crate::map::{Map, MapHandle, SaveReport, SweepReport};
use crate::mapgen::{block_seed, Mapgen};
use crate::vmanip::{Attached, Detached, VoxelManip};

/// Everything a [`Mapgen`] needs to fill one mapchunk.
#[derive(Debug)]
pub struct BlockMakeData {
    /// The chunk plus a one-block border.
    pub vmanip: VoxelManip<Detached>,
    pub blockpos_min: BlockPos,
    pub blockpos_max: BlockPos,
    /// Block whose emerge request started the generation.
    pub blockpos_requested: BlockPos,
    pub seed: u64,
    pub registry: Arc<NodeRegistry>,
    /// Liquid cells the generator wants simulated after the merge.
    pub transforming_liquid: Vec<IVec3>,
}

impl BlockMakeData {
    /// Make data over an ignore-filled buffer covering the chunk and its
    /// border.
    pub fn new(
        blockpos_min: BlockPos,
        blockpos_max: BlockPos,
        blockpos_requested: BlockPos,
        seed: u64,
        registry: Arc<NodeRegistry>,
    ) -> Self {
        let mut vmanip = VoxelManip::<Detached>::new();
        let (border_min, border_max) = with_border(blockpos_min, blockpos_max);
        vmanip.add_area(&VoxelArea::from_blocks(border_min, border_max));
        Self {
            vmanip,
            blockpos_min,
            blockpos_max,
            blockpos_requested,
            seed,
            registry,
            transforming_liquid: Vec::new(),
        }
    }

    pub fn node_min(&self) -> IVec3 {
        self.blockpos_min.node_min()
    }

    pub fn node_max(&self) -> IVec3 {
        self.blockpos_max.node_max()
    }
}

fn with_border(min: BlockPos, max: BlockPos) -> (BlockPos, BlockPos) {
    (
        BlockPos::from(min.to_ivec3() - IVec3::ONE),
        BlockPos::from(max.to_ivec3() + IVec3::ONE),
    )
}

fn blocks_between(min: BlockPos, max: BlockPos) -> impl Iterator<Item = BlockPos> {
    (min.z..=max.z).flat_map(move |z| {
        (min.y..=max.y).flat_map(move |y| (min.x..=max.x).map(move |x| BlockPos::new(x, y, z)))
    })
}

/// Result of asking for a block that may not be loaded yet.
pub enum EmergeStatus<'a> {
    /// The block is in memory; the map stays locked while this is held.
    Loaded(MappedMutexGuard<'a, MapBlock>),
    /// Queued for loading or generation.
    Pending,
    /// Beyond the generation limit; never queued.
    OutOfBounds,
}

impl std::fmt::Debug for EmergeStatus<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loaded(block) => f.debug_tuple("Loaded").field(&block.pos()).finish(),
            Self::Pending => f.write_str("Pending"),
            Self::OutOfBounds => f.write_str("OutOfBounds"),
        }
    }
}

/// Persistent map with emerge queue, liquid queue and chunk generation.
pub struct ServerMap {
    map: MapHandle,
    registry: Arc<NodeRegistry>,
    config: WorldConfig,
    emerge_queue: UniqueQueue<BlockPos>,
    liquid: LiquidQueue,
    /// Minimum block of every chunk handed out by `init_block_make`.
    chunks_in_progress: HashSet<BlockPos>,
    /// Emerge requests dropped because their chunk crosses the generation limit.
    failed_emerges: usize,
}

impl ServerMap {
    pub fn new(config: WorldConfig, registry: Arc<NodeRegistry>, database: Box<dyn MapDatabase>) -> Self {
        let map = Map::with_database(config.map.clone(), database);
        info!(
            seed = config.seed,
            chunk_size = config.mapgen.chunk_size,
            mapgen_limit = config.mapgen.mapgen_limit,
            "Created server map"
        );
        Self {
            map: MapHandle::new(map),
            registry,
            liquid: LiquidQueue::new(config.liquid.clone()),
            config,
            emerge_queue: UniqueQueue::new(),
            chunks_in_progress: HashSet::new(),
            failed_emerges: 0,
        }
    }

    pub fn map(&self) -> &MapHandle {
        &self.map
    }

    /// Lock the underlying map.
    pub fn lock(&self) -> MutexGuard<'_, Map> {
        self.map.lock()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Whether any node of the block lies beyond the generation limit.
    pub fn blockpos_over_mapgen_limit(&self, pos: BlockPos) -> bool {
        let limit = self.config.mapgen.mapgen_limit.clamp(0, MAX_MAP_GENERATION_LIMIT);
        let limit_bp = limit / BLOCK_SIZE;
        let over = |v: i32| v < -limit_bp || v > limit_bp;
        over(pos.x) || over(pos.y) || over(pos.z)
    }

    /// Block range of the mapchunk containing `pos`.
    ///
    /// Chunks are aligned so that the one at the origin is centered on
    /// block (0, 0, 0).
    pub fn chunk_bounds(&self, pos: BlockPos) -> (BlockPos, BlockPos) {
        let size = self.config.mapgen.chunk_size.max(1);
        let offset = -size / 2;
        let align = |v: i32| (v - offset).div_euclid(size) * size + offset;
        let min = BlockPos::new(align(pos.x), align(pos.y), align(pos.z));
        let max = BlockPos::new(min.x + size - 1, min.y + size - 1, min.z + size - 1);
        (min, max)
    }

    /// Return the block if loaded, otherwise queue it for emerging.
    pub fn get_block_or_emerge(&mut self, pos: BlockPos) -> EmergeStatus<'_> {
        if self.blockpos_over_mapgen_limit(pos) {
            return EmergeStatus::OutOfBounds;
        }
        let guard = self.map.lock();
        match MutexGuard::try_map(guard, |map| map.get_block_mut(pos)) {
            Ok(block) => EmergeStatus::Loaded(block),
            Err(_guard) => {
                self.emerge_queue.push_back(pos);
                EmergeStatus::Pending
            }
        }
    }

    pub fn is_block_in_queue(&self, pos: BlockPos) -> bool {
        self.emerge_queue.contains(&pos)
    }

    pub fn emerge_queue_len(&self) -> usize {
        self.emerge_queue.len()
    }

    /// Take the oldest emerge request, e.g. to hand it to a worker.
    pub fn pop_emerge_request(&mut self) -> Option<BlockPos> {
        self.emerge_queue.pop_front()
    }

    /// Emerge requests dropped so far because their chunk crosses the
    /// generation limit.
    pub fn failed_emerge_count(&self) -> usize {
        self.failed_emerges
    }

    /// Every block that can be emerged without generating.
    pub fn list_all_loadable_blocks(&self) -> Result<Vec<BlockPos>> {
        self.map.lock().list_all_loadable_blocks()
    }

    pub fn list_all_loaded_blocks(&self) -> Vec<BlockPos> {
        let mut positions = self.map.lock().loaded_blocks();
        positions.sort_unstable();
        positions
    }

    pub fn is_chunk_in_progress(&self, pos: BlockPos) -> bool {
        self.chunks_in_progress.contains(&self.chunk_bounds(pos).0)
    }

    /// Prepare generation of the mapchunk containing `blockpos`.
    ///
    /// Creates placeholder blocks for the chunk (pinned until the matching
    /// `finish_block_make`) and copies the chunk plus a one-block border
    /// into a detached manipulator. Returns `None` if the chunk crosses the
    /// generation limit or is already being generated.
    pub fn init_block_make(&mut self, blockpos: BlockPos) -> Option<BlockMakeData> {
        let (bpmin, bpmax) = self.chunk_bounds(blockpos);
        if self.blockpos_over_mapgen_limit(bpmin) || self.blockpos_over_mapgen_limit(bpmax) {
            debug!(%blockpos, "Chunk crosses the generation limit");
            return None;
        }
        if !self.chunks_in_progress.insert(bpmin) {
            return None;
        }
        let _span = trace_span!("init_block_make", %bpmin).entered();

        {
            let mut map = self.map.lock();
            for bpos in blocks_between(bpmin, bpmax) {
                if let Some(block) = map.emerge_block(bpos, true) {
                    block.ref_grab();
                }
            }
        }

        let (border_min, border_max) = with_border(bpmin, bpmax);
        let mut vmanip = VoxelManip::<Attached>::new(self.map.clone());
        vmanip.initial_emerge(border_min, border_max, false);

        Some(BlockMakeData {
            vmanip: vmanip.detach(),
            blockpos_min: bpmin,
            blockpos_max: bpmax,
            blockpos_requested: blockpos,
            seed: block_seed(bpmin.node_min(), self.config.seed),
            registry: Arc::clone(&self.registry),
            transforming_liquid: Vec::new(),
        })
    }

    /// Merge a generated chunk back and release it.
    ///
    /// Returns every block the merge changed plus the chunk's own blocks,
    /// which are now marked generated.
    pub fn finish_block_make(&mut self, data: BlockMakeData) -> BTreeSet<BlockPos> {
        let BlockMakeData {
            vmanip,
            blockpos_min,
            blockpos_max,
            transforming_liquid,
            ..
        } = data;
        let _span = trace_span!("finish_block_make", min = %blockpos_min).entered();

        let mut modified = BTreeSet::new();
        vmanip.reparent(self.map.clone()).blit_back_all(&mut modified, true);

        {
            let mut map = self.map.lock();
            for bpos in blocks_between(blockpos_min, blockpos_max) {
                if let Some(block) = map.get_block_mut(bpos) {
                    block.set_generated(true);
                    block.ref_drop();
                    modified.insert(bpos);
                }
            }
            map.dispatch_event(&MapEditEvent::other(modified.clone()));
        }

        for pos in transforming_liquid {
            self.liquid.push(pos);
        }
        self.chunks_in_progress.remove(&blockpos_min);
        debug!(min = %blockpos_min, blocks = modified.len(), "Finished mapchunk");
        modified
    }

    /// Serve up to `max` emerge requests, loading stored blocks or
    /// generating their chunks. Returns the positions served.
    pub fn process_emerge_queue(&mut self, max: usize, mapgen: &dyn Mapgen) -> Vec<BlockPos> {
        let _span = trace_span!("process_emerge_queue", queued = self.emerge_queue.len()).entered();
        let mut served = Vec::new();
        while served.len() < max {
            let Some(pos) = self.emerge_queue.pop_front() else {
                break;
            };
            let ready = self
                .map
                .lock()
                .emerge_block(pos, false)
                .is_some_and(|block| block.is_generated());
            if !ready {
                if self.is_chunk_in_progress(pos) {
                    debug!(%pos, "Chunk already being generated");
                    continue;
                }
                let Some(mut data) = self.init_block_make(pos) else {
                    self.failed_emerges += 1;
                    debug!(%pos, "Emerge request dropped; its chunk crosses the generation limit");
                    continue;
                };
                mapgen.make_chunk(&mut data);
                self.finish_block_make(data);
            }
            served.push(pos);
        }
        served
    }

    /// Schedule a liquid cell for recomputation.
    pub fn transforming_liquid_add(&mut self, pos: IVec3) -> bool {
        self.liquid.push(pos)
    }

    pub fn transforming_liquid_len(&self) -> usize {
        self.liquid.len()
    }

    /// Run one liquid pass; changed blocks are added to `modified` and
    /// reported through an `Other` edit event.
    pub fn transform_liquids(&mut self, dt: f32, modified: &mut BTreeSet<BlockPos>) -> LiquidReport {
        let mut map = self.map.lock();
        let mut changed = BTreeSet::new();
        let report = self.liquid.transform(&mut map, &self.registry, dt, &mut changed);
        if !changed.is_empty() {
            map.dispatch_event(&MapEditEvent::other(changed.clone()));
            modified.extend(changed);
        }
        report
    }

    /// Unload sweep using the configured timeout and block budget.
    pub fn timer_update(&mut self, dt: f32, unloaded: &mut Vec<BlockPos>) -> SweepReport {
        let map_config = &self.config.map;
        self.map
            .lock()
            .timer_update(dt, map_config.unload_timeout, map_config.max_loaded_blocks, unloaded)
    }

    /// Save every block modified at least to `level`.
    pub fn save(&self, level: ModifiedState) -> SaveReport {
        let report = self.map.lock().save(level);
        if report.failed > 0 {
            warn!(failed = report.failed, "Some blocks could not be saved");
        }
        report
    }
}
