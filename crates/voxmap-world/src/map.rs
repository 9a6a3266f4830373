//! The block index: sectors, the sector cache, edit listeners and the
//! unload sweep.
//!
//! A [`Map`] owns every loaded [`MapBlock`]. With a [`MapDatabase`] attached
//! it also persists blocks; without one it behaves like a client-side index
//! that simply drops unloaded blocks.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;

use glam::IVec3;
use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, trace_span, warn};
use voxmap_core::{BlockPos, Error, LocalPos, Node, Result, SectorPos, VoxelArea};

use crate::block::{MapBlock, ModifiedState, NodeMetadata, NodeTimer};
use crate::config::MapConfig;
use crate::database::MapDatabase;
use crate::event::{MapEditEvent, MapEventReceiver, ReceiverId};
use crate::sector::{MapSector, SectorCache};
use crate::serialize::{deserialize_block, serialize_block};

/// Outcome of an unload sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Blocks removed from memory.
    pub unloaded: usize,
    /// Blocks written to the database on the way out.
    pub saved: usize,
    /// Blocks whose save failed; they were evicted anyway.
    pub failed_saves: usize,
    /// Blocks still loaded after the sweep.
    pub remaining: usize,
}

/// Outcome of a save pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub saved: usize,
    pub failed: usize,
    /// Previously failed blobs written successfully this time.
    pub retried: usize,
}

/// What external consumers (e.g. a renderer) need to know about a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockState {
    pub pos: BlockPos,
    pub dirty: bool,
    pub modified: ModifiedState,
}

/// Index of all loaded blocks, grouped into sectors.
pub struct Map {
    /// Sector storage, kept dense with `swap_remove`.
    sectors: Vec<MapSector>,
    sector_index: HashMap<SectorPos, usize>,
    sector_cache: SectorCache,
    block_count: usize,
    receivers: Vec<(ReceiverId, Box<dyn MapEventReceiver + Send>)>,
    next_receiver_id: u64,
    database: Option<Box<dyn MapDatabase>>,
    /// Encoded blocks whose save failed, oldest first.
    pending_saves: VecDeque<(BlockPos, Vec<u8>)>,
    config: MapConfig,
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("sectors", &self.sectors.len())
            .field("blocks", &self.block_count)
            .field("receivers", &self.receivers.len())
            .field("has_database", &self.database.is_some())
            .field("pending_saves", &self.pending_saves.len())
            .finish_non_exhaustive()
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new(MapConfig::default())
    }
}

impl Map {
    /// Create an empty map without persistence.
    pub fn new(config: MapConfig) -> Self {
        Self {
            sectors: Vec::new(),
            sector_index: HashMap::new(),
            sector_cache: SectorCache::new(config.sector_cache_capacity),
            block_count: 0,
            receivers: Vec::new(),
            next_receiver_id: 0,
            database: None,
            pending_saves: VecDeque::new(),
            config,
        }
    }

    /// Create an empty map that persists blocks to `database`.
    pub fn with_database(config: MapConfig, database: Box<dyn MapDatabase>) -> Self {
        let mut map = Self::new(config);
        map.database = Some(database);
        map
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    /// Whether blocks are persisted at all.
    pub fn may_save_blocks(&self) -> bool {
        self.database.is_some()
    }

    // ---- Sectors ----

    fn sector_slot(&self, pos: SectorPos) -> Option<usize> {
        if let Some(slot) = self.sector_cache.lookup(pos) {
            return Some(slot);
        }
        let slot = *self.sector_index.get(&pos)?;
        self.sector_cache.insert(pos, slot);
        Some(slot)
    }

    fn ensure_sector(&mut self, pos: SectorPos) -> usize {
        if let Some(slot) = self.sector_slot(pos) {
            return slot;
        }
        let slot = self.sectors.len();
        self.sectors.push(MapSector::new(pos));
        self.sector_index.insert(pos, slot);
        self.sector_cache.insert(pos, slot);
        slot
    }

    /// Remove the sector in `slot`. The last sector moves into the hole, so
    /// both positions are dropped from the cache here.
    fn remove_sector_slot(&mut self, slot: usize) -> MapSector {
        let sector = self.sectors.swap_remove(slot);
        self.sector_index.remove(&sector.pos());
        self.sector_cache.invalidate(sector.pos());
        if let Some(moved) = self.sectors.get(slot) {
            let moved_pos = moved.pos();
            self.sector_index.insert(moved_pos, slot);
            self.sector_cache.invalidate(moved_pos);
        }
        self.block_count -= sector.len();
        sector
    }

    pub fn get_sector(&self, pos: SectorPos) -> Option<&MapSector> {
        self.sector_slot(pos).map(|slot| &self.sectors[slot])
    }

    pub fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    /// Whether the sector cache currently names `pos`.
    pub fn sector_cached(&self, pos: SectorPos) -> bool {
        self.sector_cache.contains(pos)
    }

    /// Remove sectors and every block they hold, without saving.
    ///
    /// Returns the number of blocks dropped.
    pub fn delete_sectors(&mut self, positions: &[SectorPos]) -> usize {
        let mut dropped = 0;
        for pos in positions {
            if let Some(&slot) = self.sector_index.get(pos) {
                dropped += self.remove_sector_slot(slot).len();
            }
        }
        if dropped > 0 {
            debug!(sectors = positions.len(), blocks = dropped, "Deleted sectors");
        }
        dropped
    }

    // ---- Blocks ----

    /// Loaded block at `pos`. Never loads or generates.
    pub fn get_block(&self, pos: BlockPos) -> Option<&MapBlock> {
        let slot = self.sector_slot(pos.sector())?;
        self.sectors[slot].get_block(pos.y)
    }

    pub fn get_block_mut(&mut self, pos: BlockPos) -> Option<&mut MapBlock> {
        let slot = self.sector_slot(pos.sector())?;
        self.sectors[slot].get_block_mut(pos.y)
    }

    /// Insert a block; fails if one is already loaded at its position.
    pub fn insert_block(&mut self, block: MapBlock) -> Result<&mut MapBlock> {
        let pos = block.pos();
        if self.get_block(pos).is_some() {
            return Err(Error::InvalidData(format!("block {pos} is already loaded")));
        }
        let slot = self.ensure_sector(pos.sector());
        let inserted = self.sectors[slot].insert_block(block);
        if inserted.is_ok() {
            self.block_count += 1;
        }
        inserted
    }

    /// Loaded block at `pos`, creating an ignore-filled placeholder if absent.
    pub fn create_blank_block(&mut self, pos: BlockPos) -> &mut MapBlock {
        let slot = self.ensure_sector(pos.sector());
        if self.sectors[slot].get_block(pos.y).is_none() {
            self.block_count += 1;
        }
        self.sectors[slot].block_or_blank(pos.y)
    }

    /// Remove a block from memory without saving it.
    pub fn remove_block(&mut self, pos: BlockPos) -> Result<MapBlock> {
        let not_found = || Error::NotFound(format!("block {pos}"));
        let slot = self.sector_slot(pos.sector()).ok_or_else(not_found)?;
        let block = self.sectors[slot].remove_block(pos.y).ok_or_else(not_found)?;
        self.block_count -= 1;
        if self.sectors[slot].is_empty() {
            self.remove_sector_slot(slot);
        }
        Ok(block)
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Positions of every loaded block.
    pub fn loaded_blocks(&self) -> Vec<BlockPos> {
        self.sectors
            .iter()
            .flat_map(MapSector::blocks)
            .map(MapBlock::pos)
            .collect()
    }

    /// Position, dirty flag and modified state of every loaded block.
    pub fn block_states(&self) -> Vec<BlockState> {
        self.sectors
            .iter()
            .flat_map(MapSector::blocks)
            .map(|b| BlockState {
                pos: b.pos(),
                dirty: b.is_dirty(),
                modified: b.modified(),
            })
            .collect()
    }

    // ---- Nodes ----

    /// Node at `pos`, or `None` if its block is not loaded.
    pub fn get_node(&self, pos: IVec3) -> Option<Node> {
        self.get_block(BlockPos::containing(pos))
            .map(|b| b.get_node(LocalPos::of_node(pos)))
    }

    /// Node at `pos`, or the ignore sentinel if its block is not loaded.
    pub fn get_node_or_ignore(&self, pos: IVec3) -> Node {
        self.get_node(pos).unwrap_or(Node::IGNORE)
    }

    /// Write a node. Fails with `InvalidPosition` if its block is not loaded.
    pub fn set_node(&mut self, pos: IVec3, node: Node) -> Result<()> {
        self.block_for_node(pos)?
            .set_node(LocalPos::of_node(pos), node);
        Ok(())
    }

    fn block_for_node(&mut self, pos: IVec3) -> Result<&mut MapBlock> {
        self.get_block_mut(BlockPos::containing(pos))
            .ok_or(Error::InvalidPosition(pos))
    }

    /// Place a node, dropping any metadata and timer at `pos`, and notify
    /// listeners.
    pub fn add_node_with_event(&mut self, pos: IVec3, node: Node) -> Result<()> {
        let block = self.block_for_node(pos)?;
        let local = LocalPos::of_node(pos);
        block.set_node(local, node);
        block.remove_metadata(local);
        block.remove_timer(local);
        self.dispatch_event(&MapEditEvent::add_node(pos, node));
        Ok(())
    }

    /// Replace a node with air and notify listeners.
    pub fn remove_node_with_event(&mut self, pos: IVec3) -> Result<()> {
        let block = self.block_for_node(pos)?;
        let local = LocalPos::of_node(pos);
        block.set_node(local, Node::AIR);
        block.remove_metadata(local);
        block.remove_timer(local);
        self.dispatch_event(&MapEditEvent::remove_node(pos));
        Ok(())
    }

    /// Replace a node, keeping its metadata, and notify listeners.
    pub fn swap_node_with_event(&mut self, pos: IVec3, node: Node) -> Result<()> {
        self.set_node(pos, node)?;
        self.dispatch_event(&MapEditEvent::swap_node(pos, node));
        Ok(())
    }

    pub fn set_node_metadata_with_event(&mut self, pos: IVec3, meta: NodeMetadata) -> Result<()> {
        self.set_node_metadata(pos, meta)?;
        self.dispatch_event(&MapEditEvent::metadata_changed(pos));
        Ok(())
    }

    pub fn get_node_metadata(&self, pos: IVec3) -> Option<&NodeMetadata> {
        self.get_block(BlockPos::containing(pos))?
            .metadata(LocalPos::of_node(pos))
    }

    pub fn set_node_metadata(&mut self, pos: IVec3, meta: NodeMetadata) -> Result<()> {
        self.block_for_node(pos)?
            .set_metadata(LocalPos::of_node(pos), meta);
        Ok(())
    }

    pub fn remove_node_metadata(&mut self, pos: IVec3) -> Option<NodeMetadata> {
        self.get_block_mut(BlockPos::containing(pos))?
            .remove_metadata(LocalPos::of_node(pos))
    }

    /// Positions inside `p1..=p2` (loaded blocks only) carrying metadata.
    pub fn find_nodes_with_metadata(&self, p1: IVec3, p2: IVec3) -> Vec<IVec3> {
        let area = VoxelArea::new(p1, p2);
        let mut found = Vec::new();
        for bpos in area.blocks() {
            let Some(block) = self.get_block(bpos) else {
                continue;
            };
            found.extend(
                block
                    .metadata_entries()
                    .map(|(i, _)| bpos.node_at(LocalPos::from_index(usize::from(i))))
                    .filter(|p| area.contains(*p)),
            );
        }
        found
    }

    pub fn get_node_timer(&self, pos: IVec3) -> Option<NodeTimer> {
        self.get_block(BlockPos::containing(pos))?
            .timer(LocalPos::of_node(pos))
    }

    pub fn set_node_timer(&mut self, pos: IVec3, timer: NodeTimer) -> Result<()> {
        self.block_for_node(pos)?
            .set_timer(LocalPos::of_node(pos), timer);
        Ok(())
    }

    pub fn remove_node_timer(&mut self, pos: IVec3) -> Option<NodeTimer> {
        self.get_block_mut(BlockPos::containing(pos))?
            .remove_timer(LocalPos::of_node(pos))
    }

    /// Visit every node of the box `min..=max`.
    ///
    /// Blocks are visited z, then x, then y innermost so consecutive blocks
    /// share a sector; nodes inside a block go z, y, x. Nodes of blocks that
    /// are not loaded are reported as ignore. Returning `Break` from the
    /// visitor stops the walk immediately.
    pub fn for_each_node_in_area<F>(&self, min: IVec3, max: IVec3, mut visitor: F) -> ControlFlow<()>
    where
        F: FnMut(IVec3, Node) -> ControlFlow<()>,
    {
        let area = VoxelArea::new(min, max);
        let bmin = BlockPos::containing(area.min);
        let bmax = BlockPos::containing(area.max);

        for bz in bmin.z..=bmax.z {
            for bx in bmin.x..=bmax.x {
                let slot = self.sector_slot(SectorPos::new(bx, bz));
                for by in bmin.y..=bmax.y {
                    let bpos = BlockPos::new(bx, by, bz);
                    let block = slot.and_then(|s| self.sectors[s].get_block(by));
                    let clipped = area.intersection(&VoxelArea::of_block(bpos));
                    for p in clipped.iter() {
                        let node = block.map_or(Node::IGNORE, |b| b.get_node(LocalPos::of_node(p)));
                        if visitor(p, node).is_break() {
                            return ControlFlow::Break(());
                        }
                    }
                }
            }
        }
        ControlFlow::Continue(())
    }

    // ---- Events ----

    /// Register a listener; listeners are called in registration order.
    pub fn add_event_receiver(&mut self, receiver: Box<dyn MapEventReceiver + Send>) -> ReceiverId {
        let id = ReceiverId(self.next_receiver_id);
        self.next_receiver_id += 1;
        self.receivers.push((id, receiver));
        id
    }

    /// Unregister a listener; returns false if it was not registered.
    pub fn remove_event_receiver(&mut self, id: ReceiverId) -> bool {
        let before = self.receivers.len();
        self.receivers.retain(|(rid, _)| *rid != id);
        self.receivers.len() != before
    }

    pub fn dispatch_event(&mut self, event: &MapEditEvent) {
        for (_, receiver) in &mut self.receivers {
            receiver.on_map_edit_event(event);
        }
    }

    // ---- Unloading ----

    /// Age every block by `dt` and unload what is no longer needed.
    ///
    /// Blocks idle longer than `idle_timeout` are unloaded; if more than
    /// `max_loaded_blocks` remain, the longest idle ones follow. Referenced
    /// blocks are never touched and their timers restart. Modified blocks
    /// are saved first; a failed save is counted and the block is evicted
    /// regardless, its blob kept for retry.
    pub fn timer_update(
        &mut self,
        dt: f32,
        idle_timeout: f32,
        max_loaded_blocks: Option<usize>,
        unloaded: &mut Vec<BlockPos>,
    ) -> SweepReport {
        let _span = trace_span!("timer_update", blocks = self.block_count).entered();

        let mut idle = Vec::new();
        let mut candidates = Vec::new();
        for sector in &mut self.sectors {
            for block in sector.blocks_mut() {
                block.increment_usage_timer(dt);
                if block.refcount() > 0 {
                    block.reset_usage_timer();
                } else if block.usage_timer() > idle_timeout {
                    idle.push(block.pos());
                } else {
                    candidates.push((block.usage_timer(), block.pos()));
                }
            }
        }

        let over_budget = max_loaded_blocks.is_some_and(|max| self.block_count - idle.len() > max);
        let mut report = SweepReport::default();
        if idle.is_empty() && !over_budget {
            report.remaining = self.block_count;
            return report;
        }

        self.begin_save();
        for pos in idle {
            self.unload_block(pos, &mut report, unloaded);
        }
        if let Some(max) = max_loaded_blocks.filter(|_| over_budget) {
            candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
            for (_, pos) in candidates {
                if self.block_count <= max {
                    break;
                }
                self.unload_block(pos, &mut report, unloaded);
            }
            if self.block_count > max {
                debug!(
                    loaded = self.block_count,
                    max, "Block budget exceeded by referenced blocks"
                );
            }
        }
        self.end_save();

        report.remaining = self.block_count;
        debug!(
            unloaded = report.unloaded,
            saved = report.saved,
            failed_saves = report.failed_saves,
            remaining = report.remaining,
            "Unload sweep"
        );
        report
    }

    /// Unload every block with a zero reference count.
    pub fn unload_unreferenced_blocks(&mut self, unloaded: &mut Vec<BlockPos>) -> SweepReport {
        let positions: Vec<_> = self
            .sectors
            .iter()
            .flat_map(MapSector::blocks)
            .filter(|b| b.refcount() == 0)
            .map(MapBlock::pos)
            .collect();

        let mut report = SweepReport::default();
        self.begin_save();
        for pos in positions {
            self.unload_block(pos, &mut report, unloaded);
        }
        self.end_save();
        report.remaining = self.block_count;
        report
    }

    fn unload_block(&mut self, pos: BlockPos, report: &mut SweepReport, unloaded: &mut Vec<BlockPos>) {
        let Ok(block) = self.remove_block(pos) else {
            return;
        };
        if self.database.is_some() && block.modified() >= ModifiedState::WriteAtUnload {
            match serialize_block(&block, self.config.compression_level) {
                Ok(blob) => {
                    if self.write_blob(pos, blob, true) {
                        report.saved += 1;
                    } else {
                        report.failed_saves += 1;
                    }
                }
                Err(e) => {
                    error!(%pos, error = %e, "Failed to encode block; its changes are lost");
                    report.failed_saves += 1;
                }
            }
        }
        report.unloaded += 1;
        unloaded.push(pos);
    }

    // ---- Persistence ----

    fn begin_save(&mut self) {
        if let Some(db) = self.database.as_mut() {
            db.begin_save();
        }
    }

    fn end_save(&mut self) {
        if let Some(db) = self.database.as_mut() {
            db.end_save();
        }
    }

    /// Write a blob; on failure optionally keep it for a later retry.
    fn write_blob(&mut self, pos: BlockPos, blob: Vec<u8>, keep_on_failure: bool) -> bool {
        if !pos.is_key_representable() {
            error!(%pos, "Block is outside the storable range; its changes are lost");
            return false;
        }
        let Some(db) = self.database.as_mut() else {
            return false;
        };
        match db.save_block(pos, &blob) {
            Ok(()) => {
                self.forget_pending(pos);
                true
            }
            Err(e) => {
                error!(%pos, error = %e, "Failed to save block");
                if keep_on_failure {
                    self.keep_pending(pos, blob);
                }
                false
            }
        }
    }

    fn keep_pending(&mut self, pos: BlockPos, blob: Vec<u8>) {
        self.pending_saves.retain(|(p, _)| *p != pos);
        self.pending_saves.push_back((pos, blob));
        while self.pending_saves.len() > self.config.max_pending_saves {
            if let Some((dropped, _)) = self.pending_saves.pop_front() {
                error!(pos = %dropped, "Retry buffer full; dropping unsaved block");
            }
        }
    }

    /// Drop the retry copy of `pos`; a newer version reached the database.
    fn forget_pending(&mut self, pos: BlockPos) {
        self.pending_saves.retain(|(p, _)| *p != pos);
    }

    /// Number of blobs waiting for a successful save.
    pub fn pending_save_count(&self) -> usize {
        self.pending_saves.len()
    }

    /// Retry every blob in the retry buffer. Returns (written, still failing).
    fn retry_pending_saves(&mut self) -> (usize, usize) {
        let Some(db) = self.database.as_mut() else {
            return (0, 0);
        };
        let mut written = 0;
        let mut failed = 0;
        for (pos, blob) in std::mem::take(&mut self.pending_saves) {
            match db.save_block(pos, &blob) {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!(%pos, error = %e, "Retrying block save failed");
                    self.pending_saves.push_back((pos, blob));
                    failed += 1;
                }
            }
        }
        (written, failed)
    }

    /// Encode and store one loaded block.
    ///
    /// Returns `Ok(false)` when no database is attached. The modified state
    /// is cleared only after the database accepted the write.
    pub fn save_block(&mut self, pos: BlockPos) -> Result<bool> {
        if self.database.is_none() {
            return Ok(false);
        }
        let block = self
            .get_block(pos)
            .ok_or_else(|| Error::NotFound(format!("block {pos}")))?;
        if !pos.is_key_representable() {
            return Err(Error::InvalidPosition(pos.node_min()));
        }
        let blob = serialize_block(block, self.config.compression_level)?;
        let Some(db) = self.database.as_mut() else {
            return Ok(false);
        };
        db.save_block(pos, &blob)
            .map_err(|e| Error::Persistence(format!("saving block {pos}: {e}")))?;
        self.forget_pending(pos);
        if let Some(block) = self.get_block_mut(pos) {
            block.reset_modified();
        }
        Ok(true)
    }

    /// Save every block whose modified state is at least `level`, after
    /// retrying previously failed saves.
    pub fn save(&mut self, level: ModifiedState) -> SaveReport {
        let mut report = SaveReport::default();
        if self.database.is_none() {
            return report;
        }
        let _span = trace_span!("save", blocks = self.block_count).entered();

        self.begin_save();
        let (retried, still_failing) = self.retry_pending_saves();
        report.retried = retried;
        report.failed = still_failing;

        let positions: Vec<_> = self
            .sectors
            .iter()
            .flat_map(MapSector::blocks)
            .filter(|b| b.modified() >= level)
            .map(MapBlock::pos)
            .collect();
        for pos in positions {
            match self.save_block(pos) {
                Ok(true) => report.saved += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(%pos, error = %e, "Block save failed");
                    report.failed += 1;
                }
            }
        }
        self.end_save();

        if report.saved + report.retried > 0 {
            debug!(
                saved = report.saved,
                retried = report.retried,
                failed = report.failed,
                "Saved map"
            );
        }
        report
    }

    /// Load a block from the retry buffer or the database.
    ///
    /// An already loaded block is returned as is. `Ok(None)` means there is
    /// no stored copy. A copy taken from the retry buffer leaves the buffer
    /// and comes back as `WriteNeeded`, so the loaded block is the only
    /// unsaved version.
    pub fn load_block(&mut self, pos: BlockPos) -> Result<Option<&mut MapBlock>> {
        if self.get_block(pos).is_some() {
            return Ok(self.get_block_mut(pos));
        }
        if let Some(index) = self.pending_saves.iter().position(|(p, _)| *p == pos) {
            let block = deserialize_block(pos, &self.pending_saves[index].1)?;
            self.pending_saves.remove(index);
            let block = self.insert_block(block)?;
            block.raise_modified(ModifiedState::WriteNeeded, "restored unsaved copy");
            return Ok(Some(block));
        }
        if !pos.is_key_representable() {
            return Ok(None);
        }
        let blob = match self.database.as_mut() {
            Some(db) => db.load_block(pos)?,
            None => None,
        };
        let Some(blob) = blob else {
            return Ok(None);
        };
        let block = deserialize_block(pos, &blob)?;
        self.insert_block(block).map(Some)
    }

    /// Remove a block from memory, the retry buffer and the database.
    ///
    /// Returns true if any copy existed.
    pub fn delete_block(&mut self, pos: BlockPos) -> Result<bool> {
        let mut existed = self.remove_block(pos).is_ok();
        let pending = self.pending_saves.len();
        self.forget_pending(pos);
        existed |= self.pending_saves.len() != pending;
        if pos.is_key_representable() {
            if let Some(db) = self.database.as_mut() {
                existed |= db
                    .delete_block(pos)
                    .map_err(|e| Error::Persistence(format!("deleting block {pos}: {e}")))?;
            }
        }
        Ok(existed)
    }

    /// Every block that can be emerged without generating: stored in the
    /// database, waiting in the retry buffer, or loaded. Sorted.
    pub fn list_all_loadable_blocks(&mut self) -> Result<Vec<BlockPos>> {
        let mut positions = self.loaded_blocks();
        positions.extend(self.pending_saves.iter().map(|(p, _)| *p));
        if let Some(db) = self.database.as_mut() {
            positions.extend(db.list_all_loadable_blocks()?);
        }
        positions.sort_unstable();
        positions.dedup();
        Ok(positions)
    }

    /// Produce a block: memory, then stored copy, then (if `create_blank`)
    /// a blank placeholder.
    ///
    /// Read and decode failures are logged and treated like a missing copy.
    pub fn emerge_block(&mut self, pos: BlockPos, create_blank: bool) -> Option<&mut MapBlock> {
        if self.get_block(pos).is_some() {
            return self.get_block_mut(pos);
        }
        let loaded = match self.load_block(pos) {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(%pos, error = %e, "Failed to load block; using a blank placeholder");
                false
            }
        };
        if loaded {
            return self.get_block_mut(pos);
        }
        create_blank.then(|| self.create_blank_block(pos))
    }
}

/// Shared handle to a [`Map`].
///
/// The owning thread locks it per operation; merging a voxel manipulator
/// holds the lock for the whole merge.
#[derive(Clone, Debug)]
pub struct MapHandle(Arc<Mutex<Map>>);

impl MapHandle {
    pub fn new(map: Map) -> Self {
        Self(Arc::new(Mutex::new(map)))
    }

    pub fn lock(&self) -> MutexGuard<'_, Map> {
        self.0.lock()
    }

    /// Returns true if both handles refer to the same map.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use voxmap_core::ContentId;
    use voxmap_voxel::NodeStore;

    use crate::database::MemoryDatabase;

    const STONE: Node = Node::new(ContentId(1));

    /// Memory database whose writes can be switched to fail.
    #[derive(Clone, Default)]
    struct FlakyDatabase {
        inner: MemoryDatabase,
        failing: Arc<AtomicBool>,
    }

    impl MapDatabase for FlakyDatabase {
        fn save_block(&mut self, pos: BlockPos, data: &[u8]) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Persistence("disk full".into()));
            }
            self.inner.save_block(pos, data)
        }

        fn load_block(&mut self, pos: BlockPos) -> Result<Option<Vec<u8>>> {
            self.inner.load_block(pos)
        }

        fn delete_block(&mut self, pos: BlockPos) -> Result<bool> {
            self.inner.delete_block(pos)
        }

        fn list_all_loadable_blocks(&mut self) -> Result<Vec<BlockPos>> {
            self.inner.list_all_loadable_blocks()
        }
    }

    fn air_block(pos: BlockPos) -> MapBlock {
        MapBlock::with_nodes(pos, NodeStore::filled(Node::AIR))
    }

    fn map_with_blocks(positions: &[BlockPos]) -> Map {
        let mut map = Map::default();
        for pos in positions {
            map.insert_block(air_block(*pos)).unwrap();
        }
        map
    }

    #[test]
    fn set_get_negative_coordinates() {
        let mut map = map_with_blocks(&[BlockPos::new(-1, -1, -1)]);
        let p = IVec3::new(-1, -1, -1);
        map.set_node(p, STONE).unwrap();
        assert_eq!(map.get_node(p), Some(STONE));
        assert_eq!(
            map.get_block(BlockPos::new(-1, -1, -1))
                .unwrap()
                .get_node(LocalPos::new(15, 15, 15)),
            STONE
        );
        // Same node in the positive block would be (0,0,0), which is absent
        assert!(map.get_node(IVec3::ZERO).is_none());
    }

    #[test]
    fn absent_block_behaviour() {
        let mut map = Map::default();
        let p = IVec3::new(5, 5, 5);
        assert!(map.get_node(p).is_none());
        assert_eq!(map.get_node_or_ignore(p), Node::IGNORE);
        assert!(matches!(map.set_node(p, STONE), Err(Error::InvalidPosition(q)) if q == p));
        assert!(matches!(
            map.remove_block(BlockPos::new(0, 0, 0)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn insert_twice_fails() {
        let mut map = map_with_blocks(&[BlockPos::new(0, 0, 0)]);
        assert!(map.insert_block(air_block(BlockPos::new(0, 0, 0))).is_err());
        assert_eq!(map.block_count(), 1);
    }

    #[test]
    fn last_block_removal_drops_sector() {
        let mut map = map_with_blocks(&[BlockPos::new(2, 0, 3), BlockPos::new(2, 1, 3)]);
        assert_eq!(map.sector_count(), 1);
        map.remove_block(BlockPos::new(2, 0, 3)).unwrap();
        assert_eq!(map.sector_count(), 1);
        map.remove_block(BlockPos::new(2, 1, 3)).unwrap();
        assert_eq!(map.sector_count(), 0);
        assert!(!map.sector_cached(SectorPos::new(2, 3)));
    }

    #[test]
    fn delete_sectors_clears_cache() {
        let mut map = map_with_blocks(&[
            BlockPos::new(0, 0, 0),
            BlockPos::new(1, 0, 0),
            BlockPos::new(2, 0, 0),
        ]);
        assert!(map.get_block(BlockPos::new(0, 0, 0)).is_some());
        assert!(map.sector_cached(SectorPos::new(0, 0)));

        assert_eq!(map.delete_sectors(&[SectorPos::new(0, 0)]), 1);
        assert!(!map.sector_cached(SectorPos::new(0, 0)));
        assert!(map.get_block(BlockPos::new(0, 0, 0)).is_none());
        // The sector moved into the freed slot is still reachable
        assert!(map.get_block(BlockPos::new(2, 0, 0)).is_some());
        assert!(map.get_block(BlockPos::new(1, 0, 0)).is_some());
        assert_eq!(map.block_count(), 2);
    }

    #[test]
    fn create_blank_block_is_idempotent() {
        let mut map = Map::default();
        map.create_blank_block(BlockPos::new(0, 0, 0))
            .set_node(LocalPos::new(0, 0, 0), STONE);
        let block = map.create_blank_block(BlockPos::new(0, 0, 0));
        assert_eq!(block.get_node(LocalPos::new(0, 0, 0)), STONE);
        assert_eq!(map.block_count(), 1);
    }

    #[test]
    fn listeners_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut map = map_with_blocks(&[BlockPos::new(0, 0, 0)]);
        let first = {
            let log = Arc::clone(&log);
            map.add_event_receiver(Box::new(move |e: &MapEditEvent| log.lock().push((1, e.kind))))
        };
        {
            let log = Arc::clone(&log);
            map.add_event_receiver(Box::new(move |e: &MapEditEvent| log.lock().push((2, e.kind))));
        }
        map.add_node_with_event(IVec3::ZERO, STONE).unwrap();
        assert!(map.remove_event_receiver(first));
        assert!(!map.remove_event_receiver(first));
        map.remove_node_with_event(IVec3::ZERO).unwrap();

        use crate::event::MapEditEventKind::{AddNode, RemoveNode};
        assert_eq!(*log.lock(), vec![(1, AddNode), (2, AddNode), (2, RemoveNode)]);
        assert_eq!(map.get_node(IVec3::ZERO), Some(Node::AIR));
    }

    #[test]
    fn swap_keeps_metadata_add_drops_it() {
        let mut map = map_with_blocks(&[BlockPos::new(0, 0, 0)]);
        let p = IVec3::new(1, 2, 3);
        let mut meta = NodeMetadata::default();
        meta.set("k", "v");
        map.set_node_metadata_with_event(p, meta).unwrap();
        map.swap_node_with_event(p, STONE).unwrap();
        assert!(map.get_node_metadata(p).is_some());
        map.add_node_with_event(p, STONE).unwrap();
        assert!(map.get_node_metadata(p).is_none());
    }

    #[test]
    fn find_metadata_in_area() {
        let mut map = map_with_blocks(&[BlockPos::new(0, 0, 0), BlockPos::new(-1, 0, 0)]);
        for p in [IVec3::new(-3, 1, 1), IVec3::new(4, 4, 4), IVec3::new(15, 15, 15)] {
            map.set_node_metadata(p, NodeMetadata::default()).unwrap();
        }
        let mut found = map.find_nodes_with_metadata(IVec3::new(-5, 0, 0), IVec3::new(5, 5, 5));
        found.sort_by_key(|p| p.x);
        assert_eq!(found, vec![IVec3::new(-3, 1, 1), IVec3::new(4, 4, 4)]);
    }

    #[test]
    fn node_timers() {
        let mut map = map_with_blocks(&[BlockPos::new(0, 0, 0)]);
        let p = IVec3::new(3, 3, 3);
        map.set_node_timer(p, NodeTimer::new(1.0)).unwrap();
        assert_eq!(map.get_node_timer(p), Some(NodeTimer::new(1.0)));
        assert!(map.remove_node_timer(p).is_some());
        assert!(map.get_node_timer(p).is_none());
        assert!(map.set_node_timer(IVec3::splat(100), NodeTimer::new(1.0)).is_err());
    }

    #[test]
    fn area_visit_order_and_ignore() {
        let map = map_with_blocks(&[BlockPos::new(0, 0, 0)]);
        let mut visited = Vec::new();
        let flow = map.for_each_node_in_area(IVec3::new(15, 0, 0), IVec3::new(16, 1, 0), |p, n| {
            visited.push((p, n));
            ControlFlow::Continue(())
        });
        assert!(flow.is_continue());
        assert_eq!(
            visited,
            vec![
                (IVec3::new(15, 0, 0), Node::AIR),
                (IVec3::new(15, 1, 0), Node::AIR),
                (IVec3::new(16, 0, 0), Node::IGNORE),
                (IVec3::new(16, 1, 0), Node::IGNORE),
            ]
        );
    }

    #[test]
    fn area_visit_stops_early() {
        let map = map_with_blocks(&[BlockPos::new(0, 0, 0), BlockPos::new(0, 1, 0)]);
        let mut count = 0;
        let flow = map.for_each_node_in_area(IVec3::ZERO, IVec3::new(15, 31, 15), |_, _| {
            count += 1;
            if count == 10 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert!(flow.is_break());
        assert_eq!(count, 10);
    }

    #[test]
    fn idle_blocks_unload_but_referenced_stay() {
        let mut map = map_with_blocks(&[BlockPos::new(0, 0, 0), BlockPos::new(1, 0, 0)]);
        map.get_block_mut(BlockPos::new(1, 0, 0)).unwrap().ref_grab();

        let mut unloaded = Vec::new();
        let report = map.timer_update(10.0, 5.0, None, &mut unloaded);
        assert_eq!(unloaded, vec![BlockPos::new(0, 0, 0)]);
        assert_eq!(report.unloaded, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(report.failed_saves, 0);

        let report = map.timer_update(10.0, 5.0, Some(0), &mut unloaded);
        assert_eq!(report.unloaded, 0);
        assert_eq!(map.block_count(), 1);
    }

    #[test]
    fn budget_evicts_oldest_first() {
        let mut map = map_with_blocks(&[
            BlockPos::new(0, 0, 0),
            BlockPos::new(1, 0, 0),
            BlockPos::new(2, 0, 0),
        ]);
        map.get_block_mut(BlockPos::new(1, 0, 0))
            .unwrap()
            .increment_usage_timer(3.0);
        map.get_block_mut(BlockPos::new(2, 0, 0))
            .unwrap()
            .increment_usage_timer(2.0);

        let mut unloaded = Vec::new();
        let report = map.timer_update(0.1, 100.0, Some(1), &mut unloaded);
        assert_eq!(unloaded, vec![BlockPos::new(1, 0, 0), BlockPos::new(2, 0, 0)]);
        assert_eq!(report.remaining, 1);
        assert!(map.get_block(BlockPos::new(0, 0, 0)).is_some());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let db = MemoryDatabase::new();
        let mut map = Map::with_database(MapConfig::default(), Box::new(db.clone()));
        assert!(map.may_save_blocks());
        let pos = BlockPos::new(-2, 3, 7);
        map.insert_block(air_block(pos)).unwrap();
        let p = pos.node_at(LocalPos::new(9, 8, 7));
        map.set_node(p, STONE).unwrap();

        let report = map.save(ModifiedState::WriteNeeded);
        assert_eq!(report.saved, 1);
        assert!(db.contains(pos));
        assert_eq!(map.get_block(pos).unwrap().modified(), ModifiedState::Clean);

        map.remove_block(pos).unwrap();
        assert!(map.load_block(pos).unwrap().is_some());
        assert_eq!(map.get_node(p), Some(STONE));
        assert!(map.load_block(BlockPos::new(50, 50, 50)).unwrap().is_none());
    }

    #[test]
    fn unload_saves_modified_blocks() {
        let db = MemoryDatabase::new();
        let mut map = Map::with_database(MapConfig::default(), Box::new(db.clone()));
        map.insert_block(air_block(BlockPos::new(0, 0, 0))).unwrap();
        map.insert_block(air_block(BlockPos::new(1, 0, 0))).unwrap();
        map.set_node(IVec3::ZERO, STONE).unwrap();

        let mut unloaded = Vec::new();
        let report = map.unload_unreferenced_blocks(&mut unloaded);
        assert_eq!(report.unloaded, 2);
        assert_eq!(report.saved, 1);
        assert_eq!(db.len(), 1);

        let block = map.emerge_block(BlockPos::new(0, 0, 0), false).unwrap();
        assert_eq!(block.get_node(LocalPos::new(0, 0, 0)), STONE);
    }

    #[test]
    fn failed_saves_are_counted_kept_and_retried() {
        let db = FlakyDatabase::default();
        db.failing.store(true, Ordering::SeqCst);
        let mut map = Map::with_database(MapConfig::default(), Box::new(db.clone()));
        let pos = BlockPos::new(4, 0, 4);
        map.insert_block(air_block(pos)).unwrap();
        map.set_node(pos.node_min(), STONE).unwrap();

        let mut unloaded = Vec::new();
        let report = map.timer_update(60.0, 29.0, None, &mut unloaded);
        assert_eq!(report.unloaded, 1);
        assert_eq!(report.failed_saves, 1);
        assert_eq!(map.block_count(), 0);
        assert_eq!(map.pending_save_count(), 1);

        // The unsaved copy is still reachable through emerge
        let block = map.emerge_block(pos, false).unwrap();
        assert_eq!(block.get_node(LocalPos::new(0, 0, 0)), STONE);
        assert_eq!(block.modified(), ModifiedState::WriteNeeded);
        assert_eq!(map.pending_save_count(), 0);

        let report = map.unload_unreferenced_blocks(&mut unloaded);
        assert_eq!(report.failed_saves, 1);
        assert_eq!(map.pending_save_count(), 1);

        db.failing.store(false, Ordering::SeqCst);
        let report = map.save(ModifiedState::WriteNeeded);
        assert_eq!(report.retried, 1);
        assert_eq!(map.pending_save_count(), 0);
        assert!(db.inner.contains(pos));
    }

    #[test]
    fn recovered_block_edits_survive_reload() {
        let db = FlakyDatabase::default();
        db.failing.store(true, Ordering::SeqCst);
        let mut map = Map::with_database(MapConfig::default(), Box::new(db.clone()));
        let pos = BlockPos::new(0, 0, 0);
        map.insert_block(air_block(pos)).unwrap();
        map.set_node(IVec3::ZERO, STONE).unwrap();

        let mut unloaded = Vec::new();
        let report = map.unload_unreferenced_blocks(&mut unloaded);
        assert_eq!(report.failed_saves, 1);
        assert_eq!(map.pending_save_count(), 1);

        db.failing.store(false, Ordering::SeqCst);
        map.emerge_block(pos, false).unwrap();
        let edited = Node::new(ContentId(9));
        map.set_node(IVec3::ZERO, edited).unwrap();

        let report = map.unload_unreferenced_blocks(&mut unloaded);
        assert_eq!(report.saved, 1);
        assert_eq!(report.failed_saves, 0);
        assert_eq!(map.pending_save_count(), 0);

        let block = map.emerge_block(pos, false).unwrap();
        assert_eq!(block.get_node(LocalPos::new(0, 0, 0)), edited);
    }

    #[test]
    fn successful_save_supersedes_retry_copy() {
        let db = FlakyDatabase::default();
        db.failing.store(true, Ordering::SeqCst);
        let mut map = Map::with_database(MapConfig::default(), Box::new(db.clone()));
        let pos = BlockPos::new(2, 0, 0);
        map.insert_block(air_block(pos)).unwrap();
        map.set_node(pos.node_min(), STONE).unwrap();
        assert!(map.save_block(pos).is_err());

        let blob = serialize_block(map.get_block(pos).unwrap(), 0).unwrap();
        map.keep_pending(pos, blob);
        db.failing.store(false, Ordering::SeqCst);
        map.set_node(pos.node_min(), Node::AIR).unwrap();
        assert!(map.save_block(pos).unwrap());
        assert_eq!(map.pending_save_count(), 0);

        map.remove_block(pos).unwrap();
        let block = map.emerge_block(pos, false).unwrap();
        assert_eq!(block.get_node(LocalPos::new(0, 0, 0)), Node::AIR);
    }

    #[test]
    fn delete_block_removes_every_copy() {
        let db = FlakyDatabase::default();
        let mut map = Map::with_database(MapConfig::default(), Box::new(db.clone()));
        let stored = BlockPos::new(1, 0, 0);
        let pending = BlockPos::new(2, 0, 0);
        for pos in [stored, pending] {
            map.insert_block(air_block(pos)).unwrap();
            map.set_node(pos.node_min(), STONE).unwrap();
        }
        map.save_block(stored).unwrap();
        db.failing.store(true, Ordering::SeqCst);
        let mut unloaded = Vec::new();
        map.unload_unreferenced_blocks(&mut unloaded);
        db.failing.store(false, Ordering::SeqCst);
        map.insert_block(air_block(BlockPos::new(3, 0, 0))).unwrap();

        assert_eq!(
            map.list_all_loadable_blocks().unwrap(),
            vec![stored, pending, BlockPos::new(3, 0, 0)]
        );

        assert!(map.delete_block(stored).unwrap());
        assert!(map.delete_block(pending).unwrap());
        assert!(map.delete_block(BlockPos::new(3, 0, 0)).unwrap());
        assert!(!map.delete_block(stored).unwrap());
        assert!(!db.inner.contains(stored));
        assert_eq!(map.pending_save_count(), 0);
        assert_eq!(map.block_count(), 0);
        assert!(map.list_all_loadable_blocks().unwrap().is_empty());
        assert!(map.emerge_block(pending, false).is_none());
    }

    #[test]
    fn retry_buffer_is_bounded() {
        let db = FlakyDatabase::default();
        db.failing.store(true, Ordering::SeqCst);
        let config = MapConfig {
            max_pending_saves: 2,
            ..MapConfig::default()
        };
        let mut map = Map::with_database(config, Box::new(db));
        for x in 0..3 {
            let pos = BlockPos::new(x, 0, 0);
            map.insert_block(air_block(pos)).unwrap();
            map.set_node(pos.node_min(), STONE).unwrap();
        }
        let mut unloaded = Vec::new();
        let report = map.unload_unreferenced_blocks(&mut unloaded);
        assert_eq!(report.failed_saves, 3);
        assert_eq!(map.pending_save_count(), 2);
    }

    #[test]
    fn emerge_creates_blank_when_asked() {
        let mut map = Map::with_database(MapConfig::default(), Box::new(MemoryDatabase::new()));
        let pos = BlockPos::new(0, 5, 0);
        assert!(map.emerge_block(pos, false).is_none());
        let block = map.emerge_block(pos, true).unwrap();
        assert!(!block.is_generated());
        assert!(block.nodes().contains_content(ContentId::IGNORE));
    }

    #[test]
    fn corrupt_stored_block_degrades_to_blank() {
        let mut db = MemoryDatabase::new();
        let pos = BlockPos::new(1, 1, 1);
        db.save_block(pos, &[1, 2, 3]).unwrap();
        let mut map = Map::with_database(MapConfig::default(), Box::new(db));
        assert!(map.load_block(pos).is_err());
        let block = map.emerge_block(pos, true).unwrap();
        assert!(block.nodes().contains_content(ContentId::IGNORE));
    }

    #[test]
    fn block_states_report_dirty() {
        let mut map = map_with_blocks(&[BlockPos::new(0, 0, 0)]);
        map.get_block_mut(BlockPos::new(0, 0, 0)).unwrap().mark_drawn();
        assert!(!map.block_states()[0].dirty);
        map.set_node(IVec3::ZERO, STONE).unwrap();
        let states = map.block_states();
        assert!(states[0].dirty);
        assert_eq!(states[0].modified, ModifiedState::WriteNeeded);
        assert_eq!(map.loaded_blocks(), vec![BlockPos::new(0, 0, 0)]);
    }
}
