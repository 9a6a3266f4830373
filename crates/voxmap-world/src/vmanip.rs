//! Voxel manipulators: bulk edit buffers over a range of map blocks.
//!
//! A manipulator is a [`VoxelBuffer`] plus a table recording, per block,
//! what was found when the block was copied in. An [`Attached`] manipulator
//! can read from and merge into its map; a [`Detached`] one is a plain
//! buffer that can be shipped to a worker thread and later reparented.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};

use bitflags::bitflags;
use tracing::{debug, trace_span};
use voxmap_core::{BlockPos, ContentId, VoxelArea};
use voxmap_voxel::{VoxelBuffer, VoxelFlags};

use crate::block::ModifiedState;
use crate::map::MapHandle;

bitflags! {
    /// What a manipulator found for a block when it was copied in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BlockFlags: u8 {
        /// The block was not in the map.
        const DATA_INEXIST    = 0b01;
        /// The copied block held ignore nodes.
        const CONTAINS_IGNORE = 0b10;
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Detached {}
    impl Sealed for super::Attached {}
}

/// Ownership state of a [`VoxelManip`].
pub trait ManipState: sealed::Sealed {
    /// True if the manipulator has no map to merge into.
    const ORPHAN: bool;
}

/// State of a manipulator without a map.
#[derive(Debug, Clone, Copy, Default)]
pub struct Detached;

/// State of a manipulator bound to a map.
#[derive(Debug, Clone)]
pub struct Attached {
    map: MapHandle,
}

impl ManipState for Detached {
    const ORPHAN: bool = true;
}

impl ManipState for Attached {
    const ORPHAN: bool = false;
}

/// A voxel buffer bound (or not) to a map.
#[derive(Debug, Clone)]
pub struct VoxelManip<S: ManipState> {
    buffer: VoxelBuffer,
    loaded_blocks: BTreeMap<BlockPos, BlockFlags>,
    state: S,
}

impl<S: ManipState> Deref for VoxelManip<S> {
    type Target = VoxelBuffer;

    fn deref(&self) -> &VoxelBuffer {
        &self.buffer
    }
}

impl<S: ManipState> DerefMut for VoxelManip<S> {
    fn deref_mut(&mut self) -> &mut VoxelBuffer {
        &mut self.buffer
    }
}

impl<S: ManipState> VoxelManip<S> {
    /// Deep copy of buffer and block table without the map binding.
    pub fn clone_detached(&self) -> VoxelManip<Detached> {
        VoxelManip {
            buffer: self.buffer.clone(),
            loaded_blocks: self.loaded_blocks.clone(),
            state: Detached,
        }
    }

    #[inline]
    pub fn is_orphan(&self) -> bool {
        S::ORPHAN
    }

    /// Drop buffer contents, flags and the block table.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.loaded_blocks.clear();
    }

    pub fn buffer(&self) -> &VoxelBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut VoxelBuffer {
        &mut self.buffer
    }

    /// Blocks copied in so far, with what was found for each.
    pub fn loaded_blocks(&self) -> impl Iterator<Item = (BlockPos, BlockFlags)> + '_ {
        self.loaded_blocks.iter().map(|(p, f)| (*p, *f))
    }

    pub fn block_flags(&self, pos: BlockPos) -> Option<BlockFlags> {
        self.loaded_blocks.get(&pos).copied()
    }
}

impl Default for VoxelManip<Detached> {
    fn default() -> Self {
        Self::new()
    }
}

impl VoxelManip<Detached> {
    /// An empty buffer with no map.
    pub fn new() -> Self {
        Self {
            buffer: VoxelBuffer::new(),
            loaded_blocks: BTreeMap::new(),
            state: Detached,
        }
    }

    /// Bind to `map`, keeping contents and block table.
    pub fn reparent(self, map: MapHandle) -> VoxelManip<Attached> {
        VoxelManip {
            buffer: self.buffer,
            loaded_blocks: self.loaded_blocks,
            state: Attached { map },
        }
    }
}

impl VoxelManip<Attached> {
    pub fn new(map: MapHandle) -> Self {
        VoxelManip::<Detached>::new().reparent(map)
    }

    pub fn map(&self) -> &MapHandle {
        &self.state.map
    }

    /// Drop the map binding, keeping contents and block table.
    pub fn detach(self) -> VoxelManip<Detached> {
        VoxelManip {
            buffer: self.buffer,
            loaded_blocks: self.loaded_blocks,
            state: Detached,
        }
    }

    /// Copy the blocks `block_min..=block_max` into the buffer.
    ///
    /// Blocks already in the table are left alone. Absent blocks are
    /// emerged when `load_if_absent` is set; otherwise they are recorded as
    /// `DATA_INEXIST | CONTAINS_IGNORE` and their cells flagged `NO_DATA`.
    pub fn initial_emerge(&mut self, block_min: BlockPos, block_max: BlockPos, load_if_absent: bool) {
        let area = VoxelArea::from_blocks(block_min, block_max);
        let _span = trace_span!("initial_emerge", volume = area.volume()).entered();
        self.buffer.add_area(&area);

        let mut map = self.state.map.lock();
        let mut copied = 0;
        for bpos in area.blocks() {
            if self.loaded_blocks.contains_key(&bpos) {
                continue;
            }
            let block = if load_if_absent {
                map.emerge_block(bpos, true).map(|b| &*b)
            } else {
                map.get_block(bpos)
            };
            let flags = match block {
                Some(block) => {
                    self.buffer.copy_from_block(bpos, block.nodes());
                    copied += 1;
                    if block.nodes().contains_content(ContentId::IGNORE) {
                        BlockFlags::CONTAINS_IGNORE
                    } else {
                        BlockFlags::empty()
                    }
                }
                None => {
                    self.buffer
                        .set_flags(&VoxelArea::of_block(bpos), VoxelFlags::NO_DATA);
                    BlockFlags::DATA_INEXIST | BlockFlags::CONTAINS_IGNORE
                }
            };
            self.loaded_blocks.insert(bpos, flags);
        }
        debug!(
            copied,
            table = self.loaded_blocks.len(),
            "Emerged blocks into manipulator"
        );
    }

    /// Merge the buffer back into the map, holding the map lock throughout.
    ///
    /// Blocks that were absent at load time are only created when
    /// `overwrite_generated` is set and the buffer covers them without
    /// ignore nodes. Generated blocks are only overwritten with
    /// `overwrite_generated`. Blocks whose contents changed are added to
    /// `modified` and raised to `WriteNeeded`.
    pub fn blit_back_all(&self, modified: &mut BTreeSet<BlockPos>, overwrite_generated: bool) {
        let _span = trace_span!("blit_back_all", blocks = self.loaded_blocks.len()).entered();
        let mut map = self.state.map.lock();
        let mut changed_blocks = 0;

        for (&bpos, &flags) in &self.loaded_blocks {
            if flags.contains(BlockFlags::DATA_INEXIST) {
                let complete = !self
                    .buffer
                    .contains_content_in(&VoxelArea::of_block(bpos), ContentId::IGNORE);
                if !overwrite_generated || !complete {
                    continue;
                }
            } else if !overwrite_generated && map.get_block(bpos).is_some_and(|b| b.is_generated()) {
                continue;
            }

            // Vanished blocks and newly complete ones are created here
            let block = map.create_blank_block(bpos);
            if self.buffer.copy_to_block(bpos, block.nodes_mut()) {
                block.raise_modified(ModifiedState::WriteNeeded, "vmanip blit");
                modified.insert(bpos);
                changed_blocks += 1;
            }
        }
        debug!(changed_blocks, "Blitted manipulator back");
    }
}
