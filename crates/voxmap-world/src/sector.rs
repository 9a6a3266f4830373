//! Sectors (vertical block columns) and the sector cache.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};

use voxmap_core::{Error, Result, SectorPos};

use crate::block::MapBlock;

/// All loaded blocks sharing one (x, z) column, keyed by y.
#[derive(Debug)]
pub struct MapSector {
    pos: SectorPos,
    blocks: BTreeMap<i32, MapBlock>,
}

impl MapSector {
    pub fn new(pos: SectorPos) -> Self {
        Self {
            pos,
            blocks: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn pos(&self) -> SectorPos {
        self.pos
    }

    pub fn get_block(&self, y: i32) -> Option<&MapBlock> {
        self.blocks.get(&y)
    }

    pub fn get_block_mut(&mut self, y: i32) -> Option<&mut MapBlock> {
        self.blocks.get_mut(&y)
    }

    /// Insert a block; fails if one already exists at that height.
    pub fn insert_block(&mut self, block: MapBlock) -> Result<&mut MapBlock> {
        let pos = block.pos();
        if pos.sector() != self.pos {
            return Err(Error::InvalidData(format!(
                "block {pos} does not belong to sector ({},{})",
                self.pos.x, self.pos.z
            )));
        }
        match self.blocks.entry(pos.y) {
            std::collections::btree_map::Entry::Occupied(_) => Err(Error::InvalidData(format!(
                "block {pos} already exists"
            ))),
            std::collections::btree_map::Entry::Vacant(slot) => Ok(slot.insert(block)),
        }
    }

    /// Block at `y`, inserting a blank placeholder if absent.
    pub fn block_or_blank(&mut self, y: i32) -> &mut MapBlock {
        let pos = self.pos.block(y);
        self.blocks.entry(y).or_insert_with(|| MapBlock::new(pos))
    }

    pub fn remove_block(&mut self, y: i32) -> Option<MapBlock> {
        self.blocks.remove(&y)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &MapBlock> {
        self.blocks.values()
    }

    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut MapBlock> {
        self.blocks.values_mut()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Small LRU from sector position to storage slot.
///
/// Lookups go through `&self` so read paths can refresh it. Entries must be
/// invalidated whenever the sector they name is removed or moved.
#[derive(Debug)]
pub struct SectorCache {
    entries: RefCell<VecDeque<(SectorPos, usize)>>,
    capacity: usize,
}

impl SectorCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RefCell::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    /// Cached slot for `pos`, promoting the entry to most recent.
    pub fn lookup(&self, pos: SectorPos) -> Option<usize> {
        let mut entries = self.entries.borrow_mut();
        let at = entries.iter().position(|(p, _)| *p == pos)?;
        let entry = entries.remove(at)?;
        entries.push_front(entry);
        Some(entry.1)
    }

    /// Remember `pos` as living in `slot`.
    pub fn insert(&self, pos: SectorPos, slot: usize) {
        let mut entries = self.entries.borrow_mut();
        entries.retain(|(p, _)| *p != pos);
        entries.push_front((pos, slot));
        entries.truncate(self.capacity);
    }

    /// Forget `pos`; returns true if it was cached.
    pub fn invalidate(&self, pos: SectorPos) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|(p, _)| *p != pos);
        entries.len() != before
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    pub fn contains(&self, pos: SectorPos) -> bool {
        self.entries.borrow().iter().any(|(p, _)| *p == pos)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}
