//! Block storage backends.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use voxmap_core::{BlockPos, Result};

/// Key to blob store for encoded blocks.
///
/// Absence of a key means the block was never generated.
pub trait MapDatabase: Send {
    /// Called before a batch of saves.
    fn begin_save(&mut self) {}
    /// Called after a batch of saves.
    fn end_save(&mut self) {}
    fn save_block(&mut self, pos: BlockPos, data: &[u8]) -> Result<()>;
    fn load_block(&mut self, pos: BlockPos) -> Result<Option<Vec<u8>>>;
    /// Returns true if a record was removed.
    fn delete_block(&mut self, pos: BlockPos) -> Result<bool>;
    fn list_all_loadable_blocks(&mut self) -> Result<Vec<BlockPos>>;
}

/// In-memory database keyed by [`BlockPos::as_key`].
///
/// Clones share the same storage, so a test or tool can keep a handle to
/// the records a map writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    blocks: Arc<Mutex<HashMap<i64, Vec<u8>>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    pub fn contains(&self, pos: BlockPos) -> bool {
        self.blocks.lock().contains_key(&pos.as_key())
    }
}

impl MapDatabase for MemoryDatabase {
    fn save_block(&mut self, pos: BlockPos, data: &[u8]) -> Result<()> {
        self.blocks.lock().insert(pos.as_key(), data.to_vec());
        Ok(())
    }

    fn load_block(&mut self, pos: BlockPos) -> Result<Option<Vec<u8>>> {
        Ok(self.blocks.lock().get(&pos.as_key()).cloned())
    }

    fn delete_block(&mut self, pos: BlockPos) -> Result<bool> {
        Ok(self.blocks.lock().remove(&pos.as_key()).is_some())
    }

    fn list_all_loadable_blocks(&mut self) -> Result<Vec<BlockPos>> {
        let mut positions: Vec<_> = self
            .blocks
            .lock()
            .keys()
            .map(|key| BlockPos::from_key(*key))
            .collect();
        positions.sort_unstable();
        Ok(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_storage() {
        let db = MemoryDatabase::new();
        let mut writer = db.clone();
        writer.save_block(BlockPos::new(-3, 4, 5), b"abc").unwrap();
        assert!(db.contains(BlockPos::new(-3, 4, 5)));
        assert_eq!(
            writer.load_block(BlockPos::new(-3, 4, 5)).unwrap().as_deref(),
            Some(&b"abc"[..])
        );
    }

    #[test]
    fn list_and_delete() {
        let mut db = MemoryDatabase::new();
        db.save_block(BlockPos::new(1, 0, 0), b"x").unwrap();
        db.save_block(BlockPos::new(-1, -1, -1), b"y").unwrap();
        assert_eq!(
            db.list_all_loadable_blocks().unwrap(),
            vec![BlockPos::new(-1, -1, -1), BlockPos::new(1, 0, 0)]
        );
        assert!(db.delete_block(BlockPos::new(1, 0, 0)).unwrap());
        assert!(!db.delete_block(BlockPos::new(1, 0, 0)).unwrap());
        assert_eq!(db.len(), 1);
        assert!(db.load_block(BlockPos::new(1, 0, 0)).unwrap().is_none());
    }
}
