//! Map block: 16³ nodes plus bookkeeping.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use voxmap_core::{BlockPos, LocalPos, Node};
use voxmap_voxel::NodeStore;

/// How urgently a block must be written to the database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModifiedState {
    /// Matches the stored copy.
    #[default]
    Clean,
    /// Changed in a way worth keeping, but only saved on unload.
    WriteAtUnload,
    /// Must be saved at the next save pass.
    WriteNeeded,
}

/// String key/value fields attached to a single node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub fields: BTreeMap<String, String>,
}

impl NodeMetadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A countdown attached to a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeTimer {
    /// Seconds until the timer fires
    pub timeout: f32,
    /// Seconds already elapsed
    pub elapsed: f32,
}

impl NodeTimer {
    pub const fn new(timeout: f32) -> Self {
        Self {
            timeout,
            elapsed: 0.0,
        }
    }
}

/// A loaded 16x16x16 block of nodes.
#[derive(Debug, Clone)]
pub struct MapBlock {
    pos: BlockPos,
    nodes: NodeStore,
    metadata: BTreeMap<u16, NodeMetadata>,
    timers: BTreeMap<u16, NodeTimer>,
    /// Seconds since the block was last used.
    usage_timer: f32,
    refcount: u32,
    modified: ModifiedState,
    modified_reason: String,
    generated: bool,
    /// Whether the block changed since consumers last drew it.
    dirty: bool,
}

impl MapBlock {
    /// Create a placeholder block filled with the ignore sentinel.
    pub fn new(pos: BlockPos) -> Self {
        Self::with_nodes(pos, NodeStore::default())
    }

    /// Create a block from existing node data.
    pub fn with_nodes(pos: BlockPos, nodes: NodeStore) -> Self {
        Self {
            pos,
            nodes,
            metadata: BTreeMap::new(),
            timers: BTreeMap::new(),
            usage_timer: 0.0,
            refcount: 0,
            modified: ModifiedState::Clean,
            modified_reason: String::new(),
            generated: false,
            dirty: true,
        }
    }

    #[inline]
    pub fn pos(&self) -> BlockPos {
        self.pos
    }

    #[inline]
    pub fn nodes(&self) -> &NodeStore {
        &self.nodes
    }

    /// Mutable node access. Callers raise the modified state themselves.
    #[inline]
    pub fn nodes_mut(&mut self) -> &mut NodeStore {
        &mut self.nodes
    }

    #[inline]
    pub fn get_node(&self, pos: LocalPos) -> Node {
        self.nodes.get(pos)
    }

    /// Write a node and raise the block to `WriteNeeded`.
    pub fn set_node(&mut self, pos: LocalPos, node: Node) {
        self.nodes.set(pos, node);
        self.raise_modified(ModifiedState::WriteNeeded, "set_node");
    }

    /// Raise the modified state; lower states never replace higher ones.
    pub fn raise_modified(&mut self, state: ModifiedState, reason: &str) {
        if state > self.modified {
            self.modified = state;
            reason.clone_into(&mut self.modified_reason);
        }
        if state > ModifiedState::Clean {
            self.dirty = true;
        }
    }

    /// Mark the block as matching its stored copy.
    pub fn reset_modified(&mut self) {
        self.modified = ModifiedState::Clean;
        self.modified_reason.clear();
    }

    #[inline]
    pub fn modified(&self) -> ModifiedState {
        self.modified
    }

    pub fn modified_reason(&self) -> &str {
        &self.modified_reason
    }

    #[inline]
    pub fn is_generated(&self) -> bool {
        self.generated
    }

    pub fn set_generated(&mut self, generated: bool) {
        if self.generated != generated {
            self.generated = generated;
            self.raise_modified(ModifiedState::WriteNeeded, "set_generated");
        }
    }

    #[inline]
    pub fn usage_timer(&self) -> f32 {
        self.usage_timer
    }

    pub fn increment_usage_timer(&mut self, dt: f32) {
        self.usage_timer += dt;
    }

    /// Mark the block as just used.
    pub fn reset_usage_timer(&mut self) {
        self.usage_timer = 0.0;
    }

    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    /// Take a reference; referenced blocks are never unloaded.
    pub fn ref_grab(&mut self) {
        self.refcount += 1;
    }

    pub fn ref_drop(&mut self) {
        self.refcount = self.refcount.saturating_sub(1);
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear the dirty flag once consumers have picked up the change.
    pub fn mark_drawn(&mut self) {
        self.dirty = false;
    }

    pub fn metadata(&self, pos: LocalPos) -> Option<&NodeMetadata> {
        self.metadata.get(&(pos.to_index() as u16))
    }

    pub fn set_metadata(&mut self, pos: LocalPos, meta: NodeMetadata) {
        self.metadata.insert(pos.to_index() as u16, meta);
        self.raise_modified(ModifiedState::WriteNeeded, "set_metadata");
    }

    pub fn remove_metadata(&mut self, pos: LocalPos) -> Option<NodeMetadata> {
        let removed = self.metadata.remove(&(pos.to_index() as u16));
        if removed.is_some() {
            self.raise_modified(ModifiedState::WriteNeeded, "remove_metadata");
        }
        removed
    }

    /// All metadata entries, keyed by in-block index.
    pub fn metadata_entries(&self) -> impl Iterator<Item = (u16, &NodeMetadata)> {
        self.metadata.iter().map(|(i, m)| (*i, m))
    }

    pub fn timer(&self, pos: LocalPos) -> Option<NodeTimer> {
        self.timers.get(&(pos.to_index() as u16)).copied()
    }

    pub fn set_timer(&mut self, pos: LocalPos, timer: NodeTimer) {
        self.timers.insert(pos.to_index() as u16, timer);
        self.raise_modified(ModifiedState::WriteAtUnload, "set_timer");
    }

    pub fn remove_timer(&mut self, pos: LocalPos) -> Option<NodeTimer> {
        let removed = self.timers.remove(&(pos.to_index() as u16));
        if removed.is_some() {
            self.raise_modified(ModifiedState::WriteAtUnload, "remove_timer");
        }
        removed
    }

    /// All node timers, keyed by in-block index.
    pub fn timer_entries(&self) -> impl Iterator<Item = (u16, &NodeTimer)> {
        self.timers.iter().map(|(i, t)| (*i, t))
    }

    /// Replace metadata and timers wholesale (used when decoding).
    pub(crate) fn set_side_tables(
        &mut self,
        metadata: BTreeMap<u16, NodeMetadata>,
        timers: BTreeMap<u16, NodeTimer>,
    ) {
        self.metadata = metadata;
        self.timers = timers;
    }

    /// Set the generated flag without touching the modified state.
    pub(crate) fn restore_generated(&mut self, generated: bool) {
        self.generated = generated;
    }

    /// Approximate heap and inline memory used by the block.
    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + std::mem::size_of_val(self.nodes.as_slice())
            + self.metadata.len() * std::mem::size_of::<NodeMetadata>()
            + self.timers.len() * std::mem::size_of::<NodeTimer>()
    }
}
