//! In-memory voxel window with per-cell flags.

use std::collections::VecDeque;

use glam::IVec3;
use voxmap_core::constants::BLOCK_SIZE;
use voxmap_core::{BlockPos, ContentId, Node, VoxelArea};

use crate::flags::VoxelFlags;
use crate::node_store::NodeStore;

const FACE_DIRS: [IVec3; 6] = [
    IVec3::X,
    IVec3::NEG_X,
    IVec3::Y,
    IVec3::NEG_Y,
    IVec3::Z,
    IVec3::NEG_Z,
];

/// A rectangular node buffer with one [`VoxelFlags`] byte per cell.
///
/// Cells that were never loaded or written hold [`Node::IGNORE`] and carry
/// [`VoxelFlags::NO_DATA`]. Reads outside the area return the ignore
/// sentinel; writes outside the area grow it.
#[derive(Clone, Debug, Default)]
pub struct VoxelBuffer {
    area: VoxelArea,
    nodes: Vec<Node>,
    flags: Vec<VoxelFlags>,
}

impl VoxelBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer covering `area`, filled with ignore/no-data cells
    pub fn with_area(area: VoxelArea) -> Self {
        let mut buffer = Self::new();
        buffer.add_area(&area);
        buffer
    }

    #[inline]
    pub fn area(&self) -> VoxelArea {
        self.area
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.area.is_empty()
    }

    /// Grow the buffer to also cover `area`, keeping existing contents.
    pub fn add_area(&mut self, area: &VoxelArea) {
        if area.is_empty() || self.area.contains_area(area) {
            return;
        }
        let mut new_area = self.area;
        new_area.add_area(area);

        let volume = new_area.volume();
        let mut nodes = vec![Node::IGNORE; volume];
        let mut flags = vec![VoxelFlags::NO_DATA; volume];

        if !self.area.is_empty() {
            let width = self.area.extent().x as usize;
            for z in self.area.min.z..=self.area.max.z {
                for y in self.area.min.y..=self.area.max.y {
                    let row = IVec3::new(self.area.min.x, y, z);
                    let src = self.area.index(row);
                    let dst = new_area.index(row);
                    nodes[dst..dst + width].copy_from_slice(&self.nodes[src..src + width]);
                    flags[dst..dst + width].copy_from_slice(&self.flags[src..src + width]);
                }
            }
        }

        self.area = new_area;
        self.nodes = nodes;
        self.flags = flags;
    }

    /// Node at `p`, or the ignore sentinel outside the area
    #[inline]
    pub fn get(&self, p: IVec3) -> Node {
        self.try_get(p).unwrap_or(Node::IGNORE)
    }

    #[inline]
    pub fn try_get(&self, p: IVec3) -> Option<Node> {
        self.area.try_index(p).map(|i| self.nodes[i])
    }

    #[inline]
    pub fn get_mut(&mut self, p: IVec3) -> Option<&mut Node> {
        self.area.try_index(p).map(|i| &mut self.nodes[i])
    }

    /// Write a node, growing the area if needed, and clear its no-data flag.
    pub fn set(&mut self, p: IVec3, node: Node) {
        if !self.area.contains(p) {
            self.add_area(&VoxelArea::single(p));
        }
        let i = self.area.index(p);
        self.nodes[i] = node;
        self.flags[i].remove(VoxelFlags::NO_DATA);
    }

    /// Flags at `p`; cells outside the area report `NO_DATA`
    #[inline]
    pub fn flags(&self, p: IVec3) -> VoxelFlags {
        self.area
            .try_index(p)
            .map_or(VoxelFlags::NO_DATA, |i| self.flags[i])
    }

    #[inline]
    pub fn flags_mut(&mut self, p: IVec3) -> Option<&mut VoxelFlags> {
        self.area.try_index(p).map(|i| &mut self.flags[i])
    }

    /// Set `flags` on every cell of `area` inside the buffer
    pub fn set_flags(&mut self, area: &VoxelArea, flags: VoxelFlags) {
        self.for_each_index(area, |buffer, i| buffer.flags[i].insert(flags));
    }

    /// Clear `flags` on every cell of `area` inside the buffer
    pub fn clear_flags(&mut self, area: &VoxelArea, flags: VoxelFlags) {
        self.for_each_index(area, |buffer, i| buffer.flags[i].remove(flags));
    }

    /// Clear `flags` on every cell of the buffer
    pub fn clear_all_flags(&mut self, flags: VoxelFlags) {
        for f in &mut self.flags {
            f.remove(flags);
        }
    }

    /// Fill every cell of `area` inside the buffer with `node`
    pub fn fill(&mut self, area: &VoxelArea, node: Node) {
        self.for_each_index(area, |buffer, i| {
            buffer.nodes[i] = node;
            buffer.flags[i].remove(VoxelFlags::NO_DATA);
        });
    }

    /// Mark `area` as holding no data: ignore nodes plus the `NO_DATA` flag.
    pub fn mark_no_data(&mut self, area: &VoxelArea) {
        self.add_area(area);
        self.for_each_index(area, |buffer, i| {
            buffer.nodes[i] = Node::IGNORE;
            buffer.flags[i].insert(VoxelFlags::NO_DATA);
        });
    }

    /// Flood `flags` outwards from `start` across face neighbours.
    ///
    /// A cell is entered when it lies inside the buffer, does not already
    /// carry all of `flags`, and `passable` accepts it. Returns the number of
    /// cells flagged.
    pub fn flood_flags<F>(&mut self, start: IVec3, flags: VoxelFlags, mut passable: F) -> usize
    where
        F: FnMut(IVec3, Node) -> bool,
    {
        let mut queue = VecDeque::new();
        let mut count = 0;
        let mut visit = |buffer: &mut Self, p: IVec3, queue: &mut VecDeque<IVec3>| {
            let Some(i) = buffer.area.try_index(p) else {
                return;
            };
            if buffer.flags[i].contains(flags) || !passable(p, buffer.nodes[i]) {
                return;
            }
            buffer.flags[i].insert(flags);
            queue.push_back(p);
        };

        visit(self, start, &mut queue);
        while let Some(p) = queue.pop_front() {
            count += 1;
            for dir in FACE_DIRS {
                visit(self, p + dir, &mut queue);
            }
        }
        count
    }

    /// Copy a block's nodes into the buffer, growing it if needed.
    pub fn copy_from_block(&mut self, pos: BlockPos, store: &NodeStore) {
        let block_area = VoxelArea::of_block(pos);
        self.add_area(&block_area);
        let src = store.as_slice();
        let width = BLOCK_SIZE as usize;
        for z in 0..BLOCK_SIZE {
            for y in 0..BLOCK_SIZE {
                let dst = self.area.index(block_area.min + IVec3::new(0, y, z));
                let src_start = (y * BLOCK_SIZE + z * BLOCK_SIZE * BLOCK_SIZE) as usize;
                self.nodes[dst..dst + width].copy_from_slice(&src[src_start..src_start + width]);
                for f in &mut self.flags[dst..dst + width] {
                    f.remove(VoxelFlags::NO_DATA);
                }
            }
        }
    }

    /// Write the buffer's view of a block into `store`.
    ///
    /// Ignore nodes in the buffer never overwrite block data. Returns true if
    /// any node in the store changed.
    pub fn copy_to_block(&self, pos: BlockPos, store: &mut NodeStore) -> bool {
        let block_area = VoxelArea::of_block(pos);
        let dst = store.as_mut_slice();
        let mut changed = false;
        for (i, p) in block_area.iter().enumerate() {
            let Some(node) = self.try_get(p) else {
                continue;
            };
            if node.is_ignore() || dst[i] == node {
                continue;
            }
            dst[i] = node;
            changed = true;
        }
        changed
    }

    /// Returns true if any cell of `area` inside the buffer holds `content`.
    ///
    /// Cells outside the buffer count as ignore.
    pub fn contains_content_in(&self, area: &VoxelArea, content: ContentId) -> bool {
        if content.is_ignore() && !self.area.contains_area(area) {
            return true;
        }
        self.area
            .intersection(area)
            .iter()
            .any(|p| self.get(p).content == content)
    }

    /// Iterate over `(position, node)` pairs in index order
    pub fn iter(&self) -> impl Iterator<Item = (IVec3, Node)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (self.area.position(i), *n))
    }

    #[inline]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Drop all contents and flags, leaving an empty buffer
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    fn for_each_index<F>(&mut self, area: &VoxelArea, mut f: F)
    where
        F: FnMut(&mut Self, usize),
    {
        let clipped = self.area.intersection(area);
        if clipped.is_empty() {
            return;
        }
        let width = clipped.extent().x as usize;
        for z in clipped.min.z..=clipped.max.z {
            for y in clipped.min.y..=clipped.max.y {
                let start = self.area.index(IVec3::new(clipped.min.x, y, z));
                for i in start..start + width {
                    f(self, i);
                }
            }
        }
    }
}
