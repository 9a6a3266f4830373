//! Fixed-size node storage for one map block.

use voxmap_core::constants::{BLOCK_SIZE, BLOCK_VOLUME};
use voxmap_core::{ContentId, LocalPos, Node};

/// Flat array of the 16³ nodes of a block.
///
/// Nodes are laid out `x + 16*y + 256*z`, matching [`LocalPos::to_index`].
#[derive(Clone, PartialEq, Eq)]
pub struct NodeStore {
    nodes: Box<[Node]>,
}

impl std::fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStore")
            .field("first", &self.nodes[0])
            .finish_non_exhaustive()
    }
}

impl Default for NodeStore {
    /// A store filled with the ignore sentinel
    fn default() -> Self {
        Self::filled(Node::IGNORE)
    }
}

impl NodeStore {
    /// Create a store with every node set to `node`
    pub fn filled(node: Node) -> Self {
        Self {
            nodes: vec![node; BLOCK_VOLUME].into_boxed_slice(),
        }
    }

    /// Build a store from a flat node vector.
    ///
    /// Returns `None` unless exactly [`BLOCK_VOLUME`] nodes are given.
    pub fn from_vec(nodes: Vec<Node>) -> Option<Self> {
        (nodes.len() == BLOCK_VOLUME).then(|| Self {
            nodes: nodes.into_boxed_slice(),
        })
    }

    #[inline]
    pub fn get(&self, pos: LocalPos) -> Node {
        self.nodes[pos.to_index()]
    }

    #[inline]
    pub fn set(&mut self, pos: LocalPos, node: Node) {
        self.nodes[pos.to_index()] = node;
    }

    /// Bounds-checked read by signed local coordinates
    #[inline]
    pub fn get_xyz(&self, x: i32, y: i32, z: i32) -> Option<Node> {
        Self::checked_index(x, y, z).map(|i| self.nodes[i])
    }

    /// Bounds-checked write by signed local coordinates.
    ///
    /// Returns false (and writes nothing) outside the block.
    #[inline]
    pub fn set_xyz(&mut self, x: i32, y: i32, z: i32, node: Node) -> bool {
        match Self::checked_index(x, y, z) {
            Some(i) => {
                self.nodes[i] = node;
                true
            }
            None => false,
        }
    }

    fn checked_index(x: i32, y: i32, z: i32) -> Option<usize> {
        let range = 0..BLOCK_SIZE;
        (range.contains(&x) && range.contains(&y) && range.contains(&z))
            .then(|| LocalPos::new(x as u8, y as u8, z as u8).to_index())
    }

    pub fn fill(&mut self, node: Node) {
        self.nodes.fill(node);
    }

    /// Returns true if any node has the given content
    pub fn contains_content(&self, content: ContentId) -> bool {
        self.nodes.iter().any(|n| n.content == content)
    }

    #[inline]
    pub fn as_slice(&self) -> &[Node] {
        &self.nodes
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    /// Raw byte view, four bytes per node
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.nodes)
    }

    /// Iterate over `(local position, node)` pairs in storage order
    pub fn iter(&self) -> impl Iterator<Item = (LocalPos, Node)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (LocalPos::from_index(i), *n))
    }
}
