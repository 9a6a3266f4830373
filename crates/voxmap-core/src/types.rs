//! Core node types.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Identifier of a node's content type.
///
/// Ids 125-127 are reserved for the builtin contents.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Pod,
    Zeroable,
    Serialize,
    Deserialize,
)]
#[repr(transparent)]
pub struct ContentId(pub u16);

impl ContentId {
    /// Content of nodes whose definition is not registered
    pub const UNKNOWN: Self = Self(125);
    /// Empty space
    pub const AIR: Self = Self(126);
    /// "No data here" sentinel, never stored in a generated block
    pub const IGNORE: Self = Self(127);

    /// Returns true if this is the air content
    #[inline]
    pub const fn is_air(self) -> bool {
        self.0 == Self::AIR.0
    }

    /// Returns true if this is the ignore sentinel
    #[inline]
    pub const fn is_ignore(self) -> bool {
        self.0 == Self::IGNORE.0
    }

    /// Returns true for the reserved builtin ids
    #[inline]
    pub const fn is_reserved(self) -> bool {
        self.0 >= Self::UNKNOWN.0 && self.0 <= Self::IGNORE.0
    }
}

/// A single node: content id plus two auxiliary bytes.
///
/// `param1` usually carries light, `param2` carries content-specific state
/// such as liquid level or facing direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Pod, Zeroable, Serialize, Deserialize)]
#[repr(C)]
pub struct Node {
    /// The content type
    pub content: ContentId,
    /// First auxiliary byte
    pub param1: u8,
    /// Second auxiliary byte
    pub param2: u8,
}

impl Node {
    /// Air node
    pub const AIR: Self = Self::new(ContentId::AIR);

    /// Ignore node, placeholder for missing data
    pub const IGNORE: Self = Self::new(ContentId::IGNORE);

    /// Create a new node with the given content
    #[inline]
    pub const fn new(content: ContentId) -> Self {
        Self {
            content,
            param1: 0,
            param2: 0,
        }
    }

    /// Create a new node with content and both params
    #[inline]
    pub const fn with_params(content: ContentId, param1: u8, param2: u8) -> Self {
        Self {
            content,
            param1,
            param2,
        }
    }

    /// Returns true if this node is air
    #[inline]
    pub const fn is_air(&self) -> bool {
        self.content.is_air()
    }

    /// Returns true if this node is the ignore sentinel
    #[inline]
    pub const fn is_ignore(&self) -> bool {
        self.content.is_ignore()
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::AIR
    }
}

impl From<ContentId> for Node {
    fn from(content: ContentId) -> Self {
        Self::new(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ids() {
        assert!(ContentId::AIR.is_air());
        assert!(ContentId::IGNORE.is_ignore());
        assert!(ContentId::UNKNOWN.is_reserved());
        assert!(!ContentId(0).is_reserved());
        assert!(!ContentId(128).is_reserved());
    }

    #[test]
    fn node_default_is_air() {
        let node = Node::default();
        assert!(node.is_air());
        assert!(!node.is_ignore());
    }

    #[test]
    fn node_is_four_bytes() {
        assert_eq!(std::mem::size_of::<Node>(), 4);
        let node = Node::with_params(ContentId(3), 7, 9);
        let bytes = bytemuck::bytes_of(&node);
        assert_eq!(bytes.len(), 4);
        assert_eq!(bytes[2], 7);
        assert_eq!(bytes[3], 9);
    }
}
