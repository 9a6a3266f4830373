//! Coordinate systems for the voxel map.
//!
//! Node positions are plain [`IVec3`] values. A node belongs to exactly one
//! block, found by floor division of each axis by [`BLOCK_SIZE`]; negative
//! coordinates round toward negative infinity (`-1` lives in block `-1`).

use crate::constants::{BLOCK_BITS, BLOCK_SIZE};
use glam::IVec3;
use serde::{Deserialize, Serialize};

/// Position of a single node in world space.
pub type NodePos = IVec3;

/// Floor division that rounds toward negative infinity for positive divisors.
#[inline]
pub const fn floor_div(p: i32, d: i32) -> i32 {
    p.div_euclid(d)
}

/// Position within a block (0 to BLOCK_SIZE-1 per axis).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalPos {
    pub x: u8,
    pub y: u8,
    pub z: u8,
}

impl LocalPos {
    /// Create a new local position
    #[inline]
    pub const fn new(x: u8, y: u8, z: u8) -> Self {
        debug_assert!((x as i32) < BLOCK_SIZE);
        debug_assert!((y as i32) < BLOCK_SIZE);
        debug_assert!((z as i32) < BLOCK_SIZE);
        Self { x, y, z }
    }

    /// Local position of a world node inside its owning block.
    #[inline]
    pub const fn of_node(p: NodePos) -> Self {
        Self {
            x: p.x.rem_euclid(BLOCK_SIZE) as u8,
            y: p.y.rem_euclid(BLOCK_SIZE) as u8,
            z: p.z.rem_euclid(BLOCK_SIZE) as u8,
        }
    }

    /// Convert to linear index for flat array storage
    #[inline]
    pub const fn to_index(self) -> usize {
        self.x as usize
            + ((self.y as usize) << BLOCK_BITS)
            + ((self.z as usize) << (2 * BLOCK_BITS))
    }

    /// Create from linear index
    #[inline]
    pub const fn from_index(index: usize) -> Self {
        let size = BLOCK_SIZE as usize;
        let x = (index % size) as u8;
        let y = ((index / size) % size) as u8;
        let z = (index / (size * size)) as u8;
        Self { x, y, z }
    }

    /// Convert to glam IVec3
    #[inline]
    pub const fn to_ivec3(self) -> IVec3 {
        IVec3::new(self.x as i32, self.y as i32, self.z as i32)
    }
}

/// Block position in block coordinates.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    /// Create a new block position
    #[inline]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Get the block containing a node position
    #[inline]
    pub const fn containing(p: NodePos) -> Self {
        Self::new(
            floor_div(p.x, BLOCK_SIZE),
            floor_div(p.y, BLOCK_SIZE),
            floor_div(p.z, BLOCK_SIZE),
        )
    }

    /// Sector (vertical column) this block belongs to
    #[inline]
    pub const fn sector(self) -> SectorPos {
        SectorPos::new(self.x, self.z)
    }

    /// Minimum corner of the block in node coordinates
    #[inline]
    pub const fn node_min(self) -> NodePos {
        IVec3::new(
            self.x * BLOCK_SIZE,
            self.y * BLOCK_SIZE,
            self.z * BLOCK_SIZE,
        )
    }

    /// Maximum corner of the block in node coordinates (inclusive)
    #[inline]
    pub const fn node_max(self) -> NodePos {
        IVec3::new(
            self.x * BLOCK_SIZE + BLOCK_SIZE - 1,
            self.y * BLOCK_SIZE + BLOCK_SIZE - 1,
            self.z * BLOCK_SIZE + BLOCK_SIZE - 1,
        )
    }

    /// World position of a local node in this block
    #[inline]
    pub const fn node_at(self, local: LocalPos) -> NodePos {
        IVec3::new(
            self.x * BLOCK_SIZE + local.x as i32,
            self.y * BLOCK_SIZE + local.y as i32,
            self.z * BLOCK_SIZE + local.z as i32,
        )
    }

    /// Get the six face-adjacent block positions
    pub fn neighbors(self) -> [Self; 6] {
        [
            Self::new(self.x - 1, self.y, self.z),
            Self::new(self.x + 1, self.y, self.z),
            Self::new(self.x, self.y - 1, self.z),
            Self::new(self.x, self.y + 1, self.z),
            Self::new(self.x, self.y, self.z - 1),
            Self::new(self.x, self.y, self.z + 1),
        ]
    }

    /// Whether [`BlockPos::as_key`] packs this position without colliding.
    #[inline]
    pub const fn is_key_representable(self) -> bool {
        const fn fits(v: i32) -> bool {
            v >= -2048 && v < 2048
        }
        fits(self.x) && fits(self.y) && fits(self.z)
    }

    /// Pack into the integer key used by map databases.
    ///
    /// Each axis occupies 12 bits, so block coordinates must lie in
    /// `-2048..2048`; anything outside collides with another position.
    #[inline]
    pub const fn as_key(self) -> i64 {
        debug_assert!(self.is_key_representable(), "block position outside the key range");
        (self.z as i64) * 0x100_0000 + (self.y as i64) * 0x1000 + self.x as i64
    }

    /// Unpack a database key produced by [`BlockPos::as_key`].
    pub const fn from_key(key: i64) -> Self {
        const fn take_axis(i: i64) -> i64 {
            let v = i.rem_euclid(4096);
            if v < 2048 {
                v
            } else {
                v - 4096
            }
        }
        let x = take_axis(key);
        let key = (key - x) / 4096;
        let y = take_axis(key);
        let key = (key - y) / 4096;
        let z = take_axis(key);
        Self::new(x as i32, y as i32, z as i32)
    }

    /// Convert to glam IVec3
    #[inline]
    pub const fn to_ivec3(self) -> IVec3 {
        IVec3::new(self.x, self.y, self.z)
    }
}

impl From<IVec3> for BlockPos {
    fn from(v: IVec3) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

impl std::fmt::Display for BlockPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// Sector position: the (x, z) column shared by a stack of blocks.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SectorPos {
    pub x: i32,
    pub z: i32,
}

impl SectorPos {
    /// Create a new sector position
    #[inline]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Block position in this sector at the given height
    #[inline]
    pub const fn block(self, y: i32) -> BlockPos {
        BlockPos::new(self.x, y, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_pos_index_roundtrip() {
        for index in 0..(BLOCK_SIZE * BLOCK_SIZE * BLOCK_SIZE) as usize {
            let pos = LocalPos::from_index(index);
            assert_eq!(pos.to_index(), index);
        }
    }

    #[test]
    fn negative_node_pos_block() {
        let block = BlockPos::containing(IVec3::new(-1, -1, -1));
        assert_eq!(block, BlockPos::new(-1, -1, -1));

        let block = BlockPos::containing(IVec3::new(-16, -17, 15));
        assert_eq!(block, BlockPos::new(-1, -2, 0));
    }

    #[test]
    fn containing_matches_floor_division() {
        for p in -100..100 {
            let expected = (f64::from(p) / f64::from(BLOCK_SIZE)).floor() as i32;
            let block = BlockPos::containing(IVec3::new(p, p, p));
            assert_eq!(block.x, expected, "node {p}");
            assert_eq!(block.y, expected, "node {p}");
            assert_eq!(block.z, expected, "node {p}");
        }
    }

    #[test]
    fn node_block_local_roundtrip() {
        let node = IVec3::new(100, -50, -33);
        let block = BlockPos::containing(node);
        let local = LocalPos::of_node(node);
        assert_eq!(block.node_at(local), node);
        assert_eq!(local, LocalPos::new(4, 14, 15));
    }

    #[test]
    fn block_corners() {
        let block = BlockPos::new(-1, 0, 2);
        assert_eq!(block.node_min(), IVec3::new(-16, 0, 32));
        assert_eq!(block.node_max(), IVec3::new(-1, 15, 47));
        assert_eq!(block.sector(), SectorPos::new(-1, 2));
    }

    #[test]
    fn database_key_roundtrip() {
        for pos in [
            BlockPos::new(0, 0, 0),
            BlockPos::new(-1, -1, -1),
            BlockPos::new(2047, -2048, 5),
            BlockPos::new(-1938, 1938, -7),
        ] {
            assert_eq!(BlockPos::from_key(pos.as_key()), pos);
        }
    }

    #[test]
    fn key_range_limits() {
        assert!(BlockPos::new(2047, -2048, 0).is_key_representable());
        assert!(!BlockPos::new(2048, 0, 0).is_key_representable());
        assert!(!BlockPos::new(0, 0, -2049).is_key_representable());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "outside the key range")]
    fn out_of_range_key_panics_in_debug() {
        let _ = BlockPos::new(4096, 0, 0).as_key();
    }
}
