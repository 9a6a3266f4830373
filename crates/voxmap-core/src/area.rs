//! Axis-aligned integer node areas.

use glam::IVec3;
use serde::{Deserialize, Serialize};

use crate::coords::BlockPos;

/// Inclusive axis-aligned box of node positions.
///
/// An area is empty when `min` exceeds `max` on any axis. Linear indices
/// run x fastest, then y, then z.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoxelArea {
    /// Minimum corner (inclusive)
    pub min: IVec3,
    /// Maximum corner (inclusive)
    pub max: IVec3,
}

impl Default for VoxelArea {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl VoxelArea {
    /// The canonical empty area
    pub const EMPTY: Self = Self {
        min: IVec3::ONE,
        max: IVec3::ZERO,
    };

    /// Create a new area from corners; corners are sorted per axis
    #[inline]
    pub fn new(a: IVec3, b: IVec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    /// Area covering a single node
    #[inline]
    pub const fn single(p: IVec3) -> Self {
        Self { min: p, max: p }
    }

    /// Area covering every node of the blocks in `min..=max`
    #[inline]
    pub fn from_blocks(min: BlockPos, max: BlockPos) -> Self {
        Self::new(min.node_min(), max.node_max())
    }

    /// Area covering every node of one block
    #[inline]
    pub fn of_block(pos: BlockPos) -> Self {
        Self::from_blocks(pos, pos)
    }

    /// Returns true if the area holds no nodes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    /// Size of the area in nodes per axis
    #[inline]
    pub fn extent(&self) -> IVec3 {
        if self.is_empty() {
            IVec3::ZERO
        } else {
            self.max - self.min + IVec3::ONE
        }
    }

    /// Number of nodes in the area
    #[inline]
    pub fn volume(&self) -> usize {
        let e = self.extent();
        e.x as usize * e.y as usize * e.z as usize
    }

    /// Check if a node position is inside the area
    #[inline]
    pub fn contains(&self, p: IVec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    /// Check if another area lies entirely inside this one
    #[inline]
    pub fn contains_area(&self, other: &Self) -> bool {
        other.is_empty() || (self.contains(other.min) && self.contains(other.max))
    }

    /// Expand the area to include a point
    #[inline]
    pub fn add_point(&mut self, p: IVec3) {
        if self.is_empty() {
            *self = Self::single(p);
        } else {
            self.min = self.min.min(p);
            self.max = self.max.max(p);
        }
    }

    /// Expand the area to include another area
    #[inline]
    pub fn add_area(&mut self, other: &Self) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = *other;
        } else {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
    }

    /// Overlap of two areas (possibly empty)
    #[inline]
    pub fn intersection(&self, other: &Self) -> Self {
        Self {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }

    /// Area grown by `by` nodes on every side
    #[inline]
    pub fn padded(&self, by: IVec3) -> Self {
        Self {
            min: self.min - by,
            max: self.max + by,
        }
    }

    /// Linear index of a position; the position must be inside the area
    #[inline]
    pub fn index(&self, p: IVec3) -> usize {
        debug_assert!(self.contains(p), "{p} outside {self:?}");
        let e = self.extent();
        let d = p - self.min;
        (d.z as usize * e.y as usize + d.y as usize) * e.x as usize + d.x as usize
    }

    /// Linear index of a position, or `None` outside the area
    #[inline]
    pub fn try_index(&self, p: IVec3) -> Option<usize> {
        self.contains(p).then(|| self.index(p))
    }

    /// Position of a linear index
    #[inline]
    pub fn position(&self, index: usize) -> IVec3 {
        let e = self.extent();
        let (ex, ey) = (e.x as usize, e.y as usize);
        self.min
            + IVec3::new(
                (index % ex) as i32,
                ((index / ex) % ey) as i32,
                (index / (ex * ey)) as i32,
            )
    }

    /// Iterate over every position, x fastest then y then z
    ///
    /// The iterator owns a copy of the area.
    pub fn iter(&self) -> impl Iterator<Item = IVec3> {
        let area = *self;
        (0..area.volume()).map(move |i| area.position(i))
    }

    /// Iterate over every block touched by the area
    pub fn blocks(&self) -> impl Iterator<Item = BlockPos> {
        let (bmin, bmax) = if self.is_empty() {
            (IVec3::ONE, IVec3::ZERO)
        } else {
            (
                BlockPos::containing(self.min).to_ivec3(),
                BlockPos::containing(self.max).to_ivec3(),
            )
        };
        (bmin.z..=bmax.z).flat_map(move |z| {
            (bmin.y..=bmax.y)
                .flat_map(move |y| (bmin.x..=bmax.x).map(move |x| BlockPos::new(x, y, z)))
        })
    }
}
