//! Per-cell flags carried by voxel buffers.

use bitflags::bitflags;

bitflags! {
    /// Flags attached to every cell of a [`VoxelBuffer`](crate::VoxelBuffer).
    ///
    /// `NO_DATA` is maintained by the buffer itself; the `CHECKED*` bits are
    /// free for algorithms (dungeon generation assigns them meanings).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VoxelFlags: u8 {
        /// The cell was never loaded or written.
        const NO_DATA  = 0b0000_0001;
        const CHECKED1 = 0b0000_0010;
        const CHECKED2 = 0b0000_0100;
        const CHECKED3 = 0b0000_1000;
        const CHECKED4 = 0b0001_0000;
    }
}

impl VoxelFlags {
    /// Returns `true` if the cell holds no data.
    #[inline]
    #[must_use]
    pub const fn no_data(self) -> bool {
        self.contains(Self::NO_DATA)
    }
}
