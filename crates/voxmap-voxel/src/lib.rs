//! Node storage and voxel buffers for voxmap.
//!
//! [`NodeStore`] is the fixed 16³ array owned by every map block.
//! [`VoxelBuffer`] is a growable rectangular window of nodes with per-cell
//! [`VoxelFlags`], used for bulk edits and generation.

pub mod buffer;
pub mod flags;
pub mod node_store;

pub use buffer::VoxelBuffer;
pub use flags::VoxelFlags;
pub use node_store::NodeStore;
