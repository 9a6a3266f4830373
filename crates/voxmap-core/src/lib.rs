//! Core types, coordinates, and content definitions for voxmap.
//!
//! This crate provides the foundational types used throughout the engine:
//! - Node and content id types
//! - Coordinate systems (node, block, sector, local)
//! - Axis-aligned voxel areas
//! - The content registry (node definitions)
//! - Common containers and error types

pub mod area;
pub mod content;
pub mod coords;
pub mod error;
pub mod types;
pub mod unique_queue;

pub use area::VoxelArea;
pub use content::{ContentFeatures, DrawType, LiquidType, NodeRegistry};
pub use coords::{BlockPos, LocalPos, NodePos, SectorPos};
pub use error::{Error, Result};
pub use types::{ContentId, Node};
pub use unique_queue::UniqueQueue;

/// Engine-wide constants
pub mod constants {
    /// Size of a map block in nodes per axis
    pub const BLOCK_SIZE: i32 = 16;
    /// Total nodes in a map block (16^3)
    pub const BLOCK_VOLUME: usize = (BLOCK_SIZE * BLOCK_SIZE * BLOCK_SIZE) as usize;
    /// Bits needed to represent a position within a block (4 bits for 0-15)
    pub const BLOCK_BITS: u32 = 4;
    /// Default limit (in nodes, per axis) beyond which nothing is generated
    pub const MAX_MAP_GENERATION_LIMIT: i32 = 31007;
}
