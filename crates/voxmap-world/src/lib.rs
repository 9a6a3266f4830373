//! Block index, persistence and procedural generation for voxmap.
//!
//! The [`Map`] owns loaded blocks grouped into sectors; [`ServerMap`] adds
//! emerge and liquid queues plus mapchunk generation on top of it. Bulk
//! edits go through [`VoxelManip`], which is detached from the map while
//! generators work on it.

pub mod block;
pub mod config;
pub mod database;
pub mod dungeon;
pub mod event;
pub mod liquid;
pub mod map;
pub mod mapgen;
pub mod noise_params;
pub mod random;
pub mod sector;
pub mod serialize;
pub mod server_map;
pub mod terrain;
pub mod vmanip;
pub mod worker;

pub use block::{MapBlock, ModifiedState, NodeMetadata, NodeTimer};
pub use config::{LiquidConfig, MapConfig, MapgenConfig, WorldConfig};
pub use database::{MapDatabase, MemoryDatabase};
pub use dungeon::{DungeonGen, DungeonParams, DungeonReport};
pub use event::{MapEditEvent, MapEditEventKind, MapEventReceiver, ReceiverId};
pub use liquid::LiquidReport;
pub use map::{BlockState, Map, MapHandle, SaveReport, SweepReport};
pub use mapgen::{block_seed, make_chunks_parallel, DefaultMapgen, Mapgen};
pub use noise_params::{NoiseField, NoiseParams};
pub use random::PseudoRandom;
pub use sector::{MapSector, SectorCache};
pub use server_map::{BlockMakeData, EmergeStatus, ServerMap};
pub use terrain::{TerrainConfig, TerrainGenerator, TerrainPalette};
pub use vmanip::{Attached, BlockFlags, Detached, ManipState, VoxelManip};
pub use worker::MapgenWorker;

/// World seed for procedural generation.
pub type WorldSeed = u64;
