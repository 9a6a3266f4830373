//! Benchmarks for the map and manipulator hot paths.
//!
//! Run with: cargo bench --package voxmap-world --bench map_bench

use std::collections::BTreeSet;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use glam::IVec3;
use voxmap_core::{BlockPos, ContentId, Node, NodeRegistry, VoxelArea};
use voxmap_voxel::{NodeStore, VoxelBuffer};
use voxmap_world::{
    block_seed, Attached, BlockMakeData, DefaultMapgen, DungeonGen, DungeonParams, Map, MapBlock,
    MapConfig, MapHandle, Mapgen, VoxelManip, WorldConfig,
};

const STONE: Node = Node::new(ContentId(1));

fn filled_map(extent: i32) -> MapHandle {
    let mut map = Map::new(MapConfig::default());
    for z in 0..extent {
        for y in 0..extent {
            for x in 0..extent {
                let pos = BlockPos::new(x, y, z);
                map.insert_block(MapBlock::with_nodes(pos, NodeStore::filled(STONE)))
                    .unwrap();
            }
        }
    }
    MapHandle::new(map)
}

fn benchmark_node_access(c: &mut Criterion) {
    let handle = filled_map(4);
    let mut group = c.benchmark_group("map_nodes");
    group.throughput(Throughput::Elements(64 * 64 * 64));

    group.bench_function("get_node_64cubed", |b| {
        let map = handle.lock();
        b.iter(|| {
            let mut solid = 0u32;
            for p in VoxelArea::new(IVec3::ZERO, IVec3::splat(63)).iter() {
                if map.get_node_or_ignore(p) == STONE {
                    solid += 1;
                }
            }
            black_box(solid)
        });
    });

    group.bench_function("set_node_64cubed", |b| {
        let mut map = handle.lock();
        b.iter(|| {
            for p in VoxelArea::new(IVec3::ZERO, IVec3::splat(63)).iter() {
                let _ = map.set_node(p, black_box(Node::AIR));
            }
        });
    });

    group.finish();
}

fn benchmark_vmanip(c: &mut Criterion) {
    let handle = filled_map(4);
    let mut group = c.benchmark_group("vmanip");
    group.sample_size(20);

    group.bench_function("initial_emerge_4x4x4_blocks", |b| {
        b.iter(|| {
            let mut vm = VoxelManip::<Attached>::new(handle.clone());
            vm.initial_emerge(BlockPos::new(0, 0, 0), BlockPos::new(3, 3, 3), false);
            black_box(vm.area().volume())
        });
    });

    let mut vm = VoxelManip::<Attached>::new(handle.clone());
    vm.initial_emerge(BlockPos::new(0, 0, 0), BlockPos::new(3, 3, 3), false);
    vm.fill(&VoxelArea::new(IVec3::splat(8), IVec3::splat(40)), Node::AIR);
    group.bench_function("blit_back_all_4x4x4_blocks", |b| {
        b.iter(|| {
            let mut modified = BTreeSet::new();
            vm.blit_back_all(&mut modified, true);
            black_box(modified.len())
        });
    });

    group.finish();
}

fn benchmark_generation(c: &mut Criterion) {
    let registry = Arc::new(NodeRegistry::with_defaults());
    let config = WorldConfig {
        seed: 42,
        ..Default::default()
    };
    let mapgen = DefaultMapgen::new(&config, Arc::clone(&registry)).unwrap();

    let mut group = c.benchmark_group("generation");
    group.sample_size(10);

    group.bench_function("default_mapgen_chunk", |b| {
        let mut x = 0;
        b.iter(|| {
            x += 5;
            let min = BlockPos::new(x, -2, -2);
            let max = BlockPos::new(x + 4, 2, 2);
            let seed = block_seed(min.node_min(), config.seed);
            let mut data = BlockMakeData::new(min, max, min, seed, Arc::clone(&registry));
            mapgen.make_chunk(&mut data);
            black_box(data.transforming_liquid.len())
        });
    });

    let stone = Node::new(registry.require("default:stone").unwrap());
    let params = DungeonParams::from_registry(&registry).unwrap();
    let dungeons = DungeonGen::new(&registry, params);
    group.bench_function("dungeon_80cubed", |b| {
        let area = VoxelArea::new(IVec3::ZERO, IVec3::splat(79));
        let mut seed = 0;
        b.iter(|| {
            seed += 1;
            let mut vm = VoxelBuffer::with_area(area);
            vm.fill(&area, stone);
            black_box(dungeons.generate(&mut vm, seed, area.min, area.max))
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_node_access, benchmark_vmanip, benchmark_generation);
criterion_main!(benches);
