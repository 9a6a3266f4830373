//! End-to-end: configure a world, generate it, edit it, persist it and load
//! it back.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use glam::IVec3;
use parking_lot::Mutex;
use voxmap_core::{BlockPos, ContentId, Node, NodeRegistry};
use voxmap_world::{
    DefaultMapgen, EmergeStatus, MapEditEvent, MapEditEventKind, MapgenWorker, MemoryDatabase,
    ModifiedState, ServerMap, WorldConfig,
};

const CONFIG: &str = r#"
seed = 1337

[map]
unload_timeout = 5.0

[mapgen]
chunk_size = 2
dungeons_per_chunk = 1
"#;

fn world() -> (ServerMap, Arc<DefaultMapgen>) {
    let config = WorldConfig::from_toml_str(CONFIG).unwrap();
    let registry = Arc::new(NodeRegistry::with_defaults());
    let mapgen = Arc::new(DefaultMapgen::new(&config, Arc::clone(&registry)).unwrap());
    let server = ServerMap::new(config, registry, Box::new(MemoryDatabase::new()));
    (server, mapgen)
}

#[test]
fn generate_edit_save_reload() {
    let (mut server, mapgen) = world();
    let events = Arc::new(Mutex::new(Vec::<MapEditEvent>::new()));
    let sink = Arc::clone(&events);
    server
        .lock()
        .add_event_receiver(Box::new(move |e: &MapEditEvent| sink.lock().push(e.clone())));

    let origin = BlockPos::new(0, 0, 0);
    assert!(matches!(server.get_block_or_emerge(origin), EmergeStatus::Pending));
    assert_eq!(server.process_emerge_queue(4, &*mapgen), vec![origin]);
    assert_eq!(events.lock().len(), 1);
    assert_eq!(events.lock()[0].kind, MapEditEventKind::Other);

    let cobble = server.registry().require("default:cobble").unwrap();
    let marker = IVec3::new(3, 3, 3);
    server
        .lock()
        .add_node_with_event(marker, Node::new(cobble))
        .unwrap();
    assert_eq!(events.lock().last().unwrap().kind, MapEditEventKind::AddNode);

    let report = server.save(ModifiedState::WriteNeeded);
    assert_eq!(report.failed, 0);
    assert!(report.saved > 0);

    // Everything goes idle and is swept
    let mut unloaded = Vec::new();
    let sweep = server.timer_update(10.0, &mut unloaded);
    assert_eq!(sweep.failed_saves, 0);
    assert_eq!(server.lock().block_count(), 0);
    assert!(unloaded.contains(&origin));

    assert!(matches!(server.get_block_or_emerge(origin), EmergeStatus::Pending));
    server.process_emerge_queue(1, &*mapgen);
    let map = server.lock();
    assert_eq!(map.get_node(marker), Some(Node::new(cobble)));
    assert!(map.get_block(origin).is_some_and(|b| b.is_generated()));
}

#[test]
fn worker_pipeline_fills_requested_area() {
    let (mut server, mapgen) = world();
    let mut worker = MapgenWorker::spawn(mapgen).unwrap();

    for x in -1..3 {
        for z in -1..3 {
            server.get_block_or_emerge(BlockPos::new(x, 0, z));
        }
    }

    let mut batch = Vec::new();
    while let Some(pos) = server.pop_emerge_request() {
        if let Some(data) = server.init_block_make(pos) {
            batch.push(data);
        }
    }
    assert_eq!(batch.len(), 4);
    worker.send(batch).unwrap();

    let mut modified = BTreeSet::new();
    while worker.in_flight() > 0 {
        let data = worker.recv_timeout(Duration::from_secs(60)).unwrap();
        modified.extend(server.finish_block_make(data));
    }

    let map = server.lock();
    for x in -1..3 {
        for z in -1..3 {
            let pos = BlockPos::new(x, 0, z);
            assert!(modified.contains(&pos));
            let block = map.get_block(pos).unwrap();
            assert!(block.is_generated());
            assert!(!block.nodes().contains_content(ContentId::IGNORE));
        }
    }
}

#[test]
fn liquids_settle_within_budget() {
    let (mut server, mapgen) = world();
    server.get_block_or_emerge(BlockPos::new(0, 0, 0));
    server.process_emerge_queue(1, &*mapgen);

    let water = server.registry().require("default:water_source").unwrap();
    let spring = IVec3::new(0, 12, 0);
    {
        let mut map = server.lock();
        for x in -4..=4 {
            for z in -4..=4 {
                for y in 9..=14 {
                    map.set_node(IVec3::new(x, y, z), Node::AIR).unwrap();
                }
                let floor = server.registry().require("default:stone").unwrap();
                map.set_node(IVec3::new(x, 8, z), Node::new(floor)).unwrap();
            }
        }
        map.set_node(spring, Node::new(water)).unwrap();
    }
    server.transforming_liquid_add(spring);

    let mut modified = BTreeSet::new();
    for _ in 0..40 {
        let report = server.transform_liquids(0.1, &mut modified);
        assert!(report.processed <= server.config().liquid.loop_max);
    }
    let map = server.lock();
    assert_ne!(map.get_node_or_ignore(IVec3::new(1, 12, 0)), Node::AIR);
    assert_ne!(map.get_node_or_ignore(IVec3::new(0, 9, 0)), Node::AIR);
}
