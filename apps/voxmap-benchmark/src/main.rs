//! Voxmap world pipeline benchmark.
//!
//! Generates a patch of world inline and on the mapgen worker, runs liquid
//! passes, saves and sweeps, logging timings for each stage.
//!
//! Usage: voxmap-benchmark [world.toml]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;
use voxmap_core::{BlockPos, NodeRegistry};
use voxmap_world::{
    DefaultMapgen, MapgenWorker, MemoryDatabase, ModifiedState, ServerMap, WorldConfig,
};

/// Blocks per axis of each generated patch.
const PATCH: i32 = 10;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => WorldConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => WorldConfig::default(),
    };
    info!(seed = config.seed, chunk_size = config.mapgen.chunk_size, "Voxmap benchmark");

    let registry = Arc::new(NodeRegistry::with_defaults());
    let mapgen = Arc::new(DefaultMapgen::new(&config, Arc::clone(&registry))?);
    let mut server = ServerMap::new(config, registry, Box::new(MemoryDatabase::new()));

    // Inline generation
    let start = Instant::now();
    request_patch(&mut server, 0);
    let mut served = 0;
    while server.emerge_queue_len() > 0 {
        served += server.process_emerge_queue(64, &*mapgen).len();
    }
    info!(
        served,
        blocks = server.lock().block_count(),
        elapsed_ms = start.elapsed().as_millis(),
        "Inline generation"
    );

    // Worker generation
    let start = Instant::now();
    let mut worker = MapgenWorker::spawn(mapgen.clone())?;
    request_patch(&mut server, PATCH);
    let mut chunks = 0;
    while let Some(pos) = server.pop_emerge_request() {
        if server.lock().get_block(pos).is_some_and(|b| b.is_generated()) {
            continue;
        }
        let Some(data) = server.init_block_make(pos) else {
            continue;
        };
        let mut batch = vec![data];
        while let Err(returned) = worker.send(batch) {
            batch = returned;
            if let Some(done) = worker.recv_timeout(Duration::from_millis(50)) {
                server.finish_block_make(done);
            }
        }
        chunks += 1;
    }
    while worker.in_flight() > 0 {
        let done = worker
            .recv_timeout(Duration::from_secs(120))
            .context("mapgen worker stopped responding")?;
        server.finish_block_make(done);
    }
    worker.shutdown();
    info!(
        chunks,
        blocks = server.lock().block_count(),
        elapsed_ms = start.elapsed().as_millis(),
        "Worker generation"
    );

    // Liquids
    let start = Instant::now();
    let mut modified = BTreeSet::new();
    let mut processed = 0;
    for _ in 0..20 {
        processed += server.transform_liquids(0.1, &mut modified).processed;
    }
    info!(
        processed,
        modified_blocks = modified.len(),
        remaining = server.transforming_liquid_len(),
        elapsed_ms = start.elapsed().as_millis(),
        "Liquid passes"
    );

    // Persistence
    let start = Instant::now();
    let saved = server.save(ModifiedState::WriteNeeded);
    let timeout = server.config().map.unload_timeout;
    let mut unloaded = Vec::new();
    let sweep = server.timer_update(timeout + 1.0, &mut unloaded);
    info!(
        saved = saved.saved,
        failed = saved.failed,
        unloaded = sweep.unloaded,
        remaining = sweep.remaining,
        elapsed_ms = start.elapsed().as_millis(),
        "Save and sweep"
    );

    Ok(())
}

/// Queue a `PATCH`-sized square of blocks around y = 0, offset along x.
fn request_patch(server: &mut ServerMap, x_offset: i32) {
    for z in 0..PATCH {
        for x in 0..PATCH {
            for y in -1..=1 {
                server.get_block_or_emerge(BlockPos::new(x + x_offset, y, z));
            }
        }
    }
}
