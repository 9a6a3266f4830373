//! Background mapchunk generation.
//!
//! The owning thread prepares chunks with [`ServerMap::init_block_make`],
//! hands the detached data to a [`MapgenWorker`] and merges the results
//! with [`ServerMap::finish_block_make`] when they come back.
//!
//! [`ServerMap::init_block_make`]: crate::ServerMap::init_block_make
//! [`ServerMap::finish_block_make`]: crate::ServerMap::finish_block_make

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};
use voxmap_core::Result;

use crate::mapgen::{make_chunks_parallel, Mapgen};
use crate::server_map::BlockMakeData;

const REQUEST_QUEUE: usize = 16;
const RESULT_QUEUE: usize = 256;

/// Handle to the background mapgen thread.
pub struct MapgenWorker {
    /// Batches of chunks to generate. `None` once shut down.
    request_tx: Option<Sender<Vec<BlockMakeData>>>,
    /// Channel to receive generated chunks from the worker.
    result_rx: Receiver<BlockMakeData>,
    /// Tells the worker to stop taking batches and stop sending results.
    stop: Arc<AtomicBool>,
    /// Worker thread handle for joining on shutdown.
    thread: Option<JoinHandle<()>>,
    in_flight: usize,
}

impl MapgenWorker {
    /// Spawn a new worker thread running `mapgen`.
    pub fn spawn(mapgen: Arc<dyn Mapgen>) -> Result<Self> {
        let (request_tx, request_rx) = channel::bounded::<Vec<BlockMakeData>>(REQUEST_QUEUE);
        let (result_tx, result_rx) = channel::bounded::<BlockMakeData>(RESULT_QUEUE);
        let stop = Arc::new(AtomicBool::new(false));

        let worker_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("mapgen-worker".to_string())
            .spawn(move || {
                Self::worker_loop(&*mapgen, &request_rx, &result_tx, &worker_stop);
            })?;

        Ok(Self {
            request_tx: Some(request_tx),
            result_rx,
            stop,
            thread: Some(thread),
            in_flight: 0,
        })
    }

    /// Main worker loop - blocks waiting for batches until the request
    /// channel disconnects or a stop is requested.
    fn worker_loop(
        mapgen: &dyn Mapgen,
        request_rx: &Receiver<Vec<BlockMakeData>>,
        result_tx: &Sender<BlockMakeData>,
        stop: &AtomicBool,
    ) {
        while let Ok(mut chunks) = request_rx.recv() {
            if stop.load(Ordering::Acquire) {
                return;
            }
            make_chunks_parallel(mapgen, &mut chunks);
            for data in chunks {
                if stop.load(Ordering::Acquire) {
                    return;
                }
                // Blocks when the owner falls behind
                if result_tx.send(data).is_err() {
                    return;
                }
            }
        }
    }

    /// Queue chunks for generation without blocking.
    ///
    /// Hands the chunks back if the request queue is full or the worker
    /// is shut down.
    pub fn send(&mut self, chunks: Vec<BlockMakeData>) -> std::result::Result<(), Vec<BlockMakeData>> {
        let Some(request_tx) = self.request_tx.as_ref() else {
            return Err(chunks);
        };
        let count = chunks.len();
        match request_tx.try_send(chunks) {
            Ok(()) => {
                self.in_flight += count;
                Ok(())
            }
            Err(e) => Err(e.into_inner()),
        }
    }

    /// Take a generated chunk if one is ready.
    pub fn try_recv(&mut self) -> Option<BlockMakeData> {
        let data = self.result_rx.try_recv().ok()?;
        self.in_flight -= 1;
        Some(data)
    }

    /// Wait up to `timeout` for a generated chunk.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<BlockMakeData> {
        let data = self.result_rx.recv_timeout(timeout).ok()?;
        self.in_flight -= 1;
        Some(data)
    }

    /// Chunks sent but not yet received back.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Stop the worker thread and wait for it to finish.
    ///
    /// Queued batches are abandoned and undelivered results dropped. The
    /// worker may still finish the batch it is generating.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        // Disconnecting wakes a worker waiting for requests
        self.request_tx = None;
        // Keep the result channel moving so a worker blocked on send returns
        while !thread.is_finished() {
            match self.result_rx.recv_timeout(Duration::from_millis(10)) {
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if thread.join().is_err() {
            warn!("Mapgen worker panicked");
        }
        if self.in_flight > 0 {
            debug!(dropped = self.in_flight, "Mapgen worker stopped with chunks in flight");
            self.in_flight = 0;
        }
    }
}

impl Drop for MapgenWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
