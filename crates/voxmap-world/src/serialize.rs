//! Block blob codec.
//!
//! Layout: `[version][flags][payload]`. Flag bit 0 marks an lz4 compressed
//! payload (size-prepended), bit 1 the generated flag. The payload is the
//! bincode encoding of the nodes and the metadata/timer side tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use voxmap_core::{BlockPos, Error, Node, Result};
use voxmap_voxel::NodeStore;

use crate::block::{MapBlock, NodeMetadata, NodeTimer};

/// Current blob format version.
pub const BLOCK_FORMAT_VERSION: u8 = 1;

const FLAG_COMPRESSED: u8 = 0b01;
const FLAG_GENERATED: u8 = 0b10;

#[derive(Serialize)]
struct PayloadRef<'a> {
    nodes: &'a [Node],
    metadata: Vec<(u16, &'a NodeMetadata)>,
    timers: Vec<(u16, &'a NodeTimer)>,
}

#[derive(Deserialize)]
struct Payload {
    nodes: Vec<Node>,
    metadata: Vec<(u16, NodeMetadata)>,
    timers: Vec<(u16, NodeTimer)>,
}

/// Encode a block. A `compression_level` of 0 stores the payload raw.
pub fn serialize_block(block: &MapBlock, compression_level: i32) -> Result<Vec<u8>> {
    let payload = PayloadRef {
        nodes: block.nodes().as_slice(),
        metadata: block.metadata_entries().collect(),
        timers: block.timer_entries().collect(),
    };
    let raw = bincode::serialize(&payload).map_err(|e| Error::Serialization(e.to_string()))?;

    let mut flags = 0;
    if block.is_generated() {
        flags |= FLAG_GENERATED;
    }
    let body = if compression_level == 0 {
        raw
    } else {
        flags |= FLAG_COMPRESSED;
        lz4_flex::compress_prepend_size(&raw)
    };

    let mut out = Vec::with_capacity(body.len() + 2);
    out.push(BLOCK_FORMAT_VERSION);
    out.push(flags);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a block blob into a clean (unmodified) block at `pos`.
pub fn deserialize_block(pos: BlockPos, data: &[u8]) -> Result<MapBlock> {
    let [version, flags, body @ ..] = data else {
        return Err(Error::InvalidData(format!("block {pos}: truncated blob")));
    };
    if *version != BLOCK_FORMAT_VERSION {
        return Err(Error::InvalidData(format!(
            "block {pos}: unsupported format version {version}"
        )));
    }

    let decompressed;
    let raw = if flags & FLAG_COMPRESSED != 0 {
        decompressed = lz4_flex::decompress_size_prepended(body)
            .map_err(|e| Error::Serialization(format!("block {pos}: {e}")))?;
        &decompressed[..]
    } else {
        body
    };

    let payload: Payload =
        bincode::deserialize(raw).map_err(|e| Error::Serialization(format!("block {pos}: {e}")))?;
    let nodes = NodeStore::from_vec(payload.nodes)
        .ok_or_else(|| Error::InvalidData(format!("block {pos}: wrong node count")))?;

    let mut block = MapBlock::with_nodes(pos, nodes);
    block.set_side_tables(
        payload.metadata.into_iter().collect::<BTreeMap<_, _>>(),
        payload.timers.into_iter().collect::<BTreeMap<_, _>>(),
    );
    block.restore_generated(flags & FLAG_GENERATED != 0);
    Ok(block)
}
