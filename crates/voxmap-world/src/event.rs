//! Map edit events and their listeners.

use std::collections::BTreeSet;

use glam::IVec3;
use voxmap_core::{BlockPos, Node, VoxelArea};

/// Kind of change an edit event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapEditEventKind {
    /// A node was placed, replacing whatever was there.
    AddNode,
    /// A node was removed (replaced by air).
    RemoveNode,
    /// A node was replaced, keeping its metadata.
    SwapNode,
    NodeMetadataChanged,
    /// Any other change; `modified_blocks` names the affected blocks.
    Other,
}

/// One logical change to the map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEditEvent {
    pub kind: MapEditEventKind,
    pub pos: IVec3,
    pub node: Node,
    pub modified_blocks: BTreeSet<BlockPos>,
    /// Change that listeners outside the server should not see.
    pub private_change: bool,
}

impl MapEditEvent {
    fn node_event(kind: MapEditEventKind, pos: IVec3, node: Node) -> Self {
        Self {
            kind,
            pos,
            node,
            modified_blocks: BTreeSet::from([BlockPos::containing(pos)]),
            private_change: false,
        }
    }

    pub fn add_node(pos: IVec3, node: Node) -> Self {
        Self::node_event(MapEditEventKind::AddNode, pos, node)
    }

    pub fn remove_node(pos: IVec3) -> Self {
        Self::node_event(MapEditEventKind::RemoveNode, pos, Node::AIR)
    }

    pub fn swap_node(pos: IVec3, node: Node) -> Self {
        Self::node_event(MapEditEventKind::SwapNode, pos, node)
    }

    pub fn metadata_changed(pos: IVec3) -> Self {
        Self::node_event(MapEditEventKind::NodeMetadataChanged, pos, Node::IGNORE)
    }

    pub fn other(modified_blocks: BTreeSet<BlockPos>) -> Self {
        Self {
            kind: MapEditEventKind::Other,
            pos: IVec3::ZERO,
            node: Node::IGNORE,
            modified_blocks,
            private_change: false,
        }
    }

    /// Nodes possibly affected by the event.
    pub fn area(&self) -> VoxelArea {
        match self.kind {
            MapEditEventKind::AddNode
            | MapEditEventKind::RemoveNode
            | MapEditEventKind::SwapNode
            | MapEditEventKind::NodeMetadataChanged => VoxelArea::single(self.pos),
            MapEditEventKind::Other => {
                let mut area = VoxelArea::EMPTY;
                for pos in &self.modified_blocks {
                    area.add_area(&VoxelArea::of_block(*pos));
                }
                area
            }
        }
    }
}

/// Something that wants to hear about map edits.
pub trait MapEventReceiver {
    fn on_map_edit_event(&mut self, event: &MapEditEvent);
}

impl<F: FnMut(&MapEditEvent)> MapEventReceiver for F {
    fn on_map_edit_event(&mut self, event: &MapEditEvent) {
        self(event);
    }
}

/// Handle returned on registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiverId(pub(crate) u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_event_names_owning_block() {
        let event = MapEditEvent::add_node(IVec3::new(-1, 0, 17), Node::AIR);
        assert_eq!(
            event.modified_blocks,
            BTreeSet::from([BlockPos::new(-1, 0, 1)])
        );
        assert_eq!(event.area(), VoxelArea::single(IVec3::new(-1, 0, 17)));
    }

    #[test]
    fn other_event_area_spans_blocks() {
        let event = MapEditEvent::other(BTreeSet::from([
            BlockPos::new(0, 0, 0),
            BlockPos::new(1, 0, 2),
        ]));
        assert_eq!(
            event.area(),
            VoxelArea::new(IVec3::ZERO, IVec3::new(31, 15, 47))
        );
        assert!(MapEditEvent::other(BTreeSet::new()).area().is_empty());
    }
}
