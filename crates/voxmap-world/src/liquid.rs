//! Liquid transform scheduling.
//!
//! Positions whose liquid state may change sit in a [`UniqueQueue`]. Each
//! pass pops a bounded batch, computes every new state against the map as it
//! was at the start of the batch, applies the changes and only then queues
//! the neighbours of changed cells.
//!
//! Flowing liquids store their level in `param2 & 0x07` and a falling flag in
//! `0x08`.

use std::collections::BTreeSet;

use glam::IVec3;
use tracing::{debug, trace_span, warn};
use voxmap_core::{BlockPos, ContentId, LiquidType, Node, NodeRegistry, UniqueQueue};

use crate::config::LiquidConfig;
use crate::map::Map;

/// Highest flowing level.
pub const LIQUID_LEVEL_MAX: u8 = 7;
const LEVEL_MASK: u8 = 0x07;
const FALLING_FLAG: u8 = 0x08;

const HORIZONTAL: [IVec3; 4] = [IVec3::X, IVec3::NEG_X, IVec3::Z, IVec3::NEG_Z];
const NEIGHBORS: [IVec3; 6] = [
    IVec3::X,
    IVec3::NEG_X,
    IVec3::Y,
    IVec3::NEG_Y,
    IVec3::Z,
    IVec3::NEG_Z,
];

/// Outcome of one transform pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiquidReport {
    /// Entries popped this pass.
    pub processed: usize,
    /// Nodes actually rewritten.
    pub changed: usize,
    /// Entries discarded by the backpressure valve.
    pub dropped: usize,
    /// Queue length after the pass.
    pub queue_len: usize,
    /// Budget multiplier used for this pass.
    pub budget_multiplier: u32,
}

/// Flowing level stored in a node.
#[inline]
pub fn liquid_level(node: Node) -> u8 {
    node.param2 & LEVEL_MASK
}

#[inline]
pub fn is_falling(node: Node) -> bool {
    node.param2 & FALLING_FLAG != 0
}

/// A flowing node of `content` at `level`.
pub fn flowing_node(content: ContentId, level: u8, falling: bool) -> Node {
    let mut param2 = level.min(LIQUID_LEVEL_MAX);
    if falling {
        param2 |= FALLING_FLAG;
    }
    Node::with_params(content, 0, param2)
}

/// Source and flowing content of one liquid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LiquidKind {
    source: ContentId,
    flowing: ContentId,
}

impl LiquidKind {
    fn of(registry: &NodeRegistry, content: ContentId) -> Option<Self> {
        if !registry.get(content).is_liquid() {
            return None;
        }
        Some(Self {
            source: registry.source_of(content)?,
            flowing: registry.flowing_of(content)?,
        })
    }

    fn contains(self, content: ContentId) -> bool {
        content == self.source || content == self.flowing
    }
}

/// What recomputing one cell produced.
enum Step {
    Unchanged,
    /// A source; its open neighbours need a look.
    Source,
    Change(Node),
}

/// Queue of positions awaiting a liquid update, with its backpressure state.
#[derive(Debug, Clone)]
pub struct LiquidQueue {
    queue: UniqueQueue<IVec3>,
    config: LiquidConfig,
    last_len: usize,
    /// Seconds the queue has kept growing.
    trend_timer: f32,
    multiplier: u32,
}

impl LiquidQueue {
    pub fn new(config: LiquidConfig) -> Self {
        Self {
            queue: UniqueQueue::new(),
            config,
            last_len: 0,
            trend_timer: 0.0,
            multiplier: 1,
        }
    }

    /// Queue a position; returns false if it was already queued.
    pub fn push(&mut self, pos: IVec3) -> bool {
        self.queue.push_back(pos)
    }

    pub fn contains(&self, pos: IVec3) -> bool {
        self.queue.contains(&pos)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn budget_multiplier(&self) -> u32 {
        self.multiplier
    }

    /// Update the growth trend and return this pass's budget and the number
    /// of entries dropped.
    fn plan(&mut self, dt: f32) -> (usize, usize) {
        let len = self.queue.len();
        if len > self.last_len {
            self.trend_timer += dt;
            if self.trend_timer > self.config.grace_period {
                self.multiplier = (self.multiplier * 2).min(self.config.max_budget_multiplier.max(1));
                self.trend_timer = 0.0;
            }
        } else {
            self.trend_timer = 0.0;
            self.multiplier = 1;
        }

        let mut dropped = 0;
        if self.multiplier >= self.config.max_budget_multiplier && len > self.config.max_queue_len {
            dropped = self.queue.truncate_front(self.config.loop_max);
            warn!(
                dropped,
                max_queue_len = self.config.max_queue_len,
                "Liquid queue overflow; dropped oldest entries"
            );
        }
        self.last_len = self.queue.len();

        let budget = (self.config.loop_max * self.multiplier as usize).min(self.queue.len());
        (budget, dropped)
    }

    /// Run one pass over `map`, collecting the blocks it changed.
    pub fn transform(
        &mut self,
        map: &mut Map,
        registry: &NodeRegistry,
        dt: f32,
        modified: &mut BTreeSet<BlockPos>,
    ) -> LiquidReport {
        let (budget, dropped) = self.plan(dt);
        let _span = trace_span!("transform_liquids", budget).entered();

        let mut changes = Vec::new();
        let mut wake = Vec::new();
        let mut processed = 0;
        for _ in 0..budget {
            let Some(pos) = self.queue.pop_front() else {
                break;
            };
            processed += 1;
            match recompute(map, registry, pos) {
                Step::Unchanged => {}
                Step::Source => wake.extend(
                    HORIZONTAL
                        .iter()
                        .chain(&[IVec3::NEG_Y])
                        .map(|d| pos + *d)
                        .filter(|p| map.get_node(*p).is_some_and(|n| registry.get(n.content).floodable)),
                ),
                Step::Change(node) => changes.push((pos, node)),
            }
        }

        let mut changed = 0;
        for (pos, node) in changes {
            if map.set_node(pos, node).is_err() {
                continue;
            }
            changed += 1;
            modified.insert(BlockPos::containing(pos));
            wake.extend(NEIGHBORS.iter().map(|d| pos + *d).filter(|p| {
                map.get_node(*p).is_some_and(|n| {
                    let f = registry.get(n.content);
                    f.floodable || f.is_liquid()
                })
            }));
        }
        for pos in wake {
            self.queue.push_back(pos);
        }

        let report = LiquidReport {
            processed,
            changed,
            dropped,
            queue_len: self.queue.len(),
            budget_multiplier: self.multiplier,
        };
        if changed > 0 {
            debug!(
                processed,
                changed,
                queue_len = report.queue_len,
                multiplier = self.multiplier,
                "Liquid pass"
            );
        }
        report
    }
}

/// Whether liquid can descend into `node` (so a liquid resting on it does
/// not spread sideways).
fn can_descend_into(registry: &NodeRegistry, kind: LiquidKind, node: Node) -> bool {
    node.content == kind.flowing || registry.get(node.content).floodable
}

/// Recompute the liquid state at `pos` from its six neighbours.
fn recompute(map: &Map, registry: &NodeRegistry, pos: IVec3) -> Step {
    let Some(node) = map.get_node(pos) else {
        return Step::Unchanged;
    };
    let features = registry.get(node.content);
    let kind = match features.liquid_type {
        LiquidType::Source => return Step::Source,
        LiquidType::Flowing => LiquidKind::of(registry, node.content),
        LiquidType::None if features.floodable => std::iter::once(IVec3::Y)
            .chain(HORIZONTAL)
            .find_map(|d| LiquidKind::of(registry, map.get_node_or_ignore(pos + d).content)),
        LiquidType::None => None,
    };
    let Some(kind) = kind else {
        return Step::Unchanged;
    };

    let flowing = registry.get(kind.flowing);
    let range = i32::from(flowing.liquid_range.clamp(1, 8));

    let mut sources = 0;
    let mut max_level: i32 = -1;
    for d in HORIZONTAL {
        let nb = map.get_node_or_ignore(pos + d);
        if nb.content == kind.source {
            sources += 1;
            max_level = i32::from(LIQUID_LEVEL_MAX);
        } else if nb.content == kind.flowing && liquid_level(nb) > 0 {
            let below = map.get_node_or_ignore(pos + d - IVec3::Y);
            if !can_descend_into(registry, kind, below) && !below.is_ignore() {
                max_level = max_level.max(i32::from(liquid_level(nb)) - 1);
            }
        }
    }

    if sources >= 2 && flowing.liquid_renewable {
        let below = map.get_node_or_ignore(pos - IVec3::Y);
        if below.content == kind.source || (!below.is_ignore() && !can_descend_into(registry, kind, below)) {
            return changed_to(node, Node::new(kind.source));
        }
    }

    let above = map.get_node_or_ignore(pos + IVec3::Y);
    let falling = kind.contains(above.content);
    if falling {
        max_level = i32::from(LIQUID_LEVEL_MAX);
    }

    let new = if max_level < 0 || max_level < 8 - range {
        if features.liquid_type == LiquidType::Flowing {
            Node::AIR
        } else {
            return Step::Unchanged;
        }
    } else {
        flowing_node(kind.flowing, max_level as u8, falling)
    };
    changed_to(node, new)
}

fn changed_to(old: Node, new: Node) -> Step {
    if old == new {
        Step::Unchanged
    } else {
        Step::Change(new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MapBlock;
    use voxmap_voxel::NodeStore;

    struct World {
        map: Map,
        registry: NodeRegistry,
        stone: Node,
        water: ContentId,
        water_flowing: ContentId,
    }

    /// One air block over one stone block, both around the origin.
    fn world() -> World {
        let registry = NodeRegistry::with_defaults();
        let stone = Node::new(registry.require("default:stone").unwrap());
        let mut map = Map::default();
        map.insert_block(MapBlock::with_nodes(
            BlockPos::new(0, 0, 0),
            NodeStore::filled(Node::AIR),
        ))
        .unwrap();
        map.insert_block(MapBlock::with_nodes(
            BlockPos::new(0, -1, 0),
            NodeStore::filled(stone),
        ))
        .unwrap();
        World {
            water: registry.require("default:water_source").unwrap(),
            water_flowing: registry.require("default:water_flowing").unwrap(),
            map,
            registry,
            stone,
        }
    }

    fn run(world: &mut World, queue: &mut LiquidQueue, passes: usize) -> BTreeSet<BlockPos> {
        let mut modified = BTreeSet::new();
        for _ in 0..passes {
            queue.transform(&mut world.map, &world.registry, 0.1, &mut modified);
        }
        modified
    }

    #[test]
    fn queue_is_unique() {
        let mut queue = LiquidQueue::new(LiquidConfig::default());
        assert!(queue.push(IVec3::ZERO));
        assert!(!queue.push(IVec3::ZERO));
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(IVec3::ZERO));
    }

    #[test]
    fn source_spreads_with_decreasing_levels() {
        let mut w = world();
        let src = IVec3::new(8, 0, 8);
        w.map.set_node(src, Node::new(w.water)).unwrap();
        let mut queue = LiquidQueue::new(LiquidConfig::default());
        queue.push(src);

        let modified = run(&mut w, &mut queue, 20);
        assert!(modified.contains(&BlockPos::new(0, 0, 0)));

        let n1 = w.map.get_node(src + IVec3::X).unwrap();
        assert_eq!(n1.content, w.water_flowing);
        assert_eq!(liquid_level(n1), 7);
        let n2 = w.map.get_node(src + IVec3::new(2, 0, 0)).unwrap();
        assert_eq!(liquid_level(n2), 6);
        let n3 = w.map.get_node(src + IVec3::new(3, 0, 0)).unwrap();
        assert_eq!(liquid_level(n3), 5);
        // Nothing flows upward
        assert_eq!(w.map.get_node(src + IVec3::Y), Some(Node::AIR));
        // The source itself never changes
        assert_eq!(w.map.get_node(src), Some(Node::new(w.water)));
    }

    #[test]
    fn flow_stops_at_range() {
        let mut w = world();
        let src = IVec3::new(0, 0, 8);
        w.map.set_node(src, Node::new(w.water)).unwrap();
        let mut queue = LiquidQueue::new(LiquidConfig::default());
        queue.push(src);
        run(&mut w, &mut queue, 40);

        // Range 8 reaches level 0 at distance 8 and no further
        let last = w.map.get_node(src + IVec3::new(8, 0, 0)).unwrap();
        assert_eq!(last.content, w.water_flowing);
        assert_eq!(liquid_level(last), 0);
        assert_eq!(w.map.get_node(src + IVec3::new(9, 0, 0)), Some(Node::AIR));
        assert!(queue.is_empty());
    }

    #[test]
    fn liquid_falls() {
        let mut w = world();
        let src = IVec3::new(4, 5, 4);
        w.map.set_node(src, Node::new(w.water)).unwrap();
        w.map.set_node(src - IVec3::Y, Node::AIR).unwrap();
        let mut queue = LiquidQueue::new(LiquidConfig::default());
        queue.push(src);
        run(&mut w, &mut queue, 10);

        let below = w.map.get_node(src - IVec3::Y).unwrap();
        assert_eq!(below.content, w.water_flowing);
        assert!(is_falling(below));
        let ground = w.map.get_node(IVec3::new(4, 0, 4)).unwrap();
        assert_eq!(ground.content, w.water_flowing);
        // Water only spreads sideways where it rests on something
        assert_eq!(w.map.get_node(src + IVec3::new(2, -1, 0)), Some(Node::AIR));
        let spread = w.map.get_node(IVec3::new(6, 0, 4)).unwrap();
        assert_eq!(spread.content, w.water_flowing);
    }

    #[test]
    fn renewable_between_two_sources() {
        let mut w = world();
        let a = IVec3::new(4, 0, 4);
        let b = IVec3::new(6, 0, 4);
        w.map.set_node(a, Node::new(w.water)).unwrap();
        w.map.set_node(b, Node::new(w.water)).unwrap();
        let mut queue = LiquidQueue::new(LiquidConfig::default());
        queue.push(a);
        queue.push(b);
        run(&mut w, &mut queue, 5);
        assert_eq!(w.map.get_node(IVec3::new(5, 0, 4)), Some(Node::new(w.water)));
    }

    #[test]
    fn orphaned_flow_dries_up() {
        let mut w = world();
        let p = IVec3::new(3, 0, 3);
        w.map.set_node(p, flowing_node(w.water_flowing, 5, false)).unwrap();
        let mut queue = LiquidQueue::new(LiquidConfig::default());
        queue.push(p);
        run(&mut w, &mut queue, 1);
        assert_eq!(w.map.get_node(p), Some(Node::AIR));
        assert_eq!(w.map.get_node(p - IVec3::Y), Some(w.stone));
    }

    #[test]
    fn batch_is_bounded_by_budget() {
        let mut w = world();
        let config = LiquidConfig {
            loop_max: 3,
            ..LiquidConfig::default()
        };
        let mut queue = LiquidQueue::new(config);
        for x in 0..10 {
            queue.push(IVec3::new(x, 0, 0));
        }
        let mut modified = BTreeSet::new();
        let report = queue.transform(&mut w.map, &w.registry, 0.1, &mut modified);
        assert_eq!(report.processed, 3);
        assert_eq!(report.queue_len, 7);
        assert!(modified.is_empty());
    }

    #[test]
    fn backpressure_escalates_then_relaxes_and_drops() {
        let config = LiquidConfig {
            loop_max: 1,
            max_queue_len: 5,
            grace_period: 0.5,
            max_budget_multiplier: 4,
        };
        let mut w = world();
        let mut queue = LiquidQueue::new(config);
        let mut modified = BTreeSet::new();
        let mut next = 0;
        let mut multipliers = Vec::new();
        let mut dropped = 0;
        // Push faster than the base budget drains
        for _ in 0..12 {
            for _ in 0..6 {
                queue.push(IVec3::new(next, 40, 0));
                next += 1;
            }
            let report = queue.transform(&mut w.map, &w.registry, 0.3, &mut modified);
            multipliers.push(report.budget_multiplier);
            dropped += report.dropped;
        }
        assert!(multipliers.contains(&2));
        assert_eq!(*multipliers.last().unwrap(), 4);
        assert!(dropped > 0);

        // Once the queue shrinks the budget relaxes
        let report = queue.transform(&mut w.map, &w.registry, 0.3, &mut modified);
        assert_eq!(report.budget_multiplier, 1);
    }
}
