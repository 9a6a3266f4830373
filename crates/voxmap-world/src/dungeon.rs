//! Randomized dungeon carving inside a voxel buffer.
//!
//! A dungeon is a chain of box rooms joined by corridors. Generation works
//! purely on a [`VoxelBuffer`] and uses its per-cell flags to keep rooms,
//! corridors and earlier dungeons from being carved over:
//!
//! - [`INSIDE`]: carved space of a room, corridor or door.
//! - [`PRESERVE`]: room shells and anything the caller wants kept.
//! - [`FOREIGN`]: cells claimed by an earlier dungeon of the same pass;
//!   nothing writes them again.

use glam::{DVec3, IVec3};
use tracing::{debug, trace_span};
use voxmap_core::{ContentId, DrawType, NodeRegistry, Node, Result, VoxelArea};
use voxmap_voxel::{VoxelBuffer, VoxelFlags};

use crate::noise_params::NoiseParams;
use crate::random::PseudoRandom;

pub const INSIDE: VoxelFlags = VoxelFlags::CHECKED1;
pub const PRESERVE: VoxelFlags = VoxelFlags::CHECKED2;
pub const UNTOUCHABLE: VoxelFlags = INSIDE.union(PRESERVE);
pub const FOREIGN: VoxelFlags = VoxelFlags::CHECKED3;
/// Written by the dungeon currently being carved or an earlier one.
const CLAIMED: VoxelFlags = VoxelFlags::CHECKED4;

const FIRST_ROOM_TRIES: u32 = 100;
const DOOR_SEARCH_STEPS: u32 = 100;
const ROOM_DOOR_TRIES: u32 = 30;

/// Dungeon layout and materials.
#[derive(Debug, Clone, PartialEq)]
pub struct DungeonParams {
    /// Seed of the alternative wall noise.
    pub seed: u64,
    pub c_wall: ContentId,
    /// Replaces walls where `np_alt_wall` is positive; ignore disables it.
    pub c_alt_wall: ContentId,
    pub c_stair: ContentId,
    pub np_alt_wall: NoiseParams,
    pub num_dungeons: u32,
    /// Keep dungeons out of air, liquids and non-ground content.
    pub only_in_ground: bool,
    pub num_rooms: u32,
    pub room_size_min: IVec3,
    pub room_size_max: IVec3,
    pub room_size_large_min: IVec3,
    pub room_size_large_max: IVec3,
    /// 0 never makes large rooms, 1 only the first, n > 1 the first and
    /// then one in n.
    pub large_room_chance: u32,
    /// Cross section of corridors and doors.
    pub holesize: IVec3,
    pub corridor_len_min: i32,
    pub corridor_len_max: i32,
    pub diagonal_dirs: bool,
}

impl DungeonParams {
    /// Noise selecting where walls turn into the alternative material.
    pub const NP_ALT_WALL: NoiseParams =
        NoiseParams::new(-0.4, 1.0, DVec3::splat(40.0), 32474, 6, 1.1, 2.0);

    /// Default layout with the given materials.
    pub fn with_materials(c_wall: ContentId, c_alt_wall: ContentId, c_stair: ContentId) -> Self {
        Self {
            seed: 0,
            c_wall,
            c_alt_wall,
            c_stair,
            np_alt_wall: Self::NP_ALT_WALL,
            num_dungeons: 1,
            only_in_ground: true,
            num_rooms: 8,
            room_size_min: IVec3::new(4, 4, 4),
            room_size_max: IVec3::new(8, 6, 8),
            room_size_large_min: IVec3::new(8, 8, 8),
            room_size_large_max: IVec3::new(16, 16, 16),
            large_room_chance: 1,
            holesize: IVec3::new(1, 2, 1),
            corridor_len_min: 1,
            corridor_len_max: 13,
            diagonal_dirs: false,
        }
    }

    /// Cobble dungeons with mossy cobble patches and cobble stairs.
    pub fn from_registry(registry: &NodeRegistry) -> Result<Self> {
        let c_wall = registry.require("default:cobble")?;
        let c_alt_wall = registry.id("default:mossycobble").unwrap_or(ContentId::IGNORE);
        let c_stair = registry.id("stairs:stair_cobble").unwrap_or(c_wall);
        Ok(Self::with_materials(c_wall, c_alt_wall, c_stair))
    }
}

/// What a generation pass produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DungeonReport {
    /// Dungeons whose first room was placed.
    pub dungeons: u32,
    pub rooms: u32,
    /// Center of every room, one node above the floor.
    pub room_centers: Vec<IVec3>,
    /// Dungeons given up because no spot for the first room was found.
    pub abandoned: u32,
}

/// Dungeon generator for one parameter set.
#[derive(Debug, Clone)]
pub struct DungeonGen<'a> {
    registry: &'a NodeRegistry,
    params: DungeonParams,
}

impl<'a> DungeonGen<'a> {
    pub fn new(registry: &'a NodeRegistry, params: DungeonParams) -> Self {
        Self { registry, params }
    }

    pub fn params(&self) -> &DungeonParams {
        &self.params
    }

    /// Carve `num_dungeons` dungeons into `vm`.
    ///
    /// `node_min..=node_max` is the region being generated; it bounds the
    /// ground-only marking and the alternative wall pass. Rooms start at
    /// least one block in from the buffer's minimum corner so dungeons do
    /// not begin in a neighbouring chunk.
    pub fn generate(
        &self,
        vm: &mut VoxelBuffer,
        blockseed: u64,
        node_min: IVec3,
        node_max: IVec3,
    ) -> DungeonReport {
        if self.params.num_dungeons == 0 {
            return DungeonReport::default();
        }
        let _span = trace_span!("dungeon_generate", blockseed).entered();
        let region = VoxelArea::new(node_min, node_max);

        vm.clear_all_flags(UNTOUCHABLE | FOREIGN | CLAIMED);
        if self.params.only_in_ground {
            self.preserve_open_space(vm, &region);
        }

        let mut pass = DungeonPass::new(self, vm, PseudoRandom::new(blockseed.wrapping_add(2)));
        for _ in 0..self.params.num_dungeons {
            pass.make_dungeon(IVec3::splat(16));
        }
        let report = pass.report;

        if self.params.c_alt_wall != ContentId::IGNORE {
            self.apply_alt_walls(vm, &region);
        }
        debug!(
            dungeons = report.dungeons,
            rooms = report.rooms,
            abandoned = report.abandoned,
            "Generated dungeons"
        );
        report
    }

    /// Flag air, liquids, ignore and non-ground content as `PRESERVE`.
    fn preserve_open_space(&self, vm: &mut VoxelBuffer, region: &VoxelArea) {
        let clipped = region.intersection(&vm.area());
        for p in clipped.iter() {
            let features = self.registry.get(vm.get(p).content);
            let open = matches!(
                features.drawtype,
                DrawType::AirLike | DrawType::Liquid | DrawType::FlowingLiquid
            );
            if open || !features.is_ground_content {
                if let Some(flags) = vm.flags_mut(p) {
                    flags.insert(PRESERVE);
                }
            }
        }
    }

    fn apply_alt_walls(&self, vm: &mut VoxelBuffer, region: &VoxelArea) {
        let noise = self.params.np_alt_wall.field(self.params.seed);
        let clipped = region.intersection(&vm.area());
        for p in clipped.iter() {
            let Some(node) = vm.get_mut(p) else {
                continue;
            };
            if node.content == self.params.c_wall
                && noise.get_3d(f64::from(p.x), f64::from(p.y), f64::from(p.z)) > 0.0
            {
                node.content = self.params.c_alt_wall;
            }
        }
    }
}

/// Random walk state while carving dungeons into one buffer.
struct DungeonPass<'g, 'v> {
    params: &'g DungeonParams,
    vm: &'v mut VoxelBuffer,
    area: VoxelArea,
    random: PseudoRandom,
    /// Walker position and heading used by the door searches.
    pos: IVec3,
    dir: IVec3,
    report: DungeonReport,
}

impl<'g, 'v> DungeonPass<'g, 'v> {
    fn new(gen: &'g DungeonGen<'_>, vm: &'v mut VoxelBuffer, random: PseudoRandom) -> Self {
        let area = vm.area();
        Self {
            params: &gen.params,
            vm,
            area,
            random,
            pos: IVec3::ZERO,
            dir: IVec3::X,
            report: DungeonReport::default(),
        }
    }

    fn make_dungeon(&mut self, padding: IVec3) {
        self.mark_foreign();
        let extent = self.area.extent();

        let mut room_size = IVec3::ZERO;
        let mut room_place = IVec3::ZERO;
        let mut fits = false;
        for _ in 0..FIRST_ROOM_TRIES {
            room_size = if self.params.large_room_chance >= 1 {
                self.rand_size(self.params.room_size_large_min, self.params.room_size_large_max)
            } else {
                self.rand_size(self.params.room_size_min, self.params.room_size_max)
            };
            room_place = self.area.min + padding;
            room_place.z += self.random.range(0, extent.z - room_size.z - padding.z);
            room_place.y += self.random.range(0, extent.y - room_size.y - padding.y);
            room_place.x += self.random.range(0, extent.x - room_size.x - padding.x);
            if self.room_fits(room_place, room_size) {
                fits = true;
                break;
            }
        }
        if !fits {
            self.report.abandoned += 1;
            return;
        }
        self.report.dungeons += 1;

        let mut last_room_center = room_place + IVec3::new(room_size.x / 2, 1, room_size.z / 2);
        for i in 0..self.params.num_rooms {
            self.make_room(room_size, room_place);
            let room_center = room_place + IVec3::new(room_size.x / 2, 1, room_size.z / 2);
            self.report.rooms += 1;
            self.report.room_centers.push(room_center);

            if i + 1 == self.params.num_rooms {
                break;
            }

            // Corridors start from the previous room or the new one
            let start_in_last_room = self.random.range(0, 2) != 0;
            self.pos = if start_in_last_room {
                last_room_center
            } else {
                last_room_center = room_center;
                room_center
            };

            let Some((mut door_place, door_dir)) = self.find_place_for_door() else {
                return;
            };
            if self.random.range(0, 1) == 0 {
                self.make_hole(door_place);
            } else {
                door_place -= door_dir;
            }

            let (corridor_end, corridor_dir) = self.make_corridor(door_place, door_dir);

            let large = self.params.large_room_chance > 1
                && self.random.range(1, self.params.large_room_chance as i32) == 1;
            room_size = if large {
                self.rand_size(self.params.room_size_large_min, self.params.room_size_large_max)
            } else {
                self.rand_size(self.params.room_size_min, self.params.room_size_max)
            };

            self.pos = corridor_end;
            self.dir = corridor_dir;
            let Some((door_place, door_dir, place)) = self.find_place_for_room_door(room_size) else {
                return;
            };
            room_place = place;
            if self.random.range(0, 1) == 0 {
                self.make_hole(door_place);
            } else {
                room_place -= door_dir;
            }
        }
    }

    /// Turn everything earlier dungeons carved or walled into `FOREIGN`.
    fn mark_foreign(&mut self) {
        let area = self.area;
        for p in area.iter() {
            if let Some(flags) = self.vm.flags_mut(p) {
                if flags.contains(CLAIMED) && flags.intersects(UNTOUCHABLE) {
                    flags.insert(FOREIGN);
                }
            }
        }
    }

    fn room_fits(&self, place: IVec3, size: IVec3) -> bool {
        let room = VoxelArea::new(place, place + size - IVec3::ONE);
        self.area.contains_area(&room)
            && room.iter().all(|p| {
                !self.vm.flags(p).intersects(UNTOUCHABLE | FOREIGN) && !self.vm.get(p).is_ignore()
            })
    }

    fn rand_size(&mut self, min: IVec3, max: IVec3) -> IVec3 {
        IVec3::new(
            self.random.range(min.x, max.x),
            self.random.range(min.y, max.y),
            self.random.range(min.z, max.z),
        )
    }

    /// Write one cell unless it carries any of `avoid` (or is foreign).
    fn write(&mut self, p: IVec3, avoid: VoxelFlags, node: Node, or_flags: VoxelFlags) {
        let Some(flags) = self.vm.flags_mut(p) else {
            return;
        };
        if flags.intersects(avoid | FOREIGN) {
            return;
        }
        flags.insert(or_flags | CLAIMED);
        self.vm.set(p, node);
    }

    fn make_fill(&mut self, place: IVec3, size: IVec3, avoid: VoxelFlags, node: Node, or_flags: VoxelFlags) {
        for z in 0..size.z {
            for y in 0..size.y {
                for x in 0..size.x {
                    self.write(place + IVec3::new(x, y, z), avoid, node, or_flags);
                }
            }
        }
    }

    fn make_hole(&mut self, place: IVec3) {
        self.make_fill(place, self.params.holesize, VoxelFlags::empty(), Node::AIR, INSIDE);
    }

    fn make_room(&mut self, size: IVec3, place: IVec3) {
        let wall = Node::new(self.params.c_wall);
        for z in 0..size.z {
            for y in 0..size.y {
                for x in 0..size.x {
                    let p = place + IVec3::new(x, y, z);
                    let shell = x == 0
                        || y == 0
                        || z == 0
                        || x == size.x - 1
                        || y == size.y - 1
                        || z == size.z - 1;
                    if shell {
                        self.write(p, UNTOUCHABLE, wall, PRESERVE);
                    } else {
                        self.write(p, VoxelFlags::empty(), Node::AIR, INSIDE);
                    }
                }
            }
        }
    }

    /// Carve a corridor from `door_place`; returns where it ended and the
    /// direction it was heading.
    fn make_corridor(&mut self, door_place: IVec3, door_dir: IVec3) -> (IVec3, IVec3) {
        self.make_hole(door_place);
        let holesize = self.params.holesize;
        let wall = Node::new(self.params.c_wall);

        let mut p0 = door_place;
        let mut dir = door_dir;
        let length = self
            .random
            .range(self.params.corridor_len_min, self.params.corridor_len_max);
        let mut part_length = self
            .random
            .range(self.params.corridor_len_min, self.params.corridor_len_max);
        let mut part_count = 0;
        let mut make_stairs = self.roll_stairs(part_length);

        for i in 0..length {
            let mut p = p0 + dir;
            if part_count != 0 {
                p.y += make_stairs;
            }

            if !(self.area.contains(p) && self.area.contains(p + IVec3::Y)) {
                // Can't go here, turn away
                dir = turn_xz(dir, self.random.range(0, 1));
                make_stairs = -make_stairs;
                part_count = 0;
                part_length = self.random.range(1, length);
                continue;
            }

            if make_stairs == 0 {
                self.make_fill(p - IVec3::ONE, holesize + IVec3::splat(2), UNTOUCHABLE, wall, VoxelFlags::empty());
                self.make_hole(p);
            } else {
                self.make_fill(
                    p - IVec3::ONE,
                    holesize + IVec3::new(2, 3, 2),
                    UNTOUCHABLE,
                    wall,
                    VoxelFlags::empty(),
                );
                self.make_fill(p, holesize, UNTOUCHABLE, Node::AIR, INSIDE);
                self.make_fill(p - dir, holesize, UNTOUCHABLE, Node::AIR, INSIDE);

                // No stairs on the bottom step or on diagonal steps
                let axis_aligned = (dir.x ^ dir.z) & 1 != 0;
                let not_bottom = (make_stairs == 1 && i != 0) || (make_stairs == -1 && i != length - 1);
                if axis_aligned && not_bottom {
                    self.place_stairs(p, dir, make_stairs);
                }
            }
            p0 = p;

            part_count += 1;
            if part_count >= part_length {
                part_count = 0;
                dir = random_turn(&mut self.random, dir);
                part_length = self.random.range(1, length);
                make_stairs = self.roll_stairs(part_length);
            }
        }
        (p0, dir)
    }

    fn roll_stairs(&mut self, part_length: i32) -> i32 {
        if self.random.next_int() % 2 == 0 && part_length >= 3 {
            if self.random.next_int() % 2 == 0 {
                -1
            } else {
                1
            }
        } else {
            0
        }
    }

    fn place_stairs(&mut self, p: IVec3, dir: IVec3, make_stairs: i32) {
        // Stairs going down face backwards
        let stair = Node::with_params(self.params.c_stair, 0, dir_to_facedir(dir * make_stairs));
        let (width, step) = if dir.z != 0 {
            (self.params.holesize.x, IVec3::X)
        } else {
            (self.params.holesize.z, IVec3::Z)
        };

        let mut ps = p;
        for _ in 0..width {
            let target = if make_stairs == -1 {
                IVec3::new(ps.x - dir.x, ps.y - 1, ps.z - dir.z)
            } else {
                ps - IVec3::Y
            };
            let is_wall = self.vm.try_get(target).is_some_and(|n| n.content == self.params.c_wall);
            if is_wall {
                self.write(target, VoxelFlags::empty(), stair, UNTOUCHABLE);
            }
            ps += step;
        }
    }

    /// Walk from the current position looking for a two-high wall to put a
    /// door into. Returns the door position and the walking direction.
    fn find_place_for_door(&mut self) -> Option<(IVec3, IVec3)> {
        let c_wall = self.params.c_wall;
        for i in 0..DOOR_SEARCH_STEPS {
            let mut p = self.pos + self.dir;
            let p1 = p + IVec3::Y;
            if !self.area.contains(p) || !self.area.contains(p1) || i % 4 == 0 {
                self.randomize_dir();
                continue;
            }
            if self.content(p) == c_wall && self.content(p1) == c_wall {
                let found = (p, self.dir);
                self.randomize_dir();
                return Some(found);
            }

            // Step up or down if there is room
            if self.content(p) == c_wall
                && self.content(p + IVec3::Y) == ContentId::AIR
                && self.content(p + IVec3::new(0, 2, 0)) == ContentId::AIR
            {
                p += IVec3::Y;
            }
            if self.content(p + IVec3::Y) == c_wall
                && self.content(p) == ContentId::AIR
                && self.content(p - IVec3::Y) == ContentId::AIR
            {
                p -= IVec3::Y;
            }
            if self.content(p) != ContentId::AIR || self.content(p + IVec3::Y) != ContentId::AIR {
                self.randomize_dir();
                continue;
            }
            self.pos = p;
        }
        None
    }

    /// Find a door spot and a room of `room_size` behind it that does not
    /// overlap carved space. Returns door position, direction and room
    /// corner.
    fn find_place_for_room_door(&mut self, room_size: IVec3) -> Option<(IVec3, IVec3, IVec3)> {
        for _ in 0..ROOM_DOOR_TRIES {
            let Some((door_place, door_dir)) = self.find_place_for_door() else {
                continue;
            };
            let offset = match (door_dir.x, door_dir.z) {
                (1, 0) => IVec3::new(0, -1, self.random.range(-room_size.z + 2, -2)),
                (-1, 0) => IVec3::new(-room_size.x + 1, -1, self.random.range(-room_size.z + 2, -2)),
                (0, 1) => IVec3::new(self.random.range(-room_size.x + 2, -2), -1, 0),
                (0, -1) => IVec3::new(self.random.range(-room_size.x + 2, -2), -1, -room_size.z + 1),
                _ => continue,
            };
            let room_place = door_place + offset;
            if self.room_interior_free(room_place, room_size) {
                return Some((door_place, door_dir, room_place));
            }
        }
        None
    }

    fn room_interior_free(&self, place: IVec3, size: IVec3) -> bool {
        for z in 1..size.z - 1 {
            for y in 1..size.y - 1 {
                for x in 1..size.x - 1 {
                    let p = place + IVec3::new(x, y, z);
                    if !self.area.contains(p) || self.vm.flags(p).contains(INSIDE) {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn content(&self, p: IVec3) -> ContentId {
        self.vm.get(p).content
    }

    fn randomize_dir(&mut self) {
        self.dir = rand_ortho_dir(&mut self.random, self.params.diagonal_dirs);
    }
}

/// Random horizontal direction; diagonals are rare and only with
/// `diagonal_dirs`.
pub fn rand_ortho_dir(random: &mut PseudoRandom, diagonal_dirs: bool) -> IVec3 {
    if diagonal_dirs && random.next_int() % 4 == 0 {
        let mut dir = IVec3::ZERO;
        for _ in 0..10 {
            dir.z = random.next_int() % 3 - 1;
            dir.x = random.next_int() % 3 - 1;
            if dir.x != 0 && dir.z != 0 {
                break;
            }
        }
        return dir;
    }
    let negative = |random: &mut PseudoRandom| random.next_int() % 2 != 0;
    if random.next_int() % 2 == 0 {
        if negative(random) {
            IVec3::NEG_X
        } else {
            IVec3::X
        }
    } else if negative(random) {
        IVec3::NEG_Z
    } else {
        IVec3::Z
    }
}

/// Quarter turn in the XZ plane: `0` turns right, anything else left.
pub fn turn_xz(dir: IVec3, t: i32) -> IVec3 {
    if t == 0 {
        IVec3::new(dir.z, dir.y, -dir.x)
    } else {
        IVec3::new(-dir.z, dir.y, dir.x)
    }
}

/// Keep going straight, or turn right or left.
pub fn random_turn(random: &mut PseudoRandom, dir: IVec3) -> IVec3 {
    match random.range(0, 2) {
        0 => dir,
        1 => turn_xz(dir, 0),
        _ => turn_xz(dir, 1),
    }
}

/// Facing stored in a stair's `param2` for a horizontal direction.
pub fn dir_to_facedir(d: IVec3) -> u8 {
    if d.x.abs() > d.z.abs() {
        if d.x < 0 {
            3
        } else {
            1
        }
    } else if d.z < 0 {
        2
    } else {
        0
    }
}
