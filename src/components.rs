//! Entity data and player input types.
//!
//! Every simulated object is one flat [`Entity`] carrying a kind tag and the
//! union of all per-kind fields; subsystem passes dispatch with a `match` on
//! the tag. Cross-entity references are always [`EntityId`]s re-validated
//! through the arena, never direct pointers.

use std::collections::VecDeque;

use crate::arena::EntityId;
use crate::constants::{BATTERY_CAPACITY, LOCAL_INPUT_QUEUE_MAX};
use crate::math::V2;
use crate::physics::{BodyHandle, JointHandle, ShapeHandle};

/// What an entity is. Determines which fields of [`Entity`] are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// Ship hull root: one rigid body aggregating child boxes.
    Grid,
    /// One functional tile attached to a grid.
    Box,
    /// A player's free-floating body.
    Player,
    /// Gravitational (and possibly lethal) star.
    Sun,
    /// Self-propelled warhead.
    Missile,
    /// Transient blast volume.
    Explosion,
    /// Collectible drifting orb.
    Orb,
}

impl EntityKind {
    pub fn to_u8(self) -> u8 {
        match self {
            EntityKind::Grid => 0,
            EntityKind::Box => 1,
            EntityKind::Player => 2,
            EntityKind::Sun => 3,
            EntityKind::Missile => 4,
            EntityKind::Explosion => 5,
            EntityKind::Orb => 6,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => EntityKind::Grid,
            1 => EntityKind::Box,
            2 => EntityKind::Player,
            3 => EntityKind::Sun,
            4 => EntityKind::Missile,
            5 => EntityKind::Explosion,
            6 => EntityKind::Orb,
            _ => return None,
        })
    }
}

/// The functional role of a box tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxKind {
    Hullpiece,
    Thruster,
    Gyroscope,
    Battery,
    Cockpit,
    Medbay,
    SolarPanel,
    Scanner,
    Cloaking,
    MissileLauncher,
    Merge,
    Explosive,
    LandingGear,
}

impl BoxKind {
    pub const ALL: [BoxKind; 13] = [
        BoxKind::Hullpiece,
        BoxKind::Thruster,
        BoxKind::Gyroscope,
        BoxKind::Battery,
        BoxKind::Cockpit,
        BoxKind::Medbay,
        BoxKind::SolarPanel,
        BoxKind::Scanner,
        BoxKind::Cloaking,
        BoxKind::MissileLauncher,
        BoxKind::Merge,
        BoxKind::Explosive,
        BoxKind::LandingGear,
    ];

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    /// Bit used in a player's unlocked-box mask.
    pub fn mask(self) -> u16 {
        1 << (self as u16)
    }

    /// Can a player sit inside this box?
    pub fn is_seat(self) -> bool {
        matches!(self, BoxKind::Cockpit | BoxKind::Medbay)
    }
}

/// Team affiliation carried by players, boxes, and missiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Squad {
    #[default]
    None,
    Red,
    Green,
    Blue,
    Purple,
}

impl Squad {
    pub const COUNT: usize = 4;

    pub fn to_u8(self) -> u8 {
        match self {
            Squad::None => 0,
            Squad::Red => 1,
            Squad::Green => 2,
            Squad::Blue => 3,
            Squad::Purple => 4,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Squad::None,
            1 => Squad::Red,
            2 => Squad::Green,
            3 => Squad::Blue,
            4 => Squad::Purple,
            _ => return None,
        })
    }

    /// Squad for a 0-based index, used by the take-over action.
    pub fn from_index(index: u8) -> Option<Self> {
        Self::from_u8(index.checked_add(1)?)
    }
}

/// Category tag on a scanner return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScannerCategory {
    #[default]
    Neutral,
    Enemy,
    Platonic,
}

impl ScannerCategory {
    pub fn to_u8(self) -> u8 {
        match self {
            ScannerCategory::Neutral => 0,
            ScannerCategory::Enemy => 1,
            ScannerCategory::Platonic => 2,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => ScannerCategory::Neutral,
            1 => ScannerCategory::Enemy,
            2 => ScannerCategory::Platonic,
            _ => return None,
        })
    }
}

/// One sweep return: position relative to the scanner, categorized.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScannerPoint {
    pub relative_pos: V2,
    pub category: ScannerCategory,
}

/// Long-range bearing toward a platonic box.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DetectedPlatonic {
    /// Unit direction from the scanner.
    pub direction: V2,
    /// 1/distance falloff, clamped to [0, 1].
    pub intensity: f64,
}

/// One player's intended actions for a single tick.
///
/// Movement fields are level-triggered; the action flags are edge-triggered
/// and latched by the client until the server has consumed them.
#[derive(Debug, Clone, PartialEq)]
pub struct InputFrame {
    /// Simulation tick this frame applies to.
    pub tick: u64,
    /// Monotonic per-client counter; the server adopts only fresher ids.
    pub id: u64,
    /// Desired movement direction, length <= 1.
    pub movement: V2,
    /// Desired ship rotation input, -1..1, meaningful while seated.
    pub rotation: f64,
    /// Build/interact hand position, local to the player.
    pub hand_pos: V2,
    pub dobuild: bool,
    pub build_type: BoxKind,
    /// Compass rotation (0..3) for the placed box.
    pub build_rotation: u8,
    pub seat_action: bool,
    pub interact_action: bool,
    pub invite_this_player: Option<EntityId>,
    pub accept_squad_invite: bool,
    pub reject_squad_invite: bool,
    /// 0-based squad index to claim, -1 for none.
    pub take_over_squad: i8,
}

impl Default for InputFrame {
    fn default() -> Self {
        Self {
            tick: 0,
            id: 0,
            movement: V2::ZERO,
            rotation: 0.0,
            hand_pos: V2::ZERO,
            dobuild: false,
            build_type: BoxKind::Hullpiece,
            build_rotation: 0,
            seat_action: false,
            interact_action: false,
            invite_this_player: None,
            accept_squad_invite: false,
            reject_squad_invite: false,
            take_over_squad: -1,
        }
    }
}

impl InputFrame {
    /// Fold a fresher frame for the same tick into this one. Event flags
    /// only ever go from false to true here; they are cleared when the
    /// simulation consumes them, never by later merges.
    pub fn merge_newer(&mut self, newer: &InputFrame) {
        debug_assert_eq!(self.tick, newer.tick);
        self.id = self.id.max(newer.id);
        self.movement = newer.movement;
        self.rotation = newer.rotation;
        self.hand_pos = newer.hand_pos;
        if newer.dobuild {
            self.dobuild = true;
            self.build_type = newer.build_type;
            self.build_rotation = newer.build_rotation;
        }
        self.seat_action |= newer.seat_action;
        self.interact_action |= newer.interact_action;
        if newer.invite_this_player.is_some() {
            self.invite_this_player = newer.invite_this_player;
        }
        self.accept_squad_invite |= newer.accept_squad_invite;
        self.reject_squad_invite |= newer.reject_squad_invite;
        if newer.take_over_squad >= 0 {
            self.take_over_squad = newer.take_over_squad;
        }
    }
}

/// Tick-indexed bounded input buffer, oldest first.
///
/// Used both for the client's committed queue (retransmitted whole in every
/// input packet) and for the server's per-slot pending inputs.
#[derive(Debug, Clone, Default)]
pub struct InputQueue {
    frames: VecDeque<InputFrame>,
}

impl InputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Append a committed frame, evicting the oldest when full.
    pub fn push(&mut self, frame: InputFrame) {
        if self.frames.len() >= LOCAL_INPUT_QUEUE_MAX {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Insert a received frame at its tick position, merging event flags
    /// when a frame for that tick already exists.
    pub fn merge(&mut self, frame: InputFrame) {
        match self.frames.iter_mut().find(|f| f.tick == frame.tick) {
            Some(existing) => {
                if frame.id >= existing.id {
                    existing.merge_newer(&frame);
                }
            }
            None => {
                let at = self
                    .frames
                    .iter()
                    .position(|f| f.tick > frame.tick)
                    .unwrap_or(self.frames.len());
                if self.frames.len() >= LOCAL_INPUT_QUEUE_MAX {
                    if at == 0 {
                        return; // older than everything we keep
                    }
                    self.frames.pop_front();
                    self.frames.insert(at - 1, frame);
                } else {
                    self.frames.insert(at, frame);
                }
            }
        }
    }

    /// Remove and return the frame for `tick`, discarding older frames.
    pub fn take_for_tick(&mut self, tick: u64) -> Option<InputFrame> {
        while let Some(front) = self.frames.front() {
            if front.tick < tick {
                self.frames.pop_front();
            } else {
                break;
            }
        }
        if self.frames.front().is_some_and(|f| f.tick == tick) {
            self.frames.pop_front()
        } else {
            None
        }
    }

    /// Find (without removing) the frame for `tick`.
    pub fn get_for_tick(&self, tick: u64) -> Option<&InputFrame> {
        self.frames.iter().find(|f| f.tick == tick)
    }

    pub fn most_recent(&self) -> Option<&InputFrame> {
        self.frames.back()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &InputFrame> {
        self.frames.iter()
    }

    /// Newest to oldest, the on-wire order.
    pub fn iter_newest_first(&self) -> impl Iterator<Item = &InputFrame> {
        self.frames.iter().rev()
    }
}

/// One fixed server seat for a connected player.
#[derive(Debug, Clone, Default)]
pub struct PlayerSlot {
    pub connected: bool,
    /// The player's body entity; absent between death and respawn.
    pub entity: Option<EntityId>,
    /// Set when a build action failed for capacity; serialized in the next
    /// snapshot to this player and then cleared.
    pub build_failed: bool,
}

/// The universal simulated object. `kind` decides which fields matter.
#[derive(Debug, Clone)]
pub struct Entity {
    pub kind: EntityKind,
    pub body: Option<BodyHandle>,
    pub shape: Option<ShapeHandle>,
    pub squad: Squad,
    /// Accumulated damage in [0, 1]; reaching 1 destroys the entity.
    pub damage: f64,

    // Grid
    /// Child boxes, in creation order.
    pub boxes: Vec<EntityId>,

    // Box
    pub box_kind: BoxKind,
    pub parent_grid: Option<EntityId>,
    /// Cell-center position in the grid's local frame.
    pub local_pos: V2,
    /// Facing in quarter turns, 0..3.
    pub compass_rotation: u8,
    pub energy_used: f64,
    pub thrust: f64,
    pub wanted_thrust: f64,
    pub sun_amount: f64,
    pub cloaking_power: f64,
    pub scanner_head_rotate: f64,
    pub player_who_is_inside_of_me: Option<EntityId>,
    pub landed_constraint: Option<JointHandle>,
    /// Tick before which the landing gear will not re-lock.
    pub landing_rearm_tick: u64,
    pub indestructible: bool,
    pub is_platonic: bool,
    pub detected_platonics: Vec<DetectedPlatonic>,
    pub scanner_points: Vec<ScannerPoint>,
    pub missile_construction_charge: f64,

    // Player
    pub currently_inside_of_box: Option<EntityId>,
    pub squad_invited_to: Squad,
    /// The input frame applied to this player this tick.
    pub input: InputFrame,
    /// Bitmask over [`BoxKind`]; see [`Entity::box_unlocked`].
    pub unlocked_boxes: u16,
    /// Display name, bounded by MAX_PLAYER_NAME_LEN on the wire.
    pub name: String,

    // Sun
    pub sun_radius: f64,
    pub sun_mass: f64,
    pub sun_is_safe: bool,

    // Missile
    pub burn_remaining: f64,

    // Explosion (body-less: position integrated by hand)
    pub pos: V2,
    pub vel: V2,
    pub explosion_progress: f64,
    pub explosion_radius: f64,
}

impl Entity {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            body: None,
            shape: None,
            squad: Squad::None,
            damage: 0.0,
            boxes: Vec::new(),
            box_kind: BoxKind::Hullpiece,
            parent_grid: None,
            local_pos: V2::ZERO,
            compass_rotation: 0,
            energy_used: 0.0,
            thrust: 0.0,
            wanted_thrust: 0.0,
            sun_amount: 0.0,
            cloaking_power: 0.0,
            scanner_head_rotate: 0.0,
            player_who_is_inside_of_me: None,
            landed_constraint: None,
            landing_rearm_tick: 0,
            indestructible: false,
            is_platonic: false,
            detected_platonics: Vec::new(),
            scanner_points: Vec::new(),
            missile_construction_charge: 0.0,
            currently_inside_of_box: None,
            squad_invited_to: Squad::None,
            input: InputFrame::default(),
            unlocked_boxes: u16::MAX,
            name: String::new(),
            sun_radius: 0.0,
            sun_mass: 0.0,
            sun_is_safe: false,
            burn_remaining: 0.0,
            pos: V2::ZERO,
            vel: V2::ZERO,
            explosion_progress: 0.0,
            explosion_radius: 0.0,
        }
    }

    pub fn box_unlocked(&self, kind: BoxKind) -> bool {
        self.unlocked_boxes & kind.mask() != 0
    }

    /// Remaining battery headroom, for deposit passes.
    pub fn battery_free(&self) -> f64 {
        (BATTERY_CAPACITY - self.energy_used).max(0.0)
    }

    /// World-frame facing of a box given its grid's rotation.
    pub fn box_facing(&self, grid_rotation: f64) -> V2 {
        let quarter = std::f64::consts::FRAC_PI_2 * f64::from(self.compass_rotation);
        V2::from_angle(grid_rotation + quarter)
    }
}
