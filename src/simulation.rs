//! The authoritative game simulation.
//!
//! [`GameState`] owns the entity arena, the physics world, and the player
//! slot table. [`GameState::step`] advances exactly one tick through a
//! fixed phase order: input application, player actions, the subsystem
//! passes, missiles, explosions, sun interaction, boundary cull, then the
//! physics step and the tick counter. The same function runs on the server
//! and inside client prediction, so it must never read clocks, sockets, or
//! ambient randomness.

use std::f64::consts::{FRAC_PI_2, TAU};

use rand::Rng;
use tracing::debug;

use crate::arena::{EntityArena, EntityId, OutOfEntities};
use crate::components::{
    BoxKind, DetectedPlatonic, Entity, EntityKind, InputFrame, InputQueue, PlayerSlot,
    ScannerCategory, ScannerPoint, Squad,
};
use crate::constants::*;
use crate::math::{grid_snapped, Aabb, V2};
use crate::physics::{BodyKind, PhysicsWorld};

/// The complete simulated world at one tick.
pub struct GameState {
    /// Monotonic tick counter, advanced exactly once per [`step`].
    ///
    /// [`step`]: GameState::step
    pub tick: u64,
    pub arena: EntityArena,
    pub physics: PhysicsWorld,
    pub players: [PlayerSlot; MAX_PLAYERS],
    /// Squad to restore when a dead player's body respawns.
    pub respawn_squads: [Squad; MAX_PLAYERS],
    /// Pending per-slot inputs, indexed by tick. Transient: never
    /// serialized, refilled by the server merge or the client predictor.
    pub input_buffers: [InputQueue; MAX_PLAYERS],
}

impl Default for GameState {
    fn default() -> Self {
        Self::new()
    }
}

impl GameState {
    pub fn new() -> Self {
        Self {
            tick: 0,
            arena: EntityArena::default(),
            physics: PhysicsWorld::new(),
            players: std::array::from_fn(|_| PlayerSlot::default()),
            respawn_squads: [Squad::None; MAX_PLAYERS],
            input_buffers: std::array::from_fn(|_| InputQueue::new()),
        }
    }

    /// Populate a fresh world: one safe sun off-center and a scatter of
    /// orbs. Runs once at server start, never inside [`GameState::step`].
    pub fn bootstrap(&mut self, rng: &mut impl Rng) {
        if let Ok(sun) = self.arena.new_entity(EntityKind::Sun) {
            if let Some(e) = self.arena.get_mut(sun) {
                e.pos = V2::new(120.0, 0.0);
                e.sun_radius = DEFAULT_SUN_RADIUS;
                e.sun_mass = DEFAULT_SUN_MASS;
                e.sun_is_safe = true;
            }
        }
        for _ in 0..BOOTSTRAP_ORB_COUNT {
            let pos = V2::new(rng.random_range(-60.0..60.0), rng.random_range(-60.0..60.0));
            if self.create_orb(pos).is_err() {
                break;
            }
        }
    }

    // ── Entity creation ───────────────────────────────────────────────────

    /// Create an empty grid (ship root) with its rigid body.
    pub fn create_grid(&mut self, pos: V2, rotation: f64) -> Result<EntityId, OutOfEntities> {
        let id = self.arena.new_entity(EntityKind::Grid)?;
        let body = self.physics.create_body(
            BodyKind::Dynamic,
            pos,
            rotation,
            BOX_MASS,
            BOX_MASS * BOX_SIZE * BOX_SIZE / 6.0,
            id.to_user_data(),
        );
        if let Some(e) = self.arena.get_mut(id) {
            e.body = Some(body);
        }
        Ok(id)
    }

    /// Attach a new box to `grid_id` at a grid-local cell position.
    pub fn create_box_on_grid(
        &mut self,
        grid_id: EntityId,
        kind: BoxKind,
        local_pos: V2,
        compass_rotation: u8,
    ) -> Result<EntityId, OutOfEntities> {
        let Some(grid) = self.arena.get(grid_id) else {
            return Err(OutOfEntities);
        };
        let Some(grid_body) = grid.body else {
            return Err(OutOfEntities);
        };
        let squad = grid.squad;
        let id = self.arena.new_entity(EntityKind::Box)?;
        let shape = self.physics.attach_box_shape(
            grid_body,
            V2::new(BOX_SIZE / 2.0, BOX_SIZE / 2.0),
            local_pos,
            0.0,
            id.to_user_data(),
        );
        if let Some(e) = self.arena.get_mut(id) {
            e.box_kind = kind;
            e.parent_grid = Some(grid_id);
            e.local_pos = local_pos;
            e.compass_rotation = compass_rotation % 4;
            e.shape = Some(shape);
            e.squad = squad;
        }
        if let Some(grid) = self.arena.get_mut(grid_id) {
            grid.boxes.push(id);
        }
        self.recalc_grid_mass(grid_id);
        Ok(id)
    }

    /// Create a player body for a slot, optionally at a squad medbay.
    pub fn create_player_body(&mut self, slot: usize) -> Result<EntityId, OutOfEntities> {
        let squad = self.respawn_squads[slot];
        let spawn = self
            .squad_medbay_pos(squad)
            .unwrap_or(V2::new(-2.0 - BOX_SIZE * 2.0 * slot as f64, 0.0));
        let id = self.arena.new_entity(EntityKind::Player)?;
        let body = self.physics.create_body(
            BodyKind::Dynamic,
            spawn,
            0.0,
            PLAYER_MASS,
            PLAYER_MASS * PLAYER_HALF_SIZE * PLAYER_HALF_SIZE,
            id.to_user_data(),
        );
        let shape = self.physics.attach_box_shape(
            body,
            V2::new(PLAYER_HALF_SIZE, PLAYER_HALF_SIZE),
            V2::ZERO,
            0.0,
            id.to_user_data(),
        );
        if let Some(e) = self.arena.get_mut(id) {
            e.body = Some(body);
            e.shape = Some(shape);
            e.squad = squad;
            // Deterministic default so client-predicted respawns agree
            // with the server byte for byte.
            e.name = format!("pilot-{slot}");
        }
        self.players[slot].entity = Some(id);
        Ok(id)
    }

    pub fn create_missile(
        &mut self,
        pos: V2,
        rotation: f64,
        vel: V2,
        squad: Squad,
    ) -> Result<EntityId, OutOfEntities> {
        let id = self.arena.new_entity(EntityKind::Missile)?;
        let body = self.physics.create_body(
            BodyKind::Dynamic,
            pos,
            rotation,
            MISSILE_MASS,
            MISSILE_MASS * BOX_SIZE * BOX_SIZE / 24.0,
            id.to_user_data(),
        );
        let shape = self.physics.attach_box_shape(
            body,
            V2::new(BOX_SIZE / 4.0, BOX_SIZE / 8.0),
            V2::ZERO,
            0.0,
            id.to_user_data(),
        );
        self.physics.set_body_linvel(body, vel);
        if let Some(e) = self.arena.get_mut(id) {
            e.body = Some(body);
            e.shape = Some(shape);
            e.squad = squad;
            e.burn_remaining = MISSILE_BURN_TIME;
        }
        Ok(id)
    }

    pub fn create_orb(&mut self, pos: V2) -> Result<EntityId, OutOfEntities> {
        let id = self.arena.new_entity(EntityKind::Orb)?;
        let body = self.physics.create_body(
            BodyKind::Dynamic,
            pos,
            0.0,
            ORB_MASS,
            ORB_MASS * ORB_RADIUS * ORB_RADIUS,
            id.to_user_data(),
        );
        let shape = self.physics.attach_box_shape(
            body,
            V2::new(ORB_RADIUS, ORB_RADIUS),
            V2::ZERO,
            0.0,
            id.to_user_data(),
        );
        if let Some(e) = self.arena.get_mut(id) {
            e.body = Some(body);
            e.shape = Some(shape);
        }
        Ok(id)
    }

    pub fn create_explosion(&mut self, pos: V2, vel: V2) -> Result<EntityId, OutOfEntities> {
        let id = self.arena.new_entity(EntityKind::Explosion)?;
        if let Some(e) = self.arena.get_mut(id) {
            e.pos = pos;
            e.vel = vel;
            e.explosion_radius = EXPLOSION_RADIUS;
        }
        Ok(id)
    }

    /// Rebuild a grid's mass properties from its boxes.
    pub fn recalc_grid_mass(&mut self, grid_id: EntityId) {
        let Some(grid) = self.arena.get(grid_id) else {
            return;
        };
        let Some(body) = grid.body else {
            return;
        };
        let locals: Vec<V2> = grid
            .boxes
            .iter()
            .filter_map(|b| self.arena.get(*b))
            .map(|b| b.local_pos)
            .collect();
        if locals.is_empty() {
            return;
        }
        let mass = BOX_MASS * locals.len() as f64;
        let mut com = V2::ZERO;
        for l in &locals {
            com += *l;
        }
        com = com * (1.0 / locals.len() as f64);
        let cell_moment = BOX_MASS * BOX_SIZE * BOX_SIZE / 6.0;
        let moment: f64 = locals
            .iter()
            .map(|l| cell_moment + BOX_MASS * (*l - com).length_sq())
            .sum();
        self.physics.set_body_mass(body, com, mass, moment);
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    /// World position of any entity kind.
    pub fn entity_pos(&self, id: EntityId) -> Option<V2> {
        let e = self.arena.get(id)?;
        match e.kind {
            EntityKind::Box => self.box_world_pos(e),
            EntityKind::Sun | EntityKind::Explosion => Some(e.pos),
            _ => e.body.map(|b| self.physics.body_position(b)),
        }
    }

    pub fn entity_rotation(&self, id: EntityId) -> Option<f64> {
        let e = self.arena.get(id)?;
        match e.kind {
            EntityKind::Box => {
                let grid = self.arena.get(e.parent_grid?)?;
                let body = grid.body?;
                Some(self.physics.body_rotation(body) + FRAC_PI_2 * f64::from(e.compass_rotation))
            }
            EntityKind::Sun | EntityKind::Explosion => Some(0.0),
            _ => e.body.map(|b| self.physics.body_rotation(b)),
        }
    }

    pub fn entity_velocity(&self, id: EntityId) -> Option<V2> {
        let e = self.arena.get(id)?;
        match e.kind {
            EntityKind::Box => {
                let grid = self.arena.get(e.parent_grid?)?;
                Some(self.physics.body_linvel(grid.body?))
            }
            EntityKind::Sun | EntityKind::Explosion => Some(e.vel),
            _ => e.body.map(|b| self.physics.body_linvel(b)),
        }
    }

    fn box_world_pos(&self, e: &Entity) -> Option<V2> {
        let grid = self.arena.get(e.parent_grid?)?;
        let body = grid.body?;
        let pos = self.physics.body_position(body);
        let rot = self.physics.body_rotation(body);
        Some(pos + e.local_pos.rotate(rot))
    }

    /// Resolve a physics shape hit back to its owning entity.
    pub fn entity_of_shape(&self, shape: crate::physics::ShapeHandle) -> Option<EntityId> {
        let id = EntityId::from_user_data(self.physics.shape_user_data(shape))?;
        self.arena.is_live(id).then_some(id)
    }

    /// Resolve a physics body back to its owning entity (the grid for a
    /// box shape's body, the player/missile/orb itself otherwise).
    pub fn entity_of_body(&self, body: crate::physics::BodyHandle) -> Option<EntityId> {
        let id = EntityId::from_user_data(self.physics.body_user_data(body))?;
        self.arena.is_live(id).then_some(id)
    }

    fn squad_medbay_pos(&self, squad: Squad) -> Option<V2> {
        if squad == Squad::None {
            return None;
        }
        self.arena
            .iter_kind(EntityKind::Box)
            .find(|(_, e)| e.box_kind == BoxKind::Medbay && e.squad == squad)
            .and_then(|(_, e)| self.box_world_pos(e))
    }

    // ── Energy ────────────────────────────────────────────────────────────

    /// Draw `amount` of energy from a grid's batteries. Returns the
    /// fraction actually obtained, in [0, 1].
    fn grid_use_energy(&mut self, grid_id: EntityId, amount: f64) -> f64 {
        if amount <= 0.0 {
            return 1.0;
        }
        let batteries: Vec<EntityId> = match self.arena.get(grid_id) {
            Some(grid) => grid
                .boxes
                .iter()
                .copied()
                .filter(|b| {
                    self.arena
                        .get(*b)
                        .is_some_and(|e| e.box_kind == BoxKind::Battery)
                })
                .collect(),
            None => return 0.0,
        };
        let mut needed = amount;
        for id in batteries {
            if needed <= 0.0 {
                break;
            }
            if let Some(battery) = self.arena.get_mut(id) {
                let take = needed.min(battery.battery_free());
                battery.energy_used += take;
                needed -= take;
            }
        }
        (amount - needed) / amount
    }

    /// Return energy into a grid's batteries (solar panels do this).
    fn grid_deposit_energy(&mut self, grid_id: EntityId, amount: f64) {
        let batteries: Vec<EntityId> = match self.arena.get(grid_id) {
            Some(grid) => grid.boxes.clone(),
            None => return,
        };
        let mut left = amount;
        for id in batteries {
            if left <= 0.0 {
                break;
            }
            if let Some(e) = self.arena.get_mut(id) {
                if e.box_kind == BoxKind::Battery {
                    let give = left.min(e.energy_used);
                    e.energy_used -= give;
                    left -= give;
                }
            }
        }
    }

    // ── Cloaking query ────────────────────────────────────────────────────

    /// Is `pos` hidden from `observer_squad` by a friendly cloaking field?
    fn is_cloaked_from(&self, pos: V2, owner_squad: Squad, observer_squad: Squad) -> bool {
        if owner_squad == observer_squad {
            return false;
        }
        self.arena.iter_kind(EntityKind::Box).any(|(_, e)| {
            e.box_kind == BoxKind::Cloaking
                && e.cloaking_power > 0.5
                && e.squad == owner_squad
                && self
                    .box_world_pos(e)
                    .is_some_and(|p| p.distance(pos) <= CLOAKING_RADIUS)
        })
    }

    // ── Step ──────────────────────────────────────────────────────────────

    /// Advance the world by exactly one tick.
    pub fn step(&mut self, dt: f64) {
        self.apply_inputs();
        self.respawn_dead_players();
        self.player_actions();
        self.update_batteries();
        self.update_solar_panels(dt);
        self.update_thrusters(dt);
        self.update_gyroscopes(dt);
        self.update_medbays(dt);
        self.update_cloaking(dt);
        self.update_missile_launchers(dt);
        self.update_scanners(dt);
        self.update_landing_gear();
        self.update_merges();
        self.update_missiles(dt);
        self.update_explosions(dt);
        self.update_suns(dt);
        self.reap_destroyed();
        self.boundary_cull();
        self.physics.step(dt);
        self.tick += 1;
        self.sync_respawn_squads();
        #[cfg(debug_assertions)]
        self.assert_seat_symmetry();
    }

    /// Phase 1: copy each slot's committed frame for this tick onto its
    /// player. A missing frame means zero input.
    fn apply_inputs(&mut self) {
        for slot in 0..MAX_PLAYERS {
            if !self.players[slot].connected {
                continue;
            }
            let frame = self.input_buffers[slot]
                .take_for_tick(self.tick)
                .unwrap_or_default();
            if let Some(id) = self.players[slot].entity {
                if let Some(player) = self.arena.get_mut(id) {
                    player.input = frame;
                }
            }
        }
    }

    /// Connected slots whose body died get a fresh one next tick.
    fn respawn_dead_players(&mut self) {
        for slot in 0..MAX_PLAYERS {
            if !self.players[slot].connected {
                continue;
            }
            let dead = match self.players[slot].entity {
                Some(id) => !self.arena.is_live(id),
                None => true,
            };
            if dead {
                self.players[slot].entity = None;
                if let Err(err) = self.create_player_body(slot) {
                    debug!(slot, %err, "could not respawn player");
                }
            }
        }
    }

    /// Phase 2: movement, seating, squads, building.
    fn player_actions(&mut self) {
        for slot in 0..MAX_PLAYERS {
            let Some(player_id) = self.players[slot].entity else {
                continue;
            };
            let Some(player) = self.arena.get(player_id) else {
                continue;
            };
            let input = player.input.clone();
            let seated = player.currently_inside_of_box;

            match seated {
                None => {
                    if let Some(body) = player.body {
                        let force = input.movement.clamp_length(1.0) * PLAYER_MOVE_FORCE;
                        let at = self.physics.body_position(body);
                        self.physics.apply_force_at_point(body, force, at);
                    }
                }
                Some(seat_id) => {
                    // Ride the seat: the player's body follows the box.
                    if let (Some(seat), Some(body)) =
                        (self.arena.get(seat_id), self.arena.get(player_id).and_then(|p| p.body))
                    {
                        if let (Some(pos), Some(vel)) = (
                            self.box_world_pos(seat),
                            seat.parent_grid
                                .and_then(|g| self.arena.get(g))
                                .and_then(|g| g.body)
                                .map(|b| self.physics.body_linvel(b)),
                        ) {
                            self.physics.set_body_position(body, pos, 0.0);
                            self.physics.set_body_linvel(body, vel);
                            self.physics.set_body_angvel(body, 0.0);
                        }
                    }
                }
            }

            if input.seat_action {
                self.toggle_seat(player_id);
            }
            if input.interact_action {
                self.interact(player_id, input.hand_pos);
            }
            if let Some(target) = input.invite_this_player {
                self.invite_to_squad(player_id, target);
            }
            if input.accept_squad_invite {
                self.accept_invite(player_id);
            }
            if input.reject_squad_invite {
                if let Some(p) = self.arena.get_mut(player_id) {
                    p.squad_invited_to = Squad::None;
                }
            }
            if input.take_over_squad >= 0 {
                self.take_over_squad(player_id, input.take_over_squad as u8);
            }
            if input.dobuild {
                self.build(slot, player_id, &input);
            }

            // Event flags are consumed once acted on.
            if let Some(p) = self.arena.get_mut(player_id) {
                p.input.seat_action = false;
                p.input.interact_action = false;
                p.input.dobuild = false;
                p.input.invite_this_player = None;
                p.input.accept_squad_invite = false;
                p.input.reject_squad_invite = false;
                p.input.take_over_squad = -1;
            }
        }
    }

    /// Clamp the hand to arm's length around the player.
    fn global_hand_pos(&self, player_id: EntityId, hand_pos: V2) -> Option<V2> {
        let pos = self.entity_pos(player_id)?;
        Some(pos + hand_pos.clamp_length(MAX_HAND_REACH))
    }

    fn toggle_seat(&mut self, player_id: EntityId) {
        let Some(player) = self.arena.get(player_id) else {
            return;
        };
        match player.currently_inside_of_box {
            Some(seat_id) => {
                // Unseat next to the box, keeping the grid's velocity.
                let exit_pos = self
                    .arena
                    .get(seat_id)
                    .and_then(|s| self.box_world_pos(s));
                let vel = self.entity_velocity(seat_id).unwrap_or(V2::ZERO);
                if let Some(seat) = self.arena.get_mut(seat_id) {
                    seat.player_who_is_inside_of_me = None;
                }
                if let Some(p) = self.arena.get_mut(player_id) {
                    p.currently_inside_of_box = None;
                }
                if let Some(shape) = self.arena.get(player_id).and_then(|p| p.shape) {
                    self.physics.set_shape_sensor(shape, false);
                }
                if let Some(body) = self.arena.get(player_id).and_then(|p| p.body) {
                    if let Some(pos) = exit_pos {
                        self.physics
                            .set_body_position(body, pos + V2::new(0.0, BOX_SIZE), 0.0);
                    }
                    self.physics.set_body_linvel(body, vel);
                }
            }
            None => {
                let Some(hand) = self.global_hand_pos(player_id, player.input.hand_pos) else {
                    return;
                };
                let exclude = self.arena.get(player_id).and_then(|p| p.body);
                let Some((shape, _)) =
                    self.physics.nearest_shape_within(hand, MAX_HAND_REACH, exclude)
                else {
                    return;
                };
                let Some(seat_id) = self.entity_of_shape(shape) else {
                    return;
                };
                let can_seat = self.arena.get(seat_id).is_some_and(|e| {
                    e.kind == EntityKind::Box
                        && e.box_kind.is_seat()
                        && e.player_who_is_inside_of_me.is_none()
                });
                if !can_seat {
                    return;
                }
                if let Some(seat) = self.arena.get_mut(seat_id) {
                    seat.player_who_is_inside_of_me = Some(player_id);
                }
                if let Some(p) = self.arena.get_mut(player_id) {
                    p.currently_inside_of_box = Some(seat_id);
                }
                // Riding inside the hull: no contacts against the ship.
                if let Some(shape) = self.arena.get(player_id).and_then(|p| p.shape) {
                    self.physics.set_shape_sensor(shape, true);
                }
            }
        }
    }

    /// Interact: release a locked landing gear under the hand.
    fn interact(&mut self, player_id: EntityId, hand_pos: V2) {
        let Some(hand) = self.global_hand_pos(player_id, hand_pos) else {
            return;
        };
        let exclude = self.arena.get(player_id).and_then(|p| p.body);
        let Some((shape, _)) = self.physics.nearest_shape_within(hand, MAX_HAND_REACH, exclude)
        else {
            return;
        };
        let Some(target) = self.entity_of_shape(shape) else {
            return;
        };
        let tick = self.tick;
        let mut released = None;
        if let Some(e) = self.arena.get_mut(target) {
            if e.kind == EntityKind::Box && e.box_kind == BoxKind::LandingGear {
                released = e.landed_constraint.take();
                e.landing_rearm_tick = tick + LANDING_GEAR_REARM_TICKS;
            }
        }
        if let Some(joint) = released {
            self.physics.destroy_joint(joint);
        }
    }

    fn invite_to_squad(&mut self, inviter: EntityId, target: EntityId) {
        let squad = match self.arena.get(inviter) {
            Some(p) if p.squad != Squad::None => p.squad,
            _ => return,
        };
        if let Some(t) = self.arena.get_mut(target) {
            if t.kind == EntityKind::Player {
                t.squad_invited_to = squad;
            }
        }
    }

    fn accept_invite(&mut self, player_id: EntityId) {
        if let Some(p) = self.arena.get_mut(player_id) {
            if p.squad_invited_to != Squad::None {
                p.squad = p.squad_invited_to;
                p.squad_invited_to = Squad::None;
            }
        }
    }

    /// Claim a squad nobody currently belongs to.
    fn take_over_squad(&mut self, player_id: EntityId, index: u8) {
        let Some(squad) = Squad::from_index(index) else {
            return;
        };
        let occupied = self
            .arena
            .iter_kind(EntityKind::Player)
            .any(|(id, e)| id != player_id && e.squad == squad);
        if occupied {
            return;
        }
        if let Some(p) = self.arena.get_mut(player_id) {
            p.squad = squad;
        }
    }

    /// Build action: place a box at the snapped hand position.
    fn build(&mut self, slot: usize, player_id: EntityId, input: &InputFrame) {
        let Some(player) = self.arena.get(player_id) else {
            return;
        };
        if !player.box_unlocked(input.build_type) {
            return;
        }
        let squad = player.squad;
        let Some(hand) = self.global_hand_pos(player_id, input.hand_pos) else {
            return;
        };
        let exclude = player.body;

        // Snap to an existing grid when a box of one is close enough.
        let target_grid = self
            .physics
            .nearest_shape_within(hand, BUILD_SNAP_DIST, exclude)
            .and_then(|(shape, _)| self.entity_of_shape(shape))
            .and_then(|id| self.arena.get(id))
            .filter(|e| e.kind == EntityKind::Box)
            .and_then(|e| e.parent_grid);

        let result = match target_grid {
            Some(grid_id) => {
                let Some(grid) = self.arena.get(grid_id) else { return };
                let Some(body) = grid.body else { return };
                let gpos = self.physics.body_position(body);
                let grot = self.physics.body_rotation(body);
                let snapped = grid_snapped(gpos, grot, hand);
                let local = (snapped - gpos).rotate(-grot);
                // Cell occupancy is a rectangle test in the grid's local
                // frame, not a radius.
                let cell = Aabb::from_center(local, V2::new(BOX_SIZE / 2.0, BOX_SIZE / 2.0));
                let occupied = grid.boxes.iter().any(|b| {
                    self.arena
                        .get(*b)
                        .is_some_and(|e| cell.contains(e.local_pos))
                });
                if occupied {
                    return; // cell taken: silently degrade this tick
                }
                self.create_box_on_grid(grid_id, input.build_type, local, input.build_rotation)
            }
            None => match self.create_grid(hand, 0.0) {
                Ok(grid_id) => {
                    if let Some(grid) = self.arena.get_mut(grid_id) {
                        grid.squad = squad;
                    }
                    let boxed = self.create_box_on_grid(
                        grid_id,
                        input.build_type,
                        V2::ZERO,
                        input.build_rotation,
                    );
                    if boxed.is_err() {
                        // Never leave an empty hull behind.
                        self.arena.destroy(grid_id, &mut self.physics);
                    }
                    boxed
                }
                Err(err) => Err(err),
            },
        };

        match result {
            Ok(box_id) => {
                if let Some(b) = self.arena.get_mut(box_id) {
                    b.squad = squad;
                }
            }
            Err(OutOfEntities) => {
                // Reported to this slot in its next snapshot.
                self.players[slot].build_failed = true;
                debug!(slot, "build failed: arena full");
            }
        }
    }

    // ── Subsystem passes ──────────────────────────────────────────────────

    /// Batteries clamp their charge state into [0, BATTERY_CAPACITY].
    fn update_batteries(&mut self) {
        for id in self.arena.ids_of_kind(EntityKind::Box) {
            if let Some(e) = self.arena.get_mut(id) {
                if e.box_kind == BoxKind::Battery {
                    e.energy_used = e.energy_used.clamp(0.0, BATTERY_CAPACITY);
                }
            }
        }
    }

    /// Solar panels compute line-of-sight sun exposure and recharge their
    /// grid's batteries.
    fn update_solar_panels(&mut self, dt: f64) {
        let suns: Vec<(V2, f64)> = self
            .arena
            .iter_kind(EntityKind::Sun)
            .map(|(_, e)| (e.pos, e.sun_radius))
            .collect();
        for id in self.arena.ids_of_kind(EntityKind::Box) {
            let (panel_pos, facing, grid_id, grid_body) = {
                let Some(e) = self.arena.get(id) else { continue };
                if e.box_kind != BoxKind::SolarPanel {
                    continue;
                }
                let Some(grid_id) = e.parent_grid else { continue };
                let Some(grid) = self.arena.get(grid_id) else { continue };
                let Some(body) = grid.body else { continue };
                let Some(pos) = self.box_world_pos(e) else { continue };
                let rot = self.physics.body_rotation(body);
                (pos, e.box_facing(rot), grid_id, body)
            };
            let mut amount = 0.0;
            for (sun_pos, _) in &suns {
                let to_sun = *sun_pos - panel_pos;
                let dist = to_sun.length();
                let dir = to_sun.normalize_or_zero();
                let exposure = facing.dot(dir).max(0.0);
                if exposure <= 0.0 {
                    continue;
                }
                // Anything between the panel and the sun shades it.
                let occluded = self
                    .physics
                    .raycast(panel_pos + dir * (BOX_SIZE * 0.6), dir, dist, Some(grid_body))
                    .is_some();
                if !occluded {
                    amount += exposure;
                }
            }
            let amount = amount.min(1.0);
            if let Some(e) = self.arena.get_mut(id) {
                e.sun_amount = amount;
            }
            if amount > 0.0 {
                self.grid_deposit_energy(grid_id, SOLAR_ENERGY_PER_SECOND * amount * dt);
            }
        }
    }

    /// Thrusters take their command from the grid's seated pilot, draw
    /// energy, and push along their facing.
    fn update_thrusters(&mut self, dt: f64) {
        for grid_id in self.arena.ids_of_kind(EntityKind::Grid) {
            let Some(grid) = self.arena.get(grid_id) else { continue };
            let Some(body) = grid.body else { continue };
            let rot = self.physics.body_rotation(body);
            let desired = self.pilot_movement(grid_id).normalize_or_zero();

            let thrusters: Vec<EntityId> = grid
                .boxes
                .iter()
                .copied()
                .filter(|b| {
                    self.arena
                        .get(*b)
                        .is_some_and(|e| e.box_kind == BoxKind::Thruster)
                })
                .collect();

            for thruster_id in thrusters {
                let (wanted, facing, world_pos) = {
                    let Some(e) = self.arena.get(thruster_id) else { continue };
                    let facing = e.box_facing(rot);
                    let wanted = facing.dot(desired).max(0.0);
                    let Some(pos) = self.box_world_pos(e) else { continue };
                    (wanted, facing, pos)
                };
                let fraction = if wanted > 0.0 {
                    self.grid_use_energy(grid_id, THRUSTER_ENERGY_PER_SECOND * wanted * dt)
                } else {
                    0.0
                };
                let thrust = wanted * fraction;
                if let Some(e) = self.arena.get_mut(thruster_id) {
                    e.wanted_thrust = wanted;
                    e.thrust = thrust;
                }
                if thrust > 0.0 {
                    self.physics.apply_force_at_point(
                        body,
                        facing * (THRUSTER_FORCE * thrust),
                        world_pos,
                    );
                }
            }
        }
    }

    /// Movement intent of whoever pilots this grid's cockpit.
    fn pilot_movement(&self, grid_id: EntityId) -> V2 {
        let Some(grid) = self.arena.get(grid_id) else {
            return V2::ZERO;
        };
        for box_id in &grid.boxes {
            let Some(e) = self.arena.get(*box_id) else { continue };
            if e.box_kind != BoxKind::Cockpit {
                continue;
            }
            if let Some(pilot_id) = e.player_who_is_inside_of_me {
                if let Some(pilot) = self.arena.get(pilot_id) {
                    return pilot.input.movement;
                }
            }
        }
        V2::ZERO
    }

    /// Rotation intent of whoever pilots this grid's cockpit.
    fn pilot_rotation(&self, grid_id: EntityId) -> f64 {
        let Some(grid) = self.arena.get(grid_id) else {
            return 0.0;
        };
        for box_id in &grid.boxes {
            let Some(e) = self.arena.get(*box_id) else { continue };
            if e.box_kind != BoxKind::Cockpit {
                continue;
            }
            if let Some(pilot_id) = e.player_who_is_inside_of_me {
                if let Some(pilot) = self.arena.get(pilot_id) {
                    return pilot.input.rotation.clamp(-1.0, 1.0);
                }
            }
        }
        0.0
    }

    /// Gyroscopes torque the grid toward the pilot's rotation input and
    /// damp residual spin when idle.
    fn update_gyroscopes(&mut self, dt: f64) {
        for grid_id in self.arena.ids_of_kind(EntityKind::Grid) {
            let Some(grid) = self.arena.get(grid_id) else { continue };
            let Some(body) = grid.body else { continue };
            let has_gyro = grid.boxes.iter().any(|b| {
                self.arena
                    .get(*b)
                    .is_some_and(|e| e.box_kind == BoxKind::Gyroscope)
            });
            if !has_gyro {
                continue;
            }
            let input = self.pilot_rotation(grid_id);
            if input.abs() > 0.01 {
                let fraction =
                    self.grid_use_energy(grid_id, GYROSCOPE_ENERGY_PER_SECOND * input.abs() * dt);
                self.physics
                    .apply_torque(body, -input * GYROSCOPE_TORQUE * fraction);
            } else {
                let angvel = self.physics.body_angvel(body);
                self.physics
                    .apply_torque(body, -angvel * GYROSCOPE_PROPORTIONAL_DAMPING);
            }
        }
    }

    /// Medbays heal their occupant.
    fn update_medbays(&mut self, dt: f64) {
        for id in self.arena.ids_of_kind(EntityKind::Box) {
            let occupant = {
                let Some(e) = self.arena.get(id) else { continue };
                if e.box_kind != BoxKind::Medbay {
                    continue;
                }
                e.player_who_is_inside_of_me
            };
            if let Some(player_id) = occupant {
                if let Some(p) = self.arena.get_mut(player_id) {
                    p.damage = (p.damage - MEDBAY_HEAL_PER_SECOND * dt).max(0.0);
                }
            }
        }
    }

    /// Cloaking devices spin toward full power while fed.
    fn update_cloaking(&mut self, dt: f64) {
        for id in self.arena.ids_of_kind(EntityKind::Box) {
            let grid_id = {
                let Some(e) = self.arena.get(id) else { continue };
                if e.box_kind != BoxKind::Cloaking {
                    continue;
                }
                e.parent_grid
            };
            let Some(grid_id) = grid_id else { continue };
            let fraction = self.grid_use_energy(grid_id, CLOAKING_ENERGY_PER_SECOND * dt);
            if let Some(e) = self.arena.get_mut(id) {
                if fraction > 0.0 {
                    e.cloaking_power =
                        (e.cloaking_power + CLOAKING_SPIN_UP_PER_SECOND * fraction * dt).min(1.0);
                } else {
                    e.cloaking_power = (e.cloaking_power - CLOAKING_SPIN_UP_PER_SECOND * dt).max(0.0);
                }
            }
        }
    }

    /// Launchers charge while powered and fire at the nearest target in
    /// range.
    fn update_missile_launchers(&mut self, dt: f64) {
        for id in self.arena.ids_of_kind(EntityKind::Box) {
            let (grid_id, squad, pos, facing) = {
                let Some(e) = self.arena.get(id) else { continue };
                if e.box_kind != BoxKind::MissileLauncher {
                    continue;
                }
                let Some(grid_id) = e.parent_grid else { continue };
                let Some(grid) = self.arena.get(grid_id) else { continue };
                let Some(body) = grid.body else { continue };
                let rot = self.physics.body_rotation(body);
                let Some(pos) = self.box_world_pos(e) else { continue };
                (grid_id, e.squad, pos, e.box_facing(rot))
            };

            let fraction =
                self.grid_use_energy(grid_id, MISSILE_LAUNCHER_ENERGY_PER_SECOND * dt);
            let charged = {
                let Some(e) = self.arena.get_mut(id) else { continue };
                e.missile_construction_charge += MISSILE_CHARGE_PER_SECOND * fraction * dt;
                e.missile_construction_charge >= 1.0
            };
            if !charged {
                continue;
            }
            if self.find_missile_target(pos, squad).is_none() {
                continue; // stay charged until something wanders into range
            }
            let vel = self.entity_velocity(id).unwrap_or(V2::ZERO) + facing * 1.0;
            let spawn = pos + facing * BOX_SIZE;
            match self.create_missile(spawn, facing.angle(), vel, squad) {
                Ok(_) => {
                    if let Some(e) = self.arena.get_mut(id) {
                        e.missile_construction_charge = 0.0;
                    }
                }
                Err(err) => debug!(%err, "missile spawn failed"),
            }
        }
    }

    /// Nearest enemy player/grid/missile within [`MISSILE_RANGE`].
    fn find_missile_target(&self, from: V2, squad: Squad) -> Option<EntityId> {
        let mut best: Option<(EntityId, f64)> = None;
        for (id, e) in self.arena.iter() {
            let targetable = matches!(
                e.kind,
                EntityKind::Player | EntityKind::Grid | EntityKind::Missile
            );
            if !targetable || e.squad == squad {
                continue;
            }
            let Some(pos) = self.entity_pos(id) else { continue };
            let dist = pos.distance(from);
            if dist > MISSILE_RANGE {
                continue;
            }
            if self.is_cloaked_from(pos, e.squad, squad) {
                continue;
            }
            if best.is_none_or(|(_, d)| dist < d) {
                best = Some((id, dist));
            }
        }
        best.map(|(id, _)| id)
    }

    /// Scanners sweep their head, sample nearby returns, and track distant
    /// platonic boxes by bearing.
    fn update_scanners(&mut self, dt: f64) {
        // Collect platonic boxes once per tick.
        let platonics: Vec<V2> = self
            .arena
            .iter_kind(EntityKind::Box)
            .filter(|(_, e)| e.is_platonic)
            .filter_map(|(_, e)| self.box_world_pos(e))
            .collect();

        for id in self.arena.ids_of_kind(EntityKind::Box) {
            let (grid_id, squad, pos) = {
                let Some(e) = self.arena.get(id) else { continue };
                if e.box_kind != BoxKind::Scanner {
                    continue;
                }
                let Some(grid_id) = e.parent_grid else { continue };
                let Some(pos) = self.box_world_pos(e) else { continue };
                (grid_id, e.squad, pos)
            };
            let fraction = self.grid_use_energy(grid_id, SCANNER_ENERGY_PER_SECOND * dt);
            if fraction <= 0.0 {
                continue;
            }

            let mut points: Vec<ScannerPoint> = Vec::new();
            for (other_id, other) in self.arena.iter() {
                if other_id == id || other.kind == EntityKind::Explosion {
                    continue;
                }
                if other.parent_grid == Some(grid_id) || other_id == grid_id {
                    continue; // own ship is not a contact
                }
                let Some(other_pos) = self.entity_pos(other_id) else { continue };
                if other_pos.distance(pos) > SCANNER_RADIUS {
                    continue;
                }
                if self.is_cloaked_from(other_pos, other.squad, squad) {
                    continue;
                }
                let category = if other.kind == EntityKind::Box && other.is_platonic {
                    ScannerCategory::Platonic
                } else if other.squad != Squad::None && other.squad != squad {
                    ScannerCategory::Enemy
                } else {
                    ScannerCategory::Neutral
                };
                points.push(ScannerPoint {
                    relative_pos: other_pos - pos,
                    category,
                });
                if points.len() >= SCANNER_MAX_POINTS {
                    break;
                }
            }

            let mut detected: Vec<DetectedPlatonic> = platonics
                .iter()
                .map(|p| {
                    let to = *p - pos;
                    DetectedPlatonic {
                        direction: to.normalize_or_zero(),
                        intensity: (1.0 / to.length().max(1.0)).min(1.0),
                    }
                })
                .collect();
            detected.sort_by(|a, b| b.intensity.total_cmp(&a.intensity));
            detected.truncate(SCANNER_MAX_PLATONICS);

            if let Some(e) = self.arena.get_mut(id) {
                e.scanner_head_rotate =
                    (e.scanner_head_rotate + TAU * SCANNER_HEAD_TURNS_PER_SECOND * fraction * dt)
                        .rem_euclid(TAU);
                e.scanner_points = points;
                e.detected_platonics = detected;
            }
        }
    }

    /// Landing gear welds to a nearby slow foreign body; an interact on the
    /// gear (handled in the player pass) releases it.
    fn update_landing_gear(&mut self) {
        for id in self.arena.ids_of_kind(EntityKind::Box) {
            let (grid_body, pos, own_vel) = {
                let Some(e) = self.arena.get(id) else { continue };
                if e.box_kind != BoxKind::LandingGear
                    || e.landed_constraint.is_some()
                    || e.landing_rearm_tick > self.tick
                {
                    continue;
                }
                let Some(grid) = e.parent_grid.and_then(|g| self.arena.get(g)) else {
                    continue;
                };
                let Some(body) = grid.body else { continue };
                let Some(pos) = self.box_world_pos(e) else { continue };
                (body, pos, self.physics.body_linvel(body))
            };
            let Some((shape, _)) =
                self.physics
                    .nearest_shape_within(pos, LANDING_GEAR_LOCK_DIST, Some(grid_body))
            else {
                continue;
            };
            let Some(other_body) = self.physics.shape_body(shape) else {
                continue;
            };
            // Only grids and orbs are compatible anchors; never weld onto
            // a passing missile or another player.
            let compatible = self
                .entity_of_body(other_body)
                .and_then(|other| self.arena.get(other))
                .is_some_and(|e| matches!(e.kind, EntityKind::Grid | EntityKind::Orb));
            if !compatible {
                continue;
            }
            let rel_speed = (self.physics.body_linvel(other_body) - own_vel).length();
            if rel_speed > LANDING_GEAR_MAX_LOCK_SPEED {
                continue;
            }
            if let Some(joint) = self.physics.create_weld_joint(grid_body, other_body) {
                if let Some(e) = self.arena.get_mut(id) {
                    e.landed_constraint = Some(joint);
                }
            }
        }
    }

    /// Merge boxes fuse two different grids that touch face-to-face.
    fn update_merges(&mut self) {
        let merges: Vec<(EntityId, EntityId, V2, V2)> = self
            .arena
            .iter_kind(EntityKind::Box)
            .filter(|(_, e)| e.box_kind == BoxKind::Merge)
            .filter_map(|(id, e)| {
                let grid_id = e.parent_grid?;
                let grid = self.arena.get(grid_id)?;
                let body = grid.body?;
                let rot = self.physics.body_rotation(body);
                let pos = self.box_world_pos(e)?;
                Some((id, grid_id, pos + e.box_facing(rot) * (BOX_SIZE / 2.0), e.box_facing(rot)))
            })
            .collect();

        for i in 0..merges.len() {
            for j in (i + 1)..merges.len() {
                let (a_id, a_grid, a_face, a_dir) = merges[i];
                let (b_id, b_grid, b_face, b_dir) = merges[j];
                if a_grid == b_grid {
                    continue; // same grid touching itself is a no-op
                }
                if a_face.distance(b_face) > MERGE_MAX_DIST {
                    continue;
                }
                // Faces must oppose within tolerance.
                if a_dir.dot(-b_dir) < MERGE_ALIGN_EPSILON.cos() {
                    continue;
                }
                if !self.arena.is_live(a_id) || !self.arena.is_live(b_id) {
                    continue;
                }
                self.merge_grids(a_grid, b_grid);
                return; // one fusion per tick keeps this pass simple
            }
        }
    }

    /// Move every box of the smaller grid onto the bigger one.
    fn merge_grids(&mut self, a: EntityId, b: EntityId) {
        let count = |id: EntityId| self.arena.get(id).map_or(0, |g| g.boxes.len());
        let (keep, absorb) = if count(a) >= count(b) { (a, b) } else { (b, a) };
        let (Some(keep_grid), Some(absorb_grid)) = (self.arena.get(keep), self.arena.get(absorb))
        else {
            return;
        };
        let (Some(keep_body), Some(absorb_body)) = (keep_grid.body, absorb_grid.body) else {
            return;
        };
        let keep_pos = self.physics.body_position(keep_body);
        let keep_rot = self.physics.body_rotation(keep_body);
        let absorb_rot = self.physics.body_rotation(absorb_body);
        let quarter_delta =
            (((absorb_rot - keep_rot) / FRAC_PI_2).round() as i64).rem_euclid(4) as u8;
        let moved: Vec<EntityId> = absorb_grid.boxes.clone();

        for box_id in moved {
            let Some(e) = self.arena.get(box_id) else { continue };
            let Some(world) = self.box_world_pos(e) else { continue };
            let snapped = grid_snapped(keep_pos, keep_rot, world);
            let local = (snapped - keep_pos).rotate(-keep_rot);
            let compass = (e.compass_rotation + quarter_delta) % 4;
            let old_shape = e.shape;

            // Re-home the shape onto the kept body.
            if let Some(shape) = old_shape {
                self.physics.destroy_shape(shape);
            }
            let new_shape = self.physics.attach_box_shape(
                keep_body,
                V2::new(BOX_SIZE / 2.0, BOX_SIZE / 2.0),
                local,
                0.0,
                box_id.to_user_data(),
            );
            if let Some(e) = self.arena.get_mut(box_id) {
                e.parent_grid = Some(keep);
                e.local_pos = local;
                e.compass_rotation = compass;
                e.shape = Some(new_shape);
            }
            if let Some(absorbing) = self.arena.get_mut(absorb) {
                absorbing.boxes.retain(|x| *x != box_id);
            }
            if let Some(keeping) = self.arena.get_mut(keep) {
                keeping.boxes.push(box_id);
            }
        }

        self.arena.destroy(absorb, &mut self.physics);
        self.recalc_grid_mass(keep);
        debug!("merged grids");
    }

    /// Phase 4: missiles burn, steer nothing, and detonate on contact or
    /// timeout.
    fn update_missiles(&mut self, dt: f64) {
        for id in self.arena.ids_of_kind(EntityKind::Missile) {
            let (body, squad) = {
                let Some(e) = self.arena.get(id) else { continue };
                let Some(body) = e.body else { continue };
                (body, e.squad)
            };
            let pos = self.physics.body_position(body);
            let rot = self.physics.body_rotation(body);

            let burn = {
                let Some(e) = self.arena.get_mut(id) else { continue };
                e.burn_remaining -= dt;
                e.burn_remaining
            };
            if burn > 0.0 {
                self.physics
                    .apply_force(body, V2::from_angle(rot) * MISSILE_THRUST);
            }

            let timed_out = burn <= MISSILE_BURN_TIME - MISSILE_LIFETIME;
            let contact = self
                .physics
                .nearest_shape_within(pos, MISSILE_CONTACT_DIST, Some(body))
                .and_then(|(shape, _)| self.entity_of_shape(shape))
                .and_then(|hit| self.arena.get(hit))
                .is_some_and(|hit| hit.squad != squad);

            if timed_out || contact {
                let vel = self.physics.body_linvel(body);
                self.arena.destroy(id, &mut self.physics);
                if let Err(err) = self.create_explosion(pos, vel) {
                    debug!(%err, "explosion spawn failed");
                }
            }
        }
    }

    /// Phase 5: explosions grow, push, damage, and expire.
    fn update_explosions(&mut self, dt: f64) {
        for id in self.arena.ids_of_kind(EntityKind::Explosion) {
            let (pos, radius, expired) = {
                let Some(e) = self.arena.get_mut(id) else { continue };
                e.explosion_progress += dt;
                e.pos += e.vel * dt;
                let t = (e.explosion_progress / EXPLOSION_TIME).min(1.0);
                (e.pos, e.explosion_radius * t, e.explosion_progress >= EXPLOSION_TIME)
            };

            // Push and damage everything inside the current radius.
            for other_id in self.arena.ids() {
                if other_id == id {
                    continue;
                }
                let Some(other_pos) = self.entity_pos(other_id) else { continue };
                let dist = other_pos.distance(pos);
                if dist > radius {
                    continue;
                }
                let away = (other_pos - pos).normalize_or_zero();
                let falloff = 1.0 - dist / radius.max(f64::EPSILON);
                if let Some(other) = self.arena.get(other_id) {
                    if let Some(body) = other.body {
                        self.physics.apply_impulse_at_point(
                            body,
                            away * (EXPLOSION_PUSH_STRENGTH * falloff * dt),
                            other_pos,
                        );
                    }
                }
                if let Some(other) = self.arena.get_mut(other_id) {
                    other.damage =
                        (other.damage + EXPLOSION_DAMAGE_PER_SECOND * falloff * dt).min(1.0);
                }
            }

            if expired {
                self.arena.destroy(id, &mut self.physics);
            }
        }
    }

    /// Phase 6: sun gravity for every body, damage near lethal suns.
    fn update_suns(&mut self, dt: f64) {
        let suns: Vec<(V2, f64, f64, bool)> = self
            .arena
            .iter_kind(EntityKind::Sun)
            .map(|(_, e)| (e.pos, e.sun_radius, e.sun_mass, e.sun_is_safe))
            .collect();
        if suns.is_empty() {
            return;
        }

        for id in self.arena.ids() {
            let (body, pos) = {
                let Some(e) = self.arena.get(id) else { continue };
                if matches!(e.kind, EntityKind::Sun | EntityKind::Box) {
                    continue; // boxes ride their grid's body
                }
                let Some(pos) = self.entity_pos(id) else { continue };
                (e.body, pos)
            };

            for (sun_pos, sun_radius, sun_mass, sun_is_safe) in &suns {
                let to_sun = *sun_pos - pos;
                let dist = to_sun.length().max(0.01);
                if dist > sun_radius * SUN_GRAVITY_REACH_FACTOR {
                    continue;
                }
                if let Some(body) = body {
                    let mass = self.physics.body_mass(body);
                    let force = to_sun.normalize_or_zero()
                        * (SUN_GRAVITY_CONSTANT * sun_mass * mass / (dist * dist));
                    self.physics.apply_force(body, force);
                }
                if !sun_is_safe && dist < *sun_radius {
                    let ramp = 1.0 - dist / sun_radius;
                    if let Some(e) = self.arena.get_mut(id) {
                        e.damage = (e.damage + SUN_DAMAGE_PER_SECOND * ramp * dt).min(1.0);
                    }
                }
            }
        }

        // Boxes take lethal-sun damage individually so a ship can lose its
        // sunward edge and limp away.
        for id in self.arena.ids_of_kind(EntityKind::Box) {
            let Some(pos) = self.entity_pos(id) else { continue };
            for (sun_pos, sun_radius, _, sun_is_safe) in &suns {
                if *sun_is_safe {
                    continue;
                }
                let dist = pos.distance(*sun_pos);
                if dist < *sun_radius {
                    let ramp = 1.0 - dist / sun_radius;
                    if let Some(e) = self.arena.get_mut(id) {
                        e.damage = (e.damage + SUN_DAMAGE_PER_SECOND * ramp * dt).min(1.0);
                    }
                }
            }
        }
    }

    /// Destroy everything whose damage saturated; explosives detonate,
    /// grids that lost every box die with their body.
    fn reap_destroyed(&mut self) {
        for id in self.arena.ids() {
            let Some(e) = self.arena.get(id) else { continue };
            if e.damage < 1.0 {
                continue;
            }
            if e.kind == EntityKind::Box && e.indestructible {
                continue;
            }
            let explosive = e.kind == EntityKind::Box && e.box_kind == BoxKind::Explosive;
            let was_player = e.kind == EntityKind::Player;
            let grid_after = e.parent_grid;
            let pos = self.entity_pos(id);
            let vel = self.entity_velocity(id).unwrap_or(V2::ZERO);
            self.arena.destroy(id, &mut self.physics);
            if was_player {
                self.clear_slot_reference(id);
            }
            if explosive {
                if let Some(pos) = pos {
                    let _ = self.create_explosion(pos, vel);
                }
            }
            if let Some(grid_id) = grid_after {
                if self.arena.get(grid_id).is_some_and(|g| g.boxes.is_empty()) {
                    self.arena.destroy(grid_id, &mut self.physics);
                } else {
                    self.recalc_grid_mass(grid_id);
                }
            }
        }
    }

    /// Phase 7: anything too far from the origin is destroyed.
    fn boundary_cull(&mut self) {
        for id in self.arena.ids() {
            let Some(e) = self.arena.get(id) else { continue };
            if e.kind == EntityKind::Box {
                continue; // culled with its grid
            }
            let was_player = e.kind == EntityKind::Player;
            let Some(pos) = self.entity_pos(id) else { continue };
            if pos.length() > INSTANT_DEATH_DISTANCE_FROM_CENTER {
                debug!(?pos, "entity crossed the world boundary");
                self.arena.destroy(id, &mut self.physics);
                if was_player {
                    self.clear_slot_reference(id);
                }
            }
        }
    }

    /// A destroyed player body must not leave its slot pointing at a dead
    /// id; snapshots validate slot references on decode.
    fn clear_slot_reference(&mut self, id: EntityId) {
        for slot in self.players.iter_mut() {
            if slot.entity == Some(id) {
                slot.entity = None;
            }
        }
    }

    /// Remember each connected player's squad for respawning.
    fn sync_respawn_squads(&mut self) {
        for slot in 0..MAX_PLAYERS {
            if let Some(id) = self.players[slot].entity {
                if let Some(e) = self.arena.get(id) {
                    self.respawn_squads[slot] = e.squad;
                }
            }
        }
    }

    /// Seat references must be mutual after every step.
    #[cfg(debug_assertions)]
    fn assert_seat_symmetry(&self) {
        for (id, e) in self.arena.iter_kind(EntityKind::Player) {
            if let Some(seat_id) = e.currently_inside_of_box {
                let mutual = self
                    .arena
                    .get(seat_id)
                    .is_some_and(|s| s.player_who_is_inside_of_me == Some(id));
                crate::sim_assert!(mutual, "player {:?} seat reference is one-sided", id);
            }
        }
        for (id, e) in self.arena.iter_kind(EntityKind::Box) {
            if let Some(player_id) = e.player_who_is_inside_of_me {
                let mutual = self
                    .arena
                    .get(player_id)
                    .is_some_and(|p| p.currently_inside_of_box == Some(id));
                crate::sim_assert!(mutual, "box {:?} occupant reference is one-sided", id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_slot(gs: &mut GameState, slot: usize) -> EntityId {
        gs.players[slot].connected = true;
        gs.create_player_body(slot).unwrap()
    }

    fn queue_input(gs: &mut GameState, slot: usize, frame: InputFrame) {
        gs.input_buffers[slot].merge(frame);
    }

    fn build_frame(tick: u64, id: u64, hand: V2, kind: BoxKind) -> InputFrame {
        InputFrame {
            tick,
            id,
            hand_pos: hand,
            dobuild: true,
            build_type: kind,
            ..InputFrame::default()
        }
    }

    #[test]
    fn tick_advances_by_one_per_step() {
        let mut gs = GameState::new();
        for expected in 1..=5u64 {
            gs.step(TIMESTEP);
            assert_eq!(gs.tick, expected);
        }
    }

    #[test]
    fn build_creates_grid_with_one_box() {
        let mut gs = GameState::new();
        let player = connect_slot(&mut gs, 0);
        queue_input(
            &mut gs,
            0,
            build_frame(0, 1, V2::new(0.5, 0.0), BoxKind::Hullpiece),
        );
        gs.step(TIMESTEP);

        let grids: Vec<_> = gs.arena.ids_of_kind(EntityKind::Grid);
        assert_eq!(grids.len(), 1);
        let grid = gs.arena.get(grids[0]).unwrap();
        assert_eq!(grid.boxes.len(), 1);
        assert!(gs.arena.is_live(player));
    }

    #[test]
    fn build_on_existing_grid_snaps_to_adjacent_cell() {
        let mut gs = GameState::new();
        connect_slot(&mut gs, 0);
        queue_input(
            &mut gs,
            0,
            build_frame(0, 1, V2::new(0.5, 0.0), BoxKind::Hullpiece),
        );
        gs.step(TIMESTEP);
        // Second box right next to the first.
        queue_input(
            &mut gs,
            0,
            build_frame(1, 2, V2::new(0.5 + BOX_SIZE, 0.0), BoxKind::Thruster),
        );
        gs.step(TIMESTEP);

        let grids = gs.arena.ids_of_kind(EntityKind::Grid);
        assert_eq!(grids.len(), 1, "should snap instead of spawning a grid");
        assert_eq!(gs.arena.get(grids[0]).unwrap().boxes.len(), 2);
    }

    #[test]
    fn build_refuses_occupied_cell() {
        let mut gs = GameState::new();
        connect_slot(&mut gs, 0);
        queue_input(
            &mut gs,
            0,
            build_frame(0, 1, V2::new(0.5, 0.0), BoxKind::Hullpiece),
        );
        gs.step(TIMESTEP);
        queue_input(
            &mut gs,
            0,
            build_frame(1, 2, V2::new(0.5, 0.0), BoxKind::Hullpiece),
        );
        gs.step(TIMESTEP);

        let grids = gs.arena.ids_of_kind(EntityKind::Grid);
        assert_eq!(gs.arena.get(grids[0]).unwrap().boxes.len(), 1);
    }

    #[test]
    fn destroying_last_box_destroys_grid_same_step() {
        let mut gs = GameState::new();
        connect_slot(&mut gs, 0);
        queue_input(
            &mut gs,
            0,
            build_frame(0, 1, V2::new(0.5, 0.0), BoxKind::Hullpiece),
        );
        gs.step(TIMESTEP);
        let boxes = gs.arena.ids_of_kind(EntityKind::Box);
        assert_eq!(boxes.len(), 1);

        gs.arena.get_mut(boxes[0]).unwrap().damage = 1.0;
        gs.step(TIMESTEP);
        assert!(gs.arena.ids_of_kind(EntityKind::Box).is_empty());
        assert!(gs.arena.ids_of_kind(EntityKind::Grid).is_empty());
    }

    #[test]
    fn seat_and_unseat_keep_references_mutual() {
        let mut gs = GameState::new();
        let player = connect_slot(&mut gs, 0);
        let player_pos = gs.entity_pos(player).unwrap();
        let grid = gs.create_grid(player_pos + V2::new(0.6, 0.0), 0.0).unwrap();
        let seat = gs
            .create_box_on_grid(grid, BoxKind::Cockpit, V2::ZERO, 0)
            .unwrap();

        let seat_frame = InputFrame {
            tick: 0,
            id: 1,
            seat_action: true,
            hand_pos: V2::new(0.6, 0.0),
            ..InputFrame::default()
        };
        queue_input(&mut gs, 0, seat_frame);
        gs.step(TIMESTEP);

        assert_eq!(
            gs.arena.get(player).unwrap().currently_inside_of_box,
            Some(seat)
        );
        assert_eq!(
            gs.arena.get(seat).unwrap().player_who_is_inside_of_me,
            Some(player)
        );

        let unseat_frame = InputFrame {
            tick: 1,
            id: 2,
            seat_action: true,
            ..InputFrame::default()
        };
        queue_input(&mut gs, 0, unseat_frame);
        gs.step(TIMESTEP);

        assert_eq!(gs.arena.get(player).unwrap().currently_inside_of_box, None);
        assert_eq!(gs.arena.get(seat).unwrap().player_who_is_inside_of_me, None);
    }

    #[test]
    fn boundary_destroys_only_the_far_entity() {
        let mut gs = GameState::new();
        let far = gs
            .create_orb(V2::new(INSTANT_DEATH_DISTANCE_FROM_CENTER + 1.0, 0.0))
            .unwrap();
        let near = gs.create_orb(V2::new(1.0, 0.0)).unwrap();
        gs.step(TIMESTEP);
        assert!(!gs.arena.is_live(far));
        assert!(gs.arena.is_live(near));
    }

    #[test]
    fn missing_input_is_zero_input() {
        let mut gs = GameState::new();
        let player = connect_slot(&mut gs, 0);
        let moving = InputFrame {
            tick: 0,
            id: 1,
            movement: V2::new(1.0, 0.0),
            ..InputFrame::default()
        };
        queue_input(&mut gs, 0, moving);
        gs.step(TIMESTEP);
        assert_eq!(
            gs.arena.get(player).unwrap().input.movement,
            V2::new(1.0, 0.0)
        );
        // No frame for tick 1: input drops to zero.
        gs.step(TIMESTEP);
        assert_eq!(gs.arena.get(player).unwrap().input.movement, V2::ZERO);
    }

    #[test]
    fn thruster_moves_piloted_grid() {
        let mut gs = GameState::new();
        let player = connect_slot(&mut gs, 0);
        let player_pos = gs.entity_pos(player).unwrap();
        let grid = gs.create_grid(player_pos + V2::new(0.6, 0.0), 0.0).unwrap();
        let _seat = gs
            .create_box_on_grid(grid, BoxKind::Cockpit, V2::ZERO, 0)
            .unwrap();
        let _battery = gs
            .create_box_on_grid(grid, BoxKind::Battery, V2::new(BOX_SIZE, 0.0), 0)
            .unwrap();
        // Thruster facing +x pushes the ship toward +x.
        let _thruster = gs
            .create_box_on_grid(grid, BoxKind::Thruster, V2::new(-BOX_SIZE, 0.0), 0)
            .unwrap();

        queue_input(
            &mut gs,
            0,
            InputFrame {
                tick: 0,
                id: 1,
                seat_action: true,
                hand_pos: V2::new(0.6, 0.0),
                ..InputFrame::default()
            },
        );
        gs.step(TIMESTEP);
        for tick in 1..60 {
            queue_input(
                &mut gs,
                0,
                InputFrame {
                    tick,
                    id: tick + 1,
                    movement: V2::new(1.0, 0.0),
                    ..InputFrame::default()
                },
            );
            gs.step(TIMESTEP);
        }
        let body = gs.arena.get(grid).unwrap().body.unwrap();
        assert!(gs.physics.body_linvel(body).x > 0.0);
    }

    #[test]
    fn lethal_sun_damages_entities_inside_radius() {
        let mut gs = GameState::new();
        let sun = gs.arena.new_entity(EntityKind::Sun).unwrap();
        {
            let e = gs.arena.get_mut(sun).unwrap();
            e.pos = V2::ZERO;
            e.sun_radius = 5.0;
            e.sun_mass = 10.0;
            e.sun_is_safe = false;
        }
        let orb = gs.create_orb(V2::new(1.0, 0.0)).unwrap();
        gs.step(TIMESTEP);
        assert!(gs.arena.get(orb).unwrap().damage > 0.0);
    }

    #[test]
    fn squad_invite_accept_flow() {
        let mut gs = GameState::new();
        let a = connect_slot(&mut gs, 0);
        let b = connect_slot(&mut gs, 1);

        // A claims a squad, then invites B, who accepts.
        queue_input(
            &mut gs,
            0,
            InputFrame {
                tick: 0,
                id: 1,
                take_over_squad: 0,
                ..InputFrame::default()
            },
        );
        gs.step(TIMESTEP);
        assert_eq!(gs.arena.get(a).unwrap().squad, Squad::Red);

        queue_input(
            &mut gs,
            0,
            InputFrame {
                tick: 1,
                id: 2,
                invite_this_player: Some(b),
                ..InputFrame::default()
            },
        );
        gs.step(TIMESTEP);
        assert_eq!(gs.arena.get(b).unwrap().squad_invited_to, Squad::Red);

        queue_input(
            &mut gs,
            1,
            InputFrame {
                tick: 2,
                id: 1,
                accept_squad_invite: true,
                ..InputFrame::default()
            },
        );
        gs.step(TIMESTEP);
        assert_eq!(gs.arena.get(b).unwrap().squad, Squad::Red);
    }

    #[test]
    fn landing_gear_locks_to_a_grid_but_not_a_missile() {
        let mut gs = GameState::new();
        let ship = gs.create_grid(V2::ZERO, 0.0).unwrap();
        let gear = gs
            .create_box_on_grid(ship, BoxKind::LandingGear, V2::ZERO, 0)
            .unwrap();

        // A missile drifting inside lock range is not a compatible anchor.
        gs.create_missile(V2::new(0.5, 0.0), 0.0, V2::ZERO, Squad::None)
            .unwrap();
        gs.step(TIMESTEP);
        assert!(gs.arena.get(gear).unwrap().landed_constraint.is_none());

        // A slow grid right next to the gear is.
        let pad = gs.create_grid(V2::new(0.0, 0.6), 0.0).unwrap();
        gs.create_box_on_grid(pad, BoxKind::Hullpiece, V2::ZERO, 0)
            .unwrap();
        gs.step(TIMESTEP);
        assert!(gs.arena.get(gear).unwrap().landed_constraint.is_some());
    }

    #[test]
    fn explosion_expires_after_explosion_time() {
        let mut gs = GameState::new();
        let boom = gs.create_explosion(V2::new(50.0, 0.0), V2::ZERO).unwrap();
        let ticks = (EXPLOSION_TIME / TIMESTEP).ceil() as usize + 1;
        for _ in 0..ticks {
            gs.step(TIMESTEP);
        }
        assert!(!gs.arena.is_live(boom));
    }
}
