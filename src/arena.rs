//! Fixed-capacity entity arena with generational ids.
//!
//! Slots are recycled through a free list; freeing a slot bumps its
//! generation so every stale [`EntityId`] held anywhere (other entities,
//! wire messages, physics user data) safely resolves to `None` instead of
//! the slot's new occupant.

use thiserror::Error;

use crate::components::{Entity, EntityKind};
use crate::constants::MAX_ENTITIES;
use crate::physics::PhysicsWorld;

/// Stable reference to an arena slot: index plus the generation it was
/// allocated under. `{0, 0}` never names a live entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntityId {
    pub index: u32,
    pub generation: u32,
}

impl EntityId {
    /// Pack into physics `user_data` so query hits resolve back to entities.
    pub fn to_user_data(self) -> u128 {
        (u128::from(self.index) << 32) | u128::from(self.generation)
    }

    pub fn from_user_data(data: u128) -> Option<Self> {
        if data == 0 {
            return None;
        }
        Some(Self {
            index: (data >> 32) as u32,
            generation: data as u32,
        })
    }
}

/// The arena refused an allocation because every slot is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("entity arena is full")]
pub struct OutOfEntities;

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    entity: Option<Entity>,
}

/// Fixed-capacity store of every simulated entity.
#[derive(Debug, Clone)]
pub struct EntityArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    capacity: usize,
}

impl Default for EntityArena {
    fn default() -> Self {
        Self::new(MAX_ENTITIES)
    }
}

impl EntityArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            capacity,
        }
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Allocate a fresh entity of `kind`.
    pub fn new_entity(&mut self, kind: EntityKind) -> Result<EntityId, OutOfEntities> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= self.capacity {
                    return Err(OutOfEntities);
                }
                self.slots.push(Slot {
                    generation: 1,
                    entity: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.entity.is_none());
        slot.entity = Some(Entity::new(kind));
        self.live += 1;
        Ok(EntityId {
            index,
            generation: slot.generation,
        })
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entity.as_ref()
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entity.as_mut()
    }

    pub fn is_live(&self, id: EntityId) -> bool {
        self.get(id).is_some()
    }

    /// Destroy an entity and release its physics resources. Idempotent:
    /// destroying an already-dead id does nothing. Destroying a grid
    /// destroys its child boxes in the same call.
    pub fn destroy(&mut self, id: EntityId, physics: &mut PhysicsWorld) {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return;
        };
        if slot.generation != id.generation {
            return;
        }
        let Some(entity) = slot.entity.take() else {
            return;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;

        match entity.kind {
            EntityKind::Grid => {
                for child in entity.boxes {
                    self.destroy(child, physics);
                }
                if let Some(body) = entity.body {
                    physics.destroy_body(body);
                }
            }
            EntityKind::Box => {
                if let Some(joint) = entity.landed_constraint {
                    physics.destroy_joint(joint);
                }
                if let Some(shape) = entity.shape {
                    physics.destroy_shape(shape);
                }
                // Unseat whoever was inside and give them contacts back.
                if let Some(player_id) = entity.player_who_is_inside_of_me {
                    if let Some(player) = self.get_mut(player_id) {
                        player.currently_inside_of_box = None;
                        if let Some(shape) = player.shape {
                            physics.set_shape_sensor(shape, false);
                        }
                    }
                }
                // Unlink from the parent grid (a no-op when the grid
                // itself is mid-destruction).
                if let Some(grid_id) = entity.parent_grid {
                    if let Some(grid) = self.get_mut(grid_id) {
                        grid.boxes.retain(|b| *b != id);
                    }
                }
            }
            EntityKind::Player => {
                if let Some(box_id) = entity.currently_inside_of_box {
                    if let Some(seat) = self.get_mut(box_id) {
                        seat.player_who_is_inside_of_me = None;
                    }
                }
                if let Some(body) = entity.body {
                    physics.destroy_body(body);
                }
            }
            EntityKind::Sun | EntityKind::Missile | EntityKind::Orb => {
                if let Some(body) = entity.body {
                    physics.destroy_body(body);
                }
            }
            EntityKind::Explosion => {}
        }
    }

    /// Snapshot restore: place an entity at exactly `id`, growing the slot
    /// table as needed. Meant for decoding into a fresh arena; returns
    /// false on an out-of-range index, an occupied slot, or the reserved
    /// zero generation. Call [`EntityArena::rebuild_free_list`] after the
    /// batch.
    pub fn restore(&mut self, id: EntityId, entity: Entity) -> bool {
        if id.index as usize >= self.capacity || id.generation == 0 {
            return false;
        }
        while self.slots.len() <= id.index as usize {
            self.slots.push(Slot {
                generation: 0,
                entity: None,
            });
        }
        let slot = &mut self.slots[id.index as usize];
        if slot.entity.is_some() {
            return false;
        }
        slot.generation = id.generation;
        slot.entity = Some(entity);
        self.live += 1;
        true
    }

    /// Recompute the free list after a batch of [`EntityArena::restore`]
    /// calls. Never-allocated slots get generation 1 so the zero sentinel
    /// stays unused.
    pub fn rebuild_free_list(&mut self) {
        self.free.clear();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.entity.is_none() {
                if slot.generation == 0 {
                    slot.generation = 1;
                }
                self.free.push(index as u32);
            }
        }
    }

    /// Every live entity, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entity.as_ref().map(|entity| {
                (
                    EntityId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entity,
                )
            })
        })
    }

    pub fn iter_kind(&self, kind: EntityKind) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.iter().filter(move |(_, e)| e.kind == kind)
    }

    /// Snapshot of live ids, for loops that mutate while iterating.
    pub fn ids(&self) -> Vec<EntityId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn ids_of_kind(&self, kind: EntityKind) -> Vec<EntityId> {
        self.iter_kind(kind).map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_some_until_destroy() {
        let mut arena = EntityArena::new(8);
        let mut physics = PhysicsWorld::new();
        let id = arena.new_entity(EntityKind::Orb).unwrap();
        assert!(arena.get(id).is_some());
        arena.destroy(id, &mut physics);
        assert!(arena.get(id).is_none());
        // Idempotent.
        arena.destroy(id, &mut physics);
        assert!(arena.get(id).is_none());
    }

    #[test]
    fn stale_id_does_not_resolve_to_reused_slot() {
        let mut arena = EntityArena::new(1);
        let mut physics = PhysicsWorld::new();
        let first = arena.new_entity(EntityKind::Orb).unwrap();
        arena.destroy(first, &mut physics);
        let second = arena.new_entity(EntityKind::Player).unwrap();
        assert_eq!(first.index, second.index);
        assert!(arena.get(first).is_none());
        assert!(arena.get(second).is_some());
    }

    #[test]
    fn arena_full_reports_out_of_entities() {
        let mut arena = EntityArena::new(2);
        arena.new_entity(EntityKind::Orb).unwrap();
        arena.new_entity(EntityKind::Orb).unwrap();
        assert_eq!(arena.new_entity(EntityKind::Orb), Err(OutOfEntities));
    }

    #[test]
    fn destroying_grid_destroys_children() {
        let mut arena = EntityArena::new(8);
        let mut physics = PhysicsWorld::new();
        let grid = arena.new_entity(EntityKind::Grid).unwrap();
        let child = arena.new_entity(EntityKind::Box).unwrap();
        arena.get_mut(child).unwrap().parent_grid = Some(grid);
        arena.get_mut(grid).unwrap().boxes.push(child);

        arena.destroy(grid, &mut physics);
        assert!(arena.get(grid).is_none());
        assert!(arena.get(child).is_none());
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn destroying_seat_unseats_player() {
        let mut arena = EntityArena::new(8);
        let mut physics = PhysicsWorld::new();
        let seat = arena.new_entity(EntityKind::Box).unwrap();
        let player = arena.new_entity(EntityKind::Player).unwrap();
        arena.get_mut(seat).unwrap().player_who_is_inside_of_me = Some(player);
        arena.get_mut(player).unwrap().currently_inside_of_box = Some(seat);

        arena.destroy(seat, &mut physics);
        assert_eq!(
            arena.get(player).unwrap().currently_inside_of_box,
            None
        );
    }

    #[test]
    fn user_data_round_trip() {
        let id = EntityId {
            index: 1234,
            generation: 77,
        };
        assert_eq!(EntityId::from_user_data(id.to_user_data()), Some(id));
        assert_eq!(EntityId::from_user_data(0), None);
    }
}
