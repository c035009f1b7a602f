//! Thin facade over the Rapier rigid-body engine.
//!
//! The simulation only ever talks to this narrow API: bodies, box shapes,
//! pivot/slide/weld constraints, forces, and spatial queries. Handles carry
//! the owning entity id in their `user_data` so query results resolve back
//! into the arena. Stepping is deterministic for identical inputs on a
//! single machine; cross-machine drift is corrected by snapshots.

use rapier2d_f64::parry::query::{PointQuery, RayCast};
use rapier2d_f64::prelude::*;

use crate::math::V2;

pub type BodyHandle = RigidBodyHandle;
pub type ShapeHandle = ColliderHandle;
pub type JointHandle = ImpulseJointHandle;

/// Whether a body participates in dynamics or just occupies space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Dynamic,
    Static,
}

/// Result of a successful raycast.
#[derive(Debug, Clone, Copy)]
pub struct RayHit {
    pub shape: ShapeHandle,
    pub body: BodyHandle,
    pub distance: f64,
    pub point: V2,
}

fn to_na(v: V2) -> Vector<f64> {
    vector![v.x, v.y]
}

fn from_na(v: Vector<f64>) -> V2 {
    V2::new(v.x, v.y)
}

/// Owns every Rapier set and solver stage.
pub struct PhysicsWorld {
    pub rigid_body_set: RigidBodySet,
    pub collider_set: ColliderSet,
    gravity: Vector<f64>,
    integration_parameters: IntegrationParameters,
    physics_pipeline: PhysicsPipeline,
    island_manager: IslandManager,
    broad_phase: BroadPhaseBvh,
    narrow_phase: NarrowPhase,
    impulse_joint_set: ImpulseJointSet,
    multibody_joint_set: MultibodyJointSet,
    ccd_solver: CCDSolver,
}

impl Default for PhysicsWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicsWorld {
    pub fn new() -> Self {
        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = crate::constants::TIMESTEP;

        Self {
            rigid_body_set: RigidBodySet::new(),
            collider_set: ColliderSet::new(),
            // No ambient gravity in space; suns pull explicitly.
            gravity: vector![0.0, 0.0],
            integration_parameters,
            physics_pipeline: PhysicsPipeline::new(),
            island_manager: IslandManager::new(),
            broad_phase: BroadPhaseBvh::new(),
            narrow_phase: NarrowPhase::new(),
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
        }
    }

    // ── Bodies ────────────────────────────────────────────────────────────

    /// Create a body with explicit mass and angular inertia. Shapes attached
    /// later are zero-density so these properties stay authoritative.
    pub fn create_body(
        &mut self,
        kind: BodyKind,
        pos: V2,
        rotation: f64,
        mass: f64,
        moment: f64,
        user_data: u128,
    ) -> BodyHandle {
        let builder = match kind {
            BodyKind::Dynamic => RigidBodyBuilder::dynamic(),
            BodyKind::Static => RigidBodyBuilder::fixed(),
        };
        let body = builder
            .translation(to_na(pos))
            .rotation(rotation)
            .additional_mass_properties(MassProperties::new(point![0.0, 0.0], mass, moment))
            .user_data(user_data)
            .build();
        self.rigid_body_set.insert(body)
    }

    /// Remove a body along with its attached shapes and joints.
    pub fn destroy_body(&mut self, handle: BodyHandle) {
        self.rigid_body_set.remove(
            handle,
            &mut self.island_manager,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            true,
        );
    }

    /// Replace a body's explicit mass properties (e.g. after a grid gains
    /// or loses boxes).
    pub fn set_body_mass(&mut self, handle: BodyHandle, local_com: V2, mass: f64, moment: f64) {
        if let Some(body) = self.rigid_body_set.get_mut(handle) {
            body.set_additional_mass_properties(
                MassProperties::new(point![local_com.x, local_com.y], mass, moment),
                true,
            );
        }
    }

    pub fn body_position(&self, handle: BodyHandle) -> V2 {
        self.rigid_body_set
            .get(handle)
            .map(|b| from_na(*b.translation()))
            .unwrap_or(V2::ZERO)
    }

    pub fn body_rotation(&self, handle: BodyHandle) -> f64 {
        self.rigid_body_set
            .get(handle)
            .map(|b| b.rotation().angle())
            .unwrap_or(0.0)
    }

    pub fn set_body_position(&mut self, handle: BodyHandle, pos: V2, rotation: f64) {
        if let Some(body) = self.rigid_body_set.get_mut(handle) {
            body.set_position(Isometry::new(to_na(pos), rotation), true);
        }
    }

    pub fn body_linvel(&self, handle: BodyHandle) -> V2 {
        self.rigid_body_set
            .get(handle)
            .map(|b| from_na(*b.linvel()))
            .unwrap_or(V2::ZERO)
    }

    pub fn set_body_linvel(&mut self, handle: BodyHandle, vel: V2) {
        if let Some(body) = self.rigid_body_set.get_mut(handle) {
            body.set_linvel(to_na(vel), true);
        }
    }

    pub fn body_angvel(&self, handle: BodyHandle) -> f64 {
        self.rigid_body_set
            .get(handle)
            .map(|b| b.angvel())
            .unwrap_or(0.0)
    }

    pub fn set_body_angvel(&mut self, handle: BodyHandle, angvel: f64) {
        if let Some(body) = self.rigid_body_set.get_mut(handle) {
            body.set_angvel(angvel, true);
        }
    }

    pub fn body_mass(&self, handle: BodyHandle) -> f64 {
        self.rigid_body_set
            .get(handle)
            .map(|b| b.mass())
            .unwrap_or(0.0)
    }

    pub fn body_user_data(&self, handle: BodyHandle) -> u128 {
        self.rigid_body_set
            .get(handle)
            .map(|b| b.user_data)
            .unwrap_or(0)
    }

    // ── Forces ────────────────────────────────────────────────────────────

    pub fn apply_force_at_point(&mut self, handle: BodyHandle, force: V2, world_point: V2) {
        if let Some(body) = self.rigid_body_set.get_mut(handle) {
            body.add_force_at_point(to_na(force), point![world_point.x, world_point.y], true);
        }
    }

    pub fn apply_force(&mut self, handle: BodyHandle, force: V2) {
        if let Some(body) = self.rigid_body_set.get_mut(handle) {
            body.add_force(to_na(force), true);
        }
    }

    pub fn apply_impulse_at_point(&mut self, handle: BodyHandle, impulse: V2, world_point: V2) {
        if let Some(body) = self.rigid_body_set.get_mut(handle) {
            body.apply_impulse_at_point(to_na(impulse), point![world_point.x, world_point.y], true);
        }
    }

    pub fn apply_torque(&mut self, handle: BodyHandle, torque: f64) {
        if let Some(body) = self.rigid_body_set.get_mut(handle) {
            body.add_torque(torque, true);
        }
    }

    // ── Shapes ────────────────────────────────────────────────────────────

    /// Attach an axis-aligned box shape at a local offset of `body`.
    pub fn attach_box_shape(
        &mut self,
        body: BodyHandle,
        half_extents: V2,
        local_pos: V2,
        local_rotation: f64,
        user_data: u128,
    ) -> ShapeHandle {
        let collider = ColliderBuilder::cuboid(half_extents.x, half_extents.y)
            .position(Isometry::new(to_na(local_pos), local_rotation))
            .density(0.0)
            .user_data(user_data)
            .build();
        self.collider_set
            .insert_with_parent(collider, body, &mut self.rigid_body_set)
    }

    /// Sensors keep their pose and stay visible to queries but generate no
    /// contacts (a seated player rides inside their ship's hull).
    pub fn set_shape_sensor(&mut self, handle: ShapeHandle, sensor: bool) {
        if let Some(collider) = self.collider_set.get_mut(handle) {
            collider.set_sensor(sensor);
        }
    }

    pub fn destroy_shape(&mut self, handle: ShapeHandle) {
        self.collider_set.remove(
            handle,
            &mut self.island_manager,
            &mut self.rigid_body_set,
            true,
        );
    }

    pub fn shape_user_data(&self, handle: ShapeHandle) -> u128 {
        self.collider_set
            .get(handle)
            .map(|c| c.user_data)
            .unwrap_or(0)
    }

    pub fn shape_body(&self, handle: ShapeHandle) -> Option<BodyHandle> {
        self.collider_set.get(handle).and_then(|c| c.parent())
    }

    /// World pose of a shape, derived from its parent body so it is exact
    /// even between teleport and step.
    pub fn shape_world_pose(&self, handle: ShapeHandle) -> Option<(V2, f64)> {
        let collider = self.collider_set.get(handle)?;
        let iso = match collider.parent() {
            Some(parent) => {
                let body = self.rigid_body_set.get(parent)?;
                let identity = Isometry::identity();
                let local = collider.position_wrt_parent().unwrap_or(&identity);
                body.position() * local
            }
            None => *collider.position(),
        };
        Some((from_na(iso.translation.vector), iso.rotation.angle()))
    }

    // ── Joints ────────────────────────────────────────────────────────────

    /// Pin two bodies together at a shared world point, free to rotate.
    pub fn create_pivot_joint(
        &mut self,
        body1: BodyHandle,
        body2: BodyHandle,
        world_anchor: V2,
    ) -> Option<JointHandle> {
        let a1 = self.world_to_local(body1, world_anchor)?;
        let a2 = self.world_to_local(body2, world_anchor)?;
        let joint = RevoluteJointBuilder::new()
            .local_anchor1(point![a1.x, a1.y])
            .local_anchor2(point![a2.x, a2.y])
            .build();
        Some(self.impulse_joint_set.insert(body1, body2, joint, true))
    }

    /// Constrain two bodies to slide along a world-space axis.
    pub fn create_slide_joint(
        &mut self,
        body1: BodyHandle,
        body2: BodyHandle,
        world_anchor: V2,
        world_axis: V2,
    ) -> Option<JointHandle> {
        let a1 = self.world_to_local(body1, world_anchor)?;
        let a2 = self.world_to_local(body2, world_anchor)?;
        let rot1 = self.body_rotation(body1);
        let local_axis = world_axis.rotate(-rot1).normalize_or_zero();
        let axis = UnitVector::new_normalize(vector![local_axis.x, local_axis.y]);
        let joint = PrismaticJointBuilder::new(axis)
            .local_anchor1(point![a1.x, a1.y])
            .local_anchor2(point![a2.x, a2.y])
            .build();
        Some(self.impulse_joint_set.insert(body1, body2, joint, true))
    }

    /// Weld two bodies rigidly in their current relative pose.
    pub fn create_weld_joint(&mut self, body1: BodyHandle, body2: BodyHandle) -> Option<JointHandle> {
        let pose1 = *self.rigid_body_set.get(body1)?.position();
        let pose2 = *self.rigid_body_set.get(body2)?.position();
        // frame2 expressed in body1's frame keeps the current offset.
        let relative = pose1.inv_mul(&pose2);
        let joint = FixedJointBuilder::new()
            .local_frame1(relative)
            .local_frame2(Isometry::identity())
            .build();
        Some(self.impulse_joint_set.insert(body1, body2, joint, true))
    }

    pub fn destroy_joint(&mut self, handle: JointHandle) {
        self.impulse_joint_set.remove(handle, true);
    }

    fn world_to_local(&self, body: BodyHandle, world_point: V2) -> Option<V2> {
        let b = self.rigid_body_set.get(body)?;
        let local = b
            .position()
            .inverse_transform_point(&point![world_point.x, world_point.y]);
        Some(V2::new(local.x, local.y))
    }

    // ── Queries ───────────────────────────────────────────────────────────

    /// First shape hit along a ray, excluding `exclude_body`'s shapes.
    pub fn raycast(
        &self,
        origin: V2,
        dir: V2,
        max_dist: f64,
        exclude_body: Option<BodyHandle>,
    ) -> Option<RayHit> {
        let dir = dir.normalize_or_zero();
        if dir == V2::ZERO {
            return None;
        }
        let ray = Ray::new(point![origin.x, origin.y], to_na(dir));
        let mut best: Option<RayHit> = None;
        for (handle, collider) in self.collider_set.iter() {
            let Some(body) = collider.parent() else {
                continue;
            };
            if exclude_body == Some(body) {
                continue;
            }
            let Some((pos, rot)) = self.shape_world_pose(handle) else {
                continue;
            };
            let pose = Isometry::new(to_na(pos), rot);
            if let Some(toi) = collider.shape().cast_ray(&pose, &ray, max_dist, true) {
                if best.is_none_or(|b| toi < b.distance) {
                    best = Some(RayHit {
                        shape: handle,
                        body,
                        distance: toi,
                        point: origin + dir * toi,
                    });
                }
            }
        }
        best
    }

    /// Nearest shape within `radius` of `point`, excluding `exclude_body`.
    pub fn nearest_shape_within(
        &self,
        point: V2,
        radius: f64,
        exclude_body: Option<BodyHandle>,
    ) -> Option<(ShapeHandle, f64)> {
        let query = point![point.x, point.y];
        let mut best: Option<(ShapeHandle, f64)> = None;
        for (handle, collider) in self.collider_set.iter() {
            if let Some(body) = collider.parent() {
                if exclude_body == Some(body) {
                    continue;
                }
            }
            let Some((pos, rot)) = self.shape_world_pose(handle) else {
                continue;
            };
            let pose = Isometry::new(to_na(pos), rot);
            let projection = collider.shape().project_point(&pose, &query, true);
            let dist = if projection.is_inside {
                0.0
            } else {
                V2::new(projection.point.x, projection.point.y).distance(point)
            };
            if dist <= radius && best.is_none_or(|(_, d)| dist < d) {
                best = Some((handle, dist));
            }
        }
        best
    }

    // ── Stepping ──────────────────────────────────────────────────────────

    /// Advance the world by `dt`, then clear accumulated forces so every
    /// tick starts from the forces applied during that tick only.
    pub fn step(&mut self, dt: f64) {
        self.integration_parameters.dt = dt;
        self.physics_pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.rigid_body_set,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            &mut self.ccd_solver,
            &(),
            &(),
        );
        for (_, body) in self.rigid_body_set.iter_mut() {
            body.reset_forces(false);
            body.reset_torques(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_moves_dynamic_body() {
        let mut world = PhysicsWorld::new();
        let body = world.create_body(BodyKind::Dynamic, V2::ZERO, 0.0, 1.0, 0.1, 1);
        world.attach_box_shape(body, V2::new(0.25, 0.25), V2::ZERO, 0.0, 1);

        world.apply_force(body, V2::new(1.0, 0.0));
        world.step(1.0 / 60.0);

        assert!(world.body_position(body).x > 0.0);
        assert!(world.body_linvel(body).x > 0.0);
    }

    #[test]
    fn raycast_hits_nearest_shape_first() {
        let mut world = PhysicsWorld::new();
        let near = world.create_body(BodyKind::Static, V2::new(2.0, 0.0), 0.0, 0.0, 0.0, 1);
        world.attach_box_shape(near, V2::new(0.25, 0.25), V2::ZERO, 0.0, 1);
        let far = world.create_body(BodyKind::Static, V2::new(5.0, 0.0), 0.0, 0.0, 0.0, 2);
        world.attach_box_shape(far, V2::new(0.25, 0.25), V2::ZERO, 0.0, 2);

        let hit = world
            .raycast(V2::ZERO, V2::new(1.0, 0.0), 10.0, None)
            .expect("ray should hit");
        assert_eq!(hit.body, near);
        assert!((hit.distance - 1.75).abs() < 1e-6);
    }

    #[test]
    fn body_user_data_survives_until_destruction() {
        let mut world = PhysicsWorld::new();
        let body = world.create_body(BodyKind::Dynamic, V2::ZERO, 0.0, 1.0, 0.1, 42);
        assert_eq!(world.body_user_data(body), 42);
        world.destroy_body(body);
        assert_eq!(world.body_user_data(body), 0);
    }

    #[test]
    fn nearest_shape_respects_exclusion() {
        let mut world = PhysicsWorld::new();
        let a = world.create_body(BodyKind::Static, V2::new(1.0, 0.0), 0.0, 0.0, 0.0, 1);
        world.attach_box_shape(a, V2::new(0.25, 0.25), V2::ZERO, 0.0, 1);
        let b = world.create_body(BodyKind::Static, V2::new(2.0, 0.0), 0.0, 0.0, 0.0, 2);
        world.attach_box_shape(b, V2::new(0.25, 0.25), V2::ZERO, 0.0, 2);

        let (shape, _) = world
            .nearest_shape_within(V2::ZERO, 5.0, Some(a))
            .expect("should find b");
        assert_eq!(world.shape_body(shape), Some(b));
    }

    #[test]
    fn pivot_joint_keeps_bodies_anchored() {
        let mut world = PhysicsWorld::new();
        let a = world.create_body(BodyKind::Static, V2::ZERO, 0.0, 0.0, 0.0, 1);
        let b = world.create_body(BodyKind::Dynamic, V2::new(1.0, 0.0), 0.0, 1.0, 0.1, 2);
        world.attach_box_shape(b, V2::new(0.1, 0.1), V2::ZERO, 0.0, 2);
        let joint = world
            .create_pivot_joint(a, b, V2::new(0.5, 0.0))
            .expect("joint");

        // Push the dynamic body; the pivot holds it at arm's length.
        for _ in 0..120 {
            world.apply_force(b, V2::new(10.0, 10.0));
            world.step(1.0 / 60.0);
        }
        let dist = world.body_position(b).distance(V2::new(0.5, 0.0));
        assert!((dist - 0.5).abs() < 0.1, "pivot arm length drifted: {dist}");

        world.destroy_joint(joint);
    }

    #[test]
    fn slide_joint_constrains_to_axis() {
        let mut world = PhysicsWorld::new();
        let a = world.create_body(BodyKind::Static, V2::ZERO, 0.0, 0.0, 0.0, 1);
        let b = world.create_body(BodyKind::Dynamic, V2::new(1.0, 0.0), 0.0, 1.0, 0.1, 2);
        world.attach_box_shape(b, V2::new(0.1, 0.1), V2::ZERO, 0.0, 2);
        world
            .create_slide_joint(a, b, V2::new(1.0, 0.0), V2::new(1.0, 0.0))
            .expect("joint");

        // A sideways shove must not move the slider off its rail.
        for _ in 0..60 {
            world.apply_force(b, V2::new(2.0, 5.0));
            world.step(1.0 / 60.0);
        }
        assert!(world.body_position(b).y.abs() < 0.05);
    }

    #[test]
    fn destroy_body_removes_shapes() {
        let mut world = PhysicsWorld::new();
        let body = world.create_body(BodyKind::Dynamic, V2::ZERO, 0.0, 1.0, 0.1, 1);
        world.attach_box_shape(body, V2::new(0.25, 0.25), V2::ZERO, 0.0, 1);
        world.destroy_body(body);
        assert!(world.nearest_shape_within(V2::ZERO, 1.0, None).is_none());
    }
}
