//! 2D math primitives for the simulation.
//!
//! Everything is double precision; angles are radians, counter-clockwise
//! positive. These types stay independent of the physics engine so the
//! codec and game logic never depend on engine internals.

use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

use crate::constants::BOX_SIZE;

/// A 2D vector or point.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct V2 {
    pub x: f64,
    pub y: f64,
}

impl V2 {
    pub const ZERO: V2 = V2 { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Unit vector at `angle` radians from +x.
    pub fn from_angle(angle: f64) -> Self {
        Self {
            x: angle.cos(),
            y: angle.sin(),
        }
    }

    pub fn dot(self, other: V2) -> f64 {
        self.x * other.x + self.y * other.y
    }

    pub fn length_sq(self) -> f64 {
        self.dot(self)
    }

    pub fn length(self) -> f64 {
        self.length_sq().sqrt()
    }

    pub fn distance(self, other: V2) -> f64 {
        (self - other).length()
    }

    /// Normalized copy, or zero when the length is (near) zero.
    pub fn normalize_or_zero(self) -> V2 {
        let len = self.length();
        if len <= f64::EPSILON {
            V2::ZERO
        } else {
            self * (1.0 / len)
        }
    }

    /// Rotate counter-clockwise by `angle` radians.
    pub fn rotate(self, angle: f64) -> V2 {
        let (sin, cos) = angle.sin_cos();
        V2 {
            x: self.x * cos - self.y * sin,
            y: self.x * sin + self.y * cos,
        }
    }

    /// Angle from +x in radians, in (-pi, pi].
    pub fn angle(self) -> f64 {
        self.y.atan2(self.x)
    }

    pub fn lerp(self, other: V2, t: f64) -> V2 {
        self + (other - self) * t
    }

    /// Clamp the length to `max`, preserving direction.
    pub fn clamp_length(self, max: f64) -> V2 {
        let len_sq = self.length_sq();
        if len_sq > max * max {
            self.normalize_or_zero() * max
        } else {
            self
        }
    }
}

impl Add for V2 {
    type Output = V2;
    fn add(self, rhs: V2) -> V2 {
        V2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for V2 {
    fn add_assign(&mut self, rhs: V2) {
        *self = *self + rhs;
    }
}

impl Sub for V2 {
    type Output = V2;
    fn sub(self, rhs: V2) -> V2 {
        V2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl SubAssign for V2 {
    fn sub_assign(&mut self, rhs: V2) {
        *self = *self - rhs;
    }
}

impl Mul<f64> for V2 {
    type Output = V2;
    fn mul(self, rhs: f64) -> V2 {
        V2::new(self.x * rhs, self.y * rhs)
    }
}

impl Neg for V2 {
    type Output = V2;
    fn neg(self) -> V2 {
        V2::new(-self.x, -self.y)
    }
}

/// Interpolate between two angles along the shortest arc.
pub fn angle_lerp(from: f64, to: f64, t: f64) -> f64 {
    use std::f64::consts::{PI, TAU};
    let mut diff = (to - from) % TAU;
    if diff > PI {
        diff -= TAU;
    } else if diff < -PI {
        diff += TAU;
    }
    from + diff * t
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: V2,
    pub max: V2,
}

impl Aabb {
    pub fn new(min: V2, max: V2) -> Self {
        Self { min, max }
    }

    pub fn from_center(center: V2, half_extents: V2) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    pub fn contains(&self, p: V2) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }
}

/// Oriented box: center, half extents, rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Obb {
    pub center: V2,
    pub half_extents: V2,
    pub rotation: f64,
}

impl Obb {
    pub fn new(center: V2, half_extents: V2, rotation: f64) -> Self {
        Self {
            center,
            half_extents,
            rotation,
        }
    }

    /// Point test in the box's local frame.
    pub fn contains(&self, p: V2) -> bool {
        let local = (p - self.center).rotate(-self.rotation);
        local.x.abs() <= self.half_extents.x && local.y.abs() <= self.half_extents.y
    }
}

/// Snap a world point to the nearest cell center of a grid's lattice.
///
/// The lattice has [`BOX_SIZE`] pitch in the grid's local frame, anchored at
/// the grid origin.
pub fn grid_snapped(grid_pos: V2, grid_rotation: f64, world_point: V2) -> V2 {
    let local = (world_point - grid_pos).rotate(-grid_rotation);
    let snapped = V2::new(
        (local.x / BOX_SIZE).round() * BOX_SIZE,
        (local.y / BOX_SIZE).round() * BOX_SIZE,
    );
    snapped.rotate(grid_rotation) + grid_pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn rotate_quarter_turn() {
        let v = V2::new(1.0, 0.0).rotate(FRAC_PI_2);
        assert!(close(v.x, 0.0));
        assert!(close(v.y, 1.0));
    }

    #[test]
    fn normalize_zero_is_zero() {
        assert_eq!(V2::ZERO.normalize_or_zero(), V2::ZERO);
    }

    #[test]
    fn angle_lerp_takes_shortest_arc() {
        // 350° to 10° should pass through 0°, not 180°.
        let from = 350.0_f64.to_radians();
        let to = 10.0_f64.to_radians();
        let mid = angle_lerp(from, to, 0.5);
        assert!(close(mid.rem_euclid(2.0 * PI), 0.0) || close(mid.rem_euclid(2.0 * PI), 2.0 * PI));
    }

    #[test]
    fn aabb_contains_is_inclusive_of_edges() {
        let aabb = Aabb::from_center(V2::new(1.0, 1.0), V2::new(0.5, 0.25));
        assert!(aabb.contains(V2::new(1.0, 1.0)));
        assert!(aabb.contains(V2::new(1.5, 1.25)));
        assert!(!aabb.contains(V2::new(1.6, 1.0)));
        assert!(!aabb.contains(V2::new(1.0, 1.3)));
    }

    #[test]
    fn aabb_constructors_agree() {
        let from_corners = Aabb::new(V2::new(-1.0, -2.0), V2::new(3.0, 4.0));
        let from_center = Aabb::from_center(V2::new(1.0, 1.0), V2::new(2.0, 3.0));
        assert_eq!(from_corners, from_center);
    }

    #[test]
    fn obb_respects_rotation() {
        let obb = Obb::new(V2::ZERO, V2::new(1.0, 0.1), FRAC_PI_2);
        // The long axis now points along +y.
        assert!(obb.contains(V2::new(0.0, 0.9)));
        assert!(!obb.contains(V2::new(0.9, 0.0)));
    }

    #[test]
    fn grid_snap_on_rotated_grid() {
        let grid_pos = V2::new(10.0, 0.0);
        let rot = FRAC_PI_2;
        // A point exactly one cell along the grid's local +x.
        let world = V2::new(10.0, BOX_SIZE).rotate(0.0);
        let snapped = grid_snapped(grid_pos, rot, world + V2::new(0.01, 0.01));
        assert!(close(snapped.x, 10.0));
        assert!(close(snapped.y, BOX_SIZE));
    }

    #[test]
    fn clamp_length_preserves_direction() {
        let v = V2::new(3.0, 4.0).clamp_length(1.0);
        assert!(close(v.length(), 1.0));
        assert!(close(v.angle(), V2::new(3.0, 4.0).angle()));
    }
}
