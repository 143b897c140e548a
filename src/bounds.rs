// src/bounds.rs
//! Axis-aligned bounding boxes and their world-space transforms.
//!
//! These feed both sides of the culling pipeline: the CPU builds a BVH over
//! world-space boxes for broad-phase hints, and the same boxes are uploaded
//! (as [`AabbGpu`]) for the authoritative per-instance compute test.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Axis-aligned bounding box. Invariant: `min <= max` componentwise.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Box around a single point (degenerate but valid).
    pub fn from_point(p: Vec3) -> Self {
        Self { min: p, max: p }
    }

    /// Tight bound of a point cloud. Returns `None` for an empty slice.
    pub fn from_points(points: &[Vec3]) -> Option<Self> {
        let first = *points.first()?;
        let mut aabb = Self::from_point(first);
        for &p in &points[1..] {
            aabb.min = aabb.min.min(p);
            aabb.max = aabb.max.max(p);
        }
        Some(aabb)
    }

    /// Grow this box to also contain `other`.
    pub fn expand(&mut self, other: &Aabb) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Non-mutating union of two boxes.
    pub fn union(a: &Aabb, b: &Aabb) -> Aabb {
        Aabb {
            min: a.min.min(b.min),
            max: a.max.max(b.max),
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Index of the longest axis (0 = x, 1 = y, 2 = z).
    pub fn longest_axis(&self) -> usize {
        let size = self.size();
        if size.y > size.x && size.y > size.z {
            1
        } else if size.z > size.x {
            2
        } else {
            0
        }
    }

    /// The 8 corner points, min-z face first.
    pub fn corners(&self) -> [Vec3; 8] {
        let (mn, mx) = (self.min, self.max);
        [
            Vec3::new(mn.x, mn.y, mn.z),
            Vec3::new(mx.x, mn.y, mn.z),
            Vec3::new(mn.x, mx.y, mn.z),
            Vec3::new(mx.x, mx.y, mn.z),
            Vec3::new(mn.x, mn.y, mx.z),
            Vec3::new(mx.x, mn.y, mx.z),
            Vec3::new(mn.x, mx.y, mx.z),
            Vec3::new(mx.x, mx.y, mx.z),
        ]
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }
}

/// Transform an object-space box through a world matrix by mapping all 8
/// corners and re-deriving min/max. Over-approximates rotated boxes but never
/// loses volume, which keeps the downstream culling tests conservative.
pub fn transform_aabb(aabb: &Aabb, world: &Mat4) -> Aabb {
    debug_assert!(
        aabb.min.cmple(aabb.max).all(),
        "min must be <= max on all axes"
    );

    let mut min = Vec3::splat(f32::MAX);
    let mut max = Vec3::splat(f32::MIN);
    for corner in aabb.corners() {
        let moved = world.transform_point3(corner);
        min = min.min(moved);
        max = max.max(moved);
    }
    Aabb { min, max }
}

/// An AABB plus the index of the instance it bounds. Keeps object identity
/// through the center sort during BVH construction.
#[derive(Clone, Copy, Debug)]
pub struct IndexedAabb {
    pub aabb: Aabb,
    pub index: u32,
}

/// GPU mirror of [`Aabb`]. Padded to vec4 pairs for std430 layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct AabbGpu {
    pub min: [f32; 4],
    pub max: [f32; 4],
}

impl From<Aabb> for AabbGpu {
    fn from(aabb: Aabb) -> Self {
        Self {
            min: [aabb.min.x, aabb.min.y, aabb.min.z, 0.0],
            max: [aabb.max.x, aabb.max.y, aabb.max.z, 0.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    fn aabb(min: [f32; 3], max: [f32; 3]) -> Aabb {
        Aabb {
            min: Vec3::from(min),
            max: Vec3::from(max),
        }
    }

    #[test]
    fn union_is_componentwise() {
        let a = aabb([-1.0, 0.0, 2.0], [1.0, 3.0, 4.0]);
        let b = aabb([0.0, -2.0, 1.0], [0.5, 5.0, 3.0]);
        let u = Aabb::union(&a, &b);
        assert_eq!(u.min, Vec3::new(-1.0, -2.0, 1.0));
        assert_eq!(u.max, Vec3::new(1.0, 5.0, 4.0));
    }

    #[test]
    fn union_commutative_and_associative() {
        let a = aabb([-1.0, -1.0, -1.0], [1.0, 1.0, 1.0]);
        let b = aabb([0.0, 0.0, 0.0], [2.0, 3.0, 1.5]);
        let c = aabb([-5.0, 0.5, 0.0], [-2.0, 0.6, 9.0]);

        assert_eq!(Aabb::union(&a, &b), Aabb::union(&b, &a));
        assert_eq!(
            Aabb::union(&Aabb::union(&a, &b), &c),
            Aabb::union(&a, &Aabb::union(&b, &c))
        );
    }

    #[test]
    fn expand_matches_union() {
        let mut a = aabb([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]);
        let b = aabb([-1.0, 0.5, -3.0], [0.5, 2.0, 0.0]);
        let u = Aabb::union(&a, &b);
        a.expand(&b);
        assert_eq!(a, u);
    }

    #[test]
    fn from_points_bounds_all_inputs() {
        let points = [
            Vec3::new(1.0, -2.0, 0.5),
            Vec3::new(-3.0, 4.0, 0.0),
            Vec3::new(2.0, 0.0, -1.0),
        ];
        let b = Aabb::from_points(&points).unwrap();
        for p in points {
            assert!(b.contains_point(p));
        }
        assert!(Aabb::from_points(&[]).is_none());
    }

    // Deterministic low-discrepancy samples inside the unit box.
    fn sample_points(aabb: &Aabb, count: usize) -> Vec<Vec3> {
        let size = aabb.size();
        (0..count)
            .map(|i| {
                let t = i as f32 / count as f32;
                let f = Vec3::new(
                    (t * 17.0).fract(),
                    (t * 29.0 + 0.31).fract(),
                    (t * 43.0 + 0.77).fract(),
                );
                aabb.min + size * f
            })
            .collect()
    }

    #[test]
    fn transform_is_conservative_under_rotation() {
        let src = aabb([-1.0, -2.0, -0.5], [3.0, 0.5, 2.0]);
        let world = Mat4::from_scale_rotation_translation(
            Vec3::new(1.5, 0.75, 2.0),
            Quat::from_euler(glam::EulerRot::XYZ, 0.6, -1.1, 0.3),
            Vec3::new(10.0, -4.0, 2.5),
        );
        let out = transform_aabb(&src, &world);

        for p in sample_points(&src, 256) {
            let moved = world.transform_point3(p);
            // Tolerate float noise at the faces.
            assert!(
                moved.cmpge(out.min - Vec3::splat(1e-4)).all()
                    && moved.cmple(out.max + Vec3::splat(1e-4)).all(),
                "transformed point {moved} escaped {out:?}"
            );
        }
    }

    #[test]
    fn transform_identity_is_exact() {
        let src = aabb([-1.0, 2.0, 3.0], [4.0, 5.0, 6.0]);
        let out = transform_aabb(&src, &Mat4::IDENTITY);
        assert_eq!(src, out);
    }

    #[test]
    fn longest_axis_picks_dominant_extent() {
        assert_eq!(aabb([0.0; 3], [3.0, 1.0, 1.0]).longest_axis(), 0);
        assert_eq!(aabb([0.0; 3], [1.0, 3.0, 1.0]).longest_axis(), 1);
        assert_eq!(aabb([0.0; 3], [1.0, 1.0, 3.0]).longest_axis(), 2);
        // Ties resolve to x, matching the build's partition order.
        assert_eq!(aabb([0.0; 3], [1.0, 1.0, 1.0]).longest_axis(), 0);
    }
}
