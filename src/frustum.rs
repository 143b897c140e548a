// src/frustum.rs
//! Frustum plane extraction and AABB classification.
//!
//! Planes come out of the combined view-projection matrix via the
//! Gribb–Hartmann row method. Plane order is fixed: left, right, top,
//! bottom, near, far. Every test here errs toward keeping objects —
//! the GPU pass downstream is the authoritative cull.

use crate::bounds::Aabb;
use crate::bvh::{Bvh, NO_INDEX};
use glam::{Mat4, Vec3};

/// Plane equation `a*x + b*y + c*z + d >= 0` inside the half-space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Plane {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
}

impl Plane {
    pub fn new(a: f32, b: f32, c: f32, d: f32) -> Self {
        Self { a, b, c, d }
    }

    pub fn normal(&self) -> Vec3 {
        Vec3::new(self.a, self.b, self.c)
    }

    /// Signed distance (scaled by |normal| when unnormalized).
    pub fn distance(&self, p: Vec3) -> f32 {
        self.normal().dot(p) + self.d
    }

    /// Divide by the magnitude of the normal. Callers that only need the
    /// sign of the signed distance can skip this.
    pub fn normalize(&mut self) {
        let mag = self.normal().length();
        if mag > 0.0 {
            self.a /= mag;
            self.b /= mag;
            self.c /= mag;
            self.d /= mag;
        }
    }

    /// Intersection point of three planes (assumed non-degenerate).
    pub fn intersection_point(a: &Plane, b: &Plane, c: &Plane) -> Vec3 {
        let n1 = a.normal();
        let n2 = b.normal();
        let n3 = c.normal();

        let cross_n2_n3 = n2.cross(n3);
        let cross_n3_n1 = n3.cross(n1);
        let cross_n1_n2 = n1.cross(n2);

        let f = -n1.dot(cross_n2_n3);

        (cross_n2_n3 * a.d + cross_n3_n1 * b.d + cross_n1_n2 * c.d) / f
    }
}

/// Result of classifying a volume against a plane or frustum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intersection {
    Outside,
    Intersect,
    Inside,
}

/// Plane indices into [`FrustumPlanes::planes`].
pub const PLANE_LEFT: usize = 0;
pub const PLANE_RIGHT: usize = 1;
pub const PLANE_TOP: usize = 2;
pub const PLANE_BOTTOM: usize = 3;
pub const PLANE_NEAR: usize = 4;
pub const PLANE_FAR: usize = 5;

/// The six clip planes of a camera, refreshed every frame from its
/// view-projection matrix.
#[derive(Clone, Copy, Debug)]
pub struct FrustumPlanes {
    pub planes: [Plane; 6],
}

impl FrustumPlanes {
    /// Gribb–Hartmann extraction from a combined view-projection matrix:
    /// left = row3+row0, right = row3-row0, top = row3-row1,
    /// bottom = row3+row1, near = row2, far = row3+row2.
    pub fn extract(view_proj: &Mat4, normalize: bool) -> Self {
        let r0 = view_proj.row(0);
        let r1 = view_proj.row(1);
        let r2 = view_proj.row(2);
        let r3 = view_proj.row(3);

        let left = r3 + r0;
        let right = r3 - r0;
        let top = r3 - r1;
        let bottom = r3 + r1;
        let near = r2;
        let far = r3 + r2;

        let mut planes = [left, right, top, bottom, near, far]
            .map(|v| Plane::new(v.x, v.y, v.z, v.w));

        if normalize {
            for plane in &mut planes {
                plane.normalize();
            }
        }

        Self { planes }
    }

    /// The 8 corner points: left/right x top/bottom x near/far.
    pub fn corners(&self) -> [Vec3; 8] {
        let p = &self.planes;
        [
            Plane::intersection_point(&p[PLANE_LEFT], &p[PLANE_TOP], &p[PLANE_NEAR]),
            Plane::intersection_point(&p[PLANE_LEFT], &p[PLANE_TOP], &p[PLANE_FAR]),
            Plane::intersection_point(&p[PLANE_LEFT], &p[PLANE_BOTTOM], &p[PLANE_NEAR]),
            Plane::intersection_point(&p[PLANE_LEFT], &p[PLANE_BOTTOM], &p[PLANE_FAR]),
            Plane::intersection_point(&p[PLANE_RIGHT], &p[PLANE_TOP], &p[PLANE_NEAR]),
            Plane::intersection_point(&p[PLANE_RIGHT], &p[PLANE_TOP], &p[PLANE_FAR]),
            Plane::intersection_point(&p[PLANE_RIGHT], &p[PLANE_BOTTOM], &p[PLANE_NEAR]),
            Plane::intersection_point(&p[PLANE_RIGHT], &p[PLANE_BOTTOM], &p[PLANE_FAR]),
        ]
    }
}

/// Line-list indices over [`FrustumPlanes::corners`] for drawing the frustum
/// as a wireframe (debug camera freeze view).
pub fn frustum_wireframe_indices() -> [u16; 24] {
    [
        0, 1, 1, 3, 3, 2, 2, 0, // left face loop
        4, 5, 5, 7, 7, 6, 6, 4, // right face loop
        0, 4, 1, 5, 2, 6, 3, 7, // near/far cross struts
    ]
}

/// Classify a box against one plane with the positive/negative-vertex trick:
/// pick the corner most along the plane normal (and its opposite) and test
/// only those two.
pub fn plane_aabb_intersect(aabb: &Aabb, plane: &Plane) -> Intersection {
    let positive = Vec3::new(
        if plane.a >= 0.0 { aabb.max.x } else { aabb.min.x },
        if plane.b >= 0.0 { aabb.max.y } else { aabb.min.y },
        if plane.c >= 0.0 { aabb.max.z } else { aabb.min.z },
    );
    let negative = Vec3::new(
        if plane.a >= 0.0 { aabb.min.x } else { aabb.max.x },
        if plane.b >= 0.0 { aabb.min.y } else { aabb.max.y },
        if plane.c >= 0.0 { aabb.min.z } else { aabb.max.z },
    );

    if plane.distance(positive) < 0.0 {
        return Intersection::Outside;
    }
    if plane.distance(negative) < 0.0 {
        return Intersection::Intersect;
    }
    Intersection::Inside
}

/// Classify a box against all six planes. Any Outside wins immediately;
/// Inside only when every plane reports Inside. This ordering is what keeps
/// the test conservative — do not reorder.
pub fn frustum_aabb_intersect(aabb: &Aabb, frustum: &FrustumPlanes) -> Intersection {
    let mut inside_count = 0;
    for plane in &frustum.planes {
        match plane_aabb_intersect(aabb, plane) {
            Intersection::Outside => return Intersection::Outside,
            Intersection::Inside => inside_count += 1,
            Intersection::Intersect => {}
        }
    }
    if inside_count == 6 {
        Intersection::Inside
    } else {
        Intersection::Intersect
    }
}

/// Walk the BVH against the frustum and append candidate instance indices:
/// Inside subtrees contribute every leaf with no further plane tests
/// (containment is transitive), Intersect nodes recurse, Outside prunes.
/// The result is a safe superset of the frustum-visible instances.
pub fn frustum_bvh_intersect(bvh: &Bvh, frustum: &FrustumPlanes, out: &mut Vec<u32>) {
    let mut stack = vec![bvh.root_index() as i32];
    while let Some(index) = stack.pop() {
        let node = bvh.node(index);
        match frustum_aabb_intersect(&node.bounds, frustum) {
            Intersection::Outside => {}
            Intersection::Inside => bvh.collect_leaves(index, out),
            Intersection::Intersect => {
                if node.object_index != NO_INDEX {
                    out.push(node.object_index as u32);
                } else {
                    stack.push(node.left);
                    stack.push(node.right);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::IndexedAabb;

    /// Axis-aligned box frustum: the unit cube scaled to `half` on each side.
    fn box_frustum(half: f32) -> FrustumPlanes {
        FrustumPlanes {
            planes: [
                Plane::new(1.0, 0.0, 0.0, half),  // left:   x >= -half
                Plane::new(-1.0, 0.0, 0.0, half), // right:  x <=  half
                Plane::new(0.0, -1.0, 0.0, half), // top:    y <=  half
                Plane::new(0.0, 1.0, 0.0, half),  // bottom: y >= -half
                Plane::new(0.0, 0.0, 1.0, half),  // near:   z >= -half
                Plane::new(0.0, 0.0, -1.0, half), // far:    z <=  half
            ],
        }
    }

    fn cube_at(center: [f32; 3], half: f32) -> Aabb {
        let c = Vec3::from(center);
        Aabb {
            min: c - Vec3::splat(half),
            max: c + Vec3::splat(half),
        }
    }

    #[test]
    fn classification_inside_outside_straddle() {
        let frustum = box_frustum(10.0);

        let inside = cube_at([0.0, 0.0, 0.0], 1.0);
        assert_eq!(frustum_aabb_intersect(&inside, &frustum), Intersection::Inside);

        let outside = cube_at([30.0, 0.0, 0.0], 1.0);
        assert_eq!(frustum_aabb_intersect(&outside, &frustum), Intersection::Outside);

        // Straddling the right face.
        let straddle = cube_at([10.0, 0.0, 0.0], 1.0);
        assert_eq!(
            frustum_aabb_intersect(&straddle, &frustum),
            Intersection::Intersect
        );
    }

    #[test]
    fn outside_wins_over_intersect() {
        // Straddles the left plane but is entirely past the right plane:
        // the right plane must reject regardless of the left result.
        let frustum = box_frustum(1.0);
        let b = cube_at([5.0, 0.0, 0.0], 0.5);
        assert_eq!(frustum_aabb_intersect(&b, &frustum), Intersection::Outside);
    }

    #[test]
    fn plane_test_uses_positive_vertex() {
        let plane = Plane::new(1.0, 0.0, 0.0, 0.0); // x >= 0
        assert_eq!(
            plane_aabb_intersect(&cube_at([2.0, 0.0, 0.0], 1.0), &plane),
            Intersection::Inside
        );
        assert_eq!(
            plane_aabb_intersect(&cube_at([-2.0, 0.0, 0.0], 1.0), &plane),
            Intersection::Outside
        );
        assert_eq!(
            plane_aabb_intersect(&cube_at([0.0, 0.0, 0.0], 1.0), &plane),
            Intersection::Intersect
        );
    }

    #[test]
    fn extraction_from_camera_matrix() {
        // Camera at origin looking down -Z.
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        let frustum = FrustumPlanes::extract(&(proj * view), true);

        let ahead = cube_at([0.0, 0.0, -5.0], 0.5);
        assert_ne!(frustum_aabb_intersect(&ahead, &frustum), Intersection::Outside);

        let behind = cube_at([0.0, 0.0, 5.0], 0.5);
        assert_eq!(frustum_aabb_intersect(&behind, &frustum), Intersection::Outside);

        let far_left = cube_at([-50.0, 0.0, -5.0], 0.5);
        assert_eq!(
            frustum_aabb_intersect(&far_left, &frustum),
            Intersection::Outside
        );
    }

    #[test]
    fn normalization_preserves_signs() {
        let proj = Mat4::perspective_rh(75f32.to_radians(), 1.6, 0.5, 200.0);
        let view = Mat4::look_at_rh(Vec3::new(3.0, 1.0, 8.0), Vec3::ZERO, Vec3::Y);
        let raw = FrustumPlanes::extract(&(proj * view), false);
        let normalized = FrustumPlanes::extract(&(proj * view), true);

        let probes = [
            Vec3::ZERO,
            Vec3::new(10.0, 0.0, 0.0),
            Vec3::new(0.0, -20.0, 4.0),
            Vec3::new(3.0, 1.0, 20.0),
        ];
        for p in probes {
            for i in 0..6 {
                let a = raw.planes[i].distance(p);
                let b = normalized.planes[i].distance(p);
                assert_eq!(a.is_sign_negative(), b.is_sign_negative(), "plane {i} at {p}");
            }
        }
    }

    #[test]
    fn corners_of_box_frustum() {
        let frustum = box_frustum(2.0);
        let corners = frustum.corners();
        for c in corners {
            assert!((c.x.abs() - 2.0).abs() < 1e-5);
            assert!((c.y.abs() - 2.0).abs() < 1e-5);
            assert!((c.z.abs() - 2.0).abs() < 1e-5);
        }
        // Wireframe indices stay within the corner array.
        assert!(frustum_wireframe_indices().iter().all(|&i| i < 8));
    }

    #[test]
    fn bvh_traversal_is_a_superset_of_per_object_tests() {
        let frustum = box_frustum(6.0);

        // A line of boxes crossing the frustum on x, plus strays outside.
        let mut objects: Vec<IndexedAabb> = (0..32)
            .map(|i| IndexedAabb {
                aabb: cube_at([i as f32 - 16.0, 0.0, 0.0], 0.4),
                index: i,
            })
            .collect();

        let brute: Vec<u32> = objects
            .iter()
            .filter(|o| frustum_aabb_intersect(&o.aabb, &frustum) != Intersection::Outside)
            .map(|o| o.index)
            .collect();

        let bvh = Bvh::build(&mut objects).unwrap();
        let mut candidates = Vec::new();
        frustum_bvh_intersect(&bvh, &frustum, &mut candidates);

        for idx in &brute {
            assert!(
                candidates.contains(idx),
                "index {idx} visible per-object but pruned by traversal"
            );
        }
        // No duplicates.
        let mut sorted = candidates.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), candidates.len());
    }

    #[test]
    fn fully_inside_scene_returns_everything() {
        let frustum = box_frustum(100.0);
        let mut objects: Vec<IndexedAabb> = (0..10)
            .map(|i| IndexedAabb {
                aabb: cube_at([i as f32, 0.0, 0.0], 0.4),
                index: i,
            })
            .collect();
        let bvh = Bvh::build(&mut objects).unwrap();
        let mut candidates = Vec::new();
        frustum_bvh_intersect(&bvh, &frustum, &mut candidates);
        candidates.sort_unstable();
        assert_eq!(candidates, (0..10).collect::<Vec<u32>>());
    }
}
