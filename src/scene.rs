// src/scene.rs
//! Demo scene data: the instanced cube and a deterministic instance grid.
//!
//! The culler itself is geometry-agnostic — it takes whatever vertex/index
//! buffers and transforms the caller hands it. This module supplies the
//! 8-vertex color cube the demo (and the tests) instance by the thousand.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec3};

use crate::bounds::Aabb;

/// Vertex layout for the culled geometry: position + color.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct VertexPosColor {
    pub position: [f32; 3],
    pub color: [f32; 3],
}

impl VertexPosColor {
    pub const ATTRIBUTES: [wgpu::VertexAttribute; 2] =
        wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3];

    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<VertexPosColor>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRIBUTES,
        }
    }
}

/// Per-instance world transform, the ground-truth array uploaded once and
/// indexed by every pass. Immutable after upload.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct InstanceData {
    pub world: [[f32; 4]; 4],
}

impl InstanceData {
    pub fn from_matrix(world: Mat4) -> Self {
        Self {
            world: world.to_cols_array_2d(),
        }
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.world)
    }
}

/// Unit cube centered at the origin: 8 vertices, 12 triangles.
pub fn cube_vertices() -> [VertexPosColor; 8] {
    let corner = |x: f32, y: f32, z: f32| VertexPosColor {
        position: [x, y, z],
        // Color from the corner signs, so faces shade distinctly.
        color: [x + 0.5, y + 0.5, z + 0.5],
    };
    [
        corner(-0.5, -0.5, -0.5),
        corner(0.5, -0.5, -0.5),
        corner(-0.5, 0.5, -0.5),
        corner(0.5, 0.5, -0.5),
        corner(-0.5, -0.5, 0.5),
        corner(0.5, -0.5, 0.5),
        corner(-0.5, 0.5, 0.5),
        corner(0.5, 0.5, 0.5),
    ]
}

/// Index list for [`cube_vertices`], counter-clockwise front faces.
pub fn cube_indices() -> [u16; 36] {
    [
        0, 2, 1, 1, 2, 3, // -z
        4, 5, 6, 5, 7, 6, // +z
        0, 4, 2, 4, 6, 2, // -x
        1, 3, 5, 3, 7, 5, // +x
        0, 1, 4, 1, 5, 4, // -y
        2, 6, 3, 6, 7, 3, // +y
    ]
}

/// Object-space bound of the cube.
pub fn cube_aabb() -> Aabb {
    Aabb {
        min: Vec3::splat(-0.5),
        max: Vec3::splat(0.5),
    }
}

/// Deterministic grid of `count` instances spread over a `side x side`
/// footprint with per-instance rotation and scale variation. The same seed
/// math runs on every machine, so tests can rely on the exact transforms.
pub fn instance_grid(count: usize, spacing: f32) -> Vec<InstanceData> {
    let side = (count as f32).cbrt().ceil().max(1.0) as usize;
    let offset = (side as f32 - 1.0) * spacing * 0.5;

    (0..count)
        .map(|i| {
            let x = (i % side) as f32;
            let y = ((i / side) % side) as f32;
            let z = (i / (side * side)) as f32;

            // Cheap integer hash for variation; no RNG dependency needed.
            let h = (i as u32).wrapping_mul(2654435761);
            let f0 = (h & 0xFFFF) as f32 / 65535.0;
            let f1 = ((h >> 16) & 0xFFFF) as f32 / 65535.0;

            let translation = Vec3::new(
                x * spacing - offset,
                y * spacing - offset,
                z * spacing - offset,
            );
            let rotation = Quat::from_rotation_y(f0 * std::f32::consts::TAU);
            let scale = Vec3::splat(0.6 + f1 * 0.8);

            InstanceData::from_matrix(Mat4::from_scale_rotation_translation(
                scale,
                rotation,
                translation,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::transform_aabb;

    #[test]
    fn cube_indices_reference_valid_vertices() {
        let indices = cube_indices();
        assert_eq!(indices.len(), 36);
        assert!(indices.iter().all(|&i| (i as usize) < cube_vertices().len()));
    }

    #[test]
    fn cube_vertices_fill_the_aabb() {
        let aabb = cube_aabb();
        for v in cube_vertices() {
            assert!(aabb.contains_point(Vec3::from(v.position)));
        }
    }

    #[test]
    fn grid_is_deterministic_and_sized() {
        let a = instance_grid(100, 4.0);
        let b = instance_grid(100, 4.0);
        assert_eq!(a.len(), 100);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.world, y.world);
        }
    }

    #[test]
    fn grid_instances_have_distinct_world_bounds() {
        let instances = instance_grid(27, 10.0);
        let bounds: Vec<_> = instances
            .iter()
            .map(|i| transform_aabb(&cube_aabb(), &i.matrix()))
            .collect();
        // Spacing of 10 with max scale 1.4 keeps neighbours disjoint.
        for (i, a) in bounds.iter().enumerate() {
            for b in bounds.iter().skip(i + 1) {
                let overlap = a.min.cmple(b.max).all() && b.min.cmple(a.max).all();
                assert!(!overlap, "instances {i} overlap");
            }
        }
    }
}
