// src/bvh.rs
//! Static bounding-volume hierarchy over per-instance world AABBs.
//!
//! Median-split binary BVH used as a broad-phase hint for the CPU frustum
//! traversal; the GPU culling pass remains the authoritative per-instance
//! test, so the tree does not need SAH quality.
//!
//! Nodes live in a flat arena with child indices instead of owned pointers,
//! and construction uses an explicit work stack — no recursion, so million-
//! instance scenes cannot blow the call stack.

use crate::bounds::{Aabb, IndexedAabb};
use crate::error::{Error, Result};

/// Sentinel for "no child" / "not a leaf".
pub const NO_INDEX: i32 = -1;

/// Arena node. `object_index >= 0` only on leaves; internal nodes always
/// have both children.
#[derive(Clone, Copy, Debug)]
pub struct BvhNode {
    pub bounds: Aabb,
    pub left: i32,
    pub right: i32,
    pub object_index: i32,
}

impl BvhNode {
    pub fn is_leaf(&self) -> bool {
        self.left == NO_INDEX && self.right == NO_INDEX
    }
}

/// Immutable BVH. Built once per static instance population; rebuilt only if
/// the population changes.
pub struct Bvh {
    nodes: Vec<BvhNode>,
    root: u32,
}

impl Bvh {
    /// Build over the full object slice. The slice is sorted in place during
    /// partitioning; object identity travels in [`IndexedAabb::index`].
    ///
    /// An empty slice is a caller error.
    pub fn build(objects: &mut [IndexedAabb]) -> Result<Self> {
        if objects.is_empty() {
            return Err(Error::EmptyBvhInput);
        }

        let mut nodes: Vec<BvhNode> = Vec::with_capacity(objects.len() * 2);

        // Work items: a range to cover plus the arena slot expecting the
        // subtree root (the parent's left/right field).
        enum Parent {
            Root,
            Left(usize),
            Right(usize),
        }
        let mut stack = vec![(0usize, objects.len(), Parent::Root)];
        let mut root = 0u32;

        while let Some((start, end, parent)) = stack.pop() {
            let mut bounds = objects[start].aabb;
            for obj in &objects[start + 1..end] {
                bounds.expand(&obj.aabb);
            }

            let node_index = nodes.len();
            let count = end - start;

            if count == 1 {
                nodes.push(BvhNode {
                    bounds,
                    left: NO_INDEX,
                    right: NO_INDEX,
                    object_index: objects[start].index as i32,
                });
            } else {
                nodes.push(BvhNode {
                    bounds,
                    left: NO_INDEX,
                    right: NO_INDEX,
                    object_index: NO_INDEX,
                });

                // Partition by box center along the longest axis of the
                // range bound. Stable sort keeps ties in input order, which
                // keeps the tree reproducible.
                let axis = bounds.longest_axis();
                objects[start..end].sort_by(|a, b| {
                    let ca = a.aabb.center()[axis];
                    let cb = b.aabb.center()[axis];
                    ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
                });

                let mid = start + count / 2;
                // Right is pushed first so the left child is emitted (and
                // numbered) before the right one, matching the recursive
                // build's order.
                stack.push((mid, end, Parent::Right(node_index)));
                stack.push((start, mid, Parent::Left(node_index)));
            }

            match parent {
                Parent::Root => root = node_index as u32,
                Parent::Left(p) => nodes[p].left = node_index as i32,
                Parent::Right(p) => nodes[p].right = node_index as i32,
            }
        }

        Ok(Self { nodes, root })
    }

    pub fn root(&self) -> &BvhNode {
        &self.nodes[self.root as usize]
    }

    pub fn node(&self, index: i32) -> &BvhNode {
        &self.nodes[index as usize]
    }

    pub fn root_index(&self) -> u32 {
        self.root
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    /// Append every object index under `node` to `out`, without further
    /// plane tests. Used by the frustum traversal for fully-inside subtrees.
    pub fn collect_leaves(&self, node: i32, out: &mut Vec<u32>) {
        let mut stack = vec![node];
        while let Some(index) = stack.pop() {
            let node = self.node(index);
            if node.object_index != NO_INDEX {
                out.push(node.object_index as u32);
            } else {
                stack.push(node.left);
                stack.push(node.right);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn boxes(centers: &[[f32; 3]]) -> Vec<IndexedAabb> {
        centers
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let center = Vec3::from(c);
                IndexedAabb {
                    aabb: Aabb {
                        min: center - Vec3::splat(0.5),
                        max: center + Vec3::splat(0.5),
                    },
                    index: i as u32,
                }
            })
            .collect()
    }

    fn line_of_boxes(n: usize) -> Vec<IndexedAabb> {
        let centers: Vec<[f32; 3]> = (0..n).map(|i| [i as f32 * 2.0, 0.0, 0.0]).collect();
        boxes(&centers)
    }

    #[test]
    fn single_object_is_a_leaf_root() {
        let mut objs = line_of_boxes(1);
        let bvh = Bvh::build(&mut objs).unwrap();
        assert_eq!(bvh.node_count(), 1);
        assert!(bvh.root().is_leaf());
        assert_eq!(bvh.root().object_index, 0);
    }

    #[test]
    fn empty_input_is_an_error() {
        let mut objs: Vec<IndexedAabb> = Vec::new();
        assert!(matches!(
            Bvh::build(&mut objs),
            Err(Error::EmptyBvhInput)
        ));
    }

    #[test]
    fn every_index_in_exactly_one_leaf() {
        for n in [2usize, 7, 64, 100, 257] {
            let mut objs = line_of_boxes(n);
            let bvh = Bvh::build(&mut objs).unwrap();

            let mut seen = vec![0u32; n];
            let mut leaves = Vec::new();
            bvh.collect_leaves(bvh.root_index() as i32, &mut leaves);
            for idx in leaves {
                seen[idx as usize] += 1;
            }
            assert!(seen.iter().all(|&c| c == 1), "n={n}: {seen:?}");
            assert_eq!(bvh.leaf_count(), n);
        }
    }

    #[test]
    fn leaf_union_equals_root_bound() {
        let mut objs = boxes(&[
            [0.0, 0.0, 0.0],
            [10.0, 1.0, -3.0],
            [-4.0, 6.0, 2.0],
            [3.0, -8.0, 5.0],
            [1.0, 1.0, 12.0],
        ]);
        let expected = {
            let mut b = objs[0].aabb;
            for o in &objs[1..] {
                b.expand(&o.aabb);
            }
            b
        };

        let bvh = Bvh::build(&mut objs).unwrap();

        let mut union: Option<Aabb> = None;
        let mut stack = vec![bvh.root_index() as i32];
        while let Some(i) = stack.pop() {
            let node = bvh.node(i);
            if node.is_leaf() {
                match &mut union {
                    Some(u) => u.expand(&node.bounds),
                    None => union = Some(node.bounds),
                }
            } else {
                stack.push(node.left);
                stack.push(node.right);
            }
        }
        assert_eq!(union.unwrap(), expected);
        assert_eq!(bvh.root().bounds, expected);
    }

    #[test]
    fn internal_nodes_contain_children() {
        let mut objs = line_of_boxes(33);
        let bvh = Bvh::build(&mut objs).unwrap();
        for i in 0..bvh.node_count() {
            let node = bvh.node(i as i32);
            if node.is_leaf() {
                assert!(node.object_index >= 0);
                continue;
            }
            assert_eq!(node.object_index, NO_INDEX);
            for child in [node.left, node.right] {
                let c = bvh.node(child);
                let u = Aabb::union(&node.bounds, &c.bounds);
                assert_eq!(u, node.bounds, "child bound escapes parent");
            }
        }
    }

    #[test]
    fn tie_heavy_input_is_deterministic() {
        // All boxes share a center along every axis; the stable sort must
        // keep input order, so two builds agree leaf for leaf.
        let centers: Vec<[f32; 3]> = (0..16).map(|_| [1.0, 2.0, 3.0]).collect();
        let mut a = boxes(&centers);
        let mut b = boxes(&centers);
        let bvh_a = Bvh::build(&mut a).unwrap();
        let bvh_b = Bvh::build(&mut b).unwrap();

        let mut leaves_a = Vec::new();
        let mut leaves_b = Vec::new();
        bvh_a.collect_leaves(bvh_a.root_index() as i32, &mut leaves_a);
        bvh_b.collect_leaves(bvh_b.root_index() as i32, &mut leaves_b);
        assert_eq!(leaves_a, leaves_b);
    }
}
