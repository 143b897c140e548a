// src/scan.rs
//! Multi-level parallel exclusive prefix sum over the visibility buffer.
//!
//! Stream-compaction primitive: for each instance, the number of visible
//! instances preceding it (its compacted slot), plus the grand total in a
//! one-element count buffer. Three kernels, 256-wide blocks:
//!
//! * `scan_blocks`   — level 0: per-block exclusive scan of the visibility
//!   buffer into the scan-result buffer, raw block sums into group-sums[0].
//! * `scan_groups`   — level i: per-block exclusive scan of group-sums[i-1]
//!   in place, raw block sums into group-sums[i].
//! * `apply_offsets` — downsweep: `data[j] += sums[j / 256]`.
//!
//! The level chain always ends at a single element, so the top level needs
//! no offset pass (one block's exclusive offset is zero) and the total is a
//! plain 4-byte buffer copy into the count buffer — no CPU read-back.

use bytemuck::{Pod, Zeroable};

/// Threads per scan workgroup. Must match `@workgroup_size` in the kernels.
pub const BLOCK_SIZE: u32 = 256;

/// Group-sum buffer lengths for `element_count` inputs: repeatedly
/// `ceil(len / 256)` until a level holds a single element. The number of
/// levels equals ceil(log256(N)) for N > 1.
pub fn level_sizes(element_count: u32) -> Vec<u32> {
    let mut sizes = Vec::new();
    let mut len = element_count.max(1);
    loop {
        len = len.div_ceil(BLOCK_SIZE);
        sizes.push(len);
        if len == 1 {
            break;
        }
    }
    sizes
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ScanParams {
    count: u32,
    _pad: [u32; 3],
}

/// GPU scan engine. Owns the group-sum buffer chain and every pipeline/bind
/// group needed to scan a fixed-length input; `record` re-plays the same
/// dispatch sequence each frame.
pub struct ScanEngine {
    blocks_pipeline: wgpu::ComputePipeline,
    groups_pipeline: wgpu::ComputePipeline,
    apply_pipeline: wgpu::ComputePipeline,

    level_sizes: Vec<u32>,
    group_sums: Vec<wgpu::Buffer>,

    blocks_bind_group: wgpu::BindGroup,
    groups_bind_groups: Vec<wgpu::BindGroup>,
    apply_bind_groups: Vec<wgpu::BindGroup>,
}

impl ScanEngine {
    /// Build the engine for a fixed `element_count`, scanning `input` into
    /// `output` and copying the total into `count`.
    ///
    /// `input` and `output` must be STORAGE buffers of at least
    /// `element_count` u32s; `count` must be COPY_DST.
    pub fn new(
        device: &wgpu::Device,
        input: &wgpu::Buffer,
        output: &wgpu::Buffer,
        element_count: u32,
    ) -> Self {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("scan_cs"),
            source: wgpu::ShaderSource::Wgsl(SCAN_WGSL.into()),
        });

        let storage_entry = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let uniform_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let blocks_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("scan_blocks_bgl"),
            entries: &[
                storage_entry(0, true),
                storage_entry(1, false),
                storage_entry(2, false),
                uniform_entry(3),
            ],
        });
        let groups_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("scan_groups_bgl"),
            entries: &[
                storage_entry(0, false),
                storage_entry(1, false),
                uniform_entry(2),
            ],
        });
        let apply_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("scan_apply_bgl"),
            entries: &[
                storage_entry(0, false),
                storage_entry(1, true),
                uniform_entry(2),
            ],
        });

        let make_pipeline = |label: &str, bgl: &wgpu::BindGroupLayout, entry: &str| {
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[bgl],
                push_constant_ranges: &[],
            });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&layout),
                module: &module,
                entry_point: entry,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
        };
        let blocks_pipeline = make_pipeline("scan_blocks_pipeline", &blocks_bgl, "scan_blocks");
        let groups_pipeline = make_pipeline("scan_groups_pipeline", &groups_bgl, "scan_groups");
        let apply_pipeline = make_pipeline("scan_apply_pipeline", &apply_bgl, "apply_offsets");

        let level_sizes = level_sizes(element_count);
        let group_sums: Vec<wgpu::Buffer> = level_sizes
            .iter()
            .enumerate()
            .map(|(i, &len)| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("scan_group_sums_{i}")),
                    size: u64::from(len) * 4,
                    usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                })
            })
            .collect();

        // One params buffer per level: params[0] covers the raw input,
        // params[i] covers group-sums[i-1]. Upsweep level i and downsweep
        // level i consume the same count.
        let params: Vec<wgpu::Buffer> = std::iter::once(element_count)
            .chain(level_sizes.iter().copied())
            .take(level_sizes.len())
            .enumerate()
            .map(|(i, count)| {
                use wgpu::util::DeviceExt;
                device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(&format!("scan_params_{i}")),
                    contents: bytemuck::bytes_of(&ScanParams {
                        count,
                        _pad: [0; 3],
                    }),
                    usage: wgpu::BufferUsages::UNIFORM,
                })
            })
            .collect();

        let blocks_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("scan_blocks_bg"),
            layout: &blocks_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: input.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: output.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: group_sums[0].as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: params[0].as_entire_binding(),
                },
            ],
        });

        let groups_bind_groups: Vec<wgpu::BindGroup> = (1..level_sizes.len())
            .map(|i| {
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(&format!("scan_groups_bg_{i}")),
                    layout: &groups_bgl,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: group_sums[i - 1].as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: group_sums[i].as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: params[i].as_entire_binding(),
                        },
                    ],
                })
            })
            .collect();

        // Downsweep level i adds group-sums[i] into the level below.
        let apply_bind_groups: Vec<wgpu::BindGroup> = (0..level_sizes.len().saturating_sub(1))
            .map(|i| {
                let data = if i == 0 { output } else { &group_sums[i - 1] };
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(&format!("scan_apply_bg_{i}")),
                    layout: &apply_bgl,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: data.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: group_sums[i].as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: params[i].as_entire_binding(),
                        },
                    ],
                })
            })
            .collect();

        Self {
            blocks_pipeline,
            groups_pipeline,
            apply_pipeline,
            level_sizes,
            group_sums,
            blocks_bind_group,
            groups_bind_groups,
            apply_bind_groups,
        }
    }

    pub fn level_count(&self) -> usize {
        self.level_sizes.len()
    }

    /// Record the full scan: upsweep, downsweep, then a 4-byte copy of the
    /// top-level total into `count`.
    pub fn record(&self, encoder: &mut wgpu::CommandEncoder, count: &wgpu::Buffer) {
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("scan_upsweep"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.blocks_pipeline);
            pass.set_bind_group(0, &self.blocks_bind_group, &[]);
            pass.dispatch_workgroups(self.level_sizes[0], 1, 1);

            pass.set_pipeline(&self.groups_pipeline);
            for (i, bind_group) in self.groups_bind_groups.iter().enumerate() {
                pass.set_bind_group(0, bind_group, &[]);
                // Upsweep level i+1 covers group-sums[i], one group per
                // element of the next level.
                pass.dispatch_workgroups(self.level_sizes[i + 1], 1, 1);
            }
        }

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("scan_downsweep"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.apply_pipeline);
            for i in (0..self.apply_bind_groups.len()).rev() {
                pass.set_bind_group(0, &self.apply_bind_groups[i], &[]);
                pass.dispatch_workgroups(self.level_sizes[i], 1, 1);
            }
        }

        let top = self.group_sums.last().expect("at least one level");
        encoder.copy_buffer_to_buffer(top, 0, count, 0, 4);
    }
}

const SCAN_WGSL: &str = r#"
const BLOCK_SIZE: u32 = 256u;

struct ScanParams {
    count: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
};

var<workgroup> shared_vals: array<u32, 256>;

// Hillis-Steele inclusive scan over the workgroup; returns this thread's
// inclusive sum. Reads happen strictly before writes each round.
fn workgroup_scan(tid: u32, value: u32) -> u32 {
    shared_vals[tid] = value;
    workgroupBarrier();
    for (var offset = 1u; offset < BLOCK_SIZE; offset = offset << 1u) {
        var addend = 0u;
        if (tid >= offset) {
            addend = shared_vals[tid - offset];
        }
        workgroupBarrier();
        shared_vals[tid] = shared_vals[tid] + addend;
        workgroupBarrier();
    }
    return shared_vals[tid];
}

// ---------------------------------------------------------------------------
// Level 0: visibility -> scan_result + raw block sums
// ---------------------------------------------------------------------------

@group(0) @binding(0) var<storage, read> scan_input: array<u32>;
@group(0) @binding(1) var<storage, read_write> scan_output: array<u32>;
@group(0) @binding(2) var<storage, read_write> block_sums: array<u32>;
@group(0) @binding(3) var<uniform> blocks_params: ScanParams;

@compute @workgroup_size(256)
fn scan_blocks(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
) {
    let i = gid.x;
    let tid = lid.x;
    var value = 0u;
    if (i < blocks_params.count) {
        value = scan_input[i];
    }
    let inclusive = workgroup_scan(tid, value);
    if (i < blocks_params.count) {
        scan_output[i] = inclusive - value;
    }
    if (tid == BLOCK_SIZE - 1u) {
        block_sums[wid.x] = inclusive;
    }
}

// ---------------------------------------------------------------------------
// Level i: scan group sums in place + raw block sums for the next level
// ---------------------------------------------------------------------------

@group(0) @binding(0) var<storage, read_write> group_data: array<u32>;
@group(0) @binding(1) var<storage, read_write> group_out_sums: array<u32>;
@group(0) @binding(2) var<uniform> groups_params: ScanParams;

@compute @workgroup_size(256)
fn scan_groups(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
) {
    let i = gid.x;
    let tid = lid.x;
    var value = 0u;
    if (i < groups_params.count) {
        value = group_data[i];
    }
    let inclusive = workgroup_scan(tid, value);
    if (i < groups_params.count) {
        group_data[i] = inclusive - value;
    }
    if (tid == BLOCK_SIZE - 1u) {
        group_out_sums[wid.x] = inclusive;
    }
}

// ---------------------------------------------------------------------------
// Downsweep: add the coarser level's exclusive block offset
// ---------------------------------------------------------------------------

@group(0) @binding(0) var<storage, read_write> apply_data: array<u32>;
@group(0) @binding(1) var<storage, read> apply_sums: array<u32>;
@group(0) @binding(2) var<uniform> apply_params: ScanParams;

@compute @workgroup_size(256)
fn apply_offsets(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= apply_params.count) {
        return;
    }
    apply_data[i] = apply_data[i] + apply_sums[i / BLOCK_SIZE];
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_sizes_end_at_one() {
        for n in [1u32, 2, 255, 256, 257, 1000, 65_536, 65_537, 100_000, 1_000_000] {
            let sizes = level_sizes(n);
            assert_eq!(*sizes.last().unwrap(), 1, "n={n}: {sizes:?}");
            // Each level covers the one below with 256-wide groups.
            let mut len = n;
            for &s in &sizes {
                assert_eq!(s, len.div_ceil(BLOCK_SIZE), "n={n}");
                len = s;
            }
        }
    }

    #[test]
    fn level_count_matches_log256() {
        assert_eq!(level_sizes(255).len(), 1);
        assert_eq!(level_sizes(256).len(), 1);
        assert_eq!(level_sizes(257).len(), 2);
        assert_eq!(level_sizes(65_536).len(), 2);
        assert_eq!(level_sizes(65_537).len(), 3);
        assert_eq!(level_sizes(100_000).len(), 3);
    }

    // -----------------------------------------------------------------------
    // CPU simulation of the exact GPU algorithm: same blocking, same three
    // phases, same dispatch bounds. Validates the kernel structure against a
    // naive scan without needing a device.
    // -----------------------------------------------------------------------

    fn block_scan(input: &[u32], output: &mut [u32], sums: &mut [u32]) {
        for (block, chunk) in input.chunks(BLOCK_SIZE as usize).enumerate() {
            let mut running = 0u32;
            for (j, &v) in chunk.iter().enumerate() {
                output[block * BLOCK_SIZE as usize + j] = running;
                running += v;
            }
            sums[block] = running;
        }
    }

    fn simulate_scan(input: &[u32]) -> (Vec<u32>, u32) {
        let n = input.len() as u32;
        let sizes = level_sizes(n);
        let mut scan_result = vec![0u32; input.len()];
        let mut groups: Vec<Vec<u32>> = sizes.iter().map(|&s| vec![0u32; s as usize]).collect();

        // Upsweep.
        {
            let mut sums = std::mem::take(&mut groups[0]);
            block_scan(input, &mut scan_result, &mut sums);
            groups[0] = sums;
        }
        for i in 1..sizes.len() {
            let data = groups[i - 1].clone();
            let mut scanned = vec![0u32; data.len()];
            let mut sums = vec![0u32; sizes[i] as usize];
            block_scan(&data, &mut scanned, &mut sums);
            groups[i - 1] = scanned;
            groups[i] = sums;
        }

        // Downsweep: top level is never applied (single block, offset zero).
        for i in (0..sizes.len().saturating_sub(1)).rev() {
            let sums = groups[i].clone();
            if i == 0 {
                for (j, v) in scan_result.iter_mut().enumerate() {
                    *v += sums[j / BLOCK_SIZE as usize];
                }
            } else {
                for (j, v) in groups[i - 1].iter_mut().enumerate() {
                    *v += sums[j / BLOCK_SIZE as usize];
                }
            }
        }

        let total = groups.last().unwrap()[0];
        (scan_result, total)
    }

    fn naive_scan(input: &[u32]) -> (Vec<u32>, u32) {
        let mut out = Vec::with_capacity(input.len());
        let mut running = 0u32;
        for &v in input {
            out.push(running);
            running += v;
        }
        (out, running)
    }

    fn patterns(n: usize) -> Vec<Vec<u32>> {
        vec![
            vec![1u32; n],
            vec![0u32; n],
            (0..n).map(|i| u32::from(i % 3 == 0)).collect(),
            // Deterministic pseudo-random 0/1 pattern.
            (0..n)
                .map(|i| (i as u32).wrapping_mul(2654435761) >> 31)
                .collect(),
        ]
    }

    #[test]
    fn simulated_scan_matches_naive_around_block_boundaries() {
        for n in [1usize, 255, 256, 257, 1000] {
            for input in patterns(n) {
                let (sim, total) = simulate_scan(&input);
                let (expected, expected_total) = naive_scan(&input);
                assert_eq!(sim, expected, "n={n}");
                assert_eq!(total, expected_total, "n={n}");
            }
        }
    }

    #[test]
    fn simulated_scan_matches_naive_at_scale() {
        // 100k exercises three levels (two recursive upsweeps).
        let n = 100_000usize;
        for input in patterns(n) {
            let (sim, total) = simulate_scan(&input);
            let (expected, expected_total) = naive_scan(&input);
            assert_eq!(sim, expected);
            assert_eq!(total, expected_total);
        }
    }

    #[test]
    fn every_third_pattern_counts_match() {
        let n = 1000usize;
        let input: Vec<u32> = (0..n).map(|i| u32::from(i % 3 == 0)).collect();
        let (sim, total) = simulate_scan(&input);
        for (i, &slot) in sim.iter().enumerate() {
            let ones_before = input[..i].iter().sum::<u32>();
            assert_eq!(slot, ones_before, "slot at {i}");
        }
        assert_eq!(total, input.iter().sum::<u32>());
    }
}
