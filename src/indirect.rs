// src/indirect.rs
//! Indirect draw argument generation.
//!
//! One thread per instance: survivors write a draw-indexed-indirect record at
//! the compacted slot the scan assigned them, plus a matrix-index entry so
//! the indirect vertex shaders can map that slot back to the instance
//! transform. Culled instances write nothing; slots past the visible count
//! are never consumed because the draw itself is bounded by the count
//! buffer.

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};

/// Draw-indexed-indirect record, byte-compatible with
/// `wgpu::util::DrawIndexedIndirectArgs` (20 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct IndirectCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
}

pub const INDIRECT_COMMAND_SIZE: u64 = std::mem::size_of::<IndirectCommand>() as u64;

/// Fail fast when the live instance population cannot fit the indirect
/// argument buffer, instead of silently overrunning it at dispatch time.
pub fn validate_capacity(instance_count: usize, max_draws: usize) -> Result<()> {
    if instance_count > max_draws {
        return Err(Error::CapacityExceeded {
            what: "indirect argument buffer",
            needed: instance_count,
            capacity: max_draws,
        });
    }
    Ok(())
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FillParams {
    instance_count: u32,
    index_count: u32,
    _pad: [u32; 2],
}

/// Compute engine that fills the indirect argument buffer each frame.
pub struct IndirectFill {
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    instance_count: u32,
}

impl IndirectFill {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &wgpu::Device,
        visibility: &wgpu::Buffer,
        scan_result: &wgpu::Buffer,
        indirect_args: &wgpu::Buffer,
        matrix_index: &wgpu::Buffer,
        instance_count: u32,
        index_count: u32,
    ) -> Self {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("indirect_fill_cs"),
            source: wgpu::ShaderSource::Wgsl(FILL_WGSL.into()),
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

        let bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("indirect_fill_bgl"),
            entries: &[
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, false),
                storage_entry(3, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let params = {
            use wgpu::util::DeviceExt;
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("indirect_fill_params"),
                contents: bytemuck::bytes_of(&FillParams {
                    instance_count,
                    index_count,
                    _pad: [0; 2],
                }),
                usage: wgpu::BufferUsages::UNIFORM,
            })
        };

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("indirect_fill_layout"),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("indirect_fill_pipeline"),
            layout: Some(&layout),
            module: &module,
            entry_point: "fill",
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("indirect_fill_bg"),
            layout: &bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: visibility.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: scan_result.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: indirect_args.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: matrix_index.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: params.as_entire_binding(),
                },
            ],
        });

        Self {
            pipeline,
            bind_group,
            instance_count,
        }
    }

    pub fn record(&self, encoder: &mut wgpu::CommandEncoder) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("indirect_fill"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.bind_group, &[]);
        pass.dispatch_workgroups(self.instance_count.div_ceil(256), 1, 1);
    }
}

const FILL_WGSL: &str = r#"
struct IndirectCommand {
    index_count: u32,
    instance_count: u32,
    first_index: u32,
    base_vertex: i32,
    first_instance: u32,
};

struct FillParams {
    instance_count: u32,
    index_count: u32,
    pad0: u32,
    pad1: u32,
};

@group(0) @binding(0) var<storage, read> visibility: array<u32>;
@group(0) @binding(1) var<storage, read> scan_result: array<u32>;
@group(0) @binding(2) var<storage, read_write> indirect_args: array<IndirectCommand>;
@group(0) @binding(3) var<storage, read_write> matrix_index: array<u32>;
@group(0) @binding(4) var<uniform> params: FillParams;

@compute @workgroup_size(256)
fn fill(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= params.instance_count) {
        return;
    }
    if (visibility[i] == 0u) {
        return;
    }
    let slot = scan_result[i];
    indirect_args[slot] = IndirectCommand(params.index_count, 1u, 0u, 0, slot);
    matrix_index[slot] = i;
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_matches_wgpu_contract() {
        assert_eq!(INDIRECT_COMMAND_SIZE, 20);
        assert_eq!(
            std::mem::size_of::<IndirectCommand>(),
            std::mem::size_of::<wgpu::util::DrawIndexedIndirectArgs>()
        );

        let cmd = IndirectCommand {
            index_count: 36,
            instance_count: 1,
            first_index: 0,
            base_vertex: 0,
            first_instance: 7,
        };
        let bytes = bytemuck::bytes_of(&cmd);
        assert_eq!(&bytes[0..4], &36u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &7u32.to_le_bytes());
    }

    #[test]
    fn capacity_validation() {
        assert!(validate_capacity(100, 100).is_ok());
        let err = validate_capacity(101, 100).unwrap_err();
        assert!(err.is_capacity());
    }

    // CPU model of the fill kernel for the compaction-density property.
    fn simulate_fill(visibility: &[u32], index_count: u32) -> (Vec<Option<IndirectCommand>>, Vec<u32>) {
        let scan: Vec<u32> = {
            let mut out = Vec::with_capacity(visibility.len());
            let mut running = 0;
            for &v in visibility {
                out.push(running);
                running += v;
            }
            out
        };
        let mut args: Vec<Option<IndirectCommand>> = vec![None; visibility.len()];
        let mut matrix_index = vec![0u32; visibility.len()];
        for i in 0..visibility.len() {
            if visibility[i] == 1 {
                let slot = scan[i] as usize;
                args[slot] = Some(IndirectCommand {
                    index_count,
                    instance_count: 1,
                    first_index: 0,
                    base_vertex: 0,
                    first_instance: slot as u32,
                });
                matrix_index[slot] = i as u32;
            }
        }
        (args, matrix_index)
    }

    #[test]
    fn compaction_density() {
        let visibility: Vec<u32> = (0..1000).map(|i| u32::from(i % 3 == 0)).collect();
        let count = visibility.iter().sum::<u32>() as usize;
        let (args, matrix_index) = simulate_fill(&visibility, 36);

        // Exactly `count` records, all packed at the front.
        assert!(args[..count].iter().all(Option::is_some));
        assert!(args[count..].iter().all(Option::is_none));

        // Every surviving instance appears exactly once, in index order.
        let survivors: Vec<u32> = (0..1000u32).filter(|i| i % 3 == 0).collect();
        assert_eq!(&matrix_index[..count], survivors.as_slice());

        // Records target their own slot.
        for (slot, cmd) in args[..count].iter().enumerate() {
            let cmd = cmd.unwrap();
            assert_eq!(cmd.first_instance, slot as u32);
            assert_eq!(cmd.instance_count, 1);
            assert_eq!(cmd.index_count, 36);
        }
    }
}
