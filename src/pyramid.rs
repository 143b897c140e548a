// src/pyramid.rs
//! Depth pyramid (hierarchical Z-buffer).
//!
//! A single `R32Float` texture with a full mip chain. Mip 0 is copied from
//! the rasterized depth attachment by a small compute kernel (depth formats
//! cannot be blitted into color formats), and each further mip holds the
//! max of the 2x2 block below it — max being "farthest" in 0..1 depth, so a
//! single coarse fetch answers "is anything in this footprint nearer than
//! the tested box".
//!
//! The culling pass of frame N+1 samples the pyramid built from frame N's
//! geometry; that one-frame lag is the temporal reprojection the pipeline
//! is designed around, not a race.

/// Full-chain mip count for a surface: `floor(log2(max(w, h))) + 1`, so the
/// coarsest mip is a handful of texels on non-square targets and exactly one
/// on square power-of-two targets.
pub fn mip_count_for(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// GPU depth pyramid bound to one depth attachment.
pub struct DepthPyramid {
    full_view: wgpu::TextureView,
    mip_count: u32,
    width: u32,
    height: u32,

    copy_pipeline: wgpu::ComputePipeline,
    downsample_pipeline: wgpu::ComputePipeline,
    copy_bind_group: wgpu::BindGroup,
    downsample_bind_groups: Vec<wgpu::BindGroup>,
}

impl DepthPyramid {
    /// Create the pyramid texture and the copy/downsample pipelines for a
    /// depth attachment of the given size. Bind groups are built once here;
    /// `record_build` replays them every frame.
    pub fn new(
        device: &wgpu::Device,
        depth_view: &wgpu::TextureView,
        width: u32,
        height: u32,
    ) -> Self {
        let mip_count = mip_count_for(width, height);

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("depth_pyramid"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: mip_count,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Float,
            usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });

        let full_view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("depth_pyramid_view"),
            ..Default::default()
        });

        let mip_views: Vec<wgpu::TextureView> = (0..mip_count)
            .map(|mip| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some(&format!("depth_pyramid_mip_{mip}")),
                    base_mip_level: mip,
                    mip_level_count: Some(1),
                    ..Default::default()
                })
            })
            .collect();

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("pyramid_cs"),
            source: wgpu::ShaderSource::Wgsl(PYRAMID_WGSL.into()),
        });

        let storage_mip_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: wgpu::TextureFormat::R32Float,
                view_dimension: wgpu::TextureViewDimension::D2,
            },
            count: None,
        };

        let copy_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("pyramid_copy_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Depth,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                storage_mip_entry(1),
            ],
        });

        let downsample_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("pyramid_downsample_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                storage_mip_entry(1),
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
        let copy_pipeline = make_pipeline("pyramid_copy_pipeline", &copy_bgl, "copy_depth");
        let downsample_pipeline =
            make_pipeline("pyramid_downsample_pipeline", &downsample_bgl, "downsample");

        let copy_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("pyramid_copy_bg"),
            layout: &copy_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(depth_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&mip_views[0]),
                },
            ],
        });

        let downsample_bind_groups: Vec<wgpu::BindGroup> = (1..mip_count)
            .map(|dst| {
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(&format!("pyramid_downsample_bg_{dst}")),
                    layout: &downsample_bgl,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: wgpu::BindingResource::TextureView(&mip_views[dst as usize - 1]),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(&mip_views[dst as usize]),
                        },
                    ],
                })
            })
            .collect();

        Self {
            full_view,
            mip_count,
            width,
            height,
            copy_pipeline,
            downsample_pipeline,
            copy_bind_group,
            downsample_bind_groups,
        }
    }

    /// View over the whole mip chain, for the culling kernel and the mip
    /// visualization blit. Read-only to the outside.
    pub fn view(&self) -> &wgpu::TextureView {
        &self.full_view
    }

    pub fn mip_count(&self) -> u32 {
        self.mip_count
    }

    /// Mip 0 dimensions (the depth target's size).
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn mip_size(&self, mip: u32) -> (u32, u32) {
        ((self.width >> mip).max(1), (self.height >> mip).max(1))
    }

    /// Record the full chain rebuild: depth copy into mip 0, then one
    /// max-reduction dispatch per destination mip. Must complete before the
    /// culling pass reads any mip; the frame graph places that fence.
    pub fn record_build(&self, encoder: &mut wgpu::CommandEncoder) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("pyramid_build"),
            timestamp_writes: None,
        });

        const WG: u32 = 8;
        let (w, h) = self.mip_size(0);
        pass.set_pipeline(&self.copy_pipeline);
        pass.set_bind_group(0, &self.copy_bind_group, &[]);
        pass.dispatch_workgroups(w.div_ceil(WG), h.div_ceil(WG), 1);

        pass.set_pipeline(&self.downsample_pipeline);
        for (i, bind_group) in self.downsample_bind_groups.iter().enumerate() {
            let (dst_w, dst_h) = self.mip_size(i as u32 + 1);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(dst_w.div_ceil(WG), dst_h.div_ceil(WG), 1);
        }
    }
}

const PYRAMID_WGSL: &str = r#"
// ---------------------------------------------------------------------------
// Depth attachment -> pyramid mip 0
// ---------------------------------------------------------------------------

@group(0) @binding(0) var src_depth: texture_depth_2d;
@group(0) @binding(1) var dst_copy: texture_storage_2d<r32float, write>;

@compute @workgroup_size(8, 8)
fn copy_depth(@builtin(global_invocation_id) gid: vec3<u32>) {
    let dims = textureDimensions(dst_copy);
    if (gid.x >= dims.x || gid.y >= dims.y) {
        return;
    }
    let d = textureLoad(src_depth, vec2<i32>(gid.xy), 0);
    textureStore(dst_copy, vec2<i32>(gid.xy), vec4<f32>(d, 0.0, 0.0, 0.0));
}

// ---------------------------------------------------------------------------
// Mip i -> mip i+1, max of the 2x2 block (max = farthest, conservative)
// ---------------------------------------------------------------------------

@group(0) @binding(0) var src_mip: texture_2d<f32>;
@group(0) @binding(1) var dst_mip: texture_storage_2d<r32float, write>;

@compute @workgroup_size(8, 8)
fn downsample(@builtin(global_invocation_id) gid: vec3<u32>) {
    let dst_dims = textureDimensions(dst_mip);
    if (gid.x >= dst_dims.x || gid.y >= dst_dims.y) {
        return;
    }
    let src_dims = textureDimensions(src_mip);
    let base = vec2<i32>(gid.xy) * 2;

    var farthest = 0.0;
    for (var oy = 0; oy < 2; oy = oy + 1) {
        for (var ox = 0; ox < 2; ox = ox + 1) {
            // Clamp instead of skip so odd-sized mips still reduce their
            // edge texels.
            let p = min(base + vec2<i32>(ox, oy),
                        vec2<i32>(src_dims) - vec2<i32>(1, 1));
            farthest = max(farthest, textureLoad(src_mip, p, 0).r);
        }
    }
    textureStore(dst_mip, vec2<i32>(gid.xy), vec4<f32>(farthest, 0.0, 0.0, 0.0));
}
"#;
