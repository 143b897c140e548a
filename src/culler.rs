// src/culler.rs
//! The occlusion-culling orchestrator.
//!
//! Owns every GPU resource and pipeline of the culling subsystem and runs
//! the fixed per-frame sequence: depth seed (or indirect re-rasterization of
//! last frame's survivors), depth-pyramid rebuild, per-instance cull
//! dispatch, prefix-sum compaction, indirect-argument fill, and a single
//! count-bounded indirect draw. Submission boundaries come from the frame
//! graph's computed schedule rather than hand-placed waits.
//!
//! Culling always tests against the depth the *previous* passes rendered —
//! a one-frame-stale pyramid. That lag is the design's temporal
//! reprojection, traded for never reading and writing depth in the same
//! pass.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use futures::{channel::oneshot, executor::block_on};
use glam::Mat4;
use parking_lot::Mutex;
use rayon::prelude::*;
use wgpu::util::DeviceExt;

use crate::bounds::{transform_aabb, Aabb, AabbGpu, IndexedAabb};
use crate::bvh::Bvh;
use crate::camera::CameraUniform;
use crate::error::{Error, Result};
use crate::frustum::{frustum_bvh_intersect, FrustumPlanes};
use crate::graph::{FrameGraph, PassId, QueueKind, ResourceId, Schedule, Step};
use crate::indirect::{validate_capacity, IndirectFill, INDIRECT_COMMAND_SIZE};
use crate::pyramid::DepthPyramid;
use crate::scan::ScanEngine;
use crate::scene::{InstanceData, VertexPosColor};
use crate::{bail, ensure};

const CULL_WORKGROUP_SIZE: u32 = 64;

const FLAG_FRUSTUM: u32 = 1 << 0;
const FLAG_HZB: u32 = 1 << 1;

/// Configuration knobs. Plain data; everything else derives from the scene
/// handed to `initialize`.
#[derive(Clone, Copy, Debug)]
pub struct CullerConfig {
    /// Capacity of the indirect-argument buffer (maximum surviving draws).
    /// Instance populations above this fail `initialize` explicitly.
    pub max_draws: usize,
    /// Slack added to the pyramid depth comparison so occluders exactly at
    /// an instance's depth never cull it.
    pub depth_epsilon: f32,
}

impl Default for CullerConfig {
    fn default() -> Self {
        Self {
            max_draws: 1 << 20,
            depth_epsilon: 1e-4,
        }
    }
}

/// Per-frame counters, behind a mutex so read-out never races the render
/// path.
#[derive(Clone, Debug, Default)]
pub struct CullerStats {
    /// Frames rendered since `initialize`.
    pub frame_index: u64,
    /// Candidate count from the CPU BVH/frustum hint pass.
    pub frustum_candidates: usize,
    /// Most recent visible count fetched by `read_visible_count`.
    pub last_visible_count: Option<u32>,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct CullUniforms {
    view_proj: [[f32; 4]; 4],
    planes: [[f32; 4]; 6],
    instance_count: u32,
    mip_count: u32,
    flags: u32,
    depth_epsilon: f32,
    screen_size: [f32; 2],
    _pad: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct MipParams {
    mip: u32,
    _pad: [u32; 3],
}

/// Pass handles into the frame graph, in declared frame order.
struct PassIds {
    depth: PassId,
    pyramid: PassId,
    cull: PassId,
    scan: PassId,
    fill: PassId,
    draw: PassId,
}

/// Everything `initialize` builds. Exclusively owned; other passes see the
/// pyramid only through a read-only view.
struct FrameResources {
    // Geometry + instances (ground truth, uploaded once).
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    index_count: u32,
    instance_count: u32,

    // Culling buffers consumed directly by the pass recorder. The rest of
    // the resource table (instances, AABBs, visibility, scan results,
    // matrix indices) lives on through the bind groups that reference it.
    count: wgpu::Buffer,
    indirect_args: wgpu::Buffer,

    // CPU-side broad phase.
    bvh: Bvh,
    frustum_candidates: Vec<u32>,

    // Depth attachment + pyramid.
    depth_view: wgpu::TextureView,
    pyramid: DepthPyramid,

    // Engines.
    scan: ScanEngine,
    fill: IndirectFill,

    // Camera uniforms: cull/depth passes use the main camera, color passes
    // may use a frozen debug camera.
    main_camera: wgpu::Buffer,
    view_camera: wgpu::Buffer,
    cull_uniforms: wgpu::Buffer,
    mip_params: wgpu::Buffer,

    // Pipelines.
    depth_pipeline: wgpu::RenderPipeline,
    indirect_depth_pipeline: wgpu::RenderPipeline,
    draw_pipeline: wgpu::RenderPipeline,
    indirect_draw_pipeline: wgpu::RenderPipeline,
    visualize_pipeline: wgpu::RenderPipeline,
    cull_pipeline: wgpu::ComputePipeline,

    // Bind groups.
    main_camera_bg: wgpu::BindGroup,
    view_camera_bg: wgpu::BindGroup,
    scene_bg: wgpu::BindGroup,
    indirect_scene_bg: wgpu::BindGroup,
    cull_bg: wgpu::BindGroup,
    visualize_bg: wgpu::BindGroup,

    // Frame graph + schedule for the HZB path.
    schedule: Schedule,
    passes: PassIds,
}

/// `OcclusionCuller` — create with [`OcclusionCuller::new`], feed it the
/// scene once via [`OcclusionCuller::initialize`], then call
/// [`OcclusionCuller::update`] + [`OcclusionCuller::render`] every frame.
pub struct OcclusionCuller {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    config: CullerConfig,

    resources: Option<FrameResources>,
    frustum: FrustumPlanes,

    // Runtime toggles, each independent.
    frustum_culling: bool,
    hzb_culling: bool,
    render_culling: bool,
    mip_to_display: u32,
    first_frame: bool,

    stats: Mutex<CullerStats>,
}

impl OcclusionCuller {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, config: CullerConfig) -> Self {
        Self {
            device,
            queue,
            config,
            resources: None,
            frustum: FrustumPlanes::extract(&Mat4::IDENTITY, false),
            frustum_culling: true,
            hzb_culling: true,
            render_culling: true,
            mip_to_display: 0,
            first_frame: true,
            stats: Mutex::new(CullerStats::default()),
        }
    }

    // ------------------------------------------------------------------
    // Toggle surface
    // ------------------------------------------------------------------

    pub fn toggle_frustum_culling(&mut self) {
        self.frustum_culling = !self.frustum_culling;
        log::info!("frustum culling: {}", self.frustum_culling);
    }

    pub fn toggle_hzb_culling(&mut self) {
        self.hzb_culling = !self.hzb_culling;
        // The brute-force fallback re-seeds depth, so the pyramid stays
        // coherent when HZB is switched back on.
        self.first_frame = true;
        log::info!("hzb culling: {}", self.hzb_culling);
    }

    pub fn toggle_render_culling(&mut self) {
        self.render_culling = !self.render_culling;
        log::info!("render culling: {}", self.render_culling);
    }

    pub fn set_mip_to_display(&mut self, mip: u32) {
        let max = self
            .resources
            .as_ref()
            .map(|r| r.pyramid.mip_count() - 1)
            .unwrap_or(0);
        self.mip_to_display = mip.min(max);
    }

    pub fn increment_mip_to_display(&mut self) {
        self.set_mip_to_display(self.mip_to_display + 1);
    }

    pub fn decrement_mip_to_display(&mut self) {
        self.set_mip_to_display(self.mip_to_display.saturating_sub(1));
    }

    pub fn mip_to_display(&self) -> u32 {
        self.mip_to_display
    }

    pub fn stats(&self) -> CullerStats {
        self.stats.lock().clone()
    }

    /// Candidate indices from the CPU BVH hint pass of the last `update`.
    pub fn frustum_candidates(&self) -> &[u32] {
        self.resources
            .as_ref()
            .map(|r| r.frustum_candidates.as_slice())
            .unwrap_or(&[])
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    /// Upload the scene and build every buffer, pipeline and the frame
    /// schedule. Must be called exactly once; GPU object creation failures
    /// abort via wgpu's error handling (setup is fatal by design), only
    /// configuration problems come back as `Err`.
    #[allow(clippy::too_many_arguments)]
    pub fn initialize(
        &mut self,
        vertices: &[VertexPosColor],
        indices: &[u16],
        object_aabb: Aabb,
        instances: &[InstanceData],
        surface_format: wgpu::TextureFormat,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if self.resources.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        ensure!(!instances.is_empty(), "instance array must not be empty");
        validate_capacity(instances.len(), self.config.max_draws)?;
        if !self
            .device
            .features()
            .contains(wgpu::Features::MULTI_DRAW_INDIRECT_COUNT)
        {
            bail!("device does not support count-bounded indirect draws");
        }

        let device = self.device.clone();
        let instance_count = instances.len() as u32;
        let index_count = indices.len() as u32;

        // World-space bounds for every instance; the same boxes feed the
        // CPU BVH and the GPU cull kernel.
        let world_aabbs: Vec<Aabb> = instances
            .par_iter()
            .map(|inst| transform_aabb(&object_aabb, &inst.matrix()))
            .collect();

        let mut indexed: Vec<IndexedAabb> = world_aabbs
            .iter()
            .enumerate()
            .map(|(i, &aabb)| IndexedAabb {
                aabb,
                index: i as u32,
            })
            .collect();
        let bvh = Bvh::build(&mut indexed)?;
        log::info!(
            "culler: {} instances, BVH of {} nodes, {}x{} target",
            instance_count,
            bvh.node_count(),
            width,
            height
        );

        // ---------------- buffers ----------------

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("culler_vertices"),
            contents: bytemuck::cast_slice(vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("culler_indices"),
            contents: bytemuck::cast_slice(indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        let instance_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("culler_instances"),
            contents: bytemuck::cast_slice(instances),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let aabb_data: Vec<AabbGpu> = world_aabbs.iter().map(|&a| a.into()).collect();
        let aabb_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("culler_aabbs"),
            contents: bytemuck::cast_slice(&aabb_data),
            usage: wgpu::BufferUsages::STORAGE,
        });

        // Visibility seeded to all-ones so the first indirect consumers see
        // every instance.
        let visibility = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("culler_visibility"),
            contents: bytemuck::cast_slice(&vec![1u32; instances.len()]),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let scan_result = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("culler_scan_result"),
            size: u64::from(instance_count) * 4,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let matrix_index = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("culler_matrix_index"),
            size: u64::from(instance_count) * 4,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let count = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("culler_count"),
            size: 4,
            usage: wgpu::BufferUsages::INDIRECT
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let indirect_args = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("culler_indirect_args"),
            size: self.config.max_draws as u64 * INDIRECT_COMMAND_SIZE,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::INDIRECT,
            mapped_at_creation: false,
        });

        let main_camera = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("culler_main_camera"),
            contents: bytemuck::bytes_of(&CameraUniform::from_matrix(Mat4::IDENTITY)),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let view_camera = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("culler_view_camera"),
            contents: bytemuck::bytes_of(&CameraUniform::from_matrix(Mat4::IDENTITY)),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let cull_uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("culler_cull_uniforms"),
            size: std::mem::size_of::<CullUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mip_params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("culler_mip_params"),
            contents: bytemuck::bytes_of(&MipParams { mip: 0, _pad: [0; 3] }),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        // ---------------- depth target + pyramid ----------------

        let depth_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("culler_depth"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Depth32Float,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let depth_view = depth_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let pyramid = DepthPyramid::new(&device, &depth_view, width, height);

        // ---------------- engines ----------------

        let scan = ScanEngine::new(&device, &visibility, &scan_result, instance_count);
        let fill = IndirectFill::new(
            &device,
            &visibility,
            &scan_result,
            &indirect_args,
            &matrix_index,
            instance_count,
            index_count,
        );

        // ---------------- render pipelines ----------------

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("culler_scene_shaders"),
            source: wgpu::ShaderSource::Wgsl(SCENE_WGSL.into()),
        });

        let camera_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("culler_camera_bgl"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let scene_storage_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::VERTEX,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        // Direct passes read instance transforms + the visibility flags;
        // indirect passes read transforms + the compacted matrix indices.
        let scene_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("culler_scene_bgl"),
            entries: &[scene_storage_entry(0), scene_storage_entry(1)],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("culler_scene_layout"),
            bind_group_layouts: &[&camera_bgl, &scene_bgl],
            push_constant_ranges: &[],
        });

        let depth_stencil = wgpu::DepthStencilState {
            format: wgpu::TextureFormat::Depth32Float,
            depth_write_enabled: true,
            depth_compare: wgpu::CompareFunction::Less,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        };
        let primitive = wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            cull_mode: Some(wgpu::Face::Back),
            ..Default::default()
        };

        let color_targets = [Some(wgpu::ColorTargetState {
            format: surface_format,
            blend: None,
            write_mask: wgpu::ColorWrites::ALL,
        })];

        let make_render_pipeline = |label: &str, vs: &str, fs: Option<&str>| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &module,
                    entry_point: vs,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &[VertexPosColor::layout()],
                },
                primitive,
                depth_stencil: Some(depth_stencil.clone()),
                multisample: wgpu::MultisampleState::default(),
                fragment: fs.map(|entry| wgpu::FragmentState {
                    module: &module,
                    entry_point: entry,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &color_targets,
                }),
                multiview: None,
                cache: None,
            })
        };

        let depth_pipeline = make_render_pipeline("culler_depth_pso", "vs_depth", None);
        let indirect_depth_pipeline =
            make_render_pipeline("culler_indirect_depth_pso", "vs_indirect_depth", None);
        let draw_pipeline = make_render_pipeline("culler_draw_pso", "vs_draw", Some("fs_draw"));
        let indirect_draw_pipeline =
            make_render_pipeline("culler_indirect_draw_pso", "vs_indirect_draw", Some("fs_draw"));

        // ---------------- mip visualization pipeline ----------------

        let visualize_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("culler_visualize_shaders"),
            source: wgpu::ShaderSource::Wgsl(VISUALIZE_WGSL.into()),
        });
        let visualize_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("culler_visualize_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let visualize_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("culler_visualize_layout"),
            bind_group_layouts: &[&visualize_bgl],
            push_constant_ranges: &[],
        });
        let visualize_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("culler_visualize_pso"),
            layout: Some(&visualize_layout),
            vertex: wgpu::VertexState {
                module: &visualize_module,
                entry_point: "vs_fullscreen",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[],
            },
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &visualize_module,
                entry_point: "fs_mip",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            multiview: None,
            cache: None,
        });

        // ---------------- cull pipeline ----------------

        let cull_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("culler_cull_cs"),
            source: wgpu::ShaderSource::Wgsl(CULL_WGSL.into()),
        });
        let cull_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("culler_cull_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
            ],
        });
        let cull_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("culler_cull_layout"),
            bind_group_layouts: &[&cull_bgl],
            push_constant_ranges: &[],
        });
        let cull_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("culler_cull_pipeline"),
            layout: Some(&cull_layout),
            module: &cull_module,
            entry_point: "cull_instances",
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        // ---------------- bind groups ----------------

        let camera_bg = |label: &str, buffer: &wgpu::Buffer| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &camera_bgl,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer.as_entire_binding(),
                }],
            })
        };
        let main_camera_bg = camera_bg("culler_main_camera_bg", &main_camera);
        let view_camera_bg = camera_bg("culler_view_camera_bg", &view_camera);

        let scene_bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("culler_scene_bg"),
            layout: &scene_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: instance_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: visibility.as_entire_binding(),
                },
            ],
        });
        let indirect_scene_bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("culler_indirect_scene_bg"),
            layout: &scene_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: instance_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: matrix_index.as_entire_binding(),
                },
            ],
        });
        let cull_bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("culler_cull_bg"),
            layout: &cull_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: cull_uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: aabb_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: visibility.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(pyramid.view()),
                },
            ],
        });
        let visualize_bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("culler_visualize_bg"),
            layout: &visualize_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(pyramid.view()),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: mip_params.as_entire_binding(),
                },
            ],
        });

        // ---------------- frame graph ----------------

        let (schedule, passes) = Self::build_schedule()?;

        self.resources = Some(FrameResources {
            vertex_buffer,
            index_buffer,
            index_count,
            instance_count,
            count,
            indirect_args,
            bvh,
            frustum_candidates: Vec::new(),
            depth_view,
            pyramid,
            scan,
            fill,
            main_camera,
            view_camera,
            cull_uniforms,
            mip_params,
            depth_pipeline,
            indirect_depth_pipeline,
            draw_pipeline,
            indirect_draw_pipeline,
            visualize_pipeline,
            cull_pipeline,
            main_camera_bg,
            view_camera_bg,
            scene_bg,
            indirect_scene_bg,
            cull_bg,
            visualize_bg,
            schedule,
            passes,
        });
        self.first_frame = true;
        Ok(())
    }

    /// Declare the HZB frame as a pass DAG and let the scheduler place the
    /// cross-queue fences.
    fn build_schedule() -> Result<(Schedule, PassIds)> {
        const DEPTH: ResourceId = ResourceId(0);
        const PYRAMID: ResourceId = ResourceId(1);
        const VISIBILITY: ResourceId = ResourceId(2);
        const SCAN: ResourceId = ResourceId(3);
        const COUNT: ResourceId = ResourceId(4);
        const ARGS: ResourceId = ResourceId(5);
        const MATRIX_INDEX: ResourceId = ResourceId(6);
        const INSTANCES: ResourceId = ResourceId(7);
        const AABBS: ResourceId = ResourceId(8);
        const TARGET: ResourceId = ResourceId(9);

        let mut graph = FrameGraph::new();
        // Uploaded at initialize, or left over from the previous frame.
        graph.import(INSTANCES);
        graph.import(AABBS);
        graph.import(ARGS);
        graph.import(COUNT);
        graph.import(MATRIX_INDEX);

        let depth = graph.add_pass(
            "depth_seed",
            QueueKind::Graphics,
            &[INSTANCES, ARGS, COUNT, MATRIX_INDEX],
            &[DEPTH],
        );
        let pyramid = graph.add_pass("pyramid_build", QueueKind::Compute, &[DEPTH], &[PYRAMID]);
        let cull = graph.add_pass(
            "cull_dispatch",
            QueueKind::Compute,
            &[PYRAMID, AABBS],
            &[VISIBILITY],
        );
        let scan = graph.add_pass(
            "prefix_sum",
            QueueKind::Compute,
            &[VISIBILITY],
            &[SCAN, COUNT],
        );
        let fill = graph.add_pass(
            "indirect_fill",
            QueueKind::Compute,
            &[VISIBILITY, SCAN],
            &[ARGS, MATRIX_INDEX],
        );
        let draw = graph.add_pass(
            "indirect_draw",
            QueueKind::Graphics,
            &[ARGS, COUNT, MATRIX_INDEX, INSTANCES],
            &[TARGET, DEPTH],
        );

        let schedule = graph.schedule()?;
        log::debug!("culler schedule: {:?}", schedule.steps);
        Ok((
            schedule,
            PassIds {
                depth,
                pyramid,
                cull,
                scan,
                fill,
                draw,
            },
        ))
    }

    // ------------------------------------------------------------------
    // Per-frame entry points
    // ------------------------------------------------------------------

    /// Refresh the frustum planes (unnormalized — only the signs matter to
    /// the kernel) and the CPU broad-phase candidate hints.
    pub fn update(&mut self, view_proj: Mat4) -> Result<()> {
        self.frustum = FrustumPlanes::extract(&view_proj, false);

        let resources = self.resources.as_mut().ok_or(Error::NotInitialized)?;
        resources.frustum_candidates.clear();
        frustum_bvh_intersect(
            &resources.bvh,
            &self.frustum,
            &mut resources.frustum_candidates,
        );

        let mut stats = self.stats.lock();
        stats.frustum_candidates = resources.frustum_candidates.len();
        log::trace!(
            "frustum hint: {} / {} candidates",
            stats.frustum_candidates,
            resources.instance_count
        );
        Ok(())
    }

    /// Run the frame. `debug_view_proj`, when set, renders the color passes
    /// from a second camera while culling stays on the main one (freeze-
    /// frame debugging).
    pub fn render(
        &mut self,
        main_view_proj: Mat4,
        debug_view_proj: Option<Mat4>,
        target: &wgpu::TextureView,
    ) -> Result<()> {
        let resources = self.resources.as_ref().ok_or(Error::NotInitialized)?;

        let view_matrix = debug_view_proj.unwrap_or(main_view_proj);
        self.queue.write_buffer(
            &resources.main_camera,
            0,
            bytemuck::bytes_of(&CameraUniform::from_matrix(main_view_proj)),
        );
        self.queue.write_buffer(
            &resources.view_camera,
            0,
            bytemuck::bytes_of(&CameraUniform::from_matrix(view_matrix)),
        );

        let mut flags = 0u32;
        if self.frustum_culling {
            flags |= FLAG_FRUSTUM;
        }
        if self.hzb_culling {
            flags |= FLAG_HZB;
        }
        let planes = self.frustum.planes.map(|p| [p.a, p.b, p.c, p.d]);
        // Pyramid mip 0 matches the depth target, so its size is the
        // screen-space footprint reference.
        let (pyramid_w, pyramid_h) = resources.pyramid.size();
        let pyramid_size = [pyramid_w as f32, pyramid_h as f32];
        self.queue.write_buffer(
            &resources.cull_uniforms,
            0,
            bytemuck::bytes_of(&CullUniforms {
                view_proj: main_view_proj.to_cols_array_2d(),
                planes,
                instance_count: resources.instance_count,
                mip_count: resources.pyramid.mip_count(),
                flags,
                depth_epsilon: self.config.depth_epsilon,
                screen_size: pyramid_size,
                _pad: [0.0; 2],
            }),
        );

        if !self.render_culling {
            self.render_mip_visualization(target)?;
        } else if self.hzb_culling {
            self.render_hzb(target)?;
        } else {
            self.render_brute_force(target)?;
        }

        self.first_frame = false;
        self.stats.lock().frame_index += 1;
        Ok(())
    }

    /// The full GPU-driven path, executed in the order the schedule dictates.
    /// Logical queues share one wgpu queue, so each fence becomes a
    /// submission boundary (submissions on a queue complete in order).
    fn render_hzb(&self, target: &wgpu::TextureView) -> Result<()> {
        let resources = self.resources.as_ref().ok_or(Error::NotInitialized)?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("culler_hzb_encoder"),
            });

        for step in &resources.schedule.steps {
            match *step {
                Step::Fence { .. } => {
                    let finished = std::mem::replace(
                        &mut encoder,
                        self.device
                            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                                label: Some("culler_hzb_encoder"),
                            }),
                    );
                    self.queue.submit(Some(finished.finish()));
                }
                Step::Execute(pass) => {
                    self.record_pass(resources, pass, target, &mut encoder);
                }
            }
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn record_pass(
        &self,
        resources: &FrameResources,
        pass: PassId,
        target: &wgpu::TextureView,
        encoder: &mut wgpu::CommandEncoder,
    ) {
        let p = &resources.passes;
        if pass == p.depth {
            self.record_depth_pass(resources, encoder, self.first_frame || !self.hzb_culling);
        } else if pass == p.pyramid {
            resources.pyramid.record_build(encoder);
        } else if pass == p.cull {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("cull_dispatch"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(&resources.cull_pipeline);
            cpass.set_bind_group(0, &resources.cull_bg, &[]);
            cpass.dispatch_workgroups(
                resources.instance_count.div_ceil(CULL_WORKGROUP_SIZE),
                1,
                1,
            );
        } else if pass == p.scan {
            resources.scan.record(encoder, &resources.count);
        } else if pass == p.fill {
            resources.fill.record(encoder);
        } else if pass == p.draw {
            self.record_indirect_draw_pass(resources, target, encoder);
        }
    }

    /// Depth seeding: brute-force on the first frame (nothing trustworthy in
    /// the argument buffers yet) and whenever HZB culling is off; indirect
    /// re-rasterization of last frame's survivors otherwise.
    fn record_depth_pass(
        &self,
        resources: &FrameResources,
        encoder: &mut wgpu::CommandEncoder,
        brute_force: bool,
    ) {
        let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("depth_seed"),
            color_attachments: &[],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &resources.depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            occlusion_query_set: None,
            timestamp_writes: None,
        });

        rpass.set_bind_group(0, &resources.main_camera_bg, &[]);
        rpass.set_vertex_buffer(0, resources.vertex_buffer.slice(..));
        rpass.set_index_buffer(resources.index_buffer.slice(..), wgpu::IndexFormat::Uint16);

        if brute_force {
            rpass.set_pipeline(&resources.depth_pipeline);
            rpass.set_bind_group(1, &resources.scene_bg, &[]);
            rpass.draw_indexed(0..resources.index_count, 0, 0..resources.instance_count);
        } else {
            rpass.set_pipeline(&resources.indirect_depth_pipeline);
            rpass.set_bind_group(1, &resources.indirect_scene_bg, &[]);
            rpass.multi_draw_indexed_indirect_count(
                &resources.indirect_args,
                0,
                &resources.count,
                0,
                resources.instance_count,
            );
        }
    }

    fn record_indirect_draw_pass(
        &self,
        resources: &FrameResources,
        target: &wgpu::TextureView,
        encoder: &mut wgpu::CommandEncoder,
    ) {
        let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("indirect_draw"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(CLEAR_COLOR),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &resources.depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            occlusion_query_set: None,
            timestamp_writes: None,
        });

        rpass.set_pipeline(&resources.indirect_draw_pipeline);
        rpass.set_bind_group(0, &resources.view_camera_bg, &[]);
        rpass.set_bind_group(1, &resources.indirect_scene_bg, &[]);
        rpass.set_vertex_buffer(0, resources.vertex_buffer.slice(..));
        rpass.set_index_buffer(resources.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
        rpass.multi_draw_indexed_indirect_count(
            &resources.indirect_args,
            0,
            &resources.count,
            0,
            resources.instance_count,
        );
    }

    /// Correctness baseline: rasterize everything, no compute culling. Does
    /// not scale to the full population at interactive rates; it exists as
    /// the recovery path when HZB culling is off.
    fn render_brute_force(&self, target: &wgpu::TextureView) -> Result<()> {
        let resources = self.resources.as_ref().ok_or(Error::NotInitialized)?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("culler_brute_encoder"),
            });

        self.record_depth_pass(resources, &mut encoder, true);

        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("brute_force_draw"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(CLEAR_COLOR),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &resources.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            rpass.set_pipeline(&resources.draw_pipeline);
            rpass.set_bind_group(0, &resources.view_camera_bg, &[]);
            rpass.set_bind_group(1, &resources.scene_bg, &[]);
            rpass.set_vertex_buffer(0, resources.vertex_buffer.slice(..));
            rpass.set_index_buffer(resources.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
            rpass.draw_indexed(0..resources.index_count, 0, 0..resources.instance_count);
        }

        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    /// Debug mode: draw the scene, rebuild the pyramid, then blit the
    /// selected mip over the target.
    fn render_mip_visualization(&self, target: &wgpu::TextureView) -> Result<()> {
        let resources = self.resources.as_ref().ok_or(Error::NotInitialized)?;

        self.queue.write_buffer(
            &resources.mip_params,
            0,
            bytemuck::bytes_of(&MipParams {
                mip: self.mip_to_display.min(resources.pyramid.mip_count() - 1),
                _pad: [0; 3],
            }),
        );

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("culler_visualize_encoder"),
            });

        self.record_depth_pass(resources, &mut encoder, true);
        resources.pyramid.record_build(&mut encoder);

        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("visualize_mips"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(CLEAR_COLOR),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            rpass.set_pipeline(&resources.visualize_pipeline);
            rpass.set_bind_group(0, &resources.visualize_bg, &[]);
            rpass.draw(0..3, 0..1);
        }

        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    /// Debug helper: blocking read-back of the visible count. Never called
    /// on the render path — the indirect draw consumes the count on the GPU.
    pub fn read_visible_count(&self) -> Result<u32> {
        let resources = self.resources.as_ref().ok_or(Error::NotInitialized)?;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("culler_count_staging"),
            size: 4,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("culler_count_readback"),
            });
        encoder.copy_buffer_to_buffer(&resources.count, 0, &staging, 0, 4);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            sender.send(res).ok();
        });
        self.device.poll(wgpu::Maintain::Wait);

        match block_on(receiver) {
            Ok(Ok(())) => {
                let mapped = slice.get_mapped_range();
                let value = u32::from_le_bytes(mapped[0..4].try_into().unwrap());
                drop(mapped);
                staging.unmap();
                self.stats.lock().last_visible_count = Some(value);
                Ok(value)
            }
            _ => Err(Error::msg("count read-back failed")),
        }
    }
}

const CLEAR_COLOR: wgpu::Color = wgpu::Color {
    r: 0.4,
    g: 0.6,
    b: 0.9,
    a: 1.0,
};

const SCENE_WGSL: &str = r#"
struct Camera {
    view_proj: mat4x4<f32>,
};

struct InstanceData {
    world: mat4x4<f32>,
};

@group(0) @binding(0) var<uniform> camera: Camera;
@group(1) @binding(0) var<storage, read> instances: array<InstanceData>;
// Direct passes: per-instance visibility flags. Indirect passes: the
// compacted slot -> instance index table.
@group(1) @binding(1) var<storage, read> aux: array<u32>;

struct VsIn {
    @location(0) position: vec3<f32>,
    @location(1) color: vec3<f32>,
};

struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) color: vec3<f32>,
};

// ---------------------------------------------------------------------------
// Direct passes: one instance per instance_index
// ---------------------------------------------------------------------------

@vertex
fn vs_depth(@builtin(instance_index) inst: u32, in: VsIn) -> @builtin(position) vec4<f32> {
    let world = instances[inst].world;
    return camera.view_proj * world * vec4<f32>(in.position, 1.0);
}

@vertex
fn vs_draw(@builtin(instance_index) inst: u32, in: VsIn) -> VsOut {
    let world = instances[inst].world;
    let pos = camera.view_proj * world * vec4<f32>(in.position, 1.0);
    var out: VsOut;
    // Clip culled instances away entirely (z > w).
    out.position = select(vec4<f32>(0.0, 0.0, 2.0, 1.0), pos, aux[inst] != 0u);
    out.color = in.color;
    return out;
}

// ---------------------------------------------------------------------------
// Indirect passes: instance_index is the compacted slot (first_instance)
// ---------------------------------------------------------------------------

@vertex
fn vs_indirect_depth(@builtin(instance_index) slot: u32, in: VsIn) -> @builtin(position) vec4<f32> {
    let world = instances[aux[slot]].world;
    return camera.view_proj * world * vec4<f32>(in.position, 1.0);
}

@vertex
fn vs_indirect_draw(@builtin(instance_index) slot: u32, in: VsIn) -> VsOut {
    let world = instances[aux[slot]].world;
    var out: VsOut;
    out.position = camera.view_proj * world * vec4<f32>(in.position, 1.0);
    out.color = in.color;
    return out;
}

@fragment
fn fs_draw(in: VsOut) -> @location(0) vec4<f32> {
    return vec4<f32>(in.color, 1.0);
}
"#;

const VISUALIZE_WGSL: &str = r#"
struct MipParams {
    mip: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
};

@group(0) @binding(0) var pyramid: texture_2d<f32>;
@group(0) @binding(1) var<uniform> params: MipParams;

struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

// Fullscreen triangle, no vertex buffer.
@vertex
fn vs_fullscreen(@builtin(vertex_index) index: u32) -> VsOut {
    var out: VsOut;
    let x = f32(i32(index) / 2) * 4.0 - 1.0;
    let y = f32(i32(index) & 1) * 4.0 - 1.0;
    out.position = vec4<f32>(x, y, 0.0, 1.0);
    out.uv = vec2<f32>(x, -y) * 0.5 + 0.5;
    return out;
}

@fragment
fn fs_mip(in: VsOut) -> @location(0) vec4<f32> {
    let dims = textureDimensions(pyramid, params.mip);
    let coords = vec2<i32>(in.uv * vec2<f32>(dims));
    let clamped = clamp(coords, vec2<i32>(0, 0), vec2<i32>(dims) - vec2<i32>(1, 1));
    let depth = textureLoad(pyramid, clamped, i32(params.mip)).r;
    return vec4<f32>(depth, depth, depth, 1.0);
}
"#;

const CULL_WGSL: &str = r#"
struct CullUniforms {
    view_proj: mat4x4<f32>,
    planes: array<vec4<f32>, 6>,
    instance_count: u32,
    mip_count: u32,
    flags: u32,
    depth_epsilon: f32,
    screen_size: vec2<f32>,
    pad: vec2<f32>,
};

struct AabbGpu {
    min_: vec4<f32>,
    max_: vec4<f32>,
};

const FLAG_FRUSTUM: u32 = 1u;
const FLAG_HZB: u32 = 2u;

@group(0) @binding(0) var<uniform> cull: CullUniforms;
@group(0) @binding(1) var<storage, read> aabbs: array<AabbGpu>;
@group(0) @binding(2) var<storage, read_write> visibility: array<u32>;
@group(0) @binding(3) var pyramid: texture_2d<f32>;

fn corner_of(bmin: vec3<f32>, bmax: vec3<f32>, index: u32) -> vec3<f32> {
    return vec3<f32>(
        select(bmin.x, bmax.x, (index & 1u) != 0u),
        select(bmin.y, bmax.y, (index & 2u) != 0u),
        select(bmin.z, bmax.z, (index & 4u) != 0u),
    );
}

// Positive-vertex frustum rejection: the corner most along the plane normal
// decides. Matches the CPU test exactly.
fn outside_frustum(bmin: vec3<f32>, bmax: vec3<f32>) -> bool {
    for (var p = 0u; p < 6u; p = p + 1u) {
        let plane = cull.planes[p];
        let positive = vec3<f32>(
            select(bmin.x, bmax.x, plane.x >= 0.0),
            select(bmin.y, bmax.y, plane.y >= 0.0),
            select(bmin.z, bmax.z, plane.z >= 0.0),
        );
        if (dot(plane.xyz, positive) + plane.w < 0.0) {
            return true;
        }
    }
    return false;
}

@compute @workgroup_size(64)
fn cull_instances(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= cull.instance_count) {
        return;
    }

    let bmin = aabbs[i].min_.xyz;
    let bmax = aabbs[i].max_.xyz;
    var visible = 1u;

    if ((cull.flags & FLAG_FRUSTUM) != 0u && outside_frustum(bmin, bmax)) {
        visible = 0u;
    }

    if (visible == 1u && (cull.flags & FLAG_HZB) != 0u) {
        // Project the 8 corners; anything crossing the near plane stays
        // visible (no reliable footprint).
        var uv_min = vec2<f32>(1e30, 1e30);
        var uv_max = vec2<f32>(-1e30, -1e30);
        var depth_min = 1e30;
        var near_crossing = false;

        for (var c = 0u; c < 8u; c = c + 1u) {
            let clip = cull.view_proj * vec4<f32>(corner_of(bmin, bmax, c), 1.0);
            if (clip.w <= 0.0) {
                near_crossing = true;
                break;
            }
            let ndc = clip.xyz / clip.w;
            let uv = vec2<f32>(ndc.x, -ndc.y) * 0.5 + 0.5;
            uv_min = min(uv_min, uv);
            uv_max = max(uv_max, uv);
            depth_min = min(depth_min, ndc.z);
        }

        if (!near_crossing) {
            let clamped_min = clamp(uv_min, vec2<f32>(0.0), vec2<f32>(1.0));
            let clamped_max = clamp(uv_max, vec2<f32>(0.0), vec2<f32>(1.0));

            // Coarsest mip whose 2x2 texel footprint still covers the
            // projected rect.
            let rect_px = (clamped_max - clamped_min) * cull.screen_size;
            let extent = max(max(rect_px.x, rect_px.y), 1.0);
            let mip = u32(clamp(
                ceil(log2(extent * 0.5)),
                0.0,
                f32(cull.mip_count - 1u),
            ));

            let dims = textureDimensions(pyramid, mip);
            let fdims = vec2<f32>(dims);
            let limit = vec2<i32>(dims) - vec2<i32>(1, 1);
            let t00 = clamp(vec2<i32>(clamped_min * fdims), vec2<i32>(0, 0), limit);
            let t11 = clamp(vec2<i32>(clamped_max * fdims), vec2<i32>(0, 0), limit);

            var farthest = 0.0;
            farthest = max(farthest, textureLoad(pyramid, t00, i32(mip)).r);
            farthest = max(farthest, textureLoad(pyramid, vec2<i32>(t11.x, t00.y), i32(mip)).r);
            farthest = max(farthest, textureLoad(pyramid, vec2<i32>(t00.x, t11.y), i32(mip)).r);
            farthest = max(farthest, textureLoad(pyramid, t11, i32(mip)).r);

            // Occluded only when the box's nearest depth is behind the
            // farthest occluder in the footprint.
            if (depth_min > farthest + cull.depth_epsilon) {
                visible = 0u;
            }
        }
    }

    visibility[i] = visible;
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = CullerConfig::default();
        assert!(config.max_draws >= 1 << 20);
        assert!(config.depth_epsilon > 0.0);
    }

    #[test]
    fn schedule_fences_sit_at_the_queue_crossings() {
        let (schedule, passes) = OcclusionCuller::build_schedule().unwrap();

        // Graphics depth -> compute pyramid crossing.
        assert_eq!(schedule.fence_before(passes.pyramid), Some(passes.depth));
        // Compute fill -> graphics draw crossing; waiting on fill covers the
        // whole compute chain.
        assert_eq!(schedule.fence_before(passes.draw), Some(passes.fill));
        // The compute chain itself runs fence-free.
        assert_eq!(schedule.fence_before(passes.cull), None);
        assert_eq!(schedule.fence_before(passes.scan), None);
        assert_eq!(schedule.fence_before(passes.fill), None);
        assert_eq!(schedule.fence_count(), 2);
    }

    #[test]
    fn cull_uniforms_layout_is_std140_compatible() {
        // mat4 (64) + planes (96) + 4 scalars (16) + 2 vec2 (16).
        assert_eq!(std::mem::size_of::<CullUniforms>(), 192);
        assert_eq!(std::mem::size_of::<MipParams>(), 16);
    }

    // -----------------------------------------------------------------------
    // CPU mirror of the cull kernel's depth-pyramid test, used to check the
    // temporal-lag conservativeness property: with an unchanged camera and
    // unchanged depth, the HZB test never drops an instance the brute-force
    // frustum pass would draw.
    // -----------------------------------------------------------------------

    use crate::frustum::{frustum_aabb_intersect, Intersection};
    use glam::Vec3;

    struct CpuPyramid {
        levels: Vec<Vec<Vec<f32>>>, // levels[mip][y][x]
    }

    impl CpuPyramid {
        fn flat(width: usize, height: usize, depth: f32) -> Self {
            let mut levels = vec![vec![vec![depth; width]; height]];
            let (mut w, mut h) = (width, height);
            while w > 1 || h > 1 {
                w = (w / 2).max(1);
                h = (h / 2).max(1);
                levels.push(vec![vec![depth; w]; h]);
            }
            Self { levels }
        }

        fn mip_count(&self) -> u32 {
            self.levels.len() as u32
        }

        fn sample(&self, mip: usize, x: f32, y: f32) -> f32 {
            let level = &self.levels[mip];
            let (w, h) = (level[0].len(), level.len());
            let xi = ((x * w as f32) as usize).min(w - 1);
            let yi = ((y * h as f32) as usize).min(h - 1);
            level[yi][xi]
        }
    }

    /// Same steps as `cull_instances` in CULL_WGSL, minus the frustum part.
    fn hzb_visible(aabb: &Aabb, vp: &Mat4, pyramid: &CpuPyramid, epsilon: f32) -> bool {
        let screen_w = pyramid.levels[0][0].len() as f32;
        let screen_h = pyramid.levels[0].len() as f32;

        let mut uv_min = [f32::MAX, f32::MAX];
        let mut uv_max = [f32::MIN, f32::MIN];
        let mut depth_min = f32::MAX;
        for corner in aabb.corners() {
            let clip = *vp * corner.extend(1.0);
            if clip.w <= 0.0 {
                return true; // near-plane crossing: keep
            }
            let ndc = clip.truncate() / clip.w;
            let uv = [ndc.x * 0.5 + 0.5, -ndc.y * 0.5 + 0.5];
            uv_min = [uv_min[0].min(uv[0]), uv_min[1].min(uv[1])];
            uv_max = [uv_max[0].max(uv[0]), uv_max[1].max(uv[1])];
            depth_min = depth_min.min(ndc.z);
        }

        let min = [uv_min[0].clamp(0.0, 1.0), uv_min[1].clamp(0.0, 1.0)];
        let max = [uv_max[0].clamp(0.0, 1.0), uv_max[1].clamp(0.0, 1.0)];

        let rect_px = [(max[0] - min[0]) * screen_w, (max[1] - min[1]) * screen_h];
        let extent = rect_px[0].max(rect_px[1]).max(1.0);
        let mip = ((extent * 0.5).log2().ceil())
            .clamp(0.0, (pyramid.mip_count() - 1) as f32) as usize;

        let farthest = pyramid
            .sample(mip, min[0], min[1])
            .max(pyramid.sample(mip, max[0], min[1]))
            .max(pyramid.sample(mip, min[0], max[1]))
            .max(pyramid.sample(mip, max[0], max[1]));

        depth_min <= farthest + epsilon
    }

    fn test_camera() -> Mat4 {
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 1000.0);
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        proj * view
    }

    fn box_at(center: Vec3, half: f32) -> Aabb {
        Aabb {
            min: center - Vec3::splat(half),
            max: center + Vec3::splat(half),
        }
    }

    #[test]
    fn static_frame_hzb_is_conservative_against_brute_force() {
        // Frame N rendered nothing but the clear (depth = 1.0 everywhere);
        // frame N+1 culls against it. Anything the frustum pass keeps must
        // also survive the pyramid test.
        let vp = test_camera();
        let frustum = FrustumPlanes::extract(&vp, false);
        let pyramid = CpuPyramid::flat(256, 256, 1.0);
        let epsilon = CullerConfig::default().depth_epsilon;

        let boxes: Vec<Aabb> = (0..64)
            .map(|i| {
                let x = (i % 8) as f32 * 10.0 - 35.0;
                let y = (i / 8) as f32 * 10.0 - 35.0;
                box_at(Vec3::new(x, y, -120.0), 2.0)
            })
            .collect();

        for (i, b) in boxes.iter().enumerate() {
            let in_frustum = frustum_aabb_intersect(b, &frustum) != Intersection::Outside;
            if in_frustum {
                assert!(
                    hzb_visible(b, &vp, &pyramid, epsilon),
                    "box {i} kept by frustum pass but dropped by HZB test"
                );
            }
        }
    }

    #[test]
    fn wall_of_depth_occludes_only_what_is_behind_it() {
        // Previous frame rasterized a full-screen occluder at depth 0.5.
        let vp = test_camera();
        let pyramid = CpuPyramid::flat(256, 256, 0.5);
        let epsilon = CullerConfig::default().depth_epsilon;

        // With znear 0.1, NDC depth 0.5 sits around view z = -0.2; a box a
        // hand's width from the camera projects nearer than the wall.
        let near_box = box_at(Vec3::new(0.0, 0.0, -0.18), 0.01);
        assert!(hzb_visible(&near_box, &vp, &pyramid, epsilon));

        // A box far behind the wall projects deeper and must be culled.
        let far_box = box_at(Vec3::new(0.0, 0.0, -500.0), 2.0);
        assert!(!hzb_visible(&far_box, &vp, &pyramid, epsilon));
    }

    #[test]
    fn near_plane_crossers_are_never_culled() {
        let vp = test_camera();
        let pyramid = CpuPyramid::flat(64, 64, 0.0); // everything occluded
        // Box straddling the camera position.
        let hugging = box_at(Vec3::new(0.0, 0.0, 0.0), 1.0);
        assert!(hzb_visible(&hugging, &vp, &pyramid, 1e-4));
    }
}
