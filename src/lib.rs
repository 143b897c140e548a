// src/lib.rs
//! GPU-driven hierarchical-depth (HZB) occlusion culling.
//!
//! The crate decides, for a very large population of instances, which are
//! visible from a camera this frame and drives a single count-bounded
//! indirect draw of only those instances. CPU side: world AABBs, a BVH and
//! frustum-plane hints. GPU side: a depth pyramid, a per-instance cull
//! kernel, a multi-level prefix-sum compaction and an indirect-argument
//! fill, sequenced by an auditable frame graph.
//!
//! `run_native()` opens the demo: a grid of instanced cubes with the full
//! pipeline driving the draw, plus runtime toggles and a pyramid-mip
//! debug view.

use std::sync::Arc;
use std::time::Instant;

use glam::{Mat4, Vec3};
use winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

pub mod bounds;
pub mod bvh;
pub mod camera;
pub mod context;
pub mod culler;
pub mod error;
pub mod frustum;
pub mod graph;
pub mod indirect;
pub mod pyramid;
pub mod scan;
pub mod scene;

pub use context::{Context, OptionContext};
pub use culler::{CullerConfig, CullerStats, OcclusionCuller};
pub use error::{Error, Result};

use camera::{Camera, CameraController};

/// Instances in the demo scene. Large enough that the brute-force fallback
/// visibly chugs while the HZB path stays interactive.
const DEMO_INSTANCES: usize = 100_000;
const DEMO_SPACING: f32 = 4.0;

#[cfg(not(target_arch = "wasm32"))]
pub fn run_native() -> anyhow::Result<()> {
    pollster::block_on(run_inner())
}

// ----------------------------------------------------------------------------
// winit 0.30 + wgpu 22 App State
// ----------------------------------------------------------------------------
struct CullerApp {
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,

    // Created inside the `resumed` event
    window: Option<Arc<Window>>,
    surface: Option<wgpu::Surface<'static>>,
    config: Option<wgpu::SurfaceConfiguration>,

    culler: Option<OcclusionCuller>,
    camera: Camera,
    controller: CameraController,
    /// While frozen, culling keeps using this view-projection and the live
    /// camera only drives the color pass — fly around the culling result.
    frozen_cull_vp: Option<Mat4>,
    last_frame: Instant,
}

impl CullerApp {
    fn build_culler(&mut self, format: wgpu::TextureFormat, width: u32, height: u32) {
        let mut culler = OcclusionCuller::new(
            self.device.clone(),
            self.queue.clone(),
            CullerConfig::default(),
        );

        let instances = scene::instance_grid(DEMO_INSTANCES, DEMO_SPACING);
        culler
            .initialize(
                &scene::cube_vertices(),
                &scene::cube_indices(),
                scene::cube_aabb(),
                &instances,
                format,
                width,
                height,
            )
            .expect("failed to initialize the occlusion culler");
        self.culler = Some(culler);
    }

    fn handle_key(&mut self, code: KeyCode) {
        let Some(culler) = self.culler.as_mut() else {
            return;
        };
        match code {
            KeyCode::KeyF => culler.toggle_frustum_culling(),
            KeyCode::KeyH => culler.toggle_hzb_culling(),
            KeyCode::KeyC => culler.toggle_render_culling(),
            KeyCode::BracketRight => culler.increment_mip_to_display(),
            KeyCode::BracketLeft => culler.decrement_mip_to_display(),
            KeyCode::Space => {
                self.frozen_cull_vp = match self.frozen_cull_vp {
                    Some(_) => {
                        log::info!("culling camera unfrozen");
                        None
                    }
                    None => {
                        log::info!("culling camera frozen");
                        Some(self.camera.view_proj_matrix())
                    }
                };
            }
            KeyCode::KeyV => match culler.read_visible_count() {
                Ok(count) => log::info!("visible instances: {count}"),
                Err(err) => log::warn!("count read-back failed: {err}"),
            },
            _ => {}
        }
    }

    fn movement_axis(&mut self, code: KeyCode, pressed: bool) {
        let value = if pressed { 1.0 } else { 0.0 };
        match code {
            KeyCode::KeyW => self.controller.forward = value,
            KeyCode::KeyS => self.controller.forward = -value,
            KeyCode::KeyD => self.controller.right = value,
            KeyCode::KeyA => self.controller.right = -value,
            KeyCode::KeyE => self.controller.up = value,
            KeyCode::KeyQ => self.controller.up = -value,
            KeyCode::ArrowLeft => self.controller.yaw_delta = if pressed { 0.03 } else { 0.0 },
            KeyCode::ArrowRight => self.controller.yaw_delta = if pressed { -0.03 } else { 0.0 },
            KeyCode::ArrowUp => self.controller.pitch_delta = if pressed { 0.02 } else { 0.0 },
            KeyCode::ArrowDown => self.controller.pitch_delta = if pressed { -0.02 } else { 0.0 },
            _ => {}
        }
    }

    fn redraw(&mut self) {
        let (Some(surface), Some(config)) = (self.surface.as_ref(), self.config.as_ref()) else {
            return;
        };
        let Some(culler) = self.culler.as_mut() else {
            return;
        };

        let dt = self.last_frame.elapsed().as_secs_f32().min(0.1);
        self.last_frame = Instant::now();
        self.controller.update_camera(&mut self.camera, dt);

        let live_vp = self.camera.view_proj_matrix();
        let (cull_vp, debug_vp) = match self.frozen_cull_vp {
            Some(frozen) => (frozen, Some(live_vp)),
            None => (live_vp, None),
        };

        if let Err(err) = culler.update(cull_vp) {
            log::error!("culler update failed: {err}");
            return;
        }

        let frame = match surface.get_current_texture() {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!(
                    "Failed to acquire next swap chain texture: {:?}. Reconfiguring surface.",
                    err
                );
                surface.configure(&self.device, config);
                match surface.get_current_texture() {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::error!("Failed to acquire frame after reconfigure: {:?}", e);
                        return;
                    }
                }
            }
        };

        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        if let Err(err) = culler.render(cull_vp, debug_vp, &view) {
            log::error!("culler render failed: {err}");
        }
        frame.present();

        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }
}

impl ApplicationHandler for CullerApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        event_loop.set_control_flow(ControlFlow::Poll);

        if self.window.is_some() {
            return;
        }

        // 1. Create Window
        let attrs = Window::default_attributes().with_title("HZB Occlusion Culling");
        let window = Arc::new(
            event_loop
                .create_window(attrs)
                .expect("Failed to create window"),
        );
        self.window = Some(window.clone());

        // 2. Create and configure Surface
        let surface = self
            .instance
            .create_surface(window.clone())
            .expect("Failed to create surface");
        let size = window.inner_size();
        let caps = surface.get_capabilities(&self.adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .unwrap_or(caps.formats[0]);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: caps.present_modes[0],
            alpha_mode: caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2u32,
        };

        surface.configure(&self.device, &config);

        self.camera.set_aspect(config.width as f32 / config.height as f32);
        self.build_culler(format, config.width, config.height);

        self.surface = Some(surface);
        self.config = Some(config);

        window.request_redraw();
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        let Some(window) = self.window.as_ref() else {
            return;
        };
        if window.id() != window_id {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(new_size) => {
                if new_size.width > 0 && new_size.height > 0 {
                    let mut reconfigured = None;
                    if let (Some(surface), Some(config)) =
                        (self.surface.as_ref(), self.config.as_mut())
                    {
                        config.width = new_size.width;
                        config.height = new_size.height;
                        surface.configure(&self.device, config);
                        reconfigured = Some((config.format, config.width, config.height));
                    }
                    // Depth target and pyramid are sized at initialize;
                    // rebuild the whole subsystem for the new extent.
                    if let Some((format, w, h)) = reconfigured {
                        self.camera.set_aspect(w as f32 / h as f32);
                        self.culler = None;
                        self.build_culler(format, w, h);
                    }
                }
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state,
                        repeat,
                        ..
                    },
                ..
            } => {
                if state == ElementState::Pressed && !repeat {
                    self.handle_key(code);
                }
                self.movement_axis(code, state == ElementState::Pressed);
            }
            WindowEvent::RedrawRequested => {
                self.redraw();
            }
            _ => {}
        }
    }
}

// ----------------------------------------------------------------------------
// Async Runner
// ----------------------------------------------------------------------------
async fn run_inner() -> anyhow::Result<()> {
    use anyhow::Context as _;

    let event_loop = EventLoop::new().context("failed to create event loop")?;

    // === WGPU setup ===

    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        dx12_shader_compiler: Default::default(),
        flags: wgpu::InstanceFlags::empty(),
        gles_minor_version: wgpu::Gles3MinorVersion::Automatic,
    });

    let adapter = anyhow::Context::context(
        instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await,
        "no suitable GPU adapter",
    )?;

    // Count-bounded indirect draws are the point of the pipeline; a device
    // without them is a fatal setup error, consistent with the rest of the
    // subsystem's no-graceful-degradation policy.
    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("hzb_device"),
                required_features: wgpu::Features::MULTI_DRAW_INDIRECT
                    | wgpu::Features::MULTI_DRAW_INDIRECT_COUNT,
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
            },
            None,
        )
        .await
        .context("failed to request device with indirect-count support")?;

    let camera = Camera::new(
        Vec3::new(0.0, 10.0, 120.0),
        std::f32::consts::PI,
        -0.05,
        60f32.to_radians(),
        16.0 / 9.0,
        0.1,
        2000.0,
    );

    let mut app = CullerApp {
        instance,
        adapter,
        device: Arc::new(device),
        queue: Arc::new(queue),
        window: None,
        surface: None,
        config: None,
        culler: None,
        camera,
        controller: CameraController::new(40.0, 0.002),
        frozen_cull_vp: None,
        last_frame: Instant::now(),
    };

    event_loop.run_app(&mut app).context("event loop failed")?;
    Ok(())
}
