// src/camera.rs
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Perspective camera with position and Euler rotation (yaw, pitch).
pub struct Camera {
    pub position: Vec3,
    /// yaw: rotation around Y axis (radians). pitch: rotation around X axis (radians).
    pub yaw: f32,
    pub pitch: f32,

    pub fovy: f32,
    pub aspect: f32,
    pub znear: f32,
    pub zfar: f32,
}

impl Camera {
    /// Create a new perspective camera.
    pub fn new(
        position: Vec3,
        yaw: f32,
        pitch: f32,
        fovy_radians: f32,
        aspect: f32,
        znear: f32,
        zfar: f32,
    ) -> Self {
        Self {
            position,
            yaw,
            pitch,
            fovy: fovy_radians,
            aspect,
            znear,
            zfar,
        }
    }

    fn forward(&self) -> Vec3 {
        let (sin_yaw, cos_yaw) = self.yaw.sin_cos();
        let (sin_pitch, cos_pitch) = self.pitch.sin_cos();
        Vec3::new(cos_pitch * sin_yaw, sin_pitch, cos_pitch * cos_yaw).normalize_or_zero()
    }

    /// Build view matrix from position + yaw/pitch (right-handed, Y up).
    pub fn view_matrix(&self) -> Mat4 {
        let target = self.position + self.forward();
        Mat4::look_at_rh(self.position, target, Vec3::Y)
    }

    /// Build projection matrix (perspective, depth 0..1).
    pub fn proj_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fovy, self.aspect, self.znear, self.zfar)
    }

    /// Combined view-projection matrix.
    pub fn view_proj_matrix(&self) -> Mat4 {
        self.proj_matrix() * self.view_matrix()
    }

    /// Update aspect ratio (call on resize).
    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }
}

/// GPU camera uniform (matches shader layout).
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct CameraUniform {
    /// Column-major 4x4 matrix
    pub view_proj: [[f32; 4]; 4],
}

impl CameraUniform {
    pub fn from_matrix(m: Mat4) -> Self {
        Self {
            view_proj: m.to_cols_array_2d(),
        }
    }
}

/// Small camera controller. Input-agnostic: call `process_keyboard` and
/// `process_mouse` from your input layer.
pub struct CameraController {
    pub speed: f32,
    pub sensitivity: f32,

    // movement state
    pub forward: f32,
    pub right: f32,
    pub up: f32,

    // mouse deltas
    pub yaw_delta: f32,
    pub pitch_delta: f32,
}

impl CameraController {
    pub fn new(speed: f32, sensitivity: f32) -> Self {
        Self {
            speed,
            sensitivity,
            forward: 0.0,
            right: 0.0,
            up: 0.0,
            yaw_delta: 0.0,
            pitch_delta: 0.0,
        }
    }

    /// Call when keyboard input changes. `fwd`, `right`, `up` are -1.0..1.0 values.
    pub fn process_keyboard(&mut self, fwd: f32, right: f32, up: f32) {
        self.forward = fwd;
        self.right = right;
        self.up = up;
    }

    /// Call when mouse moves. `dx`, `dy` are pixel deltas.
    pub fn process_mouse(&mut self, dx: f32, dy: f32) {
        self.yaw_delta += dx * self.sensitivity;
        self.pitch_delta += dy * self.sensitivity;
    }

    /// Apply controller to camera. `dt` is seconds since last update.
    pub fn update_camera(&mut self, camera: &mut Camera, dt: f32) {
        camera.yaw += self.yaw_delta;
        camera.pitch += self.pitch_delta;

        // clamp pitch to avoid gimbal flip
        let max_pitch = std::f32::consts::FRAC_PI_2 - 0.01;
        camera.pitch = camera.pitch.clamp(-max_pitch, max_pitch);

        self.yaw_delta = 0.0;
        self.pitch_delta = 0.0;

        let (sin_yaw, cos_yaw) = camera.yaw.sin_cos();
        let (sin_pitch, cos_pitch) = camera.pitch.sin_cos();

        let forward =
            Vec3::new(cos_pitch * sin_yaw, sin_pitch, cos_pitch * cos_yaw).normalize_or_zero();
        let right_vec = forward.cross(Vec3::Y).normalize_or_zero();

        let mut displacement = Vec3::ZERO;
        displacement += forward * (self.forward * self.speed * dt);
        displacement += right_vec * (self.right * self.speed * dt);
        displacement += Vec3::Y * (self.up * self.speed * dt);

        camera.position += displacement;
    }
}
