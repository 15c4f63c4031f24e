use glam::{Mat4, Vec3};

/// Movement keys held during a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MovementKeys {
    pub forward: bool,
    pub back: bool,
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,
}

impl MovementKeys {
    /// Parse a WASD/QE key string such as `"wd"`.
    pub fn from_chars(keys: &str) -> Self {
        let mut held = Self::default();
        for c in keys.chars() {
            match c.to_ascii_lowercase() {
                'w' => held.forward = true,
                's' => held.back = true,
                'a' => held.left = true,
                'd' => held.right = true,
                'e' => held.up = true,
                'q' => held.down = true,
                _ => {}
            }
        }
        held
    }
}

/// Look-at camera that flies along its own basis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlyCamera {
    pub eye: Vec3,
    pub center: Vec3,
    pub up: Vec3,
    /// Units per second.
    pub speed: f32,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for FlyCamera {
    fn default() -> Self {
        Self::new(Vec3::splat(1.5), Vec3::ZERO, Vec3::Y)
    }
}

impl FlyCamera {
    pub fn new(eye: Vec3, center: Vec3, up: Vec3) -> Self {
        Self {
            eye,
            center,
            up,
            speed: 1.0,
            fov_y: 45.0_f32.to_radians(),
            near: 0.1,
            far: 1000.0,
        }
    }

    /// Get the view matrix (world → camera space)
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye, self.center, self.up)
    }

    /// Get the projection matrix (camera → clip space)
    pub fn projection_matrix(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, aspect, self.near, self.far)
    }

    pub fn forward(&self) -> Vec3 {
        (self.center - self.eye).normalize_or_zero()
    }

    pub fn right(&self) -> Vec3 {
        self.forward().cross(self.up).normalize_or_zero()
    }

    /// Camera-space up, orthogonal to forward and right.
    pub fn true_up(&self) -> Vec3 {
        self.right().cross(self.forward())
    }

    /// Move eye and center together by the held keys over `dt` seconds.
    pub fn advance(&mut self, keys: &MovementKeys, dt: f32) {
        let step = self.speed * dt;
        let mut offset = Vec3::ZERO;
        if keys.forward {
            offset += self.forward();
        }
        if keys.back {
            offset -= self.forward();
        }
        if keys.right {
            offset += self.right();
        }
        if keys.left {
            offset -= self.right();
        }
        if keys.up {
            offset += self.up;
        }
        if keys.down {
            offset -= self.up;
        }
        self.eye += offset * step;
        self.center += offset * step;
    }
}
