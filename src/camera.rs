use glam::{Mat4, Vec3};

/// A perspective camera for 3D scenes.
///
/// Provides position, orientation, field of view and clip planes, and derives the view and
/// projection matrices the renderer pushes to shader programs. Projection uses GL depth
/// conventions (NDC z in `[-1, 1]`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub forward: Vec3,
    pub up: Vec3,
    pub fov: f32, // radians, vertical
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            forward: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_2, // 90 degrees
            aspect: 1.0,
            near: 0.1,
            far: 100.0,
        }
    }
}

impl Camera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, x: f32, y: f32, z: f32) -> Self {
        self.position = Vec3::new(x, y, z);
        self
    }

    pub fn looking_at(mut self, target_x: f32, target_y: f32, target_z: f32) -> Self {
        let forward = Vec3::new(target_x, target_y, target_z) - self.position;
        self.forward = forward.normalize_or(self.forward);
        self
    }

    pub fn with_fov(mut self, fov_degrees: f32) -> Self {
        self.fov = fov_degrees.to_radians();
        self
    }

    pub fn with_aspect(mut self, aspect: f32) -> Self {
        self.aspect = aspect;
        self
    }

    pub fn with_clip_planes(mut self, near: f32, far: f32) -> Self {
        self.near = near;
        self.far = far;
        self
    }

    /// Compute the right vector from forward and up.
    pub fn right(&self) -> Vec3 {
        self.forward.cross(self.up).normalize_or_zero()
    }

    /// Recompute up to be orthogonal to forward and right.
    pub fn orthogonal_up(&self) -> Vec3 {
        self.right().cross(self.forward).normalize_or_zero()
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.forward, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh_gl(self.fov, self.aspect, self.near, self.far)
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// World-space position recovered from the view matrix.
    pub fn extract_translation(&self) -> Vec3 {
        self.view_matrix().inverse().w_axis.truncate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_translation_recovers_position() {
        let camera = Camera::new().at(10.0, 10.0, 10.0).looking_at(0.0, 0.0, 0.0);
        let p = camera.extract_translation();
        assert!((p - Vec3::splat(10.0)).length() < 1e-4);
    }

    #[test]
    fn basis_is_orthonormal() {
        let camera = Camera::new().at(1.0, 2.0, 3.0).looking_at(0.0, 0.0, 0.0);
        let (f, r, u) = (camera.forward, camera.right(), camera.orthogonal_up());
        assert!(f.dot(r).abs() < 1e-5);
        assert!(f.dot(u).abs() < 1e-5);
        assert!((r.length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn points_on_the_clip_planes_map_to_the_depth_range() {
        let camera = Camera::new().at(0.0, 0.0, 0.0).with_clip_planes(1.0, 10.0);
        let vp = camera.view_projection_matrix();
        let near = vp.project_point3(Vec3::new(0.0, 0.0, -1.0));
        let far = vp.project_point3(Vec3::new(0.0, 0.0, -10.0));
        assert!((near.z + 1.0).abs() < 1e-5);
        assert!((far.z - 1.0).abs() < 1e-5);
    }
}
