// SPDX-License-Identifier: CEPL-1.0
//! Camera and transform math shared by the renderer and the scene.
use bytemuck::{Pod, Zeroable};
pub use glam::{Mat3, Mat4, Quat, Vec2, Vec3, Vec4};

/// Camera basis as uploaded to the sky pass uniform buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CameraVectors {
    pub forward: Vec4,
    pub right: Vec4,
    pub up: Vec4,
}

/// Camera matrices as uploaded to the standard pass uniform buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CameraMatrices {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Projection {
    pub fov_y_radians: f32,
    pub near: f32,
    pub far: f32,
}

impl CameraVectors {
    /// Stores the frustum half-extents at unit distance in `right.w` and `up.w`.
    pub fn with_frustum(mut self, aspect: f32, projection: &Projection) -> Self {
        let half_height = (projection.fov_y_radians * 0.5).tan();
        self.right.w = half_height * aspect;
        self.up.w = half_height;
        self
    }
}

impl Default for Projection {
    fn default() -> Self {
        Self {
            fov_y_radians: 45f32.to_radians(),
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Projection {
    /// Right-handed perspective with a [0, 1] depth range and clip-space Y pointing down.
    pub fn matrix(&self, aspect: f32) -> Mat4 {
        let mut m = Mat4::perspective_rh(self.fov_y_radians, aspect.max(f32::EPSILON), self.near, self.far);
        m.y_axis.y *= -1.0;
        m
    }
}

/// Where a camera sits and what it looks at, with an orthonormal basis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraView {
    pub eye: Vec3,
    pub center: Vec3,
    pub forward: Vec3,
    pub right: Vec3,
    pub up: Vec3,
}

impl CameraView {
    pub fn look_at(eye: Vec3, center: Vec3, world_up: Vec3) -> Self {
        let forward = (center - eye).try_normalize().unwrap_or(Vec3::NEG_Z);
        let right = forward
            .cross(world_up)
            .try_normalize()
            .unwrap_or(Vec3::X);
        let up = right.cross(forward);
        Self {
            eye,
            center,
            forward,
            right,
            up,
        }
    }

    pub fn vectors(&self) -> CameraVectors {
        CameraVectors {
            forward: self.forward.extend(0.0),
            right: self.right.extend(0.0),
            up: self.up.extend(0.0),
        }
    }

    pub fn matrices(&self, aspect: f32, projection: &Projection) -> CameraMatrices {
        let view = Mat4::look_at_rh(self.eye, self.center, self.up);
        let projection = projection.matrix(aspect);
        CameraMatrices {
            view,
            projection,
            view_projection: projection * view,
        }
    }
}

impl Default for CameraView {
    fn default() -> Self {
        Self::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y)
    }
}

/// Advances `orientation` by `angular_velocity` (radians per second) over `dt` seconds.
pub fn integrate_rotation(orientation: Quat, angular_velocity: Vec3, dt: f32) -> Quat {
    (Quat::from_scaled_axis(angular_velocity * dt) * orientation).normalize()
}

/// World transform of a rigid body: translation applied after rotation.
pub fn rigid_transform(position: Vec3, orientation: Quat) -> Mat4 {
    Mat4::from_rotation_translation(orientation, position)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-5
    }

    #[test]
    fn look_at_builds_orthonormal_basis() {
        let v = CameraView::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        assert!(close(v.forward, Vec3::NEG_Z));
        assert!(close(v.right, Vec3::X));
        assert!(close(v.up, Vec3::Y));
        assert!(v.forward.dot(v.right).abs() < 1e-6);
    }

    #[test]
    fn look_at_straight_up_does_not_produce_nan() {
        let v = CameraView::look_at(Vec3::ZERO, Vec3::Y, Vec3::Y);
        assert!(v.right.is_finite() && v.up.is_finite());
    }

    #[test]
    fn projection_flips_clip_space_y() {
        let p = Projection::default().matrix(16.0 / 9.0);
        let flat = Mat4::perspective_rh(45f32.to_radians(), 16.0 / 9.0, 0.1, 1000.0);
        assert_eq!(p.y_axis.y, -flat.y_axis.y);
        assert_eq!(p.x_axis.x, flat.x_axis.x);
    }

    #[test]
    fn view_projection_is_projection_times_view() {
        let v = CameraView::default();
        let m = v.matrices(1.5, &Projection::default());
        assert_eq!(m.view_projection, m.projection * m.view);
    }

    #[test]
    fn camera_vectors_have_zero_w() {
        let c = CameraView::default().vectors();
        assert_eq!(c.forward.w, 0.0);
        assert_eq!(c.right.w, 0.0);
        assert_eq!(c.up.w, 0.0);
    }

    #[test]
    fn frustum_extents_ride_in_w() {
        let c = CameraView::default()
            .vectors()
            .with_frustum(2.0, &Projection::default());
        let half = (22.5f32).to_radians().tan();
        assert!((c.up.w - half).abs() < 1e-6);
        assert!((c.right.w - 2.0 * half).abs() < 1e-6);
        assert_eq!(c.forward.w, 0.0);
    }

    #[test]
    fn quarter_turn_about_y() {
        let q = integrate_rotation(
            Quat::IDENTITY,
            Vec3::new(0.0, std::f32::consts::FRAC_PI_2, 0.0),
            1.0,
        );
        assert!(close(q * Vec3::X, Vec3::NEG_Z));
    }

    #[test]
    fn rigid_transform_moves_origin_to_position() {
        let m = rigid_transform(Vec3::new(1.0, 2.0, 3.0), Quat::from_rotation_z(1.0));
        assert!(close(m.transform_point3(Vec3::ZERO), Vec3::new(1.0, 2.0, 3.0)));
    }
}
