// SPDX-License-Identifier: CEPL-1.0
//! Rigid bodies. Dynamic bodies integrate with semi-implicit Euler; there is no collision response.
use orrery_math::{integrate_rotation, rigid_transform, Mat3, Mat4, Quat, Vec3};

#[derive(Clone, Debug, PartialEq)]
pub struct StaticBody {
    pub uid: String,
    pub position: Vec3,
    pub orientation: Quat,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DynamicBody {
    pub uid: String,
    pub position: Vec3,
    pub orientation: Quat,
    pub velocity: Vec3,
    pub angular_velocity: Vec3,
    pub force: Vec3,
    pub torque: Vec3,
    pub inv_mass: f32,
    /// Body-space inverse inertia tensor.
    pub inv_inertia: Mat3,
}

impl DynamicBody {
    /// Unit solid sphere inertia scaled by `inv_mass`.
    pub fn new(uid: impl Into<String>, position: Vec3, orientation: Quat, inv_mass: f32) -> Self {
        Self {
            uid: uid.into(),
            position,
            orientation,
            velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            force: Vec3::ZERO,
            torque: Vec3::ZERO,
            inv_mass,
            inv_inertia: Mat3::IDENTITY * (inv_mass * 2.5),
        }
    }

    pub fn with_velocity(mut self, velocity: Vec3, angular_velocity: Vec3) -> Self {
        self.velocity = velocity;
        self.angular_velocity = angular_velocity;
        self
    }

    pub fn apply_force(&mut self, force: Vec3) {
        self.force += force;
    }

    /// Force applied at a world-space point; off-center points also add torque.
    pub fn apply_force_at_point(&mut self, force: Vec3, point: Vec3) {
        self.force += force;
        self.torque += (point - self.position).cross(force);
    }

    /// Inverse inertia rotated into world space.
    pub fn world_inv_inertia(&self) -> Mat3 {
        let r = Mat3::from_quat(self.orientation);
        r * self.inv_inertia * r.transpose()
    }

    pub fn momentum(&self) -> Vec3 {
        if self.inv_mass > 0.0 {
            self.velocity / self.inv_mass
        } else {
            Vec3::ZERO
        }
    }

    /// Velocities first, then positions from the new velocities. Clears accumulated force and torque.
    pub fn integrate(&mut self, dt: f32) {
        self.velocity += self.force * self.inv_mass * dt;
        self.angular_velocity += self.world_inv_inertia() * self.torque * dt;
        self.position += self.velocity * dt;
        self.orientation = integrate_rotation(self.orientation, self.angular_velocity, dt);
        self.force = Vec3::ZERO;
        self.torque = Vec3::ZERO;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Static(StaticBody),
    Dynamic(DynamicBody),
}

impl Body {
    pub fn uid(&self) -> &str {
        match self {
            Body::Static(b) => &b.uid,
            Body::Dynamic(b) => &b.uid,
        }
    }

    pub fn position(&self) -> Vec3 {
        match self {
            Body::Static(b) => b.position,
            Body::Dynamic(b) => b.position,
        }
    }

    pub fn orientation(&self) -> Quat {
        match self {
            Body::Static(b) => b.orientation,
            Body::Dynamic(b) => b.orientation,
        }
    }

    pub fn transform(&self) -> Mat4 {
        rigid_transform(self.position(), self.orientation())
    }

    pub fn integrate(&mut self, dt: f32) {
        if let Body::Dynamic(b) = self {
            b.integrate(dt);
        }
    }

    pub fn as_dynamic_mut(&mut self) -> Option<&mut DynamicBody> {
        match self {
            Body::Dynamic(b) => Some(b),
            Body::Static(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-5
    }

    #[test]
    fn constant_velocity_moves_linearly() {
        let mut b = DynamicBody::new("lander", Vec3::ZERO, Quat::IDENTITY, 1.0)
            .with_velocity(Vec3::new(2.0, 0.0, 0.0), Vec3::ZERO);
        for _ in 0..10 {
            b.integrate(0.1);
        }
        assert!(close(b.position, Vec3::new(2.0, 0.0, 0.0)));
    }

    #[test]
    fn force_is_consumed_by_one_step() {
        let mut b = DynamicBody::new("lander", Vec3::ZERO, Quat::IDENTITY, 0.5);
        b.apply_force(Vec3::new(0.0, 4.0, 0.0));
        b.integrate(1.0);
        // semi-implicit: position uses the updated velocity
        assert!(close(b.velocity, Vec3::new(0.0, 2.0, 0.0)));
        assert!(close(b.position, Vec3::new(0.0, 2.0, 0.0)));
        assert_eq!(b.force, Vec3::ZERO);
        b.integrate(1.0);
        assert!(close(b.velocity, Vec3::new(0.0, 2.0, 0.0)));
    }

    #[test]
    fn off_center_force_spins_the_body() {
        let mut b = DynamicBody::new("lander", Vec3::ZERO, Quat::IDENTITY, 1.0);
        b.apply_force_at_point(Vec3::new(0.0, 1.0, 0.0), Vec3::new(1.0, 0.0, 0.0));
        assert!(close(b.torque, Vec3::new(0.0, 0.0, 1.0)));
        b.integrate(0.1);
        assert!(b.angular_velocity.z > 0.0);
        assert!(b.orientation.angle_between(Quat::IDENTITY) > 0.0);
    }

    #[test]
    fn centered_force_adds_no_torque() {
        let mut b = DynamicBody::new("lander", Vec3::new(1.0, 2.0, 3.0), Quat::IDENTITY, 1.0);
        b.apply_force_at_point(Vec3::X, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(b.torque, Vec3::ZERO);
    }

    #[test]
    fn infinite_mass_ignores_force() {
        let mut b = DynamicBody::new("anchor", Vec3::ZERO, Quat::IDENTITY, 0.0);
        b.apply_force(Vec3::splat(100.0));
        b.integrate(1.0);
        assert_eq!(b.position, Vec3::ZERO);
        assert_eq!(b.momentum(), Vec3::ZERO);
    }

    #[test]
    fn static_bodies_do_not_move() {
        let mut body = Body::Static(StaticBody {
            uid: "rock".into(),
            position: Vec3::new(0.0, 1.0, 0.0),
            orientation: Quat::IDENTITY,
        });
        body.integrate(1.0);
        assert_eq!(body.position(), Vec3::new(0.0, 1.0, 0.0));
        assert!(body.as_dynamic_mut().is_none());
        assert_eq!(
            body.transform().transform_point3(Vec3::ZERO),
            Vec3::new(0.0, 1.0, 0.0)
        );
    }
}
