// SPDX-License-Identifier: CEPL-1.0
use orrery_math::{CameraView, Vec3};
use std::f32::consts::FRAC_PI_2;

const PITCH_LIMIT: f32 = FRAC_PI_2 - 0.01;

/// Looks down -Z at zero yaw and pitch. Yaw turns left, pitch tilts up.
#[derive(Clone, Debug, PartialEq)]
pub struct FreeCamera {
    pub eye: Vec3,
    pub yaw: f32,
    pub pitch: f32,
}

impl FreeCamera {
    pub fn forward(&self) -> Vec3 {
        let pitch = self.pitch.clamp(-PITCH_LIMIT, PITCH_LIMIT);
        Vec3::new(
            -self.yaw.sin() * pitch.cos(),
            pitch.sin(),
            -self.yaw.cos() * pitch.cos(),
        )
    }

    pub fn turn(&mut self, yaw: f32, pitch: f32) {
        self.yaw += yaw;
        self.pitch = (self.pitch + pitch).clamp(-PITCH_LIMIT, PITCH_LIMIT);
    }

    pub fn view(&self) -> CameraView {
        CameraView::look_at(self.eye, self.eye + self.forward(), Vec3::Y)
    }
}

/// Trails a body at a fixed world-space offset, looking at it.
#[derive(Clone, Debug, PartialEq)]
pub struct FollowCamera {
    pub target: String,
    pub offset: Vec3,
}

impl FollowCamera {
    pub fn view(&self, target_position: Vec3) -> CameraView {
        CameraView::look_at(target_position + self.offset, target_position, Vec3::Y)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Camera {
    Free(FreeCamera),
    Follow(FollowCamera),
}

impl Camera {
    /// `locate` resolves a follow target's position; a missing target falls back to looking at the origin.
    pub fn view(&self, locate: impl Fn(&str) -> Option<Vec3>) -> CameraView {
        match self {
            Camera::Free(c) => c.view(),
            Camera::Follow(c) => c.view(locate(&c.target).unwrap_or(Vec3::ZERO)),
        }
    }
}

impl Default for Camera {
    fn default() -> Self {
        Camera::Free(FreeCamera {
            eye: Vec3::new(0.0, 0.0, 5.0),
            yaw: 0.0,
            pitch: 0.0,
        })
    }
}
