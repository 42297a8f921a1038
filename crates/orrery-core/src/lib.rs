// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::time::{Duration, Instant};

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();
}

/// Frame delta and once-per-second frame rate sampling for the main loop.
#[derive(Debug, Clone)]
pub struct FrameClock {
    last_tick: Instant,
    window_start: Instant,
    frames: u32,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            last_tick: now,
            window_start: now,
            frames: 0,
        }
    }

    /// Seconds since the previous tick.
    pub fn tick(&mut self) -> f32 {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> f32 {
        let dt = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        dt.as_secs_f32()
    }

    pub fn frame_rendered(&mut self) {
        self.frames = self.frames.saturating_add(1);
    }

    /// Drops any partially counted window, e.g. after a pause.
    pub fn reset_window(&mut self, now: Instant) {
        self.window_start = now;
        self.last_tick = now;
        self.frames = 0;
    }

    /// Frames per second over the last full second, once one has elapsed.
    pub fn poll_fps(&mut self) -> Option<f32> {
        self.poll_fps_at(Instant::now())
    }

    pub fn poll_fps_at(&mut self, now: Instant) -> Option<f32> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        let fps = self.frames as f32 / elapsed.as_secs_f32();
        self.frames = 0;
        self.window_start = now;
        Some(fps)
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}
