// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod config;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use orrery_core::{init_tracing, FrameClock};
use orrery_render::{RenderScene, RenderSize, Renderer};
use orrery_render_vk::VkRenderer;
use orrery_scene::{Camera, Scene};
use std::path::PathBuf;
use tracing::{error, info};

use orrery_platform::winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{Key, NamedKey},
    window::{Window, WindowId},
};

use config::{load_cfg, AppCfg};

const TURN_STEP: f32 = 0.05;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine config file
    #[arg(long, default_value = "orrery.toml")]
    config: PathBuf,
    /// Scene manifest; overrides the config's `scene`
    #[arg(long)]
    scene: Option<PathBuf>,
}

struct App {
    cfg: AppCfg,
    scene_path: PathBuf,
    window: Option<Window>,
    renderer: Option<VkRenderer>,
    scene: Option<Scene>,
    render_size: RenderSize,
    clock: FrameClock,

    exiting: bool,
    paused: bool,
    failure: Option<anyhow::Error>,
}

impl App {
    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let w = &self.cfg.window;
        let window = event_loop
            .create_window(orrery_platform::window_attributes(&w.title, w.width, w.height))
            .context("create_window")?;

        let size = window.inner_size();
        self.render_size = RenderSize {
            width: size.width,
            height: size.height,
        };

        let settings = self.cfg.render.settings();
        let mut renderer = VkRenderer::new(&window, &window, self.render_size, &settings)?;
        renderer.set_clear_color(settings.clear_color);
        renderer.set_vsync(settings.vsync);

        let scene = Scene::load(&self.scene_path)?;
        renderer
            .load_assets(scene.asset_pack())
            .with_context(|| format!("loading assets for {}", self.scene_path.display()))?;
        info!(
            entities = scene.entities().len(),
            vsync = settings.vsync,
            "scene ready"
        );

        self.window = Some(window);
        self.renderer = Some(renderer);
        self.scene = Some(scene);
        self.clock = FrameClock::new();
        Ok(())
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        // renderer holds the surface; it must go before the window
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }

    fn handle_key(&mut self, event_loop: &ActiveEventLoop, event: KeyEvent) {
        if event.state != ElementState::Pressed {
            return;
        }
        if let Key::Named(NamedKey::Escape) = event.logical_key {
            self.shutdown(event_loop);
            return;
        }
        let Some(scene) = &mut self.scene else {
            return;
        };
        match event.logical_key.as_ref() {
            Key::Character(c) if c.eq_ignore_ascii_case("c") => {
                let idx = scene.cycle_camera();
                info!(camera = idx, "switched camera");
            }
            Key::Named(named) => {
                let (yaw, pitch) = match named {
                    NamedKey::ArrowLeft => (TURN_STEP, 0.0),
                    NamedKey::ArrowRight => (-TURN_STEP, 0.0),
                    NamedKey::ArrowUp => (0.0, TURN_STEP),
                    NamedKey::ArrowDown => (0.0, -TURN_STEP),
                    _ => return,
                };
                if let Camera::Free(cam) = scene.active_camera_mut() {
                    cam.turn(yaw, pitch);
                }
            }
            _ => {}
        }
    }

    fn redraw(&mut self) -> Result<()> {
        let dt = self.clock.tick();
        let (Some(renderer), Some(scene)) = (&mut self.renderer, &mut self.scene) else {
            return Ok(());
        };
        scene.update(dt);
        renderer.render(&*scene)?;
        self.clock.frame_rendered();
        Ok(())
    }

    /// Records `e` as the exit error and tears the app down.
    fn fail(&mut self, event_loop: &ActiveEventLoop, what: &str, e: anyhow::Error) {
        error!("{what}: {e:#}");
        self.failure = Some(e.context(what.to_owned()));
        self.shutdown(event_loop);
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.start(event_loop) {
                self.fail(event_loop, "startup failed", e);
                return;
            }
        }

        event_loop.set_control_flow(if self.cfg.render.vsync {
            ControlFlow::Wait
        } else {
            ControlFlow::Poll
        });

        self.paused = self.render_size.is_zero_area();
        info!("resumed → paused={}", self.paused);

        if !self.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = RenderSize {
                    width: new_size.width,
                    height: new_size.height,
                };
                let now_paused = orrery_platform::is_zero_area(new_size);
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!(
                        "Resized → {}x{} (paused={})",
                        new_size.width, new_size.height, self.paused
                    );
                }

                // a zero size still goes through so the renderer parks its swapchain
                if let Some(renderer) = &mut self.renderer {
                    if let Err(e) = renderer.resize(self.render_size) {
                        self.fail(event_loop, "resize failed", e);
                        return;
                    }
                }
                if !self.paused {
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::Occluded(occluded) => {
                let now_paused = occluded || self.render_size.is_zero_area();
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!("Occluded={} → paused={}", occluded, self.paused);
                }
            }

            WindowEvent::KeyboardInput { event, .. } => self.handle_key(event_loop, event),

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }
                if let Err(e) = self.redraw() {
                    self.fail(event_loop, "render failed", e);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }

        if self.paused {
            // minimized or occluded: sleep until the next window event
            event_loop.set_control_flow(ControlFlow::Wait);
            self.clock.reset_window(std::time::Instant::now());
            return;
        }

        event_loop.set_control_flow(if self.cfg.render.vsync {
            ControlFlow::Wait
        } else {
            ControlFlow::Poll
        });
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        if let Some(fps) = self.clock.poll_fps() {
            info!("fps ~ {fps:.0}");
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = load_cfg(&args.config);
    let scene_path = args
        .scene
        .or_else(|| cfg.scene.clone())
        .ok_or_else(|| {
            anyhow!(
                "no scene manifest: pass --scene or set `scene` in {}",
                args.config.display()
            )
        })?;

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App {
        cfg,
        scene_path,
        window: None,
        renderer: None,
        scene: None,
        render_size: RenderSize {
            width: 1,
            height: 1,
        },
        clock: FrameClock::new(),
        exiting: false,
        paused: false,
        failure: None,
    };

    event_loop.run_app(&mut app)?;
    match app.failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
