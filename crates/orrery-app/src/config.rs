// SPDX-License-Identifier: CEPL-1.0
use orrery_render::{RenderSettings, VsyncMode};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Deserialize, Clone)]
pub struct RenderCfg {
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
    #[serde(default = "default_true")]
    pub vsync: bool,
    #[serde(default)]
    pub vsync_mode: VsyncMode,
    #[serde(default = "default_max_objects")]
    pub max_objects: usize,
    #[serde(default)]
    pub shader_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub pipeline_cache: bool,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            vsync: true,
            vsync_mode: VsyncMode::Mailbox,
            max_objects: default_max_objects(),
            shader_dir: None,
            pipeline_cache: true,
        }
    }
}

impl RenderCfg {
    pub fn settings(&self) -> RenderSettings {
        RenderSettings {
            clear_color: self.clear_color,
            vsync: self.vsync,
            vsync_mode: self.vsync_mode,
            max_objects: self.max_objects,
            shader_dir: self.shader_dir.clone(),
            pipeline_cache: self.pipeline_cache,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WindowCfg {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_title")]
    pub title: String,
}

impl Default for WindowCfg {
    fn default() -> Self {
        WindowCfg {
            width: default_width(),
            height: default_height(),
            title: default_title(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct AppCfg {
    #[serde(default)]
    pub render: RenderCfg,
    #[serde(default)]
    pub window: WindowCfg,
    #[serde(default)]
    pub scene: Option<PathBuf>,
}

fn default_clear() -> [f32; 4] {
    RenderSettings::default().clear_color
}
fn default_true() -> bool {
    true
}
fn default_max_objects() -> usize {
    RenderSettings::default().max_objects
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_title() -> String {
    "orrery".to_owned()
}

/// Missing file or bad TOML both fall back to defaults; only the latter is worth a warning.
pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => toml::from_str::<AppCfg>(&s).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "config parse failed; using defaults");
            AppCfg::default()
        }),
        Err(_) => {
            info!(path = %path.display(), "no config file; using defaults");
            AppCfg::default()
        }
    }
}
