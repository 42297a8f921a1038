// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use thiserror::Error;

pub use orrery_math::{CameraView, Mat3, Mat4};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_zero_area(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VsyncMode {
    Fifo,
    #[default]
    Mailbox,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub clear_color: [f32; 4],
    pub vsync: bool,
    pub vsync_mode: VsyncMode,
    /// Capacity of each frame's per-object transform buffer.
    pub max_objects: usize,
    /// Directory of `<name>.spv` overrides for the built-in shaders.
    pub shader_dir: Option<PathBuf>,
    pub pipeline_cache: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            vsync: true,
            vsync_mode: VsyncMode::Mailbox,
            max_objects: 4096,
            shader_dir: None,
            pipeline_cache: true,
        }
    }
}

/// One renderable object type: its mesh, its texture and the matrix baked into its vertices.
#[derive(Clone, Debug, PartialEq)]
pub struct AssetDesc {
    pub object_type: String,
    pub model: PathBuf,
    pub texture: PathBuf,
    pub pre_transform: Mat3,
}

/// Cube faces in +X, -X, +Y, -Y, +Z, -Z order, or a single face reused six times.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SkyboxDesc {
    pub faces: Vec<PathBuf>,
    pub repeat: bool,
}

impl SkyboxDesc {
    pub fn repeated(face: impl Into<PathBuf>) -> Self {
        Self {
            faces: vec![face.into()],
            repeat: true,
        }
    }

    /// Files to load: one when repeating, otherwise all six.
    pub fn files(&self) -> &[PathBuf] {
        if self.repeat {
            &self.faces[..self.faces.len().min(1)]
        } else {
            &self.faces
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AssetPack {
    pub assets: Vec<AssetDesc>,
    pub skybox: SkyboxDesc,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackError {
    #[error("object type `{0}` is declared more than once")]
    DuplicateObjectType(String),
    #[error("skybox needs 6 faces, got {0}")]
    SkyboxFaceCount(usize),
    #[error("repeated skybox needs a face texture")]
    MissingRepeatedFace,
}

impl AssetPack {
    pub fn validate(&self) -> Result<(), PackError> {
        let mut seen = HashSet::new();
        for a in &self.assets {
            if !seen.insert(a.object_type.as_str()) {
                return Err(PackError::DuplicateObjectType(a.object_type.clone()));
            }
        }
        match (self.skybox.repeat, self.skybox.faces.len()) {
            (true, 0) => Err(PackError::MissingRepeatedFace),
            (true, _) | (false, 6) => Ok(()),
            (false, n) => Err(PackError::SkyboxFaceCount(n)),
        }
    }
}

/// What a renderer reads from the scene each frame.
pub trait RenderScene {
    fn camera(&self) -> CameraView;
    /// World transforms grouped by object type, each list in a stable order.
    fn mapped_objects(&self) -> BTreeMap<String, Vec<Mat4>>;
    fn asset_pack(&self) -> &AssetPack;
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: &RenderSettings,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Loads meshes, textures and the skybox. Must complete before `render`.
    fn load_assets(&mut self, pack: &AssetPack) -> Result<()>;
    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self, scene: &dyn RenderScene) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn set_vsync(&mut self, _on: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(name: &str) -> AssetDesc {
        AssetDesc {
            object_type: name.into(),
            model: format!("{name}.obj").into(),
            texture: format!("{name}.png").into(),
            pre_transform: Mat3::IDENTITY,
        }
    }

    fn six_faces() -> SkyboxDesc {
        SkyboxDesc {
            faces: ["px", "nx", "py", "ny", "pz", "nz"]
                .iter()
                .map(|f| PathBuf::from(format!("{f}.png")))
                .collect(),
            repeat: false,
        }
    }

    #[test]
    fn valid_pack_passes() {
        let pack = AssetPack {
            assets: vec![asset("rock"), asset("tree")],
            skybox: six_faces(),
        };
        assert_eq!(pack.validate(), Ok(()));
    }

    #[test]
    fn duplicate_object_type_is_rejected() {
        let pack = AssetPack {
            assets: vec![asset("rock"), asset("rock")],
            skybox: SkyboxDesc::repeated("sky.png"),
        };
        assert_eq!(
            pack.validate(),
            Err(PackError::DuplicateObjectType("rock".into()))
        );
    }

    #[test]
    fn skybox_face_count_is_checked() {
        let mut sky = six_faces();
        sky.faces.pop();
        let pack = AssetPack {
            assets: vec![],
            skybox: sky,
        };
        assert_eq!(pack.validate(), Err(PackError::SkyboxFaceCount(5)));

        let pack = AssetPack {
            assets: vec![],
            skybox: SkyboxDesc {
                faces: vec![],
                repeat: true,
            },
        };
        assert_eq!(pack.validate(), Err(PackError::MissingRepeatedFace));
    }

    #[test]
    fn repeated_skybox_loads_one_file() {
        let mut sky = six_faces();
        sky.repeat = true;
        assert_eq!(sky.files(), &[PathBuf::from("px.png")]);
        assert_eq!(six_faces().files().len(), 6);
    }

    #[test]
    fn zero_area_sizes() {
        assert!(RenderSize { width: 0, height: 10 }.is_zero_area());
        assert!(!RenderSize { width: 10, height: 10 }.is_zero_area());
    }
}
