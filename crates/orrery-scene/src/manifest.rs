// SPDX-License-Identifier: CEPL-1.0
//! On-disk scene description. Relative asset paths resolve against the manifest's directory.
use orrery_math::{Mat3, Quat};
use orrery_render::{AssetDesc, AssetPack, PackError, SkyboxDesc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("cannot read scene {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse scene {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Pack(#[from] PackError),
    #[error("body `{uid}` uses undeclared object type `{object_type}`")]
    UnknownObjectType { uid: String, object_type: String },
    #[error("body uid `{0}` is used more than once")]
    DuplicateUid(String),
    #[error("follow camera targets unknown body `{0}`")]
    UnknownFollowTarget(String),
}

fn identity3() -> [[f32; 3]; 3] {
    Mat3::IDENTITY.to_cols_array_2d()
}

fn identity_quat() -> [f32; 4] {
    Quat::IDENTITY.to_array()
}

fn unit() -> f32 {
    1.0
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AssetEntry {
    pub object_type: String,
    pub model: PathBuf,
    pub texture: PathBuf,
    /// Column-major 3x3 baked into the model's vertices.
    #[serde(default = "identity3")]
    pub pre_transform: [[f32; 3]; 3],
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SkyboxEntry {
    pub faces: Vec<PathBuf>,
    #[serde(default)]
    pub repeat: bool,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BodyKind {
    #[default]
    Static,
    Dynamic,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BodyEntry {
    pub uid: String,
    pub object_type: String,
    #[serde(default)]
    pub kind: BodyKind,
    #[serde(default)]
    pub position: [f32; 3],
    /// Quaternion as `[x, y, z, w]`.
    #[serde(default = "identity_quat")]
    pub orientation: [f32; 4],
    #[serde(default)]
    pub velocity: [f32; 3],
    #[serde(default)]
    pub angular_velocity: [f32; 3],
    #[serde(default = "unit")]
    pub inv_mass: f32,
}

impl BodyEntry {
    pub fn orientation(&self) -> Quat {
        Quat::from_array(self.orientation).normalize()
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CameraEntry {
    Free {
        eye: [f32; 3],
        #[serde(default)]
        yaw: f32,
        #[serde(default)]
        pitch: f32,
    },
    Follow {
        target: String,
        offset: [f32; 3],
    },
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SceneManifest {
    #[serde(default)]
    pub assets: Vec<AssetEntry>,
    #[serde(default)]
    pub skybox: SkyboxEntry,
    #[serde(default)]
    pub bodies: Vec<BodyEntry>,
    #[serde(default)]
    pub cameras: Vec<CameraEntry>,
}

impl SceneManifest {
    pub fn parse(text: &str, origin: &Path) -> Result<Self, SceneError> {
        toml::from_str(text).map_err(|source| SceneError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub fn read(path: &Path) -> Result<Self, SceneError> {
        let text = std::fs::read_to_string(path).map_err(|source| SceneError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// The asset pack with every path joined onto `base_dir`; absolute paths stay as they are.
    pub fn asset_pack(&self, base_dir: &Path) -> AssetPack {
        let resolve = |p: &PathBuf| base_dir.join(p);
        AssetPack {
            assets: self
                .assets
                .iter()
                .map(|a| AssetDesc {
                    object_type: a.object_type.clone(),
                    model: resolve(&a.model),
                    texture: resolve(&a.texture),
                    pre_transform: Mat3::from_cols_array_2d(&a.pre_transform),
                })
                .collect(),
            skybox: SkyboxDesc {
                faces: self.skybox.faces.iter().map(resolve).collect(),
                repeat: self.skybox.repeat,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orrery_math::Vec3;

    const MANIFEST: &str = r#"
[[assets]]
object_type = "rock"
model = "models/rock.obj"
texture = "textures/rock.png"
pre_transform = [[2.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 2.0]]

[skybox]
faces = ["sky.png"]
repeat = true

[[bodies]]
uid = "rock-1"
object_type = "rock"
position = [1.0, 0.0, 0.0]

[[bodies]]
uid = "lander"
object_type = "rock"
kind = "dynamic"
velocity = [0.0, 1.0, 0.0]
inv_mass = 0.5

[[cameras]]
kind = "follow"
target = "lander"
offset = [0.0, 2.0, 6.0]
"#;

    #[test]
    fn parses_with_defaults() {
        let m = SceneManifest::parse(MANIFEST, Path::new("scene.toml")).expect("parse");
        assert_eq!(m.assets.len(), 1);
        assert_eq!(m.bodies[0].kind, BodyKind::Static);
        assert_eq!(m.bodies[0].orientation(), Quat::IDENTITY);
        assert_eq!(m.bodies[0].inv_mass, 1.0);
        assert_eq!(m.bodies[1].kind, BodyKind::Dynamic);
        assert_eq!(
            m.cameras[0],
            CameraEntry::Follow {
                target: "lander".into(),
                offset: [0.0, 2.0, 6.0]
            }
        );
    }

    #[test]
    fn asset_paths_resolve_against_base_dir() {
        let m = SceneManifest::parse(MANIFEST, Path::new("scene.toml")).expect("parse");
        let pack = m.asset_pack(Path::new("/data/level"));
        assert_eq!(pack.assets[0].model, PathBuf::from("/data/level/models/rock.obj"));
        assert_eq!(pack.skybox.files(), &[PathBuf::from("/data/level/sky.png")]);
        assert_eq!(pack.assets[0].pre_transform, Mat3::from_diagonal(Vec3::splat(2.0)));
    }

    #[test]
    fn missing_pre_transform_is_identity() {
        let m = SceneManifest::parse(
            "[[assets]]\nobject_type = \"a\"\nmodel = \"a.obj\"\ntexture = \"a.png\"\n",
            Path::new("s.toml"),
        )
        .expect("parse");
        assert_eq!(m.asset_pack(Path::new("")).assets[0].pre_transform, Mat3::IDENTITY);
    }

    #[test]
    fn unknown_camera_kind_is_a_parse_error() {
        let err = SceneManifest::parse("[[cameras]]\nkind = \"orbit\"\n", Path::new("bad.toml"))
            .unwrap_err();
        assert!(matches!(err, SceneError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }
}
