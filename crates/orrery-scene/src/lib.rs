// SPDX-License-Identifier: CEPL-1.0
//! Scene model: bodies grouped by object type, a set of cameras and the asset pack they render with.
pub mod body;
pub mod camera;
pub mod manifest;

pub use body::{Body, DynamicBody, StaticBody};
pub use camera::{Camera, FollowCamera, FreeCamera};
pub use manifest::{SceneError, SceneManifest};

use manifest::{BodyKind, CameraEntry};
use orrery_math::{CameraView, Mat4, Vec3};
use orrery_render::{AssetPack, RenderScene};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

/// A body and the object type it is drawn as.
#[derive(Clone, Debug, PartialEq)]
pub struct Entity {
    pub object_type: String,
    pub body: Body,
}

#[derive(Clone, Debug)]
pub struct Scene {
    pack: AssetPack,
    entities: Vec<Entity>,
    cameras: Vec<Camera>,
    active_camera: usize,
}

impl Scene {
    pub fn load(path: &Path) -> Result<Self, SceneError> {
        let manifest = SceneManifest::read(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        let scene = Self::from_manifest(&manifest, base)?;
        info!(
            path = %path.display(),
            object_types = scene.pack.assets.len(),
            entities = scene.entities.len(),
            cameras = scene.cameras.len(),
            "scene loaded"
        );
        Ok(scene)
    }

    pub fn from_manifest(manifest: &SceneManifest, base_dir: &Path) -> Result<Self, SceneError> {
        let pack = manifest.asset_pack(base_dir);
        pack.validate()?;
        let declared: HashSet<&str> = pack.assets.iter().map(|a| a.object_type.as_str()).collect();

        let mut uids = HashSet::new();
        let mut entities = Vec::with_capacity(manifest.bodies.len());
        for b in &manifest.bodies {
            if !declared.contains(b.object_type.as_str()) {
                return Err(SceneError::UnknownObjectType {
                    uid: b.uid.clone(),
                    object_type: b.object_type.clone(),
                });
            }
            if !uids.insert(b.uid.as_str()) {
                return Err(SceneError::DuplicateUid(b.uid.clone()));
            }
            let position = Vec3::from_array(b.position);
            let body = match b.kind {
                BodyKind::Static => Body::Static(StaticBody {
                    uid: b.uid.clone(),
                    position,
                    orientation: b.orientation(),
                }),
                BodyKind::Dynamic => Body::Dynamic(
                    DynamicBody::new(b.uid.clone(), position, b.orientation(), b.inv_mass)
                        .with_velocity(
                            Vec3::from_array(b.velocity),
                            Vec3::from_array(b.angular_velocity),
                        ),
                ),
            };
            entities.push(Entity {
                object_type: b.object_type.clone(),
                body,
            });
        }

        let mut cameras = Vec::with_capacity(manifest.cameras.len().max(1));
        for c in &manifest.cameras {
            cameras.push(match c {
                CameraEntry::Free { eye, yaw, pitch } => Camera::Free(FreeCamera {
                    eye: Vec3::from_array(*eye),
                    yaw: *yaw,
                    pitch: *pitch,
                }),
                CameraEntry::Follow { target, offset } => {
                    if !uids.contains(target.as_str()) {
                        return Err(SceneError::UnknownFollowTarget(target.clone()));
                    }
                    Camera::Follow(FollowCamera {
                        target: target.clone(),
                        offset: Vec3::from_array(*offset),
                    })
                }
            });
        }
        if cameras.is_empty() {
            cameras.push(Camera::default());
        }

        Ok(Self {
            pack,
            entities,
            cameras,
            active_camera: 0,
        })
    }

    /// Integrates every dynamic body over `dt` seconds.
    pub fn update(&mut self, dt: f32) {
        for e in &mut self.entities {
            e.body.integrate(dt);
        }
    }

    /// Makes the next camera active, wrapping around. Returns the new index.
    pub fn cycle_camera(&mut self) -> usize {
        self.active_camera = (self.active_camera + 1) % self.cameras.len();
        debug!(camera = self.active_camera, "camera switched");
        self.active_camera
    }

    pub fn active_camera(&self) -> &Camera {
        &self.cameras[self.active_camera]
    }

    pub fn active_camera_mut(&mut self) -> &mut Camera {
        &mut self.cameras[self.active_camera]
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn body(&self, uid: &str) -> Option<&Body> {
        self.entities
            .iter()
            .map(|e| &e.body)
            .find(|b| b.uid() == uid)
    }

    pub fn body_mut(&mut self, uid: &str) -> Option<&mut Body> {
        self.entities
            .iter_mut()
            .map(|e| &mut e.body)
            .find(|b| b.uid() == uid)
    }
}

impl RenderScene for Scene {
    fn camera(&self) -> CameraView {
        self.active_camera()
            .view(|uid| self.body(uid).map(Body::position))
    }

    /// Every declared object type appears, possibly with no transforms.
    fn mapped_objects(&self) -> BTreeMap<String, Vec<Mat4>> {
        let mut mapped: BTreeMap<String, Vec<Mat4>> = self
            .pack
            .assets
            .iter()
            .map(|a| (a.object_type.clone(), Vec::new()))
            .collect();
        for e in &self.entities {
            mapped
                .entry(e.object_type.clone())
                .or_default()
                .push(e.body.transform());
        }
        mapped
    }

    fn asset_pack(&self) -> &AssetPack {
        &self.pack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn manifest(text: &str) -> SceneManifest {
        SceneManifest::parse(text, Path::new("test.toml")).expect("parse")
    }

    const TWO_TYPES: &str = r#"
[[assets]]
object_type = "rock"
model = "rock.obj"
texture = "rock.png"

[[assets]]
object_type = "tree"
model = "tree.obj"
texture = "tree.png"

[skybox]
faces = ["sky.png"]
repeat = true

[[bodies]]
uid = "r1"
object_type = "rock"

[[bodies]]
uid = "r2"
object_type = "rock"
position = [3.0, 0.0, 0.0]

[[bodies]]
uid = "ball"
object_type = "tree"
kind = "dynamic"
velocity = [1.0, 0.0, 0.0]

[[cameras]]
kind = "free"
eye = [0.0, 1.0, 10.0]

[[cameras]]
kind = "follow"
target = "ball"
offset = [0.0, 0.0, 4.0]
"#;

    #[test]
    fn objects_are_grouped_by_type_in_body_order() {
        let scene = Scene::from_manifest(&manifest(TWO_TYPES), Path::new("")).expect("scene");
        let mapped = scene.mapped_objects();
        assert_eq!(mapped["rock"].len(), 2);
        assert_eq!(mapped["tree"].len(), 1);
        assert_eq!(
            mapped["rock"][1].transform_point3(Vec3::ZERO),
            Vec3::new(3.0, 0.0, 0.0)
        );
    }

    #[test]
    fn declared_types_without_bodies_map_to_empty_lists() {
        let text = TWO_TYPES.replace("object_type = \"tree\"\nkind", "object_type = \"rock\"\nkind");
        let scene = Scene::from_manifest(&manifest(&text), Path::new("")).expect("scene");
        let mapped = scene.mapped_objects();
        assert!(mapped["tree"].is_empty());
        assert_eq!(mapped["rock"].len(), 3);
    }

    #[test]
    fn update_moves_only_dynamic_bodies() {
        let mut scene = Scene::from_manifest(&manifest(TWO_TYPES), Path::new("")).expect("scene");
        scene.update(0.5);
        assert_eq!(scene.body("ball").map(Body::position), Some(Vec3::new(0.5, 0.0, 0.0)));
        assert_eq!(scene.body("r1").map(Body::position), Some(Vec3::ZERO));
    }

    #[test]
    fn cycling_cameras_wraps_and_follow_tracks_body() {
        let mut scene = Scene::from_manifest(&manifest(TWO_TYPES), Path::new("")).expect("scene");
        assert_eq!(scene.camera().eye, Vec3::new(0.0, 1.0, 10.0));
        assert_eq!(scene.cycle_camera(), 1);
        scene.update(1.0);
        let view = scene.camera();
        assert!((view.center - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-5);
        assert!((view.eye - Vec3::new(1.0, 0.0, 4.0)).length() < 1e-5);
        assert_eq!(scene.cycle_camera(), 0);
    }

    #[test]
    fn scene_without_cameras_gets_a_default() {
        let text = TWO_TYPES.split("[[cameras]]").next().expect("prefix").to_owned();
        let mut scene = Scene::from_manifest(&manifest(&text), Path::new("")).expect("scene");
        assert_eq!(scene.cycle_camera(), 0);
        assert_eq!(scene.camera().eye, CameraView::default().eye);
    }

    #[test]
    fn undeclared_object_type_is_rejected() {
        let text = format!("{TWO_TYPES}\n[[bodies]]\nuid = \"x\"\nobject_type = \"ghost\"\n");
        let err = Scene::from_manifest(&manifest(&text), Path::new("")).unwrap_err();
        assert!(matches!(err, SceneError::UnknownObjectType { ref object_type, .. } if object_type == "ghost"));
    }

    #[test]
    fn duplicate_uid_is_rejected() {
        let text = format!("{TWO_TYPES}\n[[bodies]]\nuid = \"r1\"\nobject_type = \"rock\"\n");
        let err = Scene::from_manifest(&manifest(&text), Path::new("")).unwrap_err();
        assert!(matches!(err, SceneError::DuplicateUid(ref uid) if uid == "r1"));
    }

    #[test]
    fn follow_target_must_exist() {
        let text = TWO_TYPES.replace("target = \"ball\"", "target = \"comet\"");
        let err = Scene::from_manifest(&manifest(&text), Path::new("")).unwrap_err();
        assert!(matches!(err, SceneError::UnknownFollowTarget(ref t) if t == "comet"));
    }

    #[test]
    fn asset_pack_paths_are_rooted_at_base_dir() {
        let scene = Scene::from_manifest(&manifest(TWO_TYPES), Path::new("levels")).expect("scene");
        assert_eq!(
            scene.asset_pack().assets[1].texture,
            PathBuf::from("levels/tree.png")
        );
    }
}
