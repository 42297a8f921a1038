// SPDX-License-Identifier: CEPL-1.0
use orrery_render::RenderScene;
use orrery_scene::{Scene, SceneError};
use std::fs;

const SCENE: &str = r#"
[[assets]]
object_type = "asteroid"
model = "meshes/asteroid.obj"
texture = "textures/asteroid.png"

[skybox]
faces = ["sky/px.png", "sky/nx.png", "sky/py.png", "sky/ny.png", "sky/pz.png", "sky/nz.png"]

[[bodies]]
uid = "a1"
object_type = "asteroid"
kind = "dynamic"
angular_velocity = [0.0, 1.0, 0.0]
"#;

#[test]
fn loads_manifest_relative_to_its_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("belt.toml");
    fs::write(&path, SCENE).expect("write manifest");

    let mut scene = Scene::load(&path).expect("load");
    let pack = scene.asset_pack();
    assert_eq!(pack.assets[0].model, dir.path().join("meshes/asteroid.obj"));
    assert_eq!(pack.skybox.files().len(), 6);
    assert_eq!(pack.skybox.faces[5], dir.path().join("sky/nz.png"));

    let before = scene.mapped_objects()["asteroid"][0];
    scene.update(0.25);
    let after = scene.mapped_objects()["asteroid"][0];
    assert_ne!(before, after);
}

#[test]
fn missing_manifest_reports_its_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("absent.toml");
    let err = Scene::load(&path).unwrap_err();
    assert!(matches!(err, SceneError::Io { .. }));
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn five_face_skybox_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broken.toml");
    fs::write(&path, SCENE.replace(", \"sky/nz.png\"", "")).expect("write manifest");
    let err = Scene::load(&path).unwrap_err();
    assert!(matches!(err, SceneError::Pack(_)));
}
