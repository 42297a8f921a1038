// SPDX-License-Identifier: CEPL-1.0
//! Mesh import, vertex deduplication and the shared vertex/index lump.
use crate::error::AssetError;
use crate::texture::TextureHandle;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use fbxcel_dom::any::AnyDocument;
use fbxcel_dom::v7400::data::mesh::layer::TypedLayerElementHandle;
use fbxcel_dom::v7400::data::mesh::{PolygonVertexIndex, PolygonVertices};
use fbxcel_dom::v7400::object::geometry::TypedGeometryHandle;
use fbxcel_dom::v7400::object::TypedObjectHandle;
use orrery_math::{Mat3, Vec3};
use std::collections::HashMap;
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub uv: [f32; 2],
    pub normal: [f32; 3],
}

impl Vertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, pos) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, uv) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, normal) as u32,
            },
        ]
    }

    /// Bitwise identity over position, uv and normal, with -0.0 folded into 0.0.
    fn key(&self) -> [u32; 8] {
        let bits = |f: f32| if f == 0.0 { 0 } else { f.to_bits() };
        [
            bits(self.pos[0]),
            bits(self.pos[1]),
            bits(self.pos[2]),
            bits(self.uv[0]),
            bits(self.uv[1]),
            bits(self.normal[0]),
            bits(self.normal[1]),
            bits(self.normal[2]),
        ]
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Builds an indexed mesh from triangle corners, merging identical vertices.
    pub fn from_corners<I>(corners: I) -> Self
    where
        I: IntoIterator<Item = Vertex>,
    {
        let mut seen: HashMap<[u32; 8], u32> = HashMap::new();
        let mut mesh = MeshData::default();
        for v in corners {
            let index = *seen.entry(v.key()).or_insert_with(|| {
                mesh.vertices.push(v);
                (mesh.vertices.len() - 1) as u32
            });
            mesh.indices.push(index);
        }
        mesh
    }

    /// Expands back into one vertex per index.
    pub fn corners(&self) -> impl Iterator<Item = Vertex> + '_ {
        self.indices.iter().map(|&i| self.vertices[i as usize])
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MeshLoadInfo {
    pub path: PathBuf,
    pub pre_transform: Mat3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ModelFormat {
    Obj,
    Fbx,
    Gltf,
}

fn model_format(path: &Path) -> Result<ModelFormat, AssetError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "obj" => Ok(ModelFormat::Obj),
        "fbx" => Ok(ModelFormat::Fbx),
        "gltf" | "glb" => Ok(ModelFormat::Gltf),
        _ => Err(AssetError::UnsupportedFormat {
            path: path.to_path_buf(),
            extension,
        }),
    }
}

/// Parses a model file and bakes `pre_transform` into its positions and normals.
pub fn load_mesh(info: &MeshLoadInfo) -> Result<MeshData, AssetError> {
    let format = model_format(&info.path)?;
    let corners = match format {
        ModelFormat::Obj => obj_corners(&info.path)?,
        ModelFormat::Fbx => fbx_corners(&info.path)?,
        ModelFormat::Gltf => gltf_corners(&info.path)?,
    };
    let m = info.pre_transform;
    Ok(MeshData::from_corners(corners.into_iter().map(|v| Vertex {
        pos: (m * Vec3::from(v.pos)).to_array(),
        uv: v.uv,
        normal: (m * Vec3::from(v.normal)).normalize_or_zero().to_array(),
    })))
}

fn decode_error(path: &Path, reason: impl ToString) -> AssetError {
    AssetError::Decode {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn obj_corners(path: &Path) -> Result<Vec<Vertex>, AssetError> {
    let bytes = std::fs::read(path).map_err(|source| AssetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let (models, _materials) = tobj::load_obj_buf(
        &mut Cursor::new(bytes),
        &tobj::LoadOptions {
            triangulate: true,
            single_index: false,
            ..Default::default()
        },
        |_| Ok((Vec::new(), Default::default())),
    )
    .map_err(|e| decode_error(path, e))?;

    let mut corners = Vec::new();
    for model in &models {
        let mesh = &model.mesh;
        for (i, &pi) in mesh.indices.iter().enumerate() {
            let p = pi as usize * 3;
            let pos = mesh
                .positions
                .get(p..p + 3)
                .ok_or_else(|| decode_error(path, format!("position index {pi} out of range")))?;
            // OBJ puts v = 0 at the bottom of the image
            let uv = match mesh.texcoord_indices.get(i) {
                Some(&ti) => {
                    let t = ti as usize * 2;
                    match mesh.texcoords.get(t..t + 2) {
                        Some(uv) => [uv[0], 1.0 - uv[1]],
                        None => return Err(decode_error(path, format!("uv index {ti} out of range"))),
                    }
                }
                None => [0.0, 0.0],
            };
            let normal = match mesh.normal_indices.get(i) {
                Some(&ni) => {
                    let n = ni as usize * 3;
                    match mesh.normals.get(n..n + 3) {
                        Some(n) => [n[0], n[1], n[2]],
                        None => return Err(decode_error(path, format!("normal index {ni} out of range"))),
                    }
                }
                None => [0.0, 0.0, 0.0],
            };
            corners.push(Vertex {
                pos: [pos[0], pos[1], pos[2]],
                uv,
                normal,
            });
        }
    }
    Ok(corners)
}

fn fbx_corners(path: &Path) -> Result<Vec<Vertex>, AssetError> {
    let file = std::fs::File::open(path).map_err(|source| AssetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_fbx(BufReader::new(file)).map_err(|e| decode_error(path, format!("{e:#}")))
}

fn read_fbx(reader: BufReader<std::fs::File>) -> anyhow::Result<Vec<Vertex>> {
    let doc = match AnyDocument::from_seekable_reader(reader)? {
        AnyDocument::V7400(_, doc) => doc,
        _ => anyhow::bail!("unsupported FBX version"),
    };
    let mut corners = Vec::new();
    for object in doc.objects() {
        if let TypedObjectHandle::Geometry(TypedGeometryHandle::Mesh(mesh)) = object.get_typed() {
            let polygon_vertices = mesh.polygon_vertices()?;
            let tris = polygon_vertices.triangulate_each(fan_triangulator)?;

            let mut positions = Vec::new();
            for cpi in tris.iter_control_point_indices() {
                let cpi = cpi.ok_or_else(|| anyhow::anyhow!("polygon vertex without control point"))?;
                let p: [f64; 3] = polygon_vertices
                    .control_point(cpi)
                    .ok_or_else(|| anyhow::anyhow!("control point out of range"))?
                    .into();
                positions.push(p.map(|c| c as f32));
            }

            let layer = mesh.layers().next();
            let normals: Vec<[f32; 3]> = match layer.as_ref().and_then(|l| {
                l.layer_element_entries().find_map(|e| match e.typed_layer_element() {
                    Ok(TypedLayerElementHandle::Normal(h)) => Some(h),
                    _ => None,
                })
            }) {
                Some(h) => {
                    let normals = h.normals()?;
                    let mut out = Vec::with_capacity(positions.len());
                    for tri_vi in tris.triangle_vertex_indices() {
                        let n: [f64; 3] = normals.normal(&tris, tri_vi)?.into();
                        out.push(n.map(|c| c as f32));
                    }
                    out
                }
                None => Vec::new(),
            };
            let uvs: Vec<[f32; 2]> = match layer.as_ref().and_then(|l| {
                l.layer_element_entries().find_map(|e| match e.typed_layer_element() {
                    Ok(TypedLayerElementHandle::Uv(h)) => Some(h),
                    _ => None,
                })
            }) {
                Some(h) => {
                    let uv = h.uv()?;
                    let mut out = Vec::with_capacity(positions.len());
                    for tri_vi in tris.triangle_vertex_indices() {
                        let [u, v]: [f64; 2] = uv.uv(&tris, tri_vi)?.into();
                        // FBX puts v = 0 at the bottom of the image
                        out.push([u as f32, 1.0 - v as f32]);
                    }
                    out
                }
                None => Vec::new(),
            };

            for (i, pos) in positions.into_iter().enumerate() {
                corners.push(Vertex {
                    pos,
                    uv: uvs.get(i).copied().unwrap_or_default(),
                    normal: normals.get(i).copied().unwrap_or_default(),
                });
            }
        }
    }
    Ok(corners)
}

fn fan_triangulator(
    _pvs: &PolygonVertices<'_>,
    poly_pvis: &[PolygonVertexIndex],
    results: &mut Vec<[PolygonVertexIndex; 3]>,
) -> anyhow::Result<()> {
    let before = results.len();
    fan(poly_pvis, results);
    if results.len() == before {
        anyhow::bail!("polygon with {} vertices", poly_pvis.len());
    }
    Ok(())
}

/// Splits a convex polygon into triangles sharing its first corner.
fn fan<T: Copy>(polygon: &[T], out: &mut Vec<[T; 3]>) {
    if let [first, rest @ ..] = polygon {
        out.extend(rest.windows(2).map(|w| [*first, w[0], w[1]]));
    }
}

fn gltf_corners(path: &Path) -> Result<Vec<Vertex>, AssetError> {
    std::fs::metadata(path).map_err(|source| AssetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let (document, buffers, _images) = gltf::import(path).map_err(|e| decode_error(path, e))?;

    let mut corners = Vec::new();
    for mesh in document.meshes() {
        for primitive in mesh.primitives() {
            if primitive.mode() != gltf::mesh::Mode::Triangles {
                continue;
            }
            let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|d| &d.0[..]));
            let positions: Vec<[f32; 3]> = reader
                .read_positions()
                .ok_or_else(|| decode_error(path, "primitive without positions"))?
                .collect();
            let normals: Vec<[f32; 3]> = reader
                .read_normals()
                .map(|n| n.collect())
                .unwrap_or_default();
            let uvs: Vec<[f32; 2]> = reader
                .read_tex_coords(0)
                .map(|t| t.into_f32().collect())
                .unwrap_or_default();
            let indices: Vec<u32> = match reader.read_indices() {
                Some(i) => i.into_u32().collect(),
                None => (0..positions.len() as u32).collect(),
            };
            for i in indices {
                let i = i as usize;
                let pos = *positions
                    .get(i)
                    .ok_or_else(|| decode_error(path, format!("index {i} out of range")))?;
                corners.push(Vertex {
                    pos,
                    uv: uvs.get(i).copied().unwrap_or_default(),
                    normal: normals.get(i).copied().unwrap_or_default(),
                });
            }
        }
    }
    Ok(corners)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexRange {
    pub first_index: u32,
    pub index_count: u32,
}

/// Every mesh of a batch packed into one vertex array and one index array.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshLump {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    /// One range per input mesh, in input order.
    pub ranges: Vec<IndexRange>,
}

impl MeshLump {
    /// Concatenates meshes, rebasing each mesh's indices past the vertices before it.
    pub fn concatenate<'a, I>(meshes: I) -> Self
    where
        I: IntoIterator<Item = &'a MeshData>,
    {
        let mut lump = MeshLump::default();
        for mesh in meshes {
            let base = lump.vertices.len() as u32;
            lump.ranges.push(IndexRange {
                first_index: lump.indices.len() as u32,
                index_count: mesh.indices.len() as u32,
            });
            lump.vertices.extend_from_slice(&mesh.vertices);
            lump.indices.extend(mesh.indices.iter().map(|&i| i + base));
        }
        lump
    }

    /// Gives both arrays at least one element, since zero-sized buffers are invalid.
    /// Ranges are left untouched so the padding is never drawn.
    pub fn pad_for_upload(&mut self) {
        if self.vertices.is_empty() {
            self.vertices.push(Vertex::default());
        }
        if self.indices.is_empty() {
            self.indices.push(0);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshRecord {
    pub first_index: u32,
    pub index_count: u32,
    pub texture: TextureHandle,
}

/// Object type name to mesh record, iterated in registration order.
#[derive(Clone, Debug, Default)]
pub struct MeshRegistry {
    entries: Vec<(String, MeshRecord)>,
    by_name: HashMap<String, usize>,
}

impl MeshRegistry {
    /// Registers `name`, replacing any earlier record of the same name in place.
    pub fn insert(&mut self, name: impl Into<String>, record: MeshRecord) {
        let name = name.into();
        match self.by_name.get(&name) {
            Some(&i) => self.entries[i].1 = record,
            None => {
                self.by_name.insert(name.clone(), self.entries.len());
                self.entries.push((name, record));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&MeshRecord> {
        self.by_name.get(name).map(|&i| &self.entries[i].1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MeshRecord)> {
        self.entries.iter().map(|(n, r)| (n.as_str(), r))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn v(x: f32, y: f32, z: f32) -> Vertex {
        Vertex {
            pos: [x, y, z],
            uv: [x, y],
            normal: [0.0, 0.0, 1.0],
        }
    }

    fn quad() -> MeshData {
        let (a, b, c, d) = (v(0., 0., 0.), v(1., 0., 0.), v(1., 1., 0.), v(0., 1., 0.));
        MeshData::from_corners([a, b, c, c, d, a])
    }

    #[test]
    fn dedup_merges_shared_corners() {
        let q = quad();
        assert_eq!(q.vertices.len(), 4);
        assert_eq!(q.indices, vec![0, 1, 2, 2, 3, 0]);
    }

    #[test]
    fn dedup_is_idempotent() {
        let corners: Vec<Vertex> = quad().corners().collect();
        let once = MeshData::from_corners(corners.clone());
        let twice = MeshData::from_corners(corners);
        assert_eq!(once, twice);
        assert_eq!(MeshData::from_corners(once.corners()), once);
    }

    #[test]
    fn dedup_distinguishes_uv_and_normal() {
        let a = v(0., 0., 0.);
        let mut b = a;
        b.uv = [0.5, 0.5];
        let mut c = a;
        c.normal = [1.0, 0.0, 0.0];
        assert_eq!(MeshData::from_corners([a, b, c]).vertices.len(), 3);
    }

    #[test]
    fn negative_zero_is_the_same_vertex() {
        let a = v(0., 0., 0.);
        let mut b = a;
        b.pos[0] = -0.0;
        assert_eq!(MeshData::from_corners([a, b]).vertices.len(), 1);
    }

    #[test]
    fn concatenate_rebases_indices() {
        let q = quad();
        let tri = MeshData::from_corners([v(5., 0., 0.), v(6., 0., 0.), v(6., 1., 0.)]);
        let empty = MeshData::default();
        let lump = MeshLump::concatenate([&q, &empty, &tri]);

        assert_eq!(lump.vertices.len(), 7);
        assert_eq!(lump.indices.len(), 9);
        assert_eq!(&lump.indices[6..], &[4, 5, 6]);
        assert_eq!(
            lump.ranges,
            vec![
                IndexRange { first_index: 0, index_count: 6 },
                IndexRange { first_index: 6, index_count: 0 },
                IndexRange { first_index: 6, index_count: 3 },
            ]
        );
        assert!(lump.indices.iter().all(|&i| (i as usize) < lump.vertices.len()));
    }

    #[test]
    fn padded_indices_stay_below_vertex_count() {
        let empty = MeshData::default();
        let cases = [
            MeshLump::concatenate([&empty, &empty]),
            MeshLump::concatenate([&quad()]),
            MeshLump {
                vertices: vec![v(1., 2., 3.)],
                ..Default::default()
            },
        ];
        for mut lump in cases {
            let ranges = lump.ranges.clone();
            lump.pad_for_upload();
            assert!(!lump.vertices.is_empty());
            assert!(!lump.indices.is_empty());
            assert!(lump.indices.iter().all(|&i| (i as usize) < lump.vertices.len()));
            assert_eq!(lump.ranges, ranges);
        }
    }

    #[test]
    fn registry_keeps_registration_order() {
        let mut reg = MeshRegistry::default();
        let rec = |first| MeshRecord {
            first_index: first,
            index_count: 3,
            texture: TextureHandle::new(0),
        };
        reg.insert("tree", rec(0));
        reg.insert("rock", rec(3));
        reg.insert("tree", rec(6));
        let names: Vec<&str> = reg.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["tree", "rock"]);
        assert_eq!(reg.get("tree").map(|r| r.first_index), Some(6));
        assert!(!reg.contains("bush"));
    }

    fn write_obj(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).expect("create obj");
        f.write_all(body.as_bytes()).expect("write obj");
        path
    }

    const QUAD_OBJ: &str = "\
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vt 0 0
vt 1 0
vt 1 1
vt 0 1
vn 0 0 1
f 1/1/1 2/2/1 3/3/1
f 3/3/1 4/4/1 1/1/1
";

    #[test]
    fn loads_obj_with_flipped_v() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_obj(dir.path(), "quad.obj", QUAD_OBJ);
        let mesh = load_mesh(&MeshLoadInfo {
            path,
            pre_transform: Mat3::IDENTITY,
        })
        .expect("load quad");
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices.len(), 6);
        assert_eq!(mesh.vertices[0].uv, [0.0, 1.0]);
        assert_eq!(mesh.vertices[2].uv, [1.0, 0.0]);
        assert_eq!(mesh.vertices[0].normal, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn pre_transform_applies_to_positions_and_normals() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_obj(dir.path(), "quad.obj", QUAD_OBJ);
        let scale = Mat3::from_diagonal(Vec3::new(2.0, 3.0, -1.0));
        let mesh = load_mesh(&MeshLoadInfo {
            path,
            pre_transform: scale,
        })
        .expect("load quad");
        assert_eq!(mesh.vertices[2].pos, [2.0, 3.0, 0.0]);
        assert_eq!(mesh.vertices[0].normal, [0.0, 0.0, -1.0]);
    }

    #[test]
    fn unsupported_extension_is_fatal() {
        let err = load_mesh(&MeshLoadInfo {
            path: "ship.3ds".into(),
            pre_transform: Mat3::IDENTITY,
        })
        .unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, AssetError::UnsupportedFormat { ref extension, .. } if extension == "3ds"));
    }

    #[test]
    fn fbx_is_a_model_format() {
        assert_eq!(model_format(Path::new("ship.fbx")).ok(), Some(ModelFormat::Fbx));
        assert_eq!(model_format(Path::new("SHIP.FBX")).ok(), Some(ModelFormat::Fbx));
    }

    #[test]
    fn broken_fbx_is_a_decode_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_obj(dir.path(), "ship.fbx", "not an fbx file");
        let err = load_mesh(&MeshLoadInfo {
            path,
            pre_transform: Mat3::IDENTITY,
        })
        .unwrap_err();
        assert!(matches!(err, AssetError::Decode { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn fan_triangulation_shares_the_first_corner() {
        let mut tris = Vec::new();
        fan(&[0, 1, 2, 3, 4], &mut tris);
        assert_eq!(tris, vec![[0, 1, 2], [0, 2, 3], [0, 3, 4]]);

        let mut degenerate = Vec::new();
        fan(&[0, 1], &mut degenerate);
        fan::<u32>(&[], &mut degenerate);
        assert!(degenerate.is_empty());
    }

    #[test]
    fn missing_file_is_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_mesh(&MeshLoadInfo {
            path: dir.path().join("missing.obj"),
            pre_transform: Mat3::IDENTITY,
        })
        .unwrap_err();
        assert!(matches!(err, AssetError::Io { .. }));
        assert!(!err.is_fatal());

        let err = load_mesh(&MeshLoadInfo {
            path: dir.path().join("missing.glb"),
            pre_transform: Mat3::IDENTITY,
        })
        .unwrap_err();
        assert!(matches!(err, AssetError::Io { .. }));

        let err = load_mesh(&MeshLoadInfo {
            path: dir.path().join("missing.fbx"),
            pre_transform: Mat3::IDENTITY,
        })
        .unwrap_err();
        assert!(matches!(err, AssetError::Io { .. }));
    }

    #[test]
    fn vertex_layout_matches_struct() {
        assert_eq!(Vertex::binding_description().stride, 32);
        let attrs = Vertex::attribute_descriptions();
        assert_eq!(attrs.map(|a| a.offset), [0, 12, 20]);
        assert_eq!(attrs.map(|a| a.location), [0, 1, 2]);
    }
}
