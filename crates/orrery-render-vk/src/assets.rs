// SPDX-License-Identifier: CEPL-1.0
//! Startup asset batch: meshes and textures loaded on the worker pool, then packed
//! into one vertex buffer, one index buffer, a mesh registry and a skybox.
use crate::descriptors::{self, SetLayouts, MESH_BINDINGS, SKY_BINDINGS};
use crate::error::AssetError;
use crate::jobs::{JobStatus, WorkerPool};
use crate::memory::{Allocator, Buffer};
use crate::mesh::{load_mesh, MeshData, MeshLoadInfo, MeshLump, MeshRecord, MeshRegistry};
use crate::texture::{
    Cubemap, CubemapFaces, DecodedImage, Texture, TextureHandle, TextureLoader, TexturePool,
};
use crate::upload::UploadContext;
use anyhow::{Context, Result};
use ash::vk;
use orrery_render::AssetPack;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq)]
pub enum AssetJob {
    LoadMesh(MeshLoadInfo),
    LoadTexture(PathBuf),
}

#[derive(Debug)]
pub enum JobOutput {
    Mesh(MeshData),
    Texture(Texture),
}

/// Mesh `i` at `2i`, its texture at `2i + 1`, then the skybox faces.
pub fn plan_jobs(pack: &AssetPack) -> Vec<AssetJob> {
    let mut jobs = Vec::with_capacity(pack.assets.len() * 2 + pack.skybox.files().len());
    for asset in &pack.assets {
        jobs.push(AssetJob::LoadMesh(MeshLoadInfo {
            path: asset.model.clone(),
            pre_transform: asset.pre_transform,
        }));
        jobs.push(AssetJob::LoadTexture(asset.texture.clone()));
    }
    jobs.extend(
        pack.skybox
            .files()
            .iter()
            .cloned()
            .map(AssetJob::LoadTexture),
    );
    jobs
}

/// Job results sorted back into their roles. `None` marks a texture that failed.
#[derive(Debug, Default)]
pub struct SettledJobs {
    pub meshes: Vec<MeshData>,
    pub textures: Vec<Option<Texture>>,
    pub faces: Vec<Option<Texture>>,
}

/// The first batch-aborting failure, if any.
pub fn fatal_failure<O>(statuses: &[JobStatus<O>]) -> Option<&AssetError> {
    statuses
        .iter()
        .filter_map(JobStatus::failure)
        .find(|e| e.is_fatal())
}

/// Splits statuses laid out by [`plan_jobs`]. Failed meshes become empty meshes.
pub fn settle(statuses: Vec<JobStatus<JobOutput>>, asset_count: usize) -> SettledJobs {
    let mut settled = SettledJobs::default();
    for (index, status) in statuses.into_iter().enumerate() {
        let is_mesh = index < asset_count * 2 && index % 2 == 0;
        let output = match status {
            JobStatus::Complete(out) => Some(out),
            JobStatus::Failed(e) => {
                warn!(job = index, error = %e, "asset degraded");
                None
            }
            JobStatus::Pending | JobStatus::InProgress => None,
        };
        match (is_mesh, output) {
            (true, Some(JobOutput::Mesh(m))) => settled.meshes.push(m),
            (true, _) => settled.meshes.push(MeshData::default()),
            (false, Some(JobOutput::Texture(t))) => {
                push_texture(&mut settled, index, asset_count, Some(t))
            }
            (false, _) => push_texture(&mut settled, index, asset_count, None),
        }
    }
    settled
}

fn push_texture(settled: &mut SettledJobs, index: usize, asset_count: usize, t: Option<Texture>) {
    if index < asset_count * 2 {
        settled.textures.push(t);
    } else {
        settled.faces.push(t);
    }
}

/// Everything the renderer draws from once loading is done.
pub struct LoadedAssets {
    pub vertex_buffer: Buffer,
    pub index_buffer: Buffer,
    pub registry: MeshRegistry,
    pub textures: TexturePool,
    pub cubemap: Cubemap,
    descriptor_pool: vk::DescriptorPool,
}

impl LoadedAssets {
    /// Caller guarantees the device is idle.
    pub unsafe fn destroy(self, allocator: &Allocator) {
        self.textures.destroy(allocator);
        allocator
            .device()
            .destroy_descriptor_pool(self.descriptor_pool, None);
        allocator.destroy_buffer(self.index_buffer);
        allocator.destroy_buffer(self.vertex_buffer);
    }
}

/// Runs the whole batch. Returns only after every job has settled.
pub unsafe fn load_assets(
    upload: &UploadContext,
    layouts: &SetLayouts,
    pack: &AssetPack,
) -> Result<LoadedAssets> {
    pack.validate().context("asset pack")?;
    let started = Instant::now();
    let allocator = upload.allocator();
    let device = allocator.device();

    let face_files = pack.skybox.files().len();
    let texture_count = (pack.assets.len() + face_files) as u32;
    let mut sizes = descriptors::pool_sizes(&MESH_BINDINGS, texture_count);
    sizes.extend(descriptors::pool_sizes(&SKY_BINDINGS, 1));
    let pool = descriptors::create_pool(device, texture_count + 1, &sizes)?;
    let pool_lock = Mutex::new(pool);

    let loader = TextureLoader::new(upload, layouts.mesh, &pool_lock);
    let jobs = plan_jobs(pack);
    let workers = WorkerPool::for_jobs(jobs.len());
    debug!(jobs = jobs.len(), workers = workers.workers(), "asset batch queued");
    let statuses = workers.run(jobs, |job| match job {
        AssetJob::LoadMesh(info) => load_mesh(&info).map(JobOutput::Mesh),
        AssetJob::LoadTexture(path) => loader.load(&path).map(JobOutput::Texture),
    });

    if let Some(fatal) = fatal_failure(&statuses) {
        let err = anyhow::anyhow!("{fatal}");
        for status in statuses {
            if let Some(JobOutput::Texture(t)) = status.into_output() {
                t.destroy(allocator);
            }
        }
        device.destroy_descriptor_pool(pool, None);
        return Err(err.context("asset batch aborted"));
    }

    let settled = settle(statuses, pack.assets.len());
    match assemble(upload, &loader, layouts, pack, settled, pool) {
        Ok(loaded) => {
            info!(
                meshes = loaded.registry.len(),
                textures = loaded.textures.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "asset batch loaded"
            );
            Ok(loaded)
        }
        Err(e) => {
            device.destroy_descriptor_pool(pool, None);
            Err(e)
        }
    }
}

unsafe fn assemble(
    upload: &UploadContext,
    loader: &TextureLoader,
    layouts: &SetLayouts,
    pack: &AssetPack,
    settled: SettledJobs,
    pool: vk::DescriptorPool,
) -> Result<LoadedAssets> {
    let allocator = upload.allocator();
    let mut textures = TexturePool::default();

    // Registered before anything can fail so the pool owns every GPU texture from here on.
    let mut fill = |slot: Option<Texture>, what: &str| -> Result<TextureHandle> {
        let texture = match slot {
            Some(t) => t,
            None => {
                warn!(texture = what, "using placeholder texture");
                loader
                    .create(&DecodedImage::placeholder())
                    .context("placeholder texture")?
            }
        };
        Ok(textures.insert(texture))
    };
    let mut handles = Vec::with_capacity(settled.textures.len());
    let mut failed = None;
    for (asset, slot) in pack.assets.iter().zip(settled.textures) {
        match fill(slot, &asset.object_type) {
            Ok(h) => handles.push(h),
            Err(e) => {
                failed = Some(e);
                break;
            }
        }
    }
    let mut face_handles = Vec::with_capacity(settled.faces.len());
    if failed.is_none() {
        for slot in settled.faces {
            match fill(slot, "skybox") {
                Ok(h) => face_handles.push(h),
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
    }
    if let Some(e) = failed {
        textures.destroy(allocator);
        return Err(e);
    }

    let built = build_buffers(
        upload,
        layouts,
        pack,
        &settled.meshes,
        &handles,
        face_handles,
        &textures,
        pool,
    );
    match built {
        Ok((vertex_buffer, index_buffer, registry, cubemap)) => Ok(LoadedAssets {
            vertex_buffer,
            index_buffer,
            registry,
            textures,
            cubemap,
            descriptor_pool: pool,
        }),
        Err(e) => {
            textures.destroy(allocator);
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
unsafe fn build_buffers(
    upload: &UploadContext,
    layouts: &SetLayouts,
    pack: &AssetPack,
    meshes: &[MeshData],
    handles: &[TextureHandle],
    face_handles: Vec<TextureHandle>,
    textures: &TexturePool,
    pool: vk::DescriptorPool,
) -> Result<(Buffer, Buffer, MeshRegistry, Cubemap)> {
    let allocator = upload.allocator();
    let device = allocator.device();

    let mut lump = MeshLump::concatenate(meshes);
    let mut registry = MeshRegistry::default();
    for ((asset, range), &texture) in pack.assets.iter().zip(&lump.ranges).zip(handles) {
        registry.insert(
            asset.object_type.clone(),
            MeshRecord {
                first_index: range.first_index,
                index_count: range.index_count,
                texture,
            },
        );
    }
    lump.pad_for_upload();

    let vertex_buffer = upload
        .upload_buffer(
            bytemuck::cast_slice(&lump.vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )
        .context("vertex buffer")?;
    let index_buffer = match upload.upload_buffer(
        bytemuck::cast_slice(&lump.indices),
        vk::BufferUsageFlags::INDEX_BUFFER,
    ) {
        Ok(b) => b,
        Err(e) => {
            allocator.destroy_buffer(vertex_buffer);
            return Err(e.context("index buffer"));
        }
    };

    let cubemap = CubemapFaces::new(pack.skybox.repeat, face_handles)
        .and_then(|faces| {
            let set = descriptors::allocate_set(device, pool, layouts.sky)?;
            Cubemap::bind(device, faces, set, textures)
        });
    match cubemap {
        Ok(cubemap) => {
            debug!(
                vertices = lump.vertices.len(),
                indices = lump.indices.len(),
                repeated_sky = cubemap.faces.is_repeated(),
                "mesh lump uploaded"
            );
            Ok((vertex_buffer, index_buffer, registry, cubemap))
        }
        Err(e) => {
            allocator.destroy_buffer(index_buffer);
            allocator.destroy_buffer(vertex_buffer);
            Err(e.context("skybox"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Vertex;
    use crate::memory::Image;
    use orrery_render::{AssetDesc, Mat3, SkyboxDesc};

    fn pack(types: &[&str], skybox: SkyboxDesc) -> AssetPack {
        AssetPack {
            assets: types
                .iter()
                .map(|t| AssetDesc {
                    object_type: (*t).to_owned(),
                    model: PathBuf::from(format!("{t}.obj")),
                    texture: PathBuf::from(format!("{t}.png")),
                    pre_transform: Mat3::IDENTITY,
                })
                .collect(),
            skybox,
        }
    }

    fn null_texture() -> Texture {
        Texture {
            image: Image {
                handle: vk::Image::null(),
                memory: vk::DeviceMemory::null(),
                format: vk::Format::R8G8B8A8_UNORM,
                extent: vk::Extent2D::default(),
            },
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            descriptor_set: vk::DescriptorSet::null(),
        }
    }

    fn six_faces() -> SkyboxDesc {
        SkyboxDesc {
            faces: (0..6).map(|i| PathBuf::from(format!("sky{i}.png"))).collect(),
            repeat: false,
        }
    }

    #[test]
    fn jobs_interleave_mesh_and_texture_then_faces() {
        let jobs = plan_jobs(&pack(&["rock", "tree"], six_faces()));
        assert_eq!(jobs.len(), 10);
        assert!(matches!(&jobs[0], AssetJob::LoadMesh(i) if i.path == PathBuf::from("rock.obj")));
        assert_eq!(jobs[1], AssetJob::LoadTexture("rock.png".into()));
        assert!(matches!(&jobs[2], AssetJob::LoadMesh(i) if i.path == PathBuf::from("tree.obj")));
        assert_eq!(jobs[3], AssetJob::LoadTexture("tree.png".into()));
        assert_eq!(jobs[4], AssetJob::LoadTexture("sky0.png".into()));
        assert_eq!(jobs[9], AssetJob::LoadTexture("sky5.png".into()));
    }

    #[test]
    fn repeated_skybox_loads_one_face() {
        let jobs = plan_jobs(&pack(&["rock"], SkyboxDesc::repeated("sky.png")));
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[2], AssetJob::LoadTexture("sky.png".into()));
    }

    #[test]
    fn failures_degrade_without_shifting_roles() {
        let mesh = MeshData {
            vertices: vec![Vertex::default(); 3],
            indices: vec![0, 1, 2],
        };
        let statuses = vec![
            JobStatus::Failed(AssetError::Decode {
                path: "rock.obj".into(),
                reason: "truncated".into(),
            }),
            JobStatus::Complete(JobOutput::Texture(null_texture())),
            JobStatus::Complete(JobOutput::Mesh(mesh.clone())),
            JobStatus::Failed(AssetError::Panicked("boom".into())),
            JobStatus::Complete(JobOutput::Texture(null_texture())),
        ];
        assert!(fatal_failure(&statuses).is_none());

        let settled = settle(statuses, 2);
        assert_eq!(settled.meshes, vec![MeshData::default(), mesh]);
        assert_eq!(
            settled.textures.iter().map(Option::is_some).collect::<Vec<_>>(),
            vec![true, false]
        );
        assert_eq!(settled.faces.len(), 1);
        assert!(settled.faces[0].is_some());
    }

    #[test]
    fn unsupported_format_aborts_the_batch() {
        let statuses: Vec<JobStatus<JobOutput>> = vec![
            JobStatus::Failed(AssetError::Decode {
                path: "a.png".into(),
                reason: "bad".into(),
            }),
            JobStatus::Failed(AssetError::UnsupportedFormat {
                path: "a.fbx".into(),
                extension: "fbx".into(),
            }),
        ];
        assert!(matches!(
            fatal_failure(&statuses),
            Some(AssetError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn failed_mesh_still_gets_a_registry_slot() {
        let statuses = vec![
            JobStatus::Complete(JobOutput::Mesh(MeshData {
                vertices: vec![Vertex::default(); 3],
                indices: vec![0, 1, 2],
            })),
            JobStatus::Complete(JobOutput::Texture(null_texture())),
            JobStatus::Failed(AssetError::Panicked("parser".into())),
            JobStatus::Complete(JobOutput::Texture(null_texture())),
        ];
        let settled = settle(statuses, 2);
        let lump = MeshLump::concatenate(&settled.meshes);
        assert_eq!(lump.ranges.len(), 2);
        assert_eq!(lump.ranges[1].index_count, 0);
        assert_eq!(lump.ranges[1].first_index, 3);
    }
}
