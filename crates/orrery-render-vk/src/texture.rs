// SPDX-License-Identifier: CEPL-1.0
//! Sampled textures, the handle-indexed texture pool and skybox face bindings.
use crate::descriptors::allocate_set;
use crate::error::AssetError;
use crate::memory::{create_image_view, Allocator, Image, ImageDesc};
use crate::upload::UploadContext;
use anyhow::{bail, Context, Result};
use ash::vk;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
pub const CUBE_FACE_COUNT: usize = 6;

/// Stable index into a [`TexturePool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureHandle(u32);

impl TextureHandle {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Tightly packed RGBA8 pixels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl DecodedImage {
    /// 1x1 magenta, bound wherever a texture failed to load.
    pub fn placeholder() -> Self {
        Self {
            width: 1,
            height: 1,
            pixels: vec![255, 0, 255, 255],
        }
    }
}

pub fn decode_texture(path: &Path) -> Result<DecodedImage, AssetError> {
    let format = image::ImageFormat::from_path(path).map_err(|_| AssetError::UnsupportedFormat {
        path: path.to_path_buf(),
        extension: path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_owned(),
    })?;
    let bytes = std::fs::read(path).map_err(|source| AssetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let rgba = image::load_from_memory_with_format(&bytes, format)
        .map_err(|e| AssetError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(DecodedImage {
        width,
        height,
        pixels: rgba.into_raw(),
    })
}

#[derive(Debug)]
pub struct Texture {
    pub image: Image,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub descriptor_set: vk::DescriptorSet,
}

impl Texture {
    /// The descriptor set goes away with its pool.
    pub unsafe fn destroy(self, allocator: &Allocator) {
        let device = allocator.device();
        device.destroy_sampler(self.sampler, None);
        device.destroy_image_view(self.view, None);
        allocator.destroy_image(self.image);
    }
}

/// Linear magnification, nearest minification, repeat addressing.
pub unsafe fn create_sampler(device: &ash::Device) -> Result<vk::Sampler> {
    let info = vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: vk::Filter::LINEAR,
        min_filter: vk::Filter::NEAREST,
        mipmap_mode: vk::SamplerMipmapMode::NEAREST,
        address_mode_u: vk::SamplerAddressMode::REPEAT,
        address_mode_v: vk::SamplerAddressMode::REPEAT,
        address_mode_w: vk::SamplerAddressMode::REPEAT,
        anisotropy_enable: vk::FALSE,
        max_anisotropy: 1.0,
        compare_enable: vk::FALSE,
        min_lod: 0.0,
        max_lod: 0.0,
        border_color: vk::BorderColor::INT_OPAQUE_BLACK,
        unnormalized_coordinates: vk::FALSE,
        ..Default::default()
    };
    device.create_sampler(&info, None).context("create_sampler")
}

/// Uploads textures and gives each one its own single-sampler descriptor set.
pub struct TextureLoader<'a> {
    upload: &'a UploadContext<'a>,
    set_layout: vk::DescriptorSetLayout,
    descriptor_pool: &'a Mutex<vk::DescriptorPool>,
}

impl<'a> TextureLoader<'a> {
    pub fn new(
        upload: &'a UploadContext<'a>,
        set_layout: vk::DescriptorSetLayout,
        descriptor_pool: &'a Mutex<vk::DescriptorPool>,
    ) -> Self {
        Self {
            upload,
            set_layout,
            descriptor_pool,
        }
    }

    pub fn load(&self, path: &Path) -> Result<Texture, AssetError> {
        let decoded = decode_texture(path)?;
        // SAFETY: the upload context outlives this call and owns its own command pool.
        unsafe { self.create(&decoded) }.map_err(|e| AssetError::Upload {
            path: path.to_path_buf(),
            reason: format!("{e:#}"),
        })
    }

    pub unsafe fn create(&self, decoded: &DecodedImage) -> Result<Texture> {
        let expected = decoded.width as usize * decoded.height as usize * 4;
        if decoded.pixels.len() != expected || expected == 0 {
            bail!(
                "{}x{} image carries {} bytes",
                decoded.width,
                decoded.height,
                decoded.pixels.len()
            );
        }
        let allocator = self.upload.allocator();
        let device = allocator.device();

        let image = allocator.create_image(&ImageDesc::sampled(
            decoded.width,
            decoded.height,
            TEXTURE_FORMAT,
        ))?;
        if let Err(e) = self.upload.upload_image(&image, &decoded.pixels) {
            allocator.destroy_image(image);
            return Err(e);
        }
        let view = match create_image_view(device, &image, vk::ImageAspectFlags::COLOR) {
            Ok(v) => v,
            Err(e) => {
                allocator.destroy_image(image);
                return Err(e);
            }
        };
        let texture = Texture {
            image,
            view,
            sampler: vk::Sampler::null(),
            descriptor_set: vk::DescriptorSet::null(),
        };
        match self.finish(texture.view) {
            Ok((sampler, descriptor_set)) => Ok(Texture {
                sampler,
                descriptor_set,
                ..texture
            }),
            Err(e) => {
                texture.destroy(allocator);
                Err(e)
            }
        }
    }

    unsafe fn finish(&self, view: vk::ImageView) -> Result<(vk::Sampler, vk::DescriptorSet)> {
        let device = self.upload.allocator().device();
        let sampler = create_sampler(device)?;
        let set = {
            let pool = self
                .descriptor_pool
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            allocate_set(device, *pool, self.set_layout)
        };
        let set = match set {
            Ok(s) => s,
            Err(e) => {
                device.destroy_sampler(sampler, None);
                return Err(e);
            }
        };
        let info = vk::DescriptorImageInfo {
            sampler,
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let write = vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: set,
            dst_binding: 0,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            p_image_info: &info,
            ..Default::default()
        };
        device.update_descriptor_sets(&[write], &[]);
        Ok((sampler, set))
    }
}

/// Owns every texture of a load batch; handles stay valid until the pool is destroyed.
#[derive(Debug, Default)]
pub struct TexturePool {
    textures: Vec<Texture>,
}

impl TexturePool {
    pub fn insert(&mut self, texture: Texture) -> TextureHandle {
        self.textures.push(texture);
        TextureHandle::new((self.textures.len() - 1) as u32)
    }

    pub fn get(&self, handle: TextureHandle) -> Option<&Texture> {
        self.textures.get(handle.index())
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    pub unsafe fn destroy(self, allocator: &Allocator) {
        for t in self.textures {
            t.destroy(allocator);
        }
    }
}

/// Which stored texture feeds each cube face, in +X, -X, +Y, -Y, +Z, -Z order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CubemapFaces {
    stored: Vec<TextureHandle>,
}

impl CubemapFaces {
    pub fn new(repeat: bool, stored: Vec<TextureHandle>) -> Result<Self> {
        let needed = if repeat { 1 } else { CUBE_FACE_COUNT };
        if stored.len() != needed {
            bail!(
                "cubemap needs {needed} face texture(s), got {}",
                stored.len()
            );
        }
        Ok(Self { stored })
    }

    pub fn is_repeated(&self) -> bool {
        self.stored.len() == 1
    }

    pub fn stored(&self) -> &[TextureHandle] {
        &self.stored
    }

    pub fn bindings(&self) -> [TextureHandle; CUBE_FACE_COUNT] {
        std::array::from_fn(|face| self.stored[face % self.stored.len()])
    }
}

#[derive(Debug)]
pub struct Cubemap {
    pub faces: CubemapFaces,
    pub descriptor_set: vk::DescriptorSet,
}

impl Cubemap {
    /// Binds the six faces into `set`, a six-sampler skybox set.
    pub unsafe fn bind(
        device: &ash::Device,
        faces: CubemapFaces,
        set: vk::DescriptorSet,
        textures: &TexturePool,
    ) -> Result<Self> {
        let mut infos = [vk::DescriptorImageInfo::default(); CUBE_FACE_COUNT];
        for (info, handle) in infos.iter_mut().zip(faces.bindings()) {
            let t = textures
                .get(handle)
                .with_context(|| format!("cube face {handle:?} not in texture pool"))?;
            *info = vk::DescriptorImageInfo {
                sampler: t.sampler,
                image_view: t.view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            };
        }
        let write = vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: set,
            dst_binding: 0,
            descriptor_count: CUBE_FACE_COUNT as u32,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            p_image_info: infos.as_ptr(),
            ..Default::default()
        };
        device.update_descriptor_sets(&[write], &[]);
        Ok(Self {
            faces,
            descriptor_set: set,
        })
    }
}
