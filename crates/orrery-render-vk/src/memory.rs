// SPDX-License-Identifier: CEPL-1.0
//! Buffers, images and the device memory bound to them.
use crate::error::AllocationError;
use anyhow::{bail, Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use bytemuck::Pod;
use std::ptr::NonNull;

/// First memory type allowed by `type_bits` that has every flag in `required`.
pub fn find_memory_type_index(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32, AllocationError> {
    (0..props.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32))
        .find(|&i| {
            type_bits & (1 << i) != 0
                && props.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
        .ok_or(AllocationError::NoCompatibleMemoryType {
            type_bits,
            required,
        })
}

#[derive(Clone, Copy, Debug)]
pub struct Buffer {
    pub handle: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

/// Host-coherent buffer that stays mapped for its whole life.
#[derive(Debug)]
pub struct MappedBuffer {
    pub buffer: Buffer,
    ptr: NonNull<u8>,
}

impl MappedBuffer {
    pub fn capacity(&self) -> usize {
        self.buffer.size as usize
    }

    pub fn write<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() > self.capacity() {
            bail!(
                "write of {} bytes exceeds mapped buffer of {} bytes",
                bytes.len(),
                self.capacity()
            );
        }
        // SAFETY: ptr maps `capacity` bytes of host-coherent memory owned by this buffer.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr(), bytes.len()) };
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Image {
    pub handle: vk::Image,
    pub memory: vk::DeviceMemory,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
}

impl ImageDesc {
    pub fn sampled(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
            format,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        }
    }

    pub fn depth(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self {
            extent,
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        }
    }
}

/// Creates and destroys device objects with memory bound at creation time.
#[derive(Clone)]
pub struct Allocator {
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl Allocator {
    pub unsafe fn new(
        instance: &ash::Instance,
        phys: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Self {
        Self {
            device: device.clone(),
            memory_properties: instance.get_physical_device_memory_properties(phys),
        }
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    unsafe fn allocate(
        &self,
        req: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory, AllocationError> {
        let memory_type_index =
            find_memory_type_index(&self.memory_properties, req.memory_type_bits, properties)?;
        let info = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index,
            ..Default::default()
        };
        Ok(self.device.allocate_memory(&info, None)?)
    }

    pub unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Buffer> {
        let info = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let handle = self.device.create_buffer(&info, None).context("create_buffer")?;
        let req = self.device.get_buffer_memory_requirements(handle);
        let memory = match self.allocate(req, properties) {
            Ok(m) => m,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                return Err(e.into());
            }
        };
        or_release(
            self.device.bind_buffer_memory(handle, memory, 0),
            "bind_buffer_memory",
            || {
                self.device.destroy_buffer(handle, None);
                self.device.free_memory(memory, None);
            },
        )?;
        Ok(Buffer {
            handle,
            memory,
            size,
        })
    }

    pub unsafe fn create_mapped_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<MappedBuffer> {
        let buffer = self.create_buffer(
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let raw = or_release(
            self.device
                .map_memory(buffer.memory, 0, size, vk::MemoryMapFlags::empty()),
            "map_memory",
            || self.destroy_buffer(buffer),
        )?;
        let Some(ptr) = NonNull::new(raw.cast::<u8>()) else {
            self.destroy_buffer(buffer);
            bail!("map_memory returned a null pointer");
        };
        Ok(MappedBuffer { buffer, ptr })
    }

    pub unsafe fn create_image(&self, desc: &ImageDesc) -> Result<Image> {
        let info = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format: desc.format,
            extent: vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: desc.usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let handle = self.device.create_image(&info, None).context("create_image")?;
        let req = self.device.get_image_memory_requirements(handle);
        let memory = match self.allocate(req, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(m) => m,
            Err(e) => {
                self.device.destroy_image(handle, None);
                return Err(e.into());
            }
        };
        or_release(
            self.device.bind_image_memory(handle, memory, 0),
            "bind_image_memory",
            || {
                self.device.destroy_image(handle, None);
                self.device.free_memory(memory, None);
            },
        )?;
        Ok(Image {
            handle,
            memory,
            format: desc.format,
            extent: desc.extent,
        })
    }

    pub unsafe fn destroy_buffer(&self, buffer: Buffer) {
        self.device.destroy_buffer(buffer.handle, None);
        self.device.free_memory(buffer.memory, None);
    }

    pub unsafe fn destroy_mapped_buffer(&self, mapped: MappedBuffer) {
        self.device.unmap_memory(mapped.buffer.memory);
        self.destroy_buffer(mapped.buffer);
    }

    pub unsafe fn destroy_image(&self, image: Image) {
        self.device.destroy_image(image.handle, None);
        self.device.free_memory(image.memory, None);
    }
}

/// Passes `result` through, running `release` first when it failed.
fn or_release<T>(result: VkResult<T>, what: &'static str, release: impl FnOnce()) -> Result<T> {
    if result.is_err() {
        release();
    }
    result.context(what)
}

pub unsafe fn create_image_view(
    device: &ash::Device,
    image: &Image,
    aspect_mask: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let info = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image: image.handle,
        view_type: vk::ImageViewType::TYPE_2D,
        format: image.format,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    };
    device.create_image_view(&info, None).context("create_image_view")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn props(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut p = vk::PhysicalDeviceMemoryProperties::default();
        p.memory_type_count = flags.len() as u32;
        for (i, &f) in flags.iter().enumerate() {
            p.memory_types[i].property_flags = f;
        }
        p
    }

    const DEVICE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    );

    #[test]
    fn picks_first_type_with_all_required_flags() {
        let p = props(&[DEVICE, HOST, HOST | DEVICE]);
        assert_eq!(find_memory_type_index(&p, 0b111, HOST).ok(), Some(1));
        assert_eq!(find_memory_type_index(&p, 0b111, DEVICE).ok(), Some(0));
        assert_eq!(find_memory_type_index(&p, 0b111, HOST | DEVICE).ok(), Some(2));
    }

    #[test]
    fn respects_type_bits() {
        let p = props(&[HOST, HOST]);
        assert_eq!(find_memory_type_index(&p, 0b10, HOST).ok(), Some(1));
    }

    #[test]
    fn partial_flag_match_is_not_enough() {
        let p = props(&[vk::MemoryPropertyFlags::HOST_VISIBLE]);
        let err = find_memory_type_index(&p, 0b1, HOST).unwrap_err();
        assert!(matches!(
            err,
            AllocationError::NoCompatibleMemoryType { type_bits: 1, .. }
        ));
    }

    #[test]
    fn failed_bind_releases_the_half_built_object() {
        let released = Cell::new(0);
        let err = or_release(
            Err::<(), _>(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            "bind_buffer_memory",
            || released.set(released.get() + 1),
        )
        .unwrap_err();
        assert_eq!(released.get(), 1);
        assert!(err.to_string().contains("bind_buffer_memory"));

        let ok = or_release(Ok(7u32), "map_memory", || released.set(released.get() + 1));
        assert_eq!(ok.ok(), Some(7));
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn scan_is_deterministic() {
        let p = props(&[DEVICE, DEVICE, DEVICE]);
        let first = find_memory_type_index(&p, 0b110, DEVICE).ok();
        for _ in 0..8 {
            assert_eq!(find_memory_type_index(&p, 0b110, DEVICE).ok(), first);
        }
        assert_eq!(first, Some(1));
    }
}
