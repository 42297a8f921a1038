// SPDX-License-Identifier: CEPL-1.0
//! One-shot transfer submissions. Safe to use from several loader threads at once:
//! each call records into its own transient command pool and only the queue is shared.
use crate::memory::{Allocator, Buffer, Image};
use anyhow::{Context, Result};
use ash::vk;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub fn lock_queue(queue: &Mutex<vk::Queue>) -> MutexGuard<'_, vk::Queue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct UploadContext<'a> {
    allocator: &'a Allocator,
    queue: &'a Mutex<vk::Queue>,
    queue_family: u32,
}

impl<'a> UploadContext<'a> {
    pub fn new(allocator: &'a Allocator, queue: &'a Mutex<vk::Queue>, queue_family: u32) -> Self {
        Self {
            allocator,
            queue,
            queue_family,
        }
    }

    pub fn allocator(&self) -> &'a Allocator {
        self.allocator
    }

    /// Records `record` into a fresh command buffer, submits it and waits for completion.
    pub unsafe fn submit_once<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = self.allocator.device();
        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            flags: vk::CommandPoolCreateFlags::TRANSIENT,
            queue_family_index: self.queue_family,
            ..Default::default()
        };
        let pool = device
            .create_command_pool(&pool_info, None)
            .context("create upload command pool")?;
        let result = self.record_and_wait(pool, record);
        // frees the command buffer with it
        device.destroy_command_pool(pool, None);
        result
    }

    unsafe fn record_and_wait<F>(&self, pool: vk::CommandPool, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = self.allocator.device();
        let alloc = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let cmd = device
            .allocate_command_buffers(&alloc)
            .context("allocate upload command buffer")?[0];

        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        device.begin_command_buffer(cmd, &begin)?;
        record(device, cmd);
        device.end_command_buffer(cmd)?;

        let fence = device
            .create_fence(&vk::FenceCreateInfo::default(), None)
            .context("create upload fence")?;
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            ..Default::default()
        };
        let submitted = {
            let queue = lock_queue(self.queue);
            device.queue_submit(*queue, std::slice::from_ref(&submit), fence)
        };
        let waited = submitted
            .and_then(|()| device.wait_for_fences(&[fence], true, u64::MAX))
            .context("upload submit");
        device.destroy_fence(fence, None);
        waited
    }

    /// Host-visible buffer holding a copy of `bytes`.
    pub unsafe fn staging_buffer(&self, bytes: &[u8]) -> Result<Buffer> {
        let staging = self.allocator.create_buffer(
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let device = self.allocator.device();
        let ptr = match device.map_memory(
            staging.memory,
            0,
            staging.size,
            vk::MemoryMapFlags::empty(),
        ) {
            Ok(p) => p,
            Err(e) => {
                self.allocator.destroy_buffer(staging);
                return Err(e).context("map staging buffer");
            }
        };
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
        device.unmap_memory(staging.memory);
        Ok(staging)
    }

    /// Device-local buffer filled from `bytes` through a staging copy.
    pub unsafe fn upload_buffer(&self, bytes: &[u8], usage: vk::BufferUsageFlags) -> Result<Buffer> {
        let size = bytes.len() as vk::DeviceSize;
        let staging = self.staging_buffer(bytes)?;
        let dst = match self.allocator.create_buffer(
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) {
            Ok(b) => b,
            Err(e) => {
                self.allocator.destroy_buffer(staging);
                return Err(e);
            }
        };
        let copied = self.submit_once(|device, cmd| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            };
            device.cmd_copy_buffer(cmd, staging.handle, dst.handle, std::slice::from_ref(&region));
        });
        self.allocator.destroy_buffer(staging);
        match copied {
            Ok(()) => Ok(dst),
            Err(e) => {
                self.allocator.destroy_buffer(dst);
                Err(e)
            }
        }
    }

    /// Copies tightly packed pixels into `image`, leaving it shader-readable.
    pub unsafe fn upload_image(&self, image: &Image, pixels: &[u8]) -> Result<()> {
        let staging = self.staging_buffer(pixels)?;
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let result = self.submit_once(|device, cmd| {
            let to_transfer = vk::ImageMemoryBarrier {
                s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
                src_access_mask: vk::AccessFlags::empty(),
                dst_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                image: image.handle,
                subresource_range: range,
                ..Default::default()
            };
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );

            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                image_extent: vk::Extent3D {
                    width: image.extent.width,
                    height: image.extent.height,
                    depth: 1,
                },
            };
            device.cmd_copy_buffer_to_image(
                cmd,
                staging.handle,
                image.handle,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            let to_shader = vk::ImageMemoryBarrier {
                s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
                src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                dst_access_mask: vk::AccessFlags::SHADER_READ,
                old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                image: image.handle,
                subresource_range: range,
                ..Default::default()
            };
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_shader],
            );
        });
        self.allocator.destroy_buffer(staging);
        result
    }
}
