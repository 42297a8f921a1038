// SPDX-License-Identifier: CEPL-1.0
//! Swapchain plus one frame slot per presentable image.
//!
//! Creation order: swapchain handle, command pool, descriptor pool, then for each
//! image a slot built as mapped buffers, color view, depth image and view,
//! framebuffers, command buffer, sync objects and frame descriptor sets.
//! Teardown runs in reverse and recreation is a full teardown followed by creation.
use crate::context::{DeviceContext, QueueFamilies};
use crate::descriptors::{self, SetLayouts, FRAME_BINDINGS};
use crate::memory::{create_image_view, Allocator, Image, ImageDesc, MappedBuffer};
use crate::pipeline::{PipelineKind, PipelineSet};
use anyhow::{Context, Result};
use ash::khr::swapchain;
use ash::vk;
use orrery_math::{CameraMatrices, CameraVectors, Mat4};
use orrery_render::{RenderSize, VsyncMode};
use std::mem::size_of;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    Active,
    /// Stale or zero-sized; nothing renders until a rebuild succeeds.
    Recreating,
    Destroyed,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SwapchainConfig {
    pub hint: RenderSize,
    pub vsync: bool,
    pub vsync_mode: VsyncMode,
    pub max_objects: usize,
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    vsync: bool,
    mode: VsyncMode,
) -> vk::PresentModeKHR {
    let preference: &[vk::PresentModeKHR] = match (vsync, mode) {
        (false, _) => &[
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ],
        (true, VsyncMode::Mailbox) => &[vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO],
        (true, VsyncMode::Fifo) => &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
    };
    preference
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 means no cap).
pub fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        wanted
    } else {
        wanted.min(caps.max_image_count)
    }
}

/// Depth views used as attachments cover the stencil aspect too when the format has one.
pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT
        | vk::Format::D16_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

/// Images are shared concurrently only when drawing and presenting use different families.
pub fn sharing_mode(families: &QueueFamilies) -> (vk::SharingMode, Vec<u32>) {
    if families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, families.unique())
    }
}

/// Everything the surface dictates about the next swapchain.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfacePlan {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SurfacePlan {
    pub unsafe fn query(ctx: &DeviceContext, cfg: &SwapchainConfig) -> Result<Self> {
        let caps = ctx
            .surface_loader
            .get_physical_device_surface_capabilities(ctx.phys, ctx.surface)
            .context("get_physical_device_surface_capabilities")?;
        let formats = ctx
            .surface_loader
            .get_physical_device_surface_formats(ctx.phys, ctx.surface)
            .context("get_physical_device_surface_formats")?;
        let modes = ctx
            .surface_loader
            .get_physical_device_surface_present_modes(ctx.phys, ctx.surface)
            .context("get_physical_device_surface_present_modes")?;

        let format = choose_surface_format(&formats).context("surface reports no formats")?;
        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };
        Ok(Self {
            format,
            present_mode: choose_present_mode(&modes, cfg.vsync, cfg.vsync_mode),
            extent: extent_from_caps(&caps, cfg.hint),
            image_count: image_count(&caps),
            pre_transform,
        })
    }

    pub fn is_zero_area(&self) -> bool {
        self.extent.width == 0 || self.extent.height == 0
    }
}

/// Per-image resources. Sync and buffers are used by frame slot index; the
/// image, views and framebuffers by acquired image index.
pub struct FrameSlot {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub depth: Image,
    pub depth_view: vk::ImageView,
    /// Indexed by [`PipelineKind::index`].
    pub framebuffers: [vk::Framebuffer; 2],
    pub command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
    pub camera_vectors: MappedBuffer,
    pub camera_matrices: MappedBuffer,
    pub objects: MappedBuffer,
    /// Frame set per pass, indexed by [`PipelineKind::index`].
    pub descriptor_sets: [vk::DescriptorSet; 2],
}

impl FrameSlot {
    pub fn framebuffer(&self, kind: PipelineKind) -> vk::Framebuffer {
        self.framebuffers[kind.index()]
    }

    pub fn descriptor_set(&self, kind: PipelineKind) -> vk::DescriptorSet {
        self.descriptor_sets[kind.index()]
    }

    /// Capacity of the object buffer in transforms.
    pub fn object_capacity(&self) -> usize {
        self.objects.capacity() / size_of::<Mat4>()
    }

    unsafe fn destroy(self, allocator: &Allocator) {
        let d = allocator.device();
        d.destroy_fence(self.in_flight, None);
        d.destroy_semaphore(self.render_finished, None);
        d.destroy_semaphore(self.image_available, None);
        for fb in self.framebuffers {
            d.destroy_framebuffer(fb, None);
        }
        d.destroy_image_view(self.depth_view, None);
        allocator.destroy_image(self.depth);
        d.destroy_image_view(self.view, None);
        allocator.destroy_mapped_buffer(self.objects);
        allocator.destroy_mapped_buffer(self.camera_matrices);
        allocator.destroy_mapped_buffer(self.camera_vectors);
    }
}

struct SlotBuilder<'a> {
    allocator: &'a Allocator,
    plan: &'a SurfacePlan,
    depth_format: vk::Format,
    pipelines: &'a PipelineSet,
    layouts: &'a SetLayouts,
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    objects_size: vk::DeviceSize,
}

impl SlotBuilder<'_> {
    unsafe fn build(&self, image: vk::Image) -> Result<FrameSlot> {
        let a = self.allocator;
        let vectors = a.create_mapped_buffer(
            size_of::<CameraVectors>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;
        let matrices = match a.create_mapped_buffer(
            size_of::<CameraMatrices>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        ) {
            Ok(b) => b,
            Err(e) => {
                a.destroy_mapped_buffer(vectors);
                return Err(e);
            }
        };
        let objects = match a.create_mapped_buffer(self.objects_size, vk::BufferUsageFlags::STORAGE_BUFFER) {
            Ok(b) => b,
            Err(e) => {
                a.destroy_mapped_buffer(matrices);
                a.destroy_mapped_buffer(vectors);
                return Err(e);
            }
        };

        // Null handles are valid to destroy, so a half-built slot tears down cleanly.
        let mut slot = FrameSlot {
            image,
            view: vk::ImageView::null(),
            depth: Image {
                handle: vk::Image::null(),
                memory: vk::DeviceMemory::null(),
                format: self.depth_format,
                extent: self.plan.extent,
            },
            depth_view: vk::ImageView::null(),
            framebuffers: [vk::Framebuffer::null(); 2],
            command_buffer: vk::CommandBuffer::null(),
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight: vk::Fence::null(),
            camera_vectors: vectors,
            camera_matrices: matrices,
            objects,
            descriptor_sets: [vk::DescriptorSet::null(); 2],
        };
        match self.populate(&mut slot) {
            Ok(()) => Ok(slot),
            Err(e) => {
                slot.destroy(a);
                Err(e)
            }
        }
    }

    unsafe fn populate(&self, slot: &mut FrameSlot) -> Result<()> {
        let a = self.allocator;
        let d = a.device();

        let color = Image {
            handle: slot.image,
            memory: vk::DeviceMemory::null(),
            format: self.plan.format.format,
            extent: self.plan.extent,
        };
        slot.view = create_image_view(d, &color, vk::ImageAspectFlags::COLOR)?;

        slot.depth = a.create_image(&ImageDesc::depth(self.plan.extent, self.depth_format))?;
        slot.depth_view = create_image_view(d, &slot.depth, depth_aspect(self.depth_format))?;

        for kind in PipelineKind::ALL {
            let pipeline = self.pipelines.get(kind);
            let attachments: Vec<vk::ImageView> = if pipeline.depth_tested {
                vec![slot.view, slot.depth_view]
            } else {
                vec![slot.view]
            };
            let info = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass: pipeline.render_pass,
                attachment_count: attachments.len() as u32,
                p_attachments: attachments.as_ptr(),
                width: self.plan.extent.width,
                height: self.plan.extent.height,
                layers: 1,
                ..Default::default()
            };
            slot.framebuffers[kind.index()] = d
                .create_framebuffer(&info, None)
                .with_context(|| format!("{} framebuffer", kind.name()))?;
        }

        let alloc = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        slot.command_buffer = d
            .allocate_command_buffers(&alloc)
            .context("allocate_command_buffers")?
            .into_iter()
            .next()
            .context("no command buffer allocated")?;

        let sem_info = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        slot.image_available = d.create_semaphore(&sem_info, None).context("create_semaphore")?;
        slot.render_finished = d.create_semaphore(&sem_info, None).context("create_semaphore")?;
        let fence_info = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        slot.in_flight = d.create_fence(&fence_info, None).context("create_fence")?;

        for kind in PipelineKind::ALL {
            let set = descriptors::allocate_set(d, self.descriptor_pool, self.layouts.frame)?;
            let camera = match kind {
                PipelineKind::Sky => &slot.camera_vectors,
                PipelineKind::Standard => &slot.camera_matrices,
            };
            descriptors::write_buffer(
                d,
                set,
                FRAME_BINDINGS[0].binding,
                FRAME_BINDINGS[0].ty,
                camera.buffer.handle,
                camera.buffer.size,
            );
            descriptors::write_buffer(
                d,
                set,
                FRAME_BINDINGS[1].binding,
                FRAME_BINDINGS[1].ty,
                slot.objects.buffer.handle,
                slot.objects.buffer.size,
            );
            slot.descriptor_sets[kind.index()] = set;
        }
        Ok(())
    }
}

/// Builds one item per swapchain image into `out`. On failure `out` keeps the
/// items already built so the caller can release them.
pub fn build_per_image<T>(
    out: &mut Vec<T>,
    images: &[vk::Image],
    mut build: impl FnMut(usize, vk::Image) -> Result<T>,
) -> Result<()> {
    out.reserve(images.len());
    for (i, &image) in images.iter().enumerate() {
        out.push(build(i, image)?);
    }
    Ok(())
}

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub slots: Vec<FrameSlot>,
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
}

impl Swapchain {
    /// Builds the swapchain and its frame slots. `old` is retired by the caller afterwards.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn create(
        ctx: &DeviceContext,
        loader: &swapchain::Device,
        allocator: &Allocator,
        plan: &SurfacePlan,
        pipelines: &PipelineSet,
        layouts: &SetLayouts,
        max_objects: usize,
        old: vk::SwapchainKHR,
    ) -> Result<Self> {
        let (sharing, family_indices) = sharing_mode(&ctx.families);
        let info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: ctx.surface,
            min_image_count: plan.image_count,
            image_format: plan.format.format,
            image_color_space: plan.format.color_space,
            image_extent: plan.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing,
            queue_family_index_count: family_indices.len() as u32,
            p_queue_family_indices: family_indices.as_ptr(),
            pre_transform: plan.pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: plan.present_mode,
            clipped: vk::TRUE,
            old_swapchain: old,
            ..Default::default()
        };
        let handle = loader
            .create_swapchain(&info, None)
            .context("create_swapchain")?;

        let mut chain = Self {
            handle,
            format: plan.format.format,
            extent: plan.extent,
            present_mode: plan.present_mode,
            slots: Vec::new(),
            command_pool: vk::CommandPool::null(),
            descriptor_pool: vk::DescriptorPool::null(),
        };
        if let Err(e) = chain.build_slots(ctx, loader, allocator, plan, pipelines, layouts, max_objects) {
            chain.destroy(loader, allocator);
            return Err(e);
        }

        info!(
            format = ?chain.format,
            present_mode = ?chain.present_mode,
            width = chain.extent.width,
            height = chain.extent.height,
            images = chain.slots.len(),
            "swapchain created"
        );
        Ok(chain)
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn build_slots(
        &mut self,
        ctx: &DeviceContext,
        loader: &swapchain::Device,
        allocator: &Allocator,
        plan: &SurfacePlan,
        pipelines: &PipelineSet,
        layouts: &SetLayouts,
        max_objects: usize,
    ) -> Result<()> {
        let d = allocator.device();
        let images = loader
            .get_swapchain_images(self.handle)
            .context("get_swapchain_images")?;
        let count = images.len() as u32;

        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            queue_family_index: ctx.families.graphics,
            ..Default::default()
        };
        self.command_pool = d
            .create_command_pool(&pool_info, None)
            .context("create_command_pool")?;

        let sets = count * PipelineKind::ALL.len() as u32;
        self.descriptor_pool =
            descriptors::create_pool(d, sets, &descriptors::pool_sizes(&FRAME_BINDINGS, sets))?;

        let builder = SlotBuilder {
            allocator,
            plan,
            depth_format: ctx.depth_format,
            pipelines,
            layouts,
            command_pool: self.command_pool,
            descriptor_pool: self.descriptor_pool,
            objects_size: (max_objects.max(1) * size_of::<Mat4>()) as vk::DeviceSize,
        };
        build_per_image(&mut self.slots, &images, |i, image| {
            builder
                .build(image)
                .with_context(|| format!("frame slot {i}"))
        })?;
        debug!(slots = self.slots.len(), "frame slots built");
        Ok(())
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Caller guarantees the device is idle.
    pub unsafe fn destroy(self, loader: &swapchain::Device, allocator: &Allocator) {
        let d = allocator.device();
        for slot in self.slots {
            slot.destroy(allocator);
        }
        // frees the slots' descriptor sets and command buffers with them
        d.destroy_descriptor_pool(self.descriptor_pool, None);
        d.destroy_command_pool(self.command_pool, None);
        loader.destroy_swapchain(self.handle, None);
    }
}
