// SPDX-License-Identifier: CEPL-1.0
use crate::assets::{load_assets, LoadedAssets};
use crate::context::DeviceContext;
use crate::descriptors::SetLayouts;
use crate::frame::{
    plan_frame, AcquireOutcome, DrawPlan, FrameBackend, FrameData, FrameLoop, PresentOutcome,
};
use crate::memory::Allocator;
use crate::pipeline::{
    create_or_load_pipeline_cache, pipeline_cache_path, save_pipeline_cache, PipelineKind,
    PipelineSet,
};
use crate::swapchain::{SurfacePlan, Swapchain, SwapchainConfig, SwapchainState};
use crate::upload::{lock_queue, UploadContext};
use anyhow::{anyhow, Context, Result};
use ash::khr::swapchain;
use ash::vk;
use orrery_math::Projection;
use orrery_render::{AssetPack, RenderScene, RenderSettings, RenderSize, Renderer};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub struct VkRenderer {
    frames: FrameLoop,
    gpu: GpuState,
}

/// Device-side half of the renderer; [`FrameLoop`] drives it through [`FrameBackend`].
struct GpuState {
    allocator: Allocator,
    swapchain_loader: swapchain::Device,
    layouts: SetLayouts,
    pipeline_cache: vk::PipelineCache,
    cache_path: Option<PathBuf>,
    pipelines: PipelineSet,
    swapchain: Option<Swapchain>,
    state: SwapchainState,
    assets: Option<LoadedAssets>,
    settings: RenderSettings,
    size: RenderSize,
    projection: Projection,
    // dropped after the Drop impl below has released everything it owns
    ctx: DeviceContext,
}

impl GpuState {
    fn device(&self) -> &ash::Device {
        &self.ctx.device
    }

    fn chain(&self) -> Result<&Swapchain> {
        self.swapchain
            .as_ref()
            .ok_or_else(|| anyhow!("no active swapchain"))
    }

    fn config(&self) -> SwapchainConfig {
        SwapchainConfig {
            hint: self.size,
            vsync: self.settings.vsync,
            vsync_mode: self.settings.vsync_mode,
            max_objects: self.settings.max_objects,
        }
    }

    /// Tears down the current swapchain and builds a new one, or parks in
    /// `Recreating` while the surface has no area.
    unsafe fn rebuild_swapchain(&mut self) -> Result<()> {
        self.device()
            .device_wait_idle()
            .context("device_wait_idle before swapchain rebuild")?;
        if let Some(old) = self.swapchain.take() {
            old.destroy(&self.swapchain_loader, &self.allocator);
        }
        self.state = SwapchainState::Recreating;

        if self.size.is_zero_area() {
            debug!("surface has no area; deferring swapchain");
            return Ok(());
        }
        let plan = SurfacePlan::query(&self.ctx, &self.config())?;
        if plan.is_zero_area() {
            debug!("surface reports zero extent; deferring swapchain");
            return Ok(());
        }

        if plan.format.format != self.pipelines.color_format {
            info!(from = ?self.pipelines.color_format, to = ?plan.format.format, "surface format changed; rebuilding pipelines");
            let rebuilt = PipelineSet::build(
                self.device(),
                self.pipeline_cache,
                plan.format.format,
                self.ctx.depth_format,
                &self.layouts,
                self.settings.shader_dir.as_deref(),
            )?;
            let old = std::mem::replace(&mut self.pipelines, rebuilt);
            old.destroy(self.device());
        }

        let chain = Swapchain::create(
            &self.ctx,
            &self.swapchain_loader,
            &self.allocator,
            &plan,
            &self.pipelines,
            &self.layouts,
            self.settings.max_objects,
            vk::SwapchainKHR::null(),
        )?;
        self.swapchain = Some(chain);
        self.state = SwapchainState::Active;
        Ok(())
    }

    unsafe fn record_passes(&self, slot: usize, image_index: u32, plan: &DrawPlan) -> Result<()> {
        let d = self.device();
        let chain = self.chain()?;
        let assets = self
            .assets
            .as_ref()
            .ok_or_else(|| anyhow!("assets not loaded"))?;
        let frame = &chain.slots[slot];
        let target = chain
            .slots
            .get(image_index as usize)
            .ok_or_else(|| anyhow!("acquired image {image_index} has no frame slot"))?;
        let cmd = frame.command_buffer;

        d.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .context("reset_command_buffer")?;
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        d.begin_command_buffer(cmd, &begin)
            .context("begin_command_buffer")?;

        let extent = chain.extent;
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        d.cmd_set_viewport(cmd, 0, &[viewport]);
        d.cmd_set_scissor(cmd, 0, &[scissor]);
        d.cmd_bind_vertex_buffers(cmd, 0, &[assets.vertex_buffer.handle], &[0]);
        d.cmd_bind_index_buffer(cmd, assets.index_buffer.handle, 0, vk::IndexType::UINT32);

        let clear = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.settings.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        for kind in PipelineKind::ALL {
            let pipeline = self.pipelines.get(kind);
            let clear_count = if pipeline.depth_tested { 2 } else { 1 };
            let rp_begin = vk::RenderPassBeginInfo {
                s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
                render_pass: pipeline.render_pass,
                framebuffer: target.framebuffer(kind),
                render_area: scissor,
                clear_value_count: clear_count,
                p_clear_values: clear.as_ptr(),
                ..Default::default()
            };
            d.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
            d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.handle);
            d.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout,
                0,
                &[frame.descriptor_set(kind)],
                &[],
            );
            match kind {
                PipelineKind::Sky => {
                    d.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        pipeline.layout,
                        1,
                        &[assets.cubemap.descriptor_set],
                        &[],
                    );
                    d.cmd_draw(cmd, 6, 1, 0, 0);
                }
                PipelineKind::Standard => {
                    for draw in &plan.draws {
                        let texture = assets
                            .textures
                            .get(draw.texture)
                            .ok_or_else(|| anyhow!("texture {:?} missing", draw.texture))?;
                        d.cmd_bind_descriptor_sets(
                            cmd,
                            vk::PipelineBindPoint::GRAPHICS,
                            pipeline.layout,
                            1,
                            &[texture.descriptor_set],
                            &[],
                        );
                        d.cmd_draw_indexed(
                            cmd,
                            draw.index_count,
                            draw.instance_count,
                            draw.first_index,
                            0,
                            draw.first_instance,
                        );
                    }
                }
            }
            d.cmd_end_render_pass(cmd);
        }

        d.end_command_buffer(cmd).context("end_command_buffer")?;
        Ok(())
    }
}

impl FrameBackend for GpuState {
    fn slot_count(&self) -> usize {
        self.swapchain.as_ref().map_or(0, Swapchain::slot_count)
    }

    fn wait_in_flight(&mut self, slot: usize) -> Result<()> {
        let fence = self.chain()?.slots[slot].in_flight;
        unsafe { self.device().wait_for_fences(&[fence], true, u64::MAX) }
            .context("wait_for_fences")
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let chain = self.chain()?;
        let acquired = unsafe {
            self.swapchain_loader.acquire_next_image(
                chain.handle,
                u64::MAX,
                chain.slots[slot].image_available,
                vk::Fence::null(),
            )
        };
        match acquired {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_INCOMPATIBLE_DISPLAY_KHR) => {
                Ok(AcquireOutcome::Stale)
            }
            Err(e) => Err(e).context("acquire_next_image"),
        }
    }

    fn reset_in_flight(&mut self, slot: usize) -> Result<()> {
        let fence = self.chain()?.slots[slot].in_flight;
        unsafe { self.device().reset_fences(&[fence]) }.context("reset_fences")
    }

    fn write_frame(&mut self, slot: usize, frame: &FrameData) -> Result<()> {
        let chain = self
            .swapchain
            .as_mut()
            .ok_or_else(|| anyhow!("no active swapchain"))?;
        let s = &mut chain.slots[slot];
        s.camera_vectors.write(std::slice::from_ref(&frame.vectors))?;
        s.camera_matrices.write(std::slice::from_ref(&frame.matrices))?;
        s.objects.write(&frame.transforms)?;
        Ok(())
    }

    fn record(&mut self, slot: usize, image_index: u32, plan: &DrawPlan) -> Result<()> {
        unsafe { self.record_passes(slot, image_index, plan) }
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let frame = &self.chain()?.slots[slot];
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &frame.image_available,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &frame.command_buffer,
            signal_semaphore_count: 1,
            p_signal_semaphores: &frame.render_finished,
            ..Default::default()
        };
        let queue = lock_queue(&self.ctx.graphics_queue);
        unsafe {
            self.device()
                .queue_submit(*queue, std::slice::from_ref(&submit), frame.in_flight)
        }
        .context("queue_submit")
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let chain = self.chain()?;
        let info = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &chain.slots[slot].render_finished,
            swapchain_count: 1,
            p_swapchains: &chain.handle,
            p_image_indices: &image_index,
            ..Default::default()
        };
        let presented = unsafe {
            self.swapchain_loader
                .queue_present(self.ctx.present_queue, &info)
        };
        match presented {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
            Err(e) => Err(e).context("queue_present"),
        }
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        info!("swapchain stale; recreating");
        unsafe { self.rebuild_swapchain() }
    }
}

// STRICT TEARDOWN ORDER:
// - device_wait_idle()
// - swapchain and frame slots (framebuffers reference pipeline render passes)
// - assets, then pipelines, then set layouts
// - pipeline cache saved, then destroyed
// - DeviceContext (device, surface, instance) drops last as a field
impl Drop for GpuState {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.device_wait_idle().ok();
            if let Some(chain) = self.swapchain.take() {
                chain.destroy(&self.swapchain_loader, &self.allocator);
            }
            if let Some(assets) = self.assets.take() {
                assets.destroy(&self.allocator);
            }
            self.pipelines.destroy(&self.ctx.device);
            self.layouts.destroy(&self.ctx.device);
            if let Some(path) = &self.cache_path {
                if let Err(e) = save_pipeline_cache(&self.ctx.device, self.pipeline_cache, path) {
                    warn!(error = %e, path = %path.display(), "pipeline cache not saved");
                }
            }
            self.ctx
                .device
                .destroy_pipeline_cache(self.pipeline_cache, None);
        }
        self.state = SwapchainState::Destroyed;
    }
}

unsafe fn build_gpu(
    window: &dyn HasWindowHandle,
    display: &dyn HasDisplayHandle,
    size: RenderSize,
    settings: &RenderSettings,
) -> Result<GpuState> {
    let ctx = DeviceContext::new(window, display)?;
    let allocator = Allocator::new(&ctx.instance, ctx.phys, &ctx.device);
    let swapchain_loader = swapchain::Device::new(&ctx.instance, &ctx.device);
    let layouts = SetLayouts::create(&ctx.device)?;

    let cache_path = settings
        .pipeline_cache
        .then(|| pipeline_cache_path(&ctx.properties()));
    let pipeline_cache = match create_or_load_pipeline_cache(&ctx.device, cache_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            layouts.destroy(&ctx.device);
            return Err(e);
        }
    };

    let plan = SurfacePlan::query(
        &ctx,
        &SwapchainConfig {
            hint: size,
            vsync: settings.vsync,
            vsync_mode: settings.vsync_mode,
            max_objects: settings.max_objects,
        },
    );
    let pipelines = plan.and_then(|plan| {
        PipelineSet::build(
            &ctx.device,
            pipeline_cache,
            plan.format.format,
            ctx.depth_format,
            &layouts,
            settings.shader_dir.as_deref(),
        )
    });
    let pipelines = match pipelines {
        Ok(p) => p,
        Err(e) => {
            ctx.device.destroy_pipeline_cache(pipeline_cache, None);
            layouts.destroy(&ctx.device);
            return Err(e);
        }
    };

    let mut gpu = GpuState {
        allocator,
        swapchain_loader,
        layouts,
        pipeline_cache,
        cache_path,
        pipelines,
        swapchain: None,
        state: SwapchainState::Uninitialized,
        assets: None,
        settings: settings.clone(),
        size,
        projection: Projection::default(),
        ctx,
    };
    gpu.rebuild_swapchain()?;
    Ok(gpu)
}

impl VkRenderer {
    pub fn state(&self) -> SwapchainState {
        self.gpu.state
    }

    pub fn frame_slot(&self) -> usize {
        self.frames.current_slot()
    }

    fn recreate(&mut self) -> Result<()> {
        unsafe { self.gpu.rebuild_swapchain() }?;
        self.frames.reset();
        Ok(())
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: &RenderSettings,
    ) -> Result<Self> {
        let gpu = unsafe { build_gpu(window, display, size, settings) }?;
        Ok(Self {
            frames: FrameLoop::default(),
            gpu,
        })
    }

    fn load_assets(&mut self, pack: &AssetPack) -> Result<()> {
        let gpu = &mut self.gpu;
        unsafe {
            if let Some(previous) = gpu.assets.take() {
                gpu.ctx
                    .device
                    .device_wait_idle()
                    .context("device_wait_idle before asset reload")?;
                previous.destroy(&gpu.allocator);
            }
            let upload = UploadContext::new(
                &gpu.allocator,
                &gpu.ctx.graphics_queue,
                gpu.ctx.families.graphics,
            );
            gpu.assets = Some(load_assets(&upload, &gpu.layouts, pack)?);
        }
        Ok(())
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        self.gpu.size = size;
        if size.is_zero_area() {
            if self.gpu.state == SwapchainState::Active {
                debug!("window minimized; rendering paused");
                self.gpu.state = SwapchainState::Recreating;
            }
            return Ok(());
        }
        let unchanged = self.gpu.state == SwapchainState::Active
            && self.gpu.swapchain.as_ref().is_some_and(|c| {
                c.extent.width == size.width && c.extent.height == size.height
            });
        if unchanged {
            return Ok(());
        }
        self.recreate()
    }

    fn render(&mut self, scene: &dyn RenderScene) -> Result<()> {
        if self.gpu.state != SwapchainState::Active {
            return Ok(());
        }
        let assets = self
            .gpu
            .assets
            .as_ref()
            .ok_or_else(|| anyhow!("render called before load_assets"))?;
        let (plan, transforms) = plan_frame(
            &assets.registry,
            &scene.mapped_objects(),
            self.gpu.settings.max_objects,
        )?;

        let extent = self.gpu.chain()?.extent;
        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let camera = scene.camera();
        let frame = FrameData {
            vectors: camera.vectors().with_frustum(aspect, &self.gpu.projection),
            matrices: camera.matrices(aspect, &self.gpu.projection),
            transforms,
        };
        self.frames.run(&mut self.gpu, &frame, &plan)?;
        Ok(())
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.gpu.settings.clear_color = rgba;
    }

    fn set_vsync(&mut self, on: bool) {
        if self.gpu.settings.vsync == on {
            return;
        }
        self.gpu.settings.vsync = on;
        if self.gpu.state == SwapchainState::Active {
            if let Err(e) = self.recreate() {
                warn!(error = %e, "swapchain rebuild after vsync change failed");
            }
        }
    }
}
