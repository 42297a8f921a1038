// SPDX-License-Identifier: CEPL-1.0
//! Render passes and graphics pipelines for the sky and standard passes.
use crate::descriptors::SetLayouts;
use crate::mesh::Vertex;
use anyhow::{anyhow, Context, Result};
use ash::util::read_spv;
use ash::vk;
use std::ffi::CStr;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::{fs, ptr};
use tracing::{debug, warn};

const SKY_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/sky.vert.spv"));
const SKY_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/sky.frag.spv"));
const STANDARD_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/standard.vert.spv"));
const STANDARD_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/standard.frag.spv"));

const ENTRY_POINT: &CStr = c"main";

/// Pass types, in the order they are recorded each frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Sky,
    Standard,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 2] = [PipelineKind::Sky, PipelineKind::Standard];

    pub fn index(self) -> usize {
        match self {
            PipelineKind::Sky => 0,
            PipelineKind::Standard => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PipelineKind::Sky => "sky",
            PipelineKind::Standard => "standard",
        }
    }

    pub fn depth_tested(self) -> bool {
        matches!(self, PipelineKind::Standard)
    }

    /// The first pass of a frame owns the color attachment outright.
    pub fn overwrites(self) -> bool {
        self == PipelineKind::ALL[0]
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShaderSource {
    Embedded(&'static [u8]),
    File(PathBuf),
}

impl ShaderSource {
    pub fn load(&self) -> Result<Vec<u32>> {
        match self {
            ShaderSource::Embedded(bytes) => {
                read_spv(&mut Cursor::new(*bytes)).context("read embedded SPIR-V")
            }
            ShaderSource::File(path) => {
                let bytes = fs::read(path)
                    .with_context(|| format!("read shader {}", path.display()))?;
                read_spv(&mut Cursor::new(&bytes[..]))
                    .with_context(|| format!("parse SPIR-V {}", path.display()))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub source: ShaderSource,
}

/// Built-in stages for `kind`, each replaced by `<dir>/<kind>.<stage>.spv` when that file exists.
pub fn shader_stages(kind: PipelineKind, shader_dir: Option<&Path>) -> Vec<ShaderStage> {
    let (vert, frag) = match kind {
        PipelineKind::Sky => (SKY_VERT, SKY_FRAG),
        PipelineKind::Standard => (STANDARD_VERT, STANDARD_FRAG),
    };
    [
        (vk::ShaderStageFlags::VERTEX, "vert", vert),
        (vk::ShaderStageFlags::FRAGMENT, "frag", frag),
    ]
    .into_iter()
    .map(|(stage, suffix, embedded)| {
        let source = shader_dir
            .map(|dir| dir.join(format!("{}.{suffix}.spv", kind.name())))
            .filter(|p| p.is_file())
            .map_or(ShaderSource::Embedded(embedded), |p| {
                debug!(shader = %p.display(), "using shader override");
                ShaderSource::File(p)
            });
        ShaderStage { stage, source }
    })
    .collect()
}

#[derive(Clone, Debug)]
pub struct PipelineBuildInfo {
    pub kind: PipelineKind,
    /// Clear the color attachment instead of loading what earlier passes drew.
    pub overwrite: bool,
    pub stages: Vec<ShaderStage>,
    pub color_format: vk::Format,
    pub depth_format: Option<vk::Format>,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
}

impl PipelineBuildInfo {
    pub fn for_kind(
        kind: PipelineKind,
        color_format: vk::Format,
        depth_format: vk::Format,
        layouts: &SetLayouts,
        shader_dir: Option<&Path>,
    ) -> Self {
        let material = match kind {
            PipelineKind::Sky => layouts.sky,
            PipelineKind::Standard => layouts.mesh,
        };
        Self {
            kind,
            overwrite: kind.overwrites(),
            stages: shader_stages(kind, shader_dir),
            color_format,
            depth_format: kind.depth_tested().then_some(depth_format),
            set_layouts: vec![layouts.frame, material],
        }
    }
}

pub fn color_attachment(overwrite: bool, format: vk::Format) -> vk::AttachmentDescription {
    let (load_op, initial_layout) = if overwrite {
        (vk::AttachmentLoadOp::CLEAR, vk::ImageLayout::UNDEFINED)
    } else {
        (vk::AttachmentLoadOp::LOAD, vk::ImageLayout::PRESENT_SRC_KHR)
    };
    vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    }
}

pub fn depth_attachment(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::DONT_CARE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ..Default::default()
    }
}

pub unsafe fn create_render_pass(
    device: &ash::Device,
    overwrite: bool,
    color_format: vk::Format,
    depth_format: Option<vk::Format>,
) -> Result<vk::RenderPass> {
    let mut attachments = vec![color_attachment(overwrite, color_format)];
    if let Some(fmt) = depth_format {
        attachments.push(depth_attachment(fmt));
    }
    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &color_ref,
        p_depth_stencil_attachment: if depth_format.is_some() {
            &depth_ref
        } else {
            ptr::null()
        },
        ..Default::default()
    };

    // orders this pass after the acquire wait and after any earlier pass on the same image
    let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: stages,
        dst_stage_mask: stages,
        src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ
            | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ..Default::default()
    };

    let info = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: attachments.len() as u32,
        p_attachments: attachments.as_ptr(),
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    device
        .create_render_pass(&info, None)
        .context("create_render_pass")
}

#[derive(Clone, Copy, Debug)]
pub struct Pipeline {
    pub kind: PipelineKind,
    pub handle: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub depth_tested: bool,
}

impl Pipeline {
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.handle, None);
        device.destroy_pipeline_layout(self.layout, None);
        device.destroy_render_pass(self.render_pass, None);
    }
}

unsafe fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: code.as_ptr(),
        code_size: code.len() * 4,
        ..Default::default()
    };
    device
        .create_shader_module(&info, None)
        .context("create_shader_module")
}

pub unsafe fn build_pipeline(
    device: &ash::Device,
    cache: vk::PipelineCache,
    info: &PipelineBuildInfo,
) -> Result<Pipeline> {
    let mut modules = Vec::with_capacity(info.stages.len());
    for stage in &info.stages {
        let built = stage
            .source
            .load()
            .and_then(|code| create_shader_module(device, &code));
        match built {
            Ok(m) => modules.push(m),
            Err(e) => {
                for m in modules {
                    device.destroy_shader_module(m, None);
                }
                return Err(e.context(format!("{} {:?} shader", info.kind.name(), stage.stage)));
            }
        }
    }
    let result = build_with_modules(device, cache, info, &modules);
    for m in modules {
        device.destroy_shader_module(m, None);
    }
    result
}

unsafe fn build_with_modules(
    device: &ash::Device,
    cache: vk::PipelineCache,
    info: &PipelineBuildInfo,
    modules: &[vk::ShaderModule],
) -> Result<Pipeline> {
    let stages: Vec<vk::PipelineShaderStageCreateInfo> = info
        .stages
        .iter()
        .zip(modules)
        .map(|(s, &module)| vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: s.stage,
            module,
            p_name: ENTRY_POINT.as_ptr(),
            ..Default::default()
        })
        .collect();

    let binding = Vertex::binding_description();
    let attributes = Vertex::attribute_descriptions();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: 1,
        p_vertex_binding_descriptions: &binding,
        vertex_attribute_description_count: attributes.len() as u32,
        p_vertex_attribute_descriptions: attributes.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
        dynamic_state_count: dyn_states.len() as u32,
        p_dynamic_states: dyn_states.as_ptr(),
        ..Default::default()
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    // the sky quad is screen-aligned; only meshes get culled
    let cull_mode = if info.kind == PipelineKind::Sky {
        vk::CullModeFlags::NONE
    } else {
        vk::CullModeFlags::BACK
    };
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let depth_on = if info.depth_format.is_some() {
        vk::TRUE
    } else {
        vk::FALSE
    };
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
        depth_test_enable: depth_on,
        depth_write_enable: depth_on,
        depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
        ..Default::default()
    };
    let color_blend_att = vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::R
            | vk::ColorComponentFlags::G
            | vk::ColorComponentFlags::B
            | vk::ColorComponentFlags::A,
        blend_enable: vk::FALSE,
        ..Default::default()
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_blend_att,
        ..Default::default()
    };

    let layout_info = vk::PipelineLayoutCreateInfo {
        s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
        set_layout_count: info.set_layouts.len() as u32,
        p_set_layouts: info.set_layouts.as_ptr(),
        ..Default::default()
    };
    let layout = device
        .create_pipeline_layout(&layout_info, None)
        .context("create_pipeline_layout")?;

    let render_pass =
        match create_render_pass(device, info.overwrite, info.color_format, info.depth_format) {
            Ok(rp) => rp,
            Err(e) => {
                device.destroy_pipeline_layout(layout, None);
                return Err(e);
            }
        };

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_depth_stencil_state: &depth_stencil,
        p_color_blend_state: &color_blend,
        p_dynamic_state: &dynamic_state,
        layout,
        render_pass,
        subpass: 0,
        ..Default::default()
    };

    match device.create_graphics_pipelines(cache, std::slice::from_ref(&pipeline_info), None) {
        Ok(p) => Ok(Pipeline {
            kind: info.kind,
            handle: p[0],
            layout,
            render_pass,
            depth_tested: info.depth_format.is_some(),
        }),
        Err((_, err)) => {
            device.destroy_render_pass(render_pass, None);
            device.destroy_pipeline_layout(layout, None);
            Err(anyhow!("create_graphics_pipelines ({}): {err:?}", info.kind.name()))
        }
    }
}

/// Both pipelines, built against one swapchain color format.
#[derive(Clone, Copy, Debug)]
pub struct PipelineSet {
    pipelines: [Pipeline; 2],
    pub color_format: vk::Format,
}

impl PipelineSet {
    pub unsafe fn build(
        device: &ash::Device,
        cache: vk::PipelineCache,
        color_format: vk::Format,
        depth_format: vk::Format,
        layouts: &SetLayouts,
        shader_dir: Option<&Path>,
    ) -> Result<Self> {
        let sky_info = PipelineBuildInfo::for_kind(
            PipelineKind::Sky,
            color_format,
            depth_format,
            layouts,
            shader_dir,
        );
        let sky = build_pipeline(device, cache, &sky_info)?;
        let std_info = PipelineBuildInfo::for_kind(
            PipelineKind::Standard,
            color_format,
            depth_format,
            layouts,
            shader_dir,
        );
        let standard = match build_pipeline(device, cache, &std_info) {
            Ok(p) => p,
            Err(e) => {
                sky.destroy(device);
                return Err(e);
            }
        };
        Ok(Self {
            pipelines: [sky, standard],
            color_format,
        })
    }

    pub fn get(&self, kind: PipelineKind) -> &Pipeline {
        &self.pipelines[kind.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pipeline> {
        self.pipelines.iter()
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        for p in &self.pipelines {
            p.destroy(device);
        }
    }
}

fn hex_bytes(b: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(b.len() * 2);
    for x in b {
        let _ = write!(&mut s, "{x:02x}");
    }
    s
}

/// Cache file name keyed by vendor, device, driver and cache UUID.
pub fn pipeline_cache_path(props: &vk::PhysicalDeviceProperties) -> PathBuf {
    PathBuf::from(format!(
        "orrery_pipeline_cache_{:04x}_{:04x}_{:08x}_{}.bin",
        props.vendor_id,
        props.device_id,
        props.driver_version,
        hex_bytes(&props.pipeline_cache_uuid)
    ))
}

pub unsafe fn create_or_load_pipeline_cache(
    device: &ash::Device,
    path: Option<&Path>,
) -> Result<vk::PipelineCache> {
    let data = path.and_then(|p| fs::read(p).ok()).unwrap_or_default();
    let info = vk::PipelineCacheCreateInfo {
        s_type: vk::StructureType::PIPELINE_CACHE_CREATE_INFO,
        initial_data_size: data.len(),
        p_initial_data: if data.is_empty() {
            ptr::null()
        } else {
            data.as_ptr().cast()
        },
        ..Default::default()
    };
    match device.create_pipeline_cache(&info, None) {
        Ok(c) => Ok(c),
        Err(e) if !data.is_empty() => {
            // stale blob from another driver; start empty
            warn!(error = ?e, "discarding pipeline cache");
            let empty = vk::PipelineCacheCreateInfo::default();
            device
                .create_pipeline_cache(&empty, None)
                .context("create_pipeline_cache")
        }
        Err(e) => Err(e).context("create_pipeline_cache"),
    }
}

pub unsafe fn save_pipeline_cache(
    device: &ash::Device,
    cache: vk::PipelineCache,
    path: &Path,
) -> Result<()> {
    let bytes = device
        .get_pipeline_cache_data(cache)
        .context("get_pipeline_cache_data")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, &bytes).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
