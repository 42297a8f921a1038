// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface and logical device. Created once and destroyed after everything else.
use anyhow::{anyhow, Context, Result};
#[cfg(debug_assertions)]
use ash::ext::debug_utils as ext_debug;
use ash::khr::surface;
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use std::ffi::CStr;
use std::sync::Mutex;
use tracing::info;

#[cfg(debug_assertions)]
type DebugState = vk::DebugUtilsMessengerEXT;
#[cfg(not(debug_assertions))]
type DebugState = ();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Prefers a family that both draws and presents; otherwise the first of each.
pub fn select_queue_families(
    props: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> Option<QueueFamilies> {
    let graphics: Vec<u32> = props
        .iter()
        .enumerate()
        .filter(|(_, p)| p.queue_count > 0 && p.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|(i, _)| i as u32)
        .collect();
    let present: Vec<u32> = (0..props.len() as u32)
        .filter(|&i| supports_present(i))
        .collect();

    if let Some(&shared) = graphics.iter().find(|i| present.contains(i)) {
        return Some(QueueFamilies {
            graphics: shared,
            present: shared,
        });
    }
    Some(QueueFamilies {
        graphics: *graphics.first()?,
        present: *present.first()?,
    })
}

#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", "{msg}");
    } else {
        tracing::trace!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

#[cfg(debug_assertions)]
unsafe fn create_debug_messenger(entry: &Entry, instance: &Instance) -> Result<DebugState> {
    let loader = ext_debug::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    loader
        .create_debug_utils_messenger(&ci, None)
        .context("create_debug_utils_messenger")
}

#[cfg(not(debug_assertions))]
unsafe fn create_debug_messenger(_entry: &Entry, _instance: &Instance) -> Result<DebugState> {
    Ok(())
}

#[cfg(debug_assertions)]
unsafe fn destroy_debug_messenger(entry: &Entry, instance: &Instance, dbg: DebugState) {
    ext_debug::Instance::new(entry, instance).destroy_debug_utils_messenger(dbg, None);
}

#[cfg(not(debug_assertions))]
unsafe fn destroy_debug_messenger(_entry: &Entry, _instance: &Instance, _dbg: DebugState) {}

unsafe fn create_instance(entry: &Entry, display_raw: RawDisplayHandle) -> Result<Instance> {
    let name = c"Orrery";
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: name.as_ptr(),
        p_engine_name: name.as_ptr(),
        api_version: vk::API_VERSION_1_1,
        ..Default::default()
    };

    let required = ash_window::enumerate_required_extensions(display_raw)
        .context("enumerate_required_extensions")?;
    #[cfg(debug_assertions)]
    let extensions = {
        let mut v = required.to_vec();
        v.push(ext_debug::NAME.as_ptr());
        v
    };
    #[cfg(not(debug_assertions))]
    let extensions = required.to_vec();

    #[cfg(debug_assertions)]
    let layers = [c"VK_LAYER_KHRONOS_validation".as_ptr()];
    #[cfg(not(debug_assertions))]
    let layers: [*const std::ffi::c_char; 0] = [];

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };
    entry
        .create_instance(&create_info, None)
        .context("create_instance")
}

unsafe fn pick_device(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
    let mut fallback = None;
    for phys in instance
        .enumerate_physical_devices()
        .context("enumerate_physical_devices")?
    {
        let props = instance.get_physical_device_queue_family_properties(phys);
        let present = |i: u32| {
            surface_loader
                .get_physical_device_surface_support(phys, i, surface)
                .unwrap_or(false)
        };
        match select_queue_families(&props, present) {
            Some(f) if f.is_shared() => return Ok((phys, f)),
            Some(f) if fallback.is_none() => fallback = Some((phys, f)),
            _ => {}
        }
    }
    fallback.ok_or_else(|| anyhow!("no physical device can both draw and present"))
}

unsafe fn pick_depth_format(instance: &Instance, phys: vk::PhysicalDevice) -> vk::Format {
    let candidates = [
        vk::Format::D32_SFLOAT,
        vk::Format::D24_UNORM_S8_UINT,
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D16_UNORM,
    ];
    candidates
        .into_iter()
        .find(|&fmt| {
            instance
                .get_physical_device_format_properties(phys, fmt)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .unwrap_or(vk::Format::D32_SFLOAT)
}

unsafe fn create_device(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    families: QueueFamilies,
) -> Result<ash::Device> {
    let priorities = [1.0_f32];
    let queue_infos: Vec<_> = families
        .unique()
        .into_iter()
        .map(|family| vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index: family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        })
        .collect();
    let extensions = [ash::khr::swapchain::NAME.as_ptr()];
    let info = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: queue_infos.len() as u32,
        p_queue_create_infos: queue_infos.as_ptr(),
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        ..Default::default()
    };
    instance
        .create_device(phys, &info, None)
        .context("create_device")
}

pub struct DeviceContext {
    pub entry: Entry,
    pub instance: Instance,
    debug: DebugState,
    pub surface_loader: surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub phys: vk::PhysicalDevice,
    pub device: ash::Device,
    pub families: QueueFamilies,
    /// Shared with loader threads during asset loading.
    pub graphics_queue: Mutex<vk::Queue>,
    pub present_queue: vk::Queue,
    pub depth_format: vk::Format,
}

impl DeviceContext {
    // STRICT ORDER:
    // 1) instance with WSI extensions (+ validation in debug)
    // 2) surface from THIS instance
    // 3) physical device + families queried against that surface
    // 4) logical device with one queue per distinct family
    pub unsafe fn new(window: &dyn HasWindowHandle, display: &dyn HasDisplayHandle) -> Result<Self> {
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();

        let entry = Entry::linked();
        let instance = create_instance(&entry, dh)?;
        let debug = match create_debug_messenger(&entry, &instance) {
            Ok(d) => d,
            Err(e) => {
                instance.destroy_instance(None);
                return Err(e);
            }
        };
        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = match ash_window::create_surface(&entry, &instance, dh, wh, None) {
            Ok(s) => s,
            Err(e) => {
                destroy_debug_messenger(&entry, &instance, debug);
                instance.destroy_instance(None);
                return Err(e).context("ash_window::create_surface");
            }
        };

        let picked = pick_device(&instance, &surface_loader, surface).and_then(|(phys, families)| {
            create_device(&instance, phys, families).map(|device| (phys, families, device))
        });
        let (phys, families, device) = match picked {
            Ok(p) => p,
            Err(e) => {
                surface_loader.destroy_surface(surface, None);
                destroy_debug_messenger(&entry, &instance, debug);
                instance.destroy_instance(None);
                return Err(e);
            }
        };

        let props = instance.get_physical_device_properties(phys);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        info!(
            device = %name,
            graphics_family = families.graphics,
            present_family = families.present,
            "selected physical device"
        );

        let graphics_queue = device.get_device_queue(families.graphics, 0);
        let present_queue = device.get_device_queue(families.present, 0);
        let depth_format = pick_depth_format(&instance, phys);

        Ok(Self {
            entry,
            instance,
            debug,
            surface_loader,
            surface,
            phys,
            device,
            families,
            graphics_queue: Mutex::new(graphics_queue),
            present_queue,
            depth_format,
        })
    }

    pub fn properties(&self) -> vk::PhysicalDeviceProperties {
        unsafe { self.instance.get_physical_device_properties(self.phys) }
    }
}

// Runs after every device-owned object is gone: device, then surface, then instance.
impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            destroy_debug_messenger(&self.entry, &self.instance, self.debug);
            self.instance.destroy_instance(None);
        }
    }
}
