//! Instance, optional validation messenger, physical device choice, and the logical device
//! with its graphics queue and (when the hardware has one) a dedicated transfer queue.

use std::borrow::Cow;
use std::ffi::{c_char, c_void, CStr};
use std::sync::Arc;

use ash::vk;

use crate::config::RhiConfig;
use crate::error::{Result, RhiError};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct DeviceContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_props: vk::PhysicalDeviceMemoryProperties,
    /// Device anisotropy limit, `None` when the feature is missing.
    pub max_anisotropy: Option<f32>,
    pub device: Arc<ash::Device>,
    pub name: String,
    pub graphics_family: u32,
    pub graphics_queue: vk::Queue,
    pub transfer_family: u32,
    pub transfer_queue: vk::Queue,
    #[cfg_attr(not(feature = "window"), allow(dead_code))]
    pub swapchain_supported: bool,
}

impl DeviceContext {
    pub fn new(config: &RhiConfig) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| RhiError::unsupported(format!("Vulkan loader unavailable: {e}")))?;

        let wants_layers = config.wants_validation_layers();
        let layers_present = wants_layers && has_layer(&entry, VALIDATION_LAYER)?;
        if wants_layers && !layers_present {
            log::warn!("{VALIDATION_LAYER:?} requested but not installed");
        }
        let instance_exts = unsafe { entry.enumerate_instance_extension_properties(None)? };
        let has_instance_ext =
            |name: &CStr| instance_exts.iter().any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == name));
        let mut extensions: Vec<*const c_char> = Vec::new();
        let debug_enabled = layers_present && has_instance_ext(ash::ext::debug_utils::NAME);
        if debug_enabled {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }
        #[cfg(feature = "window")]
        for name in surface_extensions() {
            if has_instance_ext(name) {
                extensions.push(name.as_ptr());
            }
        }
        let layers: Vec<*const c_char> = if layers_present { vec![VALIDATION_LAYER.as_ptr()] } else { Vec::new() };

        let app_info = vk::ApplicationInfo::default()
            .api_version(vk::API_VERSION_1_2)
            .application_name(c"ember")
            .engine_name(c"ember");
        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);
        let instance = unsafe { entry.create_instance(&instance_info, None)? };

        let debug_utils = if debug_enabled {
            match create_messenger(&entry, &instance) {
                Ok(pair) => Some(pair),
                Err(e) => {
                    log::warn!("debug messenger unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        // Owned from here on so every early return tears the instance down.
        let mut partial = PartialInstance { instance, debug_utils, armed: true };
        let instance = &partial.instance;
        let (physical_device, graphics_family) = pick_physical_device(instance, config.gpu_index)?;
        let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let transfer_family = dedicated_transfer_family(&families).unwrap_or(graphics_family);
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_props = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let supported = unsafe { instance.get_physical_device_features(physical_device) };
        let name = properties
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown Vulkan device".to_owned());

        let device_exts = unsafe { instance.enumerate_device_extension_properties(physical_device)? };
        let swapchain_supported = device_exts
            .iter()
            .any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == ash::khr::swapchain::NAME));
        let mut enabled_exts: Vec<*const c_char> = Vec::new();
        if cfg!(feature = "window") && swapchain_supported {
            enabled_exts.push(ash::khr::swapchain::NAME.as_ptr());
        }

        let priorities = [1.0f32];
        let mut queue_infos = vec![vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_family)
            .queue_priorities(&priorities)];
        if transfer_family != graphics_family {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(transfer_family)
                    .queue_priorities(&priorities),
            );
        }
        let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(supported.sampler_anisotropy == vk::TRUE);
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&enabled_exts)
            .enabled_features(&features);
        let device = unsafe { instance.create_device(physical_device, &device_info, None)? };
        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let transfer_queue = unsafe { device.get_device_queue(transfer_family, 0) };
        log::info!(
            "Vulkan device: {name} (graphics family {graphics_family}, transfer family {transfer_family}{})",
            if partial.debug_utils.is_some() { ", validation layers on" } else { "" }
        );

        let (instance, debug_utils) = partial.release();
        Ok(Self {
            entry,
            instance,
            debug_utils,
            physical_device,
            properties,
            memory_props,
            max_anisotropy: (supported.sampler_anisotropy == vk::TRUE).then_some(properties.limits.max_sampler_anisotropy),
            device: Arc::new(device),
            name,
            graphics_family,
            graphics_queue,
            transfer_family,
            transfer_queue,
            swapchain_supported,
        })
    }

    /// Transfer work runs on a queue without graphics stages.
    pub fn transfer_only(&self) -> bool {
        self.transfer_family != self.graphics_family
    }

    /// Every family that touches shared resources, deduplicated.
    pub fn queue_families(&self) -> Vec<u32> {
        if self.transfer_only() {
            vec![self.graphics_family, self.transfer_family]
        } else {
            vec![self.graphics_family]
        }
    }

    pub fn format_features(&self, format: vk::Format) -> vk::FormatFeatureFlags {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
                .optimal_tiling_features
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            if let Some((utils, messenger)) = self.debug_utils.take() {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Instance plus messenger, destroyed on drop unless released into a `DeviceContext`.
struct PartialInstance {
    instance: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    armed: bool,
}

impl PartialInstance {
    fn release(
        &mut self,
    ) -> (ash::Instance, Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>) {
        self.armed = false;
        (self.instance.clone(), self.debug_utils.take())
    }
}

impl Drop for PartialInstance {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        unsafe {
            if let Some((utils, messenger)) = self.debug_utils.take() {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn has_layer(entry: &ash::Entry, name: &CStr) -> Result<bool> {
    let layers = unsafe { entry.enumerate_instance_layer_properties()? };
    Ok(layers.iter().any(|l| l.layer_name_as_c_str().is_ok_and(|n| n == name)))
}

#[cfg(feature = "window")]
fn surface_extensions() -> [&'static CStr; 7] {
    [
        ash::khr::surface::NAME,
        ash::khr::win32_surface::NAME,
        ash::khr::xlib_surface::NAME,
        ash::khr::xcb_surface::NAME,
        ash::khr::wayland_surface::NAME,
        ash::ext::metal_surface::NAME,
        ash::khr::android_surface::NAME,
    ]
}

fn create_messenger(
    entry: &ash::Entry,
    instance: &ash::Instance,
) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let utils = ash::ext::debug_utils::Instance::new(entry, instance);
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));
    let messenger = unsafe { utils.create_debug_utils_messenger(&create_info, None)? };
    Ok((utils, messenger))
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    let message = if data.is_null() || (*data).p_message.is_null() {
        Cow::Borrowed("")
    } else {
        CStr::from_ptr((*data).p_message).to_string_lossy()
    };
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[vulkan] {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[vulkan] {message}");
    } else {
        log::debug!("[vulkan] {message}");
    }
    vk::FALSE
}

fn device_rank(kind: vk::PhysicalDeviceType) -> u32 {
    match kind {
        vk::PhysicalDeviceType::DISCRETE_GPU => 3,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
        _ => 0,
    }
}

fn graphics_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|f| f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32)
}

/// A family that can copy but neither draw nor dispatch.
fn dedicated_transfer_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|f| {
            f.queue_count > 0
                && f.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !f.queue_flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|i| i as u32)
}

/// `index` picks a device explicitly; otherwise the highest-ranked device with a graphics queue wins.
fn pick_physical_device(instance: &ash::Instance, index: Option<usize>) -> Result<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    let with_graphics = |pd: vk::PhysicalDevice| {
        let families = unsafe { instance.get_physical_device_queue_family_properties(pd) };
        graphics_family(&families).map(|family| (pd, family))
    };
    if let Some(index) = index {
        let pd = *devices
            .get(index)
            .ok_or_else(|| RhiError::unsupported(format!("no Vulkan device at index {index}")))?;
        return with_graphics(pd)
            .ok_or_else(|| RhiError::unsupported(format!("Vulkan device {index} has no graphics queue")));
    }
    devices
        .iter()
        .filter_map(|&pd| with_graphics(pd))
        .max_by_key(|(pd, _)| device_rank(unsafe { instance.get_physical_device_properties(*pd) }.device_type))
        .ok_or_else(|| RhiError::unsupported("no Vulkan device with a graphics queue"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties { queue_flags: flags, queue_count: 1, ..Default::default() }
    }

    #[test]
    fn transfer_family_must_be_dedicated() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER | vk::QueueFlags::SPARSE_BINDING),
        ];
        assert_eq!(graphics_family(&families), Some(0));
        assert_eq!(dedicated_transfer_family(&families), Some(2));
        assert_eq!(dedicated_transfer_family(&families[..2]), None);
    }

    #[test]
    fn discrete_devices_rank_first() {
        assert!(device_rank(vk::PhysicalDeviceType::DISCRETE_GPU) > device_rank(vk::PhysicalDeviceType::INTEGRATED_GPU));
        assert_eq!(device_rank(vk::PhysicalDeviceType::CPU), 0);
    }
}
