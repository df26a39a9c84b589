//! Vulkan instance creation.

use std::ffi::CStr;

use ash::vk;

use crate::error::SyncError;

use super::debug;

/// Required Vulkan API version. MoltenVK only offers 1.2.
#[cfg(target_os = "macos")]
const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

#[cfg(not(target_os = "macos"))]
const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance plus the optional debug messenger installed with validation.
pub struct InstanceBundle {
    pub instance: ash::Instance,
    pub debug_messenger: Option<debug::DebugMessenger>,
}

/// Create a Vulkan instance, enabling validation when requested and available.
pub fn create_instance(
    entry: &ash::Entry,
    validation_enabled: bool,
) -> Result<InstanceBundle, SyncError> {
    let validation_available = validation_enabled && check_validation_layer_support(entry);
    if validation_enabled && !validation_available {
        log::warn!("Validation layers requested but not available");
    }

    let app_info = vk::ApplicationInfo::default()
        .application_name(c"RedLilium")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"RedLilium Engine")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(REQUIRED_API_VERSION);

    // Swapchains are created by the windowing layer against this instance.
    let mut extensions = vec![ash::khr::surface::NAME.as_ptr()];
    if validation_available {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    #[cfg(target_os = "windows")]
    extensions.push(ash::khr::win32_surface::NAME.as_ptr());

    #[cfg(target_os = "linux")]
    {
        extensions.push(ash::khr::xlib_surface::NAME.as_ptr());
        extensions.push(ash::khr::wayland_surface::NAME.as_ptr());
    }

    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        extensions.push(ash::ext::metal_surface::NAME.as_ptr());
    }

    let layer_names: Vec<*const std::ffi::c_char> = if validation_available {
        vec![VALIDATION_LAYER_NAME.as_ptr()]
    } else {
        vec![]
    };

    #[allow(unused_mut)]
    let mut create_flags = vk::InstanceCreateFlags::empty();
    #[cfg(target_os = "macos")]
    {
        create_flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }

    let create_info = vk::InstanceCreateInfo::default()
        .flags(create_flags)
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
        SyncError::InitializationFailed(format!("Failed to create Vulkan instance: {:?}", e))
    })?;

    let debug_messenger = if validation_available {
        Some(debug::DebugMessenger::new(entry, &instance)?)
    } else {
        None
    };

    Ok(InstanceBundle {
        instance,
        debug_messenger,
    })
}

fn check_validation_layer_support(entry: &ash::Entry) -> bool {
    let Ok(available_layers) = (unsafe { entry.enumerate_instance_layer_properties() }) else {
        return false;
    };
    available_layers.iter().any(|layer| {
        layer
            .layer_name_as_c_str()
            .is_ok_and(|name| name == VALIDATION_LAYER_NAME)
    })
}
