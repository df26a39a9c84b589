//! Validation layer output routed into `log`.
//!
//! Synchronization validation reports hazards with `SYNC-HAZARD-*` message
//! ids. Those are always logged as errors: they mean a barrier this crate
//! should have emitted is missing or too narrow.

use std::ffi::{CStr, c_void};

use ash::vk;

use crate::error::SyncError;

const SYNC_HAZARD_PREFIX: &str = "SYNC-HAZARD";

/// A debug utils messenger together with the loader that destroys it.
pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    pub fn new(entry: &ash::Entry, instance: &ash::Instance) -> Result<Self, SyncError> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(on_message));
        let handle = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
            .map_err(|e| {
                SyncError::InitializationFailed(format!("Debug messenger: {:?}", e))
            })?;
        Ok(Self { loader, handle })
    }

    /// # Safety
    ///
    /// Must be called once, before the instance is destroyed.
    pub unsafe fn destroy(&self) {
        unsafe { self.loader.destroy_debug_utils_messenger(self.handle, None) };
    }
}

fn level_for(severity: vk::DebugUtilsMessageSeverityFlagsEXT, id_name: &str) -> log::Level {
    if id_name.starts_with(SYNC_HAZARD_PREFIX) {
        return log::Level::Error;
    }
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::Level::Debug
    } else {
        log::Level::Trace
    }
}

fn kind_label(kind: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "general"
    }
}

/// # Safety
///
/// `ptr` must be null or a valid null-terminated string.
unsafe fn lossy(ptr: *const std::ffi::c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

unsafe extern "system" fn on_message(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if callback_data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the driver keeps the callback data alive for the duration of the call
    let data = unsafe { &*callback_data };
    let (id_name, message) = unsafe { (lossy(data.p_message_id_name), lossy(data.p_message)) };

    log::log!(
        target: "redlilium_gpu_sync::vulkan",
        level_for(severity, &id_name),
        "[{}] {}",
        kind_label(kind),
        message
    );
    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_hazards_are_errors() {
        let level = level_for(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            "SYNC-HAZARD-READ-AFTER-WRITE",
        );
        assert_eq!(level, log::Level::Error);
    }

    #[test]
    fn test_severity_levels() {
        assert_eq!(
            level_for(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING, "VUID-x"),
            log::Level::Warn
        );
        assert_eq!(
            level_for(vk::DebugUtilsMessageSeverityFlagsEXT::INFO, ""),
            log::Level::Debug
        );
        assert_eq!(
            level_for(vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE, ""),
            log::Level::Trace
        );
    }

    #[test]
    fn test_kind_label_prefers_validation() {
        let kind = vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE;
        assert_eq!(kind_label(kind), "validation");
    }
}
