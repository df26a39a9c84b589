//! Physical device selection, queue families and logical device creation.

use std::collections::BTreeMap;

use ash::vk;

use crate::error::SyncError;
use crate::types::{QueueFamilies, QueuePriority};

/// Priorities of the queues created per family, lowest first.
const QUEUE_PRIORITIES: [QueuePriority; 4] = [
    QueuePriority::Low,
    QueuePriority::Medium,
    QueuePriority::High,
    QueuePriority::SuperHigh,
];

/// Select the best physical device. Discrete GPUs win over integrated ones.
pub fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice, SyncError> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        SyncError::InitializationFailed(format!("Failed to enumerate physical devices: {:?}", e))
    })?;

    if devices.is_empty() {
        return Err(SyncError::InitializationFailed(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best_device = None;
    let mut best_score = 0;
    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };

        let mut score = 1;
        if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 1000;
        } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 100;
        }
        score += properties.limits.max_image_dimension2_d / 1024;

        log::info!(
            "Found GPU: {:?} (type: {:?}, score: {})",
            properties.device_name_as_c_str().unwrap_or(c"unknown"),
            properties.device_type,
            score
        );

        if score > best_score {
            best_score = score;
            best_device = Some(device);
        }
    }

    best_device
        .ok_or_else(|| SyncError::InitializationFailed("No suitable GPU found".to_string()))
}

/// Pick a family for each queue function.
///
/// Compute prefers a family without graphics, transfer one with neither
/// graphics nor compute. Missing dedicated families fall back to graphics.
pub fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<(QueueFamilies, Vec<vk::QueueFamilyProperties>), SyncError> {
    let properties =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let find = |required: vk::QueueFlags, excluded: vk::QueueFlags| {
        properties
            .iter()
            .position(|f| {
                f.queue_count > 0
                    && f.queue_flags.contains(required)
                    && !f.queue_flags.intersects(excluded)
            })
            .map(|index| index as u32)
    };

    let graphics = find(vk::QueueFlags::GRAPHICS, vk::QueueFlags::empty()).ok_or_else(|| {
        SyncError::InitializationFailed("No graphics queue family found".to_string())
    })?;
    let compute = find(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS).unwrap_or(graphics);
    let transfer = find(
        vk::QueueFlags::TRANSFER,
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
    )
    .unwrap_or(graphics);

    let families = QueueFamilies::new(graphics, compute, transfer);
    log::info!("Queue families: graphics {graphics}, compute {compute}, transfer {transfer}");
    Ok((families, properties))
}

/// Logical device plus the queues created on each family, lowest priority first.
pub struct DeviceBundle {
    pub device: ash::Device,
    pub queues: BTreeMap<u32, Vec<vk::Queue>>,
    pub has_swapchain: bool,
}

pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: QueueFamilies,
    properties: &[vk::QueueFamilyProperties],
) -> Result<DeviceBundle, SyncError> {
    let priorities: Vec<f32> = QUEUE_PRIORITIES.iter().map(|p| p.as_f32()).collect();

    let mut counts = BTreeMap::new();
    for function in crate::types::QueueFunction::ALL {
        let family = families.family(function);
        let available = properties
            .get(family as usize)
            .map_or(1, |p| p.queue_count as usize);
        counts.insert(family, available.clamp(1, priorities.len()));
    }

    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = counts
        .iter()
        .map(|(family, count)| {
            // With fewer queues than priorities, keep the top of the range.
            let start = priorities.len() - count;
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(*family)
                .queue_priorities(&priorities[start..])
        })
        .collect();

    let available_extensions =
        unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .unwrap_or_default();
    let has_swapchain = available_extensions.iter().any(|ext| {
        ext.extension_name_as_c_str()
            .is_ok_and(|name| name == ash::khr::swapchain::NAME)
    });
    let device_extensions: Vec<*const std::ffi::c_char> = if has_swapchain {
        vec![ash::khr::swapchain::NAME.as_ptr()]
    } else {
        log::warn!("Swapchain extension unavailable, presentation disabled");
        vec![]
    };

    let supported = unsafe { instance.get_physical_device_features(physical_device) };
    let features =
        vk::PhysicalDeviceFeatures::default().wide_lines(supported.wide_lines == vk::TRUE);
    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions)
        .enabled_features(&features);

    let device = unsafe { instance.create_device(physical_device, &create_info, None) }
        .map_err(|e| {
            SyncError::InitializationFailed(format!("Failed to create logical device: {:?}", e))
        })?;

    let queues = counts
        .into_iter()
        .map(|(family, count)| {
            let queues = (0..count as u32)
                .map(|index| unsafe { device.get_device_queue(family, index) })
                .collect();
            (family, queues)
        })
        .collect();

    Ok(DeviceBundle {
        device,
        queues,
        has_swapchain,
    })
}

/// Queue slot serving `priority` among `count` queues created for a family.
pub fn priority_slot(priority: QueuePriority, count: usize) -> usize {
    let rank = QUEUE_PRIORITIES
        .iter()
        .position(|p| *p == priority)
        .unwrap_or(1);
    let skipped = QUEUE_PRIORITIES.len().saturating_sub(count.max(1));
    rank.saturating_sub(skipped)
}
