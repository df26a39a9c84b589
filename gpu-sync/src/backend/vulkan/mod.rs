//! Native Vulkan backend implementation using ash.
//!
//! Creates one logical device with a graphics, compute and transfer family
//! (falling back to graphics where the hardware has no dedicated family),
//! up to four queues per family ordered by priority, and one command pool per
//! family. Memory comes from gpu-allocator.

mod allocator;
mod command;
pub(crate) mod conversion;
mod debug;
mod device;
mod instance;

use std::collections::BTreeMap;
use std::mem::ManuallyDrop;
use std::time::Duration;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::Allocator;
use parking_lot::Mutex;

use crate::encoder::NativeCommand;
use crate::error::SyncError;
use crate::profiling::profile_scope;
use crate::resources::{BufferDesc, ImageDesc, ResourceArena};
use crate::types::{QueueFamilies, QueueFunction, QueuePriority};

use super::{
    GpuBackend, GpuBuffer, GpuCommandBuffer, GpuFence, GpuImage, GpuSemaphore, PresentRequest,
    SubmitBatch,
};

use self::command::{CommandPools, Encoder};

/// Vulkan-based GPU backend using ash.
pub struct VulkanBackend {
    /// Vulkan entry points (function loader).
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<debug::DebugMessenger>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    families: QueueFamilies,
    /// Queues per family, lowest priority first. Submission to a queue is
    /// externally synchronized.
    queues: BTreeMap<u32, Vec<Mutex<vk::Queue>>>,
    /// Dropped by hand before the device is destroyed.
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pools: CommandPools,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    validation_enabled: bool,
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("families", &self.families)
            .field("validation_enabled", &self.validation_enabled)
            .finish_non_exhaustive()
    }
}

impl VulkanBackend {
    /// Create a new Vulkan backend.
    ///
    /// Initializes the instance, selects a physical device, creates the
    /// logical device with its queues, and sets up the memory allocator.
    pub fn new(validation_enabled: bool) -> Result<Self, SyncError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            SyncError::InitializationFailed(format!("Failed to load Vulkan: {}", e))
        })?;

        let instance::InstanceBundle {
            instance,
            debug_messenger,
        } = instance::create_instance(&entry, validation_enabled)?;

        let physical_device = device::select_physical_device(&instance)?;
        let (families, properties) = device::find_queue_families(&instance, physical_device)?;
        let device::DeviceBundle {
            device,
            queues,
            has_swapchain,
        } = device::create_logical_device(&instance, physical_device, families, &properties)?;

        let allocator = allocator::create_allocator(&instance, physical_device, device.clone())?;
        let pools = CommandPools::new(&device, queues.keys().copied())?;
        let swapchain_loader =
            has_swapchain.then(|| ash::khr::swapchain::Device::new(&instance, &device));

        let queues = queues
            .into_iter()
            .map(|(family, queues)| (family, queues.into_iter().map(Mutex::new).collect()))
            .collect();

        log::info!(
            "Vulkan backend initialized (validation: {})",
            validation_enabled
        );

        Ok(Self {
            entry,
            instance,
            debug_messenger,
            physical_device,
            device,
            families,
            queues,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            pools,
            swapchain_loader,
            validation_enabled,
        })
    }

    /// Get the Vulkan device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the Vulkan instance.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    fn queue(
        &self,
        function: QueueFunction,
        priority: QueuePriority,
    ) -> Result<&Mutex<vk::Queue>, SyncError> {
        let family = self.families.family(function);
        let queues = self
            .queues
            .get(&family)
            .ok_or_else(|| SyncError::Internal(format!("no queues for family {family}")))?;
        let slot = device::priority_slot(priority, queues.len());
        queues
            .get(slot)
            .ok_or_else(|| SyncError::Internal(format!("no queue {slot} on family {family}")))
    }

    fn release_allocation(&self, allocation: &Mutex<Option<gpu_allocator::vulkan::Allocation>>) {
        let Some(allocation) = allocation.lock().take() else {
            return;
        };
        if let Err(e) = self.allocator.lock().free(allocation) {
            log::error!("Failed to free GPU memory: {}", e);
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            self.pools.destroy(&self.device);

            // The allocator frees its memory blocks through the device.
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);

            if let Some(messenger) = &self.debug_messenger {
                messenger.destroy();
            }

            self.instance.destroy_instance(None);
        }
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan Backend (ash)"
    }

    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<GpuBuffer, SyncError> {
        let location = if desc.host_visible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(conversion::buffer_usage(desc))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }.map_err(|e| {
            SyncError::ResourceCreationFailed(format!("Failed to create buffer: {:?}", e))
        })?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let name = desc.label.as_deref().unwrap_or("buffer");
        let allocation = match allocator::allocate(
            &mut self.allocator.lock(),
            name,
            requirements,
            location,
            true,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            let _ = self.allocator.lock().free(allocation);
            return Err(SyncError::ResourceCreationFailed(format!(
                "Failed to bind buffer memory: {:?}",
                e
            )));
        }

        Ok(GpuBuffer::Vulkan {
            device: self.device.clone(),
            buffer,
            allocation: Mutex::new(Some(allocation)),
            size: desc.size,
        })
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<GpuImage, SyncError> {
        let (image_type, view_type) = if desc.extent.depth > 1 {
            (vk::ImageType::TYPE_3D, vk::ImageViewType::TYPE_3D)
        } else if desc.array_layers > 1 {
            (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D_ARRAY)
        } else {
            (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D)
        };
        let format = desc.format.to_vk();

        let image_info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(format)
            .extent(conversion::extent(desc.extent))
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(conversion::sample_count(desc.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(conversion::image_usage(desc))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&image_info, None) }.map_err(|e| {
            SyncError::ResourceCreationFailed(format!("Failed to create image: {:?}", e))
        })?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let name = desc.label.as_deref().unwrap_or("image");
        let allocation = match allocator::allocate(
            &mut self.allocator.lock(),
            name,
            requirements,
            MemoryLocation::GpuOnly,
            false,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let aspect = conversion::aspect_mask(desc.format);
        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        let view = bound.and_then(|()| {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(view_type)
                .format(format)
                .subresource_range(conversion::mip_range(aspect, None));
            unsafe { self.device.create_image_view(&view_info, None) }
        });
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                let _ = self.allocator.lock().free(allocation);
                return Err(SyncError::ResourceCreationFailed(format!(
                    "Failed to bind image memory or create view: {:?}",
                    e
                )));
            }
        };

        Ok(GpuImage::Vulkan {
            device: self.device.clone(),
            image,
            view,
            allocation: Mutex::new(Some(allocation)),
            aspect,
        })
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) {
        if let GpuBuffer::Vulkan { allocation, .. } = &buffer {
            self.release_allocation(allocation);
        }
    }

    fn destroy_image(&self, image: GpuImage) {
        if let GpuImage::Vulkan { allocation, .. } = &image {
            self.release_allocation(allocation);
        }
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<(), SyncError> {
        let GpuBuffer::Vulkan {
            allocation, size, ..
        } = buffer
        else {
            return Err(SyncError::InvalidParameter(
                "buffer does not belong to the Vulkan backend".to_string(),
            ));
        };
        let end = offset + data.len() as u64;
        if end > *size {
            return Err(SyncError::InvalidParameter(format!(
                "write of {} bytes at {offset} exceeds buffer size {size}",
                data.len()
            )));
        }

        let mut allocation = allocation.lock();
        let slice = allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or_else(|| {
                SyncError::InvalidParameter("buffer is not host visible".to_string())
            })?;
        slice[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn allocate_command_buffer(
        &self,
        _queue: QueueFunction,
        family: u32,
        name: &str,
    ) -> Result<GpuCommandBuffer, SyncError> {
        let (buffer, pool) = self.pools.allocate(&self.device, family)?;
        log::trace!("Allocated command buffer {name} on family {family}");
        Ok(GpuCommandBuffer::Vulkan { buffer, pool })
    }

    fn begin_command_buffer(
        &self,
        cmd: &GpuCommandBuffer,
        one_time: bool,
    ) -> Result<(), SyncError> {
        let GpuCommandBuffer::Vulkan { buffer, .. } = cmd else {
            return Err(SyncError::InvalidParameter(
                "command buffer does not belong to the Vulkan backend".to_string(),
            ));
        };
        let flags = if one_time {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        unsafe {
            self.device
                .reset_command_buffer(*buffer, vk::CommandBufferResetFlags::empty())?;
            self.device
                .begin_command_buffer(*buffer, &vk::CommandBufferBeginInfo::default().flags(flags))?;
        }
        Ok(())
    }

    fn end_command_buffer(&self, cmd: &GpuCommandBuffer) -> Result<(), SyncError> {
        if let GpuCommandBuffer::Vulkan { buffer, .. } = cmd {
            unsafe { self.device.end_command_buffer(*buffer)? };
        }
        Ok(())
    }

    fn free_command_buffer(&self, cmd: GpuCommandBuffer) {
        if let GpuCommandBuffer::Vulkan { buffer, pool } = cmd {
            self.pools.free(&self.device, pool, buffer);
        }
    }

    fn record(&self, cmd: &GpuCommandBuffer, command: &NativeCommand, resources: &ResourceArena) {
        let GpuCommandBuffer::Vulkan { buffer, .. } = cmd else {
            log::error!("Recording into a command buffer of another backend");
            return;
        };
        Encoder {
            device: &self.device,
            cmd: *buffer,
            resources,
        }
        .encode(command);
    }

    fn create_fence(&self, signaled: bool) -> Result<GpuFence, SyncError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }
        .map_err(|e| SyncError::ResourceCreationFailed(format!("Failed to create fence: {:?}", e)))?;
        Ok(GpuFence::Vulkan {
            device: self.device.clone(),
            fence,
        })
    }

    fn wait_fence(&self, fence: &GpuFence, timeout: Duration) -> Result<(), SyncError> {
        let GpuFence::Vulkan { device, fence } = fence else {
            return Ok(());
        };
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { device.wait_for_fences(&[*fence], true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => {
                log::warn!("Fence wait timed out after {:?}", timeout);
                Err(SyncError::Timeout)
            }
            Err(e) => {
                log::error!("Fence wait failed: {:?}", e);
                Err(e.into())
            }
        }
    }

    fn is_fence_signaled(&self, fence: &GpuFence) -> bool {
        match fence {
            GpuFence::Vulkan { device, fence } => {
                matches!(unsafe { device.get_fence_status(*fence) }, Ok(true))
            }
            _ => false,
        }
    }

    fn reset_fence(&self, fence: &GpuFence) -> Result<(), SyncError> {
        if let GpuFence::Vulkan { device, fence } = fence {
            unsafe { device.reset_fences(&[*fence])? };
        }
        Ok(())
    }

    fn create_semaphore(&self) -> Result<GpuSemaphore, SyncError> {
        let semaphore =
            unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
                .map_err(|e| {
                    SyncError::ResourceCreationFailed(format!(
                        "Failed to create semaphore: {:?}",
                        e
                    ))
                })?;
        Ok(GpuSemaphore::Vulkan {
            device: self.device.clone(),
            semaphore,
        })
    }

    fn submit(
        &self,
        queue: QueueFunction,
        priority: QueuePriority,
        batches: &[SubmitBatch<'_>],
        fence: Option<&GpuFence>,
    ) -> Result<(), SyncError> {
        profile_scope!("queue_submit");

        struct Arrays {
            command_buffers: Vec<vk::CommandBuffer>,
            wait_semaphores: Vec<vk::Semaphore>,
            wait_stages: Vec<vk::PipelineStageFlags>,
            signal_semaphores: Vec<vk::Semaphore>,
        }

        let arrays: Vec<Arrays> = batches
            .iter()
            .map(|batch| Arrays {
                command_buffers: batch
                    .command_buffers
                    .iter()
                    .filter_map(|cmd| match cmd {
                        GpuCommandBuffer::Vulkan { buffer, .. } => Some(*buffer),
                        _ => None,
                    })
                    .collect(),
                wait_semaphores: batch
                    .wait_semaphores
                    .iter()
                    .filter_map(|(semaphore, _)| vk_semaphore(semaphore))
                    .collect(),
                wait_stages: batch
                    .wait_semaphores
                    .iter()
                    .filter(|(semaphore, _)| vk_semaphore(semaphore).is_some())
                    .map(|(_, stages)| stages.or_top_of_pipe().to_vk())
                    .collect(),
                signal_semaphores: batch
                    .signal_semaphores
                    .iter()
                    .filter_map(|semaphore| vk_semaphore(semaphore))
                    .collect(),
            })
            .collect();

        let submits: Vec<vk::SubmitInfo<'_>> = arrays
            .iter()
            .map(|a| {
                vk::SubmitInfo::default()
                    .command_buffers(&a.command_buffers)
                    .wait_semaphores(&a.wait_semaphores)
                    .wait_dst_stage_mask(&a.wait_stages)
                    .signal_semaphores(&a.signal_semaphores)
            })
            .collect();

        let fence = match fence {
            Some(GpuFence::Vulkan { fence, .. }) => *fence,
            _ => vk::Fence::null(),
        };

        let queue = self.queue(queue, priority)?.lock();
        unsafe { self.device.queue_submit(*queue, &submits, fence) }.map_err(|e| match e {
            vk::Result::ERROR_DEVICE_LOST => SyncError::DeviceLost,
            other => SyncError::SubmissionFailed(format!("{:?}", other)),
        })
    }

    fn present(&self, request: &PresentRequest<'_>) -> Result<(), SyncError> {
        let loader = self.swapchain_loader.as_ref().ok_or_else(|| {
            SyncError::InvalidParameter("device was created without swapchain support".to_string())
        })?;
        let swapchains: Vec<vk::SwapchainKHR> = request
            .swapchains
            .iter()
            .map(|handle| vk::Handle::from_raw(handle.raw()))
            .collect();
        let wait_semaphores: Vec<vk::Semaphore> = request
            .wait_semaphores
            .iter()
            .filter_map(|semaphore| vk_semaphore(semaphore))
            .collect();
        let info = vk::PresentInfoKHR::default()
            .swapchains(&swapchains)
            .image_indices(request.image_indices)
            .wait_semaphores(&wait_semaphores);

        let queue = self.queue(QueueFunction::Graphics, QueuePriority::default())?.lock();
        match unsafe { loader.queue_present(*queue, &info) } {
            Ok(suboptimal) => {
                if suboptimal {
                    log::debug!("Swapchain is suboptimal");
                }
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain out of date");
                Ok(())
            }
            Err(e) => Err(SyncError::SubmissionFailed(format!("present failed: {:?}", e))),
        }
    }

    fn wait_idle(&self) -> Result<(), SyncError> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

fn vk_semaphore(semaphore: &GpuSemaphore) -> Option<vk::Semaphore> {
    match semaphore {
        GpuSemaphore::Vulkan { semaphore, .. } => Some(*semaphore),
        _ => None,
    }
}
