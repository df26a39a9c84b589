//! GPU backend abstraction layer.
//!
//! The synchronization layer decides *what* to record; a backend decides
//! *how*. Every backend implements [`GpuBackend`] and owns the native objects
//! behind the handle enums in this module.
//!
//! # Available Backends
//!
//! - `dummy` (default): records commands in memory, used by tests
//! - `vulkan-backend`: native Vulkan backend using ash

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub mod dummy;

use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "vulkan-backend")]
use ash::vk;
#[cfg(feature = "vulkan-backend")]
use gpu_allocator::vulkan::Allocation;
#[cfg(feature = "vulkan-backend")]
use parking_lot::Mutex;

use crate::encoder::NativeCommand;
use crate::error::SyncError;
use crate::resources::{BufferDesc, ImageDesc, ResourceArena};
use crate::types::{PipelineStages, QueueFamilies, QueueFunction, QueuePriority, RawHandle};

/// Handle to a GPU buffer.
#[allow(clippy::large_enum_variant)]
pub enum GpuBuffer {
    /// Dummy backend (host memory only)
    Dummy { size: u64 },
    /// Vulkan backend buffer
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        buffer: vk::Buffer,
        allocation: Mutex<Option<Allocation>>,
        size: u64,
    },
}

impl GpuBuffer {
    pub fn size(&self) -> u64 {
        match self {
            Self::Dummy { size } => *size,
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { size, .. } => *size,
        }
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy { size } => f.debug_struct("GpuBuffer::Dummy").field("size", size).finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { buffer, size, .. } => f
                .debug_struct("GpuBuffer::Vulkan")
                .field("buffer", buffer)
                .field("size", size)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a GPU image.
#[allow(clippy::large_enum_variant)]
pub enum GpuImage {
    /// Dummy backend (no GPU allocation)
    Dummy,
    /// Vulkan backend image
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        image: vk::Image,
        view: vk::ImageView,
        allocation: Mutex<Option<Allocation>>,
        aspect: vk::ImageAspectFlags,
    },
}

impl std::fmt::Debug for GpuImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy => write!(f, "GpuImage::Dummy"),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { image, view, .. } => f
                .debug_struct("GpuImage::Vulkan")
                .field("image", image)
                .field("view", view)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a native command buffer.
pub enum GpuCommandBuffer {
    /// Dummy backend command log
    Dummy { id: u64 },
    /// Vulkan backend command buffer
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        buffer: vk::CommandBuffer,
        pool: vk::CommandPool,
    },
}

impl std::fmt::Debug for GpuCommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy { id } => f.debug_struct("GpuCommandBuffer::Dummy").field("id", id).finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { buffer, .. } => f
                .debug_struct("GpuCommandBuffer::Vulkan")
                .field("buffer", buffer)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a GPU fence for CPU-GPU synchronization.
pub enum GpuFence {
    /// Dummy backend (signaled on submit)
    Dummy {
        signaled: std::sync::atomic::AtomicBool,
    },
    /// Vulkan backend fence
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        fence: vk::Fence,
    },
}

impl std::fmt::Debug for GpuFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy { signaled } => f
                .debug_struct("GpuFence::Dummy")
                .field("signaled", signaled)
                .finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { fence, .. } => f
                .debug_struct("GpuFence::Vulkan")
                .field("fence", fence)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a GPU semaphore for queue to queue synchronization.
pub enum GpuSemaphore {
    /// Dummy backend semaphore
    Dummy { id: u64 },
    /// Vulkan backend semaphore
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        semaphore: vk::Semaphore,
    },
}

impl std::fmt::Debug for GpuSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy { id } => f.debug_struct("GpuSemaphore::Dummy").field("id", id).finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { semaphore, .. } => f
                .debug_struct("GpuSemaphore::Vulkan")
                .field("semaphore", semaphore)
                .finish_non_exhaustive(),
        }
    }
}

// ============================================================================
// Vulkan Resource Cleanup (Drop implementations)
// ============================================================================

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let GpuBuffer::Vulkan {
            device,
            buffer,
            allocation,
            ..
        } = self
        {
            // The allocation is returned to the allocator by `destroy_buffer`.
            let _ = allocation.lock().take();
            unsafe {
                device.destroy_buffer(*buffer, None);
            }
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuImage {
    fn drop(&mut self) {
        if let GpuImage::Vulkan {
            device,
            image,
            view,
            allocation,
            ..
        } = self
        {
            let _ = allocation.lock().take();
            unsafe {
                device.destroy_image_view(*view, None);
                device.destroy_image(*image, None);
            }
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuFence {
    fn drop(&mut self) {
        if let GpuFence::Vulkan { device, fence } = self {
            unsafe {
                device.destroy_fence(*fence, None);
            }
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuSemaphore {
    fn drop(&mut self) {
        if let GpuSemaphore::Vulkan { device, semaphore } = self {
            unsafe {
                device.destroy_semaphore(*semaphore, None);
            }
        }
    }
}

/// One batch of a queue submission.
#[derive(Debug, Default)]
pub struct SubmitBatch<'a> {
    pub command_buffers: Vec<&'a GpuCommandBuffer>,
    /// Semaphores to wait on, with the stages that wait.
    pub wait_semaphores: Vec<(&'a GpuSemaphore, PipelineStages)>,
    pub signal_semaphores: Vec<&'a GpuSemaphore>,
}

/// A present request for one or more swapchains.
#[derive(Debug)]
pub struct PresentRequest<'a> {
    pub swapchains: &'a [RawHandle],
    pub image_indices: &'a [u32],
    pub wait_semaphores: Vec<&'a GpuSemaphore>,
}

/// GPU backend trait for abstracting different GPU APIs.
pub trait GpuBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Queue family serving each queue function.
    fn queue_families(&self) -> QueueFamilies;

    /// Create a buffer resource.
    fn create_buffer(&self, desc: &BufferDesc) -> Result<GpuBuffer, SyncError>;

    /// Create an image resource.
    fn create_image(&self, desc: &ImageDesc) -> Result<GpuImage, SyncError>;

    /// Release a buffer and its memory.
    fn destroy_buffer(&self, buffer: GpuBuffer);

    /// Release an image and its memory.
    fn destroy_image(&self, image: GpuImage);

    /// Write data to a host-visible buffer.
    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<(), SyncError>;

    /// Allocate a command buffer from the pool of `family`.
    fn allocate_command_buffer(
        &self,
        queue: QueueFunction,
        family: u32,
        name: &str,
    ) -> Result<GpuCommandBuffer, SyncError>;

    /// Start recording. Any previous contents are discarded.
    fn begin_command_buffer(&self, cmd: &GpuCommandBuffer, one_time: bool)
    -> Result<(), SyncError>;

    /// Finish recording.
    fn end_command_buffer(&self, cmd: &GpuCommandBuffer) -> Result<(), SyncError>;

    /// Return a command buffer to its pool.
    fn free_command_buffer(&self, cmd: GpuCommandBuffer);

    /// Record one command.
    fn record(&self, cmd: &GpuCommandBuffer, command: &NativeCommand, resources: &ResourceArena);

    /// Create a fence for CPU-GPU synchronization.
    fn create_fence(&self, signaled: bool) -> Result<GpuFence, SyncError>;

    /// Block until the fence is signaled or the timeout elapses.
    fn wait_fence(&self, fence: &GpuFence, timeout: Duration) -> Result<(), SyncError>;

    /// Check if a fence is signaled (non-blocking).
    fn is_fence_signaled(&self, fence: &GpuFence) -> bool;

    /// Return a fence to the unsignaled state.
    fn reset_fence(&self, fence: &GpuFence) -> Result<(), SyncError>;

    /// Create a binary semaphore.
    fn create_semaphore(&self) -> Result<GpuSemaphore, SyncError>;

    /// Submit batches to a queue of the given function and priority.
    fn submit(
        &self,
        queue: QueueFunction,
        priority: QueuePriority,
        batches: &[SubmitBatch<'_>],
        fence: Option<&GpuFence>,
    ) -> Result<(), SyncError>;

    /// Queue swapchain images for presentation.
    fn present(&self, request: &PresentRequest<'_>) -> Result<(), SyncError>;

    /// Block until every queue is idle.
    fn wait_idle(&self) -> Result<(), SyncError>;
}

/// Selects and creates the appropriate backend based on available features.
pub fn create_backend(validation: bool) -> Result<Arc<dyn GpuBackend>, SyncError> {
    #[cfg(feature = "vulkan-backend")]
    {
        match vulkan::VulkanBackend::new(validation) {
            Ok(backend) => {
                log::info!("Using Vulkan backend (ash)");
                return Ok(Arc::new(backend));
            }
            Err(e) => {
                log::warn!("Failed to create Vulkan backend: {}", e);
            }
        }
    }
    #[cfg(not(feature = "vulkan-backend"))]
    let _ = validation;

    log::info!("Using dummy backend");
    Ok(Arc::new(dummy::DummyBackend::new()))
}
