//! # RedLilium GPU Sync
//!
//! Automatic synchronization for an explicit GPU API.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`ResourceHazardTracker`] - Per-resource access history that decides which
//!   barrier each access needs, including image layouts and queue ownership
//! - [`CommandBufferRegistry`] - Lifecycle of named command buffers
//! - [`CommandList`] - Command recording that inserts barriers before every
//!   copy, clear, dispatch and render pass
//! - [`SubmissionCoordinator`] - Cross-queue semaphores, fences and presentation
//! - [`SyncContext`] - Owner of all of the above plus deferred resource reclamation
//! - Backends: Vulkan (`vulkan-backend` feature) and Dummy (for testing)
//!
//! ## Example
//!
//! ```ignore
//! use redlilium_gpu_sync::*;
//!
//! let mut ctx = SyncContext::new(SyncConfig::default())?;
//! let texture = ctx.create_image(ImageDesc::new_2d(256, 256, ImageFormat::Rgba8Unorm))?;
//! ctx.command_list().copy_to_image(texture, &pixels, MipUpload::Generate)?;
//!
//! let mut list = ctx.command_list();
//! let cmd = list.start_cmd("main", QueueFunction::Graphics, CommandBufferUsage::OneTime)?;
//! list.bind_descriptor_sets(cmd, PipelineBindPoint::Graphics, layout, 0, &[set]);
//! // ...
//! list.end_cmd(cmd)?;
//! list.submit_cmd(QueuePriority::Medium, &SubmitInfo::single(cmd), None)?;
//! ```

pub mod backend;
pub mod barriers;
pub mod command_list;
pub mod config;
pub mod context;
pub mod descriptors;
pub mod encoder;
pub mod error;
pub mod handle;
pub mod profiling;
pub mod registry;
pub mod resources;
pub mod submission;
pub mod sync;
pub mod tracker;
pub mod types;

mod arena;

// Re-export main types for convenience
pub use backend::{GpuBackend, dummy::DummyBackend};
pub use barriers::{BarrierBatch, BarrierDescriptor};
pub use command_list::{BatchCopyBuffer, BatchCopyData, CommandList, ImageRegion, MipUpload};
pub use config::SyncConfig;
pub use context::SyncContext;
pub use descriptors::{BindingAccess, DescriptorBinding, DescriptorSet};
pub use encoder::{
    BufferCopy, ClearValue, NativeCommand, RenderPassAttachment, RenderPassBegin,
};
pub use error::SyncError;
pub use handle::{CmdInfo, CommandBufferId, QueueOwner, ResourceId};
pub use registry::{CommandBufferRegistry, CommandBufferState, CommandBufferUsage};
pub use resources::{BufferDesc, ImageDesc, ResourceCaps, ResourceKind};
pub use submission::{SubmissionCoordinator, SubmissionStats, SubmitInfo};
pub use sync::{Fence, FenceStatus, Semaphore};
pub use tracker::{AccessIntent, AccessRequest, ResourceHazardTracker};
pub use types::{
    AccessFlags, Extent3d, ImageFormat, ImageLayout, IndexType, MipRange, Offset3d,
    PipelineBindPoint, PipelineStages, QueueFamilies, QueueFunction, QueuePriority, RawHandle,
    ScissorRect, ShaderStages, Viewport,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the synchronization layer.
pub fn init() {
    log::info!("RedLilium GPU Sync v{} initialized", VERSION);
}
