//! Common types shared across the synchronization layer.
//!
//! Queue functions, pipeline stage and access masks, image layouts and
//! formats, plus the small value types recorded into command buffers.

mod common;
mod format;
mod layout;
mod queue;
mod stage;

pub use common::{
    DrawIndexedIndirectArgs, DrawIndirectArgs, Extent3d, IndexType, MipRange, Offset3d,
    PipelineBindPoint, RawHandle, ScissorRect, ShaderStages, Viewport,
};
pub use format::ImageFormat;
pub use layout::ImageLayout;
pub use queue::{QUEUE_FAMILY_IGNORED, QueueFamilies, QueueFunction, QueuePriority};
pub use stage::{AccessFlags, PipelineStages};
