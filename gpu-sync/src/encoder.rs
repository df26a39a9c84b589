//! Backend-neutral commands recorded into a command buffer.
//!
//! The command list turns every high-level operation into a sequence of
//! [`NativeCommand`]s. Backends translate them one by one; the dummy backend
//! keeps them so tests can inspect exactly what was recorded.

use crate::barriers::BarrierDescriptor;
use crate::handle::ResourceId;
use crate::types::{
    Extent3d, ImageLayout, IndexType, MipRange, Offset3d, PipelineBindPoint, PipelineStages,
    RawHandle, ScissorRect, ShaderStages, Viewport,
};

/// One region of a buffer to buffer copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

impl BufferCopy {
    pub fn new(src_offset: u64, dst_offset: u64, size: u64) -> Self {
        Self {
            src_offset,
            dst_offset,
            size,
        }
    }

    /// Whether the source and destination byte ranges intersect.
    pub fn overlaps_self(&self) -> bool {
        ranges_overlap(self.src_offset, self.dst_offset, self.size)
    }
}

fn ranges_overlap(a: u64, b: u64, size: u64) -> bool {
    size > 0 && a < b.saturating_add(size) && b < a.saturating_add(size)
}

/// One region of a buffer to image copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub mip_level: u32,
    pub base_layer: u32,
    pub layer_count: u32,
    pub image_offset: Offset3d,
    pub image_extent: Extent3d,
}

impl BufferImageCopy {
    /// Whole single-layer mip level read from `buffer_offset`.
    pub fn mip(buffer_offset: u64, mip_level: u32, extent: Extent3d) -> Self {
        Self {
            buffer_offset,
            mip_level,
            base_layer: 0,
            layer_count: 1,
            image_offset: Offset3d::default(),
            image_extent: extent,
        }
    }
}

/// One region of an image to image copy or resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageCopy {
    pub src_mip: u32,
    pub src_offset: Offset3d,
    pub dst_mip: u32,
    pub dst_offset: Offset3d,
    pub extent: Extent3d,
    pub base_layer: u32,
    pub layer_count: u32,
}

/// A scaled copy from one mip level to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageBlit {
    pub src_mip: u32,
    pub src_extent: Extent3d,
    pub dst_mip: u32,
    pub dst_extent: Extent3d,
}

/// Clear value for a single attachment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

/// An image bound as a render pass attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPassAttachment {
    pub image: ResourceId,
    /// Layout the render pass expects on entry. `Undefined` discards contents.
    pub initial_layout: ImageLayout,
    /// Layout the render pass leaves the image in.
    pub final_layout: ImageLayout,
    pub is_depth: bool,
}

/// Everything needed to begin a render pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassBegin {
    pub render_pass: RawHandle,
    pub framebuffer: RawHandle,
    pub extent: Extent3d,
    pub clear_values: Vec<ClearValue>,
    pub attachments: Vec<RenderPassAttachment>,
    /// Swapchain the render pass draws into, if any.
    pub presents: Option<RawHandle>,
}

/// A command in backend-neutral form.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeCommand {
    PipelineBarrier {
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
        by_region: bool,
        barriers: Vec<BarrierDescriptor>,
    },
    CopyBuffer {
        src: ResourceId,
        dst: ResourceId,
        regions: Vec<BufferCopy>,
    },
    CopyBufferToImage {
        src: ResourceId,
        dst: ResourceId,
        layout: ImageLayout,
        regions: Vec<BufferImageCopy>,
    },
    BlitImage {
        image: ResourceId,
        blit: ImageBlit,
    },
    CopyImage {
        src: ResourceId,
        src_layout: ImageLayout,
        dst: ResourceId,
        dst_layout: ImageLayout,
        regions: Vec<ImageCopy>,
    },
    ResolveImage {
        src: ResourceId,
        src_layout: ImageLayout,
        dst: ResourceId,
        dst_layout: ImageLayout,
        regions: Vec<ImageCopy>,
    },
    ClearColorImage {
        image: ResourceId,
        layout: ImageLayout,
        color: [f32; 4],
        mips: MipRange,
    },
    ClearDepthStencilImage {
        image: ResourceId,
        layout: ImageLayout,
        depth: f32,
        stencil: u32,
        mips: MipRange,
    },
    BeginRenderPass(RenderPassBegin),
    EndRenderPass,
    BindPipeline {
        bind_point: PipelineBindPoint,
        pipeline: RawHandle,
    },
    BindDescriptorSets {
        bind_point: PipelineBindPoint,
        layout: RawHandle,
        first_set: u32,
        sets: Vec<RawHandle>,
    },
    PushConstants {
        layout: RawHandle,
        stages: ShaderStages,
        offset: u32,
        data: Vec<u8>,
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<(ResourceId, u64)>,
    },
    BindIndexBuffer {
        buffer: ResourceId,
        offset: u64,
        index_type: IndexType,
    },
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    SetLineWidth(f32),
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    DispatchIndirect {
        buffer: ResourceId,
        offset: u64,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawIndirect {
        buffer: ResourceId,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },
    DrawIndexedIndirect {
        buffer: ResourceId,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },
}

impl NativeCommand {
    pub fn is_barrier(&self) -> bool {
        matches!(self, Self::PipelineBarrier { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_copy_overlap() {
        assert!(BufferCopy::new(0, 32, 64).overlaps_self());
        assert!(!BufferCopy::new(0, 64, 64).overlaps_self());
        assert!(!BufferCopy::new(0, 0, 0).overlaps_self());
    }
}
