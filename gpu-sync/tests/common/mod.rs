//! Common utilities for synchronization integration tests.
//!
//! Tests run against the dummy backend, which keeps every recorded command so
//! the exact barrier sequence can be inspected.

use std::sync::Arc;

use redlilium_gpu_sync::backend::dummy::{CommandLog, SubmissionLog};
use redlilium_gpu_sync::{
    BarrierDescriptor, BufferDesc, CommandBufferId, DummyBackend, GpuBackend, ImageDesc,
    ImageFormat, NativeCommand, QueueFamilies, ResourceCaps, ResourceId, ResourceKind,
    SyncConfig, SyncContext,
};

pub const GRAPHICS_FAMILY: u32 = 0;
pub const COMPUTE_FAMILY: u32 = 1;
pub const TRANSFER_FAMILY: u32 = 2;

/// Queue family layouts the tests run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Dummy backend with dedicated compute and transfer families.
    Dummy,
    /// Dummy backend where every queue shares the graphics family.
    DummySingleFamily,
}

impl Backend {
    pub fn queue_families(self) -> QueueFamilies {
        match self {
            Backend::Dummy => QueueFamilies::new(GRAPHICS_FAMILY, COMPUTE_FAMILY, TRANSFER_FAMILY),
            Backend::DummySingleFamily => QueueFamilies::unified(GRAPHICS_FAMILY),
        }
    }

    pub fn has_transfer_family(self) -> bool {
        self == Backend::Dummy
    }
}

/// A context plus typed access to its dummy backend.
pub struct TestContext {
    pub backend: Arc<DummyBackend>,
    pub ctx: SyncContext,
}

impl TestContext {
    pub fn new(backend: Backend) -> Self {
        Self::with_config(backend, SyncConfig::default())
    }

    pub fn with_config(backend: Backend, config: SyncConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let dummy = Arc::new(DummyBackend::with_queue_families(backend.queue_families()));
        let shared: Arc<dyn GpuBackend> = dummy.clone();
        Self {
            backend: dummy,
            ctx: SyncContext::with_backend(config, shared),
        }
    }

    pub fn storage_buffer(&mut self, size: u64) -> ResourceId {
        self.ctx
            .create_buffer(BufferDesc::new(ResourceKind::StorageBuffer, size))
            .unwrap()
    }

    pub fn vertex_buffer(&mut self, size: u64) -> ResourceId {
        let desc = BufferDesc::new(ResourceKind::StorageBuffer, size)
            .with_caps(ResourceCaps::default() | ResourceCaps::VERTEX);
        self.ctx.create_buffer(desc).unwrap()
    }

    pub fn texture(&mut self, size: u32, mips: u32) -> ResourceId {
        let desc = ImageDesc::new_2d(size, size, ImageFormat::Rgba8Unorm).with_mip_levels(mips);
        self.ctx.create_image(desc).unwrap()
    }

    pub fn color_target(&mut self, size: u32) -> ResourceId {
        let desc = ImageDesc::new_2d(size, size, ImageFormat::Rgba8Unorm)
            .with_caps(ResourceCaps::default() | ResourceCaps::ATTACHMENT | ResourceCaps::SAMPLED);
        self.ctx.create_image(desc).unwrap()
    }

    /// Log of the command buffer behind `cmd`.
    pub fn log(&self, cmd: CommandBufferId) -> CommandLog {
        let record = self.ctx.registry().get(cmd).unwrap();
        self.backend.command_log(record.gpu()).unwrap()
    }

    /// Log of the latest command buffer called `name`, freed or not.
    pub fn log_named(&self, name: &str) -> CommandLog {
        self.backend.command_log_named(name).unwrap()
    }

    pub fn submissions(&self) -> Vec<SubmissionLog> {
        self.backend.submissions()
    }
}

/// Barriers of every pipeline barrier command, one inner list per command.
pub fn barrier_groups(commands: &[NativeCommand]) -> Vec<Vec<BarrierDescriptor>> {
    commands
        .iter()
        .filter_map(|command| match command {
            NativeCommand::PipelineBarrier { barriers, .. } => Some(barriers.clone()),
            _ => None,
        })
        .collect()
}

/// Every barrier touching `resource`, in recorded order.
pub fn barriers_for(commands: &[NativeCommand], resource: ResourceId) -> Vec<BarrierDescriptor> {
    barrier_groups(commands)
        .into_iter()
        .flatten()
        .filter(|b| b.resource == resource)
        .collect()
}

/// Short tags for the command sequence, barriers as "barrier".
#[allow(dead_code)]
pub fn command_kinds(commands: &[NativeCommand]) -> Vec<&'static str> {
    commands
        .iter()
        .map(|command| match command {
            NativeCommand::PipelineBarrier { .. } => "barrier",
            NativeCommand::CopyBuffer { .. } => "copy_buffer",
            NativeCommand::CopyBufferToImage { .. } => "copy_buffer_to_image",
            NativeCommand::BlitImage { .. } => "blit",
            NativeCommand::CopyImage { .. } => "copy_image",
            NativeCommand::ResolveImage { .. } => "resolve_image",
            NativeCommand::ClearColorImage { .. } => "clear_color",
            NativeCommand::ClearDepthStencilImage { .. } => "clear_depth",
            NativeCommand::BeginRenderPass(_) => "begin_render_pass",
            NativeCommand::EndRenderPass => "end_render_pass",
            NativeCommand::BindPipeline { .. } => "bind_pipeline",
            NativeCommand::BindDescriptorSets { .. } => "bind_descriptor_sets",
            NativeCommand::PushConstants { .. } => "push_constants",
            NativeCommand::BindVertexBuffers { .. } => "bind_vertex_buffers",
            NativeCommand::BindIndexBuffer { .. } => "bind_index_buffer",
            NativeCommand::SetViewport(_) => "set_viewport",
            NativeCommand::SetScissor(_) => "set_scissor",
            NativeCommand::SetLineWidth(_) => "set_line_width",
            NativeCommand::Dispatch { .. } => "dispatch",
            NativeCommand::DispatchIndirect { .. } => "dispatch_indirect",
            NativeCommand::Draw { .. } => "draw",
            NativeCommand::DrawIndexed { .. } => "draw_indexed",
            NativeCommand::DrawIndirect { .. } => "draw_indirect",
            NativeCommand::DrawIndexedIndirect { .. } => "draw_indexed_indirect",
        })
        .collect()
}
