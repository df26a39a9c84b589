//! The owner of every registry in the synchronization layer.

use std::sync::Arc;

use crate::backend::{self, GpuBackend};
use crate::command_list::CommandList;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::handle::ResourceId;
use crate::registry::CommandBufferRegistry;
use crate::resources::{BufferDesc, ImageDesc, Resource, ResourceArena};
use crate::submission::{SubmissionCoordinator, SubmissionStats};
use crate::tracker::ResourceHazardTracker;
use crate::types::ImageLayout;

/// Resources, command buffers and hazard state for one device.
///
/// Recording goes through [`SyncContext::command_list`], submission through
/// [`SyncContext::submission`]. Both borrow the context mutably, so the
/// whole layer is driven from one thread.
///
/// # Example
///
/// ```ignore
/// let mut ctx = SyncContext::new(SyncConfig::default())?;
/// let buffer = ctx.create_buffer(BufferDesc::new(ResourceKind::StorageBuffer, 1024))?;
/// ctx.command_list().copy_to_buffer(buffer, 0, &[0u8; 1024])?;
/// ```
pub struct SyncContext {
    config: SyncConfig,
    backend: Arc<dyn GpuBackend>,
    resources: ResourceArena,
    tracker: ResourceHazardTracker,
    registry: CommandBufferRegistry,
    stats: SubmissionStats,
    frame: u64,
}

impl SyncContext {
    /// Create a context on the best available backend.
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let backend = backend::create_backend(config.validation)?;
        Ok(Self::with_backend(config, backend))
    }

    /// Create a context on an existing backend.
    ///
    /// The queue families reported by the backend replace the configured ones.
    pub fn with_backend(config: SyncConfig, backend: Arc<dyn GpuBackend>) -> Self {
        let config = config.with_queue_families(backend.queue_families());
        log::info!(
            "Sync context on {} backend, {} frames in flight",
            backend.name(),
            config.frames_in_flight
        );
        Self {
            config,
            backend,
            resources: ResourceArena::new(),
            tracker: ResourceHazardTracker::new(),
            registry: CommandBufferRegistry::new(),
            stats: SubmissionStats::default(),
            frame: 0,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    pub fn resources(&self) -> &ResourceArena {
        &self.resources
    }

    pub fn tracker(&self) -> &ResourceHazardTracker {
        &self.tracker
    }

    pub fn registry(&self) -> &CommandBufferRegistry {
        &self.registry
    }

    pub fn stats(&self) -> SubmissionStats {
        self.stats
    }

    /// Index of the current frame.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Create a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error for zero-sized buffers or when the backend fails.
    pub fn create_buffer(&mut self, desc: BufferDesc) -> Result<ResourceId, SyncError> {
        if desc.size == 0 {
            return Err(SyncError::InvalidParameter(
                "buffer size cannot be zero".to_string(),
            ));
        }
        let gpu = self.backend.create_buffer(&desc)?;
        let id = self.resources.insert(Resource::from_buffer(desc, gpu));
        log::trace!("Created buffer {id}");
        Ok(id)
    }

    /// Create an image. Its tracked layout starts as `Undefined`.
    pub fn create_image(&mut self, desc: ImageDesc) -> Result<ResourceId, SyncError> {
        let extent = desc.extent;
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 || desc.mip_levels == 0 {
            return Err(SyncError::InvalidParameter(format!(
                "invalid image extent {extent:?} with {} mips",
                desc.mip_levels
            )));
        }
        let gpu = self.backend.create_image(&desc)?;
        let id = self.resources.insert(Resource::from_image(desc, gpu));
        self.tracker.set_layout(id, ImageLayout::Undefined);
        log::trace!("Created image {id}");
        Ok(id)
    }

    /// Schedule a resource for destruction once every frame in flight has
    /// moved past it.
    pub fn retire_resource(&mut self, id: ResourceId) -> bool {
        self.resources
            .retire(id, self.frame + self.config.frames_in_flight)
    }

    /// Advance to the next frame and destroy resources that became free.
    pub fn new_frame(&mut self) {
        crate::profiling::profile_scope!("new_frame");
        for (id, resource) in self.resources.reclaim(self.frame, &mut self.tracker) {
            log::trace!("Destroying retired {id}");
            resource.destroy(self.backend.as_ref());
        }
        let resources = &self.resources;
        self.tracker.clear_unwanted(|id| resources.is_live(id));
        self.frame += 1;
    }

    /// Recording view over this context.
    pub fn command_list(&mut self) -> CommandList<'_> {
        CommandList::new(
            self.backend.as_ref(),
            &self.config,
            &mut self.resources,
            &mut self.tracker,
            &mut self.registry,
            &mut self.stats,
        )
    }

    /// Submission view over this context.
    pub fn submission(&mut self) -> SubmissionCoordinator<'_> {
        SubmissionCoordinator::new(
            self.backend.as_ref(),
            &self.config,
            &mut self.registry,
            &mut self.tracker,
            &mut self.stats,
        )
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        if let Err(e) = self.submission().flush_all_commands() {
            log::error!("Failed to flush command buffers on shutdown: {e}");
        }
        let leaked_cmds = self.registry.report_leaks();
        let leaked_resources = self.resources.report_leaks();
        if leaked_cmds + leaked_resources > 0 {
            log::warn!(
                "Shutting down with {leaked_cmds} command buffers and {leaked_resources} resources alive"
            );
        }
        self.registry.drain(self.backend.as_ref());
        for (_, resource) in self.resources.drain() {
            resource.destroy(self.backend.as_ref());
        }
        if let Err(e) = self.backend.wait_idle() {
            log::error!("Failed to idle device on shutdown: {e}");
        }
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("backend", &self.backend.name())
            .field("frame", &self.frame)
            .field("resources", &self.resources.len())
            .field("command_buffers", &self.registry.len())
            .finish()
    }
}
