//! Dummy GPU backend for testing and development.
//!
//! No GPU work happens. Every recorded command is kept per command buffer and
//! every submission is logged, so tests can check exactly which barriers the
//! synchronization layer produced. Fences signal as soon as they are submitted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::encoder::NativeCommand;
use crate::error::SyncError;
use crate::resources::{BufferDesc, ImageDesc, ResourceArena};
use crate::types::{PipelineStages, QueueFamilies, QueueFunction, QueuePriority};

use super::{
    GpuBackend, GpuBuffer, GpuCommandBuffer, GpuFence, GpuImage, GpuSemaphore, PresentRequest,
    SubmitBatch,
};

/// Commands recorded into one dummy command buffer.
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    pub name: String,
    pub queue: Option<QueueFunction>,
    pub family: u32,
    pub commands: Vec<NativeCommand>,
    pub recording: bool,
    pub freed: bool,
}

impl CommandLog {
    /// Only the barrier commands, in recorded order.
    pub fn barriers(&self) -> impl Iterator<Item = &NativeCommand> {
        self.commands.iter().filter(|c| c.is_barrier())
    }
}

/// One logged queue submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionLog {
    pub queue: QueueFunction,
    pub priority: QueuePriority,
    pub command_buffers: Vec<u64>,
    pub wait_semaphores: Vec<(u64, PipelineStages)>,
    pub signal_semaphores: Vec<u64>,
    pub fence: bool,
}

/// Dummy GPU backend.
#[derive(Debug)]
pub struct DummyBackend {
    families: QueueFamilies,
    next_id: AtomicU64,
    logs: Mutex<HashMap<u64, CommandLog>>,
    submissions: Mutex<Vec<SubmissionLog>>,
    presents: Mutex<Vec<Vec<u32>>>,
    present_waits: Mutex<Vec<Vec<u64>>>,
    failing_submits: AtomicUsize,
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyBackend {
    /// Create a new dummy backend with dedicated compute and transfer families.
    pub fn new() -> Self {
        Self::with_queue_families(QueueFamilies::new(0, 1, 2))
    }

    pub fn with_queue_families(families: QueueFamilies) -> Self {
        Self {
            families,
            next_id: AtomicU64::new(1),
            logs: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            presents: Mutex::new(Vec::new()),
            present_waits: Mutex::new(Vec::new()),
            failing_submits: AtomicUsize::new(0),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Log of a command buffer handle.
    pub fn command_log(&self, cmd: &GpuCommandBuffer) -> Option<CommandLog> {
        match cmd {
            GpuCommandBuffer::Dummy { id } => self.logs.lock().get(id).cloned(),
            #[cfg(feature = "vulkan-backend")]
            _ => None,
        }
    }

    /// Most recently allocated command buffer called `name`.
    pub fn command_log_named(&self, name: &str) -> Option<CommandLog> {
        let logs = self.logs.lock();
        logs.iter()
            .filter(|(_, log)| log.name == name)
            .max_by_key(|(id, _)| **id)
            .map(|(_, log)| log.clone())
    }

    /// Every submission so far, in order.
    pub fn submissions(&self) -> Vec<SubmissionLog> {
        self.submissions.lock().clone()
    }

    /// Image indices of every present so far.
    pub fn presents(&self) -> Vec<Vec<u32>> {
        self.presents.lock().clone()
    }

    /// Semaphores each present waited on.
    pub fn present_waits(&self) -> Vec<Vec<u64>> {
        self.present_waits.lock().clone()
    }

    /// Make the next `count` submissions fail as if the driver rejected them.
    pub fn fail_next_submits(&self, count: usize) {
        self.failing_submits.store(count, Ordering::Release);
    }

    /// Number of command buffers allocated and not yet freed.
    pub fn live_command_buffers(&self) -> usize {
        self.logs.lock().values().filter(|log| !log.freed).count()
    }

    fn with_log(&self, cmd: &GpuCommandBuffer, f: impl FnOnce(&mut CommandLog)) {
        if let GpuCommandBuffer::Dummy { id } = cmd {
            match self.logs.lock().get_mut(id) {
                Some(log) => f(log),
                None => log::error!("DummyBackend: unknown command buffer {id}"),
            }
        }
    }
}

fn semaphore_id(semaphore: &GpuSemaphore) -> u64 {
    match semaphore {
        GpuSemaphore::Dummy { id } => *id,
        #[cfg(feature = "vulkan-backend")]
        _ => 0,
    }
}

fn command_buffer_id(cmd: &GpuCommandBuffer) -> u64 {
    match cmd {
        GpuCommandBuffer::Dummy { id } => *id,
        #[cfg(feature = "vulkan-backend")]
        _ => 0,
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<GpuBuffer, SyncError> {
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        Ok(GpuBuffer::Dummy { size: desc.size })
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<GpuImage, SyncError> {
        log::trace!(
            "DummyBackend: creating image {:?} ({}x{}x{}, {} mips)",
            desc.label,
            desc.extent.width,
            desc.extent.height,
            desc.extent.depth,
            desc.mip_levels
        );
        Ok(GpuImage::Dummy)
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) {
        log::trace!("DummyBackend: destroying {buffer:?}");
    }

    fn destroy_image(&self, image: GpuImage) {
        log::trace!("DummyBackend: destroying {image:?}");
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<(), SyncError> {
        let end = offset + data.len() as u64;
        if end > buffer.size() {
            return Err(SyncError::InvalidParameter(format!(
                "write of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                buffer.size()
            )));
        }
        Ok(())
    }

    fn allocate_command_buffer(
        &self,
        queue: QueueFunction,
        family: u32,
        name: &str,
    ) -> Result<GpuCommandBuffer, SyncError> {
        let id = self.next_id();
        self.logs.lock().insert(
            id,
            CommandLog {
                name: name.to_string(),
                queue: Some(queue),
                family,
                ..CommandLog::default()
            },
        );
        Ok(GpuCommandBuffer::Dummy { id })
    }

    fn begin_command_buffer(
        &self,
        cmd: &GpuCommandBuffer,
        _one_time: bool,
    ) -> Result<(), SyncError> {
        self.with_log(cmd, |log| {
            log.commands.clear();
            log.recording = true;
        });
        Ok(())
    }

    fn end_command_buffer(&self, cmd: &GpuCommandBuffer) -> Result<(), SyncError> {
        self.with_log(cmd, |log| log.recording = false);
        Ok(())
    }

    fn free_command_buffer(&self, cmd: GpuCommandBuffer) {
        self.with_log(&cmd, |log| log.freed = true);
    }

    fn record(&self, cmd: &GpuCommandBuffer, command: &NativeCommand, _resources: &ResourceArena) {
        self.with_log(cmd, |log| {
            if !log.recording {
                log::error!("DummyBackend: recording into {} while not recording", log.name);
            }
            log.commands.push(command.clone());
        });
    }

    fn create_fence(&self, signaled: bool) -> Result<GpuFence, SyncError> {
        Ok(GpuFence::Dummy {
            signaled: AtomicBool::new(signaled),
        })
    }

    fn wait_fence(&self, fence: &GpuFence, _timeout: Duration) -> Result<(), SyncError> {
        if self.is_fence_signaled(fence) {
            Ok(())
        } else {
            // Nothing will ever signal it.
            Err(SyncError::Timeout)
        }
    }

    fn is_fence_signaled(&self, fence: &GpuFence) -> bool {
        match fence {
            GpuFence::Dummy { signaled } => signaled.load(Ordering::Acquire),
            #[cfg(feature = "vulkan-backend")]
            _ => false,
        }
    }

    fn reset_fence(&self, fence: &GpuFence) -> Result<(), SyncError> {
        if let GpuFence::Dummy { signaled } = fence {
            signaled.store(false, Ordering::Release);
        }
        Ok(())
    }

    fn create_semaphore(&self) -> Result<GpuSemaphore, SyncError> {
        Ok(GpuSemaphore::Dummy { id: self.next_id() })
    }

    fn submit(
        &self,
        queue: QueueFunction,
        priority: QueuePriority,
        batches: &[SubmitBatch<'_>],
        fence: Option<&GpuFence>,
    ) -> Result<(), SyncError> {
        if self
            .failing_submits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::SubmissionFailed(format!(
                "injected failure on {queue} queue"
            )));
        }
        let mut submissions = self.submissions.lock();
        for batch in batches {
            submissions.push(SubmissionLog {
                queue,
                priority,
                command_buffers: batch
                    .command_buffers
                    .iter()
                    .map(|c| command_buffer_id(c))
                    .collect(),
                wait_semaphores: batch
                    .wait_semaphores
                    .iter()
                    .map(|(s, stages)| (semaphore_id(s), *stages))
                    .collect(),
                signal_semaphores: batch
                    .signal_semaphores
                    .iter()
                    .map(|s| semaphore_id(s))
                    .collect(),
                fence: fence.is_some(),
            });
        }
        if let Some(GpuFence::Dummy { signaled }) = fence {
            signaled.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn present(&self, request: &PresentRequest<'_>) -> Result<(), SyncError> {
        self.presents.lock().push(request.image_indices.to_vec());
        self.present_waits
            .lock()
            .push(request.wait_semaphores.iter().map(|s| semaphore_id(s)).collect());
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), SyncError> {
        Ok(())
    }
}
