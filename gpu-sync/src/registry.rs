//! Command buffer lifetime bookkeeping.
//!
//! The registry owns every native command buffer and its state:
//! `Allocated -> Recording -> Ended -> Submitted -> Finished`, and freed once
//! removed. It knows nothing about barriers; the submission coordinator drives
//! the hazard tracker from the transitions recorded here.

use std::collections::HashMap;

use crate::arena::SlotArena;
use crate::backend::{GpuBackend, GpuCommandBuffer};
use crate::error::SyncError;
use crate::handle::{CmdInfo, CommandBufferId};
use crate::sync::{Fence, Semaphore};
use crate::types::{QueueFamilies, QueueFunction, QueuePriority};

/// How a command buffer is going to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferUsage {
    /// Anonymous, recorded once, freed right after it finishes.
    Temporary,
    /// Named, recorded once, must be freed before the name is recorded again.
    OneTime,
    /// Named, may be recorded again after it finishes.
    Reusable,
}

/// Lifetime state of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    Allocated,
    Recording,
    Ended,
    Submitted,
    Finished,
}

/// Registry entry for one command buffer.
#[derive(Debug)]
pub struct CommandBufferRecord {
    pub(crate) name: String,
    pub(crate) queue: QueueFunction,
    pub(crate) family: u32,
    pub(crate) usage: CommandBufferUsage,
    pub(crate) state: CommandBufferState,
    pub(crate) in_render_pass: bool,
    pub(crate) writes_swapchain: bool,
    pub(crate) priority: QueuePriority,
    pub(crate) signal_semaphore: Option<Semaphore>,
    pub(crate) fence: Option<Fence>,
    pub(crate) gpu: GpuCommandBuffer,
}

impl CommandBufferRecord {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> QueueFunction {
        self.queue
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn usage(&self) -> CommandBufferUsage {
        self.usage
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn is_reusable(&self) -> bool {
        self.usage == CommandBufferUsage::Reusable
    }

    pub fn is_finished(&self) -> bool {
        self.state == CommandBufferState::Finished
    }

    pub fn is_in_render_pass(&self) -> bool {
        self.in_render_pass
    }

    /// Whether a render pass in this buffer draws into a swapchain image.
    pub fn writes_swapchain(&self) -> bool {
        self.writes_swapchain
    }

    pub fn priority(&self) -> QueuePriority {
        self.priority
    }

    /// Semaphore signaled by the last submission of this buffer.
    pub fn signal_semaphore(&self) -> Option<&Semaphore> {
        self.signal_semaphore.as_ref()
    }

    pub fn fence(&self) -> Option<&Fence> {
        self.fence.as_ref()
    }

    pub fn gpu(&self) -> &GpuCommandBuffer {
        &self.gpu
    }
}

/// Owner of every command buffer.
#[derive(Debug, Default)]
pub struct CommandBufferRegistry {
    records: SlotArena<CommandBufferRecord>,
    by_name: HashMap<String, CommandBufferId>,
}

impl CommandBufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start recording a command buffer for `queue`.
    ///
    /// Named buffers are looked up first. Starting a buffer that is already
    /// recording returns it with a warning; starting one that may still be
    /// in use is a fatal error.
    pub fn begin(
        &mut self,
        backend: &dyn GpuBackend,
        families: &QueueFamilies,
        name: &str,
        queue: QueueFunction,
        usage: CommandBufferUsage,
    ) -> Result<CommandBufferId, SyncError> {
        let existing = match usage {
            CommandBufferUsage::Temporary => None,
            _ => self.by_name.get(name).copied(),
        };

        if let Some(id) = existing
            && let Some(record) = self.records.get_mut(id.0)
        {
            assert_eq!(
                record.usage, usage,
                "command buffer {name} restarted with a different usage"
            );
            match (record.state, usage) {
                (CommandBufferState::Recording, _) => {
                    log::warn!("Command buffer {name} is already being recorded");
                    return Ok(id);
                }
                (CommandBufferState::Allocated, _)
                | (CommandBufferState::Finished, CommandBufferUsage::Reusable) => {}
                (state, CommandBufferUsage::Reusable) => {
                    log::error!("Cannot record command buffer {name} in state {state:?} before it finishes");
                    panic!("reusable command buffer {name} recorded again before finish");
                }
                (state, _) => {
                    log::error!("Cannot record prerecorded command buffer {name} ({state:?}) again");
                    panic!("one time command buffer {name} recorded again");
                }
            }
            backend.begin_command_buffer(&record.gpu, usage != CommandBufferUsage::Reusable)?;
            record.state = CommandBufferState::Recording;
            record.in_render_pass = false;
            record.writes_swapchain = false;
            record.signal_semaphore = None;
            record.fence = None;
            return Ok(id);
        }

        let family = families.family(queue);
        let gpu = backend.allocate_command_buffer(queue, family, name)?;
        backend.begin_command_buffer(&gpu, usage != CommandBufferUsage::Reusable)?;
        let id = CommandBufferId(self.records.insert(CommandBufferRecord {
            name: name.to_string(),
            queue,
            family,
            usage,
            state: CommandBufferState::Recording,
            in_render_pass: false,
            writes_swapchain: false,
            priority: QueuePriority::default(),
            signal_semaphore: None,
            fence: None,
            gpu,
        }));
        if usage != CommandBufferUsage::Temporary {
            self.by_name.insert(name.to_string(), id);
        }
        log::trace!("Started {id} ({name}) on {queue} queue family {family}");
        Ok(id)
    }

    /// Stop recording.
    ///
    /// # Panics
    ///
    /// Panics if a render pass is still open or the buffer is not recording.
    pub fn end(&mut self, backend: &dyn GpuBackend, id: CommandBufferId) -> Result<(), SyncError> {
        let record = self.expect_mut(id);
        assert!(
            !record.in_render_pass,
            "command buffer {} ended inside a render pass",
            record.name
        );
        assert_eq!(
            record.state,
            CommandBufferState::Recording,
            "command buffer {} ended while not recording",
            record.name
        );
        backend.end_command_buffer(&record.gpu)?;
        record.state = CommandBufferState::Ended;
        Ok(())
    }

    pub fn begin_render_pass(&mut self, id: CommandBufferId) {
        let record = self.expect_mut(id);
        assert_eq!(
            record.state,
            CommandBufferState::Recording,
            "{} is not recording to start a render pass",
            record.name
        );
        assert!(
            !record.in_render_pass,
            "{} already has an open render pass",
            record.name
        );
        record.in_render_pass = true;
    }

    pub fn end_render_pass(&mut self, id: CommandBufferId) {
        let record = self.expect_mut(id);
        if !record.in_render_pass {
            log::error!("{} has no open render pass to end", record.name);
        }
        record.in_render_pass = false;
    }

    pub fn mark_writes_swapchain(&mut self, id: CommandBufferId) {
        self.expect_mut(id).writes_swapchain = true;
    }

    pub(crate) fn mark_submitted(
        &mut self,
        id: CommandBufferId,
        priority: QueuePriority,
        signal_semaphore: Semaphore,
        fence: Fence,
    ) {
        let record = self.expect_mut(id);
        record.state = CommandBufferState::Submitted;
        record.priority = priority;
        record.signal_semaphore = Some(signal_semaphore);
        record.fence = Some(fence);
    }

    pub(crate) fn mark_finished(&mut self, id: CommandBufferId) {
        let record = self.expect_mut(id);
        record.state = CommandBufferState::Finished;
        record.fence = None;
        record.signal_semaphore = None;
    }

    /// Forget `semaphores` on every buffer that signals them.
    ///
    /// A binary semaphore signal satisfies a single wait. Once a submission
    /// waits on it, later dependents have to wait on the producer's fence.
    pub(crate) fn consume_signals(&mut self, semaphores: &[Semaphore]) {
        if semaphores.is_empty() {
            return;
        }
        for (_, record) in self.records.iter_mut() {
            if record
                .signal_semaphore
                .as_ref()
                .is_some_and(|s| semaphores.contains(s))
            {
                record.signal_semaphore = None;
            }
        }
    }

    /// Mark a buffer that will never be submitted as done.
    ///
    /// Only valid for buffers that are not in flight.
    pub(crate) fn mark_discarded(&mut self, id: CommandBufferId) {
        let record = self.expect_mut(id);
        assert_ne!(
            record.state,
            CommandBufferState::Submitted,
            "command buffer {} discarded while in flight",
            record.name
        );
        record.in_render_pass = false;
        record.state = CommandBufferState::Finished;
    }

    /// Free a command buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer has been submitted or ended without finishing.
    pub fn free(&mut self, backend: &dyn GpuBackend, id: CommandBufferId) {
        let Some(record) = self.records.get(id.0) else {
            log::warn!("Freeing unknown command buffer {id}");
            return;
        };
        if !matches!(
            record.state,
            CommandBufferState::Finished | CommandBufferState::Allocated
        ) {
            log::error!(
                "Command buffer {} freed in state {:?} before finish",
                record.name,
                record.state
            );
            panic!("command buffer {} freed before finish", record.name);
        }
        if let Some(record) = self.records.remove(id.0) {
            if self.by_name.get(&record.name) == Some(&id) {
                self.by_name.remove(&record.name);
            }
            backend.free_command_buffer(record.gpu);
        }
    }

    pub fn get(&self, id: CommandBufferId) -> Option<&CommandBufferRecord> {
        self.records.get(id.0)
    }

    /// Id of the named buffer, if any.
    pub fn find(&self, name: &str) -> Option<CommandBufferId> {
        self.by_name.get(name).copied()
    }

    pub fn contains(&self, id: CommandBufferId) -> bool {
        self.records.contains(id.0)
    }

    pub fn state(&self, id: CommandBufferId) -> Option<CommandBufferState> {
        self.get(id).map(|r| r.state)
    }

    /// Identity the hazard tracker uses for this buffer.
    pub fn cmd_info(&self, id: CommandBufferId) -> Option<CmdInfo> {
        self.get(id).map(|r| CmdInfo::new(id, r.queue, r.family))
    }

    /// Every buffer in `state`, in slot order.
    pub fn ids_in_state(&self, state: CommandBufferState) -> Vec<CommandBufferId> {
        self.records
            .iter()
            .filter(|(_, r)| r.state == state)
            .map(|(key, _)| CommandBufferId(key))
            .collect()
    }

    /// Submitted buffers that render into a swapchain image.
    pub fn swapchain_writers(&self) -> Vec<CommandBufferId> {
        self.records
            .iter()
            .filter(|(_, r)| r.writes_swapchain && r.state == CommandBufferState::Submitted)
            .map(|(key, _)| CommandBufferId(key))
            .collect()
    }

    pub(crate) fn expect_mut(&mut self, id: CommandBufferId) -> &mut CommandBufferRecord {
        match self.records.get_mut(id.0) {
            Some(record) => record,
            None => panic!("stale command buffer {id}"),
        }
    }

    /// Log every command buffer still registered.
    pub fn report_leaks(&self) -> usize {
        let mut leaks = 0;
        for (key, record) in self.records.iter() {
            leaks += 1;
            log::warn!(
                "Command buffer {} ({}) still registered in state {:?}",
                CommandBufferId(key),
                record.name,
                record.state
            );
        }
        leaks
    }

    /// Free every command buffer regardless of state.
    pub(crate) fn drain(&mut self, backend: &dyn GpuBackend) {
        self.by_name.clear();
        for (_, record) in self.records.drain() {
            backend.free_command_buffer(record.gpu);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
