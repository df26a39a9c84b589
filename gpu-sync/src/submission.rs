//! Queue submission and completion bookkeeping.
//!
//! [`SubmissionCoordinator`] is a short-lived view over the registry and the
//! hazard tracker. Submitting turns the tracker's command buffer dependencies
//! into semaphore waits; finishing waits on the fence and purges the
//! finished buffer from the tracker.

use crate::backend::{GpuBackend, PresentRequest, SubmitBatch};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::handle::{CommandBufferId, ResourceId};
use crate::profiling::profile_scope;
use crate::registry::{CommandBufferRegistry, CommandBufferState, CommandBufferUsage};
use crate::sync::{Fence, Semaphore};
use crate::tracker::ResourceHazardTracker;
use crate::types::{PipelineStages, QueueFunction, QueuePriority, RawHandle};

/// One batch of command buffers to submit together.
#[derive(Debug, Clone, Default)]
pub struct SubmitInfo {
    pub cmds: Vec<CommandBufferId>,
    /// Extra command buffers to wait for, at every stage.
    pub wait_on_cmds: Vec<CommandBufferId>,
    pub wait_semaphores: Vec<(Semaphore, PipelineStages)>,
    pub signal_semaphores: Vec<Semaphore>,
}

impl SubmitInfo {
    pub fn new(cmds: impl IntoIterator<Item = CommandBufferId>) -> Self {
        Self {
            cmds: cmds.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn single(cmd: CommandBufferId) -> Self {
        Self::new([cmd])
    }

    pub fn wait_on(mut self, cmd: CommandBufferId) -> Self {
        self.wait_on_cmds.push(cmd);
        self
    }

    pub fn wait_semaphore(mut self, semaphore: Semaphore, stages: PipelineStages) -> Self {
        self.wait_semaphores.push((semaphore, stages));
        self
    }

    pub fn signal(mut self, semaphore: Semaphore) -> Self {
        self.signal_semaphores.push(semaphore);
        self
    }
}

/// Running totals, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmissionStats {
    pub submissions: u64,
    pub command_buffers: u64,
    pub semaphore_waits: u64,
    pub finished: u64,
}

/// A submitted producer the submission has to wait for.
///
/// `semaphore` is `None` when the producer's signal was already waited on.
struct ProducerWait {
    semaphore: Option<Semaphore>,
    fence: Option<Fence>,
    stages: PipelineStages,
}

fn merge_wait(
    waits: &mut Vec<(Semaphore, PipelineStages)>,
    semaphore: &Semaphore,
    stages: PipelineStages,
) {
    match waits.iter_mut().find(|(s, _)| s == semaphore) {
        Some((_, existing)) => *existing |= stages,
        None => waits.push((semaphore.clone(), stages)),
    }
}

struct PreparedBatch {
    cmds: Vec<CommandBufferId>,
    waits: Vec<(Semaphore, PipelineStages)>,
    signals: Vec<Semaphore>,
    own_signal: Semaphore,
}

/// Submits, finishes and frees command buffers.
pub struct SubmissionCoordinator<'a> {
    pub(crate) backend: &'a dyn GpuBackend,
    pub(crate) config: &'a SyncConfig,
    pub(crate) registry: &'a mut CommandBufferRegistry,
    pub(crate) tracker: &'a mut ResourceHazardTracker,
    pub(crate) stats: &'a mut SubmissionStats,
}

impl<'a> SubmissionCoordinator<'a> {
    pub fn new(
        backend: &'a dyn GpuBackend,
        config: &'a SyncConfig,
        registry: &'a mut CommandBufferRegistry,
        tracker: &'a mut ResourceHazardTracker,
        stats: &'a mut SubmissionStats,
    ) -> Self {
        Self {
            backend,
            config,
            registry,
            tracker,
            stats,
        }
    }

    /// Submit one batch. See [`Self::submit_cmds`].
    pub fn submit_cmd(
        &mut self,
        priority: QueuePriority,
        info: &SubmitInfo,
        fence: Option<&Fence>,
    ) -> Result<(), SyncError> {
        self.submit_cmds(priority, std::slice::from_ref(info), fence)
    }

    /// Submit several batches to one queue.
    ///
    /// Every command buffer must have ended and share one queue function, and
    /// every buffer they depend on must already be submitted or finished.
    /// Buffers that acquire a resource must not be submitted before the
    /// matching release is recorded. Violations are logged and nothing is
    /// submitted.
    ///
    /// Each producer's signal semaphore is waited on by the first submission
    /// that depends on it. Later dependents block on the producer's fence
    /// instead.
    pub fn submit_cmds(
        &mut self,
        priority: QueuePriority,
        infos: &[SubmitInfo],
        fence: Option<&Fence>,
    ) -> Result<(), SyncError> {
        profile_scope!("submit_cmds");
        let Some(queue) = self.validate(infos) else {
            return Ok(());
        };

        let mut pending = Vec::with_capacity(infos.len());
        for info in infos {
            let Some(waits) = self.collect_waits(info, queue, priority, infos) else {
                return Ok(());
            };
            pending.push(waits);
        }

        let mut consumed: Vec<Semaphore> = Vec::new();
        let mut prepared = Vec::with_capacity(infos.len());
        for (info, producers) in infos.iter().zip(pending) {
            let mut waits = Vec::new();
            for producer in producers {
                match producer.semaphore {
                    Some(semaphore) if !consumed.contains(&semaphore) => {
                        merge_wait(&mut waits, &semaphore, producer.stages);
                        consumed.push(semaphore);
                    }
                    _ => {
                        if let Some(fence) = &producer.fence {
                            log::debug!("Producer signal already consumed, waiting on its fence");
                            fence.wait(self.backend, self.config.fence_timeout)?;
                        }
                    }
                }
            }
            for (semaphore, stages) in &info.wait_semaphores {
                merge_wait(&mut waits, semaphore, *stages);
            }
            prepared.push(PreparedBatch {
                cmds: info.cmds.clone(),
                waits,
                signals: info.signal_semaphores.clone(),
                own_signal: Semaphore::new(self.backend)?,
            });
        }

        let fence = match fence {
            Some(fence) => {
                fence.reset(self.backend)?;
                fence.clone()
            }
            None => Fence::new(self.backend, false)?,
        };

        {
            let mut batches = Vec::with_capacity(prepared.len());
            for batch in &prepared {
                let mut command_buffers = Vec::with_capacity(batch.cmds.len());
                for id in &batch.cmds {
                    if let Some(record) = self.registry.get(*id) {
                        command_buffers.push(record.gpu());
                    }
                }
                let mut signal_semaphores: Vec<_> =
                    batch.signals.iter().map(Semaphore::gpu).collect();
                signal_semaphores.push(batch.own_signal.gpu());
                batches.push(SubmitBatch {
                    command_buffers,
                    wait_semaphores: batch.waits.iter().map(|(s, st)| (s.gpu(), *st)).collect(),
                    signal_semaphores,
                });
            }
            self.backend
                .submit(queue, priority, &batches, Some(fence.gpu()))?;
        }
        self.registry.consume_signals(&consumed);

        for batch in prepared {
            self.stats.submissions += 1;
            self.stats.command_buffers += batch.cmds.len() as u64;
            self.stats.semaphore_waits += batch.waits.len() as u64;
            for id in batch.cmds {
                self.registry
                    .mark_submitted(id, priority, batch.own_signal.clone(), fence.clone());
                log::trace!("Submitted {id} to {queue} queue at {priority:?} priority");
            }
        }
        Ok(())
    }

    fn validate(&self, infos: &[SubmitInfo]) -> Option<QueueFunction> {
        let mut queue = None;
        for id in infos.iter().flat_map(|info| info.cmds.iter()) {
            let Some(record) = self.registry.get(*id) else {
                log::error!("Submitting unknown command buffer {id}");
                return None;
            };
            if record.state() != CommandBufferState::Ended {
                log::error!(
                    "Command buffer {} must be ended before submit, state {:?}",
                    record.name(),
                    record.state()
                );
                return None;
            }
            match queue {
                None => queue = Some(record.queue()),
                Some(q) if q != record.queue() => {
                    log::error!(
                        "Command buffer {} runs on {} but the submission targets {q}",
                        record.name(),
                        record.queue()
                    );
                    return None;
                }
                Some(_) => {}
            }
        }
        if queue.is_none() {
            log::warn!("Nothing to submit");
        }
        queue
    }

    fn collect_waits(
        &self,
        info: &SubmitInfo,
        queue: QueueFunction,
        priority: QueuePriority,
        all: &[SubmitInfo],
    ) -> Option<Vec<ProducerWait>> {
        for id in &info.cmds {
            let unreleased = self.tracker.unreleased_acquires(*id);
            if !unreleased.is_empty() {
                let name = self.registry.get(*id).map_or("?", |r| r.name());
                log::error!(
                    "{name} acquires {unreleased:?} before the owning queue records their release"
                );
                return None;
            }
        }

        let mut waits: Vec<ProducerWait> = Vec::new();
        let in_submission = |id: CommandBufferId| all.iter().any(|i| i.cmds.contains(&id));

        let tracked = info
            .cmds
            .iter()
            .flat_map(|id| self.tracker.cmd_dependencies(*id).iter())
            .map(|dep| (dep.cmd, dep.stages, false));
        let manual = info
            .wait_on_cmds
            .iter()
            .map(|id| (*id, PipelineStages::ALL_COMMANDS, true));

        for (dep, stages, explicit) in tracked.chain(manual) {
            if in_submission(dep) {
                continue;
            }
            let Some(record) = self.registry.get(dep) else {
                // Freed buffers have finished.
                continue;
            };
            match record.state() {
                CommandBufferState::Finished => {}
                CommandBufferState::Submitted => {
                    let same_queue = record.queue() == queue && record.priority() == priority;
                    if same_queue && !explicit {
                        continue;
                    }
                    let semaphore = record.signal_semaphore();
                    let existing = semaphore.and_then(|semaphore| {
                        waits
                            .iter_mut()
                            .find(|w| w.semaphore.as_ref() == Some(semaphore))
                    });
                    match existing {
                        Some(wait) => wait.stages |= stages,
                        None => waits.push(ProducerWait {
                            semaphore: semaphore.cloned(),
                            fence: record.fence().cloned(),
                            stages,
                        }),
                    }
                }
                state => {
                    log::error!(
                        "Dependency {} of the submission is {state:?}, submit it first",
                        record.name()
                    );
                    return None;
                }
            }
        }
        Some(waits)
    }

    /// Submit and block until the buffer finishes.
    pub fn submit_wait_cmd(
        &mut self,
        priority: QueuePriority,
        cmd: CommandBufferId,
    ) -> Result<(), SyncError> {
        self.submit_cmd(priority, &SubmitInfo::single(cmd), None)?;
        if self.registry.state(cmd) != Some(CommandBufferState::Submitted) {
            return Err(SyncError::SubmissionFailed(format!(
                "{cmd} was rejected before submission"
            )));
        }
        self.finish_cmd(cmd)
    }

    /// Confirm GPU completion of `cmd` and release its hazard bookkeeping.
    ///
    /// Submitted buffers are waited on first. Buffers waiting on `cmd` that
    /// are already submitted finish before it. Buffers that were recorded
    /// but never submitted are left untouched; see [`Self::discard_cmd`].
    pub fn finish_cmd(&mut self, cmd: CommandBufferId) -> Result<(), SyncError> {
        profile_scope!("finish_cmd");
        let Some(record) = self.registry.get(cmd) else {
            log::warn!("Finishing unknown command buffer {cmd}");
            return Ok(());
        };
        match record.state() {
            CommandBufferState::Finished => return Ok(()),
            CommandBufferState::Recording => {
                log::error!("Command buffer {} is still recording, cannot finish", record.name());
                return Ok(());
            }
            CommandBufferState::Submitted => {
                if let Some(fence) = record.fence() {
                    fence.wait(self.backend, self.config.fence_timeout)?;
                }
                self.registry.mark_finished(cmd);
                for dependent in self.tracker.depending_cmds(cmd) {
                    if self.registry.state(dependent) == Some(CommandBufferState::Submitted) {
                        self.finish_cmd(dependent)?;
                    }
                }
            }
            CommandBufferState::Ended => {
                log::error!(
                    "Command buffer {} was never submitted, discard it instead of finishing",
                    record.name()
                );
                return Ok(());
            }
            CommandBufferState::Allocated => {}
        }
        self.tracker.clear_finished_cmd(cmd);
        self.registry.mark_finished(cmd);
        self.stats.finished += 1;
        Ok(())
    }

    /// Free a finished command buffer.
    ///
    /// # Panics
    ///
    /// Panics if `cmd` has not finished.
    pub fn free_cmd(&mut self, cmd: CommandBufferId) {
        debug_assert!(
            self.registry.state(cmd) != Some(CommandBufferState::Finished)
                || !self.tracker.references_cmd(cmd),
            "finished {cmd} is still referenced by the tracker"
        );
        self.registry.free(self.backend, cmd);
    }

    /// Drop a command buffer whether or not it ran.
    ///
    /// Submitted buffers are finished first. A buffer that never reached the
    /// GPU is removed from the tracker as if its accesses never happened.
    pub fn discard_cmd(&mut self, cmd: CommandBufferId) -> Result<(), SyncError> {
        match self.registry.state(cmd) {
            None => return Ok(()),
            Some(CommandBufferState::Submitted) => self.finish_cmd(cmd)?,
            Some(CommandBufferState::Finished) => {}
            Some(state) => {
                log::warn!("Discarding {cmd} in state {state:?}, its recorded accesses are dropped");
                self.tracker.clear_finished_cmd(cmd);
                self.registry.mark_discarded(cmd);
            }
        }
        self.free_cmd(cmd);
        Ok(())
    }

    /// Finish every submitted command buffer.
    pub fn flush_all_commands(&mut self) -> Result<(), SyncError> {
        profile_scope!("flush_all_commands");
        for cmd in self.registry.ids_in_state(CommandBufferState::Submitted) {
            self.finish_cmd(cmd)?;
        }
        Ok(())
    }

    /// Finish every submitted command buffer that uses `resource`.
    pub fn wait_on_res_dep_cmds(&mut self, resource: ResourceId) -> Result<(), SyncError> {
        for cmd in self.tracker.resource_dependencies(resource) {
            match self.registry.state(cmd) {
                Some(CommandBufferState::Submitted) => self.finish_cmd(cmd)?,
                Some(CommandBufferState::Finished) | None => {}
                Some(state) => {
                    log::debug!("{cmd} uses {resource} but is {state:?}, not waiting on it");
                }
            }
        }
        Ok(())
    }

    /// Present swapchain images once every buffer rendering into them is done.
    pub fn present_image(
        &mut self,
        swapchains: &[RawHandle],
        image_indices: &[u32],
        wait_semaphores: &[Semaphore],
    ) -> Result<(), SyncError> {
        if swapchains.len() != image_indices.len() {
            log::error!(
                "Presenting {} swapchains with {} image indices",
                swapchains.len(),
                image_indices.len()
            );
            return Ok(());
        }

        let writers = self.registry.swapchain_writers();
        let mut waits: Vec<Semaphore> = wait_semaphores.to_vec();
        let mut consumed = Vec::new();
        for cmd in &writers {
            let Some(record) = self.registry.get(*cmd) else {
                continue;
            };
            match record.signal_semaphore() {
                Some(semaphore) => {
                    if !waits.contains(semaphore) {
                        waits.push(semaphore.clone());
                    }
                    consumed.push(semaphore.clone());
                }
                None => {
                    // A dependent submission already took the signal.
                    if let Some(fence) = record.fence() {
                        fence.wait(self.backend, self.config.fence_timeout)?;
                    }
                }
            }
        }

        self.backend.present(&PresentRequest {
            swapchains,
            image_indices,
            wait_semaphores: waits.iter().map(Semaphore::gpu).collect(),
        })?;

        self.registry.consume_signals(&consumed);
        for cmd in writers {
            self.registry.expect_mut(cmd).writes_swapchain = false;
        }
        Ok(())
    }

    /// Whether any live command buffer still references `resource`.
    pub fn has_cmds_using_resource(&self, resource: ResourceId) -> bool {
        self.tracker.has_cmds_using_resource(resource)
    }

    /// Start recording. See [`CommandBufferRegistry::begin`].
    pub fn start_cmd(
        &mut self,
        name: &str,
        queue: QueueFunction,
        usage: CommandBufferUsage,
    ) -> Result<CommandBufferId, SyncError> {
        let families = self.config.effective_queue_families();
        self.registry
            .begin(self.backend, &families, name, queue, usage)
    }

    /// Stop recording.
    pub fn end_cmd(&mut self, cmd: CommandBufferId) -> Result<(), SyncError> {
        self.registry.end(self.backend, cmd)
    }
}
