//! Resource hazard tracking.
//!
//! The [`ResourceHazardTracker`] keeps one [`AccessRecord`] per resource and
//! answers "what barrier, if any, must precede this access". Records are
//! created lazily: a resource the tracker has never seen is treated as a first
//! access and gets no barrier.
//!
//! Alongside barriers the tracker records command buffer dependencies (which
//! command buffer must wait for which) and pending queue-family ownership
//! releases, grouped by the queue that has to record them.

mod record;
mod transfer;

pub use record::{AccessPhase, AccessRecord, ReaderInfo, ReleasedTo, WriteInfo};
pub use transfer::QueuePendingRelease;

use std::collections::{BTreeMap, HashMap};

use crate::barriers::BarrierDescriptor;
use crate::handle::{CmdInfo, CommandBufferId, QueueOwner, ResourceId};
use crate::profiling::profile_scope;
use crate::types::{AccessFlags, ImageLayout, PipelineStages, QueueFunction};

/// How an operation uses a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessIntent {
    Read,
    Write,
    /// A read that must observe the last write at every stage it is read
    /// from, even if this command buffer already read it at another stage.
    ReadFromWrite,
}

/// A single access request against a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRequest {
    pub cmd: CmdInfo,
    pub intent: AccessIntent,
    pub stage: PipelineStages,
    pub access: AccessFlags,
    /// Layout the operation needs. `None` for buffers.
    pub layout: Option<ImageLayout>,
}

impl AccessRequest {
    pub fn read(cmd: CmdInfo, stage: PipelineStages, access: AccessFlags) -> Self {
        Self {
            cmd,
            intent: AccessIntent::Read,
            stage,
            access,
            layout: None,
        }
    }

    pub fn write(cmd: CmdInfo, stage: PipelineStages, access: AccessFlags) -> Self {
        Self {
            intent: AccessIntent::Write,
            ..Self::read(cmd, stage, access)
        }
    }

    pub fn read_from_write(cmd: CmdInfo, stage: PipelineStages, access: AccessFlags) -> Self {
        Self {
            intent: AccessIntent::ReadFromWrite,
            ..Self::read(cmd, stage, access)
        }
    }

    /// Require the image to be in `layout` for this access.
    pub fn with_layout(mut self, layout: ImageLayout) -> Self {
        self.layout = Some(layout);
        self
    }
}

/// A command buffer that must complete before the dependent one may run the
/// given stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandDependency {
    pub cmd: CommandBufferId,
    pub stages: PipelineStages,
}

struct Ownership {
    src_family: u32,
    old_layout: Option<ImageLayout>,
    release: Option<(QueueFunction, QueuePendingRelease)>,
    /// Buffer holding the release this access acquires from.
    release_cmd: Option<CommandBufferId>,
    changed: bool,
}

/// Tracks the last writer and readers of every resource.
#[derive(Debug, Default)]
pub struct ResourceHazardTracker {
    records: HashMap<ResourceId, AccessRecord>,
    cmd_waits: HashMap<CommandBufferId, Vec<CommandDependency>>,
    queue_transfers: [BTreeMap<ResourceId, QueuePendingRelease>; 3],
}

impl ResourceHazardTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an access and return the barrier that must precede it.
    ///
    /// The record is updated as if the access has been recorded.
    pub fn request_access(
        &mut self,
        resource: ResourceId,
        req: &AccessRequest,
    ) -> Option<BarrierDescriptor> {
        profile_scope!("request_access");
        let barrier = match req.intent {
            AccessIntent::Write => self.write(resource, req),
            AccessIntent::Read | AccessIntent::ReadFromWrite => self.read(resource, req),
        };
        if let Some(barrier) = &barrier {
            log::trace!(
                "{resource} barrier for {}: {:?}/{:?} -> {:?}/{:?} qf {}->{} layout {:?}->{:?}",
                req.cmd.id,
                barrier.src_stage,
                barrier.src_access,
                barrier.dst_stage,
                barrier.dst_access,
                barrier.src_queue_family,
                barrier.dst_queue_family,
                barrier.old_layout,
                barrier.new_layout,
            );
        }
        barrier
    }

    fn read(&mut self, resource: ResourceId, req: &AccessRequest) -> Option<BarrierDescriptor> {
        let me = req.cmd.id;
        let family = req.cmd.family();
        let record = self.records.entry(resource).or_default();
        let before = record.phase();
        let layout_change = layout_changes(record.layout, req.layout);
        let writer = record.last_write;
        let (w_stage, w_access) =
            writer.map_or((PipelineStages::empty(), AccessFlags::empty()), |w| {
                (w.stage, w.access)
            });

        let mut deps = Vec::new();
        let mut release = None;
        let mut release_cmd = None;

        let barrier = if let Some(index) = record.reader_index(me) {
            let prior = record.readers[index].stages;
            if layout_change {
                deps.extend(record.cmds().filter(|c| *c != me));
                Some(make_barrier(
                    resource,
                    (record.all_read_stages | w_stage, w_access),
                    req,
                    family,
                    record.layout,
                ))
            } else if req.intent == AccessIntent::ReadFromWrite
                && writer.is_some()
                && !prior.contains(req.stage)
            {
                Some(make_barrier(
                    resource,
                    (w_stage, w_access),
                    req,
                    family,
                    record.layout,
                ))
            } else {
                None
            }
        } else if let Some(w) = writer
            && record.readers.is_empty()
        {
            if w.cmd != me {
                deps.push(w.cmd);
            }
            let old = w.layout.or(record.layout);
            let own = resolve_ownership(record, req, (w.stage, w.access), old);
            release = own.release;
            release_cmd = own.release_cmd;
            Some(make_barrier(
                resource,
                (w.stage, w.access),
                req,
                own.src_family,
                own.old_layout,
            ))
        } else if !record.readers.is_empty() {
            if let Some(w) = writer
                && w.cmd != me
            {
                deps.push(w.cmd);
            }
            let src_stage = record.all_read_stages | w_stage;
            let covered = record.all_read_stages.contains(req.stage);
            let own = resolve_ownership(record, req, (src_stage, w_access), record.layout);
            release = own.release;
            release_cmd = own.release_cmd;
            if layout_change {
                deps.extend(record.readers.iter().map(|r| r.cmd).filter(|c| *c != me));
                Some(make_barrier(
                    resource,
                    (src_stage, w_access),
                    req,
                    own.src_family,
                    own.old_layout,
                ))
            } else if own.changed {
                Some(make_barrier(
                    resource,
                    (src_stage, w_access),
                    req,
                    own.src_family,
                    own.old_layout,
                ))
            } else if writer.is_some() && !covered {
                Some(make_barrier(
                    resource,
                    (w_stage, w_access),
                    req,
                    family,
                    record.layout,
                ))
            } else {
                None
            }
        } else {
            let own = resolve_ownership(
                record,
                req,
                (PipelineStages::empty(), AccessFlags::empty()),
                record.layout,
            );
            release = own.release;
            release_cmd = own.release_cmd;
            if layout_change || own.changed {
                Some(make_barrier(
                    resource,
                    (PipelineStages::TOP_OF_PIPE, AccessFlags::empty()),
                    req,
                    own.src_family,
                    own.old_layout,
                ))
            } else {
                None
            }
        };

        record.add_reader(ReaderInfo {
            cmd: me,
            owner: req.cmd.owner,
            stages: req.stage,
            access: req.access,
        });
        if req.layout.is_some() {
            record.layout = req.layout;
        }
        record.owner = Some(req.cmd.owner);
        debug_assert!(
            before.can_transition_to(record.phase()),
            "illegal access transition {before:?} -> {:?} on {resource}",
            record.phase()
        );

        deps.extend(release_cmd);
        self.apply(resource, me, req.stage, deps, release);
        barrier
    }

    fn write(&mut self, resource: ResourceId, req: &AccessRequest) -> Option<BarrierDescriptor> {
        let me = req.cmd.id;
        let record = self.records.entry(resource).or_default();
        let before = record.phase();
        let layout_change = layout_changes(record.layout, req.layout);

        let mut deps = Vec::new();
        let own;

        let barrier = if !record.readers.is_empty() {
            // Write after read: execution dependency on every reader.
            deps.extend(record.cmds().filter(|c| *c != me));
            let src = (record.all_read_stages, AccessFlags::empty());
            own = resolve_ownership(record, req, src, record.layout);
            Some(make_barrier(resource, src, req, own.src_family, own.old_layout))
        } else if let Some(w) = record.last_write {
            if w.cmd != me {
                deps.push(w.cmd);
            }
            let src = (w.stage, w.access);
            own = resolve_ownership(record, req, src, w.layout.or(record.layout));
            Some(make_barrier(resource, src, req, own.src_family, own.old_layout))
        } else {
            own = resolve_ownership(
                record,
                req,
                (PipelineStages::empty(), AccessFlags::empty()),
                record.layout,
            );
            (layout_change || own.changed).then(|| {
                make_barrier(
                    resource,
                    (PipelineStages::TOP_OF_PIPE, AccessFlags::empty()),
                    req,
                    own.src_family,
                    own.old_layout,
                )
            })
        };

        let layout = req.layout.or(record.layout);
        record.set_writer(WriteInfo {
            cmd: me,
            owner: req.cmd.owner,
            stage: req.stage,
            access: req.access,
            layout,
        });
        record.layout = layout;
        record.owner = Some(req.cmd.owner);
        debug_assert!(
            before.can_transition_to(record.phase()),
            "illegal access transition {before:?} -> {:?} on {resource}",
            record.phase()
        );

        deps.extend(own.release_cmd);
        self.apply(resource, me, req.stage, deps, own.release);
        barrier
    }

    fn apply(
        &mut self,
        resource: ResourceId,
        waiter: CommandBufferId,
        stages: PipelineStages,
        deps: Vec<CommandBufferId>,
        release: Option<(QueueFunction, QueuePendingRelease)>,
    ) {
        for producer in deps {
            self.add_dep(waiter, producer, stages);
        }
        if let Some((queue, release)) = release {
            log::debug!(
                "{resource} crosses queue families, pending release on {queue} queue"
            );
            self.add_resource_to_q_transfer(queue, resource, release, false);
        }
    }

    /// Record a write performed by a render pass attachment.
    ///
    /// The render pass transitions the attachment itself, so no barrier is
    /// produced, but later accesses must see the write and `final_layout`.
    pub fn color_attachment_write(
        &mut self,
        resource: ResourceId,
        cmd: CmdInfo,
        stage: PipelineStages,
        access: AccessFlags,
        final_layout: ImageLayout,
    ) {
        let record = self.records.entry(resource).or_default();
        let before = record.phase();
        let deps: Vec<_> = record.cmds().filter(|c| *c != cmd.id).collect();
        record.set_writer(WriteInfo {
            cmd: cmd.id,
            owner: cmd.owner,
            stage,
            access,
            layout: Some(final_layout),
        });
        record.layout = Some(final_layout);
        record.owner = Some(cmd.owner);
        record.released_to = None;
        debug_assert!(before.can_transition_to(record.phase()));

        self.apply(resource, cmd.id, stage, deps, None);
    }

    /// Barrier moving an image out of its tracked layout into `req.layout`.
    ///
    /// Returns `None` when the image is already there or its layout is
    /// unknown. A transition rewrites the image, so it is recorded as a write
    /// by `req.cmd`.
    pub fn image_to_general_layout(
        &mut self,
        image: ResourceId,
        req: &AccessRequest,
    ) -> Option<BarrierDescriptor> {
        let current = self.records.get(&image)?.layout?;
        let target = req.layout?;
        if current == target {
            return None;
        }
        self.request_access(
            image,
            &AccessRequest {
                intent: AccessIntent::Write,
                ..*req
            },
        )
    }

    /// Record that `waiter` must wait for `producer` before running `stages`.
    pub fn add_dep(
        &mut self,
        waiter: CommandBufferId,
        producer: CommandBufferId,
        stages: PipelineStages,
    ) {
        if waiter == producer {
            return;
        }
        let waits = self.cmd_waits.entry(waiter).or_default();
        match waits.iter_mut().find(|d| d.cmd == producer) {
            Some(dep) => dep.stages |= stages,
            None => waits.push(CommandDependency {
                cmd: producer,
                stages,
            }),
        }
    }

    /// Drop every reference to a command buffer whose GPU work has completed.
    pub fn clear_finished_cmd(&mut self, cmd: CommandBufferId) {
        profile_scope!("clear_finished_cmd");
        self.cmd_waits.remove(&cmd);
        self.cmd_waits.retain(|_, waits| {
            waits.retain(|d| d.cmd != cmd);
            !waits.is_empty()
        });
        for release in self.queue_transfers.iter_mut().flat_map(|r| r.values_mut()) {
            release.acquirers.retain(|(c, _)| *c != cmd);
        }
        for (resource, record) in self.records.iter_mut() {
            let before = record.phase();
            if record.forget_cmd(cmd) {
                debug_assert!(
                    before.can_transition_to(record.phase()),
                    "illegal access transition {before:?} -> {:?} on {resource}",
                    record.phase()
                );
            }
        }
    }

    /// Forget a resource entirely, including pending releases.
    pub fn clear_resource(&mut self, resource: ResourceId) {
        self.records.remove(&resource);
        for releases in &mut self.queue_transfers {
            releases.remove(&resource);
        }
    }

    /// Forget every resource for which `is_live` returns `false`.
    pub fn clear_unwanted(&mut self, is_live: impl Fn(ResourceId) -> bool) {
        let before = self.records.len();
        self.records.retain(|id, _| is_live(*id));
        for releases in &mut self.queue_transfers {
            releases.retain(|id, _| is_live(*id));
        }
        let dropped = before - self.records.len();
        if dropped > 0 {
            log::debug!("Dropped {dropped} stale access records");
        }
    }

    /// Mark `resource` as pending release on `queue`.
    ///
    /// Merges into an existing entry unless `reset` is set.
    pub fn add_resource_to_q_transfer(
        &mut self,
        queue: QueueFunction,
        resource: ResourceId,
        release: QueuePendingRelease,
        reset: bool,
    ) {
        let releases = &mut self.queue_transfers[queue.index()];
        match releases.get_mut(&resource) {
            Some(existing) if !reset => existing.merge(&release),
            _ => {
                releases.insert(resource, release);
            }
        }
    }

    /// Take every pending release registered on `queue`, ordered by resource.
    pub fn get_releases_from_queue(
        &mut self,
        queue: QueueFunction,
    ) -> Vec<(ResourceId, QueuePendingRelease)> {
        std::mem::take(&mut self.queue_transfers[queue.index()])
            .into_iter()
            .collect()
    }

    pub fn pending_release(
        &self,
        queue: QueueFunction,
        resource: ResourceId,
    ) -> Option<&QueuePendingRelease> {
        self.queue_transfers[queue.index()].get(&resource)
    }

    /// Remember that a release barrier toward `to_family` has been recorded.
    pub fn mark_released(
        &mut self,
        resource: ResourceId,
        cmd: CommandBufferId,
        from: QueueOwner,
        to_family: u32,
        old_layout: Option<ImageLayout>,
        new_layout: Option<ImageLayout>,
    ) {
        let record = self.records.entry(resource).or_default();
        record.released_to = Some(ReleasedTo {
            cmd,
            from,
            to_family,
            old_layout,
            new_layout,
        });
        if let Some(layout) = new_layout {
            record.settle_layout(layout);
        }
    }

    /// Overwrite the tracked layout of an image.
    ///
    /// Used after a transition recorded outside the tracker. The last write,
    /// if any, is treated as having left the image in `layout`.
    pub fn set_layout(&mut self, image: ResourceId, layout: ImageLayout) {
        self.records.entry(image).or_default().settle_layout(layout);
    }

    pub fn current_layout(&self, image: ResourceId) -> Option<ImageLayout> {
        self.records.get(&image).and_then(|r| r.layout)
    }

    pub fn record(&self, resource: ResourceId) -> Option<&AccessRecord> {
        self.records.get(&resource)
    }

    pub fn last_writer(&self, resource: ResourceId) -> Option<CommandBufferId> {
        self.records
            .get(&resource)
            .and_then(|r| r.last_write.map(|w| w.cmd))
    }

    pub fn readers(&self, resource: ResourceId) -> Vec<CommandBufferId> {
        self.records
            .get(&resource)
            .map(|r| r.readers.iter().map(|r| r.cmd).collect())
            .unwrap_or_default()
    }

    /// Command buffers `cmd` has to wait for.
    pub fn cmd_dependencies(&self, cmd: CommandBufferId) -> &[CommandDependency] {
        self.cmd_waits.get(&cmd).map_or(&[], Vec::as_slice)
    }

    /// Command buffers waiting on `cmd`.
    pub fn depending_cmds(&self, cmd: CommandBufferId) -> Vec<CommandBufferId> {
        let mut out: Vec<_> = self
            .cmd_waits
            .iter()
            .filter(|(_, waits)| waits.iter().any(|d| d.cmd == cmd))
            .map(|(waiter, _)| *waiter)
            .collect();
        out.sort();
        out
    }

    /// Command buffers still referencing `resource`, writer first.
    pub fn resource_dependencies(&self, resource: ResourceId) -> Vec<CommandBufferId> {
        let Some(record) = self.records.get(&resource) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for cmd in record.cmds() {
            if !out.contains(&cmd) {
                out.push(cmd);
            }
        }
        out
    }

    pub fn has_cmds_using_resource(&self, resource: ResourceId) -> bool {
        self.records
            .get(&resource)
            .is_some_and(|r| r.cmds().next().is_some())
    }

    /// Whether any record or dependency still names `cmd`.
    pub fn references_cmd(&self, cmd: CommandBufferId) -> bool {
        self.records.values().any(|r| r.references(cmd))
            || self.cmd_waits.contains_key(&cmd)
            || self
                .cmd_waits
                .values()
                .any(|waits| waits.iter().any(|d| d.cmd == cmd))
            || self
                .queue_transfers
                .iter()
                .flat_map(|r| r.values())
                .any(|release| release.acquirers.iter().any(|(c, _)| *c == cmd))
    }

    /// Resources `cmd` acquires whose release has not been recorded yet.
    ///
    /// Such a buffer cannot be submitted: its acquire would run unpaired.
    pub fn unreleased_acquires(&self, cmd: CommandBufferId) -> Vec<(QueueFunction, ResourceId)> {
        QueueFunction::ALL
            .into_iter()
            .zip(&self.queue_transfers)
            .flat_map(|(queue, releases)| {
                releases
                    .iter()
                    .filter(move |(_, release)| release.acquirers.iter().any(|(c, _)| *c == cmd))
                    .map(move |(resource, _)| (queue, *resource))
            })
            .collect()
    }

    /// Number of resources with an access record.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn layout_changes(current: Option<ImageLayout>, requested: Option<ImageLayout>) -> bool {
    matches!((current, requested), (Some(cur), Some(req)) if cur != req)
}

fn resolve_ownership(
    record: &mut AccessRecord,
    req: &AccessRequest,
    src: (PipelineStages, AccessFlags),
    old_layout: Option<ImageLayout>,
) -> Ownership {
    let family = req.cmd.family();

    if let Some(released) = record.released_to.take() {
        if released.to_family == family {
            return Ownership {
                src_family: released.from.family,
                old_layout: released.old_layout.or(old_layout),
                release: None,
                release_cmd: Some(released.cmd),
                changed: true,
            };
        }
        log::warn!(
            "Release toward family {} superseded by access from family {family}",
            released.to_family
        );
    }

    match record.owner {
        Some(owner) if owner.family != family => {
            let release = QueuePendingRelease {
                stages: src.0,
                access: src.1,
                src_layout: old_layout,
                dst_layout: req.layout.or(old_layout),
                dst_family: Some(family),
                acquired: true,
                is_image: req.layout.is_some() || old_layout.is_some(),
                acquirers: vec![(req.cmd.id, req.stage)],
            };
            Ownership {
                src_family: owner.family,
                old_layout,
                release: Some((owner.queue, release)),
                release_cmd: None,
                changed: true,
            }
        }
        _ => Ownership {
            src_family: family,
            old_layout,
            release: None,
            release_cmd: None,
            changed: false,
        },
    }
}

fn make_barrier(
    resource: ResourceId,
    src: (PipelineStages, AccessFlags),
    req: &AccessRequest,
    src_family: u32,
    old_layout: Option<ImageLayout>,
) -> BarrierDescriptor {
    BarrierDescriptor {
        resource,
        src_stage: src.0,
        dst_stage: req.stage,
        src_access: src.1,
        dst_access: req.access,
        src_queue_family: src_family,
        dst_queue_family: req.cmd.family(),
        old_layout,
        new_layout: req.layout.or(old_layout),
        mips: None,
    }
}
