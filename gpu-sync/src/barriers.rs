//! Barrier descriptors and grouped barrier batches.
//!
//! Every operation collects the barriers for all resources it touches into
//! one [`BarrierBatch`]. The batch groups them by `(src stages, dst stages)`
//! so each group becomes a single native pipeline barrier call.

use crate::encoder::NativeCommand;
use crate::handle::ResourceId;
use crate::types::{AccessFlags, ImageLayout, MipRange, PipelineStages, QUEUE_FAMILY_IGNORED};

/// A single memory/execution barrier on one resource.
///
/// Images carry `old_layout`/`new_layout`; buffers leave both `None`.
/// `mips == None` covers every mip level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BarrierDescriptor {
    pub resource: ResourceId,
    pub src_stage: PipelineStages,
    pub dst_stage: PipelineStages,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub old_layout: Option<ImageLayout>,
    pub new_layout: Option<ImageLayout>,
    pub mips: Option<MipRange>,
}

impl BarrierDescriptor {
    /// A buffer barrier with no queue transfer.
    pub fn buffer(
        resource: ResourceId,
        src: (PipelineStages, AccessFlags),
        dst: (PipelineStages, AccessFlags),
    ) -> Self {
        Self {
            resource,
            src_stage: src.0,
            dst_stage: dst.0,
            src_access: src.1,
            dst_access: dst.1,
            src_queue_family: QUEUE_FAMILY_IGNORED,
            dst_queue_family: QUEUE_FAMILY_IGNORED,
            old_layout: None,
            new_layout: None,
            mips: None,
        }
    }

    /// An image barrier with no queue transfer.
    pub fn image(
        resource: ResourceId,
        src: (PipelineStages, AccessFlags),
        dst: (PipelineStages, AccessFlags),
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) -> Self {
        Self {
            old_layout: Some(old_layout),
            new_layout: Some(new_layout),
            ..Self::buffer(resource, src, dst)
        }
    }

    /// Set the source and destination queue families.
    pub fn with_queue_families(mut self, src: u32, dst: u32) -> Self {
        self.src_queue_family = src;
        self.dst_queue_family = dst;
        self
    }

    /// Restrict the barrier to a mip range.
    pub fn with_mips(mut self, mips: MipRange) -> Self {
        self.mips = Some(mips);
        self
    }

    pub fn is_image(&self) -> bool {
        self.new_layout.is_some()
    }

    pub fn has_layout_change(&self) -> bool {
        self.old_layout != self.new_layout
    }

    /// Returns `true` if the barrier moves ownership between queue families.
    pub fn is_queue_transfer(&self) -> bool {
        self.src_queue_family != self.dst_queue_family
            && self.src_queue_family != QUEUE_FAMILY_IGNORED
            && self.dst_queue_family != QUEUE_FAMILY_IGNORED
    }

    /// A barrier that neither waits on anything nor changes layout or owner.
    pub fn is_noop(&self) -> bool {
        !self.is_queue_transfer()
            && !self.has_layout_change()
            && self.src_access.is_empty()
            && (self.src_stage.is_empty() || self.src_stage == PipelineStages::TOP_OF_PIPE)
    }

    fn same_target(&self, other: &Self) -> bool {
        self.resource == other.resource && self.mips == other.mips
    }
}

/// Barriers sharing one source/destination stage pair.
#[derive(Debug, Clone, PartialEq)]
pub struct BarrierGroup {
    pub src_stages: PipelineStages,
    pub dst_stages: PipelineStages,
    pub barriers: Vec<BarrierDescriptor>,
}

/// A batch of barriers to record together.
#[derive(Debug, Clone, Default)]
pub struct BarrierBatch {
    groups: Vec<BarrierGroup>,
}

impl BarrierBatch {
    /// Create a new empty barrier batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a barrier.
    ///
    /// No-op barriers are dropped. A second barrier for the same resource and
    /// mip range within a group replaces the first.
    pub fn push(&mut self, mut barrier: BarrierDescriptor) {
        if barrier.is_noop() {
            return;
        }
        barrier.src_stage = barrier.src_stage.or_top_of_pipe();
        if barrier.dst_stage.is_empty() {
            barrier.dst_stage = PipelineStages::BOTTOM_OF_PIPE;
        }

        let index = match self
            .groups
            .iter()
            .position(|g| g.src_stages == barrier.src_stage && g.dst_stages == barrier.dst_stage)
        {
            Some(index) => index,
            None => {
                self.groups.push(BarrierGroup {
                    src_stages: barrier.src_stage,
                    dst_stages: barrier.dst_stage,
                    barriers: Vec::new(),
                });
                self.groups.len() - 1
            }
        };
        let group = &mut self.groups[index];

        match group.barriers.iter_mut().find(|b| b.same_target(&barrier)) {
            Some(existing) => *existing = barrier,
            None => group.barriers.push(barrier),
        }
    }

    /// Add an optional barrier, as returned by the hazard tracker.
    pub fn push_opt(&mut self, barrier: Option<BarrierDescriptor>) {
        if let Some(barrier) = barrier {
            self.push(barrier);
        }
    }

    /// Check if the batch has any barriers.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Total number of barriers across all groups.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.barriers.len()).sum()
    }

    /// Number of native barrier calls the batch will produce.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn groups(&self) -> &[BarrierGroup] {
        &self.groups
    }

    /// Iterate over every barrier.
    pub fn iter(&self) -> impl Iterator<Item = &BarrierDescriptor> {
        self.groups.iter().flat_map(|g| g.barriers.iter())
    }

    /// Convert into one pipeline barrier command per group.
    pub fn into_commands(self) -> Vec<NativeCommand> {
        self.groups
            .into_iter()
            .map(|group| NativeCommand::PipelineBarrier {
                src_stages: group.src_stages,
                dst_stages: group.dst_stages,
                by_region: !group.barriers.iter().any(|b| b.is_queue_transfer()),
                barriers: group.barriers,
            })
            .collect()
    }

    /// Clear all barriers from the batch.
    pub fn clear(&mut self) {
        self.groups.clear();
    }
}

impl Extend<BarrierDescriptor> for BarrierBatch {
    fn extend<I: IntoIterator<Item = BarrierDescriptor>>(&mut self, iter: I) {
        for barrier in iter {
            self.push(barrier);
        }
    }
}
