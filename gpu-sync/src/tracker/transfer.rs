//! Pending queue-family ownership releases.

use crate::handle::CommandBufferId;
use crate::types::{AccessFlags, ImageLayout, PipelineStages};

/// A resource that must be released from the queue it is registered on.
///
/// `acquired` is set when the destination queue already recorded the matching
/// acquire, so only the release half is still owed. `acquirers` names the
/// command buffers holding that acquire and the stages they acquire at.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueuePendingRelease {
    pub stages: PipelineStages,
    pub access: AccessFlags,
    pub src_layout: Option<ImageLayout>,
    pub dst_layout: Option<ImageLayout>,
    pub dst_family: Option<u32>,
    pub acquired: bool,
    pub is_image: bool,
    pub acquirers: Vec<(CommandBufferId, PipelineStages)>,
}

impl QueuePendingRelease {
    /// Release of a buffer written at `stages` with `access`.
    pub fn buffer(stages: PipelineStages, access: AccessFlags) -> Self {
        Self {
            stages,
            access,
            ..Self::default()
        }
    }

    /// Release of an image currently in `layout`.
    pub fn image(stages: PipelineStages, access: AccessFlags, layout: ImageLayout) -> Self {
        Self {
            stages,
            access,
            src_layout: Some(layout),
            dst_layout: Some(layout),
            is_image: true,
            ..Self::default()
        }
    }

    pub fn with_dst_family(mut self, family: u32) -> Self {
        self.dst_family = Some(family);
        self
    }

    /// Fold a later release of the same resource into this one.
    pub(crate) fn merge(&mut self, other: &Self) {
        self.stages |= other.stages;
        self.access |= other.access;
        if self.src_layout.is_none() {
            self.src_layout = other.src_layout;
        }
        if other.dst_layout.is_some() {
            self.dst_layout = other.dst_layout;
        }
        if other.dst_family.is_some() {
            self.dst_family = other.dst_family;
        }
        self.acquired |= other.acquired;
        self.is_image |= other.is_image;
        for &(cmd, stages) in &other.acquirers {
            self.add_acquirer(cmd, stages);
        }
    }

    pub(crate) fn add_acquirer(&mut self, cmd: CommandBufferId, stages: PipelineStages) {
        match self.acquirers.iter_mut().find(|(c, _)| *c == cmd) {
            Some((_, existing)) => *existing |= stages,
            None => self.acquirers.push((cmd, stages)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_accumulates_masks() {
        let mut release = QueuePendingRelease::image(
            PipelineStages::TRANSFER,
            AccessFlags::TRANSFER_WRITE,
            ImageLayout::TransferDst,
        );
        release.merge(
            &QueuePendingRelease::image(
                PipelineStages::COMPUTE_SHADER,
                AccessFlags::SHADER_WRITE,
                ImageLayout::General,
            )
            .with_dst_family(1),
        );

        assert_eq!(
            release.stages,
            PipelineStages::TRANSFER | PipelineStages::COMPUTE_SHADER
        );
        assert_eq!(release.src_layout, Some(ImageLayout::TransferDst));
        assert_eq!(release.dst_layout, Some(ImageLayout::General));
        assert_eq!(release.dst_family, Some(1));
        assert!(!release.acquired);
        assert!(release.acquirers.is_empty());
    }

    #[test]
    fn test_merge_keeps_every_acquirer() {
        let first = CommandBufferId::from_raw_parts(1, 0);
        let second = CommandBufferId::from_raw_parts(2, 0);
        let mut release =
            QueuePendingRelease::buffer(PipelineStages::COMPUTE_SHADER, AccessFlags::SHADER_WRITE);
        release.add_acquirer(first, PipelineStages::TRANSFER);

        let mut later =
            QueuePendingRelease::buffer(PipelineStages::COMPUTE_SHADER, AccessFlags::SHADER_WRITE);
        later.add_acquirer(first, PipelineStages::VERTEX_INPUT);
        later.add_acquirer(second, PipelineStages::FRAGMENT_SHADER);
        release.merge(&later);

        assert_eq!(
            release.acquirers,
            vec![
                (first, PipelineStages::TRANSFER | PipelineStages::VERTEX_INPUT),
                (second, PipelineStages::FRAGMENT_SHADER),
            ]
        );
    }
}
