//! Per-resource access bookkeeping.

use crate::handle::{CommandBufferId, QueueOwner};
use crate::types::{AccessFlags, ImageLayout, PipelineStages};

/// The most recent write to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteInfo {
    pub cmd: CommandBufferId,
    pub owner: QueueOwner,
    pub stage: PipelineStages,
    pub access: AccessFlags,
    pub layout: Option<ImageLayout>,
}

/// A command buffer that has read the resource since the last write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInfo {
    pub cmd: CommandBufferId,
    pub owner: QueueOwner,
    pub stages: PipelineStages,
    pub access: AccessFlags,
}

/// An ownership release already recorded on the source queue, awaiting its acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasedTo {
    /// Command buffer holding the release barrier.
    pub cmd: CommandBufferId,
    pub from: QueueOwner,
    pub to_family: u32,
    pub old_layout: Option<ImageLayout>,
    pub new_layout: Option<ImageLayout>,
}

/// Coarse state of an [`AccessRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessPhase {
    /// No outstanding writer or readers.
    Idle,
    /// Written, not read since.
    Written,
    /// Read with no outstanding writer.
    Read,
    /// Read at least once since the last outstanding write.
    ReadAfterWrite,
}

impl AccessPhase {
    /// Whether a single tracker mutation may move a record from `self` to `next`.
    ///
    /// A write always clears readers, so `Read -> ReadAfterWrite` and
    /// `Written -> Read` are never legal.
    pub fn can_transition_to(self, next: AccessPhase) -> bool {
        use AccessPhase::*;
        matches!(
            (self, next),
            (Idle, Idle | Written | Read)
                | (Written, Written | ReadAfterWrite | Idle)
                | (Read, Read | Written | Idle)
                | (ReadAfterWrite, ReadAfterWrite | Written | Read | Idle)
        )
    }
}

/// Tracked access state for one buffer or image.
#[derive(Debug, Clone, Default)]
pub struct AccessRecord {
    pub(crate) last_write: Option<WriteInfo>,
    pub(crate) readers: Vec<ReaderInfo>,
    pub(crate) all_read_stages: PipelineStages,
    pub(crate) layout: Option<ImageLayout>,
    pub(crate) owner: Option<QueueOwner>,
    pub(crate) released_to: Option<ReleasedTo>,
}

impl AccessRecord {
    pub fn phase(&self) -> AccessPhase {
        match (self.last_write.is_some(), self.readers.is_empty()) {
            (false, true) => AccessPhase::Idle,
            (true, true) => AccessPhase::Written,
            (false, false) => AccessPhase::Read,
            (true, false) => AccessPhase::ReadAfterWrite,
        }
    }

    pub fn last_write(&self) -> Option<&WriteInfo> {
        self.last_write.as_ref()
    }

    pub fn readers(&self) -> &[ReaderInfo] {
        &self.readers
    }

    /// Union of the stages of every reader since the last write.
    pub fn all_read_stages(&self) -> PipelineStages {
        self.all_read_stages
    }

    /// Tracked image layout, `None` for buffers and unknown images.
    pub fn layout(&self) -> Option<ImageLayout> {
        self.layout
    }

    /// Queue that last took ownership of the resource.
    pub fn owner(&self) -> Option<QueueOwner> {
        self.owner
    }

    pub fn released_to(&self) -> Option<&ReleasedTo> {
        self.released_to.as_ref()
    }

    pub(crate) fn reader_index(&self, cmd: CommandBufferId) -> Option<usize> {
        self.readers.iter().position(|r| r.cmd == cmd)
    }

    pub(crate) fn add_reader(&mut self, reader: ReaderInfo) {
        match self.reader_index(reader.cmd) {
            Some(index) => {
                let existing = &mut self.readers[index];
                existing.stages |= reader.stages;
                existing.access |= reader.access;
            }
            None => self.readers.push(reader),
        }
        self.all_read_stages |= reader.stages;
    }

    pub(crate) fn set_writer(&mut self, write: WriteInfo) {
        self.clear_readers();
        self.last_write = Some(write);
    }

    pub(crate) fn clear_readers(&mut self) {
        self.readers.clear();
        self.all_read_stages = PipelineStages::empty();
    }

    /// Forget every reference to `cmd`. Returns `true` if anything changed.
    pub(crate) fn forget_cmd(&mut self, cmd: CommandBufferId) -> bool {
        let mut changed = false;
        if self.last_write.is_some_and(|w| w.cmd == cmd) {
            self.last_write = None;
            changed = true;
        }
        if let Some(index) = self.reader_index(cmd) {
            self.readers.remove(index);
            changed = true;
            if self.readers.is_empty() {
                self.clear_readers();
            } else {
                self.all_read_stages = self
                    .readers
                    .iter()
                    .fold(PipelineStages::empty(), |acc, r| acc | r.stages);
            }
        }
        changed
    }

    pub(crate) fn settle_layout(&mut self, layout: ImageLayout) {
        self.layout = Some(layout);
        if let Some(write) = self.last_write.as_mut() {
            write.layout = Some(layout);
        }
    }

    /// Whether `cmd` is the writer or one of the readers.
    pub fn references(&self, cmd: CommandBufferId) -> bool {
        self.last_write.is_some_and(|w| w.cmd == cmd) || self.reader_index(cmd).is_some()
    }

    /// Every command buffer named by the record, writer first.
    pub fn cmds(&self) -> impl Iterator<Item = CommandBufferId> + '_ {
        self.last_write
            .iter()
            .map(|w| w.cmd)
            .chain(self.readers.iter().map(|r| r.cmd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueueFunction;

    fn cmd(i: u32) -> CommandBufferId {
        CommandBufferId::from_raw_parts(i, 0)
    }

    fn reader(i: u32, stages: PipelineStages) -> ReaderInfo {
        ReaderInfo {
            cmd: cmd(i),
            owner: QueueOwner::new(QueueFunction::Graphics, 0),
            stages,
            access: AccessFlags::SHADER_READ,
        }
    }

    #[test]
    fn test_phase_follows_writer_and_readers() {
        let mut record = AccessRecord::default();
        assert_eq!(record.phase(), AccessPhase::Idle);

        record.set_writer(WriteInfo {
            cmd: cmd(0),
            owner: QueueOwner::new(QueueFunction::Graphics, 0),
            stage: PipelineStages::TRANSFER,
            access: AccessFlags::TRANSFER_WRITE,
            layout: None,
        });
        assert_eq!(record.phase(), AccessPhase::Written);

        record.add_reader(reader(1, PipelineStages::FRAGMENT_SHADER));
        assert_eq!(record.phase(), AccessPhase::ReadAfterWrite);

        assert!(record.forget_cmd(cmd(0)));
        assert_eq!(record.phase(), AccessPhase::Read);

        assert!(record.forget_cmd(cmd(1)));
        assert_eq!(record.phase(), AccessPhase::Idle);
        assert!(record.all_read_stages().is_empty());
    }

    #[test]
    fn test_reader_stages_merge() {
        let mut record = AccessRecord::default();
        record.add_reader(reader(1, PipelineStages::VERTEX_SHADER));
        record.add_reader(reader(1, PipelineStages::FRAGMENT_SHADER));
        record.add_reader(reader(2, PipelineStages::COMPUTE_SHADER));

        assert_eq!(record.readers().len(), 2);
        assert_eq!(record.readers()[0].stages, PipelineStages::GRAPHICS_SHADERS);
        assert_eq!(
            record.all_read_stages(),
            PipelineStages::GRAPHICS_SHADERS | PipelineStages::COMPUTE_SHADER
        );

        record.forget_cmd(cmd(2));
        assert_eq!(record.all_read_stages(), PipelineStages::GRAPHICS_SHADERS);
    }

    #[test]
    fn test_transition_table() {
        use AccessPhase::*;
        assert!(Idle.can_transition_to(Written));
        assert!(Written.can_transition_to(ReadAfterWrite));
        assert!(ReadAfterWrite.can_transition_to(Read));
        assert!(!Read.can_transition_to(ReadAfterWrite));
        assert!(!Written.can_transition_to(Read));
        assert!(!Idle.can_transition_to(ReadAfterWrite));
    }
}
