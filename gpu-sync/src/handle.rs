//! Typed identifiers for tracked resources and command buffers.

use std::fmt;

use crate::arena::SlotKey;
use crate::types::QueueFunction;

/// Identity of a tracked buffer or image.
///
/// A non-owning, generation-checked reference into the resource arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) SlotKey);

impl ResourceId {
    /// Build an id from raw slot parts, for ids minted outside an arena.
    pub fn from_raw_parts(index: u32, generation: u32) -> Self {
        Self(SlotKey::new(index, generation))
    }

    /// Slot key backing this id.
    pub fn key(self) -> SlotKey {
        self.0
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res#{:?}", self.0)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res#{:?}", self.0)
    }
}

/// Identity of a command buffer in the registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandBufferId(pub(crate) SlotKey);

impl CommandBufferId {
    /// Build an id from raw slot parts, for ids minted outside a registry.
    pub fn from_raw_parts(index: u32, generation: u32) -> Self {
        Self(SlotKey::new(index, generation))
    }

    /// Slot key backing this id.
    pub fn key(self) -> SlotKey {
        self.0
    }
}

impl fmt::Debug for CommandBufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd#{:?}", self.0)
    }
}

impl fmt::Display for CommandBufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd#{:?}", self.0)
    }
}

/// A queue function together with the family index it runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueOwner {
    pub queue: QueueFunction,
    pub family: u32,
}

impl QueueOwner {
    pub fn new(queue: QueueFunction, family: u32) -> Self {
        Self { queue, family }
    }
}

/// What the hazard tracker needs to know about the command buffer making a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CmdInfo {
    pub id: CommandBufferId,
    pub owner: QueueOwner,
}

impl CmdInfo {
    pub fn new(id: CommandBufferId, queue: QueueFunction, family: u32) -> Self {
        Self {
            id,
            owner: QueueOwner::new(queue, family),
        }
    }

    /// Queue function of the command buffer.
    pub fn queue(&self) -> QueueFunction {
        self.owner.queue
    }

    /// Queue family index of the command buffer.
    pub fn family(&self) -> u32 {
        self.owner.family
    }
}
