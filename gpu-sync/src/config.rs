//! Synchronization layer configuration.

use std::time::Duration;

use crate::types::QueueFamilies;

/// Default cap on draws per native indirect draw call.
pub const DEFAULT_MAX_INDIRECT_DRAW_COUNT: u32 = 1024;

/// Default number of frames a retired resource waits before reclamation.
pub const DEFAULT_FRAMES_IN_FLIGHT: u64 = 3;

/// Runtime configuration shared by every component of a [`SyncContext`].
///
/// [`SyncContext`]: crate::SyncContext
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Indirect draws larger than this are split into several native calls.
    pub max_indirect_draw_count: u32,
    /// Retire delay K: a resource retired at frame N is reclaimed no earlier
    /// than frame N + K.
    pub frames_in_flight: u64,
    /// Upper bound for a single fence wait.
    pub fence_timeout: Duration,
    /// Request validation layers when the backend supports them.
    pub validation: bool,
    /// When false, every queue function maps onto the graphics family and
    /// no ownership transfers are produced.
    pub enable_queue_transfers: bool,
    /// Queue family binding used by the dummy backend and as a fallback.
    pub queue_families: QueueFamilies,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_indirect_draw_count: DEFAULT_MAX_INDIRECT_DRAW_COUNT,
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            fence_timeout: Duration::from_secs(10),
            validation: cfg!(debug_assertions),
            enable_queue_transfers: true,
            queue_families: QueueFamilies::default(),
        }
    }
}

impl SyncConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum draw count per native indirect call. Zero is clamped to one.
    pub fn with_max_indirect_draw_count(mut self, count: u32) -> Self {
        self.max_indirect_draw_count = count.max(1);
        self
    }

    /// Set the retire delay in frames.
    pub fn with_frames_in_flight(mut self, frames: u64) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the fence wait timeout.
    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Enable or disable cross-family ownership transfers.
    pub fn with_queue_transfers(mut self, enabled: bool) -> Self {
        self.enable_queue_transfers = enabled;
        self
    }

    /// Set the queue family binding.
    pub fn with_queue_families(mut self, families: QueueFamilies) -> Self {
        self.queue_families = families;
        self
    }

    /// Queue families after applying `enable_queue_transfers`.
    pub fn effective_queue_families(&self) -> QueueFamilies {
        if self.enable_queue_transfers {
            self.queue_families
        } else {
            QueueFamilies::unified(self.queue_families.family(crate::types::QueueFunction::Graphics))
        }
    }
}
