//! GPU synchronization primitives.
//!
//! Thin shared wrappers over backend fences and semaphores. Both are cheap to
//! clone; the native object is released when the last clone drops.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::backend::{GpuBackend, GpuFence, GpuSemaphore};
use crate::error::SyncError;

static NEXT_SYNC_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_SYNC_ID.fetch_add(1, Ordering::Relaxed)
}

/// Status of a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// The fence has not yet been signaled.
    Unsignaled,
    /// The fence has been signaled (GPU work complete).
    Signaled,
}

/// CPU-GPU synchronization primitive.
///
/// Attached to a submission, it signals once every command buffer in that
/// submission has completed.
#[derive(Debug, Clone)]
pub struct Fence {
    inner: Arc<GpuFence>,
    id: u64,
}

impl Fence {
    pub fn new(backend: &dyn GpuBackend, signaled: bool) -> Result<Self, SyncError> {
        Ok(Self {
            inner: Arc::new(backend.create_fence(signaled)?),
            id: next_id(),
        })
    }

    /// Unique identifier (for debugging).
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn gpu(&self) -> &GpuFence {
        &self.inner
    }

    pub fn status(&self, backend: &dyn GpuBackend) -> FenceStatus {
        if backend.is_fence_signaled(&self.inner) {
            FenceStatus::Signaled
        } else {
            FenceStatus::Unsignaled
        }
    }

    /// Block until the fence signals or `timeout` elapses.
    pub fn wait(&self, backend: &dyn GpuBackend, timeout: Duration) -> Result<(), SyncError> {
        backend.wait_fence(&self.inner, timeout)
    }

    pub fn reset(&self, backend: &dyn GpuBackend) -> Result<(), SyncError> {
        backend.reset_fence(&self.inner)
    }
}

/// GPU semaphore ordering one submission after another.
///
/// Unlike fences, semaphores cannot be waited on from the CPU.
#[derive(Debug, Clone)]
pub struct Semaphore {
    inner: Arc<GpuSemaphore>,
    id: u64,
}

impl Semaphore {
    pub fn new(backend: &dyn GpuBackend) -> Result<Self, SyncError> {
        Ok(Self {
            inner: Arc::new(backend.create_semaphore()?),
            id: next_id(),
        })
    }

    /// Unique identifier (for debugging).
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn gpu(&self) -> &GpuSemaphore {
        &self.inner
    }
}

impl PartialEq for Semaphore {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Semaphore {}
