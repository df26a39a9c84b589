//! Tracked GPU resources and the generation-checked arena that owns them.
//!
//! Resources form a closed set of kinds, matched exhaustively. The arena hands
//! out [`ResourceId`]s; dropping a resource goes through
//! [`ResourceArena::retire`], which defers the actual release until enough
//! frames have passed and the hazard tracker no longer names any command
//! buffer using it.

use bitflags::bitflags;

use crate::arena::SlotArena;
use crate::backend::{GpuBackend, GpuBuffer, GpuImage};
use crate::handle::ResourceId;
use crate::tracker::ResourceHazardTracker;
use crate::types::{Extent3d, ImageFormat, ImageLayout, PipelineStages};

/// The fixed set of resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ColorImage,
    DepthImage,
    UniformBuffer,
    StorageBuffer,
    TexelBuffer,
}

impl ResourceKind {
    pub fn is_image(self) -> bool {
        matches!(self, Self::ColorImage | Self::DepthImage)
    }

    pub fn is_buffer(self) -> bool {
        !self.is_image()
    }
}

bitflags! {
    /// What a resource may be used for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceCaps: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const ATTACHMENT = 1 << 4;
        const VERTEX = 1 << 5;
        const INDEX = 1 << 6;
        const INDIRECT = 1 << 7;
        const TRANSFER_SRC = 1 << 8;
        const TRANSFER_DST = 1 << 9;
        const SAMPLED = 1 << 10;
    }
}

impl Default for ResourceCaps {
    fn default() -> Self {
        Self::READ | Self::WRITE | Self::TRANSFER_SRC | Self::TRANSFER_DST
    }
}

/// Descriptor for creating a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: Option<String>,
    pub size: u64,
    pub kind: ResourceKind,
    pub caps: ResourceCaps,
    /// Map the buffer for CPU writes.
    pub host_visible: bool,
}

impl BufferDesc {
    pub fn new(kind: ResourceKind, size: u64) -> Self {
        Self {
            label: None,
            size,
            kind,
            caps: ResourceCaps::default(),
            host_visible: false,
        }
    }

    /// A host-visible transfer source used to upload data.
    pub fn staging(size: u64) -> Self {
        Self {
            label: Some("staging".to_string()),
            caps: ResourceCaps::READ | ResourceCaps::TRANSFER_SRC,
            host_visible: true,
            ..Self::new(ResourceKind::StorageBuffer, size)
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_caps(mut self, caps: ResourceCaps) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_host_visible(mut self, host_visible: bool) -> Self {
        self.host_visible = host_visible;
        self
    }
}

/// Descriptor for creating an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDesc {
    pub label: Option<String>,
    pub extent: Extent3d,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: u32,
    pub format: ImageFormat,
    pub caps: ResourceCaps,
}

impl ImageDesc {
    /// A sampled 2D color image.
    pub fn new_2d(width: u32, height: u32, format: ImageFormat) -> Self {
        Self {
            label: None,
            extent: Extent3d::new_2d(width, height),
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            format,
            caps: ResourceCaps::default() | ResourceCaps::SAMPLED,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.max(1);
        self
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples.max(1);
        self
    }

    pub fn with_caps(mut self, caps: ResourceCaps) -> Self {
        self.caps = caps;
        self
    }

    /// Full mip chain length for the extent.
    pub fn full_mip_chain(&self) -> u32 {
        let largest = self.extent.width.max(self.extent.height).max(1);
        32 - largest.leading_zeros()
    }

    /// Layout the image rests in between uses.
    pub fn resting_layout(&self) -> ImageLayout {
        if self.caps.contains(ResourceCaps::ATTACHMENT) {
            if self.format.is_depth_stencil() {
                ImageLayout::DepthStencilAttachment
            } else {
                ImageLayout::ColorAttachment
            }
        } else if self.caps.contains(ResourceCaps::STORAGE) {
            ImageLayout::General
        } else {
            ImageLayout::ShaderReadOnly
        }
    }

    /// Stages that consume the image in its resting layout.
    pub fn resting_stages(&self) -> PipelineStages {
        match self.resting_layout() {
            ImageLayout::General => PipelineStages::COMPUTE_SHADER | PipelineStages::FRAGMENT_SHADER,
            ImageLayout::ShaderReadOnly => {
                PipelineStages::FRAGMENT_SHADER | PipelineStages::COMPUTE_SHADER
            }
            other => other.stage(),
        }
    }
}

/// A buffer and its native handle.
#[derive(Debug)]
pub struct BufferResource {
    pub desc: BufferDesc,
    pub gpu: GpuBuffer,
}

/// An image and its native handle.
#[derive(Debug)]
pub struct ImageResource {
    pub desc: ImageDesc,
    pub gpu: GpuImage,
}

/// A tracked resource.
#[derive(Debug)]
pub enum Resource {
    ColorImage(ImageResource),
    DepthImage(ImageResource),
    UniformBuffer(BufferResource),
    StorageBuffer(BufferResource),
    TexelBuffer(BufferResource),
}

impl Resource {
    /// Wrap a buffer in the variant matching its kind.
    pub fn from_buffer(desc: BufferDesc, gpu: GpuBuffer) -> Self {
        let kind = desc.kind;
        let buffer = BufferResource { desc, gpu };
        match kind {
            ResourceKind::UniformBuffer => Self::UniformBuffer(buffer),
            ResourceKind::TexelBuffer => Self::TexelBuffer(buffer),
            ResourceKind::StorageBuffer | ResourceKind::ColorImage | ResourceKind::DepthImage => {
                Self::StorageBuffer(buffer)
            }
        }
    }

    /// Wrap an image, picking the depth variant for depth formats.
    pub fn from_image(desc: ImageDesc, gpu: GpuImage) -> Self {
        let depth = desc.format.is_depth_stencil();
        let image = ImageResource { desc, gpu };
        if depth {
            Self::DepthImage(image)
        } else {
            Self::ColorImage(image)
        }
    }

    /// Hand the native object back to the backend.
    pub fn destroy(self, backend: &dyn GpuBackend) {
        match self {
            Self::ColorImage(image) | Self::DepthImage(image) => backend.destroy_image(image.gpu),
            Self::UniformBuffer(buffer) | Self::StorageBuffer(buffer) | Self::TexelBuffer(buffer) => {
                backend.destroy_buffer(buffer.gpu)
            }
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::ColorImage(_) => ResourceKind::ColorImage,
            Self::DepthImage(_) => ResourceKind::DepthImage,
            Self::UniformBuffer(_) => ResourceKind::UniformBuffer,
            Self::StorageBuffer(_) => ResourceKind::StorageBuffer,
            Self::TexelBuffer(_) => ResourceKind::TexelBuffer,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Self::ColorImage(image) | Self::DepthImage(image) => image.desc.label.as_deref(),
            Self::UniformBuffer(buffer) | Self::StorageBuffer(buffer) | Self::TexelBuffer(buffer) => {
                buffer.desc.label.as_deref()
            }
        }
    }

    pub fn caps(&self) -> ResourceCaps {
        match self {
            Self::ColorImage(image) | Self::DepthImage(image) => image.desc.caps,
            Self::UniformBuffer(buffer) | Self::StorageBuffer(buffer) | Self::TexelBuffer(buffer) => {
                buffer.desc.caps
            }
        }
    }

    pub fn as_image(&self) -> Option<&ImageResource> {
        match self {
            Self::ColorImage(image) | Self::DepthImage(image) => Some(image),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&BufferResource> {
        match self {
            Self::UniformBuffer(buffer) | Self::StorageBuffer(buffer) | Self::TexelBuffer(buffer) => {
                Some(buffer)
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Entry {
    resource: Resource,
    retire_at: Option<u64>,
}

/// Owner of every tracked resource.
#[derive(Debug, Default)]
pub struct ResourceArena {
    slots: SlotArena<Entry>,
}

impl ResourceArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, resource: Resource) -> ResourceId {
        ResourceId(self.slots.insert(Entry {
            resource,
            retire_at: None,
        }))
    }

    /// Look up a resource. Stale ids return `None`.
    pub fn get(&self, id: ResourceId) -> Option<&Resource> {
        self.slots.get(id.0).map(|e| &e.resource)
    }

    /// Whether `id` names a resource that has not been reclaimed.
    pub fn is_live(&self, id: ResourceId) -> bool {
        self.slots.contains(id.0)
    }

    pub fn is_retiring(&self, id: ResourceId) -> bool {
        self.slots.get(id.0).is_some_and(|e| e.retire_at.is_some())
    }

    /// Schedule `id` for release once `frame` has been reached.
    pub fn retire(&mut self, id: ResourceId, frame: u64) -> bool {
        match self.slots.get_mut(id.0) {
            Some(entry) => {
                entry.retire_at = Some(entry.retire_at.map_or(frame, |f| f.min(frame)));
                true
            }
            None => {
                log::warn!("Retiring stale resource {id}");
                false
            }
        }
    }

    /// Remove every retired resource that is due and no longer used.
    ///
    /// Reclaimed resources are also dropped from the tracker.
    pub fn reclaim(
        &mut self,
        frame: u64,
        tracker: &mut ResourceHazardTracker,
    ) -> Vec<(ResourceId, Resource)> {
        let due: Vec<ResourceId> = self
            .slots
            .iter()
            .filter(|(_, e)| e.retire_at.is_some_and(|at| at <= frame))
            .map(|(key, _)| ResourceId(key))
            .filter(|id| {
                let busy = tracker.has_cmds_using_resource(*id);
                if busy {
                    log::debug!("{id} is due but still in use, keeping it");
                }
                !busy
            })
            .collect();

        due.into_iter()
            .filter_map(|id| {
                tracker.clear_resource(id);
                self.slots.remove(id.0).map(|e| (id, e.resource))
            })
            .collect()
    }

    /// Remove a resource right away, bypassing retirement.
    pub(crate) fn remove(&mut self, id: ResourceId) -> Option<Resource> {
        self.slots.remove(id.0).map(|e| e.resource)
    }

    /// Log every resource that is still alive and not retired.
    pub fn report_leaks(&self) -> usize {
        let mut leaks = 0;
        for (key, entry) in self.slots.iter() {
            if entry.retire_at.is_none() {
                leaks += 1;
                log::warn!(
                    "Leaked {:?} {} ({})",
                    entry.resource.kind(),
                    ResourceId(key),
                    entry.resource.label().unwrap_or("unnamed")
                );
            }
        }
        leaks
    }

    /// Remove every resource.
    pub fn drain(&mut self) -> Vec<(ResourceId, Resource)> {
        self.slots
            .drain()
            .into_iter()
            .map(|(key, e)| (ResourceId(key), e.resource))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{CmdInfo, CommandBufferId};
    use crate::tracker::AccessRequest;
    use crate::types::{AccessFlags, QueueFunction};

    fn buffer(size: u64) -> Resource {
        Resource::StorageBuffer(BufferResource {
            desc: BufferDesc::new(ResourceKind::StorageBuffer, size),
            gpu: GpuBuffer::Dummy { size },
        })
    }

    #[test]
    fn test_resting_layout() {
        let sampled = ImageDesc::new_2d(4, 4, ImageFormat::Rgba8Unorm);
        assert_eq!(sampled.resting_layout(), ImageLayout::ShaderReadOnly);

        let storage = sampled.clone().with_caps(ResourceCaps::STORAGE);
        assert_eq!(storage.resting_layout(), ImageLayout::General);

        let depth = ImageDesc::new_2d(4, 4, ImageFormat::Depth32Float)
            .with_caps(ResourceCaps::ATTACHMENT);
        assert_eq!(depth.resting_layout(), ImageLayout::DepthStencilAttachment);
    }

    #[test]
    fn test_variant_follows_kind() {
        let depth = ImageDesc::new_2d(4, 4, ImageFormat::Depth32Float);
        let resource = Resource::from_image(depth, GpuImage::Dummy);
        assert_eq!(resource.kind(), ResourceKind::DepthImage);

        let uniform = BufferDesc::new(ResourceKind::UniformBuffer, 64);
        let resource = Resource::from_buffer(uniform, GpuBuffer::Dummy { size: 64 });
        assert_eq!(resource.kind(), ResourceKind::UniformBuffer);
        assert!(resource.as_image().is_none());
    }

    #[test]
    fn test_full_mip_chain() {
        assert_eq!(ImageDesc::new_2d(256, 128, ImageFormat::Rgba8Unorm).full_mip_chain(), 9);
        assert_eq!(ImageDesc::new_2d(1, 1, ImageFormat::Rgba8Unorm).full_mip_chain(), 1);
    }

    #[test]
    fn test_stale_id_after_reclaim() {
        let mut arena = ResourceArena::new();
        let mut tracker = ResourceHazardTracker::new();
        let id = arena.insert(buffer(64));
        assert!(arena.retire(id, 3));

        assert!(arena.reclaim(2, &mut tracker).is_empty());
        assert_eq!(arena.reclaim(3, &mut tracker).len(), 1);
        assert!(!arena.is_live(id));
        assert!(arena.get(id).is_none());

        let reused = arena.insert(buffer(64));
        assert_eq!(reused.key().index(), id.key().index());
        assert_ne!(reused, id);
    }

    #[test]
    fn test_reclaim_waits_for_tracker() {
        let mut arena = ResourceArena::new();
        let mut tracker = ResourceHazardTracker::new();
        let id = arena.insert(buffer(64));
        let cmd = CommandBufferId::from_raw_parts(0, 0);
        tracker.request_access(
            id,
            &AccessRequest::write(
                CmdInfo::new(cmd, QueueFunction::Graphics, 0),
                PipelineStages::TRANSFER,
                AccessFlags::TRANSFER_WRITE,
            ),
        );

        arena.retire(id, 0);
        assert!(arena.reclaim(5, &mut tracker).is_empty());

        tracker.clear_finished_cmd(cmd);
        assert_eq!(arena.reclaim(5, &mut tracker).len(), 1);
        assert!(tracker.record(id).is_none());
    }

    #[test]
    fn test_report_leaks_skips_retired() {
        let mut arena = ResourceArena::new();
        let kept = arena.insert(buffer(16));
        let retired = arena.insert(buffer(16));
        arena.retire(retired, 10);
        assert_eq!(arena.report_leaks(), 1);
        assert!(arena.is_live(kept));
    }
}
