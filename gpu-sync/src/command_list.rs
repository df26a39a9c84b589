//! Command recording with automatic barriers.
//!
//! [`CommandList`] is the recording surface. Every operation asks the hazard
//! tracker what each touched resource needs, records the resulting barriers
//! as one grouped barrier command, then records the operation itself.
//!
//! Operations come in two flavours:
//!
//! - `cmd_*` and the render/compute calls record into a command buffer the
//!   caller started with [`CommandList::start_cmd`].
//! - Immediate operations (`copy_buffer`, `copy_to_image`, `clear_image`, ...)
//!   record into a temporary command buffer, submit it and wait for it before
//!   returning. On a dedicated transfer queue they release the touched
//!   resources to the graphics family at the end.

use std::collections::{BTreeMap, HashMap};

use bytemuck::Pod;

use crate::backend::GpuBackend;
use crate::barriers::{BarrierBatch, BarrierDescriptor};
use crate::config::SyncConfig;
use crate::descriptors::{BindingAccess, DescriptorSet};
use crate::encoder::{
    BufferCopy, BufferImageCopy, ImageBlit, ImageCopy, NativeCommand, RenderPassBegin,
};
use crate::error::SyncError;
use crate::handle::{CmdInfo, CommandBufferId, ResourceId};
use crate::profiling::profile_scope;
use crate::registry::{CommandBufferRegistry, CommandBufferState, CommandBufferUsage};
use crate::resources::{BufferDesc, ImageDesc, Resource, ResourceArena, ResourceCaps};
use crate::submission::{SubmissionCoordinator, SubmissionStats, SubmitInfo};
use crate::sync::{Fence, Semaphore};
use crate::tracker::{AccessIntent, AccessRequest, QueuePendingRelease, ResourceHazardTracker};
use crate::types::{
    AccessFlags, Extent3d, ImageLayout, IndexType, MipRange, Offset3d, PipelineBindPoint,
    PipelineStages, QueueFamilies, QueueFunction, QueuePriority, RawHandle, ScissorRect,
    ShaderStages, Viewport,
};

/// How mip levels beyond the base are filled by [`CommandList::copy_to_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MipUpload {
    /// Upload the base level and blit it down the whole chain.
    #[default]
    Generate,
    /// The data holds every level, tightly packed, largest first.
    Provided,
    /// Upload the base level only.
    BaseOnly,
}

/// A sub-region of an image used by copies and resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageRegion {
    pub mips: MipRange,
    pub base_layer: u32,
    pub layer_count: u32,
    pub offset: Offset3d,
    /// Extent at the base mip of the region.
    pub extent: Extent3d,
}

impl ImageRegion {
    /// Every mip and layer of an image.
    pub fn whole(desc: &ImageDesc) -> Self {
        Self {
            mips: MipRange::new(0, desc.mip_levels),
            base_layer: 0,
            layer_count: desc.array_layers,
            offset: Offset3d::default(),
            extent: desc.extent,
        }
    }

    pub fn with_mips(mut self, mips: MipRange) -> Self {
        self.mips = mips;
        self
    }

    pub fn with_offset(mut self, offset: Offset3d) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_extent(mut self, extent: Extent3d) -> Self {
        self.extent = extent;
        self
    }

    fn clamped(mut self, desc: &ImageDesc) -> Self {
        self.mips.count = self
            .mips
            .count
            .min(desc.mip_levels.saturating_sub(self.mips.base));
        self.layer_count = self
            .layer_count
            .min(desc.array_layers.saturating_sub(self.base_layer));
        self
    }

    /// Whether two regions of the same image touch the same texels.
    ///
    /// Regions are compared on every mip level they share, each scaled to
    /// that level.
    pub fn overlaps(&self, other: &Self) -> bool {
        let layers = self.base_layer < other.base_layer.saturating_add(other.layer_count)
            && other.base_layer < self.base_layer.saturating_add(self.layer_count);
        if !layers {
            return false;
        }
        let first = self.mips.base.max(other.mips.base);
        let last = self.mips.end().min(other.mips.end());
        (first..last).any(|mip| {
            let (a_offset, a_extent) = self.level_box(mip - self.mips.base);
            let (b_offset, b_extent) = other.level_box(mip - other.mips.base);
            boxes_intersect(a_offset, a_extent, b_offset, b_extent)
        })
    }

    fn level_box(&self, level: u32) -> (Offset3d, Extent3d) {
        (shrink_offset(self.offset, level), self.extent.mip(level))
    }

    fn region_copy(&self, dst: &Self, level: u32) -> ImageCopy {
        ImageCopy {
            src_mip: self.mips.base + level,
            src_offset: shrink_offset(self.offset, level),
            dst_mip: dst.mips.base + level,
            dst_offset: shrink_offset(dst.offset, level),
            extent: self.extent.mip(level),
            base_layer: self.base_layer,
            layer_count: self.layer_count,
        }
    }
}

fn boxes_intersect(a: Offset3d, a_extent: Extent3d, b: Offset3d, b_extent: Extent3d) -> bool {
    let axis = |a: i32, a_len: u32, b: i32, b_len: u32| {
        let (a, b) = (i64::from(a), i64::from(b));
        let (a_len, b_len) = (i64::from(a_len), i64::from(b_len));
        a_len > 0 && b_len > 0 && a < b + b_len && b < a + a_len
    };
    axis(a.x, a_extent.width, b.x, b_extent.width)
        && axis(a.y, a_extent.height, b.y, b_extent.height)
        && axis(a.z, a_extent.depth, b.z, b_extent.depth)
}

fn shrink_offset(offset: Offset3d, level: u32) -> Offset3d {
    let shift = |v: i32| v.checked_shr(level).unwrap_or(0);
    Offset3d::new(shift(offset.x), shift(offset.y), shift(offset.z))
}

/// One copy in a batched buffer copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCopyBuffer {
    pub src: ResourceId,
    pub dst: ResourceId,
    pub region: BufferCopy,
}

/// One upload in a batched host to buffer copy.
#[derive(Debug, Clone, Copy)]
pub struct BatchCopyData<'d> {
    pub dst: ResourceId,
    pub offset: u64,
    pub data: &'d [u8],
}

const STAGING_ALIGNMENT: usize = 16;

fn read_intent(caps: ResourceCaps) -> AccessIntent {
    if caps.contains(ResourceCaps::WRITE) {
        AccessIntent::ReadFromWrite
    } else {
        AccessIntent::Read
    }
}

fn attachment_access(is_depth: bool) -> (PipelineStages, AccessFlags) {
    if is_depth {
        (
            PipelineStages::EARLY_FRAGMENT_TESTS | PipelineStages::LATE_FRAGMENT_TESTS,
            AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
    } else {
        (
            PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            AccessFlags::COLOR_ATTACHMENT_WRITE,
        )
    }
}

#[derive(Clone, Copy)]
enum ClearKind {
    Color([f32; 4]),
    Depth { depth: f32, stencil: u32 },
}

/// Records operations into command buffers, inserting the barriers they need.
///
/// A short-lived view over the context's registries; see
/// [`crate::SyncContext::command_list`].
pub struct CommandList<'a> {
    pub(crate) backend: &'a dyn GpuBackend,
    pub(crate) config: &'a SyncConfig,
    pub(crate) resources: &'a mut ResourceArena,
    pub(crate) tracker: &'a mut ResourceHazardTracker,
    pub(crate) registry: &'a mut CommandBufferRegistry,
    pub(crate) stats: &'a mut SubmissionStats,
}

impl<'a> CommandList<'a> {
    pub fn new(
        backend: &'a dyn GpuBackend,
        config: &'a SyncConfig,
        resources: &'a mut ResourceArena,
        tracker: &'a mut ResourceHazardTracker,
        registry: &'a mut CommandBufferRegistry,
        stats: &'a mut SubmissionStats,
    ) -> Self {
        Self {
            backend,
            config,
            resources,
            tracker,
            registry,
            stats,
        }
    }

    /// Submission view over the same registries.
    pub fn submission(&mut self) -> SubmissionCoordinator<'_> {
        SubmissionCoordinator::new(
            self.backend,
            self.config,
            &mut *self.registry,
            &mut *self.tracker,
            &mut *self.stats,
        )
    }

    pub fn tracker(&self) -> &ResourceHazardTracker {
        self.tracker
    }

    pub fn registry(&self) -> &CommandBufferRegistry {
        self.registry
    }

    // ------------------------------------------------------------------
    // Command buffer lifetime
    // ------------------------------------------------------------------

    /// Start recording a command buffer.
    pub fn start_cmd(
        &mut self,
        name: &str,
        queue: QueueFunction,
        usage: CommandBufferUsage,
    ) -> Result<CommandBufferId, SyncError> {
        self.submission().start_cmd(name, queue, usage)
    }

    pub fn end_cmd(&mut self, cmd: CommandBufferId) -> Result<(), SyncError> {
        self.submission().end_cmd(cmd)
    }

    pub fn submit_cmd(
        &mut self,
        priority: QueuePriority,
        info: &SubmitInfo,
        fence: Option<&Fence>,
    ) -> Result<(), SyncError> {
        self.submission().submit_cmd(priority, info, fence)
    }

    pub fn submit_cmds(
        &mut self,
        priority: QueuePriority,
        infos: &[SubmitInfo],
        fence: Option<&Fence>,
    ) -> Result<(), SyncError> {
        self.submission().submit_cmds(priority, infos, fence)
    }

    pub fn submit_wait_cmd(
        &mut self,
        priority: QueuePriority,
        cmd: CommandBufferId,
    ) -> Result<(), SyncError> {
        self.submission().submit_wait_cmd(priority, cmd)
    }

    pub fn finish_cmd(&mut self, cmd: CommandBufferId) -> Result<(), SyncError> {
        self.submission().finish_cmd(cmd)
    }

    pub fn free_cmd(&mut self, cmd: CommandBufferId) {
        self.submission().free_cmd(cmd)
    }

    pub fn discard_cmd(&mut self, cmd: CommandBufferId) -> Result<(), SyncError> {
        self.submission().discard_cmd(cmd)
    }

    pub fn flush_all_commands(&mut self) -> Result<(), SyncError> {
        self.submission().flush_all_commands()
    }

    pub fn wait_on_res_dep_cmds(&mut self, resource: ResourceId) -> Result<(), SyncError> {
        self.submission().wait_on_res_dep_cmds(resource)
    }

    pub fn present_image(
        &mut self,
        swapchains: &[RawHandle],
        image_indices: &[u32],
        wait_semaphores: &[Semaphore],
    ) -> Result<(), SyncError> {
        self.submission()
            .present_image(swapchains, image_indices, wait_semaphores)
    }

    pub fn has_cmds_using_resource(&self, resource: ResourceId) -> bool {
        self.tracker.has_cmds_using_resource(resource)
    }

    // ------------------------------------------------------------------
    // Buffer copies
    // ------------------------------------------------------------------

    /// Copy between buffers and wait for the copy to finish.
    pub fn copy_buffer(
        &mut self,
        src: ResourceId,
        dst: ResourceId,
        regions: &[BufferCopy],
    ) -> Result<(), SyncError> {
        profile_scope!("copy_buffer");
        if !self.validate_buffer_copy(src, dst, regions) {
            return Ok(());
        }
        self.run_temp("copy_buffer", QueueFunction::Transfer, &[src, dst], |list, info| {
            list.record_buffer_copy(info, src, dst, regions.to_vec());
        })
    }

    /// Several buffer copies in one temporary command buffer.
    ///
    /// Copies sharing a source and destination are merged into one command.
    pub fn copy_buffers(&mut self, copies: &[BatchCopyBuffer]) -> Result<(), SyncError> {
        profile_scope!("copy_buffers");
        let mut grouped: BTreeMap<(ResourceId, ResourceId), Vec<BufferCopy>> = BTreeMap::new();
        for copy in copies {
            grouped
                .entry((copy.src, copy.dst))
                .or_default()
                .push(copy.region);
        }
        grouped.retain(|(src, dst), regions| self.validate_buffer_copy(*src, *dst, regions));
        if grouped.is_empty() {
            return Ok(());
        }

        let touched: Vec<ResourceId> = grouped.keys().flat_map(|(s, d)| [*s, *d]).collect();
        self.run_temp("copy_buffers", QueueFunction::Transfer, &touched, |list, info| {
            for ((src, dst), regions) in grouped {
                list.record_buffer_copy(info, src, dst, regions);
            }
        })
    }

    /// Record a buffer copy into `cmd`.
    ///
    /// # Panics
    ///
    /// Panics if `src == dst` and a region overlaps itself.
    pub fn cmd_copy_buffer(
        &mut self,
        cmd: CommandBufferId,
        src: ResourceId,
        dst: ResourceId,
        regions: &[BufferCopy],
    ) {
        let Some(info) = self.recording(cmd) else {
            return;
        };
        if self.in_render_pass(cmd) {
            log::error!("Buffer copy recorded inside a render pass of {cmd}, skipping");
            return;
        }
        if self.validate_buffer_copy(src, dst, regions) {
            self.record_buffer_copy(info, src, dst, regions.to_vec());
        }
    }

    /// Write host data into a buffer.
    ///
    /// Host-visible buffers are written directly once every command buffer
    /// using them has finished; others go through a staging buffer.
    pub fn copy_to_buffer(
        &mut self,
        dst: ResourceId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), SyncError> {
        profile_scope!("copy_to_buffer");
        let Some(desc) = self.buffer_desc(dst) else {
            return Ok(());
        };
        if !fits(offset, data.len(), desc.size) {
            log::error!(
                "Writing {} bytes at {offset} overflows {dst} of {} bytes",
                data.len(),
                desc.size
            );
            return Ok(());
        }
        if data.is_empty() {
            return Ok(());
        }

        if desc.host_visible {
            self.submission().wait_on_res_dep_cmds(dst)?;
            if let Some(buffer) = self.resources.get(dst).and_then(Resource::as_buffer) {
                self.backend.write_buffer(&buffer.gpu, offset, data)?;
            }
            return Ok(());
        }
        self.copy_to_buffers(&[BatchCopyData { dst, offset, data }])
    }

    /// Upload several host ranges through one staging buffer.
    pub fn copy_to_buffers(&mut self, uploads: &[BatchCopyData<'_>]) -> Result<(), SyncError> {
        profile_scope!("copy_to_buffers");
        let mut staged = Vec::new();
        let mut copies = Vec::new();
        for upload in uploads {
            let Some(desc) = self.buffer_desc(upload.dst) else {
                continue;
            };
            if !desc.caps.contains(ResourceCaps::TRANSFER_DST) {
                log::error!("{} cannot be a copy destination", upload.dst);
                continue;
            }
            if upload.data.is_empty() || !fits(upload.offset, upload.data.len(), desc.size) {
                log::error!(
                    "Skipping upload of {} bytes at {} into {}",
                    upload.data.len(),
                    upload.offset,
                    upload.dst
                );
                continue;
            }
            let start = staged.len();
            staged.extend_from_slice(upload.data);
            staged.resize(staged.len().next_multiple_of(STAGING_ALIGNMENT), 0);
            copies.push((
                upload.dst,
                BufferCopy::new(start as u64, upload.offset, upload.data.len() as u64),
            ));
        }
        if copies.is_empty() {
            return Ok(());
        }

        let staging = self.create_staging(&staged)?;
        let batch: Vec<BatchCopyBuffer> = copies
            .into_iter()
            .map(|(dst, region)| BatchCopyBuffer {
                src: staging,
                dst,
                region,
            })
            .collect();
        let result = self.copy_buffers(&batch);
        self.destroy_now(staging);
        result
    }

    // ------------------------------------------------------------------
    // Image transfers
    // ------------------------------------------------------------------

    /// Upload pixel data into an image and leave it in its resting layout.
    ///
    /// With [`MipUpload::Generate`] the base level is blitted down every
    /// level of the image, which needs a graphics queue.
    pub fn copy_to_image(
        &mut self,
        image: ResourceId,
        data: &[u8],
        upload: MipUpload,
    ) -> Result<(), SyncError> {
        profile_scope!("copy_to_image");
        let Some(desc) = self.image_desc(image) else {
            return Ok(());
        };
        let mip_count = match upload {
            MipUpload::BaseOnly => 1,
            MipUpload::Generate | MipUpload::Provided => desc.mip_levels.max(1),
        };
        let uploaded_levels = if upload == MipUpload::Provided { mip_count } else { 1 };

        let texel = u64::from(desc.format.block_size());
        let mut regions = Vec::with_capacity(uploaded_levels as usize);
        let mut required = 0u64;
        for level in 0..uploaded_levels {
            let extent = desc.extent.mip(level);
            regions.push(BufferImageCopy {
                layer_count: desc.array_layers,
                ..BufferImageCopy::mip(required, level, extent)
            });
            required += u64::from(extent.width)
                * u64::from(extent.height)
                * u64::from(extent.depth)
                * u64::from(desc.array_layers)
                * texel;
        }
        if (data.len() as u64) < required {
            log::error!(
                "Pixel data for {image} is {} bytes, {required} needed",
                data.len()
            );
            return Ok(());
        }

        let generate = upload == MipUpload::Generate && mip_count > 1;
        let queue = if upload == MipUpload::Generate || desc.format.is_depth_stencil() {
            QueueFunction::Graphics
        } else {
            QueueFunction::Transfer
        };

        let staging = self.create_staging(&data[..required as usize])?;
        let result = self.run_temp("copy_to_image", queue, &[image], |list, info| {
            list.record_image_upload(info, image, staging, &desc, regions, mip_count, generate);
        });
        self.destroy_now(staging);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn record_image_upload(
        &mut self,
        info: CmdInfo,
        image: ResourceId,
        staging: ResourceId,
        desc: &ImageDesc,
        regions: Vec<BufferImageCopy>,
        mip_count: u32,
        generate: bool,
    ) {
        let all = MipRange::new(0, mip_count);
        let mut batch = BarrierBatch::new();
        let to_dst = AccessRequest::write(info, PipelineStages::TRANSFER, AccessFlags::TRANSFER_WRITE)
            .with_layout(ImageLayout::TransferDst);
        batch.push_opt(
            self.tracker
                .request_access(image, &to_dst)
                .map(|b| b.with_mips(all)),
        );
        batch.push_opt(self.tracker.request_access(
            staging,
            &AccessRequest::read(info, PipelineStages::TRANSFER, AccessFlags::TRANSFER_READ),
        ));
        self.flush_barriers(info.id, batch);
        self.record(
            info.id,
            NativeCommand::CopyBufferToImage {
                src: staging,
                dst: image,
                layout: ImageLayout::TransferDst,
                regions,
            },
        );

        let post = desc.resting_layout();
        let post_dst = (desc.resting_stages(), post.access_mask());
        let mut finals = Vec::with_capacity(2);
        if generate {
            for level in 1..mip_count {
                let mut step = BarrierBatch::new();
                step.push(
                    BarrierDescriptor::image(
                        image,
                        (PipelineStages::TRANSFER, AccessFlags::TRANSFER_WRITE),
                        (PipelineStages::TRANSFER, AccessFlags::TRANSFER_READ),
                        ImageLayout::TransferDst,
                        ImageLayout::TransferSrc,
                    )
                    .with_mips(MipRange::single(level - 1)),
                );
                self.flush_barriers(info.id, step);
                self.record(
                    info.id,
                    NativeCommand::BlitImage {
                        image,
                        blit: ImageBlit {
                            src_mip: level - 1,
                            src_extent: desc.extent.mip(level - 1),
                            dst_mip: level,
                            dst_extent: desc.extent.mip(level),
                        },
                    },
                );
            }
            // The last level was only ever blitted into.
            finals.push(
                BarrierDescriptor::image(
                    image,
                    (PipelineStages::TRANSFER, AccessFlags::TRANSFER_WRITE),
                    post_dst,
                    ImageLayout::TransferDst,
                    post,
                )
                .with_mips(MipRange::single(mip_count - 1)),
            );
            finals.push(
                BarrierDescriptor::image(
                    image,
                    (PipelineStages::TRANSFER, AccessFlags::TRANSFER_READ),
                    post_dst,
                    ImageLayout::TransferSrc,
                    post,
                )
                .with_mips(MipRange::new(0, mip_count - 1)),
            );
        } else {
            finals.push(
                BarrierDescriptor::image(
                    image,
                    (PipelineStages::TRANSFER, AccessFlags::TRANSFER_WRITE),
                    post_dst,
                    ImageLayout::TransferDst,
                    post,
                )
                .with_mips(all),
            );
        }

        let mut batch = BarrierBatch::new();
        self.settle_image(info, image, finals, post, true, &mut batch);
        self.flush_barriers(info.id, batch);
    }

    /// Copy or resolve between two images and wait for it to finish.
    ///
    /// Multisampled sources are resolved; everything else is copied. Both
    /// images are returned to the layouts they were in before.
    ///
    /// # Panics
    ///
    /// Panics when the regions differ in mip count or extent, or when they
    /// overlap within the same image.
    pub fn copy_or_resolve_image(
        &mut self,
        src: ResourceId,
        dst: ResourceId,
        src_region: ImageRegion,
        dst_region: ImageRegion,
    ) -> Result<(), SyncError> {
        profile_scope!("copy_or_resolve_image");
        let (Some(src_desc), Some(dst_desc)) = (self.image_desc(src), self.image_desc(dst)) else {
            return Ok(());
        };
        let src_region = src_region.clamped(&src_desc);
        let dst_region = dst_region.clamped(&dst_desc);
        assert!(
            src_region.mips.count == dst_region.mips.count && src_region.extent == dst_region.extent,
            "Mip counts and extents must match between {src} {src_region:?} and {dst} {dst_region:?}"
        );
        assert!(
            src != dst || !src_region.overlaps(&dst_region),
            "Cannot copy {src} onto an overlapping region of itself"
        );

        let resolve = src_desc.samples > 1 && dst_desc.samples == 1;
        if !resolve && !src_desc.format.is_copy_compatible(&dst_desc.format) {
            log::error!(
                "Cannot copy {src} ({:?}) into {dst} ({:?})",
                src_desc.format,
                dst_desc.format
            );
            return Ok(());
        }

        let queue = if src_desc.format.is_depth_stencil() || dst_desc.format.is_depth_stencil() {
            QueueFunction::Graphics
        } else {
            QueueFunction::Transfer
        };
        let name = if resolve { "resolve_image" } else { "copy_image" };
        self.run_temp(name, queue, &[src, dst], |list, info| {
            list.record_image_copy(
                info,
                (src, &src_desc, src_region),
                (dst, &dst_desc, dst_region),
                resolve,
            );
        })
    }

    fn record_image_copy(
        &mut self,
        info: CmdInfo,
        (src, src_desc, src_region): (ResourceId, &ImageDesc, ImageRegion),
        (dst, dst_desc, dst_region): (ResourceId, &ImageDesc, ImageRegion),
        resolve: bool,
    ) {
        let same = src == dst;
        let settled = |desc: &ImageDesc, layout: Option<ImageLayout>| {
            layout
                .filter(|l| *l != ImageLayout::Undefined)
                .unwrap_or_else(|| desc.resting_layout())
        };
        let src_original = settled(src_desc, self.tracker.current_layout(src));
        let dst_original = settled(dst_desc, self.tracker.current_layout(dst));

        // The same image is both source and destination, so one layout serves both.
        let (src_layout, dst_layout) = if same {
            (ImageLayout::General, ImageLayout::General)
        } else {
            (ImageLayout::TransferSrc, ImageLayout::TransferDst)
        };

        let mut batch = BarrierBatch::new();
        if same {
            let req = AccessRequest::write(
                info,
                PipelineStages::TRANSFER,
                AccessFlags::TRANSFER_READ | AccessFlags::TRANSFER_WRITE,
            )
            .with_layout(ImageLayout::General);
            batch.push_opt(
                self.tracker
                    .request_access(src, &req)
                    .map(|b| b.with_mips(MipRange::new(0, src_desc.mip_levels))),
            );
        } else {
            let read = AccessRequest {
                intent: read_intent(src_desc.caps),
                ..AccessRequest::read(info, PipelineStages::TRANSFER, AccessFlags::TRANSFER_READ)
            }
            .with_layout(src_layout);
            batch.push_opt(
                self.tracker
                    .request_access(src, &read)
                    .map(|b| b.with_mips(MipRange::new(0, src_desc.mip_levels))),
            );
            let write =
                AccessRequest::write(info, PipelineStages::TRANSFER, AccessFlags::TRANSFER_WRITE)
                    .with_layout(dst_layout);
            batch.push_opt(
                self.tracker
                    .request_access(dst, &write)
                    .map(|b| b.with_mips(MipRange::new(0, dst_desc.mip_levels))),
            );
        }
        self.flush_barriers(info.id, batch);

        let regions: Vec<ImageCopy> = (0..src_region.mips.count)
            .map(|level| src_region.region_copy(&dst_region, level))
            .collect();
        let command = if resolve {
            NativeCommand::ResolveImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
            }
        } else {
            NativeCommand::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
            }
        };
        self.record(info.id, command);

        let mut batch = BarrierBatch::new();
        if same {
            let barrier = BarrierDescriptor::image(
                src,
                (
                    PipelineStages::TRANSFER,
                    AccessFlags::TRANSFER_READ | AccessFlags::TRANSFER_WRITE,
                ),
                (src_desc.resting_stages(), src_original.access_mask()),
                ImageLayout::General,
                src_original,
            )
            .with_mips(MipRange::new(0, src_desc.mip_levels));
            self.settle_image(info, src, vec![barrier], src_original, true, &mut batch);
        } else {
            let back_src = BarrierDescriptor::image(
                src,
                (PipelineStages::TRANSFER, AccessFlags::TRANSFER_READ),
                (src_desc.resting_stages(), src_original.access_mask()),
                src_layout,
                src_original,
            )
            .with_mips(MipRange::new(0, src_desc.mip_levels));
            let back_dst = BarrierDescriptor::image(
                dst,
                (PipelineStages::TRANSFER, AccessFlags::TRANSFER_WRITE),
                (dst_desc.resting_stages(), dst_original.access_mask()),
                dst_layout,
                dst_original,
            )
            .with_mips(MipRange::new(0, dst_desc.mip_levels));
            self.settle_image(info, src, vec![back_src], src_original, true, &mut batch);
            self.settle_image(info, dst, vec![back_dst], dst_original, true, &mut batch);
        }
        self.flush_barriers(info.id, batch);
    }

    /// Clear mip ranges of a color image and wait for it to finish.
    ///
    /// An empty `ranges` clears every level.
    pub fn clear_image(
        &mut self,
        image: ResourceId,
        color: [f32; 4],
        ranges: &[MipRange],
    ) -> Result<(), SyncError> {
        let Some(desc) = self.image_desc(image) else {
            return Ok(());
        };
        if desc.format.is_depth_stencil() {
            log::error!("Depth image {image} cannot be cleared with a color");
            return Ok(());
        }
        self.run_temp("clear_image", QueueFunction::Graphics, &[image], |list, info| {
            list.record_clear(info, image, &desc, ClearKind::Color(color), ranges, true);
        })
    }

    /// Clear mip ranges of a depth image and wait for it to finish.
    pub fn clear_depth(
        &mut self,
        image: ResourceId,
        depth: f32,
        stencil: u32,
        ranges: &[MipRange],
    ) -> Result<(), SyncError> {
        let Some(desc) = self.image_desc(image) else {
            return Ok(());
        };
        if !desc.format.is_depth_stencil() {
            log::error!("Color image {image} cannot be cleared as depth");
            return Ok(());
        }
        self.run_temp("clear_depth", QueueFunction::Graphics, &[image], |list, info| {
            list.record_clear(info, image, &desc, ClearKind::Depth { depth, stencil }, ranges, true);
        })
    }

    /// Record a color clear into `cmd`.
    pub fn cmd_clear_image(
        &mut self,
        cmd: CommandBufferId,
        image: ResourceId,
        color: [f32; 4],
        ranges: &[MipRange],
    ) {
        let Some(info) = self.recording(cmd) else {
            return;
        };
        let Some(desc) = self.image_desc(image) else {
            return;
        };
        if desc.format.is_depth_stencil() {
            log::error!("Depth image {image} cannot be cleared with a color");
            return;
        }
        if self.in_render_pass(cmd) {
            log::error!("Clear of {image} recorded inside a render pass of {cmd}, skipping");
            return;
        }
        self.record_clear(info, image, &desc, ClearKind::Color(color), ranges, false);
    }

    /// Record a depth clear into `cmd`.
    pub fn cmd_clear_depth(
        &mut self,
        cmd: CommandBufferId,
        image: ResourceId,
        depth: f32,
        stencil: u32,
        ranges: &[MipRange],
    ) {
        let Some(info) = self.recording(cmd) else {
            return;
        };
        let Some(desc) = self.image_desc(image) else {
            return;
        };
        if !desc.format.is_depth_stencil() {
            log::error!("Color image {image} cannot be cleared as depth");
            return;
        }
        if self.in_render_pass(cmd) {
            log::error!("Clear of {image} recorded inside a render pass of {cmd}, skipping");
            return;
        }
        self.record_clear(info, image, &desc, ClearKind::Depth { depth, stencil }, ranges, false);
    }

    fn record_clear(
        &mut self,
        info: CmdInfo,
        image: ResourceId,
        desc: &ImageDesc,
        kind: ClearKind,
        ranges: &[MipRange],
        release: bool,
    ) {
        let all = MipRange::new(0, desc.mip_levels);
        let req = AccessRequest::write(info, PipelineStages::TRANSFER, AccessFlags::TRANSFER_WRITE)
            .with_layout(ImageLayout::TransferDst);
        let mut batch = BarrierBatch::new();
        batch.push_opt(
            self.tracker
                .request_access(image, &req)
                .map(|b| b.with_mips(all)),
        );
        self.flush_barriers(info.id, batch);

        let ranges = if ranges.is_empty() { std::slice::from_ref(&all) } else { ranges };
        for mips in ranges {
            let command = match kind {
                ClearKind::Color(color) => NativeCommand::ClearColorImage {
                    image,
                    layout: ImageLayout::TransferDst,
                    color,
                    mips: *mips,
                },
                ClearKind::Depth { depth, stencil } => NativeCommand::ClearDepthStencilImage {
                    image,
                    layout: ImageLayout::TransferDst,
                    depth,
                    stencil,
                    mips: *mips,
                },
            };
            self.record(info.id, command);
        }

        let resting = desc.resting_layout();
        let back = BarrierDescriptor::image(
            image,
            (PipelineStages::TRANSFER, AccessFlags::TRANSFER_WRITE),
            (desc.resting_stages(), resting.access_mask()),
            ImageLayout::TransferDst,
            resting,
        )
        .with_mips(all);
        let mut batch = BarrierBatch::new();
        self.settle_image(info, image, vec![back], resting, release, &mut batch);
        self.flush_barriers(info.id, batch);
    }

    /// Move a freshly created image from `Undefined` into its resting layout.
    pub fn setup_initial_layout(&mut self, image: ResourceId) -> Result<(), SyncError> {
        self.setup_initial_layouts(&[image])
    }

    /// Batched [`Self::setup_initial_layout`], one grouped barrier for all images.
    pub fn setup_initial_layouts(&mut self, images: &[ResourceId]) -> Result<(), SyncError> {
        let descs: Vec<(ResourceId, ImageDesc)> = images
            .iter()
            .filter_map(|id| self.image_desc(*id).map(|desc| (*id, desc)))
            .collect();
        if descs.is_empty() {
            return Ok(());
        }
        let touched: Vec<ResourceId> = descs.iter().map(|(id, _)| *id).collect();
        self.run_temp("initial_layout", QueueFunction::Graphics, &touched, |list, info| {
            let mut batch = BarrierBatch::new();
            for (image, desc) in &descs {
                let resting = desc.resting_layout();
                batch.push(
                    BarrierDescriptor::image(
                        *image,
                        (PipelineStages::TOP_OF_PIPE, AccessFlags::empty()),
                        (desc.resting_stages(), resting.access_mask()),
                        ImageLayout::Undefined,
                        resting,
                    )
                    .with_mips(MipRange::new(0, desc.mip_levels)),
                );
                list.tracker.set_layout(*image, resting);
            }
            list.flush_barriers(info.id, batch);
        })
    }

    /// Bring images out of whatever layout they were last used in.
    ///
    /// Attachments go to `ShaderReadOnly`, the render pass handles their
    /// attachment layouts. Everything else goes to its resting layout.
    pub fn transition_layouts(&mut self, cmd: CommandBufferId, images: &[ResourceId]) {
        let Some(info) = self.recording(cmd) else {
            return;
        };
        let side_queue = self.is_side_queue(info.queue());
        let mut batch = BarrierBatch::new();
        for &image in images {
            let Some(desc) = self.image_desc(image) else {
                continue;
            };
            let target = if desc.caps.contains(ResourceCaps::ATTACHMENT) {
                ImageLayout::ShaderReadOnly
            } else {
                desc.resting_layout()
            };
            let (stage, access) = if side_queue {
                (
                    PipelineStages::TRANSFER,
                    AccessFlags::TRANSFER_READ | AccessFlags::TRANSFER_WRITE,
                )
            } else {
                (
                    PipelineStages::ALL_GRAPHICS | PipelineStages::COMPUTE_SHADER,
                    target.access_mask(),
                )
            };
            let req = AccessRequest::write(info, stage, access).with_layout(target);
            batch.push_opt(
                self.tracker
                    .image_to_general_layout(image, &req)
                    .map(|b| b.with_mips(MipRange::new(0, desc.mip_levels))),
            );
        }
        self.flush_barriers(cmd, batch);
    }

    // ------------------------------------------------------------------
    // Explicit barriers
    // ------------------------------------------------------------------

    /// Barrier every resource bound in `sets` for its shader access.
    ///
    /// # Panics
    ///
    /// Panics if `cmd` is inside a render pass.
    pub fn barrier_resources(&mut self, cmd: CommandBufferId, sets: &[DescriptorSet]) {
        profile_scope!("barrier_resources");
        let Some(info) = self.recording(cmd) else {
            return;
        };
        assert!(
            !self.in_render_pass(cmd),
            "{cmd} is inside a render pass, descriptor resources must be barriered before it"
        );
        let mut batch = BarrierBatch::new();
        for set in sets {
            for binding in &set.bindings {
                let Some(resource) = self.resources.get(binding.resource) else {
                    log::error!(
                        "Descriptor set {:?} binds stale resource {}",
                        set.handle,
                        binding.resource
                    );
                    continue;
                };
                let caps = resource.caps();
                let image_mips = resource.as_image().map(|image| image.desc.mip_levels);

                let intent = match binding.access {
                    BindingAccess::StorageWrite => AccessIntent::Write,
                    BindingAccess::StorageRead => AccessIntent::ReadFromWrite,
                    BindingAccess::Uniform | BindingAccess::Sampled => read_intent(caps),
                };
                let mut req = AccessRequest {
                    intent,
                    ..AccessRequest::read(info, binding.stages, binding.access.access_flags())
                };
                if image_mips.is_some() {
                    req = req.with_layout(binding.access.image_layout());
                }
                let barrier = self.tracker.request_access(binding.resource, &req);
                batch.push_opt(match image_mips {
                    Some(mips) => barrier.map(|b| b.with_mips(MipRange::new(0, mips))),
                    None => barrier,
                });
            }
        }
        self.flush_barriers(cmd, batch);
    }

    /// Barrier vertex buffers for vertex input.
    pub fn barrier_vertices(&mut self, cmd: CommandBufferId, buffers: &[ResourceId]) {
        self.barrier_buffers(
            cmd,
            buffers,
            PipelineStages::VERTEX_INPUT,
            AccessFlags::VERTEX_ATTRIBUTE_READ,
        );
    }

    /// Barrier index buffers for vertex input.
    pub fn barrier_indices(&mut self, cmd: CommandBufferId, buffers: &[ResourceId]) {
        self.barrier_buffers(
            cmd,
            buffers,
            PipelineStages::VERTEX_INPUT,
            AccessFlags::INDEX_READ,
        );
    }

    /// Barrier indirect argument buffers for draw and dispatch indirect.
    pub fn barrier_indirect_draws(&mut self, cmd: CommandBufferId, buffers: &[ResourceId]) {
        self.barrier_buffers(
            cmd,
            buffers,
            PipelineStages::DRAW_INDIRECT,
            AccessFlags::INDIRECT_COMMAND_READ,
        );
    }

    fn barrier_buffers(
        &mut self,
        cmd: CommandBufferId,
        buffers: &[ResourceId],
        stage: PipelineStages,
        access: AccessFlags,
    ) {
        let Some(info) = self.recording(cmd) else {
            return;
        };
        let mut batch = BarrierBatch::new();
        for &buffer in buffers {
            let Some(caps) = self
                .resources
                .get(buffer)
                .filter(|r| r.as_buffer().is_some())
                .map(Resource::caps)
            else {
                log::error!("{buffer} is not a live buffer");
                continue;
            };
            let req = AccessRequest {
                intent: read_intent(caps),
                ..AccessRequest::read(info, stage, access)
            };
            batch.push_opt(self.tracker.request_access(buffer, &req));
        }
        self.flush_barriers(cmd, batch);
    }

    /// Record the release half of every pending queue ownership transfer on
    /// the queue of `cmd`.
    ///
    /// Resources go to the family of `target` unless `overrides` names
    /// another queue for them. Releases whose acquire was already recorded
    /// keep the family that acquire named.
    pub fn release_queue_resources(
        &mut self,
        cmd: CommandBufferId,
        target: QueueFunction,
        overrides: &HashMap<ResourceId, QueueFunction>,
    ) {
        let Some(info) = self.recording(cmd) else {
            return;
        };
        let batch = self.release_from_queue(info, target, overrides, None);
        self.flush_barriers(cmd, batch);
    }

    fn release_from_queue(
        &mut self,
        info: CmdInfo,
        target: QueueFunction,
        overrides: &HashMap<ResourceId, QueueFunction>,
        only: Option<&[ResourceId]>,
    ) -> BarrierBatch {
        let families = self.families();
        let queue = info.queue();
        let own = info.family();
        let mut batch = BarrierBatch::new();

        for (resource, release) in self.tracker.get_releases_from_queue(queue) {
            if !self.resources.is_live(resource) {
                continue;
            }
            if only.is_some_and(|only| !only.contains(&resource)) {
                self.tracker
                    .add_resource_to_q_transfer(queue, resource, release, true);
                continue;
            }
            let dst_family = match release.dst_family {
                Some(family) if release.acquired => family,
                _ => families.family(overrides.get(&resource).copied().unwrap_or(target)),
            };
            if dst_family == own {
                self.tracker
                    .add_resource_to_q_transfer(queue, resource, release, true);
                continue;
            }

            let src = (release.stages, release.access);
            let dst = (PipelineStages::empty(), AccessFlags::empty());
            let barrier = match self.resources.get(resource).and_then(Resource::as_image) {
                Some(image) => BarrierDescriptor::image(
                    resource,
                    src,
                    dst,
                    release.src_layout.unwrap_or(ImageLayout::Undefined),
                    release
                        .dst_layout
                        .unwrap_or_else(|| image.desc.resting_layout()),
                )
                .with_mips(MipRange::new(0, image.desc.mip_levels)),
                None => BarrierDescriptor::buffer(resource, src, dst),
            }
            .with_queue_families(own, dst_family);

            // Acquires recorded earlier must run after this release.
            for &(acquirer, stages) in &release.acquirers {
                self.tracker.add_dep(acquirer, info.id, stages);
            }
            for user in self.tracker.resource_dependencies(resource) {
                if user != info.id && self.registry.get(user).is_some_and(|r| r.queue() == queue) {
                    self.tracker.add_dep(info.id, user, release.stages);
                }
            }
            if !release.acquired {
                self.tracker.mark_released(
                    resource,
                    info.id,
                    info.owner,
                    dst_family,
                    barrier.old_layout,
                    barrier.new_layout,
                );
            }
            log::debug!("Releasing {resource} from family {own} to {dst_family}");
            batch.push(barrier);
        }
        batch
    }

    // ------------------------------------------------------------------
    // Render and compute
    // ------------------------------------------------------------------

    /// Begin a render pass.
    ///
    /// Attachments whose tracked layout differs from the layout the pass
    /// loads them in are transitioned first. Attachment writes are recorded
    /// in the tracker without barriers.
    pub fn begin_render_pass(&mut self, cmd: CommandBufferId, begin: RenderPassBegin) {
        let Some(info) = self.recording(cmd) else {
            return;
        };
        if begin.extent.width == 0 || begin.extent.height == 0 {
            log::error!("Render pass in {cmd} has an empty render area");
            return;
        }

        let mut batch = BarrierBatch::new();
        for attachment in &begin.attachments {
            let Some(desc) = self.image_desc(attachment.image) else {
                continue;
            };
            let current = self.tracker.current_layout(attachment.image);
            if attachment.initial_layout == ImageLayout::Undefined
                || current.is_none_or(|l| l == attachment.initial_layout)
            {
                continue;
            }
            let (stage, access) = attachment_access(attachment.is_depth);
            let req = AccessRequest::write(info, stage, access).with_layout(attachment.initial_layout);
            batch.push_opt(
                self.tracker
                    .request_access(attachment.image, &req)
                    .map(|b| b.with_mips(MipRange::new(0, desc.mip_levels))),
            );
        }
        self.flush_barriers(cmd, batch);

        for attachment in &begin.attachments {
            if !self.resources.is_live(attachment.image) {
                continue;
            }
            let (stage, access) = attachment_access(attachment.is_depth);
            self.tracker.color_attachment_write(
                attachment.image,
                info,
                stage,
                access,
                attachment.final_layout,
            );
        }
        if begin.presents.is_some() {
            self.registry.mark_writes_swapchain(cmd);
        }
        self.record(cmd, NativeCommand::BeginRenderPass(begin));
        self.registry.begin_render_pass(cmd);
    }

    pub fn end_render_pass(&mut self, cmd: CommandBufferId) {
        if self.recording(cmd).is_none() {
            return;
        }
        if !self.in_render_pass(cmd) {
            log::error!("{cmd} has no render pass to end");
            return;
        }
        self.record(cmd, NativeCommand::EndRenderPass);
        self.registry.end_render_pass(cmd);
    }

    pub fn bind_graphics_pipeline(&mut self, cmd: CommandBufferId, pipeline: RawHandle) {
        if self.recording(cmd).is_some() {
            self.record(
                cmd,
                NativeCommand::BindPipeline {
                    bind_point: PipelineBindPoint::Graphics,
                    pipeline,
                },
            );
        }
    }

    pub fn bind_compute_pipeline(&mut self, cmd: CommandBufferId, pipeline: RawHandle) {
        if self.recording(cmd).is_some() {
            self.record(
                cmd,
                NativeCommand::BindPipeline {
                    bind_point: PipelineBindPoint::Compute,
                    pipeline,
                },
            );
        }
    }

    /// Bind descriptor sets, barriering their resources first when outside
    /// a render pass.
    ///
    /// Inside a render pass the resources must already have been barriered
    /// with [`Self::barrier_resources`].
    pub fn bind_descriptor_sets(
        &mut self,
        cmd: CommandBufferId,
        bind_point: PipelineBindPoint,
        layout: RawHandle,
        first_set: u32,
        sets: &[DescriptorSet],
    ) {
        if self.recording(cmd).is_none() {
            return;
        }
        if !self.in_render_pass(cmd) {
            self.barrier_resources(cmd, sets);
        }
        self.record(
            cmd,
            NativeCommand::BindDescriptorSets {
                bind_point,
                layout,
                first_set,
                sets: sets.iter().map(|s| s.handle).collect(),
            },
        );
    }

    pub fn push_constants<T: Pod>(
        &mut self,
        cmd: CommandBufferId,
        layout: RawHandle,
        stages: ShaderStages,
        offset: u32,
        data: &T,
    ) {
        if self.recording(cmd).is_some() {
            self.record(
                cmd,
                NativeCommand::PushConstants {
                    layout,
                    stages,
                    offset,
                    data: bytemuck::bytes_of(data).to_vec(),
                },
            );
        }
    }

    pub fn dispatch(&mut self, cmd: CommandBufferId, x: u32, y: u32, z: u32) {
        if self.recording(cmd).is_none() || !self.outside_render_pass(cmd, "dispatch") {
            return;
        }
        self.record(cmd, NativeCommand::Dispatch { x, y, z });
    }

    /// Dispatch with arguments read from `buffer`, barriering it first.
    pub fn dispatch_indirect(&mut self, cmd: CommandBufferId, buffer: ResourceId, offset: u64) {
        if self.recording(cmd).is_none() || !self.outside_render_pass(cmd, "dispatch_indirect") {
            return;
        }
        self.barrier_indirect_draws(cmd, &[buffer]);
        self.record(cmd, NativeCommand::DispatchIndirect { buffer, offset });
    }

    pub fn draw_vertices(
        &mut self,
        cmd: CommandBufferId,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        if self.recording(cmd).is_none() || !self.inside_render_pass(cmd, "draw_vertices") {
            return;
        }
        self.record(
            cmd,
            NativeCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            },
        );
    }

    pub fn draw_indexed(
        &mut self,
        cmd: CommandBufferId,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        if self.recording(cmd).is_none() || !self.inside_render_pass(cmd, "draw_indexed") {
            return;
        }
        self.record(
            cmd,
            NativeCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            },
        );
    }

    /// Indexed indirect draws, split into native calls of at most
    /// `max_indirect_draw_count` draws each.
    ///
    /// `buffer` must have been barriered with [`Self::barrier_indirect_draws`]
    /// before the render pass began.
    pub fn draw_indexed_indirect(
        &mut self,
        cmd: CommandBufferId,
        buffer: ResourceId,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        if self.recording(cmd).is_none() || !self.inside_render_pass(cmd, "draw_indexed_indirect")
        {
            return;
        }
        for (offset, draw_count) in self.indirect_chunks(offset, draw_count, stride) {
            self.record(
                cmd,
                NativeCommand::DrawIndexedIndirect {
                    buffer,
                    offset,
                    draw_count,
                    stride,
                },
            );
        }
    }

    /// Non-indexed counterpart of [`Self::draw_indexed_indirect`].
    pub fn draw_indirect(
        &mut self,
        cmd: CommandBufferId,
        buffer: ResourceId,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        if self.recording(cmd).is_none() || !self.inside_render_pass(cmd, "draw_indirect") {
            return;
        }
        for (offset, draw_count) in self.indirect_chunks(offset, draw_count, stride) {
            self.record(
                cmd,
                NativeCommand::DrawIndirect {
                    buffer,
                    offset,
                    draw_count,
                    stride,
                },
            );
        }
    }

    fn indirect_chunks(&self, offset: u64, draw_count: u32, stride: u32) -> Vec<(u64, u32)> {
        let max = self.config.max_indirect_draw_count.max(1);
        let mut chunks = Vec::with_capacity(draw_count.div_ceil(max) as usize);
        let mut drawn = 0;
        while drawn < draw_count {
            let count = max.min(draw_count - drawn);
            chunks.push((offset + u64::from(drawn) * u64::from(stride), count));
            drawn += count;
        }
        chunks
    }

    pub fn bind_vertex_buffers(
        &mut self,
        cmd: CommandBufferId,
        first_binding: u32,
        buffers: &[(ResourceId, u64)],
    ) {
        if self.recording(cmd).is_some() {
            self.record(
                cmd,
                NativeCommand::BindVertexBuffers {
                    first_binding,
                    buffers: buffers.to_vec(),
                },
            );
        }
    }

    pub fn bind_index_buffer(
        &mut self,
        cmd: CommandBufferId,
        buffer: ResourceId,
        offset: u64,
        index_type: IndexType,
    ) {
        if self.recording(cmd).is_some() {
            self.record(
                cmd,
                NativeCommand::BindIndexBuffer {
                    buffer,
                    offset,
                    index_type,
                },
            );
        }
    }

    pub fn set_viewport(&mut self, cmd: CommandBufferId, viewport: Viewport) {
        if self.recording(cmd).is_some() {
            self.record(cmd, NativeCommand::SetViewport(viewport));
        }
    }

    pub fn set_scissor(&mut self, cmd: CommandBufferId, scissor: ScissorRect) {
        if self.recording(cmd).is_some() {
            self.record(cmd, NativeCommand::SetScissor(scissor));
        }
    }

    pub fn set_line_width(&mut self, cmd: CommandBufferId, width: f32) {
        if self.recording(cmd).is_some() {
            self.record(cmd, NativeCommand::SetLineWidth(width));
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn families(&self) -> QueueFamilies {
        self.config.effective_queue_families()
    }

    /// A non-graphics queue running on its own family.
    fn is_side_queue(&self, queue: QueueFunction) -> bool {
        queue != QueueFunction::Graphics && self.families().is_dedicated(queue)
    }

    /// Tracker identity of `cmd`.
    ///
    /// # Panics
    ///
    /// Panics if `cmd` is known but not recording.
    fn recording(&self, cmd: CommandBufferId) -> Option<CmdInfo> {
        let Some(record) = self.registry.get(cmd) else {
            log::error!("Recording into unknown command buffer {cmd}");
            return None;
        };
        assert_eq!(
            record.state(),
            CommandBufferState::Recording,
            "{} is not recording",
            record.name()
        );
        self.registry.cmd_info(cmd)
    }

    fn in_render_pass(&self, cmd: CommandBufferId) -> bool {
        self.registry
            .get(cmd)
            .is_some_and(|r| r.is_in_render_pass())
    }

    fn inside_render_pass(&self, cmd: CommandBufferId, what: &str) -> bool {
        let inside = self.in_render_pass(cmd);
        if !inside {
            log::error!("{what} needs an open render pass in {cmd}");
        }
        inside
    }

    fn outside_render_pass(&self, cmd: CommandBufferId, what: &str) -> bool {
        let inside = self.in_render_pass(cmd);
        if inside {
            log::error!("{what} cannot be recorded inside the render pass of {cmd}");
        }
        !inside
    }

    fn record(&self, cmd: CommandBufferId, command: NativeCommand) {
        if let Some(record) = self.registry.get(cmd) {
            self.backend.record(record.gpu(), &command, &*self.resources);
        }
    }

    /// Record `batch` as one pipeline barrier per stage pair.
    fn flush_barriers(&self, cmd: CommandBufferId, batch: BarrierBatch) {
        if batch.is_empty() {
            return;
        }
        let Some(record) = self.registry.get(cmd) else {
            return;
        };
        assert!(
            !record.is_in_render_pass(),
            "Barriers requested inside the render pass of {}",
            record.name()
        );
        log::debug!(
            "{}: {} barriers in {} groups",
            record.name(),
            batch.len(),
            batch.group_count()
        );
        for command in batch.into_commands() {
            self.backend.record(record.gpu(), &command, &*self.resources);
        }
    }

    /// Finish manual transitions of `image` into `layout`.
    ///
    /// On a side queue with `release` set the transitions double as the
    /// release to the graphics family, which the next graphics access
    /// acquires.
    fn settle_image(
        &mut self,
        info: CmdInfo,
        image: ResourceId,
        barriers: Vec<BarrierDescriptor>,
        layout: ImageLayout,
        release: bool,
        batch: &mut BarrierBatch,
    ) {
        if !self.is_side_queue(info.queue()) {
            batch.extend(barriers);
            self.tracker.set_layout(image, layout);
            return;
        }

        if release {
            let graphics = self.families().family(QueueFunction::Graphics);
            let old = barriers.first().and_then(|b| b.old_layout);
            batch.extend(barriers.into_iter().map(|b| {
                BarrierDescriptor {
                    dst_stage: PipelineStages::empty(),
                    dst_access: AccessFlags::empty(),
                    ..b
                }
                .with_queue_families(info.family(), graphics)
            }));
            self.tracker
                .mark_released(image, info.id, info.owner, graphics, old, Some(layout));
        } else {
            // Shader stages do not exist on this queue.
            batch.extend(barriers.into_iter().map(|b| BarrierDescriptor {
                dst_stage: PipelineStages::ALL_COMMANDS,
                dst_access: AccessFlags::MEMORY_READ,
                ..b
            }));
            self.tracker.set_layout(image, layout);
        }
    }

    /// Release what `cmd` acquires from other queues, waiting for each release.
    fn release_for(&mut self, cmd: CommandBufferId, queue: QueueFunction) -> Result<(), SyncError> {
        let mut owed: BTreeMap<QueueFunction, Vec<ResourceId>> = BTreeMap::new();
        for (owner, resource) in self.tracker.unreleased_acquires(cmd) {
            owed.entry(owner).or_default().push(resource);
        }
        for (owner, resources) in owed {
            log::debug!("Releasing {resources:?} from the {owner} queue for {cmd}");
            self.run_temp("queue_release", owner, &[], |list, info| {
                let batch =
                    list.release_from_queue(info, queue, &HashMap::new(), Some(resources.as_slice()));
                list.flush_barriers(info.id, batch);
            })?;
        }
        Ok(())
    }

    /// Record `f` into a temporary buffer on `queue`, submit and wait.
    fn run_temp(
        &mut self,
        name: &str,
        queue: QueueFunction,
        touched: &[ResourceId],
        f: impl FnOnce(&mut Self, CmdInfo),
    ) -> Result<(), SyncError> {
        let cmd = self.start_cmd(name, queue, CommandBufferUsage::Temporary)?;
        let info = self
            .registry
            .cmd_info(cmd)
            .ok_or_else(|| SyncError::Internal(format!("temporary {name} vanished")))?;

        f(self, info);
        if let Err(err) = self.release_for(cmd, queue) {
            log::error!("Temporary command buffer {name} has no release to acquire from: {err}");
            if let Err(discard) = self.discard_cmd(cmd) {
                log::error!("Could not discard {name}: {discard}");
            }
            return Err(err);
        }
        if self.is_side_queue(queue) {
            let batch = self.release_from_queue(
                info,
                QueueFunction::Graphics,
                &HashMap::new(),
                Some(touched),
            );
            self.flush_barriers(cmd, batch);
        }

        let mut submission = self.submission();
        let result = submission
            .end_cmd(cmd)
            .and_then(|()| submission.submit_wait_cmd(QueuePriority::SuperHigh, cmd));
        match result {
            Ok(()) => {
                submission.free_cmd(cmd);
                Ok(())
            }
            Err(err) => {
                log::error!("Temporary command buffer {name} failed: {err}");
                if let Err(discard) = submission.discard_cmd(cmd) {
                    log::error!("Could not discard {name}: {discard}");
                }
                Err(err)
            }
        }
    }

    fn validate_buffer_copy(
        &self,
        src: ResourceId,
        dst: ResourceId,
        regions: &[BufferCopy],
    ) -> bool {
        let (Some(src_desc), Some(dst_desc)) = (self.buffer_desc(src), self.buffer_desc(dst)) else {
            return false;
        };
        if !src_desc.caps.contains(ResourceCaps::TRANSFER_SRC) {
            log::error!("{src} cannot be a copy source");
            return false;
        }
        if !dst_desc.caps.contains(ResourceCaps::TRANSFER_DST) {
            log::error!("{dst} cannot be a copy destination");
            return false;
        }
        for region in regions {
            assert!(
                src != dst || !region.overlaps_self(),
                "Overlapping copy {region:?} within {src}"
            );
            let size = region.size as usize;
            if !fits(region.src_offset, size, src_desc.size)
                || !fits(region.dst_offset, size, dst_desc.size)
            {
                log::error!("Copy {region:?} from {src} to {dst} is out of bounds");
                return false;
            }
        }
        !regions.is_empty()
    }

    fn record_buffer_copy(
        &mut self,
        info: CmdInfo,
        src: ResourceId,
        dst: ResourceId,
        regions: Vec<BufferCopy>,
    ) {
        let mut batch = BarrierBatch::new();
        if src == dst {
            let req = AccessRequest::write(
                info,
                PipelineStages::TRANSFER,
                AccessFlags::TRANSFER_READ | AccessFlags::TRANSFER_WRITE,
            );
            batch.push_opt(self.tracker.request_access(dst, &req));
        } else {
            let caps = self
                .resources
                .get(src)
                .map_or(ResourceCaps::empty(), Resource::caps);
            let read = AccessRequest {
                intent: read_intent(caps),
                ..AccessRequest::read(info, PipelineStages::TRANSFER, AccessFlags::TRANSFER_READ)
            };
            batch.push_opt(self.tracker.request_access(src, &read));
            let write =
                AccessRequest::write(info, PipelineStages::TRANSFER, AccessFlags::TRANSFER_WRITE);
            batch.push_opt(self.tracker.request_access(dst, &write));
        }
        if self.is_side_queue(info.queue()) {
            self.tracker.add_resource_to_q_transfer(
                info.queue(),
                dst,
                QueuePendingRelease::buffer(PipelineStages::TRANSFER, AccessFlags::TRANSFER_WRITE),
                false,
            );
        }
        self.flush_barriers(info.id, batch);
        self.record(info.id, NativeCommand::CopyBuffer { src, dst, regions });
    }

    fn create_staging(&mut self, data: &[u8]) -> Result<ResourceId, SyncError> {
        let desc = BufferDesc::staging(data.len() as u64);
        let gpu = self.backend.create_buffer(&desc)?;
        self.backend.write_buffer(&gpu, 0, data)?;
        Ok(self.resources.insert(Resource::from_buffer(desc, gpu)))
    }

    fn destroy_now(&mut self, resource: ResourceId) {
        self.tracker.clear_resource(resource);
        if let Some(resource) = self.resources.remove(resource) {
            resource.destroy(self.backend);
        }
    }

    fn image_desc(&self, id: ResourceId) -> Option<ImageDesc> {
        let desc = self
            .resources
            .get(id)
            .and_then(Resource::as_image)
            .map(|image| image.desc.clone());
        if desc.is_none() {
            log::error!("{id} is not a live image");
        }
        desc
    }

    fn buffer_desc(&self, id: ResourceId) -> Option<BufferDesc> {
        let desc = self
            .resources
            .get(id)
            .and_then(Resource::as_buffer)
            .map(|buffer| buffer.desc.clone());
        if desc.is_none() {
            log::error!("{id} is not a live buffer");
        }
        desc
    }
}

fn fits(offset: u64, len: usize, size: u64) -> bool {
    offset
        .checked_add(len as u64)
        .is_some_and(|end| end <= size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageFormat;

    #[test]
    fn test_region_overlap() {
        let desc = ImageDesc::new_2d(64, 64, ImageFormat::Rgba8Unorm);
        let left = ImageRegion::whole(&desc).with_extent(Extent3d::new_2d(32, 64));
        let right = left.with_offset(Offset3d::new(32, 0, 0));
        assert!(!left.overlaps(&right));
        assert!(left.overlaps(&left.with_offset(Offset3d::new(16, 0, 0))));
    }

    #[test]
    fn test_region_overlap_across_shifted_mips() {
        let desc = ImageDesc::new_2d(16, 16, ImageFormat::Rgba8Unorm).with_mip_levels(3);
        let whole = ImageRegion::whole(&desc);

        // Mip 1 would be read by the first range and written by the second.
        let src = whole.with_mips(MipRange::new(0, 2));
        let dst = whole.with_mips(MipRange::new(1, 2));
        assert!(src.overlaps(&dst));
        assert!(dst.overlaps(&src));

        let base = whole.with_mips(MipRange::single(0));
        let next = whole.with_mips(MipRange::single(1));
        assert!(!base.overlaps(&next));

        // Shares mip 1, but the boxes are apart there.
        let corner = whole
            .with_mips(MipRange::new(0, 2))
            .with_extent(Extent3d::new_2d(8, 8));
        let far = whole
            .with_mips(MipRange::single(1))
            .with_offset(Offset3d::new(4, 4, 0))
            .with_extent(Extent3d::new_2d(4, 4));
        assert!(!corner.overlaps(&far));
    }

    #[test]
    fn test_region_overlap_with_huge_layers() {
        let desc = ImageDesc::new_2d(16, 16, ImageFormat::Rgba8Unorm);
        let high = ImageRegion {
            base_layer: u32::MAX - 1,
            layer_count: u32::MAX,
            ..ImageRegion::whole(&desc)
        };
        let low = ImageRegion::whole(&desc);
        assert!(!high.overlaps(&low));
        assert!(high.overlaps(&high));
        assert_eq!(MipRange::new(u32::MAX, 2).end(), u32::MAX);
    }

    #[test]
    fn test_region_clamped_to_image() {
        let desc = ImageDesc::new_2d(64, 64, ImageFormat::Rgba8Unorm).with_mip_levels(3);
        let region = ImageRegion::whole(&desc)
            .with_mips(MipRange::new(1, 10))
            .clamped(&desc);
        assert_eq!(region.mips, MipRange::new(1, 2));
        assert_eq!(region.layer_count, 1);
    }

    #[test]
    fn test_region_copy_scales_per_level() {
        let desc = ImageDesc::new_2d(64, 64, ImageFormat::Rgba8Unorm).with_mip_levels(2);
        let src = ImageRegion::whole(&desc).with_offset(Offset3d::new(8, 8, 0));
        let dst = ImageRegion::whole(&desc);
        let copy = src.region_copy(&dst, 1);
        assert_eq!(copy.src_mip, 1);
        assert_eq!(copy.src_offset, Offset3d::new(4, 4, 0));
        assert_eq!(copy.extent, Extent3d::new_2d(32, 32));
    }

    #[test]
    fn test_fits() {
        assert!(fits(0, 16, 16));
        assert!(!fits(8, 16, 16));
        assert!(!fits(u64::MAX, 1, 16));
    }

    #[test]
    fn test_read_intent_follows_caps() {
        assert_eq!(read_intent(ResourceCaps::READ), AccessIntent::Read);
        assert_eq!(
            read_intent(ResourceCaps::READ | ResourceCaps::WRITE),
            AccessIntent::ReadFromWrite
        );
    }
}
