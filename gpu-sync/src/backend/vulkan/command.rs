//! Command pools and native command encoding.

use std::collections::BTreeMap;

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;

use crate::backend::{GpuBuffer, GpuImage};
use crate::barriers::BarrierDescriptor;
use crate::encoder::{ImageCopy, NativeCommand};
use crate::error::SyncError;
use crate::handle::ResourceId;
use crate::resources::ResourceArena;
use crate::types::{ImageLayout, PipelineStages, RawHandle};

use super::conversion;

/// One resettable command pool per queue family.
///
/// Pools are externally synchronized, so each sits behind its own lock.
#[derive(Default)]
pub struct CommandPools {
    pools: BTreeMap<u32, Mutex<vk::CommandPool>>,
}

impl CommandPools {
    pub fn new(
        device: &ash::Device,
        families: impl IntoIterator<Item = u32>,
    ) -> Result<Self, SyncError> {
        let mut pools = BTreeMap::new();
        for family in families {
            if pools.contains_key(&family) {
                continue;
            }
            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            let pool = unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| {
                SyncError::InitializationFailed(format!(
                    "Failed to create command pool for family {family}: {:?}",
                    e
                ))
            })?;
            pools.insert(family, Mutex::new(pool));
        }
        Ok(Self { pools })
    }

    pub fn allocate(
        &self,
        device: &ash::Device,
        family: u32,
    ) -> Result<(vk::CommandBuffer, vk::CommandPool), SyncError> {
        let pool = self.pools.get(&family).ok_or_else(|| {
            SyncError::InvalidParameter(format!("no command pool for queue family {family}"))
        })?;
        let pool = pool.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { device.allocate_command_buffers(&alloc_info) }.map_err(|e| {
            SyncError::ResourceCreationFailed(format!("Failed to allocate command buffer: {:?}", e))
        })?;
        let buffer = buffers.into_iter().next().ok_or_else(|| {
            SyncError::ResourceCreationFailed("driver returned no command buffer".to_string())
        })?;
        Ok((buffer, *pool))
    }

    pub fn free(&self, device: &ash::Device, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        match self.pools.values().find(|p| *p.lock() == pool) {
            Some(owner) => {
                let pool = owner.lock();
                unsafe { device.free_command_buffers(*pool, &[buffer]) };
            }
            None => log::error!("Freeing command buffer from unknown pool {pool:?}"),
        }
    }

    /// Destroy every pool. The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for (_, pool) in std::mem::take(&mut self.pools) {
            unsafe { device.destroy_command_pool(pool.into_inner(), None) };
        }
    }
}

fn buffer(resources: &ResourceArena, id: ResourceId) -> Option<vk::Buffer> {
    let resource = resources.get(id)?.as_buffer()?;
    match &resource.gpu {
        GpuBuffer::Vulkan { buffer, .. } => Some(*buffer),
        _ => None,
    }
}

fn image(resources: &ResourceArena, id: ResourceId) -> Option<(vk::Image, vk::ImageAspectFlags)> {
    let resource = resources.get(id)?.as_image()?;
    match &resource.gpu {
        GpuImage::Vulkan { image, aspect, .. } => Some((*image, *aspect)),
        _ => None,
    }
}

fn raw<T: Handle>(handle: RawHandle) -> T {
    T::from_raw(handle.raw())
}

/// Translates [`NativeCommand`]s into `vkCmd*` calls.
pub struct Encoder<'a> {
    pub device: &'a ash::Device,
    pub cmd: vk::CommandBuffer,
    pub resources: &'a ResourceArena,
}

impl Encoder<'_> {
    pub fn encode(&self, command: &NativeCommand) {
        let (device, cmd) = (self.device, self.cmd);
        match command {
            NativeCommand::PipelineBarrier {
                src_stages,
                dst_stages,
                by_region,
                barriers,
            } => self.pipeline_barrier(*src_stages, *dst_stages, *by_region, barriers),
            NativeCommand::CopyBuffer { src, dst, regions } => {
                let Some((src, dst)) = self.buffers(*src, *dst) else {
                    return;
                };
                let regions: Vec<vk::BufferCopy> = regions
                    .iter()
                    .map(|r| vk::BufferCopy {
                        src_offset: r.src_offset,
                        dst_offset: r.dst_offset,
                        size: r.size,
                    })
                    .collect();
                unsafe { device.cmd_copy_buffer(cmd, src, dst, &regions) };
            }
            NativeCommand::CopyBufferToImage {
                src,
                dst,
                layout,
                regions,
            } => {
                let (Some(src), Some((dst, aspect))) =
                    (self.buffer(*src), self.image(*dst))
                else {
                    return;
                };
                let regions: Vec<vk::BufferImageCopy> = regions
                    .iter()
                    .map(|r| vk::BufferImageCopy {
                        buffer_offset: r.buffer_offset,
                        buffer_row_length: 0,
                        buffer_image_height: 0,
                        image_subresource: conversion::subresource_layers(
                            aspect,
                            r.mip_level,
                            r.base_layer,
                            r.layer_count,
                        ),
                        image_offset: conversion::offset(r.image_offset),
                        image_extent: conversion::extent(r.image_extent),
                    })
                    .collect();
                unsafe {
                    device.cmd_copy_buffer_to_image(cmd, src, dst, layout.to_vk(), &regions)
                };
            }
            NativeCommand::BlitImage { image, blit } => {
                let Some((image, aspect)) = self.image(*image) else {
                    return;
                };
                let region = vk::ImageBlit {
                    src_subresource: conversion::subresource_layers(aspect, blit.src_mip, 0, 1),
                    src_offsets: [vk::Offset3D::default(), conversion::blit_corner(blit.src_extent)],
                    dst_subresource: conversion::subresource_layers(aspect, blit.dst_mip, 0, 1),
                    dst_offsets: [vk::Offset3D::default(), conversion::blit_corner(blit.dst_extent)],
                };
                unsafe {
                    device.cmd_blit_image(
                        cmd,
                        image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                        vk::Filter::LINEAR,
                    )
                };
            }
            NativeCommand::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
            } => {
                let Some(((src, src_aspect), (dst, dst_aspect))) = self.images(*src, *dst) else {
                    return;
                };
                let regions: Vec<vk::ImageCopy> = regions
                    .iter()
                    .map(|r| {
                        let (src_subresource, dst_subresource) =
                            image_copy_layers(r, src_aspect, dst_aspect);
                        vk::ImageCopy {
                            src_subresource,
                            src_offset: conversion::offset(r.src_offset),
                            dst_subresource,
                            dst_offset: conversion::offset(r.dst_offset),
                            extent: conversion::extent(r.extent),
                        }
                    })
                    .collect();
                unsafe {
                    device.cmd_copy_image(
                        cmd,
                        src,
                        src_layout.to_vk(),
                        dst,
                        dst_layout.to_vk(),
                        &regions,
                    )
                };
            }
            NativeCommand::ResolveImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
            } => {
                let Some(((src, src_aspect), (dst, dst_aspect))) = self.images(*src, *dst) else {
                    return;
                };
                let regions: Vec<vk::ImageResolve> = regions
                    .iter()
                    .map(|r| {
                        let (src_subresource, dst_subresource) =
                            image_copy_layers(r, src_aspect, dst_aspect);
                        vk::ImageResolve {
                            src_subresource,
                            src_offset: conversion::offset(r.src_offset),
                            dst_subresource,
                            dst_offset: conversion::offset(r.dst_offset),
                            extent: conversion::extent(r.extent),
                        }
                    })
                    .collect();
                unsafe {
                    device.cmd_resolve_image(
                        cmd,
                        src,
                        src_layout.to_vk(),
                        dst,
                        dst_layout.to_vk(),
                        &regions,
                    )
                };
            }
            NativeCommand::ClearColorImage {
                image,
                layout,
                color,
                mips,
            } => {
                let Some((image, aspect)) = self.image(*image) else {
                    return;
                };
                let value = vk::ClearColorValue { float32: *color };
                let range = conversion::mip_range(aspect, Some(*mips));
                unsafe { device.cmd_clear_color_image(cmd, image, layout.to_vk(), &value, &[range]) };
            }
            NativeCommand::ClearDepthStencilImage {
                image,
                layout,
                depth,
                stencil,
                mips,
            } => {
                let Some((image, aspect)) = self.image(*image) else {
                    return;
                };
                let value = vk::ClearDepthStencilValue {
                    depth: *depth,
                    stencil: *stencil,
                };
                let range = conversion::mip_range(aspect, Some(*mips));
                unsafe {
                    device.cmd_clear_depth_stencil_image(cmd, image, layout.to_vk(), &value, &[range])
                };
            }
            NativeCommand::BeginRenderPass(begin) => {
                let clear_values: Vec<vk::ClearValue> = begin
                    .clear_values
                    .iter()
                    .map(|v| conversion::clear_value(*v))
                    .collect();
                let info = vk::RenderPassBeginInfo::default()
                    .render_pass(raw(begin.render_pass))
                    .framebuffer(raw(begin.framebuffer))
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D::default(),
                        extent: vk::Extent2D {
                            width: begin.extent.width,
                            height: begin.extent.height,
                        },
                    })
                    .clear_values(&clear_values);
                unsafe { device.cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE) };
            }
            NativeCommand::EndRenderPass => unsafe { device.cmd_end_render_pass(cmd) },
            NativeCommand::BindPipeline {
                bind_point,
                pipeline,
            } => unsafe {
                device.cmd_bind_pipeline(cmd, conversion::bind_point(*bind_point), raw(*pipeline))
            },
            NativeCommand::BindDescriptorSets {
                bind_point,
                layout,
                first_set,
                sets,
            } => {
                let sets: Vec<vk::DescriptorSet> = sets.iter().map(|s| raw(*s)).collect();
                unsafe {
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        conversion::bind_point(*bind_point),
                        raw(*layout),
                        *first_set,
                        &sets,
                        &[],
                    )
                };
            }
            NativeCommand::PushConstants {
                layout,
                stages,
                offset,
                data,
            } => unsafe {
                device.cmd_push_constants(
                    cmd,
                    raw(*layout),
                    conversion::shader_stages(*stages),
                    *offset,
                    data,
                )
            },
            NativeCommand::BindVertexBuffers {
                first_binding,
                buffers,
            } => {
                let mut handles = Vec::with_capacity(buffers.len());
                let mut offsets = Vec::with_capacity(buffers.len());
                for (id, offset) in buffers {
                    let Some(buffer) = self.buffer(*id) else {
                        return;
                    };
                    handles.push(buffer);
                    offsets.push(*offset);
                }
                unsafe { device.cmd_bind_vertex_buffers(cmd, *first_binding, &handles, &offsets) };
            }
            NativeCommand::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            } => {
                if let Some(buffer) = self.buffer(*buffer) {
                    unsafe {
                        device.cmd_bind_index_buffer(
                            cmd,
                            buffer,
                            *offset,
                            conversion::index_type(*index_type),
                        )
                    };
                }
            }
            NativeCommand::SetViewport(viewport) => {
                let viewport = vk::Viewport {
                    x: viewport.x,
                    y: viewport.y,
                    width: viewport.width,
                    height: viewport.height,
                    min_depth: viewport.min_depth,
                    max_depth: viewport.max_depth,
                };
                unsafe { device.cmd_set_viewport(cmd, 0, &[viewport]) };
            }
            NativeCommand::SetScissor(scissor) => {
                let rect = vk::Rect2D {
                    offset: vk::Offset2D {
                        x: scissor.x,
                        y: scissor.y,
                    },
                    extent: vk::Extent2D {
                        width: scissor.width,
                        height: scissor.height,
                    },
                };
                unsafe { device.cmd_set_scissor(cmd, 0, &[rect]) };
            }
            NativeCommand::SetLineWidth(width) => unsafe { device.cmd_set_line_width(cmd, *width) },
            NativeCommand::Dispatch { x, y, z } => unsafe { device.cmd_dispatch(cmd, *x, *y, *z) },
            NativeCommand::DispatchIndirect { buffer, offset } => {
                if let Some(buffer) = self.buffer(*buffer) {
                    unsafe { device.cmd_dispatch_indirect(cmd, buffer, *offset) };
                }
            }
            NativeCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => unsafe {
                device.cmd_draw(cmd, *vertex_count, *instance_count, *first_vertex, *first_instance)
            },
            NativeCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => unsafe {
                device.cmd_draw_indexed(
                    cmd,
                    *index_count,
                    *instance_count,
                    *first_index,
                    *vertex_offset,
                    *first_instance,
                )
            },
            NativeCommand::DrawIndirect {
                buffer,
                offset,
                draw_count,
                stride,
            } => {
                if let Some(buffer) = self.buffer(*buffer) {
                    unsafe { device.cmd_draw_indirect(cmd, buffer, *offset, *draw_count, *stride) };
                }
            }
            NativeCommand::DrawIndexedIndirect {
                buffer,
                offset,
                draw_count,
                stride,
            } => {
                if let Some(buffer) = self.buffer(*buffer) {
                    unsafe {
                        device.cmd_draw_indexed_indirect(cmd, buffer, *offset, *draw_count, *stride)
                    };
                }
            }
        }
    }

    fn pipeline_barrier(
        &self,
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
        by_region: bool,
        barriers: &[BarrierDescriptor],
    ) {
        let mut memory = Vec::new();
        let mut buffers = Vec::new();
        let mut images = Vec::new();
        for barrier in barriers {
            match (self.resources.get(barrier.resource), barrier.is_image()) {
                (None, _) => {
                    log::error!("Barrier on stale resource {}", barrier.resource);
                }
                (Some(_), false) => match buffer(self.resources, barrier.resource) {
                    Some(buffer) => {
                        buffers.push(
                            vk::BufferMemoryBarrier::default()
                                .src_access_mask(barrier.src_access.to_vk())
                                .dst_access_mask(barrier.dst_access.to_vk())
                                .src_queue_family_index(barrier.src_queue_family)
                                .dst_queue_family_index(barrier.dst_queue_family)
                                .buffer(buffer)
                                .offset(0)
                                .size(vk::WHOLE_SIZE),
                        );
                    }
                    // An image without a layout change is pure memory ordering.
                    None => memory.push(
                        vk::MemoryBarrier::default()
                            .src_access_mask(barrier.src_access.to_vk())
                            .dst_access_mask(barrier.dst_access.to_vk()),
                    ),
                },
                (Some(_), true) => {
                    let Some((image, aspect)) = self.image(barrier.resource) else {
                        continue;
                    };
                    let old = barrier.old_layout.unwrap_or(ImageLayout::Undefined);
                    let new = barrier.new_layout.unwrap_or(old);
                    images.push(
                        vk::ImageMemoryBarrier::default()
                            .src_access_mask(barrier.src_access.to_vk())
                            .dst_access_mask(barrier.dst_access.to_vk())
                            .old_layout(old.to_vk())
                            .new_layout(new.to_vk())
                            .src_queue_family_index(barrier.src_queue_family)
                            .dst_queue_family_index(barrier.dst_queue_family)
                            .image(image)
                            .subresource_range(conversion::mip_range(aspect, barrier.mips)),
                    );
                }
            }
        }

        let flags = if by_region {
            vk::DependencyFlags::BY_REGION
        } else {
            vk::DependencyFlags::empty()
        };
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.cmd,
                src_stages.or_top_of_pipe().to_vk(),
                if dst_stages.is_empty() {
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE
                } else {
                    dst_stages.to_vk()
                },
                flags,
                &memory,
                &buffers,
                &images,
            )
        };
    }

    fn buffer(&self, id: ResourceId) -> Option<vk::Buffer> {
        let buffer = buffer(self.resources, id);
        if buffer.is_none() {
            log::error!("{id} is not a Vulkan buffer, skipping command");
        }
        buffer
    }

    fn image(&self, id: ResourceId) -> Option<(vk::Image, vk::ImageAspectFlags)> {
        let image = image(self.resources, id);
        if image.is_none() {
            log::error!("{id} is not a Vulkan image, skipping command");
        }
        image
    }

    fn buffers(&self, src: ResourceId, dst: ResourceId) -> Option<(vk::Buffer, vk::Buffer)> {
        Some((self.buffer(src)?, self.buffer(dst)?))
    }

    #[allow(clippy::type_complexity)]
    fn images(
        &self,
        src: ResourceId,
        dst: ResourceId,
    ) -> Option<(
        (vk::Image, vk::ImageAspectFlags),
        (vk::Image, vk::ImageAspectFlags),
    )> {
        Some((self.image(src)?, self.image(dst)?))
    }
}

fn image_copy_layers(
    region: &ImageCopy,
    src_aspect: vk::ImageAspectFlags,
    dst_aspect: vk::ImageAspectFlags,
) -> (vk::ImageSubresourceLayers, vk::ImageSubresourceLayers) {
    (
        conversion::subresource_layers(
            src_aspect,
            region.src_mip,
            region.base_layer,
            region.layer_count,
        ),
        conversion::subresource_layers(
            dst_aspect,
            region.dst_mip,
            region.base_layer,
            region.layer_count,
        ),
    )
}
