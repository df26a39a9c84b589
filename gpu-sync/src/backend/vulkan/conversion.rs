//! Conversions from layer types to Vulkan types.

use ash::vk;

use crate::encoder::ClearValue;
use crate::resources::{BufferDesc, ImageDesc, ResourceCaps, ResourceKind};
use crate::types::{
    Extent3d, ImageFormat, IndexType, MipRange, Offset3d, PipelineBindPoint, ShaderStages,
};

/// Buffer usage flags for a buffer description.
pub fn buffer_usage(desc: &BufferDesc) -> vk::BufferUsageFlags {
    let mut result = match desc.kind {
        ResourceKind::UniformBuffer => vk::BufferUsageFlags::UNIFORM_BUFFER,
        ResourceKind::TexelBuffer => {
            vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER
        }
        _ => vk::BufferUsageFlags::STORAGE_BUFFER,
    };
    let caps = desc.caps;
    if caps.contains(ResourceCaps::UNIFORM) {
        result |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if caps.contains(ResourceCaps::VERTEX) {
        result |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if caps.contains(ResourceCaps::INDEX) {
        result |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if caps.contains(ResourceCaps::INDIRECT) {
        result |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    if caps.contains(ResourceCaps::TRANSFER_SRC) {
        result |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if caps.contains(ResourceCaps::TRANSFER_DST) {
        result |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    result
}

/// Image usage flags for an image description.
pub fn image_usage(desc: &ImageDesc) -> vk::ImageUsageFlags {
    let caps = desc.caps;
    let mut result = vk::ImageUsageFlags::empty();
    if caps.contains(ResourceCaps::SAMPLED) {
        result |= vk::ImageUsageFlags::SAMPLED;
    }
    if caps.contains(ResourceCaps::STORAGE) {
        result |= vk::ImageUsageFlags::STORAGE;
    }
    if caps.contains(ResourceCaps::ATTACHMENT) {
        result |= if desc.format.is_depth_stencil() {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        };
    }
    if caps.contains(ResourceCaps::TRANSFER_SRC) {
        result |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if caps.contains(ResourceCaps::TRANSFER_DST) {
        result |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    result
}

pub fn sample_count(samples: u32) -> vk::SampleCountFlags {
    match samples {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

pub fn aspect_mask(format: ImageFormat) -> vk::ImageAspectFlags {
    if !format.is_depth_stencil() {
        vk::ImageAspectFlags::COLOR
    } else if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::DEPTH
    }
}

pub fn mip_range(aspect: vk::ImageAspectFlags, mips: Option<MipRange>) -> vk::ImageSubresourceRange {
    let (base_mip_level, level_count) = match mips {
        Some(mips) => (mips.base, mips.count),
        None => (0, vk::REMAINING_MIP_LEVELS),
    };
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level,
        level_count,
        base_array_layer: 0,
        layer_count: vk::REMAINING_ARRAY_LAYERS,
    }
}

pub fn subresource_layers(
    aspect: vk::ImageAspectFlags,
    mip_level: u32,
    base_array_layer: u32,
    layer_count: u32,
) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: aspect,
        mip_level,
        base_array_layer,
        layer_count,
    }
}

pub fn offset(offset: Offset3d) -> vk::Offset3D {
    vk::Offset3D {
        x: offset.x,
        y: offset.y,
        z: offset.z,
    }
}

pub fn extent(extent: Extent3d) -> vk::Extent3D {
    vk::Extent3D {
        width: extent.width,
        height: extent.height,
        depth: extent.depth,
    }
}

/// Far corner of a blit box starting at the origin.
pub fn blit_corner(extent: Extent3d) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: extent.depth as i32,
    }
}

pub fn clear_value(value: ClearValue) -> vk::ClearValue {
    match value {
        ClearValue::Color(float32) => vk::ClearValue {
            color: vk::ClearColorValue { float32 },
        },
        ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        },
    }
}

pub fn index_type(index_type: IndexType) -> vk::IndexType {
    match index_type {
        IndexType::U16 => vk::IndexType::UINT16,
        IndexType::U32 => vk::IndexType::UINT32,
    }
}

pub fn bind_point(bind_point: PipelineBindPoint) -> vk::PipelineBindPoint {
    match bind_point {
        PipelineBindPoint::Graphics => vk::PipelineBindPoint::GRAPHICS,
        PipelineBindPoint::Compute => vk::PipelineBindPoint::COMPUTE,
    }
}

pub fn shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    vk::ShaderStageFlags::from_raw(stages.bits())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shader_stage_bits_match() {
        assert_eq!(shader_stages(ShaderStages::VERTEX), vk::ShaderStageFlags::VERTEX);
        assert_eq!(shader_stages(ShaderStages::FRAGMENT), vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(shader_stages(ShaderStages::COMPUTE), vk::ShaderStageFlags::COMPUTE);
    }

    #[test]
    fn test_image_usage_for_depth_attachment() {
        let desc = ImageDesc::new_2d(8, 8, ImageFormat::Depth32Float)
            .with_caps(ResourceCaps::ATTACHMENT | ResourceCaps::SAMPLED);
        let usage = image_usage(&desc);
        assert!(usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));
        assert!(!usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
    }

    #[test]
    fn test_aspect_mask() {
        assert_eq!(aspect_mask(ImageFormat::Rgba8Unorm), vk::ImageAspectFlags::COLOR);
        assert_eq!(
            aspect_mask(ImageFormat::Depth24PlusStencil8),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
