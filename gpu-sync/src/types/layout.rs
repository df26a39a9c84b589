//! Image layouts.

use super::{AccessFlags, PipelineStages};

/// Memory arrangement an image is kept in for a given kind of use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ImageLayout {
    /// Contents undefined. Valid only as a transition source.
    #[default]
    Undefined,
    /// Optimal for color attachment writes.
    ColorAttachment,
    /// Optimal for depth/stencil attachment writes.
    DepthStencilAttachment,
    /// Optimal for depth testing and sampling without writes.
    DepthStencilReadOnly,
    /// Optimal for shader sampling.
    ShaderReadOnly,
    /// Optimal for transfer source operations.
    TransferSrc,
    /// Optimal for transfer destination operations.
    TransferDst,
    /// Ready for presentation.
    PresentSrc,
    /// Storage images and same-image copies.
    General,
}

impl ImageLayout {
    /// Access mask typically associated with the layout.
    pub fn access_mask(self) -> AccessFlags {
        match self {
            Self::Undefined | Self::PresentSrc => AccessFlags::empty(),
            Self::ColorAttachment => AccessFlags::COLOR_ATTACHMENT_WRITE,
            Self::DepthStencilAttachment => AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            Self::DepthStencilReadOnly => AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            Self::ShaderReadOnly => AccessFlags::SHADER_READ,
            Self::TransferSrc => AccessFlags::TRANSFER_READ,
            Self::TransferDst => AccessFlags::TRANSFER_WRITE,
            Self::General => AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
        }
    }

    /// Pipeline stage that typically uses the layout.
    pub fn stage(self) -> PipelineStages {
        match self {
            Self::Undefined => PipelineStages::TOP_OF_PIPE,
            Self::ColorAttachment => PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            Self::DepthStencilAttachment => {
                PipelineStages::EARLY_FRAGMENT_TESTS | PipelineStages::LATE_FRAGMENT_TESTS
            }
            Self::DepthStencilReadOnly => PipelineStages::EARLY_FRAGMENT_TESTS,
            Self::ShaderReadOnly => PipelineStages::FRAGMENT_SHADER,
            Self::TransferSrc | Self::TransferDst => PipelineStages::TRANSFER,
            Self::PresentSrc => PipelineStages::BOTTOM_OF_PIPE,
            Self::General => PipelineStages::COMPUTE_SHADER,
        }
    }

    /// Check if this is a depth/stencil layout.
    pub fn is_depth_stencil(self) -> bool {
        matches!(
            self,
            Self::DepthStencilAttachment | Self::DepthStencilReadOnly
        )
    }

    /// Check if this is one of the transfer layouts.
    pub fn is_transfer(self) -> bool {
        matches!(self, Self::TransferSrc | Self::TransferDst)
    }

    #[cfg(feature = "vulkan-backend")]
    pub fn to_vk(self) -> ash::vk::ImageLayout {
        use ash::vk;
        match self {
            Self::Undefined => vk::ImageLayout::UNDEFINED,
            Self::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Self::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            Self::DepthStencilReadOnly => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            Self::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Self::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Self::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
            Self::General => vk::ImageLayout::GENERAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_access_masks() {
        assert_eq!(
            ImageLayout::TransferDst.access_mask(),
            AccessFlags::TRANSFER_WRITE
        );
        assert!(ImageLayout::Undefined.access_mask().is_empty());
        assert!(ImageLayout::General.access_mask().has_write());
    }

    #[test]
    fn test_layout_classification() {
        assert!(ImageLayout::DepthStencilReadOnly.is_depth_stencil());
        assert!(!ImageLayout::ShaderReadOnly.is_depth_stencil());
        assert!(ImageLayout::TransferSrc.is_transfer());
        assert_eq!(ImageLayout::default(), ImageLayout::Undefined);
    }

    #[cfg(feature = "vulkan-backend")]
    #[test]
    fn test_layout_to_vk() {
        use ash::vk;
        assert_eq!(ImageLayout::Undefined.to_vk(), vk::ImageLayout::UNDEFINED);
        assert_eq!(
            ImageLayout::TransferDst.to_vk(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        assert_eq!(ImageLayout::PresentSrc.to_vk(), vk::ImageLayout::PRESENT_SRC_KHR);
    }
}
