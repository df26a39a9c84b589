//! Descriptor set contents as seen by the barrier logic.
//!
//! Descriptor layouts and pools live outside this crate. The command list only
//! needs to know which resources a bound set touches, how, and from which
//! stages, so it can barrier them before the set is used.

use crate::handle::ResourceId;
use crate::types::{AccessFlags, ImageLayout, PipelineStages, RawHandle};

/// How a shader accesses a bound resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingAccess {
    /// Uniform buffer (read-only).
    Uniform,
    /// Sampled image or read-only texel buffer.
    Sampled,
    /// Storage buffer or image that is only read.
    StorageRead,
    /// Storage buffer or image that is written.
    StorageWrite,
}

impl BindingAccess {
    /// Memory access performed by the shader.
    pub fn access_flags(self) -> AccessFlags {
        match self {
            Self::Uniform => AccessFlags::UNIFORM_READ,
            Self::Sampled | Self::StorageRead => AccessFlags::SHADER_READ,
            Self::StorageWrite => AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
        }
    }

    /// Layout an image must be in for this access.
    pub fn image_layout(self) -> ImageLayout {
        match self {
            Self::Uniform | Self::Sampled => ImageLayout::ShaderReadOnly,
            Self::StorageRead | Self::StorageWrite => ImageLayout::General,
        }
    }

    pub fn is_write(self) -> bool {
        self == Self::StorageWrite
    }
}

/// One resource bound in a descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub resource: ResourceId,
    pub access: BindingAccess,
    /// Pipeline stages whose shaders use the binding.
    pub stages: PipelineStages,
}

impl DescriptorBinding {
    pub fn new(resource: ResourceId, access: BindingAccess, stages: PipelineStages) -> Self {
        Self {
            resource,
            access,
            stages,
        }
    }
}

/// A native descriptor set and the resources bound in it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorSet {
    pub handle: RawHandle,
    pub bindings: Vec<DescriptorBinding>,
}

impl DescriptorSet {
    pub fn new(handle: RawHandle) -> Self {
        Self {
            handle,
            bindings: Vec::new(),
        }
    }

    /// Add a binding.
    pub fn with_binding(
        mut self,
        resource: ResourceId,
        access: BindingAccess,
        stages: PipelineStages,
    ) -> Self {
        self.bindings
            .push(DescriptorBinding::new(resource, access, stages));
        self
    }

    /// Add a uniform buffer read by vertex and fragment shaders.
    pub fn with_uniform_buffer(self, resource: ResourceId) -> Self {
        self.with_binding(resource, BindingAccess::Uniform, PipelineStages::GRAPHICS_SHADERS)
    }

    /// Add an image sampled by the fragment shader.
    pub fn with_texture(self, resource: ResourceId) -> Self {
        self.with_binding(resource, BindingAccess::Sampled, PipelineStages::FRAGMENT_SHADER)
    }

    /// Whether any binding writes its resource.
    pub fn has_writes(&self) -> bool {
        self.bindings.iter().any(|b| b.access.is_write())
    }
}
