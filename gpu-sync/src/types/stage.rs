//! Pipeline stage and memory access masks.
//!
//! Bit values match the native API so conversion is a plain reinterpretation.

use bitflags::bitflags;

bitflags! {
    /// Pipeline stages a barrier waits on or blocks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const DRAW_INDIRECT = 1 << 1;
        const VERTEX_INPUT = 1 << 2;
        const VERTEX_SHADER = 1 << 3;
        const FRAGMENT_SHADER = 1 << 7;
        const EARLY_FRAGMENT_TESTS = 1 << 8;
        const LATE_FRAGMENT_TESTS = 1 << 9;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 10;
        const COMPUTE_SHADER = 1 << 11;
        const TRANSFER = 1 << 12;
        const BOTTOM_OF_PIPE = 1 << 13;
        const HOST = 1 << 14;
        const ALL_GRAPHICS = 1 << 15;
        const ALL_COMMANDS = 1 << 16;
    }
}

impl PipelineStages {
    /// Vertex and fragment shader stages together.
    pub const GRAPHICS_SHADERS: Self = Self::VERTEX_SHADER.union(Self::FRAGMENT_SHADER);

    /// Returns `true` if exactly one stage bit is set.
    pub fn is_single(self) -> bool {
        self.bits().count_ones() == 1
    }

    /// Returns `true` if the mask names the transfer stage.
    pub fn is_transfer(self) -> bool {
        self.contains(Self::TRANSFER)
    }

    /// Replace an empty mask with `TOP_OF_PIPE`, which native barriers require.
    pub fn or_top_of_pipe(self) -> Self {
        if self.is_empty() { Self::TOP_OF_PIPE } else { self }
    }

    #[cfg(feature = "vulkan-backend")]
    pub fn to_vk(self) -> ash::vk::PipelineStageFlags {
        ash::vk::PipelineStageFlags::from_raw(self.bits())
    }
}

impl Default for PipelineStages {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Memory access kinds made available or visible by a barrier.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct AccessFlags: u32 {
        const INDIRECT_COMMAND_READ = 1 << 0;
        const INDEX_READ = 1 << 1;
        const VERTEX_ATTRIBUTE_READ = 1 << 2;
        const UNIFORM_READ = 1 << 3;
        const INPUT_ATTACHMENT_READ = 1 << 4;
        const SHADER_READ = 1 << 5;
        const SHADER_WRITE = 1 << 6;
        const COLOR_ATTACHMENT_READ = 1 << 7;
        const COLOR_ATTACHMENT_WRITE = 1 << 8;
        const DEPTH_STENCIL_ATTACHMENT_READ = 1 << 9;
        const DEPTH_STENCIL_ATTACHMENT_WRITE = 1 << 10;
        const TRANSFER_READ = 1 << 11;
        const TRANSFER_WRITE = 1 << 12;
        const HOST_READ = 1 << 13;
        const HOST_WRITE = 1 << 14;
        const MEMORY_READ = 1 << 15;
        const MEMORY_WRITE = 1 << 16;
    }
}

impl AccessFlags {
    /// Every bit that denotes a write.
    pub const WRITES: Self = Self::SHADER_WRITE
        .union(Self::COLOR_ATTACHMENT_WRITE)
        .union(Self::DEPTH_STENCIL_ATTACHMENT_WRITE)
        .union(Self::TRANSFER_WRITE)
        .union(Self::HOST_WRITE)
        .union(Self::MEMORY_WRITE);

    /// Returns `true` if any write bit is set.
    pub fn has_write(self) -> bool {
        self.intersects(Self::WRITES)
    }

    /// The write bits only.
    pub fn writes(self) -> Self {
        self & Self::WRITES
    }

    #[cfg(feature = "vulkan-backend")]
    pub fn to_vk(self) -> ash::vk::AccessFlags {
        ash::vk::AccessFlags::from_raw(self.bits())
    }
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self::empty()
    }
}
