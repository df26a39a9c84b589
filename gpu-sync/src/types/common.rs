//! Value types recorded into command buffers.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

// ============================================================================
// Raw native handles
// ============================================================================

/// Opaque native handle of an object owned outside this layer
/// (pipelines, pipeline layouts, descriptor sets, render passes, framebuffers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawHandle(u64);

impl RawHandle {
    /// The null handle.
    pub const NULL: Self = Self(0);

    /// Create from a raw handle value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw handle value.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Returns `true` for the null handle.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

// ============================================================================
// Extents and regions
// ============================================================================

/// 3D extent for images and copy regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent3d {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Depth in pixels (1 for 2D images).
    pub depth: u32,
}

impl Extent3d {
    /// Create a new 2D extent.
    pub fn new_2d(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
        }
    }

    /// Create a new 3D extent.
    pub fn new_3d(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Extent of mip `level`, each dimension halved per level and clamped to 1.
    pub fn mip(self, level: u32) -> Self {
        let shrink = |v: u32| v.checked_shr(level).unwrap_or(0).max(1);
        Self {
            width: shrink(self.width),
            height: shrink(self.height),
            depth: shrink(self.depth),
        }
    }
}

/// 3D offset inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Offset3d {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Offset3d {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

/// Contiguous range of mip levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MipRange {
    pub base: u32,
    pub count: u32,
}

impl MipRange {
    /// Levels `base..base + count`.
    pub fn new(base: u32, count: u32) -> Self {
        Self { base, count }
    }

    /// A single level.
    pub fn single(level: u32) -> Self {
        Self::new(level, 1)
    }

    /// One past the last level.
    pub fn end(self) -> u32 {
        self.base.saturating_add(self.count)
    }
}

// ============================================================================
// Viewport and scissor
// ============================================================================

/// Viewport configuration for rendering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

impl Viewport {
    /// Create a new viewport with standard `[0, 1]` depth range.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            ..Self::default()
        }
    }

    /// Full viewport covering an extent.
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        Self::new(0.0, 0.0, width as f32, height as f32)
    }
}

/// Scissor rectangle for clipping rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl ScissorRect {
    /// Create a new scissor rectangle.
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Create a scissor rectangle from dimensions with origin at (0, 0).
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }
}

// ============================================================================
// Pipeline binding
// ============================================================================

/// Which pipeline a bind command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineBindPoint {
    Graphics,
    Compute,
}

/// Index element size for indexed draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexType {
    U16,
    #[default]
    U32,
}

bitflags! {
    /// Shader stages visible to push constants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 4;
        const COMPUTE = 1 << 5;
    }
}

impl Default for ShaderStages {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// Indirect Drawing Arguments
// ============================================================================

/// Arguments for a non-indexed indirect draw call, laid out as the GPU reads them.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct DrawIndirectArgs {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

impl DrawIndirectArgs {
    /// Size of the struct in bytes, the default stride between records.
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;

    pub fn new(vertex_count: u32, instance_count: u32) -> Self {
        Self {
            vertex_count,
            instance_count,
            first_vertex: 0,
            first_instance: 0,
        }
    }
}

/// Arguments for an indexed indirect draw call, laid out as the GPU reads them.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct DrawIndexedIndirectArgs {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
}

impl DrawIndexedIndirectArgs {
    /// Size of the struct in bytes, the default stride between records.
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;

    pub fn new(index_count: u32, instance_count: u32) -> Self {
        Self {
            index_count,
            instance_count,
            first_index: 0,
            base_vertex: 0,
            first_instance: 0,
        }
    }
}

static_assertions::const_assert_eq!(DrawIndirectArgs::SIZE, 16);
static_assertions::const_assert_eq!(DrawIndexedIndirectArgs::SIZE, 20);
