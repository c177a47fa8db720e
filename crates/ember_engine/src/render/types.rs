//! Engine-level rendering types
//!
//! Plain descriptor structs and enums consumed by the device facade and
//! translated by each backend. Shader bytecode is treated as an opaque,
//! externally compiled SPIR-V blob.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

/// Maximum number of color attachments in a render pass
pub const MAX_COLOR_ATTACHMENTS: usize = 8;
/// Maximum number of bound vertex buffers
pub const MAX_VERTEX_BUFFER_BINDINGS: usize = 8;
/// Maximum number of vertex attributes
pub const MAX_VERTEX_ATTRIBUTES: usize = 16;
/// Maximum number of descriptor sets in a pipeline layout
pub const MAX_DESCRIPTOR_SETS: usize = 4;
/// Maximum number of bindings within one descriptor set
pub const MAX_BINDINGS_PER_SET: usize = 16;

new_key_type! {
    /// Opaque handle to a GPU buffer
    pub struct BufferHandle;
    /// Opaque handle to a GPU texture
    pub struct TextureHandle;
    /// Opaque handle to a shader program
    pub struct ShaderHandle;
    /// Opaque handle to a pre-derived render pipeline
    pub struct PipelineHandle;
}

/// Rendering backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BackendType {
    /// Pick the best backend for the platform
    #[default]
    Default,
    /// Headless no-op backend for tooling and tests
    Null,
    /// Vulkan backend
    Vulkan,
    /// Direct3D 12 backend (not yet implemented)
    Direct3D12,
    /// Direct3D 11 backend (not yet implemented)
    Direct3D11,
}

/// Residency class of a resource, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceUsage {
    /// GPU-resident, updated through the staging upload path
    #[default]
    Default,
    /// GPU-resident, written once at creation
    Immutable,
    /// CPU-visible, rewritten frequently by the CPU
    Dynamic,
    /// CPU-visible transfer source
    Staging,
}

bitflags! {
    /// Buffer usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        /// Bindable as a vertex buffer
        const VERTEX = 1 << 0;
        /// Bindable as an index buffer
        const INDEX = 1 << 1;
        /// Bindable as a uniform buffer
        const UNIFORM = 1 << 2;
        /// Bindable as a storage buffer
        const STORAGE = 1 << 3;
        /// Usable as a source of indirect draw arguments
        const INDIRECT = 1 << 4;
    }
}

bitflags! {
    /// Texture usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TextureUsage: u32 {
        /// Sampled in shaders
        const SAMPLED = 1 << 0;
        /// Written by compute shaders
        const STORAGE = 1 << 1;
        /// Usable as a color or depth-stencil render target
        const RENDER_TARGET = 1 << 2;
    }
}

/// Dimensionality of a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextureType {
    /// One-dimensional texture
    Type1D,
    /// Two-dimensional texture
    #[default]
    Type2D,
    /// Three-dimensional texture
    Type3D,
    /// Cube map
    TypeCube,
}

/// Pixel formats understood by the RHI
///
/// A deliberately small set; formats map one-to-one onto backend formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// Format left unspecified
    Undefined,
    /// 8-bit single channel
    R8Unorm,
    /// 8-bit RG
    Rg8Unorm,
    /// 8-bit RGBA
    #[default]
    Rgba8Unorm,
    /// 8-bit RGBA, sRGB encoded
    Rgba8Srgb,
    /// 8-bit BGRA
    Bgra8Unorm,
    /// 8-bit BGRA, sRGB encoded
    Bgra8Srgb,
    /// 16-bit float RGBA
    Rgba16Float,
    /// 32-bit float depth
    Depth32Float,
    /// 24-bit depth + 8-bit stencil
    Depth24UnormStencil8,
}

impl PixelFormat {
    /// Whether this format carries depth data
    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float | Self::Depth24UnormStencil8)
    }

    /// Whether this format carries stencil data
    pub fn is_stencil(self) -> bool {
        matches!(self, Self::Depth24UnormStencil8)
    }
}

/// Attachment behavior at render-pass begin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadAction {
    /// Contents are undefined at pass start
    #[default]
    DontCare,
    /// Preserve the previous contents
    Load,
    /// Clear to the attachment's clear value
    Clear,
}

/// Attachment behavior at render-pass end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StoreAction {
    /// Contents may be discarded after the pass
    DontCare,
    /// Results are written back to memory
    #[default]
    Store,
}

/// RGBA clear color
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClearColor {
    /// Red component
    pub r: f32,
    /// Green component
    pub g: f32,
    /// Blue component
    pub b: f32,
    /// Alpha component
    pub a: f32,
}

impl ClearColor {
    /// Opaque black
    pub const BLACK: Self = Self { r: 0.0, g: 0.0, b: 0.0, a: 1.0 };

    /// Construct from components
    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

/// Primitive assembly topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    /// Isolated points
    PointList,
    /// Isolated line segments
    LineList,
    /// Connected line strip
    LineStrip,
    /// Isolated triangles
    #[default]
    TriangleList,
    /// Connected triangle strip
    TriangleStrip,
}

/// Per-binding vertex fetch rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VertexInputRate {
    /// Advance per vertex
    #[default]
    Vertex,
    /// Advance per instance
    Instance,
}

/// Index element width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexType {
    /// 16-bit indices
    U16,
    /// 32-bit indices
    #[default]
    U32,
}

/// Shader pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex stage
    Vertex,
    /// Fragment stage
    Fragment,
    /// Compute stage
    Compute,
}

/// Vertex attribute component format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VertexFormat {
    /// One 32-bit float
    Float,
    /// Two 32-bit floats
    Float2,
    /// Three 32-bit floats
    #[default]
    Float3,
    /// Four 32-bit floats
    Float4,
    /// Four normalized unsigned bytes
    UByte4Norm,
}

impl VertexFormat {
    /// Byte size of one element of this format
    pub fn size(self) -> u32 {
        match self {
            Self::Float => 4,
            Self::Float2 => 8,
            Self::Float3 => 12,
            Self::Float4 | Self::UByte4Norm => 16,
        }
    }
}

/// One vertex attribute within a vertex descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttributeDescriptor {
    /// Shader input location
    pub location: u32,
    /// Vertex buffer binding slot the attribute is fetched from
    pub binding: u32,
    /// Component format
    pub format: VertexFormat,
    /// Byte offset within one element
    pub offset: u32,
}

/// Complete vertex fetch layout for a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VertexDescriptor {
    /// Active attributes, at most [`MAX_VERTEX_ATTRIBUTES`]
    pub attributes: Vec<VertexAttributeDescriptor>,
}

/// Buffer creation descriptor
#[derive(Debug, Clone, Copy)]
pub struct BufferDescriptor {
    /// How the buffer will be bound
    pub usage: BufferUsage,
    /// Total size in bytes
    pub size: u64,
    /// Element stride in bytes (0 when not applicable)
    pub stride: u32,
    /// Residency class
    pub resource_usage: ResourceUsage,
}

/// Texture creation descriptor
#[derive(Debug, Clone, Copy)]
pub struct TextureDescriptor {
    /// Dimensionality
    pub texture_type: TextureType,
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Depth for 3D textures, array size otherwise
    pub depth_or_array_size: u32,
    /// Number of mip levels
    pub mip_levels: u32,
    /// Pixel format
    pub format: PixelFormat,
    /// How the texture will be used
    pub usage: TextureUsage,
    /// MSAA sample count
    pub sample_count: u32,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            texture_type: TextureType::Type2D,
            width: 1,
            height: 1,
            depth_or_array_size: 1,
            mip_levels: 1,
            format: PixelFormat::Rgba8Unorm,
            usage: TextureUsage::SAMPLED,
            sample_count: 1,
        }
    }
}

/// One color attachment of a render pass
#[derive(Debug, Clone, Copy)]
pub struct ColorAttachmentDescriptor {
    /// Target texture
    pub texture: TextureHandle,
    /// Load behavior
    pub load_action: LoadAction,
    /// Store behavior
    pub store_action: StoreAction,
    /// Mip level rendered to
    pub mip_level: u32,
    /// Clear value used with [`LoadAction::Clear`]
    pub clear_color: ClearColor,
}

/// Depth-stencil attachment of a render pass
#[derive(Debug, Clone, Copy)]
pub struct DepthStencilAttachmentDescriptor {
    /// Target texture
    pub texture: TextureHandle,
    /// Load behavior
    pub load_action: LoadAction,
    /// Store behavior
    pub store_action: StoreAction,
    /// Depth clear value
    pub clear_depth: f32,
    /// Stencil clear value
    pub clear_stencil: u8,
}

/// Render pass descriptor
///
/// An empty descriptor targets the swapchain back buffer.
#[derive(Debug, Clone, Default)]
pub struct RenderPassDescriptor {
    /// Ordered color attachments, at most [`MAX_COLOR_ATTACHMENTS`]
    pub color_attachments: Vec<ColorAttachmentDescriptor>,
    /// Optional depth-stencil attachment
    pub depth_stencil_attachment: Option<DepthStencilAttachmentDescriptor>,
}

/// One shader stage of a program, as externally compiled SPIR-V
#[derive(Debug, Clone)]
pub struct ShaderStageDescriptor {
    /// Pipeline stage
    pub stage: ShaderStage,
    /// Entry point symbol name
    pub entry_point: String,
    /// SPIR-V words
    pub spirv: Vec<u32>,
}

/// Per-set shader resource bindings, reflected outside the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DescriptorSetLayoutInfo {
    /// Bit mask of uniform-buffer bindings
    pub uniform_buffer_mask: u32,
    /// Bit mask of sampled-image bindings
    pub sampled_image_mask: u32,
}

impl DescriptorSetLayoutInfo {
    /// Whether the set has any bindings
    pub fn is_empty(&self) -> bool {
        self.uniform_buffer_mask == 0 && self.sampled_image_mask == 0
    }
}

/// Shader resource interface, reflected from bytecode by external tooling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResourceLayout {
    /// Bit mask of consumed vertex attribute locations
    pub attribute_mask: u32,
    /// Bit mask of written render targets
    pub render_target_mask: u32,
    /// Per-set binding masks
    pub sets: [DescriptorSetLayoutInfo; MAX_DESCRIPTOR_SETS],
}

impl ResourceLayout {
    /// Bit mask of descriptor sets with at least one binding
    pub fn descriptor_set_mask(&self) -> u32 {
        let mut mask = 0;
        for (i, set) in self.sets.iter().enumerate() {
            if !set.is_empty() {
                mask |= 1 << i;
            }
        }
        mask
    }
}

/// Shader program descriptor: one or more stages plus their reflected layout
#[derive(Debug, Clone)]
pub struct ShaderModuleDescriptor {
    /// Stages making up the program (vertex [+ fragment], or compute)
    pub stages: Vec<ShaderStageDescriptor>,
    /// Reflected resource interface
    pub layout: ResourceLayout,
}

/// Render pipeline descriptor for explicit pipeline pre-creation
#[derive(Debug, Clone)]
pub struct RenderPipelineDescriptor {
    /// Shader program
    pub shader: ShaderHandle,
    /// Vertex fetch layout
    pub vertex_descriptor: VertexDescriptor,
    /// Assembly topology
    pub primitive_topology: PrimitiveTopology,
}

/// Viewport rectangle in framebuffer coordinates, top-left origin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// Left edge
    pub x: f32,
    /// Top edge
    pub y: f32,
    /// Width in pixels
    pub width: f32,
    /// Height in pixels
    pub height: f32,
    /// Minimum depth
    pub min_depth: f32,
    /// Maximum depth
    pub max_depth: f32,
}

/// Scissor rectangle in framebuffer coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    /// Left edge
    pub x: i32,
    /// Top edge
    pub y: i32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_set_mask_reflects_nonempty_sets() {
        let mut layout = ResourceLayout::default();
        assert_eq!(layout.descriptor_set_mask(), 0);

        layout.sets[0].uniform_buffer_mask = 0b1;
        layout.sets[2].sampled_image_mask = 0b10;
        assert_eq!(layout.descriptor_set_mask(), 0b101);
    }

    #[test]
    fn depth_format_classification() {
        assert!(PixelFormat::Depth32Float.is_depth());
        assert!(!PixelFormat::Depth32Float.is_stencil());
        assert!(PixelFormat::Depth24UnormStencil8.is_stencil());
        assert!(!PixelFormat::Bgra8Srgb.is_depth());
    }
}
