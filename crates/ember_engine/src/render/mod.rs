//! Rendering subsystem
//!
//! The [`GraphicsDevice`] facade dispatches to a backend selected at
//! creation time: the Vulkan backend under [`vulkan`], or the headless
//! [`null`] backend. Applications describe resources and passes with the
//! plain types in [`types`] and never touch backend objects directly.

pub mod device;
pub mod null;
pub mod types;
pub mod vulkan;
pub mod window;

pub use device::{GraphicsDevice, RenderError, RenderResult};
pub use types::{
    BackendType, BufferDescriptor, BufferHandle, BufferUsage, ClearColor,
    ColorAttachmentDescriptor, DepthStencilAttachmentDescriptor, DescriptorSetLayoutInfo,
    IndexType, LoadAction, PipelineHandle, PixelFormat, PrimitiveTopology, RenderPassDescriptor,
    RenderPipelineDescriptor, ResourceLayout, ResourceUsage, ScissorRect, ShaderHandle,
    ShaderModuleDescriptor, ShaderStage, ShaderStageDescriptor, StoreAction, TextureDescriptor,
    TextureHandle, TextureType, TextureUsage, VertexAttributeDescriptor, VertexDescriptor,
    VertexFormat, VertexInputRate, Viewport,
};
pub use vulkan::validation_error_count;
pub use window::{Window, WindowError};
