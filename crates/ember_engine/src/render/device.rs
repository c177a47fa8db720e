//! Graphics device facade
//!
//! Backend-agnostic entry point for applications. Resolves the configured
//! backend at creation and dispatches every operation to it; handles are
//! opaque and valid only on the device that created them.

use thiserror::Error;

use crate::config::RenderSettings;
use crate::render::null::NullDevice;
use crate::render::types::{
    BackendType, BufferDescriptor, BufferHandle, IndexType, PipelineHandle, PrimitiveTopology,
    RenderPassDescriptor, RenderPipelineDescriptor, ScissorRect, ShaderHandle,
    ShaderModuleDescriptor, TextureDescriptor, TextureHandle, VertexDescriptor, VertexInputRate,
    Viewport,
};
use crate::render::vulkan::{VulkanDevice, VulkanError};
use crate::render::window::{Window, WindowError};

/// Rendering errors surfaced to applications
#[derive(Error, Debug)]
pub enum RenderError {
    /// Error raised by the Vulkan backend
    #[error("Vulkan backend error: {0}")]
    Vulkan(#[from] VulkanError),

    /// Error raised by the windowing layer
    #[error("Window error: {0}")]
    Window(#[from] WindowError),

    /// The requested backend is not available on this platform
    #[error("Backend {backend:?} is not available")]
    BackendUnavailable {
        /// The backend that was requested
        backend: BackendType,
    },

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Resource with specified handle could not be found
    #[error("Resource not found")]
    ResourceNotFound,
}

/// Result type for rendering operations
pub type RenderResult<T> = Result<T, RenderError>;

enum BackendDevice {
    Vulkan(Box<VulkanDevice>),
    Null(NullDevice),
}

/// Backend-agnostic rendering device
pub struct GraphicsDevice {
    backend: BackendDevice,
    backend_type: BackendType,
}

impl GraphicsDevice {
    /// Create a device for the backend configured in `settings`.
    ///
    /// `BackendType::Default` resolves to Vulkan. Pass `None` for the window
    /// (or set `headless`) to run without presentation.
    pub fn new(settings: &RenderSettings, window: Option<&mut Window>) -> RenderResult<Self> {
        let backend_type = match settings.backend {
            BackendType::Default => BackendType::Vulkan,
            other => other,
        };

        let backend = match backend_type {
            BackendType::Vulkan => {
                BackendDevice::Vulkan(Box::new(VulkanDevice::new(settings, window)?))
            }
            BackendType::Null => BackendDevice::Null(NullDevice::new(
                settings.width,
                settings.height,
            )),
            other => return Err(RenderError::BackendUnavailable { backend: other }),
        };

        log::info!("[Render] Graphics device created (backend: {:?})", backend_type);
        Ok(Self {
            backend,
            backend_type,
        })
    }

    /// The backend this device resolved to
    pub fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    /// Block until all GPU work completes.
    pub fn wait_idle(&self) -> RenderResult<()> {
        match &self.backend {
            BackendDevice::Vulkan(device) => device.wait_idle().map_err(RenderError::from),
            BackendDevice::Null(_) => Ok(()),
        }
    }

    // ---- Resources ------------------------------------------------------

    /// Create a buffer, optionally filled with initial data.
    pub fn create_buffer(
        &mut self,
        descriptor: &BufferDescriptor,
        initial_data: Option<&[u8]>,
    ) -> RenderResult<BufferHandle> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => {
                Ok(device.create_buffer(descriptor, initial_data)?)
            }
            BackendDevice::Null(device) => device.create_buffer(descriptor, initial_data),
        }
    }

    /// Destroy a buffer. Safe to call with a handle that is in flight; the
    /// backend defers the actual release.
    pub fn destroy_buffer(&mut self, handle: BufferHandle) {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => device.destroy_buffer(handle),
            BackendDevice::Null(device) => device.destroy_buffer(handle),
        }
    }

    /// Copy host data into a GPU-resident buffer. Blocking; on return the
    /// data is visible to subsequent GPU commands.
    pub fn buffer_sub_data(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> RenderResult<()> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => Ok(device.buffer_sub_data(handle, offset, data)?),
            BackendDevice::Null(device) => device.buffer_sub_data(handle, offset, data),
        }
    }

    /// Create a texture.
    pub fn create_texture(&mut self, descriptor: &TextureDescriptor) -> RenderResult<TextureHandle> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => Ok(device.create_texture(descriptor)?),
            BackendDevice::Null(device) => device.create_texture(descriptor),
        }
    }

    /// Destroy a texture.
    pub fn destroy_texture(&mut self, handle: TextureHandle) {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => device.destroy_texture(handle),
            BackendDevice::Null(device) => device.destroy_texture(handle),
        }
    }

    /// Create a shader program from externally compiled SPIR-V stages.
    pub fn create_shader(
        &mut self,
        descriptor: &ShaderModuleDescriptor,
    ) -> RenderResult<ShaderHandle> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => Ok(device.create_shader(descriptor)?),
            BackendDevice::Null(device) => device.create_shader(descriptor),
        }
    }

    /// Destroy a shader program.
    pub fn destroy_shader(&mut self, handle: ShaderHandle) {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => device.destroy_shader(handle),
            BackendDevice::Null(device) => device.destroy_shader(handle),
        }
    }

    /// Pre-declare a render pipeline for a program and vertex layout.
    pub fn create_render_pipeline(
        &mut self,
        descriptor: &RenderPipelineDescriptor,
    ) -> RenderResult<PipelineHandle> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => Ok(device.create_render_pipeline(descriptor)?),
            BackendDevice::Null(device) => device.create_render_pipeline(descriptor),
        }
    }

    /// Bind a precreated pipeline, applying its program and vertex layout.
    /// Returns the pipeline's topology for use in draw calls.
    pub fn bind_render_pipeline(
        &mut self,
        handle: PipelineHandle,
    ) -> RenderResult<PrimitiveTopology> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => Ok(device.bind_render_pipeline(handle)?),
            BackendDevice::Null(device) => device.bind_render_pipeline(handle),
        }
    }

    // ---- Frame loop -----------------------------------------------------

    /// Begin a frame, acquiring the next back-buffer image when presenting.
    pub fn begin_frame(&mut self) -> RenderResult<()> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => Ok(device.begin_frame()?),
            BackendDevice::Null(device) => device.begin_frame(),
        }
    }

    /// End the frame: submit, wait for completion, and present.
    pub fn end_frame(&mut self) -> RenderResult<()> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => Ok(device.end_frame()?),
            BackendDevice::Null(device) => device.end_frame(),
        }
    }

    /// Resize the presentation surface, recreating the swapchain.
    pub fn resize(&mut self, width: u32, height: u32) -> RenderResult<()> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => Ok(device.resize(width, height)?),
            BackendDevice::Null(device) => {
                device.resize(width, height);
                Ok(())
            }
        }
    }

    /// Current backbuffer extent, if the device presents
    pub fn backbuffer_extent(&self) -> Option<(u32, u32)> {
        match &self.backend {
            BackendDevice::Vulkan(device) => device.swapchain_extent(),
            BackendDevice::Null(device) => Some(device.extent()),
        }
    }

    // ---- Command recording ----------------------------------------------

    /// Begin a render pass. An empty descriptor targets the back buffer.
    pub fn begin_render_pass(&mut self, descriptor: &RenderPassDescriptor) -> RenderResult<()> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => Ok(device.begin_render_pass(descriptor)?),
            BackendDevice::Null(device) => device.begin_render_pass(descriptor),
        }
    }

    /// End the current render pass.
    pub fn end_render_pass(&mut self) -> RenderResult<()> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => Ok(device.end_render_pass()?),
            BackendDevice::Null(device) => device.end_render_pass(),
        }
    }

    /// Set the viewport (top-left origin).
    pub fn set_viewport(&mut self, viewport: Viewport) {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => device.set_viewport(viewport),
            BackendDevice::Null(device) => device.set_viewport(viewport),
        }
    }

    /// Set the scissor rectangle.
    pub fn set_scissor(&mut self, scissor: ScissorRect) {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => device.set_scissor(scissor),
            BackendDevice::Null(device) => device.set_scissor(scissor),
        }
    }

    /// Select the active shader program for subsequent draws.
    pub fn set_program(&mut self, handle: ShaderHandle) -> RenderResult<()> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => Ok(device.set_program(handle)?),
            BackendDevice::Null(device) => device.set_program(handle),
        }
    }

    /// Set the vertex fetch layout for subsequent draws.
    pub fn set_vertex_descriptor(&mut self, descriptor: &VertexDescriptor) {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => device.set_vertex_descriptor(descriptor),
            BackendDevice::Null(device) => device.set_vertex_descriptor(descriptor),
        }
    }

    /// Bind a vertex buffer slot.
    pub fn set_vertex_buffer(
        &mut self,
        binding: u32,
        handle: BufferHandle,
        offset: u64,
        input_rate: VertexInputRate,
    ) -> RenderResult<()> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => {
                Ok(device.set_vertex_buffer(binding, handle, offset, input_rate)?)
            }
            BackendDevice::Null(device) => {
                device.set_vertex_buffer(binding, handle, offset, input_rate)
            }
        }
    }

    /// Bind an index buffer.
    pub fn set_index_buffer(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        index_type: IndexType,
    ) -> RenderResult<()> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => {
                Ok(device.set_index_buffer(handle, offset, index_type)?)
            }
            BackendDevice::Null(device) => device.set_index_buffer(handle, offset, index_type),
        }
    }

    /// Bind a uniform buffer range to a descriptor slot. A zero range binds
    /// from `offset` to the end of the buffer.
    pub fn set_uniform_buffer(
        &mut self,
        set: u32,
        binding: u32,
        handle: BufferHandle,
        offset: u64,
        range: u64,
    ) -> RenderResult<()> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => {
                Ok(device.set_uniform_buffer(set, binding, handle, offset, range)?)
            }
            BackendDevice::Null(device) => {
                device.set_uniform_buffer(set, binding, handle, offset, range)
            }
        }
    }

    /// Bind a texture to a descriptor slot.
    pub fn set_texture(
        &mut self,
        set: u32,
        binding: u32,
        handle: TextureHandle,
    ) -> RenderResult<()> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => Ok(device.set_texture(set, binding, handle)?),
            BackendDevice::Null(device) => device.set_texture(set, binding, handle),
        }
    }

    /// Record a non-indexed draw.
    pub fn draw(
        &mut self,
        topology: PrimitiveTopology,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> RenderResult<()> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => Ok(device.draw(
                topology,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )?),
            BackendDevice::Null(device) => device.draw(topology),
        }
    }

    /// Record an indexed draw.
    pub fn draw_indexed(
        &mut self,
        topology: PrimitiveTopology,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) -> RenderResult<()> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => Ok(device.draw_indexed(
                topology,
                index_count,
                instance_count,
                first_index,
                base_vertex,
                first_instance,
            )?),
            BackendDevice::Null(device) => device.draw(topology),
        }
    }

    /// Record a compute dispatch (outside a render pass).
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> RenderResult<()> {
        match &mut self.backend {
            BackendDevice::Vulkan(device) => Ok(device.dispatch(x, y, z)?),
            BackendDevice::Null(device) => device.dispatch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::types::{BufferUsage, ResourceUsage, ShaderStage, ShaderStageDescriptor};

    fn null_settings() -> RenderSettings {
        RenderSettings {
            backend: BackendType::Null,
            width: 320,
            height: 240,
            headless: true,
            ..Default::default()
        }
    }

    fn triangle_shader(device: &mut GraphicsDevice) -> ShaderHandle {
        device
            .create_shader(&ShaderModuleDescriptor {
                stages: vec![
                    ShaderStageDescriptor {
                        stage: ShaderStage::Vertex,
                        entry_point: "main".to_string(),
                        spirv: vec![0x0723_0203],
                    },
                    ShaderStageDescriptor {
                        stage: ShaderStage::Fragment,
                        entry_point: "main".to_string(),
                        spirv: vec![0x0723_0203],
                    },
                ],
                layout: Default::default(),
            })
            .unwrap()
    }

    #[test]
    fn null_backend_runs_a_full_frame() {
        let mut device = GraphicsDevice::new(&null_settings(), None).unwrap();
        assert_eq!(device.backend_type(), BackendType::Null);

        let shader = triangle_shader(&mut device);
        let buffer = device
            .create_buffer(
                &BufferDescriptor {
                    usage: BufferUsage::VERTEX,
                    size: 36,
                    stride: 12,
                    resource_usage: ResourceUsage::Default,
                },
                Some(&[0u8; 36]),
            )
            .unwrap();

        device.begin_frame().unwrap();
        device.begin_render_pass(&RenderPassDescriptor::default()).unwrap();
        device.set_program(shader).unwrap();
        device
            .set_vertex_buffer(0, buffer, 0, VertexInputRate::Vertex)
            .unwrap();
        device
            .draw(PrimitiveTopology::TriangleList, 3, 1, 0, 0)
            .unwrap();
        device.end_render_pass().unwrap();
        device.end_frame().unwrap();
        device.wait_idle().unwrap();
    }

    #[test]
    fn unavailable_backends_fail_at_creation() {
        let settings = RenderSettings {
            backend: BackendType::Direct3D12,
            ..null_settings()
        };
        assert!(matches!(
            GraphicsDevice::new(&settings, None),
            Err(RenderError::BackendUnavailable { .. })
        ));
    }

    #[test]
    fn pipeline_bind_applies_program_and_topology() {
        let mut device = GraphicsDevice::new(&null_settings(), None).unwrap();
        let shader = triangle_shader(&mut device);
        let pipeline = device
            .create_render_pipeline(&RenderPipelineDescriptor {
                shader,
                vertex_descriptor: VertexDescriptor::default(),
                primitive_topology: PrimitiveTopology::LineStrip,
            })
            .unwrap();

        device.begin_frame().unwrap();
        device.begin_render_pass(&RenderPassDescriptor::default()).unwrap();
        let topology = device.bind_render_pipeline(pipeline).unwrap();
        assert_eq!(topology, PrimitiveTopology::LineStrip);
        device.draw(topology, 4, 1, 0, 0).unwrap();
        device.end_render_pass().unwrap();
        device.end_frame().unwrap();
    }

    #[test]
    fn resize_updates_the_backbuffer_extent() {
        let mut device = GraphicsDevice::new(&null_settings(), None).unwrap();
        assert_eq!(device.backbuffer_extent(), Some((320, 240)));
        device.resize(640, 480).unwrap();
        assert_eq!(device.backbuffer_extent(), Some((640, 480)));
    }
}
