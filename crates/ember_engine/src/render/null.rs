//! Null rendering backend
//!
//! Headless backend that validates the same call contracts as the GPU
//! backends (frame and pass state machines, handle lifetimes, bounds) but
//! records nothing. Tooling and tests run against it without a driver.

use slotmap::SlotMap;

use crate::render::device::RenderError;
use crate::render::types::{
    BufferDescriptor, BufferHandle, IndexType, PipelineHandle, PrimitiveTopology,
    RenderPassDescriptor, RenderPipelineDescriptor, ResourceUsage, ScissorRect, ShaderHandle,
    ShaderModuleDescriptor, TextureDescriptor, TextureHandle, VertexDescriptor, VertexInputRate,
    Viewport, MAX_COLOR_ATTACHMENTS,
};

struct NullBuffer {
    size: u64,
    resource_usage: ResourceUsage,
}

struct NullTexture;

struct NullShader;

struct NullPipeline {
    shader: ShaderHandle,
    topology: PrimitiveTopology,
}

/// Headless device with full contract checking and no GPU work
pub struct NullDevice {
    buffers: SlotMap<BufferHandle, NullBuffer>,
    textures: SlotMap<TextureHandle, NullTexture>,
    shaders: SlotMap<ShaderHandle, NullShader>,
    pipelines: SlotMap<PipelineHandle, NullPipeline>,
    in_frame: bool,
    in_pass: bool,
    bound_program: Option<ShaderHandle>,
    frame_count: u64,
    draw_count: u64,
    extent: (u32, u32),
}

impl NullDevice {
    /// Create a headless device with a virtual backbuffer extent.
    pub fn new(width: u32, height: u32) -> Self {
        log::debug!("[Null] Device ready ({}x{})", width, height);
        Self {
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            in_frame: false,
            in_pass: false,
            bound_program: None,
            frame_count: 0,
            draw_count: 0,
            extent: (width, height),
        }
    }

    /// Completed frames since creation
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Draw calls recorded since creation
    pub fn draw_count(&self) -> u64 {
        self.draw_count
    }

    pub(crate) fn create_buffer(
        &mut self,
        descriptor: &BufferDescriptor,
        initial_data: Option<&[u8]>,
    ) -> Result<BufferHandle, RenderError> {
        if descriptor.size == 0 {
            return Err(RenderError::InvalidOperation {
                reason: "buffer size must be nonzero".to_string(),
            });
        }
        if let Some(data) = initial_data {
            if data.len() as u64 > descriptor.size {
                return Err(RenderError::InvalidOperation {
                    reason: "initial data exceeds buffer size".to_string(),
                });
            }
        }
        Ok(self.buffers.insert(NullBuffer {
            size: descriptor.size,
            resource_usage: descriptor.resource_usage,
        }))
    }

    pub(crate) fn destroy_buffer(&mut self, handle: BufferHandle) {
        self.buffers.remove(handle);
    }

    pub(crate) fn buffer_sub_data(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), RenderError> {
        let buffer = self.buffers.get(handle).ok_or(RenderError::ResourceNotFound)?;
        if matches!(
            buffer.resource_usage,
            ResourceUsage::Dynamic | ResourceUsage::Staging
        ) {
            return Err(RenderError::InvalidOperation {
                reason: "staged upload into a host-visible buffer".to_string(),
            });
        }
        if offset + data.len() as u64 > buffer.size {
            return Err(RenderError::InvalidOperation {
                reason: "upload exceeds destination buffer size".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn create_texture(
        &mut self,
        descriptor: &TextureDescriptor,
    ) -> Result<TextureHandle, RenderError> {
        if descriptor.width == 0 || descriptor.height == 0 {
            return Err(RenderError::InvalidOperation {
                reason: "texture dimensions must be nonzero".to_string(),
            });
        }
        Ok(self.textures.insert(NullTexture))
    }

    pub(crate) fn destroy_texture(&mut self, handle: TextureHandle) {
        self.textures.remove(handle);
    }

    pub(crate) fn create_shader(
        &mut self,
        descriptor: &ShaderModuleDescriptor,
    ) -> Result<ShaderHandle, RenderError> {
        if descriptor.stages.is_empty() {
            return Err(RenderError::InvalidOperation {
                reason: "shader program needs at least one stage".to_string(),
            });
        }
        Ok(self.shaders.insert(NullShader))
    }

    pub(crate) fn destroy_shader(&mut self, handle: ShaderHandle) {
        self.shaders.remove(handle);
    }

    pub(crate) fn create_render_pipeline(
        &mut self,
        descriptor: &RenderPipelineDescriptor,
    ) -> Result<PipelineHandle, RenderError> {
        if !self.shaders.contains_key(descriptor.shader) {
            return Err(RenderError::ResourceNotFound);
        }
        Ok(self.pipelines.insert(NullPipeline {
            shader: descriptor.shader,
            topology: descriptor.primitive_topology,
        }))
    }

    pub(crate) fn bind_render_pipeline(
        &mut self,
        handle: PipelineHandle,
    ) -> Result<PrimitiveTopology, RenderError> {
        let pipeline = self
            .pipelines
            .get(handle)
            .ok_or(RenderError::ResourceNotFound)?;
        self.bound_program = Some(pipeline.shader);
        Ok(pipeline.topology)
    }

    pub(crate) fn begin_frame(&mut self) -> Result<(), RenderError> {
        if self.in_frame {
            return Err(RenderError::InvalidOperation {
                reason: "begin_frame while a frame is open".to_string(),
            });
        }
        self.in_frame = true;
        Ok(())
    }

    pub(crate) fn end_frame(&mut self) -> Result<(), RenderError> {
        if !self.in_frame {
            return Err(RenderError::InvalidOperation {
                reason: "end_frame without begin_frame".to_string(),
            });
        }
        if self.in_pass {
            return Err(RenderError::InvalidOperation {
                reason: "end_frame inside a render pass".to_string(),
            });
        }
        self.in_frame = false;
        self.bound_program = None;
        self.frame_count += 1;
        Ok(())
    }

    pub(crate) fn begin_render_pass(
        &mut self,
        descriptor: &RenderPassDescriptor,
    ) -> Result<(), RenderError> {
        if !self.in_frame || self.in_pass {
            return Err(RenderError::InvalidOperation {
                reason: "begin_render_pass outside a frame or inside a pass".to_string(),
            });
        }
        if descriptor.color_attachments.len() > MAX_COLOR_ATTACHMENTS {
            return Err(RenderError::InvalidOperation {
                reason: "too many color attachments".to_string(),
            });
        }
        for attachment in &descriptor.color_attachments {
            if !self.textures.contains_key(attachment.texture) {
                return Err(RenderError::ResourceNotFound);
            }
        }
        if let Some(depth) = &descriptor.depth_stencil_attachment {
            if !self.textures.contains_key(depth.texture) {
                return Err(RenderError::ResourceNotFound);
            }
        }
        self.in_pass = true;
        Ok(())
    }

    pub(crate) fn end_render_pass(&mut self) -> Result<(), RenderError> {
        if !self.in_pass {
            return Err(RenderError::InvalidOperation {
                reason: "end_render_pass outside a render pass".to_string(),
            });
        }
        self.in_pass = false;
        Ok(())
    }

    pub(crate) fn set_program(&mut self, handle: ShaderHandle) -> Result<(), RenderError> {
        if !self.shaders.contains_key(handle) {
            return Err(RenderError::ResourceNotFound);
        }
        self.bound_program = Some(handle);
        Ok(())
    }

    pub(crate) fn set_vertex_descriptor(&mut self, _descriptor: &VertexDescriptor) {}

    pub(crate) fn set_viewport(&mut self, _viewport: Viewport) {}

    pub(crate) fn set_scissor(&mut self, _scissor: ScissorRect) {}

    pub(crate) fn set_vertex_buffer(
        &mut self,
        _binding: u32,
        handle: BufferHandle,
        _offset: u64,
        _input_rate: VertexInputRate,
    ) -> Result<(), RenderError> {
        if !self.buffers.contains_key(handle) {
            return Err(RenderError::ResourceNotFound);
        }
        Ok(())
    }

    pub(crate) fn set_index_buffer(
        &mut self,
        handle: BufferHandle,
        _offset: u64,
        _index_type: IndexType,
    ) -> Result<(), RenderError> {
        if !self.buffers.contains_key(handle) {
            return Err(RenderError::ResourceNotFound);
        }
        Ok(())
    }

    pub(crate) fn set_uniform_buffer(
        &mut self,
        _set: u32,
        _binding: u32,
        handle: BufferHandle,
        offset: u64,
        range: u64,
    ) -> Result<(), RenderError> {
        let buffer = self.buffers.get(handle).ok_or(RenderError::ResourceNotFound)?;
        if offset + range > buffer.size {
            return Err(RenderError::InvalidOperation {
                reason: "uniform range exceeds buffer size".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn set_texture(
        &mut self,
        _set: u32,
        _binding: u32,
        handle: TextureHandle,
    ) -> Result<(), RenderError> {
        if !self.textures.contains_key(handle) {
            return Err(RenderError::ResourceNotFound);
        }
        Ok(())
    }

    fn check_draw(&self) -> Result<(), RenderError> {
        if !self.in_pass {
            return Err(RenderError::InvalidOperation {
                reason: "draw outside a render pass".to_string(),
            });
        }
        if self.bound_program.is_none() {
            return Err(RenderError::InvalidOperation {
                reason: "draw without a bound program".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn draw(&mut self, _topology: PrimitiveTopology) -> Result<(), RenderError> {
        self.check_draw()?;
        self.draw_count += 1;
        Ok(())
    }

    pub(crate) fn dispatch(&mut self) -> Result<(), RenderError> {
        if self.in_pass {
            return Err(RenderError::InvalidOperation {
                reason: "dispatch inside a render pass".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn resize(&mut self, width: u32, height: u32) {
        self.extent = (width, height);
    }

    pub(crate) fn extent(&self) -> (u32, u32) {
        self.extent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::types::{BufferUsage, ResourceUsage};

    fn buffer_descriptor(size: u64) -> BufferDescriptor {
        BufferDescriptor {
            usage: BufferUsage::VERTEX,
            size,
            stride: 12,
            resource_usage: ResourceUsage::Default,
        }
    }

    #[test]
    fn frame_state_machine_is_enforced() {
        let mut device = NullDevice::new(64, 64);
        assert!(device.end_frame().is_err());
        device.begin_frame().unwrap();
        assert!(device.begin_frame().is_err());
        device.end_frame().unwrap();
        assert_eq!(device.frame_count(), 1);
    }

    #[test]
    fn draws_require_a_pass_and_a_program() {
        let mut device = NullDevice::new(64, 64);
        device.begin_frame().unwrap();
        assert!(device.draw(PrimitiveTopology::TriangleList).is_err());

        device.begin_render_pass(&RenderPassDescriptor::default()).unwrap();
        assert!(device.draw(PrimitiveTopology::TriangleList).is_err());

        let shader = device
            .create_shader(&ShaderModuleDescriptor {
                stages: vec![crate::render::types::ShaderStageDescriptor {
                    stage: crate::render::types::ShaderStage::Vertex,
                    entry_point: "main".to_string(),
                    spirv: vec![0x0723_0203],
                }],
                layout: Default::default(),
            })
            .unwrap();
        device.set_program(shader).unwrap();
        device.draw(PrimitiveTopology::TriangleList).unwrap();
        assert_eq!(device.draw_count(), 1);
    }

    #[test]
    fn destroyed_buffers_are_rejected() {
        let mut device = NullDevice::new(64, 64);
        let buffer = device.create_buffer(&buffer_descriptor(256), None).unwrap();
        device.buffer_sub_data(buffer, 0, &[0u8; 256]).unwrap();
        assert!(device.buffer_sub_data(buffer, 128, &[0u8; 256]).is_err());

        device.destroy_buffer(buffer);
        assert!(device.buffer_sub_data(buffer, 0, &[0u8; 16]).is_err());
    }

    #[test]
    fn host_visible_buffers_reject_staged_uploads() {
        let mut device = NullDevice::new(64, 64);
        let dynamic = device
            .create_buffer(
                &BufferDescriptor {
                    resource_usage: ResourceUsage::Dynamic,
                    ..buffer_descriptor(256)
                },
                None,
            )
            .unwrap();
        assert!(device.buffer_sub_data(dynamic, 0, &[0u8; 16]).is_err());

        let staging = device
            .create_buffer(
                &BufferDescriptor {
                    resource_usage: ResourceUsage::Staging,
                    ..buffer_descriptor(256)
                },
                None,
            )
            .unwrap();
        assert!(device.buffer_sub_data(staging, 0, &[0u8; 16]).is_err());
    }

    #[test]
    fn nested_render_passes_are_rejected() {
        let mut device = NullDevice::new(64, 64);
        device.begin_frame().unwrap();
        device.begin_render_pass(&RenderPassDescriptor::default()).unwrap();
        assert!(device.begin_render_pass(&RenderPassDescriptor::default()).is_err());
        assert!(device.end_frame().is_err());
        device.end_render_pass().unwrap();
        device.end_frame().unwrap();
    }
}
