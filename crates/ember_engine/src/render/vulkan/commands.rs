//! Command recording and render-state tracking
//!
//! Each command buffer carries a dirty-bit state machine describing which
//! GPU state differs from what is actually bound. Binds are deferred until
//! just before a draw, where the matching graphics pipeline is derived
//! lazily from the current program, vertex layout, render pass, and
//! topology, and cached on the shader program by content hash.
//!
//! Screen space follows the Direct3D top-left-origin convention: on
//! render-pass begin the viewport is flipped by negating its height and
//! offsetting the Y origin.

use ash::{vk, Device};
use bitflags::bitflags;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::render::types::{
    DescriptorSetLayoutInfo, IndexType, PrimitiveTopology, ScissorRect, VertexDescriptor,
    VertexFormat, VertexInputRate, Viewport, MAX_BINDINGS_PER_SET, MAX_DESCRIPTOR_SETS,
    MAX_VERTEX_BUFFER_BINDINGS,
};
use crate::render::vulkan::context::{VulkanError, VulkanResult};
use crate::render::vulkan::pipeline_layout::PipelineLayoutEntry;
use crate::render::vulkan::shader::ShaderProgram;

/// Translate an engine topology to the Vulkan enum.
pub fn translate_topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

/// Translate an engine vertex format to the Vulkan format.
pub fn translate_vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float => vk::Format::R32_SFLOAT,
        VertexFormat::Float2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float4 => vk::Format::R32G32B32A32_SFLOAT,
        VertexFormat::UByte4Norm => vk::Format::R8G8B8A8_UNORM,
    }
}

/// Translate an engine input rate to the Vulkan enum.
pub fn translate_input_rate(rate: VertexInputRate) -> vk::VertexInputRate {
    match rate {
        VertexInputRate::Vertex => vk::VertexInputRate::VERTEX,
        VertexInputRate::Instance => vk::VertexInputRate::INSTANCE,
    }
}

/// Translate an engine index type to the Vulkan enum.
pub fn translate_index_type(ty: IndexType) -> vk::IndexType {
    match ty {
        IndexType::U16 => vk::IndexType::UINT16,
        IndexType::U32 => vk::IndexType::UINT32,
    }
}

/// Flip a top-left-origin viewport into Vulkan's convention by negating the
/// height and offsetting the Y origin.
pub fn flipped_viewport(viewport: Viewport) -> vk::Viewport {
    vk::Viewport {
        x: viewport.x,
        y: viewport.height + viewport.y,
        width: viewport.width,
        height: -viewport.height,
        min_depth: viewport.min_depth,
        max_depth: viewport.max_depth,
    }
}

/// Full-extent top-left-origin viewport for a framebuffer.
pub fn full_viewport(extent: vk::Extent2D) -> Viewport {
    Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

bitflags! {
    /// State that differs from what is bound on the command buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirtyFlags: u32 {
        /// Pipeline-affecting state changed
        const PIPELINE = 1 << 0;
        /// Viewport changed
        const VIEWPORT = 1 << 1;
        /// Scissor rectangle changed
        const SCISSOR = 1 << 2;
        /// Descriptor sets changed
        const DESCRIPTOR_SETS = 1 << 3;
    }
}

/// One bound vertex buffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferBinding {
    /// Raw buffer identity
    pub buffer: u64,
    /// Byte offset of the first element
    pub offset: u64,
    /// Element stride in bytes
    pub stride: u32,
    /// Fetch rate
    pub input_rate: VertexInputRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexBinding {
    buffer: u64,
    offset: u64,
    index_type: IndexType,
}

/// One bound uniform-buffer range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformBinding {
    /// Raw buffer identity
    pub buffer: u64,
    /// Byte offset of the range
    pub offset: u64,
    /// Byte size of the range
    pub range: u64,
}

/// One bound sampled image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageBinding {
    /// Raw image-view identity
    pub view: u64,
    /// Raw sampler identity
    pub sampler: u64,
}

/// Recording lifecycle of a command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    /// Reset, ready for `begin`
    Initial,
    /// Between `begin` and `end`
    Recording,
    /// Ended, ready for submission
    Executable,
    /// Handed to the queue; reset after its fence signals
    Submitted,
}

/// Pure dirty-bit tracker for one command buffer's render state.
///
/// No API objects; the recorder consults it to decide what actually needs
/// re-binding.
pub struct RenderState {
    dirty: DirtyFlags,
    dirty_vbos: u32,
    vbos: [Option<VertexBufferBinding>; MAX_VERTEX_BUFFER_BINDINGS],
    program: Option<u64>,
    vertex_layout_hash: u64,
    active_vbos: u32,
    render_pass_hash: u64,
    topology: Option<PrimitiveTopology>,
    viewport: Option<Viewport>,
    scissor: Option<ScissorRect>,
    bound_pipeline: Option<u64>,
    index_binding: Option<IndexBinding>,
    uniforms: [[Option<UniformBinding>; MAX_BINDINGS_PER_SET]; MAX_DESCRIPTOR_SETS],
    images: [[Option<ImageBinding>; MAX_BINDINGS_PER_SET]; MAX_DESCRIPTOR_SETS],
}

impl RenderState {
    /// A fully dirty state, as after a reset.
    pub fn new() -> Self {
        Self {
            dirty: DirtyFlags::all(),
            dirty_vbos: !0,
            vbos: [None; MAX_VERTEX_BUFFER_BINDINGS],
            program: None,
            vertex_layout_hash: 0,
            active_vbos: 0,
            render_pass_hash: 0,
            topology: None,
            viewport: None,
            scissor: None,
            bound_pipeline: None,
            index_binding: None,
            uniforms: [[None; MAX_BINDINGS_PER_SET]; MAX_DESCRIPTOR_SETS],
            images: [[None; MAX_BINDINGS_PER_SET]; MAX_DESCRIPTOR_SETS],
        }
    }

    /// Reset to all-dirty with every cached binding cleared, so the first
    /// draw after a reset re-binds everything.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Current dirty flags
    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    /// Set the active shader program by id.
    pub fn set_program(&mut self, program_id: u64) {
        if self.program != Some(program_id) {
            self.program = Some(program_id);
            self.dirty |= DirtyFlags::PIPELINE | DirtyFlags::DESCRIPTOR_SETS;
        }
    }

    /// Set the vertex fetch layout; derives the active-binding mask.
    pub fn set_vertex_descriptor(&mut self, descriptor: &VertexDescriptor) {
        let mut hasher = DefaultHasher::new();
        descriptor.hash(&mut hasher);
        let hash = hasher.finish();
        if hash != self.vertex_layout_hash {
            self.vertex_layout_hash = hash;
            self.active_vbos = descriptor
                .attributes
                .iter()
                .fold(0, |mask, attr| mask | (1 << attr.binding));
            self.dirty |= DirtyFlags::PIPELINE;
        }
    }

    /// Note the render pass the next draws execute in.
    pub fn set_render_pass(&mut self, render_pass_hash: u64) {
        if self.render_pass_hash != render_pass_hash {
            self.render_pass_hash = render_pass_hash;
            self.dirty |= DirtyFlags::PIPELINE;
        }
    }

    /// Bind a vertex buffer slot. The slot is dirtied only when the buffer
    /// identity, offset, stride, or input rate actually changed.
    pub fn set_vertex_buffer(
        &mut self,
        binding: u32,
        buffer: u64,
        offset: u64,
        stride: u32,
        input_rate: VertexInputRate,
    ) {
        let binding = binding as usize;
        if binding >= MAX_VERTEX_BUFFER_BINDINGS {
            return;
        }
        let new = VertexBufferBinding {
            buffer,
            offset,
            stride,
            input_rate,
        };
        let slot = &mut self.vbos[binding];
        if *slot == Some(new) {
            return;
        }
        // Stride and rate feed the pipeline's vertex input state.
        let pipeline_affecting = match slot {
            Some(old) => old.stride != new.stride || old.input_rate != new.input_rate,
            None => true,
        };
        *slot = Some(new);
        self.dirty_vbos |= 1 << binding;
        if pipeline_affecting {
            self.dirty |= DirtyFlags::PIPELINE;
        }
    }

    /// Set the viewport; dirty only on change.
    pub fn set_viewport(&mut self, viewport: Viewport) {
        if self.viewport != Some(viewport) {
            self.viewport = Some(viewport);
            self.dirty |= DirtyFlags::VIEWPORT;
        }
    }

    /// Set the scissor rectangle; dirty only on change.
    pub fn set_scissor(&mut self, scissor: ScissorRect) {
        if self.scissor != Some(scissor) {
            self.scissor = Some(scissor);
            self.dirty |= DirtyFlags::SCISSOR;
        }
    }

    /// Note that the viewport and scissor were recorded directly (render-
    /// pass begin resets both to the full framebuffer extent).
    pub fn mark_viewport_scissor_bound(&mut self, viewport: Viewport, scissor: ScissorRect) {
        self.viewport = Some(viewport);
        self.scissor = Some(scissor);
        self.dirty &= !(DirtyFlags::VIEWPORT | DirtyFlags::SCISSOR);
    }

    /// Whether the pipeline must be re-derived for this topology.
    pub fn needs_pipeline_flush(&self, topology: PrimitiveTopology) -> bool {
        self.dirty.contains(DirtyFlags::PIPELINE) || self.topology != Some(topology)
    }

    /// Content hash identifying the pipeline for the current state.
    ///
    /// Covers the program, render pass, per-active-binding stride/rate,
    /// vertex layout, and topology.
    pub fn pipeline_hash(&self, topology: PrimitiveTopology) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.program.hash(&mut hasher);
        self.render_pass_hash.hash(&mut hasher);
        0u32.hash(&mut hasher); // subpass index
        self.vertex_layout_hash.hash(&mut hasher);
        for binding in 0..MAX_VERTEX_BUFFER_BINDINGS {
            if self.active_vbos & (1 << binding) == 0 {
                continue;
            }
            if let Some(vbo) = &self.vbos[binding] {
                vbo.stride.hash(&mut hasher);
                vbo.input_rate.hash(&mut hasher);
            }
        }
        topology.hash(&mut hasher);
        hasher.finish()
    }

    /// Record that a pipeline with this identity is now bound. Returns true
    /// when the identity changed and a bind must be recorded.
    pub fn bind_pipeline(&mut self, identity: u64, topology: PrimitiveTopology) -> bool {
        self.dirty &= !DirtyFlags::PIPELINE;
        self.topology = Some(topology);
        if self.bound_pipeline == Some(identity) {
            return false;
        }
        self.bound_pipeline = Some(identity);
        true
    }

    /// Dirty slots that are actually consumed by the current vertex layout;
    /// clears those dirty bits. Inactive slots stay dirty but are never
    /// bound.
    pub fn take_vertex_updates(&mut self) -> u32 {
        let mask = self.dirty_vbos & self.active_vbos;
        self.dirty_vbos &= !mask;
        mask
    }

    /// The binding stored in a slot
    pub fn vertex_binding(&self, binding: u32) -> Option<VertexBufferBinding> {
        self.vbos.get(binding as usize).copied().flatten()
    }

    /// Active strides and input rates for pipeline vertex-input state
    pub fn active_bindings(&self) -> Vec<(u32, u32, VertexInputRate)> {
        (0..MAX_VERTEX_BUFFER_BINDINGS as u32)
            .filter(|binding| self.active_vbos & (1 << binding) != 0)
            .filter_map(|binding| {
                self.vbos[binding as usize]
                    .map(|vbo| (binding, vbo.stride, vbo.input_rate))
            })
            .collect()
    }

    /// Take the viewport if its dirty bit is set.
    pub fn take_viewport(&mut self) -> Option<Viewport> {
        if self.dirty.contains(DirtyFlags::VIEWPORT) {
            self.dirty &= !DirtyFlags::VIEWPORT;
            self.viewport
        } else {
            None
        }
    }

    /// Take the scissor if its dirty bit is set.
    pub fn take_scissor(&mut self) -> Option<ScissorRect> {
        if self.dirty.contains(DirtyFlags::SCISSOR) {
            self.dirty &= !DirtyFlags::SCISSOR;
            self.scissor
        } else {
            None
        }
    }

    /// Bind a uniform-buffer range to a (set, binding) slot; dirty only on
    /// change.
    pub fn set_uniform_buffer(&mut self, set: u32, binding: u32, uniform: UniformBinding) {
        let (set, binding) = (set as usize, binding as usize);
        if set >= MAX_DESCRIPTOR_SETS || binding >= MAX_BINDINGS_PER_SET {
            return;
        }
        if self.uniforms[set][binding] != Some(uniform) {
            self.uniforms[set][binding] = Some(uniform);
            self.dirty |= DirtyFlags::DESCRIPTOR_SETS;
        }
    }

    /// Bind a sampled image to a (set, binding) slot; dirty only on change.
    pub fn set_image(&mut self, set: u32, binding: u32, image: ImageBinding) {
        let (set, binding) = (set as usize, binding as usize);
        if set >= MAX_DESCRIPTOR_SETS || binding >= MAX_BINDINGS_PER_SET {
            return;
        }
        if self.images[set][binding] != Some(image) {
            self.images[set][binding] = Some(image);
            self.dirty |= DirtyFlags::DESCRIPTOR_SETS;
        }
    }

    /// Whether descriptor sets must be re-flushed
    pub fn needs_descriptor_flush(&self) -> bool {
        self.dirty.contains(DirtyFlags::DESCRIPTOR_SETS)
    }

    /// Clear the descriptor-set dirty bit after a flush.
    pub fn mark_descriptors_bound(&mut self) {
        self.dirty &= !DirtyFlags::DESCRIPTOR_SETS;
    }

    /// Content hash of one set's bindings under its layout masks.
    ///
    /// Two states binding the same resources to the same slots hash equal, so
    /// the descriptor allocator can hand back an already-written set.
    pub fn descriptor_content_hash(&self, set: u32, info: &DescriptorSetLayoutInfo) -> u64 {
        let mut hasher = DefaultHasher::new();
        let set = set as usize;
        for binding in 0..MAX_BINDINGS_PER_SET {
            if info.uniform_buffer_mask & (1 << binding) != 0 {
                self.uniforms[set][binding].hash(&mut hasher);
            }
            if info.sampled_image_mask & (1 << binding) != 0 {
                self.images[set][binding].hash(&mut hasher);
            }
        }
        hasher.finish()
    }

    /// The uniform binding stored in a slot
    pub fn uniform_binding(&self, set: u32, binding: u32) -> Option<UniformBinding> {
        self.uniforms
            .get(set as usize)
            .and_then(|set| set.get(binding as usize))
            .copied()
            .flatten()
    }

    /// The image binding stored in a slot
    pub fn image_binding(&self, set: u32, binding: u32) -> Option<ImageBinding> {
        self.images
            .get(set as usize)
            .and_then(|set| set.get(binding as usize))
            .copied()
            .flatten()
    }

    /// Record an index-buffer binding, eliding redundant rebinds. Returns
    /// true when a bind must be recorded.
    pub fn set_index_buffer(&mut self, buffer: u64, offset: u64, index_type: IndexType) -> bool {
        let new = IndexBinding {
            buffer,
            offset,
            index_type,
        };
        if self.index_binding == Some(new) {
            return false;
        }
        self.index_binding = Some(new);
        true
    }
}

impl Default for RenderState {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything pipeline derivation needs besides the tracked render state
pub struct FlushContext<'a> {
    /// The active shader program (owns the derived-pipeline cache)
    pub program: &'a mut ShaderProgram,
    /// Layout entry matching the program's resource layout, with its
    /// per-set descriptor allocators
    pub layout: &'a mut PipelineLayoutEntry,
    /// Device-wide pipeline cache object
    pub pipeline_cache: vk::PipelineCache,
    /// Current vertex fetch layout
    pub vertex_descriptor: &'a VertexDescriptor,
}

struct PassState {
    render_pass: vk::RenderPass,
    color_count: u32,
    has_depth: bool,
}

/// Command buffer wrapper with the recording state machine
pub struct CommandRecorder {
    device: Device,
    command_buffer: vk::CommandBuffer,
    state: CommandBufferState,
    pass: Option<PassState>,
    render: RenderState,
}

impl CommandRecorder {
    /// Wrap an allocated command buffer.
    pub fn new(device: Device, command_buffer: vk::CommandBuffer) -> Self {
        Self {
            device,
            command_buffer,
            state: CommandBufferState::Initial,
            pass: None,
            render: RenderState::new(),
        }
    }

    /// The raw command buffer handle
    pub fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Current lifecycle state
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    /// The tracked render state
    pub fn render_state_mut(&mut self) -> &mut RenderState {
        &mut self.render
    }

    /// Begin recording. Resets all tracked state to fully dirty.
    pub fn begin(&mut self) -> VulkanResult<()> {
        if self.state != CommandBufferState::Initial {
            return Err(VulkanError::InvalidOperation {
                reason: format!("begin in state {:?}", self.state),
            });
        }
        let begin_info = vk::CommandBufferBeginInfo::builder();
        unsafe {
            self.device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(VulkanError::Api)?;
        }
        self.render.reset();
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    /// Finish recording.
    pub fn end(&mut self) -> VulkanResult<()> {
        debug_assert!(self.pass.is_none(), "end inside a render pass");
        if self.state != CommandBufferState::Recording {
            return Err(VulkanError::InvalidOperation {
                reason: format!("end in state {:?}", self.state),
            });
        }
        unsafe {
            self.device
                .end_command_buffer(self.command_buffer)
                .map_err(VulkanError::Api)?;
        }
        self.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Note that the buffer was handed to the queue.
    pub fn mark_submitted(&mut self) {
        debug_assert_eq!(self.state, CommandBufferState::Executable);
        self.state = CommandBufferState::Submitted;
    }

    /// Reset after the submission fence signaled; the buffer is recycled.
    pub fn reset(&mut self) -> VulkanResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::Api)?;
        }
        self.render.reset();
        self.pass = None;
        self.state = CommandBufferState::Initial;
        Ok(())
    }

    /// Begin a render pass. Viewport and scissor are reset to the full
    /// framebuffer extent, Y-flipped.
    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        render_pass_hash: u64,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
        color_count: u32,
        has_depth: bool,
    ) -> VulkanResult<()> {
        debug_assert!(self.pass.is_none(), "begin_render_pass inside a render pass");
        if self.state != CommandBufferState::Recording || self.pass.is_some() {
            return Err(VulkanError::InvalidOperation {
                reason: "begin_render_pass outside recording or inside a pass".to_string(),
            });
        }

        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(clear_values);
        unsafe {
            self.device.cmd_begin_render_pass(
                self.command_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            );
        }

        let viewport = full_viewport(extent);
        let scissor = ScissorRect {
            x: 0,
            y: 0,
            width: extent.width,
            height: extent.height,
        };
        unsafe {
            self.device
                .cmd_set_viewport(self.command_buffer, 0, &[flipped_viewport(viewport)]);
            self.device.cmd_set_scissor(
                self.command_buffer,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                }],
            );
        }
        self.render.mark_viewport_scissor_bound(viewport, scissor);
        self.render.set_render_pass(render_pass_hash);

        self.pass = Some(PassState {
            render_pass,
            color_count,
            has_depth,
        });
        Ok(())
    }

    /// End the current render pass.
    pub fn end_render_pass(&mut self) -> VulkanResult<()> {
        debug_assert!(self.pass.is_some(), "end_render_pass outside a render pass");
        if self.pass.is_none() {
            return Err(VulkanError::InvalidOperation {
                reason: "end_render_pass outside a render pass".to_string(),
            });
        }
        unsafe {
            self.device.cmd_end_render_pass(self.command_buffer);
        }
        self.pass = None;
        Ok(())
    }

    /// Bind an index buffer, eliding redundant rebinds.
    pub fn set_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: IndexType) {
        use ash::vk::Handle;
        if self.render.set_index_buffer(buffer.as_raw(), offset, index_type) {
            unsafe {
                self.device.cmd_bind_index_buffer(
                    self.command_buffer,
                    buffer,
                    offset,
                    translate_index_type(index_type),
                );
            }
        }
    }

    /// Flush dirty render state ahead of a draw: derive/bind the pipeline,
    /// then dynamic state, then vertex buffers gated by the active mask.
    pub fn flush_render_state(
        &mut self,
        topology: PrimitiveTopology,
        ctx: &mut FlushContext<'_>,
        buffers: &dyn Fn(u64) -> Option<vk::Buffer>,
    ) -> VulkanResult<()> {
        use ash::vk::Handle;

        let (render_pass, color_count, has_depth) = {
            let pass = self.pass.as_ref().ok_or_else(|| VulkanError::InvalidOperation {
                reason: "draw outside a render pass".to_string(),
            })?;
            (pass.render_pass, pass.color_count, pass.has_depth)
        };

        if self.render.needs_pipeline_flush(topology) {
            let hash = self.render.pipeline_hash(topology);
            let pipeline = match ctx.program.get_pipeline(hash) {
                Some(pipeline) => pipeline,
                None => {
                    let pipeline = derive_graphics_pipeline(
                        &self.device,
                        ctx,
                        &self.render.active_bindings(),
                        topology,
                        render_pass,
                        color_count,
                        has_depth,
                    )?;
                    ctx.program.add_pipeline(hash, pipeline);
                    pipeline
                }
            };
            if self.render.bind_pipeline(pipeline.as_raw(), topology) {
                unsafe {
                    self.device.cmd_bind_pipeline(
                        self.command_buffer,
                        vk::PipelineBindPoint::GRAPHICS,
                        pipeline,
                    );
                }
            }
        }

        if self.render.needs_descriptor_flush() {
            self.flush_descriptor_sets(ctx)?;
            self.render.mark_descriptors_bound();
        }

        if let Some(viewport) = self.render.take_viewport() {
            unsafe {
                self.device
                    .cmd_set_viewport(self.command_buffer, 0, &[flipped_viewport(viewport)]);
            }
        }
        if let Some(scissor) = self.render.take_scissor() {
            unsafe {
                self.device.cmd_set_scissor(
                    self.command_buffer,
                    0,
                    &[vk::Rect2D {
                        offset: vk::Offset2D {
                            x: scissor.x,
                            y: scissor.y,
                        },
                        extent: vk::Extent2D {
                            width: scissor.width,
                            height: scissor.height,
                        },
                    }],
                );
            }
        }

        let mut update_mask = self.render.take_vertex_updates();
        while update_mask != 0 {
            let binding = update_mask.trailing_zeros();
            update_mask &= update_mask - 1;
            if let Some(vbo) = self.render.vertex_binding(binding) {
                let buffer = buffers(vbo.buffer).ok_or(VulkanError::ResourceNotFound)?;
                unsafe {
                    self.device.cmd_bind_vertex_buffers(
                        self.command_buffer,
                        binding,
                        &[buffer],
                        &[vbo.offset],
                    );
                }
            }
        }

        Ok(())
    }

    /// Bind descriptor sets for every active set of the current layout,
    /// reusing sets whose binding content was seen before.
    fn flush_descriptor_sets(&mut self, ctx: &mut FlushContext<'_>) -> VulkanResult<()> {
        use ash::vk::Handle;

        let pipeline_layout = ctx.layout.pipeline_layout;
        for (set_index, allocator) in &mut ctx.layout.set_allocators {
            let info = *allocator.layout_info();
            let hash = self.render.descriptor_content_hash(*set_index, &info);
            let (set, found) = allocator.request_set(hash)?;

            if !found {
                let uniform_count = info.uniform_buffer_mask.count_ones() as usize;
                let image_count = info.sampled_image_mask.count_ones() as usize;
                let mut buffer_infos = Vec::with_capacity(uniform_count);
                let mut image_infos = Vec::with_capacity(image_count);
                let mut writes = Vec::with_capacity(uniform_count + image_count);

                for binding in 0..MAX_BINDINGS_PER_SET as u32 {
                    if info.uniform_buffer_mask & (1 << binding) != 0 {
                        let uniform = self
                            .render
                            .uniform_binding(*set_index, binding)
                            .ok_or_else(|| VulkanError::InvalidOperation {
                                reason: format!(
                                    "no uniform buffer bound at set {} binding {}",
                                    set_index, binding
                                ),
                            })?;
                        buffer_infos.push(vk::DescriptorBufferInfo {
                            buffer: vk::Buffer::from_raw(uniform.buffer),
                            offset: uniform.offset,
                            range: uniform.range,
                        });
                        writes.push(
                            vk::WriteDescriptorSet::builder()
                                .dst_set(set)
                                .dst_binding(binding)
                                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                                .buffer_info(std::slice::from_ref(
                                    buffer_infos.last().ok_or(VulkanError::ResourceNotFound)?,
                                ))
                                .build(),
                        );
                    }
                    if info.sampled_image_mask & (1 << binding) != 0 {
                        let image = self
                            .render
                            .image_binding(*set_index, binding)
                            .ok_or_else(|| VulkanError::InvalidOperation {
                                reason: format!(
                                    "no texture bound at set {} binding {}",
                                    set_index, binding
                                ),
                            })?;
                        image_infos.push(vk::DescriptorImageInfo {
                            sampler: vk::Sampler::from_raw(image.sampler),
                            image_view: vk::ImageView::from_raw(image.view),
                            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        });
                        writes.push(
                            vk::WriteDescriptorSet::builder()
                                .dst_set(set)
                                .dst_binding(binding)
                                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                                .image_info(std::slice::from_ref(
                                    image_infos.last().ok_or(VulkanError::ResourceNotFound)?,
                                ))
                                .build(),
                        );
                    }
                }

                unsafe {
                    self.device.update_descriptor_sets(&writes, &[]);
                }
            }

            unsafe {
                self.device.cmd_bind_descriptor_sets(
                    self.command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline_layout,
                    *set_index,
                    &[set],
                    &[],
                );
            }
        }
        Ok(())
    }

    /// Record a non-indexed draw. State must have been flushed.
    pub fn draw(
        &self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw(
                self.command_buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    /// Record an indexed draw. State must have been flushed.
    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                self.command_buffer,
                index_count,
                instance_count,
                first_index,
                base_vertex,
                first_instance,
            );
        }
    }

    /// Record a compute dispatch.
    pub fn dispatch(&self, x: u32, y: u32, z: u32) {
        debug_assert!(self.pass.is_none(), "dispatch inside a render pass");
        unsafe {
            self.device.cmd_dispatch(self.command_buffer, x, y, z);
        }
    }
}

fn derive_graphics_pipeline(
    device: &Device,
    ctx: &FlushContext<'_>,
    bindings: &[(u32, u32, VertexInputRate)],
    topology: PrimitiveTopology,
    render_pass: vk::RenderPass,
    color_count: u32,
    has_depth: bool,
) -> VulkanResult<vk::Pipeline> {
    let stages = ctx.program.stage_create_infos();

    let binding_descriptions: Vec<vk::VertexInputBindingDescription> = bindings
        .iter()
        .map(|&(binding, stride, rate)| vk::VertexInputBindingDescription {
            binding,
            stride,
            input_rate: translate_input_rate(rate),
        })
        .collect();
    let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = ctx
        .vertex_descriptor
        .attributes
        .iter()
        .map(|attr| vk::VertexInputAttributeDescription {
            location: attr.location,
            binding: attr.binding,
            format: translate_vertex_format(attr.format),
            offset: attr.offset,
        })
        .collect();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&binding_descriptions)
        .vertex_attribute_descriptions(&attribute_descriptions);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(translate_topology(topology))
        .primitive_restart_enable(false);

    // Dynamic; actual rectangles come from the tracked render state.
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);

    let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(has_depth)
        .depth_write_enable(has_depth)
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);

    let blend_attachments = vec![
        vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::FALSE,
            color_write_mask: vk::ColorComponentFlags::RGBA,
            ..Default::default()
        };
        color_count as usize
    ];
    let color_blend =
        vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

    let create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(ctx.layout.pipeline_layout)
        .render_pass(render_pass)
        .subpass(0);

    let pipelines = unsafe {
        device
            .create_graphics_pipelines(ctx.pipeline_cache, &[create_info.build()], None)
            .map_err(|(_, e)| VulkanError::Api(e))?
    };
    log::debug!("[Vulkan] Derived graphics pipeline (topology: {:?})", topology);
    pipelines.first().copied().ok_or_else(|| {
        VulkanError::InvalidOperation {
            reason: "pipeline creation returned no pipeline".to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::types::VertexAttributeDescriptor;

    fn layout_with_bindings(bindings: &[u32]) -> VertexDescriptor {
        VertexDescriptor {
            attributes: bindings
                .iter()
                .enumerate()
                .map(|(i, &binding)| VertexAttributeDescriptor {
                    location: i as u32,
                    binding,
                    format: VertexFormat::Float3,
                    offset: 0,
                })
                .collect(),
        }
    }

    #[test]
    fn reset_marks_everything_dirty() {
        let mut state = RenderState::new();
        assert_eq!(state.dirty(), DirtyFlags::all());
        assert!(state.needs_pipeline_flush(PrimitiveTopology::TriangleList));

        state.bind_pipeline(1, PrimitiveTopology::TriangleList);
        assert!(!state.needs_pipeline_flush(PrimitiveTopology::TriangleList));
        state.reset();
        assert!(state.needs_pipeline_flush(PrimitiveTopology::TriangleList));
    }

    #[test]
    fn redundant_vertex_buffer_bind_is_elided() {
        let mut state = RenderState::new();
        state.set_vertex_descriptor(&layout_with_bindings(&[0]));
        state.set_vertex_buffer(0, 42, 0, 24, VertexInputRate::Vertex);
        assert_eq!(state.take_vertex_updates(), 0b1);

        // Same binding again: nothing to update.
        state.set_vertex_buffer(0, 42, 0, 24, VertexInputRate::Vertex);
        assert_eq!(state.take_vertex_updates(), 0);

        // Different buffer identity dirties the slot again.
        state.set_vertex_buffer(0, 43, 0, 24, VertexInputRate::Vertex);
        assert_eq!(state.take_vertex_updates(), 0b1);
    }

    #[test]
    fn inactive_slots_are_never_bound() {
        let mut state = RenderState::new();
        state.set_vertex_descriptor(&layout_with_bindings(&[0]));
        state.set_vertex_buffer(0, 1, 0, 16, VertexInputRate::Vertex);
        state.set_vertex_buffer(3, 2, 0, 16, VertexInputRate::Vertex);
        // Slot 3 is dirty but not part of the active layout.
        assert_eq!(state.take_vertex_updates(), 0b1);
    }

    #[test]
    fn stride_change_invalidates_the_pipeline() {
        let mut state = RenderState::new();
        state.set_vertex_descriptor(&layout_with_bindings(&[0]));
        state.set_program(1);
        state.set_vertex_buffer(0, 42, 0, 24, VertexInputRate::Vertex);
        let first = state.pipeline_hash(PrimitiveTopology::TriangleList);
        state.bind_pipeline(7, PrimitiveTopology::TriangleList);

        state.set_vertex_buffer(0, 42, 0, 32, VertexInputRate::Vertex);
        assert!(state.needs_pipeline_flush(PrimitiveTopology::TriangleList));
        let second = state.pipeline_hash(PrimitiveTopology::TriangleList);
        assert_ne!(first, second);
    }

    #[test]
    fn unchanged_state_yields_the_same_pipeline_hash() {
        let mut state = RenderState::new();
        state.set_program(1);
        state.set_render_pass(99);
        state.set_vertex_descriptor(&layout_with_bindings(&[0]));
        state.set_vertex_buffer(0, 42, 0, 24, VertexInputRate::Vertex);
        let first = state.pipeline_hash(PrimitiveTopology::TriangleList);
        let second = state.pipeline_hash(PrimitiveTopology::TriangleList);
        assert_eq!(first, second);

        // Offset changes do not affect pipeline identity.
        state.set_vertex_buffer(0, 42, 256, 24, VertexInputRate::Vertex);
        assert_eq!(state.pipeline_hash(PrimitiveTopology::TriangleList), first);
    }

    #[test]
    fn topology_change_requires_a_new_pipeline() {
        let mut state = RenderState::new();
        state.set_program(1);
        state.bind_pipeline(7, PrimitiveTopology::TriangleList);
        assert!(!state.needs_pipeline_flush(PrimitiveTopology::TriangleList));
        assert!(state.needs_pipeline_flush(PrimitiveTopology::LineList));
        assert_ne!(
            state.pipeline_hash(PrimitiveTopology::TriangleList),
            state.pipeline_hash(PrimitiveTopology::LineList)
        );
    }

    #[test]
    fn pipeline_rebind_elided_for_same_identity() {
        let mut state = RenderState::new();
        assert!(state.bind_pipeline(7, PrimitiveTopology::TriangleList));
        state.dirty |= DirtyFlags::PIPELINE;
        assert!(!state.bind_pipeline(7, PrimitiveTopology::TriangleList));
        assert!(state.bind_pipeline(8, PrimitiveTopology::TriangleList));
    }

    #[test]
    fn viewport_and_scissor_flush_independently() {
        let mut state = RenderState::new();
        let viewport = full_viewport(vk::Extent2D {
            width: 800,
            height: 600,
        });
        let scissor = ScissorRect {
            x: 0,
            y: 0,
            width: 800,
            height: 600,
        };
        state.mark_viewport_scissor_bound(viewport, scissor);
        assert!(state.take_viewport().is_none());
        assert!(state.take_scissor().is_none());

        state.set_viewport(Viewport {
            width: 400.0,
            ..viewport
        });
        assert!(state.take_viewport().is_some());
        assert!(state.take_scissor().is_none());
        // Redundant set keeps the bit clear.
        state.set_scissor(scissor);
        assert!(state.take_scissor().is_none());
    }

    #[test]
    fn empty_pass_leaves_state_clean() {
        // Begin defaults then immediately end: the next pass must not see
        // stale dirty viewport/scissor state.
        let mut state = RenderState::new();
        let extent = vk::Extent2D {
            width: 640,
            height: 480,
        };
        let viewport = full_viewport(extent);
        let scissor = ScissorRect {
            x: 0,
            y: 0,
            width: 640,
            height: 480,
        };
        state.mark_viewport_scissor_bound(viewport, scissor);
        state.set_render_pass(11);

        state.mark_viewport_scissor_bound(viewport, scissor);
        state.set_render_pass(11);
        assert!(state.take_viewport().is_none());
        assert!(state.take_scissor().is_none());
    }

    #[test]
    fn index_buffer_rebind_is_elided() {
        let mut state = RenderState::new();
        assert!(state.set_index_buffer(1, 0, IndexType::U32));
        assert!(!state.set_index_buffer(1, 0, IndexType::U32));
        assert!(state.set_index_buffer(1, 0, IndexType::U16));
        assert!(state.set_index_buffer(2, 0, IndexType::U16));
    }

    #[test]
    fn uniform_rebind_dirties_only_on_change() {
        let mut state = RenderState::new();
        let binding = UniformBinding {
            buffer: 5,
            offset: 0,
            range: 256,
        };
        state.set_uniform_buffer(0, 0, binding);
        assert!(state.needs_descriptor_flush());
        state.mark_descriptors_bound();

        state.set_uniform_buffer(0, 0, binding);
        assert!(!state.needs_descriptor_flush());

        state.set_uniform_buffer(0, 0, UniformBinding { offset: 256, ..binding });
        assert!(state.needs_descriptor_flush());
    }

    #[test]
    fn descriptor_hash_follows_masked_bindings() {
        let info = DescriptorSetLayoutInfo {
            uniform_buffer_mask: 0b1,
            sampled_image_mask: 0b10,
        };
        let binding = UniformBinding {
            buffer: 5,
            offset: 0,
            range: 256,
        };
        let image = ImageBinding { view: 9, sampler: 1 };

        let mut a = RenderState::new();
        a.set_uniform_buffer(0, 0, binding);
        a.set_image(0, 1, image);

        let mut b = RenderState::new();
        b.set_uniform_buffer(0, 0, binding);
        b.set_image(0, 1, image);
        assert_eq!(
            a.descriptor_content_hash(0, &info),
            b.descriptor_content_hash(0, &info)
        );

        // A slot outside the layout masks must not affect the hash.
        b.set_uniform_buffer(0, 3, binding);
        assert_eq!(
            a.descriptor_content_hash(0, &info),
            b.descriptor_content_hash(0, &info)
        );

        b.set_image(0, 1, ImageBinding { view: 10, ..image });
        assert_ne!(
            a.descriptor_content_hash(0, &info),
            b.descriptor_content_hash(0, &info)
        );
    }

    #[test]
    fn viewport_flip_negates_height_and_offsets_origin() {
        let flipped = flipped_viewport(Viewport {
            x: 0.0,
            y: 0.0,
            width: 800.0,
            height: 600.0,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        assert_eq!(flipped.y, 600.0);
        assert_eq!(flipped.height, -600.0);
        assert_eq!(flipped.width, 800.0);
    }
}
