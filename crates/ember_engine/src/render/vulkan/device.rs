//! Vulkan device: composition root of the backend
//!
//! Owns the instance, adapter, logical device, allocator, staging buffer,
//! all caches and pools, the frame command buffer, and every live resource.
//! Field order encodes destruction order: resources drop before caches,
//! caches before the allocator, and everything before the logical device
//! and instance.

use ash::extensions::khr::Surface;
use ash::vk::{self, Handle};
use slotmap::SlotMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::config::RenderSettings;
use crate::render::types::{
    BufferDescriptor, BufferHandle, IndexType, LoadAction, PipelineHandle, PrimitiveTopology,
    RenderPassDescriptor, RenderPipelineDescriptor, ResourceUsage, ScissorRect, ShaderHandle,
    ShaderModuleDescriptor, StoreAction, TextureDescriptor, TextureHandle, VertexDescriptor,
    VertexInputRate, Viewport, MAX_COLOR_ATTACHMENTS,
};
use crate::render::vulkan::allocator::MemoryAllocator;
use crate::render::vulkan::buffer::{Buffer, StagingBuffer, UploadChunks, STAGING_BUFFER_SIZE};
use crate::render::vulkan::commands::{
    CommandRecorder, FlushContext, ImageBinding, UniformBinding,
};
use crate::render::vulkan::context::{
    LogicalDevice, PhysicalDeviceInfo, VulkanError, VulkanInstance, VulkanResult,
};
use crate::render::vulkan::render_pass::{
    attachment_clear_values, AttachmentKey, FramebufferCache, RenderPassCache, RenderPassKey,
};
use crate::render::vulkan::shader::ShaderProgram;
use crate::render::vulkan::pipeline_layout::PipelineLayoutCache;
use crate::render::vulkan::swapchain::Swapchain;
use crate::render::vulkan::sync::{FencePool, SemaphorePool};
use crate::render::vulkan::texture::Texture;
use crate::render::Window;

/// Number of deferred-release slots cycled by the frame loop
const DEFERRED_SLOTS: usize = 2;

/// A precreated pipeline: program plus the fixed state it was declared with
struct PipelineState {
    shader: ShaderHandle,
    vertex_descriptor: VertexDescriptor,
    topology: PrimitiveTopology,
}

enum DeferredResource {
    Buffer(Buffer),
    Texture(Texture),
    Shader(ShaderProgram),
}

/// The Vulkan rendering device
pub struct VulkanDevice {
    // Live resources; dropped first.
    buffers: SlotMap<BufferHandle, Buffer>,
    textures: SlotMap<TextureHandle, Texture>,
    shaders: SlotMap<ShaderHandle, ShaderProgram>,
    pipelines: SlotMap<PipelineHandle, PipelineState>,
    deferred: [Vec<DeferredResource>; DEFERRED_SLOTS],

    swapchain: Option<Swapchain>,
    render_pass_cache: RenderPassCache,
    framebuffer_cache: FramebufferCache,
    pipeline_layout_cache: PipelineLayoutCache,
    staging: StagingBuffer,
    fence_pool: FencePool,
    semaphore_pool: SemaphorePool,
    recorder: CommandRecorder,
    command_pool: vk::CommandPool,
    pipeline_cache: vk::PipelineCache,
    default_sampler: vk::Sampler,
    allocator: MemoryAllocator,
    device: LogicalDevice,
    surface: Option<vk::SurfaceKHR>,
    surface_loader: Option<Surface>,
    physical_device: PhysicalDeviceInfo,
    instance: VulkanInstance,

    // Frame state
    frame_slot: usize,
    in_frame: bool,
    acquired: Option<(u32, vk::Semaphore)>,
    current_program: Option<ShaderHandle>,
    current_vertex_descriptor: VertexDescriptor,
    vsync: bool,
}

impl VulkanDevice {
    /// Bootstrap the full device: instance, adapter, logical device,
    /// allocator, staging buffer, caches, pools, and (unless headless) the
    /// swapchain.
    pub fn new(settings: &RenderSettings, window: Option<&mut Window>) -> VulkanResult<Self> {
        let headless = settings.headless || window.is_none();

        let (window_extensions, window) = match window {
            Some(window) if !settings.headless => {
                let extensions = window.required_instance_extensions().map_err(|e| {
                    VulkanError::InitializationFailed(format!("instance extensions: {}", e))
                })?;
                (extensions, Some(window))
            }
            _ => (Vec::new(), None),
        };

        let instance =
            VulkanInstance::new(&settings.title, &window_extensions, settings.validation)?;

        let (surface, surface_loader) = match window {
            Some(window) => {
                let loader = Surface::new(&instance.entry, &instance.instance);
                let surface = window
                    .create_vulkan_surface(instance.instance.handle())
                    .map_err(|e| {
                        VulkanError::InitializationFailed(format!("surface creation: {}", e))
                    })?;
                (Some(surface), Some(loader))
            }
            None => (None, None),
        };

        let physical_device = PhysicalDeviceInfo::select_adapter(
            &instance.instance,
            surface
                .as_ref()
                .zip(surface_loader.as_ref())
                .map(|(&s, l)| (s, l)),
        )?;
        let device = LogicalDevice::new(&instance.instance, &physical_device, headless)?;
        let raw_device = device.device.clone();

        let allocator = MemoryAllocator::new(
            &instance.instance,
            &raw_device,
            physical_device.device,
        )?;
        let staging = StagingBuffer::new(
            &allocator,
            STAGING_BUFFER_SIZE,
            physical_device.non_coherent_atom_size(),
        )?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.queue_selection.graphics_family);
        let command_pool = unsafe {
            raw_device
                .create_command_pool(&pool_info, None)
                .map_err(VulkanError::Api)?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffers = unsafe {
            raw_device
                .allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)?
        };
        let recorder = CommandRecorder::new(raw_device.clone(), command_buffers[0]);

        let cache_info = vk::PipelineCacheCreateInfo::builder();
        let pipeline_cache = unsafe {
            raw_device
                .create_pipeline_cache(&cache_info, None)
                .map_err(VulkanError::Api)?
        };

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE);
        let default_sampler = unsafe {
            raw_device
                .create_sampler(&sampler_info, None)
                .map_err(VulkanError::Api)?
        };

        let swapchain = match (surface, surface_loader.as_ref()) {
            (Some(surface), Some(loader)) => {
                let swapchain_loader = device.swapchain_loader.clone().ok_or_else(|| {
                    VulkanError::InitializationFailed("swapchain loader missing".to_string())
                })?;
                Some(Swapchain::new(
                    raw_device.clone(),
                    swapchain_loader,
                    surface,
                    loader,
                    physical_device.device,
                    device.queue_selection.graphics_family,
                    vk::Extent2D {
                        width: settings.width,
                        height: settings.height,
                    },
                    settings.vsync,
                )?)
            }
            _ => None,
        };

        log::debug!(
            "[Vulkan] Device ready (headless: {}, staging: {} MiB)",
            headless,
            STAGING_BUFFER_SIZE / (1024 * 1024)
        );

        Ok(Self {
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            deferred: Default::default(),
            swapchain,
            render_pass_cache: RenderPassCache::new(raw_device.clone()),
            framebuffer_cache: FramebufferCache::new(raw_device.clone()),
            pipeline_layout_cache: PipelineLayoutCache::new(raw_device),
            staging,
            fence_pool: FencePool::new(device.device.clone()),
            semaphore_pool: SemaphorePool::new(device.device.clone()),
            recorder,
            command_pool,
            pipeline_cache,
            default_sampler,
            allocator,
            device,
            surface,
            surface_loader,
            physical_device,
            instance,
            frame_slot: 0,
            in_frame: false,
            acquired: None,
            current_program: None,
            current_vertex_descriptor: VertexDescriptor::default(),
            vsync: settings.vsync,
        })
    }

    /// Block until all GPU work completes.
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe {
            self.device
                .device
                .device_wait_idle()
                .map_err(VulkanError::Api)
        }
    }

    // ---- Resources ------------------------------------------------------

    /// Create a buffer, optionally filled with initial data.
    pub fn create_buffer(
        &mut self,
        descriptor: &BufferDescriptor,
        initial_data: Option<&[u8]>,
    ) -> VulkanResult<BufferHandle> {
        let buffer = Buffer::new(&self.allocator, descriptor)?;
        let handle = self.buffers.insert(buffer);
        if let Some(data) = initial_data {
            match descriptor.resource_usage {
                ResourceUsage::Dynamic | ResourceUsage::Staging => {
                    if let Some(buffer) = self.buffers.get_mut(handle) {
                        buffer.write(0, data)?;
                    }
                }
                _ => self.buffer_sub_data(handle, 0, data)?,
            }
        }
        Ok(handle)
    }

    /// Destroy a buffer. The object is parked on the current frame's
    /// deferred-release list and freed once that slot cycles back.
    pub fn destroy_buffer(&mut self, handle: BufferHandle) {
        if let Some(buffer) = self.buffers.remove(handle) {
            self.deferred[self.frame_slot].push(DeferredResource::Buffer(buffer));
        }
    }

    /// Create a texture.
    pub fn create_texture(&mut self, descriptor: &TextureDescriptor) -> VulkanResult<TextureHandle> {
        let texture = Texture::new(self.device.device.clone(), &self.allocator, descriptor)?;
        Ok(self.textures.insert(texture))
    }

    /// Destroy a texture via the deferred-release list.
    pub fn destroy_texture(&mut self, handle: TextureHandle) {
        if let Some(texture) = self.textures.remove(handle) {
            self.deferred[self.frame_slot].push(DeferredResource::Texture(texture));
        }
    }

    /// Create a shader program from externally compiled SPIR-V.
    pub fn create_shader(
        &mut self,
        descriptor: &ShaderModuleDescriptor,
    ) -> VulkanResult<ShaderHandle> {
        let program = ShaderProgram::new(self.device.device.clone(), descriptor)?;
        // Derive the pipeline layout eagerly; every draw with this program
        // needs it.
        self.pipeline_layout_cache
            .request_pipeline_layout(program.layout())?;
        Ok(self.shaders.insert(program))
    }

    /// Destroy a shader program via the deferred-release list.
    pub fn destroy_shader(&mut self, handle: ShaderHandle) {
        if let Some(program) = self.shaders.remove(handle) {
            self.deferred[self.frame_slot].push(DeferredResource::Shader(program));
        }
    }

    /// Pre-declare a render pipeline. Binding it later applies the program
    /// and vertex layout in one call; the underlying pipeline object is
    /// still derived lazily against the active render pass.
    pub fn create_render_pipeline(
        &mut self,
        descriptor: &RenderPipelineDescriptor,
    ) -> VulkanResult<PipelineHandle> {
        if !self.shaders.contains_key(descriptor.shader) {
            return Err(VulkanError::ResourceNotFound);
        }
        Ok(self.pipelines.insert(PipelineState {
            shader: descriptor.shader,
            vertex_descriptor: descriptor.vertex_descriptor.clone(),
            topology: descriptor.primitive_topology,
        }))
    }

    /// Apply a precreated pipeline's program and vertex layout.
    pub fn bind_render_pipeline(&mut self, handle: PipelineHandle) -> VulkanResult<PrimitiveTopology> {
        let (shader, vertex_descriptor, topology) = {
            let state = self
                .pipelines
                .get(handle)
                .ok_or(VulkanError::ResourceNotFound)?;
            (
                state.shader,
                state.vertex_descriptor.clone(),
                state.topology,
            )
        };
        self.set_program(shader)?;
        self.set_vertex_descriptor(&vertex_descriptor);
        Ok(topology)
    }

    // ---- Upload path ----------------------------------------------------

    /// Copy host data into a GPU-resident buffer through the pinned staging
    /// buffer.
    ///
    /// Synchronous and blocking: each chunk is copied, flushed, submitted,
    /// and fence-waited before the next. On return all bytes are visible to
    /// subsequent GPU commands.
    pub fn buffer_sub_data(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> VulkanResult<()> {
        let (dst, dst_size) = {
            let buffer = self.buffers.get(handle).ok_or(VulkanError::ResourceNotFound)?;
            // Host-visible buffers carry no TRANSFER_DST usage; they are
            // written through their mapping, not the staging path.
            if matches!(
                buffer.resource_usage(),
                ResourceUsage::Dynamic | ResourceUsage::Staging
            ) {
                return Err(VulkanError::InvalidOperation {
                    reason: "staged upload into a host-visible buffer".to_string(),
                });
            }
            (buffer.handle(), buffer.size())
        };
        if offset + data.len() as u64 > dst_size {
            return Err(VulkanError::InvalidOperation {
                reason: "upload exceeds destination buffer size".to_string(),
            });
        }

        for chunk in UploadChunks::new(data.len() as u64, self.staging.capacity()) {
            let range = chunk.src_offset as usize..(chunk.src_offset + chunk.size) as usize;
            self.staging.write_chunk(&data[range])?;
            self.copy_staging_to(dst, offset + chunk.src_offset, chunk.size)?;
        }
        Ok(())
    }

    /// Record, submit, and fence-wait a one-shot staging copy.
    fn copy_staging_to(
        &mut self,
        dst: vk::Buffer,
        dst_offset: u64,
        size: u64,
    ) -> VulkanResult<()> {
        let raw = &self.device.device;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe {
            raw.allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)?[0]
        };

        let result = (|| {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe {
                raw.begin_command_buffer(command_buffer, &begin_info)
                    .map_err(VulkanError::Api)?;
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset,
                    size,
                };
                raw.cmd_copy_buffer(command_buffer, self.staging.handle(), dst, &[region]);
                raw.end_command_buffer(command_buffer)
                    .map_err(VulkanError::Api)?;
            }

            let fence = self.fence_pool.acquire()?;
            let command_buffers = [command_buffer];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            let wait = unsafe {
                raw.queue_submit(self.device.graphics_queue, &[submit_info.build()], fence)
                    .map_err(VulkanError::Api)
                    .and_then(|_| {
                        raw.wait_for_fences(&[fence], true, u64::MAX)
                            .map_err(VulkanError::Api)
                    })
            };
            let released = self.fence_pool.release(fence);
            wait.and(released)
        })();

        unsafe {
            raw.free_command_buffers(self.command_pool, &[command_buffer]);
        }
        result
    }

    // ---- Frame loop -----------------------------------------------------

    /// Begin a frame: drain the cycled deferred-release slot, acquire the
    /// next back-buffer image (when presenting), and start recording.
    pub fn begin_frame(&mut self) -> VulkanResult<()> {
        if self.in_frame {
            return Err(VulkanError::InvalidOperation {
                reason: "begin_frame while a frame is open".to_string(),
            });
        }

        // The previous use of this slot was fence-waited, so its garbage is
        // safe to free.
        self.deferred[self.frame_slot].clear();

        if let Some(swapchain) = &self.swapchain {
            let semaphore = self.semaphore_pool.acquire()?;
            let (index, suboptimal) = match swapchain.acquire_next_image(semaphore) {
                Ok(acquired) => acquired,
                Err(e) => {
                    let _ = self.semaphore_pool.release(semaphore);
                    return Err(e);
                }
            };
            if suboptimal {
                log::debug!("[Vulkan] Swapchain suboptimal at acquire");
            }
            self.acquired = Some((index, semaphore));
        }

        self.recorder.reset()?;
        self.recorder.begin()?;
        self.in_frame = true;
        Ok(())
    }

    /// End the frame: submit with a fence, block until the GPU finishes,
    /// recycle sync objects, and present when a swapchain exists.
    ///
    /// Single-buffered on purpose: the blocking wait trades CPU/GPU overlap
    /// for a simple lifetime story.
    pub fn end_frame(&mut self) -> VulkanResult<()> {
        if !self.in_frame {
            return Err(VulkanError::InvalidOperation {
                reason: "end_frame without begin_frame".to_string(),
            });
        }
        self.recorder.end()?;

        let raw = &self.device.device;
        let fence = self.fence_pool.acquire()?;
        let command_buffers = [self.recorder.handle()];
        let render_finished = match self.acquired {
            Some(_) => Some(self.semaphore_pool.acquire()?),
            None => None,
        };

        let wait_semaphores: Vec<vk::Semaphore> =
            self.acquired.iter().map(|&(_, semaphore)| semaphore).collect();
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores: Vec<vk::Semaphore> = render_finished.into_iter().collect();

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages[..wait_semaphores.len()])
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        let submitted = unsafe {
            raw.queue_submit(self.device.graphics_queue, &[submit_info.build()], fence)
                .map_err(VulkanError::Api)
        };
        let waited = submitted.and_then(|_| {
            self.recorder.mark_submitted();
            unsafe {
                raw.wait_for_fences(&[fence], true, u64::MAX)
                    .map_err(VulkanError::Api)
            }
        });
        if let Err(e) = waited {
            // Fatal, but hand the sync objects back so the pools stay
            // consistent for shutdown.
            let _ = self.fence_pool.release(fence);
            for &semaphore in &signal_semaphores {
                let _ = self.semaphore_pool.release(semaphore);
            }
            if let Some((_, semaphore)) = self.acquired.take() {
                let _ = self.semaphore_pool.release(semaphore);
            }
            return Err(e);
        }
        self.fence_pool.release(fence)?;

        let mut needs_recreate = false;
        if let (Some((index, acquire_semaphore)), Some(swapchain), Some(&present_semaphore)) =
            (self.acquired.take(), self.swapchain.as_ref(), signal_semaphores.first())
        {
            let presented =
                swapchain.present(self.device.graphics_queue, present_semaphore, index);
            // The fence wait above covered the submit; present has been
            // queued (or refused), so both semaphores can be recycled.
            self.semaphore_pool.release(acquire_semaphore)?;
            self.semaphore_pool.release(present_semaphore)?;
            needs_recreate = presented?;
        }

        self.in_frame = false;
        self.frame_slot = (self.frame_slot + 1) % DEFERRED_SLOTS;

        if needs_recreate {
            log::debug!("[Vulkan] Swapchain out of date after present");
        }
        Ok(())
    }

    /// Recreate the swapchain for a new window size.
    pub fn resize(&mut self, width: u32, height: u32) -> VulkanResult<()> {
        let (Some(surface), Some(surface_loader)) = (self.surface, self.surface_loader.as_ref())
        else {
            return Err(VulkanError::InvalidOperation {
                reason: "resize on a headless device".to_string(),
            });
        };
        let Some(swapchain) = self.swapchain.take() else {
            return Err(VulkanError::InvalidOperation {
                reason: "resize without a swapchain".to_string(),
            });
        };

        self.wait_idle()?;
        let new = swapchain.recreate(
            self.device.device.clone(),
            surface,
            surface_loader,
            self.physical_device.device,
            self.device.queue_selection.graphics_family,
            vk::Extent2D { width, height },
            self.vsync,
        )?;
        self.swapchain = Some(new);
        Ok(())
    }

    // ---- Command recording ----------------------------------------------

    /// Begin a render pass described by the descriptor; an empty descriptor
    /// targets the swapchain back buffer.
    pub fn begin_render_pass(&mut self, descriptor: &RenderPassDescriptor) -> VulkanResult<()> {
        if descriptor.color_attachments.len() > MAX_COLOR_ATTACHMENTS {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "{} color attachments exceeds the limit of {}",
                    descriptor.color_attachments.len(),
                    MAX_COLOR_ATTACHMENTS
                ),
            });
        }

        let (key, attachments, clear_values) =
            if descriptor.color_attachments.is_empty() && descriptor.depth_stencil_attachment.is_none() {
                self.backbuffer_pass_parts()?
            } else {
                self.offscreen_pass_parts(descriptor)?
            };

        let render_pass = self.render_pass_cache.request_render_pass(&key)?;
        let (framebuffer, extent) = self
            .framebuffer_cache
            .request_framebuffer(render_pass, &attachments)?;

        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let render_pass_hash = hasher.finish();

        self.recorder.begin_render_pass(
            render_pass,
            render_pass_hash,
            framebuffer,
            extent,
            &clear_values,
            key.colors.len() as u32,
            key.depth_stencil.is_some(),
        )
    }

    fn backbuffer_pass_parts(
        &self,
    ) -> VulkanResult<(RenderPassKey, Vec<(vk::ImageView, (u32, u32))>, Vec<vk::ClearValue>)> {
        let swapchain = self.swapchain.as_ref().ok_or_else(|| {
            VulkanError::InvalidOperation {
                reason: "backbuffer pass on a headless device".to_string(),
            }
        })?;
        let (index, _) = self.acquired.ok_or_else(|| VulkanError::InvalidOperation {
            reason: "backbuffer pass outside a frame".to_string(),
        })?;
        let backbuffer = swapchain
            .backbuffer(index)
            .ok_or(VulkanError::ResourceNotFound)?;

        let key = RenderPassKey {
            colors: vec![AttachmentKey {
                format: backbuffer.format(),
                load_action: LoadAction::Clear,
                store_action: StoreAction::Store,
            }],
            depth_stencil: None,
            present: true,
        };
        let extent = swapchain.extent();
        let attachments = vec![(backbuffer.view(), (extent.width, extent.height))];
        let clear_values = attachment_clear_values(&[[0.0, 0.0, 0.0, 1.0]], None);
        Ok((key, attachments, clear_values))
    }

    fn offscreen_pass_parts(
        &self,
        descriptor: &RenderPassDescriptor,
    ) -> VulkanResult<(RenderPassKey, Vec<(vk::ImageView, (u32, u32))>, Vec<vk::ClearValue>)> {
        let mut colors = Vec::with_capacity(descriptor.color_attachments.len());
        let mut attachments = Vec::new();
        let mut clear_colors = Vec::new();
        for attachment in &descriptor.color_attachments {
            let texture = self
                .textures
                .get(attachment.texture)
                .ok_or(VulkanError::ResourceNotFound)?;
            colors.push(AttachmentKey {
                format: texture.format(),
                load_action: attachment.load_action,
                store_action: attachment.store_action,
            });
            attachments.push((
                texture.view(),
                texture.mip_level_dimensions(attachment.mip_level),
            ));
            let c = attachment.clear_color;
            clear_colors.push([c.r, c.g, c.b, c.a]);
        }

        let mut depth_stencil = None;
        let mut depth_clear = None;
        if let Some(attachment) = &descriptor.depth_stencil_attachment {
            let texture = self
                .textures
                .get(attachment.texture)
                .ok_or(VulkanError::ResourceNotFound)?;
            if !texture.format().is_depth() {
                return Err(VulkanError::InvalidOperation {
                    reason: "depth-stencil attachment has a color format".to_string(),
                });
            }
            depth_stencil = Some(AttachmentKey {
                format: texture.format(),
                load_action: attachment.load_action,
                store_action: attachment.store_action,
            });
            attachments.push((texture.view(), texture.mip_level_dimensions(0)));
            depth_clear = Some((attachment.clear_depth, u32::from(attachment.clear_stencil)));
        }

        let key = RenderPassKey {
            colors,
            depth_stencil,
            present: false,
        };
        let clear_values = attachment_clear_values(&clear_colors, depth_clear);
        Ok((key, attachments, clear_values))
    }

    /// End the current render pass.
    pub fn end_render_pass(&mut self) -> VulkanResult<()> {
        self.recorder.end_render_pass()
    }

    /// Set the viewport (top-left origin; flipped at record time).
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.recorder.render_state_mut().set_viewport(viewport);
    }

    /// Set the scissor rectangle.
    pub fn set_scissor(&mut self, scissor: ScissorRect) {
        self.recorder.render_state_mut().set_scissor(scissor);
    }

    /// Select the active shader program.
    pub fn set_program(&mut self, handle: ShaderHandle) -> VulkanResult<()> {
        let program = self.shaders.get(handle).ok_or(VulkanError::ResourceNotFound)?;
        self.recorder.render_state_mut().set_program(program.id());
        self.current_program = Some(handle);
        Ok(())
    }

    /// Set the vertex fetch layout used by subsequent draws.
    pub fn set_vertex_descriptor(&mut self, descriptor: &VertexDescriptor) {
        self.recorder
            .render_state_mut()
            .set_vertex_descriptor(descriptor);
        self.current_vertex_descriptor = descriptor.clone();
    }

    /// Bind a vertex buffer slot.
    pub fn set_vertex_buffer(
        &mut self,
        binding: u32,
        handle: BufferHandle,
        offset: u64,
        input_rate: VertexInputRate,
    ) -> VulkanResult<()> {
        let buffer = self.buffers.get(handle).ok_or(VulkanError::ResourceNotFound)?;
        self.recorder.render_state_mut().set_vertex_buffer(
            binding,
            buffer.handle().as_raw(),
            offset,
            buffer.stride(),
            input_rate,
        );
        Ok(())
    }

    /// Bind an index buffer.
    pub fn set_index_buffer(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        index_type: IndexType,
    ) -> VulkanResult<()> {
        let buffer = self.buffers.get(handle).ok_or(VulkanError::ResourceNotFound)?;
        self.recorder
            .set_index_buffer(buffer.handle(), offset, index_type);
        Ok(())
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
    ) -> VulkanResult<()> {
        let buffer = self.buffers.get(handle).ok_or(VulkanError::ResourceNotFound)?;
        if offset > buffer.size() {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "uniform offset {} past end of {}-byte buffer",
                    offset,
                    buffer.size()
                ),
            });
        }
        let range = if range == 0 {
            buffer.size() - offset
        } else {
            range
        };
        self.recorder.render_state_mut().set_uniform_buffer(
            set,
            binding,
            UniformBinding {
                buffer: buffer.handle().as_raw(),
                offset,
                range,
            },
        );
        Ok(())
    }

    /// Bind a texture to a descriptor slot, sampled with the device's
    /// default linear sampler.
    pub fn set_texture(&mut self, set: u32, binding: u32, handle: TextureHandle) -> VulkanResult<()> {
        let texture = self.textures.get(handle).ok_or(VulkanError::ResourceNotFound)?;
        let sampler = self.default_sampler;
        self.recorder.render_state_mut().set_image(
            set,
            binding,
            ImageBinding {
                view: texture.view().as_raw(),
                sampler: sampler.as_raw(),
            },
        );
        Ok(())
    }

    /// Record a non-indexed draw, flushing dirty state first.
    pub fn draw(
        &mut self,
        topology: PrimitiveTopology,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> VulkanResult<()> {
        self.flush_render_state(topology)?;
        self.recorder
            .draw(vertex_count, instance_count, first_vertex, first_instance);
        Ok(())
    }

    /// Record an indexed draw, flushing dirty state first.
    pub fn draw_indexed(
        &mut self,
        topology: PrimitiveTopology,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) -> VulkanResult<()> {
        self.flush_render_state(topology)?;
        self.recorder.draw_indexed(
            index_count,
            instance_count,
            first_index,
            base_vertex,
            first_instance,
        );
        Ok(())
    }

    /// Record a compute dispatch (outside a render pass).
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> VulkanResult<()> {
        self.recorder.dispatch(x, y, z);
        Ok(())
    }

    fn flush_render_state(&mut self, topology: PrimitiveTopology) -> VulkanResult<()> {
        let program_handle = self.current_program.ok_or_else(|| {
            VulkanError::InvalidOperation {
                reason: "draw without a bound program".to_string(),
            }
        })?;
        let program = self
            .shaders
            .get_mut(program_handle)
            .ok_or(VulkanError::ResourceNotFound)?;
        let layout_entry = self
            .pipeline_layout_cache
            .request_pipeline_layout(program.layout())?;

        let mut ctx = FlushContext {
            program,
            layout: layout_entry,
            pipeline_cache: self.pipeline_cache,
            vertex_descriptor: &self.current_vertex_descriptor,
        };
        self.recorder
            .flush_render_state(topology, &mut ctx, &|raw| {
                Some(vk::Buffer::from_raw(raw))
            })
    }

    // ---- Introspection ---------------------------------------------------

    /// Whether the device presents to a surface
    pub fn has_swapchain(&self) -> bool {
        self.swapchain.is_some()
    }

    /// Current swapchain extent, if presenting
    pub fn swapchain_extent(&self) -> Option<(u32, u32)> {
        self.swapchain
            .as_ref()
            .map(|swapchain| (swapchain.extent().width, swapchain.extent().height))
    }

    /// Fences ever created by the submission pool
    pub fn fence_pool_size(&self) -> usize {
        self.fence_pool.live_count()
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        // Nothing may be destroyed while in flight.
        let _ = self.wait_idle();

        for slot in &mut self.deferred {
            slot.clear();
        }

        // The swapchain's views must go before the surface.
        self.swapchain = None;

        let raw = &self.device.device;
        unsafe {
            raw.destroy_sampler(self.default_sampler, None);
            raw.destroy_pipeline_cache(self.pipeline_cache, None);
            raw.destroy_command_pool(self.command_pool, None);
        }
        if let (Some(surface), Some(loader)) = (self.surface.take(), self.surface_loader.as_ref())
        {
            unsafe {
                loader.destroy_surface(surface, None);
            }
        }
        // Remaining fields drop in declaration order: resources, caches,
        // staging, pools, allocator, logical device, instance.
    }
}
