//! Content-addressed render-pass and framebuffer caches
//!
//! Render passes are keyed purely by attachment structure (format and
//! load/store actions per slot), never by concrete texture identity, so
//! structurally identical descriptors share one object. Framebuffers key on
//! the render-pass key plus the concrete attachment views. Both caches are
//! create-once and live for the device's lifetime.

use ash::vk::{self, Handle};
use ash::Device;
use std::collections::HashMap;

use crate::render::types::{LoadAction, PixelFormat, StoreAction};
use crate::render::vulkan::context::{VulkanError, VulkanResult};
use crate::render::vulkan::texture::translate_pixel_format;

/// Translate an engine load action to the Vulkan op.
pub fn translate_load_action(action: LoadAction) -> vk::AttachmentLoadOp {
    match action {
        LoadAction::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        LoadAction::Load => vk::AttachmentLoadOp::LOAD,
        LoadAction::Clear => vk::AttachmentLoadOp::CLEAR,
    }
}

/// Translate an engine store action to the Vulkan op.
pub fn translate_store_action(action: StoreAction) -> vk::AttachmentStoreOp {
    match action {
        StoreAction::DontCare => vk::AttachmentStoreOp::DONT_CARE,
        StoreAction::Store => vk::AttachmentStoreOp::STORE,
    }
}

/// Structure of one attachment slot, the unit of render-pass identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentKey {
    /// Attachment format
    pub format: PixelFormat,
    /// Load behavior
    pub load_action: LoadAction,
    /// Store behavior
    pub store_action: StoreAction,
}

/// Content key for a render pass
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RenderPassKey {
    /// Active color attachment slots, in slot order
    pub colors: Vec<AttachmentKey>,
    /// Depth-stencil attachment, if present
    pub depth_stencil: Option<AttachmentKey>,
    /// Whether color results are handed to presentation
    pub present: bool,
}

/// Cache of render passes keyed by attachment structure
pub struct RenderPassCache {
    device: Device,
    passes: HashMap<RenderPassKey, vk::RenderPass>,
}

impl RenderPassCache {
    /// Create an empty cache for a device.
    pub fn new(device: Device) -> Self {
        Self {
            device,
            passes: HashMap::new(),
        }
    }

    /// Look up or create the render pass for a key.
    ///
    /// Two keys that compare equal always yield the same `vk::RenderPass`.
    pub fn request_render_pass(&mut self, key: &RenderPassKey) -> VulkanResult<vk::RenderPass> {
        if let Some(&pass) = self.passes.get(key) {
            return Ok(pass);
        }

        let pass = self.create_render_pass(key)?;
        log::debug!(
            "[Vulkan] Created render pass ({} color, depth: {})",
            key.colors.len(),
            key.depth_stencil.is_some()
        );
        self.passes.insert(key.clone(), pass);
        Ok(pass)
    }

    fn create_render_pass(&self, key: &RenderPassKey) -> VulkanResult<vk::RenderPass> {
        let color_final_layout = if key.present {
            vk::ImageLayout::PRESENT_SRC_KHR
        } else {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        };

        let mut attachments = Vec::new();
        let mut color_refs = Vec::new();
        for color in &key.colors {
            color_refs.push(vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            });
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(translate_pixel_format(color.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(translate_load_action(color.load_action))
                    .store_op(translate_store_action(color.store_action))
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(color_final_layout)
                    .build(),
            );
        }

        let depth_ref = key.depth_stencil.map(|depth| {
            let reference = vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            };
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(translate_pixel_format(depth.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(translate_load_action(depth.load_action))
                    .store_op(translate_store_action(depth.store_action))
                    .stencil_load_op(translate_load_action(depth.load_action))
                    .stencil_store_op(translate_store_action(depth.store_action))
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .build(),
            );
            reference
        });

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(ref depth_ref) = depth_ref {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }
        let subpasses = [subpass.build()];

        // External dependencies serializing on color-attachment output let a
        // pass safely follow or precede presentation without call-site
        // barriers.
        let dependencies = [
            vk::SubpassDependency {
                src_subpass: vk::SUBPASS_EXTERNAL,
                dst_subpass: 0,
                src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                src_access_mask: vk::AccessFlags::empty(),
                dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dependency_flags: vk::DependencyFlags::empty(),
            },
            vk::SubpassDependency {
                src_subpass: 0,
                dst_subpass: vk::SUBPASS_EXTERNAL,
                src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access_mask: vk::AccessFlags::empty(),
                dependency_flags: vk::DependencyFlags::empty(),
            },
        ];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        unsafe {
            self.device
                .create_render_pass(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    /// Number of cached render passes
    pub fn len(&self) -> usize {
        self.passes.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

impl Drop for RenderPassCache {
    fn drop(&mut self) {
        unsafe {
            for (_, pass) in self.passes.drain() {
                self.device.destroy_render_pass(pass, None);
            }
        }
    }
}

/// Clear values matching a render pass's attachment order
pub fn attachment_clear_values(
    colors: &[[f32; 4]],
    depth_stencil: Option<(f32, u32)>,
) -> Vec<vk::ClearValue> {
    let mut values: Vec<vk::ClearValue> = colors
        .iter()
        .map(|&float32| vk::ClearValue {
            color: vk::ClearColorValue { float32 },
        })
        .collect();
    if let Some((depth, stencil)) = depth_stencil {
        values.push(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        });
    }
    values
}

/// Framebuffer extent from attachment mip dimensions: the minimum over all
/// attachments. Mismatched sizes clamp to the smallest common area rather
/// than erroring.
pub fn framebuffer_extent(dimensions: &[(u32, u32)]) -> vk::Extent2D {
    let width = dimensions.iter().map(|&(w, _)| w).min().unwrap_or(0);
    let height = dimensions.iter().map(|&(_, h)| h).min().unwrap_or(0);
    vk::Extent2D { width, height }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FramebufferKey {
    render_pass: u64,
    attachments: Vec<u64>,
}

/// Cache of framebuffers keyed by render pass and attachment views
pub struct FramebufferCache {
    device: Device,
    framebuffers: HashMap<FramebufferKey, (vk::Framebuffer, vk::Extent2D)>,
}

impl FramebufferCache {
    /// Create an empty cache for a device.
    pub fn new(device: Device) -> Self {
        Self {
            device,
            framebuffers: HashMap::new(),
        }
    }

    /// Look up or create a framebuffer binding concrete views to a pass.
    ///
    /// `attachments` pairs each view with the dimensions of the attached mip
    /// level; the framebuffer extent is their minimum.
    pub fn request_framebuffer(
        &mut self,
        render_pass: vk::RenderPass,
        attachments: &[(vk::ImageView, (u32, u32))],
    ) -> VulkanResult<(vk::Framebuffer, vk::Extent2D)> {
        if attachments.is_empty() {
            return Err(VulkanError::InvalidOperation {
                reason: "framebuffer needs at least one attachment".to_string(),
            });
        }

        let key = FramebufferKey {
            render_pass: render_pass.as_raw(),
            attachments: attachments.iter().map(|(view, _)| view.as_raw()).collect(),
        };
        if let Some(&entry) = self.framebuffers.get(&key) {
            return Ok(entry);
        }

        let dimensions: Vec<(u32, u32)> = attachments.iter().map(|&(_, dims)| dims).collect();
        let extent = framebuffer_extent(&dimensions);
        let views: Vec<vk::ImageView> = attachments.iter().map(|&(view, _)| view).collect();

        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let framebuffer = unsafe {
            self.device
                .create_framebuffer(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        log::debug!(
            "[Vulkan] Created framebuffer {}x{} ({} attachments)",
            extent.width,
            extent.height,
            attachments.len()
        );
        self.framebuffers.insert(key, (framebuffer, extent));
        Ok((framebuffer, extent))
    }
}

impl Drop for FramebufferCache {
    fn drop(&mut self) {
        unsafe {
            for (_, (framebuffer, _)) in self.framebuffers.drain() {
                self.device.destroy_framebuffer(framebuffer, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_key(key: &RenderPassKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn color(format: PixelFormat) -> AttachmentKey {
        AttachmentKey {
            format,
            load_action: LoadAction::Clear,
            store_action: StoreAction::Store,
        }
    }

    #[test]
    fn structurally_identical_keys_are_interchangeable() {
        let first = RenderPassKey {
            colors: vec![color(PixelFormat::Bgra8Srgb)],
            depth_stencil: Some(color(PixelFormat::Depth32Float)),
            present: true,
        };
        let second = RenderPassKey {
            colors: vec![color(PixelFormat::Bgra8Srgb)],
            depth_stencil: Some(color(PixelFormat::Depth32Float)),
            present: true,
        };
        assert_eq!(first, second);
        assert_eq!(hash_key(&first), hash_key(&second));
    }

    #[test]
    fn load_action_changes_the_key() {
        let cleared = RenderPassKey {
            colors: vec![color(PixelFormat::Bgra8Srgb)],
            depth_stencil: None,
            present: false,
        };
        let mut loaded = cleared.clone();
        loaded.colors[0].load_action = LoadAction::Load;
        assert_ne!(cleared, loaded);
    }

    #[test]
    fn slot_order_is_part_of_the_key() {
        let forward = RenderPassKey {
            colors: vec![color(PixelFormat::Bgra8Srgb), color(PixelFormat::Rgba16Float)],
            depth_stencil: None,
            present: false,
        };
        let reversed = RenderPassKey {
            colors: vec![color(PixelFormat::Rgba16Float), color(PixelFormat::Bgra8Srgb)],
            depth_stencil: None,
            present: false,
        };
        assert_ne!(forward, reversed);
    }

    #[test]
    fn framebuffer_extent_clamps_to_smallest_attachment() {
        let extent = framebuffer_extent(&[(256, 256), (128, 128)]);
        assert_eq!(extent.width, 128);
        assert_eq!(extent.height, 128);
    }

    #[test]
    fn clear_values_follow_attachment_order() {
        let values = attachment_clear_values(&[[1.0, 0.0, 0.0, 1.0]], Some((1.0, 0)));
        assert_eq!(values.len(), 2);
        unsafe {
            assert_eq!(values[0].color.float32, [1.0, 0.0, 0.0, 1.0]);
            assert_eq!(values[1].depth_stencil.depth, 1.0);
        }
    }
}
