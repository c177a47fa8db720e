//! Texture resources
//!
//! Images and image views backed by VMA allocations, plus non-owning
//! wrappers around swapchain back-buffer images.

use ash::{vk, Device};

use crate::render::types::{PixelFormat, TextureDescriptor, TextureType, TextureUsage};
use crate::render::vulkan::allocator::MemoryAllocator;
use crate::render::vulkan::context::{VulkanError, VulkanResult};

/// Translate an engine pixel format to its Vulkan format.
pub fn translate_pixel_format(format: PixelFormat) -> vk::Format {
    match format {
        PixelFormat::Undefined => vk::Format::UNDEFINED,
        PixelFormat::R8Unorm => vk::Format::R8_UNORM,
        PixelFormat::Rg8Unorm => vk::Format::R8G8_UNORM,
        PixelFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        PixelFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        PixelFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        PixelFormat::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        PixelFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        PixelFormat::Depth32Float => vk::Format::D32_SFLOAT,
        PixelFormat::Depth24UnormStencil8 => vk::Format::D24_UNORM_S8_UINT,
    }
}

/// Map a Vulkan surface format back to the engine enum; `Undefined` when the
/// format has no engine-level counterpart.
pub fn engine_pixel_format(format: vk::Format) -> PixelFormat {
    match format {
        vk::Format::R8_UNORM => PixelFormat::R8Unorm,
        vk::Format::R8G8_UNORM => PixelFormat::Rg8Unorm,
        vk::Format::R8G8B8A8_UNORM => PixelFormat::Rgba8Unorm,
        vk::Format::R8G8B8A8_SRGB => PixelFormat::Rgba8Srgb,
        vk::Format::B8G8R8A8_UNORM => PixelFormat::Bgra8Unorm,
        vk::Format::B8G8R8A8_SRGB => PixelFormat::Bgra8Srgb,
        vk::Format::R16G16B16A16_SFLOAT => PixelFormat::Rgba16Float,
        vk::Format::D32_SFLOAT => PixelFormat::Depth32Float,
        vk::Format::D24_UNORM_S8_UINT => PixelFormat::Depth24UnormStencil8,
        _ => PixelFormat::Undefined,
    }
}

/// Image aspect implied by the pixel format.
pub fn format_aspect_mask(format: PixelFormat) -> vk::ImageAspectFlags {
    if format.is_depth() {
        if format.is_stencil() {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        }
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Translate engine texture usage into Vulkan image usage flags.
///
/// RENDER_TARGET maps to color or depth-stencil attachment depending on the
/// format; TRANSFER_DST is always added so textures can be filled.
pub fn translate_texture_usage(usage: TextureUsage, format: PixelFormat) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::TRANSFER_DST;
    if usage.contains(TextureUsage::SAMPLED) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::RENDER_TARGET) {
        if format.is_depth() {
            flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        } else {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
    }
    flags
}

/// Dimension of one mip level of a base dimension.
pub fn mip_dimension(base: u32, level: u32) -> u32 {
    (base >> level).max(1)
}

/// Texture resource: image, memory, and a full-resource view
pub struct Texture {
    device: Device,
    allocator: Option<MemoryAllocator>,
    image: vk::Image,
    allocation: Option<vk_mem::Allocation>,
    view: vk::ImageView,
    format: PixelFormat,
    width: u32,
    height: u32,
    mip_levels: u32,
}

impl Texture {
    /// Create a texture from its descriptor.
    pub fn new(
        device: Device,
        allocator: &MemoryAllocator,
        descriptor: &TextureDescriptor,
    ) -> VulkanResult<Self> {
        if descriptor.width == 0 || descriptor.height == 0 {
            return Err(VulkanError::InvalidOperation {
                reason: "texture dimensions must be nonzero".to_string(),
            });
        }

        let image_type = match descriptor.texture_type {
            TextureType::Type1D => vk::ImageType::TYPE_1D,
            TextureType::Type2D | TextureType::TypeCube => vk::ImageType::TYPE_2D,
            TextureType::Type3D => vk::ImageType::TYPE_3D,
        };
        let (depth, array_layers) = match descriptor.texture_type {
            TextureType::Type3D => (descriptor.depth_or_array_size, 1),
            TextureType::TypeCube => (1, descriptor.depth_or_array_size * 6),
            _ => (1, descriptor.depth_or_array_size),
        };

        let format = translate_pixel_format(descriptor.format);
        let mut create_flags = vk::ImageCreateFlags::empty();
        if descriptor.texture_type == TextureType::TypeCube {
            create_flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        }

        let image_info = vk::ImageCreateInfo::builder()
            .flags(create_flags)
            .image_type(image_type)
            .format(format)
            .extent(vk::Extent3D {
                width: descriptor.width,
                height: descriptor.height,
                depth,
            })
            .mip_levels(descriptor.mip_levels.max(1))
            .array_layers(array_layers.max(1))
            .samples(vk::SampleCountFlags::from_raw(descriptor.sample_count.max(1)))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(translate_texture_usage(descriptor.usage, descriptor.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let (image, allocation) = allocator.create_image(&image_info)?;

        let view = match Self::create_view(
            &device,
            image,
            format,
            format_aspect_mask(descriptor.format),
            descriptor.mip_levels.max(1),
            array_layers.max(1),
        ) {
            Ok(view) => view,
            Err(e) => {
                let mut allocation = allocation;
                allocator.destroy_image(image, &mut allocation);
                return Err(e);
            }
        };

        Ok(Self {
            device,
            allocator: Some(allocator.clone()),
            image,
            allocation: Some(allocation),
            view,
            format: descriptor.format,
            width: descriptor.width,
            height: descriptor.height,
            mip_levels: descriptor.mip_levels.max(1),
        })
    }

    /// Wrap a swapchain back-buffer image.
    ///
    /// The image is owned by the swapchain; only the view is destroyed on
    /// drop.
    pub fn from_swapchain_image(
        device: Device,
        image: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> VulkanResult<Self> {
        let view =
            Self::create_view(&device, image, format, vk::ImageAspectFlags::COLOR, 1, 1)?;

        Ok(Self {
            device,
            allocator: None,
            image,
            allocation: None,
            view,
            format: engine_pixel_format(format),
            width: extent.width,
            height: extent.height,
            mip_levels: 1,
        })
    }

    fn create_view(
        device: &Device,
        image: vk::Image,
        format: vk::Format,
        aspect_mask: vk::ImageAspectFlags,
        mip_levels: u32,
        array_layers: u32,
    ) -> VulkanResult<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(if array_layers == 6 {
                vk::ImageViewType::CUBE
            } else {
                vk::ImageViewType::TYPE_2D
            })
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: array_layers,
            });

        unsafe {
            device
                .create_image_view(&view_info, None)
                .map_err(VulkanError::Api)
        }
    }

    /// Get the image handle
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Get the full-resource view
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Pixel format
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Base width in texels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Base height in texels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Dimensions of one mip level
    pub fn mip_level_dimensions(&self, level: u32) -> (u32, u32) {
        let level = level.min(self.mip_levels - 1);
        (mip_dimension(self.width, level), mip_dimension(self.height, level))
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
        }
        if let (Some(allocator), Some(allocation)) = (&self.allocator, &mut self.allocation) {
            allocator.destroy_image(self.image, allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_translation_round_trips() {
        for format in [
            PixelFormat::Rgba8Unorm,
            PixelFormat::Bgra8Srgb,
            PixelFormat::Rgba16Float,
            PixelFormat::Depth32Float,
            PixelFormat::Depth24UnormStencil8,
        ] {
            assert_eq!(engine_pixel_format(translate_pixel_format(format)), format);
        }
    }

    #[test]
    fn depth_formats_use_depth_aspect() {
        assert_eq!(
            format_aspect_mask(PixelFormat::Depth32Float),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            format_aspect_mask(PixelFormat::Depth24UnormStencil8),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(format_aspect_mask(PixelFormat::Rgba8Unorm), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn render_target_usage_follows_format() {
        let color = translate_texture_usage(TextureUsage::RENDER_TARGET, PixelFormat::Bgra8Srgb);
        assert!(color.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));

        let depth = translate_texture_usage(TextureUsage::RENDER_TARGET, PixelFormat::Depth32Float);
        assert!(depth.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));
    }

    #[test]
    fn mip_dimensions_clamp_to_one() {
        assert_eq!(mip_dimension(256, 0), 256);
        assert_eq!(mip_dimension(256, 4), 16);
        assert_eq!(mip_dimension(256, 12), 1);
    }
}
