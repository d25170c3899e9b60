//! Vulkan textures: image, memory, and the sampled view, plus layout transitions.

use std::sync::Arc;

use ash::vk;

use crate::command::ImageLayout;
use crate::error::{Result, RhiError};
use crate::format::{StorageFormat, TextureUsage};
use crate::resource::{TextureAspect, TextureDesc, TextureKind};

use super::memory::{self, Allocation};

pub struct VulkanTexture {
    pub device: Arc<ash::Device>,
    pub desc: TextureDesc,
    pub image: vk::Image,
    pub allocation: Allocation,
    /// Whole-resource view used for sampling; depth-only for depth formats.
    pub view: vk::ImageView,
    pub stencil_view: Option<vk::ImageView>,
    pub format: vk::Format,
    pub layout: ImageLayout,
}

impl VulkanTexture {
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        full_aspect(self.desc.format)
    }

    pub fn sampled_view(&self, aspect: TextureAspect) -> vk::ImageView {
        match (aspect, self.stencil_view) {
            (TextureAspect::Stencil, Some(view)) => view,
            _ => self.view,
        }
    }

    /// Every mip and layer.
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(self.aspect())
            .base_mip_level(0)
            .level_count(self.desc.mip_levels)
            .base_array_layer(0)
            .layer_count(self.desc.array_layers())
    }

    pub fn subresource(&self, mip_level: u32, first_layer: u32, layers: u32) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers::default()
            .aspect_mask(self.aspect())
            .mip_level(mip_level)
            .base_array_layer(first_layer)
            .layer_count(layers)
    }

    /// Native layout the texture rests in between operations.
    pub fn resting_layout(&self) -> vk::ImageLayout {
        layout_to_vk(self.layout, self.desc.format)
    }

    /// Single-mip, single-layer 2D view for a frame buffer attachment.
    pub fn attachment_view(&self, layer: u32, mip_level: u32) -> Result<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(self.aspect())
                    .base_mip_level(mip_level)
                    .level_count(1)
                    .base_array_layer(layer)
                    .layer_count(1),
            );
        Ok(unsafe { self.device.create_image_view(&info, None)? })
    }
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        unsafe {
            if let Some(view) = self.stencil_view {
                self.device.destroy_image_view(view, None);
            }
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
        }
        memory::free(&self.device, &self.allocation);
    }
}

impl std::fmt::Debug for VulkanTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanTexture")
            .field("desc", &self.desc)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

/// Create the image, its memory and views. `queue_families` lists every family that touches it.
pub fn create_texture(
    device: &Arc<ash::Device>,
    features: vk::FormatFeatureFlags,
    memory_props: &vk::PhysicalDeviceMemoryProperties,
    queue_families: &[u32],
    desc: &TextureDesc,
) -> Result<VulkanTexture> {
    desc.validate()?;
    let format = texture_format_to_vk(desc.format)?;
    let usage = texture_usage_to_vk(desc.usage, desc.format, features)?;

    let (image_type, extent_depth, layers, flags) = match desc.kind {
        TextureKind::D3 => (vk::ImageType::TYPE_3D, desc.depth(), 1, vk::ImageCreateFlags::empty()),
        TextureKind::Cube | TextureKind::CubeArray => {
            (vk::ImageType::TYPE_2D, 1, desc.array_layers(), vk::ImageCreateFlags::CUBE_COMPATIBLE)
        }
        _ => (vk::ImageType::TYPE_2D, 1, desc.array_layers(), vk::ImageCreateFlags::empty()),
    };
    let create_info = vk::ImageCreateInfo::default()
        .image_type(image_type)
        .format(format)
        .extent(vk::Extent3D { width: desc.width, height: desc.height, depth: extent_depth })
        .mip_levels(desc.mip_levels)
        .array_layers(layers)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .flags(flags);
    let create_info = if queue_families.len() > 1 {
        create_info.sharing_mode(vk::SharingMode::CONCURRENT).queue_family_indices(queue_families)
    } else {
        create_info.sharing_mode(vk::SharingMode::EXCLUSIVE)
    };
    let image = unsafe { device.create_image(&create_info, None)? };
    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let allocation = match memory::allocate(device, memory_props, requirements, false) {
        Ok(a) => a,
        Err(e) => {
            unsafe { device.destroy_image(image, None) };
            return Err(e);
        }
    };
    unsafe { device.bind_image_memory(image, allocation.memory, 0)? };

    let sample_aspect = if desc.format.is_depth() { vk::ImageAspectFlags::DEPTH } else { vk::ImageAspectFlags::COLOR };
    let view_of = |aspect| {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type(desc.kind))
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .base_mip_level(0)
                    .level_count(desc.mip_levels)
                    .base_array_layer(0)
                    .layer_count(layers),
            );
        unsafe { device.create_image_view(&info, None) }
    };
    let layout = if desc.usage.is_attachment() { ImageLayout::RenderAttachment } else { ImageLayout::ShaderRead };
    let view = view_of(sample_aspect);
    let stencil_view = if desc.format.has_stencil() { Some(view_of(vk::ImageAspectFlags::STENCIL)) } else { None };
    // Owned from here on, so a failed view still releases the image.
    let mut texture = VulkanTexture {
        device: device.clone(),
        desc: desc.clone(),
        image,
        allocation,
        view: vk::ImageView::null(),
        stencil_view: None,
        format,
        layout,
    };
    texture.view = view?;
    texture.stencil_view = stencil_view.transpose()?;
    Ok(texture)
}

pub fn texture_format_to_vk(format: StorageFormat) -> Result<vk::Format> {
    use StorageFormat::*;
    Ok(match format {
        R8 => vk::Format::R8_UNORM,
        RI8 => vk::Format::R8_SINT,
        R16 => vk::Format::R16_UNORM,
        RI16 => vk::Format::R16_SINT,
        Int32Raw => vk::Format::R32_SINT,
        RF16 => vk::Format::R16_SFLOAT,
        RF32 => vk::Format::R32_SFLOAT,
        Rg8 => vk::Format::R8G8_UNORM,
        Rg16 => vk::Format::R16G16_UNORM,
        RgI8 => vk::Format::R8G8_SINT,
        RgI16 => vk::Format::R16G16_SINT,
        RgI32Raw => vk::Format::R32G32_SINT,
        RgF16 => vk::Format::R16G16_SFLOAT,
        RgF32 => vk::Format::R32G32_SFLOAT,
        Rgba8 => vk::Format::R8G8B8A8_UNORM,
        RgbaI8 => vk::Format::R8G8B8A8_SINT,
        Rgba16 => vk::Format::R16G16B16A16_UNORM,
        RgbaI16 => vk::Format::R16G16B16A16_SINT,
        RgbaI32Raw => vk::Format::R32G32B32A32_SINT,
        RgbaF16 => vk::Format::R16G16B16A16_SFLOAT,
        RgbaF32 => vk::Format::R32G32B32A32_SFLOAT,
        R11fG11fB10f => vk::Format::B10G11R11_UFLOAT_PACK32,
        Rgb10A2 => vk::Format::A2B10G10R10_UNORM_PACK32,
        Bc1 => vk::Format::BC1_RGBA_UNORM_BLOCK,
        Bc3 => vk::Format::BC3_UNORM_BLOCK,
        Bc5 => vk::Format::BC5_UNORM_BLOCK,
        Depth24 => vk::Format::X8_D24_UNORM_PACK32,
        Depth32 => vk::Format::D32_SFLOAT,
        Depth24Stencil8 => vk::Format::D24_UNORM_S8_UINT,
        RgbaCompressed => return Err(RhiError::unsupported("RgbaCompressed has no Vulkan format")),
    })
}

/// Image usage for `usage`, checked against what the device supports for the format.
pub fn texture_usage_to_vk(
    usage: TextureUsage,
    format: StorageFormat,
    features: vk::FormatFeatureFlags,
) -> Result<vk::ImageUsageFlags> {
    let mut flags = vk::ImageUsageFlags::empty();
    let mut require = |wanted: bool, feature: vk::FormatFeatureFlags, flag: vk::ImageUsageFlags| {
        if !wanted {
            return Ok(());
        }
        if !features.contains(feature) {
            return Err(RhiError::unsupported(format!("{format:?} does not support {flag:?}")));
        }
        flags |= flag;
        Ok(())
    };
    require(true, vk::FormatFeatureFlags::TRANSFER_SRC, vk::ImageUsageFlags::TRANSFER_SRC)?;
    require(true, vk::FormatFeatureFlags::TRANSFER_DST, vk::ImageUsageFlags::TRANSFER_DST)?;
    require(
        usage.contains(TextureUsage::SAMPLED),
        vk::FormatFeatureFlags::SAMPLED_IMAGE,
        vk::ImageUsageFlags::SAMPLED,
    )?;
    if format.is_depth() {
        require(
            usage.is_attachment(),
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;
    } else {
        require(
            usage.is_attachment(),
            vk::FormatFeatureFlags::COLOR_ATTACHMENT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
        )?;
    }
    Ok(flags)
}

pub fn view_type(kind: TextureKind) -> vk::ImageViewType {
    match kind {
        TextureKind::D2 => vk::ImageViewType::TYPE_2D,
        TextureKind::D2Array => vk::ImageViewType::TYPE_2D_ARRAY,
        TextureKind::D3 => vk::ImageViewType::TYPE_3D,
        TextureKind::Cube => vk::ImageViewType::CUBE,
        TextureKind::CubeArray => vk::ImageViewType::CUBE_ARRAY,
    }
}

pub fn full_aspect(format: StorageFormat) -> vk::ImageAspectFlags {
    match format {
        StorageFormat::Depth24Stencil8 => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        f if f.is_depth() => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

pub fn layout_to_vk(layout: ImageLayout, format: StorageFormat) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::RenderAttachment if format.is_depth() => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ImageLayout::RenderAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }
}

/// Stage and access masks that cover every use of an image in `layout`.
fn scope(layout: vk::ImageLayout) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => (vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty()),
        _ => (vk::PipelineStageFlags::ALL_COMMANDS, vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE),
    }
}

/// Record a layout transition of `range`. Queues without graphics stages pass `transfer_only`.
pub fn transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    from: vk::ImageLayout,
    to: vk::ImageLayout,
    transfer_only: bool,
) {
    let (mut src_stage, src_access) = scope(from);
    let (mut dst_stage, dst_access) = scope(to);
    if transfer_only {
        // Only TRANSFER and the pipe ends are legal on a transfer queue.
        let allowed = vk::PipelineStageFlags::TRANSFER
            | vk::PipelineStageFlags::TOP_OF_PIPE
            | vk::PipelineStageFlags::BOTTOM_OF_PIPE;
        if !allowed.contains(src_stage) {
            src_stage = vk::PipelineStageFlags::TOP_OF_PIPE;
        }
        if !allowed.contains(dst_stage) {
            dst_stage = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
        }
    }
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(from)
        .new_layout(to)
        .src_access_mask(if transfer_only { src_access & vk::AccessFlags::TRANSFER_WRITE } else { src_access })
        .dst_access_mask(if transfer_only { dst_access & vk::AccessFlags::TRANSFER_WRITE } else { dst_access })
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range);
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_usage_needs_format_support() {
        let copy = vk::FormatFeatureFlags::TRANSFER_SRC | vk::FormatFeatureFlags::TRANSFER_DST;
        let usage = TextureUsage::SAMPLED | TextureUsage::COLOR_ATTACHMENT;
        assert!(texture_usage_to_vk(usage, StorageFormat::Rgba8, copy | vk::FormatFeatureFlags::SAMPLED_IMAGE).is_err());
        let flags = texture_usage_to_vk(
            usage,
            StorageFormat::Rgba8,
            copy | vk::FormatFeatureFlags::SAMPLED_IMAGE | vk::FormatFeatureFlags::COLOR_ATTACHMENT,
        )
        .unwrap();
        assert!(flags.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED));
        assert!(!flags.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));
    }

    #[test]
    fn depth_layouts_use_depth_attachment_optimal() {
        assert_eq!(
            layout_to_vk(ImageLayout::RenderAttachment, StorageFormat::Depth32),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            layout_to_vk(ImageLayout::RenderAttachment, StorageFormat::Rgba8),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            full_aspect(StorageFormat::Depth24Stencil8),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
