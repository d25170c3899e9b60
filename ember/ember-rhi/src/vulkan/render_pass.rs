//! One `vk::RenderPass` per render target layout, and the frame buffers built against it.
//! Attachments always load and store; clears are recorded as `vkCmdClearAttachments` so the
//! same secondary works whatever the previous contents were.

use std::sync::Arc;

use ash::vk;

use crate::error::Result;
use crate::handle::{RenderTargetLayoutHandle, TextureHandle};
use crate::render_target::RenderTargetLayout;

use super::texture::texture_format_to_vk;

pub struct VulkanRenderPass {
    pub device: Arc<ash::Device>,
    pub raw: vk::RenderPass,
    pub layout: RenderTargetLayout,
}

impl Drop for VulkanRenderPass {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_render_pass(self.raw, None);
        }
    }
}

impl std::fmt::Debug for VulkanRenderPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanRenderPass").field("layout", &self.layout).finish()
    }
}

pub fn attachment_layout(depth: bool) -> vk::ImageLayout {
    if depth {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    }
}

pub fn create_render_pass(device: &Arc<ash::Device>, layout: &RenderTargetLayout) -> Result<VulkanRenderPass> {
    let mut attachments = Vec::with_capacity(layout.attachments().len());
    let mut color_refs = Vec::new();
    let mut depth_ref = None;
    for (i, slot) in layout.attachments().iter().enumerate() {
        let depth = slot.is_depth_stencil();
        let image_layout = attachment_layout(depth);
        let (stencil_load, stencil_store) = if slot.format.has_stencil() {
            (vk::AttachmentLoadOp::LOAD, vk::AttachmentStoreOp::STORE)
        } else {
            (vk::AttachmentLoadOp::DONT_CARE, vk::AttachmentStoreOp::DONT_CARE)
        };
        attachments.push(
            vk::AttachmentDescription::default()
                .format(texture_format_to_vk(slot.format)?)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(stencil_load)
                .stencil_store_op(stencil_store)
                .initial_layout(image_layout)
                .final_layout(image_layout),
        );
        let reference = vk::AttachmentReference::default().attachment(i as u32).layout(image_layout);
        if depth {
            depth_ref = Some(reference);
        } else {
            color_refs.push(reference);
        }
    }
    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if let Some(depth_ref) = depth_ref.as_ref() {
        subpass = subpass.depth_stencil_attachment(depth_ref);
    }
    let graphics = vk::PipelineStageFlags::ALL_GRAPHICS;
    let dependencies = [
        vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::ALL_COMMANDS)
            .dst_stage_mask(graphics)
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE),
        vk::SubpassDependency::default()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(graphics)
            .dst_stage_mask(vk::PipelineStageFlags::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE),
    ];
    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(std::slice::from_ref(&subpass))
        .dependencies(&dependencies);
    let raw = unsafe { device.create_render_pass(&create_info, None)? };
    Ok(VulkanRenderPass { device: device.clone(), raw, layout: layout.clone() })
}

pub struct VulkanFrameBuffer {
    pub device: Arc<ash::Device>,
    pub layout: RenderTargetLayoutHandle,
    pub raw: vk::Framebuffer,
    /// Owned single-mip, single-layer views, in slot order.
    pub views: Vec<vk::ImageView>,
    pub textures: Vec<TextureHandle>,
    pub extent: (u32, u32),
}

impl VulkanFrameBuffer {
    pub fn render_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D { width: self.extent.0, height: self.extent.1 },
        }
    }
}

impl Drop for VulkanFrameBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_framebuffer(self.raw, None);
            for view in self.views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
        }
    }
}

impl std::fmt::Debug for VulkanFrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanFrameBuffer")
            .field("extent", &self.extent)
            .field("attachments", &self.textures.len())
            .finish()
    }
}

/// Wrap `views` (already created, now owned by the frame buffer) into a native frame buffer.
pub fn create_frame_buffer(
    device: &Arc<ash::Device>,
    render_pass: vk::RenderPass,
    layout: RenderTargetLayoutHandle,
    views: Vec<vk::ImageView>,
    textures: Vec<TextureHandle>,
    extent: (u32, u32),
) -> Result<VulkanFrameBuffer> {
    let mut frame_buffer = VulkanFrameBuffer {
        device: device.clone(),
        layout,
        raw: vk::Framebuffer::null(),
        views,
        textures,
        extent,
    };
    let create_info = vk::FramebufferCreateInfo::default()
        .render_pass(render_pass)
        .attachments(&frame_buffer.views)
        .width(extent.0)
        .height(extent.1)
        .layers(1);
    frame_buffer.raw = unsafe { device.create_framebuffer(&create_info, None)? };
    Ok(frame_buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_layouts_follow_slot_kind() {
        assert_eq!(attachment_layout(true), vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        assert_eq!(attachment_layout(false), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }
}
