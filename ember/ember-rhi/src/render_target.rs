//! Render target layouts and the concrete attachments bound to them.

use crate::error::{Result, RhiError};
use crate::format::{StorageFormat, TextureUsage};
use crate::handle::TextureHandle;
use crate::resource::{CubeFace, TextureDesc, TextureKind};

/// One attachment slot: what it is used as, and its format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentLayout {
    pub usage: TextureUsage,
    pub format: StorageFormat,
}

impl AttachmentLayout {
    pub fn color(format: StorageFormat) -> Self {
        Self { usage: TextureUsage::COLOR_ATTACHMENT, format }
    }

    pub fn depth(format: StorageFormat) -> Self {
        let usage = if format.has_stencil() {
            TextureUsage::DEPTH_STENCIL_ATTACHMENT
        } else {
            TextureUsage::DEPTH_ATTACHMENT
        };
        Self { usage, format }
    }

    pub fn is_depth_stencil(&self) -> bool {
        self.usage.is_depth_stencil()
    }
}

/// Attachment topology, independent of the images.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderTargetLayout {
    attachments: Vec<AttachmentLayout>,
}

impl RenderTargetLayout {
    pub fn new(attachments: Vec<AttachmentLayout>) -> Result<Self> {
        if attachments.is_empty() {
            return Err(RhiError::unsupported("render target layout has no attachments"));
        }
        let mut depth_slots = 0;
        for (i, a) in attachments.iter().enumerate() {
            if !a.usage.is_attachment() {
                return Err(RhiError::unsupported(format!("attachment {i} has no attachment usage")));
            }
            if a.usage.contains(TextureUsage::COLOR_ATTACHMENT) && a.usage.is_depth_stencil() {
                return Err(RhiError::unsupported(format!(
                    "attachment {i} cannot be both color and depth/stencil"
                )));
            }
            if a.is_depth_stencil() {
                depth_slots += 1;
                if !a.format.is_depth() {
                    return Err(RhiError::unsupported(format!(
                        "depth attachment {i} uses color format {:?}",
                        a.format
                    )));
                }
                if a.usage.contains(TextureUsage::STENCIL_ATTACHMENT) && !a.format.has_stencil() {
                    return Err(RhiError::unsupported(format!("{:?} has no stencil bits", a.format)));
                }
            } else if a.format.is_depth() || a.format.is_compressed() {
                return Err(RhiError::unsupported(format!(
                    "{:?} cannot be a color attachment",
                    a.format
                )));
            }
        }
        if depth_slots > 1 {
            return Err(RhiError::unsupported("only one depth/stencil attachment per layout"));
        }
        Ok(Self { attachments })
    }

    pub fn attachments(&self) -> &[AttachmentLayout] {
        &self.attachments
    }

    pub fn color_attachments(&self) -> impl Iterator<Item = (usize, &AttachmentLayout)> {
        self.attachments.iter().enumerate().filter(|(_, a)| !a.is_depth_stencil())
    }

    pub fn depth_attachment(&self) -> Option<(usize, &AttachmentLayout)> {
        self.attachments.iter().enumerate().find(|(_, a)| a.is_depth_stencil())
    }

    pub fn color_count(&self) -> usize {
        self.color_attachments().count()
    }

    /// Pipelines and frame buffers built against structurally identical layouts are interchangeable.
    pub fn is_compatible(&self, other: &RenderTargetLayout) -> bool {
        self == other
    }
}

/// One image bound to an attachment slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentImage {
    pub texture: TextureHandle,
    /// Array layer; for cube maps `6 * cube + face`.
    pub layer: u32,
    pub mip_level: u32,
}

/// Builder for the concrete images of a frame buffer, in slot order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderAttachments {
    images: Vec<AttachmentImage>,
}

impl RenderAttachments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn texture(mut self, texture: TextureHandle) -> Self {
        self.images.push(AttachmentImage { texture, layer: 0, mip_level: 0 });
        self
    }

    pub fn layer(mut self, texture: TextureHandle, layer: u32) -> Self {
        self.images.push(AttachmentImage { texture, layer, mip_level: 0 });
        self
    }

    pub fn cube_face(mut self, texture: TextureHandle, cube: u32, face: CubeFace) -> Self {
        self.images.push(AttachmentImage { texture, layer: cube * 6 + face.layer(), mip_level: 0 });
        self
    }

    /// Render into `mip_level` of the most recently added image.
    pub fn mip(mut self, mip_level: u32) -> Self {
        if let Some(last) = self.images.last_mut() {
            last.mip_level = mip_level;
        }
        self
    }

    pub fn images(&self) -> &[AttachmentImage] {
        &self.images
    }

    /// Check the images against `layout` and return the shared extent.
    /// `lookup` resolves a handle to its description.
    pub fn check_against<'a>(
        &self,
        layout: &RenderTargetLayout,
        mut lookup: impl FnMut(TextureHandle) -> Result<&'a TextureDesc>,
    ) -> Result<(u32, u32)> {
        if self.images.len() != layout.attachments().len() {
            return Err(RhiError::contract(format!(
                "frame buffer has {} attachments, layout expects {}",
                self.images.len(),
                layout.attachments().len()
            )));
        }
        let mut extent = None;
        for (i, (image, slot)) in self.images.iter().zip(layout.attachments()).enumerate() {
            let desc = lookup(image.texture)?;
            if desc.format != slot.format {
                return Err(RhiError::contract(format!(
                    "attachment {i} format {:?} does not match layout format {:?}",
                    desc.format, slot.format
                )));
            }
            if !desc.usage.contains(slot.usage) {
                return Err(RhiError::contract(format!(
                    "attachment {i} usage {:?} lacks {:?}",
                    desc.usage, slot.usage
                )));
            }
            if desc.kind == TextureKind::D3 {
                return Err(RhiError::unsupported("3D textures cannot be attachments"));
            }
            if image.mip_level >= desc.mip_levels || image.layer >= desc.array_layers() {
                return Err(RhiError::contract(format!(
                    "attachment {i} selects layer {} mip {} outside the texture",
                    image.layer, image.mip_level
                )));
            }
            let (w, h, _) = desc.mip_extent(image.mip_level);
            match extent {
                None => extent = Some((w, h)),
                Some(e) if e != (w, h) => {
                    return Err(RhiError::contract("attachment images must have the same dimensions"))
                }
                Some(_) => {}
            }
        }
        extent.ok_or_else(|| RhiError::contract("frame buffer has no attachments"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;
    use std::collections::HashMap;

    #[test]
    fn one_depth_attachment_per_layout() {
        let err = RenderTargetLayout::new(vec![
            AttachmentLayout::color(StorageFormat::Rgba8),
            AttachmentLayout::depth(StorageFormat::Depth32),
            AttachmentLayout::depth(StorageFormat::Depth24Stencil8),
        ])
        .unwrap_err();
        assert!(matches!(err, RhiError::Unsupported(_)));
    }

    #[test]
    fn depth_format_in_color_slot_is_rejected() {
        assert!(RenderTargetLayout::new(vec![AttachmentLayout::color(StorageFormat::Depth32)]).is_err());
    }

    #[test]
    fn structural_compatibility() {
        let a = RenderTargetLayout::new(vec![AttachmentLayout::color(StorageFormat::Rgba8)]).unwrap();
        let b = RenderTargetLayout::new(vec![AttachmentLayout::color(StorageFormat::Rgba8)]).unwrap();
        let c = RenderTargetLayout::new(vec![AttachmentLayout::color(StorageFormat::RgbaF16)]).unwrap();
        assert!(a.is_compatible(&b));
        assert!(!a.is_compatible(&c));
    }

    #[test]
    fn frame_buffer_checks() {
        let mut handles: SlotMap<TextureHandle, ()> = SlotMap::with_key();
        let color = handles.insert(());
        let small = handles.insert(());
        let depth = handles.insert(());
        let mut descs = HashMap::new();
        descs.insert(color, TextureDesc::d2(TextureUsage::SAMPLED_COLOR_ATTACHMENT, 256, 256, 2, StorageFormat::Rgba8));
        descs.insert(small, TextureDesc::d2(TextureUsage::COLOR_ATTACHMENT, 128, 128, 1, StorageFormat::Rgba8));
        descs.insert(depth, TextureDesc::d2(TextureUsage::DEPTH_ATTACHMENT, 256, 256, 1, StorageFormat::Depth32));
        let lookup = |h: TextureHandle| descs.get(&h).ok_or(RhiError::InvalidHandle("texture"));

        let layout = RenderTargetLayout::new(vec![
            AttachmentLayout::color(StorageFormat::Rgba8),
            AttachmentLayout::depth(StorageFormat::Depth32),
        ])
        .unwrap();

        let ok = RenderAttachments::new().texture(color).texture(depth);
        assert_eq!(ok.check_against(&layout, lookup).unwrap(), (256, 256));

        let swapped = RenderAttachments::new().texture(depth).texture(color);
        assert!(swapped.check_against(&layout, lookup).is_err());

        let mismatched = RenderAttachments::new().texture(small).texture(depth);
        let err = mismatched.check_against(&layout, lookup).unwrap_err();
        assert!(err.to_string().contains("same dimensions"));

        let color_only = RenderTargetLayout::new(vec![AttachmentLayout::color(StorageFormat::Rgba8)]).unwrap();
        let mip_one = RenderAttachments::new().texture(color).mip(1);
        assert_eq!(mip_one.check_against(&color_only, lookup).unwrap(), (128, 128));
    }
}
