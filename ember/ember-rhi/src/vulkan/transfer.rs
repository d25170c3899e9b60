//! The per-version transfer stream (staged uploads recorded between `begin_data_transfer` and
//! `end_data_transfer`), blocking read-backs, and the texture operations that run immediately.

use ash::vk;

use crate::command::{Blit, ClearValue};
use crate::error::{Result, RhiError};
use crate::format::{BufferUsage, StorageFormat};
use crate::handle::{BufferHandle, TextureHandle};
use crate::resource::{buffer_range_end, TextureKind, TextureRegion};

use super::buffer::{create_buffer, VulkanBuffer};
use super::record::{record_blit, region_box};
use super::submit::full_barrier;
use super::texture::{transition, VulkanTexture};
use super::VulkanRenderer;

/// Staging offsets are aligned for every texel size and for `vkCmdCopyBuffer`.
const STAGING_ALIGN: u64 = 16;

/// Aspect used for buffer/image copies. Depth-stencil images copy their depth plane.
fn copy_aspect(format: StorageFormat) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

fn region_copy(texture: &VulkanTexture, region: &TextureRegion, buffer_offset: u64) -> (vk::BufferImageCopy, vk::ImageSubresourceRange) {
    let (offset, extent, first_layer, layers) =
        region_box(texture.desc.kind, [region.x, region.y, region.z], [region.width, region.height, region.depth]);
    let subresource = vk::ImageSubresourceLayers::default()
        .aspect_mask(copy_aspect(texture.desc.format))
        .mip_level(region.mip_level)
        .base_array_layer(first_layer)
        .layer_count(layers);
    let copy = vk::BufferImageCopy::default()
        .buffer_offset(buffer_offset)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(subresource)
        .image_offset(offset)
        .image_extent(extent);
    let range = vk::ImageSubresourceRange::default()
        .aspect_mask(texture.aspect())
        .base_mip_level(region.mip_level)
        .level_count(1)
        .base_array_layer(first_layer)
        .layer_count(layers);
    (copy, range)
}

fn record_buffer_to_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: vk::Buffer,
    texture: &VulkanTexture,
    region: &TextureRegion,
    src_offset: u64,
    transfer_only: bool,
) {
    let (copy, range) = region_copy(texture, region, src_offset);
    let resting = texture.resting_layout();
    let dst = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
    transition(device, cmd, texture.image, range, resting, dst, transfer_only);
    unsafe { device.cmd_copy_buffer_to_image(cmd, src, texture.image, dst, &[copy]) };
    transition(device, cmd, texture.image, range, dst, resting, transfer_only);
}

/// Transfer writes earlier in the stream finish before the next copy starts.
fn transfer_write_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE);
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

impl VulkanRenderer {
    pub(super) fn begin_transfer_stream(&mut self) -> Result<()> {
        let v = self.versions.current() as usize;
        self.frames[v].begin_transfer()
    }

    /// Close and submit the current version's transfer stream, signalling its semaphore.
    pub(super) fn end_transfer_stream(&mut self) -> Result<()> {
        let v = self.versions.current();
        let device = self.ctx.device.clone();
        if !self.frames[v as usize].transfer_recording {
            return Ok(());
        }
        if self.transfer_signals.release(v) {
            // The last signal of this version was never waited on; consume it before re-signalling.
            let waits = [self.frames[v as usize].transfer_semaphore];
            let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
            let submit = vk::SubmitInfo::default().wait_semaphores(&waits).wait_dst_stage_mask(&stages);
            unsafe { device.queue_submit(self.ctx.graphics_queue, &[submit], vk::Fence::null())? };
            log::trace!("dropped unconsumed transfer signal of version {v}");
        }
        let frame = &mut self.frames[v as usize];
        frame.transfer_recording = false;
        unsafe { device.end_command_buffer(frame.transfer_cmd)? };
        let cmds = [frame.transfer_cmd];
        let signals = [frame.transfer_semaphore];
        let submit = vk::SubmitInfo::default().command_buffers(&cmds).signal_semaphores(&signals);
        unsafe { device.queue_submit(self.ctx.transfer_queue, &[submit], frame.transfer_fence)? };
        self.transfer_signals.signal(v);
        Ok(())
    }

    /// Whether the current version's transfer stream is accepting commands.
    fn stream_open(&self) -> bool {
        self.frames[self.versions.current() as usize].transfer_recording
    }

    pub(super) fn upload_buffer(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let buffer = self.buffer(handle)?;
        buffer_range_end("write", offset, data.len() as u64, buffer.size)?;
        if data.is_empty() {
            return Ok(());
        }
        if buffer.host_visible() {
            return buffer.write_mapped(offset, data);
        }
        let dst = buffer.buffer;
        if !self.stream_open() {
            // Only reachable with validation off: write synchronously instead.
            let staging = self.host_buffer(data.len() as u64)?;
            staging.write_mapped(0, data)?;
            let device = &self.ctx.device;
            let region = vk::BufferCopy { src_offset: 0, dst_offset: offset, size: data.len() as u64 };
            return self.one_shot(|cmd| {
                full_barrier(device, cmd);
                unsafe { device.cmd_copy_buffer(cmd, staging.buffer, dst, &[region]) };
                Ok(())
            });
        }
        let families = self.ctx.queue_families();
        let device = &self.ctx.device;
        let frame = &mut self.frames[self.versions.current() as usize];
        let (src, src_offset) = frame.staging.stage(device, &self.ctx.memory_props, &families, data, STAGING_ALIGN)?;
        let region = vk::BufferCopy { src_offset, dst_offset: offset, size: data.len() as u64 };
        transfer_write_barrier(device, frame.transfer_cmd);
        unsafe { device.cmd_copy_buffer(frame.transfer_cmd, src, dst, &[region]) };
        Ok(())
    }

    pub(super) fn upload_texture(&mut self, handle: TextureHandle, region: TextureRegion, data: &[u8]) -> Result<()> {
        if !self.stream_open() {
            let staging = self.host_buffer(data.len() as u64)?;
            staging.write_mapped(0, data)?;
            let texture = self.texture(handle)?;
            let device = &self.ctx.device;
            return self.one_shot(|cmd| {
                record_buffer_to_image(device, cmd, staging.buffer, texture, &region, 0, false);
                Ok(())
            });
        }
        let families = self.ctx.queue_families();
        let transfer_only = self.ctx.transfer_only();
        let device = &self.ctx.device;
        let texture = self.textures.get(handle).ok_or(RhiError::InvalidHandle("texture"))?;
        let frame = &mut self.frames[self.versions.current() as usize];
        let (src, src_offset) = frame.staging.stage(device, &self.ctx.memory_props, &families, data, STAGING_ALIGN)?;
        transfer_write_barrier(device, frame.transfer_cmd);
        record_buffer_to_image(device, frame.transfer_cmd, src, texture, &region, src_offset, transfer_only);
        Ok(())
    }

    /// A host-visible buffer for synchronous copies. Dropped by the caller.
    fn host_buffer(&self, size: u64) -> Result<VulkanBuffer> {
        create_buffer(&self.ctx.device, &self.ctx.memory_props, &self.ctx.queue_families(), size, BufferUsage::empty(), true)
    }

    pub(super) fn read_buffer(&mut self, handle: BufferHandle, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.wait_idle()?;
        let buffer = self.buffer(handle)?;
        buffer_range_end("read", offset, len, buffer.size)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        if buffer.host_visible() {
            return buffer.read_mapped(offset, len);
        }
        let src = buffer.buffer;
        let staging = self.host_buffer(len)?;
        let device = &self.ctx.device;
        let region = vk::BufferCopy { src_offset: offset, dst_offset: 0, size: len };
        self.one_shot(|cmd| {
            unsafe { device.cmd_copy_buffer(cmd, src, staging.buffer, &[region]) };
            full_barrier(device, cmd);
            Ok(())
        })?;
        staging.read_mapped(0, len)
    }

    pub(super) fn read_texture(&mut self, handle: TextureHandle, region: TextureRegion) -> Result<Vec<u8>> {
        self.wait_idle()?;
        let texture = self.texture(handle)?;
        region.check_within(&texture.desc)?;
        let texel = u64::from(texture.desc.format.texel_size()?);
        let size = region.texel_count() * texel;
        if size == 0 {
            return Ok(Vec::new());
        }
        let staging = self.host_buffer(size)?;
        let device = &self.ctx.device;
        let (copy, range) = region_copy(texture, &region, 0);
        let resting = texture.resting_layout();
        self.one_shot(|cmd| {
            let src = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
            transition(device, cmd, texture.image, range, resting, src, false);
            unsafe { device.cmd_copy_image_to_buffer(cmd, texture.image, src, staging.buffer, &[copy]) };
            transition(device, cmd, texture.image, range, src, resting, false);
            full_barrier(device, cmd);
            Ok(())
        })?;
        staging.read_mapped(0, size)
    }

    /// Move a fresh image from `UNDEFINED` into its resting layout.
    pub(super) fn init_texture_layout(&self, texture: &VulkanTexture) -> Result<()> {
        let device = &self.ctx.device;
        self.one_shot(|cmd| {
            transition(device, cmd, texture.image, texture.full_range(), vk::ImageLayout::UNDEFINED, texture.resting_layout(), false);
            Ok(())
        })
    }

    pub(super) fn clear_now(&mut self, handle: TextureHandle, value: ClearValue) -> Result<()> {
        let texture = self.texture(handle)?;
        let depth_value = matches!(value, ClearValue::DepthStencil { .. });
        if depth_value != texture.desc.format.is_depth() {
            return Err(RhiError::contract(format!("{value:?} does not match {:?}", texture.desc.format)));
        }
        if texture.desc.format.is_compressed() {
            return Err(RhiError::unsupported(format!("cannot clear {:?} textures", texture.desc.format)));
        }
        let device = &self.ctx.device;
        let range = texture.full_range();
        let resting = texture.resting_layout();
        let integer = texture.desc.format.is_integer();
        self.one_shot(|cmd| {
            let dst = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
            transition(device, cmd, texture.image, range, resting, dst, false);
            match value {
                ClearValue::Color(rgba) => {
                    let color = if integer {
                        vk::ClearColorValue { int32: rgba.map(|c| c as i32) }
                    } else {
                        vk::ClearColorValue { float32: rgba }
                    };
                    unsafe { device.cmd_clear_color_image(cmd, texture.image, dst, &color, &[range]) };
                }
                ClearValue::DepthStencil { depth, stencil } => {
                    let value = vk::ClearDepthStencilValue { depth, stencil };
                    unsafe { device.cmd_clear_depth_stencil_image(cmd, texture.image, dst, &value, &[range]) };
                }
            }
            transition(device, cmd, texture.image, range, dst, resting, false);
            Ok(())
        })
    }

    pub(super) fn blit_now(&mut self, blit: &Blit) -> Result<()> {
        let src = self.texture(blit.src)?;
        let dst = self.texture(blit.dst)?;
        if self.validate {
            blit.check(&src.desc, &dst.desc)?;
        }
        let device = &self.ctx.device;
        self.one_shot(|cmd| {
            full_barrier(device, cmd);
            record_blit(device, cmd, blit, src, dst, src.resting_layout(), dst.resting_layout());
            Ok(())
        })
    }

    /// Fill mips 1.. of every layer by successive linear downsampling.
    pub(super) fn generate_mipmaps(&mut self, handle: TextureHandle) -> Result<()> {
        let texture = self.texture(handle)?;
        if texture.desc.mip_levels < 2 {
            return Ok(());
        }
        let features = self.ctx.format_features(texture.format);
        let needed = vk::FormatFeatureFlags::BLIT_SRC
            | vk::FormatFeatureFlags::BLIT_DST
            | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR;
        if texture.desc.format.is_depth() || !features.contains(needed) {
            return Err(RhiError::unsupported(format!("cannot generate mipmaps for {:?}", texture.desc.format)));
        }
        let device = &self.ctx.device;
        let desc = &texture.desc;
        let resting = texture.resting_layout();
        let layers = if desc.kind == TextureKind::D3 { 1 } else { desc.array_layers() };
        self.one_shot(|cmd| {
            let whole = texture.full_range();
            let (src_layout, dst_layout) = (vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            transition(device, cmd, texture.image, whole, resting, dst_layout, false);
            for mip in 1..desc.mip_levels {
                let level = |m: u32| {
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(texture.aspect())
                        .base_mip_level(m)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(layers)
                };
                transition(device, cmd, texture.image, level(mip - 1), dst_layout, src_layout, false);
                let corner = |m: u32| {
                    let (w, h, d) = desc.mip_extent(m);
                    vk::Offset3D { x: w as i32, y: h as i32, z: d as i32 }
                };
                let origin = vk::Offset3D { x: 0, y: 0, z: 0 };
                let blit = vk::ImageBlit::default()
                    .src_subresource(texture.subresource(mip - 1, 0, layers))
                    .src_offsets([origin, corner(mip - 1)])
                    .dst_subresource(texture.subresource(mip, 0, layers))
                    .dst_offsets([origin, corner(mip)]);
                unsafe {
                    device.cmd_blit_image(cmd, texture.image, src_layout, texture.image, dst_layout, &[blit], vk::Filter::LINEAR);
                }
            }
            let last = desc.mip_levels - 1;
            let below_last = vk::ImageSubresourceRange::default()
                .aspect_mask(texture.aspect())
                .base_mip_level(0)
                .level_count(last)
                .base_array_layer(0)
                .layer_count(layers);
            let last_range = vk::ImageSubresourceRange::default()
                .aspect_mask(texture.aspect())
                .base_mip_level(last)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(layers);
            transition(device, cmd, texture.image, below_last, src_layout, resting, false);
            transition(device, cmd, texture.image, last_range, dst_layout, resting, false);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_copies_use_the_depth_plane() {
        assert_eq!(copy_aspect(StorageFormat::Depth24Stencil8), vk::ImageAspectFlags::DEPTH);
        assert_eq!(copy_aspect(StorageFormat::Depth32), vk::ImageAspectFlags::DEPTH);
        assert_eq!(copy_aspect(StorageFormat::Rgba8), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn staging_alignment_covers_every_texel_size() {
        for size in [1u64, 2, 4, 8, 16] {
            assert_eq!(STAGING_ALIGN % size, 0);
        }
        assert_eq!(STAGING_ALIGN % 4, 0);
    }
}
