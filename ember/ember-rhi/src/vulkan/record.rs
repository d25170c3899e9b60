//! Pre-recorded replay. Each `CommandBuffer` is compiled once into a native secondary command
//! buffer and re-executed by later submissions until it is re-recorded, targets a different
//! frame buffer shape, finds its textures in other layouts, or a descriptor set it binds is
//! rewritten.

use std::collections::HashMap;

use ash::vk;

use crate::command::{AttachmentClear, Blit, ClearValue, Command, CommandBuffer, ImageLayout, LayoutTransfer, RecordTarget, Viewport};
use crate::error::{Result, RhiError};
use crate::format::IndexFormat;
use crate::frame::group_passes;
use crate::handle::{
    BufferHandle, CommandBufferHandle, DescriptorSetHandle, FenceHandle, FrameBufferHandle, PipelineHandle,
    RenderTargetLayoutHandle, TextureHandle,
};
use crate::render_target::RenderTargetLayout;
use crate::resource::TextureKind;

use super::pipeline::{PipelineKind, VulkanPipeline};
use super::render_pass::VulkanFrameBuffer;
use super::submit::{full_barrier, Retired};
use super::texture::{layout_to_vk, transition, VulkanTexture};
use super::VulkanRenderer;

/// Layout changes made by a batch, applied once it is submitted.
type LayoutUpdates = HashMap<TextureHandle, ImageLayout>;

pub(super) struct CompiledCommands {
    raw: vk::CommandBuffer,
    epoch: u64,
    /// Frame buffer layout and extent for render pass buffers.
    target: Option<(RenderTargetLayoutHandle, (u32, u32))>,
    /// Descriptor sets baked into the secondary, with the version they had.
    sets: Vec<(DescriptorSetHandle, u64)>,
    /// Layouts of blitted or transitioned textures when the buffer starts executing.
    entry_layouts: Vec<(TextureHandle, ImageLayout)>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Bindings {
    pipeline: Option<PipelineHandle>,
    vertex: Option<(BufferHandle, u64)>,
    index: Option<(BufferHandle, u64, IndexFormat)>,
    viewport: Option<Viewport>,
    sets: Vec<Option<DescriptorSetHandle>>,
}

impl Bindings {
    fn bind_set(&mut self, index: u32, set: DescriptorSetHandle) {
        let index = index as usize;
        if self.sets.len() <= index {
            self.sets.resize(index + 1, None);
        }
        self.sets[index] = Some(set);
    }

    fn set(&self, index: usize) -> Option<DescriptorSetHandle> {
        self.sets.get(index).copied().flatten()
    }
}

fn index_type(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::Uint16 => vk::IndexType::UINT16,
        IndexFormat::Uint32 => vk::IndexType::UINT32,
    }
}

fn rect(x: u32, y: u32, width: u32, height: u32) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: x as i32, y: y as i32 },
        extent: vk::Extent2D { width, height },
    }
}

fn viewport(x: i32, y: i32, width: u32, height: u32) -> vk::Viewport {
    vk::Viewport {
        x: x as f32,
        y: y as f32,
        width: width as f32,
        height: height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Offset, extent and layer range of a box. Arrays and cubes keep layers in `z`/`depth`.
pub(super) fn region_box(kind: TextureKind, origin: [u32; 3], extent: [u32; 3]) -> (vk::Offset3D, vk::Extent3D, u32, u32) {
    if kind == TextureKind::D3 {
        (
            vk::Offset3D { x: origin[0] as i32, y: origin[1] as i32, z: origin[2] as i32 },
            vk::Extent3D { width: extent[0], height: extent[1], depth: extent[2] },
            0,
            1,
        )
    } else {
        (
            vk::Offset3D { x: origin[0] as i32, y: origin[1] as i32, z: 0 },
            vk::Extent3D { width: extent[0], height: extent[1], depth: 1 },
            origin[2],
            extent[2],
        )
    }
}

/// Subresource range of `mip` and the given layers.
fn mip_range(texture: &VulkanTexture, mip: u32, first_layer: u32, layers: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(texture.aspect())
        .base_mip_level(mip)
        .level_count(1)
        .base_array_layer(first_layer)
        .layer_count(layers)
}

/// Record a texel copy. Both textures go to transfer layouts and back to `src_layout`/`dst_layout`.
pub(super) fn record_blit(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    blit: &Blit,
    src: &VulkanTexture,
    dst: &VulkanTexture,
    src_layout: vk::ImageLayout,
    dst_layout: vk::ImageLayout,
) {
    let (src_offset, extent, src_layer, layers) = region_box(src.desc.kind, blit.src_origin, blit.extent);
    let (dst_offset, _, dst_layer, _) = region_box(dst.desc.kind, blit.dst_origin, blit.extent);
    let src_range = mip_range(src, blit.src_mip, src_layer, layers);
    let dst_range = mip_range(dst, blit.dst_mip, dst_layer, layers);
    transition(device, cmd, src.image, src_range, src_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, false);
    transition(device, cmd, dst.image, dst_range, dst_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL, false);
    let region = vk::ImageCopy::default()
        .src_subresource(src.subresource(blit.src_mip, src_layer, layers))
        .src_offset(src_offset)
        .dst_subresource(dst.subresource(blit.dst_mip, dst_layer, layers))
        .dst_offset(dst_offset)
        .extent(extent);
    unsafe {
        device.cmd_copy_image(
            cmd,
            src.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }
    transition(device, cmd, src.image, src_range, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, src_layout, false);
    transition(device, cmd, dst.image, dst_range, vk::ImageLayout::TRANSFER_DST_OPTIMAL, dst_layout, false);
}

/// Clear value for a `vkCmdClearAttachments` entry. Integer targets take integer colors.
fn clear_value(value: ClearValue, integer: bool) -> vk::ClearValue {
    match value {
        ClearValue::Color(rgba) if integer => vk::ClearValue {
            color: vk::ClearColorValue { int32: rgba.map(|c| c as i32) },
        },
        ClearValue::Color(rgba) => vk::ClearValue { color: vk::ClearColorValue { float32: rgba } },
        ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        },
    }
}

/// Compilation of one render pass buffer into a secondary that continues a render pass.
struct PassCompiler<'r> {
    renderer: &'r VulkanRenderer,
    device: &'r ash::Device,
    cmd: vk::CommandBuffer,
    layout: &'r RenderTargetLayout,
    extent: (u32, u32),
    wanted: Bindings,
    applied: Bindings,
    sets: Vec<(DescriptorSetHandle, u64)>,
    draws: u32,
}

impl<'r> PassCompiler<'r> {
    fn validate(&self) -> bool {
        self.renderer.validate
    }

    fn pipeline(&self, handle: PipelineHandle) -> Result<&'r VulkanPipeline> {
        self.renderer.pipelines.get(handle).ok_or(RhiError::InvalidHandle("pipeline"))
    }

    fn reset_viewport(&self) {
        let (w, h) = self.extent;
        unsafe {
            self.device.cmd_set_viewport(self.cmd, 0, &[viewport(0, 0, w, h)]);
            self.device.cmd_set_scissor(self.cmd, 0, &[rect(0, 0, w, h)]);
        }
    }

    fn check_draw(&self, indexed: bool) -> Result<()> {
        let Some(handle) = self.wanted.pipeline else {
            return Err(RhiError::contract("draw without a bound pipeline"));
        };
        let pipeline = self.pipeline(handle)?;
        match &pipeline.kind {
            PipelineKind::Graphics { render_layout } if !render_layout.is_compatible(self.layout) => {
                return Err(RhiError::contract(
                    "pipeline render target layout is not compatible with the frame buffer",
                ));
            }
            PipelineKind::Compute => return Err(RhiError::contract("draw with a compute pipeline bound")),
            _ => {}
        }
        if indexed && self.wanted.index.is_none() {
            return Err(RhiError::contract("indexed draw without an index buffer"));
        }
        self.renderer.check_bound_sets(&pipeline.set_layouts, |i| self.wanted.set(i))
    }

    /// Record every binding that differs from what the secondary already has.
    fn flush(&mut self) -> Result<()> {
        let renderer = self.renderer;
        let (device, cmd) = (self.device, self.cmd);
        if self.wanted.pipeline != self.applied.pipeline {
            if let Some(handle) = self.wanted.pipeline {
                let pipeline = self.pipeline(handle)?;
                unsafe { device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline) };
            }
            self.applied.pipeline = self.wanted.pipeline;
            // A new pipeline layout invalidates the bound sets.
            self.applied.sets.clear();
        }
        if self.wanted.vertex != self.applied.vertex {
            if let Some((buffer, offset)) = self.wanted.vertex {
                let raw = renderer.buffer(buffer)?.buffer;
                unsafe { device.cmd_bind_vertex_buffers(cmd, 0, &[raw], &[offset]) };
            }
            self.applied.vertex = self.wanted.vertex;
        }
        if self.wanted.index != self.applied.index {
            if let Some((buffer, offset, format)) = self.wanted.index {
                let raw = renderer.buffer(buffer)?.buffer;
                unsafe { device.cmd_bind_index_buffer(cmd, raw, offset, index_type(format)) };
            }
            self.applied.index = self.wanted.index;
        }
        if self.wanted.viewport != self.applied.viewport {
            if let Some(v) = self.wanted.viewport {
                match v.scissor(self.extent) {
                    Some([x, y, w, h]) => unsafe {
                        device.cmd_set_viewport(cmd, 0, &[viewport(v.x, v.y, v.width, v.height)]);
                        device.cmd_set_scissor(cmd, 0, &[rect(x, y, w, h)]);
                    },
                    // Entirely outside the target: an empty scissor drops the draws.
                    None => unsafe { device.cmd_set_scissor(cmd, 0, &[rect(0, 0, 0, 0)]) },
                }
            }
            self.applied.viewport = self.wanted.viewport;
        }
        let Some(handle) = self.applied.pipeline else { return Ok(()) };
        let pipeline = self.pipeline(handle)?;
        for index in 0..self.wanted.sets.len().min(pipeline.set_layouts.len()) {
            let wanted = self.wanted.set(index);
            if wanted == self.applied.set(index) {
                continue;
            }
            let Some(set_handle) = wanted else { continue };
            if let Some(version) = renderer.bind_set(device, cmd, pipeline, index, set_handle)? {
                self.sets.push((set_handle, version));
            }
            self.applied.bind_set(index as u32, set_handle);
        }
        Ok(())
    }

    fn clear(&mut self, clears: &[AttachmentClear]) -> Result<()> {
        let mut native = Vec::with_capacity(clears.len());
        for clear in clears {
            let Some(attachment) = self.layout.attachments().get(clear.attachment as usize) else {
                if self.validate() {
                    return Err(RhiError::contract(format!(
                        "clear of attachment {} in a layout with {} attachments",
                        clear.attachment,
                        self.layout.attachments().len()
                    )));
                }
                continue;
            };
            let depth_value = matches!(clear.value, ClearValue::DepthStencil { .. });
            if depth_value != attachment.is_depth_stencil() {
                if self.validate() {
                    return Err(RhiError::contract(format!(
                        "{:?} does not match attachment {} ({:?})",
                        clear.value, clear.attachment, attachment.format
                    )));
                }
                continue;
            }
            let entry = if attachment.is_depth_stencil() {
                let mut aspect = vk::ImageAspectFlags::DEPTH;
                if attachment.format.has_stencil() {
                    aspect |= vk::ImageAspectFlags::STENCIL;
                }
                vk::ClearAttachment::default().aspect_mask(aspect)
            } else {
                // Color attachments are numbered among colors only.
                let color_index = self.layout.color_attachments().take_while(|(slot, _)| *slot < clear.attachment as usize).count();
                vk::ClearAttachment::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .color_attachment(color_index as u32)
            };
            native.push(entry.clear_value(clear_value(clear.value, attachment.format.is_integer())));
        }
        if native.is_empty() {
            return Ok(());
        }
        let (w, h) = self.extent;
        let rects = [vk::ClearRect { rect: rect(0, 0, w, h), base_array_layer: 0, layer_count: 1 }];
        unsafe { self.device.cmd_clear_attachments(self.cmd, &native, &rects) };
        Ok(())
    }

    fn compile(&mut self, commands: &[Command]) -> Result<()> {
        self.reset_viewport();
        for command in commands {
            match command {
                Command::SetViewport(viewport) => self.wanted.viewport = Some(*viewport),
                Command::BindVertexBuffer { buffer, offset } => self.wanted.vertex = Some((*buffer, *offset)),
                Command::BindIndexBuffer { buffer, offset, format } => {
                    self.wanted.index = Some((*buffer, *offset, *format));
                }
                Command::BindPipeline(pipeline) => self.wanted.pipeline = Some(*pipeline),
                Command::BindDescriptorSet { index, set } => self.wanted.bind_set(*index, *set),
                Command::Draw { first_vertex, vertex_count, instances } => {
                    if self.validate() {
                        self.check_draw(false)?;
                    }
                    self.flush()?;
                    unsafe { self.device.cmd_draw(self.cmd, *vertex_count, *instances, *first_vertex, 0) };
                    self.draws += 1;
                }
                Command::DrawIndexed { first_index, index_count, instances } => {
                    if self.validate() {
                        self.check_draw(true)?;
                    }
                    self.flush()?;
                    unsafe { self.device.cmd_draw_indexed(self.cmd, *index_count, *instances, *first_index, 0, 0) };
                    self.draws += 1;
                }
                Command::ClearAttachments(clears) => self.clear(clears)?,
                Command::Blit(_) | Command::TransferLayout { .. } | Command::Dispatch { .. } => {
                    log::warn!("skipping standalone command inside a render pass");
                }
            }
        }
        Ok(())
    }
}

impl VulkanRenderer {
    /// Every set a pipeline declares must be bound, shaped like the declared layout, and complete.
    pub(super) fn check_bound_sets(
        &self,
        expected: &[crate::handle::DescriptorSetLayoutHandle],
        bound: impl Fn(usize) -> Option<DescriptorSetHandle>,
    ) -> Result<()> {
        for (index, expected) in expected.iter().enumerate() {
            let Some(handle) = bound(index) else {
                return Err(RhiError::contract(format!("descriptor set {index} required by the pipeline is not bound")));
            };
            let set = self.sets.get(handle).ok_or(RhiError::InvalidHandle("descriptor set"))?;
            let layout = &self.set_layouts.get(*expected).ok_or(RhiError::InvalidHandle("descriptor set layout"))?.layout;
            let same_shape = self.set_layouts.get(set.layout).is_some_and(|l| l.layout == *layout);
            if set.layout != *expected && !same_shape {
                return Err(RhiError::contract(format!(
                    "bound descriptor set does not match descriptor set layout (set {index})"
                )));
            }
            if set.updating.is_raised() {
                return Err(RhiError::contract(format!("descriptor set {index} is bound while being updated")));
            }
            if let Some(location) = set.contents.first_missing(layout) {
                return Err(RhiError::contract(format!("descriptor set {index} has nothing at location {location}")));
            }
        }
        Ok(())
    }

    /// Bind one set at `index`. Returns the set's version, or `None` when it was skipped as incomplete.
    fn bind_set(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        pipeline: &VulkanPipeline,
        index: usize,
        handle: DescriptorSetHandle,
    ) -> Result<Option<u64>> {
        let set = self.sets.get(handle).ok_or(RhiError::InvalidHandle("descriptor set"))?;
        let layout = &self.set_layouts.get(set.layout).ok_or(RhiError::InvalidHandle("descriptor set layout"))?.layout;
        if set.contents.first_missing(layout).is_some() {
            log::warn!("descriptor set {index} is incomplete; skipping bind");
            return Ok(None);
        }
        unsafe {
            device.cmd_bind_descriptor_sets(cmd, pipeline.bind_point(), pipeline.layout, index as u32, &[set.raw], &[]);
        }
        Ok(Some(set.version))
    }

    fn current_layout(&self, updates: &LayoutUpdates, texture: TextureHandle) -> Result<ImageLayout> {
        match updates.get(&texture) {
            Some(layout) => Ok(*layout),
            None => Ok(self.texture(texture)?.layout),
        }
    }

    /// Layouts of every texture the buffer blits or transitions, as of the start of the buffer.
    fn entry_layouts(&self, cmd: &CommandBuffer, updates: &LayoutUpdates) -> Result<Vec<(TextureHandle, ImageLayout)>> {
        let mut layouts: Vec<(TextureHandle, ImageLayout)> = Vec::new();
        let mut note = |texture: TextureHandle| -> Result<()> {
            if !layouts.iter().any(|(t, _)| *t == texture) {
                layouts.push((texture, self.current_layout(updates, texture)?));
            }
            Ok(())
        };
        for command in cmd.commands() {
            match command {
                Command::Blit(blit) => {
                    note(blit.src)?;
                    note(blit.dst)?;
                }
                Command::TransferLayout { textures, .. } => {
                    for texture in textures {
                        note(*texture)?;
                    }
                }
                _ => {}
            }
        }
        Ok(layouts)
    }

    /// Apply the buffer's layout transfers to `updates`, checking each against the tracked layout.
    fn advance_layouts(&self, cmd: &CommandBuffer, updates: &mut LayoutUpdates) -> Result<()> {
        for command in cmd.commands() {
            if let Command::TransferLayout { textures, direction } = command {
                for texture in textures {
                    let next = direction.apply(self.current_layout(updates, *texture)?, self.validate)?;
                    updates.insert(*texture, next);
                }
            }
        }
        Ok(())
    }

    fn begin_secondary(&self, render_pass: Option<vk::RenderPass>) -> Result<vk::CommandBuffer> {
        let cmd = self.secondary_pool.allocate(vk::CommandBufferLevel::SECONDARY)?;
        let mut inheritance = vk::CommandBufferInheritanceInfo::default();
        let mut flags = vk::CommandBufferUsageFlags::SIMULTANEOUS_USE;
        if let Some(render_pass) = render_pass {
            inheritance = inheritance.render_pass(render_pass).subpass(0).framebuffer(vk::Framebuffer::null());
            flags |= vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE;
        }
        let begin = vk::CommandBufferBeginInfo::default().flags(flags).inheritance_info(&inheritance);
        if let Err(e) = unsafe { self.ctx.device.begin_command_buffer(cmd, &begin) } {
            self.secondary_pool.free(cmd);
            return Err(e.into());
        }
        Ok(cmd)
    }

    fn finish_secondary(&self, cmd: vk::CommandBuffer, recorded: Result<()>) -> Result<vk::CommandBuffer> {
        let ended = unsafe { self.ctx.device.end_command_buffer(cmd) };
        match (recorded, ended) {
            (Ok(()), Ok(())) => Ok(cmd),
            (Err(e), _) => {
                self.secondary_pool.free(cmd);
                Err(e)
            }
            (Ok(()), Err(e)) => {
                self.secondary_pool.free(cmd);
                Err(e.into())
            }
        }
    }

    fn compile_in_pass(&self, cmd: &CommandBuffer, fb: &VulkanFrameBuffer) -> Result<CompiledCommands> {
        let render_pass = self.render_layouts.get(fb.layout).ok_or(RhiError::InvalidHandle("render target layout"))?;
        let raw = self.begin_secondary(Some(render_pass.raw))?;
        let mut compiler = PassCompiler {
            renderer: self,
            device: &self.ctx.device,
            cmd: raw,
            layout: &render_pass.layout,
            extent: fb.extent,
            wanted: Bindings::default(),
            applied: Bindings::default(),
            sets: Vec::new(),
            draws: 0,
        };
        let recorded = compiler.compile(cmd.commands());
        let (sets, draws) = (std::mem::take(&mut compiler.sets), compiler.draws);
        let raw = self.finish_secondary(raw, recorded)?;
        log::trace!("compiled render pass buffer with {draws} draws");
        Ok(CompiledCommands { raw, epoch: cmd.epoch(), target: Some((fb.layout, fb.extent)), sets, entry_layouts: Vec::new() })
    }

    fn record_standalone(
        &self,
        raw: vk::CommandBuffer,
        cmd: &CommandBuffer,
        mut layouts: LayoutUpdates,
        sets: &mut Vec<(DescriptorSetHandle, u64)>,
    ) -> Result<()> {
        let device = &self.ctx.device;
        let mut bindings = Bindings::default();
        for command in cmd.commands() {
            match command {
                Command::BindPipeline(pipeline) => bindings.pipeline = Some(*pipeline),
                Command::BindDescriptorSet { index, set } => bindings.bind_set(*index, *set),
                Command::Dispatch { x, y, z } => {
                    let Some(handle) = bindings.pipeline else {
                        return Err(RhiError::contract("dispatch without a bound pipeline"));
                    };
                    let pipeline = self.pipelines.get(handle).ok_or(RhiError::InvalidHandle("pipeline"))?;
                    if !matches!(pipeline.kind, PipelineKind::Compute) {
                        return Err(RhiError::contract("dispatch with a graphics pipeline bound"));
                    }
                    if self.validate {
                        self.check_bound_sets(&pipeline.set_layouts, |i| bindings.set(i))?;
                    }
                    unsafe { device.cmd_bind_pipeline(raw, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline) };
                    for index in 0..pipeline.set_layouts.len() {
                        let Some(set) = bindings.set(index) else { continue };
                        if let Some(version) = self.bind_set(device, raw, pipeline, index, set)? {
                            sets.push((set, version));
                        }
                    }
                    unsafe { device.cmd_dispatch(raw, *x, *y, *z) };
                    full_barrier(device, raw);
                }
                Command::Blit(blit) => {
                    let src = self.texture(blit.src)?;
                    let dst = self.texture(blit.dst)?;
                    if self.validate {
                        blit.check(&src.desc, &dst.desc)?;
                    }
                    let src_layout = layout_to_vk(self.current_layout(&layouts, blit.src)?, src.desc.format);
                    let dst_layout = layout_to_vk(self.current_layout(&layouts, blit.dst)?, dst.desc.format);
                    record_blit(device, raw, blit, src, dst, src_layout, dst_layout);
                }
                Command::TransferLayout { textures, direction } => {
                    for handle in textures {
                        let texture = self.texture(*handle)?;
                        let current = self.current_layout(&layouts, *handle)?;
                        let next = direction.apply(current, self.validate)?;
                        let from = match direction {
                            LayoutTransfer::UndefinedToRenderAttachment => vk::ImageLayout::UNDEFINED,
                            _ => layout_to_vk(current, texture.desc.format),
                        };
                        let to = layout_to_vk(next, texture.desc.format);
                        transition(device, raw, texture.image, texture.full_range(), from, to, false);
                        layouts.insert(*handle, next);
                    }
                }
                _ => log::warn!("skipping render pass command in a standalone command buffer"),
            }
        }
        Ok(())
    }

    fn compile_standalone(
        &self,
        cmd: &CommandBuffer,
        updates: &LayoutUpdates,
        entry_layouts: Vec<(TextureHandle, ImageLayout)>,
    ) -> Result<CompiledCommands> {
        let raw = self.begin_secondary(None)?;
        let mut sets = Vec::new();
        let recorded = self.record_standalone(raw, cmd, updates.clone(), &mut sets);
        let raw = self.finish_secondary(raw, recorded)?;
        Ok(CompiledCommands { raw, epoch: cmd.epoch(), target: None, sets, entry_layouts })
    }

    fn is_current(&self, compiled: &CompiledCommands, cmd: &CommandBuffer, target: Option<(RenderTargetLayoutHandle, (u32, u32))>, entry: &[(TextureHandle, ImageLayout)]) -> bool {
        compiled.epoch == cmd.epoch()
            && compiled.target == target
            && compiled.entry_layouts == entry
            && compiled.sets.iter().all(|(h, v)| self.sets.get(*h).is_some_and(|s| s.version == *v))
    }

    /// The native secondary for `cmd`, recompiled if stale. Replaced secondaries go to `stale`.
    fn prepare(
        &mut self,
        cmd: &CommandBuffer,
        frame_buffer: Option<FrameBufferHandle>,
        updates: &mut LayoutUpdates,
        stale: &mut Vec<vk::CommandBuffer>,
    ) -> Result<vk::CommandBuffer> {
        let handle = cmd.handle();
        if !self.command_buffers.contains_key(handle) {
            return Err(RhiError::InvalidHandle("command buffer"));
        }
        let fb = match frame_buffer {
            Some(h) => Some(self.frame_buffers.get(h).ok_or(RhiError::InvalidHandle("frame buffer"))?),
            None => None,
        };
        let target = fb.map(|fb| (fb.layout, fb.extent));
        let entry = if fb.is_some() { Vec::new() } else { self.entry_layouts(cmd, updates)? };
        let reusable = match &self.command_buffers[handle] {
            Some(compiled) if self.is_current(compiled, cmd, target, &entry) => Some(compiled.raw),
            _ => None,
        };
        let raw = match reusable {
            Some(raw) => raw,
            None => {
                let compiled = match fb {
                    Some(fb) => self.compile_in_pass(cmd, fb)?,
                    None => self.compile_standalone(cmd, updates, entry)?,
                };
                let raw = compiled.raw;
                if let Some(old) = self.command_buffers[handle].replace(compiled) {
                    stale.push(old.raw);
                }
                raw
            }
        };
        if fb.is_none() {
            self.advance_layouts(cmd, updates)?;
        }
        Ok(raw)
    }

    fn check_pass_target(&self, frame_buffer: FrameBufferHandle, fb_layout: &RenderTargetLayout, cmd: &CommandBuffer) -> Result<()> {
        let compatible = match cmd.target() {
            RecordTarget::FrameBuffer(fb) if fb == frame_buffer => true,
            RecordTarget::FrameBuffer(fb) => {
                let other = self.frame_buffers.get(fb).ok_or(RhiError::InvalidHandle("frame buffer"))?;
                self.render_layouts.get(other.layout).is_some_and(|l| l.layout.is_compatible(fb_layout))
            }
            RecordTarget::Layout(layout) => {
                self.render_layouts.get(layout).is_some_and(|l| l.layout.is_compatible(fb_layout))
            }
            RecordTarget::Standalone => true,
        };
        if !compatible {
            return Err(RhiError::contract(
                "command buffer was recorded for a render target layout incompatible with the frame buffer",
            ));
        }
        Ok(())
    }

    /// Resolve every buffer of a batch to its secondary, grouped into pre-pass, in-pass and post-pass.
    fn prepare_batch(
        &mut self,
        frame_buffer: Option<FrameBufferHandle>,
        cmds: &[&CommandBuffer],
        updates: &mut LayoutUpdates,
        stale: &mut Vec<vk::CommandBuffer>,
    ) -> Result<[Vec<vk::CommandBuffer>; 3]> {
        let mut groups: [Vec<vk::CommandBuffer>; 3] = Default::default();
        let Some(fb_handle) = frame_buffer else {
            for cmd in cmds {
                if cmd.in_render_pass() {
                    if self.validate {
                        return Err(RhiError::contract(
                            "render pass command buffer passed to execute_non_render_command_buffers",
                        ));
                    }
                    continue;
                }
                groups[0].push(self.prepare(cmd, None, updates, stale)?);
            }
            return Ok(groups);
        };

        let fb = self.frame_buffers.get(fb_handle).ok_or(RhiError::InvalidHandle("frame buffer"))?;
        let fb_layout = self.render_layouts.get(fb.layout).ok_or(RhiError::InvalidHandle("render target layout"))?.layout.clone();
        let attachments = fb.textures.clone();
        let ranges = group_passes(cmds.iter().map(|c| c.in_render_pass()), self.validate)?;

        for cmd in &cmds[ranges.pre.clone()] {
            groups[0].push(self.prepare(cmd, None, updates, stale)?);
        }
        if self.validate {
            for texture in &attachments {
                if self.current_layout(updates, *texture)? != ImageLayout::RenderAttachment {
                    return Err(RhiError::contract("frame buffer attachment is not in the render attachment layout"));
                }
            }
        }
        for cmd in &cmds[ranges.in_pass.clone()] {
            if !cmd.in_render_pass() {
                log::warn!("standalone command buffer inside the render pass group; skipping");
                continue;
            }
            if self.validate {
                self.check_pass_target(fb_handle, &fb_layout, cmd)?;
            }
            groups[1].push(self.prepare(cmd, Some(fb_handle), updates, stale)?);
        }
        for cmd in &cmds[ranges.post.clone()] {
            groups[2].push(self.prepare(cmd, None, updates, stale)?);
        }
        Ok(groups)
    }

    /// Record the primary that runs the groups in order, with the render pass around the middle one.
    fn record_primary(
        &self,
        primary: vk::CommandBuffer,
        frame_buffer: Option<FrameBufferHandle>,
        groups: &[Vec<vk::CommandBuffer>; 3],
    ) -> Result<()> {
        let device = &self.ctx.device;
        let begin = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(primary, &begin)? };
        for raw in &groups[0] {
            unsafe { device.cmd_execute_commands(primary, &[*raw]) };
            full_barrier(device, primary);
        }
        if let Some(fb_handle) = frame_buffer.filter(|_| !groups[1].is_empty()) {
            let fb = self.frame_buffers.get(fb_handle).ok_or(RhiError::InvalidHandle("frame buffer"))?;
            let render_pass = self.render_layouts.get(fb.layout).ok_or(RhiError::InvalidHandle("render target layout"))?;
            let begin = vk::RenderPassBeginInfo::default()
                .render_pass(render_pass.raw)
                .framebuffer(fb.raw)
                .render_area(fb.render_area());
            unsafe {
                device.cmd_begin_render_pass(primary, &begin, vk::SubpassContents::SECONDARY_COMMAND_BUFFERS);
                device.cmd_execute_commands(primary, &groups[1]);
                device.cmd_end_render_pass(primary);
            }
        }
        for raw in &groups[2] {
            full_barrier(device, primary);
            unsafe { device.cmd_execute_commands(primary, &[*raw]) };
        }
        unsafe { device.end_command_buffer(primary)? };
        Ok(())
    }

    fn check_fence(&self, fence: Option<FenceHandle>) -> Result<()> {
        let Some(handle) = fence else { return Ok(()) };
        let f = self.fences.get(handle).ok_or(RhiError::InvalidHandle("fence"))?;
        if self.validate && f.submitted {
            return Err(RhiError::contract("fence submitted again before fence_reset"));
        }
        Ok(())
    }

    /// Compile, submit, and stamp a batch. `frame_buffer` is `None` for non-render batches.
    pub(super) fn execute_batch(
        &mut self,
        frame_buffer: Option<FrameBufferHandle>,
        cmds: &[&CommandBuffer],
        fence: Option<FenceHandle>,
    ) -> Result<()> {
        self.collect_completed()?;
        self.check_fence(fence)?;
        for cmd in cmds {
            cmd.check_submittable(self.validate)?;
        }
        let mut updates = LayoutUpdates::new();
        let mut stale = Vec::new();
        let groups = match self.prepare_batch(frame_buffer, cmds, &mut updates, &mut stale) {
            Ok(groups) => groups,
            Err(e) => {
                for raw in stale {
                    self.retire(Retired::Secondary(raw));
                }
                return Err(e);
            }
        };

        let version = self.versions.current();
        let pool = &self.frames[version as usize].command_pool;
        let (pool_raw, primary) = (pool.raw, pool.allocate(vk::CommandBufferLevel::PRIMARY)?);
        let submitted = self.record_primary(primary, frame_buffer, &groups).and_then(|()| self.submit_primary(primary));
        let (number, fence_raw) = match submitted {
            Ok(pair) => pair,
            Err(e) => {
                self.frames[version as usize].command_pool.free(primary);
                for raw in stale {
                    self.retire(Retired::Secondary(raw));
                }
                return Err(e);
            }
        };
        self.submissions.push(number, version, fence_raw, pool_raw, primary);
        for raw in stale {
            self.retired.push((number, Retired::Secondary(raw)));
        }
        for cmd in cmds {
            cmd.mark_submitted(number);
            self.stamp_sets(cmd.handle(), number);
        }
        for (texture, layout) in updates {
            if let Some(t) = self.textures.get_mut(texture) {
                t.layout = layout;
            }
        }
        if let Some(handle) = fence {
            self.signal_fence(handle)?;
        }
        Ok(())
    }

    /// Submit `primary` with the queued transfer waits. Returns its timeline number and fence.
    fn submit_primary(&mut self, primary: vk::CommandBuffer) -> Result<(u64, vk::Fence)> {
        let waits: Vec<vk::Semaphore> = self
            .transfer_signals
            .take_waits()
            .into_iter()
            .filter_map(|v| self.frames.get(v as usize).map(|f| f.transfer_semaphore))
            .collect();
        let stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];
        let fence = self.submissions.fence()?;
        let primaries = [primary];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&primaries);
        if let Err(e) = unsafe { self.ctx.device.queue_submit(self.ctx.graphics_queue, &[submit], fence) } {
            self.submissions.recycle(fence);
            return Err(e.into());
        }
        Ok((self.timeline.next_submission(), fence))
    }

    fn stamp_sets(&mut self, handle: CommandBufferHandle, number: u64) {
        let Some(Some(compiled)) = self.command_buffers.get(handle) else { return };
        for (set, _) in &compiled.sets {
            if let Some(s) = self.sets.get_mut(*set) {
                s.last_use = number;
            }
        }
    }

    /// Signal a caller fence once everything submitted so far has finished.
    fn signal_fence(&mut self, handle: FenceHandle) -> Result<()> {
        let f = self.fences.get_mut(handle).ok_or(RhiError::InvalidHandle("fence"))?;
        unsafe {
            if f.submitted {
                self.ctx.device.wait_for_fences(&[f.raw], true, u64::MAX)?;
                self.ctx.device.reset_fences(&[f.raw])?;
            }
            self.ctx.device.queue_submit(self.ctx.graphics_queue, &[], f.raw)?;
        }
        f.submitted = true;
        Ok(())
    }

    /// Drop the compiled secondary of a destroyed command buffer.
    pub(super) fn forget_commands(&mut self, handle: CommandBufferHandle) -> Result<()> {
        match self.command_buffers.remove(handle) {
            Some(Some(compiled)) => {
                self.retire(Retired::Secondary(compiled.raw));
                Ok(())
            }
            Some(None) => Ok(()),
            None => Err(RhiError::InvalidHandle("command buffer")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_boxes_move_layers_out_of_the_extent() {
        let (offset, extent, first, count) = region_box(TextureKind::D2Array, [1, 2, 3], [4, 5, 2]);
        assert_eq!((offset.x, offset.y, offset.z), (1, 2, 0));
        assert_eq!((extent.width, extent.height, extent.depth), (4, 5, 1));
        assert_eq!((first, count), (3, 2));

        let (offset, extent, first, count) = region_box(TextureKind::D3, [0, 0, 3], [8, 8, 4]);
        assert_eq!((offset.z, extent.depth), (3, 4));
        assert_eq!((first, count), (0, 1));
    }

    #[test]
    fn integer_targets_clear_with_integer_colors() {
        let value = clear_value(ClearValue::Color([1.0, 2.0, 0.0, 255.0]), true);
        assert_eq!(unsafe { value.color.int32 }, [1, 2, 0, 255]);
        let value = clear_value(ClearValue::DepthStencil { depth: 0.5, stencil: 3 }, false);
        let ds = unsafe { value.depth_stencil };
        assert_eq!((ds.depth, ds.stencil), (0.5, 3));
    }

    #[test]
    fn bindings_track_sparse_set_slots() {
        let mut sets: slotmap::SlotMap<DescriptorSetHandle, ()> = slotmap::SlotMap::with_key();
        let a = sets.insert(());
        let mut bindings = Bindings::default();
        bindings.bind_set(1, a);
        assert_eq!(bindings.set(0), None);
        assert_eq!(bindings.set(1), Some(a));
    }
}
