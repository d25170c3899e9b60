//! Immediate replay of recorded `Command`s into a `wgpu::CommandEncoder`.

use std::collections::HashMap;

use crate::command::{AttachmentClear, ClearValue, Command, CommandBuffer, ImageLayout, RecordTarget, Viewport};
use crate::error::{Result, RhiError};
use crate::format::IndexFormat;
use crate::frame::group_passes;
use crate::handle::{BufferHandle, DescriptorSetHandle, FenceHandle, FrameBufferHandle, PipelineHandle, TextureHandle};
use crate::render_target::RenderTargetLayout;
use crate::resource::TextureDesc;

use super::{convert, PipelineKind, WgpuFrameBuffer, WgpuPipeline, WgpuRenderer};

/// Layout changes made by a batch, applied once it is submitted.
pub(super) type LayoutUpdates = HashMap<TextureHandle, ImageLayout>;

/// Bindings shared by every buffer of one batch, so redundant binds are dropped across buffers.
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

/// Color and depth/stencil attachment descriptions that clear `view` to `value`.
pub(super) fn clear_attachment_ops<'v>(
    view: &'v wgpu::TextureView,
    desc: &TextureDesc,
    value: ClearValue,
) -> Result<(Vec<Option<wgpu::RenderPassColorAttachment<'v>>>, Option<wgpu::RenderPassDepthStencilAttachment<'v>>)> {
    match (value, desc.format.is_depth()) {
        (ClearValue::Color(rgba), false) => Ok((
            vec![Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations { load: wgpu::LoadOp::Clear(convert::clear_color(rgba)), store: wgpu::StoreOp::Store },
            })],
            None,
        )),
        (ClearValue::DepthStencil { depth, stencil }, true) => Ok((
            Vec::new(),
            Some(wgpu::RenderPassDepthStencilAttachment {
                view,
                depth_ops: Some(wgpu::Operations { load: wgpu::LoadOp::Clear(depth), store: wgpu::StoreOp::Store }),
                stencil_ops: desc.format.has_stencil().then_some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(stencil),
                    store: wgpu::StoreOp::Store,
                }),
            }),
        )),
        (value, _) => Err(RhiError::contract(format!("{value:?} does not match a {:?} texture", desc.format))),
    }
}

struct PassReplay<'r> {
    renderer: &'r WgpuRenderer,
    frame_buffer: &'r WgpuFrameBuffer,
    layout: &'r RenderTargetLayout,
    pass: Option<wgpu::RenderPass<'static>>,
    pending_clears: Vec<AttachmentClear>,
    wanted: Bindings,
    applied: Bindings,
    draws: u32,
}

impl<'r> PassReplay<'r> {
    fn validate(&self) -> bool {
        self.renderer.validate
    }

    fn open(&mut self, encoder: &mut wgpu::CommandEncoder) {
        if self.pass.is_some() {
            return;
        }
        let clear_for = |slot: usize| {
            self.pending_clears.iter().rev().find(|c| c.attachment as usize == slot).map(|c| c.value)
        };
        let mut colors = Vec::with_capacity(self.layout.color_count());
        let mut depth_stencil = None;
        for (slot, attachment) in self.layout.attachments().iter().enumerate() {
            let view = &self.frame_buffer.attachments[slot].1;
            let clear = clear_for(slot);
            if attachment.is_depth_stencil() {
                let (depth, stencil) = match clear {
                    Some(ClearValue::DepthStencil { depth, stencil }) => {
                        (wgpu::LoadOp::Clear(depth), wgpu::LoadOp::Clear(stencil))
                    }
                    _ => (wgpu::LoadOp::Load, wgpu::LoadOp::Load),
                };
                depth_stencil = Some(wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations { load: depth, store: wgpu::StoreOp::Store }),
                    stencil_ops: attachment
                        .format
                        .has_stencil()
                        .then_some(wgpu::Operations { load: stencil, store: wgpu::StoreOp::Store }),
                });
            } else {
                let load = match clear {
                    Some(ClearValue::Color(rgba)) => wgpu::LoadOp::Clear(convert::clear_color(rgba)),
                    _ => wgpu::LoadOp::Load,
                };
                colors.push(Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations { load, store: wgpu::StoreOp::Store },
                }));
            }
        }
        let pass = encoder
            .begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("ember_render_pass"),
                color_attachments: &colors,
                depth_stencil_attachment: depth_stencil,
                timestamp_writes: None,
                occlusion_query_set: None,
            })
            .forget_lifetime();
        self.pass = Some(pass);
        self.pending_clears.clear();
        self.applied = Bindings::default();
    }

    fn close(&mut self) {
        self.pass = None;
    }

    fn clear(&mut self, clears: &[AttachmentClear]) -> Result<()> {
        if self.validate() {
            for clear in clears {
                let Some(attachment) = self.layout.attachments().get(clear.attachment as usize) else {
                    return Err(RhiError::contract(format!(
                        "clear of attachment {} in a layout with {} attachments",
                        clear.attachment,
                        self.layout.attachments().len()
                    )));
                };
                let depth_value = matches!(clear.value, ClearValue::DepthStencil { .. });
                if depth_value != attachment.is_depth_stencil() {
                    return Err(RhiError::contract(format!(
                        "{:?} does not match attachment {} ({:?})",
                        clear.value, clear.attachment, attachment.format
                    )));
                }
            }
        }
        // Clears become load ops of the next pass; bound state is re-applied there.
        self.close();
        self.pending_clears.extend_from_slice(clears);
        Ok(())
    }

    fn pipeline(&self, handle: PipelineHandle) -> Result<&'r WgpuPipeline> {
        self.renderer.pipelines.get(handle).ok_or(RhiError::InvalidHandle("pipeline"))
    }

    fn check_draw(&self, indexed: bool) -> Result<()> {
        let Some(handle) = self.wanted.pipeline else {
            return Err(RhiError::contract("draw without a bound pipeline"));
        };
        let pipeline = self.pipeline(handle)?;
        match &pipeline.kind {
            PipelineKind::Graphics { render_layout, .. } if !render_layout.is_compatible(self.layout) => {
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
        self.renderer.check_bound_sets(pipeline, &self.wanted)
    }

    /// Push every binding that differs from what the open pass already has.
    fn flush(&mut self, encoder: &mut wgpu::CommandEncoder) -> Result<()> {
        self.open(encoder);
        let renderer = self.renderer;
        let Some(pass) = self.pass.as_mut() else { return Ok(()) };
        if self.wanted.pipeline != self.applied.pipeline {
            if let Some(handle) = self.wanted.pipeline {
                let pipeline = renderer.pipelines.get(handle).ok_or(RhiError::InvalidHandle("pipeline"))?;
                if let Some(native) = &pipeline.render_pipeline {
                    pass.set_pipeline(native);
                }
                if let PipelineKind::Graphics { stencil_reference, .. } = pipeline.kind {
                    pass.set_stencil_reference(stencil_reference);
                }
            }
            self.applied.pipeline = self.wanted.pipeline;
        }
        if self.wanted.vertex != self.applied.vertex {
            if let Some((buffer, offset)) = self.wanted.vertex {
                pass.set_vertex_buffer(0, renderer.buffer(buffer)?.buffer.slice(offset..));
            }
            self.applied.vertex = self.wanted.vertex;
        }
        if self.wanted.index != self.applied.index {
            if let Some((buffer, offset, format)) = self.wanted.index {
                pass.set_index_buffer(renderer.buffer(buffer)?.buffer.slice(offset..), convert::index_format(format));
            }
            self.applied.index = self.wanted.index;
        }
        if self.wanted.viewport != self.applied.viewport {
            if let Some(viewport) = self.wanted.viewport {
                let extent = self.frame_buffer.extent;
                match viewport.scissor(extent) {
                    Some([x, y, w, h]) => {
                        if viewport.fits(extent) {
                            let Viewport { x, y, width, height } = viewport;
                            pass.set_viewport(x as f32, y as f32, width as f32, height as f32, 0.0, 1.0);
                        } else {
                            // wgpu rejects viewports that leave the target, so the overlap stands in.
                            log::warn!("viewport {viewport:?} leaves the {extent:?} target; drawing into the overlap");
                            pass.set_viewport(x as f32, y as f32, w as f32, h as f32, 0.0, 1.0);
                        }
                        pass.set_scissor_rect(x, y, w, h);
                    }
                    // Entirely outside the target: an empty scissor drops the draws.
                    None => pass.set_scissor_rect(0, 0, 0, 0),
                }
            }
            self.applied.viewport = self.wanted.viewport;
        }
        for index in 0..self.wanted.sets.len() {
            let wanted = self.wanted.set(index);
            if wanted == self.applied.set(index) {
                continue;
            }
            if let Some(handle) = wanted {
                let set = renderer.sets.get(handle).ok_or(RhiError::InvalidHandle("descriptor set"))?;
                match &set.bind_group {
                    Some(group) => pass.set_bind_group(index as u32, group, &[]),
                    None => log::warn!("descriptor set {index} is incomplete; skipping bind"),
                }
                self.applied.bind_set(index as u32, handle);
            }
        }
        Ok(())
    }

    fn replay(&mut self, encoder: &mut wgpu::CommandEncoder, cmd: &CommandBuffer) -> Result<()> {
        for command in cmd.commands() {
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
                    self.flush(encoder)?;
                    if let Some(pass) = self.pass.as_mut() {
                        pass.draw(*first_vertex..first_vertex + vertex_count, 0..*instances);
                    }
                    self.draws += 1;
                }
                Command::DrawIndexed { first_index, index_count, instances } => {
                    if self.validate() {
                        self.check_draw(true)?;
                    }
                    self.flush(encoder)?;
                    if let Some(pass) = self.pass.as_mut() {
                        pass.draw_indexed(*first_index..first_index + index_count, 0, 0..*instances);
                    }
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

    fn finish(mut self, encoder: &mut wgpu::CommandEncoder) {
        if !self.pending_clears.is_empty() {
            self.open(encoder);
        }
        self.close();
        log::trace!("render pass replayed {} draws", self.draws);
    }
}

impl WgpuRenderer {
    fn check_bound_sets(&self, pipeline: &WgpuPipeline, bound: &Bindings) -> Result<()> {
        for (index, expected) in pipeline.set_layouts.iter().enumerate() {
            let Some(handle) = bound.set(index) else {
                return Err(RhiError::contract(format!("descriptor set {index} required by the pipeline is not bound")));
            };
            let set = self.sets.get(handle).ok_or(RhiError::InvalidHandle("descriptor set"))?;
            let layout = &self.set_layouts.get(*expected).ok_or(RhiError::InvalidHandle("descriptor set layout"))?.layout;
            if set.layout != *expected && self.set_layouts[set.layout].layout != *layout {
                return Err(RhiError::contract(format!(
                    "bound descriptor set does not match descriptor set layout (set {index})"
                )));
            }
            if set.dirty {
                return Err(RhiError::contract(format!(
                    "descriptor set {index} references a destroyed resource and could not be rebuilt"
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

    fn current_layout(&self, updates: &LayoutUpdates, texture: TextureHandle) -> Result<ImageLayout> {
        match updates.get(&texture) {
            Some(layout) => Ok(*layout),
            None => Ok(self.texture(texture)?.layout),
        }
    }

    fn replay_standalone(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        cmd: &CommandBuffer,
        updates: &mut LayoutUpdates,
    ) -> Result<()> {
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
                    let Some(native) = &pipeline.compute_pipeline else {
                        return Err(RhiError::contract("dispatch with a graphics pipeline bound"));
                    };
                    if self.validate {
                        self.check_bound_sets(pipeline, &bindings)?;
                    }
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("ember_dispatch"),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(native);
                    for index in 0..pipeline.set_layouts.len() {
                        let Some(handle) = bindings.set(index) else { continue };
                        let set = self.sets.get(handle).ok_or(RhiError::InvalidHandle("descriptor set"))?;
                        if let Some(group) = &set.bind_group {
                            pass.set_bind_group(index as u32, group, &[]);
                        }
                    }
                    pass.dispatch_workgroups(*x, *y, *z);
                }
                Command::Blit(blit) => self.encode_blit(encoder, blit)?,
                Command::TransferLayout { textures, direction } => {
                    for texture in textures {
                        let next = direction.apply(self.current_layout(updates, *texture)?, self.validate)?;
                        updates.insert(*texture, next);
                    }
                }
                _ => log::warn!("skipping render pass command in a standalone command buffer"),
            }
        }
        Ok(())
    }

    fn check_pass_target(&self, frame_buffer: FrameBufferHandle, fb_layout: &RenderTargetLayout, cmd: &CommandBuffer) -> Result<()> {
        let compatible = match cmd.target() {
            RecordTarget::FrameBuffer(fb) if fb == frame_buffer => true,
            RecordTarget::FrameBuffer(fb) => {
                let other = self.frame_buffers.get(fb).ok_or(RhiError::InvalidHandle("frame buffer"))?;
                self.render_layouts.get(other.layout).is_some_and(|l| l.is_compatible(fb_layout))
            }
            RecordTarget::Layout(layout) => self.render_layouts.get(layout).is_some_and(|l| l.is_compatible(fb_layout)),
            RecordTarget::Standalone => true,
        };
        if !compatible {
            return Err(RhiError::contract(
                "command buffer was recorded for a render target layout incompatible with the frame buffer",
            ));
        }
        Ok(())
    }

    /// Encode a whole batch. With a frame buffer, buffers run as pre-pass, in-pass and post-pass groups.
    pub(super) fn encode_batch(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        frame_buffer: Option<FrameBufferHandle>,
        cmds: &[&CommandBuffer],
    ) -> Result<LayoutUpdates> {
        for cmd in cmds {
            cmd.check_submittable(self.validate)?;
        }
        let mut updates = LayoutUpdates::new();
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
                self.replay_standalone(encoder, cmd, &mut updates)?;
            }
            return Ok(updates);
        };

        let fb = self.frame_buffers.get(fb_handle).ok_or(RhiError::InvalidHandle("frame buffer"))?;
        let layout = self.render_layouts.get(fb.layout).ok_or(RhiError::InvalidHandle("render target layout"))?;
        let groups = group_passes(cmds.iter().map(|c| c.in_render_pass()), self.validate)?;

        for cmd in &cmds[groups.pre.clone()] {
            self.replay_standalone(encoder, cmd, &mut updates)?;
        }
        if self.validate {
            for (texture, _) in &fb.attachments {
                if self.current_layout(&updates, *texture)? != ImageLayout::RenderAttachment {
                    return Err(RhiError::contract("frame buffer attachment is not in the render attachment layout"));
                }
            }
        }
        let mut pass = PassReplay {
            renderer: self,
            frame_buffer: fb,
            layout,
            pass: None,
            pending_clears: Vec::new(),
            wanted: Bindings::default(),
            applied: Bindings::default(),
            draws: 0,
        };
        for cmd in &cmds[groups.in_pass.clone()] {
            if !cmd.in_render_pass() {
                log::warn!("standalone command buffer inside the render pass group; skipping");
                continue;
            }
            if self.validate {
                self.check_pass_target(fb_handle, layout, cmd)?;
            }
            pass.replay(encoder, cmd)?;
        }
        pass.finish(encoder);
        for cmd in &cmds[groups.post.clone()] {
            self.replay_standalone(encoder, cmd, &mut updates)?;
        }
        Ok(updates)
    }

    /// Submit an encoded batch and stamp every buffer with the submission.
    pub(super) fn finish_batch(
        &mut self,
        encoder: wgpu::CommandEncoder,
        cmds: &[&CommandBuffer],
        updates: LayoutUpdates,
        fence: Option<FenceHandle>,
    ) -> Result<()> {
        // Queue writes are already ordered before this submit.
        self.transfer_signals.take_waits();
        let (index, number) = self.submit(encoder.finish());
        for cmd in cmds {
            cmd.mark_submitted(number);
        }
        for (texture, layout) in updates {
            if let Some(t) = self.textures.get_mut(texture) {
                t.layout = layout;
            }
        }
        self.attach_fence(fence, index, number)?;
        self.check_device()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_grow_sparse_set_slots() {
        let mut sets: slotmap::SlotMap<DescriptorSetHandle, ()> = slotmap::SlotMap::with_key();
        let a = sets.insert(());
        let mut bindings = Bindings::default();
        bindings.bind_set(2, a);
        assert_eq!(bindings.set(0), None);
        assert_eq!(bindings.set(2), Some(a));
        assert_eq!(bindings.set(7), None);
    }
}
