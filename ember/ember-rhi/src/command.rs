//! Command recording. A `CommandBuffer` is a caller-owned list of `Command`s; the renderer
//! replays it at execute time, either immediately (wgpu) or from a pre-recorded native
//! secondary buffer (Vulkan).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, RhiError};
use crate::format::IndexFormat;
use crate::frame::SubmissionTimeline;
use crate::handle::{
    BufferHandle, CommandBufferHandle, DescriptorSetHandle, FrameBufferHandle, PipelineHandle,
    RenderTargetLayoutHandle, TextureHandle,
};
use crate::resource::{TextureDesc, TextureRegion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// The part of the viewport inside a `(width, height)` target as `[x, y, w, h]`,
    /// or `None` when nothing is left. Draws are scissored to this rectangle; the viewport
    /// transform itself keeps the requested rectangle.
    pub fn scissor(self, extent: (u32, u32)) -> Option<[u32; 4]> {
        let x0 = i64::from(self.x).clamp(0, i64::from(extent.0)) as u32;
        let y0 = i64::from(self.y).clamp(0, i64::from(extent.1)) as u32;
        let x1 = (i64::from(self.x) + i64::from(self.width)).clamp(0, i64::from(extent.0)) as u32;
        let y1 = (i64::from(self.y) + i64::from(self.height)).clamp(0, i64::from(extent.1)) as u32;
        (x1 > x0 && y1 > y0).then(|| [x0, y0, x1 - x0, y1 - y0])
    }

    /// Whether the whole rectangle lies inside the target.
    pub fn fits(self, extent: (u32, u32)) -> bool {
        self.x >= 0
            && self.y >= 0
            && i64::from(self.x) + i64::from(self.width) <= i64::from(extent.0)
            && i64::from(self.y) + i64::from(self.height) <= i64::from(extent.1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

/// Clear one attachment slot of the current frame buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttachmentClear {
    pub attachment: u32,
    pub value: ClearValue,
}

impl AttachmentClear {
    pub fn color(attachment: u32, rgba: [f32; 4]) -> Self {
        Self { attachment, value: ClearValue::Color(rgba) }
    }

    pub fn depth(attachment: u32, depth: f32, stencil: u32) -> Self {
        Self { attachment, value: ClearValue::DepthStencil { depth, stencil } }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutTransfer {
    UndefinedToRenderAttachment,
    RenderAttachmentToSample,
    SampleToRenderAttachment,
}

/// The layout a texture is currently in, as far as commands are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    RenderAttachment,
    ShaderRead,
}

impl LayoutTransfer {
    /// Required source layout (`None` discards whatever was there) and the resulting layout.
    pub fn layouts(self) -> (Option<ImageLayout>, ImageLayout) {
        match self {
            LayoutTransfer::UndefinedToRenderAttachment => (None, ImageLayout::RenderAttachment),
            LayoutTransfer::RenderAttachmentToSample => {
                (Some(ImageLayout::RenderAttachment), ImageLayout::ShaderRead)
            }
            LayoutTransfer::SampleToRenderAttachment => {
                (Some(ImageLayout::ShaderRead), ImageLayout::RenderAttachment)
            }
        }
    }

    /// Check `current` against the required source layout and return the new one.
    pub fn apply(self, current: ImageLayout, validate: bool) -> Result<ImageLayout> {
        let (from, to) = self.layouts();
        if let Some(from) = from {
            if validate && current != from {
                return Err(RhiError::contract(format!(
                    "{self:?} on a texture in {current:?} layout"
                )));
            }
        }
        Ok(to)
    }
}

/// Copy a box of texels from one texture to another. No scaling; formats must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blit {
    pub src: TextureHandle,
    pub src_mip: u32,
    pub src_origin: [u32; 3],
    pub dst: TextureHandle,
    pub dst_mip: u32,
    pub dst_origin: [u32; 3],
    /// Width, height, and depth (or layer count).
    pub extent: [u32; 3],
}

impl Blit {
    pub fn src_region(&self) -> TextureRegion {
        TextureRegion {
            mip_level: self.src_mip,
            x: self.src_origin[0],
            y: self.src_origin[1],
            z: self.src_origin[2],
            width: self.extent[0],
            height: self.extent[1],
            depth: self.extent[2],
        }
    }

    pub fn dst_region(&self) -> TextureRegion {
        TextureRegion {
            mip_level: self.dst_mip,
            x: self.dst_origin[0],
            y: self.dst_origin[1],
            z: self.dst_origin[2],
            ..self.src_region()
        }
    }

    /// Formats must match and both boxes must fit their mip levels.
    pub fn check(&self, src: &TextureDesc, dst: &TextureDesc) -> Result<()> {
        if src.format != dst.format {
            return Err(RhiError::contract(format!("blit between {:?} and {:?}", src.format, dst.format)));
        }
        self.src_region().check_within(src)?;
        self.dst_region().check_within(dst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetViewport(Viewport),
    BindVertexBuffer { buffer: BufferHandle, offset: u64 },
    BindIndexBuffer { buffer: BufferHandle, offset: u64, format: IndexFormat },
    BindPipeline(PipelineHandle),
    BindDescriptorSet { index: u32, set: DescriptorSetHandle },
    Draw { first_vertex: u32, vertex_count: u32, instances: u32 },
    DrawIndexed { first_index: u32, index_count: u32, instances: u32 },
    ClearAttachments(Vec<AttachmentClear>),
    Blit(Blit),
    TransferLayout { textures: Vec<TextureHandle>, direction: LayoutTransfer },
    Dispatch { x: u32, y: u32, z: u32 },
}

impl Command {
    /// Only valid inside a render pass.
    pub fn is_render_pass_only(&self) -> bool {
        matches!(
            self,
            Command::SetViewport(_)
                | Command::BindVertexBuffer { .. }
                | Command::BindIndexBuffer { .. }
                | Command::Draw { .. }
                | Command::DrawIndexed { .. }
                | Command::ClearAttachments(_)
        )
    }

    /// Only valid outside a render pass.
    pub fn is_standalone_only(&self) -> bool {
        matches!(
            self,
            Command::Blit(_) | Command::TransferLayout { .. } | Command::Dispatch { .. }
        )
    }
}

/// What a buffer records against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordTarget {
    Standalone,
    FrameBuffer(FrameBufferHandle),
    Layout(RenderTargetLayoutHandle),
}

impl RecordTarget {
    pub fn in_render_pass(self) -> bool {
        !matches!(self, RecordTarget::Standalone)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Submitted,
}

#[derive(Debug, Default, Clone)]
struct BoundState {
    pipeline: Option<PipelineHandle>,
    vertex: Option<(BufferHandle, u64)>,
    index: Option<(BufferHandle, u64, IndexFormat)>,
    viewport: Option<Viewport>,
}

pub struct CommandBuffer {
    handle: CommandBufferHandle,
    state: CommandBufferState,
    target: RecordTarget,
    commands: Vec<Command>,
    bound: BoundState,
    error: Option<RhiError>,
    /// Bumped on every `begin_recording*`; lets the pre-recorded backend skip recompiling.
    epoch: u64,
    last_submission: AtomicU64,
    timeline: Arc<SubmissionTimeline>,
    validate: bool,
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .field("state", &self.state())
            .field("target", &self.target)
            .field("commands", &self.commands.len())
            .finish_non_exhaustive()
    }
}

impl CommandBuffer {
    pub(crate) fn new(handle: CommandBufferHandle, timeline: Arc<SubmissionTimeline>, validate: bool) -> Self {
        Self {
            handle,
            state: CommandBufferState::Initial,
            target: RecordTarget::Standalone,
            commands: Vec::new(),
            bound: BoundState::default(),
            error: None,
            epoch: 0,
            last_submission: AtomicU64::new(0),
            timeline,
            validate,
        }
    }

    pub fn handle(&self) -> CommandBufferHandle {
        self.handle
    }

    pub fn state(&self) -> CommandBufferState {
        match self.state {
            CommandBufferState::Executable if self.is_pending() => CommandBufferState::Submitted,
            s => s,
        }
    }

    pub fn target(&self) -> RecordTarget {
        self.target
    }

    pub fn in_render_pass(&self) -> bool {
        self.target.in_render_pass()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn is_pending(&self) -> bool {
        !self.timeline.is_complete(self.last_submission.load(Ordering::Acquire))
    }

    /// Start a standalone buffer (transfers, layout transitions, compute).
    pub fn begin_recording(&mut self) -> Result<()> {
        self.begin(RecordTarget::Standalone)
    }

    pub fn begin_recording_with_frame_buffer(&mut self, frame_buffer: FrameBufferHandle) -> Result<()> {
        self.begin(RecordTarget::FrameBuffer(frame_buffer))
    }

    /// Render-pass buffer usable with any frame buffer of `layout`.
    pub fn begin_recording_with_layout(&mut self, layout: RenderTargetLayoutHandle) -> Result<()> {
        self.begin(RecordTarget::Layout(layout))
    }

    fn begin(&mut self, target: RecordTarget) -> Result<()> {
        if self.validate {
            match self.state() {
                CommandBufferState::Recording => {
                    return Err(RhiError::contract("begin_recording on a buffer that is already recording"))
                }
                CommandBufferState::Submitted => {
                    return Err(RhiError::contract(
                        "command buffer re-recorded before its submission completed",
                    ))
                }
                CommandBufferState::Initial | CommandBufferState::Executable => {}
            }
        }
        self.state = CommandBufferState::Recording;
        self.target = target;
        self.commands.clear();
        self.bound = BoundState::default();
        self.error = None;
        self.epoch += 1;
        Ok(())
    }

    /// Finish recording. Returns the first contract violation hit while recording.
    pub fn end_recording(&mut self) -> Result<()> {
        if self.state != CommandBufferState::Recording {
            if self.validate {
                return Err(RhiError::contract("end_recording without begin_recording"));
            }
            return Ok(());
        }
        self.state = CommandBufferState::Executable;
        match self.error.take() {
            Some(e) => {
                self.commands.clear();
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn record(&mut self, command: Command) {
        if self.validate && self.error.is_none() {
            if let Err(e) = self.check(&command) {
                self.error = Some(e);
                return;
            }
        }
        self.commands.push(command);
    }

    fn check(&self, command: &Command) -> Result<()> {
        if self.state != CommandBufferState::Recording {
            return Err(RhiError::contract(format!("{command:?} recorded outside begin/end_recording")));
        }
        if !self.in_render_pass() && command.is_render_pass_only() {
            return Err(RhiError::contract(format!("{command:?} is only valid inside a render pass")));
        }
        if self.in_render_pass() && command.is_standalone_only() {
            return Err(RhiError::contract(format!("{command:?} is not valid inside a render pass")));
        }
        if matches!(command, Command::Draw { .. } | Command::DrawIndexed { .. } | Command::Dispatch { .. })
            && self.bound.pipeline.is_none()
        {
            return Err(RhiError::contract("draw or dispatch without a bound pipeline"));
        }
        if matches!(command, Command::DrawIndexed { .. }) && self.bound.index.is_none() {
            return Err(RhiError::contract("indexed draw without a bound index buffer"));
        }
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        if self.bound.viewport == Some(viewport) {
            return;
        }
        self.bound.viewport = Some(viewport);
        self.record(Command::SetViewport(viewport));
    }

    pub fn bind_vertex_buffer(&mut self, buffer: BufferHandle, offset: u64) {
        if self.bound.vertex == Some((buffer, offset)) {
            return;
        }
        self.bound.vertex = Some((buffer, offset));
        self.record(Command::BindVertexBuffer { buffer, offset });
    }

    pub fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        if self.bound.index == Some((buffer, offset, format)) {
            return;
        }
        self.bound.index = Some((buffer, offset, format));
        self.record(Command::BindIndexBuffer { buffer, offset, format });
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        if self.bound.pipeline == Some(pipeline) {
            return;
        }
        self.bound.pipeline = Some(pipeline);
        self.record(Command::BindPipeline(pipeline));
    }

    pub fn bind_descriptor_set(&mut self, index: u32, set: DescriptorSetHandle) {
        self.record(Command::BindDescriptorSet { index, set });
    }

    pub fn draw(&mut self, first_vertex: u32, vertex_count: u32) {
        self.draw_instanced(1, first_vertex, vertex_count);
    }

    pub fn draw_instanced(&mut self, instances: u32, first_vertex: u32, vertex_count: u32) {
        self.record(Command::Draw { first_vertex, vertex_count, instances });
    }

    pub fn draw_indexed(&mut self, first_index: u32, index_count: u32) {
        self.draw_indexed_instanced(1, first_index, index_count);
    }

    pub fn draw_indexed_instanced(&mut self, instances: u32, first_index: u32, index_count: u32) {
        self.record(Command::DrawIndexed { first_index, index_count, instances });
    }

    pub fn clear_attachments(&mut self, clears: &[AttachmentClear]) {
        self.record(Command::ClearAttachments(clears.to_vec()));
    }

    pub fn blit(&mut self, blit: Blit) {
        self.record(Command::Blit(blit));
    }

    pub fn transfer_layout(&mut self, textures: &[TextureHandle], direction: LayoutTransfer) {
        self.record(Command::TransferLayout { textures: textures.to_vec(), direction });
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.record(Command::Dispatch { x, y, z });
    }

    /// Check the buffer is executable and not still in flight.
    pub(crate) fn check_submittable(&self, validate: bool) -> Result<()> {
        if !validate {
            return Ok(());
        }
        match self.state() {
            CommandBufferState::Executable => Ok(()),
            CommandBufferState::Submitted => {
                Err(RhiError::contract("command buffer submitted again before its previous submission completed"))
            }
            s => Err(RhiError::contract(format!("command buffer in state {s:?} cannot be executed"))),
        }
    }

    pub(crate) fn mark_submitted(&self, submission: u64) {
        self.last_submission.store(submission, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    struct Fixture {
        timeline: Arc<SubmissionTimeline>,
        cmd: CommandBuffer,
        fb: FrameBufferHandle,
        pipeline: PipelineHandle,
        buffer: BufferHandle,
        texture: TextureHandle,
    }

    fn fixture() -> Fixture {
        let timeline = Arc::new(SubmissionTimeline::default());
        let handle = SlotMap::<CommandBufferHandle, ()>::with_key().insert(());
        Fixture {
            cmd: CommandBuffer::new(handle, timeline.clone(), true),
            timeline,
            fb: SlotMap::<FrameBufferHandle, ()>::with_key().insert(()),
            pipeline: SlotMap::<PipelineHandle, ()>::with_key().insert(()),
            buffer: SlotMap::<BufferHandle, ()>::with_key().insert(()),
            texture: SlotMap::<TextureHandle, ()>::with_key().insert(()),
        }
    }

    #[test]
    fn redundant_binds_are_elided() {
        let mut f = fixture();
        let cmd = &mut f.cmd;
        cmd.begin_recording_with_frame_buffer(f.fb).unwrap();
        cmd.bind_pipeline(f.pipeline);
        cmd.bind_pipeline(f.pipeline);
        cmd.set_viewport(Viewport::new(0, 0, 64, 64));
        cmd.set_viewport(Viewport::new(0, 0, 64, 64));
        cmd.bind_vertex_buffer(f.buffer, 0);
        cmd.bind_vertex_buffer(f.buffer, 0);
        cmd.bind_vertex_buffer(f.buffer, 16);
        cmd.bind_index_buffer(f.buffer, 0, IndexFormat::Uint16);
        cmd.bind_index_buffer(f.buffer, 0, IndexFormat::Uint16);
        cmd.bind_index_buffer(f.buffer, 0, IndexFormat::Uint32);
        cmd.draw_indexed(0, 3);
        cmd.end_recording().unwrap();

        assert_eq!(
            cmd.commands(),
            &[
                Command::BindPipeline(f.pipeline),
                Command::SetViewport(Viewport::new(0, 0, 64, 64)),
                Command::BindVertexBuffer { buffer: f.buffer, offset: 0 },
                Command::BindVertexBuffer { buffer: f.buffer, offset: 16 },
                Command::BindIndexBuffer { buffer: f.buffer, offset: 0, format: IndexFormat::Uint16 },
                Command::BindIndexBuffer { buffer: f.buffer, offset: 0, format: IndexFormat::Uint32 },
                Command::DrawIndexed { first_index: 0, index_count: 3, instances: 1 },
            ]
        );
    }

    #[test]
    fn draw_in_standalone_buffer_is_a_violation() {
        let mut f = fixture();
        f.cmd.begin_recording().unwrap();
        f.cmd.bind_pipeline(f.pipeline);
        f.cmd.draw(0, 3);
        let err = f.cmd.end_recording().unwrap_err();
        assert!(matches!(err, RhiError::ContractViolation(_)));
        assert!(f.cmd.commands().is_empty());
    }

    #[test]
    fn blit_inside_render_pass_is_a_violation() {
        let mut f = fixture();
        f.cmd.begin_recording_with_frame_buffer(f.fb).unwrap();
        f.cmd.transfer_layout(&[f.texture], LayoutTransfer::RenderAttachmentToSample);
        assert!(f.cmd.end_recording().is_err());
    }

    #[test]
    fn submitted_state_follows_timeline() {
        let mut f = fixture();
        f.cmd.begin_recording().unwrap();
        f.cmd.transfer_layout(&[f.texture], LayoutTransfer::UndefinedToRenderAttachment);
        f.cmd.end_recording().unwrap();
        assert_eq!(f.cmd.state(), CommandBufferState::Executable);

        let submission = f.timeline.next_submission();
        f.cmd.mark_submitted(submission);
        assert_eq!(f.cmd.state(), CommandBufferState::Submitted);
        assert!(f.cmd.begin_recording().is_err());
        assert!(f.cmd.check_submittable(true).is_err());

        f.timeline.mark_complete(submission);
        assert_eq!(f.cmd.state(), CommandBufferState::Executable);
        f.cmd.begin_recording().unwrap();
        f.cmd.end_recording().unwrap();
        assert!(f.cmd.commands().is_empty());
    }

    #[test]
    fn re_recording_replaces_content_and_bumps_epoch() {
        let mut f = fixture();
        f.cmd.begin_recording_with_frame_buffer(f.fb).unwrap();
        f.cmd.clear_attachments(&[AttachmentClear::color(0, [1.0, 0.0, 0.0, 1.0])]);
        f.cmd.end_recording().unwrap();
        let first = f.cmd.epoch();

        f.cmd.begin_recording_with_frame_buffer(f.fb).unwrap();
        f.cmd.clear_attachments(&[AttachmentClear::color(0, [0.0, 0.0, 1.0, 1.0])]);
        f.cmd.end_recording().unwrap();
        assert!(f.cmd.epoch() > first);
        assert_eq!(
            f.cmd.commands(),
            &[Command::ClearAttachments(vec![AttachmentClear::color(0, [0.0, 0.0, 1.0, 1.0])])]
        );
    }

    #[test]
    fn layout_transfers_check_source_layout() {
        let sampled = LayoutTransfer::RenderAttachmentToSample
            .apply(ImageLayout::RenderAttachment, true)
            .unwrap();
        assert_eq!(sampled, ImageLayout::ShaderRead);
        assert!(LayoutTransfer::RenderAttachmentToSample.apply(ImageLayout::ShaderRead, true).is_err());
        assert_eq!(
            LayoutTransfer::UndefinedToRenderAttachment.apply(ImageLayout::ShaderRead, true).unwrap(),
            ImageLayout::RenderAttachment
        );
    }

    #[test]
    fn viewport_scissor_is_the_overlap_with_the_target() {
        assert_eq!(Viewport::new(-10, 0, 50, 20).scissor((32, 32)), Some([0, 0, 32, 20]));
        assert_eq!(Viewport::new(40, 0, 8, 8).scissor((32, 32)), None);
        assert_eq!(Viewport::new(300, 300, 10, 10).scissor((256, 256)), None);
        assert_eq!(Viewport::new(-20, -20, 10, 10).scissor((32, 32)), None);
        assert_eq!(Viewport::new(4, 4, 8, 8).scissor((32, 32)), Some([4, 4, 8, 8]));
        assert!(Viewport::new(4, 4, 8, 8).fits((32, 32)));
        assert!(!Viewport::new(-10, 0, 50, 20).fits((32, 32)));
        assert!(!Viewport::new(0, 0, 33, 32).fits((32, 32)));
    }

    #[test]
    fn elision_state_resets_between_recordings() {
        let mut f = fixture();
        f.cmd.begin_recording_with_frame_buffer(f.fb).unwrap();
        f.cmd.bind_pipeline(f.pipeline);
        f.cmd.end_recording().unwrap();
        f.cmd.begin_recording_with_frame_buffer(f.fb).unwrap();
        f.cmd.bind_pipeline(f.pipeline);
        f.cmd.end_recording().unwrap();
        assert_eq!(f.cmd.commands(), &[Command::BindPipeline(f.pipeline)]);
    }
}
