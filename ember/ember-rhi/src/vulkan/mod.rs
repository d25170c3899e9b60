//! Vulkan backend through `ash`. Synchronization is explicit: render submissions are fenced
//! and numbered on the submission timeline, transfers run on their own queue when the device
//! has one and are joined to render work with per-version semaphores, and every
//! `CommandBuffer` is compiled into a reusable secondary command buffer.

mod buffer;
mod descriptor;
mod device;
mod memory;
mod pipeline;
mod record;
mod render_pass;
mod sampler;
mod submit;
#[cfg(feature = "window")]
mod swapchain;
mod texture;
mod transfer;

use std::sync::Arc;

use ash::vk;
use slotmap::SlotMap;

use crate::command::{Blit, ClearValue, CommandBuffer};
use crate::config::RhiConfig;
use crate::descriptor::{
    check_buffer_write, check_sampler_write, check_texture_write, BindingType, DescriptorContents, DescriptorLayout,
    DescriptorSetUpdate, DescriptorWrite, UpdateFlag,
};
use crate::error::{Result, RhiError};
use crate::format::{BufferUsage, DataType};
use crate::frame::{FrameVersions, SubmissionTimeline, TransferSignals, TransferWindow};
use crate::handle::*;
use crate::pipeline::{ComputePipelineDesc, GraphicsStages, PipelineBuilder, ShaderDesc};
use crate::render_target::{RenderAttachments, RenderTargetLayout};
use crate::renderer::{Backend, HardwareRenderer, ShaderTarget};
use crate::resource::{SamplerDesc, TextureDesc, TextureRegion};

use buffer::VulkanBuffer;
use descriptor::{DescriptorAllocator, ResolvedWrite, VulkanDescriptorSet, VulkanSetLayout};
use device::DeviceContext;
use pipeline::{VulkanPipeline, VulkanShader};
use record::CompiledCommands;
use render_pass::{VulkanFrameBuffer, VulkanRenderPass};
use sampler::VulkanSampler;
use submit::{CommandPool, FrameResources, Retired, Submissions};
use texture::{texture_format_to_vk, VulkanTexture};

struct VulkanFence {
    device: Arc<ash::Device>,
    raw: vk::Fence,
    /// Set once the fence is queued; cleared by `fence_reset`.
    submitted: bool,
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe { self.device.destroy_fence(self.raw, None) };
    }
}

/// Fields drop in declaration order, so the device context comes last.
pub struct VulkanRenderer {
    validate: bool,
    timeline: Arc<SubmissionTimeline>,
    versions: FrameVersions,
    frames: Vec<FrameResources>,
    transfer: TransferWindow,
    transfer_signals: TransferSignals,
    submissions: Submissions,
    /// Objects waiting for the submission number they were retired under.
    retired: Vec<(u64, Retired)>,
    staging_size: u64,
    buffers: SlotMap<BufferHandle, VulkanBuffer>,
    textures: SlotMap<TextureHandle, VulkanTexture>,
    samplers: SlotMap<SamplerHandle, VulkanSampler>,
    shaders: SlotMap<ShaderHandle, VulkanShader>,
    set_layouts: SlotMap<DescriptorSetLayoutHandle, VulkanSetLayout>,
    sets: SlotMap<DescriptorSetHandle, VulkanDescriptorSet>,
    render_layouts: SlotMap<RenderTargetLayoutHandle, VulkanRenderPass>,
    frame_buffers: SlotMap<FrameBufferHandle, VulkanFrameBuffer>,
    pipelines: SlotMap<PipelineHandle, VulkanPipeline>,
    command_buffers: SlotMap<CommandBufferHandle, Option<CompiledCommands>>,
    fences: SlotMap<FenceHandle, VulkanFence>,
    #[cfg(feature = "window")]
    surfaces: SlotMap<SurfaceHandle, swapchain::VulkanSurface>,
    #[cfg_attr(not(feature = "window"), allow(dead_code))]
    vsync: bool,
    descriptors: DescriptorAllocator,
    secondary_pool: CommandPool,
    oneshot_pool: CommandPool,
    ctx: DeviceContext,
}

impl std::fmt::Debug for VulkanRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanRenderer")
            .field("device", &self.ctx.name)
            .field("versions", &self.versions)
            .field("transfer_only_queue", &self.ctx.transfer_only())
            .finish_non_exhaustive()
    }
}

impl VulkanRenderer {
    pub fn new(config: &RhiConfig) -> Result<Self> {
        let ctx = DeviceContext::new(config)?;
        let device = ctx.device.clone();
        let versions = FrameVersions::new(config.frame_versions)?;
        let frames = (0..versions.count())
            .map(|_| FrameResources::new(&device, ctx.graphics_family, ctx.transfer_family, config.staging_buffer_size))
            .collect::<Result<Vec<_>>>()?;
        let secondary_pool =
            CommandPool::new(&device, ctx.graphics_family, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;
        let oneshot_pool = CommandPool::new(
            &device,
            ctx.graphics_family,
            vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;
        log::info!(
            "Vulkan renderer ready: {} frame versions, validation {}",
            versions.count(),
            if config.validation_enabled() { "on" } else { "off" }
        );
        Ok(Self {
            validate: config.validation_enabled(),
            timeline: Arc::new(SubmissionTimeline::default()),
            transfer_signals: TransferSignals::new(versions.count()),
            versions,
            frames,
            transfer: TransferWindow::default(),
            submissions: Submissions::new(&device),
            retired: Vec::new(),
            staging_size: config.staging_buffer_size,
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
            set_layouts: SlotMap::with_key(),
            sets: SlotMap::with_key(),
            render_layouts: SlotMap::with_key(),
            frame_buffers: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            command_buffers: SlotMap::with_key(),
            fences: SlotMap::with_key(),
            #[cfg(feature = "window")]
            surfaces: SlotMap::with_key(),
            vsync: config.vsync,
            descriptors: DescriptorAllocator::new(&device, config.descriptor_pool_sets),
            secondary_pool,
            oneshot_pool,
            ctx,
        })
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&VulkanBuffer> {
        self.buffers.get(handle).ok_or(RhiError::InvalidHandle("buffer"))
    }

    fn texture(&self, handle: TextureHandle) -> Result<&VulkanTexture> {
        self.textures.get(handle).ok_or(RhiError::InvalidHandle("texture"))
    }

    fn shader(&self, handle: ShaderHandle) -> Result<&VulkanShader> {
        self.shaders.get(handle).ok_or(RhiError::InvalidHandle("shader"))
    }

    fn raw_set_layouts(&self, handles: &[DescriptorSetLayoutHandle]) -> Result<Vec<vk::DescriptorSetLayout>> {
        handles
            .iter()
            .map(|h| self.set_layouts.get(*h).map(|l| l.raw).ok_or(RhiError::InvalidHandle("descriptor set layout")))
            .collect()
    }

    fn check_descriptor_writes(&self, layout: &DescriptorLayout, writes: &[(u32, DescriptorWrite)]) -> Result<()> {
        let limits = &self.ctx.properties.limits;
        for (location, write) in writes {
            let Some(binding) = layout.get(*location) else { continue };
            match write {
                DescriptorWrite::Buffer { buffer, offset, length } => {
                    let b = self.buffer(*buffer)?;
                    check_buffer_write(*location, &binding.ty, b.usage, b.size, *offset, *length)?;
                    let align = match binding.ty {
                        BindingType::StorageBuffer { .. } => limits.min_storage_buffer_offset_alignment,
                        _ => limits.min_uniform_buffer_offset_alignment,
                    };
                    if offset % align.max(1) != 0 {
                        return Err(RhiError::contract(format!(
                            "buffer offset {offset} at location {location} is not {align}-byte aligned"
                        )));
                    }
                }
                DescriptorWrite::Texture { texture, aspect } => {
                    check_texture_write(*location, &binding.ty, &self.texture(*texture)?.desc, *aspect)?;
                }
                DescriptorWrite::Sampler(sampler) => {
                    let s = self.samplers.get(*sampler).ok_or(RhiError::InvalidHandle("sampler"))?;
                    check_sampler_write(*location, &binding.ty, &s.desc)?;
                }
            }
        }
        Ok(())
    }

    fn resolve_write(&self, write: &DescriptorWrite) -> Result<ResolvedWrite> {
        Ok(match *write {
            DescriptorWrite::Buffer { buffer, offset, length } => {
                let b = self.buffer(buffer)?;
                let range = length.unwrap_or_else(|| b.size.saturating_sub(offset));
                ResolvedWrite::Buffer { buffer: b.buffer, offset, range }
            }
            DescriptorWrite::Texture { texture, aspect } => ResolvedWrite::Image { view: self.texture(texture)?.sampled_view(aspect) },
            DescriptorWrite::Sampler(sampler) => {
                ResolvedWrite::Sampler(self.samplers.get(sampler).ok_or(RhiError::InvalidHandle("sampler"))?.sampler)
            }
        })
    }

    /// Rewrite the native set from its contents. The set must not be in use by pending work.
    fn write_native_set(&mut self, handle: DescriptorSetHandle, locations: &[u32]) -> Result<()> {
        let set = self.sets.get(handle).ok_or(RhiError::InvalidHandle("descriptor set"))?;
        let layout = &self.set_layouts.get(set.layout).ok_or(RhiError::InvalidHandle("descriptor set layout"))?.layout;
        let mut resolved = Vec::with_capacity(locations.len());
        for &location in locations {
            if let Some(write) = set.contents.get(location) {
                resolved.push((location, self.resolve_write(write)?));
            }
        }
        descriptor::write_set(&self.ctx.device, set.raw, layout, &resolved);
        let set = &mut self.sets[handle];
        set.version += 1;
        Ok(())
    }

    fn vertex_format_supported(&self, format: vk::Format) -> bool {
        unsafe {
            self.ctx
                .instance
                .get_physical_device_format_properties(self.ctx.physical_device, format)
                .buffer_features
                .contains(vk::FormatFeatureFlags::VERTEX_BUFFER)
        }
    }
}

impl Drop for VulkanRenderer {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.ctx.device.device_wait_idle() } {
            log::error!("device_wait_idle failed during shutdown: {e:?}");
        }
        self.timeline.mark_all_complete();
        let retired = std::mem::take(&mut self.retired);
        for (_, item) in retired {
            if let Retired::Secondary(cmd) = item {
                self.secondary_pool.free(cmd);
            }
        }
    }
}

impl HardwareRenderer for VulkanRenderer {
    fn backend(&self) -> Backend {
        Backend::Vulkan
    }

    fn shader_target(&self) -> ShaderTarget {
        ShaderTarget::SpirV
    }

    fn device_name(&self) -> &str {
        &self.ctx.name
    }

    fn uniform_buffer_alignment(&self) -> u64 {
        self.ctx.properties.limits.min_uniform_buffer_offset_alignment
    }

    fn storage_buffer_alignment(&self) -> u64 {
        self.ctx.properties.limits.min_storage_buffer_offset_alignment
    }

    fn validation_enabled(&self) -> bool {
        self.validate
    }

    fn set_max_temp_buffer_versions(&mut self, count: u32) -> Result<()> {
        self.transfer.require_closed(self.validate, "set_max_temp_buffer_versions")?;
        let mut versions = self.versions;
        versions.resize(count)?;
        self.wait_idle()?;
        self.frames = (0..count)
            .map(|_| {
                FrameResources::new(&self.ctx.device, self.ctx.graphics_family, self.ctx.transfer_family, self.staging_size)
            })
            .collect::<Result<Vec<_>>>()?;
        self.versions = versions;
        self.transfer_signals.resize(count);
        log::debug!("frame versions set to {count}");
        Ok(())
    }

    fn max_temp_buffer_versions(&self) -> u32 {
        self.versions.count()
    }

    fn reset_temp_buffer_version(&mut self, version: u32) -> Result<()> {
        let version = self.versions.select(version);
        match self.submissions.last_for_version(version) {
            Some(number) => self.wait_for(number),
            None => self.collect_completed(),
        }
    }

    fn temp_buffer_version(&self) -> u32 {
        self.versions.current()
    }

    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> Result<BufferHandle> {
        let families = self.ctx.queue_families();
        let buffer = buffer::create_buffer(&self.ctx.device, &self.ctx.memory_props, &families, size, usage, false)?;
        Ok(self.buffers.insert(buffer))
    }

    fn create_mapped_buffer(&mut self, size: u64, usage: BufferUsage) -> Result<BufferHandle> {
        let families = self.ctx.queue_families();
        let buffer = buffer::create_buffer(&self.ctx.device, &self.ctx.memory_props, &families, size, usage, true)?;
        Ok(self.buffers.insert(buffer))
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Result<u64> {
        Ok(self.buffer(buffer)?.size)
    }

    fn buffer_set_data(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        self.transfer.require_open(self.validate, "buffer_set_data")?;
        self.upload_buffer(buffer, offset, data)
    }

    fn buffer_get_data(&mut self, buffer: BufferHandle, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.read_buffer(buffer, offset, len)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        let b = self.buffers.remove(buffer).ok_or(RhiError::InvalidHandle("buffer"))?;
        self.retire(Retired::Object(Box::new(b)));
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureHandle> {
        let format = texture_format_to_vk(desc.format)?;
        let features = self.ctx.format_features(format);
        let families = self.ctx.queue_families();
        let texture = texture::create_texture(&self.ctx.device, features, &self.ctx.memory_props, &families, desc)?;
        self.init_texture_layout(&texture)?;
        log::trace!("created {:?} texture {}x{} {:?}", desc.kind, desc.width, desc.height, desc.format);
        Ok(self.textures.insert(texture))
    }

    fn texture_desc(&self, texture: TextureHandle) -> Result<&TextureDesc> {
        Ok(&self.texture(texture)?.desc)
    }

    fn texture_set_data(
        &mut self,
        texture: TextureHandle,
        region: TextureRegion,
        data_type: DataType,
        data: &[u8],
    ) -> Result<()> {
        self.transfer.require_open(self.validate, "texture_set_data")?;
        let t = self.texture(texture)?;
        data_type.check_upload(t.desc.format)?;
        region.check_within(&t.desc)?;
        let texel = u64::from(t.desc.format.texel_size()?);
        if data.len() as u64 != region.texel_count() * texel {
            return Err(RhiError::contract(format!(
                "{} bytes supplied for a {}x{}x{} region of {}-byte texels",
                data.len(),
                region.width,
                region.height,
                region.depth,
                texel
            )));
        }
        self.upload_texture(texture, region, data)
    }

    fn texture_get_data(&mut self, texture: TextureHandle, region: TextureRegion) -> Result<Vec<u8>> {
        self.read_texture(texture, region)
    }

    fn build_mipmaps(&mut self, texture: TextureHandle) -> Result<()> {
        self.generate_mipmaps(texture)
    }

    fn clear_texture(&mut self, texture: TextureHandle, value: ClearValue) -> Result<()> {
        self.transfer.require_open(self.validate, "clear_texture")?;
        self.clear_now(texture, value)
    }

    fn blit(&mut self, blit: Blit) -> Result<()> {
        self.blit_now(&blit)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) -> Result<()> {
        if !self.textures.contains_key(texture) {
            return Err(RhiError::InvalidHandle("texture"));
        }
        #[cfg(feature = "window")]
        self.settle_presents()?;
        let t = self.textures.remove(texture).ok_or(RhiError::InvalidHandle("texture"))?;
        self.retire(Retired::Object(Box::new(t)));
        Ok(())
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle> {
        let sampler = sampler::create_sampler(&self.ctx.device, desc, self.ctx.max_anisotropy)?;
        Ok(self.samplers.insert(sampler))
    }

    fn set_sampler(&mut self, sampler: SamplerHandle, desc: &SamplerDesc) -> Result<()> {
        if !self.samplers.contains_key(sampler) {
            return Err(RhiError::InvalidHandle("sampler"));
        }
        let replacement = sampler::create_sampler(&self.ctx.device, desc, self.ctx.max_anisotropy)?;
        let old = std::mem::replace(&mut self.samplers[sampler], replacement);
        self.retire(Retired::Object(Box::new(old)));

        let users: Vec<(DescriptorSetHandle, Vec<u32>, u64)> = self
            .sets
            .iter()
            .filter_map(|(h, s)| {
                let locations: Vec<u32> = s
                    .contents
                    .iter()
                    .filter(|(_, w)| **w == DescriptorWrite::Sampler(sampler))
                    .map(|(l, _)| l)
                    .collect();
                (!locations.is_empty()).then_some((h, locations, s.last_use))
            })
            .collect();
        if let Some(last_use) = users.iter().map(|(_, _, n)| *n).max() {
            self.wait_for(last_use)?;
        }
        for (set, locations, _) in users {
            self.write_native_set(set, &locations)?;
        }
        Ok(())
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) -> Result<()> {
        let s = self.samplers.remove(sampler).ok_or(RhiError::InvalidHandle("sampler"))?;
        self.retire(Retired::Object(Box::new(s)));
        Ok(())
    }

    fn create_shader(&mut self, desc: &ShaderDesc) -> Result<ShaderHandle> {
        let shader = VulkanShader::new(&self.ctx.device, desc)?;
        Ok(self.shaders.insert(shader))
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) -> Result<()> {
        // Pipelines keep no reference to their modules.
        self.shaders.remove(shader).map(|_| ()).ok_or(RhiError::InvalidHandle("shader"))
    }

    fn create_pipeline(&mut self, builder: &PipelineBuilder, layout: RenderTargetLayoutHandle) -> Result<PipelineHandle> {
        builder.validate_fixed_function()?;
        let typed = builder
            .shaders
            .iter()
            .map(|h| Ok((*h, self.shader(*h)?.stage)))
            .collect::<Result<Vec<_>>>()?;
        let stages = GraphicsStages::collect(&typed)?;
        let render_pass = self.render_layouts.get(layout).ok_or(RhiError::InvalidHandle("render target layout"))?;
        let set_layouts = self.raw_set_layouts(&builder.binding_layouts)?;
        let vertex = self.shader(stages.vertex.ok_or(RhiError::unsupported("missing vertex shader"))?)?;
        let fragment = stages.fragment.map(|h| self.shader(h)).transpose()?;
        let pipeline = pipeline::create_graphics_pipeline(
            &self.ctx.device,
            builder,
            vertex,
            fragment,
            &set_layouts,
            render_pass.raw,
            render_pass.layout.clone(),
            |format| self.vertex_format_supported(format),
        )?;
        Ok(self.pipelines.insert(pipeline))
    }

    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc) -> Result<PipelineHandle> {
        let shader = self.shader(desc.shader)?;
        let set_layouts = self.raw_set_layouts(&desc.binding_layouts)?;
        let pipeline = pipeline::create_compute_pipeline(&self.ctx.device, desc, shader, &set_layouts)?;
        Ok(self.pipelines.insert(pipeline))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        let p = self.pipelines.remove(pipeline).ok_or(RhiError::InvalidHandle("pipeline"))?;
        self.retire(Retired::Object(Box::new(p)));
        Ok(())
    }

    fn create_descriptor_set_layout(&mut self, layout: DescriptorLayout) -> Result<DescriptorSetLayoutHandle> {
        let layout = descriptor::create_set_layout(&self.ctx.device, layout)?;
        Ok(self.set_layouts.insert(layout))
    }

    fn create_descriptor_set(&mut self, layout: DescriptorSetLayoutHandle) -> Result<DescriptorSetHandle> {
        let raw_layout = self.set_layouts.get(layout).ok_or(RhiError::InvalidHandle("descriptor set layout"))?.raw;
        let (raw, pool) = self.descriptors.allocate(raw_layout)?;
        Ok(self.sets.insert(VulkanDescriptorSet {
            layout,
            raw,
            pool,
            contents: DescriptorContents::default(),
            updating: UpdateFlag::default(),
            version: 0,
            last_use: 0,
        }))
    }

    fn begin_update(&mut self, set: DescriptorSetHandle) -> Result<DescriptorSetUpdate> {
        self.transfer.require_open(self.validate, "descriptor set update")?;
        let s = self.sets.get_mut(set).ok_or(RhiError::InvalidHandle("descriptor set"))?;
        if self.validate && s.updating.is_raised() {
            return Err(RhiError::contract("begin_update on a set that is already being updated"));
        }
        let layout = self.set_layouts[s.layout].layout.clone();
        Ok(DescriptorSetUpdate::new(set, layout, self.validate, s.updating.clone()))
    }

    fn end_update(&mut self, update: DescriptorSetUpdate) -> Result<()> {
        let (handle, writes) = update.into_writes();
        let (layout, last_use) = match self.sets.get(handle) {
            Some(set) => (self.set_layouts[set.layout].layout.clone(), set.last_use),
            None => return Err(RhiError::InvalidHandle("descriptor set")),
        };
        if self.validate {
            let list: Vec<_> = writes.iter().map(|(k, v)| (*k, *v)).collect();
            self.check_descriptor_writes(&layout, &list)?;
        }
        // Native sets cannot change under pending work.
        self.wait_for(last_use)?;
        let locations: Vec<u32> = writes.keys().copied().collect();
        self.sets[handle].contents.apply(writes);
        self.write_native_set(handle, &locations)
    }

    fn destroy_descriptor_set(&mut self, set: DescriptorSetHandle) -> Result<()> {
        let s = self.sets.remove(set).ok_or(RhiError::InvalidHandle("descriptor set"))?;
        self.retire(Retired::DescriptorSet { pool: s.pool, raw: s.raw });
        Ok(())
    }

    fn create_render_target_layout(&mut self, layout: RenderTargetLayout) -> Result<RenderTargetLayoutHandle> {
        let render_pass = render_pass::create_render_pass(&self.ctx.device, &layout)?;
        Ok(self.render_layouts.insert(render_pass))
    }

    fn create_frame_buffer(
        &mut self,
        layout: RenderTargetLayoutHandle,
        attachments: &RenderAttachments,
    ) -> Result<FrameBufferHandle> {
        let render_pass = self.render_layouts.get(layout).ok_or(RhiError::InvalidHandle("render target layout"))?;
        let extent = attachments.check_against(&render_pass.layout, |h| {
            self.textures.get(h).map(|t| &t.desc).ok_or(RhiError::InvalidHandle("texture"))
        })?;
        let mut views = Vec::with_capacity(attachments.images().len());
        for image in attachments.images() {
            let view = self.texture(image.texture).and_then(|t| t.attachment_view(image.layer, image.mip_level));
            match view {
                Ok(view) => views.push(view),
                Err(e) => {
                    for view in views {
                        unsafe { self.ctx.device.destroy_image_view(view, None) };
                    }
                    return Err(e);
                }
            }
        }
        let textures = attachments.images().iter().map(|i| i.texture).collect();
        let frame_buffer =
            render_pass::create_frame_buffer(&self.ctx.device, render_pass.raw, layout, views, textures, extent)?;
        Ok(self.frame_buffers.insert(frame_buffer))
    }

    fn destroy_frame_buffer(&mut self, frame_buffer: FrameBufferHandle) -> Result<()> {
        let fb = self.frame_buffers.remove(frame_buffer).ok_or(RhiError::InvalidHandle("frame buffer"))?;
        self.retire(Retired::Object(Box::new(fb)));
        Ok(())
    }

    fn create_command_buffer(&mut self) -> Result<CommandBuffer> {
        let handle = self.command_buffers.insert(None);
        Ok(CommandBuffer::new(handle, self.timeline.clone(), self.validate))
    }

    fn destroy_command_buffer(&mut self, cmd: CommandBuffer) -> Result<()> {
        self.forget_commands(cmd.handle())
    }

    fn begin_data_transfer(&mut self) -> Result<()> {
        self.transfer.begin(self.validate)?;
        self.begin_transfer_stream()
    }

    fn end_data_transfer(&mut self) -> Result<()> {
        self.transfer.end(self.validate)?;
        self.end_transfer_stream()
    }

    fn transfer_barrier(&mut self, version: u32) -> Result<()> {
        self.transfer_signals.barrier(version, self.validate).map(|_| ())
    }

    fn execute_render_pass(
        &mut self,
        frame_buffer: FrameBufferHandle,
        cmds: &[&CommandBuffer],
        fence: Option<FenceHandle>,
    ) -> Result<()> {
        self.transfer.require_closed(self.validate, "execute_render_pass")?;
        self.execute_batch(Some(frame_buffer), cmds, fence)
    }

    fn execute_non_render_command_buffers(&mut self, cmds: &[&CommandBuffer], fence: Option<FenceHandle>) -> Result<()> {
        self.transfer.require_closed(self.validate, "execute_non_render_command_buffers")?;
        self.execute_batch(None, cmds, fence)
    }

    fn wait(&mut self) -> Result<()> {
        self.wait_idle()
    }

    fn create_fence(&mut self) -> Result<FenceHandle> {
        let raw = unsafe { self.ctx.device.create_fence(&vk::FenceCreateInfo::default(), None)? };
        Ok(self.fences.insert(VulkanFence { device: self.ctx.device.clone(), raw, submitted: false }))
    }

    fn fence_wait(&mut self, fence: FenceHandle) -> Result<()> {
        let f = self.fences.get(fence).ok_or(RhiError::InvalidHandle("fence"))?;
        if !f.submitted {
            if self.validate {
                return Err(RhiError::contract("waiting on a fence that was never submitted"));
            }
            return Ok(());
        }
        unsafe { self.ctx.device.wait_for_fences(&[f.raw], true, u64::MAX)? };
        self.collect_completed()
    }

    fn fence_is_signaled(&mut self, fence: FenceHandle) -> Result<bool> {
        let f = self.fences.get(fence).ok_or(RhiError::InvalidHandle("fence"))?;
        if !f.submitted {
            return Ok(false);
        }
        Ok(unsafe { self.ctx.device.get_fence_status(f.raw)? })
    }

    fn fence_reset(&mut self, fence: FenceHandle) -> Result<()> {
        let f = self.fences.get_mut(fence).ok_or(RhiError::InvalidHandle("fence"))?;
        if f.submitted {
            // A queued signal must land before the fence can be reset.
            unsafe {
                self.ctx.device.wait_for_fences(&[f.raw], true, u64::MAX)?;
                self.ctx.device.reset_fences(&[f.raw])?;
            }
            f.submitted = false;
        }
        Ok(())
    }

    fn destroy_fence(&mut self, fence: FenceHandle) -> Result<()> {
        let f = self.fences.remove(fence).ok_or(RhiError::InvalidHandle("fence"))?;
        if f.submitted {
            unsafe { self.ctx.device.wait_for_fences(&[f.raw], true, u64::MAX)? };
        }
        Ok(())
    }

    #[cfg(feature = "window")]
    fn create_window_surface(
        &mut self,
        display: raw_window_handle::RawDisplayHandle,
        window: raw_window_handle::RawWindowHandle,
        width: u32,
        height: u32,
    ) -> Result<SurfaceHandle> {
        let surface = swapchain::VulkanSurface::new(&self.ctx, display, window, width, height, self.vsync)?;
        Ok(self.surfaces.insert(surface))
    }

    #[cfg(feature = "window")]
    fn resize_surface(&mut self, surface: SurfaceHandle, width: u32, height: u32) -> Result<()> {
        if !self.surfaces.contains_key(surface) {
            return Err(RhiError::InvalidHandle("surface"));
        }
        self.wait_idle()?;
        let s = &mut self.surfaces[surface];
        s.resize(&self.ctx, width, height)
    }

    #[cfg(feature = "window")]
    fn present(&mut self, surface: SurfaceHandle, texture: TextureHandle) -> Result<()> {
        self.present_texture(surface, texture)
    }

    #[cfg(feature = "window")]
    fn destroy_surface(&mut self, surface: SurfaceHandle) -> Result<()> {
        if !self.surfaces.contains_key(surface) {
            return Err(RhiError::InvalidHandle("surface"));
        }
        self.wait_idle()?;
        self.surfaces.remove(surface);
        Ok(())
    }
}
