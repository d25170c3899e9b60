//! wgpu backend: immediate replay. Command buffers are interpreted into a fresh
//! `wgpu::CommandEncoder` at execute time; queue writes made inside the data transfer
//! window are flushed by the next submit.

mod blit;
mod convert;
mod replay;
#[cfg(feature = "window")]
mod surface;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use slotmap::SlotMap;

use crate::command::{Blit, ClearValue, CommandBuffer, ImageLayout};
use crate::config::RhiConfig;
use crate::descriptor::{
    check_buffer_write, check_sampler_write, check_texture_write, DescriptorContents, DescriptorLayout,
    DescriptorSetUpdate, DescriptorWrite, UpdateFlag,
};
use crate::error::{Result, RhiError};
use crate::format::{BufferUsage, DataType, TextureUsage};
use crate::frame::{FrameVersions, SubmissionTimeline, TransferSignals, TransferWindow};
use crate::handle::*;
use crate::pipeline::{
    ComputePipelineDesc, GraphicsStages, PipelineBuilder, ShaderCode, ShaderDesc, ShaderType,
};
use crate::render_target::{RenderAttachments, RenderTargetLayout};
use crate::renderer::{Backend, HardwareRenderer, ShaderTarget};
use crate::resource::{buffer_range_end, SamplerDesc, TextureAspect, TextureDesc, TextureKind, TextureRegion};

use blit::Blitter;

/// wgpu requires 4-byte aligned buffer copies.
const COPY_ALIGN: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

struct WgpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
    usage: BufferUsage,
    host_visible: bool,
}

struct WgpuTexture {
    desc: TextureDesc,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    layout: ImageLayout,
    renderable: bool,
}

struct WgpuSampler {
    desc: SamplerDesc,
    sampler: wgpu::Sampler,
}

struct WgpuShader {
    stage: ShaderType,
    module: wgpu::ShaderModule,
    entry_point: String,
}

struct WgpuSetLayout {
    layout: Arc<DescriptorLayout>,
    bind_group_layout: wgpu::BindGroupLayout,
}

struct WgpuDescriptorSet {
    layout: DescriptorSetLayoutHandle,
    contents: DescriptorContents,
    bind_group: Option<wgpu::BindGroup>,
    updating: UpdateFlag,
    dirty: bool,
}

struct WgpuFrameBuffer {
    layout: RenderTargetLayoutHandle,
    attachments: Vec<(TextureHandle, wgpu::TextureView)>,
    extent: (u32, u32),
}

enum PipelineKind {
    Graphics { render_layout: RenderTargetLayout, stencil_reference: u32 },
    Compute,
}

struct WgpuPipeline {
    kind: PipelineKind,
    render_pipeline: Option<wgpu::RenderPipeline>,
    compute_pipeline: Option<wgpu::ComputePipeline>,
    set_layouts: Vec<DescriptorSetLayoutHandle>,
}

#[derive(Default)]
struct WgpuFence {
    submission: Option<(wgpu::SubmissionIndex, u64)>,
    signaled: Arc<AtomicBool>,
}

pub struct WgpuRenderer {
    #[cfg_attr(not(feature = "window"), allow(dead_code))]
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    name: String,
    limits: wgpu::Limits,
    validate: bool,
    device_lost: Arc<AtomicBool>,
    timeline: Arc<SubmissionTimeline>,
    versions: FrameVersions,
    version_submissions: Vec<Option<(wgpu::SubmissionIndex, u64)>>,
    transfer: TransferWindow,
    transfer_signals: TransferSignals,
    blitter: Blitter,
    buffers: SlotMap<BufferHandle, WgpuBuffer>,
    textures: SlotMap<TextureHandle, WgpuTexture>,
    samplers: SlotMap<SamplerHandle, WgpuSampler>,
    shaders: SlotMap<ShaderHandle, WgpuShader>,
    set_layouts: SlotMap<DescriptorSetLayoutHandle, WgpuSetLayout>,
    sets: SlotMap<DescriptorSetHandle, WgpuDescriptorSet>,
    render_layouts: SlotMap<RenderTargetLayoutHandle, RenderTargetLayout>,
    frame_buffers: SlotMap<FrameBufferHandle, WgpuFrameBuffer>,
    pipelines: SlotMap<PipelineHandle, WgpuPipeline>,
    command_buffers: SlotMap<CommandBufferHandle, ()>,
    fences: SlotMap<FenceHandle, WgpuFence>,
    #[cfg(feature = "window")]
    surfaces: SlotMap<SurfaceHandle, surface::WgpuSurface>,
    #[cfg_attr(not(feature = "window"), allow(dead_code))]
    vsync: bool,
}

impl std::fmt::Debug for WgpuRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuRenderer")
            .field("adapter", &self.name)
            .field("versions", &self.versions)
            .finish_non_exhaustive()
    }
}

impl WgpuRenderer {
    pub fn new(config: &RhiConfig) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = match config.gpu_index {
            Some(index) => instance
                .enumerate_adapters(wgpu::Backends::all())
                .into_iter()
                .nth(index)
                .ok_or_else(|| RhiError::unsupported(format!("no wgpu adapter at index {index}")))?,
            None => pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            }))
            .ok_or_else(|| RhiError::unsupported("no wgpu adapter available"))?,
        };
        let info = adapter.get_info();
        log::info!("wgpu adapter: {} ({:?}, {:?})", info.name, info.backend, info.device_type);

        let wanted = wgpu::Features::TEXTURE_FORMAT_16BIT_NORM
            | wgpu::Features::FLOAT32_FILTERABLE
            | wgpu::Features::TEXTURE_COMPRESSION_BC
            | wgpu::Features::RG11B10UFLOAT_RENDERABLE;
        let features = adapter.features() & wanted;
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("ember_device"),
                required_features: features,
                required_limits: adapter.limits(),
                ..Default::default()
            },
            None,
        ))
        .map_err(|e| RhiError::unsupported(format!("wgpu device creation failed: {e}")))?;

        let device_lost = Arc::new(AtomicBool::new(false));
        let lost = device_lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            log::error!("wgpu device lost ({reason:?}): {message}");
            lost.store(true, Ordering::Release);
        });
        device.on_uncaptured_error(Box::new(|e| log::error!("wgpu: {e}")));

        let limits = device.limits();
        let versions = FrameVersions::new(config.frame_versions)?;
        let blitter = Blitter::new(&device);
        Ok(Self {
            instance,
            adapter,
            name: info.name,
            limits,
            validate: config.validation_enabled(),
            device_lost,
            timeline: Arc::new(SubmissionTimeline::default()),
            version_submissions: vec![None; versions.count() as usize],
            transfer_signals: TransferSignals::new(versions.count()),
            versions,
            transfer: TransferWindow::default(),
            blitter,
            device,
            queue,
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
        })
    }

    fn check_device(&self) -> Result<()> {
        if self.device_lost.load(Ordering::Acquire) {
            return Err(RhiError::DeviceLost);
        }
        Ok(())
    }

    /// Run `f` inside a validation error scope so wgpu errors come back as `Result`s.
    fn scoped<T>(&self, what: &str, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(RhiError::unsupported(format!("{what}: {err}"))),
            None => Ok(value),
        }
    }

    /// Submit and stamp the submission on the timeline and the current frame version.
    fn submit(&mut self, command_buffer: wgpu::CommandBuffer) -> (wgpu::SubmissionIndex, u64) {
        let number = self.timeline.next_submission();
        let index = self.queue.submit(Some(command_buffer));
        let timeline = self.timeline.clone();
        self.queue.on_submitted_work_done(move || timeline.mark_complete(number));
        self.version_submissions[self.versions.current() as usize] = Some((index.clone(), number));
        (index, number)
    }

    fn wait_for(&self, index: wgpu::SubmissionIndex, number: u64) -> Result<()> {
        self.device.poll(wgpu::Maintain::wait_for(index));
        self.timeline.mark_complete(number);
        self.check_device()
    }

    fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&WgpuBuffer> {
        self.buffers.get(handle).ok_or(RhiError::InvalidHandle("buffer"))
    }

    fn texture(&self, handle: TextureHandle) -> Result<&WgpuTexture> {
        self.textures.get(handle).ok_or(RhiError::InvalidHandle("texture"))
    }

    fn make_buffer(&mut self, size: u64, usage: BufferUsage, host_visible: bool) -> Result<BufferHandle> {
        if size == 0 {
            return Err(RhiError::unsupported("buffer size must be non-zero"));
        }
        let mut usages = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
        if usage.contains(BufferUsage::VERTEX) {
            usages |= wgpu::BufferUsages::VERTEX;
        }
        if usage.contains(BufferUsage::INDEX) {
            usages |= wgpu::BufferUsages::INDEX;
        }
        if usage.contains(BufferUsage::UNIFORM) {
            usages |= wgpu::BufferUsages::UNIFORM;
        }
        if usage.contains(BufferUsage::STORAGE) {
            usages |= wgpu::BufferUsages::STORAGE;
        }
        let padded = size.div_ceil(COPY_ALIGN) * COPY_ALIGN;
        let buffer = self.scoped("buffer creation", |device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(if host_visible { "ember_mapped_buffer" } else { "ember_buffer" }),
                size: padded,
                usage: usages,
                mapped_at_creation: false,
            })
        })?;
        Ok(self.buffers.insert(WgpuBuffer { buffer, size, usage, host_visible }))
    }

    /// Copy `len` bytes at `offset` of `src` back to the CPU. Stalls.
    fn read_buffer(&mut self, src: BufferHandle, offset: u64, len: u64) -> Result<Vec<u8>> {
        let start = offset / COPY_ALIGN * COPY_ALIGN;
        let end = (offset + len).div_ceil(COPY_ALIGN) * COPY_ALIGN;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ember_readback"),
            size: end - start,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.encoder("ember_readback");
        encoder.copy_buffer_to_buffer(&self.buffer(src)?.buffer, start, &staging, 0, end - start);
        let (index, number) = self.submit(encoder.finish());
        let bytes = self.map_read(&staging, index, number)?;
        let skip = (offset - start) as usize;
        Ok(bytes[skip..skip + len as usize].to_vec())
    }

    fn map_read(&self, staging: &wgpu::Buffer, index: wgpu::SubmissionIndex, number: u64) -> Result<Vec<u8>> {
        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.wait_for(index, number)?;
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(RhiError::backend)?
            .map_err(|e| RhiError::backend(format!("readback map failed: {e}")))?;
        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }

    fn texture_copy<'a>(texture: &'a wgpu::Texture, mip_level: u32, origin: [u32; 3]) -> wgpu::ImageCopyTexture<'a> {
        wgpu::ImageCopyTexture {
            texture,
            mip_level,
            origin: wgpu::Origin3d { x: origin[0], y: origin[1], z: origin[2] },
            aspect: wgpu::TextureAspect::All,
        }
    }

    fn check_blit(&self, blit: &Blit) -> Result<()> {
        let src = self.texture(blit.src)?;
        let dst = self.texture(blit.dst)?;
        if self.validate {
            blit.check(&src.desc, &dst.desc)?;
        }
        Ok(())
    }

    fn encode_blit(&self, encoder: &mut wgpu::CommandEncoder, blit: &Blit) -> Result<()> {
        self.check_blit(blit)?;
        let src = self.texture(blit.src)?;
        let dst = self.texture(blit.dst)?;
        encoder.copy_texture_to_texture(
            Self::texture_copy(&src.texture, blit.src_mip, blit.src_origin),
            Self::texture_copy(&dst.texture, blit.dst_mip, blit.dst_origin),
            wgpu::Extent3d {
                width: blit.extent[0],
                height: blit.extent[1],
                depth_or_array_layers: blit.extent[2],
            },
        );
        Ok(())
    }

    fn build_bind_group(&self, set: &WgpuDescriptorSet) -> Result<Option<wgpu::BindGroup>> {
        let layout = self.set_layouts.get(set.layout).ok_or(RhiError::InvalidHandle("descriptor set layout"))?;
        if set.contents.first_missing(&layout.layout).is_some() {
            return Ok(None);
        }
        let mut views = Vec::new();
        for (location, write) in set.contents.iter() {
            if let DescriptorWrite::Texture { texture, aspect } = write {
                let Some(binding) = layout.layout.get(location) else { continue };
                let crate::descriptor::BindingType::Texture { kind, .. } = binding.ty else { continue };
                let texture = self.texture(*texture)?;
                views.push((
                    location,
                    texture.texture.create_view(&wgpu::TextureViewDescriptor {
                        label: Some("ember_descriptor_view"),
                        dimension: Some(convert::view_dimension(kind)),
                        aspect: match aspect {
                            TextureAspect::Color => wgpu::TextureAspect::All,
                            TextureAspect::Depth => wgpu::TextureAspect::DepthOnly,
                            TextureAspect::Stencil => wgpu::TextureAspect::StencilOnly,
                        },
                        ..Default::default()
                    }),
                ));
            }
        }
        let mut entries = Vec::new();
        for (location, write) in set.contents.iter() {
            if layout.layout.get(location).is_none() {
                continue;
            }
            let resource = match write {
                DescriptorWrite::Buffer { buffer, offset, length } => {
                    let buffer = self.buffer(*buffer)?;
                    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &buffer.buffer,
                        offset: *offset,
                        size: length.and_then(wgpu::BufferSize::new),
                    })
                }
                DescriptorWrite::Sampler(sampler) => wgpu::BindingResource::Sampler(
                    &self.samplers.get(*sampler).ok_or(RhiError::InvalidHandle("sampler"))?.sampler,
                ),
                DescriptorWrite::Texture { .. } => match views.iter().find(|(l, _)| *l == location) {
                    Some((_, view)) => wgpu::BindingResource::TextureView(view),
                    None => continue,
                },
            };
            entries.push(wgpu::BindGroupEntry { binding: location, resource });
        }
        let bind_group = self.scoped("bind group creation", |device| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("ember_descriptor_set"),
                layout: &layout.bind_group_layout,
                entries: &entries,
            })
        })?;
        Ok(Some(bind_group))
    }

    fn check_descriptor_writes(&self, layout: &DescriptorLayout, writes: &[(u32, DescriptorWrite)]) -> Result<()> {
        for (location, write) in writes {
            let Some(binding) = layout.get(*location) else { continue };
            match write {
                DescriptorWrite::Buffer { buffer, offset, length } => {
                    let b = self.buffer(*buffer)?;
                    check_buffer_write(*location, &binding.ty, b.usage, b.size, *offset, *length)?;
                    let align = match binding.ty {
                        crate::descriptor::BindingType::StorageBuffer { .. } => self.storage_buffer_alignment(),
                        _ => self.uniform_buffer_alignment(),
                    };
                    if offset % align != 0 {
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

    fn rebuild_set(&mut self, handle: DescriptorSetHandle) -> Result<()> {
        let bind_group = self.build_bind_group(&self.sets[handle])?;
        let set = &mut self.sets[handle];
        set.bind_group = bind_group;
        set.dirty = false;
        Ok(())
    }

    /// Rebuild bind groups invalidated by a sampler replacement. A set that cannot be rebuilt
    /// stays dirty and is refused when bound.
    fn refresh_dirty_sets(&mut self) {
        let dirty: Vec<DescriptorSetHandle> =
            self.sets.iter().filter(|(_, s)| s.dirty).map(|(h, _)| h).collect();
        for handle in dirty {
            if let Err(e) = self.rebuild_set(handle) {
                log::warn!("descriptor set kept its old bindings: {e}");
            }
        }
    }

    fn make_sampler(&self, desc: &SamplerDesc) -> wgpu::Sampler {
        let (filter, mip_filter) = convert::filter(desc.filter);
        let address = convert::address_mode(desc.wrap);
        self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("ember_sampler"),
            address_mode_u: address,
            address_mode_v: address,
            address_mode_w: address,
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: mip_filter,
            compare: desc.is_comparison().then(|| convert::compare(desc.compare)),
            anisotropy_clamp: desc.filter.anisotropy().clamp(1, 16),
            ..Default::default()
        })
    }

    fn shader_entry(&self, handle: ShaderHandle) -> Result<&WgpuShader> {
        self.shaders.get(handle).ok_or(RhiError::InvalidHandle("shader"))
    }

    fn bind_group_layouts(&self, handles: &[DescriptorSetLayoutHandle]) -> Result<Vec<&wgpu::BindGroupLayout>> {
        handles
            .iter()
            .map(|h| {
                self.set_layouts
                    .get(*h)
                    .map(|l| &l.bind_group_layout)
                    .ok_or(RhiError::InvalidHandle("descriptor set layout"))
            })
            .collect()
    }

    fn fence(&self, handle: FenceHandle) -> Result<&WgpuFence> {
        self.fences.get(handle).ok_or(RhiError::InvalidHandle("fence"))
    }

    fn check_fence(&self, fence: Option<FenceHandle>) -> Result<()> {
        let Some(handle) = fence else { return Ok(()) };
        if self.validate && self.fence(handle)?.submission.is_some() {
            return Err(RhiError::contract("fence submitted again before fence_reset"));
        }
        Ok(())
    }

    fn attach_fence(&mut self, fence: Option<FenceHandle>, index: wgpu::SubmissionIndex, number: u64) -> Result<()> {
        let Some(handle) = fence else { return Ok(()) };
        let fence = self.fences.get_mut(handle).ok_or(RhiError::InvalidHandle("fence"))?;
        let flag = Arc::new(AtomicBool::new(false));
        let signal = flag.clone();
        self.queue.on_submitted_work_done(move || signal.store(true, Ordering::Release));
        fence.signaled = flag;
        fence.submission = Some((index, number));
        Ok(())
    }
}

impl HardwareRenderer for WgpuRenderer {
    fn backend(&self) -> Backend {
        Backend::Wgpu
    }

    fn shader_target(&self) -> ShaderTarget {
        ShaderTarget::Wgsl
    }

    fn device_name(&self) -> &str {
        &self.name
    }

    fn uniform_buffer_alignment(&self) -> u64 {
        u64::from(self.limits.min_uniform_buffer_offset_alignment)
    }

    fn storage_buffer_alignment(&self) -> u64 {
        u64::from(self.limits.min_storage_buffer_offset_alignment)
    }

    fn validation_enabled(&self) -> bool {
        self.validate
    }

    fn set_max_temp_buffer_versions(&mut self, count: u32) -> Result<()> {
        self.wait()?;
        self.versions.resize(count)?;
        self.version_submissions = vec![None; count as usize];
        self.transfer_signals.resize(count);
        Ok(())
    }

    fn max_temp_buffer_versions(&self) -> u32 {
        self.versions.count()
    }

    fn reset_temp_buffer_version(&mut self, version: u32) -> Result<()> {
        let version = self.versions.select(version);
        if let Some((index, number)) = self.version_submissions[version as usize].take() {
            self.wait_for(index, number)?;
        }
        Ok(())
    }

    fn temp_buffer_version(&self) -> u32 {
        self.versions.current()
    }

    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> Result<BufferHandle> {
        self.make_buffer(size, usage, false)
    }

    fn create_mapped_buffer(&mut self, size: u64, usage: BufferUsage) -> Result<BufferHandle> {
        self.make_buffer(size, usage, true)
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Result<u64> {
        Ok(self.buffer(buffer)?.size)
    }

    fn buffer_set_data(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        self.transfer.require_open(self.validate, "buffer_set_data")?;
        let b = self.buffer(buffer)?;
        let end = buffer_range_end("write", offset, data.len() as u64, b.size)?;
        if b.host_visible {
            log::trace!("host-visible write of {} bytes", data.len());
        }
        if offset % COPY_ALIGN == 0 && data.len() as u64 % COPY_ALIGN == 0 {
            self.queue.write_buffer(&b.buffer, offset, data);
            return Ok(());
        }
        if self.validate {
            return Err(RhiError::contract(format!(
                "buffer_set_data of {} bytes at {offset} is not 4-byte aligned",
                data.len()
            )));
        }
        // Widen to whole words, keeping the bytes around the requested range.
        let start = offset / COPY_ALIGN * COPY_ALIGN;
        let mut words = self.read_buffer(buffer, start, end.div_ceil(COPY_ALIGN) * COPY_ALIGN - start)?;
        let skip = (offset - start) as usize;
        words[skip..skip + data.len()].copy_from_slice(data);
        self.queue.write_buffer(&self.buffer(buffer)?.buffer, start, &words);
        Ok(())
    }

    fn buffer_get_data(&mut self, buffer: BufferHandle, offset: u64, len: u64) -> Result<Vec<u8>> {
        buffer_range_end("read", offset, len, self.buffer(buffer)?.size)?;
        self.read_buffer(buffer, offset, len)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        let b = self.buffers.remove(buffer).ok_or(RhiError::InvalidHandle("buffer"))?;
        b.buffer.destroy();
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureHandle> {
        desc.validate()?;
        let format = convert::texture_format(desc.format)?;
        if !self.device.features().contains(format.required_features()) {
            return Err(RhiError::unsupported(format!("{:?} needs {:?}", desc.format, format.required_features())));
        }
        let allowed = self.adapter.get_texture_format_features(format).allowed_usages;
        let mut usage = wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST;
        if allowed.contains(wgpu::TextureUsages::TEXTURE_BINDING) {
            usage |= wgpu::TextureUsages::TEXTURE_BINDING;
        } else if desc.usage.contains(TextureUsage::SAMPLED) {
            return Err(RhiError::unsupported(format!("{:?} cannot be sampled", desc.format)));
        }
        let renderable = allowed.contains(wgpu::TextureUsages::RENDER_ATTACHMENT) && desc.kind != TextureKind::D3;
        if renderable {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        } else if desc.usage.is_attachment() {
            return Err(RhiError::unsupported(format!("{:?} cannot be an attachment", desc.format)));
        }
        let texture = self.scoped("texture creation", |device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: desc.label,
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: if desc.kind == TextureKind::D3 { desc.depth() } else { desc.array_layers() },
                },
                mip_level_count: desc.mip_levels,
                sample_count: 1,
                dimension: convert::texture_dimension(desc.kind),
                format,
                usage,
                view_formats: &[],
            })
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(convert::view_dimension(desc.kind)),
            ..Default::default()
        });
        let layout = if desc.usage.is_attachment() { ImageLayout::RenderAttachment } else { ImageLayout::ShaderRead };
        Ok(self.textures.insert(WgpuTexture { desc: desc.clone(), texture, view, layout, renderable }))
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
        self.queue.write_texture(
            Self::texture_copy(&t.texture, region.mip_level, [region.x, region.y, region.z]),
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(region.width * texel as u32),
                rows_per_image: Some(region.height),
            },
            wgpu::Extent3d { width: region.width, height: region.height, depth_or_array_layers: region.depth },
        );
        Ok(())
    }

    fn texture_get_data(&mut self, texture: TextureHandle, region: TextureRegion) -> Result<Vec<u8>> {
        let t = self.texture(texture)?;
        region.check_within(&t.desc)?;
        let aspect = match t.desc.format {
            crate::format::StorageFormat::Depth32 => wgpu::TextureAspect::DepthOnly,
            f if f.is_depth() => {
                return Err(RhiError::unsupported(format!("{f:?} cannot be read back on wgpu")));
            }
            _ => wgpu::TextureAspect::All,
        };
        let texel = t.desc.format.texel_size()?;
        let row = region.width * texel;
        let padded_row = row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let size = u64::from(padded_row) * u64::from(region.height) * u64::from(region.depth);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ember_texture_readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.encoder("ember_texture_readback");
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                aspect,
                ..Self::texture_copy(&t.texture, region.mip_level, [region.x, region.y, region.z])
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(region.height),
                },
            },
            wgpu::Extent3d { width: region.width, height: region.height, depth_or_array_layers: region.depth },
        );
        let (index, number) = self.submit(encoder.finish());
        let padded = self.map_read(&staging, index, number)?;
        let mut out = Vec::with_capacity(row as usize * region.height as usize * region.depth as usize);
        for chunk in padded.chunks(padded_row as usize) {
            out.extend_from_slice(&chunk[..row as usize]);
        }
        Ok(out)
    }

    fn build_mipmaps(&mut self, texture: TextureHandle) -> Result<()> {
        let t = self.texture(texture)?;
        if t.desc.mip_levels < 2 {
            return Ok(());
        }
        let format = convert::texture_format(t.desc.format)?;
        let filterable = self
            .adapter
            .get_texture_format_features(format)
            .flags
            .contains(wgpu::TextureFormatFeatureFlags::FILTERABLE);
        if !t.renderable || !filterable || t.desc.format.is_depth() {
            return Err(RhiError::unsupported(format!("cannot generate mipmaps for {:?}", t.desc.format)));
        }
        let layers = t.desc.array_layers();
        let mip_levels = t.desc.mip_levels;
        self.blitter.prepare(&self.device, format);
        let mut encoder = self.encoder("ember_mipmaps");
        for layer in 0..layers {
            for mip in 1..mip_levels {
                let t = self.texture(texture)?;
                let view = |level| {
                    t.texture.create_view(&wgpu::TextureViewDescriptor {
                        label: Some("ember_mip_view"),
                        dimension: Some(wgpu::TextureViewDimension::D2),
                        base_mip_level: level,
                        mip_level_count: Some(1),
                        base_array_layer: layer,
                        array_layer_count: Some(1),
                        ..Default::default()
                    })
                };
                let (src, dst) = (view(mip - 1), view(mip));
                self.blitter.draw(&self.device, &mut encoder, &src, &dst, format);
            }
        }
        self.submit(encoder.finish());
        Ok(())
    }

    fn clear_texture(&mut self, texture: TextureHandle, value: ClearValue) -> Result<()> {
        self.transfer.require_open(self.validate, "clear_texture")?;
        let t = self.texture(texture)?;
        if !t.renderable {
            return Err(RhiError::unsupported(format!("cannot clear {:?} textures", t.desc.format)));
        }
        let mut encoder = self.encoder("ember_clear_texture");
        for mip in 0..t.desc.mip_levels {
            for layer in 0..t.desc.array_layers() {
                let view = t.texture.create_view(&wgpu::TextureViewDescriptor {
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    base_mip_level: mip,
                    mip_level_count: Some(1),
                    base_array_layer: layer,
                    array_layer_count: Some(1),
                    ..Default::default()
                });
                let (colors, depth_stencil) = replay::clear_attachment_ops(&view, &t.desc, value)?;
                let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("ember_clear_texture"),
                    color_attachments: &colors,
                    depth_stencil_attachment: depth_stencil,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
            }
        }
        self.submit(encoder.finish());
        Ok(())
    }

    fn blit(&mut self, blit: Blit) -> Result<()> {
        let mut encoder = self.encoder("ember_blit");
        self.encode_blit(&mut encoder, &blit)?;
        self.submit(encoder.finish());
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureHandle) -> Result<()> {
        let t = self.textures.remove(texture).ok_or(RhiError::InvalidHandle("texture"))?;
        t.texture.destroy();
        Ok(())
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle> {
        let sampler = self.make_sampler(desc);
        Ok(self.samplers.insert(WgpuSampler { desc: *desc, sampler }))
    }

    fn set_sampler(&mut self, sampler: SamplerHandle, desc: &SamplerDesc) -> Result<()> {
        let replacement = self.make_sampler(desc);
        let s = self.samplers.get_mut(sampler).ok_or(RhiError::InvalidHandle("sampler"))?;
        s.desc = *desc;
        s.sampler = replacement;
        for (_, set) in self.sets.iter_mut() {
            if set.contents.iter().any(|(_, w)| *w == DescriptorWrite::Sampler(sampler)) {
                set.dirty = true;
            }
        }
        Ok(())
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) -> Result<()> {
        self.samplers.remove(sampler).map(|_| ()).ok_or(RhiError::InvalidHandle("sampler"))
    }

    fn create_shader(&mut self, desc: &ShaderDesc) -> Result<ShaderHandle> {
        let ShaderCode::Wgsl(source) = &desc.code else {
            return Err(RhiError::unsupported("the wgpu backend consumes WGSL shaders"));
        };
        let module = self.scoped("shader compilation", |device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("ember_shader"),
                source: wgpu::ShaderSource::Wgsl(source.as_str().into()),
            })
        })?;
        Ok(self.shaders.insert(WgpuShader { stage: desc.stage, module, entry_point: desc.entry_point.clone() }))
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) -> Result<()> {
        self.shaders.remove(shader).map(|_| ()).ok_or(RhiError::InvalidHandle("shader"))
    }

    fn create_pipeline(&mut self, builder: &PipelineBuilder, layout: RenderTargetLayoutHandle) -> Result<PipelineHandle> {
        builder.validate_fixed_function()?;
        let typed = builder
            .shaders
            .iter()
            .map(|h| Ok((*h, self.shader_entry(*h)?.stage)))
            .collect::<Result<Vec<_>>>()?;
        let stages = GraphicsStages::collect(&typed)?;
        let render_layout = self
            .render_layouts
            .get(layout)
            .ok_or(RhiError::InvalidHandle("render target layout"))?
            .clone();
        let ff = builder.fixed_function;
        let topology = convert::topology(ff.topology)?;

        let attributes = builder
            .vertex_format
            .attributes
            .iter()
            .map(|a| {
                Ok(wgpu::VertexAttribute {
                    format: convert::vertex_format(a.data_type, a.normalized)?,
                    offset: u64::from(a.offset),
                    shader_location: a.location,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let vertex_buffers = if attributes.is_empty() {
            Vec::new()
        } else {
            vec![wgpu::VertexBufferLayout {
                array_stride: u64::from(builder.vertex_format.size()),
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &attributes,
            }]
        };

        let targets = render_layout
            .color_attachments()
            .map(|(_, a)| {
                Ok(Some(wgpu::ColorTargetState {
                    format: convert::texture_format(a.format)?,
                    blend: if a.format.is_integer() { None } else { convert::blend(ff.blend_mode) },
                    write_mask: wgpu::ColorWrites::ALL,
                }))
            })
            .collect::<Result<Vec<_>>>()?;
        let depth_stencil = match render_layout.depth_attachment() {
            Some((_, a)) => {
                let face = wgpu::StencilFaceState {
                    compare: convert::compare(ff.stencil_compare),
                    fail_op: convert::stencil_op(ff.stencil_fail_op),
                    depth_fail_op: convert::stencil_op(ff.stencil_depth_fail_op),
                    pass_op: convert::stencil_op(ff.stencil_depth_pass_op),
                };
                let stencil_enabled = ff.stencil_compare != crate::pipeline::CompareFunc::Disabled;
                Some(wgpu::DepthStencilState {
                    format: convert::texture_format(a.format)?,
                    depth_write_enabled: ff.depth_compare != crate::pipeline::CompareFunc::Disabled,
                    depth_compare: convert::compare(ff.depth_compare),
                    stencil: if stencil_enabled {
                        wgpu::StencilState { front: face, back: face, read_mask: ff.stencil_mask, write_mask: ff.stencil_mask }
                    } else {
                        wgpu::StencilState::default()
                    },
                    bias: if ff.polygon_offset {
                        wgpu::DepthBiasState {
                            constant: ff.polygon_offset_units as i32,
                            slope_scale: ff.polygon_offset_factor,
                            clamp: 0.0,
                        }
                    } else {
                        wgpu::DepthBiasState::default()
                    },
                })
            }
            None => None,
        };

        let bind_group_layouts = self.bind_group_layouts(&builder.binding_layouts)?;
        let vertex = self.shader_entry(stages.vertex.ok_or(RhiError::unsupported("missing vertex shader"))?)?;
        let fragment = stages.fragment.map(|h| self.shader_entry(h)).transpose()?;
        let label = builder.label.as_deref().unwrap_or("ember_pipeline");
        let pipeline = self.scoped("pipeline creation", |device| {
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &bind_group_layouts,
                push_constant_ranges: &[],
            });
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &vertex.module,
                    entry_point: Some(vertex.entry_point.as_str()),
                    buffers: &vertex_buffers,
                    compilation_options: Default::default(),
                },
                fragment: fragment.map(|f| wgpu::FragmentState {
                    module: &f.module,
                    entry_point: Some(f.entry_point.as_str()),
                    targets: &targets,
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology,
                    cull_mode: convert::cull_mode(ff.cull_mode),
                    ..Default::default()
                },
                depth_stencil,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        })?;
        log::debug!("created wgpu pipeline {label}");
        Ok(self.pipelines.insert(WgpuPipeline {
            kind: PipelineKind::Graphics { render_layout, stencil_reference: ff.stencil_reference },
            render_pipeline: Some(pipeline),
            compute_pipeline: None,
            set_layouts: builder.binding_layouts.clone(),
        }))
    }

    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc) -> Result<PipelineHandle> {
        let shader = self.shader_entry(desc.shader)?;
        if shader.stage != ShaderType::Compute {
            return Err(RhiError::unsupported(format!("{:?} shader in a compute pipeline", shader.stage)));
        }
        let bind_group_layouts = self.bind_group_layouts(&desc.binding_layouts)?;
        let label = desc.label.as_deref().unwrap_or("ember_compute_pipeline");
        let pipeline = self.scoped("compute pipeline creation", |device| {
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &bind_group_layouts,
                push_constant_ranges: &[],
            });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &shader.module,
                entry_point: Some(shader.entry_point.as_str()),
                compilation_options: Default::default(),
                cache: None,
            })
        })?;
        Ok(self.pipelines.insert(WgpuPipeline {
            kind: PipelineKind::Compute,
            render_pipeline: None,
            compute_pipeline: Some(pipeline),
            set_layouts: desc.binding_layouts.clone(),
        }))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        self.pipelines.remove(pipeline).map(|_| ()).ok_or(RhiError::InvalidHandle("pipeline"))
    }

    fn create_descriptor_set_layout(&mut self, layout: DescriptorLayout) -> Result<DescriptorSetLayoutHandle> {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = layout
            .bindings()
            .iter()
            .filter_map(|b| {
                convert::binding_type(&b.ty).map(|ty| wgpu::BindGroupLayoutEntry {
                    binding: b.binding,
                    visibility: convert::shader_stages(b.stages),
                    ty,
                    count: None,
                })
            })
            .collect();
        let bind_group_layout = self.scoped("descriptor set layout creation", |device| {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("ember_descriptor_set_layout"),
                entries: &entries,
            })
        })?;
        Ok(self.set_layouts.insert(WgpuSetLayout { layout: Arc::new(layout), bind_group_layout }))
    }

    fn create_descriptor_set(&mut self, layout: DescriptorSetLayoutHandle) -> Result<DescriptorSetHandle> {
        if !self.set_layouts.contains_key(layout) {
            return Err(RhiError::InvalidHandle("descriptor set layout"));
        }
        Ok(self.sets.insert(WgpuDescriptorSet {
            layout,
            contents: DescriptorContents::default(),
            bind_group: None,
            updating: UpdateFlag::default(),
            dirty: false,
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
        let layout = match self.sets.get(handle) {
            Some(set) => self.set_layouts[set.layout].layout.clone(),
            None => return Err(RhiError::InvalidHandle("descriptor set")),
        };
        if self.validate {
            let list: Vec<_> = writes.iter().map(|(k, v)| (*k, *v)).collect();
            self.check_descriptor_writes(&layout, &list)?;
        }
        let set = &mut self.sets[handle];
        set.contents.apply(writes);
        set.dirty = true;
        self.rebuild_set(handle)
    }

    fn destroy_descriptor_set(&mut self, set: DescriptorSetHandle) -> Result<()> {
        self.sets.remove(set).map(|_| ()).ok_or(RhiError::InvalidHandle("descriptor set"))
    }

    fn create_render_target_layout(&mut self, layout: RenderTargetLayout) -> Result<RenderTargetLayoutHandle> {
        for a in layout.attachments() {
            convert::texture_format(a.format)?;
        }
        Ok(self.render_layouts.insert(layout))
    }

    fn create_frame_buffer(
        &mut self,
        layout: RenderTargetLayoutHandle,
        attachments: &RenderAttachments,
    ) -> Result<FrameBufferHandle> {
        let render_layout = self.render_layouts.get(layout).ok_or(RhiError::InvalidHandle("render target layout"))?;
        let extent = attachments.check_against(render_layout, |h| {
            self.textures.get(h).map(|t| &t.desc).ok_or(RhiError::InvalidHandle("texture"))
        })?;
        let views = attachments
            .images()
            .iter()
            .map(|image| {
                let t = self.texture(image.texture)?;
                Ok((
                    image.texture,
                    t.texture.create_view(&wgpu::TextureViewDescriptor {
                        label: Some("ember_attachment_view"),
                        dimension: Some(wgpu::TextureViewDimension::D2),
                        base_mip_level: image.mip_level,
                        mip_level_count: Some(1),
                        base_array_layer: image.layer,
                        array_layer_count: Some(1),
                        ..Default::default()
                    }),
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self.frame_buffers.insert(WgpuFrameBuffer { layout, attachments: views, extent }))
    }

    fn destroy_frame_buffer(&mut self, frame_buffer: FrameBufferHandle) -> Result<()> {
        self.frame_buffers.remove(frame_buffer).map(|_| ()).ok_or(RhiError::InvalidHandle("frame buffer"))
    }

    fn create_command_buffer(&mut self) -> Result<CommandBuffer> {
        let handle = self.command_buffers.insert(());
        Ok(CommandBuffer::new(handle, self.timeline.clone(), self.validate))
    }

    fn destroy_command_buffer(&mut self, cmd: CommandBuffer) -> Result<()> {
        self.command_buffers.remove(cmd.handle()).ok_or(RhiError::InvalidHandle("command buffer"))
    }

    fn begin_data_transfer(&mut self) -> Result<()> {
        self.transfer.begin(self.validate)
    }

    fn end_data_transfer(&mut self) -> Result<()> {
        self.transfer.end(self.validate)?;
        self.transfer_signals.signal(self.versions.current());
        Ok(())
    }

    fn transfer_barrier(&mut self, version: u32) -> Result<()> {
        // Queue writes are ordered before the next submit; only the bookkeeping is needed.
        self.transfer_signals.barrier(version, self.validate).map(|_| ())
    }

    fn execute_render_pass(
        &mut self,
        frame_buffer: FrameBufferHandle,
        cmds: &[&CommandBuffer],
        fence: Option<FenceHandle>,
    ) -> Result<()> {
        self.check_device()?;
        self.transfer.require_closed(self.validate, "execute_render_pass")?;
        self.check_fence(fence)?;
        self.refresh_dirty_sets();
        let mut encoder = self.encoder("ember_render_pass");
        let layouts = self.encode_batch(&mut encoder, Some(frame_buffer), cmds)?;
        self.finish_batch(encoder, cmds, layouts, fence)
    }

    fn execute_non_render_command_buffers(&mut self, cmds: &[&CommandBuffer], fence: Option<FenceHandle>) -> Result<()> {
        self.check_device()?;
        self.transfer.require_closed(self.validate, "execute_non_render_command_buffers")?;
        self.check_fence(fence)?;
        self.refresh_dirty_sets();
        let mut encoder = self.encoder("ember_non_render");
        let layouts = self.encode_batch(&mut encoder, None, cmds)?;
        self.finish_batch(encoder, cmds, layouts, fence)
    }

    fn wait(&mut self) -> Result<()> {
        self.device.poll(wgpu::Maintain::Wait);
        self.timeline.mark_all_complete();
        for slot in &mut self.version_submissions {
            *slot = None;
        }
        self.check_device()
    }

    fn create_fence(&mut self) -> Result<FenceHandle> {
        Ok(self.fences.insert(WgpuFence::default()))
    }

    fn fence_wait(&mut self, fence: FenceHandle) -> Result<()> {
        match self.fence(fence)?.submission.clone() {
            Some((index, number)) => {
                self.wait_for(index, number)?;
                self.fence(fence)?.signaled.store(true, Ordering::Release);
                Ok(())
            }
            None if self.fence(fence)?.signaled.load(Ordering::Acquire) => Ok(()),
            None if self.validate => Err(RhiError::contract("waiting on a fence that was never submitted")),
            None => Ok(()),
        }
    }

    fn fence_is_signaled(&mut self, fence: FenceHandle) -> Result<bool> {
        self.device.poll(wgpu::Maintain::Poll);
        Ok(self.fence(fence)?.signaled.load(Ordering::Acquire))
    }

    fn fence_reset(&mut self, fence: FenceHandle) -> Result<()> {
        let f = self.fences.get_mut(fence).ok_or(RhiError::InvalidHandle("fence"))?;
        f.submission = None;
        f.signaled = Arc::new(AtomicBool::new(false));
        Ok(())
    }

    fn destroy_fence(&mut self, fence: FenceHandle) -> Result<()> {
        self.fences.remove(fence).map(|_| ()).ok_or(RhiError::InvalidHandle("fence"))
    }

    #[cfg(feature = "window")]
    fn create_window_surface(
        &mut self,
        display: raw_window_handle::RawDisplayHandle,
        window: raw_window_handle::RawWindowHandle,
        width: u32,
        height: u32,
    ) -> Result<SurfaceHandle> {
        let surface = surface::WgpuSurface::new(self, display, window, width, height)?;
        Ok(self.surfaces.insert(surface))
    }

    #[cfg(feature = "window")]
    fn resize_surface(&mut self, surface: SurfaceHandle, width: u32, height: u32) -> Result<()> {
        let s = self.surfaces.get_mut(surface).ok_or(RhiError::InvalidHandle("surface"))?;
        s.resize(&self.device, width, height);
        Ok(())
    }

    #[cfg(feature = "window")]
    fn present(&mut self, surface: SurfaceHandle, texture: TextureHandle) -> Result<()> {
        self.check_device()?;
        self.present_texture(surface, texture)
    }

    #[cfg(feature = "window")]
    fn destroy_surface(&mut self, surface: SurfaceHandle) -> Result<()> {
        self.surfaces.remove(surface).map(|_| ()).ok_or(RhiError::InvalidHandle("surface"))
    }
}
