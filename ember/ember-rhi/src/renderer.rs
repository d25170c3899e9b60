//! The `HardwareRenderer` trait: root factory, scheduler, and capability queries.

use crate::command::{Blit, ClearValue, CommandBuffer};
use crate::config::{BackendChoice, RhiConfig};
use crate::descriptor::{DescriptorLayout, DescriptorSetUpdate};
use crate::error::Result;
use crate::format::{BufferUsage, DataType};
use crate::handle::*;
use crate::pipeline::{ComputePipelineDesc, PipelineBuilder, ShaderDesc};
use crate::render_target::{RenderAttachments, RenderTargetLayout};
use crate::resource::{SamplerDesc, TextureDesc, TextureRegion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Wgpu,
    Vulkan,
}

/// Shader blob form `create_shader` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderTarget {
    Wgsl,
    SpirV,
}

/// One renderer per device. Every object it creates lives in its arenas and is addressed by handle.
pub trait HardwareRenderer {
    fn backend(&self) -> Backend;
    fn shader_target(&self) -> ShaderTarget;
    fn device_name(&self) -> &str;
    fn uniform_buffer_alignment(&self) -> u64;
    fn storage_buffer_alignment(&self) -> u64;
    /// Whether contract checks run for this renderer.
    fn validation_enabled(&self) -> bool;

    // Frame versions.
    fn set_max_temp_buffer_versions(&mut self, count: u32) -> Result<()>;
    fn max_temp_buffer_versions(&self) -> u32;
    /// Wait for the transient work last submitted under `version`, recycle it, and make it current.
    fn reset_temp_buffer_version(&mut self, version: u32) -> Result<()>;
    fn temp_buffer_version(&self) -> u32;

    // Buffers.
    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> Result<BufferHandle>;
    fn create_mapped_buffer(&mut self, size: u64, usage: BufferUsage) -> Result<BufferHandle>;
    fn buffer_size(&self, buffer: BufferHandle) -> Result<u64>;
    fn buffer_set_data(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()>;
    /// Blocking read-back.
    fn buffer_get_data(&mut self, buffer: BufferHandle, offset: u64, len: u64) -> Result<Vec<u8>>;
    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()>;

    // Textures.
    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureHandle>;
    fn texture_desc(&self, texture: TextureHandle) -> Result<&TextureDesc>;
    fn texture_set_data(
        &mut self,
        texture: TextureHandle,
        region: TextureRegion,
        data_type: DataType,
        data: &[u8],
    ) -> Result<()>;
    /// Blocking read-back of a region, tightly packed.
    fn texture_get_data(&mut self, texture: TextureHandle, region: TextureRegion) -> Result<Vec<u8>>;
    fn build_mipmaps(&mut self, texture: TextureHandle) -> Result<()>;
    fn clear_texture(&mut self, texture: TextureHandle, value: ClearValue) -> Result<()>;
    fn blit(&mut self, blit: Blit) -> Result<()>;
    fn destroy_texture(&mut self, texture: TextureHandle) -> Result<()>;

    // Samplers.
    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle>;
    /// Replace the sampler's state. The handle keeps pointing at the replacement.
    fn set_sampler(&mut self, sampler: SamplerHandle, desc: &SamplerDesc) -> Result<()>;
    fn destroy_sampler(&mut self, sampler: SamplerHandle) -> Result<()>;

    // Shaders and pipelines.
    fn create_shader(&mut self, desc: &ShaderDesc) -> Result<ShaderHandle>;
    fn destroy_shader(&mut self, shader: ShaderHandle) -> Result<()>;
    fn create_pipeline(&mut self, builder: &PipelineBuilder, layout: RenderTargetLayoutHandle) -> Result<PipelineHandle>;
    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc) -> Result<PipelineHandle>;
    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()>;

    // Descriptors.
    fn create_descriptor_set_layout(&mut self, layout: DescriptorLayout) -> Result<DescriptorSetLayoutHandle>;
    fn create_descriptor_set(&mut self, layout: DescriptorSetLayoutHandle) -> Result<DescriptorSetHandle>;
    /// Start a batch of writes. The set is not bindable until `end_update`.
    fn begin_update(&mut self, set: DescriptorSetHandle) -> Result<DescriptorSetUpdate>;
    fn end_update(&mut self, update: DescriptorSetUpdate) -> Result<()>;
    fn destroy_descriptor_set(&mut self, set: DescriptorSetHandle) -> Result<()>;

    // Render targets.
    fn create_render_target_layout(&mut self, layout: RenderTargetLayout) -> Result<RenderTargetLayoutHandle>;
    fn create_frame_buffer(
        &mut self,
        layout: RenderTargetLayoutHandle,
        attachments: &RenderAttachments,
    ) -> Result<FrameBufferHandle>;
    fn destroy_frame_buffer(&mut self, frame_buffer: FrameBufferHandle) -> Result<()>;

    // Commands and submission.
    fn create_command_buffer(&mut self) -> Result<CommandBuffer>;
    fn destroy_command_buffer(&mut self, cmd: CommandBuffer) -> Result<()>;
    fn begin_data_transfer(&mut self) -> Result<()>;
    fn end_data_transfer(&mut self) -> Result<()>;
    /// Make the next render submission wait for the transfer work signalled under `version`.
    /// `end_data_transfer` already queues this wait; the barrier only checks the signal is there.
    fn transfer_barrier(&mut self, version: u32) -> Result<()>;
    fn execute_render_pass(
        &mut self,
        frame_buffer: FrameBufferHandle,
        cmds: &[&CommandBuffer],
        fence: Option<FenceHandle>,
    ) -> Result<()>;
    fn execute_non_render_command_buffers(&mut self, cmds: &[&CommandBuffer], fence: Option<FenceHandle>) -> Result<()>;
    /// Block until every submitted piece of GPU work is complete.
    fn wait(&mut self) -> Result<()>;

    // Fences.
    fn create_fence(&mut self) -> Result<FenceHandle>;
    fn fence_wait(&mut self, fence: FenceHandle) -> Result<()>;
    fn fence_is_signaled(&mut self, fence: FenceHandle) -> Result<bool>;
    fn fence_reset(&mut self, fence: FenceHandle) -> Result<()>;
    fn destroy_fence(&mut self, fence: FenceHandle) -> Result<()>;

    // Window surfaces.
    #[cfg(feature = "window")]
    fn create_window_surface(
        &mut self,
        display: raw_window_handle::RawDisplayHandle,
        window: raw_window_handle::RawWindowHandle,
        width: u32,
        height: u32,
    ) -> Result<SurfaceHandle>;
    #[cfg(feature = "window")]
    fn resize_surface(&mut self, surface: SurfaceHandle, width: u32, height: u32) -> Result<()>;
    /// Blit `texture` into the next swap image and present it.
    #[cfg(feature = "window")]
    fn present(&mut self, surface: SurfaceHandle, texture: TextureHandle) -> Result<()>;
    #[cfg(feature = "window")]
    fn destroy_surface(&mut self, surface: SurfaceHandle) -> Result<()>;
}

/// Create a renderer for the configured backend. `Auto` prefers Vulkan and falls back to wgpu.
pub fn create_renderer(config: &RhiConfig) -> Result<Box<dyn HardwareRenderer>> {
    match config.backend {
        BackendChoice::Vulkan => create_vulkan(config),
        BackendChoice::Wgpu => create_wgpu(config),
        BackendChoice::Auto => match create_vulkan(config) {
            Ok(renderer) => Ok(renderer),
            Err(e) => {
                log::warn!("Vulkan backend unavailable ({e}), falling back to wgpu");
                create_wgpu(config)
            }
        },
    }
}

#[cfg(feature = "vulkan")]
fn create_vulkan(config: &RhiConfig) -> Result<Box<dyn HardwareRenderer>> {
    Ok(Box::new(crate::vulkan::VulkanRenderer::new(config)?))
}

#[cfg(not(feature = "vulkan"))]
fn create_vulkan(_config: &RhiConfig) -> Result<Box<dyn HardwareRenderer>> {
    Err(crate::error::RhiError::unsupported("built without the vulkan feature"))
}

#[cfg(feature = "wgpu")]
fn create_wgpu(config: &RhiConfig) -> Result<Box<dyn HardwareRenderer>> {
    Ok(Box::new(crate::wgpu_backend::WgpuRenderer::new(config)?))
}

#[cfg(not(feature = "wgpu"))]
fn create_wgpu(_config: &RhiConfig) -> Result<Box<dyn HardwareRenderer>> {
    Err(crate::error::RhiError::unsupported("built without the wgpu feature"))
}
