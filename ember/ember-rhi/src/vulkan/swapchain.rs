//! Window surfaces. A presented texture is blitted onto the acquired swapchain image, so
//! textures of any size and color format can be shown. One present is kept in flight.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use super::device::DeviceContext;
use super::submit::CommandPool;
use super::texture::{transition, VulkanTexture};
use super::VulkanRenderer;
use crate::error::{Result, RhiError};
use crate::handle::{SurfaceHandle, TextureHandle};

const PREFERRED_FORMATS: [vk::Format; 2] = [vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM];

pub struct VulkanSurface {
    device: Arc<ash::Device>,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    extent: vk::Extent2D,
    requested: (u32, u32),
    vsync: bool,
    image_available: vk::Semaphore,
    /// One per swapchain image; the presentation engine holds it until the image comes back.
    render_finished: Vec<vk::Semaphore>,
    in_flight: vk::Fence,
    pool: CommandPool,
    cmd: vk::CommandBuffer,
    /// The swapchain no longer matches the window and must be rebuilt before the next present.
    stale: bool,
}

impl std::fmt::Debug for VulkanSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanSurface")
            .field("extent", &(self.extent.width, self.extent.height))
            .field("images", &self.images.len())
            .field("stale", &self.stale)
            .finish()
    }
}

fn choose_present_mode(vsync: bool, modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

fn choose_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    PREFERRED_FORMATS
        .iter()
        .find_map(|want| formats.iter().find(|f| f.format == *want).copied())
        .or_else(|| formats.first().copied())
}

fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: (u32, u32)) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: requested.0.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: requested.1.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

impl VulkanSurface {
    pub fn new(
        ctx: &DeviceContext,
        display: RawDisplayHandle,
        window: RawWindowHandle,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<Self> {
        if !ctx.swapchain_supported {
            return Err(RhiError::unsupported("device has no swapchain support"));
        }
        let surface_loader = ash::khr::surface::Instance::new(&ctx.entry, &ctx.instance);
        let surface = unsafe { ash_window::create_surface(&ctx.entry, &ctx.instance, display, window, None)? };
        let presentable = unsafe {
            surface_loader.get_physical_device_surface_support(ctx.physical_device, ctx.graphics_family, surface)
        };
        if !matches!(presentable, Ok(true)) {
            unsafe { surface_loader.destroy_surface(surface, None) };
            return Err(RhiError::unsupported("graphics queue cannot present to this surface"));
        }
        let device = ctx.device.clone();
        let pool = CommandPool::new(&device, ctx.graphics_family, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;
        let mut this = Self {
            swapchain_loader: ash::khr::swapchain::Device::new(&ctx.instance, &device),
            device,
            surface_loader,
            surface,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            extent: vk::Extent2D::default(),
            requested: (width, height),
            vsync,
            image_available: vk::Semaphore::null(),
            render_finished: Vec::new(),
            in_flight: vk::Fence::null(),
            cmd: vk::CommandBuffer::null(),
            pool,
            stale: true,
        };
        this.cmd = this.pool.allocate(vk::CommandBufferLevel::PRIMARY)?;
        unsafe {
            this.image_available = this.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?;
            this.in_flight = this
                .device
                .create_fence(&vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED), None)?;
        }
        this.rebuild(ctx)?;
        Ok(this)
    }

    /// The device must be idle.
    pub fn resize(&mut self, ctx: &DeviceContext, width: u32, height: u32) -> Result<()> {
        self.requested = (width, height);
        self.rebuild(ctx)
    }

    /// Recreate the swapchain for the current window size. A zero-sized window leaves the
    /// surface stale and presents are skipped until it has an area again.
    fn rebuild(&mut self, ctx: &DeviceContext) -> Result<()> {
        let pd = ctx.physical_device;
        let (caps, formats, modes) = unsafe {
            (
                self.surface_loader.get_physical_device_surface_capabilities(pd, self.surface)?,
                self.surface_loader.get_physical_device_surface_formats(pd, self.surface)?,
                self.surface_loader.get_physical_device_surface_present_modes(pd, self.surface)?,
            )
        };
        let extent = choose_extent(&caps, self.requested);
        if extent.width == 0 || extent.height == 0 {
            self.stale = true;
            return Ok(());
        }
        let format = choose_format(&formats).ok_or_else(|| RhiError::unsupported("surface reports no formats"))?;
        if !caps.supported_usage_flags.contains(vk::ImageUsageFlags::TRANSFER_DST) {
            return Err(RhiError::unsupported("surface images cannot be blit targets"));
        }
        let mut image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 {
            image_count = image_count.min(caps.max_image_count);
        }
        let present_mode = choose_present_mode(self.vsync, &modes);
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(self.swapchain);
        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None)? };
        unsafe { self.swapchain_loader.destroy_swapchain(self.swapchain, None) };
        self.swapchain = swapchain;
        self.images = unsafe { self.swapchain_loader.get_swapchain_images(swapchain)? };
        self.extent = extent;

        unsafe {
            for semaphore in self.render_finished.drain(..) {
                self.device.destroy_semaphore(semaphore, None);
            }
            // A failed present may have left the acquire semaphore signaled.
            self.device.destroy_semaphore(self.image_available, None);
            self.image_available = self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?;
            for _ in 0..self.images.len() {
                self.render_finished.push(self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?);
            }
        }
        self.stale = false;
        log::info!(
            "swapchain {}x{} {:?} {:?}, {} images",
            extent.width,
            extent.height,
            format.format,
            present_mode,
            self.images.len()
        );
        Ok(())
    }

    /// Wait for the last present's blit so the source texture may be released.
    pub fn settle(&self) -> Result<()> {
        unsafe { self.device.wait_for_fences(&[self.in_flight], true, u64::MAX)? };
        Ok(())
    }

    fn present(&mut self, ctx: &DeviceContext, texture: &VulkanTexture) -> Result<()> {
        if self.stale {
            unsafe { self.device.device_wait_idle()? };
            self.rebuild(ctx)?;
            if self.stale {
                return Ok(());
            }
        }
        self.settle()?;
        let acquired = unsafe {
            self.swapchain_loader.acquire_next_image(self.swapchain, u64::MAX, self.image_available, vk::Fence::null())
        };
        let index = match acquired {
            Ok((index, _)) => index,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.stale = true;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let submitted = self.blit_and_submit(ctx, texture, index);
        if submitted.is_err() {
            self.stale = true;
            return submitted;
        }

        let waits = [self.render_finished[index as usize]];
        let swapchains = [self.swapchain];
        let indices = [index];
        let present_info =
            vk::PresentInfoKHR::default().wait_semaphores(&waits).swapchains(&swapchains).image_indices(&indices);
        match unsafe { self.swapchain_loader.queue_present(ctx.graphics_queue, &present_info) } {
            Ok(suboptimal) => self.stale = suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => self.stale = true,
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn blit_and_submit(&self, ctx: &DeviceContext, texture: &VulkanTexture, index: u32) -> Result<()> {
        let device = &self.device;
        let cmd = self.cmd;
        let image = self.images[index as usize];
        let color_range = |aspect: vk::ImageAspectFlags| {
            vk::ImageSubresourceRange::default().aspect_mask(aspect).level_count(1).layer_count(1)
        };
        let src_range = color_range(texture.aspect());
        let dst_range = color_range(vk::ImageAspectFlags::COLOR);
        let resting = texture.resting_layout();
        let (width, height, _) = texture.desc.mip_extent(0);
        let region = vk::ImageBlit::default()
            .src_subresource(texture.subresource(0, 0, 1))
            .src_offsets([vk::Offset3D::default(), vk::Offset3D { x: width as i32, y: height as i32, z: 1 }])
            .dst_subresource(
                vk::ImageSubresourceLayers::default().aspect_mask(vk::ImageAspectFlags::COLOR).layer_count(1),
            )
            .dst_offsets([
                vk::Offset3D::default(),
                vk::Offset3D { x: self.extent.width as i32, y: self.extent.height as i32, z: 1 },
            ]);
        unsafe {
            device.reset_fences(&[self.in_flight])?;
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            let begin = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(cmd, &begin)?;
        }
        let (src_layout, dst_layout) = (vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        transition(device, cmd, image, dst_range, vk::ImageLayout::UNDEFINED, dst_layout, false);
        transition(device, cmd, texture.image, src_range, resting, src_layout, false);
        unsafe {
            device.cmd_blit_image(cmd, texture.image, src_layout, image, dst_layout, &[region], vk::Filter::LINEAR);
        }
        transition(device, cmd, texture.image, src_range, src_layout, resting, false);
        transition(device, cmd, image, dst_range, dst_layout, vk::ImageLayout::PRESENT_SRC_KHR, false);
        unsafe { device.end_command_buffer(cmd)? };

        let waits = [self.image_available];
        let stages = [vk::PipelineStageFlags::TRANSFER];
        let cmds = [cmd];
        let signals = [self.render_finished[index as usize]];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&cmds)
            .signal_semaphores(&signals);
        unsafe { device.queue_submit(ctx.graphics_queue, &[submit], self.in_flight)? };
        Ok(())
    }
}

impl Drop for VulkanSurface {
    fn drop(&mut self) {
        unsafe {
            if self.in_flight != vk::Fence::null() {
                let _ = self.device.wait_for_fences(&[self.in_flight], true, u64::MAX);
            }
            if self.cmd != vk::CommandBuffer::null() {
                self.pool.free(self.cmd);
            }
            self.device.destroy_fence(self.in_flight, None);
            self.device.destroy_semaphore(self.image_available, None);
            for semaphore in self.render_finished.drain(..) {
                self.device.destroy_semaphore(semaphore, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

impl VulkanRenderer {
    pub(super) fn present_texture(&mut self, surface: SurfaceHandle, texture: TextureHandle) -> Result<()> {
        let t = self.textures.get(texture).ok_or(RhiError::InvalidHandle("texture"))?;
        if t.desc.format.is_depth() || t.desc.format.is_integer() {
            return Err(RhiError::unsupported(format!("cannot present a {:?} texture", t.desc.format)));
        }
        let s = self.surfaces.get_mut(surface).ok_or(RhiError::InvalidHandle("surface"))?;
        s.present(&self.ctx, t)
    }

    /// Block until no present still reads from a texture.
    pub(super) fn settle_presents(&self) -> Result<()> {
        self.surfaces.values().try_for_each(VulkanSurface::settle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_mode_prefers_low_latency_without_vsync() {
        let all = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(false, &all), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(false, &all[..2]), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(choose_present_mode(false, &all[..1]), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(true, &all), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn surface_format_falls_back_to_first_reported() {
        let srgb = vk::SurfaceFormatKHR { format: vk::Format::B8G8R8A8_SRGB, ..Default::default() };
        let unorm = vk::SurfaceFormatKHR { format: vk::Format::R8G8B8A8_UNORM, ..Default::default() };
        assert_eq!(choose_format(&[srgb, unorm]).map(|f| f.format), Some(vk::Format::R8G8B8A8_UNORM));
        assert_eq!(choose_format(&[srgb]).map(|f| f.format), Some(vk::Format::B8G8R8A8_SRGB));
        assert!(choose_format(&[]).is_none());
    }

    #[test]
    fn undefined_surface_extent_clamps_the_request() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 1024, height: 768 },
            ..Default::default()
        };
        let extent = choose_extent(&caps, (4000, 0));
        assert_eq!((extent.width, extent.height), (1024, 1));
    }
}
