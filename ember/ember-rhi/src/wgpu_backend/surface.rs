use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use wgpu::SurfaceTargetUnsafe;

use crate::error::{Result, RhiError};
use crate::handle::{SurfaceHandle, TextureHandle};

use super::WgpuRenderer;

pub struct WgpuSurface {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
}

impl WgpuSurface {
    pub fn new(
        renderer: &WgpuRenderer,
        raw_display_handle: RawDisplayHandle,
        raw_window_handle: RawWindowHandle,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let target = SurfaceTargetUnsafe::RawHandle { raw_display_handle, raw_window_handle };
        // SAFETY: the caller keeps the window alive until `destroy_surface`.
        let surface = unsafe { renderer.instance.create_surface_unsafe(target) }
            .map_err(|e| RhiError::unsupported(format!("surface creation failed: {e}")))?;
        let caps = surface.get_capabilities(&renderer.adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| RhiError::unsupported("surface is not compatible with the adapter"))?;
        let present_mode = if renderer.vsync { wgpu::PresentMode::Fifo } else { wgpu::PresentMode::AutoNoVsync };
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: width.max(1),
            height: height.max(1),
            present_mode,
            alpha_mode: caps.alpha_modes.first().copied().unwrap_or(wgpu::CompositeAlphaMode::Opaque),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&renderer.device, &config);
        log::info!("wgpu surface {}x{} {format:?}", config.width, config.height);
        Ok(Self { surface, config })
    }

    pub fn resize(&mut self, device: &wgpu::Device, width: u32, height: u32) {
        self.config.width = width.max(1);
        self.config.height = height.max(1);
        self.surface.configure(device, &self.config);
    }

    fn acquire(&self, device: &wgpu::Device) -> Result<wgpu::SurfaceTexture> {
        match self.surface.get_current_texture() {
            Ok(frame) => Ok(frame),
            Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost) => {
                self.surface.configure(device, &self.config);
                self.surface.get_current_texture().map_err(|e| RhiError::backend(e.to_string()))
            }
            Err(wgpu::SurfaceError::Timeout) => Err(RhiError::backend("surface acquire timed out")),
            Err(e) => Err(RhiError::backend(e.to_string())),
        }
    }
}

impl WgpuRenderer {
    pub(super) fn present_texture(&mut self, surface: SurfaceHandle, texture: TextureHandle) -> Result<()> {
        let t = self.texture(texture)?;
        if t.desc.format.is_depth() || t.desc.format.is_integer() {
            return Err(RhiError::unsupported(format!("cannot present a {:?} texture", t.desc.format)));
        }
        let src = t.texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("ember_present_source"),
            dimension: Some(wgpu::TextureViewDimension::D2),
            mip_level_count: Some(1),
            array_layer_count: Some(1),
            ..Default::default()
        });
        let s = self.surfaces.get(surface).ok_or(RhiError::InvalidHandle("surface"))?;
        let format = s.config.format;
        let frame = s.acquire(&self.device)?;
        let dst = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.blitter.prepare(&self.device, format);
        let mut encoder = self.encoder("ember_present");
        self.blitter.draw(&self.device, &mut encoder, &src, &dst, format);
        self.submit(encoder.finish());
        frame.present();
        Ok(())
    }
}
