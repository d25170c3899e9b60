//! Opens a window and presents the triangle every frame, cycling the tint through the
//! per-version uniform ring.
//! Run: cargo run -p ember-demos --bin window_present --features window [-- --backend wgpu|vulkan]

use ember_demos::{init_logging, load_config, TriangleScene};
use ember_rhi::*;
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::{Window, WindowId};

/// Render target matching the window size; recreated on resize.
struct Canvas {
    texture: TextureHandle,
    frame_buffer: FrameBufferHandle,
    extent: (u32, u32),
}

impl Canvas {
    fn new(r: &mut dyn HardwareRenderer, layout: RenderTargetLayoutHandle, extent: (u32, u32)) -> Result<Self> {
        let desc =
            TextureDesc::d2(TextureUsage::SAMPLED_COLOR_ATTACHMENT, extent.0, extent.1, 1, StorageFormat::Rgba8);
        let texture = r.create_texture(&desc.with_label("canvas"))?;
        let frame_buffer = r.create_frame_buffer(layout, &RenderAttachments::new().texture(texture))?;
        Ok(Self { texture, frame_buffer, extent })
    }

    fn destroy(self, r: &mut dyn HardwareRenderer) -> Result<()> {
        r.destroy_frame_buffer(self.frame_buffer)?;
        r.destroy_texture(self.texture)
    }
}

struct Gpu {
    renderer: Box<dyn HardwareRenderer>,
    surface: SurfaceHandle,
    layout: RenderTargetLayoutHandle,
    canvas: Canvas,
    scene: TriangleScene,
    tint: UniformRing,
    sets: Vec<DescriptorSetHandle>,
    cmds: VersionedCommandBuffer,
    frame: u64,
}

impl Gpu {
    fn new(window: &Window) -> Result<Self> {
        let config = load_config()?;
        let mut renderer = create_renderer(&config)?;
        let r = renderer.as_mut();
        log::info!("presenting with {:?} ({})", r.backend(), r.device_name());
        let size = window.inner_size();
        let extent = (size.width.max(1), size.height.max(1));
        let display = window.display_handle().map_err(RhiError::backend)?.as_raw();
        let handle = window.window_handle().map_err(RhiError::backend)?.as_raw();
        let surface = r.create_window_surface(display, handle, extent.0, extent.1)?;

        let layout = r.create_render_target_layout(RenderTargetLayout::new(vec![AttachmentLayout::color(
            StorageFormat::Rgba8,
        )])?)?;
        let canvas = Canvas::new(r, layout, extent)?;
        let scene = TriangleScene::new(r, layout)?;
        let tint = UniformRing::new(r, 256)?;
        let sets = (0..r.max_temp_buffer_versions())
            .map(|_| r.create_descriptor_set(scene.set_layout))
            .collect::<Result<Vec<_>>>()?;
        let cmds = VersionedCommandBuffer::new(r)?;
        Ok(Self { renderer, surface, layout, canvas, scene, tint, sets, cmds, frame: 0 })
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        let r = self.renderer.as_mut();
        r.wait()?;
        r.resize_surface(self.surface, width, height)?;
        let old = std::mem::replace(&mut self.canvas, Canvas::new(r, self.layout, (width, height))?);
        old.destroy(r)
    }

    fn draw(&mut self) -> Result<()> {
        let r = self.renderer.as_mut();
        let version = (self.frame % u64::from(r.max_temp_buffer_versions())) as u32;
        r.reset_temp_buffer_version(version)?;
        self.tint.reset(version);

        let t = self.frame as f32 / 60.0;
        let color = [0.5 + 0.5 * t.sin(), 0.5 + 0.5 * (t + 2.1).sin(), 0.5 + 0.5 * (t + 4.2).sin(), 1.0];
        r.begin_data_transfer()?;
        let slice = self.tint.write_pod(r, &color)?;
        let set = self.sets[version as usize];
        let mut update = r.begin_update(set)?;
        update.update_buffer(0, slice.buffer, slice.offset, Some(slice.size))?;
        r.end_update(update)?;
        r.end_data_transfer()?;

        let cmd = self.cmds.select(version);
        self.scene.record(cmd, self.canvas.frame_buffer, self.canvas.extent, set, [0.1, 0.1, 0.15, 1.0])?;
        r.execute_render_pass(self.canvas.frame_buffer, &[self.cmds.current()], None)?;
        r.present(self.surface, self.canvas.texture)?;
        self.frame += 1;
        Ok(())
    }

    fn shutdown(self) -> Result<()> {
        let Gpu { mut renderer, surface, canvas, tint, sets, cmds, .. } = self;
        let r = renderer.as_mut();
        r.wait()?;
        cmds.destroy(r)?;
        for set in sets {
            r.destroy_descriptor_set(set)?;
        }
        tint.destroy(r)?;
        canvas.destroy(r)?;
        r.destroy_surface(surface)
    }
}

#[derive(Default)]
struct App {
    gpu: Option<Gpu>,
    // Declared after `gpu` so the surface goes first.
    window: Option<Window>,
}

impl App {
    fn fail(&mut self, event_loop: &ActiveEventLoop, e: RhiError) {
        log::error!("{e}");
        self.gpu = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let attrs = Window::default_attributes()
            .with_title("Ember triangle")
            .with_inner_size(winit::dpi::LogicalSize::new(640, 480));
        let window = match event_loop.create_window(attrs) {
            Ok(window) => window,
            Err(e) => return self.fail(event_loop, RhiError::backend(e)),
        };
        match Gpu::new(&window) {
            Ok(gpu) => self.gpu = Some(gpu),
            Err(e) => return self.fail(event_loop, e),
        }
        window.request_redraw();
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(gpu) = self.gpu.as_mut() else { return };
        let result = match event {
            WindowEvent::CloseRequested => {
                if let Some(gpu) = self.gpu.take() {
                    if let Err(e) = gpu.shutdown() {
                        log::error!("shutdown: {e}");
                    }
                }
                event_loop.exit();
                Ok(())
            }
            WindowEvent::Resized(size) => gpu.resize(size.width, size.height),
            WindowEvent::RedrawRequested => {
                let drawn = gpu.draw();
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
                drawn
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            self.fail(event_loop, e);
        }
    }
}

fn main() {
    init_logging();
    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(e) => {
            log::error!("event loop: {e}");
            std::process::exit(1);
        }
    };
    let mut app = App::default();
    if let Err(e) = event_loop.run_app(&mut app) {
        log::error!("{e}");
    }
}
