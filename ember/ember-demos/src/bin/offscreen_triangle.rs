//! Renders the tinted triangle into a 256x256 texture, reads it back and prints a checksum.
//! Run: cargo run -p ember-demos --bin offscreen_triangle [-- --backend wgpu|vulkan]

use ember_demos::{init_logging, load_config, TriangleScene};
use ember_rhi::*;

const SIZE: u32 = 256;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3))
}

fn run() -> Result<()> {
    let config = load_config()?;
    let mut renderer = create_renderer(&config)?;
    let r = renderer.as_mut();
    log::info!("rendering on {:?} ({})", r.backend(), r.device_name());

    let desc = TextureDesc::d2(TextureUsage::SAMPLED_COLOR_ATTACHMENT, SIZE, SIZE, 1, StorageFormat::Rgba8)
        .with_label("offscreen");
    let texture = r.create_texture(&desc)?;
    let layout = r.create_render_target_layout(RenderTargetLayout::new(vec![AttachmentLayout::color(
        StorageFormat::Rgba8,
    )])?)?;
    let frame_buffer = r.create_frame_buffer(layout, &RenderAttachments::new().texture(texture))?;
    let scene = TriangleScene::new(r, layout)?;

    let mut tint = UniformRing::new(r, 256)?;
    let set = r.create_descriptor_set(scene.set_layout)?;
    r.begin_data_transfer()?;
    let slice = tint.write_pod(r, &[0.1f32, 0.9, 0.3, 1.0])?;
    let mut update = r.begin_update(set)?;
    update.update_buffer(0, slice.buffer, slice.offset, Some(slice.size))?;
    r.end_update(update)?;
    r.end_data_transfer()?;

    let fence = r.create_fence()?;
    let mut cmd = r.create_command_buffer()?;
    scene.record(&mut cmd, frame_buffer, (SIZE, SIZE), set, [0.0, 0.0, 0.0, 1.0])?;
    r.execute_render_pass(frame_buffer, &[&cmd], Some(fence))?;
    r.fence_wait(fence)?;

    let pixels = r.texture_get_data(texture, TextureRegion::full(&desc, 0))?;
    let covered = pixels.chunks_exact(4).filter(|t| t[1] > 0).count();
    println!(
        "{:?}: {} of {} texels covered, checksum {:016x}",
        r.backend(),
        covered,
        SIZE * SIZE,
        fnv1a(&pixels)
    );

    r.destroy_command_buffer(cmd)?;
    r.destroy_fence(fence)?;
    tint.destroy(r)?;
    r.destroy_descriptor_set(set)?;
    r.destroy_frame_buffer(frame_buffer)?;
    r.destroy_texture(texture)?;
    Ok(())
}

fn main() {
    init_logging();
    if let Err(e) = run() {
        log::error!("{e}");
        std::process::exit(1);
    }
}
