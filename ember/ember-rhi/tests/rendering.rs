mod common;

use common::*;
use ember_rhi::*;

#[test]
fn fullscreen_triangle_covers_the_clear() -> Result<()> {
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let target = color_target(r)?;
        let pipeline = fullscreen_pipeline(r, target.layout, GREEN_FS, &[])?;
        let fence = r.create_fence()?;
        let mut cmd = r.create_command_buffer()?;
        record_fullscreen(&mut cmd, &target, pipeline, None, [1.0, 0.0, 1.0, 1.0])?;
        r.execute_render_pass(target.frame_buffer, &[&cmd], Some(fence))?;
        r.fence_wait(fence)?;
        assert!(r.fence_is_signaled(fence)?);
        assert_all(&read_texels(r, target.texture)?, [0, 255, 0, 255], "triangle");
        r.destroy_command_buffer(cmd)?;
        r.destroy_fence(fence)?;
    }
    Ok(())
}

#[test]
fn clear_alone_fills_the_target() -> Result<()> {
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let target = color_target(r)?;
        let mut cmd = r.create_command_buffer()?;
        cmd.begin_recording_with_frame_buffer(target.frame_buffer)?;
        cmd.clear_attachments(&[AttachmentClear::color(0, [1.0, 0.0, 1.0, 1.0])]);
        cmd.end_recording()?;
        r.execute_render_pass(target.frame_buffer, &[&cmd], None)?;
        r.wait()?;
        assert_all(&read_texels(r, target.texture)?, [255, 0, 255, 255], "clear");
    }
    Ok(())
}

#[test]
fn writes_in_the_transfer_window_reach_later_draws() -> Result<()> {
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let target = color_target(r)?;
        let set_layout = uniform_set_layout(r)?;
        let pipeline = fullscreen_pipeline(r, target.layout, UNIFORM_FS, &[set_layout])?;
        let tint = r.create_mapped_buffer(16, BufferUsage::UNIFORM)?;
        let set = r.create_descriptor_set(set_layout)?;

        r.begin_data_transfer()?;
        r.buffer_set_data(tint, 0, &color_bytes([0.0, 0.0, 1.0, 1.0]))?;
        let mut update = r.begin_update(set)?;
        update.update_buffer(0, tint, 0, None)?;
        r.end_update(update)?;
        r.end_data_transfer()?;

        let fence = r.create_fence()?;
        let mut cmd = r.create_command_buffer()?;
        record_fullscreen(&mut cmd, &target, pipeline, Some(set), [0.0; 4])?;
        r.execute_render_pass(target.frame_buffer, &[&cmd], Some(fence))?;
        r.fence_wait(fence)?;
        assert_all(&read_texels(r, target.texture)?, [0, 0, 255, 255], "uniform color");
        assert_eq!(r.buffer_get_data(tint, 0, 16)?, color_bytes([0.0, 0.0, 1.0, 1.0]));
    }
    Ok(())
}

#[test]
fn re_recording_after_the_fence_replaces_the_content() -> Result<()> {
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let target = color_target(r)?;
        let pipeline = fullscreen_pipeline(r, target.layout, GREEN_FS, &[])?;
        let fence = r.create_fence()?;
        let mut cmd = r.create_command_buffer()?;

        record_fullscreen(&mut cmd, &target, pipeline, None, [1.0, 0.0, 0.0, 1.0])?;
        r.execute_render_pass(target.frame_buffer, &[&cmd], Some(fence))?;
        r.fence_wait(fence)?;
        assert_eq!(cmd.state(), CommandBufferState::Executable);
        r.fence_reset(fence)?;

        cmd.begin_recording_with_frame_buffer(target.frame_buffer)?;
        cmd.clear_attachments(&[AttachmentClear::color(0, [0.0, 0.0, 1.0, 1.0])]);
        cmd.end_recording()?;
        r.execute_render_pass(target.frame_buffer, &[&cmd], Some(fence))?;
        r.fence_wait(fence)?;
        assert_all(&read_texels(r, target.texture)?, [0, 0, 255, 255], "second recording");
    }
    Ok(())
}

#[test]
fn descriptor_update_order_does_not_matter() -> Result<()> {
    const THREE_TINTS_FS: &str = r#"
struct Tint { color: vec4<f32> }
@group(0) @binding(0) var<uniform> red: Tint;
@group(0) @binding(1) var<uniform> green: Tint;
@group(0) @binding(2) var<uniform> blue: Tint;

@fragment
fn main() -> @location(0) vec4<f32> {
    return vec4<f32>(red.color.x, green.color.y, blue.color.z, 1.0);
}
"#;
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let layout = DescriptorLayout::new()
            .with(BindingType::UniformBuffer, ShaderStages::FRAGMENT)
            .with(BindingType::UniformBuffer, ShaderStages::FRAGMENT)
            .with(BindingType::UniformBuffer, ShaderStages::FRAGMENT);
        let set_layout = r.create_descriptor_set_layout(layout)?;
        let tints = [[1.0, 0.0, 0.0, 1.0], [0.0, 1.0, 0.0, 1.0], [0.0, 0.0, 1.0, 1.0]];
        let mut buffers = Vec::new();
        for tint in tints {
            let buffer = r.create_buffer(16, BufferUsage::UNIFORM)?;
            buffers.push(buffer);
            r.begin_data_transfer()?;
            r.buffer_set_data(buffer, 0, &color_bytes(tint))?;
            r.end_data_transfer()?;
        }

        let mut results = Vec::new();
        for order in [[0u32, 1, 2], [2, 0, 1], [1, 2, 0]] {
            let target = color_target(r)?;
            let pipeline = fullscreen_pipeline(r, target.layout, THREE_TINTS_FS, &[set_layout])?;
            let set = r.create_descriptor_set(set_layout)?;
            r.begin_data_transfer()?;
            let mut update = r.begin_update(set)?;
            for location in order {
                update.update_buffer(location, buffers[location as usize], 0, None)?;
            }
            r.end_update(update)?;
            r.end_data_transfer()?;

            let mut cmd = r.create_command_buffer()?;
            record_fullscreen(&mut cmd, &target, pipeline, Some(set), [0.0; 4])?;
            r.execute_render_pass(target.frame_buffer, &[&cmd], None)?;
            r.wait()?;
            results.push(read_texels(r, target.texture)?);
        }
        assert_all(&results[0], [255, 255, 255, 255], "ordered update");
        assert!(results.iter().all(|texels| *texels == results[0]));
    }
    Ok(())
}

#[test]
fn staged_texture_upload_reads_back() -> Result<()> {
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let desc = TextureDesc::d2(TextureUsage::SAMPLED, 8, 4, 1, StorageFormat::Rgba8);
        let texture = r.create_texture(&desc)?;
        let texels: Vec<u8> = (0..8 * 4 * 4).map(|i| i as u8).collect();
        r.begin_data_transfer()?;
        r.texture_set_data(texture, TextureRegion::full(&desc, 0), DataType::Byte4, &texels)?;
        r.end_data_transfer()?;
        r.wait()?;
        assert_eq!(r.texture_get_data(texture, TextureRegion::full(&desc, 0))?, texels);
        r.destroy_texture(texture)?;
    }
    Ok(())
}

#[test]
fn device_local_writes_reach_the_next_draw() -> Result<()> {
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let target = color_target(r)?;
        let set_layout = uniform_set_layout(r)?;
        let pipeline = fullscreen_pipeline(r, target.layout, UNIFORM_FS, &[set_layout])?;
        let tint = r.create_buffer(16, BufferUsage::UNIFORM)?;
        let set = r.create_descriptor_set(set_layout)?;
        let mut cmd = r.create_command_buffer()?;

        // The bracket alone orders the upload before the draw.
        r.begin_data_transfer()?;
        r.buffer_set_data(tint, 0, &color_bytes([1.0, 1.0, 0.0, 1.0]))?;
        let mut update = r.begin_update(set)?;
        update.update_buffer(0, tint, 0, None)?;
        r.end_update(update)?;
        r.end_data_transfer()?;
        record_fullscreen(&mut cmd, &target, pipeline, Some(set), [0.0; 4])?;
        r.execute_render_pass(target.frame_buffer, &[&cmd], None)?;
        r.wait()?;
        assert_all(&read_texels(r, target.texture)?, [255, 255, 0, 255], "upload without a barrier");

        let version = r.temp_buffer_version();
        r.begin_data_transfer()?;
        r.buffer_set_data(tint, 0, &color_bytes([0.0, 1.0, 1.0, 1.0]))?;
        r.end_data_transfer()?;
        r.transfer_barrier(version)?;
        r.execute_render_pass(target.frame_buffer, &[&cmd], None)?;
        r.wait()?;
        assert_all(&read_texels(r, target.texture)?, [0, 255, 255, 255], "upload behind a barrier");
    }
    Ok(())
}

#[test]
fn sub_word_buffer_writes_leave_neighbours_intact() -> Result<()> {
    let expected = [0xAA, 0xAA, 0xAA, 0xAA, 0x11, 0x22, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0x33, 0xAA, 0xAA, 0xAA];
    for mut renderer in renderers_with(ValidationPolicy::Off) {
        let r = renderer.as_mut();
        let buffer = r.create_buffer(16, BufferUsage::UNIFORM)?;
        r.begin_data_transfer()?;
        r.buffer_set_data(buffer, 0, &[0xAA; 16])?;
        r.buffer_set_data(buffer, 4, &[0x11, 0x22])?;
        r.buffer_set_data(buffer, 12, &[0x33])?;
        r.end_data_transfer()?;
        r.wait()?;
        assert_eq!(r.buffer_get_data(buffer, 0, 16)?, expected, "{:?}", r.backend());
    }

    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let buffer = r.create_buffer(16, BufferUsage::UNIFORM)?;
        r.begin_data_transfer()?;
        r.buffer_set_data(buffer, 0, &[0xAA; 16])?;
        let sub_word = r.buffer_set_data(buffer, 4, &[0x11, 0x22]);
        r.end_data_transfer()?;
        r.wait()?;
        match r.backend() {
            Backend::Wgpu => {
                assert!(matches!(sub_word, Err(RhiError::ContractViolation(_))));
                assert_eq!(r.buffer_get_data(buffer, 0, 16)?, vec![0xAA; 16]);
            }
            Backend::Vulkan => {
                sub_word?;
                assert_eq!(r.buffer_get_data(buffer, 4, 4)?, vec![0x11, 0x22, 0xAA, 0xAA]);
            }
        }
    }
    Ok(())
}

#[test]
fn viewport_outside_the_target_draws_nothing() -> Result<()> {
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let target = color_target(r)?;
        let pipeline = fullscreen_pipeline(r, target.layout, GREEN_FS, &[])?;
        let mut cmd = r.create_command_buffer()?;
        cmd.begin_recording_with_frame_buffer(target.frame_buffer)?;
        cmd.clear_attachments(&[AttachmentClear::color(0, [1.0, 0.0, 0.0, 1.0])]);
        cmd.set_viewport(Viewport::new(300, 300, 10, 10));
        cmd.bind_pipeline(pipeline);
        cmd.draw(0, 3);
        cmd.end_recording()?;
        r.execute_render_pass(target.frame_buffer, &[&cmd], None)?;
        r.wait()?;
        assert_all(&read_texels(r, target.texture)?, [255, 0, 0, 255], "off-target viewport");

        // A visible viewport afterwards lifts the empty scissor.
        cmd.begin_recording_with_frame_buffer(target.frame_buffer)?;
        cmd.set_viewport(Viewport::new(300, 300, 10, 10));
        cmd.bind_pipeline(pipeline);
        cmd.draw(0, 3);
        cmd.set_viewport(Viewport::new(0, 0, SIZE, SIZE));
        cmd.draw(0, 3);
        cmd.end_recording()?;
        r.execute_render_pass(target.frame_buffer, &[&cmd], None)?;
        r.wait()?;
        assert_all(&read_texels(r, target.texture)?, [0, 255, 0, 255], "viewport back on target");
    }
    Ok(())
}

#[test]
fn partly_off_target_viewport_is_scissored() -> Result<()> {
    // Covers x in [0, 1] of clip space.
    const RIGHT_HALF_VS: &str = r#"
@vertex
fn main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    var corners = array<vec2<f32>, 6>(
        vec2<f32>(0.0, -1.0), vec2<f32>(1.0, -1.0), vec2<f32>(0.0, 1.0),
        vec2<f32>(0.0, 1.0), vec2<f32>(1.0, -1.0), vec2<f32>(1.0, 1.0),
    );
    return vec4<f32>(corners[index], 0.0, 1.0);
}
"#;
    let half = SIZE as usize / 2;
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let target = color_target(r)?;
        let pipeline = vertex_index_pipeline(r, target.layout, RIGHT_HALF_VS, GREEN_FS, &[])?;
        let mut cmd = r.create_command_buffer()?;
        cmd.begin_recording_with_frame_buffer(target.frame_buffer)?;
        cmd.clear_attachments(&[AttachmentClear::color(0, [1.0, 0.0, 0.0, 1.0])]);
        cmd.set_viewport(Viewport::new(-(half as i32), 0, SIZE, SIZE));
        cmd.bind_pipeline(pipeline);
        cmd.draw(0, 6);
        cmd.end_recording()?;
        r.execute_render_pass(target.frame_buffer, &[&cmd], None)?;
        r.wait()?;
        let texels = read_texels(r, target.texture)?;
        for row in texels.chunks_exact(SIZE as usize) {
            // Nothing lands outside the requested rectangle.
            assert!(row[half..].iter().all(|t| *t == [255, 0, 0, 255]), "{:?}", r.backend());
            if r.backend() == Backend::Vulkan {
                // Clip-space x = 0 sits at the left edge of the target.
                assert!(row[..half].iter().all(|t| *t == [0, 255, 0, 255]));
            }
        }
    }
    Ok(())
}
