mod common;

use common::*;
use ember_rhi::*;

fn is_contract<T: std::fmt::Debug>(result: Result<T>) -> bool {
    matches!(result, Err(RhiError::ContractViolation(_)))
}

#[test]
fn incompatible_attachments_fail_frame_buffer_creation() -> Result<()> {
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let layout = r.create_render_target_layout(color_layout())?;

        let float = r.create_texture(&TextureDesc::d2(
            TextureUsage::COLOR_ATTACHMENT,
            SIZE,
            SIZE,
            1,
            StorageFormat::RgbaF16,
        ))?;
        assert!(is_contract(r.create_frame_buffer(layout, &RenderAttachments::new().texture(float))));

        let sampled_only =
            r.create_texture(&TextureDesc::d2(TextureUsage::SAMPLED, SIZE, SIZE, 1, StorageFormat::Rgba8))?;
        assert!(is_contract(r.create_frame_buffer(layout, &RenderAttachments::new().texture(sampled_only))));

        let color = r.create_texture(&TextureDesc::d2(
            TextureUsage::COLOR_ATTACHMENT,
            SIZE,
            SIZE,
            1,
            StorageFormat::Rgba8,
        ))?;
        let two = RenderAttachments::new().texture(color).texture(color);
        assert!(is_contract(r.create_frame_buffer(layout, &two)));

        let pair = r.create_render_target_layout(RenderTargetLayout::new(vec![
            AttachmentLayout::color(StorageFormat::Rgba8),
            AttachmentLayout::color(StorageFormat::Rgba8),
        ])?)?;
        let half = r.create_texture(&TextureDesc::d2(
            TextureUsage::COLOR_ATTACHMENT,
            SIZE / 2,
            SIZE / 2,
            1,
            StorageFormat::Rgba8,
        ))?;
        let mixed = RenderAttachments::new().texture(color).texture(half);
        assert!(is_contract(r.create_frame_buffer(pair, &mixed)));

        assert!(r.create_frame_buffer(layout, &RenderAttachments::new().texture(color)).is_ok());
    }
    Ok(())
}

#[test]
fn transfer_window_is_enforced() -> Result<()> {
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let buffer = r.create_buffer(64, BufferUsage::UNIFORM)?;
        assert!(is_contract(r.buffer_set_data(buffer, 0, &[0; 16])));
        assert!(is_contract(r.end_data_transfer()));

        r.begin_data_transfer()?;
        assert!(is_contract(r.begin_data_transfer()));
        let target = color_target(r)?;
        let cmd = r.create_command_buffer()?;
        assert!(is_contract(r.execute_render_pass(target.frame_buffer, &[&cmd], None)));
        r.buffer_set_data(buffer, 16, &[7; 16])?;
        r.end_data_transfer()?;

        r.wait()?;
        assert_eq!(r.buffer_get_data(buffer, 16, 16)?, vec![7; 16]);
    }
    Ok(())
}

#[test]
fn descriptor_misuse_is_reported() -> Result<()> {
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let set_layout = uniform_set_layout(r)?;
        let set = r.create_descriptor_set(set_layout)?;
        let vertices = r.create_buffer(64, BufferUsage::VERTEX)?;
        let uniforms = r.create_buffer(64, BufferUsage::UNIFORM)?;

        assert!(is_contract(r.begin_update(set)));
        r.begin_data_transfer()?;
        let mut update = r.begin_update(set)?;
        assert!(is_contract(r.begin_update(set)));
        assert!(is_contract(update.update_buffer(1, uniforms, 0, None).map(|_| ())));
        update.update_buffer(0, vertices, 0, None)?;
        // Usage is checked when the update is applied.
        assert!(is_contract(r.end_update(update)));

        let mut update = r.begin_update(set)?;
        update.update_buffer(0, uniforms, 0, Some(128))?;
        assert!(is_contract(r.end_update(update)));
        r.end_data_transfer()?;
    }
    Ok(())
}

#[test]
fn fences_must_be_submitted_before_waiting() -> Result<()> {
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let fence = r.create_fence()?;
        assert!(!r.fence_is_signaled(fence)?);
        assert!(is_contract(r.fence_wait(fence)));

        let target = color_target(r)?;
        let mut cmd = r.create_command_buffer()?;
        cmd.begin_recording_with_frame_buffer(target.frame_buffer)?;
        cmd.clear_attachments(&[AttachmentClear::color(0, [0.0; 4])]);
        cmd.end_recording()?;
        r.execute_render_pass(target.frame_buffer, &[&cmd], Some(fence))?;
        // A second submission with the same fence needs a reset in between.
        assert!(is_contract(r.execute_render_pass(target.frame_buffer, &[&cmd], Some(fence))));
        r.fence_wait(fence)?;
        assert!(r.fence_is_signaled(fence)?);
        r.fence_reset(fence)?;
        assert!(!r.fence_is_signaled(fence)?);
        r.destroy_fence(fence)?;
        assert!(matches!(r.fence_wait(fence), Err(RhiError::InvalidHandle(_))));
    }
    Ok(())
}

#[test]
fn draw_without_pipeline_fails_recording() -> Result<()> {
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let target = color_target(r)?;
        let mut cmd = r.create_command_buffer()?;
        cmd.begin_recording_with_frame_buffer(target.frame_buffer)?;
        cmd.draw(0, 3);
        assert!(is_contract(cmd.end_recording()));

        cmd.begin_recording()?;
        cmd.clear_attachments(&[AttachmentClear::color(0, [0.0; 4])]);
        assert!(is_contract(cmd.end_recording()));
    }
    Ok(())
}

#[test]
fn buffer_ranges_past_u64_max_are_rejected() -> Result<()> {
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let buffer = r.create_buffer(16, BufferUsage::UNIFORM)?;
        r.begin_data_transfer()?;
        assert!(is_contract(r.buffer_set_data(buffer, u64::MAX - 3, &[0; 8])));
        assert!(is_contract(r.buffer_set_data(buffer, 12, &[0; 8])));
        r.end_data_transfer()?;
        assert!(is_contract(r.buffer_get_data(buffer, u64::MAX, 2)));
        assert!(is_contract(r.buffer_get_data(buffer, 8, 16)));
    }
    Ok(())
}

#[test]
fn dropped_update_does_not_lock_the_set() -> Result<()> {
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let set_layout = uniform_set_layout(r)?;
        let set = r.create_descriptor_set(set_layout)?;
        let uniforms = r.create_buffer(16, BufferUsage::UNIFORM)?;
        r.begin_data_transfer()?;
        let update = r.begin_update(set)?;
        drop(update);
        let mut update = r.begin_update(set)?;
        update.update_buffer(0, uniforms, 0, None)?;
        r.end_update(update)?;

        // A failed update leaves the set free for the next one.
        let mut update = r.begin_update(set)?;
        update.update_buffer(0, uniforms, 0, Some(64))?;
        assert!(is_contract(r.end_update(update)));
        let mut update = r.begin_update(set)?;
        update.update_buffer(0, uniforms, 0, None)?;
        r.end_update(update)?;
        r.end_data_transfer()?;
    }
    Ok(())
}

#[test]
fn update_is_independent_of_other_sets() -> Result<()> {
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let sampled = r.create_descriptor_set_layout(
            DescriptorLayout::new()
                .with(BindingType::Texture { kind: TextureKind::D2, depth: false }, ShaderStages::FRAGMENT)
                .with(BindingType::Sampler { comparison: false }, ShaderStages::FRAGMENT),
        )?;
        let texture = r.create_texture(&TextureDesc::d2(TextureUsage::SAMPLED, 4, 4, 1, StorageFormat::Rgba8))?;
        let sampler = r.create_sampler(&SamplerDesc::default())?;
        let stale = r.create_descriptor_set(sampled)?;
        r.begin_data_transfer()?;
        let mut update = r.begin_update(stale)?;
        update.update_texture(0, texture, TextureAspect::Color)?;
        update.update_sampler(1, sampler)?;
        r.end_update(update)?;
        r.end_data_transfer()?;

        // `stale` now names a texture that is gone and needs rebuilding for the new sampler.
        r.destroy_texture(texture)?;
        let _ = r.set_sampler(sampler, &SamplerDesc { wrap: WrapMode::Clamp, ..SamplerDesc::default() });

        let layout = uniform_set_layout(r)?;
        let set = r.create_descriptor_set(layout)?;
        let uniforms = r.create_buffer(16, BufferUsage::UNIFORM)?;
        r.begin_data_transfer()?;
        let mut update = r.begin_update(set)?;
        update.update_buffer(0, uniforms, 0, None)?;
        r.end_update(update)?;
        r.end_data_transfer()?;
    }
    Ok(())
}
