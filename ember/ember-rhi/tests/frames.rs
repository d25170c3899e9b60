mod common;

use common::*;
use ember_rhi::*;

const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
const BLUE: [f32; 4] = [0.0, 0.0, 1.0, 1.0];
const GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];

struct Frames {
    targets: Vec<Target>,
    pipeline: PipelineHandle,
    sets: Vec<DescriptorSetHandle>,
    fences: Vec<FenceHandle>,
    ring: UniformRing,
    cmds: VersionedCommandBuffer,
}

impl Frames {
    fn new(r: &mut dyn HardwareRenderer) -> Result<Self> {
        r.set_max_temp_buffer_versions(2)?;
        let targets = vec![color_target(r)?, color_target(r)?];
        let set_layout = uniform_set_layout(r)?;
        // Built against the first layout; the second target's layout is structurally identical.
        let pipeline = fullscreen_pipeline(r, targets[0].layout, UNIFORM_FS, &[set_layout])?;
        let sets = vec![r.create_descriptor_set(set_layout)?, r.create_descriptor_set(set_layout)?];
        let fences = vec![r.create_fence()?, r.create_fence()?];
        let ring = UniformRing::new(r, 256)?;
        let cmds = VersionedCommandBuffer::new(r)?;
        Ok(Self { targets, pipeline, sets, fences, ring, cmds })
    }

    /// Write `color` into the version's ring region and draw with it. Returns the slice written.
    fn draw(&mut self, r: &mut dyn HardwareRenderer, version: u32, color: [f32; 4]) -> Result<RingSlice> {
        let v = version as usize;
        r.reset_temp_buffer_version(version)?;
        self.ring.reset(version);
        r.begin_data_transfer()?;
        let slice = self.ring.write(r, &color_bytes(color))?;
        let mut update = r.begin_update(self.sets[v])?;
        update.update_buffer(0, slice.buffer, slice.offset, Some(slice.size))?;
        r.end_update(update)?;
        r.end_data_transfer()?;

        let cmd = self.cmds.select(version);
        record_fullscreen(cmd, &self.targets[v], self.pipeline, Some(self.sets[v]), [0.0; 4])?;
        r.execute_render_pass(self.targets[v].frame_buffer, &[self.cmds.current()], Some(self.fences[v]))?;
        Ok(slice)
    }
}

#[test]
fn rewriting_one_version_leaves_the_other_intact() -> Result<()> {
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        let mut frames = Frames::new(r)?;
        assert_eq!(r.max_temp_buffer_versions(), 2);

        frames.draw(r, 0, RED)?;
        let in_flight = frames.draw(r, 1, BLUE)?;

        r.fence_wait(frames.fences[0])?;
        r.fence_reset(frames.fences[0])?;
        let rewritten = frames.draw(r, 0, GREEN)?;
        assert_ne!(rewritten.offset, in_flight.offset);

        r.fence_wait(frames.fences[1])?;
        r.fence_wait(frames.fences[0])?;
        assert_eq!(r.buffer_get_data(in_flight.buffer, in_flight.offset, in_flight.size)?, color_bytes(BLUE));
        assert_eq!(r.buffer_get_data(rewritten.buffer, rewritten.offset, rewritten.size)?, color_bytes(GREEN));
        assert_all(&read_texels(r, frames.targets[1].texture)?, [0, 0, 255, 255], "version 1");
        assert_all(&read_texels(r, frames.targets[0].texture)?, [0, 255, 0, 255], "version 0");

        let Frames { ring, cmds, .. } = frames;
        ring.destroy(r)?;
        cmds.destroy(r)?;
    }
    Ok(())
}

#[test]
fn selecting_a_version_wraps_at_the_count() -> Result<()> {
    for mut renderer in renderers() {
        let r = renderer.as_mut();
        r.set_max_temp_buffer_versions(3)?;
        r.reset_temp_buffer_version(4)?;
        assert_eq!(r.temp_buffer_version(), 1);
        assert!(r.set_max_temp_buffer_versions(0).is_err());
        assert_eq!(r.max_temp_buffer_versions(), 3);
    }
    Ok(())
}
