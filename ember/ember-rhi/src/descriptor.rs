//! Descriptor set layouts and batched descriptor updates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, RhiError};
use crate::format::{BufferUsage, TextureUsage};
use crate::handle::{BufferHandle, DescriptorSetHandle, SamplerHandle, TextureHandle};
use crate::resource::{SamplerDesc, TextureAspect, TextureDesc, TextureKind};

bitflags::bitflags! {
    /// Shader stages that can see a binding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const GRAPHICS = Self::VERTEX.bits() | Self::FRAGMENT.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingType {
    UniformBuffer,
    StorageBuffer { read_only: bool },
    /// A sampled texture. `depth` selects depth sampling.
    Texture { kind: TextureKind, depth: bool },
    Sampler { comparison: bool },
    /// A hole in the binding table.
    Unused,
}

impl BindingType {
    pub fn name(&self) -> &'static str {
        match self {
            BindingType::UniformBuffer => "uniform buffer",
            BindingType::StorageBuffer { .. } => "storage buffer",
            BindingType::Texture { .. } => "texture",
            BindingType::Sampler { .. } => "sampler",
            BindingType::Unused => "unused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: BindingType,
    pub stages: ShaderStages,
}

/// Ordered binding table. Fixed for the lifetime of the layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DescriptorLayout {
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next binding. Binding indices follow insertion order.
    pub fn with(mut self, ty: BindingType, stages: ShaderStages) -> Self {
        let binding = self.bindings.len() as u32;
        self.bindings.push(DescriptorBinding { binding, ty, stages });
        self
    }

    pub fn from_bindings(mut bindings: Vec<DescriptorBinding>) -> Result<Self> {
        bindings.sort_by_key(|b| b.binding);
        for pair in bindings.windows(2) {
            if pair[0].binding == pair[1].binding {
                return Err(RhiError::unsupported(format!(
                    "binding {} declared twice",
                    pair[0].binding
                )));
            }
        }
        Ok(Self { bindings })
    }

    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }

    pub fn get(&self, binding: u32) -> Option<&DescriptorBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }

    /// Bindings that need a resource written before the set is usable.
    pub fn active(&self) -> impl Iterator<Item = &DescriptorBinding> {
        self.bindings.iter().filter(|b| b.ty != BindingType::Unused)
    }

    pub fn count(&self, pred: impl Fn(&BindingType) -> bool) -> u32 {
        self.bindings.iter().filter(|b| pred(&b.ty)).count() as u32
    }
}

/// One resource written to a binding location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorWrite {
    Texture { texture: TextureHandle, aspect: TextureAspect },
    Sampler(SamplerHandle),
    /// `length: None` covers the rest of the buffer from `offset`.
    Buffer { buffer: BufferHandle, offset: u64, length: Option<u64> },
}

impl DescriptorWrite {
    fn matches(&self, ty: &BindingType) -> bool {
        matches!(
            (self, ty),
            (DescriptorWrite::Texture { .. }, BindingType::Texture { .. })
                | (DescriptorWrite::Sampler(_), BindingType::Sampler { .. })
                | (
                    DescriptorWrite::Buffer { .. },
                    BindingType::UniformBuffer | BindingType::StorageBuffer { .. }
                )
        )
    }

    fn name(&self) -> &'static str {
        match self {
            DescriptorWrite::Texture { .. } => "texture",
            DescriptorWrite::Sampler(_) => "sampler",
            DescriptorWrite::Buffer { .. } => "buffer",
        }
    }
}

/// Raised while a set has an update batch outstanding. Shared between the set and its batch.
#[derive(Debug, Clone, Default)]
pub struct UpdateFlag(Arc<AtomicBool>);

impl UpdateFlag {
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn lower(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A batch of descriptor writes, started by `begin_update` and applied atomically by `end_update`.
/// A later write to the same location replaces the earlier one. Dropping the batch abandons it.
#[derive(Debug)]
pub struct DescriptorSetUpdate {
    set: DescriptorSetHandle,
    layout: Arc<DescriptorLayout>,
    writes: BTreeMap<u32, DescriptorWrite>,
    validate: bool,
    flag: UpdateFlag,
}

impl DescriptorSetUpdate {
    pub(crate) fn new(set: DescriptorSetHandle, layout: Arc<DescriptorLayout>, validate: bool, flag: UpdateFlag) -> Self {
        flag.raise();
        Self { set, layout, writes: BTreeMap::new(), validate, flag }
    }

    pub fn set(&self) -> DescriptorSetHandle {
        self.set
    }

    pub fn update_texture(&mut self, location: u32, texture: TextureHandle, aspect: TextureAspect) -> Result<&mut Self> {
        self.write(location, DescriptorWrite::Texture { texture, aspect })
    }

    pub fn update_sampler(&mut self, location: u32, sampler: SamplerHandle) -> Result<&mut Self> {
        self.write(location, DescriptorWrite::Sampler(sampler))
    }

    pub fn update_buffer(
        &mut self,
        location: u32,
        buffer: BufferHandle,
        offset: u64,
        length: Option<u64>,
    ) -> Result<&mut Self> {
        self.write(location, DescriptorWrite::Buffer { buffer, offset, length })
    }

    fn write(&mut self, location: u32, write: DescriptorWrite) -> Result<&mut Self> {
        if self.validate {
            let binding = self
                .layout
                .get(location)
                .ok_or_else(|| RhiError::contract(format!("descriptor set write out of bounds: location {location}")))?;
            if !write.matches(&binding.ty) {
                return Err(RhiError::contract(format!(
                    "descriptor type mismatch at location {location}: layout expects {}, got {}",
                    binding.ty.name(),
                    write.name()
                )));
            }
        }
        self.writes.insert(location, write);
        Ok(self)
    }

    /// Hand the writes over for applying. The set stops counting as being updated.
    pub(crate) fn into_writes(mut self) -> (DescriptorSetHandle, BTreeMap<u32, DescriptorWrite>) {
        (self.set, std::mem::take(&mut self.writes))
    }
}

impl Drop for DescriptorSetUpdate {
    fn drop(&mut self) {
        self.flag.lower();
    }
}

/// Check a buffer range written to a binding against the buffer's usage and size.
pub(crate) fn check_buffer_write(
    location: u32,
    ty: &BindingType,
    usage: BufferUsage,
    size: u64,
    offset: u64,
    length: Option<u64>,
) -> Result<()> {
    let needed = match ty {
        BindingType::UniformBuffer => BufferUsage::UNIFORM,
        BindingType::StorageBuffer { .. } => BufferUsage::STORAGE,
        _ => return Ok(()),
    };
    if !usage.contains(needed) {
        return Err(RhiError::contract(format!(
            "buffer written to location {location} lacks {needed:?} usage"
        )));
    }
    let end = offset.saturating_add(length.unwrap_or(size.saturating_sub(offset)));
    if offset >= size || end > size {
        return Err(RhiError::contract(format!(
            "buffer range {offset}..{end} at location {location} exceeds buffer size {size}"
        )));
    }
    Ok(())
}

pub(crate) fn check_texture_write(
    location: u32,
    ty: &BindingType,
    desc: &TextureDesc,
    aspect: TextureAspect,
) -> Result<()> {
    let BindingType::Texture { kind, depth } = *ty else {
        return Ok(());
    };
    if !desc.usage.contains(TextureUsage::SAMPLED) {
        return Err(RhiError::contract(format!("texture at location {location} lacks SAMPLED usage")));
    }
    if desc.kind != kind {
        return Err(RhiError::contract(format!(
            "texture at location {location} is {:?}, layout expects {kind:?}",
            desc.kind
        )));
    }
    if depth != (aspect == TextureAspect::Depth) || (aspect == TextureAspect::Depth && !desc.format.is_depth()) {
        return Err(RhiError::contract(format!(
            "aspect {aspect:?} of {:?} does not match binding at location {location}",
            desc.format
        )));
    }
    Ok(())
}

pub(crate) fn check_sampler_write(location: u32, ty: &BindingType, desc: &SamplerDesc) -> Result<()> {
    if let BindingType::Sampler { comparison } = *ty {
        if comparison != desc.is_comparison() {
            return Err(RhiError::contract(format!(
                "sampler at location {location}: comparison {} does not match layout",
                desc.is_comparison()
            )));
        }
    }
    Ok(())
}

/// What a set currently has bound, merged across updates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorContents {
    writes: BTreeMap<u32, DescriptorWrite>,
}

impl DescriptorContents {
    pub fn apply(&mut self, writes: BTreeMap<u32, DescriptorWrite>) {
        self.writes.extend(writes);
    }

    pub fn get(&self, location: u32) -> Option<&DescriptorWrite> {
        self.writes.get(&location)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &DescriptorWrite)> {
        self.writes.iter().map(|(k, v)| (*k, v))
    }

    /// First active binding of `layout` that has never been written.
    pub fn first_missing(&self, layout: &DescriptorLayout) -> Option<u32> {
        layout
            .active()
            .map(|b| b.binding)
            .find(|binding| !self.writes.contains_key(binding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn layout() -> Arc<DescriptorLayout> {
        Arc::new(
            DescriptorLayout::new()
                .with(BindingType::UniformBuffer, ShaderStages::GRAPHICS)
                .with(BindingType::Texture { kind: TextureKind::D2, depth: false }, ShaderStages::FRAGMENT)
                .with(BindingType::Sampler { comparison: false }, ShaderStages::FRAGMENT),
        )
    }

    struct Handles {
        set: DescriptorSetHandle,
        buffer: BufferHandle,
        texture: TextureHandle,
        sampler: SamplerHandle,
    }

    fn handles() -> Handles {
        Handles {
            set: SlotMap::<DescriptorSetHandle, ()>::with_key().insert(()),
            buffer: SlotMap::<BufferHandle, ()>::with_key().insert(()),
            texture: SlotMap::<TextureHandle, ()>::with_key().insert(()),
            sampler: SlotMap::<SamplerHandle, ()>::with_key().insert(()),
        }
    }

    #[test]
    fn abandoned_update_releases_the_set() {
        let h = handles();
        let flag = UpdateFlag::default();
        let update = DescriptorSetUpdate::new(h.set, layout(), true, flag.clone());
        assert!(flag.is_raised());
        drop(update);
        assert!(!flag.is_raised());

        let mut update = DescriptorSetUpdate::new(h.set, layout(), true, flag.clone());
        update.update_sampler(2, h.sampler).unwrap();
        let (_, writes) = update.into_writes();
        assert_eq!(writes.len(), 1);
        assert!(!flag.is_raised());
    }

    #[test]
    fn write_order_does_not_matter() {
        let h = handles();
        let mut forward = DescriptorSetUpdate::new(h.set, layout(), true, UpdateFlag::default());
        forward.update_buffer(0, h.buffer, 0, None).unwrap();
        forward.update_texture(1, h.texture, TextureAspect::Color).unwrap();
        forward.update_sampler(2, h.sampler).unwrap();

        let mut shuffled = DescriptorSetUpdate::new(h.set, layout(), true, UpdateFlag::default());
        shuffled.update_sampler(2, h.sampler).unwrap();
        shuffled.update_buffer(0, h.buffer, 0, None).unwrap();
        shuffled.update_texture(1, h.texture, TextureAspect::Color).unwrap();

        let mut a = DescriptorContents::default();
        a.apply(forward.into_writes().1);
        let mut b = DescriptorContents::default();
        b.apply(shuffled.into_writes().1);
        assert_eq!(a, b);
        assert_eq!(a.first_missing(&layout()), None);
    }

    #[test]
    fn later_write_replaces_earlier() {
        let h = handles();
        let mut update = DescriptorSetUpdate::new(h.set, layout(), true, UpdateFlag::default());
        update.update_buffer(0, h.buffer, 0, None).unwrap();
        update.update_buffer(0, h.buffer, 256, Some(64)).unwrap();
        let (_, writes) = update.into_writes();
        assert_eq!(
            writes[&0],
            DescriptorWrite::Buffer { buffer: h.buffer, offset: 256, length: Some(64) }
        );
    }

    #[test]
    fn out_of_bounds_and_mismatched_writes_are_rejected() {
        let h = handles();
        let mut update = DescriptorSetUpdate::new(h.set, layout(), true, UpdateFlag::default());
        let err = update.update_sampler(7, h.sampler).unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
        let err = update.update_sampler(0, h.sampler).unwrap_err();
        assert!(err.to_string().contains("type mismatch"));
    }

    #[test]
    fn unchecked_when_validation_is_off() {
        let h = handles();
        let mut update = DescriptorSetUpdate::new(h.set, layout(), false, UpdateFlag::default());
        update.update_sampler(7, h.sampler).unwrap();
    }

    #[test]
    fn partial_contents_report_missing_binding() {
        let h = handles();
        let mut update = DescriptorSetUpdate::new(h.set, layout(), true, UpdateFlag::default());
        update.update_buffer(0, h.buffer, 0, None).unwrap();
        let mut contents = DescriptorContents::default();
        contents.apply(update.into_writes().1);
        assert_eq!(contents.first_missing(&layout()), Some(1));
    }

    #[test]
    fn resource_checks() {
        let ty = BindingType::UniformBuffer;
        check_buffer_write(0, &ty, BufferUsage::UNIFORM, 256, 0, None).unwrap();
        assert!(check_buffer_write(0, &ty, BufferUsage::VERTEX, 256, 0, None).is_err());
        assert!(check_buffer_write(0, &ty, BufferUsage::UNIFORM, 256, 128, Some(256)).is_err());

        let tex = BindingType::Texture { kind: TextureKind::D2, depth: true };
        let shadow = TextureDesc::d2(
            TextureUsage::SAMPLED_DEPTH_ATTACHMENT,
            64,
            64,
            1,
            crate::format::StorageFormat::Depth32,
        );
        check_texture_write(1, &tex, &shadow, TextureAspect::Depth).unwrap();
        assert!(check_texture_write(1, &tex, &shadow, TextureAspect::Color).is_err());

        let cmp = SamplerDesc { compare: crate::pipeline::CompareFunc::LessEqual, ..SamplerDesc::default() };
        check_sampler_write(2, &BindingType::Sampler { comparison: true }, &cmp).unwrap();
        assert!(check_sampler_write(2, &BindingType::Sampler { comparison: false }, &cmp).is_err());
    }

    #[test]
    fn duplicate_binding_index_is_rejected() {
        let b = DescriptorBinding { binding: 0, ty: BindingType::UniformBuffer, stages: ShaderStages::VERTEX };
        assert!(DescriptorLayout::from_bindings(vec![b, b]).is_err());
    }
}
