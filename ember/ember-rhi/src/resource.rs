//! Texture and sampler descriptions shared by both backends.

use crate::error::{Result, RhiError};
use crate::format::{StorageFormat, TextureUsage};
use crate::pipeline::CompareFunc;

/// Texture type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureKind {
    #[default]
    D2,
    D2Array,
    D3,
    Cube,
    CubeArray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CubeFace {
    PositiveX,
    NegativeX,
    PositiveY,
    NegativeY,
    PositiveZ,
    NegativeZ,
}

impl CubeFace {
    pub const ALL: [CubeFace; 6] = [
        CubeFace::PositiveX,
        CubeFace::NegativeX,
        CubeFace::PositiveY,
        CubeFace::NegativeY,
        CubeFace::PositiveZ,
        CubeFace::NegativeZ,
    ];

    pub fn layer(self) -> u32 {
        self as u32
    }
}

/// Which aspect of a texture a descriptor reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureAspect {
    #[default]
    Color,
    Depth,
    Stencil,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub label: Option<&'static str>,
    pub kind: TextureKind,
    pub usage: TextureUsage,
    pub format: StorageFormat,
    pub width: u32,
    pub height: u32,
    /// Depth for 3D textures, layer count for arrays, cube count for cube arrays, 1 otherwise.
    pub depth_or_layers: u32,
    pub mip_levels: u32,
}

impl TextureDesc {
    pub fn d2(usage: TextureUsage, width: u32, height: u32, mip_levels: u32, format: StorageFormat) -> Self {
        Self {
            label: None,
            kind: TextureKind::D2,
            usage,
            format,
            width,
            height,
            depth_or_layers: 1,
            mip_levels,
        }
    }

    pub fn d2_array(
        usage: TextureUsage,
        width: u32,
        height: u32,
        layers: u32,
        mip_levels: u32,
        format: StorageFormat,
    ) -> Self {
        Self {
            kind: TextureKind::D2Array,
            depth_or_layers: layers,
            ..Self::d2(usage, width, height, mip_levels, format)
        }
    }

    pub fn d3(
        usage: TextureUsage,
        width: u32,
        height: u32,
        depth: u32,
        mip_levels: u32,
        format: StorageFormat,
    ) -> Self {
        Self {
            kind: TextureKind::D3,
            depth_or_layers: depth,
            ..Self::d2(usage, width, height, mip_levels, format)
        }
    }

    pub fn cube(usage: TextureUsage, size: u32, mip_levels: u32, format: StorageFormat) -> Self {
        Self {
            kind: TextureKind::Cube,
            ..Self::d2(usage, size, size, mip_levels, format)
        }
    }

    pub fn cube_array(usage: TextureUsage, size: u32, cubes: u32, mip_levels: u32, format: StorageFormat) -> Self {
        Self {
            kind: TextureKind::CubeArray,
            depth_or_layers: cubes,
            ..Self::d2(usage, size, size, mip_levels, format)
        }
    }

    pub fn with_label(mut self, label: &'static str) -> Self {
        self.label = Some(label);
        self
    }

    /// Number of array layers of the native image (6 per cube).
    pub fn array_layers(&self) -> u32 {
        match self.kind {
            TextureKind::D2 | TextureKind::D3 => 1,
            TextureKind::D2Array => self.depth_or_layers.max(1),
            TextureKind::Cube => 6,
            TextureKind::CubeArray => 6 * self.depth_or_layers.max(1),
        }
    }

    pub fn depth(&self) -> u32 {
        match self.kind {
            TextureKind::D3 => self.depth_or_layers.max(1),
            _ => 1,
        }
    }

    pub fn max_mip_levels(&self) -> u32 {
        let largest = self.width.max(self.height).max(self.depth());
        32 - largest.max(1).leading_zeros()
    }

    /// (width, height, depth) of a mip level.
    pub fn mip_extent(&self, level: u32) -> (u32, u32, u32) {
        (
            (self.width >> level).max(1),
            (self.height >> level).max(1),
            (self.depth() >> level).max(1),
        )
    }

    /// Byte size of one full layer (or 3D slice stack) of a mip level.
    pub fn mip_byte_size(&self, level: u32) -> Result<u64> {
        let (w, h, d) = self.mip_extent(level);
        Ok(u64::from(w) * u64::from(h) * u64::from(d) * u64::from(self.format.texel_size()?))
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.depth_or_layers == 0 {
            return Err(RhiError::unsupported(format!(
                "texture {:?} has a zero extent ({}x{}x{})",
                self.label, self.width, self.height, self.depth_or_layers
            )));
        }
        if self.usage.is_empty() {
            return Err(RhiError::unsupported("texture usage must not be empty"));
        }
        if self.mip_levels == 0 || self.mip_levels > self.max_mip_levels() {
            return Err(RhiError::unsupported(format!(
                "mip level count {} out of range 1..={}",
                self.mip_levels,
                self.max_mip_levels()
            )));
        }
        if matches!(self.kind, TextureKind::Cube | TextureKind::CubeArray) && self.width != self.height {
            return Err(RhiError::unsupported("cube textures must be square"));
        }
        if self.format.is_depth() && self.kind == TextureKind::D3 {
            return Err(RhiError::unsupported("3D textures cannot use a depth format"));
        }
        if self.format.is_compressed() && self.usage.is_attachment() {
            return Err(RhiError::unsupported(format!(
                "compressed format {:?} cannot be an attachment",
                self.format
            )));
        }
        if self.usage.is_depth_stencil() && !self.format.is_depth() {
            return Err(RhiError::unsupported(format!(
                "depth/stencil usage needs a depth format, got {:?}",
                self.format
            )));
        }
        if self.usage.contains(TextureUsage::COLOR_ATTACHMENT) && self.format.is_depth() {
            return Err(RhiError::unsupported(format!(
                "color attachment usage cannot use depth format {:?}",
                self.format
            )));
        }
        if self.usage.contains(TextureUsage::STENCIL_ATTACHMENT) && !self.format.has_stencil() {
            return Err(RhiError::unsupported(format!("{:?} has no stencil bits", self.format)));
        }
        Ok(())
    }
}

/// A box inside one mip level. For arrays and cubes `z` is the first layer and `depth` the layer count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureRegion {
    pub mip_level: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// End of `offset..offset + len` when that range lies inside a buffer of `size` bytes.
pub(crate) fn buffer_range_end(what: &str, offset: u64, len: u64, size: u64) -> Result<u64> {
    offset
        .checked_add(len)
        .filter(|&end| end <= size)
        .ok_or_else(|| RhiError::contract(format!("{what} of {len} bytes at {offset} overflows buffer of {size} bytes")))
}

impl TextureRegion {
    /// The whole of a mip level including every layer.
    pub fn full(desc: &TextureDesc, mip_level: u32) -> Self {
        let (width, height, depth) = desc.mip_extent(mip_level);
        let depth = if desc.kind == TextureKind::D3 { depth } else { desc.array_layers() };
        Self { mip_level, x: 0, y: 0, z: 0, width, height, depth }
    }

    pub fn texel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(self.depth)
    }

    pub fn check_within(&self, desc: &TextureDesc) -> Result<()> {
        if self.mip_level >= desc.mip_levels {
            return Err(RhiError::contract(format!(
                "mip level {} out of range ({} levels)",
                self.mip_level, desc.mip_levels
            )));
        }
        let (w, h, d) = desc.mip_extent(self.mip_level);
        let d = if desc.kind == TextureKind::D3 { d } else { desc.array_layers() };
        if self.x + self.width > w || self.y + self.height > h || self.z + self.depth > d {
            return Err(RhiError::contract(format!(
                "region {self:?} exceeds mip extent {w}x{h}x{d}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureFilter {
    Nearest,
    #[default]
    Linear,
    Trilinear,
    Anisotropic4x,
    Anisotropic8x,
    Anisotropic16x,
}

impl TextureFilter {
    pub fn anisotropy(self) -> u16 {
        match self {
            TextureFilter::Anisotropic4x => 4,
            TextureFilter::Anisotropic8x => 8,
            TextureFilter::Anisotropic16x => 16,
            _ => 1,
        }
    }

    /// Whether minification blends between mip levels.
    pub fn linear_mips(self) -> bool {
        !matches!(self, TextureFilter::Nearest | TextureFilter::Linear)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WrapMode {
    #[default]
    Repeat,
    Clamp,
    Mirror,
}

/// Sampler state. Replaced wholesale on reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SamplerDesc {
    pub filter: TextureFilter,
    pub wrap: WrapMode,
    /// `CompareFunc::Disabled` for an ordinary sampler, anything else makes a depth-compare sampler.
    pub compare: CompareFunc,
}

impl SamplerDesc {
    pub fn is_comparison(&self) -> bool {
        self.compare != CompareFunc::Disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_layers_and_mips() {
        let desc = TextureDesc::cube(TextureUsage::SAMPLED, 64, 7, StorageFormat::RgbaF16);
        assert_eq!(desc.array_layers(), 6);
        assert_eq!(desc.max_mip_levels(), 7);
        desc.validate().unwrap();

        let arr = TextureDesc::cube_array(TextureUsage::SAMPLED, 16, 3, 1, StorageFormat::Rgba8);
        assert_eq!(arr.array_layers(), 18);
    }

    #[test]
    fn mip_extent_clamps_to_one() {
        let desc = TextureDesc::d2(TextureUsage::SAMPLED, 256, 4, 9, StorageFormat::Rgba8);
        assert_eq!(desc.mip_extent(3), (32, 1, 1));
        assert_eq!(desc.mip_byte_size(0).unwrap(), 256 * 4 * 4);
    }

    #[test]
    fn invalid_descriptions_fail_at_creation() {
        let too_many_mips = TextureDesc::d2(TextureUsage::SAMPLED, 4, 4, 4, StorageFormat::Rgba8);
        assert!(too_many_mips.validate().is_err());
        let depth_as_color = TextureDesc::d2(TextureUsage::COLOR_ATTACHMENT, 4, 4, 1, StorageFormat::Depth32);
        assert!(depth_as_color.validate().is_err());
        let stencil_without_bits =
            TextureDesc::d2(TextureUsage::DEPTH_STENCIL_ATTACHMENT, 4, 4, 1, StorageFormat::Depth32);
        assert!(stencil_without_bits.validate().is_err());
        let compressed_target = TextureDesc::d2(TextureUsage::COLOR_ATTACHMENT, 4, 4, 1, StorageFormat::Bc1);
        assert!(compressed_target.validate().is_err());
    }

    #[test]
    fn region_bounds() {
        let desc = TextureDesc::d2_array(TextureUsage::SAMPLED, 8, 8, 4, 2, StorageFormat::Rgba8);
        let full = TextureRegion::full(&desc, 1);
        assert_eq!((full.width, full.height, full.depth), (4, 4, 4));
        full.check_within(&desc).unwrap();
        let past_end = TextureRegion { x: 2, ..full };
        assert!(past_end.check_within(&desc).is_err());
    }
}
