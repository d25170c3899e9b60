//! Storage formats, CPU data types, and usage masks.

use crate::error::{Result, RhiError};

/// Texel storage format of a texture or attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageFormat {
    R8,
    RI8,
    R16,
    RI16,
    Int32Raw,
    RF16,
    RF32,
    Rg8,
    Rg16,
    RgI8,
    RgI16,
    RgI32Raw,
    RgF16,
    RgF32,
    Rgba8,
    RgbaI8,
    Rgba16,
    RgbaI16,
    RgbaI32Raw,
    RgbaF16,
    RgbaF32,
    RgbaCompressed,
    R11fG11fB10f,
    Rgb10A2,
    Bc1,
    Bc3,
    Bc5,
    Depth24,
    Depth32,
    Depth24Stencil8,
}

impl StorageFormat {
    /// Bytes per texel. Block-compressed formats have no per-texel size.
    pub fn texel_size(self) -> Result<u32> {
        use StorageFormat::*;
        Ok(match self {
            R8 | RI8 => 1,
            Rg8 | RgI8 | R16 | RI16 | RF16 => 2,
            Rgba8 | RgbaI8 | Rg16 | RgF16 | RgI16 | Int32Raw | RF32 | R11fG11fB10f | Rgb10A2
            | Depth24 | Depth32 | Depth24Stencil8 => 4,
            RgbaI16 | RgbaF16 | Rgba16 | RgI32Raw | RgF32 => 8,
            RgbaI32Raw | RgbaF32 => 16,
            Bc1 | Bc3 | Bc5 | RgbaCompressed => {
                return Err(RhiError::unsupported(format!("storage format {self:?} has no texel size")))
            }
        })
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self,
            StorageFormat::Depth24 | StorageFormat::Depth32 | StorageFormat::Depth24Stencil8
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, StorageFormat::Depth24Stencil8)
    }

    pub fn is_compressed(self) -> bool {
        matches!(
            self,
            StorageFormat::Bc1 | StorageFormat::Bc3 | StorageFormat::Bc5 | StorageFormat::RgbaCompressed
        )
    }

    /// Integer formats cannot be filtered or blended.
    pub fn is_integer(self) -> bool {
        use StorageFormat::*;
        matches!(
            self,
            RI8 | RI16 | Int32Raw | RgI8 | RgI16 | RgI32Raw | RgbaI8 | RgbaI16 | RgbaI32Raw
        )
    }

    pub fn channel_count(self) -> u32 {
        use StorageFormat::*;
        match self {
            R8 | RI8 | R16 | RI16 | Int32Raw | RF16 | RF32 | Depth24 | Depth32 => 1,
            Rg8 | Rg16 | RgI8 | RgI16 | RgI32Raw | RgF16 | RgF32 | Bc5 | Depth24Stencil8 => 2,
            R11fG11fB10f => 3,
            _ => 4,
        }
    }
}

/// Element type of CPU-side vertex or texel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Byte,
    Byte2,
    Byte3,
    Byte4,
    Char,
    Char2,
    Char3,
    Char4,
    Short,
    Short2,
    Short3,
    Short4,
    UShort,
    UShort2,
    UShort3,
    UShort4,
    Half,
    Half2,
    Half3,
    Half4,
    Int,
    Int2,
    Int3,
    Int4,
    UInt,
    Float,
    Float2,
    Float3,
    Float4,
    UInt4_10_10_10_2,
}

impl DataType {
    /// Size in bytes of one element.
    pub fn size(self) -> u32 {
        use DataType::*;
        match self {
            Byte | Char => 1,
            Byte2 | Char2 | Short | UShort | Half => 2,
            Byte3 | Char3 => 3,
            Byte4 | Char4 | Short2 | UShort2 | Half2 | Int | UInt | Float | UInt4_10_10_10_2 => 4,
            Short3 | UShort3 | Half3 => 6,
            Short4 | UShort4 | Half4 | Int2 | Float2 => 8,
            Int3 | Float3 => 12,
            Int4 | Float4 => 16,
        }
    }

    /// Number of components.
    pub fn element_count(self) -> u32 {
        use DataType::*;
        match self {
            Byte | Char | Short | UShort | Half | Int | UInt | Float => 1,
            Byte2 | Char2 | Short2 | UShort2 | Half2 | Int2 | Float2 => 2,
            Byte3 | Char3 | Short3 | UShort3 | Half3 | Int3 | Float3 => 3,
            Byte4 | Char4 | Short4 | UShort4 | Half4 | Int4 | UInt4_10_10_10_2 | Float4 => 4,
        }
    }

    /// Check that data of this type can be copied verbatim into `format`.
    pub fn check_upload(self, format: StorageFormat) -> Result<()> {
        let texel = format.texel_size()?;
        if format.is_depth() {
            return Err(RhiError::unsupported(format!(
                "cannot upload {self:?} data into depth format {format:?}"
            )));
        }
        if self.size() != texel {
            return Err(RhiError::unsupported(format!(
                "{self:?} ({} bytes) does not match {format:?} texels ({texel} bytes)",
                self.size()
            )));
        }
        Ok(())
    }
}

bitflags::bitflags! {
    /// What a texture may be used for. Combinations follow the engine's named usages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 0x1;
        const COLOR_ATTACHMENT = 0x2;
        const DEPTH_ATTACHMENT = 0x4;
        const STENCIL_ATTACHMENT = 0x8;
        const SAMPLED_COLOR_ATTACHMENT = Self::SAMPLED.bits() | Self::COLOR_ATTACHMENT.bits();
        const SAMPLED_DEPTH_ATTACHMENT = Self::SAMPLED.bits() | Self::DEPTH_ATTACHMENT.bits();
        const SAMPLED_STENCIL_ATTACHMENT = Self::SAMPLED.bits() | Self::STENCIL_ATTACHMENT.bits();
        const DEPTH_STENCIL_ATTACHMENT = Self::DEPTH_ATTACHMENT.bits() | Self::STENCIL_ATTACHMENT.bits();
        const SAMPLED_DEPTH_STENCIL_ATTACHMENT =
            Self::SAMPLED.bits() | Self::DEPTH_ATTACHMENT.bits() | Self::STENCIL_ATTACHMENT.bits();
    }
}

impl TextureUsage {
    pub fn is_attachment(self) -> bool {
        self.intersects(Self::COLOR_ATTACHMENT | Self::DEPTH_STENCIL_ATTACHMENT)
    }

    pub fn is_depth_stencil(self) -> bool {
        self.intersects(Self::DEPTH_STENCIL_ATTACHMENT)
    }
}

bitflags::bitflags! {
    /// Buffer usage flags; combine for buffers used in several ways.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexFormat {
    Uint16,
    #[default]
    Uint32,
}

impl IndexFormat {
    pub fn size(self) -> u64 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texel_sizes_match_engine_table() {
        assert_eq!(StorageFormat::R8.texel_size().unwrap(), 1);
        assert_eq!(StorageFormat::RF16.texel_size().unwrap(), 2);
        assert_eq!(StorageFormat::Rgba8.texel_size().unwrap(), 4);
        assert_eq!(StorageFormat::Depth24Stencil8.texel_size().unwrap(), 4);
        assert_eq!(StorageFormat::RgbaF16.texel_size().unwrap(), 8);
        assert_eq!(StorageFormat::RgbaF32.texel_size().unwrap(), 16);
        assert!(matches!(StorageFormat::Bc1.texel_size(), Err(RhiError::Unsupported(_))));
    }

    #[test]
    fn depth_formats() {
        assert!(StorageFormat::Depth32.is_depth());
        assert!(StorageFormat::Depth24Stencil8.has_stencil());
        assert!(!StorageFormat::Depth32.has_stencil());
        assert!(!StorageFormat::Rgba8.is_depth());
    }

    #[test]
    fn data_type_sizes() {
        assert_eq!(DataType::Byte3.size(), 3);
        assert_eq!(DataType::Half3.size(), 6);
        assert_eq!(DataType::Float4.size(), 16);
        assert_eq!(DataType::UInt4_10_10_10_2.element_count(), 4);
        assert_eq!(DataType::Float2.element_count(), 2);
    }

    #[test]
    fn upload_type_must_match_texel() {
        assert!(DataType::Byte4.check_upload(StorageFormat::Rgba8).is_ok());
        assert!(DataType::Float4.check_upload(StorageFormat::RgbaF32).is_ok());
        assert!(DataType::Float4.check_upload(StorageFormat::Rgba8).is_err());
        assert!(DataType::Float.check_upload(StorageFormat::Depth32).is_err());
    }

    #[test]
    fn named_usage_combinations() {
        assert_eq!(TextureUsage::SAMPLED_COLOR_ATTACHMENT.bits(), 0x3);
        assert_eq!(TextureUsage::SAMPLED_DEPTH_STENCIL_ATTACHMENT.bits(), 0xD);
        assert!(TextureUsage::DEPTH_ATTACHMENT.is_depth_stencil());
        assert!(!TextureUsage::SAMPLED.is_attachment());
    }
}
