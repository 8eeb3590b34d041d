//! Tiled Resource Layout
//!
//! Describes how a mip-mapped 2D texture is split into 64 KiB tiles: the
//! tile shape for a texel size, the tile grid of every standard mip, and the
//! packed-mip tail that holds the mips too small to tile individually.

use glam::UVec2;
use serde::{Deserialize, Serialize};

use crate::{RendererError, RendererResult};

/// Size of one tile of a tiled resource, in bytes
pub const TILE_SIZE_IN_BYTES: u64 = 64 * 1024;

/// Texel formats supported by virtual textures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TextureFormat {
    R8,
    Rg8,
    #[default]
    Rgba8,
    R32Uint,
    Rgba16F,
    Rgba32F,
}

impl TextureFormat {
    /// Bytes per texel
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Self::R8 => 1,
            Self::Rg8 => 2,
            Self::Rgba8 | Self::R32Uint => 4,
            Self::Rgba16F => 8,
            Self::Rgba32F => 16,
        }
    }

    /// Texel dimensions of one 64 KiB tile in this format
    pub fn tile_shape(self) -> UVec2 {
        match self.bytes_per_texel() {
            1 => UVec2::new(256, 256),
            2 => UVec2::new(256, 128),
            4 => UVec2::new(128, 128),
            8 => UVec2::new(128, 64),
            _ => UVec2::new(64, 64),
        }
    }
}

/// 2D texture description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureDesc {
    /// Width of mip 0 in texels
    pub width: u32,
    /// Height of mip 0 in texels
    pub height: u32,
    /// Number of mip levels
    pub mip_levels: u32,
    /// Texel format
    #[serde(default)]
    pub format: TextureFormat,
}

impl TextureDesc {
    /// Create a description with a full mip chain
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            mip_levels: full_mip_chain(width, height),
            format,
        }
    }

    /// Override the mip level count
    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Extent of a mip level in texels
    pub fn mip_extent(&self, mip: u32) -> UVec2 {
        UVec2::new(
            (self.width >> mip.min(31)).max(1),
            (self.height >> mip.min(31)).max(1),
        )
    }

    /// Reject zero-sized textures and mip counts longer than the full chain
    pub fn validate(&self) -> RendererResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(RendererError::InvalidTexture(format!(
                "zero-sized texture {}x{}",
                self.width, self.height
            )));
        }
        let max_mips = full_mip_chain(self.width, self.height);
        if self.mip_levels == 0 || self.mip_levels > max_mips {
            return Err(RendererError::InvalidTexture(format!(
                "{} mip levels requested, {}x{} supports 1..={}",
                self.mip_levels, self.width, self.height, max_mips
            )));
        }
        Ok(())
    }
}

/// Number of mips in a full chain down to 1x1
pub fn full_mip_chain(width: u32, height: u32) -> u32 {
    let largest = width.max(height).max(1);
    u32::BITS - largest.leading_zeros()
}

/// Tile grid of one standard mip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubresourceTiling {
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    pub depth_in_tiles: u32,
}

impl SubresourceTiling {
    /// Number of tiles in this mip
    pub fn tile_count(&self) -> u32 {
        self.width_in_tiles * self.height_in_tiles * self.depth_in_tiles
    }
}

/// Packed-mip tail layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackedMipInfo {
    /// Mips with their own tile grids
    pub num_standard_mips: u32,
    /// Mips sharing the packed tail
    pub num_packed_mips: u32,
    /// Tiles backing the packed tail
    pub num_tiles_for_packed_mips: u32,
    /// Linear tile index where the packed tail starts
    pub start_tile_index_in_overall_resource: u32,
}

/// Result of the tiled-resource tiling query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTiling {
    /// Texel dimensions of one tile
    pub tile_shape: UVec2,
    /// Total mip levels of the resource
    pub mip_levels: u32,
    /// Packed tail description
    pub packed: PackedMipInfo,
    /// Tile grid per standard mip, finest first
    pub subresources: Vec<SubresourceTiling>,
    /// Tiles needed to back the whole resource
    pub total_tiles: u32,
}

impl ResourceTiling {
    /// Compute the tiling of a 2D texture
    ///
    /// A mip is packed, together with every coarser mip, as soon as either of
    /// its dimensions is smaller than the tile shape. The packed tail always
    /// fits in a single tile.
    pub fn for_texture(desc: &TextureDesc) -> RendererResult<Self> {
        desc.validate()?;

        let tile_shape = desc.format.tile_shape();
        let mut subresources = Vec::new();

        for mip in 0..desc.mip_levels {
            let extent = desc.mip_extent(mip);
            if extent.x < tile_shape.x || extent.y < tile_shape.y {
                break;
            }
            subresources.push(SubresourceTiling {
                width_in_tiles: extent.x.div_ceil(tile_shape.x),
                height_in_tiles: extent.y.div_ceil(tile_shape.y),
                depth_in_tiles: 1,
            });
        }

        let num_standard_mips = subresources.len() as u32;
        let num_packed_mips = desc.mip_levels - num_standard_mips;
        let standard_tiles: u32 = subresources.iter().map(SubresourceTiling::tile_count).sum();
        let num_tiles_for_packed_mips = u32::from(num_packed_mips > 0);

        Ok(Self {
            tile_shape,
            mip_levels: desc.mip_levels,
            packed: PackedMipInfo {
                num_standard_mips,
                num_packed_mips,
                num_tiles_for_packed_mips,
                start_tile_index_in_overall_resource: standard_tiles,
            },
            subresources,
            total_tiles: standard_tiles + num_tiles_for_packed_mips,
        })
    }

    /// Number of mips with their own tile grid
    pub fn num_standard_mips(&self) -> u32 {
        self.packed.num_standard_mips
    }

    /// Whether the resource has a packed tail
    pub fn has_packed_mips(&self) -> bool {
        self.packed.num_packed_mips > 0
    }

    /// Tile grid of a standard mip
    pub fn subresource(&self, mip: u32) -> Option<&SubresourceTiling> {
        self.subresources.get(mip as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_mip_chain() {
        assert_eq!(full_mip_chain(1, 1), 1);
        assert_eq!(full_mip_chain(256, 256), 9);
        assert_eq!(full_mip_chain(1024, 16), 11);
        assert_eq!(full_mip_chain(1000, 1000), 10);
    }

    #[test]
    fn test_tile_shapes_are_64k() {
        for format in [
            TextureFormat::R8,
            TextureFormat::Rg8,
            TextureFormat::Rgba8,
            TextureFormat::Rgba16F,
            TextureFormat::Rgba32F,
        ] {
            let shape = format.tile_shape();
            let bytes = shape.x as u64 * shape.y as u64 * format.bytes_per_texel() as u64;
            assert_eq!(bytes, TILE_SIZE_IN_BYTES, "{format:?}");
        }
    }

    #[test]
    fn test_tiling_with_packed_tail() {
        let desc = TextureDesc::new(1024, 1024, TextureFormat::Rgba8);
        let tiling = ResourceTiling::for_texture(&desc).unwrap();

        // 1024, 512, 256, 128 tile; 64 and below are packed
        assert_eq!(tiling.num_standard_mips(), 4);
        assert!(tiling.has_packed_mips());
        assert_eq!(tiling.packed.num_packed_mips, 7);
        assert_eq!(tiling.subresource(0).unwrap().tile_count(), 64);
        assert_eq!(tiling.subresource(3).unwrap().tile_count(), 1);
        assert_eq!(tiling.total_tiles, 64 + 16 + 4 + 1 + 1);
        assert_eq!(tiling.packed.start_tile_index_in_overall_resource, 85);
    }

    #[test]
    fn test_tiling_without_packed_tail() {
        let desc = TextureDesc::new(256, 256, TextureFormat::Rgba8).with_mip_levels(2);
        let tiling = ResourceTiling::for_texture(&desc).unwrap();

        assert_eq!(tiling.num_standard_mips(), 2);
        assert!(!tiling.has_packed_mips());
        assert_eq!(tiling.subresource(0).unwrap().width_in_tiles, 2);
        assert_eq!(tiling.subresource(0).unwrap().height_in_tiles, 2);
        assert_eq!(tiling.subresource(1).unwrap().tile_count(), 1);
        assert_eq!(tiling.total_tiles, 5);
    }

    #[test]
    fn test_small_texture_is_entirely_packed() {
        let desc = TextureDesc::new(64, 64, TextureFormat::Rgba8);
        let tiling = ResourceTiling::for_texture(&desc).unwrap();

        assert_eq!(tiling.num_standard_mips(), 0);
        assert_eq!(tiling.packed.num_tiles_for_packed_mips, 1);
        assert_eq!(tiling.total_tiles, 1);
    }

    #[test]
    fn test_non_power_of_two_rounds_up() {
        let desc = TextureDesc::new(300, 130, TextureFormat::Rgba8).with_mip_levels(1);
        let tiling = ResourceTiling::for_texture(&desc).unwrap();

        assert_eq!(tiling.subresource(0).unwrap().width_in_tiles, 3);
        assert_eq!(tiling.subresource(0).unwrap().height_in_tiles, 2);
    }

    #[test]
    fn test_invalid_descriptions() {
        assert!(TextureDesc::new(0, 16, TextureFormat::R8).validate().is_err());
        assert!(TextureDesc::new(16, 16, TextureFormat::R8)
            .with_mip_levels(6)
            .validate()
            .is_err());
        assert!(TextureDesc::new(16, 16, TextureFormat::R8)
            .with_mip_levels(0)
            .validate()
            .is_err());
    }
}
