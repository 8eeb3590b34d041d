//! Virtual Texture Records
//!
//! Ground truth for which physical tile backs which logical `(mip, x, y)`
//! tile of a virtual texture. Records are created and mutated only by the
//! tile pool.

use crate::device::{ResourceHandle, TiledResourceCoordinate};
use crate::tiling::{ResourceTiling, SubresourceTiling};

/// Physical tile slot: heap index within the pool plus tile index within the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileAddress {
    pub heap_index: u32,
    pub tile_index: u32,
}

impl TileAddress {
    /// Address not yet assigned
    pub const INVALID: Self = Self {
        heap_index: u32::MAX,
        tile_index: u32::MAX,
    };

    pub fn new(heap_index: u32, tile_index: u32) -> Self {
        Self {
            heap_index,
            tile_index,
        }
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl Default for TileAddress {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Mapping state of one logical tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileMapping {
    pub mapped: bool,
    pub address: TileAddress,
}

impl TileMapping {
    pub(crate) fn map(&mut self, address: TileAddress) {
        self.mapped = true;
        self.address = address;
    }

    /// Clear the entry and hand back the address it held
    pub(crate) fn unmap(&mut self) -> Option<TileAddress> {
        if !self.mapped {
            return None;
        }
        let address = self.address;
        *self = Self::default();
        Some(address)
    }
}

/// Tile grid of one standard mip
#[derive(Debug, Clone)]
pub struct MipAllocation {
    width_in_tiles: u32,
    height_in_tiles: u32,
    /// Row-major tile entries
    tiles: Vec<TileMapping>,
}

impl MipAllocation {
    fn new(tiling: &SubresourceTiling) -> Self {
        let count = (tiling.width_in_tiles * tiling.height_in_tiles) as usize;
        Self {
            width_in_tiles: tiling.width_in_tiles,
            height_in_tiles: tiling.height_in_tiles,
            tiles: vec![TileMapping::default(); count],
        }
    }

    pub fn width_in_tiles(&self) -> u32 {
        self.width_in_tiles
    }

    pub fn height_in_tiles(&self) -> u32 {
        self.height_in_tiles
    }

    /// Entry at tile `(x, y)`
    pub fn get(&self, x: u32, y: u32) -> Option<&TileMapping> {
        if x >= self.width_in_tiles || y >= self.height_in_tiles {
            return None;
        }
        self.tiles.get((y * self.width_in_tiles + x) as usize)
    }

    /// Number of mapped tiles in this mip
    pub fn mapped_count(&self) -> usize {
        self.tiles.iter().filter(|tile| tile.mapped).count()
    }

    /// Iterate entries with their tile position
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, &TileMapping)> + '_ {
        let width = self.width_in_tiles;
        self.tiles
            .iter()
            .enumerate()
            .map(move |(i, tile)| (i as u32 % width, i as u32 / width, tile))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (u32, u32, &mut TileMapping)> + '_ {
        let width = self.width_in_tiles;
        self.tiles
            .iter_mut()
            .enumerate()
            .map(move |(i, tile)| (i as u32 % width, i as u32 / width, tile))
    }
}

/// Residency bookkeeping of one virtual texture
#[derive(Debug, Clone)]
pub struct VirtualTextureRecord {
    resource: ResourceHandle,
    mip_levels: u32,
    /// One grid per standard mip, finest first
    mips: Vec<MipAllocation>,
    /// Shared entry for the packed tail
    packed: TileMapping,
    has_packed_mips: bool,
}

impl VirtualTextureRecord {
    /// Build an all-unmapped record from the resource's tiling
    pub fn new(resource: ResourceHandle, tiling: &ResourceTiling) -> Self {
        if tiling.packed.num_tiles_for_packed_mips > 1 {
            log::warn!(
                "Packed tail of {} tiles; only its first tile is mapped",
                tiling.packed.num_tiles_for_packed_mips
            );
        }

        Self {
            resource,
            mip_levels: tiling.mip_levels,
            mips: tiling.subresources.iter().map(MipAllocation::new).collect(),
            packed: TileMapping::default(),
            has_packed_mips: tiling.packed.num_tiles_for_packed_mips > 0,
        }
    }

    pub fn resource(&self) -> ResourceHandle {
        self.resource
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn num_standard_mips(&self) -> u32 {
        self.mips.len() as u32
    }

    pub fn has_packed_mips(&self) -> bool {
        self.has_packed_mips
    }

    /// Coarsest mip with its own tile grid, if any
    pub fn boundary_mip(&self) -> Option<u32> {
        self.num_standard_mips().checked_sub(1)
    }

    /// Grid of a standard mip
    pub fn mip(&self, level: u32) -> Option<&MipAllocation> {
        self.mips.get(level as usize)
    }

    pub(crate) fn mip_mut(&mut self, level: u32) -> Option<&mut MipAllocation> {
        self.mips.get_mut(level as usize)
    }

    pub fn packed(&self) -> &TileMapping {
        &self.packed
    }

    pub(crate) fn packed_mut(&mut self) -> &mut TileMapping {
        &mut self.packed
    }

    pub fn packed_mips_mapped(&self) -> bool {
        self.packed.mapped
    }

    /// Logical coordinate of the packed tail
    pub fn packed_coordinate(&self) -> TiledResourceCoordinate {
        TiledResourceCoordinate::new(0, 0, self.num_standard_mips())
    }

    /// Mapped tiles, packed tail included
    pub fn tiles_used(&self) -> u64 {
        let standard: usize = self.mips.iter().map(MipAllocation::mapped_count).sum();
        standard as u64 + u64::from(self.packed.mapped)
    }

    /// Whether any tile is mapped
    pub fn is_resident(&self) -> bool {
        self.tiles_used() > 0
    }

    /// Addresses of every mapped tile, packed tail included
    pub fn mapped_addresses(&self) -> impl Iterator<Item = TileAddress> + '_ {
        self.mips
            .iter()
            .flat_map(|mip| mip.tiles.iter())
            .chain(std::iter::once(&self.packed))
            .filter(|tile| tile.mapped)
            .map(|tile| tile.address)
    }
}
