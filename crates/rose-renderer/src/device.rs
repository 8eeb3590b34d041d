//! GPU Device Seam
//!
//! The residency subsystem talks to the GPU only through [`GpuDevice`]:
//! heap creation, reserved (tiled) resources, the tiling query, tile-mapping
//! updates, and the handful of buffer and fence primitives the feedback
//! readback needs. Implementations are injected as `Arc<D>`; methods take
//! `&self` because the underlying device is free-threaded.

use glam::UVec3;

use crate::tiling::{ResourceTiling, TextureDesc};
use crate::RendererResult;

macro_rules! gpu_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw backend identifier
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Raw backend identifier
            pub const fn raw(&self) -> u64 {
                self.0
            }
        }
    };
}

gpu_handle!(
    /// Opaque handle to a GPU memory heap
    HeapHandle
);
gpu_handle!(
    /// Opaque handle to a texture resource
    ResourceHandle
);
gpu_handle!(
    /// Opaque handle to a buffer
    BufferHandle
);

bitflags::bitflags! {
    /// Per-range flags of a tile-mapping update
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TileRangeFlags: u32 {
        /// Unbind the range from physical memory
        const NULL = 1 << 0;
        /// Leave the range's existing mapping untouched
        const SKIP = 1 << 1;
    }
}

/// Logical tile coordinate inside a tiled resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TiledResourceCoordinate {
    /// Tile position within the subresource
    pub tile: UVec3,
    /// Subresource (mip) index; the packed tail uses `num_standard_mips`
    pub subresource: u32,
}

impl TiledResourceCoordinate {
    /// Coordinate of a tile in a 2D mip
    pub fn new(x: u32, y: u32, subresource: u32) -> Self {
        Self {
            tile: UVec3::new(x, y, 0),
            subresource,
        }
    }
}

/// Extent of a region of tiles starting at a coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileRegionSize {
    /// Total tiles in the region
    pub num_tiles: u32,
    /// Whether `extent` describes a box instead of a linear run
    pub use_box: bool,
    /// Box dimensions in tiles
    pub extent: UVec3,
}

impl TileRegionSize {
    /// A region of exactly one tile
    pub const SINGLE: Self = Self {
        num_tiles: 1,
        use_box: false,
        extent: UVec3::ONE,
    };
}

/// One batch of tile-mapping updates against a single heap
///
/// The arrays are parallel: entry `i` of every array describes the same
/// region. Each region is paired with exactly one range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileMappingBatch {
    pub coordinates: Vec<TiledResourceCoordinate>,
    pub region_sizes: Vec<TileRegionSize>,
    pub range_flags: Vec<TileRangeFlags>,
    pub heap_range_start_offsets: Vec<u32>,
    pub range_tile_counts: Vec<u32>,
}

/// Single entry of a [`TileMappingBatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileMappingEntry {
    pub coordinate: TiledResourceCoordinate,
    pub region: TileRegionSize,
    pub flags: TileRangeFlags,
    pub heap_offset: u32,
    pub tile_count: u32,
}

impl TileMappingBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue binding one logical tile to a heap tile
    pub fn push_map(&mut self, coordinate: TiledResourceCoordinate, heap_offset: u32) {
        self.push(coordinate, TileRangeFlags::empty(), heap_offset);
    }

    /// Queue unbinding one logical tile
    pub fn push_null(&mut self, coordinate: TiledResourceCoordinate) {
        self.push(coordinate, TileRangeFlags::NULL, 0);
    }

    fn push(&mut self, coordinate: TiledResourceCoordinate, flags: TileRangeFlags, heap_offset: u32) {
        self.coordinates.push(coordinate);
        self.region_sizes.push(TileRegionSize::SINGLE);
        self.range_flags.push(flags);
        self.heap_range_start_offsets.push(heap_offset);
        self.range_tile_counts.push(1);
    }

    /// Number of regions in the batch
    pub fn len(&self) -> usize {
        self.coordinates.len()
    }

    /// Whether the batch holds no regions
    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }

    /// Number of null-map regions
    pub fn null_count(&self) -> usize {
        self.range_flags
            .iter()
            .filter(|flags| flags.contains(TileRangeFlags::NULL))
            .count()
    }

    /// Iterate the batch entry by entry
    pub fn entries(&self) -> impl Iterator<Item = TileMappingEntry> + '_ {
        (0..self.len()).map(|i| TileMappingEntry {
            coordinate: self.coordinates[i],
            region: self.region_sizes[i],
            flags: self.range_flags[i],
            heap_offset: self.heap_range_start_offsets[i],
            tile_count: self.range_tile_counts[i],
        })
    }

    /// Drop every queued region
    pub fn clear(&mut self) {
        self.coordinates.clear();
        self.region_sizes.clear();
        self.range_flags.clear();
        self.heap_range_start_offsets.clear();
        self.range_tile_counts.clear();
    }
}

/// Buffer usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// GPU read/write storage
    Storage,
    /// CPU-readable copy destination
    Readback,
}

/// GPU device primitives used by the residency subsystem
pub trait GpuDevice: Send + Sync {
    /// Create a heap of the given size. Failure is unrecoverable for the caller.
    fn create_heap(&self, size_in_bytes: u64) -> RendererResult<HeapHandle>;

    /// Destroy a heap
    fn destroy_heap(&self, heap: HeapHandle);

    /// Create a reserved (tiled) texture with no memory bound
    fn create_reserved_texture(&self, desc: &TextureDesc) -> RendererResult<ResourceHandle>;

    /// Create a texture with committed memory
    fn create_committed_texture(&self, desc: &TextureDesc) -> RendererResult<ResourceHandle>;

    /// Destroy a texture resource
    fn destroy_resource(&self, resource: ResourceHandle);

    /// Query the tiling of a reserved resource
    fn resource_tiling(&self, resource: ResourceHandle) -> RendererResult<ResourceTiling>;

    /// Bind or unbind tiles of `resource` against `heap`
    fn update_tile_mappings(&self, resource: ResourceHandle, heap: HeapHandle, batch: &TileMappingBatch);

    /// Create a buffer
    fn create_buffer(&self, size_in_bytes: u64, usage: BufferUsage) -> RendererResult<BufferHandle>;

    /// Destroy a buffer
    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Record a fill of the whole buffer with a repeated `u32`
    fn fill_buffer_u32(&self, buffer: BufferHandle, value: u32);

    /// Record a full copy from `src` into `dst`
    fn copy_buffer(&self, src: BufferHandle, dst: BufferHandle);

    /// Read a readback buffer. Contents are only meaningful once the fence
    /// signalled after the copy has completed.
    fn read_buffer(&self, buffer: BufferHandle) -> RendererResult<Vec<u8>>;

    /// Signal the queue fence and return the signalled value
    fn signal(&self) -> u64;

    /// Highest fence value the GPU has completed
    fn completed_fence_value(&self) -> u64;

    /// Block until the fence reaches `value`
    fn wait_for_fence(&self, value: u64);
}
