//! Tile Pool
//!
//! Reconciles each virtual texture's sampled mip range with its tile
//! mappings. Physical tiles come from an arena of [`TileHeap`]s that grows on
//! demand; all mapping changes for one call are grouped per heap and
//! submitted as one `update_tile_mappings` call per heap touched.
//!
//! The CPU-side bitmaps are updated when a call is made, before the GPU has
//! executed the corresponding updates. A released tile can be handed out again
//! by the next call; this is sound because every update goes to the same
//! queue in program order.

use std::ops::{AddAssign, Range};
use std::sync::Arc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use rose_core::{BudgetStatus, MemoryBudget, MemoryStats};

use crate::device::{GpuDevice, HeapHandle, TileMappingBatch, TiledResourceCoordinate};
use crate::texture::{TextureId, VirtualTexture2D};
use crate::texture_record::{TileAddress, VirtualTextureRecord};
use crate::tile_heap::{TileHeap, TileHeapStats};
use crate::tiling::TILE_SIZE_IN_BYTES;
use crate::{RendererError, RendererResult};

/// Tile pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TilePoolConfig {
    /// Capacity of every heap created by the pool
    pub tiles_per_heap: u32,
    /// Readback buffers per feedback map
    pub feedback_latency: u32,
    /// Advisory budget for heap memory
    pub budget: MemoryBudget,
}

impl Default for TilePoolConfig {
    fn default() -> Self {
        Self {
            tiles_per_heap: 1024, // 64 MB heaps
            feedback_latency: 2,
            budget: MemoryBudget::default(),
        }
    }
}

impl TilePoolConfig {
    pub fn heap_size_in_bytes(&self) -> u64 {
        self.tiles_per_heap as u64 * TILE_SIZE_IN_BYTES
    }
}

/// What one residency call changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResidencyChange {
    pub tiles_mapped: u32,
    pub tiles_unmapped: u32,
    /// `update_tile_mappings` calls submitted
    pub update_calls: u32,
    pub heaps_created: u32,
}

impl ResidencyChange {
    /// Whether the call left the GPU untouched
    pub fn is_noop(&self) -> bool {
        self.update_calls == 0
    }
}

impl AddAssign for ResidencyChange {
    fn add_assign(&mut self, other: Self) {
        self.tiles_mapped += other.tiles_mapped;
        self.tiles_unmapped += other.tiles_unmapped;
        self.update_calls += other.update_calls;
        self.heaps_created += other.heaps_created;
    }
}

/// Growable arena of tile heaps addressed by index
struct HeapArena<D: GpuDevice> {
    device: Arc<D>,
    heaps: Vec<TileHeap>,
    tiles_per_heap: u32,
    budget: MemoryBudget,
    memory: MemoryStats,
}

impl<D: GpuDevice> HeapArena<D> {
    /// Claim a free tile anywhere, creating a heap when every heap is full
    fn allocate(&mut self, change: &mut ResidencyChange) -> RendererResult<TileAddress> {
        let heap_index = match self.heaps.iter().position(|heap| heap.num_free_tiles() > 0) {
            Some(index) => index,
            None => {
                self.grow()?;
                change.heaps_created += 1;
                self.heaps.len() - 1
            }
        };

        let heap = &mut self.heaps[heap_index];
        match heap.allocate_tile() {
            Some(tile_index) => Ok(TileAddress::new(heap.page_index(), tile_index)),
            None => Err(RendererError::OutOfMemory),
        }
    }

    fn grow(&mut self) -> RendererResult<()> {
        let size_in_bytes = self.tiles_per_heap as u64 * TILE_SIZE_IN_BYTES;
        let handle = self.device.create_heap(size_in_bytes)?;
        let page_index = self.heaps.len() as u32;
        self.heaps.push(TileHeap::new(page_index, handle, self.tiles_per_heap));

        let previous = self.memory.current();
        let total = self.memory.record_alloc(size_in_bytes);
        log::info!(
            "Created tile heap {} ({} tiles, {} MB resident)",
            page_index,
            self.tiles_per_heap,
            total / rose_core::MIB
        );

        let status = self.budget.status(total);
        if status != BudgetStatus::Nominal && self.budget.status(previous) != status {
            log::warn!(
                "Tile heaps hold {} bytes of a {} byte budget ({:?})",
                total,
                self.budget.max_bytes,
                status
            );
        }
        Ok(())
    }

    /// Return a tile a record held. The heap must agree it was in use.
    fn release(&mut self, address: TileAddress) {
        let Some(heap) = self.heaps.get_mut(address.heap_index as usize) else {
            log::error!("Tile {:?} released to a heap that does not exist", address);
            debug_assert!(false, "tile address names an unknown heap");
            return;
        };
        if !heap.release_tile(address.tile_index) {
            log::error!("Tile {:?} was mapped by a record but already free in its heap", address);
            debug_assert!(false, "record and heap disagree on tile ownership");
        }
    }

    fn handle(&self, heap_index: usize) -> Option<HeapHandle> {
        self.heaps.get(heap_index).map(TileHeap::handle)
    }
}

/// Mapping updates queued during one call, grouped by heap index
#[derive(Default)]
struct PendingUpdates {
    per_heap: SmallVec<[TileMappingBatch; 2]>,
}

impl PendingUpdates {
    fn batch(&mut self, heap_index: u32) -> &mut TileMappingBatch {
        let index = heap_index as usize;
        if self.per_heap.len() <= index {
            self.per_heap.resize_with(index + 1, TileMappingBatch::new);
        }
        &mut self.per_heap[index]
    }

    fn map(&mut self, coordinate: TiledResourceCoordinate, address: TileAddress) {
        self.batch(address.heap_index).push_map(coordinate, address.tile_index);
    }

    fn null(&mut self, coordinate: TiledResourceCoordinate, address: TileAddress) {
        self.batch(address.heap_index).push_null(coordinate);
    }
}

/// Residency manager for virtual textures
pub struct TilePool<D: GpuDevice> {
    arena: HeapArena<D>,
    records: AHashMap<TextureId, VirtualTextureRecord>,
    config: TilePoolConfig,
}

impl<D: GpuDevice> TilePool<D> {
    /// Create an empty pool; heaps are created on first use
    pub fn new(device: Arc<D>, config: TilePoolConfig) -> Self {
        Self {
            arena: HeapArena {
                device,
                heaps: Vec::new(),
                tiles_per_heap: config.tiles_per_heap.max(1),
                budget: config.budget.clone(),
                memory: MemoryStats::new(),
            },
            records: AHashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &TilePoolConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<D> {
        &self.arena.device
    }

    /// Bring the texture's mappings in line with its cached mip range
    ///
    /// Maps every tile of the needed mips, unmaps tiles of mips outside it,
    /// and maps the packed tail once. Calling it again without a new range
    /// submits nothing.
    pub fn map_texture(&mut self, texture: &VirtualTexture2D<D>) -> RendererResult<ResidencyChange> {
        let _span = tracing::debug_span!("map_texture", texture = %texture.id()).entered();

        let record = self
            .records
            .entry(texture.id())
            .or_insert_with(|| VirtualTextureRecord::new(texture.resource(), texture.tiling()));

        let mut change = ResidencyChange::default();
        let mut pending = PendingUpdates::default();
        let result = Self::reconcile(
            &mut self.arena,
            record,
            texture.mips_used().finest,
            texture.mips_used().coarsest,
            &mut pending,
            &mut change,
        );

        // Whatever was decided before a failure is already in the bitmaps
        change.update_calls = Self::submit(&self.arena, record, pending);
        result?;

        tracing::trace!(
            mapped = change.tiles_mapped,
            unmapped = change.tiles_unmapped,
            calls = change.update_calls,
            "residency updated"
        );
        Ok(change)
    }

    fn reconcile(
        arena: &mut HeapArena<D>,
        record: &mut VirtualTextureRecord,
        finest: u32,
        coarsest: u32,
        pending: &mut PendingUpdates,
        change: &mut ResidencyChange,
    ) -> RendererResult<()> {
        if record.has_packed_mips() && !record.packed_mips_mapped() {
            let address = arena.allocate(change)?;
            let coordinate = record.packed_coordinate();
            record.packed_mut().map(address);
            pending.map(coordinate, address);
            change.tiles_mapped += 1;
        }

        let Some(boundary) = record.boundary_mip() else {
            return Ok(());
        };
        let finest = finest.min(boundary);
        let coarsest = coarsest.clamp(finest, boundary);

        Self::unmap_mips(arena, record, 0..finest, pending, change);

        for mip in finest..=coarsest {
            let Some(grid) = record.mip_mut(mip) else {
                continue;
            };
            for (x, y, tile) in grid.iter_mut() {
                if tile.mapped {
                    continue;
                }
                let address = arena.allocate(change)?;
                tile.map(address);
                pending.map(TiledResourceCoordinate::new(x, y, mip), address);
                change.tiles_mapped += 1;
            }
        }

        Self::unmap_mips(arena, record, coarsest + 1..boundary + 1, pending, change);
        Ok(())
    }

    fn unmap_mips(
        arena: &mut HeapArena<D>,
        record: &mut VirtualTextureRecord,
        mips: Range<u32>,
        pending: &mut PendingUpdates,
        change: &mut ResidencyChange,
    ) {
        for mip in mips {
            let Some(grid) = record.mip_mut(mip) else {
                continue;
            };
            for (x, y, tile) in grid.iter_mut() {
                if let Some(address) = tile.unmap() {
                    arena.release(address);
                    pending.null(TiledResourceCoordinate::new(x, y, mip), address);
                    change.tiles_unmapped += 1;
                }
            }
        }
    }

    /// Issue one update call per heap with queued work
    fn submit(arena: &HeapArena<D>, record: &VirtualTextureRecord, pending: PendingUpdates) -> u32 {
        let mut calls = 0;
        for (heap_index, batch) in pending.per_heap.iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            let Some(heap) = arena.handle(heap_index) else {
                log::error!("Queued {} tile updates for missing heap {}", batch.len(), heap_index);
                continue;
            };
            arena.device.update_tile_mappings(record.resource(), heap, batch);
            calls += 1;
        }
        calls
    }

    /// Unmap every tile of the texture, packed tail included
    ///
    /// The record is kept so the texture can be mapped again later; drop it
    /// with [`remove_texture`](Self::remove_texture).
    pub fn release_texture(&mut self, texture: &VirtualTexture2D<D>) -> RendererResult<ResidencyChange> {
        let Some(record) = self.records.get_mut(&texture.id()) else {
            return Ok(ResidencyChange::default());
        };

        let mut change = ResidencyChange::default();
        let mut pending = PendingUpdates::default();
        let standard_mips = record.num_standard_mips();
        Self::unmap_mips(&mut self.arena, record, 0..standard_mips, &mut pending, &mut change);

        let coordinate = record.packed_coordinate();
        if let Some(address) = record.packed_mut().unmap() {
            self.arena.release(address);
            pending.null(coordinate, address);
            change.tiles_unmapped += 1;
        }

        change.update_calls = Self::submit(&self.arena, record, pending);
        log::debug!(
            "Released {} tiles of {} in {} update calls",
            change.tiles_unmapped,
            texture.id(),
            change.update_calls
        );
        Ok(change)
    }

    /// Drop the bookkeeping of a released texture
    ///
    /// Fails without removing anything while tiles are still mapped.
    pub fn remove_texture(&mut self, texture: TextureId) -> RendererResult<()> {
        let Some(record) = self.records.get(&texture) else {
            return Ok(());
        };

        let tiles = record.tiles_used();
        if tiles > 0 {
            return Err(RendererError::TextureStillResident { texture, tiles });
        }

        self.records.remove(&texture);
        Ok(())
    }

    /// Mapped tiles of a texture, packed tail included
    pub fn tiles_used(&self, texture: TextureId) -> u64 {
        self.records.get(&texture).map_or(0, VirtualTextureRecord::tiles_used)
    }

    /// One entry per heap
    pub fn stats(&self) -> Vec<TileHeapStats> {
        self.arena.heaps.iter().map(TileHeap::stats).collect()
    }

    pub fn heaps(&self) -> &[TileHeap] {
        &self.arena.heaps
    }

    pub fn heap_count(&self) -> usize {
        self.arena.heaps.len()
    }

    /// Bytes of heap memory owned by the pool
    pub fn resident_bytes(&self) -> u64 {
        self.arena.memory.current()
    }

    pub fn record(&self, texture: TextureId) -> Option<&VirtualTextureRecord> {
        self.records.get(&texture)
    }

    pub fn records(&self) -> impl Iterator<Item = (TextureId, &VirtualTextureRecord)> + '_ {
        self.records.iter().map(|(id, record)| (*id, record))
    }
}

impl<D: GpuDevice> Drop for TilePool<D> {
    fn drop(&mut self) {
        let leaked: u64 = self.records.values().map(VirtualTextureRecord::tiles_used).sum();
        if leaked > 0 {
            log::warn!("Tile pool dropped with {} tiles still mapped", leaked);
        }

        for heap in &self.arena.heaps {
            self.arena.device.destroy_heap(heap.handle());
            self.arena.memory.record_dealloc(heap.size_in_bytes());
        }
    }
}
