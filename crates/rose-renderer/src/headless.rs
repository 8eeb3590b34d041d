//! Headless Device
//!
//! A CPU-side [`GpuDevice`] that keeps the state a real GPU would: heaps,
//! tile bindings per reserved resource, buffer contents and a queue fence.
//! It records every tile-mapping call and flags any physical tile bound to
//! two logical tiles at once, which makes it the instrumented backend for
//! tests, benchmarks and the command-line simulator.

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::device::{
    BufferHandle, BufferUsage, GpuDevice, HeapHandle, ResourceHandle, TileMappingBatch, TileRangeFlags,
    TiledResourceCoordinate,
};
use crate::tiling::{ResourceTiling, TextureDesc, TILE_SIZE_IN_BYTES};
use crate::{RendererError, RendererResult};

/// Logical tile key inside one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalTile {
    pub subresource: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl From<TiledResourceCoordinate> for LogicalTile {
    fn from(coordinate: TiledResourceCoordinate) -> Self {
        Self {
            subresource: coordinate.subresource,
            x: coordinate.tile.x,
            y: coordinate.tile.y,
            z: coordinate.tile.z,
        }
    }
}

/// Physical tile key: heap plus tile offset within it
pub type PhysicalTile = (HeapHandle, u32);

/// One recorded `update_tile_mappings` call
#[derive(Debug, Clone)]
pub struct TileMappingCall {
    pub resource: ResourceHandle,
    pub heap: HeapHandle,
    pub batch: TileMappingBatch,
}

#[derive(Debug)]
struct HeapRecord {
    size_in_bytes: u64,
}

#[derive(Debug)]
struct ResourceRecord {
    /// Present for reserved resources only
    tiling: Option<ResourceTiling>,
    bindings: AHashMap<LogicalTile, PhysicalTile>,
}

#[derive(Debug, Default)]
struct HeadlessState {
    next_id: u64,
    heaps: AHashMap<HeapHandle, HeapRecord>,
    resources: AHashMap<ResourceHandle, ResourceRecord>,
    buffers: AHashMap<BufferHandle, Vec<u8>>,
    /// Reverse map of live bindings
    owners: AHashMap<PhysicalTile, (ResourceHandle, LogicalTile)>,
    calls: Vec<TileMappingCall>,
    /// Skip recording calls (bindings are still applied)
    calls_muted: bool,
    aliasing_violations: u64,
    fence_signalled: u64,
    fence_completed: u64,
    manual_fences: bool,
    memory_limit: Option<u64>,
}

impl HeadlessState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn heap_bytes(&self) -> u64 {
        self.heaps.values().map(|heap| heap.size_in_bytes).sum()
    }

    fn unbind(&mut self, resource: ResourceHandle, tile: LogicalTile) {
        let Some(record) = self.resources.get_mut(&resource) else {
            return;
        };
        if let Some(physical) = record.bindings.remove(&tile) {
            self.owners.remove(&physical);
        }
    }

    fn bind(&mut self, resource: ResourceHandle, tile: LogicalTile, physical: PhysicalTile) {
        self.unbind(resource, tile);

        if let Some((owner, owner_tile)) = self.owners.get(&physical).copied() {
            log::error!(
                "Heap {:?} tile {} bound to {:?} {:?} while still backing {:?} {:?}",
                physical.0,
                physical.1,
                resource,
                tile,
                owner,
                owner_tile
            );
            self.aliasing_violations += 1;
            if let Some(record) = self.resources.get_mut(&owner) {
                record.bindings.remove(&owner_tile);
            }
        }

        if let Some(record) = self.resources.get_mut(&resource) {
            record.bindings.insert(tile, physical);
            self.owners.insert(physical, (resource, tile));
        }
    }
}

/// CPU simulation of a GPU device with tiled-resource support
#[derive(Debug, Default)]
pub struct HeadlessDevice {
    state: Mutex<HeadlessState>,
}

impl HeadlessDevice {
    /// Create a device whose fences complete as soon as they are signalled
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a device that refuses heaps past `bytes` of total heap memory
    pub fn with_memory_limit(bytes: u64) -> Self {
        let device = Self::default();
        device.state.lock().memory_limit = Some(bytes);
        device
    }

    /// When disabled, fences only complete through
    /// [`complete_fences_through`](Self::complete_fences_through) or a wait
    pub fn set_auto_complete(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.manual_fences = !enabled;
        if enabled {
            state.fence_completed = state.fence_signalled;
        }
    }

    /// Let the GPU catch up to `value`
    pub fn complete_fences_through(&self, value: u64) {
        let mut state = self.state.lock();
        state.fence_completed = state.fence_completed.max(value.min(state.fence_signalled));
    }

    /// Stand-in for a shader writing feedback
    pub fn write_buffer_u32(&self, buffer: BufferHandle, values: &[u32]) {
        let mut state = self.state.lock();
        let Some(contents) = state.buffers.get_mut(&buffer) else {
            log::warn!("Write to unknown buffer {:?}", buffer);
            return;
        };
        for (chunk, value) in contents.chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
    }

    /// Every tile-mapping call recorded so far
    pub fn tile_mapping_calls(&self) -> Vec<TileMappingCall> {
        self.state.lock().calls.clone()
    }

    pub fn tile_mapping_call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn clear_tile_mapping_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Stop or resume keeping a log of tile-mapping calls
    pub fn set_call_logging(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.calls_muted = !enabled;
        if !enabled {
            state.calls.clear();
        }
    }

    /// Physical tile bound to a logical tile of `resource`
    pub fn binding(&self, resource: ResourceHandle, coordinate: TiledResourceCoordinate) -> Option<PhysicalTile> {
        self.state
            .lock()
            .resources
            .get(&resource)
            .and_then(|record| record.bindings.get(&coordinate.into()).copied())
    }

    /// Logical tiles of `resource` currently backed by memory
    pub fn bound_tile_count(&self, resource: ResourceHandle) -> usize {
        self.state
            .lock()
            .resources
            .get(&resource)
            .map_or(0, |record| record.bindings.len())
    }

    /// Times a physical tile was bound while still backing another logical tile
    pub fn aliasing_violations(&self) -> u64 {
        self.state.lock().aliasing_violations
    }

    pub fn heap_count(&self) -> usize {
        self.state.lock().heaps.len()
    }

    pub fn heap_bytes(&self) -> u64 {
        self.state.lock().heap_bytes()
    }

    pub fn buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn resource_count(&self) -> usize {
        self.state.lock().resources.len()
    }
}

impl GpuDevice for HeadlessDevice {
    fn create_heap(&self, size_in_bytes: u64) -> RendererResult<HeapHandle> {
        let mut state = self.state.lock();
        if size_in_bytes == 0 || size_in_bytes % TILE_SIZE_IN_BYTES != 0 {
            return Err(RendererError::HeapCreation {
                size_in_bytes,
                reason: "size must be a non-zero multiple of the tile size".to_string(),
            });
        }
        if let Some(limit) = state.memory_limit {
            if state.heap_bytes() + size_in_bytes > limit {
                return Err(RendererError::OutOfMemory);
            }
        }

        let heap = HeapHandle::from_raw(state.next_id());
        state.heaps.insert(heap, HeapRecord { size_in_bytes });
        Ok(heap)
    }

    fn destroy_heap(&self, heap: HeapHandle) {
        let mut state = self.state.lock();
        if state.heaps.remove(&heap).is_none() {
            log::warn!("Destroying unknown heap {:?}", heap);
            return;
        }

        let orphaned: Vec<_> = state
            .owners
            .iter()
            .filter(|(physical, _)| physical.0 == heap)
            .map(|(_, owner)| *owner)
            .collect();
        for (resource, tile) in orphaned {
            state.unbind(resource, tile);
        }
    }

    fn create_reserved_texture(&self, desc: &TextureDesc) -> RendererResult<ResourceHandle> {
        let tiling = ResourceTiling::for_texture(desc)?;
        let mut state = self.state.lock();
        let resource = ResourceHandle::from_raw(state.next_id());
        state.resources.insert(
            resource,
            ResourceRecord {
                tiling: Some(tiling),
                bindings: AHashMap::new(),
            },
        );
        Ok(resource)
    }

    fn create_committed_texture(&self, desc: &TextureDesc) -> RendererResult<ResourceHandle> {
        desc.validate()?;
        let mut state = self.state.lock();
        let resource = ResourceHandle::from_raw(state.next_id());
        state.resources.insert(
            resource,
            ResourceRecord {
                tiling: None,
                bindings: AHashMap::new(),
            },
        );
        Ok(resource)
    }

    fn destroy_resource(&self, resource: ResourceHandle) {
        let mut state = self.state.lock();
        if let Some(record) = state.resources.remove(&resource) {
            for physical in record.bindings.values() {
                state.owners.remove(physical);
            }
        }
    }

    fn resource_tiling(&self, resource: ResourceHandle) -> RendererResult<ResourceTiling> {
        let state = self.state.lock();
        state
            .resources
            .get(&resource)
            .and_then(|record| record.tiling.clone())
            .ok_or_else(|| RendererError::ResourceNotFound(format!("reserved resource {:?}", resource)))
    }

    fn update_tile_mappings(&self, resource: ResourceHandle, heap: HeapHandle, batch: &TileMappingBatch) {
        let mut state = self.state.lock();
        if !state.heaps.contains_key(&heap) {
            log::error!("Tile mapping update against unknown heap {:?}", heap);
            return;
        }

        for entry in batch.entries() {
            if entry.flags.contains(TileRangeFlags::SKIP) {
                continue;
            }
            let tile = LogicalTile::from(entry.coordinate);
            if entry.flags.contains(TileRangeFlags::NULL) {
                state.unbind(resource, tile);
            } else {
                state.bind(resource, tile, (heap, entry.heap_offset));
            }
        }

        if !state.calls_muted {
            state.calls.push(TileMappingCall {
                resource,
                heap,
                batch: batch.clone(),
            });
        }
    }

    fn create_buffer(&self, size_in_bytes: u64, _usage: BufferUsage) -> RendererResult<BufferHandle> {
        let mut state = self.state.lock();
        let buffer = BufferHandle::from_raw(state.next_id());
        state.buffers.insert(buffer, vec![0; size_in_bytes as usize]);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.state.lock().buffers.remove(&buffer);
    }

    fn fill_buffer_u32(&self, buffer: BufferHandle, value: u32) {
        let mut state = self.state.lock();
        if let Some(contents) = state.buffers.get_mut(&buffer) {
            for chunk in contents.chunks_exact_mut(4) {
                chunk.copy_from_slice(&value.to_le_bytes());
            }
        }
    }

    fn copy_buffer(&self, src: BufferHandle, dst: BufferHandle) {
        let mut state = self.state.lock();
        let Some(source) = state.buffers.get(&src).cloned() else {
            log::warn!("Copy from unknown buffer {:?}", src);
            return;
        };
        if let Some(destination) = state.buffers.get_mut(&dst) {
            let len = source.len().min(destination.len());
            destination[..len].copy_from_slice(&source[..len]);
        }
    }

    fn read_buffer(&self, buffer: BufferHandle) -> RendererResult<Vec<u8>> {
        self.state
            .lock()
            .buffers
            .get(&buffer)
            .cloned()
            .ok_or_else(|| RendererError::Buffer(format!("unknown buffer {:?}", buffer)))
    }

    fn signal(&self) -> u64 {
        let mut state = self.state.lock();
        state.fence_signalled += 1;
        if !state.manual_fences {
            state.fence_completed = state.fence_signalled;
        }
        state.fence_signalled
    }

    fn completed_fence_value(&self) -> u64 {
        self.state.lock().fence_completed
    }

    fn wait_for_fence(&self, value: u64) {
        self.complete_fences_through(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiling::TextureFormat;

    #[test]
    fn test_heap_creation_rules() {
        let device = HeadlessDevice::with_memory_limit(4 * TILE_SIZE_IN_BYTES);

        assert!(matches!(
            device.create_heap(100),
            Err(RendererError::HeapCreation { .. })
        ));
        let heap = device.create_heap(4 * TILE_SIZE_IN_BYTES).unwrap();
        assert!(matches!(
            device.create_heap(TILE_SIZE_IN_BYTES),
            Err(RendererError::OutOfMemory)
        ));

        device.destroy_heap(heap);
        assert_eq!(device.heap_count(), 0);
    }

    #[test]
    fn test_bind_and_null_map() {
        let device = HeadlessDevice::new();
        let heap = device.create_heap(4 * TILE_SIZE_IN_BYTES).unwrap();
        let desc = TextureDesc::new(256, 256, TextureFormat::Rgba8);
        let resource = device.create_reserved_texture(&desc).unwrap();
        let coordinate = TiledResourceCoordinate::new(1, 0, 0);

        let mut batch = TileMappingBatch::new();
        batch.push_map(coordinate, 2);
        device.update_tile_mappings(resource, heap, &batch);
        assert_eq!(device.binding(resource, coordinate), Some((heap, 2)));

        let mut batch = TileMappingBatch::new();
        batch.push_null(coordinate);
        device.update_tile_mappings(resource, heap, &batch);
        assert_eq!(device.binding(resource, coordinate), None);
        assert_eq!(device.tile_mapping_call_count(), 2);
    }

    #[test]
    fn test_aliasing_is_detected() {
        let device = HeadlessDevice::new();
        let heap = device.create_heap(TILE_SIZE_IN_BYTES).unwrap();
        let desc = TextureDesc::new(256, 256, TextureFormat::Rgba8);
        let resource = device.create_reserved_texture(&desc).unwrap();

        let mut batch = TileMappingBatch::new();
        batch.push_map(TiledResourceCoordinate::new(0, 0, 0), 0);
        batch.push_map(TiledResourceCoordinate::new(1, 0, 0), 0);
        device.update_tile_mappings(resource, heap, &batch);

        assert_eq!(device.aliasing_violations(), 1);
        assert_eq!(device.bound_tile_count(resource), 1);
    }

    #[test]
    fn test_committed_texture_has_no_tiling() {
        let device = HeadlessDevice::new();
        let desc = TextureDesc::new(64, 64, TextureFormat::Rgba8);
        let resource = device.create_committed_texture(&desc).unwrap();

        assert!(matches!(
            device.resource_tiling(resource),
            Err(RendererError::ResourceNotFound(_))
        ));
    }

    #[test]
    fn test_manual_fences() {
        let device = HeadlessDevice::new();
        device.set_auto_complete(false);

        let first = device.signal();
        let second = device.signal();
        assert_eq!(device.completed_fence_value(), 0);

        device.complete_fences_through(first);
        assert_eq!(device.completed_fence_value(), first);

        // Cannot complete past what was signalled
        device.complete_fences_through(second + 10);
        assert_eq!(device.completed_fence_value(), second);
    }
}
