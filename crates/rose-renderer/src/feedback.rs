//! Feedback Maps
//!
//! Shading work writes, per tile of a virtual texture, the finest mip it
//! sampled. The feedback map owns that GPU buffer plus a small ring of
//! readback buffers. Each frame's copy is tagged with a fence value and is
//! only handed to the CPU once the fence has completed, so a read never sees
//! a copy the GPU has not finished.

use std::sync::Arc;

use serde::Serialize;

use crate::device::{BufferHandle, BufferUsage, GpuDevice};
use crate::{RendererError, RendererResult};

/// Bytes per feedback entry
pub const FEEDBACK_ELEMENT_SIZE: u64 = 4;

/// Tightest mip range sampled during one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MipLevelsUsed {
    pub finest: u32,
    pub coarsest: u32,
}

impl MipLevelsUsed {
    pub fn new(finest: u32, coarsest: u32) -> Self {
        Self { finest, coarsest }
    }

    /// Range for a texture nothing sampled: only its coarsest mip
    pub fn coarsest_only(mip_levels: u32) -> Self {
        let last = mip_levels.saturating_sub(1);
        Self::new(last, last)
    }

    pub fn contains(&self, mip: u32) -> bool {
        (self.finest..=self.coarsest).contains(&mip)
    }
}

/// Reduce feedback values to the range of mips actually sampled
///
/// `mip_levels` doubles as the "unused" sentinel. Values at or above it are
/// ignored; if nothing else remains the range collapses to the coarsest mip.
pub fn extract_mips_used(values: &[u32], mip_levels: u32) -> MipLevelsUsed {
    let (finest, coarsest) = values
        .iter()
        .copied()
        .filter(|&mip| mip < mip_levels)
        .fold((u32::MAX, 0u32), |(finest, coarsest), mip| {
            (finest.min(mip), coarsest.max(mip))
        });

    if finest == u32::MAX {
        MipLevelsUsed::coarsest_only(mip_levels)
    } else {
        MipLevelsUsed::new(finest, coarsest)
    }
}

#[derive(Debug)]
struct ReadbackSlot {
    buffer: BufferHandle,
    /// Fence signalled after the copy into this slot
    fence: Option<u64>,
}

/// GPU-written per-tile feedback with latency-buffered readback
pub struct FeedbackMap<D: GpuDevice> {
    device: Arc<D>,
    width: u32,
    height: u32,
    sentinel: u32,
    buffer: BufferHandle,
    readback: Vec<ReadbackSlot>,
    next_slot: usize,
}

impl<D: GpuDevice> FeedbackMap<D> {
    /// Create a `width` x `height` feedback map for a texture with `mip_levels` mips
    ///
    /// `latency` is the number of readback buffers in flight; at least one is kept.
    pub fn new(device: Arc<D>, width: u32, height: u32, mip_levels: u32, latency: u32) -> RendererResult<Self> {
        let size = width.max(1) as u64 * height.max(1) as u64 * FEEDBACK_ELEMENT_SIZE;
        let buffer = device.create_buffer(size, BufferUsage::Storage)?;

        let mut readback = Vec::with_capacity(latency.max(1) as usize);
        for _ in 0..latency.max(1) {
            match device.create_buffer(size, BufferUsage::Readback) {
                Ok(slot) => readback.push(ReadbackSlot {
                    buffer: slot,
                    fence: None,
                }),
                Err(err) => {
                    device.destroy_buffer(buffer);
                    for slot in &readback {
                        device.destroy_buffer(slot.buffer);
                    }
                    return Err(err);
                }
            }
        }

        let map = Self {
            device,
            width: width.max(1),
            height: height.max(1),
            sentinel: mip_levels,
            buffer,
            readback,
            next_slot: 0,
        };
        map.clear();
        Ok(map)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn element_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.element_count() as u64 * FEEDBACK_ELEMENT_SIZE
    }

    /// Value meaning "tile unused this frame"
    pub fn sentinel(&self) -> u32 {
        self.sentinel
    }

    /// Live buffer the shading pass writes into
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Reset every entry to the sentinel before the frame's shading pass
    pub fn clear(&self) {
        self.device.fill_buffer_u32(self.buffer, self.sentinel);
    }

    /// Copy the live buffer into the next readback slot and return the fence
    /// value that marks the copy complete
    pub fn update(&mut self) -> u64 {
        let slot = &mut self.readback[self.next_slot];
        self.device.copy_buffer(self.buffer, slot.buffer);
        let fence = self.device.signal();
        slot.fence = Some(fence);
        self.next_slot = (self.next_slot + 1) % self.readback.len();
        fence
    }

    /// Values of the newest copy the GPU has finished, if any
    pub fn read(&self) -> RendererResult<Option<Vec<u32>>> {
        let completed = self.device.completed_fence_value();
        let newest = self
            .readback
            .iter()
            .filter_map(|slot| slot.fence.map(|fence| (fence, slot.buffer)))
            .filter(|&(fence, _)| fence <= completed)
            .max_by_key(|&(fence, _)| fence);

        match newest {
            Some((_, buffer)) => self.decode(buffer).map(Some),
            None => Ok(None),
        }
    }

    /// Wait for the most recent copy and read it
    pub fn read_blocking(&self) -> RendererResult<Option<Vec<u32>>> {
        if let Some(fence) = self.readback.iter().filter_map(|slot| slot.fence).max() {
            self.device.wait_for_fence(fence);
        }
        self.read()
    }

    fn decode(&self, buffer: BufferHandle) -> RendererResult<Vec<u32>> {
        let bytes = self.device.read_buffer(buffer)?;
        if (bytes.len() as u64) < self.size_in_bytes() {
            return Err(RendererError::Buffer(format!(
                "feedback readback holds {} bytes, expected {}",
                bytes.len(),
                self.size_in_bytes()
            )));
        }

        Ok(bytes
            .chunks_exact(FEEDBACK_ELEMENT_SIZE as usize)
            .take(self.element_count())
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }
}

impl<D: GpuDevice> Drop for FeedbackMap<D> {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
        for slot in &self.readback {
            self.device.destroy_buffer(slot.buffer);
        }
    }
}

impl<D: GpuDevice> std::fmt::Debug for FeedbackMap<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackMap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sentinel", &self.sentinel)
            .field("buffer", &self.buffer)
            .field("readback_slots", &self.readback.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;

    #[test]
    fn test_all_sentinel_collapses_to_coarsest() {
        let used = extract_mips_used(&[8, 8, 8, 8], 8);
        assert_eq!(used, MipLevelsUsed::new(7, 7));
    }

    #[test]
    fn test_extract_range() {
        let used = extract_mips_used(&[2, 2, 5, 5], 8);
        assert_eq!(used.finest, 2);
        assert_eq!(used.coarsest, 5);
    }

    #[test]
    fn test_extract_ignores_sentinel_and_garbage() {
        let used = extract_mips_used(&[8, 3, 8, 4, 1000], 8);
        assert_eq!(used, MipLevelsUsed::new(3, 4));
        assert!(used.contains(3));
        assert!(!used.contains(5));
    }

    #[test]
    fn test_extract_empty_buffer() {
        assert_eq!(extract_mips_used(&[], 4), MipLevelsUsed::new(3, 3));
    }

    #[test]
    fn test_new_map_reads_as_sentinel() {
        let device = Arc::new(HeadlessDevice::new());
        let mut map = FeedbackMap::new(device, 2, 2, 8, 1).unwrap();

        assert!(map.read().unwrap().is_none());
        map.update();
        assert_eq!(map.read().unwrap(), Some(vec![8; 4]));
    }

    #[test]
    fn test_readback_waits_for_fence() {
        let device = Arc::new(HeadlessDevice::new());
        device.set_auto_complete(false);
        let mut map = FeedbackMap::new(device.clone(), 2, 1, 4, 2).unwrap();

        device.write_buffer_u32(map.buffer(), &[1, 2]);
        let first = map.update();
        assert!(map.read().unwrap().is_none());

        device.complete_fences_through(first);
        assert_eq!(map.read().unwrap(), Some(vec![1, 2]));

        // A newer copy stays hidden until its own fence completes
        map.clear();
        device.write_buffer_u32(map.buffer(), &[3, 3]);
        let second = map.update();
        assert_eq!(map.read().unwrap(), Some(vec![1, 2]));

        device.complete_fences_through(second);
        assert_eq!(map.read().unwrap(), Some(vec![3, 3]));
    }

    #[test]
    fn test_read_blocking() {
        let device = Arc::new(HeadlessDevice::new());
        device.set_auto_complete(false);
        let mut map = FeedbackMap::new(device.clone(), 1, 1, 4, 3).unwrap();

        device.write_buffer_u32(map.buffer(), &[2]);
        map.update();
        assert_eq!(map.read_blocking().unwrap(), Some(vec![2]));
    }

    #[test]
    fn test_buffers_released_on_drop() {
        let device = Arc::new(HeadlessDevice::new());
        {
            let _map = FeedbackMap::new(device.clone(), 4, 4, 6, 2).unwrap();
            assert_eq!(device.buffer_count(), 3);
        }
        assert_eq!(device.buffer_count(), 0);
    }
}
