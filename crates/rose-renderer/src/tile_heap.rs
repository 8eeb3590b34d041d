//! Tile Heaps
//!
//! One fixed-size GPU heap divided into 64 KiB tiles, with a free/used
//! bitset. Allocation hands out the first free tile; release is O(1).

use serde::Serialize;

use crate::device::HeapHandle;
use crate::tiling::TILE_SIZE_IN_BYTES;

/// Per-heap numbers for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TileHeapStats {
    /// Tile capacity of the heap
    pub max_tiles: u32,
    /// Tiles not currently mapped
    pub free_tiles: u32,
}

impl TileHeapStats {
    /// Tiles currently mapped
    pub fn used_tiles(&self) -> u32 {
        self.max_tiles - self.free_tiles
    }
}

/// Physical tile storage backed by one GPU heap
#[derive(Debug)]
pub struct TileHeap {
    /// Position in the pool's heap arena
    page_index: u32,
    /// Backing GPU heap
    handle: HeapHandle,
    max_tiles: u32,
    free_tiles: u32,
    /// One bit per tile, set when used. Bits past `max_tiles` are always set.
    occupancy: Vec<u64>,
}

impl TileHeap {
    /// Wrap a freshly created heap of `max_tiles` tiles
    pub fn new(page_index: u32, handle: HeapHandle, max_tiles: u32) -> Self {
        let words = (max_tiles as usize).div_ceil(64);
        let mut occupancy = vec![0u64; words];
        let tail = max_tiles % 64;
        if tail != 0 {
            if let Some(last) = occupancy.last_mut() {
                *last = !0u64 << tail;
            }
        }

        Self {
            page_index,
            handle,
            max_tiles,
            free_tiles: max_tiles,
            occupancy,
        }
    }

    /// Claim the first free tile. Returns `None` when the heap is full.
    pub fn allocate_tile(&mut self) -> Option<u32> {
        if self.free_tiles == 0 {
            return None;
        }

        for (word_index, word) in self.occupancy.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros();
            *word |= 1u64 << bit;
            self.free_tiles -= 1;
            return Some(word_index as u32 * 64 + bit);
        }

        log::error!(
            "Tile heap {} reports {} free tiles but its bitmap is full",
            self.page_index,
            self.free_tiles
        );
        debug_assert!(false, "tile heap free count out of sync with bitmap");
        None
    }

    /// Return a tile to the heap
    ///
    /// Releasing a tile that is already free is ignored and reported with
    /// `false`, leaving the counters untouched.
    pub fn release_tile(&mut self, tile_index: u32) -> bool {
        if tile_index >= self.max_tiles {
            log::error!(
                "Tile {} released to heap {} of {} tiles",
                tile_index,
                self.page_index,
                self.max_tiles
            );
            debug_assert!(false, "tile index out of range");
            return false;
        }

        let (word, mask) = Self::locate(tile_index);
        if self.occupancy[word] & mask == 0 {
            log::warn!(
                "Tile {} of heap {} released while already free",
                tile_index,
                self.page_index
            );
            return false;
        }

        self.occupancy[word] &= !mask;
        self.free_tiles += 1;
        true
    }

    /// Whether a tile is currently allocated
    pub fn is_allocated(&self, tile_index: u32) -> bool {
        if tile_index >= self.max_tiles {
            return false;
        }
        let (word, mask) = Self::locate(tile_index);
        self.occupancy[word] & mask != 0
    }

    fn locate(tile_index: u32) -> (usize, u64) {
        ((tile_index / 64) as usize, 1u64 << (tile_index % 64))
    }

    pub fn num_free_tiles(&self) -> u32 {
        self.free_tiles
    }

    pub fn num_used_tiles(&self) -> u32 {
        self.max_tiles - self.free_tiles
    }

    /// Tile capacity
    pub fn size(&self) -> u32 {
        self.max_tiles
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.max_tiles as u64 * TILE_SIZE_IN_BYTES
    }

    pub fn page_index(&self) -> u32 {
        self.page_index
    }

    pub fn handle(&self) -> HeapHandle {
        self.handle
    }

    pub fn stats(&self) -> TileHeapStats {
        TileHeapStats {
            max_tiles: self.max_tiles,
            free_tiles: self.free_tiles,
        }
    }

    /// Count set bits in the bitmap; equals `num_used_tiles` while the heap is consistent
    pub fn count_allocated(&self) -> u32 {
        let padding = (self.occupancy.len() as u32 * 64) - self.max_tiles;
        self.occupancy.iter().map(|word| word.count_ones()).sum::<u32>() - padding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap(tiles: u32) -> TileHeap {
        TileHeap::new(0, HeapHandle::from_raw(1), tiles)
    }

    #[test]
    fn test_allocate_until_full() {
        let mut heap = heap(4);

        let tiles: Vec<_> = (0..4).map(|_| heap.allocate_tile().unwrap()).collect();
        assert_eq!(tiles, vec![0, 1, 2, 3]);
        assert_eq!(heap.num_free_tiles(), 0);
        assert!(heap.allocate_tile().is_none());
    }

    #[test]
    fn test_release_and_reuse() {
        let mut heap = heap(8);
        for _ in 0..8 {
            heap.allocate_tile();
        }

        assert!(heap.release_tile(5));
        assert_eq!(heap.num_free_tiles(), 1);
        assert!(!heap.is_allocated(5));
        assert_eq!(heap.allocate_tile(), Some(5));
    }

    #[test]
    fn test_double_release_is_ignored() {
        let mut heap = heap(4);
        let tile = heap.allocate_tile().unwrap();

        assert!(heap.release_tile(tile));
        assert!(!heap.release_tile(tile));
        assert_eq!(heap.num_free_tiles(), 4);
        assert_eq!(heap.num_free_tiles() + heap.num_used_tiles(), heap.size());
    }

    #[test]
    fn test_capacity_not_multiple_of_word() {
        let mut heap = heap(70);
        let mut seen = Vec::new();
        while let Some(tile) = heap.allocate_tile() {
            seen.push(tile);
        }

        assert_eq!(seen.len(), 70);
        assert!(seen.iter().all(|&tile| tile < 70));
        assert_eq!(heap.count_allocated(), 70);
        assert!(!heap.is_allocated(70));
    }

    #[test]
    fn test_conservation_through_churn() {
        let mut heap = heap(130);
        let mut live = Vec::new();

        for round in 0..200u32 {
            if round % 3 == 2 {
                if let Some(tile) = live.pop() {
                    heap.release_tile(tile);
                }
            } else if let Some(tile) = heap.allocate_tile() {
                live.push(tile);
            }
            assert_eq!(heap.num_used_tiles(), live.len() as u32);
            assert_eq!(heap.count_allocated(), heap.num_used_tiles());
        }
    }

    #[test]
    fn test_stats() {
        let mut heap = heap(16);
        heap.allocate_tile();
        let stats = heap.stats();

        assert_eq!(stats.max_tiles, 16);
        assert_eq!(stats.free_tiles, 15);
        assert_eq!(stats.used_tiles(), 1);
        assert_eq!(heap.size_in_bytes(), 16 * TILE_SIZE_IN_BYTES);
    }
}
