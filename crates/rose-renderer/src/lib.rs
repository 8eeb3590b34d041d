//! # Rose Renderer
//!
//! Tiled-resource residency for texture-space shading.
//!
//! Virtual textures are reserved resources whose 64 KiB tiles are backed by
//! physical memory only while shading actually samples them. This crate
//! decides, once per frame, which tiles must be resident and keeps the GPU's
//! tile mappings in sync with that decision.
//!
//! ## Features
//! - Tile heaps with bitset free lists, created on demand
//! - Per-texture mapping records for every standard mip plus the packed tail
//! - Feedback maps with fence-guarded, latency-buffered readback
//! - A tile pool that converges mappings on the sampled mip range and
//!   batches updates into one call per heap
//! - A headless device that simulates the GPU side for tests and tooling

pub mod device;
pub mod feedback;
pub mod headless;
pub mod residency;
pub mod texture;
pub mod texture_record;
pub mod tile_heap;
pub mod tile_pool;
pub mod tiling;

pub use device::{
    BufferHandle, BufferUsage, GpuDevice, HeapHandle, ResourceHandle, TileMappingBatch, TileRangeFlags,
    TiledResourceCoordinate,
};
pub use feedback::{extract_mips_used, FeedbackMap, MipLevelsUsed};
pub use headless::HeadlessDevice;
pub use residency::{ResidencyFrameStats, ResidencyPass};
pub use texture::{CommittedTexture2D, Texture2D, TextureFactory, TextureId, TextureKind, VirtualTexture2D};
pub use texture_record::{TileAddress, TileMapping, VirtualTextureRecord};
pub use tile_heap::{TileHeap, TileHeapStats};
pub use tile_pool::{ResidencyChange, TilePool, TilePoolConfig};
pub use tiling::{ResourceTiling, TextureDesc, TextureFormat, TILE_SIZE_IN_BYTES};

use thiserror::Error;

/// Renderer errors
#[derive(Error, Debug)]
pub enum RendererError {
    #[error("Heap creation failed ({size_in_bytes} bytes): {reason}")]
    HeapCreation { size_in_bytes: u64, reason: String },

    #[error("Invalid texture description: {0}")]
    InvalidTexture(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("{texture} still has {tiles} mapped tiles")]
    TextureStillResident { texture: TextureId, tiles: u64 },

    #[error("Buffer operation failed: {0}")]
    Buffer(String),

    #[error("Out of GPU memory")]
    OutOfMemory,
}

/// Result type for renderer operations
pub type RendererResult<T> = Result<T, RendererError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = RendererError::HeapCreation {
            size_in_bytes: 100,
            reason: "bad size".to_string(),
        };
        assert_eq!(err.to_string(), "Heap creation failed (100 bytes): bad size");
        assert_eq!(RendererError::OutOfMemory.to_string(), "Out of GPU memory");
    }
}
