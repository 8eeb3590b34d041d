//! Residency Pass
//!
//! Per-frame driver for virtual textures. Before shading, every feedback map
//! is reset; after shading, feedback is copied back, the sampled mip range
//! is re-derived and the tile pool is asked to converge on it.

use serde::Serialize;

use crate::device::GpuDevice;
use crate::texture::Texture2D;
use crate::tile_heap::TileHeapStats;
use crate::tile_pool::{ResidencyChange, TilePool};
use crate::RendererResult;

/// Residency numbers for one frame
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResidencyFrameStats {
    /// Frame number
    pub frame: u64,
    /// Virtual textures processed
    pub textures: u32,
    /// Sum of the residency changes of all textures
    pub change: ResidencyChange,
    /// Heap occupancy after the frame
    pub heaps: Vec<TileHeapStats>,
    /// Heap memory owned by the pool
    pub resident_bytes: u64,
}

impl ResidencyFrameStats {
    pub fn used_tiles(&self) -> u64 {
        self.heaps.iter().map(|heap| heap.used_tiles() as u64).sum()
    }
}

/// Drives feedback and residency for all virtual textures once per frame
#[derive(Debug, Default)]
pub struct ResidencyPass {
    frame: u64,
    last: ResidencyFrameStats,
}

impl ResidencyPass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset feedback of every virtual texture ahead of the shading pass
    pub fn begin_frame<D: GpuDevice>(&mut self, textures: &[Texture2D<D>]) {
        self.frame += 1;
        for texture in textures.iter().filter_map(Texture2D::as_virtual) {
            texture.feedback().clear();
        }
    }

    /// Read back feedback and converge residency for every virtual texture
    ///
    /// Committed textures are skipped.
    pub fn end_frame<D: GpuDevice>(
        &mut self,
        pool: &mut TilePool<D>,
        textures: &mut [Texture2D<D>],
    ) -> RendererResult<&ResidencyFrameStats> {
        let _span = tracing::debug_span!("residency", frame = self.frame).entered();

        let mut stats = ResidencyFrameStats {
            frame: self.frame,
            ..Default::default()
        };

        for texture in textures.iter_mut().filter_map(Texture2D::as_virtual_mut) {
            texture.feedback_mut().update();
            texture.extract_mips_used()?;
            stats.change += pool.map_texture(texture)?;
            stats.textures += 1;
        }

        stats.heaps = pool.stats();
        stats.resident_bytes = pool.resident_bytes();
        log::debug!(
            "Frame {}: {} virtual textures, {} tiles mapped, {} unmapped, {} update calls, {} heaps",
            stats.frame,
            stats.textures,
            stats.change.tiles_mapped,
            stats.change.tiles_unmapped,
            stats.change.update_calls,
            stats.heaps.len()
        );

        self.last = stats;
        Ok(&self.last)
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Stats of the last completed frame
    pub fn last_stats(&self) -> &ResidencyFrameStats {
        &self.last
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::feedback::MipLevelsUsed;
    use crate::headless::HeadlessDevice;
    use crate::texture::TextureFactory;
    use crate::tile_pool::TilePoolConfig;
    use crate::tiling::{TextureDesc, TextureFormat};

    fn setup(latency: u32) -> (Arc<HeadlessDevice>, TextureFactory<HeadlessDevice>, TilePool<HeadlessDevice>) {
        let device = Arc::new(HeadlessDevice::new());
        let config = TilePoolConfig {
            tiles_per_heap: 128,
            feedback_latency: latency,
            ..Default::default()
        };
        let factory = TextureFactory::new(device.clone(), config.feedback_latency);
        let pool = TilePool::new(device.clone(), config);
        (device, factory, pool)
    }

    #[test]
    fn test_frame_drives_residency_from_feedback() {
        let (device, mut factory, mut pool) = setup(1);
        let mut textures: Vec<Texture2D<_>> = vec![
            factory
                .create_virtual(TextureDesc::new(512, 512, TextureFormat::Rgba8))
                .unwrap()
                .into(),
            factory
                .create_committed(TextureDesc::new(64, 64, TextureFormat::Rgba8))
                .unwrap()
                .into(),
        ];
        let mut pass = ResidencyPass::new();

        pass.begin_frame(&textures);
        let feedback = textures[0].as_virtual().unwrap().feedback().buffer();
        let mut values = vec![10u32; 16];
        values[5] = 1;
        values[6] = 2;
        device.write_buffer_u32(feedback, &values);

        let stats = pass.end_frame(&mut pool, &mut textures).unwrap();
        assert_eq!(stats.frame, 1);
        assert_eq!(stats.textures, 1);
        // Mips 1..=2 (4 + 1 tiles) plus the packed tail
        assert_eq!(stats.change.tiles_mapped, 6);
        assert_eq!(stats.used_tiles(), 6);
        assert_eq!(
            textures[0].as_virtual().unwrap().mips_used(),
            MipLevelsUsed::new(1, 2)
        );
    }

    #[test]
    fn test_offscreen_texture_keeps_only_coarsest() {
        let (_device, mut factory, mut pool) = setup(1);
        let mut textures: Vec<Texture2D<_>> = vec![factory
            .create_virtual(TextureDesc::new(1024, 1024, TextureFormat::Rgba8))
            .unwrap()
            .into()];
        let mut pass = ResidencyPass::new();

        pass.begin_frame(&textures);
        let stats = pass.end_frame(&mut pool, &mut textures).unwrap();

        // Coarsest standard mip plus the packed tail
        assert_eq!(stats.change.tiles_mapped, 2);

        pass.begin_frame(&textures);
        let stats = pass.end_frame(&mut pool, &mut textures).unwrap();
        assert!(stats.change.is_noop());
        assert_eq!(pass.frame(), 2);
    }

    #[test]
    fn test_latency_uses_previous_frame() {
        let (device, mut factory, mut pool) = setup(2);
        device.set_auto_complete(false);
        let mut textures: Vec<Texture2D<_>> = vec![factory
            .create_virtual(TextureDesc::new(256, 256, TextureFormat::Rgba8))
            .unwrap()
            .into()];
        let mut pass = ResidencyPass::new();
        let feedback = textures[0].as_virtual().unwrap().feedback().buffer();

        // Frame 1: GPU has not finished, the initial coarsest-only range is used
        pass.begin_frame(&textures);
        device.write_buffer_u32(feedback, &[0, 0, 0, 0]);
        pass.end_frame(&mut pool, &mut textures).unwrap();
        assert_eq!(
            textures[0].as_virtual().unwrap().mips_used(),
            MipLevelsUsed::new(8, 8)
        );

        // Frame 1's copy completes during frame 2
        device.complete_fences_through(device.completed_fence_value() + 1);
        pass.begin_frame(&textures);
        device.write_buffer_u32(feedback, &[1, 1, 1, 1]);
        pass.end_frame(&mut pool, &mut textures).unwrap();
        assert_eq!(
            textures[0].as_virtual().unwrap().mips_used(),
            MipLevelsUsed::new(0, 0)
        );
        assert_eq!(pass.last_stats().frame, 2);
    }
}
