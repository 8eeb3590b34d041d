//! Textures
//!
//! Committed and virtual 2D textures as one sum type. Only the virtual
//! variant has a tiling layout, a feedback map and a sampled mip range.

use std::fmt;
use std::sync::Arc;

use rose_core::{Handle, HandleAllocator};

use crate::device::{GpuDevice, ResourceHandle};
use crate::feedback::{extract_mips_used, FeedbackMap, MipLevelsUsed};
use crate::tiling::{ResourceTiling, TextureDesc};
use crate::RendererResult;

/// Stable texture identity; never reused for a different texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(Handle);

impl TextureId {
    pub fn handle(&self) -> Handle {
        self.0
    }
}

impl fmt::Display for TextureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "texture#{}", self.0)
    }
}

/// Which variant a texture is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureKind {
    Committed,
    Virtual,
}

/// Texture with memory committed at creation
#[derive(Debug)]
pub struct CommittedTexture2D {
    id: TextureId,
    resource: ResourceHandle,
    desc: TextureDesc,
}

impl CommittedTexture2D {
    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn resource(&self) -> ResourceHandle {
        self.resource
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }
}

/// Reserved texture whose tiles are paged in and out by the tile pool
#[derive(Debug)]
pub struct VirtualTexture2D<D: GpuDevice> {
    id: TextureId,
    resource: ResourceHandle,
    desc: TextureDesc,
    tiling: ResourceTiling,
    feedback: FeedbackMap<D>,
    /// Range from the last extraction
    mips_used: MipLevelsUsed,
}

impl<D: GpuDevice> VirtualTexture2D<D> {
    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn resource(&self) -> ResourceHandle {
        self.resource
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn tiling(&self) -> &ResourceTiling {
        &self.tiling
    }

    pub fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }

    pub fn feedback(&self) -> &FeedbackMap<D> {
        &self.feedback
    }

    pub fn feedback_mut(&mut self) -> &mut FeedbackMap<D> {
        &mut self.feedback
    }

    /// Cached range from the last extraction
    pub fn mips_used(&self) -> MipLevelsUsed {
        self.mips_used
    }

    /// Override the cached range
    pub fn set_mips_used(&mut self, mips_used: MipLevelsUsed) {
        let last = self.mip_levels() - 1;
        self.mips_used = MipLevelsUsed::new(mips_used.finest.min(last), mips_used.coarsest.min(last));
    }

    /// Re-derive the sampled mip range from the newest completed feedback
    ///
    /// Keeps the previous range while no readback has completed.
    pub fn extract_mips_used(&mut self) -> RendererResult<MipLevelsUsed> {
        if let Some(values) = self.feedback.read()? {
            self.mips_used = extract_mips_used(&values, self.mip_levels());
        }
        Ok(self.mips_used)
    }
}

/// A 2D texture of either kind
#[derive(Debug)]
pub enum Texture2D<D: GpuDevice> {
    Committed(CommittedTexture2D),
    Virtual(VirtualTexture2D<D>),
}

impl<D: GpuDevice> Texture2D<D> {
    pub fn id(&self) -> TextureId {
        match self {
            Self::Committed(texture) => texture.id(),
            Self::Virtual(texture) => texture.id(),
        }
    }

    pub fn kind(&self) -> TextureKind {
        match self {
            Self::Committed(_) => TextureKind::Committed,
            Self::Virtual(_) => TextureKind::Virtual,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Self::Virtual(_))
    }

    pub fn desc(&self) -> &TextureDesc {
        match self {
            Self::Committed(texture) => texture.desc(),
            Self::Virtual(texture) => texture.desc(),
        }
    }

    pub fn resource(&self) -> ResourceHandle {
        match self {
            Self::Committed(texture) => texture.resource(),
            Self::Virtual(texture) => texture.resource(),
        }
    }

    pub fn as_virtual(&self) -> Option<&VirtualTexture2D<D>> {
        match self {
            Self::Virtual(texture) => Some(texture),
            Self::Committed(_) => None,
        }
    }

    pub fn as_virtual_mut(&mut self) -> Option<&mut VirtualTexture2D<D>> {
        match self {
            Self::Virtual(texture) => Some(texture),
            Self::Committed(_) => None,
        }
    }
}

impl<D: GpuDevice> From<VirtualTexture2D<D>> for Texture2D<D> {
    fn from(texture: VirtualTexture2D<D>) -> Self {
        Self::Virtual(texture)
    }
}

impl<D: GpuDevice> From<CommittedTexture2D> for Texture2D<D> {
    fn from(texture: CommittedTexture2D) -> Self {
        Self::Committed(texture)
    }
}

/// Creates textures on a device and hands out their identities
pub struct TextureFactory<D: GpuDevice> {
    device: Arc<D>,
    ids: HandleAllocator,
    feedback_latency: u32,
}

impl<D: GpuDevice> TextureFactory<D> {
    /// Create a factory; virtual textures get `feedback_latency` readback slots
    pub fn new(device: Arc<D>, feedback_latency: u32) -> Self {
        Self {
            device,
            ids: HandleAllocator::new(),
            feedback_latency,
        }
    }

    pub fn create_committed(&mut self, desc: TextureDesc) -> RendererResult<CommittedTexture2D> {
        let resource = self.device.create_committed_texture(&desc)?;
        Ok(CommittedTexture2D {
            id: TextureId(self.ids.allocate()),
            resource,
            desc,
        })
    }

    /// Create a reserved texture with no tiles mapped and a feedback map
    /// covering its finest tile grid
    pub fn create_virtual(&mut self, desc: TextureDesc) -> RendererResult<VirtualTexture2D<D>> {
        let resource = self.device.create_reserved_texture(&desc)?;
        let tiling = match self.device.resource_tiling(resource) {
            Ok(tiling) => tiling,
            Err(err) => {
                self.device.destroy_resource(resource);
                return Err(err);
            }
        };

        let (width, height) = tiling
            .subresource(0)
            .map_or((1, 1), |grid| (grid.width_in_tiles, grid.height_in_tiles));
        let feedback = match FeedbackMap::new(
            self.device.clone(),
            width,
            height,
            desc.mip_levels,
            self.feedback_latency,
        ) {
            Ok(feedback) => feedback,
            Err(err) => {
                self.device.destroy_resource(resource);
                return Err(err);
            }
        };

        let id = TextureId(self.ids.allocate());
        log::debug!(
            "Created virtual texture {} ({}x{}, {} mips, {} standard, {} tiles)",
            id,
            desc.width,
            desc.height,
            desc.mip_levels,
            tiling.num_standard_mips(),
            tiling.total_tiles
        );

        Ok(VirtualTexture2D {
            id,
            resource,
            desc,
            mips_used: MipLevelsUsed::coarsest_only(desc.mip_levels),
            tiling,
            feedback,
        })
    }

    /// Destroy a texture and retire its id
    ///
    /// Release a virtual texture's tiles from the tile pool first.
    pub fn destroy(&mut self, texture: impl Into<Texture2D<D>>) {
        let texture = texture.into();
        self.ids.release(texture.id().handle());
        self.device.destroy_resource(texture.resource());
    }

    pub fn is_alive(&self, id: TextureId) -> bool {
        self.ids.is_alive(id.handle())
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;
    use crate::tiling::TextureFormat;

    fn factory() -> TextureFactory<HeadlessDevice> {
        TextureFactory::new(Arc::new(HeadlessDevice::new()), 2)
    }

    #[test]
    fn test_texture_kinds() {
        let mut factory = factory();
        let committed: Texture2D<HeadlessDevice> = factory
            .create_committed(TextureDesc::new(64, 64, TextureFormat::Rgba8))
            .unwrap()
            .into();
        let mut virtual_texture: Texture2D<HeadlessDevice> = factory
            .create_virtual(TextureDesc::new(512, 512, TextureFormat::Rgba8))
            .unwrap()
            .into();

        assert_eq!(committed.kind(), TextureKind::Committed);
        assert!(!committed.is_virtual());
        assert!(committed.as_virtual().is_none());
        assert_eq!(virtual_texture.kind(), TextureKind::Virtual);
        assert!(virtual_texture.is_virtual());
        assert!(virtual_texture.as_virtual_mut().is_some());
        assert_ne!(committed.id(), virtual_texture.id());
    }

    #[test]
    fn test_feedback_covers_finest_grid() {
        let mut factory = factory();
        let texture = factory
            .create_virtual(TextureDesc::new(512, 256, TextureFormat::Rgba8))
            .unwrap();

        assert_eq!(texture.feedback().width(), 4);
        assert_eq!(texture.feedback().height(), 2);
        assert_eq!(texture.feedback().sentinel(), texture.mip_levels());
        assert_eq!(texture.mips_used(), MipLevelsUsed::coarsest_only(10));
    }

    #[test]
    fn test_extract_mips_used_from_feedback() {
        let mut factory = factory();
        let device = factory.device().clone();
        let mut texture = factory
            .create_virtual(TextureDesc::new(256, 256, TextureFormat::Rgba8))
            .unwrap();

        // Nothing copied back yet: previous range kept
        assert_eq!(texture.extract_mips_used().unwrap(), MipLevelsUsed::new(8, 8));

        device.write_buffer_u32(texture.feedback().buffer(), &[1, 9, 3, 9]);
        texture.feedback_mut().update();
        assert_eq!(texture.extract_mips_used().unwrap(), MipLevelsUsed::new(1, 3));
    }

    #[test]
    fn test_set_mips_used_clamps() {
        let mut factory = factory();
        let mut texture = factory
            .create_virtual(TextureDesc::new(256, 256, TextureFormat::Rgba8))
            .unwrap();

        texture.set_mips_used(MipLevelsUsed::new(2, 40));
        assert_eq!(texture.mips_used(), MipLevelsUsed::new(2, 8));
    }

    #[test]
    fn test_destroy_retires_id() {
        let mut factory = factory();
        let device = factory.device().clone();
        let texture = factory
            .create_virtual(TextureDesc::new(256, 256, TextureFormat::Rgba8))
            .unwrap();
        let id = texture.id();

        factory.destroy(texture);
        assert!(!factory.is_alive(id));
        assert_eq!(device.resource_count(), 0);
        assert_eq!(device.buffer_count(), 0);

        let replacement = factory
            .create_virtual(TextureDesc::new(256, 256, TextureFormat::Rgba8))
            .unwrap();
        assert_ne!(replacement.id(), id);
    }
}
