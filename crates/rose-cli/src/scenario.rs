//! Residency Scenarios
//!
//! A scenario is a JSON description of virtual textures and what shading
//! sampled from them frame by frame. Running one drives the real tile pool
//! against the headless device and collects the per-frame numbers.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use rose_renderer::{
    HeadlessDevice, MipLevelsUsed, ResidencyChange, ResidencyFrameStats, ResidencyPass, ResourceTiling, Texture2D,
    TextureDesc, TextureFactory, TextureFormat, TilePool, TilePoolConfig,
};

/// Scenario file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Tile pool settings
    #[serde(default)]
    pub pool: TilePoolConfig,
    pub textures: Vec<TextureSpec>,
    #[serde(default)]
    pub frames: Vec<FrameSpec>,
}

/// One virtual texture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextureSpec {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Full chain when omitted
    #[serde(default)]
    pub mip_levels: Option<u32>,
    #[serde(default)]
    pub format: TextureFormat,
}

impl TextureSpec {
    pub fn desc(&self) -> TextureDesc {
        let desc = TextureDesc::new(self.width, self.height, self.format);
        match self.mip_levels {
            Some(mip_levels) => desc.with_mip_levels(mip_levels),
            None => desc,
        }
    }

    /// Entries of the texture's feedback map: one per tile of its finest grid
    pub fn feedback_element_count(&self) -> Result<usize> {
        let tiling = ResourceTiling::for_texture(&self.desc())?;
        Ok(tiling
            .subresource(0)
            .map_or(1, |grid| grid.width_in_tiles as usize * grid.height_in_tiles as usize))
    }
}

/// What shading sampled from a texture during one frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sample {
    /// Raw feedback values, one per tile of the finest grid
    Feedback(Vec<u32>),
    /// `[finest, coarsest]`
    Range([u32; 2]),
    /// Nothing sampled
    Offscreen,
}

/// One frame of a scenario
///
/// Textures missing from `sample` are treated as offscreen. Releases and
/// removals happen after the frame's residency update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameSpec {
    #[serde(default)]
    pub sample: BTreeMap<String, Sample>,
    #[serde(default)]
    pub release: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

/// Per-frame outcome
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    #[serde(flatten)]
    pub residency: ResidencyFrameStats,
    /// Sampled range per active texture after extraction
    pub mips_used: BTreeMap<String, MipLevelsUsed>,
    /// Changes made by releases after the residency update
    pub released: ResidencyChange,
    pub removed: Vec<String>,
}

/// Outcome of a whole scenario
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub frames: Vec<FrameReport>,
    pub heaps: usize,
    pub resident_bytes: u64,
    pub tile_mapping_calls: usize,
    pub aliasing_violations: u64,
}

impl Scenario {
    /// Parse a scenario from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        let scenario: Scenario = serde_json::from_str(text).context("Invalid scenario JSON")?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Reject duplicate names, invalid textures, references to unknown
    /// textures and ranges a texture's feedback map cannot express
    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeMap::new();
        for texture in &self.textures {
            let elements = texture
                .feedback_element_count()
                .with_context(|| format!("Invalid texture '{}'", texture.name))?;
            if names.insert(texture.name.as_str(), elements).is_some() {
                bail!("Duplicate texture name '{}'", texture.name);
            }
        }
        if self.pool.tiles_per_heap == 0 {
            bail!("tiles_per_heap must be at least 1");
        }

        for (index, frame) in self.frames.iter().enumerate() {
            let referenced = frame
                .sample
                .keys()
                .chain(frame.release.iter())
                .chain(frame.remove.iter());
            for name in referenced {
                if !names.contains_key(name.as_str()) {
                    bail!("Frame {} references unknown texture '{}'", index + 1, name);
                }
            }
            for (name, sample) in &frame.sample {
                // A one-tile feedback map holds a single mip
                if let Sample::Range([finest, coarsest]) = sample {
                    if finest != coarsest && names.get(name.as_str()) == Some(&1) {
                        bail!(
                            "Frame {}: '{}' has a single feedback entry, range [{}, {}] needs equal bounds",
                            index + 1,
                            name,
                            finest,
                            coarsest
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Built-in scenario: a camera zooming into a terrain and back out while
    /// a decal texture comes and goes
    pub fn demo() -> Self {
        let range = |finest, coarsest| Sample::Range([finest, coarsest]);
        let frame = |samples: &[(&str, Sample)]| FrameSpec {
            sample: samples
                .iter()
                .map(|(name, sample)| (name.to_string(), sample.clone()))
                .collect(),
            ..Default::default()
        };

        let mut frames = vec![
            frame(&[("terrain", range(6, 10)), ("decal", Sample::Offscreen)]),
            frame(&[("terrain", range(3, 10)), ("decal", range(4, 6))]),
            frame(&[("terrain", range(0, 10)), ("decal", range(2, 6))]),
            frame(&[("terrain", range(0, 10)), ("decal", range(2, 6))]),
            frame(&[("terrain", range(3, 10))]),
        ];
        frames[4].release.push("decal".to_string());
        frames.push(FrameSpec {
            sample: [("terrain".to_string(), range(6, 10))].into_iter().collect(),
            remove: vec!["decal".to_string()],
            ..Default::default()
        });

        Self {
            pool: TilePoolConfig {
                tiles_per_heap: 256,
                ..Default::default()
            },
            textures: vec![
                TextureSpec {
                    name: "terrain".to_string(),
                    width: 2048,
                    height: 2048,
                    mip_levels: None,
                    format: TextureFormat::Rgba8,
                },
                TextureSpec {
                    name: "decal".to_string(),
                    width: 1024,
                    height: 512,
                    mip_levels: None,
                    format: TextureFormat::Rgba8,
                },
            ],
            frames,
        }
    }
}

/// Feedback values whose extraction yields `[finest, coarsest]`
fn feedback_for_range(range: [u32; 2], element_count: usize, sentinel: u32) -> Vec<u32> {
    let mut values = vec![sentinel; element_count];
    if let Some(first) = values.first_mut() {
        *first = range[0];
    }
    if let Some(last) = values.get_mut(1) {
        *last = range[1];
    }
    values
}

/// Run a scenario against a fresh headless device
pub fn run(scenario: &Scenario) -> Result<SimulationReport> {
    scenario.validate()?;

    let device = Arc::new(HeadlessDevice::new());
    let mut factory = TextureFactory::new(device.clone(), scenario.pool.feedback_latency);
    let mut pool = TilePool::new(device.clone(), scenario.pool.clone());
    let mut pass = ResidencyPass::new();

    // Active textures take part in residency; released ones wait for removal
    let mut names = Vec::with_capacity(scenario.textures.len());
    let mut textures: Vec<Texture2D<HeadlessDevice>> = Vec::with_capacity(scenario.textures.len());
    for spec in &scenario.textures {
        let texture = factory
            .create_virtual(spec.desc())
            .with_context(|| format!("Failed to create texture '{}'", spec.name))?;
        names.push(spec.name.clone());
        textures.push(texture.into());
    }
    let mut released: Vec<(String, Texture2D<HeadlessDevice>)> = Vec::new();
    let mut frames = Vec::with_capacity(scenario.frames.len());

    for frame in &scenario.frames {
        pass.begin_frame(&textures);
        for (name, texture) in names.iter().zip(&textures) {
            let Some(texture) = texture.as_virtual() else {
                continue;
            };
            let feedback = texture.feedback();
            match frame.sample.get(name) {
                Some(Sample::Feedback(values)) => device.write_buffer_u32(feedback.buffer(), values),
                Some(Sample::Range(range)) => device.write_buffer_u32(
                    feedback.buffer(),
                    &feedback_for_range(*range, feedback.element_count(), feedback.sentinel()),
                ),
                Some(Sample::Offscreen) | None => {}
            }
        }

        let frame_number = pass.frame();
        let residency = pass
            .end_frame(&mut pool, &mut textures)
            .with_context(|| format!("Residency update failed in frame {}", frame_number))?
            .clone();
        let mips_used = names
            .iter()
            .zip(&textures)
            .filter_map(|(name, texture)| texture.as_virtual().map(|texture| (name.clone(), texture.mips_used())))
            .collect();

        let mut change = ResidencyChange::default();
        for name in &frame.release {
            let Some(position) = names.iter().position(|active| active == name) else {
                log::warn!("Texture '{}' is not active, nothing to release", name);
                continue;
            };
            let name = names.remove(position);
            let texture = textures.remove(position);
            if let Some(texture) = texture.as_virtual() {
                change += pool.release_texture(texture)?;
            }
            log::info!("Released '{}'", name);
            released.push((name, texture));
        }

        let mut removed = Vec::new();
        for name in &frame.remove {
            let Some(position) = released.iter().position(|(released, _)| released == name) else {
                bail!("Texture '{}' must be released before it is removed", name);
            };
            let (name, texture) = released.remove(position);
            pool.remove_texture(texture.id())
                .with_context(|| format!("Failed to remove '{}'", name))?;
            factory.destroy(texture);
            log::info!("Removed '{}'", name);
            removed.push(name);
        }

        frames.push(FrameReport {
            residency,
            mips_used,
            released: change,
            removed,
        });
    }

    let report = SimulationReport {
        frames,
        heaps: pool.heap_count(),
        resident_bytes: pool.resident_bytes(),
        tile_mapping_calls: device.tile_mapping_call_count(),
        aliasing_violations: device.aliasing_violations(),
    };

    for texture in textures.into_iter().chain(released.into_iter().map(|(_, texture)| texture)) {
        if let Some(texture) = texture.as_virtual() {
            pool.release_texture(texture)?;
        }
        pool.remove_texture(texture.id())?;
        factory.destroy(texture);
    }

    Ok(report)
}
