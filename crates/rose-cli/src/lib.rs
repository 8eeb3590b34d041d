//! # Rose CLI
//!
//! Command-line residency simulator for Rose virtual textures.
//!
//! ## Commands
//! - `simulate` - Run a JSON scenario against the headless device
//! - `demo` - Run the built-in scenario

pub mod scenario;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

pub use scenario::{FrameReport, FrameSpec, Sample, Scenario, SimulationReport, TextureSpec};

/// Rose residency simulator
#[derive(Parser)]
#[command(name = "rose")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a scenario file
    Simulate {
        /// Scenario JSON file
        scenario: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the built-in scenario
    Demo {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    let filter = if cli.verbose { "debug" } else { "info" };
    // A logger may already be installed when embedded
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).try_init();

    let (scenario, json) = match cli.command {
        Commands::Simulate { scenario, json } => {
            let text = std::fs::read_to_string(&scenario)
                .with_context(|| format!("Failed to read scenario {}", scenario.display()))?;
            let parsed = Scenario::from_json(&text)
                .with_context(|| format!("Failed to load scenario {}", scenario.display()))?;
            log::info!("Simulating {}...", scenario.display());
            (parsed, json)
        }
        Commands::Demo { json } => {
            log::info!("Running demo scenario...");
            (Scenario::demo(), json)
        }
    };

    let report = scenario::run(&scenario)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    for frame in &report.frames {
        let stats = &frame.residency;
        log::info!(
            "Frame {}: +{} -{} tiles in {} calls, {} tiles resident in {} heaps",
            stats.frame,
            stats.change.tiles_mapped,
            stats.change.tiles_unmapped,
            stats.change.update_calls,
            stats.used_tiles(),
            stats.heaps.len()
        );
        for (name, mips) in &frame.mips_used {
            log::info!("  {}: mips {}..={}", name, mips.finest, mips.coarsest);
        }
        if frame.released.tiles_unmapped > 0 {
            log::info!("  Released {} tiles", frame.released.tiles_unmapped);
        }
        for name in &frame.removed {
            log::info!("  Removed {}", name);
        }
    }

    log::info!(
        "Done: {} heaps ({:.1} MB), {} tile-mapping calls, {} aliasing violations",
        report.heaps,
        report.resident_bytes as f64 / rose_core::MIB as f64,
        report.tile_mapping_calls,
        report.aliasing_violations
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use rose_renderer::TextureFormat;

    #[test]
    fn test_cli_parse() {
        let cli = Cli::parse_from(["rose", "demo"]);
        assert!(matches!(cli.command, Commands::Demo { json: false }));
        assert!(!cli.verbose);
    }

    #[test]
    fn test_simulate_command() {
        let cli = Cli::parse_from(["rose", "simulate", "scene.json", "--json", "-v"]);
        if let Commands::Simulate { scenario, json } = cli.command {
            assert_eq!(scenario, PathBuf::from("scene.json"));
            assert!(json);
        } else {
            panic!("Expected Simulate command");
        }
        assert!(cli.verbose);
    }

    #[test]
    fn test_scenario_parse() {
        let scenario = Scenario::from_json(
            r#"{
                "pool": { "tiles_per_heap": 64 },
                "textures": [
                    { "name": "rock", "width": 512, "height": 512 },
                    { "name": "grass", "width": 256, "height": 256, "mip_levels": 3, "format": "r8" }
                ],
                "frames": [
                    { "sample": { "rock": { "range": [1, 4] }, "grass": "offscreen" } },
                    { "sample": { "grass": { "feedback": [0, 1, 2] } }, "release": ["rock"] },
                    { "remove": ["rock"] }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(scenario.pool.tiles_per_heap, 64);
        assert_eq!(scenario.pool.feedback_latency, 2);
        assert_eq!(scenario.textures[0].format, TextureFormat::Rgba8);
        assert_eq!(scenario.textures[0].desc().mip_levels, 10);
        assert_eq!(scenario.textures[1].desc().mip_levels, 3);
        assert_eq!(scenario.frames[0].sample["rock"], Sample::Range([1, 4]));
        assert_eq!(scenario.frames[0].sample["grass"], Sample::Offscreen);
        assert_eq!(scenario.frames[1].sample["grass"], Sample::Feedback(vec![0, 1, 2]));
        assert_eq!(scenario.frames[2].remove, vec!["rock".to_string()]);
    }

    #[test]
    fn test_scenario_rejects_unknown_texture() {
        let err = Scenario::from_json(r#"{ "textures": [], "frames": [ { "release": ["ghost"] } ] }"#).unwrap_err();
        assert!(format!("{:#}", err).contains("unknown texture 'ghost'"));
    }

    #[test]
    fn test_demo_runs_clean() {
        let report = scenario::run(&Scenario::demo()).unwrap();

        assert_eq!(report.frames.len(), 6);
        assert_eq!(report.aliasing_violations, 0);
        // Zooming in maps more; the repeated frame changes nothing
        assert!(report.frames[2].residency.change.tiles_mapped > 0);
        assert!(report.frames[3].residency.change.is_noop());
        assert!(report.frames[4].released.tiles_unmapped > 0);
        assert_eq!(report.frames[5].removed, vec!["decal".to_string()]);
        assert!(!report.frames[5].mips_used.contains_key("decal"));
    }

    #[test]
    fn test_range_sample_drives_residency() {
        let scenario = Scenario::from_json(
            r#"{
                "pool": { "tiles_per_heap": 64 },
                "textures": [ { "name": "rock", "width": 512, "height": 512 } ],
                "frames": [ { "sample": { "rock": { "range": [1, 2] } } } ]
            }"#,
        )
        .unwrap();
        let report = scenario::run(&scenario).unwrap();

        let frame = &report.frames[0];
        assert_eq!(frame.mips_used["rock"].finest, 1);
        assert_eq!(frame.mips_used["rock"].coarsest, 2);
        // Mips 1..=2 (4 + 1 tiles) plus the packed tail
        assert_eq!(frame.residency.change.tiles_mapped, 6);
        assert_eq!(report.heaps, 1);
    }

    #[test]
    fn test_range_on_single_tile_texture() {
        let text = |range: &str| {
            format!(
                r#"{{
                    "textures": [ {{ "name": "chip", "width": 128, "height": 128 }} ],
                    "frames": [ {{ "sample": {{ "chip": {{ "range": {range} }} }} }} ]
                }}"#
            )
        };
        let chip = TextureSpec {
            name: "chip".to_string(),
            width: 128,
            height: 128,
            mip_levels: None,
            format: TextureFormat::Rgba8,
        };
        assert_eq!(chip.feedback_element_count().unwrap(), 1);

        let err = Scenario::from_json(&text("[0, 5]")).unwrap_err();
        assert!(format!("{:#}", err).contains("single feedback entry"));

        let report = scenario::run(&Scenario::from_json(&text("[0, 0]")).unwrap()).unwrap();
        assert_eq!(report.frames[0].mips_used["chip"].finest, 0);
        assert_eq!(report.frames[0].mips_used["chip"].coarsest, 0);
    }

    #[test]
    fn test_scenario_rejects_invalid_texture() {
        let err = Scenario::from_json(
            r#"{ "textures": [ { "name": "flat", "width": 0, "height": 64 } ] }"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid texture 'flat'"));
    }

    #[test]
    fn test_remove_before_release_fails() {
        let scenario = Scenario::from_json(
            r#"{
                "textures": [ { "name": "rock", "width": 512, "height": 512 } ],
                "frames": [ { "remove": ["rock"] } ]
            }"#,
        )
        .unwrap();
        let err = scenario::run(&scenario).unwrap_err();
        assert!(err.to_string().contains("must be released"));
    }
}
