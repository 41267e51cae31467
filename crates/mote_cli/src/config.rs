//! Simulation configuration from a TOML file plus command-line overrides

use anyhow::{Context, Result};
use clap::Args;
use mote_core::SimulationConfig;
use std::fs;
use std::path::{Path, PathBuf};

/// Flags shared by every command that builds a simulation
#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// TOML file with `SimulationConfig` fields; missing fields take defaults
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of particles
    #[arg(short = 'n', long)]
    pub particles: Option<u32>,

    /// Number of species
    #[arg(short, long)]
    pub species: Option<usize>,

    /// Generation seed
    #[arg(long)]
    pub seed: Option<u32>,

    /// World width
    #[arg(long)]
    pub width: Option<f32>,

    /// World height
    #[arg(long)]
    pub height: Option<f32>,

    /// Velocity decay rate
    #[arg(long)]
    pub friction: Option<f32>,

    /// Reflect at the borders instead of wrapping
    #[arg(long)]
    pub reflect: bool,

    /// Make forces symmetric between species pairs
    #[arg(long)]
    pub symmetric: bool,
}

impl ConfigArgs {
    /// File (or defaults) with flags applied on top, validated
    pub fn resolve(&self) -> Result<SimulationConfig> {
        let mut config = match &self.config {
            Some(path) => load(path)?,
            None => SimulationConfig::default(),
        };

        if let Some(particles) = self.particles {
            config.particle_count = particles;
        }
        if let Some(species) = self.species {
            config.species_count = species;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(width) = self.width {
            config.world_width = width;
        }
        if let Some(height) = self.height {
            config.world_height = height;
        }
        if let Some(friction) = self.friction {
            config.friction = friction;
        }
        if self.reflect {
            config.looping_borders = false;
        }
        if self.symmetric {
            config.symmetric_forces = true;
        }

        config.validate().context("Invalid simulation configuration")?;
        Ok(config)
    }
}

pub fn load(path: &Path) -> Result<SimulationConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn parse(content: &str) -> Result<SimulationConfig> {
    Ok(toml::from_str(content)?)
}
