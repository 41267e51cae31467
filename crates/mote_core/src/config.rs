//! Simulation configuration and runtime parameters

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::generation::{DEFAULT_COLLISION_SCALE, MAX_SPECIES};
use crate::shaders::WORKGROUP_SIZE;

/// Largest particle count a single one-dimensional dispatch can cover
pub const MAX_PARTICLES: u32 = 65_535 * WORKGROUP_SIZE;

/// Everything a simulation instance is derived from
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub particle_count: u32,
    pub species_count: usize,
    pub world_width: f32,
    pub world_height: f32,
    pub seed: u32,
    pub symmetric_forces: bool,
    /// Velocity decay rate; the per-frame factor is `exp(-dt * friction)`
    pub friction: f32,
    pub central_force: f32,
    pub looping_borders: bool,
    /// Multiplier on every attraction strength
    pub force_strength: f32,
    /// Upper bound applied to the frame timestep
    pub max_timestep: f32,
    /// Collision strength as a multiple of `|strength|` in generated systems
    pub collision_scale: f32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            particle_count: 16_384,
            species_count: 8,
            world_width: 1024.0,
            world_height: 1024.0,
            seed: 0,
            symmetric_forces: false,
            friction: 10.0,
            central_force: 0.0,
            looping_borders: true,
            force_strength: 1.0,
            max_timestep: 0.025,
            collision_scale: DEFAULT_COLLISION_SCALE,
        }
    }
}

impl SimulationConfig {
    /// Reject anything the pipeline cannot be built for
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.species_count == 0 || self.species_count > MAX_SPECIES {
            return Err(ConfigError::SpeciesCount {
                count: self.species_count,
                max: MAX_SPECIES,
            });
        }
        if self.particle_count == 0 || self.particle_count > MAX_PARTICLES {
            return Err(ConfigError::ParticleCount {
                count: self.particle_count,
                max: MAX_PARTICLES,
            });
        }
        validate_world(self.world_width, self.world_height)?;

        check_value("friction", self.friction, |v| v >= 0.0)?;
        check_value("centralForce", self.central_force, |_| true)?;
        check_value("forceStrength", self.force_strength, |_| true)?;
        check_value("timestep", self.max_timestep, |v| v > 0.0)?;
        check_value("collisionScale", self.collision_scale, |v| v >= 0.0)?;
        Ok(())
    }
}

/// World dimensions must be positive and finite
pub fn validate_world(width: f32, height: f32) -> Result<(), ConfigError> {
    let ok = |v: f32| v.is_finite() && v > 0.0;
    if ok(width) && ok(height) {
        Ok(())
    } else {
        Err(ConfigError::WorldSize { width, height })
    }
}

fn check_value(
    name: &'static str,
    value: f32,
    accept: impl Fn(f32) -> bool,
) -> Result<(), ConfigError> {
    if value.is_finite() && accept(value) {
        Ok(())
    } else {
        Err(ConfigError::ParameterValue { name, value })
    }
}

/// Scalar parameters adjustable between frames
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Parameter {
    Friction,
    Timestep,
    ForceStrength,
    LoopingBorders,
    CentralForce,
    SymmetricForces,
}

impl Parameter {
    pub const ALL: [Parameter; 6] = [
        Parameter::Friction,
        Parameter::Timestep,
        Parameter::ForceStrength,
        Parameter::LoopingBorders,
        Parameter::CentralForce,
        Parameter::SymmetricForces,
    ];

    /// Key used by callers that address parameters by name
    pub fn key(self) -> &'static str {
        match self {
            Parameter::Friction => "friction",
            Parameter::Timestep => "timestep",
            Parameter::ForceStrength => "forceStrength",
            Parameter::LoopingBorders => "loopingBorders",
            Parameter::CentralForce => "centralForce",
            Parameter::SymmetricForces => "symmetricForces",
        }
    }

    /// Validate a value for this parameter
    pub(crate) fn check(self, value: f32) -> Result<f32, ConfigError> {
        let accept: fn(f32) -> bool = match self {
            Parameter::Friction => |v| v >= 0.0,
            Parameter::Timestep => |v| v > 0.0,
            _ => |_| true,
        };
        check_value(self.key(), value, accept)?;
        Ok(value)
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Parameter {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Parameter::ALL
            .into_iter()
            .find(|p| p.key() == s)
            .ok_or_else(|| ConfigError::UnknownParameter(s.to_string()))
    }
}
