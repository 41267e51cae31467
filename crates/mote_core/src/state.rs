//! Simulation semantics independent of any backend
//!
//! [`SimulationState`] owns the configuration, the generated system and the
//! bin grid, and turns them into the per-frame [`GpuOptions`] block.

use tracing::debug;

use crate::config::{validate_world, Parameter, SimulationConfig};
use crate::error::ConfigError;
use crate::generation::{ForceMatrix, SystemDescription};
use crate::grid::GridLayout;
use crate::types::{ForceEntry, GpuOptions};

/// Interactive impulse applied around a point for one frame
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Action {
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub force: f32,
    pub radius: f32,
}

/// What a parameter change requires of the buffers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterEffect {
    /// Picked up by the next options upload
    Options,
    /// The force table must be uploaded again
    Forces,
}

/// Species, forces and scalar parameters of one simulation
#[derive(Clone, Debug)]
pub struct SimulationState {
    config: SimulationConfig,
    system: SystemDescription,
    grid: GridLayout,
    action: Option<Action>,
}

impl SimulationState {
    /// Validate `config` and generate its system
    pub fn new(config: SimulationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let system = generate(&config)?;
        let grid = GridLayout::new(config.world_width, config.world_height);
        debug!(
            "state: {} particles, {} species, grid {}x{}",
            config.particle_count, config.species_count, grid.grid_width, grid.grid_height
        );
        Ok(Self {
            config,
            system,
            grid,
            action: None,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn system(&self) -> &SystemDescription {
        &self.system
    }

    pub fn grid(&self) -> &GridLayout {
        &self.grid
    }

    pub fn particle_count(&self) -> u32 {
        self.config.particle_count
    }

    pub fn species_count(&self) -> usize {
        self.config.species_count
    }

    pub fn action(&self) -> Option<Action> {
        self.action
    }

    pub fn set_action(&mut self, action: Option<Action>) {
        self.action = action;
    }

    /// Clamp a frame timestep; negative values become zero
    pub fn clamp_dt(&self, dt: f32) -> Result<f32, ConfigError> {
        if !dt.is_finite() {
            return Err(ConfigError::ParameterValue { name: "dt", value: dt });
        }
        Ok(dt.clamp(0.0, self.config.max_timestep))
    }

    /// Options block for a frame with an already clamped `dt`
    pub fn options(&self, dt: f32) -> GpuOptions {
        let action = self.action.unwrap_or_default();
        GpuOptions {
            left: self.grid.left(),
            right: self.grid.right(),
            bottom: self.grid.bottom(),
            top: self.grid.top(),
            friction: (-dt * self.config.friction).exp(),
            dt,
            bin_size_x: self.grid.bin_size_x,
            bin_size_y: self.grid.bin_size_y,
            grid_width: self.grid.grid_width,
            grid_height: self.grid.grid_height,
            species_count: self.config.species_count as u32,
            particle_count: self.config.particle_count,
            central_force: self.config.central_force,
            looping_borders: self.config.looping_borders as u32,
            action_x: action.x,
            action_y: action.y,
            action_vx: action.vx,
            action_vy: action.vy,
            action_force: action.force,
            action_radius: action.radius,
            seed: self.system.seed,
            ..GpuOptions::default()
        }
    }

    /// Force table as uploaded, with the strength multiplier applied
    pub fn force_table(&self) -> Vec<ForceEntry> {
        self.system.forces.scaled(self.config.force_strength)
    }

    /// Apply a parameter change
    pub fn set_parameter(
        &mut self,
        parameter: Parameter,
        value: f32,
    ) -> Result<ParameterEffect, ConfigError> {
        let value = parameter.check(value)?;
        let effect = match parameter {
            Parameter::Friction => {
                self.config.friction = value;
                ParameterEffect::Options
            }
            Parameter::Timestep => {
                self.config.max_timestep = value;
                ParameterEffect::Options
            }
            Parameter::CentralForce => {
                self.config.central_force = value;
                ParameterEffect::Options
            }
            Parameter::LoopingBorders => {
                self.config.looping_borders = value != 0.0;
                ParameterEffect::Options
            }
            Parameter::ForceStrength => {
                self.config.force_strength = value;
                ParameterEffect::Forces
            }
            Parameter::SymmetricForces => {
                self.config.symmetric_forces = value != 0.0;
                self.system = generate(&self.config)?;
                ParameterEffect::Forces
            }
        };
        debug!("parameter {} = {}", parameter, value);
        Ok(effect)
    }

    /// Replace the system with the one generated from `seed`
    pub fn regenerate(&mut self, seed: u32) -> Result<(), ConfigError> {
        self.config.seed = seed;
        self.system = generate(&self.config)?;
        Ok(())
    }

    /// Replace the force matrix; its shape must match the species count
    pub fn set_forces(&mut self, forces: ForceMatrix) -> Result<(), ConfigError> {
        if forces.species_count() != self.config.species_count {
            return Err(ConfigError::ForceMatrixShape {
                expected: self.config.species_count,
                actual: forces.species_count(),
            });
        }
        forces.validate()?;
        self.system.forces = forces;
        Ok(())
    }

    /// Change the world size; the grid follows
    pub fn resize(&mut self, width: f32, height: f32) -> Result<(), ConfigError> {
        validate_world(width, height)?;
        self.config.world_width = width;
        self.config.world_height = height;
        self.grid = GridLayout::new(width, height);
        Ok(())
    }
}

fn generate(config: &SimulationConfig) -> Result<SystemDescription, ConfigError> {
    SystemDescription::generate(
        config.seed,
        config.species_count,
        config.symmetric_forces,
        config.collision_scale,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SimulationState {
        SimulationState::new(SimulationConfig {
            particle_count: 1024,
            species_count: 3,
            world_width: 256.0,
            world_height: 256.0,
            seed: 42,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_options_block() {
        let state = state();
        let options = state.options(0.016);
        assert_eq!(options.left, -128.0);
        assert_eq!(options.top, 128.0);
        assert_eq!(options.grid_width, 8);
        assert_eq!(options.particle_count, 1024);
        assert!((options.friction - (-0.16f32).exp()).abs() < 1e-6);
        assert_eq!(options.action_force, 0.0);
    }

    #[test]
    fn test_dt_policy() {
        let state = state();
        assert_eq!(state.clamp_dt(1.0), Ok(0.025));
        assert_eq!(state.clamp_dt(-1.0), Ok(0.0));
        assert_eq!(state.clamp_dt(0.01), Ok(0.01));
        assert!(state.clamp_dt(f32::NAN).is_err());
    }

    #[test]
    fn test_timestep_parameter_moves_clamp() {
        let mut state = state();
        state.set_parameter(Parameter::Timestep, 0.005).unwrap();
        assert_eq!(state.clamp_dt(0.016), Ok(0.005));
    }

    #[test]
    fn test_symmetric_parameter_regenerates_same_seed() {
        let mut state = state();
        let effect = state.set_parameter(Parameter::SymmetricForces, 1.0).unwrap();
        assert_eq!(effect, ParameterEffect::Forces);

        let expected = SystemDescription::generate(42, 3, true, 2.0).unwrap();
        assert_eq!(state.system(), &expected);
    }

    #[test]
    fn test_force_strength_scales_upload() {
        let mut state = state();
        let before = state.force_table();
        state.set_parameter(Parameter::ForceStrength, 2.0).unwrap();
        let after = state.force_table();
        assert_eq!(after[0].strength, before[0].strength * 2.0);
        assert_eq!(after[0].radius, before[0].radius);
    }

    #[test]
    fn test_set_forces_checks_shape() {
        let mut state = state();
        let wrong = ForceMatrix::new(2).unwrap();
        assert!(matches!(
            state.set_forces(wrong),
            Err(ConfigError::ForceMatrixShape { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn test_resize_rebuilds_grid() {
        let mut state = state();
        state.resize(64.0, 512.0).unwrap();
        assert_eq!(state.grid().grid_width, 2);
        assert_eq!(state.grid().grid_height, 16);
        assert!(state.resize(0.0, 10.0).is_err());
        assert_eq!(state.grid().width, 64.0);
    }

    #[test]
    fn test_action_snapshot() {
        let mut state = state();
        state.set_action(Some(Action {
            x: 1.0,
            y: 2.0,
            vx: 3.0,
            vy: 4.0,
            force: 5.0,
            radius: 6.0,
        }));
        let options = state.options(0.01);
        assert_eq!((options.action_x, options.action_radius), (1.0, 6.0));
    }
}
