//! The frame driver
//!
//! [`Simulation`] is the only type most callers need. It owns the backend
//! context, the compiled kernels, the buffers and the simulation state, and
//! exposes the lifecycle: initialize, step, adjust, regenerate, resize,
//! tear down.
//!
//! A frame fault halts the simulation. Further steps return
//! [`MoteError::Halted`] until [`Simulation::regenerate`] or
//! [`Simulation::reconfigure`] rebuilds the particle state.

use serde::Serialize;
use tracing::{error, info};

use crate::backend::ComputeBackend;
use crate::config::{Parameter, SimulationConfig};
use crate::context::GpuContext;
use crate::error::{MoteError, Result};
use crate::generation::ForceMatrix;
use crate::pipelines::PipelineCatalog;
use crate::spatial::SpatialForcePipeline;
use crate::state::{Action, ParameterEffect, SimulationState};
use crate::types::Particle;

/// Counters describing the simulation so far
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FrameStats {
    /// Frames completed
    pub frame: u64,
    pub particle_count: u32,
    pub species_count: usize,
    pub bin_count: u32,
    pub grid_width: u32,
    pub grid_height: u32,
    pub prefix_passes: u32,
    /// Clamped timestep of the last completed frame
    pub last_dt: f32,
    pub halted: bool,
}

/// A particle life simulation on a compute backend
pub struct Simulation<B: ComputeBackend> {
    ctx: GpuContext<B>,
    catalog: PipelineCatalog,
    pipeline: SpatialForcePipeline,
    state: SimulationState,
    frame: u64,
    last_dt: f32,
    halted: bool,
    forces_dirty: bool,
}

impl<B: ComputeBackend> Simulation<B> {
    /// Validate `config`, build every backend object and generate particles
    ///
    /// Fails with a typed error and leaves nothing allocated on the backend
    /// if any step fails.
    pub fn initialize(backend: B, config: SimulationConfig) -> Result<Self> {
        let state = SimulationState::new(config)?;
        let mut ctx = GpuContext::new(backend)?;

        let catalog = PipelineCatalog::build(&mut ctx)?;
        let pipeline = match SpatialForcePipeline::new(&mut ctx, &catalog, &state) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                catalog.release(&mut ctx);
                return Err(e);
            }
        };

        let mut simulation = Self {
            ctx,
            catalog,
            pipeline,
            state,
            frame: 0,
            last_dt: 0.0,
            halted: false,
            forces_dirty: false,
        };
        simulation.populate()?;

        info!(
            "simulation initialized on {}: {} particles, {} species, seed {}",
            simulation.ctx.backend().name(),
            simulation.state.particle_count(),
            simulation.state.species_count(),
            simulation.state.config().seed
        );
        Ok(simulation)
    }

    // === Accessors ===

    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    pub fn config(&self) -> &SimulationConfig {
        self.state.config()
    }

    pub fn backend(&self) -> &B {
        self.ctx.backend()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn stats(&self) -> FrameStats {
        let grid = self.state.grid();
        FrameStats {
            frame: self.frame,
            particle_count: self.state.particle_count(),
            species_count: self.state.species_count(),
            bin_count: grid.bin_count(),
            grid_width: grid.grid_width,
            grid_height: grid.grid_height,
            prefix_passes: self.pipeline.buffers().prefix_passes(),
            last_dt: self.last_dt,
            halted: self.halted,
        }
    }

    // === Frame ===

    /// Advance the simulation by `dt` seconds, clamped to the maximum step
    pub fn step_frame(&mut self, dt: f32) -> Result<()> {
        if self.halted {
            return Err(MoteError::Halted);
        }
        let dt = self.state.clamp_dt(dt)?;
        if self.forces_dirty {
            self.pipeline.upload_tables(&mut self.ctx, &self.state);
            self.forces_dirty = false;
        }

        let options = self.state.options(dt);
        self.pipeline
            .encode_frame(&mut self.ctx, &self.catalog, &options)?;

        let faults = self.ctx.backend_mut().take_faults();
        if faults > 0 {
            self.halted = true;
            error!(
                "frame {} reported {} failed dispatch(es); simulation halted",
                self.frame, faults
            );
            return Err(MoteError::FrameFault {
                frame: self.frame,
                faults,
            });
        }

        self.frame += 1;
        self.last_dt = dt;
        Ok(())
    }

    // === Parameters ===

    pub fn set_parameter(&mut self, parameter: Parameter, value: f32) -> Result<()> {
        if self.state.set_parameter(parameter, value)? == ParameterEffect::Forces {
            self.forces_dirty = true;
        }
        Ok(())
    }

    /// [`Simulation::set_parameter`] addressed by key, e.g. `"friction"`
    pub fn set_parameter_by_name(&mut self, key: &str, value: f32) -> Result<()> {
        let parameter: Parameter = key.parse()?;
        self.set_parameter(parameter, value)
    }

    /// Interactive impulse for the following frames; `None` disables it
    pub fn set_action(&mut self, action: Option<Action>) {
        self.state.set_action(action);
    }

    /// Replace the force matrix; it must cover every species
    pub fn set_force_matrix(&mut self, forces: ForceMatrix) -> Result<()> {
        self.state.set_forces(forces)?;
        self.forces_dirty = true;
        Ok(())
    }

    // === Particles ===

    /// Blocking readback of every particle
    pub fn read_particles(&mut self) -> Result<Vec<Particle>> {
        self.pipeline.buffers().read_particles(&mut self.ctx)
    }

    /// Overwrite every particle
    pub fn upload_particles(&mut self, particles: &[Particle]) -> Result<()> {
        self.pipeline
            .buffers()
            .upload_particles(&mut self.ctx, particles)
    }

    /// Blocking readback of the bin offset table of the last frame
    pub fn read_bin_offsets(&mut self) -> Result<Vec<u32>> {
        self.pipeline.buffers().read_offsets(&mut self.ctx)
    }

    // === Lifecycle ===

    /// New species, forces and particles from `seed`; buffers are reused
    pub fn regenerate(&mut self, seed: u32) -> Result<()> {
        self.state.regenerate(seed)?;
        self.populate()?;
        self.halted = false;
        info!("regenerated with seed {}", seed);
        Ok(())
    }

    /// World size changed; rebuilds buffers and regenerates from the seed
    pub fn on_resize(&mut self, width: f32, height: f32) -> Result<()> {
        let mut next = self.state.clone();
        next.resize(width, height)?;
        self.rebuild(next)?;
        info!("resized to {}x{}", width, height);
        Ok(())
    }

    /// Replace the whole configuration
    pub fn reconfigure(&mut self, config: SimulationConfig) -> Result<()> {
        let next = SimulationState::new(config)?;
        self.rebuild(next)
    }

    /// Release every backend object and hand the backend back
    pub fn teardown(self) -> B {
        let Self {
            mut ctx,
            catalog,
            pipeline,
            ..
        } = self;
        pipeline.release(&mut ctx);
        catalog.release(&mut ctx);
        info!("simulation torn down");
        ctx.into_backend()
    }

    /// Swap in `next`, recreating buffers only when a size changed
    fn rebuild(&mut self, next: SimulationState) -> Result<()> {
        if !self.pipeline.buffers().fits(&next) {
            let pipeline = SpatialForcePipeline::new(&mut self.ctx, &self.catalog, &next)?;
            let old = std::mem::replace(&mut self.pipeline, pipeline);
            old.release(&mut self.ctx);
        }
        self.state = next;
        self.populate()?;
        self.halted = false;
        Ok(())
    }

    /// Upload tables and generate particles from the current seed
    fn populate(&mut self) -> Result<()> {
        self.pipeline.upload_tables(&mut self.ctx, &self.state);
        self.forces_dirty = false;
        self.pipeline
            .generate(&mut self.ctx, &self.catalog, &self.state.options(0.0))?;

        let faults = self.ctx.backend_mut().take_faults();
        if faults > 0 {
            return Err(MoteError::FrameFault {
                frame: self.frame,
                faults,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::SoftwareBackend;
    use crate::types::ForceEntry;

    fn small() -> SimulationConfig {
        SimulationConfig {
            particle_count: 200,
            species_count: 3,
            world_width: 128.0,
            world_height: 128.0,
            seed: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_initialize_rejects_bad_config_before_touching_backend() {
        let result = Simulation::initialize(
            SoftwareBackend::new(),
            SimulationConfig {
                species_count: 40,
                ..small()
            },
        );
        assert!(matches!(
            result,
            Err(MoteError::Config(crate::ConfigError::SpeciesCount { .. }))
        ));
    }

    #[test]
    fn test_step_counts_frames() {
        let mut sim = Simulation::initialize(SoftwareBackend::new(), small()).unwrap();
        sim.step_frame(0.016).unwrap();
        sim.step_frame(1.0).unwrap();
        let stats = sim.stats();
        assert_eq!(stats.frame, 2);
        assert_eq!(stats.last_dt, 0.025);
        assert_eq!(stats.bin_count, 16);
        assert!(!stats.halted);
    }

    #[test]
    fn test_non_finite_dt_is_rejected() {
        let mut sim = Simulation::initialize(SoftwareBackend::new(), small()).unwrap();
        assert!(sim.step_frame(f32::NAN).is_err());
        assert_eq!(sim.stats().frame, 0);
        assert!(!sim.is_halted());
    }

    #[test]
    fn test_unknown_parameter_name() {
        let mut sim = Simulation::initialize(SoftwareBackend::new(), small()).unwrap();
        assert!(sim.set_parameter_by_name("friction", 2.0).is_ok());
        assert!(matches!(
            sim.set_parameter_by_name("viscosity", 2.0),
            Err(MoteError::Config(crate::ConfigError::UnknownParameter(_)))
        ));
        assert_eq!(sim.config().friction, 2.0);
    }

    #[test]
    fn test_regenerate_is_reproducible() {
        let mut sim = Simulation::initialize(SoftwareBackend::new(), small()).unwrap();
        let first = sim.read_particles().unwrap();
        sim.step_frame(0.02).unwrap();
        sim.regenerate(3).unwrap();
        assert_eq!(sim.read_particles().unwrap(), first);

        sim.regenerate(4).unwrap();
        assert_ne!(sim.read_particles().unwrap(), first);
    }

    #[test]
    fn test_resize_rebuilds_and_keeps_particles_inside() {
        let mut sim = Simulation::initialize(SoftwareBackend::new(), small()).unwrap();
        sim.on_resize(400.0, 64.0).unwrap();
        assert_eq!(sim.stats().grid_width, 12);
        assert_eq!(sim.stats().grid_height, 2);
        for p in sim.read_particles().unwrap() {
            assert!(p.x.abs() <= 200.0 && p.y.abs() <= 32.0);
        }
        assert!(sim.on_resize(-1.0, 64.0).is_err());
        assert_eq!(sim.config().world_width, 400.0);
    }

    #[test]
    fn test_resize_reuses_buffers_only_while_the_bin_count_holds() {
        let mut sim = Simulation::initialize(SoftwareBackend::new(), small()).unwrap();

        // Regenerating runs the same upload and generate work as a rebuild
        let before = sim.backend().created_count();
        sim.regenerate(3).unwrap();
        let populate = sim.backend().created_count() - before;

        let before = sim.backend().created_count();
        sim.on_resize(150.0, 140.0).unwrap();
        assert_eq!(sim.stats().bin_count, 16);
        assert_eq!(sim.backend().created_count() - before, populate);
        for p in sim.read_particles().unwrap() {
            assert!(p.x.abs() <= 75.0 && p.y.abs() <= 70.0);
        }

        let before = sim.backend().created_count();
        sim.on_resize(400.0, 64.0).unwrap();
        assert!(sim.backend().created_count() - before > populate);
    }

    #[test]
    fn test_force_matrix_change_is_uploaded_on_next_frame() {
        let mut sim = Simulation::initialize(
            SoftwareBackend::new(),
            SimulationConfig {
                particle_count: 2,
                species_count: 1,
                friction: 0.0,
                ..small()
            },
        )
        .unwrap();
        sim.upload_particles(&[Particle::new(0.0, 0.0, 0), Particle::new(5.0, 0.0, 0)])
            .unwrap();
        sim.set_force_matrix(ForceMatrix::uniform(1, ForceEntry::new(0.0, 10.0, 0.0, 1.0)).unwrap())
            .unwrap();
        sim.step_frame(0.01).unwrap();
        for p in sim.read_particles().unwrap() {
            assert_eq!((p.vx, p.vy), (0.0, 0.0));
        }
    }

    #[test]
    fn test_teardown_releases_everything() {
        let mut sim = Simulation::initialize(SoftwareBackend::new(), small()).unwrap();
        sim.step_frame(0.01).unwrap();
        let backend = sim.teardown();
        assert_eq!(backend.live_objects(), 0);
        assert_eq!(backend.invalid_uses(), 0);
    }
}
