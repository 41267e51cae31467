//! End-to-end simulation behavior on the software backend

use mote_core::handle::{
    BindGroupHandle, BindGroupLayoutHandle, BufferHandle, CommandBufferHandle,
    CommandEncoderHandle, ComputePassHandle, ComputePipelineHandle, DeviceHandle,
    PipelineLayoutHandle, ShaderModuleHandle,
};
use mote_core::{
    BufferDescriptor, ComputeBackend, ConfigError, ForceEntry, ForceMatrix, MoteError, Particle,
    ParticleStats, RawHandle, Simulation, SimulationConfig, SoftwareBackend,
};

fn scenario_a(looping_borders: bool) -> SimulationConfig {
    SimulationConfig {
        seed: 42,
        particle_count: 1024,
        species_count: 3,
        world_width: 256.0,
        world_height: 256.0,
        friction: 10.0,
        looping_borders,
        ..Default::default()
    }
}

fn single_species(particle_count: u32, friction: f32) -> SimulationConfig {
    SimulationConfig {
        particle_count,
        species_count: 1,
        world_width: 256.0,
        world_height: 256.0,
        friction,
        ..Default::default()
    }
}

#[test]
fn test_particles_stay_in_bounds_in_both_border_modes() {
    for looping in [true, false] {
        let mut sim = Simulation::initialize(SoftwareBackend::new(), scenario_a(looping)).unwrap();
        sim.step_frame(0.016).unwrap();

        let particles = sim.read_particles().unwrap();
        assert_eq!(particles.len(), 1024);
        let stats = ParticleStats::from_particles(&particles, 3);
        assert!(stats.within(256.0, 256.0), "looping={}: {:?}", looping, stats.bounds);
    }
}

#[test]
fn test_attracting_pair_accelerates_together() {
    let mut sim = Simulation::initialize(SoftwareBackend::new(), single_species(2, 10.0)).unwrap();
    sim.set_force_matrix(ForceMatrix::uniform(1, ForceEntry::new(50.0, 10.0, 0.0, 1.0)).unwrap())
        .unwrap();
    sim.upload_particles(&[Particle::new(0.0, 0.0, 0), Particle::new(5.0, 0.0, 0)])
        .unwrap();
    sim.step_frame(0.01).unwrap();

    let mut particles = sim.read_particles().unwrap();
    particles.sort_by(|a, b| a.x.total_cmp(&b.x));
    let (left, right) = (particles[0], particles[1]);

    let (sx, sy) = (right.x - left.x, right.y - left.y);
    let relative = (right.vx - left.vx) * sx + (right.vy - left.vy) * sy;
    assert!(relative < 0.0, "relative velocity {}", relative);
    assert!(left.vx > 0.0 && right.vx < 0.0);
}

#[test]
fn test_same_seed_same_system() {
    let mut sim = Simulation::initialize(SoftwareBackend::new(), scenario_a(true)).unwrap();
    sim.regenerate(7).unwrap();
    let first = sim.state().system().clone();
    sim.regenerate(7).unwrap();
    let second = sim.state().system().clone();

    assert_eq!(first.species.as_slice(), second.species.as_slice());
    assert_eq!(first.forces.entries(), second.forces.entries());
}

#[test]
fn test_free_particle_moves_exactly() {
    let mut sim = Simulation::initialize(SoftwareBackend::new(), single_species(1, 0.0)).unwrap();
    sim.upload_particles(&[Particle::new(10.0, -20.0, 0).with_velocity(8.0, -8.0)])
        .unwrap();
    sim.step_frame(1.0 / 64.0).unwrap();

    let p = sim.read_particles().unwrap()[0];
    assert_eq!((p.x, p.y), (10.125, -20.125));
    assert_eq!((p.vx, p.vy), (8.0, -8.0));
}

#[test]
fn test_free_particle_wraps_across_the_border() {
    let mut sim = Simulation::initialize(SoftwareBackend::new(), single_species(1, 0.0)).unwrap();
    sim.upload_particles(&[Particle::new(127.9375, 0.0, 0).with_velocity(8.0, 0.0)])
        .unwrap();
    sim.step_frame(1.0 / 64.0).unwrap();

    let p = sim.read_particles().unwrap()[0];
    assert!((p.x - (-127.9375)).abs() < 1e-3, "x = {}", p.x);
    assert_eq!(p.vx, 8.0);
}

#[test]
fn test_reflecting_border_flips_velocity() {
    let mut config = single_species(1, 0.0);
    config.looping_borders = false;
    let mut sim = Simulation::initialize(SoftwareBackend::new(), config).unwrap();
    sim.upload_particles(&[Particle::new(127.9375, 0.0, 0).with_velocity(8.0, 0.0)])
        .unwrap();
    sim.step_frame(1.0 / 64.0).unwrap();

    let p = sim.read_particles().unwrap()[0];
    assert!(p.x <= 128.0);
    assert!(p.vx < 0.0);
}

#[test]
fn test_symmetric_forces() {
    let config = SimulationConfig {
        symmetric_forces: true,
        species_count: 5,
        particle_count: 64,
        ..Default::default()
    };
    let sim = Simulation::initialize(SoftwareBackend::new(), config).unwrap();
    let forces = &sim.state().system().forces;
    for a in 0..5 {
        for b in 0..5 {
            assert_eq!(forces.get(a, b), forces.get(b, a));
        }
    }
}

#[test]
fn test_particles_on_the_world_edge_are_binned() {
    let mut sim = Simulation::initialize(SoftwareBackend::new(), single_species(3, 0.0)).unwrap();
    sim.upload_particles(&[
        Particle::new(-128.0, -128.0, 0),
        Particle::new(128.0, 128.0, 0),
        Particle::new(0.0, 0.0, 0),
    ])
    .unwrap();
    sim.step_frame(0.0).unwrap();

    let offsets = sim.read_bin_offsets().unwrap();
    let bins = sim.stats().bin_count as usize;
    assert_eq!(offsets.len(), bins + 1);
    assert_eq!(offsets[0], 0);
    assert_eq!(offsets[bins], 3);
    // first and last bins each hold one corner particle
    assert_eq!(offsets[1] - offsets[0], 1);
    assert_eq!(offsets[bins] - offsets[bins - 1], 1);
    assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_invalid_parameter_values_are_rejected() {
    let mut sim = Simulation::initialize(SoftwareBackend::new(), scenario_a(true)).unwrap();
    assert!(matches!(
        sim.set_parameter_by_name("friction", -1.0),
        Err(MoteError::Config(ConfigError::ParameterValue { .. }))
    ));
    assert!(sim.set_parameter_by_name("timestep", f32::NAN).is_err());
    assert_eq!(sim.config().friction, 10.0);
}

// === Fault injection ===

/// Software backend that reports a failed dispatch on a chosen submit
struct Flaky {
    inner: SoftwareBackend,
    submits: u32,
    fail_on: u32,
    pending: u32,
}

impl Flaky {
    fn new(fail_on: u32) -> Self {
        Self {
            inner: SoftwareBackend::new(),
            submits: 0,
            fail_on,
            pending: 0,
        }
    }
}

impl ComputeBackend for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    fn request_device(&mut self) -> DeviceHandle {
        self.inner.request_device()
    }

    fn create_buffer(&mut self, device: DeviceHandle, desc: &BufferDescriptor<'_>) -> BufferHandle {
        self.inner.create_buffer(device, desc)
    }

    fn write_buffer(&mut self, device: DeviceHandle, buffer: BufferHandle, offset: u64, data: &[u8]) {
        self.inner.write_buffer(device, buffer, offset, data)
    }

    fn read_buffer(&mut self, device: DeviceHandle, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.inner.read_buffer(device, buffer)
    }

    fn create_shader_module(
        &mut self,
        device: DeviceHandle,
        label: &str,
        source: &str,
    ) -> ShaderModuleHandle {
        self.inner.create_shader_module(device, label, source)
    }

    fn create_bind_group_layout(
        &mut self,
        device: DeviceHandle,
        label: &str,
        entries: &[u8],
    ) -> BindGroupLayoutHandle {
        self.inner.create_bind_group_layout(device, label, entries)
    }

    fn create_bind_group(
        &mut self,
        device: DeviceHandle,
        label: &str,
        layout: BindGroupLayoutHandle,
        entries: &[u8],
    ) -> BindGroupHandle {
        self.inner.create_bind_group(device, label, layout, entries)
    }

    fn create_pipeline_layout(
        &mut self,
        device: DeviceHandle,
        label: &str,
        layouts: &[BindGroupLayoutHandle],
    ) -> PipelineLayoutHandle {
        self.inner.create_pipeline_layout(device, label, layouts)
    }

    fn create_compute_pipeline(
        &mut self,
        device: DeviceHandle,
        label: &str,
        layout: PipelineLayoutHandle,
        module: ShaderModuleHandle,
        entry_point: &str,
    ) -> ComputePipelineHandle {
        self.inner
            .create_compute_pipeline(device, label, layout, module, entry_point)
    }

    fn create_command_encoder(&mut self, device: DeviceHandle, label: &str) -> CommandEncoderHandle {
        self.inner.create_command_encoder(device, label)
    }

    fn begin_compute_pass(&mut self, encoder: CommandEncoderHandle, label: &str) -> ComputePassHandle {
        self.inner.begin_compute_pass(encoder, label)
    }

    fn set_pipeline(&mut self, pass: ComputePassHandle, pipeline: ComputePipelineHandle) {
        self.inner.set_pipeline(pass, pipeline)
    }

    fn set_bind_group(
        &mut self,
        pass: ComputePassHandle,
        index: u32,
        group: BindGroupHandle,
        dynamic_offsets: &[u32],
    ) {
        self.inner.set_bind_group(pass, index, group, dynamic_offsets)
    }

    fn dispatch(&mut self, pass: ComputePassHandle, x: u32, y: u32, z: u32) {
        self.inner.dispatch(pass, x, y, z)
    }

    fn end_pass(&mut self, pass: ComputePassHandle) {
        self.inner.end_pass(pass)
    }

    fn finish(&mut self, encoder: CommandEncoderHandle) -> CommandBufferHandle {
        self.inner.finish(encoder)
    }

    fn submit(&mut self, device: DeviceHandle, commands: CommandBufferHandle) {
        self.submits += 1;
        if self.submits == self.fail_on {
            self.pending += 1;
        }
        self.inner.submit(device, commands)
    }

    fn release(&mut self, handle: RawHandle) -> bool {
        self.inner.release(handle)
    }

    fn is_valid(&self, handle: RawHandle) -> bool {
        self.inner.is_valid(handle)
    }

    fn invalid_uses(&self) -> u64 {
        self.inner.invalid_uses()
    }

    fn take_faults(&mut self) -> u32 {
        self.inner.take_faults() + std::mem::take(&mut self.pending)
    }
}

#[test]
fn test_frame_fault_halts_until_regenerate() {
    // submit 1 generates particles, submit 2 is frame 0, submit 3 is frame 1
    let mut sim = Simulation::initialize(Flaky::new(3), scenario_a(true)).unwrap();
    sim.step_frame(0.01).unwrap();

    assert!(matches!(
        sim.step_frame(0.01),
        Err(MoteError::FrameFault { frame: 1, faults: 1 })
    ));
    assert!(sim.is_halted());
    assert!(matches!(sim.step_frame(0.01), Err(MoteError::Halted)));
    assert_eq!(sim.stats().frame, 1);

    sim.regenerate(42).unwrap();
    assert!(!sim.is_halted());
    sim.step_frame(0.01).unwrap();
    assert_eq!(sim.stats().frame, 2);
}

#[test]
fn test_reconfigure_clears_halt_and_resizes_buffers() {
    let mut sim = Simulation::initialize(Flaky::new(2), scenario_a(true)).unwrap();
    assert!(sim.step_frame(0.01).is_err());

    sim.reconfigure(SimulationConfig {
        particle_count: 300,
        ..scenario_a(false)
    })
    .unwrap();
    sim.step_frame(0.01).unwrap();
    assert_eq!(sim.read_particles().unwrap().len(), 300);

    let backend = sim.teardown();
    assert_eq!(backend.inner.live_objects(), 0);
}
