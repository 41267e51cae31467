//! Backend buffers of one simulation instance
//!
//! Everything is sized from the particle, species and bin counts at
//! creation and released together. A size change means a new store.

use bytemuck::Pod;
use tracing::debug;

use crate::backend::{BufferDescriptor, BufferUsages, ComputeBackend, UNIFORM_OFFSET_ALIGNMENT};
use crate::context::GpuContext;
use crate::error::{ConfigError, MoteError, Result};
use crate::generation::SpeciesTable;
use crate::grid::{prefix_passes, prefix_step};
use crate::handle::BufferHandle;
use crate::state::SimulationState;
use crate::types::{ForceEntry, GpuOptions, Particle, Species};

/// Buffers read and written by the frame stream
pub struct BufferStore {
    /// Particles as of the last completed frame
    pub particles: BufferHandle,
    /// Counting-sort destination
    pub scratch: BufferHandle,
    pub species: BufferHandle,
    pub forces: BufferHandle,
    pub options: BufferHandle,
    /// Ping-pong prefix-sum buffers; the scan starts and ends in `[0]`
    pub bin_offsets: [BufferHandle; 2],
    pub bin_cursor: BufferHandle,
    /// One step size per prefix pass, each in its own aligned slot
    pub prefix_steps: BufferHandle,

    particle_count: u32,
    species_count: usize,
    bin_count: u32,
    prefix_passes: u32,
}

impl BufferStore {
    /// Allocate every buffer for `state`
    pub fn create<B: ComputeBackend>(ctx: &mut GpuContext<B>, state: &SimulationState) -> Result<Self> {
        let particle_count = state.particle_count();
        let species_count = state.species_count();
        let bin_count = state.grid().bin_count();
        let passes = prefix_passes(bin_count);

        let particle_bytes = particle_count as u64 * std::mem::size_of::<Particle>() as u64;
        let offset_bytes = (bin_count as u64 + 1) * 4;

        let particles = ctx.create_buffer(&BufferDescriptor {
            label: "particles",
            size: particle_bytes,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })?;
        let scratch = ctx.create_buffer(&BufferDescriptor {
            label: "particles_sorted",
            size: particle_bytes,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })?;
        let species = ctx.create_buffer(&BufferDescriptor {
            label: "species",
            size: (species_count * std::mem::size_of::<Species>()) as u64,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })?;
        let forces = ctx.create_buffer(&BufferDescriptor {
            label: "forces",
            size: (species_count * species_count * std::mem::size_of::<ForceEntry>()) as u64,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })?;
        let options = ctx.create_buffer(&BufferDescriptor {
            label: "options",
            size: std::mem::size_of::<GpuOptions>() as u64,
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })?;
        let offsets_desc = |label| BufferDescriptor {
            label,
            size: offset_bytes,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        };
        let bin_offsets = [
            ctx.create_buffer(&offsets_desc("bin_offsets_a"))?,
            ctx.create_buffer(&offsets_desc("bin_offsets_b"))?,
        ];
        let bin_cursor = ctx.create_buffer(&BufferDescriptor {
            label: "bin_cursor",
            size: offset_bytes,
            usage: BufferUsages::STORAGE,
            mapped_at_creation: false,
        })?;
        let prefix_steps = ctx.create_buffer_init(
            "prefix_steps",
            BufferUsages::UNIFORM,
            &step_slots(passes),
        )?;

        debug!(
            "buffers: {} particles ({} bytes x2), {} bins, {} prefix passes",
            particle_count, particle_bytes, bin_count, passes
        );

        Ok(Self {
            particles,
            scratch,
            species,
            forces,
            options,
            bin_offsets,
            bin_cursor,
            prefix_steps,
            particle_count,
            species_count,
            bin_count,
            prefix_passes: passes,
        })
    }

    pub fn particle_count(&self) -> u32 {
        self.particle_count
    }

    pub fn bin_count(&self) -> u32 {
        self.bin_count
    }

    pub fn prefix_passes(&self) -> u32 {
        self.prefix_passes
    }

    // === Uploads ===

    pub fn upload_options<B: ComputeBackend>(&self, ctx: &mut GpuContext<B>, options: &GpuOptions) {
        ctx.write_buffer(self.options, 0, bytemuck::bytes_of(options));
    }

    pub fn upload_species<B: ComputeBackend>(&self, ctx: &mut GpuContext<B>, species: &SpeciesTable) {
        ctx.write_buffer(self.species, 0, bytemuck::cast_slice(species.as_slice()));
    }

    pub fn upload_forces<B: ComputeBackend>(&self, ctx: &mut GpuContext<B>, forces: &[ForceEntry]) {
        ctx.write_buffer(self.forces, 0, bytemuck::cast_slice(forces));
    }

    /// Overwrite every particle
    pub fn upload_particles<B: ComputeBackend>(
        &self,
        ctx: &mut GpuContext<B>,
        particles: &[Particle],
    ) -> Result<()> {
        if particles.len() != self.particle_count as usize {
            return Err(ConfigError::ParticleUpload {
                expected: self.particle_count as usize,
                actual: particles.len(),
            }
            .into());
        }
        ctx.write_buffer(self.particles, 0, bytemuck::cast_slice(particles));
        Ok(())
    }

    // === Readback ===

    /// Blocking copy of the current particles
    pub fn read_particles<B: ComputeBackend>(&self, ctx: &mut GpuContext<B>) -> Result<Vec<Particle>> {
        read_pod(ctx, self.particles, self.particle_count as usize)
    }

    /// Blocking copy of the bin offset table
    pub fn read_offsets<B: ComputeBackend>(&self, ctx: &mut GpuContext<B>) -> Result<Vec<u32>> {
        read_pod(ctx, self.bin_offsets[0], self.bin_count as usize + 1)
    }

    /// Whether this store already has the right sizes for `state`
    pub fn fits(&self, state: &SimulationState) -> bool {
        self.particle_count == state.particle_count()
            && self.species_count == state.species_count()
            && self.bin_count == state.grid().bin_count()
    }

    pub fn release<B: ComputeBackend>(self, ctx: &mut GpuContext<B>) {
        for buffer in [
            self.prefix_steps,
            self.bin_cursor,
            self.bin_offsets[1],
            self.bin_offsets[0],
            self.options,
            self.forces,
            self.species,
            self.scratch,
            self.particles,
        ] {
            ctx.release(buffer);
        }
    }
}

/// Step sizes `1, 2, 4, ...`, one per [`UNIFORM_OFFSET_ALIGNMENT`] slot
fn step_slots(passes: u32) -> Vec<u8> {
    let slot = UNIFORM_OFFSET_ALIGNMENT as usize;
    let mut bytes = vec![0u8; slot * passes.max(1) as usize];
    for pass in 0..passes {
        let start = pass as usize * slot;
        bytes[start..start + 4].copy_from_slice(&prefix_step(pass).to_le_bytes());
    }
    bytes
}

fn read_pod<T: Pod, B: ComputeBackend>(
    ctx: &mut GpuContext<B>,
    buffer: BufferHandle,
    count: usize,
) -> Result<Vec<T>> {
    let bytes = ctx.read_buffer(buffer)?;
    let stride = std::mem::size_of::<T>();
    if bytes.len() < count * stride {
        return Err(MoteError::Readback(format!(
            "{:?} returned {} bytes, expected {}",
            buffer,
            bytes.len(),
            count * stride
        )));
    }
    Ok(bytes
        .chunks_exact(stride)
        .take(count)
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::software::SoftwareBackend;

    fn state(particles: u32) -> SimulationState {
        SimulationState::new(SimulationConfig {
            particle_count: particles,
            species_count: 4,
            world_width: 256.0,
            world_height: 128.0,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_step_slots() {
        let bytes = step_slots(4);
        assert_eq!(bytes.len(), 1024);
        for pass in 0..4usize {
            let at = pass * 256;
            assert_eq!(&bytes[at..at + 4], &(1u32 << pass).to_le_bytes());
        }
        assert_eq!(step_slots(0).len(), 256);
    }

    #[test]
    fn test_upload_and_read_particles() {
        let mut ctx = GpuContext::new(SoftwareBackend::new()).unwrap();
        let store = BufferStore::create(&mut ctx, &state(3)).unwrap();
        let particles = [
            Particle::new(1.0, 2.0, 0),
            Particle::new(3.0, 4.0, 1).with_velocity(0.5, -0.5),
            Particle::new(5.0, 6.0, 3),
        ];
        store.upload_particles(&mut ctx, &particles).unwrap();
        assert_eq!(store.read_particles(&mut ctx).unwrap(), particles);

        assert!(matches!(
            store.upload_particles(&mut ctx, &particles[..2]),
            Err(MoteError::Config(ConfigError::ParticleUpload { expected: 3, actual: 2 }))
        ));
    }

    #[test]
    fn test_fits_and_release() {
        let mut ctx = GpuContext::new(SoftwareBackend::new()).unwrap();
        let store = BufferStore::create(&mut ctx, &state(10)).unwrap();
        assert!(store.fits(&state(10)));
        assert!(!store.fits(&state(11)));
        assert_eq!(store.bin_count(), 8 * 4);

        let live = ctx.live_count();
        store.release(&mut ctx);
        assert_eq!(ctx.live_count(), live - 9);
    }
}
